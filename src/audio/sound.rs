//! Sound effect clips
//!
//! A clip is a blob of back-to-back framed codec records at 16 kHz / 60 ms.
//! Files ending in `.p3` carry a 4-byte header per record (type, reserved,
//! u16 BE size); everything else uses a bare u16 BE size prefix.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::{Error, Result};

/// Record framing of a clip
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SoundFormat {
    /// `{u16 BE size, payload}`
    SizePrefixed,

    /// `{u8 type, u8 reserved, u16 BE size, payload}`
    P3,
}

impl SoundFormat {
    /// Pick the framing from a file name
    #[must_use]
    pub fn for_path(path: &Path) -> Self {
        if path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("p3"))
        {
            Self::P3
        } else {
            Self::SizePrefixed
        }
    }

    const fn header_len(self) -> usize {
        match self {
            Self::SizePrefixed => 2,
            Self::P3 => 4,
        }
    }
}

/// A parsed sound clip
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SoundClip {
    /// Clip name (file stem)
    pub name: String,

    /// Codec payloads, one per 60 ms frame
    pub frames: Vec<Vec<u8>>,
}

impl SoundClip {
    /// Parse a clip blob
    ///
    /// # Errors
    ///
    /// Returns error if a record header or payload is truncated
    pub fn parse(name: impl Into<String>, data: &[u8], format: SoundFormat) -> Result<Self> {
        let name = name.into();
        let header_len = format.header_len();
        let mut frames = Vec::new();
        let mut offset = 0;

        while offset < data.len() {
            let header = data.get(offset..offset + header_len).ok_or_else(|| {
                Error::Sound(format!("{name}: truncated record header at byte {offset}"))
            })?;
            let size = usize::from(u16::from_be_bytes([
                header[header_len - 2],
                header[header_len - 1],
            ]));
            offset += header_len;

            let payload = data.get(offset..offset + size).ok_or_else(|| {
                Error::Sound(format!(
                    "{name}: record of {size} bytes truncated at byte {offset}"
                ))
            })?;
            frames.push(payload.to_vec());
            offset += size;
        }

        Ok(Self { name, frames })
    }

    /// Load and parse a clip file
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or is malformed
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read(path)?;
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self::parse(name, &data, SoundFormat::for_path(path))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

/// Named sound clips loaded from a directory
#[derive(Debug, Clone, Default)]
pub struct SoundBank {
    dir: Option<PathBuf>,
    clips: HashMap<String, SoundClip>,
}

impl SoundBank {
    /// Load every clip in `dir`
    ///
    /// Malformed files are logged and skipped.
    ///
    /// # Errors
    ///
    /// Returns error if the directory cannot be read
    pub fn load_dir(dir: &Path) -> Result<Self> {
        let mut clips = HashMap::new();

        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }
            match SoundClip::load(&path) {
                Ok(clip) => {
                    tracing::debug!(name = %clip.name, frames = clip.frames.len(), "sound loaded");
                    clips.insert(clip.name.clone(), clip);
                }
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping sound"),
            }
        }

        Ok(Self {
            dir: Some(dir.to_path_buf()),
            clips,
        })
    }

    /// Load from an optional directory, falling back to an empty bank
    #[must_use]
    pub fn load_or_empty(dir: Option<&Path>) -> Self {
        let Some(dir) = dir else {
            return Self::default();
        };
        Self::load_dir(dir).unwrap_or_else(|e| {
            tracing::warn!(dir = %dir.display(), error = %e, "failed to load sounds");
            Self::default()
        })
    }

    pub fn insert(&mut self, clip: SoundClip) {
        self.clips.insert(clip.name.clone(), clip);
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&SoundClip> {
        self.clips.get(name)
    }

    #[must_use]
    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.clips.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clips.is_empty()
    }
}

/// Well-known clip names
pub mod names {
    pub const POPUP: &str = "popup";
    pub const EXCLAMATION: &str = "exclamation";
    pub const VIBRATION: &str = "vibration";
    pub const SUCCESS: &str = "success";
    pub const AEC_ON: &str = "aec_on";
    pub const AEC_OFF: &str = "aec_off";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size_prefixed() {
        let data = [0, 2, 0xAA, 0xBB, 0, 1, 0xCC];
        let clip = SoundClip::parse("popup", &data, SoundFormat::SizePrefixed).unwrap();
        assert_eq!(clip.frames, vec![vec![0xAA, 0xBB], vec![0xCC]]);
    }

    #[test]
    fn test_parse_p3() {
        let data = [0, 0, 0, 3, 1, 2, 3];
        let clip = SoundClip::parse("success", &data, SoundFormat::P3).unwrap();
        assert_eq!(clip.frames, vec![vec![1, 2, 3]]);
    }

    #[test]
    fn test_truncated_payload_is_error() {
        let data = [0, 4, 1, 2];
        assert!(matches!(
            SoundClip::parse("bad", &data, SoundFormat::SizePrefixed),
            Err(Error::Sound(_))
        ));
    }

    #[test]
    fn test_truncated_header_is_error() {
        let data = [0, 1, 9, 0];
        assert!(SoundClip::parse("bad", &data, SoundFormat::SizePrefixed).is_err());
    }

    #[test]
    fn test_format_from_extension() {
        assert_eq!(SoundFormat::for_path(Path::new("a/popup.P3")), SoundFormat::P3);
        assert_eq!(
            SoundFormat::for_path(Path::new("a/popup.snd")),
            SoundFormat::SizePrefixed
        );
    }
}
