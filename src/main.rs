use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use beacon_device::audio::{
    AudioEvent, AudioHardware, AudioService, AudioStreamPacket, CAPTURE_SAMPLE_RATE,
    CpalHardware, EnergyWakeWord, PassthroughProcessor, SoundBank, calculate_rms, create_encoder,
    samples_to_wav,
};
use beacon_device::device::{HostBoard, Peripherals};
use beacon_device::{Application, Config, WebsocketProtocol};

/// Beacon device - voice assistant conversational core
#[derive(Parser)]
#[command(name = "beacon-device", version, about)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Config file (defaults to the platform config directory)
    #[arg(long, env = "BEACON_DEVICE_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Explicit tracing filter, overriding -v
    #[arg(long, global = true)]
    log_filter: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the device (default)
    Run,
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
        /// Write the recording to a WAV file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Test speaker output through the pipeline
    TestSpeaker,
    /// Play a sound asset through the pipeline
    PlaySound {
        /// Clip name (e.g. "popup")
        name: String,
    },
    /// Print the resolved configuration
    ShowConfig,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = cli.log_filter.clone().unwrap_or_else(|| {
        match cli.verbose {
            0 => "info,beacon_device=info",
            1 => "info,beacon_device=debug",
            2 => "debug",
            _ => "trace",
        }
        .to_string()
    });

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::load_with_options(cli.config.as_deref())?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run_device(config).await,
        Command::TestMic { duration, output } => test_mic(duration, output.as_deref()),
        Command::TestSpeaker => test_speaker(&config).await,
        Command::PlaySound { name } => play_sound(&config, &name).await,
        Command::ShowConfig => {
            println!("{config:#?}");
            Ok(())
        }
    }
}

/// Build the pipeline on the default audio devices
fn build_audio(
    config: &Config,
) -> anyhow::Result<(Arc<AudioService>, mpsc::UnboundedReceiver<AudioEvent>)> {
    let hardware: Arc<dyn AudioHardware> = Arc::new(CpalHardware::new()?);
    let (events_tx, events_rx) = mpsc::unbounded_channel();

    let wake_word = Box::new(EnergyWakeWord::new(config.audio.wake_words.clone()));
    let processor = Box::new(PassthroughProcessor::new(
        config.audio.frame_samples(),
        hardware.input_channels(),
    ));

    let audio = AudioService::new(config.audio.clone(), hardware, wake_word, processor, events_tx);
    Ok((Arc::new(audio), events_rx))
}

async fn run_device(config: Config) -> anyhow::Result<()> {
    tracing::info!(
        url = %config.websocket.url,
        codec = %config.audio.codec,
        version = config.websocket.version,
        "starting beacon device"
    );
    tracing::debug!(?config, "loaded configuration");

    let (audio, audio_events) = build_audio(&config)?;

    let (protocol_tx, protocol_events) = mpsc::unbounded_channel();
    let protocol = Arc::new(WebsocketProtocol::new(
        config.websocket.clone(),
        config.audio.codec,
        config.audio.frame_duration_ms,
        protocol_tx,
    ));

    let sounds = SoundBank::load_or_empty(config.sounds.dir.as_deref());
    let board = Arc::new(HostBoard::new());

    let mut app = Application::new(
        &config,
        Arc::clone(&audio),
        protocol,
        Peripherals::logging(Arc::clone(&board)),
        sounds,
        audio_events,
        protocol_events,
    );
    app.start().await?;
    audio.start()?;

    if let Some(wake_word) = config.audio.wake_words.first() {
        tracing::info!("beacon device ready - say \"{wake_word}\"");
    } else {
        tracing::info!("beacon device ready");
    }

    let handle = app.handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutting down");
            handle.shutdown();
        }
    });

    tokio::select! {
        () = app.run() => {}
        () = board.reboot_requested() => tracing::warn!("exiting for reboot"),
    }

    audio.stop();
    Ok(())
}

/// Test microphone input
fn test_mic(duration: u64, output: Option<&Path>) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let hardware = CpalHardware::new()?;
    hardware.enable_input(true);

    let rate = hardware.input_sample_rate();
    let channels = usize::from(hardware.input_channels().max(1));
    println!("Sample rate: {rate} Hz, channels: {channels}");
    println!("---");

    let mut recording = Vec::new();
    for i in 0..duration {
        let wanted = usize::try_from(rate)? * channels;
        let Some(samples) = hardware.read_input(wanted, Duration::from_secs(2))? else {
            anyhow::bail!("no input received within 2 seconds");
        };
        let mono: Vec<i16> = samples.iter().step_by(channels).copied().collect();

        let energy = calculate_rms(&mono);
        let peak = mono.iter().map(|s| s.unsigned_abs()).max().unwrap_or(0);

        // Visual meter
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let meter_len = (energy * 100.0).min(50.0) as usize;
        let meter: String = "█".repeat(meter_len) + &" ".repeat(50 - meter_len);

        println!("[{:2}s] RMS: {energy:.4} | Peak: {peak:5} | [{meter}]", i + 1);
        recording.extend(mono);
    }

    hardware.enable_input(false);

    if let Some(path) = output {
        std::fs::write(path, samples_to_wav(&recording, rate)?)?;
        println!("\nWrote {} samples to {}", recording.len(), path.display());
    }

    println!("\n---");
    println!("If you saw movement in the meter, your mic is working!");
    println!("If RMS stayed near 0, check:");
    println!("  1. Is your mic plugged in?");
    println!("  2. Run: pactl info | grep 'Default Source'");
    println!("  3. Run: arecord -l (to list devices)");

    Ok(())
}

/// Test speaker output with a sine wave pushed through the decode path
async fn test_speaker(config: &Config) -> anyhow::Result<()> {
    println!("Testing speaker output...");
    println!("You should hear a 440Hz tone for 2 seconds\n");

    let (audio, _events) = build_audio(config)?;
    audio.start()?;

    let frame_ms = config.audio.frame_duration_ms;
    let frame = config.audio.frame_samples();
    let mut encoder = create_encoder(config.audio.codec, CAPTURE_SAMPLE_RATE)?;

    // 2 seconds of 440Hz at 30% volume
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    let tone: Vec<i16> = (0..CAPTURE_SAMPLE_RATE * 2)
        .map(|i| {
            let t = i as f32 / CAPTURE_SAMPLE_RATE as f32;
            ((2.0 * std::f32::consts::PI * 440.0 * t).sin() * 0.3 * 32767.0) as i16
        })
        .collect();

    let feeder = Arc::clone(&audio);
    let packets = tone
        .chunks_exact(frame)
        .map(|chunk| encoder.encode(chunk))
        .collect::<beacon_device::Result<Vec<_>>>()?;
    println!("Playing {} frames at {CAPTURE_SAMPLE_RATE} Hz...", packets.len());
    tokio::task::spawn_blocking(move || {
        for payload in packets {
            let packet = AudioStreamPacket::new(CAPTURE_SAMPLE_RATE, frame_ms, payload);
            feeder.push_packet_to_decode_queue(packet, true);
        }
    })
    .await?;

    wait_for_idle(&audio, Duration::from_secs(5)).await;
    audio.stop();

    println!("\n---");
    println!("If you heard the tone, your speakers are working!");
    println!("If you didn't hear anything, check:");
    println!("  1. Run: pactl info | grep 'Default Sink'");
    println!("  2. Try: pavucontrol (to check output levels)");

    Ok(())
}

/// Play a named sound asset
async fn play_sound(config: &Config, name: &str) -> anyhow::Result<()> {
    let Some(dir) = config.sounds.dir.as_deref() else {
        anyhow::bail!("no sounds directory configured (set BEACON_DEVICE_SOUNDS_DIR)");
    };
    let sounds = SoundBank::load_dir(dir)?;
    let Some(clip) = sounds.get(name).cloned() else {
        anyhow::bail!("sound not found: {name} ({} clips in {})", sounds.len(), dir.display());
    };

    let (audio, _events) = build_audio(config)?;
    audio.start()?;

    println!("Playing {name} ({} frames)...", clip.frames.len());
    let player = Arc::clone(&audio);
    tokio::task::spawn_blocking(move || player.play_sound(&clip)).await?;

    wait_for_idle(&audio, Duration::from_secs(10)).await;
    audio.stop();
    Ok(())
}

async fn wait_for_idle(audio: &AudioService, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while !audio.is_idle() && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
