//! Audio pipeline integration tests
//!
//! Runs the pipeline threads against fake 16 kHz hardware

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use beacon_device::PipelineState;
use beacon_device::audio::{
    AudioEvent, AudioStreamPacket, CAPTURE_SAMPLE_RATE, SoundClip, SoundFormat,
};

mod common;

use common::{
    FakeHardware, WakeWordTrigger, audio_service, generate_silence, test_config, tone_packet,
    wait_for,
};

#[tokio::test]
async fn test_push_without_wait_drops_when_full() {
    let mut config = test_config();
    config.audio.decode_queue_depth = 4;
    let (audio, _events) = audio_service(
        &config,
        Arc::new(FakeHardware::new()),
        WakeWordTrigger::default(),
    );

    for _ in 0..4 {
        assert!(audio.push_packet_to_decode_queue(tone_packet(), false));
    }
    assert!(!audio.push_packet_to_decode_queue(tone_packet(), false));

    let stats = audio.stats();
    assert_eq!(stats.decode_queue, 4);
    assert_eq!(stats.decode_dropped, 1);
}

#[tokio::test]
async fn test_push_with_wait_gives_up_after_timeout() {
    let mut config = test_config();
    config.audio.decode_queue_depth = 2;
    config.audio.decode_wait_timeout = Duration::from_millis(100);
    let (audio, _events) = audio_service(
        &config,
        Arc::new(FakeHardware::new()),
        WakeWordTrigger::default(),
    );

    assert!(audio.push_packet_to_decode_queue(tone_packet(), true));
    assert!(audio.push_packet_to_decode_queue(tone_packet(), true));

    let started = Instant::now();
    assert!(!audio.push_packet_to_decode_queue(tone_packet(), true));
    assert!(started.elapsed() >= Duration::from_millis(90));
    assert_eq!(audio.stats().decode_queue, 2);
}

#[tokio::test]
async fn test_prebuffering_waits_for_start_threshold() {
    let config = test_config();
    let hardware = Arc::new(FakeHardware::with_write_delay(Duration::from_millis(10)));
    let (audio, _events) = audio_service(&config, Arc::clone(&hardware), WakeWordTrigger::default());
    audio.start().unwrap();

    audio.start_prebuffering();
    for _ in 0..9 {
        assert!(audio.push_packet_to_decode_queue(tone_packet(), false));
    }
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(hardware.frames_written(), 0);
    assert_eq!(audio.pipeline_state(), PipelineState::Buffering);

    // The tenth frame releases the cushion
    assert!(audio.push_packet_to_decode_queue(tone_packet(), false));
    assert!(wait_for(Duration::from_secs(3), || hardware.frames_written() == 10).await);

    // Drained mid-stream: rebuffer until five frames are back
    assert!(
        wait_for(Duration::from_secs(1), || {
            audio.pipeline_state() == PipelineState::Rebuffering
        })
        .await
    );
    for _ in 0..4 {
        audio.push_packet_to_decode_queue(tone_packet(), false);
    }
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(hardware.frames_written(), 10);

    audio.push_packet_to_decode_queue(tone_packet(), false);
    assert!(wait_for(Duration::from_secs(3), || hardware.frames_written() == 15).await);

    audio.stop_prebuffering();
    assert!(wait_for(Duration::from_secs(1), || audio.is_idle()).await);
    audio.stop();
}

#[tokio::test]
async fn test_stop_prebuffering_plays_short_tail() {
    let config = test_config();
    let hardware = Arc::new(FakeHardware::new());
    let (audio, _events) = audio_service(&config, Arc::clone(&hardware), WakeWordTrigger::default());
    audio.start().unwrap();

    audio.start_prebuffering();
    for _ in 0..3 {
        audio.push_packet_to_decode_queue(tone_packet(), false);
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(hardware.frames_written(), 0);

    audio.stop_prebuffering();
    assert!(wait_for(Duration::from_secs(3), || hardware.frames_written() == 3).await);
    assert!(wait_for(Duration::from_secs(1), || audio.pipeline_state() == PipelineState::Idle).await);
    audio.stop();
}

#[tokio::test]
async fn test_idle_pipeline_plays_immediately() {
    let config = test_config();
    let hardware = Arc::new(FakeHardware::new());
    let (audio, _events) = audio_service(&config, Arc::clone(&hardware), WakeWordTrigger::default());
    audio.start().unwrap();

    assert_eq!(audio.pipeline_state(), PipelineState::Idle);
    audio.push_packet_to_decode_queue(tone_packet(), false);
    assert!(wait_for(Duration::from_secs(3), || hardware.frames_written() == 1).await);
    audio.stop();
}

#[tokio::test]
async fn test_playback_idle_notification() {
    let config = test_config();
    let hardware = Arc::new(FakeHardware::with_write_delay(Duration::from_millis(20)));
    let (audio, mut events) =
        audio_service(&config, Arc::clone(&hardware), WakeWordTrigger::default());

    // Nothing queued: already idle, nothing armed
    assert!(audio.request_playback_idle_notification());

    audio.start().unwrap();
    for _ in 0..5 {
        audio.push_packet_to_decode_queue(tone_packet(), false);
    }
    assert!(!audio.request_playback_idle_notification());

    let event = tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            match events.recv().await {
                Some(AudioEvent::PlaybackIdle) | None => break,
                Some(_) => {}
            }
        }
    })
    .await;
    assert!(event.is_ok());
    assert_eq!(hardware.frames_written(), 5);
    audio.stop();
}

#[tokio::test]
async fn test_reset_decoder_discards_downlink() {
    let config = test_config();
    let (audio, _events) = audio_service(
        &config,
        Arc::new(FakeHardware::new()),
        WakeWordTrigger::default(),
    );

    audio.start_prebuffering();
    for _ in 0..6 {
        audio.push_packet_to_decode_queue(tone_packet(), false);
    }
    audio.reset_decoder();

    let stats = audio.stats();
    assert_eq!(stats.decode_queue, 0);
    assert_eq!(stats.playback_queue, 0);
    assert_eq!(stats.state, PipelineState::Idle);
    assert!(audio.is_idle());
}

#[tokio::test]
async fn test_voice_processing_fills_send_queue() {
    let config = test_config();
    let (audio, mut events) = audio_service(
        &config,
        Arc::new(FakeHardware::new()),
        WakeWordTrigger::default(),
    );
    audio.start().unwrap();
    audio.enable_voice_processing(true);
    assert!(audio.is_audio_processor_running());

    let available = tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            match events.recv().await {
                Some(AudioEvent::SendQueueAvailable) | None => break,
                Some(_) => {}
            }
        }
    })
    .await;
    assert!(available.is_ok());

    let packet = audio.pop_packet_from_send_queue().unwrap();
    assert_eq!(packet.sample_rate, CAPTURE_SAMPLE_RATE);
    assert_eq!(packet.frame_duration_ms, 60);
    // PCM16: two bytes per sample
    assert_eq!(packet.payload.len(), config.audio.frame_samples() * 2);

    audio.enable_voice_processing(false);
    audio.stop();
}

#[tokio::test]
async fn test_wake_word_detection_reports_phrase() {
    let config = test_config();
    let trigger = WakeWordTrigger::default();
    let (audio, mut events) =
        audio_service(&config, Arc::new(FakeHardware::new()), trigger.clone());
    audio.start().unwrap();
    audio.enable_wake_word_detection(true);
    trigger.fire("hey beacon");

    let detected = tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            match events.recv().await {
                Some(AudioEvent::WakeWordDetected(word)) => break Some(word),
                None => break None,
                Some(_) => {}
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(detected.as_deref(), Some("hey beacon"));
    assert_eq!(audio.last_wake_word().as_deref(), Some("hey beacon"));
    audio.stop();
}

#[tokio::test]
async fn test_sound_clip_plays_every_frame() {
    let config = test_config();
    let hardware = Arc::new(FakeHardware::new());
    let (audio, _events) = audio_service(&config, Arc::clone(&hardware), WakeWordTrigger::default());
    audio.start().unwrap();

    // Two 60 ms frames of silence in the size-prefixed record format
    let frame: Vec<u8> = generate_silence(0.06)
        .iter()
        .flat_map(|s| s.to_le_bytes())
        .collect();
    let mut blob = Vec::new();
    for _ in 0..2 {
        blob.extend_from_slice(&u16::try_from(frame.len()).unwrap().to_be_bytes());
        blob.extend_from_slice(&frame);
    }
    let clip = SoundClip::parse("popup", &blob, SoundFormat::SizePrefixed).unwrap();
    assert_eq!(clip.frames.len(), 2);

    let player = Arc::clone(&audio);
    tokio::task::spawn_blocking(move || player.play_sound(&clip))
        .await
        .unwrap();
    assert!(wait_for(Duration::from_secs(3), || hardware.frames_written() == 2).await);
    audio.stop();
}

#[tokio::test]
async fn test_stop_clears_queues() {
    let config = test_config();
    let (audio, _events) = audio_service(
        &config,
        Arc::new(FakeHardware::new()),
        WakeWordTrigger::default(),
    );
    audio.start_prebuffering();
    for _ in 0..3 {
        let packet = AudioStreamPacket::new(CAPTURE_SAMPLE_RATE, 60, vec![0; 4]);
        audio.push_packet_to_decode_queue(packet, false);
    }
    audio.start().unwrap();
    assert!(audio.is_running());
    audio.stop();

    assert!(!audio.is_running());
    assert_eq!(audio.stats().decode_queue, 0);
}

#[tokio::test]
async fn test_playback_idle_after_undecodable_tail() {
    let config = test_config();
    let hardware = Arc::new(FakeHardware::new());
    let (audio, mut events) =
        audio_service(&config, Arc::clone(&hardware), WakeWordTrigger::default());

    // Odd-length PCM16 cannot be decoded
    let broken = AudioStreamPacket::new(CAPTURE_SAMPLE_RATE, 60, vec![1, 2, 3]);
    assert!(audio.push_packet_to_decode_queue(broken, false));
    assert!(!audio.request_playback_idle_notification());
    audio.start().unwrap();

    let idle = tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            match events.recv().await {
                Some(AudioEvent::PlaybackIdle) | None => break,
                Some(_) => {}
            }
        }
    })
    .await;
    assert!(idle.is_ok());
    assert_eq!(audio.stats().decode_errors, 1);
    assert_eq!(hardware.frames_written(), 0);
    audio.stop();
}

#[tokio::test]
async fn test_audio_testing_plays_recording_when_stopped() {
    let config = test_config();
    let hardware = Arc::new(FakeHardware::new());
    let (audio, _events) = audio_service(&config, Arc::clone(&hardware), WakeWordTrigger::default());
    audio.start().unwrap();

    audio.enable_audio_testing(true);
    assert!(audio.is_audio_testing());
    assert!(wait_for(Duration::from_secs(3), || audio.stats().test_queue >= 3).await);
    // Held back while recording
    assert_eq!(hardware.frames_written(), 0);

    audio.enable_audio_testing(false);
    assert!(!audio.is_audio_testing());
    assert!(audio.stats().test_queue <= 1);
    assert!(wait_for(Duration::from_secs(3), || hardware.frames_written() >= 3).await);
    audio.stop();
}

#[tokio::test]
async fn test_audio_testing_stops_when_recording_is_full() {
    let mut config = test_config();
    config.audio.test_max_duration = Duration::from_millis(300);
    assert_eq!(config.audio.test_queue_depth(), 5);
    let hardware = Arc::new(FakeHardware::new());
    let (audio, _events) = audio_service(&config, Arc::clone(&hardware), WakeWordTrigger::default());
    audio.start().unwrap();

    audio.enable_audio_testing(true);
    assert!(wait_for(Duration::from_secs(3), || !audio.is_audio_testing()).await);
    assert!(wait_for(Duration::from_secs(3), || hardware.frames_written() == 5).await);
    audio.stop();
}

#[tokio::test]
async fn test_capture_blocks_when_encode_queue_is_full() {
    let mut config = test_config();
    config.audio.send_queue_depth = 2;
    let hardware = Arc::new(FakeHardware::new());
    let (audio, _events) = audio_service(&config, Arc::clone(&hardware), WakeWordTrigger::default());
    audio.start().unwrap();
    audio.enable_voice_processing(true);

    // Nobody drains the send queue, so the codec stalls and capture backs up
    assert!(
        wait_for(Duration::from_secs(3), || {
            let stats = audio.stats();
            stats.send_queue == 2 && stats.encode_queue == 2
        })
        .await
    );
    // Let a read already in progress land, then capture must stay parked
    tokio::time::sleep(Duration::from_millis(200)).await;
    let reads = hardware.reads();
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(hardware.reads(), reads);

    let stats = audio.stats();
    assert_eq!(stats.encode_queue, 2);
    assert_eq!(stats.encoded, 2);
    assert_eq!(stats.send_dropped, 0);

    // Draining one packet lets one more frame through
    assert!(audio.pop_packet_from_send_queue().is_some());
    assert!(wait_for(Duration::from_secs(3), || audio.stats().encoded == 3).await);
    assert!(wait_for(Duration::from_secs(3), || hardware.reads() > reads).await);

    audio.enable_voice_processing(false);
    audio.stop();
}

#[tokio::test]
async fn test_played_timestamp_tags_next_uplink_frame() {
    let config = test_config();
    let (audio, _events) = audio_service(
        &config,
        Arc::new(FakeHardware::new()),
        WakeWordTrigger::default(),
    );
    audio.set_server_aec(true);
    audio.start().unwrap();
    audio.enable_voice_processing(true);

    let mut packet = tone_packet();
    packet.timestamp = 4242;
    assert!(audio.push_packet_to_decode_queue(packet, false));

    let seen = Mutex::new(Vec::new());
    let drain = || {
        let mut seen = seen.lock().unwrap();
        while let Some(packet) = audio.pop_packet_from_send_queue() {
            seen.push(packet.timestamp);
        }
        seen.contains(&4242)
    };
    assert!(wait_for(Duration::from_secs(3), &drain).await);

    // Consumed by exactly one frame
    tokio::time::sleep(Duration::from_millis(300)).await;
    drain();
    let tagged = seen.lock().unwrap().iter().filter(|t| **t == 4242).count();
    assert_eq!(tagged, 1);

    audio.enable_voice_processing(false);
    audio.stop();
}
