//! WebSocket transport tests against an in-process server

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_test::{assert_err, assert_ok};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::protocol::Message;

use beacon_device::audio::{AudioStreamPacket, CodecKind};
use beacon_device::config::WebsocketConfig;
use beacon_device::protocol::{AbortReason, ServerMessage, TtsState};
use beacon_device::{ListeningMode, Protocol, ProtocolEvent, WebsocketProtocol};

const SERVER_HELLO: &str = r#"{"type":"hello","transport":"websocket","session_id":"sess-1","audio_params":{"sample_rate":24000,"frame_duration":60}}"#;

/// Behaviour of the test server after the handshake
#[derive(Clone, Copy)]
enum Script {
    /// Reply to the hello and push the start of a turn
    Converse,
    /// Never answer the hello
    Silent,
    /// Reply to the hello, then drop the connection
    HangUp,
}

/// Accept one connection and run `script`; client text frames are forwarded
/// to the returned receiver
async fn serve(script: Script) -> (String, mpsc::UnboundedReceiver<Value>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/device/", listener.local_addr().unwrap());
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();

        while let Some(Ok(message)) = ws.next().await {
            match message {
                Message::Text(text) => {
                    let value: Value = serde_json::from_str(text.as_str()).unwrap();
                    let is_hello = value["type"] == "hello";
                    let _ = tx.send(value);
                    if !is_hello {
                        continue;
                    }
                    match script {
                        Script::Silent => {}
                        Script::HangUp => {
                            ws.send(Message::text(SERVER_HELLO)).await.unwrap();
                            let _ = ws.close(None).await;
                            return;
                        }
                        Script::Converse => {
                            ws.send(Message::text(SERVER_HELLO)).await.unwrap();
                            ws.send(Message::text(r#"{"type":"tts","state":"start"}"#))
                                .await
                                .unwrap();
                            ws.send(Message::binary(vec![1u8, 2, 3, 4])).await.unwrap();
                            ws.send(Message::text(r#"{"type":"stt","text":"hello there"}"#))
                                .await
                                .unwrap();
                        }
                    }
                }
                Message::Close(_) => return,
                _ => {}
            }
        }
    });

    (url, rx)
}

fn protocol(
    url: String,
    hello_timeout: Duration,
) -> (WebsocketProtocol, mpsc::UnboundedReceiver<ProtocolEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let config = WebsocketConfig {
        url,
        version: 1,
        hello_timeout,
        ..WebsocketConfig::default()
    };
    (WebsocketProtocol::new(config, CodecKind::Pcm16, 60, tx), rx)
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<ProtocolEvent>) -> ProtocolEvent {
    tokio::time::timeout(Duration::from_secs(3), rx.recv())
        .await
        .unwrap()
        .unwrap()
}

async fn next_sent(rx: &mut mpsc::UnboundedReceiver<Value>) -> Value {
    tokio::time::timeout(Duration::from_secs(3), rx.recv())
        .await
        .unwrap()
        .unwrap()
}

#[tokio::test]
async fn test_open_exchanges_hello() {
    let (url, mut sent) = serve(Script::Converse).await;
    let (protocol, mut events) = protocol(url, Duration::from_secs(3));

    assert_ok!(protocol.open_audio_channel().await);
    assert!(protocol.is_audio_channel_open());
    assert_eq!(protocol.session_id(), "sess-1");
    assert_eq!(protocol.server_sample_rate(), 24_000);
    assert_eq!(protocol.server_frame_duration(), 60);

    let hello = next_sent(&mut sent).await;
    assert_eq!(hello["type"], "hello");
    assert_eq!(hello["transport"], "websocket");
    assert_eq!(hello["audio_params"]["frame_duration"], 60);

    // The opened notice may interleave with the server's first messages
    let mut seen = Vec::new();
    let mut opened = false;
    while seen.len() < 3 {
        match next_event(&mut events).await {
            ProtocolEvent::AudioChannelOpened => opened = true,
            event => seen.push(event),
        }
    }
    assert!(matches!(
        seen[0],
        ProtocolEvent::IncomingJson(ServerMessage::Tts { state: TtsState::Start, .. })
    ));
    let ProtocolEvent::IncomingAudio(packet) = &seen[1] else {
        panic!("expected audio, got {:?}", seen[1]);
    };
    assert_eq!(packet.payload, vec![1, 2, 3, 4]);
    assert_eq!(packet.sample_rate, 24_000);
    assert_eq!(
        seen[2],
        ProtocolEvent::IncomingJson(ServerMessage::Stt {
            text: "hello there".to_string()
        })
    );
    if !opened {
        assert_eq!(next_event(&mut events).await, ProtocolEvent::AudioChannelOpened);
    }

    protocol.close_audio_channel().await;
    assert!(!protocol.is_audio_channel_open());
}

#[tokio::test]
async fn test_control_messages_carry_session() {
    let (url, mut sent) = serve(Script::Converse).await;
    let (protocol, _events) = protocol(url, Duration::from_secs(3));
    protocol.open_audio_channel().await.unwrap();
    let _hello = next_sent(&mut sent).await;

    protocol.send_wake_word_detected("hi").await.unwrap();
    protocol
        .send_start_listening(ListeningMode::Realtime)
        .await
        .unwrap();
    protocol
        .send_abort_speaking(AbortReason::WakeWordDetected)
        .await
        .unwrap();
    protocol.send_stop_listening().await.unwrap();

    let detect = next_sent(&mut sent).await;
    assert_eq!(detect["type"], "listen");
    assert_eq!(detect["state"], "detect");
    assert_eq!(detect["text"], "hi");
    assert_eq!(detect["session_id"], "sess-1");

    let start = next_sent(&mut sent).await;
    assert_eq!(start["state"], "start");
    assert_eq!(start["mode"], "realtime");

    let abort = next_sent(&mut sent).await;
    assert_eq!(abort["type"], "abort");
    assert_eq!(abort["reason"], "wake_word_detected");

    let stop = next_sent(&mut sent).await;
    assert_eq!(stop["state"], "stop");
    assert!(stop.get("mode").is_none());

    protocol.close_audio_channel().await;
}

#[tokio::test]
async fn test_send_audio_only_while_open() {
    let (url, _sent) = serve(Script::Converse).await;
    let (protocol, _events) = protocol(url, Duration::from_secs(3));

    let packet = AudioStreamPacket::new(16_000, 60, vec![0; 8]);
    assert!(!protocol.send_audio(packet.clone()).await);

    protocol.open_audio_channel().await.unwrap();
    assert!(protocol.send_audio(packet.clone()).await);

    protocol.close_audio_channel().await;
    assert!(!protocol.send_audio(packet).await);
}

#[tokio::test]
async fn test_missing_server_hello_fails_open() {
    let (url, _sent) = serve(Script::Silent).await;
    let (protocol, mut events) = protocol(url, Duration::from_millis(200));

    let err = assert_err!(protocol.open_audio_channel().await);
    assert!(err.to_string().contains("hello timed out"));
    assert!(!protocol.is_audio_channel_open());

    // A failed open is reported through the result only
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_unreachable_server_fails_open() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/device/", listener.local_addr().unwrap());
    drop(listener);

    let (protocol, _events) = protocol(url, Duration::from_secs(2));
    let err = assert_err!(protocol.open_audio_channel().await);
    assert!(matches!(err, beacon_device::Error::Channel(_)));
}

#[tokio::test]
async fn test_server_hangup_reports_closed() {
    let (url, _sent) = serve(Script::HangUp).await;
    let (protocol, mut events) = protocol(url, Duration::from_secs(3));

    protocol.open_audio_channel().await.unwrap();

    let mut closed = false;
    for _ in 0..4 {
        if next_event(&mut events).await == ProtocolEvent::AudioChannelClosed {
            closed = true;
            break;
        }
    }
    assert!(closed);
    assert!(!protocol.is_audio_channel_open());
}
