//! WebSocket transport for the speech service

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::client::generate_key;
use tokio_tungstenite::tungstenite::http::{Request, Uri};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::connect_async;

use super::frame::{self, InboundFrame};
use super::message::{ClientHello, ServerHello, ServerMessage, TtsState};
use super::{DEFAULT_SERVER_FRAME_DURATION, DEFAULT_SERVER_SAMPLE_RATE, Protocol, ProtocolEvent};
use crate::audio::{AudioStreamPacket, CodecKind};
use crate::config::WebsocketConfig;
use crate::{Error, Result};

/// Session details learned from the server hello
#[derive(Debug, Clone)]
struct Session {
    id: String,
    sample_rate: u32,
    frame_duration: u32,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            id: String::new(),
            sample_rate: DEFAULT_SERVER_SAMPLE_RATE,
            frame_duration: DEFAULT_SERVER_FRAME_DURATION,
        }
    }
}

/// State shared with the connection task
#[derive(Debug)]
struct LinkState {
    session: Mutex<Session>,
    connected: AtomicBool,
    error: AtomicBool,
    streaming: AtomicBool,
    last_incoming: Mutex<Instant>,
}

impl LinkState {
    fn touch(&self) {
        if let Ok(mut last) = self.last_incoming.lock() {
            *last = Instant::now();
        }
    }

    fn session(&self) -> Session {
        self.session.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

/// An open connection
struct Link {
    outbound: mpsc::UnboundedSender<Message>,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Text payload of version 3 ASR/LLM frames
#[derive(Debug, Deserialize)]
struct TextPayload {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    is_final: bool,
}

/// Speech service connection over WebSocket
pub struct WebsocketProtocol {
    config: WebsocketConfig,
    codec: CodecKind,
    frame_duration: u32,
    server_aec: AtomicBool,
    events: mpsc::UnboundedSender<ProtocolEvent>,
    link: Mutex<Option<Link>>,
    state: Arc<LinkState>,
}

impl WebsocketProtocol {
    /// Create a transport; nothing connects until the audio channel opens
    #[must_use]
    pub fn new(
        config: WebsocketConfig,
        codec: CodecKind,
        frame_duration: u32,
        events: mpsc::UnboundedSender<ProtocolEvent>,
    ) -> Self {
        Self {
            config,
            codec,
            frame_duration,
            server_aec: AtomicBool::new(false),
            events,
            link: Mutex::new(None),
            state: Arc::new(LinkState {
                session: Mutex::new(Session::default()),
                connected: AtomicBool::new(false),
                error: AtomicBool::new(false),
                streaming: AtomicBool::new(false),
                last_incoming: Mutex::new(Instant::now()),
            }),
        }
    }

    fn build_request(&self) -> Result<Request<()>> {
        let uri: Uri = self
            .config
            .url
            .parse()
            .map_err(|e| Error::Config(format!("invalid websocket url: {e}")))?;
        let host = uri
            .authority()
            .map(|a| a.as_str().to_string())
            .ok_or_else(|| Error::Config(format!("websocket url has no host: {}", self.config.url)))?;

        let mut builder = Request::builder()
            .method("GET")
            .uri(uri)
            .header("Host", host)
            .header("Upgrade", "websocket")
            .header("Connection", "upgrade")
            .header("Sec-WebSocket-Key", generate_key())
            .header("Sec-WebSocket-Version", "13")
            .header("Protocol-Version", self.config.version.to_string())
            .header("Device-Id", self.config.device_id.as_str())
            .header("Client-Id", self.config.client_id.as_str());

        if let Some(token) = self.config.token.as_deref().filter(|t| !t.is_empty()) {
            builder = builder.header("Authorization", authorization_value(token));
        }

        builder
            .body(())
            .map_err(|e| Error::Protocol(format!("failed to build request: {e}")))
    }

    fn take_link(&self) -> Option<Link> {
        self.link.lock().ok().and_then(|mut link| link.take())
    }

    fn outbound(&self) -> Option<mpsc::UnboundedSender<Message>> {
        self.link
            .lock()
            .ok()
            .and_then(|link| link.as_ref().map(|l| l.outbound.clone()))
    }

    async fn shutdown_link(&self) {
        self.state.connected.store(false, Ordering::Release);
        self.state.streaming.store(false, Ordering::Release);
        if let Some(link) = self.take_link() {
            let _ = link.shutdown.send(());
            let _ = link.task.await;
        }
    }
}

/// `Bearer ` prefix unless the token already names a scheme
fn authorization_value(token: &str) -> String {
    if token.contains(' ') {
        token.to_string()
    } else {
        format!("Bearer {token}")
    }
}

#[async_trait]
impl Protocol for WebsocketProtocol {
    async fn start(&self) -> Result<()> {
        // Connect lazily when the audio channel is needed
        Ok(())
    }

    async fn open_audio_channel(&self) -> Result<()> {
        self.shutdown_link().await;

        self.state.error.store(false, Ordering::Release);
        self.state.touch();

        let request = self.build_request()?;
        tracing::info!(url = %self.config.url, version = self.config.version, "connecting to speech service");

        let (ws_stream, _) = tokio::time::timeout(self.config.hello_timeout, connect_async(request))
            .await
            .map_err(|_| Error::Channel("server connection timed out".to_string()))?
            .map_err(|e| Error::Channel(format!("server not connected: {e}")))?;

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (hello_tx, hello_rx) = oneshot::channel();

        self.state.connected.store(true, Ordering::Release);
        let task = tokio::spawn(run_link(
            ws_stream,
            out_rx,
            shutdown_rx,
            hello_tx,
            Arc::clone(&self.state),
            self.events.clone(),
            self.config.version,
            self.config.heartbeat_interval,
        ));

        if let Ok(mut link) = self.link.lock() {
            *link = Some(Link {
                outbound: out_tx.clone(),
                shutdown: shutdown_tx,
                task,
            });
        }

        let hello = ClientHello::new(
            self.config.version,
            self.codec,
            self.server_aec.load(Ordering::Relaxed),
            self.frame_duration,
        )
        .to_json()?;
        tracing::debug!(hello = %hello, "sending client hello");
        if out_tx.send(Message::Text(hello.into())).is_err() {
            self.shutdown_link().await;
            return Err(Error::Channel("failed to send client hello".to_string()));
        }

        match tokio::time::timeout(self.config.hello_timeout, hello_rx).await {
            Ok(Ok(())) => {}
            _ => {
                self.shutdown_link().await;
                return Err(Error::Channel("server hello timed out".to_string()));
            }
        }

        let session = self.state.session();
        tracing::info!(
            session_id = %session.id,
            sample_rate = session.sample_rate,
            frame_duration = session.frame_duration,
            "audio channel opened"
        );
        let _ = self.events.send(ProtocolEvent::AudioChannelOpened);
        Ok(())
    }

    async fn close_audio_channel(&self) {
        self.shutdown_link().await;
        tracing::debug!("audio channel closed by device");
    }

    fn is_audio_channel_open(&self) -> bool {
        let timed_out = self
            .state
            .last_incoming
            .lock()
            .map(|last| last.elapsed() > self.config.channel_timeout)
            .unwrap_or(true);
        self.state.connected.load(Ordering::Acquire)
            && !self.state.error.load(Ordering::Acquire)
            && !timed_out
    }

    async fn send_audio(&self, packet: AudioStreamPacket) -> bool {
        if !self.state.connected.load(Ordering::Acquire) {
            return false;
        }
        let Some(outbound) = self.outbound() else {
            return false;
        };
        let bytes = match frame::encode_audio(self.config.version, &packet) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(error = %e, "dropping unframeable audio packet");
                return false;
            }
        };
        outbound.send(Message::Binary(bytes.into())).is_ok()
    }

    async fn send_text(&self, text: String) -> Result<()> {
        let outbound = self
            .outbound()
            .filter(|_| self.state.connected.load(Ordering::Acquire))
            .ok_or_else(|| Error::Channel("audio channel is not open".to_string()))?;

        if outbound.send(Message::Text(text.into())).is_err() {
            tracing::error!("failed to send text");
            self.state.error.store(true, Ordering::Release);
            let _ = self
                .events
                .send(ProtocolEvent::NetworkError("server error".to_string()));
            return Err(Error::Channel("failed to send text".to_string()));
        }
        Ok(())
    }

    fn session_id(&self) -> String {
        self.state.session().id
    }

    fn server_sample_rate(&self) -> u32 {
        self.state.session().sample_rate
    }

    fn server_frame_duration(&self) -> u32 {
        self.state.session().frame_duration
    }

    fn set_server_aec(&self, enable: bool) {
        self.server_aec.store(enable, Ordering::Relaxed);
    }
}

/// Connection task: pumps outbound frames, dispatches inbound ones and keeps
/// the NAT mapping alive with pings
#[allow(clippy::too_many_arguments)]
async fn run_link<S>(
    ws_stream: S,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    mut shutdown: oneshot::Receiver<()>,
    hello_tx: oneshot::Sender<()>,
    state: Arc<LinkState>,
    events: mpsc::UnboundedSender<ProtocolEvent>,
    version: u8,
    heartbeat: Duration,
) where
    S: futures::Stream<Item = std::result::Result<Message, tokio_tungstenite::tungstenite::Error>>
        + futures::Sink<Message, Error = tokio_tungstenite::tungstenite::Error>
        + Send
        + Unpin,
{
    let (mut sink, mut stream) = ws_stream.split();
    let mut hello_tx = Some(hello_tx);
    let mut ping = tokio::time::interval_at(tokio::time::Instant::now() + heartbeat, heartbeat);

    let closed_by_peer = loop {
        tokio::select! {
            _ = &mut shutdown => {
                let _ = sink.send(Message::Close(None)).await;
                break false;
            }

            Some(message) = outbound.recv() => {
                if let Err(e) = sink.send(message).await {
                    tracing::error!(error = %e, "failed to send websocket message");
                    break true;
                }
            }

            message = stream.next() => {
                match message {
                    Some(Ok(message)) => {
                        if !handle_message(message, &state, &events, version, &mut hello_tx) {
                            break true;
                        }
                    }
                    Some(Err(e)) => {
                        tracing::error!(error = %e, "websocket error");
                        break true;
                    }
                    None => {
                        tracing::info!("websocket stream ended");
                        break true;
                    }
                }
            }

            _ = ping.tick() => {
                // Pings can stall the downlink on some links; skip while streaming
                if state.streaming.load(Ordering::Acquire) {
                    tracing::debug!("skipping heartbeat during audio streaming");
                } else if let Err(e) = sink.send(Message::Ping(Vec::new().into())).await {
                    tracing::warn!(error = %e, "failed to send heartbeat");
                    break true;
                }
            }
        }
    };

    state.connected.store(false, Ordering::Release);
    state.streaming.store(false, Ordering::Release);

    if closed_by_peer {
        tracing::warn!("websocket disconnected");
        let _ = events.send(ProtocolEvent::AudioChannelClosed);
    }
}

/// Returns false when the connection should end
fn handle_message(
    message: Message,
    state: &LinkState,
    events: &mpsc::UnboundedSender<ProtocolEvent>,
    version: u8,
    hello_tx: &mut Option<oneshot::Sender<()>>,
) -> bool {
    match message {
        Message::Text(text) => {
            state.touch();
            tracing::debug!(len = text.len(), "received json");
            match ServerMessage::parse(&text) {
                Ok(ServerMessage::Hello(hello)) => {
                    if apply_server_hello(state, &hello) {
                        if let Some(tx) = hello_tx.take() {
                            let _ = tx.send(());
                        }
                    }
                }
                Ok(message) => {
                    let _ = events.send(ProtocolEvent::IncomingJson(message));
                }
                Err(e) => tracing::error!(error = %e, "failed to parse server message"),
            }
        }
        Message::Binary(data) => {
            state.touch();
            match frame::decode_binary(version, &data) {
                Ok(inbound) => dispatch_frame(inbound, state, events),
                Err(e) => tracing::warn!(error = %e, "malformed binary frame"),
            }
        }
        Message::Close(frame) => {
            tracing::info!(?frame, "websocket closed by server");
            return false;
        }
        Message::Ping(_) | Message::Pong(_) => state.touch(),
        Message::Frame(_) => {}
    }
    true
}

fn apply_server_hello(state: &LinkState, hello: &ServerHello) -> bool {
    if hello.transport != "websocket" {
        tracing::error!(transport = %hello.transport, "unsupported transport");
        return false;
    }

    if let Ok(mut session) = state.session.lock() {
        match &hello.session_id {
            Some(id) => session.id.clone_from(id),
            None => tracing::warn!("server hello has no session id"),
        }
        if let Some(params) = hello.audio_params {
            if let Some(rate) = params.sample_rate {
                session.sample_rate = rate;
            }
            if let Some(duration) = params.frame_duration {
                session.frame_duration = duration;
            }
        }
    }
    true
}

fn dispatch_frame(inbound: InboundFrame, state: &LinkState, events: &mpsc::UnboundedSender<ProtocolEvent>) {
    let event = match inbound {
        InboundFrame::Audio { timestamp, payload } => {
            let session = state.session();
            ProtocolEvent::IncomingAudio(AudioStreamPacket {
                sample_rate: session.sample_rate,
                frame_duration_ms: session.frame_duration,
                timestamp,
                payload,
            })
        }
        InboundFrame::AudioStart => {
            state.streaming.store(true, Ordering::Release);
            tracing::info!("server audio stream started, heartbeat paused");
            ProtocolEvent::IncomingJson(ServerMessage::Tts {
                state: TtsState::Start,
                text: None,
                emotion: None,
            })
        }
        InboundFrame::AudioEnd => {
            state.streaming.store(false, Ordering::Release);
            tracing::info!("server audio stream ended, heartbeat resumed");
            ProtocolEvent::IncomingJson(ServerMessage::Tts {
                state: TtsState::Stop,
                text: None,
                emotion: None,
            })
        }
        InboundFrame::AsrText(json) => match serde_json::from_str::<TextPayload>(&json) {
            Ok(payload) => ProtocolEvent::IncomingJson(ServerMessage::Stt {
                text: payload.text.unwrap_or_default(),
            }),
            Err(e) => {
                tracing::warn!(error = %e, "malformed asr payload");
                return;
            }
        },
        InboundFrame::LlmText(json) => match serde_json::from_str::<TextPayload>(&json) {
            Ok(payload) => ProtocolEvent::IncomingJson(ServerMessage::Llm {
                text: payload.text,
                emotion: None,
                is_final: payload.is_final,
            }),
            Err(e) => {
                tracing::warn!(error = %e, "malformed llm payload");
                return;
            }
        },
        InboundFrame::Error(message) => {
            tracing::error!(message = %message, "server reported error");
            ProtocolEvent::IncomingJson(ServerMessage::Error { message })
        }
        InboundFrame::Emotion(json) => {
            tracing::info!(update = %json, "emotion update");
            return;
        }
        InboundFrame::Unknown(kind) => {
            tracing::warn!(kind, "unknown binary message type");
            return;
        }
    };
    let _ = events.send(event);
}
