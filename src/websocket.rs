//! # Session WebSocket
//!
//! Clients connect to `/ws/session`. Each connection is one avatar session: the
//! socket actor relays engine events, the remote voice track and form input to
//! its [`SessionController`], and carries engine commands, renderer commands,
//! synced audio and view snapshots back to the browser.
//!
//! ## Message Format:
//! - **Client → Server text**: JSON `ClientMessage` tagged by `type`
//! - **Client → Server binary**: remote voice frames, little-endian f32 mono
//! - **Server → Client text**: JSON `ServerMessage` tagged by `type`
//! - **Server → Client binary**: released frames for the renderer, little-endian i16
//!
//! ## Heartbeat:
//! The server pings every 30 s. Sixty seconds without any client frame closes
//! the socket, which stops the session.

use crate::audio::clock::MonotonicClock;
use crate::audio::processor::{decode_f32_le, encode_i16_le};
use crate::engine::assistant::EngineTarget;
use crate::engine::events::EngineEvent;
use crate::engine::ports::{
    AvatarRenderer, ConversationEngine, RemoteAudioSource, RemoteAudioTrack, RendererSettings, ViewSink,
};
use crate::error::{AppError, AppResult};
use crate::gateway::client::{HttpSigningGateway, SigningGateway};
use crate::session::controller::{MicrophoneStatus, SessionCommand, SessionController, SessionPorts};
use crate::session::view::SessionView;
use crate::state::AppState;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);
const ENGINE_START_TIMEOUT: Duration = Duration::from_secs(15);

/// Messages sent by the browser.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Start {
        microphone: MicrophoneStatus,
    },
    Stop,
    ToggleMute,
    EngineEvent {
        event: EngineEvent,
    },
    /// Answer to an `engine_command` of action `start`.
    EngineStartResult {
        ok: bool,
        #[serde(default)]
        error: Option<String>,
    },
    RemoteTrack {
        #[serde(rename = "trackId")]
        track_id: String,
    },
    RemoteTrackEnded,
    FormInput {
        #[serde(default)]
        email: String,
        #[serde(default)]
        name: String,
    },
    SubmitForm,
    DismissForm,
    Ping {
        timestamp: u64,
    },
    Pong {
        timestamp: u64,
    },
}

/// Messages sent to the browser.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    EngineCommand { command: EngineCommand },
    RendererCommand { command: RendererCommand },
    View { view: SessionView },
    OpenUrl { url: String },
    Ping { timestamp: u64 },
    Pong { timestamp: u64 },
    Error { code: String, message: String },
}

/// Calls the browser makes on the engine SDK.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum EngineCommand {
    Start { target: EngineTarget },
    Stop,
    SetMuted { muted: bool },
    Send { message: Value },
}

/// Calls the browser makes on the avatar renderer.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RendererCommand {
    Initialize { settings: RendererSettings },
    Start,
    Stop,
    SetPlaybackRate { rate: f32 },
    UnmutePlayback,
}

/// Something for the socket to write to the client.
#[derive(Message, Debug)]
#[rtype(result = "()")]
pub enum Outbound {
    Text(ServerMessage),
    Audio(Vec<u8>),
}

/// Ask the client to start the engine and wait for its `engine_start_result`.
#[derive(Message, Debug)]
#[rtype(result = "Result<(), AppError>")]
pub struct StartEngine {
    pub target: EngineTarget,
}

fn now_millis() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

// ---- port adapters ----

pub struct WsEngine {
    socket: Addr<SessionSocket>,
}

#[async_trait]
impl ConversationEngine for WsEngine {
    async fn start(&self, target: EngineTarget) -> AppResult<()> {
        self.socket
            .send(StartEngine { target })
            .await
            .map_err(|err| AppError::EngineConnection(format!("Session connection closed: {}", err)))?
    }

    fn stop(&self) -> AppResult<()> {
        self.socket
            .try_send(Outbound::Text(ServerMessage::EngineCommand {
                command: EngineCommand::Stop,
            }))
            .map_err(|err| AppError::TransientTeardown(err.to_string()))
    }

    fn set_muted(&self, muted: bool) {
        self.socket.do_send(Outbound::Text(ServerMessage::EngineCommand {
            command: EngineCommand::SetMuted { muted },
        }));
    }

    fn send_result(&self, call_id: &str, result: &str) {
        let message = json!({
            "type": "function-call-result",
            "functionCallId": call_id,
            "result": result,
        });
        self.socket.do_send(Outbound::Text(ServerMessage::EngineCommand {
            command: EngineCommand::Send { message },
        }));
    }
}

pub struct WsRenderer {
    socket: Addr<SessionSocket>,
}

impl WsRenderer {
    fn command(&self, command: RendererCommand) -> AppResult<()> {
        self.socket
            .try_send(Outbound::Text(ServerMessage::RendererCommand { command }))
            .map_err(|err| AppError::Internal(format!("Renderer command not delivered: {}", err)))
    }
}

impl AvatarRenderer for WsRenderer {
    fn initialize(&self, settings: &RendererSettings) -> AppResult<()> {
        self.command(RendererCommand::Initialize {
            settings: settings.clone(),
        })
    }

    fn start(&self) -> AppResult<()> {
        self.command(RendererCommand::Start)
    }

    fn stop(&self) -> AppResult<()> {
        self.command(RendererCommand::Stop)
            .map_err(|err| AppError::TransientTeardown(err.message().to_string()))
    }

    fn send_audio(&self, samples: &[i16]) {
        self.socket.do_send(Outbound::Audio(encode_i16_le(samples)));
    }

    fn set_playback_rate(&self, rate: f32) {
        self.socket.do_send(Outbound::Text(ServerMessage::RendererCommand {
            command: RendererCommand::SetPlaybackRate { rate },
        }));
    }

    fn unmute_playback(&self) {
        self.socket.do_send(Outbound::Text(ServerMessage::RendererCommand {
            command: RendererCommand::UnmutePlayback,
        }));
    }
}

pub struct WsView {
    socket: Addr<SessionSocket>,
}

impl ViewSink for WsView {
    fn publish(&self, view: &SessionView) {
        self.socket
            .do_send(Outbound::Text(ServerMessage::View { view: view.clone() }));
    }

    fn open_url(&self, url: &str) {
        self.socket
            .do_send(Outbound::Text(ServerMessage::OpenUrl { url: url.to_string() }));
    }
}

/// Remote voice track announced by the client and fed by its binary frames.
#[derive(Debug, Clone, Default)]
pub struct RemoteAudioRelay {
    inner: Arc<Mutex<RelayState>>,
}

#[derive(Debug, Default)]
struct RelayState {
    track_id: Option<String>,
    sender: Option<mpsc::UnboundedSender<Vec<f32>>>,
}

impl RemoteAudioRelay {
    fn state(&self) -> MutexGuard<'_, RelayState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn announce(&self, track_id: String) {
        self.state().track_id = Some(track_id);
    }

    /// The track ended on the client; a bound stream finishes.
    pub fn withdraw(&self) {
        let mut state = self.state();
        state.track_id = None;
        state.sender = None;
    }

    /// Forward one frame. Returns `false` when no track is bound.
    pub fn push(&self, samples: Vec<f32>) -> bool {
        let mut state = self.state();
        match &state.sender {
            Some(sender) if sender.send(samples).is_ok() => true,
            Some(_) => {
                state.sender = None;
                false
            }
            None => false,
        }
    }
}

impl RemoteAudioSource for RemoteAudioRelay {
    fn remote_audio_track(&self) -> Option<RemoteAudioTrack> {
        let mut state = self.state();
        let id = state.track_id.clone()?;
        let (sender, frames) = mpsc::unbounded_channel();
        state.sender = Some(sender);
        Some(RemoteAudioTrack { id, frames })
    }

    fn release(&self) {
        self.state().sender = None;
    }
}

// ---- socket actor ----

pub struct SessionSocket {
    app_state: AppState,
    gateway: Arc<dyn SigningGateway>,
    relay: RemoteAudioRelay,
    controller: Option<Addr<SessionController>>,
    pending_start: Option<oneshot::Sender<Result<(), String>>>,
    last_heartbeat: Instant,
}

impl SessionSocket {
    pub fn new(app_state: AppState, gateway: Arc<dyn SigningGateway>) -> Self {
        Self {
            app_state,
            gateway,
            relay: RemoteAudioRelay::default(),
            controller: None,
            pending_start: None,
            last_heartbeat: Instant::now(),
        }
    }

    fn send_json(ctx: &mut ws::WebsocketContext<Self>, message: &ServerMessage) {
        match serde_json::to_string(message) {
            Ok(json) => ctx.text(json),
            Err(err) => error!("Failed to serialize server message: {}", err),
        }
    }

    fn send_error(&self, ctx: &mut ws::WebsocketContext<Self>, code: &str, message: &str) {
        Self::send_json(
            ctx,
            &ServerMessage::Error {
                code: code.to_string(),
                message: message.to_string(),
            },
        );
        warn!("WebSocket error {}: {}", code, message);
    }

    fn forward(&self, command: SessionCommand) {
        if let Some(controller) = &self.controller {
            controller.do_send(command);
        }
    }

    fn handle_client_message(&mut self, message: ClientMessage, ctx: &mut ws::WebsocketContext<Self>) {
        match message {
            ClientMessage::Start { microphone } => self.forward(SessionCommand::Start { microphone }),
            ClientMessage::Stop => self.forward(SessionCommand::Stop),
            ClientMessage::ToggleMute => self.forward(SessionCommand::ToggleMute),
            ClientMessage::EngineEvent { event } => self.forward(SessionCommand::Engine(event)),
            ClientMessage::EngineStartResult { ok, error } => match self.pending_start.take() {
                Some(reply) => {
                    let result = if ok {
                        Ok(())
                    } else {
                        Err(error.unwrap_or_else(|| "Engine failed to start".to_string()))
                    };
                    let _ = reply.send(result);
                }
                None => debug!("Engine start result without a pending start"),
            },
            ClientMessage::RemoteTrack { track_id } => {
                debug!(track_id = %track_id, "Remote audio track announced");
                self.relay.announce(track_id);
            }
            ClientMessage::RemoteTrackEnded => self.relay.withdraw(),
            ClientMessage::FormInput { email, name } => self.forward(SessionCommand::FormInput { email, name }),
            ClientMessage::SubmitForm => self.forward(SessionCommand::SubmitForm),
            ClientMessage::DismissForm => self.forward(SessionCommand::DismissForm),
            ClientMessage::Ping { timestamp } => Self::send_json(ctx, &ServerMessage::Pong { timestamp }),
            ClientMessage::Pong { .. } => {}
        }
    }

    fn handle_audio(&mut self, data: &[u8], ctx: &mut ws::WebsocketContext<Self>) {
        match decode_f32_le(data) {
            Ok(samples) => {
                if !self.relay.push(samples) {
                    debug!("Dropping remote audio frame, no track bound");
                }
            }
            Err(err) => self.send_error(ctx, "audio_error", &format!("Invalid audio: {}", err)),
        }
    }
}

impl Actor for SessionSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        let socket = ctx.address();
        let ports = SessionPorts {
            engine: Arc::new(WsEngine { socket: socket.clone() }),
            renderer: Arc::new(WsRenderer { socket: socket.clone() }),
            remote_audio: Arc::new(self.relay.clone()),
            view: Arc::new(WsView { socket }),
            gateway: self.gateway.clone(),
            clock: Arc::new(MonotonicClock::new()),
        };
        let controller = SessionController::new(self.app_state.get_config(), ports, self.app_state.clone());
        info!(session_id = %controller.id(), "WebSocket session started");
        self.controller = Some(controller.start());

        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!("WebSocket heartbeat timeout, closing connection");
                ctx.stop();
            } else {
                Self::send_json(ctx, &ServerMessage::Ping { timestamp: now_millis() });
            }
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        info!("WebSocket session stopped");
        if let Some(controller) = self.controller.take() {
            controller.do_send(SessionCommand::Shutdown);
        }
        self.relay.withdraw();
        self.app_state.release_session();
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for SessionSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => {
                self.last_heartbeat = Instant::now();
                match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(message) => self.handle_client_message(message, ctx),
                    Err(err) => self.send_error(ctx, "invalid_json", &format!("Invalid JSON: {}", err)),
                }
            }
            Ok(ws::Message::Binary(data)) => {
                self.last_heartbeat = Instant::now();
                self.handle_audio(&data, ctx);
            }
            Ok(ws::Message::Ping(data)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!("WebSocket closed: {:?}", reason);
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!("Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!("WebSocket protocol error: {}", err);
                ctx.stop();
            }
        }
    }
}

impl Handler<Outbound> for SessionSocket {
    type Result = ();

    fn handle(&mut self, msg: Outbound, ctx: &mut Self::Context) {
        match msg {
            Outbound::Text(message) => Self::send_json(ctx, &message),
            Outbound::Audio(bytes) => ctx.binary(bytes),
        }
    }
}

impl Handler<StartEngine> for SessionSocket {
    type Result = ResponseFuture<Result<(), AppError>>;

    fn handle(&mut self, msg: StartEngine, ctx: &mut Self::Context) -> Self::Result {
        let (reply, response) = oneshot::channel();
        // A newer start supersedes one the client never answered
        self.pending_start = Some(reply);
        Self::send_json(
            ctx,
            &ServerMessage::EngineCommand {
                command: EngineCommand::Start { target: msg.target },
            },
        );

        Box::pin(async move {
            match tokio::time::timeout(ENGINE_START_TIMEOUT, response).await {
                Ok(Ok(Ok(()))) => Ok(()),
                Ok(Ok(Err(message))) => Err(AppError::EngineConnection(message)),
                Ok(Err(_)) => Err(AppError::EngineConnection("Engine start was abandoned".to_string())),
                Err(_) => Err(AppError::EngineConnection(
                    "Timed out waiting for the engine to start".to_string(),
                )),
            }
        })
    }
}

/// WebSocket endpoint handler.
///
/// Reserves a session slot before upgrading; the slot is released when the
/// socket actor stops.
pub async fn session_websocket(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    info!("New session connection from: {:?}", req.connection_info().peer_addr());

    if !app_state.try_acquire_session() {
        warn!("Refusing session, concurrent session limit reached");
        return Err(AppError::CapacityExceeded("Too many active sessions, try again later".to_string()).into());
    }

    let config = app_state.get_config();
    let gateway = match HttpSigningGateway::new(&config.signing.gateway_url) {
        Ok(gateway) => gateway,
        Err(err) => {
            app_state.release_session();
            return Err(err.into());
        }
    };

    let socket = SessionSocket::new(app_state.get_ref().clone(), Arc::new(gateway));
    let response = ws::start(socket, &req, stream);
    if response.is_err() {
        app_state.release_session();
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::state::SessionState;
    use crate::session::view::FormView;

    #[actix_web::test]
    async fn test_full_server_refuses_with_error_contract() {
        use crate::config::AppConfig;
        use actix_web::{http::StatusCode, test, App};

        let mut config = AppConfig::default();
        config.performance.max_concurrent_sessions = 1;
        let state = AppState::new(config);
        assert!(state.try_acquire_session());

        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/ws/session", web::get().to(session_websocket)),
        )
        .await;

        let req = test::TestRequest::get().uri("/ws/session").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["type"], "capacity_exceeded");
        assert_eq!(body["error"], "Too many active sessions, try again later");
        assert!(body["timestamp"].is_string());
        assert_eq!(state.get_metrics_snapshot().active_sessions, 1);
    }

    #[test]
    fn test_client_message_parsing() {
        let start: ClientMessage = serde_json::from_str(r#"{"type":"start","microphone":"not_found"}"#).unwrap();
        assert!(matches!(
            start,
            ClientMessage::Start {
                microphone: MicrophoneStatus::NotFound
            }
        ));

        let event: ClientMessage =
            serde_json::from_str(r#"{"type":"engine_event","event":{"type":"call-start","callId":"c1"}}"#).unwrap();
        match event {
            ClientMessage::EngineEvent {
                event: EngineEvent::CallStart { call_id },
            } => assert_eq!(call_id.as_deref(), Some("c1")),
            other => panic!("Wrong message: {:?}", other),
        }

        let track: ClientMessage = serde_json::from_str(r#"{"type":"remote_track","trackId":"t-1"}"#).unwrap();
        assert!(matches!(track, ClientMessage::RemoteTrack { track_id } if track_id == "t-1"));

        let failed: ClientMessage =
            serde_json::from_str(r#"{"type":"engine_start_result","ok":false,"error":"bad key"}"#).unwrap();
        assert!(matches!(failed, ClientMessage::EngineStartResult { ok: false, error: Some(_) }));

        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"start","microphone":"maybe"}"#).is_err());
    }

    #[test]
    fn test_server_message_format() {
        let message = ServerMessage::EngineCommand {
            command: EngineCommand::Send {
                message: json!({ "type": "function-call-result", "functionCallId": "c1", "result": "ok" }),
            },
        };
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["type"], "engine_command");
        assert_eq!(json["command"]["action"], "send");
        assert_eq!(json["command"]["message"]["functionCallId"], "c1");

        let start = serde_json::to_value(ServerMessage::EngineCommand {
            command: EngineCommand::Start {
                target: EngineTarget::Assistant { id: "asst".to_string() },
            },
        })
        .unwrap();
        assert_eq!(start["command"]["target"]["kind"], "assistant");

        let rate = serde_json::to_value(ServerMessage::RendererCommand {
            command: RendererCommand::SetPlaybackRate { rate: 0.98 },
        })
        .unwrap();
        assert_eq!(rate["command"]["action"], "set_playback_rate");
    }

    #[test]
    fn test_view_message_uses_camel_case() {
        let view = SessionView {
            state: SessionState::Connecting,
            mic_denied: false,
            error: None,
            transcript: String::new(),
            muted: false,
            signing_link: None,
            signing_link_error: Some("Invalid email".to_string()),
            creating_signing_link: false,
            contract_signed: false,
            form: FormView {
                visible: false,
                email: String::new(),
                name: String::new(),
            },
        };
        let json = serde_json::to_value(ServerMessage::View { view }).unwrap();
        assert_eq!(json["view"]["state"], "connecting");
        assert_eq!(json["view"]["signingLinkError"], "Invalid email");
        assert_eq!(json["view"]["micDenied"], false);
    }

    #[test]
    fn test_relay_binds_after_announcement() {
        let relay = RemoteAudioRelay::default();
        assert!(relay.remote_audio_track().is_none());
        assert!(!relay.push(vec![0.1; 4]));

        relay.announce("t-1".to_string());
        let mut track = relay.remote_audio_track().unwrap();
        assert_eq!(track.id, "t-1");
        assert!(relay.push(vec![0.1; 4]));
        assert_eq!(track.frames.try_recv().unwrap().len(), 4);

        relay.release();
        assert!(!relay.push(vec![0.1; 4]));
        assert!(track.frames.try_recv().is_err());
    }

    #[test]
    fn test_relay_withdraw_ends_stream() {
        let relay = RemoteAudioRelay::default();
        relay.announce("t-1".to_string());
        let mut track = relay.remote_audio_track().unwrap();

        relay.withdraw();
        assert!(relay.remote_audio_track().is_none());
        assert!(matches!(
            track.frames.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }
}
