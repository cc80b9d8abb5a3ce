//! # Session Controller
//!
//! One actor per connected client. It owns the session state machine, the audio
//! sync pipeline, the tool mediator, the conversation log and every timer, and
//! drives the engine, the renderer and the view through the port traits.
//!
//! ## Lifecycle:
//! 1. **start**: check keys and microphone, initialize the renderer, start the engine
//!    (assistant id first, inline assistant second)
//! 2. **call-start**: unmute playback, bind the remote track (one retry), wire the pipeline
//! 3. **events**: speech, output and transcripts move the state; tool calls go to the mediator
//! 4. **stop**: raise the stopping guard, tear everything down, clear the guard last
//!
//! Every spawned future and timer callback re-reads the actor's fields when it
//! runs. Results of engine starts issued before a stop are recognized by the
//! session generation and dropped.

use crate::audio::clock::AudioClock;
use crate::audio::drift::RATE_NORMAL;
use crate::audio::pipeline::SyncPipeline;
use crate::config::AppConfig;
use crate::engine::assistant::start_targets;
use crate::engine::events::{self, classify_error, EngineEvent, ErrorClass, Speaker};
use crate::engine::ports::{
    AvatarRenderer, ConversationEngine, RemoteAudioSource, RemoteAudioTrack, RendererSettings, ViewSink,
};
use crate::error::AppError;
use crate::gateway::broadcast::SigningNotice;
use crate::gateway::client::{SigningGateway, SigningLinkRequest};
use crate::gateway::store::MessageRole;
use crate::session::state::{SessionEvent, SessionState};
use crate::session::transcript::ConversationLog;
use crate::session::view::SessionView;
use crate::state::AppState;
use crate::tools::mediator::{LinkRequest, MediatorAction, ToolMediator};
use crate::tools::normalize::{self, ToolCall};

use actix::prelude::*;
use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::{BroadcastStream, UnboundedReceiverStream};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const MISSING_KEYS_MESSAGE: &str = "Missing API keys. Please check environment configuration.";
pub const NO_MICROPHONE_MESSAGE: &str = "No microphone found. Please connect a microphone device.";
pub const MICROPHONE_UNSUPPORTED_MESSAGE: &str = "Microphone not supported in this browser.";
pub const MICROPHONE_FAILED_MESSAGE: &str = "Failed to access microphone. Please check your microphone settings.";

/// Outcome of the client's microphone request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MicrophoneStatus {
    Granted,
    Denied,
    NotFound,
    Unsupported,
    Failed,
}

/// Commands from the client connection.
#[derive(Message, Debug)]
#[rtype(result = "()")]
pub enum SessionCommand {
    Start { microphone: MicrophoneStatus },
    Stop,
    ToggleMute,
    Engine(EngineEvent),
    FormInput { email: String, name: String },
    SubmitForm,
    DismissForm,
    /// The connection closed: stop the session and the actor.
    Shutdown,
}

/// Current snapshot, mostly for tests and diagnostics.
#[derive(Message)]
#[rtype(result = "SessionView")]
pub struct GetView;

/// Everything the controller talks to.
#[derive(Clone)]
pub struct SessionPorts {
    pub engine: Arc<dyn ConversationEngine>,
    pub renderer: Arc<dyn AvatarRenderer>,
    pub remote_audio: Arc<dyn RemoteAudioSource>,
    pub view: Arc<dyn ViewSink>,
    pub gateway: Arc<dyn SigningGateway>,
    pub clock: Arc<dyn AudioClock>,
}

pub struct SessionController {
    id: String,
    config: AppConfig,
    ports: SessionPorts,
    app_state: AppState,

    state: SessionState,
    mic_denied: bool,
    error: Option<String>,
    transcript: String,
    muted: bool,
    /// Raised for the whole stop sequence; engine errors are discarded meanwhile.
    stopping: bool,
    renderer_ready: bool,
    call_id: Option<String>,
    generation: u64,

    mediator: ToolMediator,
    conversation: ConversationLog,

    pipeline: Option<SyncPipeline>,
    clock: Option<Arc<dyn AudioClock>>,

    frame_stream: Option<SpawnHandle>,
    drift_timer: Option<SpawnHandle>,
    track_retry: Option<SpawnHandle>,
    fallback_timer: Option<SpawnHandle>,
    banner_timer: Option<SpawnHandle>,
}

fn millis(ms: u64) -> Duration {
    Duration::from_millis(ms)
}

impl SessionController {
    pub fn new(config: AppConfig, ports: SessionPorts, app_state: AppState) -> Self {
        let mediator = ToolMediator::new(config.tools.fallback_keywords.clone());
        Self {
            id: Uuid::new_v4().to_string(),
            config,
            ports,
            app_state,
            state: SessionState::Idle,
            mic_denied: false,
            error: None,
            transcript: String::new(),
            muted: false,
            stopping: false,
            renderer_ready: false,
            call_id: None,
            generation: 0,
            mediator,
            conversation: ConversationLog::new(),
            pipeline: None,
            clock: None,
            frame_stream: None,
            drift_timer: None,
            track_retry: None,
            fallback_timer: None,
            banner_timer: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn view(&self) -> SessionView {
        let (signing_link, signing_link_error) = SessionView::signing_fields(self.mediator.status());
        SessionView {
            state: self.state,
            mic_denied: self.mic_denied,
            error: self.error.clone(),
            transcript: self.transcript.clone(),
            muted: self.muted,
            signing_link,
            signing_link_error,
            creating_signing_link: self.mediator.is_creating(),
            contract_signed: self.mediator.contract_signed(),
            form: self.mediator.form().into(),
        }
    }

    fn publish(&self) {
        self.ports.view.publish(&self.view());
    }

    /// Apply a state machine event; rejected transitions leave the state alone.
    fn transition(&mut self, event: SessionEvent) -> bool {
        match self.state.next(event) {
            Some(next) => {
                if next != self.state {
                    debug!(session_id = %self.id, from = %self.state, to = %next, "Session state changed");
                }
                self.state = next;
                true
            }
            None => {
                debug!(session_id = %self.id, state = %self.state, ?event, "Transition rejected");
                false
            }
        }
    }

    /// Move to Error and surface `err` the way its category demands.
    fn fail(&mut self, err: AppError) {
        if err.is_swallowed() {
            debug!(session_id = %self.id, error = %err, "Ignoring teardown failure");
            return;
        }

        warn!(session_id = %self.id, kind = err.kind(), error = %err, "Session failed");
        match err {
            AppError::PermissionDenied(_) => {
                self.mic_denied = true;
                self.error = None;
            }
            other => self.error = Some(other.message().to_string()),
        }
        self.transition(SessionEvent::Failure);
    }

    fn cancel(ctx: &mut Context<Self>, handle: &mut Option<SpawnHandle>) {
        if let Some(handle) = handle.take() {
            ctx.cancel_future(handle);
        }
    }

    // ---- start ----

    fn start_session(&mut self, microphone: MicrophoneStatus, ctx: &mut Context<Self>) {
        if self.state != SessionState::Idle {
            warn!(session_id = %self.id, state = %self.state, "Start ignored, session is not idle");
            return;
        }

        if self.config.engine.public_key.trim().is_empty() || self.config.avatar.api_key.trim().is_empty() {
            warn!(session_id = %self.id, "Engine or renderer key is not configured");
            self.error = Some(MISSING_KEYS_MESSAGE.to_string());
            return;
        }

        self.stopping = false;
        self.error = None;
        self.mic_denied = false;
        self.transcript.clear();
        self.transition(SessionEvent::Start);

        let microphone_error = match microphone {
            MicrophoneStatus::Granted => None,
            MicrophoneStatus::Denied => Some(AppError::PermissionDenied("Microphone access denied".to_string())),
            MicrophoneStatus::NotFound => Some(AppError::DeviceNotFound(NO_MICROPHONE_MESSAGE.to_string())),
            MicrophoneStatus::Unsupported => {
                Some(AppError::DeviceNotFound(MICROPHONE_UNSUPPORTED_MESSAGE.to_string()))
            }
            MicrophoneStatus::Failed => Some(AppError::DeviceNotFound(MICROPHONE_FAILED_MESSAGE.to_string())),
        };
        if let Some(err) = microphone_error {
            self.fail(err);
            return;
        }

        if let Err(err) = self.prepare_renderer() {
            self.fail(err);
            return;
        }

        self.start_engine(ctx);
    }

    fn prepare_renderer(&mut self) -> Result<(), AppError> {
        if !self.renderer_ready {
            let settings = RendererSettings {
                api_key: self.config.avatar.api_key.clone(),
                face_id: self.config.avatar.face_id.clone(),
                handle_silence: true,
            };
            self.ports.renderer.initialize(&settings)?;
            self.ports.renderer.start()?;
            self.renderer_ready = true;
        }
        Ok(())
    }

    fn start_engine(&mut self, ctx: &mut Context<Self>) {
        let generation = self.generation;
        let engine = self.ports.engine.clone();
        let targets = start_targets(&self.config.engine);
        let session_id = self.id.clone();

        let attempt = async move {
            let mut last_error = AppError::EngineConnection("No engine target configured".to_string());
            for target in targets {
                let kind = target.describe();
                match engine.start(target).await {
                    Ok(()) => return Ok(kind),
                    Err(err) => {
                        warn!(session_id = %session_id, target = kind, error = %err, "Engine start failed");
                        last_error = err;
                    }
                }
            }
            Err(last_error)
        };

        ctx.spawn(attempt.into_actor(self).map(move |result, act, _ctx| {
            if act.generation != generation || act.state != SessionState::Connecting {
                debug!(session_id = %act.id, "Dropping stale engine start result");
                return;
            }
            match result {
                Ok(kind) => info!(session_id = %act.id, target = kind, "Engine started"),
                Err(err) => {
                    act.fail(AppError::EngineConnection(err.message().to_string()));
                    act.publish();
                }
            }
        }));
    }

    // ---- call lifecycle ----

    fn on_call_start(&mut self, call_id: Option<String>, ctx: &mut Context<Self>) {
        if !self.transition(SessionEvent::CallStarted) {
            return;
        }

        info!(session_id = %self.id, call_id = ?call_id, "Call started");
        self.call_id = call_id;
        self.conversation.begin(Utc::now());
        self.ports.renderer.unmute_playback();
        self.bind_remote_track(true, ctx);
    }

    fn bind_remote_track(&mut self, first_attempt: bool, ctx: &mut Context<Self>) {
        match self.ports.remote_audio.remote_audio_track() {
            Some(track) => self.wire_pipeline(track, ctx),
            None if first_attempt => {
                debug!(session_id = %self.id, "Remote audio track not ready, retrying once");
                let delay = millis(self.config.sync.track_retry_ms);
                self.track_retry = Some(ctx.run_later(delay, |act, ctx| {
                    act.track_retry = None;
                    if matches!(
                        act.state,
                        SessionState::Connected | SessionState::Listening | SessionState::Speaking
                    ) {
                        act.bind_remote_track(false, ctx);
                    }
                }));
            }
            None => warn!(session_id = %self.id, "No remote audio track, avatar will not be lip-synced"),
        }
    }

    fn wire_pipeline(&mut self, track: RemoteAudioTrack, ctx: &mut Context<Self>) {
        let clock = self.ports.clock.clone();
        self.pipeline = Some(SyncPipeline::new(&self.config, clock.clone()));
        self.clock = Some(clock);
        self.ports.renderer.set_playback_rate(RATE_NORMAL);

        info!(session_id = %self.id, track_id = %track.id, "Remote audio track bound");
        self.frame_stream = Some(ctx.add_stream(UnboundedReceiverStream::new(track.frames)));

        let poll = millis(self.config.sync.drift_poll_ms);
        self.drift_timer = Some(ctx.run_interval(poll, |act, ctx| act.on_sync_tick(ctx)));
    }

    /// Scheduled pacer tick and drift check.
    fn on_sync_tick(&mut self, ctx: &mut Context<Self>) {
        if !self.renderer_ready || self.clock.is_none() || self.pipeline.is_none() {
            debug!(session_id = %self.id, "Audio graph gone, stopping sync loop");
            Self::cancel(ctx, &mut self.drift_timer);
            return;
        }

        if let Some(pipeline) = self.pipeline.as_mut() {
            for frame in pipeline.tick() {
                self.ports.renderer.send_audio(&frame.samples);
            }
            if let Some(rate) = pipeline.check_drift() {
                let sample = pipeline.last_drift_sample();
                debug!(
                    session_id = %self.id,
                    rate,
                    occupancy = pipeline.occupancy(),
                    target_latency_ms = pipeline.target_latency().as_millis() as u64,
                    drift = sample.map(|s| s.drift()),
                    sampled_at_ms = sample.map(|s| s.timestamp.as_millis() as u64),
                    "Adjusting playback rate"
                );
                self.ports.renderer.set_playback_rate(rate);
            }
        }
    }

    fn teardown_audio(&mut self, ctx: &mut Context<Self>) {
        Self::cancel(ctx, &mut self.frame_stream);
        Self::cancel(ctx, &mut self.drift_timer);
        Self::cancel(ctx, &mut self.track_retry);

        if let Some(mut pipeline) = self.pipeline.take() {
            pipeline.disconnect();
            let stats = pipeline.stats();
            info!(
                session_id = %self.id,
                captured = stats.frames_captured,
                gated = stats.frames_gated,
                released = stats.frames_released,
                "Audio graph disconnected"
            );
        }
        self.clock = None;
        self.ports.remote_audio.release();
    }

    fn persist_conversation(&mut self) {
        let call_id = self.call_id.clone().unwrap_or_else(|| self.id.clone());
        let assistant_id = Some(self.config.engine.assistant_id.clone()).filter(|id| !id.trim().is_empty());

        let Some(record) = self.conversation.finish(&call_id, assistant_id, Utc::now()) else {
            return;
        };

        let gateway = self.ports.gateway.clone();
        // Detached from the actor so a closing connection still persists
        tokio::spawn(async move {
            match gateway.save_conversation(&record).await {
                Ok(()) => debug!(call_id = %record.call_id, "Conversation saved"),
                Err(err) => warn!(call_id = %record.call_id, error = %err, "Failed to save conversation"),
            }
        });
    }

    fn on_call_end(&mut self, ctx: &mut Context<Self>) {
        if !self.state.is_active() {
            return;
        }

        info!(session_id = %self.id, call_id = ?self.call_id, "Call ended");
        self.teardown_audio(ctx);
        self.persist_conversation();
        Self::cancel(ctx, &mut self.fallback_timer);
        self.call_id = None;
        self.transition(SessionEvent::CallEnded);
    }

    fn stop_session(&mut self, ctx: &mut Context<Self>) {
        self.stopping = true;
        info!(session_id = %self.id, state = %self.state, "Stopping session");

        if let Err(err) = self.ports.engine.stop() {
            self.fail(AppError::TransientTeardown(err.message().to_string()));
        }
        if self.renderer_ready {
            if let Err(err) = self.ports.renderer.stop() {
                self.fail(AppError::TransientTeardown(err.message().to_string()));
            }
            self.renderer_ready = false;
        }
        self.teardown_audio(ctx);
        self.persist_conversation();

        Self::cancel(ctx, &mut self.fallback_timer);
        Self::cancel(ctx, &mut self.banner_timer);
        self.mediator.reset();
        self.mediator.clear_signed_banner();

        self.transcript.clear();
        self.error = None;
        self.mic_denied = false;
        self.call_id = None;
        self.generation += 1;
        self.transition(SessionEvent::Stop);
        self.stopping = false;
    }

    // ---- engine events ----

    fn on_engine_event(&mut self, event: EngineEvent, ctx: &mut Context<Self>) {
        match event {
            EngineEvent::CallStart { call_id } => self.on_call_start(call_id, ctx),
            EngineEvent::CallEnd => self.on_call_end(ctx),
            EngineEvent::SpeechStart => {
                self.transition(SessionEvent::SpeechStarted);
            }
            EngineEvent::SpeechEnd => {
                self.transition(SessionEvent::SpeechEnded);
            }
            EngineEvent::ModelOutput { content } => {
                let content = content.trim();
                if !content.is_empty() && self.transition(SessionEvent::AssistantOutput) {
                    self.transcript = content.to_string();
                }
            }
            EngineEvent::Message { payload } => self.on_engine_message(&payload, ctx),
            EngineEvent::FunctionCall { payload } => match normalize::from_function_call(&payload) {
                Ok(call) => self.on_tool_call(call, ctx),
                Err(err) => warn!(session_id = %self.id, ?err, "Dropping malformed function call"),
            },
            EngineEvent::Error { payload } => self.on_engine_error(&payload),
        }
    }

    fn on_engine_message(&mut self, payload: &serde_json::Value, ctx: &mut Context<Self>) {
        match normalize::from_message(payload) {
            Ok(Some(call)) => self.on_tool_call(call, ctx),
            Ok(None) => {}
            Err(err) => warn!(session_id = %self.id, ?err, "Dropping tool call message"),
        }

        let Some(line) = events::transcript(payload) else {
            return;
        };

        if line.is_final {
            let role = match line.speaker {
                Speaker::User => MessageRole::User,
                Speaker::Assistant => MessageRole::Assistant,
            };
            self.conversation.record(role, &line.text, Utc::now());
        }

        if line.speaker == Speaker::Assistant {
            if self.transition(SessionEvent::AssistantOutput) {
                self.transcript = line.text.clone();
            }
            let actions = self.mediator.on_assistant_transcript(&line.text);
            self.apply(actions, ctx);
        }
    }

    fn on_engine_error(&mut self, payload: &serde_json::Value) {
        if self.stopping || self.state == SessionState::Idle {
            debug!(session_id = %self.id, "Discarding engine error, no live call");
            return;
        }

        self.conversation.record_error();
        let err = match classify_error(payload) {
            ErrorClass::MicrophoneDenied => AppError::PermissionDenied("Microphone access denied".to_string()),
            ErrorClass::Generic(message) => AppError::EngineConnection(message),
        };
        self.fail(err);
    }

    // ---- tools ----

    fn on_tool_call(&mut self, call: ToolCall, ctx: &mut Context<Self>) {
        debug!(
            session_id = %self.id,
            call_id = %call.call_id,
            function = %call.function_name,
            channel = ?call.channel,
            "Tool call received"
        );
        let actions = self.mediator.on_tool_call(call);
        self.apply(actions, ctx);
    }

    fn apply(&mut self, actions: Vec<MediatorAction>, ctx: &mut Context<Self>) {
        for action in actions {
            match action {
                MediatorAction::Acknowledge { call_id, message } => {
                    self.ports.engine.send_result(&call_id, &message);
                    self.app_state.increment_tool_calls_resolved();
                }
                MediatorAction::RequestLink(request) => self.request_link(request, ctx),
                MediatorAction::ArmFallback => {
                    Self::cancel(ctx, &mut self.fallback_timer);
                    let delay = millis(self.config.tools.fallback_debounce_ms);
                    self.fallback_timer = Some(ctx.run_later(delay, |act, _ctx| {
                        act.fallback_timer = None;
                        if act.mediator.on_fallback_elapsed() {
                            info!(session_id = %act.id, "Signing mentioned without a tool call, opening form");
                            act.publish();
                        }
                    }));
                }
                MediatorAction::CancelFallback => Self::cancel(ctx, &mut self.fallback_timer),
                MediatorAction::OpenUrl(url) => self.ports.view.open_url(&url),
            }
        }
    }

    fn request_link(&mut self, request: LinkRequest, ctx: &mut Context<Self>) {
        let body = SigningLinkRequest {
            email: request.email.clone(),
            name: request.name.clone(),
            call_id: request.call_id().map(str::to_string),
            session_id: Some(self.id.clone()),
        };
        let gateway = self.ports.gateway.clone();

        ctx.spawn(
            async move { gateway.create_signing_link(body).await }
                .into_actor(self)
                .map(move |result, act, ctx| {
                    match &result {
                        Ok(link) => {
                            info!(session_id = %act.id, document_id = %link.document_id, "Signing link created");
                            act.app_state.increment_signing_links_created();
                        }
                        Err(err) => warn!(session_id = %act.id, error = %err, "Signing link request failed"),
                    }
                    let actions = act.mediator.on_link_result(&request, result);
                    act.apply(actions, ctx);
                    act.publish();
                }),
        );
    }

    fn on_signing_notice(&mut self, notice: SigningNotice, ctx: &mut Context<Self>) {
        if !notice.is_completion() || !self.mediator.awaits_signature(notice.document_id.as_deref()) {
            return;
        }

        if let Some(document_id) = self.mediator.on_contract_signed() {
            info!(session_id = %self.id, document_id = %document_id, "Contract signed");
            self.app_state.increment_contracts_signed();
            let gateway = self.ports.gateway.clone();
            tokio::spawn(async move {
                if let Err(err) = gateway.update_signing_status(&document_id, "signed").await {
                    warn!(document_id = %document_id, error = %err, "Failed to record signed status");
                }
            });
        }

        Self::cancel(ctx, &mut self.banner_timer);
        let banner = millis(self.config.tools.success_banner_ms);
        self.banner_timer = Some(ctx.run_later(banner, |act, _ctx| {
            act.banner_timer = None;
            act.mediator.clear_signed_banner();
            act.publish();
        }));
        self.publish();
    }
}

impl Actor for SessionController {
    type Context = Context<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(session_id = %self.id, "Session controller started");
        ctx.add_stream(BroadcastStream::new(self.app_state.signing.subscribe()));
        self.publish();
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        info!(session_id = %self.id, "Session controller stopped");
    }
}

impl Handler<SessionCommand> for SessionController {
    type Result = ();

    fn handle(&mut self, command: SessionCommand, ctx: &mut Self::Context) {
        match command {
            SessionCommand::Start { microphone } => self.start_session(microphone, ctx),
            SessionCommand::Stop => self.stop_session(ctx),
            SessionCommand::ToggleMute => {
                self.muted = !self.muted;
                self.ports.engine.set_muted(self.muted);
            }
            SessionCommand::Engine(event) => self.on_engine_event(event, ctx),
            SessionCommand::FormInput { email, name } => self.mediator.update_form(email, name),
            SessionCommand::SubmitForm => match self.mediator.submit_form() {
                Ok(actions) => {
                    debug!(
                        session_id = %self.id,
                        call_id = ?self.mediator.pending_call_id(),
                        "Signing form submitted"
                    );
                    self.apply(actions, ctx)
                }
                Err(err) => debug!(session_id = %self.id, error = %err, "Form rejected"),
            },
            SessionCommand::DismissForm => self.mediator.dismiss_form(),
            SessionCommand::Shutdown => {
                if self.state != SessionState::Idle || self.renderer_ready {
                    self.stop_session(ctx);
                }
                ctx.stop();
                return;
            }
        }
        self.publish();
    }
}

impl Handler<GetView> for SessionController {
    type Result = MessageResult<GetView>;

    fn handle(&mut self, _msg: GetView, _ctx: &mut Self::Context) -> Self::Result {
        MessageResult(self.view())
    }
}

/// Frames of the bound remote track.
impl StreamHandler<Vec<f32>> for SessionController {
    fn handle(&mut self, samples: Vec<f32>, _ctx: &mut Self::Context) {
        if !self.renderer_ready {
            return;
        }
        if let Some(pipeline) = self.pipeline.as_mut() {
            for frame in pipeline.on_frame(&samples) {
                self.ports.renderer.send_audio(&frame.samples);
            }
        }
    }

    fn finished(&mut self, _ctx: &mut Self::Context) {
        debug!(session_id = %self.id, "Remote audio track closed");
        self.frame_stream = None;
    }
}

/// Completion notices from the signing redirect page.
impl StreamHandler<Result<SigningNotice, BroadcastStreamRecvError>> for SessionController {
    fn handle(&mut self, item: Result<SigningNotice, BroadcastStreamRecvError>, ctx: &mut Self::Context) {
        match item {
            Ok(notice) => self.on_signing_notice(notice, ctx),
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                warn!(session_id = %self.id, skipped, "Missed signing notices")
            }
        }
    }

    fn finished(&mut self, _ctx: &mut Self::Context) {
        debug!(session_id = %self.id, "Signing channel closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::assistant::EngineTarget;
    use crate::error::AppResult;
    use crate::gateway::client::SigningLinkResult;
    use crate::gateway::store::ConversationRecord;
    use crate::tools::mediator::{form_success_message, APOLOGY_MESSAGE, FORM_OPENED_MESSAGE};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        EngineStart(&'static str),
        EngineStop,
        Muted(bool),
        Result(String, String),
        RendererInit,
        RendererStart,
        RendererStop,
        Audio(usize),
        Rate(f32),
        Unmute,
        Release,
        OpenUrl(String),
        LinkRequested(String),
        StatusUpdated(String, String),
        ConversationSaved(String),
    }

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<Call>>,
        views: Mutex<Vec<SessionView>>,
    }

    impl Recorder {
        fn push(&self, call: Call) {
            self.calls.lock().unwrap().push(call);
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn results(&self) -> Vec<(String, String)> {
            self.calls()
                .into_iter()
                .filter_map(|call| match call {
                    Call::Result(id, message) => Some((id, message)),
                    _ => None,
                })
                .collect()
        }

        fn count(&self, predicate: impl Fn(&Call) -> bool) -> usize {
            self.calls().iter().filter(|call| predicate(call)).count()
        }

        fn position(&self, call: &Call) -> usize {
            self.calls()
                .iter()
                .position(|recorded| recorded == call)
                .unwrap_or_else(|| panic!("{:?} was never recorded", call))
        }
    }

    struct FakeEngine {
        log: Arc<Recorder>,
        reject_assistant_id: bool,
    }

    #[async_trait]
    impl ConversationEngine for FakeEngine {
        async fn start(&self, target: EngineTarget) -> AppResult<()> {
            self.log.push(Call::EngineStart(target.describe()));
            match target {
                EngineTarget::Assistant { .. } if self.reject_assistant_id => {
                    Err(AppError::EngineConnection("assistant not found".to_string()))
                }
                _ => Ok(()),
            }
        }

        fn stop(&self) -> AppResult<()> {
            self.log.push(Call::EngineStop);
            Err(AppError::EngineConnection("no call to stop".to_string()))
        }

        fn set_muted(&self, muted: bool) {
            self.log.push(Call::Muted(muted));
        }

        fn send_result(&self, call_id: &str, result: &str) {
            self.log.push(Call::Result(call_id.to_string(), result.to_string()));
        }
    }

    struct FakeRenderer(Arc<Recorder>);

    impl AvatarRenderer for FakeRenderer {
        fn initialize(&self, _settings: &RendererSettings) -> AppResult<()> {
            self.0.push(Call::RendererInit);
            Ok(())
        }

        fn start(&self) -> AppResult<()> {
            self.0.push(Call::RendererStart);
            Ok(())
        }

        fn stop(&self) -> AppResult<()> {
            self.0.push(Call::RendererStop);
            Ok(())
        }

        fn send_audio(&self, samples: &[i16]) {
            self.0.push(Call::Audio(samples.len()));
        }

        fn set_playback_rate(&self, rate: f32) {
            self.0.push(Call::Rate(rate));
        }

        fn unmute_playback(&self) {
            self.0.push(Call::Unmute);
        }
    }

    /// Hands out the track on the `available_on`-th lookup.
    struct FakeRemoteAudio {
        log: Arc<Recorder>,
        track: Mutex<Option<RemoteAudioTrack>>,
        lookups: Mutex<usize>,
        available_on: usize,
    }

    impl RemoteAudioSource for FakeRemoteAudio {
        fn remote_audio_track(&self) -> Option<RemoteAudioTrack> {
            let mut lookups = self.lookups.lock().unwrap();
            *lookups += 1;
            if *lookups >= self.available_on {
                self.track.lock().unwrap().take()
            } else {
                None
            }
        }

        fn release(&self) {
            self.log.push(Call::Release);
        }
    }

    struct FakeView(Arc<Recorder>);

    impl ViewSink for FakeView {
        fn publish(&self, view: &SessionView) {
            self.0.views.lock().unwrap().push(view.clone());
        }

        fn open_url(&self, url: &str) {
            self.0.push(Call::OpenUrl(url.to_string()));
        }
    }

    struct FakeGateway {
        log: Arc<Recorder>,
        fail_with: Option<String>,
    }

    #[async_trait]
    impl SigningGateway for FakeGateway {
        async fn create_signing_link(&self, request: SigningLinkRequest) -> AppResult<SigningLinkResult> {
            self.log.push(Call::LinkRequested(request.email.clone()));
            match &self.fail_with {
                Some(message) => Err(AppError::ExternalService(message.clone())),
                None => Ok(SigningLinkResult {
                    link: "https://sign/1".to_string(),
                    document_id: "doc-1".to_string(),
                    expires_at: None,
                }),
            }
        }

        async fn update_signing_status(&self, document_id: &str, status: &str) -> AppResult<()> {
            self.log.push(Call::StatusUpdated(document_id.to_string(), status.to_string()));
            Ok(())
        }

        async fn save_conversation(&self, record: &ConversationRecord) -> AppResult<()> {
            self.log.push(Call::ConversationSaved(record.transcript.clone()));
            Ok(())
        }
    }

    struct Harness {
        addr: Addr<SessionController>,
        log: Arc<Recorder>,
        frames: mpsc::UnboundedSender<Vec<f32>>,
        app_state: AppState,
    }

    fn test_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.avatar.api_key = "avatar-key".to_string();
        config.engine.public_key = "engine-key".to_string();
        config.sync.drift_poll_ms = 20;
        config.sync.track_retry_ms = 20;
        config.tools.fallback_debounce_ms = 40;
        config.tools.success_banner_ms = 60;
        config
    }

    struct Options {
        config: AppConfig,
        reject_assistant_id: bool,
        gateway_error: Option<String>,
        track_available_on: usize,
    }

    impl Default for Options {
        fn default() -> Self {
            Self {
                config: test_config(),
                reject_assistant_id: false,
                gateway_error: None,
                track_available_on: 1,
            }
        }
    }

    fn spawn_session(options: Options) -> Harness {
        let log = Arc::new(Recorder::default());
        let (frames, rx) = mpsc::unbounded_channel();
        let app_state = AppState::new(options.config.clone());

        let ports = SessionPorts {
            engine: Arc::new(FakeEngine {
                log: log.clone(),
                reject_assistant_id: options.reject_assistant_id,
            }),
            renderer: Arc::new(FakeRenderer(log.clone())),
            remote_audio: Arc::new(FakeRemoteAudio {
                log: log.clone(),
                track: Mutex::new(Some(RemoteAudioTrack {
                    id: "remote-1".to_string(),
                    frames: rx,
                })),
                lookups: Mutex::new(0),
                available_on: options.track_available_on,
            }),
            view: Arc::new(FakeView(log.clone())),
            gateway: Arc::new(FakeGateway {
                log: log.clone(),
                fail_with: options.gateway_error,
            }),
            clock: Arc::new(crate::audio::clock::MonotonicClock::new()),
        };

        let addr = SessionController::new(options.config, ports, app_state.clone()).start();
        Harness {
            addr,
            log,
            frames,
            app_state,
        }
    }

    async fn settle(ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    impl Harness {
        async fn send(&self, command: SessionCommand) {
            self.addr.send(command).await.unwrap();
        }

        async fn event(&self, event: EngineEvent) {
            self.send(SessionCommand::Engine(event)).await;
        }

        async fn view(&self) -> SessionView {
            self.addr.send(GetView).await.unwrap()
        }

        async fn start_call(&self) {
            self.send(SessionCommand::Start {
                microphone: MicrophoneStatus::Granted,
            })
            .await;
            settle(10).await;
            self.event(EngineEvent::CallStart {
                call_id: Some("call-1".to_string()),
            })
            .await;
        }
    }

    fn function_call(id: &str, email: Option<&str>) -> EngineEvent {
        let mut parameters = json!({});
        if let Some(email) = email {
            parameters = json!({ "email": email, "name": "Jane Doe" });
        }
        EngineEvent::FunctionCall {
            payload: json!({
                "functionCall": { "id": id, "name": "get_contract_signing_link", "parameters": parameters }
            }),
        }
    }

    fn assistant_says(text: &str) -> EngineEvent {
        EngineEvent::Message {
            payload: json!({ "type": "transcript", "role": "assistant", "transcriptType": "final", "transcript": text }),
        }
    }

    #[actix_web::test]
    async fn test_start_binds_track_and_streams_audio() {
        let h = spawn_session(Options::default());
        h.start_call().await;

        let view = h.view().await;
        assert_eq!(view.state, SessionState::Connected);
        assert_eq!(h.log.count(|c| *c == Call::EngineStart("inline assistant")), 1);
        assert_eq!(h.log.count(|c| *c == Call::Unmute), 1);
        assert_eq!(h.log.count(|c| *c == Call::Rate(RATE_NORMAL)), 1);

        // One loud frame is released by the pacer tick once it is due
        h.frames.send(vec![0.2; 512]).unwrap();
        settle(150).await;
        assert!(h.log.count(|c| matches!(c, Call::Audio(512))) >= 1);

        // Silent frames never reach the renderer
        let before = h.log.count(|c| matches!(c, Call::Audio(_)));
        h.frames.send(vec![0.0; 512]).unwrap();
        settle(100).await;
        assert_eq!(h.log.count(|c| matches!(c, Call::Audio(_))), before);
    }

    #[actix_web::test]
    async fn test_assistant_id_failure_falls_back_to_inline() {
        let mut config = test_config();
        config.engine.assistant_id = "asst_123".to_string();
        let h = spawn_session(Options {
            config,
            reject_assistant_id: true,
            ..Options::default()
        });

        h.send(SessionCommand::Start {
            microphone: MicrophoneStatus::Granted,
        })
        .await;
        settle(20).await;

        assert_eq!(
            h.log.calls().into_iter().filter(|c| matches!(c, Call::EngineStart(_))).collect::<Vec<_>>(),
            vec![Call::EngineStart("assistant id"), Call::EngineStart("inline assistant")]
        );
        let view = h.view().await;
        assert_eq!(view.state, SessionState::Connecting);
        assert!(view.error.is_none());
    }

    #[actix_web::test]
    async fn test_missing_keys_fail_start() {
        let mut config = test_config();
        config.avatar.api_key.clear();
        let h = spawn_session(Options {
            config,
            ..Options::default()
        });

        h.send(SessionCommand::Start {
            microphone: MicrophoneStatus::Granted,
        })
        .await;

        let view = h.view().await;
        assert_eq!(view.state, SessionState::Idle);
        assert_eq!(view.error.as_deref(), Some(MISSING_KEYS_MESSAGE));
        assert_eq!(h.log.count(|c| matches!(c, Call::EngineStart(_))), 0);
    }

    #[actix_web::test]
    async fn test_microphone_failures() {
        let h = spawn_session(Options::default());
        h.send(SessionCommand::Start {
            microphone: MicrophoneStatus::Denied,
        })
        .await;
        let view = h.view().await;
        assert_eq!(view.state, SessionState::Error);
        assert!(view.mic_denied);
        assert!(view.error.is_none());

        // Start is only accepted from idle
        h.send(SessionCommand::Stop).await;
        h.send(SessionCommand::Start {
            microphone: MicrophoneStatus::NotFound,
        })
        .await;
        let view = h.view().await;
        assert!(!view.mic_denied);
        assert_eq!(view.error.as_deref(), Some(NO_MICROPHONE_MESSAGE));

        h.send(SessionCommand::Stop).await;
        h.send(SessionCommand::Start {
            microphone: MicrophoneStatus::Unsupported,
        })
        .await;
        assert_eq!(h.view().await.error.as_deref(), Some(MICROPHONE_UNSUPPORTED_MESSAGE));

        h.send(SessionCommand::Stop).await;
        h.send(SessionCommand::Start {
            microphone: MicrophoneStatus::Failed,
        })
        .await;
        assert_eq!(h.view().await.error.as_deref(), Some(MICROPHONE_FAILED_MESSAGE));
        assert_eq!(h.log.count(|c| matches!(c, Call::EngineStart(_))), 0);
    }

    #[actix_web::test]
    async fn test_track_lookup_retries_once() {
        let h = spawn_session(Options {
            track_available_on: 2,
            ..Options::default()
        });
        h.start_call().await;
        assert_eq!(h.log.count(|c| matches!(c, Call::Rate(_))), 0);

        settle(60).await;
        assert_eq!(h.log.count(|c| *c == Call::Rate(RATE_NORMAL)), 1);
    }

    #[actix_web::test]
    async fn test_speech_and_output_drive_state() {
        let h = spawn_session(Options::default());
        h.start_call().await;

        h.event(EngineEvent::SpeechStart).await;
        assert_eq!(h.view().await.state, SessionState::Listening);
        h.event(EngineEvent::SpeechEnd).await;
        assert_eq!(h.view().await.state, SessionState::Connected);

        h.event(EngineEvent::ModelOutput { content: "   ".to_string() }).await;
        assert_eq!(h.view().await.state, SessionState::Connected);

        h.event(assistant_says("Welcome aboard")).await;
        let view = h.view().await;
        assert_eq!(view.state, SessionState::Speaking);
        assert_eq!(view.transcript, "Welcome aboard");
    }

    #[actix_web::test]
    async fn test_stop_then_error_is_discarded() {
        let h = spawn_session(Options::default());
        h.send(SessionCommand::Start {
            microphone: MicrophoneStatus::Granted,
        })
        .await;
        h.send(SessionCommand::Stop).await;
        h.event(EngineEvent::Error {
            payload: json!({ "errorMsg": "Meeting has ended" }),
        })
        .await;

        let view = h.view().await;
        assert_eq!(view.state, SessionState::Idle);
        assert!(view.error.is_none());
        // The engine stop failure is swallowed
        assert_eq!(h.log.count(|c| *c == Call::EngineStop), 1);
        assert_eq!(h.log.count(|c| *c == Call::RendererStop), 1);
        assert_eq!(h.log.count(|c| *c == Call::Release), 1);
    }

    #[actix_web::test]
    async fn test_stop_tears_down_engine_then_renderer_then_audio() {
        let h = spawn_session(Options::default());
        h.start_call().await;
        h.send(SessionCommand::Stop).await;

        let engine = h.log.position(&Call::EngineStop);
        let renderer = h.log.position(&Call::RendererStop);
        let release = h.log.position(&Call::Release);
        assert!(engine < renderer, "engine must stop before the renderer");
        assert!(renderer < release, "renderer must stop before the audio graph is released");
    }

    #[actix_web::test]
    async fn test_stop_resets_signing_state_and_call_ledger() {
        let h = spawn_session(Options::default());
        h.start_call().await;
        h.event(assistant_says("Here is your contract")).await;
        h.event(function_call("call_1", Some("a@b.com"))).await;
        settle(20).await;
        h.event(function_call("call_7", None)).await;

        let view = h.view().await;
        assert!(view.signing_link.is_some());
        assert!(view.form.visible);
        assert!(!view.transcript.is_empty());

        h.send(SessionCommand::Stop).await;
        let view = h.view().await;
        assert_eq!(view.state, SessionState::Idle);
        assert!(view.signing_link.is_none());
        assert!(view.signing_link_error.is_none());
        assert!(!view.form.visible);
        assert!(view.transcript.is_empty());

        // A reused call id is mediated again after the reset
        h.start_call().await;
        h.event(function_call("call_1", Some("a@b.com"))).await;
        settle(20).await;

        assert_eq!(h.log.count(|c| matches!(c, Call::LinkRequested(_))), 2);
        assert_eq!(h.log.results().iter().filter(|(id, _)| id == "call_1").count(), 2);
        assert_eq!(h.view().await.signing_link.unwrap().url, "https://sign/1");
    }

    #[actix_web::test]
    async fn test_engine_error_shows_banner() {
        let h = spawn_session(Options::default());
        h.start_call().await;
        h.event(EngineEvent::Error {
            payload: json!({ "error": { "message": "Daily room expired" } }),
        })
        .await;

        let view = h.view().await;
        assert_eq!(view.state, SessionState::Error);
        assert_eq!(view.error.as_deref(), Some("Daily room expired"));
    }

    #[actix_web::test]
    async fn test_missing_email_opens_form_and_acknowledges_once() {
        let h = spawn_session(Options::default());
        h.start_call().await;

        h.event(function_call("call_1", None)).await;
        h.event(EngineEvent::Message {
            payload: json!({
                "type": "tool-calls",
                "toolCalls": [{ "id": "call_1", "function": { "name": "get_contract_signing_link", "arguments": "{}" } }]
            }),
        })
        .await;
        settle(10).await;

        assert!(h.view().await.form.visible);
        assert_eq!(h.log.results(), vec![("call_1".to_string(), FORM_OPENED_MESSAGE.to_string())]);
        assert_eq!(h.log.count(|c| matches!(c, Call::LinkRequested(_))), 0);
    }

    #[actix_web::test]
    async fn test_form_submission_acknowledges_with_email_and_name() {
        let h = spawn_session(Options::default());
        h.start_call().await;
        h.event(function_call("call_1", None)).await;

        h.send(SessionCommand::FormInput {
            email: "a@b.com".to_string(),
            name: "Jane Doe".to_string(),
        })
        .await;
        h.send(SessionCommand::SubmitForm).await;
        settle(20).await;

        assert_eq!(h.log.count(|c| matches!(c, Call::LinkRequested(_))), 1);
        assert_eq!(h.log.count(|c| *c == Call::OpenUrl("https://sign/1".to_string())), 1);

        let results = h.log.results();
        assert_eq!(results.len(), 2);
        assert_eq!(results[1], ("call_1".to_string(), form_success_message("a@b.com", "Jane Doe")));

        let view = h.view().await;
        assert!(!view.form.visible);
        assert!(view.form.email.is_empty());
        assert_eq!(view.signing_link.unwrap().url, "https://sign/1");
        assert_eq!(h.app_state.get_metrics_snapshot().signing_links_created, 1);
    }

    #[actix_web::test]
    async fn test_gateway_failure_stays_local() {
        let h = spawn_session(Options {
            gateway_error: Some("Invalid email".to_string()),
            ..Options::default()
        });
        h.start_call().await;
        h.event(function_call("call_9", Some("bad@example.com"))).await;
        settle(20).await;

        let view = h.view().await;
        assert_eq!(view.signing_link_error.as_deref(), Some("Invalid email"));
        assert!(view.signing_link.is_none());
        assert!(!view.creating_signing_link);
        assert_eq!(h.log.results(), vec![("call_9".to_string(), APOLOGY_MESSAGE.to_string())]);
    }

    #[actix_web::test]
    async fn test_keyword_fallback_opens_form() {
        let h = spawn_session(Options::default());
        h.start_call().await;
        h.event(assistant_says("Let me get your enrollment agreement ready")).await;
        assert!(!h.view().await.form.visible);

        settle(80).await;
        assert!(h.view().await.form.visible);
        assert!(h.log.results().is_empty());
    }

    #[actix_web::test]
    async fn test_tool_call_preempts_keyword_fallback() {
        let h = spawn_session(Options::default());
        h.start_call().await;
        h.event(assistant_says("I can send you the contract")).await;
        h.event(function_call("call_1", Some("a@b.com"))).await;

        settle(80).await;
        let view = h.view().await;
        assert!(!view.form.visible);
        assert_eq!(view.signing_link.unwrap().document_id, "doc-1");
    }

    #[actix_web::test]
    async fn test_contract_signed_notice_clears_link_and_banner() {
        let h = spawn_session(Options::default());
        h.start_call().await;
        h.event(function_call("call_1", Some("a@b.com"))).await;
        settle(20).await;
        assert!(h.view().await.signing_link.is_some());

        h.app_state.signing.publish(SigningNotice::contract_signed(None));
        settle(20).await;

        let view = h.view().await;
        assert!(view.contract_signed);
        assert!(view.signing_link.is_none());
        assert!(view.signing_link_error.is_none());
        assert_eq!(h.log.count(|c| *c == Call::StatusUpdated("doc-1".into(), "signed".into())), 1);

        settle(100).await;
        assert!(!h.view().await.contract_signed);
    }

    #[actix_web::test]
    async fn test_notice_for_other_document_is_ignored() {
        let h = spawn_session(Options::default());
        h.start_call().await;
        h.event(function_call("call_1", Some("a@b.com"))).await;
        settle(20).await;

        h.app_state.signing.publish(SigningNotice::contract_signed(Some("doc-other".to_string())));
        settle(20).await;

        let view = h.view().await;
        assert!(!view.contract_signed);
        assert!(view.signing_link.is_some());
    }

    #[actix_web::test]
    async fn test_call_end_persists_conversation() {
        let h = spawn_session(Options::default());
        h.start_call().await;
        h.event(assistant_says("Hi! How can I help?")).await;
        h.event(EngineEvent::Message {
            payload: json!({ "type": "transcript", "role": "user", "transcriptType": "partial", "transcript": "I wa" }),
        })
        .await;
        h.event(EngineEvent::CallEnd).await;
        settle(20).await;

        assert_eq!(h.view().await.state, SessionState::Idle);
        assert_eq!(
            h.log.calls().into_iter().filter(|c| matches!(c, Call::ConversationSaved(_))).collect::<Vec<_>>(),
            vec![Call::ConversationSaved("Assistant: Hi! How can I help?".to_string())]
        );
    }

    #[actix_web::test]
    async fn test_toggle_mute() {
        let h = spawn_session(Options::default());
        h.send(SessionCommand::ToggleMute).await;
        assert!(h.view().await.muted);
        h.send(SessionCommand::ToggleMute).await;
        assert_eq!(h.log.count(|c| matches!(c, Call::Muted(_))), 2);
        assert!(!h.view().await.muted);
    }
}
