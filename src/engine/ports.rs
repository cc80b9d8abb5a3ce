//! # Collaborator Ports
//!
//! The session controller drives three opaque collaborators and one presentation
//! sink through these traits. The WebSocket relay implements all of them; tests
//! use recording fakes.
//!
//! ## Failure model:
//! - `ConversationEngine::start` may fail (the controller retries once with an inline assistant)
//! - `stop` methods may fail; the controller swallows those as teardown errors
//! - audio, rate and view updates are fire-and-forget

use crate::engine::assistant::EngineTarget;
use crate::error::AppResult;
use crate::session::view::SessionView;
use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;

#[async_trait]
pub trait ConversationEngine: Send + Sync {
    /// Start a call; resolves once the engine accepted or rejected the target.
    async fn start(&self, target: EngineTarget) -> AppResult<()>;

    fn stop(&self) -> AppResult<()>;

    fn set_muted(&self, muted: bool);

    /// Deliver a function-call result, keyed by call id.
    fn send_result(&self, call_id: &str, result: &str);
}

/// Settings handed to the renderer when it is initialized.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RendererSettings {
    pub api_key: String,
    pub face_id: String,
    /// The renderer fills silences itself; gated frames are never sent.
    pub handle_silence: bool,
}

pub trait AvatarRenderer: Send + Sync {
    fn initialize(&self, settings: &RendererSettings) -> AppResult<()>;

    fn start(&self) -> AppResult<()>;

    fn stop(&self) -> AppResult<()>;

    /// Push one released frame of 16-bit PCM.
    fn send_audio(&self, samples: &[i16]);

    fn set_playback_rate(&self, rate: f32);

    /// Unmute and start playback of the renderer's own audio element.
    fn unmute_playback(&self);
}

/// The engine's remote voice track, once bound.
#[derive(Debug)]
pub struct RemoteAudioTrack {
    pub id: String,
    /// f32 frames in capture order; the sender side closes on release.
    pub frames: mpsc::UnboundedReceiver<Vec<f32>>,
}

/// Lookup of the engine's remote audio track.
pub trait RemoteAudioSource: Send + Sync {
    /// Bind the remote track if it is available yet.
    fn remote_audio_track(&self) -> Option<RemoteAudioTrack>;

    /// Stop delivering frames for the bound track.
    fn release(&self);
}

/// Where session snapshots and link openings go.
pub trait ViewSink: Send + Sync {
    fn publish(&self, view: &SessionView);

    fn open_url(&self, url: &str);
}
