//! # Configuration Management
//!
//! This module handles loading and managing application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Key Rust Concepts Used:
//! - **Serde**: Serialization/deserialization library for converting between Rust structs and data formats
//! - **derive macros**: Automatically generate code for common traits (Debug, Clone, Serialize, Deserialize)
//! - **impl blocks**: Add methods to structs
//! - **Result<T, E>**: Error handling that forces you to handle potential failures
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Environment variables (APP_SERVER__HOST, APP_SYNC__TARGET_LATENCY_MS, etc.)
//! 2. Configuration file (config.toml)
//! 3. Default values (defined in the Default impl)

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

/// Upper bound for the adaptive gain; quieter speech is never boosted further.
pub const MAX_GAIN_CEILING: f32 = 2.0;

/// Drift corrections never run more often than this.
pub const MIN_DRIFT_CHECK_INTERVAL_MS: u64 = 2000;

/// Main application configuration that contains all settings.
///
/// ## Why separate config structs:
/// The audio pipeline, the sync loop, the tool mediator and the external
/// services are tuned independently, so each gets its own section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub audio: AudioConfig,
    pub sync: SyncConfig,
    pub tools: ToolsConfig,
    pub avatar: AvatarConfig,
    pub engine: EngineConfig,
    pub signing: SigningConfig,
    pub performance: PerformanceConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Capture, silence gate and gain normalizer settings.
///
/// ## Fields:
/// - `sample_rate`: capture rate of the remote voice track (16 kHz mono)
/// - `frame_size`: samples per processing frame (512 samples = 32 ms at 16 kHz)
/// - `silence_threshold`: frames with RMS below this are dropped
/// - `target_rms` / `max_gain`: adaptive gain targets
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub frame_size: usize,
    pub silence_threshold: f32,
    pub target_rms: f32,
    pub max_gain: f32,
}

impl AudioConfig {
    /// Duration of one frame in milliseconds (512 / 16000 * 1000 = 32 ms).
    pub fn frame_duration_ms(&self) -> f64 {
        self.frame_size as f64 / self.sample_rate as f64 * 1000.0
    }
}

/// Jitter buffer and drift corrector timing.
///
/// ## Trade-off:
/// A larger `target_latency_ms` absorbs more jitter but delays the avatar's
/// lips relative to the engine's voice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    pub target_latency_ms: u64,
    pub drift_check_interval_ms: u64,
    pub drift_poll_ms: u64,
    pub track_retry_ms: u64,
}

/// Tool mediator timers and the transcript keywords that arm the form fallback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    pub fallback_debounce_ms: u64,
    pub success_banner_ms: u64,
    pub fallback_keywords: Vec<String>,
}

/// Avatar renderer credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AvatarConfig {
    pub api_key: String,
    pub face_id: String,
}

/// Conversational engine credentials and the inline assistant used when the
/// configured assistant id cannot be started.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub public_key: String,
    pub assistant_id: String,
    pub assistant_name: String,
    pub model_provider: String,
    pub model: String,
    pub voice_provider: String,
    pub voice_id: String,
    pub transcriber_provider: String,
    pub transcriber_model: String,
    pub language: String,
    pub system_prompt: String,
    pub first_message: String,
    pub end_call_message: String,
}

/// Signing provider and gateway endpoints.
///
/// ## Fields:
/// - `api_key` / `template_id`: provider credentials used by the gateway routes
/// - `provider_base_url`: provider API root (a trailing `/v1` is added if missing)
/// - `frontend_url`: where the provider redirects after signing
/// - `gateway_url`: base URL the session controller uses to reach the gateway routes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SigningConfig {
    pub api_key: String,
    pub template_id: String,
    pub provider_base_url: String,
    pub frontend_url: String,
    pub gateway_url: String,
}

/// Performance tuning configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    pub max_concurrent_sessions: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            audio: AudioConfig {
                sample_rate: 16000,        // 16 kHz mono voice
                frame_size: 512,           // 32 ms frames
                silence_threshold: 0.01,
                target_rms: 0.25,
                max_gain: 2.0,
            },
            sync: SyncConfig {
                target_latency_ms: 60,
                drift_check_interval_ms: 2000,
                drift_poll_ms: 100,
                track_retry_ms: 200,
            },
            tools: ToolsConfig {
                fallback_debounce_ms: 1500,
                success_banner_ms: 5000,
                fallback_keywords: vec![
                    "contract".to_string(),
                    "sign".to_string(),
                    "signing".to_string(),
                    "enrollment agreement".to_string(),
                    "sign the".to_string(),
                ],
            },
            avatar: AvatarConfig {
                api_key: String::new(),
                face_id: String::new(),
            },
            engine: EngineConfig {
                public_key: String::new(),
                assistant_id: String::new(),
                assistant_name: "Enrollment Assistant".to_string(),
                model_provider: "openai".to_string(),
                model: "gpt-4o".to_string(),
                voice_provider: "vapi".to_string(),
                voice_id: "Kylie".to_string(),
                transcriber_provider: "deepgram".to_string(),
                transcriber_model: "nova-2".to_string(),
                language: "en".to_string(),
                system_prompt: "You are a friendly virtual assistant helping customers learn about \
                                the product and complete their enrollment."
                    .to_string(),
                first_message: "Hi! I'm here to help. What would you like to know?".to_string(),
                end_call_message: "Thanks for chatting!".to_string(),
            },
            signing: SigningConfig {
                api_key: String::new(),
                template_id: String::new(),
                provider_base_url: "https://api.boldsign.com/v1".to_string(),
                frontend_url: "http://localhost:3000".to_string(),
                gateway_url: "http://127.0.0.1:8080/api".to_string(),
            },
            performance: PerformanceConfig {
                max_concurrent_sessions: 10,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Configuration Loading Process:
    /// 1. Start with built-in defaults
    /// 2. Override with values from config.toml (if it exists)
    /// 3. Override with environment variables prefixed with APP_
    /// 4. Handle special cases for HOST and PORT environment variables
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=3000`: Override server port
    /// - `APP_SIGNING__API_KEY=...`: Provider key for the gateway routes
    /// - `APP_SYNC__TARGET_LATENCY_MS=80`: Larger jitter buffer
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            // Double underscore separates sections so field names may keep single underscores
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - Server port is not 0
    /// - Audio frames are non-empty and sampled at a non-zero rate
    /// - Gain targets are positive and the gain ceiling lies in [1.0, 2.0]
    /// - Jitter latency is non-zero and drift checks are at least 2 s apart
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.audio.sample_rate == 0 || self.audio.frame_size == 0 {
            return Err(anyhow::anyhow!("Audio sample rate and frame size must be greater than 0"));
        }

        if self.audio.target_rms <= 0.0 || self.audio.silence_threshold < 0.0 {
            return Err(anyhow::anyhow!("Target RMS must be positive and silence threshold non-negative"));
        }

        if !(1.0..=MAX_GAIN_CEILING).contains(&self.audio.max_gain) {
            return Err(anyhow::anyhow!(
                "Max gain must be between 1.0 and {}",
                MAX_GAIN_CEILING
            ));
        }

        if self.sync.target_latency_ms == 0 {
            return Err(anyhow::anyhow!("Target latency must be greater than 0"));
        }

        if self.sync.drift_check_interval_ms < MIN_DRIFT_CHECK_INTERVAL_MS {
            return Err(anyhow::anyhow!(
                "Drift check interval must be at least {} ms",
                MIN_DRIFT_CHECK_INTERVAL_MS
            ));
        }

        if self.sync.drift_poll_ms == 0 {
            return Err(anyhow::anyhow!("Drift poll interval must be greater than 0"));
        }

        if self.performance.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        Ok(())
    }

    /// Update configuration from a JSON string (used for runtime config updates).
    ///
    /// ## Partial updates:
    /// Only the fields present in the JSON are changed. For example, sending
    /// `{"sync": {"target_latency_ms": 80}}` changes only the jitter target.
    /// New sessions pick the change up; running sessions keep their settings.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial_config: serde_json::Value = serde_json::from_str(json_str)?;

        if let Some(server) = partial_config.get("server") {
            if let Some(host) = server.get("host").and_then(|v| v.as_str()) {
                self.server.host = host.to_string();
            }
            if let Some(port) = server.get("port").and_then(|v| v.as_u64()) {
                self.server.port = port as u16;
            }
        }

        if let Some(audio) = partial_config.get("audio") {
            if let Some(threshold) = audio.get("silence_threshold").and_then(|v| v.as_f64()) {
                self.audio.silence_threshold = threshold as f32;
            }
            if let Some(target) = audio.get("target_rms").and_then(|v| v.as_f64()) {
                self.audio.target_rms = target as f32;
            }
            if let Some(gain) = audio.get("max_gain").and_then(|v| v.as_f64()) {
                self.audio.max_gain = gain as f32;
            }
        }

        if let Some(sync) = partial_config.get("sync") {
            if let Some(latency) = sync.get("target_latency_ms").and_then(|v| v.as_u64()) {
                self.sync.target_latency_ms = latency;
            }
            if let Some(interval) = sync.get("drift_check_interval_ms").and_then(|v| v.as_u64()) {
                self.sync.drift_check_interval_ms = interval;
            }
        }

        if let Some(tools) = partial_config.get("tools") {
            if let Some(debounce) = tools.get("fallback_debounce_ms").and_then(|v| v.as_u64()) {
                self.tools.fallback_debounce_ms = debounce;
            }
            if let Some(banner) = tools.get("success_banner_ms").and_then(|v| v.as_u64()) {
                self.tools.success_banner_ms = banner;
            }
        }

        if let Some(performance) = partial_config.get("performance") {
            if let Some(sessions) = performance.get("max_concurrent_sessions").and_then(|v| v.as_u64()) {
                self.performance.max_concurrent_sessions = sessions as usize;
            }
        }

        self.validate()?;
        Ok(())
    }
}
