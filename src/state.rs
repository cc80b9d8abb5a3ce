//! # Application State
//!
//! Shared by every HTTP handler and every session actor.
//!
//! ## Contents:
//! - **config**: runtime-updatable configuration; sessions copy it when they start
//! - **metrics**: request, session and signing counters
//! - **contracts / conversations**: in-memory persistence behind the gateway routes
//! - **signing**: the completion broadcast channel every session subscribes to
//!
//! Locks are `std::sync::RwLock`s held only for a copy or an increment. A poisoned
//! lock still holds consistent counters, so readers recover the guard instead of
//! panicking.

use crate::config::AppConfig;
use crate::gateway::broadcast::SigningChannel;
use crate::gateway::store::{ContractStore, ConversationStore};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

#[derive(Debug, Clone)]
pub struct AppState {
    pub config: Arc<RwLock<AppConfig>>,
    pub metrics: Arc<RwLock<AppMetrics>>,
    pub contracts: ContractStore,
    pub conversations: ConversationStore,
    pub signing: SigningChannel,
    pub start_time: Instant,
}

/// Counters collected since server start.
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    pub request_count: u64,
    pub error_count: u64,

    /// Open avatar sessions (one per websocket).
    pub active_sessions: u32,

    /// Tool calls answered with a function-call result.
    pub tool_calls_resolved: u64,
    pub signing_links_created: u64,
    pub contracts_signed: u64,

    /// Key: "METHOD /path"
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            contracts: ContractStore::new(),
            conversations: ConversationStore::new(),
            signing: SigningChannel::new(),
            start_time: Instant::now(),
        }
    }

    fn read_metrics(&self) -> RwLockReadGuard<'_, AppMetrics> {
        self.metrics.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_metrics(&self) -> RwLockWriteGuard<'_, AppMetrics> {
        self.metrics.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Copy of the current configuration; the lock is released before returning.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Replace the configuration if it validates.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        new_config.validate().map_err(|e| e.to_string())?;
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = new_config;
        Ok(())
    }

    pub fn increment_request_count(&self) {
        self.write_metrics().request_count += 1;
    }

    pub fn increment_error_count(&self) {
        self.write_metrics().error_count += 1;
    }

    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.write_metrics();
        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();
        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// Reserve a session slot.
    ///
    /// ## Returns:
    /// `false` when `max_concurrent_sessions` are already open; nothing is reserved then.
    pub fn try_acquire_session(&self) -> bool {
        let limit = self.get_config().performance.max_concurrent_sessions;
        let mut metrics = self.write_metrics();
        if metrics.active_sessions as usize >= limit {
            return false;
        }
        metrics.active_sessions += 1;
        true
    }

    pub fn release_session(&self) {
        let mut metrics = self.write_metrics();
        metrics.active_sessions = metrics.active_sessions.saturating_sub(1);
    }

    pub fn increment_tool_calls_resolved(&self) {
        self.write_metrics().tool_calls_resolved += 1;
    }

    pub fn increment_signing_links_created(&self) {
        self.write_metrics().signing_links_created += 1;
    }

    pub fn increment_contracts_signed(&self) {
        self.write_metrics().contracts_signed += 1;
    }

    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.read_metrics().clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl AppMetrics {
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}
