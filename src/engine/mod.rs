//! # Conversational Engine and Renderer Integration
//!
//! ## Key Components:
//! - **events**: engine event types, transcript extraction, error classification
//! - **assistant**: start targets (assistant id, inline fallback definition)
//! - **ports**: traits for the engine, the avatar renderer, the remote audio track and the view

pub mod assistant;
pub mod events;
pub mod ports;
