//! # Avatar Session
//!
//! ## Key Components:
//! - **state**: the session state machine
//! - **controller**: the per-connection actor that owns the state machine, the sync
//!   pipeline, the tool mediator and every timer
//! - **view**: the snapshot published to the client after each change
//! - **transcript**: the conversation log persisted when a call ends

pub mod controller;
pub mod state;
pub mod transcript;
pub mod view;
