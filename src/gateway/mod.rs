//! # External Service Gateway
//!
//! ## Client side (used by sessions):
//! - **client**: `SigningGateway` trait and its HTTP implementation
//!
//! ## Server side (behind the gateway routes):
//! - **boldsign**: signing provider calls
//! - **store**: contract and conversation records
//! - **broadcast**: signing completion notices for open sessions

pub mod boldsign;
pub mod broadcast;
pub mod client;
pub mod store;
