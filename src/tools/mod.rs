//! # Tool Invocation
//!
//! Out-of-band function calls requested by the conversational engine, today only
//! the contract signing link.
//!
//! - **normalize**: both engine channels reduced to one `ToolCall`
//! - **mediator**: dedup, form flow, keyword fallback, signing status

pub mod mediator;
pub mod normalize;
