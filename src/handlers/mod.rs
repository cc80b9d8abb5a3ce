pub mod config;
pub mod conversations;
pub mod signing;

pub use config::*;
pub use conversations::*;
pub use signing::*;
