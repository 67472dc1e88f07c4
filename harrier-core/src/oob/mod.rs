//! Out-of-band callback correlation

pub mod engine;
pub mod token;

pub use engine::CorrelationEngine;
pub use token::{CorrelationToken, InteractionEvent, OobProtocol, TokenSnapshot, TokenStatus};
