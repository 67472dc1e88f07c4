//! External tool execution.

pub mod adapter;

pub use adapter::{ExecOutcome, ProcessAdapter, ToolAdapter};
