//! harrier-core: coordination substrate for autonomous security assessment agents

#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

pub mod agents;
pub mod config;
pub mod dedup;
pub mod error;
pub mod oob;
pub mod store;
pub mod timekeeper;
pub mod tools;

pub use error::{Error, Result};
