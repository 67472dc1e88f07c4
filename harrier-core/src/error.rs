//! Error types for harrier-core

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using harrier Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for harrier
#[derive(Debug, Error, Diagnostic)]
pub enum Error {
    #[error("Configuration error: {0}")]
    #[diagnostic(code(harrier::config))]
    Config(String),

    #[error("Database error: {0}")]
    #[diagnostic(code(harrier::database))]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    #[diagnostic(code(harrier::io))]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    #[diagnostic(code(harrier::serde))]
    Serde(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    #[diagnostic(code(harrier::toml))]
    Toml(#[from] toml::de::Error),

    #[error("Invalid parent agent: {0}")]
    #[diagnostic(code(harrier::orchestrator::invalid_parent))]
    InvalidParent(String),

    #[error("Unknown agent: {0}")]
    #[diagnostic(code(harrier::orchestrator::unknown_agent))]
    UnknownAgent(String),

    #[error("Agent already finished: {0}")]
    #[diagnostic(code(harrier::orchestrator::already_finished))]
    AlreadyFinished(String),

    #[error("Budget exceeded: requested fraction {requested:.2}, available {available:.2}")]
    #[diagnostic(code(harrier::orchestrator::budget))]
    BudgetExceeded { requested: f64, available: f64 },

    #[error("Capacity exceeded: {live} agents live, limit {limit}")]
    #[diagnostic(code(harrier::orchestrator::capacity))]
    CapacityExceeded { live: usize, limit: usize },

    #[error("Unknown skill: {0}")]
    #[diagnostic(code(harrier::skills::unknown))]
    UnknownSkill(String),

    #[error("Skill not granted by parent: {0}")]
    #[diagnostic(code(harrier::skills::not_granted))]
    SkillNotGranted(String),

    #[error("Not found: {0}")]
    #[diagnostic(code(harrier::store::not_found))]
    NotFound(String),

    #[error("Store conflict after {attempts} attempts: {message}")]
    #[diagnostic(code(harrier::store::conflict))]
    StoreConflict { attempts: usize, message: String },

    #[error("Evidence required: {0}")]
    #[diagnostic(code(harrier::store::evidence))]
    EvidenceRequired(String),

    #[error("Correlation token expired: {0}")]
    #[diagnostic(code(harrier::oob::token_expired))]
    TokenExpired(String),

    #[error("Tool execution error: {0}")]
    #[diagnostic(code(harrier::tool))]
    Tool(String),

    #[error("Session not found: {0}")]
    #[diagnostic(code(harrier::session))]
    SessionNotFound(String),
}
