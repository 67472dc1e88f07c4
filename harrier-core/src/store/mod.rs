//! Durable knowledge store shared by every agent in a scan.
//!
//! Targets, findings, artifacts, evidence links, sessions, and continuation
//! blobs all live in one SQLite database. [`KnowledgeStore`] is the only
//! write path; models expose read helpers for callers that already hold a
//! connection.

pub mod knowledge;
pub mod migrations;
pub mod models;
pub mod schema;
pub mod session;

pub use knowledge::{ArtifactFilter, FindingFilter, KnowledgeStore, SearchResults};
pub use migrations::run_migrations;
pub use models::{
    canonical_category, categories, content_hash, split_category, Artifact, EvidenceRef, Finding,
    FindingClass, FindingDraft, FindingStatus, ProofKind, Severity, Target, TargetKind,
    ToolInvocation,
};
pub use session::{
    ContinuationState, ScanSession, SessionStatus, CONTINUATION_VERSION,
};
