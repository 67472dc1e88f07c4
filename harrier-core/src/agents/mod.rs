//! Hierarchical agent tree: lifecycle, skills, and the driving runtime

pub mod node;
pub mod orchestrator;
pub mod runtime;
pub mod skills;

pub use node::{AgentNode, AgentSnapshot, AgentStatus, AgentSummary};
pub use orchestrator::{Orchestrator, DEFAULT_MAX_CONCURRENT};
pub use runtime::{Agent, AgentContext, ScanRuntime};
pub use skills::{Skill, SkillSet};
