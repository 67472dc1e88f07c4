//! Agent tree nodes and the structured summaries they hand upward.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::agents::skills::SkillSet;

/// Lifecycle state of an agent.
///
/// Spawned -> Running -> (AwaitingChildren <-> Running) -> Finished | Failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Spawned,
    Running,
    AwaitingChildren,
    Finished,
    Failed,
}

impl AgentStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, AgentStatus::Finished | AgentStatus::Failed)
    }

    /// True while the parent may accept new children
    pub fn accepts_children(self) -> bool {
        matches!(self, AgentStatus::Running | AgentStatus::AwaitingChildren)
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentStatus::Spawned => write!(f, "spawned"),
            AgentStatus::Running => write!(f, "running"),
            AgentStatus::AwaitingChildren => write!(f, "awaiting_children"),
            AgentStatus::Finished => write!(f, "finished"),
            AgentStatus::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for AgentStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "spawned" => Ok(AgentStatus::Spawned),
            "running" => Ok(AgentStatus::Running),
            "awaiting_children" => Ok(AgentStatus::AwaitingChildren),
            "finished" => Ok(AgentStatus::Finished),
            "failed" => Ok(AgentStatus::Failed),
            _ => Err(format!("Unknown agent status: {}", s)),
        }
    }
}

/// One node in the delegation tree
#[derive(Debug, Clone)]
pub struct AgentNode {
    pub id: String,
    pub parent_id: Option<String>,
    pub mission: String,
    pub skills: SkillSet,
    /// Share of the parent's time granted to this agent, in (0, 1]. The
    /// root holds 1.0.
    pub budget_fraction: f64,
    pub status: AgentStatus,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub failure_cause: Option<String>,
}

impl AgentNode {
    pub(crate) fn root(mission: impl Into<String>, skills: SkillSet) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            parent_id: None,
            mission: mission.into(),
            skills,
            budget_fraction: 1.0,
            status: AgentStatus::Spawned,
            created_at: Utc::now(),
            finished_at: None,
            failure_cause: None,
        }
    }

    pub(crate) fn child(
        parent_id: impl Into<String>,
        mission: impl Into<String>,
        skills: SkillSet,
        budget_fraction: f64,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            parent_id: Some(parent_id.into()),
            mission: mission.into(),
            skills,
            budget_fraction,
            status: AgentStatus::Spawned,
            created_at: Utc::now(),
            finished_at: None,
            failure_cause: None,
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }
}

/// Structured report a child hands to its parent on completion.
///
/// Failures use the same shape as successes so a parent integrates both in
/// one pass; `failure_cause` is set only on failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSummary {
    pub agent_id: String,
    pub mission: String,
    pub success: bool,
    pub summary: String,
    pub key_findings: Vec<String>,
    pub next_steps: Vec<String>,
    pub failure_cause: Option<String>,
}

impl AgentSummary {
    pub fn success(
        agent_id: impl Into<String>,
        mission: impl Into<String>,
        summary: impl Into<String>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            mission: mission.into(),
            success: true,
            summary: summary.into(),
            key_findings: Vec::new(),
            next_steps: Vec::new(),
            failure_cause: None,
        }
    }

    pub fn failure(
        agent_id: impl Into<String>,
        mission: impl Into<String>,
        cause: impl Into<String>,
    ) -> Self {
        let cause = cause.into();
        Self {
            agent_id: agent_id.into(),
            mission: mission.into(),
            success: false,
            summary: format!("failed: {cause}"),
            key_findings: Vec::new(),
            next_steps: Vec::new(),
            failure_cause: Some(cause),
        }
    }

    pub fn with_key_findings(mut self, key_findings: Vec<String>) -> Self {
        self.key_findings = key_findings;
        self
    }

    pub fn with_next_steps(mut self, next_steps: Vec<String>) -> Self {
        self.next_steps = next_steps;
        self
    }
}

/// Serializable view of one agent for continuation snapshots
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSnapshot {
    pub agent_id: String,
    pub parent_id: Option<String>,
    pub mission: String,
    pub skills: SkillSet,
    pub status: AgentStatus,
    pub budget_fraction: f64,
    pub created_at: DateTime<Utc>,
}

impl From<&AgentNode> for AgentSnapshot {
    fn from(node: &AgentNode) -> Self {
        Self {
            agent_id: node.id.clone(),
            parent_id: node.parent_id.clone(),
            mission: node.mission.clone(),
            skills: node.skills.clone(),
            status: node.status,
            budget_fraction: node.budget_fraction,
            created_at: node.created_at,
        }
    }
}
