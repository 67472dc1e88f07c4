//! Lifecycle manager for the agent delegation tree.
//!
//! The orchestrator owns every `AgentNode`: admission (capacity and budget
//! checks), skill delegation, terminal transitions, and the per-parent
//! queues that deliver child summaries in finish order. Wind-down is
//! cooperative: `request_finish` cancels a subtree's token and the driving
//! task is expected to wrap up; `force_fail` is the fallback once a grace
//! deadline lapses.

use std::collections::{HashMap, VecDeque};

use chrono::Utc;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agents::node::{AgentNode, AgentSnapshot, AgentStatus, AgentSummary};
use crate::agents::skills::SkillSet;
use crate::error::{Error, Result};

/// Default cap on concurrently live agents
pub const DEFAULT_MAX_CONCURRENT: usize = 5;

/// Slack for float accumulation in the budget ledger
const BUDGET_EPSILON: f64 = 1e-9;

#[derive(Default)]
struct OrchestratorState {
    nodes: HashMap<String, AgentNode>,
    /// Child ids per parent, in spawn order
    children: HashMap<String, Vec<String>>,
    /// Cumulative budget fraction each parent has granted its children
    granted: HashMap<String, f64>,
    /// Undelivered child summaries per parent, in finish order
    inboxes: HashMap<String, VecDeque<AgentSummary>>,
    /// Wrap-up signal per agent; child tokens are derived from the parent's
    tokens: HashMap<String, CancellationToken>,
    /// Count of non-terminal agents
    live: usize,
    root_id: Option<String>,
    /// The root has no parent inbox, so its summary is kept here
    root_summary: Option<AgentSummary>,
}

impl OrchestratorState {
    fn require(&self, agent_id: &str) -> Result<&AgentNode> {
        self.nodes
            .get(agent_id)
            .ok_or_else(|| Error::UnknownAgent(agent_id.to_string()))
    }

    fn live_children(&self, parent_id: &str) -> usize {
        self.children
            .get(parent_id)
            .map(|kids| {
                kids.iter()
                    .filter(|kid| {
                        self.nodes
                            .get(kid.as_str())
                            .is_some_and(|node| !node.status.is_terminal())
                    })
                    .count()
            })
            .unwrap_or(0)
    }

    /// Every descendant of `agent_id`, ordered so leaves come before their
    /// parents
    fn descendants_leaves_first(&self, agent_id: &str) -> Vec<String> {
        let mut visited = Vec::new();
        let mut stack = self.children.get(agent_id).cloned().unwrap_or_default();
        while let Some(next) = stack.pop() {
            if let Some(kids) = self.children.get(&next) {
                stack.extend(kids.iter().cloned());
            }
            visited.push(next);
        }
        visited.reverse();
        visited
    }

    /// Terminal transition: flips status, decrements the live count, and
    /// queues the summary for the parent. No-op if already terminal.
    fn complete(&mut self, agent_id: &str, status: AgentStatus, summary: AgentSummary) {
        let Some(node) = self.nodes.get_mut(agent_id) else {
            return;
        };
        if node.status.is_terminal() {
            return;
        }
        node.status = status;
        node.finished_at = Some(Utc::now());
        if status == AgentStatus::Failed {
            node.failure_cause = summary.failure_cause.clone();
        }
        let parent_id = node.parent_id.clone();
        self.live = self.live.saturating_sub(1);
        if let Some(parent_id) = parent_id {
            self.inboxes.entry(parent_id).or_default().push_back(summary);
        } else {
            self.root_summary = Some(summary);
        }
    }
}

/// Manages the spawn/execute/handoff/integrate lifecycle of the agent tree
pub struct Orchestrator {
    state: Mutex<OrchestratorState>,
    /// Woken whenever any agent reaches a terminal state
    changed: Notify,
    max_concurrent: usize,
}

impl Orchestrator {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            state: Mutex::new(OrchestratorState::default()),
            changed: Notify::new(),
            max_concurrent: max_concurrent.max(1),
        }
    }

    /// Spawn the root agent. A tree has exactly one root.
    pub async fn spawn_root(&self, mission: &str, skills: SkillSet) -> Result<AgentNode> {
        let mut state = self.state.lock().await;
        if state.root_id.is_some() {
            return Err(Error::Config("root agent already spawned".to_string()));
        }
        if state.live >= self.max_concurrent {
            return Err(Error::CapacityExceeded {
                live: state.live,
                limit: self.max_concurrent,
            });
        }

        let node = AgentNode::root(mission, skills);
        state.tokens.insert(node.id.clone(), CancellationToken::new());
        state.children.insert(node.id.clone(), Vec::new());
        state.inboxes.insert(node.id.clone(), VecDeque::new());
        state.root_id = Some(node.id.clone());
        state.live += 1;
        state.nodes.insert(node.id.clone(), node.clone());

        info!(agent_id = %node.id, mission = %node.mission, "spawned root agent");
        Ok(node)
    }

    /// Spawn a child under `parent_id`.
    ///
    /// `budget_fraction` is the share of the parent's own time this child
    /// receives; a parent may grant at most 1.0 across all of its children,
    /// and completed children do not refund their share.
    pub async fn spawn(
        &self,
        parent_id: &str,
        mission: &str,
        skills: SkillSet,
        budget_fraction: f64,
    ) -> Result<AgentNode> {
        if !budget_fraction.is_finite() || budget_fraction <= 0.0 || budget_fraction > 1.0 {
            return Err(Error::Config(format!(
                "budget_fraction must be in (0, 1], got {budget_fraction}"
            )));
        }

        let mut state = self.state.lock().await;

        let (parent_status, parent_skills) = match state.nodes.get(parent_id) {
            Some(parent) => (parent.status, parent.skills.clone()),
            None => return Err(Error::InvalidParent(parent_id.to_string())),
        };
        if !parent_status.accepts_children() {
            return Err(Error::InvalidParent(format!(
                "{parent_id} is {parent_status}"
            )));
        }
        if !skills.is_subset(&parent_skills) {
            let missing: Vec<String> = skills
                .missing_from(&parent_skills)
                .iter()
                .map(ToString::to_string)
                .collect();
            return Err(Error::SkillNotGranted(missing.join(",")));
        }
        if state.live >= self.max_concurrent {
            return Err(Error::CapacityExceeded {
                live: state.live,
                limit: self.max_concurrent,
            });
        }
        let granted = state.granted.get(parent_id).copied().unwrap_or(0.0);
        if granted + budget_fraction > 1.0 + BUDGET_EPSILON {
            return Err(Error::BudgetExceeded {
                requested: budget_fraction,
                available: (1.0 - granted).max(0.0),
            });
        }

        let parent_token = state
            .tokens
            .get(parent_id)
            .cloned()
            .ok_or_else(|| Error::InvalidParent(parent_id.to_string()))?;

        let node = AgentNode::child(parent_id, mission, skills, budget_fraction);
        state.tokens.insert(node.id.clone(), parent_token.child_token());
        state
            .children
            .entry(parent_id.to_string())
            .or_default()
            .push(node.id.clone());
        state.inboxes.insert(node.id.clone(), VecDeque::new());
        *state.granted.entry(parent_id.to_string()).or_insert(0.0) += budget_fraction;
        state.live += 1;
        state.nodes.insert(node.id.clone(), node.clone());

        debug!(
            agent_id = %node.id,
            parent_id,
            budget = budget_fraction,
            skills = %node.skills,
            "spawned agent"
        );
        Ok(node)
    }

    /// Transition an agent to Running once its driving task starts
    pub async fn mark_running(&self, agent_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let node = state
            .nodes
            .get_mut(agent_id)
            .ok_or_else(|| Error::UnknownAgent(agent_id.to_string()))?;
        if node.status.is_terminal() {
            return Err(Error::AlreadyFinished(agent_id.to_string()));
        }
        node.status = AgentStatus::Running;
        Ok(())
    }

    /// Finish an agent and queue its summary for the parent. All children
    /// must already be terminal.
    pub async fn finish(&self, agent_id: &str, summary: AgentSummary) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            let node = state.require(agent_id)?;
            if node.status.is_terminal() {
                return Err(Error::AlreadyFinished(agent_id.to_string()));
            }
            let live_children = state.live_children(agent_id);
            if live_children > 0 {
                return Err(Error::Config(format!(
                    "agent {agent_id} still has {live_children} live children"
                )));
            }
            state.complete(agent_id, AgentStatus::Finished, summary);
        }
        self.changed.notify_waiters();
        debug!(agent_id, "agent finished");
        Ok(())
    }

    /// Fail an agent. Any live descendants are failed first (leaves before
    /// parents) and each queues a failure summary for its own parent;
    /// siblings are untouched.
    pub async fn fail(&self, agent_id: &str, cause: &str) -> Result<()> {
        info!(agent_id, cause, "agent failed");
        self.fail_subtree(agent_id, cause).await
    }

    /// Fail an agent that ignored a wrap-up request past its grace deadline
    pub async fn force_fail(&self, agent_id: &str, cause: &str) -> Result<()> {
        warn!(agent_id, cause, "force-failing agent");
        self.fail_subtree(agent_id, cause).await
    }

    async fn fail_subtree(&self, agent_id: &str, cause: &str) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            let node = state.require(agent_id)?;
            if node.status.is_terminal() {
                return Err(Error::AlreadyFinished(agent_id.to_string()));
            }

            if let Some(token) = state.tokens.get(agent_id) {
                token.cancel();
            }

            for child_id in state.descendants_leaves_first(agent_id) {
                let Some(child) = state.nodes.get(&child_id) else {
                    continue;
                };
                if child.status.is_terminal() {
                    continue;
                }
                let summary = AgentSummary::failure(
                    child.id.clone(),
                    child.mission.clone(),
                    format!("ancestor failed: {cause}"),
                );
                state.complete(&child_id, AgentStatus::Failed, summary);
            }

            let node = state.require(agent_id)?;
            let summary = AgentSummary::failure(node.id.clone(), node.mission.clone(), cause);
            state.complete(agent_id, AgentStatus::Failed, summary);
        }
        self.changed.notify_waiters();
        Ok(())
    }

    /// Drain summaries from children that finished since the last call, in
    /// the order they finished. Idempotent; returns empty when none are
    /// pending.
    pub async fn integrate(&self, parent_id: &str) -> Result<Vec<AgentSummary>> {
        let mut state = self.state.lock().await;
        state.require(parent_id)?;
        Ok(state
            .inboxes
            .get_mut(parent_id)
            .map(|queue| queue.drain(..).collect())
            .unwrap_or_default())
    }

    /// Block until every child of `parent_id` is terminal, then drain their
    /// summaries. The parent sits in AwaitingChildren while blocked and
    /// returns to Running afterwards.
    pub async fn await_children(&self, parent_id: &str) -> Result<Vec<AgentSummary>> {
        {
            let mut state = self.state.lock().await;
            let node = state
                .nodes
                .get_mut(parent_id)
                .ok_or_else(|| Error::UnknownAgent(parent_id.to_string()))?;
            if node.status.is_terminal() {
                return Err(Error::AlreadyFinished(parent_id.to_string()));
            }
            node.status = AgentStatus::AwaitingChildren;
        }

        loop {
            let notified = self.changed.notified();
            {
                let mut state = self.state.lock().await;
                if state.live_children(parent_id) == 0 {
                    if let Some(node) = state.nodes.get_mut(parent_id) {
                        node.status = AgentStatus::Running;
                    }
                    return Ok(state
                        .inboxes
                        .get_mut(parent_id)
                        .map(|queue| queue.drain(..).collect())
                        .unwrap_or_default());
                }
            }
            notified.await;
        }
    }

    /// Ask an agent subtree to wrap up. Cancels the subtree's token; the
    /// driving tasks decide how to finish within their grace deadline.
    pub async fn request_finish(&self, agent_id: &str) -> Result<()> {
        let state = self.state.lock().await;
        let token = state
            .tokens
            .get(agent_id)
            .ok_or_else(|| Error::UnknownAgent(agent_id.to_string()))?;
        token.cancel();
        debug!(agent_id, "requested finish");
        Ok(())
    }

    /// Ask the whole tree to wrap up. No-op before the root spawns.
    pub async fn request_finish_all(&self) -> Result<()> {
        let root_id = {
            let state = self.state.lock().await;
            state.root_id.clone()
        };
        match root_id {
            Some(root_id) => self.request_finish(&root_id).await,
            None => Ok(()),
        }
    }

    /// The wrap-up token for an agent. Cancelled when this agent or any
    /// ancestor is asked to finish.
    pub async fn finish_token(&self, agent_id: &str) -> Result<CancellationToken> {
        let state = self.state.lock().await;
        state
            .tokens
            .get(agent_id)
            .cloned()
            .ok_or_else(|| Error::UnknownAgent(agent_id.to_string()))
    }

    /// Current view of an agent
    pub async fn node(&self, agent_id: &str) -> Result<AgentNode> {
        let state = self.state.lock().await;
        state.require(agent_id).cloned()
    }

    /// The root agent, if spawned
    pub async fn root(&self) -> Option<AgentNode> {
        let state = self.state.lock().await;
        let root_id = state.root_id.as_deref()?;
        state.nodes.get(root_id).cloned()
    }

    /// The root agent's final summary, once it has reached a terminal state
    pub async fn root_summary(&self) -> Option<AgentSummary> {
        self.state.lock().await.root_summary.clone()
    }

    /// Number of non-terminal agents
    pub async fn live_count(&self) -> usize {
        self.state.lock().await.live
    }

    /// Serializable view of the whole tree, oldest agents first
    pub async fn snapshot(&self) -> Vec<AgentSnapshot> {
        let state = self.state.lock().await;
        let mut snapshots: Vec<AgentSnapshot> =
            state.nodes.values().map(AgentSnapshot::from).collect();
        snapshots.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.agent_id.cmp(&b.agent_id))
        });
        snapshots
    }
}
