//! Session runtime that drives agent tasks against the clock.
//!
//! `ScanRuntime` ties the pieces together: it opens a session, launches the
//! root agent, derives pacing and phase decisions from the time budget, and
//! when the window closes it winds the tree down and persists a continuation
//! blob so a later run can pick the scan back up.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agents::node::{AgentNode, AgentStatus, AgentSummary};
use crate::agents::orchestrator::Orchestrator;
use crate::agents::skills::SkillSet;
use crate::config::HarrierConfig;
use crate::error::{Error, Result};
use crate::oob::{CorrelationEngine, CorrelationToken};
use crate::store::{ContinuationState, KnowledgeStore, ScanSession, Target, ToolInvocation};
use crate::timekeeper::{Phase, PhaseTracker, TimeKeeper};
use crate::tools::{ExecOutcome, ToolAdapter};

/// Driving logic for one agent in the tree.
///
/// Implementations do the actual probing work; the runtime owns scheduling,
/// wrap-up signalling, and reporting the outcome to the orchestrator.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Run the mission to completion. Implementations should consult
    /// `ctx.should_wrap_up()` between actions and return early with their
    /// best summary once it turns true.
    async fn run(&self, ctx: AgentContext) -> Result<AgentSummary>;
}

/// Everything an agent task needs while running
pub struct AgentContext {
    /// The tree record this task is driving
    pub node: AgentNode,
    runtime: Arc<ScanRuntime>,
    finish: CancellationToken,
    iterations: AtomicU32,
}

impl AgentContext {
    pub fn store(&self) -> &Arc<KnowledgeStore> {
        &self.runtime.store
    }

    pub fn oob(&self) -> &Arc<CorrelationEngine> {
        &self.runtime.oob
    }

    pub fn target(&self) -> &Target {
        &self.runtime.target
    }

    pub fn session(&self) -> &ScanSession {
        &self.runtime.session
    }

    pub fn config(&self) -> &HarrierConfig {
        &self.runtime.config
    }

    /// Current phase of the session clock
    pub fn phase(&self) -> Phase {
        self.runtime
            .timekeeper
            .phase_of(&self.runtime.session, Utc::now())
    }

    /// True once this agent should stop probing and summarize
    pub fn should_wrap_up(&self) -> bool {
        self.finish.is_cancelled()
            || self
                .runtime
                .timekeeper
                .should_stop(&self.runtime.session, Utc::now())
    }

    /// Resolves when this agent (or an ancestor) is asked to finish
    pub async fn until_wrap_up(&self) {
        self.finish.cancelled().await;
    }

    /// Sleep out the pacing delay before the next probing action. Late in
    /// the window the delay drops to the floor so wrap-up work is not
    /// starved.
    pub async fn pace(&self) {
        let count = self
            .iterations
            .fetch_add(1, Ordering::Relaxed)
            .saturating_add(1);
        let keeper = &self.runtime.timekeeper;
        let session = &self.runtime.session;
        let delay = if keeper.should_accelerate(session, Utc::now()) {
            keeper.floor()
        } else {
            keeper.pace_delay(session, count)
        };
        tokio::time::sleep(delay).await;
    }

    /// Spawn a child agent under this one and start driving it
    pub async fn delegate(
        &self,
        mission: &str,
        skills: SkillSet,
        budget_fraction: f64,
        task: Arc<dyn Agent>,
    ) -> Result<AgentNode> {
        let child = self
            .runtime
            .orchestrator
            .spawn(&self.node.id, mission, skills, budget_fraction)
            .await?;
        self.runtime.launch(child.clone(), task).await?;
        Ok(child)
    }

    /// Block until every child is terminal; returns their summaries in
    /// finish order
    pub async fn await_children(&self) -> Result<Vec<AgentSummary>> {
        self.runtime.orchestrator.await_children(&self.node.id).await
    }

    /// Drain summaries of already-terminal children without blocking
    pub async fn integrate(&self) -> Result<Vec<AgentSummary>> {
        self.runtime.orchestrator.integrate(&self.node.id).await
    }

    /// Ask one child subtree to wrap up early
    pub async fn request_finish(&self, child_id: &str) -> Result<()> {
        self.runtime.orchestrator.request_finish(child_id).await
    }

    /// Issue a correlation token for an out-of-band probe
    pub fn issue_token(&self) -> CorrelationToken {
        self.runtime
            .oob
            .issue_token(&self.node.id, self.runtime.config.oob.token_ttl())
    }

    /// Tokens of this agent matched since the last poll
    pub fn poll_oob(&self) -> Vec<CorrelationToken> {
        self.runtime.oob.poll(&self.node.id)
    }

    /// Run an external tool and record the invocation in the audit trail.
    /// The record is written whether or not the invocation succeeds.
    pub async fn invoke_tool(
        &self,
        adapter: &dyn ToolAdapter,
        command: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<ExecOutcome> {
        let mut record = ToolInvocation::new(&self.node.id, command, args.to_vec());
        let result = adapter.invoke(command, args, timeout).await;
        match &result {
            Ok(outcome) => record.complete(
                outcome.exit_code,
                outcome.stdout.as_str(),
                outcome.stderr.as_str(),
            ),
            Err(err) => record.complete(-1, "", err.to_string()),
        }
        if let Err(err) = self.runtime.store.record_invocation(&record).await {
            warn!(agent_id = %self.node.id, error = %err, "failed to record tool invocation");
        }
        result
    }
}

/// One scan session end to end: clock, tree, store, and callbacks
pub struct ScanRuntime {
    config: HarrierConfig,
    store: Arc<KnowledgeStore>,
    orchestrator: Orchestrator,
    oob: Arc<CorrelationEngine>,
    timekeeper: TimeKeeper,
    target: Target,
    session: ScanSession,
    phase_tracker: Mutex<PhaseTracker>,
    /// Driving-task handles, joined on wind-down
    handles: Mutex<Vec<(String, JoinHandle<()>)>>,
}

impl ScanRuntime {
    /// Open a fresh session against `target_identifier`
    pub async fn start(
        config: HarrierConfig,
        store: Arc<KnowledgeStore>,
        target_identifier: &str,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let target = store.upsert_target(target_identifier).await?;
        let session = store
            .create_session(&target.id, config.session.total_budget())
            .await?;
        info!(
            session_id = %session.id,
            target = %target.identifier,
            budget_minutes = config.session.budget_minutes,
            "scan session started"
        );
        Ok(Self::assemble(config, store, target, session))
    }

    /// Reopen a suspended session. Returns the continuation saved at
    /// wind-down, if any; unresolved correlation tokens in it are
    /// re-registered so late callbacks still match.
    pub async fn resume(
        config: HarrierConfig,
        store: Arc<KnowledgeStore>,
        session_id: &str,
    ) -> Result<(Arc<Self>, Option<ContinuationState>)> {
        config.validate()?;
        let session = store.resume_session(session_id).await?;
        let target = store
            .target(&session.target_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("target {}", session.target_id)))?;
        let continuation = store.load_continuation(session_id).await?;

        let runtime = Self::assemble(config, store, target, session);
        if let Some(state) = &continuation {
            let restored = runtime.oob.restore_tokens(&state.unresolved_tokens);
            info!(
                session_id,
                restored,
                pending = state.pending_missions.len(),
                "resumed suspended session"
            );
        } else {
            info!(session_id, "resumed session without a continuation");
        }
        Ok((runtime, continuation))
    }

    fn assemble(
        config: HarrierConfig,
        store: Arc<KnowledgeStore>,
        target: Target,
        session: ScanSession,
    ) -> Arc<Self> {
        let oob = Arc::new(CorrelationEngine::new(
            Arc::clone(&store),
            &target.id,
            &config.oob.listener_domain,
        ));
        let orchestrator = Orchestrator::new(config.orchestrator.max_concurrent);
        let timekeeper = config.pacing.timekeeper();
        Arc::new(Self {
            config,
            store,
            orchestrator,
            oob,
            timekeeper,
            target,
            session,
            phase_tracker: Mutex::new(PhaseTracker::new()),
            handles: Mutex::new(Vec::new()),
        })
    }

    pub fn session(&self) -> &ScanSession {
        &self.session
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn store(&self) -> &Arc<KnowledgeStore> {
        &self.store
    }

    pub fn oob(&self) -> &Arc<CorrelationEngine> {
        &self.oob
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    /// Spawn the root agent and start driving it
    pub async fn launch_root(
        self: &Arc<Self>,
        mission: &str,
        skills: SkillSet,
        task: Arc<dyn Agent>,
    ) -> Result<AgentNode> {
        let root = self.orchestrator.spawn_root(mission, skills).await?;
        self.launch(root.clone(), task).await?;
        Ok(root)
    }

    /// Drive `task` for a spawned node: report Running, run the future, and
    /// record the outcome. A wrap-up request opens a grace window; a task
    /// that outlives it is force-failed.
    async fn launch(self: &Arc<Self>, node: AgentNode, task: Arc<dyn Agent>) -> Result<()> {
        let token = self.orchestrator.finish_token(&node.id).await?;
        self.orchestrator.mark_running(&node.id).await?;

        let runtime = Arc::clone(self);
        let grace = self.config.orchestrator.grace();
        let agent_id = node.id.clone();
        let ctx = AgentContext {
            node,
            runtime: Arc::clone(self),
            finish: token.clone(),
            iterations: AtomicU32::new(0),
        };

        let task_id = agent_id.clone();
        let handle = tokio::spawn(async move {
            let work = task.run(ctx);
            tokio::pin!(work);

            let verdict = tokio::select! {
                result = &mut work => result,
                () = token.cancelled() => {
                    debug!(
                        agent_id = %task_id,
                        grace_secs = grace.as_secs(),
                        "wrap-up requested, grace window open"
                    );
                    match tokio::time::timeout(grace, &mut work).await {
                        Ok(result) => result,
                        Err(_) => {
                            warn!(agent_id = %task_id, "agent missed its grace window");
                            if let Err(err) = runtime
                                .orchestrator
                                .force_fail(&task_id, "did not wrap up within the grace window")
                                .await
                            {
                                debug!(
                                    agent_id = %task_id,
                                    error = %err,
                                    "force-fail raced another terminal transition"
                                );
                            }
                            return;
                        }
                    }
                }
            };

            let report = match verdict {
                Ok(summary) => runtime.orchestrator.finish(&task_id, summary).await,
                Err(err) => runtime.orchestrator.fail(&task_id, &err.to_string()).await,
            };
            match report {
                Ok(()) => {}
                // Wind-down or an ancestor failure reached this node first
                Err(Error::AlreadyFinished(_)) => {}
                Err(err) => {
                    warn!(agent_id = %task_id, error = %err, "could not record agent outcome");
                    let _ = runtime
                        .orchestrator
                        .fail(&task_id, "returned while children were still live")
                        .await;
                }
            }
        });

        self.handles.lock().await.push((agent_id, handle));
        Ok(())
    }

    /// Wait for every driving task to return. Used by embedders that let a
    /// scan run to natural completion.
    pub async fn wait_for_all(&self) {
        loop {
            let next = self.handles.lock().await.pop();
            let Some((agent_id, handle)) = next else { break };
            if let Err(err) = handle.await {
                if err.is_panic() {
                    warn!(agent_id = %agent_id, "agent task panicked");
                }
            }
        }
    }

    /// Re-derive the session phase, announce it on first entry, and trigger
    /// tree wind-down once the clock says stop. Embedders call this on their
    /// control loop.
    pub async fn check_phase(&self) -> Phase {
        let now = Utc::now();
        let phase = self.timekeeper.phase_of(&self.session, now);
        if let Some(entered) = self.phase_tracker.lock().await.observe(phase) {
            info!(session_id = %self.session.id, phase = %entered, "session entered phase");
        }
        if self.timekeeper.should_stop(&self.session, now) {
            if let Err(err) = self.orchestrator.request_finish_all().await {
                warn!(error = %err, "wrap-up broadcast failed");
            }
        }
        phase
    }

    /// Wind the scan down: ask every agent to wrap up, give the tree its
    /// grace, then persist a continuation and suspend the session.
    ///
    /// Returns the continuation that was written.
    pub async fn wind_down(&self, reason: &str) -> Result<ContinuationState> {
        info!(session_id = %self.session.id, reason, "winding down scan session");
        self.orchestrator.request_finish_all().await?;

        // Tasks self-report within one grace window; double it as the hard
        // limit before aborting a handle outright. Loop because a still-live
        // parent may delegate while the first batch drains.
        let drain_limit = self.config.orchestrator.grace() * 2;
        loop {
            let drained: Vec<(String, JoinHandle<()>)> =
                self.handles.lock().await.drain(..).collect();
            if drained.is_empty() {
                break;
            }
            for (agent_id, handle) in drained {
                let abort = handle.abort_handle();
                if tokio::time::timeout(drain_limit, handle).await.is_err() {
                    warn!(agent_id = %agent_id, "driving task ignored wind-down, aborting");
                    abort.abort();
                }
            }
        }

        for snap in self.orchestrator.snapshot().await {
            if !snap.status.is_terminal() {
                if let Err(err) = self
                    .orchestrator
                    .force_fail(&snap.agent_id, "aborted during wind-down")
                    .await
                {
                    debug!(agent_id = %snap.agent_id, error = %err, "straggler already terminal");
                }
            }
        }

        let now = Utc::now();
        let mut state = ContinuationState::new(
            &self.session.id,
            self.timekeeper.phase_of(&self.session, now),
        );
        state.agents = self.orchestrator.snapshot().await;
        state.unresolved_tokens = self.oob.unresolved_snapshot();
        state.findings_summary = self.store.findings_summary().await?;
        for snap in &state.agents {
            if snap.status == AgentStatus::Finished {
                state.completed_missions.push(snap.mission.clone());
            } else {
                state.pending_missions.push(snap.mission.clone());
            }
        }
        if let Some(summary) = self.orchestrator.root_summary().await {
            state.priority_followups = summary.next_steps;
        }
        state.notes.push(format!("wind-down: {reason}"));

        self.store.snapshot_continuation(&state).await?;
        self.store.suspend_session(&self.session.id).await?;
        info!(
            session_id = %self.session.id,
            pending = state.pending_missions.len(),
            unresolved_tokens = state.unresolved_tokens.len(),
            "session suspended"
        );
        Ok(state)
    }

    /// Close the session for good. Drops any continuation; a finalized
    /// session cannot be resumed.
    pub async fn finalize(&self) -> Result<ScanSession> {
        self.wait_for_all().await;
        let session = self.store.finalize_session(&self.session.id).await?;
        info!(session_id = %session.id, "session finalized");
        Ok(session)
    }
}
