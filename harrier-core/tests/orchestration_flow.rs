//! Integration tests driving a scan session end to end

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use harrier_core::agents::{
    Agent, AgentContext, AgentStatus, AgentSummary, ScanRuntime, Skill, SkillSet,
};
use harrier_core::config::HarrierConfig;
use harrier_core::oob::{InteractionEvent, OobProtocol};
use harrier_core::store::{
    FindingClass, FindingDraft, FindingFilter, FindingStatus, KnowledgeStore, ProofKind,
    SessionStatus, Severity,
};
use harrier_core::Error;
use tempfile::TempDir;

fn test_config() -> HarrierConfig {
    let mut config = HarrierConfig::default();
    config.orchestrator.grace_secs = 1;
    config
}

fn disk_store(temp: &TempDir) -> Arc<KnowledgeStore> {
    let path = temp.path().join("knowledge.db");
    Arc::new(KnowledgeStore::open(path).expect("should open store"))
}

/// Leaf that records one finding and reports back
struct RecordingLeaf {
    title: &'static str,
    severity: Severity,
}

#[async_trait]
impl Agent for RecordingLeaf {
    async fn run(&self, ctx: AgentContext) -> harrier_core::Result<AgentSummary> {
        let finding = ctx
            .store()
            .record_finding(
                &ctx.target().id,
                FindingDraft::new(self.title, self.severity, &ctx.node.id),
            )
            .await?;
        Ok(
            AgentSummary::success(&ctx.node.id, &ctx.node.mission, "one finding recorded")
                .with_key_findings(vec![finding.title]),
        )
    }
}

/// Root that fans out two probes and folds their reports together
struct RootPlanner;

#[async_trait]
impl Agent for RootPlanner {
    async fn run(&self, ctx: AgentContext) -> harrier_core::Result<AgentSummary> {
        ctx.delegate(
            "enumerate exposed services",
            [Skill::Recon, Skill::PortScan].into_iter().collect(),
            0.4,
            Arc::new(RecordingLeaf {
                title: "Legacy FTP service exposed",
                severity: Severity::Medium,
            }),
        )
        .await?;
        ctx.delegate(
            "probe the web tier",
            [Skill::WebCrawl, Skill::WebScan].into_iter().collect(),
            0.4,
            Arc::new(RecordingLeaf {
                title: "Verbose stack trace on error page",
                severity: Severity::Low,
            }),
        )
        .await?;

        let children = ctx.await_children().await?;
        let key_findings = children
            .iter()
            .flat_map(|child| child.key_findings.clone())
            .collect();
        Ok(AgentSummary::success(
            &ctx.node.id,
            &ctx.node.mission,
            format!("integrated {} child reports", children.len()),
        )
        .with_key_findings(key_findings)
        .with_next_steps(vec![
            "validate the stack trace disclosure".to_string(),
        ]))
    }
}

#[tokio::test]
async fn test_delegated_scan_runs_to_completion() {
    let temp = TempDir::new().expect("should create temp dir");
    let store = disk_store(&temp);
    let runtime = ScanRuntime::start(test_config(), Arc::clone(&store), "app.example.com")
        .await
        .expect("should start session");

    let root = runtime
        .launch_root("assess the perimeter", SkillSet::full(), Arc::new(RootPlanner))
        .await
        .expect("should launch root");
    runtime.wait_for_all().await;

    let node = runtime
        .orchestrator()
        .node(&root.id)
        .await
        .expect("root should exist");
    assert_eq!(node.status, AgentStatus::Finished);

    let summary = runtime
        .orchestrator()
        .root_summary()
        .await
        .expect("root summary should be retained");
    assert!(summary.success);
    assert_eq!(summary.key_findings.len(), 2);

    let findings = store
        .query_findings(FindingFilter::default())
        .await
        .expect("should query");
    assert_eq!(findings.len(), 2);
    assert!(findings.iter().all(|f| f.status == FindingStatus::Draft));

    let session = runtime.finalize().await.expect("should finalize");
    assert_eq!(session.status, SessionStatus::Finalized);
}

/// Leaf that reports success immediately
struct InstantLeaf;

#[async_trait]
impl Agent for InstantLeaf {
    async fn run(&self, ctx: AgentContext) -> harrier_core::Result<AgentSummary> {
        Ok(AgentSummary::success(
            &ctx.node.id,
            &ctx.node.mission,
            "done",
        ))
    }
}

/// Root that keeps delegating until the time ledger refuses
struct BudgetedRoot;

#[async_trait]
impl Agent for BudgetedRoot {
    async fn run(&self, ctx: AgentContext) -> harrier_core::Result<AgentSummary> {
        ctx.delegate(
            "deep crawl",
            [Skill::WebCrawl].into_iter().collect(),
            0.6,
            Arc::new(InstantLeaf),
        )
        .await?;
        ctx.delegate(
            "service sweep",
            [Skill::PortScan].into_iter().collect(),
            0.3,
            Arc::new(InstantLeaf),
        )
        .await?;

        let refusal = ctx
            .delegate(
                "extra exploitation pass",
                [Skill::Exploit].into_iter().collect(),
                0.2,
                Arc::new(InstantLeaf),
            )
            .await;
        match refusal {
            Err(Error::BudgetExceeded { .. }) => {}
            other => {
                return Err(Error::Config(format!(
                    "expected a budget refusal, got {other:?}"
                )))
            }
        }

        ctx.await_children().await?;
        Ok(AgentSummary::success(
            &ctx.node.id,
            &ctx.node.mission,
            "stopped delegating at the budget line",
        ))
    }
}

#[tokio::test]
async fn test_over_budget_delegation_is_refused() {
    let temp = TempDir::new().expect("should create temp dir");
    let store = disk_store(&temp);
    let runtime = ScanRuntime::start(test_config(), Arc::clone(&store), "app.example.com")
        .await
        .expect("should start session");

    let root = runtime
        .launch_root("time-boxed assessment", SkillSet::full(), Arc::new(BudgetedRoot))
        .await
        .expect("should launch root");
    runtime.wait_for_all().await;

    let node = runtime
        .orchestrator()
        .node(&root.id)
        .await
        .expect("root should exist");
    assert_eq!(node.status, AgentStatus::Finished);

    // The refused delegation never became a node.
    let snapshot = runtime.orchestrator().snapshot().await;
    assert_eq!(snapshot.len(), 3);
    assert_eq!(runtime.orchestrator().live_count().await, 0);
}

/// Agent that works until asked to wrap up
struct CooperativeAgent;

#[async_trait]
impl Agent for CooperativeAgent {
    async fn run(&self, ctx: AgentContext) -> harrier_core::Result<AgentSummary> {
        ctx.until_wrap_up().await;
        Ok(AgentSummary::success(
            &ctx.node.id,
            &ctx.node.mission,
            "wrapped up on request",
        ))
    }
}

/// Root that parks a watcher child and waits for the wind-down signal
struct CooperativeRoot;

#[async_trait]
impl Agent for CooperativeRoot {
    async fn run(&self, ctx: AgentContext) -> harrier_core::Result<AgentSummary> {
        ctx.delegate(
            "watch the callback channel",
            [Skill::OobProbe].into_iter().collect(),
            0.5,
            Arc::new(CooperativeAgent),
        )
        .await?;
        ctx.until_wrap_up().await;
        ctx.await_children().await?;
        Ok(AgentSummary::success(
            &ctx.node.id,
            &ctx.node.mission,
            "suspending cleanly",
        )
        .with_next_steps(vec!["resume with the queued crawl".to_string()]))
    }
}

#[tokio::test]
async fn test_wind_down_then_resume_hands_back_continuation() {
    let temp = TempDir::new().expect("should create temp dir");
    let store = disk_store(&temp);
    let config = test_config();
    let runtime = ScanRuntime::start(config.clone(), Arc::clone(&store), "app.example.com")
        .await
        .expect("should start session");
    let session_id = runtime.session().id.clone();

    runtime
        .launch_root("long assessment", SkillSet::full(), Arc::new(CooperativeRoot))
        .await
        .expect("should launch root");
    // Let the tree spawn and park before suspending it.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let continuation = runtime
        .wind_down("operator pause")
        .await
        .expect("should wind down");
    assert!(continuation
        .completed_missions
        .contains(&"long assessment".to_string()));
    assert!(continuation
        .completed_missions
        .contains(&"watch the callback channel".to_string()));
    assert!(continuation.pending_missions.is_empty());
    assert_eq!(
        continuation.priority_followups,
        vec!["resume with the queued crawl".to_string()]
    );
    assert!(continuation
        .notes
        .iter()
        .any(|note| note.contains("operator pause")));

    let suspended = store
        .load_session(&session_id)
        .await
        .expect("should load session");
    assert_eq!(suspended.status, SessionStatus::Suspended);

    let (resumed, restored) = ScanRuntime::resume(config, Arc::clone(&store), &session_id)
        .await
        .expect("should resume");
    let restored = restored.expect("continuation should survive the restart");
    assert_eq!(restored.completed_missions.len(), 2);
    assert_eq!(resumed.session().id, session_id);

    let active = store
        .load_session(&session_id)
        .await
        .expect("should load session");
    assert_eq!(active.status, SessionStatus::Active);

    let finalized = resumed.finalize().await.expect("should finalize");
    assert_eq!(finalized.status, SessionStatus::Finalized);
}

/// Agent that plants one out-of-band probe and reports its callback host
struct CallbackProbe;

#[async_trait]
impl Agent for CallbackProbe {
    async fn run(&self, ctx: AgentContext) -> harrier_core::Result<AgentSummary> {
        let token = ctx.issue_token();
        let host = ctx.oob().callback_host(&token);
        Ok(AgentSummary::success(
            &ctx.node.id,
            &ctx.node.mission,
            "planted one callback probe",
        )
        .with_key_findings(vec![host]))
    }
}

#[tokio::test]
async fn test_oob_callback_lands_as_draft_finding() {
    let temp = TempDir::new().expect("should create temp dir");
    let store = disk_store(&temp);
    let runtime = ScanRuntime::start(test_config(), Arc::clone(&store), "app.example.com")
        .await
        .expect("should start session");

    let root = runtime
        .launch_root("plant callback probes", SkillSet::full(), Arc::new(CallbackProbe))
        .await
        .expect("should launch root");
    runtime.wait_for_all().await;

    let summary = runtime
        .orchestrator()
        .root_summary()
        .await
        .expect("root summary should be retained");
    let host = summary
        .key_findings
        .first()
        .expect("callback host should be reported")
        .clone();

    // The listener boundary hands the DNS query back to the engine.
    let event = InteractionEvent::new(
        IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7)),
        OobProtocol::Dns,
        host,
    );
    let matched = runtime
        .oob()
        .ingest_event(event)
        .await
        .expect("should ingest")
        .expect("event should match the issued token");
    assert_eq!(matched.issuer_agent_id, root.id);

    let delivered = runtime.oob().poll(&root.id);
    assert_eq!(delivered.len(), 1);

    let findings = store
        .query_findings(FindingFilter::default())
        .await
        .expect("should query");
    assert_eq!(findings.len(), 1);
    let finding = &findings[0];
    assert_eq!(finding.class, FindingClass::OutOfBand);
    assert_eq!(finding.severity, Severity::High);
    assert_eq!(finding.status, FindingStatus::Draft);

    let evidence = store
        .evidence_for(&finding.id)
        .await
        .expect("should fetch evidence");
    assert_eq!(evidence.len(), 1);
    assert_eq!(evidence[0].proof, ProofKind::OobInteraction);

    runtime.finalize().await.expect("should finalize");
}
