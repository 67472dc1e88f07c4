//! Integration tests for concurrent access to a file-backed knowledge store

use std::sync::Arc;
use std::time::Duration;

use harrier_core::store::{
    ArtifactFilter, FindingClass, FindingDraft, FindingFilter, KnowledgeStore, ProofKind,
    Severity, ToolInvocation,
};
use tempfile::TempDir;

fn disk_store(temp: &TempDir) -> Arc<KnowledgeStore> {
    let path = temp.path().join("knowledge.db");
    Arc::new(KnowledgeStore::open(path).expect("should open store"))
}

#[tokio::test]
async fn test_concurrent_upserts_converge_on_one_target() {
    let temp = TempDir::new().expect("should create temp dir");
    let store = disk_store(&temp);

    let mut handles = Vec::new();
    for _ in 0..16 {
        let store = Arc::clone(&store);
        handles.push(tokio::spawn(async move {
            store.upsert_target("app.example.com").await
        }));
    }

    let mut ids = Vec::new();
    for handle in handles {
        let target = handle.await.expect("should join").expect("should upsert");
        ids.push(target.id);
    }
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 1, "every writer should land on the same row");

    let found = store
        .find_target("app.example.com")
        .await
        .expect("should query")
        .expect("should exist");
    assert_eq!(Some(&found.id), ids.first());
}

#[tokio::test]
async fn test_identical_artifacts_dedup_across_writers() {
    let temp = TempDir::new().expect("should create temp dir");
    let store = disk_store(&temp);
    let target = store
        .upsert_target("example.com")
        .await
        .expect("should upsert");

    let mut handles = Vec::new();
    for i in 0..8 {
        let store = Arc::clone(&store);
        let target_id = target.id.clone();
        handles.push(tokio::spawn(async move {
            store
                .save_artifact(
                    vec!["recon".to_string(), "ports".to_string()],
                    b"22/tcp open ssh".to_vec(),
                    Some(target_id),
                    &format!("agent-{i}"),
                )
                .await
        }));
    }

    let mut ids = Vec::new();
    for handle in handles {
        let artifact = handle.await.expect("should join").expect("should save");
        ids.push(artifact.id);
    }
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 1, "identical payloads should share one row");

    // A different payload under the same path is its own artifact.
    let other = store
        .save_artifact(
            vec!["recon".to_string(), "ports".to_string()],
            b"80/tcp open http".to_vec(),
            Some(target.id.clone()),
            "agent-9",
        )
        .await
        .expect("should save");
    assert_ne!(Some(&other.id), ids.first());

    let all = store
        .query_artifacts(ArtifactFilter {
            category_prefix: Some(vec!["recon".to_string()]),
            ..ArtifactFilter::default()
        })
        .await
        .expect("should query");
    assert_eq!(all.len(), 2);
}

#[tokio::test]
async fn test_parallel_evidence_links_keep_distinct_positions() {
    let temp = TempDir::new().expect("should create temp dir");
    let store = disk_store(&temp);
    let target = store
        .upsert_target("example.com")
        .await
        .expect("should upsert");
    let finding = store
        .record_finding(
            &target.id,
            FindingDraft::new("Directory listing enabled", Severity::Low, "agent-1")
                .with_class(FindingClass::Recon),
        )
        .await
        .expect("should record");

    let mut artifact_ids = Vec::new();
    for i in 0..6 {
        let artifact = store
            .save_artifact(
                vec!["recon".to_string(), "listings".to_string()],
                format!("index of /backup-{i}").into_bytes(),
                Some(target.id.clone()),
                "agent-1",
            )
            .await
            .expect("should save");
        artifact_ids.push(artifact.id);
    }

    let mut handles = Vec::new();
    for artifact_id in &artifact_ids {
        let store = Arc::clone(&store);
        let finding_id = finding.id.clone();
        let artifact_id = artifact_id.clone();
        handles.push(tokio::spawn(async move {
            store
                .link_evidence(&finding_id, &artifact_id, ProofKind::Note)
                .await
        }));
    }
    for handle in handles {
        handle.await.expect("should join").expect("should link");
    }

    let evidence = store
        .evidence_for(&finding.id)
        .await
        .expect("should fetch evidence");
    assert_eq!(evidence.len(), 6);

    let mut positions: Vec<i64> = evidence.iter().map(|link| link.position).collect();
    positions.sort_unstable();
    assert_eq!(positions, vec![0, 1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn test_mixed_workload_survives_contention() {
    let temp = TempDir::new().expect("should create temp dir");
    let store = disk_store(&temp);
    let target = store
        .upsert_target("example.com")
        .await
        .expect("should upsert");

    let mut handles = Vec::new();
    for i in 0..10 {
        let store = Arc::clone(&store);
        let target_id = target.id.clone();
        handles.push(tokio::spawn(async move {
            let agent = format!("agent-{i}");

            store
                .record_finding(
                    &target_id,
                    FindingDraft::new(
                        format!("Exposed endpoint number {i}"),
                        Severity::Medium,
                        &agent,
                    ),
                )
                .await?;

            store
                .save_artifact(
                    vec!["http".to_string(), "responses".to_string()],
                    format!("response body {i}").into_bytes(),
                    Some(target_id),
                    &agent,
                )
                .await?;

            let mut record = ToolInvocation::new(&agent, "probe", vec![format!("--run={i}")]);
            record.complete(0, format!("probe {i} done"), "");
            store.record_invocation(&record).await
        }));
    }
    for handle in handles {
        handle.await.expect("should join").expect("should write");
    }

    let findings = store
        .query_findings(FindingFilter {
            target_id: Some(target.id.clone()),
            ..FindingFilter::default()
        })
        .await
        .expect("should query");
    assert_eq!(findings.len(), 10);

    let artifacts = store
        .query_artifacts(ArtifactFilter::default())
        .await
        .expect("should query");
    assert_eq!(artifacts.len(), 10);

    let mut audited = 0;
    for i in 0..10 {
        audited += store
            .invocation_count(&format!("agent-{i}"))
            .await
            .expect("should count");
    }
    assert_eq!(audited, 10);
}

#[tokio::test]
async fn test_store_reopens_with_data_intact() {
    let temp = TempDir::new().expect("should create temp dir");
    let path = temp.path().join("knowledge.db");

    let session_id = {
        let store = KnowledgeStore::open(&path).expect("should open store");
        let target = store
            .upsert_target("persist.example.com")
            .await
            .expect("should upsert");
        store
            .record_finding(
                &target.id,
                FindingDraft::new("Stale admin panel", Severity::High, "agent-1"),
            )
            .await
            .expect("should record");
        let session = store
            .create_session(&target.id, Duration::from_secs(3600))
            .await
            .expect("should create session");
        session.id
    };

    // Reopen from disk, simulating a process restart.
    let store = KnowledgeStore::open(&path).expect("should reopen store");
    let target = store
        .find_target("persist.example.com")
        .await
        .expect("should query")
        .expect("target should survive restart");

    let findings = store
        .query_findings(FindingFilter {
            target_id: Some(target.id),
            ..FindingFilter::default()
        })
        .await
        .expect("should query");
    assert_eq!(findings.len(), 1);
    assert_eq!(findings[0].title, "Stale admin panel");

    let session = store
        .load_session(&session_id)
        .await
        .expect("should load session");
    assert_eq!(session.id, session_id);
}
