//! High-level persistence facade over the scan database.
//!
//! `KnowledgeStore` owns a small pool of SQLite connections and serializes
//! writers per logical key (target identifier, finding id, artifact path plus
//! content hash) rather than behind one global lock. Cross-connection write
//! contention surfaces as SQLite busy errors; those are retried with
//! exponential backoff and escalate to [`Error::StoreConflict`] once the
//! attempts run out.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use chrono::Utc;
use dashmap::DashMap;
use rusqlite::{params, params_from_iter, Connection};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::store::migrations::run_migrations;
use crate::store::models::{
    canonical_category, content_hash, Artifact, EvidenceRef, Finding, FindingDraft, FindingStatus,
    ProofKind, Severity, Target, ToolInvocation, SELECT_ARTIFACT, SELECT_FINDING,
};
use crate::store::session::{ContinuationState, ScanSession, SessionStatus, CONTINUATION_VERSION};

/// Pooled connections for a file-backed store
const POOL_SIZE: usize = 4;

/// Additional attempts after the first when SQLite reports busy
const BUSY_RETRIES: usize = 3;

/// How long each connection waits on the SQLite write lock before
/// reporting busy
const BUSY_TIMEOUT: Duration = Duration::from_millis(500);

/// Filter for [`KnowledgeStore::query_findings`]. Empty filter matches all.
#[derive(Debug, Clone, Default)]
pub struct FindingFilter {
    pub target_id: Option<String>,
    pub severity: Option<Severity>,
    pub status: Option<FindingStatus>,
    pub created_by: Option<String>,
}

/// Filter for [`KnowledgeStore::query_artifacts`]. The category prefix
/// matches the exact path and everything nested under it.
#[derive(Debug, Clone, Default)]
pub struct ArtifactFilter {
    pub target_id: Option<String>,
    pub category_prefix: Option<Vec<String>>,
    pub created_by: Option<String>,
}

/// Ranked hits from [`KnowledgeStore::search`]
#[derive(Debug, Clone, Default)]
pub struct SearchResults {
    pub findings: Vec<Finding>,
    pub artifacts: Vec<Artifact>,
}

impl SearchResults {
    pub fn is_empty(&self) -> bool {
        self.findings.is_empty() && self.artifacts.is_empty()
    }
}

/// Durable knowledge store shared by every agent in a scan
pub struct KnowledgeStore {
    pool: Vec<Arc<Mutex<Connection>>>,
    key_locks: DashMap<String, Arc<Mutex<()>>>,
    read_cursor: AtomicUsize,
}

impl KnowledgeStore {
    /// Open (or create) a file-backed store at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut pool = Vec::with_capacity(POOL_SIZE);
        for i in 0..POOL_SIZE {
            let conn = Connection::open(path)?;
            configure_connection(&conn)?;
            if i == 0 {
                run_migrations(&conn)?;
            }
            pool.push(Arc::new(Mutex::new(conn)));
        }

        debug!(path = %path.display(), pool = POOL_SIZE, "opened knowledge store");
        Ok(Self {
            pool,
            key_locks: DashMap::new(),
            read_cursor: AtomicUsize::new(0),
        })
    }

    /// Open an in-memory store. The pool degenerates to one connection
    /// because each `:memory:` handle sees its own database.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        run_migrations(&conn)?;
        Ok(Self {
            pool: vec![Arc::new(Mutex::new(conn))],
            key_locks: DashMap::new(),
            read_cursor: AtomicUsize::new(0),
        })
    }

    fn conn_for(&self, key: &str) -> Arc<Mutex<Connection>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let idx = (hasher.finish() as usize) % self.pool.len();
        Arc::clone(&self.pool[idx])
    }

    fn read_conn(&self) -> Arc<Mutex<Connection>> {
        let idx = self.read_cursor.fetch_add(1, Ordering::Relaxed) % self.pool.len();
        Arc::clone(&self.pool[idx])
    }

    fn key_lock(&self, key: &str) -> Arc<Mutex<()>> {
        Arc::clone(&self.key_locks.entry(key.to_string()).or_default())
    }

    /// Run `op` on the connection for `key`, retrying while SQLite reports
    /// the database busy or locked
    async fn with_conn<T, F>(&self, key: &str, op: F) -> Result<T>
    where
        F: Fn(&Connection) -> Result<T>,
    {
        let conn = self.conn_for(key);
        let attempt = || async {
            let guard = conn.lock().await;
            op(&guard)
        };

        match attempt.retry(busy_backoff()).when(is_busy_error).await {
            Ok(value) => Ok(value),
            Err(err) if is_busy_error(&err) => {
                warn!(key, error = %err, "store contention exhausted retries");
                Err(Error::StoreConflict {
                    attempts: BUSY_RETRIES + 1,
                    message: err.to_string(),
                })
            }
            Err(err) => Err(err),
        }
    }

    /// Run a read-only `op` on the next pooled connection
    async fn with_read<T, F>(&self, op: F) -> Result<T>
    where
        F: Fn(&Connection) -> Result<T>,
    {
        let conn = self.read_conn();
        let guard = conn.lock().await;
        op(&guard)
    }

    // ------------------------------------------------------------------
    // Targets
    // ------------------------------------------------------------------

    /// Register `identifier` as a target, or refresh its last-seen time if
    /// it is already known. Returns the stored row either way.
    pub async fn upsert_target(&self, identifier: &str) -> Result<Target> {
        let identifier = identifier.trim().to_string();
        if identifier.is_empty() {
            return Err(Error::Config("target identifier is empty".to_string()));
        }

        let key = format!("target:{identifier}");
        let lock = self.key_lock(&key);
        let _guard = lock.lock().await;

        self.with_conn(&key, move |conn| {
            let candidate = Target::new(&identifier);
            conn.execute(
                "INSERT INTO targets (id, identifier, kind, first_seen_at, last_seen_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(identifier) DO UPDATE SET last_seen_at = excluded.last_seen_at",
                params![
                    candidate.id,
                    candidate.identifier,
                    candidate.kind.to_string(),
                    candidate.first_seen_at.to_rfc3339(),
                    candidate.last_seen_at.to_rfc3339(),
                ],
            )?;
            Target::find_by_identifier(conn, &identifier)?
                .ok_or_else(|| Error::NotFound(format!("target {identifier}")))
        })
        .await
    }

    /// Look up a target by id
    pub async fn target(&self, id: &str) -> Result<Option<Target>> {
        let id = id.to_string();
        self.with_read(move |conn| Target::find_by_id(conn, &id)).await
    }

    /// Look up a target by its identifier (hostname, address, URL)
    pub async fn find_target(&self, identifier: &str) -> Result<Option<Target>> {
        let identifier = identifier.trim().to_string();
        self.with_read(move |conn| Target::find_by_identifier(conn, &identifier))
            .await
    }

    // ------------------------------------------------------------------
    // Findings
    // ------------------------------------------------------------------

    /// Record a new finding against `target_id`. Findings start in draft
    /// status.
    pub async fn record_finding(&self, target_id: &str, draft: FindingDraft) -> Result<Finding> {
        let target_id = target_id.to_string();
        let key = format!("target:{target_id}");

        self.with_conn(&key, move |conn| {
            if Target::find_by_id(conn, &target_id)?.is_none() {
                return Err(Error::NotFound(format!("target {target_id}")));
            }
            let finding = Finding::from_draft(&target_id, draft.clone());
            finding.insert(conn)?;
            Ok(finding)
        })
        .await
    }

    /// Fetch a single finding
    pub async fn finding(&self, id: &str) -> Result<Option<Finding>> {
        let id = id.to_string();
        self.with_read(move |conn| Finding::find_by_id(conn, &id)).await
    }

    /// Attach an artifact to a finding as evidence. Links are ordered by
    /// attachment; linking the same artifact twice is a no-op.
    pub async fn link_evidence(
        &self,
        finding_id: &str,
        artifact_id: &str,
        proof: ProofKind,
    ) -> Result<()> {
        let finding_id = finding_id.to_string();
        let artifact_id = artifact_id.to_string();
        let key = format!("finding:{finding_id}");
        let lock = self.key_lock(&key);
        let _guard = lock.lock().await;

        self.with_conn(&key, move |conn| {
            // Rolls back as a unit if a retry interrupts the link mid-way
            let tx = conn.unchecked_transaction()?;

            if Finding::find_by_id(&tx, &finding_id)?.is_none() {
                return Err(Error::NotFound(format!("finding {finding_id}")));
            }
            if Artifact::find_by_id(&tx, &artifact_id)?.is_none() {
                return Err(Error::NotFound(format!("artifact {artifact_id}")));
            }

            let already_linked: bool = tx.query_row(
                "SELECT COUNT(*) FROM finding_evidence WHERE finding_id = ?1 AND artifact_id = ?2",
                params![finding_id, artifact_id],
                |row| row.get::<_, i64>(0).map(|n| n > 0),
            )?;
            if already_linked {
                return Ok(());
            }

            let position: i64 = tx.query_row(
                "SELECT COALESCE(MAX(position) + 1, 0) FROM finding_evidence WHERE finding_id = ?1",
                params![finding_id],
                |row| row.get(0),
            )?;
            tx.execute(
                "INSERT INTO finding_evidence (finding_id, artifact_id, proof, position)
                 VALUES (?1, ?2, ?3, ?4)",
                params![finding_id, artifact_id, proof.to_string(), position],
            )?;
            tx.execute(
                "UPDATE findings SET updated_at = ?1 WHERE id = ?2",
                params![Utc::now().to_rfc3339(), finding_id],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    /// Evidence links for a finding, in attachment order
    pub async fn evidence_for(&self, finding_id: &str) -> Result<Vec<EvidenceRef>> {
        let finding_id = finding_id.to_string();
        self.with_read(move |conn| {
            let finding = Finding::find_by_id(conn, &finding_id)?
                .ok_or_else(|| Error::NotFound(format!("finding {finding_id}")))?;
            finding.evidence(conn)
        })
        .await
    }

    /// Move a finding to `status`. Transitioning to reported requires at
    /// least one evidence link whose proof kind is accepted by the finding
    /// class; duplicates must go through [`KnowledgeStore::mark_duplicate`].
    pub async fn set_finding_status(
        &self,
        finding_id: &str,
        status: FindingStatus,
    ) -> Result<Finding> {
        if status == FindingStatus::Duplicate {
            return Err(Error::Config(
                "duplicate status is set via mark_duplicate".to_string(),
            ));
        }

        let finding_id = finding_id.to_string();
        let key = format!("finding:{finding_id}");
        let lock = self.key_lock(&key);
        let _guard = lock.lock().await;

        self.with_conn(&key, move |conn| {
            let finding = Finding::find_by_id(conn, &finding_id)?
                .ok_or_else(|| Error::NotFound(format!("finding {finding_id}")))?;

            if status == FindingStatus::Reported {
                let evidence = finding.evidence(conn)?;
                let proven = evidence.iter().any(|link| finding.class.accepts(link.proof));
                if !proven {
                    return Err(Error::EvidenceRequired(format!(
                        "finding {finding_id} ({} class) has no accepted proof",
                        finding.class
                    )));
                }
            }

            conn.execute(
                "UPDATE findings SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![status.to_string(), Utc::now().to_rfc3339(), finding_id],
            )?;
            Finding::find_by_id(conn, &finding_id)?
                .ok_or_else(|| Error::NotFound(format!("finding {finding_id}")))
        })
        .await
    }

    /// Mark `finding_id` as a duplicate of `duplicate_of`
    pub async fn mark_duplicate(&self, finding_id: &str, duplicate_of: &str) -> Result<()> {
        if finding_id == duplicate_of {
            return Err(Error::Config(
                "a finding cannot be a duplicate of itself".to_string(),
            ));
        }

        let finding_id = finding_id.to_string();
        let duplicate_of = duplicate_of.to_string();
        let key = format!("finding:{finding_id}");
        let lock = self.key_lock(&key);
        let _guard = lock.lock().await;

        self.with_conn(&key, move |conn| {
            if Finding::find_by_id(conn, &finding_id)?.is_none() {
                return Err(Error::NotFound(format!("finding {finding_id}")));
            }
            if Finding::find_by_id(conn, &duplicate_of)?.is_none() {
                return Err(Error::NotFound(format!("finding {duplicate_of}")));
            }
            conn.execute(
                "UPDATE findings SET status = ?1, duplicate_of = ?2, updated_at = ?3 WHERE id = ?4",
                params![
                    FindingStatus::Duplicate.to_string(),
                    duplicate_of,
                    Utc::now().to_rfc3339(),
                    finding_id,
                ],
            )?;
            Ok(())
        })
        .await
    }

    /// Query findings, oldest first. An empty filter returns everything.
    pub async fn query_findings(&self, filter: FindingFilter) -> Result<Vec<Finding>> {
        self.with_read(move |conn| {
            let mut sql = format!("{SELECT_FINDING} WHERE 1=1");
            let mut args: Vec<String> = Vec::new();

            if let Some(target_id) = &filter.target_id {
                args.push(target_id.clone());
                sql.push_str(&format!(" AND target_id = ?{}", args.len()));
            }
            if let Some(severity) = filter.severity {
                args.push(severity.to_string());
                sql.push_str(&format!(" AND severity = ?{}", args.len()));
            }
            if let Some(status) = filter.status {
                args.push(status.to_string());
                sql.push_str(&format!(" AND status = ?{}", args.len()));
            }
            if let Some(created_by) = &filter.created_by {
                args.push(created_by.clone());
                sql.push_str(&format!(" AND created_by = ?{}", args.len()));
            }
            sql.push_str(" ORDER BY created_at ASC, id ASC");

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(args.iter()), Finding::from_row)?;
            let mut findings = Vec::new();
            for row in rows {
                findings.push(row?);
            }
            Ok(findings)
        })
        .await
    }

    /// One human-readable line per non-duplicate finding, most severe first
    pub async fn findings_summary(&self) -> Result<Vec<String>> {
        let mut findings = self.query_findings(FindingFilter::default()).await?;
        findings.retain(|f| f.status != FindingStatus::Duplicate);
        findings.sort_by(|a, b| {
            a.severity
                .rank()
                .cmp(&b.severity.rank())
                .then(a.created_at.cmp(&b.created_at))
        });
        Ok(findings
            .iter()
            .map(|f| format!("{}: {} ({})", f.severity, f.title, f.status))
            .collect())
    }

    // ------------------------------------------------------------------
    // Artifacts
    // ------------------------------------------------------------------

    /// Store an artifact under `category_path`. Saving an identical payload
    /// under the same path returns the existing artifact instead of a new
    /// row.
    pub async fn save_artifact(
        &self,
        category_path: Vec<String>,
        payload: Vec<u8>,
        linked_target_id: Option<String>,
        created_by: &str,
    ) -> Result<Artifact> {
        let canonical = canonical_category(&category_path)?;
        let hash = content_hash(&payload);
        let created_by = created_by.to_string();

        let key = format!("artifact:{canonical}:{hash}");
        let lock = self.key_lock(&key);
        let _guard = lock.lock().await;

        self.with_conn(&key, move |conn| {
            if let Some(existing) = find_artifact_by_path_hash(conn, &canonical, &hash)? {
                debug!(artifact_id = %existing.id, category = %canonical, "artifact dedup hit");
                return Ok(existing);
            }

            if let Some(target_id) = &linked_target_id {
                if Target::find_by_id(conn, target_id)?.is_none() {
                    return Err(Error::NotFound(format!("target {target_id}")));
                }
            }

            let mut artifact = Artifact::new(category_path.clone(), payload.clone(), &created_by);
            if let Some(target_id) = &linked_target_id {
                artifact = artifact.with_target(target_id);
            }

            let inserted = conn.execute(
                "INSERT INTO artifacts (id, category_path, content_hash, payload, \
                 linked_target_id, created_by, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    artifact.id,
                    canonical,
                    artifact.content_hash,
                    artifact.payload,
                    artifact.linked_target_id,
                    artifact.created_by,
                    artifact.created_at.to_rfc3339(),
                ],
            );
            match inserted {
                Ok(_) => Ok(artifact),
                // Lost a cross-process race on (path, hash); the winner's row
                // is the canonical one
                Err(err) if is_unique_violation(&err) => {
                    find_artifact_by_path_hash(conn, &canonical, &hash)?
                        .ok_or_else(|| Error::Database(err))
                }
                Err(err) => Err(err.into()),
            }
        })
        .await
    }

    /// Fetch a single artifact
    pub async fn artifact(&self, id: &str) -> Result<Option<Artifact>> {
        let id = id.to_string();
        self.with_read(move |conn| Artifact::find_by_id(conn, &id)).await
    }

    /// Query artifacts, oldest first. An empty filter returns everything.
    pub async fn query_artifacts(&self, filter: ArtifactFilter) -> Result<Vec<Artifact>> {
        let prefix = match &filter.category_prefix {
            Some(segments) => Some(canonical_category(segments)?),
            None => None,
        };

        self.with_read(move |conn| {
            let mut sql = format!("{SELECT_ARTIFACT} WHERE 1=1");
            let mut args: Vec<String> = Vec::new();

            if let Some(target_id) = &filter.target_id {
                args.push(target_id.clone());
                sql.push_str(&format!(" AND linked_target_id = ?{}", args.len()));
            }
            if let Some(canonical) = &prefix {
                args.push(canonical.clone());
                let exact = args.len();
                args.push(format!("{}/%", escape_like(canonical)));
                sql.push_str(&format!(
                    " AND (category_path = ?{exact} OR category_path LIKE ?{} ESCAPE '\\')",
                    args.len()
                ));
            }
            if let Some(created_by) = &filter.created_by {
                args.push(created_by.clone());
                sql.push_str(&format!(" AND created_by = ?{}", args.len()));
            }
            sql.push_str(" ORDER BY created_at ASC, id ASC");

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(args.iter()), Artifact::from_row)?;
            let mut artifacts = Vec::new();
            for row in rows {
                artifacts.push(row?);
            }
            Ok(artifacts)
        })
        .await
    }

    // ------------------------------------------------------------------
    // Search
    // ------------------------------------------------------------------

    /// Substring search over finding titles and details plus artifact
    /// category paths. Title matches rank above detail matches; each list
    /// is ordered best match first.
    pub async fn search(&self, text: &str) -> Result<SearchResults> {
        let needle = text.trim();
        if needle.is_empty() {
            return Ok(SearchResults::default());
        }
        let pattern = format!("%{}%", escape_like(needle));

        self.with_read(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, target_id, title, detail, class, severity, status, duplicate_of, \
                 created_by, created_at, updated_at, \
                 (CASE WHEN title LIKE ?1 ESCAPE '\\' THEN 10 ELSE 0 END \
                  + CASE WHEN COALESCE(detail, '') LIKE ?1 ESCAPE '\\' THEN 5 ELSE 0 END) AS score \
                 FROM findings \
                 WHERE title LIKE ?1 ESCAPE '\\' OR COALESCE(detail, '') LIKE ?1 ESCAPE '\\' \
                 ORDER BY score DESC, created_at DESC",
            )?;
            let rows = stmt.query_map([&pattern], Finding::from_row)?;
            let mut findings = Vec::new();
            for row in rows {
                findings.push(row?);
            }

            let mut stmt = conn.prepare(&format!(
                "{SELECT_ARTIFACT} WHERE category_path LIKE ?1 ESCAPE '\\' \
                 ORDER BY created_at DESC"
            ))?;
            let rows = stmt.query_map([&pattern], Artifact::from_row)?;
            let mut artifacts = Vec::new();
            for row in rows {
                artifacts.push(row?);
            }

            Ok(SearchResults { findings, artifacts })
        })
        .await
    }

    // ------------------------------------------------------------------
    // Tool audit trail
    // ------------------------------------------------------------------

    /// Append a tool invocation to the audit trail
    pub async fn record_invocation(&self, invocation: &ToolInvocation) -> Result<()> {
        let invocation = invocation.clone();
        let key = format!("invocation:{}", invocation.agent_id);
        self.with_conn(&key, move |conn| invocation.insert(conn)).await
    }

    /// Number of recorded invocations for an agent
    pub async fn invocation_count(&self, agent_id: &str) -> Result<u64> {
        let agent_id = agent_id.to_string();
        self.with_read(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM tool_invocations WHERE agent_id = ?1",
                params![agent_id],
                |row| row.get(0),
            )?;
            Ok(count.unsigned_abs())
        })
        .await
    }

    // ------------------------------------------------------------------
    // Sessions and continuations
    // ------------------------------------------------------------------

    /// Start a new scan session against `target_id`
    pub async fn create_session(
        &self,
        target_id: &str,
        total_budget: Duration,
    ) -> Result<ScanSession> {
        if total_budget.is_zero() {
            return Err(Error::Config("session budget must be positive".to_string()));
        }

        let target_id = target_id.to_string();
        let session = ScanSession::new(&target_id, total_budget);
        let key = format!("session:{}", session.id);
        let lock = self.key_lock(&key);
        let _guard = lock.lock().await;

        self.with_conn(&key, move |conn| {
            if Target::find_by_id(conn, &target_id)?.is_none() {
                return Err(Error::NotFound(format!("target {target_id}")));
            }
            session.insert(conn)?;
            Ok(session.clone())
        })
        .await
    }

    /// Load a session by id
    pub async fn load_session(&self, session_id: &str) -> Result<ScanSession> {
        let session_id = session_id.to_string();
        self.with_read(move |conn| {
            ScanSession::find_by_id(conn, &session_id)?
                .ok_or_else(|| Error::SessionNotFound(session_id.clone()))
        })
        .await
    }

    /// Mark a session suspended. The continuation blob, if any, stays in
    /// place for a later resume.
    pub async fn suspend_session(&self, session_id: &str) -> Result<ScanSession> {
        self.update_session_status(session_id, SessionStatus::Suspended, false)
            .await
    }

    /// Reopen a suspended session so a fresh runtime can pick it up.
    /// Finalized sessions are closed for good and cannot be resumed.
    pub async fn resume_session(&self, session_id: &str) -> Result<ScanSession> {
        let sid = session_id.to_string();
        let key = format!("session:{sid}");
        let lock = self.key_lock(&key);
        let _guard = lock.lock().await;

        self.with_conn(&key, move |conn| {
            let session = ScanSession::find_by_id(conn, &sid)?
                .ok_or_else(|| Error::SessionNotFound(sid.clone()))?;
            if session.status == SessionStatus::Finalized {
                return Err(Error::Config(format!(
                    "session {sid} is finalized and cannot be resumed"
                )));
            }
            conn.execute(
                "UPDATE sessions SET status = ?1 WHERE id = ?2",
                params![SessionStatus::Active.to_string(), sid],
            )?;
            ScanSession::find_by_id(conn, &sid)?
                .ok_or_else(|| Error::SessionNotFound(sid.clone()))
        })
        .await
    }

    /// Mark a session finalized and drop its continuation blob
    pub async fn finalize_session(&self, session_id: &str) -> Result<ScanSession> {
        self.update_session_status(session_id, SessionStatus::Finalized, true)
            .await
    }

    async fn update_session_status(
        &self,
        session_id: &str,
        status: SessionStatus,
        terminal: bool,
    ) -> Result<ScanSession> {
        let session_id = session_id.to_string();
        let key = format!("session:{session_id}");
        let lock = self.key_lock(&key);
        let _guard = lock.lock().await;

        self.with_conn(&key, move |conn| {
            let tx = conn.unchecked_transaction()?;
            if ScanSession::find_by_id(&tx, &session_id)?.is_none() {
                return Err(Error::SessionNotFound(session_id.clone()));
            }
            if terminal {
                tx.execute(
                    "UPDATE sessions SET status = ?1, finalized_at = ?2 WHERE id = ?3",
                    params![status.to_string(), Utc::now().to_rfc3339(), session_id],
                )?;
                tx.execute(
                    "DELETE FROM continuations WHERE session_id = ?1",
                    params![session_id],
                )?;
            } else {
                tx.execute(
                    "UPDATE sessions SET status = ?1 WHERE id = ?2",
                    params![status.to_string(), session_id],
                )?;
            }
            let updated = ScanSession::find_by_id(&tx, &session_id)?
                .ok_or_else(|| Error::SessionNotFound(session_id.clone()))?;
            tx.commit()?;
            Ok(updated)
        })
        .await
    }

    /// Persist the continuation blob for a session, replacing any earlier
    /// snapshot
    pub async fn snapshot_continuation(&self, state: &ContinuationState) -> Result<()> {
        let state = state.clone();
        let key = format!("session:{}", state.session_id);
        let lock = self.key_lock(&key);
        let _guard = lock.lock().await;

        self.with_conn(&key, move |conn| {
            if ScanSession::find_by_id(conn, &state.session_id)?.is_none() {
                return Err(Error::SessionNotFound(state.session_id.clone()));
            }
            let blob = serde_json::to_string(&state)?;
            conn.execute(
                "INSERT INTO continuations (session_id, version, state, saved_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(session_id) DO UPDATE SET
                     version = excluded.version,
                     state = excluded.state,
                     saved_at = excluded.saved_at",
                params![
                    state.session_id,
                    state.version,
                    blob,
                    state.saved_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
        .await
    }

    /// Load the continuation blob for a session, if one was saved. Fails on
    /// a version this build does not understand.
    pub async fn load_continuation(&self, session_id: &str) -> Result<Option<ContinuationState>> {
        let session_id = session_id.to_string();
        self.with_read(move |conn| {
            let row: Option<(u32, String)> = conn
                .query_row(
                    "SELECT version, state FROM continuations WHERE session_id = ?1",
                    params![session_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .map(Some)
                .or_else(|err| match err {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(other),
                })?;

            match row {
                None => Ok(None),
                Some((version, _)) if version != CONTINUATION_VERSION => Err(Error::Config(
                    format!(
                        "unsupported continuation version {version} (supported: {CONTINUATION_VERSION})"
                    ),
                )),
                Some((_, blob)) => Ok(Some(serde_json::from_str(&blob)?)),
            }
        })
        .await
    }
}

fn configure_connection(conn: &Connection) -> Result<()> {
    conn.busy_timeout(BUSY_TIMEOUT)?;
    // journal_mode reports the resulting mode as a row
    let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    Ok(())
}

fn find_artifact_by_path_hash(
    conn: &Connection,
    canonical: &str,
    hash: &str,
) -> Result<Option<Artifact>> {
    let mut stmt = conn.prepare(&format!(
        "{SELECT_ARTIFACT} WHERE category_path = ?1 AND content_hash = ?2"
    ))?;
    let mut rows = stmt.query(params![canonical, hash])?;
    if let Some(row) = rows.next()? {
        Ok(Some(Artifact::from_row(row)?))
    } else {
        Ok(None)
    }
}

fn busy_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(25))
        .with_max_delay(Duration::from_millis(250))
        .with_max_times(BUSY_RETRIES)
        .with_jitter()
}

/// True when the underlying SQLite error is a transient busy or locked
/// report
fn is_busy_error(err: &Error) -> bool {
    match err {
        Error::Database(rusqlite::Error::SqliteFailure(code, _)) => matches!(
            code.code,
            rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
        ),
        _ => false,
    }
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(code, _)
            if code.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

/// Escape SQL LIKE special characters to prevent pattern injection
fn escape_like(s: &str) -> String {
    s.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}
