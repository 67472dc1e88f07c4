//! Database schema definitions

/// SQL to create all tables
pub const SCHEMA: &str = r#"
-- Core entities
CREATE TABLE IF NOT EXISTS targets (
    id TEXT PRIMARY KEY,
    identifier TEXT NOT NULL UNIQUE,
    kind TEXT NOT NULL DEFAULT 'other',
    first_seen_at TEXT NOT NULL,
    last_seen_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS findings (
    id TEXT PRIMARY KEY,
    target_id TEXT NOT NULL REFERENCES targets(id),
    title TEXT NOT NULL,
    detail TEXT,
    class TEXT NOT NULL DEFAULT 'other',
    severity TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'draft',
    duplicate_of TEXT REFERENCES findings(id),
    created_by TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS artifacts (
    id TEXT PRIMARY KEY,
    category_path TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    payload BLOB NOT NULL,
    linked_target_id TEXT REFERENCES targets(id),
    created_by TEXT NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE(category_path, content_hash)
);

-- Ordered evidence links between findings and artifacts
CREATE TABLE IF NOT EXISTS finding_evidence (
    finding_id TEXT NOT NULL REFERENCES findings(id),
    artifact_id TEXT NOT NULL REFERENCES artifacts(id),
    proof TEXT NOT NULL,
    position INTEGER NOT NULL,
    PRIMARY KEY (finding_id, artifact_id)
);

-- Scan sessions and suspend/resume state
CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    target_id TEXT NOT NULL REFERENCES targets(id),
    total_budget_secs INTEGER NOT NULL,
    started_at TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'active',
    finalized_at TEXT
);

CREATE TABLE IF NOT EXISTS continuations (
    session_id TEXT PRIMARY KEY REFERENCES sessions(id),
    version INTEGER NOT NULL,
    state TEXT NOT NULL,
    saved_at TEXT NOT NULL
);

-- Tool audit trail
CREATE TABLE IF NOT EXISTS tool_invocations (
    id TEXT PRIMARY KEY,
    agent_id TEXT NOT NULL,
    command TEXT NOT NULL,
    args TEXT NOT NULL,
    exit_code INTEGER,
    stdout TEXT,
    stderr TEXT,
    started_at TEXT NOT NULL,
    completed_at TEXT
);

-- Create indexes for common queries
CREATE INDEX IF NOT EXISTS idx_findings_target ON findings(target_id);
CREATE INDEX IF NOT EXISTS idx_findings_status ON findings(status);
CREATE INDEX IF NOT EXISTS idx_findings_severity ON findings(severity);
CREATE INDEX IF NOT EXISTS idx_findings_created ON findings(created_at);
CREATE INDEX IF NOT EXISTS idx_artifacts_category ON artifacts(category_path);
CREATE INDEX IF NOT EXISTS idx_artifacts_target ON artifacts(linked_target_id);
CREATE INDEX IF NOT EXISTS idx_evidence_finding ON finding_evidence(finding_id);
CREATE INDEX IF NOT EXISTS idx_sessions_target ON sessions(target_id);
CREATE INDEX IF NOT EXISTS idx_invocations_agent ON tool_invocations(agent_id);
"#;
