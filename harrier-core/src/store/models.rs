//! Data models for the knowledge store

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::Result;

/// Severity level for findings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
    Informational,
}

impl Severity {
    /// Sort rank, most severe first
    pub fn rank(self) -> u8 {
        match self {
            Severity::Critical => 1,
            Severity::High => 2,
            Severity::Medium => 3,
            Severity::Low => 4,
            Severity::Informational => 5,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Critical => write!(f, "critical"),
            Severity::High => write!(f, "high"),
            Severity::Medium => write!(f, "medium"),
            Severity::Low => write!(f, "low"),
            Severity::Informational => write!(f, "informational"),
        }
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "critical" => Ok(Severity::Critical),
            "high" => Ok(Severity::High),
            "medium" => Ok(Severity::Medium),
            "low" => Ok(Severity::Low),
            "informational" | "info" => Ok(Severity::Informational),
            _ => Err(format!("Unknown severity: {}", s)),
        }
    }
}

/// Finding lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FindingStatus {
    Draft,
    Validated,
    Reported,
    Duplicate,
    Escalated,
}

impl std::fmt::Display for FindingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FindingStatus::Draft => write!(f, "draft"),
            FindingStatus::Validated => write!(f, "validated"),
            FindingStatus::Reported => write!(f, "reported"),
            FindingStatus::Duplicate => write!(f, "duplicate"),
            FindingStatus::Escalated => write!(f, "escalated"),
        }
    }
}

impl std::str::FromStr for FindingStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "draft" => Ok(FindingStatus::Draft),
            "validated" => Ok(FindingStatus::Validated),
            "reported" => Ok(FindingStatus::Reported),
            "duplicate" => Ok(FindingStatus::Duplicate),
            "escalated" => Ok(FindingStatus::Escalated),
            _ => Err(format!("Unknown status: {}", s)),
        }
    }
}

/// Finding class, drives which proof kinds count as evidence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingClass {
    Injection,
    OutOfBand,
    Execution,
    Recon,
    Other,
}

impl FindingClass {
    /// Whether an evidence proof kind satisfies this class for reporting
    pub fn accepts(self, proof: ProofKind) -> bool {
        match self {
            FindingClass::Injection => matches!(
                proof,
                ProofKind::BooleanDifferential
                    | ProofKind::TimingDifferential
                    | ProofKind::ExtractedData
            ),
            FindingClass::OutOfBand => matches!(proof, ProofKind::OobInteraction),
            FindingClass::Execution => matches!(proof, ProofKind::CommandOutput),
            FindingClass::Recon | FindingClass::Other => true,
        }
    }
}

impl std::fmt::Display for FindingClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FindingClass::Injection => write!(f, "injection"),
            FindingClass::OutOfBand => write!(f, "out_of_band"),
            FindingClass::Execution => write!(f, "execution"),
            FindingClass::Recon => write!(f, "recon"),
            FindingClass::Other => write!(f, "other"),
        }
    }
}

impl std::str::FromStr for FindingClass {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "injection" => Ok(FindingClass::Injection),
            "out_of_band" | "oob" => Ok(FindingClass::OutOfBand),
            "execution" => Ok(FindingClass::Execution),
            "recon" => Ok(FindingClass::Recon),
            "other" => Ok(FindingClass::Other),
            _ => Err(format!("Unknown finding class: {}", s)),
        }
    }
}

/// Kind of proof carried by an evidence artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProofKind {
    BooleanDifferential,
    TimingDifferential,
    ExtractedData,
    OobInteraction,
    CommandOutput,
    Note,
}

impl std::fmt::Display for ProofKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProofKind::BooleanDifferential => write!(f, "boolean_differential"),
            ProofKind::TimingDifferential => write!(f, "timing_differential"),
            ProofKind::ExtractedData => write!(f, "extracted_data"),
            ProofKind::OobInteraction => write!(f, "oob_interaction"),
            ProofKind::CommandOutput => write!(f, "command_output"),
            ProofKind::Note => write!(f, "note"),
        }
    }
}

impl std::str::FromStr for ProofKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "boolean_differential" => Ok(ProofKind::BooleanDifferential),
            "timing_differential" => Ok(ProofKind::TimingDifferential),
            "extracted_data" => Ok(ProofKind::ExtractedData),
            "oob_interaction" => Ok(ProofKind::OobInteraction),
            "command_output" => Ok(ProofKind::CommandOutput),
            "note" => Ok(ProofKind::Note),
            _ => Err(format!("Unknown proof kind: {}", s)),
        }
    }
}

/// Target identifier kind, classified from the identifier text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    Domain,
    Ipv4,
    Ipv6,
    Cidr,
    Url,
    Other,
}

impl TargetKind {
    /// Classify a raw identifier
    pub fn classify(identifier: &str) -> Self {
        let trimmed = identifier.trim();
        if trimmed.contains("://") {
            return TargetKind::Url;
        }
        if trimmed.parse::<std::net::Ipv4Addr>().is_ok() {
            return TargetKind::Ipv4;
        }
        if trimmed.parse::<std::net::Ipv6Addr>().is_ok() {
            return TargetKind::Ipv6;
        }
        if let Some((addr, prefix)) = trimmed.split_once('/') {
            if addr.parse::<std::net::IpAddr>().is_ok() && prefix.parse::<u8>().is_ok() {
                return TargetKind::Cidr;
            }
        }
        if trimmed.contains('.')
            && trimmed
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
        {
            return TargetKind::Domain;
        }
        TargetKind::Other
    }
}

impl std::fmt::Display for TargetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TargetKind::Domain => write!(f, "domain"),
            TargetKind::Ipv4 => write!(f, "ipv4"),
            TargetKind::Ipv6 => write!(f, "ipv6"),
            TargetKind::Cidr => write!(f, "cidr"),
            TargetKind::Url => write!(f, "url"),
            TargetKind::Other => write!(f, "other"),
        }
    }
}

impl std::str::FromStr for TargetKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "domain" => Ok(TargetKind::Domain),
            "ipv4" => Ok(TargetKind::Ipv4),
            "ipv6" => Ok(TargetKind::Ipv6),
            "cidr" => Ok(TargetKind::Cidr),
            "url" => Ok(TargetKind::Url),
            "other" => Ok(TargetKind::Other),
            _ => Err(format!("Unknown target kind: {}", s)),
        }
    }
}

/// A target under test
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    pub id: String,
    pub identifier: String,
    pub kind: TargetKind,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

impl Target {
    /// Create a new target, classifying its kind from the identifier
    pub fn new(identifier: impl Into<String>) -> Self {
        let identifier = identifier.into();
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            kind: TargetKind::classify(&identifier),
            identifier,
            first_seen_at: now,
            last_seen_at: now,
        }
    }

    /// Find target by identifier
    pub fn find_by_identifier(conn: &Connection, identifier: &str) -> Result<Option<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, identifier, kind, first_seen_at, last_seen_at
             FROM targets WHERE identifier = ?1",
        )?;

        let mut rows = stmt.query([identifier])?;
        if let Some(row) = rows.next()? {
            Ok(Some(Self::from_row(row)?))
        } else {
            Ok(None)
        }
    }

    /// Find target by id
    pub fn find_by_id(conn: &Connection, id: &str) -> Result<Option<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, identifier, kind, first_seen_at, last_seen_at
             FROM targets WHERE id = ?1",
        )?;

        let mut rows = stmt.query([id])?;
        if let Some(row) = rows.next()? {
            Ok(Some(Self::from_row(row)?))
        } else {
            Ok(None)
        }
    }

    pub(crate) fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let kind_str: String = row.get(2)?;
        Ok(Self {
            id: row.get(0)?,
            identifier: row.get(1)?,
            kind: kind_str.parse().map_err(invalid_text(2))?,
            first_seen_at: parse_datetime(row.get(3)?, 3)?,
            last_seen_at: parse_datetime(row.get(4)?, 4)?,
        })
    }
}

/// Input for recording a new finding; the store assigns id and Draft status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FindingDraft {
    pub title: String,
    pub detail: Option<String>,
    pub class: FindingClass,
    pub severity: Severity,
    pub created_by: String,
}

impl FindingDraft {
    /// Create a draft with required fields
    pub fn new(
        title: impl Into<String>,
        severity: Severity,
        created_by: impl Into<String>,
    ) -> Self {
        Self {
            title: title.into(),
            detail: None,
            class: FindingClass::Other,
            severity,
            created_by: created_by.into(),
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_class(mut self, class: FindingClass) -> Self {
        self.class = class;
        self
    }
}

/// A recorded security finding
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    pub id: String,
    pub target_id: String,
    pub title: String,
    pub detail: Option<String>,
    pub class: FindingClass,
    pub severity: Severity,
    pub status: FindingStatus,
    pub duplicate_of: Option<String>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Finding {
    pub(crate) fn from_draft(target_id: &str, draft: FindingDraft) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            target_id: target_id.to_string(),
            title: draft.title,
            detail: draft.detail,
            class: draft.class,
            severity: draft.severity,
            status: FindingStatus::Draft,
            duplicate_of: None,
            created_by: draft.created_by,
            created_at: now,
            updated_at: now,
        }
    }

    /// Insert finding into database
    pub fn insert(&self, conn: &Connection) -> Result<()> {
        conn.execute(
            "INSERT INTO findings
             (id, target_id, title, detail, class, severity, status, duplicate_of,
              created_by, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                self.id,
                self.target_id,
                self.title,
                self.detail,
                self.class.to_string(),
                self.severity.to_string(),
                self.status.to_string(),
                self.duplicate_of,
                self.created_by,
                self.created_at.to_rfc3339(),
                self.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Find finding by id
    pub fn find_by_id(conn: &Connection, id: &str) -> Result<Option<Self>> {
        let mut stmt = conn.prepare(&format!("{} WHERE id = ?1", SELECT_FINDING))?;

        let mut rows = stmt.query([id])?;
        if let Some(row) = rows.next()? {
            Ok(Some(Self::from_row(row)?))
        } else {
            Ok(None)
        }
    }

    /// Ordered evidence links for this finding
    pub fn evidence(&self, conn: &Connection) -> Result<Vec<EvidenceRef>> {
        let mut stmt = conn.prepare(
            "SELECT artifact_id, proof, position FROM finding_evidence
             WHERE finding_id = ?1 ORDER BY position",
        )?;

        let refs = stmt
            .query_map([&self.id], |row| {
                let proof_str: String = row.get(1)?;
                Ok(EvidenceRef {
                    artifact_id: row.get(0)?,
                    proof: proof_str.parse().map_err(invalid_text(1))?,
                    position: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(refs)
    }

    pub(crate) fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let class_str: String = row.get(4)?;
        let severity_str: String = row.get(5)?;
        let status_str: String = row.get(6)?;
        Ok(Self {
            id: row.get(0)?,
            target_id: row.get(1)?,
            title: row.get(2)?,
            detail: row.get(3)?,
            class: class_str.parse().map_err(invalid_text(4))?,
            severity: severity_str.parse().map_err(invalid_text(5))?,
            status: status_str.parse().map_err(invalid_text(6))?,
            duplicate_of: row.get(7)?,
            created_by: row.get(8)?,
            created_at: parse_datetime(row.get(9)?, 9)?,
            updated_at: parse_datetime(row.get(10)?, 10)?,
        })
    }
}

pub(crate) const SELECT_FINDING: &str = "SELECT id, target_id, title, detail, class, severity, \
     status, duplicate_of, created_by, created_at, updated_at FROM findings";

/// An ordered evidence link from a finding to an artifact
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceRef {
    pub artifact_id: String,
    pub proof: ProofKind,
    pub position: i64,
}

/// A reusable byproduct stored under a hierarchical category path
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub id: String,
    pub category_path: Vec<String>,
    pub content_hash: String,
    pub payload: Vec<u8>,
    pub linked_target_id: Option<String>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

impl Artifact {
    /// Create a new artifact; the content hash is derived from the payload
    pub fn new(category_path: Vec<String>, payload: Vec<u8>, created_by: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            category_path,
            content_hash: content_hash(&payload),
            payload,
            linked_target_id: None,
            created_by: created_by.into(),
            created_at: Utc::now(),
        }
    }

    pub fn with_target(mut self, target_id: impl Into<String>) -> Self {
        self.linked_target_id = Some(target_id.into());
        self
    }

    /// Find artifact by id
    pub fn find_by_id(conn: &Connection, id: &str) -> Result<Option<Self>> {
        let mut stmt = conn.prepare(&format!("{} WHERE id = ?1", SELECT_ARTIFACT))?;

        let mut rows = stmt.query([id])?;
        if let Some(row) = rows.next()? {
            Ok(Some(Self::from_row(row)?))
        } else {
            Ok(None)
        }
    }

    pub(crate) fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let path_str: String = row.get(1)?;
        Ok(Self {
            id: row.get(0)?,
            category_path: split_category(&path_str),
            content_hash: row.get(2)?,
            payload: row.get(3)?,
            linked_target_id: row.get(4)?,
            created_by: row.get(5)?,
            created_at: parse_datetime(row.get(6)?, 6)?,
        })
    }
}

pub(crate) const SELECT_ARTIFACT: &str = "SELECT id, category_path, content_hash, payload, \
     linked_target_id, created_by, created_at FROM artifacts";

/// Well-known top-level artifact categories
pub mod categories {
    pub const FINDINGS: &str = "findings";
    pub const CREDENTIALS: &str = "credentials";
    pub const ENDPOINTS: &str = "endpoints";
    pub const TECHNIQUES: &str = "techniques";
    pub const BYPASSES: &str = "bypasses";
    pub const SCRIPTS: &str = "scripts";
    pub const TOOLS: &str = "tools";
}

/// SHA-256 hex digest of an artifact payload
pub fn content_hash(payload: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    hex::encode(hasher.finalize())
}

/// Join category segments into the canonical stored form ("a/b/c").
/// Segments must be non-empty and slash-free.
pub fn canonical_category(segments: &[String]) -> Result<String> {
    if segments.is_empty() {
        return Err(crate::Error::Config(
            "category path must have at least one segment".to_string(),
        ));
    }
    for segment in segments {
        if segment.is_empty() || segment.contains('/') {
            return Err(crate::Error::Config(format!(
                "invalid category segment: {:?}",
                segment
            )));
        }
    }
    Ok(segments.join("/"))
}

/// Split a stored canonical path back into segments
pub fn split_category(path: &str) -> Vec<String> {
    path.split('/').map(str::to_string).collect()
}

/// Record of a tool adapter invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub id: String,
    pub agent_id: String,
    pub command: String,
    pub args: Vec<String>,
    pub exit_code: Option<i64>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ToolInvocation {
    /// Create a new invocation record
    pub fn new(agent_id: impl Into<String>, command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            agent_id: agent_id.into(),
            command: command.into(),
            args,
            exit_code: None,
            stdout: None,
            stderr: None,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Record completion
    pub fn complete(&mut self, exit_code: i64, stdout: impl Into<String>, stderr: impl Into<String>) {
        self.exit_code = Some(exit_code);
        self.stdout = Some(stdout.into());
        self.stderr = Some(stderr.into());
        self.completed_at = Some(Utc::now());
    }

    /// Insert into database
    pub fn insert(&self, conn: &Connection) -> Result<()> {
        conn.execute(
            "INSERT INTO tool_invocations
             (id, agent_id, command, args, exit_code, stdout, stderr, started_at, completed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                self.id,
                self.agent_id,
                self.command,
                serde_json::to_string(&self.args)?,
                self.exit_code,
                self.stdout,
                self.stderr,
                self.started_at.to_rfc3339(),
                self.completed_at.map(|dt| dt.to_rfc3339()),
            ],
        )?;
        Ok(())
    }
}

pub(crate) fn parse_datetime(value: String, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

pub(crate) fn invalid_text(idx: usize) -> impl Fn(String) -> rusqlite::Error {
    move |message: String| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            message.into(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::run_migrations;

    fn setup_db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        conn
    }

    #[test]
    fn test_severity_parse_roundtrip() {
        for sev in [
            Severity::Critical,
            Severity::High,
            Severity::Medium,
            Severity::Low,
            Severity::Informational,
        ] {
            let parsed: Severity = sev.to_string().parse().unwrap();
            assert_eq!(parsed, sev);
        }
        assert_eq!("info".parse::<Severity>().unwrap(), Severity::Informational);
        assert!("bogus".parse::<Severity>().is_err());
    }

    #[test]
    fn test_target_kind_classification() {
        assert_eq!(TargetKind::classify("example.com"), TargetKind::Domain);
        assert_eq!(TargetKind::classify("10.0.0.1"), TargetKind::Ipv4);
        assert_eq!(TargetKind::classify("::1"), TargetKind::Ipv6);
        assert_eq!(TargetKind::classify("10.0.0.0/24"), TargetKind::Cidr);
        assert_eq!(
            TargetKind::classify("https://example.com/app"),
            TargetKind::Url
        );
        assert_eq!(TargetKind::classify("internal host"), TargetKind::Other);
    }

    #[test]
    fn test_proof_taxonomy_per_class() {
        assert!(FindingClass::Injection.accepts(ProofKind::BooleanDifferential));
        assert!(FindingClass::Injection.accepts(ProofKind::TimingDifferential));
        assert!(FindingClass::Injection.accepts(ProofKind::ExtractedData));
        assert!(!FindingClass::Injection.accepts(ProofKind::Note));
        assert!(FindingClass::OutOfBand.accepts(ProofKind::OobInteraction));
        assert!(!FindingClass::OutOfBand.accepts(ProofKind::CommandOutput));
        assert!(FindingClass::Execution.accepts(ProofKind::CommandOutput));
        assert!(FindingClass::Recon.accepts(ProofKind::Note));
    }

    #[test]
    fn test_category_path_canonical_form() {
        let path = vec!["exploits".to_string(), "web".to_string(), "sqli".to_string()];
        assert_eq!(canonical_category(&path).unwrap(), "exploits/web/sqli");
        assert_eq!(split_category("exploits/web/sqli"), path);

        assert!(canonical_category(&[]).is_err());
        assert!(canonical_category(&["a/b".to_string()]).is_err());
        assert!(canonical_category(&[String::new()]).is_err());
    }

    #[test]
    fn test_content_hash_stable() {
        let a = content_hash(b"payload");
        let b = content_hash(b"payload");
        let c = content_hash(b"other");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_finding_insert_and_evidence_order() {
        let conn = setup_db();

        let target = Target::new("example.com");
        conn.execute(
            "INSERT INTO targets (id, identifier, kind, first_seen_at, last_seen_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                target.id,
                target.identifier,
                target.kind.to_string(),
                target.first_seen_at.to_rfc3339(),
                target.last_seen_at.to_rfc3339()
            ],
        )
        .unwrap();

        let draft = FindingDraft::new("SQL injection in login", Severity::Critical, "agent-1")
            .with_class(FindingClass::Injection)
            .with_detail("boolean-based blind");
        let finding = Finding::from_draft(&target.id, draft);
        finding.insert(&conn).unwrap();

        let loaded = Finding::find_by_id(&conn, &finding.id).unwrap().unwrap();
        assert_eq!(loaded.status, FindingStatus::Draft);
        assert_eq!(loaded.class, FindingClass::Injection);
        assert_eq!(loaded.severity, Severity::Critical);

        let art_a = Artifact::new(
            vec!["findings".to_string(), "sqli".to_string()],
            b"true/false responses".to_vec(),
            "agent-1",
        );
        let art_b = Artifact::new(
            vec!["findings".to_string(), "sqli".to_string()],
            b"extracted usernames".to_vec(),
            "agent-1",
        );
        for (pos, (art, proof)) in [
            (&art_a, ProofKind::BooleanDifferential),
            (&art_b, ProofKind::ExtractedData),
        ]
        .iter()
        .enumerate()
        {
            conn.execute(
                "INSERT INTO artifacts
                 (id, category_path, content_hash, payload, linked_target_id, created_by, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    art.id,
                    canonical_category(&art.category_path).unwrap(),
                    art.content_hash,
                    art.payload,
                    art.linked_target_id,
                    art.created_by,
                    art.created_at.to_rfc3339()
                ],
            )
            .unwrap();
            conn.execute(
                "INSERT INTO finding_evidence (finding_id, artifact_id, proof, position)
                 VALUES (?1, ?2, ?3, ?4)",
                params![finding.id, art.id, proof.to_string(), pos as i64],
            )
            .unwrap();
        }

        let evidence = loaded.evidence(&conn).unwrap();
        assert_eq!(evidence.len(), 2);
        assert_eq!(evidence[0].artifact_id, art_a.id);
        assert_eq!(evidence[0].proof, ProofKind::BooleanDifferential);
        assert_eq!(evidence[1].artifact_id, art_b.id);
    }

    #[test]
    fn test_artifact_unique_constraint() {
        let conn = setup_db();

        let art = Artifact::new(vec!["scripts".to_string()], b"#!/bin/sh".to_vec(), "agent-1");
        let dup = Artifact::new(vec!["scripts".to_string()], b"#!/bin/sh".to_vec(), "agent-2");
        assert_eq!(art.content_hash, dup.content_hash);

        let insert = |a: &Artifact| {
            conn.execute(
                "INSERT INTO artifacts
                 (id, category_path, content_hash, payload, linked_target_id, created_by, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    a.id,
                    canonical_category(&a.category_path).unwrap(),
                    a.content_hash,
                    a.payload,
                    a.linked_target_id,
                    a.created_by,
                    a.created_at.to_rfc3339()
                ],
            )
        };
        insert(&art).unwrap();
        assert!(insert(&dup).is_err());
    }

    #[test]
    fn test_tool_invocation_save() {
        let conn = setup_db();

        let mut inv = ToolInvocation::new(
            "agent-1",
            "nmap",
            vec!["-sV".to_string(), "localhost".to_string()],
        );
        assert!(inv.completed_at.is_none());

        inv.complete(0, "22/tcp open ssh", "");
        inv.insert(&conn).unwrap();

        let (command, exit_code): (String, i64) = conn
            .query_row(
                "SELECT command, exit_code FROM tool_invocations WHERE id = ?1",
                [&inv.id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(command, "nmap");
        assert_eq!(exit_code, 0);
    }
}
