//! Correlation tokens and interaction events

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Protocol an out-of-band interaction arrived over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OobProtocol {
    Dns,
    Http,
    Smtp,
}

impl std::fmt::Display for OobProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OobProtocol::Dns => write!(f, "dns"),
            OobProtocol::Http => write!(f, "http"),
            OobProtocol::Smtp => write!(f, "smtp"),
        }
    }
}

/// Characters allowed in a wire token: safe in both DNS labels and URL paths
pub(crate) const TOKEN_CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Wire token length
pub(crate) const TOKEN_LEN: usize = 20;

/// A probe identifier issued to an agent, matched against later callbacks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelationToken {
    pub id: String,
    /// Lowercase alphanumeric identifier embedded in probe payloads
    pub token: String,
    pub issuer_agent_id: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub matched_event_id: Option<String>,
}

impl CorrelationToken {
    pub(crate) fn new(
        token: String,
        issuer_agent_id: impl Into<String>,
        ttl: std::time::Duration,
    ) -> Self {
        let issued_at = Utc::now();
        let expires_at = issued_at
            + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::hours(1));
        Self {
            id: Uuid::new_v4().to_string(),
            token,
            issuer_agent_id: issuer_agent_id.into(),
            issued_at,
            expires_at,
            matched_event_id: None,
        }
    }

    /// Whether the token's TTL has lapsed at `now`
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Observable state of an issued token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenStatus {
    Pending,
    Matched,
}

/// An interaction delivered by the listener boundary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InteractionEvent {
    pub id: String,
    pub source_ip: IpAddr,
    pub protocol: OobProtocol,
    /// Queried name for DNS, request path for HTTP
    pub path: String,
    pub received_at: DateTime<Utc>,
}

impl InteractionEvent {
    /// Create an event stamped now
    pub fn new(source_ip: IpAddr, protocol: OobProtocol, path: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            source_ip,
            protocol,
            path: path.into(),
            received_at: Utc::now(),
        }
    }
}

/// Unresolved token entry carried in a continuation snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenSnapshot {
    pub id: String,
    pub token: String,
    pub issuer_agent_id: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl From<&CorrelationToken> for TokenSnapshot {
    fn from(token: &CorrelationToken) -> Self {
        Self {
            id: token.id.clone(),
            token: token.token.clone(),
            issuer_agent_id: token.issuer_agent_id.clone(),
            issued_at: token.issued_at,
            expires_at: token.expires_at,
        }
    }
}
