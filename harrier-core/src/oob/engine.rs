//! Out-of-band correlation engine
//!
//! Issues wire tokens for agents to embed in probes, and matches listener
//! events back to the issuing agent. A successful match writes a draft
//! finding (with the event payload as evidence) through the knowledge
//! store, never directly into storage.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use rand::Rng;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::store::{categories, FindingDraft, KnowledgeStore, ProofKind, Severity};
use crate::store::FindingClass;
use crate::{Error, Result};

use super::token::{
    CorrelationToken, InteractionEvent, TokenSnapshot, TokenStatus, TOKEN_CHARS, TOKEN_LEN,
};

/// Minimum gap between opportunistic expiry sweeps
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Matches asynchronous callbacks to issued probes for one scan session
pub struct CorrelationEngine {
    store: Arc<KnowledgeStore>,
    target_id: String,
    listener_domain: String,
    /// Wire token -> live token record
    tokens: DashMap<String, CorrelationToken>,
    /// Token id -> wire token
    by_id: DashMap<String, String>,
    /// Issuer agent -> matches not yet polled
    pending: DashMap<String, Vec<CorrelationToken>>,
    events: Mutex<Vec<InteractionEvent>>,
    last_sweep: std::sync::Mutex<Instant>,
}

enum MatchOutcome {
    Fresh(CorrelationToken),
    AlreadyMatched(String),
    Expired(String),
}

impl CorrelationEngine {
    /// Create an engine writing findings for `target_id` through `store`
    pub fn new(
        store: Arc<KnowledgeStore>,
        target_id: impl Into<String>,
        listener_domain: impl Into<String>,
    ) -> Self {
        Self {
            store,
            target_id: target_id.into(),
            listener_domain: listener_domain.into(),
            tokens: DashMap::new(),
            by_id: DashMap::new(),
            pending: DashMap::new(),
            events: Mutex::new(Vec::new()),
            last_sweep: std::sync::Mutex::new(Instant::now()),
        }
    }

    /// Issue a fresh token for an agent. Uniqueness holds across concurrent
    /// issuers; the wire token re-rolls on the (negligible) chance of a
    /// collision with a live token.
    pub fn issue_token(&self, agent_id: &str, ttl: Duration) -> CorrelationToken {
        self.maybe_sweep();
        loop {
            let wire = wire_token();
            match self.tokens.entry(wire.clone()) {
                dashmap::mapref::entry::Entry::Occupied(_) => continue,
                dashmap::mapref::entry::Entry::Vacant(slot) => {
                    let token = CorrelationToken::new(wire.clone(), agent_id, ttl);
                    self.by_id.insert(token.id.clone(), wire);
                    debug!(agent = agent_id, token = %token.token, "issued correlation token");
                    slot.insert(token.clone());
                    return token;
                }
            }
        }
    }

    /// Hostname an agent embeds in a probe payload
    pub fn callback_host(&self, token: &CorrelationToken) -> String {
        format!("{}.{}", token.token, self.listener_domain)
    }

    /// HTTP form of the callback
    pub fn callback_url(&self, token: &CorrelationToken) -> String {
        format!("http://{}/{}", self.callback_host(token), token.token)
    }

    /// Consume a listener event. Returns the token it matched, if any.
    ///
    /// A token matches at most once; later events referencing it (or an
    /// expired one) are recorded without producing a new match. A fresh
    /// match writes a draft out-of-band finding with the event payload
    /// attached as proof.
    pub async fn ingest_event(&self, event: InteractionEvent) -> Result<Option<CorrelationToken>> {
        self.events.lock().await.push(event.clone());

        let outcome = self.try_match(&event);
        let Some(outcome) = outcome else {
            debug!(path = %event.path, "interaction did not reference a known token");
            return Ok(None);
        };

        let token = match outcome {
            MatchOutcome::AlreadyMatched(wire) => {
                debug!(token = %wire, "additional interaction for matched token");
                return Ok(None);
            }
            MatchOutcome::Expired(wire) => {
                warn!(token = %wire, "interaction referenced an expired token");
                return Ok(None);
            }
            MatchOutcome::Fresh(token) => token,
        };

        info!(
            token = %token.token,
            agent = %token.issuer_agent_id,
            source = %event.source_ip,
            protocol = %event.protocol,
            "out-of-band interaction matched"
        );

        let artifact = self
            .store
            .save_artifact(
                vec![
                    categories::FINDINGS.to_string(),
                    "oob".to_string(),
                    token.token.clone(),
                ],
                serde_json::to_vec(&event)?,
                Some(self.target_id.clone()),
                &token.issuer_agent_id,
            )
            .await?;

        let draft = FindingDraft::new(
            format!("Out-of-band {} interaction for probe {}", event.protocol, token.token),
            Severity::High,
            &token.issuer_agent_id,
        )
        .with_class(FindingClass::OutOfBand)
        .with_detail(format!(
            "Callback from {} over {} referencing {}",
            event.source_ip, event.protocol, event.path
        ));
        let finding = self.store.record_finding(&self.target_id, draft).await?;
        self.store
            .link_evidence(&finding.id, &artifact.id, ProofKind::OobInteraction)
            .await?;

        self.pending
            .entry(token.issuer_agent_id.clone())
            .or_default()
            .push(token.clone());

        Ok(Some(token))
    }

    /// Matches queued for this agent since its last poll; each match is
    /// delivered at most once.
    pub fn poll(&self, agent_id: &str) -> Vec<CorrelationToken> {
        self.maybe_sweep();
        self.pending
            .remove(agent_id)
            .map(|(_, matches)| matches)
            .unwrap_or_default()
    }

    /// State of an issued token. Expired unmatched tokens surface as
    /// `TokenExpired` so the agent knows to re-issue.
    pub fn token_status(&self, token_id: &str) -> Result<TokenStatus> {
        let wire = self
            .by_id
            .get(token_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::NotFound(format!("token {}", token_id)))?;
        let token = self
            .tokens
            .get(&wire)
            .ok_or_else(|| Error::NotFound(format!("token {}", token_id)))?;

        if token.matched_event_id.is_some() {
            Ok(TokenStatus::Matched)
        } else if token.is_expired(Utc::now()) {
            Err(Error::TokenExpired(token_id.to_string()))
        } else {
            Ok(TokenStatus::Pending)
        }
    }

    /// Drop unmatched tokens past their TTL. Returns how many were removed.
    pub fn sweep_expired(&self, now: chrono::DateTime<Utc>) -> usize {
        let before = self.tokens.len();
        self.tokens
            .retain(|_, token| token.matched_event_id.is_some() || !token.is_expired(now));
        let removed = before - self.tokens.len();
        if removed > 0 {
            self.by_id
                .retain(|_, wire| self.tokens.contains_key(wire));
            debug!(removed, "swept expired correlation tokens");
        }
        removed
    }

    /// Unmatched, unexpired tokens for a continuation snapshot
    pub fn unresolved_snapshot(&self) -> Vec<TokenSnapshot> {
        let now = Utc::now();
        let mut snapshots: Vec<TokenSnapshot> = self
            .tokens
            .iter()
            .filter(|entry| entry.matched_event_id.is_none() && !entry.is_expired(now))
            .map(|entry| TokenSnapshot::from(entry.value()))
            .collect();
        snapshots.sort_by(|a, b| a.issued_at.cmp(&b.issued_at).then(a.id.cmp(&b.id)));
        snapshots
    }

    /// Number of events ingested so far, matched or not
    pub async fn recorded_events(&self) -> usize {
        self.events.lock().await.len()
    }

    /// Re-register tokens from a continuation snapshot so callbacks from
    /// probes sent before a suspension still match after resume. Tokens
    /// whose wire value is already live are skipped.
    pub fn restore_tokens(&self, snapshots: &[TokenSnapshot]) -> usize {
        let mut restored = 0;
        for snapshot in snapshots {
            match self.tokens.entry(snapshot.token.clone()) {
                dashmap::mapref::entry::Entry::Occupied(_) => {}
                dashmap::mapref::entry::Entry::Vacant(slot) => {
                    let token = CorrelationToken {
                        id: snapshot.id.clone(),
                        token: snapshot.token.clone(),
                        issuer_agent_id: snapshot.issuer_agent_id.clone(),
                        issued_at: snapshot.issued_at,
                        expires_at: snapshot.expires_at,
                        matched_event_id: None,
                    };
                    self.by_id.insert(token.id.clone(), token.token.clone());
                    slot.insert(token);
                    restored += 1;
                }
            }
        }
        if restored > 0 {
            debug!(restored, "restored correlation tokens from continuation");
        }
        restored
    }

    fn try_match(&self, event: &InteractionEvent) -> Option<MatchOutcome> {
        let now = Utc::now();
        for candidate in event.path.split(['/', '.']) {
            if candidate.len() != TOKEN_LEN {
                continue;
            }
            let Some(mut entry) = self.tokens.get_mut(candidate) else {
                continue;
            };
            if entry.matched_event_id.is_some() {
                return Some(MatchOutcome::AlreadyMatched(entry.token.clone()));
            }
            if entry.is_expired(now) {
                return Some(MatchOutcome::Expired(entry.token.clone()));
            }
            entry.matched_event_id = Some(event.id.clone());
            return Some(MatchOutcome::Fresh(entry.clone()));
        }
        None
    }

    fn maybe_sweep(&self) {
        let mut last = match self.last_sweep.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if last.elapsed() >= SWEEP_INTERVAL {
            *last = Instant::now();
            drop(last);
            self.sweep_expired(Utc::now());
        }
    }
}

fn wire_token() -> String {
    let mut rng = rand::thread_rng();
    (0..TOKEN_LEN)
        .map(|_| TOKEN_CHARS[rng.gen_range(0..TOKEN_CHARS.len())] as char)
        .collect()
}
