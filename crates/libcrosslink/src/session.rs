//! Session records, state machine, and the token-keyed registry.
//!
//! The registry is owned by the dispatcher worker and mutated only from
//! dispatcher tasks. Identity snapshots are mirrored into a concurrent
//! side map for the relation checker.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use rand::{Rng, distributions::Alphanumeric};
use serde::Serialize;
use tracing::{debug, warn};

use crosslink_protocol::{CapabilityDescriptor, PartyIdentity};

use crate::error::CrosslinkError;
use crate::relation::{IdentityMap, PartyClaim, SessionIdentity};

const TOKEN_SUFFIX_LEN: usize = 8;

/// Opaque transport channel identifier, assigned once connected.
pub type ChannelId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Initiated,
    SourceStarting,
    SinkStarting,
    AwaitingConnectDecision,
    Connected,
    Ending,
    Ended,
    ErrorEnded,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Ended | SessionState::ErrorEnded)
    }

    pub fn name(self) -> &'static str {
        match self {
            SessionState::Initiated => "initiated",
            SessionState::SourceStarting => "source_starting",
            SessionState::SinkStarting => "sink_starting",
            SessionState::AwaitingConnectDecision => "awaiting_connect_decision",
            SessionState::Connected => "connected",
            SessionState::Ending => "ending",
            SessionState::Ended => "ended",
            SessionState::ErrorEnded => "error_ended",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionRole {
    Source,
    Sink,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionKind {
    Collaboration,
    Continuation { mission_id: u64 },
}

impl SessionKind {
    pub fn mission_id(&self) -> Option<u64> {
        match self {
            SessionKind::Collaboration => None,
            SessionKind::Continuation { mission_id } => Some(*mission_id),
        }
    }
}

/// One continuation/collaboration attempt.
#[derive(Debug)]
pub struct Session {
    pub token: String,
    pub role: SessionRole,
    pub kind: SessionKind,
    pub state: SessionState,
    pub source: PartyIdentity,
    pub sink: Option<PartyIdentity>,
    /// Device on the other end of this session, for offline matching.
    pub peer_device_id: String,
    pub descriptor: CapabilityDescriptor,
    pub channel: Option<ChannelId>,
    pub created_at: Instant,
}

impl Session {
    /// Move the session to a new state. No transition is permitted out of
    /// a terminal state.
    pub fn advance(&mut self, to: SessionState) -> Result<(), CrosslinkError> {
        if self.state.is_terminal() {
            return Err(CrosslinkError::TerminalState {
                token: self.token.clone(),
                state: self.state.name(),
                requested: to.name(),
            });
        }
        debug!(token = %self.token, from = self.state.name(), to = to.name(), "session state");
        self.state = to;
        Ok(())
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            token: self.token.clone(),
            role: self.role,
            state: self.state,
            mission_id: self.kind.mission_id(),
            source_device_id: self.source.device_id.clone(),
            sink_device_id: self.sink.as_ref().map(|s| s.device_id.clone()),
            source_bundle: self.source.bundle_name.clone(),
            sink_bundle: self.sink.as_ref().map(|s| s.bundle_name.clone()),
            channel: self.channel,
            age_ms: self.created_at.elapsed().as_millis() as u64,
        }
    }
}

/// Read-only view of a session for the administrative dump surface.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub token: String,
    pub role: SessionRole,
    pub state: SessionState,
    pub mission_id: Option<u64>,
    pub source_device_id: String,
    pub sink_device_id: Option<String>,
    pub source_bundle: String,
    pub sink_bundle: Option<String>,
    pub channel: Option<ChannelId>,
    pub age_ms: u64,
}

/// Single owner of all session objects, keyed by token.
pub struct SessionRegistry {
    sessions: HashMap<String, Session>,
    identities: IdentityMap,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::with_identities(Arc::new(DashMap::new()))
    }

    /// Share the identity side map with a [`crate::relation::RelationChecker`].
    pub fn with_identities(identities: IdentityMap) -> Self {
        Self {
            sessions: HashMap::new(),
            identities,
        }
    }

    pub fn identities(&self) -> IdentityMap {
        Arc::clone(&self.identities)
    }

    /// Generate a collision-free token: the initiating device id plus a
    /// random alphanumeric suffix, regenerated while a collision exists.
    pub fn generate_token(&self, device_id: &str) -> String {
        loop {
            let suffix: String = rand::thread_rng()
                .sample_iter(&Alphanumeric)
                .take(TOKEN_SUFFIX_LEN)
                .map(char::from)
                .collect();
            let token = format!("{device_id}-{suffix}");
            if !self.sessions.contains_key(&token) {
                return token;
            }
        }
    }

    /// Register a session. Re-checks token collision before insertion; a
    /// second registration for a live token fails, never overwrites.
    pub fn insert(&mut self, session: Session) -> Result<(), CrosslinkError> {
        if self.sessions.contains_key(&session.token) {
            warn!(token = %session.token, "token already registered");
            return Err(CrosslinkError::TokenCollision(session.token));
        }
        self.identities.insert(
            session.token.clone(),
            SessionIdentity {
                source: PartyClaim::of(&session.source),
                sink: session.sink.as_ref().map(PartyClaim::of),
            },
        );
        self.sessions.insert(session.token.clone(), session);
        Ok(())
    }

    pub fn get(&self, token: &str) -> Option<&Session> {
        self.sessions.get(token)
    }

    pub fn get_mut(&mut self, token: &str) -> Option<&mut Session> {
        self.sessions.get_mut(token)
    }

    pub fn contains(&self, token: &str) -> bool {
        self.sessions.contains_key(token)
    }

    /// Erase a session and its identity snapshot.
    pub fn remove(&mut self, token: &str) -> Option<Session> {
        self.identities.remove(token);
        self.sessions.remove(token)
    }

    /// Record the resolved sink identity and publish it for relation checks.
    pub fn set_sink_identity(&mut self, token: &str, sink: PartyIdentity) {
        if let Some(session) = self.sessions.get_mut(token) {
            if let Some(mut entry) = self.identities.get_mut(token) {
                entry.sink = Some(PartyClaim::of(&sink));
            }
            session.sink = Some(sink);
        }
    }

    pub fn tokens_for_channel(&self, channel: ChannelId) -> Vec<String> {
        self.sessions
            .values()
            .filter(|s| s.channel == Some(channel))
            .map(|s| s.token.clone())
            .collect()
    }

    pub fn tokens_for_peer(&self, device_id: &str) -> Vec<String> {
        self.sessions
            .values()
            .filter(|s| s.peer_device_id == device_id)
            .map(|s| s.token.clone())
            .collect()
    }

    pub fn snapshot(&self) -> Vec<SessionSnapshot> {
        self.sessions.values().map(Session::snapshot).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
