//! Caller/session identity matching.
//!
//! The checker reads immutable identity snapshots published by the session
//! registry into a concurrent side map, so callers can verify a claim
//! without going through the dispatcher.

use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;

use crosslink_protocol::PartyIdentity;

use crate::error::CrosslinkError;

/// The fields a caller must match to act on behalf of a session side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartyClaim {
    pub device_id: String,
    pub pid: i32,
    pub uid: i32,
    pub access_token_id: u64,
}

impl PartyClaim {
    pub fn of(identity: &PartyIdentity) -> Self {
        Self {
            device_id: identity.device_id.clone(),
            pid: identity.pid,
            uid: identity.uid,
            access_token_id: identity.access_token_id,
        }
    }
}

/// Identity snapshot for one session, immutable once each side is set.
#[derive(Debug, Clone)]
pub struct SessionIdentity {
    pub source: PartyClaim,
    pub sink: Option<PartyClaim>,
}

pub type IdentityMap = Arc<DashMap<String, SessionIdentity>>;

pub struct RelationChecker {
    identities: IdentityMap,
}

impl RelationChecker {
    pub fn new(identities: IdentityMap) -> Self {
        Self { identities }
    }

    /// Mismatch if any of device id, pid, uid, or access-token id differs
    /// from the session record on a checked side. Pass `None` for the sink
    /// claim to skip the sink side.
    pub fn check(
        &self,
        token: &str,
        claimed_source: &PartyClaim,
        claimed_sink: Option<&PartyClaim>,
    ) -> Result<(), CrosslinkError> {
        let recorded = self
            .identities
            .get(token)
            .ok_or_else(|| CrosslinkError::SessionNotFound(token.to_string()))?;

        if recorded.source != *claimed_source {
            return Err(CrosslinkError::RelationMismatch);
        }
        if let Some(claim) = claimed_sink {
            match &recorded.sink {
                Some(sink) if sink == claim => {}
                _ => return Err(CrosslinkError::RelationMismatch),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dashmap::DashMap;

    fn claim(device: &str, pid: i32) -> PartyClaim {
        PartyClaim {
            device_id: device.to_string(),
            pid,
            uid: 20010,
            access_token_id: 77,
        }
    }

    fn checker_with(token: &str, identity: SessionIdentity) -> RelationChecker {
        let map: IdentityMap = Arc::new(DashMap::new());
        map.insert(token.to_string(), identity);
        RelationChecker::new(map)
    }

    #[test]
    fn matching_source_passes() {
        let checker = checker_with(
            "t1",
            SessionIdentity {
                source: claim("dev-a", 100),
                sink: None,
            },
        );
        assert!(checker.check("t1", &claim("dev-a", 100), None).is_ok());
    }

    #[test]
    fn any_differing_field_is_a_mismatch() {
        let checker = checker_with(
            "t1",
            SessionIdentity {
                source: claim("dev-a", 100),
                sink: None,
            },
        );
        assert!(matches!(
            checker.check("t1", &claim("dev-a", 101), None),
            Err(CrosslinkError::RelationMismatch)
        ));
        let mut wrong_uid = claim("dev-a", 100);
        wrong_uid.uid = 0;
        assert!(matches!(
            checker.check("t1", &wrong_uid, None),
            Err(CrosslinkError::RelationMismatch)
        ));
    }

    #[test]
    fn sink_side_is_skippable() {
        let checker = checker_with(
            "t1",
            SessionIdentity {
                source: claim("dev-a", 100),
                sink: Some(claim("dev-b", 200)),
            },
        );
        assert!(checker.check("t1", &claim("dev-a", 100), None).is_ok());
        assert!(
            checker
                .check("t1", &claim("dev-a", 100), Some(&claim("dev-b", 200)))
                .is_ok()
        );
        assert!(matches!(
            checker.check("t1", &claim("dev-a", 100), Some(&claim("dev-b", 201))),
            Err(CrosslinkError::RelationMismatch)
        ));
    }

    #[test]
    fn sink_claim_against_unresolved_sink_is_a_mismatch() {
        let checker = checker_with(
            "t1",
            SessionIdentity {
                source: claim("dev-a", 100),
                sink: None,
            },
        );
        assert!(matches!(
            checker.check("t1", &claim("dev-a", 100), Some(&claim("dev-b", 200))),
            Err(CrosslinkError::RelationMismatch)
        ));
    }

    #[test]
    fn unknown_token_is_not_found() {
        let checker = checker_with(
            "t1",
            SessionIdentity {
                source: claim("dev-a", 100),
                sink: None,
            },
        );
        assert!(matches!(
            checker.check("nope", &claim("dev-a", 100), None),
            Err(CrosslinkError::SessionNotFound(_))
        ));
    }
}
