//! Conflict Resolution for Queued Mutations
//!
//! Decides, from a queued change and the remote record's current state,
//! whether the change may be applied or must be surfaced as a conflict.
//!
//! ## Rules
//!
//! | Remote record      | Operation | Outcome                                |
//! |--------------------|-----------|----------------------------------------|
//! | absent             | create    | apply (first writer wins uncontested)  |
//! | absent             | update    | conflict, `remote_version = 0`         |
//! | absent             | delete    | already applied                        |
//! | present            | create    | conflict (another writer created it)   |
//! | `base == version`  | update/delete | apply                              |
//! | `base < version`   | update/delete | conflict (concurrent write)        |
//! | `base > version`   | update/delete | conflict, logged as corrupt baseline |
//!
//! Fields are never merged: these are household financial records and any
//! mismatch needs a human decision.

use bridge_traits::RemoteRecord;
use tracing::{debug, error};

use crate::change::{ConflictDetails, Operation, PendingChange};

/// Why a change conflicts with the remote record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictKind {
    /// Another device wrote the record after our base version
    ConcurrentWrite,
    /// Our base version is ahead of the server, which a single-authority
    /// store never allows; the local baseline is corrupt or stale
    CorruptBaseline,
    /// Update targets a record that no longer exists remotely
    MissingRemote,
    /// Create targets a record another writer already created
    AlreadyExists,
}

impl ConflictKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictKind::ConcurrentWrite => "concurrent_write",
            ConflictKind::CorruptBaseline => "corrupt_baseline",
            ConflictKind::MissingRemote => "missing_remote",
            ConflictKind::AlreadyExists => "already_exists",
        }
    }
}

/// Resolver decision
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// No conflict; the conditional write may proceed
    Apply,
    /// The remote store already reflects the change (delete of an absent record)
    AlreadyApplied,
    /// Manual resolution required
    Conflict {
        details: ConflictDetails,
        kind: ConflictKind,
    },
}

/// Stateless decision logic comparing base and remote versions.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConflictResolver;

impl ConflictResolver {
    pub fn new() -> Self {
        Self
    }

    /// Evaluate `change` against the remote record's current state.
    pub fn evaluate(&self, change: &PendingChange, remote: Option<&RemoteRecord>) -> Resolution {
        let Some(remote) = remote else {
            return match change.operation {
                Operation::Create => Resolution::Apply,
                Operation::Delete => Resolution::AlreadyApplied,
                Operation::Update => {
                    self.conflict(change, None, ConflictKind::MissingRemote)
                }
            };
        };

        if change.operation == Operation::Create {
            return self.conflict(change, Some(remote), ConflictKind::AlreadyExists);
        }

        // A coalesced create+delete carries no base version.
        let base = change.base_version.unwrap_or(0);

        if base == remote.version {
            Resolution::Apply
        } else if base < remote.version {
            self.conflict(change, Some(remote), ConflictKind::ConcurrentWrite)
        } else {
            error!(
                change_id = %change.id,
                entity_type = %change.entity_type,
                entity_id = %change.entity_id,
                base_version = base,
                remote_version = remote.version,
                "Corrupt local state: base version ahead of remote; routing to conflict"
            );
            self.conflict(change, Some(remote), ConflictKind::CorruptBaseline)
        }
    }

    fn conflict(
        &self,
        change: &PendingChange,
        remote: Option<&RemoteRecord>,
        kind: ConflictKind,
    ) -> Resolution {
        debug!(
            change_id = %change.id,
            kind = kind.as_str(),
            local_version = ?change.base_version,
            remote_version = remote.map(|r| r.version).unwrap_or(0),
            "Conflict detected"
        );

        Resolution::Conflict {
            details: ConflictDetails {
                local_version: change.base_version,
                remote_version: remote.map(|r| r.version).unwrap_or(0),
                local_payload: change.payload.clone(),
                remote_payload: remote.map(|r| r.payload.clone()),
            },
            kind,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::{ChangeId, ChangeStatus};
    use chrono::Utc;
    use serde_json::{json, Value};

    fn change(operation: Operation, base_version: Option<u64>) -> PendingChange {
        PendingChange {
            id: ChangeId::new(7),
            household_id: "hh".to_string(),
            entity_type: "asset".to_string(),
            entity_id: "A1".to_string(),
            operation,
            payload: json!({ "name": "Car" }),
            base_version,
            status: ChangeStatus::Syncing,
            created_at: 0,
            updated_at: 0,
            attempt_count: 0,
            last_error: None,
            revision: 0,
            conflict: None,
        }
    }

    fn remote(version: u64) -> RemoteRecord {
        RemoteRecord {
            version,
            payload: json!({ "name": "Truck" }),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_create_on_absent_applies() {
        let resolver = ConflictResolver::new();
        assert_eq!(
            resolver.evaluate(&change(Operation::Create, None), None),
            Resolution::Apply
        );
    }

    #[test]
    fn test_matching_version_applies() {
        let resolver = ConflictResolver::new();
        assert_eq!(
            resolver.evaluate(&change(Operation::Update, Some(4)), Some(&remote(4))),
            Resolution::Apply
        );
        assert_eq!(
            resolver.evaluate(&change(Operation::Delete, Some(4)), Some(&remote(4))),
            Resolution::Apply
        );
    }

    #[test]
    fn test_stale_base_conflicts_with_details() {
        let resolver = ConflictResolver::new();
        let resolution = resolver.evaluate(&change(Operation::Update, Some(3)), Some(&remote(4)));

        match resolution {
            Resolution::Conflict { details, kind } => {
                assert_eq!(kind, ConflictKind::ConcurrentWrite);
                assert_eq!(details.local_version, Some(3));
                assert_eq!(details.remote_version, 4);
                assert_eq!(details.local_payload, json!({ "name": "Car" }));
                assert_eq!(details.remote_payload, Some(json!({ "name": "Truck" })));
            }
            other => panic!("expected conflict, got {:?}", other),
        }
    }

    #[test]
    fn test_base_ahead_of_remote_routes_to_conflict() {
        let resolver = ConflictResolver::new();
        let resolution = resolver.evaluate(&change(Operation::Update, Some(9)), Some(&remote(4)));

        assert!(matches!(
            resolution,
            Resolution::Conflict {
                kind: ConflictKind::CorruptBaseline,
                ..
            }
        ));
    }

    #[test]
    fn test_absent_remote_cases() {
        let resolver = ConflictResolver::new();

        assert_eq!(
            resolver.evaluate(&change(Operation::Delete, Some(2)), None),
            Resolution::AlreadyApplied
        );

        match resolver.evaluate(&change(Operation::Update, Some(2)), None) {
            Resolution::Conflict { details, kind } => {
                assert_eq!(kind, ConflictKind::MissingRemote);
                assert_eq!(details.remote_version, 0);
                assert_eq!(details.remote_payload, None);
            }
            other => panic!("expected conflict, got {:?}", other),
        }
    }

    #[test]
    fn test_create_on_existing_conflicts() {
        let resolver = ConflictResolver::new();
        let resolution = resolver.evaluate(&change(Operation::Create, None), Some(&remote(1)));

        match resolution {
            Resolution::Conflict { details, kind } => {
                assert_eq!(kind, ConflictKind::AlreadyExists);
                assert_eq!(details.local_version, None);
                assert_eq!(details.remote_version, 1);
            }
            other => panic!("expected conflict, got {:?}", other),
        }
    }

    #[test]
    fn test_coalesced_create_delete_against_existing_conflicts() {
        let resolver = ConflictResolver::new();
        let mut delete = change(Operation::Delete, None);
        delete.payload = Value::Null;

        assert!(matches!(
            resolver.evaluate(&delete, Some(&remote(1))),
            Resolution::Conflict {
                kind: ConflictKind::ConcurrentWrite,
                ..
            }
        ));
    }
}
