//! Conflict resolution between a remote change and a pending local change
//! for the same record.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SyncError;
use crate::event::{ChangeEvent, ChangeKind};

/// Strategy applied when a remote change collides with a pending local one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictPolicy {
    /// The remote change is applied and local entries are discarded.
    ServerWins,
    /// The remote change is discarded and local entries are resent.
    ClientWins,
    /// Remote fields override same-named local fields.
    #[default]
    Merge,
}

impl ConflictPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictPolicy::ServerWins => "server-wins",
            ConflictPolicy::ClientWins => "client-wins",
            ConflictPolicy::Merge => "merge",
        }
    }
}

impl std::fmt::Display for ConflictPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ConflictPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "server-wins" | "server" => Ok(ConflictPolicy::ServerWins),
            "client-wins" | "client" => Ok(ConflictPolicy::ClientWins),
            "merge" => Ok(ConflictPolicy::Merge),
            other => Err(format!(
                "unknown conflict policy '{}' (expected server-wins, client-wins or merge)",
                other
            )),
        }
    }
}

/// What the caller must do with the outbound queue after a resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Drop every pending entry for the record and apply the remote change.
    ApplyRemote,
    /// Leave the pending entries queued; nothing is applied.
    KeepLocal,
    /// Replace the latest pending entry's payload and apply the merge.
    Merged,
}

/// Outcome of [`ConflictResolver::resolve`].
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedConflict {
    pub resolution: Resolution,
    /// The event that reflects the record's state after resolution.
    pub resolved: ChangeEvent,
}

impl ResolvedConflict {
    /// True if `resolved` must be applied to local state.
    pub fn applies(&self) -> bool {
        self.resolution != Resolution::KeepLocal
    }
}

/// Shallow field merge with remote precedence.
///
/// Both sides must be objects for a field merge; otherwise the remote value
/// replaces the local one.
pub fn merge_payload(local: &Value, remote: &Value) -> Value {
    match (local, remote) {
        (Value::Object(local_fields), Value::Object(remote_fields)) => {
            let mut merged = local_fields.clone();
            for (field, value) in remote_fields {
                merged.insert(field.clone(), value.clone());
            }
            Value::Object(merged)
        }
        _ => remote.clone(),
    }
}

/// Resolves collisions according to the configured policy.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConflictResolver {
    policy: ConflictPolicy,
}

impl ConflictResolver {
    pub fn new(policy: ConflictPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> ConflictPolicy {
        self.policy
    }

    pub fn set_policy(&mut self, policy: ConflictPolicy) {
        self.policy = policy;
    }

    /// Resolves `remote` against the most recent pending `local` entry for
    /// the same record. `now` stamps merged results.
    pub fn resolve(
        &self,
        local: &ChangeEvent,
        remote: &ChangeEvent,
        now: i64,
    ) -> Result<ResolvedConflict, SyncError> {
        if !remote.kind.is_data_change() || !local.kind.is_data_change() {
            return Err(SyncError::MalformedEvent(format!(
                "cannot resolve {} against {}",
                remote.kind, local.kind
            )));
        }

        let outcome = match self.policy {
            ConflictPolicy::ClientWins => self.keep_local(local),
            ConflictPolicy::ServerWins => self.apply_remote(remote),
            ConflictPolicy::Merge => match (local.kind, remote.kind) {
                (_, ChangeKind::Delete) => self.apply_remote(remote),
                (ChangeKind::Delete, _) => self.keep_local(local),
                _ => {
                    let mut resolved = local.clone();
                    resolved.payload = merge_payload(&local.payload, &remote.payload);
                    resolved.merged_at = Some(now);
                    ResolvedConflict {
                        resolution: Resolution::Merged,
                        resolved,
                    }
                }
            },
        };

        tracing::debug!(
            "Resolved conflict on {}/{} with {}: {:?}",
            remote.entity,
            remote.record_id().unwrap_or_default(),
            self.policy,
            outcome.resolution
        );
        Ok(outcome)
    }

    fn keep_local(&self, local: &ChangeEvent) -> ResolvedConflict {
        ResolvedConflict {
            resolution: Resolution::KeepLocal,
            resolved: local.clone(),
        }
    }

    fn apply_remote(&self, remote: &ChangeEvent) -> ResolvedConflict {
        ResolvedConflict {
            resolution: Resolution::ApplyRemote,
            resolved: remote.clone(),
        }
    }
}
