//! Instance kinds.
//!
//! One deployment serves either the abac or the rbac policy population of
//! the authority. The kind decides the `type` parameter of authority calls,
//! where the policy id space begins, and which filenames the sync state is
//! persisted under, so both kinds can share a host and a config file.
use serde::{Deserialize, Serialize};

const RBAC_POLICY_BEGIN_ID: i64 = 500_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceKind {
    #[default]
    Abac,
    Rbac,
}

impl InstanceKind {
    pub fn from_env_value(value: &str) -> Self {
        if value.eq_ignore_ascii_case("rbac") {
            InstanceKind::Rbac
        } else {
            InstanceKind::Abac
        }
    }

    /// The `type` query parameter of authority policy APIs.
    pub fn api_type(&self) -> &'static str {
        match self {
            InstanceKind::Abac => "abac",
            InstanceKind::Rbac => "rbac",
        }
    }

    /// First id of this kind's policy id space; full sync scans from here.
    pub fn policy_begin_id(&self) -> i64 {
        match self {
            InstanceKind::Abac => 1,
            InstanceKind::Rbac => RBAC_POLICY_BEGIN_ID,
        }
    }

    pub fn full_sync_file_name(&self) -> &'static str {
        match self {
            InstanceKind::Abac => "last_sync_time.full",
            InstanceKind::Rbac => "last_sync_time.rbac.full",
        }
    }

    pub fn incr_sync_file_name(&self) -> &'static str {
        match self {
            InstanceKind::Abac => "last_sync_time.incr",
            InstanceKind::Rbac => "last_sync_time.rbac.incr",
        }
    }

    pub fn snapshot_file_name(&self) -> &'static str {
        match self {
            InstanceKind::Abac => "snapshot.json",
            InstanceKind::Rbac => "snapshot.rbac.json",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rbac_shifts_id_space_and_filenames() {
        let kind = InstanceKind::from_env_value("rbac");
        assert_eq!(kind, InstanceKind::Rbac);
        assert_eq!(kind.policy_begin_id(), 500_000_000);
        assert_eq!(kind.snapshot_file_name(), "snapshot.rbac.json");
        assert_eq!(kind.api_type(), "rbac");
    }

    #[test]
    fn anything_else_is_abac() {
        assert_eq!(InstanceKind::from_env_value(""), InstanceKind::Abac);
        assert_eq!(InstanceKind::from_env_value("ABAC"), InstanceKind::Abac);
        assert_eq!(InstanceKind::Abac.policy_begin_id(), 1);
    }
}
