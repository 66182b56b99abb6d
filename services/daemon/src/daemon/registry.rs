//! In-memory instance registry.

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::DaemonError;
use crate::platform::{ResourceSpec, VmDriver};
use crate::state::InstanceRecord;

/// Longest accepted instance name.
const MAX_NAME_LEN: usize = 63;

/// Driver shared between the registry and the task operating on it.
pub type SharedDriver = Arc<Mutex<Box<dyn VmDriver>>>;

/// Lifecycle state of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Off,
    Starting,
    Running,
    Stopping,
    Suspending,
    Suspended,
    Restarting,
    Deleted,
}

impl InstanceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Suspending => "suspending",
            Self::Suspended => "suspended",
            Self::Restarting => "restarting",
            Self::Deleted => "deleted",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "off" => Some(Self::Off),
            "starting" => Some(Self::Starting),
            "running" => Some(Self::Running),
            "stopping" => Some(Self::Stopping),
            "suspending" => Some(Self::Suspending),
            "suspended" => Some(Self::Suspended),
            "restarting" => Some(Self::Restarting),
            "deleted" => Some(Self::Deleted),
            _ => None,
        }
    }

    /// States that exist only while a backend operation is in flight.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Starting | Self::Stopping | Self::Suspending | Self::Restarting
        )
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of an instance returned to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceInfo {
    pub name: String,
    pub state: InstanceState,
    /// In the trash, awaiting recover or purge.
    pub deleted: bool,
    pub image_alias: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_hash: Option<String>,
    pub resources: ResourceSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<IpAddr>,
    pub generation: u64,
    pub created_at: DateTime<Utc>,
}

/// A managed instance.
pub struct Instance {
    pub name: String,
    pub state: InstanceState,
    pub trashed: bool,
    /// Absent until creation has fetched the image.
    pub image_hash: Option<String>,
    pub image_alias: String,
    pub resources: ResourceSpec,
    pub backend_config: serde_json::Value,
    /// Bumped on every committed state transition.
    pub generation: u64,
    pub address: Option<IpAddr>,
    pub created_at: DateTime<Utc>,
    pub(crate) driver: Option<SharedDriver>,
    /// Set while a resize runs outside the registry lock. Never persisted.
    pub(crate) resizing: bool,
}

impl Instance {
    /// A freshly reserved instance, committed straight into `starting`.
    pub fn reserve(name: String, image_alias: String, resources: ResourceSpec) -> Self {
        Self {
            name,
            state: InstanceState::Starting,
            trashed: false,
            image_hash: None,
            image_alias,
            resources,
            backend_config: serde_json::Value::Null,
            generation: 1,
            address: None,
            created_at: Utc::now(),
            driver: None,
            resizing: false,
        }
    }

    pub fn from_record(record: InstanceRecord) -> Self {
        Self {
            address: record.address.as_deref().and_then(|a| a.parse().ok()),
            created_at: Utc
                .timestamp_opt(record.created_at, 0)
                .single()
                .unwrap_or_else(Utc::now),
            name: record.name,
            state: record.state,
            trashed: record.trashed,
            image_hash: record.image_hash,
            image_alias: record.image_alias,
            resources: record.resources,
            backend_config: record.backend_config,
            generation: record.generation,
            driver: None,
            resizing: false,
        }
    }

    /// Commit a state transition, returning the new generation.
    pub fn commit(&mut self, state: InstanceState) -> u64 {
        self.state = state;
        self.generation += 1;
        if state != InstanceState::Running {
            self.address = None;
        }
        self.generation
    }

    pub fn to_record(&self) -> InstanceRecord {
        InstanceRecord {
            name: self.name.clone(),
            state: self.state,
            trashed: self.trashed,
            image_hash: self.image_hash.clone(),
            image_alias: self.image_alias.clone(),
            resources: self.resources,
            backend_config: self.backend_config.clone(),
            address: self.address.map(|a| a.to_string()),
            generation: self.generation,
            created_at: self.created_at.timestamp(),
            updated_at: Utc::now().timestamp(),
        }
    }

    pub fn to_info(&self) -> InstanceInfo {
        InstanceInfo {
            name: self.name.clone(),
            state: self.state,
            deleted: self.trashed,
            image_alias: self.image_alias.clone(),
            image_hash: self.image_hash.clone(),
            resources: self.resources,
            address: self.address,
            generation: self.generation,
            created_at: self.created_at,
        }
    }

    /// A backend operation is in flight.
    pub fn is_busy(&self) -> bool {
        self.state.is_transient() || self.resizing
    }

    /// Reject commands while a backend operation is in flight.
    pub fn ensure_idle(&self) -> Result<(), DaemonError> {
        if self.is_busy() {
            return Err(DaemonError::OperationInProgress {
                name: self.name.clone(),
                state: self.state,
            });
        }
        Ok(())
    }
}

/// Instances by name.
#[derive(Default)]
pub struct Registry {
    instances: BTreeMap<String, Instance>,
}

impl Registry {
    pub fn contains(&self, name: &str) -> bool {
        self.instances.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Result<&Instance, DaemonError> {
        self.instances
            .get(name)
            .ok_or_else(|| DaemonError::NameUnknown(name.to_string()))
    }

    pub fn get_mut(&mut self, name: &str) -> Result<&mut Instance, DaemonError> {
        self.instances
            .get_mut(name)
            .ok_or_else(|| DaemonError::NameUnknown(name.to_string()))
    }

    pub fn insert(&mut self, instance: Instance) {
        self.instances.insert(instance.name.clone(), instance);
    }

    pub fn remove(&mut self, name: &str) -> Option<Instance> {
        self.instances.remove(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Instance> {
        self.instances.values()
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}

/// Check an instance name: a letter first, then letters, digits or
/// hyphens, not ending in a hyphen.
pub fn validate_name(name: &str) -> Result<(), DaemonError> {
    let invalid = |reason: &str| DaemonError::InvalidName {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    let Some(first) = name.chars().next() else {
        return Err(invalid("name is empty"));
    };
    if name.len() > MAX_NAME_LEN {
        return Err(invalid("name is longer than 63 characters"));
    }
    if !first.is_ascii_alphabetic() {
        return Err(invalid("name must start with a letter"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-')
    {
        return Err(invalid("only letters, digits and hyphens are allowed"));
    }
    if name.ends_with('-') {
        return Err(invalid("name must not end with a hyphen"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn test_state_roundtrip() {
        for state in [
            InstanceState::Off,
            InstanceState::Starting,
            InstanceState::Running,
            InstanceState::Stopping,
            InstanceState::Suspending,
            InstanceState::Suspended,
            InstanceState::Restarting,
            InstanceState::Deleted,
        ] {
            assert_eq!(InstanceState::from_str(state.as_str()), Some(state));
            assert_eq!(
                serde_json::to_value(state).unwrap(),
                serde_json::Value::String(state.as_str().to_string())
            );
        }
        assert_eq!(InstanceState::from_str("exploded"), None);
    }

    #[test]
    fn test_transient_states() {
        assert!(InstanceState::Starting.is_transient());
        assert!(InstanceState::Restarting.is_transient());
        assert!(!InstanceState::Running.is_transient());
        assert!(!InstanceState::Suspended.is_transient());
        assert!(!InstanceState::Deleted.is_transient());
    }

    #[test]
    fn test_commit_bumps_generation_and_clears_address() {
        let mut instance = Instance::reserve(
            "foo".to_string(),
            "noble".to_string(),
            ResourceSpec::default(),
        );
        assert_eq!(instance.generation, 1);

        assert_eq!(instance.commit(InstanceState::Running), 2);
        instance.address = Some("10.0.0.2".parse().unwrap());
        assert_eq!(instance.commit(InstanceState::Stopping), 3);
        assert!(instance.address.is_none());
    }

    #[test]
    fn test_resizing_instance_is_busy() {
        let mut instance = Instance::reserve(
            "foo".to_string(),
            "noble".to_string(),
            ResourceSpec::default(),
        );
        instance.commit(InstanceState::Off);
        assert!(instance.ensure_idle().is_ok());

        instance.resizing = true;
        assert!(instance.is_busy());
        assert!(matches!(
            instance.ensure_idle(),
            Err(DaemonError::OperationInProgress {
                state: InstanceState::Off,
                ..
            })
        ));
    }

    #[test]
    fn test_record_roundtrip() {
        let mut instance = Instance::reserve(
            "foo".to_string(),
            "noble".to_string(),
            ResourceSpec::default(),
        );
        instance.commit(InstanceState::Running);
        instance.address = Some("10.0.0.2".parse().unwrap());
        instance.image_hash = Some("aa".to_string());

        let restored = Instance::from_record(instance.to_record());
        assert_eq!(restored.to_info(), instance.to_info_at_second());
    }

    impl Instance {
        fn to_info_at_second(&self) -> InstanceInfo {
            let mut info = self.to_info();
            info.created_at = Utc
                .timestamp_opt(self.created_at.timestamp(), 0)
                .single()
                .unwrap();
            info
        }
    }

    #[rstest]
    #[case("foo")]
    #[case("pied-piper-valley")]
    #[case("a1")]
    fn test_valid_names(#[case] name: &str) {
        assert!(validate_name(name).is_ok());
    }

    #[rstest]
    #[case("")]
    #[case("1foo")]
    #[case("foo-")]
    #[case("foo_bar")]
    #[case("foo.bar")]
    fn test_invalid_names(#[case] name: &str) {
        assert!(matches!(
            validate_name(name),
            Err(DaemonError::InvalidName { .. })
        ));
    }

    #[test]
    fn test_overlong_name() {
        assert!(validate_name(&"a".repeat(64)).is_err());
        assert!(validate_name(&"a".repeat(63)).is_ok());
    }
}
