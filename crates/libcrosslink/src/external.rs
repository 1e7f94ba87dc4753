//! Interfaces to the collaborators the engine consumes. The engine owns no
//! wire format or lifecycle below these seams; tests substitute fakes.

use futures_util::future::BoxFuture;

use crate::config::DEFAULT_MAX_COMMAND_LEN;
use crate::error::CrosslinkError;

/// Outbound half of the peer link. Inbound data and shutdown notifications
/// enter through the service's `notify_transport_*` entry points.
pub trait Transport: Send + Sync {
    fn send(&self, token: &str, payload: &[u8]) -> Result<(), CrosslinkError>;

    /// Largest payload the transport will carry; encoded commands must fit.
    fn max_payload_len(&self) -> usize {
        DEFAULT_MAX_COMMAND_LEN
    }
}

#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub device_id: String,
    pub device_name: String,
}

/// Device discovery, consumed read-only. Online/offline change events are
/// forwarded into the service by the integration layer.
pub trait DeviceDirectory: Send + Sync {
    fn local_device_id(&self) -> String;
    fn lookup(&self, device_id: &str) -> Option<DeviceInfo>;
}

/// How a bundle is referenced in a metadata lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BundleRef {
    ById(u32),
    ByName(String),
}

/// One declared continuation entry, in declaration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContinueTypeEntry {
    pub id: u32,
    pub name: String,
}

/// One exported ability of a bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbilityEntry {
    pub name: String,
    pub module_name: String,
    pub continue_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleMetadata {
    pub bundle_name: String,
    pub bundle_id: u32,
    /// Signing/developer identity used for sink candidate matching.
    pub developer_id: String,
    pub continue_types: Vec<ContinueTypeEntry>,
    /// Sink-side candidate bundle names, in preference order.
    pub continue_bundles: Vec<String>,
    pub abilities: Vec<AbilityEntry>,
}

/// Eventually-consistent package metadata store. Every lookup may be
/// stale; callers retry with a bound rather than trusting one read.
pub trait MetadataCache: Send + Sync {
    fn lookup(&self, device_id: &str, bundle: &BundleRef) -> Option<BundleMetadata>;

    /// Push-then-pull synchronization against the remote peer.
    fn refresh_from_peer(&self, device_id: &str) -> BoxFuture<'static, anyhow::Result<()>>;
}

/// What the component lifecycle manager needs to start the sink ability.
#[derive(Debug, Clone)]
pub struct StartDescriptor {
    pub token: String,
    pub bundle_name: String,
    pub module_name: String,
    pub ability_name: String,
    pub source_device_id: String,
    pub free_install: bool,
    pub params: Option<serde_json::Value>,
}

/// Identity of a started component, recorded on the session for later
/// relation checks.
#[derive(Debug, Clone)]
pub struct ComponentHandle {
    pub pid: i32,
    pub uid: i32,
    pub access_token_id: u64,
}

pub trait ComponentLifecycle: Send + Sync {
    fn start_component(&self, descriptor: &StartDescriptor)
    -> Result<ComponentHandle, CrosslinkError>;

    /// Release a source ability after a clean-mission continuation.
    fn release_component(&self, bundle_name: &str, ability_name: &str)
    -> Result<(), CrosslinkError>;
}
