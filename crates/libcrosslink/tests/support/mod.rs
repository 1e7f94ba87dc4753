//! In-process fakes for driving the service in integration tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;

use crosslink_protocol::{
    CapabilityDescriptor, Command, PartyIdentity, ResultCode, SourceAppRef, codec,
};
use libcrosslink::{
    AbilityEntry, BundleMetadata, BundleRef, CollaborationRequest, ComponentHandle,
    ComponentLifecycle, ContinuationCallback, ContinuationRequest, ContinueTypeEntry,
    CrosslinkConfig, CrosslinkError, Crosslink, DeviceDirectory, DeviceInfo, MetadataCache,
    StartDescriptor, Transport,
};

pub const LOCAL_DEVICE: &str = "dev-a";
pub const PEER_DEVICE: &str = "dev-b";

/// Initialize tracing for tests (only once per process).
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("libcrosslink=debug")
            .with_test_writer()
            .try_init()
            .ok();
    });
}

// ---- transport -----------------------------------------------------------

#[derive(Default)]
pub struct FakeTransport {
    sent: Mutex<Vec<(String, Vec<u8>)>>,
    pub fail_sends: AtomicBool,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn sent_commands(&self) -> Vec<Command> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|(_, bytes)| codec::decode(bytes).expect("sent frame decodes"))
            .collect()
    }

    /// Poll until at least `count` commands were sent, or timeout.
    pub async fn wait_for_commands(&self, count: usize, timeout: Duration) -> Vec<Command> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let commands = self.sent_commands();
            if commands.len() >= count {
                return commands;
            }
            if tokio::time::Instant::now() >= deadline {
                return commands;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Transport for FakeTransport {
    fn send(&self, token: &str, payload: &[u8]) -> Result<(), CrosslinkError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(CrosslinkError::Transport("send refused".to_string()));
        }
        self.sent
            .lock()
            .unwrap()
            .push((token.to_string(), payload.to_vec()));
        Ok(())
    }
}

// ---- device directory ----------------------------------------------------

pub struct FakeDirectory {
    local: String,
    known: Mutex<Vec<String>>,
}

impl FakeDirectory {
    pub fn new(local: &str, known: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            local: local.to_string(),
            known: Mutex::new(known.iter().map(|d| d.to_string()).collect()),
        })
    }
}

impl DeviceDirectory for FakeDirectory {
    fn local_device_id(&self) -> String {
        self.local.clone()
    }

    fn lookup(&self, device_id: &str) -> Option<DeviceInfo> {
        let known = self.known.lock().unwrap();
        known.iter().any(|d| d == device_id).then(|| DeviceInfo {
            device_id: device_id.to_string(),
            device_name: format!("device {device_id}"),
        })
    }
}

// ---- metadata cache ------------------------------------------------------

#[derive(Default)]
pub struct FakeCache {
    bundles: Mutex<HashMap<(String, String), BundleMetadata>>,
    pub lookups: AtomicUsize,
    pub refreshes: AtomicUsize,
    pub always_miss: AtomicBool,
}

impl FakeCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert(&self, device_id: &str, meta: BundleMetadata) {
        self.bundles
            .lock()
            .unwrap()
            .insert((device_id.to_string(), meta.bundle_name.clone()), meta);
    }
}

impl MetadataCache for FakeCache {
    fn lookup(&self, device_id: &str, bundle: &BundleRef) -> Option<BundleMetadata> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        if self.always_miss.load(Ordering::SeqCst) {
            return None;
        }
        let bundles = self.bundles.lock().unwrap();
        match bundle {
            BundleRef::ByName(name) => bundles
                .get(&(device_id.to_string(), name.clone()))
                .cloned(),
            BundleRef::ById(id) => bundles
                .iter()
                .find(|((device, _), meta)| device == device_id && meta.bundle_id == *id)
                .map(|(_, meta)| meta.clone()),
        }
    }

    fn refresh_from_peer(&self, _device_id: &str) -> BoxFuture<'static, anyhow::Result<()>> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        Box::pin(async { Ok(()) })
    }
}

// ---- component lifecycle -------------------------------------------------

#[derive(Default)]
pub struct FakeLifecycle {
    pub starts: Mutex<Vec<StartDescriptor>>,
    pub releases: Mutex<Vec<(String, String)>>,
    pub fail_start: AtomicBool,
}

impl FakeLifecycle {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn started(&self) -> usize {
        self.starts.lock().unwrap().len()
    }

    pub fn released(&self) -> Vec<(String, String)> {
        self.releases.lock().unwrap().clone()
    }
}

impl ComponentLifecycle for FakeLifecycle {
    fn start_component(
        &self,
        descriptor: &StartDescriptor,
    ) -> Result<ComponentHandle, CrosslinkError> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(CrosslinkError::StartFailed("component refused".to_string()));
        }
        self.starts.lock().unwrap().push(descriptor.clone());
        Ok(ComponentHandle {
            pid: 7_700,
            uid: 20_010,
            access_token_id: 42,
        })
    }

    fn release_component(
        &self,
        bundle_name: &str,
        ability_name: &str,
    ) -> Result<(), CrosslinkError> {
        self.releases
            .lock()
            .unwrap()
            .push((bundle_name.to_string(), ability_name.to_string()));
        Ok(())
    }
}

// ---- continuation callback -----------------------------------------------

#[derive(Default)]
pub struct RecordingCallback {
    calls: Mutex<Vec<(u64, ResultCode)>>,
}

impl RecordingCallback {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<(u64, ResultCode)> {
        self.calls.lock().unwrap().clone()
    }

    pub async fn wait_for_calls(&self, count: usize, timeout: Duration) -> Vec<(u64, ResultCode)> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let calls = self.calls();
            if calls.len() >= count {
                return calls;
            }
            if tokio::time::Instant::now() >= deadline {
                return calls;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl ContinuationCallback for RecordingCallback {
    fn on_result(&self, mission_id: u64, code: ResultCode) {
        self.calls.lock().unwrap().push((mission_id, code));
    }
}

// ---- harness -------------------------------------------------------------

pub struct Harness {
    pub transport: Arc<FakeTransport>,
    pub directory: Arc<FakeDirectory>,
    pub cache: Arc<FakeCache>,
    pub lifecycle: Arc<FakeLifecycle>,
    pub service: Crosslink,
}

impl Harness {
    /// Service on `LOCAL_DEVICE` knowing itself and `PEER_DEVICE`.
    pub async fn start(cfg: CrosslinkConfig) -> Self {
        init_tracing();
        let transport = FakeTransport::new();
        let directory = FakeDirectory::new(LOCAL_DEVICE, &[LOCAL_DEVICE, PEER_DEVICE]);
        let cache = FakeCache::new();
        let lifecycle = FakeLifecycle::new();
        let service = Crosslink::start(
            cfg,
            transport.clone(),
            directory.clone(),
            cache.clone(),
            lifecycle.clone(),
        )
        .await;
        Self {
            transport,
            directory,
            cache,
            lifecycle,
            service,
        }
    }

    /// Poll the dump until the session reaches the given state, or timeout.
    pub async fn wait_for_state(
        &self,
        token: &str,
        state: libcrosslink::SessionState,
        timeout: Duration,
    ) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let sessions = self.service.dump_sessions().await.unwrap_or_default();
            if sessions
                .iter()
                .any(|s| s.token == token && s.state == state)
            {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Poll the dump until the session count matches, or timeout.
    pub async fn wait_for_sessions(
        &self,
        count: usize,
        timeout: Duration,
    ) -> Vec<libcrosslink::SessionSnapshot> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let sessions = self.service.dump_sessions().await.unwrap_or_default();
            if sessions.len() == count {
                return sessions;
            }
            if tokio::time::Instant::now() >= deadline {
                return sessions;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

// ---- fixtures ------------------------------------------------------------

pub fn identity(device_id: &str) -> PartyIdentity {
    PartyIdentity {
        device_id: device_id.to_string(),
        pid: 4_321,
        uid: 20_010,
        access_token_id: 99,
        bundle_name: "com.sample.notes".to_string(),
        ability_name: "EditAbility".to_string(),
        module_name: "editor".to_string(),
    }
}

pub fn continuation_request(clean_mission: bool) -> ContinuationRequest {
    ContinuationRequest {
        sink_device_id: PEER_DEVICE.to_string(),
        source: identity(LOCAL_DEVICE),
        app_ref: SourceAppRef::ByName {
            bundle_name: "com.sample.notes".to_string(),
            continue_type: "notes.edit".to_string(),
        },
        descriptor: CapabilityDescriptor::default(),
        clean_mission,
    }
}

pub fn collaboration_request() -> CollaborationRequest {
    CollaborationRequest {
        sink_device_id: PEER_DEVICE.to_string(),
        source: identity(LOCAL_DEVICE),
        app_ref: SourceAppRef::ByName {
            bundle_name: "com.sample.notes".to_string(),
            continue_type: "notes.edit".to_string(),
        },
        descriptor: CapabilityDescriptor::default(),
    }
}

/// Metadata for the source-side bundle as the peer publishes it.
pub fn notes_bundle() -> BundleMetadata {
    BundleMetadata {
        bundle_name: "com.sample.notes".to_string(),
        bundle_id: 1,
        developer_id: "dev-id-1".to_string(),
        continue_types: vec![ContinueTypeEntry {
            id: 0,
            name: "notes.edit".to_string(),
        }],
        continue_bundles: vec![],
        abilities: vec![AbilityEntry {
            name: "EditAbility".to_string(),
            module_name: "editor".to_string(),
            continue_type: "notes.edit".to_string(),
        }],
    }
}

/// An inbound start command addressed to the local device, as a source
/// peer would send it.
pub fn inbound_sink_start(
    token: &str,
    need_confirm: bool,
    mission_id: Option<u64>,
) -> Vec<u8> {
    let command = Command::SinkStart {
        token: token.to_string(),
        source_device_id: PEER_DEVICE.to_string(),
        sink_device_id: LOCAL_DEVICE.to_string(),
        source: identity(PEER_DEVICE),
        app_ref: SourceAppRef::ByName {
            bundle_name: "com.sample.notes".to_string(),
            continue_type: "notes.edit".to_string(),
        },
        descriptor: CapabilityDescriptor {
            need_confirm,
            free_install: false,
            params: None,
        },
        mission_id,
    };
    codec::encode(&command, 64 * 1024).expect("encode")
}

pub fn notify_result_frame(token: &str, code: ResultCode) -> Vec<u8> {
    codec::encode(
        &Command::NotifyResult {
            token: token.to_string(),
            code: code.as_i32(),
        },
        64 * 1024,
    )
    .expect("encode")
}

pub fn disconnect_frame(token: &str) -> Vec<u8> {
    codec::encode(
        &Command::Disconnect {
            token: token.to_string(),
        },
        64 * 1024,
    )
    .expect("encode")
}
