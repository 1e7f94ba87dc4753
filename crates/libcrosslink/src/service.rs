//! The `Crosslink` service object: the one-per-process deployment unit,
//! explicitly constructed with injected collaborators so tests substitute
//! fakes.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, warn};

use crosslink_protocol::{CapabilityDescriptor, PartyIdentity, SourceAppRef, codec};

use crate::callbacks::ContinuationCallback;
use crate::config::CrosslinkConfig;
use crate::dispatcher::Dispatcher;
use crate::engine::Engine;
use crate::error::CrosslinkError;
use crate::external::{ComponentLifecycle, DeviceDirectory, MetadataCache, Transport};
use crate::relation::{IdentityMap, PartyClaim, RelationChecker};
use crate::resolve::PeerResolver;
use crate::session::{ChannelId, SessionSnapshot};

/// Begin a collaboration: two linked abilities running on source and sink.
#[derive(Debug, Clone)]
pub struct CollaborationRequest {
    pub sink_device_id: String,
    pub source: PartyIdentity,
    pub app_ref: SourceAppRef,
    pub descriptor: CapabilityDescriptor,
}

/// Begin a continuation: move the running ability to the sink device.
#[derive(Debug, Clone)]
pub struct ContinuationRequest {
    pub sink_device_id: String,
    pub source: PartyIdentity,
    pub app_ref: SourceAppRef,
    pub descriptor: CapabilityDescriptor,
    /// Release the source ability after the continuation succeeds, once
    /// the background-release grace period elapses.
    pub clean_mission: bool,
}

pub struct Crosslink {
    dispatcher: Dispatcher<Engine>,
    relation: RelationChecker,
}

impl Crosslink {
    /// Construct the service and start its dispatcher. Returns only after
    /// the worker is live, so requests can be posted immediately.
    pub async fn start(
        cfg: CrosslinkConfig,
        transport: Arc<dyn Transport>,
        directory: Arc<dyn DeviceDirectory>,
        metadata: Arc<dyn MetadataCache>,
        lifecycle: Arc<dyn ComponentLifecycle>,
    ) -> Self {
        let cfg = Arc::new(cfg);
        let identities: IdentityMap = Arc::new(DashMap::new());
        let resolver = Arc::new(PeerResolver::new(
            metadata,
            directory.local_device_id(),
            &cfg,
        ));
        let relation = RelationChecker::new(Arc::clone(&identities));
        let dispatcher = Dispatcher::start_with(|handle| {
            Engine::new(
                cfg,
                handle.clone(),
                transport,
                directory,
                lifecycle,
                resolver,
                identities,
            )
        })
        .await;
        Self {
            dispatcher,
            relation,
        }
    }

    /// Begin a collaboration session. Returns the session token once the
    /// outbound start command is on its way to the sink.
    pub async fn begin_collaboration(
        &self,
        request: CollaborationRequest,
    ) -> Result<String, CrosslinkError> {
        self.dispatcher
            .handle()
            .call(move |engine| engine.begin_collaboration(request))
            .await?
    }

    /// Begin a continuation for a caller-chosen mission id. The final
    /// outcome is delivered through `callback`; a second begin for a live
    /// mission id fails with `AlreadyInProgress`.
    pub async fn begin_continuation(
        &self,
        mission_id: u64,
        request: ContinuationRequest,
        callback: Arc<dyn ContinuationCallback>,
    ) -> Result<(), CrosslinkError> {
        self.dispatcher
            .handle()
            .call(move |engine| engine.begin_continuation(mission_id, request, callback))
            .await?
    }

    /// Entry point for inbound wire data. Malformed frames are logged and
    /// dropped; the peer learns nothing and eventually times out.
    pub fn notify_transport_data(&self, channel: ChannelId, bytes: &[u8]) {
        match codec::decode(bytes) {
            Ok(command) => {
                debug!(channel, token = %command.token(), "inbound command");
                let _ = self
                    .dispatcher
                    .handle()
                    .post(move |engine| engine.handle_command(channel, command));
            }
            Err(error) => {
                warn!(channel, %error, "dropping malformed command frame");
            }
        }
    }

    /// A transport channel went away. Non-local shutdowns force every
    /// session on the channel into a terminal error state.
    pub fn notify_transport_shutdown(&self, channel: ChannelId, is_local: bool) {
        let _ = self
            .dispatcher
            .handle()
            .post(move |engine| engine.handle_transport_shutdown(channel, is_local));
    }

    /// A peer device dropped out of the directory.
    pub fn notify_device_offline(&self, device_id: &str) {
        let device_id = device_id.to_string();
        let _ = self
            .dispatcher
            .handle()
            .post(move |engine| engine.handle_device_offline(&device_id));
    }

    /// Deliver the out-of-band connect decision for a session waiting in
    /// `AwaitingConnectDecision`.
    pub async fn notify_connect_decision(
        &self,
        token: &str,
        accepted: bool,
    ) -> Result<(), CrosslinkError> {
        let token = token.to_string();
        self.dispatcher
            .handle()
            .call(move |engine| engine.notify_connect_decision(&token, accepted))
            .await?
    }

    /// Close a session explicitly, notifying the peer.
    pub async fn close_session(&self, token: &str) -> Result<(), CrosslinkError> {
        let token = token.to_string();
        self.dispatcher
            .handle()
            .call(move |engine| engine.close_session(&token))
            .await?
    }

    /// Read-only diagnostics snapshot.
    pub async fn dump_sessions(&self) -> Result<Vec<SessionSnapshot>, CrosslinkError> {
        self.dispatcher.handle().call(|engine| engine.dump()).await
    }

    /// Verify a caller's claim against the session record. Reads identity
    /// snapshots directly; never touches the dispatcher.
    pub fn check_relation(
        &self,
        token: &str,
        claimed_source: &PartyClaim,
        claimed_sink: Option<&PartyClaim>,
    ) -> Result<(), CrosslinkError> {
        self.relation.check(token, claimed_source, claimed_sink)
    }

    /// Best-effort teardown: stop intake, discard pending delayed tasks,
    /// and join the worker.
    pub async fn shutdown(self) {
        self.dispatcher.shutdown().await;
    }
}
