//! Dispatcher-owned engine state and protocol event handlers.
//!
//! Every method here runs on the dispatcher worker. Handlers fully handle
//! their own error paths before returning: protocol errors are logged and
//! dropped, caller-visible failures travel through the registered callback
//! with a result code, and nothing propagates across the dispatcher
//! boundary.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crosslink_protocol::{Command, PartyIdentity, ResultCode, SourceAppRef, codec};

use crate::callbacks::{CallbackEntry, CallbackRegistry, ContinuationCallback};
use crate::config::CrosslinkConfig;
use crate::dispatcher::DispatcherHandle;
use crate::error::CrosslinkError;
use crate::external::{ComponentLifecycle, DeviceDirectory, StartDescriptor, Transport};
use crate::relation::IdentityMap;
use crate::resolve::{PeerResolver, ResolvedPair};
use crate::service::{CollaborationRequest, ContinuationRequest};
use crate::session::{
    ChannelId, Session, SessionKind, SessionRegistry, SessionRole, SessionSnapshot, SessionState,
};

enum EndMode {
    /// Explicit close or peer disconnect: `Ending` then `Ended`.
    Graceful,
    /// Timeout, protocol failure, transport loss: `ErrorEnded`.
    Error,
}

pub(crate) struct Engine {
    cfg: Arc<CrosslinkConfig>,
    handle: DispatcherHandle<Engine>,
    transport: Arc<dyn Transport>,
    directory: Arc<dyn DeviceDirectory>,
    lifecycle: Arc<dyn ComponentLifecycle>,
    resolver: Arc<PeerResolver>,
    sessions: SessionRegistry,
    callbacks: CallbackRegistry,
    /// Pending out-of-band connect decisions, keyed by session token.
    decisions: HashMap<String, oneshot::Sender<bool>>,
}

fn session_timer(token: &str) -> String {
    format!("session:{token}")
}

fn mission_timer(mission_id: u64) -> String {
    format!("mission:{mission_id}")
}

fn release_timer(token: &str) -> String {
    format!("release:{token}")
}

impl Engine {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        cfg: Arc<CrosslinkConfig>,
        handle: DispatcherHandle<Engine>,
        transport: Arc<dyn Transport>,
        directory: Arc<dyn DeviceDirectory>,
        lifecycle: Arc<dyn ComponentLifecycle>,
        resolver: Arc<PeerResolver>,
        identities: IdentityMap,
    ) -> Self {
        Self {
            cfg,
            handle,
            transport,
            directory,
            lifecycle,
            resolver,
            sessions: SessionRegistry::with_identities(identities),
            callbacks: CallbackRegistry::new(),
            decisions: HashMap::new(),
        }
    }

    // ---- local begin requests -------------------------------------------

    pub(crate) fn begin_collaboration(
        &mut self,
        request: CollaborationRequest,
    ) -> Result<String, CrosslinkError> {
        validate_request(&request.source, &request.sink_device_id)?;
        if self.directory.lookup(&request.sink_device_id).is_none() {
            return Err(CrosslinkError::DeviceNotFound(request.sink_device_id));
        }

        let token = self
            .sessions
            .generate_token(&self.directory.local_device_id());
        self.open_source_session(
            token.clone(),
            SessionKind::Collaboration,
            request.sink_device_id,
            request.source,
            request.app_ref,
            request.descriptor,
        )?;
        Ok(token)
    }

    pub(crate) fn begin_continuation(
        &mut self,
        mission_id: u64,
        request: ContinuationRequest,
        callback: Arc<dyn ContinuationCallback>,
    ) -> Result<(), CrosslinkError> {
        validate_request(&request.source, &request.sink_device_id)?;
        if self.directory.lookup(&request.sink_device_id).is_none() {
            return Err(CrosslinkError::DeviceNotFound(request.sink_device_id));
        }

        self.callbacks.push(
            mission_id,
            CallbackEntry {
                callback,
                target_device_id: request.sink_device_id.clone(),
                free_install: request.descriptor.free_install,
                clean_mission: request.clean_mission,
            },
        )?;

        let token = self
            .sessions
            .generate_token(&self.directory.local_device_id());
        if let Err(error) = self.open_source_session(
            token,
            SessionKind::Continuation { mission_id },
            request.sink_device_id,
            request.source,
            request.app_ref,
            request.descriptor,
        ) {
            // Keep the at-most-one-entry invariant honest on failure.
            self.callbacks.pop(mission_id);
            return Err(error);
        }

        let timeout = self.cfg.session_timeout();
        let _ = self.handle.post_after(
            mission_timer(mission_id),
            timeout,
            move |engine: &mut Engine| engine.on_mission_timeout(mission_id),
        );
        Ok(())
    }

    fn open_source_session(
        &mut self,
        token: String,
        kind: SessionKind,
        sink_device_id: String,
        source: PartyIdentity,
        app_ref: SourceAppRef,
        descriptor: crosslink_protocol::CapabilityDescriptor,
    ) -> Result<(), CrosslinkError> {
        let command = Command::SinkStart {
            token: token.clone(),
            source_device_id: source.device_id.clone(),
            sink_device_id: sink_device_id.clone(),
            source: source.clone(),
            app_ref,
            descriptor: descriptor.clone(),
            mission_id: kind.mission_id(),
        };

        let mut session = Session {
            token: token.clone(),
            role: SessionRole::Source,
            kind,
            state: SessionState::Initiated,
            source,
            sink: None,
            peer_device_id: sink_device_id,
            descriptor,
            channel: None,
            created_at: Instant::now(),
        };
        session.advance(SessionState::SourceStarting)?;
        self.sessions.insert(session)?;
        self.schedule_session_timeout(&token);

        if let Err(error) = self.send_command(&command) {
            let _ = self.handle.cancel(session_timer(&token));
            self.sessions.remove(&token);
            return Err(error);
        }
        info!(token = %token, "session started toward sink");
        Ok(())
    }

    // ---- inbound commands -----------------------------------------------

    pub(crate) fn handle_command(&mut self, channel: ChannelId, command: Command) {
        match command {
            Command::SinkStart {
                token,
                source_device_id,
                sink_device_id,
                source,
                app_ref,
                descriptor,
                mission_id,
            } => self.handle_sink_start(
                channel,
                token,
                source_device_id,
                sink_device_id,
                source,
                app_ref,
                descriptor,
                mission_id,
            ),
            Command::NotifyResult { token, code } => {
                self.handle_notify_result(channel, token, code);
            }
            Command::Disconnect { token } => self.handle_disconnect(token),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_sink_start(
        &mut self,
        channel: ChannelId,
        token: String,
        source_device_id: String,
        sink_device_id: String,
        source: PartyIdentity,
        app_ref: SourceAppRef,
        descriptor: crosslink_protocol::CapabilityDescriptor,
        mission_id: Option<u64>,
    ) {
        if self.sessions.contains(&token) {
            warn!(token = %token, "start for an already registered token, dropping");
            return;
        }
        if sink_device_id != self.directory.local_device_id() {
            warn!(token = %token, sink = %sink_device_id, "start addressed to another device, dropping");
            return;
        }
        if self.directory.lookup(&source_device_id).is_none() {
            warn!(token = %token, source = %source_device_id, "start from unknown source device, dropping");
            return;
        }

        let kind = match mission_id {
            Some(mission_id) => SessionKind::Continuation { mission_id },
            None => SessionKind::Collaboration,
        };
        let mut session = Session {
            token: token.clone(),
            role: SessionRole::Sink,
            kind,
            state: SessionState::Initiated,
            source,
            sink: None,
            peer_device_id: source_device_id.clone(),
            descriptor,
            channel: Some(channel),
            created_at: Instant::now(),
        };
        if session.advance(SessionState::SinkStarting).is_err() {
            return;
        }
        if self.sessions.insert(session).is_err() {
            return;
        }
        self.schedule_session_timeout(&token);
        info!(token = %token, source = %source_device_id, "inbound start accepted");

        // Resolution awaits cache refreshes, so it runs off the dispatcher
        // and posts its outcome back.
        let resolver = Arc::clone(&self.resolver);
        let handle = self.handle.clone();
        tokio::spawn(async move {
            let outcome = match app_ref {
                SourceAppRef::ById { bundle_id, type_id } => {
                    resolver
                        .resolve_by_id(&source_device_id, bundle_id, type_id)
                        .await
                }
                SourceAppRef::ByName {
                    bundle_name,
                    continue_type,
                } => {
                    resolver
                        .resolve_by_name(&source_device_id, &bundle_name, &continue_type)
                        .await
                }
            };
            let _ = handle.post(move |engine| engine.on_resolved(token, outcome));
        });
    }

    fn on_resolved(&mut self, token: String, outcome: Result<ResolvedPair, CrosslinkError>) {
        if !self.sessions.contains(&token) {
            debug!(token = %token, "resolution finished for a dead session");
            return;
        }
        let pair = match outcome {
            Ok(pair) => pair,
            Err(error) => {
                warn!(token = %token, %error, "peer identity resolution failed");
                let code = error.to_result_code();
                let _ = self.send_command(&Command::NotifyResult {
                    token: token.clone(),
                    code: code.as_i32(),
                });
                self.end_session(&token, code, EndMode::Error, false);
                return;
            }
        };

        let need_confirm = self
            .sessions
            .get(&token)
            .is_some_and(|s| s.descriptor.need_confirm);
        if !need_confirm {
            self.proceed_start(token, pair);
            return;
        }

        if let Some(session) = self.sessions.get_mut(&token) {
            if session.advance(SessionState::AwaitingConnectDecision).is_err() {
                return;
            }
        }
        let (tx, rx) = oneshot::channel();
        self.decisions.insert(token.clone(), tx);

        // Bounded wait on a separate task; the outcome is posted back so
        // the worker never blocks on the decision.
        let handle = self.handle.clone();
        let timeout = self.cfg.connect_decision_timeout();
        tokio::spawn(async move {
            let accepted = matches!(tokio::time::timeout(timeout, rx).await, Ok(Ok(true)));
            let _ = handle.post(move |engine| engine.on_connect_decision(token, accepted, pair));
        });
    }

    fn on_connect_decision(&mut self, token: String, accepted: bool, pair: ResolvedPair) {
        self.decisions.remove(&token);
        if !self.sessions.contains(&token) {
            return;
        }
        if !accepted {
            info!(token = %token, "connect decision rejected or timed out");
            let _ = self.send_command(&Command::NotifyResult {
                token: token.clone(),
                code: ResultCode::Rejected.as_i32(),
            });
            self.end_session(&token, ResultCode::Rejected, EndMode::Error, false);
            return;
        }
        self.proceed_start(token, pair);
    }

    pub(crate) fn notify_connect_decision(
        &mut self,
        token: &str,
        accepted: bool,
    ) -> Result<(), CrosslinkError> {
        let tx = self
            .decisions
            .remove(token)
            .ok_or_else(|| CrosslinkError::SessionNotFound(token.to_string()))?;
        let _ = tx.send(accepted);
        Ok(())
    }

    fn proceed_start(&mut self, token: String, pair: ResolvedPair) {
        let descriptor = {
            let Some(session) = self.sessions.get(&token) else {
                return;
            };
            StartDescriptor {
                token: token.clone(),
                bundle_name: pair.sink_bundle.clone(),
                module_name: pair.sink_module.clone(),
                ability_name: pair.sink_ability.clone(),
                source_device_id: session.source.device_id.clone(),
                free_install: session.descriptor.free_install,
                params: session.descriptor.params.clone(),
            }
        };

        match self.lifecycle.start_component(&descriptor) {
            Ok(component) => {
                let sink = PartyIdentity {
                    device_id: self.directory.local_device_id(),
                    pid: component.pid,
                    uid: component.uid,
                    access_token_id: component.access_token_id,
                    bundle_name: pair.sink_bundle,
                    ability_name: pair.sink_ability,
                    module_name: pair.sink_module,
                };
                self.sessions.set_sink_identity(&token, sink);
                let _ = self.handle.cancel(session_timer(&token));
                if let Some(session) = self.sessions.get_mut(&token) {
                    let _ = session.advance(SessionState::Connected);
                }
                info!(token = %token, "sink component started");
                let _ = self.send_command(&Command::NotifyResult {
                    token,
                    code: ResultCode::Ok.as_i32(),
                });
            }
            Err(error) => {
                error!(token = %token, %error, "component start failed");
                let _ = self.send_command(&Command::NotifyResult {
                    token: token.clone(),
                    code: ResultCode::StartFailed.as_i32(),
                });
                self.end_session(&token, ResultCode::StartFailed, EndMode::Error, false);
            }
        }
    }

    fn handle_notify_result(&mut self, channel: ChannelId, token: String, raw_code: i32) {
        let code = ResultCode::from_i32(raw_code).unwrap_or(ResultCode::StartFailed);
        let (kind, source_bundle, source_ability, advanced) = {
            let Some(session) = self.sessions.get_mut(&token) else {
                warn!(token = %token, "result for unknown session token, dropping");
                return;
            };
            if session.channel.is_none() {
                session.channel = Some(channel);
            }
            let advanced = code.is_ok() && session.advance(SessionState::Connected).is_ok();
            (
                session.kind.clone(),
                session.source.bundle_name.clone(),
                session.source.ability_name.clone(),
                advanced,
            )
        };
        let _ = self.handle.cancel(session_timer(&token));

        if !code.is_ok() {
            warn!(token = %token, code = raw_code, "peer reported start failure");
            self.end_session(&token, code, EndMode::Error, false);
            return;
        }
        if !advanced {
            return;
        }

        if let SessionKind::Continuation { mission_id } = kind {
            let _ = self.handle.cancel(mission_timer(mission_id));
            let clean = self.callbacks.is_clean_mission(mission_id);
            self.callbacks.notify_result(mission_id, ResultCode::Ok);
            if clean {
                self.schedule_source_release(&token, source_bundle, source_ability);
            }
        }
        info!(token = %token, "session connected");
    }

    fn handle_disconnect(&mut self, token: String) {
        if !self.sessions.contains(&token) {
            debug!(token = %token, "disconnect for unknown token, dropping");
            return;
        }
        info!(token = %token, "peer disconnected session");
        self.end_session(&token, ResultCode::SessionShutdown, EndMode::Graceful, false);
    }

    // ---- external events ------------------------------------------------

    pub(crate) fn close_session(&mut self, token: &str) -> Result<(), CrosslinkError> {
        if !self.sessions.contains(token) {
            return Err(CrosslinkError::SessionNotFound(token.to_string()));
        }
        self.end_session(token, ResultCode::SessionShutdown, EndMode::Graceful, true);
        Ok(())
    }

    pub(crate) fn handle_transport_shutdown(&mut self, channel: ChannelId, is_local: bool) {
        if is_local {
            debug!(channel, "locally initiated transport shutdown");
            return;
        }
        for token in self.sessions.tokens_for_channel(channel) {
            warn!(token = %token, channel, "transport shut down under session");
            self.end_session(&token, ResultCode::SessionShutdown, EndMode::Error, false);
        }
    }

    pub(crate) fn handle_device_offline(&mut self, device_id: &str) {
        for token in self.sessions.tokens_for_peer(device_id) {
            warn!(token = %token, device_id, "peer device went offline");
            self.end_session(&token, ResultCode::SessionShutdown, EndMode::Error, false);
        }
    }

    pub(crate) fn dump(&self) -> Vec<SessionSnapshot> {
        self.sessions.snapshot()
    }

    // ---- timers and teardown --------------------------------------------

    fn schedule_session_timeout(&self, token: &str) {
        let owned = token.to_string();
        let _ = self.handle.post_after(
            session_timer(token),
            self.cfg.session_timeout(),
            move |engine: &mut Engine| engine.on_session_timeout(owned),
        );
    }

    fn on_session_timeout(&mut self, token: String) {
        let Some(state) = self.sessions.get(&token).map(|s| s.state) else {
            return;
        };
        if state == SessionState::Connected || state.is_terminal() {
            return;
        }
        warn!(token = %token, state = state.name(), "session timed out");
        self.end_session(&token, ResultCode::Timeout, EndMode::Error, false);
    }

    fn on_mission_timeout(&mut self, mission_id: u64) {
        if let Some(entry) = self.callbacks.pop(mission_id) {
            warn!(mission_id, "continuation timed out before a result arrived");
            entry.callback.on_result(mission_id, ResultCode::Timeout);
        }
    }

    fn schedule_source_release(&self, token: &str, bundle_name: String, ability_name: String) {
        let _ = self.handle.post_after(
            release_timer(token),
            self.cfg.background_release_grace(),
            move |engine: &mut Engine| {
                match engine
                    .lifecycle
                    .release_component(&bundle_name, &ability_name)
                {
                    Ok(()) => debug!(bundle = %bundle_name, "source ability released"),
                    Err(error) => warn!(bundle = %bundle_name, %error, "source release failed"),
                }
            },
        );
    }

    /// Single cleanup path: erase the registry entry, cancel timers, drop a
    /// pending decision, deliver the callback for source continuations, and
    /// optionally tell the peer.
    fn end_session(&mut self, token: &str, code: ResultCode, mode: EndMode, notify_peer: bool) {
        let Some(mut session) = self.sessions.remove(token) else {
            return;
        };
        let _ = self.handle.cancel(session_timer(token));
        let _ = self.handle.cancel(release_timer(token));
        if let Some(tx) = self.decisions.remove(token) {
            drop(tx);
        }

        match mode {
            EndMode::Graceful => {
                let _ = session.advance(SessionState::Ending);
                let _ = session.advance(SessionState::Ended);
            }
            EndMode::Error => {
                let _ = session.advance(SessionState::ErrorEnded);
            }
        }

        if let SessionKind::Continuation { mission_id } = session.kind {
            let _ = self.handle.cancel(mission_timer(mission_id));
            if session.role == SessionRole::Source {
                self.callbacks.notify_result(mission_id, code);
            }
        }

        if notify_peer {
            let _ = self.send_command(&Command::Disconnect {
                token: token.to_string(),
            });
        }
        info!(
            token = %token,
            code = code.as_i32(),
            state = session.state.name(),
            "session ended"
        );
    }

    fn send_command(&self, command: &Command) -> Result<(), CrosslinkError> {
        let max_len = self
            .cfg
            .max_command_len
            .min(self.transport.max_payload_len());
        let bytes = codec::encode(command, max_len)?;
        self.transport.send(command.token(), &bytes)
    }
}

fn validate_request(
    source: &PartyIdentity,
    sink_device_id: &str,
) -> Result<(), CrosslinkError> {
    if sink_device_id.is_empty() {
        return Err(CrosslinkError::InvalidArgs("sink device id is empty".into()));
    }
    if source.device_id.is_empty() {
        return Err(CrosslinkError::InvalidArgs("source device id is empty".into()));
    }
    if source.bundle_name.is_empty() || source.ability_name.is_empty() {
        return Err(CrosslinkError::InvalidArgs(
            "source bundle and ability are required".into(),
        ));
    }
    Ok(())
}
