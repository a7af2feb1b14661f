//! Session state machine.
//!
//! `SessionMachine` is synchronous and performs no I/O: every link event, host
//! command, operation completion and timer firing is fed in as an [`Input`], and
//! the machine answers with the [`Action`]s the runtime must carry out. All
//! session, registry and ledger state lives here.
//!
//! Each connection attempt is stamped with a [`SessionId`]. Teardown, link loss
//! and reconnect retire the id, and completions that carry a retired id are
//! dropped without touching state.

use crate::codec::{AppPacket, Frame, MeshCodec, PacketKind, BROADCAST_NODE_ID};
use crate::config::SupervisorConfig;
use crate::ledger::{Direction, MessageLedger, MessageRecord};
use crate::logutil::{escape_log, hex_snippet};
use crate::metrics::LinkMetrics;
use crate::registry::{MergeOutcome, NodeRecord, NodeRegistry, NodeUpdate};
use crate::transport::{DeviceHandle, DeviceId, LinkError, LinkEvent};
use bytes::Bytes;
use log::{debug, info, trace, warn};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct SessionId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SendTicket(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReconnectTicket(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LinkState {
    Idle,
    Scanning,
    Connecting,
    AttributeDiscovery,
    HandshakeSync,
    Ready,
    Disconnecting,
    Reconnecting,
}

impl LinkState {
    pub fn as_str(self) -> &'static str {
        match self {
            LinkState::Idle => "idle",
            LinkState::Scanning => "scanning",
            LinkState::Connecting => "connecting",
            LinkState::AttributeDiscovery => "attribute-discovery",
            LinkState::HandshakeSync => "handshake-sync",
            LinkState::Ready => "ready",
            LinkState::Disconnecting => "disconnecting",
            LinkState::Reconnecting => "reconnecting",
        }
    }

    /// States in which an attempt or a live link exists.
    fn is_attached(self) -> bool {
        matches!(
            self,
            LinkState::Connecting
                | LinkState::AttributeDiscovery
                | LinkState::HandshakeSync
                | LinkState::Ready
        )
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SendError {
    #[error("no ready session")]
    NotReady,
    #[error("message is empty")]
    EmptyMessage,
    #[error("session ended before the message was written")]
    SessionEnded,
    #[error("write failed: {0}")]
    Link(#[from] LinkError),
}

/// High-level happenings surfaced to the host application.
#[derive(Debug, Clone, PartialEq)]
pub enum HostEvent {
    NodeUpdated(NodeRecord),
    MessageReceived {
        id: u32,
        from: u32,
        from_long_name: String,
        from_short_name: String,
        text: String,
    },
    ConnectionStateChanged(LinkState),
    LastErrorChanged(Option<String>),
}

/// Read-only view of the current session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Session {
    pub device: DeviceHandle,
    pub state: LinkState,
    pub token: Option<u32>,
    pub self_node: Option<u32>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WritePurpose {
    Handshake,
    Text {
        ticket: SendTicket,
        record: MessageRecord,
    },
}

#[derive(Debug, Clone)]
pub enum Input {
    PowerChanged(bool),
    Discovered(DeviceHandle),
    LinkLost {
        device: DeviceId,
        error: Option<LinkError>,
    },
    Doorbell,
    ScanFailed(LinkError),

    StartScanning,
    StopScanning,
    ConnectTo(DeviceId),
    DisconnectDevice,
    Send {
        ticket: SendTicket,
        text: String,
    },

    Connected {
        session: SessionId,
        device: DeviceId,
        result: Result<(), LinkError>,
    },
    ChannelsOpened {
        session: SessionId,
        result: Result<(), LinkError>,
    },
    WriteFinished {
        session: SessionId,
        purpose: WritePurpose,
        result: Result<(), LinkError>,
    },
    Pulled {
        session: SessionId,
        result: Result<Bytes, LinkError>,
    },
    DisconnectFinished {
        device: DeviceId,
    },
    ReconnectDue(ReconnectTicket),
}

impl From<LinkEvent> for Input {
    fn from(event: LinkEvent) -> Self {
        match event {
            LinkEvent::PowerChanged(on) => Input::PowerChanged(on),
            LinkEvent::Discovered(handle) => Input::Discovered(handle),
            LinkEvent::Disconnected { device, error } => Input::LinkLost { device, error },
            LinkEvent::Doorbell => Input::Doorbell,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    StartScan,
    StopScan,
    Connect {
        session: SessionId,
        device: DeviceId,
    },
    OpenChannels {
        session: SessionId,
        device: DeviceId,
    },
    Write {
        session: SessionId,
        payload: Bytes,
        purpose: WritePurpose,
    },
    Pull {
        session: SessionId,
    },
    Disconnect {
        device: DeviceId,
    },
    ScheduleReconnect {
        ticket: ReconnectTicket,
        delay: Duration,
    },
    CancelReconnect,
    CompleteSend {
        ticket: SendTicket,
        result: Result<(), SendError>,
    },
    Emit(HostEvent),
}

#[derive(Debug, Default)]
struct Drain {
    /// Handshake written; pulls may run.
    active: bool,
    in_flight: bool,
    /// Doorbell rang while a pull was in flight.
    doorbell_pending: bool,
}

#[derive(Debug)]
struct Current {
    device: DeviceHandle,
    /// `None` once retired.
    session: Option<SessionId>,
    token: Option<u32>,
    /// Started by the delayed retry rather than the host.
    from_retry: bool,
}

pub struct SessionMachine {
    config: SupervisorConfig,
    metrics: Arc<LinkMetrics>,
    state: LinkState,
    powered: bool,
    current: Option<Current>,
    next_id: u64,
    drain: Drain,
    teardown: Option<DeviceId>,
    pending_connect: Option<DeviceHandle>,
    reconnect: Option<ReconnectTicket>,
    /// Retry delay held back until the old link's teardown has finished.
    deferred_retry: Option<Duration>,
    last_error: Option<String>,
    last_connected: Option<DeviceId>,
    discovered: Vec<DeviceHandle>,
    registry: NodeRegistry,
    ledger: MessageLedger,
}

fn now_secs() -> u32 {
    chrono::Utc::now().timestamp().clamp(0, i64::from(u32::MAX)) as u32
}

impl SessionMachine {
    pub fn new(config: SupervisorConfig, metrics: Arc<LinkMetrics>, powered: bool) -> Self {
        let last_connected = config.last_connected_device.clone();
        Self {
            config,
            metrics,
            state: LinkState::Idle,
            powered,
            current: None,
            next_id: 0,
            drain: Drain::default(),
            teardown: None,
            pending_connect: None,
            reconnect: None,
            deferred_retry: None,
            last_error: None,
            last_connected,
            discovered: Vec::new(),
            registry: NodeRegistry::new(),
            ledger: MessageLedger::new(),
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn session(&self) -> Option<Session> {
        self.current.as_ref().map(|cur| Session {
            device: cur.device.clone(),
            state: self.state,
            token: cur.token,
            self_node: self.registry.self_id(),
            last_error: self.last_error.clone(),
        })
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    pub fn ledger(&self) -> &MessageLedger {
        &self.ledger
    }

    pub fn discovered(&self) -> &[DeviceHandle] {
        &self.discovered
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Device whose link may still be up.
    pub fn linked_device(&self) -> Option<DeviceId> {
        if self.state.is_attached() || self.state == LinkState::Disconnecting {
            self.current.as_ref().map(|c| c.device.id.clone())
        } else {
            None
        }
    }

    pub fn handle(&mut self, input: Input) -> Vec<Action> {
        let mut out = Vec::new();
        match input {
            Input::PowerChanged(on) => self.on_power(on, &mut out),
            Input::Discovered(handle) => self.on_discovered(handle),
            Input::LinkLost { device, error } => self.on_link_lost(device, error, &mut out),
            Input::Doorbell => self.on_doorbell(&mut out),
            Input::ScanFailed(err) => self.on_scan_failed(err, &mut out),
            Input::StartScanning => self.start_scanning(&mut out),
            Input::StopScanning => self.stop_scanning(&mut out),
            Input::ConnectTo(device) => self.connect_to(device, &mut out),
            Input::DisconnectDevice => self.disconnect_device(&mut out),
            Input::Send { ticket, text } => self.on_send(ticket, text, &mut out),
            Input::Connected {
                session,
                device,
                result,
            } => self.on_connected(session, device, result, &mut out),
            Input::ChannelsOpened { session, result } => {
                self.on_channels_opened(session, result, &mut out)
            }
            Input::WriteFinished {
                session,
                purpose,
                result,
            } => self.on_write_finished(session, purpose, result, &mut out),
            Input::Pulled { session, result } => self.on_pulled(session, result, &mut out),
            Input::DisconnectFinished { device } => self.on_disconnect_finished(device, &mut out),
            Input::ReconnectDue(ticket) => self.on_reconnect_due(ticket, &mut out),
        }
        out
    }

    fn set_state(&mut self, next: LinkState, out: &mut Vec<Action>) {
        if self.state != next {
            debug!("Link state {} -> {}", self.state, next);
            self.state = next;
            out.push(Action::Emit(HostEvent::ConnectionStateChanged(next)));
        }
    }

    fn set_last_error(&mut self, err: Option<String>, out: &mut Vec<Action>) {
        if self.last_error != err {
            if let Some(msg) = &err {
                warn!("{}", msg);
            }
            self.last_error = err.clone();
            out.push(Action::Emit(HostEvent::LastErrorChanged(err)));
        }
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn live_session(&self) -> Option<SessionId> {
        self.current.as_ref().and_then(|c| c.session)
    }

    fn is_live(&self, session: SessionId) -> bool {
        self.live_session() == Some(session)
    }

    fn discard(&self, what: &str) {
        self.metrics.inc_discarded_results();
        debug!("Discarding {} result from a retired session", what);
    }

    fn on_power(&mut self, on: bool, out: &mut Vec<Action>) {
        self.powered = on;
        info!("Radio stack powered {}", if on { "on" } else { "off" });
        if !on && self.state == LinkState::Scanning {
            self.cancel_reconnect(out);
            self.go_idle(out);
        }
    }

    fn on_discovered(&mut self, handle: DeviceHandle) {
        if self.state != LinkState::Scanning {
            trace!("Ignoring advertisement from {} outside a scan", handle.id);
            return;
        }
        match self.discovered.iter_mut().find(|d| d.id == handle.id) {
            Some(existing) => *existing = handle,
            None => {
                info!(
                    "Discovered {} ({}) rssi {}",
                    escape_log(&handle.name),
                    handle.id,
                    handle.rssi
                );
                self.discovered.push(handle);
            }
        }
    }

    fn start_scanning(&mut self, out: &mut Vec<Action>) {
        if !self.powered {
            debug!("Scan requested while the radio stack is unavailable");
            return;
        }
        if !matches!(self.state, LinkState::Idle | LinkState::Reconnecting) {
            debug!("Scan requested in state {}", self.state);
            return;
        }
        self.discovered.clear();
        self.set_state(LinkState::Scanning, out);
        out.push(Action::StartScan);
    }

    fn stop_scanning(&mut self, out: &mut Vec<Action>) {
        if self.state == LinkState::Scanning {
            out.push(Action::StopScan);
            self.leave_scan(out);
        }
    }

    fn on_scan_failed(&mut self, err: LinkError, out: &mut Vec<Action>) {
        if self.state == LinkState::Scanning {
            warn!("Scan failed: {}", err);
            self.leave_scan(out);
        }
    }

    /// A scan started while a retry was pending falls back to waiting for it.
    fn leave_scan(&mut self, out: &mut Vec<Action>) {
        let next = if self.reconnect.is_some() {
            LinkState::Reconnecting
        } else {
            LinkState::Idle
        };
        self.set_state(next, out);
    }

    fn connect_to(&mut self, device: DeviceId, out: &mut Vec<Action>) {
        let handle = self
            .discovered
            .iter()
            .find(|d| d.id == device)
            .cloned()
            .or_else(|| {
                self.current
                    .as_ref()
                    .filter(|c| c.device.id == device)
                    .map(|c| c.device.clone())
            });
        let Some(handle) = handle else {
            warn!("Cannot connect to {}: device was not discovered", device);
            return;
        };

        self.cancel_reconnect(out);
        if self.state == LinkState::Scanning {
            out.push(Action::StopScan);
        }
        self.discovered.clear();

        match self.state {
            s if s.is_attached() => {
                self.begin_teardown(out);
                self.pending_connect = Some(handle);
            }
            LinkState::Disconnecting => self.pending_connect = Some(handle),
            LinkState::Reconnecting | LinkState::Scanning if self.teardown.is_some() => {
                // The timed-out link is still being closed.
                self.pending_connect = Some(handle);
                self.set_state(LinkState::Disconnecting, out);
            }
            _ => self.begin_connect(handle, false, out),
        }
    }

    fn begin_connect(&mut self, handle: DeviceHandle, from_retry: bool, out: &mut Vec<Action>) {
        let session = SessionId(self.next_id());
        info!("Connecting to {} ({})", escape_log(&handle.name), handle.id);
        let device = handle.id.clone();
        self.current = Some(Current {
            device: handle,
            session: Some(session),
            token: None,
            from_retry,
        });
        self.drain = Drain::default();
        self.pending_connect = None;
        self.set_state(LinkState::Connecting, out);
        out.push(Action::Connect { session, device });
    }

    fn begin_teardown(&mut self, out: &mut Vec<Action>) {
        if let Some(cur) = self.current.as_mut() {
            cur.session = None;
            let device = cur.device.id.clone();
            info!("Disconnecting from {}", device);
            self.teardown = Some(device.clone());
            out.push(Action::Disconnect { device });
        }
        self.drain = Drain::default();
        self.registry.clear_self();
        self.set_state(LinkState::Disconnecting, out);
    }

    fn finish_disconnect(&mut self, out: &mut Vec<Action>) {
        self.teardown = None;
        match self.pending_connect.take() {
            Some(handle) => self.begin_connect(handle, false, out),
            None => self.go_idle(out),
        }
    }

    fn go_idle(&mut self, out: &mut Vec<Action>) {
        self.current = None;
        self.drain = Drain::default();
        self.registry.clear_self();
        self.set_state(LinkState::Idle, out);
    }

    fn cancel_reconnect(&mut self, out: &mut Vec<Action>) {
        self.deferred_retry = None;
        if self.reconnect.take().is_some() {
            debug!("Cancelling pending reconnect");
            out.push(Action::CancelReconnect);
        }
    }

    fn maybe_rescan(&mut self, out: &mut Vec<Action>) {
        if self.config.rescan_after_link_loss && self.powered {
            debug!("Rescanning after link loss");
            self.start_scanning(out);
        }
    }

    fn disconnect_device(&mut self, out: &mut Vec<Action>) {
        self.cancel_reconnect(out);
        self.pending_connect = None;
        match self.state {
            LinkState::Idle | LinkState::Disconnecting => {}
            LinkState::Scanning => self.stop_scanning(out),
            LinkState::Reconnecting => {
                info!("Disconnect requested while waiting to reconnect");
                self.go_idle(out);
            }
            _ => self.begin_teardown(out),
        }
    }

    fn on_disconnect_finished(&mut self, device: DeviceId, out: &mut Vec<Action>) {
        if self.teardown.as_ref() != Some(&device) {
            return;
        }
        if self.state == LinkState::Disconnecting {
            self.finish_disconnect(out);
            return;
        }
        self.teardown = None;
        if let (Some(ticket), Some(delay)) = (self.reconnect, self.deferred_retry.take()) {
            debug!("Old link to {} closed, starting retry timer", device);
            out.push(Action::ScheduleReconnect { ticket, delay });
        }
    }

    fn on_link_lost(&mut self, device: DeviceId, error: Option<LinkError>, out: &mut Vec<Action>) {
        match self.state {
            LinkState::Idle | LinkState::Scanning | LinkState::Reconnecting => {
                debug!("Ignoring disconnect of {} in state {}", device, self.state);
            }
            LinkState::Disconnecting => {
                if self.teardown.as_ref() == Some(&device) {
                    self.finish_disconnect(out);
                }
            }
            _ => {
                if self.current.as_ref().map(|c| &c.device.id) != Some(&device) {
                    debug!("Ignoring disconnect of unrelated device {}", device);
                    return;
                }
                match &error {
                    None => info!("{} disconnected", device),
                    Some(e) => warn!("Link to {} lost: {}", device, e),
                }
                self.fail_session(error, false, out);
            }
        }
    }

    /// Classify a link failure of the current session and move on from it.
    fn fail_session(&mut self, error: Option<LinkError>, link_up: bool, out: &mut Vec<Action>) {
        let Some(cur) = self.current.as_mut() else {
            return;
        };
        cur.session = None;
        let device = cur.device.clone();
        let from_retry = cur.from_retry;

        self.drain = Drain::default();
        self.registry.clear_self();
        if link_up {
            self.teardown = Some(device.id.clone());
            out.push(Action::Disconnect {
                device: device.id.clone(),
            });
        }

        let name = escape_log(&device.name);
        match error {
            Some(LinkError::Timeout) if !from_retry => {
                let ticket = ReconnectTicket(self.next_id());
                let delay = self.config.reconnect_delay;
                self.reconnect = Some(ticket);
                self.metrics.inc_reconnects_scheduled();
                info!("Link to {} timed out, retrying in {:?}", device.id, delay);
                self.set_state(LinkState::Reconnecting, out);
                if link_up {
                    // The timer starts once the old link is gone.
                    self.deferred_retry = Some(delay);
                } else {
                    out.push(Action::ScheduleReconnect { ticket, delay });
                }
            }
            Some(LinkError::Timeout) => {
                self.set_last_error(Some(format!("Reconnect to {} timed out", name)), out);
                self.go_idle(out);
            }
            None | Some(LinkError::PeerDisconnected) => {
                self.go_idle(out);
                self.maybe_rescan(out);
            }
            Some(LinkError::PairingFailure(detail)) => {
                self.set_last_error(
                    Some(format!(
                        "Pairing with {} failed ({}). Forget the device in the system Bluetooth settings and pair again.",
                        name, detail
                    )),
                    out,
                );
                self.go_idle(out);
            }
            Some(LinkError::MissingCharacteristic(uuid)) => {
                self.set_last_error(
                    Some(format!(
                        "{} is not a Meshtastic radio: characteristic {} not found",
                        name, uuid
                    )),
                    out,
                );
                self.go_idle(out);
            }
            Some(LinkError::Unavailable) => self.go_idle(out),
            Some(other) => {
                self.set_last_error(Some(format!("Connection to {} failed: {}", name, other)), out);
                self.go_idle(out);
                self.maybe_rescan(out);
            }
        }
    }

    fn on_reconnect_due(&mut self, ticket: ReconnectTicket, out: &mut Vec<Action>) {
        if self.reconnect != Some(ticket)
            || !matches!(self.state, LinkState::Reconnecting | LinkState::Scanning)
        {
            debug!("Ignoring stale reconnect timer");
            return;
        }
        self.reconnect = None;
        if self.state == LinkState::Scanning {
            out.push(Action::StopScan);
            self.discovered.clear();
        }
        match self.current.as_ref().map(|c| c.device.clone()) {
            Some(handle) => self.begin_connect(handle, true, out),
            None => self.go_idle(out),
        }
    }

    fn on_connected(
        &mut self,
        session: SessionId,
        device: DeviceId,
        result: Result<(), LinkError>,
        out: &mut Vec<Action>,
    ) {
        if !self.is_live(session) {
            self.discard("connect");
            let owned = self
                .current
                .as_ref()
                .is_some_and(|c| c.session.is_some() && c.device.id == device);
            if result.is_ok() && !owned {
                out.push(Action::Disconnect { device });
            }
            return;
        }
        match result {
            Ok(()) => {
                info!("Link up: {}", device);
                self.last_connected = Some(device.clone());
                self.set_state(LinkState::AttributeDiscovery, out);
                out.push(Action::OpenChannels { session, device });
            }
            Err(e) => {
                warn!("Connect to {} failed: {}", device, e);
                self.fail_session(Some(e), false, out);
            }
        }
    }

    fn on_channels_opened(
        &mut self,
        session: SessionId,
        result: Result<(), LinkError>,
        out: &mut Vec<Action>,
    ) {
        if !self.is_live(session) {
            self.discard("discovery");
            return;
        }
        match result {
            Ok(()) => self.begin_handshake(out),
            Err(e) => {
                warn!("Attribute discovery failed: {}", e);
                self.fail_session(Some(e), true, out);
            }
        }
    }

    fn begin_handshake(&mut self, out: &mut Vec<Action>) {
        let mut token: u32 = rand::random();
        if token == 0 {
            token = 1;
        }
        let Some(cur) = self.current.as_mut() else {
            return;
        };
        let Some(session) = cur.session else {
            return;
        };
        cur.token = Some(token);
        self.drain.active = false;
        debug!("Requesting config with token 0x{:08x}", token);
        self.set_state(LinkState::HandshakeSync, out);
        out.push(Action::Write {
            session,
            payload: MeshCodec::encode_handshake_request(token),
            purpose: WritePurpose::Handshake,
        });
    }

    fn on_write_finished(
        &mut self,
        session: SessionId,
        purpose: WritePurpose,
        result: Result<(), LinkError>,
        out: &mut Vec<Action>,
    ) {
        if !self.is_live(session) {
            self.discard("write");
            if let WritePurpose::Text { ticket, .. } = purpose {
                out.push(Action::CompleteSend {
                    ticket,
                    result: Err(SendError::SessionEnded),
                });
            }
            return;
        }
        match (purpose, result) {
            (WritePurpose::Handshake, Ok(())) => {
                self.drain.active = true;
                self.request_pull(out);
            }
            (WritePurpose::Handshake, Err(e)) => {
                warn!("Handshake request failed: {}", e);
                self.fail_session(Some(e), true, out);
            }
            (WritePurpose::Text { ticket, record }, Ok(())) => {
                info!("Sent broadcast: {}", escape_log(&record.payload));
                self.ledger.append(record);
                self.metrics.inc_messages_out();
                out.push(Action::CompleteSend {
                    ticket,
                    result: Ok(()),
                });
            }
            (WritePurpose::Text { ticket, .. }, Err(e)) => {
                warn!("Text write failed: {}", e);
                out.push(Action::CompleteSend {
                    ticket,
                    result: Err(SendError::Link(e.clone())),
                });
                self.fail_session(Some(e), true, out);
            }
        }
    }

    fn request_pull(&mut self, out: &mut Vec<Action>) {
        let Some(session) = self.live_session() else {
            return;
        };
        if self.drain.in_flight {
            self.drain.doorbell_pending = true;
            return;
        }
        self.drain.in_flight = true;
        self.drain.doorbell_pending = false;
        self.metrics.inc_pulls();
        out.push(Action::Pull { session });
    }

    fn on_doorbell(&mut self, out: &mut Vec<Action>) {
        if self.drain.active
            && matches!(self.state, LinkState::HandshakeSync | LinkState::Ready)
        {
            self.request_pull(out);
        } else {
            trace!("Doorbell ignored in state {}", self.state);
        }
    }

    fn on_pulled(
        &mut self,
        session: SessionId,
        result: Result<Bytes, LinkError>,
        out: &mut Vec<Action>,
    ) {
        if !self.is_live(session) {
            self.discard("pull");
            return;
        }
        self.drain.in_flight = false;
        match result {
            Ok(frame) if frame.is_empty() => {
                self.metrics.inc_empty_pulls();
                if self.drain.active && self.drain.doorbell_pending {
                    self.request_pull(out);
                }
            }
            Ok(frame) => {
                self.apply_bytes(&frame, out);
                if self.drain.active {
                    self.request_pull(out);
                }
            }
            Err(e) => {
                warn!("Pull failed: {}", e);
                self.fail_session(Some(e), true, out);
            }
        }
    }

    fn apply_bytes(&mut self, frame: &[u8], out: &mut Vec<Action>) {
        trace!("from-radio {}", hex_snippet(frame, 32));
        match MeshCodec::decode(frame) {
            Ok(decoded) => {
                self.metrics.inc_frames_decoded();
                self.apply_frame(decoded, out);
            }
            Err(e) => {
                self.metrics.inc_decode_errors();
                warn!("Discarding undecodable frame ({} bytes): {}", frame.len(), e);
            }
        }
    }

    fn apply_frame(&mut self, frame: Frame, out: &mut Vec<Action>) {
        let live = self.state == LinkState::Ready;
        match frame {
            Frame::HandshakeInfo(info) => {
                info!("Connected radio is node 0x{:08x}", info.node_num);
                self.registry.set_self(info.node_num);
            }
            Frame::NodeSnapshot(rec) => self.merge(NodeUpdate::Snapshot(rec), live, out),
            Frame::Packet(pkt) => self.apply_packet(pkt, live, out),
            Frame::HandshakeComplete(token) => self.on_handshake_complete(token, out),
            Frame::Rebooted => {
                if matches!(self.state, LinkState::HandshakeSync | LinkState::Ready) {
                    warn!("Radio rebooted, requesting config again");
                    self.registry.clear_self();
                    self.begin_handshake(out);
                }
            }
            Frame::DeviceLog(entry) => {
                log::log!(
                    target: "device",
                    entry.level.as_log_level(),
                    "[{}] {}",
                    escape_log(&entry.source),
                    escape_log(&entry.message)
                );
            }
            Frame::Empty => trace!("Frame without a recognised payload"),
        }
    }

    fn merge(&mut self, update: NodeUpdate, live: bool, out: &mut Vec<Action>) {
        let num = update.num();
        let outcome = self.registry.apply(update);
        match outcome {
            MergeOutcome::Stale => self.metrics.inc_stale_node_updates(),
            MergeOutcome::Unknown => self.metrics.inc_unknown_node_updates(),
            _ => {}
        }
        if live && outcome.changed() {
            if let Some(rec) = self.registry.get(num) {
                out.push(Action::Emit(HostEvent::NodeUpdated(rec.clone())));
            }
        }
    }

    fn apply_packet(&mut self, pkt: AppPacket, live: bool, out: &mut Vec<Action>) {
        self.merge(pkt.node_update(), live, out);
        match &pkt.kind {
            PacketKind::Text(text) => self.record_inbound(&pkt, text, live, out),
            PacketKind::Routing(report) if report.is_success() => {
                debug!("Delivery confirmed for id {}", report.request_id);
            }
            PacketKind::Routing(report) => {
                warn!(
                    "Routing error for id {}: {}",
                    report.request_id,
                    report.reason_name()
                );
            }
            PacketKind::Admin(payload) => {
                debug!(
                    "Admin packet from 0x{:08x}: {}",
                    pkt.from,
                    hex_snippet(payload, 16)
                );
            }
            PacketKind::NodeInfo(_) | PacketKind::Position(_) => {}
            PacketKind::Unclassified(raw) => {
                trace!("Unclassified packet id={} from 0x{:08x}", raw.id, raw.from);
            }
        }
    }

    fn record_inbound(&mut self, pkt: &AppPacket, text: &str, live: bool, out: &mut Vec<Action>) {
        let (from_long_name, from_short_name) = self.registry.names_for(pkt.from);
        let (to_long_name, to_short_name) = if pkt.is_broadcast() {
            ("Broadcast".to_string(), "BC".to_string())
        } else {
            self.registry.names_for(pkt.to)
        };
        info!(
            "Message from {} ({}): {}",
            escape_log(&from_long_name),
            escape_log(&from_short_name),
            escape_log(text)
        );
        self.ledger.append(MessageRecord {
            message_id: pkt.id,
            timestamp: if pkt.rx_time != 0 {
                pkt.rx_time
            } else {
                now_secs()
            },
            from: pkt.from,
            to: pkt.to,
            from_long_name: from_long_name.clone(),
            from_short_name: from_short_name.clone(),
            to_long_name,
            to_short_name,
            payload: text.to_string(),
            direction: Direction::Inbound,
            acked: pkt.want_response,
        });
        self.metrics.inc_messages_in();
        if live {
            out.push(Action::Emit(HostEvent::MessageReceived {
                id: pkt.id,
                from: pkt.from,
                from_long_name,
                from_short_name,
                text: text.to_string(),
            }));
        }
    }

    fn on_handshake_complete(&mut self, token: u32, out: &mut Vec<Action>) {
        let expected = self.current.as_ref().and_then(|c| c.token);
        if self.state != LinkState::HandshakeSync || expected != Some(token) {
            debug!(
                "Ignoring config_complete 0x{:08x} in state {} (expecting {:?})",
                token, self.state, expected
            );
            return;
        }
        if let Some(cur) = self.current.as_mut() {
            cur.from_retry = false;
        }
        info!("Config sync complete, {} nodes known", self.registry.len());
        self.set_last_error(None, out);
        self.set_state(LinkState::Ready, out);
    }

    fn on_send(&mut self, ticket: SendTicket, text: String, out: &mut Vec<Action>) {
        if text.is_empty() {
            out.push(Action::CompleteSend {
                ticket,
                result: Err(SendError::EmptyMessage),
            });
            return;
        }
        let session = match self.live_session() {
            Some(session) if self.state == LinkState::Ready => session,
            _ => {
                debug!("Send rejected in state {}", self.state);
                self.best_effort_reconnect(out);
                out.push(Action::CompleteSend {
                    ticket,
                    result: Err(SendError::NotReady),
                });
                return;
            }
        };
        let payload = MeshCodec::encode_text_packet(&text, BROADCAST_NODE_ID, self.config.channel);
        let record = self.outbound_record(text);
        out.push(Action::Write {
            session,
            payload,
            purpose: WritePurpose::Text { ticket, record },
        });
    }

    fn outbound_record(&self, text: String) -> MessageRecord {
        let (from_long_name, from_short_name) = match self.registry.self_record() {
            Some(rec) => rec.display_names(),
            None => (
                self.current
                    .as_ref()
                    .map(|c| c.device.name.clone())
                    .unwrap_or_else(|| "Unknown".to_string()),
                "???".to_string(),
            ),
        };
        MessageRecord {
            message_id: 0,
            timestamp: now_secs(),
            from: self.registry.self_id().unwrap_or(0),
            to: BROADCAST_NODE_ID,
            from_long_name,
            from_short_name,
            to_long_name: "Broadcast".to_string(),
            to_short_name: "BC".to_string(),
            payload: text,
            direction: Direction::Outbound,
            acked: false,
        }
    }

    fn best_effort_reconnect(&mut self, out: &mut Vec<Action>) {
        if !matches!(self.state, LinkState::Idle | LinkState::Scanning) {
            return;
        }
        let target = [&self.config.preferred_device, &self.last_connected]
            .into_iter()
            .flatten()
            .find_map(|id| self.discovered.iter().find(|d| &d.id == id))
            .map(|d| d.id.clone());
        match target {
            Some(device) => {
                info!("Not connected, reconnecting to {}", device);
                self.connect_to(device, out);
            }
            None if self.state == LinkState::Idle && self.powered => {
                info!("Not connected and no remembered device in range, scanning");
                self.start_scanning(out);
            }
            None => debug!("No remembered device in range"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protobuf::meshtastic_generated as proto;
    use prost::Message;
    use proto::from_radio::PayloadVariant as FRPayload;

    const DEV: &str = "C4:DE:E2:00:00:01";

    fn device() -> DeviceHandle {
        DeviceHandle::new(DEV, "Meshtastic_0001", -61)
    }

    fn machine_with(config: SupervisorConfig) -> SessionMachine {
        SessionMachine::new(config, Arc::new(LinkMetrics::new()), true)
    }

    fn machine() -> SessionMachine {
        machine_with(SupervisorConfig::default())
    }

    fn frame(variant: FRPayload) -> Bytes {
        Bytes::from(
            proto::FromRadio {
                id: 0,
                payload_variant: Some(variant),
            }
            .encode_to_vec(),
        )
    }

    fn node_info(num: u32, long_name: &str, last_heard: u32) -> Bytes {
        frame(FRPayload::NodeInfo(proto::NodeInfo {
            num,
            user: Some(proto::User {
                id: format!("!{:08x}", num),
                long_name: long_name.into(),
                short_name: "N".into(),
                ..Default::default()
            }),
            last_heard,
            ..Default::default()
        }))
    }

    fn text_packet(from: u32, id: u32, text: &str) -> Bytes {
        frame(FRPayload::Packet(proto::MeshPacket {
            from,
            to: BROADCAST_NODE_ID,
            id,
            rx_time: 1_000,
            payload_variant: Some(proto::mesh_packet::PayloadVariant::Decoded(proto::Data {
                portnum: proto::PortNum::TextMessageApp as i32,
                payload: Bytes::copy_from_slice(text.as_bytes()),
                ..Default::default()
            })),
            ..Default::default()
        }))
    }

    fn states(actions: &[Action]) -> Vec<LinkState> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Emit(HostEvent::ConnectionStateChanged(s)) => Some(*s),
                _ => None,
            })
            .collect()
    }

    fn pulls(actions: &[Action]) -> usize {
        actions
            .iter()
            .filter(|a| matches!(a, Action::Pull { .. }))
            .count()
    }

    fn handshake_token(actions: &[Action]) -> Option<u32> {
        actions.iter().find_map(|a| match a {
            Action::Write {
                payload,
                purpose: WritePurpose::Handshake,
                ..
            } => match proto::ToRadio::decode(payload.clone()).ok()?.payload_variant {
                Some(proto::to_radio::PayloadVariant::WantConfigId(t)) => Some(t),
                _ => None,
            },
            _ => None,
        })
    }

    fn connect_session(actions: &[Action]) -> Option<SessionId> {
        actions.iter().find_map(|a| match a {
            Action::Connect { session, .. } => Some(*session),
            _ => None,
        })
    }

    /// Drive a fresh machine up to the point the handshake write is issued.
    fn to_handshake(m: &mut SessionMachine) -> (SessionId, u32) {
        m.handle(Input::StartScanning);
        m.handle(Input::Discovered(device()));
        let acts = m.handle(Input::ConnectTo(DEV.into()));
        let session = connect_session(&acts).unwrap();
        m.handle(Input::Connected {
            session,
            device: DEV.into(),
            result: Ok(()),
        });
        let acts = m.handle(Input::ChannelsOpened {
            session,
            result: Ok(()),
        });
        (session, handshake_token(&acts).unwrap())
    }

    /// Drive a fresh machine to `Ready` with an empty bootstrap.
    fn to_ready(m: &mut SessionMachine) -> SessionId {
        let (session, token) = to_handshake(m);
        m.handle(Input::WriteFinished {
            session,
            purpose: WritePurpose::Handshake,
            result: Ok(()),
        });
        m.handle(Input::Pulled {
            session,
            result: Ok(frame(FRPayload::ConfigCompleteId(token))),
        });
        m.handle(Input::Pulled {
            session,
            result: Ok(Bytes::new()),
        });
        assert_eq!(m.state(), LinkState::Ready);
        session
    }

    #[test]
    fn scanning_requires_powered_radio() {
        let mut m = SessionMachine::new(
            SupervisorConfig::default(),
            Arc::new(LinkMetrics::new()),
            false,
        );
        assert!(m.handle(Input::StartScanning).is_empty());
        assert_eq!(m.state(), LinkState::Idle);

        m.handle(Input::PowerChanged(true));
        let acts = m.handle(Input::StartScanning);
        assert!(acts.contains(&Action::StartScan));
        assert_eq!(states(&acts), vec![LinkState::Scanning]);
    }

    #[test]
    fn connect_walks_through_discovery_and_handshake() {
        let mut m = machine();
        m.handle(Input::StartScanning);
        m.handle(Input::Discovered(device()));
        assert_eq!(m.discovered().len(), 1);

        let acts = m.handle(Input::ConnectTo(DEV.into()));
        assert!(acts.contains(&Action::StopScan));
        assert_eq!(states(&acts), vec![LinkState::Connecting]);
        assert!(m.discovered().is_empty());
        let session = connect_session(&acts).unwrap();

        let acts = m.handle(Input::Connected {
            session,
            device: DEV.into(),
            result: Ok(()),
        });
        assert_eq!(states(&acts), vec![LinkState::AttributeDiscovery]);
        assert!(acts.contains(&Action::OpenChannels {
            session,
            device: DEV.into()
        }));

        let acts = m.handle(Input::ChannelsOpened {
            session,
            result: Ok(()),
        });
        assert_eq!(states(&acts), vec![LinkState::HandshakeSync]);
        let token = handshake_token(&acts).unwrap();
        assert_ne!(token, 0);
        assert_eq!(pulls(&acts), 0);

        // No pull until the handshake write lands.
        assert!(m.handle(Input::Doorbell).is_empty());
        let acts = m.handle(Input::WriteFinished {
            session,
            purpose: WritePurpose::Handshake,
            result: Ok(()),
        });
        assert_eq!(pulls(&acts), 1);
        assert_eq!(m.session().unwrap().token, Some(token));
    }

    #[test]
    fn bootstrap_frames_apply_silently() {
        let mut m = machine();
        let (session, token) = to_handshake(&mut m);
        m.handle(Input::WriteFinished {
            session,
            purpose: WritePurpose::Handshake,
            result: Ok(()),
        });

        let info = frame(FRPayload::MyInfo(proto::MyNodeInfo {
            my_node_num: 0x10,
            ..Default::default()
        }));
        for bytes in [info, node_info(0x10, "Home", 50), text_packet(0x10, 9, "old")] {
            let acts = m.handle(Input::Pulled {
                session,
                result: Ok(bytes),
            });
            assert_eq!(pulls(&acts), 1);
            assert!(!acts.iter().any(|a| matches!(a, Action::Emit(_))));
        }
        assert_eq!(m.registry().self_record().unwrap().long_name(), "Home");
        assert_eq!(m.ledger().len(), 1);

        let acts = m.handle(Input::Pulled {
            session,
            result: Ok(frame(FRPayload::ConfigCompleteId(token))),
        });
        assert_eq!(states(&acts), vec![LinkState::Ready]);
        assert_eq!(pulls(&acts), 1);

        let acts = m.handle(Input::Pulled {
            session,
            result: Ok(node_info(0x20, "Peer", 60)),
        });
        assert!(acts.iter().any(
            |a| matches!(a, Action::Emit(HostEvent::NodeUpdated(rec)) if rec.num == 0x20)
        ));
    }

    #[test]
    fn mismatched_completion_token_is_ignored() {
        let mut m = machine();
        let (session, token) = to_handshake(&mut m);
        m.handle(Input::WriteFinished {
            session,
            purpose: WritePurpose::Handshake,
            result: Ok(()),
        });
        m.handle(Input::Pulled {
            session,
            result: Ok(frame(FRPayload::ConfigCompleteId(token.wrapping_add(1)))),
        });
        assert_eq!(m.state(), LinkState::HandshakeSync);
    }

    #[test]
    fn drain_stops_on_empty_and_coalesces_doorbells() {
        let mut m = machine();
        let session = to_ready(&mut m);

        let acts = m.handle(Input::Doorbell);
        assert_eq!(pulls(&acts), 1);
        // Rings while the pull is in flight are remembered, not issued.
        assert!(m.handle(Input::Doorbell).is_empty());
        assert!(m.handle(Input::Doorbell).is_empty());

        let acts = m.handle(Input::Pulled {
            session,
            result: Ok(text_packet(5, 1, "a")),
        });
        assert_eq!(pulls(&acts), 1);
        let acts = m.handle(Input::Pulled {
            session,
            result: Ok(Bytes::new()),
        });
        assert_eq!(pulls(&acts), 0);
        assert!(m.handle(Input::Doorbell).len() == 1);
        assert!(m.handle(Input::Doorbell).is_empty());
        let acts = m.handle(Input::Pulled {
            session,
            result: Ok(Bytes::new()),
        });
        assert_eq!(pulls(&acts), 1, "doorbell during the pull earns one more");
        let acts = m.handle(Input::Pulled {
            session,
            result: Ok(Bytes::new()),
        });
        assert_eq!(pulls(&acts), 0);
    }

    #[test]
    fn malformed_frames_are_counted_and_dropped() {
        let metrics = Arc::new(LinkMetrics::new());
        let mut m = SessionMachine::new(SupervisorConfig::default(), metrics.clone(), true);
        let session = to_ready(&mut m);
        m.handle(Input::Doorbell);
        let acts = m.handle(Input::Pulled {
            session,
            result: Ok(Bytes::from_static(&[0x12, 0x05, 0x01])),
        });
        assert_eq!(pulls(&acts), 1);
        assert_eq!(m.state(), LinkState::Ready);
        assert!(m.registry().is_empty());
        assert!(m.ledger().is_empty());
        assert_eq!(metrics.snapshot().decode_errors, 1);
    }

    #[test]
    fn inbound_text_emits_event_and_records_names() {
        let mut m = machine();
        let session = to_ready(&mut m);
        m.handle(Input::Doorbell);
        m.handle(Input::Pulled {
            session,
            result: Ok(node_info(7, "Seven", 10)),
        });
        let acts = m.handle(Input::Pulled {
            session,
            result: Ok(text_packet(7, 321, "hello")),
        });
        assert!(acts.contains(&Action::Emit(HostEvent::MessageReceived {
            id: 321,
            from: 7,
            from_long_name: "Seven".into(),
            from_short_name: "N".into(),
            text: "hello".into(),
        })));
        let rec = m.ledger().last().unwrap();
        assert_eq!(rec.direction, Direction::Inbound);
        assert_eq!(rec.to_short_name, "BC");
        assert_eq!(rec.timestamp, 1_000);
    }

    #[test]
    fn timeout_schedules_one_retry_to_same_device() {
        let mut m = machine();
        let old = to_ready(&mut m);
        let acts = m.handle(Input::LinkLost {
            device: DEV.into(),
            error: Some(LinkError::Timeout),
        });
        assert_eq!(states(&acts), vec![LinkState::Reconnecting]);
        let ticket = acts
            .iter()
            .find_map(|a| match a {
                Action::ScheduleReconnect { ticket, delay } => {
                    assert_eq!(*delay, Duration::from_millis(1000));
                    Some(*ticket)
                }
                _ => None,
            })
            .unwrap();
        assert!(m.registry().self_id().is_none());

        // The platform's own disconnect callback is ignored while waiting.
        assert!(m
            .handle(Input::LinkLost {
                device: DEV.into(),
                error: None
            })
            .is_empty());

        let acts = m.handle(Input::ReconnectDue(ticket));
        assert_eq!(states(&acts), vec![LinkState::Connecting]);
        let session = connect_session(&acts).unwrap();
        assert_ne!(session, old);
        assert!(acts.contains(&Action::Connect {
            session,
            device: DEV.into()
        }));
        assert!(m.handle(Input::ReconnectDue(ticket)).is_empty());
    }

    #[test]
    fn retry_that_times_out_gives_up() {
        let mut m = machine();
        to_ready(&mut m);
        let acts = m.handle(Input::LinkLost {
            device: DEV.into(),
            error: Some(LinkError::Timeout),
        });
        let ticket = acts
            .iter()
            .find_map(|a| match a {
                Action::ScheduleReconnect { ticket, .. } => Some(*ticket),
                _ => None,
            })
            .unwrap();
        let acts = m.handle(Input::ReconnectDue(ticket));
        let session = connect_session(&acts).unwrap();
        let acts = m.handle(Input::Connected {
            session,
            device: DEV.into(),
            result: Err(LinkError::Timeout),
        });
        assert_eq!(states(&acts), vec![LinkState::Idle]);
        assert!(!acts
            .iter()
            .any(|a| matches!(a, Action::ScheduleReconnect { .. })));
        assert!(m.last_error().unwrap().contains("timed out"));
    }

    #[test]
    fn disconnect_during_reconnecting_cancels_retry() {
        let mut m = machine();
        to_ready(&mut m);
        m.handle(Input::LinkLost {
            device: DEV.into(),
            error: Some(LinkError::Timeout),
        });
        let acts = m.handle(Input::DisconnectDevice);
        assert!(acts.contains(&Action::CancelReconnect));
        assert_eq!(states(&acts), vec![LinkState::Idle]);
        assert!(m.session().is_none());
        // Idempotent.
        assert!(m.handle(Input::DisconnectDevice).is_empty());
    }

    fn scheduled_retry(actions: &[Action]) -> Option<ReconnectTicket> {
        actions.iter().find_map(|a| match a {
            Action::ScheduleReconnect { ticket, .. } => Some(*ticket),
            _ => None,
        })
    }

    #[test]
    fn selecting_another_device_cancels_pending_retry() {
        const OTHER: &str = "C4:DE:E2:00:00:02";
        let mut m = machine();
        to_ready(&mut m);
        let acts = m.handle(Input::LinkLost {
            device: DEV.into(),
            error: Some(LinkError::Timeout),
        });
        let ticket = scheduled_retry(&acts).unwrap();

        let acts = m.handle(Input::StartScanning);
        assert_eq!(states(&acts), vec![LinkState::Scanning]);
        assert!(!acts.contains(&Action::CancelReconnect));
        m.handle(Input::Discovered(DeviceHandle::new(OTHER, "Meshtastic_0002", -70)));

        let acts = m.handle(Input::ConnectTo(OTHER.into()));
        assert!(acts.contains(&Action::CancelReconnect));
        let session = connect_session(&acts).unwrap();
        assert!(acts.contains(&Action::Connect {
            session,
            device: OTHER.into()
        }));
        assert_eq!(states(&acts), vec![LinkState::Connecting]);

        assert!(m.handle(Input::ReconnectDue(ticket)).is_empty());
        assert_eq!(m.session().unwrap().device.id, DeviceId::from(OTHER));
    }

    #[test]
    fn retry_survives_a_scan_without_selection() {
        let mut m = machine();
        to_ready(&mut m);
        let acts = m.handle(Input::LinkLost {
            device: DEV.into(),
            error: Some(LinkError::Timeout),
        });
        let ticket = scheduled_retry(&acts).unwrap();

        m.handle(Input::StartScanning);
        let acts = m.handle(Input::StopScanning);
        assert_eq!(states(&acts), vec![LinkState::Reconnecting]);

        m.handle(Input::StartScanning);
        let acts = m.handle(Input::ReconnectDue(ticket));
        assert!(acts.contains(&Action::StopScan));
        assert_eq!(states(&acts), vec![LinkState::Connecting]);
        let session = connect_session(&acts).unwrap();
        assert!(acts.contains(&Action::Connect {
            session,
            device: DEV.into()
        }));
    }

    #[test]
    fn retry_timer_waits_for_old_link_to_close() {
        let mut m = machine();
        let session = to_ready(&mut m);
        assert_eq!(pulls(&m.handle(Input::Doorbell)), 1);

        let acts = m.handle(Input::Pulled {
            session,
            result: Err(LinkError::Timeout),
        });
        assert_eq!(states(&acts), vec![LinkState::Reconnecting]);
        assert!(acts.contains(&Action::Disconnect { device: DEV.into() }));
        assert!(scheduled_retry(&acts).is_none());

        // The platform callback for our own teardown changes nothing.
        assert!(m
            .handle(Input::LinkLost {
                device: DEV.into(),
                error: None
            })
            .is_empty());
        assert_eq!(m.state(), LinkState::Reconnecting);

        let acts = m.handle(Input::DisconnectFinished { device: DEV.into() });
        assert_eq!(
            acts,
            vec![Action::ScheduleReconnect {
                ticket: scheduled_retry(&acts).unwrap(),
                delay: Duration::from_millis(1000)
            }]
        );
        let ticket = scheduled_retry(&acts).unwrap();
        assert!(m
            .handle(Input::DisconnectFinished { device: DEV.into() })
            .is_empty());

        let acts = m.handle(Input::ReconnectDue(ticket));
        assert_eq!(states(&acts), vec![LinkState::Connecting]);
        assert_ne!(connect_session(&acts).unwrap(), session);
    }

    #[test]
    fn peer_disconnect_goes_idle_without_retry() {
        let mut m = machine();
        to_ready(&mut m);
        let acts = m.handle(Input::LinkLost {
            device: DEV.into(),
            error: Some(LinkError::PeerDisconnected),
        });
        assert_eq!(states(&acts), vec![LinkState::Idle]);
        assert_eq!(acts.len(), 1);
        assert!(m.session().is_none());
    }

    #[test]
    fn rescan_after_link_loss_when_enabled() {
        let mut m = machine_with(SupervisorConfig {
            rescan_after_link_loss: true,
            ..SupervisorConfig::default()
        });
        to_ready(&mut m);
        let acts = m.handle(Input::LinkLost {
            device: DEV.into(),
            error: None,
        });
        assert_eq!(states(&acts), vec![LinkState::Idle, LinkState::Scanning]);
        assert!(acts.contains(&Action::StartScan));
    }

    #[test]
    fn pairing_failure_sets_sticky_error_until_ready() {
        let mut m = machine();
        to_ready(&mut m);
        let acts = m.handle(Input::LinkLost {
            device: DEV.into(),
            error: Some(LinkError::PairingFailure("Peer removed pairing information".into())),
        });
        assert_eq!(states(&acts), vec![LinkState::Idle]);
        let msg = m.last_error().unwrap().to_string();
        assert!(msg.contains("pair again"));
        assert!(acts.contains(&Action::Emit(HostEvent::LastErrorChanged(Some(msg)))));

        // Still set through the next attempt, cleared once it is ready.
        to_ready(&mut m);
        assert!(m.last_error().is_none());
    }

    #[test]
    fn missing_characteristic_is_reported() {
        let mut m = machine();
        m.handle(Input::StartScanning);
        m.handle(Input::Discovered(device()));
        let session = connect_session(&m.handle(Input::ConnectTo(DEV.into()))).unwrap();
        m.handle(Input::Connected {
            session,
            device: DEV.into(),
            result: Ok(()),
        });
        let acts = m.handle(Input::ChannelsOpened {
            session,
            result: Err(LinkError::MissingCharacteristic(crate::transport::FROMNUM_UUID)),
        });
        assert!(acts.contains(&Action::Disconnect { device: DEV.into() }));
        assert_eq!(m.state(), LinkState::Idle);
        assert!(m.last_error().unwrap().contains("not a Meshtastic radio"));
    }

    #[test]
    fn results_of_retired_sessions_are_discarded() {
        let metrics = Arc::new(LinkMetrics::new());
        let mut m = SessionMachine::new(SupervisorConfig::default(), metrics.clone(), true);
        let session = to_ready(&mut m);
        m.handle(Input::Doorbell);

        let acts = m.handle(Input::DisconnectDevice);
        assert_eq!(states(&acts), vec![LinkState::Disconnecting]);
        assert!(acts.contains(&Action::Disconnect { device: DEV.into() }));

        let acts = m.handle(Input::Pulled {
            session,
            result: Ok(node_info(99, "late", 5)),
        });
        assert!(acts.is_empty());
        assert!(!m.registry().contains(99));

        let record = m.outbound_record("late".into());
        let acts = m.handle(Input::WriteFinished {
            session,
            purpose: WritePurpose::Text {
                ticket: SendTicket(4),
                record,
            },
            result: Ok(()),
        });
        assert_eq!(
            acts,
            vec![Action::CompleteSend {
                ticket: SendTicket(4),
                result: Err(SendError::SessionEnded)
            }]
        );
        assert!(m.ledger().is_empty());
        assert_eq!(metrics.snapshot().discarded_results, 2);

        let acts = m.handle(Input::DisconnectFinished { device: DEV.into() });
        assert_eq!(states(&acts), vec![LinkState::Idle]);
        // The link's own callback after the fact changes nothing.
        assert!(m
            .handle(Input::LinkLost {
                device: DEV.into(),
                error: None
            })
            .is_empty());
    }

    #[test]
    fn connect_to_while_ready_tears_down_first() {
        let mut m = machine();
        let old = to_ready(&mut m);
        m.handle(Input::StopScanning);
        let acts = m.handle(Input::ConnectTo(DEV.into()));
        assert_eq!(states(&acts), vec![LinkState::Disconnecting]);
        let acts = m.handle(Input::LinkLost {
            device: DEV.into(),
            error: None,
        });
        assert_eq!(states(&acts), vec![LinkState::Connecting]);
        assert_ne!(connect_session(&acts).unwrap(), old);
        assert!(m
            .handle(Input::DisconnectFinished { device: DEV.into() })
            .is_empty());
    }

    #[test]
    fn empty_send_fails_without_side_effects() {
        let mut m = machine();
        to_ready(&mut m);
        let acts = m.handle(Input::Send {
            ticket: SendTicket(1),
            text: String::new(),
        });
        assert_eq!(
            acts,
            vec![Action::CompleteSend {
                ticket: SendTicket(1),
                result: Err(SendError::EmptyMessage)
            }]
        );
        assert!(m.ledger().is_empty());
    }

    #[test]
    fn whitespace_send_is_a_real_message() {
        let mut m = machine();
        let session = to_ready(&mut m);
        let acts = m.handle(Input::Send {
            ticket: SendTicket(3),
            text: " ".into(),
        });
        let [Action::Write {
            session: s,
            purpose: WritePurpose::Text { record, .. },
            ..
        }] = acts.as_slice()
        else {
            panic!("expected one text write, got {:?}", acts);
        };
        assert_eq!(*s, session);
        assert_eq!(record.payload, " ");
    }

    #[test]
    fn ready_send_writes_then_records() {
        let mut m = machine();
        let session = to_ready(&mut m);
        let acts = m.handle(Input::Send {
            ticket: SendTicket(2),
            text: "hi all".into(),
        });
        let [Action::Write {
            session: s,
            purpose,
            payload,
        }] = acts.as_slice()
        else {
            panic!("expected one write, got {:?}", acts);
        };
        assert_eq!(*s, session);
        assert!(!payload.is_empty());
        assert!(m.ledger().is_empty());

        let acts = m.handle(Input::WriteFinished {
            session,
            purpose: purpose.clone(),
            result: Ok(()),
        });
        assert_eq!(
            acts,
            vec![Action::CompleteSend {
                ticket: SendTicket(2),
                result: Ok(())
            }]
        );
        let rec = m.ledger().last().unwrap();
        assert_eq!(rec.direction, Direction::Outbound);
        assert_eq!(rec.message_id, 0);
        assert!(!rec.acked);
        assert_eq!(rec.to, BROADCAST_NODE_ID);
        assert_eq!(rec.from_long_name, "Meshtastic_0001");
    }

    #[test]
    fn send_while_idle_reconnects_once() {
        let mut m = machine_with(SupervisorConfig {
            preferred_device: Some(DEV.into()),
            ..SupervisorConfig::default()
        });
        m.handle(Input::StartScanning);
        m.handle(Input::Discovered(device()));

        let acts = m.handle(Input::Send {
            ticket: SendTicket(1),
            text: "hello".into(),
        });
        assert!(acts.contains(&Action::CompleteSend {
            ticket: SendTicket(1),
            result: Err(SendError::NotReady)
        }));
        assert!(connect_session(&acts).is_some());
        assert_eq!(m.state(), LinkState::Connecting);

        let acts = m.handle(Input::Send {
            ticket: SendTicket(2),
            text: "hello".into(),
        });
        assert_eq!(
            acts,
            vec![Action::CompleteSend {
                ticket: SendTicket(2),
                result: Err(SendError::NotReady)
            }]
        );
        assert!(m.ledger().is_empty());
    }

    #[test]
    fn send_while_idle_without_known_device_scans() {
        let mut m = machine();
        let acts = m.handle(Input::Send {
            ticket: SendTicket(1),
            text: "x".into(),
        });
        assert!(acts.contains(&Action::StartScan));
        assert_eq!(m.state(), LinkState::Scanning);
    }

    #[test]
    fn reboot_restarts_the_handshake() {
        let mut m = machine();
        let session = to_ready(&mut m);
        m.handle(Input::Doorbell);
        let acts = m.handle(Input::Pulled {
            session,
            result: Ok(frame(FRPayload::Rebooted(true))),
        });
        assert_eq!(states(&acts), vec![LinkState::HandshakeSync]);
        let token = handshake_token(&acts).unwrap();
        assert_eq!(m.session().unwrap().token, Some(token));
        // Drain pauses until the new request is written.
        assert_eq!(pulls(&acts), 0);
        let acts = m.handle(Input::WriteFinished {
            session,
            purpose: WritePurpose::Handshake,
            result: Ok(()),
        });
        assert_eq!(pulls(&acts), 1);
    }

    #[test]
    fn disconnect_for_other_device_is_ignored() {
        let mut m = machine();
        to_ready(&mut m);
        assert!(m
            .handle(Input::LinkLost {
                device: "11:22".into(),
                error: None
            })
            .is_empty());
        assert_eq!(m.state(), LinkState::Ready);
    }
}
