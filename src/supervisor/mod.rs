//! # Connection supervisor
//!
//! Owns the single radio session. [`SessionMachine`] decides; the
//! [`ConnectionSupervisor`] run loop executes its [`Action`]s on the
//! [`FrameTransport`] and feeds every completion back in as an [`Input`]. Link
//! events, host commands and completions are consumed by that one loop, so state
//! transitions never run concurrently.
//!
//! The machine sits behind one mutex shared with [`SupervisorHandle`], which
//! reads snapshots directly and sends every mutating request over the control
//! channel.
//!
//! ```rust,no_run
//! use meshlink::config::SupervisorConfig;
//! use meshlink::supervisor::{ConnectionSupervisor, LinkState};
//! use meshlink::transport::{DeviceHandle, ReplayLink};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let (link, events) = ReplayLink::new(DeviceHandle::new("AA:BB", "Meshtastic_aabb", -50));
//!     link.set_powered(true);
//!     let (supervisor, handle) = ConnectionSupervisor::new(link, events, SupervisorConfig::default());
//!     let task = supervisor.spawn();
//!
//!     handle.start_scanning();
//!     while handle.discovered().is_empty() {
//!         tokio::time::sleep(std::time::Duration::from_millis(10)).await;
//!     }
//!     handle.connect_to("AA:BB".into());
//!     handle.wait_for_state(LinkState::Ready).await;
//!     handle.send("hello mesh").await;
//!
//!     handle.shutdown();
//!     task.await??;
//!     Ok(())
//! }
//! ```

mod machine;

pub use machine::{
    Action, HostEvent, Input, LinkState, ReconnectTicket, SendError, SendTicket, Session,
    SessionId, SessionMachine, WritePurpose,
};

use crate::config::SupervisorConfig;
use crate::ledger::{LedgerStats, MessageRecord};
use crate::metrics::{LinkMetrics, Snapshot};
use crate::registry::NodeRecord;
use crate::transport::{DeviceHandle, DeviceId, FrameTransport, LinkEvent, RadioLink};
use anyhow::Result;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

const EVENT_CAPACITY: usize = 256;

type SendReply = oneshot::Sender<Result<(), SendError>>;

enum Command {
    Host(Input),
    Send { text: String, reply: SendReply },
    Shutdown,
}

struct Shared {
    machine: Mutex<SessionMachine>,
    metrics: Arc<LinkMetrics>,
    events: broadcast::Sender<HostEvent>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, SessionMachine> {
        self.machine.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Host-facing API. Cheap to clone.
#[derive(Clone)]
pub struct SupervisorHandle {
    control: mpsc::UnboundedSender<Command>,
    shared: Arc<Shared>,
}

impl SupervisorHandle {
    fn command(&self, input: Input) {
        if self.control.send(Command::Host(input)).is_err() {
            debug!("Supervisor stopped; command dropped");
        }
    }

    pub fn start_scanning(&self) {
        self.command(Input::StartScanning);
    }

    pub fn stop_scanning(&self) {
        self.command(Input::StopScanning);
    }

    pub fn connect_to(&self, device: DeviceId) {
        self.command(Input::ConnectTo(device));
    }

    pub fn disconnect_device(&self) {
        self.command(Input::DisconnectDevice);
    }

    /// Broadcast `text` on the current session.
    ///
    /// Fails immediately when no session is ready (after kicking off at most one
    /// reconnect attempt) or when `text` is empty. Nothing is queued for later.
    pub async fn try_send(&self, text: impl Into<String>) -> Result<(), SendError> {
        let (reply, rx) = oneshot::channel();
        let cmd = Command::Send {
            text: text.into(),
            reply,
        };
        if self.control.send(cmd).is_err() {
            return Err(SendError::SessionEnded);
        }
        rx.await.unwrap_or(Err(SendError::SessionEnded))
    }

    pub async fn send(&self, text: impl Into<String>) -> bool {
        match self.try_send(text).await {
            Ok(()) => true,
            Err(e) => {
                debug!("Send failed: {}", e);
                false
            }
        }
    }

    pub fn state(&self) -> LinkState {
        self.shared.lock().state()
    }

    pub fn session(&self) -> Option<Session> {
        self.shared.lock().session()
    }

    pub fn nodes(&self) -> Vec<NodeRecord> {
        self.shared.lock().registry().snapshot()
    }

    pub fn self_node(&self) -> Option<NodeRecord> {
        self.shared.lock().registry().self_record().cloned()
    }

    pub fn messages(&self) -> Vec<MessageRecord> {
        self.shared.lock().ledger().snapshot()
    }

    pub fn message_stats(&self) -> LedgerStats {
        self.shared.lock().ledger().stats()
    }

    pub fn discovered(&self) -> Vec<DeviceHandle> {
        self.shared.lock().discovered().to_vec()
    }

    pub fn last_error(&self) -> Option<String> {
        self.shared.lock().last_error().map(str::to_string)
    }

    pub fn metrics(&self) -> Snapshot {
        self.shared.metrics.snapshot()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
        self.shared.events.subscribe()
    }

    /// Resolve once the session reaches `target`; false if the supervisor stops first.
    pub async fn wait_for_state(&self, target: LinkState) -> bool {
        let mut events = self.subscribe();
        if self.state() == target {
            return true;
        }
        loop {
            match events.recv().await {
                Ok(HostEvent::ConnectionStateChanged(s)) if s == target => return true,
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    if self.state() == target {
                        return true;
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return false,
            }
        }
    }

    pub fn shutdown(&self) {
        let _ = self.control.send(Command::Shutdown);
    }
}

pub struct ConnectionSupervisor<L: RadioLink> {
    transport: FrameTransport<L>,
    shared: Arc<Shared>,
    control_rx: mpsc::UnboundedReceiver<Command>,
    link_events: mpsc::UnboundedReceiver<LinkEvent>,
    input_tx: mpsc::UnboundedSender<Input>,
    input_rx: mpsc::UnboundedReceiver<Input>,
    pending_sends: HashMap<SendTicket, SendReply>,
    next_ticket: u64,
    reconnect_timer: Option<JoinHandle<()>>,
}

impl<L: RadioLink> ConnectionSupervisor<L> {
    pub fn new(
        link: Arc<L>,
        link_events: mpsc::UnboundedReceiver<LinkEvent>,
        config: SupervisorConfig,
    ) -> (Self, SupervisorHandle) {
        let metrics = Arc::new(LinkMetrics::new());
        let powered = link.is_powered_on();
        let transport = FrameTransport::new(link, config.op_timeout);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let shared = Arc::new(Shared {
            machine: Mutex::new(SessionMachine::new(config, metrics.clone(), powered)),
            metrics,
            events,
        });
        let (control, control_rx) = mpsc::unbounded_channel();
        let (input_tx, input_rx) = mpsc::unbounded_channel();

        let handle = SupervisorHandle {
            control,
            shared: shared.clone(),
        };
        let supervisor = ConnectionSupervisor {
            transport,
            shared,
            control_rx,
            link_events,
            input_tx,
            input_rx,
            pending_sends: HashMap::new(),
            next_ticket: 1,
            reconnect_timer: None,
        };
        (supervisor, handle)
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    /// Run until shut down or every handle is dropped.
    pub async fn run(mut self) -> Result<()> {
        info!("Starting connection supervisor");

        loop {
            // Link events first: a disconnect callback is delivered before the
            // completion of the operation that caused it.
            tokio::select! {
                biased;

                event = self.link_events.recv() => match event {
                    Some(event) => self.dispatch(Input::from(event)),
                    None => {
                        warn!("Link event channel closed, shutting down supervisor");
                        break;
                    }
                },

                Some(input) = self.input_rx.recv() => self.dispatch(input),

                cmd = self.control_rx.recv() => match cmd {
                    Some(Command::Host(input)) => self.dispatch(input),
                    Some(Command::Send { text, reply }) => {
                        let ticket = SendTicket(self.next_ticket);
                        self.next_ticket += 1;
                        self.pending_sends.insert(ticket, reply);
                        self.dispatch(Input::Send { ticket, text });
                    }
                    Some(Command::Shutdown) => {
                        info!("Supervisor received shutdown signal");
                        break;
                    }
                    None => {
                        debug!("All supervisor handles dropped");
                        break;
                    }
                },
            }
        }

        self.teardown().await;
        info!("Connection supervisor shutting down");
        Ok(())
    }

    fn dispatch(&mut self, input: Input) {
        let actions = self.shared.lock().handle(input);
        for action in actions {
            self.execute(action);
        }
    }

    fn spawn_op<F, Fut>(&self, op: F)
    where
        F: FnOnce(FrameTransport<L>) -> Fut,
        Fut: Future<Output = Input> + Send + 'static,
    {
        let fut = op(self.transport.clone());
        let tx = self.input_tx.clone();
        tokio::spawn(async move {
            let _ = tx.send(fut.await);
        });
    }

    fn execute(&mut self, action: Action) {
        match action {
            Action::StartScan => {
                let transport = self.transport.clone();
                let tx = self.input_tx.clone();
                tokio::spawn(async move {
                    if let Err(e) = transport.start_scan().await {
                        let _ = tx.send(Input::ScanFailed(e));
                    }
                });
            }
            Action::StopScan => {
                let transport = self.transport.clone();
                tokio::spawn(async move { transport.stop_scan().await });
            }
            Action::Connect { session, device } => self.spawn_op(move |t| async move {
                let result = t.connect(&device).await;
                Input::Connected {
                    session,
                    device,
                    result,
                }
            }),
            Action::OpenChannels { session, device } => self.spawn_op(move |t| async move {
                let result = t.open_channels(&device).await.map(|_| ());
                Input::ChannelsOpened { session, result }
            }),
            Action::Write {
                session,
                payload,
                purpose,
            } => self.spawn_op(move |t| async move {
                let result = t.write_outbound(&payload).await;
                Input::WriteFinished {
                    session,
                    purpose,
                    result,
                }
            }),
            Action::Pull { session } => self.spawn_op(move |t| async move {
                let result = t.pull_inbound().await;
                Input::Pulled { session, result }
            }),
            Action::Disconnect { device } => self.spawn_op(move |t| async move {
                t.disconnect(&device).await;
                Input::DisconnectFinished { device }
            }),
            Action::ScheduleReconnect { ticket, delay } => {
                if let Some(old) = self.reconnect_timer.take() {
                    old.abort();
                }
                let tx = self.input_tx.clone();
                self.reconnect_timer = Some(tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(Input::ReconnectDue(ticket));
                }));
            }
            Action::CancelReconnect => {
                if let Some(timer) = self.reconnect_timer.take() {
                    timer.abort();
                }
            }
            Action::CompleteSend { ticket, result } => {
                if let Some(reply) = self.pending_sends.remove(&ticket) {
                    let _ = reply.send(result);
                }
            }
            Action::Emit(event) => {
                let _ = self.shared.events.send(event);
            }
        }
    }

    async fn teardown(&mut self) {
        if let Some(timer) = self.reconnect_timer.take() {
            timer.abort();
        }
        let device = self.shared.lock().linked_device();
        if let Some(device) = device {
            self.transport.disconnect(&device).await;
        }
        // Dropped replies resolve as `SessionEnded`.
        self.pending_sends.clear();
    }
}
