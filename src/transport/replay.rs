//! In-process loopback radio.
//!
//! `ReplayLink` behaves like a single Meshtastic peripheral: it advertises one
//! device when scanning, accepts a connection, exposes the three mesh
//! characteristics and keeps a from-radio queue. A want-config write is answered
//! the way firmware answers it: the configured bootstrap frames followed by a
//! config-complete echoing the request token. Live frames are queued by the host
//! and announced with the doorbell.
//!
//! Used by the `replay` command to run captures offline and by the tests to script
//! link behaviour (failed connects, dropped links, missing characteristics).

use super::{
    Channel, DeviceHandle, DeviceId, LinkError, LinkEvent, RadioLink, FROMNUM_UUID,
    FROMRADIO_UUID, TORADIO_UUID,
};
use crate::protobuf::meshtastic_generated as proto;
use bytes::Bytes;
use log::{debug, trace};
use prost::Message;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Debug)]
struct ReplayState {
    powered: bool,
    scanning: bool,
    connected: bool,
    characteristics: Vec<Uuid>,
    bootstrap: Vec<Bytes>,
    inbound: VecDeque<Bytes>,
    written: Vec<Bytes>,
    failing_connects: VecDeque<LinkError>,
    pulls: usize,
    connects: usize,
}

pub struct ReplayLink {
    device: DeviceHandle,
    events: mpsc::UnboundedSender<LinkEvent>,
    state: Mutex<ReplayState>,
}

impl ReplayLink {
    /// Create a powered-off link advertising `device`, plus its event stream.
    pub fn new(device: DeviceHandle) -> (Arc<Self>, mpsc::UnboundedReceiver<LinkEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let link = ReplayLink {
            device,
            events,
            state: Mutex::new(ReplayState {
                powered: false,
                scanning: false,
                connected: false,
                characteristics: vec![TORADIO_UUID, FROMRADIO_UUID, FROMNUM_UUID],
                bootstrap: Vec::new(),
                inbound: VecDeque::new(),
                written: Vec::new(),
                failing_connects: VecDeque::new(),
                pulls: 0,
                connects: 0,
            }),
        };
        (Arc::new(link), rx)
    }

    fn state(&self) -> MutexGuard<'_, ReplayState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: LinkEvent) {
        let _ = self.events.send(event);
    }

    pub fn device(&self) -> &DeviceHandle {
        &self.device
    }

    pub fn set_powered(&self, on: bool) {
        {
            let mut st = self.state();
            st.powered = on;
            if !on {
                st.scanning = false;
            }
        }
        self.emit(LinkEvent::PowerChanged(on));
    }

    /// Frames served after every want-config request, before config-complete.
    pub fn queue_bootstrap(&self, frame: impl Into<Bytes>) {
        self.state().bootstrap.push(frame.into());
    }

    /// Queue a frame without ringing the doorbell.
    pub fn push_inbound(&self, frame: impl Into<Bytes>) {
        self.state().inbound.push_back(frame.into());
    }

    pub fn ring_doorbell(&self) {
        self.emit(LinkEvent::Doorbell);
    }

    /// Drop the connection from the device side. The device queue is lost.
    pub fn drop_link(&self, error: Option<LinkError>) {
        {
            let mut st = self.state();
            st.connected = false;
            st.inbound.clear();
        }
        self.emit(LinkEvent::Disconnected {
            device: self.device.id.clone(),
            error,
        });
    }

    /// Make the next connect attempt fail with `error`.
    pub fn fail_next_connect(&self, error: LinkError) {
        self.state().failing_connects.push_back(error);
    }

    /// Replace the characteristic ids reported by discovery.
    pub fn set_characteristics(&self, ids: Vec<Uuid>) {
        self.state().characteristics = ids;
    }

    pub fn written(&self) -> Vec<Bytes> {
        self.state().written.clone()
    }

    /// Want-config tokens seen on to-radio, in order.
    pub fn handshake_tokens(&self) -> Vec<u32> {
        self.state()
            .written
            .iter()
            .filter_map(|frame| match proto::ToRadio::decode(frame.as_ref()) {
                Ok(proto::ToRadio {
                    payload_variant: Some(proto::to_radio::PayloadVariant::WantConfigId(token)),
                }) => Some(token),
                _ => None,
            })
            .collect()
    }

    pub fn pull_count(&self) -> usize {
        self.state().pulls
    }

    pub fn connect_count(&self) -> usize {
        self.state().connects
    }

    pub fn pending_inbound(&self) -> usize {
        self.state().inbound.len()
    }

    pub fn is_connected(&self) -> bool {
        self.state().connected
    }

    pub fn is_scanning(&self) -> bool {
        self.state().scanning
    }

    fn check_device(&self, device: &DeviceId) -> Result<(), LinkError> {
        if *device == self.device.id {
            Ok(())
        } else {
            Err(LinkError::UnknownDevice(device.to_string()))
        }
    }
}

impl RadioLink for ReplayLink {
    fn is_powered_on(&self) -> bool {
        self.state().powered
    }

    async fn start_scan(&self) -> Result<(), LinkError> {
        {
            let mut st = self.state();
            if !st.powered {
                return Err(LinkError::Unavailable);
            }
            st.scanning = true;
        }
        self.emit(LinkEvent::Discovered(self.device.clone()));
        Ok(())
    }

    async fn stop_scan(&self) {
        self.state().scanning = false;
    }

    async fn connect(&self, device: &DeviceId) -> Result<(), LinkError> {
        self.check_device(device)?;
        let mut st = self.state();
        if !st.powered {
            return Err(LinkError::Unavailable);
        }
        st.connects += 1;
        if let Some(err) = st.failing_connects.pop_front() {
            debug!("replay: connect #{} fails with {}", st.connects, err);
            return Err(err);
        }
        st.connected = true;
        Ok(())
    }

    async fn discover_characteristics(&self, device: &DeviceId) -> Result<Vec<Uuid>, LinkError> {
        self.check_device(device)?;
        let st = self.state();
        if !st.connected {
            return Err(LinkError::PeerDisconnected);
        }
        Ok(st.characteristics.clone())
    }

    async fn write(&self, channel: Channel, data: &[u8]) -> Result<(), LinkError> {
        let mut st = self.state();
        if !st.connected {
            return Err(LinkError::PeerDisconnected);
        }
        if channel != Channel::ToRadio {
            return Err(LinkError::Other {
                code: 3,
                description: "characteristic is not writable".into(),
            });
        }
        let frame = Bytes::copy_from_slice(data);
        if let Ok(proto::ToRadio {
            payload_variant: Some(proto::to_radio::PayloadVariant::WantConfigId(token)),
        }) = proto::ToRadio::decode(data)
        {
            trace!("replay: want_config 0x{:08x}, serving {} frames", token, st.bootstrap.len());
            let bootstrap = st.bootstrap.clone();
            st.inbound.extend(bootstrap);
            let complete = proto::FromRadio {
                id: 0,
                payload_variant: Some(proto::from_radio::PayloadVariant::ConfigCompleteId(token)),
            };
            st.inbound.push_back(Bytes::from(complete.encode_to_vec()));
        }
        st.written.push(frame);
        Ok(())
    }

    async fn read(&self, channel: Channel) -> Result<Bytes, LinkError> {
        let mut st = self.state();
        if !st.connected {
            return Err(LinkError::PeerDisconnected);
        }
        match channel {
            Channel::FromRadio => {
                st.pulls += 1;
                Ok(st.inbound.pop_front().unwrap_or_default())
            }
            _ => Ok(Bytes::new()),
        }
    }

    async fn subscribe(&self, channel: Channel) -> Result<(), LinkError> {
        if channel == Channel::FromNum {
            Ok(())
        } else {
            Err(LinkError::Other {
                code: 6,
                description: "characteristic does not notify".into(),
            })
        }
    }

    async fn disconnect(&self, device: &DeviceId) {
        let was_connected = {
            let mut st = self.state();
            std::mem::replace(&mut st.connected, false)
        };
        if was_connected && *device == self.device.id {
            self.emit(LinkEvent::Disconnected {
                device: device.clone(),
                error: None,
            });
        }
    }
}
