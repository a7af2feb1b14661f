//! Test utilities & fixtures.
//! Frame builders plus a harness running the real supervisor over a `ReplayLink`.
#![allow(dead_code)] // each test crate uses a different subset

use bytes::Bytes;
use meshlink::codec::BROADCAST_NODE_ID;
use meshlink::config::SupervisorConfig;
use meshlink::protobuf::meshtastic_generated as proto;
use meshlink::supervisor::{ConnectionSupervisor, HostEvent, LinkState, SupervisorHandle};
use meshlink::transport::{DeviceHandle, ReplayLink};
use prost::Message;
use proto::from_radio::PayloadVariant as FRPayload;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

pub const DEVICE: &str = "C4:DE:E2:11:22:33";
pub const DEVICE_NAME: &str = "Meshtastic_2233";
pub const SELF_NODE: u32 = 0x0a0b_0c0d;

const WAIT: Duration = Duration::from_secs(5);

pub fn from_radio(variant: FRPayload) -> Bytes {
    Bytes::from(
        proto::FromRadio {
            id: 0,
            payload_variant: Some(variant),
        }
        .encode_to_vec(),
    )
}

pub fn my_info(node_num: u32) -> Bytes {
    from_radio(FRPayload::MyInfo(proto::MyNodeInfo {
        my_node_num: node_num,
        ..Default::default()
    }))
}

pub fn node_info(num: u32, long_name: &str, short_name: &str, last_heard: u32) -> Bytes {
    from_radio(FRPayload::NodeInfo(proto::NodeInfo {
        num,
        user: Some(proto::User {
            id: format!("!{:08x}", num),
            long_name: long_name.into(),
            short_name: short_name.into(),
            hw_model: proto::HardwareModel::Tbeam as i32,
            ..Default::default()
        }),
        last_heard,
        snr: 6.5,
        ..Default::default()
    }))
}

pub fn text_packet(from: u32, id: u32, text: &str) -> Bytes {
    from_radio(FRPayload::Packet(proto::MeshPacket {
        from,
        to: BROADCAST_NODE_ID,
        id,
        rx_time: 1_700_000_000,
        rx_snr: 4.0,
        payload_variant: Some(proto::mesh_packet::PayloadVariant::Decoded(proto::Data {
            portnum: proto::PortNum::TextMessageApp as i32,
            payload: Bytes::copy_from_slice(text.as_bytes()),
            ..Default::default()
        })),
        ..Default::default()
    }))
}

pub fn rebooted() -> Bytes {
    from_radio(FRPayload::Rebooted(true))
}

/// Poll `done` until it holds; false after a few seconds (of virtual time when paused).
pub async fn wait_until(mut done: impl FnMut() -> bool) -> bool {
    tokio::time::timeout(WAIT, async {
        while !done() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .is_ok()
}

/// Everything already queued on `rx`.
pub fn drain_events(rx: &mut broadcast::Receiver<HostEvent>) -> Vec<HostEvent> {
    let mut out = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        out.push(ev);
    }
    out
}

pub fn state_changes(events: &[HostEvent]) -> Vec<LinkState> {
    events
        .iter()
        .filter_map(|e| match e {
            HostEvent::ConnectionStateChanged(s) => Some(*s),
            _ => None,
        })
        .collect()
}

pub struct Harness {
    pub link: Arc<ReplayLink>,
    pub handle: SupervisorHandle,
    task: JoinHandle<anyhow::Result<()>>,
}

impl Harness {
    /// Powered link with the local node's identity as bootstrap.
    pub fn start(config: SupervisorConfig) -> Self {
        let (link, events) = ReplayLink::new(DeviceHandle::new(DEVICE, DEVICE_NAME, -58));
        link.queue_bootstrap(my_info(SELF_NODE));
        link.queue_bootstrap(node_info(SELF_NODE, "Base Station", "BASE", 1_000));
        link.set_powered(true);
        let (supervisor, handle) = ConnectionSupervisor::new(link.clone(), events, config);
        let task = supervisor.spawn();
        Harness { link, handle, task }
    }

    pub async fn discover(&self) {
        self.handle.start_scanning();
        assert!(
            wait_until(|| !self.handle.discovered().is_empty()).await,
            "device was never discovered"
        );
    }

    /// Scan, connect and wait until the handshake drain has finished.
    pub async fn connect(&self) {
        self.discover().await;
        self.handle.connect_to(DEVICE.into());
        assert!(self.handle.wait_for_state(LinkState::Ready).await);
        assert!(wait_until(|| self.handle.metrics().empty_pulls > 0).await);
    }

    /// Queue `frames`, ring once, and wait until the drain loop has gone idle.
    pub async fn deliver(&self, frames: &[Bytes]) {
        let baseline = self.handle.metrics().empty_pulls;
        for f in frames {
            self.link.push_inbound(f.clone());
        }
        self.link.ring_doorbell();
        assert!(
            wait_until(|| {
                self.link.pending_inbound() == 0 && self.handle.metrics().empty_pulls > baseline
            })
            .await,
            "drain did not finish"
        );
    }

    pub async fn stop(self) {
        self.handle.shutdown();
        self.task.await.unwrap().unwrap();
    }
}
