//! # Radio link transport
//!
//! A Meshtastic radio exposes its phone API as one GATT service with three
//! characteristics:
//!
//! - **to-radio**: write-only, carries encoded `ToRadio` frames
//! - **from-radio**: read, each read pops one queued `FromRadio` frame (empty when drained)
//! - **from-num**: notify-only "doorbell", tells the client something is queued
//!
//! [`RadioLink`] is the boundary to the platform Bluetooth stack (scan, connect,
//! discovery, read/write/notify). [`FrameTransport`] sits on top of it and gives the
//! supervisor the three operations it needs, serialised against a single link and
//! bounded by a timeout that is reported as [`LinkError::Timeout`].
//!
//! Asynchronous happenings (power changes, advertisements, disconnects, doorbells)
//! are delivered by the link implementation on one [`LinkEvent`] channel.

use bytes::Bytes;
use log::{debug, trace, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::{timeout, Duration};
use uuid::Uuid;

pub mod replay;

pub use replay::ReplayLink;

/// Meshtastic BLE service.
pub const MESH_SERVICE_UUID: Uuid = Uuid::from_u128(0x6ba1b218_15a8_461f_9fa8_5dcae273eafd);
/// Write characteristic for `ToRadio` frames.
pub const TORADIO_UUID: Uuid = Uuid::from_u128(0xf75c76d2_129e_4dad_a1dd_7866124401e7);
/// Read characteristic for `FromRadio` frames.
pub const FROMRADIO_UUID: Uuid = Uuid::from_u128(0x8ba2bcc2_ee02_4a55_a531_c525c5e454d5);
/// Notify characteristic used as the doorbell.
pub const FROMNUM_UUID: Uuid = Uuid::from_u128(0xed9da18c_a800_4f66_a670_aa7547e34453);

/// Platform identifier of a peripheral (stable across reconnects).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(pub String);

impl DeviceId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        DeviceId(s.to_string())
    }
}

impl From<String> for DeviceId {
    fn from(s: String) -> Self {
        DeviceId(s)
    }
}

/// A peripheral seen while scanning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceHandle {
    pub id: DeviceId,
    pub name: String,
    pub rssi: i16,
}

impl DeviceHandle {
    pub fn new(id: impl Into<DeviceId>, name: impl Into<String>, rssi: i16) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            rssi,
        }
    }
}

/// The three characteristics of the mesh service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    ToRadio,
    FromRadio,
    FromNum,
}

impl Channel {
    pub fn uuid(self) -> Uuid {
        match self {
            Channel::ToRadio => TORADIO_UUID,
            Channel::FromRadio => FROMRADIO_UUID,
            Channel::FromNum => FROMNUM_UUID,
        }
    }
}

/// Proof that discovery found all three characteristics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelSet {
    pub to_radio: Uuid,
    pub from_radio: Uuid,
    pub from_num: Uuid,
}

impl ChannelSet {
    /// Build from the characteristic ids discovered under the mesh service.
    pub fn from_discovered(found: &[Uuid]) -> Result<Self, LinkError> {
        for channel in [Channel::ToRadio, Channel::FromRadio, Channel::FromNum] {
            if !found.contains(&channel.uuid()) {
                return Err(LinkError::MissingCharacteristic(channel.uuid()));
            }
        }
        Ok(Self {
            to_radio: TORADIO_UUID,
            from_radio: FROMRADIO_UUID,
            from_num: FROMNUM_UUID,
        })
    }
}

/// Failures reported by the link or raised by [`FrameTransport`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LinkError {
    /// Bluetooth is off or not authorised.
    #[error("radio stack unavailable")]
    Unavailable,

    /// An operation or the connection itself timed out.
    #[error("link timed out")]
    Timeout,

    /// The peripheral dropped the connection (sleeping or out of range).
    #[error("peer disconnected")]
    PeerDisconnected,

    /// Bonding information no longer matches; the user must re-pair.
    #[error("pairing failure: {0}")]
    PairingFailure(String),

    /// Discovery did not find one of the mesh characteristics.
    #[error("missing characteristic {0}")]
    MissingCharacteristic(Uuid),

    /// The link does not know the requested peripheral.
    #[error("unknown device {0}")]
    UnknownDevice(String),

    /// Any other platform error.
    #[error("link error {code}: {description}")]
    Other { code: i32, description: String },
}

impl LinkError {
    /// Map a platform disconnect code onto the taxonomy.
    ///
    /// 6 is "connection timed out unexpectedly" (device reset or power cycle),
    /// 7 is "peripheral disconnected from us" (device sleeping), 14 is a peer
    /// pairing error that needs the device forgotten and paired again.
    pub fn from_code(code: i32, description: impl Into<String>) -> Self {
        match code {
            6 => LinkError::Timeout,
            7 => LinkError::PeerDisconnected,
            14 => LinkError::PairingFailure(description.into()),
            _ => LinkError::Other {
                code,
                description: description.into(),
            },
        }
    }
}

/// Asynchronous happenings on the link, delivered in order on one channel.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    PowerChanged(bool),
    Discovered(DeviceHandle),
    Disconnected {
        device: DeviceId,
        error: Option<LinkError>,
    },
    /// from-num notification; carries no payload.
    Doorbell,
}

/// Platform Bluetooth stack, as consumed by this crate.
///
/// Implementations report asynchronous happenings through the `LinkEvent`
/// sender they were built with.
pub trait RadioLink: Send + Sync + 'static {
    fn is_powered_on(&self) -> bool;

    /// Start scanning for peripherals advertising [`MESH_SERVICE_UUID`].
    fn start_scan(&self) -> impl Future<Output = Result<(), LinkError>> + Send;

    fn stop_scan(&self) -> impl Future<Output = ()> + Send;

    fn connect(&self, device: &DeviceId) -> impl Future<Output = Result<(), LinkError>> + Send;

    /// Characteristic ids found under the mesh service of a connected device.
    fn discover_characteristics(
        &self,
        device: &DeviceId,
    ) -> impl Future<Output = Result<Vec<Uuid>, LinkError>> + Send;

    fn write(&self, channel: Channel, data: &[u8])
        -> impl Future<Output = Result<(), LinkError>> + Send;

    fn read(&self, channel: Channel) -> impl Future<Output = Result<Bytes, LinkError>> + Send;

    fn subscribe(&self, channel: Channel) -> impl Future<Output = Result<(), LinkError>> + Send;

    fn disconnect(&self, device: &DeviceId) -> impl Future<Output = ()> + Send;
}

/// Frame-level view of a [`RadioLink`].
///
/// All operations except [`FrameTransport::disconnect`] hold one async mutex for
/// their duration, so reads and writes never overlap on the link.
pub struct FrameTransport<L> {
    link: Arc<L>,
    op_lock: Arc<Mutex<()>>,
    op_timeout: Duration,
}

impl<L> Clone for FrameTransport<L> {
    fn clone(&self) -> Self {
        Self {
            link: self.link.clone(),
            op_lock: self.op_lock.clone(),
            op_timeout: self.op_timeout,
        }
    }
}

impl<L: RadioLink> FrameTransport<L> {
    pub fn new(link: Arc<L>, op_timeout: Duration) -> Self {
        Self {
            link,
            op_lock: Arc::new(Mutex::new(())),
            op_timeout,
        }
    }

    async fn bounded<T, F>(&self, op: &'static str, fut: F) -> Result<T, LinkError>
    where
        F: Future<Output = Result<T, LinkError>>,
    {
        match timeout(self.op_timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                warn!("{} timed out after {:?}", op, self.op_timeout);
                Err(LinkError::Timeout)
            }
        }
    }

    async fn guarded<T, F>(&self, op: &'static str, fut: F) -> Result<T, LinkError>
    where
        F: Future<Output = Result<T, LinkError>>,
    {
        let _guard = self.op_lock.lock().await;
        self.bounded(op, fut).await
    }

    pub async fn start_scan(&self) -> Result<(), LinkError> {
        self.bounded("start_scan", self.link.start_scan()).await
    }

    pub async fn stop_scan(&self) {
        let _ = self
            .bounded("stop_scan", async {
                self.link.stop_scan().await;
                Ok::<(), LinkError>(())
            })
            .await;
    }

    /// First half of opening a device: establish the link.
    pub async fn connect(&self, device: &DeviceId) -> Result<(), LinkError> {
        debug!("Connecting to {}", device);
        self.guarded("connect", self.link.connect(device)).await
    }

    /// Second half: discover the three characteristics and subscribe the doorbell.
    pub async fn open_channels(&self, device: &DeviceId) -> Result<ChannelSet, LinkError> {
        let found = self
            .guarded("discover", self.link.discover_characteristics(device))
            .await?;
        let channels = ChannelSet::from_discovered(&found)?;
        self.guarded("subscribe", self.link.subscribe(Channel::FromNum))
            .await?;
        debug!("Mesh characteristics ready on {}", device);
        Ok(channels)
    }

    pub async fn write_outbound(&self, payload: &[u8]) -> Result<(), LinkError> {
        trace!("to-radio write {} bytes", payload.len());
        self.guarded("write", self.link.write(Channel::ToRadio, payload))
            .await
    }

    /// Pop one frame from the device queue. An empty result means "drained".
    pub async fn pull_inbound(&self) -> Result<Bytes, LinkError> {
        self.guarded("pull", self.link.read(Channel::FromRadio)).await
    }

    /// Tear the link down. Not serialised behind in-flight operations.
    pub async fn disconnect(&self, device: &DeviceId) {
        let _ = self
            .bounded("disconnect", async {
                self.link.disconnect(device).await;
                Ok::<(), LinkError>(())
            })
            .await;
    }
}
