//! # Mesh codec
//!
//! Stateless translation between wire frames and the crate's typed model.
//! Outbound: the want-config handshake request and broadcast text packets.
//! Inbound: one `FromRadio` frame becomes one [`Frame`].
//!
//! Decoding never panics. Malformed bytes are returned as a [`DecodeError`] and
//! the caller discards the frame.

use crate::protobuf::meshtastic_generated as proto;
use crate::registry::{Envelope, NodePosition, NodeRecord, NodeUpdate, NodeUser};
use bytes::Bytes;
use prost::Message;
use std::str::Utf8Error;
use thiserror::Error;

/// Destination id meaning "every reachable node".
pub const BROADCAST_NODE_ID: u32 = 0xFFFF_FFFF;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] prost::DecodeError),

    #[error("text payload is not UTF-8: {0}")]
    InvalidText(#[from] Utf8Error),

    #[error("malformed {port} payload: {source}")]
    Payload {
        port: &'static str,
        #[source]
        source: prost::DecodeError,
    },
}

/// Identity of the connected radio, sent first during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelfInfo {
    pub node_num: u32,
    pub reboot_count: u32,
    pub min_app_version: u32,
}

/// Routing status for an earlier packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutingReport {
    pub request_id: u32,
    pub error_reason: i32,
}

impl RoutingReport {
    pub fn is_success(&self) -> bool {
        self.error_reason == proto::routing::Error::None as i32
    }

    pub fn reason_name(&self) -> &'static str {
        proto::routing::Error::try_from(self.error_reason)
            .map(|e| e.as_str_name())
            .unwrap_or("UNRECOGNIZED")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PacketKind {
    Text(String),
    NodeInfo(NodeUser),
    Position(NodePosition),
    Admin(Bytes),
    Routing(RoutingReport),
    /// Encrypted, payload-less or unhandled port; the raw packet is kept for logging.
    Unclassified(Box<proto::MeshPacket>),
}

impl PacketKind {
    pub fn label(&self) -> &'static str {
        match self {
            PacketKind::Text(_) => "text",
            PacketKind::NodeInfo(_) => "nodeinfo",
            PacketKind::Position(_) => "position",
            PacketKind::Admin(_) => "admin",
            PacketKind::Routing(_) => "routing",
            PacketKind::Unclassified(_) => "unclassified",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppPacket {
    pub id: u32,
    pub from: u32,
    pub to: u32,
    pub channel: u32,
    pub rx_time: u32,
    pub rx_snr: f32,
    pub want_ack: bool,
    pub want_response: bool,
    pub kind: PacketKind,
}

impl AppPacket {
    pub fn envelope(&self) -> Envelope {
        Envelope {
            num: self.from,
            last_heard: self.rx_time,
            snr: self.rx_snr,
        }
    }

    /// The registry update implied by this packet's sender metadata.
    pub fn node_update(&self) -> NodeUpdate {
        let envelope = self.envelope();
        match &self.kind {
            PacketKind::NodeInfo(user) => NodeUpdate::Identity {
                envelope,
                user: user.clone(),
            },
            PacketKind::Position(position) => NodeUpdate::Position {
                envelope,
                position: position.clone(),
            },
            _ => NodeUpdate::Heard(envelope),
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.to == BROADCAST_NODE_ID
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceLogLevel {
    Critical,
    Error,
    Warning,
    Info,
    Debug,
    Trace,
}

impl DeviceLogLevel {
    pub fn as_log_level(self) -> log::Level {
        match self {
            DeviceLogLevel::Critical | DeviceLogLevel::Error => log::Level::Error,
            DeviceLogLevel::Warning => log::Level::Warn,
            DeviceLogLevel::Info => log::Level::Info,
            DeviceLogLevel::Debug => log::Level::Debug,
            DeviceLogLevel::Trace => log::Level::Trace,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceLog {
    pub level: DeviceLogLevel,
    pub source: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    HandshakeInfo(SelfInfo),
    NodeSnapshot(NodeRecord),
    Packet(AppPacket),
    HandshakeComplete(u32),
    /// The radio restarted and dropped its client state.
    Rebooted,
    DeviceLog(DeviceLog),
    /// No payload this client understands.
    Empty,
}

impl Frame {
    pub fn label(&self) -> &'static str {
        match self {
            Frame::HandshakeInfo(_) => "handshake-info",
            Frame::NodeSnapshot(_) => "node-snapshot",
            Frame::Packet(_) => "packet",
            Frame::HandshakeComplete(_) => "handshake-complete",
            Frame::Rebooted => "rebooted",
            Frame::DeviceLog(_) => "device-log",
            Frame::Empty => "empty",
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MeshCodec;

impl MeshCodec {
    pub fn encode_handshake_request(token: u32) -> Bytes {
        use proto::to_radio::PayloadVariant;
        let msg = proto::ToRadio {
            payload_variant: Some(PayloadVariant::WantConfigId(token)),
        };
        Bytes::from(msg.encode_to_vec())
    }

    /// Text message packet; the radio fills in `from` and assigns the id.
    pub fn encode_text_packet(text: &str, to: u32, channel: u32) -> Bytes {
        use proto::mesh_packet::PayloadVariant as MPPayload;
        use proto::to_radio::PayloadVariant as TRPayload;
        use proto::{Data, MeshPacket, PortNum, ToRadio};

        let data = Data {
            portnum: PortNum::TextMessageApp as i32,
            payload: Bytes::copy_from_slice(text.as_bytes()),
            ..Default::default()
        };
        let pkt = MeshPacket {
            to,
            channel,
            id: 0,
            want_ack: true,
            payload_variant: Some(MPPayload::Decoded(data)),
            ..Default::default()
        };
        let msg = ToRadio {
            payload_variant: Some(TRPayload::Packet(pkt)),
        };
        Bytes::from(msg.encode_to_vec())
    }

    pub fn decode(data: &[u8]) -> Result<Frame, DecodeError> {
        use proto::from_radio::PayloadVariant as FRPayload;

        let msg = proto::FromRadio::decode(data)?;
        let frame = match msg.payload_variant {
            Some(FRPayload::MyInfo(info)) => Frame::HandshakeInfo(SelfInfo {
                node_num: info.my_node_num,
                reboot_count: info.reboot_count,
                min_app_version: info.min_app_version,
            }),
            Some(FRPayload::NodeInfo(info)) => Frame::NodeSnapshot(node_record(info)),
            Some(FRPayload::Packet(pkt)) => Frame::Packet(app_packet(pkt)?),
            Some(FRPayload::ConfigCompleteId(token)) => Frame::HandshakeComplete(token),
            Some(FRPayload::Rebooted(_)) => Frame::Rebooted,
            Some(FRPayload::LogRecord(rec)) => Frame::DeviceLog(device_log(rec)),
            None => Frame::Empty,
        };
        Ok(frame)
    }
}

fn hw_model_name(raw: i32) -> String {
    proto::HardwareModel::try_from(raw)
        .map(|m| m.as_str_name().to_string())
        .unwrap_or_else(|_| format!("HW_{}", raw))
}

fn node_user(user: proto::User) -> NodeUser {
    NodeUser {
        id: user.id,
        long_name: user.long_name.trim().to_string(),
        short_name: user.short_name.trim().to_string(),
        hw_model: hw_model_name(user.hw_model),
    }
}

fn node_position(pos: proto::Position) -> NodePosition {
    NodePosition {
        latitude_i: pos.latitude_i,
        longitude_i: pos.longitude_i,
        altitude: pos.altitude,
        battery_level: 0,
        time: pos.time,
    }
}

fn node_record(info: proto::NodeInfo) -> NodeRecord {
    let battery = info.device_metrics.map(|m| m.battery_level);
    let position = match (info.position, battery) {
        (Some(pos), battery) => Some(NodePosition {
            battery_level: battery.unwrap_or(0),
            ..node_position(pos)
        }),
        (None, Some(battery_level)) => Some(NodePosition {
            battery_level,
            ..Default::default()
        }),
        (None, None) => None,
    };
    NodeRecord {
        num: info.num,
        user: info.user.map(node_user),
        position,
        last_heard: info.last_heard,
        snr: info.snr,
    }
}

fn app_packet(pkt: proto::MeshPacket) -> Result<AppPacket, DecodeError> {
    use proto::mesh_packet::PayloadVariant as MPPayload;
    use proto::PortNum;

    let (kind, want_response) = match &pkt.payload_variant {
        Some(MPPayload::Decoded(data)) => {
            let port = PortNum::try_from(data.portnum).unwrap_or(PortNum::UnknownApp);
            let kind = match port {
                PortNum::TextMessageApp => {
                    PacketKind::Text(std::str::from_utf8(&data.payload)?.to_string())
                }
                PortNum::NodeinfoApp => {
                    let user = proto::User::decode(data.payload.clone()).map_err(|source| {
                        DecodeError::Payload {
                            port: "NODEINFO_APP",
                            source,
                        }
                    })?;
                    PacketKind::NodeInfo(node_user(user))
                }
                PortNum::PositionApp => {
                    let pos = proto::Position::decode(data.payload.clone()).map_err(|source| {
                        DecodeError::Payload {
                            port: "POSITION_APP",
                            source,
                        }
                    })?;
                    PacketKind::Position(node_position(pos))
                }
                PortNum::AdminApp => PacketKind::Admin(data.payload.clone()),
                PortNum::RoutingApp => {
                    let routing =
                        proto::Routing::decode(data.payload.clone()).map_err(|source| {
                            DecodeError::Payload {
                                port: "ROUTING_APP",
                                source,
                            }
                        })?;
                    let error_reason = match routing.variant {
                        Some(proto::routing::Variant::ErrorReason(e)) => e,
                        None => proto::routing::Error::None as i32,
                    };
                    let request_id = if data.request_id != 0 {
                        data.request_id
                    } else {
                        data.reply_id
                    };
                    PacketKind::Routing(RoutingReport {
                        request_id,
                        error_reason,
                    })
                }
                _ => PacketKind::Unclassified(Box::new(pkt.clone())),
            };
            (kind, data.want_response)
        }
        _ => (PacketKind::Unclassified(Box::new(pkt.clone())), false),
    };

    Ok(AppPacket {
        id: pkt.id,
        from: pkt.from,
        to: pkt.to,
        channel: pkt.channel,
        rx_time: pkt.rx_time,
        rx_snr: pkt.rx_snr,
        want_ack: pkt.want_ack,
        want_response,
        kind,
    })
}

fn device_log(rec: proto::LogRecord) -> DeviceLog {
    use proto::log_record::Level;
    let level = match Level::try_from(rec.level).unwrap_or(Level::Info) {
        Level::Critical => DeviceLogLevel::Critical,
        Level::Error => DeviceLogLevel::Error,
        Level::Warning => DeviceLogLevel::Warning,
        Level::Debug => DeviceLogLevel::Debug,
        Level::Trace => DeviceLogLevel::Trace,
        Level::Info | Level::Unset => DeviceLogLevel::Info,
    };
    DeviceLog {
        level,
        source: rec.source,
        message: rec.message,
    }
}
