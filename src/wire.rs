//! Wire protocol: message schema, frame codec and coordinate encoding.
//!
//! Every message travels as a 5-byte header (one magic/version byte, then
//! the body length as a little-endian u32) followed by a MessagePack-encoded
//! [`Message`] body. Coordinates are carried as signed 32-bit micro-degrees.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::peer::{NetworkEndpoint, NodeId, NodeInfo, NodeProfile, ServiceProfile, ServiceType};
use crate::GpsLocation;

/// First byte of every frame.
pub const FRAME_MAGIC: u8 = 0x01;

/// Frame header size: magic byte plus little-endian u32 body length.
pub const FRAME_HEADER_SIZE: usize = 5;

/// Upper bound on the frame body; oversized frames close the session.
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Degrees are scaled by this factor and rounded into an i32 on the wire.
pub const COORDINATE_SCALE: f64 = 1_000_000.0;

/// Outcome code of a served request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Ok,
    ProtocolViolation,
    Unsupported,
    InvalidValue,
    InternalError,
}

/// A GPS location in wire form: micro-degree integers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireLocation {
    pub latitude_e6: i32,
    pub longitude_e6: i32,
}

impl From<GpsLocation> for WireLocation {
    fn from(location: GpsLocation) -> Self {
        Self {
            latitude_e6: (location.latitude() * COORDINATE_SCALE).round() as i32,
            longitude_e6: (location.longitude() * COORDINATE_SCALE).round() as i32,
        }
    }
}

impl TryFrom<WireLocation> for GpsLocation {
    type Error = Error;

    fn try_from(wire: WireLocation) -> Result<GpsLocation> {
        GpsLocation::new(
            wire.latitude_e6 as f64 / COORDINATE_SCALE,
            wire.longitude_e6 as f64 / COORDINATE_SCALE,
        )
    }
}

/// A node's identity, contact and location in wire form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireNodeInfo {
    pub node_id: String,
    pub address: String,
    pub port: u16,
    pub location: WireLocation,
}

impl From<&NodeInfo> for WireNodeInfo {
    fn from(info: &NodeInfo) -> Self {
        Self {
            node_id: info.id().as_str().to_owned(),
            address: info.endpoint().address().to_owned(),
            port: info.endpoint().port(),
            location: info.location().into(),
        }
    }
}

impl TryFrom<&WireNodeInfo> for NodeInfo {
    type Error = Error;

    fn try_from(wire: &WireNodeInfo) -> Result<NodeInfo> {
        if wire.node_id.is_empty() {
            return Err(Error::BadRequest("empty node id".into()));
        }
        let endpoint = NetworkEndpoint::new(wire.address.clone(), wire.port)?;
        let location = GpsLocation::try_from(wire.location)?;
        Ok(NodeInfo::new(
            NodeProfile::new(NodeId::new(wire.node_id.clone()), endpoint),
            location,
        ))
    }
}

/// A service registration entry in wire form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireServiceProfile {
    pub service_id: String,
    pub address: String,
    pub port: u16,
}

impl From<&ServiceProfile> for WireServiceProfile {
    fn from(profile: &ServiceProfile) -> Self {
        Self {
            service_id: profile.id().as_str().to_owned(),
            address: profile.endpoint().address().to_owned(),
            port: profile.endpoint().port(),
        }
    }
}

impl TryFrom<&WireServiceProfile> for ServiceProfile {
    type Error = Error;

    fn try_from(wire: &WireServiceProfile) -> Result<ServiceProfile> {
        if wire.service_id.is_empty() {
            return Err(Error::BadRequest("empty service id".into()));
        }
        let endpoint = NetworkEndpoint::new(wire.address.clone(), wire.port)?;
        Ok(NodeProfile::new(NodeId::new(wire.service_id.clone()), endpoint))
    }
}

/// One neighbourhood mutation pushed over a keep-alive session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NeighbourhoodChange {
    Added(WireNodeInfo),
    Updated(WireNodeInfo),
    Removed { node_id: String },
}

/// Requests issued by co-hosted services on the same machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LocalServiceRequest {
    RegisterService {
        service_type: ServiceType,
        profile: WireServiceProfile,
    },
    DeregisterService {
        service_type: ServiceType,
    },
    GetNeighbourNodes {
        keep_alive_and_send_updates: bool,
    },
    /// Notification pushed by the server to keep-alive subscribers; never
    /// valid as a request *to* the server.
    NeighbourhoodChanged {
        changes: Vec<NeighbourhoodChange>,
    },
}

/// Peer-to-peer requests between overlay nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RemoteNodeRequest {
    AcceptColleague {
        requestor: WireNodeInfo,
    },
    RenewColleague {
        requestor: WireNodeInfo,
    },
    AcceptNeighbour {
        requestor: WireNodeInfo,
    },
    RenewNeighbour {
        requestor: WireNodeInfo,
    },
    GetNodeCount,
    GetRandomNodes {
        max_node_count: u32,
        include_neighbours: bool,
    },
    GetClosestNodes {
        location: WireLocation,
        max_radius_km: f64,
        max_node_count: u32,
        include_neighbours: bool,
    },
}

/// Read-only requests from third-party clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientRequest {
    GetServices,
    GetNeighbourNodes,
    GetClosestNodes {
        location: WireLocation,
        max_radius_km: f64,
        max_node_count: u32,
        include_neighbours: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RequestBody {
    LocalService(LocalServiceRequest),
    RemoteNode(RemoteNodeRequest),
    Client(ClientRequest),
}

/// Acknowledgement of an Accept*/Renew* relation request. When accepted,
/// `acceptor` carries the acceptor's own node info; `remote_ip` echoes the
/// requestor's address as observed by the acceptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationAck {
    pub accepted: bool,
    pub acceptor: Option<WireNodeInfo>,
    pub remote_ip: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LocalServiceResponse {
    RegisterService,
    DeregisterService,
    GetNeighbourNodes { nodes: Vec<WireNodeInfo> },
    NeighbourhoodChanged,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RemoteNodeResponse {
    AcceptColleague(RelationAck),
    RenewColleague(RelationAck),
    AcceptNeighbour(RelationAck),
    RenewNeighbour(RelationAck),
    GetNodeCount { node_count: u64 },
    GetRandomNodes { nodes: Vec<WireNodeInfo> },
    GetClosestNodes { nodes: Vec<WireNodeInfo> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientResponse {
    GetServices {
        services: Vec<(ServiceType, WireServiceProfile)>,
    },
    GetNeighbourNodes {
        nodes: Vec<WireNodeInfo>,
    },
    GetClosestNodes {
        nodes: Vec<WireNodeInfo>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResponseBody {
    LocalService(LocalServiceResponse),
    RemoteNode(RemoteNodeResponse),
    Client(ClientResponse),
}

/// The protocol version requests are stamped with.
pub const PROTOCOL_VERSION: [u32; 3] = [1, 0, 0];

/// Top-level wire message. Responses reuse the id of the request they
/// answer so the two ends can correlate them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    Request {
        id: u32,
        version: Vec<u32>,
        body: RequestBody,
    },
    Response {
        id: u32,
        status: Status,
        details: String,
        body: Option<ResponseBody>,
    },
}

impl Message {
    /// Wrap a request body into a message; the session assigns the real id.
    pub fn request(body: RequestBody) -> Self {
        Message::Request {
            id: 0,
            version: PROTOCOL_VERSION.to_vec(),
            body,
        }
    }

    pub fn ok_response(id: u32, body: ResponseBody) -> Self {
        Message::Response {
            id,
            status: Status::Ok,
            details: String::new(),
            body: Some(body),
        }
    }

    pub fn error_response(id: u32, status: Status, details: impl Into<String>) -> Self {
        Message::Response {
            id,
            status,
            details: details.into(),
            body: None,
        }
    }

    pub fn id(&self) -> u32 {
        match self {
            Message::Request { id, .. } | Message::Response { id, .. } => *id,
        }
    }
}

/// Serialize a message into a full frame: header plus MessagePack body.
pub fn encode_frame(message: &Message) -> Result<Vec<u8>> {
    let body = rmp_serde::to_vec(message)?;
    if body.len() > MAX_MESSAGE_SIZE {
        return Err(Error::BadRequest(format!(
            "message body of {} bytes exceeds the {} byte limit",
            body.len(),
            MAX_MESSAGE_SIZE
        )));
    }
    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + body.len());
    frame.push(FRAME_MAGIC);
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Parse a frame header, returning the body length it announces.
pub fn decode_frame_header(header: &[u8; FRAME_HEADER_SIZE]) -> Result<usize> {
    if header[0] != FRAME_MAGIC {
        return Err(Error::BadRequest(format!(
            "unexpected frame magic byte 0x{:02x}",
            header[0]
        )));
    }
    let length = u32::from_le_bytes([header[1], header[2], header[3], header[4]]) as usize;
    if length > MAX_MESSAGE_SIZE {
        return Err(Error::BadRequest(format!(
            "announced body of {} bytes exceeds the {} byte limit",
            length, MAX_MESSAGE_SIZE
        )));
    }
    Ok(length)
}

/// Deserialize a frame body into a message.
pub fn decode_body(body: &[u8]) -> Result<Message> {
    Ok(rmp_serde::from_slice(body)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::{NetworkEndpoint, NodeId, NodeProfile};

    fn sample_info() -> NodeInfo {
        NodeInfo::new(
            NodeProfile::new(
                NodeId::new("SampleId"),
                NetworkEndpoint::new("127.0.0.1", 6371).unwrap(),
            ),
            GpsLocation::new(47.497912, 19.040235).unwrap(),
        )
    }

    #[test]
    fn test_frame_roundtrip() {
        let message = Message::request(RequestBody::RemoteNode(RemoteNodeRequest::GetNodeCount));
        let frame = encode_frame(&message).unwrap();
        assert_eq!(frame[0], FRAME_MAGIC);

        let mut header = [0u8; FRAME_HEADER_SIZE];
        header.copy_from_slice(&frame[..FRAME_HEADER_SIZE]);
        let body_len = decode_frame_header(&header).unwrap();
        assert_eq!(body_len, frame.len() - FRAME_HEADER_SIZE);

        let decoded = decode_body(&frame[FRAME_HEADER_SIZE..]).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_frame_length_is_little_endian() {
        let message = Message::request(RequestBody::Client(ClientRequest::GetServices));
        let frame = encode_frame(&message).unwrap();
        let body_len = (frame.len() - FRAME_HEADER_SIZE) as u32;
        assert_eq!(&frame[1..5], body_len.to_le_bytes());
    }

    #[test]
    fn test_header_rejects_oversized_announcement() {
        let mut header = [FRAME_MAGIC, 0, 0, 0, 0];
        header[1..5].copy_from_slice(&((MAX_MESSAGE_SIZE as u32) + 1).to_le_bytes());
        assert!(decode_frame_header(&header).is_err());
    }

    #[test]
    fn test_header_rejects_bad_magic() {
        let header = [0x02, 1, 0, 0, 0];
        assert!(decode_frame_header(&header).is_err());
    }

    #[test]
    fn test_coordinate_roundtrip_tolerance() {
        let original = GpsLocation::new(47.497912, 19.040235).unwrap();
        let wire = WireLocation::from(original);
        let recovered = GpsLocation::try_from(wire).unwrap();
        assert!((recovered.latitude() - original.latitude()).abs() < 1e-5);
        assert!((recovered.longitude() - original.longitude()).abs() < 1e-5);
    }

    #[test]
    fn test_node_info_roundtrip() {
        let info = sample_info();
        let wire = WireNodeInfo::from(&info);
        let back = NodeInfo::try_from(&wire).unwrap();
        assert_eq!(back.id(), info.id());
        assert_eq!(back.endpoint(), info.endpoint());
        assert!((back.location().latitude() - info.location().latitude()).abs() < 1e-5);
    }

    #[test]
    fn test_node_info_rejects_bad_fields() {
        let mut wire = WireNodeInfo::from(&sample_info());
        wire.node_id.clear();
        assert!(NodeInfo::try_from(&wire).is_err());

        let mut wire = WireNodeInfo::from(&sample_info());
        wire.address = "nonsense".into();
        assert!(NodeInfo::try_from(&wire).is_err());
    }

    #[test]
    fn test_message_roundtrip_with_payload() {
        let info = sample_info();
        let message = Message::ok_response(
            7,
            ResponseBody::RemoteNode(RemoteNodeResponse::GetClosestNodes {
                nodes: vec![WireNodeInfo::from(&info)],
            }),
        );
        let frame = encode_frame(&message).unwrap();
        let decoded = decode_body(&frame[FRAME_HEADER_SIZE..]).unwrap();
        assert_eq!(decoded, message);
        assert_eq!(decoded.id(), 7);
    }
}
