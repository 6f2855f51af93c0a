//! Packet types and their fixed binary layout.
//!
//! Every field is a single unsigned byte, so byte order never matters:
//!
//! ```text
//! +------+---------+-----------+---------+-------------+-----------------+
//! | kind | subtype | client id | peer id | payload len | payload (UTF-8) |
//! +------+---------+-----------+---------+-------------+-----------------+
//!    0        1          2          3           4            5..
//!
//! Management / Control: bytes 0..3 only.
//! Data:                 all fields, payload length 0..=255.
//! ```
//!
//! There is no request ID on the wire. Replies are paired with requests purely
//! by order, so the codec never needs one either.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, ProtocolResult};

/// One-byte client identifier.
pub type ClientId = u8;

/// Length of a management or control frame.
pub const SHORT_FRAME_LEN: usize = 3;

/// Length of a data frame without its payload.
pub const DATA_HEADER_LEN: usize = 5;

/// Largest payload the length byte can describe.
pub const MAX_PAYLOAD_LEN: usize = u8::MAX as usize;

/// Discriminant in byte 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PacketKind {
    /// Session management (associate and its replies).
    Management = 0,
    /// Flow control (polling and acknowledgements).
    Control = 1,
    /// Text payloads.
    Data = 2,
}

impl PacketKind {
    /// Maps byte 0 to a kind.
    pub fn from_byte(byte: u8) -> ProtocolResult<Self> {
        match byte {
            0 => Ok(Self::Management),
            1 => Ok(Self::Control),
            2 => Ok(Self::Data),
            other => Err(ProtocolError::UnknownKind(other)),
        }
    }

    /// Smallest valid frame of this kind.
    pub fn min_len(self) -> usize {
        match self {
            Self::Management | Self::Control => SHORT_FRAME_LEN,
            Self::Data => DATA_HEADER_LEN,
        }
    }
}

impl fmt::Display for PacketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Management => "management",
            Self::Control => "control",
            Self::Data => "data",
        };
        f.write_str(name)
    }
}

/// Management subtypes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManagementType {
    Associate = 0,
    AssociationSuccess = 1,
    AssociationFailed = 2,
    UnknownError = 3,
}

impl ManagementType {
    fn from_byte(byte: u8) -> ProtocolResult<Self> {
        match byte {
            0 => Ok(Self::Associate),
            1 => Ok(Self::AssociationSuccess),
            2 => Ok(Self::AssociationFailed),
            3 => Ok(Self::UnknownError),
            subtype => Err(ProtocolError::UnknownSubtype {
                kind: PacketKind::Management,
                subtype,
            }),
        }
    }
}

/// Control subtypes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlType {
    Get = 0,
    BufferEmpty = 1,
    PositiveAck = 2,
    BufferFull = 3,
}

impl ControlType {
    fn from_byte(byte: u8) -> ProtocolResult<Self> {
        match byte {
            0 => Ok(Self::Get),
            1 => Ok(Self::BufferEmpty),
            2 => Ok(Self::PositiveAck),
            3 => Ok(Self::BufferFull),
            subtype => Err(ProtocolError::UnknownSubtype {
                kind: PacketKind::Control,
                subtype,
            }),
        }
    }
}

/// Data subtypes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    GetResponse = 0,
    Push = 1,
}

impl DataType {
    fn from_byte(byte: u8) -> ProtocolResult<Self> {
        match byte {
            0 => Ok(Self::GetResponse),
            1 => Ok(Self::Push),
            subtype => Err(ProtocolError::UnknownSubtype {
                kind: PacketKind::Data,
                subtype,
            }),
        }
    }
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Packet {
    /// Session management.
    Management {
        message: ManagementType,
        client_id: ClientId,
    },
    /// Flow control.
    Control {
        message: ControlType,
        client_id: ClientId,
    },
    /// Text payload addressed to or from a peer.
    Data {
        message: DataType,
        client_id: ClientId,
        peer_id: ClientId,
        payload: String,
    },
}

impl Packet {
    /// `Associate(client_id)`: binds the connection to an ID.
    pub fn associate(client_id: ClientId) -> Self {
        Self::management(ManagementType::Associate, client_id)
    }

    /// `AssociationSuccess(client_id)`.
    pub fn association_success(client_id: ClientId) -> Self {
        Self::management(ManagementType::AssociationSuccess, client_id)
    }

    /// `AssociationFailed(client_id)`.
    pub fn association_failed(client_id: ClientId) -> Self {
        Self::management(ManagementType::AssociationFailed, client_id)
    }

    /// `UnknownError(client_id)`.
    pub fn unknown_error(client_id: ClientId) -> Self {
        Self::management(ManagementType::UnknownError, client_id)
    }

    /// `Get(client_id)`: asks for the next mailbox entry.
    pub fn get(client_id: ClientId) -> Self {
        Self::control(ControlType::Get, client_id)
    }

    /// `BufferEmpty(client_id)`.
    pub fn buffer_empty(client_id: ClientId) -> Self {
        Self::control(ControlType::BufferEmpty, client_id)
    }

    /// `PositiveAck(client_id)`.
    pub fn positive_ack(client_id: ClientId) -> Self {
        Self::control(ControlType::PositiveAck, client_id)
    }

    /// `BufferFull(client_id)`.
    pub fn buffer_full(client_id: ClientId) -> Self {
        Self::control(ControlType::BufferFull, client_id)
    }

    /// `Push(client_id, peer_id, payload)`: stores text in the peer's mailbox.
    pub fn push(client_id: ClientId, peer_id: ClientId, payload: impl Into<String>) -> Self {
        Self::Data {
            message: DataType::Push,
            client_id,
            peer_id,
            payload: payload.into(),
        }
    }

    /// `GetResponse(client_id, peer_id, payload)`: one mailbox entry, `peer_id`
    /// being the sender.
    pub fn get_response(
        client_id: ClientId,
        peer_id: ClientId,
        payload: impl Into<String>,
    ) -> Self {
        Self::Data {
            message: DataType::GetResponse,
            client_id,
            peer_id,
            payload: payload.into(),
        }
    }

    fn management(message: ManagementType, client_id: ClientId) -> Self {
        Self::Management { message, client_id }
    }

    fn control(message: ControlType, client_id: ClientId) -> Self {
        Self::Control { message, client_id }
    }

    /// Kind discriminant.
    pub fn kind(&self) -> PacketKind {
        match self {
            Self::Management { .. } => PacketKind::Management,
            Self::Control { .. } => PacketKind::Control,
            Self::Data { .. } => PacketKind::Data,
        }
    }

    /// Client ID in byte 2.
    pub fn client_id(&self) -> ClientId {
        match self {
            Self::Management { client_id, .. }
            | Self::Control { client_id, .. }
            | Self::Data { client_id, .. } => *client_id,
        }
    }

    /// Subtype byte.
    pub fn subtype(&self) -> u8 {
        match self {
            Self::Management { message, .. } => *message as u8,
            Self::Control { message, .. } => *message as u8,
            Self::Data { message, .. } => *message as u8,
        }
    }

    pub fn is_association_success(&self) -> bool {
        self.is_management(ManagementType::AssociationSuccess)
    }

    pub fn is_association_failed(&self) -> bool {
        self.is_management(ManagementType::AssociationFailed)
    }

    pub fn is_unknown_error(&self) -> bool {
        self.is_management(ManagementType::UnknownError)
    }

    pub fn is_buffer_empty(&self) -> bool {
        self.is_control(ControlType::BufferEmpty)
    }

    pub fn is_positive_ack(&self) -> bool {
        self.is_control(ControlType::PositiveAck)
    }

    pub fn is_buffer_full(&self) -> bool {
        self.is_control(ControlType::BufferFull)
    }

    pub fn is_get_response(&self) -> bool {
        matches!(
            self,
            Self::Data {
                message: DataType::GetResponse,
                ..
            }
        )
    }

    fn is_management(&self, expected: ManagementType) -> bool {
        matches!(self, Self::Management { message, .. } if *message == expected)
    }

    fn is_control(&self, expected: ControlType) -> bool {
        matches!(self, Self::Control { message, .. } if *message == expected)
    }

    /// Serialises the packet.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::PayloadTooLarge`] when a data payload exceeds
    /// [`MAX_PAYLOAD_LEN`] bytes once UTF-8 encoded.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        match self {
            Self::Management { message, client_id } => {
                Ok(vec![PacketKind::Management as u8, *message as u8, *client_id])
            }
            Self::Control { message, client_id } => {
                Ok(vec![PacketKind::Control as u8, *message as u8, *client_id])
            }
            Self::Data {
                message,
                client_id,
                peer_id,
                payload,
            } => {
                let len = check_payload(payload)?;
                let mut buffer = Vec::with_capacity(DATA_HEADER_LEN + payload.len());
                buffer.extend_from_slice(&[
                    PacketKind::Data as u8,
                    *message as u8,
                    *client_id,
                    *peer_id,
                    len,
                ]);
                buffer.extend_from_slice(payload.as_bytes());
                Ok(buffer)
            }
        }
    }

    /// Parses one frame.
    ///
    /// Bytes past the declared end are ignored. Payload bytes that are not
    /// valid UTF-8 are replaced with U+FFFD rather than rejected.
    pub fn decode(data: &[u8]) -> ProtocolResult<Self> {
        let Some(&kind_byte) = data.first() else {
            return Err(ProtocolError::EmptyFrame);
        };
        let kind = PacketKind::from_byte(kind_byte)?;

        if data.len() < kind.min_len() {
            return Err(ProtocolError::Truncated {
                kind,
                expected: kind.min_len(),
                received: data.len(),
            });
        }

        let subtype = data[1];
        let client_id = data[2];

        match kind {
            PacketKind::Management => Ok(Self::Management {
                message: ManagementType::from_byte(subtype)?,
                client_id,
            }),
            PacketKind::Control => Ok(Self::Control {
                message: ControlType::from_byte(subtype)?,
                client_id,
            }),
            PacketKind::Data => {
                let message = DataType::from_byte(subtype)?;
                let peer_id = data[3];
                let len = data[4] as usize;
                let end = DATA_HEADER_LEN + len;
                if data.len() < end {
                    return Err(ProtocolError::Truncated {
                        kind,
                        expected: end,
                        received: data.len(),
                    });
                }
                let payload = String::from_utf8_lossy(&data[DATA_HEADER_LEN..end]).into_owned();
                Ok(Self::Data {
                    message,
                    client_id,
                    peer_id,
                    payload,
                })
            }
        }
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Management { message, client_id } => {
                write!(f, "{:?}(#{:03})", message, client_id)
            }
            Self::Control { message, client_id } => {
                write!(f, "{:?}(#{:03})", message, client_id)
            }
            Self::Data {
                message,
                client_id,
                peer_id,
                payload,
            } => write!(
                f,
                "{:?}(#{:03} <-> #{:03}, {} bytes)",
                message,
                client_id,
                peer_id,
                payload.len()
            ),
        }
    }
}

/// Checks that `payload` fits a data frame and returns its length byte.
pub fn check_payload(payload: &str) -> ProtocolResult<u8> {
    u8::try_from(payload.len()).map_err(|_| ProtocolError::PayloadTooLarge {
        size: payload.len(),
        max: MAX_PAYLOAD_LEN,
    })
}
