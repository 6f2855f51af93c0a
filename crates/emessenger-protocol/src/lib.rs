//! Binary packet codec for the emessenger relay protocol.
//!
//! A client and the relay exchange short frames over one WebSocket, one
//! packet per binary message. Three packet families share the channel:
//!
//! - **management**: associate a connection with a client ID
//! - **control**: poll the mailbox, acknowledge pushes, report back-pressure
//! - **data**: text payloads between two client IDs
//!
//! The wire has no request IDs: the relay answers every frame exactly once,
//! in arrival order, and the client pairs replies with requests by position.
//!
//! # Example
//!
//! ```rust
//! use emessenger_protocol::Packet;
//!
//! let push = Packet::push(1, 2, "hi");
//! let bytes = push.encode().unwrap();
//! assert_eq!(bytes, [2, 1, 1, 2, 2, b'h', b'i']);
//! assert_eq!(Packet::decode(&bytes).unwrap(), push);
//! ```

mod error;
mod packet;

pub use error::{ProtocolError, ProtocolResult};
pub use packet::{
    ClientId, ControlType, DATA_HEADER_LEN, DataType, MAX_PAYLOAD_LEN, ManagementType, Packet,
    PacketKind, SHORT_FRAME_LEN, check_payload,
};
