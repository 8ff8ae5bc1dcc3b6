//! The server<->client wire protocol: framed messages, authentication, and
//! versioning (spec section 4.4, design note on the generic object stream
//! being replaced by an explicit framed binary protocol).

pub mod auth;
pub mod framing;
pub mod message;

pub use auth::{compute_mac, generate_authkey_hex, generate_challenge, verify_mac, SENTINEL_AUTHKEY};
pub use framing::{read_message, write_message, TransportError};
pub use message::{Message, TaskDescriptor, TaskResult, PROTOCOL_VERSION};
