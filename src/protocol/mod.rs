//! Upstream wire protocol

pub mod frame;
pub mod messages;

pub use frame::{encode_connect, encode_event, EngineHandshake, Packet};
pub use messages::{ClientRequest, Message, ServerEvent};
