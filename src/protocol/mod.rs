//! Control-plane protocol: framing and message types.

pub mod messages;
pub mod wire;

pub use messages::{
    AgentFrame, ClientRequest, ClientResponse, ErrorKind, Hello, MasterFrame, ProbeReply,
    ProbeRequest, RegisterReply, RegisterRequest,
};
pub use wire::{
    decode, encode, read_frame, read_frame_timeout, read_message, write_frame, write_message,
    ProtocolError, MAX_MESSAGE_SIZE,
};
