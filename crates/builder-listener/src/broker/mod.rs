// STOMP broker plumbing: frame codec, session handling and the outbound sink.

pub mod connection;
pub mod frame;

pub use connection::{
    send_within, BrokerConnection, BrokerSender, ConnectError, MessageSink, SendError, SEND_TIMEOUT,
};
pub use frame::{FrameError, StompCodec, StompCommand, StompFrame};
