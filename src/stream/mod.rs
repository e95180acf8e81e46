pub mod connection;
pub mod message;
pub mod transport;

pub use connection::{
    ConnectionState, DisconnectHandler, MessageHandler, StreamConnection, StreamSettings,
};
pub use message::{StreamMessage, CANDLES_CHANNEL, HEARTBEATS_CHANNEL, TICKER_CHANNEL};
pub use transport::{FrameSink, FrameStream, StreamTransport, WebSocketTransport};
