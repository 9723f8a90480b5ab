pub mod channel;
pub mod message;
pub mod ws;

pub use channel::{
    ChannelCounters, ChannelState, InboundEvent, Outbound, TelemetryChannel, TelemetryConnector,
    TelemetryLink, FRAME_BUFFER, STOP_TOKEN,
};
pub use message::{parse_message, FinalReport, ProtocolError, TelemetryMessage};
pub use ws::WebSocketConnector;
