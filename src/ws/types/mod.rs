pub mod request;
pub mod response;

pub use request::{FrameType, OutboundFrame, topic};
pub use response::{InboundMessage, MessageType, TopicEvent};
