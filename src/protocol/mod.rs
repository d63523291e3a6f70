pub mod codec;
pub mod header;
pub mod message;

pub use codec::{decode_message, encode_message, read_message, write_message};
pub use header::{HEADER_SIZE, Header, MessageType};
pub use message::ControlMessage;
