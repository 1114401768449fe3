pub mod constants;
pub mod envelope;
pub mod error;

pub use constants::PROTOCOL_VERSION;
pub use envelope::{
    CallActionData, CallInviteData, HelloData, Inbound, MsgData, Outbound, RoomData,
};
pub use error::{code, WireError};
