pub mod protocol;
pub mod relay;

pub use protocol::{InputRecord, ParticipantMessage, RelayMessage, PROTOCOL_VERSION};
pub use relay::{LocalRelay, LocalTransport, Transport};
