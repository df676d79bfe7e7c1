pub mod callbacks;
pub mod config;
#[allow(clippy::module_inception)]
pub mod session;

pub use callbacks::SessionCallbacks;
pub use config::SessionConfig;
pub use session::{EntityTypeBuilder, ExitReason, Plugin, Session, SessionState};
