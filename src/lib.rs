pub mod config;
pub mod connection;
pub mod error;
pub mod game;
pub mod session;
pub mod types;

pub use connection::{ChannelEvent, ConnectionManager, Envelope};
pub use error::{ConfigError, ConnectionError, ProtocolError, Rejected};
pub use game::{GameCommand, GameHandle, LinkStatus, SessionView};
pub use session::{Phase, Readiness, Role, Session, Status, Transition};
pub use types::{ClientIntent, ServerEvent, WireStatus};
