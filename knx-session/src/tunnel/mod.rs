//! Tunneling connection management

pub mod sequence;
pub mod session;
pub mod state;
pub mod statistics;

pub use sequence::SequenceCounter;
pub use session::{TunnelSettings, TunnelingSession};
pub use state::TunnelState;
pub use statistics::TunnelStatistics;
