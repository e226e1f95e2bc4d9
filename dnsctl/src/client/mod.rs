mod channel;
mod elevation;

pub use channel::{ChannelManager, EscalationOutcome, Operation};
pub use elevation::{ElevatedRunner, ServiceInstaller};
