pub mod errors;
pub mod frame;
pub mod ids;

pub use errors::{HubError, WriteError};
pub use frame::StreamFormatter;
pub use ids::{ChannelKey, ConnectionId};
