// =============================================================================
// Stream Transport — single multiplexed market-data connection
// =============================================================================

mod transport;

pub use transport::{StreamConfig, StreamEvent, StreamHandle, StreamTransport};
