// =============================================================================
// Exchange Transport — signed REST client for the futures venue
// =============================================================================

mod client;
mod rate_limit;

pub use client::ExchangeClient;
pub use rate_limit::RateLimiter;
