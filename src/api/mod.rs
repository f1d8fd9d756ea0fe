mod handler;
mod ratelimit;
mod specs;

pub use handler::{router, ApiState};
pub use ratelimit::ClientRateLimiter;
pub use specs::{decode_specs, Specs};
