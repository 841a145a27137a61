//! Flooding protocol: wire framing, peer sessions, rate limiting, and
//! the per-area transport driver.

pub mod codec;
pub mod flooder;
pub mod message;
pub mod peer;
pub mod rate;
