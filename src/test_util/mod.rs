//! Utilities for testing code built on the FNE protocol engine and the router: frame builders, a
//!  transport that records what is sent and lets tests inject datagrams, a handler that
//!  records callbacks, and a link control codec without FEC.

pub mod codec;
pub mod frames;
pub mod handler;
pub mod transport;
