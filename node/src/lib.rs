//! Peer-driven block synchronization engine.

pub mod chain;
pub mod cli;
pub mod logging;
pub mod metrics;
pub mod p2p;
pub mod storage;
pub mod sync;
pub mod types;

#[cfg(test)]
mod test_utils;
