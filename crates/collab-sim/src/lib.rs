//! collab-sim library: Exposes the simulator for testing.
//!
//! The binary is a thin CLI over `Simulator`, which drives several
//! in-process collaboration sessions with random edits over a lossless,
//! delaying network and checks that they converge.

pub mod network;
pub mod simulator;

pub use network::Network;
pub use simulator::{SimConfig, SimReport, Simulator};
