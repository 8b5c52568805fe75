//! Coordination core of a distributed UWB ranging node.
//!
//! Each node drives a DW1000-generation IEEE 802.15.4 UWB radio, discovers a
//! small set of neighbours, keeps short-lived connections alive and runs the
//! six-message two-way-ranging exchange against them. The measured pairwise
//! distances are folded into a local Euclidean distance matrix that a solver
//! (out of scope here) can turn into 3D positions.
//!
//! The crate is hardware-agnostic: the register-level chip driver is reached
//! through the [`hal::DwChip`] trait, so the whole stack runs unmodified
//! against a scripted chip on the host. See [`node`] for how the pieces map
//! onto RTOS tasks on a real board.

#![no_std]
#![deny(unsafe_code)]

#[cfg(test)]
#[macro_use]
extern crate std;

#[macro_use]
mod fmt;

pub mod config;
pub mod edm;
pub mod engine;
pub mod events;
pub mod hal;
pub mod mac;
pub mod node;
pub mod peers;
pub mod radio;

#[cfg(test)]
pub(crate) mod sim;

pub use config::Calibration;
pub use hal::{DwChip, DwHal, TxMode};
pub use node::{IrqLatch, LocState, Node};
