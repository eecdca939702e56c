//! # Near-field Rig Motion Control
//!
//! Motion-controller layer for a laboratory near-field measurement rig: a three
//! axis stepper stage driven through a DMC-style motion controller. Callers
//! (a GUI, the `nearfield` CLI, an automated sweep) issue non-blocking requests
//! to a [`MotionController`]; a dedicated background thread talks to the
//! hardware, tracks per-axis state, reacts to limit switches and recovers from
//! controller faults.
//!
//! ## Crate Structure
//!
//! - **`adapters`**: the byte-level [`Transport`](adapters::Transport) trait, the
//!   TCP/serial controller transport and a simulated controller for tests.
//! - **`protocol`**: typed controller commands and queries over a transport.
//! - **`axis`**: axis/channel naming and the counts-per-centimetre motor model.
//! - **`controller`**: the public handle, request queue, background loop, homing
//!   and fault handling.
//! - **`sweep`**: serpentine spatial sweeps driven through blocking moves.
//! - **`config`**: layered configuration loaded with `figment`.
//! - **`logging`**: `tracing` subscriber setup.
//! - **`error`**: crate error types.

pub mod adapters;
pub mod axis;
pub mod config;
pub mod controller;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod sweep;

pub use axis::{Axis, AxisModel};
pub use config::RigConfig;
pub use controller::{MotionController, RigSnapshot, Status};
pub use error::{RigError, RigResult};
