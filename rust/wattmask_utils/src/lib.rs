// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Utility collection for the wattmask runtime
//!
//! wattmask is a closed-loop power-management runtime which shapes the
//! observable power signature of a multi-core host by periodically reading
//! hardware telemetry and driving actuators (CPU frequency, forced-idle
//! injection, a synthetic CPU-bound workload) toward synthetic target
//! waveforms.
//!
//! This crate holds the parts of the runtime that do not touch the host:
//!
//! - `misc`: one-shot sysfs/shm file helpers and cpulist parsing.
//! - `linalg`: dense vector/matrix arithmetic for the state-space controller.
//! - `graph`: the port/pin/wire dataflow graph the runtime modules are
//!   composed with.
//! - `signal`: bounded waveform generation for mask targets and
//!   system-identification excitation.

pub mod misc;
pub use misc::read_from_file;
pub use misc::write_to_file;
pub use misc::ROOT_PREFIX;

pub mod linalg;
pub use linalg::Matrix;
pub use linalg::Vector;

pub mod graph;
pub use graph::PortArena;
pub use graph::PortId;
pub use graph::PortKind;
pub use graph::Wire;

pub mod signal;
pub use signal::Param;
pub use signal::SignalGenerator;
pub use signal::Waveform;
