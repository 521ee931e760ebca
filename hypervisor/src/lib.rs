//! QEMU launch and lifecycle supervision for the guest VM.

pub mod console;
mod error;
pub mod launcher;
pub mod model;
pub mod qmp;
pub mod supervisor;
#[cfg(test)]
pub(crate) mod testing;

pub use error::{HypervisorError, QmpError};
pub use model::{ControlSockets, DeviceModel};
pub use qmp::{Disconnected, QmpSession};
pub use supervisor::{Supervisor, SupervisorConfig, SupervisorState};
