//! Shared data model for the container VM manager.
//!
//! These types describe the guest the way the configuration layer hands it
//! over, plus the per-interface network transit records produced when the
//! container's addresses are moved onto the guest's TAP devices.

mod error;
mod guest;
mod mac;
mod transit;

pub use error::CoreError;
pub use guest::{Disk, GuestNic, GuestSpec, HostVolume, OsImages};
pub use mac::MacAddr;
pub use transit::{NetworkTransit, RouteEntry};
