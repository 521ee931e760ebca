use crate::error::CoreError;
use crate::mac::MacAddr;
use serde::Serialize;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::str::FromStr;

/// Everything the supervisor needs to know about the guest.
#[derive(Debug, Clone, Default, Serialize)]
pub struct GuestSpec {
    pub name: String,
    /// CPU count as provided by the operator; parsed when the device model is built.
    pub cpus: String,
    /// Memory size in QEMU notation, e.g. `1024M`.
    pub memory: String,
    pub disks: Vec<Disk>,
    pub os: OsImages,
    pub host_volumes: Vec<HostVolume>,
    /// Filled in by the interface transit, one entry per transited interface.
    pub nics: Vec<GuestNic>,
}

impl GuestSpec {
    /// The first disk flagged as the root filesystem.
    pub fn root_disk(&self) -> Option<&Disk> {
        self.disks.iter().find(|d| d.is_root)
    }
}

/// Boot artifacts, guaranteed to be on local disk before launch.
#[derive(Debug, Clone, Default, Serialize)]
pub struct OsImages {
    pub kernel: PathBuf,
    pub initrd: PathBuf,
    /// Decoded first-boot configuration (ignition), if any.
    pub boot_config: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Disk {
    pub id: String,
    pub file: PathBuf,
    pub is_root: bool,
}

impl Disk {
    pub fn root(file: impl Into<PathBuf>) -> Self {
        Self {
            id: "rootfs".to_string(),
            file: file.into(),
            is_root: true,
        }
    }
}

impl FromStr for Disk {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((id, file)) if !id.is_empty() && !file.is_empty() => Ok(Self {
                id: id.to_string(),
                file: PathBuf::from(file),
                is_root: false,
            }),
            _ => Err(CoreError::InvalidDisk(s.to_string())),
        }
    }
}

/// A host directory shared with the guest over 9p.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostVolume {
    pub mount_tag: String,
    pub host_path: PathBuf,
}

impl FromStr for HostVolume {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((tag, path)) if !tag.is_empty() && !path.is_empty() => Ok(Self {
                mount_tag: tag.to_string(),
                host_path: PathBuf::from(path),
            }),
            _ => Err(CoreError::InvalidHostVolume(s.to_string())),
        }
    }
}

/// Guest-side view of a transited interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GuestNic {
    pub tap: String,
    pub mac: MacAddr,
    pub ip: Ipv4Addr,
    pub gateway: Ipv4Addr,
}
