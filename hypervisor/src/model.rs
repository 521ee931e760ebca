//! QEMU device model for a guest.
//!
//! [`DeviceModel::build`] turns a [`GuestSpec`] into the full machine
//! description without touching the filesystem; [`DeviceModel::to_args`]
//! renders it as a QEMU command line.

use crate::error::HypervisorError;
use cvmm_core::{GuestSpec, MacAddr};
use std::fmt;
use std::path::PathBuf;

const MACHINE_TYPE: &str = "q35";
const ACCELERATOR: &str = "kvm";
const CPU_MODEL: &str = "host,pmu=off";
const VGA: &str = "none";

const BOOT_CONFIG_FW_CFG: &str = "opt/org.flatcar-linux/config";

/// Appended after the root and first-boot parameters.
const BASELINE_KERNEL_PARAMS: &[(&str, &str)] = &[
    ("tsc", "reliable"),
    ("no_timer_check", ""),
    ("rcupdate.rcu_expedited", "1"),
    ("i8042.direct", "1"),
    ("i8042.dumbkbd", "1"),
    ("i8042.nopnp", "1"),
    ("i8042.noaux", "1"),
    ("noreplace-smp", ""),
    ("reboot", "k"),
    // hvc consoles are read back through the console socket
    ("console", "hvc0"),
    ("console", "hvc1"),
    ("cryptomgr.notests", ""),
    ("net.ifnames", "0"),
    ("pci", "lastbus=0"),
];

/// Host-side sockets QEMU serves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlSockets {
    pub qmp: PathBuf,
    pub console: PathBuf,
}

/// Ordered `key=value` kernel command line entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KernelParams(Vec<(String, String)>);

impl KernelParams {
    pub fn push(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.push((key.into(), value.into()));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl fmt::Display for KernelParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (key, value)) in self.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            if value.is_empty() {
                f.write_str(key)?;
            } else {
                write!(f, "{key}={value}")?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Device {
    /// virtio-net backed by an existing TAP.
    Net { tap: String, mac: MacAddr },
    /// virtio-blk raw image; the id doubles as the serial.
    Block { id: String, file: PathBuf },
    /// virtio-9p share.
    Fs {
        id: String,
        path: PathBuf,
        mount_tag: String,
    },
    SerialController { id: String },
    Console {
        id: String,
        chardev: String,
        socket: PathBuf,
    },
    Rng { id: String, source: PathBuf },
}

impl Device {
    fn push_args(&self, args: &mut Vec<String>) {
        match self {
            Device::Net { tap, mac } => {
                push(
                    args,
                    "-netdev",
                    format!("tap,id={tap},ifname={tap},script=no,downscript=no"),
                );
                push(
                    args,
                    "-device",
                    format!("virtio-net-pci,netdev={tap},mac={mac}"),
                );
            }
            Device::Block { id, file } => {
                push(
                    args,
                    "-drive",
                    format!(
                        "id={id},file={},aio=threads,format=raw,if=none",
                        file.display()
                    ),
                );
                push(
                    args,
                    "-device",
                    format!("virtio-blk-pci,drive={id},serial={id}"),
                );
            }
            Device::Fs {
                id,
                path,
                mount_tag,
            } => {
                push(
                    args,
                    "-fsdev",
                    format!("local,id={id},path={},security_model=none", path.display()),
                );
                push(
                    args,
                    "-device",
                    format!("virtio-9p-pci,fsdev={id},mount_tag={mount_tag}"),
                );
            }
            Device::SerialController { id } => {
                push(args, "-device", format!("virtio-serial-pci,id={id}"));
            }
            Device::Console {
                id,
                chardev,
                socket,
            } => {
                push(
                    args,
                    "-chardev",
                    format!(
                        "socket,id={chardev},path={},server=on,wait=off",
                        socket.display()
                    ),
                );
                push(
                    args,
                    "-device",
                    format!("virtconsole,chardev={chardev},id={id}"),
                );
            }
            Device::Rng { id, source } => {
                push(
                    args,
                    "-object",
                    format!("rng-random,id={id},filename={}", source.display()),
                );
                push(args, "-device", format!("virtio-rng-pci,rng={id}"));
            }
        }
    }
}

/// A firmware configuration blob exposed to the guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FwCfg {
    pub name: String,
    pub file: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceModel {
    pub name: String,
    pub memory: String,
    pub cpus: u32,
    pub kernel: PathBuf,
    pub initrd: PathBuf,
    pub kernel_params: KernelParams,
    pub devices: Vec<Device>,
    pub fw_cfg: Vec<FwCfg>,
    pub qmp_socket: PathBuf,
}

impl DeviceModel {
    pub fn build(guest: &GuestSpec, sockets: &ControlSockets) -> Result<Self, HypervisorError> {
        let cpus = parse_cpus(&guest.cpus)?;

        let mut kernel_params = KernelParams::default();
        if let Some(root) = guest.root_disk() {
            kernel_params.push("root", format!("/dev/disk/by-id/virtio-{}", root.id));
        }
        if guest.os.boot_config.is_some() {
            kernel_params.push("flatcar.first_boot", "1");
        }
        for (key, value) in BASELINE_KERNEL_PARAMS {
            kernel_params.push(*key, *value);
        }

        let mut devices = Vec::new();
        devices.extend(guest.nics.iter().map(|nic| Device::Net {
            tap: nic.tap.clone(),
            mac: nic.mac,
        }));
        devices.extend(guest.disks.iter().map(|disk| Device::Block {
            id: disk.id.clone(),
            file: disk.file.clone(),
        }));
        devices.extend(
            guest
                .host_volumes
                .iter()
                .enumerate()
                .map(|(i, volume)| Device::Fs {
                    id: format!("fsdev{i}"),
                    path: volume.host_path.clone(),
                    mount_tag: volume.mount_tag.clone(),
                }),
        );
        devices.push(Device::SerialController {
            id: "serial0".to_string(),
        });
        devices.push(Device::Console {
            id: "console0".to_string(),
            chardev: "charconsole0".to_string(),
            socket: sockets.console.clone(),
        });
        devices.push(Device::Rng {
            id: "rng0".to_string(),
            source: PathBuf::from("/dev/urandom"),
        });

        let fw_cfg = guest
            .os
            .boot_config
            .iter()
            .map(|file| FwCfg {
                name: BOOT_CONFIG_FW_CFG.to_string(),
                file: file.clone(),
            })
            .collect();

        Ok(Self {
            name: guest.name.clone(),
            memory: guest.memory.clone(),
            cpus,
            kernel: guest.os.kernel.clone(),
            initrd: guest.os.initrd.clone(),
            kernel_params,
            devices,
            fw_cfg,
            qmp_socket: sockets.qmp.clone(),
        })
    }

    /// Fail unless the kernel and initrd are present on local disk.
    pub fn verify_boot_files(&self) -> Result<(), HypervisorError> {
        for path in [&self.kernel, &self.initrd] {
            if !path.exists() {
                return Err(HypervisorError::MissingFile(path.clone()));
            }
        }
        Ok(())
    }

    pub fn to_args(&self) -> Vec<String> {
        let mut args = Vec::new();

        push(&mut args, "-name", self.name.clone());
        push(
            &mut args,
            "-machine",
            format!("{MACHINE_TYPE},accel={ACCELERATOR}"),
        );
        push(&mut args, "-cpu", CPU_MODEL.to_string());
        push(
            &mut args,
            "-qmp",
            format!("unix:{},server=on,wait=off", self.qmp_socket.display()),
        );
        push(&mut args, "-m", self.memory.clone());
        push(&mut args, "-smp", self.cpus.to_string());

        for device in &self.devices {
            device.push_args(&mut args);
        }

        push(&mut args, "-kernel", self.kernel.display().to_string());
        push(&mut args, "-initrd", self.initrd.display().to_string());
        push(&mut args, "-append", self.kernel_params.to_string());

        for cfg in &self.fw_cfg {
            push(
                &mut args,
                "-fw_cfg",
                format!("name={},file={}", cfg.name, cfg.file.display()),
            );
        }

        push(&mut args, "-vga", VGA.to_string());
        args.extend(
            ["-no-user-config", "-nodefaults", "-nographic", "-daemonize"]
                .map(String::from),
        );

        args
    }
}

fn parse_cpus(cpus: &str) -> Result<u32, HypervisorError> {
    match cpus.trim().parse::<u32>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(HypervisorError::InvalidCpuCount(cpus.to_string())),
    }
}

fn push(args: &mut Vec<String>, flag: &str, value: String) {
    args.push(flag.to_string());
    args.push(value);
}

#[cfg(test)]
mod tests {
    use super::*;
    use cvmm_core::{Disk, GuestNic, HostVolume, OsImages};
    use std::net::Ipv4Addr;

    fn sockets() -> ControlSockets {
        ControlSockets {
            qmp: PathBuf::from("/tmp/qmp-socket"),
            console: PathBuf::from("console.sock"),
        }
    }

    fn guest() -> GuestSpec {
        GuestSpec {
            name: "flatcar".into(),
            cpus: "2".into(),
            memory: "2048M".into(),
            disks: vec![
                Disk::root("/var/lib/images/rootfs.img"),
                "data:/var/lib/images/data.img".parse().unwrap(),
            ],
            os: OsImages {
                kernel: PathBuf::from("/boot/vmlinuz"),
                initrd: PathBuf::from("/boot/initrd"),
                boot_config: None,
            },
            host_volumes: vec![HostVolume {
                mount_tag: "shared".into(),
                host_path: PathBuf::from("/srv/shared"),
            }],
            nics: vec![GuestNic {
                tap: "tap-eth0".into(),
                mac: "02:42:c0:a8:01:05".parse().unwrap(),
                ip: Ipv4Addr::new(192, 168, 1, 5),
                gateway: Ipv4Addr::new(192, 168, 1, 1),
            }],
        }
    }

    fn value_after<'a>(args: &'a [String], flag: &str) -> Vec<&'a str> {
        args.windows(2)
            .filter(|w| w[0] == flag)
            .map(|w| w[1].as_str())
            .collect()
    }

    #[test]
    fn test_kernel_params_order() {
        let model = DeviceModel::build(&guest(), &sockets()).unwrap();
        let params = model.kernel_params.to_string();

        assert!(params.starts_with("root=/dev/disk/by-id/virtio-rootfs tsc=reliable no_timer_check "));
        assert!(params.ends_with("console=hvc0 console=hvc1 cryptomgr.notests net.ifnames=0 pci=lastbus=0"));
        assert!(!params.contains("flatcar.first_boot"));
    }

    #[test]
    fn test_boot_config_adds_first_boot_and_fw_cfg() {
        let mut guest = guest();
        guest.os.boot_config = Some(PathBuf::from("/tmp/ignition.json"));

        let model = DeviceModel::build(&guest, &sockets()).unwrap();

        let params: Vec<_> = model.kernel_params.iter().take(2).collect();
        assert_eq!(
            params,
            vec![
                ("root", "/dev/disk/by-id/virtio-rootfs"),
                ("flatcar.first_boot", "1")
            ]
        );
        assert_eq!(
            value_after(&model.to_args(), "-fw_cfg"),
            vec!["name=opt/org.flatcar-linux/config,file=/tmp/ignition.json"]
        );
    }

    #[test]
    fn test_device_order() {
        let model = DeviceModel::build(&guest(), &sockets()).unwrap();
        let kinds: Vec<&str> = model
            .devices
            .iter()
            .map(|d| match d {
                Device::Net { .. } => "net",
                Device::Block { .. } => "block",
                Device::Fs { .. } => "fs",
                Device::SerialController { .. } => "serial",
                Device::Console { .. } => "console",
                Device::Rng { .. } => "rng",
            })
            .collect();

        assert_eq!(
            kinds,
            vec!["net", "block", "block", "fs", "serial", "console", "rng"]
        );
    }

    #[test]
    fn test_invalid_cpu_count() {
        for cpus in ["", "two", "0", "-1"] {
            let mut guest = guest();
            guest.cpus = cpus.into();
            assert!(matches!(
                DeviceModel::build(&guest, &sockets()),
                Err(HypervisorError::InvalidCpuCount(_))
            ));
        }
    }

    #[test]
    fn test_command_line() {
        let args = DeviceModel::build(&guest(), &sockets()).unwrap().to_args();

        assert_eq!(value_after(&args, "-machine"), vec!["q35,accel=kvm"]);
        assert_eq!(value_after(&args, "-cpu"), vec!["host,pmu=off"]);
        assert_eq!(value_after(&args, "-m"), vec!["2048M"]);
        assert_eq!(value_after(&args, "-smp"), vec!["2"]);
        assert_eq!(
            value_after(&args, "-qmp"),
            vec!["unix:/tmp/qmp-socket,server=on,wait=off"]
        );
        assert_eq!(
            value_after(&args, "-netdev"),
            vec!["tap,id=tap-eth0,ifname=tap-eth0,script=no,downscript=no"]
        );
        assert_eq!(
            value_after(&args, "-device"),
            vec![
                "virtio-net-pci,netdev=tap-eth0,mac=02:42:c0:a8:01:05",
                "virtio-blk-pci,drive=rootfs,serial=rootfs",
                "virtio-blk-pci,drive=data,serial=data",
                "virtio-9p-pci,fsdev=fsdev0,mount_tag=shared",
                "virtio-serial-pci,id=serial0",
                "virtconsole,chardev=charconsole0,id=console0",
                "virtio-rng-pci,rng=rng0",
            ]
        );
        assert_eq!(
            value_after(&args, "-chardev"),
            vec!["socket,id=charconsole0,path=console.sock,server=on,wait=off"]
        );
        assert_eq!(
            value_after(&args, "-fsdev"),
            vec!["local,id=fsdev0,path=/srv/shared,security_model=none"]
        );
        assert_eq!(value_after(&args, "-vga"), vec!["none"]);
        assert!(args.ends_with(&[
            "-no-user-config".to_string(),
            "-nodefaults".to_string(),
            "-nographic".to_string(),
            "-daemonize".to_string(),
        ]));
    }

    #[test]
    fn test_missing_boot_files() {
        let dir = tempfile::TempDir::new().unwrap();
        let kernel = dir.path().join("vmlinuz");
        std::fs::write(&kernel, b"kernel").unwrap();

        let mut guest = guest();
        guest.os.kernel = kernel;
        guest.os.initrd = dir.path().join("initrd");
        let model = DeviceModel::build(&guest, &sockets()).unwrap();

        match model.verify_boot_files() {
            Err(HypervisorError::MissingFile(path)) => assert_eq!(path, guest.os.initrd),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
