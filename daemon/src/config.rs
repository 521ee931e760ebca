use clap::Parser;
use cvmm_core::{Disk, GuestSpec, HostVolume, OsImages};
use cvmm_hypervisor::SupervisorConfig;
use cvmm_hypervisor::launcher::DEFAULT_QEMU_BINARY;
use cvmm_hypervisor::supervisor::{DEFAULT_CONSOLE_SOCKET, DEFAULT_QMP_SOCKET};
use cvmm_network::DhcpSettings;
use cvmm_network::resolv::RESOLV_CONF;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "cvmm")]
#[command(about = "Run a VM inside a container, on the container's network identity")]
pub struct Cli {
    /// Guest name, also handed to the guest as its DHCP hostname
    #[arg(long, env = "CVMM_GUEST_NAME", default_value = "flatcar_production_qemu")]
    pub guest_name: String,

    /// Guest memory in QEMU notation
    #[arg(long, env = "CVMM_GUEST_MEMORY", default_value = "1024M")]
    pub guest_memory: String,

    #[arg(long, env = "CVMM_GUEST_CPUS", default_value = "1")]
    pub guest_cpus: String,

    /// Raw image attached as the root disk (id `rootfs`)
    #[arg(long, env = "CVMM_ROOT_DISK")]
    pub root_disk: Option<PathBuf>,

    /// Extra disks as `id:file`, comma separated
    #[arg(long, env = "CVMM_GUEST_ADDITIONAL_DISKS", value_delimiter = ',')]
    pub guest_additional_disks: Vec<Disk>,

    /// Host directories shared over 9p as `tag:path`, comma separated
    #[arg(long, env = "CVMM_GUEST_HOST_VOLUMES", value_delimiter = ',')]
    pub guest_host_volumes: Vec<HostVolume>,

    /// Nameservers handed out instead of the container's resolv.conf entries
    #[arg(long, env = "CVMM_GUEST_DNS_SERVERS", value_delimiter = ',')]
    pub guest_dns_servers: Vec<Ipv4Addr>,

    #[arg(long, env = "CVMM_GUEST_NTP_SERVERS", value_delimiter = ',')]
    pub guest_ntp_servers: Vec<Ipv4Addr>,

    #[arg(long, env = "CVMM_KERNEL")]
    pub kernel: PathBuf,

    #[arg(long, env = "CVMM_INITRD")]
    pub initrd: PathBuf,

    /// Decoded first-boot configuration passed through fw_cfg
    #[arg(long, env = "CVMM_BOOT_CONFIG")]
    pub boot_config: Option<PathBuf>,

    #[arg(long, env = "CVMM_QEMU_BINARY", default_value = DEFAULT_QEMU_BINARY)]
    pub qemu_binary: PathBuf,

    #[arg(long, env = "CVMM_QMP_SOCKET", default_value = DEFAULT_QMP_SOCKET)]
    pub qmp_socket: PathBuf,

    #[arg(long, env = "CVMM_CONSOLE_SOCKET", default_value = DEFAULT_CONSOLE_SOCKET)]
    pub console_socket: PathBuf,

    /// Seconds the guest gets to power off before QEMU is killed
    #[arg(long, env = "CVMM_POWERDOWN_TIMEOUT", default_value_t = 60)]
    pub powerdown_timeout: u64,

    #[arg(long, env = "CVMM_RESOLV_CONF", default_value = RESOLV_CONF)]
    pub resolv_conf: PathBuf,

    /// Log at debug level
    #[arg(long, env = "CVMM_DEBUG")]
    pub debug: bool,
}

impl Cli {
    pub fn guest_spec(&self) -> GuestSpec {
        let mut disks: Vec<Disk> = self.root_disk.iter().cloned().map(Disk::root).collect();
        disks.extend(self.guest_additional_disks.iter().cloned());

        GuestSpec {
            name: self.guest_name.clone(),
            cpus: self.guest_cpus.clone(),
            memory: self.guest_memory.clone(),
            disks,
            os: OsImages {
                kernel: self.kernel.clone(),
                initrd: self.initrd.clone(),
                boot_config: self.boot_config.clone(),
            },
            host_volumes: self.guest_host_volumes.clone(),
            nics: Vec::new(),
        }
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            qemu_binary: self.qemu_binary.clone(),
            qmp_socket: self.qmp_socket.clone(),
            console_socket: self.console_socket.clone(),
            powerdown_timeout: Duration::from_secs(self.powerdown_timeout),
        }
    }

    pub fn dhcp_settings(&self) -> DhcpSettings {
        DhcpSettings {
            dns_servers: self.guest_dns_servers.clone(),
            ntp_servers: self.guest_ntp_servers.clone(),
        }
    }
}
