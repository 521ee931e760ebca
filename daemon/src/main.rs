mod config;

use clap::Parser;
use config::Cli;
use cvmm_hypervisor::Supervisor;
use cvmm_network::{KernelLinks, NetError, prepare_servers, setup_interfaces};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    let mut guest = cli.guest_spec();
    tracing::info!(guest = %guest.name, "preparing guest network");

    // netlink and ioctl calls block; keep them off the runtime threads
    let (guest, transits) = tokio::task::spawn_blocking(move || {
        let mut links = KernelLinks::new()?;
        let transits = setup_interfaces(&mut links, &mut guest)?;
        Ok::<_, NetError>((guest, transits))
    })
    .await??;

    let servers = prepare_servers(
        &guest.name,
        transits,
        &cli.dhcp_settings(),
        &cli.resolv_conf,
    )?;

    let mut supervisor = Supervisor::new(cli.supervisor_config());
    for server in servers {
        tracing::debug!(transit = %serde_json::to_string(server.transit())?, "interface transit");
        let name = format!("dhcp-{}", server.bridge());
        supervisor.spawn_task(name, server.run());
    }

    tracing::debug!(spec = %serde_json::to_string(&guest)?, "guest spec");
    supervisor.run(&guest).await?;
    tracing::info!(guest = %guest.name, "guest terminated");

    Ok(())
}

fn init_tracing(debug: bool) {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
