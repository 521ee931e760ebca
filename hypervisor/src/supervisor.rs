//! VM lifecycle supervision.
//!
//! The [`Supervisor`] builds and launches the VM, negotiates the control
//! channel, then owns every background task until QEMU goes away.

use crate::console;
use crate::error::{HypervisorError, QmpError};
use crate::launcher::{self, DEFAULT_QEMU_BINARY};
use crate::model::{ControlSockets, DeviceModel};
use crate::qmp::{Disconnected, QmpSession};
use cvmm_core::GuestSpec;
use std::fmt;
use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{Signal, SignalKind, signal};
use tokio::sync::Notify;
use tokio::task::{JoinError, JoinSet};

pub const DEFAULT_QMP_SOCKET: &str = "/tmp/qmp-socket";
pub const DEFAULT_CONSOLE_SOCKET: &str = "console.sock";
pub const DEFAULT_POWERDOWN_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorConfig {
    pub qemu_binary: PathBuf,
    pub qmp_socket: PathBuf,
    pub console_socket: PathBuf,
    /// How long a guest gets to power off before QEMU is told to quit.
    pub powerdown_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            qemu_binary: PathBuf::from(DEFAULT_QEMU_BINARY),
            qmp_socket: PathBuf::from(DEFAULT_QMP_SOCKET),
            console_socket: PathBuf::from(DEFAULT_CONSOLE_SOCKET),
            powerdown_timeout: DEFAULT_POWERDOWN_TIMEOUT,
        }
    }
}

impl SupervisorConfig {
    pub fn sockets(&self) -> ControlSockets {
        ControlSockets {
            qmp: self.qmp_socket.clone(),
            console: self.console_socket.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Building,
    Launching,
    AwaitingControlHandshake,
    Running,
    ShuttingDown,
    Terminated,
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SupervisorState::Building => "building",
            SupervisorState::Launching => "launching",
            SupervisorState::AwaitingControlHandshake => "awaiting-control-handshake",
            SupervisorState::Running => "running",
            SupervisorState::ShuttingDown => "shutting-down",
            SupervisorState::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

type TaskOutcome = (String, Result<(), String>);

pub struct Supervisor {
    config: SupervisorConfig,
    state: SupervisorState,
    tasks: JoinSet<TaskOutcome>,
    shutdown_requested: Arc<Notify>,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            config,
            state: SupervisorState::Building,
            tasks: JoinSet::new(),
            shutdown_requested: Arc::new(Notify::new()),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    fn transition(&mut self, next: SupervisorState) {
        tracing::info!(from = %self.state, to = %next, "supervisor state");
        self.state = next;
    }

    /// Run `task` in the background for as long as the VM lives. Its
    /// failure is logged under `name` and does not stop the VM.
    pub fn spawn_task<F, E>(&mut self, name: impl Into<String>, task: F)
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: fmt::Display,
    {
        let name = name.into();
        self.tasks.spawn(async move {
            let result = task.await.map_err(|e| e.to_string());
            (name, result)
        });
    }

    /// Boot the guest and block until QEMU exits.
    pub async fn run(&mut self, guest: &GuestSpec) -> Result<(), HypervisorError> {
        self.transition(SupervisorState::Building);
        let model = DeviceModel::build(guest, &self.config.sockets())?;
        model.verify_boot_files()?;

        self.transition(SupervisorState::Launching);
        launcher::launch(&self.config.qemu_binary, &model.to_args()).await?;

        let (session, disconnected) = self.handshake().await?;
        self.supervise(session, disconnected).await
    }

    async fn handshake(&mut self) -> Result<(QmpSession, Disconnected), HypervisorError> {
        self.transition(SupervisorState::AwaitingControlHandshake);
        let (mut session, disconnected) = QmpSession::connect(&self.config.qmp_socket).await?;
        session.capabilities().await?;
        Ok((session, disconnected))
    }

    async fn supervise(
        &mut self,
        session: QmpSession,
        mut disconnected: Disconnected,
    ) -> Result<(), HypervisorError> {
        let signals = ShutdownSignals::register()?;
        self.transition(SupervisorState::Running);

        self.spawn_task("console", console::stream(self.config.console_socket.clone()));
        self.spawn_task(
            "signals",
            signal_loop(
                session,
                signals,
                self.config.powerdown_timeout,
                Arc::clone(&self.shutdown_requested),
            ),
        );

        let shutdown_requested = Arc::clone(&self.shutdown_requested);
        loop {
            tokio::select! {
                _ = disconnected.wait() => break,
                _ = shutdown_requested.notified(), if self.state == SupervisorState::Running => {
                    self.transition(SupervisorState::ShuttingDown);
                }
                Some(joined) = self.tasks.join_next() => log_task(joined),
            }
        }

        if self.state != SupervisorState::ShuttingDown {
            self.transition(SupervisorState::ShuttingDown);
        }
        tracing::info!(remaining = self.tasks.len(), "QEMU disconnected, stopping tasks");
        self.tasks.shutdown().await;
        self.transition(SupervisorState::Terminated);
        Ok(())
    }
}

fn log_task(joined: Result<TaskOutcome, JoinError>) {
    match joined {
        Ok((name, Ok(()))) => tracing::info!(task = %name, "task finished"),
        Ok((name, Err(e))) => tracing::error!(task = %name, "task failed: {e}"),
        Err(e) if e.is_cancelled() => {}
        Err(e) => tracing::error!("task panicked: {e}"),
    }
}

/// Power the guest off, escalating to `quit` on failure or timeout, then
/// close the control channel.
pub async fn graceful_shutdown(session: &mut QmpSession, timeout: Duration) {
    let outcome = match tokio::time::timeout(timeout, session.system_powerdown()).await {
        Ok(result) => result,
        Err(_) => Err(QmpError::Timeout {
            command: "system_powerdown".to_string(),
            secs: timeout.as_secs(),
        }),
    };

    match outcome {
        Ok(()) => tracing::info!("guest powered down"),
        Err(e) => {
            tracing::error!("QEMU shutdown failed with error: {e}");
            if let Err(e) = session.quit().await {
                tracing::error!("QEMU quit failed with error: {e}");
            }
        }
    }

    session.close().await;
}

/// Handlers for the signals the daemon maps onto QMP commands.
struct ShutdownSignals {
    terminate: Signal,
    interrupt: Signal,
    quit: Signal,
}

impl ShutdownSignals {
    fn register() -> io::Result<Self> {
        Ok(Self {
            terminate: signal(SignalKind::terminate())?,
            interrupt: signal(SignalKind::interrupt())?,
            quit: signal(SignalKind::quit())?,
        })
    }
}

/// SIGQUIT pauses the guest; SIGTERM and SIGINT power it down.
async fn signal_loop(
    mut session: QmpSession,
    mut signals: ShutdownSignals,
    timeout: Duration,
    shutdown_requested: Arc<Notify>,
) -> Result<(), HypervisorError> {
    loop {
        tokio::select! {
            _ = signals.terminate.recv() => tracing::info!("caught SIGTERM, requesting clean shutdown"),
            _ = signals.interrupt.recv() => tracing::info!("caught SIGINT, requesting clean shutdown"),
            _ = signals.quit.recv() => {
                tracing::info!("caught SIGQUIT, stopping guest");
                if let Err(e) = session.stop().await {
                    tracing::error!("QEMU stop failed with error: {e}");
                }
                continue;
            }
        }

        shutdown_requested.notify_one();
        graceful_shutdown(&mut session, timeout).await;
        return Ok(());
    }
}
