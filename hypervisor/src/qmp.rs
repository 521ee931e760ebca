//! QEMU Machine Protocol client.
//!
//! QMP is newline-delimited JSON over a unix socket. The server greets
//! first; `qmp_capabilities` must be the first command of the session.
//! A reader task classifies every incoming line and routes command
//! results back to [`QmpSession::execute`] and asynchronous events into
//! a queue drained by [`QmpSession::wait_for_event`].

use crate::error::QmpError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

const CAPABILITIES: &str = "qmp_capabilities";

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Message {
    Greeting {
        #[serde(rename = "QMP")]
        qmp: Value,
    },
    Return {
        #[serde(rename = "return")]
        value: Value,
        id: Option<u64>,
    },
    Error {
        error: ErrorBody,
        id: Option<u64>,
    },
    Event {
        event: String,
        #[serde(default)]
        data: Value,
    },
}

#[derive(Debug, Clone, Deserialize)]
struct ErrorBody {
    class: String,
    desc: String,
}

#[derive(Debug, Serialize)]
struct Command<'a> {
    execute: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    arguments: Option<Value>,
    id: u64,
}

#[derive(Debug)]
struct Response {
    id: Option<u64>,
    result: Result<Value, ErrorBody>,
}

/// An asynchronous notification from QEMU.
#[derive(Debug, Clone, PartialEq)]
pub struct QmpEvent {
    pub name: String,
    pub data: Value,
}

/// Resolves once the QMP connection is gone, either because QEMU closed
/// it or because [`QmpSession::close`] was called. Dropping the session
/// does neither: the reader keeps watching the socket until QEMU exits.
#[derive(Debug, Clone)]
pub struct Disconnected(watch::Receiver<bool>);

impl Disconnected {
    pub async fn wait(&mut self) {
        if self.0.wait_for(|gone| *gone).await.is_err() {
            // reader aborted without reaching EOF; QEMU may still be up
            std::future::pending::<()>().await;
        }
    }

    pub fn is_disconnected(&self) -> bool {
        *self.0.borrow()
    }
}

pub struct QmpSession {
    writer: OwnedWriteHalf,
    responses: mpsc::UnboundedReceiver<Response>,
    events: mpsc::UnboundedReceiver<QmpEvent>,
    disconnect: Arc<watch::Sender<bool>>,
    reader: JoinHandle<()>,
    negotiated: bool,
    next_id: u64,
}

impl QmpSession {
    /// Connect to the QMP socket and consume the server greeting.
    pub async fn connect(path: &Path) -> Result<(Self, Disconnected), QmpError> {
        let stream = UnixStream::connect(path).await?;
        let (read_half, writer) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        let greeting = lines.next_line().await?.ok_or(QmpError::Disconnected)?;
        match serde_json::from_str::<Message>(&greeting)? {
            Message::Greeting { qmp } => {
                let version = qmp.pointer("/version/qemu").cloned().unwrap_or_default();
                tracing::info!(socket = %path.display(), %version, "QMP connected");
            }
            other => {
                return Err(QmpError::Protocol(format!(
                    "expected greeting, got {other:?}"
                )));
            }
        }

        let (responses_tx, responses) = mpsc::unbounded_channel();
        let (events_tx, events) = mpsc::unbounded_channel();
        let (disconnect, disconnected) = watch::channel(false);
        let disconnect = Arc::new(disconnect);

        let reader = tokio::spawn(read_loop(
            lines,
            responses_tx,
            events_tx,
            Arc::clone(&disconnect),
        ));

        let session = Self {
            writer,
            responses,
            events,
            disconnect,
            reader,
            negotiated: false,
            next_id: 0,
        };
        Ok((session, Disconnected(disconnected)))
    }

    pub fn is_negotiated(&self) -> bool {
        self.negotiated
    }

    /// Leave capabilities negotiation mode. Must precede every other command.
    pub async fn capabilities(&mut self) -> Result<(), QmpError> {
        self.execute(CAPABILITIES, None).await?;
        self.negotiated = true;
        Ok(())
    }

    /// Send a command and wait for its result.
    pub async fn execute(
        &mut self,
        command: &str,
        arguments: Option<Value>,
    ) -> Result<Value, QmpError> {
        if !self.negotiated && command != CAPABILITIES {
            return Err(QmpError::CapabilitiesNotNegotiated {
                command: command.to_string(),
            });
        }

        self.next_id += 1;
        let id = self.next_id;
        let mut line = serde_json::to_vec(&Command {
            execute: command,
            arguments,
            id,
        })?;
        line.push(b'\n');

        tracing::debug!(command, id, "QMP execute");
        if let Err(e) = self.writer.write_all(&line).await {
            return Err(match e.kind() {
                ErrorKind::BrokenPipe | ErrorKind::ConnectionReset | ErrorKind::NotConnected => {
                    QmpError::Disconnected
                }
                _ => QmpError::Io(e),
            });
        }

        while let Some(response) = self.responses.recv().await {
            // results of abandoned commands are skipped
            if response.id.is_some_and(|r| r != id) {
                continue;
            }
            return response.result.map_err(|error| QmpError::Command {
                command: command.to_string(),
                class: error.class,
                desc: error.desc,
            });
        }
        Err(QmpError::Disconnected)
    }

    /// Next event named `name`, including ones that arrived earlier.
    pub async fn wait_for_event(&mut self, name: &str) -> Result<QmpEvent, QmpError> {
        while let Some(event) = self.events.recv().await {
            if event.name == name {
                return Ok(event);
            }
        }
        Err(QmpError::Disconnected)
    }

    /// Ask the guest to power off and wait until QEMU reports `SHUTDOWN`.
    pub async fn system_powerdown(&mut self) -> Result<(), QmpError> {
        match self.execute("system_powerdown", None).await {
            Ok(_) | Err(QmpError::Disconnected) => {}
            Err(e) => return Err(e),
        }
        match self.wait_for_event("SHUTDOWN").await {
            Ok(_) | Err(QmpError::Disconnected) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Pause guest execution.
    pub async fn stop(&mut self) -> Result<(), QmpError> {
        self.execute("stop", None).await.map(|_| ())
    }

    /// Terminate QEMU immediately.
    pub async fn quit(&mut self) -> Result<(), QmpError> {
        match self.execute("quit", None).await {
            Ok(_) | Err(QmpError::Disconnected) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Close the connection; waiters on [`Disconnected`] are released.
    pub async fn close(&mut self) {
        let _ = self.writer.shutdown().await;
        self.reader.abort();
        self.disconnect.send_replace(true);
    }
}

async fn read_loop(
    mut lines: Lines<BufReader<OwnedReadHalf>>,
    responses: mpsc::UnboundedSender<Response>,
    events: mpsc::UnboundedSender<QmpEvent>,
    disconnect: Arc<watch::Sender<bool>>,
) {
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!("QMP read failed: {e}");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<Message>(&line) {
            Ok(Message::Return { value, id }) => {
                let _ = responses.send(Response {
                    id,
                    result: Ok(value),
                });
            }
            Ok(Message::Error { error, id }) => {
                let _ = responses.send(Response {
                    id,
                    result: Err(error),
                });
            }
            Ok(Message::Event { event, data }) => {
                tracing::info!(event = %event, data = %data, "QMP event");
                let _ = events.send(QmpEvent { name: event, data });
            }
            Ok(Message::Greeting { .. }) => {
                tracing::warn!("unexpected QMP greeting mid-session");
            }
            Err(e) => {
                tracing::warn!(line = %line, "unparsable QMP message: {e}");
            }
        }
    }

    tracing::info!("QMP connection closed");
    disconnect.send_replace(true);
}
