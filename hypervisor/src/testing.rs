//! Scripted QMP server for the session and supervisor tests.

use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

const GREETING: &str = r#"{"QMP": {"version": {"qemu": {"micro": 0, "minor": 2, "major": 8}, "package": ""}, "capabilities": ["oob"]}}"#;

/// What the fake answers to one command, in order.
#[derive(Debug, Clone, Copy)]
pub enum Reply {
    Return,
    Error(&'static str),
    Event(&'static str),
    /// Close the connection without answering.
    HangUp,
}

pub struct FakeQmp {
    path: PathBuf,
    handle: JoinHandle<Vec<String>>,
    release: Arc<Notify>,
}

impl FakeQmp {
    pub fn start<F>(dir: &TempDir, script: F) -> Self
    where
        F: Fn(&str) -> Vec<Reply> + Send + 'static,
    {
        let path = dir.path().join("qmp.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let release = Arc::new(Notify::new());
        let hold = Arc::clone(&release);

        let handle = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read, mut write) = stream.into_split();
            write
                .write_all(format!("{GREETING}\n").as_bytes())
                .await
                .unwrap();

            let mut commands = Vec::new();
            let mut lines = BufReader::new(read).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let request: Value = serde_json::from_str(&line).unwrap();
                let command = request["execute"].as_str().unwrap().to_string();
                let id = request["id"].clone();
                commands.push(command.clone());

                for reply in script(&command) {
                    let message = match reply {
                        Reply::Return => json!({"return": {}, "id": id}),
                        Reply::Error(class) => json!({
                            "error": {"class": class, "desc": format!("{command} refused")},
                            "id": id,
                        }),
                        Reply::Event(name) => json!({
                            "event": name,
                            "data": {"guest": true},
                            "timestamp": {"seconds": 0, "microseconds": 0},
                        }),
                        Reply::HangUp => return commands,
                    };
                    let _ = write.write_all(format!("{message}\n").as_bytes()).await;
                }
            }
            // like QEMU, keep our end open after the client stops writing
            hold.notified().await;
            commands
        });

        Self {
            path,
            handle,
            release,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Commands received, once the client has gone away. Closes the
    /// server end of the connection.
    pub async fn commands(self) -> Vec<String> {
        self.release.notify_one();
        self.handle.await.unwrap()
    }
}
