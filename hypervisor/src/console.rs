//! Guest console forwarding.

use std::io;
use std::path::Path;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::net::UnixStream;

/// Log target of lines written by the guest on its console.
pub const CONSOLE_TARGET: &str = "guest_console";

/// Connect to the console socket and log every guest line until EOF.
pub async fn stream(path: impl AsRef<Path>) -> io::Result<()> {
    let path = path.as_ref();
    let stream = UnixStream::connect(path).await.map_err(|e| {
        io::Error::new(
            e.kind(),
            format!("connect to console {}: {e}", path.display()),
        )
    })?;

    forward(BufReader::new(stream), |line| {
        tracing::info!(target: CONSOLE_TARGET, "{line}");
    })
    .await?;

    tracing::info!("console watcher quits");
    Ok(())
}

/// Hand every line of `reader` to `sink` until EOF, returning the line count.
///
/// Console output is raw bytes; invalid UTF-8 is replaced, never fatal.
pub async fn forward<R, F>(mut reader: R, mut sink: F) -> io::Result<usize>
where
    R: AsyncBufRead + Unpin,
    F: FnMut(&str),
{
    let mut buf = Vec::new();
    let mut count = 0;

    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf).await? == 0 {
            return Ok(count);
        }
        let line = String::from_utf8_lossy(&buf);
        sink(line.trim_end_matches(['\r', '\n']));
        count += 1;
    }
}
