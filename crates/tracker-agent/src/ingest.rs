use std::future::Future;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{error, info, warn};
use tracker_core::RecordSealer;

use crate::uploader::Uploader;

/// Reads newline-delimited JSON records, seals each one and hands it to the
/// uploader. Stops at end of input, on a read error, or when `interrupt`
/// resolves. Returns how many records were enqueued.
///
/// The caller still owns shutdown; a read error never skips it.
pub async fn forward_ndjson<R, F>(reader: R, sealer: &RecordSealer, uploader: &Uploader, interrupt: F) -> u64
where
    R: AsyncBufRead + Unpin,
    F: Future<Output = ()>,
{
    tokio::pin!(interrupt);
    let mut lines = reader.lines();
    let mut accepted = 0u64;
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(err) => {
                        error!(error = %err, "failed to read input, shutting down");
                        break;
                    }
                };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let record: serde_json::Value = match serde_json::from_str(line) {
                    Ok(record) => record,
                    Err(err) => {
                        warn!(error = %err, "skipping malformed input line");
                        continue;
                    }
                };
                match sealer.seal(&record) {
                    Ok(sealed) => {
                        uploader.enqueue(sealed);
                        accepted += 1;
                    }
                    Err(err) => warn!(error = %err, "failed to seal record"),
                }
            }
            _ = &mut interrupt => {
                info!("interrupt received");
                break;
            }
        }
    }
    accepted
}
