use oxalert_common::metrics::CoreMetrics;
use oxalert_common::shutdown::ShutdownSignal;
use oxalert_filter::IngestHandle;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// Outcome of reading one newline-terminated line.
#[derive(Debug, PartialEq, Eq)]
enum Line {
    Data(Vec<u8>),
    TooLong,
    Eof,
}

/// Reads one line of at most `max_len` bytes, without the terminator.
/// Overlong lines are consumed up to their newline and reported.
async fn read_line<R: AsyncBufRead + Unpin>(reader: &mut R, max_len: usize) -> std::io::Result<Line> {
    let mut line = Vec::new();
    let mut too_long = false;
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(if too_long {
                Line::TooLong
            } else if line.is_empty() {
                Line::Eof
            } else {
                Line::Data(line)
            });
        }
        let (chunk, done) = match available.iter().position(|b| *b == b'\n') {
            Some(pos) => (&available[..pos], Some(pos + 1)),
            None => (available, None),
        };
        if !too_long {
            if line.len() + chunk.len() > max_len {
                too_long = true;
                line.clear();
            } else {
                line.extend_from_slice(chunk);
            }
        }
        let consumed = done.unwrap_or(available.len());
        reader.consume(consumed);
        if done.is_some() {
            return Ok(if too_long { Line::TooLong } else { Line::Data(line) });
        }
    }
}

/// Feeds every line of `stream` into the filter pipeline until EOF or
/// shutdown.
async fn handle_connection<S: AsyncRead + Unpin>(
    stream: S,
    peer: SocketAddr,
    ingest: IngestHandle,
    max_line_len: usize,
    metrics: Arc<CoreMetrics>,
    mut shutdown: ShutdownSignal,
) {
    let mut reader = BufReader::new(stream);
    let mut lines = 0u64;
    loop {
        let next = tokio::select! {
            next = read_line(&mut reader, max_line_len) => next,
            _ = shutdown.triggered() => break,
        };
        match next {
            Ok(Line::Data(mut line)) => {
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                if line.is_empty() {
                    continue;
                }
                lines += 1;
                if ingest.ingest(line).await.is_err() {
                    break;
                }
            }
            Ok(Line::TooLong) => {
                metrics.metrics_received.inc();
                metrics.metrics_invalid.inc();
                tracing::debug!(peer = %peer, max_line_len, "Dropping overlong metric line");
            }
            Ok(Line::Eof) => break,
            Err(e) => {
                tracing::debug!(peer = %peer, error = %e, "Connection read failed");
                break;
            }
        }
    }
    tracing::debug!(peer = %peer, lines, "Connection closed");
}

/// Accepts plaintext metric connections until shutdown, then waits for the
/// open connections to finish.
pub async fn serve(
    listener: TcpListener,
    ingest: IngestHandle,
    max_line_len: usize,
    metrics: Arc<CoreMetrics>,
    mut shutdown: ShutdownSignal,
) {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(addr = %addr, "Metric listener started");
    }
    let mut connections: Vec<JoinHandle<()>> = Vec::new();
    loop {
        let accepted: std::io::Result<(TcpStream, SocketAddr)> = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = shutdown.triggered() => break,
        };
        connections.retain(|c| !c.is_finished());
        match accepted {
            Ok((stream, peer)) => {
                tracing::debug!(peer = %peer, "Connection accepted");
                connections.push(tokio::spawn(handle_connection(
                    stream,
                    peer,
                    ingest.clone(),
                    max_line_len,
                    metrics.clone(),
                    shutdown.clone(),
                )));
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to accept connection");
            }
        }
    }
    for conn in connections {
        if let Err(e) = conn.await {
            tracing::error!(error = %e, "Connection handler panicked");
        }
    }
    tracing::info!("Metric listener stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reads_lines_and_skips_overlong_ones() {
        let input: &[u8] = b"a.b 1 100\nthis-line-is-far-too-long 1 100\r\nc 2 3";
        let mut reader = BufReader::with_capacity(4, input);
        assert_eq!(
            read_line(&mut reader, 16).await.unwrap(),
            Line::Data(b"a.b 1 100".to_vec())
        );
        assert_eq!(read_line(&mut reader, 16).await.unwrap(), Line::TooLong);
        assert_eq!(
            read_line(&mut reader, 16).await.unwrap(),
            Line::Data(b"c 2 3".to_vec())
        );
        assert_eq!(read_line(&mut reader, 16).await.unwrap(), Line::Eof);
    }
}
