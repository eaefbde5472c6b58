use crate::filter::MetricFilter;
use crate::line::parse_line;
use crate::stats::FilterStats;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;

/// Largest UDP datagram we accept.
const UDP_BUFFER: usize = 65_536;

/// Parses raw lines and hands valid points to the filter.
pub struct LineHandler {
    filter: MetricFilter,
    max_line_len: usize,
}

impl LineHandler {
    pub fn new(filter: MetricFilter, max_line_len: usize) -> Self {
        Self {
            filter,
            max_line_len,
        }
    }

    fn stats(&self) -> &FilterStats {
        self.filter.stats()
    }

    /// Handles one line without its `\n`. Returns `false` when the filter
    /// has shut down.
    pub async fn handle_line(&self, line: &[u8]) -> bool {
        if line.is_empty() {
            return true;
        }
        FilterStats::add(&self.stats().received, 1);
        if line.len() > self.max_line_len {
            FilterStats::add(&self.stats().invalid, 1);
            tracing::debug!(len = line.len(), "Dropping oversized line");
            return true;
        }
        match parse_line(line, chrono::Utc::now().timestamp()) {
            Ok(point) => self.filter.submit(point).await,
            Err(e) => {
                FilterStats::add(&self.stats().invalid, 1);
                tracing::debug!(error = %e, line = %String::from_utf8_lossy(line), "Dropping invalid line");
                true
            }
        }
    }
}

/// Accepts plaintext connections until cancelled, one task per connection.
pub async fn serve_tcp(
    listener: TcpListener,
    handler: Arc<LineHandler>,
    cancel: CancellationToken,
) {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, "Listening for metrics over TCP");
    }
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tracing::debug!(%peer, "Metric connection accepted");
                    tokio::spawn(read_connection(stream, handler.clone(), cancel.clone()));
                }
                Err(e) => tracing::warn!(error = %e, "Accept failed"),
            }
        }
    }
    tracing::info!("TCP listener stopped");
}

async fn read_connection(stream: TcpStream, handler: Arc<LineHandler>, cancel: CancellationToken) {
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::with_capacity(256);
    loop {
        buf.clear();
        let read = tokio::select! {
            _ = cancel.cancelled() => break,
            read = reader.read_until(b'\n', &mut buf) => read,
        };
        match read {
            Ok(0) => break,
            Ok(_) => {
                let line = buf.strip_suffix(b"\n").unwrap_or(&buf);
                if !handler.handle_line(line).await {
                    break;
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "Metric connection closed with error");
                break;
            }
        }
    }
}

/// Receives datagrams of newline-separated lines until cancelled.
pub async fn serve_udp(socket: UdpSocket, handler: Arc<LineHandler>, cancel: CancellationToken) {
    if let Ok(addr) = socket.local_addr() {
        tracing::info!(%addr, "Listening for metrics over UDP");
    }
    let mut buf = vec![0u8; UDP_BUFFER];
    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => break,
            received = socket.recv_from(&mut buf) => received,
        };
        match received {
            Ok((len, _)) => {
                for line in buf[..len].split(|b| *b == b'\n') {
                    if !handler.handle_line(line).await {
                        return;
                    }
                }
            }
            Err(e) => tracing::warn!(error = %e, "UDP receive failed"),
        }
    }
    tracing::info!("UDP listener stopped");
}
