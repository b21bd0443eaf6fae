//! Socket handling for both channels.
//!
//! The TCP link is split into a reader task and a single writer task; the
//! writer is the only code that touches the write half, so frames never
//! interleave. Failures on either side surface as [`Event::LinkDown`], never as
//! an error to whoever queued the frame. The UDP meter socket only receives.

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::codec::{decode_datagram, AzmCodec};
use crate::error::{AzmError, Result};
use crate::protocol::{Message, Request};

/// Largest UDP payload we accept
const MAX_DATAGRAM: usize = 65_507;

/// Which channel a frame arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Link {
    /// TCP connection, tagged with its connection generation
    Tcp(u64),
    Udp,
}

/// Everything the supervisor hears from the sockets
#[derive(Debug)]
pub(crate) enum Event {
    Connected { epoch: u64, result: Result<TcpStream> },
    Frame { link: Link, message: Message },
    LinkDown { epoch: u64, reason: String },
}

/// Open the control connection
pub(crate) async fn connect(host: &str, port: u16, limit: Duration) -> Result<TcpStream> {
    let addr = format!("{}:{}", host, port);
    tracing::info!("Connecting to {}", addr);

    let stream = tokio::time::timeout(limit, TcpStream::connect(&addr))
        .await
        .map_err(|_| {
            AzmError::Network(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("connect to {} timed out", addr),
            ))
        })??;

    // small request/response frames
    let _ = stream.set_nodelay(true);
    Ok(stream)
}

/// A live TCP control connection
#[derive(Debug)]
pub(crate) struct TcpTransport {
    epoch: u64,
    tx: mpsc::UnboundedSender<Request>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl TcpTransport {
    /// Start the reader and writer tasks for `stream`
    pub(crate) fn spawn(stream: TcpStream, epoch: u64, events: mpsc::UnboundedSender<Event>) -> Self {
        let (read_half, write_half) = stream.into_split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Request>();

        let writer_events = events.clone();
        let writer = tokio::spawn(async move {
            let mut sink = FramedWrite::new(write_half, AzmCodec::new());
            while let Some(request) = rx.recv().await {
                tracing::debug!(
                    "Sending {} ({} entries, id {:?})",
                    request.method.as_str(),
                    request.params.entries().len(),
                    request.id
                );
                if let Err(e) = sink.send(request).await {
                    tracing::error!("Failed to send request: {}", e);
                    let _ = writer_events.send(Event::LinkDown {
                        epoch,
                        reason: format!("write failed: {}", e),
                    });
                    return;
                }
            }
        });

        let reader = tokio::spawn(async move {
            let mut frames = FramedRead::new(read_half, AzmCodec::new());
            let reason = loop {
                match frames.next().await {
                    Some(Ok(Ok(message))) => {
                        tracing::trace!("Received over TCP: {:?}", message);
                        let event = Event::Frame {
                            link: Link::Tcp(epoch),
                            message,
                        };
                        if events.send(event).is_err() {
                            return;
                        }
                    }
                    Some(Ok(Err(e))) => tracing::warn!("Dropping TCP frame: {}", e),
                    Some(Err(e)) => break format!("read failed: {}", e),
                    None => break "closed by device".to_string(),
                }
            };
            let _ = events.send(Event::LinkDown { epoch, reason });
        });

        Self {
            epoch,
            tx,
            reader,
            writer,
        }
    }

    /// Queue a request for the writer task
    pub(crate) fn send(&self, request: Request) {
        if self.tx.send(request).is_err() {
            tracing::debug!("Writer for connection {} already gone", self.epoch);
        }
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

/// Bind the meter socket on every interface
pub(crate) async fn bind_meter_socket(port: u16) -> Result<UdpSocket> {
    Ok(UdpSocket::bind(("0.0.0.0", port)).await?)
}

/// Receive meter datagrams until cancelled, rebinding after socket errors.
///
/// A failing meter socket never touches the TCP link.
pub(crate) fn spawn_meter_listener(
    initial: Option<UdpSocket>,
    port: u16,
    rebind_delay: Duration,
    events: mpsc::UnboundedSender<Event>,
    local_addr: watch::Sender<Option<SocketAddr>>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut socket = initial;
        let mut buf = vec![0u8; MAX_DATAGRAM];

        loop {
            let current = match socket.take() {
                Some(current) => current,
                None => match bind_meter_socket(port).await {
                    Ok(current) => current,
                    Err(e) => {
                        tracing::warn!("Failed to bind meter socket on port {}: {}", port, e);
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            _ = tokio::time::sleep(rebind_delay) => continue,
                        }
                    }
                },
            };

            let addr = current.local_addr().ok();
            tracing::info!("Listening for meters on {:?}", addr);
            local_addr.send_replace(addr);

            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        local_addr.send_replace(None);
                        return;
                    }
                    received = current.recv_from(&mut buf) => match received {
                        Ok((len, from)) => match decode_datagram(&buf[..len]) {
                            Ok(message) => {
                                let event = Event::Frame { link: Link::Udp, message };
                                if events.send(event).is_err() {
                                    return;
                                }
                            }
                            Err(e) => tracing::debug!("Dropping datagram from {}: {}", from, e),
                        },
                        Err(e) => {
                            tracing::warn!("Meter socket error: {}", e);
                            break;
                        }
                    }
                }
            }

            local_addr.send_replace(None);
            drop(current);
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(rebind_delay) => {}
            }
        }
    })
}
