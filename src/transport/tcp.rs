//! TCP Transport
//!
//! Framed TCP delivery between nodes: a fixed header carrying length and
//! crc32 checksum, then a bincode-encoded envelope. Outbound connections
//! are opened on demand and kept on a per-peer writer task, which also
//! preserves FIFO order per (sender, receiver) pair.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, RwLock};
use tokio::time::timeout;

use crate::discovery::protocol::FrameHeader;
use crate::error::{Error, Result};
use crate::membership::Address;
use crate::transport::{Endpoint, Envelope, NodeBus, Transport};
use crate::discovery::protocol::WireMessage;

/// Maximum allowed message size (64 MB) - prevents memory exhaustion from
/// malformed frames
const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Read a framed envelope from a reader
pub async fn read_envelope<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Envelope> {
    let mut header_bytes = [0u8; FrameHeader::SIZE];
    reader.read_exact(&mut header_bytes).await?;
    let header = FrameHeader::from_bytes(&header_bytes);

    let msg_len = header.length as usize;
    if msg_len > MAX_MESSAGE_SIZE {
        return Err(Error::Network(format!(
            "Message too large: {} bytes (max {} bytes)",
            msg_len, MAX_MESSAGE_SIZE
        )));
    }

    let mut body = vec![0u8; msg_len];
    reader.read_exact(&mut body).await?;

    if crc32fast::hash(&body) != header.checksum {
        return Err(Error::FrameChecksum);
    }

    Ok(bincode::deserialize(&body)?)
}

/// Write a framed envelope to a writer
pub async fn write_envelope<W: AsyncWrite + Unpin>(
    writer: &mut W,
    envelope: &Envelope,
) -> Result<()> {
    let body = bincode::serialize(envelope)?;
    let header = FrameHeader::new(&body);

    writer.write_all(&header.to_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;

    Ok(())
}

/// Inbound side: accepts connections and feeds envelopes into the bus
pub struct TcpServer {
    listener: TcpListener,
    bus: NodeBus,
    shutdown: watch::Sender<bool>,
}

impl TcpServer {
    pub async fn bind(bind_address: &str, bus: NodeBus) -> Result<Self> {
        let listener = TcpListener::bind(bind_address).await?;
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            listener,
            bus,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `stop` is called
    pub async fn start(&self) -> Result<()> {
        tracing::info!(addr = %self.local_addr()?, "transport listening");
        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((socket, addr)) => {
                            let bus = self.bus.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(socket, bus).await {
                                    tracing::debug!(peer = %addr, "connection closed: {e}");
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("accept error: {e}");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("transport stopped");
        Ok(())
    }

    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}

async fn handle_connection(socket: TcpStream, bus: NodeBus) -> Result<()> {
    let (mut reader, _writer) = socket.into_split();
    loop {
        match read_envelope(&mut reader).await {
            Ok(envelope) => {
                tracing::trace!(from = %envelope.from, msg = envelope.msg.type_name(),
                    "received envelope");
                bus.deliver(envelope);
            }
            Err(Error::Io(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Outbound side: per-peer writer tasks, connect on demand,
/// fire-and-forget
pub struct TcpTransport {
    self_address: Address,
    connect_timeout: Duration,
    writers: Arc<RwLock<HashMap<Address, mpsc::UnboundedSender<Envelope>>>>,
}

impl TcpTransport {
    pub fn new(self_address: Address, connect_timeout: Duration) -> Self {
        Self {
            self_address,
            connect_timeout,
            writers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    async fn writer_for(&self, to: &Address) -> mpsc::UnboundedSender<Envelope> {
        if let Some(tx) = self.writers.read().await.get(to) {
            if !tx.is_closed() {
                return tx.clone();
            }
        }

        let mut writers = self.writers.write().await;
        // re-check under the write lock
        if let Some(tx) = writers.get(to) {
            if !tx.is_closed() {
                return tx.clone();
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        writers.insert(to.clone(), tx.clone());
        tokio::spawn(run_writer(to.clone(), rx, self.connect_timeout));
        tx
    }
}

async fn connect(peer: &Address, connect_timeout: Duration) -> Result<TcpStream> {
    match timeout(connect_timeout, TcpStream::connect(peer.to_string())).await {
        Ok(Ok(stream)) => {
            stream.set_nodelay(true)?;
            Ok(stream)
        }
        Ok(Err(e)) => Err(Error::ConnectionFailed {
            address: peer.to_string(),
            reason: e.to_string(),
        }),
        Err(_) => Err(Error::ConnectionTimeout(peer.to_string())),
    }
}

async fn run_writer(
    peer: Address,
    mut rx: mpsc::UnboundedReceiver<Envelope>,
    connect_timeout: Duration,
) {
    let stream = match connect(&peer, connect_timeout).await {
        Ok(stream) => stream,
        Err(e) => {
            tracing::debug!(peer = %peer, "connect failed: {e}");
            return;
        }
    };
    let (_reader, mut writer) = stream.into_split();

    while let Some(envelope) = rx.recv().await {
        if let Err(e) = write_envelope(&mut writer, &envelope).await {
            tracing::debug!(peer = %peer, "write failed, dropping connection: {e}");
            break;
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&self, to: &Address, endpoint: Endpoint, msg: WireMessage) -> Result<()> {
        let envelope = Envelope {
            from: self.self_address.clone(),
            endpoint,
            msg,
        };
        let tx = self.writer_for(to).await;
        if tx.send(envelope).is_err() {
            // writer died between lookup and send; next send reconnects
            tracing::trace!(peer = %to, "dropped message on dead connection");
        }
        Ok(())
    }
}
