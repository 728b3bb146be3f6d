use super::message::{Envelope, Payload};
use super::{SyncError, SyncResult};
use fnv::FnvHashMap;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::{Builder, Runtime};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};

/// Point-to-point delivery between ranks. Every call blocks the calling thread.
pub trait Transport: Send {
    fn rank(&self) -> usize;

    fn send(&mut self, to: usize, envelope: &Envelope) -> SyncResult<()>;

    /// Next message from any peer.
    fn recv(&mut self, timeout: Duration) -> SyncResult<Envelope>;
}

fn current_thread() -> SyncResult<Runtime> {
    Ok(Builder::new_current_thread().enable_all().build()?)
}

fn recv_within(
    runtime: &Runtime,
    inbox: &mut UnboundedReceiver<Envelope>,
    rank: usize,
    limit: Duration,
) -> SyncResult<Envelope> {
    // The timer registers with the reactor on construction, so build it inside the runtime.
    match runtime.block_on(async { tokio::time::timeout(limit, inbox.recv()).await }) {
        Ok(Some(envelope)) => Ok(envelope),
        Ok(None) => Err(SyncError::Disconnected(rank)),
        Err(_) => Err(SyncError::Timeout(limit)),
    }
}

/// In-process mesh over tokio channels, for threaded workers.
pub struct ChannelTransport {
    rank: usize,
    peers: Vec<UnboundedSender<Envelope>>,
    inbox: UnboundedReceiver<Envelope>,
    runtime: Runtime,
}

impl ChannelTransport {
    /// One connected endpoint per rank, index = rank.
    pub fn mesh(size: usize) -> SyncResult<Vec<Self>> {
        let (senders, receivers): (Vec<_>, Vec<_>) =
            (0..size).map(|_| mpsc::unbounded_channel()).unzip();
        receivers
            .into_iter()
            .enumerate()
            .map(|(rank, inbox)| {
                Ok(Self {
                    rank,
                    peers: senders.clone(),
                    inbox,
                    runtime: current_thread()?,
                })
            })
            .collect()
    }
}

impl Transport for ChannelTransport {
    fn rank(&self) -> usize {
        self.rank
    }

    fn send(&mut self, to: usize, envelope: &Envelope) -> SyncResult<()> {
        self.peers
            .get(to)
            .ok_or(SyncError::Disconnected(to))?
            .send(envelope.clone())
            .map_err(|_| SyncError::Disconnected(to))
    }

    fn recv(&mut self, timeout: Duration) -> SyncResult<Envelope> {
        recv_within(&self.runtime, &mut self.inbox, self.rank, timeout)
    }
}

/// Newline-delimited JSON over TCP. The coordinator accepts, workers connect.
pub struct TcpTransport {
    rank: usize,
    writers: FnvHashMap<usize, OwnedWriteHalf>,
    inbox: UnboundedReceiver<Envelope>,
    // Keeps the inbox open while every peer is gone, so receives time out instead.
    _inbox_tx: UnboundedSender<Envelope>,
    runtime: Runtime,
}

async fn read_loop(mut lines: Lines<BufReader<OwnedReadHalf>>, tx: UnboundedSender<Envelope>) {
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match Envelope::from_line(&line) {
                Ok(envelope) => {
                    if tx.send(envelope).is_err() {
                        break;
                    }
                }
                Err(e) => warn!("⚠️  Dropping malformed message: {}", e),
            },
            Ok(None) => {
                debug!("Peer closed its connection");
                break;
            }
            Err(e) => {
                warn!("⚠️  Connection read failed: {}", e);
                break;
            }
        }
    }
}

impl TcpTransport {
    /// Binds `addr` and blocks until `workers` peers have said hello.
    pub fn listen(addr: &str, workers: usize, timeout: Duration) -> SyncResult<Self> {
        let runtime = current_thread()?;
        let (tx, inbox) = mpsc::unbounded_channel();
        let writers = runtime.block_on(async {
            let listener = TcpListener::bind(addr).await?;
            info!("📡 Coordinator listening on {}", listener.local_addr()?);
            let mut writers = FnvHashMap::default();
            while writers.len() < workers {
                let (stream, peer) = tokio::time::timeout(timeout, listener.accept())
                    .await
                    .map_err(|_| SyncError::Timeout(timeout))??;
                let (read, write) = stream.into_split();
                let mut lines = BufReader::new(read).lines();
                let first = tokio::time::timeout(timeout, lines.next_line())
                    .await
                    .map_err(|_| SyncError::Timeout(timeout))??;
                let Some(first) = first else {
                    warn!("⚠️  {} hung up before saying hello", peer);
                    continue;
                };
                match Envelope::from_line(&first).map(|e| e.payload) {
                    Ok(Payload::Hello { rank }) if rank > 0 => {
                        info!("🤝 Worker {} connected from {}", rank, peer);
                        tokio::spawn(read_loop(lines, tx.clone()));
                        writers.insert(rank, write);
                    }
                    _ => warn!("⚠️  {} did not open with a valid hello, dropping", peer),
                }
            }
            Ok::<_, SyncError>(writers)
        })?;
        Ok(Self {
            rank: 0,
            writers,
            inbox,
            _inbox_tx: tx,
            runtime,
        })
    }

    /// Connects to the coordinator, retrying until `timeout` runs out.
    pub fn connect(addr: &str, rank: usize, timeout: Duration) -> SyncResult<Self> {
        let runtime = current_thread()?;
        let (tx, inbox) = mpsc::unbounded_channel();
        let writer = runtime.block_on(async {
            let deadline = Instant::now() + timeout;
            let stream = loop {
                match TcpStream::connect(addr).await {
                    Ok(s) => break s,
                    Err(e) if Instant::now() < deadline => {
                        debug!("Coordinator not reachable yet ({}), retrying", e);
                        tokio::time::sleep(Duration::from_millis(200)).await;
                    }
                    Err(_) => return Err(SyncError::Timeout(timeout)),
                }
            };
            let (read, mut write) = stream.into_split();
            let hello = Envelope::new(rank, 0, Payload::Hello { rank }).to_line()?;
            write.write_all(hello.as_bytes()).await?;
            tokio::spawn(read_loop(BufReader::new(read).lines(), tx.clone()));
            info!("🤝 Worker {} connected to {}", rank, addr);
            Ok::<_, SyncError>(write)
        })?;
        let mut writers = FnvHashMap::default();
        writers.insert(0, writer);
        Ok(Self {
            rank,
            writers,
            inbox,
            _inbox_tx: tx,
            runtime,
        })
    }
}

impl Transport for TcpTransport {
    fn rank(&self) -> usize {
        self.rank
    }

    fn send(&mut self, to: usize, envelope: &Envelope) -> SyncResult<()> {
        let line = envelope.to_line()?;
        let writer = self
            .writers
            .get_mut(&to)
            .ok_or(SyncError::Disconnected(to))?;
        self.runtime.block_on(writer.write_all(line.as_bytes()))?;
        Ok(())
    }

    fn recv(&mut self, timeout: Duration) -> SyncResult<Envelope> {
        recv_within(&self.runtime, &mut self.inbox, self.rank, timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_mesh_delivers_and_times_out() {
        let mut mesh = ChannelTransport::mesh(2).unwrap();
        let mut worker = mesh.pop().unwrap();
        let mut coordinator = mesh.pop().unwrap();
        worker
            .send(0, &Envelope::new(1, 3, Payload::Stop))
            .unwrap();
        let got = coordinator.recv(Duration::from_millis(100)).unwrap();
        assert_eq!((got.source, got.round), (1, 3));
        assert!(matches!(
            coordinator.recv(Duration::from_millis(20)),
            Err(SyncError::Timeout(_))
        ));
    }
}
