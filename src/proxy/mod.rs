//! Datagram proxy
//!
//! Relays datagrams between a loopback UDP endpoint (the tunnel engine's
//! configured peer) and the registered tunnel stream:
//! - Uplink: local socket -> framed datagram on the stream
//! - Downlink: framed datagram on the stream -> last learned local peer

mod framing;

pub use framing::{
    encode_datagram, write_datagram, DatagramReader, LENGTH_PREFIX_SIZE, MAX_DATAGRAM_SIZE,
};

use crate::disguise::DisguiseProfile;
use crate::transport::BoxedStream;
use crate::tunnel::TunnelSession;
use serde::Serialize;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Default loopback address the tunnel engine sends to
pub const DEFAULT_LOCAL_BIND: &str = "127.0.0.1:51821";

/// Proxy errors
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to bind local endpoint {0}: {1}")]
    Bind(SocketAddr, std::io::Error),
}

/// Why a running proxy gave up on its stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyFailure {
    /// The remote end closed the stream
    StreamClosed,
    /// Reading the stream failed
    Stream(String),
}

impl fmt::Display for ProxyFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyFailure::StreamClosed => write!(f, "stream closed by peer"),
            ProxyFailure::Stream(e) => write!(f, "stream error: {}", e),
        }
    }
}

/// Snapshot of relay counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProxyCounters {
    pub datagrams_up: u64,
    pub datagrams_down: u64,
    pub bytes_up: u64,
    pub bytes_down: u64,
    /// Downlink datagrams that could not be delivered locally
    pub datagrams_dropped: u64,
}

/// Anything that can report relay counters
pub trait CounterSource: Send + Sync {
    fn snapshot(&self) -> ProxyCounters;
}

#[derive(Debug, Default)]
struct AtomicCounters {
    datagrams_up: AtomicU64,
    datagrams_down: AtomicU64,
    bytes_up: AtomicU64,
    bytes_down: AtomicU64,
    datagrams_dropped: AtomicU64,
}

/// Shared, lock-free counters updated by both relay loops
#[derive(Debug, Clone, Default)]
pub struct CounterHandle {
    inner: Arc<AtomicCounters>,
}

impl CounterHandle {
    pub fn new() -> Self {
        Self::default()
    }

    fn record_up(&self, bytes: usize) {
        self.inner.datagrams_up.fetch_add(1, Ordering::Relaxed);
        self.inner.bytes_up.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn record_down(&self, bytes: usize) {
        self.inner.datagrams_down.fetch_add(1, Ordering::Relaxed);
        self.inner.bytes_down.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn record_drop(&self) {
        self.inner.datagrams_dropped.fetch_add(1, Ordering::Relaxed);
    }
}

impl CounterSource for CounterHandle {
    fn snapshot(&self) -> ProxyCounters {
        ProxyCounters {
            datagrams_up: self.inner.datagrams_up.load(Ordering::Relaxed),
            datagrams_down: self.inner.datagrams_down.load(Ordering::Relaxed),
            bytes_up: self.inner.bytes_up.load(Ordering::Relaxed),
            bytes_down: self.inner.bytes_down.load(Ordering::Relaxed),
            datagrams_dropped: self.inner.datagrams_dropped.load(Ordering::Relaxed),
        }
    }
}

/// Proxy settings
#[derive(Debug, Clone)]
pub struct ProxySettings {
    /// Loopback endpoint the tunnel engine treats as its peer
    pub bind_addr: SocketAddr,
    /// How long `stop()` waits for the loops before aborting them
    pub stop_grace: Duration,
    /// Pause after an uplink error
    pub uplink_backoff: Duration,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 51821)),
            stop_grace: Duration::from_millis(500),
            uplink_backoff: Duration::from_millis(100),
        }
    }
}

/// Local datagram peer, learned from the most recent uplink datagram
type PeerSlot = Arc<RwLock<Option<SocketAddr>>>;

/// A running relay bound to one tunnel session
pub struct DatagramProxy {
    disguise: &'static DisguiseProfile,
    local_addr: SocketAddr,
    counters: CounterHandle,
    shutdown_tx: Arc<watch::Sender<bool>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
    stop_grace: Duration,
}

impl DatagramProxy {
    /// Bind the local endpoint and start relaying `session`
    ///
    /// A stream failure is reported once on `failure_tx`; a local `stop()`
    /// is never reported.
    pub async fn start(
        session: TunnelSession,
        settings: &ProxySettings,
        failure_tx: mpsc::Sender<ProxyFailure>,
    ) -> Result<Self, ProxyError> {
        let socket = UdpSocket::bind(settings.bind_addr)
            .await
            .map_err(|e| ProxyError::Bind(settings.bind_addr, e))?;
        let local_addr = socket.local_addr()?;
        let socket = Arc::new(socket);

        let disguise = session.disguise();
        let (reader, writer) = tokio::io::split(session.into_stream());

        let counters = CounterHandle::new();
        let peer: PeerSlot = Arc::new(RwLock::new(None));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shutdown_tx = Arc::new(shutdown_tx);

        let uplink = tokio::spawn(uplink_loop(
            socket.clone(),
            writer,
            peer.clone(),
            counters.clone(),
            shutdown_rx.clone(),
            settings.uplink_backoff,
        ));

        let downlink = tokio::spawn(downlink_loop(
            socket,
            reader,
            peer,
            counters.clone(),
            failure_tx,
            shutdown_tx.clone(),
            shutdown_rx,
        ));

        info!("Datagram proxy listening on {} ({})", local_addr, disguise.id);

        Ok(Self {
            disguise,
            local_addr,
            counters,
            shutdown_tx,
            tasks: Mutex::new(vec![uplink, downlink]),
            stopped: AtomicBool::new(false),
            stop_grace: settings.stop_grace,
        })
    }

    /// Bound loopback address
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Disguise the relayed session registered with
    pub fn disguise(&self) -> &'static DisguiseProfile {
        self.disguise
    }

    /// Live counter handle
    pub fn counters(&self) -> CounterHandle {
        self.counters.clone()
    }

    /// Stop both loops, close the socket and the stream
    ///
    /// Idempotent. Waits at most the configured grace period, then aborts.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown_tx.send_replace(true);

        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        for mut task in tasks {
            if tokio::time::timeout(self.stop_grace, &mut task).await.is_err() {
                debug!("Relay loop did not stop within grace period, aborting");
                task.abort();
            }
        }

        info!("Datagram proxy on {} stopped", self.local_addr);
    }
}

impl Drop for DatagramProxy {
    fn drop(&mut self) {
        self.shutdown_tx.send_replace(true);
    }
}

/// Resolves once shutdown is requested or the proxy handle is gone
async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

async fn uplink_loop(
    socket: Arc<UdpSocket>,
    mut writer: WriteHalf<BoxedStream>,
    peer: PeerSlot,
    counters: CounterHandle,
    mut shutdown: watch::Receiver<bool>,
    backoff: Duration,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

    loop {
        let result = tokio::select! {
            _ = shutdown_requested(&mut shutdown) => break,
            result = relay_up(&socket, &mut writer, &peer, &mut buf) => result,
        };

        match result {
            Ok(len) => counters.record_up(len),
            Err(e) => {
                debug!("Uplink error: {}", e);
                tokio::select! {
                    _ = shutdown_requested(&mut shutdown) => break,
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
        }
    }

    let _ = writer.shutdown().await;
    debug!("Uplink loop exited");
}

async fn relay_up(
    socket: &UdpSocket,
    writer: &mut WriteHalf<BoxedStream>,
    peer: &PeerSlot,
    buf: &mut [u8],
) -> std::io::Result<usize> {
    let (len, from) = socket.recv_from(buf).await?;

    {
        let mut current = peer.write().unwrap_or_else(|e| e.into_inner());
        if *current != Some(from) {
            debug!("Local peer is now {}", from);
            *current = Some(from);
        }
    }

    write_datagram(writer, &buf[..len]).await?;
    trace!("Uplink datagram: {} bytes", len);
    Ok(len)
}

async fn downlink_loop(
    socket: Arc<UdpSocket>,
    reader: ReadHalf<BoxedStream>,
    peer: PeerSlot,
    counters: CounterHandle,
    failure_tx: mpsc::Sender<ProxyFailure>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut reader = DatagramReader::new(reader);

    let failure = loop {
        let frame = tokio::select! {
            _ = shutdown_requested(&mut shutdown) => {
                debug!("Downlink loop exited");
                return;
            }
            frame = reader.read_datagram() => frame,
        };

        let datagram = match frame {
            Ok(Some(datagram)) => datagram,
            Ok(None) => break ProxyFailure::StreamClosed,
            Err(e) => break ProxyFailure::Stream(e.to_string()),
        };

        let target = *peer.read().unwrap_or_else(|e| e.into_inner());
        match target {
            Some(addr) => match socket.send_to(datagram, addr).await {
                Ok(_) => {
                    counters.record_down(datagram.len());
                    trace!("Downlink datagram: {} bytes", datagram.len());
                }
                Err(e) => {
                    counters.record_drop();
                    debug!("Failed to deliver datagram to {}: {}", addr, e);
                }
            },
            None => {
                counters.record_drop();
                warn!("Dropping {} byte datagram: no local peer yet", datagram.len());
            }
        }
    };

    // A local stop racing the failure wins
    if !*shutdown.borrow() {
        warn!("Tunnel stream failed: {}", failure);
        let _ = failure_tx.try_send(failure);
    }
    shutdown_tx.send_replace(true);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disguise::Catalog;
    use tokio::io::{AsyncReadExt, DuplexStream};

    fn settings() -> ProxySettings {
        ProxySettings {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            stop_grace: Duration::from_millis(200),
            uplink_backoff: Duration::from_millis(10),
        }
    }

    async fn start() -> (DatagramProxy, DuplexStream, mpsc::Receiver<ProxyFailure>) {
        let (local, remote) = tokio::io::duplex(256 * 1024);
        let session = TunnelSession::new(Catalog::builtin().canonical(), Box::new(local));
        let (failure_tx, failure_rx) = mpsc::channel(4);
        let proxy = DatagramProxy::start(session, &settings(), failure_tx)
            .await
            .unwrap();
        (proxy, remote, failure_rx)
    }

    async fn wait_for_counters<F>(proxy: &DatagramProxy, done: F) -> ProxyCounters
    where
        F: Fn(&ProxyCounters) -> bool,
    {
        let handle = proxy.counters();
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let snapshot = handle.snapshot();
                if done(&snapshot) {
                    return snapshot;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_counts_relayed_datagrams() {
        let (proxy, remote, _failures) = start().await;
        let (remote_read, mut remote_write) = tokio::io::split(remote);
        let mut remote_reader = DatagramReader::new(remote_read);

        let engine = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        engine.connect(proxy.local_addr()).await.unwrap();

        let up: Vec<Vec<u8>> = (1..=5).map(|i| vec![i as u8; i * 100]).collect();
        for payload in &up {
            engine.send(payload).await.unwrap();
            let got = remote_reader.read_datagram().await.unwrap().unwrap();
            assert_eq!(got, &payload[..]);
        }

        let down: Vec<Vec<u8>> = (1..=3).map(|i| vec![0xA0 + i as u8; i * 50]).collect();
        let mut buf = [0u8; 2048];
        for payload in &down {
            write_datagram(&mut remote_write, payload).await.unwrap();
            let n = engine.recv(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], &payload[..]);
        }

        let counters = wait_for_counters(&proxy, |c| c.datagrams_up == 5 && c.datagrams_down == 3).await;
        assert_eq!(counters.bytes_up, up.iter().map(|p| p.len() as u64).sum::<u64>());
        assert_eq!(counters.bytes_down, down.iter().map(|p| p.len() as u64).sum::<u64>());
        assert_eq!(counters.datagrams_dropped, 0);

        proxy.stop().await;
    }

    #[tokio::test]
    async fn test_downlink_without_peer_is_dropped() {
        let (proxy, mut remote, _failures) = start().await;

        write_datagram(&mut remote, b"too early").await.unwrap();

        let counters = wait_for_counters(&proxy, |c| c.datagrams_dropped == 1).await;
        assert_eq!(counters.datagrams_down, 0);
        proxy.stop().await;
    }

    #[tokio::test]
    async fn test_peer_follows_rebind() {
        let (proxy, remote, _failures) = start().await;
        let (remote_read, mut remote_write) = tokio::io::split(remote);
        let mut remote_reader = DatagramReader::new(remote_read);

        let first = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        first.send_to(b"hello", proxy.local_addr()).await.unwrap();
        remote_reader.read_datagram().await.unwrap().unwrap();

        let second = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        second.send_to(b"again", proxy.local_addr()).await.unwrap();
        remote_reader.read_datagram().await.unwrap().unwrap();

        write_datagram(&mut remote_write, b"reply").await.unwrap();
        let mut buf = [0u8; 64];
        let (n, _) = tokio::time::timeout(Duration::from_secs(5), second.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"reply");

        proxy.stop().await;
    }

    #[tokio::test]
    async fn test_stream_close_reported_once() {
        let (proxy, remote, mut failures) = start().await;
        drop(remote);

        let failure = tokio::time::timeout(Duration::from_secs(5), failures.recv())
            .await
            .unwrap();
        assert_eq!(failure, Some(ProxyFailure::StreamClosed));

        proxy.stop().await;
        assert_eq!(failures.recv().await, None);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_silent() {
        let (proxy, mut remote, mut failures) = start().await;
        let addr = proxy.local_addr();

        proxy.stop().await;
        proxy.stop().await;

        // No failure is reported for a local stop
        assert_eq!(failures.recv().await, None);

        // The stream was shut down from our side
        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(5), remote.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);

        // The local endpoint is released
        UdpSocket::bind(addr).await.unwrap();
    }
}
