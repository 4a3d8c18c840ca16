use crate::addressing::GroupAddress;
use crate::get_unix_ts;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use log::{debug, error, info, warn};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

pub mod proto;

use proto::{
    decode_frame, encode_frame, encode_group_apdu, open_groupcon_frame, parse_group_apdu, Apci,
    Telegram, EIB_CLOSE, EIB_GROUP_PACKET, EIB_OPEN_GROUPCON, MAX_FRAME_SIZE,
};

#[derive(Error, Debug)]
pub enum KnxdError {
    #[error("Not connected to knxd")]
    NotConnected,
    #[error("Telegram failed: {0}")]
    TelegramFailed(String),
    #[error("Invalid knxd URL {0}, expected unix:// or tcp://")]
    InvalidUrl(String),
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),
    #[error("Connect timed out")]
    ConnectTimeout,
    #[error("Protocol desync, peer declared a frame of {0} bytes")]
    ProtocolDesync(usize),
    #[error(transparent)]
    Proto(#[from] proto::ProtoError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Inbound telegrams are handed to the registered callback from a worker
/// pool, never from the receive loop itself.
pub type TelegramCallback = Arc<dyn Fn(Telegram) -> BoxFuture<'static, ()> + Send + Sync>;

type Reader = Box<dyn AsyncRead + Unpin + Send>;
type Writer = Box<dyn AsyncWrite + Unpin + Send>;

fn connect_timeout_default() -> Duration { Duration::from_secs(10) }
fn read_timeout_default() -> Duration { Duration::from_secs(30) }
fn write_timeout_default() -> Duration { Duration::from_secs(5) }
fn initial_backoff_default() -> Duration { Duration::from_secs(1) }
fn max_backoff_default() -> Duration { Duration::from_secs(120) }

#[derive(Clone)]
pub struct KnxdOptions {
    /// unix:///run/knxd or tcp://host:6720
    pub url: String,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub queue_capacity: usize,
    pub workers: usize,
}

impl KnxdOptions {
    pub fn new(url: &str) -> Self {
        return KnxdOptions {
            url: url.to_string(),
            connect_timeout: connect_timeout_default(),
            read_timeout: read_timeout_default(),
            write_timeout: write_timeout_default(),
            initial_backoff: initial_backoff_default(),
            max_backoff: max_backoff_default(),
            queue_capacity: 100,
            workers: 4,
        };
    }
}

#[derive(Default)]
pub struct KnxdStats {
    tx: AtomicU64,
    rx: AtomicU64,
    dropped: AtomicU64,
    errors: AtomicU64,
    reconnects: AtomicU64,
    last_activity: AtomicU64,
    connected: AtomicBool,
    reconnecting: AtomicBool,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct StatsSnapshot {
    pub tx: u64,
    pub rx: u64,
    pub dropped: u64,
    pub errors: u64,
    pub reconnects: u64,
    pub last_activity: u64,
    pub connected: bool,
    pub reconnecting: bool,
}

impl KnxdStats {
    fn touch(&self) {
        self.last_activity.store(get_unix_ts(), Ordering::Relaxed);
    }

    fn snapshot(&self) -> StatsSnapshot {
        return StatsSnapshot {
            tx: self.tx.load(Ordering::Relaxed),
            rx: self.rx.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            last_activity: self.last_activity.load(Ordering::Relaxed),
            connected: self.connected.load(Ordering::Relaxed),
            reconnecting: self.reconnecting.load(Ordering::Relaxed),
        };
    }
}

struct ClientInner {
    opts: KnxdOptions,
    writer: Mutex<Option<Writer>>,
    callback: RwLock<Option<TelegramCallback>>,
    stats: KnxdStats,
    shutdown_tx: watch::Sender<bool>,
}

/// A long-lived connection to the knxd daemon.
///
/// Owns one socket, a receive loop and a bounded worker pool for callback
/// dispatch. Reconnects on its own with exponential backoff; senders see
/// `NotConnected` during the gap and are expected to retry above.
pub struct KnxdClient {
    inner: Arc<ClientInner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl KnxdClient {
    /// Dial the daemon, perform the open-group-communication handshake and
    /// start the receive loop and callback workers.
    pub async fn connect(opts: KnxdOptions) -> Result<Self, KnxdError> {
        let (reader, writer) = dial_and_handshake(&opts).await?;

        let workers = opts.workers;
        let queue_capacity = opts.queue_capacity;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (queue_tx, queue_rx) = mpsc::channel::<Telegram>(queue_capacity);

        let inner = Arc::new(ClientInner {
            opts,
            writer: Mutex::new(Some(writer)),
            callback: RwLock::new(None),
            stats: KnxdStats::default(),
            shutdown_tx,
        });
        inner.stats.connected.store(true, Ordering::Relaxed);
        inner.stats.touch();

        let mut tasks = Vec::new();
        let shared_rx = Arc::new(Mutex::new(queue_rx));
        for worker_id in 0..workers {
            tasks.push(tokio::spawn(worker_loop(inner.clone(), shared_rx.clone(), worker_id)));
        }
        tasks.push(tokio::spawn(receive_loop(inner.clone(), reader, queue_tx, shutdown_rx)));

        info!("Connected to knxd at {}", inner.opts.url);
        return Ok(KnxdClient { inner, tasks: Mutex::new(tasks) });
    }

    /// Send a group write telegram.
    pub async fn send(&self, ga: GroupAddress, data: &[u8]) -> Result<(), KnxdError> {
        return self.send_apdu(ga, Apci::Write, data).await;
    }

    /// Send a group read request; answers arrive through the callback.
    pub async fn send_read(&self, ga: GroupAddress) -> Result<(), KnxdError> {
        return self.send_apdu(ga, Apci::Read, &[]).await;
    }

    async fn send_apdu(&self, ga: GroupAddress, apci: Apci, data: &[u8]) -> Result<(), KnxdError> {
        let apdu = encode_group_apdu(ga, apci, data)?;
        let frame = encode_frame(EIB_GROUP_PACKET, &apdu)?;

        let mut guard = self.inner.writer.lock().await;
        let writer = guard.as_mut().ok_or(KnxdError::NotConnected)?;

        match tokio::time::timeout(self.inner.opts.write_timeout, writer.write_all(&frame)).await {
            Ok(Ok(())) => {
                self.inner.stats.tx.fetch_add(1, Ordering::Relaxed);
                self.inner.stats.touch();
                return Ok(());
            }
            Ok(Err(e)) => {
                self.inner.stats.errors.fetch_add(1, Ordering::Relaxed);
                return Err(KnxdError::TelegramFailed(e.to_string()));
            }
            Err(_) => {
                self.inner.stats.errors.fetch_add(1, Ordering::Relaxed);
                return Err(KnxdError::TelegramFailed("write timed out".to_string()));
            }
        }
    }

    /// Replace the inbound telegram callback. Invocation is asynchronous,
    /// from the worker pool.
    pub fn set_on_telegram<F, Fut>(&self, callback: F)
    where
        F: Fn(Telegram) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cb: TelegramCallback = Arc::new(move |telegram| callback(telegram).boxed());
        *self.inner.callback.write().unwrap() = Some(cb);
    }

    pub fn stats(&self) -> StatsSnapshot {
        return self.inner.stats.snapshot();
    }

    pub fn url(&self) -> &str {
        return &self.inner.opts.url;
    }

    pub fn is_connected(&self) -> bool {
        return self.inner.stats.connected.load(Ordering::Relaxed);
    }

    pub fn health_check(&self) -> bool {
        let stats = self.inner.stats.snapshot();
        return stats.connected && !stats.reconnecting;
    }

    /// Graceful shutdown: signal every task, send a best-effort close
    /// message, and wait for the receive loop and all workers to finish.
    /// Safe to call more than once.
    pub async fn close(&self) {
        let _ = self.inner.shutdown_tx.send(true);

        {
            let mut guard = self.inner.writer.lock().await;
            if let Some(writer) = guard.as_mut() {
                if let Ok(frame) = encode_frame(EIB_CLOSE, &[]) {
                    let _ = tokio::time::timeout(self.inner.opts.write_timeout, writer.write_all(&frame)).await;
                }
            }
            *guard = None;
        }
        self.inner.stats.connected.store(false, Ordering::Relaxed);

        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            let _ = task.await;
        }
        debug!("knxd client closed");
    }
}

async fn dial(opts: &KnxdOptions) -> Result<(Reader, Writer), KnxdError> {
    if let Some(path) = opts.url.strip_prefix("unix://") {
        let stream = tokio::time::timeout(opts.connect_timeout, UnixStream::connect(path))
            .await
            .map_err(|_| KnxdError::ConnectTimeout)??;
        let (r, w) = tokio::io::split(stream);
        return Ok((Box::new(r), Box::new(w)));
    }

    if let Some(addr) = opts.url.strip_prefix("tcp://") {
        let stream = tokio::time::timeout(opts.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| KnxdError::ConnectTimeout)??;
        let _ = stream.set_nodelay(true);
        let (r, w) = tokio::io::split(stream);
        return Ok((Box::new(r), Box::new(w)));
    }

    return Err(KnxdError::InvalidUrl(opts.url.clone()));
}

async fn dial_and_handshake(opts: &KnxdOptions) -> Result<(Reader, Writer), KnxdError> {
    let (mut reader, mut writer) = dial(opts).await?;

    let mut buf = [0u8; MAX_FRAME_SIZE];
    let handshake = async {
        writer.write_all(&open_groupcon_frame(false)).await?;
        let frame = read_frame(&mut reader, &mut buf).await?;
        let (msg_type, _) = decode_frame(&frame)?;
        if msg_type != EIB_OPEN_GROUPCON {
            return Err(KnxdError::HandshakeFailed(format!("unexpected reply type 0x{:04X}", msg_type)));
        }
        Ok(())
    };

    tokio::time::timeout(opts.connect_timeout, handshake)
        .await
        .map_err(|_| KnxdError::ConnectTimeout)??;

    return Ok((reader, writer));
}

/// Read one length-prefixed frame into the fixed receive buffer. A length
/// field the buffer can not hold is a desync, the caller must drop the
/// connection rather than try to skip bytes.
async fn read_frame(reader: &mut Reader, buf: &mut [u8; MAX_FRAME_SIZE]) -> Result<Vec<u8>, KnxdError> {
    let mut len_buf = [0u8; 2];
    reader.read_exact(&mut len_buf).await?;

    let declared = u16::from_be_bytes(len_buf) as usize;
    if declared < 2 || declared > MAX_FRAME_SIZE - 2 {
        return Err(KnxdError::ProtocolDesync(declared));
    }

    reader.read_exact(&mut buf[..declared]).await?;

    let mut frame = Vec::with_capacity(2 + declared);
    frame.extend_from_slice(&len_buf);
    frame.extend_from_slice(&buf[..declared]);
    return Ok(frame);
}

async fn receive_loop(
    inner: Arc<ClientInner>,
    mut reader: Reader,
    queue_tx: mpsc::Sender<Telegram>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buf = [0u8; MAX_FRAME_SIZE];

    loop {
        if *shutdown.borrow() {
            break;
        }

        let read = tokio::select! {
            _ = shutdown.changed() => break,
            read = tokio::time::timeout(inner.opts.read_timeout, read_frame(&mut reader, &mut buf)) => read,
        };

        match read {
            /* read timeouts are normal, they just start another iteration */
            Err(_elapsed) => continue,
            Ok(Ok(frame)) => dispatch_frame(&inner, &frame, &queue_tx),
            Ok(Err(KnxdError::ProtocolDesync(declared))) => {
                error!("knxd protocol desync: declared frame of {} bytes exceeds the {} byte buffer, reconnecting", declared, MAX_FRAME_SIZE);
                inner.stats.errors.fetch_add(1, Ordering::Relaxed);
                mark_disconnected(&inner).await;
                match reconnect(&inner, &mut shutdown).await {
                    Some(new_reader) => reader = new_reader,
                    None => break,
                }
            }
            Ok(Err(e)) => {
                if *shutdown.borrow() {
                    break;
                }
                warn!("knxd read failed: {}, reconnecting", e);
                mark_disconnected(&inner).await;
                match reconnect(&inner, &mut shutdown).await {
                    Some(new_reader) => reader = new_reader,
                    None => break,
                }
            }
        }
    }

    debug!("knxd receive loop finished");
    /* dropping queue_tx lets the workers drain and exit */
}

fn dispatch_frame(inner: &Arc<ClientInner>, frame: &[u8], queue_tx: &mpsc::Sender<Telegram>) {
    let (msg_type, payload) = match decode_frame(frame) {
        Ok(parts) => parts,
        Err(e) => {
            inner.stats.errors.fetch_add(1, Ordering::Relaxed);
            warn!("Undecodable knxd frame: {}", e);
            return;
        }
    };

    if msg_type != EIB_GROUP_PACKET {
        debug!("Ignoring knxd message type 0x{:04X}", msg_type);
        return;
    }

    let telegram = match parse_group_apdu(&payload) {
        Ok(t) => t,
        Err(e) => {
            inner.stats.errors.fetch_add(1, Ordering::Relaxed);
            warn!("Undecodable group telegram: {}", e);
            return;
        }
    };

    inner.stats.rx.fetch_add(1, Ordering::Relaxed);
    inner.stats.touch();

    if inner.callback.read().unwrap().is_none() {
        return;
    }

    match queue_tx.try_send(telegram) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(t)) => {
            inner.stats.dropped.fetch_add(1, Ordering::Relaxed);
            inner.stats.errors.fetch_add(1, Ordering::Relaxed);
            warn!("Callback queue full, dropping telegram for {}", t.dest);
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {}
    }
}

async fn worker_loop(inner: Arc<ClientInner>, queue_rx: Arc<Mutex<mpsc::Receiver<Telegram>>>, worker_id: usize) {
    loop {
        let telegram = { queue_rx.lock().await.recv().await };
        let telegram = match telegram {
            Some(t) => t,
            None => break,
        };

        let callback = inner.callback.read().unwrap().clone();
        if let Some(callback) = callback {
            /* a panicking handler must not take the worker down with it */
            if AssertUnwindSafe(callback(telegram)).catch_unwind().await.is_err() {
                inner.stats.errors.fetch_add(1, Ordering::Relaxed);
                error!("Telegram callback panicked in worker {}", worker_id);
            }
        }
    }

    debug!("knxd callback worker {} finished", worker_id);
}

async fn mark_disconnected(inner: &Arc<ClientInner>) {
    *inner.writer.lock().await = None;
    inner.stats.connected.store(false, Ordering::Relaxed);
}

/// Re-dial and re-handshake until it works or shutdown wins. Exactly one
/// attempt runs at a time; the backoff grows 1.5x per failure up to the cap.
async fn reconnect(inner: &Arc<ClientInner>, shutdown: &mut watch::Receiver<bool>) -> Option<Reader> {
    if inner
        .stats
        .reconnecting
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        /* another attempt is in flight, wait for it to settle */
        while inner.stats.reconnecting.load(Ordering::SeqCst) {
            if *shutdown.borrow() {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        return None;
    }

    let mut backoff = inner.opts.initial_backoff;
    loop {
        if *shutdown.borrow() {
            inner.stats.reconnecting.store(false, Ordering::SeqCst);
            return None;
        }

        match dial_and_handshake(&inner.opts).await {
            Ok((reader, writer)) => {
                *inner.writer.lock().await = Some(writer);
                inner.stats.connected.store(true, Ordering::Relaxed);
                inner.stats.reconnects.fetch_add(1, Ordering::Relaxed);
                inner.stats.reconnecting.store(false, Ordering::SeqCst);
                inner.stats.touch();
                info!("Reconnected to knxd at {}", inner.opts.url);
                return Some(reader);
            }
            Err(e) => {
                warn!("knxd reconnect failed: {}, next attempt in {:?}", e, backoff);
                tokio::select! {
                    _ = shutdown.changed() => {
                        inner.stats.reconnecting.store(false, Ordering::SeqCst);
                        return None;
                    }
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = backoff.mul_f64(1.5).min(inner.opts.max_backoff);
            }
        }
    }
}
