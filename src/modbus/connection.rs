//! Socket lifecycle for one MODBUS/TCP endpoint.
//!
//! Each established link is served by a single I/O task that owns the
//! `TcpStream`: it writes frames queued through `send` and reassembles
//! inbound bytes into ADUs that are routed to the transaction table.
//!
//! Retry policy is deliberately asymmetric. `connect()` makes at most
//! `retry_attempts + 1` attempts and then gives up, while a link that drops
//! after being established is re-dialled every `retry_delay` until it comes
//! back or `disconnect()` is called.

use bytes::Bytes;
use log::{debug, info, trace, warn};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::codec::{self, FrameBuffer};
use super::protocol::ModbusResponse;
use super::transaction::TransactionTable;
use crate::config::EndpointConfig;
use crate::services::broadcaster::Broadcaster;
use crate::utils::error::ModbusError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        };
        f.write_str(label)
    }
}

#[derive(Default)]
struct Link {
    outbound: Option<mpsc::UnboundedSender<Bytes>>,
    io_task: Option<JoinHandle<()>>,
    reconnect_task: Option<JoinHandle<()>>,
    /// Bumped for every established link so a stale I/O task cannot tear
    /// down its successor.
    link_id: u64,
    /// Bumped by `disconnect()`; connect and reconnect loops started under
    /// an older epoch give up instead of installing a socket.
    epoch: u64,
}

pub struct ConnectionManager {
    config: Arc<EndpointConfig>,
    transactions: TransactionTable,
    broadcaster: Broadcaster,
    state: watch::Sender<ConnectionState>,
    link: Mutex<Link>,
    connect_lock: tokio::sync::Mutex<()>,
    dials: AtomicU64,
}

impl ConnectionManager {
    pub fn new(
        config: Arc<EndpointConfig>,
        transactions: TransactionTable,
        broadcaster: Broadcaster,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Arc::new(Self {
            config,
            transactions,
            broadcaster,
            state,
            link: Mutex::new(Link::default()),
            connect_lock: tokio::sync::Mutex::new(()),
            dials: AtomicU64::new(0),
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    fn lock_link(&self) -> MutexGuard<'_, Link> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!("'{}' state {} -> {}", self.config.name, previous, next);
        }
    }

    fn cancelled(&self, epoch: u64) -> bool {
        self.lock_link().epoch != epoch
    }

    /// Connects with the bounded retry budget. A no-op when already connected.
    ///
    /// While a runtime reconnect loop is running, the bounded attempts run
    /// alongside it: the state stays `Reconnecting` and the loop keeps going
    /// if every attempt fails.
    pub async fn connect(self: &Arc<Self>) -> Result<(), ModbusError> {
        let _guard = self.connect_lock.lock().await;

        let (epoch, reconnecting) = {
            let link = self.lock_link();
            if link.outbound.is_some() {
                return Ok(());
            }
            let reconnecting = link
                .reconnect_task
                .as_ref()
                .is_some_and(|task| !task.is_finished());
            (link.epoch, reconnecting)
        };

        let attempts = self.config.retry_attempts.saturating_add(1);
        let mut last_error = ModbusError::NotConnected;

        for attempt in 1..=attempts {
            if self.cancelled(epoch) {
                return Err(ModbusError::ConnectionClosed);
            }
            if self.is_linked() {
                return Ok(());
            }
            if !reconnecting {
                self.set_state(ConnectionState::Connecting);
            }

            match self.open_stream().await {
                Ok(stream) => {
                    self.install(stream, epoch, true)?;
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        "🔌 Connection attempt {}/{} to '{}' ({}:{}) failed: {}",
                        attempt, attempts, self.config.name, self.config.host, self.config.port, e
                    );
                    last_error = e;
                }
            }

            if attempt < attempts {
                tokio::time::sleep(self.config.retry_delay()).await;
            }
        }

        if !self.cancelled(epoch) && !reconnecting {
            self.set_state(ConnectionState::Disconnected);
        }
        Err(ModbusError::ConnectionFailed {
            attempts,
            last: Box::new(last_error),
        })
    }

    /// Total TCP dials made so far, from `connect()` and reconnects alike.
    pub fn dial_attempts(&self) -> u64 {
        self.dials.load(Ordering::Relaxed)
    }

    fn is_linked(&self) -> bool {
        self.lock_link().outbound.is_some()
    }

    /// Cancels reconnects, closes the socket and fails in-flight requests
    /// with `ConnectionClosed`. Idempotent.
    pub async fn disconnect(&self) {
        let (tasks, previous) = self.shutdown();
        for task in tasks {
            let _ = task.await;
        }

        let failed = self.transactions.fail_all(ModbusError::ConnectionClosed);
        if previous != ConnectionState::Disconnected {
            info!(
                "👋 Disconnected from PLC '{}' ({} request(s) cancelled)",
                self.config.name, failed
            );
        }
        if previous == ConnectionState::Connected {
            self.broadcaster.publish_status(false);
        }
    }

    /// Synchronous half of `disconnect`: invalidates running loops and
    /// aborts every task. Returns the aborted tasks and the prior state.
    pub(crate) fn shutdown(&self) -> (Vec<JoinHandle<()>>, ConnectionState) {
        let mut link = self.lock_link();
        link.epoch += 1;
        link.outbound = None;

        let tasks: Vec<JoinHandle<()>> = [link.reconnect_task.take(), link.io_task.take()]
            .into_iter()
            .flatten()
            .collect();
        for task in &tasks {
            task.abort();
        }

        let previous = self.state.send_replace(ConnectionState::Disconnected);
        (tasks, previous)
    }

    /// Queues a frame on the link's single write path.
    pub fn send(&self, frame: Bytes) -> Result<(), ModbusError> {
        let link = self.lock_link();
        match &link.outbound {
            Some(outbound) => outbound.send(frame).map_err(|_| ModbusError::ConnectionLost),
            None => Err(ModbusError::NotConnected),
        }
    }

    async fn open_stream(&self) -> Result<TcpStream, ModbusError> {
        let addr = self.config.socket_addr()?;
        let timeout = self.config.connect_timeout();
        self.dials.fetch_add(1, Ordering::Relaxed);

        let stream = match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(result) => result?,
            Err(_) => return Err(ModbusError::ConnectionTimeout(timeout.as_millis() as u64)),
        };

        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not set TCP_NODELAY: {}", e);
        }
        Ok(stream)
    }

    /// Hands `stream` to a fresh I/O task. Returns `false` when another
    /// link was already up and `stream` was dropped instead.
    fn install(
        self: &Arc<Self>,
        stream: TcpStream,
        epoch: u64,
        cancel_reconnect: bool,
    ) -> Result<bool, ModbusError> {
        let mut link = self.lock_link();
        if link.epoch != epoch {
            return Err(ModbusError::ConnectionClosed);
        }
        if link.outbound.is_some() {
            return Ok(false);
        }
        if cancel_reconnect {
            if let Some(task) = link.reconnect_task.take() {
                task.abort();
            }
        }

        link.link_id += 1;
        let link_id = link.link_id;
        let (outbound, queue) = mpsc::unbounded_channel();
        link.outbound = Some(outbound);

        let manager = Arc::clone(self);
        link.io_task = Some(tokio::spawn(async move {
            manager.run_link(link_id, stream, queue).await;
        }));

        self.set_state(ConnectionState::Connected);
        info!(
            "✅ Connected to PLC '{}' at {}:{}",
            self.config.name, self.config.host, self.config.port
        );
        // Published under the link lock so a fast disconnect cannot overtake it.
        self.broadcaster.publish_status(true);
        Ok(true)
    }

    async fn run_link(
        self: Arc<Self>,
        link_id: u64,
        stream: TcpStream,
        mut queue: mpsc::UnboundedReceiver<Bytes>,
    ) {
        let (mut reader, mut writer) = stream.into_split();
        let mut frames = FrameBuffer::new();

        let cause = loop {
            tokio::select! {
                read = reader.read_buf(frames.buffer_mut()) => match read {
                    Ok(0) => break ModbusError::ConnectionLost,
                    Ok(n) => {
                        trace!("📥 {} bytes from '{}'", n, self.config.name);
                        self.dispatch(&mut frames);
                    }
                    Err(e) => break ModbusError::from(e),
                },
                frame = queue.recv() => match frame {
                    Some(frame) => {
                        trace!("📤 {}", hex::encode(&frame));
                        if let Err(e) = writer.write_all(&frame).await {
                            break ModbusError::from(e);
                        }
                    }
                    None => return,
                },
            }
        };

        self.handle_link_loss(link_id, cause);
    }

    fn dispatch(&self, frames: &mut FrameBuffer) {
        loop {
            match frames.next_frame() {
                Ok(Some(frame)) => self.route(&frame),
                Ok(None) => break,
                Err(e) => {
                    warn!("⚠️  Discarding inbound bytes from '{}': {}", self.config.name, e);
                    break;
                }
            }
        }
    }

    fn route(&self, frame: &[u8]) {
        trace!("📥 {}", hex::encode(frame));

        let transaction_id = match codec::parse_frame(frame) {
            Ok((header, _)) => header.transaction_id,
            Err(e) => {
                warn!("⚠️  Dropping malformed frame from '{}': {}", self.config.name, e);
                return;
            }
        };

        let Some(request) = self.transactions.request(transaction_id) else {
            debug!(
                "🗑️  No pending request for transaction {} on '{}'",
                transaction_id, self.config.name
            );
            return;
        };

        match codec::decode(frame, &request).and_then(ModbusResponse::into_result) {
            Ok(data) => {
                self.transactions.resolve(transaction_id, data);
            }
            Err(e) => {
                if let ModbusError::FrameParse(_) = e {
                    warn!(
                        "⚠️  Malformed response for transaction {} from '{}': {}",
                        transaction_id, self.config.name, e
                    );
                }
                self.transactions.reject(transaction_id, e);
            }
        }
    }

    fn handle_link_loss(self: &Arc<Self>, link_id: u64, cause: ModbusError) {
        let mut link = self.lock_link();
        if link.link_id != link_id || link.outbound.is_none() {
            return;
        }
        link.outbound = None;
        link.io_task = None;

        self.set_state(ConnectionState::Reconnecting);
        warn!(
            "🔌 Lost connection to PLC '{}': {}; retrying every {:?}",
            self.config.name,
            cause,
            self.config.retry_delay()
        );
        self.broadcaster.publish_status(false);
        self.transactions.fail_all(ModbusError::ConnectionLost);

        let epoch = link.epoch;
        let manager = Arc::clone(self);
        link.reconnect_task = Some(tokio::spawn(async move {
            manager.reconnect_loop(epoch).await;
        }));
    }

    async fn reconnect_loop(self: Arc<Self>, epoch: u64) {
        let mut attempt: u64 = 0;
        loop {
            tokio::time::sleep(self.config.retry_delay()).await;
            if self.cancelled(epoch) || self.is_linked() {
                return;
            }

            attempt += 1;
            info!("🔄 Reconnecting to PLC '{}' (attempt {})", self.config.name, attempt);

            match self.open_stream().await {
                Ok(stream) => {
                    if let Ok(true) = self.install(stream, epoch, false) {
                        info!("✅ Reconnected to PLC '{}' after {} attempt(s)", self.config.name, attempt);
                    }
                    return;
                }
                Err(e) => warn!("🔌 Reconnect attempt {} to '{}' failed: {}", attempt, self.config.name, e),
            }
        }
    }
}
