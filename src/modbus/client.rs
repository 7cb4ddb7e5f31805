use async_trait::async_trait;
use log::{debug, info, warn};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::codec;
use super::connection::{ConnectionManager, ConnectionState};
use super::protocol::{FunctionCode, ModbusRequest, ResponseData};
use super::transaction::TransactionTable;
use crate::config::EndpointConfig;
use crate::services::broadcaster::{Broadcaster, Subscription, SubscriptionId};
use crate::services::events::{EventFilter, PlcEvent};
use crate::utils::error::ModbusError;

/// Typed MODBUS operations, independent of the transport behind them.
#[async_trait]
pub trait ModbusClientTrait: Send + Sync {
    async fn read_holding_registers(&self, address: u16, quantity: u16) -> Result<Vec<u16>, ModbusError>;

    async fn read_input_registers(&self, address: u16, quantity: u16) -> Result<Vec<u16>, ModbusError>;

    async fn read_coils(&self, address: u16, quantity: u16) -> Result<Vec<bool>, ModbusError>;

    async fn read_discrete_inputs(&self, address: u16, quantity: u16) -> Result<Vec<bool>, ModbusError>;

    async fn write_single_register(&self, address: u16, value: u16) -> Result<(), ModbusError>;

    async fn write_single_coil(&self, address: u16, value: bool) -> Result<(), ModbusError>;

    async fn write_multiple_registers(&self, address: u16, values: &[u16]) -> Result<(), ModbusError>;

    async fn write_multiple_coils(&self, address: u16, values: &[bool]) -> Result<(), ModbusError>;
}

struct ClientInner {
    config: Arc<EndpointConfig>,
    connection: Arc<ConnectionManager>,
    transactions: TransactionTable,
    broadcaster: Broadcaster,
    keepalive: Mutex<Option<JoinHandle<()>>>,
}

/// MODBUS/TCP client for a single endpoint.
///
/// Requests are pipelined: any number may be in flight on the one socket,
/// each matched to its response by transaction id. Every successful public
/// read or write is also published to subscribers as data or write events.
///
/// Cloning is cheap and every clone drives the same connection.
/// [`PlcClient::for_unit`] gives a handle addressing another unit behind
/// the same gateway.
#[derive(Clone)]
pub struct PlcClient {
    inner: Arc<ClientInner>,
    unit_id: u8,
}

impl PlcClient {
    pub fn new(config: EndpointConfig) -> Result<Self, ModbusError> {
        config.validate()?;

        let config = Arc::new(config);
        let transactions = TransactionTable::new();
        let broadcaster = Broadcaster::new(&config.name, config.event_buffer);
        let connection = ConnectionManager::new(Arc::clone(&config), transactions.clone(), broadcaster.clone());

        Ok(Self {
            unit_id: config.unit_id,
            inner: Arc::new(ClientInner {
                config,
                connection,
                transactions,
                broadcaster,
                keepalive: Mutex::new(None),
            }),
        })
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.inner.config
    }

    /// Unit id stamped on every request sent through this handle.
    pub fn unit_id(&self) -> u8 {
        self.unit_id
    }

    /// Handle on the same connection that addresses `unit_id` instead.
    pub fn for_unit(&self, unit_id: u8) -> Result<PlcClient, ModbusError> {
        if unit_id == 0 {
            return Err(ModbusError::Validation("unit id must be 1-255".to_string()));
        }
        Ok(Self {
            inner: Arc::clone(&self.inner),
            unit_id,
        })
    }

    /// Total TCP dials made so far, initial connects and reconnects alike.
    pub fn dial_attempts(&self) -> u64 {
        self.inner.connection.dial_attempts()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.connection.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.connection.watch_state()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connection.is_connected()
    }

    /// Number of requests currently awaiting a response.
    pub fn pending_requests(&self) -> usize {
        self.inner.transactions.len()
    }

    pub fn broadcaster(&self) -> &Broadcaster {
        &self.inner.broadcaster
    }

    pub fn subscribe(&self, filter: EventFilter) -> Subscription {
        self.inner.broadcaster.subscribe(filter)
    }

    pub fn subscribe_fn<F>(&self, filter: EventFilter, callback: F) -> SubscriptionId
    where
        F: Fn(&PlcEvent) + Send + Sync + 'static,
    {
        self.inner.broadcaster.subscribe_fn(filter, callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.broadcaster.unsubscribe(id)
    }

    /// Opens the connection, retrying up to `retry_attempts` more times, and
    /// starts the keepalive probe when enabled.
    pub async fn connect(&self) -> Result<(), ModbusError> {
        self.inner.connection.connect().await?;
        if self.inner.config.keep_alive {
            self.inner.start_keepalive();
        }
        Ok(())
    }

    /// Stops keepalive and reconnects, closes the socket and fails every
    /// pending request with `ConnectionClosed`. Safe to call repeatedly.
    pub async fn disconnect(&self) {
        self.inner.stop_keepalive();
        self.inner.connection.disconnect().await;
    }

    pub async fn read_holding_registers(&self, address: u16, quantity: u16) -> Result<Vec<u16>, ModbusError> {
        let request = ModbusRequest::read(FunctionCode::ReadHoldingRegisters, self.unit_id(), address, quantity);
        registers(self.request(request).await?)
    }

    pub async fn read_input_registers(&self, address: u16, quantity: u16) -> Result<Vec<u16>, ModbusError> {
        let request = ModbusRequest::read(FunctionCode::ReadInputRegisters, self.unit_id(), address, quantity);
        registers(self.request(request).await?)
    }

    pub async fn read_coils(&self, address: u16, quantity: u16) -> Result<Vec<bool>, ModbusError> {
        let request = ModbusRequest::read(FunctionCode::ReadCoils, self.unit_id(), address, quantity);
        bits(self.request(request).await?)
    }

    pub async fn read_discrete_inputs(&self, address: u16, quantity: u16) -> Result<Vec<bool>, ModbusError> {
        let request = ModbusRequest::read(FunctionCode::ReadDiscreteInputs, self.unit_id(), address, quantity);
        bits(self.request(request).await?)
    }

    pub async fn write_single_register(&self, address: u16, value: u16) -> Result<(), ModbusError> {
        let request = ModbusRequest::write_single_register(self.unit_id(), address, value);
        self.request(request).await.map(|_| ())
    }

    pub async fn write_single_coil(&self, address: u16, value: bool) -> Result<(), ModbusError> {
        let request = ModbusRequest::write_single_coil(self.unit_id(), address, value);
        self.request(request).await.map(|_| ())
    }

    pub async fn write_multiple_registers(&self, address: u16, values: &[u16]) -> Result<(), ModbusError> {
        let request = ModbusRequest::write_multiple_registers(self.unit_id(), address, values.to_vec());
        self.request(request).await.map(|_| ())
    }

    pub async fn write_multiple_coils(&self, address: u16, values: &[bool]) -> Result<(), ModbusError> {
        let request = ModbusRequest::write_multiple_coils(self.unit_id(), address, values.to_vec());
        self.request(request).await.map(|_| ())
    }

    /// Validates, executes and broadcasts a public request.
    async fn request(&self, request: ModbusRequest) -> Result<ResponseData, ModbusError> {
        request.validate()?;
        let data = self.inner.execute(&request).await?;

        if request.function.is_read() {
            self.inner.broadcaster.publish_read(&request, &data);
        } else {
            check_write_echo(&request, &data)?;
            self.inner.broadcaster.publish_write(&request);
        }
        Ok(data)
    }
}

impl ClientInner {
    async fn execute(&self, request: &ModbusRequest) -> Result<ResponseData, ModbusError> {
        if !self.connection.is_connected() {
            return Err(ModbusError::NotConnected);
        }

        let transaction_id = self.transactions.next_id()?;
        let frame = codec::encode(transaction_id, request)?;
        let pending = self
            .transactions
            .register(transaction_id, request.clone(), self.config.request_timeout())?;

        debug!(
            "📤 {} @ {} x{} to '{}' (transaction {})",
            request.function,
            request.address,
            request.quantity(),
            self.config.name,
            transaction_id
        );

        if let Err(e) = self.connection.send(frame) {
            self.transactions.reject(transaction_id, e);
        }
        pending.await
    }

    fn lock_keepalive(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.keepalive.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn start_keepalive(self: &Arc<Self>) {
        let mut slot = self.lock_keepalive();
        if slot.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }

        info!(
            "💓 Keepalive for '{}' every {:?} on holding register {}",
            self.config.name,
            self.config.keepalive_interval(),
            self.config.keepalive_address
        );
        *slot = Some(tokio::spawn(run_keepalive(
            Arc::downgrade(self),
            self.connection.watch_state(),
            self.config.keepalive_interval(),
        )));
    }

    fn stop_keepalive(&self) {
        if let Some(task) = self.lock_keepalive().take() {
            task.abort();
        }
    }

    /// Reads one holding register without broadcasting; failures are only
    /// logged since the connection manager reacts to real socket loss.
    async fn probe(&self) {
        let request = ModbusRequest::read(
            FunctionCode::ReadHoldingRegisters,
            self.config.unit_id,
            self.config.keepalive_address,
            1,
        );
        let started = Instant::now();
        match self.execute(&request).await {
            Ok(_) => debug!("💓 Keepalive to '{}' ok in {:?}", self.config.name, started.elapsed()),
            Err(e) => warn!("💔 Keepalive to '{}' failed: {}", self.config.name, e),
        }
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.stop_keepalive();
        let _ = self.connection.shutdown();
        self.transactions.fail_all(ModbusError::ConnectionClosed);
    }
}

/// Ticks only while the link is up; re-arms after every reconnect.
async fn run_keepalive(
    client: Weak<ClientInner>,
    mut state: watch::Receiver<ConnectionState>,
    period: std::time::Duration,
) {
    loop {
        while *state.borrow_and_update() != ConnectionState::Connected {
            if state.changed().await.is_err() {
                return;
            }
        }

        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let Some(client) = client.upgrade() else { return };
                    client.probe().await;
                }
                changed = state.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    if *state.borrow_and_update() != ConnectionState::Connected {
                        break;
                    }
                }
            }
        }
    }
}

fn registers(data: ResponseData) -> Result<Vec<u16>, ModbusError> {
    match data {
        ResponseData::Registers(values) => Ok(values),
        other => Err(ModbusError::FrameParse(format!("expected registers, got {:?}", other))),
    }
}

fn bits(data: ResponseData) -> Result<Vec<bool>, ModbusError> {
    match data {
        ResponseData::Bits(values) => Ok(values),
        other => Err(ModbusError::FrameParse(format!("expected bits, got {:?}", other))),
    }
}

fn check_write_echo(request: &ModbusRequest, data: &ResponseData) -> Result<(), ModbusError> {
    match data {
        ResponseData::WriteAck { address, .. } if *address == request.address => Ok(()),
        ResponseData::WriteAck { address, .. } => Err(ModbusError::FrameParse(format!(
            "write echo for address {} answers address {}",
            address, request.address
        ))),
        other => Err(ModbusError::FrameParse(format!("expected write echo, got {:?}", other))),
    }
}

#[async_trait]
impl ModbusClientTrait for PlcClient {
    async fn read_holding_registers(&self, address: u16, quantity: u16) -> Result<Vec<u16>, ModbusError> {
        PlcClient::read_holding_registers(self, address, quantity).await
    }

    async fn read_input_registers(&self, address: u16, quantity: u16) -> Result<Vec<u16>, ModbusError> {
        PlcClient::read_input_registers(self, address, quantity).await
    }

    async fn read_coils(&self, address: u16, quantity: u16) -> Result<Vec<bool>, ModbusError> {
        PlcClient::read_coils(self, address, quantity).await
    }

    async fn read_discrete_inputs(&self, address: u16, quantity: u16) -> Result<Vec<bool>, ModbusError> {
        PlcClient::read_discrete_inputs(self, address, quantity).await
    }

    async fn write_single_register(&self, address: u16, value: u16) -> Result<(), ModbusError> {
        PlcClient::write_single_register(self, address, value).await
    }

    async fn write_single_coil(&self, address: u16, value: bool) -> Result<(), ModbusError> {
        PlcClient::write_single_coil(self, address, value).await
    }

    async fn write_multiple_registers(&self, address: u16, values: &[u16]) -> Result<(), ModbusError> {
        PlcClient::write_multiple_registers(self, address, values).await
    }

    async fn write_multiple_coils(&self, address: u16, values: &[bool]) -> Result<(), ModbusError> {
        PlcClient::write_multiple_coils(self, address, values).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> PlcClient {
        PlcClient::new(EndpointConfig::new("unit-test", "127.0.0.1").with_port(1502)).unwrap()
    }

    #[test]
    fn test_invalid_config_rejected() {
        let err = PlcClient::new(EndpointConfig::new("", "127.0.0.1")).err();
        assert!(matches!(err, Some(ModbusError::ConfigValidation(_))));
    }

    #[tokio::test]
    async fn test_validation_precedes_connection_check() {
        let client = client();
        assert!(matches!(
            client.read_holding_registers(0, 0).await,
            Err(ModbusError::Validation(_))
        ));
        assert!(matches!(
            client.write_multiple_registers(0, &[0; 124]).await,
            Err(ModbusError::Validation(_))
        ));
        assert!(matches!(
            client.read_coils(65_535, 2).await,
            Err(ModbusError::Validation(_))
        ));
        assert_eq!(client.read_holding_registers(0, 1).await, Err(ModbusError::NotConnected));
        assert_eq!(client.pending_requests(), 0);
    }

    #[test]
    fn test_for_unit_shares_connection() {
        let client = client();
        let other = client.for_unit(7).unwrap();
        assert_eq!((client.unit_id(), other.unit_id()), (1, 7));
        assert!(Arc::ptr_eq(&client.inner, &other.inner));
        assert!(matches!(client.for_unit(0), Err(ModbusError::Validation(_))));
    }

    #[tokio::test]
    async fn test_disconnect_before_connect_is_noop() {
        let client = client();
        client.disconnect().await;
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_write_echo_must_match_address() {
        let request = ModbusRequest::write_single_register(1, 100, 42);
        assert!(check_write_echo(&request, &ResponseData::WriteAck { address: 100, value: 42 }).is_ok());
        assert!(check_write_echo(&request, &ResponseData::WriteAck { address: 101, value: 42 }).is_err());
    }
}
