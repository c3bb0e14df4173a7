//! Async driver for an `MqttsnClient` over an `embassy-net` UDP socket.

use core::cell::RefCell;
use core::pin::pin;

use embassy_net::udp::UdpSocket;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use embassy_time::{Duration, Instant, Timer};
use futures::future::{Either, select};

use super::outbox::DatagramOutbox;
use crate::client::MqttsnClient;
use crate::error::MqttsnError;

/// Client type driven by [`MqttsnRuntime`].
pub type RuntimeClient<
    'a,
    const MAX_PENDING: usize,
    const MAX_TOPICS: usize,
    const BUF_SIZE: usize,
    const DEPTH: usize,
> = MqttsnClient<'a, DatagramOutbox<DEPTH, BUF_SIZE>, MAX_PENDING, MAX_TOPICS, BUF_SIZE>;

/// The client shared between the runtime and application code on the same
/// executor.
pub type SharedClient<
    'a,
    const MAX_PENDING: usize,
    const MAX_TOPICS: usize,
    const BUF_SIZE: usize,
    const DEPTH: usize,
> = Mutex<NoopRawMutex, RefCell<RuntimeClient<'a, MAX_PENDING, MAX_TOPICS, BUF_SIZE, DEPTH>>>;

/// Default period of the retransmission and keepalive tick.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(100);

/// Feeds socket traffic and timer ticks into a shared client.
///
/// Application code issues requests through [`MqttsnRuntime::with_client`]
/// or by locking the shared client itself. Every client step runs inside the
/// lock, so requests never interleave with receive or tick processing.
///
/// ```ignore
/// static CLIENT: StaticCell<SharedClient<'static, 8, 16, 256, 8>> = StaticCell::new();
/// let client = CLIENT.init(Mutex::new(RefCell::new(MqttsnClient::new(DatagramOutbox::new()))));
/// client.lock(|c| c.borrow_mut().start(10000))?;
///
/// let runtime = MqttsnRuntime::new(client);
/// runtime.run(&mut socket).await?;
/// ```
pub struct MqttsnRuntime<
    'a,
    'c,
    const MAX_PENDING: usize,
    const MAX_TOPICS: usize,
    const BUF_SIZE: usize,
    const DEPTH: usize,
> {
    client: &'c SharedClient<'a, MAX_PENDING, MAX_TOPICS, BUF_SIZE, DEPTH>,
    tick_interval: Duration,
}

impl<
    'a,
    'c,
    const MAX_PENDING: usize,
    const MAX_TOPICS: usize,
    const BUF_SIZE: usize,
    const DEPTH: usize,
> MqttsnRuntime<'a, 'c, MAX_PENDING, MAX_TOPICS, BUF_SIZE, DEPTH>
{
    pub fn new(client: &'c SharedClient<'a, MAX_PENDING, MAX_TOPICS, BUF_SIZE, DEPTH>) -> Self {
        Self {
            client,
            tick_interval: DEFAULT_TICK_INTERVAL,
        }
    }

    pub fn with_tick_interval(mut self, tick_interval: Duration) -> Self {
        self.tick_interval = tick_interval;
        self
    }

    /// Runs `f` with exclusive access to the client.
    pub fn with_client<R>(
        &self,
        f: impl FnOnce(&mut RuntimeClient<'a, MAX_PENDING, MAX_TOPICS, BUF_SIZE, DEPTH>) -> R,
    ) -> R {
        self.client.lock(|client| f(&mut client.borrow_mut()))
    }

    /// Binds `socket` to the port the client was started on and drives the
    /// client until it is stopped.
    ///
    /// The client must be started before calling this.
    pub async fn run(&self, socket: &mut UdpSocket<'_>) -> Result<(), MqttsnError> {
        let port = self
            .with_client(|client| client.transport().port())
            .ok_or(MqttsnError::NotRunning)?;
        socket.bind(port).map_err(|_| {
            warn!("failed to bind UDP port {}", port);
            MqttsnError::Transport
        })?;
        info!("MQTT-SN runtime bound to port {}", port);

        let mut rx_buf = [0u8; BUF_SIZE];
        let mut next_tick = Instant::now() + self.tick_interval;
        loop {
            self.flush(socket).await;
            if !self.with_client(|client| client.is_running()) {
                info!("MQTT-SN runtime exiting");
                socket.close();
                return Ok(());
            }

            let received = {
                let recv = socket.recv_from(&mut rx_buf);
                let timer = Timer::at(next_tick);
                match select(pin!(recv), pin!(timer)).await {
                    Either::Left((result, _)) => Some(result),
                    Either::Right(((), _)) => None,
                }
            };

            let now = Instant::now();
            match received {
                Some(Ok((len, meta))) => self.with_client(|client| {
                    client.handle_datagram(now, meta.endpoint, &rx_buf[..len])
                }),
                Some(Err(_)) => debug!("dropping truncated datagram"),
                None => {}
            }
            // Also due when datagrams keep arriving ahead of the timer.
            if now >= next_tick {
                self.with_client(|client| client.tick(now));
                next_tick = now + self.tick_interval;
            }
        }
    }

    /// Writes every queued datagram to the socket.
    async fn flush(&self, socket: &UdpSocket<'_>) {
        while let Some(datagram) = self.with_client(|client| client.transport_mut().pop()) {
            if socket
                .send_to(datagram.as_bytes(), datagram.endpoint)
                .await
                .is_err()
            {
                warn!("UDP send of {} bytes failed", datagram.as_bytes().len());
            }
        }
    }
}
