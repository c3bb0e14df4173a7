//! # MQTT-SN Client
//!
//! `MqttsnClient` is the protocol engine: it owns the session state, the
//! pending-request table and the topic registry, and it is driven entirely
//! from outside. Application calls queue requests, [`handle_datagram`] feeds
//! in what the gateway sends and [`tick`] advances retransmission and
//! keepalive timers. None of these ever block or read the clock.
//!
//! Results of requests arrive through the handler passed with the request,
//! synchronously inside `handle_datagram` or `tick`.
//!
//! ```ignore
//! let on_subscribed = |outcome: Outcome<()>, granted: Subscription| { /* ... */ };
//! let mut client = MqttsnClient::<_, 8, 16, 256>::new(transport);
//! client.start(10000)?;
//! client.connect(MqttsnConfig::new(gateway, "node-1"), Instant::now())?;
//! // after CONNACK
//! client.subscribe("sensor/temp", QoS::AtLeastOnce, &on_subscribed, Instant::now())?;
//! ```
//!
//! [`handle_datagram`]: MqttsnClient::handle_datagram
//! [`tick`]: MqttsnClient::tick

use core::fmt;
use core::str::FromStr;

use embassy_net::IpEndpoint;
use embassy_time::{Duration, Instant};

use crate::dispatch::{
    Abort, AdvertiseHandler, Advertisement, ConnectedHandler, DisconnectReason,
    DisconnectedHandler, GatewayInfo, Handlers, Outcome, PublishReceivedHandler, PublishedHandler,
    ReceivedMessage, RegisterReceivedHandler, RegisteredHandler, SearchGwHandler,
    SubscribedHandler, Subscription, UnsubscribedHandler,
};
use crate::error::{EncodeError, MqttsnError, ReturnCode};
use crate::keepalive::{KeepAlive, KeepAliveAction};
use crate::packet::{
    Connect, Disconnect, EncodePacket, MqttsnPacket, PingReq, PubAck, Publish, QoS, RegAck,
    Register, SearchGw, ShortName, SubAck, Subscribe, Topic, TopicFilter, TopicId, Unsubscribe,
    WillMsg, WillTopic, decode,
};
use crate::registry::{MAX_TOPIC_NAME_LEN, Registration, TopicRegistry, topic_name};
use crate::transaction::{Pending, Retransmission, TransactionKind, TransactionTable};
use crate::transport::DatagramTransport;

/// Client id used by [`MqttsnConfig::new_default`].
pub const DEFAULT_CLIENT_ID: &str = "myrtio-mqttsn";

/// Longest client id MQTT-SN allows.
pub const MAX_CLIENT_ID_LEN: usize = 23;

/// Session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ClientState {
    Disconnected,
    Active,
    /// Gateway buffers messages until the client wakes up.
    Asleep,
    /// Receiving buffered messages after a wake-up ping.
    Awake,
    /// Keepalive or a session request timed out. Only `connect` leaves this
    /// state.
    Lost,
}

impl ClientState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientState::Disconnected => "Disconnected",
            ClientState::Active => "Active",
            ClientState::Asleep => "Asleep",
            ClientState::Awake => "Awake",
            ClientState::Lost => "Lost",
        }
    }

    /// Whether the gateway holds a session for this client.
    pub fn is_connected(&self) -> bool {
        matches!(
            self,
            ClientState::Active | ClientState::Asleep | ClientState::Awake
        )
    }
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClientState {
    type Err = MqttsnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Disconnected" => Ok(ClientState::Disconnected),
            "Active" => Ok(ClientState::Active),
            "Asleep" => Ok(ClientState::Asleep),
            "Awake" => Ok(ClientState::Awake),
            "Lost" => Ok(ClientState::Lost),
            _ => Err(MqttsnError::InvalidArgs),
        }
    }
}

/// Where the client goes once the gateway has flushed buffered messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum WakeMode {
    /// Back to sleep.
    Poll,
    /// Back to `Active`.
    Resume,
}

/// Last will registered with the gateway during connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Will<'a> {
    pub topic: &'a str,
    pub message: &'a [u8],
    pub qos: QoS,
    pub retain: bool,
}

/// Session parameters. Replaced as a whole on every `connect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MqttsnConfig<'a> {
    pub gateway: IpEndpoint,
    pub client_id: &'a str,
    /// Sent in CONNECT in whole seconds. Zero disables keepalive pings.
    pub keep_alive: Duration,
    pub clean_session: bool,
    pub retransmission_timeout: Duration,
    /// Retransmissions after the first send.
    pub retransmission_count: u8,
    pub will: Option<Will<'a>>,
}

impl<'a> MqttsnConfig<'a> {
    pub fn new(gateway: IpEndpoint, client_id: &'a str) -> Self {
        Self {
            gateway,
            client_id,
            keep_alive: Duration::from_secs(30),
            clean_session: true,
            retransmission_timeout: Duration::from_secs(10),
            retransmission_count: 3,
            will: None,
        }
    }

    /// Defaults with [`DEFAULT_CLIENT_ID`].
    pub fn new_default(gateway: IpEndpoint) -> Self {
        Self::new(gateway, DEFAULT_CLIENT_ID)
    }

    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn with_clean_session(mut self, clean_session: bool) -> Self {
        self.clean_session = clean_session;
        self
    }

    pub fn with_retransmission(mut self, timeout: Duration, count: u8) -> Self {
        self.retransmission_timeout = timeout;
        self.retransmission_count = count;
        self
    }

    pub fn with_will(mut self, will: Will<'a>) -> Self {
        self.will = Some(will);
        self
    }

    /// Checks every field against protocol limits.
    pub fn validate(&self) -> Result<(), MqttsnError> {
        if self.client_id.is_empty() || self.client_id.len() > MAX_CLIENT_ID_LEN {
            return Err(MqttsnError::InvalidArgs);
        }
        if self.retransmission_timeout.as_ticks() == 0 {
            return Err(MqttsnError::InvalidArgs);
        }
        if self.keep_alive.as_secs() > u64::from(u16::MAX) {
            return Err(MqttsnError::InvalidArgs);
        }
        if let Some(will) = self.will
            && (will.topic.is_empty()
                || will.topic.len() > MAX_TOPIC_NAME_LEN
                || will.qos == QoS::MinusOne)
        {
            return Err(MqttsnError::InvalidArgs);
        }
        Ok(())
    }

    fn keep_alive_secs(&self) -> u16 {
        u16::try_from(self.keep_alive.as_secs()).unwrap_or(u16::MAX)
    }

    fn retransmission(&self) -> Retransmission {
        Retransmission {
            timeout: self.retransmission_timeout,
            count: self.retransmission_count,
        }
    }
}

/// An MQTT-SN client bound to one datagram transport.
///
/// # Type Parameters
///
/// - `T`: The datagram transport.
/// - `MAX_PENDING`: Requests that may wait for an acknowledgment at once.
/// - `MAX_TOPICS`: Topic bindings the registry can hold.
/// - `BUF_SIZE`: Largest datagram the client sends.
pub struct MqttsnClient<
    'a,
    T,
    const MAX_PENDING: usize,
    const MAX_TOPICS: usize,
    const BUF_SIZE: usize,
> where
    T: DatagramTransport,
{
    transport: T,
    running: bool,
    state: ClientState,
    config: Option<MqttsnConfig<'a>>,
    transactions: TransactionTable<'a, MAX_PENDING, BUF_SIZE>,
    registry: TopicRegistry<MAX_TOPICS>,
    keepalive: KeepAlive,
    sleep_duration: Duration,
    handlers: Handlers<'a>,
    tx_buf: [u8; BUF_SIZE],
}

impl<'a, T, const MAX_PENDING: usize, const MAX_TOPICS: usize, const BUF_SIZE: usize>
    MqttsnClient<'a, T, MAX_PENDING, MAX_TOPICS, BUF_SIZE>
where
    T: DatagramTransport,
{
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            running: false,
            state: ClientState::Disconnected,
            config: None,
            transactions: TransactionTable::new(),
            registry: TopicRegistry::new(),
            keepalive: KeepAlive::new(),
            sleep_duration: Duration::from_ticks(0),
            handlers: Handlers::default(),
            tx_buf: [0; BUF_SIZE],
        }
    }

    /// Opens the transport on `port`.
    pub fn start(&mut self, port: u16) -> Result<(), MqttsnError> {
        if self.running {
            return Err(MqttsnError::AlreadyRunning);
        }
        self.transport.open(port).map_err(|_| {
            warn!("failed to open port {}", port);
            MqttsnError::Transport
        })?;
        self.running = true;
        info!("MQTT-SN client started on port {}", port);
        Ok(())
    }

    /// Tears the session down and closes the transport.
    ///
    /// Pending requests complete with [`Abort::SessionClosed`] and the topic
    /// registry is emptied.
    pub fn stop(&mut self) -> Result<(), MqttsnError> {
        if !self.running {
            return Err(MqttsnError::NotRunning);
        }
        let was_connected = self.state.is_connected();
        self.abort_all(Abort::SessionClosed);
        self.registry.clear();
        self.keepalive.stop();
        self.set_state(ClientState::Disconnected);
        self.transport.close();
        self.running = false;
        if was_connected {
            self.handlers.disconnected(DisconnectReason::Client);
        }
        info!("MQTT-SN client stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    /// Config of the current or last session.
    pub fn config(&self) -> Option<&MqttsnConfig<'a>> {
        self.config.as_ref()
    }

    pub fn registry(&self) -> &TopicRegistry<MAX_TOPICS> {
        &self.registry
    }

    /// Makes a predefined topic id resolvable to `name` for inbound messages.
    pub fn add_predefined(&mut self, name: &str, id: TopicId) -> Result<(), MqttsnError> {
        self.registry.add_predefined(name, id)
    }

    /// Number of requests waiting for an acknowledgment.
    pub fn pending_requests(&self) -> usize {
        self.transactions.len()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Replaces the handler told about every CONNACK or connect timeout.
    pub fn set_connected_handler(&mut self, handler: ConnectedHandler<'a>) {
        self.handlers.connected = Some(handler);
    }

    pub fn set_disconnected_handler(&mut self, handler: DisconnectedHandler<'a>) {
        self.handlers.disconnected = Some(handler);
    }

    /// Replaces the handler for inbound PUBLISH. Its return value is sent
    /// back in the PUBACK of QoS 1 messages.
    pub fn set_publish_received_handler(&mut self, handler: PublishReceivedHandler<'a>) {
        self.handlers.publish_received = Some(handler);
    }

    pub fn set_register_received_handler(&mut self, handler: RegisterReceivedHandler<'a>) {
        self.handlers.register_received = Some(handler);
    }

    /// Replaces the handler for GWINFO answers to [`search_gateway`](Self::search_gateway).
    pub fn set_searchgw_handler(&mut self, handler: SearchGwHandler<'a>) {
        self.handlers.searchgw = Some(handler);
    }

    pub fn set_advertise_handler(&mut self, handler: AdvertiseHandler<'a>) {
        self.handlers.advertise = Some(handler);
    }

    /// Broadcasts SEARCHGW to `endpoint`, usually a multicast group.
    ///
    /// Works in any state while running. Answers go to the search handler
    /// whichever peer sends them.
    pub fn search_gateway(
        &mut self,
        endpoint: IpEndpoint,
        radius: u8,
        now: Instant,
    ) -> Result<(), MqttsnError> {
        self.ensure_running()?;
        self.send_packet(endpoint, &SearchGw { radius }, now)?;
        debug!("SEARCHGW sent with radius {}", radius);
        Ok(())
    }

    /// Sends CONNECT and waits for CONNACK.
    ///
    /// Legal from `Disconnected` and `Lost`. The outcome goes to the
    /// connected handler.
    pub fn connect(&mut self, config: MqttsnConfig<'a>, now: Instant) -> Result<(), MqttsnError> {
        self.ensure_running()?;
        config.validate()?;
        if !matches!(self.state, ClientState::Disconnected | ClientState::Lost)
            || self.transactions.has_kind(TransactionKind::Connect)
        {
            return Err(MqttsnError::InvalidState);
        }

        let connect = Connect {
            will: config.will.is_some(),
            clean_session: config.clean_session,
            duration: config.keep_alive_secs(),
            client_id: config.client_id,
        };
        let previous = self.config.replace(config);
        if let Err(err) = self.request(Pending::Connect, now, |_, buf| connect.encode(buf)) {
            self.config = previous;
            return Err(err);
        }

        if config.clean_session {
            self.registry.clear();
        }
        self.set_state(ClientState::Disconnected);
        debug!("CONNECT sent as {}", config.client_id);
        Ok(())
    }

    /// [`connect`](Self::connect) with [`MqttsnConfig::new_default`].
    pub fn connect_default(&mut self, gateway: IpEndpoint, now: Instant) -> Result<(), MqttsnError> {
        self.connect(MqttsnConfig::new_default(gateway), now)
    }

    /// Subscribes to a topic name or wildcard filter.
    ///
    /// When SUBACK carries a topic id the name is bound to it in the
    /// registry.
    pub fn subscribe(
        &mut self,
        topic: &str,
        qos: QoS,
        handler: SubscribedHandler<'a>,
        now: Instant,
    ) -> Result<(), MqttsnError> {
        let name = topic_name(topic)?;
        self.subscribe_with(TopicFilter::Name(topic), qos, handler, Some(name), now)
    }

    /// Subscribes to a one or two character short topic name.
    pub fn subscribe_short(
        &mut self,
        topic: &str,
        qos: QoS,
        handler: SubscribedHandler<'a>,
        now: Instant,
    ) -> Result<(), MqttsnError> {
        let short = ShortName::new(topic)?;
        self.subscribe_with(TopicFilter::Short(short), qos, handler, None, now)
    }

    /// Subscribes to a predefined topic id.
    pub fn subscribe_topic_id(
        &mut self,
        topic_id: TopicId,
        qos: QoS,
        handler: SubscribedHandler<'a>,
        now: Instant,
    ) -> Result<(), MqttsnError> {
        if topic_id == 0 {
            return Err(MqttsnError::InvalidArgs);
        }
        self.subscribe_with(TopicFilter::Predefined(topic_id), qos, handler, None, now)
    }

    fn subscribe_with(
        &mut self,
        filter: TopicFilter<'_>,
        qos: QoS,
        handler: SubscribedHandler<'a>,
        name: Option<heapless::String<MAX_TOPIC_NAME_LEN>>,
        now: Instant,
    ) -> Result<(), MqttsnError> {
        if qos == QoS::MinusOne {
            return Err(MqttsnError::InvalidArgs);
        }
        self.ensure_active()?;
        let msg_id = self.request(Pending::Subscribe { handler, qos, name }, now, |msg_id, buf| {
            Subscribe {
                dup: false,
                qos,
                msg_id,
                topic: filter,
            }
            .encode(buf)
        })?;
        debug!("SUBSCRIBE sent, message id {}", msg_id);
        Ok(())
    }

    /// Obtains a topic id for `topic`.
    ///
    /// Short names resolve at once and the handler runs before this returns.
    /// Longer names go through REGISTER/REGACK.
    pub fn register(
        &mut self,
        topic: &str,
        handler: RegisteredHandler<'a>,
        now: Instant,
    ) -> Result<(), MqttsnError> {
        let registration = self.registry.register(topic)?;
        self.ensure_active()?;
        match registration {
            Registration::Resolved(resolved) => {
                handler(Outcome::Accepted(resolved.id()));
                Ok(())
            }
            Registration::Pending => {
                let name = topic_name(topic)?;
                let msg_id = self.request(Pending::Register { handler, name }, now, |msg_id, buf| {
                    Register {
                        topic_id: 0,
                        msg_id,
                        topic_name: topic,
                    }
                    .encode(buf)
                })?;
                debug!("REGISTER sent, message id {}", msg_id);
                Ok(())
            }
        }
    }

    pub fn unsubscribe(
        &mut self,
        topic: &str,
        handler: UnsubscribedHandler<'a>,
        now: Instant,
    ) -> Result<(), MqttsnError> {
        if topic.is_empty() || topic.len() > MAX_TOPIC_NAME_LEN {
            return Err(MqttsnError::InvalidArgs);
        }
        self.unsubscribe_with(TopicFilter::Name(topic), handler, now)
    }

    pub fn unsubscribe_short(
        &mut self,
        topic: &str,
        handler: UnsubscribedHandler<'a>,
        now: Instant,
    ) -> Result<(), MqttsnError> {
        let short = ShortName::new(topic)?;
        self.unsubscribe_with(TopicFilter::Short(short), handler, now)
    }

    pub fn unsubscribe_topic_id(
        &mut self,
        topic_id: TopicId,
        handler: UnsubscribedHandler<'a>,
        now: Instant,
    ) -> Result<(), MqttsnError> {
        if topic_id == 0 {
            return Err(MqttsnError::InvalidArgs);
        }
        self.unsubscribe_with(TopicFilter::Predefined(topic_id), handler, now)
    }

    fn unsubscribe_with(
        &mut self,
        filter: TopicFilter<'_>,
        handler: UnsubscribedHandler<'a>,
        now: Instant,
    ) -> Result<(), MqttsnError> {
        self.ensure_active()?;
        self.request(Pending::Unsubscribe { handler }, now, |msg_id, buf| {
            Unsubscribe {
                msg_id,
                topic: filter,
            }
            .encode(buf)
        })?;
        Ok(())
    }

    /// Publishes to a registered, predefined or short topic.
    ///
    /// QoS 0 goes out once and the handler, if any, runs immediately. QoS 1
    /// waits for PUBACK. QoS 2 answers PUBREC with PUBREL and completes on
    /// PUBCOMP. QoS -1 is rejected; see
    /// [`publish_unconnected`](Self::publish_unconnected).
    pub fn publish(
        &mut self,
        topic: Topic,
        data: &[u8],
        qos: QoS,
        retain: bool,
        handler: Option<PublishedHandler<'a>>,
        now: Instant,
    ) -> Result<(), MqttsnError> {
        if matches!(topic, Topic::Normal(0) | Topic::Predefined(0))
            || qos == QoS::MinusOne
        {
            return Err(MqttsnError::InvalidArgs);
        }
        self.ensure_active()?;

        let publish = |msg_id| Publish {
            dup: false,
            qos,
            retain,
            topic,
            msg_id,
            data,
        };
        match qos {
            QoS::AtMostOnce => {
                self.send_to_gateway(&publish(0), now)?;
                if let Some(handler) = handler {
                    handler(Outcome::Accepted(()));
                }
            }
            QoS::AtLeastOnce | QoS::ExactlyOnce => {
                let pending = if qos == QoS::AtLeastOnce {
                    Pending::Publish { handler }
                } else {
                    Pending::PublishQos2 { handler }
                };
                self.request(pending, now, |msg_id, buf| publish(msg_id).encode(buf))?;
            }
            QoS::MinusOne => return Err(MqttsnError::InvalidArgs),
        }
        Ok(())
    }

    /// Publishes under the id the registry holds for `topic`.
    ///
    /// Fails with `InvalidArgs` when the name has not been registered.
    pub fn publish_by_name(
        &mut self,
        topic: &str,
        data: &[u8],
        qos: QoS,
        retain: bool,
        handler: Option<PublishedHandler<'a>>,
        now: Instant,
    ) -> Result<(), MqttsnError> {
        let resolved = self
            .registry
            .resolve_id(topic)
            .ok_or(MqttsnError::InvalidArgs)?;
        self.publish(resolved, data, qos, retain, handler, now)
    }

    /// Sends a QoS -1 PUBLISH to any gateway, connected or not.
    ///
    /// Only short names and predefined ids can be used without a session.
    pub fn publish_unconnected(
        &mut self,
        gateway: IpEndpoint,
        topic: Topic,
        data: &[u8],
        retain: bool,
        now: Instant,
    ) -> Result<(), MqttsnError> {
        if !matches!(topic, Topic::Short(_) | Topic::Predefined(1..)) {
            return Err(MqttsnError::InvalidArgs);
        }
        self.ensure_running()?;
        let publish = Publish {
            dup: false,
            qos: QoS::MinusOne,
            retain,
            topic,
            msg_id: 0,
            data,
        };
        self.send_packet(gateway, &publish, now)
    }

    /// Ends the session.
    ///
    /// From a connected state every pending request completes with
    /// [`Abort::SessionClosed`] and DISCONNECT is sent; the client becomes
    /// `Disconnected` when the gateway answers or the request times out.
    /// From `Lost` the client becomes `Disconnected` at once, and from
    /// `Disconnected` an outstanding connect is cancelled.
    pub fn disconnect(&mut self, now: Instant) -> Result<(), MqttsnError> {
        self.ensure_running()?;
        match self.state {
            ClientState::Lost => {
                self.set_state(ClientState::Disconnected);
                Ok(())
            }
            ClientState::Disconnected => {
                let tx = self
                    .transactions
                    .take_kind(TransactionKind::Connect)
                    .ok_or(MqttsnError::InvalidState)?;
                self.handlers.abort(tx.pending, Abort::SessionClosed);
                Ok(())
            }
            _ => {
                if self.transactions.has_kind(TransactionKind::Disconnect) {
                    return Err(MqttsnError::InvalidState);
                }
                self.abort_all(Abort::SessionClosed);
                self.request(Pending::Disconnect, now, |_, buf| {
                    Disconnect { duration: None }.encode(buf)
                })?;
                debug!("DISCONNECT sent");
                Ok(())
            }
        }
    }

    /// Asks the gateway to buffer messages for `duration`.
    ///
    /// On acknowledgment the client becomes `Asleep` and must call
    /// [`awake`](Self::awake) before `duration` runs out.
    pub fn sleep(&mut self, duration: Duration, now: Instant) -> Result<(), MqttsnError> {
        let secs = u16::try_from(duration.as_secs()).map_err(|_| MqttsnError::InvalidArgs)?;
        if secs == 0 {
            return Err(MqttsnError::InvalidArgs);
        }
        self.ensure_running()?;
        if !self.state.is_connected() || self.session_request_pending() {
            return Err(MqttsnError::InvalidState);
        }
        self.request(Pending::Sleep { duration: secs }, now, |_, buf| {
            Disconnect {
                duration: Some(secs),
            }
            .encode(buf)
        })?;
        debug!("sleep requested for {} s", secs);
        Ok(())
    }

    /// Pings the gateway from `Asleep` to collect buffered messages.
    ///
    /// The client is `Awake` while messages arrive. The closing PINGRESP
    /// puts it back to sleep or into `Active`, depending on `mode`.
    pub fn awake(&mut self, mode: WakeMode, now: Instant) -> Result<(), MqttsnError> {
        self.ensure_running()?;
        if self.state != ClientState::Asleep || self.session_request_pending() {
            return Err(MqttsnError::InvalidState);
        }
        let client_id = self.config.ok_or(MqttsnError::InvalidState)?.client_id;
        self.request(Pending::Awake { mode }, now, |_, buf| {
            PingReq {
                client_id: Some(client_id),
            }
            .encode(buf)
        })?;
        Ok(())
    }

    /// Processes one datagram received on the transport.
    ///
    /// GWINFO and ADVERTISE are accepted from any peer. Everything else not
    /// from the configured gateway, malformed or of a type the client does
    /// not handle is dropped.
    pub fn handle_datagram(&mut self, now: Instant, source: IpEndpoint, datagram: &[u8]) {
        if !self.running {
            return;
        }
        let packet = match decode(datagram) {
            Ok(packet) => packet,
            Err(err) => {
                debug!("dropping malformed datagram: {}", err);
                return;
            }
        };

        match packet {
            MqttsnPacket::GwInfo(info) => {
                self.handlers.gateway_info(&GatewayInfo {
                    gateway_id: info.gateway_id,
                    source,
                    address: (!info.address.is_empty()).then_some(info.address),
                });
                return;
            }
            MqttsnPacket::Advertise(advertise) => {
                self.handlers.advertise(Advertisement {
                    gateway_id: advertise.gateway_id,
                    source,
                    duration: Duration::from_secs(advertise.duration.into()),
                });
                return;
            }
            MqttsnPacket::SearchGw(_) => {
                trace!("ignoring SEARCHGW from another client");
                return;
            }
            _ => {}
        }

        let Some(config) = self.config else {
            return;
        };
        if source != config.gateway {
            trace!("dropping datagram from a peer other than the gateway");
            return;
        }

        self.keepalive.on_received(now);
        if self.state == ClientState::Asleep && self.transactions.has_kind(TransactionKind::Awake) {
            self.set_state(ClientState::Awake);
        }

        match packet {
            MqttsnPacket::ConnAck(ack) => self.on_connack(ack.return_code, now),
            MqttsnPacket::WillTopicReq => self.on_will_topic_request(now),
            MqttsnPacket::WillMsgReq => self.on_will_message_request(now),
            MqttsnPacket::Register(register) => self.on_register(register, now),
            MqttsnPacket::RegAck(ack) => self.on_regack(ack),
            MqttsnPacket::Publish(publish) => self.on_publish(publish, now),
            MqttsnPacket::PubAck(ack) => self.on_puback(ack),
            MqttsnPacket::PubRec(msg_id) => self.on_pubrec(msg_id, now),
            MqttsnPacket::PubRel(msg_id) => self.reply(&MqttsnPacket::PubComp(msg_id), now),
            MqttsnPacket::PubComp(msg_id) => self.on_pubcomp(msg_id),
            MqttsnPacket::SubAck(ack) => self.on_suback(ack),
            MqttsnPacket::UnsubAck(msg_id) => self.on_unsuback(msg_id),
            MqttsnPacket::PingReq(_) => self.reply(&MqttsnPacket::PingResp, now),
            MqttsnPacket::PingResp => self.on_pingresp(now),
            MqttsnPacket::Disconnect(_) => self.on_disconnect(now),
            other => trace!("ignoring message type {}", other.msg_type()),
        }
    }

    /// Advances retransmission and keepalive timers.
    ///
    /// Expected to run periodically, e.g. every 100 ms.
    pub fn tick(&mut self, now: Instant) {
        if !self.running {
            return;
        }
        let Some(config) = self.config else {
            return;
        };

        if self.state.is_connected() {
            match self.keepalive.poll(now, config.retransmission_count) {
                KeepAliveAction::SendPing => {
                    trace!("keepalive PINGREQ");
                    self.reply(&PingReq { client_id: None }, now);
                }
                KeepAliveAction::Lost => {
                    self.enter_lost();
                    return;
                }
                KeepAliveAction::Idle => {}
            }
        }

        let transport = &mut self.transport;
        let expired =
            self.transactions
                .tick(now, config.retransmission_timeout, |msg_id, bytes| {
                    debug!("retransmitting message {}", msg_id);
                    let _ = transmit(&mut *transport, config.gateway, bytes);
                });
        for expired in expired {
            warn!("message {} timed out", expired.msg_id);
            match expired.pending {
                Pending::Disconnect => self.enter_disconnected(DisconnectReason::Client),
                Pending::Sleep { .. } | Pending::Awake { .. } => self.enter_lost(),
                pending => self.handlers.abort(pending, Abort::Timeout),
            }
        }
    }

    fn on_connack(&mut self, code: ReturnCode, now: Instant) {
        if self
            .transactions
            .take_kind(TransactionKind::Connect)
            .is_none()
        {
            debug!("dropping CONNACK without a pending connect");
            return;
        }
        if code.is_accepted() {
            if let Some(config) = self.config {
                self.keepalive.start(now, config.keep_alive, true);
            }
            self.set_state(ClientState::Active);
        } else {
            warn!("connect rejected with code {}", u8::from(code));
        }
        self.handlers.connected(Outcome::from_code(code, ()));
    }

    fn on_will_topic_request(&mut self, now: Instant) {
        let will = self.config.and_then(|config| config.will);
        match will {
            Some(will) if self.transactions.has_kind(TransactionKind::Connect) => self.reply(
                &WillTopic {
                    qos: will.qos,
                    retain: will.retain,
                    topic: will.topic,
                },
                now,
            ),
            _ => debug!("ignoring WILLTOPICREQ"),
        }
    }

    fn on_will_message_request(&mut self, now: Instant) {
        let will = self.config.and_then(|config| config.will);
        match will {
            Some(will) if self.transactions.has_kind(TransactionKind::Connect) => {
                self.reply(
                    &WillMsg {
                        message: will.message,
                    },
                    now,
                )
            }
            _ => debug!("ignoring WILLMSGREQ"),
        }
    }

    fn on_register(&mut self, register: Register<'_>, now: Instant) {
        if !self.state.is_connected() {
            debug!("dropping REGISTER outside a session");
            return;
        }
        let return_code = match self.registry.bind(register.topic_name, register.topic_id) {
            Ok(()) => ReturnCode::Accepted,
            Err(_) if register.topic_id == 0 => ReturnCode::RejectedTopicId,
            Err(MqttsnError::ResourceExhausted) => ReturnCode::RejectedCongestion,
            Err(_) => ReturnCode::RejectedNotSupported,
        };
        self.reply(
            &RegAck {
                topic_id: register.topic_id,
                msg_id: register.msg_id,
                return_code,
            },
            now,
        );
        if return_code.is_accepted() {
            self.handlers
                .register_received(register.topic_id, register.topic_name);
        }
    }

    fn on_regack(&mut self, ack: RegAck) {
        let Some(tx) = self.transactions.take(ack.msg_id, TransactionKind::Register) else {
            debug!("dropping stale REGACK {}", ack.msg_id);
            return;
        };
        let Pending::Register { handler, name } = tx.pending else {
            return;
        };
        let return_code = if ack.return_code.is_accepted() && ack.topic_id == 0 {
            warn!("REGACK {} accepted without a topic id", ack.msg_id);
            ReturnCode::RejectedTopicId
        } else {
            ack.return_code
        };
        if return_code.is_accepted() && self.registry.bind(&name, ack.topic_id).is_err() {
            warn!("no registry slot for topic id {}", ack.topic_id);
        }
        handler(Outcome::from_code(return_code, ack.topic_id));
    }

    fn on_publish(&mut self, publish: Publish<'_>, now: Instant) {
        if !self.state.is_connected() {
            debug!("dropping PUBLISH outside a session");
            return;
        }
        let return_code = {
            let message = ReceivedMessage {
                topic: publish.topic,
                topic_name: self.registry.resolve_topic(&publish.topic),
                payload: publish.data,
                qos: publish.qos,
                retain: publish.retain,
                dup: publish.dup,
            };
            self.handlers.publish_received(&message)
        };
        match publish.qos {
            QoS::AtLeastOnce => self.reply(
                &PubAck {
                    topic_id: publish.topic.id(),
                    msg_id: publish.msg_id,
                    return_code,
                },
                now,
            ),
            QoS::ExactlyOnce => self.reply(&MqttsnPacket::PubRec(publish.msg_id), now),
            QoS::AtMostOnce | QoS::MinusOne => {}
        }
    }

    fn on_puback(&mut self, ack: PubAck) {
        let Some(tx) = self.transactions.take(ack.msg_id, TransactionKind::Publish) else {
            debug!("dropping stale PUBACK {}", ack.msg_id);
            return;
        };
        if let Pending::Publish {
            handler: Some(handler),
        } = tx.pending
        {
            handler(Outcome::from_code(ack.return_code, ()));
        }
    }

    /// Answers PUBREC with PUBREL, which is kept under the same message id
    /// until PUBCOMP arrives.
    fn on_pubrec(&mut self, msg_id: u16, now: Instant) {
        if self
            .transactions
            .iter()
            .any(|tx| tx.msg_id == msg_id && tx.pending.kind() == TransactionKind::PubRel)
        {
            self.reply(&MqttsnPacket::PubRel(msg_id), now);
            return;
        }
        let Some(tx) = self.transactions.take(msg_id, TransactionKind::PublishQos2) else {
            debug!("dropping stale PUBREC {}", msg_id);
            return;
        };
        let Pending::PublishQos2 { handler } = tx.pending else {
            return;
        };
        let Some(config) = self.config else {
            return;
        };
        let inserted = self.transactions.insert_with_id(
            msg_id,
            Pending::PubRel { handler },
            now,
            config.retransmission(),
            |msg_id, buf| MqttsnPacket::PubRel(msg_id).encode(buf),
        );
        match inserted {
            Ok(tx) => {
                if transmit(&mut self.transport, config.gateway, tx.payload()).is_ok() {
                    self.keepalive.on_sent(now);
                }
            }
            Err(err) => {
                warn!("cannot track PUBREL {}: {}", msg_id, err);
                if let Some(handler) = handler {
                    handler(Outcome::Aborted(Abort::Timeout));
                }
            }
        }
    }

    fn on_pubcomp(&mut self, msg_id: u16) {
        let Some(tx) = self.transactions.take(msg_id, TransactionKind::PubRel) else {
            debug!("dropping stale PUBCOMP {}", msg_id);
            return;
        };
        if let Pending::PubRel {
            handler: Some(handler),
        } = tx.pending
        {
            handler(Outcome::Accepted(()));
        }
    }

    fn on_suback(&mut self, ack: SubAck) {
        let Some(tx) = self.transactions.take(ack.msg_id, TransactionKind::Subscribe) else {
            debug!("dropping stale SUBACK {}", ack.msg_id);
            return;
        };
        let Pending::Subscribe { handler, qos, name } = tx.pending else {
            return;
        };
        if ack.return_code.is_accepted() {
            if ack.qos != qos {
                debug!("granted QoS {} instead of {}", ack.qos.as_str(), qos.as_str());
            }
            if ack.topic_id != 0
                && let Some(name) = &name
                && self.registry.bind(name, ack.topic_id).is_err()
            {
                warn!("no registry slot for topic id {}", ack.topic_id);
            }
        }
        handler(
            Outcome::from_code(ack.return_code, ()),
            Subscription {
                topic_id: ack.topic_id,
                qos: ack.qos,
            },
        );
    }

    fn on_unsuback(&mut self, msg_id: u16) {
        match self.transactions.take(msg_id, TransactionKind::Unsubscribe) {
            Some(tx) => {
                if let Pending::Unsubscribe { handler } = tx.pending {
                    handler(Outcome::Accepted(()));
                }
            }
            None => debug!("dropping stale UNSUBACK {}", msg_id),
        }
    }

    fn on_pingresp(&mut self, now: Instant) {
        let Some(tx) = self.transactions.take_kind(TransactionKind::Awake) else {
            return;
        };
        let Pending::Awake { mode } = tx.pending else {
            return;
        };
        match mode {
            WakeMode::Poll => {
                self.keepalive.start(now, self.sleep_duration, false);
                self.set_state(ClientState::Asleep);
            }
            WakeMode::Resume => {
                if let Some(config) = self.config {
                    self.keepalive.start(now, config.keep_alive, true);
                }
                self.set_state(ClientState::Active);
            }
        }
    }

    fn on_disconnect(&mut self, now: Instant) {
        if self
            .transactions
            .take_kind(TransactionKind::Disconnect)
            .is_some()
        {
            self.enter_disconnected(DisconnectReason::Client);
        } else if let Some(tx) = self.transactions.take_kind(TransactionKind::Sleep) {
            if let Pending::Sleep { duration } = tx.pending {
                self.sleep_duration = Duration::from_secs(duration.into());
            }
            self.keepalive.start(now, self.sleep_duration, false);
            self.set_state(ClientState::Asleep);
            self.handlers.disconnected(DisconnectReason::Asleep);
        } else if self.state.is_connected() {
            warn!("gateway closed the session");
            self.enter_disconnected(DisconnectReason::Server);
        } else {
            debug!("dropping DISCONNECT outside a session");
        }
    }

    fn enter_disconnected(&mut self, reason: DisconnectReason) {
        self.abort_all(Abort::SessionClosed);
        self.keepalive.stop();
        if self.clean_session() {
            self.registry.clear();
        }
        self.set_state(ClientState::Disconnected);
        self.handlers.disconnected(reason);
    }

    fn enter_lost(&mut self) {
        warn!("gateway unreachable, session lost");
        self.abort_all(Abort::ConnectionLost);
        self.keepalive.stop();
        if self.clean_session() {
            self.registry.clear();
        }
        self.set_state(ClientState::Lost);
        self.handlers.disconnected(DisconnectReason::Timeout);
    }

    fn abort_all(&mut self, reason: Abort) {
        let handlers = self.handlers;
        for tx in self.transactions.drain() {
            handlers.abort(tx.pending, reason);
        }
    }

    fn set_state(&mut self, state: ClientState) {
        if self.state != state {
            info!("state {} -> {}", self.state.as_str(), state.as_str());
            self.state = state;
        }
    }

    fn clean_session(&self) -> bool {
        self.config.is_some_and(|config| config.clean_session)
    }

    /// Whether a disconnect, sleep or wake-up is in flight.
    fn session_request_pending(&self) -> bool {
        self.transactions.has_kind(TransactionKind::Disconnect)
            || self.transactions.has_kind(TransactionKind::Sleep)
            || self.transactions.has_kind(TransactionKind::Awake)
    }

    fn ensure_running(&self) -> Result<(), MqttsnError> {
        if self.running {
            Ok(())
        } else {
            Err(MqttsnError::NotRunning)
        }
    }

    fn ensure_active(&self) -> Result<(), MqttsnError> {
        self.ensure_running()?;
        if self.state != ClientState::Active || self.session_request_pending() {
            return Err(MqttsnError::InvalidState);
        }
        Ok(())
    }

    /// Stores a request in the transaction table and sends it.
    ///
    /// If the first send fails the request is dropped again, so the caller's
    /// error is the only outcome it ever sees.
    fn request(
        &mut self,
        pending: Pending<'a>,
        now: Instant,
        encode: impl FnOnce(u16, &mut [u8]) -> Result<usize, EncodeError>,
    ) -> Result<u16, MqttsnError> {
        let config = self.config.ok_or(MqttsnError::InvalidState)?;
        let tx = self
            .transactions
            .insert(pending, now, config.retransmission(), encode)?;
        let msg_id = tx.msg_id;
        if let Err(err) = transmit(&mut self.transport, config.gateway, tx.payload()) {
            self.transactions.remove(msg_id);
            return Err(err);
        }
        self.keepalive.on_sent(now);
        Ok(msg_id)
    }

    fn send_to_gateway<P: EncodePacket>(&mut self, packet: &P, now: Instant) -> Result<(), MqttsnError> {
        let gateway = self.config.ok_or(MqttsnError::InvalidState)?.gateway;
        self.send_packet(gateway, packet, now)
    }

    fn send_packet<P: EncodePacket>(
        &mut self,
        endpoint: IpEndpoint,
        packet: &P,
        now: Instant,
    ) -> Result<(), MqttsnError> {
        let len = packet.encode(&mut self.tx_buf)?;
        transmit(&mut self.transport, endpoint, &self.tx_buf[..len])?;
        if self.config.is_some_and(|config| config.gateway == endpoint) {
            self.keepalive.on_sent(now);
        }
        Ok(())
    }

    /// Sends a message that expects no answer. Failures are only logged.
    fn reply<P: EncodePacket>(&mut self, packet: &P, now: Instant) {
        if self.send_to_gateway(packet, now).is_err() {
            debug!("failed to send message type {}", packet.msg_type());
        }
    }
}

fn transmit<T: DatagramTransport>(
    transport: &mut T,
    endpoint: IpEndpoint,
    bytes: &[u8],
) -> Result<(), MqttsnError> {
    transport.send_to(endpoint, bytes).map_err(|_| {
        warn!("send of {} bytes failed", bytes.len());
        MqttsnError::Transport
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use embassy_net::IpAddress;

    fn gateway() -> IpEndpoint {
        IpEndpoint::new(IpAddress::v4(10, 0, 0, 1), 10000)
    }

    #[test]
    fn test_config_defaults() {
        let config = MqttsnConfig::new_default(gateway());
        assert_eq!(config.client_id, DEFAULT_CLIENT_ID);
        assert_eq!(config.keep_alive, Duration::from_secs(30));
        assert_eq!(config.retransmission_timeout, Duration::from_secs(10));
        assert_eq!(config.retransmission_count, 3);
        assert!(config.clean_session);
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn test_config_validation() {
        let base = MqttsnConfig::new(gateway(), "dev1");
        assert_eq!(
            MqttsnConfig::new(gateway(), "").validate(),
            Err(MqttsnError::InvalidArgs)
        );
        assert_eq!(
            MqttsnConfig::new(gateway(), "a-client-id-that-is-far-too-long").validate(),
            Err(MqttsnError::InvalidArgs)
        );
        assert_eq!(
            base.with_retransmission(Duration::from_secs(0), 3).validate(),
            Err(MqttsnError::InvalidArgs)
        );
        assert_eq!(
            base.with_keep_alive(Duration::from_secs(70_000)).validate(),
            Err(MqttsnError::InvalidArgs)
        );
        let will = Will {
            topic: "node/status",
            message: b"offline",
            qos: QoS::MinusOne,
            retain: true,
        };
        assert_eq!(base.with_will(will).validate(), Err(MqttsnError::InvalidArgs));
        assert_eq!(
            base.with_keep_alive(Duration::from_secs(0)).validate(),
            Ok(())
        );
    }

    #[test]
    fn test_state_strings() {
        for state in [
            ClientState::Disconnected,
            ClientState::Active,
            ClientState::Asleep,
            ClientState::Awake,
            ClientState::Lost,
        ] {
            assert_eq!(state.as_str().parse::<ClientState>(), Ok(state));
        }
        assert_eq!("Sleeping".parse::<ClientState>(), Err(MqttsnError::InvalidArgs));
        assert!(ClientState::Awake.is_connected());
        assert!(!ClientState::Lost.is_connected());
    }
}
