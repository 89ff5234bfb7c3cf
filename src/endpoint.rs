//! The message exchange layer.
//!
//! A [`CoapEndpoint`] owns one transport. Every inbound datagram goes through
//! [`CoapEndpoint::deliver`]: it is decoded, checked against the
//! deduplicator, and then either correlated with a pending local exchange or
//! turned into a new remote exchange whose request is handed to the
//! configured [`RequestHandler`]. Outbound datagrams are queued on the
//! [`Outbox`] and written by a single writer task; confirmable ones are
//! retransmitted by the [`ReliabilityLayer`] until they are answered.

use std::io::{self, Error, ErrorKind};
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures::{FutureExt, Stream, StreamExt};
use log::{debug, error, trace, warn};
use tokio::net::{ToSocketAddrs, UdpSocket};
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tokio_stream::wrappers::IntervalStream;
use tokio_util::sync::CancellationToken;

use crate::block::{BlockCache, BlockOutcome};
use crate::config::CoapConfig;
use crate::dedup::{self, Deduplicator};
use crate::exchange::{
    Exchange, ExchangeEvent, ExchangeState, ExchangeStore, KeyMid, KeyToken, Origin,
};
use crate::ids::{MessageIdProvider, RandomTokens, SequentialIds, TokenProvider};
use crate::message::{
    CoapOption, CoapRequest, CoapResponse, MessageClass, MessageType, Method, ObserveOption, Packet,
    Status,
};
use crate::observer::{ChangeNotifier, ObserveManager, ObserveRelation};
use crate::reliability::{ReliabilityLayer, Retransmitter, TransmissionParams};
use crate::resource::{Request, RequestHandler};
use crate::transport::{run_writer, Datagram, Outbox, Transport};

pub const COAP_MTU: usize = 1600;

pub(crate) struct EndpointInner {
    config: CoapConfig,
    transport: Arc<dyn Transport>,
    outbox: Arc<Outbox>,
    ids: Arc<dyn MessageIdProvider>,
    tokens: Arc<dyn TokenProvider>,
    exchanges: ExchangeStore,
    dedup: Arc<dyn Deduplicator>,
    reliability: ReliabilityLayer,
    observe: ObserveManager,
    blocks: BlockCache,
    handler: RwLock<Option<Arc<dyn RequestHandler>>>,
    notifier: RwLock<ChangeNotifier>,
    shutdown: Mutex<CancellationToken>,
}

pub struct CoapEndpoint {
    inner: Arc<EndpointInner>,
    tasks: Vec<JoinHandle<()>>,
}

impl CoapEndpoint {
    pub fn new(transport: Arc<dyn Transport>, config: CoapConfig) -> CoapEndpoint {
        CoapEndpoint::with_providers(
            transport,
            config,
            Arc::new(SequentialIds::random()),
            Arc::new(RandomTokens::default()),
        )
    }

    /// Creates an endpoint with explicit message ID and token sources.
    pub fn with_providers(
        transport: Arc<dyn Transport>,
        config: CoapConfig,
        ids: Arc<dyn MessageIdProvider>,
        tokens: Arc<dyn TokenProvider>,
    ) -> CoapEndpoint {
        let inner = EndpointInner {
            outbox: Arc::new(Outbox::new(config.send_queue_capacity, config.backpressure)),
            dedup: dedup::from_config(&config),
            reliability: ReliabilityLayer::new(TransmissionParams::from_config(&config)),
            blocks: BlockCache::new(config.preferred_block_size),
            observe: ObserveManager::new(),
            exchanges: ExchangeStore::new(),
            handler: RwLock::new(None),
            notifier: RwLock::new(ChangeNotifier::new()),
            shutdown: Mutex::new(CancellationToken::new()),
            transport,
            ids,
            tokens,
            config,
        };
        CoapEndpoint {
            inner: Arc::new(inner),
            tasks: Vec::new(),
        }
    }

    /// Binds a UDP socket and wraps it in an endpoint.
    pub async fn bind<A: ToSocketAddrs>(addr: A, config: CoapConfig) -> io::Result<CoapEndpoint> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(CoapEndpoint::new(Arc::new(socket), config))
    }

    pub fn config(&self) -> &CoapConfig {
        &self.inner.config
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.transport.local_addr()
    }

    pub fn set_handler<H: RequestHandler>(&self, handler: H) {
        self.set_shared_handler(Arc::new(handler));
    }

    pub fn set_shared_handler(&self, handler: Arc<dyn RequestHandler>) {
        *self
            .inner
            .handler
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    /// Subscribes the endpoint to resource changes published on `notifier`.
    /// Takes effect on the next `start`.
    pub fn set_notifier(&self, notifier: ChangeNotifier) {
        *self
            .inner
            .notifier
            .write()
            .unwrap_or_else(PoisonError::into_inner) = notifier;
    }

    pub fn notifier(&self) -> ChangeNotifier {
        self.inner.notifier()
    }

    pub fn is_running(&self) -> bool {
        !self.tasks.is_empty()
    }

    /// Spawns the receive loop, the writer, the sweeper and the change
    /// listener. Does nothing if already running.
    pub fn start(&mut self) {
        if self.is_running() {
            return;
        }
        let shutdown = CancellationToken::new();
        *self
            .inner
            .shutdown
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = shutdown.clone();
        self.inner.outbox.reopen();

        let inner = &self.inner;
        self.tasks.push(tokio::spawn(run_writer(
            inner.outbox.clone(),
            inner.transport.clone(),
            shutdown.clone(),
        )));
        self.tasks
            .push(tokio::spawn(inner.clone().receive_loop(shutdown.clone())));
        self.tasks
            .push(tokio::spawn(inner.clone().sweep_loop(shutdown.clone())));
        let changes = inner.notifier().subscribe();
        self.tasks
            .push(tokio::spawn(inner.clone().change_loop(changes, shutdown)));
        debug!("endpoint started on {:?}", self.local_addr());
    }

    /// Stops all tasks, cancels every pending retransmission and drops all
    /// in-flight exchanges and observe relations.
    pub async fn stop(&mut self) {
        self.inner.shutdown_token().cancel();
        self.inner.outbox.close();
        for task in self.tasks.drain(..) {
            task.abort();
            let _ = task.await;
        }
        self.inner.release();
        debug!("endpoint stopped");
    }

    /// Processes one inbound datagram from `source`.
    pub async fn deliver(&self, bytes: &[u8], source: SocketAddr) {
        self.inner.deliver(bytes, source).await
    }

    /// Queues a message as is. No exchange is created and nothing is
    /// retransmitted.
    pub async fn send(&self, packet: &Packet, peer: SocketAddr) -> io::Result<()> {
        let bytes = encode(packet)?;
        self.inner.outbox.push(Datagram::new(bytes, peer)).await
    }

    /// Sends a request and returns the receiver of its response(s). A fresh
    /// message ID is assigned, as is a token if the request has none.
    pub async fn send_request(
        &self,
        request: Packet,
        peer: SocketAddr,
    ) -> io::Result<ResponseReceiver> {
        self.inner.send_request(request, peer).await
    }

    /// Pushes a fresh representation of `path` to its observers.
    pub async fn notify_observers(&self, path: &str) {
        self.inner.notify_observers(path).await
    }

    pub fn observe_relations(&self) -> usize {
        self.inner.observe.relation_count()
    }

    /// Exchanges still waiting for an ACK or a response.
    pub fn pending_exchanges(&self) -> usize {
        self.inner
            .exchanges
            .pending_mids()
            .max(self.inner.exchanges.pending_tokens())
    }

    pub fn remembered_messages(&self) -> usize {
        self.inner.dedup.len()
    }

    pub fn dropped_datagrams(&self) -> u64 {
        self.inner.outbox.dropped()
    }
}

impl Drop for CoapEndpoint {
    fn drop(&mut self) {
        self.inner.shutdown_token().cancel();
        self.inner.outbox.close();
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.inner.release();
    }
}

fn encode(packet: &Packet) -> io::Result<Vec<u8>> {
    packet
        .to_bytes()
        .map_err(|e| Error::new(ErrorKind::InvalidInput, e.to_string()))
}

fn status_of(packet: &Packet) -> Option<Status> {
    match packet.header.code {
        MessageClass::Response(status) => Some(status),
        _ => None,
    }
}

fn bare_response(request: &Packet, status: Status) -> Packet {
    let mut response = Packet::new();
    response.header.code = MessageClass::Response(status);
    response.set_token(request.get_token().to_vec());
    response
}

impl EndpointInner {
    fn handler(&self) -> Option<Arc<dyn RequestHandler>> {
        self.handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn notifier(&self) -> ChangeNotifier {
        self.notifier
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn shutdown_token(&self) -> CancellationToken {
        self.shutdown
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn stopped(&self) -> bool {
        self.shutdown_token().is_cancelled()
    }

    fn release(&self) {
        for exchange in self.exchanges.drain() {
            let mut inner = exchange.lock();
            inner.cancel_retransmission();
            inner.events = None;
        }
        self.observe.clear();
        self.dedup.clear();
        self.blocks.clear();
    }

    async fn receive_loop(self: Arc<Self>, shutdown: CancellationToken) {
        let mut buf = vec![0u8; self.config.max_message_size.max(COAP_MTU)];
        loop {
            let received = tokio::select! {
                _ = shutdown.cancelled() => break,
                received = self.transport.recv_from(&mut buf) => received,
            };
            match received {
                Ok((n, source)) => self.deliver(&buf[..n], source).await,
                Err(e) => match e.kind() {
                    ErrorKind::ConnectionReset | ErrorKind::ConnectionRefused => {
                        debug!("peer unreachable: {}", e)
                    }
                    ErrorKind::BrokenPipe | ErrorKind::NotConnected => {
                        error!("transport closed: {}", e);
                        break;
                    }
                    _ => warn!("receive failed: {}", e),
                },
            }
        }
        debug!("receive loop stopped");
    }

    async fn sweep_loop(self: Arc<Self>, shutdown: CancellationToken) {
        let period = self
            .dedup
            .sweep_interval()
            .unwrap_or(self.config.mark_and_sweep_interval)
            .max(Duration::from_millis(1));
        let mut ticks = IntervalStream::new(interval_at(Instant::now() + period, period));
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                tick = ticks.next() => if tick.is_none() { break },
            }
            if self.dedup.sweep_interval().is_some() {
                self.dedup.sweep();
            }
            self.blocks.sweep(self.config.exchange_lifetime);
        }
    }

    async fn change_loop(
        self: Arc<Self>,
        mut changes: broadcast::Receiver<String>,
        shutdown: CancellationToken,
    ) {
        loop {
            let path = tokio::select! {
                _ = shutdown.cancelled() => break,
                changed = changes.recv() => match changed {
                    Ok(path) => path,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("missed {} resource changes", missed);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            };
            self.notify_observers(&path).await;
        }
    }

    async fn send_datagram(
        &self,
        bytes: Vec<u8>,
        peer: SocketAddr,
        on_failure: Option<Arc<Notify>>,
    ) {
        let mut datagram = Datagram::new(bytes, peer);
        datagram.on_failure = on_failure;
        self.queue(datagram).await;
    }

    async fn queue(&self, datagram: Datagram) {
        let peer = datagram.peer;
        if let Err(e) = self.outbox.push(datagram).await {
            debug!("cannot queue datagram to {}: {}", peer, e);
        }
    }

    async fn send_empty(&self, message_type: MessageType, mid: u16, peer: SocketAddr) {
        match encode(&Packet::empty(message_type, mid)) {
            Ok(bytes) => self.send_datagram(bytes, peer, None).await,
            Err(e) => error!("cannot encode empty message: {}", e),
        }
    }

    async fn reject(&self, packet: &Packet, peer: SocketAddr) {
        self.send_empty(MessageType::Reset, packet.header.get_message_id(), peer)
            .await
    }

    pub(crate) async fn deliver(self: &Arc<Self>, bytes: &[u8], source: SocketAddr) {
        let packet = match Packet::from_bytes(bytes) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("dropping malformed datagram from {}: {}", source, e);
                return;
            }
        };
        trace!("received {:?} from {}", packet, source);

        match packet.header.code {
            MessageClass::Empty => self.receive_empty(packet, source).await,
            MessageClass::Request(_) => self.receive_request(packet, source).await,
            MessageClass::Response(_) => self.receive_response(packet, source).await,
            MessageClass::Reserved(code) => {
                debug!("message with reserved code {:#04x} from {}", code, source);
                if matches!(
                    packet.header.get_type(),
                    MessageType::Confirmable | MessageType::NonConfirmable
                ) {
                    self.reject(&packet, source).await;
                }
            }
        }
    }

    async fn receive_empty(self: &Arc<Self>, packet: Packet, source: SocketAddr) {
        let key = KeyMid::new(source, packet.header.get_message_id());
        match packet.header.get_type() {
            MessageType::Confirmable => {
                debug!("ping {} answered with RST", key);
                self.reject(&packet, source).await;
            }
            MessageType::NonConfirmable => debug!("ignoring empty NON {}", key),
            MessageType::Acknowledgement => match self.exchanges.remove_by_mid(&key) {
                Some(exchange) => self.acknowledged(&exchange, key),
                None => debug!("unmatched ACK {}", key),
            },
            MessageType::Reset => match self.exchanges.remove_by_mid(&key) {
                Some(exchange) => self.reset(&exchange, key),
                None => debug!("unmatched RST {}", key),
            },
        }
    }

    fn acknowledged(&self, exchange: &Arc<Exchange>, key: KeyMid) {
        trace!("ACK {} for {:?}", key, exchange);
        let mut inner = exchange.lock();
        inner.cancel_retransmission();
        match exchange.origin() {
            Origin::Local => {
                if !inner.state.is_final() {
                    inner.state = ExchangeState::AwaitingResponse;
                }
            }
            Origin::Remote => {
                inner.state = ExchangeState::Responded;
                let token = inner.request.get_token().to_vec();
                drop(inner);
                if let Some(relation) = self.observe.find(key.peer, &token) {
                    if relation.pending_mid() == Some(key.mid) {
                        relation.record_success();
                    }
                }
            }
        }
    }

    fn reset(&self, exchange: &Arc<Exchange>, key: KeyMid) {
        match exchange.origin() {
            Origin::Local => {
                debug!("request {} rejected", key);
                self.exchanges.remove(exchange);
                exchange.lock().observe = false;
                exchange.complete(ExchangeState::Rejected, Some(ExchangeEvent::Rejected));
            }
            Origin::Remote => {
                exchange.cancel_retransmission();
                exchange.set_state(ExchangeState::Responded);
                let token = exchange.request().get_token().to_vec();
                if self.observe.remove_relation(key.peer, &token).is_some() {
                    debug!("notification {} rejected, relation removed", key);
                } else {
                    debug!("separate response {} rejected", key);
                }
            }
        }
    }

    async fn receive_request(self: &Arc<Self>, packet: Packet, source: SocketAddr) {
        let key = KeyMid::new(source, packet.header.get_message_id());
        let exchange = Arc::new(Exchange::new(Origin::Remote, source, packet.clone()));

        if let Some(previous) = self.dedup.find_previous(key, &exchange) {
            let reply = previous.lock().reply.clone();
            match reply {
                Some(reply) if packet.header.get_type() == MessageType::Confirmable => {
                    debug!("duplicate request {}, replaying answer", key);
                    self.send_datagram(reply, source, None).await;
                }
                _ => debug!("duplicate request {} dropped", key),
            }
            return;
        }

        if let Some(option) = packet.unknown_critical_option() {
            debug!("request {} carries unknown critical option {:?}", key, option);
            self.respond(&exchange, bare_response(&packet, Status::BadOption))
                .await;
            return;
        }

        let mut request = CoapRequest::from_packet(packet, &source);
        if request.get_observe_flag() == Some(ObserveOption::Deregister) {
            self.observe
                .remove_relation(source, request.message.get_token());
        }

        if let BlockOutcome::Respond(response) = self.blocks.intercept(&mut request) {
            self.respond(&exchange, response).await;
            return;
        }

        exchange.set_state(ExchangeState::Processing);
        let endpoint = self.clone();
        tokio::spawn(async move { endpoint.process(exchange, request).await });
    }

    /// Runs the handler, turning a panic into 5.00.
    async fn invoke(
        self: &Arc<Self>,
        handler: &Arc<dyn RequestHandler>,
        exchange: &Arc<Exchange>,
        request: CoapRequest,
    ) -> CoapRequest {
        let wrapped = Box::new(Request::new(request.clone(), exchange.clone(), self.clone()));
        match AssertUnwindSafe(handler.handle(wrapped)).catch_unwind().await {
            Ok(handled) => handled.into_inner(),
            Err(_) => {
                error!("handler for /{} panicked", request.get_path());
                let mut request = request;
                if let Some(response) = request.response.as_mut() {
                    response.set_status(Status::InternalServerError);
                }
                request
            }
        }
    }

    async fn process(self: Arc<Self>, exchange: Arc<Exchange>, request: CoapRequest) {
        let path = request.get_path();
        let registering = request.get_method() == Some(Method::Get)
            && request.get_observe_flag() == Some(ObserveOption::Register);

        let (mut handled, observable) = match self.handler() {
            Some(handler) => {
                let observable = registering && handler.is_observable(&path);
                (self.invoke(&handler, &exchange, request).await, observable)
            }
            None => {
                let mut request = request;
                if let Some(response) = request.response.as_mut() {
                    response.set_status(Status::NotFound);
                }
                (request, false)
            }
        };

        let mut response = match handled.response.take() {
            Some(response) => response.message,
            None => {
                // accept() only acts on a CON still in Processing
                self.accept(&exchange).await;
                exchange.set_state(ExchangeState::Responded);
                return;
            }
        };

        let mut relation = None;
        if registering {
            let success = status_of(&response).map_or(false, |s| s.is_success());
            if success && observable {
                response.set_observe_value(self.observe.next_sequence(&path));
                let observed = Arc::new(ObserveRelation::new(exchange.clone(), &path));
                exchange.lock().observe = true;
                self.observe.add_relation(observed.clone());
                relation = Some(observed);
            } else {
                response.clear_option(CoapOption::Observe);
                self.observe
                    .remove_relation(exchange.peer(), handled.message.get_token());
            }
        }

        self.blocks.prepare_response(&handled, &mut response);
        self.respond(&exchange, response).await;

        if let Some(relation) = relation {
            relation.set_established();
        }
    }

    /// Sends the empty ACK of a separate response. Later responses on the
    /// exchange go out as confirmable messages of their own.
    pub(crate) async fn accept(&self, exchange: &Arc<Exchange>) {
        let ack = {
            let mut inner = exchange.lock();
            if inner.state != ExchangeState::Processing
                || inner.request.header.get_type() != MessageType::Confirmable
            {
                return;
            }
            let ack = match encode(&Packet::empty(
                MessageType::Acknowledgement,
                inner.request.header.get_message_id(),
            )) {
                Ok(ack) => ack,
                Err(_) => return,
            };
            inner.state = ExchangeState::Accepted;
            inner.reply = Some(ack.clone());
            ack
        };
        debug!("accepted {}", exchange.key_mid());
        self.send_datagram(ack, exchange.peer(), None).await;
    }

    /// Sends the response of a remote exchange: piggybacked on the ACK of a
    /// CON request, as a separate CON after `accept`, NON for NON requests.
    async fn respond(self: &Arc<Self>, exchange: &Arc<Exchange>, mut response: Packet) {
        let peer = exchange.peer();
        let separate = {
            let mut inner = exchange.lock();
            response.set_token(inner.request.get_token().to_vec());
            let separate = match (inner.request.header.get_type(), inner.state) {
                (MessageType::Confirmable, ExchangeState::Accepted) => {
                    response.header.set_type(MessageType::Confirmable);
                    response.header.set_message_id(self.ids.next_id());
                    inner.state = ExchangeState::Separate;
                    true
                }
                (MessageType::Confirmable, _) => {
                    response.header.set_type(MessageType::Acknowledgement);
                    response
                        .header
                        .set_message_id(inner.request.header.get_message_id());
                    inner.state = ExchangeState::Responded;
                    false
                }
                _ => {
                    response.header.set_type(MessageType::NonConfirmable);
                    response.header.set_message_id(self.ids.next_id());
                    inner.state = ExchangeState::Responded;
                    false
                }
            };
            inner.response = Some(response.clone());
            separate
        };

        let bytes = match encode(&response) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("cannot encode response to {}: {}", peer, e);
                return;
            }
        };

        if separate {
            let mid = response.header.get_message_id();
            if let Err(e) = self.exchanges.register_mid(KeyMid::new(peer, mid), exchange) {
                warn!("{}", e);
            }
            if !self.stopped() {
                self.reliability
                    .start(exchange, mid, bytes.clone(), self.clone());
            }
        } else {
            exchange.lock().reply = Some(bytes.clone());
        }
        self.send_datagram(bytes, peer, Some(exchange.send_failed()))
            .await;
    }

    async fn receive_response(self: &Arc<Self>, packet: Packet, source: SocketAddr) {
        let message_type = packet.header.get_type();
        let key_mid = KeyMid::new(source, packet.header.get_message_id());
        let key_token = KeyToken::new(source, packet.get_token());

        if message_type != MessageType::Acknowledgement && self.dedup.find(&key_mid).is_some() {
            if message_type == MessageType::Confirmable {
                debug!("duplicate response {}, acknowledging again", key_mid);
                self.send_empty(MessageType::Acknowledgement, key_mid.mid, source)
                    .await;
            } else {
                debug!("duplicate response {} dropped", key_mid);
            }
            return;
        }

        let by_token = self.exchanges.get_by_token(&key_token);
        let exchange = if message_type == MessageType::Acknowledgement {
            match (self.exchanges.remove_by_mid(&key_mid), by_token) {
                (Some(m), Some(t)) if Arc::ptr_eq(&m, &t) => Some(t),
                (Some(m), Some(t)) => {
                    warn!("ACK {} and token {} match different exchanges", key_mid, key_token);
                    let _ = self.exchanges.register_mid(key_mid, &m);
                    Some(t)
                }
                (Some(m), None) => {
                    warn!("irregular response {}: token {} unknown", key_mid, key_token);
                    Some(m)
                }
                (None, Some(t)) => {
                    warn!("irregular response {}: message id unknown", key_token);
                    Some(t)
                }
                (None, None) => None,
            }
        } else {
            by_token
        };

        let exchange = match exchange {
            Some(exchange) if exchange.origin() == Origin::Local => exchange,
            _ => {
                if message_type == MessageType::Acknowledgement {
                    debug!("ignoring unmatched response {}", key_mid);
                } else {
                    debug!("unexpected response {} {}, rejecting", key_mid, key_token);
                    self.reject(&packet, source).await;
                }
                return;
            }
        };

        if message_type != MessageType::Acknowledgement {
            self.dedup.find_previous(key_mid, &exchange);
        }
        if message_type == MessageType::Confirmable {
            self.send_empty(MessageType::Acknowledgement, key_mid.mid, source)
                .await;
        }

        self.complete_local(&exchange, packet);
    }

    fn complete_local(&self, exchange: &Arc<Exchange>, packet: Packet) {
        let request_key = exchange.key_mid();
        if let Some(pending) = self.exchanges.get_by_mid(&request_key) {
            if Arc::ptr_eq(&pending, exchange) {
                self.exchanges.remove_by_mid(&request_key);
            }
        }

        let success = status_of(&packet).map_or(false, |s| s.is_success());
        let notification = exchange.is_observe() && success && packet.get_observe_value().is_some();

        let mut inner = exchange.lock();
        inner.cancel_retransmission();
        inner.response = Some(packet.clone());
        let response = CoapResponse::from_packet(packet);
        if notification {
            inner.state = ExchangeState::Completed;
            inner.emit(ExchangeEvent::Response(response));
        } else {
            inner.observe = false;
            drop(inner);
            self.exchanges.remove(exchange);
            exchange.complete(ExchangeState::Completed, Some(ExchangeEvent::Response(response)));
        }
    }

    async fn send_request(
        self: &Arc<Self>,
        mut request: Packet,
        peer: SocketAddr,
    ) -> io::Result<ResponseReceiver> {
        if !request.header.is_request() {
            return Err(Error::new(ErrorKind::InvalidInput, "not a request"));
        }
        let mid = self.ids.next_id();
        request.header.set_message_id(mid);
        if request.get_token().is_empty() {
            request.set_token(self.tokens.next_token());
        }
        let confirmable = request.header.get_type() == MessageType::Confirmable;
        if !confirmable {
            request.header.set_type(MessageType::NonConfirmable);
        }
        let observe = request.header.code == MessageClass::Request(Method::Get)
            && request.get_observe_value() == Some(ObserveOption::Register as u32);
        let bytes = encode(&request)?;

        let exchange = Arc::new(Exchange::new(Origin::Local, peer, request));
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut inner = exchange.lock();
            inner.events = Some(tx);
            inner.observe = observe;
        }
        self.exchanges.register_token(exchange.key_token(), &exchange)?;
        if let Err(e) = self.exchanges.register_mid(exchange.key_mid(), &exchange) {
            self.exchanges.remove(&exchange);
            return Err(e);
        }

        let receiver = ResponseReceiver {
            events: rx,
            exchange: exchange.clone(),
            endpoint: Arc::downgrade(self),
        };

        if confirmable && !self.stopped() {
            self.reliability
                .start(&exchange, mid, bytes.clone(), self.clone());
        }
        trace!("sending request {:?}", exchange);
        self.outbox
            .push(Datagram::new(bytes, peer).on_failure(exchange.send_failed()))
            .await?;

        let mut inner = exchange.lock();
        if inner.state == ExchangeState::Sending {
            inner.state = ExchangeState::AwaitingResponse;
        }
        drop(inner);
        Ok(receiver)
    }

    /// Abandons a local exchange whose receiver went away. Later responses
    /// for its token are answered with RST.
    fn forget(&self, exchange: &Arc<Exchange>) {
        self.exchanges.remove(exchange);
        let mut inner = exchange.lock();
        inner.cancel_retransmission();
        inner.events = None;
        inner.observe = false;
    }

    pub(crate) async fn notify_observers(self: &Arc<Self>, path: &str) {
        let path = path.trim_matches('/');
        let relations = self.observe.relations_for(path);
        if relations.is_empty() {
            return;
        }
        let handler = match self.handler() {
            Some(handler) => handler,
            None => return,
        };
        let sequence = self.observe.next_sequence(path);
        debug!("notifying {} observers of /{}", relations.len(), path);
        for relation in relations {
            self.notify(&handler, &relation, sequence).await;
        }
    }

    async fn notify(
        self: &Arc<Self>,
        handler: &Arc<dyn RequestHandler>,
        relation: &Arc<ObserveRelation>,
        sequence: u32,
    ) {
        let exchange = relation.exchange();
        let peer = relation.peer();
        let registration = exchange.request();
        let request = CoapRequest::from_packet(registration.clone(), &peer);
        let handled = self.invoke(handler, exchange, request).await;

        let mut response = match handled.response.clone() {
            Some(response) => response.message,
            None => return,
        };
        response.set_token(relation.token().to_vec());
        if status_of(&response).map_or(false, |s| s.is_success()) {
            response.set_observe_value(sequence);
        } else {
            response.clear_option(CoapOption::Observe);
            self.observe.remove_relation(peer, relation.token());
        }
        self.blocks.prepare_response(&handled, &mut response);

        let check = relation.count_notification(self.config.notification_check_interval_count);
        let confirmable = check || registration.header.get_type() == MessageType::Confirmable;
        let mid = self.ids.next_id();
        response.header.set_type(if confirmable {
            MessageType::Confirmable
        } else {
            MessageType::NonConfirmable
        });
        response.header.set_message_id(mid);

        let bytes = match encode(&response) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("cannot encode notification to {}: {}", peer, e);
                return;
            }
        };

        if let Some(previous) = relation.replace_pending(confirmable.then_some(mid)) {
            self.exchanges.remove_by_mid(&KeyMid::new(peer, previous));
            debug!("notification {} to {} superseded", previous, peer);
        }
        exchange.lock().response = Some(response);
        if confirmable {
            if let Err(e) = self.exchanges.register_mid(KeyMid::new(peer, mid), exchange) {
                warn!("{}", e);
            }
            if !self.stopped() {
                self.reliability
                    .start(exchange, mid, bytes.clone(), self.clone());
            }
        } else {
            exchange.cancel_retransmission();
        }
        self.send_datagram(bytes, peer, Some(exchange.send_failed()))
            .await;
    }
}

#[async_trait]
impl Retransmitter for EndpointInner {
    async fn retransmit(
        &self,
        exchange: &Arc<Exchange>,
        message: &[u8],
        cancelled: CancellationToken,
    ) {
        let datagram = Datagram::new(message.to_vec(), exchange.peer())
            .on_failure(exchange.send_failed())
            .cancelled_by(cancelled);
        self.queue(datagram).await;
    }

    async fn give_up(&self, exchange: &Arc<Exchange>, mid: u16) {
        let peer = exchange.peer();
        self.exchanges.remove_by_mid(&KeyMid::new(peer, mid));
        match exchange.origin() {
            Origin::Local => {
                self.exchanges.remove(exchange);
                exchange.lock().observe = false;
                exchange.complete(ExchangeState::Failed, Some(ExchangeEvent::TimedOut));
            }
            Origin::Remote => {
                let token = exchange.request().get_token().to_vec();
                match self.observe.find(peer, &token) {
                    Some(relation) if relation.pending_mid() == Some(mid) => {
                        if relation.record_failure() >= self.config.max_observe_failures {
                            warn!("observer {} of /{} unreachable", peer, relation.path());
                            self.observe.remove_relation(peer, &token);
                        }
                    }
                    _ => {
                        warn!("separate response to {} abandoned", peer);
                        exchange.set_state(ExchangeState::Failed);
                    }
                }
            }
        }
    }
}

/// Receives the response to a request sent through an endpoint, or every
/// notification of an observation. Dropping it abandons the exchange.
pub struct ResponseReceiver {
    events: mpsc::UnboundedReceiver<ExchangeEvent>,
    exchange: Arc<Exchange>,
    endpoint: Weak<EndpointInner>,
}

impl ResponseReceiver {
    pub fn exchange(&self) -> &Arc<Exchange> {
        &self.exchange
    }

    pub fn token(&self) -> Vec<u8> {
        self.exchange.request().get_token().to_vec()
    }

    pub fn message_id(&self) -> u16 {
        self.exchange.key_mid().mid
    }

    /// The next response. Fails with `TimedOut` when retransmissions ran
    /// out, `ConnectionReset` when the peer answered with RST and
    /// `ConnectionAborted` once the exchange is gone.
    pub async fn recv(&mut self) -> io::Result<CoapResponse> {
        into_result(self.events.recv().await)
    }
}

fn into_result(event: Option<ExchangeEvent>) -> io::Result<CoapResponse> {
    match event {
        Some(ExchangeEvent::Response(response)) => Ok(response),
        Some(ExchangeEvent::Rejected) => Err(Error::new(
            ErrorKind::ConnectionReset,
            "request rejected by peer",
        )),
        Some(ExchangeEvent::TimedOut) => Err(Error::new(ErrorKind::TimedOut, "no response")),
        None => Err(Error::new(ErrorKind::ConnectionAborted, "exchange closed")),
    }
}

impl Stream for ResponseReceiver {
    type Item = io::Result<CoapResponse>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.events
            .poll_recv(cx)
            .map(|event| event.map(|e| into_result(Some(e))))
    }
}

impl Drop for ResponseReceiver {
    fn drop(&mut self) {
        if let Some(endpoint) = self.endpoint.upgrade() {
            endpoint.forget(&self.exchange);
        }
    }
}
