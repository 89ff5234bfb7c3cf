//! Request/response correlation.
//!
//! An [`Exchange`] tracks one request and its eventual response. Local
//! exchanges are created when this endpoint sends a request, remote ones when
//! a fresh request arrives. The [`ExchangeStore`] indexes exchanges by the
//! message ID of our outgoing confirmable messages (for ACK/RST matching) and
//! by token (for routing responses to local requests).

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::io::{Error, ErrorKind, Result};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::message::{CoapResponse, MessageType, Packet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeyMid {
    pub peer: SocketAddr,
    pub mid: u16,
}

impl KeyMid {
    pub fn new(peer: SocketAddr, mid: u16) -> KeyMid {
        KeyMid { peer, mid }
    }
}

impl fmt::Display for KeyMid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.peer, self.mid)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyToken {
    pub peer: SocketAddr,
    pub token: Vec<u8>,
}

impl KeyToken {
    pub fn new(peer: SocketAddr, token: &[u8]) -> KeyToken {
        KeyToken {
            peer,
            token: token.to_vec(),
        }
    }
}

impl fmt::Display for KeyToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[", self.peer)?;
        for byte in &self.token {
            write!(f, "{:02x}", byte)?;
        }
        write!(f, "]")
    }
}

/// Which side started the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// We sent the request.
    Local,
    /// The peer sent the request.
    Remote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    // client side
    Sending,
    AwaitingResponse,
    Retransmitting,
    Completed,
    Rejected,
    Failed,
    // server side
    Received,
    Processing,
    Accepted,
    Separate,
    Responded,
}

impl ExchangeState {
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            ExchangeState::Completed
                | ExchangeState::Rejected
                | ExchangeState::Failed
                | ExchangeState::Responded
        )
    }
}

/// Outcome of a local exchange as seen by whoever sent the request.
#[derive(Debug, Clone)]
pub enum ExchangeEvent {
    Response(CoapResponse),
    /// The peer answered with RST.
    Rejected,
    /// Retransmissions were exhausted.
    TimedOut,
}

#[derive(Debug, Default)]
pub(crate) struct Retransmission {
    pub(crate) timeout: Duration,
    pub(crate) count: u32,
    /// Bumped on every start and cancel. A timer only acts while the epoch it
    /// was started with is still current.
    pub(crate) epoch: u64,
    pub(crate) mid: Option<u16>,
    pub(crate) timer: Option<JoinHandle<()>>,
    /// Handed to queued retransmissions; cancelled together with the timer.
    pub(crate) queued: CancellationToken,
}

#[derive(Debug)]
pub(crate) struct ExchangeInner {
    pub(crate) state: ExchangeState,
    pub(crate) request: Packet,
    pub(crate) response: Option<Packet>,
    /// Encoded message that answered the request's MID, replayed to duplicates.
    pub(crate) reply: Option<Vec<u8>>,
    pub(crate) retransmission: Retransmission,
    pub(crate) events: Option<mpsc::UnboundedSender<ExchangeEvent>>,
    pub(crate) observe: bool,
}

impl ExchangeInner {
    /// Invalidates the running timer, if any. Returns whether one was pending.
    pub(crate) fn cancel_retransmission(&mut self) -> bool {
        self.retransmission.epoch = self.retransmission.epoch.wrapping_add(1);
        self.retransmission.mid = None;
        self.retransmission.queued.cancel();
        self.retransmission.queued = CancellationToken::new();
        match self.retransmission.timer.take() {
            Some(timer) => {
                timer.abort();
                true
            }
            None => false,
        }
    }

    pub(crate) fn emit(&mut self, event: ExchangeEvent) {
        if let Some(events) = &self.events {
            if events.send(event).is_err() {
                self.events = None;
            }
        }
    }
}

pub struct Exchange {
    origin: Origin,
    peer: SocketAddr,
    inner: Mutex<ExchangeInner>,
    send_failed: Arc<Notify>,
}

impl Exchange {
    pub fn new(origin: Origin, peer: SocketAddr, request: Packet) -> Exchange {
        let state = match origin {
            Origin::Local => ExchangeState::Sending,
            Origin::Remote => ExchangeState::Received,
        };
        Exchange {
            origin,
            peer,
            inner: Mutex::new(ExchangeInner {
                state,
                request,
                response: None,
                reply: None,
                retransmission: Retransmission::default(),
                events: None,
                observe: false,
            }),
            send_failed: Arc::new(Notify::new()),
        }
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> ExchangeState {
        self.lock().state
    }

    pub fn request(&self) -> Packet {
        self.lock().request.clone()
    }

    pub fn response(&self) -> Option<Packet> {
        self.lock().response.clone()
    }

    pub fn is_confirmable(&self) -> bool {
        self.lock().request.header.get_type() == MessageType::Confirmable
    }

    pub fn is_observe(&self) -> bool {
        self.lock().observe
    }

    /// Number of retransmissions of the message currently in flight.
    pub fn retransmissions(&self) -> u32 {
        self.lock().retransmission.count
    }

    pub fn key_mid(&self) -> KeyMid {
        KeyMid::new(self.peer, self.lock().request.header.get_message_id())
    }

    pub fn key_token(&self) -> KeyToken {
        KeyToken::new(self.peer, self.lock().request.get_token())
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, ExchangeInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn send_failed(&self) -> Arc<Notify> {
        self.send_failed.clone()
    }

    pub(crate) fn set_state(&self, state: ExchangeState) {
        self.lock().state = state;
    }

    /// Stops retransmission and moves to `state` in one step. The event, if
    /// any, goes to the request originator. Final states close the event
    /// channel unless the exchange is an observation.
    pub(crate) fn complete(&self, state: ExchangeState, event: Option<ExchangeEvent>) {
        let mut inner = self.lock();
        inner.cancel_retransmission();
        inner.state = state;
        if let Some(event) = event {
            inner.emit(event);
        }
        if state.is_final() && !(inner.observe && state == ExchangeState::Completed) {
            inner.events = None;
        }
    }

    pub(crate) fn cancel_retransmission(&self) -> bool {
        self.lock().cancel_retransmission()
    }
}

impl fmt::Debug for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("Exchange")
            .field("origin", &self.origin)
            .field("peer", &self.peer)
            .field("state", &inner.state)
            .field("mid", &inner.request.header.get_message_id())
            .field("token", &inner.request.get_token())
            .finish()
    }
}

#[derive(Debug, Default)]
pub struct ExchangeStore {
    by_mid: Mutex<HashMap<KeyMid, Arc<Exchange>>>,
    by_token: Mutex<HashMap<KeyToken, Arc<Exchange>>>,
}

impl ExchangeStore {
    pub fn new() -> ExchangeStore {
        ExchangeStore::default()
    }

    /// Indexes an outgoing confirmable message. At most one exchange may own
    /// a given MID per peer.
    pub fn register_mid(&self, key: KeyMid, exchange: &Arc<Exchange>) -> Result<()> {
        match lock(&self.by_mid).entry(key) {
            Entry::Occupied(_) => Err(Error::new(
                ErrorKind::AlreadyExists,
                format!("message id {} already in flight", key),
            )),
            Entry::Vacant(v) => {
                v.insert(exchange.clone());
                Ok(())
            }
        }
    }

    pub fn register_token(&self, key: KeyToken, exchange: &Arc<Exchange>) -> Result<()> {
        match lock(&self.by_token).entry(key) {
            Entry::Occupied(o) => Err(Error::new(
                ErrorKind::AlreadyExists,
                format!("token {} already in use", o.key()),
            )),
            Entry::Vacant(v) => {
                v.insert(exchange.clone());
                Ok(())
            }
        }
    }

    pub fn get_by_mid(&self, key: &KeyMid) -> Option<Arc<Exchange>> {
        lock(&self.by_mid).get(key).cloned()
    }

    pub fn remove_by_mid(&self, key: &KeyMid) -> Option<Arc<Exchange>> {
        lock(&self.by_mid).remove(key)
    }

    pub fn get_by_token(&self, key: &KeyToken) -> Option<Arc<Exchange>> {
        lock(&self.by_token).get(key).cloned()
    }

    pub fn remove_by_token(&self, key: &KeyToken) -> Option<Arc<Exchange>> {
        lock(&self.by_token).remove(key)
    }

    /// Drops every index entry that points at `exchange`.
    pub fn remove(&self, exchange: &Arc<Exchange>) {
        lock(&self.by_mid).retain(|_, e| !Arc::ptr_eq(e, exchange));
        lock(&self.by_token).retain(|_, e| !Arc::ptr_eq(e, exchange));
    }

    /// Empties the store and returns the exchanges it held.
    pub fn drain(&self) -> Vec<Arc<Exchange>> {
        let mut exchanges: Vec<Arc<Exchange>> =
            lock(&self.by_mid).drain().map(|(_, e)| e).collect();
        for (_, exchange) in lock(&self.by_token).drain() {
            if !exchanges.iter().any(|e| Arc::ptr_eq(e, &exchange)) {
                exchanges.push(exchange);
            }
        }
        exchanges
    }

    pub fn pending_mids(&self) -> usize {
        lock(&self.by_mid).len()
    }

    pub fn pending_tokens(&self) -> usize {
        lock(&self.by_token).len()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
