//! Observe relations (RFC 7641) and notification ordering.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::debug;
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::exchange::Exchange;

const SEQUENCE_MASK: u32 = 0x00FF_FFFF;
const SEQUENCE_HALF: u32 = 1 << 23;
/// After this long without a notification any sequence number is fresh again.
const FRESHNESS_WINDOW: Duration = Duration::from_secs(128);

/// Whether `new` is newer than `old` in 24-bit serial number arithmetic.
pub fn is_newer(old: u32, new: u32) -> bool {
    new.wrapping_sub(old) & SEQUENCE_MASK < SEQUENCE_HALF
}

/// Hands out the sequence numbers of one resource's notifications.
#[derive(Debug, Default, Clone)]
pub struct ObserveOrderer {
    sequence: u32,
}

impl ObserveOrderer {
    pub fn new() -> ObserveOrderer {
        ObserveOrderer::default()
    }

    pub fn next(&mut self) -> u32 {
        self.sequence = (self.sequence + 1) & SEQUENCE_MASK;
        self.sequence
    }
}

/// Client-side filter that lets only fresh notifications through.
#[derive(Debug, Default, Clone)]
pub struct NotificationOrderer {
    last: Option<(u32, Instant)>,
}

impl NotificationOrderer {
    pub fn new() -> NotificationOrderer {
        NotificationOrderer::default()
    }

    /// Records `sequence` and returns true if it is newer than the last one
    /// accepted; stale arrivals are rejected and leave the state alone.
    pub fn accept(&mut self, sequence: u32) -> bool {
        let now = Instant::now();
        let fresh = match self.last {
            None => true,
            Some((last, at)) => {
                is_newer(last, sequence) || now.duration_since(at) > FRESHNESS_WINDOW
            }
        };
        if fresh {
            self.last = Some((sequence & SEQUENCE_MASK, now));
        }
        fresh
    }
}

#[derive(Debug, Default)]
struct RelationState {
    established: bool,
    notifications: u32,
    failures: u32,
    pending_mid: Option<u16>,
}

/// One client observing one resource through one token.
#[derive(Debug)]
pub struct ObserveRelation {
    peer: SocketAddr,
    path: String,
    token: Vec<u8>,
    exchange: Arc<Exchange>,
    state: Mutex<RelationState>,
}

impl ObserveRelation {
    pub fn new(exchange: Arc<Exchange>, path: &str) -> ObserveRelation {
        let token = exchange.request().get_token().to_vec();
        ObserveRelation {
            peer: exchange.peer(),
            path: path.to_string(),
            token,
            exchange,
            state: Mutex::new(RelationState::default()),
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn token(&self) -> &[u8] {
        &self.token
    }

    /// The exchange of the registering request; notifications reuse it.
    pub fn exchange(&self) -> &Arc<Exchange> {
        &self.exchange
    }

    pub fn is_established(&self) -> bool {
        self.lock().established
    }

    pub fn set_established(&self) {
        self.lock().established = true;
    }

    /// Counts a notification and tells whether it must be confirmable: every
    /// `check_interval`-th one is, so vanished clients get noticed.
    pub fn count_notification(&self, check_interval: u32) -> bool {
        let mut state = self.lock();
        state.notifications = state.notifications.wrapping_add(1);
        check_interval > 0 && state.notifications % check_interval == 0
    }

    /// Records the MID of a confirmable notification in flight and returns the
    /// one it replaces.
    pub fn replace_pending(&self, mid: Option<u16>) -> Option<u16> {
        std::mem::replace(&mut self.lock().pending_mid, mid)
    }

    pub fn pending_mid(&self) -> Option<u16> {
        self.lock().pending_mid
    }

    /// Counts a failed notification and returns the total so far.
    pub fn record_failure(&self) -> u32 {
        let mut state = self.lock();
        state.failures += 1;
        state.pending_mid = None;
        state.failures
    }

    pub fn record_success(&self) {
        let mut state = self.lock();
        state.failures = 0;
        state.pending_mid = None;
        state.established = true;
    }

    fn lock(&self) -> MutexGuard<'_, RelationState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// All relations of a single remote endpoint, keyed by (resource, token).
#[derive(Debug)]
pub struct ObservingEndpoint {
    peer: SocketAddr,
    relations: Mutex<HashMap<(String, Vec<u8>), Arc<ObserveRelation>>>,
}

impl ObservingEndpoint {
    pub fn new(peer: SocketAddr) -> ObservingEndpoint {
        ObservingEndpoint {
            peer,
            relations: Mutex::new(HashMap::new()),
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn relations(&self) -> Vec<Arc<ObserveRelation>> {
        lock(&self.relations).values().cloned().collect()
    }

    fn insert(&self, relation: Arc<ObserveRelation>) -> Option<Arc<ObserveRelation>> {
        let key = (relation.path.clone(), relation.token.clone());
        lock(&self.relations).insert(key, relation)
    }

    fn remove_token(&self, token: &[u8]) -> Option<Arc<ObserveRelation>> {
        let mut relations = lock(&self.relations);
        let key = relations.keys().find(|(_, t)| t == token).cloned()?;
        relations.remove(&key)
    }

    fn find_token(&self, token: &[u8]) -> Option<Arc<ObserveRelation>> {
        lock(&self.relations)
            .iter()
            .find(|((_, t), _)| t == token)
            .map(|(_, r)| r.clone())
    }

    fn is_empty(&self) -> bool {
        lock(&self.relations).is_empty()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Publishes the paths of changed resources to every endpoint subscribed
/// to it; each endpoint then notifies its own observers.
#[derive(Debug, Clone)]
pub struct ChangeNotifier {
    sender: broadcast::Sender<String>,
}

impl ChangeNotifier {
    pub fn new() -> ChangeNotifier {
        let (sender, _) = broadcast::channel(64);
        ChangeNotifier { sender }
    }

    pub fn notify(&self, path: &str) {
        // no subscribers means no endpoint is running
        let _ = self.sender.send(path.trim_matches('/').to_string());
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.sender.subscribe()
    }
}

impl Default for ChangeNotifier {
    fn default() -> Self {
        ChangeNotifier::new()
    }
}

/// Server-side bookkeeping of who observes what.
#[derive(Debug, Default)]
pub struct ObserveManager {
    endpoints: Mutex<HashMap<SocketAddr, Arc<ObservingEndpoint>>>,
    orderers: Mutex<HashMap<String, ObserveOrderer>>,
}

impl ObserveManager {
    pub fn new() -> ObserveManager {
        ObserveManager::default()
    }

    /// Adds a relation, replacing an earlier one for the same resource and
    /// token (a re-registration).
    pub fn add_relation(&self, relation: Arc<ObserveRelation>) {
        debug!(
            "{} observes /{} with token {:02x?}",
            relation.peer, relation.path, relation.token
        );
        let endpoint = lock(&self.endpoints)
            .entry(relation.peer)
            .or_insert_with(|| Arc::new(ObservingEndpoint::new(relation.peer)))
            .clone();
        if let Some(previous) = endpoint.insert(relation) {
            previous.exchange.cancel_retransmission();
        }
    }

    /// Removes the relation of `peer` using `token`, returning it.
    pub fn remove_relation(&self, peer: SocketAddr, token: &[u8]) -> Option<Arc<ObserveRelation>> {
        let mut endpoints = lock(&self.endpoints);
        let endpoint = endpoints.get(&peer)?.clone();
        let removed = endpoint.remove_token(token);
        if endpoint.is_empty() {
            endpoints.remove(&peer);
        }
        if let Some(relation) = &removed {
            relation.exchange.cancel_retransmission();
            debug!("{} stopped observing /{}", peer, relation.path);
        }
        removed
    }

    pub fn find(&self, peer: SocketAddr, token: &[u8]) -> Option<Arc<ObserveRelation>> {
        let endpoint = lock(&self.endpoints).get(&peer).cloned()?;
        endpoint.find_token(token)
    }

    /// Relations on `path` whose first response went out.
    pub fn relations_for(&self, path: &str) -> Vec<Arc<ObserveRelation>> {
        let endpoints: Vec<Arc<ObservingEndpoint>> =
            lock(&self.endpoints).values().cloned().collect();
        endpoints
            .iter()
            .flat_map(|endpoint| endpoint.relations())
            .filter(|relation| relation.path == path && relation.is_established())
            .collect()
    }

    pub fn next_sequence(&self, path: &str) -> u32 {
        lock(&self.orderers)
            .entry(path.to_string())
            .or_insert_with(ObserveOrderer::new)
            .next()
    }

    pub fn relation_count(&self) -> usize {
        lock(&self.endpoints)
            .values()
            .map(|endpoint| lock(&endpoint.relations).len())
            .sum()
    }

    /// Drops every relation, cancelling notifications in flight.
    pub fn clear(&self) {
        let endpoints: Vec<Arc<ObservingEndpoint>> =
            lock(&self.endpoints).drain().map(|(_, e)| e).collect();
        for relation in endpoints.iter().flat_map(|e| e.relations()) {
            relation.exchange.cancel_retransmission();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::exchange::Origin;
    use crate::message::Packet;

    fn relation(peer: &str, path: &str, token: &[u8]) -> Arc<ObserveRelation> {
        let mut request = Packet::new();
        request.set_token(token.to_vec());
        let exchange = Arc::new(Exchange::new(Origin::Remote, peer.parse().unwrap(), request));
        Arc::new(ObserveRelation::new(exchange, path))
    }

    #[test]
    fn test_is_newer_wraps() {
        assert!(is_newer(5, 7));
        assert!(!is_newer(7, 5));
        assert!(is_newer(0xFF_FFFF, 0));
        assert!(is_newer(0xFF_FFF0, 3));
        assert!(!is_newer(3, 0xFF_FFF0));
        assert!(!is_newer(0, SEQUENCE_HALF));
    }

    #[tokio::test(start_paused = true)]
    async fn test_notification_reordering() {
        let mut orderer = NotificationOrderer::new();
        let accepted: Vec<u32> = [5, 3, 7]
            .iter()
            .copied()
            .filter(|seq| orderer.accept(*seq))
            .collect();
        assert_eq!(accepted, vec![5, 7]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_notification_freshness_window() {
        let mut orderer = NotificationOrderer::new();
        assert!(orderer.accept(100));
        assert!(!orderer.accept(50));
        tokio::time::advance(Duration::from_secs(129)).await;
        assert!(orderer.accept(50));
    }

    #[test]
    fn test_orderer_wraps_at_24_bits() {
        let mut orderer = ObserveOrderer { sequence: 0xFF_FFFE };
        assert_eq!(orderer.next(), 0xFF_FFFF);
        assert_eq!(orderer.next(), 0);
        assert_eq!(orderer.next(), 1);
    }

    #[test]
    fn test_relations_by_path_and_token() {
        let manager = ObserveManager::new();
        let a = relation("10.0.0.1:5683", "temp", &[1]);
        let b = relation("10.0.0.1:5683", "light", &[2]);
        let c = relation("10.0.0.2:5683", "temp", &[1]);
        for r in [&a, &b, &c] {
            manager.add_relation(r.clone());
        }
        assert_eq!(manager.relation_count(), 3);
        assert!(manager.relations_for("temp").is_empty());

        a.set_established();
        c.set_established();
        assert_eq!(manager.relations_for("temp").len(), 2);

        let removed = manager.remove_relation(a.peer(), &[1]).unwrap();
        assert!(Arc::ptr_eq(&removed, &a));
        assert_eq!(manager.relations_for("temp").len(), 1);
        assert!(manager.find(b.peer(), &[2]).is_some());
        assert!(manager.remove_relation(a.peer(), &[1]).is_none());

        manager.clear();
        assert_eq!(manager.relation_count(), 0);
    }

    #[test]
    fn test_reregistration_replaces() {
        let manager = ObserveManager::new();
        manager.add_relation(relation("10.0.0.1:5683", "temp", &[1]));
        manager.add_relation(relation("10.0.0.1:5683", "temp", &[1]));
        assert_eq!(manager.relation_count(), 1);
    }

    #[test]
    fn test_confirmable_check_interval() {
        let r = relation("10.0.0.1:5683", "temp", &[1]);
        let confirmable: Vec<bool> = (0..6).map(|_| r.count_notification(3)).collect();
        assert_eq!(confirmable, vec![false, false, true, false, false, true]);
    }

    #[tokio::test]
    async fn test_change_notifier_fans_out() {
        let notifier = ChangeNotifier::new();
        notifier.notify("/nobody/listening/");
        let mut a = notifier.subscribe();
        let mut b = notifier.clone().subscribe();
        notifier.notify("/sensors/temp/");
        assert_eq!(a.recv().await.unwrap(), "sensors/temp");
        assert_eq!(b.recv().await.unwrap(), "sensors/temp");
    }
}
