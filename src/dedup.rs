//! Duplicate detection for incoming messages, keyed by (peer, message ID).

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::mem;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::trace;
use tokio::time::Instant;

use crate::config::{CoapConfig, DeduplicatorKind};
use crate::exchange::{Exchange, KeyMid};

pub trait Deduplicator: Send + Sync {
    /// Remembers `exchange` under `key` unless the key is already known, in
    /// which case the exchange stored first is returned and nothing changes.
    fn find_previous(&self, key: KeyMid, exchange: &Arc<Exchange>) -> Option<Arc<Exchange>>;

    fn find(&self, key: &KeyMid) -> Option<Arc<Exchange>>;

    /// Periodic maintenance; how often it runs is given by `sweep_interval`.
    fn sweep(&self);

    /// `None` when the strategy needs no periodic maintenance.
    fn sweep_interval(&self) -> Option<Duration>;

    fn clear(&self);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Builds the strategy named by the configuration.
pub fn from_config(config: &CoapConfig) -> Arc<dyn Deduplicator> {
    match config.deduplicator {
        DeduplicatorKind::MarkAndSweep => Arc::new(MarkAndSweep::new(
            config.exchange_lifetime,
            config.mark_and_sweep_interval,
        )),
        DeduplicatorKind::CropRotation => Arc::new(CropRotation::new(config.crop_rotation_period)),
        DeduplicatorKind::Noop => Arc::new(Noop),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Timestamps every entry and drops those older than the exchange lifetime
/// on each sweep.
#[derive(Debug)]
pub struct MarkAndSweep {
    entries: Mutex<HashMap<KeyMid, (Arc<Exchange>, Instant)>>,
    lifetime: Duration,
    interval: Duration,
}

impl MarkAndSweep {
    pub fn new(lifetime: Duration, interval: Duration) -> MarkAndSweep {
        MarkAndSweep {
            entries: Mutex::new(HashMap::new()),
            lifetime,
            interval,
        }
    }
}

impl Deduplicator for MarkAndSweep {
    fn find_previous(&self, key: KeyMid, exchange: &Arc<Exchange>) -> Option<Arc<Exchange>> {
        match lock(&self.entries).entry(key) {
            Entry::Occupied(o) => Some(o.get().0.clone()),
            Entry::Vacant(v) => {
                v.insert((exchange.clone(), Instant::now()));
                None
            }
        }
    }

    fn find(&self, key: &KeyMid) -> Option<Arc<Exchange>> {
        lock(&self.entries).get(key).map(|(e, _)| e.clone())
    }

    fn sweep(&self) {
        let now = Instant::now();
        let mut entries = lock(&self.entries);
        let before = entries.len();
        entries.retain(|_, (_, marked)| now.duration_since(*marked) < self.lifetime);
        trace!("mark and sweep removed {} entries", before - entries.len());
    }

    fn sweep_interval(&self) -> Option<Duration> {
        Some(self.interval)
    }

    fn clear(&self) {
        lock(&self.entries).clear();
    }

    fn len(&self) -> usize {
        lock(&self.entries).len()
    }
}

#[derive(Debug, Default)]
struct Generations {
    current: HashMap<KeyMid, Arc<Exchange>>,
    previous: HashMap<KeyMid, Arc<Exchange>>,
}

/// Two generations of entries; each rotation discards the older one. An
/// entry survives between one and two rotation periods.
#[derive(Debug)]
pub struct CropRotation {
    generations: Mutex<Generations>,
    period: Duration,
}

impl CropRotation {
    pub fn new(period: Duration) -> CropRotation {
        CropRotation {
            generations: Mutex::new(Generations::default()),
            period,
        }
    }
}

impl Deduplicator for CropRotation {
    fn find_previous(&self, key: KeyMid, exchange: &Arc<Exchange>) -> Option<Arc<Exchange>> {
        let mut generations = lock(&self.generations);
        if let Some(previous) = generations.previous.get(&key) {
            return Some(previous.clone());
        }
        match generations.current.entry(key) {
            Entry::Occupied(o) => Some(o.get().clone()),
            Entry::Vacant(v) => {
                v.insert(exchange.clone());
                None
            }
        }
    }

    fn find(&self, key: &KeyMid) -> Option<Arc<Exchange>> {
        let generations = lock(&self.generations);
        generations
            .current
            .get(key)
            .or_else(|| generations.previous.get(key))
            .cloned()
    }

    fn sweep(&self) {
        let mut generations = lock(&self.generations);
        let current = mem::take(&mut generations.current);
        let dropped = mem::replace(&mut generations.previous, current);
        trace!("crop rotation dropped {} entries", dropped.len());
    }

    fn sweep_interval(&self) -> Option<Duration> {
        Some(self.period)
    }

    fn clear(&self) {
        let mut generations = lock(&self.generations);
        generations.current.clear();
        generations.previous.clear();
    }

    fn len(&self) -> usize {
        let generations = lock(&self.generations);
        generations.current.len() + generations.previous.len()
    }
}

/// Never remembers anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct Noop;

impl Deduplicator for Noop {
    fn find_previous(&self, _key: KeyMid, _exchange: &Arc<Exchange>) -> Option<Arc<Exchange>> {
        None
    }

    fn find(&self, _key: &KeyMid) -> Option<Arc<Exchange>> {
        None
    }

    fn sweep(&self) {}

    fn sweep_interval(&self) -> Option<Duration> {
        None
    }

    fn clear(&self) {}

    fn len(&self) -> usize {
        0
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::exchange::Origin;
    use crate::message::Packet;
    use std::net::SocketAddr;

    fn key(mid: u16) -> KeyMid {
        KeyMid::new("10.0.0.1:5683".parse::<SocketAddr>().unwrap(), mid)
    }

    fn exchange() -> Arc<Exchange> {
        Arc::new(Exchange::new(
            Origin::Remote,
            "10.0.0.1:5683".parse().unwrap(),
            Packet::new(),
        ))
    }

    fn assert_remembers(dedup: &dyn Deduplicator) {
        let first = exchange();
        let second = exchange();
        assert!(dedup.find_previous(key(1), &first).is_none());
        let previous = dedup.find_previous(key(1), &second).unwrap();
        assert!(Arc::ptr_eq(&previous, &first));
        assert!(Arc::ptr_eq(&dedup.find(&key(1)).unwrap(), &first));
        assert!(dedup.find(&key(2)).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_mark_and_sweep() {
        let dedup = MarkAndSweep::new(Duration::from_secs(247), Duration::from_secs(10));
        assert_remembers(&dedup);

        tokio::time::advance(Duration::from_secs(200)).await;
        dedup.find_previous(key(2), &exchange());
        dedup.sweep();
        assert_eq!(dedup.len(), 2);

        tokio::time::advance(Duration::from_secs(50)).await;
        dedup.sweep();
        assert!(dedup.find(&key(1)).is_none());
        assert!(dedup.find(&key(2)).is_some());
    }

    #[test]
    fn test_crop_rotation_bound() {
        let dedup = CropRotation::new(Duration::from_secs(1));
        assert_remembers(&dedup);
        for mid in 10..20 {
            dedup.find_previous(key(mid), &exchange());
        }

        dedup.sweep();
        assert!((10..20).all(|mid| dedup.find(&key(mid)).is_some()));
        assert!(dedup.find_previous(key(10), &exchange()).is_some());

        dedup.sweep();
        assert!((10..20).all(|mid| dedup.find(&key(mid)).is_none()));
        assert!(dedup.find(&key(1)).is_none());
        assert!(dedup.is_empty());
    }

    #[test]
    fn test_noop() {
        let dedup = Noop;
        let first = exchange();
        assert!(dedup.find_previous(key(1), &first).is_none());
        assert!(dedup.find_previous(key(1), &first).is_none());
        assert!(dedup.find(&key(1)).is_none());
        assert_eq!(dedup.sweep_interval(), None);
    }

    #[test]
    fn test_from_config() {
        let mut config = CoapConfig::default();
        config.deduplicator = DeduplicatorKind::CropRotation;
        assert_eq!(
            from_config(&config).sweep_interval(),
            Some(config.crop_rotation_period)
        );
        config.deduplicator = DeduplicatorKind::Noop;
        assert_eq!(from_config(&config).sweep_interval(), None);
    }
}
