//! Datagram transports and the outbound queue in front of them.

use std::collections::VecDeque;
use std::io::{self, Error, ErrorKind};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use log::{debug, trace, warn};
use tokio::net::{ToSocketAddrs, UdpSocket};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::config::BackpressurePolicy;

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

#[async_trait]
impl Transport for UdpSocket {
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        UdpSocket::recv_from(self, buf).await
    }

    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        UdpSocket::send_to(self, buf, target).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }
}

/// An IPv4 and an IPv6 socket behaving as one transport. Datagrams from
/// either socket arrive through `recv_from`; sends pick the socket matching
/// the target's address family.
#[derive(Debug)]
pub struct DualStackTransport {
    v4: UdpSocket,
    v6: UdpSocket,
}

impl DualStackTransport {
    pub fn new(v4: UdpSocket, v6: UdpSocket) -> DualStackTransport {
        DualStackTransport { v4, v6 }
    }

    pub async fn bind<A: ToSocketAddrs, B: ToSocketAddrs>(v4: A, v6: B) -> io::Result<Self> {
        Ok(DualStackTransport {
            v4: UdpSocket::bind(v4).await?,
            v6: UdpSocket::bind(v6).await?,
        })
    }

    pub fn local_addr_v6(&self) -> io::Result<SocketAddr> {
        self.v6.local_addr()
    }
}

#[async_trait]
impl Transport for DualStackTransport {
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        loop {
            let socket = tokio::select! {
                ready = self.v4.readable() => { ready?; &self.v4 }
                ready = self.v6.readable() => { ready?; &self.v6 }
            };
            match socket.try_recv_from(buf) {
                Ok(received) => return Ok(received),
                Err(e) if e.kind() == ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e),
            }
        }
    }

    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        match target {
            SocketAddr::V4(_) => self.v4.send_to(buf, target).await,
            SocketAddr::V6(_) => self.v6.send_to(buf, target).await,
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.v4.local_addr()
    }
}

/// One queued datagram. `on_failure` is woken when the write fails so a
/// pending retransmission can fire early. A datagram whose `cancelled` token
/// fired while it was queued is skipped by the writer.
#[derive(Debug)]
pub struct Datagram {
    pub bytes: Vec<u8>,
    pub peer: SocketAddr,
    pub on_failure: Option<Arc<Notify>>,
    pub cancelled: Option<CancellationToken>,
}

impl Datagram {
    pub fn new(bytes: Vec<u8>, peer: SocketAddr) -> Datagram {
        Datagram {
            bytes,
            peer,
            on_failure: None,
            cancelled: None,
        }
    }

    pub fn on_failure(mut self, notify: Arc<Notify>) -> Datagram {
        self.on_failure = Some(notify);
        self
    }

    pub fn cancelled_by(mut self, token: CancellationToken) -> Datagram {
        self.cancelled = Some(token);
        self
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.as_ref().map_or(false, CancellationToken::is_cancelled)
    }
}

/// Bounded outbound queue drained by a single writer.
#[derive(Debug)]
pub struct Outbox {
    queue: Mutex<VecDeque<Datagram>>,
    capacity: usize,
    policy: BackpressurePolicy,
    readable: Notify,
    writable: Notify,
    closed: AtomicBool,
    dropped: AtomicU64,
}

impl Outbox {
    pub fn new(capacity: usize, policy: BackpressurePolicy) -> Outbox {
        Outbox {
            queue: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
            policy,
            readable: Notify::new(),
            writable: Notify::new(),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    /// Queues a datagram. With [`BackpressurePolicy::Block`] this waits for
    /// room; with [`BackpressurePolicy::DropOldest`] it evicts the head.
    pub async fn push(&self, datagram: Datagram) -> io::Result<()> {
        loop {
            let writable = self.writable.notified();
            {
                if self.closed.load(Ordering::Acquire) {
                    return Err(Error::new(ErrorKind::NotConnected, "outbox closed"));
                }
                let mut queue = self.lock();
                if queue.len() >= self.capacity {
                    if self.policy == BackpressurePolicy::DropOldest {
                        if let Some(old) = queue.pop_front() {
                            self.dropped.fetch_add(1, Ordering::Relaxed);
                            debug!("send queue full, dropped datagram to {}", old.peer);
                        }
                    }
                }
                if queue.len() < self.capacity {
                    queue.push_back(datagram);
                    self.readable.notify_one();
                    return Ok(());
                }
            }
            writable.await;
        }
    }

    /// Next datagram to write, or `None` once closed.
    pub async fn pop(&self) -> Option<Datagram> {
        loop {
            let readable = self.readable.notified();
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            if let Some(datagram) = self.lock().pop_front() {
                self.writable.notify_one();
                return Some(datagram);
            }
            readable.await;
        }
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.lock().clear();
        self.readable.notify_waiters();
        self.writable.notify_waiters();
    }

    pub fn reopen(&self) {
        self.closed.store(false, Ordering::Release);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Datagrams discarded by the drop-oldest policy.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Datagram>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Writes queued datagrams one at a time until cancelled.
pub async fn run_writer(
    outbox: Arc<Outbox>,
    transport: Arc<dyn Transport>,
    shutdown: CancellationToken,
) {
    loop {
        let datagram = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = outbox.pop() => match next {
                Some(datagram) => datagram,
                None => break,
            },
        };

        if datagram.is_cancelled() {
            trace!("skip cancelled datagram to {}", datagram.peer);
            continue;
        }
        trace!("send {} bytes to {}", datagram.bytes.len(), datagram.peer);
        if let Err(e) = transport.send_to(&datagram.bytes, datagram.peer).await {
            warn!("send to {} failed: {}", datagram.peer, e);
            if let Some(on_failure) = datagram.on_failure {
                on_failure.notify_one();
            }
        }
    }
    debug!("writer stopped");
}


#[cfg(test)]
mod test {
    use super::memory::MemoryNetwork;
    use super::*;
    use std::time::Duration;
    use tokio_test::{assert_pending, assert_ready, task};

    fn datagram(tag: u8) -> Datagram {
        Datagram::new(vec![tag], "127.0.0.1:5683".parse().unwrap())
    }

    #[tokio::test]
    async fn test_drop_oldest() {
        let outbox = Outbox::new(2, BackpressurePolicy::DropOldest);
        for tag in 1..=3 {
            outbox.push(datagram(tag)).await.unwrap();
        }
        assert_eq!(outbox.len(), 2);
        assert_eq!(outbox.dropped(), 1);
        assert_eq!(outbox.pop().await.unwrap().bytes, vec![2]);
        assert_eq!(outbox.pop().await.unwrap().bytes, vec![3]);
    }

    #[tokio::test]
    async fn test_block_waits_for_room() {
        let outbox = Arc::new(Outbox::new(1, BackpressurePolicy::Block));
        outbox.push(datagram(1)).await.unwrap();

        let mut push = task::spawn(outbox.push(datagram(2)));
        assert_pending!(push.poll());

        assert_eq!(outbox.pop().await.unwrap().bytes, vec![1]);
        assert!(push.is_woken());
        assert_ready!(push.poll()).unwrap();
        assert_eq!(outbox.pop().await.unwrap().bytes, vec![2]);
        assert_eq!(outbox.dropped(), 0);
    }

    #[tokio::test]
    async fn test_close_wakes_reader() {
        let outbox = Arc::new(Outbox::new(4, BackpressurePolicy::Block));
        let mut pop = task::spawn(outbox.pop());
        assert_pending!(pop.poll());
        outbox.close();
        assert!(assert_ready!(pop.poll()).is_none());
        assert!(outbox.push(datagram(1)).await.is_err());
    }

    #[tokio::test]
    async fn test_writer_reports_failure() {
        let network = MemoryNetwork::new();
        let a = network.bind(1);
        let b = network.bind(2);
        let outbox = Arc::new(Outbox::new(8, BackpressurePolicy::DropOldest));
        let shutdown = CancellationToken::new();
        let writer = tokio::spawn(run_writer(outbox.clone(), a.clone(), shutdown.clone()));

        outbox.push(Datagram::new(vec![7], b.addr())).await.unwrap();
        assert_eq!(b.recv().await, (vec![7], a.addr()));

        let failed = Arc::new(Notify::new());
        let unreachable: SocketAddr = ([10, 0, 0, 1], 9).into();
        outbox
            .push(Datagram::new(vec![8], unreachable).on_failure(failed.clone()))
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(1), failed.notified())
            .await
            .unwrap();

        shutdown.cancel();
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_writer_skips_cancelled_datagrams() {
        let network = MemoryNetwork::new();
        let a = network.bind(1);
        let b = network.bind(2);
        let outbox = Arc::new(Outbox::new(8, BackpressurePolicy::DropOldest));

        let stale = CancellationToken::new();
        outbox
            .push(Datagram::new(vec![1], b.addr()).cancelled_by(stale.clone()))
            .await
            .unwrap();
        outbox
            .push(Datagram::new(vec![2], b.addr()).cancelled_by(CancellationToken::new()))
            .await
            .unwrap();
        stale.cancel();

        let shutdown = CancellationToken::new();
        let writer = tokio::spawn(run_writer(outbox.clone(), a.clone(), shutdown.clone()));
        assert_eq!(b.recv().await, (vec![2], a.addr()));
        assert!(b.try_recv().is_none());

        shutdown.cancel();
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_dual_stack_receives_both_families() {
        let dual = match DualStackTransport::bind("127.0.0.1:0", "[::1]:0").await {
            Ok(dual) => dual,
            // no IPv6 loopback on this host
            Err(_) => return,
        };
        let v4_client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let v6_client = UdpSocket::bind("[::1]:0").await.unwrap();

        v4_client.send_to(b"four", dual.local_addr().unwrap()).await.unwrap();
        let mut buf = [0u8; 16];
        let (n, from) = dual.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"four");
        assert_eq!(from, v4_client.local_addr().unwrap());

        v6_client
            .send_to(b"six", dual.local_addr_v6().unwrap())
            .await
            .unwrap();
        let (n, from) = dual.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"six");
        assert_eq!(from, v6_client.local_addr().unwrap());

        dual.send_to(b"back", from).await.unwrap();
        let (n, _) = v6_client.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"back");
    }
}
