//! Retransmission of confirmable messages with exponential back-off.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use rand::Rng;
use tokio::time;
use tokio_util::sync::CancellationToken;

use crate::config::CoapConfig;
use crate::exchange::{Exchange, ExchangeState};

/// Timing parameters of a confirmable transmission.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransmissionParams {
    pub ack_timeout: Duration,
    pub ack_random_factor: f64,
    pub max_retransmit: u32,
}

impl TransmissionParams {
    pub fn from_config(config: &CoapConfig) -> TransmissionParams {
        TransmissionParams {
            ack_timeout: config.ack_timeout,
            ack_random_factor: config.ack_random_factor,
            max_retransmit: config.max_retransmit,
        }
    }

    /// A random duration between `ack_timeout` and
    /// `ack_timeout * ack_random_factor`. A factor that is not a finite
    /// number above 1 means no jitter.
    pub fn initial_timeout(&self) -> Duration {
        if !self.ack_random_factor.is_finite() || self.ack_random_factor <= 1.0 {
            return self.ack_timeout;
        }
        let factor = rand::thread_rng().gen_range(1.0..=self.ack_random_factor);
        Duration::try_from_secs_f64(self.ack_timeout.as_secs_f64() * factor)
            .unwrap_or(Duration::MAX)
    }
}

impl Default for TransmissionParams {
    fn default() -> Self {
        TransmissionParams::from_config(&CoapConfig::default())
    }
}

/// Where retransmissions go and who hears about exhausted ones.
#[async_trait]
pub trait Retransmitter: Send + Sync + 'static {
    /// Queues one retransmission. `cancelled` fires if the exchange is
    /// answered before the datagram is written.
    async fn retransmit(
        &self,
        exchange: &Arc<Exchange>,
        message: &[u8],
        cancelled: CancellationToken,
    );

    /// Called once when `max_retransmit` retransmissions of `mid` went
    /// unanswered. The timer is already cleared.
    async fn give_up(&self, exchange: &Arc<Exchange>, mid: u16);
}

#[derive(Debug, Clone, Default)]
pub struct ReliabilityLayer {
    params: TransmissionParams,
}

impl ReliabilityLayer {
    pub fn new(params: TransmissionParams) -> ReliabilityLayer {
        ReliabilityLayer { params }
    }

    pub fn params(&self) -> &TransmissionParams {
        &self.params
    }

    /// Schedules retransmissions of `message`, which was just sent with
    /// message ID `mid`. Any retransmission already running for the exchange
    /// is replaced.
    pub fn start<R>(&self, exchange: &Arc<Exchange>, mid: u16, message: Vec<u8>, sink: Arc<R>)
    where
        R: Retransmitter + ?Sized,
    {
        let initial = self.params.initial_timeout();
        let max_retransmit = self.params.max_retransmit;

        let epoch = {
            let mut inner = exchange.lock();
            inner.cancel_retransmission();
            inner.retransmission.timeout = initial;
            inner.retransmission.count = 0;
            inner.retransmission.mid = Some(mid);
            inner.retransmission.epoch
        };

        let failed = exchange.send_failed();
        let owner = exchange.clone();
        let timer = tokio::spawn(async move {
            let mut timeout = initial;
            loop {
                tokio::select! {
                    _ = time::sleep(timeout) => {}
                    _ = failed.notified() => {
                        debug!("send of mid {} to {} failed", mid, owner.peer());
                    }
                }

                let attempt = {
                    let mut inner = owner.lock();
                    if inner.retransmission.epoch != epoch {
                        return;
                    }
                    if inner.retransmission.count >= max_retransmit {
                        inner.retransmission.timer = None;
                        inner.retransmission.mid = None;
                        inner.retransmission.epoch = epoch.wrapping_add(1);
                        None
                    } else {
                        inner.retransmission.count += 1;
                        timeout = timeout.saturating_mul(2);
                        inner.retransmission.timeout = timeout;
                        if matches!(
                            inner.state,
                            ExchangeState::Sending | ExchangeState::AwaitingResponse
                        ) {
                            inner.state = ExchangeState::Retransmitting;
                        }
                        Some((inner.retransmission.count, inner.retransmission.queued.clone()))
                    }
                };

                match attempt {
                    Some((count, cancelled)) => {
                        debug!(
                            "retransmission {}/{} of mid {} to {}",
                            count,
                            max_retransmit,
                            mid,
                            owner.peer()
                        );
                        sink.retransmit(&owner, &message, cancelled).await;
                    }
                    None => {
                        warn!(
                            "giving up on mid {} to {} after {} retransmissions",
                            mid,
                            owner.peer(),
                            max_retransmit
                        );
                        sink.give_up(&owner, mid).await;
                        return;
                    }
                }
            }
        });

        let mut inner = exchange.lock();
        if inner.retransmission.epoch == epoch {
            inner.retransmission.timer = Some(timer);
        } else {
            timer.abort();
        }
    }

    /// Stops retransmission of the exchange. Returns whether a timer was
    /// still pending.
    pub fn cancel(&self, exchange: &Exchange) -> bool {
        exchange.cancel_retransmission()
    }

    /// A failed send counts as an elapsed timeout.
    pub fn signal_send_failure(&self, exchange: &Exchange) {
        exchange.send_failed().notify_one();
    }
}
