use std::io::{Error, ErrorKind, Result};
use std::str::FromStr;
use std::time::Duration;

pub const COAP_DEFAULT_PORT: u16 = 5683;

/// Upper bound accepted for `MAX_RETRANSMIT`; the back-off doubles per
/// retransmission.
pub const MAX_RETRANSMIT_LIMIT: u32 = 20;

/// Upper bound accepted for `ACK_RANDOM_FACTOR`.
pub const MAX_ACK_RANDOM_FACTOR: f64 = 16.0;

/// Which duplicate-detection strategy an endpoint runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeduplicatorKind {
    /// Timestamped entries removed by a periodic sweep.
    MarkAndSweep,
    /// Two alternating generations, the older one dropped on each rotation.
    CropRotation,
    /// Stores nothing. Only for transports that never duplicate.
    Noop,
}

impl FromStr for DeduplicatorKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "MarkAndSweep" | "DEDUPLICATOR_MARK_AND_SWEEP" => Ok(DeduplicatorKind::MarkAndSweep),
            "CropRotation" | "DEDUPLICATOR_CROP_ROTATION" => Ok(DeduplicatorKind::CropRotation),
            "Noop" | "NO_DEDUPLICATOR" => Ok(DeduplicatorKind::Noop),
            other => Err(Error::new(
                ErrorKind::InvalidData,
                format!("unknown deduplicator {:?}", other),
            )),
        }
    }
}

/// What the outbound queue does when it is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackpressurePolicy {
    /// The producer waits until the writer frees a slot.
    Block,
    /// The oldest queued datagram is discarded to make room.
    DropOldest,
}

impl FromStr for BackpressurePolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "Block" => Ok(BackpressurePolicy::Block),
            "DropOldest" => Ok(BackpressurePolicy::DropOldest),
            other => Err(Error::new(
                ErrorKind::InvalidData,
                format!("unknown backpressure policy {:?}", other),
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CoapConfig {
    pub default_port: u16,
    /// Base retransmission timeout of a CON message.
    pub ack_timeout: Duration,
    /// The first timeout is drawn from `[ack_timeout, ack_timeout * ack_random_factor]`.
    pub ack_random_factor: f64,
    pub max_retransmit: u32,
    /// How long a CON message ID stays remembered for duplicate detection.
    pub exchange_lifetime: Duration,
    /// How long a NON request waits for a response before it is dropped.
    pub non_lifetime: Duration,
    pub deduplicator: DeduplicatorKind,
    pub mark_and_sweep_interval: Duration,
    pub crop_rotation_period: Duration,
    pub max_message_size: usize,
    pub preferred_block_size: usize,
    pub send_queue_capacity: usize,
    pub backpressure: BackpressurePolicy,
    /// Every n-th notification of a relation is sent confirmable.
    pub notification_check_interval_count: u32,
    /// Failed confirmable notifications tolerated before a relation is removed.
    pub max_observe_failures: u32,
}

impl Default for CoapConfig {
    fn default() -> Self {
        Self {
            default_port: COAP_DEFAULT_PORT,
            ack_timeout: Duration::from_millis(2000),
            ack_random_factor: 1.5,
            max_retransmit: 4,
            exchange_lifetime: Duration::from_secs(247),
            non_lifetime: Duration::from_secs(145),
            deduplicator: DeduplicatorKind::MarkAndSweep,
            mark_and_sweep_interval: Duration::from_secs(10),
            crop_rotation_period: Duration::from_secs(247),
            max_message_size: 1152,
            preferred_block_size: 512,
            send_queue_capacity: 1024,
            backpressure: BackpressurePolicy::DropOldest,
            notification_check_interval_count: 100,
            max_observe_failures: 1,
        }
    }
}

impl CoapConfig {
    /// Reads `KEY=VALUE` lines on top of the defaults. Durations are in
    /// milliseconds. Blank lines and lines starting with `#` are skipped.
    pub fn from_properties(text: &str) -> Result<CoapConfig> {
        let mut config = CoapConfig::default();

        for line in text.lines().map(str::trim) {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line.split_once('=').ok_or_else(|| {
                Error::new(ErrorKind::InvalidData, format!("malformed line {:?}", line))
            })?;
            config.set(key.trim(), value.trim())?;
        }

        Ok(config)
    }

    fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "DEFAULT_PORT" => self.default_port = parse(key, value)?,
            "ACK_TIMEOUT" => self.ack_timeout = millis(key, value)?,
            "ACK_RANDOM_FACTOR" => {
                let factor: f64 = parse(key, value)?;
                if !(1.0..=MAX_ACK_RANDOM_FACTOR).contains(&factor) {
                    return Err(out_of_range(key, value));
                }
                self.ack_random_factor = factor;
            }
            "MAX_RETRANSMIT" => {
                let count: u32 = parse(key, value)?;
                if count > MAX_RETRANSMIT_LIMIT {
                    return Err(out_of_range(key, value));
                }
                self.max_retransmit = count;
            }
            "EXCHANGE_LIFETIME" => self.exchange_lifetime = millis(key, value)?,
            "NON_LIFETIME" => self.non_lifetime = millis(key, value)?,
            "DEDUPLICATOR" => self.deduplicator = value.parse()?,
            "MARK_AND_SWEEP_INTERVAL" => self.mark_and_sweep_interval = millis(key, value)?,
            "CROP_ROTATION_PERIOD" => self.crop_rotation_period = millis(key, value)?,
            "MAX_MESSAGE_SIZE" => self.max_message_size = parse(key, value)?,
            "PREFERRED_BLOCK_SIZE" => self.preferred_block_size = parse(key, value)?,
            "SEND_QUEUE_CAPACITY" => self.send_queue_capacity = parse(key, value)?,
            "BACKPRESSURE" => self.backpressure = value.parse()?,
            "NOTIFICATION_CHECK_INTERVAL_COUNT" => {
                self.notification_check_interval_count = parse(key, value)?
            }
            "MAX_OBSERVE_FAILURES" => self.max_observe_failures = parse(key, value)?,
            _ => {
                return Err(Error::new(
                    ErrorKind::InvalidData,
                    format!("unknown configuration key {:?}", key),
                ))
            }
        }
        Ok(())
    }
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value.parse().map_err(|_| {
        Error::new(
            ErrorKind::InvalidData,
            format!("invalid value {:?} for {}", value, key),
        )
    })
}

fn out_of_range(key: &str, value: &str) -> Error {
    Error::new(
        ErrorKind::InvalidData,
        format!("value {:?} for {} is out of range", value, key),
    )
}

fn millis(key: &str, value: &str) -> Result<Duration> {
    parse::<u64>(key, value).map(Duration::from_millis)
}
