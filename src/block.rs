use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::debug;
use tokio::time::Instant;

use crate::message::options::{decode_uint, encode_uint};
use crate::message::{CoapOption, CoapRequest, MessageClass, Packet, Status};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidBlockValue {
    SizeExponentEncodingError(usize),
    NumberTooLarge(usize),
    BadEncoding,
}

impl fmt::Display for InvalidBlockValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvalidBlockValue::SizeExponentEncodingError(size) => {
                write!(f, "block size {} is not a power of two in 16..=1024", size)
            }
            InvalidBlockValue::NumberTooLarge(num) => write!(f, "block number {} too large", num),
            InvalidBlockValue::BadEncoding => write!(f, "block option longer than 3 bytes"),
        }
    }
}

impl std::error::Error for InvalidBlockValue {}

/// Value of a Block1 or Block2 option.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct BlockValue {
    pub num: u32,
    pub more: bool,
    pub size_exponent: u8,
}

const MAX_BLOCK_NUM: u32 = (1 << 20) - 1;

impl BlockValue {
    pub fn new(num: usize, more: bool, size: usize) -> Result<Self, InvalidBlockValue> {
        let true_size_exponent = Self::largest_power_of_2_not_in_excess(size)
            .ok_or(InvalidBlockValue::SizeExponentEncodingError(size))?;
        if !(4..=10).contains(&true_size_exponent) {
            return Err(InvalidBlockValue::SizeExponentEncodingError(size));
        }
        let num = u32::try_from(num)
            .ok()
            .filter(|n| *n <= MAX_BLOCK_NUM)
            .ok_or(InvalidBlockValue::NumberTooLarge(num))?;
        Ok(Self {
            num,
            more,
            size_exponent: (true_size_exponent - 4) as u8,
        })
    }

    /// Finds the largest power of 2 that does not exceed `target`.
    fn largest_power_of_2_not_in_excess(target: usize) -> Option<u32> {
        if target == 0 {
            return None;
        }
        Some(usize::BITS - 1 - target.leading_zeros())
    }

    pub fn size(&self) -> usize {
        1 << (self.size_exponent + 4)
    }

    /// Byte offset of the block's first byte.
    pub fn offset(&self) -> usize {
        self.num as usize * self.size()
    }

    pub fn from_packet(packet: &Packet, option: CoapOption) -> Option<BlockValue> {
        packet
            .get_first_option(option)
            .and_then(|value| BlockValue::try_from(value.as_slice()).ok())
    }

    pub fn set_on(self, packet: &mut Packet, option: CoapOption) {
        packet.clear_option(option);
        packet.add_option(option, self.into());
    }
}

impl From<BlockValue> for Vec<u8> {
    fn from(block_value: BlockValue) -> Vec<u8> {
        let scalar = block_value.num << 4
            | u32::from(block_value.more) << 3
            | u32::from(block_value.size_exponent & 0x7);
        encode_uint(scalar)
    }
}

impl TryFrom<&[u8]> for BlockValue {
    type Error = InvalidBlockValue;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        if value.len() > 3 {
            return Err(InvalidBlockValue::BadEncoding);
        }
        let scalar = decode_uint(value).ok_or(InvalidBlockValue::BadEncoding)?;
        let size_exponent = (scalar & 0x7) as u8;
        if size_exponent == 7 {
            return Err(InvalidBlockValue::SizeExponentEncodingError(2048));
        }
        Ok(Self {
            num: scalar >> 4,
            more: scalar >> 3 & 0x1 == 0x1,
            size_exponent,
        })
    }
}

/// Cuts block `block` out of `full`. `None` if the block starts past the end.
pub fn slice(full: &Packet, block: BlockValue) -> Option<Packet> {
    let offset = block.offset();
    if offset >= full.payload.len() && !(offset == 0 && full.payload.is_empty()) {
        return None;
    }
    let end = (offset + block.size()).min(full.payload.len());

    let mut packet = full.clone();
    packet.payload = full.payload[offset..end].to_vec();
    let more = end < full.payload.len();
    BlockValue { more, ..block }.set_on(&mut packet, CoapOption::Block2);
    if block.num == 0 {
        packet.set_uint_option(CoapOption::Size2, full.payload.len() as u32);
    }
    Some(packet)
}

#[derive(Ord, PartialOrd, Eq, PartialEq, Hash, Clone, Debug)]
pub struct RequestCacheKey {
    /// Request code as an integer to make it easy to derive Ord.
    request_type_ord: u8,
    path: Vec<String>,
    requester: Option<SocketAddr>,
}

impl From<&CoapRequest> for RequestCacheKey {
    fn from(request: &CoapRequest) -> Self {
        Self {
            request_type_ord: u8::from(request.message.header.code),
            path: request.get_path_as_vec(),
            requester: request.source,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BlockState {
    /// Last client request's block2 value (if any).
    pub last_request_block2: Option<BlockValue>,

    /// Full response further Block2 requests are served from.
    pub cached_response: Option<Packet>,

    /// Body being reassembled from Block1 requests.
    pub cached_request_payload: Option<Vec<u8>>,

    touched: Instant,
}

impl Default for BlockState {
    fn default() -> Self {
        BlockState {
            last_request_block2: None,
            cached_response: None,
            cached_request_payload: None,
            touched: Instant::now(),
        }
    }
}

/// What the endpoint does with a request after block handling.
#[derive(Debug)]
pub enum BlockOutcome {
    /// Pass the (possibly reassembled) request to the handler.
    Dispatch,
    /// Answer right away with this response; the handler is not involved.
    Respond(Packet),
}

/// Server-side block-wise transfer state, one entry per (peer, method, path).
#[derive(Debug)]
pub struct BlockCache {
    states: Mutex<HashMap<RequestCacheKey, BlockState>>,
    preferred_size: usize,
}

impl BlockCache {
    pub fn new(preferred_size: usize) -> BlockCache {
        BlockCache {
            states: Mutex::new(HashMap::new()),
            preferred_size,
        }
    }

    /// Handles Block1 uploads and Block2 continuations. A completed upload
    /// replaces the request payload with the whole body.
    pub fn intercept(&self, request: &mut CoapRequest) -> BlockOutcome {
        let key = RequestCacheKey::from(&*request);

        if let Some(block1) = BlockValue::from_packet(&request.message, CoapOption::Block1) {
            return self.receive_block1(key, block1, request);
        }

        let block2 = match BlockValue::from_packet(&request.message, CoapOption::Block2) {
            Some(block2) => block2,
            None => {
                self.lock().remove(&key);
                return BlockOutcome::Dispatch;
            }
        };

        let mut states = self.lock();
        let state = states.entry(key.clone()).or_default();
        state.last_request_block2 = Some(block2);
        state.touched = Instant::now();
        if block2.num == 0 {
            state.cached_response = None;
            return BlockOutcome::Dispatch;
        }

        let cached = match &state.cached_response {
            Some(cached) => cached.clone(),
            None => return BlockOutcome::Dispatch,
        };
        match slice(&cached, block2) {
            Some(packet) => {
                if !BlockValue::from_packet(&packet, CoapOption::Block2).map_or(false, |b| b.more) {
                    states.remove(&key);
                }
                BlockOutcome::Respond(packet)
            }
            None => {
                states.remove(&key);
                BlockOutcome::Respond(error_response(&cached, Status::BadOption))
            }
        }
    }

    fn receive_block1(
        &self,
        key: RequestCacheKey,
        block1: BlockValue,
        request: &mut CoapRequest,
    ) -> BlockOutcome {
        let mut states = self.lock();
        let state = states.entry(key.clone()).or_default();
        state.touched = Instant::now();

        let mut body = if block1.num == 0 {
            Vec::new()
        } else {
            state.cached_request_payload.take().unwrap_or_default()
        };

        if body.len() != block1.offset() {
            debug!(
                "block1 {} of /{} out of order, have {} bytes",
                block1.num,
                request.get_path(),
                body.len()
            );
            states.remove(&key);
            let mut response = Packet::new();
            response.header.code = MessageClass::Response(Status::RequestEntityIncomplete);
            return BlockOutcome::Respond(response);
        }
        body.extend_from_slice(&request.message.payload);

        if block1.more {
            state.cached_request_payload = Some(body);
            let mut response = Packet::new();
            response.header.code = MessageClass::Response(Status::Continue);
            block1.set_on(&mut response, CoapOption::Block1);
            return BlockOutcome::Respond(response);
        }

        states.remove(&key);
        request.message.payload = body;
        BlockOutcome::Dispatch
    }

    /// Fits a handler response into the negotiated block size, caching the
    /// full payload when it has to be split. Echoes the Block1 option of a
    /// completed upload.
    pub fn prepare_response(&self, request: &CoapRequest, response: &mut Packet) {
        if let Some(block1) = BlockValue::from_packet(&request.message, CoapOption::Block1) {
            block1.set_on(response, CoapOption::Block1);
        }

        let requested = BlockValue::from_packet(&request.message, CoapOption::Block2);
        let size = requested
            .map(|b| b.size())
            .unwrap_or(self.preferred_size)
            .min(self.preferred_size.max(16));
        if response.payload.len() <= size && requested.is_none() {
            return;
        }

        let num = requested.map_or(0, |b| b.num as usize);
        let block = match BlockValue::new(num, false, size) {
            Ok(block) => block,
            Err(_) => return,
        };
        if let Some(first) = slice(response, block) {
            if BlockValue::from_packet(&first, CoapOption::Block2).map_or(false, |b| b.more) {
                let key = RequestCacheKey::from(request);
                let mut states = self.lock();
                let state = states.entry(key).or_default();
                state.cached_response = Some(response.clone());
                state.touched = Instant::now();
            }
            *response = first;
        }
    }

    /// Forgets transfers idle for longer than `lifetime`.
    pub fn sweep(&self, lifetime: Duration) {
        let now = Instant::now();
        self.lock()
            .retain(|_, state| now.duration_since(state.touched) < lifetime);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<RequestCacheKey, BlockState>> {
        self.states.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn error_response(template: &Packet, status: Status) -> Packet {
    let mut response = Packet::new();
    response.header = template.header.clone();
    response.header.code = MessageClass::Response(status);
    response.set_token(template.get_token().to_vec());
    response
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::message::Method;

    fn request(method: Method, path: &str) -> CoapRequest {
        let mut request = CoapRequest::new();
        request.set_method(method);
        request.set_path(path);
        request.source = Some("10.0.0.1:5683".parse().unwrap());
        request
    }

    #[test]
    fn test_block_value() {
        let block = BlockValue::new(5, true, 64).unwrap();
        assert_eq!(block.size_exponent, 2);
        assert_eq!(block.size(), 64);
        assert_eq!(block.offset(), 320);
        let bytes: Vec<u8> = block.into();
        assert_eq!(bytes, vec![0x5A]);
        assert_eq!(BlockValue::try_from(&bytes[..]).unwrap(), block);

        assert_eq!(BlockValue::new(0, false, 100).unwrap().size(), 64);
        assert!(BlockValue::new(0, false, 8).is_err());
        assert!(BlockValue::new(0, false, 2048).is_err());
        assert!(BlockValue::new(1 << 20, false, 16).is_err());
        assert!(BlockValue::try_from(&[0x0F][..]).is_err());
    }

    #[test]
    fn test_large_response_is_sliced_and_cached() {
        let cache = BlockCache::new(16);
        let mut first = request(Method::Get, "big");
        assert!(matches!(cache.intercept(&mut first), BlockOutcome::Dispatch));

        let mut response = Packet::new();
        response.header.code = MessageClass::Response(Status::Content);
        response.payload = (0u8..40).collect();
        cache.prepare_response(&first, &mut response);

        assert_eq!(response.payload, (0u8..16).collect::<Vec<u8>>());
        let block = BlockValue::from_packet(&response, CoapOption::Block2).unwrap();
        assert!(block.more);
        assert_eq!(response.get_uint_option(CoapOption::Size2), Some(40));

        let mut next = request(Method::Get, "big");
        BlockValue::new(2, false, 16)
            .unwrap()
            .set_on(&mut next.message, CoapOption::Block2);
        match cache.intercept(&mut next) {
            BlockOutcome::Respond(last) => {
                assert_eq!(last.payload, (32u8..40).collect::<Vec<u8>>());
                assert!(!BlockValue::from_packet(&last, CoapOption::Block2).unwrap().more);
            }
            BlockOutcome::Dispatch => panic!("expected a cached block"),
        }
        assert!(cache.is_empty());
    }

    #[test]
    fn test_block1_reassembly() {
        let cache = BlockCache::new(512);
        let mut outcomes = Vec::new();
        for (num, more, chunk) in [(0, true, b"abcd"), (1, true, b"efgh"), (2, false, b"ij\0\0")] {
            let mut upload = request(Method::Put, "file");
            BlockValue::new(num, more, 16)
                .unwrap()
                .set_on(&mut upload.message, CoapOption::Block1);
            upload.message.payload = chunk.to_vec();
            if num < 2 {
                upload.message.payload.extend_from_slice(&[0; 12]);
            }
            outcomes.push((cache.intercept(&mut upload), upload));
        }

        for (outcome, _) in &outcomes[..2] {
            match outcome {
                BlockOutcome::Respond(r) => {
                    assert_eq!(r.header.code, MessageClass::Response(Status::Continue))
                }
                BlockOutcome::Dispatch => panic!("intermediate block dispatched"),
            }
        }
        let (outcome, upload) = &outcomes[2];
        assert!(matches!(outcome, BlockOutcome::Dispatch));
        assert_eq!(upload.message.payload.len(), 36);
        assert_eq!(&upload.message.payload[..4], b"abcd");
        assert_eq!(&upload.message.payload[16..20], b"efgh");
    }

    #[test]
    fn test_block1_out_of_order() {
        let cache = BlockCache::new(512);
        let mut upload = request(Method::Put, "file");
        BlockValue::new(3, true, 16)
            .unwrap()
            .set_on(&mut upload.message, CoapOption::Block1);
        match cache.intercept(&mut upload) {
            BlockOutcome::Respond(r) => assert_eq!(
                r.header.code,
                MessageClass::Response(Status::RequestEntityIncomplete)
            ),
            BlockOutcome::Dispatch => panic!("out of order block dispatched"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep() {
        let cache = BlockCache::new(16);
        let first = request(Method::Get, "big");
        let mut response = Packet::new();
        response.payload = vec![0; 64];
        cache.prepare_response(&first, &mut response);
        assert_eq!(cache.len(), 1);

        tokio::time::advance(Duration::from_secs(300)).await;
        cache.sweep(Duration::from_secs(247));
        assert!(cache.is_empty());
    }
}
