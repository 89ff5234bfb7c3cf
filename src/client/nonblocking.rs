use std::io::{Error, ErrorKind, Result};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::{ready, Stream};
use log::{debug, trace};
use tokio::net::{lookup_host, ToSocketAddrs, UdpSocket};
use tokio::time;

use super::RequestOptions;
use crate::block::BlockValue;
use crate::config::CoapConfig;
use crate::endpoint::{CoapEndpoint, ResponseReceiver};
use crate::message::{
    CoapOption, CoapRequest, CoapResponse, MessageType, Method, ObserveOption, Packet, Status,
};
use crate::observer::NotificationOrderer;
use crate::request::RequestBuilder;
use crate::transport::Transport;

fn invalid_data<E: ToString>(e: E) -> Error {
    Error::new(ErrorKind::InvalidData, e.to_string())
}

/// An asynchronous CoAP client bound to one server.
pub struct CoAPClient {
    peer: SocketAddr,
    endpoint: CoapEndpoint,
    options: RequestOptions,
}

impl CoAPClient {
    pub async fn new_udp<A: ToSocketAddrs>(addr: A) -> Result<CoAPClient> {
        CoAPClient::new_with_config(addr, CoapConfig::default()).await
    }

    /// Resolves `addr` and binds a local socket of the same family.
    pub async fn new_with_config<A: ToSocketAddrs>(
        addr: A,
        config: CoapConfig,
    ) -> Result<CoAPClient> {
        let peer = lookup_host(addr)
            .await?
            .next()
            .ok_or_else(|| Error::new(ErrorKind::NotFound, "no peer address found"))?;
        let bind_addr = match peer {
            SocketAddr::V4(_) => "0.0.0.0:0",
            SocketAddr::V6(_) => "[::]:0",
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        debug!("bound to {} for {}", socket.local_addr()?, peer);
        Ok(CoAPClient::with_transport(Arc::new(socket), peer, config))
    }

    /// Runs the client over an arbitrary transport.
    pub fn with_transport(
        transport: Arc<dyn Transport>,
        peer: SocketAddr,
        config: CoapConfig,
    ) -> CoAPClient {
        let mut endpoint = CoapEndpoint::new(transport, config);
        endpoint.start();
        CoAPClient {
            peer,
            endpoint,
            options: RequestOptions::default(),
        }
    }

    pub fn set_options(&mut self, options: RequestOptions) {
        self.options = options;
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.endpoint.local_addr()
    }

    pub async fn get(&self, path: &str) -> Result<CoapResponse> {
        self.send(self.builder(path, Method::Get).build()).await
    }

    pub async fn post(&self, path: &str, data: Vec<u8>) -> Result<CoapResponse> {
        self.send(self.builder(path, Method::Post).payload(data).build())
            .await
    }

    pub async fn put(&self, path: &str, data: Vec<u8>) -> Result<CoapResponse> {
        self.send(self.builder(path, Method::Put).payload(data).build())
            .await
    }

    pub async fn delete(&self, path: &str) -> Result<CoapResponse> {
        self.send(self.builder(path, Method::Delete).build()).await
    }

    fn builder(&self, path: &str, method: Method) -> RequestBuilder {
        RequestBuilder::new(path, method).confirmable(!self.options.non_confirmable)
    }

    /// Sends `request` and waits for the response. Payloads larger than the
    /// preferred block size go out as a Block1 upload; a Block2 response is
    /// followed until the whole body has arrived.
    pub async fn send(&self, request: CoapRequest) -> Result<CoapResponse> {
        let request = request.message;
        let block_size = BlockValue::new(0, false, self.endpoint.config().preferred_block_size)
            .map_err(invalid_data)?
            .size();
        if request.payload.len() > block_size {
            return self.upload(request, block_size).await;
        }
        let response = self.exchange(request.clone()).await?;
        self.follow_block2(request, response).await
    }

    /// One request, one response.
    async fn exchange(&self, request: Packet) -> Result<CoapResponse> {
        let wait = self.response_timeout(&request);
        let mut receiver = self.endpoint.send_request(request, self.peer).await?;
        match time::timeout(wait, receiver.recv()).await {
            Ok(response) => response,
            Err(_) => Err(Error::new(ErrorKind::TimedOut, "no response")),
        }
    }

    fn response_timeout(&self, request: &Packet) -> Duration {
        let config = self.endpoint.config();
        self.options.timeout().unwrap_or_else(|| {
            if request.header.get_type() == MessageType::Confirmable {
                config.exchange_lifetime
            } else {
                config.non_lifetime
            }
        })
    }

    async fn upload(&self, request: Packet, block_size: usize) -> Result<CoapResponse> {
        let body = request.payload.clone();
        let mut num = 0;
        loop {
            let offset = num * block_size;
            let end = (offset + block_size).min(body.len());
            let more = end < body.len();
            let block = BlockValue::new(num, more, block_size).map_err(invalid_data)?;

            let mut part = request.clone();
            part.set_token(Vec::new());
            part.payload = body[offset..end].to_vec();
            block.set_on(&mut part, CoapOption::Block1);
            if num == 0 {
                part.set_uint_option(CoapOption::Size1, body.len() as u32);
            }
            trace!("block1 {} ({} bytes) of /{}", num, part.payload.len(), path_of(&part));

            let response = self.exchange(part).await?;
            if !more {
                let mut follow = request;
                follow.payload.clear();
                return self.follow_block2(follow, response).await;
            }
            if response.get_status() != Some(Status::Continue) {
                return Ok(response);
            }
            num += 1;
        }
    }

    async fn follow_block2(
        &self,
        request: Packet,
        mut response: CoapResponse,
    ) -> Result<CoapResponse> {
        let mut block = match BlockValue::from_packet(&response.message, CoapOption::Block2) {
            Some(block) => block,
            None => return Ok(response),
        };
        let mut body = std::mem::take(&mut response.message.payload);
        while block.more {
            let next = BlockValue::new(block.num as usize + 1, false, block.size())
                .map_err(invalid_data)?;
            let mut follow = request.clone();
            follow.set_token(Vec::new());
            follow.clear_option(CoapOption::Observe);
            follow.clear_option(CoapOption::Block1);
            next.set_on(&mut follow, CoapOption::Block2);

            let mut part = self.exchange(follow).await?;
            if !part.get_status().map_or(false, |s| s.is_success()) {
                return Ok(part);
            }
            block = BlockValue::from_packet(&part.message, CoapOption::Block2)
                .filter(|b| b.num == next.num)
                .ok_or_else(|| invalid_data(format!("expected block2 {}", next.num)))?;
            body.append(&mut part.message.payload);
            response = part;
        }
        response.message.clear_option(CoapOption::Block2);
        response.message.payload = body;
        Ok(response)
    }

    /// Registers interest in `path`. The stream yields the registration
    /// response and then every fresh notification.
    pub async fn observe(&self, path: &str) -> Result<ObserveStream> {
        let request = self
            .builder(path, Method::Get)
            .observe(ObserveOption::Register)
            .build();
        let wait = self.response_timeout(&request.message);
        let mut receiver = self.endpoint.send_request(request.message, self.peer).await?;
        let first = time::timeout(wait, receiver.recv())
            .await
            .map_err(|_| Error::new(ErrorKind::TimedOut, "no response"))??;
        if !first.get_status().map_or(false, |s| s.is_success()) {
            return Err(Error::new(
                ErrorKind::Other,
                format!("observe rejected with {:?}", first.get_status()),
            ));
        }

        let mut orderer = NotificationOrderer::new();
        if let Some(sequence) = first.message.get_observe_value() {
            orderer.accept(sequence);
        }
        Ok(ObserveStream {
            path: path.to_string(),
            receiver,
            orderer,
            first: Some(first),
        })
    }

    /// Ends an observation explicitly with an Observe=1 GET.
    pub async fn unobserve(&self, stream: ObserveStream) -> Result<CoapResponse> {
        let token = stream.token();
        let path = stream.path.clone();
        drop(stream);
        let request = self
            .builder(&path, Method::Get)
            .observe(ObserveOption::Deregister)
            .token(token)
            .build();
        self.exchange(request.message).await
    }

    pub async fn stop(&mut self) {
        self.endpoint.stop().await
    }
}

fn path_of(packet: &Packet) -> String {
    packet
        .get_option(CoapOption::UriPath)
        .map(|segments| {
            segments
                .iter()
                .map(|s| String::from_utf8_lossy(s).into_owned())
                .collect::<Vec<_>>()
                .join("/")
        })
        .unwrap_or_default()
}

/// Notifications of one observation, oldest first, stale ones dropped.
/// Dropping the stream cancels the observation the next time the server
/// notifies.
pub struct ObserveStream {
    path: String,
    receiver: ResponseReceiver,
    orderer: NotificationOrderer,
    first: Option<CoapResponse>,
}

impl ObserveStream {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn token(&self) -> Vec<u8> {
        self.receiver.token()
    }
}

impl Stream for ObserveStream {
    type Item = CoapResponse;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<CoapResponse>> {
        if let Some(first) = self.first.take() {
            return Poll::Ready(Some(first));
        }
        loop {
            match ready!(Pin::new(&mut self.receiver).poll_next(cx)) {
                None => return Poll::Ready(None),
                Some(Err(e)) => {
                    debug!("observation of /{} ended: {}", self.path, e);
                    return Poll::Ready(None);
                }
                Some(Ok(response)) => match response.message.get_observe_value() {
                    Some(sequence) if !self.orderer.accept(sequence) => {
                        debug!("stale notification {} of /{} dropped", sequence, self.path);
                    }
                    _ => return Poll::Ready(Some(response)),
                },
            }
        }
    }
}
