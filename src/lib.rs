//! A CoAP stack ([RFC 7252](https://tools.ietf.org/rfc/rfc7252.txt)) built
//! around reliable message exchanges.
//!
//! Features:
//! - CoAP core protocol: CON/NON/ACK/RST, piggybacked and separate
//!   responses, retransmission with exponential back-off
//! - Duplicate detection (mark-and-sweep or crop-rotation)
//! - CoAP Observe option [RFC 7641](https://tools.ietf.org/rfc/rfc7641.txt)
//! - Block-Wise Transfers [RFC 7959](https://tools.ietf.org/html/rfc7959)
//! - Resource discovery through `/.well-known/core`
//!   [RFC 6690](https://tools.ietf.org/html/rfc6690)
//! - Pluggable transports; UDP and dual-stack UDP included
//!
//! # Installation
//!
//! ```toml
//! [dependencies]
//! coap-exchange = "0.1"
//! tokio = {version = "^1.32", features = ["full"]}
//! ```
//!
//! # Example
//!
//! ## Server:
//! ```no_run
//! use coap_exchange::{Request, ResourceAttributes, Server, StaticResource, Status};
//!
//! #[tokio::main]
//! async fn main() {
//!     let mut server = Server::new();
//!     server.add_resource(
//!         "hello",
//!         |mut request: Box<Request>| async move {
//!             request.respond(Status::Content, b"world".to_vec());
//!             request
//!         },
//!         ResourceAttributes::new().title("Greeting"),
//!     );
//!     server.add_resource(
//!         "temp",
//!         StaticResource::new(b"21.5".to_vec()),
//!         ResourceAttributes::new().observable(),
//!     );
//!     server.add_endpoint("127.0.0.1:5683").await.unwrap();
//!     server.start();
//!     tokio::signal::ctrl_c().await.unwrap();
//!     server.stop().await;
//! }
//! ```
//!
//! ## Client:
//! ```no_run
//! use coap_exchange::CoAPClient;
//!
//! #[tokio::main]
//! async fn main() {
//!     let client = CoAPClient::new_udp("127.0.0.1:5683").await.unwrap();
//!     let response = client.get("hello").await.unwrap();
//!     println!("Server reply: {}", String::from_utf8_lossy(&response.message.payload));
//! }
//! ```

#[cfg(test)]
extern crate quickcheck;

pub mod block;
pub mod client;
pub mod config;
pub mod dedup;
pub mod endpoint;
pub mod exchange;
pub mod ids;
pub mod message;
pub mod observer;
pub mod reliability;
pub mod request;
pub mod resource;
pub mod server;
pub mod transport;

pub use self::client::{CoAPClient, ObserveStream, RequestOptions};
pub use self::config::{BackpressurePolicy, CoapConfig, DeduplicatorKind};
pub use self::endpoint::{CoapEndpoint, ResponseReceiver};
pub use self::exchange::{Exchange, ExchangeState};
pub use self::message::{
    CoapOption, CoapRequest, CoapResponse, ContentFormat, MessageClass, MessageType, Method,
    ObserveOption, Packet, Status,
};
pub use self::observer::ChangeNotifier;
pub use self::request::RequestBuilder;
pub use self::resource::{
    Request, RequestHandler, ResourceAttributes, ResourceTree, ScheduledTask, StaticResource,
};
pub use self::server::Server;
pub use self::transport::{DualStackTransport, Transport};
