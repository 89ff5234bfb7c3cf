use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use log::info;
use tokio::net::{ToSocketAddrs, UdpSocket};

use crate::config::CoapConfig;
use crate::endpoint::CoapEndpoint;
use crate::observer::ChangeNotifier;
use crate::resource::{RequestHandler, ResourceAttributes, ResourceTree};
use crate::transport::Transport;

/// A CoAP server: one resource tree served on any number of endpoints.
pub struct Server {
    config: CoapConfig,
    resources: Arc<ResourceTree>,
    notifier: ChangeNotifier,
    endpoints: Vec<CoapEndpoint>,
    running: bool,
}

impl Default for Server {
    fn default() -> Self {
        Server::new()
    }
}

impl Server {
    pub fn new() -> Server {
        Server::with_config(CoapConfig::default())
    }

    pub fn with_config(config: CoapConfig) -> Server {
        Server {
            config,
            resources: Arc::new(ResourceTree::new()),
            notifier: ChangeNotifier::new(),
            endpoints: Vec::new(),
            running: false,
        }
    }

    pub fn config(&self) -> &CoapConfig {
        &self.config
    }

    /// Binds a UDP endpoint. If the server is running it starts serving
    /// right away.
    pub async fn add_endpoint<A: ToSocketAddrs>(&mut self, addr: A) -> io::Result<SocketAddr> {
        let socket = UdpSocket::bind(addr).await?;
        self.add_transport(Arc::new(socket))
    }

    pub fn add_transport(&mut self, transport: Arc<dyn Transport>) -> io::Result<SocketAddr> {
        let mut endpoint = CoapEndpoint::new(transport, self.config.clone());
        endpoint.set_shared_handler(self.resources.clone());
        endpoint.set_notifier(self.notifier.clone());
        let addr = endpoint.local_addr()?;
        if self.running {
            endpoint.start();
        }
        self.endpoints.push(endpoint);
        info!("endpoint {} added", addr);
        Ok(addr)
    }

    pub fn add_resource<H: RequestHandler>(
        &self,
        path: &str,
        handler: H,
        attributes: ResourceAttributes,
    ) {
        self.resources.add(path, handler, attributes);
    }

    pub fn resources(&self) -> &Arc<ResourceTree> {
        &self.resources
    }

    /// Handle for publishing resource changes from outside a request, e.g.
    /// from a [`ScheduledTask`](crate::ScheduledTask).
    pub fn notifier(&self) -> ChangeNotifier {
        self.notifier.clone()
    }

    pub fn endpoints(&self) -> &[CoapEndpoint] {
        &self.endpoints
    }

    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.endpoints
            .iter()
            .filter_map(|e| e.local_addr().ok())
            .collect()
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn start(&mut self) {
        for endpoint in &mut self.endpoints {
            endpoint.start();
        }
        self.running = true;
        info!("server started on {:?}", self.local_addrs());
    }

    /// Stops every endpoint. Pending retransmissions are cancelled and
    /// observe relations dropped; a later `start` begins from a clean state.
    pub async fn stop(&mut self) {
        for endpoint in &mut self.endpoints {
            endpoint.stop().await;
        }
        self.running = false;
        info!("server stopped");
    }

    /// Notifies the observers of `path` on every endpoint and waits until
    /// the notifications are queued.
    pub async fn notify_observers(&self, path: &str) {
        for endpoint in &self.endpoints {
            endpoint.notify_observers(path).await;
        }
    }
}
