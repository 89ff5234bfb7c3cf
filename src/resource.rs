//! Request handlers and the resource tree.

use std::collections::BTreeMap;
use std::future::Future;
use std::net::SocketAddr;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tokio_stream::wrappers::IntervalStream;
use tokio_stream::StreamExt;

use crate::endpoint::EndpointInner;
use crate::exchange::Exchange;
use crate::message::{CoapOption, CoapRequest, ContentFormat, Method, Status};

/// Serves requests. The handler fills in `request.response`; removing the
/// response suppresses it.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle(&self, request: Box<Request>) -> Box<Request>;

    /// Whether a GET with Observe=0 on `path` establishes a relation.
    fn is_observable(&self, _path: &str) -> bool {
        false
    }
}

#[async_trait]
impl<F, Fut> RequestHandler for F
where
    F: Fn(Box<Request>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Box<Request>> + Send + 'static,
{
    async fn handle(&self, request: Box<Request>) -> Box<Request> {
        (self)(request).await
    }
}

/// A request being served, bound to its exchange.
pub struct Request {
    request: CoapRequest,
    exchange: Arc<Exchange>,
    endpoint: Arc<EndpointInner>,
}

impl Request {
    pub(crate) fn new(
        request: CoapRequest,
        exchange: Arc<Exchange>,
        endpoint: Arc<EndpointInner>,
    ) -> Request {
        Request {
            request,
            exchange,
            endpoint,
        }
    }

    pub fn into_inner(self: Box<Self>) -> CoapRequest {
        self.request
    }

    pub fn exchange(&self) -> &Arc<Exchange> {
        &self.exchange
    }

    pub fn peer(&self) -> SocketAddr {
        self.exchange.peer()
    }

    /// Acknowledges a confirmable request right away; the response will
    /// follow as a separate message. Has no effect on NON requests or once
    /// the exchange was answered.
    pub async fn accept(&self) {
        self.endpoint.accept(&self.exchange).await
    }

    /// Reports that the resource at `path` changed so its observers get
    /// notified.
    pub fn changed(&self, path: &str) {
        self.endpoint.notifier().notify(path);
    }

    pub fn respond(&mut self, status: Status, payload: Vec<u8>) {
        if let Some(response) = self.request.response.as_mut() {
            response.set_status(status);
            response.message.payload = payload;
        }
    }
}

impl Deref for Request {
    type Target = CoapRequest;

    fn deref(&self) -> &CoapRequest {
        &self.request
    }
}

impl DerefMut for Request {
    fn deref_mut(&mut self) -> &mut CoapRequest {
        &mut self.request
    }
}

/// Link-format attributes advertised through `/.well-known/core`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceAttributes {
    pub title: Option<String>,
    pub resource_types: Vec<String>,
    pub interfaces: Vec<String>,
    pub content_formats: Vec<u16>,
    pub observable: bool,
    pub hidden: bool,
}

impl ResourceAttributes {
    pub fn new() -> ResourceAttributes {
        ResourceAttributes::default()
    }

    pub fn title(mut self, title: &str) -> Self {
        self.title = Some(title.to_string());
        self
    }

    pub fn resource_type(mut self, rt: &str) -> Self {
        self.resource_types.push(rt.to_string());
        self
    }

    pub fn interface(mut self, interface: &str) -> Self {
        self.interfaces.push(interface.to_string());
        self
    }

    pub fn content_format(mut self, cf: ContentFormat) -> Self {
        self.content_formats.push(cf as u16);
        self
    }

    pub fn observable(mut self) -> Self {
        self.observable = true;
        self
    }

    /// Left out of discovery.
    pub fn hidden(mut self) -> Self {
        self.hidden = true;
        self
    }

    fn link(&self, path: &str) -> String {
        let mut link = format!("</{}>", path);
        if let Some(title) = &self.title {
            link.push_str(&format!(";title=\"{}\"", title));
        }
        if !self.resource_types.is_empty() {
            link.push_str(&format!(";rt=\"{}\"", self.resource_types.join(" ")));
        }
        if !self.interfaces.is_empty() {
            link.push_str(&format!(";if=\"{}\"", self.interfaces.join(" ")));
        }
        match self.content_formats.as_slice() {
            [] => {}
            [cf] => link.push_str(&format!(";ct={}", cf)),
            many => {
                let cts: Vec<String> = many.iter().map(u16::to_string).collect();
                link.push_str(&format!(";ct=\"{}\"", cts.join(" ")));
            }
        }
        if self.observable {
            link.push_str(";obs");
        }
        link
    }

    /// Matches a discovery query such as `rt=temp*`. A trailing `*` matches
    /// any suffix.
    fn matches(&self, path: &str, query: &str) -> bool {
        let (key, pattern) = match query.split_once('=') {
            Some(pair) => pair,
            None => return query == "obs" && self.observable,
        };
        let hit = |value: &str| match pattern.strip_suffix('*') {
            Some(prefix) => value.starts_with(prefix),
            None => value == pattern,
        };
        match key {
            "href" => hit(format!("/{}", path).as_str()),
            "rt" => self.resource_types.iter().any(|v| hit(v.as_str())),
            "if" => self.interfaces.iter().any(|v| hit(v.as_str())),
            "ct" => self.content_formats.iter().any(|v| hit(v.to_string().as_str())),
            "title" => self.title.as_deref().map_or(false, hit),
            _ => true,
        }
    }
}

#[derive(Default)]
struct Node {
    handler: Option<Arc<dyn RequestHandler>>,
    attributes: ResourceAttributes,
    children: BTreeMap<String, Node>,
}

impl Node {
    fn find(&self, segments: &[String]) -> Option<&Node> {
        match segments.split_first() {
            None => Some(self),
            Some((first, rest)) => self.children.get(first)?.find(rest),
        }
    }

    fn links(&self, prefix: &str, query: Option<&str>, out: &mut Vec<String>) {
        for (name, child) in &self.children {
            let path = if prefix.is_empty() {
                name.clone()
            } else {
                format!("{}/{}", prefix, name)
            };
            if child.handler.is_some()
                && !child.attributes.hidden
                && query.map_or(true, |q| child.attributes.matches(&path, q))
            {
                out.push(child.attributes.link(&path));
            }
            child.links(&path, query, out);
        }
    }
}

fn segments(path: &str) -> Vec<String> {
    path.split('/')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Hierarchical resources addressed by Uri-Path. Intermediate nodes without
/// a handler answer 4.04. The tree itself serves `/.well-known/core`.
pub struct ResourceTree {
    root: RwLock<Node>,
    create_on_put: AtomicBool,
}

impl Default for ResourceTree {
    fn default() -> Self {
        ResourceTree::new()
    }
}

impl ResourceTree {
    pub fn new() -> ResourceTree {
        ResourceTree {
            root: RwLock::new(Node::default()),
            create_on_put: AtomicBool::new(false),
        }
    }

    /// Lets a PUT on a missing path create a [`StaticResource`] holding the
    /// request payload.
    pub fn set_create_on_put(&self, enabled: bool) {
        self.create_on_put.store(enabled, Ordering::Relaxed);
    }

    pub fn add<H: RequestHandler>(&self, path: &str, handler: H, attributes: ResourceAttributes) {
        self.add_shared(path, Arc::new(handler), attributes)
    }

    /// Mounts `handler` at `path`, replacing whatever was there but keeping
    /// the children.
    pub fn add_shared(
        &self,
        path: &str,
        handler: Arc<dyn RequestHandler>,
        attributes: ResourceAttributes,
    ) {
        let mut node = &mut *self.root.write().unwrap_or_else(PoisonError::into_inner);
        for segment in segments(path) {
            node = node.children.entry(segment).or_default();
        }
        node.handler = Some(handler);
        node.attributes = attributes;
        debug!("resource /{} added", path.trim_matches('/'));
    }

    pub fn get(&self, path: &str) -> Option<Arc<dyn RequestHandler>> {
        self.lookup(&segments(path))
    }

    pub fn attributes(&self, path: &str) -> Option<ResourceAttributes> {
        let root = self.root.read().unwrap_or_else(PoisonError::into_inner);
        let node = root.find(&segments(path))?;
        node.handler.as_ref().map(|_| node.attributes.clone())
    }

    /// Removes the resource at `path` together with everything below it.
    pub fn remove(&self, path: &str) -> bool {
        let segments = segments(path);
        let (last, parents) = match segments.split_last() {
            Some(split) => split,
            None => return false,
        };
        let mut root = self.root.write().unwrap_or_else(PoisonError::into_inner);
        let mut node = &mut *root;
        for segment in parents {
            node = match node.children.get_mut(segment) {
                Some(child) => child,
                None => return false,
            };
        }
        node.children.remove(last).is_some()
    }

    /// The link-format description of every visible resource, optionally
    /// filtered by one `key=value` query.
    pub fn discover(&self, query: Option<&str>) -> String {
        let mut links = Vec::new();
        self.root
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .links("", query, &mut links);
        links.join(",")
    }

    fn lookup(&self, segments: &[String]) -> Option<Arc<dyn RequestHandler>> {
        let root = self.root.read().unwrap_or_else(PoisonError::into_inner);
        root.find(segments)?.handler.clone()
    }

    fn well_known_core(&self, request: &mut Request) {
        if request.get_method() != Some(Method::Get) {
            request.respond(Status::MethodNotAllowed, Vec::new());
            return;
        }
        let queries = request.get_query_as_vec();
        let links = self.discover(queries.first().map(String::as_str));
        request.respond(Status::Content, links.into_bytes());
        if let Some(response) = request.response.as_mut() {
            response
                .message
                .set_content_format(ContentFormat::ApplicationLinkFormat);
        }
    }

    fn create(&self, path: &str, request: &mut Request) {
        let resource = StaticResource::new(request.message.payload.clone());
        if let Some(cf) = request.message.get_content_format() {
            resource.set_content_format(cf);
        }
        self.add(path, resource, ResourceAttributes::new());
        info!("created /{} on PUT from {}", path, request.peer());

        request.respond(Status::Created, Vec::new());
        if let Some(response) = request.response.as_mut() {
            for segment in segments(path) {
                response
                    .message
                    .add_option(CoapOption::LocationPath, segment.into_bytes());
            }
        }
    }
}

#[async_trait]
impl RequestHandler for ResourceTree {
    async fn handle(&self, mut request: Box<Request>) -> Box<Request> {
        let segments = request.get_path_as_vec();
        if segments == [".well-known", "core"] {
            self.well_known_core(&mut request);
            return request;
        }
        let path = segments.join("/");
        let method = request.get_method();

        match self.lookup(&segments) {
            Some(handler) => {
                let request = handler.handle(request).await;
                let deleted = request
                    .response
                    .as_ref()
                    .and_then(|r| r.get_status())
                    == Some(Status::Deleted);
                if method == Some(Method::Delete) && deleted {
                    self.remove(&path);
                }
                request
            }
            None if method == Some(Method::Put) && self.create_on_put.load(Ordering::Relaxed) => {
                self.create(&path, &mut request);
                request
            }
            None => {
                request.respond(Status::NotFound, Vec::new());
                request
            }
        }
    }

    fn is_observable(&self, path: &str) -> bool {
        self.attributes(path).map_or(false, |a| a.observable)
    }
}

struct Representation {
    payload: Vec<u8>,
    content_format: Option<ContentFormat>,
}

/// A resource holding a fixed representation. PUT replaces it and notifies
/// observers; DELETE removes it from its tree.
pub struct StaticResource {
    state: Mutex<Representation>,
}

impl StaticResource {
    pub fn new(payload: Vec<u8>) -> StaticResource {
        StaticResource {
            state: Mutex::new(Representation {
                payload,
                content_format: None,
            }),
        }
    }

    pub fn with_content_format(self, cf: ContentFormat) -> Self {
        self.set_content_format(cf);
        self
    }

    pub fn set_content_format(&self, cf: ContentFormat) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .content_format = Some(cf);
    }

    pub fn payload(&self) -> Vec<u8> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .payload
            .clone()
    }

    /// Replaces the payload. Observers are not notified; use
    /// [`ChangeNotifier::notify`](crate::ChangeNotifier::notify) for that.
    pub fn set_payload(&self, payload: Vec<u8>) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .payload = payload;
    }
}

#[async_trait]
impl RequestHandler for StaticResource {
    async fn handle(&self, mut request: Box<Request>) -> Box<Request> {
        match request.get_method() {
            Some(Method::Get) => {
                let (payload, cf) = {
                    let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
                    (state.payload.clone(), state.content_format)
                };
                request.respond(Status::Content, payload);
                if let (Some(cf), Some(response)) = (cf, request.response.as_mut()) {
                    response.message.set_content_format(cf);
                }
            }
            Some(Method::Put) => {
                {
                    let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
                    state.payload = request.message.payload.clone();
                    state.content_format = request.message.get_content_format();
                }
                request.respond(Status::Changed, Vec::new());
                let path = request.get_path();
                request.changed(&path);
            }
            Some(Method::Delete) => request.respond(Status::Deleted, Vec::new()),
            _ => request.respond(Status::MethodNotAllowed, Vec::new()),
        }
        request
    }
}

/// Runs a job periodically until dropped or cancelled. Typical use is a
/// sensor resource that publishes a change every few seconds.
pub struct ScheduledTask {
    handle: JoinHandle<()>,
}

impl ScheduledTask {
    pub fn every<F, Fut>(period: Duration, mut job: F) -> ScheduledTask
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            let mut ticks = IntervalStream::new(interval_at(Instant::now() + period, period));
            while ticks.next().await.is_some() {
                job().await;
            }
        });
        ScheduledTask { handle }
    }

    pub fn cancel(&self) {
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::CoapConfig;
    use crate::endpoint::CoapEndpoint;
    use crate::message::{MessageClass, Packet};
    use crate::transport::memory::{MemoryNetwork, MemoryTransport};
    use crate::transport::Transport;
    use std::sync::atomic::{AtomicU16, AtomicUsize};
    use tokio::time::{sleep, timeout};

    fn tree() -> Arc<ResourceTree> {
        let tree = Arc::new(ResourceTree::new());
        tree.add(
            "sensors/temp",
            StaticResource::new(b"21.5".to_vec()).with_content_format(ContentFormat::TextPlain),
            ResourceAttributes::new()
                .title("Temperature")
                .resource_type("temperature-c")
                .interface("sensor")
                .content_format(ContentFormat::TextPlain)
                .observable(),
        );
        tree.add(
            "sensors/light",
            StaticResource::new(b"300".to_vec()),
            ResourceAttributes::new().resource_type("light-lux"),
        );
        tree.add("secret", StaticResource::new(vec![]), ResourceAttributes::new().hidden());
        tree
    }

    async fn serve(tree: Arc<ResourceTree>) -> (CoapEndpoint, Arc<MemoryTransport>) {
        let network = MemoryNetwork::new();
        let mut server = CoapEndpoint::new(network.bind(5683), CoapConfig::default());
        server.set_shared_handler(tree);
        server.start();
        (server, network.bind(40000))
    }

    async fn exchange(
        client: &MemoryTransport,
        server: &CoapEndpoint,
        method: Method,
        path: &str,
        payload: &[u8],
    ) -> Packet {
        let mut request = CoapRequest::new();
        request.set_method(method);
        request.set_path(path);
        static MID: AtomicU16 = AtomicU16::new(1);
        request.message.header.set_message_id(MID.fetch_add(1, Ordering::Relaxed));
        request.message.set_token(vec![1, 2]);
        request.message.payload = payload.to_vec();
        client
            .send_to(&request.message.to_bytes().unwrap(), server.local_addr().unwrap())
            .await
            .unwrap();
        let (bytes, _) = timeout(Duration::from_secs(5), client.recv()).await.unwrap();
        Packet::from_bytes(&bytes).unwrap()
    }

    fn status(packet: &Packet) -> Status {
        match packet.header.code {
            MessageClass::Response(status) => status,
            other => panic!("not a response: {:?}", other),
        }
    }

    #[test]
    fn test_discovery_lists_visible_resources() {
        let tree = tree();
        assert_eq!(
            tree.discover(None),
            "</sensors/light>;rt=\"light-lux\",\
             </sensors/temp>;title=\"Temperature\";rt=\"temperature-c\";if=\"sensor\";ct=0;obs"
        );
        assert_eq!(tree.discover(Some("rt=temp*")).matches("</").count(), 1);
        assert_eq!(tree.discover(Some("href=/sensors/light")), "</sensors/light>;rt=\"light-lux\"");
        assert_eq!(tree.discover(Some("obs")).matches("</").count(), 1);
        assert!(tree.discover(Some("rt=none")).is_empty());
    }

    #[test]
    fn test_tree_add_get_remove() {
        let tree = tree();
        assert!(tree.get("sensors/temp").is_some());
        assert!(tree.get("/sensors/temp/").is_some());
        assert!(tree.get("sensors").is_none());
        assert!(tree.is_observable("sensors/temp"));
        assert!(!tree.is_observable("sensors/light"));

        assert!(tree.remove("sensors"));
        assert!(tree.get("sensors/temp").is_none());
        assert!(!tree.remove("sensors"));
    }

    #[tokio::test]
    async fn test_get_put_delete() {
        let tree = tree();
        let (server, client) = serve(tree.clone()).await;

        let response = exchange(&client, &server, Method::Get, "sensors/temp", b"").await;
        assert_eq!(status(&response), Status::Content);
        assert_eq!(response.payload, b"21.5".to_vec());
        assert_eq!(response.get_content_format(), Some(ContentFormat::TextPlain));

        let response = exchange(&client, &server, Method::Put, "sensors/temp", b"22").await;
        assert_eq!(status(&response), Status::Changed);
        let response = exchange(&client, &server, Method::Get, "sensors/temp", b"").await;
        assert_eq!(response.payload, b"22".to_vec());

        let response = exchange(&client, &server, Method::Post, "sensors/temp", b"").await;
        assert_eq!(status(&response), Status::MethodNotAllowed);

        let response = exchange(&client, &server, Method::Delete, "sensors/light", b"").await;
        assert_eq!(status(&response), Status::Deleted);
        assert!(tree.get("sensors/light").is_none());
        let response = exchange(&client, &server, Method::Get, "sensors/light", b"").await;
        assert_eq!(status(&response), Status::NotFound);
    }

    #[tokio::test]
    async fn test_put_creates_when_enabled() {
        let tree = tree();
        let (server, client) = serve(tree.clone()).await;

        let response = exchange(&client, &server, Method::Put, "new/thing", b"v").await;
        assert_eq!(status(&response), Status::NotFound);

        tree.set_create_on_put(true);
        let response = exchange(&client, &server, Method::Put, "new/thing", b"v").await;
        assert_eq!(status(&response), Status::Created);
        let location: Vec<&Vec<u8>> = response
            .get_option(CoapOption::LocationPath)
            .unwrap()
            .iter()
            .collect();
        assert_eq!(location, vec![&b"new".to_vec(), &b"thing".to_vec()]);

        let response = exchange(&client, &server, Method::Get, "new/thing", b"").await;
        assert_eq!(response.payload, b"v".to_vec());
    }

    #[tokio::test]
    async fn test_well_known_core() {
        let (server, client) = serve(tree()).await;
        let response = exchange(&client, &server, Method::Get, ".well-known/core", b"").await;
        assert_eq!(status(&response), Status::Content);
        assert_eq!(
            response.get_content_format(),
            Some(ContentFormat::ApplicationLinkFormat)
        );
        let body = String::from_utf8(response.payload).unwrap();
        assert!(body.contains("</sensors/temp>"));
        assert!(!body.contains("secret"));

        let response = exchange(&client, &server, Method::Post, ".well-known/core", b"").await;
        assert_eq!(status(&response), Status::MethodNotAllowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduled_task_stops_on_drop() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let task = ScheduledTask::every(Duration::from_secs(1), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        sleep(Duration::from_millis(3_500)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);

        drop(task);
        sleep(Duration::from_secs(5)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }
}
