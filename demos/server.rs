use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use coap_exchange::{
    ContentFormat, Method, Request, ResourceAttributes, ScheduledTask, Server, StaticResource,
    Status,
};

#[tokio::main]
async fn main() {
    let addr = "127.0.0.1:5683";

    let mut server = Server::new();
    server.resources().set_create_on_put(true);

    server.add_resource(
        "hello",
        |mut request: Box<Request>| async move {
            match request.get_method() {
                Some(Method::Get) => request.respond(Status::Content, b"world".to_vec()),
                Some(Method::Post) => {
                    let body = String::from_utf8_lossy(&request.message.payload).to_string();
                    println!("post from {}: {}", request.peer(), body);
                    request.respond(Status::Changed, Vec::new())
                }
                _ => request.respond(Status::MethodNotAllowed, Vec::new()),
            }
            request
        },
        ResourceAttributes::new().title("Greeting"),
    );

    server.add_resource(
        "config",
        StaticResource::new(b"interval=5".to_vec()).with_content_format(ContentFormat::TextPlain),
        ResourceAttributes::new().observable().content_format(ContentFormat::TextPlain),
    );

    let ticks = Arc::new(AtomicU32::new(0));
    let counter = ticks.clone();
    server.add_resource(
        "ticks",
        move |mut request: Box<Request>| {
            let value = counter.load(Ordering::Relaxed);
            async move {
                request.respond(Status::Content, value.to_string().into_bytes());
                request
            }
        },
        ResourceAttributes::new().observable().resource_type("counter"),
    );

    let notifier = server.notifier();
    let _ticker = ScheduledTask::every(Duration::from_secs(5), move || {
        ticks.fetch_add(1, Ordering::Relaxed);
        notifier.notify("ticks");
        async {}
    });

    server.add_endpoint(addr).await.unwrap();
    server.start();

    println!("Server up on {}", addr);
    println!("Press ctrl-c to stop...");
    tokio::signal::ctrl_c().await.unwrap();

    server.stop().await;
    println!("Server shutdown");
}
