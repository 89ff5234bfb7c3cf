use std::process;
use std::time::Duration;

use futures::StreamExt;
use log::{error, info, warn};
use simplelog::{LevelFilter, SimpleLogger, TermLogger, TerminalMode};
use structopt::StructOpt;

use coap_exchange::client::{parse_coap_url, CoAPClient, RequestOptions};
use coap_exchange::{CoapResponse, Method};

/// A small client for CoAP services
#[derive(Debug, StructOpt)]
#[structopt(name = "coap-client")]
pub struct Options {
    #[structopt(short = "l", long = "loop")]
    /// Repeat the request until interrupted
    pub repeat: bool,

    #[structopt(short = "e", long = "event")]
    /// Observe the resource and print every notification
    pub observe: bool,

    #[structopt(long = "log-level", default_value = "info")]
    /// Configure app logging levels (warn, info, debug, trace)
    pub log_level: LevelFilter,

    #[structopt(flatten)]
    pub request_opts: RequestOptions,

    /// GET, POST, PUT or DELETE
    pub method: String,

    /// Target, e.g. coap://localhost/hello
    pub uri: String,

    /// Request payload
    pub payload: Option<String>,
}

#[derive(Debug)]
enum Failure {
    Usage(String),
    Request(std::io::Error),
}

fn parse_method(method: &str) -> Option<Method> {
    match method.to_ascii_uppercase().as_str() {
        "GET" => Some(Method::Get),
        "POST" => Some(Method::Post),
        "PUT" => Some(Method::Put),
        "DELETE" => Some(Method::Delete),
        _ => None,
    }
}

fn print_response(response: &CoapResponse) {
    info!(
        "{:?} {:?} ({} bytes)",
        response.message.header.code,
        response.message.get_content_format(),
        response.message.payload.len()
    );
    println!("{}", String::from_utf8_lossy(&response.message.payload));
}

async fn run(opts: Options) -> Result<(), Failure> {
    let method = parse_method(&opts.method)
        .ok_or_else(|| Failure::Usage(format!("unknown method {}", opts.method)))?;
    let (scheme, host, port, path) =
        parse_coap_url(&opts.uri).map_err(|e| Failure::Usage(format!("{}: {}", opts.uri, e)))?;
    if scheme != "coap" {
        return Err(Failure::Usage(format!("unsupported scheme {}", scheme)));
    }
    if opts.observe && method != Method::Get {
        return Err(Failure::Usage("only GET can observe".to_string()));
    }

    info!("connecting to {}:{}", host, port);
    let mut client = CoAPClient::new_udp((host.as_str(), port))
        .await
        .map_err(Failure::Request)?;
    client.set_options(opts.request_opts.clone());

    if opts.observe {
        let mut notifications = client.observe(&path).await.map_err(Failure::Request)?;
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                next = notifications.next() => match next {
                    Some(response) => print_response(&response),
                    None => {
                        warn!("observation ended by server");
                        break;
                    }
                },
            }
        }
        return Ok(());
    }

    let payload = opts.payload.clone().unwrap_or_default().into_bytes();
    loop {
        let response = match method {
            Method::Get => client.get(&path).await,
            Method::Post => client.post(&path, payload.clone()).await,
            Method::Put => client.put(&path, payload.clone()).await,
            Method::Delete => client.delete(&path).await,
        };
        match response {
            Ok(response) => print_response(&response),
            Err(e) if opts.repeat => error!("request failed: {}", e),
            Err(e) => return Err(Failure::Request(e)),
        }
        if !opts.repeat {
            return Ok(());
        }
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(()),
            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
        }
    }
}

#[tokio::main]
async fn main() {
    let opts = Options::from_args();

    let log_config = simplelog::ConfigBuilder::new().build();
    let term = TermLogger::init(
        opts.log_level,
        log_config.clone(),
        TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    );
    if term.is_err() {
        let _ = SimpleLogger::init(opts.log_level, log_config);
    }

    match run(opts).await {
        Ok(()) => {}
        Err(Failure::Usage(message)) => {
            error!("{}", message);
            process::exit(1);
        }
        Err(Failure::Request(e)) => {
            error!("request failed: {}", e);
            process::exit(2);
        }
    }
}
