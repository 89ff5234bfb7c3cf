use std::io::{Error, ErrorKind, Result};
use std::time::Duration;

use regex::Regex;
use url::Url;

use crate::config::COAP_DEFAULT_PORT;

mod nonblocking;
pub use nonblocking::{CoAPClient, ObserveStream};

/// Per-client request settings.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "cli", derive(structopt::StructOpt))]
pub struct RequestOptions {
    #[cfg_attr(feature = "cli", structopt(long = "non"))]
    /// Send non-confirmable requests
    pub non_confirmable: bool,

    #[cfg_attr(feature = "cli", structopt(long = "timeout-ms"))]
    /// Stop waiting for a response after this many milliseconds
    pub timeout_ms: Option<u64>,
}

impl RequestOptions {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// Splits a `coap://host[:port]/path` URL into scheme, host, port and
/// path. IPv6 hosts come back without brackets.
pub fn parse_coap_url(url: &str) -> Result<(String, String, u16, String)> {
    let url_params = Url::parse(url).map_err(|_| Error::new(ErrorKind::InvalidInput, "url error"))?;

    let scheme = url_params.scheme().to_string();

    let host = match url_params.host_str() {
        Some("") | None => return Err(Error::new(ErrorKind::InvalidInput, "host error")),
        Some(h) => h,
    };
    let host = Regex::new(r"^\[(.*?)]$")
        .map_err(|e| Error::new(ErrorKind::Other, e))?
        .replace(host, "$1")
        .to_string();

    let port = url_params.port().unwrap_or(COAP_DEFAULT_PORT);

    let path = url_params.path().to_string();

    Ok((scheme, host, port, path))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_coap_url_good_url() {
        assert!(parse_coap_url("coap://127.0.0.1").is_ok());
        assert!(parse_coap_url("coap://127.0.0.1:5683").is_ok());
        assert!(parse_coap_url("coap://[::1]").is_ok());
        assert!(parse_coap_url("coap://[::1]:5683").is_ok());
        assert!(parse_coap_url("coap://[bbbb::9329:f033:f558:7418]").is_ok());
        assert!(parse_coap_url("coap://[bbbb::9329:f033:f558:7418]:5683").is_ok());
    }

    #[test]
    fn test_parse_coap_url_parts() {
        let (scheme, host, port, path) = parse_coap_url("coap://[::1]:7000/sensors/temp").unwrap();
        assert_eq!(scheme, "coap");
        assert_eq!(host, "::1");
        assert_eq!(port, 7000);
        assert_eq!(path, "/sensors/temp");

        let (_, host, port, _) = parse_coap_url("coap://example.com").unwrap();
        assert_eq!(host, "example.com");
        assert_eq!(port, COAP_DEFAULT_PORT);
    }

    #[test]
    fn test_parse_coap_url_bad_url() {
        assert!(parse_coap_url("coap://127.0.0.1:65536").is_err());
        assert!(parse_coap_url("coap://").is_err());
        assert!(parse_coap_url("coap://:5683").is_err());
        assert!(parse_coap_url("127.0.0.1").is_err());
    }
}
