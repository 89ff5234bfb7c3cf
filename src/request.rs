use crate::message::{CoapOption, CoapRequest, ContentFormat, MessageType, Method, ObserveOption};

/// Builds outgoing requests for the client and for tests.
#[derive(Debug, Clone)]
pub struct RequestBuilder {
    path: String,
    method: Method,
    payload: Option<Vec<u8>>,
    queries: Vec<String>,
    domain: Option<String>,
    confirmable: bool,
    token: Option<Vec<u8>>,
    content_format: Option<ContentFormat>,
    observe: Option<ObserveOption>,
    options: Vec<(CoapOption, Vec<u8>)>,
}

impl RequestBuilder {
    pub fn new(path: &str, method: Method) -> Self {
        RequestBuilder {
            path: path.to_string(),
            method,
            payload: None,
            queries: Vec::new(),
            domain: None,
            confirmable: true,
            token: None,
            content_format: None,
            observe: None,
            options: Vec::new(),
        }
    }

    pub fn payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Adds one `key=value` Uri-Query.
    pub fn query(mut self, query: &str) -> Self {
        self.queries.push(query.to_string());
        self
    }

    /// Sets Uri-Host.
    pub fn domain(mut self, domain: &str) -> Self {
        self.domain = Some(domain.to_string());
        self
    }

    pub fn confirmable(mut self, confirmable: bool) -> Self {
        self.confirmable = confirmable;
        self
    }

    /// Fixes the token; otherwise the endpoint picks one.
    pub fn token(mut self, token: Vec<u8>) -> Self {
        self.token = Some(token);
        self
    }

    pub fn content_format(mut self, cf: ContentFormat) -> Self {
        self.content_format = Some(cf);
        self
    }

    pub fn observe(mut self, flag: ObserveOption) -> Self {
        self.observe = Some(flag);
        self
    }

    pub fn option(mut self, option: CoapOption, value: Vec<u8>) -> Self {
        self.options.push((option, value));
        self
    }

    pub fn build(self) -> CoapRequest {
        let mut request = CoapRequest::new();
        request.set_method(self.method);
        request.set_path(&self.path);
        request.set_type(if self.confirmable {
            MessageType::Confirmable
        } else {
            MessageType::NonConfirmable
        });
        if let Some(domain) = self.domain {
            request
                .message
                .add_option(CoapOption::UriHost, domain.into_bytes());
        }
        for query in &self.queries {
            request.add_query(query);
        }
        if let Some(cf) = self.content_format {
            request.message.set_content_format(cf);
        }
        if let Some(flag) = self.observe {
            request.set_observe_flag(flag);
        }
        for (option, value) in self.options {
            request.message.add_option(option, value);
        }
        if let Some(token) = self.token {
            request.message.set_token(token);
        }
        if let Some(payload) = self.payload {
            request.message.payload = payload;
        }
        request
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_request_has_payload() {
        let request = RequestBuilder::new("/", Method::Put)
            .payload(b"hello, world!".to_vec())
            .build();
        assert_eq!(request.message.payload.as_slice(), b"hello, world!");
        assert_eq!(request.get_method(), Some(Method::Put));
    }

    #[test]
    fn test_path_queries_and_domain() {
        let request = RequestBuilder::new("/sensors/temp/", Method::Get)
            .query("unit=c")
            .query("precision=1")
            .domain("example.com")
            .build();
        assert_eq!(request.get_path_as_vec(), vec!["sensors", "temp"]);
        assert_eq!(request.get_query_as_vec(), vec!["unit=c", "precision=1"]);
        assert_eq!(
            request.message.get_first_option(CoapOption::UriHost).unwrap(),
            b"example.com"
        );
    }

    #[test]
    fn test_extra_options_and_observe() {
        let request = RequestBuilder::new("temp", Method::Get)
            .option(CoapOption::ProxyUri, b"coap://foo.com".to_vec())
            .content_format(ContentFormat::ApplicationJSON)
            .observe(ObserveOption::Register)
            .build();
        assert_eq!(
            request.message.get_first_option(CoapOption::ProxyUri).unwrap(),
            b"coap://foo.com"
        );
        assert_eq!(
            request.message.get_content_format(),
            Some(ContentFormat::ApplicationJSON)
        );
        assert_eq!(request.get_observe_flag(), Some(ObserveOption::Register));
    }

    #[test]
    fn test_token_and_type() {
        let request = RequestBuilder::new("/", Method::Put)
            .token(b"token".to_vec())
            .confirmable(false)
            .build();
        assert_eq!(request.message.get_token(), b"token");
        assert_eq!(request.message.header.get_type(), MessageType::NonConfirmable);

        let request = RequestBuilder::new("/", Method::Delete).build();
        assert_eq!(request.message.header.get_type(), MessageType::Confirmable);
        assert!(request.message.get_token().is_empty());
    }
}
