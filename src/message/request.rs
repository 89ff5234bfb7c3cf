use std::net::SocketAddr;
use std::str;

use super::header::{MessageClass, MessageType, RequestType as Method};
use super::options::{CoapOption, ObserveOption};
use super::packet::Packet;
use super::response::CoapResponse;

#[derive(Debug, Clone, Default)]
pub struct CoapRequest {
    pub message: Packet,
    pub response: Option<CoapResponse>,
    pub source: Option<SocketAddr>,
}

impl CoapRequest {
    pub fn new() -> CoapRequest {
        CoapRequest::default()
    }

    pub fn from_packet(packet: Packet, source: &SocketAddr) -> CoapRequest {
        CoapRequest {
            response: CoapResponse::new(&packet),
            message: packet,
            source: Some(*source),
        }
    }

    pub fn set_method(&mut self, method: Method) {
        self.message.header.code = MessageClass::Request(method);
    }

    pub fn get_method(&self) -> Option<Method> {
        match self.message.header.code {
            MessageClass::Request(method) => Some(method),
            _ => None,
        }
    }

    pub fn set_type(&mut self, message_type: MessageType) {
        self.message.header.set_type(message_type);
    }

    pub fn set_path(&mut self, path: &str) {
        self.message.clear_option(CoapOption::UriPath);

        for segment in path.split('/').filter(|s| !s.is_empty()) {
            self.message
                .add_option(CoapOption::UriPath, segment.as_bytes().to_vec());
        }
    }

    pub fn get_path_as_vec(&self) -> Vec<String> {
        Self::strings(self.message.get_option(CoapOption::UriPath))
    }

    pub fn get_path(&self) -> String {
        self.get_path_as_vec().join("/")
    }

    pub fn add_query(&mut self, query: &str) {
        self.message
            .add_option(CoapOption::UriQuery, query.as_bytes().to_vec());
    }

    pub fn get_query_as_vec(&self) -> Vec<String> {
        Self::strings(self.message.get_option(CoapOption::UriQuery))
    }

    pub fn set_observe_flag(&mut self, flag: ObserveOption) {
        self.message.set_uint_option(CoapOption::Observe, flag as u32);
    }

    pub fn get_observe_flag(&self) -> Option<ObserveOption> {
        self.message
            .get_observe_value()
            .and_then(ObserveOption::from_u32)
    }

    fn strings<'a, I>(values: Option<I>) -> Vec<String>
    where
        I: IntoIterator<Item = &'a Vec<u8>>,
    {
        values
            .map(|values| {
                values
                    .into_iter()
                    .filter_map(|v| str::from_utf8(v).ok())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default()
    }
}
