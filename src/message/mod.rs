pub mod bits;
pub mod header;
pub mod options;
pub mod packet;
pub mod request;
pub mod response;

use bytes::BytesMut;
use tokio::io;
use tokio_util::codec::{Decoder, Encoder};

pub use header::{MessageClass, MessageType, RequestType as Method, ResponseType as Status};
pub use options::{CoapOption, ContentFormat, ObserveOption};
pub use packet::{MalformedMessage, PackageError, Packet};
pub use request::CoapRequest;
pub use response::CoapResponse;

/// Datagram codec: each frame is one whole CoAP message.
#[derive(Debug, Default, Clone, Copy)]
pub struct Codec {}

impl Codec {
    pub fn new() -> Codec {
        Codec {}
    }
}

impl Decoder for Codec {
    type Item = Packet;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Packet>, io::Error> {
        if buf.is_empty() {
            return Ok(None);
        }
        let frame = buf.split_to(buf.len());
        Packet::from_bytes(&frame)
            .map(Some)
            .map_err(|cause| io::Error::new(io::ErrorKind::InvalidData, cause.to_string()))
    }
}

impl Encoder<Packet> for Codec {
    type Error = io::Error;

    fn encode(&mut self, my_packet: Packet, buf: &mut BytesMut) -> Result<(), io::Error> {
        let bytes = my_packet
            .to_bytes()
            .map_err(|cause| io::Error::new(io::ErrorKind::InvalidData, cause.to_string()))?;
        buf.extend_from_slice(&bytes);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use futures::{SinkExt, StreamExt};
    use tokio::net::UdpSocket;
    use tokio_util::udp::UdpFramed;

    #[tokio::test]
    async fn test_framed_udp_round_trip() {
        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b_addr = b.local_addr().unwrap();

        let mut sender = UdpFramed::new(a, Codec::new());
        let mut receiver = UdpFramed::new(b, Codec::new());

        let mut packet = Packet::new();
        packet.header.code = MessageClass::Request(Method::Get);
        packet.header.set_message_id(99);
        packet.add_option(CoapOption::UriPath, b"hello".to_vec());
        sender.send((packet.clone(), b_addr)).await.unwrap();

        let (received, _) = receiver.next().await.unwrap().unwrap();
        assert_eq!(received, packet);
    }

    #[test]
    fn test_decode_malformed_is_invalid_data() {
        let mut buf = BytesMut::from(&[0x40u8, 0x01][..]);
        let err = Codec::new().decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
