use std::collections::{BTreeMap, LinkedList};
use std::fmt;

use super::bits::{BitReader, BitWriter};
use super::header::{self, Header, MessageClass, MessageType, COAP_VERSION};
use super::options::{self, CoapOption, ContentFormat};

pub const PAYLOAD_MARKER: u8 = 0xFF;
pub const MAX_TOKEN_LENGTH: usize = 8;

const MAX_OPTION_LENGTH: usize = 0xFFFF + 269;

/// Reasons a datagram is not a well-formed CoAP message. Any of them causes
/// the whole datagram to be dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MalformedMessage {
    Truncated,
    UnsupportedVersion(u8),
    InvalidTokenLength(u8),
    ReservedOptionNibble,
    InvalidOptionNumber,
    EmptyPayload,
    InvalidEmptyMessage,
}

impl fmt::Display for MalformedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MalformedMessage::Truncated => write!(f, "message truncated"),
            MalformedMessage::UnsupportedVersion(v) => write!(f, "unsupported version {}", v),
            MalformedMessage::InvalidTokenLength(l) => write!(f, "invalid token length {}", l),
            MalformedMessage::ReservedOptionNibble => write!(f, "reserved option nibble 15"),
            MalformedMessage::InvalidOptionNumber => write!(f, "option number out of range"),
            MalformedMessage::EmptyPayload => write!(f, "payload marker without payload"),
            MalformedMessage::InvalidEmptyMessage => write!(f, "empty message with content"),
        }
    }
}

impl std::error::Error for MalformedMessage {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageError {
    InvalidTokenLength(usize),
    OptionValueTooLong(u16),
}

impl fmt::Display for PackageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PackageError::InvalidTokenLength(l) => write!(f, "token of {} bytes exceeds 8", l),
            PackageError::OptionValueTooLong(n) => write!(f, "value of option {} too long", n),
        }
    }
}

impl std::error::Error for PackageError {}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Packet {
    pub header: Header,
    token: Vec<u8>,
    options: BTreeMap<u16, LinkedList<Vec<u8>>>,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn new() -> Packet {
        Packet::default()
    }

    /// An empty message (code 0.00) such as an ACK, RST or ping.
    pub fn empty(message_type: MessageType, message_id: u16) -> Packet {
        let mut packet = Packet::new();
        packet.header.set_type(message_type);
        packet.header.set_message_id(message_id);
        packet
    }

    pub fn set_token(&mut self, token: Vec<u8>) {
        self.token = token;
    }

    pub fn get_token(&self) -> &[u8] {
        &self.token
    }

    pub fn set_option(&mut self, tp: CoapOption, value: LinkedList<Vec<u8>>) {
        self.options.insert(tp.number(), value);
    }

    pub fn add_option(&mut self, tp: CoapOption, value: Vec<u8>) {
        self.options
            .entry(tp.number())
            .or_insert_with(LinkedList::new)
            .push_back(value);
    }

    pub fn get_option(&self, tp: CoapOption) -> Option<&LinkedList<Vec<u8>>> {
        self.options.get(&tp.number())
    }

    pub fn get_first_option(&self, tp: CoapOption) -> Option<&Vec<u8>> {
        self.get_option(tp).and_then(|list| list.front())
    }

    pub fn clear_option(&mut self, tp: CoapOption) {
        self.options.remove(&tp.number());
    }

    /// Iterates the options in ascending option-number order.
    pub fn options(&self) -> impl Iterator<Item = (CoapOption, &LinkedList<Vec<u8>>)> {
        self.options
            .iter()
            .map(|(number, values)| (CoapOption::from(*number), values))
    }

    pub fn set_uint_option(&mut self, tp: CoapOption, value: u32) {
        self.clear_option(tp);
        self.add_option(tp, options::encode_uint(value));
    }

    pub fn get_uint_option(&self, tp: CoapOption) -> Option<u32> {
        self.get_first_option(tp)
            .and_then(|value| options::decode_uint(value))
    }

    pub fn set_content_format(&mut self, cf: ContentFormat) {
        self.set_uint_option(CoapOption::ContentFormat, cf as u32);
    }

    pub fn get_content_format(&self) -> Option<ContentFormat> {
        self.get_uint_option(CoapOption::ContentFormat)
            .and_then(|number| u16::try_from(number).ok())
            .and_then(ContentFormat::from_u16)
    }

    pub fn set_observe_value(&mut self, value: u32) {
        self.set_uint_option(CoapOption::Observe, value & 0x00FF_FFFF);
    }

    pub fn get_observe_value(&self) -> Option<u32> {
        self.get_uint_option(CoapOption::Observe)
    }

    /// Freshness lifetime in seconds; absent means the RFC 7252 default
    /// of 60.
    pub fn set_max_age(&mut self, seconds: u32) {
        self.set_uint_option(CoapOption::MaxAge, seconds);
    }

    pub fn get_max_age(&self) -> Option<u32> {
        self.get_uint_option(CoapOption::MaxAge)
    }

    pub fn set_payload(&mut self, payload: Vec<u8>) {
        self.payload = payload;
    }

    /// The first critical option this implementation does not recognize.
    pub fn unknown_critical_option(&self) -> Option<CoapOption> {
        self.options
            .keys()
            .map(|number| CoapOption::from(*number))
            .find(|option| !option.is_known() && option.is_critical())
    }

    /// Decodes a byte slice and construct the equivalent Packet.
    pub fn from_bytes(buf: &[u8]) -> Result<Packet, MalformedMessage> {
        let mut reader = BitReader::new(buf);

        let version = reader.read_bits(2)? as u8;
        if version != COAP_VERSION {
            return Err(MalformedMessage::UnsupportedVersion(version));
        }
        let message_type = MessageType::from_bits(reader.read_bits(2)? as u8);
        let token_length = reader.read_bits(4)? as u8;
        if token_length as usize > MAX_TOKEN_LENGTH {
            return Err(MalformedMessage::InvalidTokenLength(token_length));
        }
        let code = reader.read_bits(8)? as u8;
        let message_id = reader.read_bits(16)? as u16;

        let mut header = Header::new();
        header.set_version(version);
        header.set_type(message_type);
        header.code = header::code_to_class(&code);
        header.set_message_id(message_id);

        if header.code == MessageClass::Empty && (token_length > 0 || reader.has_remaining()) {
            return Err(MalformedMessage::InvalidEmptyMessage);
        }

        let token = reader.read_bytes(token_length as usize)?;

        let mut options: BTreeMap<u16, LinkedList<Vec<u8>>> = BTreeMap::new();
        let mut number: u32 = 0;
        let mut payload = Vec::new();
        while reader.has_remaining() {
            let byte = reader.read_byte()?;
            if byte == PAYLOAD_MARKER {
                payload = reader.read_remaining();
                if payload.is_empty() {
                    return Err(MalformedMessage::EmptyPayload);
                }
                break;
            }

            let delta = Self::read_extended(&mut reader, byte >> 4)?;
            let length = Self::read_extended(&mut reader, byte & 0x0F)?;

            number += delta;
            let option_number =
                u16::try_from(number).map_err(|_| MalformedMessage::InvalidOptionNumber)?;
            let value = reader.read_bytes(length as usize)?;
            options
                .entry(option_number)
                .or_insert_with(LinkedList::new)
                .push_back(value);
        }

        Ok(Packet {
            header,
            token,
            options,
            payload,
        })
    }

    /// Returns a vector of bytes representing the Packet.
    pub fn to_bytes(&self) -> Result<Vec<u8>, PackageError> {
        if self.token.len() > MAX_TOKEN_LENGTH {
            return Err(PackageError::InvalidTokenLength(self.token.len()));
        }

        let mut writer = BitWriter::with_capacity(4 + self.token.len() + self.payload.len() + 16);
        writer.write_bits(self.header.get_version() as u32, 2);
        writer.write_bits(self.header.get_type().to_bits() as u32, 2);
        writer.write_bits(self.token.len() as u32, 4);
        writer.write_bits(header::class_to_code(&self.header.code) as u32, 8);
        writer.write_bits(self.header.get_message_id() as u32, 16);
        writer.write_bytes(&self.token);

        let mut last_number = 0u16;
        for (number, values) in self.options.iter() {
            for value in values.iter() {
                if value.len() > MAX_OPTION_LENGTH {
                    return Err(PackageError::OptionValueTooLong(*number));
                }

                let (delta_nibble, delta_ext) = Self::split_extended((number - last_number) as u32);
                let (length_nibble, length_ext) = Self::split_extended(value.len() as u32);
                writer.write_bits(delta_nibble, 4);
                writer.write_bits(length_nibble, 4);
                Self::write_extended(&mut writer, delta_nibble, delta_ext);
                Self::write_extended(&mut writer, length_nibble, length_ext);
                writer.write_bytes(value);

                last_number = *number;
            }
        }

        if !self.payload.is_empty() {
            writer.write_byte(PAYLOAD_MARKER);
            writer.write_bytes(&self.payload);
        }

        Ok(writer.into_bytes())
    }

    fn read_extended(reader: &mut BitReader, nibble: u8) -> Result<u32, MalformedMessage> {
        match nibble {
            13 => Ok(reader.read_byte()? as u32 + 13),
            14 => Ok(reader.read_bits(16)? + 269),
            15 => Err(MalformedMessage::ReservedOptionNibble),
            n => Ok(n as u32),
        }
    }

    fn split_extended(value: u32) -> (u32, u32) {
        if value <= 12 {
            (value, 0)
        } else if value < 269 {
            (13, value - 13)
        } else {
            (14, value - 269)
        }
    }

    fn write_extended(writer: &mut BitWriter, nibble: u32, ext: u32) {
        match nibble {
            13 => writer.write_bits(ext, 8),
            14 => writer.write_bits(ext, 16),
            _ => {}
        }
    }
}

#[cfg(test)]
mod test {
    use super::super::header::{RequestType, ResponseType};
    use super::*;
    use quickcheck::{QuickCheck, TestResult};
    use std::collections::LinkedList;

    #[test]
    fn test_decode_packet_with_options() {
        let buf = [
            0x44, 0x01, 0x84, 0x9e, 0x51, 0x55, 0x77, 0xe8, 0xb2, 0x48, 0x69, 0x04, 0x54, 0x65,
            0x73, 0x74, 0x43, 0x61, 0x3d, 0x31,
        ];
        let packet = Packet::from_bytes(&buf).unwrap();
        assert_eq!(packet.header.get_version(), 1);
        assert_eq!(packet.header.get_type(), MessageType::Confirmable);
        assert_eq!(packet.header.code, MessageClass::Request(RequestType::Get));
        assert_eq!(packet.header.get_message_id(), 33950);
        assert_eq!(packet.get_token(), &[0x51, 0x55, 0x77, 0xE8]);
        assert_eq!(packet.options().count(), 2);

        let mut expected_uri_path = LinkedList::new();
        expected_uri_path.push_back("Hi".as_bytes().to_vec());
        expected_uri_path.push_back("Test".as_bytes().to_vec());
        assert_eq!(*packet.get_option(CoapOption::UriPath).unwrap(), expected_uri_path);

        let mut expected_uri_query = LinkedList::new();
        expected_uri_query.push_back("a=1".as_bytes().to_vec());
        assert_eq!(*packet.get_option(CoapOption::UriQuery).unwrap(), expected_uri_query);
    }

    #[test]
    fn test_decode_packet_with_payload() {
        let buf = [
            0x64, 0x45, 0x13, 0xFD, 0xD0, 0xE2, 0x4D, 0xAC, 0xFF, 0x48, 0x65, 0x6C, 0x6C, 0x6F,
        ];
        let packet = Packet::from_bytes(&buf).unwrap();
        assert_eq!(packet.header.get_type(), MessageType::Acknowledgement);
        assert_eq!(
            packet.header.code,
            MessageClass::Response(ResponseType::Content)
        );
        assert_eq!(packet.header.get_message_id(), 5117);
        assert_eq!(packet.get_token(), &[0xD0, 0xE2, 0x4D, 0xAC]);
        assert_eq!(packet.payload, "Hello".as_bytes().to_vec());
    }

    #[test]
    fn test_encode_packet_with_options() {
        let mut packet = Packet::new();
        packet.header.set_type(MessageType::Confirmable);
        packet.header.code = MessageClass::Request(RequestType::Get);
        packet.header.set_message_id(33950);
        packet.set_token(vec![0x51, 0x55, 0x77, 0xE8]);
        packet.add_option(CoapOption::UriPath, b"Hi".to_vec());
        packet.add_option(CoapOption::UriPath, b"Test".to_vec());
        packet.add_option(CoapOption::UriQuery, b"a=1".to_vec());
        assert_eq!(
            packet.to_bytes().unwrap(),
            vec![
                0x44, 0x01, 0x84, 0x9e, 0x51, 0x55, 0x77, 0xe8, 0xb2, 0x48, 0x69, 0x04, 0x54,
                0x65, 0x73, 0x74, 0x43, 0x61, 0x3d, 0x31
            ]
        );
    }

    #[test]
    fn test_encode_packet_with_payload() {
        let mut packet = Packet::new();
        packet.header.set_type(MessageType::Acknowledgement);
        packet.header.code = MessageClass::Response(ResponseType::Content);
        packet.header.set_message_id(5117);
        packet.set_token(vec![0xD0, 0xE2, 0x4D, 0xAC]);
        packet.payload = "Hello".as_bytes().to_vec();
        assert_eq!(
            packet.to_bytes().unwrap(),
            vec![0x64, 0x45, 0x13, 0xFD, 0xD0, 0xE2, 0x4D, 0xAC, 0xFF, 0x48, 0x65, 0x6C, 0x6C, 0x6F]
        );
    }

    #[test]
    fn test_encode_extended_deltas() {
        let mut packet = Packet::new();
        packet.header.code = MessageClass::Request(RequestType::Get);
        packet.header.set_message_id(1);
        packet.add_option(CoapOption::ProxyUri, b"a".to_vec());
        assert_eq!(
            packet.to_bytes().unwrap(),
            vec![0x40, 0x01, 0x00, 0x01, 0xD1, 0x16, 0x61]
        );

        let mut packet = Packet::new();
        packet.header.code = MessageClass::Request(RequestType::Get);
        packet.header.set_message_id(1);
        packet.add_option(CoapOption::Unknown(300), vec![0x01]);
        let bytes = packet.to_bytes().unwrap();
        assert_eq!(bytes, vec![0x40, 0x01, 0x00, 0x01, 0xE1, 0x00, 0x1F, 0x01]);
        assert_eq!(Packet::from_bytes(&bytes).unwrap(), packet);
    }

    #[test]
    fn test_long_option_value_round_trip() {
        let mut packet = Packet::new();
        packet.header.code = MessageClass::Request(RequestType::Post);
        packet.add_option(CoapOption::ProxyUri, vec![b'x'; 300]);
        packet.add_option(CoapOption::Size1, vec![0x01, 0x00]);
        packet.payload = vec![7; 20];
        let decoded = Packet::from_bytes(&packet.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_round_trip_keeps_everything() {
        let mut packet = Packet::new();
        packet.header.set_type(MessageType::NonConfirmable);
        packet.header.code = MessageClass::Response(ResponseType::Changed);
        packet.header.set_message_id(0xBEEF);
        packet.set_token(vec![1, 2, 3, 4, 5, 6, 7, 8]);
        packet.add_option(CoapOption::ETag, vec![0xAA]);
        packet.add_option(CoapOption::ETag, vec![0xBB]);
        packet.set_observe_value(12);
        packet.set_content_format(ContentFormat::ApplicationJSON);
        packet.add_option(CoapOption::LocationPath, b"a".to_vec());
        packet.payload = b"{}".to_vec();

        let decoded = Packet::from_bytes(&packet.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded.header, packet.header);
        assert_eq!(decoded.get_token(), packet.get_token());
        assert_eq!(decoded.get_observe_value(), Some(12));
        assert_eq!(
            decoded.get_content_format(),
            Some(ContentFormat::ApplicationJSON)
        );
        assert_eq!(decoded.get_option(CoapOption::ETag).unwrap().len(), 2);
        assert_eq!(decoded.payload, packet.payload);
    }

    #[test]
    fn test_empty_ack() {
        let packet = Packet::empty(MessageType::Acknowledgement, 0x1234);
        let bytes = packet.to_bytes().unwrap();
        assert_eq!(bytes, vec![0x60, 0x00, 0x12, 0x34]);
        assert_eq!(Packet::from_bytes(&bytes).unwrap(), packet);
    }

    #[test]
    fn test_reject_malformed() {
        let mut long_token = vec![0x49, 0x01, 0x00, 0x01];
        long_token.extend_from_slice(&[0; 9]);
        assert_eq!(
            Packet::from_bytes(&long_token),
            Err(MalformedMessage::InvalidTokenLength(9))
        );
        assert_eq!(
            Packet::from_bytes(&[0x40, 0x01]),
            Err(MalformedMessage::Truncated)
        );
        assert_eq!(
            Packet::from_bytes(&[0x44, 0x01, 0x00, 0x01, 0x01]),
            Err(MalformedMessage::Truncated)
        );
        assert_eq!(
            Packet::from_bytes(&[0x40, 0x01, 0x00, 0x01, 0xF1, 0x00]),
            Err(MalformedMessage::ReservedOptionNibble)
        );
        assert_eq!(
            Packet::from_bytes(&[0x40, 0x01, 0x00, 0x01, 0x1F]),
            Err(MalformedMessage::ReservedOptionNibble)
        );
        assert_eq!(
            Packet::from_bytes(&[0x40, 0x01, 0x00, 0x01, 0x14, 0x61]),
            Err(MalformedMessage::Truncated)
        );
        assert_eq!(
            Packet::from_bytes(&[0x40, 0x01, 0x00, 0x01, 0xFF]),
            Err(MalformedMessage::EmptyPayload)
        );
        assert_eq!(
            Packet::from_bytes(&[0x40, 0x01, 0x00, 0x01, 0xE0, 0xFF, 0xFF]),
            Err(MalformedMessage::InvalidOptionNumber)
        );
        assert_eq!(
            Packet::from_bytes(&[0x80, 0x01, 0x00, 0x01]),
            Err(MalformedMessage::UnsupportedVersion(2))
        );
        assert_eq!(
            Packet::from_bytes(&[0x60, 0x00, 0x00, 0x01, 0xFF, 0x01]),
            Err(MalformedMessage::InvalidEmptyMessage)
        );
    }

    #[test]
    fn test_reject_long_token_on_encode() {
        let mut packet = Packet::new();
        packet.set_token(vec![0; 9]);
        assert_eq!(packet.to_bytes(), Err(PackageError::InvalidTokenLength(9)));
    }

    #[test]
    fn test_unknown_critical_option() {
        let mut packet = Packet::new();
        packet.add_option(CoapOption::Unknown(2000), vec![]);
        assert_eq!(packet.unknown_critical_option(), None);
        packet.add_option(CoapOption::Unknown(2001), vec![]);
        assert_eq!(
            packet.unknown_critical_option(),
            Some(CoapOption::Unknown(2001))
        );
    }

    #[test]
    fn test_encode_decode_content_format() {
        let mut packet = Packet::new();
        packet.set_content_format(ContentFormat::ApplicationJSON);
        assert_eq!(
            ContentFormat::ApplicationJSON,
            packet.get_content_format().unwrap()
        )
    }

    #[test]
    fn test_max_age_is_minimal_uint() {
        let mut packet = Packet::new();
        assert_eq!(packet.get_max_age(), None);
        packet.set_max_age(300);
        assert_eq!(
            packet.get_first_option(CoapOption::MaxAge),
            Some(&vec![0x01, 0x2C])
        );
        let decoded = Packet::from_bytes(&packet.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded.get_max_age(), Some(300));
    }

    #[test]
    fn test_decode_empty_content_format() {
        let packet = Packet::new();
        assert!(packet.get_content_format().is_none());
    }

    #[test]
    fn test_malicious_packet() {
        fn run(x: Vec<u8>) -> TestResult {
            match Packet::from_bytes(&x[..]) {
                Ok(packet) => {
                    let reencoded = match packet.to_bytes() {
                        Ok(bytes) => bytes,
                        Err(_) => return TestResult::failed(),
                    };
                    TestResult::from_bool(
                        packet.get_token().len() == (x[0] & 0x0F) as usize
                            && Packet::from_bytes(&reencoded).as_ref() == Ok(&packet),
                    )
                }
                Err(_) => TestResult::passed(),
            }
        }
        QuickCheck::new()
            .tests(10000)
            .quickcheck(run as fn(Vec<u8>) -> TestResult)
    }

    #[test]
    fn test_round_trip_preserves_message() {
        fn run(
            kind: u8,
            code: u8,
            message_id: u16,
            token: Vec<u8>,
            options: Vec<(u16, Vec<u8>)>,
            payload: Vec<u8>,
        ) -> bool {
            let mut packet = Packet::new();
            packet.header.set_type(MessageType::from_bits(kind & 0x03));
            // 0.00 must not carry a token, options or payload
            packet.header.code = header::code_to_class(&code.max(1));
            packet.header.set_message_id(message_id);
            packet.set_token(token.into_iter().take(MAX_TOKEN_LENGTH).collect());
            for (number, value) in options {
                packet.add_option(CoapOption::from(number), value);
            }
            packet.payload = payload;

            match packet.to_bytes() {
                Ok(bytes) => Packet::from_bytes(&bytes) == Ok(packet),
                Err(_) => false,
            }
        }
        QuickCheck::new().tests(2000).quickcheck(
            run as fn(u8, u8, u16, Vec<u8>, Vec<(u16, Vec<u8>)>, Vec<u8>) -> bool,
        )
    }
}
