use std::fmt;

pub const COAP_VERSION: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    version: u8,
    message_type: MessageType,
    pub code: MessageClass,
    message_id: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageClass {
    Empty,
    Request(RequestType),
    Response(ResponseType),
    Reserved(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RequestType {
    Get,
    Post,
    Put,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseType {
    // 200 Codes
    Created,
    Deleted,
    Valid,
    Changed,
    Content,
    Continue,

    // 400 Codes
    BadRequest,
    Unauthorized,
    BadOption,
    Forbidden,
    NotFound,
    MethodNotAllowed,
    NotAcceptable,
    RequestEntityIncomplete,
    PreconditionFailed,
    RequestEntityTooLarge,
    UnsupportedContentFormat,
    TooManyRequests,

    // 500 Codes
    InternalServerError,
    NotImplemented,
    BadGateway,
    ServiceUnavailable,
    GatewayTimeout,
    ProxyingNotSupported,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Confirmable,
    NonConfirmable,
    Acknowledgement,
    Reset,
}

impl MessageType {
    pub fn from_bits(bits: u8) -> MessageType {
        match bits & 0x3 {
            0 => MessageType::Confirmable,
            1 => MessageType::NonConfirmable,
            2 => MessageType::Acknowledgement,
            _ => MessageType::Reset,
        }
    }

    pub fn to_bits(self) -> u8 {
        match self {
            MessageType::Confirmable => 0,
            MessageType::NonConfirmable => 1,
            MessageType::Acknowledgement => 2,
            MessageType::Reset => 3,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageType::Confirmable => "CON",
            MessageType::NonConfirmable => "NON",
            MessageType::Acknowledgement => "ACK",
            MessageType::Reset => "RST",
        };
        f.write_str(name)
    }
}

impl Default for Header {
    fn default() -> Header {
        Header {
            version: COAP_VERSION,
            message_type: MessageType::Confirmable,
            code: MessageClass::Empty,
            message_id: 0,
        }
    }
}

impl Header {
    pub fn new() -> Header {
        Header::default()
    }

    #[inline]
    pub fn set_version(&mut self, v: u8) {
        self.version = v & 0x3;
    }

    #[inline]
    pub fn get_version(&self) -> u8 {
        self.version
    }

    #[inline]
    pub fn set_type(&mut self, t: MessageType) {
        self.message_type = t;
    }

    #[inline]
    pub fn get_type(&self) -> MessageType {
        self.message_type
    }

    /// Sets the code from its `c.dd` form, e.g. `"2.05"`.
    pub fn set_code(&mut self, code: &str) -> Result<(), InvalidCode> {
        self.code = MessageClass::from(str_to_code(code)?);
        Ok(())
    }

    pub fn get_code(&self) -> String {
        class_to_str(&self.code)
    }

    #[inline]
    pub fn set_message_id(&mut self, message_id: u16) {
        self.message_id = message_id;
    }

    #[inline]
    pub fn get_message_id(&self) -> u16 {
        self.message_id
    }

    pub fn is_request(&self) -> bool {
        matches!(self.code, MessageClass::Request(_))
            || matches!(self.code, MessageClass::Reserved(c) if c >> 5 == 0)
    }

    pub fn is_response(&self) -> bool {
        matches!(self.code, MessageClass::Response(_))
            || matches!(self.code, MessageClass::Reserved(c) if (2..=5).contains(&(c >> 5)))
    }

    pub fn is_empty(&self) -> bool {
        self.code == MessageClass::Empty
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidCode(pub String);

impl fmt::Display for InvalidCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid message code {:?}", self.0)
    }
}

impl std::error::Error for InvalidCode {}

impl From<MessageClass> for u8 {
    fn from(class: MessageClass) -> u8 {
        class_to_code(&class)
    }
}

impl From<u8> for MessageClass {
    fn from(code: u8) -> MessageClass {
        code_to_class(&code)
    }
}

impl ResponseType {
    /// Whether the status belongs to the 2.xx success class.
    pub fn is_success(&self) -> bool {
        class_to_code(&MessageClass::Response(*self)) >> 5 == 2
    }
}

pub fn class_to_code(class: &MessageClass) -> u8 {
    match *class {
        MessageClass::Empty => 0x00,

        MessageClass::Request(RequestType::Get) => 0x01,
        MessageClass::Request(RequestType::Post) => 0x02,
        MessageClass::Request(RequestType::Put) => 0x03,
        MessageClass::Request(RequestType::Delete) => 0x04,

        MessageClass::Response(ResponseType::Created) => 0x41,
        MessageClass::Response(ResponseType::Deleted) => 0x42,
        MessageClass::Response(ResponseType::Valid) => 0x43,
        MessageClass::Response(ResponseType::Changed) => 0x44,
        MessageClass::Response(ResponseType::Content) => 0x45,
        MessageClass::Response(ResponseType::Continue) => 0x5F,

        MessageClass::Response(ResponseType::BadRequest) => 0x80,
        MessageClass::Response(ResponseType::Unauthorized) => 0x81,
        MessageClass::Response(ResponseType::BadOption) => 0x82,
        MessageClass::Response(ResponseType::Forbidden) => 0x83,
        MessageClass::Response(ResponseType::NotFound) => 0x84,
        MessageClass::Response(ResponseType::MethodNotAllowed) => 0x85,
        MessageClass::Response(ResponseType::NotAcceptable) => 0x86,
        MessageClass::Response(ResponseType::RequestEntityIncomplete) => 0x88,
        MessageClass::Response(ResponseType::PreconditionFailed) => 0x8C,
        MessageClass::Response(ResponseType::RequestEntityTooLarge) => 0x8D,
        MessageClass::Response(ResponseType::UnsupportedContentFormat) => 0x8F,
        MessageClass::Response(ResponseType::TooManyRequests) => 0x9D,

        MessageClass::Response(ResponseType::InternalServerError) => 0xA0,
        MessageClass::Response(ResponseType::NotImplemented) => 0xA1,
        MessageClass::Response(ResponseType::BadGateway) => 0xA2,
        MessageClass::Response(ResponseType::ServiceUnavailable) => 0xA3,
        MessageClass::Response(ResponseType::GatewayTimeout) => 0xA4,
        MessageClass::Response(ResponseType::ProxyingNotSupported) => 0xA5,

        MessageClass::Reserved(code) => code,
    }
}

pub fn code_to_class(code: &u8) -> MessageClass {
    match *code {
        0x00 => MessageClass::Empty,

        0x01 => MessageClass::Request(RequestType::Get),
        0x02 => MessageClass::Request(RequestType::Post),
        0x03 => MessageClass::Request(RequestType::Put),
        0x04 => MessageClass::Request(RequestType::Delete),

        0x41 => MessageClass::Response(ResponseType::Created),
        0x42 => MessageClass::Response(ResponseType::Deleted),
        0x43 => MessageClass::Response(ResponseType::Valid),
        0x44 => MessageClass::Response(ResponseType::Changed),
        0x45 => MessageClass::Response(ResponseType::Content),
        0x5F => MessageClass::Response(ResponseType::Continue),

        0x80 => MessageClass::Response(ResponseType::BadRequest),
        0x81 => MessageClass::Response(ResponseType::Unauthorized),
        0x82 => MessageClass::Response(ResponseType::BadOption),
        0x83 => MessageClass::Response(ResponseType::Forbidden),
        0x84 => MessageClass::Response(ResponseType::NotFound),
        0x85 => MessageClass::Response(ResponseType::MethodNotAllowed),
        0x86 => MessageClass::Response(ResponseType::NotAcceptable),
        0x88 => MessageClass::Response(ResponseType::RequestEntityIncomplete),
        0x8C => MessageClass::Response(ResponseType::PreconditionFailed),
        0x8D => MessageClass::Response(ResponseType::RequestEntityTooLarge),
        0x8F => MessageClass::Response(ResponseType::UnsupportedContentFormat),
        0x9D => MessageClass::Response(ResponseType::TooManyRequests),

        0xA0 => MessageClass::Response(ResponseType::InternalServerError),
        0xA1 => MessageClass::Response(ResponseType::NotImplemented),
        0xA2 => MessageClass::Response(ResponseType::BadGateway),
        0xA3 => MessageClass::Response(ResponseType::ServiceUnavailable),
        0xA4 => MessageClass::Response(ResponseType::GatewayTimeout),
        0xA5 => MessageClass::Response(ResponseType::ProxyingNotSupported),

        code => MessageClass::Reserved(code),
    }
}

pub fn code_to_str(code: &u8) -> String {
    let class_code = (0xE0 & code) >> 5;
    let detail_code = 0x1F & code;

    format!("{}.{:02}", class_code, detail_code)
}

pub fn str_to_code(code: &str) -> Result<u8, InvalidCode> {
    let invalid = || InvalidCode(code.to_string());
    let (class, detail) = code.split_once('.').ok_or_else(invalid)?;
    let class_code = class.parse::<u8>().map_err(|_| invalid())?;
    let detail_code = detail.parse::<u8>().map_err(|_| invalid())?;
    if class_code > 0x7 || detail_code > 0x1F {
        return Err(invalid());
    }
    Ok(class_code << 5 | detail_code)
}

pub fn class_to_str(class: &MessageClass) -> String {
    code_to_str(&class_to_code(class))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_header_codes() {
        for code in 0..=255u8 {
            let class = code_to_class(&code);
            let code_str = code_to_str(&code);
            let class_str = class_to_str(&class);

            assert_eq!(class_to_code(&class), code);
            assert_eq!(code_str, class_str);
            assert_eq!(str_to_code(&code_str), Ok(code));
        }
    }

    #[test]
    fn test_set_code() {
        let mut header = Header::new();
        header.set_code("2.05").unwrap();
        assert_eq!(header.code, MessageClass::Response(ResponseType::Content));
        assert_eq!(header.get_code(), "2.05");

        assert!(header.set_code("8.00").is_err());
        assert!(header.set_code("2").is_err());
        assert!(header.set_code("2.32").is_err());
    }

    #[test]
    fn test_message_kinds() {
        let mut header = Header::new();
        assert!(header.is_empty());

        header.code = MessageClass::Request(RequestType::Put);
        assert!(header.is_request());
        assert!(!header.is_response());

        header.code = MessageClass::Reserved(0x07);
        assert!(header.is_request());

        header.code = MessageClass::Response(ResponseType::NotFound);
        assert!(header.is_response());
        assert!(!ResponseType::NotFound.is_success());
        assert!(ResponseType::Changed.is_success());
    }

    #[test]
    fn test_type_bits() {
        for bits in 0..4u8 {
            assert_eq!(MessageType::from_bits(bits).to_bits(), bits);
        }
    }
}
