use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CoapOption {
    IfMatch,
    UriHost,
    ETag,
    IfNoneMatch,
    Observe,
    UriPort,
    LocationPath,
    UriPath,
    ContentFormat,
    MaxAge,
    UriQuery,
    Accept,
    LocationQuery,
    Block2,
    Block1,
    Size2,
    ProxyUri,
    ProxyScheme,
    Size1,
    NoResponse,
    Unknown(u16),
}

/// How an option value is represented on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionFormat {
    Empty,
    Opaque,
    UInt,
    String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentFormat {
    TextPlain = 0,
    ApplicationLinkFormat = 40,
    ApplicationXML = 41,
    ApplicationOctetStream = 42,
    ApplicationEXI = 47,
    ApplicationJSON = 50,
    ApplicationCBOR = 60,
    ApplicationSenmlJSON = 110,
    ApplicationSensmlJSON = 111,
    ApplicationSenmlCBOR = 112,
    ApplicationSensmlCBOR = 113,
    ApplicationSenmlExi = 114,
    ApplicationSensmlExi = 115,
    ApplicationSenmlXML = 310,
    ApplicationSensmlXML = 311,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserveOption {
    Register = 0,
    Deregister = 1,
}

impl From<CoapOption> for u16 {
    fn from(option: CoapOption) -> u16 {
        match option {
            CoapOption::IfMatch => 1,
            CoapOption::UriHost => 3,
            CoapOption::ETag => 4,
            CoapOption::IfNoneMatch => 5,
            CoapOption::Observe => 6,
            CoapOption::UriPort => 7,
            CoapOption::LocationPath => 8,
            CoapOption::UriPath => 11,
            CoapOption::ContentFormat => 12,
            CoapOption::MaxAge => 14,
            CoapOption::UriQuery => 15,
            CoapOption::Accept => 17,
            CoapOption::LocationQuery => 20,
            CoapOption::Block2 => 23,
            CoapOption::Block1 => 27,
            CoapOption::Size2 => 28,
            CoapOption::ProxyUri => 35,
            CoapOption::ProxyScheme => 39,
            CoapOption::Size1 => 60,
            CoapOption::NoResponse => 258,
            CoapOption::Unknown(number) => number,
        }
    }
}

impl From<u16> for CoapOption {
    fn from(number: u16) -> CoapOption {
        match number {
            1 => CoapOption::IfMatch,
            3 => CoapOption::UriHost,
            4 => CoapOption::ETag,
            5 => CoapOption::IfNoneMatch,
            6 => CoapOption::Observe,
            7 => CoapOption::UriPort,
            8 => CoapOption::LocationPath,
            11 => CoapOption::UriPath,
            12 => CoapOption::ContentFormat,
            14 => CoapOption::MaxAge,
            15 => CoapOption::UriQuery,
            17 => CoapOption::Accept,
            20 => CoapOption::LocationQuery,
            23 => CoapOption::Block2,
            27 => CoapOption::Block1,
            28 => CoapOption::Size2,
            35 => CoapOption::ProxyUri,
            39 => CoapOption::ProxyScheme,
            60 => CoapOption::Size1,
            258 => CoapOption::NoResponse,
            n => CoapOption::Unknown(n),
        }
    }
}

impl CoapOption {
    pub fn number(&self) -> u16 {
        u16::from(*self)
    }

    /// Odd option numbers are critical (RFC 7252 section 5.4.6).
    pub fn is_critical(&self) -> bool {
        self.number() & 0x01 != 0
    }

    pub fn is_unsafe(&self) -> bool {
        self.number() & 0x02 != 0
    }

    pub fn is_no_cache_key(&self) -> bool {
        self.number() & 0x1E == 0x1C
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, CoapOption::Unknown(_))
    }

    pub fn format(&self) -> OptionFormat {
        match self {
            CoapOption::IfNoneMatch => OptionFormat::Empty,
            CoapOption::UriHost
            | CoapOption::LocationPath
            | CoapOption::UriPath
            | CoapOption::UriQuery
            | CoapOption::LocationQuery
            | CoapOption::ProxyUri
            | CoapOption::ProxyScheme => OptionFormat::String,
            CoapOption::Observe
            | CoapOption::UriPort
            | CoapOption::ContentFormat
            | CoapOption::MaxAge
            | CoapOption::Accept
            | CoapOption::Block2
            | CoapOption::Block1
            | CoapOption::Size2
            | CoapOption::Size1
            | CoapOption::NoResponse => OptionFormat::UInt,
            CoapOption::IfMatch | CoapOption::ETag | CoapOption::Unknown(_) => {
                OptionFormat::Opaque
            }
        }
    }
}

impl fmt::Display for CoapOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoapOption::Unknown(number) => write!(f, "Unknown({})", number),
            known => write!(f, "{:?}", known),
        }
    }
}

impl ContentFormat {
    pub fn from_u16(number: u16) -> Option<ContentFormat> {
        let format = match number {
            0 => ContentFormat::TextPlain,
            40 => ContentFormat::ApplicationLinkFormat,
            41 => ContentFormat::ApplicationXML,
            42 => ContentFormat::ApplicationOctetStream,
            47 => ContentFormat::ApplicationEXI,
            50 => ContentFormat::ApplicationJSON,
            60 => ContentFormat::ApplicationCBOR,
            110 => ContentFormat::ApplicationSenmlJSON,
            111 => ContentFormat::ApplicationSensmlJSON,
            112 => ContentFormat::ApplicationSenmlCBOR,
            113 => ContentFormat::ApplicationSensmlCBOR,
            114 => ContentFormat::ApplicationSenmlExi,
            115 => ContentFormat::ApplicationSensmlExi,
            310 => ContentFormat::ApplicationSenmlXML,
            311 => ContentFormat::ApplicationSensmlXML,
            _ => return None,
        };
        Some(format)
    }
}

impl ObserveOption {
    pub fn from_u32(value: u32) -> Option<ObserveOption> {
        match value {
            0 => Some(ObserveOption::Register),
            1 => Some(ObserveOption::Deregister),
            _ => None,
        }
    }
}

/// Encodes an unsigned option value in the minimal number of bytes.
/// Zero becomes the empty value.
pub fn encode_uint(value: u32) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count();
    bytes[skip..].to_vec()
}

/// Decodes an unsigned option value. Values wider than four bytes are rejected.
pub fn decode_uint(value: &[u8]) -> Option<u32> {
    if value.len() > 4 {
        return None;
    }
    Some(value.iter().fold(0u32, |acc, b| acc << 8 | *b as u32))
}
