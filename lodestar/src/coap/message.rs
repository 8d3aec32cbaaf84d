//! CoAP message codec per RFC 7252 §3.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |Ver| T |  TKL  |      Code     |          Message ID           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |   Token (if any, TKL bytes) ...
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |   Options (if any) ...
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |1 1 1 1 1 1 1 1|    Payload (if any) ...
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```

use crate::coap::option::{number, uint_wire_len, write_uint, CoapOption, OptionValue};
use crate::coap::CodecError;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

pub const COAP_VERSION: u8 = 1;
pub const PAYLOAD_MARKER: u8 = 0xff;
pub const MAX_TOKEN_LENGTH: u8 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoapType {
    Confirmable,
    NonConfirmable,
    Acknowledgement,
    Reset,
}

impl CoapType {
    #[inline]
    pub fn bits(self) -> u8 {
        match self {
            CoapType::Confirmable => 0,
            CoapType::NonConfirmable => 1,
            CoapType::Acknowledgement => 2,
            CoapType::Reset => 3,
        }
    }

    #[inline]
    fn from_bits(bits: u8) -> CoapType {
        match bits & 0x03 {
            0 => CoapType::Confirmable,
            1 => CoapType::NonConfirmable,
            2 => CoapType::Acknowledgement,
            _ => CoapType::Reset,
        }
    }
}

/// Message code as (class, detail), written `c.dd`. `0.00` is the empty
/// message; every other class-0 code is a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoapCode {
    pub class: u8,
    pub detail: u8,
}

impl CoapCode {
    pub const EMPTY: CoapCode = CoapCode { class: 0, detail: 0 };
    pub const GET: CoapCode = CoapCode { class: 0, detail: 1 };
    pub const POST: CoapCode = CoapCode { class: 0, detail: 2 };
    pub const PUT: CoapCode = CoapCode { class: 0, detail: 3 };
    pub const DELETE: CoapCode = CoapCode { class: 0, detail: 4 };
    pub const CREATED: CoapCode = CoapCode { class: 2, detail: 1 };
    pub const CHANGED: CoapCode = CoapCode { class: 2, detail: 4 };
    pub const CONTENT: CoapCode = CoapCode { class: 2, detail: 5 };
    pub const BAD_REQUEST: CoapCode = CoapCode { class: 4, detail: 0 };
    pub const NOT_FOUND: CoapCode = CoapCode { class: 4, detail: 4 };
    pub const METHOD_NOT_ALLOWED: CoapCode = CoapCode { class: 4, detail: 5 };
    pub const INTERNAL_SERVER_ERROR: CoapCode = CoapCode { class: 5, detail: 0 };

    #[inline]
    pub fn new(class: u8, detail: u8) -> CoapCode {
        CoapCode { class, detail }
    }

    /// The empty message is exactly `class == 0 && detail == 0`.
    #[inline]
    pub fn is_empty(self) -> bool {
        self.class == 0 && self.detail == 0
    }

    #[inline]
    pub fn is_request(self) -> bool {
        self.class == 0 && self.detail != 0
    }

    #[inline]
    pub fn is_response(self) -> bool {
        matches!(self.class, 2 | 4 | 5)
    }

    #[inline]
    fn byte(self) -> u8 {
        (self.class << 5) | (self.detail & 0x1f)
    }

    #[inline]
    fn from_byte(byte: u8) -> CoapCode {
        CoapCode {
            class: byte >> 5,
            detail: byte & 0x1f,
        }
    }
}

impl std::fmt::Display for CoapCode {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}.{:02}", self.class, self.detail)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoapMessage {
    pub version: u8,
    pub mtype: CoapType,
    pub code: CoapCode,
    pub message_id: u16,
    pub token: u64,
    pub token_length: u8,
    pub options: Vec<CoapOption>,
    pub payload: Vec<u8>,
}

impl CoapMessage {
    pub fn new(mtype: CoapType, code: CoapCode, message_id: u16) -> CoapMessage {
        CoapMessage {
            version: COAP_VERSION,
            mtype,
            code,
            message_id,
            token: 0,
            token_length: 0,
            options: Vec::new(),
            payload: Vec::new(),
        }
    }

    /// Empty ACK answering a CON.
    pub fn ack_for(message: &CoapMessage) -> CoapMessage {
        CoapMessage::new(
            CoapType::Acknowledgement,
            CoapCode::EMPTY,
            message.message_id,
        )
    }

    /// Empty RST answering a CON or NON.
    pub fn rst_for(message: &CoapMessage) -> CoapMessage {
        CoapMessage::new(CoapType::Reset, CoapCode::EMPTY, message.message_id)
    }

    /// Response reusing the request's message-id and token.
    pub fn response_to(request: &CoapMessage, mtype: CoapType, code: CoapCode) -> CoapMessage {
        let mut response = CoapMessage::new(mtype, code, request.message_id);
        response.token = request.token;
        response.token_length = request.token_length;
        response
    }

    #[inline]
    pub fn set_token(&mut self, token: u64, token_length: u8) {
        self.token = token;
        self.token_length = token_length;
    }

    pub fn add_option(&mut self, number: u16, value: OptionValue) {
        self.options.push(CoapOption::new(number, value));
    }

    pub fn add_uri_path(&mut self, segment: &str) {
        self.add_option(number::URI_PATH, OptionValue::Str(segment.to_owned()));
    }

    pub fn add_uri_query(&mut self, query: &str) {
        self.add_option(number::URI_QUERY, OptionValue::Str(query.to_owned()));
    }

    pub fn add_content_format(&mut self, format: u64) {
        self.add_option(number::CONTENT_FORMAT, OptionValue::Uint(format));
    }

    pub fn add_host_device_information(&mut self, info: &[u8]) {
        self.add_option(
            number::HOST_DEVICE_INFORMATION,
            OptionValue::Opaque(info.to_vec()),
        );
    }

    pub fn add_queued_command_count(&mut self, count: u64) {
        self.add_option(number::QUEUED_COMMAND_COUNT, OptionValue::Uint(count));
    }

    /// First uint value for the given option number.
    pub fn uint_option(&self, number: u16) -> Option<u64> {
        self.options.iter().find_map(|option| match option {
            CoapOption {
                number: n,
                value: OptionValue::Uint(value),
            } if *n == number => Some(*value),
            _ => None,
        })
    }

    /// First string value for the given option number.
    pub fn string_option(&self, number: u16) -> Option<&str> {
        self.options.iter().find_map(|option| match option {
            CoapOption {
                number: n,
                value: OptionValue::Str(text),
            } if *n == number => Some(text.as_str()),
            _ => None,
        })
    }

    /// First opaque value for the given option number.
    pub fn opaque_option(&self, number: u16) -> Option<&[u8]> {
        self.options.iter().find_map(|option| match option {
            CoapOption {
                number: n,
                value: OptionValue::Opaque(data),
            } if *n == number => Some(data.as_slice()),
            _ => None,
        })
    }

    pub fn content_format(&self) -> Option<u64> {
        self.uint_option(number::CONTENT_FORMAT)
    }

    pub fn first_uri_path(&self) -> Option<&str> {
        self.string_option(number::URI_PATH)
    }

    /// All Uri-Path segments in wire order.
    pub fn uri_paths(&self) -> impl Iterator<Item = &str> {
        self.options.iter().filter_map(|option| match &option.value {
            OptionValue::Str(text) if option.number == number::URI_PATH => Some(text.as_str()),
            _ => None,
        })
    }

    /// All Uri-Query components in wire order.
    pub fn uri_queries(&self) -> impl Iterator<Item = &str> {
        self.options.iter().filter_map(|option| match &option.value {
            OptionValue::Str(text) if option.number == number::URI_QUERY => Some(text.as_str()),
            _ => None,
        })
    }

    pub fn add_if_match(&mut self, opaque: &[u8]) {
        self.add_option(number::IF_MATCH, OptionValue::Opaque(opaque.to_vec()));
    }

    pub fn add_if_none_match(&mut self) {
        self.add_option(number::IF_NONE_MATCH, OptionValue::Empty);
    }

    pub fn has_if_none_match(&self) -> bool {
        self.options
            .iter()
            .any(|option| option.number == number::IF_NONE_MATCH)
    }

    pub fn add_uri_host(&mut self, host: &str) {
        self.add_option(number::URI_HOST, OptionValue::Str(host.to_owned()));
    }

    pub fn add_uri_port(&mut self, port: u64) {
        self.add_option(number::URI_PORT, OptionValue::Uint(port));
    }

    pub fn add_etag(&mut self, opaque: &[u8]) {
        self.add_option(number::ETAG, OptionValue::Opaque(opaque.to_vec()));
    }

    pub fn add_location_path(&mut self, segment: &str) {
        self.add_option(number::LOCATION_PATH, OptionValue::Str(segment.to_owned()));
    }

    pub fn add_location_query(&mut self, query: &str) {
        self.add_option(number::LOCATION_QUERY, OptionValue::Str(query.to_owned()));
    }

    pub fn add_max_age(&mut self, seconds: u64) {
        self.add_option(number::MAX_AGE, OptionValue::Uint(seconds));
    }

    pub fn max_age(&self) -> Option<u64> {
        self.uint_option(number::MAX_AGE)
    }

    pub fn add_accept(&mut self, format: u64) {
        self.add_option(number::ACCEPT, OptionValue::Uint(format));
    }

    pub fn add_proxy_uri(&mut self, uri: &str) {
        self.add_option(number::PROXY_URI, OptionValue::Str(uri.to_owned()));
    }

    pub fn add_proxy_scheme(&mut self, scheme: &str) {
        self.add_option(number::PROXY_SCHEME, OptionValue::Str(scheme.to_owned()));
    }

    pub fn add_observe(&mut self, value: u64) {
        self.add_option(number::OBSERVE, OptionValue::Uint(value));
    }

    pub fn observe(&self) -> Option<u64> {
        self.uint_option(number::OBSERVE)
    }

    pub fn add_block1(&mut self, value: u64) {
        self.add_option(number::BLOCK1, OptionValue::Uint(value));
    }

    pub fn add_block2(&mut self, value: u64) {
        self.add_option(number::BLOCK2, OptionValue::Uint(value));
    }

    pub fn add_size1(&mut self, value: u64) {
        self.add_option(number::SIZE1, OptionValue::Uint(value));
    }

    pub fn add_size2(&mut self, value: u64) {
        self.add_option(number::SIZE2, OptionValue::Uint(value));
    }

    pub fn add_no_response(&mut self, value: u64) {
        self.add_option(number::NO_RESPONSE, OptionValue::Uint(value));
    }

    pub fn queued_command_count(&self) -> Option<u64> {
        self.uint_option(number::QUEUED_COMMAND_COUNT)
    }

    pub fn host_device_information(&self) -> Option<&[u8]> {
        self.opaque_option(number::HOST_DEVICE_INFORMATION)
    }

    fn validate_for_encode(&self) -> Result<(), CodecError> {
        if self.version != COAP_VERSION {
            return Err(CodecError::BadVersion);
        }
        if self.token_length > MAX_TOKEN_LENGTH {
            return Err(CodecError::BadTokenLength);
        }
        if uint_wire_len(self.token) > self.token_length as usize {
            return Err(CodecError::BadTokenLength);
        }
        if self.code.class > 7 || self.code.detail > 31 {
            return Err(CodecError::BadCode);
        }
        if self.code.is_empty()
            && (self.token_length != 0 || !self.options.is_empty() || !self.payload.is_empty())
        {
            return Err(CodecError::EmptyMessageNotEmpty);
        }
        Ok(())
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        self.validate_for_encode()?;

        let mut out = Vec::with_capacity(4 + self.token_length as usize + self.payload.len() + 16);

        out.push(
            ((self.version & 0x03) << 6) | (self.mtype.bits() << 4) | (self.token_length & 0x0f),
        );
        out.push(self.code.byte());
        out.write_u16::<BigEndian>(self.message_id)?;

        if self.token_length > 0 {
            write_uint(&mut out, self.token, self.token_length as usize);
        }

        // Options go out in ascending number order; the sort is stable so
        // repeated numbers keep their insertion order.
        let mut ordered: Vec<&CoapOption> = self.options.iter().collect();
        ordered.sort_by_key(|option| option.number);

        let mut previous_number = 0u16;
        for option in ordered {
            option.encode(previous_number, &mut out)?;
            previous_number = option.number;
        }

        if !self.payload.is_empty() {
            out.push(PAYLOAD_MARKER);
            out.extend_from_slice(&self.payload);
        }

        Ok(out)
    }

    pub fn decode(data: &[u8]) -> Result<CoapMessage, CodecError> {
        let mut stream = data;

        let first_byte = stream.read_u8()?;

        let version = (first_byte >> 6) & 0x03;
        if version != COAP_VERSION {
            return Err(CodecError::BadVersion);
        }

        let mtype = CoapType::from_bits(first_byte >> 4);

        let token_length = first_byte & 0x0f;
        if token_length > MAX_TOKEN_LENGTH {
            return Err(CodecError::BadTokenLength);
        }

        let code = CoapCode::from_byte(stream.read_u8()?);
        let message_id = stream.read_u16::<BigEndian>()?;

        if code.is_empty() && (token_length != 0 || !stream.is_empty()) {
            return Err(CodecError::EmptyMessageNotEmpty);
        }

        if stream.len() < token_length as usize {
            return Err(CodecError::Truncated);
        }
        let mut token = 0u64;
        for _ in 0..token_length {
            token = (token << 8) | stream.read_u8()? as u64;
        }

        let mut options = Vec::new();
        let mut previous_number = 0u16;
        while !stream.is_empty() && stream[0] != PAYLOAD_MARKER {
            let option = CoapOption::decode(previous_number, &mut stream)?;
            previous_number = option.number;
            options.push(option);
        }

        let mut payload = Vec::new();
        if !stream.is_empty() {
            stream.read_u8()?;
            if stream.is_empty() {
                return Err(CodecError::StrayPayloadMarker);
            }
            payload.extend_from_slice(stream);
        }

        Ok(CoapMessage {
            version,
            mtype,
            code,
            message_id,
            token,
            token_length,
            options,
            payload,
        })
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request() -> CoapMessage {
        let mut message = CoapMessage::new(CoapType::NonConfirmable, CoapCode::POST, 0x1234);
        message.set_token(0xCAFE, 2);
        message.add_uri_path("v1");
        message.add_uri_path("Commands");
        message.add_uri_query("Sim=8988307000000000000");
        message.add_content_format(0);
        message.add_host_device_information(b"v0.1.0/alfa");
        message.payload = b"hello".to_vec();
        message
    }

    #[test]
    fn test_decode_encode_roundtrip() {
        let message = sample_request();
        let wire = message.encode().unwrap();
        let decoded = CoapMessage::decode(&wire).unwrap();
        let rewire = decoded.encode().unwrap();

        assert_eq!(decoded, message);
        assert_eq!(rewire, wire);
    }

    #[test]
    fn test_empty_ack_roundtrip() {
        let ack = CoapMessage::new(CoapType::Acknowledgement, CoapCode::EMPTY, 0xBEEF);
        let wire = ack.encode().unwrap();
        assert_eq!(wire, vec![0x60, 0x00, 0xbe, 0xef]);

        let decoded = CoapMessage::decode(&wire).unwrap();
        assert_eq!(decoded, ack);
    }

    #[test]
    fn test_encode_rejects_bad_version() {
        let mut message = CoapMessage::new(CoapType::Confirmable, CoapCode::GET, 1);
        message.version = 2;
        assert_eq!(message.encode(), Err(CodecError::BadVersion));
    }

    #[test]
    fn test_encode_rejects_bad_token_length() {
        let mut message = CoapMessage::new(CoapType::Confirmable, CoapCode::GET, 1);
        message.token_length = 9;
        assert_eq!(message.encode(), Err(CodecError::BadTokenLength));
    }

    #[test]
    fn test_encode_rejects_token_wider_than_length() {
        let mut message = CoapMessage::new(CoapType::Confirmable, CoapCode::GET, 1);
        message.set_token(0x1_0000, 2);
        assert_eq!(message.encode(), Err(CodecError::BadTokenLength));
    }

    #[test]
    fn test_encode_rejects_bad_code() {
        let mut message = CoapMessage::new(CoapType::Confirmable, CoapCode::GET, 1);
        message.code = CoapCode::new(8, 0);
        assert_eq!(message.encode(), Err(CodecError::BadCode));

        message.code = CoapCode::new(2, 32);
        assert_eq!(message.encode(), Err(CodecError::BadCode));
    }

    #[test]
    fn test_encode_rejects_nonempty_empty_message() {
        let mut message = CoapMessage::new(CoapType::Confirmable, CoapCode::EMPTY, 1);
        message.payload = b"x".to_vec();
        assert_eq!(message.encode(), Err(CodecError::EmptyMessageNotEmpty));

        let mut message = CoapMessage::new(CoapType::Confirmable, CoapCode::EMPTY, 1);
        message.add_uri_path("v1");
        assert_eq!(message.encode(), Err(CodecError::EmptyMessageNotEmpty));

        let mut message = CoapMessage::new(CoapType::Confirmable, CoapCode::EMPTY, 1);
        message.set_token(1, 1);
        assert_eq!(message.encode(), Err(CodecError::EmptyMessageNotEmpty));
    }

    #[test]
    fn test_decode_rejects_empty_message_with_extra_bytes() {
        // Empty code followed by a token byte.
        let wire = [0x61u8, 0x00, 0x00, 0x01, 0xaa];
        assert_eq!(
            CoapMessage::decode(&wire),
            Err(CodecError::EmptyMessageNotEmpty)
        );
    }

    #[test]
    fn test_decode_rejects_stray_payload_marker() {
        let mut wire = CoapMessage::new(CoapType::Confirmable, CoapCode::GET, 1)
            .encode()
            .unwrap();
        wire.push(PAYLOAD_MARKER);
        assert_eq!(
            CoapMessage::decode(&wire),
            Err(CodecError::StrayPayloadMarker)
        );
    }

    #[test]
    fn test_decode_rejects_truncated_header() {
        assert_eq!(
            CoapMessage::decode(&[0x40, 0x01]),
            Err(CodecError::Truncated)
        );
    }

    #[test]
    fn test_other_class_zero_codes_are_requests() {
        assert!(CoapCode::GET.is_request());
        assert!(!CoapCode::EMPTY.is_request());
        assert!(CoapCode::EMPTY.is_empty());
        assert!(!CoapCode::new(0, 7).is_empty());
        assert!(CoapCode::new(0, 7).is_request());
    }

    #[test]
    fn test_repeatable_options_keep_order() {
        let mut message = CoapMessage::new(CoapType::Confirmable, CoapCode::POST, 9);
        message.add_uri_path("v1");
        message.add_uri_path("Heartbeats");

        let wire = message.encode().unwrap();
        let decoded = CoapMessage::decode(&wire).unwrap();

        let paths: Vec<&str> = decoded
            .options
            .iter()
            .filter_map(|option| match &option.value {
                OptionValue::Str(text) if option.number == number::URI_PATH => {
                    Some(text.as_str())
                }
                _ => None,
            })
            .collect();
        assert_eq!(paths, vec!["v1", "Heartbeats"]);
    }

    #[test]
    fn test_option_sorting_is_applied_on_encode() {
        let mut message = CoapMessage::new(CoapType::Confirmable, CoapCode::POST, 9);
        message.add_content_format(42);
        message.add_uri_path("Commands");

        let wire = message.encode().unwrap();
        let decoded = CoapMessage::decode(&wire).unwrap();

        assert_eq!(decoded.first_uri_path(), Some("Commands"));
        assert_eq!(decoded.content_format(), Some(42));
        // On the wire Uri-Path (11) precedes Content-Format (12).
        assert_eq!(decoded.options[0].number, number::URI_PATH);
    }

    #[test]
    fn test_code_display() {
        assert_eq!(CoapCode::POST.to_string(), "0.02");
        assert_eq!(CoapCode::CREATED.to_string(), "2.01");
        assert_eq!(CoapCode::NOT_FOUND.to_string(), "4.04");
    }

    #[test]
    fn test_typed_option_helpers() {
        let mut message = CoapMessage::new(CoapType::Confirmable, CoapCode::GET, 11);
        message.add_uri_host("example.net");
        message.add_uri_port(5683);
        message.add_etag(&[1, 2, 3]);
        message.add_if_none_match();
        message.add_max_age(90);
        message.add_observe(1);
        message.add_block2(0x0a);
        message.add_no_response(2);

        let wire = message.encode().unwrap();
        let decoded = CoapMessage::decode(&wire).unwrap();

        assert!(decoded.has_if_none_match());
        assert_eq!(decoded.max_age(), Some(90));
        assert_eq!(decoded.observe(), Some(1));
        assert_eq!(decoded.uint_option(number::BLOCK2), Some(0x0a));
        assert_eq!(decoded.opaque_option(number::ETAG), Some(&[1u8, 2, 3][..]));
        assert_eq!(decoded.string_option(number::URI_HOST), Some("example.net"));
    }

    #[test]
    fn test_uri_iterators() {
        let mut message = CoapMessage::new(CoapType::NonConfirmable, CoapCode::POST, 12);
        message.add_uri_path("v1");
        message.add_uri_path("Commands");
        message.add_uri_query("Sim=123");
        message.add_uri_query("Debug=1");

        let paths: Vec<&str> = message.uri_paths().collect();
        assert_eq!(paths, vec!["v1", "Commands"]);
        let queries: Vec<&str> = message.uri_queries().collect();
        assert_eq!(queries, vec!["Sim=123", "Debug=1"]);
    }

    #[test]
    fn test_codec_property_sweep() {
        use rand::{rngs::SmallRng, Rng, SeedableRng};

        let mut rng = SmallRng::seed_from_u64(0x10de57a4);

        for _ in 0..500 {
            let mut message = CoapMessage::new(
                match rng.gen_range(0..4) {
                    0 => CoapType::Confirmable,
                    1 => CoapType::NonConfirmable,
                    2 => CoapType::Acknowledgement,
                    _ => CoapType::Reset,
                },
                CoapCode::new(2, rng.gen_range(0..32)),
                rng.gen(),
            );

            let token: u64 = rng.gen();
            let token = token >> (rng.gen_range(0..8) * 8);
            message.set_token(token, uint_wire_len(token).max(1) as u8);

            if rng.gen_bool(0.7) {
                message.add_uri_path("v1");
            }
            if rng.gen_bool(0.5) {
                message.add_queued_command_count(rng.gen_range(0..1000));
            }
            if rng.gen_bool(0.5) {
                let len = rng.gen_range(1..140);
                message.payload = (0..len).map(|_| rng.gen()).collect();
            }

            let wire = message.encode().unwrap();
            let decoded = CoapMessage::decode(&wire).unwrap();
            assert_eq!(decoded, message);
            assert_eq!(decoded.encode().unwrap(), wire);
        }
    }
}
