//! CoAP (RFC 7252): message codec, options and the client/server peer.

pub mod message;
pub mod option;
pub mod peer;

use std::io;
use std::time::Duration;

/// Max number of outstanding client transactions.
pub const NSTART: usize = 5;

pub const ACK_TIMEOUT: Duration = Duration::from_secs(5);
pub const ACK_RANDOM_FACTOR: f64 = 1.5;
/// Retransmissions after the original send, so four transmissions in total.
pub const MAX_RETRANSMIT: u32 = 3;

/// Max number of server transactions kept for de-duplication.
pub const NSYNC: usize = 128;

pub const PROCESSING_DELAY: Duration = Duration::from_secs(2);
pub const MAX_LATENCY: Duration = Duration::from_secs(100);

/// `ACK_TIMEOUT * (2^MAX_RETRANSMIT - 1) * ACK_RANDOM_FACTOR`
pub const MAX_TRANSMIT_SPAN: Duration = Duration::from_millis(52_500);

/// Time window for replaying the cached answer to a duplicate CON:
/// `MAX_TRANSMIT_SPAN + 2 * MAX_LATENCY + PROCESSING_DELAY`
pub const EXCHANGE_LIFETIME: Duration = Duration::from_millis(52_500 + 200_000 + 2_000);

/// De-duplication window for NON messages: `MAX_TRANSMIT_SPAN + MAX_LATENCY`
pub const NON_LIFETIME: Duration = Duration::from_millis(52_500 + 100_000);

/// Structural errors in an encoded message. The offending datagram must be
/// dropped by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecError {
    Truncated,
    BadVersion,
    BadType,
    BadTokenLength,
    BadCode,
    /// Option delta or length nibble set to the reserved value 15.
    ReservedValue,
    BadOption,
    /// An empty message (code 0.00) carrying token, options or payload.
    EmptyMessageNotEmpty,
    /// Payload marker present with no payload bytes after it.
    StrayPayloadMarker,
}

impl From<io::Error> for CodecError {
    fn from(_: io::Error) -> Self {
        CodecError::Truncated
    }
}
