//! Byte level side of a connection
//!
//! A [`Transport`] is bound to exactly one [`Connection`](crate::Connection). Bytes read
//! from the peer are pushed into its tail with [`Connection::push`](crate::Connection::push),
//! bytes to be written to the peer are taken from its head with
//! [`Connection::peek_output`](crate::Connection::peek_output) and
//! [`Connection::pop`](crate::Connection::pop). The transport itself never performs I/O.

use std::time::{Duration, Instant};

use bytes::BytesMut;
use tokio_util::codec::LengthDelimitedCodec;

use crate::{
    frames::{
        amqp::{FrameDecoder, FrameEncoder},
        sasl::FrameCodec,
    },
    types::Condition,
    DEFAULT_CHANNEL_MAX, DEFAULT_MAX_FRAME_SIZE, MIN_MAX_FRAME_SIZE,
};

mod error;
mod input;
mod output;
pub mod protocol_header;
pub mod sasl;

pub use error::Error;

use self::sasl::Sasl;

/// What the input side expects next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InputState {
    Header,
    Sasl,
    Amqp,
    Done,
}

/// Frame I/O state of a connection
#[derive(Debug)]
pub struct Transport {
    pub(crate) is_server: bool,
    pub(crate) max_frame_size: u32,
    pub(crate) remote_max_frame_size: u32,
    pub(crate) channel_max: u16,
    pub(crate) remote_channel_max: u16,
    pub(crate) idle_timeout: Option<Duration>,
    pub(crate) remote_idle_timeout: Option<Duration>,
    pub(crate) sasl: Option<Sasl>,

    pub(crate) input: BytesMut,
    pub(crate) output: BytesMut,
    pub(crate) length_codec: LengthDelimitedCodec,
    pub(crate) encoder: FrameEncoder,
    pub(crate) decoder: FrameDecoder,
    pub(crate) sasl_codec: FrameCodec,

    pub(crate) input_state: InputState,
    pub(crate) sasl_header_sent: bool,
    pub(crate) amqp_header_sent: bool,
    pub(crate) amqp_header_received: bool,
    pub(crate) open_sent: bool,
    pub(crate) close_sent: bool,
    pub(crate) close_received: bool,
    /// The head closes as soon as the output drains
    pub(crate) head_closing: bool,
    pub(crate) head_closed: bool,
    pub(crate) tail_closed: bool,
    pub(crate) closed_emitted: bool,
    pub(crate) condition: Option<Condition>,

    pub(crate) bytes_input: u64,
    pub(crate) bytes_output: u64,
    pub(crate) ticked_input: u64,
    pub(crate) ticked_output: u64,
    pub(crate) last_input: Option<Instant>,
    pub(crate) last_output: Option<Instant>,
}

impl Default for Transport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport {
    /// Creates a client side transport
    pub fn new() -> Self {
        let max_frame_size = DEFAULT_MAX_FRAME_SIZE;
        Self {
            is_server: false,
            max_frame_size,
            remote_max_frame_size: MIN_MAX_FRAME_SIZE,
            channel_max: DEFAULT_CHANNEL_MAX,
            remote_channel_max: DEFAULT_CHANNEL_MAX,
            idle_timeout: None,
            remote_idle_timeout: None,
            sasl: None,

            input: BytesMut::new(),
            output: BytesMut::new(),
            length_codec: length_codec(max_frame_size),
            encoder: FrameEncoder::new(MIN_MAX_FRAME_SIZE as usize),
            decoder: FrameDecoder::default(),
            sasl_codec: FrameCodec::default(),

            input_state: InputState::Header,
            sasl_header_sent: false,
            amqp_header_sent: false,
            amqp_header_received: false,
            open_sent: false,
            close_sent: false,
            close_received: false,
            head_closing: false,
            head_closed: false,
            tail_closed: false,
            closed_emitted: false,
            condition: None,

            bytes_input: 0,
            bytes_output: 0,
            ticked_input: 0,
            ticked_output: 0,
            last_input: None,
            last_output: None,
        }
    }

    /// Creates a server side transport that waits for the peer's protocol header
    pub fn server() -> Self {
        Self {
            is_server: true,
            ..Self::new()
        }
    }

    /// Makes this a server side transport
    pub fn set_server(&mut self) {
        self.is_server = true;
    }

    /// Whether this is a server side transport
    pub fn is_server(&self) -> bool {
        self.is_server
    }

    /// Local max frame size, at least 512
    pub fn max_frame_size(&self) -> u32 {
        self.max_frame_size
    }

    /// Sets the local max frame size. Values below 512 are raised to 512.
    pub fn set_max_frame_size(&mut self, max_frame_size: u32) {
        self.max_frame_size = max_frame_size.max(MIN_MAX_FRAME_SIZE);
        self.length_codec = length_codec(self.max_frame_size);
    }

    /// Max frame size announced by the peer
    pub fn remote_max_frame_size(&self) -> u32 {
        self.remote_max_frame_size
    }

    /// Highest channel number the local end may use
    pub fn channel_max(&self) -> u16 {
        self.channel_max
    }

    /// Sets the highest channel number the local end may use
    pub fn set_channel_max(&mut self, channel_max: u16) {
        self.channel_max = channel_max;
    }

    /// Highest channel number announced by the peer
    pub fn remote_channel_max(&self) -> u16 {
        self.remote_channel_max
    }

    /// Local idle timeout
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout
    }

    /// Sets the local idle timeout. The connection is closed if nothing is received
    /// for that long.
    pub fn set_idle_timeout(&mut self, timeout: Option<Duration>) {
        self.idle_timeout = timeout.filter(|t| !t.is_zero());
    }

    /// Idle timeout announced by the peer
    pub fn remote_idle_timeout(&self) -> Option<Duration> {
        self.remote_idle_timeout
    }

    /// The SASL layer, created on first use
    pub fn sasl(&mut self) -> &mut Sasl {
        self.sasl.get_or_insert_with(Sasl::new)
    }

    /// The SASL layer if it has been created
    pub fn sasl_ref(&self) -> Option<&Sasl> {
        self.sasl.as_ref()
    }

    /// Error condition recorded by the transport
    pub fn condition(&self) -> Option<&Condition> {
        self.condition.as_ref()
    }

    /// Whether the head (output) is closed
    pub fn is_head_closed(&self) -> bool {
        self.head_closed
    }

    /// Whether the tail (input) is closed
    pub fn is_tail_closed(&self) -> bool {
        self.tail_closed
    }

    /// Whether both the head and the tail are closed
    pub fn is_closed(&self) -> bool {
        self.head_closed && self.tail_closed
    }

    /// Total number of bytes pushed into the tail
    pub fn bytes_input(&self) -> u64 {
        self.bytes_input
    }

    /// Total number of bytes popped from the head
    pub fn bytes_output(&self) -> u64 {
        self.bytes_output
    }

    /// Bytes the tail can take right now, `None` once it is closed
    pub fn capacity(&self) -> Option<usize> {
        match self.tail_closed {
            true => None,
            false => Some(
                (self.max_frame_size as usize)
                    .saturating_sub(self.input.len())
                    .max(protocol_header::PROTOCOL_HEADER_SIZE),
            ),
        }
    }

    /// Whether the frames that follow the protocol headers may be written
    pub(crate) fn can_send_amqp(&self) -> bool {
        self.amqp_header_sent && !self.head_closed && !self.head_closing
    }
}

fn length_codec(max_frame_size: u32) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .big_endian()
        .length_field_length(4)
        .length_adjustment(-4)
        .max_frame_length(max_frame_size as usize)
        .new_codec()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::Transport;

    #[test]
    fn max_frame_size_has_a_floor() {
        let mut transport = Transport::new();
        transport.set_max_frame_size(100);
        assert_eq!(transport.max_frame_size(), 512);
    }

    #[test]
    fn zero_idle_timeout_disables_it() {
        let mut transport = Transport::server();
        transport.set_idle_timeout(Some(Duration::ZERO));
        assert_eq!(transport.idle_timeout(), None);
        assert!(transport.is_server());
    }

    #[test]
    fn sasl_is_created_lazily() {
        let mut transport = Transport::new();
        assert!(transport.sasl_ref().is_none());
        transport.sasl().allow_skip(true);
        assert!(transport.sasl_ref().map(|s| s.is_skip_allowed()).unwrap_or(false));
    }
}
