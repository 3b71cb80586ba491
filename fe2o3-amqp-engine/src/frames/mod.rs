//! AMQP and SASL frames and their codecs
//!
//! Every frame starts with an 8 byte header
//!
//! ```text
//! +--------+------+------+---------+
//! |  SIZE  | DOFF | TYPE | CHANNEL |
//! +--------+------+------+---------+
//!   4 bytes  1 byte 1 byte  2 bytes
//! ```
//!
//! The size prefix is written by the encoders here and stripped by a
//! [`tokio_util::codec::LengthDelimitedCodec`] on the input side before the
//! decoders see the rest of the frame.

use bytes::{Buf, BufMut, BytesMut};

pub mod amqp;
mod error;
pub mod sasl;

pub use error::Error;

/// Frame type of AMQP frames
pub const FRAME_TYPE_AMQP: u8 = 0x00;

/// Frame type of SASL frames
pub const FRAME_TYPE_SASL: u8 = 0x01;

/// Size of the fixed frame header including the size prefix
pub const FRAME_HEADER_SIZE: usize = 8;

/// Writes a complete frame header for a body of `body_len` bytes
pub(crate) fn write_header(dst: &mut BytesMut, frame_type: u8, channel: u16, body_len: usize) {
    dst.reserve(FRAME_HEADER_SIZE + body_len);
    dst.put_u32((FRAME_HEADER_SIZE + body_len) as u32);
    // The extended header is never written, thus doff should always be 2
    dst.put_u8(2);
    dst.put_u8(frame_type);
    dst.put_u16(channel);
}

/// Reads the remainder of a frame header once the size prefix is gone and
/// skips the extended header if there is one.
///
/// Returns the frame type and the channel.
pub(crate) fn read_header(src: &mut BytesMut) -> Result<(u8, u16), Error> {
    if src.len() < FRAME_HEADER_SIZE - 4 {
        return Err(Error::FramingError);
    }
    let doff = src.get_u8() as usize;
    let ftype = src.get_u8();
    let channel = src.get_u16();

    if doff < 2 {
        return Err(Error::FramingError);
    }
    let extended = doff * 4 - FRAME_HEADER_SIZE;
    if src.len() < extended {
        return Err(Error::FramingError);
    }
    src.advance(extended);
    Ok((ftype, channel))
}
