//! AMQP frame type and corresponding encoder and decoder

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{ser::Serialize, Deserialize};
use serde_amqp::{de::Deserializer, read::IoReader, ser::Serializer};
use tokio_util::codec::{Decoder, Encoder};

use crate::types::performatives::{
    Attach, Begin, Close, Detach, Disposition, End, Flow, Open, Performative, Transfer,
};

use super::{read_header, write_header, Error, FRAME_HEADER_SIZE, FRAME_TYPE_AMQP};

/// AMQP frame
#[derive(Debug)]
pub struct Frame {
    /// AMQP frame channel
    pub channel: u16,

    /// AMQP frame body
    pub body: FrameBody,
}

impl Frame {
    /// Creates a new AMQP frame
    pub fn new(channel: impl Into<u16>, body: FrameBody) -> Self {
        Self {
            channel: channel.into(),
            body,
        }
    }

    /// Creates an emtpy frame. The empty frame is only used to reset
    /// the remote idle timeout
    pub fn empty() -> Self {
        Self {
            channel: 0,
            body: FrameBody::Empty,
        }
    }
}

/// Encoder of the AMQP frames
#[derive(Debug)]
pub struct FrameEncoder {
    /// Max frame size negotiated with the remote peer
    max_frame_size: usize,
}

fn serialize_into(buf: &mut BytesMut, value: &impl Serialize) -> Result<(), serde_amqp::Error> {
    buf.clear();
    let mut serializer = Serializer::from(buf.writer());
    value.serialize(&mut serializer)
}

impl FrameEncoder {
    /// Creates an encoder that will split transfers larger than `max_frame_size`
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    /// Change the max frame size once the remote open has been received
    pub fn set_max_frame_size(&mut self, max_frame_size: usize) {
        self.max_frame_size = max_frame_size;
    }

    /// Encodes a transfer, splitting the payload over frames of at most the max
    /// frame size. No more than `max_frames` frames are written. The payload that
    /// did not fit is returned, and the last frame written then has `more=true`.
    pub fn encode_transfer(
        &self,
        dst: &mut BytesMut,
        channel: u16,
        mut transfer: Transfer,
        mut payload: Bytes,
        max_frames: u32,
    ) -> Result<(u32, Bytes), Error> {
        if max_frames == 0 {
            return Ok((0, payload));
        }
        let max_body_size = self.max_frame_size.saturating_sub(FRAME_HEADER_SIZE);
        let mut buf = BytesMut::new();
        serialize_into(&mut buf, &transfer)?;

        if buf.len() + payload.len() <= max_body_size {
            write_header(dst, FRAME_TYPE_AMQP, channel, buf.len() + payload.len());
            dst.put(buf);
            dst.put(payload);
            return Ok((1, Bytes::new()));
        }

        // The first frame carries the delivery id and tag
        let orig_more = transfer.more;
        transfer.more = true;
        serialize_into(&mut buf, &transfer)?;
        if buf.len() >= max_body_size {
            return Err(Error::FramingError);
        }
        let partial = payload.split_to(max_body_size - buf.len());
        write_header(dst, FRAME_TYPE_AMQP, channel, buf.len() + partial.len());
        dst.put(&buf[..]);
        dst.put(partial);
        let mut count = 1;

        // Continuation frames only need the handle
        transfer.delivery_id = None;
        transfer.delivery_tag = None;
        transfer.message_format = None;
        transfer.settled = None;
        transfer.rcv_settle_mode = None;
        serialize_into(&mut buf, &transfer)?;
        while count < max_frames && buf.len() + payload.len() > max_body_size {
            let partial = payload.split_to(max_body_size - buf.len());
            write_header(dst, FRAME_TYPE_AMQP, channel, buf.len() + partial.len());
            dst.put(&buf[..]);
            dst.put(partial);
            count += 1;
        }
        if count == max_frames {
            return Ok((count, payload));
        }

        transfer.more = orig_more;
        serialize_into(&mut buf, &transfer)?;
        write_header(dst, FRAME_TYPE_AMQP, channel, buf.len() + payload.len());
        dst.put(buf);
        dst.put(payload);
        Ok((count + 1, Bytes::new()))
    }

    /// Encodes a frame and returns the number of frames written, which is more
    /// than one only for a split transfer
    pub fn encode_frame(&mut self, item: Frame, dst: &mut BytesMut) -> Result<u32, Error> {
        let mut buf = BytesMut::new();
        match item.body {
            FrameBody::Open(performative) => serialize_into(&mut buf, &performative)?,
            FrameBody::Begin(performative) => serialize_into(&mut buf, &performative)?,
            FrameBody::Attach(performative) => serialize_into(&mut buf, &performative)?,
            FrameBody::Flow(performative) => serialize_into(&mut buf, &performative)?,
            FrameBody::Transfer {
                performative,
                payload,
            } => {
                return self
                    .encode_transfer(dst, item.channel, performative, payload, u32::MAX)
                    .map(|(count, _)| count)
            }
            FrameBody::Disposition(performative) => serialize_into(&mut buf, &performative)?,
            FrameBody::Detach(performative) => serialize_into(&mut buf, &performative)?,
            FrameBody::End(performative) => serialize_into(&mut buf, &performative)?,
            FrameBody::Close(performative) => serialize_into(&mut buf, &performative)?,
            FrameBody::Empty => {}
        }
        write_header(dst, FRAME_TYPE_AMQP, item.channel, buf.len());
        dst.put(buf);
        Ok(1)
    }
}

impl Encoder<Frame> for FrameEncoder {
    type Error = Error;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        self.encode_frame(item, dst).map(|_| ())
    }
}

/// Decoder of the AMQP frames
///
/// Expects the size prefix to be stripped already
#[derive(Debug, Default)]
pub struct FrameDecoder {}

impl Decoder for FrameDecoder {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let (ftype, channel) = read_header(src)?;
        if ftype != FRAME_TYPE_AMQP {
            return Err(Error::UnexpectedFrameType(ftype));
        }

        let body = if src.is_empty() {
            FrameBody::Empty
        } else {
            let reader = IoReader::new(src.reader());
            let mut deserializer = Deserializer::new(reader);
            let performative: Performative = Deserialize::deserialize(&mut deserializer)?;

            match performative {
                Performative::Open(performative) => FrameBody::Open(performative),
                Performative::Begin(performative) => FrameBody::Begin(performative),
                Performative::Attach(performative) => FrameBody::Attach(performative),
                Performative::Transfer(performative) => {
                    let payload = src.split().freeze();
                    FrameBody::Transfer {
                        performative,
                        payload,
                    }
                }
                Performative::Flow(performative) => FrameBody::Flow(performative),
                Performative::Disposition(performative) => FrameBody::Disposition(performative),
                Performative::Detach(performative) => FrameBody::Detach(performative),
                Performative::End(performative) => FrameBody::End(performative),
                Performative::Close(performative) => FrameBody::Close(performative),
            }
        };

        Ok(Some(Frame { channel, body }))
    }
}

/// AMQP frame body
pub enum FrameBody {
    /// Attach performative
    Attach(Attach),

    /// Flow performative
    Flow(Flow),

    /// Transfer performative and payload
    Transfer {
        /// Transfer performative
        performative: Transfer,

        /// Binary payload
        payload: Bytes,
    },

    /// Disposition performative
    Disposition(Disposition),

    /// Detach performative
    Detach(Detach),

    /// Begin performative
    Begin(Begin),

    /// End performative
    End(End),

    /// Open performative
    Open(Open),

    /// Close performative
    Close(Close),

    /// An empty frame used only for resetting idle timeout
    Empty,
}

impl std::fmt::Debug for FrameBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Attach(arg0) => f.debug_tuple("Attach").field(arg0).finish(),
            Self::Flow(arg0) => f.debug_tuple("Flow").field(arg0).finish(),
            Self::Transfer {
                performative,
                payload,
            } => f
                .debug_struct("Transfer")
                .field("performative", performative)
                .field("payload.len", &payload.len())
                .finish(),
            Self::Disposition(arg0) => f.debug_tuple("Disposition").field(arg0).finish(),
            Self::Detach(arg0) => f.debug_tuple("Detach").field(arg0).finish(),
            Self::Begin(arg0) => f.debug_tuple("Begin").field(arg0).finish(),
            Self::End(arg0) => f.debug_tuple("End").field(arg0).finish(),
            Self::Open(arg0) => f.debug_tuple("Open").field(arg0).finish(),
            Self::Close(arg0) => f.debug_tuple("Close").field(arg0).finish(),
            Self::Empty => write!(f, "Empty"),
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::{Buf, Bytes, BytesMut};
    use tokio_util::codec::{Decoder, Encoder};

    use crate::types::{
        accepted, condition,
        definitions::{AmqpError, Handle, Role},
        messaging::{DeliveryState, Modified, Received},
        performatives::{Disposition, Transfer},
        rejected, released,
    };

    use super::{Frame, FrameBody, FrameDecoder, FrameEncoder};

    fn next_frame(src: &mut BytesMut) -> Frame {
        let size = src.get_u32() as usize;
        let mut frame = src.split_to(size - 4);
        FrameDecoder {}.decode(&mut frame).unwrap().unwrap()
    }

    fn disposition(state: DeliveryState) -> Frame {
        Frame::new(
            1u16,
            FrameBody::Disposition(Disposition {
                role: Role::Receiver,
                first: 4,
                last: None,
                settled: true,
                state: Some(state),
                batchable: false,
            }),
        )
    }

    #[test]
    fn empty_frame_is_eight_bytes() {
        let mut encoder = FrameEncoder::new(512);
        let mut dst = BytesMut::new();
        encoder.encode(Frame::empty(), &mut dst).unwrap();
        assert_eq!(&dst[..], &[0, 0, 0, 8, 2, 0, 0, 0]);

        let frame = next_frame(&mut dst);
        assert!(matches!(frame.body, FrameBody::Empty));
    }

    #[test]
    fn dispositions_decode_to_the_same_state() {
        let states = vec![
            accepted(),
            released(),
            rejected(Some(condition(AmqpError::NotAllowed, "no thanks"))),
            DeliveryState::Modified(Modified {
                delivery_failed: Some(true),
                undeliverable_here: Some(false),
                message_annotations: None,
            }),
            DeliveryState::Received(Received {
                section_number: 2,
                section_offset: 128,
            }),
        ];

        let mut encoder = FrameEncoder::new(512);
        for state in states {
            let expected = format!("{:?}", state);
            let mut dst = BytesMut::new();
            encoder.encode(disposition(state), &mut dst).unwrap();
            let frame = next_frame(&mut dst);
            assert_eq!(frame.channel, 1);
            match frame.body {
                FrameBody::Disposition(disposition) => {
                    let state = disposition.state.expect("state is set");
                    assert_eq!(format!("{:?}", state), expected);
                    assert!(disposition.settled);
                    assert_eq!(disposition.first, 4);
                }
                other => panic!("expecting disposition, found {:?}", other),
            }
        }
    }

    fn first_transfer() -> Transfer {
        Transfer {
            handle: Handle(0),
            delivery_id: Some(0),
            delivery_tag: Some(serde_bytes::ByteBuf::from(vec![1u8])),
            message_format: Some(0),
            settled: Some(false),
            more: false,
            rcv_settle_mode: None,
            state: None,
            resume: false,
            aborted: false,
            batchable: false,
        }
    }

    #[test]
    fn large_transfer_is_split() {
        let payload = Bytes::from(vec![7u8; 1500]);
        let transfer = first_transfer();
        let mut encoder = FrameEncoder::new(512);
        let mut dst = BytesMut::new();
        encoder
            .encode(
                Frame::new(
                    0u16,
                    FrameBody::Transfer {
                        performative: transfer,
                        payload,
                    },
                ),
                &mut dst,
            )
            .unwrap();

        let mut total = 0;
        let mut frames = 0;
        loop {
            let frame = next_frame(&mut dst);
            frames += 1;
            match frame.body {
                FrameBody::Transfer {
                    performative,
                    payload,
                } => {
                    total += payload.len();
                    if frames == 1 {
                        assert_eq!(performative.delivery_id, Some(0));
                    } else {
                        assert_eq!(performative.delivery_id, None);
                    }
                    if !performative.more {
                        break;
                    }
                }
                other => panic!("expecting transfer, found {:?}", other),
            }
        }
        assert!(frames >= 3);
        assert_eq!(total, 1500);
        assert!(dst.is_empty());
    }

    #[test]
    fn split_transfer_stops_at_the_frame_limit() {
        let payload = Bytes::from(vec![7u8; 1500]);
        let encoder = FrameEncoder::new(512);
        let mut dst = BytesMut::new();
        let (count, rest) = encoder
            .encode_transfer(&mut dst, 0, first_transfer(), payload, 2)
            .unwrap();
        assert_eq!(count, 2);
        assert!(!rest.is_empty());

        let mut total = 0;
        for _ in 0..2 {
            match next_frame(&mut dst).body {
                FrameBody::Transfer {
                    performative,
                    payload,
                } => {
                    assert!(performative.more);
                    total += payload.len();
                }
                other => panic!("expecting transfer, found {:?}", other),
            }
        }
        assert!(dst.is_empty());
        assert_eq!(total + rest.len(), 1500);
    }

    #[test]
    fn oversized_first_transfer_is_a_framing_error() {
        let mut transfer = first_transfer();
        transfer.delivery_tag = Some(serde_bytes::ByteBuf::from(vec![0u8; 600]));
        let encoder = FrameEncoder::new(512);
        let mut dst = BytesMut::new();
        let result = encoder.encode_transfer(&mut dst, 0, transfer, Bytes::from_static(b"x"), 1);
        assert!(matches!(result, Err(super::Error::FramingError)));
        assert!(dst.is_empty());
    }
}
