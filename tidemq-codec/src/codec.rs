use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::decode::decode_packet;
use crate::encode::{body_size, write_packet};
use crate::error::{DecodeError, EncodeError};
use crate::packet::Packet;
use crate::types::{FixedHeader, Protocol};
use crate::utils::decode_variable_length;

/// MQTT framing for `tokio_util::codec::Framed`.
///
/// Starts out with the 3.1.1 layout and follows the protocol level of the
/// first CONNECT it reads or writes.
#[derive(Debug, Clone)]
pub struct Codec {
    /// Header of the frame whose body is still arriving.
    pending: Option<FixedHeader>,
    max_size: u32,
    protocol: Protocol,
}

impl Codec {
    /// A `max_packet_size` of `0` disables the inbound size check.
    pub fn new(max_packet_size: u32) -> Self {
        Codec { pending: None, max_size: max_packet_size, protocol: Protocol::default() }
    }

    #[inline]
    pub fn max_size(&self) -> u32 {
        self.max_size
    }

    #[inline]
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    fn read_header(&self, src: &mut BytesMut) -> Result<Option<FixedHeader>, DecodeError> {
        let Some((&first_byte, rest)) = src.split_first() else {
            return Ok(None);
        };
        let Some((remaining_length, used)) = decode_variable_length(rest)? else {
            return Ok(None);
        };
        if self.max_size != 0 && remaining_length > self.max_size {
            return Err(DecodeError::MaxSizeExceeded);
        }
        src.advance(1 + used);
        Ok(Some(FixedHeader { first_byte, remaining_length }))
    }
}

impl Default for Codec {
    fn default() -> Self {
        Self::new(0)
    }
}

impl Decoder for Codec {
    /// The packet and its remaining length on the wire.
    type Item = (Packet, u32);
    type Error = DecodeError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, DecodeError> {
        let header = match self.pending.take() {
            Some(header) => header,
            None => match self.read_header(src)? {
                Some(header) => header,
                None => return Ok(None),
            },
        };
        let len = header.remaining_length as usize;
        if src.len() < len {
            src.reserve(len - src.len());
            self.pending = Some(header);
            return Ok(None);
        }
        let body = src.split_to(len).freeze();
        let packet = decode_packet(body, header.first_byte, self.protocol.is_v5())?;
        if let Packet::Connect(connect) = &packet {
            self.protocol = connect.protocol;
        }
        Ok(Some((packet, header.remaining_length)))
    }
}

impl Encoder<Packet> for Codec {
    type Error = EncodeError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), EncodeError> {
        if let Packet::Connect(connect) = &item {
            self.protocol = connect.protocol;
        }
        let v5 = self.protocol.is_v5();
        let start = dst.len();
        dst.reserve(body_size(&item, v5) + 5);
        write_packet(&item, dst, v5).inspect_err(|_| dst.truncate(start))
    }
}
