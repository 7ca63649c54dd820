use std::num::NonZeroU16;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytestring::ByteString;

use crate::error::{DecodeError, EncodeError};

macro_rules! ensure {
    ($cond:expr, $e:expr) => {
        if !($cond) {
            return Err($e);
        }
    };
}

/// A `u8` backed enum with a checked conversion from the wire byte.
macro_rules! prim_enum {
    (
        $( #[$meta:meta] )*
        pub enum $name:ident {
            $( $( #[$vmeta:meta] )* $var:ident = $val:expr ),+ $(,)?
        }
    ) => {
        $( #[$meta] )*
        #[repr(u8)]
        #[derive(Debug, Eq, PartialEq, Copy, Clone)]
        pub enum $name {
            $( $( #[$vmeta] )* $var = $val ),+
        }

        impl TryFrom<u8> for $name {
            type Error = $crate::error::DecodeError;

            fn try_from(byte: u8) -> Result<Self, Self::Error> {
                $( if byte == $val { return Ok($name::$var); } )+
                Err($crate::error::DecodeError::MalformedPacket)
            }
        }

        impl From<$name> for u8 {
            #[inline]
            fn from(v: $name) -> u8 {
                v as u8
            }
        }
    };
}

/// Largest remaining length a four byte encoding can carry.
pub(crate) const MAX_VARIABLE_LENGTH: u32 = 268_435_455;

/// A field read from the front of a frame body.
pub(crate) trait Decode: Sized {
    fn decode(src: &mut Bytes) -> Result<Self, DecodeError>;
}

impl Decode for u16 {
    fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        ensure!(src.remaining() >= 2, DecodeError::InvalidLength);
        Ok(src.get_u16())
    }
}

impl Decode for NonZeroU16 {
    fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        let raw = u16::decode(src)?;
        NonZeroU16::new(raw).ok_or(DecodeError::MalformedPacket)
    }
}

/// Length prefixed binary data.
impl Decode for Bytes {
    fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        let len = usize::from(u16::decode(src)?);
        if src.len() < len {
            return Err(DecodeError::InvalidLength);
        }
        Ok(src.split_to(len))
    }
}

impl Decode for ByteString {
    fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        let raw = Bytes::decode(src)?;
        ByteString::try_from(raw).map_err(|_| DecodeError::Utf8Error)
    }
}

/// Reads a remaining length. Gives `(value, bytes used)`, or `Ok(None)` when
/// `src` ends before the last length byte.
pub(crate) fn decode_variable_length(src: &[u8]) -> Result<Option<(u32, usize)>, DecodeError> {
    let mut value = 0u32;
    for (i, byte) in src.iter().enumerate() {
        value |= u32::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
        if i == 3 {
            return Err(DecodeError::InvalidLength);
        }
    }
    Ok(None)
}

/// A field written to the end of a frame body.
pub(crate) trait Encode {
    fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError>;
}

impl Encode for NonZeroU16 {
    #[inline]
    fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        buf.put_u16(self.get());
        Ok(())
    }
}

impl Encode for [u8] {
    fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        let Ok(len) = u16::try_from(self.len()) else {
            return Err(EncodeError::InvalidLength);
        };
        buf.reserve(2 + self.len());
        buf.put_u16(len);
        buf.put_slice(self);
        Ok(())
    }
}

impl Encode for Bytes {
    #[inline]
    fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        self.as_ref().encode(buf)
    }
}

impl Encode for ByteString {
    #[inline]
    fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        self.as_bytes().encode(buf)
    }
}

/// Bytes a variable byte integer takes on the wire.
#[inline]
pub(crate) fn var_len(value: u32) -> usize {
    match value {
        0..=0x7f => 1,
        0x80..=0x3fff => 2,
        0x4000..=0x1f_ffff => 3,
        _ => 4,
    }
}

pub(crate) fn write_variable_length(len: u32, dst: &mut BytesMut) -> Result<(), EncodeError> {
    ensure!(len <= MAX_VARIABLE_LENGTH, EncodeError::InvalidLength);
    let mut rest = len;
    while rest >= 0x80 {
        dst.put_u8((rest as u8 & 0x7f) | 0x80);
        rest >>= 7;
    }
    dst.put_u8(rest as u8);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn written(len: u32) -> Vec<u8> {
        let mut v = BytesMut::new();
        write_variable_length(len, &mut v).unwrap();
        v.to_vec()
    }

    #[test]
    fn remaining_length_boundaries() {
        for (bytes, value) in [
            (&b"\x00"[..], 0u32),
            (b"\x7f", 127),
            (b"\x80\x01", 128),
            (b"\xff\x7f", 16_383),
            (b"\x80\x80\x01", 16_384),
            (b"\xff\xff\x7f", 2_097_151),
            (b"\xff\xff\xff\x7f", MAX_VARIABLE_LENGTH),
        ] {
            assert_eq!(decode_variable_length(bytes).unwrap(), Some((value, bytes.len())));
            assert_eq!(written(value), bytes);
            assert_eq!(var_len(value), bytes.len());
        }
    }

    #[test]
    fn incomplete_and_oversized_lengths() {
        assert_eq!(decode_variable_length(b"").unwrap(), None);
        assert_eq!(decode_variable_length(b"\xff\xff\xff").unwrap(), None);
        assert!(matches!(decode_variable_length(b"\xff\xff\xff\xff\x01"), Err(DecodeError::InvalidLength)));
        // trailing bytes after the length are not consumed
        assert_eq!(decode_variable_length(b"\x05\x01\x02").unwrap(), Some((5, 1)));

        let mut v = BytesMut::new();
        assert!(matches!(write_variable_length(MAX_VARIABLE_LENGTH + 1, &mut v), Err(EncodeError::InvalidLength)));
        assert!(v.is_empty());
    }

    #[test]
    fn strings_must_be_utf8() {
        let mut src = Bytes::from_static(b"\x00\x02\xc3\x28");
        assert!(matches!(ByteString::decode(&mut src), Err(DecodeError::Utf8Error)));
        let mut src = Bytes::from_static(b"\x00\x05ab");
        assert!(matches!(ByteString::decode(&mut src), Err(DecodeError::InvalidLength)));
    }
}
