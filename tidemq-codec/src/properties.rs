//! MQTT 5 property lists.
//!
//! Only the Subscription Identifier is interpreted. Every other property is
//! checked for shape and skipped.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytestring::ByteString;

use crate::error::{DecodeError, EncodeError};
use crate::types::SubscriptionId;
use crate::utils::{decode_variable_length, var_len, write_variable_length, Decode};

pub(crate) mod property_type {
    pub(crate) const UTF8_PAYLOAD: u8 = 0x01;
    pub(crate) const MSG_EXPIRY_INT: u8 = 0x02;
    pub(crate) const CONTENT_TYPE: u8 = 0x03;
    pub(crate) const RESP_TOPIC: u8 = 0x08;
    pub(crate) const CORR_DATA: u8 = 0x09;
    pub(crate) const SUB_ID: u8 = 0x0B;
    pub(crate) const SESS_EXPIRY_INT: u8 = 0x11;
    pub(crate) const ASSND_CLIENT_ID: u8 = 0x12;
    pub(crate) const SERVER_KA: u8 = 0x13;
    pub(crate) const AUTH_METHOD: u8 = 0x15;
    pub(crate) const AUTH_DATA: u8 = 0x16;
    pub(crate) const REQ_PROB_INFO: u8 = 0x17;
    pub(crate) const WILL_DELAY_INT: u8 = 0x18;
    pub(crate) const REQ_RESP_INFO: u8 = 0x19;
    pub(crate) const RESP_INFO: u8 = 0x1A;
    pub(crate) const SERVER_REF: u8 = 0x1C;
    pub(crate) const REASON_STRING: u8 = 0x1F;
    pub(crate) const RECEIVE_MAX: u8 = 0x21;
    pub(crate) const TOPIC_ALIAS_MAX: u8 = 0x22;
    pub(crate) const TOPIC_ALIAS: u8 = 0x23;
    pub(crate) const MAX_QOS: u8 = 0x24;
    pub(crate) const RETAIN_AVAIL: u8 = 0x25;
    pub(crate) const USER: u8 = 0x26;
    pub(crate) const MAX_PACKET_SIZE: u8 = 0x27;
    pub(crate) const WILDCARD_SUB_AVAIL: u8 = 0x28;
    pub(crate) const SUB_IDS_AVAIL: u8 = 0x29;
    pub(crate) const SHARED_SUB_AVAIL: u8 = 0x2A;
}

use property_type as pt;

/// Reads a variable byte integer from the front of `src`.
pub(crate) fn decode_variable_int(src: &mut Bytes) -> Result<u32, DecodeError> {
    match decode_variable_length(&src[..])? {
        Some((value, used)) => {
            src.advance(used);
            Ok(value)
        }
        None => Err(DecodeError::InvalidLength),
    }
}

/// Splits the length prefixed property list off the front of `src`.
fn take(src: &mut Bytes) -> Result<Bytes, DecodeError> {
    let len = decode_variable_int(src)? as usize;
    ensure!(src.remaining() >= len, DecodeError::InvalidLength);
    Ok(src.split_to(len))
}

/// Reads one property list and gives the subscription identifiers it holds.
pub(crate) fn decode(src: &mut Bytes) -> Result<Vec<SubscriptionId>, DecodeError> {
    let mut props = take(src)?;
    let mut ids = Vec::new();
    while props.has_remaining() {
        match props.get_u8() {
            pt::SUB_ID => {
                let id = decode_variable_int(&mut props)?;
                ids.push(SubscriptionId::new(id).ok_or(DecodeError::MalformedPacket)?);
            }
            pt::UTF8_PAYLOAD | pt::REQ_PROB_INFO | pt::REQ_RESP_INFO | pt::MAX_QOS | pt::RETAIN_AVAIL
            | pt::WILDCARD_SUB_AVAIL | pt::SUB_IDS_AVAIL | pt::SHARED_SUB_AVAIL => {
                ensure!(props.has_remaining(), DecodeError::InvalidLength);
                props.advance(1);
            }
            pt::SERVER_KA | pt::RECEIVE_MAX | pt::TOPIC_ALIAS_MAX | pt::TOPIC_ALIAS => {
                u16::decode(&mut props)?;
            }
            pt::MSG_EXPIRY_INT | pt::SESS_EXPIRY_INT | pt::WILL_DELAY_INT | pt::MAX_PACKET_SIZE => {
                ensure!(props.remaining() >= 4, DecodeError::InvalidLength);
                props.advance(4);
            }
            pt::CONTENT_TYPE | pt::RESP_TOPIC | pt::ASSND_CLIENT_ID | pt::AUTH_METHOD | pt::RESP_INFO
            | pt::SERVER_REF | pt::REASON_STRING => {
                ByteString::decode(&mut props)?;
            }
            pt::CORR_DATA | pt::AUTH_DATA => {
                Bytes::decode(&mut props)?;
            }
            pt::USER => {
                ByteString::decode(&mut props)?;
                ByteString::decode(&mut props)?;
            }
            _ => return Err(DecodeError::MalformedPacket),
        }
    }
    Ok(ids)
}

/// Encoded size of a property list holding `ids`, length prefix included.
pub(crate) fn size(ids: &[SubscriptionId]) -> usize {
    let len = ids_len(ids);
    var_len(len as u32) + len
}

fn ids_len(ids: &[SubscriptionId]) -> usize {
    ids.iter().map(|id| 1 + var_len(id.get())).sum()
}

pub(crate) fn encode(ids: &[SubscriptionId], dst: &mut BytesMut) -> Result<(), EncodeError> {
    let len = u32::try_from(ids_len(ids)).map_err(|_| EncodeError::InvalidLength)?;
    write_variable_length(len, dst)?;
    for id in ids {
        dst.put_u8(pt::SUB_ID);
        write_variable_length(id.get(), dst)?;
    }
    Ok(())
}
