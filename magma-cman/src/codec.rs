use std::ops::{Deref, DerefMut};

use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::CmanError;
use crate::ext::read_u32;

pub const MAX_PACKET_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Packet {
    pub body: Vec<u8>,
}

impl Packet {
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            body
        }
    }
}

impl Deref for Packet {
    type Target = Vec<u8>;

    fn deref(&self) -> &Self::Target {
        &self.body
    }
}

impl DerefMut for Packet {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.body
    }
}

/// Length prefixed frames: a big endian `u32` body length followed by the body.
#[derive(Debug, Default)]
pub struct PacketCodec;

impl Encoder<Packet> for PacketCodec {
    type Error = CmanError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let len = item.len();
        if len > MAX_PACKET_SIZE {
            return Err(CmanError::PacketTooLarge(len, MAX_PACKET_SIZE));
        }
        dst.reserve(4 + len);
        dst.put_u32(len as u32);
        dst.put_slice(&item);
        Ok(())
    }
}

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = CmanError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let buf_len = src.len();
        if buf_len < 4 {
            return Ok(None);
        }
        let body_len = read_u32(src, 0) as usize;
        if body_len > MAX_PACKET_SIZE {
            return Err(CmanError::PacketTooLarge(body_len, MAX_PACKET_SIZE));
        }
        if body_len > buf_len - 4 {
            src.reserve(4 + body_len - buf_len);
            Ok(None)
        } else {
            let src = src.split_to(4 + body_len);
            Ok(Some(Packet::new(src[4..].to_vec())))
        }
    }
}
