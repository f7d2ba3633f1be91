use std::any::type_name;

use bincode::{Decode, Encode};
use bytes::BytesMut;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::LocalTime;

use crate::error::{CmanError, Result};

pub fn read_u32(src: &BytesMut, offset: usize) -> u32 {
    let mut u32_bytes = [0u8; 4];
    u32_bytes.copy_from_slice(&src[offset..(offset + 4)]);
    u32::from_be_bytes(u32_bytes)
}

pub fn encode_bytes<T>(value: &T) -> Result<Vec<u8>> where T: Encode {
    bincode::encode_to_vec(value, bincode::config::standard())
        .map_err(|error| CmanError::Encode(type_name::<T>(), error))
}

pub fn decode_bytes<T>(bytes: &[u8]) -> Result<T> where T: Decode {
    bincode::decode_from_slice(bytes, bincode::config::standard())
        .map(|(t, _)| t)
        .map_err(|error| CmanError::Decode(type_name::<T>(), error))
}

pub fn init_logger(level: tracing::Level) {
    let format = tracing_subscriber::fmt::format()
        .with_timer(LocalTime::rfc_3339())
        .pretty();
    tracing_subscriber::FmtSubscriber::builder()
        .event_format(format)
        .with_max_level(level)
        .init();
}

pub fn init_logger_with_filter(filter: impl Into<EnvFilter>) {
    let format = tracing_subscriber::fmt::format()
        .with_timer(LocalTime::rfc_3339())
        .pretty()
        .with_file(false);
    tracing_subscriber::FmtSubscriber::builder()
        .event_format(format)
        .with_env_filter(filter)
        .init();
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;

    use crate::ext::{decode_bytes, encode_bytes, read_u32};

    #[test]
    fn test_read_u32_big_endian() {
        let src = BytesMut::from(&[0xff, 0x00, 0x00, 0x01, 0x02][..]);
        assert_eq!(read_u32(&src, 1), 0x0000_0102);
    }

    #[test]
    fn test_decode_wrong_type() -> anyhow::Result<()> {
        let bytes = encode_bytes(&String::from("cman"))?;
        assert!(decode_bytes::<Vec<u64>>(&bytes[..1]).is_err());
        Ok(())
    }
}
