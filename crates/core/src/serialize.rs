//! Byte-exact wire codec for the persisted records in spec §4.3 and §6:
//! Bitcoin-style compact-size length prefixes (`varint`/`varbytes`/
//! `varstring`) and little-endian fixed-width integers.

use bitcoin::bip32::Xpub;

use crate::error::{Error, Result};
use wallet_crypto::hash256;

pub fn write_u32_le(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

/// The `HDKey.toRaw()/fromRaw()` 82-byte layout: the 78-byte BIP32
/// extended-key serialization plus a 4-byte double-SHA256 checksum, as a
/// fixed-width sibling to base58check that skips the base58 alphabet.
pub fn encode_xpub_raw(key: &Xpub) -> [u8; 82] {
    let payload = key.encode();
    let checksum = hash256(&payload);
    let mut out = [0u8; 82];
    out[..78].copy_from_slice(&payload);
    out[78..].copy_from_slice(&checksum[..4]);
    out
}

pub fn decode_xpub_raw(data: &[u8]) -> Result<Xpub> {
    if data.len() != 82 {
        return Err(truncated("xpub raw (82 bytes)"));
    }
    let (payload, checksum) = data.split_at(78);
    if hash256(payload)[..4] != checksum[..] {
        return Err(Error::Database("xpub raw checksum mismatch".into()));
    }
    Ok(Xpub::decode(payload)?)
}

pub fn read_u32_le(buf: &[u8], pos: &mut usize) -> Result<u32> {
    let bytes = buf
        .get(*pos..*pos + 4)
        .ok_or_else(|| truncated("u32"))?;
    *pos += 4;
    Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
}

pub fn write_u8(buf: &mut Vec<u8>, value: u8) {
    buf.push(value);
}

pub fn read_u8(buf: &[u8], pos: &mut usize) -> Result<u8> {
    let byte = *buf.get(*pos).ok_or_else(|| truncated("u8"))?;
    *pos += 1;
    Ok(byte)
}

/// Bitcoin-style compact size varint.
pub fn write_varint(buf: &mut Vec<u8>, value: u64) {
    if value < 0xfd {
        buf.push(value as u8);
    } else if value <= 0xffff {
        buf.push(0xfd);
        buf.extend_from_slice(&(value as u16).to_le_bytes());
    } else if value <= 0xffff_ffff {
        buf.push(0xfe);
        buf.extend_from_slice(&(value as u32).to_le_bytes());
    } else {
        buf.push(0xff);
        buf.extend_from_slice(&value.to_le_bytes());
    }
}

pub fn read_varint(buf: &[u8], pos: &mut usize) -> Result<u64> {
    let prefix = read_u8(buf, pos)?;
    Ok(match prefix {
        0xfd => {
            let bytes = buf.get(*pos..*pos + 2).ok_or_else(|| truncated("varint16"))?;
            *pos += 2;
            u16::from_le_bytes(bytes.try_into().unwrap()) as u64
        }
        0xfe => {
            let bytes = buf.get(*pos..*pos + 4).ok_or_else(|| truncated("varint32"))?;
            *pos += 4;
            u32::from_le_bytes(bytes.try_into().unwrap()) as u64
        }
        0xff => {
            let bytes = buf.get(*pos..*pos + 8).ok_or_else(|| truncated("varint64"))?;
            *pos += 8;
            u64::from_le_bytes(bytes.try_into().unwrap())
        }
        small => small as u64,
    })
}

pub fn write_varbytes(buf: &mut Vec<u8>, data: &[u8]) {
    write_varint(buf, data.len() as u64);
    buf.extend_from_slice(data);
}

pub fn read_varbytes(buf: &[u8], pos: &mut usize) -> Result<Vec<u8>> {
    let len = read_varint(buf, pos)? as usize;
    let bytes = buf.get(*pos..*pos + len).ok_or_else(|| truncated("varbytes"))?;
    *pos += len;
    Ok(bytes.to_vec())
}

pub fn write_varstring(buf: &mut Vec<u8>, s: &str) {
    write_varbytes(buf, s.as_bytes());
}

pub fn read_varstring(buf: &[u8], pos: &mut usize) -> Result<String> {
    let bytes = read_varbytes(buf, pos)?;
    String::from_utf8(bytes).map_err(|_| truncated("varstring (invalid utf-8)"))
}

fn truncated(what: &'static str) -> Error {
    Error::Database(format!("truncated record while reading {what}").into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varint_roundtrips_across_size_classes() {
        for value in [0u64, 1, 0xfc, 0xfd, 0xffff, 0x1_0000, 0xffff_ffff, u64::MAX] {
            let mut buf = Vec::new();
            write_varint(&mut buf, value);
            let mut pos = 0;
            assert_eq!(read_varint(&buf, &mut pos).unwrap(), value);
            assert_eq!(pos, buf.len());
        }
    }

    #[test]
    fn varstring_roundtrips() {
        let mut buf = Vec::new();
        write_varstring(&mut buf, "default");
        let mut pos = 0;
        assert_eq!(read_varstring(&buf, &mut pos).unwrap(), "default");
    }

    #[test]
    fn truncated_buffer_is_rejected() {
        let mut pos = 0;
        assert!(read_u32_le(&[1, 2], &mut pos).is_err());
    }
}
