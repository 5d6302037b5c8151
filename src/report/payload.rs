//! Payload encoding for report bodies.
//!
//! Payload bytes are little-endian packed primitives with no padding.
//! Vectors are a contiguous run of packed elements; strings are UTF-8 bytes,
//! read back up to the first non-alphanumeric byte. Decoding a payload that
//! is too short yields the type's default value.

use byteorder::{ByteOrder, LittleEndian};

/// Conversion between typed values and packed report payload bytes.
pub trait PayloadCodec: Default {
    fn encode(&self, buf: &mut Vec<u8>);
    fn decode(bytes: &[u8]) -> Self;
}

impl PayloadCodec for u8 {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.push(*self);
    }
    fn decode(bytes: &[u8]) -> Self {
        bytes.first().copied().unwrap_or_default()
    }
}

impl PayloadCodec for i8 {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.push(*self as u8);
    }
    fn decode(bytes: &[u8]) -> Self {
        bytes.first().map(|&b| b as i8).unwrap_or_default()
    }
}

impl PayloadCodec for u16 {
    fn encode(&self, buf: &mut Vec<u8>) {
        let mut raw = [0u8; 2];
        LittleEndian::write_u16(&mut raw, *self);
        buf.extend_from_slice(&raw);
    }
    fn decode(bytes: &[u8]) -> Self {
        if bytes.len() >= 2 {
            LittleEndian::read_u16(bytes)
        } else {
            0
        }
    }
}

impl PayloadCodec for i16 {
    fn encode(&self, buf: &mut Vec<u8>) {
        (*self as u16).encode(buf);
    }
    fn decode(bytes: &[u8]) -> Self {
        u16::decode(bytes) as i16
    }
}

impl PayloadCodec for u32 {
    fn encode(&self, buf: &mut Vec<u8>) {
        let mut raw = [0u8; 4];
        LittleEndian::write_u32(&mut raw, *self);
        buf.extend_from_slice(&raw);
    }
    fn decode(bytes: &[u8]) -> Self {
        if bytes.len() >= 4 {
            LittleEndian::read_u32(bytes)
        } else {
            0
        }
    }
}

impl PayloadCodec for i32 {
    fn encode(&self, buf: &mut Vec<u8>) {
        (*self as u32).encode(buf);
    }
    fn decode(bytes: &[u8]) -> Self {
        u32::decode(bytes) as i32
    }
}

impl PayloadCodec for Vec<u8> {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(self);
    }
    fn decode(bytes: &[u8]) -> Self {
        bytes.to_vec()
    }
}

impl PayloadCodec for Vec<u16> {
    fn encode(&self, buf: &mut Vec<u8>) {
        for v in self {
            v.encode(buf);
        }
    }
    fn decode(bytes: &[u8]) -> Self {
        bytes.chunks_exact(2).map(LittleEndian::read_u16).collect()
    }
}

impl PayloadCodec for Vec<u32> {
    fn encode(&self, buf: &mut Vec<u8>) {
        for v in self {
            v.encode(buf);
        }
    }
    fn decode(bytes: &[u8]) -> Self {
        bytes.chunks_exact(4).map(LittleEndian::read_u32).collect()
    }
}

impl PayloadCodec for String {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(self.as_bytes());
    }
    fn decode(bytes: &[u8]) -> Self {
        let end = bytes
            .iter()
            .position(|b| !b.is_ascii_alphanumeric())
            .unwrap_or(bytes.len());
        String::from_utf8_lossy(&bytes[..end]).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalars_are_little_endian() {
        let mut buf = Vec::new();
        0x1234u16.encode(&mut buf);
        0x5678_9abcu32.encode(&mut buf);
        assert_eq!(buf, &[0x34, 0x12, 0xbc, 0x9a, 0x78, 0x56]);
        assert_eq!(u16::decode(&buf), 0x1234);
        assert_eq!(u32::decode(&buf[2..]), 0x5678_9abc);
    }

    #[test]
    fn short_payload_decodes_to_default() {
        assert_eq!(u16::decode(&[0x01]), 0);
        assert_eq!(u32::decode(&[0x01, 0x02]), 0);
        assert_eq!(u8::decode(&[]), 0);
    }

    #[test]
    fn word_vectors_pack_contiguously() {
        let mut buf = Vec::new();
        vec![0x0102u16, 0x0304].encode(&mut buf);
        assert_eq!(buf, &[0x02, 0x01, 0x04, 0x03]);
        assert_eq!(Vec::<u16>::decode(&buf), vec![0x0102, 0x0304]);
        // trailing partial element is dropped
        assert_eq!(Vec::<u16>::decode(&buf[..3]), vec![0x0102]);
    }

    #[test]
    fn strings_stop_at_first_non_alphanumeric() {
        let mut buf = Vec::new();
        "iMS4".to_string().encode(&mut buf);
        buf.push(0x00);
        buf.push(b'x');
        assert_eq!(String::decode(&buf), "iMS4");
    }
}
