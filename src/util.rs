//! Small conversion helpers shared across the crate.

use uuid::Uuid;

/// Canonical textual form of a 128-bit payload tag: 32 lowercase hex
/// characters, no dashes. This is also the filename used on the bulk file
/// channel.
pub fn uuid_to_str(uuid: &[u8; 16]) -> String {
    Uuid::from_bytes(*uuid).simple().to_string()
}

/// Parses the 32-hex-character textual form back to bytes.
pub fn str_to_uuid(s: &str) -> Option<[u8; 16]> {
    if s.len() != 32 {
        return None;
    }
    Uuid::try_parse(s).ok().map(|u| u.into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuid_text_round_trip() {
        let bytes: [u8; 16] = [
            0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb, 0xcc, 0xdd,
            0xee, 0xff,
        ];
        let s = uuid_to_str(&bytes);
        assert_eq!(s, "00112233445566778899aabbccddeeff");
        assert_eq!(str_to_uuid(&s), Some(bytes));
    }

    #[test]
    fn uuid_text_is_total_on_hex_strings() {
        let s = "ffeeddccbbaa99887766554433221100";
        let bytes = str_to_uuid(s).unwrap();
        assert_eq!(uuid_to_str(&bytes), s);
    }

    #[test]
    fn malformed_uuid_strings_are_rejected() {
        assert!(str_to_uuid("").is_none());
        assert!(str_to_uuid("00112233").is_none());
        assert!(str_to_uuid("zz112233445566778899aabbccddeeff").is_none());
    }
}
