//! Legacy charset handling and the escape-tunneling codec.

mod tunnel;

pub use tunnel::{escape_for_check, unescape};

use crate::error::{MigrateError, Result};
use encoding_rs::Encoding;
use std::borrow::Cow;

/// Replacement character emitted by lenient decoding for malformed or
/// unmappable byte sequences. Its presence in a decoded cell marks the
/// cell as unstable.
pub const SENTINEL: char = '\u{FFFD}';

/// The configured legacy charset.
///
/// Wraps an `encoding_rs` encoding: lenient decoding (sentinel replacement,
/// never an error) for the transcode pass, and an encode-representability
/// probe for stability validation and the tunneling codec.
#[derive(Debug, Clone, Copy)]
pub struct LegacyCharset {
    encoding: &'static Encoding,
}

impl LegacyCharset {
    /// Resolve a charset label (e.g. "GBK", "gb18030", "windows-1252").
    pub fn new(label: &str) -> Result<Self> {
        let encoding = Encoding::for_label(label.as_bytes())
            .ok_or_else(|| MigrateError::Charset(format!("unknown charset label: {}", label)))?;
        Ok(Self { encoding })
    }

    /// Canonical charset name.
    pub fn name(&self) -> &'static str {
        self.encoding.name()
    }

    /// The underlying encoding, for streaming decode readers.
    pub fn encoding(&self) -> &'static Encoding {
        self.encoding
    }

    /// Lenient decode: malformed sequences become [`SENTINEL`], never an
    /// error. Returns the decoded text and whether any replacement happened.
    pub fn decode<'a>(&self, bytes: &'a [u8]) -> (Cow<'a, str>, bool) {
        self.encoding.decode_without_bom_handling(bytes)
    }

    /// Whether the charset's encoder can represent every character of `s`.
    pub fn can_encode(&self, s: &str) -> bool {
        let (_, _, had_errors) = self.encoding.encode(s);
        !had_errors
    }

    /// Whether the charset's encoder can represent a single character.
    pub fn can_encode_char(&self, c: char) -> bool {
        let mut buf = [0u8; 4];
        self.can_encode(c.encode_utf8(&mut buf))
    }

    /// Best-effort encode for error reporting; unmappable characters are
    /// substituted by the encoder, so the output is an approximation.
    pub fn encode_lossy(&self, s: &str) -> Vec<u8> {
        let (bytes, _, _) = self.encoding.encode(s);
        bytes.into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_label_rejected() {
        assert!(LegacyCharset::new("no-such-charset").is_err());
    }

    #[test]
    fn test_gbk_round_trip() {
        let charset = LegacyCharset::new("GBK").unwrap();
        let bytes = charset.encode_lossy("中文数据");
        let (decoded, had_errors) = charset.decode(&bytes);
        assert!(!had_errors);
        assert_eq!(decoded, "中文数据");
    }

    #[test]
    fn test_lenient_decode_inserts_sentinel() {
        let charset = LegacyCharset::new("GBK").unwrap();
        // 0x81 starts a two-byte GBK sequence; truncating it is malformed.
        let (decoded, had_errors) = charset.decode(&[b'a', 0x81]);
        assert!(had_errors);
        assert!(decoded.contains(SENTINEL));
    }

    #[test]
    fn test_can_encode_probe() {
        let charset = LegacyCharset::new("windows-1252").unwrap();
        assert!(charset.can_encode("plain ascii"));
        assert!(charset.can_encode("café"));
        assert!(!charset.can_encode("一"));
        assert!(!charset.can_encode_char('一'));
        assert!(charset.can_encode_char('é'));
    }

    #[test]
    fn test_sentinel_not_encodable_in_narrow_charsets() {
        let charset = LegacyCharset::new("GBK").unwrap();
        assert!(!charset.can_encode_char(SENTINEL));
    }
}
