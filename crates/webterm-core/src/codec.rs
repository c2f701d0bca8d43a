//! JSON text framing for the webterm streams, plus a streaming UTF-8
//! decoder for turning pty bytes into text chunks.
//!
//! Wire format: one JSON object per WebSocket text frame.

use crate::error::{WebtermError, WebtermResult};

/// Encode a message as a JSON text frame.
pub fn encode_message<T: serde::Serialize>(value: &T) -> WebtermResult<String> {
    Ok(serde_json::to_string(value)?)
}

/// Decode one JSON text frame into a typed message.
pub fn decode_message<T: serde::de::DeserializeOwned>(text: &str) -> WebtermResult<T> {
    serde_json::from_str(text).map_err(|e| WebtermError::InvalidMessage(e.to_string()))
}

/// Streaming UTF-8 decoder: accumulates bytes and yields text that never
/// splits a multi-byte character across two chunks.
///
/// Invalid sequences are replaced with U+FFFD; an incomplete sequence at the
/// end of the input is held back until more bytes arrive.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    buffer: Vec<u8>,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Feed bytes and return every complete character decoded so far.
    pub fn feed(&mut self, data: &[u8]) -> String {
        self.buffer.extend_from_slice(data);
        let keep = incomplete_tail_len(&self.buffer);
        let ready = self.buffer.len() - keep;
        let text = String::from_utf8_lossy(&self.buffer[..ready]).into_owned();
        self.buffer.drain(..ready);
        text
    }

    /// Flush whatever is left, replacing a dangling partial character.
    pub fn finish(&mut self) -> String {
        let text = String::from_utf8_lossy(&self.buffer).into_owned();
        self.buffer.clear();
        text
    }

    /// Number of bytes held back waiting for the rest of a character.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

/// Length of a trailing, possibly-valid but incomplete UTF-8 sequence.
fn incomplete_tail_len(buf: &[u8]) -> usize {
    // A UTF-8 sequence is at most 4 bytes, so only the last 3 can be a
    // truncated prefix.
    let start = buf.len().saturating_sub(3);
    for i in (start..buf.len()).rev() {
        let b = buf[i];
        if b & 0b1100_0000 == 0b1000_0000 {
            continue;
        }
        let needed = if b & 0b1110_0000 == 0b1100_0000 {
            2
        } else if b & 0b1111_0000 == 0b1110_0000 {
            3
        } else if b & 0b1111_1000 == 0b1111_0000 {
            4
        } else {
            return 0;
        };
        let have = buf.len() - i;
        return if have < needed { have } else { 0 };
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::ClientMessage;

    #[test]
    fn decode_rejects_unknown_type() {
        let err = decode_message::<ClientMessage>(r#"{"type":"telnet"}"#).unwrap_err();
        assert!(matches!(err, WebtermError::InvalidMessage(_)));
    }

    #[test]
    fn encode_produces_tagged_object() {
        let text = encode_message(&ClientMessage::Ping).unwrap();
        assert_eq!(text, r#"{"type":"ping"}"#);
    }

    #[test]
    fn ascii_passes_through() {
        let mut d = Utf8Decoder::new();
        assert_eq!(d.feed(b"hello\r\n"), "hello\r\n");
        assert_eq!(d.pending(), 0);
    }

    #[test]
    fn split_multibyte_character_is_held_back() {
        let bytes = "héllo".as_bytes();
        // 'é' is two bytes at positions 1..3; split inside it.
        let mut d = Utf8Decoder::new();
        assert_eq!(d.feed(&bytes[..2]), "h");
        assert_eq!(d.pending(), 1);
        assert_eq!(d.feed(&bytes[2..]), "éllo");
        assert_eq!(d.pending(), 0);
    }

    #[test]
    fn four_byte_character_fed_one_byte_at_a_time() {
        let bytes = "🦀".as_bytes();
        let mut d = Utf8Decoder::new();
        let mut out = String::new();
        for b in bytes {
            out.push_str(&d.feed(&[*b]));
        }
        assert_eq!(out, "🦀");
    }

    #[test]
    fn invalid_bytes_are_replaced_not_held() {
        let mut d = Utf8Decoder::new();
        assert_eq!(d.feed(&[b'a', 0xff, b'b']), "a\u{fffd}b");
        assert_eq!(d.pending(), 0);
    }

    #[test]
    fn finish_flushes_dangling_prefix() {
        let mut d = Utf8Decoder::new();
        assert_eq!(d.feed(&[0xe2, 0x82]), "");
        assert_eq!(d.finish(), "\u{fffd}");
        assert_eq!(d.pending(), 0);
    }
}
