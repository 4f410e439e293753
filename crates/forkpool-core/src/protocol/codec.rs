//! Length-prefixed framing for worker result pipes.
//!
//! Format: `HEADER_LEN` ASCII lowercase hex digits holding the payload length
//! (big-endian, zero padded), followed by exactly that many payload bytes.

use thiserror::Error;

/// Width of the hex length header in bytes.
pub const HEADER_LEN: usize = 8;

/// Largest payload the header can describe (`16^HEADER_LEN - 1`).
pub const MAX_PAYLOAD_LEN: u64 = (1u64 << (4 * HEADER_LEN)) - 1;

/// Errors produced while framing or unframing a byte stream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// The payload does not fit in a frame.
    #[error("payload of {len} bytes exceeds the frame limit of {limit} bytes")]
    PayloadTooLarge { len: u64, limit: u64 },

    /// The header contained something other than lowercase hex digits.
    #[error("malformed frame header {header:?}")]
    MalformedHeader { header: String },

    /// The header announced a payload above the configured limit.
    #[error("frame announces {len} bytes, limit is {limit}")]
    Oversized { len: u64, limit: u64 },
}

/// Frame `payload` using the full header range.
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    encode_frame_limited(payload, MAX_PAYLOAD_LEN)
}

/// Frame `payload`, rejecting it when it is longer than `limit` bytes.
///
/// `limit` is clamped to [`MAX_PAYLOAD_LEN`].
pub fn encode_frame_limited(payload: &[u8], limit: u64) -> Result<Vec<u8>, FrameError> {
    let limit = limit.min(MAX_PAYLOAD_LEN);
    let len = payload.len() as u64;
    if len > limit {
        return Err(FrameError::PayloadTooLarge { len, limit });
    }

    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(format!("{:0width$x}", len, width = HEADER_LEN).as_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

fn parse_header(header: &[u8]) -> Result<u64, FrameError> {
    let valid = header
        .iter()
        .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(b));
    if !valid {
        return Err(FrameError::MalformedHeader {
            header: String::from_utf8_lossy(header).into_owned(),
        });
    }

    Ok(header.iter().fold(0u64, |acc, &b| {
        let digit = match b {
            b'0'..=b'9' => b - b'0',
            _ => b - b'a' + 10,
        };
        (acc << 4) | u64::from(digit)
    }))
}

/// Resumable frame parser for one stream.
///
/// Bytes are appended with [`feed`](Self::feed) in whatever chunks the pipe
/// delivers; [`drain`](Self::drain) hands back every complete payload and
/// keeps the unconsumed tail for the next call. Once a malformed header is
/// seen the decoder stays failed.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    limit: u64,
    failed: Option<FrameError>,
}

impl FrameDecoder {
    /// Create a decoder accepting payloads up to [`MAX_PAYLOAD_LEN`].
    pub fn new() -> Self {
        Self::with_limit(MAX_PAYLOAD_LEN)
    }

    /// Create a decoder that rejects frames announcing more than `limit` bytes.
    pub fn with_limit(limit: u64) -> Self {
        Self {
            buffer: Vec::new(),
            limit: limit.min(MAX_PAYLOAD_LEN),
            failed: None,
        }
    }

    /// Append bytes read from the stream.
    pub fn feed(&mut self, bytes: &[u8]) {
        if self.failed.is_none() {
            self.buffer.extend_from_slice(bytes);
        }
    }

    /// Extract every complete payload currently buffered.
    pub fn drain(&mut self) -> Result<Vec<Vec<u8>>, FrameError> {
        if let Some(err) = &self.failed {
            return Err(err.clone());
        }

        let mut payloads = Vec::new();
        let mut consumed = 0;

        while self.buffer.len() - consumed >= HEADER_LEN {
            let header = &self.buffer[consumed..consumed + HEADER_LEN];
            let len = match parse_header(header).and_then(|len| self.check_limit(len)) {
                Ok(len) => len,
                Err(err) => {
                    self.buffer.clear();
                    self.failed = Some(err.clone());
                    return Err(err);
                }
            };

            let start = consumed + HEADER_LEN;
            let Some(end) = start.checked_add(len as usize) else {
                break;
            };
            if self.buffer.len() < end {
                break;
            }

            payloads.push(self.buffer[start..end].to_vec());
            consumed = end;
        }

        self.buffer.drain(..consumed);
        Ok(payloads)
    }

    fn check_limit(&self, len: u64) -> Result<u64, FrameError> {
        if len > self.limit {
            Err(FrameError::Oversized {
                len,
                limit: self.limit,
            })
        } else {
            Ok(len)
        }
    }

    /// Number of bytes that would complete the header or payload in progress.
    ///
    /// Always at least one, so it can size the next read directly.
    pub fn wanted(&self) -> usize {
        if self.buffer.len() < HEADER_LEN {
            return HEADER_LEN - self.buffer.len();
        }
        match parse_header(&self.buffer[..HEADER_LEN]) {
            Ok(len) => (HEADER_LEN + len as usize)
                .saturating_sub(self.buffer.len())
                .max(1),
            Err(_) => 1,
        }
    }

    /// Whether a truncated frame is sitting in the buffer.
    pub fn has_partial(&self) -> bool {
        !self.buffer.is_empty()
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_is_lowercase_padded_hex() {
        let frame = encode_frame(&[0xab; 300]).unwrap();
        assert_eq!(&frame[..HEADER_LEN], b"0000012c");
        assert_eq!(frame.len(), HEADER_LEN + 300);
    }

    #[test]
    fn test_empty_payload() {
        let frame = encode_frame(&[]).unwrap();
        assert_eq!(frame, b"00000000");

        let mut decoder = FrameDecoder::new();
        decoder.feed(&frame);
        assert_eq!(decoder.drain().unwrap(), vec![Vec::<u8>::new()]);
        assert!(!decoder.has_partial());
    }

    #[test]
    fn test_limit_is_enforced_on_encode() {
        let err = encode_frame_limited(&[0; 17], 16).unwrap_err();
        assert_eq!(err, FrameError::PayloadTooLarge { len: 17, limit: 16 });
        assert!(encode_frame_limited(&[0; 16], 16).is_ok());
    }

    #[test]
    fn test_decoder_resumes_across_byte_splits() {
        let mut stream = encode_frame(b"first").unwrap();
        stream.extend(encode_frame(b"second frame").unwrap());

        let mut decoder = FrameDecoder::new();
        let mut payloads = Vec::new();
        for byte in &stream {
            decoder.feed(std::slice::from_ref(byte));
            payloads.extend(decoder.drain().unwrap());
        }

        assert_eq!(payloads, vec![b"first".to_vec(), b"second frame".to_vec()]);
        assert!(!decoder.has_partial());
    }

    #[test]
    fn test_decoder_keeps_tail() {
        let mut stream = encode_frame(b"one").unwrap();
        let second = encode_frame(b"two").unwrap();
        stream.extend_from_slice(&second[..5]);

        let mut decoder = FrameDecoder::new();
        decoder.feed(&stream);
        assert_eq!(decoder.drain().unwrap(), vec![b"one".to_vec()]);
        assert!(decoder.has_partial());
        assert_eq!(decoder.wanted(), HEADER_LEN - 5);

        decoder.feed(&second[5..]);
        assert_eq!(decoder.drain().unwrap(), vec![b"two".to_vec()]);
    }

    #[test]
    fn test_wanted_tracks_payload() {
        let frame = encode_frame(b"hello").unwrap();
        let mut decoder = FrameDecoder::new();
        assert_eq!(decoder.wanted(), HEADER_LEN);

        decoder.feed(&frame[..HEADER_LEN + 2]);
        assert!(decoder.drain().unwrap().is_empty());
        assert_eq!(decoder.wanted(), 3);
    }

    #[test]
    fn test_malformed_header_is_fatal() {
        let mut decoder = FrameDecoder::new();
        decoder.feed(b"0000zz01abc");
        assert!(matches!(
            decoder.drain(),
            Err(FrameError::MalformedHeader { .. })
        ));

        // Stays failed even if valid data follows.
        decoder.feed(&encode_frame(b"ok").unwrap());
        assert!(decoder.drain().is_err());
    }

    #[test]
    fn test_uppercase_and_sign_are_rejected() {
        for header in [&b"0000000A"[..], &b"+0000001"[..]] {
            let mut decoder = FrameDecoder::new();
            decoder.feed(header);
            assert!(decoder.drain().is_err(), "{:?}", header);
        }
    }

    #[test]
    fn test_oversized_announcement() {
        let mut decoder = FrameDecoder::with_limit(4);
        decoder.feed(b"00000010");
        assert_eq!(
            decoder.drain().unwrap_err(),
            FrameError::Oversized { len: 16, limit: 4 }
        );
    }
}
