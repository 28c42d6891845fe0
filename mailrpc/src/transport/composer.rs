// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//! Length-prefixed framing for byte streams.
//!
//! A frame is `[length][payload]`, where `length` is a base-128 varint written with the most
//! significant group first. Every header byte except the last carries the continuation bit `0x80`.
//!
//! | payload length | header |
//! |---|---|
//! | 127 | `7f` |
//! | 128 | `81 00` |
//! | 16384 | `81 80 00` |

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

const GROUP_BITS: u32 = 7;
const GROUP_MASK: u8 = 0x7f;
const CONTINUATION: u8 = 0x80;
/// Payload bytes reserved ahead of arrival. Larger frames grow as data comes in.
const PREALLOC_LIMIT: usize = 64 * 1024;

/// Framing failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ComposeError {
    /// Frames carry at least one byte.
    #[error("frame payload should not be empty")]
    EmptyPayload,
    /// The payload, or a length read from the header, is above the configured maximum.
    #[error("frame length {length} exceeds the limitation: {max}")]
    LengthLimit {
        /// Observed length. For a header being decoded this is the partial value that crossed the limit.
        length: usize,
        /// Configured maximum.
        max: usize,
    },
    /// The composer hit a length limit earlier and must be reset before reuse.
    #[error("composer in error state, reset it first")]
    NeedsReset,
}

impl From<ComposeError> for io::Error {
    fn from(e: ComposeError) -> Self {
        io::Error::new(io::ErrorKind::InvalidData, e)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    ReadingLength,
    ReadingData,
    Error,
}

/// Encodes payloads into frames and reassembles frames from arbitrary chunks.
///
/// Decoding is resumable: a header or payload split across any number of [`Composer::feed`]
/// calls yields exactly the same frames as a single contiguous feed.
#[derive(Debug, Clone)]
pub struct Composer {
    max_length: Option<usize>,
    state: State,
    length: usize,
    buf: BytesMut,
}

impl Default for Composer {
    fn default() -> Self {
        Self::new()
    }
}

impl Composer {
    /// Returns a composer without a length limit.
    pub fn new() -> Self {
        Self {
            max_length: None,
            state: State::ReadingLength,
            length: 0,
            buf: BytesMut::new(),
        }
    }

    /// Sets the largest accepted payload in bytes. `None` or `Some(0)` means unlimited.
    /// Default is unlimited.
    pub fn with_max_length(mut self, max_length: Option<usize>) -> Self {
        self.max_length = max_length.filter(|&n| n > 0);
        self
    }

    /// The largest accepted payload, if limited.
    pub fn max_length(&self) -> Option<usize> {
        self.max_length
    }

    /// Whether a length limit was hit and [`Composer::reset`] is required.
    pub fn is_errored(&self) -> bool {
        self.state == State::Error
    }

    /// Frames one payload.
    pub fn compose(&self, payload: &[u8]) -> Result<Bytes, ComposeError> {
        let mut dst = BytesMut::with_capacity(header_len(payload.len()) + payload.len());
        self.compose_into(payload, &mut dst)?;
        Ok(dst.freeze())
    }

    fn compose_into(&self, payload: &[u8], dst: &mut BytesMut) -> Result<(), ComposeError> {
        if payload.is_empty() {
            return Err(ComposeError::EmptyPayload);
        }
        self.check_limit(payload.len())?;
        let len = payload.len();
        let size = header_len(len);
        dst.reserve(size + len);
        for i in (0..size).rev() {
            let mut b = ((len >> (i as u32 * GROUP_BITS)) as u8) & GROUP_MASK;
            if i > 0 {
                b |= CONTINUATION;
            }
            dst.put_u8(b);
        }
        dst.put_slice(payload);
        Ok(())
    }

    /// Drops any partial frame and leaves the error state.
    pub fn reset(&mut self) {
        self.state = State::ReadingLength;
        self.length = 0;
        self.buf = BytesMut::new();
    }

    /// Consumes the next chunk read from the stream and returns every frame it completes, in order.
    ///
    /// Frames completed before a length violation inside the same chunk are discarded together
    /// with the rest of the chunk; the composer stays errored until [`Composer::reset`].
    pub fn feed(&mut self, mut chunk: &[u8]) -> Result<Vec<Bytes>, ComposeError> {
        if self.state == State::Error {
            return Err(ComposeError::NeedsReset);
        }
        let mut frames = Vec::new();
        while !chunk.is_empty() {
            if self.state == State::ReadingLength {
                let used = self.read_length(chunk)?;
                chunk = &chunk[used..];
            }
            if self.state == State::ReadingData {
                let used = self.read_data(chunk, &mut frames);
                chunk = &chunk[used..];
            }
        }
        Ok(frames)
    }

    fn read_length(&mut self, chunk: &[u8]) -> Result<usize, ComposeError> {
        for (i, &b) in chunk.iter().enumerate() {
            let length = self.length.checked_mul(1 << GROUP_BITS).and_then(|n| n.checked_add((b & GROUP_MASK) as usize));
            let length = match length {
                Some(n) if self.check_limit(n).is_ok() => n,
                _ => {
                    self.state = State::Error;
                    return Err(ComposeError::LengthLimit {
                        length: length.unwrap_or(usize::MAX),
                        max: self.max_length.unwrap_or(usize::MAX),
                    });
                },
            };
            self.length = length;
            if b & CONTINUATION == 0 {
                self.state = State::ReadingData;
                self.buf = BytesMut::with_capacity(length.min(PREALLOC_LIMIT));
                return Ok(i + 1);
            }
        }
        Ok(chunk.len())
    }

    fn read_data(&mut self, chunk: &[u8], frames: &mut Vec<Bytes>) -> usize {
        let size = chunk.len().min(self.length - self.buf.len());
        self.buf.extend_from_slice(&chunk[..size]);
        if self.buf.len() == self.length {
            frames.push(std::mem::take(&mut self.buf).freeze());
            self.state = State::ReadingLength;
            self.length = 0;
        }
        size
    }

    fn check_limit(&self, length: usize) -> Result<(), ComposeError> {
        match self.max_length {
            Some(max) if length > max => Err(ComposeError::LengthLimit { length, max }),
            _ => Ok(()),
        }
    }
}

/// Number of header bytes needed for a payload of `len` bytes.
fn header_len(mut len: usize) -> usize {
    let mut size = 0;
    while len > 0 {
        len >>= GROUP_BITS;
        size += 1;
    }
    size.max(1)
}

impl Decoder for Composer {
    type Item = Bytes;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, io::Error> {
        if self.state == State::Error {
            return Err(ComposeError::NeedsReset.into());
        }
        loop {
            match self.state {
                State::ReadingLength => {
                    if src.is_empty() {
                        return Ok(None);
                    }
                    let used = self.read_length(&src[..])?;
                    src.advance(used);
                },
                State::ReadingData => {
                    let want = self.length - self.buf.len();
                    if src.len() < want {
                        src.reserve((want - src.len()).min(PREALLOC_LIMIT));
                    }
                    let mut frames = Vec::with_capacity(1);
                    let used = self.read_data(&src[..], &mut frames);
                    src.advance(used);
                    return Ok(frames.pop());
                },
                State::Error => return Err(ComposeError::NeedsReset.into()),
            }
        }
    }
}

impl Encoder<Bytes> for Composer {
    type Error = io::Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), io::Error> {
        Ok(self.compose_into(&item, dst)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn header_size_at_group_boundaries() {
        let composer = Composer::new();
        for (len, header) in [(126, 1), (127, 1), (128, 2), (16383, 2), (16384, 3), (16385, 3)] {
            let data = payload(len);
            let frame = composer.compose(&data).unwrap();
            assert_eq!(frame.len(), len + header, "len {len}");
            assert_eq!(&frame[header..], &data[..]);

            let mut decoder = Composer::new();
            let frames = decoder.feed(&frame).unwrap();
            assert_eq!(frames, vec![Bytes::from(data)]);
        }
    }

    #[test]
    fn header_is_most_significant_group_first() {
        let composer = Composer::new();
        assert_eq!(&composer.compose(&payload(127)).unwrap()[..1], &[0x7f]);
        assert_eq!(&composer.compose(&payload(128)).unwrap()[..2], &[0x81, 0x00]);
        assert_eq!(&composer.compose(&payload(300)).unwrap()[..2], &[0x82, 0x2c]);
        assert_eq!(&composer.compose(&payload(16384)).unwrap()[..3], &[0x81, 0x80, 0x00]);
    }

    #[test]
    fn empty_payload_rejected() {
        assert_eq!(Composer::new().compose(b""), Err(ComposeError::EmptyPayload));
    }

    #[test]
    fn compose_respects_limit() {
        let composer = Composer::new().with_max_length(Some(10));
        assert!(composer.compose(&payload(10)).is_ok());
        assert_eq!(composer.compose(&payload(11)), Err(ComposeError::LengthLimit { length: 11, max: 10 }));
    }

    #[test]
    fn feed_byte_by_byte() {
        let composer = Composer::new();
        let mut stream = Vec::new();
        stream.extend_from_slice(&composer.compose(&payload(200)).unwrap());
        stream.extend_from_slice(&composer.compose(b"hello").unwrap());

        let mut decoder = Composer::new();
        let mut frames = Vec::new();
        for b in &stream {
            frames.extend(decoder.feed(std::slice::from_ref(b)).unwrap());
        }
        assert_eq!(frames, vec![Bytes::from(payload(200)), Bytes::from_static(b"hello")]);
    }

    #[test]
    fn feed_split_inside_header_and_payload() {
        let composer = Composer::new();
        let frame = composer.compose(&payload(16385)).unwrap();
        let mut decoder = Composer::new();
        assert!(decoder.feed(&frame[..1]).unwrap().is_empty());
        assert!(decoder.feed(&frame[1..2000]).unwrap().is_empty());
        let frames = decoder.feed(&frame[2000..]).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].len(), 16385);
    }

    #[test]
    fn length_limit_requires_reset() {
        let big = Composer::new().compose(&payload(100)).unwrap();
        let mut decoder = Composer::new().with_max_length(Some(64));
        assert_matches!(decoder.feed(&big), Err(ComposeError::LengthLimit { max: 64, .. }));
        assert!(decoder.is_errored());
        assert_eq!(decoder.feed(b"\x01a"), Err(ComposeError::NeedsReset));

        decoder.reset();
        assert_eq!(decoder.feed(b"\x01a").unwrap(), vec![Bytes::from_static(b"a")]);
    }

    #[test]
    fn huge_length_header_does_not_reserve_the_payload() {
        let header = [0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x7f];
        let mut decoder = Composer::new();
        assert!(decoder.feed(&header).unwrap().is_empty());
        assert!(decoder.feed(&payload(1024)).unwrap().is_empty());
        assert!(!decoder.is_errored());
        assert!(decoder.buf.capacity() < 2 * PREALLOC_LIMIT);

        let mut decoder = Composer::new();
        let mut src = BytesMut::from(&header[..]);
        src.extend_from_slice(b"abc");
        assert_eq!(decoder.decode(&mut src).unwrap(), None);
        assert!(src.capacity() < 2 * PREALLOC_LIMIT);
    }

    #[test]
    fn decoder_resumes_across_reads() {
        let frame = Composer::new().compose(&payload(130)).unwrap();
        let mut decoder = Composer::new();
        let mut src = BytesMut::from(&frame[..1]);
        assert_eq!(decoder.decode(&mut src).unwrap(), None);
        src.extend_from_slice(&frame[1..50]);
        assert_eq!(decoder.decode(&mut src).unwrap(), None);
        src.extend_from_slice(&frame[50..]);
        src.extend_from_slice(b"\x02hi");
        assert_eq!(decoder.decode(&mut src).unwrap(), Some(Bytes::from(payload(130))));
        assert_eq!(decoder.decode(&mut src).unwrap(), Some(Bytes::from_static(b"hi")));
        assert_eq!(decoder.decode(&mut src).unwrap(), None);
    }

    #[test]
    fn encoder_matches_compose() {
        let mut composer = Composer::new();
        let mut dst = BytesMut::new();
        composer.encode(Bytes::from_static(b"abc"), &mut dst).unwrap();
        assert_eq!(&dst[..], &composer.compose(b"abc").unwrap()[..]);
    }
}
