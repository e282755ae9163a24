//! Splitting an arbitrarily chunked byte stream into fixed-size frames.
//!
//! [`FrameDecoder`] owns the accumulator that carries partial frames across
//! chunk boundaries. [`Frames`] drives it from any [`Read`] until end-of-stream.
use std::io::{self, Read};

use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::record::RECORD_LEN;

/// Size of each transport read.
pub const READ_CHUNK_LEN: usize = 1024;

/// A single undecoded packet.
pub type Frame = [u8; RECORD_LEN];

/// Accumulates chunks and yields complete frames in arrival order.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    // start of unconsumed bytes in `buf`
    pos: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a chunk as delivered by the transport.
    pub fn push(&mut self, chunk: &[u8]) {
        if self.pos > 0 {
            self.buf.drain(..self.pos);
            self.pos = 0;
        }
        self.buf.extend_from_slice(chunk);
    }

    /// Removes and returns the next complete frame, if one is buffered.
    pub fn next_frame(&mut self) -> Option<Frame> {
        if self.buffered() < RECORD_LEN {
            return None;
        }
        let mut frame = [0u8; RECORD_LEN];
        frame.copy_from_slice(&self.buf[self.pos..self.pos + RECORD_LEN]);
        self.pos += RECORD_LEN;
        Some(frame)
    }

    /// Number of bytes held that do not yet form a complete frame.
    pub fn buffered(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Drops any partial frame, returning how many bytes were discarded.
    pub fn discard_remainder(&mut self) -> usize {
        let n = self.buffered();
        self.buf.clear();
        self.pos = 0;
        n
    }
}

/// Lazy iterator of frames read from `R` until it reports end-of-stream.
///
/// A transport error is yielded once and ends the iteration. A trailing
/// partial frame at end-of-stream is discarded.
pub struct Frames<R> {
    reader: R,
    decoder: FrameDecoder,
    chunk: Box<[u8]>,
    done: bool,
}

impl<R: Read> Frames<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            decoder: FrameDecoder::new(),
            chunk: vec![0u8; READ_CHUNK_LEN].into_boxed_slice(),
            done: false,
        }
    }

    /// Consumes the iterator and returns the inner reader.
    pub fn into_inner(self) -> R {
        self.reader
    }
}

impl<R: Read> Iterator for Frames<R> {
    type Item = Result<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(frame) = self.decoder.next_frame() {
                trace!(frame = ?frame, "frame");
                return Some(Ok(frame));
            }
            if self.done {
                return None;
            }
            match self.reader.read(&mut self.chunk) {
                Ok(0) => {
                    self.done = true;
                    let dropped = self.decoder.discard_remainder();
                    if dropped > 0 {
                        debug!(dropped, "discarding partial frame at end of stream");
                    }
                    return None;
                }
                Ok(n) => self.decoder.push(&self.chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.done = true;
                    return Some(Err(Error::transport(e, "reading record stream")));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    /// Reader that hands out pre-split chunks, one per `read` call.
    struct Chunked {
        chunks: std::collections::VecDeque<Vec<u8>>,
    }

    impl Read for Chunked {
        fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
            let Some(mut chunk) = self.chunks.pop_front() else { return Ok(0) };
            let n = chunk.len().min(out.len());
            out[..n].copy_from_slice(&chunk[..n]);
            if n < chunk.len() {
                self.chunks.push_front(chunk.split_off(n));
            }
            Ok(n)
        }
    }

    fn stream_bytes(frames: usize) -> Vec<u8> {
        (0..frames * RECORD_LEN).map(|i| (i % 251) as u8).collect()
    }

    fn collect(chunks: Vec<Vec<u8>>) -> Vec<Frame> {
        Frames::new(Chunked { chunks: chunks.into() })
            .collect::<Result<Vec<_>>>()
            .unwrap()
    }

    #[test]
    fn frames_are_independent_of_chunk_boundaries() {
        let bytes = stream_bytes(5);
        let whole = collect(vec![bytes.clone()]);
        assert_eq!(whole.len(), 5);
        for split in [1, 3, 16, 17, 18, 40] {
            let chunks: Vec<Vec<u8>> = bytes.chunks(split).map(<[u8]>::to_vec).collect();
            assert_eq!(collect(chunks), whole, "split {split}");
        }
        let ragged = vec![bytes[..5].to_vec(), bytes[5..50].to_vec(), bytes[50..].to_vec()];
        assert_eq!(collect(ragged), whole);
    }

    proptest! {
        #[test]
        fn any_split_yields_the_same_frames(
            frames in 0usize..8,
            tail in 0usize..RECORD_LEN,
            cuts in proptest::collection::vec(1usize..40, 0..20),
        ) {
            let mut bytes = stream_bytes(frames);
            bytes.extend(std::iter::repeat(0xAB).take(tail));
            let mut chunks = Vec::new();
            let mut rest = bytes.as_slice();
            for cut in cuts {
                if rest.is_empty() {
                    break;
                }
                let (head, tail) = rest.split_at(cut.min(rest.len()));
                chunks.push(head.to_vec());
                rest = tail;
            }
            if !rest.is_empty() {
                chunks.push(rest.to_vec());
            }
            let got = collect(chunks);
            prop_assert_eq!(got.len(), frames);
            prop_assert_eq!(got, collect(vec![bytes]));
        }
    }

    #[test]
    fn trailing_partial_frame_is_discarded() {
        let mut bytes = stream_bytes(2);
        bytes.extend_from_slice(&[9, 9, 9]);
        assert_eq!(collect(vec![bytes]).len(), 2);
    }

    #[test]
    fn decoder_keeps_order_across_pushes() {
        let bytes = stream_bytes(2);
        let mut dec = FrameDecoder::new();
        dec.push(&bytes[..10]);
        assert!(dec.next_frame().is_none());
        dec.push(&bytes[10..30]);
        assert_eq!(dec.next_frame().unwrap().as_slice(), &bytes[..17]);
        assert_eq!(dec.buffered(), 13);
        dec.push(&bytes[30..]);
        assert_eq!(dec.next_frame().unwrap().as_slice(), &bytes[17..]);
        assert!(dec.next_frame().is_none());
        assert_eq!(dec.discard_remainder(), 0);
    }

    #[test]
    fn read_error_ends_iteration() {
        struct Broken;
        impl Read for Broken {
            fn read(&mut self, _: &mut [u8]) -> io::Result<usize> {
                Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
            }
        }
        let mut frames = Frames::new(Broken);
        assert!(matches!(frames.next(), Some(Err(Error::Transport { .. }))));
        assert!(frames.next().is_none());
    }
}
