//! Delimiter-based frame extraction from a continuous capture byte stream

use std::io;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::trace;

use crate::capture::frame::Frame;
use crate::error::{RelayError, Result};

/// Largest frame accepted before a start marker is declared corrupt
pub const DEFAULT_MAX_FRAME_LEN: usize = 8 * 1024 * 1024;

/// Size of each read from the capture output
pub const READ_CHUNK_SIZE: usize = 4096;

/// Byte sequences that open and close a frame in the raw stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delimiters {
    pub start: Vec<u8>,
    pub end: Vec<u8>,
}

impl Delimiters {
    /// Both markers must be non-empty.
    pub fn new(start: impl Into<Vec<u8>>, end: impl Into<Vec<u8>>) -> Result<Self> {
        let (start, end) = (start.into(), end.into());
        if start.is_empty() || end.is_empty() {
            return Err(RelayError::InvalidConfig(
                "frame markers must not be empty".into(),
            ));
        }
        Ok(Self { start, end })
    }

    /// JPEG start-of-image / end-of-image markers
    pub fn jpeg() -> Self {
        Self {
            start: vec![0xFF, 0xD8],
            end: vec![0xFF, 0xD9],
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn rfind(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).rposition(|w| w == needle)
}

/// Accumulates raw chunks and cuts complete frames out of them.
///
/// Every decision depends only on stream content, never on how the stream
/// was split into chunks, so feeding one byte at a time yields the same frames
/// as feeding everything at once. The accumulation buffer never holds more
/// than `max_frame_len` bytes plus the last pushed chunk.
pub struct FrameExtractor {
    delimiters: Delimiters,
    max_frame_len: usize,
    buf: BytesMut,
    /// Offset below which no end marker can start; reset whenever `buf` shifts
    end_scanned: usize,
    sequence: u64,
    discarded: u64,
}

impl FrameExtractor {
    pub fn new(delimiters: Delimiters, max_frame_len: usize) -> Self {
        let max_frame_len = max_frame_len.max(delimiters.start.len() + delimiters.end.len());
        Self {
            delimiters,
            max_frame_len,
            buf: BytesMut::with_capacity(READ_CHUNK_SIZE * 2),
            end_scanned: 0,
            sequence: 0,
            discarded: 0,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Cut the next complete frame, if the buffered data holds one.
    pub fn next_frame(&mut self) -> Option<Frame> {
        let start_len = self.delimiters.start.len();
        let end_len = self.delimiters.end.len();

        loop {
            let Some(start) = find(&self.buf, &self.delimiters.start) else {
                // Keep a tail that may be the first half of a split marker
                let keep = start_len - 1;
                if self.buf.len() > keep {
                    self.discard(self.buf.len() - keep);
                }
                return None;
            };
            if start > 0 {
                self.discard(start);
            }

            // Only bytes pushed since the last miss need scanning
            let window_end = self.buf.len().min(self.max_frame_len);
            let from = self.end_scanned.max(start_len).min(window_end);
            let end = find(&self.buf[from..window_end], &self.delimiters.end)
                .map(|pos| pos + from);

            let Some(end) = end else {
                if self.buf.len() >= self.max_frame_len {
                    trace!(
                        max_frame_len = self.max_frame_len,
                        "no end marker within frame limit, resyncing"
                    );
                    self.discard(start_len);
                    continue;
                }
                // A marker may straddle the next chunk boundary
                self.end_scanned = window_end.saturating_sub(end_len - 1).max(start_len);
                return None;
            };

            // A later start marker means the earlier frame was cut short upstream
            let frame_start = rfind(&self.buf[..end], &self.delimiters.start).unwrap_or(0);
            if frame_start > 0 {
                self.discard(frame_start);
            }

            let data = self.buf.split_to(end + end_len - frame_start).freeze();
            self.end_scanned = 0;
            self.sequence += 1;
            return Some(Frame::new(data, self.sequence));
        }
    }

    fn discard(&mut self, n: usize) {
        self.buf.advance(n);
        self.end_scanned = 0;
        self.discarded += n as u64;
    }

    /// Bytes currently held waiting for a frame boundary
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Total bytes dropped as garbage, truncated frames or oversized frames
    pub fn bytes_discarded(&self) -> u64 {
        self.discarded
    }

    /// Number of frames emitted so far
    pub fn frames_emitted(&self) -> u64 {
        self.sequence
    }
}

/// Pulls chunks from an async reader and yields whole frames.
///
/// The sequence ends at the first zero-length read. A read error is returned
/// once and ends the sequence; an incomplete trailing frame is never emitted.
pub struct FrameReader<R> {
    reader: R,
    extractor: FrameExtractor,
    chunk: Box<[u8]>,
    bytes_read: u64,
    done: bool,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R, extractor: FrameExtractor) -> Self {
        Self {
            reader,
            extractor,
            chunk: vec![0u8; READ_CHUNK_SIZE].into_boxed_slice(),
            bytes_read: 0,
            done: false,
        }
    }

    pub async fn next_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            if let Some(frame) = self.extractor.next_frame() {
                return Ok(Some(frame));
            }
            if self.done {
                return Ok(None);
            }

            let n = match self.reader.read(&mut self.chunk).await {
                Ok(0) => {
                    trace!(
                        leftover = self.extractor.buffered(),
                        "capture stream closed"
                    );
                    self.done = true;
                    return Ok(None);
                }
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.done = true;
                    return Err(RelayError::Read(e));
                }
            };

            self.bytes_read += n as u64;
            self.extractor.push(&self.chunk[..n]);
        }
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    pub fn extractor(&self) -> &FrameExtractor {
        &self.extractor
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const S: [u8; 2] = [0xFF, 0xD8];
    const E: [u8; 2] = [0xFF, 0xD9];

    fn frame_bytes(payload: &[u8]) -> Vec<u8> {
        [&S[..], payload, &E[..]].concat()
    }

    fn extract_all(chunks: &[&[u8]], max_frame_len: usize) -> Vec<Vec<u8>> {
        let mut extractor = FrameExtractor::new(Delimiters::jpeg(), max_frame_len);
        let mut frames = Vec::new();
        for chunk in chunks {
            extractor.push(chunk);
            while let Some(frame) = extractor.next_frame() {
                frames.push(frame.data.to_vec());
            }
        }
        frames
    }

    fn extract_in_chunks(stream: &[u8], size: usize, max_frame_len: usize) -> Vec<Vec<u8>> {
        let chunks: Vec<&[u8]> = stream.chunks(size).collect();
        extract_all(&chunks, max_frame_len)
    }

    #[test]
    fn two_frames_across_three_splits() {
        let stream = [frame_bytes(b"AAA"), frame_bytes(b"BBB")].concat();
        let frames = extract_all(&[&stream[..3], &stream[3..8], &stream[8..]], 1024);

        assert_eq!(frames, vec![frame_bytes(b"AAA"), frame_bytes(b"BBB")]);
    }

    #[test]
    fn chunking_never_changes_output() {
        let stream = [
            b"garbage".to_vec(),
            frame_bytes(b"first"),
            vec![0x00, 0xFF],
            // Truncated frame followed by a fresh one
            S.to_vec(),
            b"cut".to_vec(),
            frame_bytes(b"second"),
            E.to_vec(),
            frame_bytes(&[0xFF, 0x00, 0xFF]),
            S.to_vec(),
            b"unfinished".to_vec(),
        ]
        .concat();

        let whole = extract_in_chunks(&stream, stream.len(), 1024);
        assert_eq!(
            whole,
            vec![
                frame_bytes(b"first"),
                frame_bytes(b"second"),
                frame_bytes(&[0xFF, 0x00, 0xFF]),
            ]
        );

        for size in 1..stream.len() {
            assert_eq!(extract_in_chunks(&stream, size, 1024), whole, "chunk size {size}");
        }
    }

    #[test]
    fn frames_carry_markers_only_at_boundaries() {
        let stream = [
            frame_bytes(b"one"),
            S.to_vec(),
            frame_bytes(b"two"),
            b"noise".to_vec(),
            E.to_vec(),
            frame_bytes(b"three"),
        ]
        .concat();

        let frames = extract_in_chunks(&stream, 5, 1024);
        assert_eq!(frames.len(), 3);
        for frame in frames {
            assert!(frame.starts_with(&S));
            assert!(frame.ends_with(&E));
            let inner = &frame[S.len()..frame.len() - E.len()];
            assert!(find(inner, &S).is_none());
            assert!(find(inner, &E).is_none());
        }
    }

    #[test]
    fn end_marker_before_start_is_ignored() {
        let stream = [E.to_vec(), b"xx".to_vec(), frame_bytes(b"ok")].concat();
        assert_eq!(extract_in_chunks(&stream, 1, 1024), vec![frame_bytes(b"ok")]);
    }

    #[test]
    fn stream_without_start_marker_stays_bounded() {
        let mut extractor = FrameExtractor::new(Delimiters::jpeg(), 1024);
        let chunk = [0xAB_u8; READ_CHUNK_SIZE];

        for _ in 0..1000 {
            extractor.push(&chunk);
            assert!(extractor.next_frame().is_none());
            assert!(extractor.buffered() < S.len());
        }
        assert_eq!(
            extractor.bytes_discarded(),
            1000 * READ_CHUNK_SIZE as u64 - extractor.buffered() as u64
        );
    }

    #[test]
    fn start_marker_split_across_chunks_survives_truncation() {
        let frames = extract_all(&[b"zzzz\xFF", b"\xD8abc\xFF\xD9"], 1024);
        assert_eq!(frames, vec![frame_bytes(b"abc")]);
    }

    #[test]
    fn never_ending_frame_stays_bounded_and_resyncs() {
        let max = 256;
        let mut extractor = FrameExtractor::new(Delimiters::jpeg(), max);
        extractor.push(&S);

        for _ in 0..100 {
            extractor.push(&[0x11; 64]);
            assert!(extractor.next_frame().is_none());
            assert!(extractor.buffered() <= max + 64);
        }

        extractor.push(&frame_bytes(b"after"));
        let frame = extractor.next_frame().expect("frame after resync");
        assert_eq!(frame.data.as_ref(), frame_bytes(b"after").as_slice());
    }

    #[test]
    fn oversized_frame_is_dropped() {
        let big = vec![0x42; 100];
        let stream = [frame_bytes(&big), frame_bytes(b"small")].concat();

        for size in [1, 7, stream.len()] {
            assert_eq!(extract_in_chunks(&stream, size, 64), vec![frame_bytes(b"small")]);
        }
    }

    #[test]
    fn sequence_numbers_increase() {
        let mut extractor = FrameExtractor::new(Delimiters::jpeg(), 1024);
        extractor.push(&[frame_bytes(b"a"), frame_bytes(b"b")].concat());

        assert_eq!(extractor.next_frame().unwrap().sequence, 1);
        assert_eq!(extractor.next_frame().unwrap().sequence, 2);
        assert_eq!(extractor.frames_emitted(), 2);
    }

    #[test]
    fn custom_text_markers() {
        let mut extractor = FrameExtractor::new(Delimiters::new(*b"<f>", *b"</f>").unwrap(), 1024);
        extractor.push(b"..<f>hello</f><f>wor");
        assert_eq!(extractor.next_frame().unwrap().data.as_ref(), b"<f>hello</f>");
        assert!(extractor.next_frame().is_none());

        extractor.push(b"ld</f>");
        assert_eq!(extractor.next_frame().unwrap().data.as_ref(), b"<f>world</f>");
    }

    #[test]
    fn empty_markers_are_rejected() {
        assert!(matches!(
            Delimiters::new(Vec::new(), E),
            Err(RelayError::InvalidConfig(_))
        ));
        assert!(Delimiters::new(S, Vec::<u8>::new()).is_err());
    }

    #[test]
    fn end_search_resumes_where_it_left_off() {
        let mut extractor = FrameExtractor::new(Delimiters::jpeg(), DEFAULT_MAX_FRAME_LEN);
        extractor.push(&S);
        let chunk = [0x11_u8; READ_CHUNK_SIZE];

        for _ in 0..16 {
            extractor.push(&chunk);
            assert!(extractor.next_frame().is_none());
            assert_eq!(extractor.end_scanned, extractor.buffered() - (E.len() - 1));
        }

        // End marker split over two pushes right at the resume point
        extractor.push(&E[..1]);
        assert!(extractor.next_frame().is_none());
        extractor.push(&E[1..]);
        let frame = extractor.next_frame().unwrap();
        assert_eq!(frame.len(), S.len() + 16 * READ_CHUNK_SIZE + E.len());
        assert_eq!(extractor.end_scanned, 0);
    }

    #[test]
    fn large_frame_in_small_reads_is_linear() {
        let payload = vec![0x42_u8; 4 * 1024 * 1024];
        let stream = [frame_bytes(&payload), frame_bytes(b"next")].concat();

        let started = std::time::Instant::now();
        let frames = extract_in_chunks(&stream, READ_CHUNK_SIZE, DEFAULT_MAX_FRAME_LEN);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].len(), payload.len() + S.len() + E.len());
        assert!(
            started.elapsed() < std::time::Duration::from_secs(5),
            "{:?}",
            started.elapsed()
        );
    }

    #[tokio::test]
    async fn reader_ends_at_eof_without_partial_frame() {
        let stream = [frame_bytes(b"AAA"), S.to_vec(), b"partial".to_vec()].concat();
        let extractor = FrameExtractor::new(Delimiters::jpeg(), 1024);
        let mut reader = FrameReader::new(&stream[..], extractor);

        let frame = reader.next_frame().await.unwrap().unwrap();
        assert_eq!(frame.data.as_ref(), frame_bytes(b"AAA").as_slice());
        assert!(reader.next_frame().await.unwrap().is_none());
        assert!(reader.next_frame().await.unwrap().is_none());
        assert_eq!(reader.bytes_read(), stream.len() as u64);
    }

    #[tokio::test]
    async fn reader_error_is_terminal() {
        let mock = tokio_test::io::Builder::new()
            .read(&frame_bytes(b"ok"))
            .read(&[0xFF, 0xD8, 0x01])
            .read_error(io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed"))
            .build();
        let mut reader = FrameReader::new(mock, FrameExtractor::new(Delimiters::jpeg(), 1024));

        assert!(reader.next_frame().await.unwrap().is_some());
        assert!(matches!(
            reader.next_frame().await,
            Err(RelayError::Read(_))
        ));
        assert!(reader.next_frame().await.unwrap().is_none());
    }
}
