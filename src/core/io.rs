//! Purpose: Narrow byte source/sink contract consumed by the record interpreter.
//! Exports: `ByteSource`, `ByteSink`, `SliceSource`, `ReadSource`, `WriteSink`.
//! Role: The only I/O seam of the core; real file/stream handling lives with the caller.
//! Invariants: Reads are all-or-nothing; a short read is `Truncated`, never a partial buffer.
//! Invariants: Cursor-relative only; no seeking.
use std::io::{Read, Write};

use crate::core::error::{Error, ErrorKind};

const READ_CHUNK: usize = 64 * 1024;

pub trait ByteSource {
    fn read_exactly(&mut self, n: usize) -> Result<Vec<u8>, Error>;

    /// Bytes left before the end of the source, when the source knows it.
    fn remaining(&self) -> Option<usize> {
        None
    }
}

pub trait ByteSink {
    fn write_exactly(&mut self, bytes: &[u8]) -> Result<(), Error>;
}

#[derive(Debug)]
pub struct SliceSource<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> SliceSource<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }
}

impl ByteSource for SliceSource<'_> {
    fn read_exactly(&mut self, n: usize) -> Result<Vec<u8>, Error> {
        let left = self.buf.len() - self.pos;
        if n > left {
            return Err(Error::new(ErrorKind::Truncated)
                .with_message(format!("need {n} bytes, {left} remain"))
                .with_offset(self.pos as u64));
        }
        let out = self.buf[self.pos..self.pos + n].to_vec();
        self.pos += n;
        Ok(out)
    }

    fn remaining(&self) -> Option<usize> {
        Some(self.buf.len() - self.pos)
    }
}

/// Adapts any `std::io::Read` (files, sockets) into a `ByteSource`.
#[derive(Debug)]
pub struct ReadSource<R> {
    inner: R,
    consumed: u64,
}

impl<R: Read> ReadSource<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, consumed: 0 }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read> ByteSource for ReadSource<R> {
    fn read_exactly(&mut self, n: usize) -> Result<Vec<u8>, Error> {
        // Lengths come from record data; grow with the bytes that actually arrive.
        let mut buf = Vec::with_capacity(n.min(READ_CHUNK));
        let read = (&mut self.inner)
            .take(n as u64)
            .read_to_end(&mut buf)
            .map_err(|err| {
                Error::new(ErrorKind::Io)
                    .with_message("read failed")
                    .with_offset(self.consumed)
                    .with_source(err)
            })?;
        if read < n {
            return Err(Error::new(ErrorKind::Truncated)
                .with_message(format!("need {n} bytes, stream ended after {read}"))
                .with_offset(self.consumed));
        }
        self.consumed += n as u64;
        Ok(buf)
    }
}

impl ByteSink for Vec<u8> {
    fn write_exactly(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.extend_from_slice(bytes);
        Ok(())
    }
}

#[derive(Debug)]
pub struct WriteSink<W> {
    inner: W,
}

impl<W: Write> WriteSink<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> ByteSink for WriteSink<W> {
    fn write_exactly(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.inner.write_all(bytes).map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("write failed")
                .with_source(err)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{ByteSink, ByteSource, ReadSource, SliceSource, WriteSink};
    use crate::core::error::ErrorKind;

    #[test]
    fn slice_source_tracks_remaining() {
        let mut src = SliceSource::new(b"abcdef");
        assert_eq!(src.read_exactly(2).expect("read"), b"ab");
        assert_eq!(src.remaining(), Some(4));
        assert_eq!(src.position(), 2);
        assert_eq!(src.read_exactly(0).expect("empty read"), b"");
    }

    #[test]
    fn short_slice_read_is_truncated_and_consumes_nothing() {
        let mut src = SliceSource::new(b"abc");
        let err = src.read_exactly(4).expect_err("short");
        assert_eq!(err.kind(), ErrorKind::Truncated);
        assert_eq!(err.offset(), Some(0));
        assert_eq!(src.remaining(), Some(3));
    }

    #[test]
    fn read_source_maps_eof_to_truncated() {
        let mut src = ReadSource::new(&b"xy"[..]);
        assert_eq!(src.remaining(), None);
        let err = src.read_exactly(3).expect_err("eof");
        assert_eq!(err.kind(), ErrorKind::Truncated);
    }

    #[test]
    fn huge_stream_read_is_truncated_not_preallocated() {
        let mut src = ReadSource::new(&b"xy"[..]);
        let err = src.read_exactly(usize::MAX / 2).expect_err("huge");
        assert_eq!(err.kind(), ErrorKind::Truncated);
        assert_eq!(err.offset(), Some(0));
        assert!(err.to_string().contains("after 2"), "{err}");
    }

    #[test]
    fn sinks_append_bytes() {
        let mut vec_sink = Vec::new();
        vec_sink.write_exactly(b"12").expect("vec write");
        assert_eq!(vec_sink, b"12");

        let mut sink = WriteSink::new(Vec::new());
        sink.write_exactly(b"34").expect("write");
        assert_eq!(sink.into_inner(), b"34");
    }
}
