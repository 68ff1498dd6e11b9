// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The byte source the demuxer reads from, and the decrypt hook it calls.

use std::io::{Read, Seek, SeekFrom};

use crate::{Error, Offset, Result, ToU64};

/// Reference point for [`ByteSource::set_position`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekOrigin {
    /// Absolute offset from the start of the stream.
    Begin,
    /// Relative to the current position.
    Current,
}

/// Answer of [`ByteSource::check_available`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    /// The requested bytes can be read now.
    Ok,
    /// Fewer bytes than requested exist past the current position.
    Insufficient,
    /// A streaming source has not received the bytes yet. Retry later.
    NotReady,
    /// The position is at or past the end of the stream.
    EndOfStream,
}

/// A seekable, possibly streaming byte stream.
///
/// Every demuxer operation may block on `read` or `set_position`; the
/// implementation decides whether that is a local file or network I/O.
pub trait ByteSource {
    /// Read up to `buf.len()` bytes, returning how many were read. `Ok(0)` is end of stream.
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize>;

    fn set_position(&mut self, offset: i64, origin: SeekOrigin) -> std::io::Result<()>;

    fn position(&self) -> u64;

    /// Total size in bytes, as far as it is known.
    fn size(&self) -> u64;

    /// Whether `len` bytes from the current position can be read now.
    fn check_available(&mut self, len: u64) -> Availability {
        let remaining = self.size().saturating_sub(self.position());
        if remaining == 0 && len > 0 {
            Availability::EndOfStream
        } else if remaining < len {
            Availability::Insufficient
        } else {
            Availability::Ok
        }
    }

    fn is_streaming(&self) -> bool {
        false
    }
}

impl<S: ByteSource + ?Sized> ByteSource for &mut S {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        (**self).read(buf)
    }

    fn set_position(&mut self, offset: i64, origin: SeekOrigin) -> std::io::Result<()> {
        (**self).set_position(offset, origin)
    }

    fn position(&self) -> u64 {
        (**self).position()
    }

    fn size(&self) -> u64 {
        (**self).size()
    }

    fn check_available(&mut self, len: u64) -> Availability {
        (**self).check_available(len)
    }

    fn is_streaming(&self) -> bool {
        (**self).is_streaming()
    }
}

/// [`ByteSource`] over anything that is `Read + Seek`, such as a `File` or a `Cursor`.
#[derive(Debug)]
pub struct StreamSource<R> {
    inner: R,
    position: u64,
    size: u64,
    streaming: bool,
}

impl<R: Read + Seek> StreamSource<R> {
    pub fn new(mut inner: R) -> std::io::Result<Self> {
        let size = inner.seek(SeekFrom::End(0))?;
        inner.seek(SeekFrom::Start(0))?;
        Ok(Self { inner, position: 0, size, streaming: false })
    }

    /// Mark the source as streaming. Only changes what [`ByteSource::is_streaming`] reports.
    pub fn streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read + Seek> ByteSource for StreamSource<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.position += n.to_u64();
        Ok(n)
    }

    fn set_position(&mut self, offset: i64, origin: SeekOrigin) -> std::io::Result<()> {
        let target = match origin {
            SeekOrigin::Begin => u64::try_from(offset).ok(),
            SeekOrigin::Current => self.position.checked_add_signed(offset),
        };
        let target = target.ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "seek before start"))?;
        self.position = self.inner.seek(SeekFrom::Start(target))?;
        Ok(())
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn is_streaming(&self) -> bool {
        self.streaming
    }
}

/// Decrypt hook for protected tracks.
///
/// Called synchronously on the raw compressed bytes of each access unit
/// before they are handed out. A failure surfaces as [`Error::DrmFailure`].
pub trait Decryptor {
    fn decrypt(&mut self, data: &mut [u8]) -> std::io::Result<()>;
}

impl<F> Decryptor for F
where
    F: FnMut(&mut [u8]) -> std::io::Result<()>,
{
    fn decrypt(&mut self, data: &mut [u8]) -> std::io::Result<()> {
        self(data)
    }
}

/// Adapts a [`ByteSource`] to `std::io::Read` for the box readers, reporting
/// the absolute stream position as its offset.
pub(crate) struct SourceReader<'a, S: ?Sized> {
    source: &'a mut S,
}

impl<'a, S: ByteSource + ?Sized> SourceReader<'a, S> {
    pub(crate) fn new(source: &'a mut S) -> Self {
        Self { source }
    }
}

impl<S: ByteSource + ?Sized> Read for SourceReader<'_, S> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.source.read(buf)
    }
}

impl<S: ByteSource + ?Sized> Offset for SourceReader<'_, S> {
    fn offset(&self) -> u64 {
        self.source.position()
    }
}

/// Move to an absolute offset, skipping the call when already there.
pub(crate) fn seek_to<S: ByteSource + ?Sized>(source: &mut S, offset: u64) -> Result<()> {
    if source.position() != offset {
        source.set_position(i64::try_from(offset)?, SeekOrigin::Begin)?;
    }
    Ok(())
}

/// Fill `buf` from `offset`. A short read is [`Error::UnexpectedEOF`].
pub(crate) fn read_exact_at<S: ByteSource + ?Sized>(source: &mut S, offset: u64, buf: &mut [u8]) -> Result<()> {
    seek_to(source, offset)?;
    let mut filled = 0;
    while filled < buf.len() {
        match source.read(&mut buf[filled..])? {
            0 => return Err(Error::UnexpectedEOF),
            n => filled += n,
        }
    }
    Ok(())
}
