use std::{
    io::{Error, ErrorKind, Read, Result, Write},
    os::fd::AsFd,
};

use rustix::io::{pread, Errno};

/// Size of the buffer used when copying file contents out of an archive.
pub(crate) const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Reads at `offset` until `buf` is completely filled, retrying on EINTR.
///
/// Positioned reads leave the file's seek position alone, so any number of threads may call this
/// on the same file at the same time.
///
/// Returns an error with ErrorKind::UnexpectedEof if the file ends before the buffer is full.
pub(crate) fn pread_exact(fd: impl AsFd, buf: &mut [u8], mut offset: u64) -> Result<()> {
    let mut todo: &mut [u8] = buf;

    while !todo.is_empty() {
        match pread(&fd, todo, offset) {
            Ok(0) => return Err(Error::from(ErrorKind::UnexpectedEof)),
            Ok(n) => {
                todo = &mut todo[n..];
                offset += n as u64;
            }
            Err(Errno::INTR) => continue,
            Err(e) => return Err(e.into()),
        }
    }

    Ok(())
}

/// A [`Read`] over a byte range of a file, implemented with positioned reads.
///
/// Running out of file before the range is exhausted is reported as
/// ErrorKind::UnexpectedEof rather than as a short read.
#[derive(Debug)]
pub(crate) struct RangeReader<Fd: AsFd> {
    fd: Fd,
    offset: u64,
    remaining: u64,
}

impl<Fd: AsFd> RangeReader<Fd> {
    pub(crate) fn new(fd: Fd, offset: u64, len: u64) -> Self {
        Self {
            fd,
            offset,
            remaining: len,
        }
    }
}

impl<Fd: AsFd> Read for RangeReader<Fd> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let want = buf.len().min(usize::try_from(self.remaining).unwrap_or(usize::MAX));
        if want == 0 {
            return Ok(0);
        }
        loop {
            match pread(&self.fd, &mut buf[..want], self.offset) {
                Ok(0) => return Err(Error::from(ErrorKind::UnexpectedEof)),
                Ok(n) => {
                    self.offset += n as u64;
                    self.remaining -= n as u64;
                    return Ok(n);
                }
                Err(Errno::INTR) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Copies exactly `len` bytes starting at `offset` in `fd` into `writer`.
pub(crate) fn copy_range(
    fd: impl AsFd,
    offset: u64,
    len: u64,
    writer: &mut impl Write,
) -> Result<()> {
    let mut reader = RangeReader::new(fd, offset, len);
    let mut buf = vec![0u8; COPY_BUFFER_SIZE.min(len as usize).max(1)];

    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => return Ok(()),
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        writer.write_all(&buf[..n])?;
    }
}
