//! Positioned byte-range access to a backing stream.
//!
//! Every helper seeks before it reads or writes, so callers never depend on
//! where a previous operation left the cursor.

use std::io::{self, Read, Seek, SeekFrom, Write};

/// Total length of the stream in bytes.
pub(crate) fn stream_len<S: Seek>(stream: &mut S) -> io::Result<u64> {
    stream.seek(SeekFrom::End(0))
}

/// Read exactly `len` bytes starting at `offset`.
pub(crate) fn read_at<R: Read + Seek>(stream: &mut R, offset: u64, len: usize) -> io::Result<Vec<u8>> {
    stream.seek(SeekFrom::Start(offset))?;
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf)?;
    Ok(buf)
}

/// Write all of `bytes` starting at `offset`.
pub(crate) fn write_at<W: Write + Seek>(stream: &mut W, offset: u64, bytes: &[u8]) -> io::Result<()> {
    stream.seek(SeekFrom::Start(offset))?;
    stream.write_all(bytes)
}

/// Stream `len` bytes starting at `offset` of `src` into `dst` without
/// holding them in memory at once.
pub(crate) fn copy_range<R, W>(src: &mut R, offset: u64, len: u64, dst: &mut W) -> io::Result<()>
where
    R: Read + Seek,
    W: Write,
{
    src.seek(SeekFrom::Start(offset))?;
    let copied = io::copy(&mut src.by_ref().take(len), dst)?;
    if copied != len {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("expected {len} bytes at offset {offset}, found {copied}"),
        ));
    }
    Ok(())
}
