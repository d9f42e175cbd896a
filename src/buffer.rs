//! Buffers used for request bodies and response output.
//!
//! The [`Channel`] holds a list of output buffers, written to by the worker
//! thread executing a [`Task`] and drained by the reactor thread sending the
//! bytes to the socket. To avoid unbounded memory growth the bytes
//! are kept in memory up to a limit, after which they're moved to an anonymous
//! temporary file, see [`OverflowableBuffer`].
//!
//! [`Channel`]: crate::Channel
//! [`Task`]: crate::Task

use std::borrow::Cow;
use std::cmp::min;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::{fmt, mem};

/// Common operations on a buffer of bytes waiting to be consumed.
pub trait Buffer {
    /// Returns the number of bytes still buffered.
    ///
    /// This is always a `u64`, even on 32 bit platforms, as file backed
    /// buffers can hold more than `usize::MAX` bytes.
    fn len(&self) -> u64;

    /// Returns `true` if the buffer holds no bytes.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns up to `n` bytes from the front of the buffer *without*
    /// consuming them.
    ///
    /// Use [`Buffer::skip`] to consume the bytes once they're processed, e.g.
    /// after they're accepted by the socket.
    fn get(&mut self, n: usize) -> io::Result<Cow<'_, [u8]>>;

    /// Consume `n` bytes from the front of the buffer.
    ///
    /// Returns an error if `n` is larger than [`Buffer::len`].
    fn skip(&mut self, n: u64) -> io::Result<()>;

    /// Release the backing storage.
    ///
    /// Calling this more than once is fine, it does nothing after the first
    /// call.
    fn close(&mut self) -> io::Result<()>;
}

/// Buffer that holds bytes in memory up to a limit, after which it overflows
/// into a temporary file.
///
/// Overflowing is transparent to the user, no errors are returned for it.
/// Once all bytes in a file backed buffer are consumed it switches back to
/// memory.
pub struct OverflowableBuffer {
    /// Maximum number of bytes kept in memory.
    overflow: u64,
    storage: Storage,
}

enum Storage {
    /// Bytes in `bytes[start..]` are not yet consumed.
    Memory { bytes: Vec<u8>, start: usize },
    File(TempFile),
    Closed,
}

impl OverflowableBuffer {
    /// Create a new buffer that keeps at most `overflow` bytes in memory.
    pub const fn new(overflow: u64) -> OverflowableBuffer {
        OverflowableBuffer {
            overflow,
            storage: Storage::Memory {
                bytes: Vec::new(),
                start: 0,
            },
        }
    }

    /// Returns `true` if the bytes are stored in a temporary file.
    pub fn is_overflowed(&self) -> bool {
        matches!(self.storage, Storage::File(..))
    }

    /// Append `data` to the end of the buffer.
    ///
    /// Once the buffered bytes would exceed the overflow limit all bytes are
    /// moved into a temporary file.
    pub fn append(&mut self, data: &[u8]) -> io::Result<()> {
        if data.is_empty() {
            return Ok(());
        }

        let spill = match &mut self.storage {
            Storage::Memory { bytes, start } => {
                let buffered = (bytes.len() - *start) as u64;
                if buffered + data.len() as u64 > self.overflow {
                    let mut file = TempFile::new()?;
                    file.append(&bytes[*start..])?;
                    file.append(data)?;
                    Some(file)
                } else {
                    // Reclaim consumed bytes before growing the allocation.
                    if *start != 0 && *start >= bytes.len() / 2 {
                        drop(bytes.drain(..*start));
                        *start = 0;
                    }
                    bytes.extend_from_slice(data);
                    None
                }
            }
            Storage::File(file) => {
                file.append(data)?;
                None
            }
            Storage::Closed => return Err(closed()),
        };

        if let Some(file) = spill {
            self.storage = Storage::File(file);
        }
        Ok(())
    }
}

impl Buffer for OverflowableBuffer {
    fn len(&self) -> u64 {
        match &self.storage {
            Storage::Memory { bytes, start } => (bytes.len() - start) as u64,
            Storage::File(file) => file.len(),
            Storage::Closed => 0,
        }
    }

    fn get(&mut self, n: usize) -> io::Result<Cow<'_, [u8]>> {
        match &mut self.storage {
            Storage::Memory { bytes, start } => {
                let end = min(*start + n, bytes.len());
                Ok(Cow::Borrowed(&bytes[*start..end]))
            }
            Storage::File(file) => file.get(n).map(Cow::Owned),
            Storage::Closed => Ok(Cow::Borrowed(&[])),
        }
    }

    fn skip(&mut self, n: u64) -> io::Result<()> {
        if n > self.len() {
            return Err(skip_past_end(n, self.len()));
        }

        match &mut self.storage {
            Storage::Memory { bytes, start } => {
                // `n <= len <= usize::MAX` for in-memory bytes.
                *start += n as usize;
                if *start == bytes.len() {
                    bytes.clear();
                    *start = 0;
                }
            }
            Storage::File(file) => {
                file.read_pos += n;
                if file.len() == 0 {
                    // Everything is consumed, go back to memory.
                    self.storage = Storage::Memory {
                        bytes: Vec::new(),
                        start: 0,
                    };
                }
            }
            Storage::Closed => {}
        }
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        match mem::replace(&mut self.storage, Storage::Closed) {
            // Dropping the file removes it, it was never linked.
            Storage::File(file) => {
                drop(file);
                Ok(())
            }
            Storage::Memory { .. } | Storage::Closed => Ok(()),
        }
    }
}

/// Reading consumes the bytes from the buffer, used for the request body.
impl Read for OverflowableBuffer {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = {
            let bytes = self.get(buf.len())?;
            let n = bytes.len();
            buf[..n].copy_from_slice(&bytes);
            n
        };
        self.skip(n as u64)?;
        Ok(n)
    }
}

impl fmt::Debug for OverflowableBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OverflowableBuffer")
            .field("overflow", &self.overflow)
            .field("overflowed", &self.is_overflowed())
            .field("len", &self.len())
            .finish()
    }
}

/// Anonymous temporary file, written at `write_pos` and read at `read_pos`.
struct TempFile {
    file: File,
    read_pos: u64,
    write_pos: u64,
}

impl TempFile {
    fn new() -> io::Result<TempFile> {
        Ok(TempFile {
            file: tempfile::tempfile()?,
            read_pos: 0,
            write_pos: 0,
        })
    }

    const fn len(&self) -> u64 {
        self.write_pos - self.read_pos
    }

    fn append(&mut self, data: &[u8]) -> io::Result<()> {
        let _ = self.file.seek(SeekFrom::Start(self.write_pos))?;
        self.file.write_all(data)?;
        self.write_pos += data.len() as u64;
        Ok(())
    }

    fn get(&mut self, n: usize) -> io::Result<Vec<u8>> {
        let n = min(n as u64, self.len()) as usize;
        let mut buf = vec![0; n];
        let _ = self.file.seek(SeekFrom::Start(self.read_pos))?;
        self.file.read_exact(&mut buf)?;
        Ok(buf)
    }
}

/// Anything that can be read and seeked, used by [`FileWrapper`].
pub trait FileLike: Read + Seek + Send {}

impl<T: Read + Seek + Send> FileLike for T {}

/// Wrapper around a file (or file-like type) returned as response body.
///
/// See [`Environ::file_wrapper`]. When returned by an application the
/// connection sends the file's bytes directly, without copying them into the
/// output buffers first.
///
/// [`Environ::file_wrapper`]: crate::Environ::file_wrapper
pub struct FileWrapper {
    file: Option<Box<dyn FileLike>>,
    block_size: usize,
    /// Number of bytes left to send.
    remain: u64,
}

impl FileWrapper {
    /// Default block size used when iterating over the file.
    pub const DEFAULT_BLOCK_SIZE: usize = 32768;

    /// Wrap `file`, sending it from its current position to the end.
    pub fn new<F>(file: F) -> FileWrapper
    where
        F: Read + Seek + Send + 'static,
    {
        FileWrapper::with_block_size(file, FileWrapper::DEFAULT_BLOCK_SIZE)
    }

    /// Wrap `file`, reading it in blocks of `block_size` bytes if the file
    /// can't be sent as a whole.
    pub fn with_block_size<F>(file: F, block_size: usize) -> FileWrapper
    where
        F: Read + Seek + Send + 'static,
    {
        assert!(block_size != 0, "can't use a block size of zero");
        FileWrapper {
            file: Some(Box::new(file)),
            block_size,
            remain: 0,
        }
    }

    /// Returns the block size.
    pub const fn block_size(&self) -> usize {
        self.block_size
    }

    /// Determine the number of bytes to send: from the current position to the
    /// end of the file, but at most `size` bytes (if provided).
    pub fn prepare(&mut self, size: Option<u64>) -> io::Result<u64> {
        let file = self.file.as_mut().ok_or_else(closed)?;
        let start = file.stream_position()?;
        let end = file.seek(SeekFrom::End(0))?;
        let _ = file.seek(SeekFrom::Start(start))?;
        let available = end.saturating_sub(start);
        self.remain = match size {
            Some(size) => min(available, size),
            None => available,
        };
        Ok(self.remain)
    }

    /// Read the next block of bytes, returns `None` at the end of the file.
    ///
    /// Used when the file can't be handed to the connection as a whole.
    pub(crate) fn next_block(&mut self) -> io::Result<Option<Vec<u8>>> {
        let file = match self.file.as_mut() {
            Some(file) => file,
            None => return Ok(None),
        };
        let mut block = Vec::with_capacity(self.block_size);
        let n = file
            .by_ref()
            .take(self.block_size as u64)
            .read_to_end(&mut block)?;
        if n == 0 {
            Ok(None)
        } else {
            Ok(Some(block))
        }
    }
}

impl Buffer for FileWrapper {
    fn len(&self) -> u64 {
        self.remain
    }

    fn get(&mut self, n: usize) -> io::Result<Cow<'_, [u8]>> {
        let n = min(n as u64, self.remain) as usize;
        let file = self.file.as_mut().ok_or_else(closed)?;
        let mut buf = Vec::with_capacity(n);
        let read = file.by_ref().take(n as u64).read_to_end(&mut buf)?;
        if read == 0 && n != 0 {
            // File got shorter after `prepare`, we can't send what we promised.
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "file ended before all bytes were sent",
            ));
        }
        // Leave the position as it was, only `skip` consumes.
        let _ = file.seek(SeekFrom::Current(-(read as i64)))?;
        Ok(Cow::Owned(buf))
    }

    fn skip(&mut self, n: u64) -> io::Result<()> {
        if n > self.remain {
            return Err(skip_past_end(n, self.remain));
        }
        let file = self.file.as_mut().ok_or_else(closed)?;
        let _ = file.seek(SeekFrom::Current(n as i64))?;
        self.remain -= n;
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        self.remain = 0;
        drop(self.file.take());
        Ok(())
    }
}

impl fmt::Debug for FileWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileWrapper")
            .field("closed", &self.file.is_none())
            .field("block_size", &self.block_size)
            .field("remain", &self.remain)
            .finish()
    }
}

/// Segment of a connection's output.
#[derive(Debug)]
pub(crate) enum OutBuf {
    /// Bytes written by a task.
    Bytes(OverflowableBuffer),
    /// File returned by the application, sent as-is.
    File(FileWrapper),
}

impl OutBuf {
    /// Create a new, empty, bytes buffer.
    pub(crate) const fn new(overflow: u64) -> OutBuf {
        OutBuf::Bytes(OverflowableBuffer::new(overflow))
    }

    pub(crate) fn append(&mut self, data: &[u8]) -> io::Result<()> {
        match self {
            OutBuf::Bytes(buf) => buf.append(data),
            OutBuf::File(..) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "can't append to a file output buffer",
            )),
        }
    }
}

impl Buffer for OutBuf {
    fn len(&self) -> u64 {
        match self {
            OutBuf::Bytes(buf) => buf.len(),
            OutBuf::File(file) => file.len(),
        }
    }

    fn get(&mut self, n: usize) -> io::Result<Cow<'_, [u8]>> {
        match self {
            OutBuf::Bytes(buf) => buf.get(n),
            OutBuf::File(file) => file.get(n),
        }
    }

    fn skip(&mut self, n: u64) -> io::Result<()> {
        match self {
            OutBuf::Bytes(buf) => buf.skip(n),
            OutBuf::File(file) => file.skip(n),
        }
    }

    fn close(&mut self) -> io::Result<()> {
        match self {
            OutBuf::Bytes(buf) => buf.close(),
            OutBuf::File(file) => file.close(),
        }
    }
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::Other, "buffer is closed")
}

fn skip_past_end(n: u64, len: u64) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("can't skip {n} bytes, only {len} bytes buffered"),
    )
}
