//! Framed byte buffers.
//!
//! Two flavors:
//!
//! - [`ByteBuffer`]: a growable in-memory buffer used to accumulate request,
//!   response, and export payloads before they are framed onto a channel.
//! - [`FileBuffer`]: a `memfd`-backed buffer used for the worker→proxy sync
//!   export; large enough that holding it in a process's heap for the
//!   ancillary-FD handoff would be wasteful, and it must be mappable by the
//!   receiving process.
//!
//! Both are wrapped by the size-prefix framing used on every worker↔proxy
//! channel: a 4-byte little-endian length, followed by that many
//! bytes of payload.

use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum single-frame payload size accepted off the wire. Guards against a
/// corrupt or hostile length prefix causing an unbounded allocation.
pub const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

/// A growable, cursor-free byte accumulator.
///
/// Unlike `Vec<u8>` used directly, `ByteBuffer` exists as a named type so
/// that the places that build up a request/response/export payload read the
/// same way the wire framing reads: push bytes, then frame once at the end.
#[derive(Debug, Default, Clone)]
pub struct ByteBuffer {
    data: Vec<u8>,
}

impl ByteBuffer {
    pub fn new() -> Self {
        Self { data: Vec::new() }
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self { data: Vec::with_capacity(cap) }
    }

    pub fn push_bytes(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Push a single `KEY=VALUE\0` property, the udev re-export unit.
    pub fn push_property(&mut self, key: &str, value: &str) {
        self.data.extend_from_slice(key.as_bytes());
        self.data.push(b'=');
        self.data.extend_from_slice(value.as_bytes());
        self.data.push(0);
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Split the buffer on NUL bytes, yielding `KEY=VALUE` strings (lossy on
    /// non-UTF8, which should not occur in practice for udev properties).
    pub fn iter_properties(&self) -> impl Iterator<Item = &str> {
        self.data
            .split(|&b| b == 0)
            .filter(|chunk| !chunk.is_empty())
            .filter_map(|chunk| std::str::from_utf8(chunk).ok())
    }
}

/// Read one size-prefixed frame from an async reader. Returns `Ok(None)` on
/// clean EOF before any bytes of the length prefix arrive (peer closed).
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match r.read_exact(&mut len_buf).await {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_le_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame length {len} exceeds maximum {MAX_FRAME_LEN}"),
        ));
    }
    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

/// Write one size-prefixed frame to an async writer.
pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, payload: &[u8]) -> io::Result<()> {
    if payload.len() as u64 > MAX_FRAME_LEN as u64 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "payload exceeds MAX_FRAME_LEN",
        ));
    }
    let len = (payload.len() as u32).to_le_bytes();
    w.write_all(&len).await?;
    w.write_all(payload).await?;
    w.flush().await
}

/// A `memfd`-backed buffer. Created empty and growable (`ftruncate`) by the
/// writer, handed to the peer as a raw FD over `SCM_RIGHTS`, then `mmap`ed
/// read-only by the receiver.
pub mod file {
    use memmap2::{Mmap, MmapMut};
    use nix::sys::memfd::{memfd_create, MemFdCreateFlag};
    use nix::unistd::ftruncate;
    use std::io::{self, Write};
    use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};

    /// A writable `memfd` export buffer, owned by the sender until the
    /// ancillary-FD send returns.
    pub struct FileBuffer {
        fd: OwnedFd,
        len: u64,
    }

    impl FileBuffer {
        /// Create a new, empty anonymous memfd.
        pub fn create(name: &str) -> io::Result<Self> {
            let fd = memfd_create(name, MemFdCreateFlag::MFD_CLOEXEC)
                .map_err(|e| io::Error::from_raw_os_error(e as i32))?;
            Ok(Self { fd, len: 0 })
        }

        /// Append bytes, growing the underlying file as needed.
        pub fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
            let new_len = self.len + bytes.len() as u64;
            ftruncate(self.fd.as_fd(), new_len as i64)
                .map_err(|e| io::Error::from_raw_os_error(e as i32))?;
            let mut mmap = unsafe {
                MmapMut::map_mut(self.fd.as_raw_fd())
                    .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
            };
            (&mut mmap[self.len as usize..new_len as usize]).write_all(bytes)?;
            mmap.flush()?;
            self.len = new_len;
            Ok(())
        }

        pub fn len(&self) -> u64 {
            self.len
        }

        pub fn as_raw_fd(&self) -> RawFd {
            self.fd.as_raw_fd()
        }

        /// Hand the underlying FD to the caller, e.g. to pass via
        /// `sendmsg`/`SCM_RIGHTS`. Consumes `self`: after this call the
        /// buffer is the receiver's to close.
        pub fn into_owned_fd(self) -> OwnedFd {
            self.fd
        }
    }

    /// A read-only mapping of a received memfd, used by the proxy to walk
    /// the sync export records.
    pub struct MappedFile {
        map: Mmap,
    }

    impl MappedFile {
        pub fn from_fd(fd: OwnedFd) -> io::Result<Self> {
            let map = unsafe {
                Mmap::map(fd.as_raw_fd()).map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
            };
            Ok(Self { map })
        }

        pub fn as_slice(&self) -> &[u8] {
            &self.map
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_buffer_properties_round_trip() {
        let mut buf = ByteBuffer::new();
        buf.push_property("ACTION", "add");
        buf.push_property("DEVPATH", "/block/sda");
        let props: Vec<&str> = buf.iter_properties().collect();
        assert_eq!(props, vec!["ACTION=add", "DEVPATH=/block/sda"]);
    }

    #[tokio::test]
    async fn frame_round_trip() {
        let mut chan = tokio::io::duplex(4096);
        write_frame(&mut chan.0, b"hello").await.unwrap();
        let got = read_frame(&mut chan.1).await.unwrap().unwrap();
        assert_eq!(got, b"hello");
    }

    #[tokio::test]
    async fn frame_eof_returns_none() {
        let mut chan = tokio::io::duplex(4096);
        drop(chan.0);
        let got = read_frame(&mut chan.1).await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn oversized_frame_rejected() {
        let mut chan = tokio::io::duplex(16);
        let huge = (MAX_FRAME_LEN + 1).to_le_bytes();
        use tokio::io::AsyncWriteExt;
        chan.0.write_all(&huge).await.unwrap();
        let err = read_frame(&mut chan.1).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }
}
