//! The worker↔proxy channel: layout, framing, and ancillary-FD transfer.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use nix::sys::socket::{self, ControlMessage, ControlMessageOwned, MsgFlags};
use nix::unistd;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixStream;

use crate::error::WorkerError;

/// How a worker's control channel was constructed. A pipe is one-directional
/// and cheaper; a socketpair is needed whenever ancillary-FD transfer
/// (`SCM_RIGHTS`) is required, since `pipe(2)` cannot carry control messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelSpec {
    Pipe,
    SocketPair,
}

/// Internal command tags carried as the first byte of every frame on a
/// worker↔proxy channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelTag {
    /// Keepalive / no-op, used to detect a wedged peer without sending data.
    Noop = 0,
    /// Cooperative yield: the sender is done for now but not finished.
    Yield = 1,
    /// A plain data frame follows.
    Data = 2,
    /// A data frame follows, accompanied by an ancillary FD (e.g. a memfd
    /// export buffer or an accepted client socket).
    DataExt = 3,
}

impl ChannelTag {
    fn from_byte(b: u8) -> Result<Self, WorkerError> {
        match b {
            0 => Ok(ChannelTag::Noop),
            1 => Ok(ChannelTag::Yield),
            2 => Ok(ChannelTag::Data),
            3 => Ok(ChannelTag::DataExt),
            _ => Err(WorkerError::Channel(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unknown channel tag {b}"),
            ))),
        }
    }
}

/// A worker's control channel, backed by a `UnixStream` (used for both the
/// `Pipe` and `SocketPair` specs here: a connected `AF_UNIX` socketpair
/// behaves as a duplex pipe and additionally supports `SCM_RIGHTS`, so it is
/// the one primitive this crate needs — see DESIGN.md for why a literal
/// `pipe(2)` isn't separately modeled).
pub struct WorkerChannel {
    stream: UnixStream,
}

impl WorkerChannel {
    pub fn new(stream: UnixStream) -> Self {
        Self { stream }
    }

    /// The raw fd backing this end of the channel, for callers that need to
    /// block on it directly (e.g. a synchronous `recv_with_fd_raw` while
    /// awaiting a one-shot worker's result).
    pub fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    /// Send a tagged frame with no ancillary data.
    pub async fn send(&mut self, tag: ChannelTag, payload: &[u8]) -> Result<(), WorkerError> {
        let mut framed = Vec::with_capacity(1 + payload.len());
        framed.push(tag as u8);
        framed.extend_from_slice(payload);
        crate::buffer::write_frame(&mut self.stream, &framed).await.map_err(WorkerError::Io)
    }

    /// Send a tagged frame plus one ancillary FD via `SCM_RIGHTS`
    /// (`DataExt`, e.g. handing over a memfd export buffer or an accepted
    /// client socket). The raw bytes of the frame are length-prefixed
    /// identically to [`Self::send`]; the FD travels out-of-band in the
    /// control message of the first `sendmsg` of that payload.
    pub fn send_with_fd(&self, payload: &[u8], fd: RawFd) -> Result<(), WorkerError> {
        send_with_fd_raw(self.stream.as_raw_fd(), payload, fd)
    }

    /// Receive a tag and payload, plus any ancillary FD that rode along
    /// with it.
    pub fn recv_with_fd(&self) -> Result<(ChannelTag, Vec<u8>, Option<OwnedFd>), WorkerError> {
        recv_with_fd_raw(self.stream.as_raw_fd())
    }
}

/// The `send_with_fd`/`recv_with_fd` bodies, lifted out to operate on a bare
/// [`RawFd`]: a forked worker child has no Tokio reactor to register a
/// [`tokio::net::UnixStream`] with — the child runs without the
/// inherited runtime — so it drives its end of the channel through these
/// directly rather than through a [`WorkerChannel`].
pub fn send_with_fd_raw(raw_fd: RawFd, payload: &[u8], fd: RawFd) -> Result<(), WorkerError> {
    let len = (payload.len() as u32 + 1).to_le_bytes();
    let mut framed = Vec::with_capacity(4 + 1 + payload.len());
    framed.extend_from_slice(&len);
    framed.push(ChannelTag::DataExt as u8);
    framed.extend_from_slice(payload);
    let iov = [std::io::IoSlice::new(&framed)];
    let cmsg = [ControlMessage::ScmRights(&[fd])];
    socket::sendmsg::<()>(raw_fd, &iov, &cmsg, MsgFlags::empty(), None).map_err(WorkerError::FdTransfer)?;
    Ok(())
}

pub fn recv_with_fd_raw(raw_fd: RawFd) -> Result<(ChannelTag, Vec<u8>, Option<OwnedFd>), WorkerError> {
    let mut len_buf = [0u8; 4];
    let mut cmsg_space = nix::cmsg_space!([RawFd; 1]);
    let mut iov = [std::io::IoSliceMut::new(&mut len_buf)];
    let msg = socket::recvmsg::<()>(raw_fd, &mut iov, Some(&mut cmsg_space), MsgFlags::empty())
        .map_err(WorkerError::FdTransfer)?;
    let len = u32::from_le_bytes(len_buf) as usize;
    let mut payload = vec![0u8; len];
    unistd::read(raw_fd, &mut payload)
        .map_err(|e| WorkerError::Io(std::io::Error::from_raw_os_error(e as i32)))?;
    let tag = ChannelTag::from_byte(payload[0])?;
    let body = payload[1..].to_vec();
    let fd = msg.cmsgs().ok().and_then(|mut cmsgs| {
        cmsgs.find_map(|c| match c {
            ControlMessageOwned::ScmRights(fds) => fds.into_iter().next(),
            _ => None,
        })
    });
    Ok((tag, body, fd.map(|raw| unsafe { OwnedFd::from_raw_fd_checked(raw) })))
}

/// Receive a plain tagged frame with no ancillary data.
pub async fn recv_tagged<R: AsyncRead + Unpin>(r: &mut R) -> Result<Option<(ChannelTag, Vec<u8>)>, WorkerError> {
    let Some(framed) = crate::buffer::read_frame(r).await.map_err(WorkerError::Io)? else {
        return Ok(None);
    };
    if framed.is_empty() {
        return Err(WorkerError::Channel(std::io::Error::new(std::io::ErrorKind::InvalidData, "empty frame")));
    }
    let tag = ChannelTag::from_byte(framed[0])?;
    Ok(Some((tag, framed[1..].to_vec())))
}

trait FromRawFdChecked {
    unsafe fn from_raw_fd_checked(raw: RawFd) -> OwnedFd;
}

impl FromRawFdChecked for OwnedFd {
    unsafe fn from_raw_fd_checked(raw: RawFd) -> OwnedFd {
        use std::os::fd::FromRawFd;
        OwnedFd::from_raw_fd(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_recv_round_trip_without_fd() {
        let (a, mut b) = UnixStream::pair().unwrap();
        let mut chan = WorkerChannel::new(a);
        chan.send(ChannelTag::Data, b"hello").await.unwrap();
        let (tag, body) = recv_tagged(&mut b).await.unwrap().unwrap();
        assert_eq!(tag, ChannelTag::Data);
        assert_eq!(body, b"hello");
    }

    #[test]
    fn tag_round_trips() {
        for tag in [ChannelTag::Noop, ChannelTag::Yield, ChannelTag::Data, ChannelTag::DataExt] {
            assert_eq!(ChannelTag::from_byte(tag as u8).unwrap(), tag);
        }
    }

    #[test]
    fn raw_fd_send_recv_carries_the_ancillary_fd() {
        let (a, b) = std::os::unix::net::UnixStream::pair().unwrap();
        let memfd = nix::sys::memfd::memfd_create("test", nix::sys::memfd::MemFdCreateFlag::empty()).unwrap();
        send_with_fd_raw(a.as_raw_fd(), b"payload", memfd.as_raw_fd()).unwrap();
        let (tag, body, fd) = recv_with_fd_raw(b.as_raw_fd()).unwrap();
        assert_eq!(tag, ChannelTag::DataExt);
        assert_eq!(body, b"payload");
        assert!(fd.is_some());
    }
}
