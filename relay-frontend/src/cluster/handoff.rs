//! Master → worker connection handoff over a `SOCK_SEQPACKET` socketpair.
//!
//! Each handoff is a single packet: the JSON [`HandoffMessage`] as payload
//! and the client's TCP descriptor attached as `SCM_RIGHTS` ancillary data.
//! Packet boundaries are preserved by the socket type, so no extra framing
//! is needed and a descriptor can never be paired with the wrong message.
//!
//! The kernel duplicates the descriptor into the receiving process; the
//! master closes its own copy as soon as `send` returns.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use tokio::io::unix::AsyncFd;

use crate::protocol::HandoffMessage;

/// Largest handoff packet accepted (16 KiB of sniffed bytes is ~22 KiB as
/// base64 JSON).
const MAX_PACKET: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum HandoffError {
    #[error("handoff socket I/O: {0}")]
    Io(#[from] io::Error),
    #[error("handoff message could not be encoded or decoded: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("handoff channel closed by peer")]
    Closed,
    #[error("handoff packet truncated")]
    Truncated,
    #[error("handoff packet carried no descriptor")]
    MissingDescriptor,
}

/// One end of a master/worker handoff link.
pub struct HandoffChannel {
    fd: AsyncFd<OwnedFd>,
}

impl HandoffChannel {
    /// Wrap a socketpair end. Must be called inside a tokio runtime.
    pub fn new(fd: OwnedFd) -> io::Result<Self> {
        set_nonblocking(fd.as_raw_fd())?;
        Ok(Self { fd: AsyncFd::new(fd)? })
    }

    /// Adopt the descriptor a worker inherited from the master.
    ///
    /// # Safety
    ///
    /// `raw` must be an open socketpair end owned by nothing else in this
    /// process.
    pub unsafe fn from_inherited(raw: RawFd) -> io::Result<Self> {
        // SAFETY: ownership is asserted by the caller.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };
        set_cloexec(fd.as_raw_fd(), true)?;
        Self::new(fd)
    }

    /// Send a handoff message together with `conn`'s descriptor.
    pub async fn send(&self, message: &HandoffMessage, conn: &impl AsRawFd) -> Result<(), HandoffError> {
        let payload = serde_json::to_vec(message)?;
        if payload.len() > MAX_PACKET {
            return Err(HandoffError::Truncated);
        }
        loop {
            let mut guard = self.fd.writable().await?;
            match guard.try_io(|inner| send_with_fd(inner.get_ref().as_raw_fd(), &payload, conn.as_raw_fd())) {
                Ok(result) => return result.map_err(HandoffError::Io),
                Err(_would_block) => continue,
            }
        }
    }

    /// Receive the next handoff message and the descriptor sent with it.
    pub async fn recv(&self) -> Result<(HandoffMessage, OwnedFd), HandoffError> {
        let mut buf = vec![0u8; MAX_PACKET];
        let (len, fd) = loop {
            let mut guard = self.fd.readable().await?;
            match guard.try_io(|inner| recv_with_fd(inner.get_ref().as_raw_fd(), &mut buf)) {
                Ok(result) => break result?,
                Err(_would_block) => continue,
            }
        };
        if len == 0 && fd.is_none() {
            return Err(HandoffError::Closed);
        }
        let fd = fd.ok_or(HandoffError::MissingDescriptor)?;
        let message = serde_json::from_slice(&buf[..len])?;
        Ok((message, fd))
    }
}

/// Create a connected `SOCK_SEQPACKET` pair, both ends close-on-exec.
pub fn socketpair() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as libc::c_int; 2];
    // SAFETY: `fds` is a valid two-element buffer for the kernel to fill.
    let rc = unsafe {
        libc::socketpair(
            libc::AF_UNIX,
            libc::SOCK_SEQPACKET | libc::SOCK_CLOEXEC,
            0,
            fds.as_mut_ptr(),
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: socketpair succeeded, so both descriptors are open and unowned.
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

/// Toggle `FD_CLOEXEC`. Cleared on the worker's end right before spawning so
/// the descriptor survives `exec`.
pub fn set_cloexec(fd: RawFd, on: bool) -> io::Result<()> {
    // SAFETY: fcntl on a descriptor we hold has no memory-safety preconditions.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let flags = if on { flags | libc::FD_CLOEXEC } else { flags & !libc::FD_CLOEXEC };
    // SAFETY: as above.
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    // SAFETY: fcntl on a descriptor we hold has no memory-safety preconditions.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: as above.
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Send `data` with `fd` attached via `sendmsg` + `SCM_RIGHTS`.
fn send_with_fd(sock: RawFd, data: &[u8], fd: RawFd) -> io::Result<()> {
    let fd_size = std::mem::size_of::<libc::c_int>();
    // SAFETY: CMSG_SPACE is a pure size computation.
    let cmsg_space = unsafe { libc::CMSG_SPACE(fd_size as u32) } as usize;
    let mut cmsg_buf = vec![0u8; cmsg_space];

    let mut iov = libc::iovec {
        iov_base: data.as_ptr() as *mut libc::c_void,
        iov_len: data.len(),
    };

    // SAFETY: msghdr is plain data; every field we rely on is set below.
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = cmsg_space as _;

    // SAFETY: msg_control points at a buffer sized by CMSG_SPACE for one fd,
    // so CMSG_FIRSTHDR is non-null and CMSG_DATA has room for a c_int.
    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(fd_size as u32) as _;
        std::ptr::write_unaligned(libc::CMSG_DATA(cmsg) as *mut libc::c_int, fd);
    }

    // MSG_NOSIGNAL: a dead worker must surface as EPIPE, not kill the master.
    // SAFETY: msg and the buffers it points to outlive the call.
    let n = unsafe { libc::sendmsg(sock, &msg, libc::MSG_NOSIGNAL) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    if n as usize != data.len() {
        return Err(io::Error::new(io::ErrorKind::WriteZero, "short handoff packet write"));
    }
    Ok(())
}

/// Receive one packet, returning its length and any attached descriptor.
fn recv_with_fd(sock: RawFd, buf: &mut [u8]) -> io::Result<(usize, Option<OwnedFd>)> {
    let fd_size = std::mem::size_of::<libc::c_int>();
    // SAFETY: CMSG_SPACE is a pure size computation.
    let cmsg_space = unsafe { libc::CMSG_SPACE(fd_size as u32) } as usize;
    let mut cmsg_buf = vec![0u8; cmsg_space * 4];

    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };

    // SAFETY: msghdr is plain data; every field we rely on is set below.
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = cmsg_buf.len() as _;

    // SAFETY: msg points at live buffers for the duration of the call.
    let n = unsafe { libc::recvmsg(sock, &mut msg, libc::MSG_CMSG_CLOEXEC) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }

    let mut received: Vec<OwnedFd> = Vec::new();
    // SAFETY: the kernel filled msg_control; walking it with the CMSG macros
    // stays within msg_controllen.
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let data = libc::CMSG_DATA(cmsg);
                let count = ((*cmsg).cmsg_len as usize - libc::CMSG_LEN(0) as usize) / fd_size;
                for i in 0..count {
                    let raw = std::ptr::read_unaligned(data.add(i * fd_size) as *const libc::c_int);
                    received.push(OwnedFd::from_raw_fd(raw));
                }
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }

    if msg.msg_flags & (libc::MSG_TRUNC | libc::MSG_CTRUNC) != 0 {
        // Dropping `received` closes anything that did arrive.
        return Err(io::Error::new(io::ErrorKind::InvalidData, "handoff packet truncated"));
    }

    // Exactly one descriptor is expected; extras are closed on drop.
    let fd = if received.is_empty() { None } else { Some(received.swap_remove(0)) };
    Ok((n as usize, fd))
}
