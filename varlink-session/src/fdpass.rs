//! File descriptor passing over unix domain sockets.
//!
//! [`UnixConn`] wraps a [`UnixStream`] and carries descriptors out-of-band
//! via `SCM_RIGHTS` control messages. Descriptors queued with `pass_fds`
//! travel with the first `sendmsg` of the next message; descriptors
//! received during reads accumulate until `collect_fds` drains them.
//! Ownership of received descriptors transfers to the caller at
//! `collect_fds`; anything left unclaimed is closed with the connection.

use std::io;
use std::mem;
use std::net::Shutdown;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::Mutex;

/// man unix(7) documents this limit on Linux.
pub const SCM_MAX_FD: usize = 253;

pub struct UnixConn {
    stream: UnixStream,
    rfds: Mutex<Vec<RawFd>>,
    wfds: Mutex<Vec<RawFd>>,
}

impl UnixConn {
    pub fn new(stream: UnixStream) -> UnixConn {
        UnixConn {
            stream,
            rfds: Mutex::new(Vec::new()),
            wfds: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn stream(&self) -> &UnixStream {
        &self.stream
    }

    /// Queues descriptors to be attached to the next outgoing message.
    ///
    /// # Panics
    ///
    /// Panics if the queue would exceed [`SCM_MAX_FD`] descriptors.
    pub fn pass_fds(&self, fds: &[RawFd]) {
        let mut wfds = self.wfds.lock().unwrap();
        if wfds.len() + fds.len() > SCM_MAX_FD {
            panic!("programming error: cannot pass more than 253 file descriptors per message");
        }
        wfds.extend_from_slice(fds);
    }

    /// Drains and returns descriptors received during prior reads. The
    /// caller owns the returned descriptors.
    pub fn collect_fds(&self) -> Vec<RawFd> {
        mem::take(&mut *self.rfds.lock().unwrap())
    }

    /// Reads bytes; ancillary descriptors carried by the syscall are
    /// appended to the receive queue with `CLOEXEC` set.
    pub(crate) fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut rfds = self.rfds.lock().unwrap();
        let (n, fds) = recvmsg_fds(self.stream.as_raw_fd(), buf)?;
        rfds.extend(fds);
        Ok(n)
    }

    /// Writes bytes, attaching and clearing the send queue. On a
    /// multi-chunk write the descriptors ride on the first chunk only.
    pub(crate) fn send(&self, buf: &[u8]) -> io::Result<usize> {
        let mut wfds = self.wfds.lock().unwrap();
        let n = sendmsg_fds(self.stream.as_raw_fd(), buf, &wfds)?;
        wfds.clear();
        Ok(n)
    }

    pub(crate) fn shutdown(&self) -> io::Result<()> {
        self.stream.shutdown(Shutdown::Both)
    }

    pub(crate) fn try_clone(&self) -> io::Result<UnixConn> {
        Ok(UnixConn::new(self.stream.try_clone()?))
    }

    /// Closes every received descriptor that was never collected.
    pub(crate) fn close_received(&self) {
        let mut rfds = self.rfds.lock().unwrap();
        for fd in rfds.drain(..) {
            unsafe {
                let _ = libc::close(fd);
            }
        }
    }
}

impl AsRawFd for UnixConn {
    fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}

impl Drop for UnixConn {
    fn drop(&mut self) {
        self.close_received();
    }
}

/// Control message buffer sized for `CMSG_SPACE(SCM_MAX_FD * 4)`, aligned
/// for `cmsghdr`.
type CmsgSpace = [u64; 160];

fn recvmsg_fds(fd: RawFd, buf: &mut [u8]) -> io::Result<(usize, Vec<RawFd>)> {
    unsafe {
        let mut iov = libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut libc::c_void,
            iov_len: buf.len(),
        };
        let mut cmsgspace: CmsgSpace = [0; 160];
        let mut msg: libc::msghdr = mem::zeroed();
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = cmsgspace.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = mem::size_of::<CmsgSpace>();

        let n = loop {
            let n = libc::recvmsg(fd, &mut msg, libc::MSG_CMSG_CLOEXEC | libc::MSG_DONTWAIT);
            if n >= 0 {
                break n as usize;
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                // ENOBUFS is transient and needs the same retry as EINTR.
                Some(libc::EINTR) | Some(libc::ENOBUFS) => continue,
                _ => return Err(err),
            }
        };

        let mut fds = Vec::new();
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            let hdr = &*cmsg;
            if hdr.cmsg_level == libc::SOL_SOCKET && hdr.cmsg_type == libc::SCM_RIGHTS {
                let count =
                    (hdr.cmsg_len as usize - libc::CMSG_LEN(0) as usize) / mem::size_of::<RawFd>();
                let data = libc::CMSG_DATA(cmsg) as *const RawFd;
                for i in 0..count {
                    fds.push(*data.add(i));
                }
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }

        if msg.msg_flags & libc::MSG_CTRUNC != 0 {
            for fd in fds {
                let _ = libc::close(fd);
            }
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "truncated SCM_RIGHTS control message",
            ));
        }

        Ok((n, fds))
    }
}

fn sendmsg_fds(fd: RawFd, buf: &[u8], fds: &[RawFd]) -> io::Result<usize> {
    if fds.len() > SCM_MAX_FD {
        panic!("programming error: cannot pass more than 253 file descriptors per message");
    }
    unsafe {
        let mut iov = libc::iovec {
            iov_base: buf.as_ptr() as *mut libc::c_void,
            iov_len: buf.len(),
        };
        let mut cmsgspace: CmsgSpace = [0; 160];
        let mut msg: libc::msghdr = mem::zeroed();
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;

        if !fds.is_empty() {
            let payload = fds.len() * mem::size_of::<RawFd>();
            msg.msg_control = cmsgspace.as_mut_ptr() as *mut libc::c_void;
            msg.msg_controllen = libc::CMSG_SPACE(payload as u32) as usize;

            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = libc::CMSG_LEN(payload as u32) as usize;
            let data = libc::CMSG_DATA(cmsg) as *mut RawFd;
            for (i, fd) in fds.iter().enumerate() {
                *data.add(i) = *fd;
            }
        }

        loop {
            let n = libc::sendmsg(fd, &msg, libc::MSG_DONTWAIT | libc::MSG_NOSIGNAL);
            if n >= 0 {
                return Ok(n as usize);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) | Some(libc::ENOBUFS) => continue,
                _ => return Err(err),
            }
        }
    }
}
