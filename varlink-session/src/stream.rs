//! Connections and listeners for the supported varlink address schemes.

use std::fs;
use std::io;
use std::mem;
use std::net::{Shutdown, TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;

use crate::{context, map_context};

use crate::error::*;
use crate::fdpass::UnixConn;
use crate::sync::Context;
use crate::Uri;

/// A connection to a varlink peer. Unix connections support file
/// descriptor passing; TCP connections reject it.
pub enum Stream {
    Tcp(TcpStream),
    Unix(UnixConn),
}

impl Stream {
    /// Dials the address described by `uri`.
    pub fn connect(uri: &Uri) -> Result<Stream> {
        match uri.scheme.as_str() {
            "tcp" => {
                let stream = TcpStream::connect(&uri.address).map_err(map_context!())?;
                Ok(Stream::Tcp(stream))
            }
            "unix" => {
                let stream = match uri.address.strip_prefix('@') {
                    Some(name) => connect_abstract(name).map_err(map_context!())?,
                    None => UnixStream::connect(&uri.address).map_err(map_context!())?,
                };
                Ok(Stream::Unix(UnixConn::new(stream)))
            }
            scheme => Err(context!(ErrorKind::UnsupportedScheme(scheme.to_string()))),
        }
    }

    pub(crate) fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => recv_retry(s.as_raw_fd(), buf),
            Stream::Unix(c) => c.recv(buf),
        }
    }

    pub(crate) fn send(&self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => send_retry(s.as_raw_fd(), buf),
            Stream::Unix(c) => c.send(buf),
        }
    }

    pub(crate) fn pass_fds(&self, fds: &[RawFd]) -> Result<()> {
        match self {
            Stream::Tcp(_) => Err(context!(ErrorKind::FdPassingNotSupported)),
            Stream::Unix(c) => {
                c.pass_fds(fds);
                Ok(())
            }
        }
    }

    pub(crate) fn collect_fds(&self) -> Vec<RawFd> {
        match self {
            Stream::Tcp(_) => Vec::new(),
            Stream::Unix(c) => c.collect_fds(),
        }
    }

    pub(crate) fn close_received_fds(&self) {
        if let Stream::Unix(c) = self {
            c.close_received();
        }
    }

    pub fn shutdown(&self) -> Result<()> {
        match self {
            Stream::Tcp(s) => s.shutdown(Shutdown::Both).map_err(map_context!())?,
            Stream::Unix(c) => c.shutdown().map_err(map_context!())?,
        }
        Ok(())
    }

    pub fn try_clone(&self) -> io::Result<Stream> {
        match self {
            Stream::Tcp(s) => Ok(Stream::Tcp(s.try_clone()?)),
            Stream::Unix(c) => Ok(Stream::Unix(c.try_clone()?)),
        }
    }

    pub(crate) fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.set_nonblocking(nonblocking),
            Stream::Unix(c) => c.stream().set_nonblocking(nonblocking),
        }
    }
}

impl AsRawFd for Stream {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            Stream::Tcp(s) => s.as_raw_fd(),
            Stream::Unix(c) => c.as_raw_fd(),
        }
    }
}

fn recv_retry(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        let n = unsafe {
            libc::recv(
                fd,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                libc::MSG_DONTWAIT,
            )
        };
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

fn send_retry(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    loop {
        let n = unsafe {
            libc::send(
                fd,
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
                libc::MSG_DONTWAIT | libc::MSG_NOSIGNAL,
            )
        };
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

/// Blocks until `fd` is readable, the context is done, or its deadline
/// expires.
pub(crate) fn wait_readable(ctx: &Context, fd: RawFd) -> Result<()> {
    wait_io(ctx, fd, libc::POLLIN)
}

/// Blocks until `fd` is writable, the context is done, or its deadline
/// expires.
pub(crate) fn wait_writable(ctx: &Context, fd: RawFd) -> Result<()> {
    wait_io(ctx, fd, libc::POLLOUT)
}

fn wait_io(ctx: &Context, fd: RawFd, events: libc::c_short) -> Result<()> {
    loop {
        ctx.check()?;

        let mut fds = [
            libc::pollfd {
                fd,
                events,
                revents: 0,
            },
            libc::pollfd {
                fd: ctx.wake_fd(),
                events: libc::POLLIN,
                revents: 0,
            },
        ];

        let timeout: libc::c_int = match ctx.deadline() {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(std::time::Instant::now());
                remaining.as_millis().min(i32::MAX as u128) as libc::c_int
            }
            None => -1,
        };

        let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                _ => return Err(err).map_err(map_context!()),
            }
        }

        ctx.check()?;
        // POLLHUP and POLLERR also mean "go read"; the recv surfaces the
        // actual condition.
        if fds[0].revents != 0 {
            return Ok(());
        }
    }
}

/// A bound varlink endpoint.
pub enum Listener {
    Tcp(TcpListener),
    /// A unix listener; path-bound sockets remember their path so it can
    /// be unlinked on drop.
    Unix(UnixListener, Option<PathBuf>),
}

impl Listener {
    /// Binds the address described by `uri`.
    pub fn bind(uri: &Uri) -> Result<Listener> {
        match uri.scheme.as_str() {
            "tcp" => {
                let listener = TcpListener::bind(&uri.address).map_err(map_context!())?;
                Ok(Listener::Tcp(listener))
            }
            "unix" => match uri.address.strip_prefix('@') {
                Some(name) => {
                    let listener = bind_abstract(name).map_err(map_context!())?;
                    Ok(Listener::Unix(listener, None))
                }
                None => {
                    // ignore error on non-existent file
                    let _ = fs::remove_file(&uri.address);
                    let listener = UnixListener::bind(&uri.address).map_err(map_context!())?;
                    Ok(Listener::Unix(listener, Some(PathBuf::from(&uri.address))))
                }
            },
            scheme => Err(context!(ErrorKind::UnsupportedScheme(scheme.to_string()))),
        }
    }

    pub fn accept(&self) -> Result<Stream> {
        match self {
            Listener::Tcp(l) => {
                let (stream, _addr) = l.accept().map_err(map_context!())?;
                Ok(Stream::Tcp(stream))
            }
            Listener::Unix(l, _) => {
                let (stream, _addr) = l.accept().map_err(map_context!())?;
                Ok(Stream::Unix(UnixConn::new(stream)))
            }
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Listener::Unix(_, Some(path)) = self {
            let _ = fs::remove_file(path);
        }
    }
}

fn abstract_sockaddr(name: &str) -> io::Result<(libc::sockaddr_un, libc::socklen_t)> {
    let mut addr: libc::sockaddr_un = unsafe { mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
    let bytes = name.as_bytes();
    if bytes.len() + 1 > addr.sun_path.len() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "abstract socket name too long",
        ));
    }
    // sun_path[0] stays NUL for the abstract namespace.
    for (i, b) in bytes.iter().enumerate() {
        addr.sun_path[i + 1] = *b as libc::c_char;
    }
    let len = (mem::size_of::<libc::sa_family_t>() + 1 + bytes.len()) as libc::socklen_t;
    Ok((addr, len))
}

fn abstract_socket() -> io::Result<RawFd> {
    let fd = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}

fn connect_abstract(name: &str) -> io::Result<UnixStream> {
    let (addr, len) = abstract_sockaddr(name)?;
    let fd = abstract_socket()?;
    let rc = unsafe { libc::connect(fd, &addr as *const _ as *const libc::sockaddr, len) };
    if rc < 0 {
        let err = io::Error::last_os_error();
        unsafe {
            let _ = libc::close(fd);
        }
        return Err(err);
    }
    Ok(unsafe { UnixStream::from_raw_fd(fd) })
}

fn bind_abstract(name: &str) -> io::Result<UnixListener> {
    let (addr, len) = abstract_sockaddr(name)?;
    let fd = abstract_socket()?;
    let rc = unsafe { libc::bind(fd, &addr as *const _ as *const libc::sockaddr, len) };
    if rc >= 0 {
        let rc = unsafe { libc::listen(fd, 128) };
        if rc >= 0 {
            return Ok(unsafe { UnixListener::from_raw_fd(fd) });
        }
    }
    let err = io::Error::last_os_error();
    unsafe {
        let _ = libc::close(fd);
    }
    Err(err)
}
