//! Socket dialer (§4.2): asynchronous connect over a single candidate.
//!
//! Unix domain connects are issued as ordinary blocking syscalls (a local
//! rendezvous connect never blocks meaningfully); TCP connects go through a
//! non-blocking `connect()`/poll-for-writable/`SO_ERROR` dance so a slow or
//! unreachable peer does not stall the caller's event loop, matching the
//! "asynchronous connect... yielding a duplex byte channel... or a
//! failure carrying the underlying errno" contract.

use std::cell::RefCell;
use std::io;
use std::net::{IpAddr, TcpStream, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::rc::Rc;

use crate::endpoint::Endpoint;
use crate::mainloop::{IoEvent, IoEventFlags, Mainloop};

/// A connected duplex byte channel, produced by a successful dial.
pub enum Channel {
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl Channel {
    pub fn as_raw_fd(&self) -> RawFd {
        match self {
            Channel::Unix(s) => s.as_raw_fd(),
            Channel::Tcp(s) => s.as_raw_fd(),
        }
    }

    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        use std::io::Read;
        match self {
            Channel::Unix(s) => s.read(buf),
            Channel::Tcp(s) => s.read(buf),
        }
    }

    pub fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        use std::io::Write;
        match self {
            Channel::Unix(s) => s.write(buf),
            Channel::Tcp(s) => s.write(buf),
        }
    }

    pub fn is_unix(&self) -> bool {
        matches!(self, Channel::Unix(_))
    }
}

/// The outcome handed to a dial callback.
pub enum DialOutcome {
    Connected { channel: Channel, is_local: bool },
    Failed { errno: i32 },
}

pub type DialCallback = Box<dyn FnMut(DialOutcome)>;

/// §4.2 retry policy: these three errnos mean "try the next candidate";
/// anything else terminates the dial cascade.
pub fn is_retryable(errno: i32) -> bool {
    errno == libc::ECONNREFUSED || errno == libc::ETIMEDOUT || errno == libc::EHOSTUNREACH
}

/// A single in-flight dial attempt. Dropping it before completion abandons
/// the attempt (the underlying fd, if any, is closed).
pub struct Dialer {
    _io_event: Option<Box<dyn IoEvent>>,
}

impl Dialer {
    /// Start dialing `endpoint`, invoking `cb` exactly once, either
    /// synchronously (Unix sockets, or a TCP connect that fails or succeeds
    /// immediately) or later via the main loop (a pending TCP connect).
    pub fn start(mainloop: &dyn Mainloop, endpoint: &Endpoint, mut cb: DialCallback) -> Dialer {
        match endpoint {
            Endpoint::Unix { path } => {
                match UnixStream::connect(path) {
                    Ok(stream) => cb(DialOutcome::Connected { channel: Channel::Unix(stream), is_local: true }),
                    Err(e) => cb(DialOutcome::Failed { errno: e.raw_os_error().unwrap_or(libc::EIO) }),
                }
                Dialer { _io_event: None }
            }
            Endpoint::Tcp4 { host, port } | Endpoint::Tcp6 { host, port } => {
                dial_tcp(mainloop, host, *port, cb)
            }
        }
    }
}

fn dial_tcp(mainloop: &dyn Mainloop, host: &str, port: u16, mut cb: DialCallback) -> Dialer {
    let addr = match (host.as_str(), port).to_socket_addrs().ok().and_then(|mut it| it.next()) {
        Some(a) => a,
        None => {
            cb(DialOutcome::Failed { errno: libc::EINVAL });
            return Dialer { _io_event: None };
        }
    };

    let is_local = addr.ip().is_loopback();
    let domain = if addr.is_ipv4() { libc::AF_INET } else { libc::AF_INET6 };
    let fd = unsafe { libc::socket(domain, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        cb(DialOutcome::Failed { errno: io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO) });
        return Dialer { _io_event: None };
    }
    set_nonblocking(fd);

    let connect_result = connect_raw(fd, addr.ip(), port);
    match connect_result {
        Ok(()) => {
            let stream = unsafe { TcpStream::from_raw_fd(fd) };
            cb(DialOutcome::Connected { channel: Channel::Tcp(stream), is_local });
            Dialer { _io_event: None }
        }
        Err(errno) if errno == libc::EINPROGRESS => wait_for_connect(mainloop, fd, is_local, cb),
        Err(errno) => {
            unsafe { libc::close(fd) };
            cb(DialOutcome::Failed { errno });
            Dialer { _io_event: None }
        }
    }
}

/// Register the pending connect's fd as an output-readiness I/O event on
/// the caller's main loop instead of blocking: the single place besides
/// `waitpid` during autospawn where this core would otherwise need to wait
/// is turned into a suspension point per §5, not a blocking syscall.
fn wait_for_connect(mainloop: &dyn Mainloop, fd: RawFd, is_local: bool, cb: DialCallback) -> Dialer {
    // `cb` fires at most once; a second spurious readiness notification
    // (there should not be one, but nothing guarantees it) becomes a no-op
    // via the `Option::take`.
    let cb = Rc::new(RefCell::new(Some(cb)));

    let io_event = mainloop.io_new(
        fd,
        IoEventFlags::OUTPUT,
        Box::new(move |flags: IoEventFlags| {
            if !flags.intersects(IoEventFlags::OUTPUT | IoEventFlags::ERROR | IoEventFlags::HANGUP) {
                return;
            }
            if let Some(mut cb) = cb.borrow_mut().take() {
                let errno = socket_error(fd);
                if errno == 0 {
                    let stream = unsafe { TcpStream::from_raw_fd(fd) };
                    cb(DialOutcome::Connected { channel: Channel::Tcp(stream), is_local });
                } else {
                    unsafe { libc::close(fd) };
                    cb(DialOutcome::Failed { errno });
                }
            }
        }),
    );

    // Dropping the `Dialer` drops `io_event`, which unregisters the fd from
    // the main loop; the caller is responsible for closing `fd` in that
    // case (mirroring "dropping it before completion abandons the attempt").
    Dialer { _io_event: Some(io_event) }
}

fn socket_error(fd: RawFd) -> i32 {
    let mut err: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let r = unsafe {
        libc::getsockopt(fd, libc::SOL_SOCKET, libc::SO_ERROR, &mut err as *mut _ as *mut libc::c_void, &mut len)
    };
    if r == 0 {
        err
    } else {
        libc::EIO
    }
}

fn set_nonblocking(fd: RawFd) {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
    }
}

fn connect_raw(fd: RawFd, ip: IpAddr, port: u16) -> Result<(), i32> {
    let ret = match ip {
        IpAddr::V4(v4) => {
            let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
            addr.sin_family = libc::AF_INET as libc::sa_family_t;
            addr.sin_port = port.to_be();
            addr.sin_addr.s_addr = u32::from_ne_bytes(v4.octets());
            unsafe {
                libc::connect(
                    fd,
                    &addr as *const _ as *const libc::sockaddr,
                    std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
                )
            }
        }
        IpAddr::V6(v6) => {
            let mut addr: libc::sockaddr_in6 = unsafe { std::mem::zeroed() };
            addr.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            addr.sin6_port = port.to_be();
            addr.sin6_addr.s6_addr = v6.octets();
            unsafe {
                libc::connect(
                    fd,
                    &addr as *const _ as *const libc::sockaddr,
                    std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
                )
            }
        }
    };
    if ret == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errnos_match_spec() {
        assert!(is_retryable(libc::ECONNREFUSED));
        assert!(is_retryable(libc::ETIMEDOUT));
        assert!(is_retryable(libc::EHOSTUNREACH));
        assert!(!is_retryable(libc::EACCES));
    }

    #[test]
    fn dialing_a_nonexistent_unix_socket_fails_with_enoent() {
        let ml = crate::mainloop::StdMainloop::new();
        let mut result = None;
        let endpoint = Endpoint::Unix { path: "/nonexistent/audiod/socket/path".into() };
        Dialer::start(&ml, &endpoint, Box::new(|outcome| {
            if let DialOutcome::Failed { errno } = outcome {
                result = Some(errno);
            }
        }));
        // connect() on a missing path yields ENOENT, not one of the three
        // retryable codes (those apply to a path/host that exists but
        // refuses or can't be reached).
        assert_eq!(result, Some(libc::ENOENT));
    }
}
