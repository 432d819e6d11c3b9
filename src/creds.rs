//! Peer credential lookup on a connected Unix domain socket.
//!
//! Grounded directly on `get_peer_uid` in
//! `other_examples/...8007342-ai-way__conductor-daemon-src-server.rs.rs`,
//! generalized to also report the gid (needed to carry the caller's uid/gid
//! on the outbound `AUTH` packet per §4.6 "Credentials").

use std::os::unix::io::RawFd;

/// The peer's credentials, as reported by `SO_PEERCRED`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PeerCredentials {
    pub uid: u32,
    pub gid: u32,
    pub pid: i32,
}

/// Fetch peer credentials for a connected Unix domain socket `fd`.
///
/// Returns `None` if the platform or socket does not support
/// `SO_PEERCRED` (e.g. a TCP socket, or a non-Linux/BSD platform).
#[cfg(target_os = "linux")]
pub fn peer_credentials(fd: RawFd) -> Option<PeerCredentials> {
    let mut cred: libc::ucred = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;

    let result = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_PEERCRED,
            &mut cred as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };

    if result == 0 {
        Some(PeerCredentials { uid: cred.uid, gid: cred.gid, pid: cred.pid })
    } else {
        None
    }
}

#[cfg(not(target_os = "linux"))]
pub fn peer_credentials(_fd: RawFd) -> Option<PeerCredentials> {
    None
}

/// The calling process's own uid/gid, used to compare against a peer's for
/// the shared-memory eligibility check (§3 invariant "do_shm").
pub fn local_credentials() -> PeerCredentials {
    unsafe {
        PeerCredentials { uid: libc::getuid(), gid: libc::getgid(), pid: libc::getpid() }
    }
}
