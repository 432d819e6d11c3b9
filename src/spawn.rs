//! Autospawner (§4.3): fork/exec the daemon binary, at most once per context
//! lifetime.

use std::ffi::CString;
use std::os::unix::io::RawFd;

use crate::config::Config;
use crate::error::ErrorCode;

/// Caller-supplied hooks run around the fork, mirroring the teacher's
/// `pa_spawn_api` (`prefork`/`atfork`/`postfork`).
#[derive(Default)]
pub struct SpawnHooks {
    pub prefork: Option<Box<dyn Fn()>>,
    pub atfork: Option<Box<dyn Fn()>>,
    pub postfork: Option<Box<dyn Fn()>>,
}

/// Check the three preconditions from §4.3(d) that determine whether a
/// reaped child's exit status can actually be observed by `waitpid`.
fn sigchld_is_reapable() -> bool {
    let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
    if unsafe { libc::sigaction(libc::SIGCHLD, std::ptr::null(), &mut action) } != 0 {
        return true;
    }
    if action.sa_flags & libc::SA_NOCLDWAIT != 0 {
        return false;
    }
    // SIG_IGN as an explicit handler also discards the exit status on Linux.
    if action.sa_sigaction == libc::SIG_IGN {
        return false;
    }
    true
}

/// Run the autospawn procedure (§4.3).
///
/// Preconditions (a)-(c) — no explicit server, autospawn permitted, caller
/// is not uid 0 — are checked by the caller (the context state machine)
/// before invoking this; this function checks (d) and then performs the
/// fork/exec/waitpid dance.
pub fn autospawn(config: &Config, hooks: Option<&SpawnHooks>, close_fds_above: RawFd) -> Result<(), ErrorCode> {
    if !sigchld_is_reapable() {
        tracing::warn!("SIGCHLD is SIG_IGN or SA_NOCLDWAIT; cannot reap autospawned daemon");
        return Err(ErrorCode::ConnectionRefused);
    }

    let binary = config.daemon_binary_path().map_err(|_| ErrorCode::ConnectionRefused)?;
    let argv = config.spawn_argv().map_err(|_| ErrorCode::ConnectionRefused)?;

    if let Some(h) = hooks.and_then(|h| h.prefork.as_ref()) {
        h();
    }

    let pid = unsafe { libc::fork() };
    if pid < 0 {
        tracing::error!("fork() failed while autospawning daemon");
        return Err(ErrorCode::ConnectionRefused);
    }

    if pid == 0 {
        // Child.
        if let Some(h) = hooks.and_then(|h| h.atfork.as_ref()) {
            h();
        }
        close_inherited_fds_above(close_fds_above);
        exec_daemon(binary, &argv);
        // exec_daemon never returns on success.
        unsafe { libc::_exit(127) };
    }

    // Parent.
    if let Some(h) = hooks.and_then(|h| h.postfork.as_ref()) {
        h();
    }

    reap_child(pid)
}

fn close_inherited_fds_above(floor: RawFd) {
    let max_fd = unsafe { libc::sysconf(libc::_SC_OPEN_MAX) };
    let max_fd = if max_fd > 0 { max_fd as RawFd } else { 1024 };
    for fd in (floor + 1)..max_fd {
        unsafe {
            libc::close(fd);
        }
    }
}

fn exec_daemon(binary: &std::path::Path, extra_args: &[String]) -> ! {
    let c_binary = CString::new(binary.as_os_str().to_string_lossy().as_bytes()).unwrap();
    let mut c_args: Vec<CString> = Vec::with_capacity(extra_args.len() + 2);
    c_args.push(c_binary.clone());
    c_args.push(CString::new("--start").unwrap());
    for a in extra_args {
        c_args.push(CString::new(a.as_str()).unwrap());
    }
    let mut argv_ptrs: Vec<*const libc::c_char> = c_args.iter().map(|c| c.as_ptr()).collect();
    argv_ptrs.push(std::ptr::null());

    unsafe {
        libc::execv(c_binary.as_ptr(), argv_ptrs.as_ptr());
    }
    unsafe { libc::_exit(127) };
}

/// `waitpid` the spawned child, treating `EINTR` as retryable and `ESRCH`
/// (some other waiter already reaped it, e.g. a parent `SIGCHLD` handler) as
/// success (§4.3, §9 open question).
fn reap_child(pid: libc::pid_t) -> Result<(), ErrorCode> {
    loop {
        let mut status: libc::c_int = 0;
        let r = unsafe { libc::waitpid(pid, &mut status, 0) };
        if r == pid {
            if libc::WIFEXITED(status) && libc::WEXITSTATUS(status) == 0 {
                return Ok(());
            }
            tracing::warn!(status, "autospawned daemon exited non-zero");
            return Err(ErrorCode::ConnectionRefused);
        }
        if r < 0 {
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            if errno == libc::EINTR {
                continue;
            }
            if errno == libc::ESRCH {
                tracing::debug!("waitpid got ESRCH; assuming child was reaped elsewhere");
                return Ok(());
            }
            tracing::error!(errno, "waitpid failed while autospawning daemon");
            return Err(ErrorCode::ConnectionRefused);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sigchld_default_disposition_is_reapable() {
        // Default process disposition for SIGCHLD is neither SIG_IGN nor
        // SA_NOCLDWAIT, so this should hold in a normal test process.
        assert!(sigchld_is_reapable());
    }
}
