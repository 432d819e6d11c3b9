//! Connection configuration (NEW ambient concern; see SPEC_FULL.md §1.1).
//!
//! Built the way `other_examples/9fcd30ed_unikmhz-uxum__src-builder-server.rs.rs`
//! centralizes its listener parameters in a `ServerConfig`/builder rather than
//! scattering constants through the code.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("daemon binary path must be set to allow autospawn")]
    MissingDaemonBinary,
    #[error("too many extra daemon arguments: {0} (max {max})", max = crate::def::MAX_SPAWN_ARGS)]
    TooManySpawnArgs(usize),
}

/// Assembled connection configuration: runtime paths, autospawn argv, the
/// authentication cookie, and the handful of environment-derived toggles
/// §4.1/§4.4 reference.
#[derive(Debug, Clone)]
pub struct Config {
    /// Current per-user runtime socket path.
    pub runtime_dir: PathBuf,
    /// Socket file name under `runtime_dir` and under the system runtime dir.
    pub socket_name: String,
    /// System-wide runtime socket directory, if any.
    pub system_runtime_dir: Option<PathBuf>,
    /// Enable probing of the two legacy per-user paths.
    pub enable_legacy_runtime_paths: bool,
    /// Home directory, used to build the legacy `<home>/.audiod` path.
    pub home_dir: Option<PathBuf>,
    /// User name, used to build the legacy `/tmp/audiod-<user>` path.
    pub user_name: Option<String>,
    /// Default TCP port for `tcp4`/`tcp6`/bare-host candidates.
    pub default_tcp_port: u16,
    /// Consult `display_env_var` for a fallback host when set.
    pub auto_connect_display: bool,
    /// Name of the display environment variable (e.g. `DISPLAY`).
    pub display_env_var: String,
    /// Path to the daemon binary, used by the autospawner.
    pub daemon_binary: Option<PathBuf>,
    /// Extra space-separated arguments appended after `--start`.
    pub daemon_extra_args: String,
    /// Whether autospawn is permitted at all (independent of the per-call
    /// `NOAUTOSPAWN` flag).
    pub autospawn_allowed: bool,
    /// Fixed-size authentication cookie, if loaded.
    pub cookie: Option<Vec<u8>>,
    /// Well-known bus name the presence watcher subscribes to.
    pub daemon_bus_name: String,
}

impl Config {
    /// A reasonable default configuration for an application named `app_name`.
    pub fn new(app_name: &str) -> Self {
        let uid = unsafe { libc::getuid() };
        let runtime_dir = std::env::var_os("XDG_RUNTIME_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(format!("/run/user/{}", uid)))
            .join("audiod");
        Self {
            runtime_dir,
            socket_name: "native".to_owned(),
            system_runtime_dir: Some(PathBuf::from("/var/run/audiod")),
            enable_legacy_runtime_paths: false,
            home_dir: std::env::var_os("HOME").map(PathBuf::from),
            user_name: std::env::var("USER").ok(),
            default_tcp_port: 4317,
            auto_connect_display: false,
            display_env_var: "DISPLAY".to_owned(),
            daemon_binary: None,
            daemon_extra_args: String::new(),
            autospawn_allowed: true,
            cookie: None,
            daemon_bus_name: format!("org.audiod.{}", app_name.replace(' ', "_")),
        }
    }

    pub fn runtime_socket_path(&self) -> PathBuf {
        self.runtime_dir.join(&self.socket_name)
    }

    pub fn system_runtime_socket_path(&self) -> Option<PathBuf> {
        self.system_runtime_dir.as_ref().map(|d| d.join(&self.socket_name))
    }

    /// The two legacy per-user paths, owner-uid-checked by the caller before
    /// use (§4.1 item 1, §6.4).
    pub fn legacy_runtime_socket_paths(&self) -> Vec<PathBuf> {
        let mut out = Vec::new();
        if let Some(user) = &self.user_name {
            out.push(PathBuf::from(format!("/tmp/audiod-{}", user)).join(&self.socket_name));
        }
        if let Some(home) = &self.home_dir {
            out.push(home.join(".audiod").join(&self.socket_name));
        }
        out
    }

    /// Split `daemon_extra_args` on whitespace, capped at `MAX_SPAWN_ARGS`.
    pub fn spawn_argv(&self) -> Result<Vec<String>, ConfigError> {
        let args: Vec<String> =
            self.daemon_extra_args.split_whitespace().map(str::to_owned).collect();
        if args.len() > crate::def::MAX_SPAWN_ARGS {
            return Err(ConfigError::TooManySpawnArgs(args.len()));
        }
        Ok(args)
    }

    pub fn daemon_binary_path(&self) -> Result<&std::path::Path, ConfigError> {
        self.daemon_binary.as_deref().ok_or(ConfigError::MissingDaemonBinary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_argv_splits_on_whitespace() {
        let mut config = Config::new("app");
        config.daemon_extra_args = "--log-target=syslog  --exit-idle-time=20".to_owned();
        let argv = config.spawn_argv().unwrap();
        assert_eq!(argv, vec!["--log-target=syslog", "--exit-idle-time=20"]);
    }

    #[test]
    fn spawn_argv_rejects_too_many_args() {
        let mut config = Config::new("app");
        config.daemon_extra_args = (0..40).map(|i| format!("a{}", i)).collect::<Vec<_>>().join(" ");
        assert!(matches!(config.spawn_argv(), Err(ConfigError::TooManySpawnArgs(_))));
    }
}
