//! Miscellaneous shared types and constants.

/// Microseconds, as used throughout the timer/rttime API.
pub type Usecs = u64;

/// Sentinel meaning "no deadline" for `Context::rttime_new`/`rttime_restart`.
pub const USEC_INVALID: Usecs = std::u64::MAX;

/// Sentinel returned by index-returning getters when the value is not valid.
pub const INVALID_INDEX: u32 = std::u32::MAX;

/// Native protocol version implemented by this core.
pub const PROTOCOL_VERSION: u32 = 32;

/// Minimum protocol version required to use a structured client name
/// (proplist-based `SET_CLIENT_NAME`, `client_index`, extensions).
pub const PROTOCOL_VERSION_MASK_SHM: u32 = 10;
pub const PROTOCOL_VERSION_NAMED_CLIENT: u32 = 13;

/// High bit of the `AUTH` version field, used to advertise/detect
/// shared-memory support.
pub const VERSION_SHM_BIT: u32 = 0x8000_0000;

/// Per-tag reply timeout.
pub const DEFAULT_TIMEOUT_USEC: Usecs = 5_000_000;

/// Maximum number of space-split extra arguments passed to the autospawned
/// daemon binary.
pub const MAX_SPAWN_ARGS: usize = 30;
