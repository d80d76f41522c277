//! Host metadata helpers used by the built-in attestors.

/// The version of the `vouch-attest` crate (compile-time constant).
#[must_use]
pub const fn vouch_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Attempt to capture the machine hostname.
///
/// Uses the `gethostname` syscall via the `nix` crate, falling back to
/// the `HOSTNAME` environment variable.
#[must_use]
pub fn capture_hostname() -> Option<String> {
    nix::unistd::gethostname()
        .ok()
        .and_then(|name: std::ffi::OsString| name.into_string().ok())
        .or_else(|| std::env::var("HOSTNAME").ok())
}

/// Attempt to capture the name of the current user.
#[must_use]
pub fn capture_username() -> Option<String> {
    nix::unistd::User::from_uid(nix::unistd::getuid())
        .ok()
        .flatten()
        .map(|user| user.name)
        .or_else(|| std::env::var("USER").ok())
}
