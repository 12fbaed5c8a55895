//! # Error
//!
//! Coarse classification shared by the error types of every stage

/// What went wrong, independent of which stage reported it.
///
/// Only [`ErrorKind::InvalidPattern`] is fatal, and only for the pattern that failed to parse.
/// Every other kind is reported per fix, per hook or per patch address and never stops the remaining work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A pattern token is neither two hex digits nor a wildcard
    InvalidPattern,
    /// A scan produced an empty match set
    PatternNotFound,
    /// Hook target is null, unmapped or not executable
    InvalidAddress,
    /// Hook target is valid but the detour could not be built or written
    HookInstallFailed,
    /// A static patch could not be written
    PatchFailed,
}
