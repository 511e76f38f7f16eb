//! The module containing various constants that may be modified by developers.

/// The logging level.
pub const LOGGING_LEVEL: log::LevelFilter = log::LevelFilter::Debug;

/// Whether the guest should exit on every RDTSC/RDTSCP. The instructions are
/// emulated with the host TSC either way; intercepting them only adds
/// visibility (and a measurable slowdown).
pub const INTERCEPT_RDTSC: bool = false;

/// Whether the I/O bitmaps should intercept every port. When `false`, both
/// bitmaps are left all-zero and port accesses do not exit.
pub const INTERCEPT_ALL_IO: bool = true;
