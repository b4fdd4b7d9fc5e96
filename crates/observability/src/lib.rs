//! Process-wide tracing setup shared by every orgauth binary.

/// Initialize process-wide observability (tracing/logging).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init(tracing::LogFormat::Json);
}

/// Like [`init`], with an explicit output format.
pub fn init_with(format: tracing::LogFormat) {
    tracing::init(format);
}

/// Subscriber configuration (filters, formats).
pub mod tracing;

pub use self::tracing::LogFormat;
