//! Thin wrapper around `slog` so the rest of the crate has one place to
//! import macros and construct loggers from.

pub use slog::{debug, error, info, o, trace, warn, Discard, Logger};

pub use sloggers::types::Severity;

use sloggers::terminal::{Destination, TerminalLoggerBuilder};
use sloggers::Build;

/// Logger that swallows everything. Used wherever the caller did not supply
/// their own.
#[inline]
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}

/// Stderr terminal logger, handy for binaries and tests.
pub fn terminal(level: Severity) -> Logger {
    let mut builder = TerminalLoggerBuilder::new();
    builder.level(level);
    builder.destination(Destination::Stderr);
    builder.build().expect("terminal logger construction")
}

/// Resolves an optional caller-supplied logger into a child logger or a
/// discard logger.
#[inline]
pub(crate) fn child<'a, L: Into<Option<&'a Logger>>>(log: L, values: slog::OwnedKV<impl slog::SendSyncRefUnwindSafeKV + 'static>) -> Logger {
    match log.into() {
        Some(log) => log.new(values),
        None => discard(),
    }
}
