// =============================================================================
// ARNm Runtime — Diagnostics ([ARNM ...] stderr backend)
// =============================================================================
//
// Every user-visible diagnostic the runtime emits goes to standard error
// with an `[ARNM <KIND>]` tag so it can be told apart from the hosted
// program's own output:
//
//   [ARNM PANIC]     unrecoverable — the program is about to abort
//   [ARNM INVARIANT] a hard runtime invariant was violated — abort
//   [ARNM ERROR]     an operation failed and was reported to the caller
//   [ARNM WARN]      suspicious but survivable (deadlock, mutex misuse)
//   [ARNM INFO] / [ARNM DEBUG] / [ARNM TRACE] — development visibility
//
// Routine diagnostics flow through the `log` facade and this module's
// backend. The PANIC and INVARIANT paths write directly to stderr before
// aborting: an abort diagnostic must reach the user even if no logger was
// ever installed or the level filter would drop it.
//
// LEVEL SELECTION:
//   The ARNM_LOG environment variable picks the maximum level
//   (off/error/warn/info/debug/trace). Default is warn.
// =============================================================================

use std::io::Write;

use log::{Level, LevelFilter, Log, Metadata, Record};

/// The singleton stderr logger installed by [`init`].
static LOGGER: DiagLogger = DiagLogger;

struct DiagLogger;

impl Log for DiagLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let tag = match record.level() {
            Level::Error => "ERROR",
            Level::Warn => "WARN",
            Level::Info => "INFO",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        };
        // A single write_fmt per record keeps lines whole when several
        // workers log at once (stderr is line-buffered and locked).
        let mut err = std::io::stderr().lock();
        let _ = writeln!(err, "[ARNM {}] {}", tag, record.args());
    }

    fn flush(&self) {}
}

/// Read the level filter from `ARNM_LOG`. Unknown values fall back to warn.
fn level_from_env() -> LevelFilter {
    match std::env::var("ARNM_LOG").as_deref() {
        Ok("off") => LevelFilter::Off,
        Ok("error") => LevelFilter::Error,
        Ok("warn") => LevelFilter::Warn,
        Ok("info") => LevelFilter::Info,
        Ok("debug") => LevelFilter::Debug,
        Ok("trace") => LevelFilter::Trace,
        _ => LevelFilter::Warn,
    }
}

/// Install the [ARNM] logger and apply the `ARNM_LOG` level.
///
/// Safe to call more than once — only the first call installs the backend
/// (later calls still refresh the level filter). `arnm_init` calls this;
/// tests may call it directly.
pub fn init() {
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(level_from_env());
}

/// Report a violated hard invariant and abort the program.
///
/// Used for conditions the runtime cannot continue past, e.g. a process
/// popped from a run queue in a state other than Ready/Waiting. Writes
/// directly to stderr so the report survives a missing logger.
pub fn invariant_failed(what: &str) -> ! {
    let mut err = std::io::stderr().lock();
    let _ = writeln!(err, "[ARNM INVARIANT] {}", what);
    let _ = err.flush();
    std::process::abort();
}

/// Report a runtime panic diagnostic and abort the program.
///
/// This is the unmatched-receive path (`arnm_panic_nomatch`) and any other
/// condition compiled code treats as fatal.
pub fn panic_abort(what: &str) -> ! {
    let mut err = std::io::stderr().lock();
    let _ = writeln!(err, "[ARNM PANIC] {}", what);
    let _ = err.flush();
    std::process::abort();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_level_defaults_to_warn() {
        // Not set in the test environment (and unknown values degrade the
        // same way), so the default path is what we exercise.
        if std::env::var("ARNM_LOG").is_err() {
            assert_eq!(level_from_env(), LevelFilter::Warn);
        }
    }

    #[test]
    fn init_is_idempotent() {
        init();
        init();
        log::warn!("diag self-test (expected in test output)");
    }
}
