//! Ambient logging for ctxshm.
//!
//! Log verbosity and destination are controlled by two environment
//! variables instead of `RUST_LOG`, so a ctxshm deployment's logging never
//! collides with the logging of whatever host process embeds it:
//!
//! - `HSHM_LOG_LEVEL`: `debug` | `info` | `success` | `warning` | `error` |
//!   `fatal`, or the integers `0`-`5` in that same order (default `info`).
//!   `success` is accepted for familiarity with the level names used
//!   elsewhere in this system but is logged at `INFO` since `tracing` has
//!   no separate success level. `fatal` logs at `ERROR`; callers that mean
//!   to terminate the process still have to do so themselves, `ctxshm-log`
//!   never calls `exit`.
//! - `HSHM_LOG_OUT`: path to a log file. If unset, log lines go to stderr.
//!
//! Call [`init`] once near the start of a process. It is safe to call more
//! than once; subsequent calls are no-ops.

use std::fs::OpenOptions;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use tracing_subscriber::EnvFilter;

const LEVEL_VAR: &str = "HSHM_LOG_LEVEL";
const OUT_VAR: &str = "HSHM_LOG_OUT";

static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Where log output is written.
enum Destination {
    Stderr,
    File(Mutex<std::fs::File>),
}

struct Writer<'a>(&'a Destination);

impl io::Write for Writer<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.0 {
            Destination::Stderr => io::stderr().write(buf),
            Destination::File(f) => f.lock().expect("log file mutex poisoned").write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.0 {
            Destination::Stderr => io::stderr().flush(),
            Destination::File(f) => f.lock().expect("log file mutex poisoned").flush(),
        }
    }
}

impl<'w> tracing_subscriber::fmt::MakeWriter<'w> for Destination {
    type Writer = Writer<'w>;

    fn make_writer(&'w self) -> Self::Writer {
        Writer(self)
    }
}

use io::Write;

fn destination_from_env() -> Destination {
    match std::env::var(OUT_VAR) {
        Ok(path) if !path.is_empty() => {
            match OpenOptions::new().create(true).append(true).open(&path) {
                Ok(file) => Destination::File(Mutex::new(file)),
                Err(err) => {
                    eprintln!(
                        "ctxshm-log: failed to open {} ({}), falling back to stderr",
                        path, err
                    );
                    Destination::Stderr
                }
            }
        }
        _ => Destination::Stderr,
    }
}

/// Translate a `HSHM_LOG_LEVEL` value (name or integer 0-5) to the
/// `tracing` directive it maps onto.
fn level_directive(raw: &str) -> &'static str {
    match raw {
        "debug" | "DEBUG" | "0" => "debug",
        "info" | "INFO" | "1" => "info",
        "success" | "SUCCESS" | "2" => "info",
        "warning" | "WARNING" | "3" => "warn",
        "error" | "ERROR" | "4" => "error",
        "fatal" | "FATAL" | "5" => "error",
        _ => "info",
    }
}

fn filter_from_env() -> EnvFilter {
    match std::env::var(LEVEL_VAR) {
        Ok(raw) if !raw.is_empty() => EnvFilter::new(level_directive(&raw)),
        _ => EnvFilter::new("info"),
    }
}

/// Initialize the global tracing subscriber from `HSHM_LOG_LEVEL` /
/// `HSHM_LOG_OUT`. Idempotent: only the first call takes effect.
pub fn init() {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }

    let destination = destination_from_env();
    let filter = filter_from_env();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(destination)
        .with_target(true);

    // A subscriber may already be installed by the embedding process; that
    // is not an error condition for a library crate.
    let _ = subscriber.try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_level_directive_names_and_ints_agree() {
        assert_eq!(level_directive("debug"), level_directive("0"));
        assert_eq!(level_directive("info"), level_directive("1"));
        assert_eq!(level_directive("success"), level_directive("2"));
        assert_eq!(level_directive("warning"), level_directive("3"));
        assert_eq!(level_directive("error"), level_directive("4"));
        assert_eq!(level_directive("fatal"), level_directive("5"));
    }

    #[test]
    fn test_level_directive_success_maps_to_info() {
        assert_eq!(level_directive("success"), "info");
    }

    #[test]
    #[serial]
    fn test_filter_from_env_default() {
        std::env::remove_var(LEVEL_VAR);
        let filter = filter_from_env();
        assert_eq!(filter.to_string(), "info");
    }

    #[test]
    #[serial]
    fn test_filter_from_env_custom() {
        std::env::set_var(LEVEL_VAR, "warning");
        let filter = filter_from_env();
        assert_eq!(filter.to_string(), "warn");
        std::env::remove_var(LEVEL_VAR);
    }

    #[test]
    #[serial]
    fn test_destination_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctxshm.log");
        std::env::set_var(OUT_VAR, path.to_str().unwrap());
        match destination_from_env() {
            Destination::File(_) => {}
            _ => panic!("expected file destination"),
        }
        std::env::remove_var(OUT_VAR);
    }

    #[test]
    #[serial]
    fn test_init_idempotent() {
        init();
        init();
        assert!(INITIALIZED.load(Ordering::SeqCst));
    }
}
