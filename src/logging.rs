//! A leveled log sink, replacing the source driver's five-macro
//! `log_err`/`log_warn`/`log_info`/`log_dbg`/`log_trace` family with a
//! single sink whose minimum level is a process-wide atomic ( REDESIGN
//! FLAGS). Plugs into the `log` facade so the rest of the crate just uses
//! `log::{error,warn,info,debug,trace}!`.

use std::sync::atomic::{AtomicU8, Ordering};

use log::{Level, LevelFilter, Log, Metadata, Record};

static CURRENT_LEVEL: AtomicU8 = AtomicU8::new(LevelFilter::Info as u8);

struct Sink;

impl Log for Sink {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        (metadata.level as u8) <= CURRENT_LEVEL.load(Ordering::Relaxed)
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        eprintln!("[{}] {}", record.level(), record.args());
        forward_to_syslog(record.level(), &record.args().to_string());
    }

    fn flush(&self) {}
}

static SINK: Sink = Sink;

/// Installs the sink and sets the initial filter level. Must be called
/// exactly once, from `main`, before any other component logs.
pub fn install(level: LevelFilter) {
    CURRENT_LEVEL.store(level as u8, Ordering::Relaxed);
    // `set_logger` only fails if called twice; a second call from a test
    // harness is harmless to ignore.
    let _ = log::set_logger(&SINK).map(|| log::set_max_level(level));
}

/// Raises or lowers the filter at runtime (e.g. in response to `-v`/`-q`
/// repeated on the command line, or a future devctl).
pub fn set_level(level: LevelFilter) {
    CURRENT_LEVEL.store(level as u8, Ordering::Relaxed);
    log::set_max_level(level);
}

/// Best-effort syslog forwarding. Wiring an actual syslog transport is a
/// host-platform concern kept deliberately external; this hook exists so
/// that swapping in a real transport later does not require touching
/// call sites.
fn forward_to_syslog(_level: Level, _message: &str) {}

/// Formats and emits a log line from ISR context without allocating.
/// Used by the interrupt path (component E/H) which must never call into
/// an allocating logger. The formatted text is capped to the capacity of
/// the backing buffer; longer messages are truncated.
pub fn log_isr(level: Level, args: core::fmt::Arguments<'_>) {
    use std::io::Write;

    if (level as u8) > CURRENT_LEVEL.load(Ordering::Relaxed) {
        return;
    }

    let mut buf: heapless::Vec<u8, 256> = heapless::Vec::new();
    // `write!` into a fixed heapless buffer never allocates; overflow is
    // silently truncated by `heapless`'s `Write` impl returning an error
    // we deliberately ignore here (best effort diagnostics only).
    let _ = write!(HeaplessWriter(&mut buf), "{args}");

    let stderr = std::io::stderr();
    let mut handle = stderr.lock();
    let _ = handle.write_all(b"[");
    let _ = handle.write_all(level.as_str().as_bytes());
    let _ = handle.write_all(b"][isr] ");
    let _ = handle.write_all(&buf);
    let _ = handle.write_all(b"\n");
}

struct HeaplessWriter<'a>(&'a mut heapless::Vec<u8, 256>);

impl core::fmt::Write for HeaplessWriter<'_> {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        for &b in s.as_bytes() {
            if self.0.push(b).is_err() {
                break;
            }
        }
        Ok(())
    }
}
