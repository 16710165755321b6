//! Structured diagnostics for lock-order violations, deadlocks, suspension
//! watchdog firings, and discovered-thread warnings.
//!
//! The crate intentionally does not depend on `tracing` or `log`: diagnostics
//! here are rare, high-value events (not a hot-path logging facade), so a
//! small serde-based JSONL emitter is enough and keeps the dependency
//! footprint aligned with the rest of the workspace.

use std::io::Write;
use std::sync::Mutex;

use serde::Serialize;

use crate::element::LockFrame;

/// Severity of a diagnostic event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warn,
    Fatal,
}

/// One structured diagnostic event, serialized as a single JSON line.
#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticEvent<'a> {
    pub severity: Severity,
    pub event: &'a str,
    pub small_id: Option<u32>,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lock_stack: Option<&'a [LockFrame]>,
}

static SINK: Mutex<Option<Box<dyn Write + Send>>> = Mutex::new(None);

/// Redirect diagnostic output to a custom sink instead of stderr. Intended
/// for tests and for embedding daemons that want diagnostics folded into
/// their own structured log stream.
pub fn set_sink(sink: Box<dyn Write + Send>) {
    *SINK.lock().unwrap() = Some(sink);
}

/// Emit a single diagnostic event as a JSON line.
pub fn emit(event: &DiagnosticEvent<'_>) {
    let line = serde_json::to_string(event).unwrap_or_else(|_| {
        format!(
            "{{\"severity\":\"warn\",\"event\":\"diagnostic_encode_failure\",\"detail\":\"{}\"}}",
            event.event
        )
    });
    let mut guard = SINK.lock().unwrap();
    match guard.as_mut() {
        Some(sink) => {
            let _ = writeln!(sink, "{line}");
        }
        None => {
            eprintln!("{line}");
        }
    }
}

/// Emit a warning-level diagnostic. Used for recoverable anomalies such as a
/// discovered thread's stack-reuse race, or a nonempty cleanup stack on
/// implicit thread exit.
pub fn warn(event: &str, small_id: Option<u32>, detail: impl Into<String>) {
    emit(&DiagnosticEvent {
        severity: Severity::Warn,
        event,
        small_id,
        detail: detail.into(),
        lock_stack: None,
    });
}

/// Emit a fatal diagnostic and abort the process.
///
/// Used for conditions that mean the runtime's internal bookkeeping is no
/// longer trustworthy: lock-stack overflow, out-of-order release outside
/// crash mode, a suspension watchdog firing, or a broken self-pipe. This
/// never returns.
pub fn fatal(event: &str, small_id: Option<u32>, detail: impl Into<String>) -> ! {
    emit(&DiagnosticEvent {
        severity: Severity::Fatal,
        event,
        small_id,
        detail: detail.into(),
        lock_stack: None,
    });
    std::process::abort();
}

/// Emit a fatal diagnostic including a lock-stack dump, then abort. Used by
/// the lock accountant's deadlock detector (section 4.4) to show both the
/// current thread's stack and the contested lock's owner's stack.
pub fn fatal_with_stack(
    event: &str,
    small_id: Option<u32>,
    detail: impl Into<String>,
    lock_stack: &[LockFrame],
) -> ! {
    emit(&DiagnosticEvent {
        severity: Severity::Fatal,
        event,
        small_id,
        detail: detail.into(),
        lock_stack: Some(lock_stack),
    });
    std::process::abort();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::sync::Arc;
    use std::sync::Mutex as StdMutex;

    struct SharedCursor(Arc<StdMutex<Cursor<Vec<u8>>>>);
    impl Write for SharedCursor {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().write(buf)
        }
        fn flush(&mut self) -> std::io::Result<()> {
            self.0.lock().unwrap().flush()
        }
    }

    #[test]
    fn warn_emits_valid_json_line() {
        let buf = Arc::new(StdMutex::new(Cursor::new(Vec::new())));
        set_sink(Box::new(SharedCursor(buf.clone())));
        warn("test_event", Some(3), "something happened");
        let data = buf.lock().unwrap().get_ref().clone();
        let text = String::from_utf8(data).unwrap();
        let line = text.lines().next_back().unwrap();
        let value: serde_json::Value = serde_json::from_str(line).unwrap();
        assert_eq!(value["event"], "test_event");
        assert_eq!(value["small_id"], 3);
        assert_eq!(value["severity"], "warn");
    }
}
