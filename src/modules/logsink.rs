//! Diagnostic output of the daemon.
//!
//! The daemon writes one line per significant event (startup, session
//! lifecycle, handler failures, shutdown) to a [`LogSink`] injected by the
//! host. How the lines are shown is up to the sink.

use std::fmt;
use std::io::Write;
use std::sync::mpsc::Sender;
use std::sync::Arc;

use log::{info, warn};
use parking_lot::Mutex;

/// Append-only, line-oriented diagnostic channel.
pub trait LogSink: Send + Sync {
    /// Appends one line. `line` carries no trailing newline.
    fn append_line(&self, line: &str);
}

/// Forwards every line to the `log` facade at info level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogCrateSink;

impl LogSink for LogCrateSink {
    fn append_line(&self, line: &str) {
        info!(target: "tnfsd", "{}", line);
    }
}

/// Writes lines to any byte stream, such as a pipe or a file.
pub struct WriterSink<W: Write + Send> {
    inner: Mutex<W>,
}

impl<W: Write + Send> WriterSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            inner: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        self.inner.into_inner()
    }
}

impl<W: Write + Send> LogSink for WriterSink<W> {
    fn append_line(&self, line: &str) {
        let mut writer = self.inner.lock();
        if let Err(e) = writeln!(writer, "{}", line).and_then(|_| writer.flush()) {
            warn!("Dropping diagnostic line: {}", e);
        }
    }
}

/// Sends lines over a channel, for hosts that consume them elsewhere.
pub struct ChannelSink {
    tx: Mutex<Sender<String>>,
}

impl ChannelSink {
    pub fn new(tx: Sender<String>) -> Self {
        Self { tx: Mutex::new(tx) }
    }
}

impl LogSink for ChannelSink {
    fn append_line(&self, line: &str) {
        // A gone receiver only means nobody is listening anymore.
        let _ = self.tx.lock().send(line.to_string());
    }
}

/// Cheap handle the daemon components use to emit diagnostic lines.
#[derive(Clone)]
pub struct Diagnostics {
    sink: Arc<dyn LogSink>,
}

impl Diagnostics {
    pub fn new(sink: Arc<dyn LogSink>) -> Self {
        Self { sink }
    }

    pub fn emit(&self, args: fmt::Arguments<'_>) {
        self.sink.append_line(&args.to_string());
    }
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self::new(Arc::new(LogCrateSink))
    }
}

impl fmt::Debug for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Diagnostics").finish_non_exhaustive()
    }
}

/// Emits one diagnostic line, `format!` style.
macro_rules! diag {
    ($diag:expr, $($arg:tt)+) => {
        $diag.emit(format_args!($($arg)+))
    };
}
pub(crate) use diag;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::channel;

    #[test]
    fn test_writer_sink_appends_lines() {
        let sink = WriterSink::new(Vec::new());
        sink.append_line("first");
        sink.append_line("second");
        let written = String::from_utf8(sink.into_inner()).unwrap();
        assert_eq!(written, "first\nsecond\n");
    }

    #[test]
    fn test_channel_sink_and_macro() {
        let (tx, rx) = channel();
        let diag = Diagnostics::new(Arc::new(ChannelSink::new(tx)));
        diag!(diag, "Session {:#06x} created", 1);
        assert_eq!(rx.recv().unwrap(), "Session 0x0001 created");
    }

    #[test]
    fn test_channel_sink_survives_closed_receiver() {
        let (tx, rx) = channel();
        drop(rx);
        let sink = ChannelSink::new(tx);
        sink.append_line("nobody listens");
    }
}
