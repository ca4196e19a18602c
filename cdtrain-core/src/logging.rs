//! Run logging sink.
//!
//! The controller and tasks report through an injected [`RunLogger`] rather than a
//! process-wide logger. [`TracingLogger`] forwards everything to `tracing`;
//! [`MemoryLogger`] keeps the lines in memory for assertions.

use std::sync::Mutex;

use crate::metrics::AverageMeter;

/// Target used for `dump` events so subscribers can route them to a file only.
pub const DUMP_TARGET: &str = "cdtrain::dump";

/// Severity of a logged line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Show,
    Warning,
    Error,
    Dump,
}

/// Observability sink for a run.
pub trait RunLogger: Send + Sync {
    /// Informational message.
    fn show(&self, msg: &str);

    /// Informational message that starts a new visual block.
    fn show_nl(&self, msg: &str) {
        self.show(msg);
    }

    fn warning(&self, msg: &str);

    fn error(&self, msg: &str);

    /// Record-only message (progress descriptions, run notes).
    fn dump(&self, msg: &str);
}

/// Forwards run messages to `tracing`.
#[derive(Debug, Default, Clone)]
pub struct TracingLogger;

impl RunLogger for TracingLogger {
    fn show(&self, msg: &str) {
        tracing::info!("{msg}");
    }

    fn show_nl(&self, msg: &str) {
        tracing::info!("");
        tracing::info!("{msg}");
    }

    fn warning(&self, msg: &str) {
        tracing::warn!("{msg}");
    }

    fn error(&self, msg: &str) {
        tracing::error!("{msg}");
    }

    fn dump(&self, msg: &str) {
        tracing::debug!(target: DUMP_TARGET, "{msg}");
    }
}

/// Keeps every line in memory.
#[derive(Debug, Default)]
pub struct MemoryLogger {
    lines: Mutex<Vec<(LogLevel, String)>>,
}

impl MemoryLogger {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, level: LogLevel, msg: &str) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.push((level, msg.to_string()));
        }
    }

    pub fn lines(&self) -> Vec<(LogLevel, String)> {
        self.lines.lock().map(|l| l.clone()).unwrap_or_default()
    }

    /// Messages logged at `level`.
    pub fn at(&self, level: LogLevel) -> Vec<String> {
        self.lines()
            .into_iter()
            .filter(|(l, _)| *l == level)
            .map(|(_, m)| m)
            .collect()
    }

    pub fn contains(&self, level: LogLevel, needle: &str) -> bool {
        self.at(level).iter().any(|m| m.contains(needle))
    }
}

impl RunLogger for MemoryLogger {
    fn show(&self, msg: &str) {
        self.push(LogLevel::Show, msg);
    }

    fn warning(&self, msg: &str) {
        self.push(LogLevel::Warning, msg);
    }

    fn error(&self, msg: &str) {
        self.push(LogLevel::Error, msg);
    }

    fn dump(&self, msg: &str) {
        self.push(LogLevel::Dump, msg);
    }
}

/// Build a progress description such as `[ 3/10] loss 0.2500 (0.3125)`.
///
/// Each item shows the latest value followed by the running average.
pub fn make_desc(iter: usize, total: usize, items: &[(&str, &AverageMeter)]) -> String {
    let width = total.to_string().len();
    let mut desc = format!("[{iter:>width$}/{total}]");
    for (name, meter) in items {
        desc.push_str(&format!(" {name} {:.4} ({:.4})", meter.val(), meter.avg()));
    }
    desc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_make_desc_formats_value_and_average() {
        let mut loss = AverageMeter::new();
        loss.update(0.5, 2);
        loss.update(0.25, 2);
        let desc = make_desc(3, 10, &[("loss", &loss)]);
        assert_eq!(desc, "[ 3/10] loss 0.2500 (0.3750)");
    }

    #[test]
    fn test_memory_logger_filters_by_level() {
        let logger = MemoryLogger::new();
        logger.show("Epoch: [0]");
        logger.warning("validation ends early");
        logger.error("=> No parameter is to be loaded.");
        logger.show_nl("Validate");

        assert_eq!(logger.at(LogLevel::Show), vec!["Epoch: [0]", "Validate"]);
        assert!(logger.contains(LogLevel::Warning, "ends early"));
        assert!(logger.contains(LogLevel::Error, "No parameter"));
        assert!(logger.at(LogLevel::Dump).is_empty());
    }
}
