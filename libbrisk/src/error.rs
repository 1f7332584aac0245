use itertools::Itertools;
use std::sync::Mutex;

pub type Error = anyhow::Error;

/// The result type used throughout this crate.
pub type Result<T = (), E = Error> = core::result::Result<T, E>;

/// Collects diagnostics reported from parallel passes. Errors are not fatal at
/// the point where they're reported; they accumulate until the next
/// checkpoint, which fails the link if anything was recorded. Warnings are
/// emitted immediately and never abort.
#[derive(Default)]
pub struct ErrorSink {
    errors: Mutex<Vec<Error>>,
}

impl ErrorSink {
    pub(crate) fn report(&self, error: Error) {
        self.errors.lock().unwrap().push(error);
    }

    /// Drains accumulated errors. Returns an error combining everything
    /// reported since the previous checkpoint.
    pub(crate) fn checkpoint(&self) -> Result {
        let mut errors = self.errors.lock().unwrap();
        if errors.is_empty() {
            return Ok(());
        }
        let combined = errors.drain(..).map(|e| format!("{e:#}")).join("\n");
        Err(anyhow::anyhow!("{combined}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkpoint_drains_reported_errors() {
        let sink = ErrorSink::default();
        assert!(sink.checkpoint().is_ok());
        sink.report(anyhow::anyhow!("duplicate symbol: foo"));
        sink.report(anyhow::anyhow!("undefined symbol: bar"));
        let message = sink.checkpoint().unwrap_err().to_string();
        assert!(message.contains("duplicate symbol: foo"));
        assert!(message.contains("undefined symbol: bar"));
        // A checkpoint clears the queue.
        assert!(sink.checkpoint().is_ok());
    }
}
