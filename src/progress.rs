//! Progress bar for interactive runs.

use std::sync::Arc;
use std::time::Duration;

use bulkhttp_core::{ProgressSink, ProgressUpdate};
use indicatif::{ProgressBar, ProgressStyle};

/// [`ProgressSink`] rendering an indicatif bar on stderr.
#[derive(Debug)]
pub(crate) struct BarProgress {
    bar: ProgressBar,
}

impl BarProgress {
    pub(crate) fn new() -> Self {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template("{spinner} [{elapsed_precise}] {bar:30} {pos}/{len} batches {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        bar.enable_steady_tick(Duration::from_millis(120));
        Self { bar }
    }
}

impl ProgressSink for BarProgress {
    fn report(&self, update: ProgressUpdate) {
        self.bar.set_length(update.total);
        self.bar.set_position(update.completed);
        self.bar.set_message(format!("({} records)", update.records));
    }

    fn finish(&self, update: ProgressUpdate) {
        self.report(update);
        self.bar.finish_and_clear();
    }
}

/// Returns a bar when progress should be drawn.
pub(crate) fn progress_sink(
    stderr_is_terminal: bool,
    quiet: bool,
) -> Option<Arc<dyn ProgressSink>> {
    if should_draw(stderr_is_terminal, quiet, is_dumb_terminal()) {
        Some(Arc::new(BarProgress::new()))
    } else {
        None
    }
}

fn is_dumb_terminal() -> bool {
    std::env::var("TERM").is_ok_and(|value| value.eq_ignore_ascii_case("dumb"))
}

fn should_draw(stderr_is_terminal: bool, quiet: bool, dumb_terminal: bool) -> bool {
    stderr_is_terminal && !quiet && !dumb_terminal
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_draw_only_on_interactive_terminals() {
        assert!(should_draw(true, false, false));
        assert!(!should_draw(false, false, false));
        assert!(!should_draw(true, true, false));
        assert!(!should_draw(true, false, true));
    }

    #[test]
    fn test_no_sink_when_not_a_terminal() {
        assert!(progress_sink(false, false).is_none());
    }

    #[test]
    fn test_bar_tracks_updates() {
        let progress = BarProgress::new();
        progress.report(ProgressUpdate {
            completed: 2,
            total: 5,
            records: 20,
        });
        assert_eq!(progress.bar.position(), 2);
        assert_eq!(progress.bar.length(), Some(5));
        progress.finish(ProgressUpdate {
            completed: 5,
            total: 5,
            records: 50,
        });
        assert!(progress.bar.is_finished());
    }
}
