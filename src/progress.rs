//! Text progress bar over the transfer callback seam.
//!
//! Rendering goes to stderr, never to the protocol stream on stdout. The
//! bar width tracks the terminal (or tmux pane) so redraws do not wrap and
//! turn into junk the peer's filter has to cut away.

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

use crate::callback::TransferCallback;

pub struct TextProgressBar {
    bar: Option<ProgressBar>,
    columns: u16,
    file_num: u64,
    file_idx: u64,
    file_name: String,
}

impl TextProgressBar {
    /// `columns` bounds the rendered width; pass the tmux pane width when
    /// running inside a pane, the terminal width otherwise.
    pub fn new(columns: u16) -> Self {
        Self {
            bar: None,
            columns,
            file_num: 0,
            file_idx: 0,
            file_name: String::new(),
        }
    }

    fn style(&self) -> ProgressStyle {
        ProgressStyle::with_template(template_for(self.columns))
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> ")
    }
}

/// A narrow terminal has no room for the bar segment itself.
fn template_for(columns: u16) -> &'static str {
    if columns < 60 {
        "{prefix} {bytes}/{total_bytes} {bytes_per_sec}"
    } else {
        "{prefix} [{bar:25}] {bytes}/{total_bytes} {bytes_per_sec} {eta}"
    }
}

impl TransferCallback for TextProgressBar {
    fn on_num(&mut self, num: u64) {
        self.file_num = num;
        self.file_idx = 0;
    }

    fn on_name(&mut self, name: &str) {
        self.file_idx += 1;
        self.file_name = name.to_string();
    }

    fn on_size(&mut self, size: u64) {
        let bar = ProgressBar::with_draw_target(Some(size), ProgressDrawTarget::stderr());
        bar.set_style(self.style());
        bar.set_prefix(format!(
            "({}/{}) {}",
            self.file_idx, self.file_num, self.file_name
        ));
        self.bar = Some(bar);
    }

    fn on_step(&mut self, step: u64) {
        if let Some(bar) = &self.bar {
            bar.set_position(step);
        }
    }

    fn on_done(&mut self) {
        if let Some(bar) = self.bar.take() {
            bar.finish_and_clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bar_follows_callback_sequence() {
        let mut progress = TextProgressBar::new(80);
        progress.on_num(2);
        progress.on_name("a.txt");
        assert!(progress.bar.is_none());

        progress.on_size(100);
        let bar = progress.bar.as_ref().unwrap();
        assert_eq!(bar.length(), Some(100));
        assert_eq!(bar.prefix(), "(1/2) a.txt");

        progress.on_step(0);
        progress.on_step(60);
        assert_eq!(progress.bar.as_ref().unwrap().position(), 60);

        progress.on_done();
        assert!(progress.bar.is_none());

        // Second file of the same conversation.
        progress.on_name("b.txt");
        progress.on_size(10);
        assert_eq!(progress.bar.as_ref().unwrap().prefix(), "(2/2) b.txt");
    }

    #[test]
    fn test_narrow_terminal_drops_bar_segment() {
        assert!(!template_for(40).contains("{bar"));
        assert!(template_for(120).contains("{bar"));
    }

    #[test]
    fn test_step_before_size_is_ignored() {
        let mut progress = TextProgressBar::new(80);
        progress.on_step(50);
        assert!(progress.bar.is_none());
        progress.on_done();
    }
}
