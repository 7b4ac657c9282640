//! Byte-count progress for payload transfers
//!
//! Draws on stderr so a listing streamed to stdout stays clean. When
//! disabled the bar is hidden and every call is a cheap no-op.

use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

pub struct TransferProgress {
    bar: ProgressBar,
    enabled: bool,
}

impl TransferProgress {
    pub fn new(enabled: bool, label: &str) -> Self {
        if !enabled {
            return Self::hidden();
        }
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} {msg} {bytes} ({bytes_per_sec})")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏"),
        );
        bar.set_message(label.to_string());
        bar.enable_steady_tick(Duration::from_millis(100));
        Self { bar, enabled: true }
    }

    pub fn hidden() -> Self {
        Self {
            bar: ProgressBar::hidden(),
            enabled: false,
        }
    }

    /// Switch to a bounded bar once the payload length is known
    pub fn set_length(&self, len: u64) {
        if !self.enabled {
            return;
        }
        self.bar.set_length(len);
        self.bar.set_style(
            ProgressStyle::default_bar()
                .template("{msg} [{bar:30.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec})")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=> "),
        );
    }

    pub fn inc(&self, n: u64) {
        self.bar.inc(n);
    }

    pub fn finish(&self) {
        if self.enabled {
            self.bar.finish_and_clear();
        }
    }
}
