//! 📊 progress.rs: "Are we there yet?" Every bulk load, every time, forever.
//!
//! 🚀 Two jobs: a live progress bar while the input file is being fed to the processor, and
//! a comfy table of the processor's final counters once it's all over.
//!
//! ⚠️  Warning: Watching this progress bar will not make the cluster index faster.
//! Neither will refreshing it. We've tried. Science says no.

use std::time::{Duration, Instant};

use comfy_table::{Cell, CellAlignment, ContentArrangement, Table, presets::NOTHING};
use indicatif::{ProgressBar, ProgressStyle};

use crate::stats::BulkProcessorStats;

// -- 📏 one mebibyte, not a megabyte, pedants. there's a difference and I will die on this hill.
const MIB: u64 = 1024 * 1024;

/// 📦 Bytes, scaled to whatever unit the total deserves.
fn format_bytes(bytes: u64, total: u64) -> String {
    if total >= 512 * MIB {
        format!("{:.2} MiB", bytes as f64 / MIB as f64)
    } else if total >= 1024 {
        format!("{:.2} KiB", bytes as f64 / 1024.0)
    } else {
        format!("{bytes} bytes")
    }
}

/// 🔢 "1000000" → "1,000,000". You're welcome, eyes.
fn format_number(n: u64) -> String {
    let digits = n.to_string();
    let mut result = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result
}

/// ⏱️ MM:SS, or HH:MM:SS for the long hauls. If it's HH:MM:SS, call your mom.
fn format_duration(duration: Duration) -> String {
    let total_secs = duration.as_secs();
    let (hours, minutes, seconds) = (total_secs / 3600, (total_secs % 3600) / 60, total_secs % 60);
    if hours > 0 {
        format!("{hours:02}:{minutes:02}:{seconds:02}")
    } else {
        format!("{minutes:02}:{seconds:02}")
    }
}

fn right(content: String) -> Cell {
    Cell::new(content).set_alignment(CellAlignment::Right)
}

/// 📊 The live display for one input file: bytes read, docs handed to the processor, and what
/// the processor has made of them so far.
///
/// # Ancient Proverb
/// "He who bulk loads without a progress bar, bulk loads alone and in darkness."
pub(crate) struct LoadProgress {
    label: String,
    total_size: u64,
    bytes_read: u64,
    docs_added: u64,
    progress_bar: ProgressBar,
    started: Instant,
}

impl std::fmt::Debug for LoadProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // -- 🎭 ProgressBar is a diva and doesn't derive Debug
        f.debug_struct("LoadProgress")
            .field("label", &self.label)
            .field("total_size", &self.total_size)
            .field("bytes_read", &self.bytes_read)
            .field("docs_added", &self.docs_added)
            .finish()
    }
}

impl LoadProgress {
    /// 🚀 `total_size` is the input size in bytes; 0 means "no idea", which disables the ETA.
    pub(crate) fn new(label: String, total_size: u64) -> Self {
        let progress_bar = ProgressBar::new(total_size);
        let style = ProgressStyle::default_bar()
            .template("{msg}\n| [{bar:40.cyan/blue}]")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=>-");
        progress_bar.set_style(style);
        Self {
            label,
            total_size,
            bytes_read: 0,
            docs_added: 0,
            progress_bar,
            started: Instant::now(),
        }
    }

    /// 🔄 Fold in freshly read input and redraw.
    pub(crate) fn update(&mut self, bytes_read: u64, docs_added: u64, stats: &BulkProcessorStats) {
        self.bytes_read += bytes_read;
        self.docs_added += docs_added;
        self.progress_bar.set_message(self.render(stats));
        self.progress_bar.set_position(self.bytes_read);
    }

    pub(crate) fn finish(&self) {
        self.progress_bar.finish();
    }

    fn render(&self, stats: &BulkProcessorStats) -> String {
        let elapsed = self.started.elapsed();
        let elapsed_secs = elapsed.as_secs_f64();
        let (docs_per_sec, mib_per_sec) = if elapsed_secs > 0.0 {
            (
                self.docs_added as f64 / elapsed_secs,
                self.bytes_read as f64 / elapsed_secs / MIB as f64,
            )
        } else {
            (0.0, 0.0)
        };
        let percent = if self.total_size > 0 {
            self.bytes_read as f64 / self.total_size as f64 * 100.0
        } else {
            0.0
        };
        // 🔮 linear extrapolation: assumes the rest of the file looks like the start of it
        let remaining = if percent > 0.0 && percent < 100.0 {
            let remaining_secs = elapsed_secs / (percent / 100.0) - elapsed_secs;
            format_duration(Duration::from_secs_f64(remaining_secs.max(0.0)))
        } else {
            "--:--".to_string()
        };

        let mut table = Table::new();
        table.load_preset(NOTHING);
        table.set_content_arrangement(ContentArrangement::Dynamic);
        table.add_row(vec![
            right(format!("{} Docs/s", format_number(docs_per_sec as u64))),
            right(format!("{} Docs added", format_number(self.docs_added))),
        ]);
        table.add_row(vec![
            right(format!("{mib_per_sec:.2} MiB/s")),
            right(format!(
                "{} / {}",
                format_bytes(self.bytes_read, self.total_size),
                format_bytes(self.total_size, self.total_size)
            )),
        ]);
        table.add_row(vec![
            right(format!("{} succeeded", format_number(stats.succeeded))),
            right(format!("{} failed", format_number(stats.failed))),
        ]);
        table.add_row(vec![
            right(format!("{} elapsed", format_duration(elapsed))),
            right(format!("{remaining} remaining")),
        ]);
        format!("input: {}\n{table}", self.label)
    }
}

/// 🍽️ The final scoreboard: one row per counter, then one row per worker.
pub fn stats_table(stats: &BulkProcessorStats) -> Table {
    let mut table = Table::new();
    table.load_preset(NOTHING);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["", "count"]);
    for (label, value) in [
        ("flushed", stats.flushed),
        ("committed", stats.committed),
        ("indexed", stats.indexed),
        ("created", stats.created),
        ("updated", stats.updated),
        ("deleted", stats.deleted),
        ("succeeded", stats.succeeded),
        ("failed", stats.failed),
    ] {
        table.add_row(vec![Cell::new(label), right(format_number(value))]);
    }
    for (ordinal, worker) in stats.workers.iter().enumerate() {
        table.add_row(vec![
            Cell::new(format!("worker {ordinal}")),
            right(format!(
                "{} queued, last took {}ms",
                format_number(worker.queued),
                worker.last_duration.as_millis()
            )),
        ]);
    }
    table
}
