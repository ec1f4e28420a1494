//! Where a poll summary goes once the poll is done: the log, stdout, or a
//! CSV history file with one row per poll.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use csv::WriterBuilder;
use tracing::{debug, info, warn};

use crate::stats::PollSummary;

/// Logs the merge counters, and a warning when the poll dropped anything.
pub fn report(summary: &PollSummary) {
    info!(
        source = summary.source.as_deref().unwrap_or("-"),
        entities = summary.total_entities,
        stop_events = summary.stop_events_inserted + summary.stop_events_updated,
        vehicles = summary.vehicles_inserted + summary.vehicles_updated,
        "Poll complete"
    );
    if let Some(drops) = describe_drops(summary) {
        warn!(%drops, "Poll dropped events");
    }
}

/// Non-zero drop counters as `name=count` pairs, or `None` for a clean poll.
fn describe_drops(summary: &PollSummary) -> Option<String> {
    let counters = [
        ("stop_events_rejected", summary.stop_events_rejected),
        ("stop_events_failed", summary.stop_events_failed),
        ("trips_skipped", summary.trips_skipped),
        ("vehicles_rejected", summary.vehicles_rejected),
        ("vehicles_failed", summary.vehicles_failed),
        ("vehicles_stale", summary.vehicles_stale),
    ];

    let drops: Vec<_> = counters
        .iter()
        .filter(|(_, n)| *n > 0)
        .map(|(name, n)| format!("{name}={n}"))
        .collect();
    (!drops.is_empty()).then(|| drops.join(" "))
}

/// Writes the summary as pretty JSON followed by a newline.
pub fn write_json<W: Write>(mut writer: W, summary: &PollSummary) -> Result<()> {
    serde_json::to_writer_pretty(&mut writer, summary)?;
    writeln!(writer)?;
    Ok(())
}

/// Appends the summary as one CSV row, creating the file and any missing
/// parent directories first.
///
/// The header row is written only when the file is new or empty.
pub fn append_record(path: &Path, summary: &PollSummary) -> Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir)
            .with_context(|| format!("creating directory {}", dir.display()))?;
    }

    let file = OpenOptions::new()
        .append(true)
        .create(true)
        .open(path)
        .with_context(|| format!("opening {}", path.display()))?;
    let needs_header = file.metadata()?.len() == 0;
    debug!(path = %path.display(), needs_header, "Appending poll summary");

    let mut writer = WriterBuilder::new()
        .has_headers(needs_header)
        .from_writer(file);
    writer.serialize(summary)?;
    writer.flush()?;

    Ok(())
}
