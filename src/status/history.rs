use std::fmt;

use time::Duration;

use super::StatusEntry;

/// One history line and the time since the entry before it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryRow {
    pub entry: StatusEntry,
    /// `None` for the first entry of a build, or when either timestamp
    /// does not parse.
    pub since_previous: Option<Duration>,
}

/// Status history of one build, possibly tailed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct History {
    pub build: String,
    pub rows: Vec<HistoryRow>,
    /// Entries in the full history, before tailing.
    pub total_entries: usize,
    first_timestamp: Option<String>,
    last_timestamp: Option<String>,
    /// First to last entry of the full history.
    pub elapsed: Option<Duration>,
}

impl History {
    pub fn from_entries(build: &str, entries: Vec<StatusEntry>, tail: Option<usize>) -> Self {
        let total_entries = entries.len();
        let first_timestamp = entries.first().map(|e| e.timestamp.clone());
        let last_timestamp = entries.last().map(|e| e.timestamp.clone());
        let elapsed = match (entries.first(), entries.last()) {
            (Some(first), Some(last)) => between(first, last),
            _ => None,
        };

        let mut rows = Vec::with_capacity(entries.len());
        let mut previous: Option<&StatusEntry> = None;
        for entry in &entries {
            rows.push(HistoryRow {
                entry: entry.clone(),
                since_previous: previous.and_then(|prev| between(prev, entry)),
            });
            previous = Some(entry);
        }

        // Durations above were computed on the full history, so tailing
        // keeps the gap to the entry just before the window.
        if let Some(tail) = tail {
            let skip = rows.len().saturating_sub(tail);
            rows.drain(..skip);
        }

        Self {
            build: build.to_string(),
            rows,
            total_entries,
            first_timestamp,
            last_timestamp,
            elapsed,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.total_entries == 0
    }
}

fn between(earlier: &StatusEntry, later: &StatusEntry) -> Option<Duration> {
    Some(later.parsed_timestamp()? - earlier.parsed_timestamp()?)
}

impl fmt::Display for History {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return writeln!(f, "No status history for '{}'", self.build);
        }

        writeln!(f, "History for '{}':", self.build)?;
        if self.rows.len() < self.total_entries {
            writeln!(
                f,
                "(last {} of {} entries)",
                self.rows.len(),
                self.total_entries
            )?;
        }

        let status_w = self
            .rows
            .iter()
            .map(|row| row.entry.status.as_str().len())
            .max()
            .unwrap_or(0);
        for row in &self.rows {
            let gap = match (&row.since_previous, row.entry.parsed_timestamp()) {
                (Some(d), _) => format!("+{}", format_duration(*d)),
                (None, None) => "?".to_string(),
                (None, Some(_)) => "-".to_string(),
            };
            let line = format!(
                "  {}  {:<status_w$}  {:>12}  {}",
                row.entry.timestamp,
                row.entry.status.as_str(),
                gap,
                row.entry.message,
            );
            writeln!(f, "{}", line.trim_end())?;
        }

        match (&self.elapsed, &self.first_timestamp, &self.last_timestamp) {
            (Some(elapsed), _, _) => writeln!(f, "Total elapsed: {}", format_duration(*elapsed)),
            (None, Some(first), Some(last)) => {
                writeln!(f, "Total elapsed: unknown ({} .. {})", first, last)
            }
            _ => Ok(()),
        }
    }
}

/// Compact `1h 02m 03s` rendering; negative spans keep their sign.
pub fn format_duration(d: Duration) -> String {
    let sign = if d.is_negative() { "-" } else { "" };
    let total = d.whole_seconds().unsigned_abs();
    let (hours, minutes, seconds) = (total / 3600, (total % 3600) / 60, total % 60);
    if hours > 0 {
        format!("{}{}h {:02}m {:02}s", sign, hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}{}m {:02}s", sign, minutes, seconds)
    } else {
        format!("{}{}s", sign, seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::BuildStatus;

    fn entry(timestamp: &str, status: BuildStatus) -> StatusEntry {
        StatusEntry {
            timestamp: timestamp.to_string(),
            status,
            message: String::new(),
        }
    }

    fn sample() -> Vec<StatusEntry> {
        vec![
            entry("2025-01-01T00:00:00+00:00", BuildStatus::Started),
            entry("2025-01-01T00:00:05+00:00", BuildStatus::DatasetsCreated),
            entry("2025-01-01T00:10:05+00:00", BuildStatus::OsInstalled),
            entry("2025-01-01T01:10:05+00:00", BuildStatus::VarlogMounted),
        ]
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::seconds(7)), "7s");
        assert_eq!(format_duration(Duration::seconds(65)), "1m 05s");
        assert_eq!(format_duration(Duration::seconds(3723)), "1h 02m 03s");
        assert_eq!(format_duration(Duration::seconds(-5)), "-5s");
    }

    #[test]
    fn test_durations_and_total() {
        let history = History::from_entries("demo", sample(), None);
        assert_eq!(history.rows.len(), 4);
        assert_eq!(history.rows[0].since_previous, None);
        assert_eq!(history.rows[1].since_previous, Some(Duration::seconds(5)));
        assert_eq!(history.rows[2].since_previous, Some(Duration::minutes(10)));
        assert_eq!(history.elapsed, Some(Duration::seconds(4205)));
    }

    #[test]
    fn test_tail_keeps_gap_to_preceding_entry() {
        let history = History::from_entries("demo", sample(), Some(2));
        assert_eq!(history.rows.len(), 2);
        assert_eq!(history.total_entries, 4);
        assert_eq!(history.rows[0].entry.status, BuildStatus::OsInstalled);
        assert_eq!(history.rows[0].since_previous, Some(Duration::minutes(10)));
        assert_eq!(history.elapsed, Some(Duration::seconds(4205)));

        let rendered = history.to_string();
        assert!(rendered.contains("(last 2 of 4 entries)"));
        assert!(rendered.contains("+1h 00m 00s"));
    }

    #[test]
    fn test_unparsable_timestamp_falls_back_to_raw() {
        let entries = vec![
            entry("yesterday", BuildStatus::Started),
            entry("2025-01-01T00:00:05+00:00", BuildStatus::DatasetsCreated),
        ];
        let history = History::from_entries("demo", entries, None);
        assert_eq!(history.rows[1].since_previous, None);
        assert_eq!(history.elapsed, None);

        let rendered = history.to_string();
        assert!(rendered.contains("yesterday"));
        assert!(rendered.contains("Total elapsed: unknown (yesterday .. 2025-01-01T00:00:05+00:00)"));
    }

    #[test]
    fn test_empty_history() {
        let history = History::from_entries("ghost", Vec::new(), Some(5));
        assert!(history.is_empty());
        assert_eq!(history.to_string(), "No status history for 'ghost'\n");
    }
}
