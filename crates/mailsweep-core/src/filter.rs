//! The in-memory filter specification and its deterministic rendering
//! into a single parenthesised IMAP SEARCH expression.

use std::path::PathBuf;

use time::{OffsetDateTime, UtcOffset};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SeenFilter {
    #[default]
    DontCare,
    RequireSeen,
    RequireUnseen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlaggedFilter {
    #[default]
    DontCare,
    RequireFlagged,
    RequireUnflagged,
}

/// A source of a single point in time, resolved against the cycle's
/// wall-clock instant (day-count deltas) or the filesystem (a
/// timestamp file's first line, or the file's mtime).
#[derive(Debug, Clone)]
pub enum TimeSource {
    DaysAgo(i64),
    FileTimestamp(PathBuf),
    FileMtime(PathBuf),
}

impl TimeSource {
    fn resolve(&self, now: OffsetDateTime) -> std::io::Result<OffsetDateTime> {
        match self {
            TimeSource::DaysAgo(days) => Ok(now - time::Duration::days(*days)),
            TimeSource::FileTimestamp(path) => {
                let raw = std::fs::read_to_string(path)?;
                let first_line = raw.lines().next().unwrap_or("").trim();
                let secs: i64 = first_line.parse().map_err(|_| {
                    std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("{} does not start with a unix timestamp", path.display()),
                    )
                })?;
                OffsetDateTime::from_unix_timestamp(secs)
                    .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))
            }
            TimeSource::FileMtime(path) => {
                let metadata = std::fs::metadata(path)?;
                Ok(OffsetDateTime::from(metadata.modified()?))
            }
        }
    }
}

/// All-optional, AND-composed filter over a folder's messages.
#[derive(Debug, Clone, Default)]
pub struct FilterSpec {
    pub seen: SeenFilter,
    pub flagged: FlaggedFilter,
    pub from_includes: Vec<String>,
    pub from_excludes: Vec<String>,
    pub older_than: Vec<TimeSource>,
    pub newer_than: Vec<TimeSource>,
}

impl FilterSpec {
    /// `auto` marking resolves to `seen` iff this is the only constraint,
    /// i.e. flagged is don't-care.
    pub fn requires_unseen_only(&self) -> bool {
        matches!(self.seen, SeenFilter::RequireUnseen) && matches!(self.flagged, FlaggedFilter::DontCare)
    }

    /// `auto` marking resolves to `flagged` iff this is the only
    /// constraint, i.e. seen is don't-care.
    pub fn requires_unflagged_only(&self) -> bool {
        matches!(self.flagged, FlaggedFilter::RequireUnflagged) && matches!(self.seen, SeenFilter::DontCare)
    }

    /// True when the rendered SEARCH string depends on wall-clock time
    /// and must be re-rendered every cycle.
    pub fn is_dynamic(&self) -> bool {
        !self.older_than.is_empty() || !self.newer_than.is_empty()
    }

    /// Renders the filter to a SEARCH expression at the given instant,
    /// returning the expression and whether it was time-dependent.
    pub fn render(&self, now: OffsetDateTime) -> std::io::Result<(String, bool)> {
        let mut terms = Vec::new();

        match self.seen {
            SeenFilter::RequireSeen => terms.push("SEEN".to_string()),
            SeenFilter::RequireUnseen => terms.push("UNSEEN".to_string()),
            SeenFilter::DontCare => {}
        }
        match self.flagged {
            FlaggedFilter::RequireFlagged => terms.push("FLAGGED".to_string()),
            FlaggedFilter::RequireUnflagged => terms.push("UNFLAGGED".to_string()),
            FlaggedFilter::DontCare => {}
        }
        for from in &self.from_includes {
            terms.push(format!("FROM {}", mailsweep_proto::command::quote(from)));
        }
        for from in &self.from_excludes {
            terms.push(format!("NOT FROM {}", mailsweep_proto::command::quote(from)));
        }

        if !self.older_than.is_empty() {
            let mut instants = Vec::with_capacity(self.older_than.len());
            for source in &self.older_than {
                instants.push(source.resolve(now)?);
            }
            let earliest = instants.into_iter().min().expect("checked non-empty above");
            terms.push(format!("BEFORE {}", format_imap_date(earliest)));
        }

        if !self.newer_than.is_empty() {
            let mut instants = Vec::with_capacity(self.newer_than.len());
            for source in &self.newer_than {
                instants.push(source.resolve(now)?);
            }
            let latest = instants.into_iter().max().expect("checked non-empty above");
            terms.push(format!("NOT BEFORE {}", format_imap_date(latest)));
        }

        let dynamic = self.is_dynamic();
        if terms.is_empty() {
            Ok(("(ALL)".to_string(), dynamic))
        } else {
            Ok((format!("({})", terms.join(" ")), dynamic))
        }
    }
}

fn format_imap_date(instant: OffsetDateTime) -> String {
    let date = instant.to_offset(UtcOffset::UTC).date();
    mailsweep_proto::command::format_date(date.day(), u8::from(date.month()), date.year())
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Month;

    fn at(year: i32, month: Month, day: u8) -> OffsetDateTime {
        OffsetDateTime::new_utc(
            time::Date::from_calendar_date(year, month, day).unwrap(),
            time::Time::MIDNIGHT,
        )
    }

    #[test]
    fn empty_filter_renders_all() {
        let filter = FilterSpec::default();
        let (rendered, dynamic) = filter.render(at(2024, Month::January, 10)).unwrap();
        assert_eq!(rendered, "(ALL)");
        assert!(!dynamic);
    }

    #[test]
    fn fixed_term_order_is_respected() {
        let filter = FilterSpec {
            seen: SeenFilter::RequireUnseen,
            flagged: FlaggedFilter::RequireFlagged,
            from_includes: vec!["a@example.com".to_string()],
            from_excludes: vec!["b@example.com".to_string()],
            older_than: vec![TimeSource::DaysAgo(7)],
            newer_than: vec![TimeSource::DaysAgo(30)],
        };
        let (rendered, dynamic) = filter.render(at(2024, Month::January, 10)).unwrap();
        assert_eq!(
            rendered,
            "(UNSEEN FLAGGED FROM \"a@example.com\" NOT FROM \"b@example.com\" BEFORE 3-Jan-2024 NOT BEFORE 11-Dec-2023)"
        );
        assert!(dynamic);
    }

    #[test]
    fn older_than_set_takes_the_earliest_instant() {
        let filter =
            FilterSpec { older_than: vec![TimeSource::DaysAgo(3), TimeSource::DaysAgo(7), TimeSource::DaysAgo(1)], ..Default::default() };
        let (rendered, _) = filter.render(at(2024, Month::January, 10)).unwrap();
        assert_eq!(rendered, "(BEFORE 3-Jan-2024)");
    }

    #[test]
    fn marking_auto_resolution_checks_seen_and_flagged_constraints() {
        let unseen_only = FilterSpec { seen: SeenFilter::RequireUnseen, ..Default::default() };
        assert!(unseen_only.requires_unseen_only());
        assert!(!unseen_only.requires_unflagged_only());

        let unflagged_only = FilterSpec { flagged: FlaggedFilter::RequireUnflagged, ..Default::default() };
        assert!(unflagged_only.requires_unflagged_only());
    }

    #[test]
    fn auto_resolution_requires_the_other_field_to_be_dont_care() {
        let both = FilterSpec {
            seen: SeenFilter::RequireUnseen,
            flagged: FlaggedFilter::RequireFlagged,
            ..Default::default()
        };
        assert!(!both.requires_unseen_only());
        assert!(!both.requires_unflagged_only());
    }
}
