//! Command-side wire encoding: IMAP quoted strings, `BEFORE`/`SINCE` dates,
//! and tagged-command assembly.

const MONTHS: [&str; 12] =
    ["Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec"];

/// Wraps `arg` in double quotes, escaping `\` and `"` as the IMAP quoted
/// string grammar requires. The response-side parser (`parse`) recovers
/// the original string from this output for every input.
pub fn quote(arg: &str) -> String {
    let mut out = String::with_capacity(arg.len() + 2);
    out.push('"');
    for c in arg.chars() {
        if c == '\\' || c == '"' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

/// Formats a date as `D-Mon-YYYY` with a three-letter English month
/// abbreviation, as required by the IMAP `BEFORE`/`SINCE`/`SENTBEFORE`
/// search keys.
pub fn format_date(day: u8, month: u8, year: i32) -> String {
    debug_assert!((1..=12).contains(&month));
    format!("{day}-{}-{year}", MONTHS[(month - 1) as usize])
}

/// Builds a tagged command line, e.g. `tag("A1", "UID SEARCH", "(ALL)")` ->
/// `"A1 UID SEARCH (ALL)\r\n"`.
pub fn tagged(tag: &str, verb: &str, args: &str) -> String {
    if args.is_empty() {
        format!("{tag} {verb}\r\n")
    } else {
        format!("{tag} {verb} {args}\r\n")
    }
}

/// Joins a set of UIDs (already-encoded byte strings) with commas for use
/// in a UID-variant command argument.
pub fn join_uids<I, S>(uids: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out = String::new();
    for (i, uid) in uids.into_iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(uid.as_ref());
    }
    out
}

/// A monotonically increasing tag generator (`A1`, `A2`, ...), mirroring
/// the conventional IMAP4rev1 client tag scheme.
#[derive(Debug, Default)]
pub struct TagGenerator {
    next: u64,
}

impl TagGenerator {
    pub fn new() -> Self {
        Self { next: 1 }
    }

    pub fn next_tag(&mut self) -> String {
        let tag = format!("A{}", self.next);
        self.next += 1;
        tag
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quote_escapes_backslash_and_quote() {
        assert_eq!(quote("plain"), "\"plain\"");
        assert_eq!(quote("a\\b"), "\"a\\\\b\"");
        assert_eq!(quote("a\"b"), "\"a\\\"b\"");
        assert_eq!(quote("a\\\"b"), "\"a\\\\\\\"b\"");
    }

    #[test]
    fn format_date_pads_nothing_and_abbreviates_month() {
        assert_eq!(format_date(3, 1, 2024), "3-Jan-2024");
        assert_eq!(format_date(31, 12, 1999), "31-Dec-1999");
    }

    #[test]
    fn tag_generator_increments() {
        let mut r#gen = TagGenerator::new();
        assert_eq!(r#gen.next_tag(), "A1");
        assert_eq!(r#gen.next_tag(), "A2");
    }

    #[test]
    fn join_uids_joins_with_commas() {
        assert_eq!(join_uids(["1", "2", "3"]), "1,2,3");
        assert_eq!(join_uids::<[&str; 0], &str>([]), "");
    }
}
