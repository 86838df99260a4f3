//! Line filter applied to everything the managed application prints.

use regex::Regex;
use std::sync::LazyLock;

/// CSI sequences ending in `m` (SGR) or `z`.
static ANSI_ESCAPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b\[[0-9;]*[mz]").expect("valid ANSI regex"));

/// Leading `2024-01-01T00:00:00.000000Z` plus the whitespace after it.
static LEADING_TIMESTAMP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}\.\d{6}Z\s+").expect("valid timestamp regex")
});

/// Reset token left behind when the escape byte was already stripped upstream.
const BARE_RESET: &str = "[0m";

/// Strips colour codes and the leading log timestamp from `line`.
/// Returns `None` when nothing is left to show.
pub fn filter_line(line: &str) -> Option<String> {
    let without_ansi = ANSI_ESCAPE.replace_all(line, "");
    let without_reset = without_ansi.replace(BARE_RESET, "");
    let trimmed = without_reset.trim_start();
    let filtered = LEADING_TIMESTAMP.replace(trimmed, "");
    let filtered = filtered.trim();
    (!filtered.is_empty()).then(|| filtered.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_timestamp_and_colours() {
        let line = "2024-01-01T00:00:00.000000Z \x1b[32mINFO hello\x1b[0m";
        assert_eq!(filter_line(line).as_deref(), Some("INFO hello"));
    }

    #[test]
    fn strips_bare_reset_token() {
        assert_eq!(filter_line("WARN careful[0m").as_deref(), Some("WARN careful"));
    }

    #[test]
    fn strips_z_terminated_sequences() {
        assert_eq!(filter_line("\x1b[1;2zERROR boom").as_deref(), Some("ERROR boom"));
    }

    #[test]
    fn keeps_timestamp_that_is_not_leading() {
        let line = "INFO at 2024-01-01T00:00:00.000000Z done";
        assert_eq!(filter_line(line).as_deref(), Some(line));
    }

    #[test]
    fn keeps_timestamp_with_wrong_precision() {
        let line = "2024-01-01T00:00:00.000Z INFO";
        assert_eq!(filter_line(line).as_deref(), Some(line));
    }

    #[test]
    fn drops_lines_that_filter_to_nothing() {
        assert_eq!(filter_line(""), None);
        assert_eq!(filter_line("   \r"), None);
        assert_eq!(filter_line("\x1b[0m"), None);
        assert_eq!(filter_line("2024-01-01T00:00:00.000000Z   \x1b[0m"), None);
    }

    #[test]
    fn trims_surrounding_whitespace() {
        assert_eq!(filter_line("  \tINFO padded  \n").as_deref(), Some("INFO padded"));
    }
}
