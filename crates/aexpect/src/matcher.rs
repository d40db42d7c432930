//! Pattern compilation, matchers, and output filters for the expect engine.

use aexpect_core::ExpectError;
use regex::Regex;

/// Compile a pattern list. Empty entries stay in place as `None` so match
/// indices line up with the caller's list, but they can never match.
pub(crate) fn compile_patterns(patterns: &[&str]) -> Result<Vec<Option<Regex>>, ExpectError> {
    patterns
        .iter()
        .map(|pattern| {
            if pattern.is_empty() {
                Ok(None)
            } else {
                Regex::new(pattern).map(Some).map_err(ExpectError::from)
            }
        })
        .collect()
}

/// Index of the first pattern that finds a substring match in `text`.
pub(crate) fn match_patterns(text: &str, patterns: &[Option<Regex>]) -> Option<usize> {
    patterns
        .iter()
        .position(|pattern| matches!(pattern, Some(re) if re.is_match(text)))
}

/// Index of the highest-priority pattern matching any of `lines`.
/// Priority runs from the last pattern to the first.
pub(crate) fn match_patterns_multiline(
    lines: &[&str],
    patterns: &[Option<Regex>],
) -> Option<usize> {
    patterns
        .iter()
        .enumerate()
        .rev()
        .find(|(_, pattern)| {
            matches!(pattern, Some(re) if lines.iter().any(|line| re.is_match(line)))
        })
        .map(|(index, _)| index)
}

/// Last whitespace-delimited token of `text`, or `""`.
pub(crate) fn last_word(text: &str) -> &str {
    text.split_whitespace().next_back().unwrap_or("")
}

/// Last line of `text` that contains more than whitespace, or `""`.
pub(crate) fn last_nonempty_line(text: &str) -> &str {
    text.lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .unwrap_or("")
}
