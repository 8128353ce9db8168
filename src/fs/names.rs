//! Filename sanitization and parsing for the mounted namespace:
//! `<sanitized-title>[<number>].md`, plus the synthetic `<title>[new].md`
//! form `Create`/`Lookup` accept for a not-yet-pushed issue.

/// Map a title to the lowercase, hyphenated stem used in a file name, per
/// the namespace's sanitization rule.
pub fn sanitize_title(title: &str) -> String {
    let mut out = String::with_capacity(title.len());
    let mut last_was_dash = false;
    for ch in title.chars() {
        let mapped = if ch == ' ' { '-' } else { ch.to_ascii_lowercase() };
        if mapped == '-' {
            if !last_was_dash {
                out.push('-');
            }
            last_was_dash = true;
        } else if mapped.is_ascii_lowercase() || mapped.is_ascii_digit() {
            out.push(mapped);
            last_was_dash = false;
        }
        // anything else outside [a-z0-9-] is dropped
    }

    let trimmed = out.trim_matches('-');
    let mut truncated: String = trimmed.chars().take(50).collect();
    while truncated.ends_with('-') {
        truncated.pop();
    }

    if truncated.is_empty() {
        "issue".to_string()
    } else {
        truncated
    }
}

/// The file name for a cached issue.
pub fn file_name(title: &str, number: u64) -> String {
    format!("{}[{number}].md", sanitize_title(title))
}

/// Extract the issue number from the final `[<digits>]` before `.md`.
/// Returns `None` for anything that doesn't parse that way, including the
/// synthetic `[new]` marker.
pub fn parse_number(name: &str) -> Option<u64> {
    let stem = name.strip_suffix(".md")?;
    let open = stem.rfind('[')?;
    let close = stem.rfind(']')?;
    if close != stem.len() - 1 || close <= open + 1 {
        return None;
    }
    stem[open + 1..close].parse().ok()
}

/// True for the synthetic new-issue form `<title>[new].md`.
pub fn is_new_issue_name(name: &str) -> bool {
    name.strip_suffix(".md")
        .map(|stem| stem.ends_with("[new]"))
        .unwrap_or(false)
}

/// The title implied by a `<title>[new].md` name: the sanitized stem with
/// hyphens turned back into spaces (the inverse `Create` documents).
pub fn new_issue_title(name: &str) -> Option<String> {
    let stem = name.strip_suffix("[new].md")?;
    Some(crate::codec::title_from_sanitized_name(stem))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowercases_and_hyphenates_spaces() {
        assert_eq!(sanitize_title("Fix Login Bug"), "fix-login-bug");
    }

    #[test]
    fn drops_characters_outside_allowed_set() {
        assert_eq!(sanitize_title("Crash! (on startup)"), "crash-on-startup");
    }

    #[test]
    fn collapses_runs_of_dashes_and_trims_ends() {
        assert_eq!(sanitize_title("  --weird---title--  "), "weird-title");
    }

    #[test]
    fn empty_result_falls_back_to_issue() {
        assert_eq!(sanitize_title("!!!"), "issue");
        assert_eq!(sanitize_title(""), "issue");
    }

    #[test]
    fn truncates_to_fifty_chars_trimming_trailing_dash() {
        let long = "a ".repeat(40);
        let sanitized = sanitize_title(&long);
        assert!(sanitized.len() <= 50);
        assert!(!sanitized.ends_with('-'));
    }

    #[test]
    fn parse_number_reads_trailing_bracket() {
        assert_eq!(parse_number("fix-login-bug[42].md"), Some(42));
        assert_eq!(parse_number("issue[7].md"), Some(7));
    }

    #[test]
    fn parse_number_rejects_new_marker_and_malformed_names() {
        assert_eq!(parse_number("fix-login-bug[new].md"), None);
        assert_eq!(parse_number("no-brackets.md"), None);
        assert_eq!(parse_number("fix[1].txt"), None);
    }

    #[test]
    fn new_issue_name_round_trips_title() {
        assert!(is_new_issue_name("draft-bug[new].md"));
        assert!(!is_new_issue_name("draft-bug[3].md"));
        assert_eq!(new_issue_title("draft-bug[new].md").as_deref(), Some("draft bug"));
    }
}
