//! Lossless, deterministic conversion between a cached issue (plus its
//! comments) and the textual form users edit.
//!
//! On-disk form: a `---`-delimited header mapping, a `# <title>` line, a
//! `## Body` section, and an optional `## Comments` section whose entries
//! are `### <created_at> - <author>` blocks carrying a
//! `<!-- comment_id: ... -->` marker.

use crate::cache::{Comment, Issue, IssueState};
use crate::error::GitmdfsError;

/// An issue as parsed back out of a markdown buffer, prior to diffing
/// against the cache.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedIssue {
    pub number: u64,
    pub repo: String,
    pub url: String,
    pub state: String,
    pub labels: Vec<String>,
    pub author: String,
    pub created_at: String,
    pub updated_at: String,
    pub validator: String,
    pub title: String,
    pub body: String,
    pub comments: Vec<ParsedComment>,
}

/// A single comment block as parsed out of the `## Comments` section.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedComment {
    pub id: i64,
    pub is_new: bool,
    pub author: String,
    pub created_at: String,
    pub body: String,
}

/// Which top-level issue fields a flush changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Changes {
    pub title_changed: bool,
    pub body_changed: bool,
}

impl Changes {
    pub fn any(&self) -> bool {
        self.title_changed || self.body_changed
    }
}

/// A comment present in the parsed buffer but absent from the cache.
#[derive(Debug, Clone, PartialEq)]
pub struct NewComment {
    pub body: String,
}

/// A comment present in both the parsed buffer and the cache, with a
/// changed body.
#[derive(Debug, Clone, PartialEq)]
pub struct EditedComment {
    pub id: i64,
    pub body: String,
}

/// Strip trailing newlines (the only whitespace the round-trip equivalence
/// ignores); both `\n` and a preceding `\r` are dropped.
fn trim_trailing_newlines(s: &str) -> &str {
    s.trim_end_matches(['\n', '\r'])
}

/// Serialize `issue` and its `comments` to the on-disk markdown form.
/// Comments are emitted in the order given (the caller is expected to have
/// already sorted them by `created_at`, matching `ListComments`).
pub fn encode(issue: &Issue, comments: &[Comment]) -> String {
    let mut labels = issue.labels.clone();
    labels.sort();

    let mut out = String::new();
    out.push_str("---\n");
    out.push_str(&format!("id: {}\n", issue.number));
    out.push_str(&format!("repo: {}\n", issue.repository));
    out.push_str("url: \n");
    out.push_str(&format!("state: {}\n", issue.state.as_str()));
    out.push_str(&format!("labels: [{}]\n", labels.join(", ")));
    out.push_str(&format!("author: {}\n", issue.author));
    out.push_str(&format!("created_at: {}\n", issue.created_at.to_rfc3339()));
    out.push_str(&format!("updated_at: {}\n", issue.updated_at.to_rfc3339()));
    out.push_str(&format!("etag: {}\n", issue.validator));
    out.push_str(&format!("comments: {}\n", comments.len()));
    out.push_str("---\n");
    out.push('\n');
    out.push_str(&format!("# {}\n", issue.title));
    out.push('\n');
    out.push_str("## Body\n");
    out.push_str(&issue.body);
    if !issue.body.ends_with('\n') {
        out.push('\n');
    }

    if !comments.is_empty() {
        out.push('\n');
        out.push_str("## Comments\n");
        for comment in comments {
            out.push_str(&format!(
                "### {} - {}\n",
                comment.created_at().to_rfc3339(),
                comment.author
            ));
            out.push_str(&format!("<!-- comment_id: {} -->\n", comment.id));
            out.push('\n');
            out.push_str(&comment.body);
            if !comment.body.ends_with('\n') {
                out.push('\n');
            }
        }
    }

    out
}

/// Parse a markdown buffer back into structured form. Normalizes Windows
/// line endings before parsing.
pub fn decode(input: &str) -> Result<ParsedIssue, GitmdfsError> {
    let normalized = input.replace("\r\n", "\n");
    let mut lines = normalized.lines();

    let first = lines.next().unwrap_or("");
    if first.trim_end() != "---" {
        return Err(GitmdfsError::decode_error("missing header delimiter"));
    }

    let mut header_lines = Vec::new();
    let mut terminated = false;
    for line in lines.by_ref() {
        if line.trim_end() == "---" {
            terminated = true;
            break;
        }
        header_lines.push(line);
    }
    if !terminated {
        return Err(GitmdfsError::decode_error("unterminated header"));
    }

    let header = parse_header(&header_lines)?;

    let rest: Vec<&str> = lines.collect();
    let (title, body, comments) = parse_body(&rest)?;

    Ok(ParsedIssue {
        number: header.id,
        repo: header.repo,
        url: header.url,
        state: header.state,
        labels: header.labels,
        author: header.author,
        created_at: header.created_at,
        updated_at: header.updated_at,
        validator: header.etag,
        title,
        body,
        comments,
    })
}

struct Header {
    id: u64,
    repo: String,
    url: String,
    state: String,
    labels: Vec<String>,
    author: String,
    created_at: String,
    updated_at: String,
    etag: String,
}

fn parse_header(lines: &[&str]) -> Result<Header, GitmdfsError> {
    let mut id: Option<u64> = None;
    let mut repo = String::new();
    let mut url = String::new();
    let mut state = "open".to_string();
    let mut labels = Vec::new();
    let mut author = String::new();
    let mut created_at = String::new();
    let mut updated_at = String::new();
    let mut etag = String::new();

    for line in lines {
        let line = line.trim_end();
        if line.trim().is_empty() {
            continue;
        }
        let Some((key, value)) = line.split_once(':') else {
            return Err(GitmdfsError::decode_error(format!(
                "malformed header line: {line}"
            )));
        };
        let key = key.trim();
        let value = value.trim();
        match key {
            "id" => {
                id = Some(value.parse::<u64>().map_err(|_| {
                    GitmdfsError::decode_error(format!("non-integer id: {value}"))
                })?);
            }
            "repo" => repo = value.to_string(),
            "url" => url = value.to_string(),
            "state" => state = value.to_string(),
            "labels" => labels = parse_label_sequence(value)?,
            "author" => author = value.to_string(),
            "created_at" => created_at = value.to_string(),
            "updated_at" => updated_at = value.to_string(),
            "etag" => etag = value.to_string(),
            "comments" => {
                // the count is informational only; the parsed comment list
                // below is the source of truth.
            }
            _ => {}
        }
    }

    let id = id.ok_or_else(|| GitmdfsError::decode_error("header missing id"))?;

    Ok(Header {
        id,
        repo,
        url,
        state,
        labels,
        author,
        created_at,
        updated_at,
        etag,
    })
}

fn parse_label_sequence(value: &str) -> Result<Vec<String>, GitmdfsError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    let inner = trimmed
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .ok_or_else(|| GitmdfsError::decode_error(format!("malformed labels: {value}")))?;
    Ok(inner
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect())
}

/// Parse everything after the header: title, body, and comments.
fn parse_body(lines: &[&str]) -> Result<(String, String, Vec<ParsedComment>), GitmdfsError> {
    let mut idx = 0;
    // skip blank lines before the title
    while idx < lines.len() && lines[idx].trim().is_empty() {
        idx += 1;
    }

    let mut title = String::new();
    if idx < lines.len() {
        let line = lines[idx];
        if let Some(rest) = line.strip_prefix("# ") {
            title = rest.trim().to_string();
            idx += 1;
        } else if line.starts_with('#') {
            // A heading is present but not at the expected depth (e.g. `## `).
            return Err(GitmdfsError::decode_error(
                "title heading not at expected depth",
            ));
        }
    }

    let mut body = String::new();
    let mut comments = Vec::new();

    while idx < lines.len() && lines[idx].trim().is_empty() {
        idx += 1;
    }

    if idx < lines.len() && lines[idx].trim_end() == "## Body" {
        idx += 1;
        let start = idx;
        while idx < lines.len() && lines[idx].trim_end() != "## Comments" {
            idx += 1;
        }
        body = lines[start..idx].join("\n");
        body = body.trim_start_matches('\n').to_string();
        if !body.is_empty() || start < idx {
            // keep as-is; empty body stays empty
        }
    }

    if idx < lines.len() && lines[idx].trim_end() == "## Comments" {
        idx += 1;
        comments = parse_comments(&lines[idx..])?;
    }

    Ok((title, body, comments))
}

fn parse_comments(lines: &[&str]) -> Result<Vec<ParsedComment>, GitmdfsError> {
    let mut comments = Vec::new();
    let mut idx = 0;

    while idx < lines.len() {
        while idx < lines.len() && lines[idx].trim().is_empty() {
            idx += 1;
        }
        if idx >= lines.len() {
            break;
        }
        let header_line = lines[idx];
        let Some(rest) = header_line.strip_prefix("### ") else {
            idx += 1;
            continue;
        };
        let (created_at, author) = rest
            .split_once(" - ")
            .map(|(a, b)| (a.trim().to_string(), b.trim().to_string()))
            .unwrap_or((rest.trim().to_string(), String::new()));
        idx += 1;

        let mut id = 0i64;
        let mut is_new = true;
        if idx < lines.len() {
            if let Some(marker) = lines[idx].trim().strip_prefix("<!-- comment_id:") {
                let marker = marker.trim_end_matches("-->").trim();
                if marker != "new" {
                    if let Ok(parsed) = marker.parse::<i64>() {
                        id = parsed;
                        is_new = false;
                    }
                }
                idx += 1;
            }
        }

        while idx < lines.len() && lines[idx].trim().is_empty() {
            idx += 1;
        }

        let body_start = idx;
        while idx < lines.len() && !lines[idx].starts_with("### ") {
            idx += 1;
        }
        let body = lines[body_start..idx].join("\n");
        let body = body.trim_end_matches('\n').to_string();

        comments.push(ParsedComment {
            id,
            is_new,
            author,
            created_at,
            body,
        });
    }

    Ok(comments)
}

/// Report which of `{title, body}` changed, trailing newlines ignored.
pub fn diff(cached: &Issue, parsed: &ParsedIssue) -> Changes {
    Changes {
        title_changed: cached.title != parsed.title,
        body_changed: trim_trailing_newlines(&cached.body) != trim_trailing_newlines(&parsed.body),
    }
}

/// Classify each parsed comment against the cached set.
pub fn diff_comments(
    cached: &[Comment],
    parsed: &[ParsedComment],
) -> (Vec<NewComment>, Vec<EditedComment>) {
    let mut new_comments = Vec::new();
    let mut edited = Vec::new();

    for p in parsed {
        if (p.is_new || p.id == 0) && !p.body.trim().is_empty() {
            new_comments.push(NewComment { body: p.body.clone() });
            continue;
        }
        if let Some(cached_comment) = cached.iter().find(|c| c.id == p.id) {
            if trim_trailing_newlines(&cached_comment.body) != trim_trailing_newlines(&p.body) {
                edited.push(EditedComment {
                    id: p.id,
                    body: p.body.clone(),
                });
            }
        }
        // ids with no matching cached row are ignored, per spec.
    }

    (new_comments, edited)
}

/// Render a title the way `Create`'s de-sanitized `<title>[new].md` name
/// implies: same casing as the user typed into the filename, spaces
/// restored from `-`.
pub fn title_from_sanitized_name(stem: &str) -> String {
    stem.replace('-', " ")
}

/// Seed buffer for a brand-new issue file, per the adapter's `Create`
/// contract: a template header naming the repository, an empty body
/// section, and the de-sanitized title.
pub fn new_issue_template(repository: &str, title: &str) -> String {
    format!(
        "---\nid: 0\nrepo: {repository}\nurl: \nstate: {}\nlabels: []\nauthor: \ncreated_at: \nupdated_at: \netag: \ncomments: 0\n---\n\n# {title}\n\n## Body\n",
        IssueState::Open.as_str()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::IssueState;
    use chrono::Utc;

    fn sample_issue() -> Issue {
        Issue {
            repository: "owner/repo".to_string(),
            number: 1,
            title: "Test Issue".to_string(),
            body: "Original body content".to_string(),
            state: IssueState::Open,
            author: "testuser".to_string(),
            labels: vec!["bug".to_string()],
            created_at: Utc::now(),
            updated_at: Utc::now(),
            validator: "v1".to_string(),
            dirty: false,
            local_updated_at: Utc::now(),
        }
    }

    #[test]
    fn round_trips_title_and_body_with_no_comments() {
        let issue = sample_issue();
        let encoded = encode(&issue, &[]);
        assert!(encoded.contains("# Test Issue"));
        assert!(encoded.contains("Original body content"));

        let parsed = decode(&encoded).unwrap();
        assert_eq!(parsed.number, 1);
        assert_eq!(parsed.title, "Test Issue");
        assert_eq!(
            trim_trailing_newlines(&parsed.body),
            trim_trailing_newlines(&issue.body)
        );
        assert!(parsed.comments.is_empty());
    }

    #[test]
    fn accepts_windows_line_endings() {
        let issue = sample_issue();
        let encoded = encode(&issue, &[]).replace('\n', "\r\n");
        let parsed = decode(&encoded).unwrap();
        assert_eq!(parsed.title, "Test Issue");
    }

    #[test]
    fn missing_header_terminator_is_decode_error() {
        let broken = "---\nid: 1\nrepo: owner/repo\n\n# Test\n";
        assert!(decode(broken).is_err());
    }

    #[test]
    fn non_integer_id_is_decode_error() {
        let broken = "---\nid: not-a-number\nrepo: owner/repo\n---\n\n# Test\n";
        assert!(decode(broken).is_err());
    }

    #[test]
    fn missing_body_section_yields_empty_body() {
        let text = "---\nid: 1\nrepo: owner/repo\nstate: open\nlabels: []\n---\n\n# Test\n";
        let parsed = decode(text).unwrap();
        assert_eq!(parsed.body, "");
    }

    #[test]
    fn comment_without_marker_is_classified_new() {
        let text = "---\nid: 1\nrepo: owner/repo\n---\n\n# Test\n\n## Body\nbody\n\n## Comments\n### 2026-01-01T00:00:00Z - alice\n\nhello there\n";
        let parsed = decode(text).unwrap();
        assert_eq!(parsed.comments.len(), 1);
        assert!(parsed.comments[0].is_new);
        assert_eq!(parsed.comments[0].id, 0);
        assert_eq!(parsed.comments[0].body, "hello there");
    }

    #[test]
    fn comment_with_literal_new_marker_is_classified_new() {
        let text = "---\nid: 1\nrepo: owner/repo\n---\n\n# Test\n\n## Body\nbody\n\n## Comments\n### 2026-01-01T00:00:00Z - alice\n<!-- comment_id: new -->\n\nhello\n";
        let parsed = decode(text).unwrap();
        assert!(parsed.comments[0].is_new);
    }

    #[test]
    fn comment_with_numeric_marker_is_not_new() {
        let text = "---\nid: 1\nrepo: owner/repo\n---\n\n# Test\n\n## Body\nbody\n\n## Comments\n### 2026-01-01T00:00:00Z - alice\n<!-- comment_id: 42 -->\n\nhello\n";
        let parsed = decode(text).unwrap();
        assert!(!parsed.comments[0].is_new);
        assert_eq!(parsed.comments[0].id, 42);
    }

    #[test]
    fn diff_detects_body_change_ignoring_trailing_newlines() {
        let issue = sample_issue();
        let parsed = ParsedIssue {
            number: 1,
            repo: "owner/repo".to_string(),
            url: String::new(),
            state: "open".to_string(),
            labels: vec![],
            author: "testuser".to_string(),
            created_at: String::new(),
            updated_at: String::new(),
            validator: String::new(),
            title: "Test Issue".to_string(),
            body: "Original body content\n\n\n".to_string(),
            comments: vec![],
        };
        let changes = diff(&issue, &parsed);
        assert!(!changes.body_changed);
        assert!(!changes.title_changed);
    }
}
