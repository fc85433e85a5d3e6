// ABOUTME: Turns replay-tool output lines into structured events
// ABOUTME: Kept apart from the fetch loop so a change in the tool's output format stays local

use std::sync::LazyLock;

use regex::Regex;

/// `r1234 = 0123abcd... (refs/remotes/origin/trunk)`
static REVISION_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*r(\d+)\s*=\s*([0-9a-f]{7,64})(?:\s+\(([^)]+)\))?\s*$")
        .expect("valid revision marker regex")
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevisionMarker {
    pub revision: u64,
    pub hash: String,
    pub reference: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputEvent {
    Revision(RevisionMarker),
    /// The tool finished checking out the fetched history.
    Completed,
    Warning(String),
    Other,
}

pub fn parse_line(line: &str) -> OutputEvent {
    if let Some(caps) = REVISION_MARKER.captures(line) {
        if let Ok(revision) = caps[1].parse() {
            return OutputEvent::Revision(RevisionMarker {
                revision,
                hash: caps[2].to_string(),
                reference: caps.get(3).map(|m| m.as_str().to_string()),
            });
        }
    }
    let trimmed = line.trim_start();
    if trimmed.starts_with("Checked out HEAD") {
        return OutputEvent::Completed;
    }
    if let Some(rest) = trimmed.strip_prefix("W:") {
        return OutputEvent::Warning(rest.trim().to_string());
    }
    OutputEvent::Other
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_revision_marker_with_ref() {
        let event = parse_line("r140 = 3f786850e387550fdab836ed7e6dc881de23001b (refs/remotes/origin/trunk)");
        assert_eq!(
            event,
            OutputEvent::Revision(RevisionMarker {
                revision: 140,
                hash: "3f786850e387550fdab836ed7e6dc881de23001b".to_string(),
                reference: Some("refs/remotes/origin/trunk".to_string()),
            })
        );
    }

    #[test]
    fn test_revision_marker_without_ref() {
        match parse_line("r7 = abcdef1") {
            OutputEvent::Revision(marker) => {
                assert_eq!(marker.revision, 7);
                assert!(marker.reference.is_none());
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_file_lines_are_not_markers() {
        assert_eq!(parse_line("\tA\tsrc/r1 = x.c"), OutputEvent::Other);
        assert_eq!(parse_line("\tM\ttrunk/README"), OutputEvent::Other);
        assert_eq!(parse_line("r12 = not-a-hash"), OutputEvent::Other);
    }

    #[test]
    fn test_completion_and_warning() {
        assert_eq!(parse_line("Checked out HEAD:"), OutputEvent::Completed);
        assert_eq!(
            parse_line("W: +empty_dir: trunk/docs"),
            OutputEvent::Warning("+empty_dir: trunk/docs".to_string())
        );
    }
}
