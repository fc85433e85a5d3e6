// ABOUTME: Classifies replay-tool failures as transient, fatal or unknown
// ABOUTME: Pure pattern matching over stderr text and the process termination status

use std::sync::LazyLock;

use regex::Regex;

use crate::error::ErrorClass;

const SIGABRT: i32 = 6;
const SIGKILL: i32 = 9;
const SIGTERM: i32 = 15;

/// Exit status the git tooling uses for "something is wrong with the repository".
const GIT_FATAL_EXIT: i32 = 128;

/// Batch-size suggestion attached to signal-killed runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchHint {
    /// Likely out of memory: fall back to single-revision windows.
    Minimal,
    /// Likely an internal assertion: use a small window.
    Small,
}

/// How a child process ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Termination {
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
}

impl Termination {
    pub fn exited(code: i32) -> Self {
        Self {
            exit_code: Some(code),
            signal: None,
        }
    }

    pub fn signalled(signal: i32) -> Self {
        Self {
            exit_code: None,
            signal: Some(signal),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub class: ErrorClass,
    pub reason: &'static str,
    /// True when a network-class pattern matched; such failures stay resumable.
    pub network: bool,
    pub batch_hint: Option<BatchHint>,
}

struct Pattern {
    reason: &'static str,
    regex: Regex,
    network: bool,
}

fn pattern(reason: &'static str, expr: &str, network: bool) -> Pattern {
    Pattern {
        reason,
        regex: Regex::new(expr).expect("valid classifier regex"),
        network,
    }
}

static FATAL_PATTERNS: LazyLock<Vec<Pattern>> = LazyLock::new(|| {
    vec![
        pattern("authorization failed", r"(?i)authori[sz]ation failed", false),
        pattern("authentication failed", r"(?i)authentication (failed|required)", false),
        pattern("forbidden", r"(?i)\b403\b|\bforbidden\b", false),
        pattern("unauthorized", r"(?i)\b401\b|\bunauthori[sz]ed\b", false),
        pattern("repository not found", r"(?i)repository not found|no repository found", false),
        pattern("not found", r"(?i)\b404\b|path not found", false),
        pattern("corrupted repository", r"(?i)malformed|corrupt", false),
        pattern("checksum mismatch", r"(?i)checksum mismatch", false),
    ]
});

static TRANSIENT_PATTERNS: LazyLock<Vec<Pattern>> = LazyLock::new(|| {
    vec![
        pattern("connection reset", r"(?i)connection (reset|closed|refused)", true),
        pattern(
            "name resolution failed",
            r"(?i)could not resolve host|name or service not known|temporary failure in name resolution|unable to resolve",
            true,
        ),
        pattern("bad gateway", r"(?i)\b502\b|bad gateway", true),
        pattern("service unavailable", r"(?i)\b503\b|service unavailable", true),
        pattern("gateway timeout", r"(?i)\b504\b|gateway time-?out", true),
        pattern("rate limited", r"(?i)\b429\b|too many requests", true),
        pattern("disk full", r"(?i)no space left on device|disk full|quota exceeded", false),
        pattern("timed out", r"(?i)timed out|timeout", true),
    ]
});

/// Classify a failed run. Fatal patterns win over transient ones when both match.
pub fn classify(stderr: &str, termination: Termination) -> Classification {
    let batch_hint = match termination.signal {
        Some(SIGKILL) => Some(BatchHint::Minimal),
        Some(SIGABRT) => Some(BatchHint::Small),
        _ => None,
    };

    if let Some(p) = FATAL_PATTERNS.iter().find(|p| p.regex.is_match(stderr)) {
        return Classification {
            class: ErrorClass::Fatal,
            reason: p.reason,
            network: false,
            batch_hint,
        };
    }

    if let Some(p) = TRANSIENT_PATTERNS.iter().find(|p| p.regex.is_match(stderr)) {
        return Classification {
            class: ErrorClass::Transient,
            reason: p.reason,
            network: p.network,
            batch_hint,
        };
    }

    match termination.signal {
        Some(SIGKILL) => {
            return Classification {
                class: ErrorClass::Transient,
                reason: "killed (likely out of memory)",
                network: false,
                batch_hint,
            }
        }
        Some(SIGABRT) => {
            return Classification {
                class: ErrorClass::Transient,
                reason: "aborted (internal assertion)",
                network: false,
                batch_hint,
            }
        }
        Some(SIGTERM) => {
            return Classification {
                class: ErrorClass::Transient,
                reason: "terminated",
                network: false,
                batch_hint,
            }
        }
        _ => {}
    }

    if termination.exit_code == Some(GIT_FATAL_EXIT) {
        return Classification {
            class: ErrorClass::Fatal,
            reason: "tool reported a fatal error",
            network: false,
            batch_hint,
        };
    }

    Classification {
        class: ErrorClass::Unknown,
        reason: "unrecognised failure",
        network: false,
        batch_hint,
    }
}

/// Classify an error message that did not come from a child process.
pub fn classify_message(message: &str) -> Classification {
    classify(message, Termination::default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forbidden_is_fatal() {
        let c = classify("svn: E170013: 403 Forbidden", Termination::exited(1));
        assert_eq!(c.class, ErrorClass::Fatal);
        assert_eq!(c.reason, "forbidden");
    }

    #[test]
    fn test_connection_reset_is_transient_network() {
        let c = classify(
            "svn: E000104: Error running context: Connection reset by peer",
            Termination::exited(1),
        );
        assert_eq!(c.class, ErrorClass::Transient);
        assert!(c.network);
    }

    #[test]
    fn test_fatal_wins_over_transient() {
        let c = classify(
            "Connection reset by peer\nAuthorization failed",
            Termination::exited(1),
        );
        assert_eq!(c.class, ErrorClass::Fatal);
    }

    #[test]
    fn test_disk_full_is_transient_but_not_network() {
        let c = classify("fatal: write error: No space left on device", Termination::exited(1));
        assert_eq!(c.class, ErrorClass::Transient);
        assert!(!c.network);
    }

    #[test]
    fn test_signals() {
        let killed = classify("", Termination::signalled(SIGKILL));
        assert_eq!(killed.class, ErrorClass::Transient);
        assert_eq!(killed.batch_hint, Some(BatchHint::Minimal));

        let aborted = classify("", Termination::signalled(SIGABRT));
        assert_eq!(aborted.class, ErrorClass::Transient);
        assert_eq!(aborted.batch_hint, Some(BatchHint::Small));

        let terminated = classify("", Termination::signalled(SIGTERM));
        assert_eq!(terminated.class, ErrorClass::Transient);
        assert_eq!(terminated.batch_hint, None);
    }

    #[test]
    fn test_sigkill_keeps_hint_when_text_matches() {
        let c = classify("Connection closed unexpectedly", Termination::signalled(SIGKILL));
        assert_eq!(c.class, ErrorClass::Transient);
        assert_eq!(c.batch_hint, Some(BatchHint::Minimal));
    }

    #[test]
    fn test_exit_128_defaults_to_fatal() {
        let c = classify("fatal: something odd", Termination::exited(128));
        assert_eq!(c.class, ErrorClass::Fatal);

        let c = classify("fatal: unable to access: Could not resolve host: svn.example.com", Termination::exited(128));
        assert_eq!(c.class, ErrorClass::Transient);
    }

    #[test]
    fn test_empty_stderr_is_unknown() {
        let c = classify("", Termination::exited(1));
        assert_eq!(c.class, ErrorClass::Unknown);
    }

    #[test]
    fn test_rate_limit_and_gateway_codes() {
        for text in ["HTTP 429 Too Many Requests", "502 Bad Gateway", "503 Service Unavailable", "504 Gateway Timeout"] {
            assert_eq!(classify_message(text).class, ErrorClass::Transient, "{text}");
        }
    }
}
