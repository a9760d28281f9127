//! Retry and merge decisions
//!
//! Pure functions over finished attempts; nothing here talks to the gateway.

use std::time::Duration;

use crate::target::SecurityIssue;

/// Per-target outcome the orchestrator can judge and merge
pub trait TargetResult: Send + 'static {
    /// Number of substantive extracted entries (URLs, events, ...)
    fn entry_count(&self) -> usize;

    fn security_issues(&self) -> &[SecurityIssue];

    fn set_security_issues(&mut self, issues: Vec<SecurityIssue>);

    fn error_message(&self) -> Option<&str>;

    fn set_error_message(&mut self, message: Option<String>);

    fn set_elapsed(&mut self, elapsed: Duration);

    /// Has any extracted entries
    fn is_valid(&self) -> bool {
        self.entry_count() > 0
    }
}

/// A result is weak when it extracted nothing and either hit an obstacle or
/// reported an error. Weak results get exactly one retry.
pub fn is_weak<R: TargetResult>(result: &R) -> bool {
    !result.is_valid() && (!result.security_issues().is_empty() || result.error_message().is_some())
}

/// Combine a first attempt with its retry.
///
/// Keeps whichever attempt extracted more entries (the first on a tie),
/// unions the obstacles seen by both, and clears the error if the kept
/// attempt produced entries.
pub fn merge<R: TargetResult>(first: R, retry: R) -> R {
    let mut issues: Vec<SecurityIssue> = first.security_issues().to_vec();
    for issue in retry.security_issues() {
        if !issues.contains(issue) {
            issues.push(*issue);
        }
    }

    let mut kept = if retry.entry_count() > first.entry_count() {
        retry
    } else {
        first
    };
    kept.set_security_issues(issues);
    if kept.is_valid() {
        kept.set_error_message(None);
    }
    kept
}

/// Text describing why the first attempt was weak, for the retry prompt
pub fn describe_failure<R: TargetResult>(result: &R) -> String {
    let mut described = if result.security_issues().is_empty() {
        "unknown blocking".to_owned()
    } else {
        result
            .security_issues()
            .iter()
            .map(SecurityIssue::as_str)
            .collect::<Vec<_>>()
            .join(", ")
    };
    if let Some(error) = result.error_message() {
        let clipped: String = error.chars().take(100).collect();
        described.push_str("; ");
        described.push_str(&clipped);
    }
    described
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Default, PartialEq)]
    struct Attempt {
        entries: usize,
        issues: Vec<SecurityIssue>,
        error: Option<String>,
    }

    impl TargetResult for Attempt {
        fn entry_count(&self) -> usize {
            self.entries
        }
        fn security_issues(&self) -> &[SecurityIssue] {
            &self.issues
        }
        fn set_security_issues(&mut self, issues: Vec<SecurityIssue>) {
            self.issues = issues;
        }
        fn error_message(&self) -> Option<&str> {
            self.error.as_deref()
        }
        fn set_error_message(&mut self, message: Option<String>) {
            self.error = message;
        }
        fn set_elapsed(&mut self, _elapsed: Duration) {}
    }

    fn attempt(entries: usize, issues: &[SecurityIssue], error: Option<&str>) -> Attempt {
        Attempt {
            entries,
            issues: issues.to_vec(),
            error: error.map(str::to_owned),
        }
    }

    // === Weakness Tests ===

    #[test]
    fn test_empty_and_blocked_is_weak() {
        assert!(is_weak(&attempt(0, &[SecurityIssue::Cloudflare], None)));
        assert!(is_weak(&attempt(0, &[], Some("agent timed out"))));
    }

    #[test]
    fn test_empty_without_obstacle_is_not_weak() {
        assert!(!is_weak(&attempt(0, &[], None)));
    }

    #[test]
    fn test_entries_are_never_weak() {
        assert!(!is_weak(&attempt(3, &[SecurityIssue::Captcha], Some("partial"))));
    }

    // === Merge Tests ===

    #[test]
    fn test_better_retry_wins_and_clears_error() {
        let first = attempt(0, &[SecurityIssue::Cloudflare], Some("blocked"));
        let retry = attempt(4, &[], None);
        let merged = merge(first, retry);
        assert_eq!(merged.entries, 4);
        assert_eq!(merged.error, None);
        assert_eq!(merged.issues, vec![SecurityIssue::Cloudflare]);
    }

    #[test]
    fn test_weaker_retry_keeps_first_and_unions_issues() {
        let first = attempt(2, &[SecurityIssue::Captcha], None);
        let retry = attempt(1, &[SecurityIssue::Blocked, SecurityIssue::Captcha], Some("retry failed"));
        let merged = merge(first, retry);
        assert_eq!(merged.entries, 2);
        assert_eq!(merged.error, None);
        assert_eq!(merged.issues, vec![SecurityIssue::Captcha, SecurityIssue::Blocked]);
    }

    #[test]
    fn test_tie_keeps_first_error_when_nothing_extracted() {
        let first = attempt(0, &[SecurityIssue::Timeout], Some("agent timed out"));
        let retry = attempt(0, &[SecurityIssue::Blocked], Some("retry failed"));
        let merged = merge(first, retry);
        assert_eq!(merged.error.as_deref(), Some("agent timed out"));
        assert_eq!(merged.issues, vec![SecurityIssue::Timeout, SecurityIssue::Blocked]);
    }

    #[test]
    fn test_describe_failure() {
        let long = "x".repeat(300);
        let described = describe_failure(&attempt(0, &[SecurityIssue::Cloudflare, SecurityIssue::Captcha], Some(&long)));
        assert!(described.starts_with("cloudflare, captcha; "));
        assert_eq!(described.len(), "cloudflare, captcha; ".len() + 100);

        assert_eq!(describe_failure(&attempt(0, &[], None)), "unknown blocking");
    }
}
