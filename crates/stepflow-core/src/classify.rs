// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Pure regex-based classification of transport error text into a
//! recoverable category. Used by [`crate::executor::QueryExecutor`] to
//! decide whether to apply rate-limit backoff or surface a `QueryError`.

use once_cell::sync::Lazy;
use regex::Regex;

/// Broad category a transport error falls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Environment,
    Network,
    Api,
    Input,
    Internal,
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Environment => "environment",
            Self::Network => "network",
            Self::Api => "api",
            Self::Input => "input",
            Self::Internal => "internal",
            Self::Unknown => "unknown",
        }
    }
}

/// Classification result.
#[derive(Debug, Clone)]
pub struct Classification {
    pub category: ErrorCategory,
    pub recoverable: bool,
    pub guidance: String,
    pub matched_pattern: Option<&'static str>,
}

struct Rule {
    pattern: &'static str,
    category: ErrorCategory,
    recoverable: bool,
    guidance: &'static str,
}

/// Ordered list: first match wins.
static RULES: Lazy<Vec<(Rule, Regex)>> = Lazy::new(|| {
    let defs = [
        Rule {
            pattern: r"(?i)rate.?limit|too many requests|429",
            category: ErrorCategory::Api,
            recoverable: true,
            guidance: "Back off and retry; the upstream API is rate limiting requests.",
        },
        Rule {
            pattern: r"(?i)timed?.?out|deadline exceeded",
            category: ErrorCategory::Network,
            recoverable: true,
            guidance: "The request exceeded its deadline; retry with a longer timeout.",
        },
        Rule {
            pattern: r"(?i)connection (refused|reset)|dns|network unreachable|econnrefused",
            category: ErrorCategory::Network,
            recoverable: true,
            guidance: "Check network connectivity to the upstream transport.",
        },
        Rule {
            pattern: r"(?i)unauthorized|forbidden|invalid api key|authentication",
            category: ErrorCategory::Environment,
            recoverable: false,
            guidance: "Verify API credentials are present and valid.",
        },
        Rule {
            pattern: r"(?i)no such file|enoent|permission denied|eacces",
            category: ErrorCategory::Environment,
            recoverable: false,
            guidance: "Check the agent directory layout and file permissions.",
        },
        Rule {
            pattern: r"(?i)invalid request|validation failed|bad request|malformed",
            category: ErrorCategory::Input,
            recoverable: false,
            guidance: "The request payload was rejected; inspect the structured output or schema.",
        },
        Rule {
            pattern: r"(?i)internal server error|panic|unexpected (state|condition)|assertion failed",
            category: ErrorCategory::Internal,
            recoverable: false,
            guidance: "This looks like an orchestrator-internal bug; file a report with the logs.",
        },
        Rule {
            pattern: r"(?i)service unavailable|5\d\d|overloaded",
            category: ErrorCategory::Api,
            recoverable: true,
            guidance: "The upstream API is unavailable; retry after a short delay.",
        },
    ];

    defs.into_iter()
        .map(|rule| {
            let re = Regex::new(rule.pattern).expect("static error-classifier pattern is valid");
            (rule, re)
        })
        .collect()
});

/// Classifies an error message against the fixed pattern list.
pub fn classify(message: &str) -> Classification {
    for (rule, re) in RULES.iter() {
        if re.is_match(message) {
            return Classification {
                category: rule.category,
                recoverable: rule.recoverable,
                guidance: rule.guidance.to_string(),
                matched_pattern: Some(rule.pattern),
            };
        }
    }

    Classification {
        category: ErrorCategory::Unknown,
        recoverable: false,
        guidance: "No known pattern matched this error; treat as non-recoverable.".to_string(),
        matched_pattern: None,
    }
}

/// Dedicated rate-limit predicate used by the executor's backoff path.
pub fn is_rate_limit(message: &str) -> bool {
    static RATE_LIMIT: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"(?i)rate.?limit|too many requests|429").unwrap());
    RATE_LIMIT.is_match(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_rate_limit() {
        let c = classify("Error: 429 Too Many Requests");
        assert_eq!(c.category, ErrorCategory::Api);
        assert!(c.recoverable);
        assert!(is_rate_limit("Error: 429 Too Many Requests"));
    }

    #[test]
    fn classifies_auth_as_environment_and_nonrecoverable() {
        let c = classify("401 Unauthorized: invalid api key");
        assert_eq!(c.category, ErrorCategory::Environment);
        assert!(!c.recoverable);
    }

    #[test]
    fn classifies_timeout_as_network_recoverable() {
        let c = classify("request timed out after 30s");
        assert_eq!(c.category, ErrorCategory::Network);
        assert!(c.recoverable);
    }

    #[test]
    fn unknown_text_falls_back() {
        let c = classify("something entirely unexpected happened");
        assert_eq!(c.category, ErrorCategory::Unknown);
        assert!(!c.recoverable);
        assert!(c.matched_pattern.is_none());
    }

    #[test]
    fn not_rate_limit_for_unrelated_text() {
        assert!(!is_rate_limit("invalid request: missing field"));
    }
}
