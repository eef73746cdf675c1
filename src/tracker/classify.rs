//! Category and severity inference
//!
//! Categories are decided by an ordered rule table; the first rule that
//! matches wins. The order is policy: `"database connection timeout"` is a
//! database error because the database rule is consulted before the timeout
//! rule, and `"invalid token"` is an authentication error because
//! authentication precedes validation.
//!
//! | # | category       |
//! |---|----------------|
//! | 1 | authentication |
//! | 2 | authorization  |
//! | 3 | validation     |
//! | 4 | database       |
//! | 5 | timeout        |
//! | 6 | network        |
//! | 7 | external_api   |
//! | 8 | file_system    |
//! | 9 | rate_limit     |
//! | - | unknown        |

use std::fmt;

use serde::{Deserialize, Serialize};

use super::context::{ErrorContext, ErrorReport};

/// Error category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Identity could not be established
    Authentication,
    /// Identity established, access refused
    Authorization,
    /// Bad input
    Validation,
    /// Database failure
    Database,
    /// Remote API failure
    ExternalApi,
    /// Transport failure
    Network,
    /// Local filesystem failure
    FileSystem,
    /// Deadline exceeded
    Timeout,
    /// Throttled
    RateLimit,
    /// Domain rule violated (never inferred)
    BusinessLogic,
    /// Process / host failure (never inferred)
    System,
    /// Nothing matched
    Unknown,
}

impl ErrorCategory {
    /// Snake-case name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Authentication => "authentication",
            Self::Authorization => "authorization",
            Self::Validation => "validation",
            Self::Database => "database",
            Self::ExternalApi => "external_api",
            Self::Network => "network",
            Self::FileSystem => "file_system",
            Self::Timeout => "timeout",
            Self::RateLimit => "rate_limit",
            Self::BusinessLogic => "business_logic",
            Self::System => "system",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error severity; ordered from least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Expected noise
    Low,
    /// Worth a look
    Medium,
    /// Needs attention
    High,
    /// Page someone
    Critical,
}

impl Severity {
    /// Lowercase name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Dependency name that matches any dependency
const ANY_DEPENDENCY: &str = "*";

struct CategoryRule {
    category: ErrorCategory,
    /// Lowercase message substrings
    keywords: &'static [&'static str],
    statuses: &'static [u16],
    /// Lowercase kinds
    kinds: &'static [&'static str],
    codes: &'static [&'static str],
    /// Exact dependency names, or `*`
    dependencies: &'static [&'static str],
}

const RULES: &[CategoryRule] = &[
    CategoryRule {
        category: ErrorCategory::Authentication,
        keywords: &[
            "unauthorized",
            "unauthenticated",
            "not authenticated",
            "authentication",
            "invalid token",
            "token expired",
            "jwt",
            "invalid credentials",
            "session expired",
        ],
        statuses: &[401],
        kinds: &["authenticationerror", "autherror"],
        codes: &[],
        dependencies: &[],
    },
    CategoryRule {
        category: ErrorCategory::Authorization,
        keywords: &[
            "forbidden",
            "permission denied",
            "access denied",
            "not authorized",
            "insufficient permission",
        ],
        statuses: &[403],
        kinds: &["authorizationerror", "forbiddenerror"],
        codes: &[],
        dependencies: &[],
    },
    CategoryRule {
        category: ErrorCategory::Validation,
        keywords: &["validation", "invalid", "is required", "must be", "malformed", "bad request"],
        statuses: &[400, 422],
        kinds: &["validationerror"],
        codes: &[],
        dependencies: &[],
    },
    CategoryRule {
        category: ErrorCategory::Database,
        keywords: &[
            "database",
            "sql",
            "query failed",
            "connection pool",
            "deadlock",
            "postgres",
            "constraint",
        ],
        statuses: &[],
        kinds: &["databaseerror", "queryerror"],
        codes: &[],
        dependencies: &["database", "db", "postgres", "postgresql", "mysql", "redis"],
    },
    CategoryRule {
        category: ErrorCategory::Timeout,
        keywords: &["timeout", "timed out"],
        statuses: &[408, 504],
        kinds: &["timeouterror"],
        codes: &["ETIMEDOUT"],
        dependencies: &[],
    },
    CategoryRule {
        category: ErrorCategory::Network,
        keywords: &[
            "network",
            "econnrefused",
            "econnreset",
            "enotfound",
            "socket hang up",
            "fetch failed",
            "dns",
        ],
        statuses: &[],
        kinds: &["networkerror"],
        codes: &["ECONNREFUSED", "ECONNRESET", "ENOTFOUND", "EAI_AGAIN", "EPIPE", "ECONNABORTED"],
        dependencies: &[],
    },
    CategoryRule {
        category: ErrorCategory::ExternalApi,
        keywords: &["api error", "upstream", "bad gateway", "service unavailable"],
        statuses: &[500, 502, 503],
        kinds: &["apierror"],
        codes: &[],
        dependencies: &[ANY_DEPENDENCY],
    },
    CategoryRule {
        category: ErrorCategory::FileSystem,
        keywords: &[
            "enoent",
            "no such file",
            "eacces",
            "file not found",
            "file system",
            "filesystem",
            "directory",
            "disk",
        ],
        statuses: &[],
        kinds: &["ioerror"],
        codes: &["ENOENT", "EACCES"],
        dependencies: &[],
    },
    CategoryRule {
        category: ErrorCategory::RateLimit,
        keywords: &["rate limit", "too many requests", "quota"],
        statuses: &[429],
        kinds: &["ratelimiterror"],
        codes: &[],
        dependencies: &[],
    },
];

impl CategoryRule {
    fn matches(&self, message: &str, kind: &str, report: &ErrorReport, context: &ErrorContext) -> bool {
        self.keywords.iter().any(|k| message.contains(k))
            || self.kinds.contains(&kind)
            || report.status.is_some_and(|s| self.statuses.contains(&s))
            || report
                .code
                .as_deref()
                .is_some_and(|c| self.codes.iter().any(|k| k.eq_ignore_ascii_case(c)))
            || context.dependency.as_deref().is_some_and(|dep| {
                let dep = dep.to_ascii_lowercase();
                self.dependencies
                    .iter()
                    .any(|d| *d == ANY_DEPENDENCY || *d == dep)
            })
    }
}

/// Infer the category; first matching rule wins
#[must_use]
pub fn categorize(report: &ErrorReport, context: &ErrorContext) -> ErrorCategory {
    let message = report.message.to_lowercase();
    let kind = report.kind.to_lowercase();
    RULES
        .iter()
        .find(|rule| rule.matches(&message, &kind, report, context))
        .map_or(ErrorCategory::Unknown, |rule| rule.category)
}

/// Infer severity from the category plus what we know about the request
#[must_use]
pub fn infer_severity(
    category: ErrorCategory,
    report: &ErrorReport,
    context: &ErrorContext,
) -> Severity {
    if context.is_health_endpoint() {
        return Severity::Critical;
    }
    if category == ErrorCategory::Database && is_connection_failure(report) {
        return Severity::Critical;
    }

    match category {
        ErrorCategory::Authentication if context.user_id.is_some() => Severity::High,
        ErrorCategory::Database => Severity::High,
        ErrorCategory::Authorization | ErrorCategory::ExternalApi => Severity::Medium,
        _ => Severity::Low,
    }
}

fn is_connection_failure(report: &ErrorReport) -> bool {
    let message = report.message.to_lowercase();
    message.contains("connection")
        || message.contains("connect ")
        || report
            .code
            .as_deref()
            .is_some_and(|c| matches!(c, "ECONNREFUSED" | "ECONNRESET" | "ENOTFOUND"))
}
