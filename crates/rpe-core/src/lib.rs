//! Core domain model for RPE.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "rpe-core";

/// One row of the member roster export. Identity is row position; the only
/// field gate is a non-empty fullname (rows without one are skipped, not
/// retried).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberRecord {
    pub fullname: String,
    pub email: String,
    #[serde(default)]
    pub username: Option<String>,
}

impl MemberRecord {
    pub fn has_fullname(&self) -> bool {
        !self.fullname.trim().is_empty()
    }

    pub fn fullname_trimmed(&self) -> &str {
        self.fullname.trim()
    }

    pub fn email_trimmed(&self) -> &str {
        self.email.trim()
    }

    pub fn username_trimmed(&self) -> &str {
        self.username.as_deref().unwrap_or("").trim()
    }
}

/// Attributes extracted from a LinkedIn profile page. All fields default to
/// empty strings; absence of a fact is not an error.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileFacts {
    pub title: String,
    pub company: String,
    pub headline: String,
    pub location: String,
    pub education: String,
    pub org_role_years: String,
}

/// Output row appended for each successful enrichment. Append-only; never
/// updated or deduplicated across runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichedRecord {
    pub fullname: String,
    pub email: String,
    pub linkedin_url: String,
    pub title: String,
    pub company: String,
    pub headline: String,
    pub location: String,
    pub education: String,
    pub org_role_years: String,
}

impl EnrichedRecord {
    pub fn from_facts(
        member: &MemberRecord,
        linkedin_url: impl Into<String>,
        facts: ProfileFacts,
    ) -> Self {
        Self {
            fullname: member.fullname_trimmed().to_string(),
            email: member.email_trimmed().to_string(),
            linkedin_url: linkedin_url.into(),
            title: facts.title,
            company: facts.company,
            headline: facts.headline,
            location: facts.location,
            education: facts.education,
            org_role_years: facts.org_role_years,
        }
    }
}

/// Per-record failure destined for the append-only error log. Never read
/// back by the program.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEntry {
    pub fullname: String,
    pub email: String,
    pub reason: String,
    pub at: DateTime<Utc>,
}

impl ErrorEntry {
    pub fn new(member: &MemberRecord, reason: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            fullname: member.fullname_trimmed().to_string(),
            email: member.email_trimmed().to_string(),
            reason: reason.into(),
            at,
        }
    }

    pub fn log_line(&self) -> String {
        format!(
            "[{}] {} ({}): {}",
            self.at.to_rfc3339(),
            self.fullname,
            self.email,
            self.reason
        )
    }
}
