use serde::{Deserialize, Serialize};

/// Domain context attached to a failure at the point it is raised.
/// Refines classification suggestions; never changes the taxonomy itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DomainContext {
    Search,
    Detail,
    Comment,
    Login,
    Unknown,
}

impl DomainContext {
    pub fn as_str(&self) -> &'static str {
        match self {
            DomainContext::Search => "search",
            DomainContext::Detail => "detail",
            DomainContext::Comment => "comment",
            DomainContext::Login => "login",
            DomainContext::Unknown => "unknown",
        }
    }
}

/// A detected condition that halts the crawl and requires a human.
/// Scan priority when several could match: RiskControl > LoginGuard > Offsite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HardStop {
    /// Human-verification / captcha page.
    RiskControl,
    /// Login wall container is present.
    LoginGuard,
    /// Current URL left the target domain.
    Offsite,
}

impl HardStop {
    pub fn as_str(&self) -> &'static str {
        match self {
            HardStop::RiskControl => "risk_control",
            HardStop::LoginGuard => "login_guard",
            HardStop::Offsite => "offsite",
        }
    }
}

/// A unit of work: one note (post) plus the container it was found in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteRef {
    pub note_id: String,
    #[serde(default)]
    pub container_id: Option<String>,
}
