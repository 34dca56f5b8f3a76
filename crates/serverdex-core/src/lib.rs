//! Core domain model and normalization helpers for serverdex.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

pub const CRATE_NAME: &str = "serverdex-core";

pub const SLUG_MAX_LEN: usize = 90;
pub const TAG_MAX_LEN: usize = 48;
pub const MAX_TAGS: usize = 12;
pub const NAME_MAX_LEN: usize = 120;
pub const DESCRIPTION_MAX_LEN: usize = 800;

/// Upstream registries the catalog ingests from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Registry,
    Github,
    Npm,
    Community,
}

impl Source {
    pub const ALL: [Source; 4] = [
        Source::Registry,
        Source::Github,
        Source::Npm,
        Source::Community,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Registry => "registry",
            Source::Github => "github",
            Source::Npm => "npm",
            Source::Community => "community",
        }
    }

    /// Tag added to every candidate so rows can be traced back to the
    /// upstream they were imported from.
    pub fn marker_tag(&self) -> &'static str {
        match self {
            Source::Registry => "mcp-registry",
            Source::Github => "github-sync",
            Source::Npm => "npm-sync",
            Source::Community => "community-sync",
        }
    }

    pub fn lock_scope(&self) -> String {
        format!("catalog:sync:{}", self.as_str())
    }

    pub fn parse(value: &str) -> Option<Source> {
        match value.trim().to_ascii_lowercase().as_str() {
            "registry" => Some(Source::Registry),
            "github" => Some(Source::Github),
            "npm" => Some(Source::Npm),
            "community" => Some(Source::Community),
            _ => None,
        }
    }
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who may rewrite a directory row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Ownership {
    /// Curated by hand; sync must never touch it.
    Manual,
    /// Created and maintained by the sync engine.
    Auto,
}

impl Ownership {
    pub fn as_str(&self) -> &'static str {
        match self {
            Ownership::Manual => "manual",
            Ownership::Auto => "auto",
        }
    }

    pub fn parse(value: &str) -> Option<Ownership> {
        match value {
            "manual" => Some(Ownership::Manual),
            "auto" => Some(Ownership::Auto),
            _ => None,
        }
    }
}

/// Two-phase retirement state for rows that vanished upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    Active,
    StaleCandidate,
    Rejected,
}

impl Lifecycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            Lifecycle::Active => "active",
            Lifecycle::StaleCandidate => "stale_candidate",
            Lifecycle::Rejected => "rejected",
        }
    }

    pub fn parse(value: &str) -> Option<Lifecycle> {
        match value {
            "active" => Some(Lifecycle::Active),
            "stale_candidate" => Some(Lifecycle::StaleCandidate),
            "rejected" => Some(Lifecycle::Rejected),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerStatus {
    Active,
    Pending,
    Rejected,
}

impl ServerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerStatus::Active => "active",
            ServerStatus::Pending => "pending",
            ServerStatus::Rejected => "rejected",
        }
    }

    pub fn parse(value: &str) -> Option<ServerStatus> {
        match value {
            "active" => Some(ServerStatus::Active),
            "pending" => Some(ServerStatus::Pending),
            "rejected" => Some(ServerStatus::Rejected),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    None,
    ApiKey,
    Oauth,
}

impl AuthType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthType::None => "none",
            AuthType::ApiKey => "api_key",
            AuthType::Oauth => "oauth",
        }
    }

    pub fn parse(value: &str) -> Option<AuthType> {
        match value {
            "none" => Some(AuthType::None),
            "api_key" => Some(AuthType::ApiKey),
            "oauth" => Some(AuthType::Oauth),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationLevel {
    Community,
    Verified,
    Official,
}

impl VerificationLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerificationLevel::Community => "community",
            VerificationLevel::Verified => "verified",
            VerificationLevel::Official => "official",
        }
    }

    pub fn parse(value: &str) -> Option<VerificationLevel> {
        match value {
            "community" => Some(VerificationLevel::Community),
            "verified" => Some(VerificationLevel::Verified),
            "official" => Some(VerificationLevel::Official),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Maintainer {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

/// Normalized, deduped listing ready for persistence. Created per run and
/// discarded after reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub slug: String,
    pub name: String,
    pub description: String,
    pub server_url: Option<String>,
    pub repo_url: Option<String>,
    pub category: String,
    pub auth_type: AuthType,
    pub tags: Vec<String>,
    pub maintainer: Maintainer,
    pub status: ServerStatus,
    pub verification_level: VerificationLevel,
}

impl Candidate {
    /// Text blob matched by moderation and quality rules.
    pub fn filter_blob(&self) -> String {
        format!(
            "{} {} {} {}",
            self.slug,
            self.name,
            self.description,
            self.repo_url.as_deref().unwrap_or_default()
        )
    }

    /// Stable digest of every sync-written field, used to skip rewrites of
    /// rows that did not change upstream.
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        for part in [
            self.slug.as_str(),
            self.name.as_str(),
            self.description.as_str(),
            self.server_url.as_deref().unwrap_or_default(),
            self.repo_url.as_deref().unwrap_or_default(),
            self.category.as_str(),
            self.auth_type.as_str(),
            self.maintainer.name.as_str(),
            self.status.as_str(),
            self.verification_level.as_str(),
        ] {
            hasher.update(part.as_bytes());
            hasher.update([0u8]);
        }
        for tag in &self.tags {
            hasher.update(tag.as_bytes());
            hasher.update([0u8]);
        }
        hex::encode(hasher.finalize())
    }
}

/// Canonical persisted directory row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerRecord {
    pub slug: String,
    pub name: String,
    pub description: String,
    pub server_url: Option<String>,
    pub repo_url: Option<String>,
    pub category: String,
    pub auth_type: AuthType,
    pub tags: Vec<String>,
    pub maintainer: Maintainer,
    pub status: ServerStatus,
    pub verification_level: VerificationLevel,
    pub ownership: Ownership,
    pub lifecycle: Lifecycle,
    pub content_hash: String,
}

impl ServerRecord {
    /// A freshly classified candidate always lands as an auto-owned,
    /// lifecycle-active row; reappearance therefore clears stale state.
    pub fn from_candidate(candidate: Candidate) -> Self {
        let content_hash = candidate.content_hash();
        Self {
            slug: candidate.slug,
            name: candidate.name,
            description: candidate.description,
            server_url: candidate.server_url,
            repo_url: candidate.repo_url,
            category: candidate.category,
            auth_type: candidate.auth_type,
            tags: candidate.tags,
            maintainer: candidate.maintainer,
            status: candidate.status,
            verification_level: candidate.verification_level,
            ownership: Ownership::Auto,
            lifecycle: Lifecycle::Active,
            content_hash,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncRunStatus {
    Running,
    Success,
    Partial,
    Error,
}

impl SyncRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncRunStatus::Running => "running",
            SyncRunStatus::Success => "success",
            SyncRunStatus::Partial => "partial",
            SyncRunStatus::Error => "error",
        }
    }
}

/// Persisted ledger row describing one sync run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRunRow {
    pub id: Uuid,
    pub trigger: String,
    pub status: String,
    pub source_scope: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub fetched: i64,
    pub upserted: i64,
    pub failed: i64,
    pub stale_marked: i64,
    pub duration_ms: Option<i64>,
    pub error_summary: Option<String>,
}

/// Persisted advisory lock row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncLockRow {
    pub lock_key: String,
    pub holder_id: Uuid,
    pub locked_until: DateTime<Utc>,
}

/// One sanitized failure entry attached to a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncFailure {
    pub source: String,
    pub entity_key: String,
    pub stage: String,
    pub reason: String,
}

pub fn normalize_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn fold_to_hyphens(value: &str, max_len: usize) -> String {
    let folded = value
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>();
    let mut out = folded
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    out.truncate(max_len);
    out.trim_matches('-').to_string()
}

/// Lowercased, hyphen-separated, length-capped slug. May be empty for
/// identifiers with no alphanumeric content; callers fall back to
/// [`fallback_slug`] in that case.
pub fn normalize_slug(value: &str) -> String {
    fold_to_hyphens(value, SLUG_MAX_LEN)
}

pub fn normalize_tag(value: &str) -> String {
    fold_to_hyphens(value, TAG_MAX_LEN)
}

/// Content-hash slug for identifiers that normalize to nothing.
pub fn fallback_slug(seed: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(seed.as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("registry-{}", &digest[..12])
}

/// Title-case a slug-like identifier: `filesystem-tools` -> `Filesystem Tools`.
pub fn humanize_identifier(value: &str) -> String {
    value
        .split(|c: char| c == '.' || c == '_' || c == '-' || c == '/' || c == ' ')
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn is_http_url(value: &str) -> bool {
    value.starts_with("http://") || value.starts_with("https://")
}

/// Trim, collapse whitespace, and keep only http(s) URLs.
pub fn http_url_or_none(value: Option<&str>) -> Option<String> {
    let candidate = normalize_whitespace(value.unwrap_or_default());
    if candidate.is_empty() || !is_http_url(&candidate) {
        return None;
    }
    Some(candidate)
}

pub fn truncate_chars(value: &str, max_chars: usize) -> String {
    value.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slug_folds_separators_and_caps_length() {
        assert_eq!(normalize_slug("io.acme/Weather API"), "io-acme-weather-api");
        assert_eq!(normalize_slug("---"), "");
        let long = "a".repeat(200);
        assert_eq!(normalize_slug(&long).len(), SLUG_MAX_LEN);
    }

    #[test]
    fn fallback_slug_is_deterministic_and_prefixed() {
        let a = fallback_slug("io.acme/weather");
        let b = fallback_slug("io.acme/weather");
        assert_eq!(a, b);
        assert!(a.starts_with("registry-"));
        assert_eq!(a.len(), "registry-".len() + 12);
    }

    #[test]
    fn humanize_splits_on_all_separator_kinds() {
        assert_eq!(humanize_identifier("weather_mcp-server"), "Weather Mcp Server");
        assert_eq!(humanize_identifier("io.acme/tools"), "Io Acme Tools");
    }

    #[test]
    fn http_url_filter_rejects_other_schemes() {
        assert_eq!(
            http_url_or_none(Some(" https://example.com/x ")),
            Some("https://example.com/x".to_string())
        );
        assert_eq!(http_url_or_none(Some("ftp://example.com")), None);
        assert_eq!(http_url_or_none(Some("")), None);
        assert_eq!(http_url_or_none(None), None);
    }

    #[test]
    fn content_hash_is_stable_and_field_sensitive() {
        let candidate = Candidate {
            slug: "acme-weather".into(),
            name: "Acme Weather".into(),
            description: "Weather lookups.".into(),
            server_url: None,
            repo_url: Some("https://github.com/acme/weather".into()),
            category: "Other Tools and Integrations".into(),
            auth_type: AuthType::None,
            tags: vec!["mcp-registry".into()],
            maintainer: Maintainer { name: "Acme".into(), email: None },
            status: ServerStatus::Active,
            verification_level: VerificationLevel::Community,
        };
        let mut changed = candidate.clone();
        changed.description = "Weather lookups v2.".into();
        assert_eq!(candidate.content_hash(), candidate.clone().content_hash());
        assert_ne!(candidate.content_hash(), changed.content_hash());
    }
}
