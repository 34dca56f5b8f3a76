//! Source adapter contracts + one adapter per upstream registry.
//!
//! Every upstream speaks JSON over HTTP. Adapters fetch one page at a time
//! and hand back source-native records; classification into candidates
//! happens downstream. Pagination is driven by the caller through
//! [`fetch_all`], which is strictly sequential because each page depends on
//! the cursor or index from the previous response.

use std::collections::HashSet;

use async_trait::async_trait;
use serde::Deserialize;
use serverdex_core::{normalize_whitespace, Source};
use serverdex_store::{FetchError, HttpFetcher};
use thiserror::Error;
use tracing::warn;

pub const CRATE_NAME: &str = "serverdex-adapters";

pub const DEFAULT_REGISTRY_URL: &str = "https://registry.modelcontextprotocol.io/v0.1/servers";
pub const DEFAULT_GITHUB_SEARCH_URL: &str = "https://api.github.com/search/repositories";
pub const DEFAULT_NPM_SEARCH_URL: &str = "https://registry.npmjs.org/-/v1/search";
pub const DEFAULT_COMMUNITY_URL: &str = "https://api.smithery.ai/servers";

pub const REGISTRY_PAGE_LIMIT: u32 = 100;
pub const GITHUB_PER_PAGE: u32 = 100;
pub const NPM_SEARCH_SIZE: u32 = 250;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("missing credentials for {src} source: set {env_var}")]
    MissingCredentials {
        src: Source,
        env_var: &'static str,
    },
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("decoding {src} response: {message}")]
    Decode { src: Source, message: String },
}

/// Position inside an upstream listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageCursor {
    Start,
    Cursor(String),
    Index(u32),
}

/// One page of source-native records plus where to go next. `next: None`
/// means the upstream end was reached.
#[derive(Debug, Clone)]
pub struct SourcePage {
    pub records: Vec<RawListing>,
    pub next: Option<PageCursor>,
}

/// Source-native record, one variant per upstream.
#[derive(Debug, Clone, PartialEq)]
pub enum RawListing {
    Registry(RegistryRecord),
    Github(GithubRepo),
    Npm(NpmObject),
    Community(CommunityServer),
}

impl RawListing {
    /// Natural key used to collapse cross-page duplicates within a single
    /// source, where the upstream exposes one.
    pub fn natural_key(&self) -> Option<String> {
        match self {
            RawListing::Github(repo) => {
                let full_name = normalize_whitespace(repo.full_name.as_deref().unwrap_or_default());
                if full_name.is_empty() {
                    None
                } else {
                    Some(full_name.to_lowercase())
                }
            }
            RawListing::Npm(object) => Some(object.package.name.to_lowercase()),
            RawListing::Registry(_) | RawListing::Community(_) => None,
        }
    }
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source(&self) -> Source;

    /// Records requested per page, echoed into the run summary.
    fn page_limit(&self) -> u32;

    async fn fetch_page(
        &self,
        http: &HttpFetcher,
        cursor: &PageCursor,
    ) -> Result<SourcePage, AdapterError>;
}

/// A page fetch that failed after retries. Pagination for the run stops
/// here; records from earlier pages are preserved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageFailure {
    pub page_index: u32,
    pub reason: String,
}

#[derive(Debug)]
pub struct FetchOutcome {
    pub records: Vec<RawListing>,
    pub fetched_pages: u32,
    pub reached_end: bool,
    pub page_failure: Option<PageFailure>,
}

/// Drive an adapter to the end of its pagination or to `max_pages`,
/// whichever comes first.
pub async fn fetch_all(
    adapter: &dyn SourceAdapter,
    http: &HttpFetcher,
    max_pages: u32,
) -> FetchOutcome {
    let mut records = Vec::new();
    let mut seen_keys: HashSet<String> = HashSet::new();
    let mut cursor = PageCursor::Start;
    let mut fetched_pages = 0u32;
    let mut reached_end = false;
    let mut page_failure = None;

    for page_index in 0..max_pages {
        let page = match adapter.fetch_page(http, &cursor).await {
            Ok(page) => page,
            Err(err) => {
                warn!(
                    source = %adapter.source(),
                    page_index,
                    error = %err,
                    "page fetch failed; aborting pagination for this run"
                );
                page_failure = Some(PageFailure {
                    page_index,
                    reason: err.to_string(),
                });
                break;
            }
        };

        fetched_pages += 1;
        for record in page.records {
            match record.natural_key() {
                Some(key) => {
                    if seen_keys.insert(key) {
                        records.push(record);
                    }
                }
                None => records.push(record),
            }
        }

        match page.next {
            Some(next) => cursor = next,
            None => {
                reached_end = true;
                break;
            }
        }
    }

    FetchOutcome {
        records,
        fetched_pages,
        reached_end,
        page_failure,
    }
}

fn decode<T: for<'de> Deserialize<'de>>(source: Source, body: &[u8]) -> Result<T, AdapterError> {
    serde_json::from_slice(body).map_err(|err| AdapterError::Decode {
        src: source,
        message: err.to_string(),
    })
}

// --- official protocol registry (cursor-paginated) ---

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RegistryTransport {
    #[serde(default, rename = "type")]
    pub transport_type: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryEnvironmentVariable {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub is_secret: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryPackage {
    #[serde(default)]
    pub registry_type: Option<String>,
    #[serde(default)]
    pub transport: Option<RegistryTransport>,
    #[serde(default)]
    pub environment_variables: Vec<RegistryEnvironmentVariable>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RegistryRepository {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RegistryServer {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub repository: Option<RegistryRepository>,
    #[serde(default)]
    pub remotes: Vec<RegistryTransport>,
    #[serde(default)]
    pub packages: Vec<RegistryPackage>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RegistryOfficialMeta {
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RegistryMeta {
    #[serde(default, rename = "io.modelcontextprotocol.registry/official")]
    pub official: Option<RegistryOfficialMeta>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RegistryRecord {
    #[serde(default)]
    pub server: Option<RegistryServer>,
    #[serde(default, rename = "_meta")]
    pub meta: Option<RegistryMeta>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegistryPageMeta {
    #[serde(default)]
    next_cursor: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct RegistryResponse {
    #[serde(default)]
    servers: Vec<RegistryRecord>,
    #[serde(default)]
    metadata: Option<RegistryPageMeta>,
}

#[derive(Debug, Clone)]
pub struct RegistryAdapter {
    base_url: String,
    page_limit: u32,
}

impl RegistryAdapter {
    pub fn new(base_url: impl Into<String>, page_limit: u32) -> Self {
        Self {
            base_url: base_url.into(),
            page_limit: page_limit.clamp(1, REGISTRY_PAGE_LIMIT),
        }
    }
}

impl Default for RegistryAdapter {
    fn default() -> Self {
        Self::new(DEFAULT_REGISTRY_URL, REGISTRY_PAGE_LIMIT)
    }
}

#[async_trait]
impl SourceAdapter for RegistryAdapter {
    fn source(&self) -> Source {
        Source::Registry
    }

    fn page_limit(&self) -> u32 {
        self.page_limit
    }

    async fn fetch_page(
        &self,
        http: &HttpFetcher,
        cursor: &PageCursor,
    ) -> Result<SourcePage, AdapterError> {
        let mut url = format!("{}?limit={}", self.base_url, self.page_limit);
        if let PageCursor::Cursor(cursor) = cursor {
            url.push_str(&format!("&cursor={cursor}"));
        }

        let response = http.fetch_bytes(self.source().as_str(), &url, None).await?;
        let payload: RegistryResponse = decode(self.source(), &response.body)?;

        let next = payload
            .metadata
            .and_then(|m| m.next_cursor)
            .filter(|c| !c.is_empty())
            .map(PageCursor::Cursor);

        Ok(SourcePage {
            records: payload
                .servers
                .into_iter()
                .map(RawListing::Registry)
                .collect(),
            next,
        })
    }
}

// --- code-hosting search (page-number paginated) ---

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GithubOwner {
    #[serde(default)]
    pub login: Option<String>,
    #[serde(default)]
    pub html_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GithubRepo {
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub html_url: Option<String>,
    #[serde(default)]
    pub homepage: Option<String>,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub archived: bool,
    #[serde(default)]
    pub owner: Option<GithubOwner>,
}

#[derive(Debug, Clone, Deserialize)]
struct GithubSearchResponse {
    #[serde(default)]
    items: Vec<GithubRepo>,
}

#[derive(Debug, Clone)]
pub struct GithubSearchAdapter {
    base_url: String,
    per_page: u32,
    token: Option<String>,
}

impl GithubSearchAdapter {
    pub fn new(base_url: impl Into<String>, per_page: u32, token: Option<String>) -> Self {
        Self {
            base_url: base_url.into(),
            per_page: per_page.clamp(1, GITHUB_PER_PAGE),
            token: token.filter(|t| !t.trim().is_empty()),
        }
    }

    pub fn from_token(token: Option<String>) -> Self {
        Self::new(DEFAULT_GITHUB_SEARCH_URL, GITHUB_PER_PAGE, token)
    }
}

#[async_trait]
impl SourceAdapter for GithubSearchAdapter {
    fn source(&self) -> Source {
        Source::Github
    }

    fn page_limit(&self) -> u32 {
        self.per_page
    }

    async fn fetch_page(
        &self,
        http: &HttpFetcher,
        cursor: &PageCursor,
    ) -> Result<SourcePage, AdapterError> {
        let page = match cursor {
            PageCursor::Index(page) => *page,
            _ => 1,
        };
        let url = format!(
            "{}?q=topic%3Amcp-server+archived%3Afalse&sort=updated&order=desc&per_page={}&page={}",
            self.base_url, self.per_page, page
        );

        let response = http
            .fetch_bytes(self.source().as_str(), &url, self.token.as_deref())
            .await?;
        let payload: GithubSearchResponse = decode(self.source(), &response.body)?;

        // The search API stops short pages at the end of the result set.
        let next = if (payload.items.len() as u32) < self.per_page {
            None
        } else {
            Some(PageCursor::Index(page + 1))
        };

        Ok(SourcePage {
            records: payload.items.into_iter().map(RawListing::Github).collect(),
            next,
        })
    }
}

// --- package registry search (single size-capped page) ---

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct NpmLinks {
    #[serde(default)]
    pub npm: Option<String>,
    #[serde(default)]
    pub repository: Option<String>,
    #[serde(default)]
    pub homepage: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct NpmPublisher {
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct NpmPackage {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub links: NpmLinks,
    #[serde(default)]
    pub publisher: Option<NpmPublisher>,
    #[serde(default)]
    pub maintainers: Vec<NpmPublisher>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct NpmObject {
    pub package: NpmPackage,
}

#[derive(Debug, Clone, Deserialize)]
struct NpmSearchResponse {
    #[serde(default)]
    objects: Vec<NpmObject>,
}

#[derive(Debug, Clone)]
pub struct NpmSearchAdapter {
    base_url: String,
    size: u32,
}

impl NpmSearchAdapter {
    pub fn new(base_url: impl Into<String>, size: u32) -> Self {
        Self {
            base_url: base_url.into(),
            size: size.clamp(1, NPM_SEARCH_SIZE),
        }
    }
}

impl Default for NpmSearchAdapter {
    fn default() -> Self {
        Self::new(DEFAULT_NPM_SEARCH_URL, NPM_SEARCH_SIZE)
    }
}

#[async_trait]
impl SourceAdapter for NpmSearchAdapter {
    fn source(&self) -> Source {
        Source::Npm
    }

    fn page_limit(&self) -> u32 {
        self.size
    }

    async fn fetch_page(
        &self,
        http: &HttpFetcher,
        _cursor: &PageCursor,
    ) -> Result<SourcePage, AdapterError> {
        let url = format!(
            "{}?text=keywords:mcp-server&size={}",
            self.base_url, self.size
        );
        let response = http.fetch_bytes(self.source().as_str(), &url, None).await?;
        let payload: NpmSearchResponse = decode(self.source(), &response.body)?;
        Ok(SourcePage {
            records: payload.objects.into_iter().map(RawListing::Npm).collect(),
            next: None,
        })
    }
}

// --- community registry (bearer-authenticated single page) ---

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommunityServer {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub repo_url: Option<String>,
    #[serde(default)]
    pub homepage: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct CommunityResponse {
    #[serde(default)]
    servers: Vec<CommunityServer>,
}

pub struct CommunityAdapter {
    base_url: String,
    token: String,
}

impl CommunityAdapter {
    /// Fails when no token is supplied; the community registry rejects
    /// anonymous requests, so this is a configuration error surfaced before
    /// any fetch begins.
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Result<Self, AdapterError> {
        let token = token
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .ok_or(AdapterError::MissingCredentials {
                src: Source::Community,
                env_var: "COMMUNITY_API_TOKEN",
            })?;
        Ok(Self {
            base_url: base_url.into(),
            token,
        })
    }

    pub fn from_token(token: Option<String>) -> Result<Self, AdapterError> {
        Self::new(DEFAULT_COMMUNITY_URL, token)
    }
}

// Hand-written so the bearer token can never leak through debug output.
impl std::fmt::Debug for CommunityAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommunityAdapter")
            .field("base_url", &self.base_url)
            .field("token", &"<redacted>")
            .finish()
    }
}

#[async_trait]
impl SourceAdapter for CommunityAdapter {
    fn source(&self) -> Source {
        Source::Community
    }

    fn page_limit(&self) -> u32 {
        0
    }

    async fn fetch_page(
        &self,
        http: &HttpFetcher,
        _cursor: &PageCursor,
    ) -> Result<SourcePage, AdapterError> {
        let response = http
            .fetch_bytes(self.source().as_str(), &self.base_url, Some(&self.token))
            .await?;
        let payload: CommunityResponse = decode(self.source(), &response.body)?;
        Ok(SourcePage {
            records: payload
                .servers
                .into_iter()
                .map(RawListing::Community)
                .collect(),
            next: None,
        })
    }
}
