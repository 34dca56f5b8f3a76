//! Candidate normalization and classification.
//!
//! Turns one source-native record into a canonical [`Candidate`], or `None`
//! for unusable records (missing name/URL, archived, non-active upstream
//! status). Classification is deterministic: the same raw record always
//! yields a byte-identical candidate.

use serverdex_adapters::{
    CommunityServer, GithubRepo, NpmObject, RawListing, RegistryRecord, RegistryServer,
};
use serverdex_core::{
    fallback_slug, http_url_or_none, humanize_identifier, normalize_slug, normalize_tag,
    normalize_whitespace, truncate_chars, AuthType, Candidate, Maintainer, ServerStatus, Source,
    VerificationLevel, DESCRIPTION_MAX_LEN, MAX_TAGS, NAME_MAX_LEN,
};

const AUTO_STATUS: ServerStatus = ServerStatus::Active;
const AUTO_VERIFICATION_LEVEL: VerificationLevel = VerificationLevel::Community;
pub const FALLBACK_CATEGORY: &str = "Other Tools and Integrations";

struct CategoryRule {
    category: &'static str,
    keywords: &'static [&'static str],
}

/// Ordered: first matching rule wins.
const CATEGORY_RULES: &[CategoryRule] = &[
    CategoryRule {
        category: "Developer Tools",
        keywords: &["developer", "code", "coding", "git", "github", "gitlab", "repo", "ci", "devops"],
    },
    CategoryRule {
        category: "Communication",
        keywords: &["chat", "message", "messaging", "slack", "discord", "teams", "email", "telegram"],
    },
    CategoryRule {
        category: "Search",
        keywords: &["search", "crawler", "crawl", "scrape", "scraper", "discovery", "index"],
    },
    CategoryRule {
        category: "Databases",
        keywords: &["database", "db", "sql", "postgres", "mysql", "redis", "mongodb"],
    },
    CategoryRule {
        category: "Cloud Platforms",
        keywords: &["cloud", "aws", "azure", "gcp", "kubernetes", "docker", "vercel"],
    },
    CategoryRule {
        category: "Monitoring",
        keywords: &["monitor", "monitoring", "observability", "trace", "metrics", "sentry", "logs"],
    },
    CategoryRule {
        category: "Finance & Fintech",
        keywords: &["finance", "fintech", "payment", "billing", "bank", "invoice", "stripe", "crypto"],
    },
    CategoryRule {
        category: "Calendar & Productivity",
        keywords: &["calendar", "task", "todo", "productivity", "notion", "asana", "trello", "jira"],
    },
    CategoryRule {
        category: "Knowledge & Memory",
        keywords: &["knowledge", "memory", "wiki", "docs", "documentation", "notebook"],
    },
    CategoryRule {
        category: "File Systems",
        keywords: &["storage", "files", "filesystem", "drive", "dropbox", "s3", "bucket"],
    },
    CategoryRule {
        category: "Social Media",
        keywords: &["twitter", "x.com", "linkedin", "facebook", "instagram", "youtube", "social"],
    },
    CategoryRule {
        category: "Security",
        keywords: &["security", "auth", "oauth", "token", "secret", "vault", "compliance"],
    },
];

pub fn infer_category(blob: &str) -> String {
    let normalized = blob.to_lowercase();
    for rule in CATEGORY_RULES {
        if rule.keywords.iter().any(|kw| normalized.contains(kw)) {
            return rule.category.to_string();
        }
    }
    FALLBACK_CATEGORY.to_string()
}

fn infer_auth_type(blob: &str, has_secret_env: bool) -> AuthType {
    let normalized = blob.to_lowercase();
    if normalized.contains("oauth") {
        return AuthType::Oauth;
    }
    if has_secret_env
        || normalized.contains("api key")
        || normalized.contains("apikey")
        || normalized.contains("token")
        || normalized.contains("secret")
        || normalized.contains("bearer")
    {
        return AuthType::ApiKey;
    }
    AuthType::None
}

/// Insertion-ordered tag set: source marker first, then topic tags, capped
/// at [`MAX_TAGS`].
struct TagSet {
    tags: Vec<String>,
}

impl TagSet {
    fn new(source: Source) -> Self {
        Self {
            tags: vec![source.marker_tag().to_string()],
        }
    }

    fn add(&mut self, raw: &str) {
        let tag = normalize_tag(raw);
        if !tag.is_empty() && !self.tags.contains(&tag) {
            self.tags.push(tag);
        }
    }

    fn finish(mut self) -> Vec<String> {
        self.tags.truncate(MAX_TAGS);
        self.tags
    }
}

fn slug_or_fallback(candidate_slug: String, seed: &str) -> String {
    if candidate_slug.is_empty() {
        fallback_slug(seed)
    } else {
        candidate_slug
    }
}

pub fn classify(raw: &RawListing) -> Option<Candidate> {
    match raw {
        RawListing::Registry(record) => classify_registry(record),
        RawListing::Github(repo) => classify_github(repo),
        RawListing::Npm(object) => classify_npm(object),
        RawListing::Community(server) => classify_community(server),
    }
}

fn registry_display_name(registry_name: &str, title: &str) -> String {
    if !title.is_empty() {
        return truncate_chars(title, NAME_MAX_LEN);
    }
    let last_segment = registry_name.rsplit('/').next().unwrap_or(registry_name);
    let humanized = humanize_identifier(last_segment);
    let name = if humanized.is_empty() {
        registry_name.to_string()
    } else {
        humanized
    };
    truncate_chars(&name, NAME_MAX_LEN)
}

fn registry_maintainer_name(registry_name: &str) -> String {
    let namespace = registry_name.split('/').next().unwrap_or_default();
    let humanized = humanize_identifier(namespace);
    let name = if humanized.is_empty() {
        "MCP Registry".to_string()
    } else {
        humanized
    };
    truncate_chars(&name, NAME_MAX_LEN)
}

fn pick_remote_url(server: &RegistryServer) -> Option<String> {
    for remote in &server.remotes {
        if let Some(url) = http_url_or_none(remote.url.as_deref()) {
            return Some(url);
        }
    }
    for package in &server.packages {
        if let Some(transport) = &package.transport {
            if let Some(url) = http_url_or_none(transport.url.as_deref()) {
                return Some(url);
            }
        }
    }
    None
}

fn classify_registry(record: &RegistryRecord) -> Option<Candidate> {
    let server = record.server.as_ref()?;
    let registry_name = normalize_whitespace(server.name.as_deref().unwrap_or_default());
    if registry_name.is_empty() {
        return None;
    }

    let official_status = record
        .meta
        .as_ref()
        .and_then(|m| m.official.as_ref())
        .and_then(|o| o.status.as_deref())
        .map(|s| normalize_whitespace(s).to_lowercase())
        .unwrap_or_default();
    if !official_status.is_empty() && official_status != "active" {
        return None;
    }

    let slug = slug_or_fallback(
        normalize_slug(&registry_name.replace('/', "-")),
        &registry_name,
    );
    let title = normalize_whitespace(server.title.as_deref().unwrap_or_default());
    let description = normalize_whitespace(server.description.as_deref().unwrap_or_default());
    let description = if description.is_empty() {
        format!("Automatically imported from MCP Registry entry: {registry_name}.")
    } else {
        description
    };

    let server_url = pick_remote_url(server);
    let repo_url = http_url_or_none(server.repository.as_ref().and_then(|r| r.url.as_deref()));

    let blob = format!(
        "{registry_name} {title} {description} {}",
        repo_url.as_deref().unwrap_or_default()
    );
    let has_secret_env = server.packages.iter().any(|p| {
        p.environment_variables
            .iter()
            .any(|v| v.is_secret.unwrap_or(false))
    });

    let mut tags = TagSet::new(Source::Registry);
    for remote in &server.remotes {
        if let Some(transport_type) = &remote.transport_type {
            tags.add(&format!("transport-{transport_type}"));
        }
    }
    for package in &server.packages {
        if let Some(registry_type) = &package.registry_type {
            tags.add(&format!("package-{registry_type}"));
        }
        if let Some(transport) = &package.transport {
            if let Some(transport_type) = &transport.transport_type {
                tags.add(&format!("transport-{transport_type}"));
            }
        }
    }
    if let Some(repo_source) = server.repository.as_ref().and_then(|r| r.source.as_deref()) {
        tags.add(&format!("source-{repo_source}"));
    }

    Some(Candidate {
        name: registry_display_name(&registry_name, &title),
        slug,
        description: truncate_chars(&description, DESCRIPTION_MAX_LEN),
        server_url,
        repo_url,
        category: infer_category(&blob),
        auth_type: infer_auth_type(&blob, has_secret_env),
        tags: tags.finish(),
        maintainer: Maintainer {
            name: registry_maintainer_name(&registry_name),
            email: None,
        },
        status: AUTO_STATUS,
        verification_level: AUTO_VERIFICATION_LEVEL,
    })
}

fn classify_github(repo: &GithubRepo) -> Option<Candidate> {
    if repo.archived {
        return None;
    }
    let full_name = normalize_whitespace(repo.full_name.as_deref().unwrap_or_default());
    let repo_name = normalize_whitespace(repo.name.as_deref().unwrap_or_default());
    if full_name.is_empty() || repo_name.is_empty() {
        return None;
    }
    let repo_url = http_url_or_none(repo.html_url.as_deref())?;

    let canonical_name = repo_name
        .trim_start_matches("mcp-")
        .trim_start_matches("mcp_")
        .to_string();
    let display_name = {
        let humanized = humanize_identifier(&canonical_name);
        let name = if humanized.is_empty() {
            repo_name.clone()
        } else {
            humanized
        };
        truncate_chars(&name, NAME_MAX_LEN)
    };

    let slug = slug_or_fallback(normalize_slug(&repo_name), &full_name);
    let description = normalize_whitespace(repo.description.as_deref().unwrap_or_default());
    let description = if description.is_empty() {
        format!("Imported from GitHub repository {full_name}.")
    } else {
        description
    };
    let topics = repo.topics.join(" ");
    let blob = format!("{full_name} {display_name} {description} {topics}");

    let mut tags = TagSet::new(Source::Github);
    tags.add("mcp");
    tags.add("github");
    for topic in &repo.topics {
        tags.add(topic);
    }

    let homepage = http_url_or_none(repo.homepage.as_deref());
    let maintainer_name = normalize_whitespace(
        repo.owner
            .as_ref()
            .and_then(|o| o.login.as_deref())
            .unwrap_or("GitHub"),
    );

    Some(Candidate {
        name: display_name,
        slug,
        description: truncate_chars(&description, DESCRIPTION_MAX_LEN),
        server_url: Some(homepage.unwrap_or_else(|| repo_url.clone())),
        repo_url: Some(repo_url),
        category: infer_category(&blob),
        auth_type: infer_auth_type(&blob, false),
        tags: tags.finish(),
        maintainer: Maintainer {
            name: truncate_chars(&maintainer_name, NAME_MAX_LEN),
            email: None,
        },
        status: AUTO_STATUS,
        verification_level: AUTO_VERIFICATION_LEVEL,
    })
}

fn classify_npm(object: &NpmObject) -> Option<Candidate> {
    let package = &object.package;
    let package_name = normalize_whitespace(&package.name);
    if package_name.is_empty() {
        return None;
    }

    let slug = slug_or_fallback(
        normalize_slug(&package_name.trim_start_matches('@').replace('/', "-")),
        &package_name,
    );
    let description = normalize_whitespace(package.description.as_deref().unwrap_or_default());
    let description = if description.is_empty() {
        format!("MCP server published on npm as {package_name}.")
    } else {
        description
    };
    let keywords = package.keywords.join(" ");
    let blob = format!("{package_name} {description} {keywords}");

    let mut tags = TagSet::new(Source::Npm);
    tags.add("mcp");
    tags.add("npm");
    for keyword in &package.keywords {
        tags.add(keyword);
    }

    let repo_url = http_url_or_none(package.links.repository.as_deref());
    let server_url = http_url_or_none(package.links.homepage.as_deref())
        .or_else(|| http_url_or_none(package.links.npm.as_deref()));
    let maintainer_name = package
        .publisher
        .as_ref()
        .and_then(|p| p.username.as_deref())
        .or_else(|| {
            package
                .maintainers
                .first()
                .and_then(|m| m.username.as_deref())
        })
        .unwrap_or("npm User");

    Some(Candidate {
        name: truncate_chars(&package_name, NAME_MAX_LEN),
        slug,
        description: truncate_chars(&description, DESCRIPTION_MAX_LEN),
        server_url,
        repo_url,
        category: infer_category(&blob),
        auth_type: infer_auth_type(&blob, false),
        tags: tags.finish(),
        maintainer: Maintainer {
            name: truncate_chars(&normalize_whitespace(maintainer_name), NAME_MAX_LEN),
            email: None,
        },
        status: AUTO_STATUS,
        verification_level: AUTO_VERIFICATION_LEVEL,
    })
}

fn classify_community(server: &CommunityServer) -> Option<Candidate> {
    let name = normalize_whitespace(&server.name);
    if name.is_empty() {
        return None;
    }

    let slug = slug_or_fallback(normalize_slug(&name), &name);
    let description = normalize_whitespace(server.description.as_deref().unwrap_or_default());
    let description = if description.is_empty() {
        format!("MCP server from the community registry: {name}.")
    } else {
        description
    };
    let tag_text = server.tags.join(" ");
    let blob = format!("{name} {description} {tag_text}");

    let mut tags = TagSet::new(Source::Community);
    tags.add("mcp");
    for tag in &server.tags {
        tags.add(tag);
    }

    let repo_url = http_url_or_none(server.repo_url.as_deref());
    let server_url = http_url_or_none(server.homepage.as_deref()).or_else(|| repo_url.clone());
    let maintainer_name = normalize_whitespace(server.owner.as_deref().unwrap_or("Community"));

    Some(Candidate {
        name: truncate_chars(&name, NAME_MAX_LEN),
        slug,
        description: truncate_chars(&description, DESCRIPTION_MAX_LEN),
        server_url,
        repo_url,
        category: infer_category(&blob),
        auth_type: infer_auth_type(&blob, false),
        tags: tags.finish(),
        maintainer: Maintainer {
            name: truncate_chars(&maintainer_name, NAME_MAX_LEN),
            email: None,
        },
        status: AUTO_STATUS,
        verification_level: AUTO_VERIFICATION_LEVEL,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serverdex_adapters::{
        GithubOwner, NpmLinks, NpmPackage, RegistryEnvironmentVariable, RegistryMeta,
        RegistryOfficialMeta, RegistryPackage, RegistryRepository, RegistryTransport,
    };

    fn registry_record(name: &str, status: Option<&str>) -> RegistryRecord {
        RegistryRecord {
            server: Some(RegistryServer {
                name: Some(name.to_string()),
                title: Some("Acme Weather".to_string()),
                description: Some("Weather lookups over MCP.".to_string()),
                repository: Some(RegistryRepository {
                    url: Some("https://github.com/acme/weather".to_string()),
                    source: Some("github".to_string()),
                }),
                remotes: vec![RegistryTransport {
                    transport_type: Some("streamable-http".to_string()),
                    url: Some("https://mcp.acme.dev".to_string()),
                }],
                packages: vec![RegistryPackage {
                    registry_type: Some("npm".to_string()),
                    transport: None,
                    environment_variables: vec![RegistryEnvironmentVariable {
                        name: Some("ACME_KEY".to_string()),
                        is_secret: Some(true),
                    }],
                }],
            }),
            meta: status.map(|s| RegistryMeta {
                official: Some(RegistryOfficialMeta {
                    status: Some(s.to_string()),
                }),
            }),
        }
    }

    #[test]
    fn classification_is_idempotent() {
        let raw = RawListing::Registry(registry_record("io.acme/weather", Some("active")));
        let first = classify(&raw).unwrap();
        let second = classify(&raw).unwrap();
        assert_eq!(first, second);
        assert_eq!(
            serde_json::to_vec(&first).unwrap(),
            serde_json::to_vec(&second).unwrap()
        );
    }

    #[test]
    fn registry_record_classifies_fully() {
        let raw = RawListing::Registry(registry_record("io.acme/weather", Some("active")));
        let candidate = classify(&raw).unwrap();
        assert_eq!(candidate.slug, "io-acme-weather");
        assert_eq!(candidate.name, "Acme Weather");
        assert_eq!(candidate.server_url.as_deref(), Some("https://mcp.acme.dev"));
        assert_eq!(
            candidate.repo_url.as_deref(),
            Some("https://github.com/acme/weather")
        );
        // Secret env var forces api_key even without keyword hits.
        assert_eq!(candidate.auth_type, AuthType::ApiKey);
        assert_eq!(candidate.maintainer.name, "Io Acme");
        assert_eq!(candidate.tags[0], "mcp-registry");
        assert!(candidate.tags.contains(&"transport-streamable-http".to_string()));
        assert!(candidate.tags.contains(&"package-npm".to_string()));
        assert!(candidate.tags.contains(&"source-github".to_string()));
    }

    #[test]
    fn non_active_official_status_is_unusable() {
        let raw = RawListing::Registry(registry_record("io.acme/weather", Some("deprecated")));
        assert!(classify(&raw).is_none());
        // Absent status is treated as usable.
        let raw = RawListing::Registry(registry_record("io.acme/weather", None));
        assert!(classify(&raw).is_some());
    }

    #[test]
    fn registry_name_with_no_alphanumerics_gets_fallback_slug() {
        let mut record = registry_record("io.acme/weather", Some("active"));
        record.server.as_mut().unwrap().name = Some("///".to_string());
        record.server.as_mut().unwrap().title = None;
        let candidate = classify(&RawListing::Registry(record)).unwrap();
        assert!(candidate.slug.starts_with("registry-"));
    }

    #[test]
    fn archived_github_repo_is_unusable() {
        let repo = GithubRepo {
            full_name: Some("acme/mcp-weather".to_string()),
            name: Some("mcp-weather".to_string()),
            description: None,
            html_url: Some("https://github.com/acme/mcp-weather".to_string()),
            homepage: None,
            topics: vec![],
            archived: true,
            owner: None,
        };
        assert!(classify(&RawListing::Github(repo)).is_none());
    }

    #[test]
    fn github_repo_classifies_with_prefix_stripped_display_name() {
        let repo = GithubRepo {
            full_name: Some("acme/mcp-weather-server".to_string()),
            name: Some("mcp-weather-server".to_string()),
            description: Some("Weather data for agents.".to_string()),
            html_url: Some("https://github.com/acme/mcp-weather-server".to_string()),
            homepage: Some("https://weather.acme.dev".to_string()),
            topics: vec!["mcp-server".to_string(), "Weather Data".to_string()],
            archived: false,
            owner: Some(GithubOwner {
                login: Some("acme".to_string()),
                html_url: None,
            }),
        };
        let candidate = classify(&RawListing::Github(repo)).unwrap();
        assert_eq!(candidate.name, "Weather Server");
        assert_eq!(candidate.slug, "mcp-weather-server");
        assert_eq!(candidate.server_url.as_deref(), Some("https://weather.acme.dev"));
        assert_eq!(candidate.maintainer.name, "acme");
        assert!(candidate.tags.contains(&"weather-data".to_string()));
        assert_eq!(candidate.tags[0], "github-sync");
    }

    #[test]
    fn npm_scoped_package_slug_drops_scope_separator() {
        let object = NpmObject {
            package: NpmPackage {
                name: "@acme/mcp-weather".to_string(),
                description: Some("OAuth-secured weather API bridge.".to_string()),
                keywords: vec!["mcp-server".to_string(), "weather".to_string()],
                links: NpmLinks {
                    npm: Some("https://www.npmjs.com/package/@acme/mcp-weather".to_string()),
                    repository: Some("https://github.com/acme/mcp-weather".to_string()),
                    homepage: None,
                },
                publisher: None,
                maintainers: vec![],
            },
        };
        let candidate = classify(&RawListing::Npm(object)).unwrap();
        assert_eq!(candidate.slug, "acme-mcp-weather");
        assert_eq!(candidate.auth_type, AuthType::Oauth);
        assert_eq!(candidate.maintainer.name, "npm User");
        assert_eq!(
            candidate.server_url.as_deref(),
            Some("https://www.npmjs.com/package/@acme/mcp-weather")
        );
    }

    #[test]
    fn category_rules_are_ordered_first_match_wins() {
        // "github" appears in a Developer Tools rule that precedes Search.
        assert_eq!(infer_category("github search crawler"), "Developer Tools");
        assert_eq!(infer_category("web crawler for discovery"), "Search");
        assert_eq!(infer_category("nothing matches here at all"), FALLBACK_CATEGORY);
    }

    #[test]
    fn community_server_without_urls_still_classifies() {
        let server = CommunityServer {
            name: "acme-notes".to_string(),
            description: None,
            owner: None,
            repo_url: None,
            homepage: None,
            tags: vec![],
        };
        let candidate = classify(&RawListing::Community(server)).unwrap();
        assert_eq!(candidate.slug, "acme-notes");
        assert!(candidate.server_url.is_none());
        assert!(candidate
            .description
            .starts_with("MCP server from the community registry"));
        assert_eq!(candidate.maintainer.name, "Community");
    }
}
