//! Moderation pattern matching and the low-quality heuristic filter.

use std::sync::OnceLock;

use regex::{Regex, RegexBuilder};
use serde::Serialize;
use serverdex_core::Candidate;
use tracing::warn;

/// How a moderation pattern was interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatcherKind {
    /// `/body/flags` literal compiled as-is.
    Regex,
    /// Pattern containing `*` or `?` glob characters.
    Wildcard,
    /// Anything else: case-insensitive substring.
    Substring,
}

#[derive(Debug, Clone)]
pub struct ModerationMatcher {
    raw: String,
    kind: MatcherKind,
    regex: Regex,
}

impl ModerationMatcher {
    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn kind(&self) -> MatcherKind {
        self.kind
    }

    pub fn is_match(&self, haystack: &str) -> bool {
        self.regex.is_match(haystack)
    }
}

fn escape_regex(value: &str) -> String {
    regex::escape(value)
}

/// Split a `/body/flags` literal into its parts, or `None` when the pattern
/// is not in literal form at all.
fn parse_regex_literal(pattern: &str) -> Option<(&str, &str)> {
    let rest = pattern.strip_prefix('/')?;
    let close = rest.rfind('/')?;
    let body = &rest[..close];
    let flags = &rest[close + 1..];
    if body.is_empty() || !flags.chars().all(|c| "dgimsuvy".contains(c)) {
        return None;
    }
    Some((body, flags))
}

fn compile_regex_literal(pattern: &str, body: &str, flags: &str) -> Option<ModerationMatcher> {
    let mut builder = RegexBuilder::new(body);
    builder
        .case_insensitive(flags.contains('i'))
        .multi_line(flags.contains('m'))
        .dot_matches_new_line(flags.contains('s'));

    match builder.build() {
        Ok(regex) => Some(ModerationMatcher {
            raw: pattern.to_string(),
            kind: MatcherKind::Regex,
            regex,
        }),
        Err(err) => {
            // Resolved open question: a broken pattern is dropped loudly in
            // the logs rather than failing the whole run's configuration.
            warn!(pattern, error = %err, "dropping invalid moderation regex pattern");
            None
        }
    }
}

fn compile_plain(pattern: &str) -> Option<ModerationMatcher> {
    let has_globs = pattern.contains('*') || pattern.contains('?');
    let kind = if has_globs {
        MatcherKind::Wildcard
    } else {
        MatcherKind::Substring
    };
    let body = escape_regex(pattern)
        .replace(r"\*", ".*")
        .replace(r"\?", ".");

    match RegexBuilder::new(&body).case_insensitive(true).build() {
        Ok(regex) => Some(ModerationMatcher {
            raw: pattern.to_string(),
            kind,
            regex,
        }),
        Err(err) => {
            warn!(pattern, error = %err, "dropping uncompilable moderation pattern");
            None
        }
    }
}

/// Compile a raw pattern list: whitespace-normalized, case-insensitively
/// deduplicated, invalid entries dropped with a warning.
pub fn compile_patterns(patterns: &[String]) -> Vec<ModerationMatcher> {
    let mut seen = std::collections::HashSet::new();
    let mut matchers = Vec::new();
    for raw in patterns {
        let pattern = serverdex_core::normalize_whitespace(raw);
        if pattern.is_empty() || !seen.insert(pattern.to_lowercase()) {
            continue;
        }
        let matcher = match parse_regex_literal(&pattern) {
            Some((body, flags)) => compile_regex_literal(&pattern, body, flags),
            None => compile_plain(&pattern),
        };
        if let Some(matcher) = matcher {
            matchers.push(matcher);
        }
    }
    matchers
}

/// Allow/deny rule set for one run. Allow always wins over deny: an
/// allowlisted candidate never reaches deny evaluation.
#[derive(Debug, Default)]
pub struct ModerationEngine {
    allow: Vec<ModerationMatcher>,
    deny: Vec<ModerationMatcher>,
}

impl ModerationEngine {
    pub fn new(allowlist: &[String], denylist: &[String]) -> Self {
        Self {
            allow: compile_patterns(allowlist),
            deny: compile_patterns(denylist),
        }
    }

    pub fn enabled(&self) -> bool {
        !self.allow.is_empty() || !self.deny.is_empty()
    }

    pub fn allow_pattern_count(&self) -> usize {
        self.allow.len()
    }

    pub fn deny_pattern_count(&self) -> usize {
        self.deny.len()
    }

    pub fn allow_match(&self, blob: &str) -> Option<&str> {
        self.allow
            .iter()
            .find(|m| m.is_match(blob))
            .map(|m| m.raw())
    }

    pub fn deny_match(&self, blob: &str) -> Option<&str> {
        self.deny
            .iter()
            .find(|m| m.is_match(blob))
            .map(|m| m.raw())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModerationFilterHit {
    pub slug: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QualityFilterHit {
    pub slug: String,
    pub score: u32,
    pub reason: String,
}

struct QualitySignal {
    name: &'static str,
    pattern: Regex,
    weight: u32,
}

fn signal(name: &'static str, pattern: &str, weight: u32) -> QualitySignal {
    QualitySignal {
        name,
        pattern: RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .expect("static quality signal pattern"),
        weight,
    }
}

fn quality_signals() -> &'static [QualitySignal] {
    static SIGNALS: OnceLock<Vec<QualitySignal>> = OnceLock::new();
    SIGNALS.get_or_init(|| {
        vec![
            signal("staging/sandbox marker", r"\b(staging|sandbox|localhost)\b", 2),
            signal("proof-of-concept marker", r"\b(poc|proof[- ]of[- ]concept)\b", 2),
            signal("testing marker", r"\b(test|testing|qa)\b", 1),
            signal("demo/sample marker", r"\b(demo|sample|example|tutorial)\b", 1),
            signal("template marker", r"\b(template|boilerplate|starter)\b", 1),
            signal("homework marker", r"\b(hw|homework|assignment)\b", 1),
            signal("hello marker", r"\bhello(?:[- ]world)?\b", 1),
            signal("personal marker", r"\b(my[- ]?mcp|personal[- ]?mcp)\b", 1),
        ]
    })
}

fn hash_suffix_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        RegexBuilder::new(r"-[a-f0-9]{8,}$")
            .case_insensitive(true)
            .build()
            .expect("static hash suffix pattern")
    })
}

/// Fallback description prefixes the classifier emits when upstream supplies
/// no human-written text.
const PLACEHOLDER_DESCRIPTION_PREFIXES: [&str; 4] = [
    "Automatically imported from",
    "Imported from GitHub repository",
    "MCP server published on npm",
    "MCP server from the community registry",
];

/// Score a candidate against the weighted low-quality signal table plus
/// structural penalties. Returns a hit when the candidate should be
/// filtered: `score >= 3`, or `score >= 2` with at least one strong
/// (weight >= 2) signal.
pub fn evaluate_quality(candidate: &Candidate) -> Option<QualityFilterHit> {
    let blob = candidate.filter_blob();
    let mut score = 0u32;
    let mut reasons: Vec<&str> = Vec::new();
    let mut has_strong_signal = false;

    for signal in quality_signals() {
        if !signal.pattern.is_match(&blob) {
            continue;
        }
        score += signal.weight;
        reasons.push(signal.name);
        if signal.weight >= 2 {
            has_strong_signal = true;
        }
    }

    if candidate.repo_url.is_none() && candidate.server_url.is_none() {
        score += 1;
        reasons.push("missing repo/server URL");
    }
    if hash_suffix_pattern().is_match(&candidate.slug) {
        score += 1;
        reasons.push("hash-suffixed slug");
    }
    if PLACEHOLDER_DESCRIPTION_PREFIXES
        .iter()
        .any(|prefix| candidate.description.starts_with(prefix))
    {
        score += 1;
        reasons.push("missing human description");
    }

    let should_filter = score >= 3 || (score >= 2 && has_strong_signal);
    if !should_filter {
        return None;
    }

    let mut distinct = Vec::new();
    for reason in reasons {
        if !distinct.contains(&reason) {
            distinct.push(reason);
        }
    }
    Some(QualityFilterHit {
        slug: candidate.slug.clone(),
        score,
        reason: distinct
            .into_iter()
            .take(3)
            .collect::<Vec<_>>()
            .join(", "),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serverdex_core::{AuthType, Maintainer, ServerStatus, VerificationLevel};

    fn candidate(slug: &str, name: &str, description: &str) -> Candidate {
        Candidate {
            slug: slug.to_string(),
            name: name.to_string(),
            description: description.to_string(),
            server_url: Some("https://example.com".into()),
            repo_url: Some("https://github.com/acme/x".into()),
            category: "Other Tools and Integrations".into(),
            auth_type: AuthType::None,
            tags: vec![],
            maintainer: Maintainer {
                name: "Acme".into(),
                email: None,
            },
            status: ServerStatus::Active,
            verification_level: VerificationLevel::Community,
        }
    }

    #[test]
    fn patterns_compile_into_three_kinds() {
        let matchers = compile_patterns(&[
            "/crypto-?miner/i".to_string(),
            "spam-*-server".to_string(),
            "Casino".to_string(),
        ]);
        assert_eq!(matchers.len(), 3);
        assert_eq!(matchers[0].kind(), MatcherKind::Regex);
        assert_eq!(matchers[1].kind(), MatcherKind::Wildcard);
        assert_eq!(matchers[2].kind(), MatcherKind::Substring);

        assert!(matchers[0].is_match("a CRYPTOMINER tool"));
        assert!(matchers[1].is_match("spam-email-server"));
        assert!(!matchers[1].is_match("spam server"));
        assert!(matchers[2].is_match("Best CASINO bot"));
    }

    #[test]
    fn invalid_regex_patterns_are_dropped_silently_from_the_set() {
        let matchers = compile_patterns(&["/((unclosed/i".to_string(), "ok".to_string()]);
        assert_eq!(matchers.len(), 1);
        assert_eq!(matchers[0].raw(), "ok");
    }

    #[test]
    fn patterns_are_deduplicated_case_insensitively() {
        let matchers =
            compile_patterns(&["Casino".to_string(), "casino".to_string(), " ".to_string()]);
        assert_eq!(matchers.len(), 1);
    }

    #[test]
    fn allow_wins_over_deny() {
        let engine = ModerationEngine::new(
            &["trusted-*".to_string()],
            &["trusted-casino".to_string()],
        );
        let blob = "trusted-casino server";
        assert!(engine.allow_match(blob).is_some());
        // Callers never consult deny when allow matched; both matching is
        // fine at this layer.
        assert!(engine.deny_match(blob).is_some());
    }

    #[test]
    fn single_weak_signal_is_never_filtered() {
        let hit = evaluate_quality(&candidate(
            "acme-weather",
            "Acme Weather",
            "A demo of weather lookups.",
        ));
        assert!(hit.is_none());
    }

    #[test]
    fn strong_plus_weak_signal_is_always_filtered() {
        let hit = evaluate_quality(&candidate(
            "acme-weather",
            "Acme Weather Sandbox",
            "A demo of weather lookups.",
        ))
        .expect("should filter at score 3");
        assert_eq!(hit.score, 3);
        assert!(hit.reason.contains("staging/sandbox marker"));
        assert!(hit.reason.contains("demo/sample marker"));
    }

    #[test]
    fn two_weak_signals_do_not_filter_without_strong() {
        let hit = evaluate_quality(&candidate(
            "acme-weather",
            "Acme Weather",
            "A demo template for weather lookups.",
        ));
        assert!(hit.is_none());
    }

    #[test]
    fn structural_penalties_accumulate() {
        let mut c = candidate(
            "registry-0a1b2c3d4e5f",
            "Weather",
            "Automatically imported from MCP Registry entry: io.acme/weather.",
        );
        c.repo_url = None;
        c.server_url = None;
        let hit = evaluate_quality(&c).expect("three structural penalties filter");
        assert_eq!(hit.score, 3);
        assert_eq!(
            hit.reason,
            "missing repo/server URL, hash-suffixed slug, missing human description"
        );
    }
}
