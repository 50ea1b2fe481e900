//! URL classification into caching policies.

use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;

/// Caching policy applied to a GET request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Policy {
  CacheFirst,
  NetworkFirst,
  StaleWhileRevalidate,
}

impl Policy {
  /// Evaluation order of rule groups; lower runs first.
  fn priority(self) -> u8 {
    match self {
      Policy::CacheFirst => 0,
      Policy::NetworkFirst => 1,
      Policy::StaleWhileRevalidate => 2,
    }
  }
}

impl fmt::Display for Policy {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      Policy::CacheFirst => "cache-first",
      Policy::NetworkFirst => "network-first",
      Policy::StaleWhileRevalidate => "stale-while-revalidate",
    })
  }
}

/// Predicate over a request URL.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UrlMatcher {
  /// Extension of the last path segment, case-insensitive, without the dot
  Extension(Vec<String>),
  /// Path starts with this prefix
  PathPrefix(String),
  /// Path contains this substring
  PathContains(String),
  /// Some path segment equals one of these, case-insensitive
  Segment(Vec<String>),
  /// Host equals this domain or is a subdomain of it
  Host(String),
}

impl UrlMatcher {
  fn extensions(exts: &[&str]) -> Self {
    Self::Extension(exts.iter().map(|e| e.to_string()).collect())
  }

  pub fn matches(&self, url: &Url) -> bool {
    match self {
      Self::Extension(exts) => match extension(url) {
        Some(ext) => exts.iter().any(|e| e.eq_ignore_ascii_case(ext)),
        None => false,
      },
      Self::PathPrefix(prefix) => url.path().starts_with(prefix.as_str()),
      Self::PathContains(needle) => url.path().contains(needle.as_str()),
      Self::Segment(names) => url
        .path_segments()
        .into_iter()
        .flatten()
        .any(|segment| names.iter().any(|n| n.eq_ignore_ascii_case(segment))),
      Self::Host(domain) => match url.host_str() {
        Some(host) => {
          host.eq_ignore_ascii_case(domain)
            || host
              .to_ascii_lowercase()
              .ends_with(&format!(".{}", domain.to_ascii_lowercase()))
        }
        None => false,
      },
    }
  }
}

fn extension(url: &Url) -> Option<&str> {
  let segment = url.path_segments()?.next_back()?;
  let (stem, ext) = segment.rsplit_once('.')?;
  if stem.is_empty() || ext.is_empty() {
    return None;
  }
  Some(ext)
}

/// One entry of the rule table.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Rule {
  #[serde(rename = "match", deserialize_with = "serde_yaml::with::singleton_map::deserialize")]
  pub matcher: UrlMatcher,
  pub policy: Policy,
}

impl Rule {
  pub fn new(matcher: UrlMatcher, policy: Policy) -> Self {
    Self { matcher, policy }
  }
}

/// Ordered, immutable rule table. First match wins; no match means
/// network-first.
#[derive(Debug, Clone)]
pub struct RuleTable {
  rules: Vec<Rule>,
}

impl RuleTable {
  /// Build a table from arbitrary rules. Rules are grouped by policy
  /// (cache-first, network-first, stale-while-revalidate) keeping their
  /// relative order inside each group.
  pub fn new(mut rules: Vec<Rule>) -> Self {
    rules.sort_by_key(|rule| rule.policy.priority());
    Self { rules }
  }

  /// The built-in table for static assets, API/feed data and images.
  pub fn builtin() -> Self {
    Self::new(vec![
      // Scripts, styles, fonts
      Rule::new(
        UrlMatcher::extensions(&["js", "mjs", "css", "woff", "woff2", "ttf", "otf", "eot"]),
        Policy::CacheFirst,
      ),
      Rule::new(
        UrlMatcher::Host("fonts.googleapis.com".into()),
        Policy::CacheFirst,
      ),
      Rule::new(
        UrlMatcher::Host("fonts.gstatic.com".into()),
        Policy::CacheFirst,
      ),
      // API and content feeds
      Rule::new(UrlMatcher::PathPrefix("/api/".into()), Policy::NetworkFirst),
      Rule::new(
        UrlMatcher::Segment(vec!["feed".into(), "feeds".into()]),
        Policy::NetworkFirst,
      ),
      Rule::new(
        UrlMatcher::extensions(&["json", "xml", "rss", "atom"]),
        Policy::NetworkFirst,
      ),
      // Images
      Rule::new(
        UrlMatcher::extensions(&["png", "jpg", "jpeg", "gif", "webp", "avif", "svg", "ico"]),
        Policy::StaleWhileRevalidate,
      ),
    ])
  }

  pub fn classify(&self, url: &Url) -> Policy {
    self
      .rules
      .iter()
      .find(|rule| rule.matcher.matches(url))
      .map(|rule| rule.policy)
      .unwrap_or(Policy::NetworkFirst)
  }

  #[cfg(test)]
  pub fn rules(&self) -> &[Rule] {
    &self.rules
  }
}

impl Default for RuleTable {
  fn default() -> Self {
    Self::builtin()
  }
}
