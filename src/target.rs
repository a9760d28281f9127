//! Target identifiers and same-site URL filtering

use std::collections::HashSet;
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use crate::error::ProbeError;

/// Resources that are never listing or product pages
static JUNK_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(sitemap\.xml|robots\.txt|favicon\.ico|\.css(\?|$)|\.js(\?|$)|\.png|\.jpe?g|\.svg)")
        .expect("junk pattern is valid")
});

/// A normalized analysis target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// Canonical URL handed to the agent
    pub url: Url,
    /// Host as the caller wrote it, lowercased
    pub domain: String,
}

impl Target {
    /// Default the scheme to https and lowercase the host. With `prefer_www`,
    /// a bare two-label host (`shop.com`) is rewritten to `www.shop.com`,
    /// which avoids many geo-redirect landing pages.
    pub fn normalize(raw: &str, prefer_www: bool) -> Result<Self, ProbeError> {
        let trimmed = raw.trim();
        let invalid = |reason: String| ProbeError::InvalidTarget {
            target: raw.to_owned(),
            reason,
        };
        if trimmed.is_empty() {
            return Err(invalid("empty target".into()));
        }

        let lower = trimmed.to_ascii_lowercase();
        let with_scheme = if lower.starts_with("http://") || lower.starts_with("https://") {
            trimmed.to_owned()
        } else {
            format!("https://{trimmed}")
        };
        let mut url = Url::parse(&with_scheme).map_err(|e| invalid(e.to_string()))?;
        let domain = url
            .host_str()
            .ok_or_else(|| invalid("missing host".into()))?
            .to_ascii_lowercase();

        if prefer_www && !domain.starts_with("www.") && domain.matches('.').count() == 1 {
            url.set_host(Some(&format!("www.{domain}")))
                .map_err(|e| invalid(e.to_string()))?;
        }
        Ok(Self { url, domain })
    }

    /// Host without a leading `www.`
    pub fn site(&self) -> &str {
        strip_www(&self.domain)
    }

    /// True if `host` is this site or one of its subdomains
    pub fn is_same_site(&self, host: &str) -> bool {
        let host = strip_www(host);
        let site = self.site();
        host.eq_ignore_ascii_case(site)
            || host
                .to_ascii_lowercase()
                .ends_with(&format!(".{}", site.to_ascii_lowercase()))
    }

    /// Keep same-site, non-asset, non-root URLs from an agent-supplied list.
    ///
    /// Relative entries are resolved against the target, duplicates dropped,
    /// first-seen order preserved, output capped at `cap`.
    pub fn filter_urls(&self, candidates: &[Value], cap: usize) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut kept = Vec::new();

        for candidate in candidates {
            if kept.len() >= cap {
                break;
            }
            let Some(raw) = candidate.as_str().map(str::trim).filter(|s| !s.is_empty()) else {
                continue;
            };
            if !seen.insert(raw.to_owned()) || JUNK_URL.is_match(raw) {
                continue;
            }
            let Ok(url) = self.url.join(raw) else {
                continue;
            };
            if !matches!(url.scheme(), "http" | "https") {
                continue;
            }
            if url.path() == "/" && url.query().is_none() {
                continue;
            }
            if !url.host_str().is_some_and(|h| self.is_same_site(h)) {
                continue;
            }
            kept.push(url.to_string());
        }
        kept
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.url.as_str())
    }
}

fn strip_www(host: &str) -> &str {
    host.strip_prefix("www.").unwrap_or(host)
}

/// Obstacle the agent reported while working on a target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityIssue {
    Cloudflare,
    Captcha,
    BotProtection,
    Blocked,
    Timeout,
}

impl SecurityIssue {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityIssue::Cloudflare => "cloudflare",
            SecurityIssue::Captcha => "captcha",
            SecurityIssue::BotProtection => "bot_protection",
            SecurityIssue::Blocked => "blocked",
            SecurityIssue::Timeout => "timeout",
        }
    }

    /// Parse an agent-supplied label; unknown labels (including "none") yield `None`
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "cloudflare" => Some(SecurityIssue::Cloudflare),
            "captcha" | "recaptcha" | "hcaptcha" => Some(SecurityIssue::Captcha),
            "bot_protection" | "bot protection" => Some(SecurityIssue::BotProtection),
            "blocked" | "access_denied" => Some(SecurityIssue::Blocked),
            "timeout" => Some(SecurityIssue::Timeout),
            _ => None,
        }
    }

    /// Known labels from a JSON array, deduplicated in first-seen order
    pub fn from_values(values: Option<&Value>) -> Vec<Self> {
        let mut issues = Vec::new();
        for issue in values
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(Value::as_str)
            .filter_map(Self::from_label)
        {
            if !issues.contains(&issue) {
                issues.push(issue);
            }
        }
        issues
    }
}

impl fmt::Display for SecurityIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn shop() -> Target {
        Target::normalize("shop.com", true).unwrap()
    }

    // === Normalization Tests ===

    #[test]
    fn test_normalize_defaults_scheme_and_www() {
        let target = shop();
        assert_eq!(target.url.as_str(), "https://www.shop.com/");
        assert_eq!(target.domain, "shop.com");
        assert_eq!(target.site(), "shop.com");
    }

    #[test]
    fn test_normalize_keeps_subdomains_and_paths() {
        let target = Target::normalize("HTTP://Store.Example.co.uk/events", true).unwrap();
        assert_eq!(target.url.as_str(), "http://store.example.co.uk/events");
        assert_eq!(target.domain, "store.example.co.uk");

        let venue = Target::normalize("venue.org/calendar", false).unwrap();
        assert_eq!(venue.url.as_str(), "https://venue.org/calendar");
    }

    #[test]
    fn test_normalize_rejects_garbage() {
        assert!(matches!(
            Target::normalize("   ", true),
            Err(ProbeError::InvalidTarget { .. })
        ));
        assert!(Target::normalize("https://", true).is_err());
    }

    // === Filter Tests ===

    #[test]
    fn test_filter_rejects_homepage_assets_and_foreign_hosts() {
        let urls = json!([
            "https://www.shop.com/",
            "https://shop.com",
            "https://www.shop.com/sitemap.xml",
            "https://www.shop.com/robots.txt",
            "https://www.shop.com/static/app.js",
            "https://www.shop.com/img/logo.png",
            "https://cdn.other.com/category/shoes",
            "https://www.shop.com/category/shoes",
            42,
            "",
        ]);
        let kept = shop().filter_urls(urls.as_array().unwrap(), 10);
        assert_eq!(kept, vec!["https://www.shop.com/category/shoes"]);
    }

    #[test]
    fn test_filter_resolves_relative_and_accepts_subdomains() {
        let urls = json!(["/collections/hats", "https://eu.shop.com/c/1", "/collections/hats"]);
        let kept = shop().filter_urls(urls.as_array().unwrap(), 10);
        assert_eq!(
            kept,
            vec![
                "https://www.shop.com/collections/hats",
                "https://eu.shop.com/c/1",
            ]
        );
    }

    #[test]
    fn test_filter_caps_in_first_seen_order() {
        let urls: Vec<Value> = (0..15)
            .map(|n| json!(format!("https://www.shop.com/product/{n}")))
            .collect();
        let kept = shop().filter_urls(&urls, 10);
        assert_eq!(kept.len(), 10);
        assert_eq!(kept[0], "https://www.shop.com/product/0");
        assert_eq!(kept[9], "https://www.shop.com/product/9");
    }

    #[test]
    fn test_similar_suffix_is_not_same_site() {
        let target = shop();
        assert!(target.is_same_site("shop.com"));
        assert!(target.is_same_site("WWW.SHOP.COM"));
        assert!(!target.is_same_site("myshop.com"));
    }

    // === Security Issue Tests ===

    #[test]
    fn test_security_labels_degrade_silently() {
        let issues = SecurityIssue::from_values(Some(&json!([
            "Cloudflare", "none", "captcha", "weird", 7, "cloudflare", "timeout"
        ])));
        assert_eq!(
            issues,
            vec![SecurityIssue::Cloudflare, SecurityIssue::Captcha, SecurityIssue::Timeout]
        );
        assert!(SecurityIssue::from_values(None).is_empty());
        assert!(SecurityIssue::from_values(Some(&json!("cloudflare"))).is_empty());
    }
}
