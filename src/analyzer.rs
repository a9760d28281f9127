//! Local page analysis
//!
//! [`PageAnalyzer`] turns raw HTML into the same kind of facts the agent is
//! asked for. The orchestrator only needs its URL pattern hints; the full
//! report is useful for checking agent answers against a saved page.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::{Regex, RegexSet};
use url::Url;

use crate::site::PaginationType;
use crate::target::{SecurityIssue, Target};

/// Path fragments typical of product detail pages
pub const PRODUCT_PATTERNS: &[&str] = &[
    r"/product/", r"/products/", r"/item/", r"/p/", r"/dp/", r"/pd/", r"/detail/", r"/goods/",
    r"-p-\d+", r"/sku/",
];

/// Path fragments typical of listing and category pages
pub const LISTING_PATTERNS: &[&str] = &[
    r"/category/", r"/categories/", r"/collection/", r"/collections/", r"/shop/", r"/catalog/",
    r"/browse/", r"/search", r"/c/", r"/l/",
];

const CLOUDFLARE_MARKERS: &[&str] = &["cf-browser-verification", "cf_clearance", "cloudflare", "__cf_bm"];
const CAPTCHA_MARKERS: &[&str] = &["captcha", "recaptcha", "hcaptcha", "g-recaptcha", "h-captcha"];
const BOT_MARKERS: &[&str] = &["datadome", "perimeterx", "imperva", "akamai", "distil"];
const SHOP_KEYWORDS: &[&str] = &[
    "add to cart", "add to bag", "buy now", "checkout", "shopping cart", "price", "add-to-cart",
    "product", "shop", "$", "€", "£",
];

static ANCHOR_HREF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)<a\s[^>]*?href\s*=\s*["']([^"']+)["']"#).expect("anchor pattern is valid")
});
static TITLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<title[^>]*>(.*?)</title>").expect("title pattern is valid"));
static INFINITE_SCROLL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)data-infinite-scroll|infinite-scroll|class\s*=\s*["'][^"']*infinite|lazy-load"#)
        .expect("infinite scroll pattern is valid")
});
static LOAD_MORE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)load[ -]more|show more").expect("load more pattern is valid"));
static NEXT_LINK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?i)rel\s*=\s*["']next["']|aria-label\s*=\s*["']next( page)?["']|<(?:a|button)\s[^>]*class\s*=\s*["'][^"']*\b(?:next|pagination-next)\b"#,
    )
    .expect("next link pattern is valid")
});
static PAGINATION_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)class\s*=\s*["'][^"']*pagination[^"']*["'][^>]*>(.*?)</(?:nav|ul|ol|div)>"#)
        .expect("pagination block pattern is valid")
});
static NUMBERED_ANCHOR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<a[^>]*>\s*\d+\s*</a>").expect("numbered anchor pattern is valid"));
static NUMBER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b(\d+)\b").expect("number pattern is valid"));
static PAGE_QUERY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[?&](?:page|p)=\d+").expect("page query pattern is valid"));
static PAGE_OF: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)page\s*\d+\s*of\s*(\d+)").expect("page-of pattern is valid"));
static PRICE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[$€£]\s*\d+[.,]\d{2}").expect("price pattern is valid"));
static PRODUCT_COUNTS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)([\d,]+)\s*products?\b",
        r"(?i)([\d,]+)\s*items?\b",
        r"(?i)([\d,]+)\s*results?\b",
        r"(?i)showing\s*\d+\s*-\s*\d+\s*of\s*([\d,]+)",
        r"(?i)([\d,]+)\s*total\b",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("count pattern is valid"))
    .collect()
});

/// URL shapes handed to the agent as examples
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatternHints {
    pub listing: Vec<String>,
    pub product: Vec<String>,
}

/// Everything the analyzer could tell about one page
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageReport {
    pub title: String,
    pub links: Vec<String>,
    pub listing_urls: Vec<String>,
    pub product_urls: Vec<String>,
    pub pagination: PaginationType,
    pub security_issues: Vec<SecurityIssue>,
    pub is_ecommerce: bool,
    pub estimated_total_products: u64,
    pub estimated_total_pages: u64,
}

/// Produces page facts from raw HTML
pub trait PageAnalyzer: Send + Sync {
    fn analyze(&self, html: &str, base_url: &Url) -> PageReport;

    fn pattern_hints(&self) -> PatternHints;
}

/// Regex-based analyzer
pub struct HeuristicAnalyzer {
    listing: RegexSet,
    product: RegexSet,
}

impl HeuristicAnalyzer {
    pub fn new() -> Self {
        Self {
            listing: RegexSet::new(LISTING_PATTERNS.iter().map(|p| format!("(?i){p}")))
                .expect("listing patterns are valid"),
            product: RegexSet::new(PRODUCT_PATTERNS.iter().map(|p| format!("(?i){p}")))
                .expect("product patterns are valid"),
        }
    }

    /// Same-site absolute links in first-seen order
    fn links(&self, html: &str, base_url: &Url) -> Vec<String> {
        let Some(host) = base_url.host_str() else {
            return Vec::new();
        };
        let site = Target {
            url: base_url.clone(),
            domain: host.to_ascii_lowercase(),
        };
        let mut seen = HashSet::new();
        ANCHOR_HREF
            .captures_iter(html)
            .filter_map(|c| base_url.join(c[1].trim()).ok())
            .filter(|url| url.host_str().is_some_and(|h| site.is_same_site(h)))
            .map(String::from)
            .filter(|url| seen.insert(url.clone()))
            .collect()
    }

    fn pagination(&self, html: &str, base_url: &Url) -> PaginationType {
        if INFINITE_SCROLL.is_match(html) {
            return PaginationType::InfiniteScroll;
        }
        if LOAD_MORE.is_match(html) {
            return PaginationType::LoadMoreButton;
        }
        if NEXT_LINK.is_match(html) {
            return PaginationType::NextPageLink;
        }
        if PAGINATION_BLOCK
            .captures_iter(html)
            .any(|c| NUMBERED_ANCHOR.is_match(&c[1]))
        {
            return PaginationType::NumberedPages;
        }
        if PAGE_QUERY.is_match(base_url.as_str()) {
            return PaginationType::NextPageLink;
        }
        PaginationType::Unknown
    }

    fn security_issues(&self, html: &str) -> Vec<SecurityIssue> {
        let lower = html.to_lowercase();
        [
            (SecurityIssue::Cloudflare, CLOUDFLARE_MARKERS),
            (SecurityIssue::Captcha, CAPTCHA_MARKERS),
            (SecurityIssue::BotProtection, BOT_MARKERS),
        ]
        .into_iter()
        .filter(|(_, markers)| markers.iter().any(|m| lower.contains(m)))
        .map(|(issue, _)| issue)
        .collect()
    }

    fn product_count(&self, html: &str, product_urls: usize) -> u64 {
        for pattern in PRODUCT_COUNTS.iter() {
            if let Some(count) = pattern
                .captures(html)
                .and_then(|c| c[1].replace(',', "").parse::<u64>().ok())
            {
                if count > 0 && count < 1_000_000 {
                    return count;
                }
            }
        }
        product_urls as u64 * 10
    }

    fn page_count(&self, html: &str, product_count: u64) -> u64 {
        let from_block = PAGINATION_BLOCK
            .captures_iter(html)
            .flat_map(|c| {
                NUMBER
                    .captures_iter(&c[1])
                    .filter_map(|n| n[1].parse::<u64>().ok())
                    .collect::<Vec<_>>()
            })
            .filter(|n| *n < 10_000)
            .max();
        if let Some(pages) = from_block {
            return pages;
        }
        if let Some(pages) = PAGE_OF.captures(html).and_then(|c| c[1].parse().ok()) {
            return pages;
        }
        if product_count > 0 {
            return (product_count / 20).max(1);
        }
        0
    }

    fn looks_like_shop(&self, html: &str, listing: usize, product: usize) -> bool {
        let lower = html.to_lowercase();
        let mut score = 0.0;
        if product > 0 {
            score += 2.0;
        }
        if listing > 0 {
            score += 1.0;
        }
        score += 0.5 * SHOP_KEYWORDS.iter().filter(|k| lower.contains(*k)).count() as f64;
        if PRICE.is_match(html) {
            score += 1.0;
        }
        score >= 2.0
    }
}

impl Default for HeuristicAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl PageAnalyzer for HeuristicAnalyzer {
    fn analyze(&self, html: &str, base_url: &Url) -> PageReport {
        let links = self.links(html, base_url);
        let listing_urls: Vec<String> = links.iter().filter(|l| self.listing.is_match(l)).cloned().collect();
        let product_urls: Vec<String> = links.iter().filter(|l| self.product.is_match(l)).cloned().collect();
        let estimated_total_products = self.product_count(html, product_urls.len());

        PageReport {
            title: TITLE
                .captures(html)
                .map(|c| c[1].trim().to_owned())
                .unwrap_or_default(),
            pagination: self.pagination(html, base_url),
            security_issues: self.security_issues(html),
            is_ecommerce: self.looks_like_shop(html, listing_urls.len(), product_urls.len()),
            estimated_total_pages: self.page_count(html, estimated_total_products),
            estimated_total_products,
            listing_urls,
            product_urls,
            links,
        }
    }

    fn pattern_hints(&self) -> PatternHints {
        PatternHints {
            listing: LISTING_PATTERNS.iter().map(|p| p.to_string()).collect(),
            product: PRODUCT_PATTERNS.iter().map(|p| p.to_string()).collect(),
        }
    }
}
