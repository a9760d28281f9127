//! E-commerce site analysis

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::analyzer::PatternHints;
use crate::error::ProbeError;
use crate::extract::{coerce_count, flag_field, text_field};
use crate::orchestrator::AnalysisTask;
use crate::prompt::{self, hint_list};
use crate::retry::{describe_failure, TargetResult};
use crate::sink::Exportable;
use crate::target::{SecurityIssue, Target};

/// How a catalogue moves between pages
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaginationType {
    NextPageLink,
    InfiniteScroll,
    LoadMoreButton,
    NumberedPages,
    None,
    #[default]
    Unknown,
}

impl PaginationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaginationType::NextPageLink => "next_page_link",
            PaginationType::InfiniteScroll => "infinite_scroll",
            PaginationType::LoadMoreButton => "load_more_button",
            PaginationType::NumberedPages => "numbered_pages",
            PaginationType::None => "none",
            PaginationType::Unknown => "unknown",
        }
    }

    /// Unrecognized labels map to `Unknown`
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "next_page_link" => PaginationType::NextPageLink,
            "infinite_scroll" => PaginationType::InfiniteScroll,
            "load_more_button" => PaginationType::LoadMoreButton,
            "numbered_pages" => PaginationType::NumberedPages,
            "none" => PaginationType::None,
            _ => PaginationType::Unknown,
        }
    }
}

impl fmt::Display for PaginationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Analysis of a single store
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SiteAnalysis {
    pub url: String,
    pub domain: String,
    pub is_ecommerce: bool,
    pub listing_urls: Vec<String>,
    pub product_urls: Vec<String>,
    pub has_product_pages: bool,
    pub estimated_total_pages: u64,
    pub estimated_total_products: u64,
    pub pagination_type: PaginationType,
    pub security_issues: Vec<SecurityIssue>,
    pub error_message: Option<String>,
    pub page_title: String,
    pub load_time_seconds: f64,
}

impl SiteAnalysis {
    pub fn new(url: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            domain: domain.into(),
            ..Default::default()
        }
    }
}

impl TargetResult for SiteAnalysis {
    fn entry_count(&self) -> usize {
        self.listing_urls.len() + self.product_urls.len()
    }

    fn security_issues(&self) -> &[SecurityIssue] {
        &self.security_issues
    }

    fn set_security_issues(&mut self, issues: Vec<SecurityIssue>) {
        self.security_issues = issues;
    }

    fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    fn set_error_message(&mut self, message: Option<String>) {
        self.error_message = message;
    }

    fn set_elapsed(&mut self, elapsed: Duration) {
        self.load_time_seconds = (elapsed.as_secs_f64() * 100.0).round() / 100.0;
    }
}

const SITE_COLUMNS: &[&str] = &[
    "url",
    "domain",
    "is_ecommerce",
    "listing_urls_count",
    "listing_urls_sample",
    "product_urls_count",
    "product_urls_sample",
    "has_product_pages",
    "estimated_total_pages",
    "estimated_total_products",
    "pagination_type",
    "security_issues",
    "error_message",
    "page_title",
    "load_time_seconds",
];

fn issue_labels(issues: &[SecurityIssue]) -> Vec<&'static str> {
    issues.iter().map(SecurityIssue::as_str).collect()
}

impl Exportable for SiteAnalysis {
    fn record(&self) -> Value {
        json!({
            "url": self.url,
            "domain": self.domain,
            "is_ecommerce": self.is_ecommerce,
            "listing_urls_count": self.listing_urls.len(),
            "listing_urls_sample": &self.listing_urls[..self.listing_urls.len().min(5)],
            "product_urls_count": self.product_urls.len(),
            "product_urls_sample": &self.product_urls[..self.product_urls.len().min(5)],
            "has_product_pages": self.has_product_pages,
            "estimated_total_pages": self.estimated_total_pages,
            "estimated_total_products": self.estimated_total_products,
            "pagination_type": self.pagination_type,
            "security_issues": issue_labels(&self.security_issues),
            "error_message": self.error_message,
            "page_title": self.page_title,
            "load_time_seconds": self.load_time_seconds,
        })
    }

    fn csv_header() -> &'static [&'static str] {
        SITE_COLUMNS
    }

    fn csv_rows(&self) -> Vec<Vec<String>> {
        let sample = |urls: &[String]| urls.iter().take(5).cloned().collect::<Vec<_>>().join(" | ");
        vec![vec![
            self.url.clone(),
            self.domain.clone(),
            self.is_ecommerce.to_string(),
            self.listing_urls.len().to_string(),
            sample(&self.listing_urls),
            self.product_urls.len().to_string(),
            sample(&self.product_urls),
            self.has_product_pages.to_string(),
            self.estimated_total_pages.to_string(),
            self.estimated_total_products.to_string(),
            self.pagination_type.to_string(),
            issue_labels(&self.security_issues).join(", "),
            self.error_message.clone().unwrap_or_default(),
            self.page_title.clone(),
            format!("{:.2}", self.load_time_seconds),
        ]]
    }
}

/// Catalogue discovery for online stores
pub struct SiteTask {
    hints: PatternHints,
    url_cap: usize,
}

impl SiteTask {
    pub fn new(hints: PatternHints, url_cap: usize) -> Self {
        Self { hints, url_cap }
    }
}

impl AnalysisTask for SiteTask {
    type Output = SiteAnalysis;

    fn kind(&self) -> &'static str {
        "site"
    }

    fn normalize(&self, raw: &str) -> Result<Target, ProbeError> {
        Target::normalize(raw, true)
    }

    fn prompt(&self, target: &Target) -> String {
        let cap = self.url_cap.to_string();
        let listing = hint_list(&self.hints.listing[..self.hints.listing.len().min(10)]);
        let product = hint_list(&self.hints.product[..self.hints.product.len().min(10)]);
        prompt::render(
            prompt::SITE_ANALYSIS,
            &[
                ("URL", target.url.as_str()),
                ("DOMAIN", target.site()),
                ("LISTING_PATTERNS", listing.as_str()),
                ("PRODUCT_PATTERNS", product.as_str()),
                ("URL_CAP", cap.as_str()),
            ],
        )
    }

    fn retry_prompt(&self, target: &Target, first: &SiteAnalysis) -> String {
        let issues = describe_failure(first);
        prompt::render(
            prompt::SITE_RETRY,
            &[
                ("URL", target.url.as_str()),
                ("DOMAIN", target.site()),
                ("ISSUES", issues.as_str()),
            ],
        )
    }

    fn parse(&self, target: &Target, answer: &Map<String, Value>) -> SiteAnalysis {
        let urls = |key: &str| {
            answer
                .get(key)
                .and_then(Value::as_array)
                .map(|list| target.filter_urls(list, self.url_cap))
                .unwrap_or_default()
        };
        let listing_urls = urls("listing_urls");
        let product_urls = urls("product_urls");
        let error = text_field(answer, "error");

        SiteAnalysis {
            url: target.url.to_string(),
            domain: target.domain.clone(),
            is_ecommerce: flag_field(answer, "is_ecommerce"),
            has_product_pages: !product_urls.is_empty() || flag_field(answer, "has_product_pages"),
            listing_urls,
            product_urls,
            estimated_total_pages: coerce_count(answer.get("estimated_total_pages")),
            estimated_total_products: coerce_count(answer.get("estimated_total_products")),
            pagination_type: answer
                .get("pagination_type")
                .and_then(Value::as_str)
                .map(PaginationType::from_label)
                .unwrap_or_default(),
            security_issues: SecurityIssue::from_values(answer.get("security_issues")),
            error_message: (!error.is_empty()).then_some(error),
            page_title: text_field(answer, "page_title"),
            load_time_seconds: 0.0,
        }
    }

    fn failure(&self, raw: &str, target: Option<&Target>, message: String) -> SiteAnalysis {
        let mut analysis = match target {
            Some(t) => SiteAnalysis::new(t.url.as_str(), t.domain.as_str()),
            None => SiteAnalysis::new(raw, raw),
        };
        analysis.error_message = Some(message);
        analysis
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::{HeuristicAnalyzer, PageAnalyzer};

    fn task() -> SiteTask {
        SiteTask::new(HeuristicAnalyzer::new().pattern_hints(), 10)
    }

    fn answer(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_parse_full_answer() {
        let task = task();
        let target = task.normalize("shop.com").unwrap();
        let analysis = task.parse(
            &target,
            &answer(json!({
                "is_ecommerce": true,
                "listing_urls": ["https://www.shop.com/collections/all", "https://www.shop.com/", "https://evil.com/c/1"],
                "product_urls": ["/products/runner-42"],
                "has_product_pages": false,
                "pagination_type": "numbered_pages",
                "estimated_total_products": "1,500",
                "estimated_total_pages": null,
                "security_issues": ["captcha", "none"],
                "page_title": "Shop",
                "error": null
            })),
        );

        assert_eq!(analysis.url, "https://www.shop.com/");
        assert_eq!(analysis.domain, "shop.com");
        assert!(analysis.is_ecommerce);
        assert_eq!(analysis.listing_urls, vec!["https://www.shop.com/collections/all"]);
        assert_eq!(analysis.product_urls, vec!["https://www.shop.com/products/runner-42"]);
        assert!(analysis.has_product_pages);
        assert_eq!(analysis.estimated_total_products, 1500);
        assert_eq!(analysis.estimated_total_pages, 0);
        assert_eq!(analysis.pagination_type, PaginationType::NumberedPages);
        assert_eq!(analysis.security_issues, vec![SecurityIssue::Captcha]);
        assert_eq!(analysis.error_message, None);
        assert_eq!(analysis.entry_count(), 2);
    }

    #[test]
    fn test_unknown_labels_degrade() {
        let task = task();
        let target = task.normalize("shop.com").unwrap();
        let analysis = task.parse(
            &target,
            &answer(json!({"pagination_type": "carousel", "listing_urls": "nope", "error": "blocked by WAF"})),
        );
        assert_eq!(analysis.pagination_type, PaginationType::Unknown);
        assert!(analysis.listing_urls.is_empty());
        assert_eq!(analysis.error_message.as_deref(), Some("blocked by WAF"));
    }

    #[test]
    fn test_prompts_name_the_target() {
        let task = task();
        let target = task.normalize("shop.com").unwrap();
        let first = task.prompt(&target);
        assert!(first.contains("https://www.shop.com/"));
        assert!(first.contains("/category/, /categories/"));

        let mut weak = task.failure("shop.com", Some(&target), "agent timed out".into());
        weak.security_issues = vec![SecurityIssue::Timeout];
        let retry = task.retry_prompt(&target, &weak);
        assert!(retry.contains("(timeout; agent timed out)"));
        assert!(retry.contains("https://shop.com/sitemap.xml"));
    }

    #[test]
    fn test_csv_row_matches_header() {
        let mut analysis = SiteAnalysis::new("https://www.shop.com/", "shop.com");
        analysis.listing_urls = (0..7).map(|n| format!("https://www.shop.com/c/{n}")).collect();
        analysis.set_elapsed(Duration::from_millis(1234));

        let rows = analysis.csv_rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].len(), SiteAnalysis::csv_header().len());
        assert_eq!(rows[0][3], "7");
        assert_eq!(rows[0][14], "1.23");

        let record = analysis.record();
        assert_eq!(record["listing_urls_sample"].as_array().unwrap().len(), 5);
        assert_eq!(record["pagination_type"], "unknown");
    }
}
