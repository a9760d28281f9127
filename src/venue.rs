//! Venue event extraction

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::ProbeError;
use crate::extract::{coerce_count, text_field};
use crate::orchestrator::AnalysisTask;
use crate::prompt;
use crate::retry::{describe_failure, TargetResult};
use crate::sink::Exportable;
use crate::target::{SecurityIssue, Target};

const DESCRIPTION_LIMIT: usize = 200;

/// One event listed on a venue page
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventItem {
    pub event_name: String,
    pub date: String,
    pub time: String,
    pub venue: String,
    pub artist: String,
    pub price: String,
    pub ticket_url: String,
    pub event_url: String,
    pub image_url: String,
    pub category: String,
    pub description: String,
}

impl EventItem {
    /// Lenient field mapping; missing or null fields become empty
    pub fn from_answer(raw: &Map<String, Value>) -> Self {
        Self {
            event_name: text_field(raw, "event_name"),
            date: text_field(raw, "date"),
            time: text_field(raw, "time"),
            venue: text_field(raw, "venue"),
            artist: text_field(raw, "artist"),
            price: text_field(raw, "price"),
            ticket_url: text_field(raw, "ticket_url"),
            event_url: text_field(raw, "event_url"),
            image_url: text_field(raw, "image_url"),
            category: text_field(raw, "category"),
            description: text_field(raw, "description")
                .chars()
                .take(DESCRIPTION_LIMIT)
                .collect(),
        }
    }

    fn columns(&self) -> [&str; 11] {
        [
            self.event_name.as_str(),
            self.date.as_str(),
            self.time.as_str(),
            self.venue.as_str(),
            self.artist.as_str(),
            self.price.as_str(),
            self.ticket_url.as_str(),
            self.event_url.as_str(),
            self.image_url.as_str(),
            self.category.as_str(),
            self.description.as_str(),
        ]
    }
}

/// Events found for one venue
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VenueResult {
    pub venue_name: String,
    pub venue_url: String,
    pub events: Vec<EventItem>,
    pub total_events_found: u64,
    pub security_issues: Vec<SecurityIssue>,
    pub error_message: Option<String>,
    pub load_time_seconds: f64,
}

impl TargetResult for VenueResult {
    fn entry_count(&self) -> usize {
        self.events.len()
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

const EVENT_COLUMNS: &[&str] = &[
    "event_name",
    "date",
    "time",
    "venue",
    "artist",
    "price",
    "ticket_url",
    "event_url",
    "image_url",
    "category",
    "description",
    "venue_source",
    "venue_source_url",
];

impl Exportable for VenueResult {
    fn record(&self) -> Value {
        json!({
            "venue_name": self.venue_name,
            "venue_url": self.venue_url,
            "total_events_found": self.total_events_found,
            "events": self.events,
            "security_issues": self.security_issues,
            "error_message": self.error_message,
            "load_time_seconds": self.load_time_seconds,
        })
    }

    fn csv_header() -> &'static [&'static str] {
        EVENT_COLUMNS
    }

    /// One row per event; a venue without events contributes no rows
    fn csv_rows(&self) -> Vec<Vec<String>> {
        self.events
            .iter()
            .map(|event| {
                event
                    .columns()
                    .into_iter()
                    .chain([self.venue_name.as_str(), self.venue_url.as_str()])
                    .map(str::to_owned)
                    .collect()
            })
            .collect()
    }
}

/// Event listing extraction for venue pages
#[derive(Debug, Default)]
pub struct VenueTask;

impl AnalysisTask for VenueTask {
    type Output = VenueResult;

    fn kind(&self) -> &'static str {
        "venue"
    }

    fn normalize(&self, raw: &str) -> Result<Target, ProbeError> {
        Target::normalize(raw, false)
    }

    fn prompt(&self, target: &Target) -> String {
        prompt::render(prompt::VENUE_EVENTS, &[("URL", target.url.as_str())])
    }

    fn retry_prompt(&self, target: &Target, first: &VenueResult) -> String {
        let issues = describe_failure(first);
        prompt::render(
            prompt::VENUE_RETRY,
            &[
                ("URL", target.url.as_str()),
                ("DOMAIN", target.domain.as_str()),
                ("ISSUES", issues.as_str()),
            ],
        )
    }

    fn parse(&self, target: &Target, answer: &Map<String, Value>) -> VenueResult {
        let events: Vec<EventItem> = answer
            .get("events")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(Value::as_object)
            .map(EventItem::from_answer)
            .collect();
        let total = match coerce_count(answer.get("total_events_found")) {
            0 => events.len() as u64,
            n => n,
        };
        let name = text_field(answer, "venue_name");
        let error = text_field(answer, "error");

        VenueResult {
            venue_name: if name.is_empty() { target.domain.clone() } else { name },
            venue_url: target.url.to_string(),
            events,
            total_events_found: total,
            security_issues: SecurityIssue::from_values(answer.get("security_issues")),
            error_message: (!error.is_empty()).then_some(error),
            load_time_seconds: 0.0,
        }
    }

    fn failure(&self, raw: &str, target: Option<&Target>, message: String) -> VenueResult {
        VenueResult {
            venue_name: target.map_or_else(|| raw.to_owned(), |t| t.domain.clone()),
            venue_url: target.map_or_else(|| raw.to_owned(), |t| t.url.to_string()),
            error_message: Some(message),
            ..Default::default()
        }
    }
}
