//! Prompt templates
//!
//! One canonical first-pass prompt and one narrower retry prompt per task.
//! Placeholders are `{{NAME}}`; the JSON examples inside use single braces.

/// Site analysis, first attempt
pub const SITE_ANALYSIS: &str = r#"You are a web research agent. Study the online store at {{URL}} and report how its catalogue is organised. Work through the steps below in order.

Tools: prefer web_fetch. Fall back to the browser tool only when web_fetch returns nothing usable. Never retry the same tool on the same URL.

Step 1, load the site:
- web_fetch https://www.{{DOMAIN}} first; the www host avoids most regional redirects.
- If that fails or shows a country picker, web_fetch https://{{DOMAIN}}.

Step 2, get past obstacles:
- Country picker: choose the United States storefront.
- Cookie banner: accept it if you are in the browser.
- Captcha, Cloudflare or "access denied": do not hammer the page. Try https://{{DOMAIN}}/sitemap.xml, then https://{{DOMAIN}}/robots.txt, then /shop, /products or /collections. Give up after three blocked fetches.

Step 3, go one level deeper: open at least one category page linked from the navigation and collect links from it as well as from the homepage.

Step 4, collect:
- listing_urls: category or collection pages, shaped like {{LISTING_PATTERNS}}. Never the bare homepage, sitemap.xml or robots.txt.
- product_urls: product detail pages, shaped like {{PRODUCT_PATTERNS}}.
- pagination_type: one of "next_page_link", "infinite_scroll", "load_more_button", "numbered_pages", "none".
- estimated_total_products: from text such as "1,234 products" or "Showing 1-24 of 480".
- estimated_total_pages: from "Page 1 of 20" or the highest page number shown.
- security_issues: any of "cloudflare", "captcha", "bot_protection", "blocked"; empty if none.
- page_title: the main page's <title>.

Step 5, answer with exactly one JSON object and nothing else. Use 0 for unknown numbers, never null:

{
  "is_ecommerce": true,
  "listing_urls": ["https://www.example.com/collections/shoes"],
  "product_urls": ["https://www.example.com/products/runner-42"],
  "has_product_pages": true,
  "pagination_type": "numbered_pages",
  "estimated_total_products": 480,
  "estimated_total_pages": 20,
  "security_issues": [],
  "page_title": "Example Store",
  "error": null
}

Return at most {{URL_CAP}} listing URLs and {{URL_CAP}} product URLs, all real links you saw. If you were blocked, still return the object with security_issues filled in and empty URL lists."#;

/// Site analysis, second attempt after a weak first pass
pub const SITE_RETRY: &str = r#"The previous attempt on {{URL}} did not get usable data ({{ISSUES}}).

Use web_fetch only; the browser tool is not working for this site. Try these in order and stop at the first that returns useful content:
1. https://{{DOMAIN}}/sitemap.xml (look for product and category URLs)
2. https://www.{{DOMAIN}}/shop
3. https://www.{{DOMAIN}}/products
4. https://www.{{DOMAIN}}/collections
5. https://{{DOMAIN}}/robots.txt (Sitemap: lines and Disallow: paths reveal the URL layout)

Stop after three blocked fetches. Answer with the same JSON object as before, 0 for unknown numbers:

{
  "is_ecommerce": true,
  "listing_urls": [],
  "product_urls": [],
  "has_product_pages": false,
  "pagination_type": "none",
  "estimated_total_products": 0,
  "estimated_total_pages": 0,
  "security_issues": [],
  "page_title": "",
  "error": null
}"#;

/// Venue event extraction, first attempt
pub const VENUE_EVENTS: &str = r#"You are a web research agent. List every upcoming event published on the venue page {{URL}}.

Tools: prefer web_fetch. Use the browser tool only when web_fetch returns nothing usable or the listing is rendered by JavaScript. Never retry the same tool on the same URL.

If the page itself has no events, follow links such as /events, /calendar, /shows or /schedule.

For each event record:
- event_name
- date (YYYY-MM-DD when possible, otherwise as printed)
- time (start, doors or show time as printed)
- venue
- artist (when different from the event name)
- price ("$25", "$15-$45", "Free")
- ticket_url
- event_url
- image_url
- category (Concert, Comedy, Theater, Sports, Festival, ...)
- description (at most 200 characters)

Answer with exactly one JSON object and nothing else. Use "" for missing fields, never null:

{
  "venue_name": "Example Hall",
  "events": [
    {
      "event_name": "Band Live",
      "date": "2026-03-15",
      "time": "8:00 PM",
      "venue": "Example Hall",
      "artist": "Band",
      "price": "$25-$45",
      "ticket_url": "https://tickets.example.com/e/123",
      "event_url": "https://example.com/events/band-live",
      "image_url": "https://example.com/img/band.jpg",
      "category": "Concert",
      "description": "An evening with Band"
    }
  ],
  "total_events_found": 1,
  "security_issues": [],
  "error": null
}

Extract all visible events, not a sample. If the page paginates, report the overall total in total_events_found. If you were blocked, return the object with error and security_issues filled in and an empty events list."#;

/// Venue event extraction, second attempt
pub const VENUE_RETRY: &str = r#"The previous attempt on {{URL}} found no events ({{ISSUES}}).

Use web_fetch only. Try, in order, stopping at the first page that lists events:
1. {{URL}}
2. https://{{DOMAIN}}/events
3. https://{{DOMAIN}}/calendar
4. https://{{DOMAIN}}/shows

Stop after three blocked fetches. Answer with the same JSON object as before, "" for missing fields."#;

/// Replace every `{{NAME}}` in `template` with its value
pub fn render(template: &str, vars: &[(&str, &str)]) -> String {
    vars.iter().fold(template.to_owned(), |text, (name, value)| {
        text.replace(&format!("{{{{{name}}}}}"), value)
    })
}

/// Comma-separated hint list, `none` when empty
pub fn hint_list<S: AsRef<str>>(items: &[S]) -> String {
    if items.is_empty() {
        return "none".to_owned();
    }
    items
        .iter()
        .map(AsRef::as_ref)
        .collect::<Vec<_>>()
        .join(", ")
}
