//! Field extraction engine.
//!
//! Given a page's DOM snapshot and a [`SiteProfile`], produces zero or more
//! raw listing records. For each logical field the profile's ordered
//! candidate chain is walked; the first candidate yielding non-empty content
//! wins. Numeric and categorical fields additionally fall back to a
//! dictionary-driven inference pass over the combined title+description text
//! (see [`infer`]).
//!
//! Extraction never errors: a field with no match stays empty, and the
//! engine always returns a (possibly empty) record. The DOM is only read.

pub mod infer;
pub mod normalize;

use crate::config::MAX_IMAGES;
use crate::profiles::{FieldCandidate, SiteProfile};
use chrono::{DateTime, Utc};
use regex::RegexBuilder;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};

/// Logical fields the engine tries to resolve from profile candidates.
/// `images` is handled separately because it unions candidates instead of
/// stopping at the first hit.
const SCALAR_FIELDS: &[&str] = &[
    "title",
    "price",
    "year",
    "make",
    "model",
    "mileage",
    "vin",
    "condition",
    "transmission",
    "fuel_type",
    "exterior_color",
    "interior_color",
    "location",
    "seller_info",
    "description",
];

/// One scraped record before normalization. Empty string means "not found".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawListing {
    pub title: String,
    pub price: String,
    pub year: String,
    pub make: String,
    pub model: String,
    pub mileage: String,
    pub vin: String,
    pub condition: String,
    pub transmission: String,
    pub fuel_type: String,
    pub exterior_color: String,
    pub interior_color: String,
    pub location: String,
    pub seller_info: String,
    pub description: String,
    pub images: Vec<String>,
}

impl RawListing {
    fn field_mut(&mut self, name: &str) -> &mut String {
        match name {
            "title" => &mut self.title,
            "price" => &mut self.price,
            "year" => &mut self.year,
            "make" => &mut self.make,
            "model" => &mut self.model,
            "mileage" => &mut self.mileage,
            "vin" => &mut self.vin,
            "condition" => &mut self.condition,
            "transmission" => &mut self.transmission,
            "fuel_type" => &mut self.fuel_type,
            "exterior_color" => &mut self.exterior_color,
            "interior_color" => &mut self.interior_color,
            "location" => &mut self.location,
            "seller_info" => &mut self.seller_info,
            "description" => &mut self.description,
            other => unreachable!("unknown logical field {other}"),
        }
    }
}

/// A finalized, validated listing. Write-once: created by the normalizer and
/// consumed by the upload collaborator, never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VehicleListing {
    pub title: String,
    /// Normalized decimal string, currency-stripped (e.g. "24999").
    pub price: String,
    pub year: String,
    pub make: String,
    pub model: String,
    /// Digits only.
    pub mileage: String,
    /// 17-character VIN or empty.
    pub vin: String,
    pub condition: String,
    pub transmission: String,
    pub fuel_type: String,
    pub exterior_color: String,
    pub interior_color: String,
    /// Ordered, deduplicated, at most [`MAX_IMAGES`] URLs.
    pub images: Vec<String>,
    pub location: String,
    pub seller_info: String,
    pub source_url: String,
    pub source_site: String,
    pub extracted_at: DateTime<Utc>,
}

/// Extract a single listing from a detail page.
pub fn extract_one(html: &str, url: &str, profile: &SiteProfile) -> RawListing {
    let document = Html::parse_document(html);
    extract_from_element(document.root_element(), url, profile)
}

/// Bulk scan of a search/listing page.
///
/// Walks the profile's container selectors in order and extracts one record
/// per matched container from the first selector that matches anything.
/// Returns an empty vector when no container matches.
pub fn extract_many(html: &str, url: &str, profile: &SiteProfile) -> Vec<RawListing> {
    let document = Html::parse_document(html);
    for raw_sel in &profile.listing_container_selectors {
        let sel = match Selector::parse(raw_sel) {
            Ok(s) => s,
            Err(_) => continue,
        };
        let containers: Vec<ElementRef<'_>> = document.select(&sel).collect();
        if containers.is_empty() {
            continue;
        }
        return containers
            .into_iter()
            .map(|el| extract_from_element(el, url, profile))
            .collect();
    }
    Vec::new()
}

/// Run the full per-record pipeline against one DOM scope (whole document or
/// a single listing container).
fn extract_from_element(scope: ElementRef<'_>, url: &str, profile: &SiteProfile) -> RawListing {
    let mut raw = RawListing::default();
    let scope_text = visible_text(scope);

    for field in SCALAR_FIELDS {
        let value = resolve_field(scope, &scope_text, profile.candidates(field));
        if !value.is_empty() {
            *raw.field_mut(field) = value;
        }
    }

    raw.images = extract_images(scope, url, profile.candidates("images"));

    // Dictionary inference over title + description fills what selectors
    // missed. Never overwrites a selector hit.
    let combined = format!("{} {}", raw.title, raw.description);
    infer::fill_gaps(&mut raw, &combined);

    raw
}

/// Walk a candidate chain and return the first non-empty match.
fn resolve_field(scope: ElementRef<'_>, scope_text: &str, candidates: &[FieldCandidate]) -> String {
    for candidate in candidates {
        let value = match candidate {
            FieldCandidate::Css { css } => first_text(scope, css),
            FieldCandidate::Attr { css, attr } => first_attr(scope, css, attr),
            FieldCandidate::Pattern { pattern } => match_pattern(scope_text, pattern),
        };
        let value = value.trim().to_string();
        if !value.is_empty() {
            return value;
        }
    }
    String::new()
}

fn first_text(scope: ElementRef<'_>, raw_sel: &str) -> String {
    let sel = match Selector::parse(raw_sel) {
        Ok(s) => s,
        Err(_) => return String::new(),
    };
    scope
        .select(&sel)
        .next()
        .map(visible_text)
        .unwrap_or_default()
}

fn first_attr(scope: ElementRef<'_>, raw_sel: &str, attr: &str) -> String {
    let sel = match Selector::parse(raw_sel) {
        Ok(s) => s,
        Err(_) => return String::new(),
    };
    scope
        .select(&sel)
        .next()
        .and_then(|el| el.value().attr(attr))
        .unwrap_or("")
        .to_string()
}

/// Apply a profile regex to aggregated visible text. Capture group 1 is used
/// when present, the whole match otherwise. Invalid patterns match nothing.
fn match_pattern(text: &str, pattern: &str) -> String {
    let re = match RegexBuilder::new(pattern).case_insensitive(true).build() {
        Ok(r) => r,
        Err(_) => return String::new(),
    };
    match re.captures(text) {
        Some(caps) => caps
            .get(1)
            .or_else(|| caps.get(0))
            .map(|m| m.as_str().to_string())
            .unwrap_or_default(),
        None => String::new(),
    }
}

/// Whitespace-collapsed visible text of an element subtree.
///
/// Script, style, and template subtrees are skipped — inline JSON blobs
/// would otherwise feed pattern candidates text no human ever sees.
fn visible_text(el: ElementRef<'_>) -> String {
    let mut parts: Vec<&str> = Vec::new();
    collect_visible_text(el, &mut parts);
    parts
        .join(" ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn collect_visible_text<'a>(el: ElementRef<'a>, out: &mut Vec<&'a str>) {
    if matches!(el.value().name(), "script" | "style" | "noscript" | "template") {
        return;
    }
    for child in el.children() {
        match child.value() {
            scraper::Node::Text(text) => out.push(&**text),
            scraper::Node::Element(_) => {
                if let Some(child_el) = ElementRef::wrap(child) {
                    collect_visible_text(child_el, out);
                }
            }
            _ => {}
        }
    }
}

/// Union image URLs from every image candidate, resolve relative URLs
/// against the page URL, filter to plausible content-delivery hosts,
/// deduplicate in order, cap at [`MAX_IMAGES`].
fn extract_images(scope: ElementRef<'_>, page_url: &str, candidates: &[FieldCandidate]) -> Vec<String> {
    let base = url::Url::parse(page_url).ok();
    let page_host = base
        .as_ref()
        .and_then(|u| u.host_str().map(|h| h.to_string()));

    let mut out: Vec<String> = Vec::new();
    for candidate in candidates {
        let (raw_sel, attr) = match candidate {
            FieldCandidate::Attr { css, attr } => (css.as_str(), attr.as_str()),
            FieldCandidate::Css { css } => (css.as_str(), "src"),
            FieldCandidate::Pattern { .. } => continue,
        };
        let sel = match Selector::parse(raw_sel) {
            Ok(s) => s,
            Err(_) => continue,
        };
        for el in scope.select(&sel) {
            let href = el.value().attr(attr).unwrap_or("").trim();
            if href.is_empty() || href.starts_with("data:") {
                continue;
            }
            let resolved = match &base {
                Some(b) => match b.join(href) {
                    Ok(u) => u.to_string(),
                    Err(_) => continue,
                },
                None => href.to_string(),
            };
            if !is_content_host(&resolved, page_host.as_deref()) {
                continue;
            }
            if out.iter().any(|u| u == &resolved) {
                continue;
            }
            out.push(resolved);
            if out.len() >= MAX_IMAGES {
                return out;
            }
        }
    }
    out
}

/// Accept same-origin URLs and hosts that look like image CDNs.
fn is_content_host(url: &str, page_host: Option<&str>) -> bool {
    const CDN_HINTS: &[&str] = &[
        "cdn", "img", "image", "photo", "media", "scontent", "cloudfront", "akamai",
        "fastly", "static",
    ];
    let parsed = match url::Url::parse(url) {
        Ok(u) => u,
        Err(_) => return false,
    };
    let host = match parsed.host_str() {
        Some(h) => h,
        None => return false,
    };
    if let Some(ph) = page_host {
        let strip = |h: &str| h.trim_start_matches("www.").to_string();
        if strip(host) == strip(ph) || strip(host).ends_with(&format!(".{}", strip(ph))) {
            return true;
        }
    }
    CDN_HINTS.iter().any(|hint| host.contains(hint))
}
