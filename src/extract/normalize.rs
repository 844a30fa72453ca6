//! Data normalizer and validator.
//!
//! Turns a [`RawListing`] into a finalized [`VehicleListing`] or rejects it.
//! The policy is delete-falsy-then-require: fields are cleaned, empty fields
//! are dropped as sparse (not zero-valued), and the record survives only if
//! `title` and `price` are still non-empty afterwards. Emptiness is the only
//! validity signal — range checks beyond the extraction-time regex filters
//! are deliberately absent.

use super::{RawListing, VehicleListing};
use crate::config::MAX_IMAGES;
use chrono::Utc;

/// Diagnostic counters for a normalization run. Rejections are silent in the
/// output but counted here.
#[derive(Debug, Clone, Default)]
pub struct NormalizeStats {
    pub accepted: usize,
    pub rejected_missing_title: usize,
    pub rejected_missing_price: usize,
}

impl NormalizeStats {
    pub fn rejected(&self) -> usize {
        self.rejected_missing_title + self.rejected_missing_price
    }
}

/// Normalize one raw record. `None` means the record was rejected.
pub fn normalize(
    raw: RawListing,
    source_url: &str,
    source_site: &str,
    stats: &mut NormalizeStats,
) -> Option<VehicleListing> {
    let title = raw.title.trim().to_string();
    let price = clean_price(&raw.price);
    let mileage = clean_mileage(&raw.mileage);

    if title.is_empty() {
        stats.rejected_missing_title += 1;
        tracing::debug!(site = source_site, "dropping record with no title");
        return None;
    }
    if price.is_empty() {
        stats.rejected_missing_price += 1;
        tracing::debug!(site = source_site, title, "dropping record with no price");
        return None;
    }

    let mut images = Vec::with_capacity(raw.images.len().min(MAX_IMAGES));
    for url in raw.images {
        let url = url.trim().to_string();
        if url.is_empty() || images.contains(&url) {
            continue;
        }
        images.push(url);
        if images.len() >= MAX_IMAGES {
            break;
        }
    }

    stats.accepted += 1;
    Some(VehicleListing {
        title,
        price,
        year: raw.year.trim().to_string(),
        make: raw.make.trim().to_string(),
        model: raw.model.trim().to_string(),
        mileage,
        vin: raw.vin.trim().to_string(),
        condition: raw.condition.trim().to_string(),
        transmission: raw.transmission.trim().to_string(),
        fuel_type: raw.fuel_type.trim().to_string(),
        exterior_color: raw.exterior_color.trim().to_string(),
        interior_color: raw.interior_color.trim().to_string(),
        images,
        location: raw.location.trim().to_string(),
        seller_info: raw.seller_info.trim().to_string(),
        source_url: source_url.to_string(),
        source_site: source_site.to_string(),
        extracted_at: Utc::now(),
    })
}

/// Normalize a batch, keeping survivors in input order.
pub fn normalize_batch(
    raws: Vec<RawListing>,
    source_url: &str,
    source_site: &str,
) -> (Vec<VehicleListing>, NormalizeStats) {
    let mut stats = NormalizeStats::default();
    let listings = raws
        .into_iter()
        .filter_map(|raw| normalize(raw, source_url, source_site, &mut stats))
        .collect();
    (listings, stats)
}

/// Strip currency symbols and separators from a price string.
///
/// Idempotent: cleaning an already-clean price yields the same string.
/// A whole-dollar amount loses its ".00" suffix; real cents are kept.
pub fn clean_price(price: &str) -> String {
    let mut cleaned: String = price
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    // Keep only the first decimal point
    if let Some(first_dot) = cleaned.find('.') {
        let (head, tail) = cleaned.split_at(first_dot + 1);
        cleaned = format!("{head}{}", tail.replace('.', ""));
    }
    for suffix in [".00", ".0", "."] {
        if let Some(stripped) = cleaned.strip_suffix(suffix) {
            cleaned = stripped.to_string();
            break;
        }
    }
    // All-zero or empty numerics are not a price
    if cleaned.chars().all(|c| c == '0' || c == '.') {
        return String::new();
    }
    cleaned
}

/// Strip everything but digits from a mileage string.
pub fn clean_mileage(mileage: &str) -> String {
    mileage.chars().filter(|c| c.is_ascii_digit()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(title: &str, price: &str) -> RawListing {
        RawListing {
            title: title.to_string(),
            price: price.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_clean_price() {
        assert_eq!(clean_price("$24,999"), "24999");
        assert_eq!(clean_price("$24,999.00"), "24999");
        assert_eq!(clean_price("$1,250.50"), "1250.50");
        assert_eq!(clean_price("Price: 9 500 €"), "9500");
        assert_eq!(clean_price(""), "");
        assert_eq!(clean_price("$0"), "");
        assert_eq!(clean_price("call for price"), "");
    }

    #[test]
    fn test_clean_price_idempotent() {
        for input in ["$24,999", "1250.50", "9500"] {
            let once = clean_price(input);
            assert_eq!(clean_price(&once), once, "not idempotent for {input}");
        }
    }

    #[test]
    fn test_clean_mileage() {
        assert_eq!(clean_mileage("45,231 miles"), "45231");
        assert_eq!(clean_mileage("45231"), "45231");
        assert_eq!(clean_mileage("n/a"), "");
    }

    #[test]
    fn test_reject_missing_title_or_price() {
        let mut stats = NormalizeStats::default();
        assert!(normalize(raw("", "$5000"), "u", "s", &mut stats).is_none());
        assert!(normalize(raw("Car", ""), "u", "s", &mut stats).is_none());
        assert!(normalize(raw("Car", "free"), "u", "s", &mut stats).is_none());
        assert!(normalize(raw("  ", "$5000"), "u", "s", &mut stats).is_none());
        assert_eq!(stats.rejected(), 4);
        assert_eq!(stats.accepted, 0);
    }

    #[test]
    fn test_accept_minimal_record() {
        let mut stats = NormalizeStats::default();
        let listing = normalize(
            raw("Nice sedan", "$7,000"),
            "https://dealer.example.com/1",
            "generic",
            &mut stats,
        )
        .expect("title+price is enough");
        assert_eq!(listing.title, "Nice sedan");
        assert_eq!(listing.price, "7000");
        assert!(listing.year.is_empty());
        assert!(listing.images.is_empty());
        assert_eq!(stats.accepted, 1);
    }

    #[test]
    fn test_image_cap_and_dedupe() {
        let mut r = raw("Car", "$1,000");
        for i in 0..12 {
            r.images.push(format!("https://cdn.example.com/{i}.jpg"));
            r.images.push(format!("https://cdn.example.com/{i}.jpg"));
        }
        let mut stats = NormalizeStats::default();
        let listing = normalize(r, "u", "s", &mut stats).unwrap();
        assert_eq!(listing.images.len(), MAX_IMAGES);
        let mut unique = listing.images.clone();
        unique.dedup();
        assert_eq!(unique.len(), listing.images.len());
        // Order preserved
        assert_eq!(listing.images[0], "https://cdn.example.com/0.jpg");
    }

    #[test]
    fn test_normalize_batch_counts() {
        let raws = vec![
            raw("A", "$1"),
            raw("", "$2"),
            raw("C", ""),
            raw("D", "$4,000"),
        ];
        let (listings, stats) = normalize_batch(raws, "u", "s");
        assert_eq!(listings.len(), 2);
        assert_eq!(stats.accepted, 2);
        assert_eq!(stats.rejected_missing_title, 1);
        assert_eq!(stats.rejected_missing_price, 1);
        assert_eq!(listings[1].price, "4000");
    }
}
