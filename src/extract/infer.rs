//! Dictionary-driven inference over free text.
//!
//! Fallback pass for numeric and categorical fields when no selector or
//! profile pattern matched. Operates on the combined title+description text
//! of a listing. Best-effort by construction: a miss leaves the field empty.

use super::RawListing;
use chrono::Datelike;
use regex::Regex;
use std::sync::OnceLock;

/// Model years below this are ignored as noise (part numbers, zip codes).
const MIN_MODEL_YEAR: i32 = 1990;

/// Fixed brand vocabulary. First token match wins, so multi-word makes are
/// listed before their prefixes would collide elsewhere.
const MAKES: &[&str] = &[
    "Alfa Romeo",
    "Aston Martin",
    "Land Rover",
    "Mercedes-Benz",
    "Acura",
    "Audi",
    "BMW",
    "Buick",
    "Cadillac",
    "Chevrolet",
    "Chevy",
    "Chrysler",
    "Dodge",
    "Fiat",
    "Ford",
    "Genesis",
    "GMC",
    "Honda",
    "Hyundai",
    "Infiniti",
    "Jaguar",
    "Jeep",
    "Kia",
    "Lexus",
    "Lincoln",
    "Mazda",
    "Mercedes",
    "Mini",
    "Mitsubishi",
    "Nissan",
    "Porsche",
    "Ram",
    "Rivian",
    "Subaru",
    "Tesla",
    "Toyota",
    "Volkswagen",
    "VW",
    "Volvo",
];

/// Fill every still-empty inferable field of `raw` from `text`.
pub fn fill_gaps(raw: &mut RawListing, text: &str) {
    if raw.year.is_empty() {
        raw.year = infer_year(text);
    }
    if raw.make.is_empty() {
        raw.make = infer_make(text);
    }
    if raw.model.is_empty() && !raw.make.is_empty() {
        raw.model = infer_model(text, &raw.make);
    }
    if raw.vin.is_empty() {
        raw.vin = infer_vin(text);
    }
    if raw.mileage.is_empty() {
        raw.mileage = infer_mileage(text);
    }
    if raw.condition.is_empty() {
        raw.condition = infer_keyword(
            text,
            &["like new", "excellent", "very good", "good", "fair", "salvage", "rebuilt"],
        );
    }
    if raw.transmission.is_empty() {
        raw.transmission = infer_keyword(text, &["automatic", "manual", "cvt", "tiptronic"]);
    }
    if raw.fuel_type.is_empty() {
        raw.fuel_type = infer_keyword(
            text,
            &["gasoline", "diesel", "hybrid", "electric", "flex fuel", "gas"],
        );
    }
    if raw.exterior_color.is_empty() {
        raw.exterior_color = infer_keyword(
            text,
            &[
                "black", "white", "silver", "gray", "grey", "red", "blue", "green", "brown",
                "beige", "gold", "orange", "yellow", "burgundy", "maroon",
            ],
        );
    }
}

/// Year = the maximum 4-digit token in `[1990, current_year + 1]`.
pub fn infer_year(text: &str) -> String {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"\b(19|20)\d{2}\b").unwrap());
    let max_year = current_year() + 1;
    re.find_iter(text)
        .filter_map(|m| m.as_str().parse::<i32>().ok())
        .filter(|y| (MIN_MODEL_YEAR..=max_year).contains(y))
        .max()
        .map(|y| y.to_string())
        .unwrap_or_default()
}

fn current_year() -> i32 {
    chrono::Utc::now().year()
}

/// Make = first matching token from the fixed brand vocabulary.
pub fn infer_make(text: &str) -> String {
    let lower = text.to_ascii_lowercase();
    let mut best: Option<(usize, &str)> = None;
    for make in MAKES {
        if let Some(pos) = find_word(&lower, &make.to_ascii_lowercase()) {
            match best {
                Some((bpos, _)) if bpos <= pos => {}
                _ => best = Some((pos, make)),
            }
        }
    }
    // Canonicalize common aliases
    match best.map(|(_, m)| m) {
        Some("Chevy") => "Chevrolet".to_string(),
        Some("VW") => "Volkswagen".to_string(),
        Some("Mercedes") => "Mercedes-Benz".to_string(),
        Some(m) => m.to_string(),
        None => String::new(),
    }
}

/// Model = the word immediately following the make token, when it is not
/// itself a year or mileage figure.
pub fn infer_model(text: &str, make: &str) -> String {
    let lower = text.to_ascii_lowercase();
    let needle = make.to_ascii_lowercase();
    let pos = match find_word(&lower, &needle) {
        Some(p) => p,
        None => return String::new(),
    };
    let rest = &text[pos + needle.len()..];
    rest.split_whitespace()
        .next()
        .filter(|w| !w.chars().all(|c| c.is_ascii_digit() || c == ','))
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_string())
        .filter(|w| !w.is_empty())
        .unwrap_or_default()
}

/// VIN = first 17-character token over the restricted VIN alphabet
/// (no I, O, Q). Result is uppercased.
pub fn infer_vin(text: &str) -> String {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"\b[A-HJ-NPR-Za-hj-npr-z0-9]{17}\b").unwrap()
    });
    re.find(text)
        .map(|m| m.as_str().to_ascii_uppercase())
        .unwrap_or_default()
}

/// Mileage = digits of the first "N miles/mi/km" figure.
pub fn infer_mileage(text: &str) -> String {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"(?i)\b([0-9][0-9,.]*)\s*k?\s*(?:miles|mi\b|km\b)").unwrap()
    });
    re.captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().chars().filter(|c| c.is_ascii_digit()).collect())
        .unwrap_or_default()
}

/// First keyword from `vocab` present in the text (word-boundary,
/// case-insensitive). Returned in the vocabulary's spelling.
fn infer_keyword(text: &str, vocab: &[&str]) -> String {
    let lower = text.to_ascii_lowercase();
    for word in vocab {
        if find_word(&lower, word).is_some() {
            return word.to_string();
        }
    }
    String::new()
}

/// Position of `needle` in `haystack` at word boundaries, if any.
fn find_word(haystack: &str, needle: &str) -> Option<usize> {
    let mut start = 0;
    while let Some(rel) = haystack[start..].find(needle) {
        let pos = start + rel;
        let before_ok = pos == 0
            || !haystack[..pos]
                .chars()
                .next_back()
                .is_some_and(|c| c.is_alphanumeric());
        let end = pos + needle.len();
        let after_ok = end >= haystack.len()
            || !haystack[end..].chars().next().is_some_and(|c| c.is_alphanumeric());
        if before_ok && after_ok {
            return Some(pos);
        }
        start = pos + needle.len();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_infer_year_max_in_range() {
        assert_eq!(infer_year("2019 Toyota Camry SE, 45,231 miles"), "2019");
        // Multiple years: the max in range wins
        assert_eq!(infer_year("1998 swap into 2004 chassis"), "2004");
        // Out-of-range tokens ignored
        assert_eq!(infer_year("part #1985-B from 1989"), "");
        assert_eq!(infer_year("zip 95125, built 2015"), "2015");
    }

    #[test]
    fn test_infer_make() {
        assert_eq!(infer_make("2019 Toyota Camry SE"), "Toyota");
        assert_eq!(infer_make("clean CHEVY silverado"), "Chevrolet");
        assert_eq!(infer_make("vw golf tdi"), "Volkswagen");
        assert_eq!(infer_make("no brand here"), "");
        // First token in the text wins when two makes appear
        assert_eq!(infer_make("Honda trade for Ford"), "Honda");
    }

    #[test]
    fn test_infer_make_word_boundary() {
        // "ram" inside another word must not match
        assert_eq!(infer_make("great program car"), "");
        assert_eq!(infer_make("Ram 1500 crew cab"), "Ram");
    }

    #[test]
    fn test_infer_model_follows_make() {
        assert_eq!(infer_model("2019 Toyota Camry SE", "Toyota"), "Camry");
        assert_eq!(infer_model("Ford F-150 XLT", "Ford"), "F-150");
        // Year after make is not a model
        assert_eq!(infer_model("Toyota 2019", "Toyota"), "");
    }

    #[test]
    fn test_infer_vin_alphabet() {
        let vin = infer_vin("VIN: 4t1b11hk5ku212345 listed");
        assert_eq!(vin, "4T1B11HK5KU212345");
        assert_eq!(vin.len(), 17);
        assert!(!vin.contains('I') && !vin.contains('O') && !vin.contains('Q'));
        // Tokens with I/O/Q are not VINs
        assert_eq!(infer_vin("IIIIIIIIIIIIIIIII"), "");
        // 16 characters is not a VIN
        assert_eq!(infer_vin("4T1B11HK5KU21234"), "");
    }

    #[test]
    fn test_infer_mileage() {
        assert_eq!(infer_mileage("2019 Toyota Camry SE, 45,231 miles"), "45231");
        assert_eq!(infer_mileage("odometer reads 88000 mi"), "88000");
        assert_eq!(infer_mileage("no figure given"), "");
    }

    #[test]
    fn test_fill_gaps_does_not_overwrite() {
        let mut raw = RawListing {
            title: "2019 Toyota Camry SE, 45,231 miles".to_string(),
            year: "2020".to_string(),
            ..Default::default()
        };
        let text = raw.title.clone();
        fill_gaps(&mut raw, &text);
        // Selector-provided year kept, gaps filled
        assert_eq!(raw.year, "2020");
        assert_eq!(raw.make, "Toyota");
        assert_eq!(raw.mileage, "45231");
    }

    #[test]
    fn test_infer_keywords() {
        let mut raw = RawListing::default();
        fill_gaps(
            &mut raw,
            "2012 Honda Fit, manual transmission, gas, silver exterior, good condition",
        );
        assert_eq!(raw.transmission, "manual");
        assert_eq!(raw.fuel_type, "gas");
        assert_eq!(raw.exterior_color, "silver");
        assert_eq!(raw.condition, "good");
    }
}
