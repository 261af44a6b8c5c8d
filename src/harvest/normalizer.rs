//! Maps raw search-result payloads onto [`PropertyRecord`].
//!
//! Listing shapes vary between the map-search endpoint and vendor dataset
//! exports, so every field is looked up through a list of candidate paths and
//! read only if the value has a usable type. Anything else becomes
//! [`Field::Unknown`].

use serde_json::Value;
use tracing::debug;

use crate::harvest::traits::{NormalizedPage, PageNormalizer};
use crate::model::{
    Coordinates, Details, Field, ListingInfo, Location, Payload, PropertyRecord, RawPage, UNKNOWN,
};
use crate::traits::NormalizeError;

/// Where listing arrays may live inside an object envelope.
const LISTING_PATHS: &[&[&str]] = &[
    &["cat1", "searchResults", "listResults"],
    &["searchResults", "listResults"],
];

const TOTAL_RESULTS_PATHS: &[&[&str]] = &[
    &["cat1", "searchList", "totalResultCount"],
    &["searchList", "totalResultCount"],
];

const HOME_INFO: &[&str] = &["hdpData", "homeInfo"];

#[derive(Debug, Clone, Copy, Default)]
pub struct RecordNormalizer;

impl RecordNormalizer {
    pub fn new() -> Self {
        Self
    }

    /// Normalizes a single listing object. `None` if it has no identifier.
    pub fn normalize_listing(&self, listing: &Value) -> Option<PropertyRecord> {
        let id = identifier(listing)?;
        let home = lookup(listing, HOME_INFO);
        let home_field = |key: &str| home.and_then(|h| h.get(key));

        let price = number(listing.get("unformattedPrice"))
            .or_else(|| number(listing.get("price")))
            .or_else(|| number(home_field("price")));

        let zestimate =
            number(listing.get("zestimate")).or_else(|| number(home_field("zestimate")));

        let address_obj = listing.get("address").filter(|v| v.is_object());
        let address_field = |key: &str| address_obj.and_then(|a| a.get(key));

        let location = Location {
            address: text(listing.get("address"))
                .or_else(|| text(address_field("streetAddress"))),
            city: text(listing.get("addressCity"))
                .or_else(|| text(address_field("city")))
                .or_else(|| text(home_field("city"))),
            state: text(listing.get("addressState"))
                .or_else(|| text(address_field("state")))
                .or_else(|| text(home_field("state"))),
            zip: text(listing.get("addressZipcode"))
                .or_else(|| text(address_field("zipcode")))
                .or_else(|| text(home_field("zipcode"))),
            coordinates: Coordinates {
                lat: number(lookup(listing, &["latLong", "latitude"]))
                    .or_else(|| number(listing.get("latitude")))
                    .or_else(|| number(home_field("latitude"))),
                lon: number(lookup(listing, &["latLong", "longitude"]))
                    .or_else(|| number(listing.get("longitude")))
                    .or_else(|| number(home_field("longitude"))),
            },
        };

        let details = Details {
            beds: whole(listing.get("beds"))
                .or_else(|| whole(listing.get("bedrooms")))
                .or_else(|| whole(home_field("bedrooms")))
                .into_known()
                .and_then(|n| u32::try_from(n).ok())
                .into(),
            baths: number(listing.get("baths"))
                .or_else(|| number(listing.get("bathrooms")))
                .or_else(|| number(home_field("bathrooms"))),
            area_sqft: number(listing.get("area"))
                .or_else(|| number(listing.get("livingArea")))
                .or_else(|| number(home_field("livingArea"))),
            lot_size: number(home_field("lotAreaValue"))
                .or_else(|| number(listing.get("lotAreaValue"))),
            lot_unit: text(home_field("lotAreaUnit"))
                .or_else(|| text(listing.get("lotAreaUnit"))),
            property_type: text(home_field("homeType"))
                .or_else(|| text(listing.get("homeType"))),
        };

        let listing_info = ListingInfo {
            status: text(listing.get("statusText"))
                .or_else(|| text(listing.get("homeStatus")))
                .or_else(|| text(home_field("homeStatus"))),
            days_listed: whole(home_field("daysOnZillow"))
                .or_else(|| whole(listing.get("daysOnZillow"))),
            broker: text(listing.get("brokerName")),
            url: text(listing.get("detailUrl")).or_else(|| text(listing.get("url"))),
        };

        Some(PropertyRecord {
            id,
            price,
            zestimate,
            location,
            details,
            listing: listing_info,
        })
    }
}

impl PageNormalizer for RecordNormalizer {
    fn normalize(&self, page: &RawPage) -> Result<NormalizedPage, NormalizeError> {
        let index = page.page();
        let malformed = |reason: String| NormalizeError::MalformedPage {
            page: index,
            reason,
        };

        let parsed;
        let root = match page.payload() {
            Payload::Json(value) => value,
            Payload::Bytes(bytes) => {
                parsed = serde_json::from_slice::<Value>(bytes)
                    .map_err(|e| malformed(format!("invalid JSON: {e}")))?;
                &parsed
            }
        };

        let (listings, total_results) = match root {
            Value::Array(items) => (items.as_slice(), None),
            Value::Object(_) => {
                let total = TOTAL_RESULTS_PATHS
                    .iter()
                    .find_map(|path| lookup(root, path).and_then(Value::as_u64));
                match LISTING_PATHS.iter().find_map(|path| lookup(root, path)) {
                    Some(Value::Array(items)) => (items.as_slice(), total),
                    Some(other) => {
                        return Err(malformed(format!(
                            "listing container is {}, expected an array",
                            json_kind(other)
                        )))
                    }
                    None => {
                        debug!(page = index, "Envelope has no listing container");
                        (&[] as &[Value], total)
                    }
                }
            }
            other => {
                return Err(malformed(format!(
                    "top-level value is {}, expected an object or array",
                    json_kind(other)
                )))
            }
        };

        let mut records = Vec::with_capacity(listings.len());
        let mut dropped = 0;
        for listing in listings {
            match self.normalize_listing(listing) {
                Some(record) => records.push(record),
                None => dropped += 1,
            }
        }

        if dropped > 0 {
            debug!(page = index, dropped, "Dropped listings without identifier");
        }

        Ok(NormalizedPage {
            page: index,
            records,
            dropped,
            total_results,
        })
    }

    fn name(&self) -> &'static str {
        "record_normalizer"
    }
}

// ============================================================================
// Capability-checked extraction
// ============================================================================

fn lookup<'a>(value: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter().try_fold(value, |current, key| current.get(key))
}

fn identifier(listing: &Value) -> Option<String> {
    let raw = listing.get("zpid").or_else(|| listing.get("id"))?;
    match raw {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Non-empty strings (numbers are stringified, e.g. numeric zip codes).
fn text(value: Option<&Value>) -> Field<String> {
    match value {
        Some(Value::String(s)) => {
            let s = s.trim();
            if s.is_empty() || s.eq_ignore_ascii_case(UNKNOWN) {
                Field::Unknown
            } else {
                Field::Known(s.to_string())
            }
        }
        Some(Value::Number(n)) => Field::Known(n.to_string()),
        _ => Field::Unknown,
    }
}

/// Numbers, or strings with display formatting (`"$1,250,000"`, `"$3,400/mo"`, `"$1.2M"`).
fn number(value: Option<&Value>) -> Field<f64> {
    match value {
        Some(Value::Number(n)) => n.as_f64().filter(|f| f.is_finite()).into(),
        Some(Value::String(s)) => parse_display_number(s).into(),
        _ => Field::Unknown,
    }
}

fn whole(value: Option<&Value>) -> Field<i64> {
    match value {
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| {
                n.as_f64()
                    .filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64)
                    .map(|f| f as i64)
            })
            .into(),
        Some(Value::String(s)) => s.trim().parse::<i64>().ok().into(),
        _ => Field::Unknown,
    }
}

fn parse_display_number(raw: &str) -> Option<f64> {
    let s = raw.trim().trim_start_matches('$').trim_start();
    let end = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == ','))
        .unwrap_or(s.len());
    let digits: String = s[..end].chars().filter(|c| *c != ',').collect();
    if digits.is_empty() {
        return None;
    }
    let value: f64 = digits.parse().ok()?;
    let multiplier = match s[end..].chars().next() {
        Some('K') | Some('k') => 1_000.0,
        Some('M') => 1_000_000.0,
        Some('B') => 1_000_000_000.0,
        _ => 1.0,
    };
    Some(value * multiplier).filter(|f| f.is_finite())
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

// ============================================================================
// Tests
// ============================================================================
