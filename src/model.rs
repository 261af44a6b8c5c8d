use chrono::{DateTime, Utc};
use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

use crate::traits::PlanError;

/// Serialized form of [`Field::Unknown`].
pub const UNKNOWN: &str = "unknown";

// ============================================================================
// Search input
// ============================================================================

/// Geographic bounding box of a search.
///
/// Always satisfies `west < east` and `south < north`; the only way to build
/// one (including deserialization) goes through [`SearchRegion::new`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RegionBounds")]
pub struct SearchRegion {
    west: f64,
    east: f64,
    south: f64,
    north: f64,
}

#[derive(Deserialize)]
struct RegionBounds {
    west: f64,
    east: f64,
    south: f64,
    north: f64,
}

impl TryFrom<RegionBounds> for SearchRegion {
    type Error = PlanError;

    fn try_from(b: RegionBounds) -> Result<Self, Self::Error> {
        SearchRegion::new(b.west, b.east, b.south, b.north)
    }
}

impl SearchRegion {
    /// Validates and builds a region. NaN bounds are rejected as well.
    pub fn new(west: f64, east: f64, south: f64, north: f64) -> Result<Self, PlanError> {
        // Written as negated `<` so NaN fails too
        if !(west < east) || !(south < north) {
            return Err(PlanError::InvalidRegion {
                west,
                east,
                south,
                north,
            });
        }
        Ok(Self {
            west,
            east,
            south,
            north,
        })
    }

    pub fn west(&self) -> f64 {
        self.west
    }

    pub fn east(&self) -> f64 {
        self.east
    }

    pub fn south(&self) -> f64 {
        self.south
    }

    pub fn north(&self) -> f64 {
        self.north
    }
}

/// One page of a search. Only the planner creates these.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PageRequest {
    region: SearchRegion,
    page: usize,
}

impl PageRequest {
    pub(crate) fn new(region: SearchRegion, page: usize) -> Self {
        Self { region, page }
    }

    pub fn region(&self) -> &SearchRegion {
        &self.region
    }

    /// 0-based page index.
    pub fn page(&self) -> usize {
        self.page
    }
}

// ============================================================================
// Fetched payloads
// ============================================================================

/// Opaque page body as returned by a fetcher.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Raw response body, not yet parsed
    Bytes(Vec<u8>),
    /// Already-structured data (e.g. produced by an adapter or a test double)
    Json(serde_json::Value),
}

/// A fetched page, tagged with the request it answers.
#[derive(Debug, Clone)]
pub struct RawPage {
    request: PageRequest,
    payload: Payload,
    fetched_at: DateTime<Utc>,
}

impl RawPage {
    pub fn new(request: PageRequest, payload: Payload) -> Self {
        Self {
            request,
            payload,
            fetched_at: Utc::now(),
        }
    }

    pub fn request(&self) -> &PageRequest {
        &self.request
    }

    pub fn page(&self) -> usize {
        self.request.page
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn fetched_at(&self) -> DateTime<Utc> {
        self.fetched_at
    }
}

// ============================================================================
// Canonical records
// ============================================================================

/// A record attribute that may be missing from the source.
///
/// `Unknown` serializes as the string `"unknown"`; `Known(v)` serializes as `v`.
/// On input, `null` and `"unknown"` both read back as `Unknown`.
#[derive(Debug, Clone, PartialEq)]
pub enum Field<T> {
    Known(T),
    Unknown,
}

impl<T> Default for Field<T> {
    fn default() -> Self {
        Field::Unknown
    }
}

impl<T> Field<T> {
    pub fn is_known(&self) -> bool {
        matches!(self, Field::Known(_))
    }

    pub fn as_known(&self) -> Option<&T> {
        match self {
            Field::Known(v) => Some(v),
            Field::Unknown => None,
        }
    }

    pub fn into_known(self) -> Option<T> {
        match self {
            Field::Known(v) => Some(v),
            Field::Unknown => None,
        }
    }

    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> Field<U> {
        match self {
            Field::Known(v) => Field::Known(f(v)),
            Field::Unknown => Field::Unknown,
        }
    }

    /// Keeps `self` if known, otherwise evaluates `other`.
    pub fn or_else<F: FnOnce() -> Field<T>>(self, other: F) -> Field<T> {
        match self {
            Field::Known(v) => Field::Known(v),
            Field::Unknown => other(),
        }
    }
}

impl<T> From<Option<T>> for Field<T> {
    fn from(value: Option<T>) -> Self {
        value.map_or(Field::Unknown, Field::Known)
    }
}

impl<T: Serialize> Serialize for Field<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Field::Known(v) => v.serialize(serializer),
            Field::Unknown => serializer.serialize_str(UNKNOWN),
        }
    }
}

/// Matches only the literal sentinel string.
struct UnknownMarker;

impl<'de> Deserialize<'de> for UnknownMarker {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        if s == UNKNOWN {
            Ok(UnknownMarker)
        } else {
            Err(de::Error::custom("expected the \"unknown\" sentinel"))
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum FieldRepr<T> {
    Sentinel(UnknownMarker),
    Value(Option<T>),
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Field<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(match FieldRepr::<T>::deserialize(deserializer)? {
            FieldRepr::Sentinel(_) | FieldRepr::Value(None) => Field::Unknown,
            FieldRepr::Value(Some(v)) => Field::Known(v),
        })
    }
}

/// Canonical real-estate listing.
///
/// `id` is the deduplication key and is always present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyRecord {
    pub id: String,
    #[serde(default)]
    pub price: Field<f64>,
    #[serde(default)]
    pub zestimate: Field<f64>,
    #[serde(default)]
    pub location: Location,
    #[serde(default)]
    pub details: Details,
    #[serde(default)]
    pub listing: ListingInfo,
}

impl PropertyRecord {
    /// A record with only the identifier set.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            price: Field::Unknown,
            zestimate: Field::Unknown,
            location: Location::default(),
            details: Details::default(),
            listing: ListingInfo::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Location {
    pub address: Field<String>,
    pub city: Field<String>,
    pub state: Field<String>,
    pub zip: Field<String>,
    pub coordinates: Coordinates,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Coordinates {
    pub lat: Field<f64>,
    pub lon: Field<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Details {
    pub beds: Field<u32>,
    pub baths: Field<f64>,
    pub area_sqft: Field<f64>,
    pub lot_size: Field<f64>,
    /// Unit of `lot_size` as reported by the source (e.g. "sqft", "acres")
    pub lot_unit: Field<String>,
    pub property_type: Field<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListingInfo {
    pub status: Field<String>,
    pub days_listed: Field<i64>,
    pub broker: Field<String>,
    pub url: Field<String>,
}

// ============================================================================
// Harvest output
// ============================================================================

/// Two records in a collection shared an identifier.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Duplicate record identifier: {0}")]
pub struct DuplicateIdentifier(pub String);

/// Ordered, identifier-unique collection of records.
///
/// Serializes as a plain JSON array; deserializing an array that repeats an
/// identifier fails with [`DuplicateIdentifier`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<PropertyRecord>", into = "Vec<PropertyRecord>")]
pub struct HarvestResult {
    records: Vec<PropertyRecord>,
}

impl HarvestResult {
    /// Caller guarantees identifier uniqueness.
    pub(crate) fn from_unique(records: Vec<PropertyRecord>) -> Self {
        Self { records }
    }

    pub fn records(&self) -> &[PropertyRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.records.iter().map(|r| r.id.as_str())
    }

    pub fn get(&self, id: &str) -> Option<&PropertyRecord> {
        self.records.iter().find(|r| r.id == id)
    }

    pub fn into_records(self) -> Vec<PropertyRecord> {
        self.records
    }
}

impl TryFrom<Vec<PropertyRecord>> for HarvestResult {
    type Error = DuplicateIdentifier;

    fn try_from(records: Vec<PropertyRecord>) -> Result<Self, Self::Error> {
        let mut seen = HashSet::with_capacity(records.len());
        for record in &records {
            if !seen.insert(record.id.as_str()) {
                return Err(DuplicateIdentifier(record.id.clone()));
            }
        }
        Ok(Self { records })
    }
}

impl From<HarvestResult> for Vec<PropertyRecord> {
    fn from(result: HarvestResult) -> Self {
        result.records
    }
}

impl IntoIterator for HarvestResult {
    type Item = PropertyRecord;
    type IntoIter = std::vec::IntoIter<PropertyRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.into_iter()
    }
}

impl<'a> IntoIterator for &'a HarvestResult {
    type Item = &'a PropertyRecord;
    type IntoIter = std::slice::Iter<'a, PropertyRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

// ============================================================================
// Tests
// ============================================================================
