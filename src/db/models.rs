//! Database model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A longitude/latitude pair in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub longitude: f64,
    pub latitude: f64,
}

impl GeoPoint {
    /// Build a point from optional columns. Both must be present or both absent.
    pub fn from_parts(longitude: Option<f64>, latitude: Option<f64>) -> Result<Option<Self>, String> {
        match (longitude, latitude) {
            (None, None) => Ok(None),
            (Some(longitude), Some(latitude)) => {
                if !(-180.0..=180.0).contains(&longitude) {
                    return Err(format!("longitude {} out of range", longitude));
                }
                if !(-90.0..=90.0).contains(&latitude) {
                    return Err(format!("latitude {} out of range", latitude));
                }
                Ok(Some(Self { longitude, latitude }))
            }
            _ => Err("longitude and latitude must be given together".to_string()),
        }
    }
}

/// A rain-gauge station.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Station {
    pub code: String,
    pub name: String,
    pub river_name: Option<String>,
    /// Hierarchical administrative code, e.g. `659001` (province, city, county digits).
    pub admin_region_code: String,
    pub location: Option<GeoPoint>,
}

/// How a reading was captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadingSource {
    #[default]
    Sensor,
    Manual,
}

impl ReadingSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sensor => "sensor",
            Self::Manual => "manual",
        }
    }
}

impl FromStr for ReadingSource {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "sensor" => Ok(Self::Sensor),
            "manual" => Ok(Self::Manual),
            other => Err(format!("unknown reading source: {}", other)),
        }
    }
}

/// One rainfall observation in millimeters. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub station_code: String,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    #[serde(default)]
    pub source: ReadingSource,
}

/// Why a reading is suspect. New kinds get a new variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyType {
    OutOfRange,
    Spike,
    StaleRepeat,
    MissingGap,
}

impl AnomalyType {
    pub const ALL: [AnomalyType; 4] = [
        AnomalyType::OutOfRange,
        AnomalyType::Spike,
        AnomalyType::StaleRepeat,
        AnomalyType::MissingGap,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::OutOfRange => "out_of_range",
            Self::Spike => "spike",
            Self::StaleRepeat => "stale_repeat",
            Self::MissingGap => "missing_gap",
        }
    }
}

impl fmt::Display for AnomalyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AnomalyType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, String> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown anomaly type: {}", s))
    }
}

/// Lifecycle state of an anomaly record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnomalyStatus {
    Open,
    Confirmed,
    Rejected,
    Corrected,
}

impl AnomalyStatus {
    pub const ALL: [AnomalyStatus; 4] = [
        AnomalyStatus::Open,
        AnomalyStatus::Confirmed,
        AnomalyStatus::Rejected,
        AnomalyStatus::Corrected,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Confirmed => "confirmed",
            Self::Rejected => "rejected",
            Self::Corrected => "corrected",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Open)
    }
}

impl fmt::Display for AnomalyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AnomalyStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, String> {
        Self::ALL
            .into_iter()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| format!("unknown anomaly status: {}", s))
    }
}

/// Human feedback attached to a resolved record. Note and time travel together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feedback {
    pub note: String,
    pub at: DateTime<Utc>,
    pub reviewer: Option<String>,
}

/// One detected anomaly and its resolution state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyRecord {
    pub id: i64,
    pub station_code: String,
    pub timestamp: DateTime<Utc>,
    pub anomaly_type: AnomalyType,
    pub detail: String,
    pub detected_at: DateTime<Utc>,
    pub status: AnomalyStatus,
    pub feedback: Option<Feedback>,
    /// Only present when `status` is `corrected`.
    pub corrected_value: Option<f64>,
}

/// An anomaly joined with its station and the raw reading value.
#[derive(Debug, Clone, Serialize)]
pub struct AnomalyDetail {
    #[serde(flatten)]
    pub record: AnomalyRecord,
    pub station_name: String,
    pub admin_region_code: String,
    pub value: f64,
}

/// Result of recording one detection against the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "id", rename_all = "lowercase")]
pub enum UpsertOutcome {
    /// A new open record was created.
    Created(i64),
    /// An open record already existed; its `detected_at` was bumped.
    Refreshed(i64),
    /// The record is resolved; nothing changed.
    Unchanged(i64),
}

impl UpsertOutcome {
    pub fn id(self) -> i64 {
        match self {
            Self::Created(id) | Self::Refreshed(id) | Self::Unchanged(id) => id,
        }
    }
}

/// A distinct administrative region and how many stations sit in it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegionCount {
    pub admin_region_code: String,
    pub station_count: i64,
}

/// Filters for listing anomalies. All fields are optional.
#[derive(Debug, Clone, Default)]
pub struct AnomalyFilter {
    pub statuses: Vec<AnomalyStatus>,
    pub region_code: Option<String>,
    pub station_code: Option<String>,
    pub station_name: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}
