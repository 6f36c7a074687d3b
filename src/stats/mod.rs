//! Statistics over readings and anomaly records.
//!
//! The aggregator reads one consistent snapshot from the store and folds it
//! into groups keyed by station, region prefix, day or month.

use crate::db::{AnomalyStatus, AnomalySummary, Reading, Snapshot, Station, Store};
use crate::error::CoreError;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

/// How much of an administrative code to keep when grouping by region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionLevel {
    Province,
    City,
    County,
    Full,
}

impl RegionLevel {
    /// Leading digits kept at this level, `None` for the whole code.
    pub fn digits(self) -> Option<usize> {
        match self {
            Self::Province => Some(2),
            Self::City => Some(4),
            Self::County => Some(6),
            Self::Full => None,
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "province" => Ok(Self::Province),
            "city" => Ok(Self::City),
            "county" => Ok(Self::County),
            "full" => Ok(Self::Full),
            other => Err(CoreError::invalid(format!(
                "unknown region_level: {} (expected province/city/county/full)",
                other
            ))),
        }
    }
}

/// Grouping dimension for a statistics query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupBy {
    Station,
    Region(RegionLevel),
    Day,
    Month,
}

impl GroupBy {
    /// Parse the `group_by` name; `region_level` only applies to `region`.
    pub fn parse(group_by: &str, region_level: Option<&str>) -> Result<Self, CoreError> {
        match group_by {
            "station" => Ok(Self::Station),
            "region" => {
                let level = match region_level {
                    Some(l) => RegionLevel::parse(l)?,
                    None => RegionLevel::Full,
                };
                Ok(Self::Region(level))
            }
            "day" => Ok(Self::Day),
            "month" => Ok(Self::Month),
            other => Err(CoreError::invalid(format!(
                "unknown group_by: {} (expected station/region/day/month)",
                other
            ))),
        }
    }

    fn key(self, reading: &Reading, station: &Station) -> String {
        match self {
            Self::Station => reading.station_code.clone(),
            Self::Region(level) => match level.digits() {
                Some(n) => station.admin_region_code.chars().take(n).collect(),
                None => station.admin_region_code.clone(),
            },
            // Fixed-width, so text order is chronological order.
            Self::Day => reading.timestamp.format("%Y-%m-%d").to_string(),
            Self::Month => reading.timestamp.format("%Y-%m").to_string(),
        }
    }
}

impl fmt::Display for GroupBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Station => f.write_str("station"),
            Self::Region(_) => f.write_str("region"),
            Self::Day => f.write_str("day"),
            Self::Month => f.write_str("month"),
        }
    }
}

/// A statistics request.
#[derive(Debug, Clone)]
pub struct StatisticsQuery {
    /// Keep only stations whose region code starts with this.
    pub region_code: Option<String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub group_by: GroupBy,
    /// Statuses to count; `None` counts all of them.
    pub include_status: Option<BTreeSet<AnomalyStatus>>,
    /// Use reviewer-corrected values in place of raw values.
    pub apply_corrections: bool,
}

/// Summary of one group.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupStats {
    pub key: String,
    pub reading_count: u64,
    pub anomaly_count: BTreeMap<AnomalyStatus, u64>,
    pub mean_value: Option<f64>,
    pub max_value: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatisticsResult {
    pub group_by: String,
    pub groups: Vec<GroupStats>,
    pub totals: GroupStats,
}

#[derive(Debug, Default)]
struct Accumulator {
    count: u64,
    sum: f64,
    max: Option<f64>,
    anomalies: BTreeMap<AnomalyStatus, u64>,
}

impl Accumulator {
    fn new(statuses: &BTreeSet<AnomalyStatus>) -> Self {
        Self {
            anomalies: statuses.iter().map(|s| (*s, 0)).collect(),
            ..Default::default()
        }
    }

    fn add_value(&mut self, v: f64) {
        self.count += 1;
        self.sum += v;
        self.max = Some(self.max.map_or(v, |m| m.max(v)));
    }

    fn merge(&mut self, other: &Accumulator) {
        self.count += other.count;
        self.sum += other.sum;
        if let Some(m) = other.max {
            self.max = Some(self.max.map_or(m, |cur| cur.max(m)));
        }
        for (status, n) in &other.anomalies {
            *self.anomalies.entry(*status).or_insert(0) += n;
        }
    }

    fn finish(self, key: String) -> GroupStats {
        GroupStats {
            key,
            reading_count: self.count,
            mean_value: (self.count > 0).then(|| self.sum / self.count as f64),
            max_value: self.max,
            anomaly_count: self.anomalies,
        }
    }
}

/// Fold a snapshot into grouped statistics.
///
/// Readings match when they fall inside `[start, end]`, belong to a
/// registered station, and that station's region code starts with
/// `region_code` (when given). Anomalies are joined to matched readings on
/// `(station_code, timestamp)`. Groups come out in ascending key order and
/// groups without readings are omitted.
pub fn aggregate(query: &StatisticsQuery, snapshot: &Snapshot) -> Result<StatisticsResult, CoreError> {
    if query.start > query.end {
        return Err(CoreError::invalid("time range start must not be after end"));
    }

    let statuses: BTreeSet<AnomalyStatus> = query
        .include_status
        .clone()
        .unwrap_or_else(|| AnomalyStatus::ALL.into_iter().collect());
    let prefix = query.region_code.as_deref().filter(|p| !p.is_empty());

    let stations: HashMap<&str, &Station> = snapshot
        .stations
        .iter()
        .map(|s| (s.code.as_str(), s))
        .collect();

    let corrections: HashMap<(&str, DateTime<Utc>), f64> = if query.apply_corrections {
        latest_corrections(snapshot)
    } else {
        HashMap::new()
    };

    let mut groups: BTreeMap<String, Accumulator> = BTreeMap::new();
    let mut matched: HashMap<(&str, DateTime<Utc>), String> = HashMap::new();

    for reading in &snapshot.readings {
        if reading.timestamp < query.start || reading.timestamp > query.end {
            continue;
        }
        let Some(station) = stations.get(reading.station_code.as_str()) else {
            continue;
        };
        if let Some(p) = prefix {
            if !station.admin_region_code.starts_with(p) {
                continue;
            }
        }

        let id = (reading.station_code.as_str(), reading.timestamp);
        let value = corrections.get(&id).copied().unwrap_or(reading.value);
        let key = query.group_by.key(reading, station);

        groups
            .entry(key.clone())
            .or_insert_with(|| Accumulator::new(&statuses))
            .add_value(value);
        matched.insert(id, key);
    }

    for anomaly in &snapshot.anomalies {
        if !statuses.contains(&anomaly.status) {
            continue;
        }
        let id = (anomaly.station_code.as_str(), anomaly.timestamp);
        if let Some(acc) = matched.get(&id).and_then(|key| groups.get_mut(key)) {
            *acc.anomalies.entry(anomaly.status).or_insert(0) += 1;
        }
    }

    let mut totals = Accumulator::new(&statuses);
    let groups: Vec<GroupStats> = groups
        .into_iter()
        .map(|(key, acc)| {
            totals.merge(&acc);
            acc.finish(key)
        })
        .collect();

    Ok(StatisticsResult {
        group_by: query.group_by.to_string(),
        groups,
        totals: totals.finish("total".to_string()),
    })
}

/// Corrected values keyed by reading; the most recent feedback wins.
fn latest_corrections(snapshot: &Snapshot) -> HashMap<(&str, DateTime<Utc>), f64> {
    let mut latest: HashMap<(&str, DateTime<Utc>), (DateTime<Utc>, f64)> = HashMap::new();
    for a in &snapshot.anomalies {
        let (Some(value), Some(fb)) = (a.corrected_value, a.feedback.as_ref()) else {
            continue;
        };
        if a.status != AnomalyStatus::Corrected {
            continue;
        }
        let slot = latest
            .entry((a.station_code.as_str(), a.timestamp))
            .or_insert((fb.at, value));
        if fb.at > slot.0 {
            *slot = (fb.at, value);
        }
    }
    latest.into_iter().map(|(k, (_, v))| (k, v)).collect()
}

/// Answers statistics queries against the store.
pub struct Aggregator {
    store: Arc<Store>,
}

impl Aggregator {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Run a grouped statistics query.
    pub fn statistics(&self, query: &StatisticsQuery) -> Result<StatisticsResult, CoreError> {
        if query.start > query.end {
            return Err(CoreError::invalid("time range start must not be after end"));
        }
        let snapshot = self.store.snapshot(query.start, query.end)?;
        let result = aggregate(query, &snapshot)?;
        tracing::debug!(
            "Statistics by {}: {} groups over {} readings",
            result.group_by,
            result.groups.len(),
            result.totals.reading_count
        );
        Ok(result)
    }

    /// Counts over currently open anomalies.
    pub fn summary(&self) -> Result<AnomalySummary, CoreError> {
        Ok(self.store.anomaly_summary()?)
    }
}
