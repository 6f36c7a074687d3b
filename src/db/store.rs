//! SQLite database store implementation.

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Result as SqlResult, Row};
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

use super::models::*;

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("database connection lock poisoned")]
    Poisoned,
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0} already exists")]
    Duplicate(String),
}

/// Everything the aggregator needs for one time range, read under a single lock.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub stations: Vec<Station>,
    pub readings: Vec<Reading>,
    pub anomalies: Vec<AnomalyRecord>,
}

/// Counts over currently open anomalies.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct AnomalySummary {
    pub open_count: i64,
    pub station_count: i64,
    pub region_count: i64,
    pub latest_anomaly_time: Option<DateTime<Utc>>,
}

const ANOMALY_COLUMNS: &str = "a.id, a.station_code, a.time, a.anomaly_type, a.detail, a.detected_at, \
     a.status, a.feedback_note, a.feedback_at, a.reviewer, a.corrected_value";

/// Thread-safe database store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Create a new store with the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    /// Initialize the database with migrations.
    fn init(&self) -> Result<(), DbError> {
        let conn = self.conn()?;

        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(include_str!("../../migrations/000001_init.up.sql"))
            .map_err(|e| DbError::Migration(format!("Migration 1 failed: {}", e)))?;
        conn.execute_batch(include_str!("../../migrations/000002_anomalies.up.sql"))
            .map_err(|e| DbError::Migration(format!("Migration 2 failed: {}", e)))?;

        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, DbError> {
        self.conn.lock().map_err(|_| DbError::Poisoned)
    }

    /// Run a trivial query to prove the database answers.
    pub fn health_check(&self) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.query_row("SELECT 1", [], |r| r.get::<_, i64>(0))?;
        Ok(())
    }

    // --- Stations ---

    /// Register a station. Fails with `Duplicate` if the code is taken.
    pub fn add_station(&self, station: &Station) -> Result<(), DbError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "INSERT INTO stations (code, name, river_name, admin_region_code, longitude, latitude)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6) ON CONFLICT(code) DO NOTHING",
            params![
                station.code,
                station.name,
                station.river_name,
                station.admin_region_code,
                station.location.map(|p| p.longitude),
                station.location.map(|p| p.latitude),
            ],
        )?;
        if changed == 0 {
            return Err(DbError::Duplicate(format!("station {}", station.code)));
        }
        Ok(())
    }

    /// Get a station by code.
    pub fn get_station(&self, code: &str) -> Result<Station, DbError> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT code, name, river_name, admin_region_code, longitude, latitude FROM stations WHERE code = ?1",
            params![code],
            station_from_row,
        )
        .optional()?
        .ok_or_else(|| DbError::NotFound(format!("station {}", code)))
    }

    /// Get all stations, optionally restricted to a region code prefix.
    pub fn get_stations(&self, region_prefix: Option<&str>) -> Result<Vec<Station>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT code, name, river_name, admin_region_code, longitude, latitude FROM stations
             WHERE ?1 IS NULL OR substr(admin_region_code, 1, length(?1)) = ?1
             ORDER BY code ASC",
        )?;
        let stations = stmt
            .query_map(params![region_prefix], station_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(stations)
    }

    /// Distinct region codes with their station counts.
    pub fn get_regions(&self) -> Result<Vec<RegionCount>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT admin_region_code, COUNT(*) FROM stations
             GROUP BY admin_region_code ORDER BY admin_region_code ASC",
        )?;
        let regions = stmt
            .query_map([], |row| {
                Ok(RegionCount {
                    admin_region_code: row.get(0)?,
                    station_count: row.get(1)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(regions)
    }

    // --- Readings ---

    /// Store a reading. At most one reading exists per station and timestamp.
    pub fn add_reading(&self, reading: &Reading) -> Result<(), DbError> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;

        let known: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM stations WHERE code = ?1",
                params![reading.station_code],
                |r| r.get(0),
            )
            .optional()?;
        if known.is_none() {
            return Err(DbError::NotFound(format!("station {}", reading.station_code)));
        }

        let changed = tx.execute(
            "INSERT INTO readings (station_code, time, value, source) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(station_code, time) DO NOTHING",
            params![
                reading.station_code,
                fmt_db_time(reading.timestamp),
                reading.value,
                reading.source.as_str(),
            ],
        )?;
        if changed == 0 {
            return Err(DbError::Duplicate(format!(
                "reading for {} at {}",
                reading.station_code, reading.timestamp
            )));
        }

        tx.commit()?;
        Ok(())
    }

    /// Get one reading by its natural key.
    pub fn get_reading(&self, station_code: &str, timestamp: DateTime<Utc>) -> Result<Option<Reading>, DbError> {
        let conn = self.conn()?;
        let reading = conn
            .query_row(
                "SELECT station_code, time, value, source FROM readings WHERE station_code = ?1 AND time = ?2",
                params![station_code, fmt_db_time(timestamp)],
                reading_from_row,
            )
            .optional()?;
        Ok(reading)
    }

    /// Get readings for a station within `[start, end]`, oldest first.
    pub fn get_readings(
        &self,
        station_code: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Reading>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT station_code, time, value, source FROM readings
             WHERE station_code = ?1 AND time >= ?2 AND time <= ?3 ORDER BY time ASC",
        )?;
        let readings = stmt
            .query_map(
                params![station_code, fmt_db_time(start), fmt_db_time(end)],
                reading_from_row,
            )?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(readings)
    }

    /// Get up to `window` readings strictly before `before`, oldest first.
    pub fn get_history(
        &self,
        station_code: &str,
        before: DateTime<Utc>,
        window: usize,
    ) -> Result<Vec<Reading>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT station_code, time, value, source FROM readings
             WHERE station_code = ?1 AND time < ?2 ORDER BY time DESC LIMIT ?3",
        )?;
        let mut readings = stmt
            .query_map(
                params![station_code, fmt_db_time(before), window as i64],
                reading_from_row,
            )?
            .collect::<SqlResult<Vec<_>>>()?;
        readings.reverse();
        Ok(readings)
    }

    // --- Anomalies ---

    /// Look up the record for a reading and anomaly type, if any.
    pub fn find_anomaly(
        &self,
        station_code: &str,
        timestamp: DateTime<Utc>,
        anomaly_type: AnomalyType,
    ) -> Result<Option<AnomalyRecord>, DbError> {
        let conn = self.conn()?;
        let record = conn
            .query_row(
                &format!(
                    "SELECT {} FROM anomalies a WHERE a.station_code = ?1 AND a.time = ?2 AND a.anomaly_type = ?3",
                    ANOMALY_COLUMNS
                ),
                params![station_code, fmt_db_time(timestamp), anomaly_type.as_str()],
                anomaly_from_row,
            )
            .optional()?;
        Ok(record)
    }

    /// Get an anomaly record by id.
    pub fn get_anomaly(&self, id: i64) -> Result<AnomalyRecord, DbError> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {} FROM anomalies a WHERE a.id = ?1", ANOMALY_COLUMNS),
            params![id],
            anomaly_from_row,
        )
        .optional()?
        .ok_or_else(|| DbError::NotFound(format!("anomaly {}", id)))
    }

    /// Create the record for `(station, timestamp, type)` if absent; otherwise
    /// refresh `detected_at` when still open. Runs as one transaction so two
    /// concurrent detections of the same reading yield a single record.
    pub fn upsert_anomaly(
        &self,
        station_code: &str,
        timestamp: DateTime<Utc>,
        anomaly_type: AnomalyType,
        detail: &str,
        detected_at: DateTime<Utc>,
    ) -> Result<UpsertOutcome, DbError> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        let time = fmt_db_time(timestamp);

        let existing: Option<(i64, String)> = tx
            .query_row(
                "SELECT id, status FROM anomalies WHERE station_code = ?1 AND time = ?2 AND anomaly_type = ?3",
                params![station_code, time, anomaly_type.as_str()],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;

        let outcome = match existing {
            None => {
                let has_reading: Option<i64> = tx
                    .query_row(
                        "SELECT 1 FROM readings WHERE station_code = ?1 AND time = ?2",
                        params![station_code, time],
                        |r| r.get(0),
                    )
                    .optional()?;
                if has_reading.is_none() {
                    return Err(DbError::NotFound(format!(
                        "reading for {} at {}",
                        station_code, timestamp
                    )));
                }
                tx.execute(
                    "INSERT INTO anomalies (station_code, time, anomaly_type, detail, detected_at, status)
                     VALUES (?1, ?2, ?3, ?4, ?5, 'open')",
                    params![station_code, time, anomaly_type.as_str(), detail, fmt_db_time(detected_at)],
                )?;
                UpsertOutcome::Created(tx.last_insert_rowid())
            }
            Some((id, status)) if status == AnomalyStatus::Open.as_str() => {
                tx.execute(
                    "UPDATE anomalies SET detected_at = ?1, detail = ?2 WHERE id = ?3",
                    params![fmt_db_time(detected_at), detail, id],
                )?;
                UpsertOutcome::Refreshed(id)
            }
            Some((id, _)) => UpsertOutcome::Unchanged(id),
        };

        tx.commit()?;
        Ok(outcome)
    }

    /// Move an open record to a resolved status. Compare-and-set on `open`:
    /// returns `false` when the record is no longer open (or does not exist).
    pub fn resolve_anomaly(
        &self,
        id: i64,
        status: AnomalyStatus,
        feedback: &Feedback,
        corrected_value: Option<f64>,
    ) -> Result<bool, DbError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE anomalies SET status = ?1, feedback_note = ?2, feedback_at = ?3, reviewer = ?4, corrected_value = ?5
             WHERE id = ?6 AND status = 'open'",
            params![
                status.as_str(),
                feedback.note,
                fmt_db_time(feedback.at),
                feedback.reviewer,
                corrected_value,
                id,
            ],
        )?;
        Ok(changed == 1)
    }

    /// List anomalies joined with station and reading, newest first.
    pub fn list_anomalies(&self, filter: &AnomalyFilter) -> Result<Vec<AnomalyDetail>, DbError> {
        let mut sql = format!(
            "SELECT {}, s.name, s.admin_region_code, r.value FROM anomalies a
             JOIN stations s ON s.code = a.station_code
             JOIN readings r ON r.station_code = a.station_code AND r.time = a.time
             WHERE 1=1",
            ANOMALY_COLUMNS
        );
        let mut args: Vec<Value> = Vec::new();

        if !filter.statuses.is_empty() {
            let marks = vec!["?"; filter.statuses.len()].join(", ");
            sql.push_str(&format!(" AND a.status IN ({})", marks));
            args.extend(filter.statuses.iter().map(|s| Value::Text(s.as_str().to_string())));
        }
        if let Some(prefix) = &filter.region_code {
            sql.push_str(" AND substr(s.admin_region_code, 1, length(?)) = ?");
            args.push(Value::Text(prefix.clone()));
            args.push(Value::Text(prefix.clone()));
        }
        if let Some(code) = &filter.station_code {
            sql.push_str(" AND a.station_code = ?");
            args.push(Value::Text(code.clone()));
        }
        if let Some(name) = &filter.station_name {
            sql.push_str(" AND instr(s.name, ?) > 0");
            args.push(Value::Text(name.clone()));
        }
        if let Some(start) = filter.start {
            sql.push_str(" AND a.time >= ?");
            args.push(Value::Text(fmt_db_time(start)));
        }
        if let Some(end) = filter.end {
            sql.push_str(" AND a.time <= ?");
            args.push(Value::Text(fmt_db_time(end)));
        }
        sql.push_str(" ORDER BY a.time DESC, a.station_code ASC, a.anomaly_type ASC");

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(args), |row| {
                Ok(AnomalyDetail {
                    record: anomaly_from_row(row)?,
                    station_name: row.get(11)?,
                    admin_region_code: row.get(12)?,
                    value: row.get(13)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(rows)
    }

    /// Counts over open anomalies plus the latest anomalous reading time.
    pub fn anomaly_summary(&self) -> Result<AnomalySummary, DbError> {
        let conn = self.conn()?;
        let (open_count, station_count, region_count): (i64, i64, i64) = conn.query_row(
            "SELECT COUNT(*), COUNT(DISTINCT a.station_code), COUNT(DISTINCT s.admin_region_code)
             FROM anomalies a JOIN stations s ON s.code = a.station_code
             WHERE a.status = 'open'",
            [],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )?;
        let latest: Option<String> = conn.query_row("SELECT MAX(time) FROM anomalies", [], |r| r.get(0))?;

        Ok(AnomalySummary {
            open_count,
            station_count,
            region_count,
            latest_anomaly_time: latest.and_then(|s| parse_db_time(&s)),
        })
    }

    /// Read stations, readings in `[start, end]` and their anomalies in one transaction.
    pub fn snapshot(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Snapshot, DbError> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        let (from, to) = (fmt_db_time(start), fmt_db_time(end));

        let stations = {
            let mut stmt = tx.prepare(
                "SELECT code, name, river_name, admin_region_code, longitude, latitude FROM stations",
            )?;
            let rows = stmt.query_map([], station_from_row)?.collect::<SqlResult<Vec<_>>>()?;
            rows
        };
        let readings = {
            let mut stmt = tx.prepare(
                "SELECT station_code, time, value, source FROM readings
                 WHERE time >= ?1 AND time <= ?2 ORDER BY station_code ASC, time ASC",
            )?;
            let rows = stmt
                .query_map(params![from, to], reading_from_row)?
                .collect::<SqlResult<Vec<_>>>()?;
            rows
        };
        let anomalies = {
            let mut stmt = tx.prepare(&format!(
                "SELECT {} FROM anomalies a WHERE a.time >= ?1 AND a.time <= ?2 ORDER BY a.id ASC",
                ANOMALY_COLUMNS
            ))?;
            let rows = stmt
                .query_map(params![from, to], anomaly_from_row)?
                .collect::<SqlResult<Vec<_>>>()?;
            rows
        };

        tx.commit()?;
        Ok(Snapshot {
            stations,
            readings,
            anomalies,
        })
    }
}

fn station_from_row(row: &Row<'_>) -> SqlResult<Station> {
    let longitude: Option<f64> = row.get(4)?;
    let latitude: Option<f64> = row.get(5)?;
    let location = GeoPoint::from_parts(longitude, latitude)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(4, Type::Real, e.into()))?;
    Ok(Station {
        code: row.get(0)?,
        name: row.get(1)?,
        river_name: row.get(2)?,
        admin_region_code: row.get(3)?,
        location,
    })
}

fn reading_from_row(row: &Row<'_>) -> SqlResult<Reading> {
    Ok(Reading {
        station_code: row.get(0)?,
        timestamp: time_at(row, 1)?,
        value: row.get(2)?,
        source: enum_at(row, 3)?,
    })
}

fn anomaly_from_row(row: &Row<'_>) -> SqlResult<AnomalyRecord> {
    let note: Option<String> = row.get(7)?;
    let feedback = match note {
        Some(note) => Some(Feedback {
            note,
            at: time_at(row, 8)?,
            reviewer: row.get(9)?,
        }),
        None => None,
    };
    Ok(AnomalyRecord {
        id: row.get(0)?,
        station_code: row.get(1)?,
        timestamp: time_at(row, 2)?,
        anomaly_type: enum_at(row, 3)?,
        detail: row.get(4)?,
        detected_at: time_at(row, 5)?,
        status: enum_at(row, 6)?,
        feedback,
        corrected_value: row.get(10)?,
    })
}

fn time_at(row: &Row<'_>, idx: usize) -> SqlResult<DateTime<Utc>> {
    let s: String = row.get(idx)?;
    parse_db_time(&s).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, format!("bad timestamp: {}", s).into())
    })
}

fn enum_at<T: FromStr<Err = String>>(row: &Row<'_>, idx: usize) -> SqlResult<T> {
    let s: String = row.get(idx)?;
    s.parse()
        .map_err(|e: String| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
}

/// Format a datetime for storage. Fixed-width so text order is time order.
fn fmt_db_time(dt: DateTime<Utc>) -> String {
    dt.format("%Y-%m-%d %H:%M:%S%.9f").to_string()
}

/// Parse a datetime string from the database.
fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = [
        "%Y-%m-%d %H:%M:%S%.9f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
    ];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.with_timezone(&Utc))
}
