//! Anomaly ledger: record identity, deduplication and the feedback state machine.

use super::classifier::{classify, Detection};
use crate::config::ClassifierConfig;
use crate::db::{
    AnomalyDetail, AnomalyFilter, AnomalyRecord, AnomalyStatus, AnomalyType, Feedback, Reading,
    Store, UpsertOutcome,
};
use crate::error::CoreError;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// A reviewer's verdict on an anomaly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Confirm,
    Reject,
}

/// Feedback payload for one anomaly record.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FeedbackSubmission {
    pub decision: Option<Decision>,
    #[serde(default)]
    pub corrected_value: Option<f64>,
    #[serde(default)]
    pub note: Option<String>,
    #[serde(default)]
    pub reviewer: Option<String>,
}

/// A detection together with what the ledger did with it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordedDetection {
    pub anomaly_type: AnomalyType,
    pub detail: String,
    #[serde(flatten)]
    pub outcome: UpsertOutcome,
}

/// Result of ingesting or reclassifying one reading.
#[derive(Debug, Clone, Serialize)]
pub struct IngestReport {
    pub reading: Reading,
    pub detections: Vec<RecordedDetection>,
}

/// The feedback transition table.
///
/// ```text
/// open --reject-------------------> rejected
/// open --confirm------------------> confirmed
/// open --confirm + corrected------> corrected
/// ```
///
/// Every other combination is refused: resolved records never move again.
pub fn next_status(
    record: &AnomalyRecord,
    decision: Decision,
    corrected_value: Option<f64>,
) -> Result<AnomalyStatus, CoreError> {
    if record.status.is_terminal() {
        return Err(CoreError::InvalidTransition {
            id: record.id,
            status: record.status,
        });
    }
    match (decision, corrected_value) {
        (Decision::Reject, None) => Ok(AnomalyStatus::Rejected),
        (Decision::Reject, Some(_)) => Err(CoreError::invalid(
            "corrected_value must be absent when rejecting",
        )),
        (Decision::Confirm, None) => Ok(AnomalyStatus::Confirmed),
        (Decision::Confirm, Some(_)) => Ok(AnomalyStatus::Corrected),
    }
}

/// Check a corrected value against the original reading.
pub fn validate_correction(original: f64, corrected: f64) -> Result<(), CoreError> {
    if !corrected.is_finite() {
        return Err(CoreError::invalid("corrected_value must be a finite number"));
    }
    if corrected < 0.0 {
        return Err(CoreError::invalid(format!(
            "corrected_value {} must not be negative",
            corrected
        )));
    }
    if corrected == original {
        return Err(CoreError::invalid(format!(
            "corrected_value {} equals the original reading",
            corrected
        )));
    }
    Ok(())
}

/// Owns anomaly records: creation from classifier output and feedback resolution.
pub struct Ledger {
    store: Arc<Store>,
    classifier: ClassifierConfig,
    history_window: usize,
}

impl Ledger {
    pub fn new(store: Arc<Store>, classifier: ClassifierConfig, history_window: usize) -> Self {
        Self {
            store,
            classifier,
            history_window,
        }
    }

    /// Store a new reading, classify it against its history and record detections.
    pub fn ingest(&self, reading: Reading) -> Result<IngestReport, CoreError> {
        if !reading.value.is_finite() {
            return Err(CoreError::invalid("reading value must be a finite number"));
        }
        if reading.station_code.trim().is_empty() {
            return Err(CoreError::invalid("station_code is required"));
        }

        self.store.add_reading(&reading)?;
        let (code, timestamp) = (reading.station_code.clone(), reading.timestamp);
        self.classify_stored(reading).map_err(|e| {
            tracing::warn!(
                "Reading {} at {} stored but not classified ({}); retry via POST /api/readings/reclassify",
                code,
                timestamp,
                e
            );
            e
        })
    }

    /// Run classification again on an already stored reading.
    pub fn reclassify(&self, station_code: &str, timestamp: DateTime<Utc>) -> Result<IngestReport, CoreError> {
        let reading = self.store.get_reading(station_code, timestamp)?.ok_or_else(|| {
            CoreError::NotFound(format!("reading for {} at {}", station_code, timestamp))
        })?;
        self.classify_stored(reading)
    }

    fn classify_stored(&self, reading: Reading) -> Result<IngestReport, CoreError> {
        let history = self
            .store
            .get_history(&reading.station_code, reading.timestamp, self.history_window)?;
        let found = classify(&reading, &history, &self.classifier);

        tracing::debug!(
            "Classified {} at {}: {} detection(s) over {} prior readings",
            reading.station_code,
            reading.timestamp,
            found.len(),
            history.len()
        );

        let detections = self.record_detections(&reading, found, Utc::now())?;
        Ok(IngestReport { reading, detections })
    }

    /// Create or refresh one record per detection.
    pub fn record_detections(
        &self,
        reading: &Reading,
        detections: Vec<Detection>,
        detected_at: DateTime<Utc>,
    ) -> Result<Vec<RecordedDetection>, CoreError> {
        let mut recorded = Vec::with_capacity(detections.len());
        for d in detections {
            let outcome = self.store.upsert_anomaly(
                &reading.station_code,
                reading.timestamp,
                d.anomaly_type,
                &d.detail,
                detected_at,
            )?;
            if let UpsertOutcome::Created(id) = outcome {
                tracing::info!(
                    "Anomaly {} opened: {} at {} ({})",
                    id,
                    reading.station_code,
                    reading.timestamp,
                    d.anomaly_type
                );
            }
            recorded.push(RecordedDetection {
                anomaly_type: d.anomaly_type,
                detail: d.detail,
                outcome,
            });
        }
        Ok(recorded)
    }

    /// Resolve an open anomaly with a reviewer's decision.
    pub fn submit_feedback(&self, id: i64, submission: FeedbackSubmission) -> Result<AnomalyRecord, CoreError> {
        let decision = submission
            .decision
            .ok_or_else(|| CoreError::invalid("decision is required"))?;

        let record = self.store.get_anomaly(id)?;
        let status = next_status(&record, decision, submission.corrected_value)?;

        if let Some(corrected) = submission.corrected_value {
            let original = self
                .store
                .get_reading(&record.station_code, record.timestamp)?
                .ok_or_else(|| {
                    CoreError::NotFound(format!(
                        "reading for {} at {}",
                        record.station_code, record.timestamp
                    ))
                })?;
            validate_correction(original.value, corrected)?;
        }

        let feedback = Feedback {
            note: submission.note.unwrap_or_default(),
            at: Utc::now(),
            reviewer: submission.reviewer.filter(|r| !r.trim().is_empty()),
        };

        if !self
            .store
            .resolve_anomaly(id, status, &feedback, submission.corrected_value)?
        {
            // Lost a race against another submission.
            let current = self.store.get_anomaly(id)?;
            tracing::warn!("Feedback on anomaly {} refused: already {}", id, current.status);
            return Err(CoreError::InvalidTransition {
                id,
                status: current.status,
            });
        }

        tracing::info!("Anomaly {} resolved as {}", id, status);
        Ok(self.store.get_anomaly(id)?)
    }

    /// Get one anomaly record.
    pub fn get(&self, id: i64) -> Result<AnomalyRecord, CoreError> {
        Ok(self.store.get_anomaly(id)?)
    }

    /// Look up the record for one reading and anomaly type.
    pub fn find(
        &self,
        station_code: &str,
        timestamp: DateTime<Utc>,
        anomaly_type: AnomalyType,
    ) -> Result<AnomalyRecord, CoreError> {
        self.store
            .find_anomaly(station_code, timestamp, anomaly_type)?
            .ok_or_else(|| {
                CoreError::NotFound(format!(
                    "{} anomaly for {} at {}",
                    anomaly_type, station_code, timestamp
                ))
            })
    }

    /// List anomalies, newest first. With `latest_per_station`, keep only the
    /// records at each station's most recent anomalous timestamp.
    pub fn list(&self, filter: &AnomalyFilter, latest_per_station: bool) -> Result<Vec<AnomalyDetail>, CoreError> {
        if let (Some(start), Some(end)) = (filter.start, filter.end) {
            if start > end {
                return Err(CoreError::invalid("start must not be after end"));
            }
        }
        let rows = self.store.list_anomalies(filter)?;
        Ok(if latest_per_station {
            latest_only(rows)
        } else {
            rows
        })
    }
}

fn latest_only(rows: Vec<AnomalyDetail>) -> Vec<AnomalyDetail> {
    let mut latest: HashMap<String, DateTime<Utc>> = HashMap::new();
    for row in &rows {
        let ts = latest
            .entry(row.record.station_code.clone())
            .or_insert(row.record.timestamp);
        if row.record.timestamp > *ts {
            *ts = row.record.timestamp;
        }
    }
    rows.into_iter()
        .filter(|row| latest.get(&row.record.station_code) == Some(&row.record.timestamp))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{GeoPoint, ReadingSource, Station};
    use chrono::{Duration, TimeZone};
    use tempfile::NamedTempFile;

    fn t(minute: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 7, 1, 0, 0, 0).unwrap() + Duration::minutes(minute)
    }

    fn reading(code: &str, minute: i64, value: f64) -> Reading {
        Reading {
            station_code: code.to_string(),
            timestamp: t(minute),
            value,
            source: ReadingSource::Sensor,
        }
    }

    fn setup() -> (NamedTempFile, Arc<Store>, Ledger) {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        for (code, region) in [("ST001", "661101"), ("ST002", "661102")] {
            store
                .add_station(&Station {
                    code: code.to_string(),
                    name: format!("Gauge {}", code),
                    river_name: Some("Tarim".to_string()),
                    admin_region_code: region.to_string(),
                    location: Some(GeoPoint { longitude: 81.0, latitude: 40.5 }),
                })
                .unwrap();
        }
        let cfg = ClassifierConfig {
            sampling_interval_secs: 60,
            gap_tolerance_secs: 30,
            ..Default::default()
        };
        let ledger = Ledger::new(store.clone(), cfg, 24);
        (tmp, store, ledger)
    }

    fn open_anomaly(ledger: &Ledger, code: &str, minute: i64, value: f64) -> i64 {
        let report = ledger.ingest(reading(code, minute, value)).unwrap();
        report.detections[0].outcome.id()
    }

    fn confirm() -> FeedbackSubmission {
        FeedbackSubmission {
            decision: Some(Decision::Confirm),
            ..Default::default()
        }
    }

    fn reject() -> FeedbackSubmission {
        FeedbackSubmission {
            decision: Some(Decision::Reject),
            ..Default::default()
        }
    }

    #[test]
    fn test_ingest_detects_and_records() {
        let (_tmp, store, ledger) = setup();
        for (i, v) in [2.0, 3.0, 2.0, 3.0].iter().enumerate() {
            let report = ledger.ingest(reading("ST001", i as i64, *v)).unwrap();
            assert!(report.detections.is_empty());
        }
        let report = ledger.ingest(reading("ST001", 4, 50.0)).unwrap();
        assert_eq!(report.detections.len(), 1);
        assert_eq!(report.detections[0].anomaly_type, AnomalyType::Spike);
        assert!(matches!(report.detections[0].outcome, UpsertOutcome::Created(_)));

        let record = store.find_anomaly("ST001", t(4), AnomalyType::Spike).unwrap().unwrap();
        assert_eq!(record.status, AnomalyStatus::Open);
        assert!(record.feedback.is_none());
    }

    #[test]
    fn test_ingest_rejects_duplicates_and_unknown_stations() {
        let (_tmp, _store, ledger) = setup();
        ledger.ingest(reading("ST001", 0, 1.0)).unwrap();
        assert!(matches!(ledger.ingest(reading("ST001", 0, 2.0)), Err(CoreError::Conflict(_))));
        assert!(matches!(ledger.ingest(reading("ST999", 0, 2.0)), Err(CoreError::NotFound(_))));
        assert!(matches!(
            ledger.ingest(reading("ST001", 1, f64::NAN)),
            Err(CoreError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_failed_recording_keeps_reading_for_reclassify() {
        let (tmp, store, ledger) = setup();
        let side = rusqlite::Connection::open(tmp.path()).unwrap();
        side.execute_batch(
            "CREATE TRIGGER block_anomalies BEFORE INSERT ON anomalies
             BEGIN SELECT RAISE(ABORT, 'anomalies locked'); END;",
        )
        .unwrap();

        assert!(matches!(
            ledger.ingest(reading("ST001", 0, 500.0)),
            Err(CoreError::Store(_))
        ));
        assert!(store.get_reading("ST001", t(0)).unwrap().is_some());
        assert!(matches!(ledger.ingest(reading("ST001", 0, 500.0)), Err(CoreError::Conflict(_))));

        side.execute_batch("DROP TRIGGER block_anomalies;").unwrap();
        let report = ledger.reclassify("ST001", t(0)).unwrap();
        assert_eq!(report.detections[0].anomaly_type, AnomalyType::OutOfRange);
        assert!(matches!(report.detections[0].outcome, UpsertOutcome::Created(_)));
    }

    #[test]
    fn test_redetection_while_open_refreshes() {
        let (_tmp, store, ledger) = setup();
        let id = open_anomaly(&ledger, "ST001", 0, 500.0);
        let before = store.get_anomaly(id).unwrap().detected_at;

        let report = ledger.reclassify("ST001", t(0)).unwrap();
        assert_eq!(report.detections[0].outcome, UpsertOutcome::Refreshed(id));

        let after = store.get_anomaly(id).unwrap();
        assert_eq!(after.status, AnomalyStatus::Open);
        assert!(after.detected_at >= before);

        let filter = AnomalyFilter {
            station_code: Some("ST001".to_string()),
            ..Default::default()
        };
        assert_eq!(ledger.list(&filter, false).unwrap().len(), 1);
    }

    #[test]
    fn test_redetection_after_resolution() {
        let (_tmp, _store, ledger) = setup();
        let id = open_anomaly(&ledger, "ST001", 0, 500.0);
        ledger.submit_feedback(id, reject()).unwrap();

        // Same type: no-op.
        let report = ledger.reclassify("ST001", t(0)).unwrap();
        assert_eq!(report.detections[0].outcome, UpsertOutcome::Unchanged(id));

        // A different type on the same reading gets its own record.
        let r = reading("ST001", 0, 500.0);
        let extra = vec![Detection {
            anomaly_type: AnomalyType::Spike,
            detail: "manual rerun".to_string(),
        }];
        let recorded = ledger.record_detections(&r, extra, Utc::now()).unwrap();
        assert!(matches!(recorded[0].outcome, UpsertOutcome::Created(new_id) if new_id != id));
    }

    #[test]
    fn test_reject_then_refuse() {
        let (_tmp, _store, ledger) = setup();
        let id = open_anomaly(&ledger, "ST001", 0, 500.0);

        let rec = ledger.submit_feedback(id, reject()).unwrap();
        assert_eq!(rec.status, AnomalyStatus::Rejected);
        assert_eq!(rec.feedback.as_ref().unwrap().note, "");

        for again in [reject(), confirm()] {
            let err = ledger.submit_feedback(id, again).unwrap_err();
            assert!(matches!(err, CoreError::InvalidTransition { status: AnomalyStatus::Rejected, .. }));
        }
        assert_eq!(ledger.get(id).unwrap().status, AnomalyStatus::Rejected);
    }

    #[test]
    fn test_confirm_and_correct() {
        let (_tmp, _store, ledger) = setup();
        let a = open_anomaly(&ledger, "ST001", 0, 500.0);
        let b = open_anomaly(&ledger, "ST002", 0, -2.0);

        let rec = ledger
            .submit_feedback(
                a,
                FeedbackSubmission {
                    note: Some("storm cell".to_string()),
                    reviewer: Some("duty officer".to_string()),
                    ..confirm()
                },
            )
            .unwrap();
        assert_eq!(rec.status, AnomalyStatus::Confirmed);
        assert_eq!(rec.corrected_value, None);
        let fb = rec.feedback.unwrap();
        assert_eq!(fb.note, "storm cell");
        assert_eq!(fb.reviewer.as_deref(), Some("duty officer"));

        let rec = ledger
            .submit_feedback(
                b,
                FeedbackSubmission {
                    corrected_value: Some(0.0),
                    ..confirm()
                },
            )
            .unwrap();
        assert_eq!(rec.status, AnomalyStatus::Corrected);
        assert_eq!(rec.corrected_value, Some(0.0));

        let err = ledger.submit_feedback(b, confirm()).unwrap_err();
        assert!(matches!(err, CoreError::InvalidTransition { status: AnomalyStatus::Corrected, .. }));
    }

    #[test]
    fn test_invalid_feedback_inputs() {
        let (_tmp, _store, ledger) = setup();
        let id = open_anomaly(&ledger, "ST001", 0, 500.0);

        let same = FeedbackSubmission {
            corrected_value: Some(500.0),
            ..confirm()
        };
        assert!(matches!(ledger.submit_feedback(id, same), Err(CoreError::InvalidInput(_))));

        let negative = FeedbackSubmission {
            corrected_value: Some(-1.0),
            ..confirm()
        };
        assert!(matches!(ledger.submit_feedback(id, negative), Err(CoreError::InvalidInput(_))));

        let reject_with_value = FeedbackSubmission {
            corrected_value: Some(12.0),
            ..reject()
        };
        assert!(matches!(
            ledger.submit_feedback(id, reject_with_value),
            Err(CoreError::InvalidInput(_))
        ));

        assert!(matches!(
            ledger.submit_feedback(id, FeedbackSubmission::default()),
            Err(CoreError::InvalidInput(_))
        ));
        assert!(matches!(ledger.submit_feedback(9999, reject()), Err(CoreError::NotFound(_))));

        // Still open after all the refusals.
        assert_eq!(ledger.get(id).unwrap().status, AnomalyStatus::Open);
    }

    #[test]
    fn test_concurrent_feedback_single_winner() {
        let (_tmp, _store, ledger) = setup();
        let id = open_anomaly(&ledger, "ST001", 0, 500.0);
        let ledger = Arc::new(ledger);

        let handles: Vec<_> = [reject(), confirm()]
            .into_iter()
            .map(|fb| {
                let ledger = ledger.clone();
                std::thread::spawn(move || ledger.submit_feedback(id, fb))
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert_eq!(
            results
                .iter()
                .filter(|r| matches!(r, Err(CoreError::InvalidTransition { .. })))
                .count(),
            1
        );
    }

    #[test]
    fn test_concurrent_detection_single_record() {
        let (_tmp, store, ledger) = setup();
        let r = reading("ST001", 0, 500.0);
        store.add_reading(&r).unwrap();
        let ledger = Arc::new(ledger);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let ledger = ledger.clone();
                let r = r.clone();
                std::thread::spawn(move || {
                    let d = vec![Detection {
                        anomaly_type: AnomalyType::OutOfRange,
                        detail: String::new(),
                    }];
                    ledger.record_detections(&r, d, Utc::now()).unwrap()
                })
            })
            .collect();
        let outcomes: Vec<UpsertOutcome> = handles
            .into_iter()
            .map(|h| h.join().unwrap()[0].outcome)
            .collect();

        assert_eq!(outcomes.iter().filter(|o| matches!(o, UpsertOutcome::Created(_))).count(), 1);
        let ids: std::collections::HashSet<i64> = outcomes.iter().map(|o| o.id()).collect();
        assert_eq!(ids.len(), 1);
    }

    #[test]
    fn test_list_latest_per_station() {
        let (_tmp, _store, ledger) = setup();
        open_anomaly(&ledger, "ST001", 0, 500.0);
        open_anomaly(&ledger, "ST001", 1, 600.0);
        open_anomaly(&ledger, "ST002", 0, 700.0);

        let all = ledger.list(&AnomalyFilter::default(), false).unwrap();
        assert_eq!(all.len(), 3);

        let latest = ledger.list(&AnomalyFilter::default(), true).unwrap();
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0].record.station_code, "ST001");
        assert_eq!(latest[0].record.timestamp, t(1));
        assert_eq!(latest[1].record.station_code, "ST002");

        let bad = AnomalyFilter {
            start: Some(t(5)),
            end: Some(t(1)),
            ..Default::default()
        };
        assert!(matches!(ledger.list(&bad, false), Err(CoreError::InvalidInput(_))));
    }
}
