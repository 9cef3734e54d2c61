//! Resumable per-zone statistics ledger
//!
//! Records are appended to a CSV file one zone at a time and flushed to disk
//! before the next zone starts, so an interrupted run keeps every committed
//! zone. On restart, zones already present in the file are skipped.

use crate::types::{Grade, JoinSide, VerdureError, VerdureResult, ZonalRecord, Zone};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

/// Column order of the persisted store
pub const LEDGER_COLUMNS: [&str; 5] = [
    "zone",
    "total_pixels",
    "frac_veg",
    "mean_patch_size",
    "edge_density",
];

/// Bounded retry of transient failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Fixed pause between attempts
    pub delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay_ms: 2000,
        }
    }
}

impl RetryPolicy {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

/// Run `op` until it succeeds, fails permanently, or the attempt budget is spent.
///
/// Only errors with [`VerdureError::is_transient`] are retried. The closure
/// receives the 1-based attempt number.
pub fn retry_with_policy<T, F>(policy: &RetryPolicy, what: &str, mut op: F) -> VerdureResult<T>
where
    F: FnMut(u32) -> VerdureResult<T>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        log::debug!("{}: attempt {} of {}", what, attempt, max_attempts);

        match op(attempt) {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_transient() => return Err(e),
            Err(e) if attempt >= max_attempts => {
                log::error!("{}: giving up after {} attempts: {}", what, attempt, e);
                return Err(VerdureError::RetriesExhausted {
                    attempts: attempt,
                    last_error: e.to_string(),
                });
            }
            Err(e) => {
                log::warn!("{}: attempt {} failed ({}), retrying...", what, attempt, e);
                std::thread::sleep(policy.delay());
            }
        }
    }
}

/// Ledger location and retry behaviour for external calls made per zone
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub path: PathBuf,
    pub retry: RetryPolicy,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("zonal_records.csv"),
            retry: RetryPolicy::default(),
        }
    }
}

/// Lifecycle of one zone within a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ZoneState {
    Pending,
    /// A record already existed
    Skipped,
    Computing,
    Committed,
    Failed(String),
}

/// Final state of every zone in a run, in input order
#[derive(Debug, Clone, Default)]
pub struct LedgerRun {
    pub states: Vec<(String, ZoneState)>,
}

impl LedgerRun {
    fn count(&self, pred: impl Fn(&ZoneState) -> bool) -> usize {
        self.states.iter().filter(|(_, s)| pred(s)).count()
    }

    pub fn committed(&self) -> usize {
        self.count(|s| *s == ZoneState::Committed)
    }

    pub fn skipped(&self) -> usize {
        self.count(|s| *s == ZoneState::Skipped)
    }

    pub fn failed(&self) -> Vec<(&str, &str)> {
        self.states
            .iter()
            .filter_map(|(id, s)| match s {
                ZoneState::Failed(reason) => Some((id.as_str(), reason.as_str())),
                _ => None,
            })
            .collect()
    }
}

struct LedgerState {
    writer: csv::Writer<File>,
    ids: HashSet<String>,
}

/// Append-only CSV store of [`ZonalRecord`]s keyed by zone id
pub struct Ledger {
    path: PathBuf,
    state: Mutex<LedgerState>,
}

impl Ledger {
    /// Open or create the store, reading existing ids once
    pub fn open<P: AsRef<Path>>(path: P) -> VerdureResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let exists = std::fs::metadata(&path).map(|m| m.len() > 0).unwrap_or(false);
        let (ids, is_new): (HashSet<String>, bool) = if exists {
            let (records, needs_header) = recover_tail(&path)?;
            (records.into_iter().map(|r| r.zone).collect(), needs_header)
        } else {
            (HashSet::new(), true)
        };

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);
        if is_new {
            writer.write_record(LEDGER_COLUMNS)?;
            writer.flush()?;
        }

        log::info!(
            "Opened ledger {} with {} existing records",
            path.display(),
            ids.len()
        );

        Ok(Self {
            path,
            state: Mutex::new(LedgerState { writer, ids }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> VerdureResult<std::sync::MutexGuard<'_, LedgerState>> {
        self.state
            .lock()
            .map_err(|_| VerdureError::Processing("Ledger lock poisoned".to_string()))
    }

    pub fn contains(&self, zone_id: &str) -> VerdureResult<bool> {
        Ok(self.lock()?.ids.contains(zone_id))
    }

    pub fn len(&self) -> VerdureResult<usize> {
        Ok(self.lock()?.ids.len())
    }

    pub fn is_empty(&self) -> VerdureResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Durably append a record. Returns false if the zone was already present.
    pub fn append(&self, record: &ZonalRecord) -> VerdureResult<bool> {
        let mut state = self.lock()?;
        if state.ids.contains(&record.zone) {
            log::debug!("Record for zone {} already committed", record.zone);
            return Ok(false);
        }

        state.writer.serialize(record)?;
        state.writer.flush()?;
        state.writer.get_ref().sync_data()?;
        state.ids.insert(record.zone.clone());
        Ok(true)
    }

    fn process_zone<F>(&self, zone: &Zone, compute: &F) -> VerdureResult<ZoneState>
    where
        F: Fn(&Zone) -> VerdureResult<ZonalRecord>,
    {
        if self.contains(&zone.id)? {
            log::debug!("Zone {} already in ledger, skipping", zone.id);
            return Ok(ZoneState::Skipped);
        }

        log::debug!("Zone {}: {:?}", zone.id, ZoneState::Computing);
        let mut record = match compute(zone) {
            Ok(record) => record,
            Err(e) => {
                log::warn!("Zone {} failed: {}", zone.id, e);
                return Ok(ZoneState::Failed(e.to_string()));
            }
        };
        record.zone = zone.id.clone();

        // Another worker may have committed the zone while this one computed
        if self.append(&record)? {
            Ok(ZoneState::Committed)
        } else {
            Ok(ZoneState::Skipped)
        }
    }

    fn summarise(&self, run: &LedgerRun) {
        log::info!(
            "Ledger run over {} zones: {} committed, {} skipped, {} failed",
            run.states.len(),
            run.committed(),
            run.skipped(),
            run.failed().len()
        );
    }

    /// Compute and commit missing zones one at a time.
    ///
    /// A failing zone is recorded and the run moves on; only ledger I/O
    /// errors abort the run.
    pub fn run<F>(&self, zones: &[Zone], compute: F) -> VerdureResult<LedgerRun>
    where
        F: Fn(&Zone) -> VerdureResult<ZonalRecord>,
    {
        let mut run = LedgerRun {
            states: zones.iter().map(|z| (z.id.clone(), ZoneState::Pending)).collect(),
        };
        for (zone, slot) in zones.iter().zip(run.states.iter_mut()) {
            slot.1 = self.process_zone(zone, &compute)?;
        }
        self.summarise(&run);
        Ok(run)
    }

    /// Same as [`Ledger::run`] with zones computed across the rayon pool
    pub fn run_parallel<F>(&self, zones: &[Zone], compute: F) -> VerdureResult<LedgerRun>
    where
        F: Fn(&Zone) -> VerdureResult<ZonalRecord> + Sync,
    {
        let states = zones
            .par_iter()
            .map(|zone| Ok((zone.id.clone(), self.process_zone(zone, &compute)?)))
            .collect::<VerdureResult<Vec<_>>>()?;
        let run = LedgerRun { states };
        self.summarise(&run);
        Ok(run)
    }

    /// Read back the full persisted store
    pub fn reload(&self) -> VerdureResult<Vec<ZonalRecord>> {
        {
            let mut state = self.lock()?;
            state.writer.flush()?;
        }
        read_records(&self.path)
    }
}

fn truncate_to(path: &Path, len: u64) -> VerdureResult<()> {
    let file = OpenOptions::new().write(true).open(path)?;
    file.set_len(len)?;
    file.sync_data()?;
    Ok(())
}

/// Cut off a final record left incomplete by an interrupted append.
///
/// Returns the complete records and whether the header must be rewritten.
/// Only the last record may be damaged; a bad record earlier in the file is
/// an error.
fn recover_tail(path: &Path) -> VerdureResult<(Vec<ZonalRecord>, bool)> {
    let bytes = std::fs::read(path)?;
    if !bytes.contains(&b'\n') {
        log::warn!("Ledger {} has no complete header, starting over", path.display());
        truncate_to(path, 0)?;
        return Ok((Vec::new(), true));
    }

    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(bytes.as_slice());
    let headers = reader.byte_headers()?.clone();
    let mut raw = csv::ByteRecord::new();
    let mut records = Vec::new();

    loop {
        let start = reader.position().byte() as usize;
        let parsed = match reader.read_byte_record(&mut raw) {
            Ok(false) => break,
            Ok(true) if raw.len() == headers.len() => raw.deserialize::<ZonalRecord>(Some(&headers)).ok(),
            _ => None,
        };
        let end = reader.position().byte() as usize;
        let terminated = end > start && matches!(bytes.get(end - 1), Some(b'\n') | Some(b'\r'));

        match parsed {
            Some(record) if terminated => records.push(record),
            _ if end >= bytes.len() => {
                log::warn!(
                    "Ledger {}: dropping incomplete final record at byte {}",
                    path.display(),
                    start
                );
                truncate_to(path, start as u64)?;
                break;
            }
            _ => {
                return Err(VerdureError::InvalidFormat(format!(
                    "Ledger {} has a malformed record at byte {}",
                    path.display(),
                    start
                )))
            }
        }
    }

    Ok((records, false))
}

/// Read every record of a ledger file
pub fn read_records<P: AsRef<Path>>(path: P) -> VerdureResult<Vec<ZonalRecord>> {
    let mut reader = csv::Reader::from_path(path.as_ref())?;
    let mut records = Vec::new();
    for row in reader.deserialize() {
        records.push(row?);
    }
    Ok(records)
}

/// Zone joined with its ledger record
#[derive(Debug, Clone)]
pub struct JoinedZone {
    pub zone: Zone,
    pub grade: Grade,
    pub record: ZonalRecord,
}

#[derive(Debug, Default)]
pub struct JoinedTable {
    /// In zone layer order
    pub rows: Vec<JoinedZone>,
    /// One [`VerdureError::JoinMismatch`] per unmatched id
    pub mismatches: Vec<VerdureError>,
    /// Matched zones dropped for lacking a grade
    pub ungraded: Vec<String>,
}

/// Inner join of records onto zones by id, dropping rows without a grade
pub fn join_records(zones: &[Zone], records: &[ZonalRecord]) -> JoinedTable {
    let mut by_id: HashMap<&str, &ZonalRecord> = HashMap::with_capacity(records.len());
    for record in records {
        by_id.entry(record.zone.as_str()).or_insert(record);
    }
    let zone_ids: HashSet<&str> = zones.iter().map(|z| z.id.as_str()).collect();

    let mut table = JoinedTable::default();
    for zone in zones {
        let Some(record) = by_id.get(zone.id.as_str()) else {
            table.mismatches.push(VerdureError::JoinMismatch {
                zone_id: zone.id.clone(),
                side: JoinSide::ZoneWithoutRecord,
            });
            continue;
        };
        match zone.grade {
            Some(grade) => table.rows.push(JoinedZone {
                zone: zone.clone(),
                grade,
                record: (*record).clone(),
            }),
            None => table.ungraded.push(zone.id.clone()),
        }
    }

    let mut orphans: Vec<&str> = by_id
        .keys()
        .filter(|id| !zone_ids.contains(*id))
        .copied()
        .collect();
    orphans.sort_unstable();
    for id in orphans {
        table.mismatches.push(VerdureError::JoinMismatch {
            zone_id: id.to_string(),
            side: JoinSide::RecordWithoutZone,
        });
    }

    log::info!(
        "Joined {} zones; {} unmatched ids, {} without grade",
        table.rows.len(),
        table.mismatches.len(),
        table.ungraded.len()
    );
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::MultiPolygon;
    use std::cell::Cell;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn zone(id: &str, grade: Option<Grade>) -> Zone {
        Zone {
            id: id.to_string(),
            grade,
            geometry: MultiPolygon(vec![]),
        }
    }

    fn record(id: &str, total: u64) -> ZonalRecord {
        ZonalRecord {
            zone: id.to_string(),
            total_pixels: total,
            frac_veg: 0.25,
            mean_patch_size: 4.0,
            edge_density: 0.5,
        }
    }

    fn no_wait() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 5,
            delay_ms: 0,
        }
    }

    #[test]
    fn test_retry_succeeds_after_transient_failures() {
        let calls = Cell::new(0);
        let value = retry_with_policy(&no_wait(), "search", |_| {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(VerdureError::TransientCatalogFailure("busy".into()))
            } else {
                Ok(7)
            }
        })
        .unwrap();
        assert_eq!(value, 7);
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_retry_exhausts_bound() {
        let calls = Cell::new(0);
        let err = retry_with_policy(&no_wait(), "search", |_| -> VerdureResult<()> {
            calls.set(calls.get() + 1);
            Err(VerdureError::TransientCatalogFailure("busy".into()))
        })
        .unwrap_err();
        assert_eq!(calls.get(), 5);
        assert!(matches!(err, VerdureError::RetriesExhausted { attempts: 5, .. }));
    }

    #[test]
    fn test_retry_does_not_repeat_permanent_errors() {
        let calls = Cell::new(0);
        let err = retry_with_policy(&no_wait(), "read", |_| -> VerdureResult<()> {
            calls.set(calls.get() + 1);
            Err(VerdureError::MissingBand("B04".into()))
        })
        .unwrap_err();
        assert_eq!(calls.get(), 1);
        assert!(matches!(err, VerdureError::MissingBand(_)));
    }

    #[test]
    fn test_existing_record_is_skipped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("records.csv");
        let ledger = Ledger::open(&path).unwrap();
        assert!(ledger.append(&record("B", 10)).unwrap());

        let computed = Mutex::new(Vec::new());
        let zones = vec![zone("A", None), zone("B", None), zone("C", None)];
        let run = ledger
            .run(&zones, |z| {
                computed.lock().unwrap().push(z.id.clone());
                Ok(record(&z.id, 1))
            })
            .unwrap();

        assert_eq!(*computed.lock().unwrap(), vec!["A".to_string(), "C".to_string()]);
        assert_eq!(run.committed(), 2);
        assert_eq!(run.skipped(), 1);
        let ids: Vec<String> = ledger.reload().unwrap().into_iter().map(|r| r.zone).collect();
        assert_eq!(ids, vec!["B", "A", "C"]);
    }

    #[test]
    fn test_second_run_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("records.csv");
        let zones = vec![zone("1", None), zone("2", None)];
        let calls = AtomicUsize::new(0);
        let compute = |z: &Zone| -> VerdureResult<ZonalRecord> {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(record(&z.id, 5))
        };

        Ledger::open(&path).unwrap().run(&zones, compute).unwrap();
        let first = std::fs::read_to_string(&path).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let run = Ledger::open(&path).unwrap().run(&zones, compute).unwrap();
        let second = std::fs::read_to_string(&path).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(run.skipped(), 2);
        assert_eq!(first, second);
        assert!(first.starts_with("zone,total_pixels,frac_veg,mean_patch_size,edge_density\n"));
    }

    #[test]
    fn test_failing_zone_does_not_stop_run() {
        let dir = TempDir::new().unwrap();
        let ledger = Ledger::open(dir.path().join("records.csv")).unwrap();
        let zones = vec![zone("ok1", None), zone("bad", None), zone("ok2", None)];
        let run = ledger
            .run(&zones, |z| {
                if z.id == "bad" {
                    retry_with_policy(&no_wait(), "catalog", |_| {
                        Err(VerdureError::TransientCatalogFailure("timeout".into()))
                    })
                } else {
                    Ok(record(&z.id, 3))
                }
            })
            .unwrap();

        assert_eq!(run.committed(), 2);
        let failed = run.failed();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].0, "bad");
        assert!(!ledger.contains("bad").unwrap());
    }

    #[test]
    fn test_parallel_run_commits_each_zone_once() {
        let dir = TempDir::new().unwrap();
        let ledger = Ledger::open(dir.path().join("records.csv")).unwrap();
        let zones: Vec<Zone> = (0..32).map(|i| zone(&format!("z{}", i), None)).collect();
        let run = ledger.run_parallel(&zones, |z| Ok(record(&z.id, 1))).unwrap();
        assert_eq!(run.committed(), 32);
        assert_eq!(run.states[5].0, "z5");

        let records = ledger.reload().unwrap();
        let unique: HashSet<_> = records.iter().map(|r| r.zone.clone()).collect();
        assert_eq!(records.len(), 32);
        assert_eq!(unique.len(), 32);
    }

    const HEADER: &str = "zone,total_pixels,frac_veg,mean_patch_size,edge_density\n";

    #[test]
    fn test_torn_final_record_is_recomputed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("records.csv");
        std::fs::write(&path, format!("{}A,10,0.5,2.0,0.1\nB,1", HEADER)).unwrap();

        let ledger = Ledger::open(&path).unwrap();
        assert!(ledger.contains("A").unwrap());
        assert!(!ledger.contains("B").unwrap());

        let zones = vec![zone("A", None), zone("B", None)];
        let run = ledger.run(&zones, |z| Ok(record(&z.id, 7))).unwrap();
        assert_eq!(run.skipped(), 1);
        assert_eq!(run.committed(), 1);

        let records = ledger.reload().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].total_pixels, 10);
        assert_eq!(records[1].zone, "B");
        assert_eq!(records[1].total_pixels, 7);
    }

    #[test]
    fn test_unterminated_final_record_is_dropped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("records.csv");
        std::fs::write(&path, format!("{}A,10,0.5,2.0,0.1\nB,3,0.2,1.0,0.05", HEADER)).unwrap();

        let ledger = Ledger::open(&path).unwrap();
        assert_eq!(ledger.len().unwrap(), 1);
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            format!("{}A,10,0.5,2.0,0.1\n", HEADER)
        );
    }

    #[test]
    fn test_torn_header_starts_fresh() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("records.csv");
        std::fs::write(&path, "zone,total_pix").unwrap();

        let ledger = Ledger::open(&path).unwrap();
        assert!(ledger.is_empty().unwrap());
        ledger.append(&record("A", 1)).unwrap();
        assert_eq!(read_records(&path).unwrap().len(), 1);
    }

    #[test]
    fn test_damaged_middle_record_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("records.csv");
        std::fs::write(&path, format!("{}A,1\nB,10,0.5,2.0,0.1\n", HEADER)).unwrap();
        assert!(matches!(Ledger::open(&path), Err(VerdureError::InvalidFormat(_))));
    }

    #[test]
    fn test_nan_statistics_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("records.csv");
        let ledger = Ledger::open(&path).unwrap();
        let mut empty = record("bare", 0);
        empty.frac_veg = f64::NAN;
        empty.mean_patch_size = f64::NAN;
        ledger.append(&empty).unwrap();

        let back = &read_records(&path).unwrap()[0];
        assert_eq!(back.total_pixels, 0);
        assert!(back.mean_patch_size.is_nan());
    }

    #[test]
    fn test_join_drops_ungraded_and_reports_mismatches() {
        let zones = vec![
            zone("a", Some(Grade::A)),
            zone("b", None),
            zone("c", Some(Grade::D)),
        ];
        let records = vec![record("a", 1), record("b", 2), record("x", 3)];
        let table = join_records(&zones, &records);

        assert_eq!(table.rows.len(), 1);
        assert_eq!(table.rows[0].zone.id, "a");
        assert_eq!(table.rows[0].grade, Grade::A);
        assert_eq!(table.ungraded, vec!["b".to_string()]);
        assert_eq!(table.mismatches.len(), 2);
        assert!(table.mismatches.iter().any(|e| matches!(
            e,
            VerdureError::JoinMismatch { zone_id, side: JoinSide::ZoneWithoutRecord } if zone_id == "c"
        )));
        assert!(table.mismatches.iter().any(|e| matches!(
            e,
            VerdureError::JoinMismatch { zone_id, side: JoinSide::RecordWithoutZone } if zone_id == "x"
        )));
    }
}
