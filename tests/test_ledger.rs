use geo::{polygon, MultiPolygon};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tempfile::TempDir;
use verdure::core::ledger::{join_records, read_records, Ledger, RetryPolicy, ZoneState};
use verdure::core::pipeline::RunReport;
use verdure::io::zones::write_joined_geojson;
use verdure::types::{Grade, VerdureError, VerdureResult, ZonalRecord, Zone};

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn zone(id: &str, grade: Option<Grade>) -> Zone {
    Zone {
        id: id.to_string(),
        grade,
        geometry: MultiPolygon(vec![polygon![
            (x: 0.0, y: 0.0),
            (x: 1.0, y: 0.0),
            (x: 1.0, y: 1.0),
            (x: 0.0, y: 0.0),
        ]]),
    }
}

fn computed(id: &str) -> ZonalRecord {
    ZonalRecord {
        zone: id.to_string(),
        total_pixels: 100,
        frac_veg: 0.4,
        mean_patch_size: 6.5,
        edge_density: 0.12,
    }
}

#[test]
fn test_existing_zone_is_not_recomputed() {
    init();
    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().join("ledger").join("tracts.csv");

    let existing = ZonalRecord {
        zone: "B".to_string(),
        total_pixels: 7,
        frac_veg: 0.9,
        mean_patch_size: 2.0,
        edge_density: 0.3,
    };
    Ledger::open(&path).expect("open").append(&existing).expect("append");

    let ledger = Ledger::open(&path).expect("reopen");
    let seen = Mutex::new(Vec::new());
    let zones = vec![zone("A", Some(Grade::A)), zone("B", Some(Grade::B)), zone("C", Some(Grade::C))];
    let run = ledger
        .run(&zones, |z| {
            seen.lock().expect("lock").push(z.id.clone());
            Ok(computed(&z.id))
        })
        .expect("run");

    assert_eq!(*seen.lock().expect("lock"), vec!["A", "C"]);
    assert_eq!(run.states[1].1, ZoneState::Skipped);

    let records = read_records(&path).expect("read back");
    assert_eq!(records.len(), 3);
    let b = records.iter().find(|r| r.zone == "B").expect("B kept");
    assert_eq!(*b, existing);
}

#[test]
fn test_restart_after_interruption_resumes() {
    init();
    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().join("tracts.csv");
    let zones: Vec<Zone> = ["1", "2", "3", "4"].iter().map(|id| zone(id, Some(Grade::D))).collect();
    let calls = AtomicUsize::new(0);
    let compute = |z: &Zone| -> VerdureResult<ZonalRecord> {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok(computed(&z.id))
    };

    // First process stops after two zones
    {
        let ledger = Ledger::open(&path).expect("open");
        ledger.run(&zones[..2], compute).expect("partial run");
    }
    let ledger = Ledger::open(&path).expect("reopen");
    let run = ledger.run(&zones, compute).expect("full run");

    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert_eq!(run.skipped(), 2);
    assert_eq!(run.committed(), 2);

    let before = std::fs::read_to_string(&path).expect("read");
    let again = Ledger::open(&path).expect("reopen").run_parallel(&zones, compute).expect("rerun");
    assert_eq!(again.committed(), 0);
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert_eq!(before, std::fs::read_to_string(&path).expect("read"));
}

#[test]
fn test_transient_failures_fail_one_zone() {
    init();
    let dir = TempDir::new().expect("temp dir");
    let ledger = Ledger::open(dir.path().join("tracts.csv")).expect("open");
    let policy = RetryPolicy {
        max_attempts: 5,
        delay_ms: 1,
    };
    let attempts = AtomicUsize::new(0);
    let zones = vec![zone("flaky", None), zone("fine", None)];

    let run = ledger
        .run(&zones, |z| {
            verdure::core::ledger::retry_with_policy(&policy, "search", |_| {
                if z.id == "flaky" {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err(VerdureError::TransientCatalogFailure("502".into()))
                } else {
                    Ok(computed(&z.id))
                }
            })
        })
        .expect("run");

    assert_eq!(attempts.load(Ordering::SeqCst), 5);
    assert_eq!(run.committed(), 1);
    assert_eq!(run.failed()[0].0, "flaky");

    let mut report = RunReport::default();
    report.add_ledger_run(&run);
    assert_eq!(report.failed().len(), 1);
    assert!(report.failed()[0].reason.as_deref().unwrap_or("").contains("5 attempts"));
}

#[test]
fn test_join_output_drops_missing_grades() {
    init();
    let dir = TempDir::new().expect("temp dir");
    let ledger = Ledger::open(dir.path().join("tracts.csv")).expect("open");
    let zones = vec![zone("A", Some(Grade::C)), zone("B", None), zone("C", Some(Grade::A))];
    ledger.run(&zones, |z| Ok(computed(&z.id))).expect("run");
    ledger.append(&computed("orphan")).expect("append");

    let table = join_records(&zones, &ledger.reload().expect("reload"));
    let ids: Vec<&str> = table.rows.iter().map(|r| r.zone.id.as_str()).collect();
    assert_eq!(ids, vec!["A", "C"]);
    assert!(table.rows[1].grade < table.rows[0].grade);
    assert_eq!(table.mismatches.len(), 1);

    let out = dir.path().join("joined.geojson");
    write_joined_geojson(&out, &table).expect("write");
    let text = std::fs::read_to_string(&out).expect("read");
    assert!(text.contains("FeatureCollection"));
    assert!(text.contains("\"frac_veg\":0.4"));
}
