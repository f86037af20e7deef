//! Loader lifecycle against filesystem origins

mod common;

use common::{country_db, eventually, replace_db, write_db, EventRecorder};
use flate2::write::GzEncoder;
use flate2::Compression;
use ipatlas::{Error, LoaderEvent, LoaderOptions, PreReadiness, Registry, Source, Status};
use std::io::Write;
use std::time::Duration;
use tempfile::TempDir;

fn options() -> LoaderOptions {
    LoaderOptions::new()
        .without_cache()
        .with_watch_filesystem(false)
        .with_pre_readiness_retry(Duration::from_millis(50))
        .with_max_retry_backoff(Duration::from_millis(200))
}

fn country_of(registry: &Registry, id: &str) -> Option<String> {
    registry
        .lookup(id, "192.0.2.1")
        .ok()
        .and_then(|entry| entry.data.get("country")?.as_str().map(str::to_string))
}

#[test]
fn test_first_load_event_sequence() {
    let dir = TempDir::new().unwrap();
    let path = write_db(dir.path(), "geo.mmdb", &country_db("US"));
    let recorder = EventRecorder::new();
    let registry = Registry::new();

    registry
        .start(
            "geo",
            path.to_str().unwrap(),
            options().with_event_subscriber(recorder.subscriber()),
        )
        .unwrap();
    let versions = registry
        .wait_for_loaders(["geo"], Duration::from_secs(10))
        .unwrap();

    let events = recorder.events();
    let source = Source::Filesystem(path.clone());
    assert_eq!(
        events[0],
        LoaderEvent::StatusChanged {
            id: "geo".into(),
            status: Status::Fetching
        }
    );
    assert_eq!(
        events[1],
        LoaderEvent::LoadAttemptStarted {
            id: "geo".into(),
            source: source.clone()
        }
    );
    assert_eq!(
        events[2],
        LoaderEvent::LoadAttemptFinished {
            id: "geo".into(),
            source,
            outcome: Ok(versions["geo"])
        }
    );
    assert_eq!(
        events[3],
        LoaderEvent::StatusChanged {
            id: "geo".into(),
            status: Status::Ready {
                version: versions["geo"]
            }
        }
    );

    // Version of a filesystem snapshot is the file's mtime
    let mtime = std::fs::metadata(&path).unwrap().modified().unwrap();
    assert_eq!(versions["geo"], mtime);

    registry.stop("geo").unwrap();
    recorder.wait_for(|e| matches!(e, LoaderEvent::Stopped { .. }));
}

#[test]
fn test_refresh_unchanged_is_dismissed() {
    let dir = TempDir::new().unwrap();
    let path = write_db(dir.path(), "geo.mmdb", &country_db("US"));
    let recorder = EventRecorder::new();
    let registry = Registry::new();
    registry
        .start(
            "geo",
            path.to_str().unwrap(),
            options().with_event_subscriber(recorder.subscriber()),
        )
        .unwrap();
    registry
        .wait_for_loaders(["geo"], Duration::from_secs(10))
        .unwrap();
    let before = registry.get_info("geo").unwrap().version;

    registry.refresh("geo").unwrap();
    recorder.wait_for(|e| matches!(e, LoaderEvent::LoadAttemptDismissed { .. }));

    assert_eq!(registry.get_info("geo").unwrap().version, before);
    assert_eq!(
        recorder.count(|e| matches!(e, LoaderEvent::LoadAttemptFinished { .. })),
        1
    );
}

#[test]
fn test_refresh_picks_up_new_file() {
    let dir = TempDir::new().unwrap();
    let path = write_db(dir.path(), "geo.mmdb", &country_db("US"));
    let registry = Registry::new();
    registry
        .start("geo", path.to_str().unwrap(), options())
        .unwrap();
    registry
        .wait_for_loaders(["geo"], Duration::from_secs(10))
        .unwrap();
    assert_eq!(country_of(&registry, "geo").as_deref(), Some("US"));

    replace_db(&path, &country_db("CA"), 60);
    registry.refresh("geo").unwrap();
    eventually("new snapshot", || {
        country_of(&registry, "geo").as_deref() == Some("CA")
    });
}

#[test]
fn test_watcher_reloads_changed_file() {
    let dir = TempDir::new().unwrap();
    let path = write_db(dir.path(), "geo.mmdb", &country_db("US"));
    let registry = Registry::new();
    registry
        .start(
            "geo",
            path.to_str().unwrap(),
            options().with_watch_filesystem(true),
        )
        .unwrap();
    registry
        .wait_for_loaders(["geo"], Duration::from_secs(10))
        .unwrap();

    replace_db(&path, &country_db("MX"), 60);
    eventually("watcher reload", || {
        country_of(&registry, "geo").as_deref() == Some("MX")
    });
}

#[test]
fn test_failed_refresh_keeps_serving_last_snapshot() {
    let dir = TempDir::new().unwrap();
    let path = write_db(dir.path(), "geo.mmdb", &country_db("US"));
    let registry = Registry::new();
    registry
        .start("geo", path.to_str().unwrap(), options())
        .unwrap();
    let versions = registry
        .wait_for_loaders(["geo"], Duration::from_secs(10))
        .unwrap();

    replace_db(&path, b"definitely not an mmdb file", 60);
    registry.refresh("geo").unwrap();
    eventually("failed status", || {
        matches!(registry.status("geo"), Ok(Status::Failed { .. }))
    });

    match registry.status("geo").unwrap() {
        Status::Failed { last_version, .. } => assert_eq!(last_version, Some(versions["geo"])),
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(country_of(&registry, "geo").as_deref(), Some("US"));
    // Waiters treat a failed loader with a snapshot as ready
    registry
        .wait_for_loaders(["geo"], Duration::from_secs(1))
        .unwrap();

    // Retries with backoff pick up the repaired file
    replace_db(&path, &country_db("FR"), 120);
    eventually("recovery", || {
        country_of(&registry, "geo").as_deref() == Some("FR")
    });
    assert!(matches!(registry.status("geo"), Ok(Status::Ready { .. })));
}

#[test]
fn test_gzip_file_origin() {
    let dir = TempDir::new().unwrap();
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&country_db("BR")).unwrap();
    let path = write_db(dir.path(), "geo.mmdb.gz", &encoder.finish().unwrap());

    let registry = Registry::new();
    let origin = format!("file://{}", path.display());
    registry.start("geo", &origin, options()).unwrap();
    registry
        .wait_for_loaders(["geo"], Duration::from_secs(10))
        .unwrap();
    assert_eq!(country_of(&registry, "geo").as_deref(), Some("BR"));
}

#[test]
fn test_stop_releases_snapshot_after_readers() {
    let dir = TempDir::new().unwrap();
    let path = write_db(dir.path(), "geo.mmdb", &country_db("US"));
    let registry = Registry::new();
    registry
        .start("geo", path.to_str().unwrap(), options())
        .unwrap();
    registry
        .wait_for_loaders(["geo"], Duration::from_secs(10))
        .unwrap();

    let held = registry.database("geo").unwrap();
    registry.stop("geo").unwrap();

    assert!(matches!(
        registry.lookup("geo", "192.0.2.1"),
        Err(Error::DatabaseUnknown(_))
    ));
    assert!(held.lookup("192.0.2.1".parse().unwrap()).unwrap().is_some());
    assert_eq!(std::sync::Arc::strong_count(&held), 1);

    // The id can be reused after stop
    registry
        .start("geo", path.to_str().unwrap(), options())
        .unwrap();
}

#[test]
fn test_blocking_pre_readiness_waits_for_first_load() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("late.mmdb");
    let registry = Registry::new();
    registry
        .start(
            "late",
            path.to_str().unwrap(),
            options().with_pre_readiness(PreReadiness::Block {
                timeout: Duration::from_secs(10),
            }),
        )
        .unwrap();

    let writer = {
        let path = path.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(200));
            replace_db(&path, &country_db("NZ"), 0);
        })
    };
    assert_eq!(country_of(&registry, "late").as_deref(), Some("NZ"));
    writer.join().unwrap();
}

#[test]
fn test_blocking_pre_readiness_times_out() {
    let dir = TempDir::new().unwrap();
    let registry = Registry::new();
    registry
        .start(
            "never",
            dir.path().join("never.mmdb").to_str().unwrap(),
            options().with_pre_readiness(PreReadiness::Block {
                timeout: Duration::from_millis(150),
            }),
        )
        .unwrap();
    assert!(matches!(
        registry.lookup("never", "192.0.2.1"),
        Err(Error::DatabaseNotLoaded(_))
    ));
}
