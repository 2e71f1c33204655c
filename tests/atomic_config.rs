//! Concurrency contract of the config file: readers must never observe a
//! torn write, regardless of writer pressure.

use mcpproxy::config::{Config, load_config, save_config};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

#[test]
fn sequential_saves_with_concurrent_readers_never_tear() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mcp_config.json");
    save_config(&Config::default(), Some(&path)).unwrap();

    let stop = Arc::new(AtomicBool::new(false));
    let read_count = Arc::new(AtomicUsize::new(0));

    let mut readers = Vec::new();
    for _ in 0..10 {
        let path = path.clone();
        let stop = stop.clone();
        let read_count = read_count.clone();
        readers.push(std::thread::spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                // any parse failure here means a torn write was observed
                let config = load_config(Some(&path)).expect("reader saw partial JSON");
                assert!(config.top_k >= 1);
                read_count.fetch_add(1, Ordering::Relaxed);
            }
        }));
    }

    for i in 0..200 {
        let mut config = Config::default();
        config.top_k = (i % 100) + 1;
        config.api_key = Some(format!("key-{}", i));
        save_config(&config, Some(&path)).unwrap();
    }

    stop.store(true, Ordering::Relaxed);
    for reader in readers {
        reader.join().unwrap();
    }
    assert!(read_count.load(Ordering::Relaxed) > 0);

    let final_config = load_config(Some(&path)).unwrap();
    assert_eq!(final_config.api_key.as_deref(), Some("key-199"));
}

#[test]
fn concurrent_writers_leave_valid_json() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mcp_config.json");

    let mut writers = Vec::new();
    for t in 0..4 {
        let path = path.clone();
        writers.push(std::thread::spawn(move || {
            for i in 0..50 {
                let mut config = Config::default();
                config.api_key = Some(format!("writer-{}-{}", t, i));
                save_config(&config, Some(&path)).unwrap();
            }
        }));
    }
    for writer in writers {
        writer.join().unwrap();
    }

    let config = load_config(Some(&path)).unwrap();
    assert!(config.api_key.unwrap().starts_with("writer-"));
}
