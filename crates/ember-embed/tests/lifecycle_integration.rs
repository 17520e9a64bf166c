//! Integration tests for the runtime lifecycle
//!
//! Tests cover:
//! - Loading from files and memory, and the image errors
//! - Ordering rules between initialize, load and the entry point
//! - Error recording and statistics

mod common;

use common::*;
use ember_embed::{EmbedError, MemberAccess, Runtime, RuntimeOptions, Status, ValueHandle};
use tempfile::TempDir;

#[test]
fn test_load_file_and_run_entry() {
    let dir = TempDir::new().unwrap();
    let path = write_image(&dir, "game.ebc", &game_image(1));

    let mut rt = Runtime::new(RuntimeOptions::default());
    rt.initialize(&["game", "--fast"]).unwrap();
    rt.load_file(&path).unwrap();
    assert!(rt.is_loaded());
    assert!(!rt.entry_executed());

    rt.run_entry().unwrap();
    assert!(rt.entry_executed());
    assert!(rt.get_static_field("Game", "started").unwrap().as_bool(false));
    assert_eq!(rt.get_static_field("Game", "score").unwrap().as_int(-1), 0);
}

#[test]
fn test_load_bytes() {
    let mut rt = Runtime::new(RuntimeOptions::default());
    rt.initialize(&[]).unwrap();
    rt.load_bytes(&game_image(1)).unwrap();
    rt.run_entry().unwrap();
    assert_eq!(rt.call_static("Game", "bonus", &[]).unwrap().as_int(0), 1);
}

#[test]
fn test_missing_file() {
    let dir = TempDir::new().unwrap();
    let mut rt = Runtime::new(RuntimeOptions::default());
    rt.initialize(&[]).unwrap();

    let err = rt.load_file(dir.path().join("absent.ebc")).unwrap_err();
    assert!(matches!(err, EmbedError::FileNotFound(_)));
    assert_eq!(rt.last_status(), Status::FileNotFound);
    assert!(rt.last_error().unwrap().contains("absent.ebc"));
    assert!(!rt.is_loaded());
}

#[test]
fn test_malformed_images() {
    let mut rt = Runtime::new(RuntimeOptions::default());
    rt.initialize(&[]).unwrap();

    assert!(matches!(rt.load_bytes(b"not an image"), Err(EmbedError::InvalidImage(_))));
    assert_eq!(rt.last_status(), Status::InvalidProgramImage);

    let mut corrupt = game_image(1);
    let last = corrupt.len() - 1;
    corrupt[last] ^= 0xff;
    assert!(matches!(rt.load_bytes(&corrupt), Err(EmbedError::InvalidImage(_))));

    let mut future = game_image(1);
    future[4] = 99;
    assert!(matches!(
        rt.load_bytes(&future),
        Err(EmbedError::VersionMismatch { found: 99, .. })
    ));
    assert_eq!(rt.last_status(), Status::VersionMismatch);

    rt.load_bytes(&game_image(1)).unwrap();
    assert_eq!(rt.last_status(), Status::Ok);
}

#[test]
fn test_load_requires_initialize() {
    let mut rt = Runtime::new(RuntimeOptions::default());
    assert!(matches!(rt.load_bytes(&game_image(1)), Err(EmbedError::NotInitialized(_))));
    assert!(matches!(rt.run_entry(), Err(EmbedError::NotInitialized(_))));
    assert!(!rt.is_initialized());
}

#[test]
fn test_static_access_requires_entry() {
    let mut rt = loaded(RuntimeOptions::default());

    let err = rt.get_static_field("Game", "score").unwrap_err();
    assert!(matches!(err, EmbedError::NotInitialized(_)));
    assert!(matches!(
        rt.call_static("Game", "addPoints", &[&ValueHandle::int(10)]),
        Err(EmbedError::NotInitialized(_))
    ));

    rt.run_entry().unwrap();
    assert_eq!(rt.get_static_field("Game", "score").unwrap().as_int(-1), 0);
    rt.call_static("Game", "addPoints", &[&ValueHandle::int(10)]).unwrap();
    assert_eq!(rt.get_static_field("Game", "score").unwrap().as_int(-1), 10);
}

#[test]
fn test_entry_runs_once() {
    let mut rt = started(RuntimeOptions::default());
    assert!(matches!(rt.run_entry(), Err(EmbedError::AlreadyInitialized(_))));
    assert!(matches!(
        rt.load_module(game_module(1)),
        Err(EmbedError::AlreadyInitialized(_))
    ));
}

#[test]
fn test_program_arguments() {
    let rt = loaded(RuntimeOptions::default());
    let args = rt.vm().map(|vm| vm.args().to_vec()).unwrap();
    assert_eq!(args, vec!["game".to_string()]);
}

#[test]
fn test_stats_and_collection() {
    let mut rt = started(RuntimeOptions::default());
    let before = rt.stats().unwrap();
    assert!(before.live_objects > 0);

    for i in 0..20 {
        rt.box_string(&format!("scratch {}", i)).unwrap();
    }
    let freed = rt.collect_garbage().unwrap();
    assert!(freed >= 20);

    let after = rt.stats().unwrap();
    assert!(after.gc.collections > before.gc.collections);
    assert_eq!(rt.get_static_field("Game", "score").unwrap().as_int(-1), 0);
}

#[test]
fn test_version() {
    assert_eq!(Runtime::version(), env!("CARGO_PKG_VERSION"));
}

#[test]
fn test_destroy_releases_roots() {
    let mut rt = started(RuntimeOptions::default());
    let heap = rt.vm().unwrap().heap_id();
    let name = rt.box_string("Ada").unwrap();
    let player = rt.new_instance("Player", &[&name, &ValueHandle::int(100)]).unwrap();
    assert_eq!(ember_core::gc::roots::count_for(heap), 1);
    drop(player);
    assert_eq!(ember_core::gc::roots::count_for(heap), 0);
    rt.destroy();
}
