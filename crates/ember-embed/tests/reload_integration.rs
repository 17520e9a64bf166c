//! Integration tests for hot reload
//!
//! Tests cover:
//! - Configuration order and strategy restrictions
//! - Patching from memory and from disk, with state kept
//! - Reload callbacks, generations and cached calls
//! - Rejected patches leaving the program untouched

mod common;

use common::*;
use ember_core::{ModuleBuilder, Opcode, TypeTag};
use ember_embed::{EmbedError, MemberAccess, ResolveStrategy, Runtime, RuntimeOptions, Status, ValueHandle};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

fn reloadable() -> Runtime {
    let mut rt = Runtime::new(RuntimeOptions::default());
    rt.initialize(&["game"]).unwrap();
    rt.enable_hot_reload(true).unwrap();
    rt.load_bytes(&game_image(1)).unwrap();
    rt.run_entry().unwrap();
    rt
}

fn bonus(rt: &mut Runtime) -> i32 {
    rt.call_static("Game", "bonus", &[]).unwrap().as_int(0)
}

#[test]
fn test_enable_must_precede_load() {
    let mut rt = loaded(RuntimeOptions::default());
    assert!(matches!(rt.enable_hot_reload(true), Err(EmbedError::AlreadyInitialized(_))));
    assert!(!rt.is_hot_reload_enabled());
}

#[test]
fn test_reflection_strategy_cannot_reload() {
    let mut rt = Runtime::new(RuntimeOptions {
        strategy: ResolveStrategy::Reflection,
        ..RuntimeOptions::default()
    });
    rt.initialize(&[]).unwrap();
    assert!(matches!(rt.enable_hot_reload(true), Err(EmbedError::NotImplemented(_))));
    assert_eq!(rt.last_status(), Status::NotImplemented);
    rt.enable_hot_reload(false).unwrap();
}

#[test]
fn test_reload_without_enable() {
    let mut rt = started(RuntimeOptions::default());
    assert!(matches!(rt.reload_bytes(&game_image(5)), Err(EmbedError::ReloadNotEnabled)));
    assert_eq!(rt.last_status(), Status::ReloadNotEnabled);
    assert!(!rt.check_for_reload().unwrap());
}

#[test]
fn test_reload_bytes_keeps_state() {
    let mut rt = reloadable();
    rt.call_static("Game", "addPoints", &[&ValueHandle::int(100)]).unwrap();
    let player = {
        let name = rt.box_string("Ada").unwrap();
        rt.new_instance("Player", &[&name, &ValueHandle::int(80)]).unwrap()
    };

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    rt.set_reload_callback(move |changed| sink.lock().unwrap().push(changed));

    assert_eq!(bonus(&mut rt), 1);
    let before = rt.generation();
    assert!(rt.reload_bytes(&game_image(5)).unwrap());
    assert_eq!(rt.generation(), before + 1);

    assert_eq!(bonus(&mut rt), 5);
    assert_eq!(rt.get_static_field("Game", "score").unwrap().as_int(-1), 100);
    let title = rt.get_static_field("Game", "title").unwrap();
    assert_eq!(rt.as_string(&title).as_deref(), Some("Ember"));
    assert_eq!(rt.call_method(&player, "damage", &[&ValueHandle::int(30)]).unwrap().as_int(0), 50);
    assert_eq!(*seen.lock().unwrap(), vec![true]);
}

#[test]
fn test_reload_same_image_changes_nothing() {
    let mut rt = reloadable();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    rt.set_reload_callback(move |changed| {
        assert!(!changed);
        counter.fetch_add(1, Ordering::SeqCst);
    });
    assert!(!rt.reload_bytes(&game_image(1)).unwrap());
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    rt.clear_reload_callback();
    rt.reload_bytes(&game_image(2)).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_cached_call_across_reload() {
    let mut rt = reloadable();
    let cached = rt.cache_static_method("Game", "bonus").unwrap();
    assert_eq!(rt.call_cached(&cached, &[]).unwrap().as_int(0), 1);

    rt.reload_bytes(&game_image(9)).unwrap();
    let via_cache = rt.call_cached(&cached, &[]).unwrap().as_int(0);
    assert_eq!(via_cache, 9);
    assert_eq!(via_cache, bonus(&mut rt));

    let fresh = rt.cache_static_method("Game", "bonus").unwrap();
    assert_eq!(fresh.generation(), rt.generation());
}

#[test]
fn test_reload_file_defaults_to_load_path() {
    let dir = TempDir::new().unwrap();
    let path = write_image(&dir, "game.ebc", &game_image(1));

    let mut rt = Runtime::new(RuntimeOptions::default());
    rt.initialize(&[]).unwrap();
    rt.enable_hot_reload(true).unwrap();
    rt.load_file(&path).unwrap();
    rt.run_entry().unwrap();

    write_image(&dir, "game.ebc", &game_image(3));
    assert!(rt.reload_file(None).unwrap());
    assert_eq!(bonus(&mut rt), 3);

    let other = write_image(&dir, "other.ebc", &game_image(4));
    assert!(rt.reload_file(Some(&other)).unwrap());
    assert_eq!(bonus(&mut rt), 4);

    assert!(matches!(
        rt.reload_file(Some(&dir.path().join("missing.ebc"))),
        Err(EmbedError::FileNotFound(_))
    ));
}

#[test]
fn test_reload_file_needs_a_source() {
    let mut rt = reloadable();
    assert!(matches!(rt.reload_file(None), Err(EmbedError::InvalidArgument(_))));
}

#[test]
fn test_check_for_reload_watches_size() {
    let dir = TempDir::new().unwrap();
    let path = write_image(&dir, "game.ebc", &game_image(1));

    let mut rt = Runtime::new(RuntimeOptions::default());
    rt.initialize(&[]).unwrap();
    rt.enable_hot_reload(true).unwrap();
    rt.load_file(&path).unwrap();
    rt.run_entry().unwrap();

    assert!(!rt.check_for_reload().unwrap());

    // A longer constant changes the encoded size
    write_image(&dir, "game.ebc", &game_image(12345));
    assert!(rt.check_for_reload().unwrap());
    assert_eq!(bonus(&mut rt), 12345);
    assert!(!rt.check_for_reload().unwrap());
}

#[test]
fn test_incompatible_patch_is_rejected() {
    let mut rt = reloadable();
    rt.call_static("Game", "addPoints", &[&ValueHandle::int(7)]).unwrap();
    let generation = rt.generation();

    let mut b = ModuleBuilder::new("game");
    let game = b.add_type("Game", None);
    b.add_static(game, "score", TypeTag::Int);
    b.add_static(game, "extra", TypeTag::Int);
    b.add_static_method(game, "bonus", &[], TypeTag::Int, 0, vec![Opcode::ConstI32(99), Opcode::Return]);
    let image = b.build().unwrap().encode().unwrap();

    assert!(matches!(rt.reload_bytes(&image), Err(EmbedError::ReloadFailed(_))));
    assert_eq!(rt.last_status(), Status::ReloadFailed);
    assert_eq!(rt.generation(), generation);
    assert_eq!(bonus(&mut rt), 1);
    assert_eq!(rt.get_static_field("Game", "score").unwrap().as_int(-1), 7);
}

#[test]
fn test_garbage_image_is_rejected() {
    let mut rt = reloadable();
    assert!(matches!(rt.reload_bytes(b"garbage"), Err(EmbedError::ReloadFailed(_))));
    assert_eq!(bonus(&mut rt), 1);
}
