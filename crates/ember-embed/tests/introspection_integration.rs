//! Integration tests for type introspection
//!
//! Tests cover:
//! - Looking up classes by name under both resolution strategies
//! - Declared fields, statics and methods
//! - Walking the class hierarchy
//! - Listing the type table

mod common;

use common::*;
use ember_core::TypeTag;
use ember_embed::{EmbedError, ResolveStrategy, Runtime, RuntimeOptions, Status, TypeKind};

#[test]
fn test_find_type_describes_class() {
    let mut rt = loaded(RuntimeOptions::default());
    let player = rt.find_type("Player").unwrap();

    assert_eq!(player.name, "Player");
    assert_eq!(player.kind, TypeKind::Object);
    assert_eq!(player.parent, None);

    let fields: Vec<(&str, &str)> = player
        .fields
        .iter()
        .map(|f| (f.name.as_str(), f.type_name.as_str()))
        .collect();
    assert_eq!(fields, [("name", "String"), ("health", "int")]);
    assert_eq!(player.field("name").unwrap().kind(), TypeKind::String);

    let damage = player.method("damage").unwrap();
    assert!(!damage.is_static);
    assert_eq!(damage.params, [TypeTag::Int]);
    assert_eq!(damage.ret, TypeTag::Int);
    assert!(player.method("describe").is_some());
}

#[test]
fn test_statics_and_static_methods() {
    let mut rt = started(RuntimeOptions::default());
    let game = rt.find_type("Game").unwrap();

    let statics: Vec<&str> = game.statics.iter().map(|f| f.name.as_str()).collect();
    assert_eq!(statics, ["score", "title", "started", "ticks", "hook"]);
    assert!(game.fields.is_empty());
    assert!(game.method("addPoints").unwrap().is_static);
    assert_eq!(game.method("bonus").unwrap().ret, TypeTag::Int);
    assert!(game.method("main").is_none());
}

#[test]
fn test_superclass_walk() {
    let mut rt = loaded(RuntimeOptions::default());
    let boss = rt.find_type("Boss").unwrap();
    assert_eq!(boss.parent.as_deref(), Some("Player"));
    assert!(boss.fields.is_empty());
    assert!(boss.methods.is_empty());

    let player = rt.superclass(&boss).unwrap().unwrap();
    assert_eq!(player.name, "Player");
    assert_eq!(player.fields.len(), 2);
    assert!(rt.superclass(&player).unwrap().is_none());
}

#[test]
fn test_list_types() {
    let mut rt = loaded(RuntimeOptions::default());
    let types = rt.list_types().unwrap();
    let names: Vec<&str> = types.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, ["String", "Game", "Player", "Boss"]);
    assert_eq!(types[0].kind, TypeKind::String);
    assert!(types.iter().enumerate().all(|(i, t)| t.id as usize == i));
}

#[test]
fn test_lookup_failures() {
    let mut rt = Runtime::new(RuntimeOptions::default());
    assert!(matches!(rt.list_types(), Err(EmbedError::NotInitialized(_))));
    rt.initialize(&[]).unwrap();
    assert!(matches!(rt.find_type("Game"), Err(EmbedError::NotInitialized(_))));

    let mut rt = loaded(RuntimeOptions::default());
    assert!(matches!(rt.find_type("Dragon"), Err(EmbedError::TypeNotFound(_))));
    assert_eq!(rt.last_status(), Status::TypeNotFound);
    rt.find_type("Game").unwrap();
    assert_eq!(rt.last_error(), None);
}

#[test]
fn test_reflection_strategy_lookup() {
    let mut rt = loaded(RuntimeOptions {
        strategy: ResolveStrategy::Reflection,
        ..RuntimeOptions::default()
    });
    let boss = rt.find_type("Boss").unwrap();
    let player = rt.superclass(&boss).unwrap().unwrap();
    assert_eq!(player.field("health").unwrap().ty, TypeTag::Int);
}

#[test]
fn test_snapshot_survives_reload() {
    let mut rt = Runtime::new(RuntimeOptions::default());
    rt.initialize(&[]).unwrap();
    rt.enable_hot_reload(true).unwrap();
    rt.load_bytes(&game_image(1)).unwrap();
    rt.run_entry().unwrap();

    let before = rt.find_type("Game").unwrap();
    rt.reload_bytes(&game_image(2)).unwrap();
    let after = rt.find_type("Game").unwrap();
    assert_eq!(before.statics, after.statics);
    assert_eq!(before.methods.len(), after.methods.len());
}
