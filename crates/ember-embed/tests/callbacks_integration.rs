//! Integration tests for host callbacks
//!
//! Tests cover:
//! - Registering callbacks and handing them to guest code
//! - Registry limits
//! - Errors raised by callbacks
//! - Re-entering the runtime from inside a callback
//! - Typed callbacks

mod common;

use common::*;
use ember_core::TypeTag;
use ember_embed::{EmbedError, GuestContext, MemberAccess, Runtime, RuntimeOptions, Status, ValueHandle};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn with_double(rt: &mut Runtime) {
    rt.register_callback("double", 1, |_ctx, args| Ok(ValueHandle::int(args[0].as_int(0) * 2)))
        .unwrap();
    let cb = rt.callback("double").unwrap();
    rt.set_static_field("Game", "hook", &cb).unwrap();
}

#[test]
fn test_guest_calls_callback() {
    let mut rt = started(RuntimeOptions::default());
    with_double(&mut rt);
    let result = rt.call_static("Game", "useHook", &[&ValueHandle::int(21)]).unwrap();
    assert_eq!(result.as_int(0), 42);
}

#[test]
fn test_host_calls_callback_closure() {
    let mut rt = started(RuntimeOptions::default());
    with_double(&mut rt);
    let cb = rt.callback("double").unwrap();
    assert!(cb.is_rooted());
    assert_eq!(rt.call_closure(&cb, &[&ValueHandle::int(5)]).unwrap().as_int(0), 10);
    assert!(matches!(
        rt.call_closure(&cb, &[]),
        Err(EmbedError::ArgumentCount { expected: 1, got: 0, .. })
    ));
}

#[test]
fn test_registry_limits() {
    let mut rt = started(RuntimeOptions::default());
    let noop = |_: &mut GuestContext<'_>, _: &[ValueHandle]| -> ember_embed::Result<ValueHandle> { Ok(ValueHandle::null()) };

    rt.register_callback("noop", 0, noop).unwrap();
    assert_eq!(rt.callback_count(), 1);

    assert!(matches!(rt.register_callback("noop", 0, noop), Err(EmbedError::InvalidArgument(_))));
    assert!(matches!(rt.register_callback("wide", 5, noop), Err(EmbedError::InvalidArgument(_))));
    assert!(matches!(rt.register_callback("", 0, noop), Err(EmbedError::InvalidArgument(_))));
    assert_eq!(rt.last_status(), Status::InvalidArgument);
    rt.register_callback("four", 4, noop).unwrap();
    assert_eq!(rt.callback_count(), 2);

    assert!(matches!(rt.unregister_callback("missing"), Err(EmbedError::MethodNotFound(_))));
    rt.unregister_callback("noop").unwrap();
    assert_eq!(rt.callback_count(), 1);
    assert!(matches!(rt.callback("noop"), Err(EmbedError::MethodNotFound(_))));
}

#[test]
fn test_registration_requires_initialize() {
    let mut rt = Runtime::new(RuntimeOptions::default());
    assert!(matches!(
        rt.register_callback("early", 0, |_, _| Ok(ValueHandle::null())),
        Err(EmbedError::NotInitialized(_))
    ));
}

#[test]
fn test_callback_error_becomes_exception() {
    let mut rt = started(RuntimeOptions::default());
    rt.register_callback("refuse", 1, |_ctx, _args| {
        Err(EmbedError::InvalidArgument("nope".to_string()))
    })
    .unwrap();
    let cb = rt.callback("refuse").unwrap();
    rt.set_static_field("Game", "hook", &cb).unwrap();

    let err = rt.call_static("Game", "useHook", &[&ValueHandle::int(1)]).unwrap_err();
    assert!(matches!(err, EmbedError::Exception { .. }));
    assert!(rt.exception_message().unwrap().contains("nope"));
    assert!(rt.exception_stack().unwrap().contains("refuse"));
}

#[test]
fn test_callback_panic_becomes_exception() {
    let mut rt = started(RuntimeOptions::default());
    rt.register_callback("explode", 1, |_ctx, _args| panic!("kaboom")).unwrap();
    let cb = rt.callback("explode").unwrap();
    rt.set_static_field("Game", "hook", &cb).unwrap();

    assert!(rt.call_static("Game", "useHook", &[&ValueHandle::int(1)]).is_err());
    assert!(rt.exception_message().unwrap().contains("kaboom"));

    // The runtime stays usable
    assert_eq!(rt.call_static("Game", "getScore", &[]).unwrap().as_int(-1), 0);
}

#[test]
fn test_callback_reenters_runtime() {
    let mut rt = started(RuntimeOptions::default());
    rt.register_callback("award", 1, |ctx, args| {
        ctx.call_static("Game", "addPoints", &[&args[0]])?;
        ctx.get_static_field("Game", "score")
    })
    .unwrap();
    let cb = rt.callback("award").unwrap();
    rt.set_static_field("Game", "hook", &cb).unwrap();

    let first = rt.call_static("Game", "useHook", &[&ValueHandle::int(10)]).unwrap();
    let second = rt.call_static("Game", "useHook", &[&ValueHandle::int(5)]).unwrap();
    assert_eq!(first.as_int(0), 10);
    assert_eq!(second.as_int(0), 15);
}

#[test]
fn test_callback_builds_instances() {
    let mut rt = started(RuntimeOptions::default());
    rt.register_callback("spawn", 1, |ctx, args| {
        let name = ctx.box_string("Minion")?;
        let minion = ctx.new_instance("Player", &[&name, &args[0]])?;
        ctx.call_method(&minion, "describe", &[])
    })
    .unwrap();
    let cb = rt.callback("spawn").unwrap();
    rt.set_static_field("Game", "hook", &cb).unwrap();

    let text = rt.call_static("Game", "useHook", &[&ValueHandle::int(3)]).unwrap();
    assert_eq!(rt.as_string(&text).as_deref(), Some("Minion: 3"));
}

#[test]
fn test_typed_callback() {
    let mut rt = started(RuntimeOptions::default());
    rt.register_typed_callback("label", &[TypeTag::Int], TypeTag::String, |ctx, args| {
        ctx.box_string(&format!("#{}", args[0].as_int(0)))
    })
    .unwrap();
    let cb = rt.callback("label").unwrap();
    rt.set_static_field("Game", "hook", &cb).unwrap();

    let text = rt.call_static("Game", "useHook", &[&ValueHandle::int(7)]).unwrap();
    assert!(rt.vm().unwrap().is_string(text.raw()));
    assert_eq!(rt.as_string(&text).as_deref(), Some("#7"));

    let wrong = rt.box_string("seven").unwrap();
    assert!(matches!(
        rt.call_static("Game", "useHook", &[&wrong]),
        Err(EmbedError::TypeMismatch(_))
    ));
    assert_eq!(rt.last_status(), Status::TypeMismatch);
}

#[test]
fn test_callback_invocation_count() {
    let mut rt = started(RuntimeOptions::default());
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&calls);
    rt.register_callback("count", 1, move |_ctx, args| {
        seen.fetch_add(1, Ordering::SeqCst);
        Ok(ValueHandle::int(args[0].as_int(0)))
    })
    .unwrap();
    let cb = rt.callback("count").unwrap();
    rt.set_static_field("Game", "hook", &cb).unwrap();

    for i in 0..5 {
        rt.call_static("Game", "useHook", &[&ValueHandle::int(i)]).unwrap();
    }
    assert_eq!(calls.load(Ordering::SeqCst), 5);
}

#[test]
fn test_unregistered_closure_keeps_working_while_referenced() {
    let mut rt = started(RuntimeOptions::default());
    with_double(&mut rt);
    rt.unregister_callback("double").unwrap();
    rt.collect_garbage().unwrap();

    // Game.hook still references the closure
    let result = rt.call_static("Game", "useHook", &[&ValueHandle::int(4)]).unwrap();
    assert_eq!(result.as_int(0), 8);
}
