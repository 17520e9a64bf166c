//! Integration tests for in-place code patching

use ember_core::{Module, ModuleBuilder, Opcode, TypeTag, Value, Vm, VmError, VmOptions};

/// `Config.value()` returns `value`; the static initializer stores `init`
/// into `Config.initialized`.
fn config(value: i32, init: i32, with_extra: bool) -> Module {
    let mut b = ModuleBuilder::new("config");
    let ty = b.add_type("Config", None);
    let initialized = b.add_static(ty, "initialized", TypeTag::Int);
    b.add_static_init(
        ty,
        0,
        vec![
            Opcode::ConstI32(init),
            Opcode::SetStatic { ty, slot: initialized },
            Opcode::ReturnVoid,
        ],
    );
    let label = b.intern("label");
    if with_extra {
        b.add_static_method(ty, "extra", &[], TypeTag::String, 0, vec![Opcode::ConstStr(label), Opcode::Return]);
    }
    b.add_static_method(
        ty,
        "value",
        &[],
        TypeTag::Int,
        0,
        vec![Opcode::ConstI32(value), Opcode::Return],
    );
    b.build().unwrap()
}

fn call_static(vm: &mut Vm, name: &str) -> Result<Value, VmError> {
    let ty = vm.find_type("Config").unwrap();
    let func = vm.find_static_method(ty, name).ok_or_else(|| VmError::MethodNotFound(name.to_string()))?;
    vm.with_native_scope(|vm| vm.call_function(func, None, &[]))
}

#[test]
fn test_patch_replaces_bodies_and_keeps_statics() {
    let mut vm = Vm::new(VmOptions::default());
    vm.load(config(1, 10, false), true).unwrap();
    vm.with_native_scope(|vm| vm.run_entry()).unwrap();

    let ty = vm.find_type("Config").unwrap();
    assert_eq!(call_static(&mut vm, "value").unwrap().as_i32(), Some(1));
    assert_eq!(vm.get_static(ty, 0).unwrap().as_i32(), Some(10));

    assert!(vm.patch(config(2, 99, true)).unwrap());

    assert_eq!(call_static(&mut vm, "value").unwrap().as_i32(), Some(2));
    assert_eq!(vm.get_static(ty, 0).unwrap().as_i32(), Some(10));

    let extra = vm
        .with_native_scope(|vm| {
            let v = call_static(vm, "extra")?;
            Ok::<_, VmError>(vm.text_of(v))
        })
        .unwrap();
    assert_eq!(extra.as_deref(), Some("label"));
}

#[test]
fn test_identical_patch_reports_no_change() {
    let mut vm = Vm::new(VmOptions::default());
    vm.load(config(1, 10, false), true).unwrap();
    assert!(!vm.patch(config(1, 10, false)).unwrap());
}

#[test]
fn test_patch_requires_hot_reload() {
    let mut vm = Vm::new(VmOptions::default());
    vm.load(config(1, 10, false), false).unwrap();
    assert!(matches!(vm.patch(config(2, 10, false)), Err(VmError::ReloadNotEnabled)));
}

#[test]
fn test_patch_from_image_round_trip() {
    let mut vm = Vm::new(VmOptions::default());
    vm.load(config(1, 10, false), true).unwrap();
    vm.with_native_scope(|vm| vm.run_entry()).unwrap();

    let image = config(5, 10, false).encode().unwrap();
    let decoded = Module::decode(&image).unwrap();
    assert!(vm.patch(decoded).unwrap());
    assert_eq!(call_static(&mut vm, "value").unwrap().as_i32(), Some(5));
}
