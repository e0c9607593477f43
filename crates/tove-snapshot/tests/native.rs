//! Re-resolution of native closures, classes, and instances.

use std::any::Any;
use std::rc::Rc;

use pretty_assertions::assert_eq;
use tove_runtime::{
    ByteBuffer, Class, Instance, InstanceState, NativeClassDesc, NativeClassRegistry,
    NativeClosure, NativeInstance, Object, Value, Vm,
};
use tove_snapshot::{
    restore_state, save_state, Binder, Diagnostic, RestoreOptions, SaveOptions, SnapshotError,
};

fn new_vm() -> Vm {
    Vm::new(Rc::new(NativeClassRegistry::new()))
}

fn host_nop(_vm: &mut Vm, _args: &[Value]) -> Value {
    Value::Null
}

fn save(vm: &Vm) -> ByteBuffer {
    let mut buf = ByteBuffer::new();
    save_state(vm, &mut buf, &SaveOptions::default()).expect("save failed");
    buf
}

fn global(vm: &Vm, name: &str) -> Value {
    vm.get_global(name)
        .unwrap_or_else(|| panic!("missing global {name}"))
}

fn native_instance(desc: Rc<NativeClassDesc>, ident: Option<&str>) -> Value {
    let class = Value::object(Object::Class(Class::Native(desc)));
    Value::object(Object::Instance(Instance {
        class,
        state: InstanceState::Native(NativeInstance {
            ident: ident.map(Rc::from),
            refcounted: true,
            host: Some(Rc::new(0i32)),
        }),
    }))
}

#[test]
fn test_named_native_closure_re_resolves() {
    let mut src = new_vm();
    src.set_global(
        "print",
        Value::object(Object::NativeClosure(NativeClosure::named("print", host_nop))),
    );
    let mut buf = save(&src);

    // The destination registered its own `print` before the restore; the
    // snapshot must resolve to that one, not reconstruct the source's.
    let mut dst = new_vm();
    dst.set_global(
        "print",
        Value::object(Object::NativeClosure(NativeClosure::named("print", host_nop))),
    );
    let existing = global(&dst, "print");

    let report =
        restore_state(&mut dst, &mut buf, &(), &RestoreOptions::default()).expect("restore failed");
    assert!(report.diagnostics.is_empty());
    assert_eq!(global(&dst, "print").identity(), existing.identity());
}

#[test]
fn test_missing_native_closure_degrades_to_null() {
    let mut src = new_vm();
    src.set_global(
        "print",
        Value::object(Object::NativeClosure(NativeClosure::named("print", host_nop))),
    );
    let mut buf = save(&src);

    let mut dst = new_vm();
    let report =
        restore_state(&mut dst, &mut buf, &(), &RestoreOptions::default()).expect("restore failed");
    assert_eq!(global(&dst, "print"), Value::Null);
    assert_eq!(
        report.diagnostics,
        vec![Diagnostic::UnresolvedNamedBinding {
            name: "print".to_string()
        }]
    );
}

#[test]
fn test_missing_native_closure_fails_strict_restore() {
    let mut src = new_vm();
    src.set_global(
        "print",
        Value::object(Object::NativeClosure(NativeClosure::named("print", host_nop))),
    );
    let mut buf = save(&src);

    let mut dst = new_vm();
    let err = restore_state(&mut dst, &mut buf, &(), &RestoreOptions { strict: true })
        .unwrap_err();
    assert!(matches!(err, SnapshotError::Unresolved(name) if name == "print"));
}

#[test]
fn test_anonymous_native_closure_drops_to_null() {
    let mut src = new_vm();
    src.set_global(
        "anon",
        Value::object(Object::NativeClosure(NativeClosure::anonymous(host_nop))),
    );

    let mut buf = ByteBuffer::new();
    let report = save_state(&src, &mut buf, &SaveOptions::default()).expect("save failed");
    assert_eq!(report.diagnostics, vec![Diagnostic::UnencodableClosure]);

    let mut dst = new_vm();
    restore_state(&mut dst, &mut buf, &(), &RestoreOptions::default()).expect("restore failed");
    assert_eq!(global(&dst, "anon"), Value::Null);
}

#[test]
fn test_bound_native_closure_fails_strict_save() {
    let mut src = new_vm();
    let mut nc = NativeClosure::named("method", host_nop);
    nc.bound_to_instance = true;
    src.set_global("m", Value::object(Object::NativeClosure(nc)));

    let mut buf = ByteBuffer::new();
    let err = save_state(&src, &mut buf, &SaveOptions { strict: true }).unwrap_err();
    assert!(matches!(err, SnapshotError::UnencodableClosure));
}

struct FileBinder;

impl Binder for FileBinder {
    fn resolve(&self, class: &NativeClassDesc, ident: &str) -> Option<Rc<dyn Any>> {
        if &*class.name == "File" && ident == "obj_42" {
            Some(Rc::new(42i32) as Rc<dyn Any>)
        } else {
            None
        }
    }
}

#[test]
fn test_native_instance_rebinds_through_binder() {
    let src = new_vm();
    let desc = src.registry.register("File", false);
    let inst = native_instance(desc, Some("obj_42"));
    let mut src = src;
    src.set_global("f", inst);
    let mut buf = save(&src);

    let mut dst = new_vm();
    dst.registry.register("File", false);
    let report = restore_state(&mut dst, &mut buf, &FileBinder, &RestoreOptions::default())
        .expect("restore failed");
    assert!(report.diagnostics.is_empty());

    let f = global(&dst, "f");
    let rc = f.as_object().unwrap();
    let obj = rc.borrow();
    let Object::Instance(inst) = &*obj else {
        panic!("not an instance");
    };
    let InstanceState::Native(native) = &inst.state else {
        panic!("not a native instance");
    };
    assert_eq!(native.ident.as_deref(), Some("obj_42"));
    assert!(native.refcounted);
    let host = native.host.as_ref().expect("host rebound");
    assert_eq!(host.downcast_ref::<i32>(), Some(&42));
}

#[test]
fn test_unbound_native_instance_is_diagnosed() {
    let src = new_vm();
    let desc = src.registry.register("File", false);
    let inst = native_instance(desc, Some("obj_42"));
    let mut src = src;
    src.set_global("f", inst);
    let mut buf = save(&src);

    // The null binder never rebinds; the instance survives, hostless.
    let mut dst = new_vm();
    dst.registry.register("File", false);
    let report =
        restore_state(&mut dst, &mut buf, &(), &RestoreOptions::default()).expect("restore failed");
    assert_eq!(
        report.diagnostics,
        vec![Diagnostic::UnbindableInstance {
            ident: "obj_42".to_string()
        }]
    );

    let f = global(&dst, "f");
    let rc = f.as_object().unwrap();
    let obj = rc.borrow();
    let Object::Instance(inst) = &*obj else {
        panic!("not an instance");
    };
    let InstanceState::Native(native) = &inst.state else {
        panic!("not a native instance");
    };
    assert!(native.host.is_none());
}

#[test]
fn test_unbound_native_instance_fails_strict_restore() {
    let src = new_vm();
    let desc = src.registry.register("File", false);
    let inst = native_instance(desc, Some("obj_42"));
    let mut src = src;
    src.set_global("f", inst);
    let mut buf = save(&src);

    let mut dst = new_vm();
    dst.registry.register("File", false);
    let err = restore_state(&mut dst, &mut buf, &(), &RestoreOptions { strict: true })
        .unwrap_err();
    assert!(matches!(err, SnapshotError::Unbindable(_)));
}

#[test]
fn test_instance_without_ident_is_diagnosed_at_save() {
    let src = new_vm();
    let desc = src.registry.register("File", false);
    let inst = native_instance(desc, None);
    let mut src = src;
    src.set_global("f", inst);

    let mut buf = ByteBuffer::new();
    let report = save_state(&src, &mut buf, &SaveOptions::default()).expect("save failed");
    assert_eq!(
        report.diagnostics,
        vec![Diagnostic::UnbindableInstance {
            ident: String::new()
        }]
    );

    let err = save_state(&src, &mut ByteBuffer::new(), &SaveOptions { strict: true }).unwrap_err();
    assert!(matches!(err, SnapshotError::Unbindable(_)));
}

#[test]
fn test_singleton_rebinds_to_live_instance() {
    let src = new_vm();
    let desc = src.registry.register("App", true);
    let inst = native_instance(desc, None);
    let mut src = src;
    src.set_global("app", inst);
    let mut buf = save(&src);

    let dst = new_vm();
    let desc = dst.registry.register("App", true);
    let live = native_instance(desc, None);
    dst.registry.track_instance(live.as_object().unwrap());

    let mut dst = dst;
    let report =
        restore_state(&mut dst, &mut buf, &(), &RestoreOptions::default()).expect("restore failed");
    assert!(report.diagnostics.is_empty());
    assert_eq!(global(&dst, "app").identity(), live.identity());
}

#[test]
fn test_singleton_without_live_instance_degrades_to_null() {
    let src = new_vm();
    let desc = src.registry.register("App", true);
    let inst = native_instance(desc, None);
    let mut src = src;
    src.set_global("app", inst);
    let mut buf = save(&src);

    let mut dst = new_vm();
    dst.registry.register("App", true);
    let report =
        restore_state(&mut dst, &mut buf, &(), &RestoreOptions::default()).expect("restore failed");
    assert_eq!(global(&dst, "app"), Value::Null);
    assert_eq!(report.diagnostics.len(), 1);
}

#[test]
fn test_unregistered_native_class_degrades_to_null() {
    let src = new_vm();
    let desc = src.registry.register("File", false);
    let class = Value::object(Object::Class(Class::Native(desc)));
    let mut src = src;
    src.set_global("File", class);
    let mut buf = save(&src);

    // Destination never registered the class.
    let mut dst = new_vm();
    let report =
        restore_state(&mut dst, &mut buf, &(), &RestoreOptions::default()).expect("restore failed");
    assert_eq!(global(&dst, "File"), Value::Null);
    assert_eq!(
        report.diagnostics,
        vec![Diagnostic::UnresolvedNamedBinding {
            name: "File".to_string()
        }]
    );
}

#[test]
fn test_instance_of_unregistered_class_is_corrupt() {
    let src = new_vm();
    let desc = src.registry.register("File", false);
    let inst = native_instance(desc, Some("obj_42"));
    let mut src = src;
    src.set_global("f", inst);
    let mut buf = save(&src);

    // Without the class descriptor the instance body cannot be parsed, so
    // this is a hard error even in lenient mode.
    let mut dst = new_vm();
    let err = restore_state(&mut dst, &mut buf, &(), &RestoreOptions::default()).unwrap_err();
    assert!(matches!(err, SnapshotError::Corrupt(_)), "{err:?}");
}
