//! Save/restore of suspended fibers and generators.

use std::rc::Rc;

use pretty_assertions::assert_eq;
use tove_runtime::{
    ByteBuffer, CallFrame, Closure, ExceptionTrap, Fiber, FunctionProto, Generator,
    GeneratorStatus, Instruction, NativeClassRegistry, Object, Value, Vm,
};
use tove_snapshot::{restore_state, save_state, RestoreOptions, SaveOptions, SnapshotError};

fn new_vm() -> Vm {
    Vm::new(Rc::new(NativeClassRegistry::new()))
}

/// A closure over a proto with `n_instr` instructions, enough for a frame.
fn make_closure(n_instr: usize) -> Value {
    let proto = FunctionProto {
        instructions: vec![Instruction::default(); n_instr],
        stack_size: 8,
        ..Default::default()
    };
    Value::object(Object::Closure(Closure {
        proto: Value::object(Object::Proto(proto)),
        ..Default::default()
    }))
}

fn make_frame(closure: Value, ip: u32) -> CallFrame {
    CallFrame {
        closure,
        generator: None,
        ip,
        traps: Vec::new(),
        prev_stack_base: 0,
        prev_top: 0,
        target: 0,
        n_calls: 1,
        is_root: true,
    }
}

fn roundtrip(src: &Vm) -> Vm {
    let mut buf = ByteBuffer::new();
    save_state(src, &mut buf, &SaveOptions::default()).expect("save failed");
    let mut dst = new_vm();
    restore_state(&mut dst, &mut buf, &(), &RestoreOptions::default()).expect("restore failed");
    dst
}

fn global(vm: &Vm, name: &str) -> Value {
    vm.get_global(name)
        .unwrap_or_else(|| panic!("missing global {name}"))
}

#[test]
fn test_suspended_fiber_round_trips() {
    let mut vm = new_vm();

    let mut fiber = Fiber::with_capacity(8);
    fiber.push(Value::Int(11));
    fiber.push(Value::str("local"));
    let mut frame = make_frame(make_closure(10), 4);
    frame.traps.push(ExceptionTrap {
        stack_size: 2,
        stack_base: 0,
        handler: 7,
        target: 1,
    });
    fiber.frames.push(frame);
    fiber.native_calls = 5;
    fiber.meta_calls = 2;
    fiber.suspended = true;
    fiber.suspended_root = false;
    fiber.suspend_target = 3;
    fiber.suspend_traps = 1;
    vm.set_global("th", Value::object(Object::Fiber(fiber)));

    let dst = roundtrip(&vm);
    let th = global(&dst, "th");
    let rc = th.as_object().unwrap();
    let obj = rc.borrow();
    let Object::Fiber(f) = &*obj else {
        panic!("not a fiber");
    };

    assert_eq!(f.stack.len(), 8);
    assert_eq!(f.top, 2);
    assert_eq!(f.stack[0], Value::Int(11));
    assert_eq!(f.stack[1], Value::str("local"));
    // Dead slots above top come back as Null.
    assert_eq!(f.stack[2], Value::Null);

    assert_eq!(f.frames.len(), 1);
    let frame = &f.frames[0];
    assert_eq!(frame.ip, 4);
    assert_eq!(frame.n_calls, 1);
    assert!(frame.is_root);
    assert_eq!(
        frame.traps[0],
        ExceptionTrap {
            stack_size: 2,
            stack_base: 0,
            handler: 7,
            target: 1,
        }
    );

    assert_eq!(f.native_calls, 5);
    assert_eq!(f.meta_calls, 2);
    assert!(f.suspended);
    assert!(!f.suspended_root);
    assert_eq!(f.suspend_target, 3);
    assert_eq!(f.suspend_traps, 1);
}

#[test]
fn test_fiber_stack_values_share_with_globals() {
    let mut vm = new_vm();
    let shared = Value::object(Object::Array(vec![Value::Int(1)]));
    let mut fiber = Fiber::with_capacity(4);
    fiber.push(shared.clone());
    fiber.frames.push(make_frame(make_closure(3), 0));
    vm.set_global("th", Value::object(Object::Fiber(fiber)));
    vm.set_global("shared", shared);

    let dst = roundtrip(&vm);
    let shared = global(&dst, "shared");
    let th = global(&dst, "th");
    let rc = th.as_object().unwrap();
    let obj = rc.borrow();
    let Object::Fiber(f) = &*obj else {
        panic!("not a fiber");
    };
    assert_eq!(f.stack[0].identity(), shared.identity());
}

#[test]
fn test_dead_generator_restores_as_null() {
    let mut vm = new_vm();
    vm.set_global(
        "g",
        Value::object(Object::Generator(Generator {
            status: GeneratorStatus::Dead,
            exec: Fiber::new(),
        })),
    );

    let dst = roundtrip(&vm);
    assert_eq!(global(&dst, "g"), Value::Null);
}

#[test]
fn test_suspended_generator_round_trips() {
    let mut vm = new_vm();
    let mut exec = Fiber::with_capacity(4);
    exec.push(Value::Int(7));
    exec.frames.push(make_frame(make_closure(5), 2));
    exec.suspended = true;
    vm.set_global("g", Value::object(Object::Generator(Generator::suspended(exec))));

    let dst = roundtrip(&vm);
    let g = global(&dst, "g");
    let rc = g.as_object().unwrap();
    let obj = rc.borrow();
    let Object::Generator(generator) = &*obj else {
        panic!("not a generator");
    };
    assert_eq!(generator.status, GeneratorStatus::Suspended);
    assert_eq!(generator.exec.top, 1);
    assert_eq!(generator.exec.stack[0], Value::Int(7));
    assert_eq!(generator.exec.frames[0].ip, 2);
}

#[test]
fn test_running_generator_rejects_save() {
    let mut vm = new_vm();
    vm.set_global(
        "g",
        Value::object(Object::Generator(Generator {
            status: GeneratorStatus::Running,
            exec: Fiber::new(),
        })),
    );

    let mut buf = ByteBuffer::new();
    let err = save_state(&vm, &mut buf, &SaveOptions::default()).unwrap_err();
    assert!(matches!(err, SnapshotError::VmActive));
}

#[test]
fn test_out_of_range_ip_rejected_on_restore() {
    let mut vm = new_vm();
    let mut fiber = Fiber::with_capacity(2);
    fiber.frames.push(make_frame(make_closure(5), 10));
    vm.set_global("th", Value::object(Object::Fiber(fiber)));

    let mut buf = ByteBuffer::new();
    save_state(&vm, &mut buf, &SaveOptions::default()).expect("save failed");
    let mut dst = new_vm();
    let err = restore_state(&mut dst, &mut buf, &(), &RestoreOptions::default()).unwrap_err();
    assert!(matches!(err, SnapshotError::Corrupt(_)), "{err:?}");
}

#[test]
fn test_out_of_range_trap_handler_rejected_on_restore() {
    let mut vm = new_vm();
    let mut fiber = Fiber::with_capacity(2);
    let mut frame = make_frame(make_closure(5), 1);
    frame.traps.push(ExceptionTrap {
        stack_size: 0,
        stack_base: 0,
        handler: 100,
        target: 0,
    });
    fiber.frames.push(frame);
    vm.set_global("th", Value::object(Object::Fiber(fiber)));

    let mut buf = ByteBuffer::new();
    save_state(&vm, &mut buf, &SaveOptions::default()).expect("save failed");
    let mut dst = new_vm();
    let err = restore_state(&mut dst, &mut buf, &(), &RestoreOptions::default()).unwrap_err();
    assert!(matches!(err, SnapshotError::Corrupt(_)), "{err:?}");
}
