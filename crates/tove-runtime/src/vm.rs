//! The VM execution context the snapshot engine captures and restores.

use std::rc::Rc;

use crate::fiber::CallFrame;
use crate::objects::Table;
use crate::registry::NativeClassRegistry;
use crate::value::{HeapRef, Object, Value};

/// A single-threaded, cooperatively scheduled execution context.
///
/// Only the state the snapshot engine touches lives here: the root
/// namespace, the value stack, and the call-frame stack used for the
/// quiescence check. The interpreter drives it from outside.
pub struct Vm {
    /// Root namespace; always a `Kind::Table` object.
    pub root: Value,
    pub stack: Vec<Value>,
    /// Logical stack top; slots at `top` and above are dead.
    pub top: usize,
    pub stack_base: usize,
    /// Live call frames. Snapshot/restore is only legal when this is empty.
    pub frames: Vec<CallFrame>,
    pub registry: Rc<NativeClassRegistry>,
}

impl Vm {
    pub fn new(registry: Rc<NativeClassRegistry>) -> Self {
        Self {
            root: Value::object(Object::Table(Table::new())),
            stack: Vec::new(),
            top: 0,
            stack_base: 0,
            frames: Vec::new(),
            registry,
        }
    }

    /// The root namespace object.
    ///
    /// Panics if `root` was replaced with a non-table, which no supported
    /// operation does.
    pub fn root_table(&self) -> HeapRef {
        match &self.root {
            Value::Object(rc) => rc.clone(),
            _ => unreachable!("vm root is always a table"),
        }
    }

    pub fn is_idle(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn set_global(&mut self, name: &str, val: Value) {
        let root = self.root_table();
        let mut root_ref = root.borrow_mut();
        if let Object::Table(table) = &mut *root_ref {
            table.set(Value::str(name), val);
        }
    }

    pub fn get_global(&self, name: &str) -> Option<Value> {
        let root = self.root_table();
        let root_ref = root.borrow();
        match &*root_ref {
            Object::Table(table) => table.get(&Value::str(name)).cloned(),
            _ => None,
        }
    }

    /// Push a value onto the live stack, growing the physical stack if
    /// needed.
    pub fn push(&mut self, val: Value) {
        if self.top == self.stack.len() {
            self.stack.push(Value::Null);
        }
        self.stack[self.top] = val;
        self.top += 1;
    }
}
