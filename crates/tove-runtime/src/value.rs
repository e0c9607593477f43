//! Heap value model: tagged values, shared heap objects, identity.

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::{Rc, Weak};

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::fiber::{Fiber, Generator};
use crate::objects::{Class, Closure, Instance, NativeClosure, Table};
use crate::proto::FunctionProto;

/// Runtime type classification. Also the 4-byte record tag on the wire, so
/// the discriminant values are stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u32)]
pub enum Kind {
    Null = 0x01,
    Bool = 0x02,
    Int = 0x03,
    Float = 0x04,
    Str = 0x05,
    Table = 0x06,
    Array = 0x07,
    Proto = 0x08,
    Closure = 0x09,
    NativeClosure = 0x0a,
    Class = 0x0b,
    Instance = 0x0c,
    WeakRef = 0x0d,
    Upvalue = 0x0e,
    Thread = 0x0f,
    Generator = 0x10,
    Opaque = 0x11,
}

/// Shared, potentially cyclic heap object.
pub type HeapRef = Rc<RefCell<Object>>;

/// Non-owning handle to a heap object.
pub type WeakHeapRef = Weak<RefCell<Object>>;

/// Heap object payloads. Everything here is allocated once and referenced
/// through `HeapRef` handles; cycles are legal.
pub enum Object {
    Table(Table),
    Array(Vec<Value>),
    Proto(FunctionProto),
    Closure(Closure),
    NativeClosure(NativeClosure),
    Class(Class),
    Instance(Instance),
    /// Indirection cell shared between an enclosing scope and inner closures.
    Upvalue(Value),
    Fiber(Fiber),
    Generator(Generator),
    /// Opaque host resource with no re-binding contract.
    Opaque(Rc<dyn Any>),
}

impl Object {
    pub fn kind(&self) -> Kind {
        match self {
            Object::Table(_) => Kind::Table,
            Object::Array(_) => Kind::Array,
            Object::Proto(_) => Kind::Proto,
            Object::Closure(_) => Kind::Closure,
            Object::NativeClosure(_) => Kind::NativeClosure,
            Object::Class(_) => Kind::Class,
            Object::Instance(_) => Kind::Instance,
            Object::Upvalue(_) => Kind::Upvalue,
            Object::Fiber(_) => Kind::Thread,
            Object::Generator(_) => Kind::Generator,
            Object::Opaque(_) => Kind::Opaque,
        }
    }
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind())
    }
}

/// A dynamically-typed value. Primitives are stored inline; everything else
/// lives behind a shared heap handle.
#[derive(Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    /// Immutable byte string; embedded NUL bytes are legal.
    Str(Rc<Vec<u8>>),
    Object(HeapRef),
    Weak(WeakHeapRef),
}

impl Value {
    /// Allocate a fresh heap object and wrap it.
    pub fn object(obj: Object) -> Value {
        Value::Object(Rc::new(RefCell::new(obj)))
    }

    pub fn str(s: &str) -> Value {
        Value::Str(Rc::new(s.as_bytes().to_vec()))
    }

    pub fn bytes(b: Vec<u8>) -> Value {
        Value::Str(Rc::new(b))
    }

    pub fn kind(&self) -> Kind {
        match self {
            Value::Null => Kind::Null,
            Value::Bool(_) => Kind::Bool,
            Value::Int(_) => Kind::Int,
            Value::Float(_) => Kind::Float,
            Value::Str(_) => Kind::Str,
            Value::Object(rc) => rc.borrow().kind(),
            Value::Weak(_) => Kind::WeakRef,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_object(&self) -> Option<&HeapRef> {
        match self {
            Value::Object(rc) => Some(rc),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&[u8]> {
        match self {
            Value::Str(s) => Some(s.as_slice()),
            _ => None,
        }
    }

    /// Heap-object identity (the shared allocation's address), or `None` for
    /// inline values. Two values alias the same object iff their identities
    /// are equal.
    pub fn identity(&self) -> Option<usize> {
        match self {
            Value::Object(rc) => Some(Rc::as_ptr(rc) as usize),
            Value::Weak(w) => Some(w.as_ptr() as usize),
            _ => None,
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::Null
    }
}

// Equality follows table-key semantics: primitives by payload (floats by bit
// pattern, so NaN == NaN), strings by bytes, heap objects by identity.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => Rc::ptr_eq(a, b),
            (Value::Weak(a), Value::Weak(b)) => Weak::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Value::Null => state.write_u8(0),
            Value::Bool(b) => {
                state.write_u8(1);
                b.hash(state);
            }
            Value::Int(i) => {
                state.write_u8(2);
                i.hash(state);
            }
            Value::Float(f) => {
                state.write_u8(3);
                f.to_bits().hash(state);
            }
            Value::Str(s) => {
                state.write_u8(4);
                s.hash(state);
            }
            Value::Object(rc) => {
                state.write_u8(5);
                (Rc::as_ptr(rc) as usize).hash(state);
            }
            Value::Weak(w) => {
                state.write_u8(6);
                (w.as_ptr() as usize).hash(state);
            }
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::Str(s) => write!(f, "{:?}", String::from_utf8_lossy(s)),
            Value::Object(rc) => match rc.try_borrow() {
                Ok(obj) => write!(f, "<{:?}@{:p}>", obj.kind(), Rc::as_ptr(rc)),
                Err(_) => write!(f, "<object@{:p}>", Rc::as_ptr(rc)),
            },
            Value::Weak(w) => write!(f, "<weak@{:p}>", w.as_ptr()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heap_identity_is_pointer_based() {
        let a = Value::object(Object::Array(vec![Value::Int(1)]));
        let b = a.clone();
        let c = Value::object(Object::Array(vec![Value::Int(1)]));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.identity(), b.identity());
        assert_ne!(a.identity(), c.identity());
    }

    #[test]
    fn string_keys_compare_by_bytes() {
        let a = Value::bytes(vec![0x66, 0x00, 0x6f]);
        let b = Value::bytes(vec![0x66, 0x00, 0x6f]);
        assert_eq!(a, b);
        assert_ne!(a, Value::str("f"));
    }

    #[test]
    fn default_value_is_null() {
        assert!(Value::default().is_null());
        // Structs with a bare Value field rely on this for derived Default.
        assert!(crate::objects::Closure::default().proto.is_null());
    }

    #[test]
    fn float_keys_compare_by_bits() {
        assert_eq!(Value::Float(f64::NAN), Value::Float(f64::NAN));
        assert_ne!(Value::Float(0.0), Value::Float(-0.0));
    }
}
