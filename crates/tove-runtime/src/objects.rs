//! Heap object payloads: tables, closures, classes, instances.

use std::any::Any;
use std::fmt;
use std::rc::Rc;

use hashbrown::HashMap;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::registry::NativeClassDesc;
use crate::value::Value;
use crate::vm::Vm;

/// Key/value map with an optional delegate table consulted on failed lookups.
#[derive(Debug, Default)]
pub struct Table {
    pub entries: HashMap<Value, Value>,
    /// Expected to be a `Kind::Table` object when present.
    pub delegate: Option<Value>,
}

impl Table {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &Value) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn set(&mut self, key: Value, val: Value) {
        self.entries.insert(key, val);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A function prototype bound to its runtime environment.
#[derive(Debug, Default)]
pub struct Closure {
    /// The compiled body; a `Kind::Proto` object.
    pub proto: Value,
    /// Root table of the namespace the closure was defined in.
    pub root: Option<Value>,
    /// Lexically enclosing scope, if any.
    pub env: Option<Value>,
    /// Base class binding for methods, so `base.method()` resolves.
    pub base_class: Option<Value>,
    /// Captured variable cells (`Kind::Upvalue` objects), one per outer
    /// descriptor in the prototype.
    pub outers: Vec<Value>,
    /// Default argument values, one per default-parameter slot in the
    /// prototype.
    pub defaults: Vec<Value>,
}

/// Host function signature.
pub type NativeFn = fn(&mut Vm, &[Value]) -> Value;

/// A function implemented by the host. Has no serializable body; it is only
/// re-resolvable through its stable name.
#[derive(Clone)]
pub struct NativeClosure {
    pub func: NativeFn,
    pub name: Option<Rc<str>>,
    /// Bound member accessors cannot be re-resolved by name alone.
    pub bound_to_instance: bool,
}

impl NativeClosure {
    pub fn named(name: &str, func: NativeFn) -> Self {
        Self {
            func,
            name: Some(Rc::from(name)),
            bound_to_instance: false,
        }
    }

    pub fn anonymous(func: NativeFn) -> Self {
        Self {
            func,
            name: None,
            bound_to_instance: false,
        }
    }
}

impl fmt::Debug for NativeClosure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NativeClosure({:?})", self.name)
    }
}

/// Metamethod slots of a script class. The discriminant is the bit index
/// used in the serialized presence mask, so the values are stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum MetaMethod {
    Add = 0,
    Sub = 1,
    Mul = 2,
    Div = 3,
    Modulo = 4,
    Neg = 5,
    Set = 6,
    Get = 7,
    TypeOf = 8,
    NextIter = 9,
    Cmp = 10,
    Call = 11,
    DelSlot = 12,
    NewSlot = 13,
    ToString = 14,
    NewMember = 15,
    Inherited = 16,
}

impl MetaMethod {
    pub const COUNT: usize = 17;
}

/// Body of a script-defined class.
#[derive(Debug)]
pub struct ScriptClass {
    pub base: Option<Value>,
    /// Member name -> slot index map; a `Kind::Table` object.
    pub members: Value,
    /// Positional default field values; instances mirror this layout.
    pub defaults: Vec<Value>,
    /// Positional method closures.
    pub methods: Vec<Value>,
    /// One slot per `MetaMethod`, indexed by its bit value.
    pub metamethods: Vec<Option<Value>>,
    pub ctor_idx: Option<u32>,
}

impl Default for ScriptClass {
    fn default() -> Self {
        Self {
            base: None,
            members: Value::Null,
            defaults: Vec::new(),
            methods: Vec::new(),
            metamethods: vec![None; MetaMethod::COUNT],
            ctor_idx: None,
        }
    }
}

/// Class variants: host-native, the distinguished vector value type, or
/// script-defined.
#[derive(Debug)]
pub enum Class {
    Native(Rc<NativeClassDesc>),
    Vector,
    Script(ScriptClass),
}

/// State of a native-class instance. The real object lives in host memory;
/// we only carry the stable identifier used to reattach it.
pub struct NativeInstance {
    pub ident: Option<Rc<str>>,
    pub refcounted: bool,
    pub host: Option<Rc<dyn Any>>,
}

impl fmt::Debug for NativeInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeInstance")
            .field("ident", &self.ident)
            .field("refcounted", &self.refcounted)
            .field("bound", &self.host.is_some())
            .finish()
    }
}

#[derive(Debug)]
pub enum InstanceState {
    /// Script-class instance: positional fields mirroring the class's
    /// default-value layout.
    Fields(Vec<Value>),
    Native(NativeInstance),
    Vector([f32; 3]),
}

/// An object bound to exactly one class.
#[derive(Debug)]
pub struct Instance {
    /// A `Kind::Class` object.
    pub class: Value,
    pub state: InstanceState,
}
