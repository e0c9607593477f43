//! Tove language runtime.
//!
//! This crate provides the data structures shared by the interpreter and the
//! snapshot engine:
//! - Dynamically-typed heap value model (`Value`, `Object`, `Kind`)
//! - Function prototypes and bytecode instructions
//! - Fiber (coroutine) execution state
//! - In-memory byte buffer used as the snapshot sink/source
//! - Native class registry for host-exposed types

pub mod buffer;
pub mod fiber;
pub mod objects;
pub mod proto;
pub mod registry;
pub mod value;
pub mod vm;

pub use buffer::{BufferError, ByteBuffer};
pub use fiber::{CallFrame, ExceptionTrap, Fiber, Generator, GeneratorStatus};
pub use objects::{
    Class, Closure, Instance, InstanceState, MetaMethod, NativeClosure, NativeFn, NativeInstance,
    ScriptClass, Table,
};
pub use proto::{FunctionProto, Instruction, LineInfo, LocalDesc, OuterDesc, OuterKind};
pub use registry::{NativeClassDesc, NativeClassRegistry};
pub use value::{HeapRef, Kind, Object, Value, WeakHeapRef};
pub use vm::Vm;
