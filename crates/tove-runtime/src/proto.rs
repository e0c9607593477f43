//! Function prototypes: the immutable compiled body of a script function.

use std::rc::Rc;

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::value::Value;

/// Fixed-width bytecode instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Instruction {
    pub imm: i32,
    pub op: u8,
    pub a: u8,
    pub b: u8,
    pub c: u8,
}

impl Instruction {
    pub fn new(op: u8, a: u8, b: u8, c: u8, imm: i32) -> Self {
        Self { imm, op, a, b, c }
    }
}

/// Where a captured outer variable is sourced from when the closure is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum OuterKind {
    /// A local slot of the enclosing frame.
    Local = 0,
    /// An outer cell of the enclosing closure.
    Outer = 1,
}

/// Captured-outer-variable descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OuterDesc {
    pub kind: OuterKind,
    /// Slot index in the source named by `kind`.
    pub src: u32,
    pub name: Rc<str>,
}

/// Local-variable debug entry: the register and instruction range where a
/// named local is live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalDesc {
    pub name: Rc<str>,
    pub reg: u32,
    pub start_op: u32,
    pub end_op: u32,
}

/// Line-number table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineInfo {
    pub line: u32,
    pub op: u32,
}

/// The compiled body of a script-defined function. Immutable once compiled;
/// the snapshot engine copies its tables verbatim and never rewrites code.
#[derive(Debug, Default)]
pub struct FunctionProto {
    pub literals: Vec<Value>,
    pub params: Vec<Rc<str>>,
    pub outers: Vec<OuterDesc>,
    pub locals: Vec<LocalDesc>,
    pub lines: Vec<LineInfo>,
    /// Register slots holding default parameter values.
    pub default_params: Vec<u32>,
    pub instructions: Vec<Instruction>,
    /// Nested prototypes (`Kind::Proto` objects).
    pub protos: Vec<Value>,
    pub stack_size: u32,
    pub is_generator: bool,
    pub varargs: u32,
}
