//! Fiber (coroutine) and generator execution state.

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::value::Value;

/// One entry of a frame's exception-trap stack. `handler` is an index into
/// the executing closure's instruction array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionTrap {
    pub stack_size: u64,
    pub stack_base: u64,
    pub handler: u32,
    pub target: u32,
}

/// A suspended call frame. `ip` is an index into the executing closure's
/// instruction array, never an absolute address.
#[derive(Debug)]
pub struct CallFrame {
    /// A `Kind::Closure` object.
    pub closure: Value,
    /// The generator this frame belongs to, if any (`Kind::Generator`).
    pub generator: Option<Value>,
    pub ip: u32,
    pub traps: Vec<ExceptionTrap>,
    pub prev_stack_base: u64,
    pub prev_top: u64,
    pub target: u32,
    pub n_calls: u32,
    /// Whether this is the outermost frame of its fiber.
    pub is_root: bool,
}

/// A suspended script-level continuation: call frames plus the live value
/// stack. `stack.len()` is the physical capacity; slots at `top` and above
/// are dead.
#[derive(Debug, Default)]
pub struct Fiber {
    pub stack: Vec<Value>,
    pub top: usize,
    pub frames: Vec<CallFrame>,
    pub native_calls: u64,
    pub meta_calls: u64,
    pub suspended: bool,
    pub suspended_root: bool,
    /// Register awaiting the resume value, or -1.
    pub suspend_target: i64,
    pub suspend_traps: u64,
}

impl Fiber {
    pub fn new() -> Self {
        Self {
            suspend_target: -1,
            ..Default::default()
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let mut fiber = Self::new();
        fiber.stack = vec![Value::Null; capacity];
        fiber
    }

    pub fn push(&mut self, val: Value) {
        if self.top == self.stack.len() {
            self.stack.push(Value::Null);
        }
        self.stack[self.top] = val;
        self.top += 1;
    }
}

/// Generator lifecycle. A dead generator cannot be resumed and is not worth
/// carrying across a snapshot boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum GeneratorStatus {
    Dead = 0,
    Suspended = 1,
    Running = 2,
}

/// A suspended generator: lifecycle state plus its private execution state.
#[derive(Debug)]
pub struct Generator {
    pub status: GeneratorStatus,
    pub exec: Fiber,
}

impl Generator {
    pub fn suspended(exec: Fiber) -> Self {
        Self {
            status: GeneratorStatus::Suspended,
            exec,
        }
    }
}
