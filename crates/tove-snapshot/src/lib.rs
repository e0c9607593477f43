//! Whole-heap snapshot and restore for the Tove VM.
//!
//! [`save_state`] serializes the VM's reachable object graph (root
//! namespace, value stack, suspended fibers and generators) into a
//! [`ByteBuffer`]; [`restore_state`] reconstructs it into a live VM,
//! re-resolving native bindings by name and rebinding native instances
//! through a caller-supplied [`Binder`]. Shared structure and cycles are
//! preserved exactly: aliases before the save are aliases after the
//! restore.
//!
//! Both operations require a quiescent VM (no live call frames). They run
//! lenient by default: links to host state that cannot be re-established
//! degrade to Null and are reported as [`Diagnostic`]s; strict mode turns
//! each of those into an error instead.

mod cache;
mod decode;
mod encode;
mod error;

use std::any::Any;
use std::rc::Rc;

use tove_runtime::{ByteBuffer, NativeClassDesc, Value, Vm};

use crate::decode::{Decoder, MAX_STACK_SLOTS};
use crate::encode::Encoder;

pub use crate::error::{Diagnostic, Result, SnapshotError};

/// Host callback that reattaches native instances at restore time.
///
/// For each identified, non-singleton native instance in the stream the
/// decoder asks the binder for a replacement host object. Returning `None`
/// leaves the instance without a backing resource, which is a diagnostic in
/// lenient mode and an error in strict mode.
pub trait Binder {
    fn resolve(&self, class: &NativeClassDesc, ident: &str) -> Option<Rc<dyn Any>>;
}

/// The null binder: never rebinds anything.
impl Binder for () {
    fn resolve(&self, _class: &NativeClassDesc, _ident: &str) -> Option<Rc<dyn Any>> {
        None
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SaveOptions {
    /// Fail on the first value that cannot be fully encoded, instead of
    /// degrading it to Null.
    pub strict: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RestoreOptions {
    /// Fail on the first binding that cannot be re-established, instead of
    /// degrading it to Null.
    pub strict: bool,
}

/// Outcome of a successful [`save_state`].
#[derive(Debug)]
pub struct SnapshotReport {
    pub bytes_written: usize,
    /// Values that were degraded to Null on the way out (lenient mode).
    pub diagnostics: Vec<Diagnostic>,
}

/// Outcome of a successful [`restore_state`].
#[derive(Debug)]
pub struct RestoreReport {
    /// Bindings that could not be re-established (lenient mode).
    pub diagnostics: Vec<Diagnostic>,
}

/// Serialize the VM's complete reachable state into `buf`.
///
/// The record layout is: root namespace, then the stack geometry (logical
/// top, frame base, physical capacity), then the live stack values. The VM
/// must be idle; a live call frame is an error, not a diagnostic.
pub fn save_state(vm: &Vm, buf: &mut ByteBuffer, opts: &SaveOptions) -> Result<SnapshotReport> {
    if !vm.is_idle() {
        return Err(SnapshotError::VmActive);
    }
    if vm.top > vm.stack.len() || vm.stack_base > vm.top {
        return Err(SnapshotError::Corrupt("vm stack geometry out of range"));
    }

    let start = buf.len();
    let mut enc = Encoder::new(buf, opts.strict);
    enc.write_value(&vm.root)?;
    enc.buf.put_u64(vm.top as u64);
    enc.buf.put_u64(vm.stack_base as u64);
    enc.buf.put_u64(vm.stack.len() as u64);
    for slot in &vm.stack[..vm.top] {
        enc.write_value(slot)?;
    }

    let diagnostics = enc.finish();
    let bytes_written = buf.len() - start;
    log::debug!(
        "snapshot: {} bytes, {} diagnostics",
        bytes_written,
        diagnostics.len()
    );
    Ok(SnapshotReport {
        bytes_written,
        diagnostics,
    })
}

/// Rebuild VM state from `buf`, replacing the stack and merging the
/// serialized root namespace into the VM's existing one.
///
/// Merging (rather than replacing) the root table keeps bindings the host
/// registered before the restore, so a snapshot taken in one process can be
/// restored into another that set up the same native environment. On error
/// the VM's stack is left untouched; the root table may hold a partial
/// merge.
pub fn restore_state(
    vm: &mut Vm,
    buf: &mut ByteBuffer,
    binder: &dyn Binder,
    opts: &RestoreOptions,
) -> Result<RestoreReport> {
    if !vm.is_idle() {
        return Err(SnapshotError::VmActive);
    }

    let root = vm.root_table();
    let mut dec = Decoder::new(buf, vm.registry.clone(), binder, root.clone(), opts.strict);
    dec.read_table_into(&root)?;

    let top = dec.buf.get_u64()?;
    let stack_base = dec.buf.get_u64()?;
    let capacity = dec.buf.get_u64()?;
    if capacity > MAX_STACK_SLOTS {
        return Err(SnapshotError::Corrupt("vm stack size out of range"));
    }
    if top > capacity || stack_base > top {
        return Err(SnapshotError::Corrupt("vm stack geometry out of range"));
    }

    let mut stack = vec![Value::Null; capacity as usize];
    for slot in stack.iter_mut().take(top as usize) {
        *slot = dec.read_value()?;
    }

    let diagnostics = dec.finish()?;
    log::debug!("restore: {} diagnostics", diagnostics.len());

    vm.stack = stack;
    vm.top = top as usize;
    vm.stack_base = stack_base as usize;
    Ok(RestoreReport { diagnostics })
}
