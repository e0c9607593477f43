//! Graph encoder: recursive, type-dispatching writer for the heap.
//!
//! Every record starts with a 4-byte kind tag. Heap objects go through the
//! write cache so shared structure and cycles are emitted once; primitives
//! and strings are always written in full. The encode and decode match arms
//! are kept in the same order to ease auditing.

use std::rc::Rc;

use tove_runtime::{
    ByteBuffer, Class, Closure, Fiber, FunctionProto, GeneratorStatus, HeapRef, Instance,
    InstanceState, Kind, MetaMethod, NativeClosure, Object, ScriptClass, Table, Value,
};

use crate::cache::WriteCache;
use crate::error::{Diagnostic, Result, SnapshotError};

pub(crate) struct Encoder<'a> {
    pub(crate) buf: &'a mut ByteBuffer,
    cache: WriteCache,
    strict: bool,
    diags: Vec<Diagnostic>,
}

impl<'a> Encoder<'a> {
    pub(crate) fn new(buf: &'a mut ByteBuffer, strict: bool) -> Self {
        Self {
            buf,
            cache: WriteCache::new(),
            strict,
            diags: Vec::new(),
        }
    }

    pub(crate) fn finish(self) -> Vec<Diagnostic> {
        self.diags
    }

    pub(crate) fn write_value(&mut self, val: &Value) -> Result<()> {
        match val {
            Value::Null => self.buf.put_u32(Kind::Null.into()),
            Value::Bool(b) => {
                self.buf.put_u32(Kind::Bool.into());
                self.buf.put_u8(*b as u8);
            }
            Value::Int(i) => {
                self.buf.put_u32(Kind::Int.into());
                self.buf.put_i64(*i);
            }
            Value::Float(f) => {
                self.buf.put_u32(Kind::Float.into());
                self.buf.put_f64(*f);
            }
            Value::Str(s) => {
                self.buf.put_u32(Kind::Str.into());
                self.buf.put_u64(s.len() as u64);
                self.buf.put_bytes(s);
            }
            Value::Object(rc) => self.write_object(rc)?,
            // The referent goes through the normal cached path; the weak
            // flavor is re-established on read without a counted reference.
            Value::Weak(weak) => {
                self.buf.put_u32(Kind::WeakRef.into());
                match weak.upgrade() {
                    Some(rc) => self.write_object(&rc)?,
                    None => self.buf.put_u32(Kind::Null.into()),
                }
            }
        }
        Ok(())
    }

    fn write_object(&mut self, rc: &HeapRef) -> Result<()> {
        let obj = rc.borrow();

        // Native closures are re-resolved, not reconstructed, and opaque
        // handles are dropped; neither goes through the cache.
        match &*obj {
            Object::NativeClosure(nc) => return self.write_native_closure(nc),
            Object::Opaque(_) => {
                self.buf.put_u32(Kind::Opaque.into());
                return Ok(());
            }
            _ => {}
        }

        self.buf.put_u32(obj.kind().into());
        let identity = Rc::as_ptr(rc) as usize;
        if self.cache.check_or_register(identity, self.buf) {
            // Already emitted; the marker alone reconstructs the alias.
            return Ok(());
        }

        match &*obj {
            Object::Table(table) => self.write_table(table),
            Object::Array(items) => {
                self.buf.put_u64(items.len() as u64);
                for item in items {
                    self.write_value(item)?;
                }
                Ok(())
            }
            Object::Proto(proto) => self.write_proto(proto),
            Object::Closure(closure) => self.write_closure(closure),
            Object::Class(class) => self.write_class(class),
            Object::Instance(inst) => self.write_instance(inst),
            Object::Upvalue(inner) => self.write_value(inner),
            Object::Fiber(fiber) => self.write_fiber(fiber),
            Object::Generator(generator) => {
                self.buf.put_u8(generator.status.into());
                match generator.status {
                    GeneratorStatus::Dead => Ok(()),
                    GeneratorStatus::Suspended => self.write_fiber(&generator.exec),
                    GeneratorStatus::Running => Err(SnapshotError::VmActive),
                }
            }
            Object::NativeClosure(_) | Object::Opaque(_) => unreachable!("handled above"),
        }
    }

    /// By-name representation, or a retroactive downgrade of the record to
    /// Null when the closure is anonymous or bound to an instance.
    fn write_native_closure(&mut self, nc: &NativeClosure) -> Result<()> {
        let tag_pos = self.buf.len();
        self.buf.put_u32(Kind::NativeClosure.into());
        match &nc.name {
            Some(name) if !nc.bound_to_instance && !name.as_bytes().contains(&0) => {
                self.buf.put_cstr(name.as_bytes());
                Ok(())
            }
            _ => {
                self.buf.patch_u32(tag_pos, Kind::Null.into())?;
                log::warn!("snapshot: dropping unencodable native closure");
                self.diags.push(Diagnostic::UnencodableClosure);
                if self.strict {
                    return Err(SnapshotError::UnencodableClosure);
                }
                Ok(())
            }
        }
    }

    fn write_table(&mut self, table: &Table) -> Result<()> {
        self.buf.put_u64(table.entries.len() as u64);
        self.write_opt(&table.delegate)?;
        for (key, val) in &table.entries {
            self.write_value(key)?;
            self.write_value(val)?;
        }
        Ok(())
    }

    fn write_proto(&mut self, proto: &FunctionProto) -> Result<()> {
        self.buf.put_u64(proto.literals.len() as u64);
        self.buf.put_u64(proto.params.len() as u64);
        self.buf.put_u64(proto.outers.len() as u64);
        self.buf.put_u64(proto.locals.len() as u64);
        self.buf.put_u64(proto.lines.len() as u64);
        self.buf.put_u64(proto.default_params.len() as u64);
        self.buf.put_u64(proto.instructions.len() as u64);
        self.buf.put_u64(proto.protos.len() as u64);

        for lit in &proto.literals {
            self.write_value(lit)?;
        }
        for param in &proto.params {
            self.write_str(param.as_bytes());
        }
        for outer in &proto.outers {
            self.buf.put_u8(outer.kind.into());
            self.buf.put_u32(outer.src);
            self.write_str(outer.name.as_bytes());
        }
        for local in &proto.locals {
            self.write_str(local.name.as_bytes());
            self.buf.put_u32(local.reg);
            self.buf.put_u32(local.start_op);
            self.buf.put_u32(local.end_op);
        }
        for line in &proto.lines {
            self.buf.put_u32(line.line);
            self.buf.put_u32(line.op);
        }
        for &slot in &proto.default_params {
            self.buf.put_u64(slot as u64);
        }
        for inst in &proto.instructions {
            self.buf.put_i32(inst.imm);
            self.buf.put_u8(inst.op);
            self.buf.put_u8(inst.a);
            self.buf.put_u8(inst.b);
            self.buf.put_u8(inst.c);
        }
        for nested in &proto.protos {
            self.write_value(nested)?;
        }

        self.buf.put_u64(proto.stack_size as u64);
        self.buf.put_u8(proto.is_generator as u8);
        self.buf.put_u64(proto.varargs as u64);
        Ok(())
    }

    fn write_closure(&mut self, closure: &Closure) -> Result<()> {
        // The reader re-checks these against the prototype once the whole
        // graph is decoded; refuse to write a closure that already disagrees.
        {
            let proto_rc = closure
                .proto
                .as_object()
                .ok_or(SnapshotError::Corrupt("closure without prototype"))?;
            let proto_ref = proto_rc.borrow();
            let Object::Proto(proto) = &*proto_ref else {
                return Err(SnapshotError::Corrupt("closure prototype is not a proto"));
            };
            if closure.outers.len() != proto.outers.len() {
                return Err(SnapshotError::Corrupt("closure outer count mismatch"));
            }
            if closure.defaults.len() != proto.default_params.len() {
                return Err(SnapshotError::Corrupt("closure default count mismatch"));
            }
        }

        self.write_value(&closure.proto)?;
        self.write_opt(&closure.root)?;
        self.write_opt(&closure.env)?;
        self.write_opt(&closure.base_class)?;
        self.buf.put_u64(closure.outers.len() as u64);
        for cell in &closure.outers {
            self.write_value(cell)?;
        }
        self.buf.put_u64(closure.defaults.len() as u64);
        for default in &closure.defaults {
            self.write_value(default)?;
        }
        Ok(())
    }

    fn write_class(&mut self, class: &Class) -> Result<()> {
        match class {
            Class::Native(desc) => {
                self.buf.put_u8(0);
                self.write_str(desc.name.as_bytes());
                Ok(())
            }
            Class::Vector => {
                // The subtype byte is the whole record.
                self.buf.put_u8(1);
                Ok(())
            }
            Class::Script(sc) => {
                self.buf.put_u8(2);
                self.write_script_class(sc)
            }
        }
    }

    fn write_script_class(&mut self, sc: &ScriptClass) -> Result<()> {
        if sc.metamethods.len() != MetaMethod::COUNT {
            return Err(SnapshotError::Corrupt("metamethod table size"));
        }

        self.write_opt(&sc.base)?;
        self.write_value(&sc.members)?;

        self.buf.put_u64(sc.defaults.len() as u64);
        for val in &sc.defaults {
            self.write_value(val)?;
        }
        self.buf.put_u64(sc.methods.len() as u64);
        for method in &sc.methods {
            self.write_value(method)?;
        }

        let mut mask = 0u32;
        for (bit, slot) in sc.metamethods.iter().enumerate() {
            if slot.is_some() {
                mask |= 1 << bit;
            }
        }
        self.buf.put_u32(mask);
        for slot in sc.metamethods.iter().flatten() {
            self.write_value(slot)?;
        }

        self.buf
            .put_i64(sc.ctor_idx.map_or(-1, |idx| idx as i64));
        Ok(())
    }

    fn write_instance(&mut self, inst: &Instance) -> Result<()> {
        self.write_value(&inst.class)?;

        let class_rc = inst
            .class
            .as_object()
            .ok_or(SnapshotError::Corrupt("instance without class"))?;
        let class_ref = class_rc.borrow();
        let Object::Class(class) = &*class_ref else {
            return Err(SnapshotError::Corrupt("instance class is not a class"));
        };

        match (class, &inst.state) {
            (Class::Vector, InstanceState::Vector(components)) => {
                for c in components {
                    self.buf.put_f32(*c);
                }
                Ok(())
            }
            (Class::Native(desc), InstanceState::Native(native)) => {
                if desc.singleton {
                    // The reader locates the unique live instance; no body.
                    return Ok(());
                }
                let ident = native.ident.as_deref().unwrap_or("");
                if ident.is_empty() {
                    log::warn!(
                        "snapshot: native instance of {} has no identifier",
                        desc.name
                    );
                    self.diags.push(Diagnostic::UnbindableInstance {
                        ident: String::new(),
                    });
                    if self.strict {
                        return Err(SnapshotError::Unbindable(desc.name.to_string()));
                    }
                }
                self.write_str(ident.as_bytes());
                self.buf.put_u8(native.refcounted as u8);
                Ok(())
            }
            (Class::Script(sc), InstanceState::Fields(fields)) => {
                if fields.len() != sc.defaults.len() {
                    return Err(SnapshotError::Corrupt(
                        "instance field count disagrees with class",
                    ));
                }
                self.buf.put_u64(fields.len() as u64);
                for field in fields {
                    self.write_value(field)?;
                }
                Ok(())
            }
            _ => Err(SnapshotError::Corrupt("instance state does not match class")),
        }
    }

    fn write_fiber(&mut self, fiber: &Fiber) -> Result<()> {
        if fiber.top > fiber.stack.len() {
            return Err(SnapshotError::Corrupt("fiber top beyond stack"));
        }

        self.buf.put_u64(fiber.stack.len() as u64);
        self.buf.put_u64(fiber.top as u64);
        self.buf.put_u64(fiber.frames.len() as u64);

        for frame in &fiber.frames {
            self.write_value(&frame.closure)?;
            self.write_opt(&frame.generator)?;
            self.buf.put_u64(frame.ip as u64);

            self.buf.put_u64(frame.traps.len() as u64);
            for trap in &frame.traps {
                self.buf.put_u64(trap.stack_size);
                self.buf.put_u64(trap.stack_base);
                // Relative to the frame's instruction position; absolute
                // addresses do not survive a save/load boundary.
                self.buf
                    .put_i64(trap.handler as i64 - frame.ip as i64);
                self.buf.put_u64(trap.target as u64);
            }

            self.buf.put_u64(frame.prev_stack_base);
            self.buf.put_u64(frame.prev_top);
            self.buf.put_u64(frame.target as u64);
            self.buf.put_u64(frame.n_calls as u64);
            self.buf.put_u8(frame.is_root as u8);
        }

        self.buf.put_u64(fiber.native_calls);
        self.buf.put_u64(fiber.meta_calls);
        self.buf.put_u8(fiber.suspended as u8);
        self.buf.put_u8(fiber.suspended_root as u8);
        self.buf.put_i64(fiber.suspend_target);
        self.buf.put_u64(fiber.suspend_traps);

        for slot in &fiber.stack[..fiber.top] {
            self.write_value(slot)?;
        }
        Ok(())
    }

    fn write_opt(&mut self, val: &Option<Value>) -> Result<()> {
        match val {
            Some(v) => {
                self.buf.put_u8(1);
                self.write_value(v)
            }
            None => {
                self.buf.put_u8(0);
                Ok(())
            }
        }
    }

    fn write_str(&mut self, bytes: &[u8]) {
        self.buf.put_u64(bytes.len() as u64);
        self.buf.put_bytes(bytes);
    }
}
