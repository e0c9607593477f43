//! Graph decoder: symmetric recursive reader.
//!
//! Mirrors the encoder arm for arm. Reconstructed heap objects are stored
//! in the read cache under their marker before their children are decoded,
//! which is what makes self-referential and mutually-referential structures
//! terminate. Malformed streams fail with `Corrupt`; unresolved native
//! bindings degrade to Null unless strict mode is on.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use tove_runtime::{
    ByteBuffer, CallFrame, Class, Closure, ExceptionTrap, Fiber, FunctionProto, Generator,
    GeneratorStatus, HeapRef, Instance, InstanceState, Instruction, Kind, LineInfo, LocalDesc,
    MetaMethod, NativeClassDesc, NativeClassRegistry, NativeInstance, Object, OuterDesc,
    OuterKind, ScriptClass, Table, Value,
};

use crate::cache::ReadCache;
use crate::error::{Diagnostic, Result, SnapshotError};
use crate::Binder;

/// Upper bound on any single decoded stack allocation, so a corrupt length
/// field cannot trigger an absurd up-front allocation.
pub(crate) const MAX_STACK_SLOTS: u64 = 1 << 24;

pub(crate) struct Decoder<'a> {
    pub(crate) buf: &'a mut ByteBuffer,
    cache: ReadCache,
    registry: Rc<NativeClassRegistry>,
    binder: &'a dyn Binder,
    /// Root namespace used for by-name re-resolution of native bindings.
    root: HeapRef,
    strict: bool,
    diags: Vec<Diagnostic>,
    /// Objects whose structural cross-checks must wait until the whole
    /// graph is decoded: a class or prototype referenced from inside its
    /// own body is still an unfilled shell when the dependent record is
    /// read.
    deferred: Vec<HeapRef>,
}

impl<'a> Decoder<'a> {
    pub(crate) fn new(
        buf: &'a mut ByteBuffer,
        registry: Rc<NativeClassRegistry>,
        binder: &'a dyn Binder,
        root: HeapRef,
        strict: bool,
    ) -> Self {
        Self {
            buf,
            cache: ReadCache::new(),
            registry,
            binder,
            root,
            strict,
            diags: Vec::new(),
            deferred: Vec::new(),
        }
    }

    /// Run the deferred cross-checks and hand back the diagnostics.
    pub(crate) fn finish(self) -> Result<Vec<Diagnostic>> {
        for rc in &self.deferred {
            check_deferred(rc)?;
        }
        Ok(self.diags)
    }

    pub(crate) fn read_value(&mut self) -> Result<Value> {
        let raw = self.buf.get_u32()?;
        let kind = Kind::try_from(raw).map_err(|_| SnapshotError::Corrupt("unknown kind tag"))?;
        match kind {
            Kind::Null => Ok(Value::Null),
            Kind::Bool => Ok(Value::Bool(self.read_bool_byte()?)),
            Kind::Int => Ok(Value::Int(self.buf.get_i64()?)),
            Kind::Float => Ok(Value::Float(self.buf.get_f64()?)),
            Kind::Str => {
                let bytes = self.read_str_bytes()?;
                Ok(Value::bytes(bytes))
            }
            // The referent was written through the normal cached path; the
            // weak handle takes no counted reference to it.
            Kind::WeakRef => {
                let target = self.read_value()?;
                Ok(match target {
                    Value::Object(rc) => Value::Weak(Rc::downgrade(&rc)),
                    _ => Value::Weak(Weak::new()),
                })
            }
            Kind::NativeClosure => self.read_native_closure(),
            // Dropped by design at write time.
            Kind::Opaque => Ok(Value::Null),
            _ => self.read_heap(kind),
        }
    }

    /// Decode the root-namespace record into a pre-existing table, so
    /// native bindings already registered there survive the restore.
    pub(crate) fn read_table_into(&mut self, existing: &HeapRef) -> Result<()> {
        let raw = self.buf.get_u32()?;
        if Kind::try_from(raw).ok() != Some(Kind::Table) {
            return Err(SnapshotError::Corrupt("root record is not a table"));
        }
        let (marker, cached) = self.cache.check_or_reserve(self.buf)?;
        if cached.is_some() {
            return Err(SnapshotError::Corrupt("root table marker already seen"));
        }
        self.cache.insert(marker, Value::Object(existing.clone()))?;
        self.fill_table(existing)
    }

    fn read_heap(&mut self, kind: Kind) -> Result<Value> {
        let (marker, cached) = self.cache.check_or_reserve(self.buf)?;
        if let Some(val) = cached {
            return Ok(val);
        }

        match kind {
            Kind::Table => {
                let (rc, val) = shell(Object::Table(Table::new()));
                self.cache.insert(marker, val.clone())?;
                self.fill_table(&rc)?;
                Ok(val)
            }
            Kind::Array => {
                let count = self.read_count()?;
                let (rc, val) = shell(Object::Array(Vec::new()));
                self.cache.insert(marker, val.clone())?;
                for _ in 0..count {
                    let item = self.read_value()?;
                    if let Object::Array(items) = &mut *rc.borrow_mut() {
                        items.push(item);
                    }
                }
                Ok(val)
            }
            Kind::Proto => {
                let (rc, val) = shell(Object::Proto(FunctionProto::default()));
                self.cache.insert(marker, val.clone())?;
                let proto = self.read_proto()?;
                *rc.borrow_mut() = Object::Proto(proto);
                Ok(val)
            }
            Kind::Closure => {
                let (rc, val) = shell(Object::Closure(Closure::default()));
                self.cache.insert(marker, val.clone())?;
                let closure = self.read_closure()?;
                *rc.borrow_mut() = Object::Closure(closure);
                self.deferred.push(rc);
                Ok(val)
            }
            Kind::Class => self.read_class(marker),
            Kind::Instance => self.read_instance(marker),
            Kind::Upvalue => {
                let (rc, val) = shell(Object::Upvalue(Value::Null));
                self.cache.insert(marker, val.clone())?;
                let inner = self.read_value()?;
                *rc.borrow_mut() = Object::Upvalue(inner);
                Ok(val)
            }
            Kind::Thread => {
                let (rc, val) = shell(Object::Fiber(Fiber::new()));
                self.cache.insert(marker, val.clone())?;
                let fiber = self.read_fiber()?;
                *rc.borrow_mut() = Object::Fiber(fiber);
                Ok(val)
            }
            Kind::Generator => {
                let status = GeneratorStatus::try_from(self.buf.get_u8()?)
                    .map_err(|_| SnapshotError::Corrupt("generator status byte"))?;
                match status {
                    GeneratorStatus::Dead => {
                        // Nothing further was written; a dead generator is
                        // not worth resuming and decodes to Null.
                        self.cache.insert(marker, Value::Null)?;
                        Ok(Value::Null)
                    }
                    GeneratorStatus::Running => {
                        Err(SnapshotError::Corrupt("running generator in stream"))
                    }
                    GeneratorStatus::Suspended => {
                        let (rc, val) = shell(Object::Generator(Generator {
                            status: GeneratorStatus::Suspended,
                            exec: Fiber::new(),
                        }));
                        self.cache.insert(marker, val.clone())?;
                        let exec = self.read_fiber()?;
                        if let Object::Generator(generator) = &mut *rc.borrow_mut() {
                            generator.exec = exec;
                        }
                        Ok(val)
                    }
                }
            }
            _ => Err(SnapshotError::Corrupt("kind is not reference-cached")),
        }
    }

    fn read_native_closure(&mut self) -> Result<Value> {
        let name_bytes = self.buf.get_cstr()?;
        let key = Value::bytes(name_bytes.clone());
        let found = {
            let root_ref = self.root.borrow();
            match &*root_ref {
                Object::Table(table) => table.get(&key).cloned(),
                _ => None,
            }
        };
        match found {
            Some(val) => Ok(val),
            None => {
                let name = String::from_utf8_lossy(&name_bytes).into_owned();
                log::warn!("restore: native closure {:?} not found in root", name);
                self.diags
                    .push(Diagnostic::UnresolvedNamedBinding { name: name.clone() });
                if self.strict {
                    return Err(SnapshotError::Unresolved(name));
                }
                Ok(Value::Null)
            }
        }
    }

    fn fill_table(&mut self, rc: &HeapRef) -> Result<()> {
        let count = self.read_count()?;
        let delegate = self.read_opt()?;
        if delegate.is_some() {
            if let Object::Table(table) = &mut *rc.borrow_mut() {
                table.delegate = delegate;
            }
        }
        for _ in 0..count {
            let key = self.read_value()?;
            let val = self.read_value()?;
            if let Object::Table(table) = &mut *rc.borrow_mut() {
                table.set(key, val);
            }
        }
        Ok(())
    }

    fn read_proto(&mut self) -> Result<FunctionProto> {
        let n_literals = self.read_count()?;
        let n_params = self.read_count()?;
        let n_outers = self.read_count()?;
        let n_locals = self.read_count()?;
        let n_lines = self.read_count()?;
        let n_defaults = self.read_count()?;
        let n_instructions = self.read_count()?;
        let n_protos = self.read_count()?;

        let mut proto = FunctionProto::default();
        for _ in 0..n_literals {
            proto.literals.push(self.read_value()?);
        }
        for _ in 0..n_params {
            proto.params.push(self.read_str()?);
        }
        for _ in 0..n_outers {
            let kind = OuterKind::try_from(self.buf.get_u8()?)
                .map_err(|_| SnapshotError::Corrupt("outer descriptor kind"))?;
            let src = self.buf.get_u32()?;
            let name = self.read_str()?;
            proto.outers.push(OuterDesc { kind, src, name });
        }
        for _ in 0..n_locals {
            let name = self.read_str()?;
            let reg = self.buf.get_u32()?;
            let start_op = self.buf.get_u32()?;
            let end_op = self.buf.get_u32()?;
            if start_op > end_op || end_op as usize > n_instructions {
                return Err(SnapshotError::Corrupt("local debug range out of bounds"));
            }
            proto.locals.push(LocalDesc {
                name,
                reg,
                start_op,
                end_op,
            });
        }
        for _ in 0..n_lines {
            let line = self.buf.get_u32()?;
            let op = self.buf.get_u32()?;
            proto.lines.push(LineInfo { line, op });
        }
        for _ in 0..n_defaults {
            proto.default_params.push(self.read_u32_count()?);
        }
        for _ in 0..n_instructions {
            let imm = self.buf.get_i32()?;
            let op = self.buf.get_u8()?;
            let a = self.buf.get_u8()?;
            let b = self.buf.get_u8()?;
            let c = self.buf.get_u8()?;
            proto.instructions.push(Instruction { imm, op, a, b, c });
        }
        for _ in 0..n_protos {
            proto.protos.push(self.read_value()?);
        }

        proto.stack_size = self.read_u32_count()?;
        proto.is_generator = self.read_bool_byte()?;
        proto.varargs = self.read_u32_count()?;
        Ok(proto)
    }

    fn read_closure(&mut self) -> Result<Closure> {
        let proto = self.read_value()?;
        if proto.as_object().is_none() {
            return Err(SnapshotError::Corrupt("closure prototype missing"));
        }

        // The prototype may still be a shell (the closure can sit in its
        // own prototype's literal pool), so the cell and default counts
        // come from the wire; agreement with the prototype is verified in
        // `finish`.
        let root = self.read_opt()?;
        let env = self.read_opt()?;
        let base_class = self.read_opt()?;
        let n_outers = self.read_count()?;
        let mut outers = Vec::new();
        for _ in 0..n_outers {
            outers.push(self.read_value()?);
        }
        let n_defaults = self.read_count()?;
        let mut defaults = Vec::new();
        for _ in 0..n_defaults {
            defaults.push(self.read_value()?);
        }

        Ok(Closure {
            proto,
            root,
            env,
            base_class,
            outers,
            defaults,
        })
    }

    fn read_class(&mut self, marker: u64) -> Result<Value> {
        match self.buf.get_u8()? {
            0 => {
                let name = self.read_str()?;
                match self.registry.lookup(&name) {
                    Some(desc) => {
                        let val = Value::object(Object::Class(Class::Native(desc)));
                        self.cache.insert(marker, val.clone())?;
                        Ok(val)
                    }
                    None => {
                        log::warn!("restore: native class {:?} is not registered", name);
                        let name = name.to_string();
                        self.diags
                            .push(Diagnostic::UnresolvedNamedBinding { name: name.clone() });
                        if self.strict {
                            return Err(SnapshotError::Unresolved(name));
                        }
                        self.cache.insert(marker, Value::Null)?;
                        Ok(Value::Null)
                    }
                }
            }
            1 => {
                let val = Value::object(Object::Class(Class::Vector));
                self.cache.insert(marker, val.clone())?;
                Ok(val)
            }
            2 => {
                let (rc, val) = shell(Object::Class(Class::Script(ScriptClass::default())));
                self.cache.insert(marker, val.clone())?;
                let sc = self.read_script_class()?;
                *rc.borrow_mut() = Object::Class(Class::Script(sc));
                Ok(val)
            }
            _ => Err(SnapshotError::Corrupt("class subtype byte")),
        }
    }

    fn read_script_class(&mut self) -> Result<ScriptClass> {
        let base = self.read_opt()?;
        let members = self.read_value()?;

        let n_defaults = self.read_count()?;
        let mut defaults = Vec::new();
        for _ in 0..n_defaults {
            defaults.push(self.read_value()?);
        }
        let n_methods = self.read_count()?;
        let mut methods = Vec::new();
        for _ in 0..n_methods {
            methods.push(self.read_value()?);
        }

        let mask = self.buf.get_u32()?;
        if mask & !((1u32 << MetaMethod::COUNT) - 1) != 0 {
            return Err(SnapshotError::Corrupt("metamethod mask out of range"));
        }
        let mut metamethods = vec![None; MetaMethod::COUNT];
        for (bit, slot) in metamethods.iter_mut().enumerate() {
            if mask & (1 << bit) != 0 {
                *slot = Some(self.read_value()?);
            }
        }

        let ctor_idx = match self.buf.get_i64()? {
            -1 => None,
            idx if idx >= 0 && (idx as usize) < methods.len() => Some(idx as u32),
            _ => return Err(SnapshotError::Corrupt("constructor index out of range")),
        };

        Ok(ScriptClass {
            base,
            members,
            defaults,
            methods,
            metamethods,
            ctor_idx,
        })
    }

    fn read_instance(&mut self, marker: u64) -> Result<Value> {
        // Shell goes in before the class record: a script class's body can
        // reference this instance (members, methods, metamethods).
        let (rc, val) = shell(Object::Instance(Instance {
            class: Value::Null,
            state: InstanceState::Fields(Vec::new()),
        }));
        self.cache.insert(marker, val.clone())?;

        let class_val = self.read_value()?;
        let Some(class_rc) = class_val.as_object() else {
            // An unresolved class leaves the instance body unparseable:
            // without the descriptor we cannot tell singleton from
            // identified, so the stream is no longer self-delimiting.
            return Err(SnapshotError::Corrupt("instance of unresolved class"));
        };
        let class_rc = class_rc.clone();

        enum Plan {
            Vector,
            Native(Rc<NativeClassDesc>),
            Script,
        }
        let plan = {
            let class_ref = class_rc.borrow();
            match &*class_ref {
                Object::Class(Class::Vector) => Plan::Vector,
                Object::Class(Class::Native(desc)) => Plan::Native(desc.clone()),
                Object::Class(Class::Script(_)) => Plan::Script,
                _ => return Err(SnapshotError::Corrupt("instance class is not a class")),
            }
        };

        match plan {
            Plan::Vector => {
                let x = self.buf.get_f32()?;
                let y = self.buf.get_f32()?;
                let z = self.buf.get_f32()?;
                *rc.borrow_mut() = Object::Instance(Instance {
                    class: class_val,
                    state: InstanceState::Vector([x, y, z]),
                });
                Ok(val)
            }
            Plan::Native(desc) if desc.singleton => {
                // Native class records have no recursive body, so nothing
                // can have picked up the shell yet; the cache slot is
                // swapped for the live instance (or its Null substitute).
                match self.registry.find_singleton(&desc) {
                    Some(live) => {
                        let live = Value::Object(live);
                        self.cache.replace(marker, live.clone())?;
                        Ok(live)
                    }
                    None => {
                        log::warn!("restore: no live instance of singleton {}", desc.name);
                        self.diags.push(Diagnostic::UnbindableInstance {
                            ident: desc.name.to_string(),
                        });
                        if self.strict {
                            return Err(SnapshotError::Unbindable(desc.name.to_string()));
                        }
                        self.cache.replace(marker, Value::Null)?;
                        Ok(Value::Null)
                    }
                }
            }
            Plan::Native(desc) => {
                let ident_bytes = self.read_str_bytes()?;
                let refcounted = self.read_bool_byte()?;
                let ident = String::from_utf8_lossy(&ident_bytes).into_owned();

                let host = if ident.is_empty() {
                    None
                } else {
                    self.binder.resolve(&desc, &ident)
                };
                if host.is_none() {
                    log::warn!(
                        "restore: instance {:?} of {} not rebound",
                        ident,
                        desc.name
                    );
                    self.diags.push(Diagnostic::UnbindableInstance {
                        ident: ident.clone(),
                    });
                    if self.strict {
                        return Err(SnapshotError::Unbindable(ident));
                    }
                }

                let native = NativeInstance {
                    ident: if ident.is_empty() {
                        None
                    } else {
                        Some(Rc::from(ident.as_str()))
                    },
                    refcounted,
                    host,
                };
                *rc.borrow_mut() = Object::Instance(Instance {
                    class: class_val,
                    state: InstanceState::Native(native),
                });
                self.registry.track_instance(&rc);
                Ok(val)
            }
            Plan::Script => {
                if let Object::Instance(inst) = &mut *rc.borrow_mut() {
                    inst.class = class_val;
                }
                // The class may still be a shell of itself here, so the
                // field count comes from the wire; agreement with the
                // class's default-value layout is verified in `finish`.
                let count = self.read_count()?;
                for _ in 0..count {
                    let field = self.read_value()?;
                    if let Object::Instance(inst) = &mut *rc.borrow_mut() {
                        if let InstanceState::Fields(fields) = &mut inst.state {
                            fields.push(field);
                        }
                    }
                }
                self.deferred.push(rc);
                Ok(val)
            }
        }
    }

    fn read_fiber(&mut self) -> Result<Fiber> {
        let capacity = self.buf.get_u64()?;
        if capacity > MAX_STACK_SLOTS {
            return Err(SnapshotError::Corrupt("fiber stack size out of range"));
        }
        let top = self.buf.get_u64()?;
        if top > capacity {
            return Err(SnapshotError::Corrupt("fiber top beyond capacity"));
        }
        let n_frames = self.read_count()?;

        let mut frames = Vec::new();
        for _ in 0..n_frames {
            frames.push(self.read_frame()?);
        }

        let native_calls = self.buf.get_u64()?;
        let meta_calls = self.buf.get_u64()?;
        let suspended = self.read_bool_byte()?;
        let suspended_root = self.read_bool_byte()?;
        let suspend_target = self.buf.get_i64()?;
        let suspend_traps = self.buf.get_u64()?;

        let mut stack = vec![Value::Null; capacity as usize];
        for slot in stack.iter_mut().take(top as usize) {
            *slot = self.read_value()?;
        }

        Ok(Fiber {
            stack,
            top: top as usize,
            frames,
            native_calls,
            meta_calls,
            suspended,
            suspended_root,
            suspend_target,
            suspend_traps,
        })
    }

    fn read_frame(&mut self) -> Result<CallFrame> {
        let closure = self.read_value()?;
        let instr_count = closure_instruction_count(&closure)?;

        let generator = self.read_opt()?;

        let ip = self.read_u32_count()?;
        if ip >= instr_count {
            return Err(SnapshotError::Corrupt("instruction offset out of range"));
        }

        let n_traps = self.read_count()?;
        let mut traps = Vec::new();
        for _ in 0..n_traps {
            let stack_size = self.buf.get_u64()?;
            let stack_base = self.buf.get_u64()?;
            let delta = self.buf.get_i64()?;
            let handler = ip as i64 + delta;
            if handler < 0 || handler >= instr_count as i64 {
                return Err(SnapshotError::Corrupt("trap handler out of range"));
            }
            let target = self.read_u32_count()?;
            traps.push(ExceptionTrap {
                stack_size,
                stack_base,
                handler: handler as u32,
                target,
            });
        }

        let prev_stack_base = self.buf.get_u64()?;
        let prev_top = self.buf.get_u64()?;
        let target = self.read_u32_count()?;
        let n_calls = self.read_u32_count()?;
        let is_root = self.read_bool_byte()?;

        Ok(CallFrame {
            closure,
            generator,
            ip,
            traps,
            prev_stack_base,
            prev_top,
            target,
            n_calls,
            is_root,
        })
    }

    // --- low-level helpers ---

    fn read_bool_byte(&mut self) -> Result<bool> {
        match self.buf.get_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(SnapshotError::Corrupt("bool byte out of range")),
        }
    }

    fn read_opt(&mut self) -> Result<Option<Value>> {
        if self.read_bool_byte()? {
            Ok(Some(self.read_value()?))
        } else {
            Ok(None)
        }
    }

    fn read_count(&mut self) -> Result<usize> {
        usize::try_from(self.buf.get_u64()?)
            .map_err(|_| SnapshotError::Corrupt("count out of range"))
    }

    /// A `u64` field that must fit the in-memory `u32` representation.
    fn read_u32_count(&mut self) -> Result<u32> {
        u32::try_from(self.buf.get_u64()?)
            .map_err(|_| SnapshotError::Corrupt("count out of range"))
    }

    fn read_str_bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.read_count()?;
        Ok(self.buf.get_bytes(len)?)
    }

    fn read_str(&mut self) -> Result<Rc<str>> {
        let bytes = self.read_str_bytes()?;
        Ok(Rc::from(String::from_utf8_lossy(&bytes).into_owned()))
    }
}

/// Allocate a placeholder heap object that will be cached under its marker
/// before its children are decoded, then filled in place.
fn shell(obj: Object) -> (HeapRef, Value) {
    let rc = Rc::new(RefCell::new(obj));
    (rc.clone(), Value::Object(rc))
}

/// Structural cross-checks that need the whole graph: an instance's field
/// layout against its class, a closure's cell and default counts against
/// its prototype.
fn check_deferred(rc: &HeapRef) -> Result<()> {
    let obj = rc.borrow();
    match &*obj {
        Object::Instance(inst) => {
            let InstanceState::Fields(fields) = &inst.state else {
                return Ok(());
            };
            let class_rc = inst
                .class
                .as_object()
                .ok_or(SnapshotError::Corrupt("instance of unresolved class"))?;
            let class_ref = class_rc.borrow();
            let Object::Class(Class::Script(sc)) = &*class_ref else {
                return Err(SnapshotError::Corrupt("instance class is not a class"));
            };
            if fields.len() != sc.defaults.len() {
                return Err(SnapshotError::Corrupt(
                    "instance field count disagrees with class",
                ));
            }
            Ok(())
        }
        Object::Closure(c) => {
            let proto_rc = c
                .proto
                .as_object()
                .ok_or(SnapshotError::Corrupt("closure prototype missing"))?;
            let proto_ref = proto_rc.borrow();
            let Object::Proto(p) = &*proto_ref else {
                return Err(SnapshotError::Corrupt("closure prototype is not a proto"));
            };
            if c.outers.len() != p.outers.len() || c.defaults.len() != p.default_params.len() {
                return Err(SnapshotError::Corrupt(
                    "closure arity disagrees with prototype",
                ));
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

fn closure_instruction_count(closure: &Value) -> Result<u32> {
    let rc = closure
        .as_object()
        .ok_or(SnapshotError::Corrupt("frame closure missing"))?;
    let closure_ref = rc.borrow();
    let Object::Closure(c) = &*closure_ref else {
        return Err(SnapshotError::Corrupt("frame closure is not a closure"));
    };
    let proto_rc = c
        .proto
        .as_object()
        .ok_or(SnapshotError::Corrupt("frame closure has no prototype"))?;
    let proto_ref = proto_rc.borrow();
    let Object::Proto(p) = &*proto_ref else {
        return Err(SnapshotError::Corrupt("frame prototype is not a proto"));
    };
    Ok(p.instructions.len() as u32)
}
