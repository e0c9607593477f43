//! Registry of host-exposed native classes.
//!
//! Passed into the decoder explicitly so independent VM instances never
//! share resolution state.

use std::cell::RefCell;
use std::rc::Rc;

use hashbrown::HashMap;

use crate::objects::Class;
use crate::value::{HeapRef, Object, WeakHeapRef};

/// Descriptor of a host-exposed class.
#[derive(Debug)]
pub struct NativeClassDesc {
    /// Stable registered name; the wire identity of the class.
    pub name: Rc<str>,
    /// Singleton classes have exactly one live instance, located by
    /// enumeration at restore time instead of by identifier.
    pub singleton: bool,
}

/// Name -> descriptor lookup plus weak tracking of live native instances.
#[derive(Debug, Default)]
pub struct NativeClassRegistry {
    classes: RefCell<HashMap<String, Rc<NativeClassDesc>>>,
    live: RefCell<Vec<WeakHeapRef>>,
}

impl NativeClassRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: &str, singleton: bool) -> Rc<NativeClassDesc> {
        let desc = Rc::new(NativeClassDesc {
            name: Rc::from(name),
            singleton,
        });
        self.classes
            .borrow_mut()
            .insert(name.to_string(), desc.clone());
        desc
    }

    pub fn lookup(&self, name: &str) -> Option<Rc<NativeClassDesc>> {
        self.classes.borrow().get(name).cloned()
    }

    /// Record a live instance of a native class so singleton restore can
    /// find it. The registry holds only a weak handle.
    pub fn track_instance(&self, instance: &HeapRef) {
        self.live.borrow_mut().push(Rc::downgrade(instance));
    }

    /// Locate the unique live instance of a singleton class. Dead handles
    /// are pruned as a side effect.
    pub fn find_singleton(&self, desc: &Rc<NativeClassDesc>) -> Option<HeapRef> {
        let mut live = self.live.borrow_mut();
        let mut found = None;
        live.retain(|weak| {
            let Some(rc) = weak.upgrade() else {
                return false;
            };
            if found.is_none() && instance_of(&rc, desc) {
                found = Some(rc.clone());
            }
            true
        });
        found
    }
}

fn instance_of(obj: &HeapRef, desc: &Rc<NativeClassDesc>) -> bool {
    let obj_ref = obj.borrow();
    let Object::Instance(inst) = &*obj_ref else {
        return false;
    };
    let Some(class_rc) = inst.class.as_object() else {
        return false;
    };
    let class_ref = class_rc.borrow();
    matches!(&*class_ref, Object::Class(Class::Native(d)) if Rc::ptr_eq(d, desc))
}
