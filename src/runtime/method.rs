//! Method registry: the id -> (class, name, descriptor, CFG) table the
//! Runtime Timeline (§4.3) populates from `method_entry_initial` frames and
//! that the Frame Matcher (§4.9) consults to find a method's bytecode CFG.

use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::bytecode::Cfg;
use crate::classfile::ClassPath;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MethodId(pub u32);

pub struct Method {
    pub class_name: String,
    pub method_name: String,
    pub signature: String,
    /// Lazily built on first reference; `None` means the class-path lookup
    /// failed (class not found, or the method is abstract/native) and every
    /// reference to this method surfaces a decode error instead of
    /// guessing a CFG.
    cfg: Option<Arc<Cfg>>,
}

#[derive(Default)]
pub struct MethodTable {
    methods: FxHashMap<MethodId, Method>,
}

impl MethodTable {
    pub fn new() -> MethodTable {
        MethodTable::default()
    }

    /// Registers a method id -> name mapping (`method_entry_initial`,
    /// §4.3); idempotent if the JVM ever re-announces the same id with
    /// identical names, which the original JVM emits at most once per id.
    pub fn register(&mut self, id: MethodId, class_name: String, method_name: String, signature: String) {
        self.methods.entry(id).or_insert(Method {
            class_name,
            method_name,
            signature,
            cfg: None,
        });
    }

    pub fn get(&self, id: MethodId) -> Option<&Method> {
        self.methods.get(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (MethodId, &Method)> {
        self.methods.iter().map(|(id, m)| (*id, m))
    }

    /// Folds another table's registrations into this one (§5: each
    /// partition's `Timeline` keeps its own method table; the output stage
    /// needs one table spanning every partition). Registration is
    /// idempotent so a method named by more than one partition just
    /// collapses to one entry.
    pub fn merge_from(&mut self, other: &MethodTable) {
        for (id, m) in other.iter() {
            self.register(id, m.class_name.clone(), m.method_name.clone(), m.signature.clone());
        }
    }

    /// Resolves (and caches) the CFG for `id` via the class-path, returning
    /// `None` if the method or its class cannot be found -- callers treat
    /// that as a `decode_error`, not a panic.
    pub fn cfg(&mut self, id: MethodId, class_path: &mut ClassPath) -> Option<Arc<Cfg>> {
        let method = self.methods.get_mut(&id)?;
        if method.cfg.is_none() {
            let class = class_path.load(&method.class_name).ok()?;
            let cfg = class.build_cfg(&method.method_name, &method.signature).ok()?;
            method.cfg = Some(Arc::new(cfg));
        }
        method.cfg.clone()
    }
}

impl Method {
    pub fn qualified_name(&self) -> String {
        format!("{}.{}{}", self.class_name, self.method_name, self.signature)
    }
}
