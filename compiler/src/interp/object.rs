//! Prototype-chained objects with hashed, sorted field storage
//!
//! Field names are interned to stable 32-bit ids; an object stores its
//! fields as a vector sorted by id and resolves lookups by binary search,
//! falling through to its prototype parent on a miss. The id→name table is
//! owned by the evaluator context, and two different names hashing onto
//! one id is a fatal configuration error, detected at intern time.

use super::errors::MacroError;
use super::value::Value;
use fxhash::FxHashMap;
use std::cell::RefCell;
use std::rc::Rc;

/// Stable hashed identifier of a field name
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FieldId(pub u32);

impl FieldId {
    /// The stable hash used for field ids. Must not change within a run;
    /// `fxhash` is seed-free, so ids are reproducible across runs too.
    pub fn hash_name(name: &str) -> u32 {
        fxhash::hash32(name.as_bytes())
    }
}

/// Global id→name table with eager collision detection
#[derive(Debug, Default)]
pub struct FieldTable {
    names: FxHashMap<u32, Rc<str>>,
}

impl FieldTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern a field name. Fails fatally when a different name already
    /// claimed the same id.
    pub fn intern(&mut self, name: &str) -> Result<FieldId, MacroError> {
        let id = FieldId::hash_name(name);
        match self.names.get(&id) {
            Some(existing) if &**existing != name => Err(MacroError::FieldIdCollision {
                id,
                existing: existing.to_string(),
                incoming: name.to_string(),
            }),
            Some(_) => Ok(FieldId(id)),
            None => {
                self.names.insert(id, Rc::from(name));
                Ok(FieldId(id))
            }
        }
    }

    /// Reverse lookup for diagnostics and field enumeration
    pub fn name(&self, id: FieldId) -> Option<Rc<str>> {
        self.names.get(&id.0).cloned()
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// A dynamic object: sorted (id, value) pairs plus an optional prototype
#[derive(Debug, Clone, Default)]
pub struct Object {
    fields: Vec<(FieldId, Value)>,
    proto: Option<Rc<RefCell<Object>>>,
}

impl Object {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_proto(proto: Rc<RefCell<Object>>) -> Self {
        Self {
            fields: Vec::new(),
            proto: Some(proto),
        }
    }

    /// Look up a field, walking the prototype chain; `None` when absent
    /// everywhere (callers treat that as null)
    pub fn get(&self, id: FieldId) -> Option<Value> {
        if let Some(v) = self.get_local(id) {
            return Some(v);
        }
        let mut parent = self.proto.clone();
        while let Some(obj) = parent {
            let obj = obj.borrow();
            if let Some(v) = obj.get_local(id) {
                return Some(v);
            }
            parent = obj.proto.clone();
        }
        None
    }

    /// Look up a field on this object only
    pub fn get_local(&self, id: FieldId) -> Option<Value> {
        self.fields
            .binary_search_by_key(&id, |&(fid, _)| fid)
            .ok()
            .map(|i| self.fields[i].1.clone())
    }

    /// Insert or update a field, keeping the backing array sorted and
    /// duplicate-free
    pub fn set(&mut self, id: FieldId, value: Value) {
        match self.fields.binary_search_by_key(&id, |&(fid, _)| fid) {
            Ok(i) => self.fields[i].1 = value,
            Err(i) => self.fields.insert(i, (id, value)),
        }
    }

    /// Remove a locally stored field; prototype fields are never removable
    /// through a child. Returns whether the field existed locally.
    pub fn remove(&mut self, id: FieldId) -> bool {
        match self.fields.binary_search_by_key(&id, |&(fid, _)| fid) {
            Ok(i) => {
                self.fields.remove(i);
                true
            }
            Err(_) => false,
        }
    }

    pub fn has_local(&self, id: FieldId) -> bool {
        self.fields
            .binary_search_by_key(&id, |&(fid, _)| fid)
            .is_ok()
    }

    /// Local fields in id order
    pub fn iter(&self) -> impl Iterator<Item = (FieldId, &Value)> {
        self.fields.iter().map(|(id, v)| (*id, v))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn proto(&self) -> Option<Rc<RefCell<Object>>> {
        self.proto.clone()
    }

    pub fn set_proto(&mut self, proto: Option<Rc<RefCell<Object>>>) {
        self.proto = proto;
    }

    /// Verify the sorted/unique invariant of the backing array
    #[cfg(test)]
    pub fn check_invariant(&self) -> bool {
        self.fields.windows(2).all(|w| w[0].0 < w[1].0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(table: &mut FieldTable, names: &[&str]) -> Vec<FieldId> {
        names.iter().map(|n| table.intern(n).unwrap()).collect()
    }

    #[test]
    fn test_set_get_out_of_hash_order() {
        let mut table = FieldTable::new();
        let f = ids(&mut table, &["x", "y"]);
        let mut o = Object::new();
        o.set(f[0], Value::Int(1));
        o.set(f[1], Value::Int(2));
        assert_eq!(o.get(f[0]), Some(Value::Int(1)));
        assert_eq!(o.get(f[1]), Some(Value::Int(2)));
        assert!(o.check_invariant());
    }

    #[test]
    fn test_set_overwrites_without_duplicate() {
        let mut table = FieldTable::new();
        let f = table.intern("count").unwrap();
        let mut o = Object::new();
        o.set(f, Value::Int(1));
        o.set(f, Value::Int(2));
        assert_eq!(o.len(), 1);
        assert_eq!(o.get(f), Some(Value::Int(2)));
    }

    #[test]
    fn test_sorted_after_many_inserts() {
        let mut table = FieldTable::new();
        let names: Vec<String> = (0..50).map(|i| format!("field_{}", i)).collect();
        let mut o = Object::new();
        for name in &names {
            let id = table.intern(name).unwrap();
            o.set(id, Value::Str(name.as_str().into()));
        }
        assert_eq!(o.len(), 50);
        assert!(o.check_invariant());
        for name in &names {
            let id = table.intern(name).unwrap();
            assert_eq!(o.get(id), Some(Value::Str(name.as_str().into())));
        }
    }

    #[test]
    fn test_remove_reports_local_presence() {
        let mut table = FieldTable::new();
        let f = ids(&mut table, &["a", "b"]);
        let mut o = Object::new();
        o.set(f[0], Value::Int(1));
        assert!(o.remove(f[0]));
        assert!(!o.remove(f[0]));
        assert!(!o.remove(f[1]));
        assert!(o.check_invariant());
    }

    #[test]
    fn test_prototype_fallthrough() {
        let mut table = FieldTable::new();
        let f = ids(&mut table, &["inherited", "own"]);
        let mut parent = Object::new();
        parent.set(f[0], Value::Int(10));
        let parent = Rc::new(RefCell::new(parent));

        let mut child = Object::with_proto(parent.clone());
        child.set(f[1], Value::Int(20));

        assert_eq!(child.get(f[0]), Some(Value::Int(10)));
        assert_eq!(child.get(f[1]), Some(Value::Int(20)));
        // Parent fields are not removable through the child
        assert!(!child.remove(f[0]));
        assert_eq!(child.get(f[0]), Some(Value::Int(10)));
    }

    #[test]
    fn test_shadowing_parent_field() {
        let mut table = FieldTable::new();
        let f = table.intern("v").unwrap();
        let parent = Rc::new(RefCell::new(Object::new()));
        parent.borrow_mut().set(f, Value::Int(1));

        let mut child = Object::with_proto(parent.clone());
        child.set(f, Value::Int(2));
        assert_eq!(child.get(f), Some(Value::Int(2)));

        // Removing the shadow re-exposes the parent value
        assert!(child.remove(f));
        assert_eq!(child.get(f), Some(Value::Int(1)));
    }

    #[test]
    fn test_interner_is_stable() {
        let mut a = FieldTable::new();
        let mut b = FieldTable::new();
        assert_eq!(a.intern("position").unwrap(), b.intern("position").unwrap());
    }

    #[test]
    fn test_interner_collision_is_fatal() {
        // Simulate a collision by pre-seeding the table with a name under
        // the id another name hashes to.
        let mut table = FieldTable::new();
        let id = FieldId::hash_name("theirs");
        table.names.insert(id, Rc::from("mine"));
        let err = table.intern("theirs").unwrap_err();
        match err {
            MacroError::FieldIdCollision {
                existing, incoming, ..
            } => {
                assert_eq!(existing, "mine");
                assert_eq!(incoming, "theirs");
            }
            other => panic!("expected FieldIdCollision, got {:?}", other),
        }
    }
}
