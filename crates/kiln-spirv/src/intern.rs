//! Type and constant interning.
//!
//! SPIR-V requires most type and constant definitions to be unique within
//! a module. The tables here map structural keys to already-emitted ids so
//! repeated requests return the first definition instead of emitting a
//! duplicate. Callers that need a private, individually decoratable copy
//! of a type bypass the table (`reuse = false` at the emission sites).

use std::collections::HashMap;

use crate::asm::StorageClass;
use crate::id::Id;

/// Structural identity of a type definition.
#[derive(Clone, Debug, Hash, Eq, PartialEq)]
pub enum TypeKey {
    Void,
    Bool,
    Float { width: u32 },
    Int { width: u32, signed: bool },
    Vector { component: Id, count: u32 },
    Array { element: Id, length: u32 },
    Struct { fields: Vec<Id> },
    Pointer { storage: StorageClass, pointee: Id },
    Function { ret: Id },
}

/// Interned type definitions.
#[derive(Debug, Default)]
pub struct TypeTable {
    map: HashMap<TypeKey, Id>,
}

impl TypeTable {
    pub fn get(&self, key: &TypeKey) -> Option<Id> {
        self.map.get(key).copied()
    }

    pub fn insert(&mut self, key: TypeKey, id: Id) {
        self.map.insert(key, id);
    }
}

/// Interned scalar and composite constants.
///
/// Integer constants are keyed exactly. Float constants are matched with
/// an epsilon tolerance, so the table is a linear scan; constant counts
/// are small enough (weights are grouped into composites, not interned
/// per element beyond dedup) that this is not a concern.
#[derive(Debug, Default)]
pub struct ConstTable {
    ints: HashMap<(Id, u64), Id>,
    floats: Vec<FloatConst>,
    composites: HashMap<(Id, Vec<Id>), Id>,
}

#[derive(Debug)]
struct FloatConst {
    ty: Id,
    value: f32,
    id: Id,
}

impl ConstTable {
    pub fn get_int(&self, ty: Id, bits: u64) -> Option<Id> {
        self.ints.get(&(ty, bits)).copied()
    }

    pub fn insert_int(&mut self, ty: Id, bits: u64, id: Id) {
        self.ints.insert((ty, bits), id);
    }

    pub fn get_float(&self, ty: Id, value: f32) -> Option<Id> {
        self.floats
            .iter()
            .find(|c| c.ty == ty && (c.value - value).abs() < f32::EPSILON)
            .map(|c| c.id)
    }

    pub fn insert_float(&mut self, ty: Id, value: f32, id: Id) {
        self.floats.push(FloatConst { ty, value, id });
    }

    pub fn get_composite(&self, ty: Id, elements: &[Id]) -> Option<Id> {
        self.composites.get(&(ty, elements.to_vec())).copied()
    }

    pub fn insert_composite(&mut self, ty: Id, elements: Vec<Id>, id: Id) {
        self.composites.insert((ty, elements), id);
    }
}
