//! Attributes, type interning and path interning.

use std::collections::BTreeMap;
use std::collections::HashMap;

use cranelift_entity::PrimaryMap;
use smallvec::SmallVec;

use crate::refs::{PathRef, TypeRef};
use crate::symbol::Symbol;

/// Marker for a dimension whose extent is only known at run time.
pub const DYNAMIC: i64 = -1;

// ============================================================================
// Location
// ============================================================================

/// A span of source text, represented as byte offsets.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub const fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }
}

/// Source location of an IR entity. Copy-able, no lifetime parameter.
///
/// Rewrites propagate the location of the operation they replace.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Location {
    pub path: PathRef,
    pub span: Span,
}

impl Location {
    pub const fn new(path: PathRef, span: Span) -> Self {
        Self { path, span }
    }
}

// ============================================================================
// Attribute
// ============================================================================

/// IR attribute values.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Attribute {
    /// Unit/nil value.
    Unit,
    Bool(bool),
    /// Integer constant stored as raw bits (signless).
    IntBits(u64),
    /// Float constant stored as raw `f64` bits.
    FloatBits(u64),
    String(String),
    Type(TypeRef),
    /// Single interned symbol.
    Symbol(Symbol),
    /// List of attributes.
    List(Vec<Attribute>),
}

impl Attribute {
    /// Build a list attribute of signed integers.
    pub fn int_list(values: &[i64]) -> Self {
        Attribute::List(values.iter().map(|&v| Attribute::from(v)).collect())
    }

    /// Build a float attribute from an `f32` value.
    pub fn float(value: f32) -> Self {
        Attribute::FloatBits(f64::from(value).to_bits())
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Attribute::IntBits(bits) => Some(i64::from_ne_bytes(bits.to_ne_bytes())),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Attribute::FloatBits(bits) => Some(f64::from_bits(*bits)),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Attribute::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_symbol(&self) -> Option<Symbol> {
        match self {
            Attribute::Symbol(s) => Some(*s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Attribute]> {
        match self {
            Attribute::List(items) => Some(items),
            _ => None,
        }
    }

    /// Interpret a list attribute as signed integers.
    pub fn as_int_list(&self) -> Option<SmallVec<[i64; 4]>> {
        self.as_list()?.iter().map(Attribute::as_int).collect()
    }
}

impl From<i64> for Attribute {
    fn from(value: i64) -> Self {
        Attribute::IntBits(u64::from_ne_bytes(value.to_ne_bytes()))
    }
}

impl From<u64> for Attribute {
    fn from(value: u64) -> Self {
        Attribute::IntBits(value)
    }
}

impl From<bool> for Attribute {
    fn from(value: bool) -> Self {
        Attribute::Bool(value)
    }
}

impl From<Vec<Attribute>> for Attribute {
    fn from(value: Vec<Attribute>) -> Self {
        Attribute::List(value)
    }
}

impl From<Symbol> for Attribute {
    fn from(value: Symbol) -> Self {
        Attribute::Symbol(value)
    }
}

impl From<String> for Attribute {
    fn from(value: String) -> Self {
        Attribute::String(value)
    }
}

impl From<&str> for Attribute {
    fn from(value: &str) -> Self {
        Attribute::String(value.to_string())
    }
}

// ============================================================================
// TypeData
// ============================================================================

/// Data for a single interned type.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TypeData {
    pub dialect: Symbol,
    pub name: Symbol,
    pub params: SmallVec<[TypeRef; 4]>,
    pub attrs: BTreeMap<Symbol, Attribute>,
}

/// Builder for constructing `TypeData` with a fluent API.
///
/// Defaults to empty params and empty attrs, matching the most common usage.
pub struct TypeDataBuilder {
    dialect: Symbol,
    name: Symbol,
    params: SmallVec<[TypeRef; 4]>,
    attrs: BTreeMap<Symbol, Attribute>,
}

impl TypeDataBuilder {
    pub fn new(dialect: Symbol, name: Symbol) -> Self {
        Self {
            dialect,
            name,
            params: SmallVec::new(),
            attrs: BTreeMap::new(),
        }
    }

    pub fn param(mut self, ty: TypeRef) -> Self {
        self.params.push(ty);
        self
    }

    pub fn params(mut self, tys: impl IntoIterator<Item = TypeRef>) -> Self {
        self.params.extend(tys);
        self
    }

    pub fn attr(mut self, key: impl Into<Symbol>, val: Attribute) -> Self {
        self.attrs.insert(key.into(), val);
        self
    }

    pub fn build(self) -> TypeData {
        TypeData {
            dialect: self.dialect,
            name: self.name,
            params: self.params,
            attrs: self.attrs,
        }
    }
}

crate::symbols! {
    CORE => "core",
    INDEX => "index",
    I1 => "i1",
    I32 => "i32",
    F32 => "f32",
    MEMREF => "memref",
    VECTOR => "vector",
    ATTR_SHAPE => "shape",
    ATTR_SPACE => "space",
}

// ============================================================================
// TypeInterner
// ============================================================================

/// Deduplicating type interner. Same `TypeData` always yields the same `TypeRef`.
pub struct TypeInterner {
    types: PrimaryMap<TypeRef, TypeData>,
    dedup: HashMap<TypeData, TypeRef>,
}

impl TypeInterner {
    pub fn new() -> Self {
        Self {
            types: PrimaryMap::new(),
            dedup: HashMap::default(),
        }
    }

    /// Intern a type, returning an existing ref if the data matches.
    pub fn intern(&mut self, data: TypeData) -> TypeRef {
        if let Some(&existing) = self.dedup.get(&data) {
            return existing;
        }
        let r = self.types.push(data.clone());
        self.dedup.insert(data, r);
        r
    }

    /// Look up type data by reference.
    pub fn get(&self, r: TypeRef) -> &TypeData {
        &self.types[r]
    }

    /// Check if this type matches the given dialect and name.
    pub fn is_dialect(&self, r: TypeRef, dialect: Symbol, name: Symbol) -> bool {
        let data = &self.types[r];
        data.dialect == dialect && data.name == name
    }

    // === Builtin types ===

    pub fn index(&mut self) -> TypeRef {
        self.intern(TypeDataBuilder::new(CORE(), INDEX()).build())
    }

    pub fn i1(&mut self) -> TypeRef {
        self.intern(TypeDataBuilder::new(CORE(), I1()).build())
    }

    pub fn i32(&mut self) -> TypeRef {
        self.intern(TypeDataBuilder::new(CORE(), I32()).build())
    }

    pub fn f32(&mut self) -> TypeRef {
        self.intern(TypeDataBuilder::new(CORE(), F32()).build())
    }

    /// A buffer type with the given element type, shape (`DYNAMIC` for
    /// unknown extents) and memory space.
    pub fn memref(&mut self, elem: TypeRef, shape: &[i64], space: u32) -> TypeRef {
        self.intern(
            TypeDataBuilder::new(CORE(), MEMREF())
                .param(elem)
                .attr(ATTR_SHAPE(), Attribute::int_list(shape))
                .attr(ATTR_SPACE(), Attribute::from(u64::from(space)))
                .build(),
        )
    }

    /// A fixed-shape register vector type.
    pub fn vector(&mut self, elem: TypeRef, shape: &[i64]) -> TypeRef {
        self.intern(
            TypeDataBuilder::new(CORE(), VECTOR())
                .param(elem)
                .attr(ATTR_SHAPE(), Attribute::int_list(shape))
                .build(),
        )
    }

    pub fn is_index(&self, ty: TypeRef) -> bool {
        self.is_dialect(ty, CORE(), INDEX())
    }

    pub fn is_f32(&self, ty: TypeRef) -> bool {
        self.is_dialect(ty, CORE(), F32())
    }

    /// Integer-like scalar types: `index`, `i1` and `i32`.
    pub fn is_integer_like(&self, ty: TypeRef) -> bool {
        self.is_index(ty) || self.is_dialect(ty, CORE(), I1()) || self.is_dialect(ty, CORE(), I32())
    }

    pub fn is_memref(&self, ty: TypeRef) -> bool {
        self.is_dialect(ty, CORE(), MEMREF())
    }

    pub fn is_vector(&self, ty: TypeRef) -> bool {
        self.is_dialect(ty, CORE(), VECTOR())
    }
}

impl Default for TypeInterner {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Typed views
// ============================================================================

/// Decoded view of a `core.memref` type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemRefType {
    pub elem: TypeRef,
    pub shape: SmallVec<[i64; 4]>,
    pub memory_space: u32,
}

impl MemRefType {
    pub fn from_type(types: &TypeInterner, ty: TypeRef) -> Option<Self> {
        if !types.is_memref(ty) {
            return None;
        }
        let data = types.get(ty);
        let shape = data.attrs.get(&ATTR_SHAPE())?.as_int_list()?;
        let memory_space = data
            .attrs
            .get(&ATTR_SPACE())
            .and_then(Attribute::as_int)
            .unwrap_or(0) as u32;
        Some(Self {
            elem: *data.params.first()?,
            shape,
            memory_space,
        })
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn is_dynamic_dim(&self, dim: usize) -> bool {
        self.shape[dim] == DYNAMIC
    }

    pub fn has_static_shape(&self) -> bool {
        self.shape.iter().all(|&d| d != DYNAMIC)
    }

    /// Intern this view back into a type.
    pub fn intern(&self, types: &mut TypeInterner) -> TypeRef {
        types.memref(self.elem, &self.shape, self.memory_space)
    }
}

/// Decoded view of a `core.vector` type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VectorType {
    pub elem: TypeRef,
    pub shape: SmallVec<[i64; 4]>,
}

impl VectorType {
    pub fn from_type(types: &TypeInterner, ty: TypeRef) -> Option<Self> {
        if !types.is_vector(ty) {
            return None;
        }
        let data = types.get(ty);
        Some(Self {
            elem: *data.params.first()?,
            shape: data.attrs.get(&ATTR_SHAPE())?.as_int_list()?,
        })
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn num_elements(&self) -> i64 {
        self.shape.iter().product()
    }
}

// ============================================================================
// PathInterner
// ============================================================================

/// Deduplicating path (URI string) interner.
pub struct PathInterner {
    paths: PrimaryMap<PathRef, String>,
    dedup: HashMap<String, PathRef>,
}

impl PathInterner {
    pub fn new() -> Self {
        Self {
            paths: PrimaryMap::new(),
            dedup: HashMap::default(),
        }
    }

    /// Intern a path string, returning an existing ref if the string matches.
    pub fn intern(&mut self, path: String) -> PathRef {
        if let Some(&existing) = self.dedup.get(&path) {
            return existing;
        }
        let r = self.paths.push(path.clone());
        self.dedup.insert(path, r);
        r
    }

    /// Look up path string by reference.
    pub fn get(&self, r: PathRef) -> &str {
        &self.paths[r]
    }
}

impl Default for PathInterner {
    fn default() -> Self {
        Self::new()
    }
}
