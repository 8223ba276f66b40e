//! Enabled element types per operator.
//!
//! Each lowering unit declares the element types it supports. Configuration
//! may narrow that set per operator and globally; the enabled set is the
//! intersection, computed once when the registry is built.

use std::collections::BTreeMap;
use std::fmt;

use offload_graph::DataType;

/// A set of element types, stored as a bitmask over ONNX type codes.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct TypeSet(u32);

impl TypeSet {
    pub const EMPTY: TypeSet = TypeSet(0);

    /// Every type code representable in the set.
    pub fn all() -> Self {
        Self::from_types(&DataType::ALL)
    }

    pub const fn from_types(types: &[DataType]) -> Self {
        let mut bits = 0u32;
        let mut i = 0;
        while i < types.len() {
            bits |= 1 << (types[i] as u32);
            i += 1;
        }
        TypeSet(bits)
    }

    pub fn contains(self, ty: DataType) -> bool {
        self.0 & (1 << ty as u32) != 0
    }

    pub fn insert(&mut self, ty: DataType) {
        self.0 |= 1 << ty as u32;
    }

    #[must_use]
    pub fn intersection(self, other: TypeSet) -> TypeSet {
        TypeSet(self.0 & other.0)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    /// Members in ascending type-code order.
    pub fn iter(self) -> impl Iterator<Item = DataType> {
        DataType::ALL.into_iter().filter(move |t| self.contains(*t))
    }
}

impl FromIterator<DataType> for TypeSet {
    fn from_iter<I: IntoIterator<Item = DataType>>(iter: I) -> Self {
        let mut set = TypeSet::EMPTY;
        for t in iter {
            set.insert(t);
        }
        set
    }
}

impl fmt::Debug for TypeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl fmt::Display for TypeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, t) in self.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{t}")?;
        }
        f.write_str("}")
    }
}

/// Configured narrowing of the enabled type sets.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TypeRestrictions {
    /// Allowed types keyed by operator kind.
    pub per_op: BTreeMap<String, TypeSet>,
    /// Allowed types for every operator.
    pub global: Option<TypeSet>,
}

impl TypeRestrictions {
    pub fn is_empty(&self) -> bool {
        self.per_op.is_empty() && self.global.is_none()
    }

    /// Narrows `op_type` to `allowed`.
    pub fn allow(mut self, op_type: impl Into<String>, allowed: TypeSet) -> Self {
        self.per_op.insert(op_type.into(), allowed);
        self
    }

    /// Narrows every operator to `allowed`.
    pub fn allow_globally(mut self, allowed: TypeSet) -> Self {
        self.global = Some(allowed);
        self
    }

    /// `supported ∩ per-op allowed ∩ global allowed`.
    pub fn enabled(&self, op_type: &str, supported: TypeSet) -> TypeSet {
        let mut enabled = supported;
        if let Some(allowed) = self.per_op.get(op_type) {
            enabled = enabled.intersection(*allowed);
        }
        if let Some(global) = self.global {
            enabled = enabled.intersection(global);
        }
        enabled
    }
}

impl fmt::Display for TypeRestrictions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("none");
        }
        let mut first = true;
        if let Some(global) = self.global {
            write!(f, "*={global}")?;
            first = false;
        }
        for (op, set) in &self.per_op {
            if !first {
                f.write_str(" ")?;
            }
            write!(f, "{op}={set}")?;
            first = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FLOATS: TypeSet = TypeSet::from_types(&[DataType::Float, DataType::Float16]);

    #[test]
    fn set_operations() {
        assert!(FLOATS.contains(DataType::Float));
        assert!(!FLOATS.contains(DataType::Int32));
        assert_eq!(FLOATS.len(), 2);
        let f32_only = TypeSet::from_types(&[DataType::Float, DataType::Int64]);
        assert_eq!(
            FLOATS.intersection(f32_only),
            TypeSet::from_types(&[DataType::Float])
        );
        assert!(FLOATS.intersection(TypeSet::EMPTY).is_empty());
    }

    #[test]
    fn iterates_in_type_code_order() {
        let set: TypeSet = [DataType::Float16, DataType::Int32, DataType::Float]
            .into_iter()
            .collect();
        let v: Vec<_> = set.iter().collect();
        assert_eq!(v, vec![DataType::Float, DataType::Int32, DataType::Float16]);
        assert_eq!(set.to_string(), "{float32, int32, float16}");
    }

    #[test]
    fn all_contains_bfloat16() {
        assert!(TypeSet::all().contains(DataType::Bfloat16));
        assert_eq!(TypeSet::all().len(), DataType::ALL.len());
    }

    #[test]
    fn enabled_is_intersection_of_all_layers() {
        let r = TypeRestrictions::default();
        assert_eq!(r.enabled("Add", FLOATS), FLOATS);

        let r = r.allow("Add", TypeSet::from_types(&[DataType::Float]));
        assert_eq!(
            r.enabled("Add", FLOATS),
            TypeSet::from_types(&[DataType::Float])
        );
        assert_eq!(r.enabled("Mul", FLOATS), FLOATS);

        let r = r.allow_globally(TypeSet::from_types(&[DataType::Float16]));
        assert!(r.enabled("Add", FLOATS).is_empty());
        assert_eq!(
            r.enabled("Mul", FLOATS),
            TypeSet::from_types(&[DataType::Float16])
        );
    }

    #[test]
    fn display() {
        assert_eq!(TypeRestrictions::default().to_string(), "none");
        let r = TypeRestrictions::default()
            .allow("Relu", TypeSet::from_types(&[DataType::Float]))
            .allow_globally(FLOATS);
        assert_eq!(r.to_string(), "*={float32, float16} Relu={float32}");
    }
}
