//! Operator nodes and their attributes.

use std::collections::BTreeMap;
use std::fmt;

use crate::arena::Handle;
use crate::graph::{Initializer, Value};

/// Identifier of a node in a [`HostGraph`](crate::HostGraph).
pub type NodeId = Handle<Node>;
/// Identifier of a value (tensor edge) in a [`HostGraph`](crate::HostGraph).
pub type ValueId = Handle<Value>;

/// A typed attribute literal.
#[derive(Clone, Debug, PartialEq)]
pub enum Attribute {
    Int(i64),
    Float(f32),
    Ints(Vec<i64>),
    Floats(Vec<f32>),
    String(String),
    Strings(Vec<String>),
    Tensor(Initializer),
}

impl Attribute {
    /// Short kind name used in diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Ints(_) => "ints",
            Self::Floats(_) => "floats",
            Self::String(_) => "string",
            Self::Strings(_) => "strings",
            Self::Tensor(_) => "tensor",
        }
    }
}

/// One operator invocation.
///
/// Inputs are positional; an omitted optional input is `None`.
#[derive(Clone, Debug)]
pub struct Node {
    pub name: String,
    pub op_type: String,
    /// Operator domain; empty for the default ONNX domain.
    pub domain: String,
    pub inputs: Vec<Option<ValueId>>,
    pub outputs: Vec<ValueId>,
    pub attributes: BTreeMap<String, Attribute>,
}

impl Node {
    pub fn new(op_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            op_type: op_type.into(),
            domain: String::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            attributes: BTreeMap::new(),
        }
    }

    /// Builder-style attribute setter.
    pub fn with_attr(mut self, key: impl Into<String>, value: Attribute) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    /// Builder-style wiring with every input present.
    pub fn with_io(mut self, inputs: &[ValueId], outputs: &[ValueId]) -> Self {
        self.inputs = inputs.iter().copied().map(Some).collect();
        self.outputs = outputs.to_vec();
        self
    }

    /// The `index`-th input, if present and not omitted.
    pub fn input(&self, index: usize) -> Option<ValueId> {
        self.inputs.get(index).copied().flatten()
    }

    /// Number of inputs actually supplied (trailing omitted inputs excluded).
    pub fn present_input_count(&self) -> usize {
        self.inputs
            .iter()
            .rposition(Option::is_some)
            .map_or(0, |last| last + 1)
    }

    pub fn has_attr(&self, key: &str) -> bool {
        self.attributes.contains_key(key)
    }

    pub fn attr_int(&self, key: &str, default: i64) -> i64 {
        match self.attributes.get(key) {
            Some(Attribute::Int(v)) => *v,
            _ => default,
        }
    }

    pub fn attr_float(&self, key: &str, default: f32) -> f32 {
        match self.attributes.get(key) {
            Some(Attribute::Float(v)) => *v,
            _ => default,
        }
    }

    pub fn attr_ints(&self, key: &str) -> Option<&[i64]> {
        match self.attributes.get(key) {
            Some(Attribute::Ints(v)) => Some(v),
            _ => None,
        }
    }

    pub fn attr_string(&self, key: &str) -> Option<&str> {
        match self.attributes.get(key) {
            Some(Attribute::String(v)) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.name.is_empty() {
            write!(f, "{} (unnamed)", self.op_type)
        } else {
            write!(f, "{} '{}'", self.op_type, self.name)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attribute_getters_fall_back_to_defaults() {
        let node = Node::new("Gemm", "fc")
            .with_attr("transB", Attribute::Int(1))
            .with_attr("alpha", Attribute::Float(0.5))
            .with_attr("perm", Attribute::Ints(vec![1, 0]))
            .with_attr("auto_pad", Attribute::String("VALID".into()));

        assert_eq!(node.attr_int("transB", 0), 1);
        assert_eq!(node.attr_int("transA", 0), 0);
        assert_eq!(node.attr_float("alpha", 1.0), 0.5);
        assert_eq!(node.attr_float("beta", 1.0), 1.0);
        assert_eq!(node.attr_ints("perm"), Some(&[1, 0][..]));
        assert_eq!(node.attr_string("auto_pad"), Some("VALID"));
        // Wrong kind reads as absent.
        assert_eq!(node.attr_int("alpha", 7), 7);
    }

    #[test]
    fn present_input_count_ignores_trailing_omissions() {
        let mut node = Node::new("Conv", "c");
        assert_eq!(node.present_input_count(), 0);
        node.inputs = vec![Some(Handle::new(0)), Some(Handle::new(1)), None];
        assert_eq!(node.present_input_count(), 2);
        assert_eq!(node.input(2), None);
        assert_eq!(node.input(5), None);
    }

    #[test]
    fn display_uses_name_when_present() {
        assert_eq!(Node::new("Add", "add_0").to_string(), "Add 'add_0'");
        assert_eq!(Node::new("Add", "").to_string(), "Add (unnamed)");
    }
}
