//! Operator registry: operator kind to lowering unit.
//!
//! Built once, explicitly or through [`OpRegistry::builtin`], and then only
//! read. Enumeration follows registration order so diagnostics are
//! reproducible.

use std::collections::HashMap;
use std::sync::OnceLock;

use offload_graph::{HostGraph, NodeId};

use crate::builders::{builtin_units, LayerBatch, LoweringUnit, NodeContext};
use crate::capability::Rejection;
use crate::error::LoweringError;
use crate::helper;
use crate::options::PrecisionPolicy;
use crate::type_control::{TypeRestrictions, TypeSet};

/// A registered unit with its enabled element types.
#[derive(Clone, Copy, Debug)]
pub struct RegisteredUnit {
    unit: LoweringUnit,
    enabled: TypeSet,
}

impl RegisteredUnit {
    pub fn unit(&self) -> &LoweringUnit {
        &self.unit
    }

    pub fn op_type(&self) -> &'static str {
        self.unit.op_type
    }

    /// Supported types narrowed by configuration.
    pub fn enabled_types(&self) -> TypeSet {
        self.enabled
    }

    /// Checks opset, arity, input types and the unit's structural predicate.
    pub fn check_support(&self, graph: &HostGraph, id: NodeId) -> Result<(), Rejection> {
        let node = graph.node(id);
        let unit = &self.unit;
        let variant = |reason: String| Rejection::UnsupportedVariant(reason);

        let Some(opset) = graph.opset(&node.domain) else {
            return Err(variant(format!(
                "graph imports no opset for domain '{}'",
                node.domain
            )));
        };
        if opset < unit.min_opset {
            return Err(variant(format!(
                "opset {opset} is below minimum {}",
                unit.min_opset
            )));
        }

        let inputs = node.present_input_count();
        if inputs < unit.min_inputs || inputs > unit.max_inputs {
            return Err(variant(format!("{inputs} inputs not supported")));
        }
        if let Some(missing) = (0..unit.min_inputs).find(|&i| node.input(i).is_none()) {
            return Err(variant(format!("required input {missing} is omitted")));
        }
        let outputs = node.outputs.len();
        if outputs < unit.min_outputs || outputs > unit.max_outputs {
            return Err(variant(format!("{outputs} outputs not supported")));
        }

        for (i, value) in node.inputs.iter().enumerate() {
            let Some(value) = *value else { continue };
            if unit.consumes_in_place(i) {
                continue;
            }
            let (dt, ok) = helper::get_type(graph, value);
            if !ok {
                return Err(Rejection::UnresolvedType {
                    value: graph.value_name(value).to_string(),
                });
            }
            if !self.enabled.contains(dt) {
                return Err(variant(format!(
                    "input '{}' has type {dt}, enabled types are {}",
                    graph.value_name(value),
                    self.enabled
                )));
            }
        }

        let ctx = NodeContext::new(graph, id, PrecisionPolicy::Keep);
        (unit.check)(&ctx).map_err(variant)
    }

    pub fn is_supported(&self, graph: &HostGraph, id: NodeId) -> bool {
        self.check_support(graph, id).is_ok()
    }

    /// Converts the node into `batch`. Nothing reaches the model on error.
    pub fn add_to_model(
        &self,
        ctx: &NodeContext<'_>,
        batch: &mut LayerBatch<'_>,
    ) -> Result<(), LoweringError> {
        (self.unit.lower)(ctx, batch)
    }
}

/// Immutable map from operator kind to [`RegisteredUnit`].
#[derive(Clone, Debug)]
pub struct OpRegistry {
    units: Vec<RegisteredUnit>,
    index: HashMap<&'static str, usize>,
}

impl OpRegistry {
    /// Registers `units` in order. A later unit for an already registered
    /// kind is ignored.
    pub fn new(
        units: impl IntoIterator<Item = LoweringUnit>,
        restrictions: &TypeRestrictions,
    ) -> Self {
        let mut registry = Self {
            units: Vec::new(),
            index: HashMap::new(),
        };
        for unit in units {
            if registry.index.contains_key(unit.op_type) {
                log::warn!("duplicate lowering unit for {}, keeping the first", unit.op_type);
                continue;
            }
            let enabled = restrictions.enabled(unit.op_type, unit.supported_types);
            if enabled.is_empty() {
                log::debug!("{}: no enabled element types", unit.op_type);
            }
            registry.index.insert(unit.op_type, registry.units.len());
            registry.units.push(RegisteredUnit { unit, enabled });
        }
        registry
    }

    /// Built-in units narrowed by `restrictions`.
    pub fn with_restrictions(restrictions: &TypeRestrictions) -> Self {
        Self::new(builtin_units(), restrictions)
    }

    /// Shared registry of built-in units without type restrictions.
    pub fn builtin() -> &'static OpRegistry {
        static BUILTIN: OnceLock<OpRegistry> = OnceLock::new();
        BUILTIN.get_or_init(|| Self::with_restrictions(&TypeRestrictions::default()))
    }

    pub fn lookup(&self, op_type: &str) -> Option<&RegisteredUnit> {
        self.index.get(op_type).map(|&i| &self.units[i])
    }

    /// Lowering unit for `node`; only the default domain is served.
    pub fn lookup_node(&self, graph: &HostGraph, id: NodeId) -> Option<&RegisteredUnit> {
        let node = graph.node(id);
        match node.domain.as_str() {
            "" | "ai.onnx" => self.lookup(&node.op_type),
            _ => None,
        }
    }

    /// Registered kinds in registration order.
    pub fn op_types(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.units.iter().map(|u| u.unit.op_type)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RegisteredUnit> {
        self.units.iter()
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

impl Default for OpRegistry {
    fn default() -> Self {
        Self::with_restrictions(&TypeRestrictions::default())
    }
}
