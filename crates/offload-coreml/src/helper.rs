//! Type and shape inspection of graph values.
//!
//! Missing type information is an expected condition for values whose type
//! is only known at run time. Callers treat it as "cannot lower", never as a
//! hard error.

use offload_graph::{DataType, Dim, HostGraph, ValueId};

/// Declared element type of `value`.
///
/// Returns `(DataType::Undefined, false)` when the value has no tensor type
/// or no element type, and logs a warning naming the value.
pub fn get_type(graph: &HostGraph, value: ValueId) -> (DataType, bool) {
    let v = graph.value(value);
    match v.ty.as_ref().and_then(|t| t.elem_type) {
        Some(dt) => (dt, true),
        None => {
            log::warn!("value [{}] has no input type", v.name);
            (DataType::Undefined, false)
        }
    }
}

/// `Option` form of [`get_type`].
pub fn element_type(graph: &HostGraph, value: ValueId) -> Option<DataType> {
    match get_type(graph, value) {
        (dt, true) => Some(dt),
        _ => None,
    }
}

/// Declared shape of `value`, if ranked.
pub fn get_shape(graph: &HostGraph, value: ValueId) -> Option<&[Dim]> {
    graph.value(value).ty.as_ref()?.shape.as_deref()
}

/// Declared rank of `value`, if ranked.
pub fn get_rank(graph: &HostGraph, value: ValueId) -> Option<usize> {
    get_shape(graph, value).map(<[Dim]>::len)
}

/// Shape with every non-fixed dimension mapped to `-1`.
pub fn shape_or_dynamic(dims: &[Dim]) -> Vec<i64> {
    dims.iter().map(|d| d.fixed().unwrap_or(-1)).collect()
}

/// Shape if every dimension is fixed.
pub fn static_shape(graph: &HostGraph, value: ValueId) -> Option<Vec<i64>> {
    graph.value(value).ty.as_ref()?.static_shape()
}

/// Whether the declared shape holds exactly one element.
pub fn is_scalar_like(dims: &[Dim]) -> bool {
    dims.iter().all(|d| d.fixed() == Some(1))
}
