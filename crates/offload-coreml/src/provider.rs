//! Host-engine facing entry point.

use offload_graph::{GraphError, HostGraph};

use crate::capability::{evaluate, Partition};
use crate::error::{BuildError, LoadError};
use crate::model::{OffloadedModel, Runtime};
use crate::model_builder::{CompiledModel, ModelBuilder};
use crate::options::ProviderOptions;
use crate::registry::OpRegistry;

/// Partitions host graphs, builds backend models and loads them.
#[derive(Clone, Debug)]
pub struct ExecutionProvider {
    options: ProviderOptions,
    registry: OpRegistry,
}

impl ExecutionProvider {
    /// Provider over the built-in units narrowed by `options.type_restrictions`.
    pub fn new(options: ProviderOptions) -> Self {
        let registry = OpRegistry::with_restrictions(&options.type_restrictions);
        Self::with_registry(options, registry)
    }

    /// Provider over an explicitly built registry.
    pub fn with_registry(options: ProviderOptions, registry: OpRegistry) -> Self {
        log::debug!("execution provider: {options}");
        Self { options, registry }
    }

    pub fn options(&self) -> &ProviderOptions {
        &self.options
    }

    pub fn registry(&self) -> &OpRegistry {
        &self.registry
    }

    /// Splits `graph` into convertible subgraphs and rejected nodes.
    pub fn get_capability(&self, graph: &HostGraph) -> Result<Partition, GraphError> {
        evaluate(graph, &self.registry, self.options.min_subgraph_nodes)
    }

    /// Builds one model per subgraph, in subgraph order. A failed build only
    /// affects its own entry.
    pub fn compile(
        &self,
        graph: &HostGraph,
        partition: &Partition,
    ) -> Vec<Result<CompiledModel, BuildError>> {
        partition
            .subgraphs
            .iter()
            .map(|subgraph| {
                let result =
                    ModelBuilder::new(graph, subgraph, &self.registry, self.options.precision)
                        .build();
                log_build(subgraph.index, &result);
                result
            })
            .collect()
    }

    /// Like [`compile`](Self::compile), with each subgraph built on its own
    /// scoped thread.
    pub fn compile_parallel(
        &self,
        graph: &HostGraph,
        partition: &Partition,
    ) -> Vec<Result<CompiledModel, BuildError>> {
        std::thread::scope(|scope| {
            let handles: Vec<_> = partition
                .subgraphs
                .iter()
                .map(|subgraph| {
                    scope.spawn(move || {
                        let result = ModelBuilder::new(
                            graph,
                            subgraph,
                            &self.registry,
                            self.options.precision,
                        )
                        .build();
                        log_build(subgraph.index, &result);
                        result
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| match h.join() {
                    Ok(result) => result,
                    Err(panic) => std::panic::resume_unwind(panic),
                })
                .collect()
        })
    }

    /// Stages and loads one compiled model.
    pub fn load(
        &self,
        compiled: CompiledModel,
        runtime: &dyn Runtime,
    ) -> Result<OffloadedModel, LoadError> {
        OffloadedModel::load(compiled, runtime, &self.options)
    }
}

impl Default for ExecutionProvider {
    fn default() -> Self {
        Self::new(ProviderOptions::default())
    }
}

fn log_build(index: usize, result: &Result<CompiledModel, BuildError>) {
    match result {
        Ok(model) => log::info!(
            "subgraph {index}: compiled {} layers",
            model.document.layers().len()
        ),
        Err(e) => log::warn!("subgraph {index}: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use offload_graph::{DataType, Initializer, Node};

    use super::*;
    use crate::builders::test_util::*;
    use crate::capability::Rejection;
    use crate::model::test_runtime::RecordingRuntime;
    use crate::model::{TensorData, TensorDataMut};
    use crate::type_control::{TypeRestrictions, TypeSet};

    /// erf(relu(x)) and x + c as two separate branches.
    fn split_graph() -> HostGraph {
        let mut g = graph(13);
        let x = f32_input(&mut g, "x", &[1, 4]);
        let a = f32_value(&mut g, "a", &[1, 4]);
        let b = f32_value(&mut g, "b", &[1, 4]);
        let c = g
            .add_initializer("c", Initializer::from_f32(&[1, 4], &[1.0; 4]))
            .unwrap();
        let y = f32_value(&mut g, "y", &[1, 4]);
        add(&mut g, Node::new("Relu", "relu").with_io(&[x], &[a]));
        add(&mut g, Node::new("Erf", "erf").with_io(&[a], &[b]));
        add(&mut g, Node::new("Add", "add").with_io(&[x, c], &[y]));
        g.add_output(b).unwrap();
        g.add_output(y).unwrap();
        g
    }

    #[test]
    fn partition_compile_and_load() {
        let g = split_graph();
        let provider = ExecutionProvider::default();
        let partition = provider.get_capability(&g).unwrap();
        assert_eq!(partition.subgraphs.len(), 2);
        assert_eq!(partition.rejected.len(), 1);
        assert_eq!(partition.rejected[0].reason, Rejection::UnsupportedOperator);

        let models: Vec<_> = provider
            .compile(&g, &partition)
            .into_iter()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(models[0].layer_types(), vec!["activation"]);
        assert_eq!(models[1].layer_types(), vec!["loadConstant", "add"]);
        assert_eq!(models[1].inputs[0].name, "x");

        let runtime = RecordingRuntime::default();
        let loaded = provider.load(models[0].clone(), &runtime).unwrap();
        let x = vec![0u8; 16];
        let mut a = vec![1u8; 16];
        let inputs = HashMap::from([("x".to_string(), TensorData::new(DataType::Float, &[1, 4], &x))]);
        let mut outputs = HashMap::from([(
            "a".to_string(),
            TensorDataMut::new(DataType::Float, &[1, 4], &mut a),
        )]);
        loaded.predict(&inputs, &mut outputs).unwrap();
        drop(outputs);
        assert_eq!(a, x);
    }

    #[test]
    fn parallel_compile_matches_sequential() {
        let g = split_graph();
        let provider = ExecutionProvider::default();
        let partition = provider.get_capability(&g).unwrap();
        let seq: Vec<_> = provider
            .compile(&g, &partition)
            .into_iter()
            .map(Result::unwrap)
            .collect();
        let par: Vec<_> = provider
            .compile_parallel(&g, &partition)
            .into_iter()
            .map(Result::unwrap)
            .collect();
        assert_eq!(seq, par);
    }

    #[test]
    fn options_shape_the_partition() {
        let g = split_graph();
        let provider = ExecutionProvider::new(ProviderOptions {
            min_subgraph_nodes: 2,
            ..ProviderOptions::default()
        });
        let partition = provider.get_capability(&g).unwrap();
        assert!(partition.subgraphs.is_empty());
        assert_eq!(partition.rejected.len(), 3);

        let provider = ExecutionProvider::new(ProviderOptions {
            type_restrictions: TypeRestrictions::default()
                .allow("Relu", TypeSet::from_types(&[DataType::Float16])),
            ..ProviderOptions::default()
        });
        let partition = provider.get_capability(&g).unwrap();
        assert_eq!(partition.subgraphs.len(), 1);
        assert!(matches!(
            partition.rejection(partition.rejected[0].node),
            Some(Rejection::UnsupportedVariant(_))
        ));
    }
}
