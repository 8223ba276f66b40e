#![no_main]

use libfuzzer_sys::fuzz_target;
use offload_coreml::ExecutionProvider;

fuzz_target!(|data: &[u8]| {
    let Ok(graph) = offload_graph::onnx::import(data) else {
        return;
    };
    // Partitioning and building should report failures, never panic.
    let provider = ExecutionProvider::default();
    if let Ok(partition) = provider.get_capability(&graph) {
        for model in provider.compile(&graph, &partition).into_iter().flatten() {
            let _ = model.encode();
        }
    }
});
