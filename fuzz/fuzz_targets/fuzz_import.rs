#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Arbitrary protobuf bytes must import or fail, never panic.
    let _ = offload_graph::onnx::import(data);
});
