//! End-to-end tests for the offload workspace live under `tests/`.
