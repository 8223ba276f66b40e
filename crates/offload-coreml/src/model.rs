//! Loaded backend models and the native runtime seam.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use offload_graph::{element_count, DataType};
use tempfile::TempDir;

use crate::error::{LoadError, PredictError, RuntimeError};
use crate::model_builder::{CompiledModel, TensorDesc};
use crate::options::{ComputeOptions, ProviderOptions};

/// A read-only tensor passed to [`OffloadedModel::predict`].
#[derive(Clone, Copy, Debug)]
pub struct TensorData<'a> {
    pub data_type: DataType,
    pub shape: &'a [i64],
    /// Row-major little-endian elements.
    pub buffer: &'a [u8],
}

impl<'a> TensorData<'a> {
    pub fn new(data_type: DataType, shape: &'a [i64], buffer: &'a [u8]) -> Self {
        Self {
            data_type,
            shape,
            buffer,
        }
    }
}

/// An output buffer filled by [`OffloadedModel::predict`].
#[derive(Debug)]
pub struct TensorDataMut<'a> {
    pub data_type: DataType,
    pub shape: &'a [i64],
    pub buffer: &'a mut [u8],
}

impl<'a> TensorDataMut<'a> {
    pub fn new(data_type: DataType, shape: &'a [i64], buffer: &'a mut [u8]) -> Self {
        Self {
            data_type,
            shape,
            buffer,
        }
    }
}

/// The native backend that compiles and executes staged model documents.
pub trait Runtime: Send + Sync {
    fn load(
        &self,
        path: &Path,
        options: &ComputeOptions,
    ) -> Result<Box<dyn Execution>, RuntimeError>;
}

/// A model instance inside the runtime.
///
/// Calls are serialized by [`OffloadedModel`]; implementations need not be
/// reentrant. Inputs and outputs have been validated against the model's
/// declarations before `predict` is called.
pub trait Execution: Send {
    fn predict(
        &mut self,
        inputs: &HashMap<String, TensorData<'_>>,
        outputs: &mut HashMap<String, TensorDataMut<'_>>,
    ) -> Result<(), RuntimeError>;
}

/// A compiled subgraph loaded into a runtime.
///
/// The staged document lives in a temporary directory that is removed when
/// the model is dropped, after the runtime instance is released.
pub struct OffloadedModel {
    execution: Mutex<Box<dyn Execution>>,
    compiled: CompiledModel,
    path: PathBuf,
    _staging: TempDir,
}

impl fmt::Debug for OffloadedModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OffloadedModel")
            .field("subgraph", &self.compiled.index)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl OffloadedModel {
    /// Stages `compiled` on disk and hands it to `runtime`.
    pub fn load(
        compiled: CompiledModel,
        runtime: &dyn Runtime,
        options: &ProviderOptions,
    ) -> Result<Self, LoadError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("offload-");
        let staging = match &options.staging_dir {
            Some(dir) => builder.tempdir_in(dir)?,
            None => builder.tempdir()?,
        };
        let path = staging
            .path()
            .join(format!("subgraph_{}.mlmodel", compiled.index));
        std::fs::write(&path, compiled.encode())?;

        let execution =
            runtime
                .load(&path, &options.compute)
                .map_err(|source| LoadError::Runtime {
                    subgraph: compiled.index,
                    source,
                })?;
        log::info!(
            "loaded subgraph {} ({} layers) from {}",
            compiled.index,
            compiled.document.layers().len(),
            path.display()
        );
        Ok(Self {
            execution: Mutex::new(execution),
            compiled,
            path,
            _staging: staging,
        })
    }

    pub fn compiled(&self) -> &CompiledModel {
        &self.compiled
    }

    /// Location of the staged document.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn inputs(&self) -> &[TensorDesc] {
        &self.compiled.inputs
    }

    pub fn outputs(&self) -> &[TensorDesc] {
        &self.compiled.outputs
    }

    /// Runs one inference.
    ///
    /// Every name, element type, shape and buffer size is checked before the
    /// runtime is entered; on a validation error no buffer has been touched.
    /// Concurrent callers are serialized.
    pub fn predict(
        &self,
        inputs: &HashMap<String, TensorData<'_>>,
        outputs: &mut HashMap<String, TensorDataMut<'_>>,
    ) -> Result<(), PredictError> {
        self.validate(inputs, outputs)?;
        let mut execution = self.execution.lock().map_err(|_| PredictError::Poisoned)?;
        execution.predict(inputs, outputs)?;
        Ok(())
    }

    fn validate(
        &self,
        inputs: &HashMap<String, TensorData<'_>>,
        outputs: &HashMap<String, TensorDataMut<'_>>,
    ) -> Result<(), PredictError> {
        if let Some(name) = first_unknown(inputs.keys(), &self.compiled.inputs) {
            return Err(PredictError::UnknownInput(name));
        }
        for desc in &self.compiled.inputs {
            let t = inputs
                .get(&desc.name)
                .ok_or_else(|| PredictError::MissingInput(desc.name.clone()))?;
            check_tensor(desc, t.data_type, t.shape, t.buffer.len())?;
        }

        if let Some(name) = first_unknown(outputs.keys(), &self.compiled.outputs) {
            return Err(PredictError::UnknownOutput(name));
        }
        for desc in &self.compiled.outputs {
            let t = outputs
                .get(&desc.name)
                .ok_or_else(|| PredictError::MissingOutput(desc.name.clone()))?;
            check_tensor(desc, t.data_type, t.shape, t.buffer.len())?;
        }
        Ok(())
    }
}

/// Smallest supplied name that `declared` does not contain.
fn first_unknown<'k>(
    names: impl Iterator<Item = &'k String>,
    declared: &[TensorDesc],
) -> Option<String> {
    names
        .filter(|n| !declared.iter().any(|d| &d.name == *n))
        .min()
        .cloned()
}

fn check_tensor(
    desc: &TensorDesc,
    data_type: DataType,
    shape: &[i64],
    buffer_len: usize,
) -> Result<(), PredictError> {
    if data_type != desc.data_type {
        return Err(PredictError::TypeMismatch {
            name: desc.name.clone(),
            expected: desc.data_type,
            found: data_type,
        });
    }

    let shape_mismatch = || PredictError::ShapeMismatch {
        name: desc.name.clone(),
        expected: desc.shape.clone().unwrap_or_default(),
        found: shape.to_vec(),
    };
    if let Some(expected) = &desc.shape {
        let compatible = expected.len() == shape.len()
            && expected.iter().zip(shape).all(|(&e, &f)| e < 0 || e == f);
        if !compatible {
            return Err(shape_mismatch());
        }
    }
    let count = element_count(shape).ok_or_else(shape_mismatch)?;

    let expected = data_type
        .size_in_bytes()
        .and_then(|size| count.checked_mul(size))
        .unwrap_or(usize::MAX);
    if buffer_len != expected {
        return Err(PredictError::BufferSize {
            name: desc.name.clone(),
            expected,
            found: buffer_len,
        });
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod test_runtime {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use super::*;

    /// What a [`RecordingRuntime`] saw.
    #[derive(Debug, Default)]
    pub struct Record {
        pub loads: Vec<(PathBuf, Vec<u8>, ComputeOptions)>,
        pub predicts: usize,
        pub max_in_flight: usize,
    }

    /// Loads anything (or nothing, when `reject` is set) and copies the first
    /// input into every output.
    #[derive(Default)]
    pub struct RecordingRuntime {
        pub record: Arc<Mutex<Record>>,
        pub reject: Option<String>,
    }

    struct Echo {
        record: Arc<Mutex<Record>>,
        in_flight: Arc<AtomicUsize>,
    }

    impl Runtime for RecordingRuntime {
        fn load(
            &self,
            path: &Path,
            options: &ComputeOptions,
        ) -> Result<Box<dyn Execution>, RuntimeError> {
            if let Some(reason) = &self.reject {
                return Err(RuntimeError::Rejected(reason.clone()));
            }
            let bytes = std::fs::read(path)?;
            self.record
                .lock()
                .unwrap()
                .loads
                .push((path.to_path_buf(), bytes, *options));
            Ok(Box::new(Echo {
                record: Arc::clone(&self.record),
                in_flight: Arc::new(AtomicUsize::new(0)),
            }))
        }
    }

    impl Execution for Echo {
        fn predict(
            &mut self,
            inputs: &HashMap<String, TensorData<'_>>,
            outputs: &mut HashMap<String, TensorDataMut<'_>>,
        ) -> Result<(), RuntimeError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            {
                let mut record = self.record.lock().unwrap();
                record.predicts += 1;
                record.max_in_flight = record.max_in_flight.max(now);
            }
            std::thread::yield_now();
            let mut names: Vec<_> = inputs.keys().collect();
            names.sort();
            let source = names.first().map(|n| inputs[*n].buffer).unwrap_or(&[]);
            for out in outputs.values_mut() {
                let n = out.buffer.len().min(source.len());
                out.buffer[..n].copy_from_slice(&source[..n]);
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }
}
