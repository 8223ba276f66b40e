//! Provider configuration.

use std::fmt;
use std::path::PathBuf;

use crate::type_control::TypeRestrictions;

/// Weight precision in emitted models.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PrecisionPolicy {
    /// Keep float32 weights as float32.
    #[default]
    Keep,
    /// Store float32 weights as float16.
    Float16,
}

impl fmt::Display for PrecisionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Keep => "Keep",
            Self::Float16 => "Float16",
        })
    }
}

/// Options forwarded to the runtime when a model is loaded.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ComputeOptions {
    /// Restrict execution to the CPU compute unit.
    pub use_cpu_only: bool,
}

impl fmt::Display for ComputeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ComputeOptions {{ use_cpu_only: {} }}", self.use_cpu_only)
    }
}

/// Options for partitioning, building and loading.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProviderOptions {
    pub precision: PrecisionPolicy,
    /// Groups with fewer accepted nodes stay on the fallback path.
    pub min_subgraph_nodes: usize,
    pub type_restrictions: TypeRestrictions,
    pub compute: ComputeOptions,
    /// Parent directory for staged model files; the system temp dir if unset.
    pub staging_dir: Option<PathBuf>,
}

impl Default for ProviderOptions {
    fn default() -> Self {
        Self {
            precision: PrecisionPolicy::Keep,
            min_subgraph_nodes: 1,
            type_restrictions: TypeRestrictions::default(),
            compute: ComputeOptions::default(),
            staging_dir: None,
        }
    }
}

impl fmt::Display for ProviderOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ProviderOptions {{ precision: {}, min_subgraph_nodes: {}, type_restrictions: {}, compute: {}, staging_dir: ",
            self.precision, self.min_subgraph_nodes, self.type_restrictions, self.compute
        )?;
        match &self.staging_dir {
            Some(dir) => write!(f, "{} }}", dir.display()),
            None => f.write_str("default }"),
        }
    }
}
