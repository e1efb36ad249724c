//! Inference-engine capability.
//!
//! The extractor and detector only depend on these traits. [`crate::ort_backend`]
//! provides the ONNX Runtime implementation; tests substitute deterministic fakes.

use ndarray::ArrayView4;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Suffix of the topology descriptor for a model identifier.
pub const TOPOLOGY_SUFFIX: &str = "-opt.param";
/// Suffix of the weights blob for a model identifier.
pub const WEIGHTS_SUFFIX: &str = "-opt.bin";

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("model artifact not found: {}", .0.display())]
    ArtifactMissing(PathBuf),
    #[error("failed to load model: {0}")]
    Load(String),
    #[error("inference failed: {0}")]
    Execution(String),
    #[error("output tensor not found: {0}")]
    MissingOutput(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// The two co-located files that make up a model: `{id}-opt.param` and `{id}-opt.bin`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelArtifacts {
    pub id: String,
    pub topology: PathBuf,
    pub weights: PathBuf,
}

impl ModelArtifacts {
    /// Resolve the artifact paths for model `id` inside `dir`.
    pub fn locate(dir: impl AsRef<Path>, id: &str) -> Self {
        let dir = dir.as_ref();
        Self {
            id: id.to_string(),
            topology: dir.join(format!("{id}{TOPOLOGY_SUFFIX}")),
            weights: dir.join(format!("{id}{WEIGHTS_SUFFIX}")),
        }
    }

    /// Fail with the first artifact that does not exist.
    pub fn check(&self) -> Result<(), EngineError> {
        for path in [&self.topology, &self.weights] {
            if !path.exists() {
                return Err(EngineError::ArtifactMissing(path.clone()));
            }
        }
        Ok(())
    }
}

/// Session options applied at load time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadOptions {
    /// Intra-op thread count.
    pub intra_threads: usize,
    /// Request a GPU execution provider. Best effort: loading falls back to CPU.
    pub accelerated: bool,
}

impl LoadOptions {
    /// Options with one thread per high-performance core.
    pub fn new(accelerated: bool) -> Self {
        Self {
            intra_threads: crate::cpu::performance_core_count(),
            accelerated,
        }
    }
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self::new(false)
    }
}

/// Output tensors of one run, in the model's declaration order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NamedOutputs {
    entries: Vec<(String, Vec<f32>)>,
}

impl NamedOutputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<String>, data: Vec<f32>) {
        self.entries.push((name.into(), data));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Tensor data by output name.
    pub fn get(&self, name: &str) -> Option<&[f32]> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, data)| data.as_slice())
    }

    /// Tensor data by position.
    pub fn by_index(&self, idx: usize) -> Option<&[f32]> {
        self.entries.get(idx).map(|(_, data)| data.as_slice())
    }

    /// Remove and return a named tensor without copying.
    pub fn take(&mut self, name: &str) -> Option<Vec<f32>> {
        let pos = self.entries.iter().position(|(n, _)| n == name)?;
        Some(self.entries.swap_remove(pos).1)
    }
}

/// Loads models for a concrete inference engine.
pub trait InferenceBackend {
    type Model: LoadedModel;

    fn load(
        &self,
        artifacts: &ModelArtifacts,
        options: &LoadOptions,
    ) -> Result<Self::Model, EngineError>;
}

/// A loaded network.
///
/// `run` takes `&mut self`: each call owns the execution context for its
/// duration, so a model is never driven from two threads at once.
pub trait LoadedModel {
    /// Output tensor names in declaration order.
    fn output_names(&self) -> &[String];

    /// Feed one NCHW float tensor under `input_name` and collect every output.
    fn run(
        &mut self,
        input_name: &str,
        input: ArrayView4<'_, f32>,
    ) -> Result<NamedOutputs, EngineError>;
}
