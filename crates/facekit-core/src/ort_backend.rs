//! ONNX Runtime implementation of the inference-engine capability.
//!
//! The topology descriptor is an ONNX graph whose initializers live as
//! external data in the sibling weights blob, so the session is built from
//! the topology path and ONNX Runtime resolves the weights next to it.

use crate::engine::{
    EngineError, InferenceBackend, LoadOptions, LoadedModel, ModelArtifacts, NamedOutputs,
};
use ndarray::ArrayView4;
use ort::ep::CUDA as CUDAExecutionProvider;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;

/// ONNX Runtime backend.
#[derive(Debug, Clone, Copy, Default)]
pub struct OrtBackend;

/// A committed ONNX Runtime session.
pub struct OrtModel {
    session: Session,
    output_names: Vec<String>,
}

impl InferenceBackend for OrtBackend {
    type Model = OrtModel;

    fn load(
        &self,
        artifacts: &ModelArtifacts,
        options: &LoadOptions,
    ) -> Result<OrtModel, EngineError> {
        artifacts.check()?;

        let threads = options.intra_threads.max(1);
        let (session, accelerated) = with_cpu_fallback(&artifacts.id, options.accelerated, |gpu| {
            build_session(&artifacts.topology, threads, gpu)
        })?;

        let output_names: Vec<String> = session
            .outputs()
            .iter()
            .map(|o| o.name().to_string())
            .collect();

        tracing::info!(
            model = %artifacts.id,
            topology = %artifacts.topology.display(),
            weights = %artifacts.weights.display(),
            threads,
            accelerated,
            inputs = ?session.inputs().iter().map(|i| i.name()).collect::<Vec<_>>(),
            outputs = ?output_names,
            "loaded ONNX model"
        );

        Ok(OrtModel {
            session,
            output_names,
        })
    }
}

/// Build with the GPU when requested, rebuilding on CPU if that fails.
///
/// Returns the built value and whether it is GPU-backed.
fn with_cpu_fallback<T>(
    model: &str,
    accelerated: bool,
    mut build: impl FnMut(bool) -> Result<T, EngineError>,
) -> Result<(T, bool), EngineError> {
    if accelerated {
        match build(true) {
            Ok(value) => return Ok((value, true)),
            Err(e) => {
                tracing::warn!(model, error = %e, "GPU execution provider unavailable, using CPU");
            }
        }
    }
    Ok((build(false)?, false))
}

fn build_session(
    topology: &Path,
    threads: usize,
    accelerated: bool,
) -> Result<Session, EngineError> {
    let mut builder = Session::builder()?
        .with_intra_threads(threads)
        .map_err(ort::Error::from)?;
    if accelerated {
        // A provider that fails to register is an error, not a silent CPU session.
        let cuda = CUDAExecutionProvider::default().build().error_on_failure();
        builder = builder
            .with_execution_providers([cuda])
            .map_err(ort::Error::from)?;
    }
    builder
        .commit_from_file(topology)
        .map_err(|e| EngineError::Load(format!("{}: {e}", topology.display())))
}

impl LoadedModel for OrtModel {
    fn output_names(&self) -> &[String] {
        &self.output_names
    }

    fn run(
        &mut self,
        input_name: &str,
        input: ArrayView4<'_, f32>,
    ) -> Result<NamedOutputs, EngineError> {
        let outputs = self
            .session
            .run(ort::inputs![input_name => TensorRef::from_array_view(input)?])?;

        let mut named = NamedOutputs::new();
        for name in &self.output_names {
            let value = outputs
                .get(name.as_str())
                .ok_or_else(|| EngineError::MissingOutput(name.clone()))?;
            let (_, data) = value
                .try_extract_tensor::<f32>()
                .map_err(|e| EngineError::Execution(format!("output {name}: {e}")))?;
            named.push(name.clone(), data.to_vec());
        }

        Ok(named)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fallback_rebuilds_on_cpu() {
        let mut calls = Vec::new();
        let (value, gpu) = with_cpu_fallback("m", true, |gpu| {
            calls.push(gpu);
            if gpu {
                Err(EngineError::Load("no CUDA".into()))
            } else {
                Ok("cpu session")
            }
        })
        .unwrap();
        assert_eq!(value, "cpu session");
        assert!(!gpu);
        assert_eq!(calls, vec![true, false]);
    }

    #[test]
    fn test_fallback_keeps_gpu_session() {
        let (_, gpu) = with_cpu_fallback("m", true, |gpu| Ok::<_, EngineError>(gpu)).unwrap();
        assert!(gpu);
    }

    #[test]
    fn test_cpu_only_never_tries_gpu() {
        let mut calls = Vec::new();
        let (_, gpu) = with_cpu_fallback("m", false, |gpu| {
            calls.push(gpu);
            Ok::<_, EngineError>(())
        })
        .unwrap();
        assert!(!gpu);
        assert_eq!(calls, vec![false]);
    }

    #[test]
    fn test_cpu_failure_propagates() {
        let err = with_cpu_fallback("m", true, |_| Err::<(), _>(EngineError::Load("bad".into())))
            .unwrap_err();
        assert!(matches!(err, EngineError::Load(_)));
    }

    #[test]
    fn test_missing_artifacts_fail_before_session() {
        let dir = tempfile::tempdir().unwrap();
        let artifacts = ModelArtifacts::locate(dir.path(), "scrfd_2.5g_kps");
        let err = OrtBackend.load(&artifacts, &LoadOptions::default()).err().unwrap();
        assert!(matches!(err, EngineError::ArtifactMissing(p) if p == artifacts.topology));
    }
}
