//! Adapter checkpoint serialization.
//!
//! The file extension selects the format: `.safetensors` via the MLX
//! runtime, `.gguf` via the hand-written writer in [`crate::gguf`]. Any
//! other extension is an explicit unsupported-format error.

use std::collections::HashMap;
use std::path::Path;
use std::rc::Rc;

use mlx_rs::Array;
use mlxtune_core::{MlxTuneError, Result};

/// Serialization format for adapter checkpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CheckpointFormat {
    /// Safetensors archive.
    #[default]
    Safetensors,
    /// GGUF v3 archive.
    Gguf,
}

impl CheckpointFormat {
    /// File extension selecting this format.
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Safetensors => "safetensors",
            Self::Gguf => "gguf",
        }
    }
}

fn extension_of(path: &Path) -> Result<&str> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .ok_or_else(|| MlxTuneError::UnsupportedCheckpointFormat(path.display().to_string()))
}

/// Write a flat name-to-tensor map in the format selected by the path's
/// extension.
pub(crate) fn save_arrays(path: &Path, arrays: HashMap<Rc<str>, Array>) -> Result<()> {
    match extension_of(path)? {
        "safetensors" => {
            Array::save_safetensors(arrays, None, path)?;
            Ok(())
        }
        "gguf" => crate::gguf::save_tensors(path, &arrays, &[]),
        other => Err(MlxTuneError::UnsupportedCheckpointFormat(other.to_string())),
    }
}

/// Read a flat name-to-tensor map in the format selected by the path's
/// extension.
pub(crate) fn load_arrays(path: &Path) -> Result<HashMap<String, Array>> {
    match extension_of(path)? {
        "safetensors" => Ok(Array::load_safetensors(path)?),
        "gguf" => crate::gguf::load_tensors(path),
        other => Err(MlxTuneError::UnsupportedCheckpointFormat(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_extension_is_rejected() {
        let err = save_arrays(Path::new("adapters.npz"), HashMap::new()).unwrap_err();
        assert!(matches!(err, MlxTuneError::UnsupportedCheckpointFormat(ref ext) if ext == "npz"));

        let err = load_arrays(Path::new("adapters.bin")).unwrap_err();
        assert!(matches!(err, MlxTuneError::UnsupportedCheckpointFormat(ref ext) if ext == "bin"));
    }
}
