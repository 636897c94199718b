//! Full-model export
//!
//! Drives [`LayerPacker`](crate::pack::LayerPacker) and the tensor
//! container across all layers plus the top-level tensors, producing the
//! file set the downstream engine loads:
//!
//! ```text
//! model.embed_tokens.weight.bin   [vocab_size, hidden]
//! model.norm.weight.bin           [hidden]
//! layer_{0..L-1}_packed.bin       rank-1 packed layers
//! ```
//!
//! Source tensors are resolved through the [`WeightSource`] trait using
//! the upstream checkpoint naming scheme
//! (`model.layers.{i}.self_attn.q_proj.weight`, ...). The whole export
//! fails before any file is written if a required tensor is missing or
//! mis-shaped: a partial weight set is unusable, and a silent gap would
//! misalign downstream layer indexing.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use rayon::prelude::*;
use serde::Serialize;

use crate::container;
use crate::error::{EmpacarError, Result};
use crate::pack::{LayerPacker, LayerWeights, ModelConfig, Segment};
use crate::tensor::Tensor;

/// Source name of the embedding table
pub const EMBEDDING_NAME: &str = "model.embed_tokens.weight";

/// Source name of the final norm scale
pub const FINAL_NORM_NAME: &str = "model.norm.weight";

/// Source tensor name for one segment of one layer
///
/// Follows the upstream checkpoint convention, e.g.
/// `model.layers.3.self_attn.q_proj.weight`.
#[must_use]
pub fn layer_tensor_name(layer: usize, segment: &str) -> String {
    let infix = match segment {
        "q_proj" | "k_proj" | "v_proj" | "o_proj" | "q_norm" | "k_norm" => "self_attn.",
        "gate_proj" | "up_proj" | "down_proj" => "mlp.",
        _ => "",
    };
    format!("model.layers.{layer}.{infix}{segment}.weight")
}

/// Output file name for one packed layer
#[must_use]
pub fn layer_file_name(layer: usize) -> String {
    format!("layer_{layer}_packed.bin")
}

/// Pretrained-model capability: named float tensors under a stable scheme
///
/// The trait is the seam between this crate and whatever holds the trained
/// checkpoint in memory; exporters never reach into model internals.
pub trait WeightSource {
    /// Look up a tensor by its checkpoint name
    fn tensor(&self, name: &str) -> Option<&Tensor<f32>>;
}

/// In-memory weight source backed by a name → tensor map
///
/// # Examples
///
/// ```
/// use empacar::export::{MemoryWeightSource, WeightSource};
/// use empacar::Tensor;
///
/// let mut source = MemoryWeightSource::new();
/// source.insert("model.norm.weight", Tensor::from_vec(vec![2], vec![1.0, 1.0]).unwrap());
/// assert!(source.tensor("model.norm.weight").is_some());
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemoryWeightSource {
    tensors: HashMap<String, Tensor<f32>>,
}

impl MemoryWeightSource {
    /// Create an empty source
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a named tensor, replacing any previous entry
    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor<f32>) {
        self.tensors.insert(name.into(), tensor);
    }

    /// Remove a named tensor, returning it if present
    pub fn remove(&mut self, name: &str) -> Option<Tensor<f32>> {
        self.tensors.remove(name)
    }

    /// Number of stored tensors
    #[must_use]
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    /// Whether the source is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }
}

impl WeightSource for MemoryWeightSource {
    fn tensor(&self, name: &str) -> Option<&Tensor<f32>> {
        self.tensors.get(name)
    }
}

/// Summary of a completed export
#[derive(Debug, Clone, Serialize)]
pub struct ExportSummary {
    /// Every file written, top-level first then layers in index order
    pub files: Vec<PathBuf>,
    /// Total elements written across all files
    pub total_elements: u64,
}

/// Readback report from [`ModelExporter::verify`]
#[derive(Debug, Clone, Serialize)]
pub struct VerifyReport {
    /// Number of files read back successfully
    pub files_checked: usize,
    /// Total elements found across all files
    pub total_elements: u64,
}

/// Exports a full model weight set to packed binary files
pub struct ModelExporter {
    config: ModelConfig,
    packer: LayerPacker,
}

impl ModelExporter {
    /// Create an exporter for a model configuration
    ///
    /// # Errors
    ///
    /// Returns [`EmpacarError::InvalidConfiguration`] if the configuration
    /// is invalid.
    pub fn new(config: ModelConfig) -> Result<Self> {
        let packer = LayerPacker::new(config.clone())?;
        Ok(Self { config, packer })
    }

    /// The exporter's model configuration
    #[must_use]
    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Export all layers and top-level tensors to `out_dir`
    ///
    /// A preflight pass resolves and shape-checks every required tensor
    /// before the first write; each file then goes through the atomic
    /// container write path.
    ///
    /// # Errors
    ///
    /// - [`EmpacarError::MissingInput`] naming the first absent tensor
    /// - [`EmpacarError::InvalidShape`] naming a mis-shaped tensor
    /// - [`EmpacarError::IoError`] on any write failure
    pub fn export<S: WeightSource>(&self, source: &S, out_dir: &Path) -> Result<ExportSummary> {
        self.preflight(source)?;

        let mut files = Vec::with_capacity(self.config.num_layers + 2);
        let mut total_elements = 0u64;

        for (name, tensor) in self.top_level(source)? {
            let path = out_dir.join(format!("{name}.bin"));
            container::write_tensor(&path, tensor)?;
            total_elements += tensor.size() as u64;
            files.push(path);
        }

        for layer in 0..self.config.num_layers {
            let packed = self.packer.pack(&self.gather_layer(source, layer)?)?;
            let path = out_dir.join(layer_file_name(layer));
            container::write_tensor(&path, &packed)?;
            total_elements += packed.size() as u64;
            files.push(path);
        }

        Ok(ExportSummary {
            files,
            total_elements,
        })
    }

    /// Export with per-layer packing and writing fanned out across threads
    ///
    /// Per-layer files are independent, so parallelizing changes neither
    /// the format nor any file's bytes.
    ///
    /// # Errors
    ///
    /// Same contract as [`export`](Self::export).
    pub fn export_parallel<S: WeightSource + Sync>(
        &self,
        source: &S,
        out_dir: &Path,
    ) -> Result<ExportSummary> {
        self.preflight(source)?;

        let mut files = Vec::with_capacity(self.config.num_layers + 2);
        let mut total_elements = 0u64;

        for (name, tensor) in self.top_level(source)? {
            let path = out_dir.join(format!("{name}.bin"));
            container::write_tensor(&path, tensor)?;
            total_elements += tensor.size() as u64;
            files.push(path);
        }

        let layer_results: Result<Vec<(PathBuf, u64)>> = (0..self.config.num_layers)
            .into_par_iter()
            .map(|layer| {
                let packed = self.packer.pack(&self.gather_layer(source, layer)?)?;
                let path = out_dir.join(layer_file_name(layer));
                container::write_tensor(&path, &packed)?;
                Ok((path, packed.size() as u64))
            })
            .collect();

        for (path, elements) in layer_results? {
            total_elements += elements;
            files.push(path);
        }

        Ok(ExportSummary {
            files,
            total_elements,
        })
    }

    /// Read every expected output file back and check its structure
    ///
    /// The readback counterpart of the export: each packed layer must be
    /// rank-1 with the layout's total element count, the embedding table
    /// `[vocab_size, hidden]`, the final norm `[hidden]`.
    ///
    /// # Errors
    ///
    /// Returns [`EmpacarError::IoError`] or [`EmpacarError::FormatError`]
    /// naming the offending file.
    pub fn verify(&self, out_dir: &Path) -> Result<VerifyReport> {
        let mut files_checked = 0usize;
        let mut total_elements = 0u64;

        let check = |file: String, shape: &[usize]| -> Result<u64> {
            let path = out_dir.join(&file);
            let tensor = container::read_tensor(&path)?;
            if tensor.shape() != shape {
                return Err(EmpacarError::FormatError {
                    reason: format!(
                        "{file}: expected shape {shape:?}, found {:?}",
                        tensor.shape()
                    ),
                });
            }
            Ok(tensor.size() as u64)
        };

        total_elements += check(
            format!("{EMBEDDING_NAME}.bin"),
            &[self.config.vocab_size, self.config.hidden_dim],
        )?;
        files_checked += 1;

        total_elements += check(format!("{FINAL_NORM_NAME}.bin"), &[self.config.hidden_dim])?;
        files_checked += 1;

        let layer_len = self.packer.layout().total_elements();
        for layer in 0..self.config.num_layers {
            total_elements += check(layer_file_name(layer), &[layer_len])?;
            files_checked += 1;
        }

        Ok(VerifyReport {
            files_checked,
            total_elements,
        })
    }

    /// Resolve and shape-check every tensor the export will touch
    fn preflight<S: WeightSource>(&self, source: &S) -> Result<()> {
        for (name, shape) in [
            (
                EMBEDDING_NAME.to_string(),
                vec![self.config.vocab_size, self.config.hidden_dim],
            ),
            (FINAL_NORM_NAME.to_string(), vec![self.config.hidden_dim]),
        ] {
            let tensor = resolve(source, &name)?;
            check_named_shape(&name, &shape, tensor)?;
        }

        for layer in 0..self.config.num_layers {
            for segment in self.layer_segments() {
                let name = layer_tensor_name(layer, segment.name);
                let tensor = resolve(source, &name)?;
                check_named_shape(&name, &segment.shape, tensor)?;
            }
        }
        Ok(())
    }

    fn top_level<'a, S: WeightSource>(
        &self,
        source: &'a S,
    ) -> Result<[(&'static str, &'a Tensor<f32>); 2]> {
        Ok([
            (EMBEDDING_NAME, resolve(source, EMBEDDING_NAME)?),
            (FINAL_NORM_NAME, resolve(source, FINAL_NORM_NAME)?),
        ])
    }

    fn gather_layer<S: WeightSource>(&self, source: &S, layer: usize) -> Result<LayerWeights> {
        let get = |segment: &str| -> Result<Tensor<f32>> {
            resolve(source, &layer_tensor_name(layer, segment)).cloned()
        };

        let (q_norm, k_norm) = if self.config.has_qk_norm {
            (Some(get("q_norm")?), Some(get("k_norm")?))
        } else {
            (None, None)
        };

        Ok(LayerWeights {
            input_layernorm: get("input_layernorm")?,
            post_attention_layernorm: get("post_attention_layernorm")?,
            q_proj: get("q_proj")?,
            k_proj: get("k_proj")?,
            v_proj: get("v_proj")?,
            o_proj: get("o_proj")?,
            q_norm,
            k_norm,
            gate_proj: get("gate_proj")?,
            up_proj: get("up_proj")?,
            down_proj: get("down_proj")?,
        })
    }

    /// Segments a source checkpoint must provide for this variant
    fn layer_segments(&self) -> impl Iterator<Item = &Segment> {
        let has_qk_norm = self.config.has_qk_norm;
        self.packer
            .layout()
            .segments()
            .iter()
            .filter(move |s| has_qk_norm || (s.name != "q_norm" && s.name != "k_norm"))
    }
}

fn resolve<'a, S: WeightSource>(source: &'a S, name: &str) -> Result<&'a Tensor<f32>> {
    source.tensor(name).ok_or_else(|| EmpacarError::MissingInput {
        name: name.to_string(),
    })
}

fn check_named_shape(name: &str, shape: &[usize], tensor: &Tensor<f32>) -> Result<()> {
    if tensor.shape() != shape {
        return Err(EmpacarError::InvalidShape {
            reason: format!("{name}: expected shape {shape:?}, got {:?}", tensor.shape()),
        });
    }
    Ok(())
}
