//! # Empacar
//!
//! Empacar (Spanish: "to pack") bridges a pretrained transformer checkpoint
//! with an independently implemented inference engine. It serializes the
//! model's weights and an encoded prompt into flat binary files, and it
//! defines the reference attention arithmetic the consuming engine must
//! reproduce within floating-point tolerance.
//!
//! ## What it produces
//!
//! ```text
//! model.embed_tokens.weight.bin   [vocab_size, hidden]
//! model.norm.weight.bin           [hidden]
//! layer_{0..L-1}_packed.bin       one rank-1 tensor per layer
//! prompt.bin                      [1, seq_len] float-encoded token ids
//! ```
//!
//! Every file carries a single tensor in a tagless binary layout:
//!
//! ```text
//! int64  rank
//! int64  shape[rank]        (little-endian)
//! float32 data[prod(shape)] (row-major)
//! ```
//!
//! Packed layers concatenate eleven weight tensors in a fixed order with
//! no stored boundaries; consumers recover offsets purely from element
//! counts. See [`pack`] for the schema.
//!
//! ## Example
//!
//! ```rust,ignore
//! use empacar::{ModelConfig, ModelExporter};
//!
//! let exporter = ModelExporter::new(ModelConfig::qwen3_0_6b())?;
//! let summary = exporter.export(&source, out_dir)?;
//! println!("wrote {} files", summary.files.len());
//! ```
//!
//! ## Numerical contract
//!
//! [`attention::ReferenceAttention`] pins the grouped-query attention
//! computation — per-head RMS normalization of Q/K before any score,
//! floor-based query-to-kv head pairing, causal masking with exact-zero
//! masked weights, numerically stable softmax — as the oracle an engine's
//! own kernels are checked against.

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_precision_loss)] // usize -> f32 for element counts is fine here
#![allow(clippy::cast_possible_truncation)] // i64 <-> usize at the format boundary
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::float_cmp)] // Bit-exact float comparisons are the point in tests

/// Reference attention arithmetic (GQA + QK-norm + causal mask)
pub mod attention;
/// Binary tensor container read/write
pub mod container;
/// Error types
pub mod error;
/// Full-model export driver
pub mod export;
/// Per-layer weight packing schema
pub mod pack;
/// Prompt tensor production and consumption
pub mod prompt;
/// Dense tensor type
pub mod tensor;

pub use attention::{AttentionConfig, ReferenceAttention};
pub use error::{EmpacarError, Result};
pub use export::{ModelExporter, WeightSource};
pub use pack::{LayerPacker, LayerWeights, ModelConfig};
pub use prompt::{PromptEncoder, SpecialTokenConfig, Tokenizer};
pub use tensor::Tensor;
