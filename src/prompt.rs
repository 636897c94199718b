//! Prompt tensor production and consumption
//!
//! Encodes a text prompt into the rank-2 `[1, seq_len]` tensor the
//! downstream engine loads, with token ids stored as floats. Tokenization
//! itself is an external collaborator behind the [`Tokenizer`] trait; this
//! module owns only the id-to-tensor contract.
//!
//! Control-token inclusion is governed by [`SpecialTokenConfig`], an
//! explicit value constructed once and passed to every call site. There is
//! no process-wide token registry.
//!
//! Token ids ride in f32 elements, which represent integers exactly only
//! below 2^24. Ids at or above [`MAX_TOKEN_ID`] are rejected outright, on
//! both the encode and the decode side, rather than rounding silently.

use std::path::Path;

use crate::container;
use crate::error::{EmpacarError, Result};
use crate::tensor::Tensor;

/// First token id that is no longer exactly representable as f32
pub const MAX_TOKEN_ID: u32 = 1 << 24;

/// Tokenizer capability: text to/from token-id sequences
///
/// Implemented outside this crate by whatever tokenizer the checkpoint
/// ships with.
pub trait Tokenizer {
    /// Encode text into token ids, without control tokens
    ///
    /// # Errors
    ///
    /// Implementation-defined; errors propagate to the caller unchanged.
    fn encode(&self, text: &str) -> Result<Vec<u32>>;

    /// Decode token ids back into text
    ///
    /// # Errors
    ///
    /// Implementation-defined; errors propagate to the caller unchanged.
    fn decode(&self, ids: &[u32]) -> Result<String>;
}

/// Control-token policy for prompt encoding
///
/// Constructed once from the checkpoint's tokenizer metadata and passed
/// explicitly wherever prompts are built.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpecialTokenConfig {
    /// Beginning-of-sequence token id, if the vocabulary defines one
    pub bos_id: Option<u32>,
    /// End-of-sequence token id, if the vocabulary defines one
    pub eos_id: Option<u32>,
    /// Prepend the BOS token to every prompt
    pub add_bos: bool,
    /// Append the EOS token to every prompt
    pub add_eos: bool,
}

impl SpecialTokenConfig {
    /// Policy that adds no control tokens
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    /// Frame raw token ids according to the policy
    ///
    /// # Errors
    ///
    /// Returns [`EmpacarError::InvalidConfiguration`] if a token is
    /// requested but its id is undefined.
    pub fn frame(&self, ids: Vec<u32>) -> Result<Vec<u32>> {
        let mut framed = Vec::with_capacity(ids.len() + 2);
        if self.add_bos {
            let bos = self.bos_id.ok_or_else(|| EmpacarError::InvalidConfiguration {
                reason: "add_bos requested but no bos_id configured".to_string(),
            })?;
            framed.push(bos);
        }
        framed.extend(ids);
        if self.add_eos {
            let eos = self.eos_id.ok_or_else(|| EmpacarError::InvalidConfiguration {
                reason: "add_eos requested but no eos_id configured".to_string(),
            })?;
            framed.push(eos);
        }
        Ok(framed)
    }
}

/// Builds prompt tensors from text
#[derive(Debug, Clone, Copy, Default)]
pub struct PromptEncoder {
    special: SpecialTokenConfig,
}

impl PromptEncoder {
    /// Create an encoder with the given control-token policy
    #[must_use]
    pub fn new(special: SpecialTokenConfig) -> Self {
        Self { special }
    }

    /// The encoder's control-token policy
    #[must_use]
    pub fn special_tokens(&self) -> &SpecialTokenConfig {
        &self.special
    }

    /// Encode a prompt into a `[1, seq_len]` tensor of float-encoded ids
    ///
    /// # Errors
    ///
    /// - [`EmpacarError::InvalidConfiguration`] if the prompt encodes to
    ///   zero tokens or any id is >= [`MAX_TOKEN_ID`]
    /// - Control-token policy violations per [`SpecialTokenConfig::frame`]
    pub fn encode_prompt<T: Tokenizer>(&self, tokenizer: &T, text: &str) -> Result<Tensor<f32>> {
        let ids = self.special.frame(tokenizer.encode(text)?)?;
        ids_to_tensor(&ids)
    }

    /// Encode a prompt and write it to `path` in the container format
    ///
    /// # Errors
    ///
    /// Same contract as [`encode_prompt`](Self::encode_prompt), plus
    /// [`EmpacarError::IoError`] on write failure.
    pub fn encode_to_file<T: Tokenizer>(
        &self,
        tokenizer: &T,
        text: &str,
        path: &Path,
    ) -> Result<Tensor<f32>> {
        let tensor = self.encode_prompt(tokenizer, text)?;
        container::write_tensor(path, &tensor)?;
        Ok(tensor)
    }
}

/// Build a `[1, seq_len]` prompt tensor from raw token ids
///
/// # Errors
///
/// Returns [`EmpacarError::InvalidConfiguration`] if `ids` is empty or
/// any id is >= [`MAX_TOKEN_ID`].
pub fn ids_to_tensor(ids: &[u32]) -> Result<Tensor<f32>> {
    if ids.is_empty() {
        return Err(EmpacarError::InvalidConfiguration {
            reason: "prompt encodes to zero tokens".to_string(),
        });
    }
    for &id in ids {
        if id >= MAX_TOKEN_ID {
            return Err(EmpacarError::InvalidConfiguration {
                reason: format!("token id {id} is not exactly representable as f32 (>= 2^24)"),
            });
        }
    }

    #[allow(clippy::cast_precision_loss)]
    let data = ids.iter().map(|&id| id as f32).collect();
    Tensor::from_vec(vec![1, ids.len()], data)
}

/// Recover token ids from a prompt tensor
///
/// The consumer-side contract: rank 2, leading dimension 1, every element
/// a non-negative integer below [`MAX_TOKEN_ID`].
///
/// # Errors
///
/// Returns [`EmpacarError::FormatError`] on any violation, naming the
/// offending position.
pub fn prompt_to_ids(tensor: &Tensor<f32>) -> Result<Vec<u32>> {
    let shape = tensor.shape();
    if shape.len() != 2 || shape[0] != 1 {
        return Err(EmpacarError::FormatError {
            reason: format!("prompt tensor must have shape [1, seq_len], got {shape:?}"),
        });
    }

    let mut ids = Vec::with_capacity(tensor.size());
    for (pos, &value) in tensor.data().iter().enumerate() {
        if !value.is_finite() || value < 0.0 || value.fract() != 0.0 {
            return Err(EmpacarError::FormatError {
                reason: format!("prompt position {pos} holds non-integral value {value}"),
            });
        }
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let id = value as u32;
        if id >= MAX_TOKEN_ID {
            return Err(EmpacarError::FormatError {
                reason: format!("prompt position {pos} holds id {id} >= 2^24"),
            });
        }
        ids.push(id);
    }
    Ok(ids)
}

/// Read a prompt tensor back from ids and decode it to text
///
/// # Errors
///
/// Propagates [`prompt_to_ids`] violations and tokenizer errors.
pub fn decode_prompt<T: Tokenizer>(tokenizer: &T, tensor: &Tensor<f32>) -> Result<String> {
    tokenizer.decode(&prompt_to_ids(tensor)?)
}
