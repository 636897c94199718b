//! Reference attention arithmetic
//!
//! Defines, independent of any engine, the exact computation a
//! grouped-query self-attention layer with per-head Q/K normalization and
//! causal masking must perform. A consuming engine is correct when its
//! output matches this block within floating-point tolerance; nothing here
//! is tuned for speed.
//!
//! The operation order is the contract:
//!
//! ```text
//! Q = H·Wq^T   K = H·Wk^T   V = H·Wv^T
//! per-head RMS norm on Q and K          (before any score)
//! kv head for query head h = h / (Hq/Hkv)   (floor, not h mod Hkv)
//! scores = Q·K^T / sqrt(d)
//! causal mask: scores[i][j] = -inf for j > i
//! row-wise stable softmax (subtract row max)
//! context = probs·V, heads concatenated
//! output = context·Wo^T
//! ```

use crate::error::{EmpacarError, Result};
use crate::pack::{LayerWeights, ModelConfig};
use crate::tensor::Tensor;

/// Geometry of one attention block
///
/// Validated before any computation; a bad head-count ratio is a
/// configuration error here, never an out-of-range index later.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AttentionConfig {
    /// Hidden dimension of the residual stream
    pub hidden_dim: usize,
    /// Number of query heads
    pub num_heads: usize,
    /// Number of key/value heads
    pub num_kv_heads: usize,
    /// Dimension per head (shared by Q and K; no rectangular attention)
    pub head_dim: usize,
    /// Epsilon for the per-head RMS normalization
    pub rms_eps: f32,
}

impl AttentionConfig {
    /// Derive the attention geometry from a model configuration
    #[must_use]
    pub fn from_model(config: &ModelConfig) -> Self {
        Self {
            hidden_dim: config.hidden_dim,
            num_heads: config.num_heads,
            num_kv_heads: config.num_kv_heads,
            head_dim: config.head_dim,
            rms_eps: config.rms_eps,
        }
    }

    /// Validate the geometry
    ///
    /// # Errors
    ///
    /// Returns [`EmpacarError::InvalidConfiguration`] if any dimension is
    /// zero or `num_heads` is not a multiple of `num_kv_heads`.
    pub fn validate(&self) -> Result<()> {
        let dims = [
            ("hidden_dim", self.hidden_dim),
            ("num_heads", self.num_heads),
            ("num_kv_heads", self.num_kv_heads),
            ("head_dim", self.head_dim),
        ];
        for (name, value) in dims {
            if value == 0 {
                return Err(EmpacarError::InvalidConfiguration {
                    reason: format!("{name} must be > 0"),
                });
            }
        }
        if self.num_heads % self.num_kv_heads != 0 {
            return Err(EmpacarError::InvalidConfiguration {
                reason: format!(
                    "num_heads {} must be a multiple of num_kv_heads {}",
                    self.num_heads, self.num_kv_heads
                ),
            });
        }
        Ok(())
    }

    /// Query heads per key/value head
    #[must_use]
    pub fn group_size(&self) -> usize {
        self.num_heads / self.num_kv_heads
    }

    /// Total query dimension (`num_heads * head_dim`)
    #[must_use]
    pub fn q_dim(&self) -> usize {
        self.num_heads * self.head_dim
    }

    /// Total key/value dimension (`num_kv_heads * head_dim`)
    #[must_use]
    pub fn kv_dim(&self) -> usize {
        self.num_kv_heads * self.head_dim
    }
}

/// Reference grouped-query attention block
///
/// Holds the projection matrices in the checkpoint convention
/// (`[out_features, in_features]`, applied as `y = x·W^T`) and the learned
/// per-head normalization scales.
#[derive(Debug, Clone)]
pub struct ReferenceAttention {
    config: AttentionConfig,
    w_q: Tensor<f32>,
    w_k: Tensor<f32>,
    w_v: Tensor<f32>,
    w_o: Tensor<f32>,
    q_norm: Tensor<f32>,
    k_norm: Tensor<f32>,
}

impl ReferenceAttention {
    /// Create a reference block from explicit weights
    ///
    /// # Arguments
    ///
    /// * `w_q` - `[num_heads * head_dim, hidden_dim]`
    /// * `w_k`, `w_v` - `[num_kv_heads * head_dim, hidden_dim]`
    /// * `w_o` - `[hidden_dim, num_heads * head_dim]`
    /// * `q_norm`, `k_norm` - `[head_dim]`
    ///
    /// # Errors
    ///
    /// Returns [`EmpacarError::InvalidConfiguration`] for bad geometry and
    /// [`EmpacarError::InvalidShape`] naming the first mis-shaped weight.
    #[allow(clippy::similar_names)]
    pub fn new(
        config: AttentionConfig,
        w_q: Tensor<f32>,
        w_k: Tensor<f32>,
        w_v: Tensor<f32>,
        w_o: Tensor<f32>,
        q_norm: Tensor<f32>,
        k_norm: Tensor<f32>,
    ) -> Result<Self> {
        config.validate()?;

        let checks: [(&str, &Tensor<f32>, Vec<usize>); 6] = [
            ("w_q", &w_q, vec![config.q_dim(), config.hidden_dim]),
            ("w_k", &w_k, vec![config.kv_dim(), config.hidden_dim]),
            ("w_v", &w_v, vec![config.kv_dim(), config.hidden_dim]),
            ("w_o", &w_o, vec![config.hidden_dim, config.q_dim()]),
            ("q_norm", &q_norm, vec![config.head_dim]),
            ("k_norm", &k_norm, vec![config.head_dim]),
        ];
        for (name, tensor, expected) in &checks {
            if tensor.shape() != expected.as_slice() {
                return Err(EmpacarError::InvalidShape {
                    reason: format!(
                        "{name} expected shape {expected:?}, got {:?}",
                        tensor.shape()
                    ),
                });
            }
        }

        Ok(Self {
            config,
            w_q,
            w_k,
            w_v,
            w_o,
            q_norm,
            k_norm,
        })
    }

    /// Create a reference block from an unpacked layer's weights
    ///
    /// Used to validate an engine against weights that went through the
    /// pack/unpack pipeline.
    ///
    /// # Errors
    ///
    /// Returns [`EmpacarError::InvalidConfiguration`] if the layer carries
    /// no QK normalization weights, plus the [`new`](Self::new) contract.
    pub fn from_layer(config: &ModelConfig, weights: &LayerWeights) -> Result<Self> {
        let q_norm = weights
            .q_norm
            .clone()
            .ok_or_else(|| EmpacarError::InvalidConfiguration {
                reason: "reference attention requires q_norm weights".to_string(),
            })?;
        let k_norm = weights
            .k_norm
            .clone()
            .ok_or_else(|| EmpacarError::InvalidConfiguration {
                reason: "reference attention requires k_norm weights".to_string(),
            })?;

        Self::new(
            AttentionConfig::from_model(config),
            weights.q_proj.clone(),
            weights.k_proj.clone(),
            weights.v_proj.clone(),
            weights.o_proj.clone(),
            q_norm,
            k_norm,
        )
    }

    /// The block's geometry
    #[must_use]
    pub fn config(&self) -> &AttentionConfig {
        &self.config
    }

    /// Compute the pre-projection context `[seq_len, num_heads * head_dim]`
    ///
    /// # Errors
    ///
    /// Returns [`EmpacarError::InvalidShape`] if `hidden` is not
    /// `[seq_len, hidden_dim]`.
    pub fn attend(&self, hidden: &Tensor<f32>) -> Result<Tensor<f32>> {
        let (_, context) = self.run(hidden)?;
        let seq_len = hidden.shape()[0];
        Tensor::from_vec(vec![seq_len, self.config.q_dim()], context)
    }

    /// Full block output `[seq_len, hidden_dim]`: context through `Wo`
    ///
    /// # Errors
    ///
    /// Same contract as [`attend`](Self::attend).
    pub fn forward(&self, hidden: &Tensor<f32>) -> Result<Tensor<f32>> {
        let (_, context) = self.run(hidden)?;
        let seq_len = hidden.shape()[0];
        let output = project(
            &context,
            seq_len,
            self.config.q_dim(),
            self.w_o.data(),
            self.config.hidden_dim,
        );
        Tensor::from_vec(vec![seq_len, self.config.hidden_dim], output)
    }

    /// Post-softmax attention weights `[num_heads, seq_len, seq_len]`
    ///
    /// Masked positions carry exactly 0.0; every row sums to 1. The oracle
    /// an engine checks its own probabilities against.
    ///
    /// # Errors
    ///
    /// Same contract as [`attend`](Self::attend).
    pub fn attention_probs(&self, hidden: &Tensor<f32>) -> Result<Tensor<f32>> {
        let (probs, _) = self.run(hidden)?;
        let seq_len = hidden.shape()[0];
        Tensor::from_vec(vec![self.config.num_heads, seq_len, seq_len], probs)
    }

    /// Project, normalize, score, mask, soften, and weight in one pass
    ///
    /// Returns `(probs [Hq * seq * seq], context [seq * Hq * d])`.
    fn run(&self, hidden: &Tensor<f32>) -> Result<(Vec<f32>, Vec<f32>)> {
        let shape = hidden.shape();
        if shape.len() != 2 || shape[1] != self.config.hidden_dim {
            return Err(EmpacarError::InvalidShape {
                reason: format!(
                    "hidden state must be [seq_len, {}], got {shape:?}",
                    self.config.hidden_dim
                ),
            });
        }
        let seq_len = shape[0];
        let d = self.config.head_dim;
        let q_dim = self.config.q_dim();
        let kv_dim = self.config.kv_dim();
        let group_size = self.config.group_size();

        #[allow(clippy::cast_precision_loss)]
        let scale = 1.0 / (d as f32).sqrt();

        let data = hidden.data();
        let mut q = project(data, seq_len, self.config.hidden_dim, self.w_q.data(), q_dim);
        let mut k = project(data, seq_len, self.config.hidden_dim, self.w_k.data(), kv_dim);
        let v = project(data, seq_len, self.config.hidden_dim, self.w_v.data(), kv_dim);

        // Per-head normalization comes before head expansion and before
        // any score; moving it later changes the numbers.
        rms_norm_heads(
            &mut q,
            self.config.num_heads,
            d,
            self.q_norm.data(),
            self.config.rms_eps,
        );
        rms_norm_heads(
            &mut k,
            self.config.num_kv_heads,
            d,
            self.k_norm.data(),
            self.config.rms_eps,
        );

        let mut probs = vec![0.0; self.config.num_heads * seq_len * seq_len];
        let mut context = vec![0.0; seq_len * q_dim];

        for head in 0..self.config.num_heads {
            // floor pairing: consecutive query heads share one kv head
            let kv_head = head / group_size;

            for i in 0..seq_len {
                // Scores start masked; only causal positions are filled.
                let mut scores = vec![f32::NEG_INFINITY; seq_len];
                for (j, score) in scores.iter_mut().enumerate().take(i + 1) {
                    let mut dot = 0.0;
                    for dim in 0..d {
                        dot += q[i * q_dim + head * d + dim] * k[j * kv_dim + kv_head * d + dim];
                    }
                    *score = dot * scale;
                }

                // Stable softmax; exp(-inf - max) underflows to exact 0.0
                let max_score = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                let mut sum_exp = 0.0;
                for score in &mut scores {
                    let exp_val = (*score - max_score).exp();
                    *score = exp_val;
                    sum_exp += exp_val;
                }
                let inv_sum = 1.0 / sum_exp;

                let prob_row = (head * seq_len + i) * seq_len;
                for (j, &weight) in scores.iter().enumerate() {
                    let p = weight * inv_sum;
                    probs[prob_row + j] = p;
                    for dim in 0..d {
                        context[i * q_dim + head * d + dim] += p * v[j * kv_dim + kv_head * d + dim];
                    }
                }
            }
        }

        Ok((probs, context))
    }
}

/// Row-major projection `y = x·W^T` with `w` stored `[out_dim, in_dim]`
fn project(input: &[f32], rows: usize, in_dim: usize, w: &[f32], out_dim: usize) -> Vec<f32> {
    let mut output = vec![0.0; rows * out_dim];
    for r in 0..rows {
        let x = &input[r * in_dim..(r + 1) * in_dim];
        for o in 0..out_dim {
            let w_row = &w[o * in_dim..(o + 1) * in_dim];
            let mut sum = 0.0;
            for (xi, wi) in x.iter().zip(w_row) {
                sum += xi * wi;
            }
            output[r * out_dim + o] = sum;
        }
    }
    output
}

/// In-place per-head RMS normalization with learned scale
///
/// Each head vector x of length `head_dim` becomes
/// `x / sqrt(mean(x^2) + eps) * weight`. Rows are `[num_heads * head_dim]`
/// wide; the weight vector is shared across heads and positions.
fn rms_norm_heads(data: &mut [f32], num_heads: usize, head_dim: usize, weight: &[f32], eps: f32) {
    let row_dim = num_heads * head_dim;
    let rows = data.len() / row_dim;

    for r in 0..rows {
        for h in 0..num_heads {
            let start = r * row_dim + h * head_dim;
            let head = &mut data[start..start + head_dim];

            #[allow(clippy::cast_precision_loss)]
            let mean_sq = head.iter().map(|&x| x * x).sum::<f32>() / head_dim as f32;
            let inv_rms = 1.0 / (mean_sq + eps).sqrt();

            for (x, &w) in head.iter_mut().zip(weight) {
                *x = *x * inv_rms * w;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_config() -> AttentionConfig {
        AttentionConfig {
            hidden_dim: 4,
            num_heads: 2,
            num_kv_heads: 1,
            head_dim: 2,
            rms_eps: 1e-6,
        }
    }

    /// `[out, in]` projection that copies input feature `o % in_dim` to
    /// output `o`
    fn identity_like(out_dim: usize, in_dim: usize) -> Tensor<f32> {
        let mut data = vec![0.0; out_dim * in_dim];
        for o in 0..out_dim {
            data[o * in_dim + o % in_dim] = 1.0;
        }
        Tensor::from_vec(vec![out_dim, in_dim], data).unwrap()
    }

    fn ones(len: usize) -> Tensor<f32> {
        Tensor::from_vec(vec![len], vec![1.0; len]).unwrap()
    }

    fn tiny_block(config: AttentionConfig) -> ReferenceAttention {
        ReferenceAttention::new(
            config,
            identity_like(config.q_dim(), config.hidden_dim),
            identity_like(config.kv_dim(), config.hidden_dim),
            identity_like(config.kv_dim(), config.hidden_dim),
            identity_like(config.hidden_dim, config.q_dim()),
            ones(config.head_dim),
            ones(config.head_dim),
        )
        .unwrap()
    }

    #[test]
    fn test_head_ratio_rejected_before_computation() {
        let config = AttentionConfig {
            hidden_dim: 4,
            num_heads: 3,
            num_kv_heads: 2,
            head_dim: 2,
            rms_eps: 1e-6,
        };
        let err = config.validate().unwrap_err();
        assert!(matches!(err, EmpacarError::InvalidConfiguration { .. }));
    }

    #[test]
    fn test_weight_shape_check_names_offender() {
        let config = tiny_config();
        let err = ReferenceAttention::new(
            config,
            identity_like(config.q_dim(), config.hidden_dim),
            identity_like(config.kv_dim() + 1, config.hidden_dim),
            identity_like(config.kv_dim(), config.hidden_dim),
            identity_like(config.hidden_dim, config.q_dim()),
            ones(config.head_dim),
            ones(config.head_dim),
        )
        .unwrap_err();
        match err {
            EmpacarError::InvalidShape { reason } => assert!(reason.contains("w_k")),
            other => panic!("expected InvalidShape, got {other:?}"),
        }
    }

    #[test]
    fn test_hidden_shape_check() {
        let block = tiny_block(tiny_config());
        let bad = Tensor::from_vec(vec![2, 3], vec![0.0; 6]).unwrap();
        assert!(block.forward(&bad).is_err());
    }

    #[test]
    fn test_seq_len_one_trivial_distribution() {
        let config = tiny_config();
        let block = tiny_block(config);
        let hidden = Tensor::from_vec(vec![1, 4], vec![0.5, -1.0, 2.0, 0.25]).unwrap();

        let probs = block.attention_probs(&hidden).unwrap();
        assert_eq!(probs.shape(), &[2, 1, 1]);
        for &p in probs.data() {
            assert_eq!(p, 1.0);
        }
    }

    #[test]
    fn test_probs_rows_sum_to_one() {
        let config = tiny_config();
        let block = tiny_block(config);
        let hidden =
            Tensor::from_vec(vec![3, 4], vec![0.1, 0.2, 0.3, 0.4, -0.5, 0.6, 0.7, -0.8, 0.9, 1.0, -1.1, 1.2])
                .unwrap();

        let probs = block.attention_probs(&hidden).unwrap();
        for head in 0..config.num_heads {
            for i in 0..3 {
                let row = &probs.data()[(head * 3 + i) * 3..(head * 3 + i + 1) * 3];
                let sum: f32 = row.iter().sum();
                assert!((sum - 1.0).abs() < 1e-6, "head {head} row {i}: {sum}");
            }
        }
    }

    #[test]
    fn test_rms_norm_equalizes_head_magnitudes() {
        // Two heads with very different scales normalize to the same RMS
        let mut data = vec![3.0, 3.0, 0.001, 0.001];
        rms_norm_heads(&mut data, 2, 2, &[1.0, 1.0], 1e-6);
        assert!((data[0] - 1.0).abs() < 1e-3);
        assert!((data[2] - 1.0).abs() < 1e-2);
    }

    #[test]
    fn test_rms_norm_scales_by_weight() {
        let mut data = vec![2.0, 2.0];
        rms_norm_heads(&mut data, 1, 2, &[0.5, 3.0], 1e-6);
        assert!((data[0] - 0.5).abs() < 1e-5);
        assert!((data[1] - 3.0).abs() < 1e-5);
    }

    #[test]
    fn test_project_is_x_w_transpose() {
        // w = [[1, 0], [0, 2], [1, 1]]: out 3 from in 2
        let w = [1.0, 0.0, 0.0, 2.0, 1.0, 1.0];
        let y = project(&[3.0, 4.0], 1, 2, &w, 3);
        assert_eq!(y, vec![3.0, 8.0, 7.0]);
    }
}
