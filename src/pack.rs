//! Per-layer weight packing
//!
//! Concatenates the eleven named weight tensors of one transformer layer
//! into a single rank-1 tensor, in a fixed schema order:
//!
//! ```text
//!  #  segment                   shape (Qwen3-0.6B)      elements
//!  1  input_layernorm           [1024]                      1024
//!  2  post_attention_layernorm  [1024]                      1024
//!  3  q_proj                    [2048, 1024]             2097152
//!  4  k_proj                    [1024, 1024]             1048576
//!  5  v_proj                    [1024, 1024]             1048576
//!  6  o_proj                    [1024, 2048]             2097152
//!  7  q_norm                    [128]                        128
//!  8  k_norm                    [128]                        128
//!  9  gate_proj                 [3072, 1024]             3145728
//! 10  up_proj                   [3072, 1024]             3145728
//! 11  down_proj                 [1024, 3072]             3145728
//! ```
//!
//! The sequence is load-bearing: no names or segment boundaries persist in
//! the packed buffer, so consumers recover offsets purely from each
//! segment's own element count. Reordering silently corrupts every
//! consumer.
//!
//! Model variants without per-head query/key normalization still get
//! placeholder segments 7-8, zero-filled at `head_dim` elements each, so
//! fixed-offset consumers remain valid across variants. The branch is
//! keyed off the [`ModelConfig::has_qk_norm`] capability flag resolved
//! once at load time, never off tensor absence.

use serde::{Deserialize, Serialize};

use crate::error::{EmpacarError, Result};
use crate::tensor::Tensor;

/// Number of segments in a packed layer
pub const SEGMENT_COUNT: usize = 11;

/// Segment names in packing order
pub const SEGMENT_NAMES: [&str; SEGMENT_COUNT] = [
    "input_layernorm",
    "post_attention_layernorm",
    "q_proj",
    "k_proj",
    "v_proj",
    "o_proj",
    "q_norm",
    "k_norm",
    "gate_proj",
    "up_proj",
    "down_proj",
];

/// Transformer model geometry and capabilities
///
/// Resolved once when the source checkpoint is loaded; every optional
/// behavior downstream branches on these fields explicitly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Vocabulary size (embedding table rows)
    pub vocab_size: usize,
    /// Hidden dimension
    pub hidden_dim: usize,
    /// Number of transformer layers
    pub num_layers: usize,
    /// Number of query heads
    pub num_heads: usize,
    /// Number of key/value heads (GQA when < `num_heads`)
    pub num_kv_heads: usize,
    /// Dimension per attention head
    pub head_dim: usize,
    /// MLP intermediate dimension
    pub intermediate_dim: usize,
    /// Epsilon for RMS normalization
    pub rms_eps: f32,
    /// Whether the variant carries learned per-head Q/K normalization
    pub has_qk_norm: bool,
}

impl ModelConfig {
    /// Qwen3-0.6B geometry, the reference checkpoint for this format
    #[must_use]
    pub fn qwen3_0_6b() -> Self {
        Self {
            vocab_size: 151_936,
            hidden_dim: 1024,
            num_layers: 28,
            num_heads: 16,
            num_kv_heads: 8,
            head_dim: 128,
            intermediate_dim: 3072,
            rms_eps: 1e-6,
            has_qk_norm: true,
        }
    }

    /// Validate the configuration before any packing or computation
    ///
    /// # Errors
    ///
    /// Returns [`EmpacarError::InvalidConfiguration`] if any dimension is
    /// zero or `num_heads` is not a multiple of `num_kv_heads`.
    pub fn validate(&self) -> Result<()> {
        let dims = [
            ("vocab_size", self.vocab_size),
            ("hidden_dim", self.hidden_dim),
            ("num_layers", self.num_layers),
            ("num_heads", self.num_heads),
            ("num_kv_heads", self.num_kv_heads),
            ("head_dim", self.head_dim),
            ("intermediate_dim", self.intermediate_dim),
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

    /// Query projection output dimension (`num_heads * head_dim`)
    #[must_use]
    pub fn q_dim(&self) -> usize {
        self.num_heads * self.head_dim
    }

    /// Key/value projection output dimension (`num_kv_heads * head_dim`)
    #[must_use]
    pub fn kv_dim(&self) -> usize {
        self.num_kv_heads * self.head_dim
    }
}

/// One segment of the packed-layer layout
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    /// Segment name (matches the source tensor's suffix)
    pub name: &'static str,
    /// Source tensor shape
    pub shape: Vec<usize>,
    /// Element offset inside the packed buffer
    pub offset: usize,
}

impl Segment {
    /// Element count of this segment
    #[must_use]
    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    /// Whether the segment is empty (never true for a valid layout)
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Offset table for one packed layer
///
/// Derived purely from the model geometry; the packed buffer itself stores
/// no boundary metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerLayout {
    segments: Vec<Segment>,
    total: usize,
}

impl LayerLayout {
    /// Build the layout for a model configuration
    #[must_use]
    pub fn for_config(config: &ModelConfig) -> Self {
        let shapes: [Vec<usize>; SEGMENT_COUNT] = [
            vec![config.hidden_dim],
            vec![config.hidden_dim],
            vec![config.q_dim(), config.hidden_dim],
            vec![config.kv_dim(), config.hidden_dim],
            vec![config.kv_dim(), config.hidden_dim],
            vec![config.hidden_dim, config.q_dim()],
            vec![config.head_dim],
            vec![config.head_dim],
            vec![config.intermediate_dim, config.hidden_dim],
            vec![config.intermediate_dim, config.hidden_dim],
            vec![config.hidden_dim, config.intermediate_dim],
        ];

        let mut segments = Vec::with_capacity(SEGMENT_COUNT);
        let mut offset = 0;
        for (name, shape) in SEGMENT_NAMES.into_iter().zip(shapes) {
            let len: usize = shape.iter().product();
            segments.push(Segment { name, shape, offset });
            offset += len;
        }

        Self {
            segments,
            total: offset,
        }
    }

    /// Segments in packing order
    #[must_use]
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Total element count of the packed layer
    #[must_use]
    pub fn total_elements(&self) -> usize {
        self.total
    }

    /// Look up a segment by name
    #[must_use]
    pub fn segment(&self, name: &str) -> Option<&Segment> {
        self.segments.iter().find(|s| s.name == name)
    }
}

/// The eleven weight tensors of one transformer layer
///
/// `q_norm`/`k_norm` are `Some` exactly when the model variant carries
/// per-head Q/K normalization; the packer rejects any disagreement with
/// the capability flag instead of falling back silently.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerWeights {
    /// Pre-attention RMS norm scale `[hidden]`
    pub input_layernorm: Tensor<f32>,
    /// Pre-MLP RMS norm scale `[hidden]`
    pub post_attention_layernorm: Tensor<f32>,
    /// Query projection `[num_heads * head_dim, hidden]`
    pub q_proj: Tensor<f32>,
    /// Key projection `[num_kv_heads * head_dim, hidden]`
    pub k_proj: Tensor<f32>,
    /// Value projection `[num_kv_heads * head_dim, hidden]`
    pub v_proj: Tensor<f32>,
    /// Output projection `[hidden, num_heads * head_dim]`
    pub o_proj: Tensor<f32>,
    /// Per-head query norm scale `[head_dim]`
    pub q_norm: Option<Tensor<f32>>,
    /// Per-head key norm scale `[head_dim]`
    pub k_norm: Option<Tensor<f32>>,
    /// MLP gate projection `[intermediate, hidden]`
    pub gate_proj: Tensor<f32>,
    /// MLP up projection `[intermediate, hidden]`
    pub up_proj: Tensor<f32>,
    /// MLP down projection `[hidden, intermediate]`
    pub down_proj: Tensor<f32>,
}

/// Packs one layer's weights into a single rank-1 tensor
///
/// # Examples
///
/// ```rust,ignore
/// let packer = LayerPacker::new(config)?;
/// let packed = packer.pack(&weights)?;
/// assert_eq!(packed.ndim(), 1);
/// ```
#[derive(Debug, Clone)]
pub struct LayerPacker {
    config: ModelConfig,
    layout: LayerLayout,
}

impl LayerPacker {
    /// Create a packer for a model configuration
    ///
    /// # Errors
    ///
    /// Returns [`EmpacarError::InvalidConfiguration`] if the configuration
    /// is invalid.
    pub fn new(config: ModelConfig) -> Result<Self> {
        config.validate()?;
        let layout = LayerLayout::for_config(&config);
        Ok(Self { config, layout })
    }

    /// The packed-layer offset table
    #[must_use]
    pub fn layout(&self) -> &LayerLayout {
        &self.layout
    }

    /// Pack one layer's weights into a rank-1 tensor
    ///
    /// Each tensor is flattened row-major and appended in schema order.
    /// The output owns a fresh copy of every element.
    ///
    /// # Errors
    ///
    /// Returns [`EmpacarError::InvalidShape`] if any tensor's shape
    /// disagrees with the layout, and
    /// [`EmpacarError::InvalidConfiguration`] if `q_norm`/`k_norm`
    /// presence disagrees with the `has_qk_norm` flag.
    pub fn pack(&self, weights: &LayerWeights) -> Result<Tensor<f32>> {
        let mut packed = Vec::with_capacity(self.layout.total_elements());

        for segment in self.layout.segments() {
            match segment.name {
                "q_norm" | "k_norm" => {
                    let tensor = if segment.name == "q_norm" {
                        weights.q_norm.as_ref()
                    } else {
                        weights.k_norm.as_ref()
                    };
                    if self.config.has_qk_norm {
                        let tensor = tensor.ok_or_else(|| {
                            EmpacarError::InvalidConfiguration {
                                reason: format!(
                                    "{} required: model variant has QK normalization",
                                    segment.name
                                ),
                            }
                        })?;
                        self.check_shape(segment, tensor)?;
                        packed.extend_from_slice(tensor.data());
                    } else {
                        if tensor.is_some() {
                            return Err(EmpacarError::InvalidConfiguration {
                                reason: format!(
                                    "{} supplied but model variant has no QK normalization",
                                    segment.name
                                ),
                            });
                        }
                        // Placeholder keeps fixed-offset consumers valid.
                        packed.extend(std::iter::repeat(0.0).take(segment.len()));
                    }
                }
                name => {
                    let tensor = self.required(name, weights);
                    self.check_shape(segment, tensor)?;
                    packed.extend_from_slice(tensor.data());
                }
            }
        }

        Tensor::from_vec(vec![self.layout.total_elements()], packed)
    }

    /// Recover a layer's weights from a packed rank-1 tensor
    ///
    /// Segment boundaries are derived solely from the layout's element
    /// counts. Placeholder norm segments are dropped when the variant has
    /// no QK normalization.
    ///
    /// # Errors
    ///
    /// Returns [`EmpacarError::FormatError`] if the input is not rank-1
    /// with exactly the layout's total element count.
    pub fn unpack(&self, packed: &Tensor<f32>) -> Result<LayerWeights> {
        if packed.ndim() != 1 || packed.size() != self.layout.total_elements() {
            return Err(EmpacarError::FormatError {
                reason: format!(
                    "packed layer must be rank-1 with {} elements, got rank {} with {}",
                    self.layout.total_elements(),
                    packed.ndim(),
                    packed.size()
                ),
            });
        }

        let slice = |name: &str| -> Result<Tensor<f32>> {
            let segment = self
                .layout
                .segment(name)
                .expect("segment names are fixed at compile time");
            let start = segment.offset;
            let data = packed.data()[start..start + segment.len()].to_vec();
            Tensor::from_vec(segment.shape.clone(), data)
        };

        let (q_norm, k_norm) = if self.config.has_qk_norm {
            (Some(slice("q_norm")?), Some(slice("k_norm")?))
        } else {
            (None, None)
        };

        Ok(LayerWeights {
            input_layernorm: slice("input_layernorm")?,
            post_attention_layernorm: slice("post_attention_layernorm")?,
            q_proj: slice("q_proj")?,
            k_proj: slice("k_proj")?,
            v_proj: slice("v_proj")?,
            o_proj: slice("o_proj")?,
            q_norm,
            k_norm,
            gate_proj: slice("gate_proj")?,
            up_proj: slice("up_proj")?,
            down_proj: slice("down_proj")?,
        })
    }

    fn required<'a>(&self, name: &str, weights: &'a LayerWeights) -> &'a Tensor<f32> {
        match name {
            "input_layernorm" => &weights.input_layernorm,
            "post_attention_layernorm" => &weights.post_attention_layernorm,
            "q_proj" => &weights.q_proj,
            "k_proj" => &weights.k_proj,
            "v_proj" => &weights.v_proj,
            "o_proj" => &weights.o_proj,
            "gate_proj" => &weights.gate_proj,
            "up_proj" => &weights.up_proj,
            "down_proj" => &weights.down_proj,
            _ => unreachable!("segment names are fixed at compile time"),
        }
    }

    fn check_shape(&self, segment: &Segment, tensor: &Tensor<f32>) -> Result<()> {
        if tensor.shape() != segment.shape.as_slice() {
            return Err(EmpacarError::InvalidShape {
                reason: format!(
                    "{} expected shape {:?}, got {:?}",
                    segment.name,
                    segment.shape,
                    tensor.shape()
                ),
            });
        }
        Ok(())
    }
}
