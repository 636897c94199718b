//! End-to-end export tests
//!
//! Exports a small synthetic model to a temporary directory and reads the
//! files back through the container, the way the downstream engine would.

use std::path::Path;

use empacar::container;
use empacar::export::{
    layer_file_name, layer_tensor_name, MemoryWeightSource, WeightSource, EMBEDDING_NAME,
    FINAL_NORM_NAME,
};
use empacar::pack::LayerPacker;
use empacar::{EmpacarError, ModelConfig, ModelExporter, Tensor};

fn tiny_config(has_qk_norm: bool) -> ModelConfig {
    ModelConfig {
        vocab_size: 12,
        hidden_dim: 6,
        num_layers: 3,
        num_heads: 2,
        num_kv_heads: 2,
        head_dim: 3,
        intermediate_dim: 8,
        rms_eps: 1e-6,
        has_qk_norm,
    }
}

/// Deterministic fill so every tensor's content is distinguishable
fn filled(shape: Vec<usize>, tag: f32) -> Tensor<f32> {
    let size: usize = shape.iter().product();
    let data = (0..size).map(|i| tag + i as f32 * 0.01).collect();
    Tensor::from_vec(shape, data).unwrap()
}

fn synthetic_source(config: &ModelConfig) -> MemoryWeightSource {
    let mut source = MemoryWeightSource::new();
    source.insert(
        EMBEDDING_NAME,
        filled(vec![config.vocab_size, config.hidden_dim], 1000.0),
    );
    source.insert(FINAL_NORM_NAME, filled(vec![config.hidden_dim], 2000.0));

    let packer = LayerPacker::new(config.clone()).unwrap();
    for layer in 0..config.num_layers {
        for (idx, segment) in packer.layout().segments().iter().enumerate() {
            if !config.has_qk_norm && (segment.name == "q_norm" || segment.name == "k_norm") {
                continue;
            }
            source.insert(
                layer_tensor_name(layer, segment.name),
                filled(segment.shape.clone(), (layer * 100 + idx) as f32),
            );
        }
    }
    source
}

fn assert_no_tmp_files(dir: &Path) {
    for entry in std::fs::read_dir(dir).unwrap() {
        let name = entry.unwrap().file_name();
        assert!(
            !name.to_string_lossy().ends_with(".tmp"),
            "leftover temp file {name:?}"
        );
    }
}

#[test]
fn export_produces_engine_readable_files() {
    let config = tiny_config(true);
    let source = synthetic_source(&config);
    let exporter = ModelExporter::new(config.clone()).unwrap();
    let dir = tempfile::tempdir().unwrap();

    let summary = exporter.export(&source, dir.path()).unwrap();
    assert_eq!(summary.files.len(), config.num_layers + 2);
    assert_no_tmp_files(dir.path());

    // Top-level tensors read back with their source shapes and values
    let embed = container::read_tensor(&dir.path().join(format!("{EMBEDDING_NAME}.bin"))).unwrap();
    assert_eq!(embed.shape(), &[config.vocab_size, config.hidden_dim]);
    assert_eq!(embed.data()[0], 1000.0);

    let norm = container::read_tensor(&dir.path().join(format!("{FINAL_NORM_NAME}.bin"))).unwrap();
    assert_eq!(norm.shape(), &[config.hidden_dim]);

    // Each packed layer is rank-1 at the layout's total length, and
    // unpacking recovers the exact source tensors
    let packer = LayerPacker::new(config.clone()).unwrap();
    for layer in 0..config.num_layers {
        let packed = container::read_tensor(&dir.path().join(layer_file_name(layer))).unwrap();
        assert_eq!(packed.ndim(), 1);
        assert_eq!(packed.size(), packer.layout().total_elements());

        let weights = packer.unpack(&packed).unwrap();
        let expected_q = source
            .tensor(&layer_tensor_name(layer, "q_proj"))
            .unwrap();
        assert_eq!(&weights.q_proj, expected_q);
        let expected_down = source
            .tensor(&layer_tensor_name(layer, "down_proj"))
            .unwrap();
        assert_eq!(&weights.down_proj, expected_down);
    }

    let report = exporter.verify(dir.path()).unwrap();
    assert_eq!(report.files_checked, config.num_layers + 2);
    assert_eq!(report.total_elements, summary.total_elements);
}

#[test]
fn missing_tensor_fails_whole_export_with_no_files() {
    let config = tiny_config(true);
    let mut source = synthetic_source(&config);
    // Drop a tensor from the middle of the model, not the first one the
    // exporter would touch
    source
        .remove(&layer_tensor_name(config.num_layers - 1, "o_proj"))
        .unwrap();

    let exporter = ModelExporter::new(config).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let err = exporter.export(&source, dir.path()).unwrap_err();

    match err {
        EmpacarError::MissingInput { name } => {
            assert!(name.contains("o_proj"), "{name}");
        }
        other => panic!("expected MissingInput, got {other:?}"),
    }
    assert_eq!(
        std::fs::read_dir(dir.path()).unwrap().count(),
        0,
        "a failed export must not leave files behind"
    );
}

#[test]
fn parallel_export_writes_identical_bytes() {
    let config = tiny_config(true);
    let source = synthetic_source(&config);
    let exporter = ModelExporter::new(config).unwrap();

    let seq_dir = tempfile::tempdir().unwrap();
    let par_dir = tempfile::tempdir().unwrap();
    exporter.export(&source, seq_dir.path()).unwrap();
    exporter.export_parallel(&source, par_dir.path()).unwrap();
    assert_no_tmp_files(par_dir.path());

    for entry in std::fs::read_dir(seq_dir.path()).unwrap() {
        let name = entry.unwrap().file_name();
        let seq_bytes = std::fs::read(seq_dir.path().join(&name)).unwrap();
        let par_bytes = std::fs::read(par_dir.path().join(&name)).unwrap();
        assert_eq!(seq_bytes, par_bytes, "{name:?}");
    }
}

#[test]
fn variant_without_qk_norm_packs_zero_placeholders() {
    let config = tiny_config(false);
    let source = synthetic_source(&config);
    let exporter = ModelExporter::new(config.clone()).unwrap();
    let dir = tempfile::tempdir().unwrap();
    exporter.export(&source, dir.path()).unwrap();

    let packer = LayerPacker::new(config).unwrap();
    let packed = container::read_tensor(&dir.path().join(layer_file_name(0))).unwrap();

    for name in ["q_norm", "k_norm"] {
        let seg = packer.layout().segment(name).unwrap();
        assert_eq!(seg.len(), 3);
        assert!(
            packed.data()[seg.offset..seg.offset + seg.len()]
                .iter()
                .all(|&x| x == 0.0),
            "{name} placeholder must be zero-filled"
        );
    }

    // Fixed-offset consumers see the same total length either way
    let mut with_norm = exporter.config().clone();
    with_norm.has_qk_norm = true;
    let expected = LayerPacker::new(with_norm)
        .unwrap()
        .layout()
        .total_elements();
    assert_eq!(packed.size(), expected);
}

#[test]
fn prompt_file_sits_next_to_weights() {
    use empacar::prompt::{decode_prompt, PromptEncoder, SpecialTokenConfig, Tokenizer};

    struct ByteTokenizer;
    impl Tokenizer for ByteTokenizer {
        fn encode(&self, text: &str) -> empacar::Result<Vec<u32>> {
            Ok(text.bytes().map(u32::from).collect())
        }
        fn decode(&self, ids: &[u32]) -> empacar::Result<String> {
            let bytes: Vec<u8> = ids.iter().map(|&id| id as u8).collect();
            Ok(String::from_utf8_lossy(&bytes).into_owned())
        }
    }

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("prompt.bin");
    let encoder = PromptEncoder::new(SpecialTokenConfig::none());

    let written = encoder
        .encode_to_file(&ByteTokenizer, "Hello, how are you?", &path)
        .unwrap();
    assert_eq!(written.shape()[0], 1);

    let restored = container::read_tensor(&path).unwrap();
    assert_eq!(
        decode_prompt(&ByteTokenizer, &restored).unwrap(),
        "Hello, how are you?"
    );
}
