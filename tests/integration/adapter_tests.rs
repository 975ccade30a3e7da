//! Adapter loading, merging and end-to-end model loading tests

use super::fixtures::*;
use approx::assert_abs_diff_eq;
use candle_core::{DType, Device, Tensor};
use policy_llm::apply::adapter::LoraAdapter;
use policy_llm::apply::merger::merge_lora_weights;
use policy_llm::device::{DeviceKind, FixedDeviceResolver};
use policy_llm::{Error, GenerationParams, InferenceEngine, ModelLoader, WeightDType};
use std::collections::HashMap;
use std::path::Path;

const DOWN_PROJ: &str = "model.layers.0.mlp.down_proj";

#[tokio::test]
async fn test_adapter_round_trip_through_disk() {
    let (_guard, dir) = create_test_dir();
    let adapter_dir = dir.join("adapter");
    create_adapter_dir(&adapter_dir, DOWN_PROJ, &[1.0, 2.0, 3.0], &[1.0, -1.0], 4.0);

    let adapter = LoraAdapter::load(&adapter_dir).await.unwrap();

    assert_eq!(adapter.modules.len(), 1);
    let module = &adapter.modules[DOWN_PROJ];
    assert_eq!(module.rank(), 1);
    assert_abs_diff_eq!(module.scale, 4.0, epsilon = 1e-12);
    assert_eq!(
        adapter.config.base_model_name_or_path.as_deref(),
        Some("microsoft/Phi-4-mini-reasoning")
    );
}

#[tokio::test]
async fn test_merge_matches_scaled_outer_product() {
    let (_guard, dir) = create_test_dir();
    let adapter_dir = dir.join("adapter");
    create_adapter_dir(&adapter_dir, DOWN_PROJ, &[1.0, 2.0, 3.0], &[1.0, -1.0], 2.0);
    let adapter = LoraAdapter::load(&adapter_dir).await.unwrap();

    let mut weights = HashMap::new();
    weights.insert(format!("{}.weight", DOWN_PROJ), zeros(2, 3));
    weights.insert("model.norm.weight".to_string(), zeros(1, 3));

    let report = merge_lora_weights(&mut weights, &adapter).unwrap();
    assert_eq!(report.merged, 1);

    // W = 0 + (2 / 1) * B @ A
    let merged = weights[&format!("{}.weight", DOWN_PROJ)].to_vec2::<f32>().unwrap();
    let expected = [[2.0, 4.0, 6.0], [-2.0, -4.0, -6.0]];
    for (row, expected_row) in merged.iter().zip(expected.iter()) {
        for (value, expected_value) in row.iter().zip(expected_row.iter()) {
            assert_abs_diff_eq!(*value, *expected_value, epsilon = 1e-6);
        }
    }
    assert_eq!(weights["model.norm.weight"].to_vec2::<f32>().unwrap(), vec![vec![0.0; 3]]);
}

#[tokio::test]
async fn test_merge_without_matching_modules_fails() {
    let (_guard, dir) = create_test_dir();
    let adapter_dir = dir.join("adapter");
    create_adapter_dir(&adapter_dir, "model.layers.9.mlp.down_proj", &[1.0], &[1.0], 1.0);
    let adapter = LoraAdapter::load(&adapter_dir).await.unwrap();

    let mut weights = HashMap::new();
    weights.insert(format!("{}.weight", DOWN_PROJ), zeros(1, 1));

    let err = merge_lora_weights(&mut weights, &adapter).unwrap_err();
    assert!(matches!(err, Error::Merge(_)));
}

#[tokio::test]
async fn test_directory_without_adapter_files_is_invalid() {
    let (_guard, dir) = create_test_dir();
    let err = LoraAdapter::load(&dir).await.unwrap_err();
    assert!(matches!(err, Error::InvalidAdapter(_)));
}

#[tokio::test]
async fn test_modules_to_save_replaces_base_weight() {
    let (_guard, dir) = create_test_dir();
    let adapter_dir = dir.join("adapter");
    create_adapter_dir(&adapter_dir, DOWN_PROJ, &[1.0, 2.0, 3.0], &[1.0, -1.0], 1.0);
    set_adapter_config(&adapter_dir, "modules_to_save", serde_json::json!(["lm_head"]));
    let head = Tensor::new(&[[1f32, 2.], [3., 4.]], &Device::Cpu).unwrap();
    add_adapter_tensors(
        &adapter_dir,
        HashMap::from([("base_model.model.lm_head.weight".to_string(), head)]),
    );

    let adapter = LoraAdapter::load(&adapter_dir).await.unwrap();
    assert!(adapter.replacements.contains_key("lm_head.weight"));

    let mut weights = HashMap::new();
    weights.insert(format!("{}.weight", DOWN_PROJ), zeros(2, 3));
    weights.insert("lm_head.weight".to_string(), zeros(2, 2));

    let report = merge_lora_weights(&mut weights, &adapter).unwrap();
    assert_eq!(report.merged, 1);
    assert_eq!(report.replaced, 1);
    assert_eq!(
        weights["lm_head.weight"].to_vec2::<f32>().unwrap(),
        vec![vec![1.0, 2.0], vec![3.0, 4.0]]
    );
}

#[tokio::test]
async fn test_dora_adapter_is_refused() {
    let (_guard, dir) = create_test_dir();
    let adapter_dir = dir.join("adapter");
    create_adapter_dir(&adapter_dir, DOWN_PROJ, &[1.0, 2.0, 3.0], &[1.0, -1.0], 1.0);
    set_adapter_config(&adapter_dir, "use_dora", serde_json::json!(true));
    add_adapter_tensors(
        &adapter_dir,
        HashMap::from([(
            format!("base_model.model.{}.lora_magnitude_vector", DOWN_PROJ),
            Tensor::ones(2, DType::F32, &Device::Cpu).unwrap(),
        )]),
    );

    let err = LoraAdapter::load(&adapter_dir).await.unwrap_err();
    assert!(matches!(err, Error::InvalidAdapter(_)));
}

const HIDDEN: usize = 8;
const INTERMEDIATE: usize = 16;

/// Tiny llama checkpoint with random weights and the fixture vocabulary
fn create_llama_checkpoint(dir: &Path) {
    std::fs::create_dir_all(dir).unwrap();
    let config = serde_json::json!({
        "architectures": ["LlamaForCausalLM"],
        "model_type": "llama",
        "hidden_size": HIDDEN,
        "intermediate_size": INTERMEDIATE,
        "vocab_size": VOCAB_SIZE,
        "num_hidden_layers": 1,
        "num_attention_heads": 2,
        "num_key_value_heads": 2,
        "rms_norm_eps": 1e-5,
        "rope_theta": 10000.0,
        "max_position_embeddings": 64,
        "bos_token_id": 1,
        "eos_token_id": EOS,
        "tie_word_embeddings": true
    });
    std::fs::write(dir.join("config.json"), config.to_string()).unwrap();
    std::fs::write(dir.join("tokenizer.json"), TOKENIZER_JSON).unwrap();

    let device = Device::Cpu;
    let randn = |shape: (usize, usize)| Tensor::randn(0f32, 0.5, shape, &device).unwrap();
    let ones = |len: usize| Tensor::ones(len, DType::F32, &device).unwrap();

    let mut tensors = HashMap::new();
    tensors.insert("model.embed_tokens.weight".to_string(), randn((VOCAB_SIZE, HIDDEN)));
    for proj in ["q_proj", "k_proj", "v_proj", "o_proj"] {
        tensors.insert(format!("model.layers.0.self_attn.{}.weight", proj), randn((HIDDEN, HIDDEN)));
    }
    tensors.insert("model.layers.0.mlp.gate_proj.weight".to_string(), randn((INTERMEDIATE, HIDDEN)));
    tensors.insert("model.layers.0.mlp.up_proj.weight".to_string(), randn((INTERMEDIATE, HIDDEN)));
    tensors.insert(format!("{}.weight", DOWN_PROJ), randn((HIDDEN, INTERMEDIATE)));
    tensors.insert("model.layers.0.input_layernorm.weight".to_string(), ones(HIDDEN));
    tensors.insert("model.layers.0.post_attention_layernorm.weight".to_string(), ones(HIDDEN));
    tensors.insert("model.norm.weight".to_string(), ones(HIDDEN));

    candle_core::safetensors::save(&tensors, dir.join("model.safetensors")).unwrap();
}

#[tokio::test]
async fn test_load_local_checkpoint_and_generate() {
    let (_guard, dir) = create_test_dir();
    let model_dir = dir.join("tiny-llama");
    let adapter_dir = dir.join("adapter");
    create_llama_checkpoint(&model_dir);
    create_adapter_dir(&adapter_dir, DOWN_PROJ, &[0.1; INTERMEDIATE], &[0.2; HIDDEN], 8.0);

    let loader = ModelLoader::new(Box::new(FixedDeviceResolver(DeviceKind::Cpu)), WeightDType::F32);
    let loaded = loader
        .load(model_dir.to_str().unwrap(), &adapter_dir)
        .await
        .unwrap();

    assert_eq!(loaded.device, DeviceKind::Cpu);
    assert_eq!(loaded.tokenizer.pad_token_id(), Some(EOS));

    let mut engine = InferenceEngine::from(loaded);
    let request = GenerationParams {
        max_length: 8,
        temperature: 0.0,
        ..Default::default()
    }
    .request("policy update");

    let first = engine.generate(&request).unwrap();
    let second = engine.generate(&request).unwrap();

    assert_eq!(first.text, second.text);
    assert!(first.usage.prompt_tokens + first.usage.completion_tokens <= 8);
}

#[tokio::test]
async fn test_loader_rejects_missing_adapter() {
    let (_guard, dir) = create_test_dir();
    let model_dir = dir.join("tiny-llama");
    create_llama_checkpoint(&model_dir);

    let loader = ModelLoader::new(Box::new(FixedDeviceResolver(DeviceKind::Cpu)), WeightDType::F32);
    let result = loader
        .load(model_dir.to_str().unwrap(), &dir.join("missing-adapter"))
        .await;

    assert!(matches!(result, Err(Error::AdapterNotFound(_))));
}

#[tokio::test]
async fn test_saved_lm_head_overrides_tied_embeddings() {
    let (_guard, dir) = create_test_dir();
    let model_dir = dir.join("tiny-llama");
    let adapter_dir = dir.join("adapter");
    create_llama_checkpoint(&model_dir);
    create_adapter_dir(&adapter_dir, DOWN_PROJ, &[0.1; INTERMEDIATE], &[0.2; HIDDEN], 8.0);
    // A zero head makes every logit equal, so greedy decoding settles on the
    // last vocabulary entry instead of anything the tied embeddings would pick
    add_adapter_tensors(
        &adapter_dir,
        HashMap::from([(
            "base_model.model.lm_head.weight".to_string(),
            zeros(VOCAB_SIZE, HIDDEN),
        )]),
    );

    let loader = ModelLoader::new(Box::new(FixedDeviceResolver(DeviceKind::Cpu)), WeightDType::F32);
    let loaded = loader
        .load(model_dir.to_str().unwrap(), &adapter_dir)
        .await
        .unwrap();

    let mut engine = InferenceEngine::from(loaded);
    let response = engine
        .generate(
            &GenerationParams {
                max_length: 6,
                temperature: 0.0,
                ..Default::default()
            }
            .request("policy update"),
        )
        .unwrap();

    assert_eq!(response.usage.completion_tokens, 4);
    assert_eq!(response.text, "review review review review");
}
