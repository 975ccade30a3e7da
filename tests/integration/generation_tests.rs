//! Generation driver tests against a scripted model

use super::fixtures::*;
use policy_llm::{FinishReason, GenerationParams, GenerationRequest, InferenceEngine};

fn engine(model: ScriptedModel) -> InferenceEngine {
    InferenceEngine::new(Box::new(model), test_tokenizer())
}

fn greedy(prompt: &str, max_length: usize) -> GenerationRequest {
    GenerationParams {
        max_length,
        temperature: 0.0,
        ..Default::default()
    }
    .request(prompt)
}

#[test]
fn test_greedy_generation_stops_at_eos() {
    let mut engine = engine(ScriptedModel::new());

    let response = engine.generate(&greedy("policy", 512)).unwrap();

    assert_eq!(response.text, "update approved denied");
    assert_eq!(response.finish_reason, FinishReason::Eos);
    assert_eq!(response.usage.prompt_tokens, 1);
    assert_eq!(response.usage.completion_tokens, 4);
}

#[test]
fn test_greedy_generation_is_deterministic() {
    let mut engine = engine(ScriptedModel::new());

    let first = engine.generate(&greedy("policy update", 512)).unwrap();
    let second = engine.generate(&greedy("policy update", 512)).unwrap();

    assert_eq!(first.text, second.text);
    assert_eq!(first.text, "approved denied");
}

#[test]
fn test_response_does_not_start_with_prompt() {
    let mut engine = engine(ScriptedModel::new());
    let prompt = "policy";

    let response = engine.generate(&greedy(prompt, 512)).unwrap();

    assert!(!response.text.starts_with(prompt));
}

#[test]
fn test_max_length_counts_prompt_tokens() {
    let mut engine = engine(ScriptedModel::endless());

    let response = engine.generate(&greedy("policy update", 5)).unwrap();

    assert_eq!(response.finish_reason, FinishReason::MaxLength);
    assert_eq!(response.usage.prompt_tokens + response.usage.completion_tokens, 5);
    assert_eq!(response.text, "approved denied policy");
}

#[test]
fn test_prompt_at_max_length_generates_nothing() {
    let model = ScriptedModel::new();
    let log = model.log.clone();
    let mut engine = engine(model);

    let response = engine.generate(&greedy("policy update", 2)).unwrap();

    assert_eq!(response.text, "");
    assert_eq!(response.usage.completion_tokens, 0);
    assert!(log.lock().unwrap().forwards.is_empty());
}

#[test]
fn test_kv_cache_offsets() {
    let model = ScriptedModel::new();
    let log = model.log.clone();
    let mut engine = engine(model);

    engine.generate(&greedy("policy update", 512)).unwrap();
    engine.generate(&greedy("policy", 512)).unwrap();

    let log = log.lock().unwrap();
    assert_eq!(log.resets, 2);

    let offsets: Vec<(usize, usize)> = log
        .forwards
        .iter()
        .map(|call| (call.input_len, call.seqlen_offset))
        .collect();
    assert_eq!(
        offsets,
        vec![
            // "policy update" -> approved, denied, <eos>
            (2, 0),
            (1, 2),
            (1, 3),
            // "policy" -> update, approved, denied, <eos>
            (1, 0),
            (1, 1),
            (1, 2),
            (1, 3),
        ]
    );
}

#[test]
fn test_seeded_sampling_is_reproducible() {
    let request = GenerationParams {
        max_length: 12,
        temperature: 2.0,
        seed: Some(1234),
        ..Default::default()
    }
    .request("review");

    let first = engine(ScriptedModel::endless()).generate(&request).unwrap();
    let second = engine(ScriptedModel::endless()).generate(&request).unwrap();

    assert_eq!(first.text, second.text);
}

#[test]
fn test_empty_prompt_is_rejected() {
    let mut engine = engine(ScriptedModel::new());
    assert!(engine.generate(&greedy("", 512)).is_err());
}
