// SPDX-License-Identifier: MIT OR Apache-2.0

//! End-to-end workflows on a tiny randomly initialised model.
//!
//! Weights come from a `VarMap` and the tokenizer is an in-memory word-level
//! vocabulary, so these run on CPU without network access.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]

use std::str::FromStr;

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use candle_probe::{
    CausalLm, ChatTemplate, Defaults, DevicePolicy, Env, GenerationParams, GenericTransformer,
    HookPoint, HookSpec, KvCache, LoadedModel, ModelSettings, Precision, ProbeError,
    ProbeTokenizer, RunSettings, StopReason, TokenStream, TransformerConfig,
};

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

const TOKENIZER_JSON: &str = r#"{
    "version": "1.0",
    "truncation": null,
    "padding": null,
    "added_tokens": [
        {"id": 0, "content": "<unk>", "single_word": false, "lstrip": false,
         "rstrip": false, "normalized": false, "special": true},
        {"id": 1, "content": "</s>", "single_word": false, "lstrip": false,
         "rstrip": false, "normalized": false, "special": true}
    ],
    "normalizer": null,
    "pre_tokenizer": {"type": "Whitespace"},
    "post_processor": null,
    "decoder": null,
    "model": {
        "type": "WordLevel",
        "vocab": {
            "<unk>": 0, "</s>": 1, "nuclear": 2, "power": 3, "is": 4, "clean": 5,
            "system": 6, "user": 7, "assistant": 8, "love": 9, "hate": 10,
            "i": 11, "really": 12, "like": 13, "because": 14, "terse": 15
        },
        "unk_token": "<unk>"
    }
}"#;

const QWEN2_CONFIG: &str = r#"{
    "model_type": "qwen2",
    "hidden_size": 32,
    "num_hidden_layers": 2,
    "num_attention_heads": 4,
    "num_key_value_heads": 2,
    "intermediate_size": 64,
    "vocab_size": 16,
    "max_position_embeddings": 64,
    "rope_theta": 10000.0,
    "tie_word_embeddings": true,
    "eos_token_id": 1,
    "torch_dtype": "float32"
}"#;

const MISTRAL_CONFIG: &str = r#"{
    "model_type": "mistral",
    "hidden_size": 32,
    "num_hidden_layers": 2,
    "num_attention_heads": 4,
    "num_key_value_heads": 1,
    "intermediate_size": 48,
    "vocab_size": 16,
    "max_position_embeddings": 64,
    "sliding_window": 3,
    "eos_token_id": 1
}"#;

/// Words only, so every rendered turn maps onto the vocabulary.
const WORD_TEMPLATE: &str = "{% for message in messages %}{{ message['role'] }} {{ message['content'] }} {% endfor %}{% if add_generation_prompt %}assistant{% endif %}";

fn tokenizer() -> ProbeTokenizer {
    ProbeTokenizer::from_tokenizer(tokenizers::Tokenizer::from_str(TOKENIZER_JSON).unwrap())
}

fn build(config_json: &str, varmap: &VarMap) -> GenericTransformer {
    let config = TransformerConfig::from_json_str(config_json).unwrap();
    let vb = VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu);
    GenericTransformer::load(config, &Device::Cpu, DType::F32, vb).unwrap()
}

fn tiny_model() -> LoadedModel {
    let varmap = VarMap::new();
    let model = build(QWEN2_CONFIG, &varmap);
    LoadedModel::from_parts(Box::new(model), tokenizer(), "tiny-qwen2")
}

fn no_eos(model: &LoadedModel) -> candle_probe::Generator<'_> {
    model.generator().with_eos_token_ids(Vec::new())
}

fn row(logits: &Tensor, pos: usize) -> Vec<f32> {
    logits.get(0).unwrap().get(pos).unwrap().to_vec1().unwrap()
}

fn assert_close(a: &[f32], b: &[f32], tol: f32) {
    assert_eq!(a.len(), b.len());
    for (x, y) in a.iter().zip(b) {
        assert!((x - y).abs() < tol, "{x} vs {y}");
    }
}

// ---------------------------------------------------------------------------
// Inspection
// ---------------------------------------------------------------------------

#[test]
fn inspection_is_repeatable() {
    let model = tiny_model();
    let ids = model.tokenizer().encode("i really like nuclear power because").unwrap();
    let input = model.input_ids(&ids).unwrap();

    let a = candle_probe::inspect_next_token(model.model(), model.tokenizer(), &input, 5).unwrap();
    let b = candle_probe::inspect_next_token(model.model(), model.tokenizer(), &input, 5).unwrap();

    assert_eq!(a.logits_shape, vec![1, 6, 16]);
    assert_eq!(a.argmax.token_id, b.argmax.token_id);
    assert_eq!(a.last_logits, b.last_logits);
    assert_eq!(a.top_k.len(), 5);
    assert_eq!(a.top_k[0].token_id, a.argmax.token_id);
    assert!(a.top_k.windows(2).all(|w| w[0].logit >= w[1].logit));
}

#[test]
fn logit_lens_last_layer_matches_argmax() {
    let model = tiny_model();
    let ids = model.tokenizer().encode("nuclear power is").unwrap();
    let input = model.input_ids(&ids).unwrap();

    let report = candle_probe::inspect_next_token(model.model(), model.tokenizer(), &input, 3).unwrap();
    let lens =
        candle_probe::logit_lens(model.model(), model.tokenizer(), "nuclear power is", &input, 3)
            .unwrap();

    assert_eq!(lens.layer_results.len(), 2);
    let last = lens.layer_results.last().unwrap();
    assert_eq!(last.predictions[0].token_id, report.argmax.token_id);
    assert!(lens.to_string().contains("nuclear power is"));
}

// ---------------------------------------------------------------------------
// Tracing
// ---------------------------------------------------------------------------

#[test]
fn trace_shapes_follow_prompt_length() {
    let model = tiny_model();
    let hook = HookPoint::from("model.layers[1].input");
    assert_eq!(hook, HookPoint::LayerInput(1));

    let mut reports = Vec::new();
    for prompt in ["love", "hate is really clean"] {
        let ids = model.tokenizer().encode(prompt).unwrap();
        let input = model.input_ids(&ids).unwrap();
        reports.push(
            candle_probe::trace(
                model.model(),
                model.tokenizer(),
                prompt,
                &input,
                std::slice::from_ref(&hook),
            )
            .unwrap(),
        );
    }

    assert_eq!(reports[0].shape_of(&hook), Some(&[1, 1, 32][..]));
    assert_eq!(reports[1].shape_of(&hook), Some(&[1, 4, 32][..]));
    assert_eq!(reports[1].logits_shape, vec![1, 4, 16]);
    assert_eq!(reports[1].token_count, 4);
}

#[test]
fn trace_rejects_unknown_and_out_of_range_hooks() {
    let model = tiny_model();
    let ids = model.tokenizer().encode("love").unwrap();
    let input = model.input_ids(&ids).unwrap();

    for hook in [HookPoint::from("model.layers.1.banana"), HookPoint::LayerInput(2)] {
        let err = candle_probe::trace(model.model(), model.tokenizer(), "love", &input, &[hook])
            .unwrap_err();
        assert!(matches!(err, ProbeError::Hook(_)), "{err}");
    }
}

#[test]
fn attention_pattern_rows_sum_to_one() {
    let model = tiny_model();
    let input = model.input_ids(&[2, 3, 4]).unwrap();
    let mut hooks = HookSpec::new();
    hooks.capture(HookPoint::AttnPattern(0));
    let cache = model.model().forward(&input, &hooks).unwrap();

    let pattern = cache.require(&HookPoint::AttnPattern(0)).unwrap();
    assert_eq!(pattern.dims(), &[1, 4, 3, 3]);
    let sums: Vec<Vec<f32>> = pattern
        .sum(candle_core::D::Minus1)
        .unwrap()
        .get(0)
        .unwrap()
        .to_vec2()
        .unwrap();
    for s in sums.iter().flatten() {
        assert!((s - 1.0).abs() < 1e-5);
    }
}

// ---------------------------------------------------------------------------
// KV cache
// ---------------------------------------------------------------------------

fn check_cached_matches_full(config_json: &str) {
    let varmap = VarMap::new();
    let model = build(config_json, &varmap);
    let ids: Vec<u32> = vec![2, 3, 4, 5, 2, 3, 9];
    let full = model
        .forward(&Tensor::new(&ids[..], &Device::Cpu).unwrap().unsqueeze(0).unwrap(), &HookSpec::new())
        .unwrap()
        .into_output();

    let mut kv = KvCache::new(model.num_layers());
    let prefix = Tensor::new(&ids[..3], &Device::Cpu).unwrap().unsqueeze(0).unwrap();
    let logits = model.forward_cached(&prefix, &mut kv).unwrap();
    assert_close(&logits.get(0).unwrap().to_vec1().unwrap(), &row(&full, 2), 1e-4);

    for (pos, &id) in ids.iter().enumerate().skip(3) {
        let step = Tensor::new(&[id], &Device::Cpu).unwrap().unsqueeze(0).unwrap();
        let logits = model.forward_cached(&step, &mut kv).unwrap();
        assert_close(&logits.get(0).unwrap().to_vec1().unwrap(), &row(&full, pos), 1e-4);
    }
    assert_eq!(kv.seq_len().unwrap(), ids.len());
}

#[test]
fn cached_decoding_rejects_empty_input() {
    let varmap = VarMap::new();
    let model = build(QWEN2_CONFIG, &varmap);
    let mut kv = KvCache::new(model.num_layers());
    let empty = Tensor::zeros((1, 0), DType::U32, &Device::Cpu).unwrap();

    let err = model.forward_cached(&empty, &mut kv).unwrap_err();
    assert!(matches!(err, ProbeError::Tokenizer(_)), "{err}");
    assert_eq!(kv.seq_len().unwrap(), 0);
}

#[test]
fn cached_decoding_matches_full_forward() {
    check_cached_matches_full(QWEN2_CONFIG);
}

#[test]
fn cached_decoding_matches_full_forward_with_sliding_window() {
    check_cached_matches_full(MISTRAL_CONFIG);
}

// ---------------------------------------------------------------------------
// Generation
// ---------------------------------------------------------------------------

#[test]
fn greedy_generation_is_deterministic() {
    let model = tiny_model();
    let prompt = model.tokenizer().encode("nuclear power is").unwrap();
    let params = GenerationParams::greedy(8);

    let a = no_eos(&model).generate(&prompt, &params, |_| Ok(())).unwrap();
    let b = no_eos(&model).generate(&prompt, &params, |_| Ok(())).unwrap();

    assert_eq!(a.generated_tokens, b.generated_tokens);
    assert_eq!(a.generated_tokens.len(), 8);
    assert_eq!(a.stop_reason, StopReason::MaxTokens);
    assert_eq!(a.total_tokens, prompt.len() + 8);

    // The first greedy token is the single-pass argmax.
    let input = model.input_ids(&prompt).unwrap();
    let report = candle_probe::inspect_next_token(model.model(), model.tokenizer(), &input, 1).unwrap();
    assert_eq!(a.generated_tokens[0], report.argmax.token_id);
}

#[test]
fn seeded_sampling_is_reproducible() {
    let model = tiny_model();
    let prompt = model.tokenizer().encode("i really like").unwrap();
    let params = GenerationParams {
        seed: Some(42),
        max_new_tokens: 10,
        ..GenerationParams::default()
    };
    assert!(params.do_sample);

    let a = no_eos(&model).generate(&prompt, &params, |_| Ok(())).unwrap();
    let b = no_eos(&model).generate(&prompt, &params, |_| Ok(())).unwrap();
    assert_eq!(a.generated_tokens, b.generated_tokens);
    assert_eq!(a.generated_text, b.generated_text);
}

#[test]
fn generation_stops_at_eos_without_emitting_it() {
    let model = tiny_model();
    let prompt = model.tokenizer().encode("love").unwrap();
    let every_token: Vec<u32> = (0..16).collect();

    let mut emitted = 0;
    let result = model
        .generator()
        .with_eos_token_ids(every_token)
        .generate(&prompt, &GenerationParams::greedy(5), |_| {
            emitted += 1;
            Ok(())
        })
        .unwrap();

    assert_eq!(result.stop_reason, StopReason::Eos);
    assert!(result.generated_tokens.is_empty());
    assert_eq!(emitted, 0);
}

#[test]
fn empty_prompt_is_rejected() {
    let model = tiny_model();
    let err = model
        .generator()
        .generate(&[], &GenerationParams::greedy(4), |_| Ok(()))
        .unwrap_err();
    assert!(matches!(err, ProbeError::Tokenizer(_)));
}

// ---------------------------------------------------------------------------
// Streaming
// ---------------------------------------------------------------------------

#[test]
fn skip_prompt_streams_only_generated_text() {
    let model = tiny_model();
    let prompt = model.tokenizer().encode("nuclear power").unwrap();

    let mut streamed = String::new();
    let result = no_eos(&model)
        .generate_streaming(&prompt, &GenerationParams::greedy(6), true, |text| {
            streamed.push_str(text);
            Ok(())
        })
        .unwrap();

    assert_eq!(streamed, result.generated_text);
}

#[test]
fn streaming_without_skip_prompt_starts_with_prompt() {
    let model = tiny_model();
    let prompt = model.tokenizer().encode("nuclear power").unwrap();

    let mut streamed = String::new();
    let result = no_eos(&model)
        .generate_streaming(&prompt, &GenerationParams::greedy(4), false, |text| {
            streamed.push_str(text);
            Ok(())
        })
        .unwrap();

    assert!(streamed.starts_with("nuclear power"));
    assert_eq!(streamed, result.full_text);
}

#[test]
fn token_stream_joins_words_and_drops_special_tokens() {
    let tok = tokenizer();
    let mut stream = TokenStream::new(&tok);
    let mut chunks = Vec::new();
    for id in [2, 3, 1, 4, 5] {
        if let Some(text) = stream.push(id).unwrap() {
            chunks.push(text);
        }
    }
    if let Some(text) = stream.finish().unwrap() {
        chunks.push(text);
    }

    assert_eq!(chunks, vec!["nuclear", " power", " is", " clean"]);
    assert_eq!(stream.tokens(), &[2, 3, 1, 4, 5]);
}

// ---------------------------------------------------------------------------
// Prompt encoding and loading
// ---------------------------------------------------------------------------

#[test]
fn chat_prompt_carries_system_and_user_content() {
    let template = ChatTemplate::new(WORD_TEMPLATE, None, Some("</s>".into())).unwrap();
    let model = tiny_model().with_chat_template(template);

    let ids = model
        .encode_prompt("i like nuclear power", Some("terse"))
        .unwrap();
    let text = model.tokenizer().decode(&ids, true).unwrap();
    assert_eq!(text, "system terse user i like nuclear power assistant");

    // Without a system prompt the text is encoded as-is.
    let raw = model.encode_prompt("i like nuclear power", None).unwrap();
    assert_eq!(raw, vec![11, 13, 2, 3]);
}

#[test]
fn loads_checkpoint_from_local_directory() {
    let dir = tempfile::tempdir().unwrap();
    let varmap = VarMap::new();
    let reference = build(QWEN2_CONFIG, &varmap);
    varmap.save(dir.path().join("model.safetensors")).unwrap();
    std::fs::write(dir.path().join("config.json"), QWEN2_CONFIG).unwrap();
    std::fs::write(dir.path().join("tokenizer.json"), TOKENIZER_JSON).unwrap();
    std::fs::write(
        dir.path().join("generation_config.json"),
        r#"{"eos_token_id": 1, "do_sample": true, "temperature": 0.7}"#,
    )
    .unwrap();
    std::fs::write(
        dir.path().join("tokenizer_config.json"),
        serde_json::json!({ "chat_template": WORD_TEMPLATE, "eos_token": "</s>" }).to_string(),
    )
    .unwrap();

    let settings = ModelSettings {
        model_id: dir.path().to_string_lossy().into_owned(),
        precision: Precision::F32,
        device: DevicePolicy::Cpu,
        use_flash: true,
    };
    let loaded = LoadedModel::load(&settings).unwrap();

    assert!(!loaded.flash_attention());
    assert!(loaded.chat_template().is_some());
    assert_eq!(loaded.eos_token_ids(), &[1]);
    assert_eq!(loaded.dtype(), DType::F32);
    assert!(loaded.summary().starts_with("Qwen2ForCausalLM("));

    // Unset decoding knobs follow generation_config.json.
    let env = Env::from_pairs(Vec::<(String, String)>::new());
    let mut run = RunSettings::from_source(&env, &Defaults::COMPLETE).unwrap();
    assert!(!run.generation.do_sample);
    run.apply_generation_config(&env, loaded.generation_config()).unwrap();
    assert!(run.generation.do_sample);
    assert!((run.generation.temperature - 0.7).abs() < 1e-12);

    let ids = [2, 3, 4];
    let input = loaded.input_ids(&ids).unwrap();
    let from_disk = loaded.model().forward(&input, &HookSpec::new()).unwrap().into_output();
    let in_memory = reference.forward(&input, &HookSpec::new()).unwrap().into_output();
    assert_close(&row(&from_disk, 2), &row(&in_memory, 2), 1e-6);
}
