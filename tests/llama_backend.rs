use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};
use candle_transformers::models::llama::{Llama, LlamaConfig};
use rand::SeedableRng;
use rand::rngs::StdRng;
use tokenizers::Tokenizer;

use thinkdeeper::backend::loader::load_llama_dir;
use thinkdeeper::backend::{LlamaModel, LlamaSource, TokenSource};
use thinkdeeper::inference::Sampler;
use thinkdeeper::tokenizer::Vocabulary;
use thinkdeeper::{BackendError, ConfigError, ReasoningController, SessionConfig, ThinkError};

const VOCAB: &[&str] = &[
    "<eos>", "<think>", "</think>", "<unk>", "hmm", "so", "the", "sky", "is", "blue", "because",
    "why",
];

fn config_json(max_positions: usize) -> String {
    format!(
        r#"{{
            "hidden_size": 8,
            "intermediate_size": 16,
            "vocab_size": {vocab},
            "num_hidden_layers": 1,
            "num_attention_heads": 2,
            "num_key_value_heads": 2,
            "rms_norm_eps": 1e-5,
            "rope_theta": 10000.0,
            "max_position_embeddings": {max_positions},
            "eos_token_id": 0,
            "tie_word_embeddings": false
        }}"#,
        vocab = VOCAB.len()
    )
}

fn tokenizer_json() -> String {
    let added = VOCAB[..3]
        .iter()
        .enumerate()
        .map(|(id, content)| {
            serde_json::json!({
                "id": id,
                "content": content,
                "single_word": false,
                "lstrip": false,
                "rstrip": false,
                "normalized": false,
                "special": id == 0,
            })
        })
        .collect::<Vec<_>>();
    let vocab: serde_json::Map<String, serde_json::Value> = VOCAB
        .iter()
        .enumerate()
        .map(|(id, word)| ((*word).to_string(), serde_json::json!(id)))
        .collect();

    serde_json::json!({
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": added,
        "normalizer": null,
        "pre_tokenizer": {"type": "Whitespace"},
        "post_processor": null,
        "decoder": null,
        "model": {"type": "WordLevel", "vocab": vocab, "unk_token": "<unk>"}
    })
    .to_string()
}

fn tiny_tokenizer() -> anyhow::Result<Tokenizer> {
    tokenizer_json()
        .parse::<Tokenizer>()
        .map_err(anyhow::Error::msg)
}

/// Randomly initialised model plus the var map holding its weights.
fn tiny_model(max_positions: usize) -> anyhow::Result<(LlamaModel, VarMap)> {
    let device = Device::Cpu;
    let config: LlamaConfig = serde_json::from_str(&config_json(max_positions))?;
    let config = config.into_config(false);

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let model = Llama::load(vb, &config)?;
    Ok((LlamaModel::new(model, config, DType::F32, device), varmap))
}

fn session() -> SessionConfig {
    SessionConfig {
        min_reasoning_units: 4,
        max_reasoning_units: 16,
        max_thought_switches: 8,
        max_answer_units: 8,
        replacement_phrases: vec!["hmm".into(), "so".into()],
        ..SessionConfig::default()
    }
}

fn source(model: &Arc<LlamaModel>, tokenizer: &Arc<Tokenizer>, seed: u64) -> LlamaSource {
    LlamaSource::new(
        Arc::clone(model),
        Arc::clone(tokenizer),
        Sampler::default(),
        Some(seed),
    )
}

// ==================== Vocabulary ====================

#[test]
fn test_markers_resolve_to_single_tokens() -> anyhow::Result<()> {
    let (model, _) = tiny_model(128)?;
    let tokenizer = Arc::new(tiny_tokenizer()?);
    let src = source(&Arc::new(model), &tokenizer, 0);

    assert_eq!(src.resolve_marker("<think>")?, 1);
    assert_eq!(src.resolve_marker("</think>")?, 2);
    assert_eq!(src.end_of_sequence(), vec![0]);
    assert_eq!(src.count_units("why is the sky blue")?, 5);

    // "</", "reason", ">" after pre-tokenization
    assert!(matches!(
        src.resolve_marker("</reason>"),
        Err(ConfigError::AmbiguousMarker { pieces: 3, .. })
    ));
    Ok(())
}

// ==================== Context threading ====================

#[test]
fn test_forced_marker_follows_pending_accepted_token() -> anyhow::Result<()> {
    let (model, _) = tiny_model(128)?;
    let tokenizer = Arc::new(tiny_tokenizer()?);
    let mut src = source(&Arc::new(model), &tokenizer, 5);

    let mut ctx = src.open("why is the sky")?;
    let first = src.propose(&mut ctx)?;
    assert_eq!(ctx.position(), 4);

    // accepted token is still pending when the marker is forced in
    src.accept(&mut ctx, &first)?;
    assert_eq!(src.inject(&mut ctx, "</think>")?, 1);
    src.propose(&mut ctx)?;
    assert_eq!(ctx.position(), 6);

    // a discarded proposal replaced by a phrase feeds only the phrase
    src.inject(&mut ctx, "hmm")?;
    src.propose(&mut ctx)?;
    assert_eq!(ctx.position(), 7);
    Ok(())
}

// ==================== Controller over the model ====================

#[test]
fn test_controller_bounds_hold_with_random_model() -> anyhow::Result<()> {
    let (model, _) = tiny_model(256)?;
    let model = Arc::new(model);
    let tokenizer = Arc::new(tiny_tokenizer()?);
    let cfg = session();

    for seed in 0..5 {
        let mut controller = ReasoningController::new(source(&model, &tokenizer, seed), cfg.clone())?;
        let mut rng = StdRng::seed_from_u64(seed);
        let out = controller.run("why is the sky blue", &mut rng)?;

        assert!(out.text.starts_with("<think>\n"), "{:?}", out.text);
        assert!(out.text.contains("</think>"), "{:?}", out.text);
        assert!(out.steps <= cfg.step_bound());
        if !out.forced_close {
            assert!(out.reasoning_units >= cfg.min_reasoning_units);
        }
        assert!(out.units_consumed > 0);
    }
    Ok(())
}

#[test]
fn test_context_overflow_is_backend_error() -> anyhow::Result<()> {
    let (model, _) = tiny_model(12)?;
    let model = Arc::new(model);
    let tokenizer = Arc::new(tiny_tokenizer()?);
    // the span cannot close before the context runs out
    let cfg = SessionConfig {
        min_reasoning_units: 100,
        max_reasoning_units: 100,
        max_thought_switches: 64,
        ..session()
    };

    let mut controller = ReasoningController::new(source(&model, &tokenizer, 3), cfg)?;
    let mut rng = StdRng::seed_from_u64(3);
    let err = controller.run("why", &mut rng).unwrap_err();

    assert!(!err.is_config());
    assert!(
        matches!(
            err,
            ThinkError::Backend(BackendError::ContextOverflow { limit: 12, .. })
        ),
        "{err:?}"
    );
    Ok(())
}

#[test]
fn test_runs_share_one_model_across_threads() -> anyhow::Result<()> {
    let (model, _) = tiny_model(256)?;
    let model = Arc::new(model);
    let tokenizer = Arc::new(tiny_tokenizer()?);

    let handles: Vec<_> = (0..2)
        .map(|_| {
            let model = Arc::clone(&model);
            let tokenizer = Arc::clone(&tokenizer);
            std::thread::spawn(move || -> Result<String, ThinkError> {
                let mut controller = ReasoningController::new(source(&model, &tokenizer, 42), session())?;
                let mut rng = StdRng::seed_from_u64(42);
                Ok(controller.run("why is the sky blue", &mut rng)?.text)
            })
        })
        .collect();

    let mut texts = Vec::new();
    for handle in handles {
        let text = handle
            .join()
            .map_err(|_| anyhow::anyhow!("worker panicked"))??;
        texts.push(text);
    }
    assert_eq!(texts[0], texts[1]);
    Ok(())
}

// ==================== Loader ====================

#[test]
fn test_model_directory_round_trip() -> anyhow::Result<()> {
    let (_, varmap) = tiny_model(128)?;

    let uniq = SystemTime::now().duration_since(UNIX_EPOCH)?.as_nanos();
    let mut dir: PathBuf = std::env::temp_dir();
    dir.push(format!("thinkdeeper_llama_{uniq}"));
    std::fs::create_dir_all(&dir)?;
    std::fs::write(dir.join("config.json"), config_json(128))?;
    std::fs::write(dir.join("tokenizer.json"), tokenizer_json())?;
    varmap.save(dir.join("model.safetensors"))?;

    let loaded = load_llama_dir(&dir, &Device::Cpu)?;
    assert_eq!(loaded.model.config().vocab_size, VOCAB.len());
    assert_eq!(loaded.model.eos_token_ids(), vec![0]);

    let src = LlamaSource::new(loaded.model, loaded.tokenizer, Sampler::greedy(), None);
    let mut controller = ReasoningController::new(src, session())?;
    let mut rng = StdRng::seed_from_u64(0);
    let out = controller.run("why", &mut rng)?;
    assert!(out.text.contains("</think>"));

    std::fs::remove_dir_all(&dir)?;
    Ok(())
}
