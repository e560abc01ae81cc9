use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use candle_core::{DType, Device};
use candle_nn::VarBuilder;
use candle_transformers::models::llama::{self, Llama, LlamaConfig};
use safetensors::SafeTensors;
use tokenizers::Tokenizer;

use super::llama::LlamaModel;

pub const CONFIG_FILE: &str = "config.json";
pub const TOKENIZER_FILE: &str = "tokenizer.json";
pub const WEIGHTS_FILE: &str = "model.safetensors";

/// Model and tokenizer loaded from one directory, ready to share across runs.
pub struct LoadedModel {
    pub model: Arc<LlamaModel>,
    pub tokenizer: Arc<Tokenizer>,
}

/// Load `config.json`, `tokenizer.json` and `model.safetensors` from `dir`.
///
/// # Errors
/// Returns an error if any file is missing or cannot be parsed.
pub fn load_llama_dir(dir: &Path, device: &Device) -> Result<LoadedModel> {
    if !dir.is_dir() {
        anyhow::bail!("Model directory not found: {}", dir.display());
    }

    let config = load_config(&dir.join(CONFIG_FILE))?;
    let tokenizer = load_tokenizer(&dir.join(TOKENIZER_FILE))?;

    let weights_path = dir.join(WEIGHTS_FILE);
    let data = std::fs::read(&weights_path)
        .with_context(|| format!("read weights {}", weights_path.display()))?;
    let model = load_llama_from_bytes(&data, config, device)
        .with_context(|| format!("load {}", weights_path.display()))?;

    tracing::info!(
        dir = %dir.display(),
        layers = model.config().num_hidden_layers,
        vocab = model.config().vocab_size,
        "loaded llama model"
    );

    Ok(LoadedModel {
        model: Arc::new(model),
        tokenizer: Arc::new(tokenizer),
    })
}

/// Parse a Hugging Face `config.json` into the runtime config.
///
/// # Errors
/// Returns an error if the file cannot be read or is not a Llama config.
pub fn load_config(path: &Path) -> Result<llama::Config> {
    let raw =
        std::fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
    let cfg: LlamaConfig =
        serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))?;
    Ok(cfg.into_config(false))
}

/// # Errors
/// Returns an error if the tokenizer file cannot be read or parsed.
pub fn load_tokenizer(path: &Path) -> Result<Tokenizer> {
    Tokenizer::from_file(path)
        .map_err(anyhow::Error::msg)
        .with_context(|| format!("load tokenizer {}", path.display()))
}

/// Build a model from in-memory safetensors bytes.
///
/// When the weights carry no `lm_head.weight` the output projection is tied to the token
/// embeddings, whatever the config says.
///
/// # Errors
/// Returns an error if the buffer is not safetensors or model construction fails.
pub fn load_llama_from_bytes(
    data: &[u8],
    mut config: llama::Config,
    device: &Device,
) -> Result<LlamaModel> {
    let tensors = SafeTensors::deserialize(data).context("parse safetensors header")?;
    if !tensors.names().iter().any(|name| name.as_str() == "lm_head.weight") {
        if !config.tie_word_embeddings {
            tracing::debug!("no lm_head.weight in checkpoint; tying to embeddings");
        }
        config.tie_word_embeddings = true;
    }

    let dtype = if device.is_cuda() {
        DType::F16
    } else {
        DType::F32
    };
    let vb = VarBuilder::from_buffered_safetensors(data.to_vec(), dtype, device)?;
    let model = Llama::load(vb, &config).context("construct llama")?;
    Ok(LlamaModel::new(model, config, dtype, device.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_directory_is_reported() {
        let err = load_llama_dir(Path::new("/definitely/not/here"), &Device::Cpu)
            .err()
            .expect("missing dir should error");
        assert!(err.to_string().contains("not found"), "{err}");
    }

    #[test]
    fn test_garbage_weights_are_rejected() {
        let config: LlamaConfig = serde_json::from_str(
            r#"{"hidden_size": 8, "intermediate_size": 16, "vocab_size": 4,
                "num_hidden_layers": 1, "num_attention_heads": 2, "num_key_value_heads": 2,
                "rms_norm_eps": 1e-5, "max_position_embeddings": 32}"#,
        )
        .unwrap();
        let err = load_llama_from_bytes(b"not safetensors", config.into_config(false), &Device::Cpu)
            .err()
            .expect("garbage should error");
        assert!(
            err.chain().any(|e| e.to_string().contains("safetensors")),
            "{err:?}"
        );
    }
}
