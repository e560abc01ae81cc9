//! Model-backed token source over a candle Llama.
//!
//! The model weights are shared read-only behind an `Arc`; every run owns its KV cache, position
//! offset and detokenizer, so several runs can share one loaded model from different threads.

use std::sync::Arc;

use candle_core::{DType, Device, IndexOp, Tensor};
use candle_transformers::models::llama::{self, Cache, Llama, LlamaEosToks};
use rand::SeedableRng;
use rand::rngs::StdRng;
use tokenizers::Tokenizer;

use crate::backend::{Emission, TokenSource};
use crate::error::{BackendError, ConfigError};
use crate::inference::sampling::Sampler;
use crate::tokenizer::counting::UnitCounter;
use crate::tokenizer::markers::Vocabulary;
use crate::tokenizer::stream::TokenStream;

/// A loaded Llama with the settings needed to build fresh caches for it.
pub struct LlamaModel {
    model: Llama,
    config: llama::Config,
    dtype: DType,
    device: Device,
}

impl LlamaModel {
    #[must_use]
    pub fn new(model: Llama, config: llama::Config, dtype: DType, device: Device) -> Self {
        Self {
            model,
            config,
            dtype,
            device,
        }
    }

    #[must_use]
    pub fn config(&self) -> &llama::Config {
        &self.config
    }

    #[must_use]
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Largest position the rotary tables cover.
    #[must_use]
    pub fn max_positions(&self) -> usize {
        self.config.max_position_embeddings
    }

    /// End-of-sequence ids from the model config.
    #[must_use]
    pub fn eos_token_ids(&self) -> Vec<u32> {
        match &self.config.eos_token_id {
            Some(LlamaEosToks::Single(id)) => vec![*id],
            Some(LlamaEosToks::Multiple(ids)) => ids.clone(),
            None => Vec::new(),
        }
    }

    /// Fresh KV cache for one run.
    ///
    /// # Errors
    /// Returns an error if the rotary tables cannot be built on the device.
    pub fn new_cache(&self) -> candle_core::Result<Cache> {
        Cache::new(true, self.dtype, &self.config, &self.device)
    }

    /// Feed `ids` at `position` and return the logits for the next token.
    fn next_logits(
        &self,
        ids: &[u32],
        position: usize,
        cache: &mut Cache,
    ) -> Result<Vec<f32>, BackendError> {
        let input = Tensor::new(ids, &self.device)?.unsqueeze(0)?;
        let logits = self.model.forward(&input, position, cache)?;
        let last = match logits.rank() {
            1 => logits,
            2 => logits.i((logits.dim(0)? - 1, ..))?,
            3 => logits.i((0, logits.dim(1)? - 1, ..))?,
            _ => return Err(BackendError::UnexpectedLogits(logits.dims().to_vec())),
        };
        Ok(last.to_dtype(DType::F32)?.to_vec1::<f32>()?)
    }
}

/// Per-run state: KV cache plus the tokens waiting to be fed.
pub struct LlamaContext {
    cache: Cache,
    position: usize,
    next_input: Vec<u32>,
    stream: TokenStream,
}

impl LlamaContext {
    /// Positions already written to the cache.
    #[must_use]
    pub fn position(&self) -> usize {
        self.position
    }
}

pub struct LlamaSource {
    model: Arc<LlamaModel>,
    tokenizer: Arc<Tokenizer>,
    sampler: Sampler,
    rng: StdRng,
    eos: Vec<u32>,
}

impl LlamaSource {
    #[must_use]
    pub fn new(
        model: Arc<LlamaModel>,
        tokenizer: Arc<Tokenizer>,
        sampler: Sampler,
        seed: Option<u64>,
    ) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let mut eos = model.eos_token_ids();
        if eos.is_empty() {
            tracing::warn!("model config names no eos token; falling back to tokenizer lookup");
            eos.extend(
                ["</s>", "<|endoftext|>", "<|im_end|>", "<|eot_id|>"]
                    .iter()
                    .filter_map(|t| tokenizer.token_to_id(t)),
            );
        }
        Self {
            model,
            tokenizer,
            sampler,
            rng,
            eos,
        }
    }

    fn encode(&self, text: &str) -> Result<Vec<u32>, BackendError> {
        let encoding = self
            .tokenizer
            .encode(text, false)
            .map_err(BackendError::tokenizer)?;
        Ok(encoding.get_ids().to_vec())
    }
}

impl Vocabulary for LlamaSource {
    type Id = u32;

    fn resolve_marker(&self, marker: &str) -> Result<u32, ConfigError> {
        if let Some(id) = self.tokenizer.token_to_id(marker) {
            return Ok(id);
        }
        let encoding = self
            .tokenizer
            .encode(marker, false)
            .map_err(|e| ConfigError::UnresolvableMarker {
                marker: format!("{marker} ({e})"),
            })?;
        match encoding.get_ids() {
            [] => Err(ConfigError::UnresolvableMarker {
                marker: marker.to_string(),
            }),
            [id] => Ok(*id),
            ids => Err(ConfigError::AmbiguousMarker {
                marker: marker.to_string(),
                pieces: ids.len(),
            }),
        }
    }

    fn end_of_sequence(&self) -> Vec<u32> {
        self.eos.clone()
    }
}

impl TokenSource for LlamaSource {
    type Context = LlamaContext;

    fn count_units(&self, text: &str) -> Result<usize, BackendError> {
        self.tokenizer.count_units(text)
    }

    fn open(&mut self, context: &str) -> Result<LlamaContext, BackendError> {
        let ids = self.encode(context)?;
        if ids.is_empty() {
            return Err(BackendError::EmptyPrompt);
        }
        tracing::debug!(prompt_tokens = ids.len(), "opened llama context");
        Ok(LlamaContext {
            cache: self.model.new_cache()?,
            position: 0,
            next_input: ids,
            stream: TokenStream::new(),
        })
    }

    fn propose(&mut self, ctx: &mut LlamaContext) -> Result<Emission<u32>, BackendError> {
        let needed = ctx.position + ctx.next_input.len();
        let limit = self.model.max_positions();
        if needed > limit {
            return Err(BackendError::ContextOverflow { needed, limit });
        }

        let logits = self
            .model
            .next_logits(&ctx.next_input, ctx.position, &mut ctx.cache)?;
        ctx.position = needed;
        ctx.next_input.clear();

        let id = self.sampler.sample(&logits, &mut self.rng);
        let text = if self.eos.contains(&id) {
            String::new()
        } else {
            ctx.stream.preview(&self.tokenizer, id)?
        };
        Ok(Emission { id, text, units: 1 })
    }

    fn accept(
        &mut self,
        ctx: &mut LlamaContext,
        emission: &Emission<u32>,
    ) -> Result<(), BackendError> {
        ctx.stream.push(&self.tokenizer, emission.id)?;
        ctx.next_input = vec![emission.id];
        Ok(())
    }

    fn inject(&mut self, ctx: &mut LlamaContext, text: &str) -> Result<usize, BackendError> {
        let ids = self.encode(text)?;
        if ids.is_empty() {
            return Err(BackendError::Tokenizer(format!(
                "injected text {text:?} encodes to no tokens"
            )));
        }
        ctx.stream.skip(&ids);
        // an accepted token may still be pending when the span is force-closed
        ctx.next_input.extend_from_slice(&ids);
        Ok(ids.len())
    }
}
