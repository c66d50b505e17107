//! CLIP prompt encoder shared by the image and the video model
//!
//! Stable Diffusion 2.1 and ModelScope text-to-video both condition on the
//! OpenCLIP ViT-H text tower exported as a 23 layer `CLIPTextModel`, so a
//! single wrapper serves both.

use std::path::Path;

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::stable_diffusion::clip;
use tokenizers::Tokenizer;
use tracing::debug;

use crate::error::{Error, Result};

const END_OF_TEXT: &str = "<|endoftext|>";

/// Conditional and unconditional prompt embeddings, each `[1, L, D]`
#[derive(Debug, Clone)]
pub struct PromptEmbeddings {
    pub cond: Tensor,
    pub uncond: Tensor,
}

impl PromptEmbeddings {
    /// `[2, L, D]` with the unconditional row first
    pub fn batched(&self) -> Result<Tensor> {
        Ok(Tensor::cat(&[&self.uncond, &self.cond], 0)?)
    }
}

pub struct ClipPromptEncoder {
    tokenizer: Tokenizer,
    model: clip::ClipTextTransformer,
    max_len: usize,
    pad_id: u32,
    eos_id: Option<u32>,
    device: Device,
}

impl std::fmt::Debug for ClipPromptEncoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClipPromptEncoder")
            .field("max_len", &self.max_len)
            .field("pad_id", &self.pad_id)
            .field("device", &self.device)
            .finish()
    }
}

impl ClipPromptEncoder {
    pub fn load(
        config: &clip::Config,
        weights: &Path,
        tokenizer: &Path,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let tokenizer = Tokenizer::from_file(tokenizer).map_err(|e| Error::Tokenizer(e.to_string()))?;
        let vs = unsafe { VarBuilder::from_mmaped_safetensors(&[weights], dtype, device)? };
        let model = clip::ClipTextTransformer::new(vs, config)?;

        let vocab = tokenizer.get_vocab(true);
        let pad_token = config.pad_with.as_deref().unwrap_or(END_OF_TEXT);
        let pad_id = *vocab
            .get(pad_token)
            .ok_or_else(|| Error::Tokenizer(format!("pad token {pad_token:?} not in vocabulary")))?;
        let eos_id = vocab.get(END_OF_TEXT).copied();

        debug!(weights = %weights.display(), pad_token, "CLIP text encoder loaded");
        Ok(Self {
            tokenizer,
            model,
            max_len: config.max_position_embeddings,
            pad_id,
            eos_id,
            device: device.clone(),
        })
    }

    /// Token ids padded or truncated to the model context length
    pub fn tokenize(&self, prompt: &str) -> Result<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(prompt, true)
            .map_err(|e| Error::Tokenizer(e.to_string()))?;
        Ok(fit_tokens(
            encoding.get_ids().to_vec(),
            self.max_len,
            self.pad_id,
            self.eos_id,
        ))
    }

    /// `[1, max_len, hidden]` embeddings of `prompt`
    pub fn encode(&self, prompt: &str) -> Result<Tensor> {
        let tokens = self.tokenize(prompt)?;
        let input = Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?;
        Ok(self.model.forward(&input)?)
    }

    /// Embeddings of `prompt` and of the empty prompt
    pub fn encode_with_uncond(&self, prompt: &str) -> Result<PromptEmbeddings> {
        Ok(PromptEmbeddings {
            cond: self.encode(prompt)?,
            uncond: self.encode("")?,
        })
    }
}

/// Truncate to `max_len` keeping the end-of-text marker, then pad
fn fit_tokens(mut tokens: Vec<u32>, max_len: usize, pad_id: u32, eos_id: Option<u32>) -> Vec<u32> {
    if tokens.len() > max_len {
        tokens.truncate(max_len);
        if let (Some(eos), Some(last)) = (eos_id, tokens.last_mut()) {
            *last = eos;
        }
    }
    tokens.resize(max_len, pad_id);
    tokens
}
