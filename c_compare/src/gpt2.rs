//! rust-bert GPT-2 backend for the phrase scorer.

use anyhow::{Context, Result};
use rust_bert::gpt2::{
    GPT2LMHeadModel, Gpt2Config, Gpt2ConfigResources, Gpt2MergesResources, Gpt2ModelResources,
    Gpt2VocabResources,
};
use rust_bert::resources::{RemoteResource, ResourceProvider};
use rust_bert::Config;
use rust_tokenizers::tokenizer::{Gpt2Tokenizer, Tokenizer, TruncationStrategy};
use std::path::Path;
use tch::{nn, no_grad, Device, Kind, Tensor};

use crate::scoring::NextTokenModel;

/// GPT-2 with its BPE tokenizer, loaded once and used read-only.
pub struct Gpt2Scorer {
    model: GPT2LMHeadModel,
    tokenizer: Gpt2Tokenizer,
    device: Device,
    max_len: usize,
    // owns the weights the model borrows from
    _var_store: nn::VarStore,
}

impl Gpt2Scorer {
    /// Loads pretrained GPT-2, either from a local directory holding
    /// `config.json`, `vocab.json`, `merges.txt` and `rust_model.ot`, or
    /// from the hub cache.
    pub fn new(model_dir: Option<&Path>, device: Device, max_len: usize) -> Result<Self> {
        let (config_path, vocab_path, merges_path, weights_path) = match model_dir {
            Some(dir) => (
                dir.join("config.json"),
                dir.join("vocab.json"),
                dir.join("merges.txt"),
                dir.join("rust_model.ot"),
            ),
            None => (
                RemoteResource::from_pretrained(Gpt2ConfigResources::GPT2).get_local_path()?,
                RemoteResource::from_pretrained(Gpt2VocabResources::GPT2).get_local_path()?,
                RemoteResource::from_pretrained(Gpt2MergesResources::GPT2).get_local_path()?,
                RemoteResource::from_pretrained(Gpt2ModelResources::GPT2).get_local_path()?,
            ),
        };
        // fail early with a readable message instead of a tch load error
        for path in [&config_path, &vocab_path, &merges_path, &weights_path] {
            if !path.exists() {
                anyhow::bail!("missing model file {}", path.display());
            }
        }

        let mut var_store = nn::VarStore::new(device);
        let tokenizer = Gpt2Tokenizer::from_file(
            vocab_path.to_str().context("vocab path is not valid UTF-8")?,
            merges_path.to_str().context("merges path is not valid UTF-8")?,
            false,
        )?;
        let config = Gpt2Config::from_file(&config_path);
        let model = GPT2LMHeadModel::new(var_store.root(), &config);
        var_store
            .load(&weights_path)
            .with_context(|| format!("cannot load weights from {}", weights_path.display()))?;

        Ok(Self {
            model,
            tokenizer,
            device,
            max_len,
            _var_store: var_store,
        })
    }

    /// Tokenizes plain text without special tokens; an empty string yields
    /// an empty id sequence.
    pub fn encode(&self, text: &str) -> Vec<i64> {
        if text.is_empty() {
            return Vec::new();
        }
        self.tokenizer
            .encode(text, None, self.max_len, &TruncationStrategy::LongestFirst, 0)
            .token_ids
    }
}

impl NextTokenModel for Gpt2Scorer {
    fn next_token_logits(
        &self,
        context: &[i64],
    ) -> std::result::Result<Vec<f32>, Box<dyn std::error::Error + Send + Sync>> {
        // encode() truncates each text separately, but the running context
        // (prefix + scored tokens) is their concatenation and can outgrow
        // the positional table
        ensure_context_fits(context.len(), self.max_len)?;
        let input_ids = Tensor::from_slice(context).to(self.device).unsqueeze(0);

        let output = no_grad(|| {
            self.model.forward_t(
                Some(&input_ids),
                None,  // layer_past
                None,  // attention_mask
                None,  // token_type_ids
                None,  // position_ids
                None,  // input_embeds
                false, // train
            )
        })?;

        // (1, seq, vocab) -> logits for the next position
        let seq_len = output.lm_logits.size()[1];
        let last = output
            .lm_logits
            .select(1, seq_len - 1)
            .squeeze()
            .to_kind(Kind::Float)
            .to_device(Device::Cpu);
        Ok(Vec::<f32>::try_from(&last)?)
    }
}

fn ensure_context_fits(
    len: usize,
    max_len: usize,
) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
    if len > max_len {
        return Err(format!(
            "context of {len} tokens exceeds the model maximum of {max_len}"
        )
        .into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oversized_context_is_rejected_with_a_readable_error() {
        let err = ensure_context_fits(1025, 1024).unwrap_err();
        assert!(err.to_string().contains("1025 tokens"));
        assert!(err.to_string().contains("maximum of 1024"));

        assert!(ensure_context_fits(1024, 1024).is_ok());
        assert!(ensure_context_fits(0, 1024).is_ok());
    }
}
