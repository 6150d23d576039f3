//! Teacher-forced phrase scoring under a causal language model.
//!
//! [`scoring`] holds the model-agnostic estimator: given a token-id prefix
//! and a candidate phrase, it accumulates the log-probability the model
//! assigns to producing the phrase verbatim after the prefix, one forward
//! pass per phrase token. [`gpt2`] provides the rust-bert GPT-2 backend used
//! by the `compare_phrases` binary.

pub mod gpt2;
pub mod scoring;

pub use scoring::{
    compare_phrases, score_phrase, NextTokenModel, PhraseComparison, PhraseScore, ScoreError,
};
