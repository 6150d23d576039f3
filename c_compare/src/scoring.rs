//! Chain-rule phrase log-probability estimation.
//!
//! The score of a phrase given a prefix decomposes into a sum of per-token
//! conditional log-probabilities. Each step conditions on the running
//! context (prefix + previously scored phrase tokens) and appends the *true*
//! phrase token afterwards, so this is teacher-forced scoring rather than
//! generation. Steps are strictly sequential: step i+1 depends on the token
//! appended in step i.

/// Below this sum (in natural-log units) the probability is reported as an
/// exact 0 instead of exponentiating into denormal territory. The log value
/// stays valid and should be preferred for comparisons.
pub const UNDERFLOW_GUARD: f64 = -1000.0;

/// A causal next-token predictor. Implementations return unnormalized scores
/// (logits) over the vocabulary for the position following `context`.
///
/// Model parameters must not be mutated during scoring; the estimator treats
/// this as a read-only capability.
pub trait NextTokenModel {
    fn next_token_logits(
        &self,
        context: &[i64],
    ) -> Result<Vec<f32>, Box<dyn std::error::Error + Send + Sync>>;
}

#[derive(Debug, thiserror::Error)]
pub enum ScoreError {
    #[error("phrase must contain at least one token")]
    EmptyPhrase,

    #[error("negative token id {0} in input sequence")]
    NegativeTokenId(i64),

    #[error("token id {id} is outside the model vocabulary ({vocab} entries)")]
    TokenOutOfVocab { id: i64, vocab: usize },

    #[error("model inference failed")]
    Model(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Joint score of one phrase given one prefix.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhraseScore {
    /// Sum of per-token conditional log-probabilities (natural log, <= 0).
    pub log_prob: f64,
    /// `exp(log_prob)`, or exactly 0.0 when the sum fell below
    /// [`UNDERFLOW_GUARD`].
    pub prob: f64,
}

/// Two candidate phrases scored under the same prefix.
#[derive(Debug, Clone, Copy)]
pub struct PhraseComparison {
    pub first: PhraseScore,
    pub second: PhraseScore,
    /// `first.log_prob - second.log_prob`; always well defined.
    pub log_prob_diff: f64,
    /// `first.prob / second.prob`, only when neither side underflowed.
    pub prob_ratio: Option<f64>,
}

/// Scores `phrase` as a verbatim continuation of `prefix`.
///
/// The prefix may be empty. In that case the model cannot condition on
/// nothing, so the very first step conditions on the first phrase token
/// itself, a degraded fallback for tokenizers without a mandatory BOS
/// marker. The running context is still extended with the true token
/// only, so every later step conditions correctly.
pub fn score_phrase<M: NextTokenModel + ?Sized>(
    model: &M,
    prefix: &[i64],
    phrase: &[i64],
) -> Result<PhraseScore, ScoreError> {
    if phrase.is_empty() {
        return Err(ScoreError::EmptyPhrase);
    }
    // malformed ids are rejected before any model call
    for &tok in prefix.iter().chain(phrase) {
        if tok < 0 {
            return Err(ScoreError::NegativeTokenId(tok));
        }
    }

    let mut context: Vec<i64> = prefix.to_vec();
    let mut total_logprob = 0.0f64;

    for &tok in phrase {
        let step_context: &[i64] = if context.is_empty() {
            std::slice::from_ref(&tok)
        } else {
            &context
        };
        let logits = model
            .next_token_logits(step_context)
            .map_err(ScoreError::Model)?;

        let idx = usize::try_from(tok)
            .ok()
            .filter(|&i| i < logits.len())
            .ok_or(ScoreError::TokenOutOfVocab {
                id: tok,
                vocab: logits.len(),
            })?;

        total_logprob += log_softmax_at(&logits, idx);
        context.push(tok);
    }

    let prob = if total_logprob > UNDERFLOW_GUARD {
        total_logprob.exp()
    } else {
        0.0
    };
    Ok(PhraseScore {
        log_prob: total_logprob,
        prob,
    })
}

/// Scores both candidates under the same prefix, sequentially, and reports
/// the log-probability difference plus the probability ratio where defined.
pub fn compare_phrases<M: NextTokenModel + ?Sized>(
    model: &M,
    prefix: &[i64],
    first: &[i64],
    second: &[i64],
) -> Result<PhraseComparison, ScoreError> {
    let a = score_phrase(model, prefix, first)?;
    let b = score_phrase(model, prefix, second)?;
    let prob_ratio = if a.prob > 0.0 && b.prob > 0.0 {
        Some(a.prob / b.prob)
    } else {
        None
    };
    Ok(PhraseComparison {
        first: a,
        second: b,
        log_prob_diff: a.log_prob - b.log_prob,
        prob_ratio,
    })
}

// Stable log-softmax read at a single index: shift by the max logit before
// exponentiating so the partition sum cannot overflow.
fn log_softmax_at(logits: &[f32], idx: usize) -> f64 {
    let max = logits
        .iter()
        .copied()
        .fold(f32::NEG_INFINITY, f32::max) as f64;
    let partition: f64 = logits.iter().map(|&l| (f64::from(l) - max).exp()).sum();
    f64::from(logits[idx]) - max - partition.ln()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    // Uniform distribution over a small vocabulary; every token costs
    // exactly -ln(vocab) nats regardless of context.
    struct UniformModel {
        vocab: usize,
    }

    impl NextTokenModel for UniformModel {
        fn next_token_logits(
            &self,
            _context: &[i64],
        ) -> Result<Vec<f32>, Box<dyn std::error::Error + Send + Sync>> {
            Ok(vec![0.0; self.vocab])
        }
    }

    // Distribution that actually depends on the context, so chain-rule
    // consistency is a meaningful check.
    struct ContextSensitiveModel;

    impl NextTokenModel for ContextSensitiveModel {
        fn next_token_logits(
            &self,
            context: &[i64],
        ) -> Result<Vec<f32>, Box<dyn std::error::Error + Send + Sync>> {
            let scale = 1.0 + context.len() as f32 * 0.25;
            Ok((0..5).map(|j| j as f32 * scale).collect())
        }
    }

    // Records every context it was asked to condition on.
    struct RecordingModel {
        vocab: usize,
        seen: RefCell<Vec<Vec<i64>>>,
    }

    impl RecordingModel {
        fn new(vocab: usize) -> Self {
            Self {
                vocab,
                seen: RefCell::new(Vec::new()),
            }
        }
    }

    impl NextTokenModel for RecordingModel {
        fn next_token_logits(
            &self,
            context: &[i64],
        ) -> Result<Vec<f32>, Box<dyn std::error::Error + Send + Sync>> {
            self.seen.borrow_mut().push(context.to_vec());
            Ok(vec![0.0; self.vocab])
        }
    }

    // Token 0 sits 2000 nats below token 1, forcing the underflow guard.
    struct SkewedModel;

    impl NextTokenModel for SkewedModel {
        fn next_token_logits(
            &self,
            _context: &[i64],
        ) -> Result<Vec<f32>, Box<dyn std::error::Error + Send + Sync>> {
            Ok(vec![0.0, 2000.0])
        }
    }

    struct FailingModel;

    impl NextTokenModel for FailingModel {
        fn next_token_logits(
            &self,
            _context: &[i64],
        ) -> Result<Vec<f32>, Box<dyn std::error::Error + Send + Sync>> {
            Err("forward pass exploded".into())
        }
    }

    #[test]
    fn uniform_model_scores_match_closed_form() {
        let model = UniformModel { vocab: 4 };
        let score = score_phrase(&model, &[1], &[0, 2, 3]).unwrap();
        let expected = -3.0 * 4.0f64.ln();
        assert!((score.log_prob - expected).abs() < 1e-12);
        assert!((score.prob - expected.exp()).abs() < 1e-15);
    }

    #[test]
    fn log_prob_is_nonpositive_and_prob_in_unit_interval() {
        let model = ContextSensitiveModel;
        let score = score_phrase(&model, &[1, 2], &[4, 0, 3]).unwrap();
        assert!(score.log_prob <= 0.0);
        assert!(score.prob >= 0.0 && score.prob <= 1.0);
    }

    #[test]
    fn stepwise_scoring_matches_whole_phrase() {
        let model = ContextSensitiveModel;
        let prefix = [1i64, 3];
        let whole = score_phrase(&model, &prefix, &[2, 4]).unwrap();

        let first = score_phrase(&model, &prefix, &[2]).unwrap();
        let second = score_phrase(&model, &[1, 3, 2], &[4]).unwrap();
        assert!((whole.log_prob - (first.log_prob + second.log_prob)).abs() < 1e-12);
    }

    #[test]
    fn extending_a_phrase_never_raises_its_log_prob() {
        let model = ContextSensitiveModel;
        let short = score_phrase(&model, &[1], &[2]).unwrap();
        let long = score_phrase(&model, &[1], &[2, 0]).unwrap();
        assert!(long.log_prob <= short.log_prob);
    }

    #[test]
    fn scoring_is_deterministic() {
        let model = ContextSensitiveModel;
        let a = score_phrase(&model, &[0, 4], &[1, 2, 3]).unwrap();
        let b = score_phrase(&model, &[0, 4], &[1, 2, 3]).unwrap();
        assert_eq!(a.log_prob, b.log_prob);
        assert_eq!(a.prob, b.prob);
    }

    #[test]
    fn context_grows_by_the_true_token_each_step() {
        let model = RecordingModel::new(8);
        score_phrase(&model, &[5, 6], &[1, 2, 3]).unwrap();
        assert_eq!(
            *model.seen.borrow(),
            vec![vec![5, 6], vec![5, 6, 1], vec![5, 6, 1, 2]]
        );
    }

    #[test]
    fn empty_prefix_falls_back_to_token_as_context_once() {
        let model = RecordingModel::new(8);
        score_phrase(&model, &[], &[2, 3, 4]).unwrap();
        // the first step conditions on the token itself; afterwards the
        // running context holds only true tokens
        assert_eq!(
            *model.seen.borrow(),
            vec![vec![2], vec![2], vec![2, 3]]
        );
    }

    #[test]
    fn underflowed_sum_reports_zero_probability_with_valid_log() {
        let model = SkewedModel;
        let single = score_phrase(&model, &[1], &[0]).unwrap();
        assert_eq!(single.log_prob, -2000.0);
        assert_eq!(single.prob, 0.0);
        assert!(single.log_prob.is_finite());

        let double = score_phrase(&model, &[1], &[0, 0]).unwrap();
        assert_eq!(double.log_prob, -4000.0);
        assert_eq!(double.prob, 0.0);
    }

    #[test]
    fn empty_phrase_is_rejected() {
        let model = UniformModel { vocab: 4 };
        assert!(matches!(
            score_phrase(&model, &[1], &[]),
            Err(ScoreError::EmptyPhrase)
        ));
    }

    #[test]
    fn negative_token_is_rejected_before_any_model_call() {
        let model = RecordingModel::new(4);
        assert!(matches!(
            score_phrase(&model, &[1], &[2, -7]),
            Err(ScoreError::NegativeTokenId(-7))
        ));
        assert!(model.seen.borrow().is_empty());
    }

    #[test]
    fn out_of_vocab_token_is_rejected() {
        let model = UniformModel { vocab: 4 };
        assert!(matches!(
            score_phrase(&model, &[1], &[10]),
            Err(ScoreError::TokenOutOfVocab { id: 10, vocab: 4 })
        ));
    }

    #[test]
    fn model_failures_propagate() {
        assert!(matches!(
            score_phrase(&FailingModel, &[1], &[0]),
            Err(ScoreError::Model(_))
        ));
    }

    #[test]
    fn comparison_reports_log_diff_and_ratio() {
        let model = ContextSensitiveModel;
        let cmp = compare_phrases(&model, &[1], &[4], &[0, 0]).unwrap();
        assert!((cmp.log_prob_diff - (cmp.first.log_prob - cmp.second.log_prob)).abs() < 1e-15);
        let ratio = cmp.prob_ratio.unwrap();
        assert!((ratio.ln() - cmp.log_prob_diff).abs() < 1e-9);
    }

    #[test]
    fn comparison_withholds_ratio_on_underflow() {
        let cmp = compare_phrases(&SkewedModel, &[1], &[1], &[0]).unwrap();
        assert!(cmp.prob_ratio.is_none());
        // the log difference stays usable for ranking
        assert!(cmp.log_prob_diff > 0.0);
    }
}
