//! Timestep resolution: word-count timesteps to token spans
//!
//! Callers address positions in *words* (whitespace-separated), while the
//! model consumes *tokens*. Policy:
//!
//! - timesteps are 1-indexed word counts; `<= 0` is invalid
//! - a timestep within the available text truncates to that many words
//! - a timestep beyond it asks the model for roughly 1.5 new tokens per
//!   missing word, then clamps to whatever words exist afterwards
//!
//! The truncated words are re-joined with single spaces and re-encoded.

use anyhow::Result as AnyResult;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{InspectError, Result};
use crate::tokenizer::TextCodec;

/// New tokens requested per missing word
pub const TOKENS_PER_WORD: f64 = 1.5;

/// Token span a forward pass runs over
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TokenSpan {
    pub token_ids: Vec<u32>,
    /// The word-truncated text that was encoded
    pub text: String,
    /// Number of words covered (may be less than requested when clamped)
    pub words: usize,
    /// The whole decoded text, when extra generation was needed
    #[serde(skip)]
    pub extension: Option<String>,
}

/// Reject non-positive timesteps, otherwise return the word count
pub fn validate_timestep(timestep: i64) -> Result<usize> {
    usize::try_from(timestep)
        .ok()
        .filter(|&t| t > 0)
        .ok_or(InspectError::InvalidTimestep(timestep))
}

/// Number of new tokens to request for `missing_words`
pub fn extension_budget(missing_words: usize) -> usize {
    (missing_words as f64 * TOKENS_PER_WORD).ceil() as usize
}

fn split_words(text: &str) -> Vec<&str> {
    text.split_whitespace().collect()
}

/// Resolve `timestep` words over `base_text`, extending it if necessary
///
/// `extend(prompt_ids, max_new_tokens)` must return the prompt ids followed
/// by the continuation; its failure is reported as a generation failure.
pub fn resolve_span<F>(
    codec: &dyn TextCodec,
    base_text: &str,
    timestep: i64,
    extend: F,
) -> Result<TokenSpan>
where
    F: FnOnce(&[u32], usize) -> AnyResult<Vec<u32>>,
{
    let wanted = validate_timestep(timestep)?;
    let words = split_words(base_text);

    if wanted <= words.len() {
        return encode_words(codec, &words[..wanted]);
    }

    let missing = wanted - words.len();
    let budget = extension_budget(missing);
    debug!(
        "Timestep {} exceeds {} available words, generating {} more tokens",
        wanted,
        words.len(),
        budget
    );

    let base_ids = codec.encode(base_text)?;
    if base_ids.is_empty() {
        return Err(InspectError::EmptyContext);
    }
    let extended_ids =
        extend(&base_ids, budget).map_err(|e| InspectError::GenerationFailure(format!("{e:#}")))?;
    let extended_text = codec.decode(&extended_ids)?;
    let extended_words = split_words(&extended_text);

    let take = wanted.min(extended_words.len());
    if take < wanted {
        warn!(
            "Timestep {} clamped to {} words after extension",
            wanted, take
        );
    }
    let mut span = encode_words(codec, &extended_words[..take])?;
    span.extension = Some(extended_text);
    Ok(span)
}

/// Span over the first `timestep` words of the prompt alone (no extension)
///
/// Fails with `InvalidTimestep` for `timestep <= 0` and `OutOfRange` when
/// the prompt has fewer words.
pub fn prompt_span(codec: &dyn TextCodec, prompt: &str, timestep: i64) -> Result<TokenSpan> {
    let wanted = validate_timestep(timestep)?;
    let words = split_words(prompt);
    if wanted > words.len() {
        return Err(InspectError::out_of_range("timestep", wanted, words.len()));
    }
    encode_words(codec, &words[..wanted])
}

fn encode_words(codec: &dyn TextCodec, words: &[&str]) -> Result<TokenSpan> {
    let text = words.join(" ");
    let token_ids = codec.encode(&text)?;
    if token_ids.is_empty() {
        return Err(InspectError::EmptyContext);
    }
    Ok(TokenSpan {
        token_ids,
        text,
        words: words.len(),
        extension: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokenizer::ByteTokenizer;
    use std::cell::Cell;

    /// One token per whitespace word, ids are positions in a fixed vocabulary
    struct WordFixture {
        vocab: Vec<&'static str>,
    }

    impl WordFixture {
        fn new() -> Self {
            Self {
                vocab: vec!["the", "cat", "sat", "on", "mat", "and", "slept"],
            }
        }
    }

    impl TextCodec for WordFixture {
        fn encode(&self, text: &str) -> AnyResult<Vec<u32>> {
            text.split_whitespace()
                .map(|w| {
                    self.vocab
                        .iter()
                        .position(|v| *v == w)
                        .map(|p| p as u32)
                        .ok_or_else(|| anyhow::anyhow!("unknown word {w}"))
                })
                .collect()
        }

        fn decode(&self, ids: &[u32]) -> AnyResult<String> {
            Ok(ids
                .iter()
                .map(|&id| self.vocab[id as usize])
                .collect::<Vec<_>>()
                .join(" "))
        }
    }

    fn no_extension(_: &[u32], _: usize) -> AnyResult<Vec<u32>> {
        panic!("extension must not be requested")
    }

    #[test]
    fn test_truncates_within_text() {
        let span = resolve_span(&WordFixture::new(), "the cat sat on", 2, no_extension).unwrap();
        assert_eq!(span.text, "the cat");
        assert_eq!(span.token_ids, vec![0, 1]);
        assert!(span.extension.is_none());
    }

    #[test]
    fn test_subword_tokens() {
        // byte-level: each word is several tokens, whitespace collapses
        let span = resolve_span(&ByteTokenizer, "ab   cd ef", 2, no_extension).unwrap();
        assert_eq!(span.text, "ab cd");
        assert_eq!(span.token_ids.len(), 5);
        assert_eq!(span.words, 2);
    }

    #[test]
    fn test_extension_budget_and_result() {
        let requested = Cell::new(0);
        let span = resolve_span(&WordFixture::new(), "the cat", 4, |ids, n| {
            requested.set(n);
            let mut out = ids.to_vec();
            out.extend([2, 3, 4]);
            Ok(out)
        })
        .unwrap();

        // two missing words -> ceil(2 * 1.5) tokens
        assert_eq!(requested.get(), 3);
        assert_eq!(span.text, "the cat sat on");
        assert!(span.extension.is_some());
    }

    #[test]
    fn test_clamps_when_generation_falls_short() {
        let span = resolve_span(&WordFixture::new(), "the cat", 50, |ids, _| {
            let mut out = ids.to_vec();
            out.push(2);
            Ok(out)
        })
        .unwrap();
        assert_eq!(span.words, 3);
        assert_eq!(span.text, "the cat sat");
    }

    #[test]
    fn test_invalid_timestep_before_generation() {
        for t in [0, -3] {
            let err = resolve_span(&WordFixture::new(), "the cat", t, no_extension).unwrap_err();
            assert!(matches!(err, InspectError::InvalidTimestep(v) if v == t));
        }
    }

    #[test]
    fn test_extension_failure_is_generation_failure() {
        let err = resolve_span(&WordFixture::new(), "the", 3, |_, _| {
            anyhow::bail!("decode exploded")
        })
        .unwrap_err();
        assert!(matches!(err, InspectError::GenerationFailure(_)));
    }

    #[test]
    fn test_empty_base_text() {
        let err = resolve_span(&ByteTokenizer, "", 1, no_extension).unwrap_err();
        assert!(matches!(err, InspectError::EmptyContext));
    }

    #[test]
    fn test_longer_timestep_is_prefix_extension() {
        let codec = ByteTokenizer;
        let text = "one two three four five";
        let short = resolve_span(&codec, text, 2, no_extension).unwrap();
        let long = resolve_span(&codec, text, 4, no_extension).unwrap();
        assert!(long.token_ids.starts_with(&short.token_ids));
        assert!(long.token_ids.len() > short.token_ids.len());
    }

    #[test]
    fn test_prompt_span_bounds() {
        let codec = WordFixture::new();
        assert_eq!(prompt_span(&codec, "the cat sat", 3).unwrap().token_ids.len(), 3);
        assert!(matches!(
            prompt_span(&codec, "the cat sat", 4),
            Err(InspectError::OutOfRange { index: 4, size: 3, .. })
        ));
        assert!(matches!(
            prompt_span(&codec, "the cat sat", 0),
            Err(InspectError::InvalidTimestep(0))
        ));
    }
}
