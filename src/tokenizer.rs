// SPDX-License-Identifier: MIT OR Apache-2.0

//! Text <-> token id conversion.
//!
//! [`ProbeTokenizer`] wraps a `HuggingFace` [`tokenizers::Tokenizer`]
//! loaded from the checkpoint's `tokenizer.json`.  It is stateless:
//! incremental decoding lives in [`TokenStream`](crate::TokenStream).

use std::path::Path;

use crate::error::{ProbeError, Result};

/// Encode/decode front end over a `HuggingFace` tokenizer.
///
/// # Example
///
/// ```no_run
/// use candle_probe::ProbeTokenizer;
///
/// # fn main() -> candle_probe::Result<()> {
/// let tok = ProbeTokenizer::from_file("tokenizer.json")?;
/// let ids = tok.encode("I really like nuclear power because")?;
/// let text = tok.decode(&ids, true)?;
/// assert!(!ids.is_empty());
/// # Ok(())
/// # }
/// ```
pub struct ProbeTokenizer {
    /// The wrapped tokenizer.
    inner: Box<tokenizers::Tokenizer>,
}

impl ProbeTokenizer {
    /// Load a tokenizer from a `tokenizer.json` file.
    ///
    /// # Errors
    ///
    /// Returns [`ProbeError::Tokenizer`] if the file cannot be loaded or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let tok = tokenizers::Tokenizer::from_file(path.as_ref()).map_err(|e| {
            ProbeError::Tokenizer(format!(
                "failed to load tokenizer from {}: {e}",
                path.as_ref().display()
            ))
        })?;
        Ok(Self::from_tokenizer(tok))
    }

    /// Wrap an already-loaded tokenizer.
    #[must_use]
    pub fn from_tokenizer(tokenizer: tokenizers::Tokenizer) -> Self {
        Self {
            inner: Box::new(tokenizer),
        }
    }

    /// Encode text, adding special tokens (e.g. BOS) according to the
    /// tokenizer's post-processor.
    ///
    /// # Errors
    ///
    /// Returns [`ProbeError::Tokenizer`] if encoding fails.
    pub fn encode(&self, text: &str) -> Result<Vec<u32>> {
        self.encode_with(text, true)
    }

    /// Encode text **without** adding special tokens.
    ///
    /// Rendered chat prompts already carry their BOS and role markers.
    ///
    /// # Errors
    ///
    /// Returns [`ProbeError::Tokenizer`] if encoding fails.
    pub fn encode_raw(&self, text: &str) -> Result<Vec<u32>> {
        self.encode_with(text, false)
    }

    /// Shared encode path.
    fn encode_with(&self, text: &str, add_special_tokens: bool) -> Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, add_special_tokens)
            .map_err(|e| ProbeError::Tokenizer(format!("encode failed: {e}")))?;
        Ok(encoding.get_ids().to_vec())
    }

    /// Decode ids back to text, optionally dropping special tokens.
    ///
    /// # Errors
    ///
    /// Returns [`ProbeError::Tokenizer`] if decoding fails.
    pub fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String> {
        self.inner
            .decode(ids, skip_special_tokens)
            .map_err(|e| ProbeError::Tokenizer(format!("decode failed: {e}")))
    }

    /// Id of an exact vocabulary entry (added tokens included).
    #[must_use]
    pub fn token_to_id(&self, token: &str) -> Option<u32> {
        self.inner.token_to_id(token)
    }

    /// Vocabulary size including added tokens.
    #[must_use]
    pub fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }
}

impl std::fmt::Debug for ProbeTokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProbeTokenizer")
            .field("vocab_size", &self.vocab_size())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::str::FromStr;

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
            "vocab": {"<unk>": 0, "</s>": 1, "nuclear": 2, "power": 3, "is": 4, "clean": 5},
            "unk_token": "<unk>"
        }
    }"#;

    fn tokenizer() -> ProbeTokenizer {
        ProbeTokenizer::from_tokenizer(tokenizers::Tokenizer::from_str(TOKENIZER_JSON).unwrap())
    }

    #[test]
    fn encode_decode_words() {
        let tok = tokenizer();
        let ids = tok.encode("nuclear power is clean").unwrap();
        assert_eq!(ids, vec![2, 3, 4, 5]);
        assert_eq!(tok.decode(&ids, true).unwrap(), "nuclear power is clean");
    }

    #[test]
    fn unknown_word_maps_to_unk() {
        let tok = tokenizer();
        assert_eq!(tok.encode_raw("fusion").unwrap(), vec![0]);
    }

    #[test]
    fn decode_can_skip_special_tokens() {
        let tok = tokenizer();
        assert_eq!(tok.decode(&[2, 1], false).unwrap(), "nuclear </s>");
        assert_eq!(tok.decode(&[2, 1], true).unwrap(), "nuclear");
    }

    #[test]
    fn vocabulary_lookups() {
        let tok = tokenizer();
        assert_eq!(tok.vocab_size(), 6);
        assert_eq!(tok.token_to_id("</s>"), Some(1));
        assert_eq!(tok.token_to_id("fusion"), None);
    }
}
