// SPDX-License-Identifier: MIT OR Apache-2.0

//! Incremental detokenization for streamed output.
//!
//! Decoding tokens one at a time breaks multi-byte characters and drops
//! the leading spaces some tokenizers only produce in context.
//! [`TokenStream`] instead re-decodes a short window of recent tokens and
//! emits only the text that window has gained since the last emission,
//! holding back while the tail is an incomplete UTF-8 sequence.

use crate::error::Result;
use crate::tokenizer::ProbeTokenizer;

/// Decoded as U+FFFD while a multi-byte character is still incomplete.
const REPLACEMENT: char = '\u{FFFD}';

/// Streaming detokenizer.
///
/// # Example
///
/// ```no_run
/// use candle_probe::{ProbeTokenizer, TokenStream};
///
/// # fn main() -> candle_probe::Result<()> {
/// let tok = ProbeTokenizer::from_file("tokenizer.json")?;
/// let prompt = tok.encode("Say hello")?;
/// let mut stream = TokenStream::new(&tok).skip_prompt(true);
/// stream.push_prompt(&prompt)?;
/// # let generated: Vec<u32> = Vec::new();
/// for id in generated {
///     if let Some(text) = stream.push(id)? {
///         print!("{text}");
///     }
/// }
/// if let Some(text) = stream.finish()? {
///     print!("{text}");
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct TokenStream<'a> {
    /// Tokenizer used for every decode.
    tokenizer: &'a ProbeTokenizer,
    /// Tokens seen so far (prompt included unless skipped).
    tokens: Vec<u32>,
    /// Start of the decode window.
    prev_index: usize,
    /// End of the already-emitted part of the window.
    current_index: usize,
    /// Never emit the prompt.
    skip_prompt: bool,
}

impl<'a> TokenStream<'a> {
    /// A stream that emits the prompt and skips special tokens.
    #[must_use]
    pub const fn new(tokenizer: &'a ProbeTokenizer) -> Self {
        Self {
            tokenizer,
            tokens: Vec::new(),
            prev_index: 0,
            current_index: 0,
            skip_prompt: false,
        }
    }

    /// Do not emit prompt text.
    #[must_use]
    pub const fn skip_prompt(mut self, skip: bool) -> Self {
        self.skip_prompt = skip;
        self
    }

    /// Feed the prompt ids.  Returns the prompt text unless `skip_prompt`.
    ///
    /// # Errors
    ///
    /// Returns [`ProbeError::Tokenizer`](crate::ProbeError::Tokenizer) if
    /// decoding fails.
    pub fn push_prompt(&mut self, ids: &[u32]) -> Result<Option<String>> {
        if self.skip_prompt {
            return Ok(None);
        }
        let mut emitted = String::new();
        for &id in ids {
            if let Some(text) = self.push(id)? {
                emitted.push_str(&text);
            }
        }
        Ok((!emitted.is_empty()).then_some(emitted))
    }

    /// Feed one generated id.  Returns newly completed text, if any.
    ///
    /// # Errors
    ///
    /// Returns [`ProbeError::Tokenizer`](crate::ProbeError::Tokenizer) if
    /// decoding fails.
    pub fn push(&mut self, id: u32) -> Result<Option<String>> {
        let prev_text = self.decode_window(self.prev_index, self.current_index)?;
        self.tokens.push(id);
        let text = self.decode_window(self.prev_index, self.tokens.len())?;

        if text.len() <= prev_text.len() || text.ends_with(REPLACEMENT) {
            return Ok(None);
        }
        let Some(new_text) = text.get(prev_text.len()..) else {
            // Earlier text changed under the new token; wait for more.
            return Ok(None);
        };
        let new_text = new_text.to_owned();
        self.prev_index = self.current_index;
        self.current_index = self.tokens.len();
        Ok(Some(new_text))
    }

    /// Flush whatever is still held back.
    ///
    /// # Errors
    ///
    /// Returns [`ProbeError::Tokenizer`](crate::ProbeError::Tokenizer) if
    /// decoding fails.
    pub fn finish(&mut self) -> Result<Option<String>> {
        let prev_text = self.decode_window(self.prev_index, self.current_index)?;
        let text = self.decode_window(self.prev_index, self.tokens.len())?;
        self.prev_index = self.tokens.len();
        self.current_index = self.tokens.len();
        Ok(text
            .get(prev_text.len()..)
            .filter(|rest| !rest.is_empty())
            .map(str::to_owned))
    }

    /// Every token fed so far.
    #[must_use]
    pub fn tokens(&self) -> &[u32] {
        &self.tokens
    }

    /// Decode `tokens[start..end]`.
    fn decode_window(&self, start: usize, end: usize) -> Result<String> {
        match self.tokens.get(start..end) {
            Some(window) if !window.is_empty() => {
                self.tokenizer.decode(window, true)
            }
            _ => Ok(String::new()),
        }
    }
}
