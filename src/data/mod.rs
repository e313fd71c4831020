//! NER dataset handling
//!
//! This module reads and writes the line-based tagged format (one
//! `token<TAB>tag` pair per line, blank line between sentences), holds the
//! sentences in a small tabular dataset, and splits a dataset into
//! validation and test subsets with a fixed seed.

use anyhow::Result;
use serde::{Deserialize, Serialize};

pub mod conll;
pub mod split;

// Re-exports for convenience
pub use conll::*;
pub use split::*;

/// A single tagged sentence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sentence {
    /// Tokens in sentence order
    pub tokens: Vec<String>,
    /// One NER tag per token
    pub ner_tags: Vec<String>,
}

impl Sentence {
    /// Create a sentence, checking that every token has a tag
    pub fn new(tokens: Vec<String>, ner_tags: Vec<String>) -> Result<Self> {
        let sentence = Self { tokens, ner_tags };
        sentence.validate()?;
        Ok(sentence)
    }

    /// Number of tokens
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Iterate over `(token, tag)` pairs
    pub fn pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.tokens
            .iter()
            .zip(self.ner_tags.iter())
            .map(|(t, g)| (t.as_str(), g.as_str()))
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.tokens.len() != self.ner_tags.len() {
            anyhow::bail!(
                "Sentence has {} tokens but {} tags",
                self.tokens.len(),
                self.ner_tags.len()
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sentence_rejects_mismatched_lengths() {
        let result = Sentence::new(
            vec!["Mario".to_string(), "Rossi".to_string()],
            vec!["B-PER".to_string()],
        );
        assert!(result.is_err_and(|e| e.to_string().contains("2 tokens but 1 tags")));
    }

    #[test]
    fn test_sentence_pairs() {
        let sentence = Sentence::new(
            vec!["Roma".to_string(), "è".to_string()],
            vec!["B-LOC".to_string(), "O".to_string()],
        )
        .unwrap();

        let pairs: Vec<_> = sentence.pairs().collect();
        assert_eq!(pairs, vec![("Roma", "B-LOC"), ("è", "O")]);
        assert_eq!(sentence.len(), 2);
    }
}
