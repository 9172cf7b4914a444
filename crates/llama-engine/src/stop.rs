//! Stop criteria for token streams.
//!
//! Engines produce tokens until told otherwise. [`StopWordStream`] wraps a raw token
//! iterator and ends it once the request's token budget is spent or the generated
//! text contains a stop word. The token that completes a stop word is withheld.

use crate::{Result, SamplingParams};

/// When to stop a generation, derived from [`SamplingParams`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopCriteria {
    max_tokens: usize,
    /// Lowercased, non-empty stop words.
    stop_words: Vec<String>,
}

impl StopCriteria {
    pub fn new(max_tokens: usize, stop_words: &[String]) -> Self {
        Self {
            max_tokens,
            stop_words: stop_words
                .iter()
                .filter(|w| !w.is_empty())
                .map(|w| w.to_lowercase())
                .collect(),
        }
    }

    pub fn from_params(params: &SamplingParams) -> Self {
        Self::new(params.max_tokens, &params.stop_words)
    }

    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    /// Whether `produced` tokens exhaust the budget.
    pub fn budget_exhausted(&self, produced: usize) -> bool {
        produced >= self.max_tokens
    }

    /// Whether `generated` contains any stop word, ignoring case.
    pub fn matches_stop_word(&self, generated: &str) -> bool {
        if self.stop_words.is_empty() {
            return false;
        }
        let haystack = generated.to_lowercase();
        self.stop_words.iter().any(|w| haystack.contains(w.as_str()))
    }
}

/// Iterator adapter applying [`StopCriteria`] to a raw token iterator.
///
/// Errors from the inner iterator are passed through once and end the stream.
pub struct StopWordStream<I> {
    inner: I,
    criteria: StopCriteria,
    generated: String,
    produced: usize,
    done: bool,
}

impl<I> StopWordStream<I>
where
    I: Iterator<Item = Result<String>>,
{
    pub fn new(inner: I, criteria: StopCriteria) -> Self {
        Self {
            inner,
            criteria,
            generated: String::new(),
            produced: 0,
            done: false,
        }
    }

    /// Number of tokens drawn from the inner iterator so far.
    pub fn produced(&self) -> usize {
        self.produced
    }
}

impl<I> Iterator for StopWordStream<I>
where
    I: Iterator<Item = Result<String>>,
{
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.criteria.budget_exhausted(self.produced) {
            self.done = true;
            return None;
        }

        match self.inner.next() {
            None => {
                self.done = true;
                None
            }
            Some(Err(e)) => {
                self.done = true;
                Some(Err(e))
            }
            Some(Ok(token)) => {
                self.produced += 1;
                self.generated.push_str(&token);
                if self.criteria.matches_stop_word(&self.generated) {
                    self.done = true;
                    return None;
                }
                Some(Ok(token))
            }
        }
    }
}
