use std::sync::OnceLock;

use tiktoken_rs::CoreBPE;
use tracing::warn;

use stepwise_core::config::{BudgetConfig, EstimatorKind};
use stepwise_core::types::Usage;

/// Tokenizer for cl100k_base, loaded on first use. `None` if it failed to load.
fn tokenizer() -> Option<&'static CoreBPE> {
    static TOKENIZER: OnceLock<Option<CoreBPE>> = OnceLock::new();
    TOKENIZER
        .get_or_init(|| match tiktoken_rs::cl100k_base() {
            Ok(bpe) => Some(bpe),
            Err(e) => {
                warn!(error = %e, "Failed to load cl100k_base tokenizer, using character ratio");
                None
            }
        })
        .as_ref()
}

/// Measures how many budget units a call consumed.
///
/// This is an approximation: providers do not always report exact usage, so
/// the default is a fixed characters-per-unit ratio over input and output.
#[derive(Debug, Clone, Copy)]
pub struct UsageEstimator {
    kind: EstimatorKind,
    chars_per_unit: u32,
}

impl UsageEstimator {
    pub fn new(kind: EstimatorKind, chars_per_unit: u32) -> Self {
        Self {
            kind,
            chars_per_unit: chars_per_unit.max(1),
        }
    }

    pub fn from_config(config: &BudgetConfig) -> Self {
        Self::new(config.estimator, config.chars_per_unit)
    }

    /// Units for a single piece of text.
    pub fn text_units(&self, text: &str) -> u64 {
        match self.kind {
            EstimatorKind::Bpe => match tokenizer() {
                Some(bpe) => bpe.encode_ordinary(text).len() as u64,
                None => self.char_units(text),
            },
            EstimatorKind::Chars | EstimatorKind::Reported => self.char_units(text),
        }
    }

    fn char_units(&self, text: &str) -> u64 {
        let chars = text.chars().count() as u64;
        chars.div_ceil(self.chars_per_unit as u64)
    }

    /// Units consumed by a call with this input and output.
    pub fn measure(&self, prompt: &str, response: &str, reported: Option<Usage>) -> u64 {
        if self.kind == EstimatorKind::Reported {
            if let Some(usage) = reported.filter(|u| u.total() > 0) {
                return usage.total();
            }
        }
        self.text_units(prompt) + self.text_units(response)
    }
}

impl Default for UsageEstimator {
    fn default() -> Self {
        Self::new(EstimatorKind::Chars, 4)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn char_ratio_rounds_up() {
        let est = UsageEstimator::default();
        assert_eq!(est.text_units(""), 0);
        assert_eq!(est.text_units("abc"), 1);
        assert_eq!(est.text_units("abcd"), 1);
        assert_eq!(est.text_units("abcde"), 2);
        assert_eq!(est.measure("abcd", "abcdabcd", None), 3);
    }

    #[test]
    fn counts_chars_not_bytes() {
        let est = UsageEstimator::new(EstimatorKind::Chars, 1);
        assert_eq!(est.text_units("héllo"), 5);
    }

    #[test]
    fn reported_usage_preferred_when_configured() {
        let est = UsageEstimator::new(EstimatorKind::Reported, 4);
        let usage = Usage {
            input_tokens: 10,
            output_tokens: 32,
        };
        assert_eq!(est.measure("abcd", "abcd", Some(usage)), 42);
        // Falls back to the ratio when the provider reports nothing
        assert_eq!(est.measure("abcd", "abcd", None), 2);
    }

    #[test]
    fn chars_estimator_ignores_reported_usage() {
        let est = UsageEstimator::default();
        let usage = Usage {
            input_tokens: 1000,
            output_tokens: 1000,
        };
        assert_eq!(est.measure("abcd", "", Some(usage)), 1);
    }

    #[test]
    fn zero_ratio_is_clamped() {
        let est = UsageEstimator::new(EstimatorKind::Chars, 0);
        assert_eq!(est.text_units("ab"), 2);
    }
}
