//! Per-model token pricing
//!
//! Used to estimate message cost when a record carries usage but no
//! declared `costUSD`. Rates are USD per million tokens. Text without
//! reported usage is sized with [`estimate_tokens`].

use crate::types::TokenUsage;

/// Rates for one model family, USD per 1M tokens.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelRates {
    pub input: f64,
    pub output: f64,
    pub cache_read: f64,
    pub cache_creation: f64,
}

const MODEL_RATES: &[(&str, ModelRates)] = &[
    (
        "claude-opus-4-6",
        ModelRates {
            input: 15.0,
            output: 75.0,
            cache_read: 1.5,
            cache_creation: 18.75,
        },
    ),
    (
        "claude-sonnet-4-5",
        ModelRates {
            input: 3.0,
            output: 15.0,
            cache_read: 0.3,
            cache_creation: 3.75,
        },
    ),
    (
        "claude-haiku-4-5",
        ModelRates {
            input: 0.8,
            output: 4.0,
            cache_read: 0.08,
            cache_creation: 1.0,
        },
    ),
];

/// Find rates for a model id.
///
/// Exact prefixes win (`claude-sonnet-4-5-20250929`); otherwise the family
/// prefix with its last version component dropped is tried
/// (`claude-opus-4-1` matches `claude-opus-4`).
pub fn rates_for(model: &str) -> Option<ModelRates> {
    if model.is_empty() {
        return None;
    }
    if let Some((_, rates)) = MODEL_RATES.iter().find(|(prefix, _)| model.starts_with(prefix)) {
        return Some(*rates);
    }
    MODEL_RATES
        .iter()
        .find(|(prefix, _)| {
            prefix
                .rsplit_once('-')
                .is_some_and(|(family, _)| model.starts_with(family))
        })
        .map(|(_, rates)| *rates)
}

/// Estimated cost in USD; zero for unknown models.
pub fn estimate_cost(model: &str, usage: &TokenUsage) -> f64 {
    let Some(rates) = rates_for(model) else {
        return 0.0;
    };
    (usage.input as f64 * rates.input
        + usage.output as f64 * rates.output
        + usage.cache_read as f64 * rates.cache_read
        + usage.cache_creation as f64 * rates.cache_creation)
        / 1_000_000.0
}

/// Rough token count of a text: one token per four characters, and at
/// least one for any non-empty text.
pub fn estimate_tokens(text: &str) -> u64 {
    if text.is_empty() {
        return 0;
    }
    (text.chars().count() as u64 / 4).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dated_model_matches_prefix() {
        let rates = rates_for("claude-sonnet-4-5-20250929").unwrap();
        assert_eq!(rates.input, 3.0);
    }

    #[test]
    fn test_family_fallback() {
        let rates = rates_for("claude-opus-4-1-20250805").unwrap();
        assert_eq!(rates.output, 75.0);
        assert!(rates_for("gpt-4o").is_none());
        assert!(rates_for("").is_none());
    }

    #[test]
    fn test_estimate_cost() {
        let usage = TokenUsage {
            input: 1_000_000,
            output: 100_000,
            cache_read: 0,
            cache_creation: 0,
        };
        let cost = estimate_cost("claude-haiku-4-5", &usage);
        assert!((cost - 1.2).abs() < 1e-9);
        assert_eq!(estimate_cost("unknown-model", &usage), 0.0);
    }

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("ab"), 1);
        assert_eq!(estimate_tokens(&"x".repeat(400)), 100);
        // Characters, not bytes
        assert_eq!(estimate_tokens("éééé"), 1);
    }
}
