//! Keyword tokenizer.
//!
//! Turns raw keyword text into a canonical, sorted, deduplicated token list.
//! Two keywords group together exactly when their token lists are equal.
//!
//! Pipeline:
//! 1. numeric normalization ([`numeric`])
//! 2. lowercase and split into words
//! 3. compound canonicalization ([`compounds`])
//! 4. stopword removal, question words kept ([`stopwords`])
//! 5. lemmatization, noun first ([`lemmatize`])
//! 6. synonym unification ([`synonyms`])
//! 7. sort and dedupe

pub mod compounds;
pub mod lemmatize;
pub mod numeric;
pub mod stopwords;
pub mod synonyms;

use once_cell::sync::Lazy;
use regex::Regex;

static WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"[a-z0-9]+").expect("valid regex"));

/// Tokenizer output for one keyword.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenizedKeyword {
    pub tokens: Vec<String>,
    /// Contains non-ASCII letters and must not be grouped.
    pub blocked: bool,
}

/// True when any character is a letter outside ASCII.
pub fn has_non_ascii_letters(text: &str) -> bool {
    text.chars().any(|c| c.is_alphabetic() && !c.is_ascii())
}

/// Lowercase and split into ASCII alphanumeric words.
pub(crate) fn split_words(text: &str) -> Vec<String> {
    let lowered = text.to_lowercase();
    WORD.find_iter(&lowered)
        .map(|m| m.as_str().to_string())
        .collect()
}

/// Run the full pipeline on ASCII keyword text.
pub fn tokenize(text: &str) -> Vec<String> {
    let normalized = numeric::normalize_numbers(text);
    let words = split_words(&normalized);
    let words = compounds::canonicalize_compounds(words);
    let words = stopwords::remove_stopwords(words);

    let tokens = words
        .iter()
        .map(|w| lemmatize::lemmatize(w))
        .map(|lemma| synonyms::representative(&lemma))
        .collect();
    sorted_unique(tokens)
}

/// Tokenize a keyword, blocking text with non-ASCII letters.
///
/// Blocked keywords keep a plain whitespace split as their tokens so token
/// blocking and merges can still find them.
pub fn analyze(text: &str) -> TokenizedKeyword {
    if has_non_ascii_letters(text) {
        let tokens = text.to_lowercase().split_whitespace().map(String::from).collect();
        return TokenizedKeyword {
            tokens: sorted_unique(tokens),
            blocked: true,
        };
    }
    TokenizedKeyword {
        tokens: tokenize(text),
        blocked: false,
    }
}

/// Sort and dedupe a token list.
pub fn sorted_unique(mut tokens: Vec<String>) -> Vec<String> {
    tokens.sort();
    tokens.dedup();
    tokens
}
