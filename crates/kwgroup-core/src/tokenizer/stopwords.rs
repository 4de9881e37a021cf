//! English stopword filtering.
//!
//! Question words carry search intent ("how to tie a tie" vs "tie a tie"),
//! so they survive filtering.

use std::collections::HashSet;

use once_cell::sync::Lazy;

/// Question words kept even though they are stopwords.
pub const QUESTION_WORDS: &[&str] = &[
    "what", "why", "how", "when", "where", "who", "which", "whose", "whom", "can",
];

const STOPWORDS: &[&str] = &[
    "i", "me", "my", "myself", "we", "our", "ours", "ourselves", "you", "your", "yours",
    "yourself", "yourselves", "he", "him", "his", "himself", "she", "her", "hers", "herself",
    "it", "its", "itself", "they", "them", "their", "theirs", "themselves", "what", "which",
    "who", "whom", "this", "that", "these", "those", "am", "is", "are", "was", "were", "be",
    "been", "being", "have", "has", "had", "having", "do", "does", "did", "doing", "a", "an",
    "the", "and", "but", "if", "or", "because", "as", "until", "while", "of", "at", "by",
    "for", "with", "about", "against", "between", "into", "through", "during", "before",
    "after", "above", "below", "to", "from", "up", "down", "in", "out", "on", "off", "over",
    "under", "again", "further", "then", "once", "here", "there", "when", "where", "why",
    "how", "all", "any", "both", "each", "few", "more", "most", "other", "some", "such", "no",
    "nor", "not", "only", "own", "same", "so", "than", "too", "very", "s", "t", "can", "will",
    "just", "don", "should", "now", "d", "ll", "m", "o", "re", "ve", "y", "ain", "aren",
    "couldn", "didn", "doesn", "hadn", "hasn", "haven", "isn", "ma", "mightn", "mustn",
    "needn", "shan", "shouldn", "wasn", "weren", "won", "wouldn", "whose",
];

static DROPPED: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    STOPWORDS
        .iter()
        .copied()
        .filter(|w| !QUESTION_WORDS.contains(w))
        .collect()
});

/// True when the word is a stopword that should be removed.
pub fn is_stopword(word: &str) -> bool {
    DROPPED.contains(word)
}

/// Drop stopwords, keeping question words.
pub fn remove_stopwords(words: Vec<String>) -> Vec<String> {
    words.into_iter().filter(|w| !is_stopword(w)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drops_common_stopwords() {
        let words = vec!["the".into(), "best".into(), "shoes".into(), "for".into(), "men".into()];
        assert_eq!(remove_stopwords(words), vec!["best", "shoes", "men"]);
    }

    #[test]
    fn test_keeps_question_words() {
        for word in QUESTION_WORDS {
            assert!(!is_stopword(word), "{word} should be kept");
        }
    }

    #[test]
    fn test_drops_contraction_fragments() {
        assert!(is_stopword("s"));
        assert!(is_stopword("t"));
        assert!(is_stopword("don"));
    }
}
