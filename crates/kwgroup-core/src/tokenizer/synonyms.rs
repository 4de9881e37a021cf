//! Synonym unification.
//!
//! Each group elects its lexicographically smallest word as representative.
//! Groups are applied in table order and a word keeps the representative of
//! the first group that lists it, so overlapping groups do not chain:
//! "budget" maps to "affordable" and "spending" maps to "allowance" even
//! though the second group lists both.

use std::collections::HashMap;

use once_cell::sync::Lazy;

/// Synonym groups over lemmatized tokens.
const SYNONYM_GROUPS: &[&[&str]] = &[
    &["cheap", "inexpensive", "affordable", "budget"],
    &["allowance", "budget", "spending"],
    &["buy", "purchase"],
    &["car", "auto", "automobile", "vehicle"],
    &["big", "large", "huge"],
    &["small", "little", "tiny", "mini"],
    &["fast", "quick", "rapid"],
    &["shop", "store"],
    &["kid", "child"],
    &["phone", "telephone", "cellphone"],
    &["sofa", "couch"],
    &["movie", "film"],
    &["guide", "tutorial"],
    &["price", "cost"],
    &["near", "nearby"],
    &["doctor", "physician"],
    &["lawyer", "attorney"],
    &["fix", "repair"],
    &["sneaker", "trainer"],
    &["purse", "handbag"],
    &["vacation", "holiday"],
    &["bike", "bicycle"],
    &["tv", "television"],
    &["pc", "computer"],
    &["job", "employment"],
];

static REPRESENTATIVES: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    let mut map = HashMap::new();
    for group in SYNONYM_GROUPS {
        let Some(rep) = group.iter().copied().min() else {
            continue;
        };
        for word in *group {
            map.entry(*word).or_insert(rep);
        }
    }
    map
});

/// Map a token to its synonym representative, or return it unchanged.
pub fn representative(token: &str) -> String {
    REPRESENTATIVES
        .get(token)
        .map_or_else(|| token.to_string(), |rep| rep.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_members_share_representative() {
        assert_eq!(representative("cheap"), "affordable");
        assert_eq!(representative("inexpensive"), "affordable");
        assert_eq!(representative("sofa"), "couch");
        assert_eq!(representative("couch"), "couch");
    }

    #[test]
    fn test_first_group_wins_for_overlapping_words() {
        assert_eq!(representative("budget"), "affordable");
        assert_eq!(representative("spending"), "allowance");
        assert_ne!(representative("budget"), representative("spending"));
    }

    #[test]
    fn test_unknown_tokens_pass_through() {
        assert_eq!(representative("shoe"), "shoe");
        assert_eq!(representative("2024"), "2024");
    }
}
