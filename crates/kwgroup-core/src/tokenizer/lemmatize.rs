//! Rule-based English lemmatization.
//!
//! Tries the noun reading first and falls back to the verb reading only when
//! the noun rules leave the word unchanged, so `"shoes"` becomes `"shoe"` and
//! `"running"` becomes `"run"`. Known-bad lemmas are pinned in [`OVERRIDES`].

use std::collections::{HashMap, HashSet};

use once_cell::sync::Lazy;

/// Words whose lemma is fixed regardless of the rules below.
const OVERRIDES: &[(&str, &str)] = &[
    ("ads", "ad"),
    ("aws", "aws"),
    ("ios", "ios"),
    ("macos", "macos"),
    ("windows", "windows"),
    ("jeans", "jeans"),
    ("pants", "pants"),
    ("shorts", "shorts"),
    ("leggings", "leggings"),
    ("tights", "tights"),
    ("pajamas", "pajamas"),
    ("scissors", "scissors"),
    ("glasses", "glasses"),
    ("sunglasses", "sunglasses"),
    ("clothes", "clothes"),
    ("news", "news"),
    ("series", "series"),
    ("species", "species"),
    ("means", "means"),
    ("diabetes", "diabetes"),
    ("herpes", "herpes"),
    ("physics", "physics"),
    ("economics", "economics"),
    ("mathematics", "mathematics"),
    ("politics", "politics"),
    ("athletics", "athletics"),
    ("gymnastics", "gymnastics"),
    ("aerobics", "aerobics"),
    ("lens", "lens"),
    ("gas", "gas"),
    ("bus", "bus"),
    ("yes", "yes"),
    ("always", "always"),
    ("perhaps", "perhaps"),
    ("canvas", "canvas"),
    ("atlas", "atlas"),
    ("bias", "bias"),
    ("alias", "alias"),
    ("christmas", "christmas"),
    ("texas", "texas"),
    ("vegas", "vegas"),
    ("kansas", "kansas"),
    ("arkansas", "arkansas"),
    ("paris", "paris"),
    ("media", "media"),
    ("data", "data"),
    ("thing", "thing"),
    ("something", "something"),
    ("nothing", "nothing"),
    ("anything", "anything"),
    ("everything", "everything"),
    ("morning", "morning"),
    ("evening", "evening"),
    ("ceiling", "ceiling"),
    ("spring", "spring"),
    ("string", "string"),
    ("wedding", "wedding"),
    ("clothing", "clothing"),
    ("building", "building"),
    ("pudding", "pudding"),
    ("stuffing", "stuffing"),
    ("bedding", "bedding"),
    ("earring", "earring"),
    ("sibling", "sibling"),
    ("icing", "icing"),
    ("awning", "awning"),
    ("naked", "naked"),
    ("wicked", "wicked"),
    ("sacred", "sacred"),
    ("hatred", "hatred"),
    ("beloved", "beloved"),
    ("hundred", "hundred"),
];

const IRREGULAR_NOUNS: &[(&str, &str)] = &[
    ("children", "child"),
    ("men", "man"),
    ("women", "woman"),
    ("feet", "foot"),
    ("teeth", "tooth"),
    ("mice", "mouse"),
    ("geese", "goose"),
    ("oxen", "ox"),
    ("knives", "knife"),
    ("wives", "wife"),
    ("lives", "life"),
    ("leaves", "leaf"),
    ("shelves", "shelf"),
    ("wolves", "wolf"),
    ("halves", "half"),
    ("loaves", "loaf"),
    ("calves", "calf"),
    ("thieves", "thief"),
    ("scarves", "scarf"),
    ("potatoes", "potato"),
    ("tomatoes", "tomato"),
    ("heroes", "hero"),
    ("echoes", "echo"),
    ("mosquitoes", "mosquito"),
    ("volcanoes", "volcano"),
    ("analyses", "analysis"),
    ("crises", "crisis"),
    ("theses", "thesis"),
    ("diagnoses", "diagnosis"),
    ("criteria", "criterion"),
    ("phenomena", "phenomenon"),
    ("cacti", "cactus"),
    ("fungi", "fungus"),
    ("indices", "index"),
    ("matrices", "matrix"),
    ("quizzes", "quiz"),
];

const IRREGULAR_VERBS: &[(&str, &str)] = &[
    ("ran", "run"),
    ("bought", "buy"),
    ("sold", "sell"),
    ("made", "make"),
    ("went", "go"),
    ("gone", "go"),
    ("took", "take"),
    ("taken", "take"),
    ("got", "get"),
    ("gotten", "get"),
    ("gave", "give"),
    ("given", "give"),
    ("ate", "eat"),
    ("eaten", "eat"),
    ("wrote", "write"),
    ("written", "write"),
    ("drove", "drive"),
    ("driven", "drive"),
    ("rode", "ride"),
    ("ridden", "ride"),
    ("built", "build"),
    ("paid", "pay"),
    ("found", "find"),
    ("felt", "feel"),
    ("kept", "keep"),
    ("lost", "lose"),
    ("sent", "send"),
    ("spent", "spend"),
    ("thought", "think"),
    ("taught", "teach"),
    ("caught", "catch"),
    ("brought", "bring"),
    ("fought", "fight"),
    ("told", "tell"),
    ("understood", "understand"),
    ("worn", "wear"),
    ("wore", "wear"),
    ("broke", "break"),
    ("broken", "break"),
    ("chose", "choose"),
    ("chosen", "choose"),
    ("grew", "grow"),
    ("grown", "grow"),
    ("knew", "know"),
    ("known", "know"),
    ("flew", "fly"),
    ("flown", "fly"),
    ("slept", "sleep"),
    ("stood", "stand"),
    ("swam", "swim"),
    ("sang", "sing"),
    ("began", "begin"),
    ("begun", "begin"),
    ("held", "hold"),
    ("said", "say"),
    ("seen", "see"),
];

/// Singular nouns ending in "ie" (so "movies" is not read as "movy").
const IE_NOUNS: &[&str] = &[
    "movie", "cookie", "zombie", "rookie", "hoodie", "smoothie", "selfie", "calorie", "brownie",
    "pie", "tie", "genie", "goalie", "veggie", "freebie", "beanie", "onesie", "birdie",
    "bootie", "prairie", "lingerie", "sweetie", "auntie", "indie", "newbie", "techie",
    "foodie", "hippie", "collie", "boogie",
];

/// Singular nouns ending in "che" (so "headaches" is not read as "headach").
const CHE_NOUNS: &[&str] = &[
    "headache", "cache", "niche", "avalanche", "moustache", "mustache", "cliche", "quiche",
    "creche", "psyche", "toothache", "backache", "stomachache",
];

/// Verbs whose stem drops a trailing "e" before "-ing"/"-ed".
const E_VERBS: &[&str] = &[
    "make", "take", "bake", "hike", "bike", "ride", "drive", "write", "use", "save", "move",
    "live", "love", "hire", "dance", "change", "charge", "create", "manage", "compare",
    "prepare", "shave", "shape", "share", "trade", "rate", "date", "code", "vote", "wave",
    "type", "style", "smoke", "file", "close", "lose", "choose", "leave", "give", "have",
    "come", "become", "skate", "rise", "price", "place", "race", "trace", "serve", "solve",
    "store", "score", "care", "cure", "tune", "hide", "hope", "dine", "shine", "raise",
    "purchase", "produce", "reduce", "improve", "remove", "prove", "receive", "believe",
    "achieve", "operate", "automate", "update", "upgrade", "decorate", "invite", "excite",
    "bathe", "breathe", "double", "cycle", "juggle", "wrestle", "paddle", "handle",
];

static OVERRIDE_MAP: Lazy<HashMap<&'static str, &'static str>> =
    Lazy::new(|| OVERRIDES.iter().copied().collect());
static NOUN_MAP: Lazy<HashMap<&'static str, &'static str>> =
    Lazy::new(|| IRREGULAR_NOUNS.iter().copied().collect());
static VERB_MAP: Lazy<HashMap<&'static str, &'static str>> =
    Lazy::new(|| IRREGULAR_VERBS.iter().copied().collect());
static IE_SET: Lazy<HashSet<&'static str>> = Lazy::new(|| IE_NOUNS.iter().copied().collect());
static CHE_SET: Lazy<HashSet<&'static str>> = Lazy::new(|| CHE_NOUNS.iter().copied().collect());
static E_VERB_SET: Lazy<HashSet<&'static str>> = Lazy::new(|| E_VERBS.iter().copied().collect());

/// Lemmatize one lowercase word, noun reading first.
pub fn lemmatize(word: &str) -> String {
    if let Some(fixed) = OVERRIDE_MAP.get(word) {
        return fixed.to_string();
    }
    if !word.chars().all(|c| c.is_ascii_lowercase()) {
        return word.to_string();
    }

    let noun = lemmatize_noun(word);
    if noun != word {
        return noun;
    }
    lemmatize_verb(word)
}

fn lemmatize_noun(word: &str) -> String {
    if let Some(singular) = NOUN_MAP.get(word) {
        return singular.to_string();
    }
    if word.len() <= 3 {
        return word.to_string();
    }

    if let Some(stem) = word.strip_suffix("ies") {
        if word.len() > 4 {
            let ie = format!("{stem}ie");
            if IE_SET.contains(ie.as_str()) {
                return ie;
            }
            return format!("{stem}y");
        }
    }
    if let Some(stem) = word.strip_suffix("ches") {
        let che = format!("{stem}che");
        if CHE_SET.contains(che.as_str()) {
            return che;
        }
        return format!("{stem}ch");
    }
    if let Some(stem) = word.strip_suffix("sses") {
        return format!("{stem}ss");
    }
    for suffix in ["shes", "xes"] {
        if let Some(stem) = word.strip_suffix(suffix) {
            return format!("{stem}{}", &suffix[..suffix.len() - 2]);
        }
    }
    if word.ends_with("ss") || word.ends_with("us") || word.ends_with("is") {
        return word.to_string();
    }
    if let Some(stem) = word.strip_suffix('s') {
        return stem.to_string();
    }
    word.to_string()
}

fn lemmatize_verb(word: &str) -> String {
    if let Some(base) = VERB_MAP.get(word) {
        return base.to_string();
    }

    if word.len() > 3 {
        if let Some(stem) = word.strip_suffix("ing") {
            return verb_stem(word, stem);
        }
        if word.ends_with("eed") {
            return word.to_string();
        }
        if let Some(stem) = word.strip_suffix("ied") {
            if word.len() > 4 {
                return format!("{stem}y");
            }
        }
        if let Some(stem) = word.strip_suffix("ed") {
            return verb_stem(word, stem);
        }
    }
    word.to_string()
}

/// Rebuild the base form from a stem with its inflection removed.
fn verb_stem(word: &str, stem: &str) -> String {
    let with_e = format!("{stem}e");
    if E_VERB_SET.contains(with_e.as_str()) {
        return with_e;
    }
    if stem.len() < 3 {
        return word.to_string();
    }

    let bytes = stem.as_bytes();
    if bytes.len() >= 3 {
        let last = bytes[bytes.len() - 1];
        let prev = bytes[bytes.len() - 2];
        if last == prev && !b"aeioulsz".contains(&last) {
            return stem[..stem.len() - 1].to_string();
        }
    }
    stem.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_regular_plurals() {
        assert_eq!(lemmatize("shoes"), "shoe");
        assert_eq!(lemmatize("boots"), "boot");
        assert_eq!(lemmatize("boxes"), "box");
        assert_eq!(lemmatize("watches"), "watch");
        assert_eq!(lemmatize("dresses"), "dress");
        assert_eq!(lemmatize("dishes"), "dish");
        assert_eq!(lemmatize("sizes"), "size");
    }

    #[test]
    fn test_ies_plurals() {
        assert_eq!(lemmatize("batteries"), "battery");
        assert_eq!(lemmatize("movies"), "movie");
        assert_eq!(lemmatize("cookies"), "cookie");
    }

    #[test]
    fn test_che_plurals() {
        assert_eq!(lemmatize("headaches"), "headache");
        assert_eq!(lemmatize("beaches"), "beach");
    }

    #[test]
    fn test_irregular_nouns() {
        assert_eq!(lemmatize("children"), "child");
        assert_eq!(lemmatize("women"), "woman");
        assert_eq!(lemmatize("knives"), "knife");
        assert_eq!(lemmatize("potatoes"), "potato");
    }

    #[test]
    fn test_singular_words_ending_in_s_untouched() {
        assert_eq!(lemmatize("glass"), "glass");
        assert_eq!(lemmatize("status"), "status");
        assert_eq!(lemmatize("analysis"), "analysis");
    }

    #[test]
    fn test_verb_fallback() {
        assert_eq!(lemmatize("running"), "run");
        assert_eq!(lemmatize("shopping"), "shop");
        assert_eq!(lemmatize("making"), "make");
        assert_eq!(lemmatize("using"), "use");
        assert_eq!(lemmatize("selling"), "sell");
        assert_eq!(lemmatize("walked"), "walk");
        assert_eq!(lemmatize("stopped"), "stop");
        assert_eq!(lemmatize("tried"), "try");
        assert_eq!(lemmatize("bought"), "buy");
    }

    #[test]
    fn test_noun_reading_preferred_over_verb() {
        // "runs" strips as a plural noun before any verb rule runs
        assert_eq!(lemmatize("runs"), "run");
        assert_eq!(lemmatize("speed"), "speed");
    }

    #[test]
    fn test_overrides_pin_known_bad_lemmas() {
        assert_eq!(lemmatize("jeans"), "jeans");
        assert_eq!(lemmatize("news"), "news");
        assert_eq!(lemmatize("wedding"), "wedding");
        assert_eq!(lemmatize("ads"), "ad");
        assert_eq!(lemmatize("windows"), "windows");
    }

    #[test]
    fn test_short_and_numeric_words_untouched() {
        assert_eq!(lemmatize("gas"), "gas");
        assert_eq!(lemmatize("ps5"), "ps5");
        assert_eq!(lemmatize("2024"), "2024");
        assert_eq!(lemmatize("sing"), "sing");
        assert_eq!(lemmatize("bring"), "bring");
        assert_eq!(lemmatize("shed"), "shed");
    }
}
