//! Multi-word compound canonicalization.
//!
//! Hyphenated, closed and open spellings of a compound collapse to one
//! canonical token. Matching is greedy, left to right, longest variant first.

use std::collections::HashMap;

use once_cell::sync::Lazy;

/// Canonical form followed by the spellings that map to it.
const COMPOUND_VARIANTS: &[(&str, &[&str])] = &[
    ("email", &["e-mail", "e mail", "email"]),
    ("ecommerce", &["e-commerce", "e commerce", "ecommerce"]),
    ("ebook", &["e-book", "e book", "ebook"]),
    ("ebooks", &["e-books", "e books", "ebooks"]),
    ("ebike", &["e-bike", "e bike", "ebike"]),
    ("ebikes", &["e-bikes", "e bikes", "ebikes"]),
    ("online", &["on-line", "on line", "online"]),
    ("offline", &["off-line", "off line", "offline"]),
    ("website", &["web-site", "web site", "website"]),
    ("websites", &["web-sites", "web sites", "websites"]),
    ("webpage", &["web-page", "web page", "webpage"]),
    ("homepage", &["home-page", "home page", "homepage"]),
    ("wifi", &["wi-fi", "wi fi", "wifi"]),
    ("smartphone", &["smart-phone", "smart phone", "smartphone"]),
    ("smartphones", &["smart-phones", "smart phones", "smartphones"]),
    ("smartwatch", &["smart-watch", "smart watch", "smartwatch"]),
    ("cellphone", &["cell-phone", "cell phone", "cellphone"]),
    ("laptop", &["lap-top", "lap top", "laptop"]),
    ("headphones", &["head-phones", "head phones", "headphones"]),
    ("headphone", &["head-phone", "head phone", "headphone"]),
    ("earbuds", &["ear-buds", "ear buds", "earbuds"]),
    ("keyboard", &["key-board", "key board", "keyboard"]),
    ("notebook", &["note-book", "note book", "notebook"]),
    ("database", &["data-base", "data base", "database"]),
    ("username", &["user-name", "user name", "username"]),
    ("password", &["pass-word", "pass word", "password"]),
    ("login", &["log-in", "log in", "login"]),
    ("signup", &["sign-up", "sign up", "signup"]),
    ("checkout", &["check-out", "check out", "checkout"]),
    ("setup", &["set-up", "set up", "setup"]),
    ("backup", &["back-up", "back up", "backup"]),
    ("workout", &["work-out", "work out", "workout"]),
    ("workouts", &["work-outs", "work outs", "workouts"]),
    ("preworkout", &["pre-workout", "pre workout", "preworkout"]),
    ("weekend", &["week-end", "week end", "weekend"]),
    ("bestseller", &["best-seller", "best seller", "bestseller"]),
    ("bestsellers", &["best-sellers", "best sellers", "bestsellers"]),
    ("nonprofit", &["non-profit", "non profit", "nonprofit"]),
    ("tshirt", &["t-shirt", "t shirt", "tee shirt", "tshirt"]),
    ("tshirts", &["t-shirts", "t shirts", "tee shirts", "tshirts"]),
    ("xray", &["x-ray", "x ray", "xray"]),
    ("skincare", &["skin-care", "skin care", "skincare"]),
    ("healthcare", &["health-care", "health care", "healthcare"]),
    ("haircut", &["hair-cut", "hair cut", "haircut"]),
    ("sunscreen", &["sun-screen", "sun screen", "sunscreen"]),
    ("sunglasses", &["sun-glasses", "sun glasses", "sunglasses"]),
    ("eyeliner", &["eye-liner", "eye liner", "eyeliner"]),
    ("lipstick", &["lip-stick", "lip stick", "lipstick"]),
    ("dishwasher", &["dish-washer", "dish washer", "dishwasher"]),
    ("airfryer", &["air-fryer", "air fryer", "airfryer"]),
    ("underwear", &["under-wear", "under wear", "underwear"]),
    ("swimsuit", &["swim-suit", "swim suit", "swimsuit"]),
    ("bodyweight", &["body-weight", "body weight", "bodyweight"]),
    ("bluetooth", &["blue-tooth", "blue tooth", "bluetooth"]),
    ("youtube", &["you-tube", "you tube", "youtube"]),
    ("playstation", &["play-station", "play station", "playstation"]),
    ("covid19", &["covid-19", "covid 19", "covid19"]),
];

struct CompoundTable {
    variants: HashMap<Vec<String>, String>,
    longest: usize,
}

static TABLE: Lazy<CompoundTable> = Lazy::new(|| {
    let mut variants = HashMap::new();
    let mut longest = 1;
    for (canonical, spellings) in COMPOUND_VARIANTS {
        for spelling in *spellings {
            let key = super::split_words(spelling);
            longest = longest.max(key.len());
            variants.insert(key, canonical.to_string());
        }
    }
    CompoundTable { variants, longest }
});

/// Replace every known compound spelling with its canonical token.
pub fn canonicalize_compounds(words: Vec<String>) -> Vec<String> {
    let table = &*TABLE;
    let mut out = Vec::with_capacity(words.len());
    let mut i = 0;

    while i < words.len() {
        let max_len = table.longest.min(words.len() - i);
        let matched = (1..=max_len).rev().find_map(|len| {
            table
                .variants
                .get(&words[i..i + len])
                .map(|canonical| (len, canonical.clone()))
        });

        match matched {
            Some((len, canonical)) => {
                out.push(canonical);
                i += len;
            }
            None => {
                out.push(words[i].clone());
                i += 1;
            }
        }
    }

    out
}
