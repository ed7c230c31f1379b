//! Human-readable key labels.
//!
//! Labels are random adjective-noun pairs shown to owners so they can tell
//! keys apart in their client. They are not identifiers: collisions are fine,
//! the key server's id is what revocation uses.

use rand::seq::IndexedRandom;

const ADJECTIVES: &[&str] = &[
    "amber", "ancient", "autumn", "billowing", "bitter", "black", "blue", "bold", "brave",
    "broad", "calm", "cold", "cool", "crimson", "curly", "damp", "dark", "dawn", "delicate",
    "divine", "dry", "empty", "falling", "fancy", "flat", "floral", "fragrant", "frosty",
    "gentle", "green", "hidden", "holy", "icy", "jolly", "late", "lingering", "little",
    "lively", "long", "lucky", "misty", "morning", "muddy", "nameless", "noisy", "odd", "old",
    "orange", "patient", "plain", "polished", "proud", "purple", "quiet", "rapid", "raspy",
    "red", "restless", "rough", "round", "royal", "shiny", "shy", "silent", "small", "snowy",
    "soft", "solitary", "sparkling", "spring", "square", "steep", "still", "summer", "super",
    "sweet", "throbbing", "tight", "tiny", "twilight", "wandering", "weathered", "white",
    "wild", "winter", "wispy", "withered", "yellow", "young",
];

const NOUNS: &[&str] = &[
    "art", "band", "bar", "base", "bird", "block", "boat", "bonus", "bread", "breeze", "brook",
    "bush", "butterfly", "cake", "cell", "cherry", "cloud", "credit", "darkness", "dawn",
    "dew", "disk", "dream", "dust", "feather", "field", "fire", "firefly", "flower", "fog",
    "forest", "frog", "frost", "glade", "glitter", "grass", "hall", "hat", "haze", "heart",
    "hill", "king", "lab", "lake", "leaf", "limit", "math", "meadow", "mode", "moon",
    "morning", "mountain", "mouse", "mud", "night", "otter", "paper", "pine", "poetry",
    "pond", "queen", "rain", "recipe", "resonance", "rice", "river", "salad", "scene", "sea",
    "shadow", "shape", "silence", "sky", "smoke", "snow", "snowflake", "sound", "star", "sun",
    "sunset", "surf", "term", "thunder", "tooth", "tree", "truth", "union", "unit",
    "violet", "voice", "water", "waterfall", "wave", "wildflower", "wind", "wood",
];

/// Random `adjective-noun` label.
pub fn generate_key_name() -> String {
    let mut rng = rand::rng();
    let adjective = ADJECTIVES.choose(&mut rng).copied().unwrap_or("nameless");
    let noun = NOUNS.choose(&mut rng).copied().unwrap_or("key");
    format!("{adjective}-{noun}")
}
