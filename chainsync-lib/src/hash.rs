use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use sha2::{Digest, Sha224};

use crate::features::Features;
use crate::render;
use crate::rule::Rule;

pub const HASH_LEN: usize = 16;

/// Seed used for rules appended to the end of a hook chain.
pub fn append_seed(chain: &str) -> String {
    format!("{chain}/append")
}

/// Commitment hashes for an ordered rule list.
///
/// The digest is chained: every hash covers the seed, all earlier rules and the rule itself,
/// so moving a rule changes its tag as well as changing its content.
pub fn rule_hashes(seed: &str, rules: &[Rule], features: &Features) -> Vec<String> {
    let mut hasher = Sha224::new();
    hasher.update(seed.as_bytes());
    let mut previous: Vec<u8> = Vec::new();
    rules
        .iter()
        .map(|rule| {
            hasher.update(&previous);
            hasher.update(render::render_body(rule, features).as_bytes());
            let digest = hasher.clone().finalize();
            previous = digest.to_vec();
            let mut encoded = URL_SAFE_NO_PAD.encode(digest);
            encoded.truncate(HASH_LEN);
            encoded
        })
        .collect()
}
