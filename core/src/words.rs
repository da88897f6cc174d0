//! First-login display-name generator: `{Adjective}{Noun}{2-digit suffix}`,
//! e.g. `CoolPanda42` (spec.md §8 scenario 1).

use rand::Rng;

const ADJECTIVES: &[&str] = &[
    "Cool", "Swift", "Brave", "Lucky", "Quiet", "Bold", "Clever", "Gentle", "Bright", "Calm",
    "Nimble", "Jolly", "Fierce", "Sly", "Merry", "Proud",
];

const NOUNS: &[&str] = &[
    "Panda", "Falcon", "Otter", "Wolf", "Heron", "Badger", "Fox", "Lynx", "Raven", "Tiger",
    "Sparrow", "Marten", "Owl", "Hare", "Bison", "Crane",
];

/// Not cryptographically sensitive — display names only need to be
/// distinct-looking. Uniqueness itself is enforced by the caller
/// (`IdentityService::claim_unique_display_name`), which retries this
/// generator against a `by-display-name` index.
pub fn generate_display_name() -> String {
    let mut rng = rand::thread_rng();
    let adjective = ADJECTIVES[rng.gen_range(0..ADJECTIVES.len())];
    let noun = NOUNS[rng.gen_range(0..NOUNS.len())];
    let suffix: u8 = rng.gen_range(0..100);
    format!("{adjective}{noun}{suffix:02}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_well_formed_name() {
        for _ in 0..50 {
            let name = generate_display_name();
            assert!(name.chars().all(|c| c.is_ascii_alphanumeric()));
            let digits: String = name.chars().rev().take(2).collect();
            assert_eq!(digits.len(), 2);
            assert!(digits.chars().all(|c| c.is_ascii_digit()));
        }
    }
}
