// =============================================================================
// Name Generator — pilot and ship identities
// =============================================================================
//
// Small built-in word lists; the full curated lists live outside the core.
// A fixed seed produces a reproducible identity sequence, which the account
// pool relies on for persisted characters.
// =============================================================================

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const ADJECTIVES: &[&str] = &[
    "Crimson", "Silent", "Iron", "Stellar", "Rogue", "Drifting", "Solar", "Outer", "Lucky",
    "Grim", "Swift", "Hollow", "Radiant", "Feral", "Quantum", "Wandering",
];

const NOUNS: &[&str] = &[
    "Falcon", "Vector", "Nomad", "Trader", "Corsair", "Specter", "Pioneer", "Raven", "Hauler",
    "Comet", "Drifter", "Warden", "Jackal", "Beacon", "Marauder", "Voyager",
];

const SHIP_PREFIXES: &[&str] = &[
    "ISS", "MV", "SS", "TSS", "FV",
];

/// Deterministic-with-seed generator for pilot and ship names.
pub struct NameGenerator {
    rng: StdRng,
    complexity: u8,
    with_numbers: bool,
}

impl NameGenerator {
    pub fn new(complexity: u8, with_numbers: bool, seed: Option<u64>) -> Self {
        Self {
            rng: match seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_entropy(),
            },
            complexity: complexity.clamp(1, 3),
            with_numbers,
        }
    }

    fn pick<'a>(&mut self, list: &[&'a str]) -> &'a str {
        list[self.rng.gen_range(0..list.len())]
    }

    /// Generate a pilot name.  Complexity 1 is a bare noun, 2 adds an
    /// adjective, 3 appends a numeric suffix.
    pub fn pilot_name(&mut self) -> String {
        let noun = self.pick(NOUNS);
        match self.complexity {
            1 => noun.to_string(),
            2 => format!("{} {}", self.pick(ADJECTIVES), noun),
            _ => format!(
                "{} {} {}",
                self.pick(ADJECTIVES),
                noun,
                self.rng.gen_range(10..100)
            ),
        }
    }

    /// Generate a ship name to match a pilot.
    pub fn ship_name(&mut self) -> String {
        let base = format!("{} {}", self.pick(SHIP_PREFIXES), self.pick(NOUNS));
        if self.with_numbers {
            format!("{} {}", base, self.rng.gen_range(2..20))
        } else {
            base
        }
    }

    /// Generate a password of printable characters.
    pub fn password(&mut self, len: usize) -> String {
        const CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
        (0..len.max(6))
            .map(|_| CHARS[self.rng.gen_range(0..CHARS.len())] as char)
            .collect()
    }
}
