// ── Push key generation ──
//
// Keys are 20 characters: 8 encode the timestamp in milliseconds, 12 are
// random. The alphabet is in ASCII order, so keys sort chronologically.
// Keys generated within the same millisecond reuse the previous random
// suffix incremented by one, which keeps them strictly increasing.

use chrono::Utc;
use rand::Rng;

const PUSH_CHARS: &[u8; 64] = b"-0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ_abcdefghijklmnopqrstuvwxyz";
const TIME_CHARS: usize = 8;
const RANDOM_CHARS: usize = 12;

/// Generator of globally ordered, collision-resistant keys.
#[derive(Debug, Default)]
pub struct KeyGenerator {
    last_time: i64,
    last_random: [u8; RANDOM_CHARS],
    /// Offset between the local clock and the store's clock, in ms.
    clock_offset_ms: i64,
}

impl KeyGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generator whose timestamps are corrected by the store's clock offset.
    pub fn with_clock_offset(offset_ms: i64) -> Self {
        Self {
            clock_offset_ms: offset_ms,
            ..Self::default()
        }
    }

    /// Update the clock offset reported by the store.
    pub fn set_clock_offset(&mut self, offset_ms: i64) {
        self.clock_offset_ms = offset_ms;
    }

    /// Generate a key for the current (offset-corrected) time.
    pub fn generate(&mut self) -> String {
        let now = Utc::now().timestamp_millis() + self.clock_offset_ms;
        self.generate_at(now)
    }

    /// Generate a key for an explicit timestamp in milliseconds.
    pub fn generate_at(&mut self, now_ms: i64) -> String {
        let same_ms = now_ms == self.last_time;
        self.last_time = now_ms;

        let mut key = [0u8; TIME_CHARS + RANDOM_CHARS];
        let mut time = now_ms.max(0);
        for slot in key[..TIME_CHARS].iter_mut().rev() {
            *slot = PUSH_CHARS[usize::try_from(time % 64).unwrap_or(0)];
            time /= 64;
        }

        if same_ms {
            self.increment_random();
        } else {
            let mut rng = rand::thread_rng();
            for digit in &mut self.last_random {
                *digit = rng.gen_range(0..64);
            }
        }

        for (slot, digit) in key[TIME_CHARS..].iter_mut().zip(self.last_random) {
            *slot = PUSH_CHARS[usize::from(digit)];
        }

        key.iter().map(|&b| char::from(b)).collect()
    }

    fn increment_random(&mut self) {
        for digit in self.last_random.iter_mut().rev() {
            if *digit == 63 {
                *digit = 0;
            } else {
                *digit += 1;
                return;
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn keys_have_fixed_length_and_alphabet() {
        let mut keygen = KeyGenerator::new();
        let key = keygen.generate();
        assert_eq!(key.len(), 20);
        assert!(key.bytes().all(|b| PUSH_CHARS.contains(&b)));
    }

    #[test]
    fn keys_sort_by_time() {
        let mut keygen = KeyGenerator::new();
        let early = keygen.generate_at(1_000);
        let late = keygen.generate_at(2_000);
        assert!(early < late);
    }

    #[test]
    fn keys_within_same_millisecond_are_strictly_increasing() {
        let mut keygen = KeyGenerator::new();
        let keys: Vec<String> = (0..100).map(|_| keygen.generate_at(42)).collect();
        for pair in keys.windows(2) {
            assert!(pair[0] < pair[1], "{} !< {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn timestamp_prefix_is_deterministic() {
        let mut keygen = KeyGenerator::new();
        assert_eq!(&keygen.generate_at(0)[..8], "--------");
        assert_eq!(&keygen.generate_at(64)[..8], "------0-");
    }

    #[test]
    fn clock_offset_shifts_prefix() {
        let mut ahead = KeyGenerator::with_clock_offset(86_400_000);
        let mut local = KeyGenerator::new();
        let a = ahead.generate();
        let b = local.generate();
        assert!(a[..8] > b[..8]);
    }
}
