use sha2::{Digest, Sha256};

/// Folded into every key digest before the walk. The slice placement this
/// produces is shared state with every other client of the cache fleet, so
/// this value is part of the wire contract and must never change.
const RING_SEED: u64 = 0x38ba_4e98_c5ff_4f3d;

/// Multiplier of the keyed walk (Lamping-Veach jump consistent hash).
const WALK_MULTIPLIER: u64 = 2_862_933_555_777_941_757;

/// Maps `key` to a bucket in `0..buckets`.
///
/// The SHA-256 digest of the key, mixed with the ring seed, drives a jump
/// consistent hash walk: a key only ever moves to the newest bucket, so
/// growing the bucket count from `n` to `n + 1` reassigns each key with
/// probability `1/(n + 1)` and leaves the rest in place.
pub fn hash_bucket(key: &str, buckets: usize) -> usize {
    debug_assert!(buckets > 0, "hash_bucket needs at least one bucket");
    if buckets <= 1 {
        return 0;
    }
    let digest = Sha256::digest(key.as_bytes());
    let mut state =
        u64::from_be_bytes(digest[..8].try_into().expect("digest is 32 bytes")) ^ RING_SEED;
    let mut bucket: i64 = -1;
    let mut candidate: i64 = 0;
    while candidate < buckets as i64 {
        bucket = candidate;
        state = state.wrapping_mul(WALK_MULTIPLIER).wrapping_add(1);
        candidate =
            ((bucket + 1) as f64 * (2_147_483_648.0 / (((state >> 33) + 1) as f64))) as i64;
    }
    bucket as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(n: usize) -> Vec<String> {
        (0..n)
            .map(|i| format!("http://weights.example.com/model-{i}.bin:{}", i % 7))
            .collect()
    }

    /// Fixed assignments for one known object, sixteen bytes over
    /// three-byte slices, as served by fleets of one through eight hosts.
    /// These are golden values shared with the rest of the fleet's clients;
    /// a mismatch here means cache routing breaks interop.
    #[test]
    fn matches_golden_assignments() {
        const URL: &str = "http://test.replicate.delivery/hello.txt";
        const GOLDEN: [[usize; 6]; 8] = [
            [0, 0, 0, 0, 0, 0],
            [0, 1, 0, 0, 1, 0],
            [0, 1, 0, 2, 1, 0],
            [0, 1, 3, 3, 1, 0],
            [0, 1, 4, 3, 1, 0],
            [0, 1, 4, 3, 1, 5],
            [0, 6, 4, 3, 6, 5],
            [0, 6, 4, 3, 6, 7],
        ];
        for (ring, row) in GOLDEN.iter().enumerate() {
            let buckets = ring + 1;
            for (slice, expected) in row.iter().enumerate() {
                assert_eq!(
                    hash_bucket(&format!("{URL}:{slice}"), buckets),
                    *expected,
                    "slice {slice} with {buckets} buckets"
                );
            }
        }
    }

    #[test]
    fn single_bucket_takes_everything() {
        for key in keys(50) {
            assert_eq!(hash_bucket(&key, 1), 0);
        }
    }

    #[test]
    fn deterministic_for_a_given_key() {
        for key in keys(50) {
            for buckets in 1..=10 {
                assert_eq!(hash_bucket(&key, buckets), hash_bucket(&key, buckets));
            }
        }
    }

    #[test]
    fn stays_in_range() {
        for key in keys(200) {
            for buckets in 1..=16 {
                assert!(hash_bucket(&key, buckets) < buckets);
            }
        }
    }

    /// Growing the ring by one host either leaves a key alone or moves it to
    /// the new host, never shuffles it between existing hosts.
    #[test]
    fn growth_only_moves_keys_to_the_new_bucket() {
        for key in keys(300) {
            let mut previous = hash_bucket(&key, 1);
            for buckets in 2..=12 {
                let current = hash_bucket(&key, buckets);
                assert!(
                    current == previous || current == buckets - 1,
                    "key {key} moved from {previous} to {current} with {buckets} buckets"
                );
                previous = current;
            }
        }
    }

    #[test]
    fn growth_moves_roughly_one_in_n_keys() {
        let keys = keys(3000);
        for buckets in 2..=8 {
            let moved = keys
                .iter()
                .filter(|k| hash_bucket(k, buckets) != hash_bucket(k, buckets - 1))
                .count();
            let expected = keys.len() / buckets;
            // Generous band around 1/buckets to keep the test stable.
            assert!(
                moved > expected / 2 && moved < expected * 2,
                "{moved} of {} keys moved going to {buckets} buckets (expected ~{expected})",
                keys.len()
            );
        }
    }

    #[test]
    fn distribution_is_roughly_uniform() {
        let keys = keys(2000);
        let buckets = 8;
        let mut counts = vec![0usize; buckets];
        for key in &keys {
            counts[hash_bucket(key, buckets)] += 1;
        }
        for (bucket, count) in counts.iter().enumerate() {
            assert!(
                (175..=325).contains(count),
                "bucket {bucket} holds {count} of {} keys",
                keys.len()
            );
        }
    }
}
