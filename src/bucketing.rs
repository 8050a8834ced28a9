use base64::Engine;
use sha1::{Digest, Sha1};
use sha2::Sha256;

const BUCKET_SCALE_INT: i64 = 0x0FFF_FFFF_FFFF_FFFF;
const BUCKET_SCALE: f32 = BUCKET_SCALE_INT as f32;

/// The part of the hash input that precedes the bucketed value.
#[derive(Clone, Copy, Debug)]
pub(crate) enum BucketPrefix<'a> {
    /// A flag or segment key with its salt.
    KeyAndSalt(&'a str, &'a str),
    /// A rollout seed, which replaces key and salt entirely.
    Seed(i64),
}

impl<'a> BucketPrefix<'a> {
    fn write_hash(&self, hash: &mut Sha1) {
        match self {
            BucketPrefix::KeyAndSalt(key, salt) => {
                hash.update(key.as_bytes());
                hash.update(b".");
                hash.update(salt.as_bytes());
            }
            BucketPrefix::Seed(seed) => {
                let seed_str = seed.to_string();
                hash.update(seed_str.as_bytes());
            }
        }
    }
}

/// Maps a prefix and a bucketable value onto a fraction in [0, 1).
pub(crate) fn bucket_value(prefix: BucketPrefix, id: &str) -> Option<f32> {
    let mut hash = Sha1::new();
    prefix.write_hash(&mut hash);
    hash.update(b".");
    hash.update(id.as_bytes());

    let digest = hash.finalize();
    let hexhash = base16ct::lower::encode_string(&digest);

    let hexhash_15 = hexhash.get(..15)?; // yes, 15 chars, not 16
    let numhash = i64::from_str_radix(hexhash_15, 16).ok()?;

    Some(numhash as f32 / BUCKET_SCALE)
}

/// The key under which a big segment store indexes a context's memberships.
///
/// # Example
/// ```
/// # use launchdarkly_server_sdk_engine::big_segment_context_hash;
/// assert_eq!(
///     big_segment_context_hash("userkey"),
///     "72cBpXPyn4N6TqqlS8Tti37jEcoNhFzL9ZdG1jXkILE="
/// );
/// ```
pub fn big_segment_context_hash(key: &str) -> String {
    let digest = Sha256::digest(key.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(digest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use spectral::prelude::*;
    use test_case::test_case;

    #[test_case("userKeyA", 0.42157587)]
    #[test_case("userKeyB", 0.6708485)]
    #[test_case("userKeyC", 0.10343106)]
    fn bucket_for_key_and_salt(key: &str, expected: f32) {
        let bucket = bucket_value(BucketPrefix::KeyAndSalt("hashKey", "saltyA"), key).unwrap();
        assert_that!(bucket).is_close_to(expected, 0.0000001);
    }

    #[test_case("userKeyA", 0.09801207)]
    #[test_case("userKeyB", 0.14483777)]
    #[test_case("userKeyC", 0.9242641)]
    fn bucket_for_seed(key: &str, expected: f32) {
        let bucket = bucket_value(BucketPrefix::Seed(61), key).unwrap();
        assert_that!(bucket).is_close_to(expected, 0.0000001);
    }

    proptest! {
        #[test]
        fn bucket_is_deterministic_and_in_range(key in ".*", salt in ".*", id in ".*") {
            let first = bucket_value(BucketPrefix::KeyAndSalt(&key, &salt), &id).unwrap();
            let second = bucket_value(BucketPrefix::KeyAndSalt(&key, &salt), &id).unwrap();
            prop_assert_eq!(first, second);
            prop_assert!((0.0..1.0).contains(&first));
        }
    }

    #[test]
    fn buckets_are_uniform() {
        const SAMPLES: usize = 10_000;
        const BINS: usize = 10;

        let mut histogram = [0usize; BINS];
        for i in 0..SAMPLES {
            let key = format!("context-{}", i);
            let bucket = bucket_value(BucketPrefix::KeyAndSalt("flag", "salt"), &key).unwrap();
            let bin = ((bucket * BINS as f32) as usize).min(BINS - 1);
            histogram[bin] += 1;
        }

        let expected = (SAMPLES / BINS) as f64;
        let chi_square: f64 = histogram
            .iter()
            .map(|&observed| {
                let diff = observed as f64 - expected;
                diff * diff / expected
            })
            .sum();

        // p = 0.001 for 9 degrees of freedom
        assert_that!(chi_square).is_less_than(27.88);
    }

    #[test]
    fn context_hash_is_base64_sha256() {
        let hash = big_segment_context_hash("userkey");
        assert_eq!(hash.len(), 44);
        assert_eq!(hash, big_segment_context_hash("userkey"));
        assert_ne!(hash, big_segment_context_hash("otherkey"));
    }
}
