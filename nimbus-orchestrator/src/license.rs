//! Bootstrap license derivation.
//!
//! Layout (16 bytes):
//!
//! ```text
//! feature (u64, big-endian) ‖ SHA-1(feature ‖ uuid)[..8]
//!
//! feature = FLAGS
//!         ^ ((capacity & 0xfff) << 52 | expiration << 36)
//!         ^ (uuid node field & 0xffff_ffff_ffff)
//! ```
//!
//! `expiration` counts days since 2010-01-01; zero means the license never expires.

use chrono::NaiveDate;
use sha1::{Digest, Sha1};
use uuid::Uuid;

const FEATURE_FLAGS: u64 = 0x0000_0001_0000_0000;
const NODE_MASK: u128 = 0xffff_ffff_ffff;

fn reference_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2010, 1, 1).unwrap_or_default()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct License {
    expiration: u16,
    capacity: u16,
    bytes: [u8; 16],
}

impl License {
    /// Derive the license for a cluster. Pure: same inputs, same bytes.
    ///
    /// `expiry_days == 0` yields a permanent license.
    pub fn derive(cluster_uuid: &Uuid, expiry_days: u32, capacity: u32, issued_on: NaiveDate) -> Self {
        let expiration = if expiry_days == 0 {
            0
        } else {
            let since_reference = issued_on
                .signed_duration_since(reference_date())
                .num_days()
                .max(0) as u64;
            (since_reference + u64::from(expiry_days)).min(u64::from(u16::MAX)) as u16
        };
        let capacity = (capacity & 0xfff) as u16;

        let node = (cluster_uuid.as_u128() & NODE_MASK) as u64;
        let feature = FEATURE_FLAGS ^ ((u64::from(capacity) << 52) | (u64::from(expiration) << 36)) ^ node;

        let mut hasher = Sha1::new();
        hasher.update(feature.to_be_bytes());
        hasher.update(cluster_uuid.hyphenated().to_string().as_bytes());
        let digest = hasher.finalize();

        let mut bytes = [0u8; 16];
        bytes[..8].copy_from_slice(&feature.to_be_bytes());
        bytes[8..].copy_from_slice(&digest[..8]);

        Self {
            expiration,
            capacity,
            bytes,
        }
    }

    pub fn is_permanent(&self) -> bool {
        self.expiration == 0
    }

    /// Days since 2010-01-01 after which the license lapses (0 = never).
    pub fn expiration(&self) -> u16 {
        self.expiration
    }

    pub fn capacity(&self) -> u16 {
        self.capacity
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.bytes
    }

    /// Key as submitted to `cluster.addLicense`.
    pub fn key(&self) -> String {
        hex::encode_upper(self.bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uuid() -> Uuid {
        Uuid::parse_str("6f1c2a4e-0b7d-4c1e-9a53-12ab34cd56ef").unwrap()
    }

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn derivation_is_deterministic() {
        let a = License::derive(&uuid(), 30, 24, day(2024, 5, 1));
        let b = License::derive(&uuid(), 30, 24, day(2024, 5, 1));
        assert_eq!(a.as_bytes(), b.as_bytes());
        assert_eq!(a.key(), b.key());
        assert_eq!(a.key().len(), 32);
    }

    #[test]
    fn zero_days_is_permanent_and_distinct() {
        let permanent = License::derive(&uuid(), 0, 24, day(2024, 5, 1));
        assert!(permanent.is_permanent());
        assert_eq!(permanent.expiration(), 0);

        for days in [1, 30, 365, 100_000] {
            let timed = License::derive(&uuid(), days, 24, day(2024, 5, 1));
            assert!(!timed.is_permanent());
            assert_ne!(timed.as_bytes(), permanent.as_bytes());
        }
    }

    #[test]
    fn expiration_counts_from_2010() {
        let lic = License::derive(&uuid(), 10, 24, day(2010, 1, 31));
        assert_eq!(lic.expiration(), 40);
        // Issue dates before the reference count from day zero.
        let early = License::derive(&uuid(), 10, 24, day(2009, 6, 1));
        assert_eq!(early.expiration(), 10);
        let far = License::derive(&uuid(), u32::MAX, 24, day(2024, 1, 1));
        assert_eq!(far.expiration(), u16::MAX);
    }

    #[test]
    fn feature_word_layout() {
        let u = uuid();
        let lic = License::derive(&u, 0, 5, day(2024, 1, 1));
        let feature = u64::from_be_bytes(lic.as_bytes()[..8].try_into().unwrap());
        let node = 0x12ab_34cd_56ef_u64;
        assert_eq!(feature, FEATURE_FLAGS ^ (5u64 << 52) ^ node);
        assert_eq!(lic.capacity(), 5);

        let masked = License::derive(&u, 0, 0x1005, day(2024, 1, 1));
        assert_eq!(masked.capacity(), 5);
        assert_eq!(masked.as_bytes(), lic.as_bytes());
    }

    #[test]
    fn different_clusters_get_different_keys() {
        let other = Uuid::parse_str("6f1c2a4e-0b7d-4c1e-9a53-12ab34cd56e0").unwrap();
        let a = License::derive(&uuid(), 30, 24, day(2024, 5, 1));
        let b = License::derive(&other, 30, 24, day(2024, 5, 1));
        assert_ne!(a.key(), b.key());
    }
}
