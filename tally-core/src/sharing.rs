//! Additive secret sharing over the ring of integers modulo 2^32.
//!
//! A contribution is split into `n` shares whose wrapping sum equals the
//! contribution: the first `n - 1` shares are uniformly random ring
//! elements and the last is the difference. Any strict subset of the
//! shares is therefore a uniformly distributed tuple carrying no
//! information about the contribution; only the complete set
//! reconstructs it.
//!
//! Ring elements are plain `u32` values and ring arithmetic is wrapping
//! `u32` arithmetic, so every representable share is a valid ring
//! element by construction.

use rand::{CryptoRng, Rng};

/// Number of shares a contribution is split into, one per coordinator.
pub const NUM_SHARES: usize = 3;

/// Splits `secret` into `num_shares` additive shares.
///
/// The first `num_shares - 1` shares are sampled uniformly from the
/// ring; the last share is chosen so the wrapping sum of all shares
/// equals `secret`.
///
/// # Panics
///
/// Panics if `num_shares` is zero.
pub fn split(secret: u32, num_shares: usize, rng: &mut (impl CryptoRng + Rng)) -> Vec<u32> {
    assert!(num_shares > 0, "cannot split into zero shares");
    let mut shares = Vec::with_capacity(num_shares);
    let mut acc = 0u32;
    for _ in 0..num_shares - 1 {
        let share = rng.r#gen::<u32>();
        acc = acc.wrapping_add(share);
        shares.push(share);
    }
    shares.push(secret.wrapping_sub(acc));
    shares
}

/// Reconstructs the secret from a complete share set.
///
/// Defined only for complete sets: the wrapping sum of fewer than all
/// shares is a uniformly distributed ring element unrelated to the
/// secret.
pub fn reconstruct(shares: &[u32]) -> u32 {
    shares.iter().fold(0u32, |acc, s| acc.wrapping_add(*s))
}

/// Error returned by [`add_share_vectors`] on malformed input.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ShareVectorError {
    /// No share vectors were provided.
    #[error("cannot add an empty list of share vectors")]
    Empty,
    /// The provided share vectors differ in length.
    #[error("share vectors differ in length: expected {expected}, got {got}")]
    LengthMismatch {
        /// Length of the first vector.
        expected: usize,
        /// Length of the offending vector.
        got: usize,
    },
}

/// Adds share vectors componentwise.
///
/// Used to aggregate the share vectors of multiple contributions: the
/// i-th component of the result is the wrapping sum of all i-th shares,
/// so reconstructing the summed vector yields the sum of the secrets.
pub fn add_share_vectors(vectors: &[Vec<u32>]) -> Result<Vec<u32>, ShareVectorError> {
    let Some(first) = vectors.first() else {
        return Err(ShareVectorError::Empty);
    };
    let len = first.len();
    let mut acc = vec![0u32; len];
    for vector in vectors {
        if vector.len() != len {
            return Err(ShareVectorError::LengthMismatch {
                expected: len,
                got: vector.len(),
            });
        }
        for (sum, share) in acc.iter_mut().zip(vector) {
            *sum = sum.wrapping_add(*share);
        }
    }
    Ok(acc)
}
