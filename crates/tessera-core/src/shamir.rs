//! Shamir secret sharing over GF(256).
//!
//! Each byte of the secret is protected by its own random polynomial of
//! degree `threshold - 1`; share `k` holds the polynomial evaluations at
//! `x = k`. Any `threshold` shares recover the secret by Lagrange
//! interpolation at zero; fewer reveal nothing.

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::error::{Result, TesseraError};
use crate::gf256;

/// Share indices run 1..=N. Index 0 is the secret itself and is never issued.
pub const MAX_TOTAL_SHARES: u8 = 254;
pub const MIN_THRESHOLD: u8 = 2;

/// One share of a split secret. `data` is one evaluation per secret byte.
#[derive(Clone, Serialize, Deserialize)]
pub struct ShamirShare {
    pub index: u8,
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

impl Drop for ShamirShare {
    fn drop(&mut self) {
        self.data.zeroize();
    }
}

impl std::fmt::Debug for ShamirShare {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print share bytes
        f.debug_struct("ShamirShare")
            .field("index", &self.index)
            .field("len", &self.data.len())
            .finish()
    }
}

fn check_parameters(threshold: u8, total: u8) -> Result<()> {
    if threshold < MIN_THRESHOLD || threshold > total || total > MAX_TOTAL_SHARES {
        return Err(TesseraError::InvalidShareParameters { threshold, total });
    }
    Ok(())
}

/// Split `secret` into `total` shares with reconstruction threshold
/// `threshold`. A single failed read from the system RNG fails the whole
/// split.
pub fn split(secret: &[u8], threshold: u8, total: u8) -> Result<Vec<ShamirShare>> {
    check_parameters(threshold, total)?;
    if secret.is_empty() {
        return Err(TesseraError::Precondition("cannot split an empty secret".into()));
    }

    let mut shares: Vec<ShamirShare> = (1..=total)
        .map(|index| ShamirShare {
            index,
            data: Vec::with_capacity(secret.len()),
        })
        .collect();

    let mut coefficients = vec![0u8; threshold as usize];
    for &byte in secret {
        coefficients[0] = byte;
        OsRng
            .try_fill_bytes(&mut coefficients[1..])
            .map_err(|e| TesseraError::RngFailure(e.to_string()))?;

        for share in shares.iter_mut() {
            share.data.push(gf256::eval_poly(&coefficients, share.index));
        }
    }
    coefficients.zeroize();

    Ok(shares)
}

/// Recover a secret from `shares`. Requires at least `threshold` shares with
/// distinct indices and equal lengths; extra shares participate in the
/// interpolation as supplied.
pub fn reconstruct(shares: &[ShamirShare], threshold: u8) -> Result<Vec<u8>> {
    if shares.is_empty() || shares.len() < threshold as usize {
        return Err(TesseraError::InsufficientShares {
            threshold,
            got: shares.len(),
        });
    }

    let mut seen = [false; 256];
    for share in shares {
        if share.index == 0 {
            return Err(TesseraError::Precondition("share index 0 is reserved".into()));
        }
        if seen[share.index as usize] {
            return Err(TesseraError::DuplicateShareIndices);
        }
        seen[share.index as usize] = true;
    }

    let length = shares[0].data.len();
    if shares.iter().any(|s| s.data.len() != length) {
        return Err(TesseraError::InconsistentShareLength);
    }

    let mut secret = vec![0u8; length];
    for (position, out) in secret.iter_mut().enumerate() {
        let mut acc = 0u8;
        for (j, share) in shares.iter().enumerate() {
            // Lagrange basis at x = 0
            let mut numerator = 1u8;
            let mut denominator = 1u8;
            for (m, other) in shares.iter().enumerate() {
                if m == j {
                    continue;
                }
                numerator = gf256::mul(numerator, other.index);
                denominator = gf256::mul(denominator, gf256::add(share.index, other.index));
            }
            let basis = gf256::div(numerator, denominator);
            acc = gf256::add(acc, gf256::mul(share.data[position], basis));
        }
        *out = acc;
    }

    Ok(secret)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_reconstruct_round_trip() {
        let secret = b"tessera per-set key material test".to_vec();
        let shares = split(&secret, 3, 5).unwrap();
        assert_eq!(shares.len(), 5);
        assert!(shares.iter().all(|s| s.data.len() == secret.len()));

        let recovered = reconstruct(&shares[..3], 3).unwrap();
        assert_eq!(recovered, secret);
    }

    #[test]
    fn every_threshold_subset_recovers() {
        let secret = vec![0u8, 255, 17, 42];
        let shares = split(&secret, 2, 4).unwrap();
        for i in 0..shares.len() {
            for j in (i + 1)..shares.len() {
                let subset = vec![shares[i].clone(), shares[j].clone()];
                assert_eq!(reconstruct(&subset, 2).unwrap(), secret);
            }
        }
    }

    #[test]
    fn below_threshold_fails() {
        let shares = split(b"secret", 3, 5).unwrap();
        let err = reconstruct(&shares[..2], 3).unwrap_err();
        assert!(matches!(err, TesseraError::InsufficientShares { threshold: 3, got: 2 }));
    }

    #[test]
    fn duplicate_indices_rejected() {
        let shares = split(b"secret", 2, 3).unwrap();
        let dup = vec![shares[0].clone(), shares[0].clone()];
        assert!(matches!(
            reconstruct(&dup, 2).unwrap_err(),
            TesseraError::DuplicateShareIndices
        ));
    }

    #[test]
    fn inconsistent_lengths_rejected() {
        let shares = split(b"secret", 2, 3).unwrap();
        let mut short = shares[1].clone();
        short.data.pop();
        let mixed = vec![shares[0].clone(), short];
        assert!(matches!(
            reconstruct(&mixed, 2).unwrap_err(),
            TesseraError::InconsistentShareLength
        ));
    }

    #[test]
    fn parameter_bounds_enforced() {
        assert!(split(b"s", 1, 3).is_err());
        assert!(split(b"s", 4, 3).is_err());
        assert!(split(b"s", 2, 255).is_err());
        assert!(split(b"", 2, 3).is_err());
    }

    #[test]
    fn extra_shares_still_reconstruct() {
        let secret = b"more shares than threshold".to_vec();
        let shares = split(&secret, 2, 6).unwrap();
        assert_eq!(reconstruct(&shares, 2).unwrap(), secret);
    }
}
