//! CLIQUES-style group Diffie-Hellman ladder.
//!
//! Each member holds a private scalar contribution. An "integer-key
//! vector" is modelled here as a [`Ladder`]: a cardinal value (the running
//! product-in-the-exponent) plus a list of "all but mine" sub-keys, one
//! per member who has contributed so far.
//!
//! # Upflow (start / join)
//! Seed a ladder at the Ristretto base point and call [`Ladder::extend`]
//! once per member, in member order. After the last member extends, the
//! sub-key vector has exactly as many entries as members, each missing
//! precisely that member's own exponent. Broadcasting that vector (never
//! the cardinal itself, which is the group secret) is the downflow; any
//! member recovers the shared cardinal via [`Ladder::complete`] using only
//! their own scalar.
//!
//! # Join
//! The initiator seeds the ladder from the *previous* session's final
//! cardinal and sub-keys instead of the base point, then runs [`extend`]
//! once per *new* member only — existing members' positions are untouched,
//! since they have nothing new to contribute.
//!
//! # Exclude / Refresh
//! The initiator drops excluded members' sub-keys (if any) and re-randomises
//! its own contribution across the remaining entries via
//! [`Ladder::rekey_self`], which divides out the old scalar and multiplies
//! in a fresh one using modular inversion in the scalar field. An excluded
//! member, who only ever learned the pre-rekey sub-keys, cannot compute the
//! new cardinal without the initiator's fresh scalar.

use curve25519_dalek::constants::RISTRETTO_BASEPOINT_POINT;
use curve25519_dalek::ristretto::{CompressedRistretto, RistrettoPoint};
use curve25519_dalek::scalar::Scalar;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::error::CryptoError;

/// A member's private contribution to the DH ladder for one round.
#[derive(Clone, Copy)]
pub struct Contribution(pub Scalar);

impl Contribution {
    pub fn random() -> Self {
        Self(Scalar::random(&mut OsRng))
    }
}

/// Wire-safe encoding of a single ladder entry.
pub type LadderPoint = [u8; 32];

fn compress(p: RistrettoPoint) -> LadderPoint {
    p.compress().to_bytes()
}

fn decompress(bytes: &LadderPoint) -> Result<RistrettoPoint, CryptoError> {
    CompressedRistretto::from_slice(bytes)
        .map_err(|e| CryptoError::Ladder(e.to_string()))?
        .decompress()
        .ok_or_else(|| CryptoError::Ladder("point is not on the curve".into()))
}

/// The group DH ladder state carried across an upflow/downflow round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ladder {
    /// One entry per member who has contributed so far, index-aligned with
    /// the member list; each entry is "all contributions but that member's".
    pub sub_keys: Vec<LadderPoint>,
    /// Running product of every contribution applied so far.
    pub cardinal: LadderPoint,
}

impl Ladder {
    /// A fresh ladder seeded at the group generator, ready for the first
    /// member to extend it.
    pub fn seed() -> Self {
        Self {
            sub_keys: Vec::new(),
            cardinal: compress(RISTRETTO_BASEPOINT_POINT),
        }
    }

    /// Seed a join's ladder from a prior session's completed state, so
    /// existing members need not re-contribute.
    pub fn from_previous(sub_keys: Vec<LadderPoint>, cardinal: LadderPoint) -> Self {
        Self { sub_keys, cardinal }
    }

    /// Apply one member's contribution: every existing sub-key is raised by
    /// the new scalar, and the member's own "all but mine" entry is the
    /// cardinal from before this step.
    pub fn extend(&self, contribution: Contribution) -> Result<Self, CryptoError> {
        let scalar = contribution.0;
        let old_cardinal = decompress(&self.cardinal)?;
        let mut sub_keys = Vec::with_capacity(self.sub_keys.len() + 1);
        for p in &self.sub_keys {
            sub_keys.push(compress(decompress(p)? * scalar));
        }
        sub_keys.push(compress(old_cardinal));
        Ok(Self {
            sub_keys,
            cardinal: compress(old_cardinal * scalar),
        })
    }

    /// Drop the sub-key entries at `indices` (an exclude) and re-randomise
    /// the initiator's own contribution at `self_index` across what remains.
    /// `old_scalar` is the initiator's previous contribution, `new_scalar`
    /// its freshly generated replacement.
    pub fn rekey_self(
        &self,
        self_index: usize,
        old_scalar: Scalar,
        new_scalar: Scalar,
        drop_indices: &[usize],
    ) -> Result<Self, CryptoError> {
        let factor = new_scalar * old_scalar.invert();
        let mut sub_keys = Vec::with_capacity(self.sub_keys.len());
        for (i, p) in self.sub_keys.iter().enumerate() {
            if drop_indices.contains(&i) {
                continue;
            }
            if i == self_index {
                // the initiator's own "all but mine" entry never included
                // its own exponent, so it is unaffected by changing it.
                sub_keys.push(*p);
            } else {
                sub_keys.push(compress(decompress(p)? * factor));
            }
        }
        let cardinal = compress(decompress(&self.cardinal)? * factor);
        Ok(Self { sub_keys, cardinal })
    }

    /// A member at `index` recovers the shared cardinal from the broadcast
    /// sub-key vector using only its own current scalar.
    pub fn complete(sub_keys: &[LadderPoint], index: usize, own_scalar: Scalar) -> Result<LadderPoint, CryptoError> {
        let mine = sub_keys
            .get(index)
            .ok_or_else(|| CryptoError::Ladder("own index missing from sub-key vector".into()))?;
        Ok(compress(decompress(mine)? * own_scalar))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn derive_group_secret(members: usize) -> (Vec<Contribution>, Ladder) {
        let contributions: Vec<Contribution> = (0..members).map(|_| Contribution::random()).collect();
        let mut ladder = Ladder::seed();
        for c in &contributions {
            ladder = ladder.extend(*c).unwrap();
        }
        (contributions, ladder)
    }

    #[test]
    fn all_members_derive_the_same_cardinal() {
        let (contributions, ladder) = derive_group_secret(4);
        assert_eq!(ladder.sub_keys.len(), 4);
        let secrets: Vec<LadderPoint> = contributions
            .iter()
            .enumerate()
            .map(|(i, c)| Ladder::complete(&ladder.sub_keys, i, c.0).unwrap())
            .collect();
        assert!(secrets.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(secrets[0], ladder.cardinal);
    }

    #[test]
    fn join_preserves_existing_members_contribution() {
        let (mut contributions, mut ladder) = derive_group_secret(2);
        let joiner = Contribution::random();
        ladder = Ladder::from_previous(ladder.sub_keys, ladder.cardinal)
            .extend(joiner)
            .unwrap();
        contributions.push(joiner);

        let secrets: Vec<LadderPoint> = contributions
            .iter()
            .enumerate()
            .map(|(i, c)| Ladder::complete(&ladder.sub_keys, i, c.0).unwrap())
            .collect();
        assert!(secrets.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn excluded_member_cannot_derive_new_cardinal() {
        let (contributions, ladder) = derive_group_secret(3);
        // member 1 (index 0) refreshes its own contribution and drops member 2 (index 1)
        let old_scalar = contributions[0].0;
        let new_scalar = Scalar::random(&mut OsRng);
        let rekeyed = ladder.rekey_self(0, old_scalar, new_scalar, &[1]).unwrap();

        assert_eq!(rekeyed.sub_keys.len(), 2);
        // remaining member (old index 2, now index 1) recovers the new cardinal
        let remaining_secret = Ladder::complete(&rekeyed.sub_keys, 1, contributions[2].0).unwrap();
        assert_eq!(remaining_secret, rekeyed.cardinal);

        // the excluded member's stale view of the old ladder does not equal the new cardinal
        let excluded_stale_attempt = Ladder::complete(&ladder.sub_keys, 1, contributions[1].0).unwrap();
        assert_ne!(excluded_stale_attempt, rekeyed.cardinal);
    }
}
