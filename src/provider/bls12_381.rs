//! This module implements the engine traits for BLS12-381.
//!
//! BLS12-381 is a pairing-friendly elliptic curve offering ~128 bits of
//! security; its base field is 48 bytes wide, so point encodings are larger
//! than on BN254.
use crate::traits::{PoolEngine, PoolGroup};
use halo2curves::bls12381::{Fq12, Fr, G1, G1Affine, G2, G2Affine};
use serde::{Deserialize, Serialize};

/// Re-exports that give access to the standard aliases used in the code base, for BLS12-381
pub mod bls12381 {
  pub use halo2curves::bls12381::{
    Fq as Base, Fr as Scalar, G1 as Point, G1Affine as Affine, G2 as Point2,
    G2Affine as Affine2, Fq12 as Target,
  };
}

impl PoolGroup for G1 {
  type Affine = G1Affine;
}

impl PoolGroup for G2 {
  type Affine = G2Affine;
}

/// The BLS12-381 engine.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Bls12381Engine;

impl PoolEngine for Bls12381Engine {
  const NAME: &'static str = "bls12381";
  type Scalar = Fr;
  type G1 = G1;
  type G2 = G2;
  type Target = Fq12;
}

#[cfg(test)]
mod tests {
  use super::*;
  use ff::{Field, PrimeField};

  #[test]
  fn root_of_unity_has_full_order() {
    let root = Fr::ROOT_OF_UNITY;
    let mut acc = root;
    for _ in 0..(Fr::S - 1) {
      acc = acc.square();
    }
    // order exactly 2^S: one squaring short of the identity
    assert_ne!(acc, Fr::ONE);
    assert_eq!(acc.square(), Fr::ONE);
  }
}
