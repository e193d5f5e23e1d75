//! This module implements the engine traits for BN254 (also known as BN256 or
//! alt_bn128).
use crate::traits::{PoolEngine, PoolGroup};
use halo2curves::bn256::{Fq12, Fr, G1, G1Affine, G2, G2Affine};
use serde::{Deserialize, Serialize};

/// Re-exports that give access to the standard aliases used in the code base, for bn254
pub mod bn254 {
  pub use halo2curves::bn256::{
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

/// The BN254 engine.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Bn256Engine;

impl PoolEngine for Bn256Engine {
  const NAME: &'static str = "bn254";
  type Scalar = Fr;
  type G1 = G1;
  type G2 = G2;
  type Target = Fq12;
}

#[cfg(test)]
mod tests {
  use super::*;
  use ff::{Field, PrimeField};
  use halo2curves::group::Group;

  #[test]
  fn scalar_field_two_adicity_supports_large_domains() {
    // 2^28 roots of unity are enough for every transform size the engine
    // accepts on this curve.
    assert_eq!(Fr::S, 28);
    let root = Fr::ROOT_OF_UNITY;
    let mut acc = root;
    for _ in 0..Fr::S {
      acc = acc.square();
    }
    assert_eq!(acc, Fr::ONE);
    assert_ne!(root, Fr::ONE);
  }

  #[test]
  fn generators_are_not_identity() {
    assert!(!bool::from(G1::generator().is_identity()));
    assert!(!bool::from(G2::generator().is_identity()));
  }
}
