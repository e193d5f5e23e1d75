//! This module defines the traits an engine must satisfy to drive the pool.
use core::fmt::Debug;
use ff::{Field, PrimeField};
use halo2curves::{CurveExt, group::cofactor::CofactorCurveAffine};
use serde::{Serialize, de::DeserializeOwned};

/// A curve group usable by the engine: a prime-order group with an affine
/// companion representation, both carrying the fixed-width wire encoding.
pub trait PoolGroup:
  CurveExt<AffineExt = <Self as PoolGroup>::Affine> + Serialize + DeserializeOwned
{
  /// Affine companion type (`2·n8` bytes on the wire, vs `3·n8` projective).
  type Affine: CofactorCurveAffine<Curve = Self, Scalar = <Self as halo2curves::group::Group>::Scalar>
    + Serialize
    + DeserializeOwned
    + Copy
    + Send
    + Sync;
}

/// A collection of algebraic structures bundled under one curve identity.
pub trait PoolEngine: Clone + Copy + Debug + Send + Sync + Sized + Eq + PartialEq + 'static {
  /// Curve identity, used as the registry key label.
  const NAME: &'static str;

  /// The scalar field; its two-adicity bounds the FFT domain.
  type Scalar: PrimeField + Serialize + DeserializeOwned;

  /// First pairing group.
  type G1: PoolGroup<Scalar = Self::Scalar>;

  /// Second pairing group.
  type G2: PoolGroup<Scalar = Self::Scalar>;

  /// Extension-field target of the pairing.
  type Target: Field + Serialize + DeserializeOwned;
}
