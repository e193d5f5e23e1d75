//! This module defines the engines for the supported pairing curves.

pub mod bls12_381;
pub mod bn256;

pub use bls12_381::Bls12381Engine;
pub use bn256::Bn256Engine;
