//! Thin per-structure façades: scalar field, the two point groups, and the
//! extension-field target group.
//!
//! Elementwise operations marshal their byte-buffer arguments through a
//! sync-op bracket on the manager's own instance; the bulk operations
//! (`multi_exp`, `fft`/`ifft` and the standalone transform stages) partition
//! work into tasks over the queue. All buffers use the engine's internal
//! fixed-width encoding; canonical-form conversions are explicit.
use crate::{
  arena::BuffHandle,
  codec,
  curve::{Curve, GroupSizes},
  errors::EngineError,
  fft, msm,
  pool::{SyncArg, ThreadManager},
  task::{FieldOp, GroupId, GroupOp, Opcode},
  traits::{PoolEngine, PoolGroup},
};
use digest::{ExtendableOutput, Update};
use ff::{Field, PrimeField};
use halo2curves::{
  CurveExt,
  group::{Curve as _, cofactor::CofactorCurveAffine},
};
use rand_core::OsRng;
use rayon::prelude::*;
use sha3::Shake256;
use std::io::Read;
use std::marker::PhantomData;

fn with_sync<E: PoolEngine, T>(
  tm: &mut ThreadManager<E>,
  f: impl FnOnce(&mut ThreadManager<E>) -> Result<T, EngineError>,
) -> Result<T, EngineError> {
  tm.start_sync_op()?;
  let out = f(tm);
  let ended = tm.end_sync_op();
  let out = out?;
  ended?;
  Ok(out)
}

fn field_bin<E: PoolEngine>(
  curve: &Curve<E>,
  wrap: fn(FieldOp) -> Opcode,
  n8: usize,
  op: FieldOp,
  a: &[u8],
  b: &[u8],
) -> Result<Vec<u8>, EngineError> {
  if a.len() != n8 || b.len() != n8 {
    return Err(EngineError::InvalidInputLength);
  }
  let mut tm = curve.manager()?;
  with_sync(&mut tm, |tm| {
    let pa = tm.alloc_buff(a)?;
    let pb = tm.alloc_buff(b)?;
    let pr = tm.alloc(n8)?;
    tm.sync_call(
      wrap(op),
      &[SyncArg::Buff(pa), SyncArg::Buff(pb), SyncArg::Buff(pr)],
    )?;
    tm.get_buff(pr)
  })
}

fn field_un<E: PoolEngine>(
  curve: &Curve<E>,
  wrap: fn(FieldOp) -> Opcode,
  n8: usize,
  op: FieldOp,
  a: &[u8],
) -> Result<Vec<u8>, EngineError> {
  if a.len() != n8 {
    return Err(EngineError::InvalidInputLength);
  }
  let mut tm = curve.manager()?;
  with_sync(&mut tm, |tm| {
    let pa = tm.alloc_buff(a)?;
    let pr = tm.alloc(n8)?;
    tm.sync_call(wrap(op), &[SyncArg::Buff(pa), SyncArg::Buff(pr)])?;
    tm.get_buff(pr)
  })
}

fn field_exp<E: PoolEngine>(
  curve: &Curve<E>,
  wrap: fn(FieldOp) -> Opcode,
  n8: usize,
  a: &[u8],
  exponent: &[u8],
) -> Result<Vec<u8>, EngineError> {
  if a.len() != n8 {
    return Err(EngineError::InvalidInputLength);
  }
  let mut tm = curve.manager()?;
  with_sync(&mut tm, |tm| {
    let pa = tm.alloc_buff(a)?;
    let pe = tm.alloc_buff(exponent)?;
    let pr = tm.alloc(n8)?;
    tm.sync_call(
      wrap(FieldOp::Exp),
      &[
        SyncArg::Buff(pa),
        SyncArg::Buff(pe),
        SyncArg::Value(exponent.len() as u64),
        SyncArg::Buff(pr),
      ],
    )?;
    tm.get_buff(pr)
  })
}

/// Elementwise scalar-field operations.
pub struct FieldFacade<'a, E: PoolEngine> {
  curve: &'a Curve<E>,
}

impl<'a, E: PoolEngine> FieldFacade<'a, E> {
  pub(crate) fn new(curve: &'a Curve<E>) -> Self {
    Self { curve }
  }

  /// Element size in bytes.
  pub fn n8(&self) -> usize {
    self.curve.consts().n8s
  }

  /// The additive identity.
  pub fn zero(&self) -> Result<Vec<u8>, EngineError> {
    codec::to_bytes(&E::Scalar::ZERO).map_err(EngineError::from)
  }

  /// The multiplicative identity.
  pub fn one(&self) -> Result<Vec<u8>, EngineError> {
    codec::to_bytes(&E::Scalar::ONE).map_err(EngineError::from)
  }

  /// A uniformly random element.
  pub fn random(&self) -> Result<Vec<u8>, EngineError> {
    codec::to_bytes(&E::Scalar::random(OsRng)).map_err(EngineError::from)
  }

  /// `a + b`
  pub fn add(&self, a: &[u8], b: &[u8]) -> Result<Vec<u8>, EngineError> {
    field_bin(self.curve, Opcode::Scalar, self.n8(), FieldOp::Add, a, b)
  }

  /// `a - b`
  pub fn sub(&self, a: &[u8], b: &[u8]) -> Result<Vec<u8>, EngineError> {
    field_bin(self.curve, Opcode::Scalar, self.n8(), FieldOp::Sub, a, b)
  }

  /// `a * b`
  pub fn mul(&self, a: &[u8], b: &[u8]) -> Result<Vec<u8>, EngineError> {
    field_bin(self.curve, Opcode::Scalar, self.n8(), FieldOp::Mul, a, b)
  }

  /// `a^2`
  pub fn square(&self, a: &[u8]) -> Result<Vec<u8>, EngineError> {
    field_un(self.curve, Opcode::Scalar, self.n8(), FieldOp::Square, a)
  }

  /// `-a`
  pub fn neg(&self, a: &[u8]) -> Result<Vec<u8>, EngineError> {
    field_un(self.curve, Opcode::Scalar, self.n8(), FieldOp::Neg, a)
  }

  /// `a^-1`; fails on zero.
  pub fn inverse(&self, a: &[u8]) -> Result<Vec<u8>, EngineError> {
    field_un(self.curve, Opcode::Scalar, self.n8(), FieldOp::Inverse, a)
  }

  /// A square root of `a`; fails on a non-residue.
  pub fn sqrt(&self, a: &[u8]) -> Result<Vec<u8>, EngineError> {
    field_un(self.curve, Opcode::Scalar, self.n8(), FieldOp::Sqrt, a)
  }

  /// `a^e` for a canonical little-endian exponent of any width.
  pub fn exp(&self, a: &[u8], exponent: &[u8]) -> Result<Vec<u8>, EngineError> {
    field_exp(self.curve, Opcode::Scalar, self.n8(), a, exponent)
  }

  /// Value equality of two internal-form elements.
  pub fn eq(&self, a: &[u8], b: &[u8]) -> Result<bool, EngineError> {
    if a.len() != self.n8() || b.len() != self.n8() {
      return Err(EngineError::InvalidInputLength);
    }
    Ok(a == b)
  }

  /// Whether `a` is the additive identity.
  pub fn is_zero(&self, a: &[u8]) -> Result<bool, EngineError> {
    Ok(a == self.zero()?.as_slice() && a.len() == self.n8())
  }

  /// Internal form → canonical little-endian representative.
  pub fn to_canonical(&self, a: &[u8]) -> Result<Vec<u8>, EngineError> {
    if a.len() != self.n8() {
      return Err(EngineError::InvalidInputLength);
    }
    let v: E::Scalar = codec::from_bytes(a)?;
    Ok(v.to_repr().as_ref().to_vec())
  }

  /// Canonical little-endian representative → internal form.
  pub fn from_canonical(&self, bytes: &[u8]) -> Result<Vec<u8>, EngineError> {
    let mut repr = <E::Scalar as PrimeField>::Repr::default();
    if bytes.len() != repr.as_ref().len() {
      return Err(EngineError::InvalidInputLength);
    }
    repr.as_mut().copy_from_slice(bytes);
    let v = Option::<E::Scalar>::from(E::Scalar::from_repr(repr))
      .ok_or(EngineError::InvalidInputLength)?;
    codec::to_bytes(&v).map_err(EngineError::from)
  }
}

/// Elementwise target-field operations (the multiplicative set used on the
/// pairing target).
pub struct TargetFacade<'a, E: PoolEngine> {
  curve: &'a Curve<E>,
}

impl<'a, E: PoolEngine> TargetFacade<'a, E> {
  pub(crate) fn new(curve: &'a Curve<E>) -> Self {
    Self { curve }
  }

  /// Element size in bytes.
  pub fn n8(&self) -> usize {
    self.curve.consts().n8t
  }

  /// The multiplicative identity.
  pub fn one(&self) -> Result<Vec<u8>, EngineError> {
    codec::to_bytes(&E::Target::ONE).map_err(EngineError::from)
  }

  /// `a * b`
  pub fn mul(&self, a: &[u8], b: &[u8]) -> Result<Vec<u8>, EngineError> {
    field_bin(self.curve, Opcode::Target, self.n8(), FieldOp::Mul, a, b)
  }

  /// `a^2`
  pub fn square(&self, a: &[u8]) -> Result<Vec<u8>, EngineError> {
    field_un(self.curve, Opcode::Target, self.n8(), FieldOp::Square, a)
  }

  /// `a^-1`; fails on zero.
  pub fn inverse(&self, a: &[u8]) -> Result<Vec<u8>, EngineError> {
    field_un(self.curve, Opcode::Target, self.n8(), FieldOp::Inverse, a)
  }

  /// `a^e` for a canonical little-endian exponent of any width.
  pub fn exp(&self, a: &[u8], exponent: &[u8]) -> Result<Vec<u8>, EngineError> {
    field_exp(self.curve, Opcode::Target, self.n8(), a, exponent)
  }

  /// Value equality of two internal-form elements.
  pub fn eq(&self, a: &[u8], b: &[u8]) -> Result<bool, EngineError> {
    if a.len() != self.n8() || b.len() != self.n8() {
      return Err(EngineError::InvalidInputLength);
    }
    Ok(a == b)
  }
}

/// Point-group operations; accepts affine (`2·n8`) or projective (`3·n8`)
/// buffers and normalizes as needed.
pub struct GroupFacade<'a, E: PoolEngine, G: PoolGroup<Scalar = E::Scalar>> {
  curve: &'a Curve<E>,
  id: GroupId,
  _group: PhantomData<G>,
}

impl<'a, E: PoolEngine, G: PoolGroup<Scalar = E::Scalar>> GroupFacade<'a, E, G> {
  pub(crate) fn new(curve: &'a Curve<E>, id: GroupId) -> Self {
    Self {
      curve,
      id,
      _group: PhantomData,
    }
  }

  fn sizes(&self) -> GroupSizes {
    self.curve.consts().group_sizes(self.id)
  }

  /// Affine element size in bytes (`2·n8`).
  pub fn n8_affine(&self) -> usize {
    self.sizes().aff
  }

  /// Projective element size in bytes (`3·n8`).
  pub fn n8_projective(&self) -> usize {
    self.sizes().proj
  }

  /// The identity element, affine form.
  pub fn identity_affine(&self) -> Result<Vec<u8>, EngineError> {
    codec::to_bytes(&G::Affine::identity()).map_err(EngineError::from)
  }

  /// The group generator, affine form.
  pub fn generator_affine(&self) -> Result<Vec<u8>, EngineError> {
    codec::to_bytes(&G::Affine::generator()).map_err(EngineError::from)
  }

  /// Loads a point buffer of either form into the sync arena, normalizing to
  /// projective.
  fn load_projective(
    &self,
    tm: &mut ThreadManager<E>,
    p: &[u8],
  ) -> Result<BuffHandle, EngineError> {
    let sizes = self.sizes();
    if p.len() == sizes.proj {
      tm.alloc_buff(p)
    } else if p.len() == sizes.aff {
      let pa = tm.alloc_buff(p)?;
      let pj = tm.alloc(sizes.proj)?;
      tm.sync_call(
        Opcode::Group(self.id, GroupOp::ToProjective),
        &[SyncArg::Buff(pa), SyncArg::Buff(pj)],
      )?;
      Ok(pj)
    } else {
      Err(EngineError::InvalidPointLength)
    }
  }

  fn point_bin(&self, op: GroupOp, a: &[u8], b: &[u8]) -> Result<Vec<u8>, EngineError> {
    let sizes = self.sizes();
    let mut tm = self.curve.manager()?;
    with_sync(&mut tm, |tm| {
      let pa = self.load_projective(tm, a)?;
      let pb = self.load_projective(tm, b)?;
      let pr = tm.alloc(sizes.proj)?;
      tm.sync_call(
        Opcode::Group(self.id, op),
        &[SyncArg::Buff(pa), SyncArg::Buff(pb), SyncArg::Buff(pr)],
      )?;
      tm.get_buff(pr)
    })
  }

  fn point_un(&self, op: GroupOp, a: &[u8]) -> Result<Vec<u8>, EngineError> {
    let sizes = self.sizes();
    let mut tm = self.curve.manager()?;
    with_sync(&mut tm, |tm| {
      let pa = self.load_projective(tm, a)?;
      let pr = tm.alloc(sizes.proj)?;
      tm.sync_call(
        Opcode::Group(self.id, op),
        &[SyncArg::Buff(pa), SyncArg::Buff(pr)],
      )?;
      tm.get_buff(pr)
    })
  }

  /// `a + b`; result in projective form.
  pub fn add(&self, a: &[u8], b: &[u8]) -> Result<Vec<u8>, EngineError> {
    self.point_bin(GroupOp::Add, a, b)
  }

  /// `a - b`; result in projective form.
  pub fn sub(&self, a: &[u8], b: &[u8]) -> Result<Vec<u8>, EngineError> {
    self.point_bin(GroupOp::Sub, a, b)
  }

  /// `2a`; result in projective form.
  pub fn double(&self, a: &[u8]) -> Result<Vec<u8>, EngineError> {
    self.point_un(GroupOp::Double, a)
  }

  /// `-a`; result in projective form.
  pub fn neg(&self, a: &[u8]) -> Result<Vec<u8>, EngineError> {
    self.point_un(GroupOp::Neg, a)
  }

  /// `s·p` for an internal-form scalar; result in projective form.
  pub fn times_scalar(&self, p: &[u8], scalar: &[u8]) -> Result<Vec<u8>, EngineError> {
    if scalar.len() != self.curve.consts().n8s {
      return Err(EngineError::InvalidInputLength);
    }
    let sizes = self.sizes();
    let mut tm = self.curve.manager()?;
    with_sync(&mut tm, |tm| {
      let pp = self.load_projective(tm, p)?;
      let ps = tm.alloc_buff(scalar)?;
      let pr = tm.alloc(sizes.proj)?;
      tm.sync_call(
        Opcode::Group(self.id, GroupOp::ScalarMul),
        &[SyncArg::Buff(pp), SyncArg::Buff(ps), SyncArg::Buff(pr)],
      )?;
      tm.get_buff(pr)
    })
  }

  /// Normalizes a point buffer of either form to affine.
  pub fn to_affine(&self, p: &[u8]) -> Result<Vec<u8>, EngineError> {
    let sizes = self.sizes();
    if p.len() == sizes.aff {
      return Ok(p.to_vec());
    }
    let mut tm = self.curve.manager()?;
    with_sync(&mut tm, |tm| {
      let pp = self.load_projective(tm, p)?;
      let pr = tm.alloc(sizes.aff)?;
      tm.sync_call(
        Opcode::Group(self.id, GroupOp::ToAffine),
        &[SyncArg::Buff(pp), SyncArg::Buff(pr)],
      )?;
      tm.get_buff(pr)
    })
  }

  /// Normalizes a point buffer of either form to projective.
  pub fn to_projective(&self, p: &[u8]) -> Result<Vec<u8>, EngineError> {
    if p.len() == self.sizes().proj {
      return Ok(p.to_vec());
    }
    let mut tm = self.curve.manager()?;
    with_sync(&mut tm, |tm| {
      let pj = self.load_projective(tm, p)?;
      tm.get_buff(pj)
    })
  }

  /// Value equality of two points in either form.
  pub fn eq(&self, a: &[u8], b: &[u8]) -> Result<bool, EngineError> {
    Ok(self.to_affine(a)? == self.to_affine(b)?)
  }

  /// Whether `p` is the identity.
  pub fn is_zero(&self, p: &[u8]) -> Result<bool, EngineError> {
    Ok(self.to_affine(p)? == self.identity_affine()?)
  }

  /// Σ scalarᵢ·baseᵢ over an affine base sequence and canonical
  /// little-endian scalars of `n8s` bytes each; result in projective form.
  pub fn multi_exp(&self, bases: &[u8], scalars: &[u8], n8s: usize) -> Result<Vec<u8>, EngineError> {
    let mut tm = self.curve.manager()?;
    msm::multi_exp::<E, G>(&mut tm, self.id, bases, scalars, n8s)
  }

  /// Forward transform of an affine element sequence (coefficients →
  /// evaluations).
  pub fn fft(&self, buff: &[u8]) -> Result<Vec<u8>, EngineError> {
    let mut tm = self.curve.manager()?;
    fft::fft(&mut tm, self.id, buff, false)
  }

  /// Inverse transform of an affine element sequence (evaluations →
  /// coefficients).
  pub fn ifft(&self, buff: &[u8]) -> Result<Vec<u8>, EngineError> {
    let mut tm = self.curve.manager()?;
    fft::fft(&mut tm, self.id, buff, true)
  }

  /// Standalone local butterfly stages over equal chunks; lets a caller
  /// interleave extra per-element work between transform stages.
  pub fn fft_mix(&self, buff: &[u8]) -> Result<Vec<u8>, EngineError> {
    let mut tm = self.curve.manager()?;
    fft::fft_mix(&mut tm, self.id, buff)
  }

  /// Standalone cross-buffer butterfly merge with a running twiddle starting
  /// at `first` (internal form) and advancing by `inc` per element.
  pub fn fft_join(
    &self,
    buff_a: &[u8],
    buff_b: &[u8],
    first: &[u8],
    inc: &[u8],
  ) -> Result<(Vec<u8>, Vec<u8>), EngineError> {
    let mut tm = self.curve.manager()?;
    fft::fft_join(&mut tm, self.id, buff_a, buff_b, first, inc)
  }

  /// Standalone elementwise scalar multiplication by a fixed internal-form
  /// factor.
  pub fn fft_final(&self, buff: &[u8], factor: &[u8]) -> Result<Vec<u8>, EngineError> {
    let mut tm = self.curve.manager()?;
    fft::fft_final(&mut tm, self.id, buff, factor)
  }

  /// Derives `n` deterministic pseudorandom affine bases from a label.
  pub fn from_label(&self, label: &[u8], n: usize) -> Result<Vec<u8>, EngineError> {
    let mut shake = Shake256::default();
    shake.update(label);
    let mut reader = shake.finalize_xof();
    let mut seeds = vec![[0u8; 32]; n];
    for seed in seeds.iter_mut() {
      reader
        .read_exact(seed)
        .map_err(|_| EngineError::InternalError)?;
    }
    let points: Vec<G::Affine> = seeds
      .par_chunks(64)
      .flat_map(|chunk| {
        let hash = G::hash_to_curve("from_uniform_bytes");
        chunk
          .iter()
          .map(|seed| hash(seed).to_affine())
          .collect::<Vec<_>>()
      })
      .collect();
    let mut out = Vec::with_capacity(n * self.sizes().aff);
    for p in &points {
      out.extend(codec::to_bytes(p)?);
    }
    Ok(out)
  }
}
