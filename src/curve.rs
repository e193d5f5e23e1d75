//! Per-curve engine handle: worker pool, precomputed constants, façades.
use crate::{
  codec,
  errors::EngineError,
  facade::{FieldFacade, GroupFacade, TargetFacade},
  pool::ThreadManager,
  start_span,
  task::{GroupId, Task},
  traits::{PoolEngine, PoolGroup},
};
use ff::{Field, PrimeField};
use halo2curves::CurveExt;
use halo2curves::group::{Group, cofactor::CofactorCurveAffine};
use num_bigint::BigUint;
use num_traits::Num;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tracing::{info, info_span};

/// Worker layout of a [`Curve`] handle.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Concurrency {
  /// fixed pool of worker threads
  Pool(usize),
  /// run the command interpreter synchronously in-process
  Single,
}

impl Default for Concurrency {
  fn default() -> Self {
    Concurrency::Pool(rayon::current_num_threads())
  }
}

/// Engine options, applied at bootstrap.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct PoolOpts {
  /// worker layout
  pub concurrency: Concurrency,
  /// linear memory per compute instance, in bytes
  pub arena_size: usize,
  /// transforms of up to `2^local_fft_bits` elements run as a single task
  pub local_fft_bits: usize,
}

impl Default for PoolOpts {
  fn default() -> Self {
    Self {
      concurrency: Concurrency::default(),
      arena_size: 1 << 24,
      local_fft_bits: 10,
    }
  }
}

/// Encoded sizes of one group's elements.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct GroupSizes {
  /// affine element bytes (`2·n8`)
  pub aff: usize,
  /// projective element bytes (`3·n8`)
  pub proj: usize,
}

/// Precomputed per-engine constants shared by every compute instance.
#[derive(Debug)]
pub struct EngineConsts<E: PoolEngine> {
  /// scalar-field element size
  pub n8s: usize,
  /// target-field element size
  pub n8t: usize,
  /// G1 element sizes
  pub g1: GroupSizes,
  /// G2 element sizes
  pub g2: GroupSizes,
  /// `roots[i]` is a primitive `2^i`-th root of unity of the scalar field
  pub roots: Vec<E::Scalar>,
}

impl<E: PoolEngine> EngineConsts<E> {
  /// Computes element sizes and the root-of-unity table.
  pub fn new() -> Result<Self, EngineError> {
    let s = E::Scalar::S as usize;
    let mut roots = vec![E::Scalar::ONE; s + 1];
    roots[s] = E::Scalar::ROOT_OF_UNITY;
    for i in (1..s).rev() {
      roots[i] = roots[i + 1].square();
    }
    Ok(Self {
      n8s: codec::byte_len(&E::Scalar::ZERO)?,
      n8t: codec::byte_len(&E::Target::ZERO)?,
      g1: group_sizes_of::<E::G1>()?,
      g2: group_sizes_of::<E::G2>()?,
      roots,
    })
  }

  /// A primitive `2^level`-th root of unity, or an error past the field's
  /// two-adicity.
  pub fn root(&self, level: usize) -> Result<E::Scalar, EngineError> {
    self
      .roots
      .get(level)
      .copied()
      .ok_or(EngineError::DomainTooLarge(level))
  }

  /// Two-adicity of the scalar field: the largest supported `log2` domain.
  pub fn two_adicity(&self) -> usize {
    self.roots.len() - 1
  }

  /// Element sizes for one of the point groups.
  pub fn group_sizes(&self, id: GroupId) -> GroupSizes {
    match id {
      GroupId::G1 => self.g1,
      GroupId::G2 => self.g2,
    }
  }
}

fn group_sizes_of<G: PoolGroup>() -> Result<GroupSizes, EngineError> {
  Ok(GroupSizes {
    aff: codec::byte_len(&G::Affine::identity())?,
    proj: codec::byte_len(&G::identity())?,
  })
}

/// A per-curve engine handle.
///
/// Created once per curve (usually through [`crate::registry`]); owns the
/// worker pool and the precomputed constants, and hands out the per-structure
/// façades. Shared freely behind an `Arc`; a mutex serializes coordinators.
pub struct Curve<E: PoolEngine> {
  tm: Mutex<ThreadManager<E>>,
  consts: Arc<EngineConsts<E>>,
}

impl<E: PoolEngine> Curve<E> {
  /// Boots the engine: precomputes the constants and spawns the worker pool.
  pub fn new(opts: PoolOpts) -> Result<Self, EngineError> {
    let (_span, t) = start_span!("engine_bootstrap", curve = E::NAME);
    let consts = Arc::new(EngineConsts::new()?);
    let tm = ThreadManager::new(opts, consts.clone())?;
    info!(
      elapsed_ms = %t.elapsed().as_millis(),
      curve = E::NAME,
      workers = tm.num_workers(),
      "engine_bootstrap"
    );
    Ok(Self {
      tm: Mutex::new(tm),
      consts,
    })
  }

  /// Curve identity.
  pub fn name(&self) -> &'static str {
    E::NAME
  }

  /// Scalar-field façade.
  pub fn scalar(&self) -> FieldFacade<'_, E> {
    FieldFacade::new(self)
  }

  /// First point-group façade.
  pub fn g1(&self) -> GroupFacade<'_, E, E::G1> {
    GroupFacade::new(self, GroupId::G1)
  }

  /// Second point-group façade.
  pub fn g2(&self) -> GroupFacade<'_, E, E::G2> {
    GroupFacade::new(self, GroupId::G2)
  }

  /// Target-field façade.
  pub fn target(&self) -> TargetFacade<'_, E> {
    TargetFacade::new(self)
  }

  /// Scalar-field modulus.
  pub fn scalar_modulus(&self) -> Result<BigUint, EngineError> {
    BigUint::from_str_radix(E::Scalar::MODULUS.trim_start_matches("0x"), 16)
      .map_err(|_| EngineError::InternalError)
  }

  /// Base-field modulus of the point groups.
  pub fn base_modulus(&self) -> Result<BigUint, EngineError> {
    let modulus = <<E::G1 as CurveExt>::Base as PrimeField>::MODULUS;
    BigUint::from_str_radix(modulus.trim_start_matches("0x"), 16)
      .map_err(|_| EngineError::InternalError)
  }

  /// Two-adicity of the scalar field.
  pub fn two_adicity(&self) -> usize {
    self.consts.two_adicity()
  }

  /// Escape hatch: submits a caller-built task through the queue and waits
  /// for its outputs.
  pub fn queue_task(&self, task: Task) -> Result<Vec<Vec<u8>>, EngineError> {
    let mut tm = self.manager()?;
    let pending = tm.queue_action(task)?;
    tm.resolve(pending)
  }

  /// Number of live workers (zero in single-thread mode or after teardown).
  pub fn num_workers(&self) -> Result<usize, EngineError> {
    Ok(self.manager()?.num_workers())
  }

  /// Terminates the pool; later operations fail with
  /// [`EngineError::Terminated`].
  pub fn terminate(&self) -> Result<(), EngineError> {
    self.manager()?.terminate()
  }

  pub(crate) fn consts(&self) -> &Arc<EngineConsts<E>> {
    &self.consts
  }

  pub(crate) fn manager(&self) -> Result<MutexGuard<'_, ThreadManager<E>>, EngineError> {
    self.tm.lock().map_err(|_| EngineError::LockPoisoned)
  }
}
