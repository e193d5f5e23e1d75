//! A compute instance: one linear memory plus the closed exported-function
//! set, generic over the engine.
//!
//! One instance lives inside each worker (and one belongs to the manager for
//! sequential calls). All operands enter and leave through the instance's
//! arena; the interpreter resolves task variable slots to arena regions and
//! restores the allocation pointer once the command list has run.
use crate::{
  arena::{Arena, BuffHandle},
  codec,
  curve::{EngineConsts, GroupSizes},
  errors::TaskError,
  fft, msm,
  task::{Command, FieldOp, GroupId, GroupOp, Opcode, Param, Task, VarId},
  traits::{PoolEngine, PoolGroup},
};
use ff::Field;
use halo2curves::group::{Curve as _, Group, cofactor::CofactorCurveAffine};
use serde::{Serialize, de::DeserializeOwned};
use std::sync::Arc;

/// A resolved call argument: an absolute arena offset or a literal value.
#[derive(Clone, Copy, Debug)]
pub(crate) enum Arg {
  Ptr(usize),
  Value(u64),
}

fn ptr(args: &[Arg], i: usize) -> Result<usize, TaskError> {
  match args.get(i) {
    Some(Arg::Ptr(p)) => Ok(*p),
    _ => Err(TaskError::BadParams("expected pointer")),
  }
}

fn val(args: &[Arg], i: usize) -> Result<u64, TaskError> {
  match args.get(i) {
    Some(Arg::Value(v)) => Ok(*v),
    _ => Err(TaskError::BadParams("expected literal")),
  }
}

pub(crate) struct Instance<E: PoolEngine> {
  arena: Arena,
  consts: Arc<EngineConsts<E>>,
}

impl<E: PoolEngine> Instance<E> {
  pub(crate) fn new(arena_size: usize, consts: Arc<EngineConsts<E>>) -> Self {
    Self {
      arena: Arena::new(arena_size),
      consts,
    }
  }

  pub(crate) fn arena(&self) -> &Arena {
    &self.arena
  }

  pub(crate) fn arena_mut(&mut self) -> &mut Arena {
    &mut self.arena
  }

  /// Runs one task; the arena pointer is restored afterwards, so no state
  /// persists between tasks.
  pub(crate) fn run_task(&mut self, task: &Task) -> Result<Vec<Vec<u8>>, TaskError> {
    let mark = self.arena.save();
    let out = self.run_commands(task);
    self.arena.restore(mark);
    out
  }

  fn run_commands(&mut self, task: &Task) -> Result<Vec<Vec<u8>>, TaskError> {
    let mut vars: Vec<Option<BuffHandle>> = Vec::new();
    let mut outs: Vec<Vec<u8>> = vec![Vec::new(); task.outputs()];
    for cmd in task.commands() {
      match cmd {
        Command::Alloc { var, len } => {
          let h = self.arena.alloc(*len)?;
          set_var(&mut vars, *var, h);
        }
        Command::AllocSet { var, bytes } => {
          let h = self.arena.alloc(bytes.len())?;
          self.arena.write(h, bytes)?;
          set_var(&mut vars, *var, h);
        }
        Command::Set { var, bytes } => {
          let h = get_var(&vars, *var)?;
          self.arena.write(h, bytes)?;
        }
        Command::Call { op, params } => {
          let args = resolve_params(&vars, params)?;
          self.exec(*op, &args)?;
        }
        Command::Get { out, var, len } => {
          let h = get_var(&vars, *var)?;
          if *len > h.len() {
            return Err(TaskError::OutOfRange);
          }
          let bytes = self.arena.get(h.off(), *len)?.to_vec();
          let slot = outs
            .get_mut(*out as usize)
            .ok_or(TaskError::BadParams("output slot"))?;
          *slot = bytes;
        }
      }
    }
    Ok(outs)
  }

  /// Invokes one exported function against the arena.
  pub(crate) fn exec(&mut self, op: Opcode, args: &[Arg]) -> Result<(), TaskError> {
    let n8s = self.consts.n8s;
    let n8t = self.consts.n8t;
    let g1 = self.consts.g1;
    let g2 = self.consts.g2;
    match op {
      Opcode::Scalar(f) => self.field_op::<E::Scalar>(f, args, n8s),
      Opcode::Target(f) => self.field_op::<E::Target>(f, args, n8t),
      Opcode::Group(GroupId::G1, g) => self.group_op::<E::G1>(g, args, g1),
      Opcode::Group(GroupId::G2, g) => self.group_op::<E::G2>(g, args, g2),
    }
  }

  fn field_op<F>(&mut self, op: FieldOp, args: &[Arg], n8: usize) -> Result<(), TaskError>
  where
    F: Field + Serialize + DeserializeOwned,
  {
    match op {
      FieldOp::Add => {
        let a: F = self.load(ptr(args, 0)?, n8)?;
        let b: F = self.load(ptr(args, 1)?, n8)?;
        self.store(ptr(args, 2)?, n8, &(a + b))
      }
      FieldOp::Sub => {
        let a: F = self.load(ptr(args, 0)?, n8)?;
        let b: F = self.load(ptr(args, 1)?, n8)?;
        self.store(ptr(args, 2)?, n8, &(a - b))
      }
      FieldOp::Mul => {
        let a: F = self.load(ptr(args, 0)?, n8)?;
        let b: F = self.load(ptr(args, 1)?, n8)?;
        self.store(ptr(args, 2)?, n8, &(a * b))
      }
      FieldOp::Square => {
        let a: F = self.load(ptr(args, 0)?, n8)?;
        self.store(ptr(args, 1)?, n8, &a.square())
      }
      FieldOp::Neg => {
        let a: F = self.load(ptr(args, 0)?, n8)?;
        self.store(ptr(args, 1)?, n8, &(-a))
      }
      FieldOp::Inverse => {
        let a: F = self.load(ptr(args, 0)?, n8)?;
        let inv = Option::<F>::from(a.invert()).ok_or(TaskError::DivisionByZero)?;
        self.store(ptr(args, 1)?, n8, &inv)
      }
      FieldOp::Sqrt => {
        let a: F = self.load(ptr(args, 0)?, n8)?;
        let root = Option::<F>::from(a.sqrt()).ok_or(TaskError::NoSquareRoot)?;
        self.store(ptr(args, 1)?, n8, &root)
      }
      FieldOp::Exp => {
        let a: F = self.load(ptr(args, 0)?, n8)?;
        let p_exp = ptr(args, 1)?;
        let e_len = val(args, 2)? as usize;
        let limbs = {
          let bytes = self.arena.get(p_exp, e_len)?;
          let mut limbs = vec![0u64; e_len.div_ceil(8)];
          for (i, b) in bytes.iter().enumerate() {
            limbs[i / 8] |= u64::from(*b) << (8 * (i % 8));
          }
          limbs
        };
        self.store(ptr(args, 3)?, n8, &a.pow_vartime(&limbs))
      }
    }
  }

  fn group_op<G>(&mut self, op: GroupOp, args: &[Arg], sizes: GroupSizes) -> Result<(), TaskError>
  where
    E: PoolEngine<Scalar = <G as Group>::Scalar>,
    G: PoolGroup,
  {
    let n8s = self.consts.n8s;
    let consts = Arc::clone(&self.consts);
    match op {
      GroupOp::Add => {
        let a: G = self.load(ptr(args, 0)?, sizes.proj)?;
        let b: G = self.load(ptr(args, 1)?, sizes.proj)?;
        self.store(ptr(args, 2)?, sizes.proj, &(a + b))
      }
      GroupOp::Sub => {
        let a: G = self.load(ptr(args, 0)?, sizes.proj)?;
        let b: G = self.load(ptr(args, 1)?, sizes.proj)?;
        self.store(ptr(args, 2)?, sizes.proj, &(a - b))
      }
      GroupOp::Double => {
        let a: G = self.load(ptr(args, 0)?, sizes.proj)?;
        self.store(ptr(args, 1)?, sizes.proj, &a.double())
      }
      GroupOp::Neg => {
        let a: G = self.load(ptr(args, 0)?, sizes.proj)?;
        self.store(ptr(args, 1)?, sizes.proj, &(-a))
      }
      GroupOp::ScalarMul => {
        let p: G = self.load(ptr(args, 0)?, sizes.proj)?;
        let s: G::Scalar = self.load(ptr(args, 1)?, n8s)?;
        self.store(ptr(args, 2)?, sizes.proj, &(p * s))
      }
      GroupOp::ToAffine => {
        let p: G = self.load(ptr(args, 0)?, sizes.proj)?;
        self.store(ptr(args, 1)?, sizes.aff, &p.to_affine())
      }
      GroupOp::ToProjective => {
        let a: G::Affine = self.load(ptr(args, 0)?, sizes.aff)?;
        self.store(ptr(args, 1)?, sizes.proj, &a.to_curve())
      }
      GroupOp::BatchToAffine => {
        let p_in = ptr(args, 0)?;
        let p_out = ptr(args, 1)?;
        let n = val(args, 2)? as usize;
        let input: Vec<G> = self.load_array(p_in, n, sizes.proj)?;
        let mut affs = vec![G::Affine::identity(); n];
        G::batch_normalize(&input, &mut affs);
        self.store_array(p_out, sizes.aff, &affs)
      }
      GroupOp::BatchToProjective => {
        let p_in = ptr(args, 0)?;
        let p_out = ptr(args, 1)?;
        let n = val(args, 2)? as usize;
        let input: Vec<G::Affine> = self.load_array(p_in, n, sizes.aff)?;
        let projs: Vec<G> = input.iter().map(CofactorCurveAffine::to_curve).collect();
        self.store_array(p_out, sizes.proj, &projs)
      }
      GroupOp::MultiExpChunk => {
        let p_bases = ptr(args, 0)?;
        let p_scalars = ptr(args, 1)?;
        let n8_scalar = val(args, 2)? as usize;
        let n = val(args, 3)? as usize;
        let bit_off = val(args, 4)? as usize;
        let width = val(args, 5)? as usize;
        let p_res = ptr(args, 6)?;
        if n8_scalar == 0 || width == 0 || width > 31 {
          return Err(TaskError::BadParams("multiexp window"));
        }
        let bases: Vec<G::Affine> = self.load_array(p_bases, n, sizes.aff)?;
        let total = n.checked_mul(n8_scalar).ok_or(TaskError::OutOfRange)?;
        let partial = {
          let scalars = self.arena.get(p_scalars, total)?;
          msm::window_partial::<G>(&bases, scalars, n8_scalar, bit_off, width)
        };
        self.store(p_res, sizes.proj, &partial)
      }
      GroupOp::Fft => {
        let p = ptr(args, 0)?;
        let n = val(args, 1)? as usize;
        let inverse = val(args, 2)? != 0;
        let mut a: Vec<G> = self.load_array(p, n, sizes.proj)?;
        fft::permute_bit_reverse(&mut a)?;
        fft::butterflies(&mut a, &consts.roots)?;
        if inverse {
          let inv_n = Option::<G::Scalar>::from(G::Scalar::from(n as u64).invert())
            .ok_or(TaskError::DivisionByZero)?;
          fft::scale(&mut a, inv_n);
          a[1..].reverse();
        }
        self.store_array(p, sizes.proj, &a)
      }
      GroupOp::FftMix => {
        let p = ptr(args, 0)?;
        let n = val(args, 1)? as usize;
        let mut a: Vec<G> = self.load_array(p, n, sizes.proj)?;
        fft::butterflies(&mut a, &consts.roots)?;
        self.store_array(p, sizes.proj, &a)
      }
      GroupOp::FftJoin => {
        let p_a = ptr(args, 0)?;
        let p_b = ptr(args, 1)?;
        let n = val(args, 2)? as usize;
        let first: G::Scalar = self.load(ptr(args, 3)?, n8s)?;
        let inc: G::Scalar = self.load(ptr(args, 4)?, n8s)?;
        let mut a: Vec<G> = self.load_array(p_a, n, sizes.proj)?;
        let mut b: Vec<G> = self.load_array(p_b, n, sizes.proj)?;
        fft::join_pair(&mut a, &mut b, first, inc);
        self.store_array(p_a, sizes.proj, &a)?;
        self.store_array(p_b, sizes.proj, &b)
      }
      GroupOp::FftFinal => {
        let p = ptr(args, 0)?;
        let n = val(args, 1)? as usize;
        let factor: G::Scalar = self.load(ptr(args, 2)?, n8s)?;
        let mut a: Vec<G> = self.load_array(p, n, sizes.proj)?;
        fft::scale(&mut a, factor);
        self.store_array(p, sizes.proj, &a)
      }
    }
  }

  fn load<T: DeserializeOwned>(&self, off: usize, n8: usize) -> Result<T, TaskError> {
    codec::from_bytes(self.arena.get(off, n8)?)
  }

  fn store<T: Serialize>(&mut self, off: usize, n8: usize, v: &T) -> Result<(), TaskError> {
    codec::write_into(v, self.arena.get_mut(off, n8)?)
  }

  fn load_array<T: DeserializeOwned>(
    &self,
    off: usize,
    n: usize,
    n8: usize,
  ) -> Result<Vec<T>, TaskError> {
    let total = n.checked_mul(n8).ok_or(TaskError::OutOfRange)?;
    self.arena.get(off, total)?;
    (0..n).map(|i| self.load(off + i * n8, n8)).collect()
  }

  fn store_array<T: Serialize>(&mut self, off: usize, n8: usize, items: &[T]) -> Result<(), TaskError> {
    for (i, v) in items.iter().enumerate() {
      self.store(off + i * n8, n8, v)?;
    }
    Ok(())
  }
}

fn set_var(vars: &mut Vec<Option<BuffHandle>>, var: VarId, h: BuffHandle) {
  let idx = var as usize;
  if idx >= vars.len() {
    vars.resize(idx + 1, None);
  }
  vars[idx] = Some(h);
}

fn get_var(vars: &[Option<BuffHandle>], var: VarId) -> Result<BuffHandle, TaskError> {
  vars
    .get(var as usize)
    .ok_or(TaskError::BadVar(var))?
    .ok_or(TaskError::Unallocated(var))
}

fn resolve_params(vars: &[Option<BuffHandle>], params: &[Param]) -> Result<Vec<Arg>, TaskError> {
  params
    .iter()
    .map(|p| match p {
      Param::Var { var, offset } => {
        let h = get_var(vars, *var)?;
        if *offset > h.len() {
          return Err(TaskError::OutOfRange);
        }
        Ok(Arg::Ptr(h.off() + offset))
      }
      Param::Value(v) => Ok(Arg::Value(*v)),
    })
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::provider::Bn256Engine;
  use crate::task::Task;
  use ff::PrimeField;
  use halo2curves::bn256::Fr;

  fn instance() -> Instance<Bn256Engine> {
    let consts = Arc::new(EngineConsts::<Bn256Engine>::new().unwrap());
    Instance::new(1 << 16, consts)
  }

  fn fr_bytes(v: u64) -> Vec<u8> {
    codec::to_bytes(&Fr::from(v)).unwrap()
  }

  #[test]
  fn alloc_set_get_roundtrip() {
    let mut inst = instance();
    let mut task = Task::new();
    let v = task.alloc_set(vec![7u8; 16]);
    task.get(v, 16);
    let outs = inst.run_task(&task).unwrap();
    assert_eq!(outs, vec![vec![7u8; 16]]);
    // the arena pointer is restored between tasks
    assert_eq!(inst.arena().free(), 1 << 16);
  }

  #[test]
  fn scalar_add_matches_field_arithmetic() {
    let mut inst = instance();
    let n8 = inst.consts.n8s;
    let mut task = Task::new();
    let a = task.alloc_set(fr_bytes(41));
    let b = task.alloc_set(fr_bytes(1));
    let r = task.alloc(n8);
    task.call(
      Opcode::Scalar(FieldOp::Add),
      vec![Param::var(a), Param::var(b), Param::var(r)],
    );
    task.get(r, n8);
    let outs = inst.run_task(&task).unwrap();
    assert_eq!(outs[0], fr_bytes(42));
  }

  #[test]
  fn exp_matches_pow() {
    let mut inst = instance();
    let n8 = inst.consts.n8s;
    let mut task = Task::new();
    let a = task.alloc_set(fr_bytes(3));
    let e = task.alloc_set(vec![5u8]); // canonical little-endian exponent
    let r = task.alloc(n8);
    task.call(
      Opcode::Scalar(FieldOp::Exp),
      vec![Param::var(a), Param::var(e), Param::Value(1), Param::var(r)],
    );
    task.get(r, n8);
    let outs = inst.run_task(&task).unwrap();
    assert_eq!(outs[0], fr_bytes(243));
  }

  #[test]
  fn unallocated_var_is_reported() {
    let mut inst = instance();
    let mut task = Task::new();
    task.set(3, vec![1, 2, 3]);
    assert_eq!(inst.run_task(&task), Err(TaskError::BadVar(3)));
  }

  #[test]
  fn inverse_of_zero_is_reported() {
    let mut inst = instance();
    let n8 = inst.consts.n8s;
    let mut task = Task::new();
    let a = task.alloc_set(codec::to_bytes(&Fr::ZERO).unwrap());
    let r = task.alloc(n8);
    task.call(
      Opcode::Scalar(FieldOp::Inverse),
      vec![Param::var(a), Param::var(r)],
    );
    assert_eq!(inst.run_task(&task), Err(TaskError::DivisionByZero));
  }

  #[test]
  fn literal_where_pointer_expected_is_reported() {
    let mut inst = instance();
    let mut task = Task::new();
    task.call(Opcode::Scalar(FieldOp::Add), vec![Param::Value(1)]);
    assert!(matches!(
      inst.run_task(&task),
      Err(TaskError::BadParams(_))
    ));
  }

  #[test]
  fn internal_scalar_encoding_is_fixed_width() {
    let v = Fr::from(123456789u64);
    let internal = codec::to_bytes(&v).unwrap();
    assert_eq!(internal.len(), v.to_repr().as_ref().len());
  }
}
