//! The task protocol: ordered command lists interpreted inside a compute
//! instance.
//!
//! A task is the unit of dispatch. Its commands address arena regions through
//! small integer variable slots, never raw addresses, and invoke exported
//! functions from a closed [`Opcode`] set; "data describes the call", which
//! keeps tasks cheap to move across worker channels. A task is stateless:
//! the arena pointer of the executing instance is restored to its pre-task
//! value after the command list runs.
use serde::{Deserialize, Serialize};

/// Index of a task-local variable slot holding an allocated region.
pub type VarId = u32;

/// Index of an output slot filled by a [`Command::Get`].
pub type OutId = u32;

/// Elementwise field operations exported by a compute instance.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum FieldOp {
  /// `r = a + b`
  Add,
  /// `r = a - b`
  Sub,
  /// `r = a * b`
  Mul,
  /// `r = a^2`
  Square,
  /// `r = -a`
  Neg,
  /// `r = a^-1`; fails on zero
  Inverse,
  /// `r = sqrt(a)`; fails on a non-residue
  Sqrt,
  /// `r = a^e` for a little-endian exponent buffer
  Exp,
}

/// Curve-group operations exported by a compute instance.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum GroupOp {
  /// `r = a + b` (projective)
  Add,
  /// `r = a - b` (projective)
  Sub,
  /// `r = 2a` (projective)
  Double,
  /// `r = -a` (projective)
  Neg,
  /// `r = s·p` for an internal-form scalar
  ScalarMul,
  /// projective → affine
  ToAffine,
  /// affine → projective
  ToProjective,
  /// projective sequence → affine sequence (batched inversion)
  BatchToAffine,
  /// affine sequence → projective sequence
  BatchToProjective,
  /// one bit-window pass of a multi-exponentiation
  MultiExpChunk,
  /// full in-place transform of a projective sequence
  Fft,
  /// local butterfly stages of one chunk
  FftMix,
  /// one cross-chunk butterfly merge with a running twiddle
  FftJoin,
  /// elementwise scalar multiplication by a fixed factor
  FftFinal,
}

/// Which of the engine's two point groups an opcode targets.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum GroupId {
  /// first pairing group
  G1,
  /// second pairing group
  G2,
}

/// The closed set of functions callable from a task.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Opcode {
  /// scalar-field operation
  Scalar(FieldOp),
  /// target-field operation
  Target(FieldOp),
  /// curve-group operation
  Group(GroupId, GroupOp),
}

/// A call parameter: a pointer into a variable slot, or a literal value.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Param {
  /// resolves to the address of `var` plus `offset` bytes
  Var {
    /// variable slot
    var: VarId,
    /// byte offset into the slot's region
    offset: usize,
  },
  /// literal value passed through unchanged
  Value(u64),
}

impl Param {
  /// Pointer to the start of a variable slot.
  pub fn var(var: VarId) -> Self {
    Param::Var { var, offset: 0 }
  }
}

/// One interpreter command.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Command {
  /// bump-allocate `len` bytes and remember the region under `var`
  Alloc {
    /// destination variable slot
    var: VarId,
    /// bytes to allocate
    len: usize,
  },
  /// allocate and copy `bytes` in
  AllocSet {
    /// destination variable slot
    var: VarId,
    /// bytes copied into the fresh region
    bytes: Vec<u8>,
  },
  /// copy `bytes` into an already-allocated slot
  Set {
    /// target variable slot
    var: VarId,
    /// bytes copied in
    bytes: Vec<u8>,
  },
  /// invoke an exported function
  Call {
    /// function to invoke
    op: Opcode,
    /// call parameters
    params: Vec<Param>,
  },
  /// snapshot `len` bytes from `var` into output slot `out`
  Get {
    /// output slot
    out: OutId,
    /// source variable slot
    var: VarId,
    /// bytes to copy out
    len: usize,
  },
}

/// An ordered command list executed atomically on one instance.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Task {
  cmds: Vec<Command>,
  next_var: VarId,
  next_out: OutId,
}

impl Task {
  /// Creates an empty task.
  pub fn new() -> Self {
    Self::default()
  }

  /// Appends an `Alloc` command; returns the fresh variable slot.
  pub fn alloc(&mut self, len: usize) -> VarId {
    let var = self.fresh_var();
    self.cmds.push(Command::Alloc { var, len });
    var
  }

  /// Appends an `AllocSet` command; returns the fresh variable slot.
  pub fn alloc_set(&mut self, bytes: Vec<u8>) -> VarId {
    let var = self.fresh_var();
    self.cmds.push(Command::AllocSet { var, bytes });
    var
  }

  /// Appends a `Set` command targeting an existing slot.
  pub fn set(&mut self, var: VarId, bytes: Vec<u8>) {
    self.cmds.push(Command::Set { var, bytes });
  }

  /// Appends a `Call` command.
  pub fn call(&mut self, op: Opcode, params: Vec<Param>) {
    self.cmds.push(Command::Call { op, params });
  }

  /// Appends a `Get` command; returns the output slot it fills.
  pub fn get(&mut self, var: VarId, len: usize) -> OutId {
    let out = self.next_out;
    self.next_out += 1;
    self.cmds.push(Command::Get { out, var, len });
    out
  }

  /// The recorded command list.
  pub fn commands(&self) -> &[Command] {
    &self.cmds
  }

  /// Number of output slots the task fills.
  pub fn outputs(&self) -> usize {
    self.next_out as usize
  }

  fn fresh_var(&mut self) -> VarId {
    let var = self.next_var;
    self.next_var += 1;
    var
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn builder_numbers_slots_in_order() {
    let mut task = Task::new();
    let a = task.alloc_set(vec![1, 2, 3]);
    let b = task.alloc(8);
    task.call(Opcode::Scalar(FieldOp::Add), vec![Param::var(a), Param::var(b)]);
    let out = task.get(b, 8);
    assert_eq!((a, b, out), (0, 1, 0));
    assert_eq!(task.commands().len(), 4);
    assert_eq!(task.outputs(), 1);
  }
}
