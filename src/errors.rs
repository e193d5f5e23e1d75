//! This module defines errors returned by the engine.
use thiserror::Error;

/// Errors returned by the compute engine.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum EngineError {
  /// returned if a point buffer is neither an affine nor a projective element sequence
  #[error("InvalidPointLength")]
  InvalidPointLength,
  /// returned if the supplied input is not of the right length
  #[error("InvalidInputLength")]
  InvalidInputLength,
  /// returned if a transform input is not a power-of-two number of elements
  #[error("NotPowerOfTwo")]
  NotPowerOfTwo,
  /// returned if a transform of 2^bits elements exceeds the two-adicity of the scalar field
  #[error("DomainTooLarge: 2^{0}")]
  DomainTooLarge(usize),
  /// returned if a sync section is opened while another one is still open
  #[error("SyncOpInProgress")]
  SyncOpInProgress,
  /// returned if a sync section is closed while none is open
  #[error("SyncOpNotActive")]
  SyncOpNotActive,
  /// returned if a direct memory helper is used outside a sync section
  #[error("SyncOpRequired")]
  SyncOpRequired,
  /// returned when a dispatched task fails inside a worker
  #[error("Task: {0}")]
  Task(#[from] TaskError),
  /// returned when a worker channel is severed before a reply arrives
  #[error("WorkerLost")]
  WorkerLost,
  /// returned for any operation on a terminated manager
  #[error("Terminated")]
  Terminated,
  /// returned when a shared handle lock was poisoned by a panicked holder
  #[error("LockPoisoned")]
  LockPoisoned,
  /// returned when the engine reaches an inconsistent internal state
  #[error("InternalError")]
  InternalError,
}

/// Errors raised by the worker-side command interpreter; carried back to the
/// coordinator in the task-completion message.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum TaskError {
  /// a command referenced a variable slot that was never defined
  #[error("BadVar: {0}")]
  BadVar(u32),
  /// a variable slot was used before being allocated
  #[error("Unallocated: {0}")]
  Unallocated(u32),
  /// pointer arithmetic escaped the allocated arena region
  #[error("OutOfRange")]
  OutOfRange,
  /// the instance arena cannot satisfy an allocation
  #[error("ArenaFull: requested {requested}, free {free}")]
  ArenaFull {
    /// bytes requested by the failing allocation
    requested: usize,
    /// bytes still available in the arena
    free: usize,
  },
  /// an opcode received the wrong parameter shape
  #[error("BadParams: {0}")]
  BadParams(&'static str),
  /// an operand failed to decode as an engine element
  #[error("BadEncoding")]
  BadEncoding,
  /// a buffer length does not match the expected element layout
  #[error("BadLayout")]
  BadLayout,
  /// inverse of zero
  #[error("DivisionByZero")]
  DivisionByZero,
  /// square root of a quadratic non-residue
  #[error("NoSquareRoot")]
  NoSquareRoot,
}
