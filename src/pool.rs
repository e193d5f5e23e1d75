//! Worker-pool task dispatch.
//!
//! A [`ThreadManager`] owns either a fixed pool of worker threads, each with
//! a private compute instance fed over its own channel, or a single
//! synchronous in-process instance; call sites are agnostic to which mode is
//! active. The pending queue and the busy flags are touched only by the
//! coordinator holding the manager, so no locking is needed around them.
//! Completion messages carry an explicit result-or-error, and the manager
//! surfaces worker failures as [`EngineError::Task`].
use crate::{
  arena::{BuffHandle, Mark},
  curve::{Concurrency, EngineConsts, PoolOpts},
  errors::{EngineError, TaskError},
  instance::{Arg, Instance},
  task::{Opcode, Task},
  traits::PoolEngine,
};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::mpsc::{Receiver, Sender, channel};
use std::thread::JoinHandle;
use tracing::debug;

/// Control records sent to a worker thread.
enum WorkerMsg<E: PoolEngine> {
  /// bootstraps the worker's memory and compute instance
  Init {
    arena_size: usize,
    consts: Arc<EngineConsts<E>>,
  },
  /// runs one task
  Run { id: u64, task: Task },
  /// shuts the worker down
  Terminate,
}

/// Completion message sent back over the shared reply channel.
struct Reply {
  worker: usize,
  id: u64,
  result: Result<Vec<Vec<u8>>, TaskError>,
}

struct Worker<E: PoolEngine> {
  tx: Sender<WorkerMsg<E>>,
  busy: bool,
  handle: Option<JoinHandle<()>>,
}

enum Mode<E: PoolEngine> {
  Single,
  Pool {
    workers: Vec<Worker<E>>,
    pending: VecDeque<(u64, Task)>,
    done_rx: Receiver<Reply>,
  },
  Terminated,
}

/// Handle to a queued task's eventual outputs; redeem with
/// [`ThreadManager::resolve`].
#[must_use]
#[derive(Debug)]
pub struct Pending {
  id: u64,
}

/// Dispatches tasks to a pool of workers, or runs them inline in
/// single-thread mode.
pub struct ThreadManager<E: PoolEngine> {
  mode: Mode<E>,
  own: Instance<E>,
  consts: Arc<EngineConsts<E>>,
  opts: PoolOpts,
  sync_mark: Option<Mark>,
  next_id: u64,
  dispatched: u64,
  results: HashMap<u64, Result<Vec<Vec<u8>>, TaskError>>,
}

impl<E: PoolEngine> ThreadManager<E> {
  /// Spawns the configured workers (bootstrapping each with an `Init`
  /// record) and sets up the manager's own instance for sequential calls.
  pub fn new(opts: PoolOpts, consts: Arc<EngineConsts<E>>) -> Result<Self, EngineError> {
    let own = Instance::new(opts.arena_size, consts.clone());
    let mode = match opts.concurrency {
      Concurrency::Single => Mode::Single,
      Concurrency::Pool(n) => {
        let n = n.max(1);
        let (done_tx, done_rx) = channel();
        let mut workers = Vec::with_capacity(n);
        for idx in 0..n {
          let worker = spawn_worker::<E>(idx, done_tx.clone())?;
          worker
            .tx
            .send(WorkerMsg::Init {
              arena_size: opts.arena_size,
              consts: consts.clone(),
            })
            .map_err(|_| EngineError::WorkerLost)?;
          workers.push(worker);
        }
        debug!(workers = n, "pool bootstrapped");
        Mode::Pool {
          workers,
          pending: VecDeque::new(),
          done_rx,
        }
      }
    };
    Ok(Self {
      mode,
      own,
      consts,
      opts,
      sync_mark: None,
      next_id: 0,
      dispatched: 0,
      results: HashMap::new(),
    })
  }

  /// Queues a task. In pool mode the task is appended to the pending queue
  /// and dispatch is triggered; in single-thread mode it is executed
  /// synchronously and the returned handle is already resolved.
  pub fn queue_action(&mut self, task: Task) -> Result<Pending, EngineError> {
    if matches!(self.mode, Mode::Terminated) {
      return Err(EngineError::Terminated);
    }
    let id = self.next_id;
    self.next_id += 1;
    self.dispatched += 1;
    if matches!(self.mode, Mode::Single) {
      let result = self.own.run_task(&task);
      self.results.insert(id, result);
      return Ok(Pending { id });
    }
    if let Mode::Pool { pending, .. } = &mut self.mode {
      pending.push_back((id, task));
    }
    self.process_works()?;
    Ok(Pending { id })
  }

  /// Blocks until the outputs of `pending` are available, freeing workers
  /// and re-dispatching queued entries as replies come in.
  pub fn resolve(&mut self, pending: Pending) -> Result<Vec<Vec<u8>>, EngineError> {
    loop {
      if let Some(result) = self.results.remove(&pending.id) {
        return result.map_err(EngineError::from);
      }
      let reply = match &self.mode {
        Mode::Pool { done_rx, .. } => done_rx.recv().map_err(|_| EngineError::WorkerLost)?,
        Mode::Single => return Err(EngineError::InternalError),
        Mode::Terminated => return Err(EngineError::Terminated),
      };
      if let Mode::Pool { workers, .. } = &mut self.mode {
        workers
          .get_mut(reply.worker)
          .ok_or(EngineError::InternalError)?
          .busy = false;
      }
      self.results.insert(reply.id, reply.result);
      self.process_works()?;
    }
  }

  /// Queues a batch and resolves every task, returning outputs in task
  /// order; partial results are combined by index, never by completion order.
  pub fn run_batch(&mut self, tasks: Vec<Task>) -> Result<Vec<Vec<Vec<u8>>>, EngineError> {
    let pendings = tasks
      .into_iter()
      .map(|t| self.queue_action(t))
      .collect::<Result<Vec<_>, _>>()?;
    pendings.into_iter().map(|p| self.resolve(p)).collect()
  }

  /// For every idle worker, pops the next queued entry and posts it.
  pub(crate) fn process_works(&mut self) -> Result<(), EngineError> {
    loop {
      let next = {
        let Mode::Pool { workers, pending, .. } = &mut self.mode else {
          return Ok(());
        };
        if pending.is_empty() {
          return Ok(());
        }
        let Some(idx) = workers.iter().position(|w| !w.busy) else {
          return Ok(());
        };
        let Some((id, task)) = pending.pop_front() else {
          return Ok(());
        };
        (idx, id, task)
      };
      self.post_action(next.0, next.1, next.2)?;
    }
  }

  /// Marks the worker busy and sends it the task.
  pub(crate) fn post_action(&mut self, worker: usize, id: u64, task: Task) -> Result<(), EngineError> {
    let Mode::Pool { workers, .. } = &mut self.mode else {
      return Err(EngineError::InternalError);
    };
    let w = workers.get_mut(worker).ok_or(EngineError::InternalError)?;
    w.busy = true;
    w.tx
      .send(WorkerMsg::Run { id, task })
      .map_err(|_| EngineError::WorkerLost)
  }

  /// Opens a sync section over the manager's own instance, saving its arena
  /// pointer. Fails loudly if one is already open.
  pub fn start_sync_op(&mut self) -> Result<(), EngineError> {
    if matches!(self.mode, Mode::Terminated) {
      return Err(EngineError::Terminated);
    }
    if self.sync_mark.is_some() {
      return Err(EngineError::SyncOpInProgress);
    }
    self.sync_mark = Some(self.own.arena().save());
    Ok(())
  }

  /// Closes the current sync section, restoring the saved arena pointer.
  pub fn end_sync_op(&mut self) -> Result<(), EngineError> {
    let mark = self.sync_mark.take().ok_or(EngineError::SyncOpNotActive)?;
    self.own.arena_mut().restore(mark);
    Ok(())
  }

  fn require_sync(&self) -> Result<(), EngineError> {
    if matches!(self.mode, Mode::Terminated) {
      return Err(EngineError::Terminated);
    }
    if self.sync_mark.is_none() {
      return Err(EngineError::SyncOpRequired);
    }
    Ok(())
  }

  /// Bump-allocates on the manager's own instance; sync section required.
  pub fn alloc(&mut self, len: usize) -> Result<BuffHandle, EngineError> {
    self.require_sync()?;
    self.own.arena_mut().alloc(len).map_err(EngineError::from)
  }

  /// Allocates and copies `bytes` in; sync section required.
  pub fn alloc_buff(&mut self, bytes: &[u8]) -> Result<BuffHandle, EngineError> {
    let h = self.alloc(bytes.len())?;
    self.own.arena_mut().write(h, bytes)?;
    Ok(h)
  }

  /// Copies a region of the manager's own instance out; sync section
  /// required.
  pub fn get_buff(&self, h: BuffHandle) -> Result<Vec<u8>, EngineError> {
    self.require_sync()?;
    self.own.arena().read(h).map_err(EngineError::from)
  }

  /// Overwrites an allocated region; sync section required.
  pub fn set_buff(&mut self, h: BuffHandle, bytes: &[u8]) -> Result<(), EngineError> {
    self.require_sync()?;
    self.own.arena_mut().write(h, bytes).map_err(EngineError::from)
  }

  /// Invokes one exported function directly on the manager's own instance;
  /// sync section required.
  pub fn sync_call(&mut self, op: Opcode, args: &[SyncArg]) -> Result<(), EngineError> {
    self.require_sync()?;
    let resolved: Vec<Arg> = args
      .iter()
      .map(|a| match a {
        SyncArg::Buff(h) => Arg::Ptr(h.off()),
        SyncArg::Value(v) => Arg::Value(*v),
      })
      .collect();
    self.own.exec(op, &resolved).map_err(EngineError::from)
  }

  /// Sends a terminate record to every worker and returns only after all of
  /// them have been signalled and joined. Idempotent; later operations fail
  /// with [`EngineError::Terminated`].
  pub fn terminate(&mut self) -> Result<(), EngineError> {
    let mode = std::mem::replace(&mut self.mode, Mode::Terminated);
    if let Mode::Pool { workers, .. } = mode {
      for w in &workers {
        let _ = w.tx.send(WorkerMsg::Terminate);
      }
      for mut w in workers {
        if let Some(handle) = w.handle.take() {
          let _ = handle.join();
        }
      }
      debug!("pool terminated");
    }
    Ok(())
  }

  /// Number of workers (zero in single-thread mode or after termination).
  pub fn num_workers(&self) -> usize {
    match &self.mode {
      Mode::Pool { workers, .. } => workers.len(),
      _ => 0,
    }
  }

  /// Number of workers currently idle.
  pub fn idle_workers(&self) -> usize {
    match &self.mode {
      Mode::Pool { workers, .. } => workers.iter().filter(|w| !w.busy).count(),
      _ => 0,
    }
  }

  /// Number of tasks accepted by the queue since bootstrap.
  pub fn dispatched(&self) -> u64 {
    self.dispatched
  }

  pub(crate) fn opts(&self) -> &PoolOpts {
    &self.opts
  }

  pub(crate) fn consts(&self) -> &Arc<EngineConsts<E>> {
    &self.consts
  }
}

impl<E: PoolEngine> Drop for ThreadManager<E> {
  fn drop(&mut self) {
    let _ = self.terminate();
  }
}

/// Argument to [`ThreadManager::sync_call`].
#[derive(Clone, Copy, Debug)]
pub enum SyncArg {
  /// pointer to the start of an allocated region
  Buff(BuffHandle),
  /// literal value
  Value(u64),
}

fn spawn_worker<E: PoolEngine>(idx: usize, done: Sender<Reply>) -> Result<Worker<E>, EngineError> {
  let (tx, rx) = channel::<WorkerMsg<E>>();
  let handle = std::thread::Builder::new()
    .name(format!("curvepool-worker-{idx}"))
    .spawn(move || worker_main(idx, rx, done))
    .map_err(|_| EngineError::InternalError)?;
  Ok(Worker {
    tx,
    busy: false,
    handle: Some(handle),
  })
}

fn worker_main<E: PoolEngine>(idx: usize, rx: Receiver<WorkerMsg<E>>, done: Sender<Reply>) {
  let mut instance: Option<Instance<E>> = None;
  while let Ok(msg) = rx.recv() {
    match msg {
      WorkerMsg::Init { arena_size, consts } => {
        instance = Some(Instance::new(arena_size, consts));
      }
      WorkerMsg::Run { id, task } => {
        let result = match instance.as_mut() {
          Some(inst) => inst.run_task(&task),
          None => Err(TaskError::BadParams("worker not initialized")),
        };
        if done.send(Reply { worker: idx, id, result }).is_err() {
          break;
        }
      }
      WorkerMsg::Terminate => break,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::provider::Bn256Engine;

  fn opts(concurrency: Concurrency) -> PoolOpts {
    PoolOpts {
      concurrency,
      arena_size: 1 << 16,
      local_fft_bits: 3,
    }
  }

  fn manager(concurrency: Concurrency) -> ThreadManager<Bn256Engine> {
    let consts = Arc::new(EngineConsts::<Bn256Engine>::new().unwrap());
    ThreadManager::new(opts(concurrency), consts).unwrap()
  }

  fn echo_task(byte: u8) -> Task {
    let mut task = Task::new();
    let v = task.alloc_set(vec![byte; 8]);
    task.get(v, 8);
    task
  }

  #[test]
  fn pool_and_single_modes_agree() {
    for concurrency in [Concurrency::Pool(2), Concurrency::Single] {
      let mut tm = manager(concurrency);
      let outs = tm
        .run_batch((0u8..8).map(echo_task).collect())
        .unwrap();
      for (i, out) in outs.iter().enumerate() {
        assert_eq!(out[0], vec![i as u8; 8]);
      }
    }
  }

  #[test]
  fn no_task_starves_while_a_worker_is_idle() {
    let mut tm = manager(Concurrency::Pool(2));
    // queue far more tasks than workers; every one must complete and the
    // pool must drain back to fully idle
    let outs = tm.run_batch((0u8..32).map(echo_task).collect()).unwrap();
    assert_eq!(outs.len(), 32);
    assert_eq!(tm.idle_workers(), tm.num_workers());
    assert_eq!(tm.dispatched(), 32);
  }

  #[test]
  fn results_arrive_in_task_order() {
    let mut tm = manager(Concurrency::Pool(4));
    let outs = tm.run_batch((0u8..16).map(echo_task).collect()).unwrap();
    for (i, out) in outs.iter().enumerate() {
      assert_eq!(out[0][0], i as u8);
    }
  }

  #[test]
  fn nested_sync_sections_are_rejected() {
    let mut tm = manager(Concurrency::Single);
    tm.start_sync_op().unwrap();
    assert_eq!(tm.start_sync_op(), Err(EngineError::SyncOpInProgress));
    tm.end_sync_op().unwrap();
    assert_eq!(tm.end_sync_op(), Err(EngineError::SyncOpNotActive));
  }

  #[test]
  fn memory_helpers_require_a_sync_section() {
    let mut tm = manager(Concurrency::Single);
    assert_eq!(tm.alloc(8), Err(EngineError::SyncOpRequired));
    tm.start_sync_op().unwrap();
    let h = tm.alloc_buff(&[1, 2, 3, 4]).unwrap();
    assert_eq!(tm.get_buff(h).unwrap(), vec![1, 2, 3, 4]);
    tm.set_buff(h, &[9, 9, 9, 9]).unwrap();
    assert_eq!(tm.get_buff(h).unwrap(), vec![9, 9, 9, 9]);
    tm.end_sync_op().unwrap();
  }

  #[test]
  fn sync_section_restores_the_arena_pointer() {
    let mut tm = manager(Concurrency::Single);
    tm.start_sync_op().unwrap();
    let h = tm.alloc_buff(&[1u8; 32]).unwrap();
    tm.end_sync_op().unwrap();
    tm.start_sync_op().unwrap();
    let h2 = tm.alloc(32).unwrap();
    tm.end_sync_op().unwrap();
    assert_eq!(h, h2);
  }

  #[test]
  fn terminate_signals_every_worker_and_settles_after_all_join() {
    let mut tm = manager(Concurrency::Pool(3));
    assert_eq!(tm.num_workers(), 3);
    tm.terminate().unwrap();
    assert_eq!(tm.num_workers(), 0);
    assert!(matches!(
      tm.queue_action(echo_task(0)),
      Err(EngineError::Terminated)
    ));
    // idempotent
    tm.terminate().unwrap();
  }

  #[test]
  fn worker_errors_are_structured() {
    let mut tm = manager(Concurrency::Pool(1));
    let mut task = Task::new();
    task.set(0, vec![1]);
    let p = tm.queue_action(task).unwrap();
    assert_eq!(
      tm.resolve(p),
      Err(EngineError::Task(TaskError::BadVar(0)))
    );
  }
}
