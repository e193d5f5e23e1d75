//! Lazily-initialized per-curve engine registry with explicit teardown.
//!
//! One shared [`Curve`] handle per engine type, booted on first use and
//! keyed by the engine's type identity; [`drop_curve`] terminates the pool
//! and unregisters the handle. There is no hidden module-level state beyond
//! this map.
use crate::{
  curve::{Curve, PoolOpts},
  errors::EngineError,
  traits::PoolEngine,
};
use once_cell::sync::Lazy;
use std::{
  any::{Any, TypeId},
  collections::HashMap,
  sync::{Arc, Mutex},
};

static CURVES: Lazy<Mutex<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>> =
  Lazy::new(|| Mutex::new(HashMap::new()));

/// Returns the shared engine handle for `E`, booting it with default options
/// on first use.
pub fn get_curve<E: PoolEngine>() -> Result<Arc<Curve<E>>, EngineError> {
  get_curve_with(PoolOpts::default())
}

/// Returns the shared engine handle for `E`; `opts` apply only if this call
/// performs the first boot.
pub fn get_curve_with<E: PoolEngine>(opts: PoolOpts) -> Result<Arc<Curve<E>>, EngineError> {
  let mut map = CURVES.lock().map_err(|_| EngineError::LockPoisoned)?;
  if let Some(existing) = map.get(&TypeId::of::<E>()) {
    return existing
      .clone()
      .downcast::<Curve<E>>()
      .map_err(|_| EngineError::InternalError);
  }
  let curve = Arc::new(Curve::<E>::new(opts)?);
  map.insert(TypeId::of::<E>(), curve.clone());
  Ok(curve)
}

/// Tears the shared handle for `E` down: terminates its worker pool and
/// removes it from the registry. A later [`get_curve`] boots a fresh engine.
pub fn drop_curve<E: PoolEngine>() -> Result<(), EngineError> {
  let removed = {
    let mut map = CURVES.lock().map_err(|_| EngineError::LockPoisoned)?;
    map.remove(&TypeId::of::<E>())
  };
  if let Some(entry) = removed {
    let curve = entry
      .downcast::<Curve<E>>()
      .map_err(|_| EngineError::InternalError)?;
    curve.terminate()?;
  }
  Ok(())
}
