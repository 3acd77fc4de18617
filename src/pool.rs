use std::ops::{Deref, DerefMut};
use std::sync::{Mutex, PoisonError};

/// A pool of reusable scratch values. Values are handed out in no
/// particular order and go back to the pool when their guard is dropped.
#[derive(Debug, Default)]
pub struct WorkspacePool<T> {
  items: Mutex<Vec<T>>,
}

impl<T> WorkspacePool<T> {
  pub fn new() -> Self {
    Self {
      items: Mutex::new(Vec::new()),
    }
  }

  /// Takes a pooled value, or creates one with `create` when the pool is empty.
  pub fn acquire_or(&self, create: impl FnOnce() -> T) -> Pooled<'_, T> {
    let item = self.items.lock().unwrap_or_else(PoisonError::into_inner).pop();
    Pooled {
      pool: self,
      item: Some(item.unwrap_or_else(create)),
    }
  }

  /// Number of idle values.
  pub fn idle(&self) -> usize {
    self.items.lock().unwrap_or_else(PoisonError::into_inner).len()
  }

  fn release(&self, item: T) {
    self.items.lock().unwrap_or_else(PoisonError::into_inner).push(item);
  }
}

/// A value checked out of a [`WorkspacePool`].
pub struct Pooled<'a, T> {
  pool: &'a WorkspacePool<T>,
  // only `None` while being dropped
  item: Option<T>,
}

impl<T> Deref for Pooled<'_, T> {
  type Target = T;

  fn deref(&self) -> &T {
    match &self.item {
      Some(item) => item,
      None => unreachable!("pooled value used after release"),
    }
  }
}

impl<T> DerefMut for Pooled<'_, T> {
  fn deref_mut(&mut self) -> &mut T {
    match &mut self.item {
      Some(item) => item,
      None => unreachable!("pooled value used after release"),
    }
  }
}

impl<T> Drop for Pooled<'_, T> {
  fn drop(&mut self) {
    if let Some(item) = self.item.take() {
      self.pool.release(item);
    }
  }
}
