//! Free-list object pool.
//!
//! Every request needs a [`Context`](crate::Context) and, when response hooks
//! are registered, a body buffer. Both are recycled here instead of being
//! allocated per request.
//!
//! ```text
//! acquire() ──▶ Pooled<T> ──(request runs)──▶ drop ──▶ reset() ──▶ free list
//! ```
//!
//! The [`Pooled`] guard is the only way to borrow an item for a scope. Its
//! `Drop` impl resets the item and pushes it back, so release happens on every
//! exit path, unwinding included.

use std::ops::{Deref, DerefMut};

use parking_lot::Mutex;

/// Items that can be returned to a [`Pool`].
///
/// `reset` must clear every piece of per-use state. Whatever survives it is
/// visible to the next, unrelated user of the item.
pub trait Reset {
    fn reset(&mut self);
}

impl Reset for Vec<u8> {
    fn reset(&mut self) {
        self.clear();
    }
}

type Factory<T> = Box<dyn Fn() -> T + Send + Sync>;

/// A bounded free list of reusable `T`s.
pub struct Pool<T> {
    idle: Mutex<Vec<T>>,
    factory: Factory<T>,
    max_idle: usize,
}

impl<T: Reset> Pool<T> {
    /// Creates a pool that keeps at most `max_idle` released items around and
    /// builds new ones with `factory` when the free list is empty.
    pub fn new(max_idle: usize, factory: impl Fn() -> T + Send + Sync + 'static) -> Self {
        Self {
            idle: Mutex::new(Vec::new()),
            factory: Box::new(factory),
            max_idle,
        }
    }

    /// Borrows an item for the lifetime of the returned guard.
    pub fn acquire(&self) -> Pooled<'_, T> {
        Pooled { item: Some(self.get()), pool: self }
    }

    /// Takes an item out of the pool. Pair with [`Pool::put`].
    ///
    /// Use this instead of [`acquire`](Pool::acquire) when the item has to move
    /// by value, e.g. a body buffer passed through response hooks.
    pub fn get(&self) -> T {
        self.idle.lock().pop().unwrap_or_else(|| (self.factory)())
    }

    /// Resets `item` and returns it to the free list, or drops it when the
    /// pool is already holding `max_idle` items.
    pub fn put(&self, mut item: T) {
        item.reset();
        let mut idle = self.idle.lock();
        if idle.len() < self.max_idle {
            idle.push(item);
        }
    }

    /// Number of items currently waiting on the free list.
    pub fn idle(&self) -> usize {
        self.idle.lock().len()
    }
}

/// Scoped borrow of a pooled item. Dropping it resets and releases the item.
pub struct Pooled<'a, T: Reset> {
    item: Option<T>,
    pool: &'a Pool<T>,
}

impl<T: Reset> Deref for Pooled<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // `item` is only `None` inside `drop`.
        self.item.as_ref().unwrap_or_else(|| unreachable!("pooled item used after release"))
    }
}

impl<T: Reset> DerefMut for Pooled<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.item.as_mut().unwrap_or_else(|| unreachable!("pooled item used after release"))
    }
}

impl<T: Reset> Drop for Pooled<'_, T> {
    fn drop(&mut self) {
        if let Some(item) = self.item.take() {
            self.pool.put(item);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reuses_released_items() {
        let pool: Pool<Vec<u8>> = Pool::new(4, || Vec::with_capacity(16));
        let mut buf = pool.get();
        buf.extend_from_slice(b"hello");
        let cap = buf.capacity();
        pool.put(buf);

        let again = pool.get();
        assert!(again.is_empty());
        assert_eq!(again.capacity(), cap);
    }

    #[test]
    fn guard_releases_on_drop() {
        let pool: Pool<Vec<u8>> = Pool::new(4, Vec::new);
        {
            let mut buf = pool.acquire();
            buf.push(1);
            assert_eq!(pool.idle(), 0);
        }
        assert_eq!(pool.idle(), 1);
        assert!(pool.get().is_empty());
    }

    #[test]
    fn guard_releases_while_unwinding() {
        let pool: Pool<Vec<u8>> = Pool::new(4, Vec::new);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let mut buf = pool.acquire();
            buf.push(7);
            panic!("boom");
        }));
        assert!(result.is_err());
        assert_eq!(pool.idle(), 1);
    }

    #[test]
    fn drops_items_beyond_max_idle() {
        let pool: Pool<Vec<u8>> = Pool::new(1, Vec::new);
        pool.put(Vec::new());
        pool.put(Vec::new());
        assert_eq!(pool.idle(), 1);
    }
}
