use std::ops::Deref;
use std::sync::{Arc, Weak};

/// Shared ownership of a bridged entity.
///
/// Cloning bumps an atomic counter and is valid from
/// any thread. The entity is torn down by its own
/// `Drop`, exactly once, on whichever thread releases
/// the last handle, which might well be an engine
/// worker thread or the foreground thread.
pub struct Handle<T> {
    inner: Arc<T>,
}

impl<T> Handle<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Arc::new(value),
        }
    }

    /// Construct with access to a non-owning handle
    /// of the entity being built.
    ///
    /// The weak handle cannot be upgraded until the
    /// constructor returns, which is what trampolines
    /// registered during construction rely on.
    pub fn new_cyclic<F>(f: F) -> Self
    where
        F: FnOnce(&WeakHandle<T>) -> T,
    {
        Self {
            inner: Arc::new_cyclic(|weak| {
                f(&WeakHandle {
                    inner: weak.clone(),
                })
            }),
        }
    }

    pub fn downgrade(this: &Self) -> WeakHandle<T> {
        WeakHandle {
            inner: Arc::downgrade(&this.inner),
        }
    }

    pub fn strong_count(this: &Self) -> usize {
        Arc::strong_count(&this.inner)
    }

    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        Arc::ptr_eq(&this.inner, &other.inner)
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Deref for Handle<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.inner.fmt(f)
    }
}

/// Non-owning back-reference to a bridged entity.
///
/// This is what the engine gets to hold. Once the
/// entity's teardown has begun, `upgrade` fails, so a
/// late engine callback turns into a no-op instead of
/// touching freed state.
pub struct WeakHandle<T> {
    inner: Weak<T>,
}

impl<T> WeakHandle<T> {
    pub fn upgrade(&self) -> Option<Handle<T>> {
        Some(Handle {
            inner: self.inner.upgrade()?,
        })
    }
}

impl<T> Clone for WeakHandle<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}
