//! Live-updatable config handles.
//!
//! Quota limits can be retuned by an operator while the limiter is serving
//! traffic, so the limiter reads them through a `DynamicConfig` instead of a
//! plain field. Default backend is `ArcSwap` for lock-free reads on the hot
//! admission path; disabling the `arc-swap` feature falls back to `RwLock`.

use std::sync::Arc;

#[cfg(not(feature = "arc-swap"))]
use std::sync::RwLock;

#[cfg(feature = "arc-swap")]
use arc_swap::ArcSwap;

/// Shared handle with cheap snapshot reads and whole-value replacement.
#[derive(Debug)]
pub struct DynamicConfig<T> {
    #[cfg(feature = "arc-swap")]
    inner: Arc<ArcSwap<T>>,
    #[cfg(not(feature = "arc-swap"))]
    inner: Arc<RwLock<T>>,
}

impl<T> Clone for DynamicConfig<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T> DynamicConfig<T> {
    pub fn new(value: T) -> Self {
        #[cfg(feature = "arc-swap")]
        {
            Self { inner: Arc::new(ArcSwap::from_pointee(value)) }
        }
        #[cfg(not(feature = "arc-swap"))]
        {
            Self { inner: Arc::new(RwLock::new(value)) }
        }
    }

    /// Snapshot the current value.
    #[cfg(feature = "arc-swap")]
    pub fn get(&self) -> Arc<T> {
        self.inner.load_full()
    }

    /// Snapshot the current value (clones under the RwLock backend).
    #[cfg(not(feature = "arc-swap"))]
    pub fn get(&self) -> Arc<T>
    where
        T: Clone,
    {
        Arc::new(self.inner.read().unwrap().clone())
    }

    /// Replace the value entirely. Readers mid-decision keep the snapshot
    /// they already took; the next decision sees the new value.
    pub fn set(&self, value: T) {
        #[cfg(feature = "arc-swap")]
        {
            self.inner.store(Arc::new(value));
        }
        #[cfg(not(feature = "arc-swap"))]
        {
            *self.inner.write().unwrap() = value;
        }
    }
}
