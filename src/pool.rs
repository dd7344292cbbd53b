//! Pool of execution units for reuse.

use crate::bridge::HostCalls;
use crate::interpreter::ExecutionUnit;
use crate::memory::SharedMemory;
use crate::state::CancelToken;

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

/// Execution unit originating from a pool.
/// Will be recycled back into the pool when dropped.
pub struct PooledUnit {
    pool: UnitPool,
    unit: Option<ExecutionUnit>,
}

impl Drop for PooledUnit {
    fn drop(&mut self) {
        self.pool
            .recycle(self.unit.take().expect("unit recycled already"));
    }
}

impl Deref for PooledUnit {
    type Target = ExecutionUnit;

    fn deref(&self) -> &ExecutionUnit {
        self.unit.as_ref().expect("unit recycled already")
    }
}

impl DerefMut for PooledUnit {
    fn deref_mut(&mut self) -> &mut ExecutionUnit {
        self.unit.as_mut().expect("unit recycled already")
    }
}

impl fmt::Debug for PooledUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledUnit")
            .field("pool", &"..")
            .field("unit", &self.unit)
            .finish()
    }
}

struct PoolInner {
    memory: SharedMemory,
    host: Arc<dyn HostCalls>,
    cancel: CancelToken,
    units: Mutex<Vec<ExecutionUnit>>,
}

/// LIFO pool of execution units for one guest module.
///
/// Units share the module's memory image and exported-module dictionary but
/// own their register files, so a host callback that re-enters guest code
/// through a second checkout never disturbs its caller's registers. The LIFO
/// discipline keeps the hot unit's allocations warm.
#[derive(Clone)]
pub struct UnitPool {
    inner: Arc<PoolInner>,
}

impl UnitPool {
    /// Pool units running against `memory` with `host` as the callback table.
    pub fn new(memory: SharedMemory, host: Arc<dyn HostCalls>) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                memory,
                host,
                cancel: CancelToken::new(),
                units: Mutex::new(Vec::new()),
            }),
        }
    }

    /// The cancellation token every pooled unit consults.
    pub fn cancel_token(&self) -> CancelToken {
        self.inner.cancel.clone()
    }

    /// The shared memory image the pool's units run against.
    pub fn memory(&self) -> &SharedMemory {
        &self.inner.memory
    }

    /// Check a unit out of the pool, creating one if none is idle.
    pub fn checkout(&self) -> PooledUnit {
        let recycled = self
            .inner
            .units
            .lock()
            .expect("poisoned")
            .pop();
        let mut unit = recycled.unwrap_or_else(|| {
            ExecutionUnit::new(self.inner.memory.clone(), Arc::clone(&self.inner.host))
        });
        unit.set_cancel_token(self.inner.cancel.clone());
        unit.attach_pool(self.clone());
        PooledUnit {
            pool: self.clone(),
            unit: Some(unit),
        }
    }

    /// Recycle a unit back into the pool.
    fn recycle(&self, mut unit: ExecutionUnit) {
        unit.detach_pool();
        unit.registers_mut().reset();
        self.inner.units.lock().expect("poisoned").push(unit);
    }
}

impl fmt::Debug for UnitPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.units.lock() {
            Ok(units) => write!(f, "UnitPool {{ idle: {} }}", units.len()),
            Err(_) => write!(f, "UnitPool {{ idle: [poisoned] }}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::NoHost;
    use crate::memory::SegmentedMemory;

    #[test]
    fn checkout_is_lifo_and_recycles() {
        let pool = UnitPool::new(SharedMemory::new(SegmentedMemory::new()), Arc::new(NoHost));
        let mut unit = pool.checkout();
        unit.registers_mut().set_ax(0x1234);
        drop(unit);

        // The recycled unit comes back with a reset register file.
        let unit = pool.checkout();
        assert_eq!(unit.registers().ax(), 0);
        assert_eq!(format!("{pool:?}"), "UnitPool { idle: 0 }");
        drop(unit);
        assert_eq!(format!("{pool:?}"), "UnitPool { idle: 1 }");
    }

    #[test]
    fn nested_checkouts_are_distinct_units() {
        let pool = UnitPool::new(SharedMemory::new(SegmentedMemory::new()), Arc::new(NoHost));
        let mut outer = pool.checkout();
        outer.registers_mut().set_ax(1);
        let mut inner = pool.checkout();
        inner.registers_mut().set_ax(2);
        assert_eq!(outer.registers().ax(), 1);
    }
}
