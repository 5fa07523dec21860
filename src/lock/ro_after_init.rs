use core::{cell::UnsafeCell, ops::Deref};

/// A cell that is written exactly once, during single-threaded boot, and
/// read-only for the rest of the system lifetime.
///
/// Dereferencing before `init` panics. The caller of `init` is responsible
/// for ensuring no other core can be reading the cell at that point.
pub struct RoAfterInit<T> {
    data: UnsafeCell<Option<T>>,
}

impl<T> RoAfterInit<T> {
    pub const fn uninitialized() -> Self {
        RoAfterInit {
            data: UnsafeCell::new(None),
        }
    }

    pub unsafe fn init(this: &Self, val: T) {
        *this.data.get() = Some(val);
    }

    pub fn is_initialized(this: &Self) -> bool {
        unsafe { &*this.data.get() }.is_some()
    }
}

// The contents are immutable after init, so sharing is as safe as &T
unsafe impl<T: Send> Send for RoAfterInit<T> {}
unsafe impl<T: Send + Sync> Sync for RoAfterInit<T> {}

impl<T> Deref for RoAfterInit<T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe {
            (*self.data.get())
                .as_ref()
                .expect("Attempt to use RoAfterInit before init")
        }
    }
}
