use alloc::boxed::Box;
use core::{
    alloc::AllocError,
    mem::MaybeUninit,
    ptr::{self, NonNull},
};

#[cfg(loom)]
use loom::sync::atomic::{self, AtomicUsize, Ordering::*};

#[cfg(not(loom))]
use core::sync::atomic::{self, AtomicUsize, Ordering::*};


const REF_COUNT_MAX: usize = (isize::MAX) as usize;
#[cfg(target_pointer_width = "64")]
const REF_COUNT_SATURATED: usize = 0xC000_0000_0000_0000;
#[cfg(target_pointer_width = "32")]
const REF_COUNT_SATURATED: usize = 0xC000_0000;

/// An intrusive reference counter.
///
/// Once the count passes `isize::MAX` it sticks at a saturated value, and the
/// block it guards is leaked instead of freed early.
#[derive(Debug)]
pub(crate) struct RefCount {
    count: AtomicUsize,
}

impl RefCount {
    /// A counter owned by exactly one handle.
    pub(crate) fn new() -> Self {
        RefCount {
            count: AtomicUsize::new(1),
        }
    }

    pub(crate) fn get(&self) -> usize {
        self.count.load(Acquire)
    }

    pub(crate) fn increment(&self) {
        let count = self.count.fetch_add(1, Relaxed);

        if count >= REF_COUNT_MAX {
            self.count.store(REF_COUNT_SATURATED, Relaxed);
        }
    }

    /// Returns `true` for the one caller that takes the count from 1 to 0.
    pub(crate) fn decrement(&self) -> bool {
        let count = self.count.fetch_sub(1, Release);

        if count >= REF_COUNT_MAX {
            self.count.store(REF_COUNT_SATURATED, Relaxed);
            false
        } else if count == 1 {
            atomic::fence(Acquire);
            true
        } else {
            false
        }
    }

    /// Checks whether the caller's handle is the only one left.
    ///
    /// The count is briefly parked at 0 so that no concurrent clone can slip
    /// in between the check and the caller's use of the answer.
    pub(crate) fn is_unique(&self) -> bool {
        if self.count.compare_exchange(1, 0, Acquire, Relaxed).is_err() {
            return false;
        }
        self.count.store(1, Release);
        true
    }

    /// Takes the count from 1 straight to 0, claiming the block for the caller.
    pub(crate) fn try_claim(&self) -> bool {
        if self.count.compare_exchange(1, 0, Relaxed, Relaxed).is_err() {
            return false;
        }
        atomic::fence(Acquire);
        true
    }
}

/// The heap allocation behind every [`IntrusivePtr`](crate::IntrusivePtr):
/// the reference count followed by the payload.
#[repr(C)]
pub(crate) struct ControlBlock<T> {
    pub(crate) count: RefCount,
    pub(crate) value: T,
}

impl<T> ControlBlock<T> {
    /// Allocates a block that owns `value` with a count of 1.
    pub(crate) fn try_new(value: T) -> Result<NonNull<Self>, AllocError> {
        let block = Box::try_new(ControlBlock {
            count: RefCount::new(),
            value,
        })?;
        Ok(NonNull::from(Box::leak(block)))
    }

    /// Allocates a block and then lets `init` write the payload in place.
    ///
    /// Storage is obtained before the payload is built, so an allocation
    /// failure never runs `init`, and a failing `init` leaves nothing behind.
    ///
    /// # Safety
    ///
    /// When `init` returns `Ok(())` it must have fully initialized the slot it
    /// was handed. When it returns `Err` the slot must hold nothing that needs
    /// dropping.
    pub(crate) unsafe fn try_new_in_place<E>(
        init: impl FnOnce(*mut T) -> Result<(), E>,
    ) -> Result<NonNull<Self>, E>
    where
        E: From<AllocError>,
    {
        let mut uninit: Box<MaybeUninit<Self>> = Box::try_new_uninit()?;
        let slot = uninit.as_mut_ptr();

        // SAFETY: `slot` points to writable storage for a whole block, and the
        // contract on `init` is forwarded to the caller.
        unsafe {
            init(ptr::addr_of_mut!((*slot).value))?;
            ptr::addr_of_mut!((*slot).count).write(RefCount::new());
        }

        // SAFETY: Both fields have been written above.
        let block = unsafe { uninit.assume_init() };
        Ok(NonNull::from(Box::leak(block)))
    }

    /// Drops the payload and frees the storage.
    ///
    /// # Safety
    ///
    /// `block` must come from one of the constructors above, and the caller
    /// must be the one that just observed the count reach zero (or otherwise
    /// own the block exclusively).
    pub(crate) unsafe fn destroy(block: NonNull<Self>) {
        // SAFETY: The block was allocated as a `Box<Self>` and no other handle
        // references it anymore.
        drop(unsafe { Box::from_raw(block.as_ptr()) });
    }

    /// Moves the payload out and frees the storage without dropping it.
    ///
    /// # Safety
    ///
    /// Same as [`destroy`](Self::destroy).
    pub(crate) unsafe fn into_value(block: NonNull<Self>) -> T {
        // SAFETY: See `destroy`.
        let block = unsafe { Box::from_raw(block.as_ptr()) };
        let ControlBlock { value, .. } = *block;
        value
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use alloc::string::String;

    use super::*;

    #[test]
    fn fresh_count_is_one() {
        let count = RefCount::new();
        assert_eq!(count.get(), 1);
        assert!(count.is_unique());
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn only_the_last_decrement_reports_zero() {
        let count = RefCount::new();
        count.increment();
        count.increment();
        assert_eq!(count.get(), 3);
        assert!(!count.is_unique());

        assert!(!count.decrement());
        assert!(!count.decrement());
        assert!(count.decrement());
        assert_eq!(count.get(), 0);
    }

    #[test]
    fn saturated_count_never_reaches_zero() {
        let count = RefCount::new();
        count.count.store(REF_COUNT_MAX, Relaxed);

        count.increment();
        assert_eq!(count.get(), REF_COUNT_SATURATED);
        assert!(!count.decrement());
        assert_eq!(count.get(), REF_COUNT_SATURATED);
    }

    #[test]
    fn claim_requires_a_single_owner() {
        let count = RefCount::new();
        count.increment();
        assert!(!count.try_claim());
        assert!(!count.decrement());
        assert!(count.try_claim());
        assert_eq!(count.get(), 0);
    }

    #[test]
    fn in_place_failure_creates_no_block() {
        let result = unsafe {
            ControlBlock::<String>::try_new_in_place(|_| Err::<(), AllocError>(AllocError))
        };
        assert!(result.is_err());
    }

    #[test]
    fn create_and_destroy() {
        let block = unsafe {
            ControlBlock::try_new_in_place(|slot: *mut String| {
                slot.write("c".repeat(17));
                Ok::<(), AllocError>(())
            })
        }
        .unwrap();

        let count = unsafe { &block.as_ref().count };
        assert_eq!(count.get(), 1);
        assert!(count.decrement());
        assert_eq!(unsafe { ControlBlock::into_value(block) }, "ccccccccccccccccc");

        let block = ControlBlock::try_new(String::from("Hello World")).unwrap();
        unsafe { ControlBlock::destroy(block) };
    }
}
