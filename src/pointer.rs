use alloc::alloc::handle_alloc_error;
use core::{
    alloc::{AllocError, Layout},
    error::Error,
    fmt,
    hash::{Hash, Hasher},
    marker::PhantomData,
    mem,
    ops::Deref,
    panic::{RefUnwindSafe, UnwindSafe},
    ptr::{self, NonNull},
};

#[cfg(feature = "pinned-init")]
use pinned_init::Init;

use crate::sync::ControlBlock;

/// A shared pointer whose reference count lives in the same allocation as the
/// value.
///
/// Cloning an `IntrusivePtr` aliases the same allocation and bumps its count;
/// dropping one releases a count, and the handle that releases the last one
/// destroys the value before returning. A pointer may also be *empty*, owning
/// nothing at all, which is what [`IntrusivePtr::null`], [`Default`] and
/// [`IntrusivePtr::take`] produce.
///
/// Dereferencing an empty pointer through [`Deref`] panics; use
/// [`IntrusivePtr::get`] or [`IntrusivePtr::try_get`] for a checked access.
///
/// Like [`Arc`](alloc::sync::Arc), the value is only reachable through shared
/// references while other handles exist. Put a `Cell`, `RefCell` or `Mutex` in
/// `T` to mutate it through any alias.
///
/// # Examples
///
/// ```rust
/// use core::cell::RefCell;
/// use tracked_ptr::IntrusivePtr;
///
/// let a = IntrusivePtr::new(RefCell::new(String::from("Hello")));
/// let b = a.clone();
/// assert_eq!(IntrusivePtr::count(&a), 2);
///
/// *a.borrow_mut() += " World";
/// assert_eq!(*b.borrow(), "Hello World");
/// ```
pub struct IntrusivePtr<T> {
    block: Option<NonNull<ControlBlock<T>>>,
    marker: PhantomData<ControlBlock<T>>,
}

unsafe impl<T: Send + Sync> Send for IntrusivePtr<T> {}

unsafe impl<T: Send + Sync> Sync for IntrusivePtr<T> {}

impl<T: RefUnwindSafe> UnwindSafe for IntrusivePtr<T> {}

impl<T> Unpin for IntrusivePtr<T> {}

#[cold]
#[track_caller]
pub(crate) fn null_dereference() -> ! {
    panic!("{}", crate::Error::NullDereference)
}

impl<T> IntrusivePtr<T> {
    /// Constructs an empty pointer.
    pub const fn null() -> Self {
        IntrusivePtr {
            block: None,
            marker: PhantomData,
        }
    }

    fn from_block(block: NonNull<ControlBlock<T>>) -> Self {
        IntrusivePtr {
            block: Some(block),
            marker: PhantomData,
        }
    }

    /// Moves `value` onto the heap behind a fresh pointer with a count of 1.
    ///
    /// Allocation failure is handled by [`handle_alloc_error`], as with
    /// `Box::new`. See [`try_new`](Self::try_new) for the fallible version.
    pub fn new(value: T) -> Self {
        match Self::try_new(value) {
            Ok(this) => this,
            Err(AllocError) => handle_alloc_error(Layout::new::<ControlBlock<T>>()),
        }
    }

    /// Moves `value` onto the heap, returning an error if the allocation
    /// fails.
    pub fn try_new(value: T) -> Result<Self, AllocError> {
        ControlBlock::try_new(value).map(Self::from_block)
    }

    /// Allocates the storage first and then builds the value with `f`.
    ///
    /// Whatever `f` returns as an error is passed back unchanged, and no
    /// allocation outlives the failed call.
    ///
    /// # Examples
    ///
    /// ```rust
    /// #![feature(allocator_api)]
    /// use core::alloc::AllocError;
    /// use tracked_ptr::IntrusivePtr;
    ///
    /// #[derive(Debug, PartialEq)]
    /// enum ParseError {
    ///     OutOfMemory,
    ///     NotANumber,
    /// }
    ///
    /// impl From<AllocError> for ParseError {
    ///     fn from(_: AllocError) -> Self {
    ///         ParseError::OutOfMemory
    ///     }
    /// }
    ///
    /// let parse = |s: &str| s.parse::<u32>().map_err(|_| ParseError::NotANumber);
    ///
    /// let parsed = IntrusivePtr::try_new_with(|| parse("17"));
    /// assert_eq!(*parsed.unwrap(), 17);
    ///
    /// let failed = IntrusivePtr::try_new_with(|| parse("c"));
    /// assert_eq!(failed.unwrap_err(), ParseError::NotANumber);
    /// ```
    pub fn try_new_with<E>(f: impl FnOnce() -> Result<T, E>) -> Result<Self, E>
    where
        E: From<AllocError>,
    {
        // SAFETY: The slot is written exactly when `f` succeeds.
        unsafe {
            Self::try_new_in_place(|slot: *mut T| -> Result<(), E> {
                slot.write(f()?);
                Ok(())
            })
        }
    }

    /// Initializes the value in place with an initializer of [`Init`].
    ///
    /// The storage is allocated before `init` runs; if `init` fails, the
    /// storage is released and its error returned.
    #[cfg(feature = "pinned-init")]
    pub fn try_init<E>(init: impl Init<T, E>) -> Result<Self, E>
    where
        E: From<AllocError>,
    {
        // SAFETY: `Init` leaves the slot initialized on success and holding
        // nothing that needs dropping on failure.
        unsafe { Self::try_new_in_place(|slot| init.__init(slot)) }
    }

    /// # Safety
    ///
    /// See [`ControlBlock::try_new_in_place`].
    pub(crate) unsafe fn try_new_in_place<E>(
        init: impl FnOnce(*mut T) -> Result<(), E>,
    ) -> Result<Self, E>
    where
        E: From<AllocError>,
    {
        // SAFETY: The contract is forwarded to the caller.
        let block = unsafe { ControlBlock::try_new_in_place(init) }?;
        Ok(Self::from_block(block))
    }

    pub fn is_null(this: &Self) -> bool {
        this.block.is_none()
    }

    /// Returns the value, or `None` if the pointer is empty.
    pub fn get(this: &Self) -> Option<&T> {
        // SAFETY: A non-empty handle keeps its block alive.
        this.block.map(|block| unsafe { &(*block.as_ptr()).value })
    }

    /// Returns the value, or [`Error::NullDereference`](crate::Error) if the
    /// pointer is empty.
    pub fn try_get(this: &Self) -> Result<&T, crate::Error> {
        Self::get(this).ok_or(crate::Error::NullDereference)
    }

    /// Returns a mutable reference to the value if no other pointer aliases
    /// it.
    pub fn get_mut(this: &mut Self) -> Option<&mut T> {
        let block = this.block?;
        // SAFETY: A non-empty handle keeps its block alive, and the uniqueness
        // check below rules out any other handle reading the value.
        unsafe {
            if block.as_ref().count.is_unique() {
                Some(&mut (*block.as_ptr()).value)
            } else {
                None
            }
        }
    }

    /// Returns a mutable reference to the value without checking for
    /// aliases.
    ///
    /// # Safety
    ///
    /// No other reference to the value, obtained through any pointer aliasing
    /// the same allocation, may be used while the returned one is alive.
    ///
    /// # Panics
    ///
    /// Panics if the pointer is empty.
    #[track_caller]
    pub unsafe fn get_mut_unchecked(this: &mut Self) -> &mut T {
        let Some(block) = this.block else {
            null_dereference()
        };
        // SAFETY: The exclusiveness is guaranteed by the caller.
        unsafe { &mut (*block.as_ptr()).value }
    }

    /// Moves the ownership out of `this`, leaving it empty.
    ///
    /// The count of the aliased allocation is unchanged.
    pub fn take(this: &mut Self) -> Self {
        mem::take(this)
    }

    /// Releases the ownership held by `this`, leaving it empty.
    ///
    /// If `this` held the last count, the value is destroyed before `reset`
    /// returns.
    pub fn reset(this: &mut Self) {
        drop(Self::take(this));
    }

    /// The number of pointers aliasing the same allocation, or 0 if `this` is
    /// empty.
    pub fn count(this: &Self) -> usize {
        match this.block {
            // SAFETY: A non-empty handle keeps its block alive.
            Some(block) => unsafe { block.as_ref() }.count.get(),
            None => 0,
        }
    }

    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        a.block == b.block
    }

    /// Returns a raw pointer to the value, or a null pointer if `this` is
    /// empty.
    pub fn as_ptr(this: &Self) -> *const T {
        match this.block {
            // SAFETY: A non-empty handle keeps its block alive.
            Some(block) => unsafe { ptr::addr_of!((*block.as_ptr()).value) },
            None => ptr::null(),
        }
    }

    /// Consumes the pointer without releasing its count, returning a raw
    /// pointer to the value.
    ///
    /// The caller becomes responsible for exactly one release, which is done
    /// by turning the raw pointer back with [`from_raw`](Self::from_raw) and
    /// dropping the result.
    pub fn into_raw(this: Self) -> *const T {
        let ptr = Self::as_ptr(&this);
        mem::forget(this);
        ptr
    }

    /// Detaches the ownership held by `this` as a raw pointer, leaving `this`
    /// empty.
    ///
    /// See [`into_raw`](Self::into_raw) for the obligation this hands over.
    pub fn release(this: &mut Self) -> *const T {
        Self::into_raw(Self::take(this))
    }

    /// Reconstructs a pointer from a raw pointer produced by
    /// [`into_raw`](Self::into_raw) or [`release`](Self::release).
    ///
    /// A null `ptr` yields an empty pointer.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or come from `into_raw`/`release` on an
    /// `IntrusivePtr<T>` of the same `T`, and each such raw pointer may be
    /// turned back at most once.
    pub unsafe fn from_raw(ptr: *const T) -> Self {
        if ptr.is_null() {
            return Self::null();
        }
        let offset = mem::offset_of!(ControlBlock<T>, value);
        // SAFETY: `ptr` points at the `value` field of a live block, so
        // stepping back by its offset lands on the block itself.
        unsafe {
            let block = ptr.byte_sub(offset).cast::<ControlBlock<T>>().cast_mut();
            Self::from_block(NonNull::new_unchecked(block))
        }
    }

    /// Moves the value out if `this` is the only pointer to it.
    ///
    /// Otherwise, including when `this` is empty, the pointer is handed back
    /// untouched.
    pub fn try_unwrap(this: Self) -> Result<T, Self> {
        let Some(block) = this.block else {
            return Err(this);
        };
        // SAFETY: A non-empty handle keeps its block alive.
        if !unsafe { block.as_ref() }.count.try_claim() {
            return Err(this);
        }
        mem::forget(this);
        // SAFETY: The count was claimed above, so nothing else references the
        // block.
        Ok(unsafe { ControlBlock::into_value(block) })
    }
}

impl<T> Deref for IntrusivePtr<T> {
    type Target = T;

    #[track_caller]
    fn deref(&self) -> &T {
        match Self::get(self) {
            Some(value) => value,
            None => null_dereference(),
        }
    }
}

impl<T> Clone for IntrusivePtr<T> {
    fn clone(&self) -> Self {
        if let Some(block) = self.block {
            // SAFETY: A non-empty handle keeps its block alive.
            unsafe { block.as_ref() }.count.increment();
        }
        IntrusivePtr {
            block: self.block,
            marker: PhantomData,
        }
    }
}

impl<T> Drop for IntrusivePtr<T> {
    fn drop(&mut self) {
        let Some(block) = self.block.take() else {
            return;
        };
        // SAFETY: This handle held one count on `block` until now.
        if unsafe { block.as_ref() }.count.decrement() {
            // SAFETY: The count just reached zero on our decrement.
            unsafe { ControlBlock::destroy(block) };
        }
    }
}

impl<T> Default for IntrusivePtr<T> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T> From<T> for IntrusivePtr<T> {
    fn from(value: T) -> Self {
        Self::new(value)
    }
}

impl<T> AsRef<T> for IntrusivePtr<T> {
    #[track_caller]
    fn as_ref(&self) -> &T {
        self
    }
}

impl<T: PartialEq> PartialEq for IntrusivePtr<T> {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        Self::get(self) == Self::get(other)
    }
}

impl<T: Eq> Eq for IntrusivePtr<T> {}

impl<T: PartialOrd> PartialOrd for IntrusivePtr<T> {
    #[inline]
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        Self::get(self).partial_cmp(&Self::get(other))
    }
}

impl<T: Ord> Ord for IntrusivePtr<T> {
    #[inline]
    fn cmp(&self, other: &Self) -> core::cmp::Ordering {
        Self::get(self).cmp(&Self::get(other))
    }
}

impl<T: Hash> Hash for IntrusivePtr<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        Self::get(self).hash(state)
    }
}

impl<T: fmt::Display> fmt::Display for IntrusivePtr<T> {
    #[track_caller]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.deref().fmt(f)
    }
}

impl<T: fmt::Debug> fmt::Debug for IntrusivePtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match Self::get(self) {
            Some(value) => value.fmt(f),
            None => f.write_str("null"),
        }
    }
}

impl<T> fmt::Pointer for IntrusivePtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Pointer::fmt(&Self::as_ptr(self), f)
    }
}

impl<T: Error> Error for IntrusivePtr<T> {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.deref().source()
    }
}
