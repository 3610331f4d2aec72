use core::{
    alloc::AllocError,
    error::Error as StdError,
    fmt,
    hash::{Hash, Hasher},
    ops::Deref,
    panic::Location,
    ptr,
};

#[cfg(feature = "pinned-init")]
use pinned_init::Init;

use crate::{
    pointer::null_dereference,
    registry::{RegistrationToken, Registry, TokenId},
    Error, IntrusivePtr,
};

/// The payload of a tracked allocation, stored next to its registration.
struct Registered<T> {
    token: RegistrationToken,
    value: T,
}

impl<T> Drop for Registered<T> {
    fn drop(&mut self) {
        // Deregister before `value` is dropped, so the registry never lists a
        // handle whose payload is already gone.
        self.token.release();
    }
}

/// An [`IntrusivePtr`] whose allocation is recorded in a [`Registry`] for as
/// long as it lives.
///
/// One registration belongs to one allocation: clones share it, and the drop
/// that destroys the allocation deregisters it, before the value itself is
/// dropped.
///
/// # Examples
///
/// ```rust
/// use tracked_ptr::{Registry, RegistryConfig, TrackedPtr};
///
/// let registry = Registry::new(RegistryConfig::default());
/// let hello = TrackedPtr::new_in(String::from("Hello World"), &registry).unwrap();
/// let copy = hello.clone();
/// assert_eq!(registry.live_count(), 1);
///
/// drop(hello);
/// assert_eq!(*copy, "Hello World");
/// drop(copy);
/// assert_eq!(registry.live_count(), 0);
/// ```
pub struct TrackedPtr<T> {
    inner: IntrusivePtr<Registered<T>>,
}

impl<T> TrackedPtr<T> {
    /// Constructs an empty pointer, which is not registered anywhere.
    pub const fn null() -> Self {
        TrackedPtr {
            inner: IntrusivePtr::null(),
        }
    }

    /// Moves `value` onto the heap and registers it in `registry`.
    #[track_caller]
    pub fn new_in(value: T, registry: &Registry) -> Result<Self, Error> {
        let location = Location::caller();
        // SAFETY: The value slot is written unconditionally.
        unsafe {
            Self::emplace(registry, location, |slot| {
                slot.write(value);
                Ok(())
            })
        }
    }

    /// Allocates the storage, builds the value with `f`, and registers it in
    /// `registry`.
    ///
    /// If `f` fails, its error is returned unchanged and nothing is
    /// registered.
    #[track_caller]
    pub fn try_new_with_in<E>(
        f: impl FnOnce() -> Result<T, E>,
        registry: &Registry,
    ) -> Result<Self, E>
    where
        E: From<AllocError> + From<Error>,
    {
        let location = Location::caller();
        // SAFETY: The slot is written exactly when `f` succeeds.
        unsafe {
            Self::emplace(registry, location, |slot: *mut T| -> Result<(), E> {
                slot.write(f()?);
                Ok(())
            })
        }
    }

    /// Initializes the value in place with `init` and registers it in
    /// `registry`.
    #[cfg(feature = "pinned-init")]
    #[track_caller]
    pub fn try_init_in<E>(init: impl Init<T, E>, registry: &Registry) -> Result<Self, E>
    where
        E: From<AllocError> + From<Error>,
    {
        let location = Location::caller();
        // SAFETY: `Init` leaves the slot initialized on success and holding
        // nothing that needs dropping on failure.
        unsafe { Self::emplace(registry, location, |slot| init.__init(slot)) }
    }

    /// Allocates, initializes the value, then registers, in that order.
    ///
    /// # Safety
    ///
    /// On success `init` must have fully initialized the slot; on failure the
    /// slot must hold nothing that needs dropping.
    unsafe fn emplace<E>(
        registry: &Registry,
        location: &'static Location<'static>,
        init: impl FnOnce(*mut T) -> Result<(), E>,
    ) -> Result<Self, E>
    where
        E: From<AllocError> + From<Error>,
    {
        let inner = unsafe {
            IntrusivePtr::try_new_in_place(|slot: *mut Registered<T>| -> Result<(), E> {
                let value = ptr::addr_of_mut!((*slot).value);
                init(value)?;
                match registry.register_at::<T>(location) {
                    Ok(token) => {
                        ptr::addr_of_mut!((*slot).token).write(token);
                        Ok(())
                    }
                    Err(err) => {
                        ptr::drop_in_place(value);
                        Err(err.into())
                    }
                }
            })
        };
        inner.map(|inner| TrackedPtr { inner })
    }

    pub fn is_null(this: &Self) -> bool {
        IntrusivePtr::is_null(&this.inner)
    }

    pub fn get(this: &Self) -> Option<&T> {
        IntrusivePtr::get(&this.inner).map(|registered| &registered.value)
    }

    pub fn try_get(this: &Self) -> Result<&T, Error> {
        Self::get(this).ok_or(Error::NullDereference)
    }

    /// Returns a mutable reference to the value if no other pointer aliases
    /// it.
    pub fn get_mut(this: &mut Self) -> Option<&mut T> {
        IntrusivePtr::get_mut(&mut this.inner).map(|registered| &mut registered.value)
    }

    /// The id of this allocation's registration.
    ///
    /// `None` for an empty pointer, or for one created by a finalized
    /// registry that ignores late registrations.
    pub fn token_id(this: &Self) -> Option<TokenId> {
        IntrusivePtr::get(&this.inner).and_then(|registered| registered.token.id())
    }

    /// Moves the ownership out of `this`, leaving it empty. The registration
    /// moves along with it.
    pub fn take(this: &mut Self) -> Self {
        TrackedPtr {
            inner: IntrusivePtr::take(&mut this.inner),
        }
    }

    /// Releases the ownership held by `this`, leaving it empty.
    ///
    /// If that was the last pointer to the allocation, it is deregistered
    /// and then destroyed before `reset` returns.
    pub fn reset(this: &mut Self) {
        IntrusivePtr::reset(&mut this.inner);
    }

    pub fn count(this: &Self) -> usize {
        IntrusivePtr::count(&this.inner)
    }

    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        IntrusivePtr::ptr_eq(&a.inner, &b.inner)
    }
}

/// Moves `value` onto the heap and registers it in the global registry.
///
/// # Examples
///
/// ```rust
/// use tracked_ptr::{make_tracked, Registry};
///
/// let before = Registry::global().live_count();
/// let c = make_tracked("c".repeat(17)).unwrap();
/// assert_eq!(Registry::global().live_count(), before + 1);
/// assert_eq!(*c, "ccccccccccccccccc");
/// ```
#[track_caller]
pub fn make_tracked<T>(value: T) -> Result<TrackedPtr<T>, Error> {
    TrackedPtr::new_in(value, Registry::global())
}

/// Builds the value with `f` and registers it in the global registry.
#[track_caller]
pub fn make_tracked_with<T, E>(f: impl FnOnce() -> Result<T, E>) -> Result<TrackedPtr<T>, E>
where
    E: From<AllocError> + From<Error>,
{
    TrackedPtr::try_new_with_in(f, Registry::global())
}

/// Initializes the value in place with `init` and registers it in the global
/// registry.
#[cfg(feature = "pinned-init")]
#[track_caller]
pub fn try_make_tracked<T, E>(init: impl Init<T, E>) -> Result<TrackedPtr<T>, E>
where
    E: From<AllocError> + From<Error>,
{
    TrackedPtr::try_init_in(init, Registry::global())
}

impl<T> Deref for TrackedPtr<T> {
    type Target = T;

    #[track_caller]
    fn deref(&self) -> &T {
        match Self::get(self) {
            Some(value) => value,
            None => null_dereference(),
        }
    }
}

impl<T> Clone for TrackedPtr<T> {
    fn clone(&self) -> Self {
        TrackedPtr {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Default for TrackedPtr<T> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T> AsRef<T> for TrackedPtr<T> {
    #[track_caller]
    fn as_ref(&self) -> &T {
        self
    }
}

impl<T: PartialEq> PartialEq for TrackedPtr<T> {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        Self::get(self) == Self::get(other)
    }
}

impl<T: Eq> Eq for TrackedPtr<T> {}

impl<T: PartialOrd> PartialOrd for TrackedPtr<T> {
    #[inline]
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        Self::get(self).partial_cmp(&Self::get(other))
    }
}

impl<T: Ord> Ord for TrackedPtr<T> {
    #[inline]
    fn cmp(&self, other: &Self) -> core::cmp::Ordering {
        Self::get(self).cmp(&Self::get(other))
    }
}

impl<T: Hash> Hash for TrackedPtr<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        Self::get(self).hash(state)
    }
}

impl<T: fmt::Display> fmt::Display for TrackedPtr<T> {
    #[track_caller]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.deref().fmt(f)
    }
}

impl<T: fmt::Debug> fmt::Debug for TrackedPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match Self::get(self) {
            Some(value) => value.fmt(f),
            None => f.write_str("null"),
        }
    }
}

impl<T> fmt::Pointer for TrackedPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ptr = Self::get(self).map_or(ptr::null(), |value| value as *const T);
        fmt::Pointer::fmt(&ptr, f)
    }
}

impl<T: StdError> StdError for TrackedPtr<T> {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.deref().source()
    }
}
