//! Intrusively reference-counted pointers, with an optional registry that
//! keeps track of every live tracked allocation.
//!
//! An [`IntrusivePtr<T>`] puts its reference count in the same heap block as
//! the value it owns. Cloning the pointer aliases that block and bumps the
//! count, dropping it releases one count, and whichever drop releases the
//! last one destroys the value on the spot:
//!
//! ```rust
//! use tracked_ptr::IntrusivePtr;
//!
//! let mut vec = Vec::new();
//! vec.push(IntrusivePtr::new(String::from("Hello World")));
//! vec.push(IntrusivePtr::new("c".repeat(17)));
//!
//! let c = vec[1].clone();
//! assert_eq!(IntrusivePtr::count(&c), 2);
//!
//! // Intentional copies.
//! for ptr in vec.iter().cloned() {
//!     println!("{ptr}");
//! }
//!
//! drop(vec);
//! assert_eq!(IntrusivePtr::count(&c), 1);
//! assert_eq!(*c, "ccccccccccccccccc");
//! ```
//!
//! A pointer can also be empty. Moving out with [`IntrusivePtr::take`] or
//! clearing with [`IntrusivePtr::reset`] leaves it so, and dereferencing an
//! empty pointer panics. [`IntrusivePtr::try_get`] is the checked
//! alternative:
//!
//! ```rust
//! use tracked_ptr::{Error, IntrusivePtr};
//!
//! let mut a = IntrusivePtr::new(17);
//! let b = IntrusivePtr::take(&mut a);
//! assert_eq!(IntrusivePtr::count(&b), 1);
//! assert_eq!(IntrusivePtr::try_get(&a), Err(Error::NullDereference));
//! ```
//!
//! # Construction
//!
//! Besides taking a finished value, a pointer can be built in place. The
//! storage is allocated first and the value written straight into it, either
//! by a fallible closure ([`IntrusivePtr::try_new_with`]) or, with the
//! `pinned-init` feature, by an initializer of
//! [`Init`](pinned_init::Init) ([`IntrusivePtr::try_init`]). The constructor's
//! error comes back unchanged, and a failed construction leaves nothing
//! allocated. Error types only need to absorb
//! [`AllocError`](core::alloc::AllocError), the same convention as
//! `pinned_init`.
//!
//! # Tracking
//!
//! With the `tracking` feature, [`TrackedPtr<T>`] is an `IntrusivePtr` whose
//! allocation is also recorded in a [`Registry`] until it is destroyed. Every
//! entry carries the payload type and the construction site, so the registry
//! can tell what is still alive and where it came from:
//!
//! ```rust
//! use tracked_ptr::{Registry, RegistryConfig, TrackedPtr};
//!
//! let registry = Registry::new(RegistryConfig::default());
//! let kept = TrackedPtr::new_in(String::from("THIS IS SPARTA"), &registry).unwrap();
//! let _copy = kept.clone();
//!
//! // Clones share a single registration.
//! assert_eq!(registry.live_count(), 1);
//! for handle in registry.live_handles() {
//!     println!("{handle}");
//! }
//!
//! // Data meant to live until process exit is not a leak: shut the registry
//! // down explicitly before exiting.
//! let report = registry.shutdown();
//! assert_eq!(report.cleared.len(), 1);
//! assert_eq!(registry.live_count(), 0);
//! ```
//!
//! The process-wide registry behind [`make_tracked`] is finalized the same
//! way with [`shutdown_global`]. A finalized registry never comes back;
//! whether later registrations fail or are silently left untracked is set by
//! [`RegistryConfig::after_shutdown`].
//!
//! # Threads
//!
//! The count is atomic, so pointers may be cloned and dropped from several
//! threads when `T` is `Send + Sync`; exactly one of the racing drops
//! destroys the value. The registry serializes its mutations behind a lock.
//!
//! # Features
//!
//! - `pinned-init` (default): in-place construction from `pinned_init`
//!   initializers.
//! - `tracking` (default): the registry and tracked pointers. This pulls in
//!   `std`.
#![no_std]
#![feature(allocator_api)]

extern crate alloc;
#[cfg(any(test, feature = "tracking"))]
extern crate std;

mod error;
mod pointer;
#[cfg(feature = "tracking")]
mod registry;
mod sync;
#[cfg(feature = "tracking")]
mod tracked;

pub use self::{error::Error, pointer::IntrusivePtr};
#[cfg(feature = "pinned-init")]
#[doc(no_inline)]
pub use pinned_init;
#[cfg(feature = "tracking")]
pub use self::{
    registry::{
        shutdown_global, AfterShutdown, LiveHandle, LiveHandles, RegistrationToken, Registry,
        RegistryConfig, ShutdownReport, TokenId,
    },
    tracked::{make_tracked, make_tracked_with, TrackedPtr},
};
#[cfg(all(feature = "tracking", feature = "pinned-init"))]
pub use self::tracked::try_make_tracked;
