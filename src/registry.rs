//! The liveness registry behind [`TrackedPtr`](crate::TrackedPtr).
//!
//! A [`Registry`] records one [`LiveHandle`] per live tracked allocation. It
//! never owns or frees payloads; it only answers "what is still alive, and
//! where was it created?".
//!
//! The process-wide instance is reached through [`Registry::global`] and
//! finalized with [`shutdown_global`]. Tests and embedders that want isolation
//! create their own instances with [`Registry::new`] and pass them to the
//! `*_in` constructors of `TrackedPtr`.

use alloc::{collections::BTreeMap, sync::Arc, vec, vec::Vec};
use core::{any, fmt, iter::FusedIterator, mem, panic::Location};
use std::{sync::OnceLock, time::Instant};

use parking_lot::RwLock;

use crate::Error;

static GLOBAL: OnceLock<Registry> = OnceLock::new();

/// What a finalized registry does with new registrations.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AfterShutdown {
    /// Fail the registration with [`Error::RegistryFinalized`].
    #[default]
    Reject,
    /// Hand out an inert token that is never recorded.
    Ignore,
}

/// Runtime settings of a [`Registry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegistryConfig {
    pub after_shutdown: AfterShutdown,
    /// Emit a warning for every handle still registered at shutdown.
    pub report_leaks: bool,
}

impl RegistryConfig {
    pub const fn new() -> Self {
        RegistryConfig {
            after_shutdown: AfterShutdown::Reject,
            report_leaks: true,
        }
    }

    pub const fn after_shutdown(mut self, policy: AfterShutdown) -> Self {
        self.after_shutdown = policy;
        self
    }

    pub const fn report_leaks(mut self, report: bool) -> Self {
        self.report_leaks = report;
        self
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// The identifier of one registration.
///
/// Identifiers are handed out in increasing order and never reused by the
/// same registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TokenId(u64);

impl TokenId {
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Diagnostic record of a live registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveHandle {
    pub id: TokenId,
    /// The payload type, as reported by [`core::any::type_name`].
    pub type_name: &'static str,
    /// Where the tracked pointer was constructed.
    pub location: &'static Location<'static>,
    pub registered_at: Instant,
}

impl fmt::Display for LiveHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} at {}", self.id, self.type_name, self.location)
    }
}

/// Everything [`Registry::shutdown`] cleared.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub struct ShutdownReport {
    /// Handles that were still registered, in registration order.
    pub cleared: Vec<LiveHandle>,
    /// Whether an earlier call had already shut the registry down.
    pub already_finalized: bool,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.cleared.is_empty()
    }
}

#[derive(Debug)]
struct State {
    entries: BTreeMap<TokenId, LiveHandle>,
    next_id: u64,
    finalized: bool,
}

#[derive(Debug)]
struct Shared {
    config: RegistryConfig,
    state: RwLock<State>,
}

/// A table of live tracked handles.
///
/// `Registry` is a cheap handle: clones refer to the same table. Mutating
/// operations are serialized by a write lock; the read accessors may run
/// concurrently with each other.
#[derive(Debug, Clone)]
pub struct Registry {
    shared: Arc<Shared>,
}

impl Registry {
    /// Creates an independent, empty registry.
    pub fn new(config: RegistryConfig) -> Self {
        Registry {
            shared: Arc::new(Shared {
                config,
                state: RwLock::new(State {
                    entries: BTreeMap::new(),
                    next_id: 1,
                    finalized: false,
                }),
            }),
        }
    }

    /// The process-wide registry, created with the default configuration if
    /// [`init_global`](Self::init_global) has not run yet.
    pub fn global() -> &'static Registry {
        GLOBAL.get_or_init(|| Registry::new(RegistryConfig::default()))
    }

    /// Creates the process-wide registry with `config`.
    ///
    /// Only the first initialization takes effect. If the global registry
    /// already exists, it is returned as is and `config` is dropped.
    pub fn init_global(config: RegistryConfig) -> &'static Registry {
        let mut installed = false;
        let global = GLOBAL.get_or_init(|| {
            installed = true;
            Registry::new(config)
        });
        if !installed && global.config() != config {
            tracing::warn!(
                ?config,
                "global tracking registry already initialized; configuration ignored"
            );
        }
        global
    }

    pub fn config(&self) -> RegistryConfig {
        self.shared.config
    }

    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.shared, &b.shared)
    }

    /// Records a new live handle whose payload type is `T`, attributing it
    /// to the caller's location.
    ///
    /// After [`shutdown`](Self::shutdown) this either fails with
    /// [`Error::RegistryFinalized`] or returns an inert token, depending on
    /// [`RegistryConfig::after_shutdown`].
    #[track_caller]
    pub fn register<T: ?Sized>(&self) -> Result<RegistrationToken, Error> {
        self.register_at::<T>(Location::caller())
    }

    pub(crate) fn register_at<T: ?Sized>(
        &self,
        location: &'static Location<'static>,
    ) -> Result<RegistrationToken, Error> {
        let type_name = any::type_name::<T>();
        let mut state = self.shared.state.write();

        if state.finalized {
            drop(state);
            return match self.shared.config.after_shutdown {
                AfterShutdown::Reject => {
                    tracing::warn!(type_name, %location, "registration after shutdown rejected");
                    Err(Error::RegistryFinalized)
                }
                AfterShutdown::Ignore => {
                    tracing::debug!(type_name, %location, "registration after shutdown ignored");
                    Ok(RegistrationToken::inert())
                }
            };
        }

        let id = TokenId(state.next_id);
        state.next_id += 1;
        state.entries.insert(
            id,
            LiveHandle {
                id,
                type_name,
                location,
                registered_at: Instant::now(),
            },
        );
        drop(state);

        tracing::trace!(%id, type_name, %location, "handle registered");
        Ok(RegistrationToken {
            inner: Some((id, self.clone())),
        })
    }

    /// Removes the entry for `id`, returning whether it was present.
    ///
    /// Removing an entry that is already gone, including every entry after
    /// shutdown, is a no-op.
    pub fn deregister(&self, id: TokenId) -> bool {
        let removed = self.shared.state.write().entries.remove(&id).is_some();
        if removed {
            tracing::trace!(%id, "handle deregistered");
        }
        removed
    }

    /// Clears every entry and finalizes the registry.
    ///
    /// Meant to run once near process exit, after anything that should be
    /// reported as a leak has had its chance to drop. Handles that are still
    /// alive keep working; their later deregistration is a no-op. Calling
    /// this again returns an empty report.
    pub fn shutdown(&self) -> ShutdownReport {
        let (entries, already_finalized) = {
            let mut state = self.shared.state.write();
            let already_finalized = mem::replace(&mut state.finalized, true);
            (mem::take(&mut state.entries), already_finalized)
        };
        let cleared: Vec<LiveHandle> = entries.into_values().collect();

        if already_finalized {
            tracing::debug!("tracking registry already shut down");
        } else {
            tracing::info!(cleared = cleared.len(), "tracking registry shut down");
            if self.shared.config.report_leaks {
                for handle in &cleared {
                    tracing::warn!(
                        id = %handle.id,
                        type_name = handle.type_name,
                        location = %handle.location,
                        "handle still live at shutdown"
                    );
                }
            }
        }

        ShutdownReport {
            cleared,
            already_finalized,
        }
    }

    pub fn is_finalized(&self) -> bool {
        self.shared.state.read().finalized
    }

    /// The number of registered handles.
    pub fn live_count(&self) -> usize {
        self.shared.state.read().entries.len()
    }

    /// A snapshot of the registered handles, in registration order.
    ///
    /// Registrations made while iterating are not reflected.
    pub fn live_handles(&self) -> LiveHandles {
        let snapshot: Vec<LiveHandle> = self.shared.state.read().entries.values().cloned().collect();
        LiveHandles {
            inner: snapshot.into_iter(),
        }
    }
}

/// Finalizes the process-wide registry. See [`Registry::shutdown`].
pub fn shutdown_global() -> ShutdownReport {
    Registry::global().shutdown()
}

/// Iterator returned by [`Registry::live_handles`].
#[derive(Debug, Clone)]
pub struct LiveHandles {
    inner: vec::IntoIter<LiveHandle>,
}

impl Iterator for LiveHandles {
    type Item = LiveHandle;

    fn next(&mut self) -> Option<LiveHandle> {
        self.inner.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl ExactSizeIterator for LiveHandles {}

impl FusedIterator for LiveHandles {}

/// Proof of one registration, deregistered when dropped.
///
/// A token handed out by a finalized registry under
/// [`AfterShutdown::Ignore`] is inert: it has no id and dropping it does
/// nothing.
#[derive(Debug)]
#[must_use = "dropping a token deregisters it immediately"]
pub struct RegistrationToken {
    inner: Option<(TokenId, Registry)>,
}

impl RegistrationToken {
    const fn inert() -> Self {
        RegistrationToken { inner: None }
    }

    pub fn id(&self) -> Option<TokenId> {
        self.inner.as_ref().map(|(id, _)| *id)
    }

    pub fn is_inert(&self) -> bool {
        self.inner.is_none()
    }

    /// Deregisters now, leaving the token inert.
    pub fn release(&mut self) {
        if let Some((id, registry)) = self.inner.take() {
            registry.deregister(id);
        }
    }
}

impl Drop for RegistrationToken {
    fn drop(&mut self) {
        self.release();
    }
}
