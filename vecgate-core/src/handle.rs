//! Native handles and their release contract.
//!
//! A [`Handle`] owns one native reference plus a mirror of the scalar state
//! that is cheap to cache (element count, trained flag). Release is
//! idempotent: the first release frees the native object and zeroes the
//! reference, every later release is a no-op. Dropping the last reference to
//! a handle runs the same release logic, so a forgotten handle does not
//! leak; explicit release remains the way to control when memory is freed.
//!
//! Composite handles additionally hold their children. Owned children are
//! released by the composite, in reverse construction order, before the
//! composite's own native object is freed. Referenced (borrowed) children are
//! never released by the composite.

use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::engine::{NativeClass, NativeRef, NULL_REF};
use crate::error::{Error, Result};
use crate::gateway::Gateway;

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a handle, used by the ownership mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(u64);

impl HandleId {
    fn next() -> Self {
        Self(NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The concrete variant behind an index handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IndexKind {
    /// Exhaustive search over raw vectors.
    Flat,
    /// Inverted lists over a coarse quantizer.
    InvertedFile,
    /// Hierarchical navigable small-world graph.
    Graph,
    ProductQuantized,
    ScalarQuantized,
    LocalitySensitiveHash,
    /// Any index over packed binary codes.
    Binary,
    /// Maps caller-chosen ids onto a base index.
    IdMap,
    /// Re-ranks a base index's candidates with an exact index.
    Refine,
    /// Applies a vector transform before a base index.
    PreTransform,
    /// Fans out over several indexes.
    Shards,
    /// Built from a pipeline description; structure owned natively.
    Generic,
}

impl IndexKind {
    /// Returns true for kinds built from child handles.
    pub fn is_composite(self) -> bool {
        matches!(
            self,
            IndexKind::InvertedFile
                | IndexKind::IdMap
                | IndexKind::Refine
                | IndexKind::PreTransform
                | IndexKind::Shards
        )
    }

    /// Recovers the kind from a native runtime type name.
    pub fn from_type_name(name: &str) -> Self {
        match name {
            "IndexIDMap" | "IndexIDMap2" => IndexKind::IdMap,
            "IndexPreTransform" => IndexKind::PreTransform,
            "IndexShards" => IndexKind::Shards,
            "IndexScalarQuantizer" => IndexKind::ScalarQuantized,
            "IndexLSH" => IndexKind::LocalitySensitiveHash,
            n if n.starts_with("IndexBinary") => IndexKind::Binary,
            n if n.starts_with("IndexFlat") => IndexKind::Flat,
            n if n.starts_with("IndexIVF") => IndexKind::InvertedFile,
            n if n.starts_with("IndexHNSW") => IndexKind::Graph,
            n if n.starts_with("IndexPQ") => IndexKind::ProductQuantized,
            n if n.starts_with("IndexRefine") => IndexKind::Refine,
            _ => IndexKind::Generic,
        }
    }

    pub(crate) fn class(self) -> NativeClass {
        match self {
            IndexKind::Binary => NativeClass::BinaryIndex,
            _ => NativeClass::Index,
        }
    }
}

/// Mutable state of a handle, guarded by the handle's lock.
pub(crate) struct HandleState {
    pub(crate) native_ref: NativeRef,
    pub(crate) element_count: usize,
    pub(crate) is_trained: bool,
    /// Composite that owns this handle, if any.
    pub(crate) owner: Option<HandleId>,
    /// Number of live composites borrowing this handle.
    pub(crate) borrowers: usize,
    pub(crate) owned_children: Vec<Arc<Handle>>,
    pub(crate) referenced_children: Vec<Arc<Handle>>,
}

/// One native object and its cached scalar state.
pub(crate) struct Handle {
    id: HandleId,
    class: NativeClass,
    gateway: Gateway,
    state: Mutex<HandleState>,
}

impl Handle {
    pub(crate) fn new(
        gateway: Gateway,
        class: NativeClass,
        native_ref: NativeRef,
        element_count: usize,
        is_trained: bool,
    ) -> Arc<Self> {
        let handle = Arc::new(Self {
            id: HandleId::next(),
            class,
            gateway,
            state: Mutex::new(HandleState {
                native_ref,
                element_count,
                is_trained,
                owner: None,
                borrowers: 0,
                owned_children: Vec::new(),
                referenced_children: Vec::new(),
            }),
        });
        debug!(handle = %handle.id, ?class, native_ref, "handle created");
        handle
    }

    pub(crate) fn id(&self) -> HandleId {
        self.id
    }

    pub(crate) fn class(&self) -> NativeClass {
        self.class
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, HandleState> {
        self.state.lock()
    }

    /// Locks the state of a handle that has not been released.
    ///
    /// The lock is held for the duration of the caller's native call, so a
    /// concurrent release cannot free the object mid-call.
    pub(crate) fn live(&self) -> Result<MutexGuard<'_, HandleState>> {
        let state = self.state.lock();
        if state.native_ref == NULL_REF {
            return Err(Error::ReleasedHandle);
        }
        Ok(state)
    }

    pub(crate) fn is_released(&self) -> bool {
        self.state.lock().native_ref == NULL_REF
    }

    /// Caller-initiated release.
    ///
    /// # Errors
    ///
    /// [`Error::OwnershipConflict`] if a live composite owns this handle; its
    /// lifetime belongs to the composite.
    pub(crate) fn release(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.native_ref == NULL_REF {
            return Ok(());
        }
        if let Some(owner) = state.owner {
            return Err(Error::OwnershipConflict(format!(
                "handle {} is owned by composite {}; release the composite instead",
                self.id, owner
            )));
        }
        if state.borrowers > 0 {
            warn!(
                handle = %self.id,
                borrowers = state.borrowers,
                "releasing a handle that composites still borrow"
            );
        }
        self.release_locked(&mut state)
    }

    /// Release performed by the composite that owns this handle.
    fn release_by_owner(&self, owner: HandleId) -> Result<()> {
        let mut state = self.state.lock();
        if state.native_ref == NULL_REF {
            return Ok(());
        }
        debug_assert_eq!(state.owner, Some(owner));
        self.release_locked(&mut state)
    }

    fn end_borrow(&self) {
        let mut state = self.state.lock();
        state.borrowers = state.borrowers.saturating_sub(1);
    }

    /// Releases owned children, drops borrowed ones, then frees the native
    /// object. Every step runs even if an earlier one failed; the first error
    /// is returned.
    fn release_locked(&self, state: &mut HandleState) -> Result<()> {
        let mut first_error = None;

        let owned = mem::take(&mut state.owned_children);
        for child in owned.iter().rev() {
            if let Err(e) = child.release_by_owner(self.id) {
                first_error.get_or_insert(e);
            }
        }
        for child in mem::take(&mut state.referenced_children) {
            child.end_borrow();
        }

        let native_ref = mem::replace(&mut state.native_ref, NULL_REF);
        state.element_count = 0;
        state.owner = None;
        if let Err(e) = self.gateway.free(self.class, native_ref) {
            first_error.get_or_insert(e);
        }
        debug!(handle = %self.id, native_ref, children = owned.len(), "handle released");

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub(crate) fn owner(&self) -> Option<HandleId> {
        self.state.lock().owner
    }

    pub(crate) fn borrowers(&self) -> usize {
        self.state.lock().borrowers
    }

    pub(crate) fn owned_children(&self) -> Vec<HandleId> {
        self.state.lock().owned_children.iter().map(|c| c.id).collect()
    }

    pub(crate) fn referenced_children(&self) -> Vec<HandleId> {
        self.state
            .lock()
            .referenced_children
            .iter()
            .map(|c| c.id)
            .collect()
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        if state.native_ref == NULL_REF {
            return;
        }
        debug!(handle = %self.id, "releasing unreleased handle on drop");
        if let Err(e) = self.release_locked(&mut state) {
            error!(handle = %self.id, error = %e, "release on drop failed");
        }
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Handle")
            .field("id", &self.id)
            .field("class", &self.class)
            .field("native_ref", &state.native_ref)
            .field("owner", &state.owner)
            .finish()
    }
}
