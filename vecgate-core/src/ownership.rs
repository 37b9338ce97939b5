//! Composite construction and the ownership mirror.
//!
//! The native engine lets a composite free its children when the composite
//! itself is freed. The wrapper never relies on that: right after a composite
//! is constructed its native ownership flag is cleared, and the managed
//! mirror records which handles the composite owns. Releasing the composite
//! then releases its owned children (in reverse order) and frees its own
//! native object, each exactly once.
//!
//! A child can be adopted in one of two modes:
//!
//! - [`Adoption::Owned`]: the composite becomes the child's only owner. An
//!   explicit release of the child fails with
//!   [`Error::OwnershipConflict`] while the composite is alive, and a second
//!   composite cannot own it.
//! - [`Adoption::Borrowed`]: the composite only references the child. The
//!   caller keeps responsibility for releasing it, and must not release it
//!   while the composite still uses it; doing so is logged as a warning.
//!
//! All adoptions are serialized by one coordinator lock, so two composites
//! can never both claim the same child.

use std::sync::Arc;

use parking_lot::{const_mutex, Mutex};
use tracing::debug;

use crate::engine::{NativeClass, NativeRef};
use crate::error::{Error, Result};
use crate::gateway::Gateway;
use crate::handle::{Handle, HandleId};

/// How a composite holds a child handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Adoption {
    /// The composite owns the child and releases it.
    #[default]
    Owned,
    /// The composite references the child; the caller releases it.
    Borrowed,
}

static COORDINATOR: Mutex<()> = const_mutex(());

/// Checks that every child may be adopted and collects their native refs.
fn check_children(children: &[(&Arc<Handle>, Adoption)]) -> Result<Vec<NativeRef>> {
    let mut refs = Vec::with_capacity(children.len());
    let mut owned: Vec<HandleId> = Vec::new();
    for (child, mode) in children {
        let state = child.live()?;
        if *mode == Adoption::Owned {
            if let Some(owner) = state.owner {
                return Err(Error::OwnershipConflict(format!(
                    "handle {} is already owned by composite {}",
                    child.id(),
                    owner
                )));
            }
            if owned.contains(&child.id()) {
                return Err(Error::OwnershipConflict(format!(
                    "handle {} passed twice as an owned child",
                    child.id()
                )));
            }
            owned.push(child.id());
        }
        refs.push(state.native_ref);
    }
    Ok(refs)
}

/// Builds a composite over `children`.
///
/// `construct` receives the children's native refs in order and returns the
/// new native composite. Construction failure leaves every child untouched.
/// Any failure after construction frees the new native object; with its
/// ownership flag cleared (or never set), that never touches the children.
pub(crate) fn compose(
    gateway: &Gateway,
    class: NativeClass,
    children: &[(&Arc<Handle>, Adoption)],
    construct: impl FnOnce(&[NativeRef]) -> Result<NativeRef>,
) -> Result<Arc<Handle>> {
    let _coordinator = COORDINATOR.lock();

    let refs = check_children(children)?;
    let native = construct(&refs)?;

    let info = gateway
        .set_own_fields(native, false)
        .and_then(|_| gateway.describe(class, native));
    let info = match info {
        Ok(info) => info,
        Err(e) => {
            let _ = gateway.free(class, native);
            return Err(e);
        }
    };

    let composite = Handle::new(gateway.clone(), class, native, info.ntotal, info.is_trained);
    {
        let mut state = composite.lock();
        for (child, mode) in children {
            let mut child_state = child.lock();
            match mode {
                Adoption::Owned => {
                    child_state.owner = Some(composite.id());
                    state.owned_children.push(Arc::clone(child));
                }
                Adoption::Borrowed => {
                    child_state.borrowers += 1;
                    state.referenced_children.push(Arc::clone(child));
                }
            }
            debug!(composite = %composite.id(), child = %child.id(), ?mode, "child adopted");
        }
    }
    Ok(composite)
}

/// Returns true if `target` is `from` or held, owned or borrowed, anywhere
/// below it.
///
/// Each node is locked only while its child lists are copied. The caller
/// must not hold the lock of any handle in the tree.
fn reaches(from: &Arc<Handle>, target: &Arc<Handle>) -> bool {
    let mut pending = vec![Arc::clone(from)];
    while let Some(node) = pending.pop() {
        if Arc::ptr_eq(&node, target) {
            return true;
        }
        let state = node.lock();
        pending.extend(state.owned_children.iter().cloned());
        pending.extend(state.referenced_children.iter().cloned());
    }
    false
}

/// Adds `child` to an existing composite as an owned child.
///
/// Fails with [`Error::OwnershipConflict`] if `child` already has an owner,
/// or if `child` is the composite or holds it somewhere in its own tree.
///
/// `attach` receives the composite's and the child's native refs.
pub(crate) fn adopt_into(
    gateway: &Gateway,
    composite: &Arc<Handle>,
    child: &Arc<Handle>,
    attach: impl FnOnce(NativeRef, NativeRef) -> Result<()>,
) -> Result<()> {
    let _coordinator = COORDINATOR.lock();

    if reaches(child, composite) {
        return Err(Error::OwnershipConflict(format!(
            "handle {} already holds composite {}; adopting it would form a cycle",
            child.id(),
            composite.id()
        )));
    }
    let mut state = composite.live()?;
    let child_ref = check_children(&[(child, Adoption::Owned)])?[0];

    attach(state.native_ref, child_ref)?;
    gateway.set_own_fields(state.native_ref, false)?;

    child.lock().owner = Some(composite.id());
    state.owned_children.push(Arc::clone(child));
    debug!(composite = %composite.id(), child = %child.id(), "child adopted");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{MockEngine, NativeEngine};
    use crate::metric::MetricType;

    fn setup() -> (Arc<MockEngine>, Gateway) {
        let engine = Arc::new(MockEngine::new());
        let gateway = Gateway::new(engine.clone());
        (engine, gateway)
    }

    fn flat(engine: &MockEngine, gateway: &Gateway, d: usize) -> Arc<Handle> {
        let native = engine.index_flat_new(d, MetricType::L2).unwrap();
        Handle::new(gateway.clone(), NativeClass::Index, native, 0, true)
    }

    fn idmap(gateway: &Gateway, base: &Arc<Handle>, mode: Adoption) -> Result<Arc<Handle>> {
        compose(gateway, NativeClass::Index, &[(base, mode)], |refs| {
            gateway.call("index_idmap_new", |e| e.index_idmap_new(refs[0]))
        })
    }

    #[test]
    fn test_owned_child_single_owner() {
        let (engine, gateway) = setup();
        let base = flat(&engine, &gateway, 4);
        let composite = idmap(&gateway, &base, Adoption::Owned).unwrap();

        assert_eq!(base.owner(), Some(composite.id()));
        assert_eq!(composite.owned_children(), vec![base.id()]);
        assert_eq!(engine.own_fields(composite.lock().native_ref), Some(false));

        // A second owner is refused before anything is constructed.
        let before = engine.calls("index_idmap_new");
        assert!(matches!(
            idmap(&gateway, &base, Adoption::Owned),
            Err(Error::OwnershipConflict(_))
        ));
        assert_eq!(engine.calls("index_idmap_new"), before);

        composite.release().unwrap();
        assert!(base.is_released());
        assert_eq!(engine.live_objects(), 0);
        assert!(engine.violations().is_empty());
    }

    #[test]
    fn test_borrowed_child_outlives_composite() {
        let (engine, gateway) = setup();
        let base = flat(&engine, &gateway, 4);
        let composite = idmap(&gateway, &base, Adoption::Borrowed).unwrap();
        assert_eq!(base.borrowers(), 1);
        assert_eq!(base.owner(), None);

        composite.release().unwrap();
        assert!(!base.is_released());
        assert_eq!(base.borrowers(), 0);

        base.release().unwrap();
        assert_eq!(engine.live_objects(), 0);
        assert!(engine.violations().is_empty());
    }

    #[test]
    fn test_construction_failure_leaves_children_untouched() {
        let (engine, gateway) = setup();
        let base = flat(&engine, &gateway, 4);
        engine.fail_next("index_idmap_new", -1);

        assert!(idmap(&gateway, &base, Adoption::Owned).is_err());
        assert_eq!(base.owner(), None);
        assert_eq!(engine.live_objects(), 1);
    }

    #[test]
    fn test_post_construction_failure_frees_composite() {
        let (engine, gateway) = setup();
        let base = flat(&engine, &gateway, 4);
        engine.fail_next("set_own_fields", -1);

        assert!(idmap(&gateway, &base, Adoption::Owned).is_err());
        assert_eq!(base.owner(), None);
        assert!(!base.is_released());
        assert_eq!(engine.live_objects(), 1);
        assert!(engine.violations().is_empty());
    }

    #[test]
    fn test_released_child_refused() {
        let (engine, gateway) = setup();
        let base = flat(&engine, &gateway, 4);
        base.release().unwrap();
        assert!(matches!(
            idmap(&gateway, &base, Adoption::Owned),
            Err(Error::ReleasedHandle)
        ));
    }

    #[test]
    fn test_adopt_into_shards() {
        let (engine, gateway) = setup();
        let native = engine.index_shards_new(4, MetricType::L2).unwrap();
        let shards = Handle::new(gateway.clone(), NativeClass::Index, native, 0, true);
        let shard = flat(&engine, &gateway, 4);

        let attach = |s, c| gateway.call("index_shards_add_shard", |e| e.index_shards_add_shard(s, c));
        adopt_into(&gateway, &shards, &shard, attach).unwrap();
        assert_eq!(shard.owner(), Some(shards.id()));
        assert!(matches!(
            adopt_into(&gateway, &shards, &shard, attach),
            Err(Error::OwnershipConflict(_))
        ));

        drop(shards);
        assert!(shard.is_released());
        assert_eq!(engine.live_objects(), 0);
    }

    #[test]
    fn test_adopt_into_refuses_cycles() {
        let (engine, gateway) = setup();
        let native = engine.index_shards_new(4, MetricType::L2).unwrap();
        let shards = Handle::new(gateway.clone(), NativeClass::Index, native, 0, true);
        let attach = |s, c| gateway.call("index_shards_add_shard", |e| e.index_shards_add_shard(s, c));

        assert!(matches!(
            adopt_into(&gateway, &shards, &shards, attach),
            Err(Error::OwnershipConflict(_))
        ));

        // shards -> wrapper -> shards
        let wrapper = idmap(&gateway, &shards, Adoption::Owned).unwrap();
        assert!(matches!(
            adopt_into(&gateway, &shards, &wrapper, attach),
            Err(Error::OwnershipConflict(_))
        ));
        assert_eq!(wrapper.owner(), None);
        assert!(shards.owned_children().is_empty());
        assert_eq!(engine.calls("index_shards_add_shard"), 0);

        // A borrowed path is a cycle too.
        let base = flat(&engine, &gateway, 4);
        let inner = engine.index_shards_new(4, MetricType::L2).unwrap();
        let inner = Handle::new(gateway.clone(), NativeClass::Index, inner, 0, true);
        let borrowing = idmap(&gateway, &inner, Adoption::Borrowed).unwrap();
        adopt_into(&gateway, &inner, &base, attach).unwrap();
        assert!(matches!(
            adopt_into(&gateway, &inner, &borrowing, attach),
            Err(Error::OwnershipConflict(_))
        ));

        wrapper.release().unwrap();
        assert!(shards.is_released());
        borrowing.release().unwrap();
        inner.release().unwrap();
        assert!(base.is_released());
        assert_eq!(engine.live_objects(), 0);
        assert!(engine.violations().is_empty());
    }
}
