//! Call link registry.
//!
//! Every cached call owns a `Linkage`: the code block it currently executes
//! through, or nothing once invalidated. The registry keeps those linkages in
//! a generational arena so that code blocks can name their incoming callers
//! by `LinkHandle` instead of by pointer.
//!
//! ```text
//!   CodeBlock.incoming: { h0, h3 }          LinkRegistry arena
//!                          │   │            ┌────┬────┬────┬────┐
//!                          │   └──────────▶ │ h0 │ h1 │ h2 │ h3 │
//!                          └──────────────▶ └─┬──┴────┴────┴─┬──┘
//!                                             ▼               ▼
//!                                          Linkage         Linkage
//! ```
//!
//! # Lock Order
//!
//! arena, then a linkage, then a code block's incoming set. Notification
//! detaches a block's incoming set before taking the arena lock, so a cache
//! that deregisters concurrently is either notified before it is removed or
//! skipped because its generation moved on. It is never notified afterwards.

use crate::code_cache::CodeBlock;

use parking_lot::Mutex;
use std::sync::Arc;

/// Arena handle of one registered cached call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkHandle {
    index: u32,
    generation: u32,
}

impl LinkHandle {
    #[inline]
    pub(crate) const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Arena slot.
    #[inline]
    pub fn index(self) -> u32 {
        self.index
    }

    /// Slot generation at registration.
    #[inline]
    pub fn generation(self) -> u32 {
        self.generation
    }
}

/// The code a cached call executes through.
#[derive(Debug)]
pub struct Linkage {
    code_block: Option<Arc<CodeBlock>>,
    num_parameters: usize,
}

impl Linkage {
    /// Current code block, `None` while unlinked.
    #[inline]
    pub fn code_block(&self) -> Option<&Arc<CodeBlock>> {
        self.code_block.as_ref()
    }

    /// True while a code block is linked.
    #[inline]
    pub fn is_linked(&self) -> bool {
        self.code_block.is_some()
    }

    /// Parameter count of the code last linked, receiver included.
    #[inline]
    pub fn num_parameters(&self) -> usize {
        self.num_parameters
    }

    fn link(&mut self, block: &Arc<CodeBlock>) {
        self.num_parameters = block.num_parameters();
        self.code_block = Some(Arc::clone(block));
    }
}

/// A linkage shared between a cached call and the registry.
pub type SharedLinkage = Arc<Mutex<Linkage>>;

/// What a replacement notification did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct NotifyOutcome {
    /// Caches moved onto the replacement block.
    pub upgraded: usize,
    /// Caches left unlinked.
    pub unlinked: usize,
}

struct LinkSlot {
    generation: u32,
    linkage: Option<SharedLinkage>,
}

#[derive(Default)]
struct Arena {
    slots: Vec<LinkSlot>,
    free: Vec<u32>,
    live: usize,
}

impl Arena {
    fn insert(&mut self, linkage: SharedLinkage) -> LinkHandle {
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.linkage = Some(linkage);
            return LinkHandle::new(index, slot.generation);
        }
        let index = self.slots.len() as u32;
        self.slots.push(LinkSlot {
            generation: 0,
            linkage: Some(linkage),
        });
        LinkHandle::new(index, 0)
    }

    fn get(&self, handle: LinkHandle) -> Option<&SharedLinkage> {
        let slot = self.slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.linkage.as_ref()
    }

    fn remove(&mut self, handle: LinkHandle) -> Option<SharedLinkage> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        let linkage = slot.linkage.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        self.live -= 1;
        Some(linkage)
    }
}

/// Registry of cached calls interested in code replacement.
#[derive(Default)]
pub struct LinkRegistry {
    arena: Mutex<Arena>,
}

impl LinkRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a cached call linked to `block`.
    pub fn register(&self, block: &Arc<CodeBlock>) -> (LinkHandle, SharedLinkage) {
        let linkage = Arc::new(Mutex::new(Linkage {
            code_block: Some(Arc::clone(block)),
            num_parameters: block.num_parameters(),
        }));

        let mut arena = self.arena.lock();
        let handle = arena.insert(Arc::clone(&linkage));
        block.link_incoming(handle);
        (handle, linkage)
    }

    /// Remove a registration. No notification reaches it afterwards.
    ///
    /// Returns false if the handle was not registered.
    pub fn deregister(&self, handle: LinkHandle) -> bool {
        let mut arena = self.arena.lock();
        let Some(linkage) = arena.remove(handle) else {
            return false;
        };
        let block = linkage.lock().code_block.take();
        if let Some(block) = block {
            block.unlink_incoming(handle);
        }
        true
    }

    /// Point a registration at `block`, leaving whatever it was linked to.
    pub fn relink(&self, handle: LinkHandle, block: &Arc<CodeBlock>) -> bool {
        let arena = self.arena.lock();
        let Some(shared) = arena.get(handle) else {
            return false;
        };
        let mut linkage = shared.lock();
        if let Some(previous) = linkage.code_block.take() {
            previous.unlink_incoming(handle);
        }
        linkage.link(block);
        block.link_incoming(handle);
        true
    }

    /// Deliver a replacement of `old` to every cache linked to it.
    ///
    /// A cache upgrades to `new` when upgrades are allowed, it still points at
    /// `old`, and `new` comes from the same executable with the same parameter
    /// count. Every other cache pointing at `old` is unlinked.
    pub fn notify_replaced(
        &self,
        old: &CodeBlock,
        new: Option<&Arc<CodeBlock>>,
        allow_upgrade: bool,
    ) -> NotifyOutcome {
        let handles = old.take_incoming();
        let mut outcome = NotifyOutcome::default();
        if handles.is_empty() {
            return outcome;
        }

        let compatible = new.filter(|new| {
            allow_upgrade
                && new.executable() == old.executable()
                && new.num_parameters() == old.num_parameters()
        });

        let arena = self.arena.lock();
        for handle in handles {
            let Some(shared) = arena.get(handle) else {
                continue;
            };
            let mut linkage = shared.lock();
            let points_at_old = linkage.code_block.as_ref().is_some_and(|b| b.id() == old.id());
            if !points_at_old {
                // Already relinked elsewhere
                continue;
            }

            match compatible {
                Some(new) => {
                    linkage.link(new);
                    new.link_incoming(handle);
                    outcome.upgraded += 1;
                    log::debug!(
                        "call link {:?}: upgraded {:?} -> {:?}",
                        handle,
                        old.id(),
                        new.id()
                    );
                }
                None => {
                    linkage.code_block = None;
                    outcome.unlinked += 1;
                    log::debug!("call link {:?}: unlinked from {:?}", handle, old.id());
                }
            }
        }
        outcome
    }

    /// Check whether a handle is registered.
    pub fn is_registered(&self, handle: LinkHandle) -> bool {
        self.arena.lock().get(handle).is_some()
    }

    /// Number of registered cached calls.
    pub fn len(&self) -> usize {
        self.arena.lock().live
    }

    /// True if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for LinkRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkRegistry").field("live", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code_cache::CodeTier;
    use crate::function::FunctionExecutable;
    use crate::value::Value;

    fn block_for(exe: &FunctionExecutable, tier: CodeTier) -> Arc<CodeBlock> {
        Arc::new(CodeBlock::compile(exe, tier))
    }

    fn executable(params: usize) -> Arc<FunctionExecutable> {
        FunctionExecutable::new("f", params, |_, _| Ok(Value::Undefined))
    }

    #[test]
    fn test_register_links_incoming() {
        let registry = LinkRegistry::new();
        let block = block_for(&executable(1), CodeTier::Baseline);

        let (handle, linkage) = registry.register(&block);
        assert!(registry.is_registered(handle));
        assert!(block.has_incoming(handle));
        assert!(linkage.lock().is_linked());
        assert_eq!(linkage.lock().num_parameters(), 2);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_deregister_unlinks_and_bumps_generation() {
        let registry = LinkRegistry::new();
        let block = block_for(&executable(0), CodeTier::Baseline);

        let (first, _) = registry.register(&block);
        assert!(registry.deregister(first));
        assert!(!registry.deregister(first));
        assert!(!block.has_incoming(first));
        assert!(registry.is_empty());

        // The slot is reused under a new generation
        let (second, _) = registry.register(&block);
        assert_eq!(second.index(), first.index());
        assert_ne!(second.generation(), first.generation());
        assert!(!registry.is_registered(first));
    }

    #[test]
    fn test_compatible_replacement_upgrades() {
        let registry = LinkRegistry::new();
        let exe = executable(2);
        let old = block_for(&exe, CodeTier::Baseline);
        let new = block_for(&exe, CodeTier::Optimized);
        let (handle, linkage) = registry.register(&old);

        let outcome = registry.notify_replaced(&old, Some(&new), true);
        assert_eq!(outcome, NotifyOutcome { upgraded: 1, unlinked: 0 });
        assert_eq!(linkage.lock().code_block().map(|b| b.id()), Some(new.id()));
        assert!(new.has_incoming(handle));
        assert!(!old.has_incoming(handle));
    }

    #[test]
    fn test_incompatible_replacements_unlink() {
        let registry = LinkRegistry::new();
        let exe = executable(2);
        let other = executable(2);
        let old = block_for(&exe, CodeTier::Baseline);

        // Different executable
        let (_, linkage) = registry.register(&old);
        let foreign = block_for(&other, CodeTier::Optimized);
        let outcome = registry.notify_replaced(&old, Some(&foreign), true);
        assert_eq!(outcome.unlinked, 1);
        assert!(!linkage.lock().is_linked());
        assert_eq!(foreign.incoming_count(), 0);

        // Different parameter count
        let (_, linkage) = registry.register(&old);
        let reshaped = Arc::new(CodeBlock::with_entry(
            exe.id(),
            CodeTier::Optimized,
            5,
            Arc::clone(exe.code()),
        ));
        registry.notify_replaced(&old, Some(&reshaped), true);
        assert!(!linkage.lock().is_linked());

        // No replacement
        let (_, linkage) = registry.register(&old);
        registry.notify_replaced(&old, None, true);
        assert!(!linkage.lock().is_linked());

        // Upgrades disabled
        let (_, linkage) = registry.register(&old);
        let same = block_for(&exe, CodeTier::Optimized);
        registry.notify_replaced(&old, Some(&same), false);
        assert!(!linkage.lock().is_linked());
    }

    #[test]
    fn test_relink_moves_incoming() {
        let registry = LinkRegistry::new();
        let exe = executable(0);
        let a = block_for(&exe, CodeTier::Baseline);
        let b = block_for(&exe, CodeTier::Optimized);

        let (handle, linkage) = registry.register(&a);
        assert!(registry.relink(handle, &b));
        assert!(!a.has_incoming(handle));
        assert!(b.has_incoming(handle));
        assert_eq!(linkage.lock().code_block().map(|c| c.id()), Some(b.id()));

        // A stale notification for `a` leaves the link alone
        a.link_incoming(handle);
        let outcome = registry.notify_replaced(&a, None, true);
        assert_eq!(outcome, NotifyOutcome::default());
        assert!(linkage.lock().is_linked());
    }

    #[test]
    fn test_deregistered_handles_are_not_notified() {
        let registry = LinkRegistry::new();
        let exe = executable(0);
        let old = block_for(&exe, CodeTier::Baseline);
        let new = block_for(&exe, CodeTier::Optimized);

        let (handle, linkage) = registry.register(&old);
        // Simulate a notification that detached the set before the drop
        let detached = old.take_incoming();
        assert_eq!(detached, vec![handle]);
        for h in detached {
            old.link_incoming(h);
        }
        registry.deregister(handle);

        let outcome = registry.notify_replaced(&old, Some(&new), true);
        assert_eq!(outcome, NotifyOutcome::default());
        assert!(!linkage.lock().is_linked());
        assert_eq!(new.incoming_count(), 0);
    }
}
