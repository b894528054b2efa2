//! The plugin/fork graph.
//!
//! Every installed plugin instance is a *fork*: a node that remembers its
//! parent, the scope and config it was installed with, the resources it
//! owns, and the forks it installed in turn. The graph is pure
//! bookkeeping; activation, teardown and service gating are driven by
//! [`Runtime`](crate::Runtime), which never holds the graph lock while
//! calling plugin code.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde_json::Value;

use chorus_types::error::{Result, RuntimeError};

use crate::disposable::Disposable;
use crate::plugin::Plugin;
use crate::scope::Scope;

/// Identifier of a fork within one runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ForkId(pub u64);

impl fmt::Display for ForkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fork-{}", self.0)
    }
}

/// Lifecycle state of a fork.
///
/// ```text
/// PENDING ──(all required services present)──▶ ACTIVE
///    ▲                                           │
///    └──────(a required service disappears)──────┘
/// PENDING | ACTIVE ──dispose──▶ DISPOSED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ForkState {
    /// Waiting for required services.
    Pending,
    /// Setup ran; the fork owns live resources.
    Active,
    /// Torn down for good.
    Disposed,
}

impl fmt::Display for ForkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ForkState::Pending => "pending",
            ForkState::Active => "active",
            ForkState::Disposed => "disposed",
        })
    }
}

/// Identifies one resource attached to a fork, so it can be detached
/// again without being released.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct SlotId(u64);

/// What the runtime needs to (re)run a fork's setup.
#[derive(Clone)]
pub(crate) struct ForkSetup {
    pub plugin: Arc<dyn Plugin>,
    pub scope: Scope,
    pub config: Value,
}

struct ForkNode {
    name: Arc<str>,
    parent: Option<ForkId>,
    setup: Option<ForkSetup>,
    disposables: Vec<(SlotId, Box<dyn Disposable>)>,
    children: Vec<ForkId>,
    required: Vec<String>,
    state: ForkState,
    /// Set while the runtime is tearing the fork down, so nested
    /// lifecycle calls do not reactivate it halfway through.
    busy: bool,
    last_error: Option<String>,
}

/// Bookkeeping for every live fork of a runtime.
///
/// Disposed forks are removed from the table; ids are never reused, so
/// an id that was issued but is no longer present reads as
/// [`ForkState::Disposed`].
pub struct PluginGraph {
    nodes: Mutex<HashMap<ForkId, ForkNode>>,
    next_id: AtomicU64,
    next_slot: AtomicU64,
}

impl PluginGraph {
    /// A graph containing only the active root fork.
    pub(crate) fn new() -> (Self, ForkId) {
        let root = ForkId(0);
        let mut nodes = HashMap::new();
        nodes.insert(
            root,
            ForkNode {
                name: Arc::from("root"),
                parent: None,
                setup: None,
                disposables: Vec::new(),
                children: Vec::new(),
                required: Vec::new(),
                state: ForkState::Active,
                busy: false,
                last_error: None,
            },
        );
        let graph = Self {
            nodes: Mutex::new(nodes),
            next_id: AtomicU64::new(1),
            next_slot: AtomicU64::new(1),
        };
        (graph, root)
    }

    /// A non-disposed, non-forkable fork of `plugin_name` under `parent`.
    pub(crate) fn find_reusable(&self, parent: ForkId, plugin_name: &str) -> Option<ForkId> {
        let nodes = self.nodes.lock();
        let parent = nodes.get(&parent)?;
        parent.children.iter().copied().find(|id| {
            nodes.get(id).is_some_and(|n| {
                &*n.name == plugin_name
                    && n.setup.as_ref().is_some_and(|s| !s.plugin.forkable())
            })
        })
    }

    /// Add a pending fork under `parent`.
    pub(crate) fn create(&self, parent: ForkId, setup: ForkSetup) -> Result<ForkId> {
        let mut nodes = self.nodes.lock();
        let parent_node = nodes.get_mut(&parent).ok_or_else(|| self.missing(parent))?;
        if parent_node.state == ForkState::Disposed {
            return Err(RuntimeError::ForkDisposed(parent.0));
        }

        let id = ForkId(self.next_id.fetch_add(1, Ordering::Relaxed));
        parent_node.children.push(id);
        nodes.insert(
            id,
            ForkNode {
                name: Arc::from(setup.plugin.name()),
                parent: Some(parent),
                required: setup.plugin.required_services(),
                setup: Some(setup),
                disposables: Vec::new(),
                children: Vec::new(),
                state: ForkState::Pending,
                busy: false,
                last_error: None,
            },
        );
        Ok(id)
    }

    fn missing(&self, id: ForkId) -> RuntimeError {
        if id.0 < self.next_id.load(Ordering::Relaxed) {
            RuntimeError::ForkDisposed(id.0)
        } else {
            RuntimeError::ForkNotFound(id.0)
        }
    }

    /// Attach a resource to an active fork.
    ///
    /// On failure the disposable is handed back together with the reason,
    /// so the caller can release it immediately.
    pub(crate) fn push_disposable(
        &self,
        id: ForkId,
        disposable: Box<dyn Disposable>,
    ) -> std::result::Result<SlotId, (RuntimeError, Box<dyn Disposable>)> {
        let mut nodes = self.nodes.lock();
        let Some(node) = nodes.get_mut(&id) else {
            return Err((self.missing(id), disposable));
        };
        match node.state {
            ForkState::Active => {
                let slot = SlotId(self.next_slot.fetch_add(1, Ordering::Relaxed));
                node.disposables.push((slot, disposable));
                Ok(slot)
            }
            ForkState::Pending => Err((RuntimeError::ForkInactive(id.0), disposable)),
            ForkState::Disposed => Err((RuntimeError::ForkDisposed(id.0), disposable)),
        }
    }

    /// Fail unless `id` is active.
    pub(crate) fn ensure_active(&self, id: ForkId) -> Result<()> {
        match self.state(id) {
            Some(ForkState::Active) => Ok(()),
            Some(ForkState::Pending) => Err(RuntimeError::ForkInactive(id.0)),
            Some(ForkState::Disposed) => Err(RuntimeError::ForkDisposed(id.0)),
            None => Err(RuntimeError::ForkNotFound(id.0)),
        }
    }

    /// Forget an attached resource without releasing it. Returns `false`
    /// if the slot is gone (already detached, or taken for teardown).
    pub(crate) fn detach(&self, id: ForkId, slot: SlotId) -> bool {
        let removed = {
            let mut nodes = self.nodes.lock();
            let Some(node) = nodes.get_mut(&id) else {
                return false;
            };
            let Some(pos) = node.disposables.iter().position(|(s, _)| *s == slot) else {
                return false;
            };
            node.disposables.remove(pos)
        };
        // Dropped outside the lock.
        drop(removed);
        true
    }

    pub(crate) fn take_disposables(&self, id: ForkId) -> Vec<Box<dyn Disposable>> {
        self.nodes
            .lock()
            .get_mut(&id)
            .map(|n| std::mem::take(&mut n.disposables))
            .unwrap_or_default()
            .into_iter()
            .map(|(_, disposable)| disposable)
            .collect()
    }

    pub(crate) fn take_children(&self, id: ForkId) -> Vec<ForkId> {
        self.nodes
            .lock()
            .get_mut(&id)
            .map(|n| std::mem::take(&mut n.children))
            .unwrap_or_default()
    }

    /// Move a pending, idle fork to active and return what its setup needs.
    pub(crate) fn begin_activation(&self, id: ForkId) -> Option<ForkSetup> {
        let mut nodes = self.nodes.lock();
        let node = nodes.get_mut(&id)?;
        if node.state != ForkState::Pending || node.busy {
            return None;
        }
        let setup = node.setup.clone()?;
        node.state = ForkState::Active;
        node.last_error = None;
        Some(setup)
    }

    /// Move an active fork back to pending, marking it busy until
    /// [`finish_teardown`](Self::finish_teardown). Returns `false` if it was
    /// not active.
    pub(crate) fn begin_deactivation(&self, id: ForkId) -> bool {
        let mut nodes = self.nodes.lock();
        match nodes.get_mut(&id) {
            Some(node) if node.state == ForkState::Active => {
                node.state = ForkState::Pending;
                node.busy = true;
                true
            }
            _ => false,
        }
    }

    pub(crate) fn finish_teardown(&self, id: ForkId) {
        if let Some(node) = self.nodes.lock().get_mut(&id) {
            node.busy = false;
        }
    }

    /// Mark a fork disposed. Returns `false` if it already was (or never
    /// existed), which makes disposal idempotent.
    pub(crate) fn begin_disposal(&self, id: ForkId) -> bool {
        let mut nodes = self.nodes.lock();
        match nodes.get_mut(&id) {
            Some(node) if node.state != ForkState::Disposed => {
                node.state = ForkState::Disposed;
                node.busy = true;
                true
            }
            _ => false,
        }
    }

    /// Drop a disposed fork from the table and from its parent's children.
    pub(crate) fn remove(&self, id: ForkId) {
        let mut nodes = self.nodes.lock();
        let parent = nodes.remove(&id).and_then(|n| n.parent);
        if let Some(parent) = parent.and_then(|p| nodes.get_mut(&p)) {
            parent.children.retain(|c| *c != id);
        }
    }

    pub(crate) fn set_error(&self, id: ForkId, error: String) {
        if let Some(node) = self.nodes.lock().get_mut(&id) {
            node.last_error = Some(error);
        }
    }

    /// Current state, or `None` for an id this graph never issued.
    pub fn state(&self, id: ForkId) -> Option<ForkState> {
        let nodes = self.nodes.lock();
        match nodes.get(&id) {
            Some(node) => Some(node.state),
            None if id.0 < self.next_id.load(Ordering::Relaxed) => Some(ForkState::Disposed),
            None => None,
        }
    }

    /// Name of the plugin a fork runs (`"root"` for the root fork).
    pub fn name(&self, id: ForkId) -> Option<Arc<str>> {
        self.nodes.lock().get(&id).map(|n| n.name.clone())
    }

    /// Scope a fork was installed with (`None` for the root fork).
    pub fn scope(&self, id: ForkId) -> Option<Scope> {
        self.nodes
            .lock()
            .get(&id)
            .and_then(|n| n.setup.as_ref())
            .map(|s| s.scope.clone())
    }

    /// Parent of a fork.
    pub fn parent(&self, id: ForkId) -> Option<ForkId> {
        self.nodes.lock().get(&id).and_then(|n| n.parent)
    }

    /// Live children of a fork, in installation order.
    pub fn children(&self, id: ForkId) -> Vec<ForkId> {
        self.nodes
            .lock()
            .get(&id)
            .map(|n| n.children.clone())
            .unwrap_or_default()
    }

    /// Every live fork running the plugin named `plugin_name`.
    pub fn forks_of(&self, plugin_name: &str) -> Vec<ForkId> {
        let nodes = self.nodes.lock();
        let mut ids: Vec<ForkId> = nodes
            .iter()
            .filter(|(_, n)| n.setup.is_some() && &*n.name == plugin_name)
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids
    }

    /// Required service names of a fork.
    pub fn required(&self, id: ForkId) -> Vec<String> {
        self.nodes
            .lock()
            .get(&id)
            .map(|n| n.required.clone())
            .unwrap_or_default()
    }

    /// Number of resources a fork currently owns.
    pub fn disposable_count(&self, id: ForkId) -> usize {
        self.nodes.lock().get(&id).map_or(0, |n| n.disposables.len())
    }

    /// The error from the fork's last failed setup, if any.
    pub fn last_error(&self, id: ForkId) -> Option<String> {
        self.nodes.lock().get(&id).and_then(|n| n.last_error.clone())
    }

    /// Number of live forks, the root included.
    pub fn len(&self) -> usize {
        self.nodes.lock().len()
    }

    /// Whether every fork, the root included, has been disposed.
    pub fn is_empty(&self) -> bool {
        self.nodes.lock().is_empty()
    }
}
