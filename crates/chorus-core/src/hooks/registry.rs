//! Hook registry -- per-event ordered listener lists.
//!
//! Generic over the listener type so that event hooks and middleware
//! share one implementation of ordering, scoping, ownership and the
//! soft limit.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tracing::warn;

use chorus_types::config::RuntimeConfig;
use chorus_types::error::{Result, RuntimeError};
use chorus_types::session::Session;

use crate::fork::ForkId;
use crate::scope::Scope;

/// Unique identifier of a registered hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HookId(pub u64);

impl fmt::Display for HookId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "hook-{}", self.0)
    }
}

/// The fork (and plugin) a hook belongs to. Used for cleanup and logging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookOwner {
    /// Owning fork.
    pub fork: ForkId,
    /// Name of the owning plugin.
    pub plugin: Arc<str>,
}

/// One registered listener.
#[derive(Debug)]
pub struct HookEntry<L> {
    /// Registry-unique id.
    pub id: HookId,
    /// Event name the hook listens to.
    pub event: Arc<str>,
    /// Sessions the hook applies to.
    pub scope: Scope,
    /// Whether the hook was registered in the prepended class.
    pub prepend: bool,
    /// The callback.
    pub listener: L,
    /// Owning fork and plugin.
    pub owner: HookOwner,
}

impl<L> HookEntry<L> {
    /// Whether this hook should see `session`.
    ///
    /// Dispatches without a session reach every hook.
    pub fn applies_to(&self, session: Option<&Session>) -> bool {
        session.is_none_or(|s| self.scope.contains(s))
    }
}

/// Soft limits applied per event name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookLimits {
    /// Appended listeners before a warning.
    pub max_appended: usize,
    /// Prepended listeners before a warning.
    pub max_prepended: usize,
    /// Trim the oldest appended listener instead of only warning.
    pub trim_on_overflow: bool,
}

impl From<&RuntimeConfig> for HookLimits {
    fn from(config: &RuntimeConfig) -> Self {
        Self {
            max_appended: config.max_listeners,
            max_prepended: config.max_prepended_listeners,
            trim_on_overflow: config.trim_on_overflow,
        }
    }
}

impl Default for HookLimits {
    fn default() -> Self {
        Self::from(&RuntimeConfig::default())
    }
}

struct EventHooks<L> {
    prepended: Vec<Arc<HookEntry<L>>>,
    appended: Vec<Arc<HookEntry<L>>>,
}

impl<L> Default for EventHooks<L> {
    fn default() -> Self {
        Self {
            prepended: Vec::new(),
            appended: Vec::new(),
        }
    }
}

/// Central registry of hooks, keyed by event name.
///
/// Registration and removal take a short write lock; dispatch clones the
/// current list under a read lock and works on that snapshot, so hooks
/// added or removed mid-dispatch never disturb an ongoing dispatch.
pub struct HookRegistry<L> {
    events: RwLock<HashMap<Arc<str>, EventHooks<L>>>,
    next_id: AtomicU64,
    limits: HookLimits,
}

impl<L> HookRegistry<L> {
    /// Create an empty registry.
    pub fn new(limits: HookLimits) -> Self {
        Self {
            events: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            limits,
        }
    }

    /// The limits this registry enforces.
    pub fn limits(&self) -> HookLimits {
        self.limits
    }

    /// Register a listener for `event`.
    ///
    /// Prepended hooks run before appended hooks; each class keeps
    /// registration order. Exceeding the soft limit logs a warning and,
    /// when trimming is enabled, drops the oldest appended hook.
    pub fn register(
        &self,
        event: &str,
        scope: Scope,
        listener: L,
        prepend: bool,
        owner: HookOwner,
    ) -> Result<Arc<HookEntry<L>>> {
        if event.trim().is_empty() {
            return Err(RuntimeError::InvalidEventName(event.to_string()));
        }

        let entry = Arc::new(HookEntry {
            id: HookId(self.next_id.fetch_add(1, Ordering::Relaxed)),
            event: Arc::from(event),
            scope,
            prepend,
            listener,
            owner,
        });

        let mut events = self.events.write();
        let hooks = events.entry(entry.event.clone()).or_default();
        let (list, limit) = if prepend {
            (&mut hooks.prepended, self.limits.max_prepended)
        } else {
            (&mut hooks.appended, self.limits.max_appended)
        };
        list.push(entry.clone());

        if list.len() > limit {
            if self.limits.trim_on_overflow && !prepend {
                let trimmed = list.remove(0);
                warn!(
                    event = %entry.event,
                    limit,
                    trimmed = %trimmed.id,
                    plugin = %trimmed.owner.plugin,
                    "listener limit exceeded, trimmed oldest listener"
                );
            } else if list.len() == limit + 1 {
                warn!(
                    event = %entry.event,
                    limit,
                    prepend,
                    plugin = %entry.owner.plugin,
                    "possible listener leak: soft limit exceeded"
                );
            }
        }

        Ok(entry)
    }

    /// Remove a hook. Returns `false` if it was already gone.
    pub fn remove(&self, entry: &HookEntry<L>) -> bool {
        let mut events = self.events.write();
        let Some(hooks) = events.get_mut(&entry.event) else {
            return false;
        };
        let list = if entry.prepend {
            &mut hooks.prepended
        } else {
            &mut hooks.appended
        };
        let before = list.len();
        list.retain(|h| h.id != entry.id);
        let removed = list.len() < before;

        if hooks.prepended.is_empty() && hooks.appended.is_empty() {
            events.remove(&entry.event);
        }
        removed
    }

    /// Snapshot of every hook for `event`, in dispatch order.
    pub fn snapshot(&self, event: &str) -> Vec<Arc<HookEntry<L>>> {
        let events = self.events.read();
        events
            .get(event)
            .map(|hooks| {
                hooks
                    .prepended
                    .iter()
                    .chain(hooks.appended.iter())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Snapshot of the hooks for `event` whose scope admits `session`.
    pub fn matching(&self, event: &str, session: Option<&Session>) -> Vec<Arc<HookEntry<L>>> {
        let mut hooks = self.snapshot(event);
        hooks.retain(|h| h.applies_to(session));
        hooks
    }

    /// Number of hooks registered for `event`.
    pub fn count(&self, event: &str) -> usize {
        let events = self.events.read();
        events
            .get(event)
            .map_or(0, |h| h.prepended.len() + h.appended.len())
    }

    /// Number of hooks owned by `fork`, across all events.
    pub fn count_owned_by(&self, fork: ForkId) -> usize {
        let events = self.events.read();
        events
            .values()
            .flat_map(|h| h.prepended.iter().chain(h.appended.iter()))
            .filter(|h| h.owner.fork == fork)
            .count()
    }

    /// Total number of registered hooks.
    pub fn len(&self) -> usize {
        let events = self.events.read();
        events
            .values()
            .map(|h| h.prepended.len() + h.appended.len())
            .sum()
    }

    /// Whether no hooks are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<L> Default for HookRegistry<L> {
    fn default() -> Self {
        Self::new(HookLimits::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner(plugin: &str) -> HookOwner {
        HookOwner {
            fork: ForkId(1),
            plugin: Arc::from(plugin),
        }
    }

    fn names(hooks: &[Arc<HookEntry<&'static str>>]) -> Vec<&'static str> {
        hooks.iter().map(|h| h.listener).collect()
    }

    #[test]
    fn prepended_run_first_in_registration_order() {
        let reg = HookRegistry::default();
        reg.register("message", Scope::all(), "a", false, owner("p")).unwrap();
        reg.register("message", Scope::all(), "b", false, owner("p")).unwrap();
        reg.register("message", Scope::all(), "c", true, owner("p")).unwrap();
        reg.register("message", Scope::all(), "d", true, owner("p")).unwrap();
        assert_eq!(names(&reg.snapshot("message")), vec!["c", "d", "a", "b"]);
    }

    #[test]
    fn remove_is_idempotent() {
        let reg = HookRegistry::default();
        let h = reg.register("ev", Scope::all(), "a", false, owner("p")).unwrap();
        assert_eq!(reg.count("ev"), 1);
        assert!(reg.remove(&h));
        assert!(!reg.remove(&h));
        assert_eq!(reg.count("ev"), 0);
        assert!(reg.is_empty());
    }

    #[test]
    fn empty_event_name_rejected() {
        let reg: HookRegistry<&str> = HookRegistry::default();
        let err = reg
            .register("  ", Scope::all(), "a", false, owner("p"))
            .unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidEventName(_)));
    }

    #[test]
    fn matching_filters_by_scope() {
        let reg = HookRegistry::default();
        reg.register("message", Scope::by_user(["42"]), "mine", false, owner("p"))
            .unwrap();
        reg.register("message", Scope::all(), "all", false, owner("p"))
            .unwrap();

        let s42 = Session::private("qq", "42");
        let s43 = Session::private("qq", "43");
        assert_eq!(names(&reg.matching("message", Some(&s42))), vec!["mine", "all"]);
        assert_eq!(names(&reg.matching("message", Some(&s43))), vec!["all"]);
        assert_eq!(names(&reg.matching("message", None)), vec!["mine", "all"]);
    }

    #[test]
    fn soft_limit_warns_without_rejecting() {
        let reg = HookRegistry::new(HookLimits {
            max_appended: 2,
            max_prepended: 2,
            trim_on_overflow: false,
        });
        for name in ["a", "b", "c", "d"] {
            reg.register("ev", Scope::all(), name, false, owner("p")).unwrap();
        }
        assert_eq!(reg.count("ev"), 4);
    }

    #[test]
    fn overflow_trims_oldest_appended_when_enabled() {
        let reg = HookRegistry::new(HookLimits {
            max_appended: 2,
            max_prepended: 2,
            trim_on_overflow: true,
        });
        let first = reg.register("ev", Scope::all(), "a", false, owner("p")).unwrap();
        reg.register("ev", Scope::all(), "b", false, owner("p")).unwrap();
        reg.register("ev", Scope::all(), "c", false, owner("p")).unwrap();
        assert_eq!(names(&reg.snapshot("ev")), vec!["b", "c"]);
        assert!(!reg.remove(&first));
    }

    #[test]
    fn snapshot_is_isolated_from_later_changes() {
        let reg = HookRegistry::default();
        let a = reg.register("ev", Scope::all(), "a", false, owner("p")).unwrap();
        let snap = reg.snapshot("ev");
        reg.remove(&a);
        reg.register("ev", Scope::all(), "b", false, owner("p")).unwrap();
        assert_eq!(names(&snap), vec!["a"]);
        assert_eq!(names(&reg.snapshot("ev")), vec!["b"]);
    }

    #[test]
    fn count_owned_by_fork() {
        let reg = HookRegistry::default();
        let other = HookOwner {
            fork: ForkId(2),
            plugin: Arc::from("q"),
        };
        reg.register("a", Scope::all(), "x", false, owner("p")).unwrap();
        reg.register("b", Scope::all(), "y", true, owner("p")).unwrap();
        reg.register("b", Scope::all(), "z", false, other).unwrap();
        assert_eq!(reg.count_owned_by(ForkId(1)), 2);
        assert_eq!(reg.count_owned_by(ForkId(2)), 1);
        assert_eq!(reg.len(), 3);
    }
}
