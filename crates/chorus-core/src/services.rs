//! Service container -- named capabilities shared between plugins.
//!
//! A service is any `Send + Sync` value published under a name. Forks
//! declare which names they require (gating activation) and which they
//! use optionally. The container only keeps the records; the runtime
//! decides which forks to tear down and reactivate when a provider comes
//! or goes.

use std::any::Any;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use chorus_types::error::{Result, RuntimeError};

use crate::fork::ForkId;

/// A type-erased service value.
pub type ServiceHandle = Arc<dyn Any + Send + Sync>;

/// Identifies one `provide` call, so that a stale owner cannot remove a
/// newer provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProviderToken(u64);

#[derive(Clone)]
struct Provider {
    value: ServiceHandle,
    owner: Option<ForkId>,
    token: ProviderToken,
}

#[derive(Default)]
struct ServiceRecord {
    provider: Option<Provider>,
    required_by: BTreeSet<ForkId>,
    optional_by: BTreeSet<ForkId>,
    notify: BTreeSet<ForkId>,
}

impl ServiceRecord {
    fn is_unused(&self) -> bool {
        self.provider.is_none()
            && self.required_by.is_empty()
            && self.optional_by.is_empty()
    }
}

/// Forks affected by a change to one service.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Dependents {
    /// Forks that cannot run without the service.
    pub required: Vec<ForkId>,
    /// Optional users that asked to be reloaded on change.
    pub notify: Vec<ForkId>,
    /// Every optional user, reloaded or not.
    pub optional: Vec<ForkId>,
}

impl Dependents {
    /// Every affected fork, ascending and without duplicates.
    pub fn all(&self) -> Vec<ForkId> {
        let set: BTreeSet<ForkId> = self.required.iter().chain(&self.notify).copied().collect();
        set.into_iter().collect()
    }
}

/// Registry of named services and the forks that depend on them.
pub struct ServiceContainer {
    records: RwLock<HashMap<String, ServiceRecord>>,
    next_token: AtomicU64,
}

impl ServiceContainer {
    /// Create an empty container.
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            next_token: AtomicU64::new(1),
        }
    }

    /// Service names must be non-empty and free of whitespace.
    pub fn validate_name(name: &str) -> Result<()> {
        if name.is_empty() || name.chars().any(char::is_whitespace) {
            return Err(RuntimeError::InvalidServiceName(name.to_string()));
        }
        Ok(())
    }

    /// Record that `fork` cannot run without `name`.
    pub fn require(&self, fork: ForkId, name: &str) -> Result<()> {
        Self::validate_name(name)?;
        self.records
            .write()
            .entry(name.to_string())
            .or_default()
            .required_by
            .insert(fork);
        Ok(())
    }

    /// Record that `fork` uses `name` when present. With `notify`, the
    /// fork is reloaded whenever the provider changes.
    pub fn optional_use(&self, fork: ForkId, name: &str, notify: bool) -> Result<()> {
        Self::validate_name(name)?;
        let mut records = self.records.write();
        let record = records.entry(name.to_string()).or_default();
        record.optional_by.insert(fork);
        if notify {
            record.notify.insert(fork);
        }
        Ok(())
    }

    /// Forget every dependency of a disposed fork.
    pub fn release(&self, fork: ForkId) {
        let mut records = self.records.write();
        for record in records.values_mut() {
            record.required_by.remove(&fork);
            record.optional_by.remove(&fork);
            record.notify.remove(&fork);
        }
        records.retain(|_, r| !r.is_unused());
    }

    /// Whether a provider is currently registered under `name`.
    pub fn has(&self, name: &str) -> bool {
        self.records
            .read()
            .get(name)
            .is_some_and(|r| r.provider.is_some())
    }

    /// Whether every name in `names` has a provider.
    pub fn all_present(&self, names: &[String]) -> bool {
        let records = self.records.read();
        names
            .iter()
            .all(|n| records.get(n).is_some_and(|r| r.provider.is_some()))
    }

    /// The current provider of `name`, type-erased.
    pub fn get_any(&self, name: &str) -> Option<ServiceHandle> {
        self.records
            .read()
            .get(name)
            .and_then(|r| r.provider.as_ref())
            .map(|p| p.value.clone())
    }

    /// The current provider of `name`, if it is a `T`.
    pub fn get<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        self.get_any(name)?.downcast::<T>().ok()
    }

    /// The fork that registered the current provider of `name`.
    pub fn provider_owner(&self, name: &str) -> Option<ForkId> {
        self.records
            .read()
            .get(name)
            .and_then(|r| r.provider.as_ref())
            .and_then(|p| p.owner)
    }

    /// Whether `token` still identifies the current provider of `name`.
    pub fn is_current(&self, name: &str, token: ProviderToken) -> bool {
        self.records
            .read()
            .get(name)
            .and_then(|r| r.provider.as_ref())
            .is_some_and(|p| p.token == token)
    }

    /// Forks affected by a change to `name`.
    pub fn dependents(&self, name: &str) -> Dependents {
        self.records
            .read()
            .get(name)
            .map(|r| Dependents {
                required: r.required_by.iter().copied().collect(),
                notify: r.notify.iter().copied().collect(),
                optional: r.optional_by.iter().copied().collect(),
            })
            .unwrap_or_default()
    }

    /// Replace the provider of `name`. `None` removes it.
    ///
    /// Does not touch dependents; the runtime tears them down first.
    pub(crate) fn set_provider(
        &self,
        name: &str,
        provider: Option<(ServiceHandle, Option<ForkId>)>,
    ) -> Option<ProviderToken> {
        let mut records = self.records.write();
        let record = records.entry(name.to_string()).or_default();
        record.provider = provider.map(|(value, owner)| Provider {
            value,
            owner,
            token: ProviderToken(self.next_token.fetch_add(1, Ordering::Relaxed)),
        });
        let token = record.provider.as_ref().map(|p| p.token);
        if record.is_unused() {
            records.remove(name);
        }
        token
    }

    /// Names that currently have a provider, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .records
            .read()
            .iter()
            .filter(|(_, r)| r.provider.is_some())
            .map(|(n, _)| n.clone())
            .collect();
        names.sort();
        names
    }
}

impl Default for ServiceContainer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Database {
        url: String,
    }

    fn db(url: &str) -> ServiceHandle {
        Arc::new(Database { url: url.into() })
    }

    #[test]
    fn name_validation() {
        assert!(ServiceContainer::validate_name("database").is_ok());
        assert!(ServiceContainer::validate_name("bot:telegram").is_ok());
        for bad in ["", "data base", "tab\tname"] {
            let err = ServiceContainer::validate_name(bad).unwrap_err();
            assert!(matches!(err, RuntimeError::InvalidServiceName(_)));
        }
    }

    #[test]
    fn typed_lookup() {
        let services = ServiceContainer::new();
        assert!(!services.has("database"));
        services.set_provider("database", Some((db("sqlite://"), None)));

        assert!(services.has("database"));
        let got = services.get::<Database>("database").unwrap();
        assert_eq!(got.url, "sqlite://");
        assert!(services.get::<String>("database").is_none());
        assert!(services.get::<Database>("cache").is_none());
        assert_eq!(services.names(), vec!["database"]);
    }

    #[test]
    fn all_present_requires_every_name() {
        let services = ServiceContainer::new();
        let names = vec!["a".to_string(), "b".to_string()];
        assert!(services.all_present(&[]));
        services.set_provider("a", Some((db("x"), None)));
        assert!(!services.all_present(&names));
        services.set_provider("b", Some((db("y"), None)));
        assert!(services.all_present(&names));
    }

    #[test]
    fn tokens_track_the_current_provider() {
        let services = ServiceContainer::new();
        let first = services
            .set_provider("database", Some((db("one"), Some(ForkId(3)))))
            .unwrap();
        assert!(services.is_current("database", first));
        assert_eq!(services.provider_owner("database"), Some(ForkId(3)));

        let second = services
            .set_provider("database", Some((db("two"), None)))
            .unwrap();
        assert!(!services.is_current("database", first));
        assert!(services.is_current("database", second));
        assert_eq!(services.provider_owner("database"), None);

        assert_eq!(services.set_provider("database", None), None);
        assert!(!services.is_current("database", second));
        assert!(!services.has("database"));
    }

    #[test]
    fn dependents_and_release() {
        let services = ServiceContainer::new();
        services.require(ForkId(1), "database").unwrap();
        services.require(ForkId(2), "database").unwrap();
        services.optional_use(ForkId(3), "database", true).unwrap();
        services.optional_use(ForkId(4), "database", false).unwrap();

        let deps = services.dependents("database");
        assert_eq!(deps.required, vec![ForkId(1), ForkId(2)]);
        assert_eq!(deps.notify, vec![ForkId(3)]);
        assert_eq!(deps.optional, vec![ForkId(3), ForkId(4)]);
        assert_eq!(deps.all(), vec![ForkId(1), ForkId(2), ForkId(3)]);

        services.release(ForkId(1));
        services.release(ForkId(3));
        let deps = services.dependents("database");
        assert_eq!(deps.required, vec![ForkId(2)]);
        assert!(deps.notify.is_empty());
        assert_eq!(deps.optional, vec![ForkId(4)]);
    }

    #[test]
    fn invalid_names_rejected_on_declaration() {
        let services = ServiceContainer::new();
        assert!(services.require(ForkId(1), "").is_err());
        assert!(services.optional_use(ForkId(1), "a b", false).is_err());
    }
}
