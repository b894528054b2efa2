//! Scope algebra: immutable selectors over sessions.
//!
//! A [`Scope`] decides which sessions a plugin or listener applies to. It
//! selects on three axes -- conversation kind, platform, and the session's
//! subject id (user for private chats, group for group chats) -- and
//! supports union, intersection, difference and inversion.
//!
//! # Canonical form
//!
//! For every [`SessionKind`] a scope stores a *platform table*: a default
//! id set plus per-platform overrides. Each id set is either finite
//! (`Only`) or cofinite (`AllExcept`), so negation never needs a separate
//! flag. Overrides equal to the default are dropped. Every boolean
//! operation is applied pointwise, which keeps the form closed and
//! canonical: two scopes are equal exactly when they select the same
//! sessions.
//!
//! Operations whose result equals one of their operands return that operand
//! itself, so `a.difference(&Scope::empty())` is pointer-equal to `a`.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use chorus_types::session::{Session, SessionKind};

const KIND_COUNT: usize = SessionKind::ALL.len();

/// A finite or cofinite set of subject ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum IdSet {
    Only(BTreeSet<String>),
    AllExcept(BTreeSet<String>),
}

impl IdSet {
    fn none() -> Self {
        IdSet::Only(BTreeSet::new())
    }

    fn any() -> Self {
        IdSet::AllExcept(BTreeSet::new())
    }

    fn contains(&self, id: &str) -> bool {
        match self {
            IdSet::Only(ids) => ids.contains(id),
            IdSet::AllExcept(ids) => !ids.contains(id),
        }
    }

    fn complement(&self) -> Self {
        match self {
            IdSet::Only(ids) => IdSet::AllExcept(ids.clone()),
            IdSet::AllExcept(ids) => IdSet::Only(ids.clone()),
        }
    }

    fn union(&self, other: &Self) -> Self {
        match (self, other) {
            (IdSet::Only(a), IdSet::Only(b)) => IdSet::Only(a.union(b).cloned().collect()),
            (IdSet::Only(a), IdSet::AllExcept(b)) | (IdSet::AllExcept(b), IdSet::Only(a)) => {
                IdSet::AllExcept(b.difference(a).cloned().collect())
            }
            (IdSet::AllExcept(a), IdSet::AllExcept(b)) => {
                IdSet::AllExcept(a.intersection(b).cloned().collect())
            }
        }
    }

    fn intersect(&self, other: &Self) -> Self {
        match (self, other) {
            (IdSet::Only(a), IdSet::Only(b)) => {
                IdSet::Only(a.intersection(b).cloned().collect())
            }
            (IdSet::Only(a), IdSet::AllExcept(b)) | (IdSet::AllExcept(b), IdSet::Only(a)) => {
                IdSet::Only(a.difference(b).cloned().collect())
            }
            (IdSet::AllExcept(a), IdSet::AllExcept(b)) => {
                IdSet::AllExcept(a.union(b).cloned().collect())
            }
        }
    }

    fn is_none(&self) -> bool {
        matches!(self, IdSet::Only(ids) if ids.is_empty())
    }

    fn is_any(&self) -> bool {
        matches!(self, IdSet::AllExcept(ids) if ids.is_empty())
    }
}

impl fmt::Display for IdSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |ids: &BTreeSet<String>| ids.iter().cloned().collect::<Vec<_>>().join(",");
        match self {
            _ if self.is_any() => f.write_str("*"),
            IdSet::Only(ids) => write!(f, "{{{}}}", join(ids)),
            IdSet::AllExcept(ids) => write!(f, "*-{{{}}}", join(ids)),
        }
    }
}

/// Id sets for one conversation kind, keyed by platform.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PlatformTable {
    default: IdSet,
    overrides: BTreeMap<String, IdSet>,
}

impl PlatformTable {
    fn uniform(set: IdSet) -> Self {
        Self {
            default: set,
            overrides: BTreeMap::new(),
        }
    }

    fn lookup(&self, platform: &str) -> &IdSet {
        self.overrides.get(platform).unwrap_or(&self.default)
    }

    fn map(&self, op: impl Fn(&IdSet) -> IdSet) -> Self {
        let default = op(&self.default);
        let overrides = self
            .overrides
            .iter()
            .map(|(platform, set)| (platform.clone(), op(set)))
            .filter(|(_, set)| *set != default)
            .collect();
        Self { default, overrides }
    }

    fn combine(&self, other: &Self, op: impl Fn(&IdSet, &IdSet) -> IdSet) -> Self {
        let default = op(&self.default, &other.default);
        let platforms: BTreeSet<&String> = self
            .overrides
            .keys()
            .chain(other.overrides.keys())
            .collect();
        let overrides = platforms
            .into_iter()
            .map(|platform| {
                let set = op(self.lookup(platform), other.lookup(platform));
                (platform.clone(), set)
            })
            .filter(|(_, set)| *set != default)
            .collect();
        Self { default, overrides }
    }

    fn is_none(&self) -> bool {
        self.default.is_none() && self.overrides.is_empty()
    }

    fn is_any(&self) -> bool {
        self.default.is_any() && self.overrides.is_empty()
    }
}

#[derive(Debug, PartialEq, Eq, Hash)]
struct ScopeRepr {
    kinds: [PlatformTable; KIND_COUNT],
}

/// An immutable, canonical selector over sessions.
///
/// Cloning is cheap (an `Arc` bump). Equality is structural on the
/// canonical form; [`Scope::ptr_eq`] tests identity.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Scope(Arc<ScopeRepr>);

impl Scope {
    fn from_tables(kinds: [PlatformTable; KIND_COUNT]) -> Self {
        Scope(Arc::new(ScopeRepr { kinds }))
    }

    fn per_kind(f: impl Fn(SessionKind) -> PlatformTable) -> Self {
        Self::from_tables(SessionKind::ALL.map(f))
    }

    /// Every session.
    pub fn all() -> Self {
        Self::per_kind(|_| PlatformTable::uniform(IdSet::any()))
    }

    /// No session.
    pub fn empty() -> Self {
        Self::per_kind(|_| PlatformTable::uniform(IdSet::none()))
    }

    /// Sessions of one conversation kind, on any platform.
    pub fn by_kind(kind: SessionKind) -> Self {
        Self::by_kind_ids(kind, std::iter::empty::<String>())
    }

    /// Private sessions with the given users.
    ///
    /// With no ids this selects every private session.
    pub fn by_user<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::by_kind_ids(SessionKind::Private, ids)
    }

    /// Group sessions in the given groups.
    ///
    /// With no ids this selects every group session.
    pub fn by_group<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::by_kind_ids(SessionKind::Group, ids)
    }

    fn by_kind_ids<I, S>(kind: SessionKind, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let ids: BTreeSet<String> = ids.into_iter().map(Into::into).collect();
        let selected = if ids.is_empty() {
            IdSet::any()
        } else {
            IdSet::Only(ids)
        };
        Self::per_kind(|k| {
            if k == kind {
                PlatformTable::uniform(selected.clone())
            } else {
                PlatformTable::uniform(IdSet::none())
            }
        })
    }

    /// Sessions from one platform, of any kind.
    ///
    /// An empty platform name means "any platform".
    pub fn by_platform(platform: impl Into<String>) -> Self {
        let platform = platform.into();
        if platform.is_empty() {
            return Self::all();
        }
        Self::per_kind(|_| PlatformTable {
            default: IdSet::none(),
            overrides: BTreeMap::from([(platform.clone(), IdSet::any())]),
        })
    }

    /// Every session whose subject id is not one of `ids`.
    pub fn except_subjects<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let ids: BTreeSet<String> = ids.into_iter().map(Into::into).collect();
        Self::per_kind(|_| PlatformTable::uniform(IdSet::AllExcept(ids.clone())))
    }

    /// Whether `a` and `b` are the same object.
    pub fn ptr_eq(a: &Scope, b: &Scope) -> bool {
        Arc::ptr_eq(&a.0, &b.0)
    }

    /// Whether this scope selects no session at all.
    pub fn is_empty(&self) -> bool {
        self.0.kinds.iter().all(PlatformTable::is_none)
    }

    /// Whether this scope selects every session.
    pub fn is_all(&self) -> bool {
        self.0.kinds.iter().all(PlatformTable::is_any)
    }

    /// Whether `session` falls inside this scope.
    pub fn contains(&self, session: &Session) -> bool {
        self.0.kinds[session.kind.index()]
            .lookup(&session.platform)
            .contains(session.subject_id())
    }

    /// Whether every session selected by `self` is also selected by `other`.
    pub fn is_subset(&self, other: &Scope) -> bool {
        self.difference(other).is_empty()
    }

    /// Sessions selected by either scope.
    pub fn union(&self, other: &Scope) -> Scope {
        if Scope::ptr_eq(self, other) || other.is_empty() || self.is_all() {
            return self.clone();
        }
        if self.is_empty() || other.is_all() {
            return other.clone();
        }
        self.combine(other, IdSet::union)
    }

    /// Sessions selected by both scopes.
    pub fn intersect(&self, other: &Scope) -> Scope {
        if Scope::ptr_eq(self, other) || other.is_all() || self.is_empty() {
            return self.clone();
        }
        if self.is_all() || other.is_empty() {
            return other.clone();
        }
        self.combine(other, IdSet::intersect)
    }

    /// Sessions selected by `self` but not by `other`.
    pub fn difference(&self, other: &Scope) -> Scope {
        if other.is_empty() || self.is_empty() {
            return self.clone();
        }
        self.combine(other, |a, b| a.intersect(&b.complement()))
    }

    /// Sessions not selected by `self`.
    pub fn invert(&self) -> Scope {
        Self::from_tables(
            std::array::from_fn(|i| self.0.kinds[i].map(IdSet::complement)),
        )
    }

    fn combine(&self, other: &Scope, op: impl Fn(&IdSet, &IdSet) -> IdSet) -> Scope {
        let result = Self::from_tables(std::array::from_fn(|i| {
            self.0.kinds[i].combine(&other.0.kinds[i], &op)
        }));
        if result == *self {
            self.clone()
        } else if result == *other {
            other.clone()
        } else {
            result
        }
    }
}

impl Default for Scope {
    fn default() -> Self {
        Self::all()
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Scope({self})")
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_all() {
            return f.write_str("all");
        }
        if self.is_empty() {
            return f.write_str("none");
        }
        let mut first = true;
        for kind in SessionKind::ALL {
            let table = &self.0.kinds[kind.index()];
            if table.is_none() {
                continue;
            }
            if !first {
                f.write_str(" | ")?;
            }
            first = false;
            write!(f, "{kind}:{}", table.default)?;
            for (platform, set) in &table.overrides {
                write!(f, " {platform}={set}")?;
            }
        }
        Ok(())
    }
}
