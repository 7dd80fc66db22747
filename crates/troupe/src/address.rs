//! Actor addresses and the factory that allocates them

use dashmap::DashMap;
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

/// Identifier reserved for the sentinel address
const NONE_ID: u64 = 0;

/// Process-unique identity of an actor.
///
/// Equality, ordering and hashing consider only the numeric id; the optional
/// name is for humans and logs.
#[derive(Clone)]
pub struct Address {
    id: u64,
    name: Option<Arc<str>>,
}

impl Address {
    /// The sentinel address, parent of root actors
    pub fn none() -> Self {
        Self {
            id: NONE_ID,
            name: None,
        }
    }

    /// Numeric identity
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Optional human-readable name
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Whether this is the sentinel address
    pub fn is_none(&self) -> bool {
        self.id == NONE_ID
    }
}

impl PartialEq for Address {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Address {}

impl Hash for Address {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl PartialOrd for Address {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Address {
    fn cmp(&self, other: &Self) -> Ordering {
        self.id.cmp(&other.id)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{}#{}", name, self.id),
            None => write!(f, "#{}", self.id),
        }
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({self})")
    }
}

/// Allocates addresses for a single stage
#[derive(Debug)]
pub struct AddressFactory {
    next_id: AtomicU64,
    named: DashMap<String, Address>,
}

impl AddressFactory {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(NONE_ID + 1),
            named: DashMap::new(),
        }
    }

    fn allocate(&self) -> u64 {
        self.next_id.fetch_add(1, AtomicOrdering::Relaxed)
    }

    /// A fresh anonymous address
    pub fn unique(&self) -> Address {
        Address {
            id: self.allocate(),
            name: None,
        }
    }

    /// A fresh address carrying a name; names are not required to be unique
    pub fn unique_with(&self, name: impl Into<String>) -> Address {
        let name: String = name.into();
        Address {
            id: self.allocate(),
            name: Some(Arc::from(name)),
        }
    }

    /// The stable address for `name`; the same name yields the same address
    pub fn named(&self, name: impl Into<String>) -> Address {
        let name: String = name.into();
        self.named
            .entry(name.clone())
            .or_insert_with(|| Address {
                id: self.allocate(),
                name: Some(Arc::from(name.as_str())),
            })
            .clone()
    }

    /// Rebuild an address from an id previously handed out
    pub fn from_id(&self, id: u64, name: Option<&str>) -> Address {
        Address {
            id,
            name: name.map(Arc::from),
        }
    }

    pub fn none(&self) -> Address {
        Address::none()
    }

    /// Peek at the id the next allocation will use
    pub fn testing_next_id(&self) -> u64 {
        self.next_id.load(AtomicOrdering::Relaxed)
    }
}

impl Default for AddressFactory {
    fn default() -> Self {
        Self::new()
    }
}
