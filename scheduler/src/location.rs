//! Memory Locations and Kill Sets
//!
//! A [`LocationTag`] names an aliasing class of memory. Operations that
//! overwrite memory carry a [`MemoryEffect`]; the union of effects seen while
//! scanning some code is accumulated in a [`KillSet`].

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;

/// Alias class of a memory region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LocationTag {
    /// Aliases with every other location, including itself
    Any,

    /// A mutable alias class
    Mutable(u32),

    /// An alias class that is never written after initialization
    Immutable(u32),
}

impl LocationTag {
    /// Check if this is the universal `Any` tag
    pub fn is_any(self) -> bool {
        matches!(self, LocationTag::Any)
    }

    /// Reads of immutable locations are exempt from kill reasoning
    pub fn is_mutable(self) -> bool {
        !matches!(self, LocationTag::Immutable(_))
    }

    /// Two tags overlap iff they are equal or either is `Any`
    pub fn overlaps(self, other: LocationTag) -> bool {
        self == other || self.is_any() || other.is_any()
    }
}

impl fmt::Display for LocationTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LocationTag::Any => write!(f, "ANY"),
            LocationTag::Mutable(id) => write!(f, "L{}", id),
            LocationTag::Immutable(id) => write!(f, "final{}", id),
        }
    }
}

/// Memory effect descriptor of a pinned operation
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MemoryEffect {
    /// Does not write memory
    #[default]
    None,

    /// Overwrites a single location
    KillsSingle(LocationTag),

    /// Overwrites each of several locations
    KillsMulti(SmallVec<[LocationTag; 2]>),

    /// Overwrites everything (calls, safepoints, ...)
    KillsAll,
}

impl MemoryEffect {
    /// Whether this effect kills anything at all
    pub fn is_kill(&self) -> bool {
        !matches!(self, MemoryEffect::None)
    }

    /// Whether this effect invalidates reads of `location`
    pub fn kills(&self, location: LocationTag) -> bool {
        match self {
            MemoryEffect::None => false,
            MemoryEffect::KillsSingle(tag) => tag.overlaps(location),
            MemoryEffect::KillsMulti(tags) => tags.iter().any(|tag| tag.overlaps(location)),
            MemoryEffect::KillsAll => true,
        }
    }

    /// Locations named by this effect, for validation and dumps
    pub fn locations(&self) -> &[LocationTag] {
        match self {
            MemoryEffect::KillsSingle(tag) => std::slice::from_ref(tag),
            MemoryEffect::KillsMulti(tags) => tags.as_slice(),
            MemoryEffect::None | MemoryEffect::KillsAll => &[],
        }
    }
}

impl fmt::Display for MemoryEffect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryEffect::None => write!(f, "none"),
            MemoryEffect::KillsSingle(tag) => write!(f, "kills {}", tag),
            MemoryEffect::KillsMulti(tags) => {
                let names: Vec<String> = tags.iter().map(|t| t.to_string()).collect();
                write!(f, "kills {{{}}}", names.join(", "))
            }
            MemoryEffect::KillsAll => write!(f, "kills ANY"),
        }
    }
}

/// Set of location tags invalidated by some stretch of code.
///
/// Once a kill of `Any` is added the set collapses to [`KillSet::All`] and
/// absorbs every later addition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KillSet {
    Locations(SmallVec<[LocationTag; 4]>),
    All,
}

impl Default for KillSet {
    fn default() -> Self {
        KillSet::Locations(SmallVec::new())
    }
}

impl KillSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, KillSet::Locations(tags) if tags.is_empty())
    }

    pub fn is_all(&self) -> bool {
        matches!(self, KillSet::All)
    }

    /// Record a kill of `tag`
    pub fn insert(&mut self, tag: LocationTag) {
        match self {
            KillSet::All => {}
            KillSet::Locations(_) if tag.is_any() => *self = KillSet::All,
            KillSet::Locations(tags) => {
                if !tags.contains(&tag) {
                    tags.push(tag);
                }
            }
        }
    }

    /// Record every location killed by `effect`
    pub fn add_effect(&mut self, effect: &MemoryEffect) {
        match effect {
            MemoryEffect::None => {}
            MemoryEffect::KillsSingle(tag) => self.insert(*tag),
            MemoryEffect::KillsMulti(tags) => {
                for &tag in tags {
                    self.insert(tag);
                }
            }
            MemoryEffect::KillsAll => *self = KillSet::All,
        }
    }

    /// Whether a read of `location` would be invalidated by this set
    pub fn kills(&self, location: LocationTag) -> bool {
        match self {
            KillSet::All => true,
            KillSet::Locations(tags) => tags.iter().any(|tag| tag.overlaps(location)),
        }
    }
}

impl fmt::Display for KillSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KillSet::All => write!(f, "{{ANY}}"),
            KillSet::Locations(tags) => {
                let names: Vec<String> = tags.iter().map(|t| t.to_string()).collect();
                write!(f, "{{{}}}", names.join(", "))
            }
        }
    }
}
