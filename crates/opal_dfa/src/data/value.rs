//! The abstract value domain.
//!
//! Values are interned: a [`ValueId`] stands for exactly one structural value, so two sites
//! computing equal abstractions share one id and growth of any set of values is detectable by id
//! comparison. The domain is deliberately coarse where it must be for termination: numerics and
//! strings collapse to their clazz, booleans to a three point lattice, and arrays to one
//! abstract cell per array clazz.

use crate::data::ir::{ClazzId, SiteId};
use id_collections::id_type;
use std::collections::BTreeSet;

#[id_type]
pub struct ValueId(pub usize);

#[id_type]
pub struct InstanceId(pub usize);

#[id_type]
pub struct ArrayId(pub usize);

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BoolLattice {
    True,
    False,
    Either,
}

impl BoolLattice {
    pub fn from_bool(b: bool) -> Self {
        if b {
            BoolLattice::True
        } else {
            BoolLattice::False
        }
    }

    pub fn join(self, other: Self) -> Self {
        if self == other {
            self
        } else {
            BoolLattice::Either
        }
    }

    pub fn negate(self) -> Self {
        match self {
            BoolLattice::True => BoolLattice::False,
            BoolLattice::False => BoolLattice::True,
            BoolLattice::Either => BoolLattice::Either,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Value {
    Unit,
    /// Bottom: no value has been observed here yet.
    Undefined,
    /// Any value of the given numeric clazz.
    Numeric(ClazzId),
    Bool(BoolLattice),
    Instance(InstanceId),
    /// A choice value carrying a known tag.
    Tagged {
        choice: ClazzId,
        tag: u32,
        inner: ValueId,
    },
    Array(ArrayId),
    /// A value instance boxed into its ref clazz.
    Boxed {
        value_clazz: ClazzId,
        ref_clazz: ClazzId,
        inner: ValueId,
    },
    /// Join of structurally distinct values. Members are never themselves unions.
    Union(BTreeSet<ValueId>),
}

/// One abstract array cell per array clazz. Reads see the join of everything ever written to
/// any array of that clazz; index positions are not distinguished.
#[derive(Clone, Debug)]
pub struct ArrayData {
    pub clazz: ClazzId,
    pub elem_clazz: ClazzId,
    pub elems: ValueId,
}

/// Where a value is embedded, when it lives inside something else rather than standing alone.
/// Used to detect values whose storage must outlive the expression that produced them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Embedding {
    /// The value is the temporary result of this site.
    pub site: Option<SiteId>,
    /// The value is stored inline in a field of this instance.
    pub owner: Option<InstanceId>,
}

/// An abstract value together with its embedding, as it flows through a routine body. Only the
/// `value` part is interned; the embedding is positional bookkeeping local to each use.
#[derive(Clone, Copy, Debug)]
pub struct Val {
    pub value: ValueId,
    pub embedding: Option<Embedding>,
}

impl Val {
    pub fn plain(value: ValueId) -> Self {
        Val {
            value,
            embedding: None,
        }
    }

    pub fn at_site(value: ValueId, site: SiteId) -> Self {
        Val {
            value,
            embedding: Some(Embedding {
                site: Some(site),
                owner: None,
            }),
        }
    }

    pub fn in_instance(value: ValueId, owner: InstanceId) -> Self {
        Val {
            value,
            embedding: Some(Embedding {
                site: None,
                owner: Some(owner),
            }),
        }
    }
}
