//! The monomorphized intermediate representation consumed by the analysis.
//!
//! Every clazz here is fully specialized: generics are already expanded, and dynamic dispatch is
//! reduced to per-site tables of `(target clazz, callee clazz)` pairs. The analysis never has to
//! consult source-level types; it only walks this graph.

use id_collections::{id_type, IdVec};
use std::collections::BTreeMap;

#[id_type]
pub struct ClazzId(pub usize);

#[id_type]
pub struct SiteId(pub usize);

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ClazzKind {
    Routine,
    Field,
    Intrinsic,
    Abstract,
    Native,
    Choice,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum SpecialClazz {
    Unit,
    Bool,
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
    Str,
}

impl SpecialClazz {
    pub fn is_numeric(self) -> bool {
        use SpecialClazz::*;
        matches!(self, I8 | I16 | I32 | I64 | U8 | U16 | U32 | U64 | F32 | F64)
    }

    /// Width in bytes of this clazz's serialized constant form, if it has a fixed width.
    pub fn const_width(self) -> Option<usize> {
        use SpecialClazz::*;
        match self {
            Unit => Some(0),
            Bool => Some(1),
            I8 | U8 => Some(1),
            I16 | U16 => Some(2),
            I32 | U32 | F32 => Some(4),
            I64 | U64 | F64 => Some(8),
            Str => None,
        }
    }
}

/// How a routine's instance refers back to the instance it was called on.
#[derive(Clone, Copy, Debug)]
pub struct OuterRef {
    pub field: ClazzId,
    /// The outer instance is passed by address rather than by copy. Values reaching such a
    /// callee can be mutated or retained by it, which matters for escape tracking.
    pub is_adr: bool,
}

#[derive(Clone, Debug)]
pub struct ClazzDef {
    pub name: String,
    pub kind: ClazzKind,
    pub is_ref: bool,
    pub special: Option<SpecialClazz>,

    /// Argument fields of a routine, in declaration order.
    pub args: Vec<ClazzId>,
    pub result_clazz: Option<ClazzId>,
    pub outer: Option<ClazzId>,
    pub outer_ref: Option<OuterRef>,

    /// For a ref clazz, the corresponding value clazz.
    pub value_clazz: Option<ClazzId>,
    /// For a choice clazz, the variant clazzes in tag order.
    pub choice: Vec<ClazzId>,
    /// For an array clazz, the element clazz.
    pub array_elem: Option<ClazzId>,

    pub body: Vec<SiteId>,
    pub intrinsic: Option<String>,
    /// Extra clazz operand used by some intrinsics: the invoked routine for `effect.run` and
    /// `thread.spawn`, or the backing field for the atomic intrinsics.
    pub type_arg: Option<ClazzId>,

    /// A field holding the address of a value instance rather than a copy of it.
    pub adr_of_value: bool,
    /// Instances of this clazz are stack frames of a loop body and must not outlive their
    /// iteration unless the escape-permitting effect is installed.
    pub loop_block: bool,
}

impl ClazzDef {
    pub fn new(name: impl Into<String>, kind: ClazzKind) -> Self {
        ClazzDef {
            name: name.into(),
            kind,
            is_ref: false,
            special: None,
            args: Vec::new(),
            result_clazz: None,
            outer: None,
            outer_ref: None,
            value_clazz: None,
            choice: Vec::new(),
            array_elem: None,
            body: Vec::new(),
            intrinsic: None,
            type_arg: None,
            adr_of_value: false,
            loop_block: false,
        }
    }
}

#[derive(Clone, Debug)]
pub struct MatchCase {
    /// Choice tags this case handles.
    pub tags: Vec<u32>,
    /// Field receiving the untagged payload, if the case binds one.
    pub field: Option<ClazzId>,
    pub body: Vec<SiteId>,
}

#[derive(Clone, Debug)]
pub enum Op {
    /// The instance of the enclosing routine call.
    Current,
    /// The target the enclosing routine was called on.
    Outer,
    /// The i'th argument of the enclosing routine call.
    Arg(usize),
    /// A serialized compile-time constant.
    Const(Vec<u8>),
    Call {
        target: SiteId,
        args: Vec<SiteId>,
    },
    Assign {
        target: SiteId,
        value: SiteId,
    },
    /// Box a value instance into its ref clazz.
    Box {
        value: SiteId,
    },
    /// Wrap a value into a choice variant.
    Tag {
        value: SiteId,
        tag: u32,
    },
    Match {
        subject: SiteId,
        cases: Vec<MatchCase>,
    },
    /// Read the innermost installed handler for the effect clazz given by the site's result
    /// clazz.
    EffectRead,
}

#[derive(Clone, Debug)]
pub struct SiteDef {
    pub op: Op,
    pub result_clazz: ClazzId,

    /// Dispatch table for `Call`/`Assign` sites: for each possible target clazz, the callee
    /// clazz invoked on it.
    pub accessed: Vec<(ClazzId, ClazzId)>,
    /// Static clazz of the access target, used to resolve unit-valued targets.
    pub target_clazz: Option<ClazzId>,
    /// Statically named callee of an access, before dispatch.
    pub callee: Option<ClazzId>,
}

/// Shape of a serialized constant, derived from its clazz.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConstShape {
    Bool,
    Num,
    Str,
    ArrayOf(ClazzId),
    Aggregate,
}

#[derive(Clone, Debug)]
pub struct Ir {
    pub clazzes: IdVec<ClazzId, ClazzDef>,
    pub sites: IdVec<SiteId, SiteDef>,
    pub site_owner: IdVec<SiteId, ClazzId>,
    pub main: ClazzId,
    pub special: BTreeMap<SpecialClazz, ClazzId>,
    /// Effect clazz which, when installed, permits loop-block instances to escape their
    /// iteration.
    pub loop_allow_escape: Option<ClazzId>,
}

impl Ir {
    pub fn clazz(&self, id: ClazzId) -> &ClazzDef {
        &self.clazzes[id]
    }

    pub fn site(&self, id: SiteId) -> &SiteDef {
        &self.sites[id]
    }

    pub fn special_of(&self, special: SpecialClazz) -> Option<ClazzId> {
        self.special.get(&special).copied()
    }

    pub fn is_numeric(&self, id: ClazzId) -> bool {
        self.clazzes[id].special.is_some_and(|s| s.is_numeric())
    }

    pub fn is_bool(&self, id: ClazzId) -> bool {
        self.clazzes[id].special == Some(SpecialClazz::Bool)
    }

    pub fn is_unit(&self, id: ClazzId) -> bool {
        self.clazzes[id].special == Some(SpecialClazz::Unit)
    }

    /// The value clazz underlying `id`: the clazz itself unless it is a ref.
    pub fn as_value(&self, id: ClazzId) -> ClazzId {
        self.clazzes[id].value_clazz.unwrap_or(id)
    }

    pub fn const_shape(&self, id: ClazzId) -> ConstShape {
        let def = &self.clazzes[id];
        match def.special {
            Some(SpecialClazz::Bool) => ConstShape::Bool,
            Some(SpecialClazz::Str) => ConstShape::Str,
            Some(s) if s.is_numeric() => ConstShape::Num,
            _ => match def.array_elem {
                Some(elem) => ConstShape::ArrayOf(elem),
                None => ConstShape::Aggregate,
            },
        }
    }
}

/// Byte cursor over a serialized constant. All multi-byte quantities are little endian.
pub struct ConstReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> ConstReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        ConstReader { bytes, pos: 0 }
    }

    pub fn read_bytes(&mut self, count: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(count)?;
        let slice = self.bytes.get(self.pos..end)?;
        self.pos = end;
        Some(slice)
    }

    pub fn read_u32(&mut self) -> Option<u32> {
        let bytes = self.read_bytes(4)?;
        Some(u32::from_le_bytes(bytes.try_into().ok()?))
    }

    pub fn at_end(&self) -> bool {
        self.pos == self.bytes.len()
    }
}

/// Incremental construction of an [`Ir`], mainly for tests and front end glue.
#[derive(Clone, Debug)]
pub struct Builder {
    clazzes: IdVec<ClazzId, ClazzDef>,
    sites: IdVec<SiteId, SiteDef>,
    site_owner: IdVec<SiteId, ClazzId>,
    special: BTreeMap<SpecialClazz, ClazzId>,
    loop_allow_escape: Option<ClazzId>,
}

impl Builder {
    pub fn new() -> Self {
        Builder {
            clazzes: IdVec::new(),
            sites: IdVec::new(),
            site_owner: IdVec::new(),
            special: BTreeMap::new(),
            loop_allow_escape: None,
        }
    }

    pub fn clazz(&mut self, name: &str, kind: ClazzKind) -> ClazzId {
        self.clazzes.push(ClazzDef::new(name, kind))
    }

    pub fn clazz_mut(&mut self, id: ClazzId) -> &mut ClazzDef {
        &mut self.clazzes[id]
    }

    pub fn special(&mut self, id: ClazzId, special: SpecialClazz) {
        self.clazzes[id].special = Some(special);
        self.special.insert(special, id);
    }

    pub fn site(&mut self, owner: ClazzId, op: Op, result_clazz: ClazzId) -> SiteId {
        let id = self.sites.push(SiteDef {
            op,
            result_clazz,
            accessed: Vec::new(),
            target_clazz: None,
            callee: None,
        });
        let owner_id = self.site_owner.push(owner);
        debug_assert_eq!(id, owner_id);
        id
    }

    pub fn site_mut(&mut self, id: SiteId) -> &mut SiteDef {
        &mut self.sites[id]
    }

    pub fn set_body(&mut self, owner: ClazzId, body: Vec<SiteId>) {
        self.clazzes[owner].body = body;
    }

    pub fn set_loop_allow_escape(&mut self, effect: ClazzId) {
        self.loop_allow_escape = Some(effect);
    }

    pub fn finish(self, main: ClazzId) -> Ir {
        Ir {
            clazzes: self.clazzes,
            sites: self.sites,
            site_owner: self.site_owner,
            main,
            special: self.special,
            loop_allow_escape: self.loop_allow_escape,
        }
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}
