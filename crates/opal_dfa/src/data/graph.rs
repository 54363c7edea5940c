//! Nodes of the memoized call graph: calls, effect environments, instances, and per-site state.

use crate::data::ir::{ClazzId, SiteId};
use crate::data::value::ValueId;
use id_collections::id_type;
use std::collections::BTreeSet;

#[id_type]
pub struct CallId(pub usize);

#[id_type]
pub struct EnvId(pub usize);

/// Identity of an abstract instance. Instances created at different sites, or for different
/// calls, stay distinct so that field contents do not bleed between unrelated allocations.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InstanceKey {
    pub clazz: ClazzId,
    pub site: Option<SiteId>,
    pub context: Option<CallId>,
}

/// Memoization key of a call node. Two calls with equal keys are the same node; the creation
/// context deliberately stays out of the key, otherwise recursion would unfold forever.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CallKey {
    pub clazz: ClazzId,
    pub site: Option<SiteId>,
    pub target: ValueId,
    pub args: Vec<ValueId>,
    pub env: Option<EnvId>,
}

#[derive(Clone, Debug)]
pub struct CallData {
    pub key: CallKey,
    /// The `current` instance, for routine calls.
    pub instance: Option<ValueId>,
    /// Join of all results observed so far. `None` until the call has been seen to return.
    pub result: Option<ValueId>,
    pub returns: bool,
    /// Call that first created this node. Not part of the identity; kept for diagnostics so a
    /// why-chain back to the entry point can be printed.
    pub context: Option<CallId>,
}

/// Memoization key of an effect environment: one installed handler on top of a parent chain.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EnvKey {
    pub parent: Option<EnvId>,
    pub effect: ClazzId,
    pub handler: ValueId,
}

#[derive(Clone, Debug)]
pub struct EnvData {
    pub key: EnvKey,
    /// Current handler value. Starts at `key.handler` and only grows, as `effect.replace`
    /// joins new handlers in.
    pub handler: ValueId,
    pub owner: CallId,
}

/// Facts accumulated about one code site across all calls that execute it.
#[derive(Clone, Debug, Default)]
pub struct SiteState {
    /// Callee clazzes actually invoked at this access site.
    pub accessed: BTreeSet<ClazzId>,
    recorded: bool,
    may_return: bool,
}

impl SiteState {
    pub fn record_result(&mut self, returns: bool) {
        self.recorded = true;
        self.may_return |= returns;
    }

    /// True when the site was executed at least once and never produced a result.
    pub fn always_diverges(&self) -> bool {
        self.recorded && !self.may_return
    }
}
