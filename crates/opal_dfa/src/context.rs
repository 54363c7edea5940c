//! Mutable state of one analysis run: the interned value domain, the memoized call graph, and
//! every fact set accumulated toward the fixpoint.
//!
//! All growth funnels through [`AnalysisContext::set_changed`]. The fixpoint driver re-runs
//! iterations until an entire pass leaves `changed` false.

use crate::analyze;
use crate::data::graph::{
    CallData, CallId, CallKey, EnvData, EnvId, EnvKey, InstanceKey, SiteState,
};
use crate::data::ir::{ClazzDef, ClazzId, ClazzKind, Ir, SiteDef, SiteId, SpecialClazz};
use crate::data::value::{ArrayData, ArrayId, BoolLattice, InstanceId, Value, ValueId};
use crate::diagnostics::{Diagnostic, Fatal};
use crate::intrinsics::{self, Intrinsics};
use id_collections::IdVec;
use opal_common::config::AnalysisOptions;
use opal_common::util::intern::Interner;
use std::collections::{BTreeMap, BTreeSet};

pub struct AnalysisContext<'ir> {
    pub(crate) ir: &'ir Ir,
    pub(crate) options: AnalysisOptions,
    pub(crate) intrinsics: Intrinsics,

    values: Interner<Value, ValueId>,
    instances: Interner<InstanceKey, InstanceId>,
    pub(crate) instance_fields: IdVec<InstanceId, BTreeMap<ClazzId, ValueId>>,
    arrays: BTreeMap<ClazzId, ArrayId>,
    pub(crate) array_data: IdVec<ArrayId, ArrayData>,
    calls: Interner<CallKey, CallId>,
    pub(crate) call_data: IdVec<CallId, CallData>,
    envs: Interner<EnvKey, EnvId>,
    pub(crate) env_data: IdVec<EnvId, EnvData>,

    pub(crate) sites: BTreeMap<SiteId, SiteState>,
    pub(crate) pending: BTreeSet<CallId>,

    pub(crate) changed: bool,
    changed_by: Option<String>,

    pub(crate) written_fields: BTreeSet<ClazzId>,
    pub(crate) read_fields: BTreeSet<ClazzId>,
    pub(crate) escapes: BTreeMap<ClazzId, Option<SiteId>>,
    pub(crate) escaped_results: BTreeSet<SiteId>,
    pub(crate) default_effects: BTreeMap<ClazzId, ValueId>,
    pub(crate) default_effect_contexts: BTreeMap<ClazzId, CallId>,
    pub(crate) missing_effects: BTreeSet<ClazzId>,
    /// Dispatch failures seen during analysis, keyed by (target clazz, static callee). Turned
    /// into diagnostics once the fixpoint is reached, since an early iteration may see a
    /// dispatch table that later iterations complete.
    pub(crate) abstract_missing: BTreeMap<(ClazzId, ClazzId), Option<SiteId>>,
    pub(crate) used_intrinsics: BTreeSet<String>,

    pub(crate) diagnostics: BTreeSet<Diagnostic>,
    /// Set for the final pass, after convergence: diagnostics are only trustworthy once the
    /// model has stopped growing.
    pub(crate) report_results: bool,
    pub(crate) iterations: usize,

    /// Clazzes currently being analyzed eagerly, to bound recursion when new calls are
    /// analyzed at interning time instead of waiting for the next iteration.
    eager_stack: Vec<ClazzId>,

    unit: ValueId,
    undefined: ValueId,
    true_: ValueId,
    false_: ValueId,
    either: ValueId,
}

impl<'ir> AnalysisContext<'ir> {
    pub fn new(options: &AnalysisOptions, ir: &'ir Ir) -> Self {
        let mut values = Interner::new();
        let (unit, _) = values.intern(Value::Unit);
        let (undefined, _) = values.intern(Value::Undefined);
        let (true_, _) = values.intern(Value::Bool(BoolLattice::True));
        let (false_, _) = values.intern(Value::Bool(BoolLattice::False));
        let (either, _) = values.intern(Value::Bool(BoolLattice::Either));
        AnalysisContext {
            ir,
            options: options.clone(),
            intrinsics: intrinsics::build_intrinsics(),
            values,
            instances: Interner::new(),
            instance_fields: IdVec::new(),
            arrays: BTreeMap::new(),
            array_data: IdVec::new(),
            calls: Interner::new(),
            call_data: IdVec::new(),
            envs: Interner::new(),
            env_data: IdVec::new(),
            sites: BTreeMap::new(),
            pending: BTreeSet::new(),
            changed: false,
            changed_by: None,
            written_fields: BTreeSet::new(),
            read_fields: BTreeSet::new(),
            escapes: BTreeMap::new(),
            escaped_results: BTreeSet::new(),
            default_effects: BTreeMap::new(),
            default_effect_contexts: BTreeMap::new(),
            missing_effects: BTreeSet::new(),
            abstract_missing: BTreeMap::new(),
            used_intrinsics: BTreeSet::new(),
            diagnostics: BTreeSet::new(),
            report_results: false,
            iterations: 0,
            eager_stack: Vec::new(),
            unit,
            undefined,
            true_,
            false_,
            either,
        }
    }

    pub fn clazz(&self, id: ClazzId) -> &'ir ClazzDef {
        self.ir.clazz(id)
    }

    pub fn site_def(&self, id: SiteId) -> &'ir SiteDef {
        self.ir.site(id)
    }

    pub fn clazz_name(&self, id: ClazzId) -> &'ir str {
        &self.ir.clazz(id).name
    }

    pub fn site_label(&self, site: SiteId) -> String {
        format!("{}#{}", self.ir.clazz(self.ir.site_owner[site]).name, site.0)
    }

    pub fn unit(&self) -> ValueId {
        self.unit
    }

    pub fn undefined(&self) -> ValueId {
        self.undefined
    }

    pub fn bool_value(&self, b: BoolLattice) -> ValueId {
        match b {
            BoolLattice::True => self.true_,
            BoolLattice::False => self.false_,
            BoolLattice::Either => self.either,
        }
    }

    pub fn value(&self, id: ValueId) -> &Value {
        self.values.get(id)
    }

    pub fn intern_value(&mut self, value: Value) -> ValueId {
        self.values.intern(value).0
    }

    pub fn value_count(&self) -> usize {
        self.values.count()
    }

    pub fn instance_count(&self) -> usize {
        self.instances.count()
    }

    pub fn call_count(&self) -> usize {
        self.calls.count()
    }

    pub fn env_count(&self) -> usize {
        self.envs.count()
    }

    pub fn instance_key(&self, id: InstanceId) -> &InstanceKey {
        self.instances.get(id)
    }

    pub fn call_key(&self, id: CallId) -> &CallKey {
        &self.call_data[id].key
    }

    /// Earliest known site instantiating `clazz`, for diagnostics.
    pub fn first_instance_site(&self, clazz: ClazzId) -> Option<SiteId> {
        self.instances
            .iter()
            .filter(|(_, key)| key.clazz == clazz)
            .find_map(|(_, key)| key.site)
    }

    /// Records that the model grew. `reason` is only evaluated at high verbosity; the first
    /// reason per iteration is kept for the trace output.
    pub fn set_changed(&mut self, reason: impl FnOnce() -> String) {
        if self.changed_by.is_none() && self.options.verbose(3) {
            self.changed_by = Some(reason());
        }
        self.changed = true;
    }

    pub fn take_changed_by(&mut self) -> Option<String> {
        self.changed_by.take()
    }

    // ------------------------------------------------------------------------------
    // The value lattice

    /// Least upper bound of two values.
    pub fn join(&mut self, a: ValueId, b: ValueId) -> ValueId {
        if a == b {
            return a;
        }
        let va = self.values.get(a).clone();
        let vb = self.values.get(b).clone();
        match (va, vb) {
            (Value::Undefined, _) => b,
            (_, Value::Undefined) => a,
            (Value::Bool(x), Value::Bool(y)) => self.bool_value(x.join(y)),
            (Value::Numeric(c1), Value::Numeric(c2)) if c1 == c2 => a,
            (
                Value::Tagged {
                    choice: c1,
                    tag: t1,
                    inner: i1,
                },
                Value::Tagged {
                    choice: c2,
                    tag: t2,
                    inner: i2,
                },
            ) if c1 == c2 && t1 == t2 => {
                let inner = self.join(i1, i2);
                self.intern_value(Value::Tagged {
                    choice: c1,
                    tag: t1,
                    inner,
                })
            }
            _ => self.union_of([a, b]),
        }
    }

    /// Join of arbitrarily many values, normalized so that unions are flat, booleans collapse
    /// to one lattice point, and variants of the same tag are merged.
    pub fn union_of(&mut self, ids: impl IntoIterator<Item = ValueId>) -> ValueId {
        let mut flat = BTreeSet::new();
        let mut stack: Vec<ValueId> = ids.into_iter().collect();
        while let Some(id) = stack.pop() {
            match self.values.get(id) {
                Value::Union(members) => stack.extend(members.iter().copied()),
                Value::Undefined => {}
                _ => {
                    flat.insert(id);
                }
            }
        }

        let mut bools: Option<BoolLattice> = None;
        let mut tagged: BTreeMap<(ClazzId, u32), ValueId> = BTreeMap::new();
        let mut members = BTreeSet::new();
        for id in flat {
            match self.values.get(id).clone() {
                Value::Bool(b) => {
                    bools = Some(match bools {
                        Some(prev) => prev.join(b),
                        None => b,
                    });
                }
                Value::Tagged { choice, tag, inner } => {
                    let joined = match tagged.get(&(choice, tag)) {
                        Some(&prev) => self.join(prev, inner),
                        None => inner,
                    };
                    tagged.insert((choice, tag), joined);
                }
                _ => {
                    members.insert(id);
                }
            }
        }
        if let Some(b) = bools {
            members.insert(self.bool_value(b));
        }
        for ((choice, tag), inner) in tagged {
            let id = self.intern_value(Value::Tagged { choice, tag, inner });
            members.insert(id);
        }

        match members.len() {
            0 => self.undefined,
            1 => *members.iter().next().unwrap(),
            _ => self.intern_value(Value::Union(members)),
        }
    }

    // ------------------------------------------------------------------------------
    // Instances and fields

    /// Abstract instance of `clazz` created at `site` within `context`. Numeric, boolean and
    /// unit clazzes have no per-allocation identity and collapse to their domain value; ref
    /// clazzes wrap an instance of their value clazz.
    pub fn new_instance(
        &mut self,
        clazz: ClazzId,
        site: Option<SiteId>,
        context: Option<CallId>,
    ) -> ValueId {
        let def = self.clazz(clazz);
        match def.special {
            Some(SpecialClazz::Unit) => return self.unit,
            Some(SpecialClazz::Bool) => return self.either,
            Some(s) if s.is_numeric() => return self.intern_value(Value::Numeric(clazz)),
            _ => {}
        }
        if def.is_ref {
            let value_clazz = def.value_clazz.unwrap_or(clazz);
            let inner = self.instance_value(value_clazz, site, context);
            return self.intern_value(Value::Boxed {
                value_clazz,
                ref_clazz: clazz,
                inner,
            });
        }
        self.instance_value(clazz, site, context)
    }

    fn instance_value(
        &mut self,
        clazz: ClazzId,
        site: Option<SiteId>,
        context: Option<CallId>,
    ) -> ValueId {
        let (iid, fresh) = self.instances.intern(InstanceKey {
            clazz,
            site,
            context,
        });
        if fresh {
            let pushed = self.instance_fields.push(BTreeMap::new());
            debug_assert_eq!(pushed, iid);
            self.set_changed(|| format!("new instance of {clazz:?}"));
        }
        self.intern_value(Value::Instance(iid))
    }

    /// All concrete instances reachable in `value`, looking through boxes and unions.
    pub fn instances_of(&self, value: ValueId) -> Vec<InstanceId> {
        let mut out = Vec::new();
        let mut seen = BTreeSet::new();
        let mut stack = vec![value];
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            match self.values.get(id) {
                Value::Instance(iid) => out.push(*iid),
                Value::Boxed { inner, .. } => stack.push(*inner),
                Value::Union(members) => stack.extend(members.iter().copied()),
                _ => {}
            }
        }
        out
    }

    /// Joins `value` into `field` of every instance reachable in `target`.
    pub fn set_field(&mut self, target: ValueId, field: ClazzId, value: ValueId) {
        let instances = self.instances_of(target);
        if !instances.is_empty() {
            self.written_fields.insert(field);
        }
        for iid in instances {
            let old = self.instance_fields[iid].get(&field).copied();
            let new = match old {
                Some(old) => self.join(old, value),
                None => value,
            };
            if old != Some(new) {
                self.instance_fields[iid].insert(field, new);
                self.set_changed(|| format!("field {field:?} of {iid:?} grew"));
            }
        }
    }

    /// Join of `field` across every instance reachable in `target`, or `None` when the field
    /// was never written to any of them.
    pub fn get_field(&mut self, target: ValueId, field: ClazzId) -> Option<ValueId> {
        self.read_fields.insert(field);
        let mut result = None;
        for iid in self.instances_of(target) {
            if let Some(&v) = self.instance_fields[iid].get(&field) {
                result = Some(match result {
                    Some(prev) => self.join(prev, v),
                    None => v,
                });
            }
        }
        result
    }

    // ------------------------------------------------------------------------------
    // Arrays

    pub fn array_for(&mut self, array_clazz: ClazzId, elem_clazz: ClazzId) -> ArrayId {
        if let Some(&aid) = self.arrays.get(&array_clazz) {
            return aid;
        }
        let aid = self.array_data.push(ArrayData {
            clazz: array_clazz,
            elem_clazz,
            elems: self.undefined,
        });
        self.arrays.insert(array_clazz, aid);
        self.set_changed(|| format!("new array of {array_clazz:?}"));
        aid
    }

    pub fn array_write(&mut self, aid: ArrayId, value: ValueId) {
        let old = self.array_data[aid].elems;
        let new = self.join(old, value);
        if new != old {
            self.array_data[aid].elems = new;
            self.set_changed(|| format!("elements of {aid:?} grew"));
        }
    }

    pub fn array_read(&self, aid: ArrayId) -> ValueId {
        self.array_data[aid].elems
    }

    // ------------------------------------------------------------------------------
    // Calls

    /// Interns the call node for the given key, creating and scheduling it if it is new.
    ///
    /// A fresh routine call receives its `current` instance immediately; the instance's
    /// context is the call itself, which is what later lets escape tracking recognize a
    /// routine's own instance in its result.
    pub fn new_call(
        &mut self,
        clazz: ClazzId,
        site: Option<SiteId>,
        target: ValueId,
        args: Vec<ValueId>,
        env: Option<EnvId>,
        context: Option<CallId>,
    ) -> Result<CallId, Fatal> {
        let key = CallKey {
            clazz,
            site,
            target,
            args,
            env,
        };
        let (id, fresh) = self.calls.intern(key.clone());
        if fresh {
            let pushed = self.call_data.push(CallData {
                key,
                instance: None,
                result: None,
                returns: false,
                context,
            });
            debug_assert_eq!(pushed, id);
            if self.clazz(clazz).kind == ClazzKind::Routine {
                let instance = self.new_instance(clazz, site, Some(id));
                self.call_data[id].instance = Some(instance);
            }
            self.pending.insert(id);
            self.set_changed(|| format!("new call {id:?} to {clazz:?}"));
            self.analyze_new_call(id, clazz)?;
        }
        Ok(id)
    }

    /// Analyzes a freshly interned call right away instead of deferring it to the next
    /// fixpoint iteration. This only affects how fast the fixpoint is reached, never what it
    /// is, so both the depth bound and the per-clazz recursion guard are safe.
    fn analyze_new_call(&mut self, id: CallId, clazz: ClazzId) -> Result<(), Fatal> {
        if self.eager_stack.len() >= self.options.eager_call_depth
            || self.eager_stack.contains(&clazz)
        {
            return Ok(());
        }
        self.eager_stack.push(clazz);
        let result = analyze::analyze_call(self, id);
        self.eager_stack.pop();
        result
    }

    /// Joins `result` into the call's accumulated result.
    pub fn record_call_result(&mut self, call: CallId, result: ValueId) {
        let old = self.call_data[call].result;
        let new = match old {
            Some(old) => self.join(old, result),
            None => result,
        };
        if old != Some(new) {
            self.call_data[call].result = Some(new);
            self.set_changed(|| format!("result of {call:?} grew"));
        }
        self.call_data[call].returns = true;
    }

    /// Chain of creation contexts from `call` back to the entry point, for diagnostics.
    pub fn why_chain(&self, call: CallId) -> Vec<String> {
        let mut route = Vec::new();
        let mut seen = BTreeSet::new();
        let mut cur = Some(call);
        while let Some(c) = cur {
            if !seen.insert(c) {
                break;
            }
            route.push(self.clazz_name(self.call_data[c].key.clazz).to_owned());
            cur = self.call_data[c].context;
        }
        route
    }

    // ------------------------------------------------------------------------------
    // Effects

    pub fn new_env(
        &mut self,
        parent: Option<EnvId>,
        effect: ClazzId,
        handler: ValueId,
        owner: CallId,
    ) -> EnvId {
        let key = EnvKey {
            parent,
            effect,
            handler,
        };
        let (id, fresh) = self.envs.intern(key.clone());
        if fresh {
            let pushed = self.env_data.push(EnvData {
                key,
                handler,
                owner,
            });
            debug_assert_eq!(pushed, id);
            self.set_changed(|| format!("new env {id:?} for {effect:?}"));
        }
        id
    }

    /// Innermost installed handler for `effect`, falling back to the default handler.
    pub fn get_effect(&self, env: Option<EnvId>, effect: ClazzId) -> Option<ValueId> {
        let mut cur = env;
        while let Some(e) = cur {
            let data = &self.env_data[e];
            if data.key.effect == effect {
                return Some(data.handler);
            }
            cur = data.key.parent;
        }
        self.default_effects.get(&effect).copied()
    }

    /// `effect.replace`: joins the new handler into the innermost installed one, or into the
    /// default when nothing is installed. Joining rather than overwriting keeps handler values
    /// monotone across iterations.
    pub fn replace_effect(
        &mut self,
        env: Option<EnvId>,
        effect: ClazzId,
        handler: ValueId,
        call: CallId,
    ) {
        let mut cur = env;
        while let Some(e) = cur {
            if self.env_data[e].key.effect == effect {
                let old = self.env_data[e].handler;
                let new = self.join(old, handler);
                if new != old {
                    self.env_data[e].handler = new;
                    self.set_changed(|| format!("handler for {effect:?} grew"));
                }
                return;
            }
            cur = self.env_data[e].key.parent;
        }
        self.default_effect(effect, handler, call);
    }

    pub fn default_effect(&mut self, effect: ClazzId, handler: ValueId, call: CallId) {
        let old = self.default_effects.get(&effect).copied();
        let new = match old {
            Some(old) => self.join(old, handler),
            None => handler,
        };
        if old != Some(new) {
            self.default_effects.insert(effect, new);
            self.default_effect_contexts.entry(effect).or_insert(call);
            self.set_changed(|| format!("default for {effect:?} grew"));
        }
    }

    /// True when `effect` is installed somewhere in `env`'s chain.
    pub fn effect_installed(&self, env: Option<EnvId>, effect: ClazzId) -> bool {
        let mut cur = env;
        while let Some(e) = cur {
            if self.env_data[e].key.effect == effect {
                return true;
            }
            cur = self.env_data[e].key.parent;
        }
        false
    }

    // ------------------------------------------------------------------------------
    // Sites

    pub fn site_state(&mut self, site: SiteId) -> &mut SiteState {
        self.sites.entry(site).or_default()
    }
}
