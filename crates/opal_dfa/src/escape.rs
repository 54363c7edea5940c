//! Escape bookkeeping.
//!
//! Two kinds of facts are tracked. A clazz in `escapes` has some instance that outlives the
//! call it was created for, so the code generator cannot stack-allocate its frame. A site in
//! `escaped_results` produces a temporary whose address is taken, so the temporary needs real
//! storage rather than living in a register.

use crate::context::AnalysisContext;
use crate::data::graph::{CallId, EnvId};
use crate::data::ir::{ClazzId, SiteId};
use crate::data::value::{InstanceId, Val, Value, ValueId};
use crate::diagnostics::Diagnostic;
use std::collections::BTreeSet;

impl<'ir> AnalysisContext<'ir> {
    /// Records that instances of `clazz` escape, remembering the first site where it
    /// happened. Loop-block clazzes additionally raise a diagnostic unless the effect that
    /// permits such escapes is installed in `env`.
    pub fn record_escape(&mut self, clazz: ClazzId, site: Option<SiteId>, env: Option<EnvId>) {
        if self.escapes.contains_key(&clazz) {
            return;
        }
        self.escapes.insert(clazz, site);
        self.set_changed(|| format!("{clazz:?} escapes"));

        if self.clazz(clazz).loop_block {
            let permitted = match self.ir.loop_allow_escape {
                Some(effect) => self.effect_installed(env, effect),
                None => false,
            };
            if !permitted {
                let diag = Diagnostic::LoopInstanceEscapes {
                    clazz: self.clazz_name(clazz).to_owned(),
                    route: self.escape_route(clazz),
                };
                self.diagnostics.insert(diag);
            }
        }
    }

    /// Records that the temporary produced by `val`'s defining site has its address taken.
    pub fn temp_escapes(&mut self, val: Val) {
        let Some(embedding) = val.embedding else {
            return;
        };
        if let Some(site) = embedding.site {
            if self.escaped_results.insert(site) {
                self.set_changed(|| format!("result of {site:?} escapes"));
            }
        }
    }

    /// A call passes `target` by address to `callee`. If the callee is itself known to let
    /// its outer instance escape, then whatever instance the target is embedded in escapes
    /// too.
    pub fn target_passed_by_adr(
        &mut self,
        target: Val,
        callee: ClazzId,
        site: SiteId,
        env: Option<EnvId>,
    ) {
        self.temp_escapes(target);
        if !self.escapes.contains_key(&callee) {
            return;
        }
        if let Some(owner) = target.embedding.and_then(|e| e.owner) {
            let owner_clazz = self.instance_key(owner).clazz;
            self.record_escape(owner_clazz, Some(site), env);
        }
    }

    /// Instances reachable in `value` that only appear behind a box, so sharing them shares
    /// the instance itself rather than a copy.
    pub fn boxed_instances_of(&self, value: ValueId) -> Vec<InstanceId> {
        let mut out = Vec::new();
        let mut seen = BTreeSet::new();
        let mut stack = vec![(value, false)];
        while let Some((id, under_box)) = stack.pop() {
            if !seen.insert((id, under_box)) {
                continue;
            }
            match self.value(id) {
                Value::Instance(iid) if under_box => out.push(*iid),
                Value::Boxed { inner, .. } => stack.push((*inner, true)),
                Value::Tagged { inner, .. } => stack.push((*inner, under_box)),
                Value::Union(members) => {
                    stack.extend(members.iter().map(|&m| (m, under_box)));
                }
                _ => {}
            }
        }
        out
    }

    /// An assignment stores `value` into a field of some instance. Any boxed instance inside
    /// the stored value now lives in the heap graph and escapes the call that created it.
    pub fn value_stored(
        &mut self,
        value: ValueId,
        current: Option<CallId>,
        site: SiteId,
        env: Option<EnvId>,
    ) {
        for iid in self.boxed_instances_of(value) {
            let key = self.instance_key(iid).clone();
            if key.context.is_some() && key.context == current {
                self.record_escape(key.clazz, Some(site), env);
            }
        }
    }

    /// Human readable chain explaining how `clazz` came to escape, following recorded escape
    /// sites outward.
    pub fn escape_route(&self, clazz: ClazzId) -> Vec<String> {
        let mut route = vec![self.clazz_name(clazz).to_owned()];
        let mut seen = BTreeSet::new();
        let mut cur = clazz;
        while seen.insert(cur) {
            let Some(Some(site)) = self.escapes.get(&cur) else {
                break;
            };
            let owner = self.ir.site_owner[*site];
            route.push(format!(
                "{} (at {})",
                self.clazz_name(owner),
                self.site_label(*site)
            ));
            cur = owner;
        }
        route
    }
}
