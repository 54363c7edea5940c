//! The analysis output: the original IR plus everything the fixpoint learned about it.
//!
//! Back ends consult this to drop uncalled code, narrow dispatch tables to the clazzes that
//! actually occur, stack-allocate instances that never escape, and strip fields nobody reads.

use crate::context::AnalysisContext;
use crate::data::graph::SiteState;
use crate::data::ir::{ClazzId, ClazzKind, Ir, SiteId};
use crate::diagnostics::{Diagnostic, Fatal};
use opal_common::config::ArtifactDir;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io;

/// How long an instance of a clazz may be needed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifeTime {
    /// The instance dies with the call that created it; its frame can live on the stack.
    Call,
    /// Some instance escapes its call; lifetime cannot be bounded.
    Unknown,
}

#[derive(Clone, Copy, Debug)]
pub struct ModelCounts {
    pub values: usize,
    pub instances: usize,
    pub calls: usize,
    pub envs: usize,
}

pub struct RefinedIr<'ir> {
    pub ir: &'ir Ir,
    pub called: BTreeSet<ClazzId>,
    pub read_fields: BTreeSet<ClazzId>,
    pub written_fields: BTreeSet<ClazzId>,
    pub site_states: BTreeMap<SiteId, SiteState>,
    pub escapes: BTreeMap<ClazzId, Option<SiteId>>,
    pub escaped_results: BTreeSet<SiteId>,
    pub default_effects: BTreeSet<ClazzId>,
    pub missing_effects: BTreeSet<ClazzId>,
    pub used_intrinsics: BTreeSet<String>,
    pub diagnostics: Vec<Diagnostic>,
    pub iterations: usize,
    pub counts: ModelCounts,
}

impl<'ir> RefinedIr<'ir> {
    pub(crate) fn from_context(ctx: AnalysisContext<'ir>) -> Self {
        let counts = ModelCounts {
            values: ctx.value_count(),
            instances: ctx.instance_count(),
            calls: ctx.call_count(),
            envs: ctx.env_count(),
        };
        let called = ctx
            .call_data
            .iter()
            .map(|(_, data)| data.key.clazz)
            .collect();
        RefinedIr {
            ir: ctx.ir,
            called,
            read_fields: ctx.read_fields,
            written_fields: ctx.written_fields,
            site_states: ctx.sites,
            escapes: ctx.escapes,
            escaped_results: ctx.escaped_results,
            default_effects: ctx.default_effects.keys().copied().collect(),
            missing_effects: ctx.missing_effects,
            used_intrinsics: ctx.used_intrinsics,
            diagnostics: ctx.diagnostics.into_iter().collect(),
            iterations: ctx.iterations,
            counts,
        }
    }

    pub fn clazz_called(&self, clazz: ClazzId) -> bool {
        self.called.contains(&clazz)
    }

    /// The site's dispatch table narrowed to the callees that were actually invoked.
    pub fn accessed_clazzes(&self, site: SiteId) -> Vec<(ClazzId, ClazzId)> {
        let Some(state) = self.site_states.get(&site) else {
            return Vec::new();
        };
        self.ir
            .site(site)
            .accessed
            .iter()
            .copied()
            .filter(|(_, callee)| state.accessed.contains(callee))
            .collect()
    }

    /// Whether the back end must emit code for `clazz`. Fields only need a slot when they are
    /// both written and read; a write whose value can never be observed is dead.
    pub fn clazz_needs_code(&self, clazz: ClazzId) -> bool {
        match self.ir.clazz(clazz).kind {
            ClazzKind::Routine | ClazzKind::Intrinsic | ClazzKind::Native => {
                self.called.contains(&clazz)
            }
            ClazzKind::Field => {
                self.written_fields.contains(&clazz) && self.read_fields.contains(&clazz)
            }
            ClazzKind::Abstract | ClazzKind::Choice => false,
        }
    }

    pub fn lifetime(&self, clazz: ClazzId) -> LifeTime {
        if self.escapes.contains_key(&clazz) {
            LifeTime::Unknown
        } else {
            LifeTime::Call
        }
    }

    /// Whether the temporary produced at `site` has its address taken and needs storage that
    /// survives the expression.
    pub fn does_result_escape(&self, site: SiteId) -> bool {
        self.escaped_results.contains(&site)
    }

    /// Whether the access or match at `site` was executed and never produced a result, so any
    /// code following it is unreachable.
    pub fn always_results_in_void(&self, site: SiteId) -> bool {
        self.site_states
            .get(&site)
            .is_some_and(|state| state.always_diverges())
    }

    pub fn is_intrinsic_used(&self, name: &str) -> bool {
        self.used_intrinsics.contains(name)
    }

    pub fn summary(&self) -> AnalysisSummary {
        let names = |set: &BTreeSet<ClazzId>| -> Vec<String> {
            set.iter()
                .map(|&c| self.ir.clazz(c).name.clone())
                .collect()
        };
        AnalysisSummary {
            iterations: self.iterations,
            values: self.counts.values,
            instances: self.counts.instances,
            calls: self.counts.calls,
            envs: self.counts.envs,
            called_clazzes: names(&self.called),
            escaping_clazzes: self.escapes.keys().map(|&c| self.ir.clazz(c).name.clone()).collect(),
            used_intrinsics: self.used_intrinsics.iter().cloned().collect(),
            diagnostics: self.diagnostics.iter().map(|d| d.to_string()).collect(),
        }
    }

    pub fn write_artifacts(&self, dir: &ArtifactDir) -> Result<(), Fatal> {
        let file = File::create(dir.artifact_path("dfa.json"))?;
        serde_json::to_writer_pretty(file, &self.summary()).map_err(io::Error::from)?;
        Ok(())
    }
}

/// Machine readable digest of one analysis run, written next to the other build artifacts.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AnalysisSummary {
    pub iterations: usize,
    pub values: usize,
    pub instances: usize,
    pub calls: usize,
    pub envs: usize,
    pub called_clazzes: Vec<String>,
    pub escaping_clazzes: Vec<String>,
    pub used_intrinsics: Vec<String>,
    pub diagnostics: Vec<String>,
}
