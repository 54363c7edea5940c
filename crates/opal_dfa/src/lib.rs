#![allow(dead_code)]

//! Whole-program data flow analysis over the Opal intermediate representation.
//!
//! Starting from the program entry point, the analysis builds a memoized graph of abstract
//! calls, instances, and effect environments, and runs it to a least fixpoint. The result is a
//! [`refined::RefinedIr`]: the input IR annotated with which clazzes are actually called,
//! which dispatch targets actually occur, which fields are read, which instances escape their
//! call, and which effects are used without ever being installed.

pub mod analyze;
pub mod context;
pub mod data;
pub mod diagnostics;
pub mod escape;
pub mod fixpoint;
pub mod intrinsics;
pub mod refined;

use crate::context::AnalysisContext;
use crate::data::ir::Ir;
use crate::diagnostics::Fatal;
use crate::refined::RefinedIr;
use opal_common::config::AnalysisOptions;

/// Runs the analysis on `ir` and returns the refined program.
pub fn analyze<'ir>(options: &AnalysisOptions, ir: &'ir Ir) -> Result<RefinedIr<'ir>, Fatal> {
    let mut ctx = AnalysisContext::new(options, ir);
    fixpoint::find_fixpoint(&mut ctx)?;
    let refined = RefinedIr::from_context(ctx);
    if options.verbose(1) {
        let counts = refined.counts;
        eprintln!(
            "dfa: {} iterations, {} calls, {} instances, {} values, {} envs",
            refined.iterations, counts.calls, counts.instances, counts.values, counts.envs
        );
    }
    if let Some(dir) = &options.artifact_dir {
        refined.write_artifacts(dir)?;
    }
    Ok(refined)
}

#[cfg(test)]
mod test;
