//! The outer fixpoint loop.
//!
//! Each iteration re-analyzes every call node, plus any nodes created while doing so, until a
//! whole iteration leaves the model unchanged. One extra pass then runs with reporting enabled:
//! diagnostics are only collected against the converged model, since an intermediate one can
//! show spurious problems that later growth resolves.

use crate::analyze;
use crate::context::AnalysisContext;
use crate::data::graph::CallId;
use crate::diagnostics::{Diagnostic, Fatal};
use opal_common::progress::{BarLogger, ProgressLogger, ProgressSession};

pub fn find_fixpoint(ctx: &mut AnalysisContext<'_>) -> Result<(), Fatal> {
    let main = ctx.ir.main;
    let unit = ctx.unit();
    ctx.new_call(main, None, unit, vec![], None, None)?;

    loop {
        ctx.changed = false;
        iteration(ctx)?;
        ctx.iterations += 1;
        if ctx.options.verbose(2) {
            match ctx.take_changed_by() {
                Some(reason) => eprintln!("dfa: iteration {}: {reason}", ctx.iterations),
                None => eprintln!("dfa: iteration {}", ctx.iterations),
            }
        }
        if !ctx.changed {
            break;
        }
    }

    ctx.report_results = true;
    ctx.abstract_missing.clear();
    iteration(ctx)?;
    flush_dispatch_failures(ctx);
    Ok(())
}

/// Analyzes every existing call node, then keeps draining the nodes created along the way
/// until none are left.
pub(crate) fn iteration(ctx: &mut AnalysisContext<'_>) -> Result<(), Fatal> {
    let mut live: Vec<CallId> = (0..ctx.call_count()).map(CallId).collect();
    ctx.pending.clear();

    let logger = BarLogger::new(ctx.options.progress, "dfa");
    let mut session = logger.start_session(Some(live.len()));
    while !live.is_empty() {
        for call in live {
            analyze::analyze_call(ctx, call)?;
            session.update(1);
        }
        live = std::mem::take(&mut ctx.pending).into_iter().collect();
    }
    session.finish();
    Ok(())
}

/// Turns dispatch failures recorded by the reporting pass into diagnostics. Failures from
/// earlier passes were discarded: only the converged model decides what is missing.
fn flush_dispatch_failures(ctx: &mut AnalysisContext<'_>) {
    let failures: Vec<_> = ctx
        .abstract_missing
        .iter()
        .map(|(&key, &site)| (key, site))
        .collect();
    for ((target, callee), site) in failures {
        let instantiated_at = ctx
            .first_instance_site(target)
            .or(site)
            .map(|s| ctx.site_label(s))
            .unwrap_or_else(|| "<unknown>".to_owned());
        let diag = Diagnostic::AbstractMissing {
            target: ctx.clazz_name(target).to_owned(),
            routine: ctx.clazz_name(callee).to_owned(),
            instantiated_at,
        };
        ctx.diagnostics.insert(diag);
    }
}
