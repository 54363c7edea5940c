//! The abstract step function: analyzing one call node against the current state of the model.
//!
//! Analysis is monotone. A call can be analyzed any number of times; every effect it has on the
//! model goes through joins, so re-analysis either leaves the model unchanged or grows it. The
//! fixpoint driver relies on exactly this.

use crate::context::AnalysisContext;
use crate::data::graph::{CallId, EnvId};
use crate::data::ir::{
    ClazzDef, ClazzId, ClazzKind, ConstReader, ConstShape, MatchCase, Op, SiteDef, SiteId,
    SpecialClazz,
};
use crate::data::value::{BoolLattice, Val, Value, ValueId};
use crate::diagnostics::{Diagnostic, Fatal};
use std::collections::BTreeMap;

/// Evaluation state of one routine body: the call being analyzed, its `current` instance, and
/// the values computed by the sites evaluated so far.
struct Frame {
    call: CallId,
    instance: ValueId,
    target: ValueId,
    args: Vec<ValueId>,
    env: Option<EnvId>,
    locals: BTreeMap<SiteId, Val>,
}

/// Analyzes `call` once against the current model.
pub fn analyze_call(ctx: &mut AnalysisContext<'_>, call: CallId) -> Result<(), Fatal> {
    let key = ctx.call_key(call).clone();
    let def = ctx.clazz(key.clazz);
    match def.kind {
        ClazzKind::Routine => analyze_routine(ctx, call, def),
        ClazzKind::Intrinsic => analyze_intrinsic(ctx, call, def),
        ClazzKind::Native => {
            // Native code is opaque: its result is any value of the result clazz.
            let result = match def.result_clazz {
                Some(rc) => ctx.new_instance(rc, None, None),
                None => ctx.unit(),
            };
            ctx.record_call_result(call, result);
            Ok(())
        }
        // Fields are read at their access sites and never become call nodes; abstract and
        // choice clazzes have no code of their own.
        ClazzKind::Field | ClazzKind::Abstract | ClazzKind::Choice => Ok(()),
    }
}

fn analyze_routine(
    ctx: &mut AnalysisContext<'_>,
    call: CallId,
    def: &ClazzDef,
) -> Result<(), Fatal> {
    let key = ctx.call_key(call).clone();
    let instance = ctx.call_data[call].instance.unwrap();

    for (i, &arg_field) in def.args.iter().enumerate() {
        if let Some(&arg) = key.args.get(i) {
            ctx.set_field(instance, arg_field, arg);
        }
    }
    if let Some(outer_ref) = def.outer_ref {
        ctx.set_field(instance, outer_ref.field, key.target);
    }

    let mut frame = Frame {
        call,
        instance,
        target: key.target,
        args: key.args.clone(),
        env: key.env,
        locals: BTreeMap::new(),
    };

    if let Some(result) = analyze_block(ctx, &mut frame, &def.body)? {
        let result_value = match def.result_clazz {
            Some(rc) if !ctx.ir.is_unit(rc) => result.value,
            _ => ctx.unit(),
        };
        ctx.record_call_result(call, result_value);

        // An instance created for this call that leaves through the result as a reference
        // outlives the call.
        for iid in ctx.boxed_instances_of(result_value) {
            let ikey = ctx.instance_key(iid).clone();
            if ikey.context == Some(call) {
                ctx.record_escape(ikey.clazz, ikey.site, key.env);
            }
        }
    }
    Ok(())
}

fn analyze_intrinsic(
    ctx: &mut AnalysisContext<'_>,
    call: CallId,
    def: &ClazzDef,
) -> Result<(), Fatal> {
    let name = def.intrinsic.as_deref().unwrap_or(&def.name);
    match ctx.intrinsics.lookup(name) {
        Some(f) => {
            ctx.used_intrinsics.insert(name.to_owned());
            if let Some(result) = f(ctx, call)? {
                ctx.record_call_result(call, result);
            }
        }
        None => {
            if ctx.report_results {
                ctx.diagnostics.insert(Diagnostic::UnimplementedIntrinsic {
                    name: name.to_owned(),
                });
            }
            let undefined = ctx.undefined();
            ctx.record_call_result(call, undefined);
        }
    }
    Ok(())
}

/// Analyzes a straight-line block. Returns the value of its last site, or `None` when some
/// site diverges, in which case the rest of the block is unreachable and left unanalyzed.
fn analyze_block(
    ctx: &mut AnalysisContext<'_>,
    frame: &mut Frame,
    sites: &[SiteId],
) -> Result<Option<Val>, Fatal> {
    let mut last = Val::plain(ctx.unit());
    for &site in sites {
        match analyze_site(ctx, frame, site)? {
            Some(val) => {
                frame.locals.insert(site, val);
                last = val;
            }
            None => return Ok(None),
        }
    }
    Ok(Some(last))
}

fn analyze_site(
    ctx: &mut AnalysisContext<'_>,
    frame: &mut Frame,
    site: SiteId,
) -> Result<Option<Val>, Fatal> {
    let sd = ctx.site_def(site);
    match &sd.op {
        Op::Current => Ok(Some(Val::plain(frame.instance))),
        Op::Outer => Ok(Some(Val::plain(frame.target))),
        Op::Arg(i) => {
            let v = frame.args.get(*i).copied().unwrap_or(ctx.undefined());
            Ok(Some(Val::plain(v)))
        }
        Op::Const(bytes) => {
            let v = const_value(ctx, frame.call, site, sd, bytes)?;
            Ok(Some(Val::plain(v)))
        }
        Op::Call { target, args } => {
            let tval = frame.locals[target];
            let avals: Vec<Val> = args.iter().map(|a| frame.locals[a]).collect();
            access(ctx, frame, site, sd, tval, avals, true)
        }
        Op::Assign { target, value } => {
            let tval = frame.locals[target];
            let vval = frame.locals[value];
            access(ctx, frame, site, sd, tval, vec![vval], false)
        }
        Op::Box { value } => {
            let inner = frame.locals[value].value;
            let boxed = match ctx.value(inner) {
                Value::Boxed { .. } => inner,
                _ => {
                    let value_clazz = ctx.ir.as_value(ctx.site_def(*value).result_clazz);
                    ctx.intern_value(Value::Boxed {
                        value_clazz,
                        ref_clazz: sd.result_clazz,
                        inner,
                    })
                }
            };
            Ok(Some(Val::plain(boxed)))
        }
        Op::Tag { value, tag } => {
            let inner = frame.locals[value].value;
            let v = ctx.intern_value(Value::Tagged {
                choice: sd.result_clazz,
                tag: *tag,
                inner,
            });
            Ok(Some(Val::plain(v)))
        }
        Op::Match { subject, cases } => analyze_match(ctx, frame, site, *subject, cases),
        Op::EffectRead => {
            let effect = sd.result_clazz;
            match ctx.get_effect(frame.env, effect) {
                Some(v) => Ok(Some(Val::plain(v))),
                None => {
                    if ctx.report_results {
                        ctx.missing_effects.insert(effect);
                        let diag = Diagnostic::MissingEffect {
                            effect: ctx.clazz_name(effect).to_owned(),
                        };
                        ctx.diagnostics.insert(diag);
                    }
                    Ok(Some(Val::plain(ctx.undefined())))
                }
            }
        }
    }
}

// ----------------------------------------------------------------------------------
// Accesses

/// Concrete target clazzes present in an abstract target value, paired with the value
/// alternative each one came from.
fn collect_targets(
    ctx: &AnalysisContext<'_>,
    sd: &SiteDef,
    value: ValueId,
    out: &mut Vec<(ClazzId, ValueId)>,
) {
    match ctx.value(value) {
        Value::Undefined => {}
        Value::Unit => {
            if let Some(tc) = sd.target_clazz {
                out.push((tc, value));
            }
        }
        Value::Numeric(c) => out.push((*c, value)),
        Value::Bool(_) => {
            if let Some(bc) = ctx.ir.special_of(SpecialClazz::Bool) {
                out.push((bc, value));
            }
        }
        Value::Instance(iid) => out.push((ctx.instance_key(*iid).clazz, value)),
        Value::Boxed { ref_clazz, .. } => out.push((*ref_clazz, value)),
        Value::Tagged { choice, .. } => out.push((*choice, value)),
        Value::Array(aid) => out.push((ctx.array_data[*aid].clazz, value)),
        Value::Union(members) => {
            let members: Vec<ValueId> = members.iter().copied().collect();
            for m in members {
                collect_targets(ctx, sd, m, out);
            }
        }
    }
}

/// Dynamic dispatch at a call or assignment site: resolves the target value to concrete
/// clazzes, runs the access against each dispatched callee, and joins the per-target results.
fn access(
    ctx: &mut AnalysisContext<'_>,
    frame: &mut Frame,
    site: SiteId,
    sd: &'_ SiteDef,
    tval: Val,
    args: Vec<Val>,
    is_call: bool,
) -> Result<Option<Val>, Fatal> {
    let mut targets = Vec::new();
    collect_targets(ctx, sd, tval.value, &mut targets);
    let had_targets = !targets.is_empty();

    let mut results: Vec<Val> = Vec::new();
    for (t_cl, tv) in targets {
        let callee = sd
            .accessed
            .iter()
            .find(|&&(tt, _)| tt == t_cl || ctx.ir.as_value(tt) == ctx.ir.as_value(t_cl))
            .map(|&(_, cc)| cc);
        match callee {
            Some(cc) => {
                let alt = Val {
                    value: tv,
                    embedding: tval.embedding,
                };
                if let Some(r) = access0(ctx, frame, site, sd, cc, alt, &args, is_call)? {
                    results.push(r);
                }
            }
            None => {
                // The dispatch table may still be incomplete this iteration; remember the
                // failure and report it only once the fixpoint is reached.
                if let Some(static_callee) = sd.callee {
                    ctx.abstract_missing
                        .entry((t_cl, static_callee))
                        .or_insert(Some(site));
                }
            }
        }
    }

    if had_targets && is_call {
        ctx.site_state(site).record_result(!results.is_empty());
    }
    if results.is_empty() {
        // Either the target is not yet reachable, or every dispatched branch diverges.
        return Ok(None);
    }
    Ok(Some(join_results(ctx, site, sd.result_clazz, results)))
}

/// Joins the per-branch results of one site. A shared embedding survives the join; when the
/// branches disagree, a value-typed result is still a temporary living at this site, so the
/// join must stay traceable for by-address escape checks.
fn join_results(
    ctx: &mut AnalysisContext<'_>,
    site: SiteId,
    result_clazz: ClazzId,
    results: Vec<Val>,
) -> Val {
    let mut iter = results.into_iter();
    let mut acc = iter.next().unwrap();
    for r in iter {
        let value = ctx.join(acc.value, r.value);
        acc = if acc.embedding == r.embedding {
            Val {
                value,
                embedding: acc.embedding,
            }
        } else {
            let rdef = ctx.clazz(result_clazz);
            if rdef.is_ref || rdef.special == Some(SpecialClazz::Unit) {
                Val::plain(value)
            } else {
                Val::at_site(value, site)
            }
        };
    }
    acc
}

/// One dispatched access: target clazz already resolved to the concrete callee `cc`.
fn access0(
    ctx: &mut AnalysisContext<'_>,
    frame: &mut Frame,
    site: SiteId,
    sd: &SiteDef,
    cc: ClazzId,
    tval: Val,
    args: &[Val],
    is_call: bool,
) -> Result<Option<Val>, Fatal> {
    ctx.site_state(site).accessed.insert(cc);

    if !is_call {
        // Assignment to field `cc`.
        let value = args[0];
        ctx.set_field(tval.value, cc, value.value);
        if ctx.clazz(cc).adr_of_value {
            ctx.temp_escapes(value);
        }
        ctx.value_stored(value.value, Some(frame.call), site, frame.env);
        return Ok(Some(Val::plain(ctx.unit())));
    }

    let cdef = ctx.clazz(cc);
    match cdef.kind {
        ClazzKind::Field => {
            let result = ctx.get_field(tval.value, cc).unwrap_or(ctx.undefined());
            // A field of a value instance is stored inline; remember where it lives so a later
            // by-address use can be traced back to the instance.
            let val = match ctx.value(tval.value) {
                Value::Instance(iid) => Val::in_instance(result, *iid),
                _ => Val::plain(result),
            };
            Ok(Some(val))
        }
        ClazzKind::Abstract => {
            if ctx.report_results {
                let diag = Diagnostic::CallToAbstract {
                    routine: ctx.clazz_name(cc).to_owned(),
                };
                ctx.diagnostics.insert(diag);
            }
            Ok(Some(Val::plain(ctx.undefined())))
        }
        ClazzKind::Choice => Ok(Some(Val::plain(ctx.undefined()))),
        ClazzKind::Routine | ClazzKind::Intrinsic | ClazzKind::Native => {
            // A callee whose outer is a value clazz receives the unboxed target.
            let mut target_v = tval.value;
            if let Some(outer) = cdef.outer {
                if !ctx.clazz(outer).is_ref {
                    if let Value::Boxed { inner, .. } = ctx.value(target_v) {
                        target_v = *inner;
                    }
                }
            }
            if cdef.outer_ref.is_some_and(|o| o.is_adr) {
                ctx.target_passed_by_adr(tval, cc, site, frame.env);
            }

            let arg_values: Vec<ValueId> = args.iter().map(|a| a.value).collect();
            let cid = ctx.new_call(
                cc,
                Some(site),
                target_v,
                arg_values,
                frame.env,
                Some(frame.call),
            )?;
            match ctx.call_data[cid].result {
                Some(r) => {
                    let rdef = ctx.clazz(sd.result_clazz);
                    // Non-ref results are temporaries embedded at this site.
                    let val = if rdef.is_ref || rdef.special == Some(SpecialClazz::Unit) {
                        Val::plain(r)
                    } else {
                        Val::at_site(r, site)
                    };
                    Ok(Some(val))
                }
                // Not seen to return yet: this branch is (so far) diverging. If a result
                // appears in a later iteration, the growth re-triggers analysis here.
                None => Ok(None),
            }
        }
    }
}

// ----------------------------------------------------------------------------------
// Matches

/// The `(tag, payload)` alternatives present in a match subject. Booleans match with tag 0
/// for false and tag 1 for true.
fn collect_alternatives(
    ctx: &AnalysisContext<'_>,
    site: SiteId,
    value: ValueId,
    out: &mut Vec<(u32, ValueId)>,
) -> Result<(), Fatal> {
    match ctx.value(value) {
        Value::Tagged { tag, inner, .. } => out.push((*tag, *inner)),
        Value::Bool(b) => {
            let unit = ctx.unit();
            match b {
                BoolLattice::False => out.push((0, unit)),
                BoolLattice::True => out.push((1, unit)),
                BoolLattice::Either => {
                    out.push((0, unit));
                    out.push((1, unit));
                }
            }
        }
        Value::Undefined => {}
        Value::Union(members) => {
            let members: Vec<ValueId> = members.iter().copied().collect();
            for m in members {
                collect_alternatives(ctx, site, m, out)?;
            }
        }
        _ => return Err(Fatal::UnexpectedMatchValue(ctx.site_label(site))),
    }
    Ok(())
}

fn analyze_match(
    ctx: &mut AnalysisContext<'_>,
    frame: &mut Frame,
    site: SiteId,
    subject: SiteId,
    cases: &[MatchCase],
) -> Result<Option<Val>, Fatal> {
    let sval = frame.locals[&subject];
    let mut alts = Vec::new();
    collect_alternatives(ctx, site, sval.value, &mut alts)?;
    if alts.is_empty() {
        // Subject not reachable yet; nothing to branch on.
        return Ok(None);
    }

    let mut results: Vec<Val> = Vec::new();
    for case in cases {
        let taken: Vec<ValueId> = alts
            .iter()
            .filter(|(tag, _)| case.tags.contains(tag))
            .map(|&(_, inner)| inner)
            .collect();
        if taken.is_empty() {
            continue;
        }
        if let Some(field) = case.field {
            let mut payload = taken[0];
            for &v in &taken[1..] {
                payload = ctx.join(payload, v);
            }
            ctx.set_field(frame.instance, field, payload);
        }
        if let Some(r) = analyze_block(ctx, frame, &case.body)? {
            results.push(r);
        }
    }

    ctx.site_state(site).record_result(!results.is_empty());
    if results.is_empty() {
        return Ok(None);
    }
    let result_clazz = ctx.site_def(site).result_clazz;
    Ok(Some(join_results(ctx, site, result_clazz, results)))
}

// ----------------------------------------------------------------------------------
// Constants

fn malformed(ctx: &AnalysisContext<'_>, clazz: ClazzId) -> Fatal {
    Fatal::MalformedConstant(ctx.clazz_name(clazz).to_owned())
}

fn const_value(
    ctx: &mut AnalysisContext<'_>,
    call: CallId,
    site: SiteId,
    sd: &SiteDef,
    bytes: &[u8],
) -> Result<ValueId, Fatal> {
    let mut reader = ConstReader::new(bytes);
    let v = decode_const(ctx, call, Some(site), sd.result_clazz, &mut reader)?;
    if !reader.at_end() {
        return Err(malformed(ctx, sd.result_clazz));
    }
    Ok(v)
}

fn decode_const(
    ctx: &mut AnalysisContext<'_>,
    call: CallId,
    site: Option<SiteId>,
    clazz: ClazzId,
    reader: &mut ConstReader<'_>,
) -> Result<ValueId, Fatal> {
    match ctx.ir.const_shape(clazz) {
        ConstShape::Bool => {
            let byte = reader.read_bytes(1).ok_or_else(|| malformed(ctx, clazz))?[0];
            Ok(ctx.bool_value(BoolLattice::from_bool(byte != 0)))
        }
        ConstShape::Num => {
            let width = ctx
                .clazz(clazz)
                .special
                .and_then(|s| s.const_width())
                .ok_or_else(|| malformed(ctx, clazz))?;
            reader
                .read_bytes(width)
                .ok_or_else(|| malformed(ctx, clazz))?;
            Ok(ctx.intern_value(Value::Numeric(clazz)))
        }
        ConstShape::Str => {
            let len = reader.read_u32().ok_or_else(|| malformed(ctx, clazz))?;
            reader
                .read_bytes(len as usize)
                .ok_or_else(|| malformed(ctx, clazz))?;
            Ok(const_string(ctx, site, Some(call)))
        }
        ConstShape::ArrayOf(elem) => {
            let count = reader.read_u32().ok_or_else(|| malformed(ctx, clazz))?;
            let aid = ctx.array_for(clazz, elem);
            for _ in 0..count {
                let elem_value = decode_const(ctx, call, site, elem, reader)?;
                ctx.array_write(aid, elem_value);
            }
            Ok(ctx.intern_value(Value::Array(aid)))
        }
        ConstShape::Aggregate => {
            let instance = ctx.new_instance(clazz, site, Some(call));
            let def = ctx.clazz(clazz);
            for &field in &def.args {
                let field_clazz = ctx
                    .clazz(field)
                    .result_clazz
                    .ok_or_else(|| malformed(ctx, clazz))?;
                let field_value = decode_const(ctx, call, site, field_clazz, reader)?;
                ctx.set_field(instance, field, field_value);
            }
            Ok(instance)
        }
    }
}

/// An abstract compile-time string: an instance of the string clazz whose backing array holds
/// any byte.
pub(crate) fn const_string(
    ctx: &mut AnalysisContext<'_>,
    site: Option<SiteId>,
    context: Option<CallId>,
) -> ValueId {
    let Some(str_clazz) = ctx.ir.special_of(SpecialClazz::Str) else {
        return ctx.undefined();
    };
    let instance = ctx.new_instance(str_clazz, site, context);
    if let Some(&data_field) = ctx.clazz(str_clazz).args.first() {
        if let Some(data_clazz) = ctx.clazz(data_field).result_clazz {
            if let Some(elem) = ctx.clazz(data_clazz).array_elem {
                let aid = ctx.array_for(data_clazz, elem);
                let elem_value = ctx.new_instance(elem, None, None);
                ctx.array_write(aid, elem_value);
                let array = ctx.intern_value(Value::Array(aid));
                ctx.set_field(instance, data_field, array);
            }
        }
    }
    instance
}
