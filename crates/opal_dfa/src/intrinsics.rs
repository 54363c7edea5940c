//! Abstract transfer functions for the intrinsic clazzes.
//!
//! Each entry maps an intrinsic name to a function producing the abstract result of one call,
//! or `None` when the intrinsic never returns. Most numeric intrinsics collapse to "any value
//! of the result clazz"; the interesting ones are the effect and concurrency intrinsics, which
//! manipulate the environment chain and spawn new call nodes.

use crate::analyze;
use crate::context::AnalysisContext;
use crate::data::graph::CallId;
use crate::data::ir::ClazzId;
use crate::data::value::{ArrayId, BoolLattice, Value, ValueId};
use crate::diagnostics::Fatal;
use std::collections::BTreeMap;

pub type IntrinsicFn =
    fn(&mut AnalysisContext<'_>, CallId) -> Result<Option<ValueId>, Fatal>;

pub struct Intrinsics {
    table: BTreeMap<&'static str, IntrinsicFn>,
}

impl Intrinsics {
    pub fn lookup(&self, name: &str) -> Option<IntrinsicFn> {
        self.table.get(name).copied()
    }
}

pub fn build_intrinsics() -> Intrinsics {
    let mut table: BTreeMap<&'static str, IntrinsicFn> = BTreeMap::new();
    let mut put = |name: &'static str, f: IntrinsicFn| {
        table.insert(name, f);
    };

    put("num.add", num_op);
    put("num.sub", num_op);
    put("num.mul", num_op);
    put("num.div", num_op);
    put("num.rem", num_op);
    put("num.neg", num_op);
    put("num.shl", num_op);
    put("num.shr", num_op);
    put("num.bit_and", num_op);
    put("num.bit_or", num_op);
    put("num.bit_xor", num_op);
    put("num.cast", num_op);
    put("num.eq", num_cmp);
    put("num.lt", num_cmp);
    put("num.le", num_cmp);
    put("num.gt", num_cmp);
    put("num.ge", num_cmp);
    put("bool.not", bool_not);

    put("safety", safety);
    put("debug", debug);
    put("debug_level", debug_level);

    put("array.alloc", array_alloc);
    put("array.get", array_get);
    put("array.set", array_set);
    put("array.len", array_len);

    put("effect.run", effect_run);
    put("effect.replace", effect_replace);
    put("effect.default", effect_default);
    put("effect.abort", effect_abort);
    put("effect.is_installed", effect_is_installed);

    put("sys.exit", sys_exit);
    put("sys.time", opaque_result);
    put("sys.arg_count", opaque_result);
    put("sys.arg", const_string_result);
    put("sys.env_get", const_string_result);
    put("io.read", opaque_result);
    put("io.write", opaque_result);

    put("thread.spawn", thread_spawn);

    put("atomic.read", atomic_read);
    put("atomic.write", atomic_write);
    put("atomic.cas", atomic_cas);

    Intrinsics { table }
}

/// Any value of the intrinsic's result clazz.
fn result_value(ctx: &mut AnalysisContext<'_>, clazz: ClazzId) -> ValueId {
    match ctx.clazz(clazz).result_clazz {
        Some(rc) => ctx.new_instance(rc, None, None),
        None => ctx.unit(),
    }
}

fn num_op(ctx: &mut AnalysisContext<'_>, call: CallId) -> Result<Option<ValueId>, Fatal> {
    let clazz = ctx.call_key(call).clazz;
    Ok(Some(result_value(ctx, clazz)))
}

fn num_cmp(ctx: &mut AnalysisContext<'_>, _call: CallId) -> Result<Option<ValueId>, Fatal> {
    Ok(Some(ctx.bool_value(BoolLattice::Either)))
}

fn bool_not(ctx: &mut AnalysisContext<'_>, call: CallId) -> Result<Option<ValueId>, Fatal> {
    let target = ctx.call_key(call).target;
    let lattice = match ctx.value(target) {
        Value::Bool(b) => b.negate(),
        _ => BoolLattice::Either,
    };
    Ok(Some(ctx.bool_value(lattice)))
}

fn safety(ctx: &mut AnalysisContext<'_>, _call: CallId) -> Result<Option<ValueId>, Fatal> {
    let enabled = ctx.options.safety;
    Ok(Some(ctx.bool_value(BoolLattice::from_bool(enabled))))
}

fn debug(ctx: &mut AnalysisContext<'_>, _call: CallId) -> Result<Option<ValueId>, Fatal> {
    let enabled = ctx.options.debug;
    Ok(Some(ctx.bool_value(BoolLattice::from_bool(enabled))))
}

fn debug_level(ctx: &mut AnalysisContext<'_>, call: CallId) -> Result<Option<ValueId>, Fatal> {
    let clazz = ctx.call_key(call).clazz;
    Ok(Some(result_value(ctx, clazz)))
}

fn opaque_result(ctx: &mut AnalysisContext<'_>, call: CallId) -> Result<Option<ValueId>, Fatal> {
    let clazz = ctx.call_key(call).clazz;
    Ok(Some(result_value(ctx, clazz)))
}

fn const_string_result(
    ctx: &mut AnalysisContext<'_>,
    call: CallId,
) -> Result<Option<ValueId>, Fatal> {
    let site = ctx.call_key(call).site;
    Ok(Some(analyze::const_string(ctx, site, Some(call))))
}

fn sys_exit(_ctx: &mut AnalysisContext<'_>, _call: CallId) -> Result<Option<ValueId>, Fatal> {
    Ok(None)
}

// ----------------------------------------------------------------------------------
// Arrays

fn array_ids(ctx: &AnalysisContext<'_>, value: ValueId) -> Vec<ArrayId> {
    let mut out = Vec::new();
    let mut stack = vec![value];
    while let Some(id) = stack.pop() {
        match ctx.value(id) {
            Value::Array(aid) => out.push(*aid),
            Value::Union(members) => stack.extend(members.iter().copied()),
            _ => {}
        }
    }
    out
}

fn array_alloc(ctx: &mut AnalysisContext<'_>, call: CallId) -> Result<Option<ValueId>, Fatal> {
    let clazz = ctx.call_key(call).clazz;
    let Some(rc) = ctx.clazz(clazz).result_clazz else {
        return Err(Fatal::ExpectedArray(ctx.clazz_name(clazz).to_owned()));
    };
    let Some(elem) = ctx.clazz(rc).array_elem else {
        return Err(Fatal::ExpectedArray(ctx.clazz_name(clazz).to_owned()));
    };
    let aid = ctx.array_for(rc, elem);
    Ok(Some(ctx.intern_value(Value::Array(aid))))
}

fn array_get(ctx: &mut AnalysisContext<'_>, call: CallId) -> Result<Option<ValueId>, Fatal> {
    let key = ctx.call_key(call).clone();
    if matches!(ctx.value(key.target), Value::Undefined) {
        return Ok(Some(ctx.undefined()));
    }
    let ids = array_ids(ctx, key.target);
    if ids.is_empty() {
        return Err(Fatal::ExpectedArray(ctx.clazz_name(key.clazz).to_owned()));
    }
    let mut result = ctx.undefined();
    for aid in ids {
        let elems = ctx.array_read(aid);
        result = ctx.join(result, elems);
    }
    Ok(Some(result))
}

fn array_set(ctx: &mut AnalysisContext<'_>, call: CallId) -> Result<Option<ValueId>, Fatal> {
    let key = ctx.call_key(call).clone();
    if matches!(ctx.value(key.target), Value::Undefined) {
        return Ok(Some(ctx.unit()));
    }
    let ids = array_ids(ctx, key.target);
    if ids.is_empty() {
        return Err(Fatal::ExpectedArray(ctx.clazz_name(key.clazz).to_owned()));
    }
    if let Some(&value) = key.args.last() {
        for aid in ids {
            ctx.array_write(aid, value);
        }
    }
    Ok(Some(ctx.unit()))
}

fn array_len(ctx: &mut AnalysisContext<'_>, call: CallId) -> Result<Option<ValueId>, Fatal> {
    let clazz = ctx.call_key(call).clazz;
    Ok(Some(result_value(ctx, clazz)))
}

// ----------------------------------------------------------------------------------
// Effects

/// Runs the code argument with the call target installed as the innermost handler for the
/// intrinsic's effect clazz.
fn effect_run(ctx: &mut AnalysisContext<'_>, call: CallId) -> Result<Option<ValueId>, Fatal> {
    let key = ctx.call_key(call).clone();
    let def = ctx.clazz(key.clazz);
    let (Some(effect), Some(code)) = (def.outer, def.type_arg) else {
        return Ok(Some(ctx.unit()));
    };
    let env = ctx.new_env(key.env, effect, key.target, call);
    let code_target = key.args.first().copied().unwrap_or(ctx.unit());
    ctx.new_call(code, key.site, code_target, vec![], Some(env), Some(call))?;
    Ok(Some(ctx.unit()))
}

fn effect_replace(ctx: &mut AnalysisContext<'_>, call: CallId) -> Result<Option<ValueId>, Fatal> {
    let key = ctx.call_key(call).clone();
    if let Some(effect) = ctx.clazz(key.clazz).outer {
        ctx.replace_effect(key.env, effect, key.target, call);
    }
    Ok(Some(ctx.unit()))
}

fn effect_default(ctx: &mut AnalysisContext<'_>, call: CallId) -> Result<Option<ValueId>, Fatal> {
    let key = ctx.call_key(call).clone();
    if let Some(effect) = ctx.clazz(key.clazz).outer {
        ctx.default_effect(effect, key.target, call);
    }
    Ok(Some(ctx.unit()))
}

/// Aborts to the innermost enclosing `effect.run` for this effect, so the call itself never
/// returns.
fn effect_abort(ctx: &mut AnalysisContext<'_>, call: CallId) -> Result<Option<ValueId>, Fatal> {
    let key = ctx.call_key(call).clone();
    if let Some(effect) = ctx.clazz(key.clazz).outer {
        ctx.replace_effect(key.env, effect, key.target, call);
    }
    Ok(None)
}

/// `true` when a handler is certainly installed here. Never a definite `false`: the same
/// effect may be installed on other paths to this call.
fn effect_is_installed(
    ctx: &mut AnalysisContext<'_>,
    call: CallId,
) -> Result<Option<ValueId>, Fatal> {
    let key = ctx.call_key(call).clone();
    let installed = match ctx.clazz(key.clazz).outer {
        Some(effect) => ctx.get_effect(key.env, effect).is_some(),
        None => false,
    };
    let lattice = if installed {
        BoolLattice::True
    } else {
        BoolLattice::Either
    };
    Ok(Some(ctx.bool_value(lattice)))
}

// ----------------------------------------------------------------------------------
// Concurrency

/// The spawned code runs with an empty effect environment: handlers installed in the spawning
/// thread are not visible to it.
fn thread_spawn(ctx: &mut AnalysisContext<'_>, call: CallId) -> Result<Option<ValueId>, Fatal> {
    let key = ctx.call_key(call).clone();
    let clazz = key.clazz;
    if let Some(code) = ctx.clazz(clazz).type_arg {
        let code_target = key.args.first().copied().unwrap_or(ctx.unit());
        ctx.new_call(code, key.site, code_target, vec![], None, Some(call))?;
    }
    Ok(Some(result_value(ctx, clazz)))
}

fn atomic_read(ctx: &mut AnalysisContext<'_>, call: CallId) -> Result<Option<ValueId>, Fatal> {
    let key = ctx.call_key(call).clone();
    let result = match ctx.clazz(key.clazz).type_arg {
        Some(field) => ctx.get_field(key.target, field),
        None => None,
    };
    Ok(Some(result.unwrap_or(ctx.undefined())))
}

fn atomic_write(ctx: &mut AnalysisContext<'_>, call: CallId) -> Result<Option<ValueId>, Fatal> {
    let key = ctx.call_key(call).clone();
    if let (Some(field), Some(&value)) = (ctx.clazz(key.clazz).type_arg, key.args.first()) {
        ctx.set_field(key.target, field, value);
    }
    Ok(Some(ctx.unit()))
}

/// Compare-and-swap: the new value may or may not land in the field, so it is joined in, and
/// the success flag is unknown.
fn atomic_cas(ctx: &mut AnalysisContext<'_>, call: CallId) -> Result<Option<ValueId>, Fatal> {
    let key = ctx.call_key(call).clone();
    if let (Some(field), Some(&value)) = (ctx.clazz(key.clazz).type_arg, key.args.last()) {
        ctx.set_field(key.target, field, value);
    }
    Ok(Some(ctx.bool_value(BoolLattice::Either)))
}
