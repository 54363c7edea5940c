use crate::context::AnalysisContext;
use crate::data::ir::{Builder, ClazzId, ClazzKind, Ir, MatchCase, Op, SiteId, SpecialClazz};
use crate::data::value::{InstanceId, Value, ValueId};
use crate::diagnostics::{Diagnostic, Fatal};
use crate::fixpoint;
use crate::refined::{LifeTime, RefinedIr};
use opal_common::config::AnalysisOptions;
use std::collections::{BTreeMap, BTreeSet};

struct Core {
    b: Builder,
    unit: ClazzId,
    bool_: ClazzId,
    i32_: ClazzId,
    main: ClazzId,
}

fn core() -> Core {
    let mut b = Builder::new();
    let unit = b.clazz("unit", ClazzKind::Routine);
    b.special(unit, SpecialClazz::Unit);
    let bool_ = b.clazz("bool", ClazzKind::Choice);
    b.special(bool_, SpecialClazz::Bool);
    let i32_ = b.clazz("i32", ClazzKind::Routine);
    b.special(i32_, SpecialClazz::I32);
    let main = b.clazz("main", ClazzKind::Routine);
    b.clazz_mut(main).result_clazz = Some(unit);
    Core {
        b,
        unit,
        bool_,
        i32_,
        main,
    }
}

impl Core {
    /// Field clazz with the given result type.
    fn field(&mut self, name: &str, result: ClazzId) -> ClazzId {
        let f = self.b.clazz(name, ClazzKind::Field);
        self.b.clazz_mut(f).result_clazz = Some(result);
        f
    }

    /// Call site dispatching `target` to `callee` on instances of `target_clazz`.
    fn call_site(
        &mut self,
        owner: ClazzId,
        target: SiteId,
        args: Vec<SiteId>,
        target_clazz: ClazzId,
        callee: ClazzId,
        result: ClazzId,
    ) -> SiteId {
        let site = self.b.site(owner, Op::Call { target, args }, result);
        self.b.site_mut(site).accessed = vec![(target_clazz, callee)];
        self.b.site_mut(site).callee = Some(callee);
        site
    }

    fn i32_const(&mut self, owner: ClazzId, n: i32) -> SiteId {
        self.b
            .site(owner, Op::Const(n.to_le_bytes().to_vec()), self.i32_)
    }
}

fn run(ir: &Ir) -> RefinedIr<'_> {
    crate::analyze(&AnalysisOptions::default(), ir).unwrap()
}

// ----------------------------------------------------------------------------------
// Basics

#[test]
fn test_empty_main() {
    let core = core();
    let main = core.main;
    let ir = core.b.finish(main);
    let refined = run(&ir);
    assert!(refined.clazz_called(main));
    assert_eq!(refined.counts.calls, 1);
    assert_eq!(refined.iterations, 1);
    assert!(refined.escapes.is_empty());
    assert!(refined.missing_effects.is_empty());
    assert!(refined.diagnostics.is_empty());
}

/// Builds `f(x, y) -> i32 = x + y` called from main with two constants.
fn numeric_call_program() -> (Ir, ClazzId, ClazzId, ClazzId) {
    let mut c = core();
    let f = c.b.clazz("f", ClazzKind::Routine);
    let x = c.field("f.x", c.i32_);
    let y = c.field("f.y", c.i32_);
    c.b.clazz_mut(f).args = vec![x, y];
    c.b.clazz_mut(f).result_clazz = Some(c.i32_);
    c.b.clazz_mut(f).outer = Some(c.main);

    let add = c.b.clazz("i32.infix +", ClazzKind::Intrinsic);
    c.b.clazz_mut(add).intrinsic = Some("num.add".to_owned());
    c.b.clazz_mut(add).result_clazz = Some(c.i32_);
    c.b.clazz_mut(add).outer = Some(c.i32_);

    let cur = c.b.site(f, Op::Current, f);
    let rx = c.call_site(f, cur, vec![], f, x, c.i32_);
    let ry = c.call_site(f, cur, vec![], f, y, c.i32_);
    let sum = c.call_site(f, rx, vec![ry], c.i32_, add, c.i32_);
    c.b.set_body(f, vec![cur, rx, ry, sum]);

    let c1 = c.i32_const(c.main, 1);
    let c2 = c.i32_const(c.main, 2);
    let curm = c.b.site(c.main, Op::Current, c.main);
    let call_f = c.call_site(c.main, curm, vec![c1, c2], c.main, f, c.i32_);
    c.b.set_body(c.main, vec![c1, c2, curm, call_f]);

    let main = c.main;
    (c.b.finish(main), f, x, y)
}

#[test]
fn test_routine_call_with_numeric_args() {
    let (ir, f, x, y) = numeric_call_program();
    let refined = run(&ir);
    assert!(refined.clazz_called(f));
    assert!(refined.clazz_needs_code(f));
    assert!(refined.is_intrinsic_used("num.add"));
    assert!(refined.clazz_needs_code(x));
    assert!(refined.clazz_needs_code(y));
    assert!(refined.diagnostics.is_empty());
}

#[test]
fn test_written_but_unread_field_needs_no_code() {
    let mut c = core();
    let unused = c.field("main.unused", c.i32_);
    let curm = c.b.site(c.main, Op::Current, c.main);
    let c1 = c.i32_const(c.main, 7);
    let assign = c.b.site(
        c.main,
        Op::Assign {
            target: curm,
            value: c1,
        },
        c.unit,
    );
    c.b.site_mut(assign).accessed = vec![(c.main, unused)];
    c.b.site_mut(assign).callee = Some(unused);
    c.b.set_body(c.main, vec![curm, c1, assign]);

    let main = c.main;
    let ir = c.b.finish(main);
    let refined = run(&ir);
    assert!(refined.written_fields.contains(&unused));
    assert!(!refined.read_fields.contains(&unused));
    assert!(!refined.clazz_needs_code(unused));
}

// ----------------------------------------------------------------------------------
// Dispatch

#[test]
fn test_dispatch_narrows_to_instantiated_clazzes() {
    let mut c = core();
    // Constructors: calling `a` yields an instance of `a`.
    let a = c.b.clazz("a", ClazzKind::Routine);
    c.b.clazz_mut(a).result_clazz = Some(a);
    c.b.clazz_mut(a).outer = Some(c.main);
    let cur_a = c.b.site(a, Op::Current, a);
    c.b.set_body(a, vec![cur_a]);

    let b_cl = c.b.clazz("b", ClazzKind::Routine);
    c.b.clazz_mut(b_cl).result_clazz = Some(b_cl);
    c.b.clazz_mut(b_cl).outer = Some(c.main);

    let fa = c.b.clazz("a.m", ClazzKind::Routine);
    c.b.clazz_mut(fa).result_clazz = Some(c.unit);
    c.b.clazz_mut(fa).outer = Some(a);
    let fb = c.b.clazz("b.m", ClazzKind::Routine);
    c.b.clazz_mut(fb).result_clazz = Some(c.unit);
    c.b.clazz_mut(fb).outer = Some(b_cl);

    // Only `a` is ever instantiated, so the two-entry dispatch table narrows to `a.m`.
    let curm = c.b.site(c.main, Op::Current, c.main);
    let make_a = c.call_site(c.main, curm, vec![], c.main, a, a);
    let m = c.b.site(
        c.main,
        Op::Call {
            target: make_a,
            args: vec![],
        },
        c.unit,
    );
    c.b.site_mut(m).accessed = vec![(a, fa), (b_cl, fb)];
    c.b.site_mut(m).callee = Some(fa);
    c.b.set_body(c.main, vec![curm, make_a, m]);

    let main = c.main;
    let ir = c.b.finish(main);
    let refined = run(&ir);
    assert_eq!(refined.accessed_clazzes(m), vec![(a, fa)]);
    assert!(refined.clazz_called(fa));
    assert!(!refined.clazz_called(fb));
    assert!(!refined.clazz_needs_code(fb));
}

#[test]
fn test_unmatched_target_reports_abstract_missing() {
    let mut c = core();
    let a = c.b.clazz("a", ClazzKind::Routine);
    c.b.clazz_mut(a).result_clazz = Some(a);
    c.b.clazz_mut(a).outer = Some(c.main);
    let cur_a = c.b.site(a, Op::Current, a);
    c.b.set_body(a, vec![cur_a]);

    let b_cl = c.b.clazz("b", ClazzKind::Routine);
    let fb = c.b.clazz("b.m", ClazzKind::Routine);
    c.b.clazz_mut(fb).outer = Some(b_cl);

    // The dispatch table only covers `b`, but the target is an instance of `a`.
    let curm = c.b.site(c.main, Op::Current, c.main);
    let make_a = c.call_site(c.main, curm, vec![], c.main, a, a);
    let m = c.call_site(c.main, make_a, vec![], b_cl, fb, c.unit);
    c.b.set_body(c.main, vec![curm, make_a, m]);

    let main = c.main;
    let ir = c.b.finish(main);
    let refined = run(&ir);
    assert!(refined
        .diagnostics
        .iter()
        .any(|d| matches!(d, Diagnostic::AbstractMissing { .. })));
}

// ----------------------------------------------------------------------------------
// Escapes

#[test]
fn test_boxed_result_escapes_but_plain_result_does_not() {
    let mut c = core();
    let leak = c.b.clazz("leak", ClazzKind::Routine);
    let leak_ref = c.b.clazz("ref leak", ClazzKind::Routine);
    c.b.clazz_mut(leak_ref).is_ref = true;
    c.b.clazz_mut(leak_ref).value_clazz = Some(leak);
    c.b.clazz_mut(leak).result_clazz = Some(leak_ref);
    c.b.clazz_mut(leak).outer = Some(c.main);
    let cur_l = c.b.site(leak, Op::Current, leak);
    let boxed = c.b.site(leak, Op::Box { value: cur_l }, leak_ref);
    c.b.set_body(leak, vec![cur_l, boxed]);

    let stay = c.b.clazz("stay", ClazzKind::Routine);
    c.b.clazz_mut(stay).result_clazz = Some(stay);
    c.b.clazz_mut(stay).outer = Some(c.main);
    let cur_s = c.b.site(stay, Op::Current, stay);
    c.b.set_body(stay, vec![cur_s]);

    let curm = c.b.site(c.main, Op::Current, c.main);
    let call_leak = c.call_site(c.main, curm, vec![], c.main, leak, leak_ref);
    let call_stay = c.call_site(c.main, curm, vec![], c.main, stay, stay);
    c.b.set_body(c.main, vec![curm, call_leak, call_stay]);

    let main = c.main;
    let ir = c.b.finish(main);
    let refined = run(&ir);
    assert_eq!(refined.lifetime(leak), LifeTime::Unknown);
    assert_eq!(refined.lifetime(stay), LifeTime::Call);
    assert_eq!(refined.lifetime(main), LifeTime::Call);
}

#[test]
fn test_address_taken_result_escapes_across_dispatch_join() {
    let mut c = core();
    let a = c.b.clazz("a", ClazzKind::Routine);
    c.b.clazz_mut(a).result_clazz = Some(a);
    c.b.clazz_mut(a).outer = Some(c.main);
    let cur_a = c.b.site(a, Op::Current, a);
    c.b.set_body(a, vec![cur_a]);

    let b_cl = c.b.clazz("b", ClazzKind::Routine);
    c.b.clazz_mut(b_cl).result_clazz = Some(b_cl);
    c.b.clazz_mut(b_cl).outer = Some(c.main);
    let cur_b = c.b.site(b_cl, Op::Current, b_cl);
    c.b.set_body(b_cl, vec![cur_b]);

    let fa = c.b.clazz("a.m", ClazzKind::Routine);
    c.b.clazz_mut(fa).result_clazz = Some(c.i32_);
    c.b.clazz_mut(fa).outer = Some(a);
    let ka = c.i32_const(fa, 1);
    c.b.set_body(fa, vec![ka]);

    let fb = c.b.clazz("b.m", ClazzKind::Routine);
    c.b.clazz_mut(fb).result_clazz = Some(c.i32_);
    c.b.clazz_mut(fb).outer = Some(b_cl);
    let kb = c.i32_const(fb, 2);
    c.b.set_body(fb, vec![kb]);

    // Instances of both `a` and `b` flow into one field, so the call through it dispatches to
    // two callees and the two results are joined.
    let t = c.field("main.t", a);
    let keep = c.field("main.keep", c.i32_);
    c.b.clazz_mut(keep).adr_of_value = true;

    let curm = c.b.site(c.main, Op::Current, c.main);
    let make_a = c.call_site(c.main, curm, vec![], c.main, a, a);
    let make_b = c.call_site(c.main, curm, vec![], c.main, b_cl, b_cl);
    let asg_a = c.b.site(
        c.main,
        Op::Assign {
            target: curm,
            value: make_a,
        },
        c.unit,
    );
    c.b.site_mut(asg_a).accessed = vec![(c.main, t)];
    c.b.site_mut(asg_a).callee = Some(t);
    let asg_b = c.b.site(
        c.main,
        Op::Assign {
            target: curm,
            value: make_b,
        },
        c.unit,
    );
    c.b.site_mut(asg_b).accessed = vec![(c.main, t)];
    c.b.site_mut(asg_b).callee = Some(t);
    let read_t = c.call_site(c.main, curm, vec![], c.main, t, a);
    let m = c.b.site(
        c.main,
        Op::Call {
            target: read_t,
            args: vec![],
        },
        c.i32_,
    );
    c.b.site_mut(m).accessed = vec![(a, fa), (b_cl, fb)];
    c.b.site_mut(m).callee = Some(fa);
    // The joined temporary is stored into an address-taking field: its storage must outlive
    // the expression, which the analysis reports through `does_result_escape`.
    let asg_keep = c.b.site(
        c.main,
        Op::Assign {
            target: curm,
            value: m,
        },
        c.unit,
    );
    c.b.site_mut(asg_keep).accessed = vec![(c.main, keep)];
    c.b.site_mut(asg_keep).callee = Some(keep);
    c.b.set_body(
        c.main,
        vec![curm, make_a, make_b, asg_a, asg_b, read_t, m, asg_keep],
    );

    let main = c.main;
    let ir = c.b.finish(main);
    let refined = run(&ir);
    assert!(refined.clazz_called(fa));
    assert!(refined.clazz_called(fb));
    assert!(refined.does_result_escape(m));
}

#[test]
fn test_escaping_loop_block_is_reported() {
    let mut c = core();
    let body_cl = c.b.clazz("loop.body", ClazzKind::Routine);
    let body_ref = c.b.clazz("ref loop.body", ClazzKind::Routine);
    c.b.clazz_mut(body_ref).is_ref = true;
    c.b.clazz_mut(body_ref).value_clazz = Some(body_cl);
    c.b.clazz_mut(body_cl).result_clazz = Some(body_ref);
    c.b.clazz_mut(body_cl).outer = Some(c.main);
    c.b.clazz_mut(body_cl).loop_block = true;
    let cur = c.b.site(body_cl, Op::Current, body_cl);
    let boxed = c.b.site(body_cl, Op::Box { value: cur }, body_ref);
    c.b.set_body(body_cl, vec![cur, boxed]);

    let curm = c.b.site(c.main, Op::Current, c.main);
    let call = c.call_site(c.main, curm, vec![], c.main, body_cl, body_ref);
    c.b.set_body(c.main, vec![curm, call]);

    let main = c.main;
    let ir = c.b.finish(main);
    let refined = run(&ir);
    assert_eq!(refined.lifetime(body_cl), LifeTime::Unknown);
    assert!(refined
        .diagnostics
        .iter()
        .any(|d| matches!(d, Diagnostic::LoopInstanceEscapes { .. })));
}

// ----------------------------------------------------------------------------------
// Effects

#[test]
fn test_effect_read_without_handler_reports_missing() {
    let mut c = core();
    let log = c.b.clazz("log", ClazzKind::Routine);
    let read = c.b.site(c.main, Op::EffectRead, log);
    c.b.set_body(c.main, vec![read]);

    let main = c.main;
    let ir = c.b.finish(main);
    let refined = run(&ir);
    assert!(refined.missing_effects.contains(&log));
    let missing: Vec<_> = refined
        .diagnostics
        .iter()
        .filter(|d| matches!(d, Diagnostic::MissingEffect { .. }))
        .collect();
    assert_eq!(missing.len(), 1);
}

#[test]
fn test_effect_run_installs_handler_for_nested_code() {
    let mut c = core();
    let log = c.b.clazz("log", ClazzKind::Routine);
    c.b.clazz_mut(log).result_clazz = Some(log);
    c.b.clazz_mut(log).outer = Some(c.main);
    let cur_log = c.b.site(log, Op::Current, log);
    c.b.set_body(log, vec![cur_log]);

    let code = c.b.clazz("main.code", ClazzKind::Routine);
    c.b.clazz_mut(code).result_clazz = Some(c.unit);
    c.b.clazz_mut(code).outer = Some(c.main);
    let read = c.b.site(code, Op::EffectRead, log);
    c.b.set_body(code, vec![read]);

    let run_intr = c.b.clazz("log.run", ClazzKind::Intrinsic);
    c.b.clazz_mut(run_intr).intrinsic = Some("effect.run".to_owned());
    c.b.clazz_mut(run_intr).result_clazz = Some(c.unit);
    c.b.clazz_mut(run_intr).outer = Some(log);
    c.b.clazz_mut(run_intr).type_arg = Some(code);

    let curm = c.b.site(c.main, Op::Current, c.main);
    let handler = c.call_site(c.main, curm, vec![], c.main, log, log);
    let install = c.call_site(c.main, handler, vec![curm], log, run_intr, c.unit);
    c.b.set_body(c.main, vec![curm, handler, install]);

    let main = c.main;
    let ir = c.b.finish(main);
    let refined = run(&ir);
    assert!(refined.clazz_called(code));
    assert!(refined.missing_effects.is_empty());
    assert!(refined.diagnostics.is_empty());
    assert!(refined.counts.envs >= 1);
    assert!(refined.is_intrinsic_used("effect.run"));
}

// ----------------------------------------------------------------------------------
// Matches

#[test]
fn test_match_analyzes_only_reachable_cases() {
    let mut c = core();
    let option = c.b.clazz("option", ClazzKind::Choice);
    c.b.clazz_mut(option).choice = vec![c.unit, c.i32_];
    let payload = c.field("main.payload", c.i32_);

    let dead = c.b.clazz("dead", ClazzKind::Routine);
    c.b.clazz_mut(dead).result_clazz = Some(c.unit);
    c.b.clazz_mut(dead).outer = Some(c.main);
    let live = c.b.clazz("live", ClazzKind::Routine);
    c.b.clazz_mut(live).result_clazz = Some(c.unit);
    c.b.clazz_mut(live).outer = Some(c.main);

    let curm = c.b.site(c.main, Op::Current, c.main);
    let c1 = c.i32_const(c.main, 42);
    let tagged = c.b.site(
        c.main,
        Op::Tag {
            value: c1,
            tag: 1,
        },
        option,
    );
    let dead_call = c.call_site(c.main, curm, vec![], c.main, dead, c.unit);
    let live_call = c.call_site(c.main, curm, vec![], c.main, live, c.unit);
    let m = c.b.site(
        c.main,
        Op::Match {
            subject: tagged,
            cases: vec![
                MatchCase {
                    tags: vec![0],
                    field: None,
                    body: vec![dead_call],
                },
                MatchCase {
                    tags: vec![1],
                    field: Some(payload),
                    body: vec![live_call],
                },
            ],
        },
        c.unit,
    );
    c.b.set_body(c.main, vec![curm, c1, tagged, m]);

    let main = c.main;
    let ir = c.b.finish(main);
    let refined = run(&ir);
    assert!(refined.clazz_called(live));
    assert!(!refined.clazz_called(dead));
    assert!(refined.written_fields.contains(&payload));
}

#[test]
fn test_match_on_unknown_bool_takes_both_branches() {
    let mut c = core();
    let eq = c.b.clazz("i32.infix =", ClazzKind::Intrinsic);
    c.b.clazz_mut(eq).intrinsic = Some("num.eq".to_owned());
    c.b.clazz_mut(eq).result_clazz = Some(c.bool_);
    c.b.clazz_mut(eq).outer = Some(c.i32_);

    let then_r = c.b.clazz("then", ClazzKind::Routine);
    c.b.clazz_mut(then_r).result_clazz = Some(c.unit);
    c.b.clazz_mut(then_r).outer = Some(c.main);
    let else_r = c.b.clazz("else", ClazzKind::Routine);
    c.b.clazz_mut(else_r).result_clazz = Some(c.unit);
    c.b.clazz_mut(else_r).outer = Some(c.main);

    let curm = c.b.site(c.main, Op::Current, c.main);
    let c1 = c.i32_const(c.main, 1);
    let c2 = c.i32_const(c.main, 2);
    let cmp = c.call_site(c.main, c1, vec![c2], c.i32_, eq, c.bool_);
    let then_call = c.call_site(c.main, curm, vec![], c.main, then_r, c.unit);
    let else_call = c.call_site(c.main, curm, vec![], c.main, else_r, c.unit);
    let m = c.b.site(
        c.main,
        Op::Match {
            subject: cmp,
            cases: vec![
                MatchCase {
                    tags: vec![1],
                    field: None,
                    body: vec![then_call],
                },
                MatchCase {
                    tags: vec![0],
                    field: None,
                    body: vec![else_call],
                },
            ],
        },
        c.unit,
    );
    c.b.set_body(c.main, vec![curm, c1, c2, cmp, m]);

    let main = c.main;
    let ir = c.b.finish(main);
    let refined = run(&ir);
    assert!(refined.clazz_called(then_r));
    assert!(refined.clazz_called(else_r));
}

// ----------------------------------------------------------------------------------
// Recursion and divergence

#[test]
fn test_recursion_terminates_and_marks_divergence() {
    let mut c = core();
    let r = c.b.clazz("forever", ClazzKind::Routine);
    c.b.clazz_mut(r).result_clazz = Some(c.unit);
    c.b.clazz_mut(r).outer = Some(c.main);
    let outer = c.b.site(r, Op::Outer, c.main);
    let self_call = c.call_site(r, outer, vec![], c.main, r, c.unit);
    c.b.set_body(r, vec![outer, self_call]);

    let curm = c.b.site(c.main, Op::Current, c.main);
    let m = c.call_site(c.main, curm, vec![], c.main, r, c.unit);
    c.b.set_body(c.main, vec![curm, m]);

    let main = c.main;
    let ir = c.b.finish(main);
    let refined = run(&ir);
    assert!(refined.clazz_called(r));
    assert!(refined.always_results_in_void(m));
}

// ----------------------------------------------------------------------------------
// Constants

#[test]
fn test_aggregate_constant_populates_fields() {
    let mut c = core();
    let point = c.b.clazz("point", ClazzKind::Routine);
    let px = c.field("point.x", c.i32_);
    let py = c.field("point.y", c.i32_);
    c.b.clazz_mut(point).args = vec![px, py];

    let mut bytes = Vec::new();
    bytes.extend_from_slice(&1i32.to_le_bytes());
    bytes.extend_from_slice(&2i32.to_le_bytes());
    let k = c.b.site(c.main, Op::Const(bytes), point);
    c.b.set_body(c.main, vec![k]);

    let main = c.main;
    let ir = c.b.finish(main);
    let refined = run(&ir);
    assert!(refined.written_fields.contains(&px));
    assert!(refined.written_fields.contains(&py));
}

#[test]
fn test_malformed_constant_is_fatal() {
    let mut c = core();
    let k = c.b.site(c.main, Op::Const(vec![1, 2]), c.i32_);
    c.b.set_body(c.main, vec![k]);

    let main = c.main;
    let ir = c.b.finish(main);
    let result = crate::analyze(&AnalysisOptions::default(), &ir);
    assert!(matches!(result, Err(Fatal::MalformedConstant(_))));
}

// ----------------------------------------------------------------------------------
// Lattice laws

#[test]
fn test_join_laws_on_sample_values() {
    let mut core = core();
    let i32_ = core.i32_;
    let main = core.main;
    let arr_cl = core.b.clazz("array i32", ClazzKind::Routine);
    core.b.clazz_mut(arr_cl).array_elem = Some(i32_);
    let main_ref = core.b.clazz("ref main", ClazzKind::Routine);
    core.b.clazz_mut(main_ref).is_ref = true;
    core.b.clazz_mut(main_ref).value_clazz = Some(main);
    let ir = core.b.finish(main);
    let options = AnalysisOptions::default();
    let mut ctx = AnalysisContext::new(&options, &ir);

    let mut samples = vec![
        ctx.unit(),
        ctx.undefined(),
        ctx.bool_value(crate::data::value::BoolLattice::True),
        ctx.bool_value(crate::data::value::BoolLattice::False),
        ctx.intern_value(Value::Numeric(i32_)),
    ];
    let inst_a = ctx.new_instance(main, None, None);
    let inst_b = ctx.new_instance(main, Some(SiteId(0)), None);
    samples.push(inst_a);
    samples.push(inst_b);
    let t0 = ctx.intern_value(Value::Tagged {
        choice: main,
        tag: 0,
        inner: inst_a,
    });
    let t1 = ctx.intern_value(Value::Tagged {
        choice: main,
        tag: 1,
        inner: inst_b,
    });
    samples.push(t0);
    samples.push(t1);
    let num = ctx.intern_value(Value::Numeric(i32_));
    let aid = ctx.array_for(arr_cl, i32_);
    ctx.array_write(aid, num);
    samples.push(ctx.intern_value(Value::Array(aid)));
    let boxed = ctx.intern_value(Value::Boxed {
        value_clazz: main,
        ref_clazz: main_ref,
        inner: inst_a,
    });
    samples.push(boxed);
    // Unions exercise the flattening and tag-merging paths of `union_of`.
    let u1 = ctx.union_of([inst_a, t0]);
    let u2 = ctx.union_of([inst_b, boxed]);
    samples.push(u1);
    samples.push(u2);

    let undefined = ctx.undefined();
    for &a in &samples {
        assert_eq!(ctx.join(a, a), a, "idempotence");
        assert_eq!(ctx.join(a, undefined), a, "bottom identity");
        for &b in &samples {
            assert_eq!(ctx.join(a, b), ctx.join(b, a), "commutativity");
            for &c in &samples {
                let ab = ctx.join(a, b);
                let bc = ctx.join(b, c);
                assert_eq!(ctx.join(ab, c), ctx.join(a, bc), "associativity");
            }
        }
    }
}

// ----------------------------------------------------------------------------------
// Monotonicity

/// Drives the fixpoint iterations by hand and checks that the model only ever grows from one
/// iteration to the next: call and value counts never drop, the escape set never loses a
/// member, and every recorded instance field value is dominated by its successor.
#[test]
fn test_model_only_grows_across_iterations() {
    let mut c = core();
    let leak = c.b.clazz("leak", ClazzKind::Routine);
    let leak_ref = c.b.clazz("ref leak", ClazzKind::Routine);
    c.b.clazz_mut(leak_ref).is_ref = true;
    c.b.clazz_mut(leak_ref).value_clazz = Some(leak);
    c.b.clazz_mut(leak).result_clazz = Some(leak_ref);
    c.b.clazz_mut(leak).outer = Some(c.main);
    let cur_l = c.b.site(leak, Op::Current, leak);
    let boxed = c.b.site(leak, Op::Box { value: cur_l }, leak_ref);
    c.b.set_body(leak, vec![cur_l, boxed]);

    // The slot is written from a call result that only becomes available in a later
    // iteration, so the field store grows across iterations rather than within one.
    let slot = c.field("main.slot", leak_ref);
    let curm = c.b.site(c.main, Op::Current, c.main);
    let call_leak = c.call_site(c.main, curm, vec![], c.main, leak, leak_ref);
    let asg = c.b.site(
        c.main,
        Op::Assign {
            target: curm,
            value: call_leak,
        },
        c.unit,
    );
    c.b.site_mut(asg).accessed = vec![(c.main, slot)];
    c.b.site_mut(asg).callee = Some(slot);
    c.b.set_body(c.main, vec![curm, call_leak, asg]);

    let main = c.main;
    let ir = c.b.finish(main);

    // Depth 0 defers every nested call to the worklist instead of analyzing it eagerly.
    let options = AnalysisOptions {
        eager_call_depth: 0,
        ..AnalysisOptions::default()
    };
    let mut ctx = AnalysisContext::new(&options, &ir);
    let unit = ctx.unit();
    ctx.new_call(main, None, unit, vec![], None, None).unwrap();

    let mut iterations = 0;
    let mut prev_calls = 0;
    let mut prev_values = 0;
    let mut prev_escapes: BTreeSet<ClazzId> = BTreeSet::new();
    let mut prev_fields: Vec<BTreeMap<ClazzId, ValueId>> = Vec::new();
    loop {
        ctx.changed = false;
        fixpoint::iteration(&mut ctx).unwrap();
        iterations += 1;

        assert!(ctx.call_count() >= prev_calls, "live call set shrank");
        assert!(ctx.value_count() >= prev_values, "value domain shrank");
        let escapes: BTreeSet<ClazzId> = ctx.escapes.keys().copied().collect();
        assert!(escapes.is_superset(&prev_escapes), "escape set shrank");
        for (i, fields) in prev_fields.iter().enumerate() {
            for (&field, &old) in fields {
                let new = ctx.instance_fields[InstanceId(i)][&field];
                assert_eq!(ctx.join(old, new), new, "an instance field value shrank");
            }
        }

        prev_calls = ctx.call_count();
        prev_values = ctx.value_count();
        prev_escapes = escapes;
        prev_fields = ctx
            .instance_fields
            .iter()
            .map(|(_, fields)| fields.clone())
            .collect();
        if !ctx.changed {
            break;
        }
    }
    assert!(iterations >= 2);
    assert!(ctx.escapes.contains_key(&leak));
    assert!(ctx.written_fields.contains(&slot));
}

// ----------------------------------------------------------------------------------
// Determinism and tunables

#[test]
fn test_repeated_runs_are_deterministic() {
    let (ir, _, _, _) = numeric_call_program();
    let first = run(&ir).summary();
    let second = run(&ir).summary();
    assert_eq!(first, second);
}

/// The eager analysis depth is a performance knob: any depth must converge to the same model.
#[test]
fn test_eager_call_depth_does_not_change_results() {
    let (ir, _, _, _) = numeric_call_program();
    let mut baseline = None;
    for depth in [0, 1, 10] {
        let options = AnalysisOptions {
            eager_call_depth: depth,
            ..AnalysisOptions::default()
        };
        let mut summary = crate::analyze(&options, &ir).unwrap().summary();
        summary.iterations = 0;
        match &baseline {
            None => baseline = Some(summary),
            Some(expected) => assert_eq!(&summary, expected, "depth {depth}"),
        }
    }
}
