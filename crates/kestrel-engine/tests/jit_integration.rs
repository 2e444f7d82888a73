//! End-to-end tests: build IR, compile through the BBV pipeline, execute
//! the emitted x86-64, and check the observable word/tag results.

#![cfg(all(target_arch = "x86_64", unix))]

use kestrel_engine::ir::instr::{IRArg, IRConst, IRFunction, LinkIdx};
use kestrel_engine::ir::{IRBuilder, Opcode, TypeTag};
use kestrel_engine::runtime::TaggedVal;
use kestrel_engine::runtime::Word;
use kestrel_engine::{EngineError, JitConfig, JitEngine};

fn engine() -> JitEngine {
    JitEngine::with_defaults().unwrap()
}

fn eager_engine() -> JitEngine {
    JitEngine::new(JitConfig {
        eager: true,
        ..JitConfig::default()
    })
    .unwrap()
}

#[test]
fn test_add_i32() {
    let mut engine = engine();
    let mut fun = IRFunction::new("add", 0);
    {
        let mut b = IRBuilder::new(&mut fun);
        let sum = b.emit(Opcode::AddI32, vec![b.int32(5), b.int32(7)]);
        b.ret(b.val(sum));
    }
    let id = engine.vm_mut().add_fun(fun);
    let out = engine.call(id, TaggedVal::undef(), &[]).unwrap();
    assert_eq!(out.word.as_i32(), 12);
    assert_eq!(out.tag, TypeTag::Int32);
    // every reference is patched once compilation settles
    assert_eq!(engine.codegen().code().pending_ref_count(), 0);
}

#[test]
fn test_add_i32_params() {
    let mut engine = engine();
    let mut fun = IRFunction::new("add", 2);
    let p0 = fun.param_val(0);
    let p1 = fun.param_val(1);
    {
        let mut b = IRBuilder::new(&mut fun);
        let sum = b.emit(Opcode::AddI32, vec![b.val(p0), b.val(p1)]);
        b.ret(b.val(sum));
    }
    let id = engine.vm_mut().add_fun(fun);
    let out = engine
        .call(id, TaggedVal::undef(), &[TaggedVal::int32(-3), TaggedVal::int32(40)])
        .unwrap();
    assert_eq!(out.word.as_i32(), 37);
}

#[test]
fn test_alu_and_shift_ops() {
    let cases: &[(Opcode, i32, i32, i32)] = &[
        (Opcode::SubI32, 10, 4, 6),
        (Opcode::MulI32, -6, 7, -42),
        (Opcode::AndI32, 0b1100, 0b1010, 0b1000),
        (Opcode::OrI32, 0b1100, 0b1010, 0b1110),
        (Opcode::XorI32, 0b1100, 0b1010, 0b0110),
        (Opcode::DivI32, 42, 5, 8),
        (Opcode::ModI32, 42, 5, 2),
        (Opcode::LsftI32, 3, 4, 48),
        (Opcode::RsftI32, -16, 2, -4),
        (Opcode::UrsftI32, -1, 28, 15),
        // shift counts mask to five bits
        (Opcode::LsftI32, 1, 33, 2),
    ];
    for (op, lhs, rhs, want) in cases {
        let mut engine = engine();
        let mut fun = IRFunction::new("alu", 2);
        let p0 = fun.param_val(0);
        let p1 = fun.param_val(1);
        {
            let mut b = IRBuilder::new(&mut fun);
            let r = b.emit(*op, vec![b.val(p0), b.val(p1)]);
            b.ret(b.val(r));
        }
        let id = engine.vm_mut().add_fun(fun);
        let out = engine
            .call(
                id,
                TaggedVal::undef(),
                &[TaggedVal::int32(*lhs), TaggedVal::int32(*rhs)],
            )
            .unwrap();
        assert_eq!(out.word.as_i32(), *want, "{} {} {}", op, lhs, rhs);
    }
}

#[test]
fn test_shift_dynamic_count() {
    let mut engine = engine();
    let mut fun = IRFunction::new("shl", 2);
    let p0 = fun.param_val(0);
    let p1 = fun.param_val(1);
    {
        let mut b = IRBuilder::new(&mut fun);
        let r = b.emit(Opcode::LsftI32, vec![b.val(p0), b.val(p1)]);
        b.ret(b.val(r));
    }
    let id = engine.vm_mut().add_fun(fun);
    let out = engine
        .call(id, TaggedVal::undef(), &[TaggedVal::int32(3), TaggedVal::int32(5)])
        .unwrap();
    assert_eq!(out.word.as_i32(), 96);
}

#[test]
fn test_add_ovf_no_overflow() {
    let mut engine = engine();
    let mut fun = IRFunction::new("ovf", 2);
    let p0 = fun.param_val(0);
    let p1 = fun.param_val(1);
    {
        let mut b = IRBuilder::new(&mut fun);
        let ok = b.block("ok");
        let ovf = b.block("ovf");
        let sum = b.arith_ovf(Opcode::AddI32Ovf, b.val(p0), b.val(p1), ok, ovf);
        b.switch_to(ok);
        b.ret(b.val(sum));
        b.switch_to(ovf);
        b.ret(b.int32(-1));
    }
    let id = engine.vm_mut().add_fun(fun);
    let out = engine
        .call(id, TaggedVal::undef(), &[TaggedVal::int32(5), TaggedVal::int32(7)])
        .unwrap();
    assert_eq!(out.word.as_i32(), 12);

    // 0x7FFFFFFF + 1 takes the overflow successor
    let out = engine
        .call(
            id,
            TaggedVal::undef(),
            &[TaggedVal::int32(i32::MAX), TaggedVal::int32(1)],
        )
        .unwrap();
    assert_eq!(out.word.as_i32(), -1);
}

#[test]
fn test_known_type_test_collapses() {
    let mut engine = engine();
    let mut fun = IRFunction::new("known", 0);
    {
        let mut b = IRBuilder::new(&mut fun);
        let t = b.block("is_int");
        let f = b.block("not_int");
        let x = b.emit(Opcode::Move, vec![b.int32(42)]);
        let c = b.emit(Opcode::IsI32, vec![b.val(x)]);
        b.if_true(c, t, f);
        b.switch_to(t);
        b.ret(b.int32(1));
        b.switch_to(f);
        b.ret(b.int32(0));
    }
    let id = engine.vm_mut().add_fun(fun);
    let out = engine.call(id, TaggedVal::undef(), &[]).unwrap();
    assert_eq!(out.word.as_i32(), 1);
    // the false successor is never requested: entry + true block only
    assert_eq!(engine.codegen().versions().total_versions(), 2);
}

#[test]
fn test_type_test_refines_true_edge() {
    let mut engine = engine();
    let mut fun = IRFunction::new("refine", 1);
    let p = fun.param_val(0);
    {
        let mut b = IRBuilder::new(&mut fun);
        let t = b.block("is_int");
        let f = b.block("not_int");
        let c = b.emit(Opcode::IsI32, vec![b.val(p)]);
        b.if_true(c, t, f);
        b.switch_to(t);
        // a second test on the refined edge folds away: only one version
        // of this block and no further branching
        let t2 = b.block("still_int");
        let f2 = b.block("unreachable");
        let c2 = b.emit(Opcode::IsI32, vec![b.val(p)]);
        b.if_true(c2, t2, f2);
        b.switch_to(t2);
        let sum = b.emit(Opcode::AddI32, vec![b.val(p), b.int32(1)]);
        b.ret(b.val(sum));
        b.switch_to(f2);
        b.ret(b.int32(-2));
        b.switch_to(f);
        b.ret(b.int32(-1));
    }
    let id = engine.vm_mut().add_fun(fun);

    let out = engine
        .call(id, TaggedVal::undef(), &[TaggedVal::int32(41)])
        .unwrap();
    assert_eq!(out.word.as_i32(), 42);
    let out = engine
        .call(id, TaggedVal::undef(), &[TaggedVal::float64(1.0)])
        .unwrap();
    assert_eq!(out.word.as_i32(), -1);

    // invariant: some version entered with the refined fact exists, and
    // the false edge never learned the tag
    let vers = engine.codegen().versions();
    let mut saw_refined = false;
    for i in 0..vers.total_versions() {
        let v = vers.version(kestrel_engine::codegen::versions::VersionId(i as u32));
        for (val, tag) in v.state.types() {
            if *val == p {
                assert_eq!(*tag, TypeTag::Int32);
                saw_refined = true;
            }
        }
    }
    assert!(saw_refined);
}

#[test]
fn test_maxvers_zero_disables_specialization() {
    let mut engine = JitEngine::new(JitConfig {
        max_versions: 0,
        ..JitConfig::default()
    })
    .unwrap();
    let mut fun = IRFunction::new("nospec", 1);
    let p = fun.param_val(0);
    {
        let mut b = IRBuilder::new(&mut fun);
        let t = b.block("yes");
        let f = b.block("no");
        let c = b.emit(Opcode::IsString, vec![b.val(p)]);
        b.if_true(c, t, f);
        b.switch_to(t);
        b.ret(b.int32(1));
        b.switch_to(f);
        b.ret(b.int32(0));
    }
    let id = engine.vm_mut().add_fun(fun);
    let out = engine
        .call(id, TaggedVal::undef(), &[TaggedVal::int32(9)])
        .unwrap();
    assert_eq!(out.word.as_i32(), 0);

    // no successor state carries a type fact
    let vers = engine.codegen().versions();
    for i in 0..vers.total_versions() {
        let v = vers.version(kestrel_engine::codegen::versions::VersionId(i as u32));
        assert!(v.state.types().is_empty());
    }
}

#[test]
fn test_comparisons() {
    let cases: &[(Opcode, i32, i32, bool)] = &[
        (Opcode::EqI32, 4, 4, true),
        (Opcode::EqI32, 4, 5, false),
        (Opcode::NeI32, 4, 5, true),
        (Opcode::LtI32, -2, 3, true),
        (Opcode::LeI32, 3, 3, true),
        (Opcode::GtI32, 3, 3, false),
        (Opcode::GeI32, 4, 3, true),
    ];
    for (op, lhs, rhs, want) in cases {
        let mut engine = engine();
        let mut fun = IRFunction::new("cmp", 2);
        let p0 = fun.param_val(0);
        let p1 = fun.param_val(1);
        {
            let mut b = IRBuilder::new(&mut fun);
            let r = b.emit(*op, vec![b.val(p0), b.val(p1)]);
            b.ret(b.val(r));
        }
        let id = engine.vm_mut().add_fun(fun);
        let out = engine
            .call(
                id,
                TaggedVal::undef(),
                &[TaggedVal::int32(*lhs), TaggedVal::int32(*rhs)],
            )
            .unwrap();
        assert_eq!(out.tag, TypeTag::Const);
        assert_eq!(out.word.0 == 1, *want, "{} {} {}", op, lhs, rhs);
    }
}

#[test]
fn test_fused_compare_branch() {
    let mut engine = engine();
    let mut fun = IRFunction::new("max", 2);
    let p0 = fun.param_val(0);
    let p1 = fun.param_val(1);
    {
        let mut b = IRBuilder::new(&mut fun);
        let t = b.block("ge");
        let f = b.block("lt");
        let c = b.emit(Opcode::GeI32, vec![b.val(p0), b.val(p1)]);
        b.if_true(c, t, f);
        b.switch_to(t);
        b.ret(b.val(p0));
        b.switch_to(f);
        b.ret(b.val(p1));
    }
    let id = engine.vm_mut().add_fun(fun);
    let out = engine
        .call(id, TaggedVal::undef(), &[TaggedVal::int32(8), TaggedVal::int32(3)])
        .unwrap();
    assert_eq!(out.word.as_i32(), 8);
    let out = engine
        .call(id, TaggedVal::undef(), &[TaggedVal::int32(2), TaggedVal::int32(5)])
        .unwrap();
    assert_eq!(out.word.as_i32(), 5);
}

#[test]
fn test_float_arith_and_compare() {
    let mut engine = engine();
    let mut fun = IRFunction::new("fp", 2);
    let p0 = fun.param_val(0);
    let p1 = fun.param_val(1);
    {
        let mut b = IRBuilder::new(&mut fun);
        let s = b.emit(Opcode::AddF64, vec![b.val(p0), b.val(p1)]);
        let prod = b.emit(Opcode::MulF64, vec![b.val(s), b.float64(2.0)]);
        b.ret(b.val(prod));
    }
    let id = engine.vm_mut().add_fun(fun);
    let out = engine
        .call(
            id,
            TaggedVal::undef(),
            &[TaggedVal::float64(1.5), TaggedVal::float64(2.25)],
        )
        .unwrap();
    assert_eq!(out.tag, TypeTag::Float64);
    assert_eq!(out.word.as_f64(), 7.5);

    // ordered comparison with NaN follows ucomisd semantics
    let mut fun = IRFunction::new("flt", 2);
    let p0 = fun.param_val(0);
    let p1 = fun.param_val(1);
    {
        let mut b = IRBuilder::new(&mut fun);
        let r = b.emit(Opcode::LtF64, vec![b.val(p0), b.val(p1)]);
        b.ret(b.val(r));
    }
    let id = engine.vm_mut().add_fun(fun);
    let lt = |engine: &mut JitEngine, a: f64, b: f64| {
        engine
            .call(
                id,
                TaggedVal::undef(),
                &[TaggedVal::float64(a), TaggedVal::float64(b)],
            )
            .unwrap()
            .word
            .0
            == 1
    };
    assert!(lt(&mut engine, 1.0, 2.0));
    assert!(!lt(&mut engine, 2.0, 1.0));
    assert!(!lt(&mut engine, f64::NAN, 1.0));

    // eq respects the unordered flag
    let mut fun = IRFunction::new("feq", 2);
    let p0 = fun.param_val(0);
    let p1 = fun.param_val(1);
    {
        let mut b = IRBuilder::new(&mut fun);
        let r = b.emit(Opcode::EqF64, vec![b.val(p0), b.val(p1)]);
        b.ret(b.val(r));
    }
    let id = engine.vm_mut().add_fun(fun);
    let eq = |engine: &mut JitEngine, a: f64, b: f64| {
        engine
            .call(
                id,
                TaggedVal::undef(),
                &[TaggedVal::float64(a), TaggedVal::float64(b)],
            )
            .unwrap()
            .word
            .0
            == 1
    };
    assert!(eq(&mut engine, 2.5, 2.5));
    assert!(!eq(&mut engine, 2.5, 2.0));
    assert!(!eq(&mut engine, f64::NAN, f64::NAN));
}

#[test]
fn test_float_host_math_and_conversions() {
    let mut engine = engine();
    let mut fun = IRFunction::new("math", 1);
    let p = fun.param_val(0);
    {
        let mut b = IRBuilder::new(&mut fun);
        let root = b.emit(Opcode::SqrtF64, vec![b.val(p)]);
        let i = b.emit(Opcode::F64ToI32, vec![b.val(root)]);
        let back = b.emit(Opcode::I32ToF64, vec![b.val(i)]);
        b.ret(b.val(back));
    }
    let id = engine.vm_mut().add_fun(fun);
    let out = engine
        .call(id, TaggedVal::undef(), &[TaggedVal::float64(81.0)])
        .unwrap();
    assert_eq!(out.word.as_f64(), 9.0);

    let mut fun = IRFunction::new("pow", 2);
    let p0 = fun.param_val(0);
    let p1 = fun.param_val(1);
    {
        let mut b = IRBuilder::new(&mut fun);
        let r = b.emit(Opcode::PowF64, vec![b.val(p0), b.val(p1)]);
        b.ret(b.val(r));
    }
    let id = engine.vm_mut().add_fun(fun);
    let out = engine
        .call(
            id,
            TaggedVal::undef(),
            &[TaggedVal::float64(2.0), TaggedVal::float64(10.0)],
        )
        .unwrap();
    assert_eq!(out.word.as_f64(), 1024.0);
}

#[test]
fn test_call_prim_returns_into_continuation() {
    for eager in [false, true] {
        let mut engine = if eager { eager_engine() } else { engine() };

        let mut rt_add = IRFunction::new("rt_add", 2);
        let a = rt_add.param_val(0);
        let b_ = rt_add.param_val(1);
        {
            let mut b = IRBuilder::new(&mut rt_add);
            let s = b.emit(Opcode::AddI32, vec![b.val(a), b.val(b_)]);
            b.ret(b.val(s));
        }
        engine.vm_mut().add_prim("rt_add", rt_add);

        let mut fun = IRFunction::new("caller", 0);
        {
            let mut b = IRBuilder::new(&mut fun);
            let cont = b.block("cont");
            let r = b.call_prim("rt_add", vec![b.int32(1), b.int32(2)], cont, None);
            b.switch_to(cont);
            b.ret(b.val(r));
        }
        let id = engine.vm_mut().add_fun(fun);
        let out = engine.call(id, TaggedVal::undef(), &[]).unwrap();
        assert_eq!(out.word.as_i32(), 3, "eager={}", eager);
        assert_eq!(out.tag, TypeTag::Int32);

        if !eager {
            assert!(engine.codegen().stats().stubs_compiled >= 1);
        }
    }
}

#[test]
fn test_call_prim_unknown_name_fails() {
    let mut engine = engine();
    let mut fun = IRFunction::new("bad", 0);
    {
        let mut b = IRBuilder::new(&mut fun);
        let cont = b.block("cont");
        let r = b.call_prim("no_such_prim", vec![], cont, None);
        b.switch_to(cont);
        b.ret(b.val(r));
    }
    let id = engine.vm_mut().add_fun(fun);
    match engine.call(id, TaggedVal::undef(), &[]) {
        Err(EngineError::Compile(kestrel_engine::CodegenError::UnknownPrim(name))) => {
            assert_eq!(name, "no_such_prim");
        }
        other => panic!("expected UnknownPrim, got {:?}", other.map(|v| v.word.0)),
    }
}

#[test]
fn test_call_prim_arity_mismatch_fails() {
    let mut engine = engine();
    let mut one_arg = IRFunction::new("one", 1);
    let p = one_arg.param_val(0);
    {
        let mut b = IRBuilder::new(&mut one_arg);
        b.ret(b.val(p));
    }
    engine.vm_mut().add_prim("one", one_arg);

    let mut fun = IRFunction::new("bad", 0);
    {
        let mut b = IRBuilder::new(&mut fun);
        let cont = b.block("cont");
        let r = b.call_prim("one", vec![b.int32(1), b.int32(2)], cont, None);
        b.switch_to(cont);
        b.ret(b.val(r));
    }
    let id = engine.vm_mut().add_fun(fun);
    match engine.call(id, TaggedVal::undef(), &[]) {
        Err(EngineError::Compile(kestrel_engine::CodegenError::ArityMismatch {
            expected,
            got,
            ..
        })) => {
            assert_eq!((expected, got), (1, 2));
        }
        other => panic!("expected ArityMismatch, got {:?}", other.map(|v| v.word.0)),
    }
}

#[test]
fn test_recursive_prim_fib() {
    for eager in [false, true] {
        let mut engine = if eager { eager_engine() } else { engine() };

        // fib(n) = n < 2 ? n : fib(n-1) + fib(n-2)
        let mut fib = IRFunction::new("fib", 1);
        let n = fib.param_val(0);
        {
            let mut b = IRBuilder::new(&mut fib);
            let base = b.block("base");
            let rec = b.block("rec");
            let c = b.emit(Opcode::LtI32, vec![b.val(n), b.int32(2)]);
            b.if_true(c, base, rec);
            b.switch_to(base);
            b.ret(b.val(n));
            b.switch_to(rec);
            let n1 = b.emit(Opcode::SubI32, vec![b.val(n), b.int32(1)]);
            let cont1 = b.block("cont1");
            let f1 = b.call_prim("fib", vec![IRArg::Val(n1)], cont1, None);
            b.switch_to(cont1);
            let n2 = b.emit(Opcode::SubI32, vec![b.val(n), b.int32(2)]);
            let cont2 = b.block("cont2");
            let f2 = b.call_prim("fib", vec![IRArg::Val(n2)], cont2, None);
            b.switch_to(cont2);
            let s = b.emit(Opcode::AddI32, vec![IRArg::Val(f1), IRArg::Val(f2)]);
            b.ret(b.val(s));
        }
        let fib_id = engine.vm_mut().add_prim("fib", fib);

        let out = engine
            .call(fib_id, TaggedVal::undef(), &[TaggedVal::int32(10)])
            .unwrap();
        assert_eq!(out.word.as_i32(), 55, "eager={}", eager);
    }
}

#[test]
fn test_dynamic_closure_call() {
    let mut engine = engine();

    let mut callee = IRFunction::new("callee", 2);
    let p0 = callee.param_val(0);
    let p1 = callee.param_val(1);
    {
        let mut b = IRBuilder::new(&mut callee);
        let s = b.emit(Opcode::AddI32, vec![b.val(p0), b.val(p1)]);
        b.ret(b.val(s));
    }
    let callee_id = engine.vm_mut().add_fun(callee);

    let mut caller = IRFunction::new("caller", 0);
    {
        let mut b = IRBuilder::new(&mut caller);
        let clos = b.emit(
            Opcode::NewClos,
            vec![IRArg::Const(IRConst::Fun(callee_id)), b.int32(0)],
        );
        let cont = b.block("cont");
        let r = b.call(
            IRArg::Val(clos),
            b.undef(),
            vec![b.int32(10), b.int32(20)],
            cont,
            None,
        );
        b.switch_to(cont);
        b.ret(b.val(r));
    }
    let id = engine.vm_mut().add_fun(caller);
    let out = engine.call(id, TaggedVal::undef(), &[]).unwrap();
    assert_eq!(out.word.as_i32(), 30);
}

#[test]
fn test_dynamic_call_missing_and_extra_args() {
    let mut engine = engine();

    // returns its second formal: undefined when only one arg is passed
    let mut callee = IRFunction::new("second", 2);
    let p1 = callee.param_val(1);
    {
        let mut b = IRBuilder::new(&mut callee);
        b.ret(b.val(p1));
    }
    let callee_id = engine.vm_mut().add_fun(callee);

    let build_caller = |args: Vec<IRArg>| {
        let mut caller = IRFunction::new("caller", 0);
        {
            let mut b = IRBuilder::new(&mut caller);
            let clos = b.emit(
                Opcode::NewClos,
                vec![IRArg::Const(IRConst::Fun(callee_id)), b.int32(0)],
            );
            let cont = b.block("cont");
            let r = b.call(IRArg::Val(clos), b.undef(), args, cont, None);
            b.switch_to(cont);
            b.ret(b.val(r));
        }
        caller
    };

    // missing second argument: filled with undefined
    let caller = build_caller(vec![IRArg::Const(IRConst::Int32(1))]);
    let id = engine.vm_mut().add_fun(caller);
    let out = engine.call(id, TaggedVal::undef(), &[]).unwrap();
    assert_eq!(out.tag, TypeTag::Const);
    assert_eq!(out.word.0, kestrel_engine::runtime::value::UNDEF_WORD);

    // extra third argument: popped cleanly by the return sequence
    let caller = build_caller(vec![
        IRArg::Const(IRConst::Int32(1)),
        IRArg::Const(IRConst::Int32(2)),
        IRArg::Const(IRConst::Int32(3)),
    ]);
    let id = engine.vm_mut().add_fun(caller);
    let out = engine.call(id, TaggedVal::undef(), &[]).unwrap();
    assert_eq!(out.word.as_i32(), 2);
}

#[test]
fn test_call_of_non_closure_throws() {
    let mut engine = engine();
    let mut caller = IRFunction::new("caller", 1);
    let p = caller.param_val(0);
    {
        let mut b = IRBuilder::new(&mut caller);
        let cont = b.block("cont");
        let r = b.call(IRArg::Val(p), b.undef(), vec![], cont, None);
        b.switch_to(cont);
        b.ret(b.val(r));
    }
    let id = engine.vm_mut().add_fun(caller);
    match engine.call(id, TaggedVal::undef(), &[TaggedVal::int32(7)]) {
        Err(EngineError::Unhandled(msg)) => {
            assert!(msg.contains("TypeError"), "message: {}", msg);
        }
        other => panic!("expected unhandled TypeError, got {:?}", other.map(|v| v.word.0)),
    }
}

#[test]
fn test_throw_and_catch_across_call() {
    let mut engine = engine();

    let mut thrower = IRFunction::new("thrower", 0);
    {
        let mut b = IRBuilder::new(&mut thrower);
        b.emit_full(Opcode::Throw, vec![b.string("boom")], [None, None], false);
    }
    engine.vm_mut().add_prim("thrower", thrower);

    let mut catcher = IRFunction::new("catcher", 0);
    {
        let mut b = IRBuilder::new(&mut catcher);
        let cont = b.block("cont");
        let handler = b.block("handler");
        let r = b.call_prim("thrower", vec![], cont, Some(handler));
        b.switch_to(cont);
        b.ret(b.int32(0));
        b.switch_to(handler);
        b.ret(b.val(r));
    }
    let id = engine.vm_mut().add_fun(catcher);
    let out = engine.call(id, TaggedVal::undef(), &[]).unwrap();
    assert_eq!(out.tag, TypeTag::String);
    assert_eq!(engine.vm().read_str(out.word.0), "boom");
}

#[test]
fn test_uncaught_throw_reaches_top() {
    let mut engine = engine();
    let mut fun = IRFunction::new("boom", 0);
    {
        let mut b = IRBuilder::new(&mut fun);
        b.emit_full(Opcode::Throw, vec![b.string("lost")], [None, None], false);
    }
    let id = engine.vm_mut().add_fun(fun);
    match engine.call(id, TaggedVal::undef(), &[]) {
        Err(EngineError::Unhandled(msg)) => assert_eq!(msg, "lost"),
        other => panic!("expected unhandled exception, got {:?}", other.map(|v| v.word.0)),
    }
}

#[test]
fn test_alloc_object_fast_path_bumps() {
    let mut engine = engine();
    let mut fun = IRFunction::new("alloc", 0);
    {
        let mut b = IRBuilder::new(&mut fun);
        let o = b.emit(Opcode::AllocObject, vec![b.int32(32)]);
        b.ret(b.val(o));
    }
    let id = engine.vm_mut().add_fun(fun);
    engine.compile(id).unwrap();

    let before = engine.vm().alloc_ptr as usize;
    let host_calls_before = engine.codegen().stats().host_calls;
    let out = engine.call(id, TaggedVal::undef(), &[]).unwrap();
    assert_eq!(out.tag, TypeTag::Object);
    assert_eq!(out.word.0 as usize, before);
    // bumped to (old + 32 + 7) & !7
    let after = engine.vm().alloc_ptr as usize;
    assert_eq!(after, (before + 32 + 7) & !7);
    // no fallback ran
    assert_eq!(engine.codegen().stats().host_calls, host_calls_before);
}

#[test]
fn test_alloc_fallback_when_limit_hit() {
    let mut engine = JitEngine::new(JitConfig {
        heap_size: 128,
        ..JitConfig::default()
    })
    .unwrap();
    let mut fun = IRFunction::new("alloc", 0);
    {
        let mut b = IRBuilder::new(&mut fun);
        let o = b.emit(Opcode::AllocObject, vec![b.int32(4096)]);
        b.ret(b.val(o));
    }
    let id = engine.vm_mut().add_fun(fun);
    let out = engine.call(id, TaggedVal::undef(), &[]).unwrap();
    assert_eq!(out.tag, TypeTag::Object);
    assert!(engine.vm().owns_heap_ptr(out.word.0 as usize as *const u8));
}

#[test]
fn test_shape_property_roundtrip() {
    let mut engine = engine();

    // allocate an object with two inline slots, define a property, read
    // it back through shape_get_def + shape_get_prop
    let cap = 2u32;
    let mut fun = IRFunction::new("props", 0);
    {
        let mut b = IRBuilder::new(&mut fun);
        let size = 24 + 9 * cap as i32;
        let o = b.emit(Opcode::AllocObject, vec![b.int32(size)]);
        // shape = 0, cap, next = 0
        b.emit_effect(Opcode::StoreU64, vec![b.val(o), b.int32(0), b.int32(0)]);
        b.emit_effect(
            Opcode::StoreU32,
            vec![b.val(o), b.int32(8), b.int32(cap as i32)],
        );
        b.emit_effect(Opcode::StoreU64, vec![b.val(o), b.int32(16), b.int32(0)]);

        b.emit_full(
            Opcode::ShapeSetProp,
            vec![b.val(o), b.string("x"), b.int32(77)],
            [None, None],
            true,
        );
        let shape = b.emit(Opcode::ShapeGetDef, vec![b.val(o), b.string("x")]);
        let v = b.emit(Opcode::ShapeGetProp, vec![b.val(o), IRArg::Val(shape)]);
        b.ret(b.val(v));
    }
    let id = engine.vm_mut().add_fun(fun);
    let out = engine.call(id, TaggedVal::undef(), &[]).unwrap();
    assert_eq!(out.word.as_i32(), 77);
    assert_eq!(out.tag, TypeTag::Int32);
}

#[test]
fn test_shape_property_overflow_extension() {
    let mut engine = engine();

    // capacity 1: the second property lands in the extension table and
    // shape_get_prop takes the overflow path
    let mut fun = IRFunction::new("props2", 0);
    {
        let mut b = IRBuilder::new(&mut fun);
        let o = b.emit(Opcode::AllocObject, vec![b.int32(24 + 9)]);
        b.emit_effect(Opcode::StoreU64, vec![b.val(o), b.int32(0), b.int32(0)]);
        b.emit_effect(Opcode::StoreU32, vec![b.val(o), b.int32(8), b.int32(1)]);
        b.emit_effect(Opcode::StoreU64, vec![b.val(o), b.int32(16), b.int32(0)]);

        b.emit_full(
            Opcode::ShapeSetProp,
            vec![b.val(o), b.string("a"), b.int32(1)],
            [None, None],
            true,
        );
        b.emit_full(
            Opcode::ShapeSetProp,
            vec![b.val(o), b.string("b"), b.int32(2)],
            [None, None],
            true,
        );
        let shape = b.emit(Opcode::ShapeGetDef, vec![b.val(o), b.string("b")]);
        let v = b.emit(Opcode::ShapeGetProp, vec![b.val(o), IRArg::Val(shape)]);
        b.ret(b.val(v));
    }
    let id = engine.vm_mut().add_fun(fun);
    let out = engine.call(id, TaggedVal::undef(), &[]).unwrap();
    assert_eq!(out.word.as_i32(), 2);
}

#[test]
fn test_link_table_loop_sums() {
    let mut engine = engine();
    let l_i = LinkIdx::new();
    let l_s = LinkIdx::new();

    // sum of 0..10 with loop state in link cells; the header version is
    // shared between the entry edge and the back edge
    let mut fun = IRFunction::new("sum", 0);
    {
        let mut b = IRBuilder::new(&mut fun);
        let header = b.block("header");
        let body = b.block("body");
        let exit = b.block("exit");
        b.emit_effect(
            Opcode::SetLink,
            vec![IRArg::Const(IRConst::Link(l_i.clone())), b.int32(0)],
        );
        b.emit_effect(
            Opcode::SetLink,
            vec![IRArg::Const(IRConst::Link(l_s.clone())), b.int32(0)],
        );
        b.jump(header);

        b.switch_to(header);
        let i = b.emit(Opcode::GetLink, vec![IRArg::Const(IRConst::Link(l_i.clone()))]);
        let c = b.emit(Opcode::LtI32, vec![IRArg::Val(i), b.int32(10)]);
        b.if_true(c, body, exit);

        b.switch_to(body);
        let i2 = b.emit(Opcode::GetLink, vec![IRArg::Const(IRConst::Link(l_i.clone()))]);
        let s = b.emit(Opcode::GetLink, vec![IRArg::Const(IRConst::Link(l_s.clone()))]);
        let s2 = b.emit(Opcode::AddI32, vec![IRArg::Val(s), IRArg::Val(i2)]);
        b.emit_effect(
            Opcode::SetLink,
            vec![IRArg::Const(IRConst::Link(l_s.clone())), IRArg::Val(s2)],
        );
        let i3 = b.emit(Opcode::AddI32, vec![IRArg::Val(i2), b.int32(1)]);
        b.emit_effect(
            Opcode::SetLink,
            vec![IRArg::Const(IRConst::Link(l_i.clone())), IRArg::Val(i3)],
        );
        b.jump(header);

        b.switch_to(exit);
        let total = b.emit(Opcode::GetLink, vec![IRArg::Const(IRConst::Link(l_s.clone()))]);
        b.ret(b.val(total));
    }
    let id = engine.vm_mut().add_fun(fun);
    let out = engine.call(id, TaggedVal::undef(), &[]).unwrap();
    assert_eq!(out.word.as_i32(), 45);
}

#[test]
fn test_loads_and_stores() {
    let mut engine = engine();
    let mut fun = IRFunction::new("memops", 0);
    {
        let mut b = IRBuilder::new(&mut fun);
        let buf = b.emit(Opcode::AllocObject, vec![b.int32(64)]);
        b.emit_effect(Opcode::StoreU32, vec![b.val(buf), b.int32(0), b.int32(-1)]);
        b.emit_effect(Opcode::StoreU8, vec![b.val(buf), b.int32(8), b.int32(0x80)]);
        // zero-extended byte read
        let z = b.emit(Opcode::LoadU8, vec![b.val(buf), b.int32(8)]);
        // sign-extended byte read
        let s = b.emit(Opcode::LoadI8, vec![b.val(buf), b.int32(8)]);
        let diff = b.emit(Opcode::SubI32, vec![IRArg::Val(z), IRArg::Val(s)]);
        b.ret(b.val(diff));
    }
    let id = engine.vm_mut().add_fun(fun);
    let out = engine.call(id, TaggedVal::undef(), &[]).unwrap();
    // 0x80 zero-extended (128) minus sign-extended (-128) = 256
    assert_eq!(out.word.as_i32(), 256);
}

#[test]
fn test_call_apply_unpacks_array() {
    let mut engine = engine();

    let mut callee = IRFunction::new("callee", 2);
    let p0 = callee.param_val(0);
    let p1 = callee.param_val(1);
    {
        let mut b = IRBuilder::new(&mut callee);
        let s = b.emit(Opcode::SubI32, vec![b.val(p0), b.val(p1)]);
        b.ret(b.val(s));
    }
    let callee_id = engine.vm_mut().add_fun(callee);

    let mut caller = IRFunction::new("applier", 1);
    let arr = caller.param_val(0);
    {
        let mut b = IRBuilder::new(&mut caller);
        let clos = b.emit(
            Opcode::NewClos,
            vec![IRArg::Const(IRConst::Fun(callee_id)), b.int32(0)],
        );
        let cont = b.block("cont");
        let r = b.emit_full(
            Opcode::CallApply,
            vec![IRArg::Val(clos), b.undef(), IRArg::Val(arr)],
            [Some(cont), None],
            true,
        );
        b.switch_to(cont);
        b.ret(b.val(r.unwrap()));
    }
    let id = engine.vm_mut().add_fun(caller);

    let arr_word = engine
        .vm_mut()
        .new_array(&[TaggedVal::int32(50), TaggedVal::int32(8)]);
    let out = engine
        .call(
            id,
            TaggedVal::undef(),
            &[TaggedVal::new(Word(arr_word), TypeTag::Array)],
        )
        .unwrap();
    assert_eq!(out.word.as_i32(), 42);
}

extern "C" fn ffi_int_add(a: i32, b: i32) -> i32 {
    a.wrapping_add(b)
}

extern "C" fn ffi_mix(a: i64, x: f64, b: i64) -> f64 {
    (a + b) as f64 * x
}

extern "C" fn ffi_sum8(
    a: i64,
    b: i64,
    c: i64,
    d: i64,
    e: i64,
    f: i64,
    g: i64,
    h: i64,
) -> i64 {
    a + b + c + d + e + f + g + h
}

#[test]
fn test_call_ffi_int() {
    let mut engine = engine();
    let mut fun = IRFunction::new("ffi", 1);
    let fp = fun.param_val(0);
    {
        let mut b = IRBuilder::new(&mut fun);
        let r = b.emit(
            Opcode::CallFfi,
            vec![b.string("i32,i32,i32"), b.val(fp), b.int32(2), b.int32(3)],
        );
        b.ret(b.val(r));
    }
    let id = engine.vm_mut().add_fun(fun);
    let out = engine
        .call(
            id,
            TaggedVal::undef(),
            &[TaggedVal::new(Word(ffi_int_add as usize as u64), TypeTag::RawPtr)],
        )
        .unwrap();
    assert_eq!(out.word.as_i32(), 5);
    assert_eq!(out.tag, TypeTag::Int32);
}

#[test]
fn test_call_ffi_mixed_floats() {
    let mut engine = engine();
    let mut fun = IRFunction::new("ffi", 1);
    let fp = fun.param_val(0);
    {
        let mut b = IRBuilder::new(&mut fun);
        let r = b.emit(
            Opcode::CallFfi,
            vec![
                b.string("f64,i64,f64,i64"),
                b.val(fp),
                b.int32(3),
                b.float64(2.5),
                b.int32(5),
            ],
        );
        b.ret(b.val(r));
    }
    let id = engine.vm_mut().add_fun(fun);
    let out = engine
        .call(
            id,
            TaggedVal::undef(),
            &[TaggedVal::new(Word(ffi_mix as usize as u64), TypeTag::RawPtr)],
        )
        .unwrap();
    assert_eq!(out.tag, TypeTag::Float64);
    assert_eq!(out.word.as_f64(), 20.0);
}

#[test]
fn test_call_ffi_stack_arguments() {
    let mut engine = engine();
    let mut fun = IRFunction::new("ffi8", 1);
    let fp = fun.param_val(0);
    {
        let mut b = IRBuilder::new(&mut fun);
        let mut args = vec![
            b.string("i64,i64,i64,i64,i64,i64,i64,i64,i64"),
            b.val(fp),
        ];
        for i in 1..=8 {
            args.push(b.int32(i));
        }
        let r = b.emit(Opcode::CallFfi, args);
        b.ret(b.val(r));
    }
    let id = engine.vm_mut().add_fun(fun);
    let out = engine
        .call(
            id,
            TaggedVal::undef(),
            &[TaggedVal::new(Word(ffi_sum8 as usize as u64), TypeTag::RawPtr)],
        )
        .unwrap();
    assert_eq!(out.word.as_i64(), 36);
    assert_eq!(out.tag, TypeTag::Int64);
}

#[test]
fn test_load_lib_failure_throws() {
    let mut engine = engine();
    let mut fun = IRFunction::new("dl", 0);
    {
        let mut b = IRBuilder::new(&mut fun);
        let h = b.emit(Opcode::LoadLib, vec![b.string("/nonexistent/libmissing.so")]);
        b.ret(b.val(h));
    }
    let id = engine.vm_mut().add_fun(fun);
    match engine.call(id, TaggedVal::undef(), &[]) {
        Err(EngineError::Unhandled(msg)) => assert!(msg.contains("RuntimeError")),
        other => panic!("expected unhandled error, got {:?}", other.map(|v| v.word.0)),
    }
}

#[test]
fn test_closure_cells() {
    let mut engine = engine();

    // callee reads its captured cell through the closure parameter
    let mut callee = IRFunction::new("reader", 0);
    let clos = callee.clos_val();
    {
        let mut b = IRBuilder::new(&mut callee);
        let cell = b.emit(Opcode::ClosGetCell, vec![b.val(clos), b.int32(0)]);
        let w = b.emit(Opcode::LoadU32, vec![IRArg::Val(cell), b.int32(0)]);
        b.ret(b.val(w));
    }
    let callee_id = engine.vm_mut().add_fun(callee);

    let mut caller = IRFunction::new("maker", 0);
    {
        let mut b = IRBuilder::new(&mut caller);
        let clos = b.emit(
            Opcode::NewClos,
            vec![IRArg::Const(IRConst::Fun(callee_id)), b.int32(1)],
        );
        let cell = b.emit(Opcode::MakeCell, vec![]);
        b.emit_effect(
            Opcode::StoreU32,
            vec![IRArg::Val(cell), b.int32(0), b.int32(99)],
        );
        b.emit_effect(
            Opcode::ClosSetCell,
            vec![IRArg::Val(clos), b.int32(0), IRArg::Val(cell)],
        );
        let cont = b.block("cont");
        let r = b.call(IRArg::Val(clos), b.undef(), vec![], cont, None);
        b.switch_to(cont);
        b.ret(b.val(r));
    }
    let id = engine.vm_mut().add_fun(caller);
    let out = engine.call(id, TaggedVal::undef(), &[]).unwrap();
    assert_eq!(out.word.as_i32(), 99);
}

#[test]
fn test_load_file_runs_registered_unit() {
    let mut engine = engine();

    let mut unit = IRFunction::new("unit", 0);
    {
        let mut b = IRBuilder::new(&mut unit);
        b.ret(b.int32(7));
    }
    engine.vm_mut().add_unit("lib.kes", unit);

    let mut fun = IRFunction::new("loader", 0);
    {
        let mut b = IRBuilder::new(&mut fun);
        let cont = b.block("cont");
        let r = b.emit_full(
            Opcode::LoadFile,
            vec![b.string("lib.kes")],
            [Some(cont), None],
            true,
        );
        b.switch_to(cont);
        b.ret(b.val(r.unwrap()));
    }
    let id = engine.vm_mut().add_fun(fun);
    let out = engine.call(id, TaggedVal::undef(), &[]).unwrap();
    assert_eq!(out.word.as_i32(), 7);

    // a missing unit surfaces through the exception path
    let mut bad = IRFunction::new("loader2", 0);
    {
        let mut b = IRBuilder::new(&mut bad);
        let cont = b.block("cont");
        let r = b.emit_full(
            Opcode::LoadFile,
            vec![b.string("missing.kes")],
            [Some(cont), None],
            true,
        );
        b.switch_to(cont);
        b.ret(b.val(r.unwrap()));
    }
    let id = engine.vm_mut().add_fun(bad);
    match engine.call(id, TaggedVal::undef(), &[]) {
        Err(EngineError::Unhandled(msg)) => assert!(msg.contains("cannot load")),
        other => panic!("expected unhandled error, got {:?}", other.map(|v| v.word.0)),
    }
}

#[test]
fn test_get_time_ms_returns_float() {
    let mut engine = engine();
    let mut fun = IRFunction::new("clock", 0);
    {
        let mut b = IRBuilder::new(&mut fun);
        let t = b.emit(Opcode::GetTimeMs, vec![]);
        b.ret(b.val(t));
    }
    let id = engine.vm_mut().add_fun(fun);
    let out = engine.call(id, TaggedVal::undef(), &[]).unwrap();
    assert_eq!(out.tag, TypeTag::Float64);
    assert!(out.word.as_f64() > 0.0);
}

#[test]
fn test_version_specialization_shares_code() {
    // the same block reached twice with the same canonical state compiles
    // once; a differently-typed entry compiles a second version
    let mut engine = engine();
    let mut fun = IRFunction::new("merge", 1);
    let p = fun.param_val(0);
    {
        let mut b = IRBuilder::new(&mut fun);
        let t = b.block("int_side");
        let f = b.block("other_side");
        let join = b.block("join");
        let c = b.emit(Opcode::IsI32, vec![b.val(p)]);
        b.if_true(c, t, f);
        b.switch_to(t);
        b.jump(join);
        b.switch_to(f);
        b.jump(join);
        b.switch_to(join);
        b.ret(b.val(p));
    }
    let id = engine.vm_mut().add_fun(fun);
    let out = engine
        .call(id, TaggedVal::undef(), &[TaggedVal::int32(5)])
        .unwrap();
    assert_eq!(out.word.as_i32(), 5);

    // join is reached from a refined edge and an unrefined edge: two
    // versions of it exist
    let vers = engine.codegen().versions();
    let join_versions = (0..vers.total_versions())
        .map(|i| vers.version(kestrel_engine::codegen::versions::VersionId(i as u32)))
        .filter(|v| v.block.0 == 3)
        .count();
    assert_eq!(join_versions, 2);
}
