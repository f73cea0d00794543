//! Coroutine lifecycle: resume, yield, resumption into interrupted
//! instructions

use lumo_core::instr::rk_const;
use lumo_core::{Instr, OpCode};
use lumo_engine::{
    CoStatus, Constant, ProtoBuilder, Status, Unwind, Vm,
};

/// The canonical yield entry point, as a host function.
fn c_yield(vm: &mut Vm) -> Result<usize, Unwind> {
    let n = vm.gettop();
    Err(vm.yield_values(n))
}

#[test]
fn yield_three_times_then_return() {
    // co = function(yield) yield(3); yield(4); yield(5); return 6 end
    let mut vm = Vm::new();
    let mut b = ProtoBuilder::new(1, 4);
    let k3 = b.constant(Constant::Int(3));
    let k4 = b.constant(Constant::Int(4));
    let k5 = b.constant(Constant::Int(5));
    let k6 = b.constant(Constant::Int(6));
    for k in [k3, k4, k5] {
        b.op(Instr::abc(OpCode::Move, 1, 0, 0));
        b.op(Instr::abx(OpCode::LoadK, 2, k));
        b.op(Instr::abc(OpCode::Call, 1, 2, 1));
    }
    b.op(Instr::abx(OpCode::LoadK, 1, k6));
    b.op(Instr::abc(OpCode::Return, 1, 2, 0));
    let p = b.build(&mut vm);

    let co = vm.create_thread();
    vm.push_proto_closure(p);
    vm.xmove(co, 1);

    // the first resume passes the yield function as the argument
    vm.push_cfunction(c_yield);
    for expected in [3i64, 4, 5] {
        let nargs = if expected == 3 { 1 } else { 0 };
        let (st, n) = vm.resume(co, nargs);
        assert_eq!(st, Status::Yield);
        assert_eq!(n, 1);
        assert_eq!(vm.to_integer(-1), Some(expected));
        assert_eq!(vm.co_status(co), CoStatus::Suspended);
        vm.pop(1);
    }
    let (st, n) = vm.resume(co, 0);
    assert_eq!(st, Status::Ok);
    assert_eq!(n, 1);
    assert_eq!(vm.to_integer(-1), Some(6));
    assert_eq!(vm.co_status(co), CoStatus::Dead);

    // a dead coroutine refuses further resumes with an error value
    let (st, n) = vm.resume(co, 0);
    assert_eq!(st, Status::ErrRun);
    assert_eq!(n, 1);
    let msg = vm.to_lstring(-1).unwrap();
    assert!(String::from_utf8_lossy(&msg).contains("dead coroutine"));
}

#[test]
fn yield_from_main_is_an_error() {
    let mut vm = Vm::new();
    let u = vm.yield_values(0);
    match u {
        Unwind::Error(st, _) => assert_eq!(st, Status::ErrRun),
        Unwind::Yield => panic!("the main thread must not yield"),
    }
}

#[test]
fn resume_values_become_yield_results() {
    // co body: r1 = yield(1); return r1 + 10
    let mut vm = Vm::new();
    let mut b = ProtoBuilder::new(1, 4);
    let k1 = b.constant(Constant::Int(1));
    let k10 = b.constant(Constant::Int(10));
    b.op(Instr::abc(OpCode::Move, 1, 0, 0));
    b.op(Instr::abx(OpCode::LoadK, 2, k1));
    b.op(Instr::abc(OpCode::Call, 1, 2, 2)); // r1 = yield(1)
    b.op(Instr::abc(OpCode::Add, 1, 1, rk_const(k10)));
    b.op(Instr::abc(OpCode::Return, 1, 2, 0));
    let p = b.build(&mut vm);

    let co = vm.create_thread();
    vm.push_proto_closure(p);
    vm.xmove(co, 1);
    vm.push_cfunction(c_yield);
    let (st, _) = vm.resume(co, 1);
    assert_eq!(st, Status::Yield);
    vm.pop(1); // drop the yielded 1

    vm.push_integer(32);
    let (st, n) = vm.resume(co, 1);
    assert_eq!(st, Status::Ok);
    assert_eq!(n, 1);
    assert_eq!(vm.to_integer(-1), Some(42));
}

#[test]
fn error_inside_coroutine_kills_it() {
    fn boom(vm: &mut Vm) -> Result<usize, Unwind> {
        Err(vm.raise_runtime("kaboom"))
    }
    let mut vm = Vm::new();
    let co = vm.create_thread();
    vm.push_cfunction(boom);
    vm.xmove(co, 1);
    let (st, n) = vm.resume(co, 0);
    assert_eq!(st, Status::ErrRun);
    assert_eq!(n, 1);
    let msg = vm.to_lstring(-1).unwrap();
    assert!(String::from_utf8_lossy(&msg).contains("kaboom"));
    assert_eq!(vm.co_status(co), CoStatus::Dead);
}

#[test]
fn yield_inside_arith_metamethod_resumes_mid_instruction() {
    // The coroutine computes t + 5 where __add yields; the value passed
    // to the second resume becomes the metamethod result, and the ADD
    // must complete with it.
    let mut vm = Vm::new();

    fn yielding_add(vm: &mut Vm) -> Result<usize, Unwind> {
        Err(vm.yield_values(0))
    }

    let mut b = ProtoBuilder::new(1, 4);
    let k5 = b.constant(Constant::Int(5));
    b.op(Instr::abc(OpCode::Add, 1, 0, rk_const(k5)));
    b.op(Instr::abc(OpCode::Return, 1, 2, 0));
    let p = b.build(&mut vm);

    // t with __add = yielding_add
    vm.new_table();
    vm.new_table();
    vm.push_cfunction(yielding_add);
    vm.set_field(-2, "__add").unwrap();
    vm.set_metatable(-2);

    let co = vm.create_thread();
    vm.push_proto_closure(p);
    vm.xmove(co, 1);
    vm.push_value(-2); // the table becomes the resume argument

    let (st, n) = vm.resume(co, 1);
    assert_eq!(st, Status::Yield);
    assert_eq!(n, 0);

    vm.push_integer(42);
    let (st, n) = vm.resume(co, 1);
    assert_eq!(st, Status::Ok);
    assert_eq!(n, 1);
    assert_eq!(
        vm.to_integer(-1),
        Some(42),
        "the resumed value must land in the ADD destination register"
    );
}

#[test]
fn le_via_lt_negates_across_yield() {
    // The coroutine evaluates a <= b where only __lt exists and it
    // yields; the resumed truth value must come back NEGATED, because
    // the fallback computed not (b < a).
    let mut vm = Vm::new();

    fn yielding_lt(vm: &mut Vm) -> Result<usize, Unwind> {
        Err(vm.yield_values(0))
    }

    // code: if (r0 <= r1) != 1 then skip; LOADBOOL paths; return bool
    let mut b = ProtoBuilder::new(2, 4);
    b.op(Instr::abc(OpCode::Le, 1, 0, 1));
    b.op(Instr::asbx(OpCode::Jmp, 0, 1));
    b.op(Instr::abc(OpCode::LoadBool, 2, 0, 1));
    b.op(Instr::abc(OpCode::LoadBool, 2, 1, 0));
    b.op(Instr::abc(OpCode::Return, 2, 2, 0));
    let p = b.build(&mut vm);

    // two tables sharing a metatable that only defines __lt
    vm.new_table(); // mt
    vm.push_cfunction(yielding_lt);
    vm.set_field(-2, "__lt").unwrap();
    vm.new_table(); // a
    vm.push_value(-2);
    vm.set_metatable(-2);
    vm.new_table(); // b
    vm.push_value(-3);
    vm.set_metatable(-2);

    // stack here: mt, a, b
    let co = vm.create_thread();
    vm.push_proto_closure(p);
    vm.xmove(co, 1);
    vm.push_value(-3); // a
    vm.push_value(-3); // b
    let (st, _) = vm.resume(co, 2);
    assert_eq!(st, Status::Yield);

    // the __lt "returned" true, so a <= b must come back false
    vm.push_boolean(true);
    let (st, n) = vm.resume(co, 1);
    assert_eq!(st, Status::Ok);
    assert_eq!(n, 1);
    assert_eq!(vm.to_boolean(-1), false);
}

#[test]
fn coroutine_status_transitions() {
    let mut vm = Vm::new();
    let co = vm.create_thread();
    assert_eq!(vm.co_status(co), CoStatus::Suspended);
    vm.push_cfunction(c_yield);
    vm.xmove(co, 1);
    let (st, _) = vm.resume(co, 0);
    assert_eq!(st, Status::Yield);
    assert_eq!(vm.co_status(co), CoStatus::Suspended);
    let (st, _) = vm.resume(co, 0);
    assert_eq!(st, Status::Ok);
    assert_eq!(vm.co_status(co), CoStatus::Dead);
}

#[test]
fn yieldable_pcall_recovers_after_resume_error() {
    // driver(f): pcallk(f) with a continuation that reports the status
    fn driver(vm: &mut Vm) -> Result<usize, Unwind> {
        vm.push_value(1); // the protected function
        match vm.pcallk(0, 0, 0, 7, driver_cont)? {
            Status::Ok => {
                vm.push_integer(0);
                Ok(1)
            }
            _ => {
                vm.push_integer(-1);
                Ok(1)
            }
        }
    }
    fn driver_cont(vm: &mut Vm, status: Status, ctx: i64) -> Result<usize, Unwind> {
        assert_eq!(ctx, 7);
        vm.push_integer(if status.is_error() { 1 } else { 0 });
        Ok(1)
    }
    // the protected function yields, then errors after resumption
    fn yield_then_fail(vm: &mut Vm) -> Result<usize, Unwind> {
        Err(vm.yieldk(0, 0, fail_cont))
    }
    fn fail_cont(vm: &mut Vm, _status: Status, _ctx: i64) -> Result<usize, Unwind> {
        Err(vm.raise_runtime("late failure"))
    }

    let mut vm = Vm::new();
    let co = vm.create_thread();
    vm.push_cfunction(driver);
    vm.push_cfunction(yield_then_fail);
    vm.xmove(co, 2);

    let (st, _) = vm.resume(co, 1);
    assert_eq!(st, Status::Yield, "the yield crosses the protected call");
    let (st, n) = vm.resume(co, 0);
    assert_eq!(st, Status::Ok, "the error was caught by the yieldable pcall");
    assert_eq!(n, 1);
    assert_eq!(
        vm.to_integer(-1),
        Some(1),
        "the continuation observed the error status"
    );
}
