//! Interpreter execution over hand-assembled prototypes
//!
//! The compiler front end lives elsewhere, so these tests assemble
//! bytecode directly through `ProtoBuilder`, instantiate a closure, and
//! drive it through the embedder API.

use lumo_core::instr::rk_const;
use lumo_core::{Instr, OpCode};
use lumo_engine::{Constant, ProtoBuilder, Status, Unwind, UpvalSpec, Vm};

/// Run `proto`-shaped code with `args` pushed, expecting `nresults`.
fn run(vm: &mut Vm, b: &ProtoBuilder, args: &[i64], nresults: i32) -> Status {
    let p = b.build(vm);
    vm.push_proto_closure(p);
    for &a in args {
        vm.push_integer(a);
    }
    vm.pcall(args.len(), nresults, 0)
}

#[test]
fn constants_and_moves() {
    let mut vm = Vm::new();
    let mut b = ProtoBuilder::new(0, 4);
    let k = b.constant(Constant::Int(123));
    b.op(Instr::abx(OpCode::LoadK, 0, k));
    b.op(Instr::abc(OpCode::Move, 1, 0, 0));
    b.op(Instr::abc(OpCode::Return, 1, 2, 0));
    assert_eq!(run(&mut vm, &b, &[], 1), Status::Ok);
    assert_eq!(vm.to_integer(-1), Some(123));
}

#[test]
fn loadbool_skip_and_loadnil_run() {
    let mut vm = Vm::new();
    let mut b = ProtoBuilder::new(0, 4);
    b.op(Instr::abc(OpCode::LoadNil, 0, 2, 0)); // r0..r2 = nil
    b.op(Instr::abc(OpCode::LoadBool, 0, 1, 1)); // r0 = true, skip next
    b.op(Instr::abc(OpCode::LoadBool, 0, 0, 0)); // skipped
    b.op(Instr::abc(OpCode::Return, 0, 2, 0));
    assert_eq!(run(&mut vm, &b, &[], 1), Status::Ok);
    assert_eq!(vm.to_boolean(-1), true);
}

#[test]
fn arithmetic_dispatch_in_bytecode() {
    let mut vm = Vm::new();
    let mut b = ProtoBuilder::new(2, 6);
    // r2 = r0 + r1 ; r3 = r2 / k2 ; return r2, r3
    let k2 = b.constant(Constant::Int(2));
    b.op(Instr::abc(OpCode::Add, 2, 0, 1));
    b.op(Instr::abc(OpCode::Div, 3, 2, rk_const(k2)));
    b.op(Instr::abc(OpCode::Return, 2, 3, 0));
    assert_eq!(run(&mut vm, &b, &[30, 12], 2), Status::Ok);
    assert_eq!(vm.to_integer(-2), Some(42));
    assert_eq!(vm.to_number(-1), Some(21.0));
    assert!(!vm.is_integer(-1), "division always produces a float");
}

#[test]
fn integer_overflow_wraps() {
    let mut vm = Vm::new();
    let mut b = ProtoBuilder::new(0, 3);
    let kmax = b.constant(Constant::Int(i64::MAX));
    let k1 = b.constant(Constant::Int(1));
    b.op(Instr::abc(OpCode::Add, 0, rk_const(kmax), rk_const(k1)));
    b.op(Instr::abc(OpCode::Return, 0, 2, 0));
    assert_eq!(run(&mut vm, &b, &[], 1), Status::Ok);
    assert_eq!(vm.to_integer(-1), Some(i64::MIN));
}

#[test]
fn comparison_drives_branches() {
    // return (a < b) via: LT; JMP; LOADBOOL false; RETURN / LOADBOOL true
    let mut vm = Vm::new();
    let mut b = ProtoBuilder::new(2, 4);
    b.op(Instr::abc(OpCode::Lt, 1, 0, 1)); // if (r0 < r1) != 1 then pc++
    b.op(Instr::asbx(OpCode::Jmp, 0, 1)); // taken when r0 < r1
    b.op(Instr::abc(OpCode::LoadBool, 2, 0, 1)); // false, skip next
    b.op(Instr::abc(OpCode::LoadBool, 2, 1, 0)); // true
    b.op(Instr::abc(OpCode::Return, 2, 2, 0));
    assert_eq!(run(&mut vm, &b, &[1, 2], 1), Status::Ok);
    assert_eq!(vm.to_boolean(-1), true);
    vm.pop(1);
    assert_eq!(run(&mut vm, &b, &[2, 1], 1), Status::Ok);
    assert_eq!(vm.to_boolean(-1), false);
}

#[test]
fn numeric_for_loop_sums() {
    // sum = 0; for i = 1, n do sum = sum + i end; return sum
    let mut vm = Vm::new();
    let mut b = ProtoBuilder::new(1, 8);
    let k0 = b.constant(Constant::Int(0));
    let k1 = b.constant(Constant::Int(1));
    b.op(Instr::abx(OpCode::LoadK, 1, k0)); // r1 = sum
    b.op(Instr::abx(OpCode::LoadK, 2, k1)); // r2 = init
    b.op(Instr::abc(OpCode::Move, 3, 0, 0)); // r3 = limit (arg)
    b.op(Instr::abx(OpCode::LoadK, 4, k1)); // r4 = step
    b.op(Instr::asbx(OpCode::ForPrep, 2, 1)); // to FORLOOP
    b.op(Instr::abc(OpCode::Add, 1, 1, 5)); // body: sum += i (r5)
    b.op(Instr::asbx(OpCode::ForLoop, 2, -2));
    b.op(Instr::abc(OpCode::Return, 1, 2, 0));
    assert_eq!(run(&mut vm, &b, &[100], 1), Status::Ok);
    assert_eq!(vm.to_integer(-1), Some(5050));
}

#[test]
fn for_loop_fractional_limit_floors() {
    // for i = 1, 4.5 runs through 4 and stays an integer loop
    let mut vm = Vm::new();
    let mut b = ProtoBuilder::new(0, 8);
    let k0 = b.constant(Constant::Int(0));
    let k1 = b.constant(Constant::Int(1));
    let klim = b.constant(Constant::Float(4.5));
    b.op(Instr::abx(OpCode::LoadK, 1, k0));
    b.op(Instr::abx(OpCode::LoadK, 2, k1));
    b.op(Instr::abx(OpCode::LoadK, 3, klim));
    b.op(Instr::abx(OpCode::LoadK, 4, k1));
    b.op(Instr::asbx(OpCode::ForPrep, 2, 1));
    b.op(Instr::abc(OpCode::Add, 1, 1, 5));
    b.op(Instr::asbx(OpCode::ForLoop, 2, -2));
    b.op(Instr::abc(OpCode::Return, 1, 2, 0));
    assert_eq!(run(&mut vm, &b, &[], 1), Status::Ok);
    assert_eq!(vm.to_integer(-1), Some(10));
}

#[test]
fn for_loop_float_form() {
    // for i = 1.0, 2.0, 0.5 do sum = sum + i end -> 4.5
    let mut vm = Vm::new();
    let mut b = ProtoBuilder::new(0, 8);
    let k0 = b.constant(Constant::Float(0.0));
    b.op(Instr::abx(OpCode::LoadK, 1, k0));
    let ki = b.constant(Constant::Float(1.0));
    let kl = b.constant(Constant::Float(2.0));
    let ks = b.constant(Constant::Float(0.5));
    b.op(Instr::abx(OpCode::LoadK, 2, ki));
    b.op(Instr::abx(OpCode::LoadK, 3, kl));
    b.op(Instr::abx(OpCode::LoadK, 4, ks));
    b.op(Instr::asbx(OpCode::ForPrep, 2, 1));
    b.op(Instr::abc(OpCode::Add, 1, 1, 5));
    b.op(Instr::asbx(OpCode::ForLoop, 2, -2));
    b.op(Instr::abc(OpCode::Return, 1, 2, 0));
    assert_eq!(run(&mut vm, &b, &[], 1), Status::Ok);
    assert_eq!(vm.to_number(-1), Some(4.5));
}

#[test]
fn typed_integer_for_loop_fills_array_without_allocating() {
    // for i = 1, 5 do a[i] = i * i end over an integer array
    let mut vm = Vm::new();
    let mut b = ProtoBuilder::new(1, 8);
    let k1 = b.constant(Constant::Int(1));
    let k5 = b.constant(Constant::Int(5));
    b.op(Instr::abx(OpCode::LoadK, 1, k1)); // init
    b.op(Instr::abx(OpCode::LoadK, 2, k5)); // limit
    b.op(Instr::abx(OpCode::LoadK, 3, k1)); // step
    b.op(Instr::asbx(OpCode::ForPrepII, 1, 2));
    b.op(Instr::abc(OpCode::MulII, 5, 4, 4)); // r5 = i * i
    b.op(Instr::abc(OpCode::SetAI, 0, 4, 5)); // a[i] = r5
    b.op(Instr::asbx(OpCode::ForLoopII, 1, -3));
    b.op(Instr::abc(OpCode::Return, 0, 1, 0));

    let p = b.build(&mut vm);
    vm.push_proto_closure(p);
    vm.create_integer_array(5, 0);
    // remember the array through the registry so we can inspect it
    vm.push_value(-1);
    vm.set_field(lumo_core::limits::REGISTRY_INDEX, "a").unwrap();

    let before = vm.heap_stats();
    assert_eq!(vm.pcall(1, 0, 0), Status::Ok);
    let after = vm.heap_stats();
    assert_eq!(
        before.objects, after.objects,
        "the typed loop must not allocate"
    );

    vm.get_field(lumo_core::limits::REGISTRY_INDEX, "a").unwrap();
    for (i, want) in [(1i64, 1i64), (2, 4), (3, 9), (4, 16), (5, 25)] {
        assert_eq!(vm.int_array_get(-1, i), Some(want));
    }
}

#[test]
fn million_tail_calls_stay_bounded() {
    // f(n) = n == 0 ? 42 : f(n - 1), always in tail position
    let mut vm = Vm::new();
    let mut b = ProtoBuilder::new(1, 4);
    let k0 = b.constant(Constant::Int(0));
    let k1 = b.constant(Constant::Int(1));
    let k42 = b.constant(Constant::Int(42));
    b.upval(UpvalSpec {
        in_stack: false,
        index: 0,
        ty: None,
        name: Some("self".to_string()),
    });
    b.op(Instr::abc(OpCode::Eq, 1, 0, rk_const(k0)));
    b.op(Instr::asbx(OpCode::Jmp, 0, 4)); // n == 0 -> return 42
    b.op(Instr::abc(OpCode::GetUpval, 1, 0, 0));
    b.op(Instr::abc(OpCode::Sub, 2, 0, rk_const(k1)));
    b.op(Instr::abc(OpCode::TailCall, 1, 2, 0));
    b.op(Instr::abc(OpCode::Return, 1, 0, 0));
    b.op(Instr::abx(OpCode::LoadK, 1, k42));
    b.op(Instr::abc(OpCode::Return, 1, 2, 0));

    let p = b.build(&mut vm);
    vm.push_proto_closure(p);
    // tie the self-reference knot through the upvalue
    vm.push_value(-1);
    assert!(vm.set_upvalue(-2, 1));

    vm.push_integer(1_000_000);
    assert_eq!(vm.pcall(1, 1, 0), Status::Ok);
    assert_eq!(vm.to_integer(-1), Some(42));
}

#[test]
fn closures_share_upvalue_cells() {
    // local x = 10
    // set = function(v) x = v end ; get = function() return x end
    // set(99) ; return get()
    let mut vm = Vm::new();

    let mut set_fn = ProtoBuilder::new(1, 2);
    set_fn.upval(UpvalSpec {
        in_stack: true,
        index: 0,
        ty: None,
        name: Some("x".to_string()),
    });
    set_fn.op(Instr::abc(OpCode::SetUpval, 0, 0, 0)); // upval x = arg
    set_fn.op(Instr::abc(OpCode::Return, 0, 1, 0));

    let mut get_fn = ProtoBuilder::new(0, 2);
    get_fn.upval(UpvalSpec {
        in_stack: true,
        index: 0,
        ty: None,
        name: Some("x".to_string()),
    });
    get_fn.op(Instr::abc(OpCode::GetUpval, 0, 0, 0));
    get_fn.op(Instr::abc(OpCode::Return, 0, 2, 0));

    let mut b = ProtoBuilder::new(0, 8);
    let k10 = b.constant(Constant::Int(10));
    let k99 = b.constant(Constant::Int(99));
    let p_set = b.child(set_fn);
    let p_get = b.child(get_fn);
    b.op(Instr::abx(OpCode::LoadK, 0, k10)); // x in r0
    b.op(Instr::abx(OpCode::Closure, 1, p_set));
    b.op(Instr::abx(OpCode::Closure, 2, p_get));
    b.op(Instr::abc(OpCode::Move, 3, 1, 0));
    b.op(Instr::abx(OpCode::LoadK, 4, k99));
    b.op(Instr::abc(OpCode::Call, 3, 2, 1)); // set(99)
    b.op(Instr::abc(OpCode::Move, 3, 2, 0));
    b.op(Instr::abc(OpCode::Call, 3, 1, 2)); // r3 = get()
    b.op(Instr::abc(OpCode::Return, 3, 2, 0));

    assert_eq!(run(&mut vm, &b, &[], 1), Status::Ok);
    assert_eq!(
        vm.to_integer(-1),
        Some(99),
        "writes through one closure must be visible through its sibling"
    );
}

#[test]
fn generic_for_loop_with_host_iterator() {
    fn iter(vm: &mut Vm) -> Result<usize, Unwind> {
        let ctl = vm.to_integer(2).unwrap_or(0);
        if ctl >= 3 {
            vm.push_nil();
            Ok(1)
        } else {
            vm.push_integer(ctl + 1);
            vm.push_integer((ctl + 1) * 100);
            Ok(2)
        }
    }

    let mut vm = Vm::new();
    let mut b = ProtoBuilder::new(1, 9);
    let k0 = b.constant(Constant::Int(0));
    b.op(Instr::abx(OpCode::LoadK, 1, k0)); // sum
    b.op(Instr::abc(OpCode::Move, 2, 0, 0)); // iterator fn
    b.op(Instr::abc(OpCode::LoadNil, 3, 0, 0)); // state
    b.op(Instr::abx(OpCode::LoadK, 4, k0)); // control
    b.op(Instr::asbx(OpCode::Jmp, 0, 1));
    b.op(Instr::abc(OpCode::Add, 1, 1, 6)); // body: sum += value
    b.op(Instr::abc(OpCode::TForCall, 2, 0, 2));
    b.op(Instr::asbx(OpCode::TForLoop, 4, -3));
    b.op(Instr::abc(OpCode::Return, 1, 2, 0));

    let p = b.build(&mut vm);
    vm.push_proto_closure(p);
    vm.push_cfunction(iter);
    assert_eq!(vm.pcall(1, 1, 0), Status::Ok);
    assert_eq!(vm.to_integer(-1), Some(600));
}

#[test]
fn vararg_forwarding() {
    // function(...) local a, b = ... ; return b end
    let mut vm = Vm::new();
    let mut b = ProtoBuilder::new(0, 4).vararg();
    b.op(Instr::abc(OpCode::Vararg, 0, 3, 0)); // r0, r1 = ...
    b.op(Instr::abc(OpCode::Return, 1, 2, 0));
    assert_eq!(run(&mut vm, &b, &[7, 8, 9], 1), Status::Ok);
    assert_eq!(vm.to_integer(-1), Some(8));
}

#[test]
fn newtable_setlist_and_len() {
    // return #{10, 20, 30}
    let mut vm = Vm::new();
    let mut b = ProtoBuilder::new(0, 6);
    let k10 = b.constant(Constant::Int(10));
    let k20 = b.constant(Constant::Int(20));
    let k30 = b.constant(Constant::Int(30));
    b.op(Instr::abc(OpCode::NewTable, 0, 3, 0));
    b.op(Instr::abx(OpCode::LoadK, 1, k10));
    b.op(Instr::abx(OpCode::LoadK, 2, k20));
    b.op(Instr::abx(OpCode::LoadK, 3, k30));
    b.op(Instr::abc(OpCode::SetList, 0, 3, 1));
    b.op(Instr::abc(OpCode::Len, 1, 0, 0));
    b.op(Instr::abc(OpCode::Return, 1, 2, 0));
    assert_eq!(run(&mut vm, &b, &[], 1), Status::Ok);
    assert_eq!(vm.to_integer(-1), Some(3));
}

#[test]
fn concat_opcode_coalesces() {
    // return "x" .. 1 .. "y"
    let mut vm = Vm::new();
    let mut b = ProtoBuilder::new(0, 6);
    let kx = b.str_constant("x");
    let k1 = b.constant(Constant::Int(1));
    let ky = b.str_constant("y");
    b.op(Instr::abx(OpCode::LoadK, 0, kx));
    b.op(Instr::abx(OpCode::LoadK, 1, k1));
    b.op(Instr::abx(OpCode::LoadK, 2, ky));
    b.op(Instr::abc(OpCode::Concat, 0, 0, 2));
    b.op(Instr::abc(OpCode::Return, 0, 2, 0));
    assert_eq!(run(&mut vm, &b, &[], 1), Status::Ok);
    assert_eq!(vm.to_lstring(-1), Some(b"x1y".to_vec()));
}

#[test]
fn test_and_testset() {
    // return a and b  (for integers both truthy -> b)
    let mut vm = Vm::new();
    let mut b = ProtoBuilder::new(2, 4);
    b.op(Instr::abc(OpCode::TestSet, 2, 0, 0)); // if r0 truthy, skip jump
    b.op(Instr::asbx(OpCode::Jmp, 0, 1));
    b.op(Instr::abc(OpCode::Move, 2, 1, 0));
    b.op(Instr::abc(OpCode::Return, 2, 2, 0));
    assert_eq!(run(&mut vm, &b, &[5, 6], 1), Status::Ok);
    assert_eq!(vm.to_integer(-1), Some(6));
}

#[test]
fn self_field_via_globals() {
    // obj = { get = function(self) return self.v end, v = 31 }
    // return obj:get()
    let mut vm = Vm::new();

    // method body: return self.v
    let mut m = ProtoBuilder::new(1, 3);
    let kv = m.str_constant("v");
    m.op(Instr::abc(OpCode::GetField, 1, 0, kv));
    m.op(Instr::abc(OpCode::Return, 1, 2, 0));

    let mut b = ProtoBuilder::new(0, 8);
    b.upval(UpvalSpec {
        in_stack: false,
        index: 0,
        ty: None,
        name: Some("_ENV".to_string()),
    });
    let p_m = b.child(m);
    let kobj = b.str_constant("obj");
    let kget = b.str_constant("get");
    let kv2 = b.str_constant("v");
    let k31 = b.constant(Constant::Int(31));
    b.op(Instr::abc(OpCode::NewTable, 0, 0, 2));
    b.op(Instr::abx(OpCode::Closure, 1, p_m));
    b.op(Instr::abc(OpCode::SetTable, 0, rk_const(kget), 1));
    b.op(Instr::abc(OpCode::SetTable, 0, rk_const(kv2), rk_const(k31)));
    b.op(Instr::abc(OpCode::SetTabUp, 0, rk_const(kobj), 0));
    b.op(Instr::abc(OpCode::GetTabUp, 2, 0, rk_const(kobj)));
    b.op(Instr::abc(OpCode::SelfOp, 3, 2, rk_const(kget)));
    b.op(Instr::abc(OpCode::Call, 3, 2, 2));
    b.op(Instr::abc(OpCode::Return, 3, 2, 0));

    assert_eq!(run(&mut vm, &b, &[], 1), Status::Ok);
    assert_eq!(vm.to_integer(-1), Some(31));

    // the global is visible from the host, too
    vm.get_global("obj").unwrap();
    assert!(vm.is_table(-1));
}

#[test]
fn typed_move_checks_raise() {
    let mut vm = Vm::new();
    let mut b = ProtoBuilder::new(1, 3);
    b.op(Instr::abc(OpCode::MoveI, 1, 0, 0));
    b.op(Instr::abc(OpCode::Return, 1, 2, 0));
    let p = b.build(&mut vm);

    vm.push_proto_closure(p);
    vm.push_integer(3);
    assert_eq!(vm.pcall(1, 1, 0), Status::Ok);
    assert_eq!(vm.to_integer(-1), Some(3));
    vm.pop(1);

    vm.push_proto_closure(p);
    vm.push_number(3.5);
    assert_eq!(vm.pcall(1, 1, 0), Status::ErrRun);
    let msg = vm.to_lstring(-1).unwrap();
    assert!(String::from_utf8_lossy(&msg).contains("expected integer"));
}

#[test]
fn totype_converts_or_raises() {
    let mut vm = Vm::new();
    let mut b = ProtoBuilder::new(1, 3);
    b.op(Instr::abc(OpCode::ToType, 1, 0, 0)); // to integer
    b.op(Instr::abc(OpCode::Return, 1, 2, 0));
    let p = b.build(&mut vm);

    vm.push_proto_closure(p);
    vm.push_number(4.0);
    assert_eq!(vm.pcall(1, 1, 0), Status::Ok);
    assert_eq!(vm.to_integer(-1), Some(4));
    assert!(vm.is_integer(-1));
    vm.pop(1);

    vm.push_proto_closure(p);
    vm.push_number(4.5);
    assert_eq!(vm.pcall(1, 1, 0), Status::ErrRun);
}

#[test]
fn protected_error_keeps_value_identity() {
    // pcall(function() error({code = 42}) end) delivers the same table
    fn raiser(vm: &mut Vm) -> Result<usize, Unwind> {
        Err(vm.error_value())
    }

    let mut vm = Vm::new();
    vm.new_table();
    vm.push_integer(42);
    vm.set_field(-2, "code").unwrap();
    let id = vm.to_pointer(-1);

    vm.push_cfunction(raiser);
    vm.push_value(-2); // the table as the error payload
    assert_eq!(vm.pcall(1, 1, 0), Status::ErrRun);
    assert_eq!(vm.to_pointer(-1), id, "error object must survive by identity");
    vm.get_field(-1, "code").unwrap();
    assert_eq!(vm.to_integer(-1), Some(42));
}

#[test]
fn error_handler_transforms_the_error() {
    fn raiser(vm: &mut Vm) -> Result<usize, Unwind> {
        Err(vm.raise_runtime("boom"))
    }
    fn handler(vm: &mut Vm) -> Result<usize, Unwind> {
        let msg = vm.to_lstring(1).unwrap_or_default();
        let wrapped = format!("wrapped: {}", String::from_utf8_lossy(&msg));
        vm.push_string(&wrapped);
        Ok(1)
    }

    let mut vm = Vm::new();
    vm.push_cfunction(handler);
    let h = vm.abs_index(-1);
    vm.push_cfunction(raiser);
    assert_eq!(vm.pcall(0, 1, h), Status::ErrRun);
    let msg = vm.to_lstring(-1).unwrap();
    assert!(String::from_utf8_lossy(&msg).starts_with("wrapped: "));
}

#[test]
fn count_hook_observes_execution() {
    use lumo_engine::{HookEvent, LumoError, MASK_COUNT};

    fn ticker(vm: &mut Vm, ev: HookEvent) -> Result<(), LumoError> {
        if ev == HookEvent::Count {
            vm.get_field(lumo_core::limits::REGISTRY_INDEX, "ticks")?;
            let n = vm.to_integer(-1).unwrap_or(0);
            vm.pop(1);
            vm.push_integer(n + 1);
            vm.set_field(lumo_core::limits::REGISTRY_INDEX, "ticks")?;
        }
        Ok(())
    }

    let mut vm = Vm::new();
    vm.push_integer(0);
    vm.set_field(lumo_core::limits::REGISTRY_INDEX, "ticks")
        .unwrap();

    // a loop that executes a few hundred instructions
    let mut b = ProtoBuilder::new(0, 8);
    let k0 = b.constant(Constant::Int(0));
    let k1 = b.constant(Constant::Int(1));
    let kn = b.constant(Constant::Int(100));
    b.op(Instr::abx(OpCode::LoadK, 1, k1));
    b.op(Instr::abx(OpCode::LoadK, 2, kn));
    b.op(Instr::abx(OpCode::LoadK, 3, k1));
    b.op(Instr::asbx(OpCode::ForPrep, 1, 1));
    b.op(Instr::abx(OpCode::LoadK, 5, k0));
    b.op(Instr::asbx(OpCode::ForLoop, 1, -2));
    b.op(Instr::abc(OpCode::Return, 0, 1, 0));
    let p = b.build(&mut vm);

    vm.set_hook(Some(ticker), MASK_COUNT, 10);
    vm.push_proto_closure(p);
    assert_eq!(vm.pcall(0, 0, 0), Status::Ok);
    vm.set_hook(None, 0, 0);

    vm.get_field(lumo_core::limits::REGISTRY_INDEX, "ticks")
        .unwrap();
    let ticks = vm.to_integer(-1).unwrap();
    assert!(ticks >= 20, "roughly one tick per ten instructions, got {}", ticks);
}

#[test]
fn hook_error_cancels_execution() {
    use lumo_engine::{HookEvent, LumoError, MASK_COUNT};

    fn canceller(_vm: &mut Vm, _ev: HookEvent) -> Result<(), LumoError> {
        Err(LumoError::Runtime("deadline exceeded".to_string()))
    }

    let mut vm = Vm::new();
    // an unbounded loop: JMP back to itself
    let mut b = ProtoBuilder::new(0, 4);
    b.op(Instr::asbx(OpCode::Jmp, 0, -1));
    b.op(Instr::abc(OpCode::Return, 0, 1, 0));
    let p = b.build(&mut vm);

    vm.set_hook(Some(canceller), MASK_COUNT, 100);
    vm.push_proto_closure(p);
    assert_eq!(vm.pcall(0, 0, 0), Status::ErrRun);
    vm.set_hook(None, 0, 0);
    let msg = vm.to_lstring(-1).unwrap();
    assert!(String::from_utf8_lossy(&msg).contains("deadline exceeded"));
}

#[test]
fn host_call_depth_is_bounded() {
    // a host function that re-enters itself through call() must hit the
    // native depth guard, not blow the native stack
    fn recurse(vm: &mut Vm) -> Result<usize, Unwind> {
        vm.push_cfunction(recurse);
        match vm.call(0, 0) {
            Ok(()) => Ok(0),
            Err(_) => Err(vm.raise_runtime("depth")),
        }
    }

    let mut vm = Vm::new();
    vm.push_cfunction(recurse);
    assert_eq!(vm.pcall(0, 0, 0), Status::ErrRun);
}
