//! Typed arrays and slices: API surface and specialized opcodes

use lumo_core::instr::rk_const;
use lumo_core::{Instr, OpCode, TypeCode};
use lumo_engine::{Constant, ProtoBuilder, Status, TypeTag, UpvalSpec, Vm};

#[test]
fn integer_array_round_trip() {
    let mut vm = Vm::new();
    vm.create_integer_array(3, 7);
    assert!(vm.is_integer_array(-1));
    assert!(!vm.is_number_array(-1));
    assert_eq!(vm.rawlen(-1), 3);
    for i in 1..=3 {
        assert_eq!(vm.int_array_get(-1, i), Some(7));
    }
    vm.int_array_set(-1, 2, 42).unwrap();
    assert_eq!(vm.int_array_get(-1, 2), Some(42));
    // append at len + 1
    vm.int_array_set(-1, 4, 8).unwrap();
    assert_eq!(vm.rawlen(-1), 4);
    // beyond len + 1 faults
    assert!(vm.int_array_set(-1, 6, 0).is_err());
    // out-of-range reads are nil through the table protocol
    vm.raw_geti(-1, 99);
    assert!(vm.is_nil(-1));
}

#[test]
fn number_array_narrows_integers() {
    let mut vm = Vm::new();
    vm.create_number_array(2, 0.5);
    assert!(vm.is_number_array(-1));
    vm.push_integer(3);
    vm.set_i(-2, 1).unwrap();
    assert_eq!(vm.number_array_get(-1, 1), Some(3.0));
    // non-numeric stores are rejected
    vm.push_boolean(true);
    assert!(vm.set_i(-2, 2).is_err());
}

#[test]
fn integer_array_rejects_bad_values() {
    let mut vm = Vm::new();
    vm.create_integer_array(1, 0);
    // exact floats narrow
    vm.push_number(9.0);
    vm.set_i(-2, 1).unwrap();
    assert_eq!(vm.int_array_get(-1, 1), Some(9));
    // fractional floats do not
    vm.push_number(9.5);
    assert!(vm.set_i(-2, 1).is_err());
    // nil never stores
    vm.push_nil();
    assert!(vm.set_i(-2, 1).is_err());
}

#[test]
fn typed_array_length_and_next() {
    let mut vm = Vm::new();
    vm.create_integer_array(2, 5);
    vm.len(-1).unwrap();
    assert_eq!(vm.to_integer(-1), Some(2));
    vm.pop(1);

    let mut pairs = Vec::new();
    vm.push_nil();
    while vm.next(-2).unwrap() {
        pairs.push((vm.to_integer(-2).unwrap(), vm.to_integer(-1).unwrap()));
        vm.pop(1);
    }
    assert_eq!(pairs, [(1, 5), (2, 5)]);
}

#[test]
fn slice_reads_and_writes_through_parent() {
    let mut vm = Vm::new();
    vm.create_integer_array(10, 0);
    for i in 1..=10 {
        vm.int_array_set(-1, i, i * 10).unwrap();
    }
    vm.create_slice(-1, 3, 4).unwrap(); // parent indices 3..=6
    assert!(vm.is_integer_array(-1), "slices answer as their element kind");
    assert_eq!(vm.rawlen(-1), 4);
    assert_eq!(vm.int_array_get(-1, 1), Some(30));
    assert_eq!(vm.int_array_get(-1, 4), Some(60));

    vm.int_array_set(-1, 2, -7).unwrap();
    assert_eq!(vm.int_array_get(-2, 4), Some(-7), "write visible in parent");

    // slices are fixed windows
    assert!(vm.int_array_set(-1, 5, 1).is_err());

    let (start, len) = vm.slice_info(-1).unwrap();
    assert_eq!((start, len), (3, 4));
    assert_eq!(vm.type_of(-1), TypeTag::Table); // the pushed parent
}

#[test]
fn slice_requires_a_typed_array_parent() {
    let mut vm = Vm::new();
    vm.new_table();
    assert!(vm.create_slice(-1, 1, 1).is_err());
    vm.create_integer_array(3, 0);
    assert!(vm.create_slice(-1, 0, 2).is_err(), "start is 1-based");
    assert!(vm.create_slice(-1, 2, 5).is_err(), "window exceeds parent");
}

#[test]
fn slice_anchors_its_parent_across_collection() {
    let mut vm = Vm::new();
    vm.create_integer_array(4, 11);
    vm.create_slice(-1, 1, 2).unwrap();
    // drop the direct parent reference; only the slice remains
    vm.remove(-2);
    vm.gc_collect();
    vm.gc_collect();
    assert_eq!(
        vm.int_array_get(-1, 1),
        Some(11),
        "the anchored parent must survive collection"
    );
}

#[test]
fn float_array_opcodes() {
    // function(a) a[1] = a[2]; return a[1] end over a number[]
    let mut vm = Vm::new();
    let mut b = ProtoBuilder::new(1, 6);
    let k1 = b.constant(Constant::Int(1));
    let k2 = b.constant(Constant::Int(2));
    b.op(Instr::abx(OpCode::LoadK, 1, k1));
    b.op(Instr::abx(OpCode::LoadK, 2, k2));
    b.op(Instr::abc(OpCode::GetAF, 3, 0, 2)); // r3 = a[r2]
    b.op(Instr::abc(OpCode::SetAF, 0, 1, 3)); // a[r1] = r3
    b.op(Instr::abc(OpCode::GetAF, 3, 0, 1));
    b.op(Instr::abc(OpCode::Return, 3, 2, 0));
    let p = b.build(&mut vm);

    vm.push_proto_closure(p);
    vm.create_number_array(2, 0.0);
    vm.number_array_set(-1, 2, 6.25).unwrap();
    assert_eq!(vm.pcall(1, 1, 0), Status::Ok);
    assert_eq!(vm.to_number(-1), Some(6.25));
}

#[test]
fn array_opcode_bounds_fault() {
    // GETAI on an out-of-range index is an error, unlike table reads
    let mut vm = Vm::new();
    let mut b = ProtoBuilder::new(1, 4);
    let k9 = b.constant(Constant::Int(9));
    b.op(Instr::abx(OpCode::LoadK, 1, k9));
    b.op(Instr::abc(OpCode::GetAI, 2, 0, 1));
    b.op(Instr::abc(OpCode::Return, 2, 2, 0));
    let p = b.build(&mut vm);

    vm.push_proto_closure(p);
    vm.create_integer_array(3, 0);
    assert_eq!(vm.pcall(1, 1, 0), Status::ErrRun);
    let msg = vm.to_lstring(-1).unwrap();
    assert!(String::from_utf8_lossy(&msg).contains("out of range"));
}

#[test]
fn addff_fast_path() {
    let mut vm = Vm::new();
    let mut b = ProtoBuilder::new(2, 4);
    b.op(Instr::abc(OpCode::AddFF, 2, 0, 1));
    b.op(Instr::abc(OpCode::Return, 2, 2, 0));
    let p = b.build(&mut vm);

    vm.push_proto_closure(p);
    vm.push_number(1.5);
    vm.push_number(2.25);
    assert_eq!(vm.pcall(2, 1, 0), Status::Ok);
    assert_eq!(vm.to_number(-1), Some(3.75));
    vm.pop(1);

    // feeding it an integer violates the static contract
    vm.push_proto_closure(p);
    vm.push_number(1.5);
    vm.push_integer(2);
    assert_eq!(vm.pcall(2, 1, 0), Status::ErrRun);
}

#[test]
fn array_typed_moves() {
    let mut vm = Vm::new();
    let mut b = ProtoBuilder::new(1, 3);
    b.op(Instr::abc(OpCode::MoveAI, 1, 0, 0));
    b.op(Instr::abc(OpCode::Return, 1, 2, 0));
    let p = b.build(&mut vm);

    vm.push_proto_closure(p);
    vm.create_integer_array(1, 0);
    assert_eq!(vm.pcall(1, 1, 0), Status::Ok);
    assert!(vm.is_integer_array(-1));
    vm.pop(1);

    vm.push_proto_closure(p);
    vm.create_number_array(1, 0.0);
    assert_eq!(vm.pcall(1, 1, 0), Status::ErrRun);
    vm.pop(1);

    // MOVETAB wants a generic table, not an array
    let mut b2 = ProtoBuilder::new(1, 3);
    b2.op(Instr::abc(OpCode::MoveTab, 1, 0, 0));
    b2.op(Instr::abc(OpCode::Return, 1, 2, 0));
    let p2 = b2.build(&mut vm);
    vm.push_proto_closure(p2);
    vm.create_integer_array(1, 0);
    assert_eq!(vm.pcall(1, 1, 0), Status::ErrRun);
}

#[test]
fn typed_upvalue_store_checks() {
    // function(v) up = v end with up annotated as integer
    let mut vm = Vm::new();
    let mut b = ProtoBuilder::new(1, 3);
    b.upval(UpvalSpec {
        in_stack: false,
        index: 0,
        ty: Some(TypeCode::Int),
        name: Some("up".to_string()),
    });
    b.op(Instr::abc(OpCode::SetUpvalT, 0, 0, TypeCode::Int as u32));
    b.op(Instr::abc(OpCode::Return, 0, 1, 0));
    let p = b.build(&mut vm);

    vm.push_proto_closure(p);
    vm.push_integer(5);
    assert_eq!(vm.pcall(1, 0, 0), Status::Ok);

    vm.push_proto_closure(p);
    vm.push_number(5.5);
    assert_eq!(vm.pcall(1, 0, 0), Status::ErrRun);
}

#[test]
fn setai_narrows_constants() {
    // SETAI with an RK constant float that narrows exactly
    let mut vm = Vm::new();
    let mut b = ProtoBuilder::new(1, 4);
    let k1 = b.constant(Constant::Int(1));
    let kf = b.constant(Constant::Float(12.0));
    b.op(Instr::abx(OpCode::LoadK, 1, k1));
    b.op(Instr::abc(OpCode::SetAI, 0, 1, rk_const(kf)));
    b.op(Instr::abc(OpCode::Return, 0, 1, 0));
    let p = b.build(&mut vm);

    vm.push_proto_closure(p);
    vm.create_integer_array(1, 0);
    vm.push_value(-1);
    vm.insert(-3); // keep a reference below the call
    assert_eq!(vm.pcall(1, 0, 0), Status::Ok);
    assert_eq!(vm.int_array_get(-1, 1), Some(12));
}
