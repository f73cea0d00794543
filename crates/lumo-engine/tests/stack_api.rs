//! Embedder stack API invariants

use lumo_engine::{CompareOp, TypeTag, Vm};

#[test]
fn abs_index_roundtrip() {
    let mut vm = Vm::new();
    vm.push_integer(1);
    vm.push_integer(2);
    vm.push_integer(3);
    for i in 1..=3i64 {
        assert_eq!(vm.abs_index(i), i);
    }
    assert_eq!(vm.abs_index(-1), 3);
    assert_eq!(vm.abs_index(-3), 1);
    // pseudo-indices pass through
    assert_eq!(
        vm.abs_index(lumo_core::limits::REGISTRY_INDEX),
        lumo_core::limits::REGISTRY_INDEX
    );
}

#[test]
fn push_pop_leaves_stack_identical() {
    let mut vm = Vm::new();
    vm.push_integer(7);
    let baseline_top = vm.gettop();
    vm.gc_collect();
    let baseline = vm.heap_stats();

    vm.push_string("transient");
    vm.pop(1);
    assert_eq!(vm.gettop(), baseline_top);

    // the popped string must not survive as a hidden root
    vm.gc_collect();
    vm.gc_collect();
    assert_eq!(vm.heap_stats().strings, baseline.strings);
    assert_eq!(vm.to_integer(-1), Some(7));
}

#[test]
fn rotate_inverse_is_identity() {
    let mut vm = Vm::new();
    for i in 1..=5 {
        vm.push_integer(i);
    }
    vm.rotate(1, 2);
    vm.rotate(1, -2);
    for i in 1..=5 {
        assert_eq!(vm.to_integer(i as i64), Some(i));
    }
}

#[test]
fn rotate_moves_segment() {
    let mut vm = Vm::new();
    for i in 1..=4 {
        vm.push_integer(i);
    }
    vm.rotate(1, 1);
    let got: Vec<i64> = (1..=4).map(|i| vm.to_integer(i).unwrap()).collect();
    assert_eq!(got, [4, 1, 2, 3]);
}

#[test]
fn number_roundtrips_are_exact() {
    let mut vm = Vm::new();
    for &i in &[0i64, 1, -1, i64::MAX, i64::MIN, 1 << 53] {
        vm.push_integer(i);
        assert_eq!(vm.to_integer(-1), Some(i));
        vm.pop(1);
    }
    for &f in &[0.5f64, -0.0, 1e300, f64::MIN_POSITIVE, 370.5] {
        vm.push_number(f);
        assert_eq!(vm.to_number(-1).map(f64::to_bits), Some(f.to_bits()));
        vm.pop(1);
    }
}

#[test]
fn short_strings_intern_to_the_same_object() {
    let mut vm = Vm::new();
    vm.push_string("abc");
    vm.push_string("abc");
    assert!(vm.raw_equal(-1, -2));
    assert_eq!(vm.to_pointer(-1), vm.to_pointer(-2));

    // long strings are distinct objects with equal contents
    let long = "x".repeat(100);
    vm.push_string(&long);
    vm.push_string(&long);
    assert!(vm.raw_equal(-1, -2));
    assert_ne!(vm.to_pointer(-1), vm.to_pointer(-2));
}

#[test]
fn settop_nil_fills_growth() {
    let mut vm = Vm::new();
    vm.push_integer(1);
    vm.settop(4);
    assert_eq!(vm.gettop(), 4);
    assert_eq!(vm.type_of(2), TypeTag::Nil);
    assert_eq!(vm.type_of(4), TypeTag::Nil);
    vm.settop(1);
    assert_eq!(vm.gettop(), 1);
    assert_eq!(vm.to_integer(1), Some(1));
    vm.settop(-1);
    assert_eq!(vm.gettop(), 1);
}

#[test]
fn insert_remove_replace() {
    let mut vm = Vm::new();
    vm.push_integer(10);
    vm.push_integer(20);
    vm.push_integer(30);
    vm.insert(1); // 30 10 20
    assert_eq!(vm.to_integer(1), Some(30));
    assert_eq!(vm.to_integer(3), Some(20));
    vm.remove(1); // 10 20
    assert_eq!(vm.to_integer(1), Some(10));
    assert_eq!(vm.gettop(), 2);
    vm.push_integer(99);
    vm.replace(1); // 99 20
    assert_eq!(vm.to_integer(1), Some(99));
    assert_eq!(vm.gettop(), 2);
}

#[test]
fn type_queries() {
    let mut vm = Vm::new();
    vm.push_nil();
    vm.push_boolean(true);
    vm.push_integer(3);
    vm.push_number(3.5);
    vm.push_string("s");
    assert_eq!(vm.type_of(1), TypeTag::Nil);
    assert_eq!(vm.type_of(2), TypeTag::Boolean);
    assert_eq!(vm.type_of(3), TypeTag::Number);
    assert_eq!(vm.type_of(4), TypeTag::Number);
    assert_eq!(vm.type_of(5), TypeTag::String);
    assert_eq!(vm.type_of(42), TypeTag::None);
    assert!(vm.is_integer(3));
    assert!(!vm.is_integer(4));
    // numbers answer as strings (they convert)
    assert!(vm.is_string(3));
    assert!(!vm.is_string(2));
    assert!(vm.is_none(99));
    assert!(vm.is_none_or_nil(1));
}

#[test]
fn to_lstring_converts_numbers_in_place() {
    let mut vm = Vm::new();
    vm.push_integer(42);
    assert_eq!(vm.to_lstring(-1), Some(b"42".to_vec()));
    // the slot itself became a string
    assert_eq!(vm.type_of(-1), TypeTag::String);

    vm.push_number(2.5);
    assert_eq!(vm.to_lstring(-1), Some(b"2.5".to_vec()));

    vm.push_number(3.0);
    assert_eq!(vm.to_lstring(-1), Some(b"3.0".to_vec()));

    vm.push_boolean(true);
    assert_eq!(vm.to_lstring(-1), None);
}

#[test]
fn string_to_number_pushes_parsed_value() {
    let mut vm = Vm::new();
    assert!(vm.string_to_number(b"  0x10  "));
    assert_eq!(vm.to_integer(-1), Some(16));
    assert!(vm.string_to_number(b"2.5e1"));
    assert_eq!(vm.to_number(-1), Some(25.0));
    assert!(!vm.string_to_number(b"not a number"));
}

#[test]
fn checkstack_refuses_absurd_requests() {
    let mut vm = Vm::new();
    assert!(vm.checkstack(100));
    assert!(!vm.checkstack(usize::MAX / 2));
}

#[test]
fn xmove_carries_values_across_threads() {
    let mut vm = Vm::new();
    let co = vm.create_thread();
    vm.push_integer(11);
    vm.push_integer(22);
    vm.xmove(co, 2);
    // only the thread object remains on this side
    assert_eq!(vm.gettop(), 1);
}

#[test]
fn compare_on_plain_values() {
    let mut vm = Vm::new();
    vm.push_integer(1);
    vm.push_number(1.0);
    assert!(vm.compare(1, 2, CompareOp::Eq).unwrap());
    assert!(vm.compare(1, 2, CompareOp::Le).unwrap());
    assert!(!vm.compare(1, 2, CompareOp::Lt).unwrap());
    vm.push_string("a");
    vm.push_string("b");
    assert!(vm.compare(3, 4, CompareOp::Lt).unwrap());
    // exact mixed comparison near 2^63
    vm.push_integer(i64::MAX);
    vm.push_number(9.223372036854776e18);
    assert!(vm.compare(5, 6, CompareOp::Lt).unwrap());
    assert!(!vm.compare(5, 6, CompareOp::Eq).unwrap());
}

#[test]
fn arith_api_follows_dispatch_policy() {
    let mut vm = Vm::new();
    vm.push_integer(7);
    vm.push_integer(2);
    vm.arith(lumo_engine::ArithOp::IDiv).unwrap();
    assert_eq!(vm.to_integer(-1), Some(3));
    vm.pop(1);

    vm.push_integer(7);
    vm.push_integer(2);
    vm.arith(lumo_engine::ArithOp::Div).unwrap();
    assert_eq!(vm.to_number(-1), Some(3.5));
    assert!(!vm.is_integer(-1));
    vm.pop(1);

    vm.push_integer(5);
    vm.arith(lumo_engine::ArithOp::Unm).unwrap();
    assert_eq!(vm.to_integer(-1), Some(-5));
    vm.pop(1);

    // integer division by zero is an error, not a trap
    vm.push_integer(1);
    vm.push_integer(0);
    let e = vm.arith(lumo_engine::ArithOp::Mod);
    assert!(e.is_err());
}

#[test]
fn concat_api() {
    let mut vm = Vm::new();
    vm.push_string("a");
    vm.push_integer(1);
    vm.push_string("b");
    vm.concat(3).unwrap();
    assert_eq!(vm.to_lstring(-1), Some(b"a1b".to_vec()));
    assert_eq!(vm.gettop(), 1);

    vm.concat(0).unwrap();
    assert_eq!(vm.to_lstring(-1), Some(b"".to_vec()));
}

#[test]
fn rawlen_and_len() {
    let mut vm = Vm::new();
    vm.push_string("hello");
    assert_eq!(vm.rawlen(-1), 5);
    vm.new_table();
    for i in 1..=3 {
        vm.push_integer(i * 10);
        vm.raw_seti(-2, i).unwrap();
    }
    assert_eq!(vm.rawlen(-1), 3);
    vm.len(-1).unwrap();
    assert_eq!(vm.to_integer(-1), Some(3));
}

#[test]
fn next_iterates_from_host() {
    let mut vm = Vm::new();
    vm.new_table();
    for i in 1..=3 {
        vm.push_integer(i * 2);
        vm.raw_seti(-2, i).unwrap();
    }
    let mut seen = Vec::new();
    vm.push_nil();
    while vm.next(-2).unwrap() {
        let v = vm.to_integer(-1).unwrap();
        let k = vm.to_integer(-2).unwrap();
        seen.push((k, v));
        vm.pop(1); // keep the key for the next step
    }
    assert_eq!(seen, [(1, 2), (2, 4), (3, 6)]);
}

#[test]
fn version_and_registry() {
    let mut vm = Vm::new();
    assert_eq!(vm.version(), 503);
    // the registry is reachable through its pseudo-index
    assert_eq!(
        vm.type_of(lumo_core::limits::REGISTRY_INDEX),
        TypeTag::Table
    );
    vm.raw_geti(lumo_core::limits::REGISTRY_INDEX, lumo_core::limits::RIDX_GLOBALS);
    assert_eq!(vm.type_of(-1), TypeTag::Table);
    vm.raw_geti(
        lumo_core::limits::REGISTRY_INDEX,
        lumo_core::limits::RIDX_MAINTHREAD,
    );
    assert_eq!(vm.type_of(-1), TypeTag::Thread);
}
