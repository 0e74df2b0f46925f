use assert_cmd::cargo::cargo_bin_cmd;
use std::fs;
use tempfile::tempdir;

use callgraph_core::ir::builder::ModuleBuilder;
use callgraph_core::ir::{Constant, Linkage, Operand, Program, TypeKind};

/// A whole-program module with one vtable-dispatched call: the vtable global
/// carries `!type` metadata and the call loads slot 1 under an
/// `assume(type.test(...))`.
fn linked_program() -> Program {
    let mut prog = Program::new();
    let void = prog.types.void();
    let i1 = prog.types.int(1);
    let i8p = prog.types.i8_ptr();
    let i8pp = prog.types.pointer(i8p);
    let i8ppp = prog.types.pointer(i8pp);
    let metadata = prog.types.intern(TypeKind::Metadata);
    let vt_arr = prog.types.array(i8p, 2);
    let vt_ty = prog.types.anon_struct(&[vt_arr]);
    let method_fty = prog.types.function(void, &[i8p], false);
    let method_ptr = prog.types.pointer(method_fty);
    let tt_fty = prog.types.function(i1, &[i8p, metadata], false);
    let assume_fty = prog.types.function(void, &[i1], false);
    let main_fty = prog.types.function(void, &[i8ppp], false);

    let mut mb = ModuleBuilder::new(&mut prog, "linked.bc", "widget.cpp");
    let dtor = mb.define_function("_ZN6WidgetD1Ev", method_fty, Linkage::External);
    let draw = mb.define_function("_ZN6Widget4drawEv", method_fty, Linkage::External);
    let type_test = mb.declare_function("llvm.type.test", tt_fty, Linkage::External);
    let assume = mb.declare_function("llvm.assume", assume_fty, Linkage::External);

    let dtor_cast = mb.const_bitcast(Constant::Function(dtor), i8p);
    let draw_cast = mb.const_bitcast(Constant::Function(draw), i8p);
    let vt_init = Constant::Aggregate {
        ty: vt_ty,
        elements: vec![Constant::Aggregate { ty: vt_arr, elements: vec![dtor_cast, draw_cast] }],
    };
    let vt = mb.add_global("_ZTV6Widget", vt_ty, Some(vt_init));
    mb.set_global_constant(vt);
    mb.add_global_type_metadata(vt, "_ZTS6Widget", 0);

    let caller = mb.define_function("call_draw", main_fty, Linkage::External);
    let mut b = mb.body(caller);
    let vtable = b.load(Operand::Arg(0));
    let vtable_i8 = b.bitcast(vtable.clone(), i8p);
    let test = b.call_direct(
        type_test,
        vec![vtable_i8, Operand::Const(Constant::Metadata("_ZTS6Widget".into()))],
    );
    b.call_direct(assume, vec![test]);
    let slot = b.gep(i8p, vtable, &[1]);
    let fp = b.load(slot);
    let fp_typed = b.bitcast(fp, method_ptr);
    let this = b.null(i8p);
    b.call_indirect(method_fty, fp_typed, vec![this]);
    b.ret(None);
    drop(mb);
    prog
}

/// A trivial separate translation unit, standing in for the per-TU inputs.
fn plain_program() -> Program {
    let mut prog = Program::new();
    let void = prog.types.void();
    let fty = prog.types.function(void, &[], false);
    let mut mb = ModuleBuilder::new(&mut prog, "unit.bc", "unit.c");
    let tick = mb.define_function("tick", fty, Linkage::External);
    mb.set_subprogram(tick, "tick", "unit.c", 1);
    let main = mb.define_function("main", fty, Linkage::External);
    mb.set_subprogram(main, "main", "unit.c", 4);
    let mut b = mb.body(main);
    b.set_loc("unit.c", 5);
    b.call_direct(tick, vec![]);
    b.ret(None);
    drop(mb);
    prog
}

#[test]
fn linked_bitcode_enables_virtual_rows() {
    let dir = tempdir().expect("tempdir");
    let unit = dir.path().join("unit.json");
    fs::write(&unit, serde_json::to_string(&plain_program()).expect("serialize")).expect("write");
    let linked = dir.path().join("linked.json");
    fs::write(&linked, serde_json::to_string(&linked_program()).expect("serialize"))
        .expect("write");
    let out = dir.path().join("cg.csv");

    cargo_bin_cmd!("callgraph")
        .arg(&unit)
        .arg("--cpp-linked-bitcode")
        .arg(&linked)
        .arg("-o")
        .arg(&out)
        .assert()
        .success();

    let text = fs::read_to_string(&out).expect("read csv");
    assert!(text.contains("\"tick\""), "per-TU rows still present");
    assert!(
        text.contains("\"call_draw\"")
            && text.contains("\"_ZN6Widget4drawEv\"")
            && text.contains("\"virtual\""),
        "virtual dispatch resolved through the vtable: {text}"
    );
    assert!(!text.contains("_ZN6WidgetD1Ev"), "the other slot is not a candidate");
}

#[test]
fn demangle_all_rewrites_symbols() {
    let dir = tempdir().expect("tempdir");
    let unit = dir.path().join("unit.json");
    fs::write(&unit, serde_json::to_string(&plain_program()).expect("serialize")).expect("write");
    let linked = dir.path().join("linked.json");
    fs::write(&linked, serde_json::to_string(&linked_program()).expect("serialize"))
        .expect("write");
    let out = dir.path().join("cg.csv");

    cargo_bin_cmd!("callgraph")
        .arg(&unit)
        .arg("--cpp-linked-bitcode")
        .arg(&linked)
        .arg("--demangle")
        .arg("demangle_all")
        .arg("-o")
        .arg(&out)
        .assert()
        .success();

    let text = fs::read_to_string(&out).expect("read csv");
    assert!(text.contains("\"Widget::draw()\""), "demangled callee name: {text}");
}
