use assert_cmd::cargo::cargo_bin_cmd;
use std::fs;
use tempfile::tempdir;

use callgraph_core::ir::builder::ModuleBuilder;
use callgraph_core::ir::{Constant, Linkage, Operand, Program};

/// Two struct constants assign the same field with different handlers; main
/// calls through one of them, and also calls a helper directly.
fn fixture_program() -> Program {
    let mut prog = Program::new();
    let void = prog.types.void();
    let handler_fty = prog.types.function(void, &[], false);
    let fptr = prog.types.pointer(handler_fty);
    let slot_ty = prog.types.struct_type("struct.slot", &[fptr]);

    let mut mb = ModuleBuilder::new(&mut prog, "prog.bc", "prog.c");
    let t1 = mb.define_function("handler_one", handler_fty, Linkage::External);
    mb.set_subprogram(t1, "handler_one", "prog.c", 3);
    let t2 = mb.define_function("handler_two", handler_fty, Linkage::External);
    mb.set_subprogram(t2, "handler_two", "prog.c", 7);
    let helper = mb.define_function("helper", handler_fty, Linkage::External);
    mb.set_subprogram(helper, "helper", "prog.c", 11);

    let g1 = mb.add_global(
        "slot_one",
        slot_ty,
        Some(Constant::Aggregate { ty: slot_ty, elements: vec![Constant::Function(t1)] }),
    );
    mb.add_global(
        "slot_two",
        slot_ty,
        Some(Constant::Aggregate { ty: slot_ty, elements: vec![Constant::Function(t2)] }),
    );

    let main = mb.define_function("main", handler_fty, Linkage::External);
    mb.set_subprogram(main, "main", "prog.c", 15);
    let slot = mb.const_gep(slot_ty, Constant::Global(g1), &[0, 0]);
    let mut b = mb.body(main);
    b.set_loc("prog.c", 16);
    b.call_direct(helper, vec![]);
    b.set_loc("prog.c", 17);
    let fp = b.load(Operand::Const(slot));
    b.call_indirect(handler_fty, fp, vec![]);
    b.ret(None);
    drop(mb);
    prog
}

fn write_fixture(dir: &std::path::Path) -> std::path::PathBuf {
    let input = dir.join("prog.json");
    fs::write(&input, serde_json::to_string(&fixture_program()).expect("serialize"))
        .expect("write fixture");
    input
}

#[test]
fn json_module_produces_direct_and_indirect_rows() {
    let dir = tempdir().expect("tempdir");
    let input = write_fixture(dir.path());
    let out = dir.path().join("cg.csv");

    cargo_bin_cmd!("callgraph").arg(&input).arg("-o").arg(&out).assert().success();

    let text = fs::read_to_string(&out).expect("read csv");
    let mut lines = text.lines();
    assert!(
        lines.next().expect("header").starts_with("\"caller_filename\",\"caller_function\""),
        "header row first"
    );
    assert!(text.contains("\"prog.c\",\"main\",\"15\",\"16\",\"prog.c\",\"helper\",\"11\",\"direct\""));
    // The indirect site keeps both handlers assigned to that field.
    assert!(text.contains("\"prog.c\",\"handler_one\",\"3\",\"indirect\",\"\",\"\",\"MLTA\""));
    assert!(text.contains("\"prog.c\",\"handler_two\",\"7\",\"indirect\",\"\",\"\",\"MLTA\""));
}

#[test]
fn ta_only_mode_tags_rows_with_ta() {
    let dir = tempdir().expect("tempdir");
    let input = write_fixture(dir.path());
    let out = dir.path().join("cg.csv");

    cargo_bin_cmd!("callgraph")
        .arg(&input)
        .arg("--analysis")
        .arg("ta_only")
        .arg("-o")
        .arg(&out)
        .assert()
        .success();

    let text = fs::read_to_string(&out).expect("read csv");
    assert!(text.contains("\"indirect\",\"\",\"\",\"TA\""));
    assert!(!text.contains("\"MLTA\""));
    // Direct rows are unaffected by the analysis mode.
    assert!(text.contains("\"helper\",\"11\",\"direct\""));
}

#[test]
fn response_file_inputs_are_expanded() {
    let dir = tempdir().expect("tempdir");
    let input = write_fixture(dir.path());
    let list = dir.path().join("inputs.txt");
    fs::write(&list, format!("{}\n", input.display())).expect("write list");
    let out = dir.path().join("cg.csv");

    cargo_bin_cmd!("callgraph")
        .arg(format!("@{}", list.display()))
        .arg("-o")
        .arg(&out)
        .assert()
        .success();

    let text = fs::read_to_string(&out).expect("read csv");
    assert!(text.contains("\"indirect\""));
}
