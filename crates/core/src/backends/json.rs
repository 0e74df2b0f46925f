//! JSON module loader.
//!
//! A `.json` input is a serialized [`Program`] dump (one or more modules plus
//! the tables they reference). This is the always-available interchange
//! format: the integration corpus encodes whole scenarios this way, and it
//! needs no compiler toolchain at load time.

use std::path::Path;

use crate::ir::{ModuleId, Program};

use super::LoadError;

pub fn load(prog: &mut Program, path: &Path) -> Result<Vec<ModuleId>, LoadError> {
    let text = std::fs::read_to_string(path)
        .map_err(|source| LoadError::Io { path: path.to_path_buf(), source })?;
    let mut dump: Program = serde_json::from_str(&text)
        .map_err(|e| LoadError::Parse { path: path.to_path_buf(), message: e.to_string() })?;
    // The structural intern index is not part of the dump.
    dump.types.rebuild_index();
    Ok(prog.absorb(dump))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::ModuleBuilder;
    use crate::ir::{Linkage, Operand};

    #[test]
    fn dump_and_reload_round_trips_into_another_program() {
        let mut original = Program::new();
        let void = original.types.void();
        let fty = original.types.function(void, &[], false);
        let fptr = original.types.pointer(fty);
        let st = original.types.struct_type("struct.slot", &[fptr]);

        let mut mb = ModuleBuilder::new(&mut original, "m.bc", "m.c");
        let target = mb.define_function("target", fty, Linkage::External);
        let g = mb.add_global("slot", st, None);
        let main = mb.define_function("main", fty, Linkage::External);
        let mut b = mb.body(main);
        let base = b.global_addr(g);
        let field = b.gep(st, base, &[0, 0]);
        let addr = b.func_addr(target);
        b.store(addr, field);
        drop(mb);

        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("m.json");
        std::fs::write(&path, serde_json::to_string(&original).expect("serialize"))
            .expect("write dump");

        // Load into a program that already has content, forcing a remap.
        let mut dest = Program::new();
        let i128t = dest.types.int(128);
        let _ = dest.types.pointer(i128t);
        let ids = load(&mut dest, &path).expect("load");
        assert_eq!(ids.len(), 1);
        let module = dest.module(ids[0]);
        assert_eq!(module.functions.len(), 2);
        let main2 = *module.functions.last().expect("main present");

        // The reloaded struct interned correctly and interning still works.
        let st2 = dest.types.named_struct("struct.slot").expect("struct present");
        assert_eq!(dest.types.field_count(st2), 1);
        let void2 = dest.types.void();
        let fty2 = dest.types.function(void2, &[], false);
        let fptr2 = dest.types.pointer(fty2);
        assert_eq!(dest.types.field_type(st2, 0), Some(fptr2));

        // Instruction operands were remapped to the new function ids.
        let body = &dest.func(main2).insts;
        assert!(body.iter().any(|i| {
            matches!(
                &i.kind,
                crate::ir::InstKind::Store { value: Operand::Const(c), .. }
                    if c.as_function().map(|f| dest.func(f).name.as_str()) == Some("target")
            )
        }));
    }
}
