//! The module pass that turns the fact base into call-graph rows, and the
//! iterative driver that runs it over every module.
//!
//! Direct calls are canonicalized through the global/unified function maps
//! and emitted as-is. Indirect calls consult the vtable pass first (when one
//! ran), then multi-layer type analysis, then the signature fallback,
//! according to the configured mode.

use std::io::Write;

use tracing::{debug, info, trace};

use crate::ir::{
    Callee, FuncId, Function, Inst, InstId, InstKind, ModuleId, Program, operand_as_function,
};
use crate::output::{CallRow, CallType, CsvSink, FoundWith, OutputError};

use super::facts::TypeFacts;
use super::fingerprint::func_hash;
use super::mlta::find_callees_with_mlta;
use super::ta::find_callees_with_type;
use super::vtable::VirtualCallTargets;
use super::{AnalysisType, Demangle};

/// Dispatcher configuration (mirrors the CLI flags).
#[derive(Debug, Clone, Copy, Default)]
pub struct CallGraphOptions {
    pub analysis: AnalysisType,
    pub demangle: Demangle,
}

/// Builds the whole-program call graph and streams rows into the sink.
pub struct CallGraphPass<'a, W: Write> {
    prog: &'a Program,
    opts: CallGraphOptions,
    sink: &'a mut CsvSink<W>,
    facts: TypeFacts,
    virtuals: Option<VirtualCallTargets>,
}

impl<'a, W: Write> CallGraphPass<'a, W> {
    pub fn new(prog: &'a Program, opts: CallGraphOptions, sink: &'a mut CsvSink<W>) -> Self {
        Self { prog, opts, sink, facts: TypeFacts::new(), virtuals: None }
    }

    /// Provide vtable-pass results for the dispatcher to consult.
    pub fn set_virtual_call_targets(&mut self, targets: VirtualCallTargets) {
        self.virtuals = Some(targets);
    }

    /// Read access to the accumulated facts (used by tests and diagnostics).
    pub fn facts(&self) -> &TypeFacts {
        &self.facts
    }

    /// Run the three phases: initialization sweeps to a fixpoint, the module
    /// pass until no module reports a change, then finalization.
    pub fn run(&mut self) -> Result<(), OutputError> {
        let total = self.prog.modules.len();
        info!("[CallGraph] initializing {total} modules");
        loop {
            let mut changed = false;
            for m in self.prog.module_ids() {
                changed |= self.facts.build_module(self.prog, m);
            }
            debug!(changed, "[CallGraph] initialization sweep");
            if !changed {
                break;
            }
        }

        let mut iter = 0u32;
        loop {
            iter += 1;
            let mut changed = 0u32;
            for (n, m) in self.prog.module_ids().enumerate() {
                info!(
                    "[CallGraph / {iter}] [{} / {total}] [{}]",
                    n + 1,
                    self.prog.module(m).name
                );
                if self.do_module_pass(m)? {
                    changed += 1;
                }
            }
            info!("[CallGraph] updated in {changed} modules");
            if changed == 0 {
                break;
            }
        }

        loop {
            let mut again = false;
            for m in self.prog.module_ids() {
                again |= self.do_finalization(m);
            }
            if !again {
                break;
            }
        }
        info!("[CallGraph] done");
        self.sink.flush()
    }

    fn do_finalization(&mut self, _mid: ModuleId) -> bool {
        false
    }

    /// Emit rows for every call instruction of one module.
    fn do_module_pass(&mut self, mid: ModuleId) -> Result<bool, OutputError> {
        let module = self.prog.module(mid);
        for &fid in &module.functions {
            let func = self.prog.func(fid);
            if !self.facts.unified.contains_key(&func_hash(self.prog, fid, true)) {
                continue;
            }
            for (i, inst) in func.insts.iter().enumerate() {
                let InstKind::Call { callee, args, fty } = &inst.kind else { continue };
                match callee {
                    Callee::Asm => {
                        // Inline assembly is never a resolvable call.
                    }
                    Callee::Direct(cf) => {
                        if self.prog.func(*cf).is_intrinsic() {
                            // Memory intrinsics were consumed by the fact
                            // builder; nothing else produces rows.
                            continue;
                        }
                        self.emit_direct(func, inst, *cf)?;
                    }
                    Callee::Indirect(cv) => {
                        if let Some(cf) = operand_as_function(func, cv) {
                            // A cast of a function constant in callee
                            // position is still a direct call.
                            if !self.prog.func(cf).is_intrinsic() {
                                self.emit_direct(func, inst, cf)?;
                            }
                            continue;
                        }
                        let virtual_targets = self
                            .virtuals
                            .as_ref()
                            .and_then(|v| v.get(fid, InstId::new(i as u32)))
                            .map(|set| self.canonical_sorted(set.iter().copied()));
                        if let Some(targets) = virtual_targets {
                            for callee in targets {
                                self.emit_row(func, inst, callee, CallType::Virtual, FoundWith::None)?;
                            }
                            continue;
                        }
                        trace!(caller = %func.name, "indirect call");
                        let (set, found) = match self.opts.analysis {
                            AnalysisType::TaOnly => (
                                find_callees_with_type(self.prog, &self.facts, func, args, *fty),
                                FoundWith::Ta,
                            ),
                            mode => {
                                match find_callees_with_mlta(self.prog, &self.facts, func, cv, *fty)
                                {
                                    Some(set) => (set, FoundWith::Mlta),
                                    None if mode == AnalysisType::MltaOnly => {
                                        (Default::default(), FoundWith::Mlta)
                                    }
                                    None => (
                                        find_callees_with_type(
                                            self.prog,
                                            &self.facts,
                                            func,
                                            args,
                                            *fty,
                                        ),
                                        FoundWith::Ta,
                                    ),
                                }
                            }
                        };
                        let targets = self.canonical_sorted(set.into_iter());
                        for callee in targets {
                            self.emit_row(func, inst, callee, CallType::Indirect, found)?;
                        }
                    }
                }
            }
        }
        Ok(false)
    }

    fn emit_direct(&mut self, caller: &Function, inst: &Inst, cf: FuncId) -> Result<(), OutputError> {
        let mut cf = cf;
        // A call to a declaration re-targets to the externally-linked
        // definition of the same symbol when one was seen.
        if self.prog.func(cf).is_declaration {
            cf = self.facts.resolve(self.prog, cf);
        }
        let uf = self.facts.unified_for(self.prog, cf);
        self.emit_row(caller, inst, uf, CallType::Direct, FoundWith::None)
    }

    /// Candidates deduplicated through the unified map and sorted for
    /// deterministic row order.
    fn canonical_sorted(&self, set: impl Iterator<Item = FuncId>) -> Vec<FuncId> {
        let mut targets: Vec<FuncId> =
            set.map(|f| self.facts.unified_for(self.prog, f)).collect();
        targets.sort();
        targets.dedup();
        targets
    }

    fn emit_row(
        &mut self,
        caller: &Function,
        inst: &Inst,
        callee: FuncId,
        calltype: CallType,
        found: FoundWith,
    ) -> Result<(), OutputError> {
        let callee_f = self.prog.func(callee);

        let mut callee_name = callee_f.name.clone();
        let mut callee_file = String::new();
        let mut callee_line = String::new();
        if let Some(sp) = &callee_f.subprogram {
            callee_file = sp.file.clone();
            callee_line = sp.line.to_string();
            if self.opts.demangle == Demangle::DebugOnly {
                callee_name = sp.name.clone();
            }
        }
        if self.opts.demangle == Demangle::All {
            callee_name = demangle(&callee_name);
        }

        let mut caller_name = caller.name.clone();
        let caller_file;
        let mut caller_def_line = String::new();
        if let Some(sp) = &caller.subprogram {
            caller_file = sp.file.clone();
            caller_def_line = sp.line.to_string();
            if self.opts.demangle == Demangle::DebugOnly {
                caller_name = sp.name.clone();
            }
        } else {
            caller_file = self.prog.module(caller.module).source_file.clone();
        }
        if self.opts.demangle == Demangle::All {
            caller_name = demangle(&caller_name);
        }

        if caller_name.is_empty() || callee_name.is_empty() {
            return Ok(());
        }

        let (caller_line, inlined_file, inlined_line) = read_debug_info(inst, &caller_file);

        self.sink.write(&CallRow {
            caller_filename: caller_file,
            caller_function: caller_name,
            caller_def_line,
            caller_line,
            callee_filename: callee_file,
            callee_function: callee_name,
            callee_line,
            callee_calltype: calltype.as_str().to_string(),
            callee_inlined_from_file: inlined_file,
            callee_inlined_from_line: inlined_line,
            indirect_found_with: found.as_str().to_string(),
        })
    }
}

/// The call's source line, plus the inlined-from file/line when the location
/// was inlined out of another file: walk the inlining chain until a location
/// inside the caller's own file is found.
fn read_debug_info(inst: &Inst, caller_filename: &str) -> (String, String, String) {
    let Some(loc) = &inst.debug else {
        return (String::new(), String::new(), String::new());
    };
    let mut caller_line = loc.line.to_string();
    let mut cur = loc.inlined_at.as_deref();
    while let Some(at) = cur {
        if at.file == caller_filename {
            caller_line = at.line.to_string();
            return (caller_line, loc.file.clone(), loc.line.to_string());
        }
        cur = at.inlined_at.as_deref();
    }
    (caller_line, String::new(), String::new())
}

/// Itanium-ABI demangling; symbols that do not parse stay as-is.
fn demangle(name: &str) -> String {
    match cpp_demangle::Symbol::new(name) {
        Ok(sym) => sym.to_string(),
        Err(_) => name.to_string(),
    }
}
