use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{info, warn};

use callgraph_core::analysis::{
    AnalysisType, CallGraphOptions, CallGraphPass, Demangle, VirtualCallTargets,
    resolve_virtual_calls,
};
use callgraph_core::backends::{expand_inputs, load_module, load_modules};
use callgraph_core::ir::Program;
use callgraph_core::output::CsvSink;

/// Load the inputs, run the call-graph passes, and write the CSV.
///
/// Individual modules that fail to load are warned about and skipped; only
/// argument expansion and the output file are fatal.
pub fn generate_callgraph(
    inputs: &[String],
    output: &Path,
    analysis: AnalysisType,
    demangle: Demangle,
    cpp_linked_bitcode: Option<&Path>,
) -> Result<()> {
    let paths = expand_inputs(inputs).context("Failed to expand input arguments")?;
    info!("Total {} file(s)", paths.len());

    let mut prog = Program::new();
    let loaded = load_modules(&mut prog, &paths);
    info!("Loaded {} of {} modules", loaded.len(), paths.len());

    // The whole-program linked module joins the analysis, and its virtual
    // call sites get resolved through the vtable pass first.
    let mut virtuals: Option<VirtualCallTargets> = None;
    if let Some(linked) = cpp_linked_bitcode {
        match load_module(&mut prog, linked) {
            Ok(ids) => {
                let mut targets = VirtualCallTargets::default();
                for mid in ids {
                    targets.merge(resolve_virtual_calls(&prog, mid));
                }
                virtuals = Some(targets);
            }
            Err(e) => {
                warn!("Resolving virtual call targets is not available: {e}");
            }
        }
    }

    let file = File::create(output)
        .with_context(|| format!("Failed to open output file {}", output.display()))?;
    let mut sink = CsvSink::new(BufWriter::new(file))?;

    let opts = CallGraphOptions { analysis, demangle };
    let mut pass = CallGraphPass::new(&prog, opts, &mut sink);
    if let Some(targets) = virtuals {
        pass.set_virtual_call_targets(targets);
    }
    pass.run()?;

    info!("[Wrote: {}]", output.display());
    Ok(())
}
