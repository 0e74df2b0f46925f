use std::path::PathBuf;

use anyhow::Result;
use callgraph_cli::commands;
use callgraph_core::analysis::{AnalysisType, Demangle};
use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

/// Whole-program call graph generator CLI.
///
/// The binary is intentionally thin: it parses args, installs logging, and
/// lets `callgraph-core` + `commands` own the real work for testability and reuse.
#[derive(Parser, Debug)]
#[command(
    name = "callgraph",
    version,
    about = "Generate a precise global callgraph given input IR modules",
    long_about = "Generate a precise global callgraph given input IR modules.\n\n\
        EXAMPLES:\n\n\
        - Generate a callgraph given input file '/path/to/foo.bc', write output\n  \
          to the default output file 'callgraph.csv':\n    \
          callgraph /path/to/foo.bc\n\n\
        - Generate a callgraph given two input files, write output to 'foobar.csv':\n    \
          callgraph /path/to/foo.bc /path/to/bar.bc -o foobar.csv\n\n\
        - Generate a callgraph given a text file with one input file per line:\n    \
          callgraph @/path/to/foobar.txt -o foobar.csv"
)]
struct Cli {
    /// Input IR modules: file paths, or `@file` naming a list with one path
    /// per line.
    #[arg(value_name = "INPUT", required = true)]
    inputs: Vec<String>,

    /// Output CSV filename.
    #[arg(short = 'o', long = "output", default_value = "callgraph.csv")]
    output: PathBuf,

    /// Resolve indirect call targets with:
    #[arg(long = "analysis", value_enum, default_value_t = AnalysisArg::MltaPref)]
    analysis: AnalysisArg,

    /// Demangle C++ function names:
    #[arg(long = "demangle", value_enum, default_value_t = DemangleArg::DemangleDebugOnly)]
    demangle: DemangleArg,

    /// Whole-program bitcode file for C++ virtual call resolution.
    #[arg(long = "cpp-linked-bitcode", value_name = "FILE")]
    cpp_linked_bitcode: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum AnalysisArg {
    /// Prefer MLTA, fallback to TA if MLTA failed (default).
    #[value(name = "mlta_pref")]
    MltaPref,
    /// Find targets of indirect calls based on MLTA.
    #[value(name = "mlta_only")]
    MltaOnly,
    /// Find targets of indirect calls based on type analysis (TA).
    #[value(name = "ta_only")]
    TaOnly,
}

impl From<AnalysisArg> for AnalysisType {
    fn from(arg: AnalysisArg) -> Self {
        match arg {
            AnalysisArg::MltaPref => AnalysisType::MltaPref,
            AnalysisArg::MltaOnly => AnalysisType::MltaOnly,
            AnalysisArg::TaOnly => AnalysisType::TaOnly,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum DemangleArg {
    /// Demangle function names that are associated with debug info (default).
    #[value(name = "demangle_debug_only")]
    DemangleDebugOnly,
    /// Demangle all function names.
    #[value(name = "demangle_all")]
    DemangleAll,
    /// Don't demangle function names.
    #[value(name = "demangle_none")]
    DemangleNone,
}

impl From<DemangleArg> for Demangle {
    fn from(arg: DemangleArg) -> Self {
        match arg {
            DemangleArg::DemangleDebugOnly => Demangle::DebugOnly,
            DemangleArg::DemangleAll => Demangle::All,
            DemangleArg::DemangleNone => Demangle::None,
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    commands::generate_callgraph(
        &cli.inputs,
        &cli.output,
        cli.analysis.into(),
        cli.demangle.into(),
        cli.cpp_linked_bitcode.as_deref(),
    )
}
