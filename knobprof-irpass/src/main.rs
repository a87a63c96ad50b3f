//! `knobprof-irpass` -- standalone driver for the taint/structure
//! discovery pass over a textual LLVM IR module.

mod callgraph;
mod cfg;
mod demangle;
mod discover;
mod emit;
mod error;
mod metadata;
mod taint;

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, info, warn};

use callgraph::CallGraph;
use discover::FunctionResult;
use emit::{Emitter, LocationTable};
use metadata::DebugInfo;
use taint::TaintSeeds;

#[derive(Parser)]
#[command(name = "knobprof-irpass", about = "Discover taint-driven variables in an IR module")]
struct Cli {
    /// Path to the textual (`.ll`) LLVM IR module to analyze.
    #[arg(long)]
    module: PathBuf,

    /// Path to the taint-seed config (literal names and shell globs, one per line).
    #[arg(long)]
    seeds: PathBuf,

    /// Directory to write `schema.txt`, `src2basicblock.txt`, and `info.txt` into.
    #[arg(long = "out-dir")]
    out_dir: PathBuf,

    /// Comma-separated source file suffixes eligible for schema emission.
    #[arg(long, default_value = ".cc")]
    ext: String,

    /// Short program name written as the runtime config's header line.
    /// Defaults to the module's own name.
    #[arg(long)]
    progname: Option<String>,

    /// Optional `file:line:name=from:to:atom:addr:size` table resolving
    /// discovered variables to a runtime PC/location (see DESIGN.md).
    #[arg(long)]
    locations: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    run(cli)
}

fn run(cli: Cli) -> Result<()> {
    let ir_text = std::fs::read_to_string(&cli.module)
        .with_context(|| format!("reading IR module {}", cli.module.display()))?;
    let module = llvm_ir::Module::from_ir_path(&cli.module)
        .map_err(|e| anyhow::anyhow!("failed to parse {}: {e}", cli.module.display()))?;
    info!("parsed module {} ({} functions)", module.name, module.functions.len());

    let mut taint = TaintSeeds::load(&cli.seeds).with_context(|| format!("loading taint seeds {}", cli.seeds.display()))?;
    if let Ok(env_schema) = std::env::var("KNOB_TAINT_SEEDS") {
        taint.extend_from_env(&env_schema);
    }

    let debug = DebugInfo::scrape(&ir_text);
    let callgraph = CallGraph::build(&module);

    let function_names: Vec<String> = module.functions.iter().map(|f| f.name.clone()).collect();
    let functions_by_name: HashMap<&str, &llvm_ir::Function> =
        module.functions.iter().map(|f| (f.name.as_str(), f)).collect();

    let sccs = callgraph.sccs(&function_names);

    let mut dependency_graph: HashMap<String, HashSet<String>> = HashMap::new();
    let mut seed_queue: VecDeque<String> = VecDeque::new();
    let mut preprocessed: HashSet<String> = HashSet::new();

    for scc in &sccs {
        for name in scc {
            if preprocessed.contains(name) {
                continue;
            }
            let Some(&func) = functions_by_name.get(name.as_str()) else { continue };
            preprocessed.insert(name.clone());

            let is_seed = discover::is_seed_function(func, &module, &taint, &debug);
            if is_seed {
                debug!("seed function (member/global taint match): {name}");
                seed_queue.push_back(name.clone());
            } else {
                let mut probe = FunctionResult::default();
                discover::collect_on_loop(func, &debug, &mut probe);
                discover::collect_on_multiple(func, &debug, &mut probe);
                if probe.vars.values().any(|v| taint.matches(&v.debug.name)) {
                    debug!("seed function (collected var taint match): {name}");
                    seed_queue.push_back(name.clone());
                }
            }

            for callee in callgraph.callees_of(name) {
                if functions_by_name.contains_key(callee.as_str()) {
                    dependency_graph.entry(name.clone()).or_default().insert(callee.clone());
                }
            }
        }
    }

    let extensions: Vec<String> = cli.ext.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect();
    let locations = LocationTable::load(cli.locations.as_deref())?;
    let mut emitter = Emitter::new(cli.out_dir.clone(), extensions);
    let mut recorded_blocks = HashSet::new();
    let mut all_globals = HashSet::new();
    let mut visited: HashSet<String> = HashSet::new();

    while let Some(name) = seed_queue.pop_front() {
        if visited.contains(&name) {
            continue;
        }
        visited.insert(name.clone());
        let Some(&func) = functions_by_name.get(name.as_str()) else { continue };

        let mut result = FunctionResult::default();
        discover::collect_on_loop(func, &debug, &mut result);
        discover::collect_on_multiple(func, &debug, &mut result);

        if !result.vars.is_empty() {
            info!("collected {} risky variable(s) from {name}", result.vars.len());
            emitter.record_function_vars(&name, &result.vars, &locations);
        }
        all_globals.extend(result.globals);
        emitter.record_blocks(func, &mut recorded_blocks);
        let source_file = module.source_file_name.clone();
        emitter.record_function_range(func, &source_file);

        let Some(deps) = dependency_graph.get(&name) else { continue };
        for dep in deps.clone() {
            if visited.contains(&dep) {
                continue;
            }
            seed_queue.push_back(dep);
        }
    }

    emitter.record_globals(&module, &all_globals);

    let progname = cli.progname.unwrap_or_else(|| module.name.clone());
    let summary = emitter.finish(&progname)?;

    info!(
        "wrote {} ({} variables), {} ({} blocks/functions), {} ({} variables, {} skipped for lack of a location)",
        summary.schema_path.display(),
        summary.variables_emitted + summary.variables_skipped_no_location,
        summary.bb_path.display(),
        recorded_blocks.len(),
        summary.config_path.display(),
        summary.variables_emitted,
        summary.variables_skipped_no_location,
    );
    if summary.variables_skipped_no_location > 0 {
        warn!(
            "{} discovered variable(s) had no matching --locations entry and were left out of {}",
            summary.variables_skipped_no_location,
            summary.config_path.display()
        );
    }

    Ok(())
}
