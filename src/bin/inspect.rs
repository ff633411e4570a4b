//! strata-mcl-inspect: Dump the sections, variables and dispatches of a
//! serialized command list.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::Parser;
use serde::Serialize;

use strata_mcl::cli;
use strata_mcl::memory::AllocationTable;
use strata_mcl::program::{read_header, SectionEntry};
use strata_mcl::{CommandList, VariableState, VariableType};

#[derive(Parser)]
#[command(name = "strata-mcl-inspect", about = "Inspect a serialized mutable command list")]
struct Args {
    /// Container file produced by get_native_binary
    #[arg(short = 'f', long, conflicts_with = "stdin")]
    file: Option<PathBuf>,

    /// Read the container from stdin
    #[arg(long)]
    stdin: bool,

    /// JSON config overriding heap sizes and hardware constants
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Only print the section table
    #[arg(long)]
    sections_only: bool,

    /// Output format: text or json
    #[arg(long, default_value = "text", value_parser = validate_output_format)]
    output_format: String,

    /// Suppress all logging
    #[arg(long)]
    log_disable: bool,
}

fn validate_output_format(s: &str) -> Result<String, String> {
    match s {
        "text" | "json" => Ok(s.to_string()),
        _ => Err(format!("Unknown output format '{}'. Options: text, json", s)),
    }
}

#[derive(Serialize)]
struct VariableEntry {
    index: usize,
    name: Option<String>,
    var_type: VariableType,
    state: VariableState,
    size: usize,
    sites: usize,
    dispatches: usize,
}

#[derive(Serialize)]
struct DispatchEntry {
    index: usize,
    kernel: String,
    walker_offset: usize,
    group_size: [u32; 3],
    group_count: [u32; 3],
    global_offset: [u32; 3],
    slm_size: u32,
}

#[derive(Serialize)]
struct LabelEntry {
    name: Option<String>,
    cs_offset: Option<u64>,
    pending_jumps: usize,
}

#[derive(Serialize)]
struct JsonOutput {
    closed: bool,
    sections: Vec<SectionEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    variables: Option<Vec<VariableEntry>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    dispatches: Option<Vec<DispatchEntry>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    labels: Option<Vec<LabelEntry>>,
}

fn main() {
    let args = Args::parse();
    cli::init_logging(args.log_disable);

    if let Err(e) = run(args) {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let bytes = cli::read_binary_input(args.file.as_deref(), args.stdin)?;
    let header = read_header(&bytes)?;
    let closed = header.flags & strata_mcl::program::FLAG_CLOSED != 0;

    let list = if args.sections_only {
        None
    } else {
        let config = cli::load_config(args.config.as_deref())?;
        Some(CommandList::load_from_binary(&bytes, config, Arc::new(AllocationTable::new()))?)
    };

    let variables = list.as_ref().map(|l| {
        l.variables()
            .iter()
            .enumerate()
            .map(|(index, v)| VariableEntry {
                index,
                name: v.name().map(str::to_string),
                var_type: v.var_type(),
                state: v.state(),
                size: v.size(),
                sites: v.usages().len(),
                dispatches: v.used_in_dispatch().len(),
            })
            .collect::<Vec<_>>()
    });
    let dispatches = list.as_ref().map(|l| {
        l.dispatches()
            .iter()
            .enumerate()
            .map(|(index, d)| DispatchEntry {
                index,
                kernel: d.kernel().name.clone(),
                walker_offset: d.walker().offset(),
                group_size: d.group_size(),
                group_count: d.group_count(),
                global_offset: d.global_offset(),
                slm_size: d.slm_total_size(),
            })
            .collect::<Vec<_>>()
    });
    let labels = list.as_ref().map(|l| {
        let cs_base = l.container().cs.gpu_base();
        l.labels()
            .iter()
            .map(|label| LabelEntry {
                name: label.name().map(str::to_string),
                cs_offset: label.address().map(|a| a - cs_base),
                pending_jumps: label.pending_jumps().len(),
            })
            .collect::<Vec<_>>()
    });

    match args.output_format.as_str() {
        "json" => {
            let output = JsonOutput {
                closed,
                sections: header.sections,
                variables,
                dispatches,
                labels,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        _ => {
            println!("container: {} bytes, closed: {}", bytes.len(), closed);
            for s in &header.sections {
                println!(
                    "{:<10} offset {:>8} size {:>8} entry {:>3}",
                    s.kind.name(),
                    s.offset,
                    s.size,
                    s.entry_size
                );
            }
            if let Some(vars) = &variables {
                println!();
                for v in vars {
                    println!(
                        "var {:>3} {:<16} {:?} {:?} size {} sites {} dispatches {}",
                        v.index,
                        v.name.as_deref().unwrap_or("<anon>"),
                        v.var_type,
                        v.state,
                        v.size,
                        v.sites,
                        v.dispatches
                    );
                }
            }
            if let Some(ds) = &dispatches {
                println!();
                for d in ds {
                    println!(
                        "dispatch {:>3} {:<16} walker @{} gs {:?} gc {:?} go {:?} slm {}",
                        d.index, d.kernel, d.walker_offset, d.group_size, d.group_count, d.global_offset, d.slm_size
                    );
                }
            }
            if let Some(ls) = &labels {
                println!();
                for l in ls {
                    match l.cs_offset {
                        Some(o) => println!("label {} @{}", l.name.as_deref().unwrap_or("<anon>"), o),
                        None => println!(
                            "label {} unset, {} pending jumps",
                            l.name.as_deref().unwrap_or("<anon>"),
                            l.pending_jumps
                        ),
                    }
                }
            }
        }
    }

    Ok(())
}
