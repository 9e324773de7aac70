use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use log::info;

use std::io::{self, Write};
use std::path;

use fftsplus::builder::DataContextParam;
use fftsplus::common::NodeId;
use fftsplus::graph::{CachePlan, CacheRequest, Graph, Node};
use fftsplus::pass;
use fftsplus::pprint::{pprint, TaskPrintStyle};

const OP_TYPES: [&str; 4] = ["Conv2D", "Relu", "Add", "MatMul"];
const ADDR_STRIDE: u64 = 0x1_0000;

/// Builds the FFTS+ contexts of a synthetic operator chain.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Length of the operator chain
    #[arg(long, default_value_t = 3, value_parser = clap::value_parser!(u32).range(1..))]
    ops: u32,

    /// Slices per operator (ignored with --dynamic)
    #[arg(long, default_value_t = 2, value_parser = clap::value_parser!(u16).range(1..))]
    thread_dim: u16,

    /// Thread count is only known at run time
    #[arg(long, default_value_t = false)]
    dynamic: bool,

    /// Consumers of each operator's output, including the next operator in the chain
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..))]
    consumers: u32,

    /// Write output here instead of stdout
    #[arg(long, short)]
    output: Option<path::PathBuf>,

    /// Output format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Table)]
    format: OutputFormat,

    /// Table style
    #[arg(long, value_enum, default_value_t = TaskPrintStyle::Full)]
    style: TaskPrintStyle,
}

#[derive(Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Bytes,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut graph = synthetic_graph(&args);
    let (task_def, _, summary) = pass::compile(&mut graph)?;
    info!("{summary:?}");

    match (args.format, &args.output) {
        (OutputFormat::Table, None) => pprint(&task_def, args.style),
        (OutputFormat::Table, Some(out)) => {
            let table = fftsplus::pprint::pprint_string(&task_def, args.style);
            std::fs::write(out, table)
                .with_context(|| format!("writing {}", out.display()))?;
        }
        (OutputFormat::Bytes, None) => io::stdout().lock().write_all(&task_def.to_bytes()?)?,
        (OutputFormat::Bytes, Some(out)) => {
            std::fs::write(out, task_def.to_bytes()?)
                .with_context(|| format!("writing {}", out.display()))?;
        }
    }
    Ok(())
}

/// A chain `op0 -> op1 -> ...` where every operator also feeds `consumers - 1` sinks. Every
/// output with consumers is written back and invalidated; statically sliced operators prefetch
/// their input.
fn synthetic_graph(args: &Args) -> Graph {
    let mut graph = Graph::new();
    let mut prev: Option<NodeId> = None;
    for i in 0..args.ops {
        let is_last = i + 1 == args.ops;
        let mut plan = CachePlan::default();
        if !is_last {
            plan.write_back.push(request(0));
            plan.invalidate.push(request(0));
        }
        if prev.is_some() && !args.dynamic {
            plan.prefetch.push(request(0));
        }
        let op = graph.add_node(
            Node::new(format!("op{i}"), OP_TYPES[i as usize % OP_TYPES.len()])
                .with_output_addrs(vec![ADDR_STRIDE * u64::from(i + 1)])
                .with_slice_info(args.thread_dim, args.dynamic)
                .with_cache_plan(plan),
        );
        if let Some(prev) = prev {
            graph.connect(prev, 0, op, 0);
        }
        if !is_last {
            for j in 1..args.consumers {
                let sink = graph.add_node(
                    Node::new(format!("op{i}_sink{j}"), "Cast")
                        .with_slice_info(args.thread_dim, args.dynamic),
                );
                graph.connect(op, 0, sink, 0);
            }
        }
        prev = Some(op);
    }
    graph
}

fn request(anchor: u32) -> CacheRequest {
    CacheRequest {
        anchor,
        params: vec![DataContextParam {
            num_outter: 1,
            num_inner: 16,
            len_inner: 64,
            stride_outter: 1024,
            stride_inner: 64,
            base_addr_offset: 0,
        }],
    }
}
