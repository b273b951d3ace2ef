use std::collections::{BTreeMap, VecDeque};
use std::error::Error;

use onnx_graft::graph::Node;
use onnx_graft::{append_graphs, load_model, save_model, Graph, OpRegistry, Refiner};

enum Command {
    /// Stitch two models together.
    Concat {
        first: String,
        second: String,
        output: String,
    },

    /// Run iterative shape inference and constant folding.
    Refine { model: String, output: String },

    /// Print a summary of a model.
    Info { model: String },
}

struct Args {
    command: Command,
    verbose: bool,
}

fn parse_args() -> Result<Args, lexopt::Error> {
    use lexopt::prelude::*;

    let mut values = VecDeque::new();
    let mut output: Option<String> = None;
    let mut verbose = false;

    let mut parser = lexopt::Parser::from_env();
    while let Some(arg) = parser.next()? {
        match arg {
            Value(val) => values.push_back(val.string()?),
            Short('o') | Long("output") => output = Some(parser.value()?.string()?),
            Short('v') | Long("verbose") => verbose = true,
            Short('h') | Long("help") => {
                println!(
                    "Stitch and refine interchange models.

Usage: {bin_name} [OPTIONS] <command> <model>...

Commands:
  concat <first> <second> -o <out>  Append the second model to the first
  refine <model> -o <out>           Iteratively infer shapes and fold constants
  info <model>                      Print a model summary

Options:
  -o, --output <file>  Where to write the resulting model
  -v, --verbose        Enable debug logging
  -h, --help           Print help
",
                    bin_name = parser.bin_name().unwrap_or("onnx-graft")
                );
                std::process::exit(0);
            }
            _ => return Err(arg.unexpected()),
        }
    }

    let command = values.pop_front().ok_or("missing `<command>` arg")?;
    let command = match command.as_str() {
        "concat" => Command::Concat {
            first: values.pop_front().ok_or("missing `<first>` arg")?,
            second: values.pop_front().ok_or("missing `<second>` arg")?,
            output: output.ok_or("missing `-o <output>` arg")?,
        },
        "refine" => Command::Refine {
            model: values.pop_front().ok_or("missing `<model>` arg")?,
            output: output.ok_or("missing `-o <output>` arg")?,
        },
        "info" => Command::Info {
            model: values.pop_front().ok_or("missing `<model>` arg")?,
        },
        other => {
            return Err(lexopt::Error::from(format!(
                "unknown command \"{}\"",
                other
            )))
        }
    };

    Ok(Args { command, verbose })
}

fn print_values(graph: &Graph, heading: &str, ids: &[onnx_graft::NodeId]) {
    println!("{}:", heading);
    for &id in ids {
        match graph.get_node(id).and_then(|node| node.shape()) {
            Some(dims) => println!("  {} {:?}", graph.node_name(id), dims),
            None => println!("  {}", graph.node_name(id)),
        }
    }
}

fn print_summary(graph: &Graph) {
    print_values(graph, "inputs", graph.input_ids());
    print_values(graph, "outputs", graph.output_ids());

    let mut op_counts: BTreeMap<&str, usize> = BTreeMap::new();
    for (_, node) in graph.iter() {
        if let Node::Operator(op_node) = node {
            *op_counts.entry(op_node.operator().name()).or_insert(0) += 1;
        }
    }
    println!("operators:");
    for (op_type, count) in op_counts {
        println!("  {:4}x {}", count, op_type);
    }
    println!(
        "{} operators, {} constant parameters",
        graph.operator_count(),
        graph.total_params()
    );
}

fn run(args: Args) -> Result<(), Box<dyn Error>> {
    let registry = OpRegistry::with_all_ops();

    match &args.command {
        Command::Concat {
            first,
            second,
            output,
        } => {
            let first_graph = load_model(first, &registry)?;
            let second_graph = load_model(second, &registry)?;
            let merged = append_graphs(first_graph, second_graph)?;
            save_model(output, &merged)?;
            println!("wrote {} ({} operators)", output, merged.operator_count());
        }
        Command::Refine { model, output } => {
            let graph = load_model(model, &registry)?;
            let count_before = graph.operator_count();
            let refined = Refiner::new().refine(graph)?;
            save_model(output, &refined)?;
            println!(
                "refined {}: {} -> {} operators, wrote {}",
                model,
                count_before,
                refined.operator_count(),
                output
            );
        }
        Command::Info { model } => {
            let graph = load_model(model, &registry)?;
            print_summary(&graph);
        }
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    let args = parse_args()?;

    let level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    run(args)
}
