//! Stitching of two graphs into one.

use std::error::Error;
use std::fmt::{Display, Formatter};

use crate::graph::{Graph, NodeId};
use crate::ops::Identity;

/// Errors from appending one graph to another.
#[derive(Debug, PartialEq)]
pub enum StitchError {
    /// The first graph's output count does not match the second graph's
    /// input count.
    OutputInputMismatch {
        /// Number of declared outputs of the first graph.
        outputs: usize,
        /// Number of declared inputs of the second graph.
        inputs: usize,
    },

    /// The merged graph cannot be put into a valid execution order.
    CyclicGraph,
}

impl Display for StitchError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            StitchError::OutputInputMismatch { outputs, inputs } => write!(
                f,
                "number of outputs ({}) does not match number of inputs ({})",
                outputs, inputs
            ),
            StitchError::CyclicGraph => write!(f, "merged graph contains a cycle"),
        }
    }
}

impl Error for StitchError {}

/// Append `graph_b` to `graph_a`, connecting the first graph's outputs to
/// the second graph's inputs, and return the merged graph.
///
/// Outputs and inputs are paired positionally and by count only; no matching
/// by name or dtype is attempted, so the caller is responsible for aligning
/// them. Each pair is bridged with an `Identity` operator named
/// `Identity_<outName>_<inName>`. The merged graph keeps `graph_a`'s
/// declared inputs and takes over `graph_b`'s declared outputs.
///
/// Both argument graphs are consumed. The cardinality check precedes any
/// mutation, so on error no graph has been modified; the inputs are simply
/// dropped.
///
/// No shape inference is performed on the merged graph; callers that need
/// refreshed shapes should run a [`Refiner`](crate::optimize::Refiner)
/// afterwards.
pub fn append_graphs(graph_a: Graph, graph_b: Graph) -> Result<Graph, StitchError> {
    if graph_a.output_ids().len() != graph_b.input_ids().len() {
        return Err(StitchError::OutputInputMismatch {
            outputs: graph_a.output_ids().len(),
            inputs: graph_b.input_ids().len(),
        });
    }

    let mut merged = graph_a;
    let a_outputs = merged.output_ids().to_vec();
    let b_inputs = graph_b.input_ids().to_vec();
    let b_outputs = graph_b.output_ids().to_vec();

    let offset = merged.absorb(graph_b);

    // Bridge each (output, input) pair with a passthrough operator, so the
    // two tensors do not need to be the same node.
    for (&a_out, b_in) in a_outputs.iter().zip(b_inputs) {
        let b_in: NodeId = b_in + offset;
        let name = format!(
            "Identity_{}_{}",
            merged.node_name(a_out),
            merged.node_name(b_in)
        );
        merged.add_op(
            Some(&name),
            Box::new(Identity {}),
            &[Some(a_out)],
            &[Some(b_in)],
        );
    }

    let b_outputs: Vec<NodeId> = b_outputs.into_iter().map(|id| id + offset).collect();
    merged.set_output_ids(&b_outputs);

    merged.toposort().map_err(|_| StitchError::CyclicGraph)?;
    Ok(merged)
}
