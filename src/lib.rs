//! onnx-graft is a toolkit for surgery on ONNX-style computation graphs:
//! stitching independently exported graphs together and refining the result
//! with iterative cleanup, shape inference and constant folding.
//!
//! # Stitching
//!
//! [`append_graphs`] connects the declared outputs of one graph to the
//! declared inputs of another, pairing them positionally and bridging each
//! pair with an `Identity` operator. The merged graph exposes the first
//! graph's inputs and the second graph's outputs.
//!
//! # Refinement
//!
//! [`Refiner`] repeatedly removes dead nodes, re-derives value shapes by
//! round-tripping the graph through the interchange form
//! ([`model::ModelDoc`]) and folds constant subgraphs, including
//! shape-producing subgraphs, until the graph stops shrinking or a fixed
//! number of passes is exhausted. Shape inference failures are logged and
//! skipped; refinement is best-effort.
//!
//! # Decay schedules
//!
//! Unrelated to graph surgery, [`schedule`] carries the small table of EMA
//! decay schedules that a training loop applies when averaging exported
//! model weights.
//!
//! # Example
//!
//! ```
//! use onnx_graft::ops::Identity;
//! use onnx_graft::{append_graphs, Graph, Refiner};
//!
//! fn passthrough(input: &str, output: &str, op: &str) -> Graph {
//!     let mut g = Graph::new();
//!     let x = g.add_value(Some(input), None, None);
//!     let y = g.add_value(Some(output), None, None);
//!     g.add_op(Some(op), Box::new(Identity {}), &[Some(x)], &[Some(y)]);
//!     g.set_input_ids(&[x]);
//!     g.set_output_ids(&[y]);
//!     g
//! }
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let head = passthrough("x", "head_out", "head");
//!     let tail = passthrough("tail_in", "y", "tail");
//!
//!     let merged = append_graphs(head, tail)?;
//!     let refined = Refiner::new().refine(merged)?;
//!
//!     assert_eq!(refined.operator_count(), 3);
//!     Ok(())
//! }
//! ```

pub mod graph;
pub mod infer_shapes;
pub mod model;
pub mod op_registry;
pub mod ops;
pub mod optimize;
pub mod schedule;
pub mod stitch;
pub mod tensor;

pub use graph::{Dimension, Graph, GraphError, Node, NodeId};
pub use model::{export_model, import_model, load_model, save_model, ModelDoc};
pub use op_registry::OpRegistry;
pub use optimize::{fold_constants, FoldOptions, RefineError, Refiner};
pub use schedule::DecaySchedule;
pub use stitch::{append_graphs, StitchError};
pub use tensor::Tensor;
