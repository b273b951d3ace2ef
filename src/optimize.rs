//! Constant folding and the iterative shape refinement loop.

use std::error::Error;
use std::fmt::{Display, Formatter};

use tracing::{debug, error};

use crate::graph::{Graph, GraphError, Node, NodeId};
use crate::infer_shapes::{infer_shapes, ShapeInferenceError};
use crate::model::{export_model, import_model, ExportError, LoadError};
use crate::op_registry::OpRegistry;
use crate::ops::{Input, InputList, Output};

/// Maximum number of refinement passes.
///
/// Folding and shape inference unlock opportunities in each other, so a
/// bounded number of passes approximates a fixpoint without risking
/// non-termination on degenerate graphs.
const MAX_PASSES: usize = 3;

/// Options controlling constant folding.
#[derive(Clone, Debug, Default)]
pub struct FoldOptions {
    /// Also materialize `Shape`-class operators whose input has fully fixed
    /// dimension metadata, even though the input value is not a constant.
    pub fold_shapes: bool,
}

/// Errors that occur while folding constants.
#[derive(Debug, PartialEq)]
pub enum FoldError {
    /// Shape folding was requested but a `Shape`-class operator in the graph
    /// does not implement the [`ShapeSource`](crate::ops::ShapeSource)
    /// capability. A legacy or third-party operator implementation cannot be
    /// folded from metadata; the request cannot be honored.
    ShapeFoldingUnsupported {
        /// Display name of the offending node.
        op: String,
    },
}

impl Display for FoldError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            FoldError::ShapeFoldingUnsupported { op } => {
                write!(f, "operator \"{}\" does not support folding shapes", op)
            }
        }
    }
}

impl Error for FoldError {}

/// A fold planned for one operator: the computed outputs and the value nodes
/// they replace.
struct PlannedFold {
    outputs: Vec<Output>,
    output_ids: Vec<Option<NodeId>>,
}

fn plan_fold(
    graph: &Graph,
    op_id: NodeId,
    opts: &FoldOptions,
) -> Result<Option<PlannedFold>, FoldError> {
    let Some(Node::Operator(op_node)) = graph.get_node(op_id) else {
        return Ok(None);
    };

    // Operators whose inputs are all constants are evaluated directly.
    let const_inputs: Option<Vec<Input>> = op_node
        .input_ids()
        .iter()
        .map(|slot| {
            slot.and_then(|id| graph.get_node(id))
                .and_then(Node::as_constant)
                .map(|constant| constant.as_input())
        })
        .collect();

    if let Some(inputs) = const_inputs.filter(|inputs| !inputs.is_empty()) {
        return match op_node.operator().run(InputList::from(&inputs)) {
            Ok(outputs) => Ok(Some(PlannedFold {
                outputs,
                output_ids: op_node.output_ids().to_vec(),
            })),
            // Evaluation failures leave the operator in the graph; folding
            // is best-effort.
            Err(err) => {
                debug!(
                    "not folding \"{}\": evaluation failed: {}",
                    graph.node_name(op_id),
                    err
                );
                Ok(None)
            }
        };
    }

    if opts.fold_shapes && op_node.operator().name() == "Shape" {
        let Some(source) = op_node.operator().as_shape_source() else {
            return Err(FoldError::ShapeFoldingUnsupported {
                op: graph.node_name(op_id),
            });
        };
        let dims = op_node
            .input_ids()
            .first()
            .copied()
            .flatten()
            .and_then(|id| graph.get_node(id))
            .and_then(|node| node.shape());
        if let Some(tensor) = dims.as_deref().and_then(|dims| source.shape_value(dims)) {
            return Ok(Some(PlannedFold {
                outputs: vec![tensor.into()],
                output_ids: op_node.output_ids().to_vec(),
            }));
        }
    }

    Ok(None)
}

/// Replace operators whose outputs are statically computable with constant
/// nodes.
///
/// Operators are visited in execution order, so folds cascade through
/// chains of constant-dependent operators in a single call. Folded
/// operators are removed; their orphaned output values are left for
/// [`Graph::cleanup`] to sweep. Returns the number of operators folded.
///
/// With [`FoldOptions::fold_shapes`] set, `Shape`-class operators are also
/// folded from fixed dimension metadata. A `Shape`-class operator that does
/// not support this is reported as an error rather than skipped, since the
/// caller asked for folds that the operator implementation cannot express.
pub fn fold_constants(graph: &mut Graph, opts: &FoldOptions) -> Result<usize, FoldError> {
    let Ok(order) = graph.execution_order() else {
        // A cyclic graph has no safely foldable prefix.
        return Ok(0);
    };

    let mut folded_ops = Vec::new();
    for op_id in order {
        let Some(plan) = plan_fold(graph, op_id, opts)? else {
            continue;
        };
        if plan.outputs.len() != plan.output_ids.len() {
            debug!(
                "not folding \"{}\": output arity mismatch",
                graph.node_name(op_id)
            );
            continue;
        }

        for (slot, output) in plan.output_ids.iter().zip(plan.outputs) {
            let Some(value_id) = *slot else {
                continue;
            };
            let const_name = graph
                .get_node(value_id)
                .and_then(|node| node.name())
                .map(|name| name.to_string());
            let const_id = match output {
                Output::FloatTensor(tensor) => graph.add_constant(const_name.as_deref(), tensor),
                Output::IntTensor(tensor) => graph.add_constant(const_name.as_deref(), tensor),
            };
            graph.replace_value(value_id, const_id);
        }
        folded_ops.push(op_id);
    }

    let folded = folded_ops.len();
    graph.remove_nodes(&folded_ops);
    Ok(folded)
}

/// Why a shape inference attempt over the interchange form did not produce
/// an updated graph.
///
/// The refiner treats all of these as a skipped attempt, not a failure.
#[derive(Debug)]
pub enum InferenceUnavailable {
    /// The graph could not be exported to the interchange form.
    Export(ExportError),

    /// Shape inference over the document failed.
    Inference(ShapeInferenceError),

    /// The inferred document could not be imported back.
    Import(LoadError),
}

impl Display for InferenceUnavailable {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            InferenceUnavailable::Export(err) => write!(f, "export failed: {}", err),
            InferenceUnavailable::Inference(err) => write!(f, "inference failed: {}", err),
            InferenceUnavailable::Import(err) => write!(f, "import failed: {}", err),
        }
    }
}

impl Error for InferenceUnavailable {}

/// Errors that abort refinement.
#[derive(Debug)]
pub enum RefineError {
    /// The graph lost its topological-order invariant.
    Graph(GraphError),

    /// Constant folding failed in a way that must not be swallowed.
    Fold(FoldError),
}

impl Display for RefineError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            RefineError::Graph(err) => write!(f, "{}", err),
            RefineError::Fold(err) => write!(f, "constant folding failed: {}", err),
        }
    }
}

impl Error for RefineError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            RefineError::Graph(err) => Some(err),
            RefineError::Fold(err) => Some(err),
        }
    }
}

/// Iteratively cleans up, re-sorts, shape-infers and constant-folds a graph
/// until no further simplification occurs, up to a fixed number of passes.
///
/// Refinement is best-effort: a failed shape inference attempt is logged and
/// skipped, and mutations made before an aborting error are kept.
pub struct Refiner {
    registry: OpRegistry,
}

impl Refiner {
    /// Create a refiner using the built-in operator set.
    pub fn new() -> Refiner {
        Refiner {
            registry: OpRegistry::with_all_ops(),
        }
    }

    /// Create a refiner that re-imports inferred graphs through a custom
    /// registry.
    pub fn with_registry(registry: OpRegistry) -> Refiner {
        Refiner { registry }
    }

    /// Re-derive value shape metadata by round-tripping the graph through
    /// the interchange form and running shape inference over it.
    pub fn infer_graph_shapes(&self, graph: &Graph) -> Result<Graph, InferenceUnavailable> {
        let doc = export_model(graph).map_err(InferenceUnavailable::Export)?;
        let doc = infer_shapes(&doc).map_err(InferenceUnavailable::Inference)?;
        import_model(&doc, &self.registry).map_err(InferenceUnavailable::Import)
    }

    /// Refine a graph until it stops shrinking or the pass limit is
    /// reached.
    ///
    /// Each pass removes dead nodes, checks the topological-order invariant,
    /// attempts shape inference (non-fatal on failure) and folds constants
    /// including shape-producing subgraphs. The one failure that aborts
    /// refinement is a shape-folding capability error; see
    /// [`FoldError::ShapeFoldingUnsupported`].
    pub fn refine(&self, mut graph: Graph) -> Result<Graph, RefineError> {
        debug!("performing shape inference and folding");
        for _ in 0..MAX_PASSES {
            let count_before = graph.operator_count();

            graph.cleanup();
            graph.toposort().map_err(RefineError::Graph)?;

            match self.infer_graph_shapes(&graph) {
                Ok(inferred) => graph = inferred,
                Err(err) => {
                    debug!("shape inference could not be performed at this time: {}", err);
                }
            }

            match fold_constants(&mut graph, &FoldOptions { fold_shapes: true }) {
                Ok(_) => {}
                Err(err) => {
                    error!("{}", err);
                    return Err(RefineError::Fold(err));
                }
            }

            let count_after = graph.operator_count();
            if count_before == count_after {
                // No folding occurred in this pass; a fixpoint was reached.
                break;
            }
            debug!("folded {} operators", count_before - count_after);
        }
        Ok(graph)
    }
}

impl Default for Refiner {
    fn default() -> Self {
        Refiner::new()
    }
}

#[cfg(test)]
mod tests {
    use super::{fold_constants, FoldError, FoldOptions, RefineError, Refiner};
    use crate::graph::{Graph, Node};
    use crate::op_registry::{Attrs, OpRegistry, ReadOp, ReadOpError};
    use crate::ops::{
        Add, Identity, InputList, Mul, OpError, Operator, Output, Shape,
    };
    use crate::tensor::Tensor;

    /// Graph computing `(2 + 3) * 4` from constants only.
    fn const_expr_graph() -> Graph {
        let mut g = Graph::new();
        let two = g.add_constant(Some("two"), Tensor::from_scalar(2.0f32));
        let three = g.add_constant(Some("three"), Tensor::from_scalar(3.0f32));
        let four = g.add_constant(Some("four"), Tensor::from_scalar(4.0f32));
        let sum = g.add_value(Some("sum"), None, None);
        let product = g.add_value(Some("product"), None, None);
        g.add_op(
            Some("add"),
            Box::new(Add {}),
            &[Some(two), Some(three)],
            &[Some(sum)],
        );
        g.add_op(
            Some("mul"),
            Box::new(Mul {}),
            &[Some(sum), Some(four)],
            &[Some(product)],
        );
        g.set_output_ids(&[product]);
        g
    }

    fn output_constant_f32(g: &Graph) -> Vec<f32> {
        let out_id = g.output_ids()[0];
        g.get_node(out_id)
            .and_then(Node::as_constant)
            .and_then(|constant| constant.as_input().as_float().cloned())
            .map(|tensor| tensor.into_vec())
            .unwrap()
    }

    fn output_constant_i32(g: &Graph) -> Vec<i32> {
        let out_id = g.output_ids()[0];
        g.get_node(out_id)
            .and_then(Node::as_constant)
            .and_then(|constant| constant.as_input().as_int().cloned())
            .map(|tensor| tensor.into_vec())
            .unwrap()
    }

    #[test]
    fn test_fold_constant_expression() {
        let mut g = const_expr_graph();
        let folded = fold_constants(&mut g, &FoldOptions::default()).unwrap();

        // Both operators fold in a single call: the Mul sees the constant
        // produced by folding the Add.
        assert_eq!(folded, 2);
        assert_eq!(g.operator_count(), 0);
        assert_eq!(output_constant_f32(&g), vec![20.0]);
    }

    #[test]
    fn test_fold_skips_runtime_inputs() {
        let mut g = Graph::new();
        let input = g.add_value(Some("input"), None, None);
        let bias = g.add_constant(Some("bias"), Tensor::from_scalar(1.0f32));
        let out = g.add_value(Some("out"), None, None);
        g.add_op(
            Some("add"),
            Box::new(Add {}),
            &[Some(input), Some(bias)],
            &[Some(out)],
        );
        g.set_input_ids(&[input]);
        g.set_output_ids(&[out]);

        let folded = fold_constants(&mut g, &FoldOptions::default()).unwrap();
        assert_eq!(folded, 0);
        assert_eq!(g.operator_count(), 1);
    }

    #[test]
    fn test_fold_keeps_graph_on_evaluation_failure() {
        let mut g = Graph::new();
        let a = g.add_constant(Some("a"), Tensor::from_vec(vec![1.0f32, 2.0]));
        let b = g.add_constant(Some("b"), Tensor::from_vec(vec![1.0f32, 2.0, 3.0]));
        let out = g.add_value(Some("out"), None, None);
        g.add_op(Some("add"), Box::new(Add {}), &[Some(a), Some(b)], &[Some(out)]);
        g.set_output_ids(&[out]);

        // Incompatible operand shapes: evaluation fails, the op is skipped.
        let folded = fold_constants(&mut g, &FoldOptions::default()).unwrap();
        assert_eq!(folded, 0);
        assert_eq!(g.operator_count(), 1);
    }

    #[test]
    fn test_fold_shapes_from_metadata() {
        let mut g = Graph::new();
        let input = g.add_value(
            Some("input"),
            Some(vec![2.into(), 3.into()]),
            None,
        );
        let shape = g.add_value(Some("shape"), None, None);
        g.add_op(
            Some("shape_of"),
            Box::new(Shape {}),
            &[Some(input)],
            &[Some(shape)],
        );
        g.set_input_ids(&[input]);
        g.set_output_ids(&[shape]);

        // Without shape folding the operator stays.
        let folded = fold_constants(&mut g, &FoldOptions { fold_shapes: false }).unwrap();
        assert_eq!(folded, 0);

        let folded = fold_constants(&mut g, &FoldOptions { fold_shapes: true }).unwrap();
        assert_eq!(folded, 1);
        assert_eq!(g.operator_count(), 0);
        assert_eq!(output_constant_i32(&g), vec![2, 3]);
    }

    #[test]
    fn test_fold_shapes_skips_symbolic_dims() {
        let mut g = Graph::new();
        let input = g.add_value(
            Some("input"),
            Some(vec!["batch".into(), 3.into()]),
            None,
        );
        let shape = g.add_value(Some("shape"), None, None);
        g.add_op(
            Some("shape_of"),
            Box::new(Shape {}),
            &[Some(input)],
            &[Some(shape)],
        );
        g.set_input_ids(&[input]);
        g.set_output_ids(&[shape]);

        let folded = fold_constants(&mut g, &FoldOptions { fold_shapes: true }).unwrap();
        assert_eq!(folded, 0);
        assert_eq!(g.operator_count(), 1);
    }

    /// A `Shape`-class operator implementation without the metadata folding
    /// capability.
    #[derive(Debug)]
    struct LegacyShape {}

    impl Operator for LegacyShape {
        fn name(&self) -> &str {
            "Shape"
        }

        fn run(&self, inputs: InputList) -> Result<Vec<Output>, OpError> {
            let input = inputs.require(0)?;
            let dims: Vec<i32> = input.shape().iter().map(|&size| size as i32).collect();
            Ok(vec![Tensor::from_vec(dims).into()])
        }
    }

    impl ReadOp for LegacyShape {
        fn op_type() -> &'static str {
            "Shape"
        }

        fn read(_attrs: &Attrs) -> Result<LegacyShape, ReadOpError> {
            Ok(LegacyShape {})
        }
    }

    fn legacy_shape_graph() -> Graph {
        let mut g = Graph::new();
        let input = g.add_value(Some("input"), Some(vec![2.into(), 3.into()]), None);
        let shape = g.add_value(Some("shape"), None, None);
        g.add_op(
            Some("shape_of"),
            Box::new(LegacyShape {}),
            &[Some(input)],
            &[Some(shape)],
        );
        g.set_input_ids(&[input]);
        g.set_output_ids(&[shape]);
        g
    }

    #[test]
    fn test_fold_shapes_unsupported_is_an_error() {
        let mut g = legacy_shape_graph();
        let result = fold_constants(&mut g, &FoldOptions { fold_shapes: true });
        assert_eq!(
            result,
            Err(FoldError::ShapeFoldingUnsupported {
                op: "shape_of".to_string()
            })
        );
    }

    #[test]
    fn test_refine_folds_shape_arithmetic() {
        // shape(input) * 2 where input has fixed dims: the Shape op folds
        // from metadata and the Mul then folds from constants.
        let mut g = Graph::new();
        let input = g.add_value(Some("input"), Some(vec![2.into(), 3.into()]), None);
        let two = g.add_constant(Some("two"), Tensor::from_scalar(2i32));
        let shape = g.add_value(Some("shape"), None, None);
        let scaled = g.add_value(Some("scaled"), None, None);
        g.add_op(
            Some("shape_of"),
            Box::new(Shape {}),
            &[Some(input)],
            &[Some(shape)],
        );
        g.add_op(
            Some("scale"),
            Box::new(Mul {}),
            &[Some(shape), Some(two)],
            &[Some(scaled)],
        );
        g.set_input_ids(&[input]);
        g.set_output_ids(&[scaled]);

        let refined = Refiner::new().refine(g).unwrap();
        assert_eq!(refined.operator_count(), 0);
        assert_eq!(output_constant_i32(&refined), vec![4, 6]);
    }

    #[test]
    fn test_refine_at_fixpoint_is_a_noop() {
        let mut g = Graph::new();
        let input = g.add_value(Some("input"), None, None);
        let out = g.add_value(Some("out"), None, None);
        g.add_op(Some("id"), Box::new(Identity {}), &[Some(input)], &[Some(out)]);
        g.set_input_ids(&[input]);
        g.set_output_ids(&[out]);

        let refined = Refiner::new().refine(g).unwrap();
        assert_eq!(refined.operator_count(), 1);
        assert!(refined.get_node_id("id").is_some());
    }

    /// An operator with no shape inference rule, exercising the non-fatal
    /// inference failure path.
    #[derive(Debug)]
    struct Mystery {}

    impl Operator for Mystery {
        fn name(&self) -> &str {
            "Mystery"
        }

        fn run(&self, _inputs: InputList) -> Result<Vec<Output>, OpError> {
            Err(OpError::InvalidValue("not statically computable"))
        }
    }

    #[test]
    fn test_refine_continues_when_inference_unavailable() {
        let mut g = const_expr_graph();
        let input = g.add_value(Some("input"), None, None);
        let mystery_out = g.add_value(Some("mystery_out"), None, None);
        g.add_op(
            Some("mystery"),
            Box::new(Mystery {}),
            &[Some(input)],
            &[Some(mystery_out)],
        );
        g.set_input_ids(&[input]);
        let product_id = g.get_node_id("product").unwrap();
        g.set_output_ids(&[product_id, mystery_out]);

        // Shape inference fails on the unknown operator in every pass, but
        // refinement still folds the constant expression.
        let refined = Refiner::new().refine(g).unwrap();
        assert_eq!(refined.operator_count(), 1);
        assert!(refined.get_node_id("mystery").is_some());
        assert_eq!(output_constant_f32(&refined), vec![20.0]);
    }

    #[test]
    fn test_refine_shape_folding_failure_is_fatal() {
        let g = legacy_shape_graph();

        let mut registry = OpRegistry::with_all_ops();
        registry.register_op::<LegacyShape>();
        let result = Refiner::with_registry(registry).refine(g);
        assert!(matches!(
            result,
            Err(RefineError::Fold(FoldError::ShapeFoldingUnsupported { .. }))
        ));
    }
}
