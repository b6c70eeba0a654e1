//! Symbolic computation graphs.
//!
//! A [`Graph`] records operations and their static shapes without evaluating anything.
//! Every builder method checks the shapes of its operands and returns [`Error::Shape`] on a
//! mismatch, so a graph that assembles is consistent end to end. Trainable tensors are
//! declared with [`Graph::parameter`] and materialized with [`Graph::materialize`].
//!
//! Activations are laid out as `[batch, height, width, channels]`.
use crate::{config::PoolKind, error::Error, init::Init, result::Result};
use ndarray as nd;
use rand::{rngs::StdRng, SeedableRng};
use serde::Serialize;
use std::fmt::{self, Display};

mod assemble;
pub use assemble::{assemble, Assembly, AssemblyOptions, Inputs};


/// Index of a node within its [`Graph`].
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(&self) -> usize {
        self.0
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Op {
    Input {
        name: String,
    },
    /// Index into [`Graph::parameters`].
    Parameter {
        index: usize,
    },
    Conv2d {
        input: NodeId,
        weights: NodeId,
        stride: usize,
    },
    BiasAdd {
        input: NodeId,
        bias: NodeId,
    },
    Relu {
        input: NodeId,
    },
    Pool {
        input: NodeId,
        kind: PoolKind,
        filter_size: usize,
        stride: usize,
    },
    Flatten {
        input: NodeId,
    },
    Concat {
        inputs: Vec<NodeId>,
        axis: usize,
    },
    MatMul {
        input: NodeId,
        weights: NodeId,
    },
    Reshape {
        input: NodeId,
    },
    /// Bilinear resize of the spatial dimensions.
    Resize {
        input: NodeId,
        size: usize,
    },
    Add {
        lhs: NodeId,
        rhs: NodeId,
    },
    Sub {
        lhs: NodeId,
        rhs: NodeId,
    },
    /// Half the sum of squares.
    L2Loss {
        input: NodeId,
    },
    Scale {
        input: NodeId,
        factor: f64,
    },
}

impl Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Input { name } => write!(f, "input {name}"),
            Self::Parameter { index } => write!(f, "parameter #{index}"),
            Self::Conv2d {
                input,
                weights,
                stride,
            } => write!(f, "conv2d({input}, {weights}, stride {stride})"),
            Self::BiasAdd { input, bias } => write!(f, "bias_add({input}, {bias})"),
            Self::Relu { input } => write!(f, "relu({input})"),
            Self::Pool {
                input,
                kind,
                filter_size,
                stride,
            } => {
                let kind = match kind {
                    PoolKind::Max => "max",
                    PoolKind::Avg => "avg",
                };
                write!(f, "{kind}_pool({input}, size {filter_size}, stride {stride})")
            }
            Self::Flatten { input } => write!(f, "flatten({input})"),
            Self::Concat { inputs, axis } => {
                write!(f, "concat(")?;
                for input in inputs {
                    write!(f, "{input}, ")?;
                }
                write!(f, "axis {axis})")
            }
            Self::MatMul { input, weights } => write!(f, "matmul({input}, {weights})"),
            Self::Reshape { input } => write!(f, "reshape({input})"),
            Self::Resize { input, size } => write!(f, "resize({input}, {size})"),
            Self::Add { lhs, rhs } => write!(f, "add({lhs}, {rhs})"),
            Self::Sub { lhs, rhs } => write!(f, "sub({lhs}, {rhs})"),
            Self::L2Loss { input } => write!(f, "l2_loss({input})"),
            Self::Scale { input, factor } => write!(f, "scale({input}, {factor})"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Node {
    pub op: Op,
    pub shape: Vec<usize>,
}

/// A trainable tensor.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParameterSpec {
    /// Slash separated identifier, ie `encode1/conv/weights`.
    pub name: String,
    pub shape: Vec<usize>,
    pub init: Init,
}

impl ParameterSpec {
    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A graph under construction or fully assembled.
#[derive(Debug, Default, Clone, Serialize)]
pub struct Graph {
    nodes: Vec<Node>,
    parameters: Vec<ParameterSpec>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }
    pub fn shape(&self, id: NodeId) -> &[usize] {
        &self.nodes[id.0].shape
    }
    /// Parameters in creation order.
    pub fn parameters(&self) -> &[ParameterSpec] {
        &self.parameters
    }
    pub fn parameter_spec(&self, name: &str) -> Option<&ParameterSpec> {
        self.parameters.iter().find(|spec| spec.name == name)
    }
    /// Total number of trainable elements.
    pub fn num_parameter_elements(&self) -> usize {
        self.parameters.iter().map(ParameterSpec::len).sum()
    }
    fn push(&mut self, op: Op, shape: Vec<usize>) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node { op, shape });
        id
    }
    fn check_node(&self, id: NodeId) -> Result<&[usize]> {
        self.nodes
            .get(id.0)
            .map(|node| node.shape.as_slice())
            .ok_or_else(|| Error::Shape(format!("{id} is not a node of this graph")))
    }
    fn check_rank(&self, id: NodeId, rank: usize, what: &str) -> Result<&[usize]> {
        let shape = self.check_node(id)?;
        if shape.len() != rank {
            return Err(Error::Shape(format!(
                "{what} expects rank {rank}, {id} has shape {shape:?}"
            )));
        }
        Ok(shape)
    }
    pub fn input(&mut self, name: impl Into<String>, shape: impl Into<Vec<usize>>) -> NodeId {
        self.push(Op::Input { name: name.into() }, shape.into())
    }
    /// Declares a trainable tensor.
    ///
    /// **Errors**
    ///
    /// If a parameter with `name` already exists.
    pub fn parameter(
        &mut self,
        name: impl Into<String>,
        shape: impl Into<Vec<usize>>,
        init: Init,
    ) -> Result<NodeId> {
        let name = name.into();
        if self.parameter_spec(&name).is_some() {
            return Err(Error::Shape(format!("parameter {name:?} declared twice")));
        }
        let shape = shape.into();
        let index = self.parameters.len();
        self.parameters.push(ParameterSpec {
            name,
            shape: shape.clone(),
            init,
        });
        Ok(self.push(Op::Parameter { index }, shape))
    }
    /// SAME padded 2d convolution with `weights` shaped `[k, k, in, out]`.
    pub fn conv2d(&mut self, input: NodeId, weights: NodeId, stride: usize) -> Result<NodeId> {
        let x = self.check_rank(input, 4, "conv2d input")?;
        let w = self.check_rank(weights, 4, "conv2d weights")?;
        if stride == 0 {
            return Err(Error::Shape("conv2d stride must be positive".into()));
        }
        if w[2] != x[3] {
            return Err(Error::Shape(format!(
                "conv2d weights {w:?} do not take {} input channels",
                x[3]
            )));
        }
        let shape = vec![x[0], x[1].div_ceil(stride), x[2].div_ceil(stride), w[3]];
        Ok(self.push(
            Op::Conv2d {
                input,
                weights,
                stride,
            },
            shape,
        ))
    }
    /// Adds `bias` along the last axis.
    pub fn bias_add(&mut self, input: NodeId, bias: NodeId) -> Result<NodeId> {
        let x = self.check_node(input)?.to_vec();
        let b = self.check_rank(bias, 1, "bias")?;
        if x.last() != b.first() {
            return Err(Error::Shape(format!(
                "bias {b:?} does not match {input} shaped {x:?}"
            )));
        }
        Ok(self.push(Op::BiasAdd { input, bias }, x))
    }
    pub fn relu(&mut self, input: NodeId) -> Result<NodeId> {
        let x = self.check_node(input)?.to_vec();
        Ok(self.push(Op::Relu { input }, x))
    }
    /// SAME padded pooling.
    pub fn pool(
        &mut self,
        input: NodeId,
        kind: PoolKind,
        filter_size: usize,
        stride: usize,
    ) -> Result<NodeId> {
        let x = self.check_rank(input, 4, "pool input")?;
        if filter_size == 0 || stride == 0 {
            return Err(Error::Shape(format!(
                "pool size {filter_size} and stride {stride} must be positive"
            )));
        }
        let shape = vec![x[0], x[1].div_ceil(stride), x[2].div_ceil(stride), x[3]];
        Ok(self.push(
            Op::Pool {
                input,
                kind,
                filter_size,
                stride,
            },
            shape,
        ))
    }
    /// Flattens all but the batch axis.
    pub fn flatten(&mut self, input: NodeId) -> Result<NodeId> {
        let x = self.check_node(input)?;
        let Some((&batch, rest)) = x.split_first() else {
            return Err(Error::Shape(format!("cannot flatten scalar {input}")));
        };
        let shape = vec![batch, rest.iter().product()];
        Ok(self.push(Op::Flatten { input }, shape))
    }
    /// Concatenates along `axis`, every other axis must agree.
    pub fn concat(&mut self, inputs: &[NodeId], axis: usize) -> Result<NodeId> {
        let Some((&first, rest)) = inputs.split_first() else {
            return Err(Error::Shape("concat of no inputs".into()));
        };
        let mut shape = self.check_node(first)?.to_vec();
        if axis >= shape.len() {
            return Err(Error::Shape(format!(
                "concat axis {axis} out of range for {shape:?}"
            )));
        }
        for &id in rest {
            let other = self.check_node(id)?;
            let compatible = other.len() == shape.len()
                && other
                    .iter()
                    .zip(shape.iter())
                    .enumerate()
                    .all(|(i, (a, b))| i == axis || a == b);
            if !compatible {
                return Err(Error::Shape(format!(
                    "cannot concat {shape:?} with {other:?} along axis {axis}"
                )));
            }
            shape[axis] += other[axis];
        }
        Ok(self.push(
            Op::Concat {
                inputs: inputs.to_vec(),
                axis,
            },
            shape,
        ))
    }
    /// `[batch, n] x [n, m] -> [batch, m]`
    pub fn matmul(&mut self, input: NodeId, weights: NodeId) -> Result<NodeId> {
        let x = self.check_rank(input, 2, "matmul input")?;
        let w = self.check_rank(weights, 2, "matmul weights")?;
        if x[1] != w[0] {
            return Err(Error::Shape(format!(
                "cannot multiply {x:?} by weights {w:?}"
            )));
        }
        let shape = vec![x[0], w[1]];
        Ok(self.push(Op::MatMul { input, weights }, shape))
    }
    pub fn reshape(&mut self, input: NodeId, shape: impl Into<Vec<usize>>) -> Result<NodeId> {
        let x = self.check_node(input)?;
        let shape = shape.into();
        if x.iter().product::<usize>() != shape.iter().product::<usize>() {
            return Err(Error::Shape(format!("cannot reshape {x:?} to {shape:?}")));
        }
        Ok(self.push(Op::Reshape { input }, shape))
    }
    pub fn resize(&mut self, input: NodeId, size: usize) -> Result<NodeId> {
        let x = self.check_rank(input, 4, "resize input")?;
        if size == 0 {
            return Err(Error::Shape("resize to an empty image".into()));
        }
        let shape = vec![x[0], size, size, x[3]];
        Ok(self.push(Op::Resize { input, size }, shape))
    }
    fn check_same(&self, lhs: NodeId, rhs: NodeId, what: &str) -> Result<Vec<usize>> {
        let a = self.check_node(lhs)?;
        let b = self.check_node(rhs)?;
        if a != b {
            return Err(Error::Shape(format!("cannot {what} {a:?} and {b:?}")));
        }
        Ok(a.to_vec())
    }
    pub fn add(&mut self, lhs: NodeId, rhs: NodeId) -> Result<NodeId> {
        let shape = self.check_same(lhs, rhs, "add")?;
        Ok(self.push(Op::Add { lhs, rhs }, shape))
    }
    pub fn sub(&mut self, lhs: NodeId, rhs: NodeId) -> Result<NodeId> {
        let shape = self.check_same(lhs, rhs, "subtract")?;
        Ok(self.push(Op::Sub { lhs, rhs }, shape))
    }
    pub fn l2_loss(&mut self, input: NodeId) -> Result<NodeId> {
        self.check_node(input)?;
        Ok(self.push(Op::L2Loss { input }, Vec::new()))
    }
    pub fn scale(&mut self, input: NodeId, factor: f64) -> Result<NodeId> {
        let x = self.check_node(input)?.to_vec();
        Ok(self.push(Op::Scale { input, factor }, x))
    }
    /// Materializes every parameter.
    ///
    /// One [`StdRng`] seeded with `filter_seed` is shared by all parameters in creation
    /// order, so the same graph and seed always produce the same arrays.
    pub fn materialize(&self, filter_seed: u64) -> ParameterSet {
        let mut rng = StdRng::seed_from_u64(filter_seed);
        let mut set = ParameterSet::default();
        for spec in self.parameters.iter() {
            let array = spec.init.array(&spec.shape, &mut rng);
            set.params.push((spec.name.clone(), array));
        }
        tracing::debug!(
            filter_seed,
            parameters = set.len(),
            elements = self.num_parameter_elements(),
            "materialized parameters"
        );
        set
    }
}

impl Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(
            f,
            "graph: {} nodes, {} parameters ({} elements)",
            self.nodes.len(),
            self.parameters.len(),
            self.num_parameter_elements(),
        )?;
        for (i, node) in self.nodes.iter().enumerate() {
            match &node.op {
                Op::Parameter { index } => writeln!(
                    f,
                    "  %{i} = parameter {} {:?}",
                    self.parameters[*index].name, node.shape
                )?,
                op => writeln!(f, "  %{i} = {op} {:?}", node.shape)?,
            }
        }
        Ok(())
    }
}

/// Named parameter arrays, in graph creation order.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ParameterSet {
    params: Vec<(String, nd::ArrayD<f32>)>,
}

impl ParameterSet {
    pub fn new() -> Self {
        Self::default()
    }
    /// Appends or replaces the array named `name`.
    pub fn insert(&mut self, name: impl Into<String>, array: nd::ArrayD<f32>) {
        let name = name.into();
        match self.params.iter_mut().find(|(n, _)| *n == name) {
            Some((_, slot)) => *slot = array,
            None => self.params.push((name, array)),
        }
    }
    pub fn get(&self, name: &str) -> Option<&nd::ArrayD<f32>> {
        self.params
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, array)| array)
    }
    pub fn iter(&self) -> impl Iterator<Item = (&str, &nd::ArrayD<f32>)> {
        self.params.iter().map(|(name, array)| (name.as_str(), array))
    }
    pub fn len(&self) -> usize {
        self.params.len()
    }
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }
}
