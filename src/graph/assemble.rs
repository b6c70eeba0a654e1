use super::{Graph, NodeId};
use crate::{
    config::ArchConfig,
    error::Error,
    init::Init,
    resolve::{InputSpec, Topology},
    result::Result,
};

const ENCODE_STDDEV: f32 = 0.01;
const HIDDEN_STDDEV: f32 = 0.01;
const HIDDEN_BIAS: f32 = 0.01;
const DECODE_STDDEV: f32 = 0.1;

/// Options for [`assemble`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AssemblyOptions {
    /// Multiplies the loss of the bypass topology.
    pub loss_multiple: f64,
}

impl Default for AssemblyOptions {
    fn default() -> Self {
        Self { loss_multiple: 1. }
    }
}

/// The graph inputs fed each step.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Inputs {
    /// `[batch, size, size, channels * observation_length]`
    pub observation: NodeId,
    /// The future image for [`Topology::Bypass`], the future observation for
    /// [`Topology::Coupled`].
    pub future: NodeId,
    /// `[batch, atomic_action_length * max_num_actions]`
    pub actions: NodeId,
    /// `[batch, 1]`
    pub time_delta: NodeId,
}

/// An assembled network.
#[derive(Debug, Clone)]
pub struct Assembly {
    pub graph: Graph,
    pub inputs: Inputs,
    /// The predicted image, absent for [`Topology::Coupled`] which only produces a loss.
    pub prediction: Option<NodeId>,
    /// Scalar training loss.
    pub loss: NodeId,
}

/// Builds the graph of a resolved `config`.
///
/// No randomness is consumed: the same config always yields the same graph. Weights are
/// materialized separately with [`Graph::materialize`].
///
/// **Errors**
///
/// - [`Error::InvalidConfig`] if the stage maps do not match the depths.
/// - [`Error::TerminalShape`] if the final decoder stage does not produce the target image.
/// - [`Error::Shape`] if the stages do not connect.
pub fn assemble(
    config: &ArchConfig,
    input: &InputSpec,
    topology: Topology,
    options: AssemblyOptions,
) -> Result<Assembly> {
    config.check_stages()?;
    check_terminal(config, input)?;
    let mut graph = Graph::new();
    let batch = input.batch_size;
    let size = input.image_size;
    let observation = graph.input(
        "observation",
        [batch, size, size, input.observation_channels()],
    );
    let future_channels = match topology {
        Topology::Bypass => input.channels,
        Topology::Coupled => input.observation_channels(),
    };
    let future = graph.input("future", [batch, size, size, future_channels]);
    let actions = graph.input("actions", [batch, input.action_len()]);
    let time_delta = graph.input("time_delta", [batch, 1]);
    let inputs = Inputs {
        observation,
        future,
        actions,
        time_delta,
    };
    let (prediction, loss) = match topology {
        Topology::Bypass => {
            let encoded = encoder(&mut graph, config, observation, None)?;
            let hidden = hidden(&mut graph, config, &encoded, &inputs)?;
            let prediction = bypass_decoder(&mut graph, config, hidden, &encoded)?;
            let diff = graph.sub(prediction, future)?;
            let l2 = graph.l2_loss(diff)?;
            let norm = (size * size * input.channels * batch) as f64;
            let loss = graph.scale(l2, options.loss_multiple / norm)?;
            (Some(prediction), loss)
        }
        Topology::Coupled => {
            let encoded = encoder(&mut graph, config, observation, Some(future))?;
            let hidden = hidden(&mut graph, config, &encoded, &inputs)?;
            (None, coupled_decoder(&mut graph, config, hidden, &encoded)?)
        }
    };
    tracing::debug!(
        nodes = graph.nodes().len(),
        parameters = graph.parameters().len(),
        ?topology,
        "assembled graph"
    );
    Ok(Assembly {
        graph,
        inputs,
        prediction,
        loss,
    })
}

fn check_terminal(config: &ArchConfig, input: &InputSpec) -> Result<()> {
    let target = input.target();
    let Some(last) = config.terminal_stage() else {
        return Err(Error::invalid_config("config has no terminal decode stage"));
    };
    if last.num_filters != target.channels {
        return Err(Error::TerminalShape {
            stage: config.decode_depth,
            what: "channels",
            expected: target.channels,
            found: last.num_filters,
        });
    }
    if last.size != target.size {
        return Err(Error::TerminalShape {
            stage: config.decode_depth,
            what: "spatial size",
            expected: target.size,
            found: last.size,
        });
    }
    Ok(())
}

/// Encoder activations, index 0 being the raw input.
struct Encoded {
    current: Vec<NodeId>,
    future: Vec<NodeId>,
}

/// Encodes the observation, and with shared weights the future observation if given.
fn encoder(
    graph: &mut Graph,
    config: &ArchConfig,
    observation: NodeId,
    future: Option<NodeId>,
) -> Result<Encoded> {
    let mut current = vec![observation];
    let mut encoded_future = future.into_iter().collect::<Vec<_>>();
    for (&i, stage) in config.encode.iter() {
        let in_channels = graph.shape(current[i - 1])[3];
        let conv = stage.conv;
        let weights = graph.parameter(
            format!("encode{i}/conv/weights"),
            [
                conv.filter_size,
                conv.filter_size,
                in_channels,
                conv.num_filters,
            ],
            Init::TruncatedNormal {
                stddev: ENCODE_STDDEV,
            },
        )?;
        let bias = graph.parameter(
            format!("encode{i}/conv/bias"),
            [conv.num_filters],
            Init::Zeros,
        )?;
        let mut stage_outputs = Vec::with_capacity(2);
        let future_input = encoded_future.get(i - 1).copied();
        for x in std::iter::once(current[i - 1]).chain(future_input) {
            let mut y = graph.conv2d(x, weights, conv.stride)?;
            y = graph.relu(y)?;
            y = graph.bias_add(y, bias)?;
            if let Some(pool) = stage.pool {
                y = graph.pool(y, pool.kind, pool.filter_size, pool.stride)?;
            }
            stage_outputs.push(y);
        }
        let mut stage_outputs = stage_outputs.into_iter();
        current.extend(stage_outputs.next());
        encoded_future.extend(stage_outputs.next());
    }
    Ok(Encoded {
        current,
        future: encoded_future,
    })
}

fn dense(
    graph: &mut Graph,
    scope: &str,
    input: NodeId,
    features: usize,
    stddev: f32,
    bias: f32,
) -> Result<NodeId> {
    let in_features = graph.shape(input)[1];
    let weights = graph.parameter(
        format!("{scope}/fc/weights"),
        [in_features, features],
        Init::TruncatedNormal { stddev },
    )?;
    let bias = graph.parameter(
        format!("{scope}/fc/bias"),
        [features],
        Init::Constant { value: bias },
    )?;
    let y = graph.matmul(input, weights)?;
    graph.bias_add(y, bias)
}

/// Flattens the deepest activation, appends actions and time, applies the hidden stack and
/// reshapes into decoder stage 0.
fn hidden(
    graph: &mut Graph,
    config: &ArchConfig,
    encoded: &Encoded,
    inputs: &Inputs,
) -> Result<NodeId> {
    let deepest = *encoded
        .current
        .last()
        .ok_or_else(|| Error::invalid_config("encoder has no stages"))?;
    let flat = graph.flatten(deepest)?;
    let mut x = graph.concat(&[flat, inputs.actions, inputs.time_delta], 1)?;
    for (&i, stage) in config.hidden.iter() {
        let y = dense(
            graph,
            &format!("hidden{i}"),
            x,
            stage.num_features,
            HIDDEN_STDDEV,
            HIDDEN_BIAS,
        )?;
        x = graph.relu(y)?;
    }
    let stage = &config.decode[&0];
    let features = stage.size * stage.size * stage.num_filters;
    if graph.shape(x)[1] != features {
        x = dense(graph, "decode0", x, features, HIDDEN_STDDEV, HIDDEN_BIAS)?;
    }
    let batch = graph.shape(x)[0];
    graph.reshape(x, [batch, stage.size, stage.size, stage.num_filters])
}

fn conv_stage(
    graph: &mut Graph,
    scope: &str,
    input: NodeId,
    filter_size: usize,
    num_filters: usize,
) -> Result<NodeId> {
    let in_channels = graph.shape(input)[3];
    let weights = graph.parameter(
        format!("{scope}/conv/weights"),
        [filter_size, filter_size, in_channels, num_filters],
        Init::TruncatedNormal {
            stddev: DECODE_STDDEV,
        },
    )?;
    let bias = graph.parameter(format!("{scope}/conv/bias"), [num_filters], Init::Zeros)?;
    let y = graph.conv2d(input, weights, 1)?;
    graph.bias_add(y, bias)
}

fn bypass_decoder(
    graph: &mut Graph,
    config: &ArchConfig,
    mut x: NodeId,
    encoded: &Encoded,
) -> Result<NodeId> {
    for (&i, stage) in config.decode.range(1..) {
        x = graph.resize(x, stage.size)?;
        if let Some(bypass) = stage.bypass {
            let mut skip = encoded.current[bypass];
            if graph.shape(skip)[1] != stage.size {
                skip = graph.resize(skip, stage.size)?;
            }
            x = graph.concat(&[x, skip], 3)?;
        }
        let filter_size = decode_filter_size(stage.filter_size, i)?;
        x = conv_stage(
            graph,
            &format!("decode{i}"),
            x,
            filter_size,
            stage.num_filters,
        )?;
        if i < config.decode_depth {
            x = graph.relu(x)?;
        }
    }
    Ok(x)
}

/// Predicts the encoded future at every scale, from the deepest to the raw input.
///
/// Each scale concatenates the decoder activation with the current encoder activation of
/// the same side and convolves to the channels of the future activation. The loss is the
/// sum of the normalized l2 losses of all scales.
fn coupled_decoder(
    graph: &mut Graph,
    config: &ArchConfig,
    mut decode: NodeId,
    encoded: &Encoded,
) -> Result<NodeId> {
    let depth = config.encode_depth;
    if config.decode_depth != depth {
        return Err(Error::invalid_config(format!(
            "coupled decode_depth {} must equal encode_depth {depth}",
            config.decode_depth
        )));
    }
    let mut loss = None;
    for (&i, stage) in config.decode.iter() {
        let level = depth - i;
        let target = encoded.future[level];
        let side = graph.shape(target)[1];
        if stage.size != side {
            return Err(Error::Shape(format!(
                "coupled decode stage {i} has size {}, encoder side is {side}",
                stage.size
            )));
        }
        if i > 0 {
            decode = graph.resize(decode, side)?;
            let filter_size = decode_filter_size(stage.filter_size, i)?;
            decode = conv_stage(
                graph,
                &format!("decode{i}"),
                decode,
                filter_size,
                stage.num_filters,
            )?;
        }
        let x = graph.concat(&[decode, encoded.current[level]], 3)?;
        // The raw input has no encode stage, the first stage's filter size stands in.
        let filter_size = config.encode[&level.max(1)].conv.filter_size;
        let channels = graph.shape(target)[3];
        let mut prediction = conv_stage(graph, &format!("predict{i}"), x, filter_size, channels)?;
        if i > 0 && i < depth {
            decode = graph.relu(decode)?;
            prediction = graph.relu(prediction)?;
        }
        let diff = graph.sub(prediction, target)?;
        let l2 = graph.l2_loss(diff)?;
        let batch = graph.shape(target)[0];
        let term = graph.scale(l2, 1. / (side * side * batch * channels) as f64)?;
        loss = Some(match loss {
            Some(loss) => graph.add(loss, term)?,
            None => term,
        });
    }
    loss.ok_or_else(|| Error::invalid_config("coupled decoder has no stages"))
}

fn decode_filter_size(filter_size: Option<usize>, stage: usize) -> Result<usize> {
    filter_size
        .ok_or_else(|| Error::invalid_config(format!("decode stage {stage} has no filter_size")))
}
