//! Architecture resolution.
//!
//! Resolution walks the stages of the network in a fixed order. Each decision reads the
//! [`PartialConfig`] first, then the [`RandomSource`], then the default tables. The order in
//! which entropy is consumed is part of the contract: reordering the steps changes the
//! architecture produced for a given seed.
//!
//!```
//! # use netgen::{config::PartialConfig, resolve::{InputSpec, Resolver}, rng};
//! # fn main() -> netgen::result::Result<()> {
//! let partial = PartialConfig::new().with_encode_depth(3);
//! let resolution = Resolver::new(&partial, rng::seeded(0))
//!     .input(InputSpec::default())
//!     .resolve()?;
//! assert_eq!(resolution.config.encode_depth, 3);
//! # Ok(())
//! # }
//!```
use crate::{
    config::{
        ArchConfig, ConvSpec, DecodeStage, EncodeStage, HiddenStage, PartialConfig,
        PartialDecodeStage, PoolKind, PoolSpec,
    },
    error::Error,
    result::Result,
    rng::RandomSource,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Exclusive upper bound of a drawn filter seed.
pub const FILTER_SEED_BOUND: usize = 10_000;
pub const ENCODE_DEPTHS: [usize; 5] = [1, 2, 3, 4, 5];
/// Encoder filter sizes, filtered to those not larger than the previous stage's.
pub const ENCODE_FILTER_SIZES: [usize; 8] = [1, 3, 5, 7, 9, 11, 13, 15];
/// Default encoder channels, indexed directly by stage number.
///
/// Index 0 is never read. Stages past the end of the table have no default and must be
/// configured explicitly.
pub const ENCODE_CHANNELS: [usize; 6] = [3, 48, 96, 128, 256, 128];
pub const POOL_FILTER_SIZES: [usize; 3] = [2, 3, 5];
pub const DEFAULT_POOL_STRIDE: usize = 2;
pub const HIDDEN_DEPTHS: [usize; 3] = [1, 2, 3];
pub const DEFAULT_HIDDEN_FEATURES: usize = 1024;
pub const DECODE_DEPTHS: [usize; 3] = [1, 2, 3];
pub const DEFAULT_DECODE_FILTERS: usize = 32;
pub const DEFAULT_DECODE_FILTER_SIZE: usize = 7;
pub const BYPASS_PROBABILITY: f64 = 0.5;

/// Shapes of the tensors fed to the network.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InputSpec {
    /// Side of the square observation and target images.
    pub image_size: usize,
    /// Channels per frame, also the channels of the predicted image.
    pub channels: usize,
    /// Frames stacked into one observation.
    pub observation_length: usize,
    pub atomic_action_length: usize,
    pub max_num_actions: usize,
    pub batch_size: usize,
}

impl Default for InputSpec {
    fn default() -> Self {
        Self {
            image_size: 256,
            channels: 3,
            observation_length: 2,
            atomic_action_length: 14,
            max_num_actions: 10,
            batch_size: 128,
        }
    }
}

impl InputSpec {
    /// Channel depth of the stacked observation.
    pub fn observation_channels(&self) -> usize {
        self.channels * self.observation_length
    }
    /// Length of the flattened action sequence.
    pub fn action_len(&self) -> usize {
        self.atomic_action_length * self.max_num_actions
    }
    /// The shape the decoder must produce.
    pub fn target(&self) -> Target {
        Target {
            size: self.image_size,
            channels: self.channels,
        }
    }
}

/// The spatial size and channels of the terminal decoder stage.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Target {
    pub size: usize,
    pub channels: usize,
}

/// How the decoder is wired to the encoder.
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Topology {
    /// Asymmetric decoder with optional bypass connections, predicting the future image.
    #[default]
    Bypass,
    /// Decoder mirroring the encoder, scored against the encoded future at every scale.
    Coupled,
}

/// Output side of a SAME padded convolution or pooling.
pub fn same_padding(side: usize, stride: usize) -> usize {
    side.div_ceil(stride)
}

/// The decoder size schedule, from `init` to `target` over `depth` stages.
///
/// Sizes are spaced evenly in log2 and rounded half to even. The last entry is always
/// `target`. The result has `depth + 1` entries; entry 0 is the reshape target.
pub fn decode_schedule(init: usize, target: usize, depth: usize) -> Vec<usize> {
    if depth == 0 {
        return vec![target];
    }
    if init == target {
        return vec![target; depth + 1];
    }
    let start = (init as f64).log2();
    let end = (target as f64).log2();
    let increment = (end - start) / depth as f64;
    (0..depth)
        .map(|k| (start + k as f64 * increment).exp2().round_ties_even() as usize)
        .chain(std::iter::once(target))
        .collect()
}

/// The index of the size closest to `target`, the first one on ties.
pub fn nearest_size(sizes: &[usize], target: usize) -> Option<usize> {
    sizes
        .iter()
        .enumerate()
        .min_by_key(|(_, size)| size.abs_diff(target))
        .map(|(index, _)| index)
}

/// A resolved architecture with the encoder bookkeeping used to build it.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Resolution {
    pub config: ArchConfig,
    /// Spatial side of every encoder activation, index 0 being the observation.
    pub encode_sizes: Vec<usize>,
    /// Channels of every encoder activation, index 0 being the observation.
    pub encode_channels: Vec<usize>,
}

/// Resolves a [`PartialConfig`] into an [`ArchConfig`].
#[derive(Debug)]
pub struct Resolver<'a, R> {
    partial: &'a PartialConfig,
    rng: R,
    input: InputSpec,
    topology: Topology,
}

impl<'a, R: RandomSource> Resolver<'a, R> {
    /// Creates a resolver reading `partial` and drawing from `rng`.
    ///
    /// Defaults:
    /// - input: [`InputSpec::default()`]
    /// - topology: [`Topology::Bypass`]
    pub fn new(partial: &'a PartialConfig, rng: R) -> Self {
        Self {
            partial,
            rng,
            input: InputSpec::default(),
            topology: Topology::default(),
        }
    }
    pub fn input(self, input: InputSpec) -> Self {
        Self { input, ..self }
    }
    pub fn topology(self, topology: Topology) -> Self {
        Self { topology, ..self }
    }
    /// Resolves every stage.
    ///
    /// **Errors**
    ///
    /// - [`Error::TerminalShape`] if the last decoder stage cannot produce the target image.
    /// - [`Error::ChannelTableExhausted`] if an encoder stage past the default table has no
    ///   explicit channel count.
    /// - [`Error::InvalidConfig`] if the partial config contradicts itself.
    pub fn resolve(mut self) -> Result<Resolution> {
        check_input(&self.input)?;
        let filter_seed = match self.partial.filter_seed {
            Some(seed) => seed,
            None => self.rng.below(FILTER_SEED_BOUND) as u64,
        };
        let encode_depth = self.encode_depth()?;
        tracing::debug!(encode_depth, "encode depth");
        let mut encode = BTreeMap::new();
        let mut encode_sizes = vec![self.input.image_size];
        let mut encode_channels = vec![self.input.observation_channels()];
        let mut prev_filter_size = None;
        let mut side = self.input.image_size;
        for i in 1..=encode_depth {
            let stage = self.encode_stage(i, encode_depth, prev_filter_size)?;
            prev_filter_size.replace(stage.conv.filter_size);
            side = same_padding(side, stage.conv.stride);
            if let Some(pool) = stage.pool.as_ref() {
                side = same_padding(side, pool.stride);
            }
            tracing::debug!(stage = i, side, ?stage, "encode stage");
            encode_sizes.push(side);
            encode_channels.push(stage.conv.num_filters);
            encode.insert(i, stage);
        }
        let hidden_depth = self.hidden_depth()?;
        let hidden = (1..=hidden_depth)
            .map(|i| {
                let num_features = self
                    .partial
                    .hidden_stage(i)
                    .and_then(|stage| stage.num_features)
                    .unwrap_or(DEFAULT_HIDDEN_FEATURES);
                positive("hidden num_features", i, num_features)?;
                Ok((i, HiddenStage { num_features }))
            })
            .collect::<Result<BTreeMap<_, _>>>()?;
        tracing::debug!(hidden_depth, "hidden depth");
        let (decode_depth, decode) = match self.topology {
            Topology::Bypass => self.decode_bypass(&encode_sizes)?,
            Topology::Coupled => self.decode_coupled(&encode_sizes, encode_depth)?,
        };
        tracing::debug!(decode_depth, ?decode, "decode stages");
        let config = ArchConfig {
            filter_seed,
            encode_depth,
            encode,
            hidden_depth,
            hidden,
            decode_depth,
            decode,
        };
        tracing::info!(
            filter_seed,
            encode_depth,
            hidden_depth,
            decode_depth,
            topology = ?self.topology,
            "resolved architecture"
        );
        Ok(Resolution {
            config,
            encode_sizes,
            encode_channels,
        })
    }
    fn encode_depth(&mut self) -> Result<usize> {
        let max_key = max_stage_key("encode", &self.partial.encode, 1)?;
        let depth = match self.partial.encode_depth {
            Some(depth) => {
                check_depth("encode", depth, max_key)?;
                depth
            }
            None => self.rng.choose(&ENCODE_DEPTHS).max(max_key.unwrap_or(0)),
        };
        if depth == 0 {
            return Err(Error::invalid_config("encode_depth must be at least 1"));
        }
        Ok(depth)
    }
    fn encode_stage(
        &mut self,
        i: usize,
        depth: usize,
        prev_filter_size: Option<usize>,
    ) -> Result<EncodeStage> {
        let explicit = self.partial.encode_stage(i).copied().unwrap_or_default();
        let filter_size = match explicit.conv.filter_size {
            Some(filter_size) => positive("encode conv filter_size", i, filter_size)?,
            None => {
                let candidates: Vec<usize> = ENCODE_FILTER_SIZES
                    .into_iter()
                    .filter(|size| prev_filter_size.map_or(true, |prev| *size <= prev))
                    .collect();
                if candidates.is_empty() {
                    return Err(Error::invalid_config(format!(
                        "no encode filter size fits below {prev_filter_size:?} at stage {i}"
                    )));
                }
                self.rng.choose(&candidates)
            }
        };
        let num_filters = match explicit.conv.num_filters {
            Some(num_filters) => positive("encode conv num_filters", i, num_filters)?,
            None => *ENCODE_CHANNELS
                .get(i)
                .ok_or(Error::ChannelTableExhausted {
                    stage: i,
                    len: ENCODE_CHANNELS.len(),
                })?,
        };
        let stride = match explicit.conv.stride {
            Some(stride) => positive("encode conv stride", i, stride)?,
            None if i == 1 && depth > 1 => 2,
            None if i == 1 => 3,
            None => 1,
        };
        let conv = ConvSpec {
            filter_size,
            num_filters,
            stride,
        };
        let do_pool = match (explicit.do_pool, explicit.pool) {
            (Some(do_pool), _) => do_pool,
            (None, Some(_)) => true,
            (None, None) => {
                let p = if i < 3 || i == depth { 0.75 } else { 0.25 };
                self.rng.uniform() < p
            }
        };
        let pool = if do_pool {
            let explicit = explicit.pool.unwrap_or_default();
            let filter_size = match explicit.filter_size {
                Some(filter_size) => positive("encode pool filter_size", i, filter_size)?,
                None => self.rng.choose(&POOL_FILTER_SIZES),
            };
            let stride = match explicit.stride {
                Some(stride) => positive("encode pool stride", i, stride)?,
                None => DEFAULT_POOL_STRIDE,
            };
            let kind = match explicit.kind {
                Some(kind) => kind,
                None => self.rng.choose(&PoolKind::ALL),
            };
            Some(PoolSpec {
                filter_size,
                stride,
                kind,
            })
        } else {
            None
        };
        Ok(EncodeStage { conv, pool })
    }
    fn hidden_depth(&mut self) -> Result<usize> {
        let max_key = max_stage_key("hidden", &self.partial.hidden, 1)?;
        Ok(match self.partial.hidden_depth {
            Some(depth) => {
                check_depth("hidden", depth, max_key)?;
                depth
            }
            None => self.rng.choose(&HIDDEN_DEPTHS).max(max_key.unwrap_or(0)),
        })
    }
    fn decode_bypass(
        &mut self,
        encode_sizes: &[usize],
    ) -> Result<(usize, BTreeMap<usize, DecodeStage>)> {
        let max_key = max_stage_key("decode", &self.partial.decode, 0)?;
        let depth = match self.partial.decode_depth {
            Some(depth) => {
                check_depth("decode", depth, max_key)?;
                depth
            }
            None => self.rng.choose(&DECODE_DEPTHS).max(max_key.unwrap_or(0)),
        };
        let target = self.input.target();
        let init = encode_sizes.last().copied().unwrap_or(target.size);
        let schedule = decode_schedule(init, target.size, depth);
        let mut decode = BTreeMap::new();
        let explicit = self.partial.decode_stage(0).copied().unwrap_or_default();
        check_reshape_stage(&explicit)?;
        let stage = DecodeStage {
            num_filters: decode_filters(0, depth, &explicit, target)?,
            size: decode_size(0, depth, &explicit, schedule[0], target)?,
            filter_size: None,
            bypass: None,
        };
        decode.insert(0, stage);
        for i in 1..=depth {
            let explicit = self.partial.decode_stage(i).copied().unwrap_or_default();
            let size = decode_size(i, depth, &explicit, schedule[i], target)?;
            let bypass = match (explicit.bypass, explicit.do_bypass) {
                (Some(bypass), _) => {
                    if bypass >= encode_sizes.len() {
                        return Err(Error::invalid_config(format!(
                            "decode stage {i} bypasses encode stage {bypass} beyond depth {}",
                            encode_sizes.len() - 1
                        )));
                    }
                    Some(bypass)
                }
                (None, Some(false)) => None,
                (None, Some(true)) => nearest_size(encode_sizes, size),
                (None, None) => {
                    if self.rng.uniform() < BYPASS_PROBABILITY {
                        nearest_size(encode_sizes, size)
                    } else {
                        None
                    }
                }
            };
            let filter_size = match explicit.filter_size {
                Some(filter_size) => positive("decode filter_size", i, filter_size)?,
                None => DEFAULT_DECODE_FILTER_SIZE,
            };
            let stage = DecodeStage {
                num_filters: decode_filters(i, depth, &explicit, target)?,
                size,
                filter_size: Some(filter_size),
                bypass,
            };
            decode.insert(i, stage);
        }
        Ok((depth, decode))
    }
    fn decode_coupled(
        &mut self,
        encode_sizes: &[usize],
        encode_depth: usize,
    ) -> Result<(usize, BTreeMap<usize, DecodeStage>)> {
        let max_key = max_stage_key("decode", &self.partial.decode, 0)?;
        if let Some(depth) = self.partial.decode_depth {
            if depth != encode_depth {
                return Err(Error::invalid_config(format!(
                    "coupled decode_depth {depth} must equal encode_depth {encode_depth}"
                )));
            }
        }
        check_depth("decode", encode_depth, max_key)?;
        let target = self.input.target();
        let mut decode = BTreeMap::new();
        for i in 0..=encode_depth {
            let explicit = self.partial.decode_stage(i).copied().unwrap_or_default();
            let side = encode_sizes[encode_depth - i];
            if explicit.size.is_some_and(|size| size != side) {
                return Err(Error::invalid_config(format!(
                    "coupled decode stage {i} must have size {side}, found {:?}",
                    explicit.size
                )));
            }
            if explicit.bypass.is_some() || explicit.do_bypass == Some(true) {
                return Err(Error::invalid_config(format!(
                    "coupled decode stage {i} cannot take a bypass"
                )));
            }
            let filter_size = if i == 0 {
                check_reshape_stage(&explicit)?;
                None
            } else {
                Some(match explicit.filter_size {
                    Some(filter_size) => positive("decode filter_size", i, filter_size)?,
                    None => DEFAULT_DECODE_FILTER_SIZE,
                })
            };
            let stage = DecodeStage {
                num_filters: decode_filters(i, encode_depth, &explicit, target)?,
                size: decode_size(i, encode_depth, &explicit, side, target)?,
                filter_size,
                bypass: None,
            };
            decode.insert(i, stage);
        }
        Ok((encode_depth, decode))
    }
}

/// Resolves `partial` with the default topology.
pub fn resolve<R: RandomSource>(
    rng: R,
    partial: &PartialConfig,
    input: InputSpec,
) -> Result<ArchConfig> {
    Ok(Resolver::new(partial, rng).input(input).resolve()?.config)
}

/// Decoder stage 0 is a reshape, it has no convolution and no bypass.
fn check_reshape_stage(explicit: &PartialDecodeStage) -> Result<()> {
    if explicit.bypass.is_some() || explicit.do_bypass == Some(true) {
        return Err(Error::invalid_config("decode stage 0 cannot take a bypass"));
    }
    if explicit.filter_size.is_some() {
        return Err(Error::invalid_config(
            "decode stage 0 has no convolution filter_size",
        ));
    }
    Ok(())
}

fn decode_filters(
    i: usize,
    depth: usize,
    explicit: &PartialDecodeStage,
    target: Target,
) -> Result<usize> {
    if i < depth {
        return match explicit.num_filters {
            Some(num_filters) => positive("decode num_filters", i, num_filters),
            None => Ok(DEFAULT_DECODE_FILTERS),
        };
    }
    let num_filters = explicit.num_filters.unwrap_or(target.channels);
    if num_filters != target.channels {
        return Err(Error::TerminalShape {
            stage: i,
            what: "channels",
            expected: target.channels,
            found: num_filters,
        });
    }
    Ok(num_filters)
}

fn decode_size(
    i: usize,
    depth: usize,
    explicit: &PartialDecodeStage,
    scheduled: usize,
    target: Target,
) -> Result<usize> {
    let size = match explicit.size {
        Some(size) => positive("decode size", i, size)?,
        None => scheduled,
    };
    if i == depth && size != target.size {
        return Err(Error::TerminalShape {
            stage: i,
            what: "spatial size",
            expected: target.size,
            found: size,
        });
    }
    Ok(size)
}

fn max_stage_key<T>(
    section: &str,
    stages: &BTreeMap<usize, T>,
    first: usize,
) -> Result<Option<usize>> {
    if let Some(&key) = stages.keys().next() {
        if key < first {
            return Err(Error::invalid_config(format!(
                "{section} stages start at {first}, found stage {key}"
            )));
        }
    }
    Ok(stages.keys().next_back().copied())
}

fn check_depth(section: &str, depth: usize, max_key: Option<usize>) -> Result<()> {
    match max_key {
        Some(key) if key > depth => Err(Error::invalid_config(format!(
            "{section}_depth {depth} is below explicit stage {key}"
        ))),
        _ => Ok(()),
    }
}

fn positive(what: &str, stage: usize, value: usize) -> Result<usize> {
    if value == 0 {
        return Err(Error::invalid_config(format!(
            "{what} of stage {stage} must be positive"
        )));
    }
    Ok(value)
}

fn check_input(input: &InputSpec) -> Result<()> {
    let InputSpec {
        image_size,
        channels,
        observation_length,
        batch_size,
        ..
    } = *input;
    if image_size == 0 || channels == 0 || observation_length == 0 || batch_size == 0 {
        return Err(Error::invalid_config(format!(
            "input dimensions must be positive: {input:?}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests;
