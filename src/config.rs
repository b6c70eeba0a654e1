//! Architecture configuration records.
//!
//! An [`ArchConfig`] is the fully resolved record of every architectural choice. It is
//! sufficient to rebuild an identical graph without further randomness. A [`PartialConfig`]
//! is the same record with every field optional; it is what users supply and what the
//! resolver reads before falling back to the random source.
//!
//! Stage maps are keyed by stage index. Encoder and hidden stages are numbered from 1,
//! decoder stages from 0 (stage 0 is the reshape target of the hidden stack).
use crate::{error::Error, result::Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

/// Persistence boundary conversions.
pub mod document;

/// Pooling operator.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolKind {
    Max,
    Avg,
}

impl PoolKind {
    /// Candidates in draw order.
    pub const ALL: [PoolKind; 2] = [PoolKind::Max, PoolKind::Avg];
}

/// Convolution of an encoder stage.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
pub struct ConvSpec {
    pub filter_size: usize,
    pub num_filters: usize,
    pub stride: usize,
}

/// Pooling of an encoder stage.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
pub struct PoolSpec {
    pub filter_size: usize,
    pub stride: usize,
    #[serde(rename = "type")]
    pub kind: PoolKind,
}

/// An encoder stage.
///
/// A stage without pooling is stored with `pool: null`, which pins the absence when the
/// record is read back as a [`PartialConfig`].
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
pub struct EncodeStage {
    pub conv: ConvSpec,
    #[serde(default)]
    pub pool: Option<PoolSpec>,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
pub struct HiddenStage {
    pub num_features: usize,
}

/// A decoder stage.
///
/// Stage 0 only records the reshape target (`num_filters`, `size`); later stages add the
/// convolution filter size and an optional bypass naming the encoder activation that is
/// concatenated before the convolution. A missing bypass is stored as `bypass: null`.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
pub struct DecodeStage {
    pub num_filters: usize,
    pub size: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter_size: Option<usize>,
    #[serde(default)]
    pub bypass: Option<usize>,
}

/// A fully resolved architecture.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct ArchConfig {
    pub filter_seed: u64,
    pub encode_depth: usize,
    pub encode: BTreeMap<usize, EncodeStage>,
    pub hidden_depth: usize,
    pub hidden: BTreeMap<usize, HiddenStage>,
    pub decode_depth: usize,
    pub decode: BTreeMap<usize, DecodeStage>,
}

fn check_keys<T>(
    section: &str,
    stages: &BTreeMap<usize, T>,
    range: std::ops::RangeInclusive<usize>,
) -> Result<()> {
    if !stages.keys().copied().eq(range.clone()) {
        return Err(Error::invalid_config(format!(
            "{section} stages {:?} do not cover {}..={}",
            stages.keys().collect::<Vec<_>>(),
            range.start(),
            range.end(),
        )));
    }
    Ok(())
}

impl ArchConfig {
    /// Checks that every stage map holds exactly the stages its depth names.
    ///
    /// Records loaded from storage are checked before use.
    pub fn check_stages(&self) -> Result<()> {
        check_keys("encode", &self.encode, 1..=self.encode_depth)?;
        check_keys("hidden", &self.hidden, 1..=self.hidden_depth)?;
        check_keys("decode", &self.decode, 0..=self.decode_depth)?;
        for (i, stage) in self.decode.iter() {
            if let Some(bypass) = stage.bypass {
                if bypass > self.encode_depth {
                    return Err(Error::invalid_config(format!(
                        "decode stage {i} bypasses encode stage {bypass} beyond depth {}",
                        self.encode_depth
                    )));
                }
            }
        }
        Ok(())
    }
    /// The terminal decoder stage.
    pub fn terminal_stage(&self) -> Option<&DecodeStage> {
        self.decode.get(&self.decode_depth)
    }
}

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartialConv {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter_size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_filters: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stride: Option<usize>,
}

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartialPool {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter_size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stride: Option<usize>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<PoolKind>,
}

/// A partially specified encoder stage.
///
/// `do_pool: false` disables pooling outright; `do_pool: true` or the presence of `pool`
/// enables it. Otherwise pooling is decided by a biased coin. When deserialized, an
/// explicit `pool: null` reads as `do_pool: false` unless `do_pool` is given.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(from = "EncodeStageFields")]
pub struct PartialEncodeStage {
    pub conv: PartialConv,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub do_pool: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool: Option<PartialPool>,
}

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartialHiddenStage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_features: Option<usize>,
}

/// A partially specified decoder stage.
///
/// An explicit `bypass` wins over `do_bypass`. `do_bypass: false` disables the bypass,
/// `do_bypass: true` attaches the nearest encoder activation without a coin flip. When
/// deserialized, an explicit `bypass: null` reads as `do_bypass: false` unless `do_bypass`
/// is given.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(from = "DecodeStageFields")]
pub struct PartialDecodeStage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_filters: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter_size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bypass: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub do_bypass: Option<bool>,
}

/// Reads a present field as `Some`, so `null` is told apart from a missing field.
fn present<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

#[derive(Default, Deserialize)]
#[serde(default)]
struct EncodeStageFields {
    conv: PartialConv,
    do_pool: Option<bool>,
    #[serde(deserialize_with = "present")]
    pool: Option<Option<PartialPool>>,
}

impl From<EncodeStageFields> for PartialEncodeStage {
    fn from(fields: EncodeStageFields) -> Self {
        let EncodeStageFields {
            conv,
            do_pool,
            pool,
        } = fields;
        let do_pool = match pool {
            Some(None) => do_pool.or(Some(false)),
            _ => do_pool,
        };
        Self {
            conv,
            do_pool,
            pool: pool.flatten(),
        }
    }
}

#[derive(Default, Deserialize)]
#[serde(default)]
struct DecodeStageFields {
    num_filters: Option<usize>,
    size: Option<usize>,
    filter_size: Option<usize>,
    #[serde(deserialize_with = "present")]
    bypass: Option<Option<usize>>,
    do_bypass: Option<bool>,
}

impl From<DecodeStageFields> for PartialDecodeStage {
    fn from(fields: DecodeStageFields) -> Self {
        let DecodeStageFields {
            num_filters,
            size,
            filter_size,
            bypass,
            do_bypass,
        } = fields;
        let do_bypass = match bypass {
            Some(None) => do_bypass.or(Some(false)),
            _ => do_bypass,
        };
        Self {
            num_filters,
            size,
            filter_size,
            bypass: bypass.flatten(),
            do_bypass,
        }
    }
}

/// A user supplied, possibly empty, architecture.
#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartialConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter_seed: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encode_depth: Option<usize>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub encode: BTreeMap<usize, PartialEncodeStage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hidden_depth: Option<usize>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub hidden: BTreeMap<usize, PartialHiddenStage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decode_depth: Option<usize>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub decode: BTreeMap<usize, PartialDecodeStage>,
}

impl PartialConfig {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
    pub fn encode_stage(&self, i: usize) -> Option<&PartialEncodeStage> {
        self.encode.get(&i)
    }
    pub fn hidden_stage(&self, i: usize) -> Option<&PartialHiddenStage> {
        self.hidden.get(&i)
    }
    pub fn decode_stage(&self, i: usize) -> Option<&PartialDecodeStage> {
        self.decode.get(&i)
    }
    /// Sets the encoder depth.
    pub fn with_encode_depth(mut self, depth: usize) -> Self {
        self.encode_depth.replace(depth);
        self
    }
    /// Sets the decoder depth.
    pub fn with_decode_depth(mut self, depth: usize) -> Self {
        self.decode_depth.replace(depth);
        self
    }
    /// Sets the hidden depth.
    pub fn with_hidden_depth(mut self, depth: usize) -> Self {
        self.hidden_depth.replace(depth);
        self
    }
    /// Fixes encoder stage `i`.
    pub fn with_encode_stage(mut self, i: usize, stage: PartialEncodeStage) -> Self {
        self.encode.insert(i, stage);
        self
    }
    /// Fixes decoder stage `i`.
    pub fn with_decode_stage(mut self, i: usize, stage: PartialDecodeStage) -> Self {
        self.decode.insert(i, stage);
        self
    }
    pub fn with_filter_seed(mut self, seed: u64) -> Self {
        self.filter_seed.replace(seed);
        self
    }
}

impl From<&ArchConfig> for PartialConfig {
    /// Pins every decision of `config`, including the absence of pooling and bypasses.
    fn from(config: &ArchConfig) -> Self {
        let encode = config
            .encode
            .iter()
            .map(|(&i, stage)| {
                let conv = PartialConv {
                    filter_size: Some(stage.conv.filter_size),
                    num_filters: Some(stage.conv.num_filters),
                    stride: Some(stage.conv.stride),
                };
                let pool = stage.pool.map(|pool| PartialPool {
                    filter_size: Some(pool.filter_size),
                    stride: Some(pool.stride),
                    kind: Some(pool.kind),
                });
                let stage = PartialEncodeStage {
                    conv,
                    do_pool: Some(pool.is_some()),
                    pool,
                };
                (i, stage)
            })
            .collect();
        let hidden = config
            .hidden
            .iter()
            .map(|(&i, stage)| {
                let stage = PartialHiddenStage {
                    num_features: Some(stage.num_features),
                };
                (i, stage)
            })
            .collect();
        let decode = config
            .decode
            .iter()
            .map(|(&i, stage)| {
                let stage = PartialDecodeStage {
                    num_filters: Some(stage.num_filters),
                    size: Some(stage.size),
                    filter_size: stage.filter_size,
                    bypass: stage.bypass,
                    do_bypass: Some(stage.bypass.is_some()),
                };
                (i, stage)
            })
            .collect();
        Self {
            filter_seed: Some(config.filter_seed),
            encode_depth: Some(config.encode_depth),
            encode,
            hidden_depth: Some(config.hidden_depth),
            hidden,
            decode_depth: Some(config.decode_depth),
            decode,
        }
    }
}

impl From<ArchConfig> for PartialConfig {
    fn from(config: ArchConfig) -> Self {
        Self::from(&config)
    }
}
