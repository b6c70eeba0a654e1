use super::*;
use crate::{
    config::{
        document::{postprocess, preprocess},
        PartialConv, PartialEncodeStage,
    },
    rng::seeded,
};
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Draw {
    Uniform(f64),
    Below(usize, usize),
}

/// Replays a fixed sequence of draws, checking each one is requested in order.
#[derive(Debug, Default)]
struct Script(VecDeque<Draw>);

impl Script {
    fn new(draws: impl IntoIterator<Item = Draw>) -> Self {
        Self(draws.into_iter().collect())
    }
    fn is_done(&self) -> bool {
        self.0.is_empty()
    }
}

impl RandomSource for Script {
    fn uniform(&mut self) -> f64 {
        match self.0.pop_front() {
            Some(Draw::Uniform(x)) => x,
            draw => panic!("expected a uniform draw, script has {draw:?}"),
        }
    }
    fn below(&mut self, n: usize) -> usize {
        match self.0.pop_front() {
            Some(Draw::Below(bound, x)) => {
                assert_eq!(bound, n, "draw bound");
                x
            }
            draw => panic!("expected below({n}), script has {draw:?}"),
        }
    }
}

/// Fails on any draw.
struct Exhausted;

impl RandomSource for Exhausted {
    fn uniform(&mut self) -> f64 {
        panic!("uniform drawn from an exhausted source")
    }
    fn below(&mut self, n: usize) -> usize {
        panic!("below({n}) drawn from an exhausted source")
    }
}

fn resolve_seeded(seed: u64, partial: &PartialConfig, topology: Topology) -> Resolution {
    Resolver::new(partial, seeded(seed))
        .topology(topology)
        .resolve()
        .unwrap()
}

#[test]
fn scripted_draw_order() {
    use Draw::*;
    let mut script = Script::new([
        Below(FILTER_SEED_BOUND, 42),
        // encode depth 2
        Below(5, 1),
        // stage 1: filter 7, pooled 2 / avg
        Below(8, 3),
        Uniform(0.5),
        Below(3, 0),
        Below(2, 1),
        // stage 2: filter 5 of [1, 3, 5, 7], not pooled
        Below(4, 2),
        Uniform(0.9),
        // hidden depth 1
        Below(3, 0),
        // decode depth 2
        Below(3, 1),
        // decode stage 1 bypasses, stage 2 does not
        Uniform(0.2),
        Uniform(0.7),
    ]);
    let partial = PartialConfig::new();
    let resolution = Resolver::new(&partial, &mut script).resolve().unwrap();
    assert!(script.is_done());
    let config = resolution.config;
    assert_eq!(config.filter_seed, 42);
    assert_eq!(config.encode_depth, 2);
    assert_eq!(
        config.encode[&1],
        EncodeStage {
            conv: ConvSpec {
                filter_size: 7,
                num_filters: 48,
                stride: 2
            },
            pool: Some(PoolSpec {
                filter_size: 2,
                stride: 2,
                kind: PoolKind::Avg
            }),
        }
    );
    assert_eq!(
        config.encode[&2],
        EncodeStage {
            conv: ConvSpec {
                filter_size: 5,
                num_filters: 96,
                stride: 1
            },
            pool: None,
        }
    );
    assert_eq!(resolution.encode_sizes, [256, 64, 64]);
    assert_eq!(resolution.encode_channels, [6, 48, 96]);
    assert_eq!(config.hidden_depth, 1);
    assert_eq!(config.hidden[&1].num_features, DEFAULT_HIDDEN_FEATURES);
    assert_eq!(config.decode_depth, 2);
    assert_eq!(
        config.decode[&0],
        DecodeStage {
            num_filters: 32,
            size: 64,
            filter_size: None,
            bypass: None
        }
    );
    assert_eq!(
        config.decode[&1],
        DecodeStage {
            num_filters: 32,
            size: 128,
            filter_size: Some(7),
            bypass: Some(1)
        }
    );
    assert_eq!(
        config.decode[&2],
        DecodeStage {
            num_filters: 3,
            size: 256,
            filter_size: Some(7),
            bypass: None
        }
    );
}

#[test]
fn same_seed_same_config() {
    let partial = PartialConfig::new();
    for seed in 0..64 {
        for topology in [Topology::Bypass, Topology::Coupled] {
            let a = resolve_seeded(seed, &partial, topology).config;
            let b = resolve_seeded(seed, &partial, topology).config;
            assert_eq!(
                serde_json::to_vec(&a).unwrap(),
                serde_json::to_vec(&b).unwrap()
            );
        }
    }
}

#[test]
fn resolved_config_is_idempotent() {
    let partial = PartialConfig::new();
    for seed in 0..128 {
        for topology in [Topology::Bypass, Topology::Coupled] {
            let config = resolve_seeded(seed, &partial, topology).config;
            let pinned = PartialConfig::from(&config);
            let replayed = Resolver::new(&pinned, Exhausted)
                .topology(topology)
                .resolve()
                .unwrap()
                .config;
            assert_eq!(replayed, config, "seed {seed}");
        }
    }
}

#[test]
fn stored_config_is_idempotent() {
    let partial = PartialConfig::new();
    for seed in 0..128 {
        for topology in [Topology::Bypass, Topology::Coupled] {
            let config = resolve_seeded(seed, &partial, topology).config;
            let doc = preprocess(&config).unwrap();
            let stored: PartialConfig = postprocess(&doc).unwrap();
            let replayed = Resolver::new(&stored, Exhausted)
                .topology(topology)
                .resolve()
                .unwrap()
                .config;
            assert_eq!(replayed, config, "seed {seed}");
        }
    }
}

#[test]
fn encode_filter_sizes_do_not_grow() {
    let partial = PartialConfig::new();
    for seed in 0..128 {
        let config = resolve_seeded(seed, &partial, Topology::Bypass).config;
        let sizes: Vec<_> = config.encode.values().map(|s| s.conv.filter_size).collect();
        assert!(sizes.windows(2).all(|w| w[1] <= w[0]), "{sizes:?}");
    }
}

#[test]
fn terminal_stage_matches_target() {
    let partial = PartialConfig::new();
    let target = InputSpec::default().target();
    for seed in 0..128 {
        for topology in [Topology::Bypass, Topology::Coupled] {
            let config = resolve_seeded(seed, &partial, topology).config;
            let last = config.terminal_stage().unwrap();
            assert_eq!(last.num_filters, target.channels);
            assert_eq!(last.size, target.size);
            config.check_stages().unwrap();
        }
    }
}

#[test]
fn partial_stage_is_respected() {
    let stage = PartialEncodeStage {
        conv: PartialConv {
            filter_size: Some(5),
            num_filters: Some(48),
            stride: Some(2),
        },
        ..Default::default()
    };
    let partial = PartialConfig::new()
        .with_encode_depth(2)
        .with_encode_stage(1, stage);
    for seed in 0..64 {
        let config = resolve_seeded(seed, &partial, Topology::Bypass).config;
        assert_eq!(config.encode_depth, 2);
        assert_eq!(
            config.encode[&1].conv,
            ConvSpec {
                filter_size: 5,
                num_filters: 48,
                stride: 2
            }
        );
        assert!([1, 3, 5].contains(&config.encode[&2].conv.filter_size));
        assert!(DECODE_DEPTHS.contains(&config.decode_depth));
        assert_eq!(config.terminal_stage().unwrap().num_filters, 3);
    }
}

#[test]
fn depth_rises_to_explicit_stage() {
    let partial = PartialConfig::new().with_encode_stage(4, PartialEncodeStage::default());
    for seed in 0..32 {
        let config = resolve_seeded(seed, &partial, Topology::Bypass).config;
        assert!(config.encode_depth >= 4);
    }
}

#[test]
fn single_stage_encoder_strides_by_three() {
    let partial = PartialConfig::new().with_encode_depth(1);
    let resolution = resolve_seeded(0, &partial, Topology::Bypass);
    assert_eq!(resolution.config.encode[&1].conv.stride, 3);
    let side = if resolution.config.encode[&1].pool.is_some() {
        43
    } else {
        86
    };
    assert_eq!(resolution.encode_sizes[1], side);
}

#[test]
fn do_pool_false_skips_coin() {
    let stage = PartialEncodeStage {
        conv: PartialConv {
            filter_size: Some(3),
            ..Default::default()
        },
        do_pool: Some(false),
        ..Default::default()
    };
    let partial = PartialConfig::new()
        .with_filter_seed(1)
        .with_encode_depth(1)
        .with_encode_stage(1, stage)
        .with_hidden_depth(1)
        .with_decode_depth(1)
        .with_decode_stage(
            1,
            PartialDecodeStage {
                do_bypass: Some(false),
                ..Default::default()
            },
        );
    let mut script = Script::default();
    let config = Resolver::new(&partial, &mut script).resolve().unwrap().config;
    assert!(config.encode[&1].pool.is_none());
    assert!(config.decode[&1].bypass.is_none());
}

#[test]
fn nearest_size_picks_first_minimum() {
    assert_eq!(nearest_size(&[256, 128, 64, 32, 16], 40), Some(3));
    assert_eq!(nearest_size(&[36, 44], 40), Some(0));
    assert_eq!(nearest_size(&[64, 36, 44], 40), Some(1));
    assert_eq!(nearest_size(&[], 40), None);
}

#[test]
fn schedule_is_log_linear() {
    assert_eq!(decode_schedule(16, 256, 3), [16, 40, 102, 256]);
    assert_eq!(decode_schedule(64, 256, 2), [64, 128, 256]);
    assert_eq!(decode_schedule(8, 256, 1), [8, 256]);
    assert_eq!(decode_schedule(256, 256, 2), [256, 256, 256]);
    assert_eq!(decode_schedule(16, 256, 0), [256]);
}

#[test]
fn explicit_terminal_channels_must_match() {
    let partial = PartialConfig::new().with_decode_depth(1).with_decode_stage(
        1,
        PartialDecodeStage {
            num_filters: Some(4),
            ..Default::default()
        },
    );
    let err = Resolver::new(&partial, seeded(0)).resolve().unwrap_err();
    assert!(matches!(
        err,
        Error::TerminalShape {
            stage: 1,
            expected: 3,
            found: 4,
            ..
        }
    ));
    assert!(err.is_fatal());
}

#[test]
fn explicit_terminal_size_must_match() {
    let partial = PartialConfig::new().with_decode_depth(2).with_decode_stage(
        2,
        PartialDecodeStage {
            size: Some(128),
            ..Default::default()
        },
    );
    let err = Resolver::new(&partial, seeded(0)).resolve().unwrap_err();
    assert!(matches!(
        err,
        Error::TerminalShape {
            stage: 2,
            expected: 256,
            found: 128,
            ..
        }
    ));
}

#[test]
fn channel_table_runs_out_after_stage_five() {
    let partial = PartialConfig::new().with_encode_depth(6);
    let err = Resolver::new(&partial, seeded(0)).resolve().unwrap_err();
    assert!(matches!(err, Error::ChannelTableExhausted { stage: 6, len: 6 }));
}

#[test]
fn explicit_depth_below_stage_is_rejected() {
    let partial = PartialConfig::new()
        .with_encode_depth(1)
        .with_encode_stage(2, PartialEncodeStage::default());
    assert!(matches!(
        Resolver::new(&partial, seeded(0)).resolve(),
        Err(Error::InvalidConfig(_))
    ));
}

#[test]
fn bypass_beyond_encoder_is_rejected() {
    let partial = PartialConfig::new()
        .with_encode_depth(2)
        .with_decode_depth(1)
        .with_decode_stage(
            1,
            PartialDecodeStage {
                bypass: Some(3),
                ..Default::default()
            },
        );
    assert!(matches!(
        Resolver::new(&partial, seeded(0)).resolve(),
        Err(Error::InvalidConfig(_))
    ));
}

#[test]
fn coupled_decoder_mirrors_encoder() {
    for seed in 0..32 {
        let resolution = resolve_seeded(seed, &PartialConfig::new(), Topology::Coupled);
        let config = &resolution.config;
        assert_eq!(config.decode_depth, config.encode_depth);
        for (i, stage) in config.decode.iter() {
            assert_eq!(stage.size, resolution.encode_sizes[config.encode_depth - i]);
            assert!(stage.bypass.is_none());
        }
    }
}

#[test]
fn zero_decode_depth_reshapes_to_target() {
    let partial = PartialConfig::new().with_decode_depth(0);
    let config = Resolver::new(&partial, seeded(5)).resolve().unwrap().config;
    assert_eq!(
        config.decode[&0],
        DecodeStage {
            num_filters: 3,
            size: 256,
            filter_size: None,
            bypass: None
        }
    );
}

#[test]
fn reshape_stage_rejects_convolution_settings() {
    let rejected = [
        PartialDecodeStage {
            bypass: Some(0),
            ..Default::default()
        },
        PartialDecodeStage {
            do_bypass: Some(true),
            ..Default::default()
        },
        PartialDecodeStage {
            filter_size: Some(3),
            ..Default::default()
        },
    ];
    for topology in [Topology::Bypass, Topology::Coupled] {
        for stage in rejected {
            let partial = PartialConfig::new().with_decode_stage(0, stage);
            assert!(
                matches!(
                    Resolver::new(&partial, seeded(0)).topology(topology).resolve(),
                    Err(Error::InvalidConfig(_))
                ),
                "{topology:?} {stage:?}"
            );
        }
        let partial = PartialConfig::new().with_decode_stage(
            0,
            PartialDecodeStage {
                do_bypass: Some(false),
                ..Default::default()
            },
        );
        let config = resolve_seeded(0, &partial, topology).config;
        assert!(config.decode[&0].bypass.is_none());
    }
}
