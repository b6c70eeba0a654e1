use super::*;
use crate::config::PartialEncodeStage;
use approx::assert_relative_eq;

fn id() -> ExperimentId {
    ExperimentId::new("future_pred", "asymmetric", "exp1")
}

fn small_input() -> InputSpec {
    InputSpec {
        image_size: 16,
        batch_size: 2,
        ..InputSpec::default()
    }
}

fn builder() -> ExperimentBuilder {
    ExperimentBuilder::new(id()).seed(3).input(small_input())
}

#[test]
fn learning_rate_staircase() {
    let lr = LearningRate {
        base: 1.,
        decay_rate: 0.5,
        decay_step: 1000,
    };
    assert_relative_eq!(lr.at(0, 128), 1.);
    assert_relative_eq!(lr.at(7, 128), 1.);
    assert_relative_eq!(lr.at(8, 128), 0.5);
    assert_relative_eq!(lr.at(16, 128), 0.25);
}

#[test]
fn loss_guard() {
    let guard = LossGuard::default();
    assert!(guard.check(0, 99.).is_ok());
    let err = guard.check(5, 100.5).unwrap_err();
    assert!(matches!(err, Error::LossThreshold { step: 5, .. }));
    assert!(err.is_fatal());
    assert!(guard.check(6, f64::NAN).is_err());
    assert!(guard.check(6, f64::INFINITY).is_err());
}

#[test]
fn policy_periods() {
    let policy = RunPolicy::default();
    assert!(policy.is_record_step(0));
    assert!(policy.is_record_step(40));
    assert!(!policy.is_record_step(41));
    assert!(policy.is_save_step(500));
    assert!(!policy.is_save_step(480));
    let policy = RunPolicy {
        save: false,
        ..policy
    };
    assert!(!policy.is_save_step(500));
}

#[test]
fn invalid_id_is_rejected() {
    let id = ExperimentId::new("db", "a/b", "exp");
    assert!(matches!(
        ExperimentBuilder::new(id).open(MemoryStore::new()),
        Err(Error::InvalidConfig(_))
    ));
}

#[test]
fn register_stores_config_record() {
    let partial = PartialConfig::new().with_encode_depth(2);
    let experiment = builder()
        .partial(partial.clone())
        .open(MemoryStore::new())
        .unwrap();
    assert_eq!(experiment.resume_step(), None);
    assert_eq!(experiment.start_step(), 0);
    assert_eq!(experiment.config().encode_depth, 2);
    let record = experiment.store().config_record(&id()).unwrap().unwrap();
    assert_eq!(record.seed, 3);
    assert_eq!(record.input, small_input());
    assert_eq!(postprocess::<PartialConfig>(&record.partial).unwrap(), partial);
    assert_eq!(
        &postprocess::<ArchConfig>(&record.config).unwrap(),
        experiment.config()
    );
    assert!(record.config["encode"].get("1").is_some());
}

#[test]
fn record_step_policy() {
    let dir = tempfile::tempdir().unwrap();
    let policy = RunPolicy {
        test_frequency: 2,
        save_multiple: 2,
        erase_earlier: Some(1),
        ..RunPolicy::default()
    };
    let mut experiment = builder()
        .policy(policy)
        .save_dir(dir.path())
        .open(MemoryStore::new())
        .unwrap();
    let graph = experiment.assemble(AssemblyOptions::default()).unwrap().graph;
    let filter_seed = experiment.config().filter_seed;
    let mut materialized = 0;
    for step in 0..9 {
        let record = experiment
            .record_step(step, 1. / (step + 1) as f64, || {
                materialized += 1;
                graph.materialize(filter_seed)
            })
            .unwrap();
        assert_eq!(record.is_some(), step % 2 == 0, "step {step}");
    }
    assert_eq!(materialized, 3);
    let records = experiment.step_records().unwrap();
    let steps: Vec<_> = records.iter().map(|r| r.step).collect();
    assert_eq!(steps, [0, 2, 4, 6, 8]);
    let saved: Vec<_> = records
        .iter()
        .filter(|r| r.saved_filters)
        .map(|r| r.step)
        .collect();
    assert_eq!(saved, [0, 4, 8]);
    let checkpoints = id().checkpoint_dir(dir.path());
    assert_eq!(checkpoints.saved_steps().unwrap(), [8]);
}

#[test]
fn diverged_loss_is_not_recorded() {
    let mut experiment = builder().open(MemoryStore::new()).unwrap();
    let err = experiment
        .record_step(0, 1e3, ParameterSet::new)
        .unwrap_err();
    assert!(matches!(err, Error::LossThreshold { .. }));
    assert!(experiment.step_records().unwrap().is_empty());
}

#[test]
fn resume_restores_weights() {
    let dir = tempfile::tempdir().unwrap();
    let store_dir = dir.path().join("store");
    let save_dir = dir.path().join("weights");
    let policy = RunPolicy {
        test_frequency: 1,
        save_multiple: 1,
        ..RunPolicy::default()
    };
    let saved = {
        let mut experiment = builder()
            .policy(policy)
            .save_dir(&save_dir)
            .open(DirectoryStore::new(&store_dir))
            .unwrap();
        let graph = experiment.assemble(AssemblyOptions::default()).unwrap().graph;
        let parameters = experiment.initial_parameters(&graph).unwrap();
        for step in 0..3 {
            experiment
                .record_step(step, 0.5, || parameters.clone())
                .unwrap();
        }
        parameters
    };
    // a different seed and partial are ignored on resume
    let experiment = ExperimentBuilder::new(id())
        .seed(99)
        .partial(PartialConfig::new().with_encode_depth(5))
        .policy(policy)
        .save_dir(&save_dir)
        .open(DirectoryStore::new(&store_dir))
        .unwrap();
    assert_eq!(experiment.resume_step(), Some(2));
    assert_eq!(experiment.start_step(), 3);
    assert_eq!(experiment.seed(), 3);
    assert_eq!(experiment.input(), &small_input());
    let graph = experiment.assemble(AssemblyOptions::default()).unwrap().graph;
    assert_eq!(experiment.initial_parameters(&graph).unwrap(), saved);
}

#[test]
fn resume_without_saving_starts_over() {
    let mut store = MemoryStore::new();
    let policy = RunPolicy {
        test_frequency: 1,
        save_multiple: 1,
        ..RunPolicy::default()
    };
    let config = builder().open(&mut store).unwrap().config().clone();
    store
        .push_step_record(
            &id(),
            &StepRecord {
                step: 10,
                loss: 0.1,
                learning_rate: 1.,
                saved_filters: true,
            },
        )
        .unwrap();
    let experiment = builder()
        .policy(RunPolicy {
            save: false,
            ..policy
        })
        .open(&mut store)
        .unwrap();
    assert_eq!(experiment.resume_step(), Some(10));
    assert_eq!(experiment.start_step(), 0);
    assert_eq!(experiment.config(), &config);
}

#[test]
fn tampered_config_fails_integrity() {
    let mut store = MemoryStore::new();
    let partial = PartialConfig::new().with_encode_stage(1, PartialEncodeStage::default());
    builder().partial(partial).open(&mut store).unwrap();
    let mut record = store.config_record(&id()).unwrap().unwrap();
    record.config["filter_seed"] = serde_json::json!(12345);
    store.put_config_record(&id(), &record).unwrap();
    store
        .push_step_record(
            &id(),
            &StepRecord {
                step: 500,
                loss: 0.2,
                learning_rate: 1.,
                saved_filters: true,
            },
        )
        .unwrap();
    let err = builder().open(&mut store).unwrap_err();
    match &err {
        Error::Integrity {
            experiment_id,
            detail,
        } => {
            assert_eq!(experiment_id, "future_pred/asymmetric/exp1");
            assert!(detail.contains("filter_seed"), "{detail}");
        }
        err => panic!("{err}"),
    }
    assert!(err.is_fatal());
}

#[test]
fn saved_weights_without_config_fail_integrity() {
    let mut store = MemoryStore::new();
    store
        .push_step_record(
            &id(),
            &StepRecord {
                step: 0,
                loss: 0.,
                learning_rate: 1.,
                saved_filters: true,
            },
        )
        .unwrap();
    assert!(matches!(builder().open(&mut store), Err(Error::Integrity { .. })));
}
