use anyhow::Result;
use netgen::{
    config::PartialConfig,
    experiment::{DirectoryStore, ExperimentBuilder, ExperimentId, ExperimentStore, RunPolicy},
    graph::AssemblyOptions,
    resolve::{InputSpec, Topology},
    Error,
};

fn input() -> InputSpec {
    InputSpec {
        image_size: 16,
        batch_size: 2,
        ..InputSpec::default()
    }
}

#[test]
fn train_resume_train() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store_dir = dir.path().join("db");
    let save_dir = dir.path().join("weights");
    let id = ExperimentId::new("future_pred", "down3", "run7");
    let policy = RunPolicy {
        test_frequency: 5,
        save_multiple: 2,
        erase_earlier: Some(2),
        ..RunPolicy::default()
    };
    let open = |partial: PartialConfig| {
        ExperimentBuilder::new(id.clone())
            .seed(17)
            .partial(partial)
            .input(input())
            .topology(Topology::Coupled)
            .policy(policy)
            .save_dir(&save_dir)
            .open(DirectoryStore::new(&store_dir))
    };

    let mut experiment = open(PartialConfig::new().with_hidden_depth(1))?;
    assert_eq!(experiment.start_step(), 0);
    let graph = experiment.assemble(AssemblyOptions::default())?.graph;
    let mut last = experiment.initial_parameters(&graph)?;
    assert_eq!(last, graph.materialize(experiment.config().filter_seed));
    for step in experiment.start_step()..35 {
        // the weights drift so every checkpoint differs
        let parameters = graph.materialize(step);
        last = parameters.clone();
        experiment.record_step(step, 1., move || parameters)?;
    }
    let config = experiment.config().clone();
    drop(experiment);

    let checkpoints = id.checkpoint_dir(&save_dir);
    assert_eq!(checkpoints.saved_steps()?, [20, 30]);

    let experiment = open(PartialConfig::new())?;
    assert_eq!(experiment.config(), &config);
    assert_eq!(experiment.resume_step(), Some(30));
    assert_eq!(experiment.start_step(), 31);
    let graph = experiment.assemble(AssemblyOptions::default())?.graph;
    assert_eq!(experiment.initial_parameters(&graph)?, graph.materialize(30));
    assert_ne!(experiment.initial_parameters(&graph)?, last);

    let records = DirectoryStore::new(&store_dir).step_records(&id)?;
    let steps: Vec<_> = records.iter().map(|r| r.step).collect();
    assert_eq!(steps, [0, 5, 10, 15, 20, 25, 30]);
    Ok(())
}

#[test]
fn changed_input_fails_integrity() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let id = ExperimentId::new("future_pred", "asymmetric", "run1");
    let mut store = DirectoryStore::new(dir.path());
    let mut experiment = ExperimentBuilder::new(id.clone())
        .seed(2)
        .input(input())
        .policy(RunPolicy {
            test_frequency: 1,
            save_multiple: 1,
            save: false,
            ..RunPolicy::default()
        })
        .open(&mut store)?;
    experiment.record_step(0, 0.5, Default::default)?;
    drop(experiment);

    let mut record = store.config_record(&id)?.unwrap();
    record.input.image_size = 32;
    store.put_config_record(&id, &record)?;
    let mut steps = store.step_records(&id)?;
    steps[0].saved_filters = true;
    store.push_step_record(&id, &steps[0])?;

    let err = ExperimentBuilder::new(id).open(&mut store).unwrap_err();
    assert!(matches!(err, Error::Integrity { .. }), "{err}");
    Ok(())
}
