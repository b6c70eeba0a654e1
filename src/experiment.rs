//! Experiment bookkeeping.
//!
//! An experiment is identified by `(database, collection, experiment_id)`. The first run
//! resolves the architecture and stores it in a [`ConfigRecord`] together with the seed and
//! the user's partial config. A later run that finds saved weights resumes: the stored
//! partial config is resolved again with the stored seed and must reproduce the stored
//! architecture exactly, otherwise the run aborts with [`Error::Integrity`].
//!
//! During training [`Experiment::record_step`] guards the loss, writes a [`StepRecord`]
//! every `test_frequency` steps and checkpoints the weights every
//! `test_frequency * save_multiple` steps.
use crate::{
    checkpoint::CheckpointDir,
    config::{
        document::{postprocess, preprocess},
        ArchConfig, PartialConfig,
    },
    error::Error,
    graph::{self, Assembly, AssemblyOptions, Graph, ParameterSet},
    resolve::{InputSpec, Resolver, Topology},
    result::Result,
    rng,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    fmt::{self, Display},
    path::Path,
};

mod store;
pub use store::{DirectoryStore, ExperimentStore, MemoryStore};

#[cfg(test)]
mod tests;

/// Identity of an experiment.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct ExperimentId {
    pub database: String,
    pub collection: String,
    pub experiment_id: String,
}

impl ExperimentId {
    pub fn new(
        database: impl Into<String>,
        collection: impl Into<String>,
        experiment_id: impl Into<String>,
    ) -> Self {
        Self {
            database: database.into(),
            collection: collection.into(),
            experiment_id: experiment_id.into(),
        }
    }
    /// Checks that every component can name a directory.
    pub fn validate(&self) -> Result<()> {
        for (what, part) in [
            ("database", &self.database),
            ("collection", &self.collection),
            ("experiment_id", &self.experiment_id),
        ] {
            let part = part.as_str();
            if part.is_empty() || part.contains(['/', '\\']) || part == "." || part == ".." {
                return Err(Error::invalid_config(format!(
                    "{what} {part:?} is not a valid name"
                )));
            }
        }
        Ok(())
    }
    /// Checkpoint directory of this experiment under `save_dir`.
    pub fn checkpoint_dir(&self, save_dir: impl AsRef<Path>) -> CheckpointDir {
        CheckpointDir::new(
            save_dir
                .as_ref()
                .join(&self.database)
                .join(&self.collection)
                .join(&self.experiment_id),
        )
    }
}

impl Display for ExperimentId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.database, self.collection, self.experiment_id
        )
    }
}

/// The stored architecture of an experiment.
///
/// Config documents are kept in stored form, with string stage keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigRecord {
    pub seed: u64,
    /// The resolved [`ArchConfig`].
    pub config: Value,
    /// The [`PartialConfig`] it was resolved from.
    pub partial: Value,
    #[serde(default)]
    pub input: InputSpec,
    #[serde(default)]
    pub topology: Topology,
}

/// Progress of one training step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub step: u64,
    pub loss: f64,
    pub learning_rate: f64,
    /// Whether the weights of this step were checkpointed.
    pub saved_filters: bool,
}

/// Staircase exponential decay.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LearningRate {
    pub base: f64,
    pub decay_rate: f64,
    /// Number of examples per decay.
    pub decay_step: u64,
}

impl Default for LearningRate {
    fn default() -> Self {
        Self {
            base: 1.,
            decay_rate: 0.95,
            decay_step: 100_000,
        }
    }
}

impl LearningRate {
    /// `base * decay_rate ^ floor(step * batch_size / decay_step)`
    pub fn at(&self, step: u64, batch_size: usize) -> f64 {
        let examples = step.saturating_mul(batch_size as u64);
        let decays = examples / self.decay_step.max(1);
        self.base * self.decay_rate.powf(decays as f64)
    }
}

/// Aborts training on a diverging loss.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossGuard {
    threshold: f64,
}

impl LossGuard {
    pub const DEFAULT_THRESHOLD: f64 = 100.;
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }
    /// **Errors**
    ///
    /// [`Error::LossThreshold`] if `loss` exceeds the threshold or is not finite.
    pub fn check(&self, step: u64, loss: f64) -> Result<()> {
        if !loss.is_finite() || loss > self.threshold {
            return Err(Error::LossThreshold {
                step,
                loss,
                threshold: self.threshold,
            });
        }
        Ok(())
    }
}

impl Default for LossGuard {
    fn default() -> Self {
        Self::new(Self::DEFAULT_THRESHOLD)
    }
}

/// How often progress is recorded and weights are saved.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunPolicy {
    /// Steps between step records.
    pub test_frequency: u64,
    /// Step records between checkpoints.
    pub save_multiple: u64,
    /// Whether weights are checkpointed and restored.
    pub save: bool,
    /// Number of checkpoints kept on disk, all if `None`.
    pub erase_earlier: Option<usize>,
    pub loss_threshold: f64,
    pub learning_rate: LearningRate,
}

impl Default for RunPolicy {
    fn default() -> Self {
        Self {
            test_frequency: 20,
            save_multiple: 25,
            save: true,
            erase_earlier: None,
            loss_threshold: LossGuard::DEFAULT_THRESHOLD,
            learning_rate: LearningRate::default(),
        }
    }
}

impl RunPolicy {
    pub fn loss_guard(&self) -> LossGuard {
        LossGuard::new(self.loss_threshold)
    }
    pub fn is_record_step(&self, step: u64) -> bool {
        step % self.test_frequency.max(1) == 0
    }
    pub fn is_save_step(&self, step: u64) -> bool {
        let period = self.test_frequency.max(1);
        let period = period.saturating_mul(self.save_multiple.max(1));
        self.save && step % period == 0
    }
}

/// Builder for an [`Experiment`].
#[derive(Debug)]
pub struct ExperimentBuilder {
    id: ExperimentId,
    seed: u64,
    partial: PartialConfig,
    input: InputSpec,
    topology: Topology,
    policy: RunPolicy,
    checkpoints: Option<CheckpointDir>,
}

impl ExperimentBuilder {
    /// Creates a builder for experiment `id`.
    ///
    /// Defaults:
    /// - seed: 0
    /// - partial: empty
    /// - input: [`InputSpec::default()`]
    /// - topology: [`Topology::Bypass`]
    /// - policy: [`RunPolicy::default()`]
    /// - no checkpoints
    pub fn new(id: ExperimentId) -> Self {
        Self {
            id,
            seed: 0,
            partial: PartialConfig::default(),
            input: InputSpec::default(),
            topology: Topology::default(),
            policy: RunPolicy::default(),
            checkpoints: None,
        }
    }
    /// Seed of the resolution random source, ignored on resume.
    pub fn seed(self, seed: u64) -> Self {
        Self { seed, ..self }
    }
    /// The user's partial config, ignored on resume.
    pub fn partial(self, partial: PartialConfig) -> Self {
        Self { partial, ..self }
    }
    pub fn input(self, input: InputSpec) -> Self {
        Self { input, ..self }
    }
    pub fn topology(self, topology: Topology) -> Self {
        Self { topology, ..self }
    }
    pub fn policy(self, policy: RunPolicy) -> Self {
        Self { policy, ..self }
    }
    /// Checkpoints under `save_dir/database/collection/experiment_id`.
    pub fn save_dir(self, save_dir: impl AsRef<Path>) -> Self {
        let checkpoints = Some(self.id.checkpoint_dir(save_dir));
        Self {
            checkpoints,
            ..self
        }
    }
    /// Registers a new experiment or resumes a stored one.
    ///
    /// **Errors**
    ///
    /// - [`Error::Integrity`] if the stored architecture cannot be reproduced.
    /// - Any resolution error of a new experiment.
    pub fn open<S: ExperimentStore>(self, mut store: S) -> Result<Experiment<S>> {
        let Self {
            id,
            seed,
            partial,
            input,
            topology,
            policy,
            checkpoints,
        } = self;
        id.validate()?;
        let resume_step = store.last_saved_step(&id)?;
        let (seed, partial, input, topology, config) = match resume_step {
            Some(step) => {
                let record = store.config_record(&id)?.ok_or_else(|| Error::Integrity {
                    experiment_id: id.to_string(),
                    detail: format!("weights saved at step {step} but no config record"),
                })?;
                let stored_partial: PartialConfig = postprocess(&record.partial)?;
                if !partial.is_empty() && partial != stored_partial {
                    tracing::warn!(experiment = %id, "ignoring partial config on resume");
                }
                if seed != record.seed {
                    tracing::warn!(
                        experiment = %id,
                        seed,
                        stored = record.seed,
                        "ignoring seed on resume"
                    );
                }
                let config = check_integrity(&id, &record, &stored_partial)?;
                tracing::info!(experiment = %id, step, seed = record.seed, "resuming experiment");
                (
                    record.seed,
                    stored_partial,
                    record.input,
                    record.topology,
                    config,
                )
            }
            None => {
                let config = Resolver::new(&partial, rng::seeded(seed))
                    .input(input)
                    .topology(topology)
                    .resolve()?
                    .config;
                if store.config_record(&id)?.is_some() {
                    tracing::warn!(
                        experiment = %id,
                        "replacing config record without saved weights"
                    );
                }
                let record = ConfigRecord {
                    seed,
                    config: preprocess(&config)?,
                    partial: preprocess(&partial)?,
                    input,
                    topology,
                };
                store.put_config_record(&id, &record)?;
                tracing::info!(
                    experiment = %id,
                    seed,
                    filter_seed = config.filter_seed,
                    "registered experiment"
                );
                (seed, partial, input, topology, config)
            }
        };
        Ok(Experiment {
            id,
            store,
            seed,
            partial,
            config,
            input,
            topology,
            policy,
            checkpoints,
            resume_step,
        })
    }
}

/// Resolves the stored partial config with the stored seed and compares the result with the
/// stored architecture.
fn check_integrity(
    id: &ExperimentId,
    record: &ConfigRecord,
    partial: &PartialConfig,
) -> Result<ArchConfig> {
    let integrity = |detail: String| Error::Integrity {
        experiment_id: id.to_string(),
        detail,
    };
    let stored: ArchConfig = postprocess(&record.config)?;
    stored
        .check_stages()
        .map_err(|err| integrity(format!("stored config is malformed: {err}")))?;
    let resolved = Resolver::new(partial, rng::seeded(record.seed))
        .input(record.input)
        .topology(record.topology)
        .resolve()
        .map_err(|err| integrity(format!("stored partial config does not resolve: {err}")))?
        .config;
    if resolved != stored {
        let resolved = preprocess(&resolved)?;
        let stored = preprocess(&stored)?;
        let differing: Vec<&str> = [
            "filter_seed",
            "encode_depth",
            "encode",
            "hidden_depth",
            "hidden",
            "decode_depth",
            "decode",
        ]
        .into_iter()
        .filter(|key| resolved.get(key) != stored.get(key))
        .collect();
        return Err(integrity(format!(
            "resolved config differs from stored config in {differing:?}"
        )));
    }
    Ok(stored)
}

/// A registered experiment.
#[derive(Debug)]
pub struct Experiment<S> {
    id: ExperimentId,
    store: S,
    seed: u64,
    partial: PartialConfig,
    config: ArchConfig,
    input: InputSpec,
    topology: Topology,
    policy: RunPolicy,
    checkpoints: Option<CheckpointDir>,
    resume_step: Option<u64>,
}

impl<S: ExperimentStore> Experiment<S> {
    pub fn id(&self) -> &ExperimentId {
        &self.id
    }
    pub fn seed(&self) -> u64 {
        self.seed
    }
    pub fn partial(&self) -> &PartialConfig {
        &self.partial
    }
    pub fn config(&self) -> &ArchConfig {
        &self.config
    }
    pub fn input(&self) -> &InputSpec {
        &self.input
    }
    pub fn topology(&self) -> Topology {
        self.topology
    }
    pub fn policy(&self) -> &RunPolicy {
        &self.policy
    }
    pub fn store(&self) -> &S {
        &self.store
    }
    pub fn into_store(self) -> S {
        self.store
    }
    /// The latest step with saved weights when the experiment was opened.
    pub fn resume_step(&self) -> Option<u64> {
        self.resume_step
    }
    /// The first step to train.
    ///
    /// Training restarts from 0 when saving is disabled, as there are no weights to restore.
    pub fn start_step(&self) -> u64 {
        match self.resume_step {
            Some(step) if self.policy.save => step + 1,
            _ => 0,
        }
    }
    pub fn learning_rate(&self, step: u64) -> f64 {
        self.policy.learning_rate.at(step, self.input.batch_size)
    }
    pub fn assemble(&self, options: AssemblyOptions) -> Result<Assembly> {
        graph::assemble(&self.config, &self.input, self.topology, options)
    }
    /// Weights to start training from.
    ///
    /// Restored from the resume step when saving is enabled, otherwise freshly materialized
    /// from the filter seed.
    pub fn initial_parameters(&self, graph: &Graph) -> Result<ParameterSet> {
        match (self.resume_step, self.checkpoints.as_ref()) {
            (Some(step), Some(checkpoints)) if self.policy.save => {
                let parameters = checkpoints.load(step, graph)?;
                tracing::info!(experiment = %self.id, step, "restored weights");
                Ok(parameters)
            }
            _ => Ok(graph.materialize(self.config.filter_seed)),
        }
    }
    /// Records the outcome of `step`.
    ///
    /// `parameters` is only called when the weights of this step are saved. Returns the
    /// written record, or `None` for steps that are not recorded.
    ///
    /// **Errors**
    ///
    /// [`Error::LossThreshold`] if the loss diverged. Nothing is recorded in that case.
    pub fn record_step(
        &mut self,
        step: u64,
        loss: f64,
        parameters: impl FnOnce() -> ParameterSet,
    ) -> Result<Option<StepRecord>> {
        self.policy.loss_guard().check(step, loss)?;
        let learning_rate = self.learning_rate(step);
        tracing::debug!(step, loss, learning_rate, "step");
        if !self.policy.is_record_step(step) {
            return Ok(None);
        }
        let mut saved_filters = false;
        if let Some(checkpoints) = self.checkpoints.as_ref() {
            if self.policy.is_save_step(step) {
                checkpoints.save(step, &parameters())?;
                saved_filters = true;
                if let Some(keep) = self.policy.erase_earlier {
                    checkpoints.erase_earlier(keep)?;
                }
            }
        }
        let record = StepRecord {
            step,
            loss,
            learning_rate,
            saved_filters,
        };
        self.store.push_step_record(&self.id, &record)?;
        tracing::info!(
            experiment = %self.id,
            step,
            loss,
            learning_rate,
            saved_filters,
            "recorded step"
        );
        Ok(Some(record))
    }
    /// Every step record written so far.
    pub fn step_records(&self) -> Result<Vec<StepRecord>> {
        self.store.step_records(&self.id)
    }
}
