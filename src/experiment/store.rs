use super::{ConfigRecord, ExperimentId, StepRecord};
use crate::result::Result;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

/// Persistent records of experiments.
pub trait ExperimentStore {
    fn config_record(&self, id: &ExperimentId) -> Result<Option<ConfigRecord>>;
    /// Writes the config record of `id`, replacing any previous one.
    fn put_config_record(&mut self, id: &ExperimentId, record: &ConfigRecord) -> Result<()>;
    /// Step records of `id` in insertion order.
    fn step_records(&self, id: &ExperimentId) -> Result<Vec<StepRecord>>;
    fn push_step_record(&mut self, id: &ExperimentId, record: &StepRecord) -> Result<()>;
    /// The largest step whose weights were saved.
    fn last_saved_step(&self, id: &ExperimentId) -> Result<Option<u64>> {
        Ok(self
            .step_records(id)?
            .iter()
            .filter(|record| record.saved_filters)
            .map(|record| record.step)
            .max())
    }
}

impl<S: ExperimentStore + ?Sized> ExperimentStore for &mut S {
    fn config_record(&self, id: &ExperimentId) -> Result<Option<ConfigRecord>> {
        (**self).config_record(id)
    }
    fn put_config_record(&mut self, id: &ExperimentId, record: &ConfigRecord) -> Result<()> {
        (**self).put_config_record(id, record)
    }
    fn step_records(&self, id: &ExperimentId) -> Result<Vec<StepRecord>> {
        (**self).step_records(id)
    }
    fn push_step_record(&mut self, id: &ExperimentId, record: &StepRecord) -> Result<()> {
        (**self).push_step_record(id, record)
    }
}

/// Everything stored for one experiment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct ExperimentDocument {
    #[serde(default)]
    config: Option<ConfigRecord>,
    #[serde(default)]
    steps: Vec<StepRecord>,
}

/// An in memory store.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    experiments: HashMap<ExperimentId, ExperimentDocument>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ExperimentStore for MemoryStore {
    fn config_record(&self, id: &ExperimentId) -> Result<Option<ConfigRecord>> {
        Ok(self.experiments.get(id).and_then(|doc| doc.config.clone()))
    }
    fn put_config_record(&mut self, id: &ExperimentId, record: &ConfigRecord) -> Result<()> {
        self.experiments.entry(id.clone()).or_default().config = Some(record.clone());
        Ok(())
    }
    fn step_records(&self, id: &ExperimentId) -> Result<Vec<StepRecord>> {
        Ok(self
            .experiments
            .get(id)
            .map(|doc| doc.steps.clone())
            .unwrap_or_default())
    }
    fn push_step_record(&mut self, id: &ExperimentId, record: &StepRecord) -> Result<()> {
        self.experiments
            .entry(id.clone())
            .or_default()
            .steps
            .push(*record);
        Ok(())
    }
}

/// A store keeping one JSON document per experiment at
/// `<root>/<database>/<collection>/<experiment_id>.json`.
///
/// Documents are replaced atomically by writing a temporary file and renaming it.
#[derive(Debug, Clone)]
pub struct DirectoryStore {
    root: PathBuf,
}

impl DirectoryStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
    pub fn root(&self) -> &Path {
        &self.root
    }
    fn path(&self, id: &ExperimentId) -> Result<PathBuf> {
        id.validate()?;
        Ok(self
            .root
            .join(&id.database)
            .join(&id.collection)
            .join(format!("{}.json", id.experiment_id)))
    }
    fn read(&self, id: &ExperimentId) -> Result<ExperimentDocument> {
        let path = self.path(id)?;
        if !path.exists() {
            return Ok(ExperimentDocument::default());
        }
        let content = fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&content)?)
    }
    fn write(&self, id: &ExperimentId, doc: &ExperimentDocument) -> Result<()> {
        let path = self.path(id)?;
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let content = serde_json::to_string_pretty(doc)?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, content)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}

impl ExperimentStore for DirectoryStore {
    fn config_record(&self, id: &ExperimentId) -> Result<Option<ConfigRecord>> {
        Ok(self.read(id)?.config)
    }
    fn put_config_record(&mut self, id: &ExperimentId, record: &ConfigRecord) -> Result<()> {
        let mut doc = self.read(id)?;
        doc.config = Some(record.clone());
        self.write(id, &doc)
    }
    fn step_records(&self, id: &ExperimentId) -> Result<Vec<StepRecord>> {
        Ok(self.read(id)?.steps)
    }
    fn push_step_record(&mut self, id: &ExperimentId, record: &StepRecord) -> Result<()> {
        let mut doc = self.read(id)?;
        doc.steps.push(*record);
        self.write(id, &doc)
    }
}
