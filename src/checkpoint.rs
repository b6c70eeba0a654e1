//! Weight checkpoints.
//!
//! Every trainable tensor is written to its own flat file of little endian `f32`, at
//! `<root>/<name>/<step>.f32` where `name` is the parameter name with `/` replaced by `__`.
//! Shapes are not stored: a checkpoint is restored against the [`Graph`] that declares the
//! parameters, and every file must hold exactly the number of elements its spec requires.
//!
//! Saving:
//!```no_run
//! # use netgen::{checkpoint::CheckpointDir, graph::Graph};
//! # fn main() -> netgen::result::Result<()> {
//! # let graph = Graph::new();
//! let dir = CheckpointDir::new("weights");
//! dir.save(500, &graph.materialize(7))?;
//! # Ok(())
//! # }
//!```
//! Loading:
//!```no_run
//! # use netgen::{checkpoint::CheckpointDir, graph::Graph};
//! # fn main() -> netgen::result::Result<()> {
//! # let graph = Graph::new();
//! let parameters = CheckpointDir::new("weights").load(500, &graph)?;
//! # Ok(())
//! # }
//!```
use crate::{
    error::Error,
    graph::{Graph, ParameterSet},
    result::Result,
};
use ndarray as nd;
use std::{
    collections::BTreeSet,
    fs::{self, File},
    io::{Read, Write},
    path::{Path, PathBuf},
};

const EXTENSION: &str = "f32";

/// Replaces path separators in a tensor name.
pub fn sanitize_name(name: &str) -> String {
    name.replace('/', "__")
}

/// A directory of per tensor checkpoint files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointDir {
    root: PathBuf,
}

impl CheckpointDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
    pub fn root(&self) -> &Path {
        &self.root
    }
    /// The file holding tensor `name` at `step`.
    pub fn path(&self, name: &str, step: u64) -> PathBuf {
        self.root
            .join(sanitize_name(name))
            .join(format!("{step}.{EXTENSION}"))
    }
    /// Writes every parameter at `step`.
    pub fn save(&self, step: u64, parameters: &ParameterSet) -> Result<()> {
        for (name, array) in parameters.iter() {
            let path = self.path(name, step);
            if let Some(dir) = path.parent() {
                fs::create_dir_all(dir)?;
            }
            let data: Vec<u32> = array.iter().map(|x| x.to_bits().to_le()).collect();
            let tmp = path.with_extension("tmp");
            let mut file = File::create(&tmp)?;
            file.write_all(bytemuck::cast_slice(&data))?;
            file.sync_all()?;
            fs::rename(&tmp, &path)?;
        }
        tracing::info!(step, tensors = parameters.len(), root = ?self.root, "saved checkpoint");
        Ok(())
    }
    /// Reads every parameter of `graph` at `step`.
    ///
    /// **Errors**
    ///
    /// [`Error::Checkpoint`] if a file is missing or holds the wrong number of elements.
    pub fn load(&self, step: u64, graph: &Graph) -> Result<ParameterSet> {
        let mut parameters = ParameterSet::new();
        for spec in graph.parameters() {
            let path = self.path(&spec.name, step);
            let mut file = File::open(&path).map_err(|err| Error::Checkpoint {
                path: path.clone(),
                detail: err.to_string(),
            })?;
            let bytes = file.metadata()?.len();
            let expected = (spec.len() * std::mem::size_of::<f32>()) as u64;
            if bytes != expected {
                return Err(Error::Checkpoint {
                    path,
                    detail: format!(
                        "holds {bytes} bytes, {} {:?} requires {expected}",
                        spec.name, spec.shape
                    ),
                });
            }
            let mut data = vec![0u32; spec.len()];
            file.read_exact(bytemuck::cast_slice_mut(&mut data))?;
            let data: Vec<f32> = data
                .into_iter()
                .map(|x| f32::from_bits(u32::from_le(x)))
                .collect();
            let shape = nd::IxDyn(&spec.shape);
            let array = nd::ArrayD::from_shape_vec(shape, data).map_err(|err| Error::Checkpoint {
                path: path.clone(),
                detail: err.to_string(),
            })?;
            parameters.insert(spec.name.clone(), array);
        }
        tracing::info!(step, tensors = parameters.len(), root = ?self.root, "loaded checkpoint");
        Ok(parameters)
    }
    /// Steps with at least one saved tensor, ascending.
    pub fn saved_steps(&self) -> Result<Vec<u64>> {
        let mut steps = BTreeSet::new();
        self.for_each_file(|_, step| {
            steps.insert(step);
            Ok(())
        })?;
        Ok(steps.into_iter().collect())
    }
    /// Deletes all but the newest `keep` steps, returning the deleted steps.
    pub fn erase_earlier(&self, keep: usize) -> Result<Vec<u64>> {
        let steps = self.saved_steps()?;
        let erased: BTreeSet<u64> = steps
            .iter()
            .copied()
            .take(steps.len().saturating_sub(keep))
            .collect();
        if erased.is_empty() {
            return Ok(Vec::new());
        }
        self.for_each_file(|path, step| {
            if erased.contains(&step) {
                fs::remove_file(path)?;
            }
            Ok(())
        })?;
        tracing::info!(?erased, keep, "erased earlier checkpoints");
        Ok(erased.into_iter().collect())
    }
    fn for_each_file(&self, mut f: impl FnMut(&Path, u64) -> Result<()>) -> Result<()> {
        if !self.root.exists() {
            return Ok(());
        }
        for tensor_dir in fs::read_dir(&self.root)? {
            let tensor_dir = tensor_dir?.path();
            if !tensor_dir.is_dir() {
                continue;
            }
            for entry in fs::read_dir(&tensor_dir)? {
                let path = entry?.path();
                if path.extension().and_then(|ext| ext.to_str()) != Some(EXTENSION) {
                    continue;
                }
                let step = path
                    .file_stem()
                    .and_then(|stem| stem.to_str())
                    .and_then(|stem| stem.parse().ok());
                if let Some(step) = step {
                    f(&path, step)?;
                }
            }
        }
        Ok(())
    }
}
