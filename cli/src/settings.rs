//! Run settings.
//!
//! Settings are layered with `figment`, later layers winning:
//! 1. Built-in defaults
//! 2. A TOML settings file (`--settings`)
//! 3. Environment variables prefixed with `NETGEN_`, nested keys separated by `__`
//!    (ie `NETGEN_POLICY__TEST_FREQUENCY=10`)
//! 4. Command line flags
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use netgen::{config::PartialConfig, experiment::RunPolicy, resolve::InputSpec, resolve::Topology};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const ENV_PREFIX: &str = "NETGEN_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunSettings {
    pub database: String,
    pub collection: String,
    pub experiment_id: Option<String>,
    /// Seed of the resolution random source.
    pub seed: u64,
    /// JSON file holding a partial architecture.
    pub config_file: Option<PathBuf>,
    pub topology: Topology,
    /// Root of the experiment record store.
    pub store_dir: PathBuf,
    /// Root of the weight checkpoints.
    pub save_dir: PathBuf,
    pub loss_multiple: f64,
    pub input: InputSpec,
    pub policy: RunPolicy,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            database: "future_pred".into(),
            collection: "models".into(),
            experiment_id: None,
            seed: 0,
            config_file: None,
            topology: Topology::default(),
            store_dir: PathBuf::from("experiments"),
            save_dir: PathBuf::from("."),
            loss_multiple: 1.,
            input: InputSpec::default(),
            policy: RunPolicy::default(),
        }
    }
}

/// Settings given on the command line, absent fields leave lower layers untouched.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Overrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub experiment_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_file: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topology: Option<Topology>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub save_dir: Option<PathBuf>,
}

/// Loads settings from every layer.
pub fn load_settings(
    file: Option<&Path>,
    overrides: &Overrides,
) -> Result<RunSettings, Box<figment::Error>> {
    let mut figment = Figment::from(Serialized::defaults(RunSettings::default()));
    if let Some(file) = file {
        figment = figment.merge(Toml::file(file));
    }
    figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));
    figment = figment.merge(Serialized::defaults(overrides));
    figment.extract().map_err(Box::new)
}

impl RunSettings {
    /// The partial architecture, empty without a config file.
    pub fn partial(&self) -> anyhow::Result<PartialConfig> {
        use anyhow::Context;
        let Some(path) = self.config_file.as_ref() else {
            return Ok(PartialConfig::new());
        };
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {path:?}"))?;
        let doc: serde_json::Value = serde_json::from_str(&content)
            .with_context(|| format!("parsing config file {path:?}"))?;
        netgen::config::document::postprocess(&doc)
            .with_context(|| format!("invalid partial config in {path:?}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let settings = load_settings(None, &Overrides::default()).unwrap();
        assert_eq!(settings.input, InputSpec::default());
        assert_eq!(settings.policy.test_frequency, 20);
        assert_eq!(settings.policy.save_multiple, 25);
    }

    #[test]
    fn file_then_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("netgen.toml");
        std::fs::write(
            &path,
            r#"
            seed = 4
            topology = "coupled"
            collection = "down3"

            [input]
            image_size = 64

            [policy]
            erase_earlier = 2
            "#,
        )
        .unwrap();
        let overrides = Overrides {
            seed: Some(9),
            ..Overrides::default()
        };
        let settings = load_settings(Some(&path), &overrides).unwrap();
        assert_eq!(settings.seed, 9);
        assert_eq!(settings.topology, Topology::Coupled);
        assert_eq!(settings.collection, "down3");
        assert_eq!(settings.input.image_size, 64);
        assert_eq!(settings.input.channels, 3);
        assert_eq!(settings.policy.erase_earlier, Some(2));
        assert_eq!(settings.policy.test_frequency, 20);
    }

    #[test]
    fn partial_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.json");
        std::fs::write(
            &path,
            r#"{"encode_depth": 3, "decode": {"1": {"bypass": 0}}}"#,
        )
        .unwrap();
        let settings = RunSettings {
            config_file: Some(path),
            ..RunSettings::default()
        };
        let partial = settings.partial().unwrap();
        assert_eq!(partial.encode_depth, Some(3));
        assert_eq!(partial.decode_stage(1).unwrap().bypass, Some(0));
        assert!(RunSettings::default().partial().unwrap().is_empty());
    }
}
