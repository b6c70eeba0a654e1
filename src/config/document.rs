//! Conversion between typed configs and stored documents.
//!
//! Stores only accept string keys, so stage indices are written as strings by
//! [`preprocess`] and converted back to integers by [`postprocess`]. Both directions are
//! required: a record that is postprocessed and preprocessed again is unchanged.
use crate::{error::Error, result::Result};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map, Value};

/// Top level keys holding stage maps.
pub const STAGE_SECTIONS: [&str; 3] = ["encode", "hidden", "decode"];

/// Converts a config into a storable document with string stage keys.
pub fn preprocess<T: Serialize>(config: &T) -> Result<Value> {
    let mut doc = serde_json::to_value(config)?;
    for_each_section(&mut doc, |section, stages| {
        let mut keyed = Map::with_capacity(stages.len());
        for (key, stage) in std::mem::take(stages) {
            let index = parse_key(section, &key)?;
            keyed.insert(index.to_string(), stage);
        }
        *stages = keyed;
        Ok(())
    })?;
    Ok(doc)
}

/// Converts a stored document back into a typed config, restoring integer stage keys.
///
/// **Errors**
///
/// If a stage key is not a non-negative integer, or the document does not match `T`.
pub fn postprocess<T: DeserializeOwned>(doc: &Value) -> Result<T> {
    let mut doc = doc.clone();
    for_each_section(&mut doc, |section, stages| {
        let mut indexed: Vec<(usize, Value)> = Vec::with_capacity(stages.len());
        for (key, stage) in std::mem::take(stages) {
            indexed.push((parse_key(section, &key)?, stage));
        }
        indexed.sort_by_key(|(index, _)| *index);
        *stages = indexed
            .into_iter()
            .map(|(index, stage)| (index.to_string(), stage))
            .collect();
        Ok(())
    })?;
    Ok(serde_json::from_value(doc)?)
}

fn parse_key(section: &str, key: &str) -> Result<usize> {
    key.trim().parse().map_err(|_| Error::StageKey {
        section: section.to_string(),
        key: key.to_string(),
    })
}

fn for_each_section(
    doc: &mut Value,
    mut f: impl FnMut(&str, &mut Map<String, Value>) -> Result<()>,
) -> Result<()> {
    let Some(doc) = doc.as_object_mut() else {
        return Err(Error::invalid_config("config document is not an object"));
    };
    for section in STAGE_SECTIONS {
        match doc.get_mut(section) {
            Some(Value::Object(stages)) => f(section, stages)?,
            Some(Value::Null) | None => (),
            Some(other) => {
                return Err(Error::invalid_config(format!(
                    "{section:?} must map stage indices to records, found {other}"
                )))
            }
        }
    }
    Ok(())
}
