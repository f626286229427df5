//! Guarded access to the vehicle's tunable parameter set.
//!
//! Every operation waits on the link's one-time parameter-readiness gate
//! before touching anything, including the very first request after
//! connect. Writes are validated before they reach the link.

use std::{collections::BTreeMap, fs, path::Path, path::PathBuf};

use anyhow::Context;
use tracing::info;

use crate::error::UgvError;
use crate::link::VehicleLink;

/// Key/value mirror of the vehicle-side parameters, plus the snapshot file
/// they persist to.
pub struct ParameterStore {
    snapshot_path: PathBuf,
}

impl ParameterStore {
    pub fn new(snapshot_path: PathBuf) -> Self {
        ParameterStore { snapshot_path }
    }

    pub async fn get(&self, link: &mut dyn VehicleLink, key: &str) -> Result<f64, UgvError> {
        link.wait_params_ready().await?;
        link.param_get(key)
            .await?
            .ok_or_else(|| UgvError::NotFound(key.to_owned()))
    }

    pub async fn get_all(
        &self,
        link: &mut dyn VehicleLink,
    ) -> Result<BTreeMap<String, f64>, UgvError> {
        link.wait_params_ready().await?;
        Ok(link.param_items().await?)
    }

    /// Writes one parameter. The raw value must parse as a float; anything
    /// else is rejected before the link is contacted.
    pub async fn set(
        &self,
        link: &mut dyn VehicleLink,
        key: &str,
        raw_value: &str,
    ) -> Result<(), UgvError> {
        let value = parse_value(key, raw_value)?;
        link.wait_params_ready().await?;
        Ok(link.param_set(key, value).await?)
    }

    /// Writes a batch of parameters, validating every value before applying
    /// any. A single bad value fails the whole call, naming the offending
    /// key, and nothing is written.
    pub async fn set_many(
        &self,
        link: &mut dyn VehicleLink,
        assignments: &[(String, String)],
    ) -> Result<(), UgvError> {
        let validated = assignments
            .iter()
            .map(|(key, raw)| Ok((key.as_str(), parse_value(key, raw)?)))
            .collect::<Result<Vec<_>, UgvError>>()?;

        link.wait_params_ready().await?;
        for (key, value) in validated {
            link.param_set(key, value).await?;
        }
        Ok(())
    }

    /// Persists the full parameter mapping to the snapshot file.
    pub async fn save(&self, link: &mut dyn VehicleLink) -> Result<(), UgvError> {
        link.wait_params_ready().await?;
        let items = link.param_items().await?;
        write_snapshot(&self.snapshot_path, &items)?;
        info!(
            "saved {} parameters to {:?}",
            items.len(),
            self.snapshot_path
        );
        Ok(())
    }

    /// Replaces the vehicle-side parameter set from the snapshot file.
    /// A wholesale replace, not a merge.
    pub async fn load(&self, link: &mut dyn VehicleLink) -> Result<(), UgvError> {
        let items = read_snapshot(&self.snapshot_path)?;
        link.wait_params_ready().await?;
        for (key, value) in &items {
            link.param_set(key, *value).await?;
        }
        info!(
            "loaded {} parameters from {:?}",
            items.len(),
            self.snapshot_path
        );
        Ok(())
    }
}

fn parse_value(key: &str, raw: &str) -> Result<f64, UgvError> {
    raw.trim().parse().map_err(|_| {
        UgvError::invalid_request(format!(
            "value {raw:?} for parameter {key} cannot be converted to a float"
        ))
    })
}

/// Splits `KEY=VALUE` assignment strings as entered on the command line.
pub fn parse_assignments(raw: &[String]) -> Result<Vec<(String, String)>, UgvError> {
    raw.iter()
        .map(|entry| {
            entry
                .split_once('=')
                .map(|(key, value)| (key.to_owned(), value.to_owned()))
                .ok_or_else(|| {
                    UgvError::invalid_request(format!("expected KEY=VALUE, got {entry:?}"))
                })
        })
        .collect()
}

fn write_snapshot(path: &Path, items: &BTreeMap<String, f64>) -> Result<(), UgvError> {
    let contents = serde_json::to_string_pretty(items)
        .context("could not serialize parameter snapshot")?;
    fs::write(path, contents)
        .with_context(|| format!("could not write parameter snapshot {path:?}"))?;
    Ok(())
}

fn read_snapshot(path: &Path) -> Result<BTreeMap<String, f64>, UgvError> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("could not read parameter snapshot {path:?}"))?;
    Ok(serde_json::from_str(&contents)
        .with_context(|| format!("parameter snapshot {path:?} is malformed"))?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_float_values_are_rejected() {
        assert!(matches!(
            parse_value("CRUISE_SPEED", "fast"),
            Err(UgvError::InvalidRequest(_))
        ));
        assert_eq!(parse_value("CRUISE_SPEED", "3.14").unwrap(), 3.14);
        assert_eq!(parse_value("CRUISE_SPEED", " 2 ").unwrap(), 2.0);
    }

    #[test]
    fn assignments_require_key_value_form() {
        let parsed = parse_assignments(&[
            "CRUISE_SPEED=3.5".to_owned(),
            "WP_RADIUS=2".to_owned(),
        ])
        .unwrap();
        assert_eq!(
            parsed,
            vec![
                ("CRUISE_SPEED".to_owned(), "3.5".to_owned()),
                ("WP_RADIUS".to_owned(), "2".to_owned()),
            ]
        );

        assert!(matches!(
            parse_assignments(&["CRUISE_SPEED".to_owned()]),
            Err(UgvError::InvalidRequest(_))
        ));
    }

    #[test]
    fn snapshot_file_round_trip() {
        let dir = std::env::temp_dir().join("ugv-system-param-tests");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("params.json");

        let mut items = BTreeMap::new();
        items.insert("CRUISE_SPEED".to_owned(), 3.5);
        items.insert("WP_RADIUS".to_owned(), 2.0);

        write_snapshot(&path, &items).unwrap();
        assert_eq!(read_snapshot(&path).unwrap(), items);
    }
}
