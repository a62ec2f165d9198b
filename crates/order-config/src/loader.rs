//! Multi-file configuration loading.
//!
//! The root file may list other files in `include = [...]`, resolved
//! relative to the root's directory. Their top-level sections are merged
//! into the root. A section may be defined by one file only, and a file may
//! be read only once.

use crate::{resolve_env_vars, Config, ConfigError};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

pub(crate) struct ConfigLoader {
	base_path: PathBuf,
	/// Canonical paths already read.
	visited: HashSet<PathBuf>,
	/// File that defined each top-level section.
	owners: HashMap<String, PathBuf>,
}

impl ConfigLoader {
	pub(crate) fn new(base_path: impl AsRef<Path>) -> Self {
		Self {
			base_path: base_path.as_ref().to_path_buf(),
			visited: HashSet::new(),
			owners: HashMap::new(),
		}
	}

	/// Loads the root file, merges its includes and validates the result.
	pub(crate) async fn load_config(
		&mut self,
		config_path: impl AsRef<Path>,
	) -> Result<Config, ConfigError> {
		let root_path = self.base_path.join(config_path);
		let mut root = self.read_table(&root_path).await?;

		let includes = match root.remove("include") {
			None => Vec::new(),
			Some(toml::Value::Array(items)) => items
				.into_iter()
				.map(|item| match item {
					toml::Value::String(path) => Ok(PathBuf::from(path)),
					_ => Err(ConfigError::Validation(
						"Include array must contain only strings".into(),
					)),
				})
				.collect::<Result<Vec<_>, _>>()?,
			Some(_) => {
				return Err(ConfigError::Validation(
					"Include must be an array of file paths".into(),
				))
			},
		};

		for section in root.keys() {
			self.owners.insert(section.clone(), root_path.clone());
		}
		for include in includes {
			let include_path = self.base_path.join(include);
			let table = self.read_table(&include_path).await?;
			for (section, value) in table {
				if let Some(owner) = self.owners.get(&section) {
					return Err(ConfigError::Validation(format!(
						"Duplicate section '{}' found in {} and {}",
						section,
						owner.display(),
						include_path.display()
					)));
				}
				self.owners.insert(section.clone(), include_path.clone());
				root.insert(section, value);
			}
		}

		let merged = toml::to_string(&root)
			.map_err(|e| ConfigError::Parse(format!("Failed to merge configuration: {}", e)))?;
		merged.parse()
	}

	/// Reads one file as a TOML table after env substitution. Reading the
	/// same file twice is reported as an include cycle.
	async fn read_table(&mut self, path: &Path) -> Result<toml::Table, ConfigError> {
		let canonical = tokio::fs::canonicalize(path).await.map_err(|e| {
			ConfigError::Io(std::io::Error::new(
				std::io::ErrorKind::NotFound,
				format!("Configuration file not found: {}: {}", path.display(), e),
			))
		})?;
		if !self.visited.insert(canonical.clone()) {
			return Err(ConfigError::Validation(format!(
				"Circular include detected: {} was already loaded",
				canonical.display()
			)));
		}

		let content = tokio::fs::read_to_string(&canonical).await?;
		Ok(toml::from_str(&resolve_env_vars(&content)?)?)
	}
}
