//! Configuration schema framework.
//!
//! Each pluggable implementation (storage backend, stream transport) owns a
//! TOML table in the service configuration. The types here let an
//! implementation declare which keys it requires or accepts and check a
//! table against that declaration before it is constructed.

use thiserror::Error;

/// Errors raised when an implementation table does not match its schema.
#[derive(Debug, Error)]
pub enum SchemaError {
	#[error("Missing required field: {0}")]
	MissingField(String),
	#[error("Invalid value for field '{field}': {message}")]
	InvalidValue { field: String, message: String },
	#[error("Type mismatch for field '{field}': expected {expected}, got {actual}")]
	TypeMismatch {
		field: String,
		expected: String,
		actual: String,
	},
}

/// Expected TOML type of a field.
#[derive(Debug)]
pub enum FieldType {
	String,
	/// Integer with optional inclusive bounds.
	Integer { min: Option<i64>, max: Option<i64> },
	Boolean,
	Array(Box<FieldType>),
	Table(Schema),
}

/// Extra check run after the type check passes.
pub type FieldValidator = Box<dyn Fn(&toml::Value) -> Result<(), String> + Send + Sync>;

/// A named field in a schema.
pub struct Field {
	pub name: String,
	pub field_type: FieldType,
	pub validator: Option<FieldValidator>,
}

impl std::fmt::Debug for Field {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Field")
			.field("name", &self.name)
			.field("field_type", &self.field_type)
			.field("validator", &self.validator.is_some())
			.finish()
	}
}

impl Field {
	pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
		Self {
			name: name.into(),
			field_type,
			validator: None,
		}
	}

	/// Attaches a custom check that receives the raw field value.
	pub fn with_validator<F>(mut self, validator: F) -> Self
	where
		F: Fn(&toml::Value) -> Result<(), String> + Send + Sync + 'static,
	{
		self.validator = Some(Box::new(validator));
		self
	}

	fn check(&self, value: &toml::Value) -> Result<(), SchemaError> {
		check_type(&self.name, value, &self.field_type)?;
		if let Some(validator) = &self.validator {
			validator(value).map_err(|message| SchemaError::InvalidValue {
				field: self.name.clone(),
				message,
			})?;
		}
		Ok(())
	}
}

/// Required and optional fields of one implementation table.
#[derive(Debug)]
pub struct Schema {
	pub required: Vec<Field>,
	pub optional: Vec<Field>,
}

impl Schema {
	pub fn new(required: Vec<Field>, optional: Vec<Field>) -> Self {
		Self { required, optional }
	}

	/// Checks `config` against this schema.
	///
	/// Required fields must be present; optional fields are only checked when
	/// set. Keys the schema does not mention are ignored.
	pub fn validate(&self, config: &toml::Value) -> Result<(), SchemaError> {
		let table = config.as_table().ok_or_else(|| SchemaError::TypeMismatch {
			field: "root".to_string(),
			expected: "table".to_string(),
			actual: config.type_str().to_string(),
		})?;

		for field in &self.required {
			let value = table
				.get(&field.name)
				.ok_or_else(|| SchemaError::MissingField(field.name.clone()))?;
			field.check(value)?;
		}

		for field in &self.optional {
			if let Some(value) = table.get(&field.name) {
				field.check(value)?;
			}
		}

		Ok(())
	}
}

fn type_mismatch(field: &str, expected: &str, value: &toml::Value) -> SchemaError {
	SchemaError::TypeMismatch {
		field: field.to_string(),
		expected: expected.to_string(),
		actual: value.type_str().to_string(),
	}
}

fn check_type(field: &str, value: &toml::Value, expected: &FieldType) -> Result<(), SchemaError> {
	match expected {
		FieldType::String => {
			if !value.is_str() {
				return Err(type_mismatch(field, "string", value));
			}
		},
		FieldType::Boolean => {
			if !value.is_bool() {
				return Err(type_mismatch(field, "boolean", value));
			}
		},
		FieldType::Integer { min, max } => {
			let int_val = value
				.as_integer()
				.ok_or_else(|| type_mismatch(field, "integer", value))?;

			if let Some(min) = min.filter(|min| int_val < *min) {
				return Err(SchemaError::InvalidValue {
					field: field.to_string(),
					message: format!("Value {} is less than minimum {}", int_val, min),
				});
			}
			if let Some(max) = max.filter(|max| int_val > *max) {
				return Err(SchemaError::InvalidValue {
					field: field.to_string(),
					message: format!("Value {} is greater than maximum {}", int_val, max),
				});
			}
		},
		FieldType::Array(inner) => {
			let items = value
				.as_array()
				.ok_or_else(|| type_mismatch(field, "array", value))?;
			for (i, item) in items.iter().enumerate() {
				check_type(&format!("{}[{}]", field, i), item, inner)?;
			}
		},
		FieldType::Table(schema) => {
			schema.validate(value).map_err(|e| match e {
				SchemaError::MissingField(f) => SchemaError::MissingField(format!("{}.{}", field, f)),
				SchemaError::InvalidValue { field: f, message } => SchemaError::InvalidValue {
					field: format!("{}.{}", field, f),
					message,
				},
				SchemaError::TypeMismatch {
					field: f,
					expected,
					actual,
				} => SchemaError::TypeMismatch {
					field: format!("{}.{}", field, f),
					expected,
					actual,
				},
			})?;
		},
	}

	Ok(())
}

/// Implemented by every pluggable implementation to validate its table.
pub trait ConfigSchema: Send + Sync {
	fn validate(&self, config: &toml::Value) -> Result<(), SchemaError>;
}

#[cfg(test)]
mod tests {
	use super::*;

	fn parse(s: &str) -> toml::Value {
		toml::from_str(s).unwrap()
	}

	#[test]
	fn test_required_field_missing() {
		let schema = Schema::new(vec![Field::new("storage_path", FieldType::String)], vec![]);
		let err = schema.validate(&parse("")).unwrap_err();
		assert!(matches!(err, SchemaError::MissingField(f) if f == "storage_path"));
	}

	#[test]
	fn test_integer_bounds() {
		let schema = Schema::new(
			vec![],
			vec![Field::new(
				"poll_interval_ms",
				FieldType::Integer {
					min: Some(1),
					max: Some(60_000),
				},
			)],
		);

		assert!(schema.validate(&parse("poll_interval_ms = 50")).is_ok());
		assert!(matches!(
			schema.validate(&parse("poll_interval_ms = 0")),
			Err(SchemaError::InvalidValue { .. })
		));
		assert!(matches!(
			schema.validate(&parse("poll_interval_ms = \"fast\"")),
			Err(SchemaError::TypeMismatch { .. })
		));
	}

	#[test]
	fn test_custom_validator() {
		let schema = Schema::new(
			vec![Field::new("path", FieldType::String).with_validator(|v| {
				match v.as_str() {
					Some(s) if !s.is_empty() => Ok(()),
					_ => Err("path cannot be empty".to_string()),
				}
			})],
			vec![],
		);

		assert!(schema.validate(&parse("path = \"./data\"")).is_ok());
		let err = schema.validate(&parse("path = \"\"")).unwrap_err();
		assert!(err.to_string().contains("path cannot be empty"));
	}

	#[test]
	fn test_nested_table_prefixes_field() {
		let schema = Schema::new(
			vec![Field::new(
				"limits",
				FieldType::Table(Schema::new(
					vec![Field::new("max", FieldType::Integer { min: None, max: None })],
					vec![],
				)),
			)],
			vec![],
		);

		let err = schema.validate(&parse("[limits]\nother = 1")).unwrap_err();
		assert!(matches!(err, SchemaError::MissingField(f) if f == "limits.max"));
	}
}
