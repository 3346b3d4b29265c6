use thiserror::Error;

/// A single field-level validation failure, collected so a caller can report
/// every violation at once instead of only the first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    /// Stable error code suitable for localized message formatting.
    pub code: &'static str,
    /// The offending field name.
    pub field: String,
}

impl std::fmt::Display for FieldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.field)
    }
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Invalid schema name: {0}")]
    InvalidSchemaName(String),

    #[error("Invalid storage code: {0}")]
    InvalidStorageCode(String),

    #[error("Draft already exists: {0}")]
    DraftAlreadyExists(String),

    #[error("Storage not found: {0}")]
    StorageNotFound(String),

    #[error("Field not found: {field} in {storage}")]
    FieldNotFound { storage: String, field: String },

    #[error("Draft structure differs from version structure: {draft} vs {version}")]
    StructureMismatch { draft: String, version: String },

    #[error("Value is not unique for field: {0}")]
    NotUnique(String),

    #[error("Incompatible new data type for field: {0}")]
    IncompatibleDataType(String),

    #[error("Required field values are missing")]
    RequiredFieldErrors(Vec<FieldError>),

    #[error("Row not found: {0}")]
    RowNotFound(i64),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Storage error: {0}")]
    Backend(String),
}

impl StorageError {
    /// Stable error code for localized message formatting. The offending
    /// identifiers are available through [`StorageError::args`].
    pub fn error_code(&self) -> &'static str {
        match self {
            StorageError::InvalidSchemaName(_) => "storage.schema.name.invalid",
            StorageError::InvalidStorageCode(_) => "storage.code.invalid",
            StorageError::DraftAlreadyExists(_) => "storage.draft.already.exists",
            StorageError::StorageNotFound(_) => "storage.not.found",
            StorageError::FieldNotFound { .. } => "storage.field.not.found",
            StorageError::StructureMismatch { .. } => "storage.structure.mismatch",
            StorageError::NotUnique(_) => "storage.value.not.unique",
            StorageError::IncompatibleDataType(_) => "storage.field.data.type.incompatible",
            StorageError::RequiredFieldErrors(_) => "storage.field.value.required",
            StorageError::RowNotFound(_) => "storage.row.not.found",
            StorageError::SerializationError(_) => "storage.serialization.error",
            StorageError::Backend(_) => "storage.backend.error",
        }
    }

    /// The offending identifier(s), as message-formatting arguments.
    pub fn args(&self) -> Vec<String> {
        match self {
            StorageError::InvalidSchemaName(s)
            | StorageError::InvalidStorageCode(s)
            | StorageError::DraftAlreadyExists(s)
            | StorageError::StorageNotFound(s)
            | StorageError::NotUnique(s)
            | StorageError::IncompatibleDataType(s)
            | StorageError::Backend(s) => vec![s.clone()],
            StorageError::FieldNotFound { storage, field } => {
                vec![storage.clone(), field.clone()]
            }
            StorageError::StructureMismatch { draft, version } => {
                vec![draft.clone(), version.clone()]
            }
            StorageError::RequiredFieldErrors(errors) => {
                errors.iter().map(|e| e.field.clone()).collect()
            }
            StorageError::RowNotFound(id) => vec![id.to_string()],
            StorageError::SerializationError(e) => vec![e.to_string()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_are_stable() {
        let e = StorageError::NotUnique("name".to_string());
        assert_eq!(e.error_code(), "storage.value.not.unique");
        assert_eq!(e.args(), vec!["name".to_string()]);
    }

    #[test]
    fn required_field_errors_collect_all_fields() {
        let e = StorageError::RequiredFieldErrors(vec![
            FieldError {
                code: "storage.field.value.required",
                field: "name".to_string(),
            },
            FieldError {
                code: "storage.field.value.required",
                field: "code".to_string(),
            },
        ]);
        assert_eq!(e.args(), vec!["name".to_string(), "code".to_string()]);
    }
}
