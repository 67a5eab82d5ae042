//! FileValidator: pure, stateless validation of extension and size against a
//! [`ProcessingConfig`] snapshot. No I/O, no globals.

use std::path::Path;

use crate::config::ProcessingConfig;
use crate::error::ValidationError;

pub fn supported_extensions(config: &ProcessingConfig) -> &std::collections::HashSet<String> {
  &config.supported_formats
}

pub fn validate_type(path: &Path, config: &ProcessingConfig) -> Result<(), ValidationError> {
  let ext = path
    .extension()
    .and_then(|e| e.to_str())
    .map(|e| e.to_lowercase())
    .ok_or(ValidationError::NoExtension)?;

  if config.supported_formats.contains(&ext) {
    Ok(())
  } else {
    Err(ValidationError::UnsupportedType(ext))
  }
}

pub fn validate_size(byte_len: u64, max_mb: f64) -> Result<(), ValidationError> {
  if max_mb < 0.0 {
    return Err(ValidationError::InvalidSize);
  }
  let actual_mb = byte_len as f64 / (1024.0 * 1024.0);
  if actual_mb > max_mb {
    Err(ValidationError::TooLarge { actual_mb, max_mb })
  } else {
    Ok(())
  }
}

/// Composes [`validate_type`] then [`validate_size`], type first per spec.md §4.1.
pub fn validate(path: &Path, byte_len: u64, config: &ProcessingConfig) -> Result<(), ValidationError> {
  validate_type(path, config)?;
  validate_size(byte_len, config.max_file_size_mb)?;
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  fn config() -> ProcessingConfig {
    ProcessingConfig {
      max_file_size_mb: 1.0,
      ..ProcessingConfig::default()
    }
  }

  #[test]
  fn rejects_missing_extension() {
    let err = validate_type(Path::new("noext"), &config()).unwrap_err();
    assert!(matches!(err, ValidationError::NoExtension));
  }

  #[test]
  fn rejects_unsupported_extension() {
    let err = validate_type(Path::new("malware.exe"), &config()).unwrap_err();
    assert!(matches!(err, ValidationError::UnsupportedType(ext) if ext == "exe"));
  }

  #[test]
  fn accepts_known_extension_case_insensitive() {
    assert!(validate_type(Path::new("report.PDF"), &config()).is_ok());
  }

  #[test]
  fn accepts_file_exactly_at_limit() {
    let max_bytes = (1.0 * 1024.0 * 1024.0) as u64;
    assert!(validate_size(max_bytes, 1.0).is_ok());
  }

  #[test]
  fn rejects_file_one_byte_over_limit() {
    let max_bytes = (1.0 * 1024.0 * 1024.0) as u64 + 1;
    let err = validate_size(max_bytes, 1.0).unwrap_err();
    assert!(matches!(err, ValidationError::TooLarge { .. }));
  }

  #[test]
  fn validate_checks_type_before_size() {
    // An oversized file with a bad extension should report the type error.
    let err = validate(Path::new("huge.exe"), u64::MAX, &config()).unwrap_err();
    assert!(matches!(err, ValidationError::UnsupportedType(_)));
  }
}
