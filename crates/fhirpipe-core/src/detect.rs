//! Input classification: what kind of source did the user hand us?

use crate::error::PipelineError;
use crate::job::InputType;
use serde_json::Value;
use std::fs;
use std::path::Path;

/// Classifies an input string without performing network I/O.
///
/// Ambiguous local paths default to `LocalDirectory`; the import step
/// produces far more actionable errors than this function could, so deep
/// validation is deliberately left to it.
pub fn detect_input_type(input: &str) -> Result<InputType, PipelineError> {
    if input.trim().is_empty() {
        return Err(PipelineError::non_transient("input source is empty"));
    }

    if input.starts_with("http://") || input.starts_with("https://") {
        if url_path_has_fhir_segment(input) {
            return Ok(InputType::ExtractionResultUrl);
        }
        return Ok(InputType::HttpUrl);
    }

    let path = Path::new(input);
    if path.is_file() && looks_like_cohort_definition(path) {
        return Ok(InputType::CohortDefinitionFile);
    }
    Ok(InputType::LocalDirectory)
}

/// True when the URL path contains the literal segment `/fhir/`. The check
/// is case-sensitive: `/FHIR/` does not match.
fn url_path_has_fhir_segment(input: &str) -> bool {
    match reqwest::Url::parse(input) {
        Ok(url) => url.path().contains("/fhir/"),
        Err(_) => false,
    }
}

/// A file is taken for a cohort definition when it has a `.crtdl` or
/// `.json` extension and its top level carries both `cohortDefinition`
/// and `dataExtraction`.
fn looks_like_cohort_definition(path: &Path) -> bool {
    let ext_matches = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("crtdl") || e.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    if !ext_matches {
        return false;
    }
    let Ok(content) = fs::read_to_string(path) else {
        return false;
    };
    let Ok(value) = serde_json::from_str::<Value>(&content) else {
        return false;
    };
    value.get("cohortDefinition").is_some() && value.get("dataExtraction").is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn empty_input_is_an_error() {
        assert!(detect_input_type("").is_err());
        assert!(detect_input_type("   ").is_err());
    }

    #[test]
    fn urls_with_fhir_segment_are_extraction_results() {
        assert_eq!(
            detect_input_type("https://dex.example/fhir/__status/abc").unwrap(),
            InputType::ExtractionResultUrl
        );
        // Case-sensitive on purpose.
        assert_eq!(
            detect_input_type("https://dex.example/FHIR/__status/abc").unwrap(),
            InputType::HttpUrl
        );
        assert_eq!(
            detect_input_type("http://files.example/data/patients.ndjson").unwrap(),
            InputType::HttpUrl
        );
    }

    #[test]
    fn fhir_in_host_does_not_count() {
        assert_eq!(
            detect_input_type("https://fhir.example.com/data.ndjson").unwrap(),
            InputType::HttpUrl
        );
    }

    #[test]
    fn existing_directory_is_local() {
        let dir = tempdir().unwrap();
        let input = dir.path().to_str().unwrap().to_string();
        assert_eq!(detect_input_type(&input).unwrap(), InputType::LocalDirectory);
    }

    #[test]
    fn cohort_definition_detected_by_extension_and_keys() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cohort.crtdl");
        fs::write(&path, r#"{"cohortDefinition": {}, "dataExtraction": {}}"#).unwrap();
        assert_eq!(
            detect_input_type(path.to_str().unwrap()).unwrap(),
            InputType::CohortDefinitionFile
        );

        // Missing one of the required keys: falls back to local-directory.
        let path = dir.path().join("other.json");
        fs::write(&path, r#"{"cohortDefinition": {}}"#).unwrap();
        assert_eq!(
            detect_input_type(path.to_str().unwrap()).unwrap(),
            InputType::LocalDirectory
        );
    }

    #[test]
    fn nonexistent_path_defaults_to_local_directory() {
        assert_eq!(
            detect_input_type("/no/such/path/anywhere").unwrap(),
            InputType::LocalDirectory
        );
    }
}
