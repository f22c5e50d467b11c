//! Document text extraction for CLI ingestion.
//!
//! The pipeline itself consumes decoded text; this module turns supported
//! files into that text. Plain text and Markdown are read as UTF-8 (with a
//! lossy fallback for stray bytes), PDFs go through `pdf-extract`. Anything
//! else is rejected before the pipeline runs.

use std::path::Path;

use crate::models::PipelineError;

/// Extract plain text from a file, returning the text and a short file
/// type tag (`"txt"`, `"md"`, `"pdf"`).
pub fn extract_text(path: &Path) -> Result<(String, String), PipelineError> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "txt" | "md" => {
            let bytes = std::fs::read(path).map_err(|e| {
                PipelineError::Validation(format!("cannot read {}: {}", path.display(), e))
            })?;
            let text = match String::from_utf8(bytes) {
                Ok(s) => s,
                Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
            };
            Ok((text, ext))
        }
        "pdf" => {
            let text = pdf_extract::extract_text(path).map_err(|e| {
                PipelineError::Validation(format!("PDF extraction failed: {}", e))
            })?;
            Ok((text, ext))
        }
        "" => Err(PipelineError::Validation(format!(
            "{} has no file extension",
            path.display()
        ))),
        other => Err(PipelineError::Validation(format!(
            "unsupported file type: .{}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reads_text_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.txt");
        std::fs::write(&path, "hello\n{\"a\": 1}").unwrap();
        let (text, file_type) = extract_text(&path).unwrap();
        assert_eq!(file_type, "txt");
        assert!(text.contains("hello"));
    }

    #[test]
    fn test_lossy_fallback_for_invalid_utf8() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.md");
        std::fs::write(&path, [b'o', b'k', 0xff, b'!']).unwrap();
        let (text, _) = extract_text(&path).unwrap();
        assert!(text.starts_with("ok"));
        assert!(text.ends_with('!'));
    }

    #[test]
    fn test_unsupported_extension_rejected() {
        let err = extract_text(Path::new("report.docx")).unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
    }
}
