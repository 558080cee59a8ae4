use std::path::Path;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Text,
    Markdown,
    Json,
    Pdf,
    Unsupported,
}

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("unsupported content type: {0}")]
    UnsupportedType(String),
    #[error("invalid utf-8 content")]
    InvalidUtf8,
    #[error("pdf extraction failed: {0}")]
    Pdf(String),
    #[error("extracted text is empty")]
    EmptyText,
}

pub fn detect_content_kind(mime_type: &str, filename: Option<&str>) -> ContentKind {
    let mime = mime_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_lowercase();
    match mime.as_str() {
        "text/plain" => ContentKind::Text,
        "text/markdown" => ContentKind::Markdown,
        "application/json" => ContentKind::Json,
        "application/pdf" => ContentKind::Pdf,
        _ => {
            if let Some(name) = filename {
                let ext = Path::new(name)
                    .extension()
                    .and_then(|e| e.to_str())
                    .unwrap_or("")
                    .to_lowercase();
                match ext.as_str() {
                    "txt" => ContentKind::Text,
                    "md" | "markdown" => ContentKind::Markdown,
                    "json" => ContentKind::Json,
                    "pdf" => ContentKind::Pdf,
                    _ => ContentKind::Unsupported,
                }
            } else {
                ContentKind::Unsupported
            }
        }
    }
}

/// Extracts plain text from a downloaded blob per its mime type.
pub fn extract_text(
    bytes: &[u8],
    mime_type: &str,
    filename: Option<&str>,
) -> Result<String, ExtractError> {
    let text = match detect_content_kind(mime_type, filename) {
        ContentKind::Text | ContentKind::Markdown | ContentKind::Json => {
            String::from_utf8(bytes.to_vec()).map_err(|_| ExtractError::InvalidUtf8)?
        }
        ContentKind::Pdf => pdf_extract::extract_text_from_mem(bytes)
            .map_err(|e| ExtractError::Pdf(e.to_string()))?,
        ContentKind::Unsupported => {
            return Err(ExtractError::UnsupportedType(mime_type.to_string()))
        }
    };

    if text.trim().is_empty() {
        return Err(ExtractError::EmptyText);
    }
    Ok(text)
}
