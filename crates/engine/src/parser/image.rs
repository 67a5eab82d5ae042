//! Already-rastered images: a single-page visual document with no text
//! extraction (spec.md §3 Page, §9). Unlike PDF/Office rendering, no
//! external collaborator is needed here — the bytes already are the page.

use super::{DocumentParser, FormatCategory, ParsedDocument, ParsedPage};
use crate::config::ProcessingConfig;
use crate::error::PipelineError;

pub struct ImageParser;

impl DocumentParser for ImageParser {
  fn extensions(&self) -> &'static [&'static str] {
    &["png", "jpg", "jpeg", "tiff", "bmp", "webp"]
  }

  fn parse(&self, bytes: &[u8], _config: &ProcessingConfig) -> Result<ParsedDocument, PipelineError> {
    if bytes.is_empty() {
      return Err(PipelineError::Parse("image file is empty".into()));
    }
    Ok(ParsedDocument {
      category: FormatCategory::Visual,
      pages: vec![ParsedPage { page_number: 1, image_bytes: bytes.to_vec() }],
      chunks: Vec::new(),
      page_count: Some(1),
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn single_page_wraps_raw_bytes() {
    let parser = ImageParser;
    let config = ProcessingConfig::default();
    let doc = parser.parse(&[0u8, 1, 2, 3], &config).unwrap();
    assert_eq!(doc.pages.len(), 1);
    assert_eq!(doc.page_count, Some(1));
  }

  #[test]
  fn empty_bytes_is_a_parse_error() {
    let parser = ImageParser;
    let config = ProcessingConfig::default();
    assert!(parser.parse(&[], &config).is_err());
  }
}
