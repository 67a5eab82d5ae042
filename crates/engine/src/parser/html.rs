//! HTML / XHTML: strip markup down to Markdown-ish prose, then chunk it the
//! same way plain text is chunked, grounded on the `html2md` conversion the
//! retrieved `nans28-eywa` server uses for its own HTML ingestion.

use super::{DocumentParser, ParsedChunk, ParsedDocument};
use crate::config::ProcessingConfig;
use crate::error::PipelineError;
use crate::pipeline::chunker::chunk_text;

pub struct HtmlParser;

impl DocumentParser for HtmlParser {
  fn extensions(&self) -> &'static [&'static str] {
    &["html", "htm", "xhtml"]
  }

  fn parse(&self, bytes: &[u8], config: &ProcessingConfig) -> Result<ParsedDocument, PipelineError> {
    let html = String::from_utf8(bytes.to_vec()).map_err(|e| PipelineError::Parse(format!("not valid utf-8: {e}")))?;
    let text = html2md::rewrite_html(&html, false);

    let chunks: Vec<ParsedChunk> = chunk_text(&text, config.text_chunk_size, config.text_chunk_overlap)
      .into_iter()
      .enumerate()
      .map(|(i, c)| ParsedChunk { chunk_index: i as u32, page_number: None, body: c.body, content_type: c.content_type })
      .collect();

    if chunks.is_empty() {
      return Err(PipelineError::Parse("no extractable text in html document".into()));
    }
    Ok(ParsedDocument::text_only(chunks))
  }
}
