//! CSV: each data row becomes one atomic chunk so a search hit can point at
//! a specific row rather than a whole sheet (spec.md §3, §9).

use super::{DocumentParser, ParsedChunk, ParsedDocument};
use crate::config::ProcessingConfig;
use crate::error::PipelineError;

pub struct CsvParser;

impl DocumentParser for CsvParser {
  fn extensions(&self) -> &'static [&'static str] {
    &["csv"]
  }

  fn parse(&self, bytes: &[u8], _config: &ProcessingConfig) -> Result<ParsedDocument, PipelineError> {
    let text = String::from_utf8(bytes.to_vec()).map_err(|e| PipelineError::Parse(format!("not valid utf-8: {e}")))?;

    let mut lines = text.lines();
    let header = lines.next().map(str::to_string);

    let chunks: Vec<ParsedChunk> = lines
      .enumerate()
      .filter(|(_, line)| !line.trim().is_empty())
      .map(|(i, line)| {
        let body = match &header {
          Some(h) => format!("{h}\n{line}"),
          None => line.to_string(),
        };
        ParsedChunk { chunk_index: i as u32, page_number: None, body, content_type: "row" }
      })
      .collect();

    if chunks.is_empty() {
      return Err(PipelineError::Parse("csv file has no data rows".into()));
    }
    Ok(ParsedDocument::text_only(chunks))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn each_row_becomes_its_own_chunk_with_header_context() {
    let csv = "name,age\nalice,30\nbob,40\n";
    let parser = CsvParser;
    let config = ProcessingConfig::default();
    let doc = parser.parse(csv.as_bytes(), &config).unwrap();
    assert_eq!(doc.chunks.len(), 2);
    assert!(doc.chunks[0].body.contains("name,age"));
    assert!(doc.chunks[0].body.contains("alice,30"));
    assert_eq!(doc.chunks[0].content_type, "row");
  }

  #[test]
  fn header_only_csv_is_a_parse_error() {
    let parser = CsvParser;
    let config = ProcessingConfig::default();
    assert!(parser.parse(b"name,age\n", &config).is_err());
  }
}
