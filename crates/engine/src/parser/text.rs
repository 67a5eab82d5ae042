//! Plain-text family: Markdown, AsciiDoc, bare `.txt`, and WebVTT transcripts
//! all flow through the same word-window chunker (spec.md §3, §9).

use super::{DocumentParser, FormatCategory, ParsedChunk, ParsedDocument};
use crate::config::ProcessingConfig;
use crate::error::PipelineError;
use crate::pipeline::chunker::chunk_text;

pub struct TextParser;

impl DocumentParser for TextParser {
  fn extensions(&self) -> &'static [&'static str] {
    &["md", "markdown", "asciidoc", "adoc", "txt", "vtt"]
  }

  fn parse(&self, bytes: &[u8], config: &ProcessingConfig) -> Result<ParsedDocument, PipelineError> {
    let text = String::from_utf8(bytes.to_vec())
      .map_err(|e| PipelineError::Parse(format!("not valid utf-8: {e}")))?;
    let text = strip_vtt_cues(&text);

    let chunks: Vec<ParsedChunk> = chunk_text(&text, config.text_chunk_size, config.text_chunk_overlap)
      .into_iter()
      .enumerate()
      .map(|(i, c)| ParsedChunk {
        chunk_index: i as u32,
        page_number: None,
        body: c.body,
        content_type: c.content_type,
      })
      .collect();

    Ok(ParsedDocument::text_only(chunks))
  }
}

/// Drop the `WEBVTT` header and numeric/timestamp cue lines, keeping only
/// spoken text, so a transcript chunks the same way prose does.
fn strip_vtt_cues(text: &str) -> String {
  if !text.trim_start().starts_with("WEBVTT") {
    return text.to_string();
  }
  text
    .lines()
    .filter(|line| {
      let t = line.trim();
      !(t.is_empty()
        || t == "WEBVTT"
        || t.contains("-->")
        || t.chars().all(|c| c.is_ascii_digit()))
    })
    .collect::<Vec<_>>()
    .join("\n")
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::ProcessingConfig;

  #[test]
  fn markdown_heading_stays_atomic() {
    let parser = TextParser;
    let config = ProcessingConfig::default();
    let doc = parser.parse(b"# Title\n\nbody text", &config).unwrap();
    assert_eq!(doc.chunks[0].content_type, "heading");
  }

  #[test]
  fn vtt_cue_markers_are_stripped() {
    let vtt = "WEBVTT\n\n1\n00:00:00.000 --> 00:00:02.000\nHello there\n";
    let parser = TextParser;
    let config = ProcessingConfig::default();
    let doc = parser.parse(vtt.as_bytes(), &config).unwrap();
    assert_eq!(doc.chunks.len(), 1);
    assert_eq!(doc.chunks[0].body, "Hello there");
  }

  #[test]
  fn invalid_utf8_is_a_parse_error() {
    let parser = TextParser;
    let config = ProcessingConfig::default();
    let err = parser.parse(&[0xff, 0xfe, 0xfd], &config).unwrap_err();
    assert!(matches!(err, PipelineError::Parse(_)));
  }
}
