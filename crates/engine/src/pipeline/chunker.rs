//! Plain-text chunker: target ~250 words per chunk with ~50-word overlap
//! (spec.md §3). Markdown headings and table rows are kept atomic rather
//! than being split mid-structure.

#[derive(Debug, Clone)]
pub struct TextChunk {
  pub body: String,
  pub content_type: &'static str,
}

/// Split `text` into overlapping word-window chunks, treating a line that
/// looks like a Markdown heading or table row as its own atomic chunk.
pub fn chunk_text(text: &str, target_words: usize, overlap_words: usize) -> Vec<TextChunk> {
  let target_words = target_words.max(1);
  let mut chunks = Vec::new();
  let mut buffer: Vec<&str> = Vec::new();

  let flush = |buffer: &mut Vec<&str>, chunks: &mut Vec<TextChunk>| {
    if !buffer.is_empty() {
      chunks.push(TextChunk { body: buffer.join(" "), content_type: "paragraph" });
      buffer.clear();
    }
  };

  for line in text.lines() {
    let trimmed = line.trim();
    if trimmed.is_empty() {
      continue;
    }

    if is_heading(trimmed) {
      flush(&mut buffer, &mut chunks);
      chunks.push(TextChunk { body: trimmed.to_string(), content_type: "heading" });
      continue;
    }

    if is_table_row(trimmed) {
      flush(&mut buffer, &mut chunks);
      chunks.push(TextChunk { body: trimmed.to_string(), content_type: "table-cell" });
      continue;
    }

    for word in trimmed.split_whitespace() {
      buffer.push(word);
      if buffer.len() >= target_words {
        chunks.push(TextChunk { body: buffer.join(" "), content_type: "paragraph" });
        let keep_from = buffer.len().saturating_sub(overlap_words.min(buffer.len()));
        buffer = buffer.split_off(keep_from);
      }
    }
  }
  flush(&mut buffer, &mut chunks);

  if chunks.is_empty() && !text.trim().is_empty() {
    chunks.push(TextChunk { body: text.trim().to_string(), content_type: "paragraph" });
  }
  chunks
}

fn is_heading(line: &str) -> bool {
  line.starts_with('#')
}

fn is_table_row(line: &str) -> bool {
  line.starts_with('|') && line.ends_with('|')
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn empty_text_produces_no_chunks() {
    assert!(chunk_text("", 250, 50).is_empty());
  }

  #[test]
  fn short_text_produces_a_single_chunk() {
    let chunks = chunk_text("a short paragraph of text", 250, 50);
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].content_type, "paragraph");
  }

  #[test]
  fn long_text_is_split_with_overlap() {
    let words: Vec<String> = (0..600).map(|i| format!("w{i}")).collect();
    let text = words.join(" ");
    let chunks = chunk_text(&text, 250, 50);
    assert!(chunks.len() >= 2);

    let first_tail: Vec<&str> = chunks[0].body.split_whitespace().rev().take(50).collect();
    let second_head: Vec<&str> = chunks[1].body.split_whitespace().take(50).collect();
    let overlap = first_tail.iter().rev().eq(second_head.iter());
    assert!(overlap, "second chunk should start with the overlap carried from the first");
  }

  #[test]
  fn heading_is_kept_atomic() {
    let chunks = chunk_text("# Title\n\nbody text here", 250, 50);
    assert_eq!(chunks[0].content_type, "heading");
    assert_eq!(chunks[0].body, "# Title");
  }

  #[test]
  fn table_row_is_kept_atomic() {
    let chunks = chunk_text("| a | b |\n| 1 | 2 |", 250, 50);
    assert!(chunks.iter().all(|c| c.content_type == "table-cell"));
    assert_eq!(chunks.len(), 2);
  }
}
