//! Outbound message formatting.
//!
//! Providers cap message length (Telegram at 4096 characters), so long
//! agent replies are split into chunks. Code blocks are kept valid: a
//! block that spans a split is closed with its fence at the chunk end and
//! reopened (with the original language tag and a continuation marker) at
//! the start of the next chunk. Markdown headings become bold lines,
//! which Telegram renders properly.

/// Marker appended after a reopened code fence.
const CONTINUATION: &str = "// …";

/// Format a reply for delivery: headings to bold, then split into chunks
/// no longer than `max_length` with per-chunk balanced code fences.
pub fn format_message_chunks(text: &str, max_length: usize) -> Vec<String> {
    let prepared = headings_to_bold(text);
    split_chunks(&prepared, max_length)
}

/// Convert `# Heading` lines (outside code blocks) to `*Heading*`.
fn headings_to_bold(text: &str) -> String {
    let mut out = Vec::new();
    let mut in_code = false;
    for line in text.lines() {
        if line.trim_start().starts_with("```") {
            in_code = !in_code;
            out.push(line.to_string());
            continue;
        }
        if !in_code {
            let trimmed = line.trim_start();
            let hashes = trimmed.chars().take_while(|c| *c == '#').count();
            if hashes > 0 && hashes <= 6 {
                let rest = trimmed[hashes..].trim_start();
                if !rest.is_empty() {
                    out.push(format!("*{rest}*"));
                    continue;
                }
            }
        }
        out.push(line.to_string());
    }
    out.join("\n")
}

fn split_chunks(text: &str, max_length: usize) -> Vec<String> {
    if text.len() <= max_length {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut in_code = false;
    let mut fence_lang = String::new();

    for line in text.lines() {
        let fence = line.trim_start().starts_with("```");

        // +1 for the joining newline; +4 reserves room for a closing fence.
        let reserve = if in_code || fence { 4 } else { 0 };
        let projected = current.len() + line.len() + 1 + reserve;
        if !current.is_empty() && projected > max_length {
            if in_code {
                current.push_str("\n```");
            }
            chunks.push(std::mem::take(&mut current));
            if in_code {
                current.push_str(&format!("```{fence_lang}\n{CONTINUATION}"));
            }
        }

        if !current.is_empty() {
            current.push('\n');
        }
        // A single line longer than the budget is hard-split.
        if line.len() > max_length {
            let mut rest = line;
            loop {
                let budget = max_length.saturating_sub(current.len()).max(1);
                if rest.len() <= budget {
                    current.push_str(rest);
                    break;
                }
                let split_at = floor_char_boundary(rest, budget);
                current.push_str(&rest[..split_at]);
                chunks.push(std::mem::take(&mut current));
                rest = &rest[split_at..];
            }
        } else {
            current.push_str(line);
        }

        if fence {
            if !in_code {
                fence_lang = line.trim_start().trim_start_matches("```").to_string();
            }
            in_code = !in_code;
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

fn floor_char_boundary(s: &str, mut at: usize) -> usize {
    while at > 0 && !s.is_char_boundary(at) {
        at -= 1;
    }
    at.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fences(chunk: &str) -> usize {
        chunk
            .lines()
            .filter(|l| l.trim_start().starts_with("```"))
            .count()
    }

    #[test]
    fn short_text_is_one_chunk() {
        let chunks = format_message_chunks("hello world", 4096);
        assert_eq!(chunks, vec!["hello world"]);
    }

    #[test]
    fn headings_become_bold() {
        let chunks = format_message_chunks("# Title\nbody\n## Sub heading\nmore", 4096);
        assert_eq!(chunks[0], "*Title*\nbody\n*Sub heading*\nmore");
    }

    #[test]
    fn headings_inside_code_blocks_are_preserved() {
        let text = "```bash\n# not a heading\n```";
        let chunks = format_message_chunks(text, 4096);
        assert_eq!(chunks[0], text);
    }

    #[test]
    fn long_code_block_splits_with_balanced_fences() {
        let mut body = String::from("```rust\n");
        for i in 0..200 {
            body.push_str(&format!("let line_{i} = {i}; // padding padding padding\n"));
        }
        body.push_str("```");

        let max = 500;
        let chunks = format_message_chunks(&body, max);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.len() <= max, "chunk too long: {}", chunk.len());
            assert_eq!(fences(chunk) % 2, 0, "unbalanced fences in chunk:\n{chunk}");
        }
        // Continuation chunks reopen with the language tag.
        assert!(chunks[1].starts_with("```rust"));
        assert!(chunks[1].contains(CONTINUATION));
    }

    #[test]
    fn plain_text_splits_on_line_boundaries() {
        let text = (0..100)
            .map(|i| format!("line number {i}"))
            .collect::<Vec<_>>()
            .join("\n");
        let chunks = format_message_chunks(&text, 200);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.len() <= 200);
        }
        // Nothing lost.
        let rejoined: String = chunks.join("\n");
        assert!(rejoined.contains("line number 0"));
        assert!(rejoined.contains("line number 99"));
    }

    #[test]
    fn oversized_single_line_is_hard_split() {
        let text = "x".repeat(1000);
        let chunks = format_message_chunks(&text, 300);
        assert!(chunks.len() >= 4);
        for chunk in &chunks {
            assert!(chunk.len() <= 300);
        }
        assert_eq!(chunks.concat().len(), 1000);
    }
}
