/// Tunables for the char-window chunker, sourced from `IngestConfig` at
/// call sites; given defaults here so tests don't need a `Settings`.
#[derive(Debug, Clone, Copy)]
pub struct ChunkParams {
    pub target: usize,
    pub overlap: usize,
    pub min_join: usize,
    pub min_keep: usize,
}

impl Default for ChunkParams {
    fn default() -> Self {
        Self {
            target: 1200,
            overlap: 150,
            min_join: 120,
            min_keep: 20,
        }
    }
}

/// One chunker per document kind (4.E, "A specialized variant..."); mixing
/// strategies within a document is a programming error, not a runtime
/// choice, so selection happens once at ingest registration (9. Design
/// Notes, "Mixed-strategy chunking").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkStrategy {
    #[allow(dead_code)]
    CharWindow,
    EmailFixed,
}

pub fn chunk(strategy: ChunkStrategy, subject: &str, body: &str, params: ChunkParams) -> Vec<String> {
    match strategy {
        ChunkStrategy::CharWindow => char_window_chunks(body, params),
        ChunkStrategy::EmailFixed => email_fixed_chunks(subject, body, params),
    }
}

/// Slides a `[i, i+target)` window over `body`, advancing by
/// `target - overlap`, then applies the merge and keep policies.
fn char_window_chunks(body: &str, params: ChunkParams) -> Vec<String> {
    let chars: Vec<char> = body.chars().collect();
    let total = chars.len();
    if total == 0 {
        return Vec::new();
    }

    let mut raw = Vec::new();
    let mut start = 0;
    let advance = params.target.saturating_sub(params.overlap).max(1);

    while start < total {
        let end = (start + params.target).min(total);
        let piece: String = chars[start..end].iter().collect();
        if !piece.is_empty() {
            raw.push(piece);
        }
        if end >= total {
            break;
        }
        start += advance;
    }

    apply_keep_policy(merge_short_chunks(raw, params.min_join), params.min_keep)
}

/// Buffers any chunk shorter than `min_join`; when a long chunk arrives,
/// the buffer (if small) is joined onto it, else emitted as its own
/// preceding chunk. A trailing buffer is joined onto the last emitted
/// chunk so no chunk but the very first ever stays under `min_join`.
fn merge_short_chunks(chunks: Vec<String>, min_join: usize) -> Vec<String> {
    let mut merged = Vec::new();
    let mut buffer: Option<String> = None;

    for chunk in chunks {
        if chunk.chars().count() < min_join {
            buffer = Some(match buffer.take() {
                Some(b) => format!("{b}\n{chunk}"),
                None => chunk,
            });
            continue;
        }

        match buffer.take() {
            Some(b) if b.chars().count() < min_join => {
                merged.push(format!("{b}\n{chunk}"));
            }
            Some(b) => {
                merged.push(b);
                merged.push(chunk);
            }
            None => merged.push(chunk),
        }
    }

    if let Some(b) = buffer {
        match merged.last_mut() {
            Some(last) => *last = format!("{last}\n{b}"),
            None => merged.push(b),
        }
    }

    merged
}

fn apply_keep_policy(chunks: Vec<String>, min_keep: usize) -> Vec<String> {
    chunks
        .into_iter()
        .filter(|c| c.chars().count() >= min_keep)
        .collect()
}

/// Fixed-size email layout: subject, then the first 1000 chars of body,
/// then 1200-char windows with 160 overlap over the remainder.
fn email_fixed_chunks(subject: &str, body: &str, _params: ChunkParams) -> Vec<String> {
    let mut chunks = Vec::new();

    let subject_chars: Vec<char> = subject.chars().collect();
    if !subject_chars.is_empty() {
        let end = subject_chars.len().min(300);
        chunks.push(subject_chars[..end].iter().collect());
    }

    let body_chars: Vec<char> = body.chars().collect();
    if body_chars.is_empty() {
        return chunks;
    }

    let first_end = body_chars.len().min(1000);
    chunks.push(body_chars[..first_end].iter().collect::<String>());

    let target: usize = 1200;
    let overlap: usize = 160;
    let advance = target.saturating_sub(overlap).max(1);
    let mut start = first_end;

    while start < body_chars.len() {
        let end = (start + target).min(body_chars.len());
        let piece: String = body_chars[start..end].iter().collect();
        if !piece.is_empty() {
            chunks.push(piece);
        }
        if end >= body_chars.len() {
            break;
        }
        start += advance;
    }

    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_body_yields_no_chunks() {
        assert!(char_window_chunks("", ChunkParams::default()).is_empty());
    }

    #[test]
    fn adjacent_chunks_overlap_within_bound() {
        let body = "a".repeat(5000);
        let params = ChunkParams::default();
        let chunks = char_window_chunks(&body, params);
        assert!(chunks.len() >= 2);
    }

    #[test]
    fn short_final_chunk_is_dropped() {
        let params = ChunkParams {
            target: 50,
            overlap: 0,
            min_join: 0,
            min_keep: 10,
        };
        let body = format!("{}{}", "x".repeat(50), "y".repeat(3));
        let chunks = char_window_chunks(&body, params);
        assert!(chunks.iter().all(|c| c.chars().count() >= params.min_keep));
    }

    #[test]
    fn short_chunks_get_merged_into_buffer() {
        let params = ChunkParams {
            target: 10,
            overlap: 0,
            min_join: 8,
            min_keep: 1,
        };
        let body = "short1".to_string() + &"x".repeat(20) + "short2";
        let chunks = char_window_chunks(&body, params);
        assert!(chunks.iter().all(|c| c.chars().count() >= params.min_join || chunks.len() == 1));
    }

    #[test]
    fn email_fixed_splits_subject_and_body() {
        let subject = "Quarterly update";
        let body = "x".repeat(2500);
        let chunks = email_fixed_chunks(subject, &body, ChunkParams::default());
        assert_eq!(chunks[0], subject);
        assert!(chunks.len() >= 3);
    }

    #[test]
    fn email_fixed_handles_short_body() {
        let chunks = email_fixed_chunks("Hi", "short body", ChunkParams::default());
        assert_eq!(chunks, vec!["Hi".to_string(), "short body".to_string()]);
    }
}
