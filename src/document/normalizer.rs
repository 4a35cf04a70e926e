use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

/// Byte that separates the fields folded into the content hash. Using a
/// non-printable separator (ASCII unit separator) rather than a literal
/// character keeps the hash resistant to field values that happen to
/// contain whatever separator a naive join would pick.
const UNIT_SEPARATOR: u8 = 0x1E;

pub struct NormalizedEmail {
    pub plain_text: String,
    pub ts: DateTime<Utc>,
    pub ts_parse_failed: bool,
    pub sender_domain: Option<String>,
    pub content_hash: String,
    pub language: Option<String>,
}

/// Cleans a raw email body, resolves its timestamp, derives the sender
/// domain, and computes the idempotency hash, per 4.D Content normalizer.
pub fn normalize_email(
    subject: &str,
    raw_body: &str,
    from_addr: Option<&str>,
    raw_date: Option<&str>,
    account_id: &str,
    external_id: &str,
) -> NormalizedEmail {
    let (ts, ts_parse_failed) = parse_date(raw_date);
    let sender_domain = from_addr.and_then(extract_domain);
    let plain_text = clean_body(raw_body);
    let content_hash = hash_content(subject, &plain_text, account_id, external_id);
    let language = detect_language(subject, &plain_text);

    NormalizedEmail {
        plain_text,
        ts,
        ts_parse_failed,
        sender_domain,
        content_hash,
        language,
    }
}

/// Parses an RFC-2822 date, falling back to "now (UTC)" and reporting
/// that fallback so the caller can record it in metadata.
fn parse_date(raw_date: Option<&str>) -> (DateTime<Utc>, bool) {
    match raw_date.and_then(|d| DateTime::parse_from_rfc2822(d).ok()) {
        Some(parsed) => (parsed.with_timezone(&Utc), false),
        None => (Utc::now(), true),
    }
}

fn extract_domain(from_addr: &str) -> Option<String> {
    from_addr
        .rsplit('@')
        .next()
        .filter(|_| from_addr.contains('@'))
        .map(|d| d.trim().to_lowercase())
        .filter(|d| !d.is_empty())
}

fn is_separator_line(line: &str) -> bool {
    matches!(line.trim(), "--" | "---" | "____")
}

fn is_signoff_line(line: &str) -> bool {
    let trimmed = line.trim_start();
    let lower = trimmed.to_lowercase();
    (lower.starts_with("best") || lower.starts_with("kind") || lower.starts_with("warm"))
        && (lower.contains("regards") || lower.contains("wishes"))
}

fn is_quoted_wrote_line(line: &str) -> bool {
    line.starts_with("On ") && line.contains("wrote:")
}

/// Walks the body line-by-line and stops at the first quote marker,
/// reply-attribution line, separator, or sign-off, per 4.D step 3.
fn clean_body(raw_body: &str) -> String {
    let mut kept = Vec::new();

    for line in raw_body.lines() {
        if line.starts_with('>') || is_quoted_wrote_line(line) || is_separator_line(line) || is_signoff_line(line) {
            break;
        }
        kept.push(line.trim_end());
    }

    kept.join("\n").trim().to_string()
}

fn hash_content(subject: &str, plain_text: &str, account_id: &str, external_id: &str) -> String {
    let mut buf = Vec::new();
    buf.extend_from_slice(subject.as_bytes());
    buf.push(UNIT_SEPARATOR);
    buf.extend_from_slice(plain_text.as_bytes());
    buf.push(UNIT_SEPARATOR);
    buf.extend_from_slice(account_id.as_bytes());
    buf.push(UNIT_SEPARATOR);
    buf.extend_from_slice(external_id.as_bytes());

    let digest = Sha256::digest(&buf);
    hex::encode(digest)
}

const TURKISH_CHARS: &[char] = &['ı', 'İ', 'ğ', 'Ğ', 'ş', 'Ş', 'ö', 'Ö', 'ç', 'Ç', 'ü', 'Ü'];

/// Best-effort language detection over the first 4000 characters: a
/// Turkish-alphabet heuristic, not a statistical classifier.
fn detect_language(subject: &str, plain_text: &str) -> Option<String> {
    let sample: String = subject
        .chars()
        .chain(plain_text.chars())
        .take(4000)
        .collect();

    if sample.is_empty() {
        return None;
    }

    if sample.chars().any(|c| TURKISH_CHARS.contains(&c)) {
        Some("tr".to_string())
    } else {
        Some("en".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable() {
        let a = hash_content("Hi", "Body", "u@x", "m1");
        let b = hash_content("Hi", "Body", "u@x", "m1");
        assert_eq!(a, b);
    }

    #[test]
    fn hash_distinguishes_fields() {
        let a = hash_content("Hi", "Body", "u@x", "m1");
        let b = hash_content("Hi", "Body", "u@x", "m2");
        assert_ne!(a, b);
    }

    #[test]
    fn clean_body_stops_on_quote_marker() {
        let body = "Hello there\nThanks\n> quoted reply\nmore quoted";
        assert_eq!(clean_body(body), "Hello there\nThanks");
    }

    #[test]
    fn clean_body_stops_on_wrote_attribution() {
        let body = "Sure, sounds good\nOn Mon, Jan 1, 2024 Jane wrote:\n> original";
        assert_eq!(clean_body(body), "Sure, sounds good");
    }

    #[test]
    fn clean_body_stops_on_signoff() {
        let body = "See you then\nBest regards\nJane Doe";
        assert_eq!(clean_body(body), "See you then");
    }

    #[test]
    fn clean_body_stops_on_separator() {
        let body = "Content line\n--\nSignature block";
        assert_eq!(clean_body(body), "Content line");
    }

    #[test]
    fn extract_domain_lowercases_and_handles_missing_at() {
        assert_eq!(extract_domain("Jane@Example.COM"), Some("example.com".to_string()));
        assert_eq!(extract_domain("not-an-email"), None);
    }

    #[test]
    fn detects_turkish_via_special_chars() {
        assert_eq!(detect_language("Başlık", "gövde"), Some("tr".to_string()));
        assert_eq!(detect_language("Subject", "body text"), Some("en".to_string()));
    }

    #[test]
    fn date_parse_failure_falls_back_to_now() {
        let (_, failed) = parse_date(Some("not a date"));
        assert!(failed);
        let (_, failed_none) = parse_date(None);
        assert!(failed_none);
    }
}
