use crate::config::LlmConfig;
use crate::database::Repository;
use crate::services::llm_service::{ChatMessage, CompletionOptions, LlmService};
use crate::services::retriever::{Retriever, SearchQuery};
use crate::utils::CoreError;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Deserialize)]
pub struct AskRequest {
    pub query: String,
    pub language: Option<String>,
    #[serde(default)]
    pub email_mode: bool,
    pub recipient: Option<String>,
    pub sender: Option<String>,
    pub subject_hint: Option<String>,
    pub tone: Option<String>,
    #[serde(default = "default_max_sentences")]
    pub max_sentences: usize,
}

fn default_max_sentences() -> usize {
    5
}

#[derive(Debug, Serialize)]
pub struct SourceRef {
    pub id: i32,
    pub title: Option<String>,
    pub url: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AskResponse {
    pub answer: Option<String>,
    pub used_ids: Vec<i32>,
    pub sources: Vec<SourceRef>,
    pub subject: Option<String>,
    pub body: Option<String>,
    pub format: &'static str,
}

struct InlineFilters {
    from: Option<String>,
    tag: Option<String>,
    is: Option<String>,
    date_from: Option<DateTime<Utc>>,
    date_to: Option<DateTime<Utc>>,
    want_latest: bool,
    cleaned_query: String,
}

static FILTER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\b(from|sender|tag|is):("[^"]+"|\S+)"#).unwrap()
});

static RELATIVE_TR: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"(?i)son\s+(\d+)\s*g[üu]n").unwrap(),
        Regex::new(r"(?i)son\s+(\d+)\s*hafta").unwrap(),
        Regex::new(r"(?i)son\s+(\d+)\s*ay").unwrap(),
        Regex::new(r"(?i)son\s+(\d+)\s*y[ıi]l").unwrap(),
        Regex::new(r"(?i)\bd[üu]n\b").unwrap(),
        Regex::new(r"(?i)\bbug[üu]n\b").unwrap(),
    ]
});

static RELATIVE_EN: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"(?i)last\s+(\d+)\s*days?").unwrap(),
        Regex::new(r"(?i)last\s+(\d+)\s*weeks?").unwrap(),
        Regex::new(r"(?i)last\s+(\d+)\s*months?").unwrap(),
        Regex::new(r"(?i)last\s+(\d+)\s*years?").unwrap(),
        Regex::new(r"(?i)\byesterday\b").unwrap(),
        Regex::new(r"(?i)\btoday\b").unwrap(),
    ]
});

static WANTS_LATEST_TR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)en son|son (posta|email|e-?posta)").unwrap());
static WANTS_LATEST_EN: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)latest|most recent").unwrap());

const DAY_MULTIPLIERS: [(usize, i64); 4] = [(0, 1), (1, 7), (2, 30), (3, 365)];

type TimeWindowMatch = ((DateTime<Utc>, DateTime<Utc>), String);

fn parse_time_window(patterns: &[Regex], text: &str, now: DateTime<Utc>) -> Option<TimeWindowMatch> {
    for (idx, re) in patterns.iter().enumerate() {
        if let Some(m) = re.find(text) {
            let window = if idx < 4 {
                let caps = re.captures(text)?;
                let n: i64 = caps.get(1)?.as_str().parse().ok()?;
                let days = n * DAY_MULTIPLIERS[idx].1;
                (now - ChronoDuration::days(days), now)
            } else if idx == 4 {
                let yesterday = now - ChronoDuration::days(1);
                (yesterday, now)
            } else {
                (now - ChronoDuration::hours(24), now)
            };
            return Some((window, text[m.start()..m.end()].to_string()));
        }
    }
    None
}

/// Three passes over the raw query: filter-token extraction, relative
/// time-window parsing, and the "latest" cue — each stripped from the
/// lexical query as it's consumed (4.I).
fn parse_inline(query: &str, is_turkish: bool, now: DateTime<Utc>) -> InlineFilters {
    let mut from = None;
    let mut tag = None;
    let mut is = None;
    let mut cleaned = FILTER_RE
        .replace_all(query, |caps: &regex::Captures| {
            let key = caps[1].to_lowercase();
            let value = caps[2].trim_matches('"').to_string();
            match key.as_str() {
                "from" | "sender" => from = Some(value.to_lowercase()),
                "tag" => tag = Some(value.to_lowercase()),
                "is" => is = Some(value.to_lowercase()),
                _ => {}
            }
            String::new()
        })
        .to_string();

    let relative_patterns: &[Regex] = if is_turkish { &RELATIVE_TR } else { &RELATIVE_EN };
    let mut date_from = None;
    let mut date_to = None;
    if let Some(((from_ts, to_ts), matched)) = parse_time_window(relative_patterns, &cleaned, now) {
        date_from = Some(from_ts);
        date_to = Some(to_ts);
        cleaned = cleaned.replace(&matched, "");
    }

    let want_latest = if is_turkish {
        WANTS_LATEST_TR.is_match(&cleaned)
    } else {
        WANTS_LATEST_EN.is_match(&cleaned)
    };

    InlineFilters {
        from,
        tag,
        is,
        date_from,
        date_to,
        want_latest,
        cleaned_query: cleaned.split_whitespace().collect::<Vec<_>>().join(" "),
    }
}

fn auto_lang(text: &str) -> &'static str {
    const TURKISH_CHARS: &[char] = &['ı', 'İ', 'ğ', 'Ğ', 'ş', 'Ş', 'ö', 'Ö', 'ç', 'Ç', 'ü', 'Ü'];
    if text.chars().any(|c| TURKISH_CHARS.contains(&c)) {
        "tr"
    } else {
        "en"
    }
}

fn limit_sentences(text: &str, max_sentences: usize) -> String {
    static SENTENCE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[.!?]\s+").unwrap());
    let parts: Vec<&str> = SENTENCE_RE.split(text).collect();
    parts
        .into_iter()
        .take(max_sentences.max(1))
        .collect::<Vec<_>>()
        .join(". ")
}

#[derive(Debug, Deserialize)]
struct EmailOutput {
    subject: Option<String>,
    body: Option<String>,
}

fn parse_email_output(raw: &str, subject_hint: Option<&str>) -> EmailOutput {
    let mut subject = None;
    let mut body_lines = Vec::new();
    let mut in_body = false;

    for line in raw.lines() {
        if let Some(rest) = line.strip_prefix("SUBJECT:") {
            subject = Some(rest.trim().to_string());
            in_body = false;
        } else if let Some(rest) = line.strip_prefix("BODY:") {
            body_lines.push(rest.trim().to_string());
            in_body = true;
        } else if in_body {
            body_lines.push(line.to_string());
        }
    }

    let body = if body_lines.is_empty() { None } else { Some(body_lines.join("\n").trim().to_string()) };

    EmailOutput {
        subject: subject.or_else(|| subject_hint.map(|s| s.to_string())),
        body,
    }
}

pub struct AskService {
    retriever: Arc<Retriever>,
    repository: Arc<Repository>,
    llm: Arc<LlmService>,
    llm_config: LlmConfig,
}

impl AskService {
    pub fn new(retriever: Arc<Retriever>, repository: Arc<Repository>, llm: Arc<LlmService>, llm_config: LlmConfig) -> Self {
        Self {
            retriever,
            repository,
            llm,
            llm_config,
        }
    }

    pub async fn ask(&self, request: AskRequest) -> Result<AskResponse, CoreError> {
        let language = request.language.clone().unwrap_or_else(|| auto_lang(&request.query).to_string());
        let is_turkish = language == "tr";
        let now = Utc::now();
        let filters = parse_inline(&request.query, is_turkish, now);

        let mut tags = Vec::new();
        if let Some(tag) = &filters.tag {
            tags.push(tag.clone());
        }

        let search_query = SearchQuery {
            q: Some(filters.cleaned_query.clone()).filter(|s| !s.trim().is_empty()),
            keywords: Vec::new(),
            limit: Some(10),
            offset: Some(0),
            tags,
            boost_tags: Vec::new(),
            date_from: filters.date_from,
            date_to: filters.date_to,
            language: Some(language.clone()),
            decay_days: None,
            highlight: false,
        };

        let query_text = search_query.q.clone().unwrap_or_default();
        if query_text.trim().is_empty() && filters.from.is_none() {
            return Ok(self.empty_response());
        }

        let mut results = self.retriever.search(search_query).await?;
        if filters.want_latest {
            results.hits.sort_by_key(|h| std::cmp::Reverse(h.ts));
        }
        // `is:{sent|inbox|important}` is stripped out of the lexical query
        // (so it never pollutes the full-text match) but otherwise has no
        // sink: documents carry no mailbox/folder state, so the retriever
        // exposes no `is` channel to filter on.
        let _ = filters.is;

        if results.hits.is_empty() {
            return Ok(self.empty_response_localized(is_turkish));
        }

        let ids: Vec<i32> = results.hits.iter().map(|h| h.id).collect();
        let docs = self.repository.fetch_by_ids(&ids).await.map_err(CoreError::from)?;

        if request.email_mode {
            self.synthesize_email(&request, is_turkish, docs).await
        } else {
            self.synthesize_summary(is_turkish, request.max_sentences, docs).await
        }
    }

    fn empty_response(&self) -> AskResponse {
        AskResponse {
            answer: Some(String::new()),
            used_ids: Vec::new(),
            sources: Vec::new(),
            subject: None,
            body: None,
            format: "summary",
        }
    }

    fn empty_response_localized(&self, is_turkish: bool) -> AskResponse {
        let answer = if is_turkish {
            "Eşleşen belge bulunamadı."
        } else {
            "No matching documents found."
        };
        AskResponse {
            answer: Some(answer.to_string()),
            used_ids: Vec::new(),
            sources: Vec::new(),
            subject: None,
            body: None,
            format: "summary",
        }
    }

    async fn synthesize_summary(
        &self,
        is_turkish: bool,
        max_sentences: usize,
        docs: Vec<crate::database::DocumentSummary>,
    ) -> Result<AskResponse, CoreError> {
        let used_ids: Vec<i32> = docs.iter().map(|d| d.id).collect();
        let sources: Vec<SourceRef> = docs
            .iter()
            .map(|d| SourceRef {
                id: d.id,
                title: d.title.clone(),
                url: d.source_url.clone(),
            })
            .collect();

        let system = if is_turkish {
            format!("Aşağıdaki belgeleri Türkçe olarak özetle. En fazla {max_sentences} cümle kullan.")
        } else {
            format!("Summarize the following documents in English. Use at most {max_sentences} sentences.")
        };

        let user = docs
            .iter()
            .enumerate()
            .map(|(i, d)| format!("[{}] {}\n{}", i + 1, d.title.clone().unwrap_or_default(), d.plain_text))
            .collect::<Vec<_>>()
            .join("\n\n");

        let messages = vec![ChatMessage::system(system), ChatMessage::user(user)];
        let options = CompletionOptions {
            temperature: 0.2,
            max_tokens: 400,
            json_mode: false,
        };

        let answer = match self.llm.complete(&self.llm_config.ask_chat_model, &messages, options).await {
            Ok(raw) => Some(limit_sentences(&raw, max_sentences)),
            Err(_) => None,
        };

        Ok(AskResponse {
            answer,
            used_ids,
            sources,
            subject: None,
            body: None,
            format: "summary",
        })
    }

    async fn synthesize_email(
        &self,
        request: &AskRequest,
        is_turkish: bool,
        docs: Vec<crate::database::DocumentSummary>,
    ) -> Result<AskResponse, CoreError> {
        let used_ids: Vec<i32> = docs.iter().map(|d| d.id).collect();
        let sources: Vec<SourceRef> = docs
            .iter()
            .map(|d| SourceRef {
                id: d.id,
                title: d.title.clone(),
                url: d.source_url.clone(),
            })
            .collect();

        let tone = request.tone.as_deref().unwrap_or("neutral");
        let system = if is_turkish {
            format!("Aşağıdaki bağlama dayanarak {tone} tonda bir e-posta taslağı oluştur. \
                     Çıktıyı 'SUBJECT: ...' ve 'BODY: ...' satırlarıyla ver.")
        } else {
            format!("Draft an email in a {tone} tone based on the context below. \
                     Output lines 'SUBJECT: ...' and 'BODY: ...'.")
        };

        let mut header_lines = Vec::new();
        if let Some(recipient) = &request.recipient {
            header_lines.push(format!("To: {recipient}"));
        }
        if let Some(sender) = &request.sender {
            header_lines.push(format!("From: {sender}"));
        }

        let context = docs
            .iter()
            .map(|d| d.plain_text.clone())
            .collect::<Vec<_>>()
            .join("\n\n");

        let user = if header_lines.is_empty() {
            context
        } else {
            format!("{}\n\n{context}", header_lines.join("\n"))
        };

        let messages = vec![ChatMessage::system(system), ChatMessage::user(user)];
        let options = CompletionOptions {
            temperature: 0.3,
            max_tokens: 400,
            json_mode: false,
        };

        let (subject, body) = match self.llm.complete(&self.llm_config.ask_chat_model, &messages, options).await {
            Ok(raw) => {
                let parsed = parse_email_output(&raw, request.subject_hint.as_deref());
                (parsed.subject, parsed.body)
            }
            Err(_) => (None, None),
        };

        let subject = subject.or_else(|| request.subject_hint.clone());
        let body = body.or_else(|| Some(templated_greeting(is_turkish)));

        Ok(AskResponse {
            answer: None,
            used_ids,
            sources,
            subject,
            body,
            format: "email",
        })
    }
}

fn templated_greeting(is_turkish: bool) -> String {
    if is_turkish {
        "Merhaba,\n\nBilgilendirme talebiniz için teşekkür ederiz.\n\nSaygılarımla".to_string()
    } else {
        "Hello,\n\nThank you for reaching out.\n\nBest regards".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inline_filter_extracts_from_and_tag() {
        let filters = parse_inline("from:hmrc tag:tax hello", false, Utc::now());
        assert_eq!(filters.from.as_deref(), Some("hmrc"));
        assert_eq!(filters.tag.as_deref(), Some("tax"));
        assert_eq!(filters.cleaned_query.trim(), "hello");
    }

    #[test]
    fn relative_time_window_turkish_son_gun() {
        let now = Utc::now();
        let filters = parse_inline("son 3 günde gelen postalar", true, now);
        assert!(filters.date_from.is_some());
        assert!(!filters.cleaned_query.contains("son 3"));
    }

    #[test]
    fn wants_latest_turkish() {
        let filters = parse_inline("en son email neydi", true, Utc::now());
        assert!(filters.want_latest);
    }

    #[test]
    fn wants_latest_english() {
        let filters = parse_inline("what was the latest email", false, Utc::now());
        assert!(filters.want_latest);
    }

    #[test]
    fn sentence_limit_truncates() {
        let text = "One. Two. Three. Four.";
        assert_eq!(limit_sentences(text, 2), "One. Two");
    }

    #[test]
    fn parse_email_output_extracts_subject_and_body() {
        let raw = "SUBJECT: Re: Invoice\nBODY: Thanks for the update.\nSee you soon.";
        let parsed = parse_email_output(raw, None);
        assert_eq!(parsed.subject.as_deref(), Some("Re: Invoice"));
        assert_eq!(parsed.body.as_deref(), Some("Thanks for the update.\nSee you soon."));
    }

    #[test]
    fn auto_lang_detects_turkish_chars() {
        assert_eq!(auto_lang("Başlık"), "tr");
        assert_eq!(auto_lang("plain text"), "en");
    }
}
