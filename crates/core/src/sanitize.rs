//! Sanitizer: normalize text, strip machine-generated noise,
//! redact PII, unwrap common JSON/LLM transport shapes.
//!
//! Pure and infallible. Chunked for large inputs, yielding to the runtime
//! between chunks so a 20 MB sanitize pass does not starve the scheduler
//!.

use std::sync::OnceLock;

use regex::Regex;

/// Inputs larger than this are processed in newline-snapped chunks.
const CHUNK_THRESHOLD: usize = 2 * 1024 * 1024;
/// Target chunk size once chunking kicks in.
const CHUNK_SIZE: usize = 1024 * 1024;

struct Patterns {
    log_spam: Regex,
    bracket_timestamp: Regex,
    progress_bar: Regex,
    email: Regex,
    ipv4: Regex,
    sk_token: Regex,
    source_header: Regex,
    llm_role_marker: Regex,
    json_wrap_key: Regex,
    excess_newlines: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        log_spam: Regex::new(
            r"(?m)^.*\b(Processing '[^']*'|Loading|Indexing|Analyzing)\b.*\n?",
        )
        .unwrap(),
        bracket_timestamp: Regex::new(r"\[\d{4}-\d{2}-\d{2}[^\]]*\]").unwrap(),
        progress_bar: Regex::new(r"[\[(]=*>?[ ]*[\])][ ]*\d{1,3}%").unwrap(),
        email: Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").unwrap(),
        ipv4: Regex::new(r"\b(?:\d{1,3}\.){3}\d{1,3}\b").unwrap(),
        sk_token: Regex::new(r"sk-[A-Za-z0-9]{32,}").unwrap(),
        source_header: Regex::new(
            r"\[Source:[^\]]*\](?:\s*\(Timestamp:[^)]*\))?",
        )
        .unwrap(),
        llm_role_marker: Regex::new(r"<\|(?:user|assistant|system)\|>").unwrap(),
        json_wrap_key: Regex::new(
            r#"["'](?:content|message|body|type|timestamp|source_path|response_content|thinking_content|text)["']\s*:\s*"#,
        )
        .unwrap(),
        excess_newlines: Regex::new(r"\n{3,}").unwrap(),
    })
}

/// Sanitizes `raw` into cleaned text by running the ordered transform list
/// (PII redaction, log-spam stripping, JSON wrap-key unwrapping). Synchronous,
/// single-pass; use [`sanitize_async`] for inputs that may exceed the
/// chunking threshold.
pub fn sanitize(raw: &str) -> String {
    let p = patterns();

    let mut text = raw.replace('\u{feff}', "");
    text.retain(|c| c != '\u{0}' && c != '\u{fffd}');
    text = text.replace("\r\n", "\n").replace('\r', "\n");

    text = p.log_spam.replace_all(&text, "").into_owned();
    text = p.bracket_timestamp.replace_all(&text, "").into_owned();
    text = p.progress_bar.replace_all(&text, "").into_owned();

    text = p.email.replace_all(&text, "[EMAIL_REDACTED]").into_owned();
    text = p.ipv4.replace_all(&text, "[IP_REDACTED]").into_owned();
    text = p.sk_token.replace_all(&text, "sk-[REDACTED]").into_owned();

    text = p.source_header.replace_all(&text, "").into_owned();
    text = p.llm_role_marker.replace_all(&text, "").into_owned();

    text = p.json_wrap_key.replace_all(&text, "").into_owned();
    text = text.replace("\",", "\n").replace("\"}", "").replace("{\"", "");

    text = p.excess_newlines.replace_all(&text, "\n\n").into_owned();
    text.trim().to_string()
}

/// Snaps `text` into byte-aligned chunks of roughly `CHUNK_SIZE`, each
/// ending at a newline so no chunk boundary splits a line.
fn chunk_on_newlines(text: &str, chunk_size: usize) -> Vec<&str> {
    let bytes = text.as_bytes();
    let mut chunks = Vec::new();
    let mut start = 0;
    while start < bytes.len() {
        let mut end = (start + chunk_size).min(bytes.len());
        if end < bytes.len() {
            match text[start..end].rfind('\n') {
                Some(pos) => end = start + pos + 1,
                None => { /* no newline in range; fall through to end */ }
            }
        }
        chunks.push(&text[start..end]);
        start = end;
    }
    chunks
}

/// Async variant used by the atomizer for files that may be large enough
/// to need chunked processing. Yields to the runtime between chunks
/// so sanitizing a 20 MB file does not block
/// other scheduled work.
pub async fn sanitize_async(raw: &str) -> String {
    if raw.len() <= CHUNK_THRESHOLD {
        return sanitize(raw);
    }

    let mut out = String::with_capacity(raw.len());
    for chunk in chunk_on_newlines(raw, CHUNK_SIZE) {
        out.push_str(&sanitize(chunk));
        out.push('\n');
        tokio::task::yield_now().await;
    }
    // Re-run the newline collapse across chunk boundaries, since each
    // chunk was collapsed independently.
    let p = patterns();
    p.excess_newlines.replace_all(&out, "\n\n").trim().to_string()
}
