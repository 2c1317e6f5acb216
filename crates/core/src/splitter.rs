//! Splitter: decompose cleaned text into an ordered list of
//! byte-addressed molecules.
//!
//! The code-molecule walk is a brace-depth line scan, grounded on the
//! same line-oriented state-machine approach the source project used for
//! its own best-effort code partitioning. Prose and data strategies are
//! new, built to the same style.

use crate::model::MoleculeType;

/// A single splitter output record, before atom extraction or persistence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitMolecule {
    pub content: String,
    pub r#type: MoleculeType,
    pub start_byte: usize,
    pub end_byte: usize,
}

const FENCE: &str = "```";
const CODE_EXTENSIONS: &[&str] = &[
    "rs", "py", "js", "ts", "tsx", "jsx", "go", "java", "c", "cpp", "h", "hpp", "rb", "sh",
    "toml", "cfg", "ini",
];
const DATA_EXTENSIONS: &[&str] = &["csv", "json", "yaml", "yml"];
const CODE_KEYWORDS: &[&str] = &[
    "function", "class", "def ", "fn ", "import ", "struct ", "impl ", "public ", "private ",
];
const LARGE_INPUT_BYTES: usize = 5 * 1024 * 1024;

/// Chooses the type hint the splitter strategy is dispatched on. `extension` is the lowercased file extension, if any.
pub fn classify(text: &str, extension: Option<&str>) -> MoleculeType {
    if text.len() > LARGE_INPUT_BYTES {
        return MoleculeType::Data;
    }
    if let Some(ext) = extension {
        if DATA_EXTENSIONS.contains(&ext) {
            return MoleculeType::Data;
        }
        if CODE_EXTENSIONS.contains(&ext) {
            return MoleculeType::Code;
        }
    }
    if text.contains(FENCE) || CODE_KEYWORDS.iter().any(|kw| text.contains(kw)) {
        return MoleculeType::Code;
    }
    MoleculeType::Prose
}

/// Splits `text` (already sanitized) into molecules, dispatching on
/// `hint`, then enforces `max_size` by binary-splitting any oversized
/// molecule at a character boundary.
pub fn split(text: &str, hint: MoleculeType, max_size: usize) -> Vec<SplitMolecule> {
    let raw = match hint {
        MoleculeType::Prose => split_prose(text),
        MoleculeType::Code => split_code(text),
        MoleculeType::Data => split_data(text),
    };
    raw.into_iter()
        .flat_map(|m| enforce_max_size(m, max_size))
        .collect()
}

// ---------------------------------------------------------------------------
// Prose
// ---------------------------------------------------------------------------

/// A period/exclamation/question mark followed by whitespace then an
/// uppercase letter is a sentence boundary.
fn is_sentence_end(bytes: &[u8], i: usize) -> Option<usize> {
    let c = bytes[i];
    if c != b'.' && c != b'!' && c != b'?' {
        return None;
    }
    let mut j = i + 1;
    if j >= bytes.len() || !bytes[j].is_ascii_whitespace() {
        return None;
    }
    while j < bytes.len() && bytes[j].is_ascii_whitespace() {
        j += 1;
    }
    if j < bytes.len() && bytes[j].is_ascii_uppercase() {
        Some(j)
    } else {
        None
    }
}

/// Trims `raw` and reports the byte offsets of the trimmed slice relative
/// to `raw`'s own start, so callers can recover absolute offsets without
/// re-searching for the (possibly repeated) trimmed text.
fn trimmed_span(raw: &str) -> (usize, &str) {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return (0, trimmed);
    }
    let leading = raw.len() - raw.trim_start().len();
    (leading, trimmed)
}

fn split_sentences(span: &str, base_offset: usize) -> Vec<SplitMolecule> {
    let bytes = span.as_bytes();
    let mut out = Vec::new();
    let mut start = 0usize;
    let mut i = 0usize;
    while i < bytes.len() {
        if let Some(next_start) = is_sentence_end(bytes, i) {
            let raw = &span[start..=i];
            let (leading, sentence) = trimmed_span(raw);
            if !sentence.is_empty() {
                let local_start = start + leading;
                let local_end = local_start + sentence.len();
                out.push(SplitMolecule {
                    content: sentence.to_string(),
                    r#type: MoleculeType::Prose,
                    start_byte: base_offset + local_start,
                    end_byte: base_offset + local_end,
                });
            }
            start = next_start;
            i = next_start;
            continue;
        }
        i += 1;
    }
    let raw = &span[start..];
    let (leading, tail) = trimmed_span(raw);
    if !tail.is_empty() {
        let local_start = start + leading;
        let local_end = local_start + tail.len();
        out.push(SplitMolecule {
            content: tail.to_string(),
            r#type: MoleculeType::Prose,
            start_byte: base_offset + local_start,
            end_byte: base_offset + local_end,
        });
    }
    out
}

/// Partitions around fenced code blocks, then splits the prose spans
/// between them on sentence boundaries. Fenced spans become single `code`
/// molecules.
fn split_prose(text: &str) -> Vec<SplitMolecule> {
    let mut out = Vec::new();
    let mut cursor = 0usize;

    loop {
        match text[cursor..].find(FENCE) {
            None => {
                out.extend(split_sentences(&text[cursor..], cursor));
                break;
            }
            Some(rel_open) => {
                let open = cursor + rel_open;
                out.extend(split_sentences(&text[cursor..open], cursor));

                let after_open = open + FENCE.len();
                match text[after_open..].find(FENCE) {
                    None => {
                        // Unterminated fence: treat the remainder as one code span.
                        let content = text[open..].to_string();
                        if !content.trim().is_empty() {
                            out.push(SplitMolecule {
                                content,
                                r#type: MoleculeType::Code,
                                start_byte: open,
                                end_byte: text.len(),
                            });
                        }
                        break;
                    }
                    Some(rel_close) => {
                        let close = after_open + rel_close + FENCE.len();
                        let content = text[open..close].to_string();
                        out.push(SplitMolecule {
                            content,
                            r#type: MoleculeType::Code,
                            start_byte: open,
                            end_byte: close,
                        });
                        cursor = close;
                    }
                }
            }
        }
    }

    out
}

// ---------------------------------------------------------------------------
// Code
// ---------------------------------------------------------------------------

/// Walks lines tracking brace depth; emits a molecule when the root depth
/// closes a top-level block or a blank line occurs at root depth.
fn split_code(text: &str) -> Vec<SplitMolecule> {
    let mut out = Vec::new();
    let mut depth: i32 = 0;
    let mut block_start: Option<usize> = None;
    let mut offset = 0usize;

    for line in text.split_inclusive('\n') {
        let line_start = offset;
        offset += line.len();
        let trimmed = line.trim_end_matches('\n');

        let opens = trimmed.matches('{').count() as i32;
        let closes = trimmed.matches('}').count() as i32;
        let was_at_root = depth == 0;
        depth += opens - closes;
        if depth < 0 {
            depth = 0;
        }

        if block_start.is_none() {
            if trimmed.trim().is_empty() {
                continue;
            }
            block_start = Some(line_start);
        }

        let closed_top_level = was_at_root && opens < closes && depth == 0;
        let blank_at_root = depth == 0 && trimmed.trim().is_empty();

        if closed_top_level || blank_at_root {
            if let Some(start) = block_start {
                let content = text[start..offset].trim_end().to_string();
                if !content.is_empty() {
                    let end = start + content.len();
                    out.push(SplitMolecule {
                        content,
                        r#type: MoleculeType::Code,
                        start_byte: start,
                        end_byte: end,
                    });
                }
            }
            block_start = None;
        }
    }

    if let Some(start) = block_start {
        let content = text[start..].trim_end().to_string();
        if !content.is_empty() {
            let end = start + content.len();
            out.push(SplitMolecule {
                content,
                r#type: MoleculeType::Code,
                start_byte: start,
                end_byte: end,
            });
        }
    }

    out
}

// ---------------------------------------------------------------------------
// Data
// ---------------------------------------------------------------------------

/// One molecule per non-empty line.
fn split_data(text: &str) -> Vec<SplitMolecule> {
    let mut out = Vec::new();
    let mut offset = 0usize;
    for line in text.split_inclusive('\n') {
        let start = offset;
        offset += line.len();
        let trimmed = line.trim_end_matches('\n');
        if trimmed.trim().is_empty() {
            continue;
        }
        let end = start + trimmed.len();
        out.push(SplitMolecule {
            content: trimmed.to_string(),
            r#type: MoleculeType::Data,
            start_byte: start,
            end_byte: end,
        });
    }
    out
}

// ---------------------------------------------------------------------------
// Oversize handling
// ---------------------------------------------------------------------------

/// Binary-splits `m` at the largest char boundary whose UTF-8 prefix fits
/// within `max_size` bytes, recursing until every piece fits.
fn enforce_max_size(m: SplitMolecule, max_size: usize) -> Vec<SplitMolecule> {
    if m.content.len() <= max_size || max_size == 0 {
        return vec![m];
    }

    let mut split_at = max_size.min(m.content.len());
    while split_at > 0 && !m.content.is_char_boundary(split_at) {
        split_at -= 1;
    }
    if split_at == 0 {
        return vec![m];
    }

    let left_content = m.content[..split_at].to_string();
    let right_content = m.content[split_at..].to_string();
    let left_end = m.start_byte + left_content.len();

    let left = SplitMolecule {
        content: left_content,
        r#type: m.r#type,
        start_byte: m.start_byte,
        end_byte: left_end,
    };
    let right = SplitMolecule {
        content: right_content,
        r#type: m.r#type,
        start_byte: left_end,
        end_byte: m.end_byte,
    };

    let mut out = enforce_max_size(left, max_size);
    out.extend(enforce_max_size(right, max_size));
    out
}
