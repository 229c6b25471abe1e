//! Paragraph-boundary semantic chunker for narrative text.
//!
//! Splits raw prose into [`Chunk`]s that respect a configurable
//! `max_tokens` budget while keeping the structure and continuity a
//! downstream model needs when it sees chunks one at a time.
//!
//! # Algorithm
//!
//! 1. Normalize line endings and split on blank-line paragraph boundaries.
//! 2. Lift bracket-delimited heading lines (`[Chapter 1]`, `【第一章】`)
//!    out of their paragraph; each heading is a chapter boundary.
//! 3. Accumulate paragraphs until adding the next one would exceed
//!    `max_tokens`, then flush the buffer as a chunk. A chapter heading
//!    flushes the buffer first when `split_on_chapters` is set.
//! 4. A paragraph larger than the budget is split at sentence
//!    terminators, then at whitespace, then at character boundaries.
//! 5. Every chunk after the first receives a `prev_context` excerpt
//!    taken from the tail of the previous chunk.
//! 6. Metadata (characters, scene hint, chunk type, importance) is
//!    extracted per chunk when `extract_metadata` is set.
//!
//! Token counts are estimated as `CJK chars + ceil(latin words × 1.3)`.
//!
//! # Example
//!
//! ```rust
//! use narrative_forge_core::chunk::{chunk_text, ChunkerConfig};
//!
//! let chunks = chunk_text("[Chapter 1]\n\nIt began to rain.", &ChunkerConfig::default());
//! assert_eq!(chunks.len(), 1);
//! assert!(chunks[0].has_chapter_boundary());
//! ```

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::models::{Boundary, BoundaryKind, Chunk, ChunkMetadata, ChunkType};

pub const DEFAULT_MAX_TOKENS: usize = 500;
pub const DEFAULT_CONTEXT_CHARS: usize = 100;

const LATIN_WORD_WEIGHT: f64 = 1.3;
const BASE_IMPORTANCE: usize = 3;
const MAX_IMPORTANCE: usize = 10;

static PARAGRAPH_BREAK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n[ \t\u{3000}]*\n").expect("valid paragraph regex"));

static HEADING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:\[([^\[\]\n]+)\]|【([^【】\n]+)】|〔([^〔〕\n]+)〕)\s*$")
        .expect("valid heading regex")
});

static SPEAKER_BEFORE_VERB: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\b([A-Z][a-z]+(?: [A-Z][a-z]+)?) (?:said|asked|replied|shouted|whispered|cried|answered|muttered|yelled|exclaimed)\b",
    )
    .expect("valid speaker regex")
});

static VERB_BEFORE_SPEAKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\b(?:said|asked|replied|shouted|whispered|cried|answered|muttered|yelled|exclaimed) ([A-Z][a-z]+)\b",
    )
    .expect("valid speaker regex")
});

static CJK_SPEAKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\p{Han}{2,3}?)(?:笑道|问道|说道|喊道|说|道|问|喊|答)[：:，,]?[“「\x22]")
        .expect("valid cjk speaker regex")
});

const SPEECH_VERBS: &[&str] = &[
    "said", "asked", "replied", "shouted", "whispered", "cried", "answered", "muttered",
    "yelled", "exclaimed", "说", "道", "问", "喊", "答", "叫",
];

const QUOTE_CHARS: &[char] = &['"', '“', '”', '「', '」', '『', '』'];

const NON_NAMES: &[&str] = &[
    "He", "She", "It", "They", "We", "You", "I", "The", "Then", "But", "And", "Someone",
    "Everyone", "Nobody", "This", "That",
];

const NON_NAME_LEADS: &[char] = &[
    '他', '她', '它', '我', '你', '们', '对', '和', '在', '是', '了', '就', '也', '都', '又',
    '这', '那', '便', '却',
];

const SCENE_KEYWORDS: &[(&str, &str)] = &[
    ("battlefield", "battlefield"),
    ("战场", "battlefield"),
    ("forest", "forest"),
    ("woods", "forest"),
    ("森林", "forest"),
    ("castle", "castle"),
    ("城堡", "castle"),
    ("palace", "palace"),
    ("宫殿", "palace"),
    ("village", "village"),
    ("村庄", "village"),
    ("city", "city"),
    ("城市", "city"),
    ("street", "street"),
    ("街道", "street"),
    ("tavern", "tavern"),
    ("酒馆", "tavern"),
    ("school", "school"),
    ("学校", "school"),
    ("mountain", "mountain"),
    ("山上", "mountain"),
    ("sea", "sea"),
    ("ocean", "sea"),
    ("大海", "sea"),
    ("room", "interior"),
    ("house", "interior"),
    ("房间", "interior"),
    ("night", "night"),
    ("夜晚", "night"),
    ("深夜", "night"),
];

const ACTION_WORDS: &[&str] = &[
    "ran", "jumped", "struck", "fought", "grabbed", "rushed", "slashed", "fled", "charged",
    "attacked", "dodged", "swung", "kicked", "punched", "fired", "leapt", "stabbed", "冲", "跑",
    "砍", "刺", "跳", "抓", "躲", "击",
];

const CONFLICT_WORDS: &[&str] = &[
    "fight", "battle", "kill", "war", "betray", "enemy", "blood", "death", "attack", "threat",
    "danger", "conflict", "revenge", "战斗", "杀", "死", "血", "敌人", "仇", "背叛", "危险",
    "冲突",
];

const CLIMAX_WORDS: &[&str] = &[
    "finally", "suddenly", "reveal", "truth", "secret", "destiny", "climax", "sacrifice",
    "终于", "突然", "真相", "秘密", "命运", "牺牲",
];

/// Chunker configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkerConfig {
    /// Token budget per chunk.
    pub max_tokens: usize,
    /// Extract characters, scene hint, chunk type and importance.
    pub extract_metadata: bool,
    /// Length in characters of the `prev_context` excerpt.
    pub context_chars: usize,
    /// Start a new chunk at every chapter heading.
    pub split_on_chapters: bool,
    /// Character names matched literally in addition to speech patterns.
    pub known_characters: Vec<String>,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            max_tokens: DEFAULT_MAX_TOKENS,
            extract_metadata: true,
            context_chars: DEFAULT_CONTEXT_CHARS,
            split_on_chapters: true,
            known_characters: Vec::new(),
        }
    }
}

/// Returns true for Han, kana and hangul characters.
pub fn is_cjk(c: char) -> bool {
    matches!(c as u32,
        0x3040..=0x30FF
        | 0x3400..=0x4DBF
        | 0x4E00..=0x9FFF
        | 0xAC00..=0xD7AF
        | 0xF900..=0xFAFF
        | 0x20000..=0x2A6DF)
}

/// Count `(cjk_chars, latin_words)` in `text`.
fn count_units(text: &str) -> (usize, usize) {
    let mut cjk = 0;
    let mut words = 0;
    let mut in_word = false;
    for c in text.chars() {
        if is_cjk(c) {
            cjk += 1;
            in_word = false;
        } else if c.is_alphanumeric() {
            if !in_word {
                words += 1;
                in_word = true;
            }
        } else if in_word && matches!(c, '\'' | '’' | '-') {
            continue;
        } else {
            in_word = false;
        }
    }
    (cjk, words)
}

/// Estimate the token count of `text`: CJK chars + ceil(latin words × 1.3).
pub fn estimate_tokens(text: &str) -> usize {
    let (cjk, words) = count_units(text);
    cjk + (words as f64 * LATIN_WORD_WEIGHT).ceil() as usize
}

/// Word count where every CJK character counts as one word.
pub fn word_count(text: &str) -> usize {
    let (cjk, words) = count_units(text);
    cjk + words
}

/// A unit of input fed to the accumulator.
enum Piece {
    Heading { line: String, title: String },
    /// Text plus whether it continues the previous piece's paragraph.
    Text { text: String, continues: bool },
}

struct ChunkBuilder<'a> {
    config: &'a ChunkerConfig,
    chunks: Vec<Chunk>,
    content: String,
    boundaries: Vec<Boundary>,
    tokens: usize,
    has_text: bool,
}

impl<'a> ChunkBuilder<'a> {
    fn new(config: &'a ChunkerConfig) -> Self {
        Self {
            config,
            chunks: Vec::new(),
            content: String::new(),
            boundaries: Vec::new(),
            tokens: 0,
            has_text: false,
        }
    }

    fn push(&mut self, piece: Piece) {
        match piece {
            Piece::Heading { line, title } => {
                if self.config.split_on_chapters && self.has_text {
                    self.flush();
                }
                self.append(&line, false);
                let position = self.content.chars().count() - line.chars().count();
                self.boundaries.push(Boundary {
                    kind: BoundaryKind::Chapter,
                    position,
                    title,
                });
            }
            Piece::Text { text, continues } => {
                let tokens = estimate_tokens(&text);
                if self.has_text && self.tokens + tokens > self.config.max_tokens {
                    self.flush();
                }
                // A continuation that starts a fresh chunk is not glued to anything.
                let continues = continues && self.has_text;
                self.append(&text, continues);
                self.has_text = true;
            }
        }
    }

    fn append(&mut self, text: &str, continues: bool) {
        if !self.content.is_empty() && !continues {
            self.content.push_str("\n\n");
        }
        self.content.push_str(text);
        self.tokens += estimate_tokens(text);
    }

    fn flush(&mut self) {
        let content = self.content.trim_end().to_string();
        self.content.clear();
        self.tokens = 0;
        self.has_text = false;
        let boundaries = std::mem::take(&mut self.boundaries);
        if content.trim().is_empty() {
            return;
        }

        let prev_context = self
            .chunks
            .last()
            .map(|prev| tail_excerpt(&prev.content, self.config.context_chars))
            .unwrap_or_default();

        let metadata = if self.config.extract_metadata {
            extract_metadata(&content, &self.config.known_characters)
        } else {
            ChunkMetadata {
                word_count: word_count(&content),
                ..ChunkMetadata::default()
            }
        };

        let index = self.chunks.len();
        self.chunks.push(Chunk {
            id: format!("chunk_{index}"),
            content,
            prev_context,
            boundaries,
            metadata,
        });
    }

    fn finish(mut self) -> Vec<Chunk> {
        self.flush();
        self.chunks
    }
}

/// Split narrative text into chunks.
///
/// # Guarantees
///
/// - Chunk order follows source order; ids are `chunk_0 … chunk_{N-1}`.
/// - Every chunk except the first has a non-empty `prev_context`.
/// - No chunk exceeds `max_tokens` unless a single unsplittable unit
///   (one CJK character or one word) does.
/// - Empty or whitespace-only input yields no chunks.
pub fn chunk_text(text: &str, config: &ChunkerConfig) -> Vec<Chunk> {
    let normalized = text.replace("\r\n", "\n");
    let max_tokens = config.max_tokens.max(1);
    let mut builder = ChunkBuilder::new(config);

    for paragraph in PARAGRAPH_BREAK.split(&normalized) {
        for piece in paragraph_pieces(paragraph, max_tokens) {
            builder.push(piece);
        }
    }

    let chunks = builder.finish();
    tracing::debug!(
        chunks = chunks.len(),
        max_tokens,
        chars = normalized.chars().count(),
        "chunked narrative text"
    );
    chunks
}

/// Break one paragraph into heading and text pieces.
fn paragraph_pieces(paragraph: &str, max_tokens: usize) -> Vec<Piece> {
    let mut pieces = Vec::new();
    let mut text_lines: Vec<&str> = Vec::new();

    for line in paragraph.lines() {
        if let Some(caps) = HEADING.captures(line) {
            flush_text(&mut text_lines, &mut pieces, max_tokens);
            let title = caps
                .iter()
                .skip(1)
                .flatten()
                .next()
                .map(|m| m.as_str().trim().to_string())
                .unwrap_or_default();
            pieces.push(Piece::Heading {
                line: line.trim().to_string(),
                title,
            });
        } else {
            text_lines.push(line);
        }
    }
    flush_text(&mut text_lines, &mut pieces, max_tokens);
    pieces
}

fn flush_text(lines: &mut Vec<&str>, pieces: &mut Vec<Piece>, max_tokens: usize) {
    let joined = lines.join("\n");
    lines.clear();
    let trimmed = joined.trim();
    if trimmed.is_empty() {
        return;
    }
    if estimate_tokens(trimmed) <= max_tokens {
        pieces.push(Piece::Text {
            text: trimmed.to_string(),
            continues: false,
        });
    } else {
        for (i, part) in split_oversized(trimmed, max_tokens).into_iter().enumerate() {
            pieces.push(Piece::Text {
                text: part,
                continues: i > 0,
            });
        }
    }
}

/// Split an oversized paragraph into parts of at most `max_tokens`.
///
/// Parts keep their trailing whitespace so that gluing them back
/// together reproduces the paragraph.
fn split_oversized(text: &str, max_tokens: usize) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();

    for sentence in split_sentences(text) {
        let candidate_tokens = estimate_tokens(&current) + estimate_tokens(sentence);
        if !current.is_empty() && candidate_tokens > max_tokens {
            parts.push(std::mem::take(&mut current));
        }
        if estimate_tokens(sentence) > max_tokens {
            let mut hard = hard_split(sentence, max_tokens);
            if let Some(last) = hard.pop() {
                parts.extend(hard);
                current = last;
            }
        } else {
            current.push_str(sentence);
        }
    }
    if !current.trim().is_empty() {
        parts.push(current);
    }
    parts
}

/// Split after sentence terminators, keeping closing quotes and
/// trailing whitespace with the sentence they end.
fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();

    while let Some((_, c)) = chars.next() {
        if !matches!(c, '.' | '!' | '?' | '。' | '！' | '？' | '…') {
            continue;
        }
        while let Some(&(_, next)) = chars.peek() {
            if matches!(next, '.' | '!' | '?' | '。' | '！' | '？' | '…')
                || QUOTE_CHARS.contains(&next)
                || matches!(next, '\'' | '’' | '」' | '』')
            {
                chars.next();
            } else {
                break;
            }
        }
        while let Some(&(_, next)) = chars.peek() {
            if next.is_whitespace() {
                chars.next();
            } else {
                break;
            }
        }
        let end = chars.peek().map(|&(i, _)| i).unwrap_or(text.len());
        if end > start {
            sentences.push(&text[start..end]);
            start = end;
        }
    }
    if start < text.len() {
        sentences.push(&text[start..]);
    }
    sentences
}

/// Split a single over-budget sentence at word or character boundaries.
fn hard_split(text: &str, max_tokens: usize) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut cjk = 0usize;
    let mut words = 0usize;
    let mut in_word = false;

    let tokens = |cjk: usize, words: usize| cjk + (words as f64 * LATIN_WORD_WEIGHT).ceil() as usize;

    for c in text.chars() {
        let starts_unit = is_cjk(c) || (c.is_alphanumeric() && !in_word);
        if starts_unit {
            let (next_cjk, next_words) = if is_cjk(c) {
                (cjk + 1, words)
            } else {
                (cjk, words + 1)
            };
            if !current.is_empty() && tokens(next_cjk, next_words) > max_tokens {
                parts.push(std::mem::take(&mut current));
                cjk = 0;
                words = 0;
            }
            if is_cjk(c) {
                cjk += 1;
                in_word = false;
            } else {
                words += 1;
                in_word = true;
            }
        } else if !(c.is_alphanumeric() || (in_word && matches!(c, '\'' | '’' | '-'))) {
            in_word = false;
        }
        current.push(c);
    }
    if !current.is_empty() {
        parts.push(current);
    }
    parts
}

/// Take the last `max_chars` characters of `content`, snapped forward to
/// the next sentence start when one lies inside the excerpt.
fn tail_excerpt(content: &str, max_chars: usize) -> String {
    let max_chars = max_chars.max(1);
    let total = content.chars().count();
    let skip = total.saturating_sub(max_chars);
    let tail: String = content.chars().skip(skip).collect();
    if skip == 0 {
        return tail.trim().to_string();
    }

    let snapped = split_sentences(&tail)
        .first()
        .filter(|first| {
            let first = first.trim_end();
            first.ends_with(|c: char| {
                matches!(c, '.' | '!' | '?' | '。' | '！' | '？' | '…')
                    || QUOTE_CHARS.contains(&c)
            })
        })
        .map(|first| tail[first.len()..].trim().to_string())
        .filter(|rest| !rest.is_empty());

    snapped.unwrap_or_else(|| tail.trim().to_string())
}

/// Extract chunk metadata from its content.
pub fn extract_metadata(content: &str, known_characters: &[String]) -> ChunkMetadata {
    let lower = content.to_lowercase();
    let characters = detect_characters(content, known_characters);
    let chunk_type = classify_chunk(content, &lower);

    let conflict = count_keywords(&lower, CONFLICT_WORDS);
    let climax = count_keywords(&lower, CLIMAX_WORDS);
    let mut importance = BASE_IMPORTANCE + conflict + climax * 2;
    if chunk_type == ChunkType::Dialogue {
        importance += 1;
    }

    ChunkMetadata {
        characters,
        scene_hint: scene_hint(&lower),
        importance: importance.min(MAX_IMPORTANCE) as u8,
        word_count: word_count(content),
        chunk_type,
    }
}

fn detect_characters(content: &str, known: &[String]) -> Vec<String> {
    let mut found: Vec<(usize, String)> = Vec::new();

    for name in known.iter().filter(|n| !n.trim().is_empty()) {
        if let Some(pos) = content.find(name.as_str()) {
            found.push((pos, name.clone()));
        }
    }
    for caps in SPEAKER_BEFORE_VERB.captures_iter(content) {
        if let Some(m) = caps.get(1) {
            found.push((m.start(), m.as_str().to_string()));
        }
    }
    for caps in VERB_BEFORE_SPEAKER.captures_iter(content) {
        if let Some(m) = caps.get(1) {
            found.push((m.start(), m.as_str().to_string()));
        }
    }
    for caps in CJK_SPEAKER.captures_iter(content) {
        if let Some(m) = caps.get(1) {
            found.push((m.start(), m.as_str().to_string()));
        }
    }

    found.sort_by_key(|(pos, _)| *pos);
    let mut names: Vec<String> = Vec::new();
    for (_, name) in found {
        let plausible = !NON_NAMES.contains(&name.as_str())
            && !name.starts_with(|c: char| NON_NAME_LEADS.contains(&c));
        if plausible && !names.contains(&name) {
            names.push(name);
        }
    }
    names
}

fn scene_hint(lower: &str) -> Option<String> {
    SCENE_KEYWORDS
        .iter()
        .filter_map(|(keyword, hint)| find_keyword(lower, keyword).map(|pos| (pos, *hint)))
        .min_by_key(|(pos, _)| *pos)
        .map(|(_, hint)| hint.to_string())
}

fn classify_chunk(content: &str, lower: &str) -> ChunkType {
    let paragraphs: Vec<&str> = PARAGRAPH_BREAK
        .split(content)
        .map(str::trim)
        .filter(|p| !p.is_empty() && !HEADING.is_match(p))
        .collect();
    if paragraphs.is_empty() {
        return ChunkType::Description;
    }

    let dialogue = paragraphs
        .iter()
        .filter(|p| {
            let p_lower = p.to_lowercase();
            p.contains(QUOTE_CHARS) && SPEECH_VERBS.iter().any(|v| find_keyword(&p_lower, v).is_some())
        })
        .count();
    if dialogue > 0 && dialogue * 2 >= paragraphs.len() {
        return ChunkType::Dialogue;
    }

    let action_hits = count_keywords(lower, ACTION_WORDS);
    let words = word_count(content).max(1);
    if action_hits >= 3 && action_hits as f64 / words as f64 >= 0.02 {
        return ChunkType::Action;
    }
    ChunkType::Description
}

/// Number of distinct keywords present in `lower`.
fn count_keywords(lower: &str, keywords: &[&str]) -> usize {
    keywords
        .iter()
        .filter(|k| find_keyword(lower, k).is_some())
        .count()
}

/// Byte position of `keyword` in `lower`. Latin keywords must start at a
/// word boundary; CJK keywords match anywhere.
fn find_keyword(lower: &str, keyword: &str) -> Option<usize> {
    if keyword.chars().next().is_some_and(is_cjk) {
        return lower.find(keyword);
    }
    lower.match_indices(keyword).map(|(i, _)| i).find(|&i| {
        lower[..i]
            .chars()
            .next_back()
            .map_or(true, |prev| !prev.is_alphanumeric())
    })
}

/// Coalesce chunks shorter than `min_size` characters into a neighbour.
///
/// A short chunk merges into the chunk before it; a short first chunk
/// absorbs the chunk after it. Order is preserved and the surviving
/// chunk keeps its id and `prev_context`.
pub fn merge_small_chunks(chunks: Vec<Chunk>, min_size: usize) -> Vec<Chunk> {
    let mut merged: Vec<Chunk> = Vec::with_capacity(chunks.len());
    for chunk in chunks {
        match merged.last_mut() {
            Some(prev) if chunk.char_len() < min_size || prev.char_len() < min_size => {
                absorb(prev, chunk);
            }
            _ => merged.push(chunk),
        }
    }
    merged
}

fn absorb(into: &mut Chunk, next: Chunk) {
    let offset = into.char_len() + 2;
    let into_longer = into.char_len() >= next.char_len();

    into.content.push_str("\n\n");
    into.content.push_str(&next.content);
    into.boundaries.extend(next.boundaries.into_iter().map(|b| Boundary {
        position: b.position + offset,
        ..b
    }));

    let meta = &mut into.metadata;
    for name in next.metadata.characters {
        if !meta.characters.contains(&name) {
            meta.characters.push(name);
        }
    }
    if meta.scene_hint.is_none() {
        meta.scene_hint = next.metadata.scene_hint;
    }
    meta.importance = meta.importance.max(next.metadata.importance);
    meta.word_count += next.metadata.word_count;
    if !into_longer {
        meta.chunk_type = next.metadata.chunk_type;
    }
}

/// Find the chunk covering character `offset`, counting characters over
/// the concatenation of chunk contents in order.
pub fn get_chunk_at_position(chunks: &[Chunk], offset: usize) -> Option<&Chunk> {
    let mut start = 0;
    for chunk in chunks {
        let end = start + chunk.char_len();
        if offset < end {
            return Some(chunk);
        }
        start = end;
    }
    None
}
