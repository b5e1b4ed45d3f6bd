use std::collections::{BTreeMap, HashSet};
use std::panic::{self, AssertUnwindSafe};

use async_trait::async_trait;
use once_cell::sync::Lazy;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Data structures
// ---------------------------------------------------------------------------

/// Category of a detected writing issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueType {
    Grammar,
    Spelling,
    Punctuation,
    Style,
    Clarity,
    Vocabulary,
}

impl IssueType {
    pub const ALL: [IssueType; 6] = [
        IssueType::Grammar,
        IssueType::Spelling,
        IssueType::Punctuation,
        IssueType::Style,
        IssueType::Clarity,
        IssueType::Vocabulary,
    ];

    pub fn label(self) -> &'static str {
        match self {
            IssueType::Grammar => "Grammar",
            IssueType::Spelling => "Spelling",
            IssueType::Punctuation => "Punctuation",
            IssueType::Style => "Style",
            IssueType::Clarity => "Clarity",
            IssueType::Vocabulary => "Vocabulary",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueSeverity {
    Critical,
    Major,
    Minor,
    Suggestion,
}

impl IssueSeverity {
    pub const ALL: [IssueSeverity; 4] = [
        IssueSeverity::Critical,
        IssueSeverity::Major,
        IssueSeverity::Minor,
        IssueSeverity::Suggestion,
    ];

    pub fn label(self) -> &'static str {
        match self {
            IssueSeverity::Critical => "critical",
            IssueSeverity::Major => "major",
            IssueSeverity::Minor => "minor",
            IssueSeverity::Suggestion => "suggestion",
        }
    }
}

/// One located problem inside a block.
///
/// `start_index`/`end_index` are half-open byte offsets into the block's
/// original text, always on char boundaries, so
/// `&block.text[start_index..end_index] == original` holds. Issues are stored
/// in discovery order; renderers should sort by `start_index` before use.
#[derive(Debug, Clone, Serialize)]
pub struct TextIssue {
    pub id: String,
    #[serde(rename = "type")]
    pub issue_type: IssueType,
    pub severity: IssueSeverity,
    pub original: String,
    pub suggestion: String,
    pub explanation: String,
    pub start_index: usize,
    pub end_index: usize,
}

/// One paragraph of the analyzed text, with its aligned rewrite (when a
/// confident match was found) and the issues discovered for it.
#[derive(Debug, Clone, Serialize)]
pub struct TextBlock {
    pub id: String,
    pub text: String,
    pub corrected: Option<String>,
    pub issues: Vec<TextIssue>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TextMetrics {
    pub readability_score: i32,
    pub grammar_score: i32,
    pub clarity_score: i32,
    pub vocabulary_score: i32,
    pub style_consistency_score: i32,
    pub sentence_variety_score: i32,
    pub issues_by_type: BTreeMap<IssueType, usize>,
    pub issues_by_severity: BTreeMap<IssueSeverity, usize>,
    pub ielts_estimate: Option<f64>,
    pub professor_feedback: String,
}

/// The complete result of one analysis call. Paragraph order matches the
/// input; every call produces a fresh, independent instance.
#[derive(Debug, Clone, Serialize)]
pub struct TextAnalysisResult {
    pub blocks: Vec<TextBlock>,
    pub metrics: TextMetrics,
    pub overall_score: i32,
    pub ielts_feedback: Option<String>,
}

// ---------------------------------------------------------------------------
// Hyperparameters
// ---------------------------------------------------------------------------

struct Hyperparameters {
    alignment_threshold: f64,
    tokens_per_issue: usize,
    issue_cap_min: usize,
    issue_cap_max: usize,
    token_distance_min: usize,
    phrase_distance_min: usize,
    short_token_len: usize,
    minor_substring_min_len: usize,
    restructure_min_issues: usize,
    restructure_length_divisor: usize,
    baseline_floor: i32,
    issue_cost: i32,
    effective_length_floor: usize,
    density_chars_basis: f64,
    grammar_weight: f64,
    grammar_cap: f64,
    clarity_weight: f64,
    clarity_cap: f64,
    vocabulary_weight: f64,
    vocabulary_cap: f64,
    style_weight: f64,
    style_cap: f64,
    readability_grammar_weight: f64,
    readability_clarity_weight: f64,
    readability_punctuation_weight: f64,
    readability_cap: f64,
    grammar_flag_penalty: i32,
    grammar_praise_bonus: i32,
    clarity_flag_penalty: i32,
    clarity_praise_bonus: i32,
    vocabulary_flag_penalty: i32,
    vocabulary_praise_bonus: i32,
    style_flag_penalty: i32,
    style_praise_bonus: i32,
    cohesive_bonus: i32,
    well_structured_bonus: i32,
    hard_to_follow_penalty: i32,
    confusing_penalty: i32,
    variety_min_sentences: usize,
    variety_sparse_score: i32,
    variety_std_lo: f64,
    variety_std_hi: f64,
    variety_std_bonus: i32,
    variety_uniform_std: f64,
    variety_uniform_penalty: i32,
    variety_ragged_std: f64,
    variety_ragged_penalty: i32,
    variety_opener_hi: f64,
    variety_opener_bonus: i32,
    variety_opener_lo: f64,
    variety_opener_penalty: i32,
    variety_varied_bonus: i32,
    variety_repetitive_penalty: i32,
    score_jitter: f64,
    score_floor: i32,
    score_ceiling: i32,
    overall_grammar_weight: f64,
    overall_clarity_weight: f64,
    overall_readability_weight: f64,
    overall_vocabulary_weight: f64,
    overall_style_weight: f64,
    weak_score_threshold: i32,
    weak_grammar_penalty_rate: f64,
    weak_grammar_penalty_cap: f64,
    weak_clarity_penalty_rate: f64,
    weak_clarity_penalty_cap: f64,
    band_min: f64,
    band_max: f64,
    band_scale: f64,
    local_score_weight: f64,
    band_score_weight: f64,
    neutral_score: i32,
    degraded_base_score: i32,
    degraded_words_per_point: usize,
    degraded_length_bonus_cap: i32,
    degraded_issue_cost: i32,
    degraded_issue_penalty_cap: i32,
}

static HP: Hyperparameters = Hyperparameters {
    alignment_threshold: 0.4,
    tokens_per_issue: 15,
    issue_cap_min: 2,
    issue_cap_max: 5,
    token_distance_min: 1,
    phrase_distance_min: 2,
    short_token_len: 3,
    minor_substring_min_len: 3,
    restructure_min_issues: 2,
    restructure_length_divisor: 10,
    baseline_floor: 50,
    issue_cost: 5,
    effective_length_floor: 100,
    density_chars_basis: 1000.0,
    grammar_weight: 3.0,
    grammar_cap: 35.0,
    clarity_weight: 4.0,
    clarity_cap: 40.0,
    vocabulary_weight: 2.5,
    vocabulary_cap: 30.0,
    style_weight: 2.0,
    style_cap: 30.0,
    readability_grammar_weight: 2.5,
    readability_clarity_weight: 3.0,
    readability_punctuation_weight: 1.0,
    readability_cap: 30.0,
    grammar_flag_penalty: 12,
    grammar_praise_bonus: 8,
    clarity_flag_penalty: 12,
    clarity_praise_bonus: 8,
    vocabulary_flag_penalty: 10,
    vocabulary_praise_bonus: 6,
    style_flag_penalty: 10,
    style_praise_bonus: 6,
    cohesive_bonus: 8,
    well_structured_bonus: 5,
    hard_to_follow_penalty: 10,
    confusing_penalty: 8,
    variety_min_sentences: 3,
    variety_sparse_score: 55,
    variety_std_lo: 15.0,
    variety_std_hi: 30.0,
    variety_std_bonus: 10,
    variety_uniform_std: 10.0,
    variety_uniform_penalty: 10,
    variety_ragged_std: 40.0,
    variety_ragged_penalty: 8,
    variety_opener_hi: 0.7,
    variety_opener_bonus: 8,
    variety_opener_lo: 0.4,
    variety_opener_penalty: 8,
    variety_varied_bonus: 8,
    variety_repetitive_penalty: 10,
    score_jitter: 1.5,
    score_floor: 30,
    score_ceiling: 95,
    overall_grammar_weight: 0.25,
    overall_clarity_weight: 0.25,
    overall_readability_weight: 0.20,
    overall_vocabulary_weight: 0.15,
    overall_style_weight: 0.15,
    weak_score_threshold: 50,
    weak_grammar_penalty_rate: 0.75,
    weak_grammar_penalty_cap: 15.0,
    weak_clarity_penalty_rate: 0.5,
    weak_clarity_penalty_cap: 10.0,
    band_min: 1.0,
    band_max: 9.0,
    band_scale: 9.0,
    local_score_weight: 0.2,
    band_score_weight: 0.8,
    neutral_score: 70,
    degraded_base_score: 60,
    degraded_words_per_point: 40,
    degraded_length_bonus_cap: 15,
    degraded_issue_cost: 2,
    degraded_issue_penalty_cap: 15,
};

// ---------------------------------------------------------------------------
// Compiled patterns
// ---------------------------------------------------------------------------

static PARAGRAPH_SPLIT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n(?:\s*\n)+").unwrap());

// Words separated by whitespace; sentence punctuation and brackets survive as
// single-character tokens so both token streams keep the same positions.
static TOKEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"[^\s.,!?;:"'()\[\]{}]+|[.,!?;:"'()\[\]{}]"#).unwrap());

static PUNCT_TOKEN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r#"^[.,!?;:"'()\[\]{}]+$"#).unwrap());

static SENTENCE_SPLIT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[.!?]+").unwrap());

static WORD_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\w+").unwrap());

static CORRECTED_SECTION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)##\s*corrected text:?\s*([^#]*)").unwrap());

static ERROR_SECTION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)##\s*critical error analysis:?\s*([^#]*)").unwrap());

static ASSESSMENT_SECTION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)##\s*language assessment:?\s*([^#]*)").unwrap());

static BAND_ESTIMATE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)overall band estimate:?\s*(\d+(?:\.\d+)?)").unwrap());

// ---------------------------------------------------------------------------
// Feedback input
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum FeedbackError {
    #[error("feedback provider unavailable: {0}")]
    Unavailable(String),
    #[error("feedback response was empty")]
    Empty,
}

/// Externally produced feedback for one text: a corrected rewrite plus
/// narrative commentary. Every field is optional; missing structured fields
/// are recovered from `full_narrative` where possible.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Feedback {
    pub corrected_text: Option<String>,
    pub error_analysis: Option<String>,
    pub assessment: Option<String>,
    pub full_narrative: Option<String>,
    pub band_estimate: Option<f64>,
}

impl Feedback {
    /// Extract the structured sections and the band estimate from a raw
    /// narrative. Section headers match case-insensitively, with or without
    /// a trailing colon. Band estimates outside 1.0..=9.0 are dropped.
    pub fn parse(narrative: &str) -> Feedback {
        let section = |re: &Regex| {
            re.captures(narrative)
                .map(|caps| caps[1].trim().to_string())
                .filter(|s| !s.is_empty())
        };
        let band = BAND_ESTIMATE_RE
            .captures(narrative)
            .and_then(|caps| caps[1].parse::<f64>().ok())
            .filter(|b| (HP.band_min..=HP.band_max).contains(b));
        Feedback {
            corrected_text: section(&CORRECTED_SECTION_RE),
            error_analysis: section(&ERROR_SECTION_RE),
            assessment: section(&ASSESSMENT_SECTION_RE),
            full_narrative: Some(narrative.to_string()),
            band_estimate: band,
        }
    }

    /// Fill any missing structured field from the raw narrative and validate
    /// the band estimate.
    fn resolved(mut self) -> Feedback {
        if let Some(narrative) = self.full_narrative.clone() {
            let parsed = Feedback::parse(&narrative);
            self.corrected_text = self.corrected_text.or(parsed.corrected_text);
            self.error_analysis = self.error_analysis.or(parsed.error_analysis);
            self.assessment = self.assessment.or(parsed.assessment);
            self.band_estimate = self.band_estimate.or(parsed.band_estimate);
        }
        self.band_estimate = self
            .band_estimate
            .filter(|b| (HP.band_min..=HP.band_max).contains(b));
        self
    }
}

/// The external collaborator that produces the corrected rewrite and the
/// narrative feedback. The engine never calls a model itself; it only
/// consumes this trait.
#[async_trait]
pub trait FeedbackProvider: Send + Sync {
    async fn fetch_feedback(&self, text: &str) -> Result<Feedback, FeedbackError>;
}

/// A provider that returns a fixed, pre-fetched feedback payload. Used by
/// the CLI (file-backed feedback) and by tests.
#[derive(Debug, Clone)]
pub struct StaticFeedback(pub Feedback);

#[async_trait]
impl FeedbackProvider for StaticFeedback {
    async fn fetch_feedback(&self, _text: &str) -> Result<Feedback, FeedbackError> {
        Ok(self.0.clone())
    }
}

// ---------------------------------------------------------------------------
// Segmentation
// ---------------------------------------------------------------------------

fn split_paragraphs(text: &str) -> Vec<String> {
    PARAGRAPH_SPLIT_RE
        .split(text)
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}

fn tokenize(text: &str) -> Vec<&str> {
    TOKEN_RE.find_iter(text).map(|m| m.as_str()).collect()
}

fn word_set(text: &str) -> HashSet<String> {
    WORD_RE
        .find_iter(&text.to_lowercase())
        .map(|m| m.as_str().to_string())
        .collect()
}

fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

// ---------------------------------------------------------------------------
// String distances
// ---------------------------------------------------------------------------

fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }
    let mut prev: Vec<usize> = (0..=a.len()).collect();
    let mut curr = vec![0usize; a.len() + 1];
    for (j, bc) in b.iter().enumerate() {
        curr[0] = j + 1;
        for (i, ac) in a.iter().enumerate() {
            let cost = usize::from(ac != bc);
            curr[i + 1] = (curr[i] + 1).min(prev[i + 1] + 1).min(prev[i] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[a.len()]
}

fn common_prefix_len(a: &str, b: &str) -> usize {
    a.chars().zip(b.chars()).take_while(|(x, y)| x == y).count()
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    let matches = a.intersection(b).count();
    let union = a.len() + b.len() - matches;
    if union == 0 {
        0.0
    } else {
        matches as f64 / union as f64
    }
}

// ---------------------------------------------------------------------------
// Block alignment
// ---------------------------------------------------------------------------

/// One corrected slot per original block. Positional when the paragraph
/// counts agree; otherwise each original block independently takes the most
/// similar corrected segment, or an empty slot when nothing clears the
/// similarity threshold. Two blocks may select the same segment.
fn align_corrected_blocks(originals: &[String], corrected_text: &str) -> Vec<String> {
    let segments = split_paragraphs(corrected_text);
    if segments.len() == originals.len() {
        return segments;
    }
    if originals.len() == 1 {
        return vec![corrected_text.trim().to_string()];
    }

    let segment_sets: Vec<HashSet<String>> = segments.iter().map(|s| word_set(s)).collect();
    originals
        .iter()
        .map(|original| {
            let original_set = word_set(original);
            let mut best_score = 0.0;
            let mut best: Option<&String> = None;
            for (segment, segment_set) in segments.iter().zip(&segment_sets) {
                let score = jaccard(&original_set, segment_set);
                if score > best_score {
                    best_score = score;
                    best = Some(segment);
                }
            }
            if best_score > HP.alignment_threshold {
                best.cloned().unwrap_or_default()
            } else {
                String::new()
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Change detection
// ---------------------------------------------------------------------------

/// Pairs that differ only trivially (case, naive plural, near-substring) are
/// never reported. The substring clause only applies to words of 3+ chars so
/// short-word corrections like "a" vs "an" stay visible.
fn is_minor_variant(a: &str, b: &str) -> bool {
    let a_lower = a.to_lowercase();
    let b_lower = b.to_lowercase();
    if a_lower == b_lower {
        return true;
    }
    if format!("{a_lower}s") == b_lower || a_lower == format!("{b_lower}s") {
        return true;
    }
    let a_len = a_lower.chars().count();
    let b_len = b_lower.chars().count();
    a_len.min(b_len) >= HP.minor_substring_min_len
        && a_len.abs_diff(b_len) <= 1
        && (a_lower.contains(&b_lower) || b_lower.contains(&a_lower))
}

fn is_sentence_punct(c: char) -> bool {
    matches!(c, '.' | ',' | '!' | '?' | ';' | ':')
}

/// First matching rule wins.
fn determine_issue_type(original: &str, corrected: &str) -> IssueType {
    if original.chars().any(is_sentence_punct) || corrected.chars().any(is_sentence_punct) {
        return IssueType::Punctuation;
    }

    let orig_lower = original.to_lowercase();
    let corr_lower = corrected.to_lowercase();
    let orig_len = orig_lower.chars().count();
    let corr_len = corr_lower.chars().count();
    let prefix = common_prefix_len(&orig_lower, &corr_lower);

    // Single-typo corrections share most of their leading characters; the
    // prefix-of clause covers words too short to have a meaningful prefix.
    if (prefix > 2 && prefix * 2 > orig_len)
        || (orig_lower != corr_lower
            && orig_len.abs_diff(corr_len) <= 2
            && (corr_lower.starts_with(&orig_lower) || orig_lower.starts_with(&corr_lower)))
    {
        return IssueType::Spelling;
    }

    // Substantial insertion or omission of content.
    let len_diff = orig_len.abs_diff(corr_len);
    if len_diff >= 3 && len_diff * 2 > orig_len {
        return IssueType::Clarity;
    }

    // Wholesale word substitution.
    if levenshtein(&orig_lower, &corr_lower) * 2 > orig_len.max(corr_len) {
        return IssueType::Vocabulary;
    }

    // Cosmetic rewording of longer words.
    if orig_len > 5 && corr_len > 5 && prefix >= 3 && orig_lower != corr_lower {
        return IssueType::Style;
    }

    IssueType::Grammar
}

fn severity_for_type(issue_type: IssueType) -> IssueSeverity {
    match issue_type {
        IssueType::Grammar | IssueType::Clarity => IssueSeverity::Critical,
        IssueType::Spelling | IssueType::Punctuation | IssueType::Style | IssueType::Vocabulary => {
            IssueSeverity::Major
        }
    }
}

fn explanation_for(issue_type: IssueType, original: &str, suggestion: &str) -> String {
    match issue_type {
        IssueType::Grammar => {
            format!("Grammatical error: \"{original}\" should be \"{suggestion}\".")
        }
        IssueType::Spelling => {
            format!("Spelling error: \"{original}\" should be \"{suggestion}\".")
        }
        IssueType::Punctuation => {
            format!("Punctuation error: \"{original}\" should be \"{suggestion}\".")
        }
        IssueType::Clarity => format!(
            "Clarity issue: Replace \"{original}\" with \"{suggestion}\" for better readability."
        ),
        IssueType::Style => {
            format!("Style improvement: Replace \"{original}\" with \"{suggestion}\".")
        }
        IssueType::Vocabulary => {
            format!("Vocabulary: Replace \"{original}\" with the more precise \"{suggestion}\".")
        }
    }
}

/// Compare one block against its corrected rewrite and emit located issues.
///
/// Tokens are scanned left to right with a monotonic search cursor so that
/// repeated words resolve to their next unconsumed occurrence. At a changed
/// position the single-token issue is preferred; a 3-token phrase issue
/// (always `minor`) covers changes too diffuse for one token to carry. The
/// issue count is capped in proportion to the block's token count.
fn detect_issues(block_id: &str, original: &str, corrected: &str) -> Vec<TextIssue> {
    let orig_tokens = tokenize(original);
    let corr_tokens = tokenize(corrected);

    let max_issues = orig_tokens
        .len()
        .div_ceil(HP.tokens_per_issue)
        .clamp(HP.issue_cap_min, HP.issue_cap_max);

    let mut issues: Vec<TextIssue> = Vec::new();
    let mut cursor = 0usize;
    let mut i = 0usize;

    while i < orig_tokens.len() && issues.len() < max_issues {
        let token = orig_tokens[i];
        if PUNCT_TOKEN_RE.is_match(token) {
            // Punctuation tokens hold a stream position but are never
            // reported on their own.
            i += 1;
            continue;
        }
        let Some(found) = original[cursor..].find(token) else {
            i += 1;
            continue;
        };
        let word_pos = cursor + found;

        if i < corr_tokens.len()
            && token != corr_tokens[i]
            && !is_minor_variant(token, corr_tokens[i])
        {
            let corrected_token = corr_tokens[i];
            let distance = levenshtein(token, corrected_token);
            let short = token.chars().count() < HP.short_token_len
                || corrected_token.chars().count() < HP.short_token_len;

            if distance > HP.token_distance_min || (short && distance > 0) {
                let issue_type = determine_issue_type(token, corrected_token);
                issues.push(TextIssue {
                    id: format!("issue-{block_id}-{}", issues.len()),
                    issue_type,
                    severity: severity_for_type(issue_type),
                    original: token.to_string(),
                    suggestion: corrected_token.to_string(),
                    explanation: explanation_for(issue_type, token, corrected_token),
                    start_index: word_pos,
                    end_index: word_pos + token.len(),
                });
                cursor = word_pos + token.len();
                i += 1;
                continue;
            }

            // Phrase window: the change is too weak at token level but the
            // surrounding three tokens differ substantially.
            if i + 2 < orig_tokens.len() && i + 2 < corr_tokens.len() {
                let orig_phrase = orig_tokens[i..i + 3].concat();
                let corr_phrase = corr_tokens[i..i + 3].concat();
                if orig_phrase != corr_phrase
                    && !is_minor_variant(&orig_phrase, &corr_phrase)
                    && levenshtein(&orig_phrase, &corr_phrase) > HP.phrase_distance_min
                {
                    let third = orig_tokens[i + 2];
                    if let Some(rel) = original[word_pos..].find(third) {
                        let end = word_pos + rel + third.len();
                        let phrase_text = &original[word_pos..end];
                        let suggestion = corr_tokens[i..=i + 2].join(" ");
                        let issue_type = determine_issue_type(phrase_text, &suggestion);
                        issues.push(TextIssue {
                            id: format!("issue-{block_id}-{}", issues.len()),
                            issue_type,
                            severity: IssueSeverity::Minor,
                            original: phrase_text.to_string(),
                            suggestion: suggestion.clone(),
                            explanation: explanation_for(issue_type, phrase_text, &suggestion),
                            start_index: word_pos,
                            end_index: end,
                        });
                        cursor = end;
                        i += 3;
                        continue;
                    }
                }
            }
        }

        cursor = word_pos + token.len();
        i += 1;
    }

    // A heavily rewritten paragraph with few pinpointed changes still gets a
    // whole-block restructuring suggestion.
    if issues.len() < HP.restructure_min_issues
        && levenshtein(original, corrected) * HP.restructure_length_divisor
            > original.chars().count()
    {
        issues.push(TextIssue {
            id: format!("issue-structure-{block_id}"),
            issue_type: IssueType::Clarity,
            severity: IssueSeverity::Suggestion,
            original: original.to_string(),
            suggestion: corrected.to_string(),
            explanation: "Consider restructuring this paragraph for better clarity or flow."
                .to_string(),
            start_index: 0,
            end_index: original.len(),
        });
    }

    issues
}

// ---------------------------------------------------------------------------
// Block assembly
// ---------------------------------------------------------------------------

fn build_blocks(text: &str, corrected_text: &str) -> Vec<TextBlock> {
    let originals = split_paragraphs(text);
    if originals.is_empty() {
        return Vec::new();
    }

    let corrected = if corrected_text.trim().is_empty() {
        vec![String::new(); originals.len()]
    } else {
        align_corrected_blocks(&originals, corrected_text)
    };

    originals
        .into_iter()
        .enumerate()
        .map(|(index, paragraph)| {
            let id = format!("block-{index}");
            let corrected_block = corrected.get(index).cloned().unwrap_or_default();
            let issues = if !corrected_block.is_empty() && corrected_block != paragraph {
                detect_issues(&id, &paragraph, &corrected_block)
            } else {
                Vec::new()
            };
            TextBlock {
                id,
                text: paragraph,
                corrected: (!corrected_block.is_empty()).then_some(corrected_block),
                issues,
            }
        })
        .collect()
}

fn plain_blocks(text: &str) -> Vec<TextBlock> {
    split_paragraphs(text)
        .into_iter()
        .enumerate()
        .map(|(index, paragraph)| TextBlock {
            id: format!("block-{index}"),
            text: paragraph,
            corrected: None,
            issues: Vec::new(),
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Narrative signals
// ---------------------------------------------------------------------------

/// Per-category score deltas extracted from the narrative feedback.
#[derive(Debug, Clone, Copy, Default)]
pub struct FeedbackSignals {
    pub grammar_delta: i32,
    pub clarity_delta: i32,
    pub vocabulary_delta: i32,
    pub style_delta: i32,
    pub readability_delta: i32,
    pub variety_delta: i32,
}

/// Turns the free-text error analysis and assessment into score deltas. The
/// default implementation is a keyword matcher; swap it for something
/// smarter without touching the scoring formulas.
pub trait SignalExtractor {
    fn extract(&self, error_analysis: &str, assessment: &str) -> FeedbackSignals;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct KeywordSignals;

impl SignalExtractor for KeywordSignals {
    fn extract(&self, error_analysis: &str, assessment: &str) -> FeedbackSignals {
        let errors = error_analysis.to_lowercase();
        let praise = assessment.to_lowercase();
        let mentions =
            |haystack: &str, needles: &[&str]| needles.iter().any(|needle| haystack.contains(needle));
        let category = |flags: &[&str], praises: &[&str], penalty: i32, bonus: i32| {
            let mut delta = 0;
            if mentions(&errors, flags) {
                delta -= penalty;
            }
            if mentions(&praise, praises) {
                delta += bonus;
            }
            delta
        };

        let mut readability_delta = 0;
        if mentions(&praise, &["cohesive", "coherent"]) {
            readability_delta += HP.cohesive_bonus;
        }
        if mentions(&praise, &["clear", "well-structured"]) {
            readability_delta += HP.well_structured_bonus;
        }
        if mentions(&praise, &["difficult to follow", "lacks clarity"]) {
            readability_delta -= HP.hard_to_follow_penalty;
        }
        if mentions(&praise, &["confusing", "unclear", "incoherent"]) {
            readability_delta -= HP.confusing_penalty;
        }

        let mut variety_delta = 0;
        if mentions(&praise, &["varied", "diverse"]) {
            variety_delta += HP.variety_varied_bonus;
        }
        if mentions(&praise, &["repetitive", "monotonous"]) {
            variety_delta -= HP.variety_repetitive_penalty;
        }

        FeedbackSignals {
            grammar_delta: category(
                &["grammar"],
                &["grammar"],
                HP.grammar_flag_penalty,
                HP.grammar_praise_bonus,
            ),
            clarity_delta: category(
                &["unclear", "clarity"],
                &["clear", "coherent"],
                HP.clarity_flag_penalty,
                HP.clarity_praise_bonus,
            ),
            vocabulary_delta: category(
                &["vocabulary", "word choice"],
                &["vocabulary", "lexical"],
                HP.vocabulary_flag_penalty,
                HP.vocabulary_praise_bonus,
            ),
            style_delta: category(
                &["style", "formal"],
                &["style", "consistent"],
                HP.style_flag_penalty,
                HP.style_praise_bonus,
            ),
            readability_delta,
            variety_delta,
        }
    }
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

fn clamp_score(score: i32) -> i32 {
    score.clamp(HP.score_floor, HP.score_ceiling)
}

fn empty_type_counts() -> BTreeMap<IssueType, usize> {
    IssueType::ALL.iter().map(|t| (*t, 0)).collect()
}

fn empty_severity_counts() -> BTreeMap<IssueSeverity, usize> {
    IssueSeverity::ALL.iter().map(|s| (*s, 0)).collect()
}

fn category_score(
    issue_count: usize,
    effective_len: usize,
    weight: f64,
    cap: f64,
    delta: i32,
    baseline: i32,
    rng: &mut StdRng,
) -> i32 {
    let density = issue_count as f64 / effective_len as f64 * HP.density_chars_basis;
    let mut score = baseline as f64 - (density * weight).min(cap) + delta as f64;
    score += rng.gen_range(-HP.score_jitter..=HP.score_jitter);
    clamp_score(score.round() as i32)
}

fn readability_score(
    grammar_issues: usize,
    clarity_issues: usize,
    punctuation_issues: usize,
    effective_len: usize,
    delta: i32,
    baseline: i32,
) -> i32 {
    let weighted = grammar_issues as f64 * HP.readability_grammar_weight
        + clarity_issues as f64 * HP.readability_clarity_weight
        + punctuation_issues as f64 * HP.readability_punctuation_weight;
    let density = weighted / effective_len as f64 * HP.density_chars_basis;
    let score = baseline as f64 - density.min(HP.readability_cap) + delta as f64;
    clamp_score(score.round() as i32)
}

fn sentence_variety_score(blocks: &[TextBlock], delta: i32, baseline: i32) -> i32 {
    let all_text = blocks
        .iter()
        .map(|b| b.text.as_str())
        .collect::<Vec<_>>()
        .join(" ");
    let sentences: Vec<&str> = SENTENCE_SPLIT_RE
        .split(&all_text)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();
    if sentences.len() < HP.variety_min_sentences {
        return HP.variety_sparse_score;
    }

    let lengths: Vec<f64> = sentences.iter().map(|s| s.chars().count() as f64).collect();
    let mean = lengths.iter().sum::<f64>() / lengths.len() as f64;
    let variance = lengths.iter().map(|l| (l - mean).powi(2)).sum::<f64>() / lengths.len() as f64;
    let std = variance.sqrt();

    let mut score = baseline as f64;
    if (HP.variety_std_lo..=HP.variety_std_hi).contains(&std) {
        score += HP.variety_std_bonus as f64;
    } else if std < HP.variety_uniform_std {
        score -= HP.variety_uniform_penalty as f64;
    } else if std > HP.variety_ragged_std {
        score -= HP.variety_ragged_penalty as f64;
    }

    let openers: Vec<String> = sentences
        .iter()
        .filter_map(|s| s.split_whitespace().next())
        .map(str::to_lowercase)
        .collect();
    if !openers.is_empty() {
        let unique: HashSet<&String> = openers.iter().collect();
        let fraction = unique.len() as f64 / openers.len() as f64;
        if fraction > HP.variety_opener_hi {
            score += HP.variety_opener_bonus as f64;
        } else if fraction < HP.variety_opener_lo {
            score -= HP.variety_opener_penalty as f64;
        }
    }

    score += delta as f64;
    clamp_score(score.round() as i32)
}

fn calculate_metrics(
    blocks: &[TextBlock],
    signals: &FeedbackSignals,
    rng: &mut StdRng,
) -> TextMetrics {
    let mut issues_by_type = empty_type_counts();
    let mut issues_by_severity = empty_severity_counts();
    let mut total_issues = 0usize;
    for issue in blocks.iter().flat_map(|b| &b.issues) {
        *issues_by_type.entry(issue.issue_type).or_insert(0) += 1;
        *issues_by_severity.entry(issue.severity).or_insert(0) += 1;
        total_issues += 1;
    }

    let total_chars: usize = blocks.iter().map(|b| b.text.chars().count()).sum();
    let effective_len = total_chars.max(HP.effective_length_floor);
    let baseline = (100 - total_issues as i32 * HP.issue_cost).max(HP.baseline_floor);
    let count = |t: IssueType| issues_by_type.get(&t).copied().unwrap_or(0);

    let grammar_score = category_score(
        count(IssueType::Grammar),
        effective_len,
        HP.grammar_weight,
        HP.grammar_cap,
        signals.grammar_delta,
        baseline,
        rng,
    );
    let clarity_score = category_score(
        count(IssueType::Clarity),
        effective_len,
        HP.clarity_weight,
        HP.clarity_cap,
        signals.clarity_delta,
        baseline,
        rng,
    );
    let vocabulary_score = category_score(
        count(IssueType::Vocabulary),
        effective_len,
        HP.vocabulary_weight,
        HP.vocabulary_cap,
        signals.vocabulary_delta,
        baseline,
        rng,
    );
    let style_consistency_score = category_score(
        count(IssueType::Style),
        effective_len,
        HP.style_weight,
        HP.style_cap,
        signals.style_delta,
        baseline,
        rng,
    );
    let readability_score = readability_score(
        count(IssueType::Grammar),
        count(IssueType::Clarity),
        count(IssueType::Punctuation),
        effective_len,
        signals.readability_delta,
        baseline,
    );
    let sentence_variety_score = sentence_variety_score(blocks, signals.variety_delta, baseline);

    TextMetrics {
        readability_score,
        grammar_score,
        clarity_score,
        vocabulary_score,
        style_consistency_score,
        sentence_variety_score,
        issues_by_type,
        issues_by_severity,
        ielts_estimate: None,
        professor_feedback: String::new(),
    }
}

// ---------------------------------------------------------------------------
// Overall score
// ---------------------------------------------------------------------------

fn overall_score(metrics: &TextMetrics) -> i32 {
    let weighted = metrics.grammar_score as f64 * HP.overall_grammar_weight
        + metrics.clarity_score as f64 * HP.overall_clarity_weight
        + metrics.readability_score as f64 * HP.overall_readability_weight
        + metrics.vocabulary_score as f64 * HP.overall_vocabulary_weight
        + metrics.style_consistency_score as f64 * HP.overall_style_weight;

    let mut score = weighted;
    if metrics.grammar_score < HP.weak_score_threshold {
        let shortfall = (HP.weak_score_threshold - metrics.grammar_score) as f64;
        score -= (shortfall * HP.weak_grammar_penalty_rate).min(HP.weak_grammar_penalty_cap);
    }
    if metrics.clarity_score < HP.weak_score_threshold {
        let shortfall = (HP.weak_score_threshold - metrics.clarity_score) as f64;
        score -= (shortfall * HP.weak_clarity_penalty_rate).min(HP.weak_clarity_penalty_cap);
    }
    clamp_score(score.round() as i32)
}

/// Blend the locally computed score with the external band estimate. The
/// external judgment dominates. Monotone non-decreasing in the band.
fn blend_band(overall: i32, band_estimate: Option<f64>) -> i32 {
    match band_estimate {
        Some(band) if (HP.band_min..=HP.band_max).contains(&band) => {
            let rescaled = band / HP.band_scale * 100.0;
            clamp_score(
                (overall as f64 * HP.local_score_weight + rescaled * HP.band_score_weight).round()
                    as i32,
            )
        }
        _ => overall,
    }
}

// ---------------------------------------------------------------------------
// Fallback values
// ---------------------------------------------------------------------------

const FALLBACK_NARRATIVE: &str =
    "Automated feedback was unavailable for this analysis. Scores reflect local comparison only.";

fn neutral_metrics() -> TextMetrics {
    TextMetrics {
        readability_score: HP.neutral_score,
        grammar_score: HP.neutral_score,
        clarity_score: HP.neutral_score,
        vocabulary_score: HP.neutral_score,
        style_consistency_score: HP.neutral_score,
        sentence_variety_score: HP.neutral_score,
        issues_by_type: empty_type_counts(),
        issues_by_severity: empty_severity_counts(),
        ielts_estimate: None,
        professor_feedback: String::new(),
    }
}

/// Overall score used when the pipeline degrades: word count and locally
/// detected issue count only, no collaborator dependency.
fn fallback_overall(text: &str, local_issues: usize) -> i32 {
    let words = word_count(text);
    let length_bonus =
        ((words / HP.degraded_words_per_point) as i32).min(HP.degraded_length_bonus_cap);
    let issue_penalty =
        (local_issues as i32 * HP.degraded_issue_cost).min(HP.degraded_issue_penalty_cap);
    clamp_score(HP.degraded_base_score + length_bonus - issue_penalty)
}

fn empty_result() -> TextAnalysisResult {
    TextAnalysisResult {
        blocks: Vec::new(),
        metrics: neutral_metrics(),
        overall_score: fallback_overall("", 0),
        ielts_feedback: None,
    }
}

fn degraded_result(text: &str) -> TextAnalysisResult {
    let blocks = plain_blocks(text);
    let mut metrics = neutral_metrics();
    metrics.professor_feedback = FALLBACK_NARRATIVE.to_string();
    TextAnalysisResult {
        overall_score: fallback_overall(text, 0),
        blocks,
        metrics,
        ielts_feedback: Some(FALLBACK_NARRATIVE.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Validating,
    FetchingFeedback,
    ParsingFeedback,
    Segmenting,
    Scoring,
    Blending,
    Done,
    Degraded,
}

fn assemble(
    blocks: Vec<TextBlock>,
    mut metrics: TextMetrics,
    overall_score: i32,
    feedback: &Feedback,
) -> TextAnalysisResult {
    metrics.ielts_estimate = feedback.band_estimate;
    metrics.professor_feedback = feedback.full_narrative.clone().unwrap_or_default();
    TextAnalysisResult {
        blocks,
        metrics,
        overall_score,
        ielts_feedback: feedback.full_narrative.clone(),
    }
}

/// Run the synchronous pipeline over already-fetched feedback.
///
/// This is the deterministic core: the same text, feedback, and RNG state
/// always produce the same result. No fallback wrapping is applied; use
/// [`Analyzer::analyze`] for the degradation-safe entry point.
pub fn analyze_with_feedback(
    text: &str,
    feedback: &Feedback,
    rng: &mut StdRng,
) -> TextAnalysisResult {
    if text.trim().is_empty() {
        return empty_result();
    }
    let feedback = feedback.clone().resolved();
    let corrected = feedback.corrected_text.clone().unwrap_or_default();
    let blocks = build_blocks(text, &corrected);
    let signals = KeywordSignals.extract(
        feedback.error_analysis.as_deref().unwrap_or(""),
        feedback.assessment.as_deref().unwrap_or(""),
    );
    let metrics = calculate_metrics(&blocks, &signals, rng);
    let overall = blend_band(overall_score(&metrics), feedback.band_estimate);
    assemble(blocks, metrics, overall, &feedback)
}

/// The analysis engine. Stateless apart from its provider and optional RNG
/// seed; concurrent calls share nothing.
pub struct Analyzer<P> {
    provider: P,
    seed: Option<u64>,
}

impl<P: FeedbackProvider> Analyzer<P> {
    pub fn new(provider: P) -> Self {
        Analyzer {
            provider,
            seed: None,
        }
    }

    /// Fix the jitter RNG seed for reproducible scores.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    fn rng(&self) -> StdRng {
        match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        }
    }

    /// Analyze a text. Always returns a structurally valid result: provider
    /// failure degrades to neutral scores, and a failure in any compute
    /// stage substitutes that stage's fallback value.
    pub async fn analyze(&self, text: &str) -> TextAnalysisResult {
        debug!(stage = ?Stage::Validating, "starting analysis");
        if text.trim().is_empty() {
            debug!(stage = ?Stage::Done, "empty input");
            return empty_result();
        }

        debug!(stage = ?Stage::FetchingFeedback, "fetching feedback");
        let feedback = match self.provider.fetch_feedback(text).await {
            Ok(feedback) => feedback,
            Err(error) => {
                warn!(stage = ?Stage::Degraded, %error, "feedback fetch failed");
                return degraded_result(text);
            }
        };

        debug!(stage = ?Stage::ParsingFeedback, "resolving feedback fields");
        let feedback = feedback.resolved();
        let corrected = feedback.corrected_text.clone().unwrap_or_default();
        let mut rng = self.rng();

        debug!(stage = ?Stage::Segmenting, "segmenting and aligning blocks");
        let blocks = panic::catch_unwind(AssertUnwindSafe(|| build_blocks(text, &corrected)))
            .unwrap_or_else(|_| {
                warn!(stage = ?Stage::Segmenting, "segmentation failed, using plain paragraphs");
                plain_blocks(text)
            });

        debug!(stage = ?Stage::Scoring, "calculating metrics");
        let signals = KeywordSignals.extract(
            feedback.error_analysis.as_deref().unwrap_or(""),
            feedback.assessment.as_deref().unwrap_or(""),
        );
        let metrics = panic::catch_unwind(AssertUnwindSafe(|| {
            calculate_metrics(&blocks, &signals, &mut rng)
        }))
        .unwrap_or_else(|_| {
            warn!(stage = ?Stage::Scoring, "metrics calculation failed, using neutral scores");
            neutral_metrics()
        });

        debug!(stage = ?Stage::Blending, "blending overall score");
        let local_issues: usize = blocks.iter().map(|b| b.issues.len()).sum();
        let overall = panic::catch_unwind(AssertUnwindSafe(|| {
            blend_band(overall_score(&metrics), feedback.band_estimate)
        }))
        .unwrap_or_else(|_| {
            warn!(stage = ?Stage::Blending, "blending failed, using fallback score");
            fallback_overall(text, local_issues)
        });

        debug!(stage = ?Stage::Done, overall, "analysis complete");
        assemble(blocks, metrics, overall, &feedback)
    }
}

// ---------------------------------------------------------------------------
// Labels and report export
// ---------------------------------------------------------------------------

pub fn score_label(score: i32) -> &'static str {
    if score >= 90 {
        "Excellent"
    } else if score >= 80 {
        "Very Good"
    } else if score >= 70 {
        "Good"
    } else if score >= 60 {
        "Satisfactory"
    } else if score >= 50 {
        "Needs Improvement"
    } else if score >= 40 {
        "Poor"
    } else {
        "Critical Issues"
    }
}

/// Corrected blocks joined by blank lines, falling back to the original text
/// for blocks without a confident correction.
pub fn export_corrected_text(blocks: &[TextBlock]) -> String {
    blocks
        .iter()
        .map(|b| b.corrected.as_deref().unwrap_or(&b.text))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Render a markdown report for one analysis.
pub fn export_analysis_report(result: &TextAnalysisResult, original_text: &str) -> String {
    let metrics = &result.metrics;
    let severity_count =
        |s: IssueSeverity| metrics.issues_by_severity.get(&s).copied().unwrap_or(0);

    let mut report = String::new();
    report.push_str("# Writing Analysis Report\n\n");
    report.push_str("## Overall Assessment\n\n");
    report.push_str(&format!(
        "Quality Score: {}/100 ({})\n\n",
        result.overall_score,
        score_label(result.overall_score)
    ));

    report.push_str("## Metrics\n\n");
    report.push_str(&format!(
        "* Readability: {}/100\n",
        metrics.readability_score
    ));
    report.push_str(&format!("* Grammar: {}/100\n", metrics.grammar_score));
    report.push_str(&format!("* Clarity: {}/100\n", metrics.clarity_score));
    report.push_str(&format!(
        "* Style Consistency: {}/100\n",
        metrics.style_consistency_score
    ));
    report.push_str(&format!(
        "* Vocabulary Usage: {}/100\n\n",
        metrics.vocabulary_score
    ));

    if let Some(feedback) = &result.ielts_feedback {
        report.push_str(&format!("## Professional Feedback\n\n{feedback}\n\n"));
        if let Some(band) = metrics.ielts_estimate {
            report.push_str(&format!("Estimated IELTS Band: {band}\n\n"));
        }
    }

    report.push_str("## Issues Summary\n\n");
    report.push_str(&format!(
        "* Critical Issues: {}\n",
        severity_count(IssueSeverity::Critical)
    ));
    report.push_str(&format!(
        "* Major Issues: {}\n",
        severity_count(IssueSeverity::Major)
    ));
    report.push_str(&format!(
        "* Minor Issues: {}\n",
        severity_count(IssueSeverity::Minor)
    ));
    report.push_str(&format!(
        "* Suggestions: {}\n\n",
        severity_count(IssueSeverity::Suggestion)
    ));

    report.push_str("## Detailed Feedback\n\n");
    for (index, block) in result.blocks.iter().enumerate() {
        if block.issues.is_empty() {
            continue;
        }
        report.push_str(&format!("### Paragraph {}\n\n", index + 1));
        report.push_str(&format!("Original: \"{}\"\n\n", block.text));
        if let Some(corrected) = &block.corrected {
            report.push_str(&format!("Corrected: \"{corrected}\"\n\n"));
        }
        report.push_str("Issues:\n\n");
        let mut issues: Vec<&TextIssue> = block.issues.iter().collect();
        issues.sort_by_key(|issue| issue.start_index);
        for issue in issues {
            report.push_str(&format!(
                "* {} ({}): \"{}\" \u{2192} \"{}\"\n",
                issue.issue_type.label(),
                issue.severity.label(),
                issue.original,
                issue.suggestion
            ));
            report.push_str(&format!("  * {}\n\n", issue.explanation));
        }
    }

    report.push_str(&format!("## Original Text\n\n{original_text}\n\n"));
    report.push_str(&format!(
        "## Corrected Text\n\n{}\n",
        export_corrected_text(&result.blocks)
    ));

    report
}
