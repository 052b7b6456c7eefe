use std::sync::OnceLock;

use regex::Regex;
use tracing::debug;

use crate::config::SegmentConfig;
use crate::error::{OtoyakuError, Result};
use crate::request::TranslationContext;

// Placeholder tokens use private-use codepoints so they survive any backend
// untouched: `\u{E000}<ordinal>\u{E001}`.
const MASK_OPEN: char = '\u{E000}';
const MASK_CLOSE: char = '\u{E001}';

// Characters we prefer to cut after when a segment fills up.
const BOUNDARY_CHARS: &[char] = &['.', '!', '?', ';', ',', '_', '-', ' ', '/'];

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new("\u{E000}(\\d+)\u{E001}").expect("placeholder pattern is valid")
    })
}

/// A substring excluded from translation, recorded verbatim so restoration
/// never depends on re-matching the pattern against translated output.
#[derive(Debug, Clone, PartialEq)]
pub struct PreservedSpan {
    pub ordinal: usize,
    /// Byte offset of the span in the original text
    pub start: usize,
    pub text: String,
}

/// Original text with preserved spans swapped for placeholder tokens.
#[derive(Debug, Clone)]
pub struct MaskedText {
    pub text: String,
    pub spans: Vec<PreservedSpan>,
}

impl MaskedText {
    /// True when anything outside the preserved spans is worth sending to a
    /// backend. Whitespace and separators alone do not qualify.
    pub fn is_translatable(&self) -> bool {
        has_translatable_content(&self.text)
    }
}

/// Whether masked text still holds anything a backend should see.
pub fn has_translatable_content(text: &str) -> bool {
    let stripped = placeholder_re().replace_all(text, "");
    stripped.chars().any(|c| c.is_alphanumeric())
}

/// A contiguous slice of the masked text plus its position in the original
/// order. Lives for one request only.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub ordinal: usize,
    pub text: String,
}

/// Effective segmentation rules for one request: configured defaults merged
/// with any per-request overrides from the caller's context.
#[derive(Debug, Clone)]
pub struct SegmentPlan {
    patterns: Vec<Regex>,
    max_len: usize,
    min_len: usize,
}

/// Splits long input into bounded segments, protects pattern-matched
/// substrings from translation, and reassembles results in original order.
pub struct ContextProcessor {
    default_patterns: Vec<Regex>,
    max_len: usize,
    min_len: usize,
}

impl ContextProcessor {
    pub fn new(config: &SegmentConfig) -> Result<Self> {
        if config.min_segment_length == 0 || config.min_segment_length > config.max_segment_length {
            return Err(OtoyakuError::Config(format!(
                "segment bounds out of order: min {} max {}",
                config.min_segment_length, config.max_segment_length
            )));
        }
        let default_patterns = compile_patterns(&config.preserve_patterns)
            .map_err(|e| OtoyakuError::Config(format!("bad preserve pattern: {}", e)))?;
        Ok(Self {
            default_patterns,
            max_len: config.max_segment_length,
            min_len: config.min_segment_length,
        })
    }

    /// Build the effective plan for a request. Caller-supplied pattern
    /// overrides are compiled here; a bad override is the caller's error.
    pub fn plan(&self, context: &TranslationContext) -> Result<SegmentPlan> {
        let patterns = match &context.preserve_patterns {
            Some(overrides) => compile_patterns(overrides)
                .map_err(|e| OtoyakuError::InvalidRequest(format!("bad preserve pattern: {}", e)))?,
            None => self.default_patterns.clone(),
        };
        let max_len = context.max_segment_length.unwrap_or(self.max_len);
        let min_len = context.min_segment_length.unwrap_or(self.min_len);
        if min_len == 0 || min_len > max_len {
            return Err(OtoyakuError::InvalidRequest(format!(
                "segment bounds out of order: min {} max {}",
                min_len, max_len
            )));
        }
        Ok(SegmentPlan {
            patterns,
            max_len,
            min_len,
        })
    }

    /// Record preserved spans and swap each for an atomic placeholder token.
    pub fn mask(&self, text: &str, plan: &SegmentPlan) -> MaskedText {
        let mut matches: Vec<(usize, usize)> = Vec::new();
        for pattern in &plan.patterns {
            for found in pattern.find_iter(text) {
                if found.start() < found.end() {
                    matches.push((found.start(), found.end()));
                }
            }
        }
        // Earliest start wins; on a tie the longer match does. Later
        // overlapping matches are dropped.
        matches.sort_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)));

        let mut spans = Vec::new();
        let mut masked = String::with_capacity(text.len());
        let mut cursor = 0;
        for (start, end) in matches {
            if start < cursor {
                continue;
            }
            masked.push_str(&text[cursor..start]);
            let ordinal = spans.len();
            masked.push(MASK_OPEN);
            masked.push_str(&ordinal.to_string());
            masked.push(MASK_CLOSE);
            spans.push(PreservedSpan {
                ordinal,
                start,
                text: text[start..end].to_string(),
            });
            cursor = end;
        }
        masked.push_str(&text[cursor..]);

        if !spans.is_empty() {
            debug!("Masked {} preserved span(s)", spans.len());
        }
        MaskedText { text: masked, spans }
    }

    /// Cut masked text into ordered segments. Cuts prefer separator
    /// boundaries, fall back to hard length cuts, and never land inside a
    /// placeholder token. Every segment except the last satisfies
    /// `min_len <= chars <= max_len`; a segment containing an oversized
    /// placeholder may exceed `max_len` rather than cut the span.
    pub fn split(&self, masked: &str, plan: &SegmentPlan) -> Vec<Segment> {
        let mut segments: Vec<String> = Vec::new();
        let mut current = String::new();
        let mut current_chars = 0usize;
        // Byte/char position just after the most recent boundary character.
        let mut boundary: Option<(usize, usize)> = None;

        for unit in tokenize(masked) {
            let unit_chars = unit.text.chars().count();
            if current_chars + unit_chars > plan.max_len && current_chars >= plan.min_len {
                match boundary {
                    Some((byte_pos, char_count)) if char_count >= plan.min_len => {
                        let rest = current.split_off(byte_pos);
                        segments.push(std::mem::take(&mut current));
                        current = rest;
                        current_chars -= char_count;
                    }
                    _ => {
                        segments.push(std::mem::take(&mut current));
                        current_chars = 0;
                    }
                }
                boundary = None;
            }
            if unit.is_boundary {
                boundary = Some((current.len() + unit.text.len(), current_chars + unit_chars));
            }
            current.push_str(&unit.text);
            current_chars += unit_chars;
        }
        if !current.is_empty() {
            segments.push(current);
        }

        segments
            .into_iter()
            .enumerate()
            .map(|(ordinal, text)| Segment { ordinal, text })
            .collect()
    }

    /// Reassemble translated segments in original ordinal order.
    pub fn merge(&self, mut segments: Vec<Segment>) -> String {
        segments.sort_by_key(|s| s.ordinal);
        segments.into_iter().map(|s| s.text).collect()
    }

    /// Re-insert the recorded span text wherever its placeholder survived.
    /// Replacement is by ordinal lookup, never by pattern replay, so a
    /// pattern that happens to match translated output cannot cause drift.
    pub fn restore(&self, merged: &str, spans: &[PreservedSpan]) -> String {
        placeholder_re()
            .replace_all(merged, |caps: &regex::Captures| {
                caps[1]
                    .parse::<usize>()
                    .ok()
                    .and_then(|ordinal| spans.iter().find(|s| s.ordinal == ordinal))
                    .map(|s| s.text.clone())
                    .unwrap_or_else(|| caps[0].to_string())
            })
            .into_owned()
    }
}

struct Unit {
    text: String,
    is_boundary: bool,
}

/// Break masked text into atomic units: whole placeholder tokens and single
/// characters. Splitting operates on units, so a placeholder can never be
/// cut in half.
fn tokenize(masked: &str) -> Vec<Unit> {
    let mut units = Vec::new();
    let mut chars = masked.char_indices();
    while let Some((start, c)) = chars.next() {
        if c == MASK_OPEN {
            let mut end = start + c.len_utf8();
            for (idx, inner) in chars.by_ref() {
                end = idx + inner.len_utf8();
                if inner == MASK_CLOSE {
                    break;
                }
            }
            units.push(Unit {
                text: masked[start..end].to_string(),
                is_boundary: false,
            });
        } else {
            units.push(Unit {
                text: c.to_string(),
                is_boundary: BOUNDARY_CHARS.contains(&c),
            });
        }
    }
    units
}

fn compile_patterns(patterns: &[String]) -> std::result::Result<Vec<Regex>, regex::Error> {
    patterns.iter().map(|p| Regex::new(p)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn processor(max: usize, min: usize) -> ContextProcessor {
        ContextProcessor::new(&SegmentConfig {
            max_segment_length: max,
            min_segment_length: min,
            preserve_patterns: vec![
                r"\{.*?\}".to_string(),
                r"\$\w+".to_string(),
                r"<.*?>".to_string(),
            ],
        })
        .expect("processor")
    }

    fn identity_round_trip(processor: &ContextProcessor, text: &str) {
        let plan = processor.plan(&TranslationContext::default()).expect("plan");
        let masked = processor.mask(text, &plan);
        let segments = processor.split(&masked.text, &plan);
        let merged = processor.merge(segments);
        assert_eq!(processor.restore(&merged, &masked.spans), text);
    }

    #[test]
    fn split_then_merge_is_identity() {
        let p = processor(10, 3);
        identity_round_trip(&p, "Wind_Gust_{version}_Strong_Howling");
        identity_round_trip(&p, "a small phrase, with clauses; and more.");
        identity_round_trip(&p, "風の音_{take}_強い");
        identity_round_trip(&p, "$id<tag>{x}");
        identity_round_trip(&p, "no-spans-here-at-all");
    }

    #[test]
    fn empty_input_produces_no_segments() {
        let p = processor(10, 3);
        let plan = p.plan(&TranslationContext::default()).expect("plan");
        let masked = p.mask("", &plan);
        assert!(masked.text.is_empty());
        assert!(p.split(&masked.text, &plan).is_empty());
    }

    #[test]
    fn input_of_only_preserved_spans_is_not_translatable() {
        let p = processor(40, 3);
        let plan = p.plan(&TranslationContext::default()).expect("plan");
        let masked = p.mask("{file_id}{take}", &plan);
        assert!(!masked.is_translatable());
        assert_eq!(masked.spans.len(), 2);
        // Restoration still reproduces the input exactly.
        assert_eq!(p.restore(&masked.text, &masked.spans), "{file_id}{take}");
    }

    #[test]
    fn preserved_span_is_never_split_across_segments() {
        let p = processor(4, 1);
        let plan = p.plan(&TranslationContext::default()).expect("plan");
        let masked = p.mask("abc{long_placeholder_token}def", &plan);
        let segments = p.split(&masked.text, &plan);
        let with_placeholder: Vec<_> = segments
            .iter()
            .filter(|s| s.text.contains('\u{E000}'))
            .collect();
        assert_eq!(with_placeholder.len(), 1);
        assert!(with_placeholder[0].text.contains('\u{E001}'));
    }

    #[test]
    fn segments_respect_length_bounds_except_the_last() {
        let p = processor(12, 4);
        let plan = p.plan(&TranslationContext::default()).expect("plan");
        let text = "one two three four five six seven eight nine ten";
        let masked = p.mask(text, &plan);
        let segments = p.split(&masked.text, &plan);
        assert!(segments.len() > 1);
        for segment in &segments[..segments.len() - 1] {
            let chars = segment.text.chars().count();
            assert!(chars >= 4 && chars <= 12, "bad length {}: {:?}", chars, segment.text);
        }
        assert!(segments.last().expect("last").text.chars().count() <= 12);
    }

    #[test]
    fn cuts_prefer_separator_boundaries() {
        let p = processor(10, 3);
        let plan = p.plan(&TranslationContext::default()).expect("plan");
        let masked = p.mask("Wind_Gust_Strong_Howl", &plan);
        let segments = p.split(&masked.text, &plan);
        for segment in &segments[..segments.len() - 1] {
            assert!(
                segment.text.ends_with('_'),
                "expected boundary cut, got {:?}",
                segment.text
            );
        }
    }

    #[test]
    fn restore_uses_recorded_text_not_pattern_replay() {
        let p = processor(40, 3);
        let plan = p.plan(&TranslationContext::default()).expect("plan");
        let masked = p.mask("intro {take} outro", &plan);
        // Simulate a translation that itself contains brace-like output.
        let translated = masked.text.replace("intro", "{导入}").replace("outro", "结尾");
        let restored = p.restore(&translated, &masked.spans);
        assert_eq!(restored, "{导入} {take} 结尾");
    }

    #[test]
    fn context_overrides_replace_default_patterns() {
        let p = processor(40, 3);
        let context = TranslationContext {
            preserve_patterns: Some(vec![r"#\d+".to_string()]),
            ..Default::default()
        };
        let plan = p.plan(&context).expect("plan");
        let masked = p.mask("take #42 of {scene}", &plan);
        assert_eq!(masked.spans.len(), 1);
        assert_eq!(masked.spans[0].text, "#42");
        // The default brace pattern no longer applies.
        assert!(masked.text.contains("{scene}"));
    }

    #[test]
    fn bad_override_pattern_is_an_invalid_request() {
        let p = processor(40, 3);
        let context = TranslationContext {
            preserve_patterns: Some(vec!["(unclosed".to_string()]),
            ..Default::default()
        };
        assert!(matches!(
            p.plan(&context),
            Err(OtoyakuError::InvalidRequest(_))
        ));
    }

    #[test]
    fn overlapping_matches_keep_the_earliest() {
        let p = ContextProcessor::new(&SegmentConfig {
            max_segment_length: 40,
            min_segment_length: 3,
            preserve_patterns: vec![r"ab+".to_string(), r"b+c".to_string()],
        })
        .expect("processor");
        let plan = p.plan(&TranslationContext::default()).expect("plan");
        let masked = p.mask("xabbcy", &plan);
        assert_eq!(masked.spans.len(), 1);
        assert_eq!(masked.spans[0].text, "abb");
        assert_eq!(p.restore(&masked.text, &masked.spans), "xabbcy");
    }
}
