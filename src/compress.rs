//! Free-text prompt compression for small-context remote providers.
//!
//! Shrinks an oversized prompt to a character budget without discarding
//! mandatory instructions. Sections that match a fixed keyword set (or are
//! already short) are classified critical and pass through verbatim;
//! everything else shares the remaining budget evenly and is cut at the
//! last sentence boundary before its share, with a truncation marker.
//!
//! Reassembly places critical sections first — small-context consumers see
//! the mandatory instructions before anything is cut off by their own
//! limits. All budgets are measured in characters, not bytes, so
//! truncation never splits a UTF-8 sequence.

use serde::{Deserialize, Serialize};

/// Marker appended to any section that was cut.
const TRUNCATION_MARKER: &str = " [truncated]";

/// Minimum share worth a sentence-boundary cut. Sections allotted less
/// than this are reduced to a marker-bearing stub instead, so the elision
/// stays visible in the output.
const MIN_SECTION_SHARE: usize = 16;

/// Keywords that mark a section as a mandatory instruction.
/// Matching is case-insensitive.
const CRITICAL_KEYWORDS: &[&str] = &[
    "must",
    "required",
    "do not",
    "never",
    "always",
    "important",
    "critical",
    "output format",
    "respond with",
    "constraint",
];

/// Tuning knobs for [`compress_prompt`].
#[derive(Debug, Clone, Serialize, Deserialize, schemars::JsonSchema, PartialEq)]
pub struct CompressionConfig {
    /// Target output size in characters.
    pub target_chars: usize,
    /// Reserved headroom subtracted from the budget before splitting it
    /// across compressible sections.
    pub fixed_buffer: usize,
    /// Fraction of a section's share kept when the section overflows it.
    /// The cut prefers the last sentence boundary before this point.
    pub keep_fraction: f64,
    /// Sections at or below this length are treated as critical even
    /// without a keyword match.
    pub short_section_max: usize,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            target_chars: 4000,
            fixed_buffer: 100,
            keep_fraction: 0.8,
            short_section_max: 120,
        }
    }
}

/// Compress `prompt` to roughly `config.target_chars` characters.
///
/// Prompts already within budget are returned unchanged. Otherwise the
/// prompt is split into paragraph-like sections, classified, and
/// reassembled with critical sections first. When critical content alone
/// exceeds the budget, the budget is split evenly across the critical
/// sections and each is truncated — output is degraded, never empty.
///
/// The output length is bounded by `target_chars` plus a small fixed
/// overhead (truncation markers and separators).
pub fn compress_prompt(prompt: &str, config: &CompressionConfig) -> String {
    if char_len(prompt) <= config.target_chars {
        return prompt.to_string();
    }

    let sections: Vec<&str> = prompt
        .split("\n\n")
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();

    let mut critical: Vec<&str> = Vec::new();
    let mut compressible: Vec<&str> = Vec::new();
    for section in &sections {
        if is_critical(section, config.short_section_max) {
            critical.push(section);
        } else {
            compressible.push(section);
        }
    }

    let critical_size: usize = critical.iter().map(|s| char_len(s)).sum();
    let budget = config.target_chars as i64 - critical_size as i64 - config.fixed_buffer as i64;

    if budget <= 0 {
        // Degenerate branch: even the mandatory instructions overflow the
        // budget. Split it evenly across them and truncate each.
        tracing::warn!(
            critical_size,
            target = config.target_chars,
            "critical sections alone exceed compression target"
        );
        if critical.is_empty() {
            // No criticals to keep: degrade to a plain head truncation of
            // the whole prompt rather than returning nothing.
            return truncate_with_marker(prompt, config.target_chars.max(MIN_SECTION_SHARE));
        }
        let share = config.target_chars / critical.len();
        let parts: Vec<String> = critical
            .iter()
            .map(|s| truncate_with_marker(s, share))
            .collect();
        return parts.join("\n\n");
    }

    let mut compressed: Vec<String> = Vec::new();
    if !compressible.is_empty() {
        let share = budget as usize / compressible.len();
        for section in &compressible {
            if char_len(section) <= share {
                compressed.push((*section).to_string());
            } else if share >= MIN_SECTION_SHARE {
                let keep = (share as f64 * config.keep_fraction) as usize;
                compressed.push(cut_at_sentence(section, keep));
            } else {
                // Share too small for a sentence cut; emit a stub rather
                // than dropping the section, so readers can see that
                // content was elided here.
                compressed.push(truncate_with_marker(section, share));
            }
        }
    }

    let mut out: Vec<String> = critical.iter().map(|s| (*s).to_string()).collect();
    out.extend(compressed);
    out.join("\n\n")
}

/// Character-count length (not bytes).
fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Whether a section carries mandatory instructions or is short enough to
/// keep whole.
fn is_critical(section: &str, short_max: usize) -> bool {
    if char_len(section) <= short_max {
        return true;
    }
    let lower = section.to_lowercase();
    CRITICAL_KEYWORDS.iter().any(|k| lower.contains(k))
}

/// Take the first `keep` characters, appending the truncation marker if
/// anything was removed.
fn truncate_with_marker(s: &str, keep: usize) -> String {
    if char_len(s) <= keep {
        return s.to_string();
    }
    let mut out: String = s.chars().take(keep).collect();
    out.push_str(TRUNCATION_MARKER);
    out
}

/// Cut `s` down to at most `keep` characters, preferring the last sentence
/// boundary before the cut point. Falls back to a hard character cut when
/// no boundary lands in the second half of the kept region.
fn cut_at_sentence(s: &str, keep: usize) -> String {
    if char_len(s) <= keep {
        return s.to_string();
    }
    let kept: String = s.chars().take(keep).collect();

    let boundary = kept
        .char_indices()
        .filter(|(_, c)| matches!(c, '.' | '!' | '?'))
        .map(|(i, c)| i + c.len_utf8())
        .last();

    let cut = match boundary {
        // Only respect a boundary that retains at least half the share;
        // a period in the first few words is not a useful cut point.
        Some(b) if b * 2 >= kept.len() => &kept[..b],
        _ => kept.as_str(),
    };

    let mut out = cut.trim_end().to_string();
    out.push_str(TRUNCATION_MARKER);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(target: usize) -> CompressionConfig {
        CompressionConfig {
            target_chars: target,
            fixed_buffer: 100,
            keep_fraction: 0.8,
            short_section_max: 120,
        }
    }

    #[test]
    fn test_prompt_within_budget_unchanged() {
        let cfg = config(1000);
        let prompt = "Short prompt that fits.";
        assert_eq!(compress_prompt(prompt, &cfg), prompt);
    }

    #[test]
    fn test_critical_section_passes_through_verbatim() {
        let cfg = config(600);
        let critical = "You MUST respond with valid JSON and never add prose.";
        let filler = "word ".repeat(400);
        let prompt = format!("{critical}\n\n{filler}");
        let out = compress_prompt(&prompt, &cfg);
        assert!(
            out.contains(critical),
            "critical text must survive verbatim: {out}"
        );
    }

    #[test]
    fn test_critical_sections_come_first() {
        let cfg = config(600);
        let filler = "lorem ipsum dolor sit amet consectetur ".repeat(40);
        let critical = "IMPORTANT: keep the interface stable across all versions of it.";
        let prompt = format!("{filler}\n\n{critical}");
        let out = compress_prompt(&prompt, &cfg);
        let crit_pos = out.find("IMPORTANT").unwrap_or(usize::MAX);
        let filler_pos = out.find("lorem").unwrap_or(usize::MAX);
        assert!(crit_pos < filler_pos, "criticals must be front-loaded");
    }

    #[test]
    fn test_output_bounded_by_target_plus_overhead() {
        let cfg = config(1000);
        let prompt = "sentence one here. ".repeat(3000);
        let out = compress_prompt(&prompt, &cfg);
        assert!(
            out.chars().count() <= cfg.target_chars + 200,
            "output {} exceeds target {} plus overhead",
            out.chars().count(),
            cfg.target_chars
        );
    }

    #[test]
    fn test_huge_prompt_keyword_survives_heavy_compression() {
        // 50 000 characters with one 200-character critical section.
        let cfg = config(1000);
        let critical =
            "You MUST include the license header in every generated file without exception, \
             and the output format is a single fenced code block containing only the file body."
                .to_string();
        assert!(critical.len() <= 200);
        let filler = "filler sentence with no special meaning at all. ".repeat(1100);
        let prompt = format!("{filler}\n\n{critical}\n\n{filler}");
        assert!(prompt.len() >= 50_000);
        let out = compress_prompt(&prompt, &cfg);
        assert!(out.len() <= 1500, "result length {} too large", out.len());
        assert!(out.contains("MUST include the license header"));
    }

    #[test]
    fn test_degenerate_budget_truncates_criticals_evenly() {
        let cfg = config(200);
        let crit_a = format!("REQUIRED: {}", "alpha ".repeat(100));
        let crit_b = format!("IMPORTANT: {}", "beta ".repeat(100));
        let prompt = format!("{crit_a}\n\n{crit_b}");
        let out = compress_prompt(&prompt, &cfg);
        assert!(!out.is_empty(), "degenerate branch must not produce empty output");
        assert!(out.contains("[truncated]"));
        assert!(out.contains("REQUIRED"));
        assert!(out.contains("IMPORTANT"));
        // Each share is target/2 plus marker; allow joins and two markers.
        assert!(out.chars().count() <= cfg.target_chars + 2 * 16 + 2);
    }

    #[test]
    fn test_tiny_shares_become_marker_stubs() {
        // Eight long sections against a small target leave each one a
        // share below any useful sentence cut.
        let cfg = config(200);
        let sections: Vec<String> = (0..8)
            .map(|i| format!("section {i} {}", "padding words here ".repeat(20)))
            .collect();
        let prompt = sections.join("\n\n");
        let out = compress_prompt(&prompt, &cfg);
        let parts: Vec<&str> = out.split("\n\n").collect();
        assert_eq!(parts.len(), 8, "no section may be dropped outright");
        for (i, part) in parts.iter().enumerate() {
            assert!(
                part.starts_with(&format!("section {i}")),
                "stub must keep the section head: {part}"
            );
            assert!(part.ends_with("[truncated]"), "stub missing marker: {part}");
        }
    }

    #[test]
    fn test_truncated_section_is_prefix_of_original() {
        let cfg = config(300);
        let body = "First sentence of the body. Second sentence follows it. ".repeat(30);
        let prompt = format!("{body}\n\n{}", "another long block of text here ".repeat(30));
        let out = compress_prompt(&prompt, &cfg);
        for part in out.split("\n\n") {
            let stripped = part.trim_end_matches(" [truncated]");
            assert!(
                prompt.contains(stripped.trim_end()),
                "every emitted section must be a prefix of an original section"
            );
        }
    }

    #[test]
    fn test_cut_prefers_sentence_boundary() {
        let s = "One full sentence here. Another half senten";
        let out = cut_at_sentence(s, 30);
        assert!(out.starts_with("One full sentence here."));
        assert!(out.ends_with("[truncated]"));
    }

    #[test]
    fn test_cut_hard_fallback_without_boundary() {
        let s = "a".repeat(100);
        let out = cut_at_sentence(&s, 20);
        assert_eq!(out, format!("{}{}", "a".repeat(20), " [truncated]"));
    }

    #[test]
    fn test_multibyte_input_never_panics() {
        let cfg = config(100);
        let prompt = "наполегливість і ще раз наполегливість ".repeat(50);
        let out = compress_prompt(&prompt, &cfg);
        assert!(!out.is_empty());
    }

    #[test]
    fn test_short_sections_classified_critical() {
        assert!(is_critical("short line", 120));
        assert!(!is_critical(&"plain filler text ".repeat(20), 120));
        assert!(is_critical(
            &format!("you must do the thing {}", "pad ".repeat(60)),
            120
        ));
    }
}
