//! Speaker attribution: channel-split and engine-turn strategies.
//!
//! Both strategies produce per-word speaker labels which are then merged
//! into utterances. The channel-split path is exact (no confidence); the
//! engine path estimates a confidence score from segment quality.

use std::collections::HashMap;

use crate::engines::{SpeakerTurn, StereoPcm};
use crate::store::{DiarizationMethod, Speaker, SpeakerSegment, WordTiming};

pub const LOW_CONFIDENCE_THRESHOLD: f64 = 70.0;

/// Segments shorter than this count against the confidence estimate.
const SHORT_SEGMENT_SEC: f64 = 0.5;

/// Result of a diarization stage run, before persistence.
#[derive(Debug, Clone)]
pub struct DiarizationOutcome {
    pub segments: Vec<SpeakerSegment>,
    pub method: DiarizationMethod,
    pub confidence: Option<f64>,
    pub num_speakers: i32,
    pub warnings: Vec<String>,
}

/// Stereo strategy: left channel is the operator, right the client. Each
/// word goes to whichever channel carries more energy over its window.
pub fn split_by_channel_energy(pcm: &StereoPcm, words: &[WordTiming]) -> Vec<SpeakerSegment> {
    let sample_rate = pcm.sample_rate as f64;
    let n_samples = pcm.left.len().min(pcm.right.len());

    let mut labelled: Vec<SpeakerSegment> = Vec::with_capacity(words.len());
    for word in words {
        let start = ((word.start * sample_rate) as usize).min(n_samples);
        let end = ((word.end * sample_rate) as usize).min(n_samples);
        if start >= end {
            continue;
        }
        let rms_left = rms(&pcm.left[start..end]);
        let rms_right = rms(&pcm.right[start..end]);
        let speaker = if rms_left >= rms_right {
            Speaker::Operator
        } else {
            Speaker::Client
        };
        labelled.push(SpeakerSegment {
            speaker,
            start: word.start,
            end: word.end,
            text: word.word.clone(),
        });
    }
    merge_adjacent(labelled)
}

pub fn rms(samples: &[f32]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = samples.iter().map(|s| (*s as f64) * (*s as f64)).sum();
    (sum_sq / samples.len() as f64).sqrt()
}

/// Map engine labels to roles by first appearance: the earliest voice is
/// the operator, the next the client, anything further is unknown.
pub fn map_speaker_roles(turns: &[SpeakerTurn]) -> HashMap<String, Speaker> {
    let mut ordered: Vec<&SpeakerTurn> = turns.iter().collect();
    ordered.sort_by(|a, b| a.start.total_cmp(&b.start));

    let mut roles = HashMap::new();
    for turn in ordered {
        if roles.contains_key(&turn.label) {
            continue;
        }
        let role = match roles.len() {
            0 => Speaker::Operator,
            1 => Speaker::Client,
            _ => Speaker::Unknown,
        };
        roles.insert(turn.label.clone(), role);
    }
    roles
}

/// Assign each word to the turn with the greatest overlap. Ties go to the
/// earlier turn; a word overlapping nothing is unknown.
pub fn assign_words_to_turns(
    words: &[WordTiming],
    turns: &[SpeakerTurn],
    roles: &HashMap<String, Speaker>,
) -> Vec<SpeakerSegment> {
    let mut ordered: Vec<&SpeakerTurn> = turns.iter().collect();
    ordered.sort_by(|a, b| a.start.total_cmp(&b.start));

    let mut labelled = Vec::with_capacity(words.len());
    for word in words {
        let mut best_speaker = Speaker::Unknown;
        let mut best_overlap = 0.0_f64;
        for turn in &ordered {
            let overlap = (word.end.min(turn.end) - word.start.max(turn.start)).max(0.0);
            if overlap > best_overlap {
                best_overlap = overlap;
                best_speaker = roles.get(&turn.label).copied().unwrap_or(Speaker::Unknown);
            }
        }
        labelled.push(SpeakerSegment {
            speaker: best_speaker,
            start: word.start,
            end: word.end,
            text: word.word.clone(),
        });
    }
    merge_adjacent(labelled)
}

/// Confidence heuristic for engine-produced turns: start from 90 and lose
/// up to 30 points proportionally to the share of very short segments.
pub fn estimate_confidence(turns: &[SpeakerTurn]) -> f64 {
    if turns.is_empty() {
        return 0.0;
    }
    let total: f64 = turns.iter().map(|t| t.end - t.start).sum();
    if total <= 0.0 {
        return 0.0;
    }
    let short = turns
        .iter()
        .filter(|t| t.end - t.start < SHORT_SEGMENT_SEC)
        .count();
    let penalty = short as f64 / turns.len() as f64 * 30.0;
    (90.0 - penalty).clamp(0.0, 100.0)
}

/// Collapse consecutive words with the same speaker into one utterance.
pub fn merge_adjacent(words: Vec<SpeakerSegment>) -> Vec<SpeakerSegment> {
    let mut merged: Vec<SpeakerSegment> = Vec::new();
    for word in words {
        match merged.last_mut() {
            Some(current) if current.speaker == word.speaker => {
                current.end = word.end;
                current.text.push(' ');
                current.text.push_str(&word.text);
            }
            _ => merged.push(word),
        }
    }
    merged
}

/// Degraded result when the separation engine is unavailable: every word
/// belongs to the operator.
pub fn single_speaker_fallback(words: &[WordTiming]) -> Vec<SpeakerSegment> {
    let labelled = words
        .iter()
        .map(|w| SpeakerSegment {
            speaker: Speaker::Operator,
            start: w.start,
            end: w.end,
            text: w.word.clone(),
        })
        .collect();
    merge_adjacent(labelled)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn word(text: &str, start: f64, end: f64) -> WordTiming {
        WordTiming {
            word: text.to_string(),
            start,
            end,
        }
    }

    fn turn(label: &str, start: f64, end: f64) -> SpeakerTurn {
        SpeakerTurn {
            start,
            end,
            label: label.to_string(),
        }
    }

    fn stereo_with_left_then_right() -> StereoPcm {
        // 10 seconds at 1 kHz for easy indexing: first half loud on the
        // left, second half loud on the right.
        let mut left = vec![0.0f32; 10_000];
        let mut right = vec![0.0f32; 10_000];
        for i in 0..5_000 {
            left[i] = 0.8;
            right[i] = 0.01;
        }
        for i in 5_000..10_000 {
            left[i] = 0.01;
            right[i] = 0.8;
        }
        StereoPcm {
            left,
            right,
            sample_rate: 1_000,
        }
    }

    #[test]
    fn rms_of_constant_signal() {
        assert!((rms(&[0.5, 0.5, 0.5]) - 0.5).abs() < 1e-9);
        assert_eq!(rms(&[]), 0.0);
    }

    #[test]
    fn channel_split_assigns_words_by_energy() {
        let pcm = stereo_with_left_then_right();
        let words: Vec<WordTiming> = (0..10)
            .map(|i| word(&format!("w{i}"), i as f64, i as f64 + 0.8))
            .collect();

        let segments = split_by_channel_energy(&pcm, &words);
        assert_eq!(segments.len(), 2, "two merged segments expected");
        assert_eq!(segments[0].speaker, Speaker::Operator);
        assert_eq!(segments[0].text, "w0 w1 w2 w3 w4");
        assert_eq!(segments[1].speaker, Speaker::Client);
        assert_eq!(segments[1].text, "w5 w6 w7 w8 w9");
    }

    #[test]
    fn channel_split_skips_degenerate_word_windows() {
        let pcm = stereo_with_left_then_right();
        let words = vec![word("ok", 2.0, 2.0), word("hello", 1.0, 1.5)];
        let segments = split_by_channel_energy(&pcm, &words);
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].text, "hello");
    }

    #[test]
    fn roles_follow_first_appearance() {
        let turns = vec![
            turn("S1", 5.0, 8.0),
            turn("S0", 0.0, 4.0),
            turn("S2", 9.0, 12.0),
        ];
        let roles = map_speaker_roles(&turns);
        assert_eq!(roles["S0"], Speaker::Operator);
        assert_eq!(roles["S1"], Speaker::Client);
        assert_eq!(roles["S2"], Speaker::Unknown);
    }

    #[test]
    fn words_go_to_turn_with_max_overlap() {
        let turns = vec![turn("S0", 0.0, 2.0), turn("S1", 2.0, 4.0)];
        let roles = map_speaker_roles(&turns);
        // 0.5 s inside S0, 1.0 s inside S1
        let words = vec![word("bridge", 1.5, 3.0)];
        let segments = assign_words_to_turns(&words, &turns, &roles);
        assert_eq!(segments[0].speaker, Speaker::Client);
    }

    #[test]
    fn overlap_tie_goes_to_earlier_turn() {
        let turns = vec![turn("S0", 0.0, 2.0), turn("S1", 2.0, 4.0)];
        let roles = map_speaker_roles(&turns);
        // Exactly 0.5 s in each turn.
        let words = vec![word("split", 1.5, 2.5)];
        let segments = assign_words_to_turns(&words, &turns, &roles);
        assert_eq!(segments[0].speaker, Speaker::Operator);
    }

    #[test]
    fn word_without_overlap_is_unknown() {
        let turns = vec![turn("S0", 0.0, 1.0)];
        let roles = map_speaker_roles(&turns);
        let words = vec![word("late", 5.0, 5.5)];
        let segments = assign_words_to_turns(&words, &turns, &roles);
        assert_eq!(segments[0].speaker, Speaker::Unknown);
    }

    #[test]
    fn confidence_penalises_short_segments() {
        let clean = vec![turn("S0", 0.0, 5.0), turn("S1", 5.0, 10.0)];
        assert_eq!(estimate_confidence(&clean), 90.0);

        let choppy = vec![
            turn("S0", 0.0, 0.2),
            turn("S1", 0.2, 0.4),
            turn("S0", 0.4, 5.0),
            turn("S1", 5.0, 10.0),
        ];
        // 2 of 4 segments are short: 90 - 30 * 0.5 = 75
        assert_eq!(estimate_confidence(&choppy), 75.0);

        assert_eq!(estimate_confidence(&[]), 0.0);
    }

    #[test]
    fn merge_joins_text_with_single_space() {
        let words = vec![
            SpeakerSegment {
                speaker: Speaker::Operator,
                start: 0.0,
                end: 0.5,
                text: "good".into(),
            },
            SpeakerSegment {
                speaker: Speaker::Operator,
                start: 0.5,
                end: 1.0,
                text: "morning".into(),
            },
            SpeakerSegment {
                speaker: Speaker::Client,
                start: 1.0,
                end: 1.5,
                text: "hi".into(),
            },
        ];
        let merged = merge_adjacent(words);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].text, "good morning");
        assert_eq!(merged[0].start, 0.0);
        assert_eq!(merged[0].end, 1.0);
        assert_eq!(merged[1].text, "hi");
    }

    #[test]
    fn fallback_marks_everything_operator() {
        let words = vec![word("hello", 0.0, 0.5), word("world", 0.5, 1.0)];
        let segments = single_speaker_fallback(&words);
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].speaker, Speaker::Operator);
        assert_eq!(segments[0].text, "hello world");
    }
}
