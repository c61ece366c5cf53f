//! Chronological merge of per-speaker transcripts.
//!
//! Each speaker's segments are already time-ordered. The merge pools them
//! across speakers and stable-sorts by start time. To make the output
//! independent of the order speaker files happened to be iterated on
//! disk, speaker groups are first put into canonical (name) order, so
//! equal timestamps always tie-break the same way and re-running the
//! stage yields byte-identical text.

use super::engine::Segment;

/// One speaker's segments, tagged with the speaker's name.
#[derive(Debug, Clone)]
pub struct SpeakerSegments {
    pub speaker: String,
    pub segments: Vec<Segment>,
}

/// One line of the merged master transcript.
#[derive(Debug, Clone, PartialEq)]
pub struct MergedLine {
    pub start: f64,
    pub speaker: String,
    pub text: String,
}

/// Merge all speakers' segments into one chronological sequence.
pub fn merge(speakers: &[SpeakerSegments]) -> Vec<MergedLine> {
    let mut groups: Vec<&SpeakerSegments> = speakers.iter().collect();
    groups.sort_by(|a, b| a.speaker.cmp(&b.speaker));

    let mut pooled: Vec<MergedLine> = Vec::new();
    for group in groups {
        for segment in &group.segments {
            pooled.push(MergedLine {
                start: segment.start,
                speaker: group.speaker.clone(),
                text: segment.text.clone(),
            });
        }
    }

    // Stable sort: equal start times keep canonical speaker order.
    pooled.sort_by(|a, b| a.start.total_cmp(&b.start));
    pooled
}

/// Format seconds as `HH:MM:SS` for transcript line prefixes.
pub fn format_timestamp(seconds: f64) -> String {
    let total = seconds.max(0.0) as u64;
    let (h, rem) = (total / 3600, total % 3600);
    let (m, s) = (rem / 60, rem % 60);
    format!("{:02}:{:02}:{:02}", h, m, s)
}

/// Render one transcript line: `[HH:MM:SS] speaker: text`.
pub fn format_line(start: f64, speaker: &str, text: &str) -> String {
    format!("[{}] {}: {}", format_timestamp(start), speaker, text)
}

/// Render the merged sequence as the master transcript text.
pub fn render(lines: &[MergedLine]) -> String {
    lines
        .iter()
        .map(|l| format_line(l.start, &l.speaker, &l.text))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seg(start: f64, text: &str) -> Segment {
        Segment {
            start,
            text: text.to_string(),
        }
    }

    #[test]
    fn timestamps_format_as_hms() {
        assert_eq!(format_timestamp(0.0), "00:00:00");
        assert_eq!(format_timestamp(59.9), "00:00:59");
        assert_eq!(format_timestamp(61.0), "00:01:01");
        assert_eq!(format_timestamp(3661.5), "01:01:01");
    }

    #[test]
    fn merge_is_sorted_by_start_time() {
        let speakers = vec![
            SpeakerSegments {
                speaker: "alice".into(),
                segments: vec![seg(0.0, "a0"), seg(10.0, "a1")],
            },
            SpeakerSegments {
                speaker: "bob".into(),
                segments: vec![seg(5.0, "b0"), seg(12.0, "b1")],
            },
        ];
        let merged = merge(&speakers);
        let starts: Vec<f64> = merged.iter().map(|l| l.start).collect();
        assert_eq!(starts, vec![0.0, 5.0, 10.0, 12.0]);
    }

    #[test]
    fn equal_timestamps_keep_canonical_speaker_order() {
        let speakers = vec![
            SpeakerSegments {
                speaker: "zoe".into(),
                segments: vec![seg(3.0, "z")],
            },
            SpeakerSegments {
                speaker: "alice".into(),
                segments: vec![seg(3.0, "a")],
            },
        ];
        let merged = merge(&speakers);
        assert_eq!(merged[0].speaker, "alice");
        assert_eq!(merged[1].speaker, "zoe");
    }

    #[test]
    fn merge_is_invariant_to_iteration_order() {
        let alice = SpeakerSegments {
            speaker: "alice".into(),
            segments: vec![seg(1.0, "hello"), seg(4.0, "again")],
        };
        let bob = SpeakerSegments {
            speaker: "bob".into(),
            segments: vec![seg(1.0, "hi"), seg(2.0, "yes")],
        };

        let forward = render(&merge(&[alice.clone(), bob.clone()]));
        let reverse = render(&merge(&[bob, alice]));
        assert_eq!(forward, reverse);
    }

    #[test]
    fn rendered_lines_carry_timestamp_and_speaker() {
        let speakers = vec![SpeakerSegments {
            speaker: "alice".into(),
            segments: vec![seg(65.0, "hello there")],
        }];
        assert_eq!(render(&merge(&speakers)), "[00:01:05] alice: hello there");
    }
}
