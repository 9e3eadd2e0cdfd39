//! Transcript rendering.
//!
//! Turns the AI conclusion payload into a plain-text artifact: a summary
//! block followed by a numbered outline where every entry carries its
//! `[mm:ss]` timestamp and nested sub-points are indented below it.

use crate::protocol::conclusion::ModelResult;

/// Renders the summary and outline as transcript text.
///
/// Returns `None` when the payload renders to nothing; an empty transcript
/// is treated as absence and never written to disk.
#[must_use]
pub fn render(result: &ModelResult) -> Option<String> {
    let mut lines: Vec<String> = Vec::new();

    if !result.summary.is_empty() {
        lines.push("[AI Summary]".to_owned());
        lines.push(result.summary.clone());
        lines.push(String::new());
    }

    if let Some(outline) = result.outline.as_ref().filter(|o| !o.is_empty()) {
        lines.push("[Outline]".to_owned());
        for (idx, item) in outline.iter().enumerate() {
            lines.push(format!(
                "{}. [{}] {}",
                idx + 1,
                format_timestamp(item.timestamp),
                item.title
            ));
            for sub in &item.part_outline {
                lines.push(format!(
                    "   - [{}] {}",
                    format_timestamp(sub.timestamp),
                    sub.content
                ));
            }
        }
        lines.push(String::new());
    }

    if lines.is_empty() {
        return None;
    }
    Some(lines.join("\n"))
}

/// Floor-divides seconds into a zero-padded `mm:ss` stamp.
fn format_timestamp(seconds: u64) -> String {
    format!("{:02}:{:02}", seconds / 60, seconds % 60)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::conclusion::{OutlineItem, PartOutline};

    #[test]
    fn empty_payload_renders_nothing() {
        assert!(render(&ModelResult::default()).is_none());
    }

    #[test]
    fn summary_only() {
        let result = ModelResult {
            summary: "A short talk about nothing.".to_owned(),
            ..ModelResult::default()
        };
        let text = render(&result).expect("text");
        assert!(text.starts_with("[AI Summary]\nA short talk about nothing."));
        assert!(!text.contains("[Outline]"));
    }

    #[test]
    fn outline_entries_are_numbered_and_timestamped() {
        let result = ModelResult {
            summary: "Summary.".to_owned(),
            outline: Some(vec![
                OutlineItem {
                    title: "Intro".to_owned(),
                    timestamp: 5,
                    part_outline: vec![PartOutline {
                        timestamp: 80,
                        content: "Greeting".to_owned(),
                    }],
                },
                OutlineItem {
                    title: "Main part".to_owned(),
                    timestamp: 3671,
                    part_outline: vec![],
                },
            ]),
            ..ModelResult::default()
        };
        let text = render(&result).expect("text");
        assert!(text.contains("1. [00:05] Intro"));
        assert!(text.contains("   - [01:20] Greeting"));
        assert!(text.contains("2. [61:11] Main part"));
    }
}
