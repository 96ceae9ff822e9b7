//! DeepSeek-R1 replies open with a `<think>…</think>` block. These helpers
//! separate that reasoning from the answer for display. The transcript itself
//! is never modified.

pub const OPEN_TAG: &str = "<think>";
pub const CLOSE_TAG: &str = "</think>";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyParts {
    /// Trimmed body of the first closed block, if non-empty.
    pub reasoning: Option<String>,
    /// Text with every closed block removed, trimmed.
    pub answer: String,
}

pub fn split_reasoning(text: &str) -> ReplyParts {
    let mut reasoning = None;
    let mut answer = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find(OPEN_TAG) {
        let body_start = start + OPEN_TAG.len();
        let Some(len) = rest[body_start..].find(CLOSE_TAG) else {
            break;
        };
        if reasoning.is_none() {
            reasoning = Some(rest[body_start..body_start + len].trim().to_string());
        }
        answer.push_str(&rest[..start]);
        rest = &rest[body_start + len + CLOSE_TAG.len()..];
    }
    answer.push_str(rest);

    ReplyParts {
        reasoning: reasoning.filter(|r| !r.is_empty()),
        answer: answer.trim().to_string(),
    }
}

/// True while the most recent `<think>` has no matching `</think>` yet.
pub fn is_thinking(text: &str) -> bool {
    match text.rfind(OPEN_TAG) {
        Some(start) => !text[start..].contains(CLOSE_TAG),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn plain_text_has_no_reasoning() {
        let parts = split_reasoning("  just an answer \n");
        assert_eq!(parts.reasoning, None);
        assert_eq!(parts.answer, "just an answer");
    }

    #[test]
    fn leading_block_is_split_off() {
        let parts = split_reasoning("<think>\nweigh options\n</think>\n\nThe answer is 4.");
        assert_eq!(parts.reasoning.as_deref(), Some("weigh options"));
        assert_eq!(parts.answer, "The answer is 4.");
    }

    #[test]
    fn only_first_block_is_reasoning_but_all_are_removed() {
        let parts = split_reasoning("<think>a</think>x <think>b</think>y");
        assert_eq!(parts.reasoning.as_deref(), Some("a"));
        assert_eq!(parts.answer, "x y");
    }

    #[test]
    fn empty_block_is_not_reasoning() {
        let parts = split_reasoning("<think>  </think>hi");
        assert_eq!(parts.reasoning, None);
        assert_eq!(parts.answer, "hi");
    }

    #[test]
    fn unclosed_block_stays_in_answer() {
        let parts = split_reasoning("<think>still going");
        assert_eq!(parts.reasoning, None);
        assert_eq!(parts.answer, "<think>still going");
    }

    #[rstest]
    #[case("", false)]
    #[case("<think>", true)]
    #[case("<think>hmm", true)]
    #[case("<think>hmm</think>", false)]
    #[case("<think>a</think> ok <think>b", true)]
    #[case("no tags", false)]
    fn thinking_detection(#[case] text: &str, #[case] expected: bool) {
        assert_eq!(is_thinking(text), expected, "text: {text:?}");
    }
}
