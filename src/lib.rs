pub mod cli;
pub mod codec;
pub mod config;
pub mod consumer;
pub mod dispatcher;
pub mod error;
pub mod providers;
pub mod relay;
pub mod server;
pub mod think;
pub mod transcript;

use std::io::Write;

use colored::*;

pub use config::{BridgeConfig, Timeouts};
pub use consumer::{ChatClient, ConsumerState, DeltaStream, StreamConsumer};
pub use dispatcher::{select_endpoint, EndpointProbe, HttpProbe};
pub use error::{BridgeError, ClientError};
pub use providers::{ChatMessage, Endpoint, Role};
pub use transcript::{drive_reply, Conversation, ReplySink, ReplyState};

use think::{is_thinking, CLOSE_TAG, OPEN_TAG};

// ---------------------------------------------------------------------------
// Terminal rendering
// ---------------------------------------------------------------------------

/// Renders a streaming reply to a terminal.
///
/// The sink receives the whole transcript on every update and prints only
/// the new suffix. `<think>` blocks are printed dimmed, or replaced by a
/// single "thinking..." marker when reasoning is hidden. A trailing fragment
/// that could still become a tag is held back until the next update.
pub struct TerminalSink<W: Write> {
    out: W,
    show_reasoning: bool,
    printed: usize,
    in_think: bool,
    announced: bool,
}

impl<W: Write> TerminalSink<W> {
    pub fn new(out: W, show_reasoning: bool) -> Self {
        Self {
            out,
            show_reasoning,
            printed: 0,
            in_think: false,
            announced: false,
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn render(&mut self, mut text: &str) {
        while !text.is_empty() {
            if self.in_think {
                let (body, rest) = match text.find(CLOSE_TAG) {
                    Some(i) => (&text[..i], Some(&text[i + CLOSE_TAG.len()..])),
                    None => (text, None),
                };
                if self.show_reasoning {
                    let _ = write!(self.out, "{}", body.dimmed());
                }
                match rest {
                    Some(rest) => {
                        self.in_think = false;
                        text = rest.trim_start_matches('\n');
                    }
                    None => break,
                }
            } else {
                match text.find(OPEN_TAG) {
                    Some(i) => {
                        let _ = write!(self.out, "{}", &text[..i]);
                        self.in_think = true;
                        text = &text[i + OPEN_TAG.len()..];
                    }
                    None => {
                        let _ = write!(self.out, "{text}");
                        break;
                    }
                }
            }
        }
        let _ = self.out.flush();
    }

    /// Length of a trailing fragment that is a strict prefix of a tag.
    fn held_back(text: &str) -> usize {
        text.rfind('<')
            .map(|i| &text[i..])
            .filter(|t| {
                (OPEN_TAG.starts_with(t) && *t != OPEN_TAG)
                    || (CLOSE_TAG.starts_with(t) && *t != CLOSE_TAG)
            })
            .map_or(0, str::len)
    }
}

impl<W: Write> ReplySink for TerminalSink<W> {
    fn show_pending(&mut self) {
        self.printed = 0;
        self.in_think = false;
        self.announced = false;
        let _ = write!(self.out, "{} ", "assistant>".bright_cyan().bold());
        let _ = self.out.flush();
    }

    fn replace_reply(&mut self, transcript: &str) {
        if transcript.len() < self.printed || !transcript.is_char_boundary(self.printed) {
            return;
        }
        if !self.show_reasoning && !self.announced && is_thinking(transcript) {
            self.announced = true;
            let _ = write!(self.out, "{}", "thinking...".dimmed());
        }
        let fresh = &transcript[self.printed..];
        let ready = &fresh[..fresh.len() - Self::held_back(fresh)];
        self.printed += ready.len();
        self.render(ready);
    }

    fn commit(&mut self, message: &ChatMessage) {
        if let Some(rest) = message.content.get(self.printed..) {
            self.render(rest);
        }
        let _ = writeln!(self.out);
    }

    fn roll_back(&mut self) {
        let _ = writeln!(self.out);
    }

    fn notify_error(&mut self, message: &str) {
        let _ = writeln!(self.out, "{} {}", "error:".bright_red().bold(), message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rendered(show_reasoning: bool, updates: &[&str]) -> String {
        colored::control::set_override(false);
        let mut sink = TerminalSink::new(Vec::new(), show_reasoning);
        sink.show_pending();
        for u in updates {
            sink.replace_reply(u);
        }
        if let Some(last) = updates.last() {
            sink.commit(&ChatMessage::assistant(*last));
        }
        String::from_utf8(sink.into_inner()).expect("utf8")
    }

    #[test]
    fn prints_only_new_suffix() {
        assert_eq!(rendered(true, &["He", "Hell", "Hello"]), "assistant> Hello\n");
    }

    #[test]
    fn hides_reasoning_by_default() {
        let out = rendered(false, &["<think>plan", "<think>plan</think>\nAnswer"]);
        assert_eq!(out, "assistant> thinking...Answer\n");
    }

    #[test]
    fn shows_reasoning_when_asked() {
        let out = rendered(true, &["<think>plan</think>\nAnswer"]);
        assert_eq!(out, "assistant> planAnswer\n");
    }

    #[test]
    fn tag_split_across_updates_is_not_printed() {
        let out = rendered(false, &["ok <thi", "ok <think>x</thi", "ok <think>x</think>done"]);
        assert_eq!(out, "assistant> ok thinking...done\n");
    }

    #[test]
    fn held_back_only_for_tag_prefixes() {
        assert_eq!(TerminalSink::<Vec<u8>>::held_back("a <thi"), 4);
        assert_eq!(TerminalSink::<Vec<u8>>::held_back("a </"), 2);
        assert_eq!(TerminalSink::<Vec<u8>>::held_back("a < b"), 0);
        assert_eq!(TerminalSink::<Vec<u8>>::held_back("a <think>"), 0);
    }

    #[test]
    fn error_is_printed_once() {
        colored::control::set_override(false);
        let mut sink = TerminalSink::new(Vec::new(), false);
        sink.notify_error("No response received");
        let out = String::from_utf8(sink.into_inner()).expect("utf8");
        assert_eq!(out, "error: No response received\n");
    }
}
