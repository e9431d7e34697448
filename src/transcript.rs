//! Incremental transcript assembly.
//!
//! Transcription arrives in fragments. Consecutive fragments from the same
//! speaker belong to one entry; a speaker change starts a new one.

use crate::events::{Speaker, TranscriptEvent};
use serde::Serialize;

/// Assigns arrival order and the `continues` flag to fragments.
#[derive(Debug, Default)]
pub struct TranscriptSequencer {
    next_order: u64,
    last_speaker: Option<Speaker>,
}

impl TranscriptSequencer {
    pub fn next(&mut self, sender: Speaker, text: String) -> TranscriptEvent {
        let event = TranscriptEvent {
            sender,
            text,
            order: self.next_order,
            continues: self.last_speaker == Some(sender),
        };
        self.next_order += 1;
        self.last_speaker = Some(sender);
        event
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TranscriptEntry {
    pub sender: Speaker,
    pub text: String,
}

/// Merged view of a conversation, for callers that want whole turns.
#[derive(Debug, Default, Clone, Serialize)]
pub struct TranscriptLog {
    entries: Vec<TranscriptEntry>,
}

impl TranscriptLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append to the last entry or start a new one.
    pub fn apply(&mut self, event: &TranscriptEvent) {
        match self.entries.last_mut() {
            Some(last) if last.sender == event.sender => last.text.push_str(&event.text),
            _ => self.entries.push(TranscriptEntry {
                sender: event.sender,
                text: event.text.clone(),
            }),
        }
    }

    pub fn entries(&self) -> &[TranscriptEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequencer_marks_continuations() {
        let mut seq = TranscriptSequencer::default();
        let a = seq.next(Speaker::Agent, "Hi ".into());
        let b = seq.next(Speaker::Agent, "there".into());
        let c = seq.next(Speaker::User, "hello".into());

        assert_eq!((a.order, a.continues), (0, false));
        assert_eq!((b.order, b.continues), (1, true));
        assert_eq!((c.order, c.continues), (2, false));
    }

    #[test]
    fn test_log_merges_same_speaker() {
        let mut seq = TranscriptSequencer::default();
        let mut log = TranscriptLog::new();
        for (who, text) in [
            (Speaker::Agent, "Welcome "),
            (Speaker::Agent, "aboard."),
            (Speaker::User, "Thanks"),
            (Speaker::Agent, "Stage two."),
        ] {
            log.apply(&seq.next(who, text.into()));
        }

        let texts: Vec<&str> = log.entries().iter().map(|e| e.text.as_str()).collect();
        assert_eq!(texts, vec!["Welcome aboard.", "Thanks", "Stage two."]);
        assert_eq!(log.entries()[1].sender, Speaker::User);
    }
}
