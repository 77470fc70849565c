use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Number of chapters in every book.
pub const CHAPTER_COUNT: usize = 10;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StoryData {
    pub outline: Vec<String>,
    pub character_arcs: String,
}

impl StoryData {
    /// Checks the outline has exactly one non-blank summary per chapter.
    pub fn validate(&self) -> Result<(), TransitionError> {
        if self.outline.len() != CHAPTER_COUNT
            || self.outline.iter().any(|entry| entry.trim().is_empty())
        {
            return Err(TransitionError::MalformedOutline(self.outline.len()));
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    #[default]
    Premise,
    GeneratingOutline,
    DisplayOutline,
    GeneratingChapters,
    Completed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Premise => "premise entry",
            SessionState::GeneratingOutline => "outline generation",
            SessionState::DisplayOutline => "outline display",
            SessionState::GeneratingChapters => "chapter generation",
            SessionState::Completed => "completed",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEvent {
    SubmitPremise(String),
    OutlineReady(StoryData),
    OutlineFailed,
    StartWriting,
    ChapterWritten(String),
    ChaptersFailed,
    Reset,
}

impl SessionEvent {
    fn name(&self) -> &'static str {
        match self {
            SessionEvent::SubmitPremise(_) => "submit premise",
            SessionEvent::OutlineReady(_) => "outline ready",
            SessionEvent::OutlineFailed => "outline failed",
            SessionEvent::StartWriting => "start writing",
            SessionEvent::ChapterWritten(_) => "chapter written",
            SessionEvent::ChaptersFailed => "chapters failed",
            SessionEvent::Reset => "reset",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("cannot {event} during {state}")]
    Invalid {
        state: SessionState,
        event: &'static str,
    },
    #[error("Please enter a story premise.")]
    EmptyPremise,
    #[error("the outline must contain {} chapter summaries, got {}", CHAPTER_COUNT, .0)]
    MalformedOutline(usize),
    #[error("the book already has {} chapters", CHAPTER_COUNT)]
    TooManyChapters,
}

/// The full resumable state of one story-generation attempt.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub state: SessionState,
    pub premise: String,
    pub story_data: Option<StoryData>,
    pub chapters: Vec<String>,
    /// Generation-attempt token; bumped by every user action that starts or abandons work.
    #[serde(default)]
    pub attempt: u64,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total transition function. Returns the next session, leaving `self` untouched.
    pub fn apply(&self, event: SessionEvent) -> Result<Session, TransitionError> {
        let mut next = self.clone();

        match (self.state, event) {
            (_, SessionEvent::Reset) => {
                return Ok(Session {
                    attempt: self.attempt + 1,
                    ..Session::default()
                });
            }
            (SessionState::Premise, SessionEvent::SubmitPremise(premise)) => {
                let premise = premise.trim();
                if premise.is_empty() {
                    return Err(TransitionError::EmptyPremise);
                }
                next.premise = premise.to_string();
                next.state = SessionState::GeneratingOutline;
                next.attempt += 1;
            }
            (SessionState::GeneratingOutline, SessionEvent::OutlineReady(data)) => {
                data.validate()?;
                next.story_data = Some(data);
                next.chapters.clear();
                next.state = SessionState::DisplayOutline;
            }
            (SessionState::GeneratingOutline, SessionEvent::OutlineFailed) => {
                next.state = SessionState::Premise;
            }
            (SessionState::DisplayOutline, SessionEvent::StartWriting) => {
                next.state = if self.chapters.len() >= CHAPTER_COUNT {
                    SessionState::Completed
                } else {
                    SessionState::GeneratingChapters
                };
                next.attempt += 1;
            }
            (SessionState::GeneratingChapters, SessionEvent::ChapterWritten(text)) => {
                if self.chapters.len() >= CHAPTER_COUNT {
                    return Err(TransitionError::TooManyChapters);
                }
                next.chapters.push(text);
                if next.chapters.len() == CHAPTER_COUNT {
                    next.state = SessionState::Completed;
                }
            }
            (SessionState::GeneratingChapters, SessionEvent::ChaptersFailed) => {
                next.state = SessionState::DisplayOutline;
            }
            (state, event) => {
                return Err(TransitionError::Invalid {
                    state,
                    event: event.name(),
                });
            }
        }

        Ok(next)
    }

    /// The form written to storage: an in-flight outline request cannot be
    /// resumed, so it is recorded as premise entry.
    pub fn persisted(&self) -> Session {
        let mut saved = self.clone();
        if saved.state == SessionState::GeneratingOutline {
            saved.state = SessionState::Premise;
        }
        saved
    }

    /// Normalizes a reloaded session. Returns `None` if it breaks the session invariants.
    pub fn normalized(mut self) -> Option<Session> {
        if self.chapters.len() > CHAPTER_COUNT {
            return None;
        }

        match self.state {
            SessionState::GeneratingOutline => self.state = SessionState::Premise,
            SessionState::DisplayOutline
            | SessionState::GeneratingChapters
            | SessionState::Completed => {
                let data = self.story_data.as_ref()?;
                if data.validate().is_err() {
                    return None;
                }
                if self.state == SessionState::GeneratingChapters
                    && self.chapters.len() == CHAPTER_COUNT
                {
                    self.state = SessionState::Completed;
                }
                if self.state == SessionState::Completed && self.chapters.len() < CHAPTER_COUNT {
                    return None;
                }
            }
            SessionState::Premise => {}
        }

        Some(self)
    }

    pub fn is_complete(&self) -> bool {
        self.state == SessionState::Completed
    }

    /// 1-based number of the next chapter to write, if any remain.
    pub fn next_chapter(&self) -> Option<usize> {
        (self.chapters.len() < CHAPTER_COUNT).then(|| self.chapters.len() + 1)
    }
}
