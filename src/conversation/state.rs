//! Where a user is in the onboarding dialogue and what they entered so far.

use crate::generation::{Clarification, QaTurn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostStep {
    AwaitToken,
    AwaitCode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateStep {
    AwaitToken,
    AwaitIdea,
    /// 1-based clarification round.
    Consultation { round: u8 },
    Building,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelpStep {
    AwaitMessage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminStep {
    Broadcast,
    ReplyToUser { user_id: i64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DialogState {
    #[default]
    MainMenu,
    Host(HostStep),
    Create(CreateStep),
    Help(HelpStep),
    Admin(AdminStep),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Main,
    Host,
    Create,
    Help,
    Admin,
}

impl DialogState {
    pub fn flow(&self) -> Flow {
        match self {
            DialogState::MainMenu => Flow::Main,
            DialogState::Host(_) => Flow::Host,
            DialogState::Create(_) => Flow::Create,
            DialogState::Help(_) => Flow::Help,
            DialogState::Admin(_) => Flow::Admin,
        }
    }

    /// Steps Back never returns to.
    fn is_transient(&self) -> bool {
        matches!(
            self,
            DialogState::Create(CreateStep::Consultation { .. })
                | DialogState::Create(CreateStep::Building)
        )
    }
}

/// Values collected while walking a flow.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Draft {
    /// Verified provider credential.
    pub token: Option<String>,
    pub public_handle: Option<String>,
    pub summary: Option<String>,
    pub history: Vec<QaTurn>,
    /// Question currently shown to the user.
    pub pending: Option<Clarification>,
}

impl Draft {
    fn forget_idea(&mut self) {
        self.summary = None;
        self.history.clear();
        self.pending = None;
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConversationSession {
    state: DialogState,
    pub draft: Draft,
    trail: Vec<DialogState>,
}

impl ConversationSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> DialogState {
        self.state
    }

    /// Move to `next`. Entering another flow forgets the trail of the old one.
    pub fn advance(&mut self, next: DialogState) {
        if next.flow() != self.state.flow() {
            self.trail.clear();
        } else if !self.state.is_transient() && self.state != next {
            self.trail.push(self.state);
        }
        self.state = next;
    }

    /// Previous step of the current flow, or the main menu with a clean draft.
    pub fn back(&mut self) -> DialogState {
        match self.trail.pop() {
            Some(previous) => {
                if previous == DialogState::Create(CreateStep::AwaitIdea) {
                    self.draft.forget_idea();
                }
                self.state = previous;
            }
            None => self.reset(),
        }
        self.state
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
