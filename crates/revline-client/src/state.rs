//! Session state shared by the engine components.
//!
//! The [`SessionState`] struct is wrapped in `Arc<Mutex<>>` and cloned into
//! every component that needs to know who is signed in and what the user is
//! looking at.

use std::sync::{Arc, Mutex, MutexGuard};

use revline_shared::types::{ConversationId, UserId};

/// Screen currently shown, as reported by the navigation layer.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Screen {
    /// Sign-in flow, before any session exists.
    #[default]
    Auth,
    /// Landing screen shown while the session is being restored.
    Home,
    Inbox,
    ChatThread(ConversationId),
    /// Any other screen (leaderboards, garage, events).
    Other(String),
}

impl Screen {
    /// Screens shown before the user is fully inside the app.
    pub fn is_pre_session(&self) -> bool {
        matches!(self, Screen::Auth | Screen::Home)
    }
}

/// Central session state.
#[derive(Debug, Clone)]
pub struct SessionState {
    /// The signed-in user. `None` outside a session.
    pub user_id: Option<UserId>,

    /// Bumped on every sign-in and sign-out. Detached tasks capture it and
    /// drop their results when it has moved on.
    pub generation: u64,

    pub screen: Screen,

    /// Whether the app is in the foreground.
    pub foreground: bool,
}

impl SessionState {
    pub fn new() -> Self {
        Self {
            user_id: None,
            generation: 0,
            screen: Screen::Auth,
            foreground: true,
        }
    }

    /// The thread the user is looking at, if any.
    pub fn active_thread(&self) -> Option<&ConversationId> {
        match self.screen {
            Screen::ChatThread(ref id) => Some(id),
            _ => None,
        }
    }

    pub fn is_viewing(&self, conversation_id: &ConversationId) -> bool {
        self.foreground && self.active_thread() == Some(conversation_id)
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

/// Cloneable handle to the session state.
#[derive(Debug, Clone, Default)]
pub struct SharedSession {
    inner: Arc<Mutex<SessionState>>,
}

impl SharedSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn user_id(&self) -> Option<UserId> {
        self.lock().user_id.clone()
    }

    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    /// The user id, but only if the session that `generation` was taken
    /// from is still current.
    pub fn user_if_current(&self, generation: u64) -> Option<UserId> {
        let state = self.lock();
        if state.generation == generation {
            state.user_id.clone()
        } else {
            None
        }
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.lock().generation == generation
    }

    /// Begin a session and return its generation.
    pub fn begin(&self, user_id: UserId) -> u64 {
        let mut state = self.lock();
        state.user_id = Some(user_id);
        state.generation += 1;
        state.generation
    }

    /// End the session. Returns the user that was signed in.
    pub fn end(&self) -> Option<UserId> {
        let mut state = self.lock();
        state.generation += 1;
        state.screen = Screen::Auth;
        state.user_id.take()
    }

    pub fn snapshot(&self) -> SessionState {
        self.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generation_guards_stale_tasks() {
        let session = SharedSession::new();
        assert_eq!(session.user_id(), None);

        let gen = session.begin(UserId::new("u1"));
        assert!(session.is_current(gen));
        assert_eq!(session.user_if_current(gen), Some(UserId::new("u1")));

        assert_eq!(session.end(), Some(UserId::new("u1")));
        assert!(!session.is_current(gen));
        assert_eq!(session.user_if_current(gen), None);

        let next = session.begin(UserId::new("u2"));
        assert!(next > gen);
        assert_eq!(session.user_if_current(gen), None);
    }

    #[test]
    fn test_viewing_requires_foreground() {
        let mut state = SessionState::new();
        let cid = ConversationId::new("c1");
        state.screen = Screen::ChatThread(cid.clone());
        assert!(state.is_viewing(&cid));
        assert!(!state.is_viewing(&ConversationId::new("c2")));

        state.foreground = false;
        assert!(!state.is_viewing(&cid));
    }

    #[test]
    fn test_pre_session_screens() {
        assert!(Screen::Auth.is_pre_session());
        assert!(Screen::Home.is_pre_session());
        assert!(!Screen::Inbox.is_pre_session());
        assert!(!Screen::Other("garage".into()).is_pre_session());
    }
}
