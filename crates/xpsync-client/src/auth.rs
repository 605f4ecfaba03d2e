//! The auth collaborator interface.
//!
//! The outbox only ever asks two questions: "what bearer credential should
//! this request carry?" and "who is signed in right now?". Neither may fail;
//! an expired or missing session is reported as `None` and the outbox simply
//! tries again later.

use std::sync::RwLock;

use async_trait::async_trait;

use xpsync_shared::SubjectId;

#[async_trait]
pub trait CredentialProvider: Send + Sync + 'static {
    /// A currently valid bearer token, refreshing a stale one if possible.
    /// `None` means "no session", including a refresh that failed.
    async fn access_token(&self) -> Option<String>;

    /// The authenticated principal, if any.
    fn current_subject(&self) -> Option<SubjectId>;
}

#[derive(Debug, Clone)]
struct Session {
    subject: SubjectId,
    token: String,
}

/// In-memory credential holder the host updates on login / logout.
#[derive(Debug, Default)]
pub struct StaticCredentials {
    session: RwLock<Option<Session>>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signed_in(subject: impl Into<SubjectId>, token: impl Into<String>) -> Self {
        let creds = Self::new();
        creds.set_session(subject, token);
        creds
    }

    pub fn set_session(&self, subject: impl Into<SubjectId>, token: impl Into<String>) {
        let session = Session {
            subject: subject.into(),
            token: token.into(),
        };
        match self.session.write() {
            Ok(mut guard) => *guard = Some(session),
            Err(poisoned) => *poisoned.into_inner() = Some(session),
        }
    }

    pub fn clear_session(&self) {
        match self.session.write() {
            Ok(mut guard) => *guard = None,
            Err(poisoned) => *poisoned.into_inner() = None,
        }
    }

    fn read(&self) -> Option<Session> {
        match self.session.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn access_token(&self) -> Option<String> {
        self.read().map(|s| s.token)
    }

    fn current_subject(&self) -> Option<SubjectId> {
        self.read().map(|s| s.subject)
    }
}
