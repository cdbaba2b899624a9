//! One conversation and its history

use super::router::{MessageRouter, RouteRequest};
use super::Message;
use crate::errors::AppError;
use crate::metrics;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use uuid::Uuid;

/// A conversation: an id plus its ordered, append-only history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    id: String,
    history: Vec<Message>,
    created_at: DateTime<Utc>,
    last_active_at: DateTime<Utc>,
}

/// Successful turn
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatReply {
    pub reply: String,
    pub session_id: String,
}

/// Failed turn, tagged with the session it happened in when one was resolved
#[derive(Debug)]
pub struct ChatFailure {
    pub session_id: Option<String>,
    pub error: AppError,
}

impl From<AppError> for ChatFailure {
    fn from(error: AppError) -> Self {
        Self {
            session_id: None,
            error,
        }
    }
}

impl IntoResponse for ChatFailure {
    fn into_response(self) -> Response {
        self.error.into_response_for_session(self.session_id)
    }
}

impl Session {
    /// Start a conversation with a fresh id and one seed system message
    pub fn new(system_prompt: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            history: vec![Message::system(system_prompt)],
            created_at: now,
            last_active_at: now,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn history(&self) -> &[Message] {
        &self.history
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_active_at(&self) -> DateTime<Utc> {
        self.last_active_at
    }

    pub fn append(&mut self, message: Message) {
        self.history.push(message);
        self.last_active_at = Utc::now();
    }

    /// Handle one user turn.
    ///
    /// The user message is kept even when routing fails; the assistant
    /// message is appended only on success.
    pub async fn process(
        &mut self,
        router: &MessageRouter,
        message: &str,
        image: Option<Vec<u8>>,
    ) -> Result<ChatReply, ChatFailure> {
        let start = Instant::now();
        let request = RouteRequest::new(message, image);

        self.append(Message::user(message));

        match router.route(&request, &self.history).await {
            Ok(result) => {
                self.append(Message::assistant(result.reply.clone()));
                metrics::record_chat(request.route_name(), true, start.elapsed().as_secs_f64());

                tracing::info!(
                    session_id = %self.id,
                    route = request.route_name(),
                    history_len = self.history.len(),
                    "Chat turn completed"
                );

                Ok(ChatReply {
                    reply: result.reply,
                    session_id: self.id.clone(),
                })
            }
            Err(error) => {
                metrics::record_chat(request.route_name(), false, start.elapsed().as_secs_f64());

                tracing::warn!(
                    session_id = %self.id,
                    route = request.route_name(),
                    error = %error,
                    "Chat turn failed"
                );

                Err(ChatFailure {
                    session_id: Some(self.id.clone()),
                    error,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::router::fakes::Fakes;
    use crate::chat::Role;
    use axum::http::StatusCode;
    use std::time::Duration;

    #[test]
    fn test_new_session_is_seeded() {
        let session = Session::new("seed prompt");
        assert_eq!(session.history().len(), 1);
        assert_eq!(session.history()[0], Message::system("seed prompt"));
        assert!(Uuid::parse_str(session.id()).is_ok());
        assert_ne!(Session::new("x").id(), Session::new("x").id());
    }

    #[tokio::test]
    async fn test_success_appends_two() {
        let fakes = Fakes::new("ctx", "unused");
        let router = fakes.router(Duration::from_secs(5));
        let mut session = Session::new("seed");

        let reply = session.process(&router, "Hi", None).await.unwrap();
        assert_eq!(reply.reply, "reply to Hi");
        assert_eq!(reply.session_id, session.id());
        assert_eq!(session.history().len(), 3);
        assert_eq!(session.history()[1], Message::user("Hi"));
        assert_eq!(session.history()[2].role(), Role::Assistant);

        session.process(&router, "And again", None).await.unwrap();
        assert_eq!(session.history().len(), 5);
    }

    #[tokio::test]
    async fn test_failure_keeps_user_message() {
        let fakes = Fakes::new("ctx", "unused");
        let router = fakes.router(Duration::from_secs(5));
        let mut session = Session::new("seed");

        let failure = session.process(&router, "please fail", None).await.unwrap_err();
        assert_eq!(failure.session_id.as_deref(), Some(session.id()));
        assert!(matches!(failure.error, AppError::GenerationError { .. }));
        assert_eq!(session.history().len(), 2);
        assert_eq!(session.history()[1], Message::user("please fail"));

        // The session stays usable afterwards
        session.process(&router, "ok now", None).await.unwrap();
        assert_eq!(session.history().len(), 4);
    }

    #[tokio::test]
    async fn test_generator_sees_current_message_last() {
        let fakes = Fakes::new("ctx", "unused");
        let router = fakes.router(Duration::from_secs(5));
        let mut session = Session::new("seed");

        session.process(&router, "first", None).await.unwrap();
        session.process(&router, "second", None).await.unwrap();

        let seen = fakes.generator.seen.lock().unwrap();
        // seed + first + reply + second
        assert_eq!(seen[1].1, 4);
    }

    #[test]
    fn test_failure_response_carries_session_id() {
        let failure = ChatFailure {
            session_id: Some("abc".to_string()),
            error: AppError::GenerationError {
                message: "down".to_string(),
            },
        };
        let response = failure.into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_session_serialization() {
        let mut session = Session::new("seed");
        session.append(Message::user("hello"));

        let json = serde_json::to_string(&session).unwrap();
        let restored: Session = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.id(), session.id());
        assert_eq!(restored.history(), session.history());
    }
}
