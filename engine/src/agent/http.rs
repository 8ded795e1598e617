use super::{Activity, AgentRuntime, TurnResponse};
use crate::auth::Token;
use crate::dataset::Turn;
use crate::error::{AgentError, AgentResult};
use async_trait::async_trait;
use model::Usage;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StartRequest {
    emit_start_conversation_event: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartResponse {
    #[serde(default)]
    conversation_id: Option<String>,
    #[serde(default)]
    activities: Vec<Activity>,
}

#[derive(Serialize)]
struct TurnRequest<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct TurnReply {
    #[serde(default)]
    activities: Vec<Activity>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    #[serde(default)]
    total_tokens: u32,
}

/// Agent runtime reached over HTTP.
///
/// `POST {endpoint}/conversations` opens a conversation and returns
/// `{"conversationId": ..., "activities": [...]}`;
/// `POST {endpoint}/conversations/{id}/turns` with `{"role": "user", "content": ...}`
/// returns `{"activities": [...]}`. Both use bearer authentication.
pub struct HttpAgentRuntime {
    client: reqwest::Client,
    endpoint: reqwest::Url,
}

impl HttpAgentRuntime {
    /// `timeout` bounds one HTTP exchange at the transport level.
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> AgentResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AgentError::agent(format!("Failed to create HTTP client: {}", e)))?;

        let endpoint = endpoint.into();
        let endpoint = reqwest::Url::parse(&endpoint).map_err(|e| {
            AgentError::agent(format!("Invalid agent endpoint '{}': {}", endpoint, e))
        })?;
        if endpoint.cannot_be_a_base() {
            return Err(AgentError::agent(format!(
                "Agent endpoint '{}' cannot carry a path",
                endpoint
            )));
        }

        Ok(Self { client, endpoint })
    }

    /// Endpoint URL with `segments` appended, each percent-encoded.
    fn url(&self, segments: &[&str]) -> AgentResult<reqwest::Url> {
        let mut url = self.endpoint.clone();
        url.path_segments_mut()
            .map_err(|_| {
                AgentError::agent(format!(
                    "Agent endpoint '{}' cannot carry a path",
                    self.endpoint
                ))
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn post<B: Serialize + ?Sized>(
        &self,
        url: reqwest::Url,
        token: &Token,
        body: &B,
    ) -> AgentResult<String> {
        let response = self
            .client
            .post(url)
            .bearer_auth(token.value())
            .json(body)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status().as_u16();
        let text = response.text().await.map_err(map_transport_error)?;

        match status {
            200..=299 => Ok(text),
            401 | 403 => Err(AgentError::auth_rejected(format!(
                "HTTP {}: {}",
                status,
                truncate(&text)
            ))),
            408 | 504 => Err(AgentError::timeout(format!("HTTP {}", status))),
            429 | 500..=599 => Err(AgentError::unavailable(format!(
                "HTTP {}: {}",
                status,
                truncate(&text)
            ))),
            _ => Err(AgentError::agent(format!(
                "HTTP {}: {}",
                status,
                truncate(&text)
            ))),
        }
    }
}

fn map_transport_error(err: reqwest::Error) -> AgentError {
    if err.is_timeout() {
        AgentError::timeout(err.to_string())
    } else if err.is_decode() {
        AgentError::malformed(err.to_string())
    } else {
        AgentError::unavailable(err.to_string())
    }
}

fn truncate(text: &str) -> &str {
    match text.char_indices().nth(300) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[async_trait]
impl AgentRuntime for HttpAgentRuntime {
    async fn start_conversation(&self, token: &Token) -> AgentResult<String> {
        let url = self.url(&["conversations"])?;
        let body = self
            .post(
                url,
                token,
                &StartRequest {
                    emit_start_conversation_event: true,
                },
            )
            .await?;

        let started: StartResponse = serde_json::from_str(&body)
            .map_err(|e| AgentError::malformed(format!("start conversation: {}", e)))?;

        for greeting in started.activities.iter().filter_map(|a| a.text.as_deref()) {
            debug!("Greeting: {}", greeting);
        }

        started
            .conversation_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| AgentError::malformed("no conversation id in start response"))
    }

    async fn send_turn(
        &self,
        token: &Token,
        conversation_id: &str,
        turn: &Turn,
    ) -> AgentResult<TurnResponse> {
        let url = self.url(&["conversations", conversation_id, "turns"])?;
        let body = self
            .post(
                url,
                token,
                &TurnRequest {
                    role: "user",
                    content: &turn.content,
                },
            )
            .await?;

        let reply: TurnReply = serde_json::from_str(&body)
            .map_err(|e| AgentError::malformed(format!("turn reply: {}", e)))?;

        Ok(TurnResponse {
            activities: reply.activities,
            usage: reply.usage.map(|u| Usage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
                total_tokens: u.total_tokens,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AgentErrorKind;
    use chrono::Utc;

    fn token() -> Token {
        Token::new("bearer-value", Utc::now() + chrono::Duration::hours(1))
    }

    fn runtime(url: &str) -> HttpAgentRuntime {
        HttpAgentRuntime::new(url, Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_start_and_send() {
        let mut server = mockito::Server::new_async().await;
        let start = server
            .mock("POST", "/conversations")
            .match_header("authorization", "Bearer bearer-value")
            .with_status(200)
            .with_body(r#"{"conversationId":"c-1","activities":[{"type":"message","text":"Hi!"}]}"#)
            .create_async()
            .await;
        let turn = server
            .mock("POST", "/conversations/c-1/turns")
            .match_body(mockito::Matcher::Json(serde_json::json!({
                "role": "user",
                "content": "Where is my order?"
            })))
            .with_status(200)
            .with_body(
                r#"{"activities":[
                    {"type":"trace","label":"plan","value":{"step":1}},
                    {"type":"message","text":"It ships tomorrow."}
                ],"usage":{"prompt_tokens":3,"completion_tokens":4,"total_tokens":7}}"#,
            )
            .create_async()
            .await;

        let runtime = runtime(&server.url());
        let id = runtime.start_conversation(&token()).await.unwrap();
        let response = runtime
            .send_turn(&token(), &id, &Turn::user("Where is my order?"))
            .await
            .unwrap();

        start.assert_async().await;
        turn.assert_async().await;
        assert_eq!(id, "c-1");
        assert_eq!(response.activities.len(), 2);
        assert_eq!(response.activities[0].label.as_deref(), Some("plan"));
        assert_eq!(response.usage.unwrap().total_tokens, 7);
    }

    #[tokio::test]
    async fn test_status_mapping() {
        let mut server = mockito::Server::new_async().await;
        for (path, status) in [
            ("/conversations/a/turns", 401),
            ("/conversations/b/turns", 503),
            ("/conversations/c/turns", 400),
        ] {
            server
                .mock("POST", path)
                .with_status(status)
                .create_async()
                .await;
        }

        let runtime = runtime(&server.url());
        let send = |id: &'static str| {
            let runtime = &runtime;
            async move {
                runtime
                    .send_turn(&token(), id, &Turn::user("x"))
                    .await
                    .unwrap_err()
            }
        };

        let rejected = send("a").await;
        assert_eq!(rejected.kind, AgentErrorKind::AuthRejected);
        assert!(!rejected.is_transient());

        let unavailable = send("b").await;
        assert_eq!(unavailable.kind, AgentErrorKind::AgentError);
        assert!(unavailable.is_transient());

        let bad_request = send("c").await;
        assert_eq!(bad_request.kind, AgentErrorKind::AgentError);
        assert!(!bad_request.is_transient());
    }

    #[tokio::test]
    async fn test_malformed_responses() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/conversations")
            .with_status(200)
            .with_body(r#"{"activities":[]}"#)
            .create_async()
            .await;
        server
            .mock("POST", "/conversations/c/turns")
            .with_status(200)
            .with_body("<html>gateway</html>")
            .create_async()
            .await;

        let runtime = runtime(&server.url());
        let no_id = runtime.start_conversation(&token()).await.unwrap_err();
        assert_eq!(no_id.kind, AgentErrorKind::MalformedResponse);

        let not_json = runtime
            .send_turn(&token(), "c", &Turn::user("x"))
            .await
            .unwrap_err();
        assert_eq!(not_json.kind, AgentErrorKind::MalformedResponse);
    }

    #[tokio::test]
    async fn test_conversation_id_is_path_encoded() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/conversations/a%2Fb%20c%3F/turns")
            .with_status(200)
            .with_body(r#"{"activities":[{"type":"message","text":"ok"}]}"#)
            .expect(1)
            .create_async()
            .await;

        let runtime = runtime(&format!("{}/api/", server.url()));
        let response = runtime
            .send_turn(&token(), "a/b c?", &Turn::user("x"))
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(response.activities.len(), 1);
    }

    #[test]
    fn test_rejects_unusable_endpoint() {
        for endpoint in ["not a url", "mailto:agent@example.com"] {
            let err = HttpAgentRuntime::new(endpoint, Duration::from_secs(1))
                .err()
                .unwrap();
            assert_eq!(err.kind, AgentErrorKind::AgentError, "{}", endpoint);
        }
    }
}
