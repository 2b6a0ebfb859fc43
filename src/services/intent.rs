//! Intent classification client
//!
//! The classifier is an external service: it receives the utterance plus a
//! snapshot of the dialogue and answers with a single action. No language
//! understanding happens locally.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use super::Route;
use crate::{Error, Result};

/// Upper bound on one classification round trip
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Dialogue snapshot sent alongside the utterance
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DialogueContext {
    /// `idle` or `awaiting_command`
    pub state: String,
    /// Screen the user is on
    pub route: Route,
    /// Recognition locale, e.g. `zh-CN`
    pub language: String,
    /// Whether the utterance followed a wake word
    pub addressed: bool,
}

/// Kind of timed item to create
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReminderKind {
    /// Daily task reminder (medicine, water, exercise)
    Reminder,
    /// Alarm clock
    Alarm,
}

/// Parameters extracted for a reminder or alarm
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReminderParams {
    /// Time of day, `HH:MM`
    #[serde(default)]
    pub time: Option<String>,
    /// What to remind about
    #[serde(default, alias = "label")]
    pub title: Option<String>,
}

/// What the classifier decided
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntentAction {
    /// Open a screen
    Navigate {
        route: Route,
        spoken_reply: Option<String>,
    },
    /// Say something; `None` asks the reply generator
    Reply { spoken_reply: Option<String> },
    /// Create a reminder or alarm
    CreateReminder {
        kind: ReminderKind,
        params: ReminderParams,
        spoken_reply: Option<String>,
    },
}

impl IntentAction {
    /// Text to speak before or instead of acting
    #[must_use]
    pub fn spoken_reply(&self) -> Option<&str> {
        match self {
            Self::Navigate { spoken_reply, .. }
            | Self::Reply { spoken_reply }
            | Self::CreateReminder { spoken_reply, .. } => spoken_reply.as_deref(),
        }
    }
}

/// Classifies free text into an action
#[async_trait]
pub trait IntentService: Send + Sync {
    /// Classify one utterance
    ///
    /// # Errors
    ///
    /// Returns `Error::Busy` on quota exhaustion, `Error::Intent` otherwise
    async fn classify(&self, text: &str, context: &DialogueContext) -> Result<IntentAction>;
}

/// Classifier used when no intent service is configured
///
/// Every utterance becomes a reply, which defers to the reply generator.
#[derive(Debug, Default)]
pub struct ReplyOnlyIntentService;

#[async_trait]
impl IntentService for ReplyOnlyIntentService {
    async fn classify(&self, _text: &str, _context: &DialogueContext) -> Result<IntentAction> {
        Ok(IntentAction::Reply { spoken_reply: None })
    }
}

#[derive(Serialize)]
struct IntentRequest<'a> {
    text: &'a str,
    context: &'a DialogueContext,
}

/// Wire form of the classifier's answer
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntentResponse {
    action: String,
    #[serde(default)]
    route: Option<String>,
    #[serde(default)]
    params: Option<serde_json::Value>,
    #[serde(default)]
    spoken_reply: Option<String>,
}

impl TryFrom<IntentResponse> for IntentAction {
    type Error = Error;

    fn try_from(response: IntentResponse) -> Result<Self> {
        let spoken_reply = response.spoken_reply.filter(|r| !r.trim().is_empty());
        match response.action.as_str() {
            "navigate" => {
                let route = response
                    .route
                    .ok_or_else(|| Error::Intent("navigate action without route".to_string()))?
                    .parse()?;
                Ok(Self::Navigate {
                    route,
                    spoken_reply,
                })
            }
            "reply" => Ok(Self::Reply { spoken_reply }),
            "create-reminder" | "create-alarm" => {
                let params = response.params.unwrap_or(serde_json::Value::Null);
                let kind = match params.get("kind").and_then(serde_json::Value::as_str) {
                    Some("alarm") => ReminderKind::Alarm,
                    Some(_) => ReminderKind::Reminder,
                    None if response.action == "create-alarm" => ReminderKind::Alarm,
                    None => ReminderKind::Reminder,
                };
                let params = if params.is_null() {
                    ReminderParams::default()
                } else {
                    serde_json::from_value(params)?
                };
                Ok(Self::CreateReminder {
                    kind,
                    params,
                    spoken_reply,
                })
            }
            other => Err(Error::Intent(format!("unknown action: {other}"))),
        }
    }
}

/// Intent classifier reached over HTTP
pub struct HttpIntentService {
    client: reqwest::Client,
    url: String,
    api_key: Option<SecretString>,
}

impl HttpIntentService {
    /// Create a client posting to `url`
    #[must_use]
    pub fn new(url: String, api_key: Option<SecretString>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            url,
            api_key,
        }
    }
}

#[async_trait]
impl IntentService for HttpIntentService {
    async fn classify(&self, text: &str, context: &DialogueContext) -> Result<IntentAction> {
        tracing::debug!(text, state = %context.state, "classifying utterance");

        let mut request = self.client.post(&self.url).json(&IntentRequest { text, context });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key.expose_secret());
        }
        let response = request.send().await.map_err(|e| {
            tracing::warn!(error = %e, "intent request failed");
            Error::Busy(format!("intent service unreachable: {e}"))
        })?;

        let status = response.status();
        if matches!(
            status,
            StatusCode::TOO_MANY_REQUESTS | StatusCode::SERVICE_UNAVAILABLE
        ) {
            return Err(Error::Busy(format!("intent service returned {status}")));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Intent(format!("intent service error {status}: {body}")));
        }

        let body: IntentResponse = response.json().await?;
        let action = IntentAction::try_from(body)?;
        tracing::info!(action = ?action, "intent classified");
        Ok(action)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> Result<IntentAction> {
        IntentAction::try_from(serde_json::from_str::<IntentResponse>(json).unwrap())
    }

    #[test]
    fn navigate_requires_known_route() {
        assert_eq!(
            parse(r#"{"action":"navigate","route":"vision","spokenReply":"好的，打开摄像头"}"#).unwrap(),
            IntentAction::Navigate {
                route: Route::Vision,
                spoken_reply: Some("好的，打开摄像头".to_string()),
            }
        );
        assert!(parse(r#"{"action":"navigate"}"#).is_err());
        assert!(parse(r#"{"action":"navigate","route":"moon"}"#).is_err());
    }

    #[test]
    fn reply_without_text_defers_to_generator() {
        assert_eq!(
            parse(r#"{"action":"reply","spokenReply":"  "}"#).unwrap(),
            IntentAction::Reply { spoken_reply: None }
        );
    }

    #[test]
    fn reminder_params_are_extracted() {
        let action = parse(
            r#"{"action":"create-reminder","params":{"kind":"alarm","time":"07:30","label":"起床"}}"#,
        )
        .unwrap();
        assert_eq!(
            action,
            IntentAction::CreateReminder {
                kind: ReminderKind::Alarm,
                params: ReminderParams {
                    time: Some("07:30".to_string()),
                    title: Some("起床".to_string()),
                },
                spoken_reply: None,
            }
        );
    }

    #[test]
    fn unknown_action_is_an_intent_error() {
        assert!(matches!(parse(r#"{"action":"dance"}"#), Err(Error::Intent(_))));
    }
}
