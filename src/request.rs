use serde_json::Value;
use std::fmt;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ValidationError {
    #[error("request body is not valid JSON")]
    InvalidJson,
    #[error("conversation contains no usable user message")]
    NoUserMessage,
    #[error("request has neither `messages` nor `strategy`")]
    MissingInput,
    #[error("query is empty or not text")]
    EmptyQuery,
}

/// One turn of a chat-widget conversation.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    /// `None` when the content was missing or not a string.
    pub content: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConversationInput {
    pub messages: Vec<ChatMessage>,
}

/// Direct strategy form. The optional fields only matter when prompt
/// assembly is switched on.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DirectInput {
    pub strategy: String,
    pub timeframe: Option<String>,
    pub risk_profile: Option<String>,
    pub instruments: Option<String>,
    pub goals: Option<String>,
}

/// The two accepted request bodies.
#[derive(Debug, Clone, PartialEq)]
pub enum StrategyRequest {
    Conversation(ConversationInput),
    Direct(DirectInput),
}

/// Trimmed, non-empty question text. Only produced by validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedQuery(String);

impl NormalizedQuery {
    pub fn new(raw: &str) -> Result<Self, ValidationError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(ValidationError::EmptyQuery);
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NormalizedQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Parse raw body bytes and work out which shape they are.
pub fn parse_request(body: &[u8]) -> Result<StrategyRequest, ValidationError> {
    let json: Value = serde_json::from_slice(body).map_err(|e| {
        debug!("Rejecting body that is not JSON: {}", e);
        ValidationError::InvalidJson
    })?;
    StrategyRequest::from_value(&json)
}

impl StrategyRequest {
    /// `messages` (when it is an array) takes precedence over `strategy`.
    pub fn from_value(json: &Value) -> Result<Self, ValidationError> {
        if let Some(messages) = json.get("messages").and_then(Value::as_array) {
            let messages = messages
                .iter()
                .map(|msg| ChatMessage {
                    role: msg
                        .get("role")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    content: msg.get("content").and_then(Value::as_str).map(str::to_string),
                })
                .collect();
            return Ok(Self::Conversation(ConversationInput { messages }));
        }

        match json.get("strategy") {
            Some(strategy) if is_truthy(strategy) => {
                let strategy = strategy.as_str().ok_or(ValidationError::EmptyQuery)?;
                // non-string optional fields are dropped, not rejected
                let text = |key: &str| json.get(key).and_then(Value::as_str).map(str::to_string);
                Ok(Self::Direct(DirectInput {
                    strategy: strategy.to_string(),
                    timeframe: text("timeframe"),
                    risk_profile: text("riskProfile"),
                    instruments: text("instruments"),
                    goals: text("goals"),
                }))
            }
            _ => Err(ValidationError::MissingInput),
        }
    }

    /// Extract the query that goes upstream. With `include_details` the
    /// optional fields of a direct request are folded into the text.
    pub fn into_query(self, include_details: bool) -> Result<NormalizedQuery, ValidationError> {
        match self {
            Self::Conversation(conversation) => conversation.last_user_message(),
            Self::Direct(direct) if include_details => {
                // validate the bare strategy first so a blank one still fails
                NormalizedQuery::new(&direct.strategy)?;
                NormalizedQuery::new(&direct.build_prompt())
            }
            Self::Direct(direct) => NormalizedQuery::new(&direct.strategy),
        }
    }
}

impl ConversationInput {
    pub fn last_user_message(&self) -> Result<NormalizedQuery, ValidationError> {
        let content = self
            .messages
            .iter()
            .rev()
            .find(|msg| msg.role == "user")
            .and_then(|msg| msg.content.as_deref())
            .filter(|content| !content.is_empty())
            .ok_or(ValidationError::NoUserMessage)?;

        NormalizedQuery::new(content)
    }
}

impl DirectInput {
    /// Labelled multi-line prompt; blank optional fields are left out.
    pub fn build_prompt(&self) -> String {
        let optional = [
            ("Hedef Zaman Dilimi", &self.timeframe),
            ("Risk Profili", &self.risk_profile),
            ("İşlem Enstrümanları", &self.instruments),
            ("Hedefler / Ek Notlar", &self.goals),
        ];

        let mut sections = vec![format!("Strateji Özeti: {}", self.strategy.trim())];
        for (label, value) in optional {
            if let Some(value) = value.as_deref().map(str::trim).filter(|v| !v.is_empty()) {
                sections.push(format!("{}: {}", label, value));
            }
        }
        sections.join("\n")
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(true, |f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}
