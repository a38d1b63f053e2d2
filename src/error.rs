use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

use crate::request::ValidationError;
use crate::upstream::UpstreamError;

/// Every way a chat request can fail before the stream starts.
#[derive(Debug, Error)]
pub enum AdvisorError {
    #[error("upstream credential is not configured")]
    MissingApiKey,
    #[error("rate limit exceeded, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },
    #[error("invalid request: {0}")]
    Validation(#[from] ValidationError),
    #[error("upstream completion failed: {0}")]
    Upstream(#[from] UpstreamError),
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

impl AdvisorError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::MissingApiKey | Self::Upstream(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Validation(_) => StatusCode::BAD_REQUEST,
        }
    }

    /// Message shown to the end user. Upstream detail never reaches it.
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::MissingApiKey => "Sunucu yapılandırması eksik: OPENAI_API_KEY tanımlı değil.",
            Self::RateLimited { .. } => {
                "Çok fazla istek gönderdiniz. Lütfen bir dakika sonra tekrar deneyin."
            }
            Self::Validation(ValidationError::InvalidJson) => "Geçersiz JSON formatı gönderildi.",
            Self::Validation(ValidationError::NoUserMessage) => "Geçerli bir mesaj bulunamadı.",
            Self::Validation(ValidationError::MissingInput) => {
                "strategy alanı veya messages zorunludur."
            }
            Self::Validation(ValidationError::EmptyQuery) => {
                "Mesaj içeriği zorunludur ve metin olmalıdır."
            }
            Self::Upstream(_) => {
                "Strateji önerileri oluşturulurken bir hata oluştu. Lütfen tekrar deneyin."
            }
        }
    }
}

impl IntoResponse for AdvisorError {
    fn into_response(self) -> Response {
        let status = self.status();
        let mut response = (
            status,
            Json(ErrorBody {
                error: self.user_message().to_string(),
            }),
        )
            .into_response();

        if let Self::RateLimited { retry_after } = self {
            // round up so clients never retry a moment too early
            let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs.max(1)));
        }

        response
    }
}
