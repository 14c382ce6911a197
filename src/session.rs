use axum::{
    extract::FromRequestParts,
    http::{request::Parts, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use tower_sessions::Session;
use tracing::debug;

use crate::{rooms::Participant, AppState};

pub const USER_ID: &str = "user_id";
pub const NICKNAME: &str = "nickname";

pub const USER_ID_HEADER: &str = "x-user-id";
pub const NICKNAME_HEADER: &str = "x-user-nickname";

/// The caller, as vouched for by the login flow (session) or, when enabled,
/// by a trusted gateway (headers). Never re-verified here.
#[derive(Debug, Clone)]
pub struct Identity(pub Participant);

impl FromRequestParts<AppState> for Identity {
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        if let Ok(session) = Session::from_request_parts(parts, state).await {
            let user_id = session
                .get::<i64>(USER_ID)
                .await
                .map_err(|err| (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response())?;
            if let Some(user_id) = user_id {
                let nickname = session
                    .get::<String>(NICKNAME)
                    .await
                    .map_err(|err| (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response())?;
                return Ok(Identity(participant(user_id, nickname)));
            }
        }

        if state.config.trust_identity_headers {
            if let Some(participant) = from_headers(&parts.headers) {
                return Ok(Identity(participant));
            }
        }

        debug!("request without identity");
        Err((StatusCode::UNAUTHORIZED, "sign in first").into_response())
    }
}

fn participant(user_id: i64, nickname: Option<String>) -> Participant {
    let nickname = nickname
        .filter(|nickname| !nickname.trim().is_empty())
        .unwrap_or_else(|| format!("user{user_id}"));
    Participant::new(user_id, nickname)
}

pub fn from_headers(headers: &HeaderMap) -> Option<Participant> {
    let user_id = headers.get(USER_ID_HEADER)?.to_str().ok()?.trim().parse::<i64>().ok()?;
    let nickname = headers
        .get(NICKNAME_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);
    Some(participant(user_id, nickname))
}
