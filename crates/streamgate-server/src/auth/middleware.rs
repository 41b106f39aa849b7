use super::ApiKeyManager;
use crate::api::response::ApiError;
use crate::api::state::AppState;
use crate::config::{AuthConfig, AuthModule};
use axum::{
    extract::{Request, State},
    http::{HeaderMap, HeaderValue, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::Deserialize;
use tracing::{debug, warn};

/// User id reported when identity checks are disabled.
pub const DEFAULT_USER_ID: &str = "00000000-0000-0000-0000-000";
pub const DEFAULT_USER_NAME: &str = "streamgate-user";
pub const USER_ID_HEADER: &str = "x-user-id";

/// Identity of the caller, attached to every authenticated request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthContext {
    pub user_id: String,
    pub username: String,
}

#[derive(Debug, Deserialize)]
struct Claims {
    sub: Option<String>,
    preferred_username: Option<String>,
}

/// Resolves the caller identity from request headers.
pub enum Authenticator {
    Noop,
    ApiKey(ApiKeyManager),
    Jwt(DecodingKey),
}

impl Authenticator {
    pub fn from_config(config: &AuthConfig) -> Self {
        match config.module {
            AuthModule::Noop => Authenticator::Noop,
            AuthModule::ApiKey => {
                Authenticator::ApiKey(ApiKeyManager::from_entries(&config.api_keys))
            }
            AuthModule::Jwt => Authenticator::Jwt(DecodingKey::from_secret(
                config.jwt_secret.as_deref().unwrap_or_default().as_bytes(),
            )),
        }
    }

    pub fn module_name(&self) -> &'static str {
        match self {
            Authenticator::Noop => "noop",
            Authenticator::ApiKey(_) => "api_key",
            Authenticator::Jwt(_) => "jwt",
        }
    }

    pub fn authenticate(&self, headers: &HeaderMap) -> Result<AuthContext, ApiError> {
        match self {
            Authenticator::Noop => {
                let user_id = headers
                    .get(USER_ID_HEADER)
                    .and_then(|value| value.to_str().ok())
                    .map(str::trim)
                    .filter(|value| !value.is_empty())
                    .unwrap_or(DEFAULT_USER_ID);
                Ok(AuthContext {
                    user_id: user_id.to_string(),
                    username: DEFAULT_USER_NAME.to_string(),
                })
            }
            Authenticator::ApiKey(manager) => {
                let token = extract_bearer(headers.get(header::AUTHORIZATION))
                    .ok_or_else(|| ApiError::unauthorized("No Authorization header found"))?;
                let record = manager
                    .validate_key(&token)
                    .ok_or_else(|| ApiError::unauthorized("Invalid API key"))?;
                debug!(
                    user_id = %record.owner_id,
                    key = %record.key_hash.get(..8).unwrap_or_default(),
                    last_used = ?record.last_used,
                    "API key accepted"
                );
                Ok(AuthContext {
                    username: record.owner_id.clone(),
                    user_id: record.owner_id,
                })
            }
            Authenticator::Jwt(key) => {
                let token = extract_bearer(headers.get(header::AUTHORIZATION))
                    .ok_or_else(|| ApiError::unauthorized("No Authorization header found"))?;
                let validation = Validation::new(Algorithm::HS256);
                let claims = decode::<Claims>(&token, key, &validation)
                    .map_err(|err| {
                        debug!(error = %err, "JWT validation failed");
                        ApiError::unauthorized("Invalid or expired token")
                    })?
                    .claims;
                let user_id = claims
                    .sub
                    .filter(|sub| !sub.is_empty())
                    .ok_or_else(|| ApiError::unauthorized("Token has no subject"))?;
                Ok(AuthContext {
                    username: claims.preferred_username.unwrap_or_else(|| user_id.clone()),
                    user_id,
                })
            }
        }
    }
}

pub async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Response {
    match state.authenticator.authenticate(req.headers()) {
        Ok(context) => {
            req.extensions_mut().insert(context);
            next.run(req).await
        }
        Err(err) => {
            warn!(
                path = %req.uri().path(),
                status = err.status().as_u16(),
                "Request rejected by identity check"
            );
            err.into_response()
        }
    }
}

fn extract_bearer(header: Option<&HeaderValue>) -> Option<String> {
    let value = header?.to_str().ok()?;
    value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))
        .map(|token| token.trim().to_string())
        .filter(|token| !token.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use jsonwebtoken::{EncodingKey, Header, encode};
    use serde::Serialize;

    #[derive(Serialize)]
    struct TestClaims<'a> {
        sub: &'a str,
        preferred_username: Option<&'a str>,
        exp: usize,
    }

    fn token(secret: &str, sub: &str, username: Option<&str>) -> String {
        let exp = (chrono::Utc::now().timestamp() + 3600) as usize;
        encode(
            &Header::default(),
            &TestClaims {
                sub,
                preferred_username: username,
                exp,
            },
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn bearer(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", value)).unwrap(),
        );
        headers
    }

    fn jwt_authenticator(secret: &str) -> Authenticator {
        Authenticator::from_config(&AuthConfig {
            module: AuthModule::Jwt,
            jwt_secret: Some(secret.to_string()),
            ..Default::default()
        })
    }

    #[test]
    fn test_noop_uses_header_or_default() {
        let auth = Authenticator::Noop;

        let context = auth.authenticate(&HeaderMap::new()).unwrap();
        assert_eq!(context.user_id, DEFAULT_USER_ID);

        let mut headers = HeaderMap::new();
        headers.insert(USER_ID_HEADER, HeaderValue::from_static("alice"));
        assert_eq!(auth.authenticate(&headers).unwrap().user_id, "alice");
    }

    #[test]
    fn test_api_key_maps_to_owner() {
        let auth = Authenticator::from_config(&AuthConfig {
            module: AuthModule::ApiKey,
            api_keys: vec!["alice:k1".to_string()],
            ..Default::default()
        });

        assert_eq!(auth.authenticate(&bearer("k1")).unwrap().user_id, "alice");

        let err = auth.authenticate(&bearer("nope")).unwrap_err();
        assert_eq!(err.status(), StatusCode::UNAUTHORIZED);
        let err = auth.authenticate(&HeaderMap::new()).unwrap_err();
        assert_eq!(err.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_jwt_uses_subject_and_username() {
        let auth = jwt_authenticator("secret");

        let context = auth
            .authenticate(&bearer(&token("secret", "user-1", Some("alice"))))
            .unwrap();
        assert_eq!(context.user_id, "user-1");
        assert_eq!(context.username, "alice");

        let context = auth
            .authenticate(&bearer(&token("secret", "user-2", None)))
            .unwrap();
        assert_eq!(context.username, "user-2");
    }

    #[test]
    fn test_jwt_rejects_wrong_secret() {
        let auth = jwt_authenticator("secret");

        let err = auth
            .authenticate(&bearer(&token("other", "user-1", None)))
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_extract_bearer() {
        let value = HeaderValue::from_static("bearer abc ");
        assert_eq!(extract_bearer(Some(&value)), Some("abc".to_string()));
        let value = HeaderValue::from_static("Basic abc");
        assert_eq!(extract_bearer(Some(&value)), None);
        assert_eq!(extract_bearer(None), None);
    }
}
