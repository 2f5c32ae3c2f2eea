use axum::{
    Json,
    extract::{FromRequestParts, State},
    http::{StatusCode, request::Parts},
};
use axum_extra::extract::cookie::CookieJar;
use botdock_process::{TenantId, TenantRole};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{api::ApiError, request_meta::RequestMeta, state::AppState, tenants};

pub const CSRF_COOKIE_NAME: &str = "csrf";
pub const ACCESS_COOKIE_NAME: &str = "access";

const ISSUER: &str = "botdock-auth";
const AUDIENCE: &str = "botdock";

fn jwt_secret() -> Vec<u8> {
    std::env::var("BOTDOCK_JWT_SECRET")
        .unwrap_or_else(|_| "dev-insecure-change-me".to_string())
        .into_bytes()
}

/// Access-token claims as issued by the external auth service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub username: String,
    /// `USER` or `ADMIN`.
    pub role: String,
    pub exp: usize,
    pub iat: usize,
    pub iss: String,
    pub aud: String,
}

pub fn validate_access_jwt(token: &str) -> anyhow::Result<Claims> {
    let mut validation = jsonwebtoken::Validation::new(jsonwebtoken::Algorithm::HS256);
    validation.set_audience(&[AUDIENCE]);
    validation.set_issuer(&[ISSUER]);

    let data = jsonwebtoken::decode::<Claims>(
        token,
        &jsonwebtoken::DecodingKey::from_secret(&jwt_secret()),
        &validation,
    )?;
    Ok(data.claims)
}

/// Signs an access token the same way the auth service does. Used by
/// operators to mint tokens and by the tests.
pub fn make_access_jwt(
    user_id: Uuid,
    username: &str,
    role: TenantRole,
    ttl: chrono::TimeDelta,
) -> anyhow::Result<String> {
    let now = chrono::Utc::now();
    let claims = Claims {
        sub: user_id.to_string(),
        username: username.to_string(),
        role: tenants::role_str(role).to_string(),
        exp: (now + ttl).timestamp().max(0) as usize,
        iat: now.timestamp().max(0) as usize,
        iss: ISSUER.to_string(),
        aud: AUDIENCE.to_string(),
    };

    Ok(jsonwebtoken::encode(
        &jsonwebtoken::Header::new(jsonwebtoken::Algorithm::HS256),
        &claims,
        &jsonwebtoken::EncodingKey::from_secret(&jwt_secret()),
    )?)
}

fn bearer_token(parts: &Parts) -> Option<String> {
    let value = parts
        .headers
        .get(axum::http::header::AUTHORIZATION)?
        .to_str()
        .ok()?;
    let token = value.strip_prefix("Bearer ")?.trim();
    (!token.is_empty()).then(|| token.to_string())
}

fn access_token(parts: &Parts) -> Option<String> {
    bearer_token(parts).or_else(|| {
        CookieJar::from_headers(&parts.headers)
            .get(ACCESS_COOKIE_NAME)
            .map(|c| c.value().to_string())
    })
}

fn request_meta(parts: &Parts) -> RequestMeta {
    parts
        .extensions
        .get::<RequestMeta>()
        .cloned()
        .unwrap_or_else(|| RequestMeta {
            request_id: String::new(),
        })
}

/// Authenticated caller. Extracting it also provisions the tenant row on
/// first sight.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: Uuid,
    pub username: String,
    pub role: TenantRole,
}

impl AuthUser {
    pub fn tenant_id(&self) -> TenantId {
        TenantId(self.user_id.to_string())
    }

    pub fn is_admin(&self) -> bool {
        self.role == TenantRole::Admin
    }
}

#[axum::async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let meta = request_meta(parts);
        let unauthorized =
            |msg: &str| ApiError::new(&meta, StatusCode::UNAUTHORIZED, "unauthorized", msg);

        let token = access_token(parts).ok_or_else(|| unauthorized("missing access token"))?;
        let claims =
            validate_access_jwt(&token).map_err(|_| unauthorized("invalid access token"))?;
        let user_id =
            Uuid::parse_str(&claims.sub).map_err(|_| unauthorized("invalid access token"))?;

        let user = AuthUser {
            user_id,
            username: claims.username,
            role: tenants::parse_role(&claims.role),
        };
        tenants::ensure_user(&state.db, &user)
            .await
            .map_err(|e| ApiError::db(&meta, e))?;
        Ok(user)
    }
}

/// Caller holding the ADMIN role.
#[derive(Debug, Clone)]
pub struct AdminUser(pub AuthUser);

#[axum::async_trait]
impl FromRequestParts<AppState> for AdminUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let user = AuthUser::from_request_parts(parts, state).await?;
        if !user.is_admin() {
            return Err(ApiError::new(
                &request_meta(parts),
                StatusCode::FORBIDDEN,
                "forbidden",
                "admin role required",
            ));
        }
        Ok(AdminUser(user))
    }
}

#[derive(Debug, Serialize)]
pub struct WhoamiResponse {
    pub user_id: String,
    pub username: String,
    pub role: TenantRole,
    pub plan: String,
    pub suspended: bool,
}

pub async fn whoami(
    State(state): State<AppState>,
    axum::Extension(meta): axum::Extension<RequestMeta>,
    user: AuthUser,
) -> Result<Json<WhoamiResponse>, ApiError> {
    let tenant = tenants::load_user(&state.db, user.user_id)
        .await
        .map_err(|e| ApiError::db(&meta, e))?
        .ok_or_else(|| ApiError::not_found(&meta, "user not found"))?;

    Ok(Json(WhoamiResponse {
        user_id: user.user_id.to_string(),
        username: user.username,
        role: user.role,
        plan: tenant.plan,
        suspended: tenant.suspended,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minted_tokens_validate() {
        let id = Uuid::new_v4();
        let token =
            make_access_jwt(id, "alice", TenantRole::Admin, chrono::TimeDelta::minutes(5)).unwrap();
        let claims = validate_access_jwt(&token).unwrap();
        assert_eq!(claims.sub, id.to_string());
        assert_eq!(claims.username, "alice");
        assert_eq!(claims.role, "ADMIN");
    }

    #[test]
    fn expired_tokens_are_rejected() {
        let token = make_access_jwt(
            Uuid::new_v4(),
            "bob",
            TenantRole::User,
            chrono::TimeDelta::minutes(-10),
        )
        .unwrap();
        assert!(validate_access_jwt(&token).is_err());
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(validate_access_jwt("not.a.jwt").is_err());
    }
}
