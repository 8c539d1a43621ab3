//! Caller identity extracted from request headers.
//!
//! The storefront gateway authenticates users and forwards `X-User-ID` and
//! `X-User-Role`. Requests without `X-User-ID` are guest checkouts.

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use service_core::error::AppError;

pub const USER_ID_HEADER: &str = "X-User-ID";
pub const USER_ROLE_HEADER: &str = "X-User-Role";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallerRole {
    Customer,
    Admin,
}

#[derive(Debug, Clone)]
pub struct CallerContext {
    pub user_id: Option<String>,
    pub role: CallerRole,
}

impl CallerContext {
    pub fn customer(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            role: CallerRole::Customer,
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == CallerRole::Admin
    }

    /// Rejects non-admin callers with 403.
    pub fn require_admin(&self) -> Result<(), AppError> {
        if self.is_admin() {
            Ok(())
        } else {
            Err(AppError::Forbidden(anyhow::anyhow!(
                "This operation requires an administrator"
            )))
        }
    }

    /// Label written to timeline entries.
    pub fn actor(&self) -> String {
        match (&self.role, &self.user_id) {
            (CallerRole::Admin, Some(id)) => format!("admin:{}", id),
            (CallerRole::Admin, None) => "admin".to_string(),
            (CallerRole::Customer, Some(id)) => format!("customer:{}", id),
            (CallerRole::Customer, None) => "guest".to_string(),
        }
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for CallerContext
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user_id = parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_owned);

        let role = match parts
            .headers
            .get(USER_ROLE_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
        {
            None => CallerRole::Customer,
            Some(r) if r.eq_ignore_ascii_case("customer") => CallerRole::Customer,
            Some(r) if r.eq_ignore_ascii_case("admin") => CallerRole::Admin,
            Some(other) => {
                return Err(AppError::BadRequest(anyhow::anyhow!(
                    "Unknown caller role '{}'",
                    other
                )))
            }
        };

        if let Some(ref uid) = user_id {
            tracing::Span::current().record("user_id", uid.as_str());
        }

        Ok(CallerContext { user_id, role })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    async fn extract(request: Request<()>) -> Result<CallerContext, AppError> {
        let (mut parts, _) = request.into_parts();
        CallerContext::from_request_parts(&mut parts, &()).await
    }

    #[tokio::test]
    async fn missing_headers_mean_guest() {
        let caller = extract(Request::builder().body(()).unwrap()).await.unwrap();
        assert_eq!(caller.user_id, None);
        assert!(!caller.is_admin());
        assert_eq!(caller.actor(), "guest");
    }

    #[tokio::test]
    async fn admin_role_is_recognised() {
        let request = Request::builder()
            .header(USER_ID_HEADER, "staff-7")
            .header(USER_ROLE_HEADER, "Admin")
            .body(())
            .unwrap();
        let caller = extract(request).await.unwrap();
        assert!(caller.require_admin().is_ok());
        assert_eq!(caller.actor(), "admin:staff-7");
    }

    #[tokio::test]
    async fn unknown_role_is_rejected() {
        let request = Request::builder()
            .header(USER_ROLE_HEADER, "root")
            .body(())
            .unwrap();
        assert!(extract(request).await.is_err());
    }

    #[test]
    fn customers_cannot_act_as_admin() {
        assert!(CallerContext::customer("u-1").require_admin().is_err());
    }
}
