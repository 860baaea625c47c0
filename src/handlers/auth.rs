use async_trait::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::HeaderMap;

use crate::errors::{AppError, AppResult};
use crate::models::{Booking, BookingEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Therapist,
    Host,
    Office,
    Admin,
}

impl Role {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "user" => Some(Role::User),
            "therapist" => Some(Role::Therapist),
            "host" => Some(Role::Host),
            "office" => Some(Role::Office),
            "admin" => Some(Role::Admin),
            _ => None,
        }
    }
}

/// The caller, as asserted by the fronting gateway.
#[derive(Debug, Clone)]
pub struct Principal {
    pub id: String,
    pub role: Role,
}

impl Principal {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    /// Whether this principal is the party the booking names for its role.
    pub fn is_party_to(&self, booking: &Booking) -> bool {
        match self.role {
            Role::Admin => true,
            Role::User => booking.user_id == self.id,
            Role::Therapist => booking.therapist_id == self.id,
            Role::Host => booking.site_id.as_deref() == Some(self.id.as_str()),
            Role::Office => booking.office_id.as_deref() == Some(self.id.as_str()),
        }
    }

    pub fn can_view(&self, booking: &Booking) -> AppResult<()> {
        if self.is_party_to(booking) {
            Ok(())
        } else {
            Err(AppError::Forbidden)
        }
    }

    /// Approve and reject belong to the provider side; start and complete to
    /// the therapist doing the work. Any party may cancel.
    pub fn can_apply(&self, booking: &Booking, event: BookingEvent) -> AppResult<()> {
        let allowed = match event {
            BookingEvent::Approve | BookingEvent::Reject => {
                matches!(self.role, Role::Therapist | Role::Office | Role::Admin)
            }
            BookingEvent::Start | BookingEvent::Complete => {
                matches!(self.role, Role::Therapist | Role::Admin)
            }
            BookingEvent::Cancel => true,
        };
        if allowed && self.is_party_to(booking) {
            Ok(())
        } else {
            Err(AppError::Forbidden)
        }
    }
}

fn header<'a>(parts: &'a Parts, name: &str) -> Option<&'a str> {
    parts
        .headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for Principal {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let id = header(parts, "x-principal-id").ok_or(AppError::Unauthorized)?;
        let role = header(parts, "x-principal-role")
            .and_then(Role::parse)
            .ok_or(AppError::Unauthorized)?;

        Ok(Principal {
            id: id.to_string(),
            role,
        })
    }
}

pub fn check_admin(headers: &HeaderMap, expected_token: &str) -> AppResult<()> {
    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let token = auth.strip_prefix("Bearer ").unwrap_or("");
    if token.is_empty() || token != expected_token {
        return Err(AppError::Unauthorized);
    }
    Ok(())
}
