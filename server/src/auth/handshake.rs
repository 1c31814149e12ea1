//! Credential exchange that ends in a ticket, and ticket redemption.
//!
//! POST /register and POST /login trade a username and password for a
//! single-use ticket; GET /upgrade redeems it (see `ws::handler`). Every
//! authentication failure surfaces as the same `Forbidden`.

use std::future::Future;

use axum::{
    extract::{rejection::JsonRejection, State},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::auth::password;
use crate::db::models::{User, UserLookup};
use crate::db::StoreError;
use crate::error::HubError;
use crate::hub::Hub;
use crate::state::AppState;
use crate::ws::connection::UserIdentity;

// --- Request/Response types for JSON API ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    /// Reject empty fields. Usernames are stored and looked up trimmed.
    fn validated(self) -> Result<Self, HubError> {
        let username = self.username.trim();
        if username.is_empty() {
            return Err(HubError::BadRequest("username is required".into()));
        }
        if self.password.is_empty() {
            return Err(HubError::BadRequest("password is required".into()));
        }
        Ok(Self {
            username: username.to_string(),
            password: self.password,
        })
    }
}

/// Returned by /register and /login. The client redeems it at
/// `/upgrade?id=<userID>&t=<ticket>`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TicketGrant {
    #[serde(rename = "userID")]
    pub user_id: String,
    pub username: String,
    pub ticket: String,
}

impl Hub {
    /// Create a user and issue its first ticket.
    pub async fn register(&self, credentials: Credentials) -> Result<TicketGrant, HubError> {
        let credentials = credentials.validated()?;
        self.with_handshake_deadline(async move {
            let iterations = self.settings().kdf_iterations;
            let password = credentials.password;
            let (salt, key) = tokio::task::spawn_blocking(move || {
                let salt = password::generate_salt();
                let key = password::derive_key(&password, &salt, iterations);
                (salt, key)
            })
            .await
            .map_err(|e| HubError::StoreFailure(format!("Task join: {}", e)))?;

            let user = self
                .store()
                .insert_user(User::new(
                    credentials.username,
                    key.to_vec(),
                    salt.to_vec(),
                    iterations,
                ))
                .await?;

            tracing::info!(user_id = %user.id, username = %user.username, "User registered");
            Ok(self.grant(&user))
        })
        .await
    }

    /// Check a password and issue a fresh ticket, replacing any earlier one.
    pub async fn login(&self, credentials: Credentials) -> Result<TicketGrant, HubError> {
        let credentials = credentials.validated()?;
        self.with_handshake_deadline(async move {
            let user = match self
                .store()
                .get_user(UserLookup::Name(credentials.username.clone()))
                .await
            {
                Ok(user) => Some(user),
                Err(StoreError::NotFound(_)) => None,
                Err(e) => return Err(e.into()),
            };

            let iterations = self.settings().kdf_iterations;
            let password = credentials.password;
            let verified_user = tokio::task::spawn_blocking(move || match user {
                Some(user) => password::verify_password(
                    &password,
                    &user.salt,
                    user.kdf_iterations,
                    &user.password_hash,
                )
                .then_some(user),
                None => {
                    password::simulate_verification(&password, iterations);
                    None
                }
            })
            .await
            .map_err(|e| HubError::StoreFailure(format!("Task join: {}", e)))?;

            let Some(user) = verified_user else {
                tracing::debug!(username = %credentials.username, "Login rejected");
                return Err(HubError::Forbidden);
            };

            tracing::info!(user_id = %user.id, "User logged in");
            Ok(self.grant(&user))
        })
        .await
    }

    /// Consume the ticket for `user_id` and load the user it belongs to.
    pub async fn redeem(&self, user_id: &str, ticket: &str) -> Result<UserIdentity, HubError> {
        if self.is_shutting_down() {
            return Err(HubError::ShuttingDown);
        }
        if user_id.is_empty() || ticket.is_empty() {
            return Err(HubError::BadRequest("id and t are required".into()));
        }
        if !self.tickets().redeem(user_id, ticket) {
            tracing::debug!(user_id = %user_id, "Ticket rejected");
            return Err(HubError::Forbidden);
        }

        self.with_handshake_deadline(async {
            match self.store().get_user(UserLookup::Id(user_id.to_string())).await {
                Ok(user) => Ok(UserIdentity {
                    id: user.id,
                    username: user.username,
                }),
                // Ticket outlived its user
                Err(StoreError::NotFound(_)) => Err(HubError::Forbidden),
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    fn grant(&self, user: &User) -> TicketGrant {
        let ticket = self.tickets().issue(&user.id);
        TicketGrant {
            user_id: ticket.user_id,
            username: user.username.clone(),
            ticket: ticket.value,
        }
    }

    async fn with_handshake_deadline<T>(
        &self,
        fut: impl Future<Output = Result<T, HubError>>,
    ) -> Result<T, HubError> {
        tokio::time::timeout(self.settings().handshake_timeout, fut)
            .await
            .map_err(|_| HubError::StoreFailure("handshake timed out".into()))?
    }
}

// --- Handlers ---

/// POST /register
pub async fn register(
    State(state): State<AppState>,
    body: Result<Json<Credentials>, JsonRejection>,
) -> Result<Json<TicketGrant>, HubError> {
    let Json(credentials) = body.map_err(|e| HubError::BadRequest(e.body_text()))?;
    Ok(Json(state.hub.register(credentials).await?))
}

/// POST /login
pub async fn login(
    State(state): State<AppState>,
    body: Result<Json<Credentials>, JsonRejection>,
) -> Result<Json<TicketGrant>, HubError> {
    let Json(credentials) = body.map_err(|e| HubError::BadRequest(e.body_text()))?;
    Ok(Json(state.hub.login(credentials).await?))
}
