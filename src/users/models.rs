use chrono::Utc;
use diesel::prelude::*;
use hmac::{Hmac, Mac};
use jwt::{RegisteredClaims, SignWithKey, VerifyWithKey};
use pbkdf2::password_hash::rand_core::OsRng;
use pbkdf2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use pbkdf2::Pbkdf2;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::config::AppConfig;
use crate::db::schema::users;
use crate::types::ApiError;

#[derive(Debug, Clone, Queryable, Selectable, Identifiable, AsChangeset)]
#[diesel(table_name = users)]
pub struct User {
    pub id: i32,
    pub username: String,
    pub email: String,
    /// PHC-formatted PBKDF2 hash.
    pub password: String,
    pub bio: Option<String>,
    pub image: Option<String>,
}

fn signing_key(secret: &str) -> Result<Hmac<Sha256>, ApiError> {
    Hmac::new_from_slice(secret.as_bytes()).map_err(|_| ApiError::Internal)
}

fn now() -> u64 {
    Utc::now().timestamp().max(0) as u64
}

impl User {
    pub fn make_password(password: &str) -> Result<String, ApiError> {
        let salt = SaltString::generate(&mut OsRng);
        Pbkdf2
            .hash_password(password.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|_| ApiError::Internal)
    }

    pub fn new_password(&mut self, password: &str) -> Result<(), ApiError> {
        self.password = User::make_password(password)?;
        Ok(())
    }

    pub fn verify_password(&self, password_to_verify: &str) -> Result<bool, ApiError> {
        let hash = PasswordHash::new(&self.password).map_err(|_| ApiError::Internal)?;
        Ok(Pbkdf2
            .verify_password(password_to_verify.as_bytes(), &hash)
            .is_ok())
    }

    pub fn token(&self, config: &AppConfig) -> Result<String, ApiError> {
        let claims = RegisteredClaims {
            issuer: Some(self.email.clone()),
            subject: Some(self.id.to_string()),
            expiration: Some(now() + config.jwt_expires_in),
            ..Default::default()
        };
        claims
            .sign_with_key(&signing_key(&config.jwt_secret)?)
            .map_err(|_| ApiError::Internal)
    }

    pub fn load_by_id(id: i32, connection: &mut PgConnection) -> Result<User, ApiError> {
        users::table
            .find(id)
            .select(User::as_select())
            .get_result(connection)
            .map_err(|e| e.into())
    }
}

/// The authenticated principal of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Auth {
    pub id: i32,
}

impl Auth {
    /// Accepts `Token <jwt>` (the Conduit convention) and `Bearer <jwt>`.
    pub fn from_header(header: &str, secret: &str) -> Result<Auth, ApiError> {
        let token = header
            .strip_prefix("Token ")
            .or_else(|| header.strip_prefix("Bearer "))
            .ok_or(ApiError::Unauthorized)?;
        Auth::from_token(token.trim(), secret)
    }

    pub fn from_token(token: &str, secret: &str) -> Result<Auth, ApiError> {
        let claims: RegisteredClaims = token
            .verify_with_key(&signing_key(secret)?)
            .map_err(|_| ApiError::Unauthorized)?;
        match claims.expiration {
            Some(expiration) if expiration > now() => {}
            _ => return Err(ApiError::Unauthorized),
        }
        let id = claims
            .subject
            .as_deref()
            .and_then(|sub| sub.parse::<i32>().ok())
            .ok_or(ApiError::Unauthorized)?;
        Ok(Auth { id })
    }
}

#[derive(Deserialize, Insertable)]
#[diesel(table_name = users)]
pub struct NewUser {
    pub username: String,
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct UserBody {
    pub email: String,
    pub token: String,
    pub username: String,
    pub bio: Option<String>,
    pub image: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct UserResponse {
    pub user: UserBody,
}

impl UserResponse {
    pub fn new(user: User, config: &AppConfig) -> Result<Self, ApiError> {
        let token = user.token(config)?;
        Ok(UserResponse {
            user: UserBody {
                email: user.email,
                token,
                username: user.username,
                bio: user.bio,
                image: user.image,
            },
        })
    }
}
