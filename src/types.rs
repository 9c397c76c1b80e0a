use std::collections::HashMap;

use diesel::result::Error as DieselError;
use diesel::PgConnection;
use rocket::http::Status;
use rocket::request::Request;
use rocket::response::{self, Responder};
use rocket::serde::json::{json, Json, Value};
use serde::Serialize;
use tracing::{error, warn};

use crate::social::SocialError;

pub trait Validate
where
    Self: Sized,
{
    type Error;
    fn validate(self, connection: &mut PgConnection) -> Result<Self, Self::Error>;
}

#[derive(Debug)]
pub enum ApiError {
    Diesel(DieselError),
    Validation(ValidationError),
    Social(SocialError),
    Conflict(&'static str),
    Internal,
    Unauthorized,
    Forbidden,
}

impl From<DieselError> for ApiError {
    fn from(err: DieselError) -> ApiError {
        ApiError::Diesel(err)
    }
}

impl From<ValidationError> for ApiError {
    fn from(err: ValidationError) -> ApiError {
        ApiError::Validation(err)
    }
}

impl From<SocialError> for ApiError {
    fn from(err: SocialError) -> ApiError {
        ApiError::Social(err)
    }
}

pub type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug, Serialize, Default)]
pub struct ValidationError(HashMap<String, Vec<String>>);

impl ValidationError {
    pub fn add_error<K: Into<String>, V: Into<String>>(&mut self, key: K, val: V) {
        let entry = self.0.entry(key.into()).or_default();
        entry.push(val.into());
    }

    pub fn from<K: Into<String>, V: Into<String>>(key: K, val: V) -> Self {
        let mut error = ValidationError::default();
        error.add_error(key, val);
        error
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn merge(&mut self, other: ValidationError) {
        for (key, errors) in other.0.into_iter() {
            let entry = self.0.entry(key).or_default();
            entry.extend(errors);
        }
    }

    pub fn empty(&self) -> bool {
        self.len() == 0
    }

    /// `Ok(value)` if no errors were collected.
    pub fn into_result<T>(self, value: T) -> Result<T, ValidationError> {
        if self.empty() {
            Ok(value)
        } else {
            Err(self)
        }
    }
}

impl ApiError {
    pub fn status(&self) -> Status {
        match self {
            ApiError::Diesel(DieselError::NotFound) => Status::NotFound,
            ApiError::Diesel(_) => Status::InternalServerError,
            ApiError::Validation(_) => Status::UnprocessableEntity,
            ApiError::Social(error) => match error {
                SocialError::NotFound(_) => Status::NotFound,
                SocialError::Unauthorized => Status::Unauthorized,
                SocialError::Conflict(_) => Status::Conflict,
                SocialError::InvariantViolation(_)
                | SocialError::Timeout
                | SocialError::Storage(_) => Status::InternalServerError,
            },
            ApiError::Conflict(_) => Status::Conflict,
            ApiError::Internal => Status::InternalServerError,
            ApiError::Unauthorized => Status::Unauthorized,
            ApiError::Forbidden => Status::Forbidden,
        }
    }

    fn body(&self) -> Value {
        let message = match self {
            ApiError::Validation(error) => return json!({ "errors": error }),
            ApiError::Diesel(DieselError::NotFound) => "entity not found".to_string(),
            ApiError::Diesel(_) | ApiError::Internal => "internal error".to_string(),
            ApiError::Social(error) => match error {
                SocialError::Storage(_) => "internal error".to_string(),
                other => other.to_string(),
            },
            ApiError::Conflict(message) => message.to_string(),
            ApiError::Unauthorized => "401 Unauthorized".to_string(),
            ApiError::Forbidden => "403 Forbidden".to_string(),
        };
        json!({ "errors": { "body": [message] } })
    }
}

impl<'r> Responder<'r, 'static> for ApiError {
    fn respond_to(self, req: &'r Request<'_>) -> response::Result<'static> {
        let status = self.status();
        match &self {
            ApiError::Diesel(DieselError::NotFound) => {}
            ApiError::Diesel(error) => error!(%error, uri = %req.uri(), "database error"),
            ApiError::Social(error) if status == Status::InternalServerError => {
                error!(%error, uri = %req.uri(), "social graph failure")
            }
            ApiError::Internal => warn!(uri = %req.uri(), "internal error"),
            _ => {}
        }
        (status, Json(self.body())).respond_to(req)
    }
}

impl<T> Validate for Json<T>
where
    T: Validate,
{
    type Error = <T as Validate>::Error;
    fn validate(self, connection: &mut PgConnection) -> Result<Self, Self::Error> {
        let inner = self.into_inner();
        let validated = inner.validate(connection)?;
        Ok(Json(validated))
    }
}
