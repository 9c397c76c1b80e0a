use diesel::dsl::exists;
use diesel::prelude::*;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel::{insert_into, select, update as diesel_update};
use rocket::http::Status;
use rocket::outcome::Outcome;
use rocket::request::{self, FromRequest, Request};
use rocket::serde::json::Json;
use rocket::State;
use serde::Deserialize;
use tracing::info;

use crate::config::AppConfig;
use crate::db::schema::users;
use crate::db::Db;
use crate::types::{ApiError, ApiResult, Validate, ValidationError};

pub mod models;
mod utils;

use self::models::{Auth, NewUser, User, UserResponse};
use self::utils::*;

pub type CurrentUser = Result<Auth, ApiError>;

#[rocket::async_trait]
impl<'r> FromRequest<'r> for Auth {
    type Error = ApiError;

    async fn from_request(request: &'r Request<'_>) -> request::Outcome<Self, Self::Error> {
        let config = match request.rocket().state::<AppConfig>() {
            Some(config) => config,
            None => return Outcome::Error((Status::InternalServerError, ApiError::Internal)),
        };
        match request.headers().get_one("Authorization") {
            Some(header) => match Auth::from_header(header, &config.jwt_secret) {
                Ok(auth) => Outcome::Success(auth),
                Err(e) => Outcome::Error((Status::Unauthorized, e)),
            },
            None => Outcome::Error((Status::Unauthorized, ApiError::Unauthorized)),
        }
    }
}

fn taken(err: DieselError) -> ApiError {
    match err {
        DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _) => {
            ApiError::Conflict("username or email already taken")
        }
        other => other.into(),
    }
}

#[derive(Debug, Deserialize)]
struct RegistrationDetails {
    username: String,
    email: String,
    password: String,
}

#[derive(Debug, Deserialize)]
pub struct Registration {
    user: RegistrationDetails,
}

impl Validate for Registration {
    type Error = ApiError;
    fn validate(self, connection: &mut PgConnection) -> Result<Self, Self::Error> {
        let mut errors = ValidationError::default();

        match validate_email(&self.user.email, connection) {
            Ok(_) => {}
            Err(ApiError::Validation(e)) => errors.merge(e),
            Err(other) => return Err(other),
        }

        if let Err(e) = validate_password(&self.user.password) {
            errors.merge(e);
        }

        if let Err(e) = validate_username_re(&self.user.username) {
            errors.merge(e);
        }

        let username_exists =
            select(exists(users::table.filter(users::username.eq(&self.user.username))))
                .get_result::<bool>(connection)?;
        if username_exists {
            errors.add_error("username", "username already exists");
        }

        errors.into_result(self).map_err(ApiError::from)
    }
}

#[post("/users", format = "json", data = "<registration>")]
pub async fn register(
    db: &State<Db>,
    config: &State<AppConfig>,
    registration: Json<Registration>,
) -> ApiResult<UserResponse> {
    let config = config.inner().clone();
    let response = db
        .run(move |connection| {
            let registration = registration.validate(connection)?.into_inner();
            let new_user = NewUser {
                username: registration.user.username,
                email: registration.user.email,
                password: User::make_password(&registration.user.password)?,
            };
            let user = insert_into(users::table)
                .values(&new_user)
                .returning(User::as_returning())
                .get_result(connection)
                .map_err(taken)?;
            info!(user = user.id, "registered");
            UserResponse::new(user, &config)
        })
        .await?;
    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
struct LoginDetails {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct Login {
    user: LoginDetails,
}

#[post("/users/login", format = "json", data = "<login>")]
pub async fn login(
    db: &State<Db>,
    config: &State<AppConfig>,
    login: Json<Login>,
) -> ApiResult<UserResponse> {
    let config = config.inner().clone();
    let login = login.into_inner();
    let response = db
        .run(move |connection| {
            let user = users::table
                .filter(users::email.eq(&login.user.email))
                .select(User::as_select())
                .first(connection)
                .optional()?;
            let invalid = || ApiError::from(ValidationError::from("email or password", "is invalid"));
            let user = user.ok_or_else(invalid)?;
            if !user.verify_password(&login.user.password)? {
                return Err(invalid());
            }
            UserResponse::new(user, &config)
        })
        .await?;
    Ok(Json(response))
}

#[get("/user")]
pub async fn current(
    db: &State<Db>,
    config: &State<AppConfig>,
    current_user: CurrentUser,
) -> ApiResult<UserResponse> {
    let current = current_user?;
    let config = config.inner().clone();
    let response = db
        .run(move |connection| {
            let user = User::load_by_id(current.id, connection)?;
            UserResponse::new(user, &config)
        })
        .await?;
    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
pub struct UpdateUser {
    pub username: Option<String>,
    pub email: Option<String>,
    pub password: Option<String>,
    pub image: Option<String>,
    pub bio: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Update {
    pub user: UpdateUser,
}

#[put("/user", format = "json", data = "<update>")]
pub async fn update(
    db: &State<Db>,
    config: &State<AppConfig>,
    current_user: CurrentUser,
    update: Json<Update>,
) -> ApiResult<UserResponse> {
    let current = current_user?;
    let config = config.inner().clone();
    let update = update.into_inner().user;
    let response = db
        .run(move |connection| {
            let mut user = User::load_by_id(current.id, connection)?;
            let mut error = ValidationError::default();

            if let Some(bio) = update.bio {
                user.bio = Some(bio);
            }
            if let Some(image) = update.image {
                user.image = Some(image);
            }

            if let Some(new_email) = update.email {
                match validate_email_re(&new_email) {
                    Err(e) => error.merge(e),
                    Ok(_) => user.email = new_email,
                }

                let expr = users::table
                    .filter(users::email.eq(&user.email))
                    .filter(users::id.ne(user.id));
                if select(exists(expr)).get_result::<bool>(connection)? {
                    error.add_error("email", format!("Email already chosen: {}", &user.email));
                }
            }

            if let Some(new_username) = update.username {
                match validate_username_re(&new_username) {
                    Err(e) => error.merge(e),
                    Ok(_) => user.username = new_username,
                }
                let expr = users::table
                    .filter(users::username.eq(&user.username))
                    .filter(users::id.ne(user.id));
                if select(exists(expr)).get_result::<bool>(connection)? {
                    error.add_error(
                        "username",
                        format!("Username already chosen: {}", user.username),
                    );
                }
            }

            if let Some(new_password) = update.password {
                match validate_password(&new_password) {
                    Err(e) => error.merge(e),
                    Ok(_) => user.new_password(&new_password)?,
                }
            }

            if !error.empty() {
                return Err(error.into());
            }
            diesel_update(&user)
                .set(&user)
                .execute(connection)
                .map_err(taken)?;
            UserResponse::new(user, &config)
        })
        .await?;
    Ok(Json(response))
}
