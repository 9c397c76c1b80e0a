use std::borrow::Cow;
use std::collections::{HashMap, HashSet};

use diesel::prelude::*;
use rocket::serde::json::Json;
use rocket::State;
use serde::Serialize;
use tracing::info;

use crate::db::schema::{follows, users};
use crate::db::Db;
use crate::social::{self, ProfileView};
use crate::types::{ApiError, ApiResult};
use crate::users::models::User;
use crate::users::CurrentUser;

#[derive(Debug, Serialize)]
pub struct ProfileResponse {
    profile: ProfileView,
}

/// Author block embedded in articles and comments.
#[derive(Debug, Serialize)]
pub struct Author<'a> {
    pub username: Cow<'a, str>,
    pub bio: Option<Cow<'a, str>>,
    pub image: Option<Cow<'a, str>>,
    pub following: bool,
}

impl User {
    pub fn author(self, following: bool) -> Author<'static> {
        Author {
            username: Cow::Owned(self.username),
            bio: self.bio.map(Cow::Owned),
            image: self.image.map(Cow::Owned),
            following,
        }
    }
}

/// Users with the given ids, keyed by id.
pub fn load_authors(
    ids: &[i32],
    connection: &mut PgConnection,
) -> Result<HashMap<i32, User>, ApiError> {
    let authors = users::table
        .filter(users::id.eq_any(ids))
        .select(User::as_select())
        .load::<User>(connection)?;
    Ok(authors.into_iter().map(|user| (user.id, user)).collect())
}

/// The subset of `authors` that `viewer` follows. Anonymous viewers follow
/// nobody.
pub fn followed_among(
    viewer: Option<i32>,
    authors: &[i32],
    connection: &mut PgConnection,
) -> Result<HashSet<i32>, ApiError> {
    let viewer = match viewer {
        Some(viewer) => viewer,
        None => return Ok(HashSet::new()),
    };
    let followed = follows::table
        .filter(follows::follower_id.eq(viewer))
        .filter(follows::followee_id.eq_any(authors))
        .select(follows::followee_id)
        .load::<i32>(connection)?;
    Ok(followed.into_iter().collect())
}

#[get("/profiles/<name>")]
pub async fn profile(
    db: &State<Db>,
    current_user: CurrentUser,
    name: String,
) -> ApiResult<ProfileResponse> {
    let current = current_user?;
    let profile = db
        .social(move |store| social::profile(store, current.id, &name))
        .await?;
    Ok(Json(ProfileResponse { profile }))
}

#[post("/profiles/<name>/follow")]
pub async fn follow(
    db: &State<Db>,
    current_user: CurrentUser,
    name: String,
) -> ApiResult<ProfileResponse> {
    let current = current_user?;
    let profile = db
        .social(move |store| social::follow(store, current.id, &name))
        .await?;
    info!(follower = current.id, followee = %profile.username, "followed");
    Ok(Json(ProfileResponse { profile }))
}

#[delete("/profiles/<name>/follow")]
pub async fn unfollow(
    db: &State<Db>,
    current_user: CurrentUser,
    name: String,
) -> ApiResult<ProfileResponse> {
    let current = current_user?;
    let profile = db
        .social(move |store| social::unfollow(store, current.id, &name))
        .await?;
    info!(follower = current.id, followee = %profile.username, "unfollowed");
    Ok(Json(ProfileResponse { profile }))
}
