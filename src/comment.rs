use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::{delete as diesel_delete, insert_into};
use rocket::serde::json::Json;
use rocket::State;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::article::Article;
use crate::db::schema::comments;
use crate::db::Db;
use crate::profile::{followed_among, load_authors, Author};
use crate::types::{ApiError, ApiResult, ValidationError};
use crate::users::models::{Auth, User};
use crate::users::CurrentUser;
use crate::utils::serialize_date;

#[derive(Debug, PartialEq, Queryable, Selectable, Identifiable, Associations)]
#[diesel(belongs_to(Article))]
#[diesel(table_name = comments)]
pub struct Comment {
    id: i32,
    article_id: i32,
    user_id: i32,
    body: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct CommentView<'r> {
    id: i32,
    #[serde(serialize_with = "serialize_date")]
    created_at: DateTime<Utc>,
    #[serde(serialize_with = "serialize_date")]
    updated_at: DateTime<Utc>,
    body: String,
    author: Author<'r>,
}

impl<'r> From<(Comment, Author<'r>)> for CommentView<'r> {
    fn from((comment, author): (Comment, Author<'r>)) -> Self {
        CommentView {
            id: comment.id,
            author,
            created_at: comment.created_at,
            updated_at: comment.updated_at,
            body: comment.body,
        }
    }
}

#[derive(Insertable)]
#[diesel(table_name = comments)]
pub struct NewComment {
    article_id: i32,
    user_id: i32,
    body: String,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct CommentBody {
    body: String,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct CommentContainer<T> {
    comment: T,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct CommentsContainer<T> {
    comments: T,
}

impl CommentBody {
    fn check(self) -> Result<Self, ValidationError> {
        if self.body.trim().is_empty() {
            Err(ValidationError::from("body", "empty body"))
        } else {
            Ok(self)
        }
    }
}

#[post("/articles/<slug>/comments", format = "json", data = "<details>")]
pub async fn add(
    db: &State<Db>,
    current_user: CurrentUser,
    slug: String,
    details: Json<CommentContainer<CommentBody>>,
) -> ApiResult<CommentContainer<CommentView<'static>>> {
    let current = current_user?;
    let details = details.into_inner().comment.check()?;
    let view = db
        .run(move |connection| {
            let article = Article::load_by_slug(&slug, connection)?;
            let user = User::load_by_id(current.id, connection)?;
            let new_comment = NewComment {
                article_id: article.id,
                user_id: user.id,
                body: details.body,
            };
            let comment = insert_into(comments::table)
                .values(&new_comment)
                .returning(Comment::as_returning())
                .get_result(connection)?;
            info!(user = user.id, article = article.id, comment = comment.id, "comment added");
            Ok(CommentView::from((comment, user.author(false))))
        })
        .await?;
    Ok(Json(CommentContainer { comment: view }))
}

#[get("/articles/<slug>/comments")]
pub async fn list(
    db: &State<Db>,
    viewer: Option<Auth>,
    slug: String,
) -> ApiResult<CommentsContainer<Vec<CommentView<'static>>>> {
    let views = db
        .run(move |connection| {
            let article = Article::load_by_slug(&slug, connection)?;
            let comments = Comment::belonging_to(&article)
                .order(comments::created_at.asc())
                .select(Comment::as_select())
                .load::<Comment>(connection)?;

            let mut author_ids = comments.iter().map(|c| c.user_id).collect::<Vec<_>>();
            author_ids.sort_unstable();
            author_ids.dedup();
            let authors = load_authors(&author_ids, connection)?;
            let followed = followed_among(viewer.map(|v| v.id), &author_ids, connection)?;

            comments
                .into_iter()
                .map(|comment| -> Result<CommentView<'static>, ApiError> {
                    let author = authors
                        .get(&comment.user_id)
                        .cloned()
                        .ok_or(ApiError::Internal)?
                        .author(followed.contains(&comment.user_id));
                    Ok((comment, author).into())
                })
                .collect::<Result<Vec<_>, _>>()
        })
        .await?;
    Ok(Json(CommentsContainer { comments: views }))
}

#[delete("/articles/<slug>/comments/<id>")]
pub async fn delete(
    db: &State<Db>,
    current_user: CurrentUser,
    slug: String,
    id: i32,
) -> ApiResult<()> {
    let current = current_user?;
    db.run(move |connection| {
        let article = Article::load_by_slug(&slug, connection)?;
        let comment = Comment::belonging_to(&article)
            .filter(comments::id.eq(id))
            .select(Comment::as_select())
            .first::<Comment>(connection)?;
        if comment.user_id != current.id {
            return Err(ApiError::Forbidden);
        }
        diesel_delete(&comment).execute(connection)?;
        info!(user = current.id, comment = comment.id, "comment deleted");
        Ok(())
    })
    .await?;
    Ok(Json(()))
}
