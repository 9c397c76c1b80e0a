use std::collections::HashSet;

use chrono::{DateTime, Utc};
use diesel::expression_methods::PgArrayExpressionMethods;
use diesel::pg::Pg;
use diesel::prelude::*;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel::{delete as diesel_delete, insert_into, update as diesel_update};
use indexmap::IndexSet;
use rocket::serde::json::Json;
use rocket::State;
use serde::{Deserialize, Serialize};
use slug::slugify;
use tracing::info;

use crate::db::schema::{articles, favorites, follows, users};
use crate::db::Db;
use crate::profile::{followed_among, load_authors, Author};
use crate::social;
use crate::types::{ApiError, ApiResult, Validate, ValidationError};
use crate::users::models::Auth;
use crate::users::CurrentUser;
use crate::utils::serialize_date;

const DEFAULT_LIMIT: i64 = 20;

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Identifiable)]
#[diesel(table_name = articles)]
pub struct Article {
    pub id: i32,
    pub author_id: i32,
    pub slug: String,
    pub title: String,
    pub description: String,
    pub body: String,
    pub tag_list: Vec<String>,
    pub favorites_count: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Article {
    pub fn load_by_slug(slug: &str, connection: &mut PgConnection) -> Result<Article, ApiError> {
        articles::table
            .filter(articles::slug.eq(slug))
            .select(Article::as_select())
            .get_result(connection)
            .map_err(|e| e.into())
    }

    fn owned_by(self, user: &Auth) -> Result<Article, ApiError> {
        if self.author_id == user.id {
            Ok(self)
        } else {
            Err(ApiError::Forbidden)
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArticleView {
    slug: String,
    title: String,
    description: String,
    body: String,
    tag_list: Vec<String>,
    #[serde(serialize_with = "serialize_date")]
    created_at: DateTime<Utc>,
    #[serde(serialize_with = "serialize_date")]
    updated_at: DateTime<Utc>,
    favorited: bool,
    favorites_count: i32,
    author: Author<'static>,
}

impl ArticleView {
    fn new(article: Article, author: Author<'static>, favorited: bool) -> Self {
        ArticleView {
            slug: article.slug,
            title: article.title,
            description: article.description,
            body: article.body,
            tag_list: article.tag_list,
            created_at: article.created_at,
            updated_at: article.updated_at,
            favorited,
            favorites_count: article.favorites_count,
            author,
        }
    }
}

/// Render `articles` for `viewer`, resolving authors and the viewer's
/// favorite and follow flags in one query each.
fn views(
    articles: Vec<Article>,
    viewer: Option<i32>,
    connection: &mut PgConnection,
) -> Result<Vec<ArticleView>, ApiError> {
    let article_ids = articles.iter().map(|a| a.id).collect::<Vec<_>>();
    let author_ids = articles
        .iter()
        .map(|a| a.author_id)
        .collect::<IndexSet<_>>()
        .into_iter()
        .collect::<Vec<_>>();

    let authors = load_authors(&author_ids, connection)?;
    let followed = followed_among(viewer, &author_ids, connection)?;
    let favorited: HashSet<i32> = match viewer {
        Some(viewer) => favorites::table
            .filter(favorites::user_id.eq(viewer))
            .filter(favorites::article_id.eq_any(&article_ids))
            .select(favorites::article_id)
            .load::<i32>(connection)?
            .into_iter()
            .collect(),
        None => HashSet::new(),
    };

    articles
        .into_iter()
        .map(|article| -> Result<ArticleView, ApiError> {
            let author = authors
                .get(&article.author_id)
                .cloned()
                .ok_or(ApiError::Internal)?
                .author(followed.contains(&article.author_id));
            let is_favorite = favorited.contains(&article.id);
            Ok(ArticleView::new(article, author, is_favorite))
        })
        .collect()
}

fn view(
    article: Article,
    viewer: Option<i32>,
    connection: &mut PgConnection,
) -> Result<ArticleView, ApiError> {
    views(vec![article], viewer, connection)?
        .pop()
        .ok_or(ApiError::Internal)
}

#[derive(Debug, Serialize)]
pub struct ArticleResponse {
    article: ArticleView,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArticlesResponse {
    articles: Vec<ArticleView>,
    articles_count: i64,
}

#[derive(Debug, Serialize)]
pub struct FavoriteResponse {
    message: String,
    article: ArticleView,
}

#[derive(Debug, FromForm)]
pub struct ListQuery {
    tag: Option<String>,
    author: Option<String>,
    favorited: Option<String>,
    limit: Option<i64>,
    offset: Option<i64>,
}

type ArticleQuery = articles::BoxedQuery<'static, Pg>;

/// Which articles a listing covers.
enum Listing {
    Filtered {
        tag: Option<String>,
        author: Option<String>,
        favorited: Option<String>,
    },
    Feed(i32),
}

impl Listing {
    fn query(&self) -> ArticleQuery {
        let mut query = articles::table.into_boxed();
        match self {
            Listing::Filtered {
                tag,
                author,
                favorited,
            } => {
                if let Some(tag) = tag {
                    query = query.filter(PgArrayExpressionMethods::contains(
                        articles::tag_list,
                        vec![tag.clone()],
                    ));
                }
                if let Some(author) = author {
                    query = query.filter(
                        articles::author_id.eq_any(
                            users::table
                                .filter(users::username.eq(author.clone()))
                                .select(users::id),
                        ),
                    );
                }
                if let Some(fan) = favorited {
                    query = query.filter(
                        articles::id.eq_any(
                            favorites::table
                                .inner_join(users::table)
                                .filter(users::username.eq(fan.clone()))
                                .select(favorites::article_id),
                        ),
                    );
                }
            }
            Listing::Feed(follower) => {
                query = query.filter(
                    articles::author_id.eq_any(
                        follows::table
                            .filter(follows::follower_id.eq(*follower))
                            .select(follows::followee_id),
                    ),
                );
            }
        }
        query
    }

    /// One page, newest first.
    fn page(&self, limit: Option<i64>, offset: Option<i64>) -> ArticleQuery {
        let (limit, offset) = window(limit, offset);
        self.query()
            .order((articles::created_at.desc(), articles::id.desc()))
            .limit(limit)
            .offset(offset)
    }

    fn load(
        &self,
        limit: Option<i64>,
        offset: Option<i64>,
        viewer: Option<i32>,
        connection: &mut PgConnection,
    ) -> Result<ArticlesResponse, ApiError> {
        let articles_count = self.query().count().get_result::<i64>(connection)?;
        let articles = self.page(limit, offset).load::<Article>(connection)?;
        Ok(ArticlesResponse {
            articles: views(articles, viewer, connection)?,
            articles_count,
        })
    }
}

/// `(limit, offset)` with defaults applied and negatives clamped to zero.
fn window(limit: Option<i64>, offset: Option<i64>) -> (i64, i64) {
    (
        limit.unwrap_or(DEFAULT_LIMIT).max(0),
        offset.unwrap_or(0).max(0),
    )
}

#[get("/articles?<query..>")]
pub async fn list(
    db: &State<Db>,
    viewer: Option<Auth>,
    query: ListQuery,
) -> ApiResult<ArticlesResponse> {
    let response = db
        .run(move |connection| {
            let listing = Listing::Filtered {
                tag: query.tag,
                author: query.author,
                favorited: query.favorited,
            };
            listing.load(query.limit, query.offset, viewer.map(|v| v.id), connection)
        })
        .await?;
    Ok(Json(response))
}

#[get("/articles/feed?<limit>&<offset>")]
pub async fn feed(
    db: &State<Db>,
    current_user: CurrentUser,
    limit: Option<i64>,
    offset: Option<i64>,
) -> ApiResult<ArticlesResponse> {
    let current = current_user?;
    let response = db
        .run(move |connection| {
            Listing::Feed(current.id).load(limit, offset, Some(current.id), connection)
        })
        .await?;
    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
pub struct ArticleDetails {
    title: String,
    description: String,
    body: String,
    #[serde(rename = "tagList", default)]
    tag_list: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateArticle {
    article: ArticleDetails,
}

fn check_not_blank(errors: &mut ValidationError, field: &'static str, value: &str) {
    if value.trim().is_empty() {
        errors.add_error(field, format!("empty {}", field));
    }
}

impl CreateArticle {
    fn check(self) -> Result<Self, ValidationError> {
        let mut errors = ValidationError::default();
        check_not_blank(&mut errors, "title", &self.article.title);
        check_not_blank(&mut errors, "description", &self.article.description);
        check_not_blank(&mut errors, "body", &self.article.body);
        if !self.article.title.trim().is_empty() && slugify(&self.article.title).is_empty() {
            errors.add_error("title", "title must contain letters or digits");
        }
        errors.into_result(self)
    }
}

impl Validate for CreateArticle {
    type Error = ValidationError;
    fn validate(self, _connection: &mut PgConnection) -> Result<Self, ValidationError> {
        self.check()
    }
}

#[derive(Insertable)]
#[diesel(table_name = articles)]
pub struct NewArticle {
    author_id: i32,
    slug: String,
    title: String,
    description: String,
    body: String,
    tag_list: Vec<String>,
}

impl NewArticle {
    fn new(author_id: i32, details: ArticleDetails) -> Self {
        NewArticle {
            author_id,
            slug: slugify(&details.title),
            title: details.title,
            description: details.description,
            body: details.body,
            // Duplicate tags collapse, first occurrence wins.
            tag_list: details
                .tag_list
                .into_iter()
                .map(|tag| tag.trim().to_string())
                .filter(|tag| !tag.is_empty())
                .collect::<IndexSet<_>>()
                .into_iter()
                .collect(),
        }
    }
}

#[post("/articles", format = "json", data = "<create>")]
pub async fn create(
    db: &State<Db>,
    current_user: CurrentUser,
    create: Json<CreateArticle>,
) -> ApiResult<ArticleResponse> {
    let current = current_user?;
    let response = db
        .run(move |connection| {
            let create = create.validate(connection)?.into_inner();
            let article = insert_into(articles::table)
                .values(NewArticle::new(current.id, create.article))
                .returning(Article::as_returning())
                .get_result(connection)
                .map_err(|e| match e {
                    DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _) => {
                        ApiError::Conflict("title already used")
                    }
                    other => other.into(),
                })?;
            info!(author = current.id, slug = %article.slug, "article created");
            Ok(ArticleResponse {
                article: view(article, Some(current.id), connection)?,
            })
        })
        .await?;
    Ok(Json(response))
}

#[get("/articles/<slug>")]
pub async fn get(
    db: &State<Db>,
    viewer: Option<Auth>,
    slug: String,
) -> ApiResult<ArticleResponse> {
    let response = db
        .run(move |connection| {
            let article = Article::load_by_slug(&slug, connection)?;
            Ok(ArticleResponse {
                article: view(article, viewer.map(|v| v.id), connection)?,
            })
        })
        .await?;
    Ok(Json(response))
}

#[derive(Debug, Deserialize, AsChangeset)]
#[diesel(table_name = articles)]
pub struct UpdateDetails {
    title: Option<String>,
    description: Option<String>,
    body: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateArticle {
    article: UpdateDetails,
}

impl UpdateArticle {
    fn check(self) -> Result<UpdateDetails, ValidationError> {
        let details = self.article;
        let mut errors = ValidationError::default();
        if details.title.is_none() && details.description.is_none() && details.body.is_none() {
            errors.add_error("article", "nothing to update");
        }
        if let Some(title) = &details.title {
            check_not_blank(&mut errors, "title", title);
        }
        if let Some(description) = &details.description {
            check_not_blank(&mut errors, "description", description);
        }
        if let Some(body) = &details.body {
            check_not_blank(&mut errors, "body", body);
        }
        errors.into_result(details)
    }
}

/// The slug is fixed at creation; a new title does not move the article.
#[put("/articles/<slug>", format = "json", data = "<update>")]
pub async fn update(
    db: &State<Db>,
    current_user: CurrentUser,
    slug: String,
    update: Json<UpdateArticle>,
) -> ApiResult<ArticleResponse> {
    let current = current_user?;
    let changes = update.into_inner().check()?;
    let response = db
        .run(move |connection| {
            let article = Article::load_by_slug(&slug, connection)?.owned_by(&current)?;
            let article = diesel_update(&article)
                .set((&changes, articles::updated_at.eq(Utc::now())))
                .returning(Article::as_returning())
                .get_result(connection)?;
            Ok(ArticleResponse {
                article: view(article, Some(current.id), connection)?,
            })
        })
        .await?;
    Ok(Json(response))
}

#[delete("/articles/<slug>")]
pub async fn delete(db: &State<Db>, current_user: CurrentUser, slug: String) -> ApiResult<()> {
    let current = current_user?;
    db.run(move |connection| {
        let article = Article::load_by_slug(&slug, connection)?.owned_by(&current)?;
        // Favorites and comments go with the article.
        diesel_delete(&article).execute(connection)?;
        info!(author = current.id, slug = %article.slug, "article deleted");
        Ok(())
    })
    .await?;
    Ok(Json(()))
}

async fn favorite_response(
    db: &State<Db>,
    outcome: social::FavoriteOutcome,
    viewer: i32,
) -> ApiResult<FavoriteResponse> {
    let message = outcome.to_string();
    let article_id = outcome.article_id;
    let article = db
        .run(move |connection| {
            let article = articles::table
                .find(article_id)
                .select(Article::as_select())
                .get_result(connection)?;
            view(article, Some(viewer), connection)
        })
        .await?;
    Ok(Json(FavoriteResponse { message, article }))
}

#[post("/articles/<slug>/favorite")]
pub async fn favorite(
    db: &State<Db>,
    current_user: CurrentUser,
    slug: String,
) -> ApiResult<FavoriteResponse> {
    let current = current_user?;
    let outcome = db
        .social(move |store| social::favorite(store, current.id, &slug))
        .await?;
    info!(
        user = current.id,
        slug = %outcome.slug,
        count = outcome.favorites_count,
        "favorited"
    );
    favorite_response(db, outcome, current.id).await
}

#[delete("/articles/<slug>/favorite")]
pub async fn unfavorite(
    db: &State<Db>,
    current_user: CurrentUser,
    slug: String,
) -> ApiResult<FavoriteResponse> {
    let current = current_user?;
    let outcome = db
        .social(move |store| social::unfavorite(store, current.id, &slug))
        .await?;
    info!(
        user = current.id,
        slug = %outcome.slug,
        count = outcome.favorites_count,
        "unfavorited"
    );
    favorite_response(db, outcome, current.id).await
}
