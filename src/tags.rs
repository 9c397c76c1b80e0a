use diesel::prelude::*;
use diesel::sql_query;
use diesel::sql_types::Text;
use rocket::serde::json::Json;
use rocket::State;
use serde::Serialize;

use crate::db::Db;
use crate::types::ApiResult;

static SELECT_TAGS: &str = "SELECT DISTINCT unnest(tag_list) AS tag FROM articles ORDER BY tag";

#[derive(Debug, QueryableByName)]
struct Tag {
    #[diesel(sql_type = Text)]
    tag: String,
}

#[derive(Debug, Serialize)]
pub struct TagsResponse {
    tags: Vec<String>,
}

#[get("/tags")]
pub async fn tags(db: &State<Db>) -> ApiResult<TagsResponse> {
    let tags = db
        .run(|connection| {
            let rows = sql_query(SELECT_TAGS).load::<Tag>(connection)?;
            Ok(rows.into_iter().map(|row| row.tag).collect::<Vec<_>>())
        })
        .await?;
    Ok(Json(TagsResponse { tags }))
}
