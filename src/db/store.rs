//! PostgreSQL implementation of the social-graph store.
//!
//! Membership sets live in the `follows` and `favorites` tables, one row per
//! pair, ordered by their serial id. Persisting a set only touches the rows
//! that changed: rows that are already stored are never rewritten, so a
//! concurrent delete of an unrelated article can't fail the write. A
//! transaction pins `statement_timeout`
//! and `lock_timeout` to the store's deadline, and the deadline is checked
//! again before every operation.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use diesel::pg::PgConnection;
use diesel::prelude::*;
use diesel::result::Error as DieselError;
use diesel::{delete, insert_into, sql_query, update};
use indexmap::IndexSet;
use tracing::{debug_span, field};

use crate::db::schema::{articles, favorites, follows, users};
use crate::social::store::{ArticleRecord, UserRecord};
use crate::social::{ArticleId, ProfileRecord, SocialError, Store, Transaction, UserId};

type ProfileRow = (i32, String, Option<String>, Option<String>);

impl From<DieselError> for SocialError {
    fn from(err: DieselError) -> SocialError {
        match &err {
            DieselError::DatabaseError(_, info) if is_timeout(info.message()) => {
                SocialError::Timeout
            }
            _ => SocialError::storage(err),
        }
    }
}

fn is_timeout(message: &str) -> bool {
    message.contains("statement timeout") || message.contains("lock timeout")
}

/// Split the change from `stored` to `wanted` into the ids to delete and the
/// ids to insert, the latter in `wanted` order.
fn diff(stored: &[i32], wanted: &IndexSet<i32>) -> (Vec<i32>, Vec<i32>) {
    let stored_set: HashSet<i32> = stored.iter().copied().collect();
    let stale = stored
        .iter()
        .copied()
        .filter(|id| !wanted.contains(id))
        .collect();
    let fresh = wanted
        .iter()
        .copied()
        .filter(|id| !stored_set.contains(id))
        .collect();
    (stale, fresh)
}

fn profile_record((id, username, bio, image): ProfileRow) -> ProfileRecord {
    ProfileRecord {
        id,
        username,
        bio,
        image,
    }
}

pub struct PgStore<'c> {
    connection: &'c mut PgConnection,
    timeout: Duration,
}

impl<'c> PgStore<'c> {
    pub fn new(connection: &'c mut PgConnection, timeout: Duration) -> Self {
        PgStore {
            connection,
            timeout,
        }
    }
}

impl Store for PgStore<'_> {
    fn transaction<T, F>(&mut self, f: F) -> Result<T, SocialError>
    where
        F: FnOnce(&mut dyn Transaction) -> Result<T, SocialError>,
    {
        let deadline = Instant::now() + self.timeout;
        // zero would disable the server-side timeouts entirely
        let millis = self.timeout.as_millis().max(1);
        self.connection.transaction(|connection| {
            sql_query(format!("SET LOCAL statement_timeout = {millis}")).execute(connection)?;
            sql_query(format!("SET LOCAL lock_timeout = {millis}")).execute(connection)?;
            let mut tx = PgTransaction {
                connection,
                deadline,
            };
            f(&mut tx)
        })
    }
}

struct PgTransaction<'a> {
    connection: &'a mut PgConnection,
    deadline: Instant,
}

impl PgTransaction<'_> {
    fn check_deadline(&self) -> Result<(), SocialError> {
        if Instant::now() >= self.deadline {
            Err(SocialError::Timeout)
        } else {
            Ok(())
        }
    }

    fn user(&mut self, id: UserId, lock: bool) -> Result<Option<UserRecord>, SocialError> {
        self.check_deadline()?;
        let _span = debug_span!("store.load_user", user = id, lock).entered();

        let query = users::table
            .find(id)
            .select((users::id, users::username, users::bio, users::image));
        let row = if lock {
            query
                .for_update()
                .first::<ProfileRow>(self.connection)
                .optional()?
        } else {
            query.first::<ProfileRow>(self.connection).optional()?
        };
        let Some(row) = row else {
            return Ok(None);
        };

        let following = follows::table
            .filter(follows::follower_id.eq(id))
            .order(follows::id)
            .select(follows::followee_id)
            .load::<UserId>(self.connection)?;
        let favorites = favorites::table
            .filter(favorites::user_id.eq(id))
            .order(favorites::id)
            .select(favorites::article_id)
            .load::<ArticleId>(self.connection)?;

        Ok(Some(UserRecord {
            profile: profile_record(row),
            following: following.into_iter().collect(),
            favorites: favorites.into_iter().collect(),
        }))
    }
}

impl Transaction for PgTransaction<'_> {
    fn find_profile(&mut self, username: &str) -> Result<Option<ProfileRecord>, SocialError> {
        self.check_deadline()?;
        let _span = debug_span!("store.find_profile", username).entered();
        let row = users::table
            .filter(users::username.eq(username))
            .select((users::id, users::username, users::bio, users::image))
            .first::<ProfileRow>(self.connection)
            .optional()?;
        Ok(row.map(profile_record))
    }

    fn load_user(&mut self, id: UserId) -> Result<Option<UserRecord>, SocialError> {
        self.user(id, false)
    }

    fn lock_user(&mut self, id: UserId) -> Result<Option<UserRecord>, SocialError> {
        self.user(id, true)
    }

    fn lock_article(&mut self, slug: &str) -> Result<Option<ArticleRecord>, SocialError> {
        self.check_deadline()?;
        let _span = debug_span!("store.lock_article", slug).entered();
        let row = articles::table
            .filter(articles::slug.eq(slug))
            .select((
                articles::id,
                articles::slug,
                articles::favorites_count,
            ))
            .for_update()
            .first::<(i32, String, i32)>(self.connection)
            .optional()?;
        Ok(row.map(|(id, slug, favorites_count)| ArticleRecord {
            id,
            slug,
            favorites_count,
        }))
    }

    fn persist_following(
        &mut self,
        user: UserId,
        following: &IndexSet<UserId>,
    ) -> Result<(), SocialError> {
        self.check_deadline()?;
        let span = debug_span!(
            "store.persist_following",
            user,
            size = following.len(),
            removed = field::Empty,
            added = field::Empty,
        );
        let _guard = span.enter();

        let stored = follows::table
            .filter(follows::follower_id.eq(user))
            .select(follows::followee_id)
            .load::<UserId>(self.connection)?;
        let (stale, fresh) = diff(&stored, following);

        if !stale.is_empty() {
            let removed = delete(
                follows::table
                    .filter(follows::follower_id.eq(user))
                    .filter(follows::followee_id.eq_any(&stale)),
            )
            .execute(self.connection)?;
            span.record("removed", removed);
        }
        if !fresh.is_empty() {
            let rows: Vec<_> = fresh
                .iter()
                .map(|&followee| (follows::follower_id.eq(user), follows::followee_id.eq(followee)))
                .collect();
            let added = insert_into(follows::table)
                .values(rows)
                .on_conflict((follows::follower_id, follows::followee_id))
                .do_nothing()
                .execute(self.connection)?;
            span.record("added", added);
        }
        Ok(())
    }

    fn persist_favorites(
        &mut self,
        user: UserId,
        favorites: &IndexSet<ArticleId>,
    ) -> Result<(), SocialError> {
        self.check_deadline()?;
        let span = debug_span!(
            "store.persist_favorites",
            user,
            size = favorites.len(),
            removed = field::Empty,
            added = field::Empty,
        );
        let _guard = span.enter();

        let stored = favorites::table
            .filter(favorites::user_id.eq(user))
            .select(favorites::article_id)
            .load::<ArticleId>(self.connection)?;
        let (stale, fresh) = diff(&stored, favorites);

        if !stale.is_empty() {
            let removed = delete(
                favorites::table
                    .filter(favorites::user_id.eq(user))
                    .filter(favorites::article_id.eq_any(&stale)),
            )
            .execute(self.connection)?;
            span.record("removed", removed);
        }
        if !fresh.is_empty() {
            let rows: Vec<_> = fresh
                .iter()
                .map(|&article| (favorites::user_id.eq(user), favorites::article_id.eq(article)))
                .collect();
            let added = insert_into(favorites::table)
                .values(rows)
                .on_conflict((favorites::user_id, favorites::article_id))
                .do_nothing()
                .execute(self.connection)?;
            span.record("added", added);
        }
        Ok(())
    }

    fn persist_favorites_count(
        &mut self,
        article: ArticleId,
        count: i32,
    ) -> Result<(), SocialError> {
        self.check_deadline()?;
        let _span = debug_span!("store.persist_favorites_count", article, count).entered();
        update(articles::table.find(article))
            .set(articles::favorites_count.eq(count))
            .execute(self.connection)?;
        Ok(())
    }
}
