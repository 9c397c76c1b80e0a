//! Follow and favorite transitions, plus the viewer-relative profile view.
//!
//! Every entry point runs inside one [`Store::transaction`]: the membership
//! check, the set rewrite and any counter update either all land or none do.
//! Records whose sets or counters get rewritten are loaded through the
//! locking accessors, so two transitions on the same subject never interleave.

use std::fmt;

use serde::Serialize;

mod error;
#[cfg(test)]
pub mod memory;
pub mod store;

pub use self::error::SocialError;
pub use self::store::{ArticleId, ProfileRecord, Store, Transaction, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Add,
    Remove,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProfileView {
    #[serde(rename = "user_name")]
    pub username: String,
    pub bio: String,
    pub image: String,
    pub following: bool,
}

impl ProfileView {
    fn new(record: ProfileRecord, following: bool) -> Self {
        ProfileView {
            username: record.username,
            bio: record.bio.unwrap_or_default(),
            image: record.image.unwrap_or_default(),
            following,
        }
    }
}

/// Confirmation of a favorite transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FavoriteOutcome {
    pub action: Action,
    pub article_id: ArticleId,
    pub slug: String,
    pub favorites_count: i32,
}

impl fmt::Display for FavoriteOutcome {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.action {
            Action::Add => write!(f, "article `{}` added to favorites", self.slug),
            Action::Remove => write!(f, "article `{}` removed from favorites", self.slug),
        }
    }
}

/// Make `follower` follow or stop following the user called `username`.
///
/// Repeating a transition is rejected with `Conflict` in both directions.
pub fn set_following<S: Store>(
    store: &mut S,
    follower: UserId,
    username: &str,
    action: Action,
) -> Result<ProfileView, SocialError> {
    store.transaction(|tx| {
        let followee = tx
            .find_profile(username)?
            .ok_or(SocialError::NotFound("profile"))?;
        let mut follower = tx
            .lock_user(follower)?
            .ok_or(SocialError::NotFound("user"))?;

        if follower.id() == followee.id {
            return Err(SocialError::Conflict(match action {
                Action::Add => "cannot follow yourself",
                Action::Remove => "cannot unfollow yourself",
            }));
        }

        let following = match action {
            Action::Add => {
                if !follower.following.insert(followee.id) {
                    return Err(SocialError::Conflict("already following this user"));
                }
                true
            }
            Action::Remove => {
                if !follower.following.shift_remove(&followee.id) {
                    return Err(SocialError::Conflict("not following this user"));
                }
                false
            }
        };

        tx.persist_following(follower.id(), &follower.following)?;
        Ok(ProfileView::new(followee, following))
    })
}

pub fn follow<S: Store>(
    store: &mut S,
    follower: UserId,
    username: &str,
) -> Result<ProfileView, SocialError> {
    set_following(store, follower, username, Action::Add)
}

pub fn unfollow<S: Store>(
    store: &mut S,
    follower: UserId,
    username: &str,
) -> Result<ProfileView, SocialError> {
    set_following(store, follower, username, Action::Remove)
}

/// Add the article at `slug` to, or remove it from, `user`'s favorites and
/// move the article's `favorites_count` with it.
///
/// The article is locked before the user, for every caller.
pub fn set_favorite<S: Store>(
    store: &mut S,
    user: UserId,
    slug: &str,
    action: Action,
) -> Result<FavoriteOutcome, SocialError> {
    store.transaction(|tx| {
        let mut article = tx
            .lock_article(slug)?
            .ok_or(SocialError::NotFound("article"))?;
        let mut user = tx.lock_user(user)?.ok_or(SocialError::NotFound("user"))?;

        match action {
            Action::Add => {
                if !user.favorites.insert(article.id) {
                    return Err(SocialError::Conflict("article already in favorites"));
                }
                article.favorites_count = article
                    .favorites_count
                    .checked_add(1)
                    .ok_or(SocialError::InvariantViolation("favoritesCount overflow"))?;
            }
            Action::Remove => {
                if !user.favorites.shift_remove(&article.id) {
                    return Err(SocialError::Conflict("article not found in favorites"));
                }
                if article.favorites_count <= 0 {
                    return Err(SocialError::InvariantViolation(
                        "favoritesCount cannot go negative",
                    ));
                }
                article.favorites_count -= 1;
            }
        }

        tx.persist_favorites(user.id(), &user.favorites)?;
        tx.persist_favorites_count(article.id, article.favorites_count)?;

        Ok(FavoriteOutcome {
            action,
            article_id: article.id,
            slug: article.slug,
            favorites_count: article.favorites_count,
        })
    })
}

pub fn favorite<S: Store>(
    store: &mut S,
    user: UserId,
    slug: &str,
) -> Result<FavoriteOutcome, SocialError> {
    set_favorite(store, user, slug, Action::Add)
}

pub fn unfavorite<S: Store>(
    store: &mut S,
    user: UserId,
    slug: &str,
) -> Result<FavoriteOutcome, SocialError> {
    set_favorite(store, user, slug, Action::Remove)
}

/// Profile of `username` as seen by `viewer`.
pub fn profile<S: Store>(
    store: &mut S,
    viewer: UserId,
    username: &str,
) -> Result<ProfileView, SocialError> {
    store.transaction(|tx| {
        let viewer = tx.load_user(viewer)?.ok_or(SocialError::Unauthorized)?;
        let target = tx
            .find_profile(username)?
            .ok_or(SocialError::NotFound("profile"))?;
        let following = viewer.following.contains(&target.id);
        Ok(ProfileView::new(target, following))
    })
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use proptest::prelude::*;

    use super::memory::MemoryStore;
    use super::*;

    fn social_store() -> MemoryStore {
        let store = MemoryStore::new();
        store.add_user(1, "alice");
        store.add_user(2, "bob");
        store.add_user(3, "carol");
        store.add_user(4, "dave");
        store.add_article(10, "a1");
        store.add_article(11, "a2");
        store
    }

    fn following_of(store: &MemoryStore, user: UserId) -> Vec<UserId> {
        store.snapshot().users[&user].following.iter().copied().collect()
    }

    fn favorites_count(store: &MemoryStore, article: ArticleId) -> i32 {
        store.snapshot().articles[&article].favorites_count
    }

    #[test]
    fn follow_returns_followed_profile() {
        let mut store = social_store();
        let view = follow(&mut store, 1, "bob").unwrap();
        assert_eq!(view.username, "bob");
        assert!(view.following);
        assert_eq!(following_of(&store, 1), vec![2]);
    }

    #[test]
    fn duplicate_follow_is_rejected() {
        let mut store = social_store();
        follow(&mut store, 1, "bob").unwrap();
        let err = follow(&mut store, 1, "bob").unwrap_err();
        assert!(matches!(err, SocialError::Conflict(_)));
        assert_eq!(following_of(&store, 1), vec![2]);
    }

    #[test]
    fn self_follow_is_rejected() {
        let mut store = social_store();
        for (id, name) in [(1, "alice"), (2, "bob")] {
            let err = follow(&mut store, id, name).unwrap_err();
            assert!(matches!(err, SocialError::Conflict("cannot follow yourself")));
        }
        assert!(following_of(&store, 1).is_empty());
    }

    #[test]
    fn self_unfollow_names_the_action() {
        let mut store = social_store();
        let err = unfollow(&mut store, 1, "alice").unwrap_err();
        assert!(matches!(err, SocialError::Conflict("cannot unfollow yourself")));
    }

    #[test]
    fn unfollow_removes_and_repeat_is_rejected() {
        let mut store = social_store();
        follow(&mut store, 1, "bob").unwrap();
        let view = unfollow(&mut store, 1, "bob").unwrap();
        assert!(!view.following);
        assert!(following_of(&store, 1).is_empty());

        let err = unfollow(&mut store, 1, "bob").unwrap_err();
        assert!(matches!(err, SocialError::Conflict("not following this user")));
    }

    #[test]
    fn unfollow_keeps_order_of_remaining() {
        let mut store = social_store();
        for name in ["bob", "carol", "dave"] {
            follow(&mut store, 1, name).unwrap();
        }
        unfollow(&mut store, 1, "carol").unwrap();
        assert_eq!(following_of(&store, 1), vec![2, 4]);
    }

    #[test]
    fn follow_unknown_user() {
        let mut store = social_store();
        let err = follow(&mut store, 1, "mallory").unwrap_err();
        assert!(matches!(err, SocialError::NotFound("profile")));

        let err = follow(&mut store, 99, "bob").unwrap_err();
        assert!(matches!(err, SocialError::NotFound("user")));
    }

    #[test]
    fn profile_reflects_viewer() {
        let mut store = social_store();
        follow(&mut store, 1, "bob").unwrap();

        assert!(profile(&mut store, 1, "bob").unwrap().following);
        assert!(!profile(&mut store, 3, "bob").unwrap().following);
        assert!(!profile(&mut store, 2, "alice").unwrap().following);
    }

    #[test]
    fn profile_errors() {
        let mut store = social_store();
        let err = profile(&mut store, 99, "bob").unwrap_err();
        assert!(matches!(err, SocialError::Unauthorized));

        let err = profile(&mut store, 1, "mallory").unwrap_err();
        assert!(matches!(err, SocialError::NotFound(_)));
    }

    #[test]
    fn profile_wire_shape() {
        let mut store = social_store();
        follow(&mut store, 1, "bob").unwrap();
        let view = profile(&mut store, 1, "bob").unwrap();
        assert_eq!(
            serde_json::to_string(&view).unwrap(),
            r#"{"user_name":"bob","bio":"","image":"","following":true}"#
        );
    }

    #[test]
    fn profile_renders_bio_and_image() {
        let mut store = social_store();
        store.edit(|state| {
            let bob = &mut state.users.get_mut(&2).unwrap().profile;
            bob.bio = Some("builder".into());
            bob.image = Some("https://img/bob.png".into());
        });
        let view = profile(&mut store, 1, "bob").unwrap();
        assert_eq!(view.bio, "builder");
        assert_eq!(view.image, "https://img/bob.png");
    }

    #[test]
    fn favorite_counts_follow_membership() {
        let mut store = social_store();

        let outcome = favorite(&mut store, 3, "a1").unwrap();
        assert_eq!(outcome.favorites_count, 1);
        assert_eq!(outcome.to_string(), "article `a1` added to favorites");

        favorite(&mut store, 4, "a1").unwrap();
        assert_eq!(favorites_count(&store, 10), 2);

        let outcome = unfavorite(&mut store, 3, "a1").unwrap();
        assert_eq!(outcome.favorites_count, 1);
        assert_eq!(outcome.to_string(), "article `a1` removed from favorites");

        let state = store.snapshot();
        assert!(!state.users[&3].favorites.contains(&10));
        assert!(state.users[&4].favorites.contains(&10));
        assert_eq!(state.articles[&10].favorites_count, 1);
    }

    #[test]
    fn duplicate_favorite_leaves_state_unchanged() {
        let mut store = social_store();
        favorite(&mut store, 1, "a1").unwrap();
        let before = store.snapshot();

        let err = favorite(&mut store, 1, "a1").unwrap_err();
        assert!(matches!(err, SocialError::Conflict("article already in favorites")));

        let after = store.snapshot();
        assert_eq!(after.articles[&10], before.articles[&10]);
        assert_eq!(after.users[&1], before.users[&1]);
    }

    #[test]
    fn unfavorite_without_favorite_is_rejected() {
        let mut store = social_store();
        favorite(&mut store, 3, "a1").unwrap();

        let err = unfavorite(&mut store, 1, "a1").unwrap_err();
        assert!(matches!(err, SocialError::Conflict("article not found in favorites")));
        assert_eq!(favorites_count(&store, 10), 1);
    }

    #[test]
    fn favorite_unknown_article_or_user() {
        let mut store = social_store();
        let err = favorite(&mut store, 1, "missing").unwrap_err();
        assert!(matches!(err, SocialError::NotFound("article")));

        let err = favorite(&mut store, 99, "a1").unwrap_err();
        assert!(matches!(err, SocialError::NotFound("user")));
        assert_eq!(favorites_count(&store, 10), 0);
    }

    #[test]
    fn counter_underflow_is_surfaced() {
        let mut store = social_store();
        store.edit(|state| {
            state.users.get_mut(&1).unwrap().favorites.insert(10);
        });

        let err = unfavorite(&mut store, 1, "a1").unwrap_err();
        assert!(matches!(err, SocialError::InvariantViolation(_)));

        let state = store.snapshot();
        assert!(state.users[&1].favorites.contains(&10));
        assert_eq!(state.articles[&10].favorites_count, 0);
    }

    #[test]
    fn failed_counter_write_rolls_back_set_write() {
        let mut store = social_store().failing_on_write(2);

        let err = favorite(&mut store, 1, "a1").unwrap_err();
        assert!(matches!(err, SocialError::Storage(_)));

        let state = store.snapshot();
        assert!(state.users[&1].favorites.is_empty());
        assert_eq!(state.articles[&10].favorites_count, 0);
    }

    #[test]
    fn expired_deadline_applies_nothing() {
        let mut store = social_store().with_timeout(Duration::ZERO);

        assert!(matches!(
            follow(&mut store, 1, "bob").unwrap_err(),
            SocialError::Timeout
        ));
        assert!(matches!(
            favorite(&mut store, 1, "a1").unwrap_err(),
            SocialError::Timeout
        ));

        let state = store.snapshot();
        assert!(state.users[&1].following.is_empty());
        assert!(state.users[&1].favorites.is_empty());
        assert_eq!(state.articles[&10].favorites_count, 0);
    }

    #[test]
    fn writes_need_a_locked_record() {
        let mut store = social_store();

        let err = store
            .transaction(|tx| {
                let mut user = tx.load_user(1)?.ok_or(SocialError::NotFound("user"))?;
                user.following.insert(2);
                tx.persist_following(user.id(), &user.following)
            })
            .unwrap_err();
        assert!(matches!(err, SocialError::Storage(_)));

        let err = store
            .transaction(|tx| tx.persist_favorites_count(10, 1))
            .unwrap_err();
        assert!(matches!(err, SocialError::Storage(_)));

        store
            .transaction(|tx| {
                let mut user = tx.lock_user(1)?.ok_or(SocialError::NotFound("user"))?;
                user.following.insert(2);
                tx.persist_following(user.id(), &user.following)
            })
            .unwrap();
        assert_eq!(following_of(&store, 1), vec![2]);
        assert_eq!(favorites_count(&store, 10), 0);
    }

    #[test]
    fn concurrent_follows_from_one_follower_all_land() {
        let store = MemoryStore::new();
        store.add_user(1, "hub");
        for id in 2..=17 {
            store.add_user(id, &format!("user{id}"));
        }

        let handles: Vec<_> = (2..=17)
            .map(|id| {
                let mut store = store.clone();
                thread::spawn(move || follow(&mut store, 1, &format!("user{id}")))
            })
            .collect();
        for handle in handles {
            handle.join().unwrap().unwrap();
        }

        let mut following = following_of(&store, 1);
        following.sort();
        assert_eq!(following, (2..=17).collect::<Vec<_>>());
    }

    #[test]
    fn concurrent_favorites_of_one_article_all_count() {
        let store = MemoryStore::new();
        store.add_user(1, "author");
        store.add_article(10, "hot");
        for id in 2..=21 {
            store.add_user(id, &format!("reader{id}"));
        }

        let handles: Vec<_> = (2..=21)
            .map(|id| {
                let mut store = store.clone();
                thread::spawn(move || favorite(&mut store, id, "hot"))
            })
            .collect();
        for handle in handles {
            handle.join().unwrap().unwrap();
        }

        let state = store.snapshot();
        assert_eq!(state.articles[&10].favorites_count, 20);
        assert_eq!(state.favorited_by(10), 20);
    }

    const SLUGS: [&str; 3] = ["p0", "p1", "p2"];

    fn property_store() -> MemoryStore {
        let store = MemoryStore::new();
        for id in 1..=4 {
            store.add_user(id, &format!("u{id}"));
        }
        for (offset, slug) in SLUGS.iter().enumerate() {
            store.add_article(100 + offset as i32, slug);
        }
        store
    }

    proptest! {
        #[test]
        fn favorites_count_matches_membership(
            ops in proptest::collection::vec((1..=4i32, 0..SLUGS.len(), any::<bool>()), 0..64)
        ) {
            let mut store = property_store();
            for (user, article, add) in ops {
                let action = if add { Action::Add } else { Action::Remove };
                match set_favorite(&mut store, user, SLUGS[article], action) {
                    Ok(_) | Err(SocialError::Conflict(_)) => {}
                    Err(other) => prop_assert!(false, "unexpected error: {}", other),
                }
            }

            let state = store.snapshot();
            for article in state.articles.values() {
                prop_assert!(article.favorites_count >= 0);
                prop_assert_eq!(article.favorites_count as usize, state.favorited_by(article.id));
            }
        }

        #[test]
        fn following_never_holds_duplicates_or_self(
            ops in proptest::collection::vec((1..=4i32, 1..=4i32, any::<bool>()), 0..64)
        ) {
            let mut store = property_store();
            for (follower, followee, add) in ops {
                let action = if add { Action::Add } else { Action::Remove };
                let result = set_following(&mut store, follower, &format!("u{followee}"), action);
                if follower == followee {
                    prop_assert!(matches!(result, Err(SocialError::Conflict(_))));
                }
            }

            for user in store.snapshot().users.values() {
                prop_assert!(!user.following.contains(&user.id()));
            }
        }
    }
}
