//! Storage contract the social-graph engine is written against.
//!
//! A [`Store`] hands out one [`Transaction`] per engine call. Everything read
//! or written through the transaction commits together or not at all, and
//! records loaded through the `lock_*` methods stay locked against concurrent
//! writers until the transaction ends.

use indexmap::IndexSet;

use super::SocialError;

pub type UserId = i32;
pub type ArticleId = i32;

/// Display fields of a user, as resolved by username.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileRecord {
    pub id: UserId,
    pub username: String,
    pub bio: Option<String>,
    pub image: Option<String>,
}

/// A user together with the membership sets the engine maintains.
///
/// Both sets keep insertion order; removal is stable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub profile: ProfileRecord,
    pub following: IndexSet<UserId>,
    pub favorites: IndexSet<ArticleId>,
}

impl UserRecord {
    pub fn id(&self) -> UserId {
        self.profile.id
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArticleRecord {
    pub id: ArticleId,
    pub slug: String,
    pub favorites_count: i32,
}

pub trait Transaction {
    /// Find a user by username without locking.
    fn find_profile(&mut self, username: &str) -> Result<Option<ProfileRecord>, SocialError>;

    /// Load a user and both membership sets without locking.
    fn load_user(&mut self, id: UserId) -> Result<Option<UserRecord>, SocialError>;

    /// Load a user and both membership sets, holding a write lock on the user
    /// until the transaction ends.
    fn lock_user(&mut self, id: UserId) -> Result<Option<UserRecord>, SocialError>;

    /// Find an article by slug, holding a write lock on it until the
    /// transaction ends.
    fn lock_article(&mut self, slug: &str) -> Result<Option<ArticleRecord>, SocialError>;

    /// Replace the user's `following` set. The user must be locked.
    fn persist_following(
        &mut self,
        user: UserId,
        following: &IndexSet<UserId>,
    ) -> Result<(), SocialError>;

    /// Replace the user's `favorites` set. The user must be locked.
    fn persist_favorites(
        &mut self,
        user: UserId,
        favorites: &IndexSet<ArticleId>,
    ) -> Result<(), SocialError>;

    /// The article must be locked.
    fn persist_favorites_count(
        &mut self,
        article: ArticleId,
        count: i32,
    ) -> Result<(), SocialError>;
}

pub trait Store {
    /// Run `f` in a single atomic unit. An `Err` from `f`, or from the store
    /// itself, rolls back every write made through the transaction.
    fn transaction<T, F>(&mut self, f: F) -> Result<T, SocialError>
    where
        F: FnOnce(&mut dyn Transaction) -> Result<T, SocialError>;
}
