//! In-process store used by the engine tests.
//!
//! A transaction works on a private copy of the whole state while holding the
//! store mutex, and swaps the copy in only when the closure succeeds.
//!
//! The mutex serializes transactions, so it would hide a transition that
//! writes a record it only read. Each transaction therefore tracks the
//! records it loaded through `lock_*`, and a write to anything else fails
//! the same way a lost update would on a row-locking database.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use indexmap::IndexSet;

use super::store::{
    ArticleId, ArticleRecord, ProfileRecord, Store, Transaction, UserId, UserRecord,
};
use super::SocialError;

#[derive(Debug, Clone, Default)]
pub struct MemoryState {
    pub users: BTreeMap<UserId, UserRecord>,
    pub articles: BTreeMap<ArticleId, ArticleRecord>,
}

impl MemoryState {
    /// Number of users whose favorites contain `article`.
    pub fn favorited_by(&self, article: ArticleId) -> usize {
        self.users
            .values()
            .filter(|user| user.favorites.contains(&article))
            .count()
    }
}

#[derive(Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
    timeout: Duration,
    fail_on_write: Option<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore {
            state: Arc::new(Mutex::new(MemoryState::default())),
            timeout: Duration::from_secs(5),
            fail_on_write: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Make the `n`th write (1-based) of every transaction fail.
    pub fn failing_on_write(mut self, n: usize) -> Self {
        self.fail_on_write = Some(n);
        self
    }

    pub fn add_user(&self, id: UserId, username: &str) {
        let record = UserRecord {
            profile: ProfileRecord {
                id,
                username: username.to_string(),
                bio: None,
                image: None,
            },
            following: IndexSet::new(),
            favorites: IndexSet::new(),
        };
        self.state.lock().unwrap().users.insert(id, record);
    }

    pub fn add_article(&self, id: ArticleId, slug: &str) {
        let record = ArticleRecord {
            id,
            slug: slug.to_string(),
            favorites_count: 0,
        };
        self.state.lock().unwrap().articles.insert(id, record);
    }

    pub fn edit<F: FnOnce(&mut MemoryState)>(&self, f: F) {
        f(&mut self.state.lock().unwrap())
    }

    pub fn snapshot(&self) -> MemoryState {
        self.state.lock().unwrap().clone()
    }
}

impl Store for MemoryStore {
    fn transaction<T, F>(&mut self, f: F) -> Result<T, SocialError>
    where
        F: FnOnce(&mut dyn Transaction) -> Result<T, SocialError>,
    {
        let mut guard = self
            .state
            .lock()
            .map_err(|_| SocialError::storage("memory store poisoned"))?;
        let mut tx = MemoryTransaction {
            state: guard.clone(),
            deadline: Instant::now() + self.timeout,
            writes: 0,
            fail_on_write: self.fail_on_write,
            locked_users: HashSet::new(),
            locked_articles: HashSet::new(),
        };
        let value = f(&mut tx)?;
        *guard = tx.state;
        Ok(value)
    }
}

struct MemoryTransaction {
    state: MemoryState,
    deadline: Instant,
    writes: usize,
    fail_on_write: Option<usize>,
    locked_users: HashSet<UserId>,
    locked_articles: HashSet<ArticleId>,
}

impl MemoryTransaction {
    fn check_deadline(&self) -> Result<(), SocialError> {
        if Instant::now() >= self.deadline {
            Err(SocialError::Timeout)
        } else {
            Ok(())
        }
    }

    fn begin_write(&mut self) -> Result<(), SocialError> {
        self.check_deadline()?;
        self.writes += 1;
        if self.fail_on_write == Some(self.writes) {
            return Err(SocialError::storage("injected write failure"));
        }
        Ok(())
    }

    fn user_mut(&mut self, id: UserId) -> Result<&mut UserRecord, SocialError> {
        if !self.locked_users.contains(&id) {
            return Err(SocialError::storage(format!("user {id} written without lock")));
        }
        self.state
            .users
            .get_mut(&id)
            .ok_or(SocialError::NotFound("user"))
    }
}

impl Transaction for MemoryTransaction {
    fn find_profile(&mut self, username: &str) -> Result<Option<ProfileRecord>, SocialError> {
        self.check_deadline()?;
        Ok(self
            .state
            .users
            .values()
            .find(|user| user.profile.username == username)
            .map(|user| user.profile.clone()))
    }

    fn load_user(&mut self, id: UserId) -> Result<Option<UserRecord>, SocialError> {
        self.check_deadline()?;
        Ok(self.state.users.get(&id).cloned())
    }

    fn lock_user(&mut self, id: UserId) -> Result<Option<UserRecord>, SocialError> {
        let user = self.load_user(id)?;
        if user.is_some() {
            self.locked_users.insert(id);
        }
        Ok(user)
    }

    fn lock_article(&mut self, slug: &str) -> Result<Option<ArticleRecord>, SocialError> {
        self.check_deadline()?;
        let article = self
            .state
            .articles
            .values()
            .find(|article| article.slug == slug)
            .cloned();
        if let Some(article) = &article {
            self.locked_articles.insert(article.id);
        }
        Ok(article)
    }

    fn persist_following(
        &mut self,
        user: UserId,
        following: &IndexSet<UserId>,
    ) -> Result<(), SocialError> {
        self.begin_write()?;
        self.user_mut(user)?.following = following.clone();
        Ok(())
    }

    fn persist_favorites(
        &mut self,
        user: UserId,
        favorites: &IndexSet<ArticleId>,
    ) -> Result<(), SocialError> {
        self.begin_write()?;
        self.user_mut(user)?.favorites = favorites.clone();
        Ok(())
    }

    fn persist_favorites_count(
        &mut self,
        article: ArticleId,
        count: i32,
    ) -> Result<(), SocialError> {
        self.begin_write()?;
        if !self.locked_articles.contains(&article) {
            return Err(SocialError::storage(format!(
                "article {article} written without lock"
            )));
        }
        let record = self
            .state
            .articles
            .get_mut(&article)
            .ok_or(SocialError::NotFound("article"))?;
        record.favorites_count = count;
        Ok(())
    }
}
