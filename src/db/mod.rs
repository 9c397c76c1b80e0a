use std::env;
use std::time::Duration;

use diesel::pg::PgConnection;
use diesel::r2d2::{self, ConnectionManager};
use dotenv::dotenv;
use rocket::tokio::task;

use crate::social::SocialError;
use crate::types::ApiError;

pub mod schema;
mod store;

pub use self::store::PgStore;

pub mod error {
    use error_chain::error_chain;

    error_chain! {
        foreign_links {
            Var(::std::env::VarError);
            R2D2(::diesel::r2d2::PoolError);
        }
    }
}

// An alias to the type for a pool of Diesel Postgres connections.
pub type Pool = r2d2::Pool<ConnectionManager<PgConnection>>;

pub fn init_pool(max_size: u32, timeout: Duration) -> error::Result<Pool> {
    dotenv().ok();
    let database_url = env::var("DATABASE_URL")?;
    let manager = ConnectionManager::<PgConnection>::new(database_url);
    let pool = Pool::builder()
        .max_size(max_size)
        .connection_timeout(timeout)
        .build(manager)?;
    Ok(pool)
}

/// Managed handle to the connection pool.
///
/// Diesel is blocking, so every use of a connection is moved onto the
/// blocking thread pool. `timeout` bounds both the wait for a pooled
/// connection and each social-graph transaction.
pub struct Db {
    pool: Pool,
    timeout: Duration,
}

impl Db {
    pub fn new(pool: Pool, timeout: Duration) -> Self {
        Db { pool, timeout }
    }

    pub async fn run<T, F>(&self, f: F) -> Result<T, ApiError>
    where
        F: FnOnce(&mut PgConnection) -> Result<T, ApiError> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();
        let timeout = self.timeout;
        task::spawn_blocking(move || {
            let mut connection = pool
                .get_timeout(timeout)
                .map_err(|_| ApiError::from(SocialError::Timeout))?;
            f(&mut *connection)
        })
        .await
        .map_err(|_| ApiError::Internal)?
    }

    /// Run an engine call against a [`PgStore`] bound to a pooled connection.
    pub async fn social<T, F>(&self, f: F) -> Result<T, ApiError>
    where
        F: FnOnce(&mut PgStore<'_>) -> Result<T, SocialError> + Send + 'static,
        T: Send + 'static,
    {
        let timeout = self.timeout;
        self.run(move |connection| {
            let mut store = PgStore::new(connection, timeout);
            f(&mut store).map_err(ApiError::from)
        })
        .await
    }
}
