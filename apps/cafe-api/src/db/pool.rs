use diesel_async::pooled_connection::deadpool::Pool;
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::AsyncPgConnection;

use crate::error::RepoError;

pub type DbPool = Pool<AsyncPgConnection>;

const MAX_POOL_SIZE: usize = 20;

/// Create a Diesel async connection pool.
pub fn connect(database_url: &str) -> Result<DbPool, RepoError> {
    let manager = AsyncDieselConnectionManager::<AsyncPgConnection>::new(database_url);
    let pool = Pool::builder(manager)
        .max_size(MAX_POOL_SIZE)
        .build()
        .map_err(|e| RepoError::Pool(e.to_string()))?;

    tracing::info!(max_size = MAX_POOL_SIZE, "database pool created");

    Ok(pool)
}
