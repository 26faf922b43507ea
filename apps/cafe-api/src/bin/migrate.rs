//! Embedded migration runner for cafe-api.
//!
//! Usage:
//!   cargo run -p cafe-api --bin cafe-migrate            # apply pending
//!   cargo run -p cafe-api --bin cafe-migrate -- --list  # show pending only
//!
//! Reads DATABASE_URL from the environment (or .env via dotenvy).

use std::path::Path;

use diesel::pg::PgConnection;
use diesel::Connection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("./migrations");

type BoxError = Box<dyn std::error::Error + Send + Sync>;

fn main() -> Result<(), BoxError> {
    if dotenvy::dotenv().is_err() {
        let env_path = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
        let _ = dotenvy::from_path(env_path);
    }

    let database_url =
        std::env::var("DATABASE_URL").map_err(|_| "DATABASE_URL env var is required")?;
    let list_only = std::env::args().any(|arg| arg == "--list");

    let mut conn = PgConnection::establish(&database_url)?;

    if list_only {
        let pending = conn.pending_migrations(MIGRATIONS)?;
        if pending.is_empty() {
            println!("Database is up to date.");
        }
        for migration in &pending {
            println!("  Pending: {}", migration.name());
        }
        return Ok(());
    }

    let applied = conn.run_pending_migrations(MIGRATIONS)?;
    if applied.is_empty() {
        println!("No pending migrations.");
    } else {
        for version in &applied {
            println!("  Applied: {version}");
        }
        println!("{} migration(s) applied.", applied.len());
    }
    Ok(())
}
