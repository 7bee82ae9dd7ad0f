//! Database layer for Scholarbot
//!
//! Provides:
//! - SeaORM entity model for the QA audit log
//! - Repository implementing the log store
//! - Connection pool management and embedded migrations

pub mod models;
mod repository;

pub use repository::{Feedback, NewQaLog, QaLogStore, Repository};

use crate::config::DatabaseConfig;
use crate::errors::{AppError, Result};
use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseConnection};
use std::time::Duration;
use tracing::info;

/// Database connection pool wrapper
#[derive(Clone)]
pub struct DbPool {
    connection: DatabaseConnection,
}

impl DbPool {
    /// Create a new database pool from configuration
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        info!("Connecting to log database...");

        let mut opts = ConnectOptions::new(&config.url);
        opts.max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Duration::from_secs(config.idle_timeout_secs))
            .sqlx_logging(false);

        let connection = Database::connect(opts)
            .await
            .map_err(|e| AppError::DatabaseConnection {
                message: format!("Failed to connect: {}", e),
            })?;

        info!("Database connection established");

        Ok(Self { connection })
    }

    /// Apply the embedded migrations (creates `qa_logs`)
    pub async fn run_migrations(&self) -> Result<()> {
        let pool = self.connection.get_postgres_connection_pool();
        sqlx::migrate!("./migrations").run(pool).await?;
        info!("Database migrations applied");
        Ok(())
    }

    /// Get the connection
    pub fn connection(&self) -> &DatabaseConnection {
        &self.connection
    }

    /// Ping the database to check connectivity
    pub async fn ping(&self) -> Result<()> {
        self.connection
            .execute_unprepared("SELECT 1")
            .await
            .map_err(|e| AppError::DatabaseConnection {
                message: format!("Ping failed: {}", e),
            })?;

        Ok(())
    }
}
