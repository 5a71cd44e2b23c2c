//! Chatter roster persistence: the database the orchestrator's 15-minute
//! flush submits `ActiveChatters` batches to.
//!
//! `config.database.replset` is carried through the config struct because
//! the JSON shape is fixed by the external contract, but it has no meaning
//! for a Postgres connection and is unused here — see DESIGN.md.

use std::ops::DerefMut;

use deadpool_postgres::{Manager, ManagerConfig, RecyclingMethod};
use tokio_postgres::NoTls;

use crate::config::DatabaseConfig;
use crate::event::ChattersBatch;

pub type PgPool = deadpool_postgres::Pool;

#[derive(thiserror::Error, Debug)]
pub enum StorageError {
    #[error("database pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),
    #[error("database query error: {0}")]
    Query(#[from] tokio_postgres::Error),
    #[error("failed to build connection pool: {0}")]
    Build(#[from] deadpool_postgres::BuildError),
    #[error("migration error: {0}")]
    Migration(#[from] refinery::Error),
}

mod migrations {
    refinery::embed_migrations!("migrations");
}

/// Any persistence service the orchestrator's chatter-flush task can submit
/// a batch to. Exists as a trait so the orchestrator is testable without a
/// real Postgres instance.
#[async_trait::async_trait]
pub trait ChattersSink: Send + Sync {
    async fn flush_chatters(&self, batches: &[ChattersBatch]) -> Result<(), StorageError>;
}

pub fn build_pool(config: &DatabaseConfig) -> Result<PgPool, StorageError> {
    let mut pg_config = tokio_postgres::Config::new();
    if let Some(first) = config.urls.first() {
        match first.split_once(':') {
            Some((host, port)) => {
                pg_config.host(host);
                if let Ok(port) = port.parse::<u16>() {
                    pg_config.port(port);
                }
            }
            None => {
                pg_config.host(first);
            }
        }
    }
    pg_config.dbname(&config.db_name);

    let manager_config = ManagerConfig {
        recycling_method: RecyclingMethod::Fast,
    };
    let manager = Manager::from_config(pg_config, NoTls, manager_config);
    // Sized off the CPU count rather than a fixed guess.
    PgPool::builder(manager)
        .max_size(num_cpus::get() * 4)
        .build()
        .map_err(StorageError::from)
}

pub struct ChatterStore {
    pool: PgPool,
}

impl ChatterStore {
    pub fn new(pool: PgPool) -> Self {
        ChatterStore { pool }
    }

    pub async fn run_migrations(&self) -> Result<(), StorageError> {
        let mut conn = self.pool.get().await?;
        migrations::migrations::runner()
            .run_async(conn.as_mut().deref_mut())
            .await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl ChattersSink for ChatterStore {
    async fn flush_chatters(&self, batches: &[ChattersBatch]) -> Result<(), StorageError> {
        let mut conn = self.pool.get().await?;
        let tx = conn.transaction().await?;

        for batch in batches {
            tx.execute(
                "INSERT INTO channel (platform_id, login, display) VALUES ($1, $2, $3)
                 ON CONFLICT (platform_id) DO UPDATE
                     SET login = EXCLUDED.login, display = EXCLUDED.display",
                &[&batch.channel.platform_id, &batch.channel.login, &batch.channel.display],
            )
            .await?;

            for chatter in batch.chatters() {
                tx.execute(
                    "INSERT INTO chatter (channel_platform_id, platform_id, login, display, last_seen)
                     VALUES ($1, $2, $3, $4, now())
                     ON CONFLICT (channel_platform_id, platform_id) DO UPDATE
                         SET last_seen = now(), login = EXCLUDED.login, display = EXCLUDED.display",
                    &[
                        &batch.channel.platform_id,
                        &chatter.platform_id,
                        &chatter.login,
                        &chatter.display,
                    ],
                )
                .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn dump_migrations() {
        // Smoke-checks that the embedded migration set parses, without
        // needing a live database.
        let runner = migrations::migrations::runner();
        assert!(!runner.get_migrations().is_empty());
    }
}
