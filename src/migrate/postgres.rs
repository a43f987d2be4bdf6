//! PostgreSQL migration driver.
//!
//! Uses one dedicated `PgConnection` outside the provider pool so advisory
//! locks and session settings stay on a single backend.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::{Connection, PgConnection};

use crate::config::{RelationalConfig, is_valid_identifier};
use crate::migrate::{MigrationDriver, MigrationError, MigrationSettings, MigrationVersion};
use crate::storage::db::connect_options;
use crate::storage::{Context, StorageError};

/// Interval between `pg_try_advisory_lock` attempts.
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Migration driver for PostgreSQL and TimescaleDB.
pub struct PostgresDriver {
    conn: PgConnection,
    settings: MigrationSettings,
    lock_key: String,
    locked: bool,
}

impl std::fmt::Debug for PostgresDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresDriver")
            .field("table", &self.settings.table_name)
            .field("locked", &self.locked)
            .finish_non_exhaustive()
    }
}

impl PostgresDriver {
    /// Open a dedicated connection and apply session settings.
    pub async fn open(
        ctx: &Context,
        config: &RelationalConfig,
        settings: MigrationSettings,
    ) -> Result<Self, StorageError> {
        if !is_valid_identifier(&settings.table_name) {
            return Err(StorageError::InvalidIdentifier(settings.table_name));
        }

        let options = connect_options(config);
        let ctx = ctx.or_timeout(config.connect_timeout);
        let mut conn = ctx.run(PgConnection::connect_with(&options)).await?;

        if let Some(timeout) = settings.statement_timeout {
            let millis = timeout.as_millis().to_string();
            ctx.run(
                sqlx::query("SELECT set_config('statement_timeout', $1, false)")
                    .bind(millis)
                    .execute(&mut conn),
            )
            .await?;
        }

        let lock_key = format!("{}:{}", config.database, settings.table_name);
        Ok(Self {
            conn,
            settings,
            lock_key,
            locked: false,
        })
    }

    fn table(&self) -> &str {
        &self.settings.table_name
    }
}

/// Replace the single version row. Both values are integers or booleans, so
/// they are inlined.
fn write_version_sql(table: &str, version: Option<i64>, dirty: bool) -> String {
    let mut sql = format!("BEGIN; TRUNCATE {table};");
    if let Some(version) = version {
        sql.push_str(&format!(
            " INSERT INTO {table} (version, dirty) VALUES ({version}, {dirty});"
        ));
    }
    sql.push_str(" COMMIT;");
    sql
}

#[async_trait]
impl MigrationDriver for PostgresDriver {
    async fn ensure_version_table(&mut self, ctx: &Context) -> Result<(), StorageError> {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (version BIGINT NOT NULL PRIMARY KEY, dirty BOOLEAN NOT NULL)",
            self.table()
        );
        ctx.run(sqlx::query(&sql).execute(&mut self.conn)).await?;
        Ok(())
    }

    async fn lock(&mut self, ctx: &Context) -> Result<(), StorageError> {
        if self.locked {
            return Ok(());
        }
        let ctx = ctx.with_timeout(self.settings.lock_timeout);
        loop {
            let acquired: bool = match ctx
                .run(
                    sqlx::query_scalar::<_, bool>("SELECT pg_try_advisory_lock(hashtext($1))")
                        .bind(&self.lock_key)
                        .fetch_one(&mut self.conn),
                )
                .await
            {
                Ok(acquired) => acquired,
                Err(StorageError::Timeout) => {
                    return Err(MigrationError::Lock(format!(
                        "timed out after {:?}",
                        self.settings.lock_timeout
                    ))
                    .into());
                }
                Err(e) => return Err(e),
            };
            if acquired {
                self.locked = true;
                tracing::debug!(key = %self.lock_key, "Migration lock acquired");
                return Ok(());
            }
            match ctx.run(async {
                tokio::time::sleep(LOCK_POLL_INTERVAL).await;
                Ok::<_, StorageError>(())
            })
            .await
            {
                Ok(()) => {}
                Err(StorageError::Timeout) => {
                    return Err(MigrationError::Lock(format!(
                        "timed out after {:?}",
                        self.settings.lock_timeout
                    ))
                    .into());
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn unlock(&mut self, ctx: &Context) -> Result<(), StorageError> {
        if !self.locked {
            return Ok(());
        }
        ctx.run(
            sqlx::query("SELECT pg_advisory_unlock(hashtext($1))")
                .bind(&self.lock_key)
                .execute(&mut self.conn),
        )
        .await?;
        self.locked = false;
        Ok(())
    }

    async fn read_version(&mut self, ctx: &Context) -> Result<MigrationVersion, StorageError> {
        let sql = format!("SELECT version, dirty FROM {} LIMIT 1", self.table());
        let row: Option<(i64, bool)> = ctx
            .run(sqlx::query_as(&sql).fetch_optional(&mut self.conn))
            .await?;
        match row {
            None => Ok(MigrationVersion::clean(None)),
            Some((version, dirty)) => {
                let version = u64::try_from(version).map_err(|_| {
                    MigrationError::Driver(format!("negative version {version} in {}", self.table()))
                })?;
                Ok(MigrationVersion {
                    version: Some(version),
                    dirty,
                })
            }
        }
    }

    async fn write_version(
        &mut self,
        ctx: &Context,
        version: MigrationVersion,
    ) -> Result<(), StorageError> {
        let stored = version
            .version
            .map(i64::try_from)
            .transpose()
            .map_err(|_| MigrationError::Driver(format!("version {version} out of range")))?;
        let sql = write_version_sql(self.table(), stored, version.dirty);

        ctx.run(sqlx::Executor::execute(&mut self.conn, sqlx::raw_sql(&sql)))
            .await?;
        Ok(())
    }

    async fn execute(&mut self, ctx: &Context, body: &str) -> Result<(), StorageError> {
        ctx.run(sqlx::Executor::execute(&mut self.conn, sqlx::raw_sql(body)))
            .await?;
        Ok(())
    }

    async fn close(mut self: Box<Self>) -> Result<(), StorageError> {
        if self.locked {
            let ctx = Context::background().with_timeout(self.settings.lock_timeout);
            if let Err(e) = self.unlock(&ctx).await {
                tracing::warn!(error = %e, key = %self.lock_key, "Failed to release migration lock");
            }
        }
        self.conn.close().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_version_sql() {
        assert_eq!(
            write_version_sql("schema_migrations", Some(3), true),
            "BEGIN; TRUNCATE schema_migrations; \
             INSERT INTO schema_migrations (version, dirty) VALUES (3, true); COMMIT;"
        );
        assert_eq!(
            write_version_sql("schema_migrations", None, false),
            "BEGIN; TRUNCATE schema_migrations; COMMIT;"
        );
    }
}
