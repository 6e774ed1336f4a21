use crate::{
    error::ExecutorError,
    identity::{FileStat, IdentityRecord, IdentityStore, LogicalFileId},
    paths::{os_path_to_string, string_to_os_path},
};
use async_trait::async_trait;
use futures::future::BoxFuture;
use sqlx::{
    error::BoxDynError,
    migrate::{MigrateDatabase, Migration as SqlxMigration, MigrationSource, MigrationType, Migrator},
    sqlite::{Sqlite, SqliteConnectOptions},
    ConnectOptions, Pool, Row,
};
use std::{
    path::{Path, PathBuf},
    result::Result,
    str::FromStr,
};
use walkdir::WalkDir;

/// Default file name of the identity store, relative to the served root.
pub const FILE_ID_DB: &str = ".file_id.db";

type RecordRow = (String, String, i64, i64);

fn to_record((id, path, mtime, ino): RecordRow) -> IdentityRecord {
    IdentityRecord {
        id: LogicalFileId::new(id),
        path: string_to_os_path(&path),
        mtime,
        ino: ino as u64,
    }
}

/// SQLite-backed [`IdentityStore`].
///
/// Paths are stored absolute and `/`-separated. The inode column lets [`IdentityStore::get_path`]
/// find a file again after it was renamed without the store being told.
#[derive(Clone, Debug)]
pub struct FileIdStore {
    pool: Pool<Sqlite>,
    root_dir: PathBuf,
}

impl FileIdStore {
    pub async fn open(db_path: PathBuf, root_dir: PathBuf) -> Result<Self, ExecutorError> {
        let pool = db_init(db_path).await?;
        Ok(FileIdStore { pool, root_dir })
    }

    pub async fn record_by_path(&self, path: &Path) -> Result<Option<IdentityRecord>, ExecutorError> {
        let row = sqlx::query_as::<_, RecordRow>(
            "SELECT id, path, mtime, ino FROM files WHERE path = ?",
        )
        .bind(os_path_to_string(path))
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(to_record))
    }

    pub async fn record_by_id(
        &self,
        id: &LogicalFileId,
    ) -> Result<Option<IdentityRecord>, ExecutorError> {
        let row = sqlx::query_as::<_, RecordRow>(
            "SELECT id, path, mtime, ino FROM files WHERE id = ?",
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(to_record))
    }

    async fn record_by_ino(&self, ino: u64) -> Result<Option<IdentityRecord>, ExecutorError> {
        let row = sqlx::query_as::<_, RecordRow>(
            "SELECT id, path, mtime, ino FROM files WHERE ino = ?",
        )
        .bind(ino as i64)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(to_record))
    }

    /// Point the record `id` at `path`, evicting whatever record held `path` before.
    async fn repoint(
        &self,
        id: &LogicalFileId,
        path: &Path,
        stat: &FileStat,
    ) -> Result<(), ExecutorError> {
        let path_str = os_path_to_string(path);
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM files WHERE path = ? AND id != ?")
            .bind(&path_str)
            .bind(id.as_str())
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE files SET path = ?, mtime = ?, ino = ? WHERE id = ?")
            .bind(&path_str)
            .bind(stat.mtime)
            .bind(stat.ino as i64)
            .bind(id.as_str())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Search the root for the inode a record was last seen with.
    fn find_by_ino(&self, ino: u64) -> Option<(PathBuf, FileStat)> {
        if ino == 0 {
            // No inode support on this platform.
            return None;
        }
        WalkDir::new(&self.root_dir)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.into_path())
            .find_map(|path| {
                let stat = FileStat::of(&path)?;
                (stat.ino == ino).then_some((path, stat))
            })
    }

    pub async fn count(&self) -> Result<u32, ExecutorError> {
        let row = sqlx::query("SELECT COUNT(*) FROM files;")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<u32, usize>(0))
    }
}

#[async_trait]
impl IdentityStore for FileIdStore {
    async fn index(&self, path: &Path) -> Result<Option<LogicalFileId>, ExecutorError> {
        let Some(stat) = FileStat::of(path) else {
            return Ok(None);
        };

        if let Some(record) = self.record_by_path(path).await? {
            if record.ino != stat.ino || record.mtime != stat.mtime {
                self.save(path).await?;
            }
            return Ok(Some(record.id));
        }

        // A record whose file vanished but whose inode lives on at `path` was moved out of band.
        if let Some(record) = self.record_by_ino(stat.ino).await? {
            if stat.ino != 0 && FileStat::of(&record.path).is_none() {
                tracing::debug!(
                    "[FileIdStore] {:?} was moved to {:?}, keeping id {}",
                    record.path,
                    path,
                    record.id
                );
                self.repoint(&record.id, path, &stat).await?;
                return Ok(Some(record.id));
            }
        }

        sqlx::query("INSERT OR IGNORE INTO files (id, path, mtime, ino) VALUES (?, ?, ?, ?)")
            .bind(LogicalFileId::generate().as_str())
            .bind(os_path_to_string(path))
            .bind(stat.mtime)
            .bind(stat.ino as i64)
            .execute(&self.pool)
            .await?;
        Ok(self.record_by_path(path).await?.map(|record| record.id))
    }

    async fn get_id(&self, path: &Path) -> Result<Option<LogicalFileId>, ExecutorError> {
        Ok(self.record_by_path(path).await?.map(|record| record.id))
    }

    async fn get_path(&self, id: &LogicalFileId) -> Result<Option<PathBuf>, ExecutorError> {
        let Some(record) = self.record_by_id(id).await? else {
            return Ok(None);
        };
        if FileStat::of(&record.path).is_some_and(|stat| stat.ino == record.ino) {
            return Ok(Some(record.path));
        }

        let ino = record.ino;
        let this = self.clone();
        let found = tokio::task::spawn_blocking(move || this.find_by_ino(ino)).await?;

        match found {
            Some((path, stat)) => {
                tracing::debug!(
                    "[FileIdStore] re-synced {} from {:?} to {:?}",
                    id,
                    record.path,
                    path
                );
                self.repoint(id, &path, &stat).await?;
                Ok(Some(path))
            }
            None => {
                tracing::debug!("[FileIdStore] {} no longer exists below the root", id);
                Ok(None)
            }
        }
    }

    async fn record(&self, id: &LogicalFileId) -> Result<Option<IdentityRecord>, ExecutorError> {
        self.record_by_id(id).await
    }

    async fn recorded_mtime(&self, path: &Path) -> Result<Option<i64>, ExecutorError> {
        let mtime = sqlx::query_as::<_, (i64,)>("SELECT mtime FROM files WHERE path = ?")
            .bind(os_path_to_string(path))
            .fetch_optional(&self.pool)
            .await?;
        Ok(mtime.map(|(mtime,)| mtime))
    }

    async fn save(&self, path: &Path) -> Result<(), ExecutorError> {
        let Some(stat) = FileStat::of(path) else {
            return Ok(());
        };
        sqlx::query("UPDATE files SET mtime = ?, ino = ? WHERE path = ?")
            .bind(stat.mtime)
            .bind(stat.ino as i64)
            .bind(os_path_to_string(path))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn move_path(&self, old_path: &Path, new_path: &Path) -> Result<(), ExecutorError> {
        let old_str = os_path_to_string(old_path);
        let new_str = os_path_to_string(new_path);
        if old_str == new_str {
            return self.save(new_path).await;
        }
        let stat = FileStat::of(new_path);

        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM files WHERE path = ?")
            .bind(&new_str)
            .execute(&mut *tx)
            .await?;
        let moved = match stat {
            Some(stat) => {
                sqlx::query("UPDATE files SET path = ?, mtime = ?, ino = ? WHERE path = ?")
                    .bind(&new_str)
                    .bind(stat.mtime)
                    .bind(stat.ino as i64)
                    .bind(&old_str)
                    .execute(&mut *tx)
                    .await?
            }
            None => {
                sqlx::query("UPDATE files SET path = ? WHERE path = ?")
                    .bind(&new_str)
                    .bind(&old_str)
                    .execute(&mut *tx)
                    .await?
            }
        };
        // Directory moves carry their children along.
        let children = sqlx::query(
            "UPDATE files SET path = ? || substr(path, length(?) + 1) \
             WHERE substr(path, 1, length(?) + 1) = ? || '/'",
        )
        .bind(&new_str)
        .bind(&old_str)
        .bind(&old_str)
        .bind(&old_str)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        tracing::debug!(
            "[FileIdStore] moved {:?} -> {:?} ({} record(s), {} child record(s))",
            old_path,
            new_path,
            moved.rows_affected(),
            children.rows_affected()
        );

        if moved.rows_affected() == 0 && stat.is_some_and(|stat| !stat.is_dir) {
            // Never tracked: start tracking under the new name.
            self.index(new_path).await?;
        }
        Ok(())
    }
}

/// A migration definition.
#[derive(Debug, Clone)]
pub struct Migration {
    pub version: i64,
    pub description: &'static str,
    pub sql: &'static str,
    pub kind: MigrationType,
}

#[derive(Debug, Clone)]
struct MigrationList(Vec<Migration>);

impl MigrationSource<'static> for MigrationList {
    fn resolve(self) -> BoxFuture<'static, Result<Vec<SqlxMigration>, BoxDynError>> {
        Box::pin(async move {
            let mut migrations = Vec::new();
            for migration in self.0 {
                if matches!(migration.kind, MigrationType::ReversibleUp) {
                    migrations.push(SqlxMigration::new(
                        migration.version,
                        migration.description.into(),
                        migration.kind,
                        migration.sql.into(),
                        false,
                    ));
                }
            }
            Ok(migrations)
        })
    }
}

pub async fn db_init(db_path: PathBuf) -> Result<Pool<Sqlite>, ExecutorError> {
    let fqdb = format!("sqlite:{}", os_path_to_string(&db_path));
    tracing::debug!("Initializing file id db from file: {:?}", fqdb);
    if !Sqlite::database_exists(&fqdb).await.unwrap_or(false) {
        Sqlite::create_database(&fqdb).await?;
    }
    let options = SqliteConnectOptions::from_str(&fqdb)?
        .read_only(false)
        .disable_statement_logging()
        .create_if_missing(true);

    let pool = sqlx::pool::PoolOptions::<Sqlite>::new()
        .connect_with(options)
        .await?;

    let migrations = MigrationList(vec![Migration {
        version: 1,
        description: "create_files_table",
        sql: "\
            CREATE TABLE files (id TEXT PRIMARY KEY NOT NULL, path TEXT NOT NULL UNIQUE, mtime INTEGER NOT NULL, ino INTEGER NOT NULL); \
            CREATE INDEX idx_files_ino ON files(ino);",
        kind: MigrationType::ReversibleUp,
    }]);
    let migrator = Migrator::new(migrations).await?;
    migrator.run(&pool).await?;

    let count_res = sqlx::query("SELECT COUNT(*) FROM files;")
        .fetch_one(&pool)
        .await?;
    tracing::info!(
        "File id DB initialized. Tracked files:\t{:?}",
        count_res.get::<u32, usize>(0)
    );

    Ok(pool)
}
