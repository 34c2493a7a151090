use std::fs;
use std::path::{Path, PathBuf};

use anyhow::anyhow;
use async_trait::async_trait;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};

const DATABASE_NAME: &str = "codexec.sqlite3";

/// Stored code snippet that can be executed by id
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Template {
    pub code: String,
    pub language: String,
}

#[derive(Debug, thiserror::Error)]
#[error("template store error: {0}")]
pub struct StoreError(#[from] sqlx::Error);

/// Read-only access to stored templates
#[async_trait]
pub trait TemplateStore: Send + Sync {
    async fn find_template(&self, id: i64) -> Result<Option<Template>, StoreError>;
}

/// Template store backed by the application's SQLite database
#[derive(Debug, Clone)]
pub struct SqliteTemplateStore {
    pool: SqlitePool,
}

impl SqliteTemplateStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TemplateStore for SqliteTemplateStore {
    async fn find_template(&self, id: i64) -> Result<Option<Template>, StoreError> {
        log::debug!("Looking up template {id}");

        let template = sqlx::query_as::<_, Template>(
            r#"
            SELECT code, language FROM templates WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(template)
    }
}

pub fn get_db_path() -> anyhow::Result<PathBuf> {
    use directories::ProjectDirs;

    let proj_dirs = ProjectDirs::from("", "", "codexec")
        .ok_or_else(|| anyhow!("Unable to find user directory"))?;
    let data_dir = proj_dirs.data_local_dir();

    fs::create_dir_all(data_dir)?;

    Ok(data_dir.join(DATABASE_NAME))
}

pub async fn init_db(db_path: impl AsRef<Path>) -> sqlx::Result<SqlitePool> {
    let db_url = format!("sqlite://{}?mode=rwc", db_path.as_ref().display()); // rwc = read/write/create
    let db_pool = SqlitePoolOptions::new()
        .max_connections(2)
        .min_connections(0)
        .connect(&db_url)
        .await?;

    // PRAGMA statements cannot run inside a transaction
    for pragma_sql in &[
        "PRAGMA busy_timeout = 2000;",
        "PRAGMA journal_mode = WAL;",
        "PRAGMA synchronous = NORMAL;",
    ] {
        sqlx::query(pragma_sql).execute(&db_pool).await?;
    }

    create_schema(&db_pool).await?;

    log::info!("Initialized database at {}", db_path.as_ref().display());

    Ok(db_pool)
}

/// Opens a private in-memory database with the schema applied
///
/// A single connection is kept so every query sees the same database.
pub async fn init_memory_db() -> sqlx::Result<SqlitePool> {
    let db_pool = SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .connect("sqlite::memory:")
        .await?;

    create_schema(&db_pool).await?;
    Ok(db_pool)
}

async fn create_schema(pool: &SqlitePool) -> sqlx::Result<()> {
    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS templates (
            id            INTEGER PRIMARY KEY AUTOINCREMENT,
            name          TEXT    NOT NULL,
            code          TEXT    NOT NULL,
            language      TEXT    NOT NULL,
            created_time  TEXT    NOT NULL
        );",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Stores a new template and returns its id
pub async fn insert_template(
    pool: &SqlitePool,
    name: &str,
    code: &str,
    language: &str,
) -> sqlx::Result<i64> {
    let result = sqlx::query(
        r#"
        INSERT INTO templates (name, code, language, created_time)
        VALUES (?, ?, ?, ?)
        "#,
    )
    .bind(name)
    .bind(code)
    .bind(language)
    .bind(crate::create_timestamp())
    .execute(pool)
    .await?;

    Ok(result.last_insert_rowid())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_find_inserted_template() {
        let pool = init_memory_db().await.unwrap();
        let id = insert_template(&pool, "hello", "print('hi')", "python")
            .await
            .unwrap();

        let store = SqliteTemplateStore::new(pool);
        let template = store.find_template(id).await.unwrap();
        assert_eq!(
            template,
            Some(Template {
                code: "print('hi')".to_string(),
                language: "python".to_string(),
            })
        );
    }

    #[tokio::test]
    async fn test_missing_template_is_none() {
        let store = SqliteTemplateStore::new(init_memory_db().await.unwrap());
        assert_eq!(store.find_template(42).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_file_database_is_reusable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("templates.sqlite3");

        let pool = init_db(&path).await.unwrap();
        let id = insert_template(&pool, "c", "int main(){}", "c").await.unwrap();
        pool.close().await;

        let store = SqliteTemplateStore::new(init_db(&path).await.unwrap());
        assert_eq!(store.find_template(id).await.unwrap().unwrap().language, "c");
    }
}
