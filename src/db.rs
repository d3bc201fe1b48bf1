use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use crate::error::Result;

/// Schema alias the text database is attached under.
pub const TEXT_SCHEMA: &str = "text_store";

/// Main database file inside the data directory.
pub const EMBEDDINGS_DB: &str = "embeddings.db";

/// Text database file inside the data directory.
pub const TEXT_DB: &str = "text.db";

/// One `ATTACH DATABASE ? AS <alias>` to run on every pooled connection.
#[derive(Debug, Clone)]
struct Attachment {
    alias: String,
    path: PathBuf,
}

/// Open (creating if missing) the embeddings database in `data_dir` and
/// attach the text database plus any auxiliary databases on every pooled
/// connection.
///
/// Attached schemas are per-connection state in SQLite, so the attaches run
/// in the pool's `after_connect` hook rather than once up front.
pub async fn connect(
    data_dir: &Path,
    store_text: bool,
    aux: impl IntoIterator<Item = (String, PathBuf)>,
) -> Result<SqlitePool> {
    std::fs::create_dir_all(data_dir)?;

    let db_path = data_dir.join(EMBEDDINGS_DB);
    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

    let mut attachments: Vec<Attachment> = Vec::new();
    if store_text {
        attachments.push(Attachment {
            alias: TEXT_SCHEMA.to_string(),
            path: data_dir.join(TEXT_DB),
        });
    }
    for (alias, path) in aux {
        attachments.push(Attachment { alias, path });
    }
    let attachments = Arc::new(attachments);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .after_connect(move |conn, _meta| {
            let attachments = Arc::clone(&attachments);
            Box::pin(async move {
                for att in attachments.iter() {
                    // The alias cannot be bound; it is validated at config
                    // time to [A-Za-z0-9_].
                    let sql = format!("ATTACH DATABASE ?1 AS {}", att.alias);
                    sqlx::query(&sql)
                        .bind(att.path.display().to_string())
                        .execute(&mut *conn)
                        .await?;
                }
                Ok(())
            })
        })
        .connect_with(options)
        .await?;

    Ok(pool)
}
