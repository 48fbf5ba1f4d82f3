use crate::entities::{archives, file_chunks, stored_files};
use sea_orm::{ConnectOptions, Database, DatabaseConnection};
use sea_orm::{ConnectionTrait, Schema};
use std::env;
use std::time::Duration;
use tracing::info;

pub async fn setup_database() -> anyhow::Result<DatabaseConnection> {
    let db_url = env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;

    info!("📂 Database: {}", db_url);

    let mut opt = ConnectOptions::new(&db_url);
    opt.max_connections(50)
        .min_connections(2)
        .connect_timeout(Duration::from_secs(30))
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .sqlx_logging(true)
        .sqlx_logging_level(log::LevelFilter::Debug);

    let db = Database::connect(opt).await?;

    info!("✅ Database connected successfully");

    run_migrations(&db).await?;

    Ok(db)
}

pub async fn run_migrations(db: &DatabaseConnection) -> anyhow::Result<()> {
    let builder = db.get_database_backend();
    let schema = Schema::new(builder);

    info!("🔄 Running auto-migrations...");

    // Order matters for foreign keys: StoredFiles -> FileChunks
    let stmts = vec![
        (
            "stored_files",
            schema
                .create_table_from_entity(stored_files::Entity)
                .if_not_exists()
                .to_owned(),
        ),
        (
            "file_chunks",
            schema
                .create_table_from_entity(file_chunks::Entity)
                .if_not_exists()
                .to_owned(),
        ),
        (
            "archives",
            schema
                .create_table_from_entity(archives::Entity)
                .if_not_exists()
                .to_owned(),
        ),
    ];

    for (name, stmt) in stmts {
        let stmt = builder.build(&stmt);
        match db.execute(stmt).await {
            Ok(_) => info!("   - Table '{}' checked/created", name),
            Err(e) => {
                tracing::error!("   - Failed to create table '{}': {}", name, e);
                return Err(e.into());
            }
        }
    }

    let indexes = [
        "CREATE INDEX IF NOT EXISTS idx_stored_files_shoot_id ON stored_files(shoot_id)",
        "CREATE INDEX IF NOT EXISTS idx_file_chunks_expires_at ON file_chunks(expires_at)",
        "CREATE INDEX IF NOT EXISTS idx_archives_status_expires_at ON archives(status, expires_at)",
        "CREATE INDEX IF NOT EXISTS idx_archives_shoot_id ON archives(shoot_id)",
    ];

    for query in indexes {
        match db
            .execute(sea_orm::Statement::from_string(builder, query.to_owned()))
            .await
        {
            Ok(_) => info!("   - Executed schema update: {}", query),
            Err(e) => tracing::warn!("   - Schema update warning: {} -> {}", query, e),
        }
    }

    Ok(())
}
