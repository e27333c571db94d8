use tokio_postgres::{Client, NoTls};
use tracing::{info, warn};

use crate::clusters::PostgresCluster;
use crate::error::Result;

/// Trait abstracting PostgreSQL role management so tests can substitute a no-op.
#[async_trait::async_trait]
pub trait PostgresManager: Send + Sync {
    /// Create the login role if it does not exist yet.
    async fn ensure_role(&self, pg: &PostgresCluster, username: &str, password: &str)
        -> Result<()>;

    /// Drop the role and every database it owns.  Absent role is success.
    async fn delete_role(&self, pg: &PostgresCluster, username: &str) -> Result<()>;
}

/// Production implementation backed by tokio-postgres.
pub struct PgPostgresManager;

async fn connect(pg: &PostgresCluster) -> Result<Client> {
    let mut config = tokio_postgres::Config::new();
    config
        .host(&pg.host)
        .port(pg.port)
        .user(&pg.admin_user)
        .password(&pg.admin_password)
        .dbname("postgres");
    let (client, connection) = config.connect(NoTls).await?;
    let cluster = pg.name.clone();
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            warn!(%cluster, "postgres connection error: {e}");
        }
    });
    Ok(client)
}

async fn role_exists(client: &Client, username: &str) -> Result<bool> {
    let row = client
        .query_one(
            "SELECT EXISTS(SELECT 1 FROM pg_roles WHERE rolname = $1)",
            &[&username],
        )
        .await?;
    Ok(row.get(0))
}

#[async_trait::async_trait]
impl PostgresManager for PgPostgresManager {
    async fn ensure_role(
        &self,
        pg: &PostgresCluster,
        username: &str,
        password: &str,
    ) -> Result<()> {
        let client = connect(pg).await?;
        if role_exists(&client, username).await? {
            return Ok(());
        }

        // DDL cannot take bind parameters.
        let stmt = format!(
            "CREATE ROLE {} WITH PASSWORD {} CREATEDB LOGIN",
            quote_ident(username),
            quote_literal(password)
        );
        client.execute(&stmt, &[]).await?;
        info!(%username, cluster = %pg.name, "created postgres role");
        Ok(())
    }

    async fn delete_role(&self, pg: &PostgresCluster, username: &str) -> Result<()> {
        let client = connect(pg).await?;
        if !role_exists(&client, username).await? {
            return Ok(());
        }

        // Drop owned databases first.
        let rows = client
            .query(
                "SELECT d.datname FROM pg_database d JOIN pg_roles r ON d.datdba = r.oid \
                 WHERE r.rolname = $1 AND d.datistemplate = false",
                &[&username],
            )
            .await?;

        for row in &rows {
            let db: String = row.get(0);
            client
                .execute(&format!("DROP DATABASE {}", quote_ident(&db)), &[])
                .await?;
            info!(%db, "dropped database");
        }

        client
            .execute(&format!("DROP ROLE {}", quote_ident(username)), &[])
            .await?;
        info!(%username, cluster = %pg.name, "deleted postgres role");
        Ok(())
    }
}

/// Double-quote an identifier, escaping embedded quotes.
fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Single-quote a string literal, escaping embedded quotes.
fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// No-op implementation for testing.
pub struct NoopPostgresManager;

#[async_trait::async_trait]
impl PostgresManager for NoopPostgresManager {
    async fn ensure_role(&self, _: &PostgresCluster, _: &str, _: &str) -> Result<()> {
        Ok(())
    }
    async fn delete_role(&self, _: &PostgresCluster, _: &str) -> Result<()> {
        Ok(())
    }
}
