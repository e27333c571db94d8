use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use tracing::info;

use super::secrets::secret_value;
use crate::controller::handler::{HandlerOutcome, Lifecycle, Scope};
use crate::controller::helpers::ODOO_USER_SUFFIX;
use crate::error::{Error, Result};
use crate::helpers::child_name;
use crate::platform::ResourceKind;

/// Login role on the instance's PostgreSQL cluster.  Credentials come from
/// the odoo-user secret, which runs earlier in the pipeline.
pub struct PostgresRole {
    scope: Scope,
}

impl PostgresRole {
    pub fn new(scope: Scope) -> Self {
        Self { scope }
    }

    async fn ensure(&self) -> Result<HandlerOutcome> {
        let scope = &self.scope;
        let secret_name = child_name(scope.name(), ODOO_USER_SUFFIX);
        let raw = scope
            .platform
            .read(scope.namespace(), ResourceKind::Secret, &secret_name)
            .await?
            .ok_or_else(|| Error::reconcile(format!("secret {secret_name} does not exist yet")))?;
        let secret: Secret = serde_json::from_value(raw)?;

        let (Some(username), Some(password)) = (
            secret_value(&secret, "username"),
            secret_value(&secret, "password"),
        ) else {
            return Err(Error::reconcile(format!(
                "secret {secret_name} lacks username or password"
            )));
        };

        scope
            .postgres
            .ensure_role(&scope.instance.database.cluster, &username, &password)
            .await?;
        Ok(HandlerOutcome::Converged)
    }
}

#[async_trait]
impl Lifecycle for PostgresRole {
    fn label(&self) -> &'static str {
        "postgres-role"
    }

    async fn handle_create(&self) -> Result<HandlerOutcome> {
        self.ensure().await
    }

    async fn handle_update(&self) -> Result<HandlerOutcome> {
        self.ensure().await
    }

    async fn handle_delete(&self) -> Result<()> {
        let db = &self.scope.instance.database;
        self.scope
            .postgres
            .delete_role(&db.cluster, &db.user)
            .await?;
        info!(user = %db.user, cluster = %db.cluster.name, "postgres role removed");
        Ok(())
    }
}
