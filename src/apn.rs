//! APN template CRUD, mode/binding config, and context apply/clear.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::instrument;
use zbus::zvariant::Value;

use crate::data_bearer::DataBearer;
use crate::domain_types::{ApnConfigMode, MAX_APN_TEMPLATES};
use crate::error::AppError;
use crate::store::{SqlParam, Store};

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// A persisted APN profile.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ApnTemplate {
    /// `id`.
    pub id: i64,
    /// `name`.
    pub name: String,
    /// `apn`.
    pub apn: String,
    /// `protocol`.
    pub protocol: String,
    /// `username`.
    pub username: String,
    /// `password`.
    pub password: String,
    /// `auth_method`.
    pub auth_method: String,
    /// `created_at`.
    pub created_at: i64,
}

/// Mode/binding configuration.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ApnConfigView {
    /// `mode`.
    pub mode: ApnConfigMode,
    /// `bound_template_id`.
    pub bound_template_id: Option<i64>,
    /// `auto_start`.
    pub auto_start: bool,
}

impl Default for ApnConfigView {
    fn default() -> Self {
        Self {
            mode: ApnConfigMode::Auto,
            bound_template_id: None,
            auto_start: false,
        }
    }
}

fn row_to_template(row: Vec<String>) -> Option<ApnTemplate> {
    Some(ApnTemplate {
        id: row.first()?.parse().ok()?,
        name: row.get(1)?.clone(),
        apn: row.get(2)?.clone(),
        protocol: row.get(3)?.clone(),
        username: row.get(4)?.clone(),
        password: row.get(5)?.clone(),
        auth_method: row.get(6)?.clone(),
        created_at: row.get(7)?.parse().ok()?,
    })
}

/// Template CRUD, config CRUD, and write-context apply/clear against the
/// resolved internet context.
pub struct ApnManager {
    store: Store,
    data_bearer: Arc<DataBearer>,
}

impl ApnManager {
    #[must_use]
    /// `new`.
    pub fn new(store: Store, data_bearer: Arc<DataBearer>) -> Self {
        Self { store, data_bearer }
    }

    /// List every persisted template.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn list_templates(&self) -> Result<Vec<ApnTemplate>, AppError> {
        let rows = self
            .store
            .query_rows(
                "SELECT id, name, apn, protocol, username, password, auth_method, created_at \
                 FROM apn_templates ORDER BY id",
                &[],
                MAX_APN_TEMPLATES as usize,
            )
            .await?;
        Ok(rows.into_iter().filter_map(row_to_template).collect())
    }

    /// Add a template. Rejects a duplicate name and rejects once
    /// `MAX_APN_TEMPLATES` are persisted.
    ///
    /// # Errors
    ///
    /// Returns an error on a duplicate name, capacity, or a database
    /// failure.
    #[instrument(skip(self, password))]
    pub async fn add_template(
        &self,
        name: &str,
        apn: &str,
        protocol: &str,
        username: &str,
        password: &str,
        auth_method: &str,
    ) -> Result<i64, AppError> {
        let count = self
            .store
            .query_scalar_int("SELECT COUNT(*) FROM apn_templates", &[])
            .await?;
        if count >= MAX_APN_TEMPLATES {
            return Err(AppError::InvalidArgument(format!(
                "at most {MAX_APN_TEMPLATES} APN templates are supported"
            )));
        }
        let exists = self
            .store
            .query_scalar_int(
                "SELECT COUNT(*) FROM apn_templates WHERE name = ?",
                &[SqlParam::from(name)],
            )
            .await?;
        if exists > 0 {
            return Err(AppError::Conflict(format!("template name {name} already exists")));
        }
        self.store
            .exec_insert(
                "INSERT INTO apn_templates (name, apn, protocol, username, password, auth_method, created_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
                &[
                    SqlParam::from(name),
                    SqlParam::from(apn),
                    SqlParam::from(protocol),
                    SqlParam::from(username),
                    SqlParam::from(password),
                    SqlParam::from(auth_method),
                    SqlParam::from(now_unix()),
                ],
            )
            .await
            .map_err(AppError::from)
    }

    /// Overwrite a template's fields, keeping its name.
    ///
    /// # Errors
    ///
    /// Returns an error if the database write fails.
    pub async fn update_template(
        &self,
        id: i64,
        apn: &str,
        protocol: &str,
        username: &str,
        password: &str,
        auth_method: &str,
    ) -> Result<(), AppError> {
        self.store
            .exec(
                "UPDATE apn_templates SET apn = ?, protocol = ?, username = ?, password = ?, \
                 auth_method = ? WHERE id = ?",
                &[
                    SqlParam::from(apn),
                    SqlParam::from(protocol),
                    SqlParam::from(username),
                    SqlParam::from(password),
                    SqlParam::from(auth_method),
                    SqlParam::from(id),
                ],
            )
            .await?;
        Ok(())
    }

    /// Delete a template by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the database write fails.
    pub async fn delete_template(&self, id: i64) -> Result<(), AppError> {
        self.store
            .exec("DELETE FROM apn_templates WHERE id = ?", &[SqlParam::from(id)])
            .await?;
        Ok(())
    }

    /// Current mode/binding config.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn config(&self) -> Result<ApnConfigView, AppError> {
        let rows = self
            .store
            .query_rows(
                "SELECT mode, bound_template_id, auto_start FROM apn_config WHERE id = 1",
                &[],
                1,
            )
            .await?;
        let Some(row) = rows.into_iter().next() else {
            return Ok(ApnConfigView::default());
        };
        Ok(ApnConfigView {
            mode: ApnConfigMode::from_i64(row[0].parse().unwrap_or(0)),
            bound_template_id: row[1].parse().ok(),
            auto_start: row[2] == "1",
        })
    }

    /// Persist the mode/binding config.
    ///
    /// # Errors
    ///
    /// Returns an error if the database write fails.
    pub async fn save_config(&self, config: ApnConfigView) -> Result<(), AppError> {
        self.store
            .exec(
                "INSERT INTO apn_config (id, mode, bound_template_id, auto_start) VALUES (1, ?, ?, ?) \
                 ON CONFLICT(id) DO UPDATE SET mode = excluded.mode, \
                 bound_template_id = excluded.bound_template_id, auto_start = excluded.auto_start",
                &[
                    SqlParam::from(config.mode.as_i64()),
                    SqlParam::from(config.bound_template_id),
                    SqlParam::from(config.auto_start),
                ],
            )
            .await?;
        Ok(())
    }

    async fn template_by_id(&self, id: i64) -> Result<ApnTemplate, AppError> {
        self.list_templates()
            .await?
            .into_iter()
            .find(|t| t.id == id)
            .ok_or_else(|| AppError::NotFound(format!("apn template {id} not found")))
    }

    /// Write a template's APN/username/password/protocol onto the
    /// resolved internet context.
    ///
    /// # Errors
    ///
    /// Returns an error if the template is unknown, no internet context
    /// can be resolved, or a bus call fails.
    #[instrument(skip(self))]
    pub async fn apply_template(&self, template_id: i64) -> Result<(), AppError> {
        let template = self.template_by_id(template_id).await?;
        let context = self
            .data_bearer
            .find_internet_context()
            .await?
            .ok_or_else(|| AppError::Unavailable("no internet context available".to_string()))?;

        self.data_bearer
            .bus()
            .set_property(
                &context.path,
                "org.ofono.ConnectionContext",
                "AccessPointName",
                Value::from(template.apn.clone()),
            )
            .await
            .map_err(AppError::from)?;
        self.data_bearer
            .bus()
            .set_property(
                &context.path,
                "org.ofono.ConnectionContext",
                "Username",
                Value::from(template.username.clone()),
            )
            .await
            .map_err(AppError::from)?;
        self.data_bearer
            .bus()
            .set_property(
                &context.path,
                "org.ofono.ConnectionContext",
                "Password",
                Value::from(template.password.clone()),
            )
            .await
            .map_err(AppError::from)?;
        self.data_bearer
            .bus()
            .set_property(
                &context.path,
                "org.ofono.ConnectionContext",
                "Protocol",
                Value::from(template.protocol.clone()),
            )
            .await
            .map_err(AppError::from)?;

        self.save_config(ApnConfigView {
            mode: ApnConfigMode::Manual,
            bound_template_id: Some(template_id),
            auto_start: self.config().await?.auto_start,
        })
        .await
    }

    /// Clear the bound template and revert to automatic context
    /// selection by blanking the resolved internet context's APN.
    ///
    /// # Errors
    ///
    /// Returns an error if no internet context can be resolved or a bus
    /// call fails.
    #[instrument(skip(self))]
    pub async fn clear(&self) -> Result<(), AppError> {
        if let Some(context) = self.data_bearer.find_internet_context().await? {
            self.data_bearer
                .bus()
                .set_property(
                    &context.path,
                    "org.ofono.ConnectionContext",
                    "AccessPointName",
                    Value::from(String::new()),
                )
                .await
                .map_err(AppError::from)?;
        }
        self.save_config(ApnConfigView {
            mode: ApnConfigMode::Auto,
            bound_template_id: None,
            auto_start: self.config().await?.auto_start,
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_to_template_parses_all_columns() {
        let row = vec![
            "1".to_string(),
            "carrier".to_string(),
            "internet.apn".to_string(),
            "ip".to_string(),
            "user".to_string(),
            "pass".to_string(),
            "pap".to_string(),
            "1000".to_string(),
        ];
        let template = row_to_template(row).unwrap();
        assert_eq!(template.id, 1);
        assert_eq!(template.name, "carrier");
        assert_eq!(template.created_at, 1000);
    }

    #[test]
    fn row_to_template_rejects_short_rows() {
        assert!(row_to_template(vec!["1".to_string()]).is_none());
    }

    #[test]
    fn default_config_is_automatic_with_no_binding() {
        let config = ApnConfigView::default();
        assert_eq!(config.mode, ApnConfigMode::Auto);
        assert_eq!(config.bound_template_id, None);
    }
}
