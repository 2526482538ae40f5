use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde_json::Value;
use tracing::debug;
use url::Url;

use super::Backend;
use crate::config::BackendConfig;
use crate::model::{CommandQuery, CommandRow, CommandStatus, ControlsRow, NewEvent};

/// Row id of the per-project governance record.
const CONTROLS_ROW_ID: &str = "global";

/// Client for a PostgREST-style table API (`/rest/v1/<table>`).
pub struct RestBackend {
    client: Client,
    base: Url,
    api_key: String,
}

impl RestBackend {
    pub fn new(config: &BackendConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(config.request_timeout_secs))
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            base: rest_base(&config.url)?,
            api_key: config.api_key.clone(),
        })
    }

    fn table_url(&self, table: &str) -> Result<Url> {
        self.base
            .join(table)
            .map_err(|e| anyhow!("Invalid table URL for {table}: {e}"))
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
    }
}

/// Normalizes the configured URL to `<url>/rest/v1/` so tables can be joined.
fn rest_base(url: &str) -> Result<Url> {
    let mut base = Url::parse(url).map_err(|e| anyhow!("Invalid backend URL: {e}"))?;
    match base.scheme() {
        "http" | "https" => {}
        scheme => return Err(anyhow!("Unsupported backend URL scheme '{scheme}'")),
    }
    let path = base.path().trim_end_matches('/').to_string();
    let path = if path.ends_with("/rest/v1") {
        format!("{path}/")
    } else {
        format!("{path}/rest/v1/")
    };
    base.set_path(&path);
    Ok(base)
}

fn eq(value: &str) -> String {
    format!("eq.{value}")
}

fn command_filters(query: &CommandQuery) -> Vec<(&'static str, String)> {
    vec![
        ("select", "*".to_string()),
        ("project_id", eq(&query.project_id)),
        ("node_id", eq(&query.node_id)),
        ("status", eq(query.status.as_str())),
        ("needs_approval", eq(&query.needs_approval.to_string())),
        ("order", "created_at.asc".to_string()),
        ("limit", query.limit.to_string()),
    ]
}

async fn ensure_success(response: Response, what: &str) -> Result<Response> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        anyhow::bail!("Backend {what} failed ({status}): {body}");
    }
    Ok(response)
}

#[async_trait]
impl Backend for RestBackend {
    async fn list_commands(&self, query: &CommandQuery) -> Result<Vec<CommandRow>> {
        let response = self
            .authorized(self.client.get(self.table_url("commands")?))
            .query(&command_filters(query))
            .send()
            .await?;
        let rows: Vec<CommandRow> = ensure_success(response, "list commands").await?.json().await?;
        debug!("Listed {} command(s)", rows.len());
        Ok(rows)
    }

    async fn update_command(&self, id: &str, expected: CommandStatus, patch: &Value) -> Result<usize> {
        let response = self
            .authorized(self.client.patch(self.table_url("commands")?))
            .query(&[("id", eq(id)), ("status", eq(expected.as_str()))])
            .header("Prefer", "return=representation")
            .json(patch)
            .send()
            .await?;
        // The representation contains only the rows the guard matched
        let updated: Vec<Value> = ensure_success(response, "update command").await?.json().await?;
        Ok(updated.len())
    }

    async fn insert_event(&self, event: &NewEvent) -> Result<()> {
        let response = self
            .authorized(self.client.post(self.table_url("events")?))
            .header("Prefer", "return=minimal")
            .json(event)
            .send()
            .await?;
        ensure_success(response, "insert event").await?;
        Ok(())
    }

    async fn select_controls(&self, project_id: &str) -> Result<Option<ControlsRow>> {
        let response = self
            .authorized(self.client.get(self.table_url("controls")?))
            .query(&[
                ("select", "kill_switch,allow_shell,allow_write,allow_fs".to_string()),
                ("project_id", eq(project_id)),
                ("id", eq(CONTROLS_ROW_ID)),
                ("limit", "1".to_string()),
            ])
            .send()
            .await?;
        let rows: Vec<ControlsRow> = ensure_success(response, "select controls").await?.json().await?;
        Ok(rows.into_iter().next())
    }
}
