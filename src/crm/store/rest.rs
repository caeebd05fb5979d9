use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::Deserialize;
use serde_json::Value;

use super::{RecordStore, SelectQuery};
use crate::crm::schema::Table;
use crate::errors::StoreError;

/// Error body returned by PostgREST.
#[derive(Debug, Deserialize)]
struct PostgrestError {
    code: Option<String>,
    message: Option<String>,
    details: Option<String>,
    hint: Option<String>,
}

/// `RecordStore` over a hosted PostgREST surface (`{url}/rest/v1/{table}`).
pub struct RestStore {
    client: Client,
    base_url: String,
    api_key: String,
}

impl RestStore {
    pub fn new(base_url: &str, api_key: &str) -> anyhow::Result<Self> {
        let base_url = base_url.trim().trim_end_matches('/').to_string();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            anyhow::bail!("Invalid store URL '{}': expected http(s)://", base_url);
        }
        Ok(Self {
            client: Client::new(),
            base_url,
            api_key: api_key.to_string(),
        })
    }

    fn endpoint(&self, table: Table) -> String {
        format!("{}/rest/v1/{}", self.base_url, table.name())
    }

    fn request(&self, method: Method, table: Table) -> RequestBuilder {
        self.client
            .request(method, self.endpoint(table))
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
    }

    async fn send(&self, table: Table, builder: RequestBuilder) -> Result<Response, StoreError> {
        let response = builder
            .send()
            .await
            .map_err(|e| StoreError::Network(e.to_string()))?;
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(parse_error(table, status.as_u16(), &body))
    }

    async fn rows(&self, table: Table, response: Response) -> Result<Vec<Value>, StoreError> {
        let value: Value = response.json().await.map_err(|e| StoreError::Decode {
            table: table.name().to_string(),
            message: e.to_string(),
        })?;
        match value {
            Value::Array(rows) => Ok(rows),
            Value::Object(_) => Ok(vec![value]),
            other => Err(StoreError::Decode {
                table: table.name().to_string(),
                message: format!("expected an array of rows, got {}", other),
            }),
        }
    }
}

/// Query parameters for a select: `select`, one `col=eq.value` per filter, `order`.
pub fn select_params(query: &SelectQuery) -> Vec<(String, String)> {
    let mut params = vec![("select".to_string(), query.select_clause())];
    for (column, value) in &query.filters {
        params.push((column.clone(), format!("eq.{}", value)));
    }
    if let Some(order) = &query.order {
        let direction = if order.ascending { "asc" } else { "desc" };
        params.push(("order".to_string(), format!("{}.{}", order.column, direction)));
    }
    params
}

fn parse_error(table: Table, status: u16, body: &str) -> StoreError {
    match serde_json::from_str::<PostgrestError>(body) {
        Ok(err) => {
            let mut message = err.message.unwrap_or_else(|| format!("HTTP {}", status));
            if let Some(details) = err.details.filter(|d| !d.is_empty()) {
                message.push_str(&format!(" ({})", details));
            }
            if let Some(hint) = err.hint.filter(|h| !h.is_empty()) {
                message.push_str(&format!(" Hint: {}", hint));
            }
            StoreError::classify(table.name(), err.code.as_deref(), &message)
        }
        Err(_) => {
            let message = if body.trim().is_empty() {
                format!("HTTP {}", status)
            } else {
                format!("HTTP {}: {}", status, body.trim())
            };
            StoreError::classify(table.name(), None, &message)
        }
    }
}

#[async_trait]
impl RecordStore for RestStore {
    fn backend(&self) -> &'static str {
        "rest"
    }

    async fn select(&self, query: &SelectQuery) -> Result<Vec<Value>, StoreError> {
        let builder = self
            .request(Method::GET, query.table)
            .query(&select_params(query));
        let response = self.send(query.table, builder).await?;
        self.rows(query.table, response).await
    }

    async fn insert(&self, table: Table, row: Value) -> Result<Value, StoreError> {
        let builder = self
            .request(Method::POST, table)
            .header("Prefer", "return=representation")
            .json(&row);
        let response = self.send(table, builder).await?;
        self.rows(table, response)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::Decode {
                table: table.name().to_string(),
                message: "insert returned no row".into(),
            })
    }

    async fn update(&self, table: Table, id: &str, patch: Value) -> Result<Value, StoreError> {
        let builder = self
            .request(Method::PATCH, table)
            .query(&[("id", format!("eq.{}", id))])
            .header("Prefer", "return=representation")
            .json(&patch);
        let response = self.send(table, builder).await?;
        self.rows(table, response)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::NotFound {
                table: table.name().to_string(),
                id: id.to_string(),
            })
    }

    async fn delete(&self, table: Table, id: &str) -> Result<(), StoreError> {
        let builder = self
            .request(Method::DELETE, table)
            .query(&[("id", format!("eq.{}", id))]);
        self.send(table, builder).await?;
        Ok(())
    }
}
