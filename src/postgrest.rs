//! [`MessStore`] over a PostgREST endpoint (the REST interface of a hosted
//! Postgres backend).
//!
//! Row-level access policies are enforced by the server, so reads made with a
//! member's access token only return what that member may see. The privileged
//! totals come from the `get_global_aggregates` remote procedure.

use crate::audit::{AuditEntry, AuditSink};
use crate::error::{MessLedgerError, Result};
use crate::schema::*;
use crate::store::{MessStore, RecordFilter};
use async_trait::async_trait;
use log::{debug, warn};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::time::sleep;

const REST_PATH: &str = "rest/v1";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const READ_ATTEMPTS: u32 = 3;
const RETRY_BACKOFF: Duration = Duration::from_millis(250);

pub const URL_ENV: &str = "MESS_LEDGER_URL";
pub const API_KEY_ENV: &str = "MESS_LEDGER_API_KEY";

#[derive(Clone)]
pub struct PostgrestStore {
    client: Client,
    base_url: String,
    api_key: String,
    access_token: Option<String>,
    capabilities: SchemaCapabilities,
}

impl PostgrestStore {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self> {
        let client = Client::builder().timeout(DEFAULT_TIMEOUT).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            access_token: None,
            capabilities: SchemaCapabilities::default(),
        })
    }

    /// Reads the endpoint and anonymous key from `MESS_LEDGER_URL` and
    /// `MESS_LEDGER_API_KEY`.
    pub fn from_env() -> Result<Self> {
        let url = std::env::var(URL_ENV)
            .map_err(|_| MessLedgerError::InvalidConfig(format!("{} is not set", URL_ENV)))?;
        let key = std::env::var(API_KEY_ENV)
            .map_err(|_| MessLedgerError::InvalidConfig(format!("{} is not set", API_KEY_ENV)))?;
        Self::new(url, key)
    }

    /// Acts as the signed-in user, so their row-level policies apply.
    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    /// Declares which optional columns the deployed schema has.
    pub fn with_capabilities(mut self, capabilities: SchemaCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}/{}", self.base_url, REST_PATH, path)
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let bearer = self.access_token.as_deref().unwrap_or(&self.api_key);
        self.client
            .request(method, self.url(path))
            .header("apikey", &self.api_key)
            .header("Authorization", format!("Bearer {}", bearer))
    }

    async fn send(&self, operation: &str, request: RequestBuilder) -> Result<Response> {
        let response = request.send().await?;
        ensure_success(operation, response).await
    }

    /// Reads are idempotent, so timeouts, connection failures and 5xx answers are
    /// retried with a linear backoff. Writes are never retried.
    async fn select<T: DeserializeOwned>(
        &self,
        operation: &str,
        table: &str,
        query: Vec<(String, String)>,
    ) -> Result<Vec<T>> {
        let mut attempt = 1;
        loop {
            let request = self.request(Method::GET, table).query(&query);
            match request.send().await {
                Ok(response) if is_transient(response.status()) && attempt < READ_ATTEMPTS => {
                    warn!(
                        "{} got status {} (attempt {}/{}), retrying",
                        operation,
                        response.status(),
                        attempt,
                        READ_ATTEMPTS
                    );
                }
                Err(e) if (e.is_timeout() || e.is_connect()) && attempt < READ_ATTEMPTS => {
                    warn!(
                        "{} failed (attempt {}/{}): {}, retrying",
                        operation, attempt, READ_ATTEMPTS, e
                    );
                }
                Ok(response) => {
                    let rows: Vec<T> = ensure_success(operation, response).await?.json().await?;
                    debug!("{}: {} rows from {}", operation, rows.len(), table);
                    return Ok(rows);
                }
                Err(e) => return Err(e.into()),
            }
            sleep(RETRY_BACKOFF * attempt).await;
            attempt += 1;
        }
    }

    /// Sends a write that returns the affected rows and yields the first one.
    async fn write_one<T: DeserializeOwned>(
        &self,
        operation: &str,
        request: RequestBuilder,
    ) -> Result<T> {
        let request = request.header("Prefer", "return=representation");
        let rows: Vec<T> = self.send(operation, request).await?.json().await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| MessLedgerError::store(operation, "no row matched"))
    }

    async fn insert<B: Serialize, T: DeserializeOwned>(
        &self,
        operation: &str,
        table: &str,
        body: &B,
    ) -> Result<T> {
        let request = self.request(Method::POST, table).json(&[body]);
        self.write_one(operation, request).await
    }

    async fn delete_by_id(&self, operation: &str, table: &str, id: RecordId) -> Result<()> {
        let request = self
            .request(Method::DELETE, table)
            .query(&[("id", format!("eq.{}", id))]);
        let _: Value = self.write_one(operation, request).await?;
        Ok(())
    }
}

fn is_transient(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

async fn ensure_success(operation: &str, response: Response) -> Result<Response> {
    let status = response.status();
    if !status.is_success() {
        let error_text = response.text().await?;
        return Err(MessLedgerError::store(
            operation,
            format!("status {}: {}", status, error_text),
        ));
    }
    Ok(response)
}

fn filter_query(filter: &RecordFilter) -> Vec<(String, String)> {
    let mut query = vec![("select".to_string(), "*".to_string())];
    if let Some(member_id) = &filter.member_id {
        query.push(("member_id".to_string(), format!("eq.{}", member_id)));
    }
    if let Some(from) = filter.date_from {
        query.push(("date".to_string(), format!("gte.{}", from)));
    }
    if let Some(to) = filter.date_to {
        query.push(("date".to_string(), format!("lte.{}", to)));
    }
    query.push(("order".to_string(), "date.asc,id.asc".to_string()));
    query
}

/// The procedure returns either one object or a single-row set.
fn parse_aggregates(body: Value) -> Result<RawAggregates> {
    let row = match body {
        Value::Array(rows) => rows.into_iter().next().unwrap_or(Value::Null),
        other => other,
    };
    if row.is_null() {
        return Ok(RawAggregates::default());
    }
    Ok(serde_json::from_value(row)?)
}

#[async_trait]
impl MessStore for PostgrestStore {
    async fn get_members(&self) -> Result<Vec<Member>> {
        self.select("get_members", "members", vec![("select".to_string(), "*".to_string())])
            .await
    }

    async fn get_meals(&self, filter: &RecordFilter) -> Result<Vec<MealRecord>> {
        self.select("get_meals", "meals", filter_query(filter)).await
    }

    async fn get_bazar(&self, filter: &RecordFilter) -> Result<Vec<BazarRecord>> {
        self.select("get_bazar", "bazar", filter_query(filter)).await
    }

    async fn get_deposits(&self, filter: &RecordFilter) -> Result<Vec<DepositRecord>> {
        self.select("get_deposits", "deposits", filter_query(filter)).await
    }

    async fn get_global_aggregates(&self) -> Result<RawAggregates> {
        let request = self
            .request(Method::POST, "rpc/get_global_aggregates")
            .json(&json!({}));
        let body: Value = self
            .send("get_global_aggregates", request)
            .await?
            .json()
            .await?;
        parse_aggregates(body)
    }

    async fn schema_capabilities(&self) -> Result<SchemaCapabilities> {
        Ok(self.capabilities)
    }

    async fn find_member_by_auth_id(&self, auth_user_id: &str) -> Result<Option<Member>> {
        let query = vec![
            ("select".to_string(), "*".to_string()),
            ("auth_user_id".to_string(), format!("eq.{}", auth_user_id)),
            ("limit".to_string(), "1".to_string()),
        ];
        let rows: Vec<Member> = self
            .select("find_member_by_auth_id", "members", query)
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn insert_member(&self, member: NewMember) -> Result<Member> {
        self.insert("insert_member", "members", &member).await
    }

    async fn insert_meal(&self, meal: NewMeal) -> Result<MealRecord> {
        self.insert("insert_meal", "meals", &meal).await
    }

    async fn update_meal_count(&self, id: RecordId, meal_count: f64) -> Result<MealRecord> {
        let request = self
            .request(Method::PATCH, "meals")
            .query(&[("id", format!("eq.{}", id))])
            .json(&json!({ "meal_count": meal_count }));
        self.write_one("update_meal_count", request).await
    }

    async fn delete_meal(&self, id: RecordId) -> Result<()> {
        self.delete_by_id("delete_meal", "meals", id).await
    }

    async fn insert_bazar(&self, bazar: NewBazar, with_paid_from: bool) -> Result<BazarRecord> {
        let mut body = serde_json::to_value(&bazar)?;
        if !with_paid_from {
            if let Value::Object(fields) = &mut body {
                fields.remove("paid_from");
            }
        }
        self.insert("insert_bazar", "bazar", &body).await
    }

    async fn update_bazar(
        &self,
        id: RecordId,
        member_id: &str,
        update: BazarUpdate,
        with_paid_from: bool,
    ) -> Result<BazarRecord> {
        let mut body = serde_json::to_value(&update)?;
        if !with_paid_from {
            if let Value::Object(fields) = &mut body {
                fields.remove("paid_from");
            }
        }
        let request = self
            .request(Method::PATCH, "bazar")
            .query(&[
                ("id", format!("eq.{}", id)),
                ("member_id", format!("eq.{}", member_id)),
            ])
            .json(&body);
        self.write_one("update_bazar", request).await
    }

    async fn delete_bazar(&self, id: RecordId) -> Result<()> {
        self.delete_by_id("delete_bazar", "bazar", id).await
    }

    async fn insert_deposit(&self, deposit: NewDeposit) -> Result<DepositRecord> {
        self.insert("insert_deposit", "deposits", &deposit).await
    }

    async fn delete_deposit(&self, id: RecordId) -> Result<()> {
        self.delete_by_id("delete_deposit", "deposits", id).await
    }
}

#[async_trait]
impl AuditSink for PostgrestStore {
    async fn record(&self, entry: &AuditEntry) -> Result<()> {
        let request = self.request(Method::POST, "audit_logs").json(&[entry]);
        self.send("audit", request).await?;
        Ok(())
    }
}
