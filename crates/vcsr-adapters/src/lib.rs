//! Source and sink adapter contracts plus the config-selected variants.
//!
//! Sources fetch pages of [`Record`]s from an upstream store; sinks push one
//! record to the downstream system and classify the response. Everything
//! stateful about delivery (pacing, breaker, retry-on-404) lives in
//! `vcsr-sync`; adapters only translate wire formats and handle their own
//! transport retries.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::StatusCode;
use scraper::{Html, Selector};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tracing::warn;
use vcsr_core::{Record, SinkStatus};
use vcsr_storage::{classify_reqwest_error, classify_status, BackoffPolicy, RetryDisposition};

pub const CRATE_NAME: &str = "vcsr-adapters";

/// Recency constraints handed to every `fetch_page` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchFilters {
    pub since: Option<DateTime<Utc>>,
}

impl FetchFilters {
    pub fn recency_days(days: i64) -> Self {
        Self {
            since: Some(Utc::now() - chrono::Duration::days(days)),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SourcePage {
    pub records: Vec<Record>,
    pub next_cursor: Option<String>,
}

/// All variants abort the pass; the distinction is reporting, not recovery.
/// Transient transport failures are retried inside the adapter before an
/// `Exhausted` surfaces.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("source transport failed after {attempts} attempts: {message}")]
    Exhausted { attempts: usize, message: String },
    #[error("source returned http {status}")]
    Status { status: u16 },
    #[error("malformed source response: {0}")]
    Malformed(String),
    #[error("source misconfigured: {0}")]
    Config(String),
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &str;

    /// Fetch one page. Deterministic for a given (cursor, filters) pair.
    /// `next_cursor: None` means the source is exhausted.
    async fn fetch_page(
        &self,
        cursor: Option<&str>,
        filters: &FetchFilters,
    ) -> Result<SourcePage, SourceError>;
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink transport: {0}")]
    Transport(String),
}

impl From<reqwest::Error> for SinkError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

#[async_trait]
pub trait SinkAdapter: Send + Sync {
    fn sink_id(&self) -> &str;

    async fn send(&self, record: &Record) -> Result<SinkStatus, SinkError>;
}

pub fn classify_sink_status(status: StatusCode) -> SinkStatus {
    if status.is_success() {
        SinkStatus::Accepted
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        SinkStatus::RateLimited
    } else if status == StatusCode::NOT_FOUND {
        SinkStatus::NotReady
    } else {
        SinkStatus::Rejected(status.as_u16())
    }
}

pub fn http_client(timeout: Duration, user_agent: Option<&str>) -> anyhow::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .gzip(true)
        .brotli(true)
        .timeout(timeout);
    if let Some(user_agent) = user_agent {
        builder = builder.user_agent(user_agent.to_string());
    }
    builder.build().context("building reqwest client")
}

/// Coerce the timestamp shapes the upstreams actually emit: RFC 3339,
/// `YYYY-MM-DD HH:MM:SS[.frac]`, or bare epoch seconds.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(raw, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    if let Ok(epoch) = raw.parse::<i64>() {
        return Utc.timestamp_opt(epoch, 0).single();
    }
    None
}

fn drop_empty_ids(source_id: &str, records: Vec<Record>) -> Vec<Record> {
    records
        .into_iter()
        .filter(|record| {
            let keep = !record.id.trim().is_empty();
            if !keep {
                warn!(source_id, "dropping record with empty id at fetch time");
            }
            keep
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tabular parsing (query-cli stdout, html table cells)
// ---------------------------------------------------------------------------

/// Fixed column contract for delimited tabular output.
#[derive(Debug, Clone)]
pub struct TabularContract {
    pub delimiter: char,
    pub columns: Vec<String>,
    pub id_column: String,
    pub timestamp_column: Option<String>,
}

impl TabularContract {
    fn id_index(&self) -> Option<usize> {
        self.columns.iter().position(|c| c == &self.id_column)
    }

    fn timestamp_index(&self) -> Option<usize> {
        self.timestamp_column
            .as_ref()
            .and_then(|name| self.columns.iter().position(|c| c == name))
    }
}

/// Parse psql-style delimited rows into records.
///
/// Header echoes, `---` separators, `(N rows)` footers and blank lines are
/// skipped silently; rows with too few columns are skipped with a log line,
/// never fatal. Unparseable timestamps are retained as `timestamp: None`
/// (bounded single-query sources keep such records).
pub fn parse_delimited_rows(source_id: &str, contract: &TabularContract, text: &str) -> Vec<Record> {
    let id_index = match contract.id_index() {
        Some(index) => index,
        None => {
            warn!(source_id, id_column = %contract.id_column, "id column missing from contract");
            return Vec::new();
        }
    };
    let timestamp_index = contract.timestamp_index();
    let header_marker = contract.columns.first().map(String::as_str).unwrap_or("");

    let mut records = Vec::new();
    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty()
            || trimmed.starts_with('(')
            || trimmed.contains("rows)")
            || trimmed.contains("---")
            || (!header_marker.is_empty() && trimmed.contains(header_marker))
        {
            continue;
        }

        let parts: Vec<&str> = trimmed
            .split(contract.delimiter)
            .map(str::trim)
            .collect();
        if parts.len() < contract.columns.len() {
            warn!(
                source_id,
                expected = contract.columns.len(),
                got = parts.len(),
                "skipping row with wrong column count"
            );
            continue;
        }

        let mut payload = BTreeMap::new();
        for (column, value) in contract.columns.iter().zip(parts.iter()) {
            payload.insert(column.clone(), (*value).to_string());
        }
        let timestamp = timestamp_index.and_then(|index| parse_timestamp(parts[index]));
        records.push(Record {
            id: parts[id_index].to_string(),
            timestamp,
            payload,
        });
    }
    drop_empty_ids(source_id, records)
}

// ---------------------------------------------------------------------------
// Api source: paginated REST upstream
// ---------------------------------------------------------------------------

/// Paginated conversations API. Pagination-capable, so records whose
/// timestamp fails to parse are excluded (and logged) rather than retained;
/// the recency window cannot otherwise be honored page over page.
pub struct ApiSource {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    flow_type: Option<String>,
    page_limit: u32,
    id_field: String,
    timestamp_field: String,
    backoff: BackoffPolicy,
}

#[derive(Debug, Deserialize)]
struct ApiPage {
    #[serde(default)]
    conversations: Vec<JsonValue>,
    #[serde(default)]
    next_cursor: Option<String>,
}

impl ApiSource {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: reqwest::Client,
        endpoint: impl Into<String>,
        api_key: impl Into<String>,
        flow_type: Option<String>,
        page_limit: u32,
        id_field: impl Into<String>,
        timestamp_field: impl Into<String>,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            flow_type,
            page_limit,
            id_field: id_field.into(),
            timestamp_field: timestamp_field.into(),
            backoff,
        }
    }

    fn page_to_records(&self, page: &ApiPage, filters: &FetchFilters) -> Vec<Record> {
        let mut records = Vec::new();
        for conversation in &page.conversations {
            let Some(object) = conversation.as_object() else {
                warn!(source_id = "api", "skipping non-object conversation entry");
                continue;
            };

            let id = object
                .get(&self.id_field)
                .map(json_value_to_string)
                .unwrap_or_default();
            let raw_timestamp = object
                .get(&self.timestamp_field)
                .map(json_value_to_string)
                .unwrap_or_default();
            let timestamp = parse_timestamp(&raw_timestamp);
            if timestamp.is_none() {
                warn!(source_id = "api", record_id = %id, "excluding record with unparseable timestamp");
                continue;
            }
            if let (Some(since), Some(ts)) = (filters.since, timestamp) {
                if ts < since {
                    continue;
                }
            }

            let mut payload = BTreeMap::new();
            for (key, value) in object {
                payload.insert(key.clone(), json_value_to_string(value));
            }
            records.push(Record {
                id,
                timestamp,
                payload,
            });
        }
        drop_empty_ids(self.source_id(), records)
    }
}

fn json_value_to_string(value: &JsonValue) -> String {
    match value {
        JsonValue::Null => String::new(),
        JsonValue::String(s) => s.clone(),
        JsonValue::Bool(b) => b.to_string(),
        JsonValue::Number(n) => n.to_string(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

#[async_trait]
impl SourceAdapter for ApiSource {
    fn source_id(&self) -> &str {
        "api"
    }

    async fn fetch_page(
        &self,
        cursor: Option<&str>,
        filters: &FetchFilters,
    ) -> Result<SourcePage, SourceError> {
        let mut query: Vec<(&str, String)> = vec![("limit", self.page_limit.to_string())];
        if let Some(since) = filters.since {
            query.push(("since", since.timestamp().to_string()));
        }
        if let Some(flow_type) = &self.flow_type {
            query.push(("flow_type", flow_type.clone()));
        }
        if let Some(cursor) = cursor {
            query.push(("cursor", cursor.to_string()));
        }

        let attempts = self.backoff.max_retries + 1;
        let mut last_message = String::new();
        for attempt in 0..attempts {
            let response = self
                .client
                .get(&self.endpoint)
                .bearer_auth(&self.api_key)
                .query(&query)
                .send()
                .await;

            match response {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let page: ApiPage = response
                            .json()
                            .await
                            .map_err(|err| SourceError::Malformed(err.to_string()))?;
                        return Ok(SourcePage {
                            records: self.page_to_records(&page, filters),
                            next_cursor: page.next_cursor,
                        });
                    }
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt + 1 < attempts
                    {
                        last_message = format!("http {status}");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(SourceError::Status {
                        status: status.as_u16(),
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt + 1 < attempts
                    {
                        last_message = err.to_string();
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(SourceError::Exhausted {
                        attempts: attempt + 1,
                        message: err.to_string(),
                    });
                }
            }
        }
        Err(SourceError::Exhausted {
            attempts,
            message: last_message,
        })
    }
}

// ---------------------------------------------------------------------------
// Warehouse source: one bounded SQL query via sqlx
// ---------------------------------------------------------------------------

/// Direct warehouse query. Bounded single-shot, so the recency window lives
/// in the SQL itself and records with unparseable timestamps are retained.
/// The column list must match the SELECT list positionally, with non-text
/// columns cast to text in the query.
pub struct WarehouseSource {
    pool: PgPool,
    query: String,
    columns: Vec<String>,
    id_column: String,
    timestamp_column: Option<String>,
    backoff: BackoffPolicy,
}

impl WarehouseSource {
    pub fn new(
        pool: PgPool,
        query: impl Into<String>,
        columns: Vec<String>,
        id_column: impl Into<String>,
        timestamp_column: Option<String>,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            pool,
            query: query.into(),
            columns,
            id_column: id_column.into(),
            timestamp_column,
            backoff,
        }
    }

    pub fn connect(database_url: &str) -> Result<PgPool, SourceError> {
        PgPoolOptions::new()
            .max_connections(2)
            .connect_lazy(database_url)
            .map_err(|err| SourceError::Config(format!("warehouse pool: {err}")))
    }

    fn rows_to_records(&self, rows: Vec<sqlx::postgres::PgRow>) -> Result<Vec<Record>, SourceError> {
        let id_index = self
            .columns
            .iter()
            .position(|c| c == &self.id_column)
            .ok_or_else(|| {
                SourceError::Config(format!("id column {} not in column list", self.id_column))
            })?;
        let timestamp_index = self
            .timestamp_column
            .as_ref()
            .and_then(|name| self.columns.iter().position(|c| c == name));

        let mut records = Vec::new();
        for row in rows {
            let mut payload = BTreeMap::new();
            let mut values = Vec::with_capacity(self.columns.len());
            for (index, column) in self.columns.iter().enumerate() {
                let value: Option<String> = row
                    .try_get(index)
                    .map_err(|err| SourceError::Malformed(format!("column {column}: {err}")))?;
                let value = value.unwrap_or_default();
                payload.insert(column.clone(), value.clone());
                values.push(value);
            }
            let timestamp = timestamp_index.and_then(|index| parse_timestamp(&values[index]));
            records.push(Record {
                id: values[id_index].clone(),
                timestamp,
                payload,
            });
        }
        Ok(drop_empty_ids(self.source_id(), records))
    }
}

#[async_trait]
impl SourceAdapter for WarehouseSource {
    fn source_id(&self) -> &str {
        "warehouse"
    }

    async fn fetch_page(
        &self,
        cursor: Option<&str>,
        _filters: &FetchFilters,
    ) -> Result<SourcePage, SourceError> {
        if cursor.is_some() {
            return Ok(SourcePage::default());
        }

        let attempts = self.backoff.max_retries + 1;
        let mut last_message = String::new();
        for attempt in 0..attempts {
            match sqlx::query(&self.query).fetch_all(&self.pool).await {
                Ok(rows) => {
                    return Ok(SourcePage {
                        records: self.rows_to_records(rows)?,
                        next_cursor: None,
                    });
                }
                Err(err) => {
                    last_message = err.to_string();
                    if attempt + 1 < attempts {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                    }
                }
            }
        }
        Err(SourceError::Exhausted {
            attempts,
            message: last_message,
        })
    }
}

// ---------------------------------------------------------------------------
// Query-CLI source: external query tool, pipe-delimited stdout
// ---------------------------------------------------------------------------

/// Runs an external query CLI (a psql wrapper) and parses its delimited
/// stdout under a fixed column contract. Non-zero exit, a timeout, or empty
/// stdout are all transient and retried with backoff.
pub struct QueryCliSource {
    program: String,
    args: Vec<String>,
    query_path: PathBuf,
    contract: TabularContract,
    timeout: Duration,
    backoff: BackoffPolicy,
}

impl QueryCliSource {
    pub fn new(
        program: impl Into<String>,
        args: Vec<String>,
        query_path: impl Into<PathBuf>,
        contract: TabularContract,
        timeout: Duration,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            program: program.into(),
            args,
            query_path: query_path.into(),
            contract,
            timeout,
            backoff,
        }
    }

    async fn run_once(&self, query: &str) -> Result<String, String> {
        let mut command = tokio::process::Command::new(&self.program);
        command.args(&self.args).arg("-c").arg(query);
        command.kill_on_drop(true);

        let output = match tokio::time::timeout(self.timeout, command.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(err)) => return Err(format!("spawning {}: {err}", self.program)),
            Err(_) => return Err(format!("query timed out after {:?}", self.timeout)),
        };

        if !output.status.success() {
            return Err(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if stdout.trim().is_empty() {
            return Err("empty response from query tool".to_string());
        }
        Ok(stdout)
    }
}

#[async_trait]
impl SourceAdapter for QueryCliSource {
    fn source_id(&self) -> &str {
        "query-cli"
    }

    async fn fetch_page(
        &self,
        cursor: Option<&str>,
        _filters: &FetchFilters,
    ) -> Result<SourcePage, SourceError> {
        if cursor.is_some() {
            return Ok(SourcePage::default());
        }

        let query = tokio::fs::read_to_string(&self.query_path)
            .await
            .map_err(|err| {
                SourceError::Config(format!(
                    "reading query file {}: {err}",
                    self.query_path.display()
                ))
            })?;

        let attempts = self.backoff.max_retries + 1;
        let mut last_message = String::new();
        for attempt in 0..attempts {
            match self.run_once(&query).await {
                Ok(stdout) => {
                    return Ok(SourcePage {
                        records: parse_delimited_rows(self.source_id(), &self.contract, &stdout),
                        next_cursor: None,
                    });
                }
                Err(message) => {
                    warn!(
                        source_id = self.source_id(),
                        attempt = attempt + 1,
                        attempts,
                        %message,
                        "query tool attempt failed"
                    );
                    last_message = message;
                    if attempt + 1 < attempts {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                    }
                }
            }
        }
        Err(SourceError::Exhausted {
            attempts,
            message: last_message,
        })
    }
}

// ---------------------------------------------------------------------------
// Html-table source: scraped public page, synthetic records
// ---------------------------------------------------------------------------

/// Scrapes an HTML table into synthetic records. Bounded single-shot; rows
/// whose cell count disagrees with the contract are skipped with a log line,
/// and unparseable timestamps are retained.
pub struct HtmlTableSource {
    client: reqwest::Client,
    url: String,
    table_selector: String,
    columns: Vec<String>,
    id_column: String,
    timestamp_column: Option<String>,
    backoff: BackoffPolicy,
}

impl HtmlTableSource {
    pub fn new(
        client: reqwest::Client,
        url: impl Into<String>,
        table_selector: impl Into<String>,
        columns: Vec<String>,
        id_column: impl Into<String>,
        timestamp_column: Option<String>,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            client,
            url: url.into(),
            table_selector: table_selector.into(),
            columns,
            id_column: id_column.into(),
            timestamp_column,
            backoff,
        }
    }

    fn parse_table(&self, body: &str) -> Result<Vec<Record>, SourceError> {
        let table_selector = Selector::parse(&self.table_selector)
            .map_err(|err| SourceError::Config(format!("table selector: {err}")))?;
        let row_selector = Selector::parse("tr").expect("static selector");
        let cell_selector = Selector::parse("td").expect("static selector");

        let id_index = self
            .columns
            .iter()
            .position(|c| c == &self.id_column)
            .ok_or_else(|| {
                SourceError::Config(format!("id column {} not in column list", self.id_column))
            })?;
        let timestamp_index = self
            .timestamp_column
            .as_ref()
            .and_then(|name| self.columns.iter().position(|c| c == name));

        let document = Html::parse_document(body);
        let table = document
            .select(&table_selector)
            .next()
            .ok_or_else(|| SourceError::Malformed(format!("no table matches {}", self.table_selector)))?;

        let mut records = Vec::new();
        for row in table.select(&row_selector) {
            let cells: Vec<String> = row
                .select(&cell_selector)
                .map(|cell| cell.text().collect::<String>().trim().to_string())
                .collect();
            if cells.is_empty() {
                // Header rows use <th>.
                continue;
            }
            if cells.len() != self.columns.len() {
                warn!(
                    source_id = self.source_id(),
                    expected = self.columns.len(),
                    got = cells.len(),
                    "skipping table row with wrong cell count"
                );
                continue;
            }
            let mut payload = BTreeMap::new();
            for (column, value) in self.columns.iter().zip(cells.iter()) {
                payload.insert(column.clone(), value.clone());
            }
            let timestamp = timestamp_index.and_then(|index| parse_timestamp(&cells[index]));
            records.push(Record {
                id: cells[id_index].clone(),
                timestamp,
                payload,
            });
        }
        Ok(drop_empty_ids(self.source_id(), records))
    }
}

#[async_trait]
impl SourceAdapter for HtmlTableSource {
    fn source_id(&self) -> &str {
        "html-table"
    }

    async fn fetch_page(
        &self,
        cursor: Option<&str>,
        _filters: &FetchFilters,
    ) -> Result<SourcePage, SourceError> {
        if cursor.is_some() {
            return Ok(SourcePage::default());
        }

        let attempts = self.backoff.max_retries + 1;
        let mut last_message = String::new();
        for attempt in 0..attempts {
            let response = self.client.get(&self.url).send().await;
            match response {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let body = response
                            .text()
                            .await
                            .map_err(|err| SourceError::Malformed(err.to_string()))?;
                        return Ok(SourcePage {
                            records: self.parse_table(&body)?,
                            next_cursor: None,
                        });
                    }
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt + 1 < attempts
                    {
                        last_message = format!("http {status}");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(SourceError::Status {
                        status: status.as_u16(),
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt + 1 < attempts
                    {
                        last_message = err.to_string();
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(SourceError::Exhausted {
                        attempts: attempt + 1,
                        message: err.to_string(),
                    });
                }
            }
        }
        Err(SourceError::Exhausted {
            attempts,
            message: last_message,
        })
    }
}

// ---------------------------------------------------------------------------
// Sinks
// ---------------------------------------------------------------------------

/// Fire-and-forget JSON POST of the flat payload to a webhook relay.
pub struct WebhookSink {
    client: reqwest::Client,
    url: String,
    id_field: String,
}

impl WebhookSink {
    pub fn new(client: reqwest::Client, url: impl Into<String>, id_field: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
            id_field: id_field.into(),
        }
    }
}

#[async_trait]
impl SinkAdapter for WebhookSink {
    fn sink_id(&self) -> &str {
        "webhook"
    }

    async fn send(&self, record: &Record) -> Result<SinkStatus, SinkError> {
        let mut body = record.payload.clone();
        body.entry(self.id_field.clone())
            .or_insert_with(|| record.id.clone());

        let response = self.client.post(&self.url).json(&body).send().await?;
        Ok(classify_sink_status(response.status()))
    }
}

/// Append-style tabular sink. The appended row's first column is the record
/// id (the post-hoc dedup key); the rest come from the configured payload
/// fields, absent ones as empty cells.
pub struct SheetSink {
    client: reqwest::Client,
    append_url: String,
    token: Option<String>,
    columns: Vec<String>,
}

impl SheetSink {
    pub fn new(
        client: reqwest::Client,
        append_url: impl Into<String>,
        token: Option<String>,
        columns: Vec<String>,
    ) -> Self {
        Self {
            client,
            append_url: append_url.into(),
            token,
            columns,
        }
    }
}

pub fn sheet_row(record: &Record, columns: &[String]) -> Vec<String> {
    let mut row = Vec::with_capacity(columns.len() + 1);
    row.push(record.id.clone());
    for column in columns {
        row.push(record.payload.get(column).cloned().unwrap_or_default());
    }
    row
}

#[async_trait]
impl SinkAdapter for SheetSink {
    fn sink_id(&self) -> &str {
        "sheet"
    }

    async fn send(&self, record: &Record) -> Result<SinkStatus, SinkError> {
        let body = serde_json::json!({ "values": [sheet_row(record, &self.columns)] });
        let mut request = self.client.post(&self.append_url).json(&body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;
        Ok(classify_sink_status(response.status()))
    }
}

// ---------------------------------------------------------------------------
// Config specs + factories
// ---------------------------------------------------------------------------

fn default_page_limit() -> u32 {
    1000
}

fn default_id_field() -> String {
    "conversation_id".to_string()
}

fn default_timestamp_field() -> String {
    "created_at".to_string()
}

fn default_delimiter() -> char {
    '|'
}

fn default_cli_timeout_secs() -> u64 {
    120
}

fn default_table_selector() -> String {
    "table".to_string()
}

/// One polymorphic source capability; the variant is chosen by flow config,
/// not by copy-pasting a pipeline per upstream.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum SourceSpec {
    Api {
        endpoint: String,
        api_key_env: String,
        #[serde(default)]
        flow_type: Option<String>,
        #[serde(default = "default_page_limit")]
        page_limit: u32,
        #[serde(default = "default_id_field")]
        id_field: String,
        #[serde(default = "default_timestamp_field")]
        timestamp_field: String,
    },
    Warehouse {
        database_url_env: String,
        query_path: PathBuf,
        columns: Vec<String>,
        id_column: String,
        #[serde(default)]
        timestamp_column: Option<String>,
    },
    QueryCli {
        program: String,
        #[serde(default)]
        args: Vec<String>,
        query_path: PathBuf,
        #[serde(default = "default_delimiter")]
        delimiter: char,
        columns: Vec<String>,
        id_column: String,
        #[serde(default)]
        timestamp_column: Option<String>,
        #[serde(default = "default_cli_timeout_secs")]
        timeout_secs: u64,
    },
    HtmlTable {
        url: String,
        #[serde(default = "default_table_selector")]
        table_selector: String,
        columns: Vec<String>,
        id_column: String,
        #[serde(default)]
        timestamp_column: Option<String>,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum SinkSpec {
    Webhook {
        url_env: String,
        #[serde(default = "default_id_field")]
        id_field: String,
    },
    Sheet {
        append_url_env: String,
        #[serde(default)]
        token_env: Option<String>,
        columns: Vec<String>,
    },
}

fn required_env(name: &str) -> anyhow::Result<String> {
    std::env::var(name).with_context(|| format!("environment variable {name} not set"))
}

pub fn source_for_spec(
    spec: &SourceSpec,
    http_timeout: Duration,
    user_agent: Option<&str>,
    backoff: BackoffPolicy,
) -> anyhow::Result<Arc<dyn SourceAdapter>> {
    match spec {
        SourceSpec::Api {
            endpoint,
            api_key_env,
            flow_type,
            page_limit,
            id_field,
            timestamp_field,
        } => {
            let api_key = required_env(api_key_env)?;
            Ok(Arc::new(ApiSource::new(
                http_client(http_timeout, user_agent)?,
                endpoint.clone(),
                api_key,
                flow_type.clone(),
                *page_limit,
                id_field.clone(),
                timestamp_field.clone(),
                backoff,
            )))
        }
        SourceSpec::Warehouse {
            database_url_env,
            query_path,
            columns,
            id_column,
            timestamp_column,
        } => {
            let database_url = required_env(database_url_env)?;
            let pool = WarehouseSource::connect(&database_url)?;
            let query = std::fs::read_to_string(query_path)
                .with_context(|| format!("reading query file {}", query_path.display()))?;
            Ok(Arc::new(WarehouseSource::new(
                pool,
                query,
                columns.clone(),
                id_column.clone(),
                timestamp_column.clone(),
                backoff,
            )))
        }
        SourceSpec::QueryCli {
            program,
            args,
            query_path,
            delimiter,
            columns,
            id_column,
            timestamp_column,
            timeout_secs,
        } => Ok(Arc::new(QueryCliSource::new(
            program.clone(),
            args.clone(),
            query_path.clone(),
            TabularContract {
                delimiter: *delimiter,
                columns: columns.clone(),
                id_column: id_column.clone(),
                timestamp_column: timestamp_column.clone(),
            },
            Duration::from_secs(*timeout_secs),
            backoff,
        ))),
        SourceSpec::HtmlTable {
            url,
            table_selector,
            columns,
            id_column,
            timestamp_column,
        } => Ok(Arc::new(HtmlTableSource::new(
            http_client(http_timeout, user_agent)?,
            url.clone(),
            table_selector.clone(),
            columns.clone(),
            id_column.clone(),
            timestamp_column.clone(),
            backoff,
        ))),
    }
}

pub fn sink_for_spec(
    spec: &SinkSpec,
    http_timeout: Duration,
    user_agent: Option<&str>,
) -> anyhow::Result<Arc<dyn SinkAdapter>> {
    match spec {
        SinkSpec::Webhook { url_env, id_field } => {
            let url = required_env(url_env)?;
            Ok(Arc::new(WebhookSink::new(
                http_client(http_timeout, user_agent)?,
                url,
                id_field.clone(),
            )))
        }
        SinkSpec::Sheet {
            append_url_env,
            token_env,
            columns,
        } => {
            let append_url = required_env(append_url_env)?;
            let token = token_env.as_deref().map(required_env).transpose()?;
            Ok(Arc::new(SheetSink::new(
                http_client(http_timeout, user_agent)?,
                append_url,
                token,
                columns.clone(),
            )))
        }
    }
}
