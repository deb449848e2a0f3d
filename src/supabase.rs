//! PostgREST client for the Supabase projects.
//!
//! One `SupabaseClient` talks to one project. The shop's own project and the
//! external store differ only in table and column names, which come from the
//! client's `StoreSource`.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use reqwest::{Client, Method, StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::checkout::{DebtRecord, SaleRecord};
use crate::error::{PosError, PosResult};
use crate::ledger::{CashTransaction, PaymentSource};
use crate::reconcile::{adapt_rows, StoreSource};
use crate::store::{LedgerStore, SalesStore, TransactionQuery};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);

/// Rows requested per GET. Matches the `max-rows` cap of a stock Supabase
/// project, so a page shorter than this is the last one.
pub const DEFAULT_PAGE_SIZE: usize = 1000;

const PAYMENT_SOURCES_TABLE: &str = "payment_sources";
const SALES_TABLE: &str = "sales";
const DEBTS_TABLE: &str = "customer_debts";

// ---------------------------------------------------------------------------
// URL normalisation and connection strings
// ---------------------------------------------------------------------------

/// Normalise a project URL:
/// - ensure a scheme is present (https, or http for localhost)
/// - strip trailing slashes and a trailing `/rest/v1`
pub fn normalize_base_url(url: &str) -> String {
    let mut url = url.trim().to_string();

    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    while url.ends_with('/') {
        url.pop();
    }
    if url.ends_with("/rest/v1") {
        url.truncate(url.len() - "/rest/v1".len());
    }
    while url.ends_with('/') {
        url.pop();
    }

    url
}

/// URL and anon key of one project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub url: String,
    pub key: String,
}

fn decode_connection_payload(raw: &str) -> Option<Value> {
    let compact: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.starts_with('{') {
        return serde_json::from_str::<Value>(&compact).ok();
    }
    if compact.len() < 20 {
        return None;
    }

    let base64 = compact.replace('-', "+").replace('_', "/");
    let padded = format!(
        "{}{}",
        base64,
        "=".repeat((4usize.wrapping_sub(base64.len() % 4)) % 4)
    );
    let decoded = BASE64_STANDARD.decode(padded).ok()?;
    serde_json::from_slice::<Value>(&decoded).ok()
}

/// Decode a connection string: either JSON `{"url", "key"}` or the same
/// JSON in base64 (standard or URL-safe, padding optional).
pub fn decode_connection_string(raw: &str) -> Option<Credentials> {
    let payload = decode_connection_payload(raw)?;
    let field = |name: &str| {
        payload
            .get(name)
            .and_then(Value::as_str)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    };
    Some(Credentials {
        url: normalize_base_url(&field("url")?),
        key: field("key")?,
    })
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct PostgrestErrorBody {
    code: Option<String>,
    message: Option<String>,
    details: Option<String>,
    hint: Option<String>,
}

/// Map a non-success response into `PosError::Backend`, keeping the
/// PostgREST error code when the body carries one.
fn status_error(status: StatusCode, body: &str) -> PosError {
    let parsed = serde_json::from_str::<PostgrestErrorBody>(body).unwrap_or_default();
    let message = parsed
        .message
        .filter(|m| !m.is_empty())
        .map(|m| match (parsed.details.as_deref(), parsed.hint.as_deref()) {
            (Some(details), _) if !details.is_empty() => format!("{m} ({details})"),
            (_, Some(hint)) if !hint.is_empty() => format!("{m} (hint: {hint})"),
            _ => m,
        })
        .unwrap_or_else(|| match status.as_u16() {
            401 => "API key is invalid or expired".to_string(),
            403 => "Access to this table is not allowed".to_string(),
            404 => "Table or endpoint not found".to_string(),
            s if s >= 500 => format!("Server error (HTTP {s})"),
            s => format!("Unexpected response (HTTP {s})"),
        });
    PosError::Backend {
        status: status.as_u16(),
        code: parsed.code,
        message,
    }
}

fn transport_error(url: &str, err: reqwest::Error) -> PosError {
    if err.is_connect() {
        return PosError::Network(format!("Cannot reach {url}"));
    }
    if err.is_timeout() {
        return PosError::Network(format!("Connection to {url} timed out"));
    }
    if err.is_builder() {
        return PosError::config(format!("Invalid backend URL: {url}"));
    }
    PosError::from(err)
}

// ---------------------------------------------------------------------------
// Query building
// ---------------------------------------------------------------------------

/// PostgREST filter pairs for a transaction fetch, newest first. The id
/// tie-break keeps the order stable across pages.
pub fn transaction_params(
    source: StoreSource,
    query: &TransactionQuery,
) -> Vec<(String, String)> {
    let date_col = source.date_column();
    let mut params = vec![("select".to_string(), "*".to_string())];
    if let Some(branch) = &query.branch_id {
        params.push(("branch_id".to_string(), format!("eq.{branch}")));
    }
    if let Some(ps) = query.payment_source_id {
        params.push((source.source_column().to_string(), format!("eq.{}", ps.as_str())));
    }
    if let Some(since) = query.since {
        params.push((date_col.to_string(), format!("gte.{}", since.to_rfc3339())));
    }
    if let Some(until) = query.until {
        params.push((date_col.to_string(), format!("lt.{}", until.to_rfc3339())));
    }
    params.push(("order".to_string(), format!("{date_col}.desc,id.desc")));
    params
}

/// Insert body for a transaction in the given store's column layout.
pub fn transaction_row(source: StoreSource, tx: &CashTransaction) -> PosResult<Value> {
    match source {
        StoreSource::Local => Ok(serde_json::to_value(tx)?),
        // The external table assigns its own numeric ids.
        StoreSource::External => Ok(json!({
            "transaction_type": tx.kind.as_str(),
            "amount": tx.amount,
            "branch_id": tx.branch_id,
            "payment_source": tx.payment_source_id.as_str(),
            "created_at": tx.date.to_rfc3339(),
            "category": tx.category,
            "description": tx.notes,
        })),
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct SupabaseClient {
    base_url: String,
    anon_key: String,
    source: StoreSource,
    label: String,
    page_size: usize,
    http: Client,
}

impl SupabaseClient {
    pub fn new(base_url: &str, anon_key: &str, source: StoreSource) -> PosResult<Self> {
        let base_url = normalize_base_url(base_url);
        let anon_key = anon_key.trim().to_string();
        if anon_key.is_empty() {
            return Err(PosError::config(format!(
                "Missing anon key for the {} backend",
                source.as_str()
            )));
        }
        Url::parse(&base_url)
            .map_err(|e| PosError::config(format!("Invalid backend URL {base_url}: {e}")))?;
        let http = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| PosError::config(format!("HTTP client error: {e}")))?;
        Ok(Self {
            label: format!("{} ({base_url})", source.as_str()),
            base_url,
            anon_key,
            source,
            page_size: DEFAULT_PAGE_SIZE,
            http,
        })
    }

    /// Lower the page size for projects configured with a smaller `max-rows`.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn from_credentials(credentials: &Credentials, source: StoreSource) -> PosResult<Self> {
        Self::new(&credentials.url, &credentials.key, source)
    }

    pub fn source(&self) -> StoreSource {
        self.source
    }

    fn endpoint(&self, table: &str, params: &[(String, String)]) -> PosResult<Url> {
        let mut url = Url::parse(&format!("{}/rest/v1/{table}", self.base_url))
            .map_err(|e| PosError::config(format!("Invalid backend URL: {e}")))?;
        if !params.is_empty() {
            let mut qp = url.query_pairs_mut();
            for (k, v) in params {
                qp.append_pair(k, v);
            }
        }
        Ok(url)
    }

    async fn send(&self, method: Method, url: Url, body: Option<&Value>) -> PosResult<Value> {
        let mut req = self
            .http
            .request(method.clone(), url.clone())
            .header("apikey", &self.anon_key)
            .header("Authorization", format!("Bearer {}", self.anon_key))
            .header("Content-Type", "application/json");
        if let Some(body) = body {
            req = req.header("Prefer", "return=representation").json(body);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| transport_error(&self.base_url, e))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let err = status_error(status, &text);
            warn!(
                backend = %self.label,
                method = %method,
                path = url.path(),
                status = status.as_u16(),
                error = %err,
                "PostgREST request failed"
            );
            return Err(err);
        }

        let text = resp
            .text()
            .await
            .map_err(|e| transport_error(&self.base_url, e))?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&text)?)
    }

    /// Fetch every matching row, one `limit`/`offset` page at a time until a
    /// short page comes back.
    pub async fn get_rows(
        &self,
        table: &str,
        params: &[(String, String)],
    ) -> PosResult<Vec<Value>> {
        let mut rows: Vec<Value> = Vec::new();
        let mut pages = 0usize;
        loop {
            let mut page_params = params.to_vec();
            page_params.push(("limit".to_string(), self.page_size.to_string()));
            page_params.push(("offset".to_string(), rows.len().to_string()));
            let url = self.endpoint(table, &page_params)?;
            let page = match self.send(Method::GET, url, None).await? {
                Value::Array(page) => page,
                other => {
                    return Err(PosError::Serialization(format!(
                        "expected an array from {table}, got {}",
                        value_kind(&other)
                    )))
                }
            };
            pages += 1;
            let last = page.len() < self.page_size;
            rows.extend(page);
            if last {
                break;
            }
        }
        debug!(backend = %self.label, table, pages, count = rows.len(), "Fetched rows");
        Ok(rows)
    }

    pub async fn insert_row(&self, table: &str, row: &Value) -> PosResult<Value> {
        let url = self.endpoint(table, &[])?;
        self.send(Method::POST, url, Some(row)).await
    }
}

fn value_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[async_trait]
impl LedgerStore for SupabaseClient {
    fn label(&self) -> &str {
        &self.label
    }

    async fn fetch_transactions(
        &self,
        query: &TransactionQuery,
    ) -> PosResult<Vec<CashTransaction>> {
        let params = transaction_params(self.source, query);
        let rows = self.get_rows(self.source.table(), &params).await?;
        let (txs, skipped) = adapt_rows(self.source, rows);
        if skipped > 0 {
            warn!(backend = %self.label, skipped, "Some transaction rows could not be read");
        }
        Ok(txs)
    }

    async fn fetch_payment_sources(&self) -> PosResult<Vec<PaymentSource>> {
        let params = [("select".to_string(), "id,balance".to_string())];
        let rows = self.get_rows(PAYMENT_SOURCES_TABLE, &params).await?;
        let mut sources = Vec::with_capacity(rows.len());
        for row in rows {
            let parsed = serde_json::from_value::<PaymentSource>(row)
                .map_err(PosError::from)
                .and_then(|source| source.validate().map(|()| source));
            match parsed {
                Ok(source) => sources.push(source),
                Err(e) => {
                    warn!(backend = %self.label, error = %e, "Skipping unreadable payment source")
                }
            }
        }
        Ok(sources)
    }

    async fn insert_transaction(&self, tx: &CashTransaction) -> PosResult<()> {
        let row = transaction_row(self.source, tx)?;
        self.insert_row(self.source.table(), &row).await?;
        info!(
            backend = %self.label,
            transaction_id = %tx.id,
            kind = tx.kind.as_str(),
            amount = %tx.amount,
            "Transaction recorded"
        );
        Ok(())
    }
}

#[async_trait]
impl SalesStore for SupabaseClient {
    async fn create_sale(&self, sale: &SaleRecord) -> PosResult<()> {
        let row = serde_json::to_value(sale)?;
        self.insert_row(SALES_TABLE, &row).await?;
        Ok(())
    }

    async fn create_debt(&self, debt: &DebtRecord) -> PosResult<()> {
        let row = serde_json::to_value(debt)?;
        self.insert_row(DEBTS_TABLE, &row).await?;
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{PaymentSourceId, TransactionType};
    use base64::Engine as _;
    use chrono::{TimeZone, Utc};
    use rust_decimal::Decimal;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::task::JoinHandle;

    #[test]
    fn test_normalize_base_url() {
        assert_eq!(
            normalize_base_url("abc.supabase.co/"),
            "https://abc.supabase.co"
        );
        assert_eq!(
            normalize_base_url("https://abc.supabase.co/rest/v1/"),
            "https://abc.supabase.co"
        );
        assert_eq!(normalize_base_url("localhost:54321"), "http://localhost:54321");
    }

    #[test]
    fn test_decode_connection_string_json_and_base64() {
        let raw = r#"{"url": "abc.supabase.co", "key": " anon-key "}"#;
        let creds = decode_connection_string(raw).unwrap();
        assert_eq!(creds.url, "https://abc.supabase.co");
        assert_eq!(creds.key, "anon-key");

        let encoded = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(raw);
        assert_eq!(decode_connection_string(&encoded), Some(creds));

        assert!(decode_connection_string("short").is_none());
        assert!(decode_connection_string(r#"{"url":"x.co"}"#).is_none());
    }

    #[test]
    fn test_status_error_keeps_postgrest_code() {
        let body = r#"{"code":"42501",
            "message":"new row violates row-level security policy",
            "details":null,"hint":null}"#;
        let err = status_error(StatusCode::BAD_REQUEST, body);
        assert!(err.is_permission_denied());
        match err {
            PosError::Backend { status, code, message } => {
                assert_eq!(status, 400);
                assert_eq!(code.as_deref(), Some("42501"));
                assert!(message.contains("row-level security"));
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let err = status_error(StatusCode::BAD_GATEWAY, "<html>bad gateway</html>");
        assert_eq!(err.user_message(), "Store database is unavailable (HTTP 502)");
    }

    #[test]
    fn test_transaction_params_per_source() {
        let query = TransactionQuery {
            branch_id: Some("CN1".to_string()),
            payment_source_id: Some(PaymentSourceId::Bank),
            since: Some(Utc.with_ymd_and_hms(2024, 3, 14, 17, 0, 0).unwrap()),
            until: None,
        };
        let local = transaction_params(StoreSource::Local, &query);
        assert!(local.contains(&("branch_id".to_string(), "eq.CN1".to_string())));
        assert!(local.contains(&("payment_source_id".to_string(), "eq.bank".to_string())));
        assert!(local.contains(&("date".to_string(), "gte.2024-03-14T17:00:00+00:00".to_string())));
        assert_eq!(local.last().unwrap(), &("order".to_string(), "date.desc".to_string()));

        let external = transaction_params(StoreSource::External, &TransactionQuery::default());
        assert_eq!(
            external,
            vec![
                ("select".to_string(), "*".to_string()),
                ("order".to_string(), "created_at.desc".to_string()),
            ]
        );
    }

    #[test]
    fn test_transaction_row_layouts() {
        let tx = CashTransaction {
            id: "t1".to_string(),
            kind: TransactionType::Expense,
            amount: Decimal::from(200_000),
            branch_id: "CN1".to_string(),
            payment_source_id: PaymentSourceId::Cash,
            date: Utc.with_ymd_and_hms(2024, 3, 15, 3, 0, 0).unwrap(),
            category: "rent".to_string(),
            notes: Some("March".to_string()),
        };
        let local = transaction_row(StoreSource::Local, &tx).unwrap();
        assert_eq!(local["type"], "expense");
        assert_eq!(local["payment_source_id"], "cash");

        let external = transaction_row(StoreSource::External, &tx).unwrap();
        assert!(external.get("id").is_none());
        assert_eq!(external["transaction_type"], "expense");
        assert_eq!(external["payment_source"], "cash");
        assert_eq!(external["description"], "March");
    }

    #[test]
    fn test_client_rejects_missing_key() {
        let err = SupabaseClient::new("abc.supabase.co", " ", StoreSource::Local)
            .err()
            .unwrap();
        assert!(matches!(err, PosError::Config(_)));
    }

    /// Answer one request on `socket` and return its raw head.
    async fn respond(mut socket: TcpStream, status: &str, body: &str) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = socket.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
        }
        let response = format!(
            "HTTP/1.1 {status}\r\nContent-Type: application/json\r\n\
             Content-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );
        socket.write_all(response.as_bytes()).await.unwrap();
        socket.shutdown().await.ok();
        String::from_utf8_lossy(&buf).to_string()
    }

    /// Serve one canned HTTP response and hand back the raw request head.
    async fn serve_once(status: &'static str, body: &'static str) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            respond(socket, status, body).await
        });
        (format!("http://{addr}"), handle)
    }

    /// Serve `200 OK` pages in order, one connection each.
    async fn serve_pages(pages: Vec<&'static str>) -> (String, JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let mut heads = Vec::new();
            for body in pages {
                let (socket, _) = listener.accept().await.unwrap();
                heads.push(respond(socket, "200 OK", body).await);
            }
            heads
        });
        (format!("http://{addr}"), handle)
    }

    #[tokio::test]
    async fn test_fetch_transactions_adapts_external_rows() {
        let body = r#"[
            {"id": 7, "transaction_type": "income", "amount": 500000, "payment_source": "bank",
             "created_at": "2024-03-15T02:00:00+00:00", "description": "deposit"},
            {"id": 8, "transaction_type": "income", "amount": "oops"}
        ]"#;
        let (url, request) = serve_once("200 OK", body).await;
        let client = SupabaseClient::new(&url, "anon", StoreSource::External).unwrap();

        let txs = client
            .fetch_transactions(&TransactionQuery::default())
            .await
            .unwrap();
        assert_eq!(txs.len(), 1);
        assert_eq!(txs[0].id, "7");
        assert_eq!(txs[0].payment_source_id, PaymentSourceId::Bank);

        let head = request.await.unwrap();
        assert!(head.starts_with("GET /rest/v1/transactions?"));
        assert!(head.contains("order=created_at.desc"));
        assert!(head.to_lowercase().contains("apikey: anon"));
        assert!(head.contains("Bearer anon"));
    }

    #[tokio::test]
    async fn test_forbidden_response_maps_to_permission_denied() {
        let (url, _request) = serve_once(
            "403 Forbidden",
            r#"{"code":"42501","message":"permission denied for table cash_transactions"}"#,
        )
        .await;
        let client = SupabaseClient::new(&url, "anon", StoreSource::Local).unwrap();
        let err = client
            .fetch_transactions(&TransactionQuery::for_branch("CN1"))
            .await
            .unwrap_err();
        assert!(err.is_permission_denied());
        assert!(err.user_message().contains("row-level security"));
    }

    #[tokio::test]
    async fn test_fetch_transactions_reads_every_page() {
        let (url, requests) = serve_pages(vec![
            r#"[{"id": "a", "type": "income", "amount": "300000", "branch_id": "CN1",
                 "payment_source_id": "cash", "date": "2024-03-15T03:00:00Z"},
                {"id": "b", "type": "expense", "amount": "100000", "branch_id": "CN1",
                 "payment_source_id": "cash", "date": "2024-03-14T03:00:00Z"}]"#,
            r#"[{"id": "c", "type": "income", "amount": "50000", "branch_id": "CN1",
                 "payment_source_id": "cash", "date": "2024-03-13T03:00:00Z"}]"#,
        ])
        .await;
        let client = SupabaseClient::new(&url, "anon", StoreSource::Local)
            .unwrap()
            .with_page_size(2);

        let txs = client
            .fetch_transactions(&TransactionQuery::for_branch("CN1"))
            .await
            .unwrap();
        let ids: Vec<_> = txs.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        let net: Decimal = txs.iter().map(|t| t.signed_amount()).sum();
        assert_eq!(net, Decimal::from(250_000));

        let heads = requests.await.unwrap();
        assert_eq!(heads.len(), 2);
        assert!(heads[0].contains("limit=2&offset=0"));
        assert!(heads[1].contains("limit=2&offset=2"));
    }
}
