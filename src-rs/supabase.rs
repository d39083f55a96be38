use anyhow::{anyhow, Context};
use bytes::Bytes;
use reqwest::{
    header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE},
    Method, RequestBuilder,
};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

/// Thin client over the PostgREST (`/rest/v1`) and Storage (`/storage/v1`)
/// endpoints, authenticated with the service-role key.
#[derive(Clone)]
pub struct SupabaseClient {
    base_url: String,
    http: reqwest::Client,
}

/// PostgREST filter pairs such as `("id", "eq.abc")`.
pub type Filters<'a> = &'a [(&'a str, String)];

impl SupabaseClient {
    pub fn new(base_url: String, service_role_key: &str) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            "apikey",
            HeaderValue::from_str(service_role_key)
                .context("invalid SUPABASE_SERVICE_ROLE_KEY for header")?,
        );
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", service_role_key))
                .context("invalid SUPABASE_SERVICE_ROLE_KEY for header")?,
        );

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .context("failed to create Supabase HTTP client")?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    pub async fn select<T: DeserializeOwned>(
        &self,
        table: &str,
        filters: Filters<'_>,
    ) -> anyhow::Result<Vec<T>> {
        let request = self.rest(Method::GET, table).query(filters);
        let value = send(request, "select", table).await?;
        decode(value, "select", table)
    }

    pub async fn select_one<T: DeserializeOwned>(
        &self,
        table: &str,
        filters: Filters<'_>,
    ) -> anyhow::Result<Option<T>> {
        let mut filters = filters.to_vec();
        filters.push(("limit", "1".to_string()));
        let rows: Vec<T> = self.select(table, &filters).await?;
        Ok(rows.into_iter().next())
    }

    pub async fn insert<B: Serialize, T: DeserializeOwned>(
        &self,
        table: &str,
        body: &B,
    ) -> anyhow::Result<Vec<T>> {
        let request = self
            .rest(Method::POST, table)
            .header("Prefer", "return=representation")
            .json(body);
        let value = send(request, "insert", table).await?;
        decode(value, "insert", table)
    }

    /// Insert that silently skips rows whose primary/unique key already exists.
    pub async fn insert_ignore_duplicates<B: Serialize>(
        &self,
        table: &str,
        body: &B,
        on_conflict: &str,
    ) -> anyhow::Result<()> {
        let request = self
            .rest(Method::POST, table)
            .query(&[("on_conflict", on_conflict)])
            .header("Prefer", "resolution=ignore-duplicates,return=minimal")
            .json(body);
        send(request, "insert", table).await.map(|_| ())
    }

    pub async fn update<B: Serialize, T: DeserializeOwned>(
        &self,
        table: &str,
        filters: Filters<'_>,
        patch: &B,
    ) -> anyhow::Result<Vec<T>> {
        let request = self
            .rest(Method::PATCH, table)
            .query(filters)
            .header("Prefer", "return=representation")
            .json(patch);
        let value = send(request, "update", table).await?;
        decode(value, "update", table)
    }

    pub async fn delete(&self, table: &str, filters: Filters<'_>) -> anyhow::Result<()> {
        let request = self.rest(Method::DELETE, table).query(filters);
        send(request, "delete", table).await.map(|_| ())
    }

    pub async fn rpc<T: DeserializeOwned>(&self, function: &str, args: Value) -> anyhow::Result<T> {
        let endpoint = format!("{}/rest/v1/rpc/{}", self.base_url, function);
        let request = self.http.post(endpoint).json(&args);
        let value = send(request, "rpc", function).await?;
        decode(value, "rpc", function)
    }

    pub async fn upload_object(
        &self,
        bucket: &str,
        path: &str,
        content_type: &str,
        body: Bytes,
    ) -> anyhow::Result<()> {
        let endpoint = format!("{}/storage/v1/object/{}/{}", self.base_url, bucket, path);
        let request = self
            .http
            .post(endpoint)
            .header(CONTENT_TYPE, content_type)
            .header("x-upsert", "false")
            .body(body);
        send(request, "upload", bucket).await.map(|_| ())
    }

    pub fn public_object_url(&self, bucket: &str, path: &str) -> String {
        format!(
            "{}/storage/v1/object/public/{}/{}",
            self.base_url, bucket, path
        )
    }

    fn rest(&self, method: Method, table: &str) -> RequestBuilder {
        self.http
            .request(method, format!("{}/rest/v1/{}", self.base_url, table))
    }
}

pub fn eq(value: impl std::fmt::Display) -> String {
    format!("eq.{}", value)
}

async fn send(request: RequestBuilder, kind: &str, target: &str) -> anyhow::Result<Value> {
    let response = request
        .send()
        .await
        .with_context(|| format!("Supabase {} request failed for {}", kind, target))?;

    let status = response.status();
    let text = response
        .text()
        .await
        .with_context(|| format!("failed to read Supabase {} response for {}", kind, target))?;

    if !status.is_success() {
        let message = serde_json::from_str::<Value>(&text)
            .ok()
            .and_then(|body| {
                body.get("message")
                    .and_then(Value::as_str)
                    .map(ToString::to_string)
            })
            .unwrap_or(text);
        return Err(anyhow!(
            "Supabase {} HTTP error {} for {}: {}",
            kind,
            status,
            target,
            message
        ));
    }

    if text.trim().is_empty() {
        return Ok(Value::Null);
    }

    serde_json::from_str(&text)
        .with_context(|| format!("failed to parse Supabase {} response for {}", kind, target))
}

fn decode<T: DeserializeOwned>(value: Value, kind: &str, target: &str) -> anyhow::Result<T> {
    serde_json::from_value(value)
        .with_context(|| format!("failed to decode Supabase {} result for {}", kind, target))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;
    use wiremock::{
        matchers::{body_json, header, method, path, query_param},
        Mock, MockServer, ResponseTemplate,
    };

    #[derive(Debug, Deserialize)]
    struct Row {
        id: String,
    }

    #[tokio::test]
    async fn select_sends_filters_and_service_key() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/generation_tasks"))
            .and(query_param("id", "eq.task-1"))
            .and(header("apikey", "service-key"))
            .and(header("authorization", "Bearer service-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{ "id": "task-1" }])))
            .mount(&server)
            .await;

        let client = SupabaseClient::new(server.uri(), "service-key").unwrap();
        let row: Option<Row> = client
            .select_one("generation_tasks", &[("id", eq("task-1"))])
            .await
            .unwrap();
        assert_eq!(row.unwrap().id, "task-1");
    }

    #[tokio::test]
    async fn rpc_posts_arguments_and_surfaces_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rest/v1/rpc/refund_task_credits"))
            .and(body_json(json!({ "p_task_id": "t1" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!(12)))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/rest/v1/rpc/broken"))
            .respond_with(
                ResponseTemplate::new(400).set_body_json(json!({ "message": "boom" })),
            )
            .mount(&server)
            .await;

        let client = SupabaseClient::new(server.uri(), "k").unwrap();
        let refunded: i64 = client
            .rpc("refund_task_credits", json!({ "p_task_id": "t1" }))
            .await
            .unwrap();
        assert_eq!(refunded, 12);

        let error = client
            .rpc::<Value>("broken", json!({}))
            .await
            .unwrap_err()
            .to_string();
        assert!(error.contains("boom"), "{error}");
    }

    #[tokio::test]
    async fn upload_object_posts_bytes_without_upsert() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/storage/v1/object/uploads/u1/a.png"))
            .and(header("content-type", "image/png"))
            .and(header("x-upsert", "false"))
            .and(header("authorization", "Bearer k"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "Key": "uploads/u1/a.png" })),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/storage/v1/object/uploads/u1/dup.png"))
            .respond_with(ResponseTemplate::new(409).set_body_json(json!({
                "message": "The resource already exists"
            })))
            .mount(&server)
            .await;

        let client = SupabaseClient::new(server.uri(), "k").unwrap();
        client
            .upload_object("uploads", "u1/a.png", "image/png", Bytes::from_static(b"\x89PNG"))
            .await
            .unwrap();

        let error = client
            .upload_object("uploads", "u1/dup.png", "image/png", Bytes::from_static(b"x"))
            .await
            .unwrap_err()
            .to_string();
        assert!(error.contains("already exists"), "{error}");
    }

    #[test]
    fn public_url_is_built_from_bucket_and_path() {
        let client = SupabaseClient::new("https://proj.supabase.co/".to_string(), "k").unwrap();
        assert_eq!(
            client.public_object_url("uploads", "u1/a.png"),
            "https://proj.supabase.co/storage/v1/object/public/uploads/u1/a.png"
        );
    }
}
