use anyhow::{anyhow, Context};
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{json, Map, Value};

use crate::{
    catalog::{MediaKind, ModelSpec, VendorEndpoint},
    provider::{GenerationProvider, GenerationRequest, ProviderError, VendorOutcome},
};

#[derive(Clone)]
pub struct KieClient {
    http: reqwest::Client,
    api_base: String,
    api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    code: i64,
    #[serde(default)]
    msg: Option<String>,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct CreatedTask {
    #[serde(rename = "taskId")]
    task_id: String,
}

/// Parsed vendor webhook.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallbackEvent {
    pub task_id: String,
    pub outcome: VendorOutcome,
}

impl KieClient {
    pub fn new(api_base: String, api_key: Option<String>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("failed to build KIE HTTP client")?;

        Ok(Self {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn require_api_key(&self) -> Result<&str, ProviderError> {
        self.api_key
            .as_deref()
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| ProviderError::NotConfigured("KIE_API_KEY is not set".to_string()))
    }

    async fn post<T: DeserializeOwned>(&self, path: &str, body: Value) -> Result<T, ProviderError> {
        let key = self.require_api_key()?;
        let url = format!("{}{}", self.api_base, path);
        let response = self
            .http
            .post(&url)
            .bearer_auth(key)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("KIE POST failed for {}", path))?;
        unwrap_envelope(response, path).await
    }

    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        task_id: &str,
    ) -> Result<T, ProviderError> {
        let key = self.require_api_key()?;
        let url = format!("{}{}", self.api_base, path);
        let response = self
            .http
            .get(&url)
            .bearer_auth(key)
            .query(&[("taskId", task_id)])
            .send()
            .await
            .with_context(|| format!("KIE GET failed for {}", path))?;
        unwrap_envelope(response, path).await
    }
}

async fn unwrap_envelope<T: DeserializeOwned>(
    response: reqwest::Response,
    path: &str,
) -> Result<T, ProviderError> {
    let status = response.status();
    let text = response
        .text()
        .await
        .with_context(|| format!("failed to read KIE response body for {}", path))?;

    let envelope: Envelope<T> = serde_json::from_str(&text).map_err(|error| {
        anyhow!(
            "failed to decode KIE response for {} (status {}): {}: {}",
            path,
            status,
            error,
            text
        )
    })?;

    if envelope.code != 200 {
        return Err(ProviderError::Rejected {
            code: envelope.code,
            message: envelope.msg.unwrap_or_else(|| "unknown error".to_string()),
        });
    }

    envelope
        .data
        .ok_or_else(|| ProviderError::Request(anyhow!("KIE response for {} had no data", path)))
}

fn jobs_payload(request: &GenerationRequest<'_>) -> Value {
    let mut input = Map::new();
    input.insert("prompt".to_string(), json!(request.prompt));
    if !request.image_urls.is_empty() {
        match request.model.kind {
            MediaKind::Image => {
                input.insert("image_urls".to_string(), json!(request.image_urls));
            }
            MediaKind::Video => {
                input.insert("image_url".to_string(), json!(request.image_urls[0]));
            }
        }
    }
    if let Some(ratio) = request.aspect_ratio {
        input.insert("aspect_ratio".to_string(), json!(ratio));
    }

    json!({
        "model": request.model.vendor_model,
        "callBackUrl": request.callback_url,
        "input": Value::Object(input),
    })
}

fn veo_payload(request: &GenerationRequest<'_>) -> Value {
    let mut body = json!({
        "prompt": request.prompt,
        "model": request.model.vendor_model,
        "callBackUrl": request.callback_url,
        "aspectRatio": request.aspect_ratio.unwrap_or("16:9"),
    });
    if !request.image_urls.is_empty() {
        body["imageUrls"] = json!(request.image_urls);
    }
    body
}

#[async_trait]
impl GenerationProvider for KieClient {
    async fn create_task(&self, request: GenerationRequest<'_>) -> Result<String, ProviderError> {
        let (path, body) = match request.model.endpoint {
            VendorEndpoint::Jobs => ("/api/v1/jobs/createTask", jobs_payload(&request)),
            VendorEndpoint::Veo => ("/api/v1/veo/generate", veo_payload(&request)),
        };
        let created: CreatedTask = self.post(path, body).await?;
        tracing::info!(
            task_id = %created.task_id,
            model = request.model.id,
            "KIE task created"
        );
        Ok(created.task_id)
    }

    async fn query_task(
        &self,
        model: &ModelSpec,
        task_id: &str,
    ) -> Result<VendorOutcome, ProviderError> {
        let path = match model.endpoint {
            VendorEndpoint::Jobs => "/api/v1/jobs/recordInfo",
            VendorEndpoint::Veo => "/api/v1/veo/record-info",
        };
        let data: Value = self.get(path, task_id).await?;
        Ok(outcome_from_data(200, None, &data))
    }
}

/// Parses the `{code, msg, data: {taskId, ...}}` webhook body.
pub fn parse_callback(body: &Value) -> anyhow::Result<CallbackEvent> {
    let data = body
        .get("data")
        .filter(|value| value.is_object())
        .ok_or_else(|| anyhow!("callback payload has no data object"))?;

    let task_id = data
        .get("taskId")
        .or_else(|| data.get("task_id"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| anyhow!("callback payload has no taskId"))?
        .to_string();

    let code = body.get("code").and_then(Value::as_i64).unwrap_or(200);
    let msg = body.get("msg").and_then(Value::as_str);

    Ok(CallbackEvent {
        task_id,
        outcome: outcome_from_data(code, msg, data),
    })
}

fn outcome_from_data(code: i64, msg: Option<&str>, data: &Value) -> VendorOutcome {
    if code != 200 {
        return VendorOutcome::Failed {
            message: failure_message(msg, data),
        };
    }

    if let Some(state) = data.get("state").and_then(Value::as_str) {
        return match state.to_ascii_lowercase().as_str() {
            "waiting" | "queuing" | "generating" => VendorOutcome::Processing,
            "success" => success_with(result_urls(data)),
            _ => VendorOutcome::Failed {
                message: failure_message(msg, data),
            },
        };
    }

    if let Some(flag) = data.get("successFlag").and_then(Value::as_i64) {
        return match flag {
            0 => VendorOutcome::Processing,
            1 => success_with(result_urls(data)),
            _ => VendorOutcome::Failed {
                message: failure_message(msg, data),
            },
        };
    }

    success_with(result_urls(data))
}

fn success_with(urls: Vec<String>) -> VendorOutcome {
    if urls.is_empty() {
        VendorOutcome::Failed {
            message: "generation finished without results".to_string(),
        }
    } else {
        VendorOutcome::Succeeded { urls }
    }
}

fn failure_message(msg: Option<&str>, data: &Value) -> String {
    ["failMsg", "errorMessage"]
        .iter()
        .filter_map(|key| data.get(*key).and_then(Value::as_str))
        .chain(msg)
        .map(str::trim)
        .find(|value| !value.is_empty())
        .unwrap_or("generation failed")
        .to_string()
}

fn result_urls(data: &Value) -> Vec<String> {
    let candidates = [
        data.pointer("/info/resultUrls"),
        data.pointer("/info/result_urls"),
        data.pointer("/response/resultUrls"),
        data.get("resultUrls"),
    ];
    for candidate in candidates.into_iter().flatten() {
        let urls = string_list(candidate);
        if !urls.is_empty() {
            return urls;
        }
    }

    data.get("resultJson")
        .and_then(Value::as_str)
        .and_then(|raw| serde_json::from_str::<Value>(raw).ok())
        .and_then(|parsed| parsed.get("resultUrls").map(string_list))
        .unwrap_or_default()
}

fn string_list(value: &Value) -> Vec<String> {
    value
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .filter(|url| !url.trim().is_empty())
                .map(ToString::to_string)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::find_model;
    use wiremock::{
        matchers::{body_partial_json, header, method, path, query_param},
        Mock, MockServer, ResponseTemplate,
    };

    #[test]
    fn parses_jobs_success_callback() {
        let body = json!({
            "code": 200,
            "msg": "ok",
            "data": {
                "taskId": "abc",
                "state": "success",
                "resultJson": "{\"resultUrls\":[\"https://cdn/x.png\"]}"
            }
        });
        let event = parse_callback(&body).unwrap();
        assert_eq!(event.task_id, "abc");
        assert_eq!(
            event.outcome,
            VendorOutcome::Succeeded {
                urls: vec!["https://cdn/x.png".to_string()]
            }
        );
    }

    #[test]
    fn parses_veo_success_and_failure_callbacks() {
        let ok = json!({
            "code": 200,
            "data": { "taskId": "v1", "info": { "resultUrls": ["https://cdn/v.mp4"] } }
        });
        assert!(matches!(
            parse_callback(&ok).unwrap().outcome,
            VendorOutcome::Succeeded { .. }
        ));

        let failed = json!({ "code": 501, "msg": "content policy", "data": { "taskId": "v2" } });
        assert_eq!(
            parse_callback(&failed).unwrap().outcome,
            VendorOutcome::Failed {
                message: "content policy".to_string()
            }
        );
    }

    #[test]
    fn success_without_urls_is_failure_and_progress_states_map() {
        let empty = json!({ "code": 200, "data": { "taskId": "a", "state": "success" } });
        assert!(matches!(
            parse_callback(&empty).unwrap().outcome,
            VendorOutcome::Failed { .. }
        ));

        for state in ["waiting", "queuing", "generating", "QUEUING"] {
            let progress = json!({ "code": 200, "data": { "taskId": "a", "state": state } });
            assert_eq!(
                parse_callback(&progress).unwrap().outcome,
                VendorOutcome::Processing,
                "{state}"
            );
        }

        let fail = json!({
            "code": 200,
            "data": { "taskId": "a", "state": "fail", "failMsg": "nsfw" }
        });
        assert_eq!(
            parse_callback(&fail).unwrap().outcome,
            VendorOutcome::Failed {
                message: "nsfw".to_string()
            }
        );
    }

    #[test]
    fn rejects_payload_without_task_id() {
        assert!(parse_callback(&json!({ "code": 200, "data": {} })).is_err());
        assert!(parse_callback(&json!({ "code": 200 })).is_err());
    }

    #[tokio::test]
    async fn create_task_posts_jobs_payload() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/jobs/createTask"))
            .and(header("authorization", "Bearer kie-key"))
            .and(body_partial_json(json!({
                "model": "google/nano-banana-edit",
                "callBackUrl": "https://app/api/callback/kie",
                "input": { "prompt": "make it blue", "image_urls": ["https://img/1.png"] }
            })))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({
                    "code": 200,
                    "msg": "success",
                    "data": { "taskId": "task-42" }
                })),
            )
            .mount(&server)
            .await;

        let client = KieClient::new(server.uri(), Some("kie-key".to_string())).unwrap();
        let images = vec!["https://img/1.png".to_string()];
        let task_id = client
            .create_task(GenerationRequest {
                model: find_model("nano-banana-edit").unwrap(),
                prompt: "make it blue",
                image_urls: &images,
                aspect_ratio: None,
                callback_url: "https://app/api/callback/kie",
            })
            .await
            .unwrap();
        assert_eq!(task_id, "task-42");
    }

    #[tokio::test]
    async fn vendor_error_code_becomes_rejection() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/veo/generate"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({
                    "code": 402,
                    "msg": "insufficient balance",
                    "data": null
                })),
            )
            .mount(&server)
            .await;

        let client = KieClient::new(server.uri(), Some("k".to_string())).unwrap();
        let error = client
            .create_task(GenerationRequest {
                model: find_model("veo3-fast").unwrap(),
                prompt: "waves",
                image_urls: &[],
                aspect_ratio: Some("9:16"),
                callback_url: "https://app/cb",
            })
            .await
            .unwrap_err();
        assert!(matches!(error, ProviderError::Rejected { code: 402, .. }));
    }

    #[tokio::test]
    async fn query_task_reads_record_info() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/veo/record-info"))
            .and(query_param("taskId", "v9"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "code": 200,
                "data": {
                    "taskId": "v9",
                    "successFlag": 1,
                    "response": { "resultUrls": ["https://cdn/v9.mp4"] }
                }
            })))
            .mount(&server)
            .await;

        let client = KieClient::new(server.uri(), Some("k".to_string())).unwrap();
        let outcome = client
            .query_task(find_model("veo3").unwrap(), "v9")
            .await
            .unwrap();
        assert_eq!(
            outcome,
            VendorOutcome::Succeeded {
                urls: vec!["https://cdn/v9.mp4".to_string()]
            }
        );
    }

    #[tokio::test]
    async fn missing_api_key_is_reported_before_any_request() {
        let client = KieClient::new("http://127.0.0.1:9".to_string(), None).unwrap();
        let error = client
            .query_task(find_model("veo3").unwrap(), "x")
            .await
            .unwrap_err();
        assert!(matches!(error, ProviderError::NotConfigured(_)));
    }
}
