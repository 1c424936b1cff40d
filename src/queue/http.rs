//! HTTP client for the queue service.
//!
//! Endpoints consumed:
//!
//! | Operation     | Request                          | Empty / absent |
//! |---------------|----------------------------------|----------------|
//! | create queue  | `POST /queue`                    |                |
//! | enqueue       | `POST /queue/{id}/task`          |                |
//! | dequeue       | `GET /queue/{id}/task`           | 204            |
//! | submit result | `POST /queue/{id}/result`        |                |
//! | get result    | `GET /queue/{id}/result/{task}`  | 404            |
//! | status        | `GET /queue/{id}/status`         |                |
//!
//! 404 maps to `NotFound`, 400/422 to `InvalidRequest`; timeouts, connection
//! failures and every other status map to `Transient`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::types::{Dequeued, QueueStatus, QueueTask, ResultStatus, TaskResult};
use super::QueueGateway;
use crate::config::QueueServiceConfig;
use crate::error::GatewayError;

/// Queue gateway backed by the service's REST API.
///
/// Holds its own client and timeout; construct one per process and pass it
/// to the components that need it.
pub struct HttpQueueGateway {
    /// Base URL without trailing slash.
    base_url: String,
    /// Bounded per-request timeout.
    timeout: Duration,
    http_client: Client,
}

impl HttpQueueGateway {
    /// Create a gateway for `base_url` with a per-request timeout.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::InvalidRequest` for an empty URL or if the HTTP
    /// client cannot be built.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, GatewayError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(GatewayError::InvalidRequest(
                "queue service base URL cannot be empty".to_string(),
            ));
        }

        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::InvalidRequest(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            base_url,
            timeout,
            http_client,
        })
    }

    pub fn from_config(config: &QueueServiceConfig) -> Result<Self, GatewayError> {
        Self::new(config.base_url.clone(), config.request_timeout())
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send(&self, request: RequestBuilder, what: &str) -> Result<Response, GatewayError> {
        tracing::trace!(operation = what, "Sending queue service request");
        request.send().await.map_err(|e| transport_error(e, what))
    }
}

/// Map a reqwest transport error to a gateway error.
fn transport_error(err: reqwest::Error, what: &str) -> GatewayError {
    if err.is_timeout() {
        GatewayError::Transient(format!("{} timed out: {}", what, err))
    } else if err.is_connect() {
        GatewayError::Transient(format!("{}: cannot reach queue service: {}", what, err))
    } else {
        GatewayError::Transient(format!("{} failed: {}", what, err))
    }
}

/// Error body shape used by the queue service.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

/// Pull a readable message out of an error response body.
fn extract_message(body: &str, status: StatusCode) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return status
            .canonical_reason()
            .unwrap_or("unknown status")
            .to_string();
    }
    match serde_json::from_str::<ErrorBody>(trimmed) {
        Ok(parsed) => parsed.message,
        Err(_) => trimmed.to_string(),
    }
}

/// Classify a non-success response.
pub(crate) fn classify_status(status: StatusCode, body: &str, what: &str) -> GatewayError {
    let message = extract_message(body, status);
    match status {
        StatusCode::NOT_FOUND => GatewayError::NotFound(format!("{}: {}", what, message)),
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
            GatewayError::InvalidRequest(format!("{}: {}", what, message))
        }
        other => GatewayError::Transient(format!(
            "{} returned HTTP {}: {}",
            what,
            other.as_u16(),
            message
        )),
    }
}

async fn error_from_response(response: Response, what: &str) -> GatewayError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    classify_status(status, &body, what)
}

async fn decode_json<T: serde::de::DeserializeOwned>(
    response: Response,
    what: &str,
) -> Result<T, GatewayError> {
    response
        .json::<T>()
        .await
        .map_err(|e| GatewayError::Transient(format!("{}: unexpected response body: {}", what, e)))
}

#[derive(Debug, Serialize)]
struct CreateQueueRequest<'a> {
    name: &'a str,
}

#[derive(Debug, Deserialize)]
struct QueueResponse {
    id: Uuid,
}

#[derive(Debug, Serialize)]
struct EnqueueRequest<'a> {
    params: &'a str,
    priority: i32,
}

#[derive(Debug, Deserialize)]
struct TaskResponse {
    #[serde(alias = "taskId")]
    id: Uuid,
    #[serde(default)]
    params: serde_json::Value,
    #[serde(default)]
    priority: i32,
}

impl TaskResponse {
    fn into_task(self) -> QueueTask {
        QueueTask {
            id: self.id,
            params: params_to_string(self.params),
            priority: self.priority,
        }
    }
}

/// The service stores params as text; tolerate services that return JSON objects.
fn params_to_string(value: serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s,
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SubmitResultRequest<'a> {
    task_id: Uuid,
    output: &'a str,
    status: ResultStatus,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResultResponse {
    task_id: Uuid,
    #[serde(default)]
    output: Option<String>,
    status: ResultStatus,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    #[serde(rename = "pendingTaskCount", alias = "pendingCount", default)]
    pending: u64,
    #[serde(rename = "completedResultCount", alias = "completedCount", default)]
    completed: u64,
    #[serde(rename = "hasPendingTasks", alias = "hasPending", default)]
    has_pending: Option<bool>,
}

impl From<StatusResponse> for QueueStatus {
    fn from(raw: StatusResponse) -> Self {
        QueueStatus {
            pending_count: raw.pending,
            completed_count: raw.completed,
            has_pending: raw.has_pending.unwrap_or(raw.pending > 0),
        }
    }
}

#[async_trait]
impl QueueGateway for HttpQueueGateway {
    async fn create_queue(&self, name: &str) -> Result<Uuid, GatewayError> {
        let what = "create queue";
        let request = self
            .http_client
            .post(self.url("/queue"))
            .json(&CreateQueueRequest { name });
        let response = self.send(request, what).await?;
        if !response.status().is_success() {
            return Err(error_from_response(response, what).await);
        }
        let body: QueueResponse = decode_json(response, what).await?;
        Ok(body.id)
    }

    async fn enqueue(
        &self,
        queue_id: Uuid,
        params: &str,
        priority: i32,
    ) -> Result<Uuid, GatewayError> {
        let what = "enqueue task";
        let request = self
            .http_client
            .post(self.url(&format!("/queue/{}/task", queue_id)))
            .json(&EnqueueRequest { params, priority });
        let response = self.send(request, what).await?;
        if !response.status().is_success() {
            return Err(error_from_response(response, what).await);
        }
        let body: TaskResponse = decode_json(response, what).await?;
        Ok(body.id)
    }

    async fn dequeue(&self, queue_id: Uuid) -> Result<Dequeued, GatewayError> {
        let what = "dequeue task";
        let request = self
            .http_client
            .get(self.url(&format!("/queue/{}/task", queue_id)));
        let response = self.send(request, what).await?;
        let status = response.status();
        if status == StatusCode::NO_CONTENT {
            return Ok(Dequeued::Empty);
        }
        if !status.is_success() {
            return Err(error_from_response(response, what).await);
        }

        let body = response
            .text()
            .await
            .map_err(|e| transport_error(e, what))?;
        if body.trim().is_empty() {
            return Ok(Dequeued::Empty);
        }
        let task: TaskResponse = serde_json::from_str(&body).map_err(|e| {
            GatewayError::Transient(format!("{}: unexpected response body: {}", what, e))
        })?;
        Ok(Dequeued::Task(task.into_task()))
    }

    async fn submit_result(
        &self,
        queue_id: Uuid,
        task_id: Uuid,
        output: &str,
        status: ResultStatus,
    ) -> Result<(), GatewayError> {
        let what = "submit result";
        let request = self
            .http_client
            .post(self.url(&format!("/queue/{}/result", queue_id)))
            .json(&SubmitResultRequest {
                task_id,
                output,
                status,
            });
        let response = self.send(request, what).await?;
        if !response.status().is_success() {
            return Err(error_from_response(response, what).await);
        }
        Ok(())
    }

    async fn get_result(
        &self,
        queue_id: Uuid,
        task_id: Uuid,
    ) -> Result<Option<TaskResult>, GatewayError> {
        let what = "get result";
        let request = self
            .http_client
            .get(self.url(&format!("/queue/{}/result/{}", queue_id, task_id)));
        let response = self.send(request, what).await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(error_from_response(response, what).await);
        }
        let body: ResultResponse = decode_json(response, what).await?;
        Ok(Some(TaskResult {
            task_id: body.task_id,
            output: body.output.unwrap_or_default(),
            status: body.status,
        }))
    }

    async fn get_status(&self, queue_id: Uuid) -> Result<QueueStatus, GatewayError> {
        let what = "get queue status";
        let request = self
            .http_client
            .get(self.url(&format!("/queue/{}/status", queue_id)));
        let response = self.send(request, what).await?;
        if !response.status().is_success() {
            return Err(error_from_response(response, what).await);
        }
        let body: StatusResponse = decode_json(response, what).await?;
        Ok(body.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one canned response per connection, in order, and return the
    /// base URL plus a handle yielding the request lines that were received.
    async fn canned_server(
        responses: Vec<(u16, String)>,
    ) -> (String, tokio::task::JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());

        let handle = tokio::spawn(async move {
            let mut request_lines = Vec::new();
            for (code, body) in responses {
                let (mut socket, _) = listener.accept().await.unwrap();
                let request = read_request(&mut socket).await;
                request_lines.push(request.lines().next().unwrap_or_default().to_string());

                let status = StatusCode::from_u16(code).unwrap();
                let length_header = if status == StatusCode::NO_CONTENT {
                    String::new()
                } else {
                    format!("Content-Length: {}\r\n", body.len())
                };
                let response = format!(
                    "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\n{}Connection: close\r\n\r\n{}",
                    code,
                    status.canonical_reason().unwrap_or("Unknown"),
                    length_header,
                    body
                );
                socket.write_all(response.as_bytes()).await.unwrap();
                socket.shutdown().await.ok();
            }
            request_lines
        });

        (base_url, handle)
    }

    /// Read headers plus a `Content-Length` body.
    async fn read_request(socket: &mut tokio::net::TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let n = socket.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
            let text = String::from_utf8_lossy(&buf).to_string();
            if let Some(header_end) = text.find("\r\n\r\n") {
                let content_length = text[..header_end]
                    .lines()
                    .filter_map(|line| line.split_once(':'))
                    .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
                    .and_then(|(_, value)| value.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if buf.len() >= header_end + 4 + content_length {
                    return text;
                }
            }
        }
        String::from_utf8_lossy(&buf).to_string()
    }

    fn reply(code: u16, body: impl Into<String>) -> (u16, String) {
        (code, body.into())
    }

    fn gateway(base_url: &str) -> HttpQueueGateway {
        HttpQueueGateway::new(base_url, Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_new_strips_trailing_slash() {
        let gateway =
            HttpQueueGateway::new("http://localhost:8080/", Duration::from_secs(5)).unwrap();
        assert_eq!(gateway.base_url(), "http://localhost:8080");
        assert_eq!(gateway.timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_new_rejects_empty_url() {
        let result = HttpQueueGateway::new("", Duration::from_secs(5));
        assert!(matches!(result, Err(GatewayError::InvalidRequest(_))));
    }

    #[test]
    fn test_classify_not_found() {
        let err = classify_status(StatusCode::NOT_FOUND, "", "dequeue task");
        assert!(err.is_not_found());
        assert!(err.to_string().contains("Not Found"));
    }

    #[test]
    fn test_classify_bad_request_uses_json_message() {
        let err = classify_status(
            StatusCode::BAD_REQUEST,
            r#"{"message":"priority must be positive"}"#,
            "enqueue task",
        );
        assert_eq!(
            err,
            GatewayError::InvalidRequest("enqueue task: priority must be positive".to_string())
        );
    }

    #[test]
    fn test_classify_bad_request_uses_raw_text() {
        let err = classify_status(StatusCode::BAD_REQUEST, "Queue name required", "create queue");
        assert!(matches!(err, GatewayError::InvalidRequest(ref m) if m.contains("Queue name required")));
    }

    #[test]
    fn test_classify_server_errors_are_transient() {
        for code in [500u16, 502, 503, 429, 418] {
            let status = StatusCode::from_u16(code).unwrap();
            let err = classify_status(status, "", "get queue status");
            assert!(err.is_transient(), "HTTP {} should be transient", code);
        }
    }

    #[test]
    fn test_status_response_aliases() {
        let raw = r#"{"id":"x","pendingTaskCount":2,"completedResultCount":5,"hasPendingTasks":true}"#;
        let status: QueueStatus = serde_json::from_str::<StatusResponse>(raw).unwrap().into();
        assert_eq!(status.pending_count, 2);
        assert_eq!(status.completed_count, 5);
        assert!(status.has_pending);

        let raw = r#"{"pendingCount":0,"completedCount":3}"#;
        let status: QueueStatus = serde_json::from_str::<StatusResponse>(raw).unwrap().into();
        assert_eq!(status.completed_count, 3);
        assert!(!status.has_pending);
    }

    #[test]
    fn test_task_response_accepts_task_id_alias_and_object_params() {
        let id = Uuid::new_v4();
        let raw = format!(r#"{{"taskId":"{}","params":{{"a":1}},"priority":2}}"#, id);
        let task = serde_json::from_str::<TaskResponse>(&raw).unwrap().into_task();
        assert_eq!(task.id, id);
        assert_eq!(task.params, r#"{"a":1}"#);
        assert_eq!(task.priority, 2);
    }

    #[test]
    fn test_submit_request_wire_format() {
        let task_id = Uuid::nil();
        let body = serde_json::to_value(SubmitResultRequest {
            task_id,
            output: "/tmp/out.json",
            status: ResultStatus::Success,
        })
        .unwrap();
        assert_eq!(body["taskId"], task_id.to_string());
        assert_eq!(body["status"], "SUCCESS");
        assert_eq!(body["output"], "/tmp/out.json");
    }

    #[tokio::test]
    async fn test_dequeue_no_content_is_empty() {
        let (url, server) = canned_server(vec![reply(204, ""), reply(200, "")]).await;
        let gateway = gateway(&url);
        let queue_id = Uuid::new_v4();

        assert_eq!(gateway.dequeue(queue_id).await.unwrap(), Dequeued::Empty);
        assert_eq!(gateway.dequeue(queue_id).await.unwrap(), Dequeued::Empty);

        let requests = server.await.unwrap();
        assert_eq!(requests[0], format!("GET /queue/{}/task HTTP/1.1", queue_id));
    }

    #[tokio::test]
    async fn test_dequeue_returns_task() {
        let body = format!(
            r#"{{"id":"{}","params":"{{\"job\":\"generate_quiz\"}}","priority":3,"status":"IN_PROGRESS"}}"#,
            Uuid::nil()
        );
        let (url, _server) = canned_server(vec![reply(200, body)]).await;

        match gateway(&url).dequeue(Uuid::new_v4()).await.unwrap() {
            Dequeued::Task(task) => {
                assert_eq!(task.id, Uuid::nil());
                assert_eq!(task.params, r#"{"job":"generate_quiz"}"#);
                assert_eq!(task.priority, 3);
            }
            Dequeued::Empty => panic!("expected a task"),
        }
    }

    #[tokio::test]
    async fn test_get_result_not_found_is_none() {
        let (url, server) = canned_server(vec![reply(404, r#"{"message":"Result not found"}"#)]).await;
        let queue_id = Uuid::new_v4();
        let task_id = Uuid::new_v4();

        let result = gateway(&url).get_result(queue_id, task_id).await.unwrap();
        assert!(result.is_none());

        let requests = server.await.unwrap();
        assert_eq!(
            requests[0],
            format!("GET /queue/{}/result/{} HTTP/1.1", queue_id, task_id)
        );
    }

    #[tokio::test]
    async fn test_get_result_success() {
        let body = format!(
            r#"{{"taskId":"{}","output":"/tmp/p1.json","status":"SUCCESS","timestamp":"2024-01-01T00:00:00"}}"#,
            Uuid::nil()
        );
        let (url, _server) = canned_server(vec![reply(200, body)]).await;

        let result = gateway(&url)
            .get_result(Uuid::new_v4(), Uuid::nil())
            .await
            .unwrap()
            .expect("result present");
        assert_eq!(result.task_id, Uuid::nil());
        assert_eq!(result.output, "/tmp/p1.json");
        assert!(result.is_success());
    }

    #[tokio::test]
    async fn test_status_not_found_is_not_found() {
        let (url, _server) = canned_server(vec![reply(404, "Queue not found!!")]).await;
        let err = gateway(&url).get_status(Uuid::new_v4()).await.unwrap_err();
        assert_eq!(
            err,
            GatewayError::NotFound("get queue status: Queue not found!!".to_string())
        );
    }

    #[tokio::test]
    async fn test_status_parses_counts() {
        let (url, _server) = canned_server(vec![reply(
            200,
            r#"{"pendingTaskCount":1,"completedResultCount":2,"hasPendingTasks":true}"#,
        )])
        .await;
        let status = gateway(&url).get_status(Uuid::new_v4()).await.unwrap();
        assert_eq!(status.pending_count, 1);
        assert_eq!(status.completed_count, 2);
        assert!(!status.is_complete(3));
    }

    #[tokio::test]
    async fn test_enqueue_bad_request_carries_message() {
        let (url, server) =
            canned_server(vec![reply(400, r#"{"message":"Priority must be non-negative"}"#)]).await;
        let queue_id = Uuid::new_v4();

        let err = gateway(&url).enqueue(queue_id, "{}", -1).await.unwrap_err();
        assert_eq!(
            err,
            GatewayError::InvalidRequest("enqueue task: Priority must be non-negative".to_string())
        );

        let requests = server.await.unwrap();
        assert_eq!(requests[0], format!("POST /queue/{}/task HTTP/1.1", queue_id));
    }

    #[tokio::test]
    async fn test_service_unavailable_is_transient() {
        let (url, _server) = canned_server(vec![reply(503, ""), reply(503, "busy")]).await;
        let gateway = gateway(&url);

        let err = gateway.get_status(Uuid::new_v4()).await.unwrap_err();
        assert!(err.is_transient(), "expected transient, got {:?}", err);
        assert!(err.to_string().contains("Service Unavailable"));

        let err = gateway
            .submit_result(Uuid::new_v4(), Uuid::new_v4(), "out", ResultStatus::Success)
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_undecodable_body_is_transient() {
        let (url, _server) = canned_server(vec![reply(200, "<html>proxy</html>")]).await;
        let err = gateway(&url).get_status(Uuid::new_v4()).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_connection_error_is_transient() {
        // Port 1 on localhost is reserved and should refuse connections.
        let gateway = HttpQueueGateway::new("http://127.0.0.1:1", Duration::from_secs(2)).unwrap();

        let err = gateway.get_status(Uuid::new_v4()).await.unwrap_err();
        assert!(err.is_transient(), "expected transient error, got {:?}", err);

        let err = gateway.dequeue(Uuid::new_v4()).await.unwrap_err();
        assert!(err.is_transient());
    }
}
