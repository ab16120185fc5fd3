use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use jobs_core::models::truncate_chars;
use jobs_core::{JobError, JobResult};
use jobs_engine::{ExecutionPayload, JobExecutor};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

const DEFAULT_TIMEOUT_SECONDS: u64 = 30;
/// 写入步骤日志的响应体最大字符数
const MAX_LOGGED_BODY_CHARS: usize = 1000;

/// HTTP任务参数
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpTaskParams {
    pub url: String,
    pub method: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    pub body: Option<String>,
    /// 超时时间（秒）
    pub timeout_seconds: Option<u64>,
}

impl HttpTaskParams {
    fn method(&self) -> JobResult<Method> {
        let name = self.method.as_deref().unwrap_or("GET").to_uppercase();
        match name.as_str() {
            "GET" => Ok(Method::GET),
            "POST" => Ok(Method::POST),
            "PUT" => Ok(Method::PUT),
            "DELETE" => Ok(Method::DELETE),
            "PATCH" => Ok(Method::PATCH),
            "HEAD" => Ok(Method::HEAD),
            _ => Err(JobError::InvalidParams(format!("不支持的HTTP方法: {name}"))),
        }
    }
}

/// HTTP任务执行器
pub struct HttpExecutor {
    client: reqwest::Client,
}

impl HttpExecutor {
    pub fn new() -> Self {
        Self::with_client(reqwest::Client::new())
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Default for HttpExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobExecutor for HttpExecutor {
    async fn execute(&self, payload: ExecutionPayload) -> JobResult<()> {
        let params: HttpTaskParams = payload.params.parse()?;
        let method = params.method()?;
        let timeout = Duration::from_secs(params.timeout_seconds.unwrap_or(DEFAULT_TIMEOUT_SECONDS));

        info!(
            "执行HTTP任务: run_id={}, method={}, url={}",
            payload.run_id, method, params.url
        );

        let step = payload
            .steps
            .start_step(&format!("{method} {}", params.url))
            .await?;

        let mut request = self
            .client
            .request(method.clone(), &params.url)
            .timeout(timeout);
        for (key, value) in &params.headers {
            request = request.header(key, value);
        }
        if let Some(body) = &params.body {
            request = request.body(body.clone());
        }

        let response = tokio::select! {
            response = request.send() => response,
            _ = payload.cancel.cancelled() => {
                step.fail("任务被取消").await?;
                return Err(JobError::Execution("任务被取消".to_string()));
            }
        };

        let response = match response {
            Ok(response) => response,
            Err(e) => {
                let message = format!("HTTP请求失败: {e}");
                error!("HTTP任务执行失败: run_id={}, error={}", payload.run_id, message);
                step.fail(&message).await?;
                return Err(JobError::Execution(message));
            }
        };

        let status = response.status();
        step.log(format!("Status: {}", status.as_u16()));
        let body = response
            .text()
            .await
            .unwrap_or_else(|e| format!("读取响应体失败: {e}"));
        if !body.is_empty() {
            step.log(truncate_chars(&body, MAX_LOGGED_BODY_CHARS));
        }

        info!(
            "HTTP任务执行完成: run_id={}, status={}",
            payload.run_id,
            status.as_u16()
        );

        if status.is_success() {
            step.success().await
        } else {
            let message = format!("HTTP请求失败，状态码: {}", status.as_u16());
            step.fail(&message).await?;
            Err(JobError::Execution(message))
        }
    }

    fn description(&self) -> &str {
        "发送HTTP请求"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(method: Option<&str>) -> HttpTaskParams {
        HttpTaskParams {
            url: "http://localhost".to_string(),
            method: method.map(str::to_string),
            headers: HashMap::new(),
            body: None,
            timeout_seconds: None,
        }
    }

    #[test]
    fn test_method_defaults_to_get() {
        assert_eq!(params(None).method().unwrap(), Method::GET);
        assert_eq!(params(Some("post")).method().unwrap(), Method::POST);
    }

    #[test]
    fn test_unknown_method_is_invalid_params() {
        let err = params(Some("TRACE")).method().unwrap_err();
        assert!(matches!(err, JobError::InvalidParams(_)));
    }
}
