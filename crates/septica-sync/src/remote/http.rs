//! 基于 reqwest 的远端记录存储
//!
//! 协议：
//! - `GET  {base}/records/{type}/{key}`   200 返回记录，404 表示不存在
//! - `PUT  {base}/records/{type}/{key}`   body `{ payload, expected_tag }`，409/412 携带服务端当前记录
//! - `POST {base}/records/{type}/query`   body 为 `RecordQuery`，返回记录数组

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::{RawRecord, RecordQuery, RecordType, RemoteChange, RemoteRecordStore};
use crate::error::{Result, SyncError};

/// HTTP 远端配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpRemoteConfig {
    pub base_url: String,
    /// 连接超时（秒）
    pub connect_timeout_secs: Option<u64>,
    /// 请求超时（秒）
    pub request_timeout_secs: Option<u64>,
}

impl HttpRemoteConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            connect_timeout_secs: Some(10),
            request_timeout_secs: Some(30),
        }
    }
}

#[derive(Debug, Serialize)]
struct SaveRequest<'a> {
    payload: &'a serde_json::Value,
    expected_tag: Option<&'a str>,
}

pub struct HttpRecordStore {
    client: Client,
    base_url: Url,
    changes: broadcast::Sender<RemoteChange>,
}

impl HttpRecordStore {
    pub fn new(config: &HttpRemoteConfig) -> Result<Self> {
        let base_url = Url::parse(&config.base_url)
            .map_err(|e| SyncError::InvalidArgument(format!("无效的 base_url {}: {}", config.base_url, e)))?;

        let mut builder = Client::builder().user_agent(crate::version::user_agent());
        if let Some(timeout) = config.connect_timeout_secs {
            builder = builder.connect_timeout(Duration::from_secs(timeout));
        }
        if let Some(timeout) = config.request_timeout_secs {
            builder = builder.timeout(Duration::from_secs(timeout));
        }

        let client = builder
            .build()
            .map_err(|e| SyncError::Http(format!("创建 HTTP 客户端失败: {}", e)))?;

        let (changes, _) = broadcast::channel(64);

        info!("✅ HTTP 远端存储已创建 (base_url: {})", base_url);

        Ok(Self {
            client,
            base_url,
            changes,
        })
    }

    /// 平台推送到达时由宿主调用，转发为远端变更通知
    pub fn notify_remote_change(&self, change: RemoteChange) {
        debug!("收到远端变更推送: {}/{}", change.record_type, change.key);
        let _ = self.changes.send(change);
    }

    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| SyncError::InvalidArgument(format!("base_url 不能作为前缀: {}", self.base_url)))?
            .pop_if_empty()
            .push("records")
            .extend(segments);
        Ok(url)
    }

    fn record_url(&self, record_type: RecordType, key: &str) -> Result<Url> {
        self.url(&[record_type.as_str(), key])
    }

    fn query_url(&self, record_type: RecordType) -> Result<Url> {
        self.url(&[record_type.as_str(), "query"])
    }

    /// 非成功状态码统一映射
    async fn status_error(response: reqwest::Response) -> SyncError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if status.is_server_error() {
            SyncError::RemoteUnavailable(format!("服务端错误 {}: {}", status, body))
        } else {
            SyncError::Http(format!("请求失败 {}: {}", status, body))
        }
    }
}

#[async_trait]
impl RemoteRecordStore for HttpRecordStore {
    async fn fetch(&self, record_type: RecordType, key: &str) -> Result<Option<RawRecord>> {
        let response = self.client.get(self.record_url(record_type, key)?).send().await?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(response.json::<RawRecord>().await?)),
            _ => Err(Self::status_error(response).await),
        }
    }

    async fn save(
        &self,
        record_type: RecordType,
        key: &str,
        payload: serde_json::Value,
        expected_tag: Option<&str>,
    ) -> Result<RawRecord> {
        let body = SaveRequest {
            payload: &payload,
            expected_tag,
        };
        let response = self
            .client
            .put(self.record_url(record_type, key)?)
            .json(&body)
            .send()
            .await?;

        match response.status() {
            StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED => {
                let server_record = response.json::<RawRecord>().await?;
                warn!("远端记录已变更: {}/{} (tag {})", record_type, key, server_record.change_tag);
                Err(SyncError::RecordChanged {
                    record_type,
                    key: key.to_string(),
                    server_record: Box::new(server_record),
                })
            }
            status if status.is_success() => Ok(response.json::<RawRecord>().await?),
            _ => Err(Self::status_error(response).await),
        }
    }

    async fn query(&self, record_type: RecordType, query: &RecordQuery) -> Result<Vec<RawRecord>> {
        let response = self
            .client
            .post(self.query_url(record_type)?)
            .json(query)
            .send()
            .await?;

        if response.status().is_success() {
            Ok(response.json::<Vec<RawRecord>>().await?)
        } else {
            Err(Self::status_error(response).await)
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<RemoteChange> {
        self.changes.subscribe()
    }
}
