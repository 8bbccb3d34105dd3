use async_trait::async_trait;
use metrics::counter;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::ingest::types::{FeedApi, RawUpdate};

// `deleted_business_messages` is only sent for business connections; the Bot API
// reports no deletions of channel posts, so a channel mirror never sees one.
const ALLOWED_UPDATES: &str =
    r#"["channel_post","edited_channel_post","deleted_business_messages"]"#;

/// Bot API envelope: `{ok, result}` or `{ok: false, error_code, description}`.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    ok: bool,
    result: Option<T>,
    #[serde(default)]
    error_code: Option<u16>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RemoteFile {
    #[serde(default)]
    file_path: Option<String>,
}

/// Telegram Bot API client. One instance per run, handed to the fetcher and the
/// materializer; the token never leaves this struct.
pub struct TelegramApi {
    http: Client,
    api_base: String,
    token: String,
}

impl TelegramApi {
    pub fn new(
        api_base: &str,
        token: &str,
        connect_timeout: Duration,
        timeout: Duration,
    ) -> SyncResult<Self> {
        let http = Client::builder()
            .user_agent(concat!("channel-mirror/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(connect_timeout)
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::Permanent(format!("http client: {e}")))?;
        Ok(Self {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    pub fn from_config(cfg: &SyncConfig) -> SyncResult<Self> {
        Self::new(
            &cfg.api_base,
            &cfg.bot_token,
            cfg.connect_timeout,
            cfg.request_timeout,
        )
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base, self.token, method)
    }

    fn file_url(&self, file_path: &str) -> String {
        format!("{}/file/bot{}/{}", self.api_base, self.token, file_path)
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        query: &[(&str, String)],
    ) -> SyncResult<T> {
        let resp = self
            .http
            .get(self.method_url(method))
            .query(query)
            .send()
            .await
            .map_err(|e| map_transport_error(method, e))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| map_transport_error(method, e))?;

        let env: Envelope<T> = match serde_json::from_str(&body) {
            Ok(env) => env,
            Err(e) if status.is_success() => {
                return Err(SyncError::Permanent(format!(
                    "{method}: undecodable response: {e}"
                )))
            }
            Err(_) => return Err(classify_status(method, status, None)),
        };

        if !env.ok {
            let code = env
                .error_code
                .and_then(|c| StatusCode::from_u16(c).ok())
                .unwrap_or(status);
            return Err(classify_status(method, code, env.description));
        }
        env.result
            .ok_or_else(|| SyncError::Permanent(format!("{method}: ok response without result")))
    }
}

/// 429 and 5xx are worth a later retry; other API refusals need an operator.
fn classify_status(method: &str, status: StatusCode, description: Option<String>) -> SyncError {
    let msg = format!(
        "{method}: HTTP {status}{}",
        description.map(|d| format!(" ({d})")).unwrap_or_default()
    );
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        SyncError::Transient(msg)
    } else {
        SyncError::Permanent(msg)
    }
}

fn map_transport_error(method: &str, e: reqwest::Error) -> SyncError {
    // reqwest includes the url (and with it the token) in Display; strip it.
    let e = e.without_url();
    if e.is_decode() || e.is_builder() {
        SyncError::Permanent(format!("{method}: {e}"))
    } else {
        SyncError::Transient(format!("{method}: {e}"))
    }
}

#[async_trait]
impl FeedApi for TelegramApi {
    async fn get_updates(&self, offset: i64, limit: u32) -> SyncResult<Vec<RawUpdate>> {
        let res: SyncResult<Vec<RawUpdate>> = self
            .call(
                "getUpdates",
                &[
                    ("offset", offset.to_string()),
                    ("limit", limit.to_string()),
                    ("timeout", "0".to_string()),
                    ("allowed_updates", ALLOWED_UPDATES.to_string()),
                ],
            )
            .await;
        if res.is_err() {
            counter!("sync_remote_errors_total").increment(1);
        }
        res
    }

    async fn acknowledge(&self, offset: i64) -> SyncResult<()> {
        // Any getUpdates call with an offset confirms everything below it. Updates
        // returned here stay unconfirmed and come back on the next run.
        let _: Vec<RawUpdate> = self
            .call(
                "getUpdates",
                &[
                    ("offset", offset.to_string()),
                    ("limit", "1".to_string()),
                    ("timeout", "0".to_string()),
                    ("allowed_updates", ALLOWED_UPDATES.to_string()),
                ],
            )
            .await?;
        Ok(())
    }

    async fn download_file(&self, file_id: &str) -> SyncResult<Vec<u8>> {
        let file: RemoteFile = self
            .call("getFile", &[("file_id", file_id.to_string())])
            .await?;
        let path = file
            .file_path
            .ok_or_else(|| SyncError::Permanent(format!("getFile: no file_path for {file_id}")))?;

        let resp = self
            .http
            .get(self.file_url(&path))
            .send()
            .await
            .map_err(|e| map_transport_error("file", e))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(classify_status("file", status, None));
        }
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| map_transport_error("file", e))?;
        Ok(bytes.to_vec())
    }

    fn name(&self) -> &'static str {
        "telegram"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert!(classify_status("getUpdates", StatusCode::TOO_MANY_REQUESTS, None).is_transient());
        assert!(classify_status("getUpdates", StatusCode::BAD_GATEWAY, None).is_transient());
        let e = classify_status(
            "getUpdates",
            StatusCode::UNAUTHORIZED,
            Some("Unauthorized".into()),
        );
        assert!(!e.is_transient());
        assert!(e.to_string().contains("Unauthorized"));
    }

    #[test]
    fn urls_embed_token_and_method() {
        let api = TelegramApi::new(
            "https://api.telegram.org/",
            "123:abc",
            Duration::from_secs(1),
            Duration::from_secs(1),
        )
        .unwrap();
        assert_eq!(
            api.method_url("getUpdates"),
            "https://api.telegram.org/bot123:abc/getUpdates"
        );
        assert_eq!(
            api.file_url("photos/file_1.jpg"),
            "https://api.telegram.org/file/bot123:abc/photos/file_1.jpg"
        );
    }

    #[test]
    fn allowed_updates_is_a_json_list_of_subscribed_kinds() {
        let kinds: Vec<String> = serde_json::from_str(ALLOWED_UPDATES).unwrap();
        assert_eq!(
            kinds,
            vec![
                "channel_post",
                "edited_channel_post",
                "deleted_business_messages"
            ]
        );
    }

    #[test]
    fn envelope_parses_error_shape() {
        let env: Envelope<Vec<RawUpdate>> = serde_json::from_str(
            r#"{"ok":false,"error_code":409,"description":"Conflict: webhook is active"}"#,
        )
        .unwrap();
        assert!(!env.ok);
        assert_eq!(env.error_code, Some(409));
        assert!(env.result.is_none());
    }
}
