use crate::{FetchedRange, ObjectAttributes, RemoteStore, StoreError, StoreResult};
use async_trait::async_trait;
use futures_util::TryStreamExt;
use reqwest::Client;
use tokio_util::io::StreamReader;

const GENERATION_HEADER: &str = "x-store-generation";
const MTIME_HEADER: &str = "x-store-mtime";
const DIGEST_HEADER: &str = "x-store-range-sha256";
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// HTTP-backed remote store. Objects are addressed as
/// `{base_url}/{bucket}/{name}?generation=N`; ranges use standard Range
/// headers and the server reports the range digest and object generation in
/// response headers.
pub struct HttpRemoteStore {
    base_url: String,
    session_token: Option<String>,
    client: Client,
}

impl HttpRemoteStore {
    pub fn new(base_url: String, session_token: Option<String>) -> StoreResult<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| StoreError::Internal(format!("Failed to create client: {}", e)))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            session_token,
            client,
        })
    }

    fn object_url(&self, bucket: &str, name: &str) -> String {
        format!("{}/{}/{}", self.base_url, bucket, name)
    }

    fn apply_auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.session_token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }
}

fn header_u64(headers: &reqwest::header::HeaderMap, key: &str) -> Option<u64> {
    headers
        .get(key)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    async fn fetch_range(
        &self,
        bucket: &str,
        name: &str,
        generation: u64,
        offset: u64,
        length: u64,
    ) -> StoreResult<FetchedRange> {
        let url = self.object_url(bucket, name);
        if length == 0 {
            return Ok(FetchedRange {
                reader: Box::pin(tokio::io::empty()),
                length: 0,
                digest: None,
            });
        }

        let range_value = format!("bytes={}-{}", offset, offset + length - 1);
        let req = self
            .client
            .get(&url)
            .query(&[("generation", generation.to_string())])
            .header(reqwest::header::RANGE, range_value);
        let res = self
            .apply_auth(req)
            .send()
            .await
            .map_err(|e| StoreError::RemoteError(format!("range GET ({}) failed: {}", url, e)))?;

        if !res.status().is_success() {
            let err = StoreError::from_http_status(res.status(), url.clone());
            warn!("fetch_range: {} failed: {}", url, err);
            return Err(err);
        }

        if let Some(remote_gen) = header_u64(res.headers(), GENERATION_HEADER) {
            if remote_gen != generation {
                return Err(StoreError::StaleGeneration(format!(
                    "{} generation {} superseded by {}",
                    url, generation, remote_gen
                )));
            }
        }

        let digest = res
            .headers()
            .get(DIGEST_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string());
        let body_len = res.content_length().unwrap_or(length);
        let stream = res
            .bytes_stream()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
        Ok(FetchedRange {
            reader: Box::pin(StreamReader::new(stream)),
            length: body_len,
            digest,
        })
    }

    async fn stat_object(&self, bucket: &str, name: &str) -> StoreResult<ObjectAttributes> {
        let url = self.object_url(bucket, name);
        let res = self
            .apply_auth(self.client.head(&url))
            .send()
            .await
            .map_err(|e| StoreError::RemoteError(format!("HEAD ({}) failed: {}", url, e)))?;
        debug!("stat_object: HEAD {} => {}", url, res.status());

        if !res.status().is_success() {
            return Err(StoreError::from_http_status(res.status(), url));
        }

        let size = res
            .content_length()
            .ok_or_else(|| StoreError::RemoteError(format!("no content length for {}", url)))?;
        let generation = header_u64(res.headers(), GENERATION_HEADER)
            .ok_or_else(|| StoreError::RemoteError(format!("no generation header for {}", url)))?;
        let mtime = header_u64(res.headers(), MTIME_HEADER).unwrap_or(0);
        let content_type = res
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string());

        Ok(ObjectAttributes {
            size,
            generation,
            mtime,
            content_type,
        })
    }
}
