use std::time::Duration;

use serde::Serialize;

use super::{parse_compact_peers, Announce, AnnounceParams};
use crate::{Error, Result};

#[derive(Debug, Serialize)]
struct TrackerRequest {
    port: u16,
    uploaded: u64,
    downloaded: u64,
    left: u64,
    compact: u8,
}

#[derive(Debug)]
pub struct TrackerHttpClient {
    url: String,
    client: reqwest::Client,
}

impl TrackerHttpClient {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let url = url.into();
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(Error::TrackerUnavailable(format!(
                "unsupported tracker url {url}"
            )));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|err| Error::TrackerUnavailable(err.to_string()))?;
        Ok(Self { url, client })
    }

    pub async fn announce(&self, params: &AnnounceParams) -> Result<Announce> {
        // raw digests are not valid utf8, so these two are encoded by hand
        let separator = if self.url.contains('?') { '&' } else { '?' };
        let request_url = format!(
            "{}{separator}info_hash={}&peer_id={}",
            self.url,
            percent_encode_bytes(params.info_hash.as_bytes()),
            percent_encode_bytes(params.peer_id.as_bytes()),
        );
        let query = TrackerRequest {
            port: params.port,
            uploaded: params.uploaded,
            downloaded: params.downloaded,
            left: params.left,
            compact: 1,
        };
        tracing::debug!(url = %self.url, "announcing");

        let unavailable = |err: reqwest::Error| Error::TrackerUnavailable(err.to_string());
        let response_data = self
            .client
            .get(request_url)
            .query(&query)
            .send()
            .await
            .map_err(unavailable)?
            .error_for_status()
            .map_err(unavailable)?
            .bytes()
            .await
            .map_err(unavailable)?;

        let response = bencode::decode::<TrackerResponse>(&response_data)
            .map_err(|err| Error::TrackerUnavailable(format!("invalid response: {err}")))?;

        match response {
            TrackerResponse::Success {
                interval,
                complete,
                incomplete,
                peers,
            } => {
                let addresses = parse_compact_peers(&peers)?;
                if addresses.is_empty() {
                    return Err(Error::NoPeersFound);
                }
                tracing::debug!(peers = addresses.len(), "tracker answered");
                Ok(Announce {
                    interval,
                    leechers: incomplete,
                    seeders: complete,
                    addresses,
                })
            }
            TrackerResponse::Failure { reason } => Err(Error::TrackerUnavailable(reason)),
        }
    }
}

enum TrackerResponse {
    Success {
        interval: u32,
        complete: Option<u32>,
        incomplete: Option<u32>,
        peers: Vec<u8>,
    },
    Failure {
        reason: String,
    },
}

impl bencode::FromValue for TrackerResponse {
    fn from_value(value: &bencode::Value) -> bencode::Result<Self> {
        let dict = value.as_dict()?;

        if let Some(reason) = dict.find::<String>(b"failure reason")? {
            return Ok(TrackerResponse::Failure { reason });
        }

        Ok(TrackerResponse::Success {
            interval: dict.find::<u32>(b"interval")?.unwrap_or_default(),
            complete: dict.find::<u32>(b"complete")?,
            incomplete: dict.find::<u32>(b"incomplete")?,
            peers: dict.require_value(b"peers")?.as_bytes()?.to_vec(),
        })
    }
}

fn percent_encode_bytes(bytes: &[u8]) -> String {
    let mut output = String::with_capacity(bytes.len() * 3);
    for b in bytes {
        output.push('%');
        output.push_str(&hex::encode_upper([*b]));
    }
    output
}
