//! HTTP attachment store client.
//!
//! Documents live at `{base}/subject/{id}/attachment/{key}` as raw JSON.
//! The trait surface is sync; calls are driven on the ambient tokio runtime
//! the binary owns.

use reqwest::{Client, StatusCode};
use serde_json::Value;

use crate::config::ApiConfig;
use crate::error::{Result, StoreError};
use crate::store::{AttachmentStore, Subject};

pub struct HttpStore {
    base_url: String,
    access_key: String,
    study_id: String,
    http_client: Client,
}

impl HttpStore {
    pub fn new(api: &ApiConfig) -> Result<Self> {
        Ok(Self {
            base_url: api.validated_base_url()?,
            access_key: api.access_key.clone(),
            study_id: api.study_id.clone(),
            http_client: Client::new(),
        })
    }

    fn doc_url(&self, subject: Subject<'_>, key: &str) -> String {
        let id = match subject {
            Subject::Study => self.study_id.as_str(),
            Subject::Participant(p) => p,
        };
        format!("{}/subject/{}/attachment/{}", self.base_url, id, key)
    }

    fn transport_err(key: &str, err: &reqwest::Error) -> StoreError {
        StoreError::RequestFailed {
            key: key.to_string(),
            message: err.to_string(),
        }
    }
}

impl AttachmentStore for HttpStore {
    fn get_raw(&self, subject: Subject<'_>, key: &str) -> Result<Option<Value>> {
        let resp = tokio::runtime::Handle::current()
            .block_on(
                self.http_client
                    .get(self.doc_url(subject, key))
                    .bearer_auth(&self.access_key)
                    .send(),
            )
            .map_err(|e| Self::transport_err(key, &e))?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(StoreError::BadStatus {
                status: resp.status().as_u16(),
                key: key.to_string(),
            }
            .into());
        }

        let value = tokio::runtime::Handle::current()
            .block_on(resp.json::<Value>())
            .map_err(|e| Self::transport_err(key, &e))?;
        Ok(Some(value))
    }

    fn put_raw(&self, subject: Subject<'_>, key: &str, value: Value) -> Result<()> {
        let resp = tokio::runtime::Handle::current()
            .block_on(
                self.http_client
                    .put(self.doc_url(subject, key))
                    .bearer_auth(&self.access_key)
                    .json(&value)
                    .send(),
            )
            .map_err(|e| Self::transport_err(key, &e))?;

        if !resp.status().is_success() {
            return Err(StoreError::BadStatus {
                status: resp.status().as_u16(),
                key: key.to_string(),
            }
            .into());
        }
        Ok(())
    }
}
