use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use tracing::debug;

use super::{CellRange, Rows, StoreError, TabularStore};

const API_BASE: &str = "https://sheets.googleapis.com/";

/// Google Sheets v4 values API, authorized with a pre-minted bearer token.
pub struct SheetsStore {
    client: Client,
    spreadsheet_id: String,
    access_token: String,
}

#[derive(Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<serde_json::Value>>,
}

impl SheetsStore {
    pub fn new(spreadsheet_id: &str, access_token: &str) -> Self {
        Self {
            client: Client::new(),
            spreadsheet_id: spreadsheet_id.to_string(),
            access_token: access_token.to_string(),
        }
    }

    fn url(&self, tail: &[&str]) -> Result<Url, StoreError> {
        let mut url = Url::parse(API_BASE).map_err(|e| StoreError::Malformed(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| StoreError::Malformed("base URL cannot take a path".into()))?
            .pop_if_empty()
            .extend(["v4", "spreadsheets", self.spreadsheet_id.as_str()])
            .extend(tail);
        Ok(url)
    }

    async fn check(resp: reqwest::Response) -> Result<reqwest::Response, StoreError> {
        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(StoreError::Unauthorized(status.as_u16()));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(StoreError::Status {
                status: status.as_u16(),
                body: body.chars().take(200).collect(),
            });
        }
        Ok(resp)
    }
}

#[async_trait]
impl TabularStore for SheetsStore {
    async fn verify_access(&self) -> Result<(), StoreError> {
        let mut url = self.url(&[])?;
        url.query_pairs_mut().append_pair("fields", "spreadsheetId");
        let resp = self
            .client
            .get(url)
            .bearer_auth(&self.access_token)
            .send()
            .await?;
        Self::check(resp).await?;
        Ok(())
    }

    async fn get_range(&self, range: &CellRange) -> Result<Rows, StoreError> {
        let a1 = range.to_string();
        let url = self.url(&["values", &a1])?;
        debug!("GET {}", a1);
        let resp = self
            .client
            .get(url)
            .bearer_auth(&self.access_token)
            .send()
            .await?;
        let body: ValueRange = Self::check(resp).await?.json().await?;
        Ok(body
            .values
            .into_iter()
            .map(|row| row.into_iter().map(cell_text).collect())
            .collect())
    }

    async fn update_range(&self, range: &CellRange, rows: Rows) -> Result<(), StoreError> {
        let a1 = range.to_string();
        let mut url = self.url(&["values", &a1])?;
        url.query_pairs_mut().append_pair("valueInputOption", "RAW");
        debug!("PUT {}", a1);
        let resp = self
            .client
            .put(url)
            .bearer_auth(&self.access_token)
            .json(&serde_json::json!({
                "range": a1,
                "majorDimension": "ROWS",
                "values": rows,
            }))
            .send()
            .await?;
        Self::check(resp).await?;
        Ok(())
    }
}

/// Formatted values are normally strings, but numbers and booleans can slip
/// through depending on the render option.
fn cell_text(v: serde_json::Value) -> String {
    match v {
        serde_json::Value::String(s) => s,
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}
