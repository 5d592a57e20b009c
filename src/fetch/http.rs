//! Thin HTTP layer over reqwest.
//!
//! Classifies every transport outcome into a [`DataError`] at this
//! boundary so callers never touch reqwest types.

use std::time::Duration;

use serde::de::DeserializeOwned;

use crate::error::DataError;

/// JSON-over-HTTP client with a fixed request timeout.
#[derive(Clone)]
pub struct HttpClient {
    client: reqwest::Client,
}

impl HttpClient {
    pub fn new(timeout: Duration) -> Self {
        // Builder inputs are static; a failure here is a bug, and a
        // default client would silently drop the timeout.
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("client builder with static options");
        Self { client }
    }

    /// GETs `url` and decodes the JSON body.
    pub async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, DataError> {
        self.get_json_with_query::<T, &str>(url, &[]).await
    }

    /// GETs `url` with query parameters and decodes the JSON body.
    pub async fn get_json_with_query<T, V>(
        &self,
        url: &str,
        query: &[(&str, V)],
    ) -> Result<T, DataError>
    where
        T: DeserializeOwned,
        V: serde::Serialize,
    {
        let response = self
            .client
            .get(url)
            .query(query)
            .send()
            .await
            .map_err(classify_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(DataError::Http {
                status: status.as_u16(),
            });
        }

        response
            .json::<T>()
            .await
            .map_err(|e| DataError::Validation(e.to_string()))
    }
}

/// Maps a reqwest failure onto the error taxonomy. Decode errors never
/// reach here; they are classified after the status check.
fn classify_transport_error(e: reqwest::Error) -> DataError {
    if e.is_timeout() {
        DataError::Timeout
    } else {
        DataError::Network(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_builds_with_static_options() {
        let _client = HttpClient::new(Duration::from_secs(5));
        let _client = HttpClient::new(Duration::from_millis(1));
    }

    #[tokio::test]
    async fn test_unreachable_host_is_network_error() {
        let client = HttpClient::new(Duration::from_millis(500));
        // TEST-NET-1, guaranteed unroutable.
        let result: Result<serde_json::Value, _> =
            client.get_json("http://192.0.2.1:9/api/zmanim").await;
        assert!(matches!(
            result,
            Err(DataError::Network(_)) | Err(DataError::Timeout)
        ));
    }
}
