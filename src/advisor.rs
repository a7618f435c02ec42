use crate::healthcheck::error::{HealthcheckError, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;
use url::Url;

const ADVISE_ENDPOINT: &str = "api/v1/sqladvisor/advise";

/// SQL tuning advice for one statement against one database.
#[async_trait]
pub trait SqlAdvisor: Send + Sync + std::fmt::Debug {
    async fn advise(&self, db_id: i64, sql_text: &str) -> Result<String>;
}

#[derive(Debug, Serialize)]
struct AdviseRequest<'a> {
    db_id: i64,
    sql_text: &'a str,
}

#[derive(Debug, Deserialize)]
struct AdviseResponse {
    advice: String,
}

/// Advisor reached over HTTP.
#[derive(Debug, Clone)]
pub struct HttpSqlAdvisor {
    client: Client,
    endpoint: Url,
}

impl HttpSqlAdvisor {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let mut base = Url::parse(base_url)
            .map_err(|e| HealthcheckError::Advice(format!("invalid base url {base_url}: {e}")))?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(HealthcheckError::Advice(format!(
                "unsupported url scheme {}",
                base.scheme()
            )));
        }
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let endpoint = base
            .join(ADVISE_ENDPOINT)
            .map_err(|e| HealthcheckError::Advice(e.to_string()))?;

        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, endpoint })
    }
}

#[async_trait]
impl SqlAdvisor for HttpSqlAdvisor {
    async fn advise(&self, db_id: i64, sql_text: &str) -> Result<String> {
        debug!("Requesting advice for db {}: {}", db_id, sql_text);
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&AdviseRequest { db_id, sql_text })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(HealthcheckError::Advice(format!(
                "status {status}: {}",
                body.trim()
            )));
        }

        let advice: AdviseResponse = response
            .json()
            .await
            .map_err(|e| HealthcheckError::Advice(format!("malformed response: {e}")))?;
        Ok(advice.advice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_advise_posts_db_id_and_sql() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/das/api/v1/sqladvisor/advise"))
            .and(body_json(json!({"db_id": 7, "sql_text": "select * from t"})))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"advice": "add index on t(id)"})),
            )
            .mount(&server)
            .await;

        let advisor =
            HttpSqlAdvisor::new(&format!("{}/das", server.uri()), Duration::from_secs(5)).unwrap();
        let advice = advisor.advise(7, "select * from t").await.unwrap();
        assert_eq!(advice, "add index on t(id)");
    }

    #[tokio::test]
    async fn test_advisor_failure_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("advisor crashed"))
            .mount(&server)
            .await;

        let advisor = HttpSqlAdvisor::new(&server.uri(), Duration::from_secs(5)).unwrap();
        let err = advisor.advise(1, "select 1").await.unwrap_err();
        assert!(matches!(err, HealthcheckError::Advice(ref m) if m.contains("advisor crashed")));
    }

    #[test]
    fn test_invalid_base_url_is_rejected() {
        assert!(HttpSqlAdvisor::new("file:///tmp", Duration::from_secs(1)).is_err());
        assert!(HttpSqlAdvisor::new("::", Duration::from_secs(1)).is_err());
    }
}
