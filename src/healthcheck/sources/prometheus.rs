use super::queries::{render, PromQlTemplates, DEVICE_LABEL, MOUNT_POINT_LABEL};
use super::{parse_base_url, Credentials, TelemetrySource};
use crate::healthcheck::error::{HealthcheckError, Result};
use crate::healthcheck::models::{FileSystem, OperationInfo, PrometheusData};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;
use url::Url;

const BACKEND: &str = "prometheus";
const SUCCESS: &str = "success";

#[derive(Debug, Deserialize)]
struct ApiResponse {
    status: String,
    #[serde(default)]
    data: Option<ApiData>,
    #[serde(default, rename = "errorType")]
    error_type: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Only matrix and vector results are requested; scalar and string results fail to decode.
#[derive(Debug, Deserialize)]
#[serde(tag = "resultType", content = "result", rename_all = "lowercase")]
enum ApiData {
    Matrix(Vec<RangeSeries>),
    Vector(Vec<InstantSample>),
}

#[derive(Debug, Deserialize)]
struct RangeSeries {
    values: Vec<(f64, String)>,
}

#[derive(Debug, Deserialize)]
struct InstantSample {
    #[serde(default)]
    metric: HashMap<String, String>,
}

/// Converts one sample pair. Non-finite values (NaN from empty ratios,
/// +Inf from zero denominators) are dropped.
fn parse_sample(timestamp: f64, value: &str) -> Result<Option<PrometheusData>> {
    let parsed: f64 = value.parse().map_err(|_| {
        HealthcheckError::backend(BACKEND, format!("sample value {value} is not a number"))
    })?;
    if !parsed.is_finite() {
        return Ok(None);
    }
    Ok(Some(PrometheusData::new(format!("{timestamp:.3}"), parsed)))
}

/// Telemetry over the Prometheus HTTP API.
#[derive(Debug, Clone)]
pub struct PrometheusTelemetrySource {
    client: Client,
    base_url: Url,
    auth: Option<Credentials>,
    templates: &'static PromQlTemplates,
    node_name: String,
    service_name: String,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
    step: Duration,
}

impl PrometheusTelemetrySource {
    pub fn new(
        client: Client,
        base_url: &str,
        auth: Option<Credentials>,
        templates: &'static PromQlTemplates,
        operation: &OperationInfo,
    ) -> Result<Self> {
        let mut base_url = parse_base_url(BACKEND, base_url)?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        Ok(Self {
            client,
            base_url,
            auth,
            templates,
            node_name: operation.node_name().to_string(),
            service_name: operation.service_name().to_string(),
            start_time: operation.start_time(),
            end_time: operation.end_time(),
            step: operation.step(),
        })
    }

    fn render(&self, template: &str, mount_points: &[String]) -> String {
        render(template, &self.node_name, &self.service_name, mount_points)
    }

    async fn call(&self, endpoint: &str, params: &[(&str, String)]) -> Result<ApiData> {
        let url = self.base_url.join(endpoint).map_err(|e| {
            HealthcheckError::backend(BACKEND, format!("invalid endpoint {endpoint}: {e}"))
        })?;

        let mut request = self.client.get(url).query(params);
        if let Some(auth) = &self.auth {
            request = request.basic_auth(&auth.user, Some(&auth.password));
        }
        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;

        let api: ApiResponse = serde_json::from_str(&body).map_err(|e| {
            HealthcheckError::backend(BACKEND, format!("status {status}, undecodable body: {e}"))
        })?;
        if api.status != SUCCESS || !status.is_success() {
            return Err(HealthcheckError::backend(
                BACKEND,
                format!(
                    "status {status}, {}: {}",
                    api.error_type.unwrap_or_default(),
                    api.error.unwrap_or_default()
                ),
            ));
        }
        api.data
            .ok_or_else(|| HealthcheckError::backend(BACKEND, "response has no data"))
    }

    /// Range query over the operation window.
    async fn query_range(&self, query: String) -> Result<Vec<PrometheusData>> {
        debug!("Prometheus range query: {}", query);
        let params = [
            ("query", query),
            ("start", self.start_time.timestamp().to_string()),
            ("end", self.end_time.timestamp().to_string()),
            ("step", self.step.as_secs_f64().to_string()),
        ];

        match self.call("api/v1/query_range", &params).await? {
            ApiData::Matrix(series) => {
                let mut datas = Vec::new();
                for s in series {
                    for (timestamp, value) in &s.values {
                        if let Some(data) = parse_sample(*timestamp, value)? {
                            datas.push(data);
                        }
                    }
                }
                Ok(datas)
            }
            _ => Err(HealthcheckError::backend(
                BACKEND,
                "range query did not return a matrix",
            )),
        }
    }
}

#[async_trait]
impl TelemetrySource for PrometheusTelemetrySource {
    async fn get_file_systems(&self) -> Result<Vec<FileSystem>> {
        let query = self.render(self.templates.file_system, &[]);
        debug!("Prometheus instant query: {}", query);

        match self.call("api/v1/query", &[("query", query)]).await? {
            ApiData::Vector(samples) => Ok(samples
                .into_iter()
                .filter_map(|sample| {
                    let mount_point = sample.metric.get(MOUNT_POINT_LABEL)?.clone();
                    let device = sample.metric.get(DEVICE_LABEL).cloned().unwrap_or_default();
                    Some(FileSystem::new(mount_point, device))
                })
                .collect()),
            _ => Err(HealthcheckError::backend(
                BACKEND,
                "filesystem query did not return a vector",
            )),
        }
    }

    async fn get_cpu_usage(&self) -> Result<Vec<PrometheusData>> {
        self.query_range(self.render(self.templates.cpu_usage, &[]))
            .await
    }

    async fn get_io_util(&self) -> Result<Vec<PrometheusData>> {
        self.query_range(self.render(self.templates.io_util, &[]))
            .await
    }

    async fn get_disk_capacity_usage(&self, mount_points: &[String]) -> Result<Vec<PrometheusData>> {
        self.query_range(self.render(self.templates.disk_capacity_usage, mount_points))
            .await
    }

    async fn get_connection_usage(&self) -> Result<Vec<PrometheusData>> {
        self.query_range(self.render(self.templates.connection_usage, &[]))
            .await
    }

    async fn get_average_active_session_percents(&self) -> Result<Vec<PrometheusData>> {
        self.query_range(self.render(self.templates.average_active_session_percents, &[]))
            .await
    }

    async fn get_cache_miss_ratio(&self) -> Result<Vec<PrometheusData>> {
        self.query_range(self.render(self.templates.cache_miss_ratio, &[]))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::healthcheck::models::{MonitorGeneration, MonitorSystem, MySQLServer};
    use chrono::TimeZone;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn operation() -> OperationInfo {
        OperationInfo::new(
            11,
            MySQLServer {
                id: 1,
                cluster_id: 1,
                host_ip: "192.168.10.219".to_string(),
                port_num: 3306,
                service_name: "192-168-10-219:3306".to_string(),
                version: "5.7.35".to_string(),
            },
            MonitorSystem {
                id: 1,
                system_type: 2,
                host_ip: "127.0.0.1".to_string(),
                port_num: 9090,
                port_num_slow: 9000,
                base_url: "/prometheus".to_string(),
            },
            Utc.with_ymd_and_hms(2021, 10, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2021, 10, 2, 0, 0, 0).unwrap(),
            Duration::from_secs(60),
        )
    }

    fn source_for(
        server: &MockServer,
        generation: MonitorGeneration,
        auth: Option<Credentials>,
    ) -> PrometheusTelemetrySource {
        PrometheusTelemetrySource::new(
            Client::new(),
            &format!("{}/prometheus", server.uri()),
            auth,
            PromQlTemplates::for_generation(generation),
            &operation(),
        )
        .unwrap()
    }

    fn source(server: &MockServer, auth: Option<Credentials>) -> PrometheusTelemetrySource {
        source_for(server, MonitorGeneration::Pmm2, auth)
    }

    #[tokio::test]
    async fn test_range_query_flattens_series_and_drops_nan() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/prometheus/api/v1/query_range"))
            .and(query_param("start", "1633046400"))
            .and(query_param("end", "1633132800"))
            .and(query_param("step", "60"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "success",
                "data": {
                    "resultType": "matrix",
                    "result": [
                        {"metric": {"node_name": "192-168-10-219"},
                         "values": [[1633046400.0, "81.5"], [1633046460.0, "NaN"]]},
                        {"metric": {"node_name": "192-168-10-219"},
                         "values": [[1633046520.0, "12.25"]]}
                    ]
                }
            })))
            .mount(&server)
            .await;

        let datas = source(&server, None).get_cpu_usage().await.unwrap();
        assert_eq!(
            datas,
            vec![
                PrometheusData::new("1633046400.000", 81.5),
                PrometheusData::new("1633046520.000", 12.25),
            ]
        );

        let requests = server.received_requests().await.unwrap();
        let query = requests[0]
            .url
            .query_pairs()
            .find(|(k, _)| k == "query")
            .map(|(_, v)| v.into_owned())
            .unwrap();
        assert!(query.contains(r#"node_name=~"192-168-10-219""#));
    }

    #[tokio::test]
    async fn test_mysql_metrics_address_the_service_name() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/prometheus/api/v1/query_range"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "success",
                "data": {"resultType": "matrix", "result": []}
            })))
            .mount(&server)
            .await;

        let datas = source(&server, None).get_connection_usage().await.unwrap();
        assert!(datas.is_empty());

        let requests = server.received_requests().await.unwrap();
        let (_, query) = requests[0]
            .url
            .query_pairs()
            .find(|(k, _)| k == "query")
            .unwrap();
        assert!(query.contains(r#"service_name=~"192-168-10-219:3306""#));
    }

    #[tokio::test]
    async fn test_basic_auth_is_sent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/prometheus/api/v1/query_range"))
            .and(header("authorization", "Basic cG1tOnNlY3JldA=="))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "success",
                "data": {"resultType": "matrix", "result": [
                    {"metric": {}, "values": [[1633046400.0, "0.5"]]}
                ]}
            })))
            .mount(&server)
            .await;

        let datas = source(&server, Some(Credentials::new("pmm", "secret")))
            .get_io_util()
            .await
            .unwrap();
        assert_eq!(datas.len(), 1);
    }

    #[tokio::test]
    async fn test_generation_1_uses_instance_selector_without_auth() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/prometheus/api/v1/query_range"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "success",
                "data": {"resultType": "matrix", "result": [
                    {"metric": {"instance": "192-168-10-219"}, "values": [[1633046400.0, "42"]]}
                ]}
            })))
            .mount(&server)
            .await;

        let datas = source_for(&server, MonitorGeneration::Pmm1, None)
            .get_cpu_usage()
            .await
            .unwrap();
        assert_eq!(datas, vec![PrometheusData::new("1633046400.000", 42.0)]);

        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].headers.get("authorization").is_none());
        let (_, query) = requests[0]
            .url
            .query_pairs()
            .find(|(k, _)| k == "query")
            .unwrap();
        assert!(query.contains(r#"instance=~"192-168-10-219""#));
        assert!(!query.contains("node_name"));
    }

    #[tokio::test]
    async fn test_scalar_result_is_a_backend_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "success",
                "data": {"resultType": "scalar", "result": [1633046400.0, "1"]}
            })))
            .mount(&server)
            .await;

        let err = source(&server, None).get_cpu_usage().await.unwrap_err();
        assert!(err.is_adapter_error());
        assert!(err.to_string().contains("undecodable body"));
    }

    #[tokio::test]
    async fn test_error_response_is_a_backend_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "status": "error",
                "errorType": "bad_data",
                "error": "1:1: parse error"
            })))
            .mount(&server)
            .await;

        let err = source(&server, None).get_cache_miss_ratio().await.unwrap_err();
        assert!(err.is_adapter_error());
        assert!(err.to_string().contains("bad_data"));
    }

    #[tokio::test]
    async fn test_file_systems_from_instant_vector() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/prometheus/api/v1/query"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "success",
                "data": {"resultType": "vector", "result": [
                    {"metric": {"mountpoint": "/", "device": "/dev/sda1"}, "value": [1633046400.0, "1"]},
                    {"metric": {"mountpoint": "/data", "device": "/dev/sdb1"}, "value": [1633046400.0, "1"]},
                    {"metric": {"device": "orphan"}, "value": [1633046400.0, "1"]}
                ]}
            })))
            .mount(&server)
            .await;

        let file_systems = source(&server, None).get_file_systems().await.unwrap();
        assert_eq!(
            file_systems,
            vec![
                FileSystem::new("/", "/dev/sda1"),
                FileSystem::new("/data", "/dev/sdb1"),
            ]
        );
    }

    #[test]
    fn test_parse_sample_rejects_garbage() {
        assert!(parse_sample(1.0, "abc").is_err());
        assert!(parse_sample(1.0, "+Inf").unwrap().is_none());
        assert_eq!(
            parse_sample(1633046400.5, "3").unwrap(),
            Some(PrometheusData::new("1633046400.500", 3.0))
        );
    }
}
