use super::error::{HealthcheckError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

pub const MAX_SCORE: i32 = 100;
pub const MIN_SCORE: i32 = 0;
const MAX_PERCENTAGE: i32 = 100;

/// The scoring dimensions, in the order the engine checks them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckItem {
    DbConfig,
    CpuUsage,
    IoUtil,
    DiskCapacityUsage,
    ConnectionUsage,
    AverageActiveSessionPercents,
    CacheMissRatio,
    TableRows,
    TableSize,
    SlowQueryRowsExamined,
}

impl CheckItem {
    pub const ALL: [CheckItem; 10] = [
        CheckItem::DbConfig,
        CheckItem::CpuUsage,
        CheckItem::IoUtil,
        CheckItem::DiskCapacityUsage,
        CheckItem::ConnectionUsage,
        CheckItem::AverageActiveSessionPercents,
        CheckItem::CacheMissRatio,
        CheckItem::TableRows,
        CheckItem::TableSize,
        CheckItem::SlowQueryRowsExamined,
    ];

    /// Item name as stored in `t_hc_default_engine_config.item_name`.
    pub fn item_name(&self) -> &'static str {
        match self {
            CheckItem::DbConfig => "db_config",
            CheckItem::CpuUsage => "cpu_usage",
            CheckItem::IoUtil => "io_util",
            CheckItem::DiskCapacityUsage => "disk_capacity_usage",
            CheckItem::ConnectionUsage => "connection_usage",
            CheckItem::AverageActiveSessionPercents => "average_active_session_percents",
            CheckItem::CacheMissRatio => "cache_miss_ratio",
            CheckItem::TableRows => "table_rows",
            CheckItem::TableSize => "table_size",
            CheckItem::SlowQueryRowsExamined => "slow_query_rows_examined",
        }
    }
}

impl fmt::Display for CheckItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.item_name())
    }
}

/// Weight, watermarks and deduction coefficients of one scoring dimension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct ItemConfig {
    pub id: i64,
    pub item_name: String,
    pub item_weight: i32,
    pub low_watermark: f64,
    pub high_watermark: f64,
    pub unit: f64,
    pub score_deduction_per_unit_high: f64,
    pub max_score_deduction_high: f64,
    pub score_deduction_per_unit_medium: f64,
    pub max_score_deduction_medium: f64,
}

impl ItemConfig {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        item_name: impl Into<String>,
        item_weight: i32,
        low_watermark: f64,
        high_watermark: f64,
        unit: f64,
        score_deduction_per_unit_high: f64,
        max_score_deduction_high: f64,
        score_deduction_per_unit_medium: f64,
        max_score_deduction_medium: f64,
    ) -> Self {
        Self {
            id: 0,
            item_name: item_name.into(),
            item_weight,
            low_watermark,
            high_watermark,
            unit,
            score_deduction_per_unit_high,
            max_score_deduction_high,
            score_deduction_per_unit_medium,
            max_score_deduction_medium,
        }
    }

    fn validate(&self) -> Result<()> {
        let name = &self.item_name;
        let hundred = f64::from(MAX_PERCENTAGE);
        let in_range = |v: f64| (0.0..=hundred).contains(&v);

        if !(0..=MAX_PERCENTAGE).contains(&self.item_weight) {
            return Err(HealthcheckError::ConfigInvalid(format!(
                "item weight of {name} must be in [0, 100], {} is not valid",
                self.item_weight
            )));
        }
        if self.low_watermark < 0.0 {
            return Err(HealthcheckError::ConfigInvalid(format!(
                "low watermark of {name} must not be negative, {} is not valid",
                self.low_watermark
            )));
        }
        if self.high_watermark < self.low_watermark {
            return Err(HealthcheckError::ConfigInvalid(format!(
                "high watermark of {name} must not be lower than low watermark, {} is not valid",
                self.high_watermark
            )));
        }
        if self.unit <= 0.0 {
            return Err(HealthcheckError::ConfigInvalid(format!(
                "unit of {name} must be higher than 0, {} is not valid",
                self.unit
            )));
        }
        if !in_range(self.max_score_deduction_high) {
            return Err(HealthcheckError::ConfigInvalid(format!(
                "max score deduction high of {name} must be in [0, 100], {} is not valid",
                self.max_score_deduction_high
            )));
        }
        if !in_range(self.score_deduction_per_unit_high)
            || self.score_deduction_per_unit_high > self.max_score_deduction_high
        {
            return Err(HealthcheckError::ConfigInvalid(format!(
                "score deduction per unit high of {name} must be in [0, {}], {} is not valid",
                self.max_score_deduction_high, self.score_deduction_per_unit_high
            )));
        }
        if !in_range(self.max_score_deduction_medium) {
            return Err(HealthcheckError::ConfigInvalid(format!(
                "max score deduction medium of {name} must be in [0, 100], {} is not valid",
                self.max_score_deduction_medium
            )));
        }
        if !in_range(self.score_deduction_per_unit_medium)
            || self.score_deduction_per_unit_medium > self.max_score_deduction_medium
        {
            return Err(HealthcheckError::ConfigInvalid(format!(
                "score deduction per unit medium of {name} must be in [0, {}], {} is not valid",
                self.max_score_deduction_medium, self.score_deduction_per_unit_medium
            )));
        }

        Ok(())
    }
}

/// Item configurations of one run, keyed by item name. Immutable once validated.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    items: HashMap<String, ItemConfig>,
}

impl EngineConfig {
    pub fn new(items: impl IntoIterator<Item = ItemConfig>) -> Self {
        Self {
            items: items
                .into_iter()
                .map(|item| (item.item_name.clone(), item))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, item: CheckItem) -> Result<&ItemConfig> {
        self.items.get(item.item_name()).ok_or_else(|| {
            HealthcheckError::ConfigInvalid(format!("item {item} is not configured"))
        })
    }

    pub fn weight_sum(&self) -> i32 {
        self.items.values().map(|item| item.item_weight).sum()
    }

    /// Checks every item's bounds, the presence of all scoring dimensions and
    /// that the weights sum to exactly 100.
    pub fn validate(&self) -> Result<()> {
        if self.items.is_empty() {
            return Err(HealthcheckError::ConfigInvalid(
                "default engine config should not be empty".to_string(),
            ));
        }
        for item in self.items.values() {
            item.validate()?;
        }
        for item in CheckItem::ALL {
            self.get(item)?;
        }
        let sum = self.weight_sum();
        if sum != MAX_PERCENTAGE {
            return Err(HealthcheckError::ConfigInvalid(format!(
                "summary of all item weights should be 100, {sum} is not valid"
            )));
        }

        Ok(())
    }
}

/// Which pairing of telemetry and slow-query backends a monitor system runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MonitorGeneration {
    /// Prometheus + MySQL query-analytics store
    Pmm1,
    /// Prometheus + ClickHouse
    Pmm2,
}

impl TryFrom<i32> for MonitorGeneration {
    type Error = HealthcheckError;

    fn try_from(system_type: i32) -> Result<Self> {
        match system_type {
            1 => Ok(MonitorGeneration::Pmm1),
            2 => Ok(MonitorGeneration::Pmm2),
            other => Err(HealthcheckError::BackendUnsupported(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct MonitorSystem {
    pub id: i64,
    pub system_type: i32,
    pub host_ip: String,
    pub port_num: i32,
    pub port_num_slow: i32,
    pub base_url: String,
}

impl MonitorSystem {
    pub fn generation(&self) -> Result<MonitorGeneration> {
        MonitorGeneration::try_from(self.system_type)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct MySQLServer {
    pub id: i64,
    pub cluster_id: i64,
    pub host_ip: String,
    pub port_num: i32,
    pub service_name: String,
    pub version: String,
}

impl MySQLServer {
    /// Node part of the service name, used to address OS level metrics.
    pub fn node_name(&self) -> &str {
        self.service_name
            .split(':')
            .next()
            .unwrap_or(&self.service_name)
    }
}

/// Identity of one diagnostic run. Built once per check and never mutated.
#[derive(Debug, Clone)]
pub struct OperationInfo {
    operation_id: i64,
    mysql_server: MySQLServer,
    monitor_system: MonitorSystem,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
    step: Duration,
}

impl OperationInfo {
    pub fn new(
        operation_id: i64,
        mysql_server: MySQLServer,
        monitor_system: MonitorSystem,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        step: Duration,
    ) -> Self {
        Self {
            operation_id,
            mysql_server,
            monitor_system,
            start_time,
            end_time,
            step,
        }
    }

    pub fn operation_id(&self) -> i64 {
        self.operation_id
    }

    pub fn mysql_server(&self) -> &MySQLServer {
        &self.mysql_server
    }

    pub fn monitor_system(&self) -> &MonitorSystem {
        &self.monitor_system
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub fn end_time(&self) -> DateTime<Utc> {
        self.end_time
    }

    pub fn step(&self) -> Duration {
        self.step
    }

    pub fn service_name(&self) -> &str {
        &self.mysql_server.service_name
    }

    pub fn node_name(&self) -> &str {
        self.mysql_server.node_name()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationStatus {
    Running,
    Succeeded,
    Failed,
}

impl OperationStatus {
    pub fn code(&self) -> i32 {
        match self {
            OperationStatus::Running => 1,
            OperationStatus::Succeeded => 2,
            OperationStatus::Failed => 3,
        }
    }

    pub fn from_code(code: i32) -> Result<Self> {
        match code {
            1 => Ok(OperationStatus::Running),
            2 => Ok(OperationStatus::Succeeded),
            3 => Ok(OperationStatus::Failed),
            other => Err(HealthcheckError::InvalidData(format!(
                "operation status {other} is not valid"
            ))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, OperationStatus::Running)
    }
}

/// Persisted lifecycle row of one operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct OperationRecord {
    pub id: i64,
    pub mysql_server_id: i64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub step: i64,
    pub status: i32,
    pub message: Option<String>,
}

impl OperationRecord {
    pub fn operation_status(&self) -> Result<OperationStatus> {
        OperationStatus::from_code(self.status)
    }
}

/// Outcome of one operation: composite score plus (score, data, high) per dimension.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, FromRow)]
pub struct HealthcheckResult {
    pub id: i64,
    pub operation_id: i64,
    pub weighted_average_score: i32,
    pub db_config_score: i32,
    pub db_config_data: String,
    pub db_config_high: String,
    pub db_config_advice: String,
    pub cpu_usage_score: i32,
    pub cpu_usage_data: String,
    pub cpu_usage_high: String,
    pub io_util_score: i32,
    pub io_util_data: String,
    pub io_util_high: String,
    pub disk_capacity_usage_score: i32,
    pub disk_capacity_usage_data: String,
    pub disk_capacity_usage_high: String,
    pub connection_usage_score: i32,
    pub connection_usage_data: String,
    pub connection_usage_high: String,
    pub average_active_session_percents_score: i32,
    pub average_active_session_percents_data: String,
    pub average_active_session_percents_high: String,
    pub cache_miss_ratio_score: i32,
    pub cache_miss_ratio_data: String,
    pub cache_miss_ratio_high: String,
    pub table_rows_score: i32,
    pub table_rows_data: String,
    pub table_rows_high: String,
    pub table_size_score: i32,
    pub table_size_data: String,
    pub table_size_high: String,
    pub slow_query_score: i32,
    pub slow_query_data: String,
    pub slow_query_high: String,
    pub slow_query_advice: String,
    pub accuracy_review: i32,
}

impl HealthcheckResult {
    pub fn new(operation_id: i64) -> Self {
        Self {
            operation_id,
            ..Self::default()
        }
    }

    pub fn score(&self, item: CheckItem) -> i32 {
        match item {
            CheckItem::DbConfig => self.db_config_score,
            CheckItem::CpuUsage => self.cpu_usage_score,
            CheckItem::IoUtil => self.io_util_score,
            CheckItem::DiskCapacityUsage => self.disk_capacity_usage_score,
            CheckItem::ConnectionUsage => self.connection_usage_score,
            CheckItem::AverageActiveSessionPercents => self.average_active_session_percents_score,
            CheckItem::CacheMissRatio => self.cache_miss_ratio_score,
            CheckItem::TableRows => self.table_rows_score,
            CheckItem::TableSize => self.table_size_score,
            CheckItem::SlowQueryRowsExamined => self.slow_query_score,
        }
    }

    /// Stores the (score, full data, high-tier data) triple of a dimension.
    pub fn set_item(&mut self, item: CheckItem, score: i32, data: String, high: String) {
        let (score_field, data_field, high_field) = match item {
            CheckItem::DbConfig => (
                &mut self.db_config_score,
                &mut self.db_config_data,
                &mut self.db_config_high,
            ),
            CheckItem::CpuUsage => (
                &mut self.cpu_usage_score,
                &mut self.cpu_usage_data,
                &mut self.cpu_usage_high,
            ),
            CheckItem::IoUtil => (
                &mut self.io_util_score,
                &mut self.io_util_data,
                &mut self.io_util_high,
            ),
            CheckItem::DiskCapacityUsage => (
                &mut self.disk_capacity_usage_score,
                &mut self.disk_capacity_usage_data,
                &mut self.disk_capacity_usage_high,
            ),
            CheckItem::ConnectionUsage => (
                &mut self.connection_usage_score,
                &mut self.connection_usage_data,
                &mut self.connection_usage_high,
            ),
            CheckItem::AverageActiveSessionPercents => (
                &mut self.average_active_session_percents_score,
                &mut self.average_active_session_percents_data,
                &mut self.average_active_session_percents_high,
            ),
            CheckItem::CacheMissRatio => (
                &mut self.cache_miss_ratio_score,
                &mut self.cache_miss_ratio_data,
                &mut self.cache_miss_ratio_high,
            ),
            CheckItem::TableRows => (
                &mut self.table_rows_score,
                &mut self.table_rows_data,
                &mut self.table_rows_high,
            ),
            CheckItem::TableSize => (
                &mut self.table_size_score,
                &mut self.table_size_data,
                &mut self.table_size_high,
            ),
            CheckItem::SlowQueryRowsExamined => (
                &mut self.slow_query_score,
                &mut self.slow_query_data,
                &mut self.slow_query_high,
            ),
        };
        *score_field = score;
        *data_field = data;
        *high_field = high;
    }

    /// `Σ(score × weight) / 100`, floored at zero.
    pub fn summarize(&mut self, config: &EngineConfig) -> Result<i32> {
        let mut weighted = 0;
        for item in CheckItem::ALL {
            weighted += self.score(item) * config.get(item)?.item_weight;
        }
        self.weighted_average_score = (weighted / MAX_PERCENTAGE).max(MIN_SCORE);
        Ok(self.weighted_average_score)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct GlobalVariable {
    pub variable_name: String,
    pub variable_value: String,
}

impl GlobalVariable {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            variable_name: name.into(),
            variable_value: value.into(),
        }
    }
}

/// A configuration variable that differs from its expected value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableAdvice {
    pub name: String,
    pub value: String,
    pub advice: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Table {
    pub table_schema: String,
    pub table_name: String,
    pub table_rows: i64,
    /// GiB
    pub table_size: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSystem {
    pub mount_point: String,
    pub device: String,
}

impl FileSystem {
    pub fn new(mount_point: impl Into<String>, device: impl Into<String>) -> Self {
        Self {
            mount_point: mount_point.into(),
            device: device.into(),
        }
    }
}

/// One telemetry sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrometheusData {
    pub timestamp: String,
    pub value: f64,
}

impl PrometheusData {
    pub fn new(timestamp: impl Into<String>, value: f64) -> Self {
        Self {
            timestamp: timestamp.into(),
            value,
        }
    }
}

/// Aggregated statistics of one query class over the diagnosis window.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, FromRow)]
pub struct SlowQuery {
    pub sql_id: String,
    pub fingerprint: String,
    pub example: String,
    pub db_name: String,
    pub exec_count: i64,
    pub total_exec_time: f64,
    pub avg_exec_time: f64,
    pub rows_examined_max: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(name: &str, weight: i32) -> ItemConfig {
        ItemConfig::new(name, weight, 60.0, 80.0, 10.0, 5.0, 40.0, 2.0, 20.0)
    }

    fn full_config(weights: [i32; 10]) -> EngineConfig {
        EngineConfig::new(
            CheckItem::ALL
                .iter()
                .zip(weights)
                .map(|(check, weight)| item(check.item_name(), weight)),
        )
    }

    #[test]
    fn test_weights_summing_to_100_are_valid() {
        let config = full_config([10; 10]);
        assert!(config.validate().is_ok());
        assert_eq!(config.weight_sum(), 100);
    }

    #[test]
    fn test_weights_not_summing_to_100_are_rejected() {
        for weights in [
            [10, 10, 10, 10, 10, 10, 10, 10, 10, 9],
            [10, 10, 10, 10, 10, 10, 10, 10, 10, 11],
        ] {
            let err = full_config(weights).validate().unwrap_err();
            assert!(matches!(err, HealthcheckError::ConfigInvalid(_)), "{err}");
        }
    }

    #[test]
    fn test_empty_or_incomplete_config_is_rejected() {
        assert!(EngineConfig::default().validate().is_err());

        let incomplete = EngineConfig::new(vec![item("db_config", 100)]);
        let err = incomplete.validate().unwrap_err();
        assert!(err.to_string().contains("cpu_usage"));
    }

    #[test]
    fn test_item_bounds_are_enforced() {
        let mut bad_watermark = item("cpu_usage", 10);
        bad_watermark.high_watermark = 50.0;
        assert!(bad_watermark.validate().is_err());

        let mut bad_unit = item("cpu_usage", 10);
        bad_unit.unit = 0.0;
        assert!(bad_unit.validate().is_err());

        let mut bad_deduction = item("cpu_usage", 10);
        bad_deduction.score_deduction_per_unit_high = 50.0;
        assert!(bad_deduction.validate().is_err());

        let mut bad_medium = item("cpu_usage", 10);
        bad_medium.score_deduction_per_unit_medium = 25.0;
        assert!(bad_medium.validate().is_err());

        let mut bad_weight = item("cpu_usage", 10);
        bad_weight.item_weight = 101;
        assert!(bad_weight.validate().is_err());
    }

    #[test]
    fn test_summarize_is_weighted_average() {
        let config = full_config([10; 10]);
        let mut result = HealthcheckResult::new(7);
        for (i, check) in CheckItem::ALL.iter().enumerate() {
            result.set_item(*check, 100 - i as i32 * 10, String::new(), String::new());
        }
        // (100 + 90 + ... + 10) * 10 / 100
        assert_eq!(result.summarize(&config).unwrap(), 55);
        assert_eq!(result.weighted_average_score, 55);
    }

    #[test]
    fn test_monitor_generation_from_system_type() {
        assert_eq!(MonitorGeneration::try_from(1).unwrap(), MonitorGeneration::Pmm1);
        assert_eq!(MonitorGeneration::try_from(2).unwrap(), MonitorGeneration::Pmm2);
        assert!(matches!(
            MonitorGeneration::try_from(3),
            Err(HealthcheckError::BackendUnsupported(3))
        ));
    }

    #[test]
    fn test_node_name_strips_port() {
        let server = MySQLServer {
            id: 1,
            cluster_id: 1,
            host_ip: "192.168.10.219".to_string(),
            port_num: 3306,
            service_name: "192-168-10-219:3306".to_string(),
            version: "5.7.35".to_string(),
        };
        assert_eq!(server.node_name(), "192-168-10-219");
    }

    #[test]
    fn test_serialized_data_round_trip_preserves_order() {
        let datas = vec![
            PrometheusData::new("1633017600.000", 81.5),
            PrometheusData::new("1633017660.000", 12.25),
            PrometheusData::new("1633017720.000", 99.0),
        ];
        let json = serde_json::to_string(&datas).unwrap();
        let decoded: Vec<PrometheusData> = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, datas);
    }

    #[test]
    fn test_operation_status_codes() {
        for status in [
            OperationStatus::Running,
            OperationStatus::Succeeded,
            OperationStatus::Failed,
        ] {
            assert_eq!(OperationStatus::from_code(status.code()).unwrap(), status);
        }
        assert!(!OperationStatus::Running.is_terminal());
        assert!(OperationStatus::Failed.is_terminal());
        assert!(OperationStatus::from_code(0).is_err());
    }
}
