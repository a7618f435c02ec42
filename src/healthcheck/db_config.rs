use super::error::{HealthcheckError, Result};
use super::models::{GlobalVariable, ItemConfig, VariableAdvice, MAX_SCORE, MIN_SCORE};
use super::scorer::ScoredItem;

pub const MAX_USER_CONNECTIONS: &str = "max_user_connections";
pub const MIN_MAX_USER_CONNECTIONS: i64 = 2000;
pub const REPORT_HOST: &str = "report_host";
pub const REPORT_PORT: &str = "report_port";

const FIXED_EXPECTATIONS: [(&str, &str); 16] = [
    ("log_bin", "ON"),
    ("binlog_format", "ROW"),
    ("binlog_row_image", "FULL"),
    ("sync_binlog", "1"),
    ("innodb_flush_log_at_trx_commit", "1"),
    ("gtid_mode", "ON"),
    ("enforce_gtid_consistency", "ON"),
    ("slave_parallel_type", "LOGICAL_CLOCK"),
    ("slave_parallel_workers", "16"),
    ("master_info_repository", "TABLE"),
    ("relay_log_info_repository", "TABLE"),
    ("innodb_flush_method", "O_DIRECT"),
    ("innodb_monitor_enable", "all"),
    ("innodb_print_all_deadlocks", "ON"),
    ("slow_query_log", "ON"),
    ("performance_schema", "ON"),
];

/// Expected values of the monitored global variables for one target server.
///
/// Built fresh for every run so the report host/port of one target never
/// leaks into another run.
#[derive(Debug, Clone)]
pub struct DbConfigExpectations {
    expected: Vec<(String, String)>,
    min_max_user_connections: i64,
}

/// Outcome of comparing live variables against their expectations.
#[derive(Debug, Clone, PartialEq)]
pub struct DbConfigReport {
    pub scored: ScoredItem,
    pub mismatches: Vec<VariableAdvice>,
    pub advice: String,
}

impl DbConfigExpectations {
    pub fn for_server(host_ip: &str, port_num: i32) -> Self {
        let mut expected: Vec<(String, String)> = FIXED_EXPECTATIONS
            .iter()
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect();
        expected.push((REPORT_HOST.to_string(), host_ip.to_string()));
        expected.push((REPORT_PORT.to_string(), port_num.to_string()));

        Self {
            expected,
            min_max_user_connections: MIN_MAX_USER_CONNECTIONS,
        }
    }

    /// Names of every variable the configuration check reads.
    pub fn variable_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.expected.iter().map(|(n, _)| n.clone()).collect();
        names.push(MAX_USER_CONNECTIONS.to_string());
        names
    }

    pub fn expected_value(&self, name: &str) -> Option<&str> {
        self.expected
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Returns the advice entry for `variable` if it differs from its expectation.
    /// Variables the table does not know about are ignored.
    pub fn compare(&self, variable: &GlobalVariable) -> Result<Option<VariableAdvice>> {
        let name = variable.variable_name.to_lowercase();
        let value = variable.variable_value.trim();

        if name == MAX_USER_CONNECTIONS {
            let current: i64 = value.parse().map_err(|_| {
                HealthcheckError::InvalidData(format!(
                    "{MAX_USER_CONNECTIONS} should be an integer, {value} is not valid"
                ))
            })?;
            if current < self.min_max_user_connections {
                return Ok(Some(VariableAdvice {
                    name,
                    value: value.to_string(),
                    advice: self.min_max_user_connections.to_string(),
                }));
            }
            return Ok(None);
        }

        match self.expected_value(&name) {
            Some(expected) if !value.eq_ignore_ascii_case(expected) => Ok(Some(VariableAdvice {
                name,
                value: value.to_string(),
                advice: expected.to_string(),
            })),
            _ => Ok(None),
        }
    }

    /// Single-tier deduction: `mismatches × per_unit_high`, capped at `max_high`.
    pub fn evaluate(&self, variables: &[GlobalVariable], config: &ItemConfig) -> Result<DbConfigReport> {
        let mut mismatches = Vec::new();
        for variable in variables {
            if let Some(advice) = self.compare(variable)? {
                mismatches.push(advice);
            }
        }

        let deduction = (mismatches.len() as f64 * config.score_deduction_per_unit_high)
            .min(config.max_score_deduction_high);
        let score = ((f64::from(MAX_SCORE) - deduction) as i32).clamp(MIN_SCORE, MAX_SCORE);

        let advice = mismatches
            .iter()
            .map(|m| format!("{}: {} -> {}", m.name, m.value, m.advice))
            .collect::<Vec<_>>()
            .join(",");

        Ok(DbConfigReport {
            scored: ScoredItem {
                score,
                data: serde_json::to_string(variables)?,
                high: serde_json::to_string(&mismatches)?,
            },
            mismatches,
            advice,
        })
    }
}
