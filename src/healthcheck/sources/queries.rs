//! Query text issued against the target instance and the monitoring backends.
//!
//! PromQL templates carry `__NODE__`, `__SERVICE__` and `__MOUNT_POINTS__`
//! placeholders that are substituted per run.

use crate::healthcheck::models::MonitorGeneration;

pub const NODE_PLACEHOLDER: &str = "__NODE__";
pub const SERVICE_PLACEHOLDER: &str = "__SERVICE__";
pub const MOUNT_POINTS_PLACEHOLDER: &str = "__MOUNT_POINTS__";

pub const MIN_TABLE_ROWS: i64 = 30_000_000;
pub const MIN_ROWS_EXAMINED: i64 = 1;
pub const SLOW_QUERY_LIMIT: i64 = 100;

/// Label carrying the device of a filesystem sample.
pub const DEVICE_LABEL: &str = "device";
/// Label carrying the mount point of a filesystem sample.
pub const MOUNT_POINT_LABEL: &str = "mountpoint";

/// PromQL templates of one monitoring generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PromQlTemplates {
    pub file_system: &'static str,
    pub cpu_usage: &'static str,
    pub io_util: &'static str,
    pub disk_capacity_usage: &'static str,
    pub connection_usage: &'static str,
    pub average_active_session_percents: &'static str,
    pub cache_miss_ratio: &'static str,
}

impl PromQlTemplates {
    pub fn for_generation(generation: MonitorGeneration) -> &'static PromQlTemplates {
        match generation {
            MonitorGeneration::Pmm1 => &PMM1_TEMPLATES,
            MonitorGeneration::Pmm2 => &PMM2_TEMPLATES,
        }
    }
}

/// Fills the placeholders of `template`. Mount points are joined into a regex alternation.
pub fn render(template: &str, node_name: &str, service_name: &str, mount_points: &[String]) -> String {
    template
        .replace(NODE_PLACEHOLDER, node_name)
        .replace(SERVICE_PLACEHOLDER, service_name)
        .replace(MOUNT_POINTS_PLACEHOLDER, &mount_points.join("|"))
        .trim()
        .to_string()
}

pub static PMM1_TEMPLATES: PromQlTemplates = PromQlTemplates {
    file_system: r#"
node_filesystem_files{instance=~"__NODE__",fstype!~"rootfs|selinuxfs|autofs|rpc_pipefs|tmpfs"}
"#,
    cpu_usage: r#"
clamp_max(sum by () ((avg by (mode) (
(clamp_max(rate(node_cpu{instance=~"__NODE__",mode!="idle",mode!="iowait"}[5m]),1)) or
(clamp_max(irate(node_cpu{instance=~"__NODE__",mode!="idle",mode!="iowait"}[5m]),1)) )) *100 or
sum by () (
avg_over_time(node_cpu_average{instance=~"__NODE__",mode!="total",mode!="idle"}[5m]) or
avg_over_time(node_cpu_average{instance=~"__NODE__",mode!="total",mode!="idle"}[5m])) unless
(avg_over_time(node_cpu_average{instance=~"__NODE__",mode="total",job="rds-basic"}[5m]) or
avg_over_time(node_cpu_average{instance=~"__NODE__",mode="total",job="rds-basic"}[5m]))
),100)
"#,
    io_util: r#"
avg by (instance) (rate(node_disk_io_time_ms{instance=~"__NODE__"}[20s])/1000 or
irate(node_disk_io_time_ms{instance=~"__NODE__"}[5m])/1000)
"#,
    disk_capacity_usage: r#"
1 - node_filesystem_free{instance=~"__NODE__", mountpoint=~"(__MOUNT_POINTS__)", fstype!~"rootfs|selinuxfs|autofs|rpc_pipefs|tmpfs"} /
node_filesystem_size{instance=~"__NODE__", mountpoint=~"(__MOUNT_POINTS__)", fstype!~"rootfs|selinuxfs|autofs|rpc_pipefs|tmpfs"}
"#,
    connection_usage: r#"
avg by (instance) (max(max_over_time(mysql_global_status_threads_connected{instance=~"__SERVICE__"}[20s]) or
max_over_time(mysql_global_status_threads_connected{instance=~"__SERVICE__"}[5m]))) /
avg by (instance) (max(max_over_time(mysql_global_variables_max_connections{instance=~"__SERVICE__"}[20s]) or
max_over_time(mysql_global_variables_max_connections{instance=~"__SERVICE__"}[5m])))
"#,
    average_active_session_percents: r#"
avg by (instance) (avg_over_time(mysql_global_status_threads_running{instance=~"__SERVICE__"}[20s]) or
avg_over_time(mysql_global_status_threads_running{instance=~"__SERVICE__"}[5m]))/
avg by (instance) (max_over_time(mysql_global_status_threads_connected{instance=~"__SERVICE__"}[20s]) or
max_over_time(mysql_global_status_threads_connected{instance=~"__SERVICE__"}[5m]))
"#,
    cache_miss_ratio: r#"
avg by (instance) ((rate(mysql_global_status_innodb_buffer_pool_reads{instance=~"__SERVICE__"}[5m]) or
irate(mysql_global_status_innodb_buffer_pool_reads{instance=~"__SERVICE__"}[5m])) /
(rate(mysql_global_status_innodb_buffer_pool_read_requests{instance=~"__SERVICE__"}[5m]) or
irate(mysql_global_status_innodb_buffer_pool_read_requests{instance=~"__SERVICE__"}[5m])))
"#,
};

// Generation 2 falls back to the rdsosmetrics disk series on virtualized hosts.
pub static PMM2_TEMPLATES: PromQlTemplates = PromQlTemplates {
    file_system: r#"
node_filesystem_files{node_name=~"__NODE__",fstype!~"rootfs|selinuxfs|autofs|rpc_pipefs|tmpfs"}
"#,
    cpu_usage: r#"
clamp_max(sum by () ((avg by (mode) (
(clamp_max(rate(node_cpu_seconds_total{node_name=~"__NODE__",mode!="idle",mode!="iowait"}[5m]),1)) or
(clamp_max(irate(node_cpu_seconds_total{node_name=~"__NODE__",mode!="idle",mode!="iowait"}[5m]),1)) )) *100 or
sum by () (
avg_over_time(node_cpu_average{node_name=~"__NODE__",mode!="total",mode!="idle"}[5m]) or
avg_over_time(node_cpu_average{node_name=~"__NODE__",mode!="total",mode!="idle"}[5m])) unless
(avg_over_time(node_cpu_average{node_name=~"__NODE__",mode="total",job="rds-basic"}[5m]) or
avg_over_time(node_cpu_average{node_name=~"__NODE__",mode="total",job="rds-basic"}[5m]))
),100)
"#,
    io_util: r#"
avg by (node_name) (rate(node_disk_io_time_seconds_total{node_name=~"__NODE__"}[20s]) or
irate(node_disk_io_time_seconds_total{node_name=~"__NODE__"}[5m]) or
(max_over_time(rdsosmetrics_diskIO_util{node_name=~"__NODE__"}[20s]) or
max_over_time(rdsosmetrics_diskIO_util{node_name=~"__NODE__"}[5m]))/100)
"#,
    disk_capacity_usage: r#"
avg by (node_name, mountpoint) (1 - (max_over_time(node_filesystem_free_bytes{node_name=~"__NODE__", mountpoint=~"(__MOUNT_POINTS__)", fstype!~"rootfs|selinuxfs|autofs|rpc_pipefs|tmpfs"}[20s]) or
max_over_time(node_filesystem_free_bytes{node_name=~"__NODE__", mountpoint=~"(__MOUNT_POINTS__)", fstype!~"rootfs|selinuxfs|autofs|rpc_pipefs|tmpfs"}[5m])) /
(max_over_time(node_filesystem_size_bytes{node_name=~"__NODE__", mountpoint=~"(__MOUNT_POINTS__)", fstype!~"rootfs|selinuxfs|autofs|rpc_pipefs|tmpfs"}[20s]) or
max_over_time(node_filesystem_size_bytes{node_name=~"__NODE__", mountpoint=~"(__MOUNT_POINTS__)", fstype!~"rootfs|selinuxfs|autofs|rpc_pipefs|tmpfs"}[5m])))
"#,
    connection_usage: r#"
avg by (service_name) (max(max_over_time(mysql_global_status_threads_connected{service_name=~"__SERVICE__"}[20s]) or
max_over_time(mysql_global_status_threads_connected{service_name=~"__SERVICE__"}[5m]))) /
avg by (service_name) (max_over_time(mysql_global_variables_max_connections{service_name=~"__SERVICE__"}[20s]) or
max_over_time(mysql_global_variables_max_connections{service_name=~"__SERVICE__"}[5m]))
"#,
    average_active_session_percents: r#"
avg by (service_name) (avg_over_time(mysql_global_status_threads_running{service_name=~"__SERVICE__"}[20s]) or
avg_over_time(mysql_global_status_threads_running{service_name=~"__SERVICE__"}[5m]))/
avg by (service_name) (max_over_time(mysql_global_status_threads_connected{service_name=~"__SERVICE__"}[20s]) or
max_over_time(mysql_global_status_threads_connected{service_name=~"__SERVICE__"}[5m]))
"#,
    cache_miss_ratio: r#"
avg by (service_name) ((rate(mysql_global_status_innodb_buffer_pool_reads{service_name=~"__SERVICE__"}[5m]) or
irate(mysql_global_status_innodb_buffer_pool_reads{service_name=~"__SERVICE__"}[5m])) /
(rate(mysql_global_status_innodb_buffer_pool_read_requests{service_name=~"__SERVICE__"}[5m]) or
irate(mysql_global_status_innodb_buffer_pool_read_requests{service_name=~"__SERVICE__"}[5m])))
"#,
};

/// Selects the named global variables from `schema`, one bind parameter per name.
pub fn variables_sql(schema: &str, count: usize) -> String {
    let placeholders = vec!["?"; count].join(", ");
    format!(
        "select variable_name as variable_name, variable_value as variable_value \
         from {schema}.global_variables \
         where variable_name in ({placeholders})"
    )
}

// `+ 0e0` turns the decimal size into a double on every MySQL version.
pub const LARGE_TABLES_SQL: &str = r#"
select table_schema                                                                  as table_schema,
       table_name                                                                    as table_name,
       cast(table_rows as signed)                                                    as table_rows,
       truncate((data_length + index_length) / 1024 / 1024 / 1024, 2) + 0e0          as table_size
from information_schema.tables
where table_type = 'BASE TABLE'
  and table_rows > ?
order by table_rows desc
"#;

/// Examples are collapsed to one row per query class, so the outer `limit`
/// caps the joined result the same way the inner one caps the ranking.
pub const QAN_MYSQL_SLOW_QUERY_SQL: &str = r#"
select qc.checksum                         as sql_id,
       coalesce(qc.fingerprint, '')        as fingerprint,
       coalesce(qe.query, '')              as example,
       coalesce(qe.db, '')                 as db_name,
       m.exec_count                        as exec_count,
       m.total_exec_time                   as total_exec_time,
       m.avg_exec_time                     as avg_exec_time,
       m.rows_examined_max                 as rows_examined_max
from (
         select qcm.query_class_id,
                cast(sum(qcm.query_count) as signed)                                as exec_count,
                truncate(sum(qcm.query_time_sum), 2) + 0e0                          as total_exec_time,
                truncate(sum(qcm.query_time_sum) / sum(qcm.query_count), 2) + 0e0   as avg_exec_time,
                cast(max(qcm.rows_examined_max) as signed)                          as rows_examined_max
         from query_class_metrics qcm
                  inner join instances i on qcm.instance_id = i.instance_id
         where i.name = ?
           and qcm.start_ts >= ?
           and qcm.start_ts < ?
           and qcm.rows_examined_max >= ?
         group by qcm.query_class_id
         order by rows_examined_max desc
         limit ?) m
         inner join query_classes qc on m.query_class_id = qc.query_class_id
         left join (select query_class_id,
                           max(query) as query,
                           max(db)    as db
                    from query_examples
                    group by query_class_id) qe on m.query_class_id = qe.query_class_id
order by m.rows_examined_max desc
limit ?
"#;

/// Sent over the ClickHouse HTTP interface; `{name:Type}` parameters are bound
/// through `param_<name>` query-string arguments.
pub const CLICKHOUSE_SLOW_QUERY_SQL: &str = r#"
select sm.sql_id                  as sql_id,
       m.fingerprint              as fingerprint,
       m.example                  as example,
       m.db_name                  as db_name,
       sm.exec_count              as exec_count,
       sm.total_exec_time         as total_exec_time,
       sm.avg_exec_time           as avg_exec_time,
       sm.rows_examined_max       as rows_examined_max
from (
         select queryid                                                           as sql_id,
                toInt64(sum(num_queries))                                         as exec_count,
                toFloat64(truncate(sum(m_query_time_sum), 2))                     as total_exec_time,
                toFloat64(truncate(sum(m_query_time_sum) / sum(num_queries), 2))  as avg_exec_time,
                toInt64(max(m_rows_examined_max))                                 as rows_examined_max
         from metrics
         where service_type = 'mysql'
           and service_name = {service_name:String}
           and period_start >= {start_time:DateTime}
           and period_start < {end_time:DateTime}
           and m_rows_examined_max >= {min_rows_examined:Int64}
         group by queryid
         order by rows_examined_max desc
         limit {limit:Int64}) sm
         left join (select queryid          as sql_id,
                           max(fingerprint) as fingerprint,
                           max(example)     as example,
                           max(database)    as db_name
                    from metrics
                    where service_type = 'mysql'
                      and service_name = {service_name:String}
                      and period_start >= {start_time:DateTime}
                      and period_start < {end_time:DateTime}
                      and m_rows_examined_max >= {min_rows_examined:Int64}
                    group by queryid) m
                   on sm.sql_id = m.sql_id
order by sm.rows_examined_max desc
FORMAT JSONEachRow
"#;
