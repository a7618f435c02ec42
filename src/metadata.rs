//! Resolution of server, monitoring-system and database identities from the
//! DAS metadata tables.

use crate::healthcheck::error::{HealthcheckError, Result};
use crate::healthcheck::models::{MonitorSystem, MySQLServer};
use async_trait::async_trait;
use sqlx::MySqlPool;
use std::sync::Arc;
use tracing::debug;

/// Cluster type of a MySQL cluster in `t_meta_db_info`.
pub const MYSQL_CLUSTER_TYPE: i32 = 1;

#[async_trait]
pub trait MetadataResolver: Send + Sync + std::fmt::Debug {
    async fn get_mysql_server(&self, mysql_server_id: i64) -> Result<MySQLServer>;
    async fn get_mysql_server_by_host_info(&self, host_ip: &str, port_num: i32) -> Result<MySQLServer>;
    /// Monitoring system of the cluster the server belongs to.
    async fn get_monitor_system(&self, mysql_server: &MySQLServer) -> Result<MonitorSystem>;
    async fn get_db_id(&self, db_name: &str, cluster_id: i64, cluster_type: i32) -> Result<i64>;
}

const MYSQL_SERVER_COLUMNS: &str =
    "id, cluster_id, host_ip, port_num, service_name, version";

#[derive(Debug, Clone)]
pub struct MySqlMetadataResolver {
    pool: Arc<MySqlPool>,
}

impl MySqlMetadataResolver {
    pub fn new(pool: Arc<MySqlPool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MetadataResolver for MySqlMetadataResolver {
    async fn get_mysql_server(&self, mysql_server_id: i64) -> Result<MySQLServer> {
        debug!("Resolving mysql server {}", mysql_server_id);
        let sql = format!(
            "SELECT {MYSQL_SERVER_COLUMNS} FROM t_meta_mysql_server_info \
             WHERE del_flag = 0 AND id = ?"
        );
        sqlx::query_as::<_, MySQLServer>(&sql)
            .bind(mysql_server_id)
            .fetch_optional(self.pool.as_ref())
            .await?
            .ok_or_else(|| {
                HealthcheckError::Metadata(format!("mysql server {mysql_server_id} does not exist"))
            })
    }

    async fn get_mysql_server_by_host_info(&self, host_ip: &str, port_num: i32) -> Result<MySQLServer> {
        debug!("Resolving mysql server {}:{}", host_ip, port_num);
        let sql = format!(
            "SELECT {MYSQL_SERVER_COLUMNS} FROM t_meta_mysql_server_info \
             WHERE del_flag = 0 AND host_ip = ? AND port_num = ?"
        );
        sqlx::query_as::<_, MySQLServer>(&sql)
            .bind(host_ip)
            .bind(port_num)
            .fetch_optional(self.pool.as_ref())
            .await?
            .ok_or_else(|| {
                HealthcheckError::Metadata(format!("mysql server {host_ip}:{port_num} does not exist"))
            })
    }

    async fn get_monitor_system(&self, mysql_server: &MySQLServer) -> Result<MonitorSystem> {
        sqlx::query_as::<_, MonitorSystem>(
            "SELECT ms.id, ms.system_type, ms.host_ip, ms.port_num, ms.port_num_slow, ms.base_url \
             FROM t_meta_monitor_system_info ms \
             INNER JOIN t_meta_mysql_cluster_info mc ON mc.monitor_system_id = ms.id \
             WHERE ms.del_flag = 0 AND mc.del_flag = 0 AND mc.id = ?",
        )
        .bind(mysql_server.cluster_id)
        .fetch_optional(self.pool.as_ref())
        .await?
        .ok_or_else(|| {
            HealthcheckError::Metadata(format!(
                "monitor system of mysql cluster {} does not exist",
                mysql_server.cluster_id
            ))
        })
    }

    async fn get_db_id(&self, db_name: &str, cluster_id: i64, cluster_type: i32) -> Result<i64> {
        sqlx::query_scalar::<_, i64>(
            "SELECT id FROM t_meta_db_info \
             WHERE del_flag = 0 AND db_name = ? AND cluster_id = ? AND cluster_type = ? \
             ORDER BY id LIMIT 1",
        )
        .bind(db_name)
        .bind(cluster_id)
        .bind(cluster_type)
        .fetch_optional(self.pool.as_ref())
        .await?
        .ok_or_else(|| {
            HealthcheckError::Metadata(format!(
                "database {db_name} of cluster {cluster_id} does not exist"
            ))
        })
    }
}
