//! # config 模块说明
//!
//! ## 角色定位（Why）
//! - 汇总代理核心的可调参数：会话队列容量、工作线程轮询间隔与命名、内存连接容量，以及主节点身份；
//! - 以 TOML 文本承载，字段全部带默认值，空文档即可得到可用配置。
//!
//! ## 契约说明（What）
//! - 解析入口为 [`BladeConfig::from_toml_str`]，解析失败与校验失败统一映射为 [`BladeError::Config`]；
//! - 容量为 0 表示无界，与 [`BoundedQueue::new`](crate::queue::BoundedQueue::new) 的约定一致。
//!
//! ## 示例
//! ```toml
//! [session]
//! outbound_capacity = 256
//! worker_poll_interval_ms = 10
//!
//! [master]
//! nodeid = "master.example.com"
//! realms = ["example.com"]
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::BladeError;

const DEFAULT_QUEUE_CAPACITY: usize = 0;
const DEFAULT_POLL_INTERVAL_MS: u64 = 100;
const DEFAULT_WORKER_PREFIX: &str = "blade-session";
const DEFAULT_NODE_ID: &str = "blade-master";

/// 代理核心配置根。
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BladeConfig {
    pub session: SessionConfig,
    pub connection: ConnectionConfig,
    pub master: MasterConfig,
}

/// 单个会话的队列与工作线程参数。
///
/// # 教案式说明
/// - **契约 (What)**：
///   - `outbound_capacity`/`inbound_capacity`：会话自有队列容量，0 表示无界；
///   - `worker_poll_interval_ms`：工作线程在无信号时的最长休眠，0 表示以 `yield_now` 轮询；
///   - `worker_name_prefix`：工作线程名前缀，不可为空。
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    pub outbound_capacity: usize,
    pub inbound_capacity: usize,
    pub worker_poll_interval_ms: u64,
    pub worker_name_prefix: String,
}

impl SessionConfig {
    pub fn worker_poll_interval(&self) -> Duration {
        Duration::from_millis(self.worker_poll_interval_ms)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            outbound_capacity: DEFAULT_QUEUE_CAPACITY,
            inbound_capacity: DEFAULT_QUEUE_CAPACITY,
            worker_poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            worker_name_prefix: DEFAULT_WORKER_PREFIX.to_owned(),
        }
    }
}

/// 内存连接的出站队列参数。
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConnectionConfig {
    pub outbound_capacity: usize,
}

/// 主节点身份。
///
/// - **契约 (What)**：`nodeid` 用于校验核心 RPC 的 `responder-nodeid`；`realms` 为空时不限制发布的 realm。
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MasterConfig {
    pub nodeid: String,
    pub realms: Vec<String>,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            nodeid: DEFAULT_NODE_ID.to_owned(),
            realms: Vec::new(),
        }
    }
}

impl MasterConfig {
    /// realm 是否在允许列表内；列表为空视为全部允许。
    pub fn permits_realm(&self, realm: &str) -> bool {
        self.realms.is_empty() || self.realms.iter().any(|allowed| allowed == realm)
    }
}

impl BladeConfig {
    /// 从 TOML 文本解析并校验配置。
    ///
    /// # 教案式注释
    /// - **契约 (What)**：缺省字段取默认值；未知字段、类型错误与校验失败均返回 [`BladeError::Config`]。
    pub fn from_toml_str(text: &str) -> Result<Self, BladeError> {
        let config: BladeConfig = toml::from_str(text).map_err(|err| BladeError::Config {
            detail: err.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// 校验字段取值。
    pub fn validate(&self) -> Result<(), BladeError> {
        if self.session.worker_name_prefix.trim().is_empty() {
            return Err(BladeError::Config {
                detail: "session.worker_name_prefix must not be empty".to_owned(),
            });
        }
        if self.master.nodeid.trim().is_empty() {
            return Err(BladeError::Config {
                detail: "master.nodeid must not be empty".to_owned(),
            });
        }
        if let Some(index) = self
            .master
            .realms
            .iter()
            .position(|realm| realm.trim().is_empty())
        {
            return Err(BladeError::Config {
                detail: format!("master.realms[{index}] must not be empty"),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config = BladeConfig::from_toml_str("").expect("空文档应使用默认值");
        assert_eq!(config, BladeConfig::default());
        assert_eq!(config.session.worker_poll_interval(), Duration::from_millis(100));
        assert!(config.master.permits_realm("anything"));
    }

    #[test]
    fn parses_every_section() {
        let config = BladeConfig::from_toml_str(
            r#"
            [session]
            outbound_capacity = 64
            inbound_capacity = 32
            worker_poll_interval_ms = 0
            worker_name_prefix = "edge"

            [connection]
            outbound_capacity = 16

            [master]
            nodeid = "master.example.com"
            realms = ["example.com", "example.org"]
            "#,
        )
        .expect("完整配置应解析成功");

        assert_eq!(config.session.outbound_capacity, 64);
        assert_eq!(config.session.inbound_capacity, 32);
        assert_eq!(config.session.worker_poll_interval(), Duration::ZERO);
        assert_eq!(config.session.worker_name_prefix, "edge");
        assert_eq!(config.connection.outbound_capacity, 16);
        assert_eq!(config.master.nodeid, "master.example.com");
        assert!(config.master.permits_realm("example.org"));
        assert!(!config.master.permits_realm("example.net"));
    }

    #[test]
    fn rejects_invalid_values() {
        let blank_prefix = BladeConfig::from_toml_str("[session]\nworker_name_prefix = \"\"");
        assert!(matches!(blank_prefix, Err(BladeError::Config { .. })));

        let blank_realm = BladeConfig::from_toml_str("[master]\nrealms = [\"example.com\", \" \"]");
        match blank_realm {
            Err(BladeError::Config { detail }) => assert!(detail.contains("realms[1]")),
            other => panic!("期望配置错误，得到 {other:?}"),
        }

        let unknown = BladeConfig::from_toml_str("[session]\nqueue_depth = 3");
        assert!(matches!(unknown, Err(BladeError::Config { .. })));

        let wrong_type = BladeConfig::from_toml_str("[session]\noutbound_capacity = \"many\"");
        assert!(matches!(wrong_type, Err(BladeError::Config { .. })));
    }
}
