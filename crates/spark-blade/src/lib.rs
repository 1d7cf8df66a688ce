//! # spark-blade
//!
//! ## 定位与职责（Why）
//! - 面向会话/协议代理的消息核心：多个控制器为 `(protocol, realm)` 发布实现，调用方按协议定位提供者，
//!   并通过会话在一条或多条连接上收发 JSON-RPC 风格报文；
//! - 并发协调、生产者/消费者背压、提供者集合与请求/响应关联都在这里完成，物理传输由外部连接实现。
//!
//! ## 架构嵌入（Where）
//! - `queue`：有界阻塞 FIFO，是会话与连接缓冲的唯一原语；
//! - `rpc`：报文外壳、消息 ID 关联与命名空间处理器表；
//! - `registry`：协议提供者注册表；
//! - `core`：会话状态机、会话/连接目录、连接选择策略与 [`BladeHandle`] 门面；
//! - `config`/`telemetry`/`error`：配置加载、日志订阅器安装与错误域。
//!
//! ## 并发模型（Trade-offs）
//! - 每个会话独占一个工作线程，没有中心事件循环；
//! - 注册表由单把读写锁保护，查询返回拥有所有权的快照。

/// 配置模型与 TOML 加载。
pub mod config;

/// 会话生命周期、目录与门面。
///
/// - **意图说明 (Why)**：集中处理会话的创建、连接挂载、报文迁移与关闭；
/// - **契约定位 (What)**：所有类型均为 `Send + Sync`，可在线程间共享；
/// - **扩展指引 (How)**：替换 [`core::ConnectionChooser`] 定制出站选择，实现 [`core::Connection`] 接入真实传输。
pub mod core;

/// 错误类型与诊断信息集中声明处。
///
/// - **契约定位 (What)**：使用 `thiserror::Error` 派生；队列原语的窄错误可经 `?` 提升为 [`BladeError`]；
/// - **风险提示 (Trade-offs)**：应注意区分瞬时状态与不可恢复错误，避免误导上层重试策略。
pub mod error;

pub mod queue;
pub mod registry;
pub mod rpc;
pub mod telemetry;

pub use crate::config::BladeConfig;
pub use crate::core::{
    BladeHandle, Connection, ConnectionChooser, ConnectionManager, FirstAttached,
    InboundProcessor, QueuedConnection, ResponseCallback, Session, SessionManager, SessionState,
};
pub use crate::error::{BladeError, PushError, QueueError};
pub use crate::queue::{BoundedQueue, QueueStats};
pub use crate::registry::{ProtocolRegistry, ProtocolSnapshot};
pub use crate::rpc::{
    Envelope, HandlerFlow, HandlerOutcome, MessageId, MessageIdGenerator, RpcCorrelator,
    RpcFields, RpcHandler, RpcHandlerRegistry,
};
