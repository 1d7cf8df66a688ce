//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 为代理核心对外暴露的错误语义提供集中定义，覆盖队列、RPC 关联、协议注册与会话调度；
//! - 区分“调用方需要分支处理的状态”（如 `WouldBlock`、`Timeout`）与“配置/编排失败”。
//!
//! ## 设计要求（What）
//! - 所有错误类型均派生 `thiserror::Error`，可直接交给 `anyhow`/`eyre` 等上层框架；
//! - 队列原语使用更窄的 [`QueueError`]，通过 `From` 自动提升为 [`BladeError`]，便于 `?` 传播；
//! - 注册表内部一致性破坏属于程序缺陷，直接 panic，不在此处建模。

use thiserror::Error;

use crate::core::session::SessionState;

/// 队列原语的状态码。
///
/// # 教案式说明
/// - **意图 (Why)**：`try_*`、`pop_timeout` 与终止后的调用需要返回可分支的状态，而非 panic；
/// - **契约 (What)**：`WouldBlock` 仅由 `try_push`/`try_pop` 产生，`Timeout` 仅由 `pop_timeout` 产生，
///   `Inactive` 表示队列已被 `terminate()`，此后所有操作都会得到该结果。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Error)]
pub enum QueueError {
    #[error("queue operation would block")]
    WouldBlock,
    #[error("queue operation timed out")]
    Timeout,
    #[error("queue has been terminated")]
    Inactive,
}

/// `push`/`try_push` 失败时的返回值，携带被拒绝的元素。
///
/// - **意图 (Why)**：元素所有权已移交给队列，失败时必须交还调用方，避免静默丢弃；
/// - **契约 (What)**：`kind` 为 [`QueueError::WouldBlock`] 或 [`QueueError::Inactive`]。
#[derive(Debug, Error)]
#[error("{kind}")]
pub struct PushError<V> {
    pub kind: QueueError,
    pub value: V,
}

impl<V> PushError<V> {
    /// 供自定义连接实现在拒绝报文时交还所有权。
    pub fn new(kind: QueueError, value: V) -> Self {
        Self { kind, value }
    }

    /// 取回被拒绝的元素。
    pub fn into_value(self) -> V {
        self.value
    }
}

/// 代理核心错误域。
///
/// # 教案式说明
/// - **意图 (Why)**：聚合会话生命周期、注册表查询、RPC 构造等关键路径的异常；
/// - **契约 (What)**：
///   - 所有变体均为 `Send + Sync + 'static`，可跨线程传播；
///   - 携带的上下文（会话 ID、注册键、方法名）均为拥有所有权的 `String`；
/// - **设计权衡 (Trade-offs)**：`InvalidRequest` 取代了“返回消息 ID 0”的哨兵约定，
///   调用方不再需要记住 0 代表“不要发送”。
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum BladeError {
    /// 非阻塞操作遇到满队列或空队列。
    #[error("operation would block")]
    WouldBlock,

    /// 限时等待到期。
    #[error("operation timed out")]
    Timeout,

    /// 目标队列已终止。
    #[error("target queue is inactive")]
    Inactive,

    /// 注册表或会话目录未命中。
    ///
    /// - **契约 (What)**：`key` 为查询使用的键，例如 `chat@example.com` 或会话 ID。
    #[error("`{key}` was not found")]
    NotFound { key: String },

    /// 请求报文缺少 `id` 或 `method`，无法构造响应。
    #[error("invalid rpc request: {reason}")]
    InvalidRequest { reason: String },

    /// 构造器无法获取资源，例如工作线程创建失败。
    #[error("resource exhausted while {context}")]
    ResourceExhausted { context: String },

    /// 状态机拒绝非法跃迁。
    ///
    /// - **意图 (Why)**：阻止 `Destroy` 之后回到 `Ready` 之类破坏生命周期顺序的调用；
    /// - **契约 (What)**：`from` 为当前状态，`to` 为请求状态。
    #[error("invalid state transition for session `{session_id}`: {from:?} -> {to:?} is not permitted")]
    InvalidStateTransition {
        session_id: String,
        from: SessionState,
        to: SessionState,
    },

    /// 会话目录中已存在同 ID 的会话。
    #[error("session `{session_id}` already exists")]
    SessionAlreadyExists { session_id: String },

    /// 工作线程已在运行，重复 `startup` 被拒绝。
    #[error("session `{session_id}` worker is already running")]
    AlreadyStarted { session_id: String },

    /// 配置解析或校验失败。
    #[error("invalid configuration: {detail}")]
    Config { detail: String },

    /// RPC 处理器返回失败。
    #[error("handler for `{method}` failed: {detail}")]
    Handler { method: String, detail: String },
}

impl BladeError {
    /// 以注册键或会话 ID 构造未命中错误。
    pub fn not_found(key: impl Into<String>) -> Self {
        BladeError::NotFound { key: key.into() }
    }

    /// 以原因描述构造非法请求错误。
    pub fn invalid_request(reason: impl Into<String>) -> Self {
        BladeError::InvalidRequest {
            reason: reason.into(),
        }
    }

    /// 是否为“稍后重试即可”的瞬时状态。
    ///
    /// - **意图 (Why)**：工作线程在迁移报文时需区分“连接暂时满”与“连接已关闭”；
    /// - **契约 (What)**：仅 `WouldBlock` 与 `Timeout` 返回 `true`。
    pub fn is_transient(&self) -> bool {
        matches!(self, BladeError::WouldBlock | BladeError::Timeout)
    }
}

impl From<QueueError> for BladeError {
    fn from(value: QueueError) -> Self {
        match value {
            QueueError::WouldBlock => BladeError::WouldBlock,
            QueueError::Timeout => BladeError::Timeout,
            QueueError::Inactive => BladeError::Inactive,
        }
    }
}

impl<V> From<PushError<V>> for BladeError {
    fn from(value: PushError<V>) -> Self {
        value.kind.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_errors_lift_into_blade_errors() {
        assert_eq!(BladeError::from(QueueError::Inactive), BladeError::Inactive);
        let rejected = PushError::new(QueueError::WouldBlock, 7_u8);
        assert_eq!(BladeError::from(rejected), BladeError::WouldBlock);
        assert!(BladeError::WouldBlock.is_transient());
        assert!(!BladeError::Inactive.is_transient());
    }

    #[test]
    fn display_carries_context() {
        let err = BladeError::not_found("chat@example.com");
        assert_eq!(err.to_string(), "`chat@example.com` was not found");
    }
}
