//! # Connection：传输连接抽象与目录
//!
//! ## 核心意图（Why）
//! - 会话不关心底层是 WebSocket 还是内存通道，只要求连接能接收出站报文；
//! - 会话只记录连接 ID，通过 [`ConnectionManager`] 解析，避免会话与连接互相持有形成引用环。
//!
//! ## 行为契约（What）
//! - [`Connection::sending_push`] 拒绝报文时必须通过 [`PushError`] 交还所有权，会话据此把报文放回自身出站队列；
//! - [`QueuedConnection`] 以 [`BoundedQueue`] 实现该契约，满时返回 `WouldBlock` 而非阻塞，
//!   因此会话工作线程永远不会卡在某个慢连接上。
//!
//! ## 风险提示（Trade-offs）
//! - `DashMap` 的 guard 持有期间会阻塞同分片写操作，目录只对外返回克隆后的 `Arc`。

use std::{fmt, sync::Arc, time::Duration};

use dashmap::{DashMap, mapref::entry::Entry};
use tracing::debug;

use crate::{
    config::ConnectionConfig,
    error::{PushError, QueueError},
    queue::BoundedQueue,
    rpc::Envelope,
};

/// 出站传输端点。
pub trait Connection: Send + Sync + fmt::Debug {
    /// 目录内唯一的连接 ID。
    fn id(&self) -> &str;

    /// 接收一条出站报文。
    ///
    /// - **契约 (What)**：失败时原样交还报文；`WouldBlock` 表示稍后可重试，`Inactive` 表示连接已关闭；
    ///   会话在持有出站投递锁时调用本方法，实现不得阻塞，也不得回调同一会话的发送路径。
    fn sending_push(&self, envelope: Envelope) -> Result<(), PushError<Envelope>>;
}

/// 以 ID 索引的连接目录。
#[derive(Debug, Default)]
pub struct ConnectionManager {
    connections: DashMap<Arc<str>, Arc<dyn Connection>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记连接；ID 已被占用时保留原连接并返回 `false`。
    pub fn register(&self, connection: Arc<dyn Connection>) -> bool {
        let id: Arc<str> = Arc::from(connection.id());
        match self.connections.entry(Arc::clone(&id)) {
            Entry::Occupied(_) => false,
            Entry::Vacant(vacant) => {
                vacant.insert(connection);
                debug!(connection_id = %id, "connection registered");
                true
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Connection>> {
        self.connections.get(id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn remove(&self, id: &str) -> Option<Arc<dyn Connection>> {
        let removed = self.connections.remove(id).map(|(_, connection)| connection);
        if removed.is_some() {
            debug!(connection_id = id, "connection unregistered");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

/// 基于 [`BoundedQueue`] 的内存连接。
///
/// # 教案式说明
/// - **意图 (Why)**：充当回环传输与测试替身，真实传输层可以在另一端消费该队列；
/// - **契约 (What)**：
///   - 入队为非阻塞，满时返回 `WouldBlock`；
///   - [`close`](Self::close) 终止队列，此后推送返回 `Inactive`，残留报文仍可通过 [`drain`](Self::drain) 取出。
#[derive(Debug)]
pub struct QueuedConnection {
    id: Arc<str>,
    outbound: BoundedQueue<Envelope>,
}

impl QueuedConnection {
    pub fn new(id: impl Into<Arc<str>>, capacity: usize) -> Self {
        Self {
            id: id.into(),
            outbound: BoundedQueue::new(capacity),
        }
    }

    pub fn with_config(id: impl Into<Arc<str>>, config: &ConnectionConfig) -> Self {
        Self::new(id, config.outbound_capacity)
    }

    /// 取出一条待发送报文，空时返回 `WouldBlock`。
    pub fn sending_pop(&self) -> Result<Envelope, QueueError> {
        self.outbound.try_pop()
    }

    /// 限时等待一条待发送报文。
    pub fn sending_pop_timeout(&self, timeout: Duration) -> Result<Envelope, QueueError> {
        self.outbound.pop_timeout(timeout)
    }

    /// 取出全部残留报文，关闭后同样可用。
    pub fn drain(&self) -> Vec<Envelope> {
        let mut drained = Vec::new();
        self.outbound.flush(|envelope| drained.push(envelope));
        drained
    }

    pub fn pending(&self) -> usize {
        self.outbound.len()
    }

    pub fn close(&self) {
        self.outbound.terminate();
        debug!(connection_id = %self.id, "queued connection closed");
    }

    pub fn is_open(&self) -> bool {
        self.outbound.is_active()
    }
}

impl Connection for QueuedConnection {
    fn id(&self) -> &str {
        &self.id
    }

    fn sending_push(&self, envelope: Envelope) -> Result<(), PushError<Envelope>> {
        self.outbound.try_push(envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_rejects_duplicate_ids() {
        let manager = ConnectionManager::new();
        assert!(manager.register(Arc::new(QueuedConnection::new("conn-1", 0))));
        assert!(!manager.register(Arc::new(QueuedConnection::new("conn-1", 4))));
        assert_eq!(manager.len(), 1);

        let found = manager.get("conn-1").expect("已登记的连接应可解析");
        assert_eq!(found.id(), "conn-1");
        assert!(manager.remove("conn-1").is_some());
        assert!(manager.get("conn-1").is_none());
        assert!(manager.is_empty());
    }

    #[test]
    fn full_connection_hands_envelope_back() {
        let connection = QueuedConnection::new("conn-1", 1);
        connection
            .sending_push(Envelope::new())
            .expect("首条报文应入队");

        let mut second = Envelope::new();
        second.set_method("chat.send");
        let rejected = connection.sending_push(second).expect_err("满队列应拒绝");
        assert_eq!(rejected.kind, QueueError::WouldBlock);
        assert_eq!(rejected.into_value().method(), Some("chat.send"));
    }

    #[test]
    fn closed_connection_keeps_pending_for_drain() {
        let connection = QueuedConnection::new("conn-1", 0);
        connection.sending_push(Envelope::new()).expect("应入队");
        connection.close();

        assert!(!connection.is_open());
        let rejected = connection.sending_push(Envelope::new()).expect_err("关闭后应拒绝");
        assert_eq!(rejected.kind, QueueError::Inactive);
        assert_eq!(connection.drain().len(), 1);
        assert_eq!(connection.sending_pop(), Err(QueueError::Inactive));
    }
}
