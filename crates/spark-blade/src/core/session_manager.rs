//! # SessionManager：会话目录
//!
//! ## 核心意图（Why）
//! - 提供基于 `DashMap` 的并发安全目录，确保多线程环境下对会话的登记、查询、回收具备原子语义；
//! - 入站处理器只拿到会话 ID，需要经目录找回会话再发送回复。
//!
//! ## 行为契约（What）
//! - `create_session`：ID 已存在时返回 [`BladeError::SessionAlreadyExists`]；
//! - `get_session`：返回克隆后的 `Arc<Session>`，不把 `DashMap` guard 暴露给调用方；
//! - `remove_session`：原子移除并返回会话，不会自动 `shutdown`；
//! - `shutdown_all`：清空目录并逐个关闭会话。
//!
//! ## 风险提示（Trade-offs）
//! - `shutdown_all` 先收集再关闭，关闭期间新登记的会话不受影响，需要由上层保证关闭顺序。

use std::sync::Arc;

use dashmap::{DashMap, mapref::entry::Entry};
use tracing::{debug, info};

use crate::{core::session::Session, error::BladeError};

/// `SessionManager` 负责集中管理 [`Session`]。
#[derive(Debug, Default)]
pub struct SessionManager {
    sessions: DashMap<Arc<str>, Arc<Session>>,
}

impl SessionManager {
    /// 创建空的会话目录。
    pub fn new() -> Self {
        Self::default()
    }

    /// 将会话登记到目录中。
    ///
    /// # 教案式注释
    /// - **意图 (Why)**：原子地插入新会话，阻止同一 ID 覆盖；
    /// - **契约 (What)**：
    ///   - **前置条件**：同一 ID 不应已存在，否则返回 `SessionAlreadyExists`；
    ///   - **后置条件**：成功时目录中出现新条目。
    pub fn create_session(&self, session: Arc<Session>) -> Result<(), BladeError> {
        let session_id = Arc::clone(session.id_arc());
        match self.sessions.entry(Arc::clone(&session_id)) {
            Entry::Occupied(_) => Err(BladeError::SessionAlreadyExists {
                session_id: session_id.to_string(),
            }),
            Entry::Vacant(vacant) => {
                vacant.insert(session);
                debug!(session_id = %session_id, "session registered");
                Ok(())
            }
        }
    }

    /// 按 ID 获取会话。
    pub fn get_session(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions
            .get(session_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// 移除并返回会话。
    pub fn remove_session(&self, session_id: &str) -> Option<Arc<Session>> {
        let removed = self.sessions.remove(session_id).map(|(_, session)| session);
        if removed.is_some() {
            debug!(session_id, "session unregistered");
        }
        removed
    }

    /// 当前登记的全部会话 ID。
    pub fn session_ids(&self) -> Vec<Arc<str>> {
        self.sessions
            .iter()
            .map(|entry| Arc::clone(entry.key()))
            .collect()
    }

    /// 清空目录并关闭所有会话，返回关闭数量。
    pub fn shutdown_all(&self) -> usize {
        let ids = self.session_ids();
        let mut closed = 0;
        for id in ids {
            if let Some(session) = self.remove_session(&id) {
                session.shutdown();
                closed += 1;
            }
        }
        info!(closed, "all sessions shut down");
        closed
    }

    /// 当前管理的会话数量。
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// 目录是否为空。
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::SessionConfig, core::connection::ConnectionManager};

    fn session() -> Arc<Session> {
        Arc::new(Session::new(
            &SessionConfig::default(),
            Arc::new(ConnectionManager::new()),
        ))
    }

    #[test]
    fn register_lookup_remove() {
        let manager = SessionManager::new();
        let session = session();
        let id = session.id().to_owned();

        manager
            .create_session(Arc::clone(&session))
            .expect("首次登记应成功");
        assert!(matches!(
            manager.create_session(Arc::clone(&session)),
            Err(BladeError::SessionAlreadyExists { .. })
        ));

        let found = manager.get_session(&id).expect("应能按 ID 找回会话");
        assert!(Arc::ptr_eq(&found, &session));
        assert!(manager.remove_session(&id).is_some());
        assert!(manager.get_session(&id).is_none());
        assert!(manager.is_empty());
    }

    #[test]
    fn shutdown_all_stops_workers_and_empties_directory() {
        let manager = SessionManager::new();
        let sessions: Vec<_> = (0..3).map(|_| session()).collect();
        for session in &sessions {
            session.startup().expect("启动应成功");
            manager
                .create_session(Arc::clone(session))
                .expect("登记应成功");
        }
        assert_eq!(manager.len(), 3);

        assert_eq!(manager.shutdown_all(), 3);
        assert!(manager.is_empty());
        assert!(sessions.iter().all(|session| !session.is_running()));
    }
}
