//! # routing：出站连接选择策略
//!
//! - **意图 (Why)**：会话可能同时挂载多条连接，选择哪一条属于策略问题，不应硬编码在会话里；
//! - **契约 (What)**：候选列表按挂载顺序排列，策略返回其中一个 ID 或 `None`（不发送，留在会话队列）；
//! - **默认 (How)**：[`FirstAttached`] 总是选择最早挂载的连接。

use std::{fmt, sync::Arc};

use crate::rpc::Envelope;

/// 连接选择策略。
pub trait ConnectionChooser: Send + Sync + fmt::Debug {
    fn choose<'a>(&self, envelope: &Envelope, candidates: &'a [Arc<str>]) -> Option<&'a Arc<str>>;
}

/// 选择最早挂载的连接。
#[derive(Clone, Copy, Debug, Default)]
pub struct FirstAttached;

impl ConnectionChooser for FirstAttached {
    fn choose<'a>(&self, _envelope: &Envelope, candidates: &'a [Arc<str>]) -> Option<&'a Arc<str>> {
        candidates.first()
    }
}
