//! # RpcCorrelator：消息 ID 分配与请求/响应构造
//!
//! ## 核心意图（Why）
//! - 请求与响应通过 `id` 关联，ID 必须在进程内单调且唯一，`0` 保留为“无 ID”；
//! - 生成器以显式对象注入而非隐藏的全局变量，测试中可以并存多个互不干扰的关联器。
//!
//! ## 契约说明（What）
//! - [`MessageIdGenerator::next_id`] 回绕时跳过 0；
//! - 响应沿用请求的 `id` 与 `method`，`result`/`error` 缺省时补建空对象，调用方随后可通过
//!   [`Envelope::result_mut`]/[`Envelope::error_mut`] 填充；
//! - 请求缺少 `id` 或 `method` 时返回 [`BladeError::InvalidRequest`]，调用方据此放弃发送。

use std::sync::{
    Arc,
    atomic::{AtomicU32, Ordering},
};

use serde_json::{Map, Value};

use super::envelope::{
    Envelope, FIELD_BLADE, FIELD_ERROR, FIELD_PARAMS, FIELD_RESULT, MessageId,
};
use crate::error::BladeError;

/// 单调递增的消息 ID 生成器。
///
/// # 教案式说明
/// - **意图 (Why)**：取代进程级全局计数器，生命周期由持有者决定；
/// - **执行 (How)**：`fetch_update` 在一次比较交换中完成“加一并跳过 0”，多线程并发调用不会产出重复值；
/// - **契约 (What)**：在 2^32 - 1 次调用内产出的值两两不同且均不为 0。
#[derive(Debug, Default)]
pub struct MessageIdGenerator {
    last: AtomicU32,
}

impl MessageIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// 从指定值之后开始分配，用于回绕测试或进程恢复。
    pub fn starting_after(last: u32) -> Self {
        Self {
            last: AtomicU32::new(last),
        }
    }

    /// 分配下一个 ID。
    pub fn next_id(&self) -> MessageId {
        let previous = self
            .last
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(advance(current))
            })
            .unwrap_or_else(|current| current);
        MessageId::new(advance(previous))
    }
}

fn advance(current: u32) -> u32 {
    match current.wrapping_add(1) {
        0 => 1,
        next => next,
    }
}

/// 请求/响应报文的构造器。
///
/// - **契约 (What)**：克隆开销仅为一次 `Arc` 引用计数，克隆体共享同一个 ID 序列。
#[derive(Clone, Debug, Default)]
pub struct RpcCorrelator {
    ids: Arc<MessageIdGenerator>,
}

impl RpcCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// 使用外部注入的生成器，允许多个关联器共享同一 ID 序列。
    pub fn with_generator(ids: Arc<MessageIdGenerator>) -> Self {
        Self { ids }
    }

    pub fn next_id(&self) -> MessageId {
        self.ids.next_id()
    }

    /// 构造请求报文。
    ///
    /// # 教案式注释
    /// - **契约 (What)**：
    ///   - `method` 为 `namespace.command`；
    ///   - `params` 为 `None` 时写入空对象，调用方可通过 [`Envelope::params_mut`] 在发送前填充；
    ///   - 返回的 ID 与报文中的 `id` 一致。
    pub fn new_request(
        &self,
        namespace: &str,
        command: &str,
        params: Option<Value>,
    ) -> (MessageId, Envelope) {
        let id = self.next_id();
        let mut envelope = Envelope::new();
        envelope.set_id(id);
        envelope.set_method(format!("{namespace}.{command}"));
        envelope.insert(
            FIELD_PARAMS,
            params.unwrap_or_else(|| Value::Object(Map::new())),
        );
        (id, envelope)
    }

    /// 构造成功响应。
    pub fn new_response(
        &self,
        request: &Envelope,
        result: Option<Value>,
    ) -> Result<(MessageId, Envelope), BladeError> {
        self.reply(request, FIELD_RESULT, result)
    }

    /// 构造错误响应；与 `result` 互斥。
    pub fn new_error_response(
        &self,
        request: &Envelope,
        error: Option<Value>,
    ) -> Result<(MessageId, Envelope), BladeError> {
        self.reply(request, FIELD_ERROR, error)
    }

    fn reply(
        &self,
        request: &Envelope,
        slot: &str,
        payload: Option<Value>,
    ) -> Result<(MessageId, Envelope), BladeError> {
        let id = request
            .id()
            .filter(|id| !id.is_none())
            .ok_or_else(|| BladeError::invalid_request("request carries no id"))?;
        let method = request
            .method()
            .ok_or_else(|| BladeError::invalid_request("request carries no method"))?;

        let mut envelope = Envelope::new();
        envelope.set_id(id);
        envelope.set_method(method);
        envelope.insert(slot, payload.unwrap_or_else(|| Value::Object(Map::new())));
        if let Some(fields) = request.fields() {
            envelope.set_fields(&fields.reply());
        } else if let Some(raw) = request.as_map().get(FIELD_BLADE) {
            envelope.insert(FIELD_BLADE, raw.clone());
        }
        Ok((id, envelope))
    }
}
