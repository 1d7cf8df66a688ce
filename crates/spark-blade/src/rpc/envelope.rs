//! # Envelope：JSON-RPC 风格的报文外壳
//!
//! ## 核心意图（Why）
//! - 代理核心只关心报文的“四槽形状”：协议标记、`id`、`method`、`params`/`result`/`error`；
//!   其余字段原样透传，因此以 `serde_json` 对象作为底层存储；
//! - 通过访问器集中处理字段名，避免各处散落字符串字面量。
//!
//! ## 契约说明（What）
//! - 请求：`{"jsonrpc":"2.0","id":N,"method":"ns.cmd","params":{...}}`；
//! - 响应：同样的 `id`/`method`，携带 `result` 或 `error` 之一（互斥）；
//! - 可选的 `"blade"` 路由块承载 `to`/`from`/`token`/`version`，见 [`RpcFields`]。

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::BladeError;

pub(crate) const PROTOCOL_MARKER: &str = "jsonrpc";
pub(crate) const PROTOCOL_VERSION: &str = "2.0";
pub(crate) const FIELD_ID: &str = "id";
pub(crate) const FIELD_METHOD: &str = "method";
pub(crate) const FIELD_PARAMS: &str = "params";
pub(crate) const FIELD_RESULT: &str = "result";
pub(crate) const FIELD_ERROR: &str = "error";
pub(crate) const FIELD_BLADE: &str = "blade";

/// 进程内消息 ID。
///
/// # 教案式说明
/// - **意图 (Why)**：以新类型区分“消息 ID”与普通整数，避免与其它计数混用；
/// - **契约 (What)**：`0` 保留为 [`MessageId::NONE`]，生成器永不产出该值。
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(u32);

impl MessageId {
    /// 保留的“无 ID”哨兵值。
    pub const NONE: MessageId = MessageId(0);

    pub const fn new(raw: u32) -> Self {
        MessageId(raw)
    }

    pub const fn get(self) -> u32 {
        self.0
    }

    pub const fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// `"blade"` 路由块。
///
/// - **意图 (Why)**：请求方通过 `to`/`from` 指明路由端点，`token` 用于鉴权，`version` 记录命名空间版本；
/// - **契约 (What)**：所有字段均可缺省；序列化时跳过 `None`。
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct RpcFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl RpcFields {
    /// 为响应生成路由块：交换 `to`/`from`，保留 `token` 与 `version`。
    pub fn reply(&self) -> RpcFields {
        RpcFields {
            to: self.from.clone(),
            from: self.to.clone(),
            token: self.token.clone(),
            version: self.version.clone(),
        }
    }

    fn is_empty(&self) -> bool {
        self.to.is_none() && self.from.is_none() && self.token.is_none() && self.version.is_none()
    }
}

/// 将 `namespace.command` 在第一个 `.` 处拆分。
///
/// - **契约 (What)**：没有 `.` 时整体视为命名空间、命令为空串；命令部分可以继续包含 `.`。
pub fn split_method(method: &str) -> (&str, &str) {
    method.split_once('.').unwrap_or((method, ""))
}

/// 单条 RPC 报文。
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Envelope {
    body: Map<String, Value>,
}

impl Envelope {
    /// 创建带协议标记的空报文。
    pub fn new() -> Self {
        let mut body = Map::new();
        body.insert(
            PROTOCOL_MARKER.to_owned(),
            Value::String(PROTOCOL_VERSION.to_owned()),
        );
        Self { body }
    }

    /// 以任意 JSON 对象构造报文；非对象值被拒绝。
    pub fn from_value(value: Value) -> Result<Self, BladeError> {
        match value {
            Value::Object(body) => Ok(Self { body }),
            other => Err(BladeError::invalid_request(format!(
                "envelope must be a json object, got `{other}`"
            ))),
        }
    }

    /// 从线上字节解码。
    pub fn from_slice(bytes: &[u8]) -> Result<Self, BladeError> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|err| BladeError::invalid_request(format!("malformed json: {err}")))?;
        Self::from_value(value)
    }

    /// 编码为紧凑 JSON 字节。
    pub fn to_vec(&self) -> Vec<u8> {
        // `Map<String, Value>` 的序列化不会失败。
        serde_json::to_vec(&self.body).unwrap_or_default()
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.body)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.body
    }

    /// 报文 ID；缺失、非数字或超出 `u32` 时返回 `None`。
    pub fn id(&self) -> Option<MessageId> {
        self.body
            .get(FIELD_ID)
            .and_then(Value::as_u64)
            .and_then(|raw| u32::try_from(raw).ok())
            .map(MessageId::new)
    }

    pub fn set_id(&mut self, id: MessageId) {
        self.body.insert(FIELD_ID.to_owned(), Value::from(id.get()));
    }

    pub fn method(&self) -> Option<&str> {
        self.body.get(FIELD_METHOD).and_then(Value::as_str)
    }

    pub fn set_method(&mut self, method: impl Into<String>) {
        self.body
            .insert(FIELD_METHOD.to_owned(), Value::String(method.into()));
    }

    pub fn params(&self) -> Option<&Value> {
        self.body.get(FIELD_PARAMS)
    }

    /// `params` 的可变引用，缺失时补建空对象。
    pub fn params_mut(&mut self) -> &mut Value {
        self.slot_mut(FIELD_PARAMS)
    }

    pub fn result(&self) -> Option<&Value> {
        self.body.get(FIELD_RESULT)
    }

    /// `result` 的可变引用；会移除已有的 `error` 以保持互斥。
    pub fn result_mut(&mut self) -> &mut Value {
        self.body.remove(FIELD_ERROR);
        self.slot_mut(FIELD_RESULT)
    }

    pub fn error(&self) -> Option<&Value> {
        self.body.get(FIELD_ERROR)
    }

    /// `error` 的可变引用；会移除已有的 `result` 以保持互斥。
    pub fn error_mut(&mut self) -> &mut Value {
        self.body.remove(FIELD_RESULT);
        self.slot_mut(FIELD_ERROR)
    }

    fn slot_mut(&mut self, key: &str) -> &mut Value {
        self.body
            .entry(key.to_owned())
            .or_insert_with(|| Value::Object(Map::new()))
    }

    pub(crate) fn insert(&mut self, key: &str, value: Value) {
        self.body.insert(key.to_owned(), value);
    }

    /// 是否为请求：既没有 `result` 也没有 `error`。
    pub fn is_request(&self) -> bool {
        !self.body.contains_key(FIELD_RESULT) && !self.body.contains_key(FIELD_ERROR)
    }

    /// 协议标记检查。
    ///
    /// # 教案式注释
    /// - **契约 (What)**：当 `"jsonrpc"` 标记**缺失**时返回 `true`。
    /// - **风险 (Trade-offs)**：该语义与名称相反，沿用自既有的 blade 实现以保持互通；
    ///   在确认上游意图前不要私自取反，调用方如需“标记存在”请使用 [`has_protocol_marker`](Self::has_protocol_marker)。
    pub fn is_rpc_envelope(&self) -> bool {
        !self.body.contains_key(PROTOCOL_MARKER)
    }

    pub fn has_protocol_marker(&self) -> bool {
        self.body.contains_key(PROTOCOL_MARKER)
    }

    /// 解析 `"blade"` 路由块；缺失时返回 `None`。
    pub fn fields(&self) -> Option<RpcFields> {
        self.body
            .get(FIELD_BLADE)
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }

    /// 写入路由块；全部字段为空时移除该块。
    pub fn set_fields(&mut self, fields: &RpcFields) {
        if fields.is_empty() {
            self.body.remove(FIELD_BLADE);
            return;
        }
        if let Ok(value) = serde_json::to_value(fields) {
            self.body.insert(FIELD_BLADE.to_owned(), value);
        }
    }
}

impl Default for Envelope {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(&self.body) {
            Ok(text) => f.write_str(&text),
            Err(_) => f.write_str("<unprintable envelope>"),
        }
    }
}
