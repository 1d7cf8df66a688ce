//! # BladeHandle：代理门面
//!
//! ## 核心意图（Why）
//! - 把配置、ID 关联器、协议注册表、RPC 处理器表、会话目录与连接目录组装为一个可共享的对象；
//! - 在 `blade` 命名空间下注册核心 RPC：`blade.publish` 登记协议提供者，`blade.locate` 查询提供者列表。
//!
//! ## 行为契约（What）
//! - 核心 RPC 的 `params` 必须携带 `protocol`、`realm`、`requester-nodeid`、`responder-nodeid`；
//!   缺失或取值非法时回复 `{"code": -32602, "message": ...}` 错误响应；
//! - 校验顺序：参数对象、`protocol`、`realm`、`requester-nodeid`、`responder-nodeid`，
//!   随后 `responder-nodeid` 必须等于 `master.nodeid`，`master.realms` 非空时 `realm` 必须在列表内；
//! - `blade.publish` 可携带 `channels` 字符串数组，类型不符回复 `Invalid params channels`，
//!   合法时逐个登记到协议条目；
//! - 成功响应回显上述四个字段，`blade.locate` 在协议存在时附带 `controllers` 数组。
//! - 发起方通过 [`BladeHandle::send_request`] 发送请求，响应回到同一会话时触发回调。

use std::sync::Arc;

use serde_json::{Value, json};
use tracing::{debug, info};

use super::{
    connection::{Connection, ConnectionManager},
    session::{InboundProcessor, Session},
    session_manager::SessionManager,
};
use crate::{
    config::{BladeConfig, MasterConfig},
    error::BladeError,
    registry::ProtocolRegistry,
    rpc::{Envelope, HandlerOutcome, MessageId, RpcCorrelator, RpcHandler, RpcHandlerRegistry, handler_fn},
};

/// 核心 RPC 所在的命名空间。
pub const CORE_NAMESPACE: &str = "blade";
const CORE_NAMESPACE_VERSION: &str = "1.0";
const INVALID_PARAMS: i64 = -32602;

/// 代理门面。
///
/// # 教案式说明
/// - **意图 (Why)**：上层只需持有一个对象即可创建会话、挂载连接并访问注册表；
/// - **契约 (What)**：通过 [`create_session`](Self::create_session) 创建的会话已登记、已启动，
///   并以内部的 [`RpcHandlerRegistry`] 作为入站处理器；
/// - **风险 (Trade-offs)**：门面不持有后台线程，[`shutdown`](Self::shutdown) 只关闭已登记的会话。
#[derive(Debug)]
pub struct BladeHandle {
    config: BladeConfig,
    correlator: RpcCorrelator,
    protocols: Arc<ProtocolRegistry>,
    rpc: Arc<RpcHandlerRegistry>,
    sessions: Arc<SessionManager>,
    connections: Arc<ConnectionManager>,
}

impl BladeHandle {
    /// 校验配置并注册核心 RPC。
    pub fn new(config: BladeConfig) -> Result<Self, BladeError> {
        config.validate()?;
        let correlator = RpcCorrelator::new();
        let protocols = Arc::new(ProtocolRegistry::new());
        let rpc = Arc::new(RpcHandlerRegistry::new(correlator.clone()));

        rpc.declare_namespace(CORE_NAMESPACE, CORE_NAMESPACE_VERSION);
        rpc.register_function(
            CORE_NAMESPACE,
            "publish",
            Some(publish_handler(
                Arc::clone(&protocols),
                correlator.clone(),
                config.master.clone(),
            )),
            None,
        )?;
        rpc.register_function(
            CORE_NAMESPACE,
            "locate",
            Some(locate_handler(
                Arc::clone(&protocols),
                correlator.clone(),
                config.master.clone(),
            )),
            None,
        )?;
        info!(nodeid = %config.master.nodeid, "blade handle ready");

        Ok(Self {
            config,
            correlator,
            protocols,
            rpc,
            sessions: Arc::new(SessionManager::new()),
            connections: Arc::new(ConnectionManager::new()),
        })
    }

    /// 从 TOML 文本构造。
    pub fn from_toml_str(text: &str) -> Result<Self, BladeError> {
        Self::new(BladeConfig::from_toml_str(text)?)
    }

    pub fn config(&self) -> &BladeConfig {
        &self.config
    }

    pub fn correlator(&self) -> &RpcCorrelator {
        &self.correlator
    }

    pub fn protocols(&self) -> &Arc<ProtocolRegistry> {
        &self.protocols
    }

    pub fn rpc(&self) -> &Arc<RpcHandlerRegistry> {
        &self.rpc
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    /// 创建、登记并启动会话；会话到达 `Destroy` 后自行离开目录。
    pub fn create_session(&self) -> Result<Arc<Session>, BladeError> {
        let session = Arc::new(Session::new(
            &self.config.session,
            Arc::clone(&self.connections),
        ));
        session.set_processor(Arc::clone(&self.rpc) as Arc<dyn InboundProcessor>);
        session.set_manager(&self.sessions);
        self.sessions.create_session(Arc::clone(&session))?;
        if let Err(err) = session.startup() {
            self.sessions.remove_session(session.id());
            return Err(err);
        }
        Ok(session)
    }

    /// 登记连接并挂载到指定会话。
    ///
    /// - **契约 (What)**：会话不存在时返回 [`BladeError::NotFound`]；连接 ID 已登记时复用目录中的连接。
    pub fn attach_connection(
        &self,
        session_id: &str,
        connection: Arc<dyn Connection>,
    ) -> Result<(), BladeError> {
        let session = self
            .sessions
            .get_session(session_id)
            .ok_or_else(|| BladeError::not_found(session_id))?;
        let connection_id = connection.id().to_owned();
        if !self.connections.register(connection) {
            debug!(connection_id = %connection_id, "connection already registered, reusing");
        }
        session.connections_add(&connection_id);
        Ok(())
    }

    /// 在指定会话上发送请求，响应到达时调用 `callback`。
    ///
    /// - **契约 (What)**：会话不存在返回 [`BladeError::NotFound`]；其余约束见 [`Session::send_request`]。
    pub fn send_request<F>(
        &self,
        session_id: &str,
        request: Envelope,
        callback: F,
    ) -> Result<MessageId, BladeError>
    where
        F: FnOnce(Envelope) + Send + 'static,
    {
        let session = self
            .sessions
            .get_session(session_id)
            .ok_or_else(|| BladeError::not_found(session_id))?;
        session.send_request(request, callback)
    }

    /// 构造 `blade.publish` 请求，`responder-nodeid` 取本节点身份。
    pub fn publish_request(&self, protocol: &str, realm: &str, requester: &str) -> (MessageId, Envelope) {
        self.core_request("publish", protocol, realm, requester)
    }

    /// 构造携带 `channels` 的 `blade.publish` 请求。
    pub fn publish_request_with_channels(
        &self,
        protocol: &str,
        realm: &str,
        requester: &str,
        channels: &[&str],
    ) -> (MessageId, Envelope) {
        let (id, mut request) = self.core_request("publish", protocol, realm, requester);
        request.params_mut()["channels"] = json!(channels);
        (id, request)
    }

    /// 构造 `blade.locate` 请求。
    pub fn locate_request(&self, protocol: &str, realm: &str, requester: &str) -> (MessageId, Envelope) {
        self.core_request("locate", protocol, realm, requester)
    }

    fn core_request(
        &self,
        command: &str,
        protocol: &str,
        realm: &str,
        requester: &str,
    ) -> (MessageId, Envelope) {
        let params = CoreParams {
            protocol: protocol.to_owned(),
            realm: realm.to_owned(),
            requester: requester.to_owned(),
            responder: self.config.master.nodeid.clone(),
        };
        self.correlator
            .new_request(CORE_NAMESPACE, command, Some(params.to_json()))
    }

    /// 关闭全部会话，返回关闭数量。
    pub fn shutdown(&self) -> usize {
        self.sessions.shutdown_all()
    }
}

#[derive(Debug)]
struct CoreParams {
    protocol: String,
    realm: String,
    requester: String,
    responder: String,
}

impl CoreParams {
    fn parse(request: &Envelope, master: &MasterConfig) -> Result<Self, &'static str> {
        let params = request
            .params()
            .filter(|params| params.is_object())
            .ok_or("Missing params object")?;
        let field = |key: &str| params.get(key).and_then(Value::as_str).map(str::to_owned);

        let protocol = field("protocol").ok_or("Missing params protocol")?;
        let realm = field("realm").ok_or("Missing params realm")?;
        let requester = field("requester-nodeid").ok_or("Missing params requester-nodeid")?;
        let responder = field("responder-nodeid").ok_or("Missing params responder-nodeid")?;
        if responder != master.nodeid {
            return Err("Invalid params responder-nodeid");
        }
        if !master.permits_realm(&realm) {
            return Err("Invalid params realm");
        }
        Ok(Self {
            protocol,
            realm,
            requester,
            responder,
        })
    }

    /// 可选的 `channels`：缺省为空，存在时必须是字符串数组。
    fn channels(request: &Envelope) -> Result<Vec<String>, &'static str> {
        let Some(channels) = request.params().and_then(|params| params.get("channels")) else {
            return Ok(Vec::new());
        };
        channels
            .as_array()
            .ok_or("Invalid params channels")?
            .iter()
            .map(|channel| {
                channel
                    .as_str()
                    .map(str::to_owned)
                    .ok_or("Invalid params channels")
            })
            .collect()
    }

    fn to_json(&self) -> Value {
        json!({
            "protocol": self.protocol,
            "realm": self.realm,
            "requester-nodeid": self.requester,
            "responder-nodeid": self.responder,
        })
    }
}

fn invalid_params(
    correlator: &RpcCorrelator,
    request: &Envelope,
    message: &str,
) -> Result<HandlerOutcome, BladeError> {
    debug!(method = request.method(), message, "core rpc rejected");
    let (_, reply) = correlator.new_error_response(
        request,
        Some(json!({"code": INVALID_PARAMS, "message": message})),
    )?;
    Ok(HandlerOutcome::reply(reply))
}

fn publish_handler(
    protocols: Arc<ProtocolRegistry>,
    correlator: RpcCorrelator,
    master: MasterConfig,
) -> RpcHandler {
    handler_fn(move |request: &Envelope| {
        let parsed = CoreParams::parse(request, &master)
            .and_then(|params| Ok((params, CoreParams::channels(request)?)));
        let (params, channels) = match parsed {
            Ok(parsed) => parsed,
            Err(message) => return invalid_params(&correlator, request, message),
        };
        protocols.controller_add(&params.protocol, &params.realm, &params.requester);
        for channel in &channels {
            protocols.channel_add(&params.protocol, &params.realm, channel)?;
        }
        let (_, reply) = correlator.new_response(request, Some(params.to_json()))?;
        Ok(HandlerOutcome::reply(reply))
    })
}

fn locate_handler(
    protocols: Arc<ProtocolRegistry>,
    correlator: RpcCorrelator,
    master: MasterConfig,
) -> RpcHandler {
    handler_fn(move |request: &Envelope| {
        let params = match CoreParams::parse(request, &master) {
            Ok(params) => params,
            Err(message) => return invalid_params(&correlator, request, message),
        };
        let mut result = params.to_json();
        if let Ok(snapshot) = protocols.lookup(&params.protocol, &params.realm) {
            result["controllers"] = snapshot.controllers_pack();
        }
        let (_, reply) = correlator.new_response(request, Some(result))?;
        Ok(HandlerOutcome::reply(reply))
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn handle() -> BladeHandle {
        BladeHandle::from_toml_str(
            r#"
            [master]
            nodeid = "master.example.com"
            realms = ["example.com"]
            "#,
        )
        .expect("配置应合法")
    }

    fn single_reply(handle: &BladeHandle, request: &Envelope) -> Envelope {
        let mut replies = handle.rpc().dispatch(request).expect("核心 RPC 应分发成功");
        assert_eq!(replies.len(), 1);
        replies.remove(0)
    }

    #[test]
    fn publish_then_locate_lists_controllers() {
        let handle = handle();
        let (_, publish) = handle.publish_request("chat", "example.com", "node-a");
        let reply = single_reply(&handle, &publish);
        assert_eq!(reply.id(), publish.id());
        assert_eq!(
            reply.result().and_then(|r| r.get("requester-nodeid")),
            Some(&json!("node-a"))
        );

        let (_, publish_b) = handle.publish_request("chat", "example.com", "node-b");
        single_reply(&handle, &publish_b);

        let (_, locate) = handle.locate_request("chat", "example.com", "node-c");
        let reply = single_reply(&handle, &locate);
        assert_eq!(
            reply.result().and_then(|r| r.get("controllers")),
            Some(&json!(["node-a", "node-b"]))
        );
    }

    #[test]
    fn locate_unknown_protocol_omits_controllers() {
        let handle = handle();
        let (_, locate) = handle.locate_request("presence", "example.com", "node-c");
        let reply = single_reply(&handle, &locate);
        let result = reply.result().expect("应为成功响应");
        assert_eq!(result.get("protocol"), Some(&json!("presence")));
        assert!(result.get("controllers").is_none());
    }

    #[test]
    fn invalid_params_yield_error_responses() {
        let handle = handle();
        let cases = [
            (json!(null), "Missing params object"),
            (json!({"realm": "example.com"}), "Missing params protocol"),
            (
                json!({"protocol": "chat", "realm": "example.net"}),
                "Missing params requester-nodeid",
            ),
            (
                json!({
                    "protocol": "chat",
                    "realm": "example.net",
                    "requester-nodeid": "node-a",
                    "responder-nodeid": "master.example.com",
                }),
                "Invalid params realm",
            ),
            (
                json!({
                    "protocol": "chat",
                    "realm": "example.com",
                    "requester-nodeid": "node-a",
                    "responder-nodeid": "master.example.com",
                    "channels": "lobby",
                }),
                "Invalid params channels",
            ),
            (
                json!({
                    "protocol": "chat",
                    "realm": "example.com",
                    "requester-nodeid": "node-a",
                    "responder-nodeid": "master.example.com",
                    "channels": ["lobby", 7],
                }),
                "Invalid params channels",
            ),
            (
                json!({
                    "protocol": "chat",
                    "realm": "example.com",
                    "requester-nodeid": "node-a",
                    "responder-nodeid": "someone-else",
                }),
                "Invalid params responder-nodeid",
            ),
        ];
        for (params, message) in cases {
            let (_, mut request) = handle.correlator().new_request(CORE_NAMESPACE, "publish", None);
            *request.params_mut() = params;
            let reply = single_reply(&handle, &request);
            assert_eq!(
                reply.error(),
                Some(&json!({"code": INVALID_PARAMS, "message": message})),
                "参数校验应回复 {message}"
            );
        }
        assert!(handle.protocols().is_empty(), "被拒绝的发布不应写入注册表");
    }

    #[test]
    fn publish_records_channels_on_protocol() {
        let handle = handle();
        let (_, publish) =
            handle.publish_request_with_channels("chat", "example.com", "node-a", &["lobby", "alerts"]);
        let reply = single_reply(&handle, &publish);
        assert!(reply.error().is_none());

        let snapshot = handle
            .protocols()
            .lookup("chat", "example.com")
            .expect("发布后应能定位");
        assert_eq!(snapshot.channels().collect::<Vec<_>>(), vec!["alerts", "lobby"]);
    }

    #[test]
    fn send_request_requires_known_session() {
        let handle = handle();
        let (_, publish) = handle.publish_request("chat", "example.com", "node-a");
        assert!(matches!(
            handle.send_request("missing", publish, |_| {}),
            Err(BladeError::NotFound { .. })
        ));
    }

    #[test]
    fn attach_connection_requires_known_session() {
        let handle = handle();
        let connection = Arc::new(crate::core::QueuedConnection::new("conn-1", 0));
        assert!(matches!(
            handle.attach_connection("missing", connection),
            Err(BladeError::NotFound { .. })
        ));
    }
}
