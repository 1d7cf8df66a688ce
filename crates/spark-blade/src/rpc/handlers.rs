//! # RpcHandlerRegistry：命名空间/方法处理器表
//!
//! ## 核心意图（Why）
//! - 入站报文按 `namespace.command` 定位处理器；每个方法区分请求方向与响应方向，
//!   并允许挂载前置（prefix）与后置（postfix）钩子，用于鉴权、审计等横切逻辑；
//! - 模板（template）是一组可复用的方法，命名空间通过 [`inherit_template`](RpcHandlerRegistry::inherit_template)
//!   以 `template.command` 的形式继承，例如 `chat.presence.subscribe`。
//!
//! ## 架构定位（Where）
//! - 实现 [`InboundProcessor`]，会话进入 `Ready` 后由工作线程把入站队列交给它，回复报文再经 `Session::send` 发出。
//!
//! ## 执行约定（How）
//! - 命名空间表由一把 `parking_lot::RwLock` 保护；分发时在读锁内克隆处理器（仅 `Arc` 计数），
//!   释放锁后再调用用户代码，避免处理器回调反向注册时死锁；
//! - 钩子链按 prefix → main → postfix 执行，任一环节返回 [`HandlerFlow::Exit`] 即停止；
//!   返回 `Err` 同样停止，此前已产出的回复照常送出。

use std::{collections::HashMap, fmt, sync::Arc};

use parking_lot::RwLock;
use serde_json::json;
use tracing::{debug, warn};

use super::{
    correlator::RpcCorrelator,
    envelope::{Envelope, MessageId, RpcFields, split_method},
};
use crate::{core::session::InboundProcessor, error::BladeError};

/// 处理器链的后续动作。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HandlerFlow {
    Continue,
    Exit,
}

/// 单个处理器的输出：可选的回复报文与后续动作。
#[derive(Clone, Debug, PartialEq)]
pub struct HandlerOutcome {
    pub reply: Option<Envelope>,
    pub flow: HandlerFlow,
}

impl HandlerOutcome {
    /// 不回复，继续执行后续钩子。
    pub fn pass() -> Self {
        Self {
            reply: None,
            flow: HandlerFlow::Continue,
        }
    }

    /// 回复并继续。
    pub fn reply(envelope: Envelope) -> Self {
        Self {
            reply: Some(envelope),
            flow: HandlerFlow::Continue,
        }
    }

    /// 不回复并终止链。
    pub fn exit() -> Self {
        Self {
            reply: None,
            flow: HandlerFlow::Exit,
        }
    }

    /// 回复并终止链。
    pub fn reply_and_exit(envelope: Envelope) -> Self {
        Self {
            reply: Some(envelope),
            flow: HandlerFlow::Exit,
        }
    }
}

/// 报文处理器。
pub type RpcHandler = Arc<dyn Fn(&Envelope) -> Result<HandlerOutcome, BladeError> + Send + Sync>;

/// 将闭包包装为 [`RpcHandler`]，借助 `Fn` 约束推导闭包签名。
pub fn handler_fn<F>(handler: F) -> RpcHandler
where
    F: Fn(&Envelope) -> Result<HandlerOutcome, BladeError> + Send + Sync + 'static,
{
    Arc::new(handler)
}

#[derive(Clone, Default)]
struct HookPair {
    prefix: Option<RpcHandler>,
    postfix: Option<RpcHandler>,
}

#[derive(Clone, Default)]
struct MethodHandlers {
    request: Option<RpcHandler>,
    response: Option<RpcHandler>,
    request_hooks: HookPair,
    response_hooks: HookPair,
}

impl fmt::Debug for MethodHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodHandlers")
            .field("request", &self.request.is_some())
            .field("response", &self.response.is_some())
            .field("request_prefix", &self.request_hooks.prefix.is_some())
            .field("request_postfix", &self.request_hooks.postfix.is_some())
            .field("response_prefix", &self.response_hooks.prefix.is_some())
            .field("response_postfix", &self.response_hooks.postfix.is_some())
            .finish()
    }
}

#[derive(Debug)]
struct Namespace {
    version: String,
    methods: HashMap<String, MethodHandlers>,
}

impl Namespace {
    fn new(version: &str) -> Self {
        Self {
            version: version.to_owned(),
            methods: HashMap::new(),
        }
    }

    fn register(
        &mut self,
        owner: &str,
        command: &str,
        request: Option<RpcHandler>,
        response: Option<RpcHandler>,
    ) -> Result<(), BladeError> {
        if request.is_none() && response.is_none() {
            return Err(BladeError::invalid_request(format!(
                "`{owner}.{command}` needs a request or response handler"
            )));
        }
        if self.methods.contains_key(command) {
            return Err(BladeError::invalid_request(format!(
                "handlers already registered for `{owner}.{command}`"
            )));
        }
        self.methods.insert(
            command.to_owned(),
            MethodHandlers {
                request,
                response,
                ..MethodHandlers::default()
            },
        );
        Ok(())
    }
}

#[derive(Debug, Default)]
struct HandlerTables {
    namespaces: HashMap<String, Namespace>,
    templates: HashMap<String, Namespace>,
}

/// 命名空间/方法处理器注册表。
///
/// # 教案式说明
/// - **意图 (Why)**：把“方法名 → 处理逻辑”的映射集中在一处，会话层只需把入站报文交给它；
/// - **契约 (What)**：
///   - 同一方法只能注册一次，重复注册返回 [`BladeError::InvalidRequest`]；
///   - 未声明的命名空间/模板/方法返回 [`BladeError::NotFound`]；
///   - 未知方法的请求会得到 `{"errormessage": "Command not supported"}` 错误响应。
#[derive(Debug, Default)]
pub struct RpcHandlerRegistry {
    correlator: RpcCorrelator,
    tables: RwLock<HandlerTables>,
}

impl RpcHandlerRegistry {
    pub fn new(correlator: RpcCorrelator) -> Self {
        Self {
            correlator,
            tables: RwLock::new(HandlerTables::default()),
        }
    }

    pub fn correlator(&self) -> &RpcCorrelator {
        &self.correlator
    }

    /// 声明命名空间；已存在时保留原版本并返回 `false`。
    pub fn declare_namespace(&self, name: &str, version: &str) -> bool {
        let mut tables = self.tables.write();
        if tables.namespaces.contains_key(name) {
            return false;
        }
        tables
            .namespaces
            .insert(name.to_owned(), Namespace::new(version));
        debug!(namespace = name, version, "rpc namespace declared");
        true
    }

    /// 移除命名空间及其全部方法。
    pub fn remove_namespace(&self, name: &str) -> bool {
        let removed = self.tables.write().namespaces.remove(name).is_some();
        if removed {
            debug!(namespace = name, "rpc namespace removed");
        }
        removed
    }

    /// 为命名空间注册方法处理器。
    pub fn register_function(
        &self,
        namespace: &str,
        command: &str,
        request: Option<RpcHandler>,
        response: Option<RpcHandler>,
    ) -> Result<(), BladeError> {
        let mut tables = self.tables.write();
        let ns = tables
            .namespaces
            .get_mut(namespace)
            .ok_or_else(|| BladeError::not_found(namespace))?;
        ns.register(namespace, command, request, response)?;
        debug!(namespace, command, "rpc method registered");
        Ok(())
    }

    /// 为已注册方法挂载请求方向的前置/后置钩子。
    pub fn register_custom_request_function(
        &self,
        namespace: &str,
        command: &str,
        prefix: Option<RpcHandler>,
        postfix: Option<RpcHandler>,
    ) -> Result<(), BladeError> {
        self.with_method(namespace, command, |method| {
            method.request_hooks = HookPair { prefix, postfix };
        })
    }

    /// 为已注册方法挂载响应方向的前置/后置钩子。
    pub fn register_custom_response_function(
        &self,
        namespace: &str,
        command: &str,
        prefix: Option<RpcHandler>,
        postfix: Option<RpcHandler>,
    ) -> Result<(), BladeError> {
        self.with_method(namespace, command, |method| {
            method.response_hooks = HookPair { prefix, postfix };
        })
    }

    fn with_method<F>(&self, namespace: &str, command: &str, apply: F) -> Result<(), BladeError>
    where
        F: FnOnce(&mut MethodHandlers),
    {
        let mut tables = self.tables.write();
        let method = tables
            .namespaces
            .get_mut(namespace)
            .and_then(|ns| ns.methods.get_mut(command))
            .ok_or_else(|| BladeError::not_found(format!("{namespace}.{command}")))?;
        apply(method);
        Ok(())
    }

    /// 声明模板；已存在时返回 `false`。
    pub fn declare_template(&self, name: &str, version: &str) -> bool {
        let mut tables = self.tables.write();
        if tables.templates.contains_key(name) {
            return false;
        }
        tables
            .templates
            .insert(name.to_owned(), Namespace::new(version));
        debug!(template = name, version, "rpc template declared");
        true
    }

    /// 为模板注册方法处理器。
    pub fn register_template_function(
        &self,
        template: &str,
        command: &str,
        request: Option<RpcHandler>,
        response: Option<RpcHandler>,
    ) -> Result<(), BladeError> {
        let mut tables = self.tables.write();
        let tpl = tables
            .templates
            .get_mut(template)
            .ok_or_else(|| BladeError::not_found(template))?;
        tpl.register(template, command, request, response)
    }

    /// 命名空间继承模板的全部方法，键名为 `template.command`；返回新增的方法数。
    ///
    /// - **契约 (What)**：命名空间中已存在的同名方法保持不变，不会被模板覆盖。
    pub fn inherit_template(&self, namespace: &str, template: &str) -> Result<usize, BladeError> {
        let mut tables = self.tables.write();
        let inherited: Vec<(String, MethodHandlers)> = tables
            .templates
            .get(template)
            .ok_or_else(|| BladeError::not_found(template))?
            .methods
            .iter()
            .map(|(command, handlers)| {
                let handlers = MethodHandlers {
                    request: handlers.request.clone(),
                    response: handlers.response.clone(),
                    ..MethodHandlers::default()
                };
                (format!("{template}.{command}"), handlers)
            })
            .collect();

        let ns = tables
            .namespaces
            .get_mut(namespace)
            .ok_or_else(|| BladeError::not_found(namespace))?;
        let mut added = 0;
        for (command, handlers) in inherited {
            if let std::collections::hash_map::Entry::Vacant(slot) = ns.methods.entry(command) {
                slot.insert(handlers);
                added += 1;
            }
        }
        debug!(namespace, template, added, "rpc template inherited");
        Ok(added)
    }

    /// 完整方法名是否已注册。
    pub fn has_method(&self, method: &str) -> bool {
        self.find(method).is_some()
    }

    fn find(&self, method: &str) -> Option<MethodHandlers> {
        let (namespace, command) = split_method(method);
        let tables = self.tables.read();
        tables
            .namespaces
            .get(namespace)
            .and_then(|ns| ns.methods.get(command))
            .cloned()
    }

    /// 构造经过注册校验的请求，路由块中写入命名空间版本。
    pub fn create_request(
        &self,
        namespace: &str,
        command: &str,
        fields: &RpcFields,
    ) -> Result<(MessageId, Envelope), BladeError> {
        let version = {
            let tables = self.tables.read();
            let ns = tables
                .namespaces
                .get(namespace)
                .ok_or_else(|| BladeError::not_found(namespace))?;
            if !ns.methods.contains_key(command) {
                return Err(BladeError::not_found(format!("{namespace}.{command}")));
            }
            ns.version.clone()
        };

        let (id, mut envelope) = self.correlator.new_request(namespace, command, None);
        let mut fields = fields.clone();
        fields.version = Some(version);
        envelope.set_fields(&fields);
        Ok((id, envelope))
    }

    /// 分发一条入站报文，返回需要回送的报文列表。
    ///
    /// # 教案式注释
    /// - **契约 (What)**：
    ///   - 缺少 `method` 返回 [`BladeError::InvalidRequest`]；
    ///   - 方法未注册时，对带 `id` 的报文生成 “Command not supported” 错误响应；
    ///   - 方法存在但缺少对应方向的处理器时返回 [`BladeError::NotFound`]；
    ///   - 处理器失败时停止执行后续钩子：此前已有回复则记录警告并返回这些回复，
    ///     否则返回 [`BladeError::Handler`]。
    pub fn dispatch(&self, envelope: &Envelope) -> Result<Vec<Envelope>, BladeError> {
        let method = envelope
            .method()
            .ok_or_else(|| BladeError::invalid_request("message carries no method"))?;

        let Some(handlers) = self.find(method) else {
            warn!(method, "no rpc handlers registered");
            let (_, reply) = self
                .correlator
                .new_error_response(envelope, Some(json!({"errormessage": "Command not supported"})))
                .map_err(|_| BladeError::not_found(method))?;
            return Ok(vec![reply]);
        };

        let (main, hooks) = if envelope.is_request() {
            (handlers.request, handlers.request_hooks)
        } else {
            (handlers.response, handlers.response_hooks)
        };
        let Some(main) = main else {
            warn!(method, request = envelope.is_request(), "no handler for message direction");
            return Err(BladeError::not_found(method));
        };

        let mut replies = Vec::new();
        for handler in [hooks.prefix, Some(main), hooks.postfix].into_iter().flatten() {
            let outcome = match handler(envelope) {
                Ok(outcome) => outcome,
                Err(err) if replies.is_empty() => {
                    return Err(BladeError::Handler {
                        method: method.to_owned(),
                        detail: err.to_string(),
                    });
                }
                Err(err) => {
                    warn!(method, error = %err, "rpc handler failed after earlier replies");
                    break;
                }
            };
            replies.extend(outcome.reply);
            if outcome.flow == HandlerFlow::Exit {
                break;
            }
        }
        Ok(replies)
    }
}

impl InboundProcessor for RpcHandlerRegistry {
    fn process(&self, session_id: &str, envelope: Envelope) -> Result<Vec<Envelope>, BladeError> {
        debug!(session_id, method = envelope.method(), "dispatching inbound message");
        self.dispatch(&envelope)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;

    fn echo(correlator: RpcCorrelator) -> RpcHandler {
        handler_fn(move |request: &Envelope| {
            let (_, reply) = correlator.new_response(request, request.params().cloned())?;
            Ok(HandlerOutcome::reply(reply))
        })
    }

    fn registry() -> RpcHandlerRegistry {
        let registry = RpcHandlerRegistry::new(RpcCorrelator::new());
        assert!(registry.declare_namespace("chat", "1.0"));
        registry
    }

    #[test]
    fn dispatches_request_to_registered_handler() {
        let registry = registry();
        registry
            .register_function("chat", "echo", Some(echo(registry.correlator().clone())), None)
            .expect("注册应成功");

        let (_, request) = registry
            .correlator()
            .new_request("chat", "echo", Some(json!({"text": "hello"})));
        let replies = registry.dispatch(&request).expect("分发应成功");
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].id(), request.id());
        assert_eq!(replies[0].result(), Some(&json!({"text": "hello"})));
    }

    #[test]
    fn unknown_method_yields_error_response() {
        let registry = registry();
        let (_, request) = registry.correlator().new_request("chat", "missing", None);
        let replies = registry.dispatch(&request).expect("未知方法应得到错误响应");
        assert_eq!(
            replies[0].error(),
            Some(&json!({"errormessage": "Command not supported"}))
        );
    }

    #[test]
    fn rejects_duplicate_and_empty_registrations() {
        let registry = registry();
        let handler = echo(registry.correlator().clone());
        registry
            .register_function("chat", "echo", Some(Arc::clone(&handler)), None)
            .expect("首次注册应成功");
        assert!(registry
            .register_function("chat", "echo", Some(handler), None)
            .is_err());
        assert!(registry.register_function("chat", "noop", None, None).is_err());
        assert!(matches!(
            registry.register_function("nope", "echo", Some(echo(RpcCorrelator::new())), None),
            Err(BladeError::NotFound { .. })
        ));
    }

    #[test]
    fn prefix_exit_short_circuits_main_handler() {
        let registry = registry();
        let calls = Arc::new(AtomicUsize::new(0));
        let main: RpcHandler = {
            let calls = Arc::clone(&calls);
            handler_fn(move |_: &Envelope| {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(HandlerOutcome::pass())
            })
        };
        registry
            .register_function("chat", "guarded", Some(main), None)
            .expect("注册应成功");
        let deny: RpcHandler = {
            let correlator = registry.correlator().clone();
            handler_fn(move |request: &Envelope| {
                let (_, reply) =
                    correlator.new_error_response(request, Some(json!({"reason": "denied"})))?;
                Ok(HandlerOutcome::reply_and_exit(reply))
            })
        };
        registry
            .register_custom_request_function("chat", "guarded", Some(deny), None)
            .expect("钩子注册应成功");

        let (_, request) = registry.correlator().new_request("chat", "guarded", None);
        let replies = registry.dispatch(&request).expect("分发应成功");
        assert_eq!(calls.load(Ordering::SeqCst), 0, "prefix 终止后主处理器不应执行");
        assert_eq!(replies[0].error(), Some(&json!({"reason": "denied"})));
    }

    #[test]
    fn responses_route_to_response_handler() {
        let registry = registry();
        let seen = Arc::new(AtomicUsize::new(0));
        let on_response: RpcHandler = {
            let seen = Arc::clone(&seen);
            handler_fn(move |_: &Envelope| {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(HandlerOutcome::exit())
            })
        };
        registry
            .register_function("chat", "send", None, Some(on_response))
            .expect("注册应成功");

        let (_, request) = registry.correlator().new_request("chat", "send", None);
        let (_, response) = registry
            .correlator()
            .new_response(&request, None)
            .expect("应生成响应");
        assert!(registry.dispatch(&response).expect("响应分发应成功").is_empty());
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert!(matches!(
            registry.dispatch(&request),
            Err(BladeError::NotFound { .. })
        ));
    }

    #[test]
    fn handler_failure_is_wrapped() {
        let registry = registry();
        let failing: RpcHandler = handler_fn(|_: &Envelope| Err(BladeError::Timeout));
        registry
            .register_function("chat", "slow", Some(failing), None)
            .expect("注册应成功");
        let (_, request) = registry.correlator().new_request("chat", "slow", None);
        match registry.dispatch(&request) {
            Err(BladeError::Handler { method, .. }) => assert_eq!(method, "chat.slow"),
            other => panic!("期望处理器错误，得到 {other:?}"),
        }
    }

    #[test]
    fn replies_before_a_failure_are_kept() {
        let registry = registry();
        let failing: RpcHandler = handler_fn(|_: &Envelope| Err(BladeError::Timeout));
        registry
            .register_function("chat", "audited", Some(failing), None)
            .expect("注册应成功");
        registry
            .register_custom_request_function(
                "chat",
                "audited",
                Some(echo(registry.correlator().clone())),
                None,
            )
            .expect("钩子注册应成功");

        let (_, request) = registry
            .correlator()
            .new_request("chat", "audited", Some(json!({"step": "prefix"})));
        let replies = registry.dispatch(&request).expect("已有回复时不应整体失败");
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].result(), Some(&json!({"step": "prefix"})));
    }

    #[test]
    fn namespaces_inherit_template_methods() {
        let registry = registry();
        assert!(registry.declare_template("presence", "2.1"));
        registry
            .register_template_function(
                "presence",
                "subscribe",
                Some(echo(registry.correlator().clone())),
                None,
            )
            .expect("模板注册应成功");

        assert_eq!(registry.inherit_template("chat", "presence"), Ok(1));
        assert!(registry.has_method("chat.presence.subscribe"));
        assert_eq!(registry.inherit_template("chat", "presence"), Ok(0));
        assert!(matches!(
            registry.inherit_template("chat", "absent"),
            Err(BladeError::NotFound { .. })
        ));
    }

    #[test]
    fn create_request_stamps_namespace_version() {
        let registry = registry();
        registry
            .register_function("chat", "send", Some(echo(registry.correlator().clone())), None)
            .expect("注册应成功");

        let fields = RpcFields {
            to: Some("node-b".into()),
            ..RpcFields::default()
        };
        let (id, request) = registry
            .create_request("chat", "send", &fields)
            .expect("已注册方法应可构造请求");
        assert_eq!(request.id(), Some(id));
        let stamped = request.fields().expect("应写入路由块");
        assert_eq!(stamped.version.as_deref(), Some("1.0"));
        assert_eq!(stamped.to.as_deref(), Some("node-b"));

        assert!(registry.create_request("chat", "absent", &fields).is_err());
        assert!(registry.remove_namespace("chat"));
        assert!(registry.create_request("chat", "send", &fields).is_err());
    }
}
