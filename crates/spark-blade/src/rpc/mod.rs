//! # rpc 模块说明
//!
//! - `envelope`：JSON-RPC 风格报文及其访问器；
//! - `correlator`：消息 ID 分配与请求/响应构造；
//! - `handlers`：命名空间/方法处理器表，充当会话的入站处理器。

pub mod correlator;
pub mod envelope;
pub mod handlers;

pub use correlator::{MessageIdGenerator, RpcCorrelator};
pub use envelope::{Envelope, MessageId, RpcFields, split_method};
pub use handlers::{HandlerFlow, HandlerOutcome, RpcHandler, RpcHandlerRegistry, handler_fn};
