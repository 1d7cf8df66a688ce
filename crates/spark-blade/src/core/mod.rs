//! # core 模块说明
//!
//! ## 角色定位（Why）
//! - 承载会话生命周期、连接目录与选择策略，以及把它们与注册表、RPC 处理器组装在一起的 [`BladeHandle`]；
//! - 这里的类型都可以跨线程共享，会话之间没有中心事件循环，协作全部依赖锁与队列。
//!
//! ## 子模块
//! - `session`：会话状态机与工作线程；
//! - `session_manager`：会话目录；
//! - `connection`：连接契约、连接目录与内存连接；
//! - `routing`：出站连接选择策略；
//! - `handle`：代理门面与核心 RPC。

pub mod connection;
pub mod handle;
pub mod routing;
pub mod session;
pub mod session_manager;

pub use connection::{Connection, ConnectionManager, QueuedConnection};
pub use handle::BladeHandle;
pub use routing::{ConnectionChooser, FirstAttached};
pub use session::{InboundProcessor, ResponseCallback, Session, SessionState};
pub use session_manager::SessionManager;
