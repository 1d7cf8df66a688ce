//! # 会话状态管理（Session）
//!
//! ## 核心意图（Why）
//! - 建模代理与单个对端之间的会话：自有出站/入站队列、零到多条挂载连接，以及一个专属工作线程；
//! - 连接尚未建立时 `send` 仍然成功，报文缓冲在会话出站队列，待连接挂载后由工作线程迁移。
//!
//! ## 架构定位（Where）
//! - 会话只记录连接 ID，通过共享的 [`ConnectionManager`] 解析；由 [`SessionManager`](super::SessionManager)
//!   按会话 ID 统一登记；
//! - 入站报文在 `Ready` 状态下交给可替换的 [`InboundProcessor`]，典型实现是
//!   [`RpcHandlerRegistry`](crate::rpc::RpcHandlerRegistry)。
//!
//! ## 教案式使用指南（How）
//! 1. 调用 [`Session::new`] 创建会话，包装为 `Arc` 后调用 [`startup`](Session::startup) 启动工作线程；
//! 2. 通过 [`connections_add`](Session::connections_add) 挂载连接，并以 [`set_state`](Session::set_state) 进入 `Ready`；
//! 3. 调用 [`hangup`](Session::hangup) 请求挂断，工作线程将状态推进到 `Destroy` 后退出；
//! 4. 最终调用 [`shutdown`](Session::shutdown) 回收线程并丢弃残留报文。
//!
//! ## 状态机约束（What）
//! - 合法跃迁：`None → Ready → Hangup → Destroy`，任何非终止态都可以直接进入 `Hangup` 或 `Destroy`；
//! - `Destroy` 为终止态，只有 `startup` 会把状态重置为 `None`；
//! - `hangup` 在 `Hangup`/`Destroy` 下为无操作。
//!
//! ## 工作线程（How）
//! - 每轮迭代先快照状态；有挂载连接时把出站队列非阻塞地迁移到选中的连接；
//! - 随后按状态分支：`Destroy` 退出，`Hangup` 推进到 `Destroy`，`Ready` 把入站队列交给处理器；
//! - 空闲时在会话内的信号量上等待，最长 `worker_poll_interval`；`send`、挂载连接、状态变化、
//!   入站报文与 `shutdown` 都会唤醒它；间隔为 0 时退化为 `yield_now` 轮询；
//! - 被连接拒绝的报文停留在队首槽位，下一轮最先重试，之后才继续出队，会话内顺序不变；
//! - 以 `Destroy` 退出时把会话从所属 [`SessionManager`] 中移除。
//!
//! ## 请求/响应匹配（What）
//! - [`send_request`](Session::send_request) 以消息 ID 登记回调；入站响应先按 ID 匹配回调，
//!   未命中的报文才交给 [`InboundProcessor`]；`shutdown` 丢弃全部未完成的回调。

use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    connection::ConnectionManager,
    routing::{ConnectionChooser, FirstAttached},
    session_manager::SessionManager,
};
use crate::{
    config::SessionConfig,
    error::{BladeError, PushError, QueueError},
    queue::BoundedQueue,
    rpc::{Envelope, MessageId},
};

/// 会话状态。
///
/// # 教案式说明
/// - **意图 (Why)**：描述会话从创建到销毁的生命周期，驱动工作线程的分支逻辑；
/// - **契约 (What)**：状态间跃迁受 [`SessionState::can_transition_to`] 限制；
/// - **风险 (Trade-offs)**：`None` 与 `Option::None` 同名，匹配时请写全路径。
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum SessionState {
    /// 已创建，尚未就绪。
    #[default]
    None,
    /// 可处理入站报文。
    Ready,
    /// 已请求挂断，工作线程将推进到 `Destroy`。
    Hangup,
    /// 终止态。
    Destroy,
}

impl SessionState {
    /// 判断状态是否允许跃迁至 `target`。
    ///
    /// # 教案式注释
    /// - **契约 (What)**：同态跃迁总是允许；`Destroy` 只允许停留在自身；
    /// - **执行 (How)**：通过匹配元组 `(self, target)` 实现有限状态机判定。
    pub fn can_transition_to(self, target: SessionState) -> bool {
        matches!(
            (self, target),
            (
                SessionState::None,
                SessionState::None
                    | SessionState::Ready
                    | SessionState::Hangup
                    | SessionState::Destroy
            ) | (
                SessionState::Ready,
                SessionState::Ready | SessionState::Hangup | SessionState::Destroy
            ) | (
                SessionState::Hangup,
                SessionState::Hangup | SessionState::Destroy
            ) | (SessionState::Destroy, SessionState::Destroy)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Destroy)
    }
}

/// 入站报文处理器。
///
/// - **契约 (What)**：返回的报文经 [`Session`] 的出站路径发送；返回 `Err` 只记录日志，不影响后续报文。
pub trait InboundProcessor: Send + Sync {
    fn process(&self, session_id: &str, envelope: Envelope) -> Result<Vec<Envelope>, BladeError>;
}

/// 响应到达时调用一次的回调。
pub type ResponseCallback = Box<dyn FnOnce(Envelope) + Send>;

/// 会话内的唤醒信号。
#[derive(Debug, Default)]
struct WorkerSignal {
    pending: Mutex<bool>,
    cond: Condvar,
}

impl WorkerSignal {
    fn notify(&self) {
        let mut pending = self.pending.lock();
        *pending = true;
        self.cond.notify_all();
    }

    fn wait(&self, interval: Duration) {
        if interval.is_zero() {
            thread::yield_now();
            return;
        }
        let mut pending = self.pending.lock();
        if !*pending {
            self.cond.wait_for(&mut pending, interval);
        }
        *pending = false;
    }
}

/// 出站路径在队列满时的行为。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Backpressure {
    Block,
    Reject,
}

/// 代理会话。
///
/// # 教案式说明
/// - **意图 (Why)**：集中维护单个对端的状态、缓冲与连接挂载，所有方法均可跨线程并发调用；
/// - **契约 (What)**：
///   - `id`：UUID v4 字符串，创建后不变；
///   - 出站/入站队列容量来自 [`SessionConfig`]；
///   - 连接列表保持挂载顺序，不含重复 ID；
///   - 出站报文按 `send` 的先后顺序到达连接；
/// - **风险 (Trade-offs)**：工作线程持有会话的 `Arc`，未调用 [`shutdown`](Self::shutdown) 且状态未到达
///   `Destroy` 时会话不会被释放。
pub struct Session {
    id: Arc<str>,
    settings: SessionConfig,
    state: RwLock<SessionState>,
    connections: RwLock<Vec<Arc<str>>>,
    outbound: BoundedQueue<Envelope>,
    /// 被连接拒绝、等待重试的队首报文；持锁期间独占出站投递。
    head: Mutex<Option<Envelope>>,
    inbound: BoundedQueue<Envelope>,
    pending: Mutex<HashMap<MessageId, ResponseCallback>>,
    directory: Arc<ConnectionManager>,
    manager: RwLock<Weak<SessionManager>>,
    chooser: RwLock<Arc<dyn ConnectionChooser>>,
    processor: RwLock<Option<Arc<dyn InboundProcessor>>>,
    signal: WorkerSignal,
    stop: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// 创建处于 `None` 状态的会话。
    ///
    /// # 教案式注释
    /// - **契约 (What)**：
    ///   - `config`：队列容量、轮询间隔与线程名前缀；
    ///   - `directory`：解析连接 ID 的共享目录；
    ///   - **后置条件**：未启动工作线程，未挂载连接，默认使用 [`FirstAttached`] 选择连接。
    pub fn new(config: &SessionConfig, directory: Arc<ConnectionManager>) -> Self {
        let id: Arc<str> = Arc::from(Uuid::new_v4().to_string());
        debug!(session_id = %id, "session created");
        Self {
            id,
            settings: config.clone(),
            state: RwLock::new(SessionState::None),
            connections: RwLock::new(Vec::new()),
            outbound: BoundedQueue::new(config.outbound_capacity),
            head: Mutex::new(None),
            inbound: BoundedQueue::new(config.inbound_capacity),
            pending: Mutex::new(HashMap::new()),
            directory,
            manager: RwLock::new(Weak::new()),
            chooser: RwLock::new(Arc::new(FirstAttached)),
            processor: RwLock::new(None),
            signal: WorkerSignal::default(),
            stop: AtomicBool::new(false),
            worker: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn id_arc(&self) -> &Arc<str> {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    /// 替换连接选择策略。
    pub fn set_chooser(&self, chooser: Arc<dyn ConnectionChooser>) {
        *self.chooser.write() = chooser;
    }

    /// 记录所属目录，工作线程以 `Destroy` 退出时据此注销会话。
    pub fn set_manager(&self, manager: &Arc<SessionManager>) {
        *self.manager.write() = Arc::downgrade(manager);
    }

    /// 设置 `Ready` 状态下消费入站队列的处理器。
    pub fn set_processor(&self, processor: Arc<dyn InboundProcessor>) {
        *self.processor.write() = Some(processor);
        self.signal.notify();
    }

    /// 启动工作线程。
    ///
    /// # 教案式注释
    /// - **契约 (What)**：
    ///   - 状态重置为 `None`；
    ///   - 已有线程仍在运行时返回 [`BladeError::AlreadyStarted`]，已自然退出的旧线程会先被回收；
    ///   - 线程创建失败返回 [`BladeError::ResourceExhausted`]。
    pub fn startup(self: &Arc<Self>) -> Result<(), BladeError> {
        let mut worker = self.worker.lock();
        if worker.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return Err(BladeError::AlreadyStarted {
                session_id: self.id.to_string(),
            });
        }
        if let Some(finished) = worker.take() {
            if finished.join().is_err() {
                warn!(session_id = %self.id, "previous session worker panicked");
            }
        }

        *self.state.write() = SessionState::None;
        self.stop.store(false, Ordering::Release);

        let name = format!(
            "{}-{}",
            self.settings.worker_name_prefix,
            self.id.split('-').next().unwrap_or(&*self.id)
        );
        let session = Arc::clone(self);
        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || session.run())
            .map_err(|err| BladeError::ResourceExhausted {
                context: format!("spawning worker for session `{}`: {err}", self.id),
            })?;
        *worker = Some(handle);
        info!(session_id = %self.id, "session worker started");
        Ok(())
    }

    /// 停止工作线程并丢弃两条队列中的残留报文；幂等。
    ///
    /// # 教案式注释
    /// - **契约 (What)**：
    ///   - 仅在线程已启动时 `join`；在工作线程内部调用时只发出停止信号；
    ///   - 未完成请求的回调被丢弃，不会再被调用；
    ///   - 队列本身保持活动，会话可以再次 `startup`。
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::Release);
        self.signal.notify();

        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                debug!(session_id = %self.id, "shutdown requested from session worker");
            } else if handle.join().is_err() {
                warn!(session_id = %self.id, "session worker panicked");
            }
        }

        let held = usize::from(self.head.lock().take().is_some());
        let discarded = held + self.outbound.flush(drop) + self.inbound.flush(drop);
        let abandoned = std::mem::take(&mut *self.pending.lock()).len();
        info!(session_id = %self.id, discarded, abandoned, "session shut down");
    }

    /// 工作线程是否仍在运行。
    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// 发送一条报文。
    ///
    /// # 教案式注释
    /// - **契约 (What)**：
    ///   - 没有挂载连接、或会话仍有积压时，报文进入会话出站队列并唤醒工作线程；
    ///   - 否则直接推送到选中的连接；连接拒绝时报文成为队首，由工作线程重试；
    ///   - 会话出站队列满时阻塞，直到工作线程迁移出空位或会话被 `shutdown` 清空。
    /// - **执行 (How)**：直接投递与工作线程迁移共用队首槽位的锁，直接投递不会越过已出队但尚未送达的报文。
    pub fn send(&self, envelope: Envelope) -> Result<(), BladeError> {
        self.route(envelope, Backpressure::Block)
    }

    /// 发送请求并登记响应回调。
    ///
    /// # 教案式注释
    /// - **契约 (What)**：
    ///   - `envelope` 必须是带 `id` 的请求，否则返回 [`BladeError::InvalidRequest`]；
    ///   - 同 ID 的响应进入入站队列后，工作线程在交给处理器之前调用 `callback`，且只调用一次；
    ///   - 发送失败时撤销登记并返回错误。
    pub fn send_request<F>(&self, envelope: Envelope, callback: F) -> Result<MessageId, BladeError>
    where
        F: FnOnce(Envelope) + Send + 'static,
    {
        if !envelope.is_request() {
            return Err(BladeError::invalid_request("only requests can await a response"));
        }
        let id = envelope
            .id()
            .ok_or_else(|| BladeError::invalid_request("request carries no id"))?;
        self.pending.lock().insert(id, Box::new(callback));
        if let Err(err) = self.send(envelope) {
            self.pending.lock().remove(&id);
            return Err(err);
        }
        debug!(session_id = %self.id, id = %id, "request awaiting response");
        Ok(id)
    }

    /// 把响应交给登记的回调。
    ///
    /// - **契约 (What)**：命中时调用回调并返回 `None`；请求报文或没有登记的响应原样返回。
    ///   未设置处理器的会话由外部消费者取出入站报文，可调用本方法完成匹配。
    pub fn resolve_response(&self, envelope: Envelope) -> Option<Envelope> {
        if envelope.is_request() {
            return Some(envelope);
        }
        let Some(id) = envelope.id() else {
            return Some(envelope);
        };
        let callback = self.pending.lock().remove(&id);
        match callback {
            Some(callback) => {
                debug!(session_id = %self.id, id = %id, "response matched pending request");
                callback(envelope);
                None
            }
            None => Some(envelope),
        }
    }

    /// 尚未收到响应的请求数。
    pub fn pending_requests(&self) -> usize {
        self.pending.lock().len()
    }

    fn route(&self, envelope: Envelope, backpressure: Backpressure) -> Result<(), BladeError> {
        let mut head = self.head.lock();
        let direct = if head.is_none() && self.outbound.is_empty() {
            self.connections_choose(&envelope)
                .and_then(|id| self.directory.get(&id))
        } else {
            None
        };

        if let Some(connection) = direct {
            if let Err(rejected) = connection.sending_push(envelope) {
                debug!(
                    session_id = %self.id,
                    connection_id = connection.id(),
                    reason = %rejected.kind,
                    "connection refused envelope, holding it for the worker"
                );
                *head = Some(rejected.into_value());
                drop(head);
                self.signal.notify();
            }
            return Ok(());
        }
        drop(head);

        match backpressure {
            Backpressure::Block => self.outbound.push(envelope)?,
            Backpressure::Reject => self.outbound.try_push(envelope)?,
        }
        self.signal.notify();
        Ok(())
    }

    /// 直接写入会话出站队列。
    pub fn sending_push(&self, envelope: Envelope) -> Result<(), PushError<Envelope>> {
        self.outbound.push(envelope)?;
        self.signal.notify();
        Ok(())
    }

    /// 非阻塞地取出一条出站报文，等待重试的队首报文优先。
    pub fn sending_pop(&self) -> Result<Envelope, QueueError> {
        if let Some(envelope) = self.head.lock().take() {
            return Ok(envelope);
        }
        self.outbound.try_pop()
    }

    /// 由连接投递入站报文。
    pub fn receiving_push(&self, envelope: Envelope) -> Result<(), PushError<Envelope>> {
        self.inbound.push(envelope)?;
        self.signal.notify();
        Ok(())
    }

    /// 非阻塞地取出一条入站报文；未设置处理器时由外部消费者调用。
    pub fn receiving_pop(&self) -> Result<Envelope, QueueError> {
        self.inbound.try_pop()
    }

    /// 尚未送达连接的出站报文数，包含等待重试的队首报文。
    pub fn outbound_len(&self) -> usize {
        let held = usize::from(self.head.lock().is_some());
        held + self.outbound.len()
    }

    pub fn inbound_len(&self) -> usize {
        self.inbound.len()
    }

    /// 请求挂断；`Hangup`/`Destroy` 下为无操作。
    pub fn hangup(&self) {
        let mut state = self.state.write();
        if matches!(*state, SessionState::Hangup | SessionState::Destroy) {
            return;
        }
        let from = *state;
        *state = SessionState::Hangup;
        drop(state);

        info!(session_id = %self.id, from = ?from, "session hangup requested");
        self.signal.notify();
    }

    /// 状态机跃迁。
    ///
    /// # 教案式注释
    /// - **契约 (What)**：非法跃迁返回 [`BladeError::InvalidStateTransition`]，状态保持不变；
    /// - **执行 (How)**：先使用 [`SessionState::can_transition_to`] 校验，再更新并唤醒工作线程。
    pub fn set_state(&self, next: SessionState) -> Result<(), BladeError> {
        let mut state = self.state.write();
        let from = *state;
        if from == next {
            return Ok(());
        }
        if !from.can_transition_to(next) {
            return Err(BladeError::InvalidStateTransition {
                session_id: self.id.to_string(),
                from,
                to: next,
            });
        }
        *state = next;
        drop(state);

        info!(session_id = %self.id, from = ?from, to = ?next, "session state changed");
        self.signal.notify();
        Ok(())
    }

    /// 挂载连接；重复挂载返回 `false`。
    pub fn connections_add(&self, connection_id: &str) -> bool {
        let mut connections = self.connections.write();
        if connections.iter().any(|id| id.as_ref() == connection_id) {
            return false;
        }
        connections.push(Arc::from(connection_id));
        drop(connections);

        info!(session_id = %self.id, connection_id, "connection attached");
        self.signal.notify();
        true
    }

    /// 卸载连接；未挂载时返回 `false`。
    pub fn connections_remove(&self, connection_id: &str) -> bool {
        let mut connections = self.connections.write();
        let Some(index) = connections.iter().position(|id| id.as_ref() == connection_id) else {
            return false;
        };
        connections.remove(index);
        drop(connections);

        info!(session_id = %self.id, connection_id, "connection detached");
        true
    }

    /// 按挂载顺序列出连接 ID。
    pub fn connections_list(&self) -> Vec<Arc<str>> {
        self.connections.read().clone()
    }

    /// 为报文选择出站连接；未挂载任何连接时返回 `None`。
    pub fn connections_choose(&self, envelope: &Envelope) -> Option<Arc<str>> {
        let chooser = Arc::clone(&*self.chooser.read());
        let connections = self.connections.read();
        chooser.choose(envelope, &connections).cloned()
    }

    fn run(&self) {
        debug!(session_id = %self.id, "session worker entered");
        let interval = self.settings.worker_poll_interval();
        loop {
            if self.stop.load(Ordering::Acquire) {
                break;
            }
            let state = self.state();
            self.migrate_outbound();

            match state {
                SessionState::Destroy => {
                    self.retire();
                    break;
                }
                SessionState::Hangup => {
                    self.destroy();
                    continue;
                }
                SessionState::Ready => self.process_inbound(),
                SessionState::None => {}
            }
            self.signal.wait(interval);
        }
        debug!(session_id = %self.id, "session worker exited");
    }

    fn destroy(&self) {
        let mut state = self.state.write();
        if *state == SessionState::Hangup {
            *state = SessionState::Destroy;
            drop(state);
            info!(session_id = %self.id, "session destroyed after hangup");
        }
    }

    fn retire(&self) {
        let manager = self.manager.read().upgrade();
        if let Some(manager) = manager {
            if manager.remove_session(&self.id).is_some() {
                debug!(session_id = %self.id, "destroyed session left the directory");
            }
        }
    }

    fn migrate_outbound(&self) {
        if self.connections.read().is_empty() {
            return;
        }
        let mut head = self.head.lock();
        loop {
            let envelope = match head.take() {
                Some(envelope) => envelope,
                None => match self.outbound.try_pop() {
                    Ok(envelope) => envelope,
                    Err(_) => break,
                },
            };
            let Some(connection_id) = self.connections_choose(&envelope) else {
                *head = Some(envelope);
                break;
            };
            let Some(connection) = self.directory.get(&connection_id) else {
                warn!(
                    session_id = %self.id,
                    connection_id = %connection_id,
                    "attached connection is not registered"
                );
                *head = Some(envelope);
                break;
            };
            if let Err(rejected) = connection.sending_push(envelope) {
                debug!(
                    session_id = %self.id,
                    connection_id = %connection_id,
                    reason = %rejected.kind,
                    "connection refused envelope, retrying on next pass"
                );
                *head = Some(rejected.into_value());
                break;
            }
        }
    }

    fn process_inbound(&self) {
        let Some(processor) = self.processor.read().clone() else {
            return;
        };
        while let Ok(envelope) = self.inbound.try_pop() {
            let Some(envelope) = self.resolve_response(envelope) else {
                continue;
            };
            match processor.process(&self.id, envelope) {
                Ok(replies) => {
                    for reply in replies {
                        if let Err(err) = self.route(reply, Backpressure::Reject) {
                            warn!(session_id = %self.id, error = %err, "failed to queue reply");
                        }
                    }
                }
                Err(err) => {
                    warn!(session_id = %self.id, error = %err, "inbound processing failed");
                }
            }
            if self.stop.load(Ordering::Acquire) {
                break;
            }
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("connections", &*self.connections.read())
            .field("outbound", &self.outbound_len())
            .field("inbound", &self.inbound.len())
            .field("pending_requests", &self.pending_requests())
            .field("processor", &self.processor.read().is_some())
            .finish_non_exhaustive()
    }
}
