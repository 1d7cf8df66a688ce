//! # BoundedQueue：可选容量上限的阻塞式 FIFO
//!
//! ## 核心意图（Why）
//! - 会话与连接之间的全部报文缓冲都建立在同一个队列原语之上，生产者满时背压、消费者空时等待；
//! - 终止（`terminate`）是队列唯一的取消原语，必须唤醒所有阻塞方，避免关闭流程卡死。
//!
//! ## 实现策略（How）
//! - 一把 `parking_lot::Mutex` 守护存储与计数，两个 `Condvar` 分别唤醒等待出队与等待入队的线程；
//! - 存储使用 `VecDeque` 环形缓冲：出队后的槽位在后续入队时被复用，省去逐元素分配；
//! - `wake()` 通过递增唤醒代数（epoch）实现：阻塞式 `push`/`pop` 重新检查条件后继续等待，
//!   `pop_timeout` 在被唤醒且仍无元素时提前返回 `Timeout`，让协作式工作线程有机会重新检查外部条件。
//!
//! ## 契约说明（What）
//! - 单个队列内部严格 FIFO；跨队列不提供顺序保证；
//! - `terminate()` 不可逆且幂等，之后所有入队/出队返回 [`QueueError::Inactive`]；
//! - `flush()` 在终止后仍可调用，用于拆除阶段释放残留元素。

use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};

use crate::error::{PushError, QueueError};

/// 线程安全、可选容量上限的 FIFO 队列。
///
/// # 教案式说明
/// - **意图 (Why)**：为会话出站/入站缓冲以及内存连接提供统一的生产者/消费者语义；
/// - **契约 (What)**：
///   - `maxlen == 0` 表示无界；否则 `len()` 永不超过 `maxlen`；
///   - 元素所有权随 `push` 移交给队列，随 `pop` 移交给调用方；
/// - **风险 (Trade-offs)**：单锁设计在高并发下存在争用，但保持了 FIFO 与计数的一致性，足以支撑单会话流量。
#[derive(Debug)]
pub struct BoundedQueue<V> {
    maxlen: usize,
    state: Mutex<QueueState<V>>,
    pop_cond: Condvar,
    push_cond: Condvar,
}

#[derive(Debug)]
struct QueueState<V> {
    items: VecDeque<V>,
    active: bool,
    wake_epoch: u64,
    total_pushed: u64,
    total_popped: u64,
}

/// 队列运行时统计快照。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct QueueStats {
    pub len: usize,
    pub capacity: usize,
    pub active: bool,
    pub total_pushed: u64,
    pub total_popped: u64,
}

impl<V> BoundedQueue<V> {
    /// 创建处于活动状态的队列；`maxlen == 0` 表示无界。
    pub fn new(maxlen: usize) -> Self {
        let items = if maxlen == 0 {
            VecDeque::new()
        } else {
            VecDeque::with_capacity(maxlen)
        };
        Self {
            maxlen,
            state: Mutex::new(QueueState {
                items,
                active: true,
                wake_epoch: 0,
                total_pushed: 0,
                total_popped: 0,
            }),
            pop_cond: Condvar::new(),
            push_cond: Condvar::new(),
        }
    }

    /// 创建无界队列。
    pub fn unbounded() -> Self {
        Self::new(0)
    }

    /// 容量上限，0 表示无界。
    pub fn capacity(&self) -> usize {
        self.maxlen
    }

    fn is_full(&self, state: &QueueState<V>) -> bool {
        self.maxlen > 0 && state.items.len() >= self.maxlen
    }

    fn enqueue(&self, state: &mut QueueState<V>, value: V) {
        state.items.push_back(value);
        state.total_pushed += 1;
        self.pop_cond.notify_one();
    }

    fn dequeue(&self, state: &mut QueueState<V>) -> Option<V> {
        let value = state.items.pop_front()?;
        state.total_popped += 1;
        self.push_cond.notify_one();
        Some(value)
    }

    /// 阻塞式入队。
    ///
    /// # 教案式注释
    /// - **意图 (Why)**：有界队列满时对生产者施加背压；
    /// - **契约 (What)**：
    ///   - 队列满且仍活动时阻塞，直到有空位或队列被终止；
    ///   - 终止后返回 [`QueueError::Inactive`]，并通过 [`PushError`] 交还元素；
    /// - **执行 (How)**：在 `push_cond` 上循环等待，`wake()` 造成的唤醒只会导致重新检查。
    pub fn push(&self, value: V) -> Result<(), PushError<V>> {
        let mut state = self.state.lock();
        while state.active && self.is_full(&state) {
            self.push_cond.wait(&mut state);
        }
        if !state.active {
            return Err(PushError::new(QueueError::Inactive, value));
        }
        self.enqueue(&mut state, value);
        Ok(())
    }

    /// 非阻塞入队，满时立即返回 [`QueueError::WouldBlock`]。
    pub fn try_push(&self, value: V) -> Result<(), PushError<V>> {
        let mut state = self.state.lock();
        if !state.active {
            return Err(PushError::new(QueueError::Inactive, value));
        }
        if self.is_full(&state) {
            return Err(PushError::new(QueueError::WouldBlock, value));
        }
        self.enqueue(&mut state, value);
        Ok(())
    }

    /// 阻塞式出队，直到有元素或队列被终止。
    pub fn pop(&self) -> Result<V, QueueError> {
        let mut state = self.state.lock();
        loop {
            if !state.active {
                return Err(QueueError::Inactive);
            }
            if let Some(value) = self.dequeue(&mut state) {
                return Ok(value);
            }
            self.pop_cond.wait(&mut state);
        }
    }

    /// 非阻塞出队，空时立即返回 [`QueueError::WouldBlock`]。
    pub fn try_pop(&self) -> Result<V, QueueError> {
        let mut state = self.state.lock();
        if !state.active {
            return Err(QueueError::Inactive);
        }
        self.dequeue(&mut state).ok_or(QueueError::WouldBlock)
    }

    /// 限时出队。
    ///
    /// # 教案式注释
    /// - **契约 (What)**：
    ///   - 最多等待 `timeout`，到期仍为空返回 [`QueueError::Timeout`]；
    ///   - 等待期间若发生 [`wake`](Self::wake) 且仍无元素，同样提前返回 `Timeout`；
    ///   - 伪唤醒不会缩短等待，剩余时间按截止时刻重新计算；
    ///   - 截止时刻超出 `Instant` 表示范围（如 `Duration::MAX`）时退化为无限期等待，仍响应 `wake`/`terminate`。
    pub fn pop_timeout(&self, timeout: Duration) -> Result<V, QueueError> {
        let mut state = self.state.lock();
        let epoch = state.wake_epoch;
        let deadline = Instant::now().checked_add(timeout);
        loop {
            if !state.active {
                return Err(QueueError::Inactive);
            }
            if let Some(value) = self.dequeue(&mut state) {
                return Ok(value);
            }
            if state.wake_epoch != epoch {
                return Err(QueueError::Timeout);
            }
            let Some(deadline) = deadline else {
                self.pop_cond.wait(&mut state);
                continue;
            };
            if self.pop_cond.wait_until(&mut state, deadline).timed_out() {
                if !state.active {
                    return Err(QueueError::Inactive);
                }
                return self.dequeue(&mut state).ok_or(QueueError::Timeout);
            }
        }
    }

    /// 终止队列并唤醒全部等待方；幂等、不可逆。
    pub fn terminate(&self) {
        let mut state = self.state.lock();
        state.active = false;
        self.pop_cond.notify_all();
        self.push_cond.notify_all();
    }

    /// 广播唤醒等待方，不改变活动状态。
    pub fn wake(&self) {
        let mut state = self.state.lock();
        state.wake_epoch = state.wake_epoch.wrapping_add(1);
        self.pop_cond.notify_all();
        self.push_cond.notify_all();
    }

    /// 当前元素个数。
    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 队列是否尚未终止。
    pub fn is_active(&self) -> bool {
        self.state.lock().active
    }

    /// 逐个取出残留元素并交给 `on_item` 处理，返回处理数量。
    ///
    /// - **意图 (Why)**：拆除阶段由调用方决定如何释放报文（记录日志、回退到其它队列等）；
    /// - **契约 (What)**：每次只在锁内取出一个元素，回调执行期间不持锁，因此回调可以安全地再次访问本队列；
    ///   终止后的队列同样可以被清空。
    pub fn flush<F>(&self, mut on_item: F) -> usize
    where
        F: FnMut(V),
    {
        let mut flushed = 0;
        loop {
            let next = {
                let mut state = self.state.lock();
                self.dequeue(&mut state)
            };
            match next {
                Some(value) => {
                    on_item(value);
                    flushed += 1;
                }
                None => return flushed,
            }
        }
    }

    /// 读取统计快照。
    pub fn stats(&self) -> QueueStats {
        let state = self.state.lock();
        QueueStats {
            len: state.items.len(),
            capacity: self.maxlen,
            active: state.active,
            total_pushed: state.total_pushed,
            total_popped: state.total_popped,
        }
    }
}

impl<V> Default for BoundedQueue<V> {
    fn default() -> Self {
        Self::unbounded()
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use super::*;

    #[test]
    fn pops_in_push_order() {
        let queue = BoundedQueue::unbounded();
        for value in 1..=5 {
            queue.push(value).expect("无界队列入队不应失败");
        }
        let popped: Vec<_> = (0..5).map(|_| queue.pop().expect("应有元素")).collect();
        assert_eq!(popped, vec![1, 2, 3, 4, 5]);
        assert!(queue.is_empty());
    }

    #[test]
    fn try_push_reports_would_block_when_full() {
        let queue = BoundedQueue::new(1);
        queue.push("first").expect("首个元素应入队");
        let rejected = queue.try_push("second").expect_err("满队列应拒绝");
        assert_eq!(rejected.kind, QueueError::WouldBlock);
        assert_eq!(rejected.into_value(), "second");
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn try_pop_on_empty_would_block() {
        let queue: BoundedQueue<u8> = BoundedQueue::new(4);
        assert_eq!(queue.try_pop(), Err(QueueError::WouldBlock));
    }

    #[test]
    fn blocked_push_resumes_after_pop() {
        let queue = Arc::new(BoundedQueue::new(1));
        queue.push(1).expect("首个元素应入队");

        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.push(2))
        };

        thread::sleep(Duration::from_millis(20));
        assert_eq!(queue.pop(), Ok(1));
        producer
            .join()
            .expect("生产者线程不应 panic")
            .expect("腾出空位后阻塞的 push 应成功");
        assert_eq!(queue.pop(), Ok(2));
    }

    #[test]
    fn terminate_releases_blocked_popper() {
        let queue: Arc<BoundedQueue<u32>> = Arc::new(BoundedQueue::unbounded());
        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.pop())
        };

        thread::sleep(Duration::from_millis(20));
        let started = Instant::now();
        queue.terminate();
        let outcome = consumer.join().expect("消费者线程不应 panic");
        assert_eq!(outcome, Err(QueueError::Inactive));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn terminate_is_idempotent_and_rejects_later_calls() {
        let queue = BoundedQueue::new(2);
        queue.push(10).expect("终止前入队应成功");
        queue.terminate();
        queue.terminate();
        assert!(!queue.is_active());
        assert_eq!(
            queue.try_push(11).expect_err("终止后应拒绝").kind,
            QueueError::Inactive
        );
        assert_eq!(queue.pop(), Err(QueueError::Inactive));
        assert_eq!(queue.try_pop(), Err(QueueError::Inactive));
    }

    #[test]
    fn pop_timeout_expires_on_empty_queue() {
        let queue: BoundedQueue<u8> = BoundedQueue::unbounded();
        let started = Instant::now();
        assert_eq!(
            queue.pop_timeout(Duration::from_millis(30)),
            Err(QueueError::Timeout)
        );
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn wake_cuts_timed_wait_short() {
        let queue: Arc<BoundedQueue<u8>> = Arc::new(BoundedQueue::unbounded());
        let waiter = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                let started = Instant::now();
                (queue.pop_timeout(Duration::from_secs(30)), started.elapsed())
            })
        };

        thread::sleep(Duration::from_millis(20));
        queue.wake();
        let (outcome, elapsed) = waiter.join().expect("等待线程不应 panic");
        assert_eq!(outcome, Err(QueueError::Timeout));
        assert!(elapsed < Duration::from_secs(30));
        assert!(queue.is_active(), "wake 不应改变活动状态");
    }

    #[test]
    fn unbounded_timeout_does_not_overflow() {
        let queue = Arc::new(BoundedQueue::unbounded());
        queue.push(7_u8).expect("入队应成功");
        assert_eq!(queue.pop_timeout(Duration::MAX), Ok(7));

        let waiter = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.pop_timeout(Duration::MAX))
        };
        thread::sleep(Duration::from_millis(20));
        queue.push(8).expect("入队应成功");
        assert_eq!(waiter.join().expect("等待线程不应 panic"), Ok(8));
    }

    #[test]
    fn flush_hands_every_item_to_callback() {
        let queue = BoundedQueue::unbounded();
        for value in ["a", "b", "c"] {
            queue.push(value).expect("入队应成功");
        }
        queue.terminate();

        let mut drained = Vec::new();
        let count = queue.flush(|item| drained.push(item));
        assert_eq!(count, 3);
        assert_eq!(drained, vec!["a", "b", "c"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn stats_track_throughput() {
        let queue = BoundedQueue::new(8);
        queue.push(1).expect("入队应成功");
        queue.push(2).expect("入队应成功");
        queue.try_pop().expect("出队应成功");
        let stats = queue.stats();
        assert_eq!(stats.len, 1);
        assert_eq!(stats.capacity, 8);
        assert_eq!(stats.total_pushed, 2);
        assert_eq!(stats.total_popped, 1);
        assert!(stats.active);
    }
}
