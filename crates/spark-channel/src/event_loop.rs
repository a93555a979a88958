//! 事件循环契约与“身处循环内”的能力令牌。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 通道的所有状态修改与事件派发都必须发生在其归属的事件循环线程上；
//!   调用方却可能来自任意线程。本模块定义两者之间的最小交接面：`in_event_loop` 与 `execute`。
//! - 仅靠运行期断言约束线程归属容易被遗漏，因此引入 [`InLoop`] 令牌：
//!   只有通过运行期检查才能拿到它，而通道的所有变更方法都要求出示令牌，
//!   从而把“跨线程修改”从运行期错误前移为类型错误。
//!
//! ## 契约（What）
//! - `execute` 可从任意线程调用，任务稍后在循环线程执行；同一提交方的任务保持提交顺序；
//! - 循环终止后 `execute` 通过 [`RejectedJob`] 归还任务，调用方据此兑现挂起的 Promise；
//! - `InLoop` 不可 `Send`，无法被带出当前线程。
//!
//! ## 风险（Trade-offs）
//! - 令牌只证明“身处某个循环”，不证明“身处本通道的循环”；通道在使用令牌时会再做一次指针比对断言。

use std::{fmt, marker::PhantomData};

/// 投递到事件循环的任务。
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// 循环已终止而被拒绝的任务，原样归还给提交方。
pub struct RejectedJob(pub Job);

impl fmt::Debug for RejectedJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RejectedJob(..)")
    }
}

/// 单线程事件循环契约。
///
/// # 契约说明（What）
/// - `in_event_loop`：当前线程是否为该循环的归属线程；
/// - `execute`：从任意线程提交任务，不阻塞；
/// - `name`：用于日志关联的循环名称。
pub trait EventLoop: Send + Sync + 'static {
    /// 当前线程是否为本循环线程。
    fn in_event_loop(&self) -> bool;

    /// 提交任务。
    fn execute(&self, job: Job) -> Result<(), RejectedJob>;

    /// 循环名称。
    fn name(&self) -> &str {
        "event-loop"
    }
}

/// 证明调用方正运行在某个事件循环线程上的能力令牌。
///
/// - **获取方式**：[`InLoop::enter`]（检查失败返回 `None`）或 [`InLoop::assert`]（检查失败即 panic）；
/// - **约束**：令牌借用循环本身且不可 `Send`，生命周期不会超出当前调用栈。
#[derive(Clone, Copy)]
pub struct InLoop<'a> {
    event_loop: &'a dyn EventLoop,
    _not_send: PhantomData<*const ()>,
}

impl<'a> InLoop<'a> {
    /// 若当前线程属于该循环，返回令牌。
    pub fn enter(event_loop: &'a dyn EventLoop) -> Option<Self> {
        event_loop.in_event_loop().then_some(Self {
            event_loop,
            _not_send: PhantomData,
        })
    }

    /// 断言当前线程属于该循环并返回令牌。
    ///
    /// 在循环外调用属于契约违背，直接 panic。
    #[track_caller]
    pub fn assert(event_loop: &'a dyn EventLoop) -> Self {
        match Self::enter(event_loop) {
            Some(token) => token,
            None => panic!(
                "operation requires the `{}` event loop thread",
                event_loop.name()
            ),
        }
    }

    /// 令牌对应的事件循环。
    pub fn event_loop(&self) -> &'a dyn EventLoop {
        self.event_loop
    }

    /// 令牌是否由指定循环签发。
    pub fn is_for(&self, other: &dyn EventLoop) -> bool {
        std::ptr::addr_eq(
            self.event_loop as *const dyn EventLoop,
            other as *const dyn EventLoop,
        )
    }

    #[track_caller]
    pub(crate) fn check(&self, other: &dyn EventLoop) {
        assert!(
            self.is_for(other),
            "loop token of `{}` used for a channel owned by `{}`",
            self.event_loop.name(),
            other.name()
        );
    }
}

impl fmt::Debug for InLoop<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InLoop")
            .field("event_loop", &self.event_loop.name())
            .finish()
    }
}
