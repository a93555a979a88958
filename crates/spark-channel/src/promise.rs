//! 单次赋值的异步结果容器。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 通道的所有公共操作都“立即返回一个结果占位符”，真正的执行发生在事件循环线程；
//!   调用方可能在任意线程，既可能注册回调，也可能直接 `.await`。
//! - `Promise` 同时满足两种消费方式：`if_done` 回调与 `Future` 轮询共享同一个槽位。
//!
//! ## 契约（What）
//! - `set` 只生效一次，先到者胜出；重复 `set` 返回 `false` 且不改变已存值；
//! - 完成前注册的回调在完成线程上按注册顺序执行，执行时不持有内部锁；
//! - 完成后注册的回调在注册线程上立即执行。
//!
//! ## 风险与权衡（Trade-offs）
//! - 回调签名为 `FnOnce(&T)`，值需 `Clone` 才能同时交给 `Future` 与回调；通道里的取值都是小对象，可以接受。
//! - 回调运行在完成方线程，若回调需要修改通道状态，必须重新投递回事件循环（见 `Channel::run_in_loop`）。

use std::{
    fmt,
    future::Future,
    mem,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll, Waker},
};

use parking_lot::Mutex;

use crate::error::ChannelError;

type Callback<T> = Box<dyn FnOnce(&T) + Send + 'static>;

enum Slot<T> {
    Pending {
        callbacks: Vec<Callback<T>>,
        wakers: Vec<Waker>,
    },
    Done(T),
}

/// 可跨线程完成、可克隆共享的单次赋值结果。
///
/// 克隆得到的是同一槽位的另一个句柄，而不是新的 Promise。
pub struct Promise<T> {
    slot: Arc<Mutex<Slot<T>>>,
}

/// 通道操作的结果：成功或一个 [`ChannelError`]。
pub type OpResult = Result<(), ChannelError>;

/// 通道操作返回的 Promise，关闭 Promise 也使用该类型，其值即关闭码。
pub type OpPromise = Promise<OpResult>;

/// 缓冲区大小类操作返回的 Promise。
pub type SizePromise = Promise<Result<u32, ChannelError>>;

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<T> Promise<T>
where
    T: Clone + Send + 'static,
{
    /// 创建尚未完成的 Promise。
    pub fn new() -> Self {
        Self {
            slot: Arc::new(Mutex::new(Slot::Pending {
                callbacks: Vec::new(),
                wakers: Vec::new(),
            })),
        }
    }

    /// 创建已经完成的 Promise。
    pub fn resolved(value: T) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Slot::Done(value))),
        }
    }

    /// 写入结果并触发回调。
    ///
    /// - **返回值**：首次写入返回 `true`；Promise 已完成时返回 `false`，传入值被丢弃。
    /// - **执行逻辑**：在锁内完成状态切换并取出回调与唤醒器，释放锁后依次执行回调、唤醒等待者，
    ///   因而回调内部可以安全地再次访问同一个 Promise。
    pub fn set(&self, value: T) -> bool {
        let (callbacks, wakers) = {
            let mut slot = self.slot.lock();
            match &mut *slot {
                Slot::Done(_) => return false,
                Slot::Pending { callbacks, wakers } => {
                    let taken = (mem::take(callbacks), mem::take(wakers));
                    *slot = Slot::Done(value.clone());
                    taken
                }
            }
        };
        for callback in callbacks {
            callback(&value);
        }
        for waker in wakers {
            waker.wake();
        }
        true
    }

    /// 注册完成回调；若已完成则在当前线程立即执行。
    pub fn if_done<F>(&self, callback: F)
    where
        F: FnOnce(&T) + Send + 'static,
    {
        let value = {
            let mut slot = self.slot.lock();
            match &mut *slot {
                Slot::Pending { callbacks, .. } => {
                    callbacks.push(Box::new(callback));
                    return;
                }
                Slot::Done(value) => value.clone(),
            }
        };
        callback(&value);
    }

    /// 完成时把结果转交给另一个 Promise。
    pub fn forward_to(&self, target: &Promise<T>) {
        let target = target.clone();
        self.if_done(move |value| {
            target.set(value.clone());
        });
    }

    /// 是否已经完成。
    pub fn is_done(&self) -> bool {
        matches!(&*self.slot.lock(), Slot::Done(_))
    }

    /// 非阻塞读取结果。
    pub fn try_get(&self) -> Option<T> {
        match &*self.slot.lock() {
            Slot::Done(value) => Some(value.clone()),
            Slot::Pending { .. } => None,
        }
    }
}

impl<T> Default for Promise<T>
where
    T: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Future for Promise<T>
where
    T: Clone + Send + 'static,
{
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        let mut slot = self.slot.lock();
        match &mut *slot {
            Slot::Done(value) => Poll::Ready(value.clone()),
            Slot::Pending { wakers, .. } => {
                if !wakers.iter().any(|waker| waker.will_wake(cx.waker())) {
                    wakers.push(cx.waker().clone());
                }
                Poll::Pending
            }
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.slot.lock() {
            Slot::Done(value) => f.debug_tuple("Promise::Done").field(value).finish(),
            Slot::Pending { callbacks, .. } => f
                .debug_struct("Promise::Pending")
                .field("callbacks", &callbacks.len())
                .finish(),
        }
    }
}
