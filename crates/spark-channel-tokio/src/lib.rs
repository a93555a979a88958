#![doc = r#"
# spark-channel-tokio

## 设计动机（Why）
- **定位**：为 `spark-channel` 的 [`EventLoop`] 契约提供生产可用的实现：
  一个独占 OS 线程、内部驱动 Tokio current-thread 运行时的事件循环。
- **架构角色**：具体传输（TCP/UDP）把通道交给本循环后，通道的所有状态修改、
  事件派发与传输回调都在这条线程上串行发生。

## 核心契约（What）
- `execute` 可从任意线程调用，任务经无界队列按 FIFO 顺序执行，单一提交方的先后顺序因此得以保留；
- `in_event_loop` 以线程标识判定；
- `schedule_after` 在延迟到期后于循环线程执行任务，供限速定时器等场景使用；
- `shutdown` 停止接收新任务，已排队任务执行完毕后回收线程；此后 `execute` 返回 [`RejectedJob`]。

## 实现策略（How）
- 运行时在调用线程上构建，失败直接以 `io::Error` 返回，避免“线程已启动但运行时不可用”的半初始化状态；
- 循环线程以 `block_on` 驱动 `mpsc::UnboundedReceiver`，发送端全部释放后自然退出；
- 延迟任务以 `tokio::spawn` 挂在同一运行时上，与普通任务共享线程。

## 风险与考量（Trade-offs）
- 关闭时尚未到期的延迟任务随运行时一起丢弃，不会执行；
- 在循环线程内部调用 `shutdown`（或最后一个句柄在循环内释放）时无法等待自身结束，只关闭队列而不 join。
"#]

use std::{
    fmt, io,
    sync::Arc,
    thread::{self, JoinHandle, ThreadId},
    time::Duration,
};

use parking_lot::Mutex;
use spark_channel::{EventLoop, Job, RejectedJob};
use tokio::{runtime, sync::mpsc};
use tracing::{debug, warn};

enum Command {
    Run(Job),
    RunAfter(Duration, Job),
}

impl Command {
    fn into_job(self) -> Job {
        match self {
            Command::Run(job) | Command::RunAfter(_, job) => job,
        }
    }
}

/// 独占一条 OS 线程的 Tokio 事件循环。
///
/// # 教案式说明
/// - **意图 (Why)**：把 [`EventLoop`] 契约落到真实线程上，供通道跨线程投递任务；
/// - **契约 (What)**：
///   - 以 `Arc<TokioEventLoop>` 共享，可直接转换为 `Arc<dyn EventLoop>` 交给 `Channel::new`；
///   - 最后一个句柄释放时自动关闭；
/// - **风险 (Trade-offs)**：任务在循环线程上同步执行，阻塞任务会拖住该线程上的全部通道。
pub struct TokioEventLoop {
    name: String,
    thread_id: ThreadId,
    sender: Mutex<Option<mpsc::UnboundedSender<Command>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl TokioEventLoop {
    /// 启动名为 `name` 的循环线程。
    ///
    /// 运行时或线程创建失败时返回 `io::Error`。
    pub fn spawn(name: impl Into<String>) -> io::Result<Arc<Self>> {
        let name = name.into();
        let runtime = runtime::Builder::new_current_thread()
            .enable_time()
            .build()?;
        let (sender, mut receiver) = mpsc::unbounded_channel::<Command>();

        let thread_name = name.clone();
        let thread = thread::Builder::new().name(name.clone()).spawn(move || {
            debug!(event_loop = %thread_name, "event loop started");
            runtime.block_on(async move {
                while let Some(command) = receiver.recv().await {
                    match command {
                        Command::Run(job) => job(),
                        Command::RunAfter(delay, job) => {
                            tokio::spawn(async move {
                                tokio::time::sleep(delay).await;
                                job();
                            });
                        }
                    }
                }
            });
            debug!(event_loop = %thread_name, "event loop stopped");
        })?;

        Ok(Arc::new(Self {
            name,
            thread_id: thread.thread().id(),
            sender: Mutex::new(Some(sender)),
            thread: Mutex::new(Some(thread)),
        }))
    }

    /// 延迟 `delay` 后在循环线程上执行 `job`。
    pub fn schedule_after(&self, delay: Duration, job: Job) -> Result<(), RejectedJob> {
        self.submit(Command::RunAfter(delay, job))
    }

    /// 是否已关闭。
    pub fn is_shutdown(&self) -> bool {
        self.sender.lock().is_none()
    }

    /// 停止接收任务，等待已排队任务执行完毕后回收线程。重复调用无副作用。
    pub fn shutdown(&self) {
        let Some(sender) = self.sender.lock().take() else {
            return;
        };
        drop(sender);
        debug!(event_loop = %self.name, "event loop shutting down");

        if thread::current().id() == self.thread_id {
            return;
        }
        let thread = self.thread.lock().take();
        if let Some(thread) = thread {
            if thread.join().is_err() {
                warn!(event_loop = %self.name, "event loop thread panicked");
            }
        }
    }

    fn submit(&self, command: Command) -> Result<(), RejectedJob> {
        let guard = self.sender.lock();
        let Some(sender) = guard.as_ref() else {
            return Err(RejectedJob(command.into_job()));
        };
        sender
            .send(command)
            .map_err(|mpsc::error::SendError(command)| RejectedJob(command.into_job()))
    }
}

impl EventLoop for TokioEventLoop {
    fn in_event_loop(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    fn execute(&self, job: Job) -> Result<(), RejectedJob> {
        self.submit(Command::Run(job))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for TokioEventLoop {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for TokioEventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokioEventLoop")
            .field("name", &self.name)
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}
