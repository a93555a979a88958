use std::{
    collections::VecDeque,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, ThreadId},
};

use parking_lot::Mutex;

use crate::event_loop::{EventLoop, InLoop, Job, RejectedJob};

/// 由测试线程手动驱动的事件循环。
///
/// - 构造线程即归属线程，`in_event_loop` 只在该线程上为真；
/// - `execute` 可从任意线程调用，任务按 FIFO 排队，直到归属线程调用 `run_*`；
/// - `terminate` 之后新任务被拒绝，已排队任务仍可执行。
pub struct ManualEventLoop {
    name: String,
    owner: ThreadId,
    queue: Mutex<VecDeque<Job>>,
    terminated: AtomicBool,
}

impl ManualEventLoop {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            owner: thread::current().id(),
            queue: Mutex::new(VecDeque::new()),
            terminated: AtomicBool::new(false),
        })
    }

    /// 当前线程的循环令牌；不在归属线程上时 panic。
    #[track_caller]
    pub fn token(&self) -> InLoop<'_> {
        InLoop::assert(self)
    }

    /// 排队中的任务数。
    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    /// 执行任务直到队列为空，返回执行数量。执行期间新投递的任务同样会被执行。
    #[track_caller]
    pub fn run_until_idle(&self) -> usize {
        self.run_bounded(usize::MAX)
    }

    /// 至多执行 `limit` 个任务，返回实际执行数量。
    #[track_caller]
    pub fn run_bounded(&self, limit: usize) -> usize {
        assert!(
            self.in_event_loop(),
            "`{}` must be driven from its owner thread",
            self.name
        );
        let mut executed = 0;
        while executed < limit {
            let Some(job) = self.queue.lock().pop_front() else {
                break;
            };
            job();
            executed += 1;
        }
        executed
    }

    /// 停止接受新任务。
    pub fn terminate(&self) {
        self.terminated.store(true, Ordering::Release);
    }
}

impl EventLoop for ManualEventLoop {
    fn in_event_loop(&self) -> bool {
        thread::current().id() == self.owner
    }

    fn execute(&self, job: Job) -> Result<(), RejectedJob> {
        if self.terminated.load(Ordering::Acquire) {
            return Err(RejectedJob(job));
        }
        self.queue.lock().push_back(job);
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for ManualEventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualEventLoop")
            .field("name", &self.name)
            .field("pending", &self.pending())
            .finish()
    }
}
