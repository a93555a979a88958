//! 通道生命周期的多轴状态模型。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 通道需要同时追踪读方向、写方向、建连阶段与关闭阶段，另有循环挂接、限速、定时器等辅助标记；
//!   单一枚举无法表达“读已半关 + 写正在进行 + 已连接”这类组合。
//! - 因此每个轴独立建模：可叠加的标记用位集，互斥的阶段用枚举，跨轴规则集中在
//!   [`ChannelState`] 的方法里，并在每次转换后调用 [`ChannelState::check_invariants`]。
//!
//! ## 契约（What）
//! - “完全关闭” = 读轴 `SHUTDOWN` 且写轴 `SHUTDOWN`；此时若关闭阶段仍为 `Open`，通道必须自动发起整体关闭；
//! - 同一方向上 `SHUTTING_DOWN` 与 `SHUTDOWN` 不可同时成立；
//! - `WRITING` 当且仅当存在在途写操作；
//! - [`FiredEvents`] 记录本轮生命周期已派发的一次性事件，保证 connected / read_closed /
//!   write_closed / closed 各至多一次。
//!
//! ## 风险（Trade-offs）
//! - 状态只在循环线程上修改，外部线程读取到的是某一时刻的快照，可能已经过时。

use bitflags::bitflags;

bitflags! {
    /// 读方向标记。
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct ReadFlags: u8 {
        /// 正在监听可读事件。
        const WATCH = 1 << 0;
        /// 读方向发生过错误。
        const ERROR = 1 << 1;
        /// 读半关闭进行中。
        const SHUTTING_DOWN = 1 << 2;
        /// 读半关闭已完成。
        const SHUTDOWN = 1 << 3;
    }
}

bitflags! {
    /// 写方向标记。
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct WriteFlags: u16 {
        /// 正在监听可写事件。
        const WATCH = 1 << 0;
        /// 写方向发生过错误。
        const ERROR = 1 << 1;
        /// 写半关闭进行中。
        const SHUTTING_DOWN = 1 << 2;
        /// 写半关闭已完成。
        const SHUTDOWN = 1 << 3;
        /// 写半关闭等待在途写完成后执行。
        const SHUTDOWN_PENDING = 1 << 4;
        /// 存在在途写操作。
        const WRITING = 1 << 5;
        /// 写屏障，由传输实现设置，用于暂停新写入进入内核。
        const BARRIER = 1 << 6;
        /// 已收到对端 FIN。
        const FIN_RECEIVED = 1 << 7;
    }
}

bitflags! {
    /// 事件循环挂接阶段。
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct LoopFlags: u8 {
        const BEGINNING = 1 << 0;
        const BEGIN_DONE = 1 << 1;
        const BEGIN_FAILED = 1 << 2;
        const NOTIFY_TERMINATING = 1 << 3;
    }
}

bitflags! {
    /// 限速与定时器标记。
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct RateFlags: u8 {
        /// 已配置带宽上限。
        const LIMITED = 1 << 0;
        /// 限速定时器已挂起。
        const TIMER_ARMED = 1 << 1;
        /// 通用定时器槽位。
        const TIMER_1 = 1 << 2;
    }
}

bitflags! {
    /// 本轮生命周期内已派发的一次性事件。
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct FiredEvents: u8 {
        const CONNECTED = 1 << 0;
        const READ_CLOSED = 1 << 1;
        const WRITE_CLOSED = 1 << 2;
        const CLOSED = 1 << 3;
    }
}

/// 建连阶段。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ConnectPhase {
    /// 尚未开始建连或监听。
    #[default]
    Idle,
    /// 主动建连中。
    Connecting,
    /// 连接已建立。
    Connected,
    /// 监听套接字。
    Listening,
}

/// 连接发起方向。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Role {
    /// 本端主动发起。
    Active,
    /// 由监听端接受。
    #[default]
    Passive,
}

/// 关闭阶段。
///
/// 通道创建时处于 `Closed`，`ch_init` 后进入 `Open`。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ClosePhase {
    #[default]
    Closed,
    Open,
    /// 关闭请求已登记，等待在途写完成。
    ClosePending,
    Closing,
}

/// 方向，供半关闭与监听类操作复用。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    Read,
    Write,
}

/// 通道全部状态轴的快照。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ChannelSnapshot {
    pub read: ReadFlags,
    pub write: WriteFlags,
    pub connect: ConnectPhase,
    pub role: Role,
    pub close: ClosePhase,
    pub event_loop: LoopFlags,
    pub rate: RateFlags,
    pub fired: FiredEvents,
}

impl ChannelSnapshot {
    /// 读写两个方向均已完成半关闭。
    pub fn is_fully_shutdown(&self) -> bool {
        self.read.contains(ReadFlags::SHUTDOWN) && self.write.contains(WriteFlags::SHUTDOWN)
    }

    /// 关闭阶段已不再是 `Open`。
    pub fn is_closing_or_closed(&self) -> bool {
        !matches!(self.close, ClosePhase::Open)
    }
}

/// 通道在循环线程上维护的可变状态。
#[derive(Debug, Default)]
pub(crate) struct ChannelState {
    pub(crate) axes: ChannelSnapshot,
    pub(crate) writes_in_flight: usize,
}

impl ChannelState {
    /// 为新一轮生命周期复位读写、阶段与事件账本；循环挂接标记跨生命周期保留。
    pub(crate) fn reset_for_incarnation(&mut self) {
        let event_loop = self.axes.event_loop;
        self.axes = ChannelSnapshot {
            close: ClosePhase::Open,
            event_loop,
            ..ChannelSnapshot::default()
        };
        self.writes_in_flight = 0;
    }

    /// 是否应当由半关闭汇合触发整体关闭。
    pub(crate) fn needs_auto_close(&self) -> bool {
        matches!(self.axes.close, ClosePhase::Open) && self.axes.is_fully_shutdown()
    }

    /// 登记一次性事件，返回本次是否为首次。
    pub(crate) fn mark_fired(&mut self, event: FiredEvents) -> bool {
        if self.axes.fired.contains(event) {
            return false;
        }
        self.axes.fired.insert(event);
        true
    }

    pub(crate) fn begin_write(&mut self) {
        self.writes_in_flight += 1;
        self.axes.write.insert(WriteFlags::WRITING);
    }

    /// 结束一次在途写，返回是否已无在途写。
    pub(crate) fn end_write(&mut self) -> bool {
        self.writes_in_flight = self.writes_in_flight.saturating_sub(1);
        let drained = self.writes_in_flight == 0;
        self.axes.write.set(WriteFlags::WRITING, !drained);
        drained
    }

    /// 跨轴不变量检查，每次状态转换后调用。
    ///
    /// `settled` 表示半关闭汇合检查已经执行完毕，此时完全关闭的通道必须处于关闭流程中。
    #[track_caller]
    pub(crate) fn check_invariants(&self, settled: bool) {
        let axes = &self.axes;
        assert!(
            !axes
                .read
                .contains(ReadFlags::SHUTTING_DOWN | ReadFlags::SHUTDOWN),
            "read axis both shutting down and shut down: {:?}",
            axes.read
        );
        assert!(
            !axes
                .write
                .contains(WriteFlags::SHUTTING_DOWN | WriteFlags::SHUTDOWN),
            "write axis both shutting down and shut down: {:?}",
            axes.write
        );
        assert_eq!(
            axes.write.contains(WriteFlags::WRITING),
            self.writes_in_flight > 0,
            "WRITING flag out of sync with {} in-flight writes",
            self.writes_in_flight
        );
        if settled {
            assert!(
                !(axes.is_fully_shutdown() && matches!(axes.close, ClosePhase::Open)),
                "fully shut down channel left open"
            );
        }
    }
}
