use std::fmt;

/// 流水线生命周期状态机。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 把「下层传输是否已打开」「可选过滤器是否已完成握手」「是否正在排空待发字节」
///   这三个互相独立的问题压成一条单一的状态轴，这样上层只需要匹配一个枚举，
///   而不必在三组布尔标志的笛卡尔积里找出哪些组合是合法的；
/// - 给 `open()`/`close()`/`write()` 的可重入检查提供一个可穷举的依据。
///
/// ## 架构定位（Architecture）
/// - 只有 [`crate::engine`] 在持有引擎锁的情况下才能驱动状态迁移；
///   其余模块（`filter`、`ll`、`user`）都只读这个类型，从不构造迁移；
/// - 完整的迁移表见 `engine::EngineState` 的模块级文档。
///
/// ## 风险提示（Trade-offs）
/// - 新增状态前先确认 `is_transitioning`/`ll_is_up`/`is_closing` 是否需要同步更新，
///   三者共同决定了 enable 回收和重入拒绝的行为，遗漏一处就会让某个状态悄悄
///   绕过背压或提前触发用户回调。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    /// 没有在途的下层打开，也没有已完成的打开。
    Closed,
    /// `LowerLayer::open` 已调用但尚未完成。
    InLlOpen,
    /// 下层已打开；`Filter::try_connect` 正在进行。
    InFilterOpen,
    /// 两层都已就绪，数据通路处于活跃状态。
    Open,
    /// `close()` 已调用；在开始关闭握手前等待过滤器排空待发的上层字节。
    CloseWaitDrain,
    /// `Filter::try_disconnect` 正在进行。
    InFilterClose,
    /// 过滤器已下线；`LowerLayer::close` 正在进行。
    InLlClose,
}

impl State {
    /// 仅当数据通路可以接受用户写入、投递读取时为真。
    pub fn is_open(self) -> bool {
        matches!(self, State::Open)
    }

    /// 任一打开/关闭迁移正在进行时为真，即第二次 `open()`/`close()` 调用必须
    /// 被拒绝并返回 [`crate::EngineError::Busy`]。
    pub fn is_transitioning(self) -> bool {
        matches!(
            self,
            State::InLlOpen
                | State::InFilterOpen
                | State::CloseWaitDrain
                | State::InFilterClose
                | State::InLlClose
        )
    }

    /// 下层已完成打开时为真，即过滤器（或恒等过滤器下的数据通路本身）
    /// 可以被驱动。
    pub fn ll_is_up(self) -> bool {
        matches!(
            self,
            State::InFilterOpen
                | State::Open
                | State::CloseWaitDrain
                | State::InFilterClose
        )
    }

    /// 处于关闭序列中任一阶段时为真，供 tie-break 检查使用：在仍处于打开阶段
    /// 时收到的关闭请求，必须在打开结算的那一刻重新评估，而不是与它赛跑。
    pub fn is_closing(self) -> bool {
        matches!(
            self,
            State::CloseWaitDrain | State::InFilterClose | State::InLlClose
        )
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // 与 `spec.md` 用到的状态名保持字面一致，便于在日志里直接 grep。
        let name = match self {
            State::Closed => "CLOSED",
            State::InLlOpen => "IN_LL_OPEN",
            State::InFilterOpen => "IN_FILTER_OPEN",
            State::Open => "OPEN",
            State::CloseWaitDrain => "CLOSE_WAIT_DRAIN",
            State::InFilterClose => "IN_FILTER_CLOSE",
            State::InLlClose => "IN_LL_CLOSE",
        };
        f.write_str(name)
    }
}
