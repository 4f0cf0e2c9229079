//! 下层（LL）契约：引擎在可选过滤器之下驱动的传输协作者。TCP 套接字、串口、
//! pty 都可以各自实现 [`LowerLayer`]；本 crate 不提供任何具体实现，只有契约
//! 本身和引擎对它的使用方式。

use std::net::SocketAddr;
use std::sync::Arc;

use crate::error::Result;

/// 非阻塞打开/关闭尝试的结果。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenOutcome {
    /// 下层已经可用，不会再有完成回调。
    Ready,
    /// 打开在异步继续；[`LlCallbacks::on_open_done`] 会在它结算时恰好调用一次。
    InProgress,
}

/// 非阻塞关闭尝试的结果。与 open 不同，close 没有同步失败的情形：即使下层
/// 无法干净地关闭，也仍然作为尽力而为的收尾报告完成。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseOutcome {
    /// 下层已经完全关闭，不会再有完成回调。
    Ready,
    /// 关闭在异步继续；[`LlCallbacks::on_close_done`] 会恰好调用一次。
    InProgress,
}

/// 下层对引擎的视角：下层推送入站活动所使用的回调集合。引擎在自己的内部状态上
/// 实现这个 trait，并在构造时把自身的一份克隆交给下层。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 把下层可能报告的全部事件（打开完成、读取/错误、可写、带外数据、关闭完成）
///   收敛成一张固定的回调表，这样任何实现 [`LowerLayer`] 的传输都知道要推送
///   什么、推送给谁，而不必了解引擎内部的状态机。
///
/// ## 架构定位（Architecture）
/// - 由 `crate::engine::CallbackHandle` 实现，包一层 `Arc<EngineInner>`；
/// - 下层（`LowerLayer::open`）只拿到 `Arc<dyn LlCallbacks>`，看不到具体类型，
///   这是引擎与传输之间唯一的耦合面。
///
/// ## 风险提示（Trade-offs）
/// - 每个方法都可能在下层自己的 I/O 驱动线程上被调用；实现方（引擎）必须自行
///   处理好重入与跨线程同步，不能假设调用方持有任何锁。
pub trait LlCallbacks: Send + Sync {
    /// 响应 [`LowerLayer::open`] 返回的 `OpenOutcome::InProgress`，恰好投递一次。
    fn on_open_done(&self, result: Result<()>);

    /// 下层到达了字节，或者锁存了一个读侧错误。`err` 为 `Some` 时 `buf` 可以
    /// 为空。返回值是 `buf` 中被消费的前缀字节数；未消费的后缀由下层自己保留，
    /// 并在下一次调用时重新呈现（这正是读侧背压的表达方式：当数据通路被禁用，
    /// 或用户的读回调跟不上时，引擎可以消费得比 `buf.len()` 少）。
    fn on_read(&self, err: Option<&crate::error::EngineError>, buf: &[u8]) -> usize;

    /// 下层此前无法继续接受字节，现在重新变得可写。只在可写回调被启用时投递
    /// （见 [`LowerLayer::set_write_callback_enable`]）。
    fn on_write_ready(&self);

    /// 带外/紧急数据到达（例如 TCP 紧急指针）。
    fn on_urgent(&self);

    /// 响应 [`LowerLayer::close`] 返回的 `CloseOutcome::InProgress`，恰好投递一次。
    fn on_close_done(&self);
}

/// [`crate::engine::Engine`] 所中介的传输。实现应当是非阻塞的：每个方法都必须
/// 迅速返回，把任何会阻塞的工作推到自己的 I/O 驱动上，并通过
/// [`LowerLayer::open`] 拿到的 [`LlCallbacks`] 报告完成情况。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 让引擎与具体传输（TCP 套接字、串口、pty……）解耦：引擎只依赖这份契约，
///   不关心底层字节究竟怎么进出机器；
/// - 本 crate 不提供任何具体实现，只有契约本身和引擎对它的驱动方式。
///
/// ## 契约（What）
/// - `open`/`close`：非阻塞发起打开/关闭，通过返回值区分「已就绪」和「异步进行中」；
/// - `write`：非阻塞尝试写入，允许短写，短写的剩余部分等待 `on_write_ready`；
/// - `set_read_callback_enable`/`set_write_callback_enable`：引擎借此表达背压，
///   下层必须据此开关对应回调，而不是无视调用方的意愿持续投递；
/// - `raddr_to_str`/`remote_addr`/`remote_id`：都有默认实现返回 `None`，
///   只有真正具备对应信息的传输才需要覆盖。
pub trait LowerLayer: Send + Sync {
    /// 开始打开传输。`callbacks` 在下层的整个生命周期内被持有，用于之后的
    /// 每一次入站事件。
    fn open(&self, callbacks: Arc<dyn LlCallbacks>) -> Result<OpenOutcome>;

    /// 开始关闭传输。幂等：引擎对每个下层实例最多调用一次。
    fn close(&self) -> CloseOutcome;

    /// 尝试非阻塞写入 `buf`。返回实际被接受的字节数，可能小于 `buf.len()`
    /// （短写）；调用方负责在 [`LlCallbacks::on_write_ready`] 触发后重试剩余部分。
    fn write(&self, buf: &[u8]) -> Result<usize>;

    /// 启用或禁用 [`LlCallbacks::on_read`]/[`LlCallbacks::on_urgent`] 的投递。
    fn set_read_callback_enable(&self, enable: bool);

    /// 启用或禁用 [`LlCallbacks::on_write_ready`] 的投递。
    fn set_write_callback_enable(&self, enable: bool);

    /// 远端地址的可读渲染（例如 `"192.0.2.1:5000"`），若传输有这个概念；
    /// 没有远端对等体概念的传输（pty、管道）返回 `None`。
    fn raddr_to_str(&self) -> Option<String> {
        None
    }

    /// 由套接字支撑的传输的远端地址。
    fn remote_addr(&self) -> Option<SocketAddr> {
        None
    }

    /// 远端的一个不透明的、由传输自行定义的身份标识（例如某个位于这一层
    /// 之下、不常见堆叠中的过滤器暴露出的 TLS 对端证书指纹，或是一个
    /// Unix 对端凭据）。
    fn remote_id(&self) -> Option<String> {
        None
    }
}

/// 让 `Arc<T>` 在调用方也想保留同一下层的自有句柄时（例如从引擎之外驱动某个
/// mock 传输回调的测试，或是想直接轮询传输特定统计信息的宿主应用），
/// 代替 `Box<dyn LowerLayer>` 使用。
impl<T: LowerLayer + ?Sized> LowerLayer for Arc<T> {
    fn open(&self, callbacks: Arc<dyn LlCallbacks>) -> Result<OpenOutcome> {
        (**self).open(callbacks)
    }

    fn close(&self) -> CloseOutcome {
        (**self).close()
    }

    fn write(&self, buf: &[u8]) -> Result<usize> {
        (**self).write(buf)
    }

    fn set_read_callback_enable(&self, enable: bool) {
        (**self).set_read_callback_enable(enable)
    }

    fn set_write_callback_enable(&self, enable: bool) {
        (**self).set_write_callback_enable(enable)
    }

    fn raddr_to_str(&self) -> Option<String> {
        (**self).raddr_to_str()
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        (**self).remote_addr()
    }

    fn remote_id(&self) -> Option<String> {
        (**self).remote_id()
    }
}
