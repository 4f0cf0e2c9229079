//! 过滤器契约：叠在引擎数据通路与下层之间的可选协议层（TLS、telnet 选项
//! 协商、某种行规程）。没有这一层的流水线使用 [`IdentityFilter`]。

use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;

/// 非阻塞握手步骤（[`Filter::try_connect`] 或 [`Filter::try_disconnect`]）的进展。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeProgress {
    /// 握手已完成。
    Done,
    /// 握手在等待 I/O；引擎会在下一次相关的下层回调时重试。
    InProgress,
    /// 握手在等待一个计时器；引擎应当为 `Duration` 装一个定时器，在它触发时重试。
    Again(Duration),
}

/// 过滤器写入的字节槽。引擎交给过滤器的槽要么绑定到下层（出站方向），
/// 要么绑定到用户的读回调（入站方向）；过滤器永远不需要知道是哪一种。
pub trait Sink {
    /// 提供至多 `buf.len()` 字节。返回被接受的字节数；返回值小于
    /// `buf.len()` 就是槽表达背压的方式,过滤器必须保留剩余部分。
    fn accept(&mut self, buf: &[u8]) -> usize;
}

/// 引擎在 [`Filter::setup`] 时交给过滤器的回调，用于过滤器自己发起、而非
/// 由数据通路驱动的活动。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 过滤器有时需要在没有新入站字节的情况下自行推进（把之前同步写不完的
///   缓冲数据刷出去、让一个内部空闲/重协商计时器到期），这两个方法就是
///   它回头敲引擎大门的唯一入口。
///
/// ## 风险提示（Trade-offs）
/// - `Filter` 的方法都在持有引擎锁的情况下被调用（见 [`Filter`] 的文档）；
///   这两个方法因此做了可重入保护——允许过滤器在 `try_connect`/
///   `try_disconnect`/`ul_write`/`ll_write` 内部同步调用它们，引擎会在
///   检测到锁已被本线程持有时把实际工作推迟到调用栈之外执行，而不是
///   死锁。过滤器实现仍然不应该依赖这个重入路径的具体时序。
pub trait FilterCallbacks: Send + Sync {
    /// 请求引擎重新轮询输出就绪状态，即启用下层的可写回调，让过滤器有
    /// 机会再次刷出它未能同步写完的缓冲字节。
    fn output_ready(&self);

    /// 为 `timeout` 装一个一次性定时器；引擎会在它触发时调用
    /// [`Filter::timeout`]，但仅限于流水线处于 `OPEN` 时（过滤器内部的
    /// 空闲/重协商定时器不能触发进一个正在关闭或已关闭的流水线）。
    fn start_timer(&self, timeout: Duration);
}

/// 过滤器协作者。除一个例外外，每个方法都在持有引擎锁的情况下被调用：
/// 流水线处于 `OPEN` 时的 `ll_write` 驱动一个直接绑定到
/// `UserCallbacks::on_read` 的 [`Sink`]，因此引擎在释放锁之后才调用它
/// （见 `engine::CallbackHandle::on_read` 与 `engine::EngineInner::deliver_read`），
/// 让用户回调可以回调引擎而不在自己的线程上死锁。无论如何，实现都不应该
/// 阻塞或同步回调引擎；应当使用提供的 [`Sink`]/[`FilterCallbacks`]。
pub trait Filter: Send + Sync {
    /// 在任何其他方法之前恰好调用一次，带来过滤器此后整个生命周期都应
    /// 保留的回调。
    fn setup(&mut self, callbacks: Arc<dyn FilterCallbacks>);

    /// 在流水线拆除、`try_disconnect` 报告 `Done` 之后恰好调用一次。
    /// 释放任何资源；此后不会再有调用。
    fn cleanup(&mut self) {}

    /// 过滤器是否还持有尚未交给下层的上层字节（来自此前一次短
    /// [`Filter::ul_write`]）。为真期间，`close()` 必须停留在
    /// `CLOSE_WAIT_DRAIN`，而不是开始断开握手。
    fn ul_write_pending(&self) -> bool {
        false
    }

    /// 过滤器是否还持有尚未交给用户读回调的下层字节（来自此前一次短
    /// [`Filter::ll_write`]）。用于决定即便没有新的下层活动，引擎是否
    /// 也应该继续轮询过滤器。
    fn ll_write_pending(&self) -> bool {
        false
    }

    /// 过滤器是否需要下层更多原始字节才能继续（例如握手中途，或记录
    /// 读到一半）。用于决定即便用户已经禁用了读取，是否也要保持下层
    /// 的读就绪回调处于启用状态。
    fn ll_read_needed(&self) -> bool {
        false
    }

    /// 轮询打开握手是否已经完成。在 `try_connect` 第一次返回 `Done`
    /// 之后恰好调用一次，作为最终确认钩子（例如用来暴露一个只有在
    /// 握手字节都处理完之后才会知道的证书校验失败）。
    fn check_open_done(&mut self) -> Result<()> {
        Ok(())
    }

    /// 把连接/握手状态机向前驱动一步。
    fn try_connect(&mut self, timeout: Duration) -> Result<HandshakeProgress>;

    /// 把断开/关闭握手向前驱动一步。
    fn try_disconnect(&mut self, timeout: Duration) -> Result<HandshakeProgress>;

    /// 编码/消费用户写入的字节，把结果推入 `sink`（绑定到下层）。返回
    /// `buf` 中被消费的字节数；短返回意味着过滤器在内部缓冲
    /// （见 [`Filter::ul_write_pending`]）。
    fn ul_write(&mut self, sink: &mut dyn Sink, buf: &[u8]) -> Result<usize>;

    /// 解码/消费从下层到达的字节，把结果推入 `sink`。一旦打开，`sink`
    /// 绑定到用户的读回调；在连接/断开握手期间它会丢弃（此时还不存在
    /// 已解码的应用数据），过滤器应当在这里消费握手字节,并为下一次
    /// `try_connect`/`try_disconnect` 轮询追踪自己的进度。返回 `buf`
    /// 中被消费的字节数。
    fn ll_write(&mut self, sink: &mut dyn Sink, buf: &[u8]) -> Result<usize>;

    /// 从下层到达了紧急/带外数据。
    fn ll_urgent(&mut self) {}

    /// 此前通过 [`FilterCallbacks::start_timer`] 装上的定时器触发了。
    fn timeout(&mut self) {}
}

/// 一个无需协商任何东西的流水线所用的空操作过滤器：字节在两个方向上
/// 原样通过,握手瞬间完成。
#[derive(Default)]
pub struct IdentityFilter;

impl Filter for IdentityFilter {
    fn setup(&mut self, _callbacks: Arc<dyn FilterCallbacks>) {}

    fn try_connect(&mut self, _timeout: Duration) -> Result<HandshakeProgress> {
        Ok(HandshakeProgress::Done)
    }

    fn try_disconnect(&mut self, _timeout: Duration) -> Result<HandshakeProgress> {
        Ok(HandshakeProgress::Done)
    }

    fn ul_write(&mut self, sink: &mut dyn Sink, buf: &[u8]) -> Result<usize> {
        Ok(sink.accept(buf))
    }

    fn ll_write(&mut self, sink: &mut dyn Sink, buf: &[u8]) -> Result<usize> {
        Ok(sink.accept(buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingSink {
        received: Vec<u8>,
        cap: usize,
    }

    impl Sink for CountingSink {
        fn accept(&mut self, buf: &[u8]) -> usize {
            let n = buf.len().min(self.cap);
            self.received.extend_from_slice(&buf[..n]);
            n
        }
    }

    #[test]
    fn identity_filter_passes_bytes_through_unchanged() {
        let mut filter = IdentityFilter;
        let mut sink = CountingSink { received: Vec::new(), cap: usize::MAX };
        let n = filter.ul_write(&mut sink, b"hello").unwrap();
        assert_eq!(n, 5);
        assert_eq!(sink.received, b"hello");
    }

    #[test]
    fn identity_filter_reports_sink_backpressure_as_short_consume() {
        let mut filter = IdentityFilter;
        let mut sink = CountingSink { received: Vec::new(), cap: 2 };
        let n = filter.ll_write(&mut sink, b"hello").unwrap();
        assert_eq!(n, 2);
        assert_eq!(sink.received, b"he");
    }

    #[test]
    fn identity_filter_handshakes_are_instantaneous() {
        let mut filter = IdentityFilter;
        assert_eq!(
            filter.try_connect(Duration::from_secs(1)).unwrap(),
            HandshakeProgress::Done
        );
        assert_eq!(
            filter.try_disconnect(Duration::from_secs(1)).unwrap(),
            HandshakeProgress::Done
        );
    }
}
