//! 用户契约：宿主应用注册来驱动和观察某一个引擎实例的回调。与下层/过滤器
//! 契约不同，打开与关闭的完成被建模成一次性的 `FnOnce` 闭包而不是 trait
//! 方法，因为每一次 `open()`/`close()` 调用都带有自己独立的延续（这是没有
//! 闭包的语言里「回调 + 不透明数据」这对组合在 Rust 里的惯用替代）。

use crate::error::{EngineError, Result};

/// 伴随一次读取投递的标志位，为未来的带外信号（例如「这一块在记录边界
/// 结束」）预留。引擎目前不设置任何标志；这个类型存在是为了让以后加
/// 标志位不破坏 [`UserCallbacks::on_read`] 的签名。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReadFlags {
    _reserved: (),
}

/// 在一个引擎的生命周期内投递给用户的回调。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 宿主应用只需要实现这一个 trait,就能驱动读/写/紧急数据与开/关完成
///   通知,而不必了解下层传输或过滤器的存在。
///
/// ## 架构定位（Architecture）
/// - 每个方法调用时都不持有引擎锁（见 `engine::deferred` 了解引擎如何
///   保证这一点）,因此实现可以自由地回调触发它们的那个引擎,不会自己
///   把自己锁死。
///
/// ## 风险提示（Trade-offs）
/// - `on_read` 的返回值就是读侧背压的唯一表达方式：返回得比 `buf.len()`
///   少,引擎就会在用户重新启用读取之前禁用它们;如果实现总是全量消费,
///   就等于放弃了这项背压能力。
pub trait UserCallbacks: Send + Sync {
    /// 数据通路上到达了字节,或者锁存了一个读侧错误（`err.is_some()`,
    /// `buf` 为空）。返回 `buf` 中被消费的前缀字节数;返回得比
    /// `buf.len()` 少就是告诉引擎在用户重新启用读取之前禁用它们
    /// （背压从用户回调一路传导到下层）。
    fn on_read(&self, err: Option<&EngineError>, buf: &[u8], flags: ReadFlags) -> usize;

    /// 此前一次短 [`crate::engine::Engine::write`] 之后,数据通路重新
    /// 变得可写。只在写回调被启用时投递。
    fn on_write_ready(&self) {}

    /// 到达了紧急/带外数据。
    fn on_urgent(&self) {}
}

/// `open()` 调用的一次性延续。
pub type OpenCompletion = Box<dyn FnOnce(Result<()>) + Send>;

/// `close()` 调用的一次性延续。关闭对用户没有可见的失败模式：等它运行时,
/// 无论下层或过滤器在过程中是否遇到了麻烦,流水线都已经拆除完毕
/// （那里的麻烦只能通过日志观察到）。
pub type CloseCompletion = Box<dyn FnOnce() + Send>;
