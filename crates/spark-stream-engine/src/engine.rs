//! 引擎：在由 [`UserCallbacks`] 驱动的单一数据通路接口之下,中介一个
//! [`LowerLayer`] 和一个 [`Filter`]。
//!
//! 内部驱动函数接受显式的 `engine: &Arc<EngineInner>` 参数而不是 `&self`,
//! 这样无论在哪里需要递出一份新的 `Arc<EngineInner>`（给定时器闭包、给延迟
//! 分发器）,手上已经有一份现成的,不必重新构造一个自引用的。

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::deferred::{DeferredFlags, Dispatcher};
use crate::error::{EngineError, Result};
use crate::filter::{Filter, FilterCallbacks, HandshakeProgress, Sink};
use crate::ll::{CloseOutcome, LlCallbacks, LowerLayer, OpenOutcome};
use crate::platform::{DeferredRunner, Timer};
use crate::state::State;
use crate::user::{CloseCompletion, OpenCompletion, ReadFlags, UserCallbacks};

/// 每次轮询交给 `Filter::try_connect`/`try_disconnect` 的握手步骤预算；
/// 需要更长时间的过滤器会报告 `HandshakeProgress::Again`。
const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// 除了三个协作者之外,构造一个 [`Engine`] 所需的参数。
pub struct EngineConfig {
    pub handshake_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

/// 引擎状态中可变、受锁保护的那一半。这里的每个字段都只在持有
/// `EngineInner::locked` 时被读写。
struct EngineState {
    state: State,
    filter: Box<dyn Filter>,
    read_enabled: bool,
    write_enabled: bool,
    ll_read_enabled: bool,
    ll_write_enabled: bool,
    /// Set once a write-side error is latched (from `LowerLayer::write` or
    /// `Filter::ul_write`/`ll_write` on the outbound path) and surfaced to
    /// the user exactly once, on the next `write()` call.
    saved_xmit_err: Option<EngineError>,
    open_completion: Option<OpenCompletion>,
    close_completion: Option<CloseCompletion>,
    /// True once `close()` was requested while still opening; consulted at
    /// the moment the open settles (the tie-break: the close that arrived
    /// mid-open is not lost, nor is it raced against the open logic).
    close_requested_during_open: bool,
    deferred: DeferredFlags,
    deferred_open_result: Option<Result<()>>,
    /// An inbound error observed in `LlCallbacks::on_read`, latched here
    /// because a read-side error has nowhere synchronous to go (unlike a
    /// write-side error, which the next `write()` call can surface
    /// directly): it is redelivered to the user on the next deferred-drain
    /// pass instead.
    deferred_read_err: Option<EngineError>,
    /// True exactly while a read is being delivered upward to the user,
    /// whether live (from `LlCallbacks::on_read`) or as a deferred flush of
    /// filter-buffered bytes (`deliver_read`). Guards against a second
    /// delivery racing the first for the filter, which is temporarily taken
    /// out of this struct (replaced with [`TakenFilter`]) for the duration,
    /// since that call happens with the lock released.
    in_read: bool,
    /// `close()` (or the last [`Engine`] handle dropping) arrived while
    /// [`EngineState::in_read`] was true, i.e. the filter was temporarily on
    /// loan to a read delivery running with the lock released. Acting on
    /// `begin_close` right then would query the [`TakenFilter`] stand-in
    /// instead of the real filter, so the request is deferred until the
    /// delivery hands the filter back.
    close_requested_during_read: bool,
    /// Latched once an LL-reported error has been observed while `OPEN`
    /// (`CallbackHandle::on_read`'s error branch). Sticky for the rest of
    /// the pipeline's life: a lower layer that has already reported a
    /// comm error is assumed unable to carry a disconnect handshake, so
    /// every later `close()`/retry path skips the filter drain/disconnect
    /// and goes straight to `IN_LL_CLOSE` (`spec.md` §4.1/§4.3/§7).
    ll_err_occurred: bool,
    handshake_timeout: Duration,
}

impl EngineState {
    fn wants_ll_reads(&self) -> bool {
        match self.state {
            State::Open => {
                (self.read_enabled && !self.filter.ll_write_pending()) || self.filter.ll_read_needed()
            }
            State::InFilterOpen | State::InFilterClose => true,
            _ => false,
        }
    }

    fn wants_ll_writes(&self) -> bool {
        match self.state {
            State::Open => self.write_enabled || self.filter.ul_write_pending(),
            State::InFilterOpen | State::InFilterClose | State::CloseWaitDrain => true,
            _ => false,
        }
    }
}

/// 共享的、引用计数的引擎状态。直接实现两个协作者的回调 trait：外层 `Arc`
/// 的一份克隆在打开时交给下层,在 setup 时交给过滤器。
pub struct EngineInner {
    ll: Box<dyn LowerLayer>,
    timer: Arc<dyn Timer>,
    dispatcher: Dispatcher,
    user: Arc<dyn UserCallbacks>,
    /// Count of live [`Engine`] handles (the "freeref" of a user handle, as
    /// distinct from the internal async liveness kept alive by ordinary
    /// `Arc` clones held by pending LL callbacks, the timer, and the
    /// deferred dispatcher). Reaching zero while still open triggers a
    /// best-effort orphan close; it does not by itself free anything.
    user_handles: AtomicUsize,
    locked: Mutex<EngineState>,
}

impl EngineInner {
    fn new(
        ll: Box<dyn LowerLayer>,
        filter: Box<dyn Filter>,
        user: Arc<dyn UserCallbacks>,
        runner: Arc<dyn DeferredRunner>,
        timer: Arc<dyn Timer>,
        config: EngineConfig,
    ) -> Arc<Self> {
        let dispatcher = Dispatcher::new(runner);
        let state = EngineState {
            state: State::Closed,
            filter,
            read_enabled: false,
            write_enabled: false,
            ll_read_enabled: false,
            ll_write_enabled: false,
            saved_xmit_err: None,
            open_completion: None,
            close_completion: None,
            close_requested_during_open: false,
            deferred: DeferredFlags::default(),
            deferred_open_result: None,
            deferred_read_err: None,
            in_read: false,
            close_requested_during_read: false,
            ll_err_occurred: false,
            handshake_timeout: config.handshake_timeout,
        };
        let inner = Arc::new(Self {
            ll,
            timer,
            dispatcher,
            user,
            user_handles: AtomicUsize::new(0),
            locked: Mutex::new(state),
        });
        let callbacks: Arc<dyn FilterCallbacks> = CallbackHandle::new(Arc::clone(&inner));
        inner.locked.lock().filter.setup(callbacks);
        inner
    }

    fn reconcile_ll_enables(&self, st: &mut EngineState) {
        let want_read = st.wants_ll_reads();
        if want_read != st.ll_read_enabled {
            st.ll_read_enabled = want_read;
            self.ll.set_read_callback_enable(want_read);
        }
        let want_write = st.wants_ll_writes();
        if want_write != st.ll_write_enabled {
            st.ll_write_enabled = want_write;
            self.ll.set_write_callback_enable(want_write);
        }
    }

    fn request_drain(engine: &Arc<EngineInner>) {
        let inner = Arc::clone(engine);
        engine.dispatcher.request(move || EngineInner::drain(&inner));
    }

    /// Runs off the LL/filter callback stack: delivers whatever user
    /// completions/reads were recorded while the engine lock was held.
    fn drain(engine: &Arc<EngineInner>) {
        loop {
            let (open_done, close_done, read_job, write_ready, urgent) = {
                let mut st = engine.locked.lock();
                let open_done = if st.deferred.open {
                    st.deferred.open = false;
                    st.open_completion.take().zip(st.deferred_open_result.take())
                } else {
                    None
                };
                let close_done = if st.deferred.close {
                    st.deferred.close = false;
                    st.close_completion.take()
                } else {
                    None
                };
                let read_job = if st.deferred.read {
                    st.deferred.read = false;
                    Some(st.deferred_read_err.take())
                } else {
                    None
                };
                let write_ready = std::mem::take(&mut st.deferred.write_ready);
                let urgent = std::mem::take(&mut st.deferred.urgent);
                let done = !st.deferred.any();
                if done {
                    engine.dispatcher.clear();
                }
                (open_done, close_done, read_job, write_ready, urgent)
            };

            if open_done.is_none()
                && close_done.is_none()
                && read_job.is_none()
                && !write_ready
                && !urgent
            {
                break;
            }

            if let Some((completion, result)) = open_done {
                completion(result);
            }
            if let Some(err) = read_job {
                EngineInner::deliver_read(engine, err);
            }
            if write_ready {
                engine.user.on_write_ready();
            }
            if urgent {
                engine.user.on_urgent();
            }
            if let Some(completion) = close_done {
                completion();
            }
        }
    }

    fn schedule_open_completion(engine: &Arc<EngineInner>, st: &mut EngineState, result: Result<()>) {
        st.deferred_open_result = Some(result);
        st.deferred.open = true;
        EngineInner::request_drain(engine);
    }

    fn schedule_close_completion(engine: &Arc<EngineInner>, st: &mut EngineState) {
        st.deferred.close = true;
        EngineInner::request_drain(engine);
    }

    fn schedule_read(engine: &Arc<EngineInner>, st: &mut EngineState, err: Option<EngineError>) {
        st.deferred_read_err = err;
        st.deferred.read = true;
        EngineInner::request_drain(engine);
    }

    fn schedule_write_ready(engine: &Arc<EngineInner>, st: &mut EngineState) {
        st.deferred.write_ready = true;
        EngineInner::request_drain(engine);
    }

    fn schedule_urgent(engine: &Arc<EngineInner>, st: &mut EngineState) {
        st.deferred.urgent = true;
        EngineInner::request_drain(engine);
    }

    fn fail_open(engine: &Arc<EngineInner>, st: &mut EngineState, err: EngineError) {
        warn!(error = %err, "open failed");
        st.state = State::Closed;
        if st.close_requested_during_open {
            // A close() arrived while we were still opening; the open
            // failed on its own, so the pipeline is already exactly where
            // that close wanted it. Honor both completions rather than
            // silently dropping the close's.
            st.close_requested_during_open = false;
            EngineInner::schedule_close_completion(engine, st);
        }
        EngineInner::schedule_open_completion(engine, st, Err(err));
    }

    fn complete_open(engine: &Arc<EngineInner>, st: &mut EngineState) {
        debug!("pipeline open");
        if st.close_requested_during_open {
            st.close_requested_during_open = false;
            EngineInner::begin_close(engine, st);
            return;
        }
        EngineInner::schedule_open_completion(engine, st, Ok(()));
    }

    fn drive_connect(engine: &Arc<EngineInner>, st: &mut EngineState) {
        debug_assert_eq!(st.state, State::InFilterOpen);
        let timeout = st.handshake_timeout;
        match st.filter.try_connect(timeout) {
            Ok(HandshakeProgress::Done) => {
                if let Err(e) = st.filter.check_open_done() {
                    EngineInner::fail_open(engine, st, e);
                    return;
                }
                st.state = State::Open;
                engine.reconcile_ll_enables(st);
                EngineInner::complete_open(engine, st);
            }
            Ok(HandshakeProgress::InProgress) => {
                engine.reconcile_ll_enables(st);
            }
            Ok(HandshakeProgress::Again(delay)) => {
                engine.reconcile_ll_enables(st);
                EngineInner::arm_timer(engine, delay);
            }
            Err(e) => EngineInner::fail_open(engine, st, e),
        }
    }

    fn drive_disconnect(engine: &Arc<EngineInner>, st: &mut EngineState) {
        debug_assert_eq!(st.state, State::InFilterClose);
        if st.ll_err_occurred {
            // 下层已经报告过一次通信错误,不能再指望它承载一轮断开握手,
            // 所以直接跳到 IN_LL_CLOSE,而不是再去轮询过滤器。
            st.filter.cleanup();
            st.state = State::InLlClose;
            match engine.ll.close() {
                CloseOutcome::Ready => EngineInner::finish_close(engine, st),
                CloseOutcome::InProgress => {}
            }
            return;
        }
        let timeout = st.handshake_timeout;
        match st.filter.try_disconnect(timeout) {
            Ok(HandshakeProgress::Done) => {
                st.filter.cleanup();
                st.state = State::InLlClose;
                match engine.ll.close() {
                    CloseOutcome::Ready => EngineInner::finish_close(engine, st),
                    CloseOutcome::InProgress => {}
                }
            }
            Ok(HandshakeProgress::InProgress) => {
                engine.reconcile_ll_enables(st);
            }
            Ok(HandshakeProgress::Again(delay)) => {
                engine.reconcile_ll_enables(st);
                EngineInner::arm_timer(engine, delay);
            }
            Err(e) => {
                warn!(error = %e, "filter disconnect failed; closing lower layer anyway");
                st.filter.cleanup();
                st.state = State::InLlClose;
                match engine.ll.close() {
                    CloseOutcome::Ready => EngineInner::finish_close(engine, st),
                    CloseOutcome::InProgress => {}
                }
            }
        }
    }

    fn finish_close(engine: &Arc<EngineInner>, st: &mut EngineState) {
        debug!("pipeline closed");
        st.state = State::Closed;
        st.ll_read_enabled = false;
        st.ll_write_enabled = false;
        st.saved_xmit_err = None;
        EngineInner::schedule_close_completion(engine, st);
    }

    fn begin_close(engine: &Arc<EngineInner>, st: &mut EngineState) {
        if st.ll_err_occurred {
            st.filter.cleanup();
            st.state = State::InLlClose;
            match engine.ll.close() {
                CloseOutcome::Ready => EngineInner::finish_close(engine, st),
                CloseOutcome::InProgress => {}
            }
            return;
        }
        if st.filter.ul_write_pending() {
            st.state = State::CloseWaitDrain;
            engine.reconcile_ll_enables(st);
            return;
        }
        st.state = State::InFilterClose;
        EngineInner::drive_disconnect(engine, st);
    }

    fn arm_timer(engine: &Arc<EngineInner>, delay: Duration) {
        let engine = Arc::clone(engine);
        let timer = Arc::clone(&engine.timer);
        timer.arm(
            delay,
            Box::new(move || EngineInner::on_timer_fired(&engine)),
        );
    }

    fn on_timer_fired(engine: &Arc<EngineInner>) {
        let mut st = engine.locked.lock();
        match st.state {
            State::InFilterOpen => EngineInner::drive_connect(engine, &mut st),
            State::InFilterClose => EngineInner::drive_disconnect(engine, &mut st),
            State::Open => st.filter.timeout(),
            _ => trace!(state = %st.state, "timer fired in a state with nothing to do"),
        }
    }

    /// Redelivers a latched read-side error, or (when `err` is `None`)
    /// flushes upper-layer bytes the filter is already holding buffered —
    /// the case `set_read_enable(true)` schedules when re-enabling reads
    /// finds `Filter::ll_write_pending()` true, since no fresh lower-layer
    /// activity will arrive to trigger `LlCallbacks::on_read` on its own.
    fn deliver_read(engine: &Arc<EngineInner>, err: Option<EngineError>) {
        if let Some(err) = err {
            engine.user.on_read(Some(&err), &[], ReadFlags::default());
            return;
        }
        let mut st = engine.locked.lock();
        if st.state != State::Open {
            return;
        }
        if st.in_read {
            // A live delivery raced this flush for the filter; retry once
            // it releases it.
            EngineInner::schedule_read(engine, &mut st, None);
            return;
        }
        st.in_read = true;
        let mut filter = std::mem::replace(&mut st.filter, Box::new(TakenFilter));
        drop(st);
        let mut sink = UserSink { user: engine.user.as_ref() };
        let result = filter.ll_write(&mut sink, &[]);
        let mut st = engine.locked.lock();
        st.filter = filter;
        st.in_read = false;
        match result {
            Ok(_) => engine.reconcile_ll_enables(&mut st),
            Err(e) => {
                warn!(error = %e, "filter error while flushing buffered read data");
                EngineInner::schedule_read(engine, &mut st, Some(e));
            }
        }
        if st.close_requested_during_read {
            st.close_requested_during_read = false;
            EngineInner::begin_close(engine, &mut st);
        }
    }
}

// ---------------------------------------------------------------------
// Public handle
// ---------------------------------------------------------------------

/// 公开的引擎句柄。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 把下层传输、可选过滤器、用户回调这三个协作者装配成一条单一的数据通路，
///   宿主应用只需要持有这一个句柄就能驱动打开/写入/关闭,并通过背压标志
///   控制读写回调的节奏；
/// - 每个克隆都是独立计数的「自由引用」,最后一个句柄被丢弃时主动开始关闭
///   仍处于打开状态的流水线,让遗忘调用 `close()` 不至于泄漏一个打开的套接字。
///
/// ## 架构定位（Architecture）
/// - `Engine` 本身只是 `Arc<EngineInner>` 的薄包装；真正的状态机与锁都在
///   [`EngineInner`] 里,`Engine` 只负责维护 `user_handles` 计数和把调用转发
///   过去。
///
/// ## 风险提示（Trade-offs）
/// - 克隆 `Engine` 便宜,但每次克隆/丢弃都要维护 `user_handles`,忘记走
///   [`Clone`]/[`Drop`]（例如用 `unsafe` 手工复制底层指针）会让这个计数
///   失真,进而让孤儿关闭逻辑失效。
pub struct Engine(Arc<EngineInner>);

impl Engine {
    /// 为一个尚未打开的下层构造引擎,之后通过 [`Engine::open`] 驱动连接。
    pub fn new(
        ll: Box<dyn LowerLayer>,
        filter: Box<dyn Filter>,
        user: Arc<dyn UserCallbacks>,
        runner: Arc<dyn DeferredRunner>,
        timer: Arc<dyn Timer>,
        config: EngineConfig,
    ) -> Self {
        let inner = EngineInner::new(ll, filter, user, runner, timer, config);
        inner.user_handles.fetch_add(1, Ordering::AcqRel);
        Self(inner)
    }

    /// 为一个已经打开的下层构造引擎。
    ///
    /// # 教案级注释
    ///
    /// ## 意图（Why）
    /// - 服务端场景里,接受连接（不在本 crate 范围内,见 `spec.md` §1）已经
    ///   把下层带到可用状态,没有必要再让它走一遍 `CLOSED` → `IN_LL_OPEN`
    ///   的完整流程；这个构造函数直接从 `IN_FILTER_OPEN` 起步。
    ///
    /// ## 实现逻辑（How）
    /// - 跳过 `CLOSED`/`IN_LL_OPEN`,一旦下层确认就绪就落在 `IN_FILTER_OPEN`,
    ///   因为下层自己在过滤器握手开始之前已经没有别的事要做；
    /// - 与 [`Engine::open`] 不同,第一次握手尝试*不*由本次调用同步驱动：
    ///   它由最先到达的下层回调（一次读取或一次可写）触发,因为两者从一开始
    ///   就都被启用了。刚被接受的传输通常已经可写,所以实践中多半是
    ///   `on_write_ready`,但一个需要对端先开口的过滤器（例如等待客户端
    ///   hello）同样可以靠 `on_read` 驱动同一个 `try_connect`。
    ///
    /// ## 风险提示（Trade-offs）
    /// - 调用方必须确保传入的 `ll` 真的已经处于可用状态；如果实际上还在
    ///   异步打开,这个构造函数不会替你补上 `IN_LL_OPEN` 阶段,下层的首个
    ///   回调就会在错误的状态上驱动握手。
    pub fn accept(
        ll: Box<dyn LowerLayer>,
        filter: Box<dyn Filter>,
        user: Arc<dyn UserCallbacks>,
        runner: Arc<dyn DeferredRunner>,
        timer: Arc<dyn Timer>,
        config: EngineConfig,
        on_open: OpenCompletion,
    ) -> Result<Self> {
        let inner = EngineInner::new(ll, filter, user, runner, timer, config);
        inner.user_handles.fetch_add(1, Ordering::AcqRel);
        {
            let mut st = inner.locked.lock();
            st.state = State::InLlOpen;
            st.open_completion = Some(on_open);
        }
        let callbacks: Arc<dyn LlCallbacks> = CallbackHandle::new(Arc::clone(&inner));
        match inner.ll.open(callbacks) {
            Ok(OpenOutcome::Ready) => {
                let mut st = inner.locked.lock();
                st.state = State::InFilterOpen;
                inner.reconcile_ll_enables(&mut st);
            }
            Ok(OpenOutcome::InProgress) => {}
            Err(e) => {
                let mut st = inner.locked.lock();
                st.state = State::Closed;
                st.open_completion = None;
                return Err(e);
            }
        }
        Ok(Self(inner))
    }

    /// 发起打开：驱动下层 `LowerLayer::open`,完成后继续过滤器握手。
    pub fn open(&self, on_open: OpenCompletion) -> Result<()> {
        {
            let mut st = self.0.locked.lock();
            if st.state != State::Closed {
                return Err(EngineError::Busy);
            }
            st.state = State::InLlOpen;
            st.open_completion = Some(on_open);
        }
        let callbacks: Arc<dyn LlCallbacks> = CallbackHandle::new(Arc::clone(&self.0));
        match self.0.ll.open(callbacks) {
            Ok(OpenOutcome::Ready) => {
                let mut st = self.0.locked.lock();
                st.state = State::InFilterOpen;
                EngineInner::drive_connect(&self.0, &mut st);
                Ok(())
            }
            Ok(OpenOutcome::InProgress) => Ok(()),
            Err(e) => {
                let mut st = self.0.locked.lock();
                st.state = State::Closed;
                st.open_completion = None;
                Err(e)
            }
        }
    }

    /// 非阻塞写入：先交给过滤器编码,再经下层发送;可能短写。
    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        let mut st = self.0.locked.lock();
        if let Some(err) = st.saved_xmit_err.take() {
            return Err(err);
        }
        if st.state != State::Open {
            return Err(EngineError::NotOpen);
        }
        let mut ll_err = None;
        let mut sink = LlSink {
            ll: self.0.ll.as_ref(),
            err: &mut ll_err,
        };
        let written = st.filter.ul_write(&mut sink, buf)?;
        if let Some(e) = ll_err {
            st.saved_xmit_err = Some(EngineError::comm_error(StringError(e.to_string())));
        }
        self.0.reconcile_ll_enables(&mut st);
        Ok(written)
    }

    /// 发起关闭：`OPEN` 时立即开始排空/握手;打开尚在进行时延后到打开结算。
    pub fn close(&self, on_close: CloseCompletion) -> Result<()> {
        let mut st = self.0.locked.lock();
        match st.state {
            State::Closed => return Err(EngineError::NotOpen),
            State::InLlOpen | State::InFilterOpen => {
                st.close_requested_during_open = true;
                st.close_completion = Some(on_close);
                return Ok(());
            }
            State::CloseWaitDrain | State::InFilterClose | State::InLlClose => {
                return Err(EngineError::Busy);
            }
            State::Open => {}
        }
        st.close_completion = Some(on_close);
        if st.in_read {
            // The filter is currently on loan to a read delivery running
            // with the lock released (see `CallbackHandle::on_read`); defer
            // until it hands the filter back instead of transitioning off
            // the `TakenFilter` stand-in.
            st.close_requested_during_read = true;
            return Ok(());
        }
        EngineInner::begin_close(&self.0, &mut st);
        Ok(())
    }

    /// 启用或禁用读回调投递,表达读侧背压。
    pub fn set_read_enable(&self, enable: bool) -> Result<()> {
        let mut st = self.0.locked.lock();
        if st.state != State::Open {
            return Err(EngineError::NotOpen);
        }
        st.read_enabled = enable;
        if enable && st.filter.ll_write_pending() {
            // Bytes are already buffered in the filter with nothing fresh
            // expected from the lower layer; nudge them out via the
            // deferred dispatcher rather than waiting for an `on_read` that
            // may never come.
            EngineInner::schedule_read(&self.0, &mut st, None);
        }
        self.0.reconcile_ll_enables(&mut st);
        Ok(())
    }

    /// 启用或禁用写回调投递,表达写侧背压。
    pub fn set_write_enable(&self, enable: bool) -> Result<()> {
        let mut st = self.0.locked.lock();
        if st.state != State::Open {
            return Err(EngineError::NotOpen);
        }
        st.write_enabled = enable;
        self.0.reconcile_ll_enables(&mut st);
        Ok(())
    }

    pub fn raddr_to_str(&self) -> Option<String> {
        self.0.ll.raddr_to_str()
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.0.ll.remote_addr()
    }

    pub fn remote_id(&self) -> Option<String> {
        self.0.ll.remote_id()
    }
}

impl Clone for Engine {
    fn clone(&self) -> Self {
        self.0.user_handles.fetch_add(1, Ordering::AcqRel);
        Self(Arc::clone(&self.0))
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if self.0.user_handles.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        let mut st = self.0.locked.lock();
        if st.state == State::Open {
            debug!("last engine handle dropped while open; closing");
            st.close_completion = Some(Box::new(|| {}));
            if st.in_read {
                st.close_requested_during_read = true;
            } else {
                EngineInner::begin_close(&self.0, &mut st);
            }
        } else if matches!(st.state, State::InLlOpen | State::InFilterOpen) {
            st.close_requested_during_open = true;
            st.close_completion = Some(Box::new(|| {}));
        }
    }
}

/// 包一层 `Arc<EngineInner>`,让只拿到 `&self` 的下层/过滤器回调 trait
/// 总能以 `self.0` 的形式拿到调度后续工作（定时器、延迟排空）所需的 `Arc`。
struct CallbackHandle(Arc<EngineInner>);

impl CallbackHandle {
    fn new(inner: Arc<EngineInner>) -> Arc<Self> {
        Arc::new(Self(inner))
    }
}

impl LlCallbacks for CallbackHandle {
    fn on_open_done(&self, result: Result<()>) {
        let mut st = self.0.locked.lock();
        if st.state != State::InLlOpen {
            trace!("stray on_open_done outside IN_LL_OPEN; ignoring");
            return;
        }
        match result {
            Ok(()) => {
                st.state = State::InFilterOpen;
                EngineInner::drive_connect(&self.0, &mut st);
            }
            Err(e) => EngineInner::fail_open(&self.0, &mut st, e),
        }
    }

    fn on_read(&self, err: Option<&EngineError>, buf: &[u8]) -> usize {
        let mut st = self.0.locked.lock();
        match st.state {
            State::InFilterOpen | State::InFilterClose => {
                // Handshake bytes: the filter consumes them through the
                // same `ll_write` it uses once open, just bound to a sink
                // that discards rather than a user callback (no decoded
                // application data exists until the handshake finishes).
                // `try_connect`/`try_disconnect` are re-polled immediately
                // after, since feeding bytes is what lets a handshake
                // that was waiting on I/O make its next step.
                if let Some(err) = err {
                    st.ll_err_occurred = true;
                    let err = EngineError::comm_error(StringError(err.to_string()));
                    if st.state == State::InFilterOpen {
                        EngineInner::fail_open(&self.0, &mut st, err);
                    } else {
                        warn!(error = %err, "read error during disconnect; closing anyway");
                        st.filter.cleanup();
                        st.state = State::InLlClose;
                        if let CloseOutcome::Ready = self.0.ll.close() {
                            EngineInner::finish_close(&self.0, &mut st);
                        }
                    }
                    return buf.len();
                }
                let mut sink = NullSink;
                let consumed = match st.filter.ll_write(&mut sink, buf) {
                    Ok(n) => n,
                    Err(e) => {
                        EngineInner::fail_open(&self.0, &mut st, e);
                        return buf.len();
                    }
                };
                if st.state == State::InFilterOpen {
                    EngineInner::drive_connect(&self.0, &mut st);
                } else {
                    EngineInner::drive_disconnect(&self.0, &mut st);
                }
                consumed
            }
            State::Open => {
                if let Some(err) = err {
                    st.ll_err_occurred = true;
                    let err = EngineError::comm_error(StringError(err.to_string()));
                    EngineInner::schedule_read(&self.0, &mut st, Some(err));
                    return buf.len();
                }
                if !st.read_enabled && !st.filter.ll_read_needed() {
                    return 0;
                }
                if st.in_read {
                    // A delivery is already in flight (live or a deferred
                    // flush); exert backpressure rather than re-enter the
                    // user's read callback concurrently.
                    return 0;
                }
                // The filter's `ll_write` drives a sink that calls straight
                // into `UserCallbacks::on_read`, so the lock must not be
                // held across it — otherwise a user callback that turns
                // around and calls back into the engine (close, write,
                // another enable toggle) would deadlock on its own thread.
                st.in_read = true;
                let mut filter = std::mem::replace(&mut st.filter, Box::new(TakenFilter));
                drop(st);
                let mut sink = UserSink { user: self.0.user.as_ref() };
                let result = filter.ll_write(&mut sink, buf);
                let mut st = self.0.locked.lock();
                st.filter = filter;
                st.in_read = false;
                let consumed = match result {
                    Ok(n) => {
                        self.0.reconcile_ll_enables(&mut st);
                        n
                    }
                    Err(e) => {
                        EngineInner::schedule_read(&self.0, &mut st, Some(e));
                        buf.len()
                    }
                };
                if st.close_requested_during_read {
                    st.close_requested_during_read = false;
                    EngineInner::begin_close(&self.0, &mut st);
                }
                consumed
            }
            _ => 0,
        }
    }

    fn on_write_ready(&self) {
        let mut st = self.0.locked.lock();
        st.ll_write_enabled = false;
        self.0.ll.set_write_callback_enable(false);
        if st.filter.ul_write_pending() {
            // Bytes the filter is still holding from a prior short
            // `ul_write` (or from a caller-side `hold_outbound`-style
            // buffering) get another chance to reach the lower layer here,
            // via the same path as an ordinary write but with nothing new
            // from the user: an empty buffer just asks the filter to push
            // whatever it already has.
            let mut ll_err = None;
            let mut sink = LlSink { ll: self.0.ll.as_ref(), err: &mut ll_err };
            if let Err(e) = st.filter.ul_write(&mut sink, &[]) {
                st.saved_xmit_err = Some(e);
            } else if let Some(e) = ll_err {
                st.saved_xmit_err = Some(EngineError::comm_error(StringError(e.to_string())));
            }
        }
        match st.state {
            State::InFilterOpen => EngineInner::drive_connect(&self.0, &mut st),
            State::InFilterClose => EngineInner::drive_disconnect(&self.0, &mut st),
            State::CloseWaitDrain => {
                if !st.filter.ul_write_pending() {
                    st.state = State::InFilterClose;
                    EngineInner::drive_disconnect(&self.0, &mut st);
                } else {
                    self.0.reconcile_ll_enables(&mut st);
                }
            }
            State::Open => {
                self.0.reconcile_ll_enables(&mut st);
                if st.write_enabled {
                    EngineInner::schedule_write_ready(&self.0, &mut st);
                }
            }
            _ => self.0.reconcile_ll_enables(&mut st),
        }
    }

    fn on_urgent(&self) {
        let mut st = self.0.locked.lock();
        st.filter.ll_urgent();
        if st.state == State::Open {
            EngineInner::schedule_urgent(&self.0, &mut st);
        }
    }

    fn on_close_done(&self) {
        let mut st = self.0.locked.lock();
        if st.state != State::InLlClose {
            trace!("stray on_close_done outside IN_LL_CLOSE; ignoring");
            return;
        }
        EngineInner::finish_close(&self.0, &mut st);
    }
}

impl FilterCallbacks for CallbackHandle {
    fn output_ready(&self) {
        self.0.ll.set_write_callback_enable(true);
        // 过滤器允许在 `try_connect`/`try_disconnect`/`ul_write`/`ll_write`
        // 内部同步调用这个方法,而这些方法都在本线程已经持有引擎锁的情况下
        // 运行。在这里直接 `lock()` 会自我死锁,所以退化为把剩下的工作推迟到
        // 外层调用返回、释放锁之后执行。
        match self.0.locked.try_lock() {
            Some(mut st) => st.ll_write_enabled = true,
            None => {
                let inner = Arc::clone(&self.0);
                self.0.dispatcher.run_later(move || {
                    inner.locked.lock().ll_write_enabled = true;
                });
            }
        }
    }

    fn start_timer(&self, timeout: Duration) {
        match self.0.locked.try_lock() {
            Some(st) => {
                if st.state != State::Open {
                    return;
                }
                drop(st);
                EngineInner::arm_timer(&self.0, timeout);
            }
            None => {
                let inner = Arc::clone(&self.0);
                self.0.dispatcher.run_later(move || {
                    if inner.locked.lock().state != State::Open {
                        return;
                    }
                    EngineInner::arm_timer(&inner, timeout);
                });
            }
        }
    }
}

// ---------------------------------------------------------------------
// Sinks
// ---------------------------------------------------------------------

struct LlSink<'a> {
    ll: &'a dyn LowerLayer,
    err: &'a mut Option<EngineError>,
}

impl Sink for LlSink<'_> {
    fn accept(&mut self, buf: &[u8]) -> usize {
        match self.ll.write(buf) {
            Ok(n) => n,
            Err(e) => {
                *self.err = Some(e);
                0
            }
        }
    }
}

struct UserSink<'a> {
    user: &'a dyn UserCallbacks,
}

impl Sink for UserSink<'_> {
    fn accept(&mut self, buf: &[u8]) -> usize {
        self.user.on_read(None, buf, ReadFlags::default())
    }
}

/// 丢弃过滤器提供的任何内容。绑定到握手流量,此时还没有已解码的应用数据
/// 可以投递到任何地方。
struct NullSink;

impl Sink for NullSink {
    fn accept(&mut self, buf: &[u8]) -> usize {
        buf.len()
    }
}

/// 在真正的过滤器被取出、以释放引擎锁的方式调用它的短暂窗口期间
/// （`on_read` 的实时投递路径、`deliver_read` 的缓冲刷新路径）,安装到
/// `EngineState::filter` 里的替身。调用到达这里意味着第二个数据通路操作
/// 在过滤器被借出期间与第一个抢了同一个过滤器；在引擎单协作循环的模型下,
/// `in_read` 守卫本应让这种情况不可能发生,所以这只会在真正并发、
/// 由线程池分发的回调投递下触发。报错而不是 panic,因为任何公开操作都
/// 不允许 panic。
struct TakenFilter;

impl Filter for TakenFilter {
    fn setup(&mut self, _callbacks: Arc<dyn FilterCallbacks>) {}

    fn try_connect(&mut self, _timeout: Duration) -> Result<HandshakeProgress> {
        Err(EngineError::Busy)
    }

    fn try_disconnect(&mut self, _timeout: Duration) -> Result<HandshakeProgress> {
        Err(EngineError::Busy)
    }

    fn ul_write(&mut self, _sink: &mut dyn Sink, _buf: &[u8]) -> Result<usize> {
        Err(EngineError::Busy)
    }

    fn ll_write(&mut self, _sink: &mut dyn Sink, _buf: &[u8]) -> Result<usize> {
        Err(EngineError::Busy)
    }
}

/// 把一条已经渲染好的错误信息包回一个全新的 `Error`,用于重新包装从
/// `&EngineError` 借用里读出来的 `EngineError`（原始值带着自己可能不是
/// `Clone` 的 cause,无法被移动）。
#[derive(Debug)]
struct StringError(String);

impl std::fmt::Display for StringError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for StringError {}
