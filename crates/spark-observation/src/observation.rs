use std::{
    borrow::Cow,
    error::Error,
    fmt, mem,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace, warn};

use crate::{
    context::{Context, ObservedError, ParentKind},
    convention::{ConventionChain, SharedConvention},
    error::{ObservationError, Result},
    handler::SharedHandler,
    key_values::{KeyValue, KeyValues},
    registry::ObservationRegistry,
    scope::{self, Scope},
};

static NEXT_OBSERVATION_ID: AtomicU64 = AtomicU64::new(1);

/// Observation 的生命周期状态，只能单调前进：`Created → Started → Stopped`。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    Created,
    Started,
    Stopped,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LifecycleState::Created => "CREATED",
            LifecycleState::Started => "STARTED",
            LifecycleState::Stopped => "STOPPED",
        })
    }
}

/// 单次被度量操作的句柄。
///
/// # 设计背景（Why）
/// - 调用点只声明“某个操作正在发生”，由 Registry 上装配的 Handler 决定如何度量；
/// - 埋点被禁用时（无 Registry、无 Handler、Predicate 拒绝）返回 [`Observation::NOOP`]，
///   其全部操作都是空操作，调用点无需任何分支判断。
///
/// # 逻辑解析（How）
/// - 句柄内部是 `Arc`，`clone` 得到指向同一 Observation 的新句柄，可跨线程传递后在目标线程重新
///   [`open_scope`](Self::open_scope)；
/// - Handler 列表在创建时筛选一次并固定，此后 Registry 的变化不影响已创建的实例；
/// - Convention 决议、Filter 链与 `on_start` 通知全部发生在 [`start`](Self::start) 内。
///
/// # 契约说明（What）
/// - **生命周期**：`start` 仅能在 `Created` 状态调用一次，`stop` 仅能在 `Started` 状态调用一次，
///   `event` 仅在 `Started` 状态有效；违反时返回 [`ObservationError::InvalidState`]。
/// - **通知顺序**：所有回调（包括 `on_stop`）均按 Handler 注册顺序触发。
/// - **错误槽**：多次 `error` 只保留最后一次记录。
/// - **NOOP**：永远处于等价于 `Stopped` 的惰性状态，所有生命周期方法返回 `Ok(())`。
///
/// ```rust
/// use spark_observation::{Observation, ObservationRegistry, test_stubs::handlers::AcceptAllHandler};
///
/// let registry = ObservationRegistry::create();
/// registry.config().add_handler(AcceptAllHandler);
///
/// let observation = Observation::create_not_started("orders.checkout", &registry);
/// observation.low_cardinality_key_value(("region", "eu"));
/// let total = observation.observe(|| 40 + 2).expect("新建的 Observation 可以 observe");
/// assert_eq!(total, 42);
/// ```
#[derive(Clone)]
pub struct Observation {
    kind: Kind,
}

#[derive(Clone)]
enum Kind {
    Noop,
    Active(Arc<ObservationCore>),
}

impl Observation {
    /// 埋点被禁用时使用的哨兵实例。
    pub const NOOP: Observation = Observation { kind: Kind::Noop };

    pub const fn noop() -> Self {
        Self::NOOP
    }

    /// 以名称创建尚未启动的 Observation，Context 为空白实例。
    pub fn create_not_started<'r>(
        name: impl Into<Cow<'static, str>>,
        registry: impl Into<Option<&'r ObservationRegistry>>,
    ) -> Self {
        Self::create_not_started_with(name, Context::new, registry)
    }

    /// 以名称与 Context 工厂创建尚未启动的 Observation。
    ///
    /// 工厂只在 Registry 存在且至少注册了一个 Handler 时才会被调用。
    pub fn create_not_started_with<'r, S>(
        name: impl Into<Cow<'static, str>>,
        supplier: S,
        registry: impl Into<Option<&'r ObservationRegistry>>,
    ) -> Self
    where
        S: FnOnce() -> Context,
    {
        Self::create(Some(name.into()), None, None, supplier, registry.into())
    }

    /// 以调用点自定义 Convention 创建尚未启动的 Observation，名称由 Convention 决议。
    pub fn create_not_started_with_convention<'r, S>(
        convention: SharedConvention,
        supplier: S,
        registry: impl Into<Option<&'r ObservationRegistry>>,
    ) -> Self
    where
        S: FnOnce() -> Context,
    {
        Self::create(None, Some(convention), None, supplier, registry.into())
    }

    /// 埋点库常用入口：可选的调用点自定义 Convention，加上埋点库自带的兜底默认 Convention。
    ///
    /// 决议优先级见 [`ConventionChain`]：埋点级覆盖 > 自定义 > 全局 > 默认。
    pub fn create_not_started_with_conventions<'r, S>(
        custom: Option<SharedConvention>,
        default: Option<SharedConvention>,
        supplier: S,
        registry: impl Into<Option<&'r ObservationRegistry>>,
    ) -> Self
    where
        S: FnOnce() -> Context,
    {
        Self::create(None, custom, default, supplier, registry.into())
    }

    /// 创建并立即启动。
    pub fn start_new<'r>(
        name: impl Into<Cow<'static, str>>,
        registry: impl Into<Option<&'r ObservationRegistry>>,
    ) -> Self {
        Self::start_new_with(name, Context::new, registry)
    }

    pub fn start_new_with<'r, S>(
        name: impl Into<Cow<'static, str>>,
        supplier: S,
        registry: impl Into<Option<&'r ObservationRegistry>>,
    ) -> Self
    where
        S: FnOnce() -> Context,
    {
        let observation = Self::create_not_started_with(name, supplier, registry);
        // 新建实例处于 CREATED 状态，start 不会失败。
        let _ = observation.start();
        observation
    }

    fn create<S>(
        name: Option<Cow<'static, str>>,
        custom: Option<SharedConvention>,
        default: Option<SharedConvention>,
        supplier: S,
        registry: Option<&ObservationRegistry>,
    ) -> Self
    where
        S: FnOnce() -> Context,
    {
        let Some(registry) = registry else {
            trace!("registry 缺失，返回 NOOP");
            return Self::NOOP;
        };
        if registry.is_noop() {
            trace!(registry.id = registry.id(), "registry 未注册 handler，返回 NOOP");
            return Self::NOOP;
        }

        let mut context = supplier();
        let conventions = ConventionChain::new(custom, registry.conventions(), default);
        let proposed_name = match name {
            Some(name) => {
                context.set_name(name.clone());
                name
            }
            None => conventions
                .select(&context)
                .and_then(|(_, convention)| convention.name())
                .or_else(|| context.name().map(|name| Cow::Owned(name.to_owned())))
                .unwrap_or(Cow::Borrowed("")),
        };

        if !registry.passes_predicates(&proposed_name, &context) {
            debug!(
                registry.id = registry.id(),
                observation.name = %proposed_name,
                "predicate 拒绝创建，返回 NOOP"
            );
            return Self::NOOP;
        }

        let handlers = registry.handlers_supporting(&context);
        link_scoped_parent(registry, &mut context, None);

        let core = ObservationCore {
            id: NEXT_OBSERVATION_ID.fetch_add(1, Ordering::Relaxed),
            registry: registry.clone(),
            handlers,
            state: Mutex::new(LifecycleState::Created),
            context: RwLock::new(context),
            conventions: Mutex::new(conventions),
            open_scopes: Mutex::new(Vec::new()),
        };
        trace!(
            observation.id = core.id,
            observation.name = %proposed_name,
            observation.handlers = core.handlers.len(),
            "observation created"
        );
        Self {
            kind: Kind::Active(Arc::new(core)),
        }
    }

    pub(crate) fn from_core(core: Arc<ObservationCore>) -> Self {
        Self {
            kind: Kind::Active(core),
        }
    }

    pub(crate) fn core(&self) -> Option<&Arc<ObservationCore>> {
        match &self.kind {
            Kind::Noop => None,
            Kind::Active(core) => Some(core),
        }
    }

    pub fn is_noop(&self) -> bool {
        matches!(self.kind, Kind::Noop)
    }

    /// 两个句柄是否指向同一 Observation；NOOP 只与 NOOP 相等。
    pub fn ptr_eq(&self, other: &Observation) -> bool {
        match (&self.kind, &other.kind) {
            (Kind::Noop, Kind::Noop) => true,
            (Kind::Active(left), Kind::Active(right)) => Arc::ptr_eq(left, right),
            _ => false,
        }
    }

    /// 进程内唯一的实例标识；NOOP 没有标识。
    pub fn id(&self) -> Option<u64> {
        self.core().map(|core| core.id)
    }

    pub fn state(&self) -> LifecycleState {
        match &self.kind {
            Kind::Noop => LifecycleState::Stopped,
            Kind::Active(core) => *core.state.lock(),
        }
    }

    /// `Created → Started`：决议 Convention、依次执行 Filter、按注册顺序通知 `on_start`。
    ///
    /// Filter panic 时，Context 恢复为调用 `start()` 之前的内容，状态保持 `Created`。
    pub fn start(&self) -> Result<()> {
        let Some(core) = self.core() else {
            return Ok(());
        };
        let mut context = core.context.write();
        core.ensure_state("start", LifecycleState::Created)?;

        let conventions = core.conventions.lock().clone();
        let filters = core.registry.filters();
        let mut staged = StagedContext::new(&mut context, !filters.is_empty());
        link_scoped_parent(&core.registry, staged.context(), Some(core));
        let source = conventions.apply(staged.context());
        if !filters.is_empty() {
            let taken = mem::take(staged.context());
            *staged.context() = filters
                .iter()
                .fold(taken, |context, filter| filter.map(context));
        }
        staged.commit();
        core.transition("start", LifecycleState::Created, LifecycleState::Started)?;

        debug!(
            observation.id = core.id,
            observation.name = context.name().unwrap_or_default(),
            observation.convention = source.map(tracing::field::display),
            "observation started"
        );
        for handler in &core.handlers {
            handler.on_start(&mut context);
        }
        Ok(())
    }

    /// `Started → Stopped`：按注册顺序通知 `on_stop`，随后解除经由作用域捕获的父级引用。
    pub fn stop(&self) -> Result<()> {
        let Some(core) = self.core() else {
            return Ok(());
        };
        core.transition("stop", LifecycleState::Started, LifecycleState::Stopped)?;

        let mut context = core.context.write();
        for handler in &core.handlers {
            handler.on_stop(&mut context);
        }
        context.unlink_scoped_parent();
        debug!(
            observation.id = core.id,
            observation.name = context.name().unwrap_or_default(),
            "observation stopped"
        );
        Ok(())
    }

    /// 记录一次失败并通知 `on_error`，不改变生命周期状态。
    ///
    /// 只借用错误，调用方仍然持有并自行返回原始错误。`Stopped` 之后调用属于用法错误。
    pub fn error<E>(&self, error: &E) -> Result<()>
    where
        E: Error + ?Sized,
    {
        let Some(core) = self.core() else {
            return Ok(());
        };
        core.record_error("error", ObservedError::capture(error))
    }

    /// 通知 `on_event`，仅在 `Started` 状态有效。
    pub fn event(&self, event: Event) -> Result<()> {
        let Some(core) = self.core() else {
            return Ok(());
        };
        core.ensure_state("event", LifecycleState::Started)?;

        let mut context = core.context.write();
        trace!(observation.id = core.id, observation.event = %event.name, "observation event");
        for handler in &core.handlers {
            handler.on_event(&event, &mut context);
        }
        Ok(())
    }

    pub fn contextual_name(&self, name: impl Into<Cow<'static, str>>) -> &Self {
        if let Some(core) = self.core() {
            core.context.write().set_contextual_name(name);
        }
        self
    }

    pub fn low_cardinality_key_value(&self, key_value: impl Into<KeyValue>) -> &Self {
        if let Some(core) = self.core() {
            core.context.write().add_low_cardinality_key_value(key_value);
        }
        self
    }

    pub fn low_cardinality_key_values(&self, key_values: &KeyValues) -> &Self {
        if let Some(core) = self.core() {
            core.context.write().add_low_cardinality_key_values(key_values);
        }
        self
    }

    pub fn high_cardinality_key_value(&self, key_value: impl Into<KeyValue>) -> &Self {
        if let Some(core) = self.core() {
            core.context.write().add_high_cardinality_key_value(key_value);
        }
        self
    }

    pub fn high_cardinality_key_values(&self, key_values: &KeyValues) -> &Self {
        if let Some(core) = self.core() {
            core.context
                .write()
                .add_high_cardinality_key_values(key_values);
        }
        self
    }

    /// 显式声明父 Observation；该引用不随作用域关闭而失效，只要父 Observation 存活即可查到。
    ///
    /// 父级为 NOOP 或就是自身时忽略。
    pub fn parent_observation(&self, parent: &Observation) -> &Self {
        if let (Some(core), Some(parent)) = (self.core(), parent.core()) {
            if !Arc::ptr_eq(core, parent) {
                core.context
                    .write()
                    .link_parent(Arc::downgrade(parent), ParentKind::Explicit);
            }
        }
        self
    }

    /// 附加埋点级 Convention，在 `start()` 决议时优先于其他全部来源。
    pub fn observation_convention(&self, convention: SharedConvention) -> &Self {
        if let Some(core) = self.core() {
            core.conventions.lock().set_instrumentation(convention);
        }
        self
    }

    /// 在读锁内访问 Context；NOOP 传入一个空白 Context。
    ///
    /// 闭包内不得再调用同一 Observation 的可变方法，否则会死锁。
    pub fn with_context<R>(&self, f: impl FnOnce(&Context) -> R) -> R {
        match self.core() {
            Some(core) => f(&core.context.read()),
            None => f(&Context::new()),
        }
    }

    /// 在写锁内修改 Context；NOOP 传入的空白 Context 在闭包返回后即被丢弃。
    pub fn with_context_mut<R>(&self, f: impl FnOnce(&mut Context) -> R) -> R {
        match self.core() {
            Some(core) => f(&mut core.context.write()),
            None => f(&mut Context::new()),
        }
    }

    /// 把本 Observation 设为调用线程的当前 Observation，直到返回的 [`Scope`] 被释放。
    pub fn open_scope(&self) -> Scope {
        Scope::open(self.clone())
    }

    /// 在作用域内执行 `body`；无论正常返回还是 panic 展开，作用域都会被释放。
    pub fn scoped<T>(&self, body: impl FnOnce() -> T) -> T {
        let _scope = self.open_scope();
        body()
    }

    /// 与 [`scoped`](Self::scoped) 相同，但 `body` 返回 `Err` 时先释放作用域，再记录错误，
    /// 最后把原始错误原样返回给调用方。
    pub fn scoped_checked<T, E>(&self, body: impl FnOnce() -> Result<T, E>) -> Result<T, E>
    where
        E: Error,
    {
        self.scoped_recording(body, ObservedError::capture)
    }

    /// [`scoped_checked`](Self::scoped_checked) 的 trait 对象版本，接受
    /// `Box<dyn Error + Send + Sync>`、`Arc<dyn Error + Send + Sync>` 等错误类型。
    pub fn scoped_checked_dyn<T, E>(&self, body: impl FnOnce() -> Result<T, E>) -> Result<T, E>
    where
        E: AsRef<dyn Error + Send + Sync>,
    {
        self.scoped_recording(body, |error| ObservedError::capture(error.as_ref()))
    }

    fn scoped_recording<T, E>(
        &self,
        body: impl FnOnce() -> Result<T, E>,
        capture: impl FnOnce(&E) -> ObservedError,
    ) -> Result<T, E> {
        let result = self.scoped(body);
        if let (Err(error), Some(core)) = (&result, self.core()) {
            // 已 stop 的实例无法记录错误，该用法错误已由 record_error 记录日志，原始错误照常返回。
            let _ = core.record_error("scoped_checked", capture(error));
        }
        result
    }

    /// `start` → 作用域内执行 `body` → `stop`。
    ///
    /// `body` panic 时会在展开路径上记录一个 panic 标记的错误并 `stop`，随后继续展开。
    pub fn observe<T>(&self, body: impl FnOnce() -> T) -> Result<T> {
        self.start()?;
        let guard = StopOnUnwind::new(self);
        let value = self.scoped(body);
        guard.disarm();
        self.stop()?;
        Ok(value)
    }

    /// [`observe`](Self::observe) 的可失败版本：`Err` 会被记录后原样返回。
    ///
    /// 生命周期用法错误经由 `E: From<ObservationError>` 转换后返回。
    pub fn observe_checked<T, E>(&self, body: impl FnOnce() -> Result<T, E>) -> Result<T, E>
    where
        E: Error + From<ObservationError>,
    {
        self.start()?;
        let guard = StopOnUnwind::new(self);
        let result = self.scoped_checked(body);
        guard.disarm();
        self.stop()?;
        result
    }
}

impl Default for Observation {
    fn default() -> Self {
        Self::NOOP
    }
}

impl fmt::Debug for Observation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            Kind::Noop => f.write_str("Observation::NOOP"),
            Kind::Active(core) => {
                let state = *core.state.lock();
                f.debug_struct("Observation")
                    .field("id", &core.id)
                    .field("state", &state)
                    .field("context", &*core.context.read())
                    .field("handlers", &core.handlers.len())
                    .finish()
            }
        }
    }
}

/// 从调用线程的作用域栈捕获父级；已有父级、或当前 Observation 就是自身时不做任何事。
fn link_scoped_parent(
    registry: &ObservationRegistry,
    context: &mut Context,
    own: Option<&Arc<ObservationCore>>,
) {
    if context.has_parent_link() {
        return;
    }
    let Some((current, token)) = scope::current_frame_for(registry.id()) else {
        return;
    };
    if let Some(parent) = current.core() {
        if own.is_some_and(|own| Arc::ptr_eq(own, parent)) {
            return;
        }
        context.link_parent(Arc::downgrade(parent), ParentKind::Scoped { token });
    }
}

/// 单个活跃 Observation 的共享状态。
pub(crate) struct ObservationCore {
    id: u64,
    registry: ObservationRegistry,
    handlers: Vec<SharedHandler>,
    state: Mutex<LifecycleState>,
    context: RwLock<Context>,
    conventions: Mutex<ConventionChain>,
    /// 尚未释放的 Scope 令牌（任意线程）。
    open_scopes: Mutex<Vec<u64>>,
}

impl ObservationCore {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn registry_id(&self) -> u64 {
        self.registry.id()
    }

    /// 令牌对应的 Scope 是否仍未释放。
    pub(crate) fn has_open_scope(&self, token: u64) -> bool {
        self.open_scopes.lock().contains(&token)
    }

    pub(crate) fn scope_opened(&self, token: u64) {
        self.open_scopes.lock().push(token);
        let mut context = self.context.write();
        for handler in &self.handlers {
            handler.on_scope_opened(&mut context);
        }
    }

    /// 先通知 Handler 再移除令牌，回调期间经由该作用域捕获的子级仍能查到本 Observation。
    pub(crate) fn scope_closed(&self, token: u64) {
        {
            let mut context = self.context.write();
            for handler in &self.handlers {
                handler.on_scope_closed(&mut context);
            }
        }
        let mut open_scopes = self.open_scopes.lock();
        if let Some(index) = open_scopes.iter().position(|open| *open == token) {
            open_scopes.swap_remove(index);
        }
    }

    fn record_error(&self, operation: &'static str, error: ObservedError) -> Result<()> {
        {
            let state = self.state.lock();
            if *state == LifecycleState::Stopped {
                return Err(self.invalid_state(operation, *state));
            }
        }
        let mut context = self.context.write();
        debug!(
            observation.id = self.id,
            observation.error = %error,
            "observation error recorded"
        );
        context.set_error(error);
        for handler in &self.handlers {
            handler.on_error(&mut context);
        }
        Ok(())
    }

    fn ensure_state(&self, operation: &'static str, expected: LifecycleState) -> Result<()> {
        let state = *self.state.lock();
        if state == expected {
            Ok(())
        } else {
            Err(self.invalid_state(operation, state))
        }
    }

    fn transition(
        &self,
        operation: &'static str,
        from: LifecycleState,
        to: LifecycleState,
    ) -> Result<()> {
        let mut state = self.state.lock();
        if *state != from {
            return Err(self.invalid_state(operation, *state));
        }
        *state = to;
        Ok(())
    }

    fn invalid_state(&self, operation: &'static str, state: LifecycleState) -> ObservationError {
        warn!(
            observation.id = self.id,
            observation.operation = operation,
            observation.state = %state,
            "非法的生命周期调用"
        );
        ObservationError::InvalidState { operation, state }
    }
}

/// `start()` 期间对 Context 的暂存修改；未 `commit` 就被析构（panic 展开）时写回快照。
struct StagedContext<'a> {
    slot: &'a mut Context,
    snapshot: Option<Context>,
}

impl<'a> StagedContext<'a> {
    fn new(slot: &'a mut Context, keep_snapshot: bool) -> Self {
        let snapshot = keep_snapshot.then(|| slot.snapshot());
        Self { slot, snapshot }
    }

    fn context(&mut self) -> &mut Context {
        &mut *self.slot
    }

    fn commit(mut self) {
        self.snapshot = None;
    }
}

impl Drop for StagedContext<'_> {
    fn drop(&mut self) {
        if let Some(snapshot) = self.snapshot.take() {
            *self.slot = snapshot;
        }
    }
}

/// `observe` 在 panic 展开路径上的收尾：记录 panic 标记并 `stop`。
struct StopOnUnwind<'a> {
    observation: Option<&'a Observation>,
}

impl<'a> StopOnUnwind<'a> {
    fn new(observation: &'a Observation) -> Self {
        Self {
            observation: Some(observation),
        }
    }

    fn disarm(mut self) {
        self.observation = None;
    }
}

impl Drop for StopOnUnwind<'_> {
    fn drop(&mut self) {
        let Some(observation) = self.observation.take() else {
            return;
        };
        if let Some(core) = observation.core() {
            let _ = core.record_error("observe", ObservedError::panic());
        }
        let _ = observation.stop();
    }
}

/// Observation 生命周期内的瞬时事件，例如“收到首字节”。
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Event {
    name: Cow<'static, str>,
    contextual_name: Option<Cow<'static, str>>,
}

impl Event {
    pub fn of(name: impl Into<Cow<'static, str>>) -> Self {
        Self {
            name: name.into(),
            contextual_name: None,
        }
    }

    pub fn with_contextual_name(mut self, name: impl Into<Cow<'static, str>>) -> Self {
        self.contextual_name = Some(name.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 未设置时回落到 [`Self::name`]。
    pub fn contextual_name(&self) -> &str {
        self.contextual_name.as_deref().unwrap_or(&self.name)
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.contextual_name())
    }
}
