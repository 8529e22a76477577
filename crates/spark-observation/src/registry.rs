use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use parking_lot::RwLock;

use crate::{
    context::Context,
    convention::{ObservationConvention, SharedConvention},
    handler::{ObservationHandler, SharedHandler},
    observation::Observation,
    scope,
};

/// 创建前的门控谓词：返回 `false` 时本次调用退化为 NOOP。
///
/// 闭包 `Fn(&str, &Context) -> bool` 自动实现本 Trait；闭包参数需显式标注类型
/// （`|name: &str, context: &Context| ...`），以便推导出高阶生命周期。
pub trait ObservationPredicate: Send + Sync + 'static {
    fn test(&self, name: &str, context: &Context) -> bool;
}

impl<F> ObservationPredicate for F
where
    F: Fn(&str, &Context) -> bool + Send + Sync + 'static,
{
    fn test(&self, name: &str, context: &Context) -> bool {
        self(name, context)
    }
}

/// `start()` 时对 Context 做增补或改写的过滤器。
///
/// 接收 Context 所有权并返回（通常是同一个实例）；闭包 `Fn(Context) -> Context` 自动实现本 Trait。
pub trait ObservationFilter: Send + Sync + 'static {
    fn map(&self, context: Context) -> Context;
}

impl<F> ObservationFilter for F
where
    F: Fn(Context) -> Context + Send + Sync + 'static,
{
    fn map(&self, context: Context) -> Context {
        self(context)
    }
}

pub type SharedPredicate = Arc<dyn ObservationPredicate>;
pub type SharedFilter = Arc<dyn ObservationFilter>;

static NEXT_REGISTRY_ID: AtomicU64 = AtomicU64::new(1);

/// 进程级（或作用域级）的 Observation 配置中心。
///
/// # 设计背景（Why）
/// - 埋点代码只持有 Registry，不感知具体后端；应用启动时在 Registry 上装配 Handler、Predicate、
///   Filter 与全局 Convention，决定“要不要度量、怎么度量”。
/// - 没有隐式的全局默认实例：谁创建、谁持有，生命周期完全由应用控制。
///
/// # 逻辑解析（How）
/// - 句柄内部为 `Arc`，`clone` 只增加引用计数，可随意注入各组件；
/// - 配置以追加方式写入读写锁保护的列表，读取方在创建/启动 Observation 时拍快照。
///
/// # 契约说明（What）
/// - **配置时机**：配置应在并发使用开始前完成（由调用方串行化）。锁只保证内存安全，
///   不保证“配置与创建并发”时的语义：已创建的 Observation 永远使用创建时筛选出的 Handler 列表。
/// - **只增不减**：不提供删除操作，Handler/Predicate/Filter 在 Registry 生命周期内持续有效。
/// - **当前 Observation**：[`Self::current_observation`] 读取调用线程上属于本 Registry 的最内层作用域。
#[derive(Clone)]
pub struct ObservationRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    id: u64,
    state: RwLock<RegistryState>,
}

#[derive(Default)]
struct RegistryState {
    handlers: Vec<SharedHandler>,
    predicates: Vec<SharedPredicate>,
    filters: Vec<SharedFilter>,
    conventions: Vec<SharedConvention>,
}

impl ObservationRegistry {
    /// 创建空 Registry；未注册任何 Handler 前，所有 Observation 都是 NOOP。
    pub fn create() -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                id: NEXT_REGISTRY_ID.fetch_add(1, Ordering::Relaxed),
                state: RwLock::new(RegistryState::default()),
            }),
        }
    }

    /// 获取配置入口。
    pub fn config(&self) -> ObservationConfig<'_> {
        ObservationConfig { registry: self }
    }

    /// 进程内唯一的 Registry 标识，用于区分同一线程上不同 Registry 的作用域。
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// 未注册任何 Handler 时为 `true`，此时创建 Observation 必然得到 NOOP。
    pub fn is_noop(&self) -> bool {
        self.inner.state.read().handlers.is_empty()
    }

    /// 调用线程上属于本 Registry 的当前 Observation；不在任何作用域内时返回 `None`。
    pub fn current_observation(&self) -> Option<Observation> {
        scope::current_for(self.inner.id)
    }

    /// 调用线程上属于本 Registry 的已打开作用域层数。
    pub fn current_scope_depth(&self) -> usize {
        scope::depth_for(self.inner.id)
    }

    pub fn ptr_eq(&self, other: &ObservationRegistry) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// 按注册顺序依次评估 Predicate，首个拒绝即短路返回 `false`。
    pub(crate) fn passes_predicates(&self, name: &str, context: &Context) -> bool {
        let predicates = self.inner.state.read().predicates.clone();
        predicates
            .iter()
            .all(|predicate| predicate.test(name, context))
    }

    /// 按注册顺序筛选支持该 Context 的 Handler。
    pub(crate) fn handlers_supporting(&self, context: &Context) -> Vec<SharedHandler> {
        let handlers = self.inner.state.read().handlers.clone();
        handlers
            .into_iter()
            .filter(|handler| handler.supports_context(context))
            .collect()
    }

    pub(crate) fn filters(&self) -> Vec<SharedFilter> {
        self.inner.state.read().filters.clone()
    }

    pub(crate) fn conventions(&self) -> Vec<SharedConvention> {
        self.inner.state.read().conventions.clone()
    }
}

impl fmt::Debug for ObservationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.read();
        f.debug_struct("ObservationRegistry")
            .field("id", &self.inner.id)
            .field("handlers", &state.handlers.len())
            .field("predicates", &state.predicates.len())
            .field("filters", &state.filters.len())
            .field("conventions", &state.conventions.len())
            .finish()
    }
}

/// Registry 的配置入口，所有方法都以追加方式生效并返回自身以便链式调用。
///
/// ```rust
/// use spark_observation::{Context, ObservationRegistry, test_stubs::handlers::AcceptAllHandler};
///
/// let registry = ObservationRegistry::create();
/// registry
///     .config()
///     .add_handler(AcceptAllHandler)
///     .add_predicate(|name: &str, _context: &Context| !name.starts_with("internal."))
///     .add_filter(|context: Context| context.with_low_cardinality_key_value(("region", "eu")));
/// assert!(!registry.is_noop());
/// ```
pub struct ObservationConfig<'a> {
    registry: &'a ObservationRegistry,
}

impl ObservationConfig<'_> {
    pub fn add_handler<H>(&self, handler: H) -> &Self
    where
        H: ObservationHandler,
    {
        self.add_shared_handler(Arc::new(handler))
    }

    pub fn add_shared_handler(&self, handler: SharedHandler) -> &Self {
        self.registry.inner.state.write().handlers.push(handler);
        self
    }

    pub fn add_predicate<P>(&self, predicate: P) -> &Self
    where
        P: ObservationPredicate,
    {
        self.registry
            .inner
            .state
            .write()
            .predicates
            .push(Arc::new(predicate));
        self
    }

    pub fn add_filter<F>(&self, filter: F) -> &Self
    where
        F: ObservationFilter,
    {
        self.registry
            .inner
            .state
            .write()
            .filters
            .push(Arc::new(filter));
        self
    }

    /// 设置唯一的全局 Convention，替换此前注册的全部全局 Convention。
    pub fn set_convention<C>(&self, convention: C) -> &Self
    where
        C: ObservationConvention,
    {
        let mut state = self.registry.inner.state.write();
        state.conventions.clear();
        state.conventions.push(Arc::new(convention));
        drop(state);
        self
    }

    /// 追加一个全局 Convention；决议时按注册顺序取第一个支持当前 Context 的。
    pub fn add_convention<C>(&self, convention: C) -> &Self
    where
        C: ObservationConvention,
    {
        self.add_shared_convention(Arc::new(convention))
    }

    pub fn add_shared_convention(&self, convention: SharedConvention) -> &Self {
        self.registry
            .inner
            .state
            .write()
            .conventions
            .push(convention);
        self
    }

    pub fn handler_count(&self) -> usize {
        self.registry.inner.state.read().handlers.len()
    }

    pub fn predicate_count(&self) -> usize {
        self.registry.inner.state.read().predicates.len()
    }

    pub fn filter_count(&self) -> usize {
        self.registry.inner.state.read().filters.len()
    }

    pub fn convention_count(&self) -> usize {
        self.registry.inner.state.read().conventions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_stubs::handlers::AcceptAllHandler;

    #[test]
    fn predicates_short_circuit_in_registration_order() {
        use std::sync::atomic::AtomicUsize;

        let registry = ObservationRegistry::create();
        let evaluated = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&evaluated);
        registry
            .config()
            .add_predicate(|_: &str, _: &Context| false)
            .add_predicate(move |_: &str, _: &Context| {
                counter.fetch_add(1, Ordering::SeqCst);
                true
            });

        assert!(!registry.passes_predicates("foo", &Context::new()));
        assert_eq!(evaluated.load(Ordering::SeqCst), 0, "首个拒绝后不应继续评估");
    }

    #[test]
    fn set_convention_replaces_previous_globals() {
        struct Global;

        impl ObservationConvention for Global {
            fn supports_context(&self, _context: &Context) -> bool {
                true
            }
        }

        let registry = ObservationRegistry::create();
        let config = registry.config();
        config.add_convention(Global).add_convention(Global);
        assert_eq!(config.convention_count(), 2);
        config.set_convention(Global);
        assert_eq!(config.convention_count(), 1);
    }

    #[test]
    fn registries_are_distinct_and_cheap_to_clone() {
        let registry = ObservationRegistry::create();
        let alias = registry.clone();
        registry.config().add_handler(AcceptAllHandler);

        assert!(alias.ptr_eq(&registry));
        assert!(!alias.is_noop(), "克隆共享同一份配置");
        assert!(!ObservationRegistry::create().ptr_eq(&registry));
        assert_ne!(ObservationRegistry::create().id(), registry.id());
    }
}
