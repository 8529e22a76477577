#![doc = "spark-observation: 与后端无关的 Observation 埋点核心。"]
#![doc = ""]
#![doc = "调用点只声明“某个操作正在发生”，指标、追踪与日志由 Registry 上装配的 Handler 决定。"]
#![doc = ""]
#![doc = "# 模块地图"]
#![doc = "- [`key_values`]：低/高基数标签模型；"]
#![doc = "- [`context`]：单次 Observation 的可变数据载体与属性仓库；"]
#![doc = "- [`convention`]：命名与打标签策略及其优先级决议；"]
#![doc = "- [`handler`]：生命周期事件的分发目标与组合器；"]
#![doc = "- [`registry`]：Handler/Predicate/Filter/全局 Convention 的配置中心；"]
#![doc = "- [`observation`]：生命周期句柄与 NOOP 哨兵；"]
#![doc = "- [`scope`]：线程级“当前 Observation”栈。"]
#![doc = ""]
#![doc = "```rust"]
#![doc = "use spark_observation::{Observation, ObservationRegistry, test_stubs::handlers::AcceptAllHandler};"]
#![doc = ""]
#![doc = "let registry = ObservationRegistry::create();"]
#![doc = "assert!(Observation::create_not_started(\"disabled\", &registry).is_noop());"]
#![doc = ""]
#![doc = "registry.config().add_handler(AcceptAllHandler);"]
#![doc = "let observation = Observation::start_new(\"orders.checkout\", &registry);"]
#![doc = "observation.scoped(|| assert!(registry.current_observation().is_some()));"]
#![doc = "observation.stop().expect(\"stop 一次\");"]
#![doc = "```"]
#![deny(unsafe_code)]

pub mod context;
pub mod convention;
pub mod error;
pub mod handler;
pub mod key_values;
pub mod observation;
pub mod registry;
pub mod scope;
/// 测试桩命名空间，集中暴露官方维护的 Handler 桩实现，供单元测试、集成测试与文档示例复用。
///
/// # 设计背景（Why）
/// - 统一维护常见桩对象，避免在各处重复定义；
/// - Handler 契约演进时，通过单点更新保证所有测试同步适配。
pub mod test_stubs;

pub use context::{Context, ObservedError};
pub use convention::{ConventionChain, ConventionSource, ObservationConvention, SharedConvention};
pub use error::{ObservationError, Result};
pub use handler::{
    AllMatchingCompositeHandler, FirstMatchingCompositeHandler, ObservationHandler, SharedHandler,
};
pub use key_values::{Cardinality, KeyValue, KeyValues};
pub use observation::{Event, LifecycleState, Observation};
pub use registry::{
    ObservationConfig, ObservationFilter, ObservationPredicate, ObservationRegistry, SharedFilter,
    SharedPredicate,
};
pub use scope::Scope;
