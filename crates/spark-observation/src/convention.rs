use std::{borrow::Cow, fmt, iter, sync::Arc};

use crate::{context::Context, key_values::KeyValues};

/// 命名与打标签策略：根据 Context 推导名称、上下文名称与标签。
///
/// # 设计背景（Why）
/// - 埋点库作者给出默认命名，应用方希望全局统一改名或增删标签，个别调用点又需要局部覆盖；
///   把“怎么命名”从调用点剥离为可替换的策略对象，才能在不改埋点代码的前提下调整输出。
///
/// # 契约说明（What）
/// - 实现必须是纯函数：同一 Context 多次调用应得到相同结果，且不得修改 Context；
/// - `name`/`contextual_name` 返回 `None` 表示“不覆盖”，保留 Context 上已有的值；
/// - `supports_context` 为 `false` 时该策略在决议中被跳过。
pub trait ObservationConvention: Send + Sync + 'static {
    /// 技术性名称，通常是静态常量。
    fn name(&self) -> Option<Cow<'static, str>> {
        None
    }

    fn contextual_name(&self, _context: &Context) -> Option<Cow<'static, str>> {
        None
    }

    fn low_cardinality_key_values(&self, _context: &Context) -> KeyValues {
        KeyValues::empty()
    }

    fn high_cardinality_key_values(&self, _context: &Context) -> KeyValues {
        KeyValues::empty()
    }

    fn supports_context(&self, context: &Context) -> bool;
}

/// 以共享指针形式注册/传递的 Convention。
pub type SharedConvention = Arc<dyn ObservationConvention>;

/// 决议胜出的 Convention 来源，按优先级从高到低排列。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConventionSource {
    /// 创建后通过 `Observation::observation_convention` 附加的埋点级覆盖。
    Instrumentation,
    /// 调用点在 `create_not_started_*` 中直接传入的自定义 Convention。
    Custom,
    /// Registry 上注册的全局 Convention。
    Global,
    /// 调用点提供的兜底默认 Convention。
    Default,
}

impl fmt::Display for ConventionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConventionSource::Instrumentation => "instrumentation",
            ConventionSource::Custom => "custom",
            ConventionSource::Global => "global",
            ConventionSource::Default => "default",
        })
    }
}

/// 按优先级排列的可选 Convention 来源，`start()` 时自上而下取第一个“存在且支持当前 Context”的策略。
///
/// # 逻辑解析（How）
/// - 优先级：埋点级覆盖 > 调用点自定义 > 全局（多个时按注册顺序）> 调用点默认；
/// - 仅有一个来源胜出，名称之间不做合并；
/// - 胜出者的标签合并进 Context：与调用点已写入的同名键冲突时以 Convention 的值为准，
///   调用点独有的键原样保留。
/// - 没有任何来源胜出时 Context 保持调用点写入的内容不变。
#[derive(Clone, Default)]
pub struct ConventionChain {
    instrumentation: Option<SharedConvention>,
    custom: Option<SharedConvention>,
    global: Vec<SharedConvention>,
    default: Option<SharedConvention>,
}

impl ConventionChain {
    pub(crate) fn new(
        custom: Option<SharedConvention>,
        global: Vec<SharedConvention>,
        default: Option<SharedConvention>,
    ) -> Self {
        Self {
            instrumentation: None,
            custom,
            global,
            default,
        }
    }

    pub(crate) fn set_instrumentation(&mut self, convention: SharedConvention) {
        self.instrumentation = Some(convention);
    }

    /// 选出胜出的策略及其来源，不修改 Context。
    pub fn select(&self, context: &Context) -> Option<(ConventionSource, &SharedConvention)> {
        let tiers = iter::once((ConventionSource::Instrumentation, self.instrumentation.as_ref()))
            .chain(iter::once((ConventionSource::Custom, self.custom.as_ref())))
            .chain(
                self.global
                    .iter()
                    .map(|convention| (ConventionSource::Global, Some(convention))),
            )
            .chain(iter::once((ConventionSource::Default, self.default.as_ref())));

        tiers
            .filter_map(|(source, convention)| convention.map(|convention| (source, convention)))
            .find(|(_, convention)| convention.supports_context(context))
    }

    /// 执行决议并把胜出者的结果写入 Context，返回胜出来源。
    pub fn apply(&self, context: &mut Context) -> Option<ConventionSource> {
        let (source, convention) = self.select(context)?;
        let convention = Arc::clone(convention);

        if let Some(name) = convention.name() {
            context.set_name(name);
        }
        if let Some(contextual_name) = convention.contextual_name(context) {
            context.set_contextual_name(contextual_name);
        }
        let low = convention.low_cardinality_key_values(context);
        let high = convention.high_cardinality_key_values(context);
        context
            .add_low_cardinality_key_values(&low)
            .add_high_cardinality_key_values(&high);
        Some(source)
    }

    pub fn is_empty(&self) -> bool {
        self.instrumentation.is_none()
            && self.custom.is_none()
            && self.global.is_empty()
            && self.default.is_none()
    }
}

impl fmt::Debug for ConventionChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConventionChain")
            .field("instrumentation", &self.instrumentation.is_some())
            .field("custom", &self.custom.is_some())
            .field("global", &self.global.len())
            .field("default", &self.default.is_some())
            .finish()
    }
}
