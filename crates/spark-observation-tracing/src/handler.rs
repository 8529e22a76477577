use spark_observation::{Context, Event, ObservationHandler, ObservationRegistry};
use tracing::{Level, Span, field};

/// Span 在 Context 属性仓库中的键名。
pub const SPAN_ATTRIBUTE: &str = "spark.observation.tracing.span";

/// 按运行期给定的级别创建 `observation` Span。
///
/// `tracing` 的宏要求级别为常量，这里把五个级别展开为 match 分支。
macro_rules! observation_span {
    ($level:expr, $parent:expr, $($fields:tt)*) => {
        match $level {
            Level::ERROR => tracing::span!(parent: $parent, Level::ERROR, "observation", $($fields)*),
            Level::WARN => tracing::span!(parent: $parent, Level::WARN, "observation", $($fields)*),
            Level::INFO => tracing::span!(parent: $parent, Level::INFO, "observation", $($fields)*),
            Level::DEBUG => tracing::span!(parent: $parent, Level::DEBUG, "observation", $($fields)*),
            _ => tracing::span!(parent: $parent, Level::TRACE, "observation", $($fields)*),
        }
    };
}

/// 与 [`observation_span!`] 相同的展开方式，用于生命周期事件。
macro_rules! lifecycle_event {
    ($level:expr, $parent:expr, $($fields:tt)*) => {
        match $level {
            Level::ERROR => tracing::event!(parent: $parent, Level::ERROR, $($fields)*),
            Level::WARN => tracing::event!(parent: $parent, Level::WARN, $($fields)*),
            Level::INFO => tracing::event!(parent: $parent, Level::INFO, $($fields)*),
            Level::DEBUG => tracing::event!(parent: $parent, Level::DEBUG, $($fields)*),
            _ => tracing::event!(parent: $parent, Level::TRACE, $($fields)*),
        }
    };
}

/// [`TracingObservationHandler`] 的配置。
///
/// - `level`：Span 与生命周期事件使用的级别，默认 `INFO`；
/// - `include_high_cardinality`：是否把高基数标签写入 Span 字段，默认 `true`。
///   高基数标签可能包含请求 ID 等敏感或海量取值，日志落盘前可按需关闭。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TracingHandlerConfig {
    pub level: Level,
    pub include_high_cardinality: bool,
}

impl Default for TracingHandlerConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            include_high_cardinality: true,
        }
    }
}

impl TracingHandlerConfig {
    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn with_high_cardinality(mut self, include: bool) -> Self {
        self.include_high_cardinality = include;
        self
    }
}

/// Span 及其在当前进程内被进入的次数。
struct SpanSlot {
    span: Span,
    entered: usize,
}

/// 把 Observation 生命周期桥接为 `tracing` Span 与事件的 Handler。
///
/// # 设计背景（Why）
/// - `tracing` 是 spark 全家桶统一的日志/追踪出口；配合 `tracing-opentelemetry`，Observation 即可直接
///   生成 OpenTelemetry Span，而核心 crate 无需依赖任何后端。
///
/// # 逻辑解析（How）
/// 1. `on_start` 创建名为 `observation` 的 Span，`otel.name` 取 Observation 名称；
///    父 Span 优先取父 Observation 上保存的 Span，否则沿用调用线程的当前 Span；
/// 2. Span 存入 Context 属性 [`SPAN_ATTRIBUTE`]，作用域打开/关闭时对应地进入/退出该 Span 并发出事件；
/// 3. `on_error` 写入 `otel.status_code = "ERROR"` 与错误描述，并发出 `WARN` 事件；
/// 4. `on_stop` 回写最终标签、平衡未退出的进入次数后释放 Span。
///
/// # 契约说明（What）
/// - 支持任意 Context；
/// - 作用域在 `start()` 之前打开时不会进入 Span（此时 Span 尚不存在）。
#[derive(Clone, Debug, Default)]
pub struct TracingObservationHandler {
    config: TracingHandlerConfig,
}

impl TracingObservationHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: TracingHandlerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TracingHandlerConfig {
        &self.config
    }

    /// 在 Registry 上注册一个使用给定配置的桥接 Handler。
    pub fn attach(registry: &ObservationRegistry, config: TracingHandlerConfig) {
        registry.config().add_handler(Self::with_config(config));
    }

    fn record_key_values(&self, span: &Span, context: &Context) {
        span.record(
            "observation.low_cardinality",
            field::display(context.low_cardinality_key_values()),
        );
        if self.config.include_high_cardinality {
            span.record(
                "observation.high_cardinality",
                field::display(context.high_cardinality_key_values()),
            );
        }
    }
}

fn observation_name(context: &Context) -> &str {
    context.name().unwrap_or("unnamed")
}

fn parent_span(context: &Context) -> Option<Span> {
    let parent = context.parent_observation()?;
    parent.with_context(|parent| {
        parent
            .get::<SpanSlot>(SPAN_ATTRIBUTE)
            .map(|slot| slot.span.clone())
    })
}

impl ObservationHandler for TracingObservationHandler {
    fn on_start(&self, context: &mut Context) {
        let name = observation_name(context).to_owned();
        let contextual_name = context.contextual_name().unwrap_or(&name).to_owned();
        let parent = parent_span(context)
            .and_then(|span| span.id())
            .or_else(|| Span::current().id());

        let span = observation_span!(
            self.config.level,
            parent,
            otel.name = %contextual_name,
            otel.status_code = field::Empty,
            observation.name = %name,
            observation.low_cardinality = field::Empty,
            observation.high_cardinality = field::Empty,
            observation.error = field::Empty
        );
        self.record_key_values(&span, context);
        lifecycle_event!(
            self.config.level,
            &span,
            observation.name = %name,
            "observation started"
        );
        context.put(SPAN_ATTRIBUTE, SpanSlot { span, entered: 0 });
    }

    fn on_error(&self, context: &mut Context) {
        let name = observation_name(context).to_owned();
        let message = context
            .error()
            .map(|error| error.message().to_owned())
            .unwrap_or_default();
        let Some(slot) = context.get::<SpanSlot>(SPAN_ATTRIBUTE) else {
            tracing::warn!(observation.name = %name, observation.error = %message, "observation error");
            return;
        };
        slot.span.record("otel.status_code", "ERROR");
        slot.span.record("observation.error", field::display(&message));
        tracing::warn!(
            parent: &slot.span,
            observation.name = %name,
            observation.error = %message,
            "observation error"
        );
    }

    fn on_event(&self, event: &Event, context: &mut Context) {
        let name = observation_name(context).to_owned();
        let span = context
            .get::<SpanSlot>(SPAN_ATTRIBUTE)
            .map(|slot| slot.span.clone())
            .unwrap_or_else(Span::current);
        lifecycle_event!(
            self.config.level,
            &span,
            observation.name = %name,
            observation.event = %event.name(),
            observation.event.contextual_name = %event.contextual_name(),
            "observation event"
        );
    }

    fn on_scope_opened(&self, context: &mut Context) {
        let name = observation_name(context).to_owned();
        let span = match context.get_mut::<SpanSlot>(SPAN_ATTRIBUTE) {
            Some(slot) => {
                slot.span
                    .with_subscriber(|(id, dispatch)| dispatch.enter(id));
                slot.entered += 1;
                slot.span.clone()
            }
            None => Span::current(),
        };
        lifecycle_event!(
            self.config.level,
            &span,
            observation.name = %name,
            "observation scope opened"
        );
    }

    fn on_scope_closed(&self, context: &mut Context) {
        let name = observation_name(context).to_owned();
        let span = match context.get_mut::<SpanSlot>(SPAN_ATTRIBUTE) {
            Some(slot) => {
                if slot.entered > 0 {
                    slot.span.with_subscriber(|(id, dispatch)| dispatch.exit(id));
                    slot.entered -= 1;
                }
                slot.span.clone()
            }
            None => Span::current(),
        };
        lifecycle_event!(
            self.config.level,
            &span,
            observation.name = %name,
            "observation scope closed"
        );
    }

    fn on_stop(&self, context: &mut Context) {
        let Some(slot) = context.remove::<SpanSlot>(SPAN_ATTRIBUTE) else {
            return;
        };
        self.record_key_values(&slot.span, context);
        for _ in 0..slot.entered {
            slot.span.with_subscriber(|(id, dispatch)| dispatch.exit(id));
        }
        lifecycle_event!(
            self.config.level,
            &slot.span,
            observation.name = %observation_name(context),
            "observation stopped"
        );
    }

    fn supports_context(&self, _context: &Context) -> bool {
        true
    }
}
