use std::{fmt, sync::Arc};

use crate::{context::Context, observation::Event};

/// Observation 生命周期事件的分发目标。
///
/// # 设计背景（Why）
/// - 调用点不关心度量方式；指标、追踪、日志等后端各自实现一个 Handler，挂到 Registry 上即可接收全部埋点。
/// - 通过 `supports_context` 在创建 Observation 时一次性筛选，使不相关的 Handler 在热路径上零开销。
///
/// # 逻辑解析（How）
/// - 每个回调都拿到 `&mut Context`，Handler 可以在 `on_start` 写入私有属性（计时样本、Span 等），
///   在 `on_stop` 取回并收尾；
/// - 除 `supports_context` 外所有回调都有空的默认实现，实现者只覆盖关心的阶段。
///
/// # 契约说明（What）
/// - **调用顺序**：同一 Observation 的全部 Handler 按注册顺序被通知，`on_stop` 也保持注册顺序；
/// - **重入限制**：回调执行期间所属 Observation 的 Context 处于写锁内，回调不得再调用该 Observation
///   的任何方法（包括 `with_context`、`open_scope`），否则会死锁；
/// - **失败策略**：回调 panic 不会被捕获，会沿调用栈展开；Scope 的释放基于 `Drop`，展开路径上依旧执行。
pub trait ObservationHandler: Send + Sync + 'static {
    fn on_start(&self, _context: &mut Context) {}

    fn on_error(&self, _context: &mut Context) {}

    fn on_event(&self, _event: &Event, _context: &mut Context) {}

    fn on_scope_opened(&self, _context: &mut Context) {}

    fn on_scope_closed(&self, _context: &mut Context) {}

    fn on_stop(&self, _context: &mut Context) {}

    /// 是否处理该 Context；仅在 Observation 创建时调用一次。
    fn supports_context(&self, context: &Context) -> bool;
}

/// 以共享指针形式注册的 Handler。
pub type SharedHandler = Arc<dyn ObservationHandler>;

/// 只把回调转发给第一个支持当前 Context 的子 Handler。
///
/// 适用于“同类后端择一”的场景，例如为特定 Context 注册专用的计时 Handler，其余情况回落到通用实现。
pub struct FirstMatchingCompositeHandler {
    handlers: Vec<SharedHandler>,
}

impl FirstMatchingCompositeHandler {
    pub fn new(handlers: impl IntoIterator<Item = SharedHandler>) -> Self {
        Self {
            handlers: handlers.into_iter().collect(),
        }
    }

    pub fn handlers(&self) -> &[SharedHandler] {
        &self.handlers
    }

    fn first_supporting(&self, context: &Context) -> Option<&SharedHandler> {
        self.handlers
            .iter()
            .find(|handler| handler.supports_context(context))
    }
}

impl ObservationHandler for FirstMatchingCompositeHandler {
    fn on_start(&self, context: &mut Context) {
        if let Some(handler) = self.first_supporting(context) {
            handler.on_start(context);
        }
    }

    fn on_error(&self, context: &mut Context) {
        if let Some(handler) = self.first_supporting(context) {
            handler.on_error(context);
        }
    }

    fn on_event(&self, event: &Event, context: &mut Context) {
        if let Some(handler) = self.first_supporting(context) {
            handler.on_event(event, context);
        }
    }

    fn on_scope_opened(&self, context: &mut Context) {
        if let Some(handler) = self.first_supporting(context) {
            handler.on_scope_opened(context);
        }
    }

    fn on_scope_closed(&self, context: &mut Context) {
        if let Some(handler) = self.first_supporting(context) {
            handler.on_scope_closed(context);
        }
    }

    fn on_stop(&self, context: &mut Context) {
        if let Some(handler) = self.first_supporting(context) {
            handler.on_stop(context);
        }
    }

    fn supports_context(&self, context: &Context) -> bool {
        self.first_supporting(context).is_some()
    }
}

impl fmt::Debug for FirstMatchingCompositeHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FirstMatchingCompositeHandler")
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

/// 把回调转发给全部支持当前 Context 的子 Handler，顺序与构造时一致。
pub struct AllMatchingCompositeHandler {
    handlers: Vec<SharedHandler>,
}

impl AllMatchingCompositeHandler {
    pub fn new(handlers: impl IntoIterator<Item = SharedHandler>) -> Self {
        Self {
            handlers: handlers.into_iter().collect(),
        }
    }

    pub fn handlers(&self) -> &[SharedHandler] {
        &self.handlers
    }

    fn for_each_supporting(
        &self,
        context: &mut Context,
        mut f: impl FnMut(&SharedHandler, &mut Context),
    ) {
        for handler in &self.handlers {
            if handler.supports_context(context) {
                f(handler, context);
            }
        }
    }
}

impl ObservationHandler for AllMatchingCompositeHandler {
    fn on_start(&self, context: &mut Context) {
        self.for_each_supporting(context, |handler, context| handler.on_start(context));
    }

    fn on_error(&self, context: &mut Context) {
        self.for_each_supporting(context, |handler, context| handler.on_error(context));
    }

    fn on_event(&self, event: &Event, context: &mut Context) {
        self.for_each_supporting(context, |handler, context| handler.on_event(event, context));
    }

    fn on_scope_opened(&self, context: &mut Context) {
        self.for_each_supporting(context, |handler, context| {
            handler.on_scope_opened(context)
        });
    }

    fn on_scope_closed(&self, context: &mut Context) {
        self.for_each_supporting(context, |handler, context| {
            handler.on_scope_closed(context)
        });
    }

    fn on_stop(&self, context: &mut Context) {
        self.for_each_supporting(context, |handler, context| handler.on_stop(context));
    }

    fn supports_context(&self, context: &Context) -> bool {
        self.handlers
            .iter()
            .any(|handler| handler.supports_context(context))
    }
}

impl fmt::Debug for AllMatchingCompositeHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AllMatchingCompositeHandler")
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_stubs::handlers::{Callback, CallLog, RecordingHandler};

    struct Rejecting;

    impl ObservationHandler for Rejecting {
        fn on_start(&self, _context: &mut Context) {
            unreachable!("不支持的 Handler 不应收到回调");
        }

        fn supports_context(&self, _context: &Context) -> bool {
            false
        }
    }

    #[test]
    fn first_matching_only_notifies_first_supporting_child() {
        let log = CallLog::default();
        let composite = FirstMatchingCompositeHandler::new([
            Arc::new(Rejecting) as SharedHandler,
            Arc::new(RecordingHandler::new("first", &log)) as SharedHandler,
            Arc::new(RecordingHandler::new("second", &log)) as SharedHandler,
        ]);
        let mut context = Context::new();

        assert!(composite.supports_context(&context));
        composite.on_start(&mut context);
        composite.on_stop(&mut context);

        assert_eq!(
            log.callbacks(),
            [("first".to_owned(), Callback::Start), ("first".to_owned(), Callback::Stop)]
        );
    }

    #[test]
    fn all_matching_notifies_every_supporting_child_in_order() {
        let log = CallLog::default();
        let composite = AllMatchingCompositeHandler::new([
            Arc::new(RecordingHandler::new("a", &log)) as SharedHandler,
            Arc::new(Rejecting) as SharedHandler,
            Arc::new(RecordingHandler::new("b", &log)) as SharedHandler,
        ]);
        let mut context = Context::new();

        composite.on_start(&mut context);

        assert_eq!(
            log.callbacks(),
            [("a".to_owned(), Callback::Start), ("b".to_owned(), Callback::Start)]
        );
    }

    #[test]
    fn composites_without_supporting_children_are_unsupported() {
        let context = Context::new();
        let first = FirstMatchingCompositeHandler::new([Arc::new(Rejecting) as SharedHandler]);
        assert!(!first.supports_context(&context));
        assert!(!AllMatchingCompositeHandler::new(Vec::new()).supports_context(&context));
    }
}
