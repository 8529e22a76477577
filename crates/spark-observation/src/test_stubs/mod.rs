//! Handler 相关的测试桩集合。
//!
//! # 设计定位（Why）
//! - 单元测试、集成测试与文档示例都需要“至少一个 Handler”才能拿到非 NOOP 的 Observation；
//!   过去各测试文件重复定义 `struct AlwaysHandler;`，接口调整时容易漏改。
//! - 断言回调顺序需要一个记录型实现，集中维护可以保证各测试对“回调日志”的格式理解一致。
//!
//! # 使用方式（How）
//! - `use spark_observation::test_stubs::handlers::*;` 引入全部桩类型；
//! - [`handlers::AcceptAllHandler`] 支持任意 Context 且不做任何事；
//! - [`handlers::RecordingHandler`] 把每次回调连同标签写入共享的 [`handlers::CallLog`]。
//!
//! # 风险与权衡（Trade-offs）
//! - 模块公开为稳定测试 API，生产代码不应依赖这些类型。

pub mod handlers {
    //! 满足 [`ObservationHandler`] 契约的最小实现。

    use std::sync::Arc;

    use parking_lot::Mutex;

    use crate::{context::Context, handler::ObservationHandler, observation::Event};

    /// 支持任意 Context、所有回调均为空操作的 Handler。
    #[derive(Clone, Copy, Debug, Default)]
    pub struct AcceptAllHandler;

    impl ObservationHandler for AcceptAllHandler {
        fn supports_context(&self, _context: &Context) -> bool {
            true
        }
    }

    /// 被记录的回调种类。
    #[derive(Clone, Debug, PartialEq, Eq)]
    pub enum Callback {
        Start,
        Error,
        /// 携带事件名称。
        Event(String),
        ScopeOpened,
        ScopeClosed,
        Stop,
    }

    /// 多个 [`RecordingHandler`] 共享的回调日志，按发生顺序追加。
    #[derive(Clone, Debug, Default)]
    pub struct CallLog {
        entries: Arc<Mutex<Vec<(String, Callback)>>>,
    }

    impl CallLog {
        /// 已记录回调的快照。
        pub fn callbacks(&self) -> Vec<(String, Callback)> {
            self.entries.lock().clone()
        }

        pub fn clear(&self) {
            self.entries.lock().clear();
        }

        fn push(&self, label: &str, callback: Callback) {
            self.entries.lock().push((label.to_owned(), callback));
        }
    }

    /// 把每次回调写入 [`CallLog`] 的 Handler。
    ///
    /// 默认支持任意 Context；通过 [`RecordingHandler::supporting`] 可以限定只处理满足条件的 Context。
    pub struct RecordingHandler {
        label: String,
        log: CallLog,
        supports: Box<dyn Fn(&Context) -> bool + Send + Sync>,
    }

    impl RecordingHandler {
        pub fn new(label: impl Into<String>, log: &CallLog) -> Self {
            Self {
                label: label.into(),
                log: log.clone(),
                supports: Box::new(|_: &Context| true),
            }
        }

        pub fn supporting(
            mut self,
            supports: impl Fn(&Context) -> bool + Send + Sync + 'static,
        ) -> Self {
            self.supports = Box::new(supports);
            self
        }
    }

    impl ObservationHandler for RecordingHandler {
        fn on_start(&self, _context: &mut Context) {
            self.log.push(&self.label, Callback::Start);
        }

        fn on_error(&self, _context: &mut Context) {
            self.log.push(&self.label, Callback::Error);
        }

        fn on_event(&self, event: &Event, _context: &mut Context) {
            self.log
                .push(&self.label, Callback::Event(event.name().to_owned()));
        }

        fn on_scope_opened(&self, _context: &mut Context) {
            self.log.push(&self.label, Callback::ScopeOpened);
        }

        fn on_scope_closed(&self, _context: &mut Context) {
            self.log.push(&self.label, Callback::ScopeClosed);
        }

        fn on_stop(&self, _context: &mut Context) {
            self.log.push(&self.label, Callback::Stop);
        }

        fn supports_context(&self, context: &Context) -> bool {
            (self.supports)(context)
        }
    }
}
