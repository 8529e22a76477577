use std::{
    cell::RefCell,
    fmt,
    marker::PhantomData,
    sync::atomic::{AtomicU64, Ordering},
};

use tracing::{trace, warn};

use crate::observation::Observation;

thread_local! {
    static FRAMES: RefCell<Vec<Frame>> = const { RefCell::new(Vec::new()) };
}

/// 进程内唯一的作用域令牌，经由作用域捕获的父级链接据此绑定到具体的那一次 Scope。
static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

/// 线程作用域栈上的一帧。
struct Frame {
    token: u64,
    registry_id: u64,
    observation: Observation,
}

/// “该 Observation 是当前线程正在进行的操作”的守卫。
///
/// # 设计背景（Why）
/// - 嵌套调用链需要隐式获知父操作，又不能把状态放进全局变量；每个线程维护独立的 LIFO 栈，
///   打开时压栈、释放时出栈，天然恢复先前的当前 Observation。
/// - 释放基于 `Drop`，无论正常返回、`?` 提前返回还是 panic 展开都恰好执行一次。
///
/// # 逻辑解析（How）
/// - 每个帧记录所属 Registry 的标识，因此同一线程上多个 Registry 的作用域互不干扰；
/// - 打开/关闭时分别通知 Observation 的 `on_scope_opened`/`on_scope_closed`；
/// - NOOP 的作用域不压栈、不通知任何 Handler。
///
/// # 契约说明（What）
/// - **线程亲和**：`Scope` 是 `!Send`，必须在打开它的线程上释放；跨线程传播需要把
///   [`Observation`] 句柄带到目标线程后重新打开作用域。
/// - **释放顺序**：应严格按打开的逆序释放；乱序释放时仍会移除对应帧，但会记录 `warn` 日志，
///   此时“先前的当前 Observation”以栈的实际内容为准。
#[must_use = "Scope 在析构时立即关闭，需要绑定到变量以覆盖受保护的区域"]
pub struct Scope {
    observation: Observation,
    previous: Option<Observation>,
    token: Option<u64>,
    _not_send: PhantomData<*const ()>,
}

impl Scope {
    pub(crate) fn open(observation: Observation) -> Self {
        let Some(core) = observation.core() else {
            return Self {
                observation,
                previous: None,
                token: None,
                _not_send: PhantomData,
            };
        };

        let registry_id = core.registry_id();
        let previous = current_for(registry_id);
        let token = NEXT_TOKEN.fetch_add(1, Ordering::Relaxed);
        FRAMES.with(|frames| {
            frames.borrow_mut().push(Frame {
                token,
                registry_id,
                observation: observation.clone(),
            })
        });
        core.scope_opened(token);
        trace!(observation.id = core.id(), scope.token = token, "scope opened");

        Self {
            observation,
            previous,
            token: Some(token),
            _not_send: PhantomData,
        }
    }

    /// 本作用域设为当前的 Observation。
    pub fn observation(&self) -> &Observation {
        &self.observation
    }

    /// 打开本作用域之前，同一 Registry 在本线程上的当前 Observation。
    pub fn previous(&self) -> Option<&Observation> {
        self.previous.as_ref()
    }

    pub fn is_noop(&self) -> bool {
        self.token.is_none()
    }
}

impl Drop for Scope {
    fn drop(&mut self) {
        let Some(token) = self.token.take() else {
            return;
        };

        // 线程退出阶段 thread_local 可能已销毁，此时栈已不存在，无需出栈。
        let removed = FRAMES
            .try_with(|frames| {
                let mut frames = frames.borrow_mut();
                let index = frames.iter().rposition(|frame| frame.token == token)?;
                let out_of_order = index + 1 != frames.len();
                Some((frames.remove(index), out_of_order))
            })
            .ok()
            .flatten();

        let id = self.observation.id();
        match removed {
            Some((frame, true)) => {
                warn!(
                    observation.id = id,
                    scope.token = token,
                    "scope 未按打开的逆序释放"
                );
                drop(frame);
            }
            Some((frame, false)) => drop(frame),
            None => {}
        }

        if let Some(core) = self.observation.core() {
            core.scope_closed(token);
        }
        trace!(observation.id = id, scope.token = token, "scope closed");
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("observation", &self.observation.id())
            .field("previous", &self.previous.as_ref().and_then(Observation::id))
            .field("token", &self.token)
            .finish()
    }
}

/// 调用线程上属于指定 Registry 的最内层 Observation。
pub(crate) fn current_for(registry_id: u64) -> Option<Observation> {
    current_frame_for(registry_id).map(|(observation, _)| observation)
}

/// 同 [`current_for`]，并附带该帧的作用域令牌。
pub(crate) fn current_frame_for(registry_id: u64) -> Option<(Observation, u64)> {
    FRAMES
        .try_with(|frames| {
            frames
                .borrow()
                .iter()
                .rev()
                .find(|frame| frame.registry_id == registry_id)
                .map(|frame| (frame.observation.clone(), frame.token))
        })
        .ok()
        .flatten()
}

pub(crate) fn depth_for(registry_id: u64) -> usize {
    FRAMES
        .try_with(|frames| {
            frames
                .borrow()
                .iter()
                .filter(|frame| frame.registry_id == registry_id)
                .count()
        })
        .unwrap_or(0)
}

/// 调用线程上最内层的 Observation，不区分 Registry。
pub fn current_observation() -> Option<Observation> {
    FRAMES
        .try_with(|frames| {
            frames
                .borrow()
                .last()
                .map(|frame| frame.observation.clone())
        })
        .ok()
        .flatten()
}

/// 调用线程上已打开的作用域总层数。
pub fn scope_depth() -> usize {
    FRAMES
        .try_with(|frames| frames.borrow().len())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use tracing_test::traced_test;

    use super::*;
    use crate::{
        registry::ObservationRegistry,
        test_stubs::handlers::{AcceptAllHandler, Callback, CallLog, RecordingHandler},
    };

    fn registry() -> ObservationRegistry {
        let registry = ObservationRegistry::create();
        registry.config().add_handler(AcceptAllHandler);
        registry
    }

    #[test]
    fn nested_scopes_restore_previous_current() {
        let registry = registry();
        let outer = Observation::start_new("outer", &registry);
        let inner = Observation::start_new("inner", &registry);

        assert!(registry.current_observation().is_none());
        {
            let outer_scope = outer.open_scope();
            assert!(outer_scope.previous().is_none());
            {
                let inner_scope = inner.open_scope();
                assert!(inner_scope.previous().is_some_and(|previous| previous.ptr_eq(&outer)));
                assert!(registry.current_observation().is_some_and(|current| current.ptr_eq(&inner)));
                assert_eq!(registry.current_scope_depth(), 2);
            }
            assert!(registry.current_observation().is_some_and(|current| current.ptr_eq(&outer)));
        }
        assert!(registry.current_observation().is_none());
        assert_eq!(scope_depth(), 0);
    }

    #[test]
    fn scopes_of_different_registries_do_not_interfere() {
        let first = registry();
        let second = registry();
        let a = Observation::start_new("a", &first);
        let b = Observation::start_new("b", &second);

        let _a_scope = a.open_scope();
        let _b_scope = b.open_scope();

        assert!(first.current_observation().is_some_and(|current| current.ptr_eq(&a)));
        assert!(second.current_observation().is_some_and(|current| current.ptr_eq(&b)));
        assert!(current_observation().is_some_and(|current| current.ptr_eq(&b)));
    }

    #[test]
    fn noop_scope_leaves_stack_untouched() {
        let scope = Observation::NOOP.open_scope();
        assert!(scope.is_noop());
        assert_eq!(scope_depth(), 0);
        assert!(current_observation().is_none());
    }

    #[test]
    fn scope_callbacks_are_dispatched() {
        let log = CallLog::default();
        let registry = ObservationRegistry::create();
        registry
            .config()
            .add_handler(RecordingHandler::new("scope", &log));
        let observation = Observation::create_not_started("scoped", &registry);

        observation.scoped(|| ());

        assert_eq!(
            log.callbacks(),
            [
                ("scope".to_owned(), Callback::ScopeOpened),
                ("scope".to_owned(), Callback::ScopeClosed),
            ]
        );
    }

    #[test]
    #[traced_test]
    fn out_of_order_release_is_logged_and_repaired() {
        let registry = registry();
        let outer = Observation::start_new("outer", &registry);
        let inner = Observation::start_new("inner", &registry);

        let outer_scope = outer.open_scope();
        let inner_scope = inner.open_scope();
        drop(outer_scope);

        assert!(logs_contain("scope 未按打开的逆序释放"));
        assert!(registry.current_observation().is_some_and(|current| current.ptr_eq(&inner)));
        drop(inner_scope);
        assert!(registry.current_observation().is_none());
    }
}
