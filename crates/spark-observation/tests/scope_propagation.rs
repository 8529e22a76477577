//! 作用域传播与父子关系的契约测试。
//!
//! # 覆盖范围（What）
//! - 在父作用域内创建并 observe 的子 Observation 能查到父级，捕获时的那次作用域关闭或子级 stop 后查不到；
//! - 显式声明的父级不受作用域影响；
//! - 每个线程拥有独立的作用域栈，跨线程必须显式携带句柄后重新打开作用域；
//! - panic 展开时作用域依旧被释放。

use std::{panic, sync::mpsc, thread};

use spark_observation::{
    Observation, ObservationRegistry, scope, test_stubs::handlers::AcceptAllHandler,
};

fn registry() -> ObservationRegistry {
    let registry = ObservationRegistry::create();
    registry.config().add_handler(AcceptAllHandler);
    registry
}

fn parent_of(observation: &Observation) -> Option<Observation> {
    observation.with_context(|context| context.parent_observation())
}

#[test]
fn scoped_parent_is_visible_only_while_its_scope_is_open() {
    let registry = registry();
    let parent = Observation::start_new("parent", &registry);
    let child = Observation::create_not_started("child", &registry);

    parent.scoped(|| {
        assert!(parent_of(&child).is_none(), "作用域外创建的子级没有父级");

        let inner = Observation::create_not_started("inner", &registry);
        inner
            .observe(|| {
                let resolved = parent_of(&inner).expect("父作用域打开期间应能查到父级");
                assert!(resolved.ptr_eq(&parent));
            })
            .expect("observe");
        assert!(parent_of(&inner).is_none(), "子级 stop 后解除作用域父级");
    });
    parent.stop().expect("stop");
}

#[test]
fn scoped_parent_disappears_when_parent_scope_closes() {
    let registry = registry();
    let parent = Observation::start_new("parent", &registry);

    let child = parent.scoped(|| Observation::start_new("child", &registry));

    assert!(parent_of(&child).is_none());
    {
        let _scope = parent.open_scope();
        assert!(
            parent_of(&child).is_none(),
            "链接绑定捕获时的那次作用域，父级重新打开作用域不会恢复"
        );
    }
    child.stop().expect("stop");
    parent.stop().expect("stop");
}

#[test]
fn scope_held_on_another_thread_does_not_keep_scoped_parent_alive() {
    let registry = registry();
    let parent = Observation::start_new("parent", &registry);
    let (opened_tx, opened_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();

    let holder = {
        let parent = parent.clone();
        thread::spawn(move || {
            let _scope = parent.open_scope();
            opened_tx.send(()).expect("主线程仍在等待");
            let _ = release_rx.recv();
        })
    };
    opened_rx.recv().expect("持有线程已打开作用域");

    let child = parent.scoped(|| {
        let child = Observation::start_new("child", &registry);
        assert!(parent_of(&child).is_some_and(|resolved| resolved.ptr_eq(&parent)));
        child
    });
    assert!(
        parent_of(&child).is_none(),
        "捕获链接的作用域已关闭，其他线程上的作用域不应让父级继续可见"
    );

    release_tx.send(()).expect("持有线程仍在运行");
    holder.join().expect("持有线程不应 panic");
    child.stop().expect("stop");
    parent.stop().expect("stop");
}

#[test]
fn explicit_parent_outlives_scopes_and_stops() {
    let registry = registry();
    let parent = Observation::start_new("parent", &registry);
    let child = Observation::create_not_started("child", &registry);
    child.parent_observation(&parent);
    child.start().expect("start");

    parent.stop().expect("stop");
    child.stop().expect("stop");

    assert!(parent_of(&child).is_some_and(|resolved| resolved.ptr_eq(&parent)));
}

#[test]
fn explicit_parent_is_weak() {
    let registry = registry();
    let child = Observation::create_not_started("child", &registry);
    {
        let parent = Observation::start_new("parent", &registry);
        child.parent_observation(&parent);
        parent.stop().expect("stop");
    }
    assert!(parent_of(&child).is_none(), "父级被释放后查找返回 None");
}

#[test]
fn nested_scoped_calls_track_current_observation() {
    let registry = registry();
    let outer = Observation::start_new("outer", &registry);
    let inner = Observation::start_new("inner", &registry);

    outer.scoped(|| {
        inner.scoped(|| {
            assert!(
                registry
                    .current_observation()
                    .is_some_and(|current| current.ptr_eq(&inner))
            );
            assert_eq!(registry.current_scope_depth(), 2);
        });
        assert!(
            registry
                .current_observation()
                .is_some_and(|current| current.ptr_eq(&outer))
        );
    });
    assert!(registry.current_observation().is_none());
}

#[test]
fn threads_do_not_share_current_observation() {
    let registry = registry();
    let observation = Observation::start_new("cross.thread", &registry);

    observation.scoped(|| {
        let worker_registry = registry.clone();
        let carried = observation.clone();
        let (implicit, explicit) = thread::spawn(move || {
            let implicit = worker_registry.current_observation().is_some();
            let explicit = carried.scoped(|| {
                worker_registry
                    .current_observation()
                    .is_some_and(|current| current.ptr_eq(&carried))
            });
            (implicit, explicit)
        })
        .join()
        .expect("worker 线程不应 panic");

        assert!(!implicit, "作用域不会隐式传播到其他线程");
        assert!(explicit, "携带句柄后可在目标线程重新打开作用域");
    });
    observation.stop().expect("stop");
}

#[test]
fn scope_is_released_when_body_panics() {
    let registry = registry();
    let observation = Observation::start_new("panics", &registry);

    let outcome = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        observation.scoped(|| panic!("boom"));
    }));

    assert!(outcome.is_err());
    assert_eq!(scope::scope_depth(), 0);
    assert!(registry.current_observation().is_none());
}

#[test]
fn noop_scoped_does_not_change_current() {
    let registry = registry();
    let real = Observation::start_new("real", &registry);

    real.scoped(|| {
        Observation::NOOP.scoped(|| {
            assert!(
                registry
                    .current_observation()
                    .is_some_and(|current| current.ptr_eq(&real))
            );
        });
    });
}
