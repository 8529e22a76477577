//! 全局安装的契约测试。
//!
//! 全局 Subscriber 每个进程只能设置一次，因此本文件只包含一个测试函数，按顺序验证全部断言。

use spark_observation::Observation;
use spark_observation_tracing::{
    InstallConfig, InstallError, TracingHandlerConfig, install, install_with, is_installed,
    registry_with_tracing,
};
use tracing::Span;

#[test]
fn install_is_one_shot_and_observations_flow_through() {
    assert!(!is_installed());
    install_with(InstallConfig::default().with_service_name("install-test"))
        .expect("进程内首次安装应成功");
    assert!(is_installed());

    assert!(matches!(install(), Err(InstallError::AlreadyInstalled)));

    let registry = registry_with_tracing(TracingHandlerConfig::default());
    let parent = Observation::start_new("install.parent", &registry);
    assert!(Span::current().id().is_none());
    parent.scoped(|| {
        assert!(Span::current().id().is_some(), "作用域内进入父 Observation 的 Span");
        let child = Observation::start_new("install.child", &registry);
        assert!(
            child
                .with_context(|context| context.parent_observation())
                .is_some_and(|resolved| resolved.ptr_eq(&parent))
        );
        child.stop().expect("stop");
    });
    assert!(Span::current().id().is_none(), "作用域关闭后退出 Span");
    parent.stop().expect("stop");
}
