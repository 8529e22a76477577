//! Convention 决议优先级的契约测试。
//!
//! # 覆盖范围（What）
//! - 自定义 / 默认 / 全局三类来源的六种组合，以及埋点级覆盖压过全部来源；
//! - 胜出者的名称与上下文名称整体替换调用点写入的值，标签与调用点标签叠加（同名键以 Convention 为准）；
//! - 不支持当前 Context 的来源会被跳过。

use std::{borrow::Cow, sync::Arc};

use spark_observation::{
    Context, KeyValues, Observation, ObservationConvention, ObservationRegistry, SharedConvention,
    test_stubs::handlers::AcceptAllHandler,
};

/// 以标签区分来源的 Convention：名称为 `{label}.name`，并输出 `low={label}`、`{label}=present` 两个标签。
struct Labeled {
    label: &'static str,
    supported: bool,
}

impl ObservationConvention for Labeled {
    fn name(&self) -> Option<Cow<'static, str>> {
        Some(Cow::Owned(format!("{}.name", self.label)))
    }

    fn contextual_name(&self, _context: &Context) -> Option<Cow<'static, str>> {
        Some(Cow::Owned(format!("{}.contextualName", self.label)))
    }

    fn low_cardinality_key_values(&self, _context: &Context) -> KeyValues {
        KeyValues::of([("low", self.label), (self.label, "present")])
    }

    fn supports_context(&self, _context: &Context) -> bool {
        self.supported
    }
}

fn convention(label: &'static str) -> SharedConvention {
    Arc::new(Labeled {
        label,
        supported: true,
    })
}

fn unsupported(label: &'static str) -> SharedConvention {
    Arc::new(Labeled {
        label,
        supported: false,
    })
}

fn registry(global: bool) -> ObservationRegistry {
    let registry = ObservationRegistry::create();
    registry.config().add_handler(AcceptAllHandler);
    if global {
        registry.config().add_convention(Labeled {
            label: "global",
            supported: true,
        });
    }
    registry
}

/// 与调用点写法一致：先写入本地标签，再 start/stop。
fn run(observation: &Observation) -> (Option<String>, Option<String>, KeyValues) {
    observation
        .low_cardinality_key_value(("local", "present"))
        .low_cardinality_key_value(("low", "local"));
    observation.start().expect("start");
    observation.stop().expect("stop");
    observation.with_context(|context| {
        (
            context.name().map(str::to_owned),
            context.contextual_name().map(str::to_owned),
            context.low_cardinality_key_values().clone(),
        )
    })
}

fn expected(label: &'static str) -> (Option<String>, Option<String>, KeyValues) {
    (
        Some(format!("{label}.name")),
        Some(format!("{label}.contextualName")),
        KeyValues::of([("local", "present"), (label, "present"), ("low", label)]),
    )
}

#[test]
fn custom_and_default_without_global_resolves_to_custom() {
    let registry = registry(false);
    let observation = Observation::create_not_started_with_conventions(
        Some(convention("custom")),
        Some(convention("default")),
        Context::new,
        &registry,
    );
    assert_eq!(run(&observation), expected("custom"));
}

#[test]
fn custom_beats_global() {
    let registry = registry(true);
    let observation = Observation::create_not_started_with_conventions(
        Some(convention("custom")),
        Some(convention("default")),
        Context::new,
        &registry,
    );
    assert_eq!(run(&observation), expected("custom"));
}

#[test]
fn default_without_custom_or_global_resolves_to_default() {
    let registry = registry(false);
    let observation = Observation::create_not_started_with_conventions(
        None,
        Some(convention("default")),
        Context::new,
        &registry,
    );
    assert_eq!(run(&observation), expected("default"));
}

#[test]
fn global_beats_default_without_custom() {
    let registry = registry(true);
    let observation = Observation::create_not_started_with_conventions(
        None,
        Some(convention("default")),
        Context::new,
        &registry,
    );
    assert_eq!(run(&observation), expected("global"));
}

#[test]
fn custom_without_default_resolves_to_custom_with_or_without_global() {
    for global in [false, true] {
        let registry = registry(global);
        let observation =
            Observation::create_not_started_with_convention(convention("custom"), Context::new, &registry);
        assert_eq!(run(&observation), expected("custom"), "global = {global}");
    }
}

#[test]
fn no_convention_keeps_call_site_values() {
    let registry = registry(false);
    let observation = Observation::create_not_started("local.name", &registry);
    observation.contextual_name("local.contextualName");

    assert_eq!(
        run(&observation),
        (
            Some("local.name".to_owned()),
            Some("local.contextualName".to_owned()),
            KeyValues::of([("local", "present"), ("low", "local")]),
        )
    );
}

#[test]
fn global_overrides_call_site_name_when_present() {
    let registry = registry(true);
    let observation = Observation::create_not_started("local.name", &registry);
    observation.contextual_name("local.contextualName");

    assert_eq!(run(&observation), expected("global"));
}

#[test]
fn instrumentation_convention_beats_every_other_source() {
    let registry = registry(true);
    let observation = Observation::create_not_started_with_conventions(
        Some(convention("custom")),
        Some(convention("default")),
        Context::new,
        &registry,
    );
    observation.observation_convention(convention("instrumentation"));

    assert_eq!(run(&observation), expected("instrumentation"));
}

#[test]
fn unsupported_sources_fall_through_to_next_tier() {
    let registry = registry(true);
    let observation = Observation::create_not_started_with_conventions(
        Some(unsupported("custom")),
        Some(convention("default")),
        Context::new,
        &registry,
    );
    observation.observation_convention(unsupported("instrumentation"));

    assert_eq!(run(&observation), expected("global"));
}

#[test]
fn predicate_receives_convention_name_as_proposed_name() {
    let registry = registry(false);
    registry
        .config()
        .add_predicate(|name: &str, _: &Context| name != "custom.name");

    let rejected = Observation::create_not_started_with_convention(
        convention("custom"),
        Context::new,
        &registry,
    );
    let accepted = Observation::create_not_started_with_convention(
        convention("default"),
        Context::new,
        &registry,
    );

    assert!(rejected.is_noop());
    assert!(!accepted.is_noop());
}
