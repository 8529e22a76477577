#![doc = "spark-observation-tracing: 把 Observation 生命周期桥接到 `tracing` 与 OpenTelemetry。"]
#![doc = ""]
#![doc = "- [`TracingObservationHandler`]：为每个 Observation 创建 `observation` Span，作用域打开时进入、`stop()` 时关闭；"]
#![doc = "- [`install`]/[`install_with`]：一次性装配 `EnvFilter + fmt + OpenTelemetry` 全局 Subscriber。"]
#![doc = ""]
#![doc = "```rust,no_run"]
#![doc = "use spark_observation::Observation;"]
#![doc = "use spark_observation_tracing::{TracingHandlerConfig, install, registry_with_tracing};"]
#![doc = ""]
#![doc = "install().expect(\"进程内首次安装\");"]
#![doc = "let registry = registry_with_tracing(TracingHandlerConfig::default());"]
#![doc = "let observation = Observation::start_new(\"orders.checkout\", &registry);"]
#![doc = "observation.scoped(|| tracing::info!(\"inside observation span\"));"]
#![doc = "observation.stop().expect(\"stop 一次\");"]
#![doc = "```"]
#![deny(unsafe_code)]

mod handler;
mod install;

pub use handler::{SPAN_ATTRIBUTE, TracingHandlerConfig, TracingObservationHandler};
pub use install::{
    InstallConfig, InstallError, install, install_with, is_installed, registry_with_tracing,
};
