use std::{borrow::Cow, sync::OnceLock};

use opentelemetry::{KeyValue, global, trace::TracerProvider as _};
use opentelemetry_sdk::{
    Resource,
    trace::{self, TracerProvider},
};
use spark_observation::ObservationRegistry;
use tracing::dispatcher;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt};

use crate::handler::{TracingHandlerConfig, TracingObservationHandler};

/// 安装状态的全局缓存，确保 `install` 仅执行一次。
static INSTALL_STATE: OnceLock<InstallState> = OnceLock::new();

/// 安装过程可能出现的错误。
///
/// - `AlreadyInstalled`：`install`/`install_with` 被重复调用；
/// - `SubscriberAlreadySet`：外部已提前设置全局 `tracing` Subscriber；
/// - `SetGlobalSubscriber`：设置全局 Subscriber 时的底层错误。
#[derive(Debug, thiserror::Error)]
pub enum InstallError {
    #[error("spark-observation-tracing 已完成安装，禁止重复调用 install")]
    AlreadyInstalled,
    #[error("全局 tracing Subscriber 已存在，spark-observation-tracing 无法覆盖")]
    SubscriberAlreadySet,
    #[error("设置 tracing 全局 Subscriber 失败: {0}")]
    SetGlobalSubscriber(#[from] tracing::subscriber::SetGlobalDefaultError),
}

/// [`install_with`] 的配置。
///
/// - `default_filter`：`RUST_LOG` 未设置或无法解析时使用的过滤指令，默认 `info`；
/// - `tracer_name`：OpenTelemetry Tracer 的名称，默认 `spark.observation`；
/// - `service_name`：写入 Resource 的 `service.name`，缺省时使用 SDK 默认值。
#[derive(Clone, Debug)]
pub struct InstallConfig {
    pub default_filter: Cow<'static, str>,
    pub tracer_name: Cow<'static, str>,
    pub service_name: Option<Cow<'static, str>>,
}

impl Default for InstallConfig {
    fn default() -> Self {
        Self {
            default_filter: Cow::Borrowed("info"),
            tracer_name: Cow::Borrowed("spark.observation"),
            service_name: None,
        }
    }
}

impl InstallConfig {
    pub fn with_default_filter(mut self, filter: impl Into<Cow<'static, str>>) -> Self {
        self.default_filter = filter.into();
        self
    }

    pub fn with_service_name(mut self, name: impl Into<Cow<'static, str>>) -> Self {
        self.service_name = Some(name.into());
        self
    }
}

/// 安装后的持久状态，保持 OpenTelemetry Provider 在进程生命周期内有效。
struct InstallState {
    #[allow(dead_code)]
    provider: TracerProvider,
}

/// 以默认配置安装全局 `tracing` Subscriber（`EnvFilter` + `fmt` + OpenTelemetry 层）。
pub fn install() -> Result<(), InstallError> {
    install_with(InstallConfig::default())
}

/// 零配置之外的安装入口。
///
/// # 逻辑解析（How）
/// 1. 检查是否重复安装、外部是否已设置 Subscriber；
/// 2. 构建 `TracerProvider` 并注册到 `opentelemetry::global`；
/// 3. 使用 `tracing-subscriber` 组装 `EnvFilter + fmt + OpenTelemetry` 并设为全局 Subscriber；
/// 4. 把 Provider 写入 `INSTALL_STATE`。
///
/// # 契约说明（What）
/// - 多次调用返回 [`InstallError::AlreadyInstalled`]；
/// - 外部已配置 Subscriber 时返回 [`InstallError::SubscriberAlreadySet`]。
pub fn install_with(config: InstallConfig) -> Result<(), InstallError> {
    if INSTALL_STATE.get().is_some() {
        return Err(InstallError::AlreadyInstalled);
    }
    if dispatcher::has_been_set() {
        return Err(InstallError::SubscriberAlreadySet);
    }

    let state = install_impl(&config)?;
    INSTALL_STATE
        .set(state)
        .map_err(|_| InstallError::AlreadyInstalled)
}

/// 是否已经成功安装。
pub fn is_installed() -> bool {
    INSTALL_STATE.get().is_some()
}

/// 创建一个已挂载 [`TracingObservationHandler`] 的 Registry。
pub fn registry_with_tracing(config: TracingHandlerConfig) -> ObservationRegistry {
    let registry = ObservationRegistry::create();
    TracingObservationHandler::attach(&registry, config);
    registry
}

fn install_impl(config: &InstallConfig) -> Result<InstallState, InstallError> {
    let tracer_provider = build_tracer_provider(config);
    global::set_tracer_provider(tracer_provider.clone());

    let tracer = tracer_provider.versioned_tracer(
        config.tracer_name.clone(),
        Some(env!("CARGO_PKG_VERSION")),
        Some(Cow::Borrowed(env!("CARGO_PKG_NAME"))),
        None,
    );

    let subscriber = tracing_subscriber::registry()
        .with(build_env_filter(&config.default_filter))
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_opentelemetry::layer().with_tracer(tracer));
    tracing::subscriber::set_global_default(subscriber)?;

    Ok(InstallState {
        provider: tracer_provider,
    })
}

fn build_env_filter(default_filter: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter))
}

fn build_tracer_provider(config: &InstallConfig) -> TracerProvider {
    let resource = match &config.service_name {
        Some(name) => Resource::default().merge(&Resource::new([KeyValue::new(
            "service.name",
            name.to_string(),
        )])),
        None => Resource::default(),
    };

    TracerProvider::builder()
        .with_config(
            trace::config()
                .with_sampler(trace::Sampler::AlwaysOn)
                .with_resource(resource),
        )
        .build()
}
