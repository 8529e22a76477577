use std::borrow::Cow;

use crate::observation::LifecycleState;

/// `ObservationError` 汇总 Observation 引擎对调用方“大声报告”的全部失败。
///
/// # 设计背景（Why）
/// - 埋点被禁用（无 Registry、无 Handler、Predicate 拒绝）不是错误，直接退化为 [`Observation::NOOP`](crate::Observation::NOOP)；
/// - 真正需要暴露给调用方的只有“用法错误”：生命周期乱序调用、非法键名、按键取属性失败等。
/// - 业务逻辑自身的失败从不经过本类型转换，调用方拿回的永远是自己的原始错误。
///
/// # 契约说明（What）
/// - `InvalidState`：在 `state` 状态下调用了不允许的 `operation`（如重复 `start`、`stop` 早于 `start`）。
/// - `EmptyKey`：构造 [`KeyValue`](crate::KeyValue) 时给出了空键。
/// - `MissingAttribute`：`Context::get_required` 找不到键，或值的类型与请求不符。
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ObservationError {
    /// 生命周期方法调用顺序非法。
    #[error("observation 生命周期非法：`{operation}` 不能在 {state} 状态下调用")]
    InvalidState {
        operation: &'static str,
        state: LifecycleState,
    },
    /// KeyValue 键名为空。
    #[error("KeyValue 的键不能为空")]
    EmptyKey,
    /// Context 中不存在所需属性或类型不匹配。
    #[error("Context 缺少属性 `{key}`，或其类型与请求不符")]
    MissingAttribute { key: Cow<'static, str> },
}

impl ObservationError {
    /// 判断是否为生命周期乱序导致的用法错误。
    pub fn is_invalid_state(&self) -> bool {
        matches!(self, ObservationError::InvalidState { .. })
    }
}

/// crate 内统一的结果别名，默认错误类型为 [`ObservationError`]。
pub type Result<T, E = ObservationError> = core::result::Result<T, E>;
