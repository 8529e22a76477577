use std::{
    any::{Any, type_name},
    borrow::Cow,
    collections::HashMap,
    error::Error,
    fmt,
    sync::{Arc, Weak},
};

use crate::{
    error::{ObservationError, Result},
    key_values::{Cardinality, KeyValue, KeyValues},
    observation::{Observation, ObservationCore},
};

/// 单次 Observation 的可变数据载体，在 Handler、Convention 与 Filter 之间传递。
///
/// # 设计背景（Why）
/// - 调用点只声明“某个操作正在发生”，具体如何度量由 Handler 决定；Context 是双方唯一的共享契约面。
/// - 指标 Handler 需要低基数标签，追踪 Handler 还需要高基数标签与父子关系，日志 Handler 关心错误，
///   因此 Context 同时承载名称、两类标签、错误槽、父级引用与开放式属性仓库。
///
/// # 逻辑解析（How）
/// - 名称与上下文名称在 `start()` 前可随意修改，`start()` 时由 Convention 决议覆盖；
/// - 属性仓库以字符串为键、任意 `Send + Sync + 'static` 类型为值，供 Handler 存放计时样本、Span 等私有数据；
/// - 父级引用只保存 [`Weak`]，查找时临时升级，不会延长父 Observation 的生命周期。
///
/// # 契约说明（What）
/// - **所有权**：标签集合与错误槽由 Context 独占；父级引用不拥有任何资源，可能为空。
/// - **并发**：Context 本身按单写者设计，跨线程共享时由所属 Observation 的锁串行化访问。
///
/// # 风险提示（Trade-offs）
/// - 属性值以 `Arc<dyn Any>` 存放，取值时需要下转型；类型不匹配视同缺失，调用方应使用稳定的键名约定。
/// - `start()` 执行 Filter 期间引擎持有一份快照，已有属性此时被共享：`get_mut`/`remove` 对它们返回 `None`，
///   `get_or_insert_with` 会以新值替换。
pub struct Context {
    name: Option<Cow<'static, str>>,
    contextual_name: Option<Cow<'static, str>>,
    low_cardinality: KeyValues,
    high_cardinality: KeyValues,
    error: Option<ObservedError>,
    parent: Option<ParentLink>,
    attributes: HashMap<Cow<'static, str>, Arc<dyn Any + Send + Sync>>,
}

impl Context {
    pub fn new() -> Self {
        Self {
            name: None,
            contextual_name: None,
            low_cardinality: KeyValues::empty(),
            high_cardinality: KeyValues::empty(),
            error: None,
            parent: None,
            attributes: HashMap::new(),
        }
    }

    /// 以给定名称构造 Context，常用于 Filter 返回全新实例的场景。
    pub fn with_name(mut self, name: impl Into<Cow<'static, str>>) -> Self {
        self.set_name(name);
        self
    }

    pub fn with_contextual_name(mut self, name: impl Into<Cow<'static, str>>) -> Self {
        self.set_contextual_name(name);
        self
    }

    pub fn with_low_cardinality_key_value(mut self, key_value: impl Into<KeyValue>) -> Self {
        self.add_low_cardinality_key_value(key_value);
        self
    }

    pub fn with_high_cardinality_key_value(mut self, key_value: impl Into<KeyValue>) -> Self {
        self.add_high_cardinality_key_value(key_value);
        self
    }

    pub fn with_attribute<T>(mut self, key: impl Into<Cow<'static, str>>, value: T) -> Self
    where
        T: Any + Send + Sync,
    {
        self.put(key, value);
        self
    }

    /// 技术性名称（如 `http.server.requests`），未设置时为 `None`。
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn set_name(&mut self, name: impl Into<Cow<'static, str>>) -> &mut Self {
        self.name = Some(name.into());
        self
    }

    /// 面向人的上下文名称（如 `GET /orders/{id}`）。
    pub fn contextual_name(&self) -> Option<&str> {
        self.contextual_name.as_deref()
    }

    pub fn set_contextual_name(&mut self, name: impl Into<Cow<'static, str>>) -> &mut Self {
        self.contextual_name = Some(name.into());
        self
    }

    pub fn low_cardinality_key_values(&self) -> &KeyValues {
        &self.low_cardinality
    }

    pub fn high_cardinality_key_values(&self) -> &KeyValues {
        &self.high_cardinality
    }

    /// 按基数分区取标签集合。
    pub fn key_values(&self, cardinality: Cardinality) -> &KeyValues {
        match cardinality {
            Cardinality::Low => &self.low_cardinality,
            Cardinality::High => &self.high_cardinality,
        }
    }

    /// 低基数在前、高基数在后的全部标签；同名键以高基数为准。
    pub fn all_key_values(&self) -> KeyValues {
        self.low_cardinality.clone().and_all(&self.high_cardinality)
    }

    pub fn low_cardinality_key_value(&self, key: &str) -> Option<&KeyValue> {
        self.low_cardinality.get(key)
    }

    pub fn high_cardinality_key_value(&self, key: &str) -> Option<&KeyValue> {
        self.high_cardinality.get(key)
    }

    pub fn add_low_cardinality_key_value(&mut self, key_value: impl Into<KeyValue>) -> &mut Self {
        self.low_cardinality.insert(key_value.into());
        self
    }

    pub fn add_high_cardinality_key_value(&mut self, key_value: impl Into<KeyValue>) -> &mut Self {
        self.high_cardinality.insert(key_value.into());
        self
    }

    pub fn add_low_cardinality_key_values(&mut self, key_values: &KeyValues) -> &mut Self {
        self.low_cardinality.merge(key_values);
        self
    }

    pub fn add_high_cardinality_key_values(&mut self, key_values: &KeyValues) -> &mut Self {
        self.high_cardinality.merge(key_values);
        self
    }

    pub fn remove_low_cardinality_key_value(&mut self, key: &str) -> Option<KeyValue> {
        self.low_cardinality.remove(key)
    }

    pub fn remove_high_cardinality_key_value(&mut self, key: &str) -> Option<KeyValue> {
        self.high_cardinality.remove(key)
    }

    /// 最近一次记录的错误；多次记录时只保留最后一次。
    pub fn error(&self) -> Option<&ObservedError> {
        self.error.as_ref()
    }

    pub fn set_error(&mut self, error: ObservedError) -> &mut Self {
        self.error = Some(error);
        self
    }

    /// 查找父 Observation。
    ///
    /// # 契约说明（What）
    /// - 显式声明的父级（`Observation::parent_observation`）只要父 Observation 仍存活就一直可见；
    /// - 经由作用域捕获的父级仅在捕获时的那个 Scope 仍未释放、且当前 Observation 尚未 `stop()` 时可见，
    ///   否则返回 `None`；父级之后重新打开的作用域（包括其他线程上的）不会恢复该链接；
    /// - 父 Observation 已被释放时同样返回 `None`。
    pub fn parent_observation(&self) -> Option<Observation> {
        let link = self.parent.as_ref()?;
        let core = link.observation.upgrade()?;
        if let ParentKind::Scoped { token } = link.kind {
            if !core.has_open_scope(token) {
                return None;
            }
        }
        Some(Observation::from_core(core))
    }

    pub(crate) fn has_parent_link(&self) -> bool {
        self.parent.is_some()
    }

    pub(crate) fn link_parent(&mut self, observation: Weak<ObservationCore>, kind: ParentKind) {
        self.parent = Some(ParentLink { observation, kind });
    }

    /// 清除经由作用域捕获的父级，显式父级保持不变。
    pub(crate) fn unlink_scoped_parent(&mut self) {
        if matches!(&self.parent, Some(link) if matches!(link.kind, ParentKind::Scoped { .. })) {
            self.parent = None;
        }
    }

    /// 写入属性，已有同名键时覆盖并丢弃旧值。
    pub fn put<T>(&mut self, key: impl Into<Cow<'static, str>>, value: T) -> &mut Self
    where
        T: Any + Send + Sync,
    {
        self.attributes.insert(key.into(), Arc::new(value));
        self
    }

    /// 读取属性；键不存在或类型不匹配时返回 `None`。
    pub fn get<T: Any>(&self, key: &str) -> Option<&T> {
        let value = self.attributes.get(key)?;
        (**value).downcast_ref::<T>()
    }

    /// 可变读取属性；属性正被快照共享时返回 `None`。
    pub fn get_mut<T: Any>(&mut self, key: &str) -> Option<&mut T> {
        Arc::get_mut(self.attributes.get_mut(key)?)?.downcast_mut::<T>()
    }

    /// 读取必需属性，缺失时返回 [`ObservationError::MissingAttribute`]。
    pub fn get_required<T: Any>(&self, key: &str) -> Result<&T> {
        self.get(key)
            .ok_or_else(|| ObservationError::MissingAttribute {
                key: Cow::Owned(key.to_owned()),
            })
    }

    pub fn contains(&self, key: &str) -> bool {
        self.attributes.contains_key(key)
    }

    /// 取出并删除属性；类型不匹配或属性正被快照共享时，属性保持原样并返回 `None`。
    pub fn remove<T>(&mut self, key: &str) -> Option<T>
    where
        T: Any + Send + Sync,
    {
        let (key, value) = self.attributes.remove_entry(key)?;
        let typed = match value.downcast::<T>() {
            Ok(typed) => typed,
            Err(value) => {
                self.attributes.insert(key, value);
                return None;
            }
        };
        match Arc::try_unwrap(typed) {
            Ok(value) => Some(value),
            Err(shared) => {
                self.attributes.insert(key, shared);
                None
            }
        }
    }

    /// 读取属性，不存在（或类型不符）时以 `init` 的结果写入后返回。
    pub fn get_or_insert_with<T>(
        &mut self,
        key: impl Into<Cow<'static, str>>,
        init: impl FnOnce() -> T,
    ) -> &mut T
    where
        T: Any + Send + Sync,
    {
        let key = key.into();
        let reusable = self
            .attributes
            .get_mut(&key)
            .and_then(Arc::get_mut)
            .is_some_and(|value| value.is::<T>());
        if !reusable {
            self.attributes.insert(key.clone(), Arc::new(init()));
        }
        match self
            .attributes
            .get_mut(&key)
            .and_then(Arc::get_mut)
            .and_then(|value| value.downcast_mut::<T>())
        {
            Some(value) => value,
            // 上面的分支保证槽位独占且值类型为 T。
            None => unreachable!("attribute slot holds a unique value of the requested type"),
        }
    }

    pub fn attribute_keys(&self) -> impl Iterator<Item = &str> + '_ {
        self.attributes.keys().map(|key| key.as_ref())
    }

    pub fn clear_attributes(&mut self) {
        self.attributes.clear();
    }

    /// 浅拷贝：标签与错误按值复制，属性共享同一份值。
    pub(crate) fn snapshot(&self) -> Self {
        Self {
            name: self.name.clone(),
            contextual_name: self.contextual_name.clone(),
            low_cardinality: self.low_cardinality.clone(),
            high_cardinality: self.high_cardinality.clone(),
            error: self.error.clone(),
            parent: self.parent.clone(),
            attributes: self.attributes.clone(),
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<&str> = self.attribute_keys().collect();
        keys.sort_unstable();
        f.debug_struct("Context")
            .field("name", &self.name)
            .field("contextual_name", &self.contextual_name)
            .field("low_cardinality", &self.low_cardinality)
            .field("high_cardinality", &self.high_cardinality)
            .field("error", &self.error)
            .field("parent", &self.parent.as_ref().map(|link| link.kind))
            .field("attributes", &keys)
            .finish()
    }
}

/// 父级引用的来源。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ParentKind {
    /// 通过 `parent_observation(...)` 显式声明，与作用域无关。
    Explicit,
    /// 创建或启动时从当前线程的作用域栈捕获，仅在令牌对应的 Scope 释放前有效。
    Scoped { token: u64 },
}

#[derive(Clone)]
struct ParentLink {
    observation: Weak<ObservationCore>,
    kind: ParentKind,
}

/// 记录在 Context 上的失败快照。
///
/// # 设计背景（Why）
/// - 引擎只“装饰”失败路径而从不吞掉调用方的错误：`error(&err)` 借用原始错误，调用方依旧拥有并返回它；
/// - 因此 Context 无法持有原始错误值，只能保存一份可克隆、可跨线程的快照供 Handler 读取。
///
/// # 契约说明（What）
/// - `kind`：错误的静态类型名；经由 trait 对象记录时为 trait 对象的类型名。
/// - `message`：`Display` 输出。
/// - `sources`：`Error::source` 链上每一层的 `Display` 输出，由近及远。
/// - `panicked`：由 `observe` 在 panic 展开路径上记录时为 `true`。
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ObservedError {
    kind: Cow<'static, str>,
    message: String,
    sources: Vec<String>,
    panicked: bool,
}

impl ObservedError {
    /// 对任意错误拍快照，不获取其所有权。
    pub fn capture<E>(error: &E) -> Self
    where
        E: Error + ?Sized,
    {
        let mut sources = Vec::new();
        let mut cursor = error.source();
        while let Some(source) = cursor {
            sources.push(source.to_string());
            cursor = source.source();
        }
        Self {
            kind: Cow::Borrowed(type_name::<E>()),
            message: error.to_string(),
            sources,
            panicked: false,
        }
    }

    pub(crate) fn panic() -> Self {
        Self {
            kind: Cow::Borrowed("panic"),
            message: "observed body panicked".to_owned(),
            sources: Vec::new(),
            panicked: true,
        }
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn sources(&self) -> &[String] {
        &self.sources
    }

    pub fn is_panic(&self) -> bool {
        self.panicked
    }
}

impl fmt::Display for ObservedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl Error for ObservedError {}
