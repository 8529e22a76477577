use std::{borrow::Cow, fmt};

use crate::error::{ObservationError, Result};

/// 单个标签键值对，键与值均为 UTF-8 字符串。
///
/// # 设计背景（Why）
/// - 指标、追踪与日志需要共享同一份标签建模，否则各 Handler 会各自拼接字符串导致语义漂移；
/// - 采用 `Cow<'static, str>` 兼顾静态常量（约定里的键名）与运行时拼接的值，避免无谓分配。
///
/// # 契约说明（What）
/// - **前置条件**：键名不可为空；[`KeyValue::new`] 与 `From<(K, V)>` 只在 debug 构建中断言，
///   键名来自外部输入时使用 [`KeyValue::try_new`]。
/// - **后置条件**：实例不可变，相等性同时比较键与值。
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct KeyValue {
    key: Cow<'static, str>,
    value: Cow<'static, str>,
}

impl KeyValue {
    /// 构造新的键值对，调用方负责保证键名非空；debug 构建中空键名会触发断言。
    pub fn new(key: impl Into<Cow<'static, str>>, value: impl Into<Cow<'static, str>>) -> Self {
        let key = key.into();
        debug_assert!(!key.is_empty(), "KeyValue 的键名不可为空");
        Self {
            key,
            value: value.into(),
        }
    }

    /// 校验键名后构造键值对。
    ///
    /// # 契约说明
    /// - **返回值**：键名为空时返回 [`ObservationError::EmptyKey`]，否则返回新实例。
    pub fn try_new(
        key: impl Into<Cow<'static, str>>,
        value: impl Into<Cow<'static, str>>,
    ) -> Result<Self> {
        let key = key.into();
        if key.is_empty() {
            return Err(ObservationError::EmptyKey);
        }
        Ok(Self {
            key,
            value: value.into(),
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    /// 保留键名、替换值，返回新的键值对。
    pub fn with_value(&self, value: impl Into<Cow<'static, str>>) -> Self {
        Self {
            key: self.key.clone(),
            value: value.into(),
        }
    }
}

/// 流式 API（如 `low_cardinality_key_value(("region", "eu"))`）使用的转换，等价于 [`KeyValue::new`]。
impl<K, V> From<(K, V)> for KeyValue
where
    K: Into<Cow<'static, str>>,
    V: Into<Cow<'static, str>>,
{
    fn from((key, value): (K, V)) -> Self {
        KeyValue::new(key, value)
    }
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}='{}'", self.key, self.value)
    }
}

/// 标签所属的基数分区。
///
/// - `Low`：取值集合有界，可安全用作指标维度；
/// - `High`：取值无界（如请求 ID），仅适合追踪与日志。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Cardinality {
    Low,
    High,
}

/// 按键去重的有序键值集合。
///
/// # 设计背景（Why）
/// - Convention、Filter 与调用点都会向同一 Context 追加标签，需要一个“后写覆盖”的集合来消解冲突；
/// - 迭代顺序保持插入顺序，便于导出端生成稳定的输出；比较时则按集合语义，不关心顺序。
///
/// # 逻辑解析（How）
/// - 内部维护 `Vec<KeyValue>`，插入时线性查找同名键：命中则原位替换值（位置不变），否则追加到末尾；
/// - 单个 Observation 的标签通常只有个位数到十几个，线性查找比哈希表更省内存与分配。
///
/// # 契约说明（What）
/// - **不变式**：集合内任意两个条目的键互不相同。
/// - **相等性**：长度相同且每个条目都能在对方中找到完全相等的条目。
///
/// # 风险提示（Trade-offs）
/// - 标签数量过百时插入代价为 O(n)；这种规模本身已违背低基数约定，应在上游收敛。
#[derive(Clone, Debug, Default)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(from = "Vec<KeyValue>", into = "Vec<KeyValue>")
)]
pub struct KeyValues {
    entries: Vec<KeyValue>,
}

impl KeyValues {
    /// 创建空集合。
    pub const fn empty() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// 由任意可转换为 [`KeyValue`] 的序列构造集合，重复键按“后写覆盖”处理。
    ///
    /// ```rust
    /// use spark_observation::KeyValues;
    ///
    /// let kvs = KeyValues::of([("low", "custom"), ("custom", "present"), ("low", "again")]);
    /// assert_eq!(kvs.len(), 2);
    /// assert_eq!(kvs.get("low").map(|kv| kv.value()), Some("again"));
    /// ```
    pub fn of<I, T>(entries: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<KeyValue>,
    {
        let mut kvs = Self::empty();
        kvs.extend(entries.into_iter().map(Into::into));
        kvs
    }

    /// 追加单个键值并返回新集合，便于链式构造。
    pub fn and(
        mut self,
        key: impl Into<Cow<'static, str>>,
        value: impl Into<Cow<'static, str>>,
    ) -> Self {
        self.insert(KeyValue::new(key, value));
        self
    }

    /// 合并另一集合，冲突键以 `other` 为准。
    pub fn and_all(mut self, other: &KeyValues) -> Self {
        self.merge(other);
        self
    }

    /// 插入或覆盖单个键值，返回被覆盖的旧条目。
    pub fn insert(&mut self, key_value: KeyValue) -> Option<KeyValue> {
        match self
            .entries
            .iter_mut()
            .find(|existing| existing.key == key_value.key)
        {
            Some(existing) => Some(std::mem::replace(existing, key_value)),
            None => {
                self.entries.push(key_value);
                None
            }
        }
    }

    /// 就地合并另一集合，冲突键以 `other` 为准。
    pub fn merge(&mut self, other: &KeyValues) {
        for key_value in other {
            self.insert(key_value.clone());
        }
    }

    pub fn get(&self, key: &str) -> Option<&KeyValue> {
        self.entries.iter().find(|kv| kv.key() == key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// 删除指定键，保持其余条目的相对顺序。
    pub fn remove(&mut self, key: &str) -> Option<KeyValue> {
        let index = self.entries.iter().position(|kv| kv.key() == key)?;
        Some(self.entries.remove(index))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 按插入顺序迭代。
    pub fn iter(&self) -> std::slice::Iter<'_, KeyValue> {
        self.entries.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> + '_ {
        self.entries.iter().map(KeyValue::key)
    }
}

impl PartialEq for KeyValues {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.iter().all(|kv| other.get(kv.key()) == Some(kv))
    }
}

impl Eq for KeyValues {}

impl Extend<KeyValue> for KeyValues {
    fn extend<I: IntoIterator<Item = KeyValue>>(&mut self, iter: I) {
        for key_value in iter {
            self.insert(key_value);
        }
    }
}

impl FromIterator<KeyValue> for KeyValues {
    fn from_iter<I: IntoIterator<Item = KeyValue>>(iter: I) -> Self {
        let mut kvs = Self::empty();
        kvs.extend(iter);
        kvs
    }
}

impl From<Vec<KeyValue>> for KeyValues {
    fn from(entries: Vec<KeyValue>) -> Self {
        entries.into_iter().collect()
    }
}

impl From<KeyValues> for Vec<KeyValue> {
    fn from(kvs: KeyValues) -> Self {
        kvs.entries
    }
}

impl IntoIterator for KeyValues {
    type Item = KeyValue;
    type IntoIter = std::vec::IntoIter<KeyValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl<'a> IntoIterator for &'a KeyValues {
    type Item = &'a KeyValue;
    type IntoIter = std::slice::Iter<'a, KeyValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

impl fmt::Display for KeyValues {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (index, kv) in self.entries.iter().enumerate() {
            if index > 0 {
                f.write_str(", ")?;
            }
            fmt::Display::fmt(kv, f)?;
        }
        f.write_str("]")
    }
}
