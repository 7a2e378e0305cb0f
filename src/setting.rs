//! Typed, introspectable device settings.
//!
//! A [`Setting`] binds a name and a [`Dtype`] to getter/setter closures supplied
//! by a concrete driver. Settings are collected in a [`Settings`] registry that
//! keeps registration order, which is the order remote clients iterate them in.
//!
//! Enum settings always travel as their integer index. The registry translates
//! between indices and typed values through [`SettingEnum`] so the wire
//! representation stays stable whatever the driver's enum type looks like.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::error::{DeviceError, DeviceResult};

// =============================================================================
// Value model
// =============================================================================

/// Data type of a setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dtype {
    /// Integer with inclusive bounds.
    Int,
    /// Floating point with inclusive bounds.
    Float,
    /// Boolean, no value description.
    Bool,
    /// Enumeration addressed by index.
    Enum,
    /// String with an optional length hint.
    Str,
    /// Fixed arity tuple.
    Tuple,
}

impl Dtype {
    /// Name used in descriptions and configuration.
    pub fn as_str(&self) -> &'static str {
        match self {
            Dtype::Int => "int",
            Dtype::Float => "float",
            Dtype::Bool => "bool",
            Dtype::Enum => "enum",
            Dtype::Str => "str",
            Dtype::Tuple => "tuple",
        }
    }

    /// Whether `values` has an admissible shape for this dtype.
    fn accepts(&self, values: &Values) -> bool {
        match (self, values) {
            (Dtype::Int | Dtype::Float, Values::Range(min, max)) => {
                min.as_f64().is_some() && max.as_f64().is_some()
            }
            (Dtype::Enum, Values::Choices(_)) => true,
            (Dtype::Bool, Values::None) => true,
            (Dtype::Str, Values::None | Values::Length(_)) => true,
            (Dtype::Tuple, Values::None | Values::Length(_)) => true,
            _ => false,
        }
    }
}

impl fmt::Display for Dtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Dtype {
    type Err = DeviceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "int" => Ok(Dtype::Int),
            "float" => Ok(Dtype::Float),
            "bool" => Ok(Dtype::Bool),
            "enum" => Ok(Dtype::Enum),
            "str" => Ok(Dtype::Str),
            "tuple" => Ok(Dtype::Tuple),
            other => Err(DeviceError::Configuration(format!(
                "unsupported dtype '{other}'"
            ))),
        }
    }
}

/// A setting value as seen by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SettingValue {
    /// Boolean value.
    Bool(bool),
    /// Integer value, also used for enum indices.
    Int(i64),
    /// Floating point value.
    Float(f64),
    /// String value.
    Str(String),
    /// Tuple of values.
    Tuple(Vec<SettingValue>),
}

impl SettingValue {
    /// Integer content, if any.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SettingValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Numeric content widened to `f64`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            SettingValue::Int(v) => Some(*v as f64),
            SettingValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// Boolean content, if any.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            SettingValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// String content, if any.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            SettingValue::Str(v) => Some(v),
            _ => None,
        }
    }

    /// Tuple content, if any.
    pub fn as_tuple(&self) -> Option<&[SettingValue]> {
        match self {
            SettingValue::Tuple(v) => Some(v),
            _ => None,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            SettingValue::Bool(_) => "bool",
            SettingValue::Int(_) => "int",
            SettingValue::Float(_) => "float",
            SettingValue::Str(_) => "str",
            SettingValue::Tuple(_) => "tuple",
        }
    }
}

impl fmt::Display for SettingValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SettingValue::Bool(v) => write!(f, "{v}"),
            SettingValue::Int(v) => write!(f, "{v}"),
            SettingValue::Float(v) => write!(f, "{v}"),
            SettingValue::Str(v) => write!(f, "{v:?}"),
            SettingValue::Tuple(items) => {
                f.write_str("(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str(")")
            }
        }
    }
}

macro_rules! impl_from_int {
    ($($t:ty),*) => {
        $(impl From<$t> for SettingValue {
            fn from(v: $t) -> Self {
                SettingValue::Int(v as i64)
            }
        })*
    };
}

impl_from_int!(i32, i64, u8, u16, u32, usize);

impl From<bool> for SettingValue {
    fn from(v: bool) -> Self {
        SettingValue::Bool(v)
    }
}

impl From<f64> for SettingValue {
    fn from(v: f64) -> Self {
        SettingValue::Float(v)
    }
}

impl From<&str> for SettingValue {
    fn from(v: &str) -> Self {
        SettingValue::Str(v.to_string())
    }
}

impl From<String> for SettingValue {
    fn from(v: String) -> Self {
        SettingValue::Str(v)
    }
}

impl From<Vec<SettingValue>> for SettingValue {
    fn from(v: Vec<SettingValue>) -> Self {
        SettingValue::Tuple(v)
    }
}

/// Conversion from a client supplied value into the type a setter expects.
pub trait FromSettingValue: Sized {
    /// Convert `value`, naming `setting` in the error.
    fn from_setting_value(setting: &str, value: SettingValue) -> DeviceResult<Self>;
}

fn mismatch(setting: &str, expected: &str, value: &SettingValue) -> DeviceError {
    DeviceError::InvalidValue {
        name: setting.to_string(),
        reason: format!("expected {expected}, got {}", value.kind()),
    }
}

impl FromSettingValue for SettingValue {
    fn from_setting_value(_setting: &str, value: SettingValue) -> DeviceResult<Self> {
        Ok(value)
    }
}

impl FromSettingValue for i64 {
    fn from_setting_value(setting: &str, value: SettingValue) -> DeviceResult<Self> {
        value.as_i64().ok_or_else(|| mismatch(setting, "int", &value))
    }
}

macro_rules! impl_from_setting_int {
    ($($t:ty),*) => {
        $(impl FromSettingValue for $t {
            fn from_setting_value(setting: &str, value: SettingValue) -> DeviceResult<Self> {
                let raw = i64::from_setting_value(setting, value)?;
                <$t>::try_from(raw).map_err(|_| DeviceError::InvalidValue {
                    name: setting.to_string(),
                    reason: format!("{raw} is out of range for {}", stringify!($t)),
                })
            }
        })*
    };
}

impl_from_setting_int!(i32, u8, u16, u32, usize);

impl FromSettingValue for f64 {
    fn from_setting_value(setting: &str, value: SettingValue) -> DeviceResult<Self> {
        value.as_f64().ok_or_else(|| mismatch(setting, "float", &value))
    }
}

impl FromSettingValue for bool {
    fn from_setting_value(setting: &str, value: SettingValue) -> DeviceResult<Self> {
        value.as_bool().ok_or_else(|| mismatch(setting, "bool", &value))
    }
}

impl FromSettingValue for String {
    fn from_setting_value(setting: &str, value: SettingValue) -> DeviceResult<Self> {
        match value {
            SettingValue::Str(s) => Ok(s),
            other => Err(mismatch(setting, "str", &other)),
        }
    }
}

/// Rust enums exposed as enum settings.
///
/// Implementors map each variant to a stable index and a label. Clients only
/// ever see the index.
pub trait SettingEnum: Sized + Copy + Send + Sync + 'static {
    /// All variants as `(index, label)` in display order.
    fn choices() -> Vec<(i64, String)>;

    /// Index of this variant.
    fn index(self) -> i64;

    /// Variant for `index`, if any.
    fn from_index(index: i64) -> Option<Self>;
}

/// Description of admissible values, shaped by the setting's [`Dtype`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Values {
    /// No description (bool, opaque tuples, free strings).
    None,
    /// Inclusive numeric bounds.
    Range(SettingValue, SettingValue),
    /// Enum choices as `(index, label)`.
    Choices(Vec<(i64, String)>),
    /// Length hint for strings or arity for tuples.
    Length(usize),
}

impl Values {
    /// Numeric range helper.
    pub fn range(min: impl Into<SettingValue>, max: impl Into<SettingValue>) -> Self {
        Values::Range(min.into(), max.into())
    }

    /// Choices from plain labels, indexed by position.
    pub fn labels<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Values::Choices(
            labels
                .into_iter()
                .enumerate()
                .map(|(i, label)| (i as i64, label.into()))
                .collect(),
        )
    }

    fn has_index(&self, index: i64) -> bool {
        match self {
            Values::Choices(choices) => choices.iter().any(|(i, _)| *i == index),
            _ => false,
        }
    }
}

// =============================================================================
// Setting
// =============================================================================

type Getter = Box<dyn Fn() -> DeviceResult<SettingValue> + Send + Sync>;
type Setter = Box<dyn Fn(SettingValue) -> DeviceResult<()> + Send + Sync>;
type ValuesFn = Box<dyn Fn() -> Values + Send + Sync>;
type ReadonlyFn = Box<dyn Fn() -> bool + Send + Sync>;

enum ValuesSource {
    Static(Values),
    Dynamic(ValuesFn),
}

enum ReadonlySource {
    Static(bool),
    Dynamic(ReadonlyFn),
}

/// Snapshot returned by [`Setting::describe`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettingDescription {
    /// Data type.
    #[serde(rename = "type")]
    pub dtype: Dtype,
    /// Admissible values resolved at call time.
    pub values: Values,
    /// Current read-only state.
    pub readonly: bool,
    /// True when the value comes from the write cache.
    pub cached: bool,
}

/// A named, typed device property.
pub struct Setting {
    name: String,
    dtype: Dtype,
    getter: Option<Getter>,
    setter: Option<Setter>,
    values: ValuesSource,
    readonly: ReadonlySource,
    last_written: Mutex<Option<SettingValue>>,
}

impl Setting {
    /// Setting name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Setting data type.
    pub fn dtype(&self) -> Dtype {
        self.dtype
    }

    /// Whether a setter is bound.
    pub fn is_settable(&self) -> bool {
        self.setter.is_some()
    }

    /// Current value description.
    pub fn values(&self) -> Values {
        match &self.values {
            ValuesSource::Static(v) => v.clone(),
            ValuesSource::Dynamic(f) => f(),
        }
    }

    /// Current read-only state.
    pub fn readonly(&self) -> bool {
        match &self.readonly {
            ReadonlySource::Static(v) => *v,
            ReadonlySource::Dynamic(f) => f(),
        }
    }

    /// Description for remote clients.
    pub fn describe(&self) -> SettingDescription {
        SettingDescription {
            dtype: self.dtype,
            values: self.values(),
            readonly: self.readonly(),
            cached: self.last_written.lock().is_some(),
        }
    }

    /// Read the value. Write-only settings return the last written value.
    pub fn get(&self) -> DeviceResult<SettingValue> {
        match &self.getter {
            Some(getter) => getter(),
            None => self.last_written.lock().clone().ok_or_else(|| {
                DeviceError::IncompatibleState(format!(
                    "write-only setting '{}' has not been written",
                    self.name
                ))
            }),
        }
    }

    /// Write the value. Enum settings take an index into the current choices.
    pub fn set(&self, value: SettingValue) -> DeviceResult<()> {
        let setter = self
            .setter
            .as_ref()
            .ok_or_else(|| DeviceError::NotImplemented(format!("setting '{}'", self.name)))?;
        if self.dtype == Dtype::Enum {
            let index = value.as_i64().ok_or_else(|| mismatch(&self.name, "enum index", &value))?;
            if !self.values().has_index(index) {
                return Err(DeviceError::InvalidValue {
                    name: self.name.clone(),
                    reason: format!("{index} is not a valid choice"),
                });
            }
        }
        if self.getter.is_none() {
            setter(value.clone())?;
            *self.last_written.lock() = Some(value);
            Ok(())
        } else {
            setter(value)
        }
    }
}

impl fmt::Debug for Setting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Setting")
            .field("name", &self.name)
            .field("dtype", &self.dtype)
            .field("gettable", &self.getter.is_some())
            .field("settable", &self.setter.is_some())
            .finish()
    }
}

/// Builder for [`Setting`].
///
/// ```rust,ignore
/// settings.add(
///     SettingBuilder::new("gain", Dtype::Int)
///         .getter(move || Ok(state.lock().gain))
///         .setter(move |v: i64| { state.lock().gain = v; Ok(()) })
///         .range(0, 8192),
/// )?;
/// ```
pub struct SettingBuilder {
    name: String,
    dtype: Dtype,
    getter: Option<Getter>,
    setter: Option<Setter>,
    values: ValuesSource,
    readonly: Option<ReadonlySource>,
}

impl SettingBuilder {
    /// Start a setting with no accessors and no value description.
    pub fn new(name: impl Into<String>, dtype: Dtype) -> Self {
        Self {
            name: name.into(),
            dtype,
            getter: None,
            setter: None,
            values: ValuesSource::Static(Values::None),
            readonly: None,
        }
    }

    /// Enum setting over the variants of `E`.
    pub fn for_enum<E: SettingEnum>(name: impl Into<String>) -> Self {
        Self::new(name, Dtype::Enum).values(Values::Choices(E::choices()))
    }

    /// Bind a getter.
    pub fn getter<T, F>(mut self, f: F) -> Self
    where
        T: Into<SettingValue>,
        F: Fn() -> DeviceResult<T> + Send + Sync + 'static,
    {
        self.getter = Some(Box::new(move || f().map(Into::into)));
        self
    }

    /// Bind a setter; the value is converted before the closure is called.
    pub fn setter<T, F>(mut self, f: F) -> Self
    where
        T: FromSettingValue,
        F: Fn(T) -> DeviceResult<()> + Send + Sync + 'static,
    {
        let name = self.name.clone();
        self.setter = Some(Box::new(move |value| {
            f(T::from_setting_value(&name, value)?)
        }));
        self
    }

    /// Bind a getter returning a typed enum variant.
    pub fn enum_getter<E, F>(self, f: F) -> Self
    where
        E: SettingEnum,
        F: Fn() -> DeviceResult<E> + Send + Sync + 'static,
    {
        self.getter(move || f().map(SettingEnum::index))
    }

    /// Bind a setter taking a typed enum variant.
    pub fn enum_setter<E, F>(self, f: F) -> Self
    where
        E: SettingEnum,
        F: Fn(E) -> DeviceResult<()> + Send + Sync + 'static,
    {
        let name = self.name.clone();
        self.setter(move |index: i64| {
            let variant = E::from_index(index).ok_or_else(|| DeviceError::InvalidValue {
                name: name.clone(),
                reason: format!("{index} is not a valid choice"),
            })?;
            f(variant)
        })
    }

    /// Static value description.
    pub fn values(mut self, values: Values) -> Self {
        self.values = ValuesSource::Static(values);
        self
    }

    /// Inclusive numeric bounds.
    pub fn range(self, min: impl Into<SettingValue>, max: impl Into<SettingValue>) -> Self {
        self.values(Values::range(min, max))
    }

    /// Value description computed at call time. Skips the shape check.
    pub fn dynamic_values<F>(mut self, f: F) -> Self
    where
        F: Fn() -> Values + Send + Sync + 'static,
    {
        self.values = ValuesSource::Dynamic(Box::new(f));
        self
    }

    /// Explicit read-only flag. Requires a setter.
    pub fn readonly(mut self, readonly: bool) -> Self {
        self.readonly = Some(ReadonlySource::Static(readonly));
        self
    }

    /// Read-only state computed at call time. Requires a setter.
    pub fn dynamic_readonly<F>(mut self, f: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        self.readonly = Some(ReadonlySource::Dynamic(Box::new(f)));
        self
    }

    /// Validate and build the setting.
    pub fn build(self) -> DeviceResult<Setting> {
        if self.getter.is_none() && self.setter.is_none() {
            return Err(DeviceError::Configuration(format!(
                "setting '{}' needs a getter or a setter",
                self.name
            )));
        }
        if let ValuesSource::Static(values) = &self.values {
            if !self.dtype.accepts(values) {
                return Err(DeviceError::Configuration(format!(
                    "invalid values for {} setting '{}': {values:?}",
                    self.dtype, self.name
                )));
            }
        }
        let readonly = match self.readonly {
            None => ReadonlySource::Static(self.setter.is_none()),
            Some(_) if self.setter.is_none() => {
                return Err(DeviceError::Configuration(format!(
                    "setting '{}' has a readonly flag but no setter",
                    self.name
                )));
            }
            Some(source) => source,
        };
        Ok(Setting {
            name: self.name,
            dtype: self.dtype,
            getter: self.getter,
            setter: self.setter,
            values: self.values,
            readonly,
            last_written: Mutex::new(None),
        })
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Result of one entry of [`Settings::update`].
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    /// Value read back after all writes completed.
    Applied(SettingValue),
    /// Unknown name or no setter bound.
    NotImplemented,
}

/// Ordered collection of settings owned by one device.
///
/// Closures are never invoked while the registry lock is held, so a setter may
/// itself register or describe settings.
#[derive(Default)]
pub struct Settings {
    entries: RwLock<Vec<Arc<Setting>>>,
}

impl Settings {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build and register a setting.
    ///
    /// A setting with the same name is replaced in place, keeping its
    /// position. Drivers rely on this to re-register settings whose shape
    /// depends on a hardware mode.
    pub fn add(&self, builder: SettingBuilder) -> DeviceResult<()> {
        let setting = Arc::new(builder.build()?);
        let mut entries = self.entries.write();
        match entries.iter_mut().find(|s| s.name == setting.name) {
            Some(slot) => {
                debug!(setting = %setting.name, "Replacing setting");
                *slot = setting;
            }
            None => entries.push(setting),
        }
        Ok(())
    }

    /// Look up a setting.
    pub fn get(&self, name: &str) -> Option<Arc<Setting>> {
        self.entries.read().iter().find(|s| s.name == name).cloned()
    }

    fn require(&self, name: &str) -> DeviceResult<Arc<Setting>> {
        self.get(name)
            .ok_or_else(|| DeviceError::UnknownSetting(name.to_string()))
    }

    fn snapshot(&self) -> Vec<Arc<Setting>> {
        self.entries.read().clone()
    }

    /// Setting names in registration order.
    pub fn names(&self) -> Vec<String> {
        self.entries.read().iter().map(|s| s.name.clone()).collect()
    }

    /// Number of registered settings.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Read one setting.
    pub fn get_value(&self, name: &str) -> DeviceResult<SettingValue> {
        self.require(name)?.get()
    }

    /// Write one setting.
    pub fn set_value(&self, name: &str, value: SettingValue) -> DeviceResult<()> {
        self.require(name)?.set(value).map_err(|err| {
            error!(setting = name, error = %err, "in set_setting");
            err
        })
    }

    /// Describe one setting.
    pub fn describe(&self, name: &str) -> DeviceResult<SettingDescription> {
        Ok(self.require(name)?.describe())
    }

    /// Describe every setting in registration order.
    pub fn describe_all(&self) -> Vec<(String, SettingDescription)> {
        self.snapshot()
            .iter()
            .map(|s| (s.name.clone(), s.describe()))
            .collect()
    }

    /// Read every setting. A failing read reports `None` and is logged.
    pub fn get_all(&self) -> Vec<(String, Option<SettingValue>)> {
        self.snapshot()
            .iter()
            .map(|s| {
                let value = match s.get() {
                    Ok(v) => Some(v),
                    Err(err) => {
                        error!(setting = %s.name, error = %err, "getting setting failed");
                        None
                    }
                };
                (s.name.clone(), value)
            })
            .collect()
    }

    /// Apply a batch of values.
    ///
    /// With `init` every registered setting must appear in `incoming`, and
    /// nothing is written otherwise. Without `init` only values that differ
    /// from the current ones are written. All writes happen before any value
    /// is read back.
    pub fn update(
        &self,
        incoming: &BTreeMap<String, SettingValue>,
        init: bool,
    ) -> DeviceResult<BTreeMap<String, UpdateOutcome>> {
        let registered = self.snapshot();

        if init {
            let missing: Vec<String> = registered
                .iter()
                .filter(|s| !incoming.contains_key(&s.name))
                .map(|s| s.name.clone())
                .collect();
            if !missing.is_empty() {
                debug!(?missing, "update_settings init=true but missing keys");
                return Err(DeviceError::MissingSettings(missing));
            }
        }

        let mut results = BTreeMap::new();
        let mut touched: Vec<(Arc<Setting>, &SettingValue)> = Vec::new();
        for (name, value) in incoming {
            let Some(setting) = registered.iter().find(|s| &s.name == name) else {
                results.insert(name.clone(), UpdateOutcome::NotImplemented);
                continue;
            };
            if !init {
                if let Ok(current) = setting.get() {
                    if current == *value {
                        continue;
                    }
                }
            }
            if !setting.is_settable() {
                results.insert(name.clone(), UpdateOutcome::NotImplemented);
                continue;
            }
            touched.push((Arc::clone(setting), value));
        }

        for (setting, value) in &touched {
            if setting.readonly() {
                continue;
            }
            setting.set((*value).clone())?;
        }

        for (setting, _) in touched {
            let value = setting.get()?;
            results.insert(setting.name.clone(), UpdateOutcome::Applied(value));
        }
        Ok(results)
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}
