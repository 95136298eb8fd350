//! Properties: string-encoded values with optional setter and getter.

use lw3_protocol::ErrorCode;
use std::fmt;
use std::sync::Arc;

/// Called instead of direct assignment. Receives the raw (unescaped) input
/// and the stored value, which it may rewrite or leave untouched.
pub type Setter = Arc<dyn Fn(&str, &mut String) -> Result<(), ErrorCode> + Send + Sync>;

/// Overrides every read of the stored value.
pub type Getter = Arc<dyn Fn() -> String + Send + Sync>;

/// A named value on a node.
#[derive(Clone)]
pub struct Property {
    pub(crate) value: String,
    pub(crate) manual: String,
    pub(crate) rw: bool,
    pub(crate) setter: Option<Setter>,
    pub(crate) getter: Option<Getter>,
}

impl Property {
    /// Creates a writable property.
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            manual: String::new(),
            rw: true,
            setter: None,
            getter: None,
        }
    }

    /// Creates a read-only property.
    pub fn read_only(value: impl Into<String>) -> Self {
        Self::new(value).writable(false)
    }

    pub fn manual(mut self, manual: impl Into<String>) -> Self {
        self.manual = manual.into();
        self
    }

    pub fn writable(mut self, rw: bool) -> Self {
        self.rw = rw;
        self
    }

    pub fn with_setter<F>(mut self, setter: F) -> Self
    where
        F: Fn(&str, &mut String) -> Result<(), ErrorCode> + Send + Sync + 'static,
    {
        self.setter = Some(Arc::new(setter));
        self
    }

    pub fn with_getter<F>(mut self, getter: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        self.getter = Some(Arc::new(getter));
        self
    }

    /// Returns the readable value, through the getter when one is set.
    pub fn value(&self) -> String {
        match &self.getter {
            Some(getter) => getter(),
            None => self.value.clone(),
        }
    }

    /// Returns the stored value, ignoring any getter.
    pub fn stored_value(&self) -> &str {
        &self.value
    }

    pub fn is_writable(&self) -> bool {
        self.rw
    }

    pub(crate) fn info(&self, name: &str) -> PropertyInfo {
        PropertyInfo {
            name: name.to_string(),
            value: self.value(),
            manual: self.manual.clone(),
            rw: self.rw,
        }
    }
}

impl fmt::Debug for Property {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Property")
            .field("value", &self.value)
            .field("manual", &self.manual)
            .field("rw", &self.rw)
            .field("setter", &self.setter.is_some())
            .field("getter", &self.getter.is_some())
            .finish()
    }
}

/// A point-in-time copy of a property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyInfo {
    pub name: String,
    /// Value as read (through the getter), unescaped.
    pub value: String,
    pub manual: String,
    pub rw: bool,
}
