//! Nodes of the tree.
//!
//! A [`Node`] is a cheap, clonable handle. Each name inside a node maps to
//! exactly one [`Entry`]: a child node, a property or a method.
//!
//! Mutations of a node are serialised by a per-node reentrant lock that is
//! held across both the value update and the listener dispatch, so listeners
//! observe changes in the order they were made and may themselves write to
//! the same node.

use crate::error::{EntryKind, TreeError};
use crate::listener::{ChangeEvent, ListenerCallback, ListenerRule, ListenerSet};
use crate::method::{Method, MethodFuture, MethodInfo};
use crate::path::{child_path, join_path, validate_name};
use crate::property::{Property, PropertyInfo, Setter};
use lw3_protocol::{Change, Value};
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::oneshot;

/// What a name inside a node refers to.
#[derive(Debug, Clone)]
pub enum Entry {
    Node(Node),
    Property(Property),
    Method(Method),
}

impl Entry {
    pub fn kind(&self) -> EntryKind {
        match self {
            Entry::Node(_) => EntryKind::Node,
            Entry::Property(_) => EntryKind::Property,
            Entry::Method(_) => EntryKind::Method,
        }
    }
}

struct NodeInner {
    path: String,
    entries: RwLock<BTreeMap<String, Entry>>,
    listeners: ListenerSet,
    write_lock: ReentrantMutex<()>,
}

/// Handle to a node.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node").field("path", &self.inner.path).finish()
    }
}

impl Node {
    pub(crate) fn new_root() -> Self {
        Self::with_path(join_path::<&str>(&[]))
    }

    fn with_path(path: String) -> Self {
        Self {
            inner: Arc::new(NodeInner {
                path,
                entries: RwLock::new(BTreeMap::new()),
                listeners: ListenerSet::new(),
                write_lock: ReentrantMutex::new(()),
            }),
        }
    }

    /// Absolute path of the node, `/` for the root.
    pub fn path(&self) -> &str {
        &self.inner.path
    }

    /// Returns true if both handles refer to the same node.
    pub fn ptr_eq(&self, other: &Node) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn member_path(&self, separator: char, name: &str) -> String {
        format!("{}{}{}", self.inner.path, separator, name)
    }

    // =========================================================================
    // Children
    // =========================================================================

    /// Returns the child node `name` without creating it.
    pub fn child(&self, name: &str) -> Option<Node> {
        match self.inner.entries.read().get(name) {
            Some(Entry::Node(node)) => Some(node.clone()),
            _ => None,
        }
    }

    /// Returns the child node `name`, creating it when the name is unused.
    pub fn child_or_create(&self, name: &str) -> Result<Node, TreeError> {
        if let Some(node) = self.child(name) {
            return Ok(node);
        }
        validate_name(name)?;
        let _guard = self.inner.write_lock.lock();
        let mut entries = self.inner.entries.write();
        match entries.get(name) {
            Some(Entry::Node(node)) => Ok(node.clone()),
            Some(other) => Err(TreeError::NameTaken {
                path: child_path(self.path(), name),
                kind: other.kind(),
            }),
            None => {
                let node = Node::with_path(child_path(self.path(), name));
                entries.insert(name.to_string(), Entry::Node(node.clone()));
                tracing::debug!("Created node {}", node.path());
                Ok(node)
            }
        }
    }

    /// Names of the child nodes, sorted.
    pub fn children(&self) -> Vec<String> {
        self.inner
            .entries
            .read()
            .iter()
            .filter(|(_, e)| matches!(e, Entry::Node(_)))
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Returns the kind of entry stored under `name`.
    pub fn entry_kind(&self, name: &str) -> Option<EntryKind> {
        self.inner.entries.read().get(name).map(Entry::kind)
    }

    /// Deletes a child node, property or method. A deleted node takes its
    /// whole subtree with it and drops every listener registered below it.
    pub fn remove(&self, name: &str) -> Option<EntryKind> {
        let _guard = self.inner.write_lock.lock();
        let removed = self.inner.entries.write().remove(name)?;
        if let Entry::Node(node) = &removed {
            node.detach();
        }
        tracing::debug!("Removed {} {}", removed.kind(), child_path(self.path(), name));
        Some(removed.kind())
    }

    fn detach(&self) {
        self.inner.listeners.clear();
        let children: Vec<Node> = self
            .inner
            .entries
            .read()
            .values()
            .filter_map(|e| match e {
                Entry::Node(node) => Some(node.clone()),
                _ => None,
            })
            .collect();
        for child in children {
            child.detach();
        }
    }

    // =========================================================================
    // Properties
    // =========================================================================

    /// Returns a snapshot of one property.
    pub fn property(&self, name: &str) -> Option<PropertyInfo> {
        match self.inner.entries.read().get(name) {
            Some(Entry::Property(prop)) => Some(prop.info(name)),
            _ => None,
        }
    }

    /// Snapshots of every property, sorted by name.
    pub fn properties(&self) -> Vec<PropertyInfo> {
        self.inner
            .entries
            .read()
            .iter()
            .filter_map(|(name, e)| match e {
                Entry::Property(prop) => Some(prop.info(name)),
                _ => None,
            })
            .collect()
    }

    /// Reads a property value through its getter and converts it.
    pub fn get(&self, name: &str) -> Option<Value> {
        self.property(name)
            .map(|info| lw3_protocol::convert_value(&info.value))
    }

    /// Assigns a property from the owning application.
    ///
    /// Creates a writable property when the name is unused and ignores the
    /// rw flag of an existing one. The setter, if any, is applied.
    pub fn set(&self, name: &str, value: impl Into<Value>) -> Result<PropertyInfo, TreeError> {
        let text = value.into().to_string();
        self.assign(name, &text, false, Some(Property::new(text.clone())))
    }

    /// Assigns a property on behalf of a remote `SET`.
    ///
    /// Fails with [`TreeError::NotFound`] if there is no such property and
    /// with [`TreeError::AccessDenied`] if it is read-only.
    pub fn write_property(&self, name: &str, value: &str) -> Result<PropertyInfo, TreeError> {
        self.assign(name, value, true, None)
    }

    /// Creates or replaces a property together with its options.
    ///
    /// Listeners are notified if the stored value differs from the previous
    /// one (or the property is new).
    pub fn define_property(&self, name: &str, property: Property) -> Result<(), TreeError> {
        validate_name(name)?;
        let _guard = self.inner.write_lock.lock();
        let changed = {
            let mut entries = self.inner.entries.write();
            let changed = match entries.get(name) {
                Some(Entry::Property(old)) => old.value != property.value,
                Some(other) => {
                    return Err(TreeError::NameTaken {
                        path: self.member_path('.', name),
                        kind: other.kind(),
                    })
                }
                None => true,
            };
            let value = property.value.clone();
            entries.insert(name.to_string(), Entry::Property(property));
            changed.then_some(value)
        };
        if let Some(value) = changed {
            self.inner.listeners.dispatch(self.path(), name, &value);
        }
        Ok(())
    }

    /// Changes the rw flag of a property.
    pub fn set_writable(&self, name: &str, rw: bool) -> Result<(), TreeError> {
        let _guard = self.inner.write_lock.lock();
        match self.inner.entries.write().get_mut(name) {
            Some(Entry::Property(prop)) => {
                prop.rw = rw;
                Ok(())
            }
            _ => Err(TreeError::NotFound {
                path: self.member_path('.', name),
            }),
        }
    }

    /// Changes the manual of a property or method.
    pub fn set_manual(&self, name: &str, manual: impl Into<String>) -> Result<(), TreeError> {
        let _guard = self.inner.write_lock.lock();
        match self.inner.entries.write().get_mut(name) {
            Some(Entry::Property(prop)) => prop.manual = manual.into(),
            Some(Entry::Method(method)) => method.manual = manual.into(),
            _ => {
                return Err(TreeError::NotFound {
                    path: child_path(self.path(), name),
                })
            }
        }
        Ok(())
    }

    pub(crate) fn assign(
        &self,
        name: &str,
        value: &str,
        remote: bool,
        create: Option<Property>,
    ) -> Result<PropertyInfo, TreeError> {
        let _guard = self.inner.write_lock.lock();

        // Run the setter without holding the entry lock so it may read the tree.
        let found = {
            let entries = self.inner.entries.read();
            match entries.get(name) {
                Some(Entry::Property(prop)) => {
                    if remote && !prop.rw {
                        return Err(TreeError::AccessDenied {
                            path: self.member_path('.', name),
                        });
                    }
                    Ok((prop.setter.clone(), prop.value.clone()))
                }
                Some(other) => Err(Some(other.kind())),
                None => Err(None),
            }
        };
        let (setter, current): (Option<Setter>, String) = match found {
            Ok(found) => found,
            Err(Some(kind)) if !remote => {
                return Err(TreeError::NameTaken {
                    path: self.member_path('.', name),
                    kind,
                })
            }
            Err(None) if create.is_some() => {
                if let Some(property) = create {
                    self.define_property(name, property)?;
                }
                return self.property(name).ok_or_else(|| TreeError::NotFound {
                    path: self.member_path('.', name),
                });
            }
            Err(_) => {
                return Err(TreeError::NotFound {
                    path: self.member_path('.', name),
                })
            }
        };

        let mut next = current.clone();
        match setter {
            Some(setter) => setter(value, &mut next).map_err(|code| TreeError::Rejected {
                path: self.member_path('.', name),
                code,
            })?,
            None => next = value.to_string(),
        }

        let info = {
            let mut entries = self.inner.entries.write();
            match entries.get_mut(name) {
                Some(Entry::Property(prop)) => {
                    prop.value = next.clone();
                    prop.info(name)
                }
                _ => {
                    return Err(TreeError::NotFound {
                        path: self.member_path('.', name),
                    })
                }
            }
        };
        if next != current {
            self.inner.listeners.dispatch(self.path(), name, &next);
        }
        Ok(info)
    }

    // =========================================================================
    // Methods
    // =========================================================================

    /// Creates or replaces a method.
    pub fn define_method(&self, name: &str, method: Method) -> Result<(), TreeError> {
        validate_name(name)?;
        let _guard = self.inner.write_lock.lock();
        let mut entries = self.inner.entries.write();
        match entries.get(name) {
            Some(Entry::Method(_)) | None => {
                entries.insert(name.to_string(), Entry::Method(method));
                Ok(())
            }
            Some(other) => Err(TreeError::NameTaken {
                path: self.member_path(':', name),
                kind: other.kind(),
            }),
        }
    }

    /// Names and manuals of every method, sorted by name.
    pub fn methods(&self) -> Vec<MethodInfo> {
        self.inner
            .entries
            .read()
            .iter()
            .filter_map(|(name, e)| match e {
                Entry::Method(m) => Some(MethodInfo {
                    name: name.clone(),
                    manual: m.manual.clone(),
                }),
                _ => None,
            })
            .collect()
    }

    /// Returns the manual of one method.
    pub fn method(&self, name: &str) -> Option<MethodInfo> {
        match self.inner.entries.read().get(name) {
            Some(Entry::Method(m)) => Some(MethodInfo {
                name: name.to_string(),
                manual: m.manual.clone(),
            }),
            _ => None,
        }
    }

    /// Starts a method invocation.
    ///
    /// The lookup happens now; the returned future runs the handler and holds
    /// no lock on the tree.
    pub fn call(&self, name: &str, args: Vec<Value>) -> Result<MethodFuture, TreeError> {
        let method = match self.inner.entries.read().get(name) {
            Some(Entry::Method(m)) => m.clone(),
            _ => {
                return Err(TreeError::NotFound {
                    path: self.member_path(':', name),
                })
            }
        };
        Ok(method.invoke(args))
    }

    // =========================================================================
    // Listeners
    // =========================================================================

    /// Registers a listener that fires `count` times (negative or zero for
    /// unlimited). Returns its id.
    pub fn add_listener(&self, rule: ListenerRule, callback: ListenerCallback, count: i64) -> u64 {
        self.inner.listeners.add(rule, callback, count)
    }

    /// Registers an unlimited listener for a `property=value` rule.
    pub fn on<F>(&self, rule: &str, callback: F) -> u64
    where
        F: Fn(&str, &str, &Value) + Send + Sync + 'static,
    {
        self.add_listener(ListenerRule::parse(rule), converted(callback), -1)
    }

    /// Registers a listener that is removed after its first invocation.
    pub fn once<F>(&self, rule: &str, callback: F) -> u64
    where
        F: Fn(&str, &str, &Value) + Send + Sync + 'static,
    {
        self.add_listener(ListenerRule::parse(rule), converted(callback), 1)
    }

    /// Removes a listener. Returns false if the id is unknown.
    pub fn remove_listener(&self, id: u64) -> bool {
        self.inner.listeners.remove(id)
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.len()
    }

    /// Resolves with the first change matching `rule`.
    ///
    /// Resolves to `None` if the node is deleted first.
    pub fn wait_for(&self, rule: &str) -> impl std::future::Future<Output = Option<ChangeEvent>> {
        let (tx, rx) = oneshot::channel();
        let tx = Mutex::new(Some(tx));
        self.once(rule, move |path, property, value| {
            if let Some(tx) = tx.lock().take() {
                let _ = tx.send(ChangeEvent {
                    path: path.to_string(),
                    property: property.to_string(),
                    value: value.clone(),
                });
            }
        });
        async move { rx.await.ok() }
    }
}

fn converted<F>(callback: F) -> ListenerCallback
where
    F: Fn(&str, &str, &Value) + Send + Sync + 'static,
{
    Arc::new(move |change: &Change| callback(&change.path, &change.property, &change.converted()))
}
