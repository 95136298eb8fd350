//! Change listeners registered on a node.

use lw3_protocol::{Change, Value};
use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Invoked with the change as it would be pushed to a remote subscriber.
pub type ListenerCallback = Arc<dyn Fn(&Change) + Send + Sync>;

/// Which changes a listener is interested in.
///
/// Parsed from `property=value`: an empty or `*` property matches any
/// property, an absent or empty value matches any value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListenerRule {
    pub property: Option<String>,
    pub value: Option<String>,
}

impl ListenerRule {
    /// A rule matching every change.
    pub fn any() -> Self {
        Self::default()
    }

    pub fn parse(rule: &str) -> Self {
        let (property, value) = match rule.find('=') {
            Some(eq) => (&rule[..eq], &rule[eq + 1..]),
            None => (rule, ""),
        };
        Self {
            property: (!property.is_empty() && property != "*").then(|| property.to_string()),
            value: (!value.is_empty()).then(|| value.to_string()),
        }
    }

    /// Checks a change against the rule. `value` is compared verbatim.
    pub fn matches(&self, property: &str, value: &str) -> bool {
        self.property.as_deref().map_or(true, |p| p == property)
            && self.value.as_deref().map_or(true, |v| v == value)
    }
}

/// A change delivered to [`crate::Node::wait_for`].
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub path: String,
    pub property: String,
    pub value: Value,
}

struct Listener {
    id: u64,
    rule: ListenerRule,
    callback: ListenerCallback,
    /// Remaining invocations; negative means unlimited.
    remaining: i64,
}

/// The listeners of one node.
pub(crate) struct ListenerSet {
    next_id: AtomicU64,
    entries: Mutex<Vec<Listener>>,
}

impl ListenerSet {
    pub(crate) fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn add(&self, rule: ListenerRule, callback: ListenerCallback, count: i64) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().push(Listener {
            id,
            rule,
            callback,
            remaining: if count == 0 { -1 } else { count },
        });
        id
    }

    pub(crate) fn remove(&self, id: u64) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|l| l.id != id);
        entries.len() != before
    }

    pub(crate) fn clear(&self) {
        self.entries.lock().clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Invokes every matching listener.
    ///
    /// Counts are consumed and exhausted listeners removed before any
    /// callback runs; callbacks run without the listener lock held, so they
    /// may add or remove listeners. A panicking callback is logged and does
    /// not stop delivery to the others.
    pub(crate) fn dispatch(&self, path: &str, property: &str, value: &str) {
        let callbacks: Vec<ListenerCallback> = {
            let mut entries = self.entries.lock();
            let mut matched = Vec::new();
            for listener in entries.iter_mut() {
                if listener.remaining != 0 && listener.rule.matches(property, value) {
                    matched.push(listener.callback.clone());
                    if listener.remaining > 0 {
                        listener.remaining -= 1;
                    }
                }
            }
            entries.retain(|l| l.remaining != 0);
            matched
        };
        if callbacks.is_empty() {
            return;
        }

        let change = Change::new(path, property, value);
        for callback in callbacks {
            let result = catch_unwind(AssertUnwindSafe(|| callback(&change)));
            if result.is_err() {
                tracing::warn!("Listener on {} panicked handling {}", path, property);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collector() -> (ListenerCallback, Arc<Mutex<Vec<(String, Value)>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let cb: ListenerCallback = Arc::new(move |change: &Change| {
            sink.lock().push((change.property.clone(), change.converted()));
        });
        (cb, seen)
    }

    #[test]
    fn test_rule_parse() {
        assert_eq!(ListenerRule::parse(""), ListenerRule::any());
        assert_eq!(ListenerRule::parse("*"), ListenerRule::any());
        assert_eq!(
            ListenerRule::parse("SignalPresent=true"),
            ListenerRule {
                property: Some("SignalPresent".into()),
                value: Some("true".into()),
            }
        );
        assert_eq!(
            ListenerRule::parse("Text"),
            ListenerRule {
                property: Some("Text".into()),
                value: None,
            }
        );
        assert_eq!(
            ListenerRule::parse("*=1"),
            ListenerRule {
                property: None,
                value: Some("1".into()),
            }
        );
    }

    #[test]
    fn test_filtering() {
        let set = ListenerSet::new();
        let (cb, seen) = collector();
        set.add(ListenerRule::parse("SignalPresent=true"), cb, -1);

        set.dispatch("/V", "test1", "x");
        set.dispatch("/V", "SignalPresent", "false");
        set.dispatch("/V", "SignalPresent", "true");

        assert_eq!(
            *seen.lock(),
            vec![("SignalPresent".to_string(), Value::Bool(true))]
        );
    }

    #[test]
    fn test_count_exhaustion_removes_listener() {
        let set = ListenerSet::new();
        let (cb, seen) = collector();
        set.add(ListenerRule::any(), cb, 2);

        set.dispatch("/V", "a", "1");
        set.dispatch("/V", "b", "2");
        set.dispatch("/V", "c", "3");

        assert_eq!(seen.lock().len(), 2);
        assert_eq!(set.len(), 0);
    }

    #[test]
    fn test_remove() {
        let set = ListenerSet::new();
        let (cb, seen) = collector();
        let id = set.add(ListenerRule::any(), cb, -1);
        assert!(set.remove(id));
        assert!(!set.remove(id));
        set.dispatch("/V", "a", "1");
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn test_panicking_listener_does_not_block_others() {
        let set = ListenerSet::new();
        set.add(
            ListenerRule::any(),
            Arc::new(|_: &Change| panic!("listener failure")),
            -1,
        );
        let (cb, seen) = collector();
        set.add(ListenerRule::any(), cb, -1);

        set.dispatch("/V", "a", "1");
        assert_eq!(seen.lock().len(), 1);
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_callback_may_modify_listeners() {
        let set = Arc::new(ListenerSet::new());
        let inner = set.clone();
        set.add(
            ListenerRule::any(),
            Arc::new(move |_: &Change| {
                inner.clear();
            }),
            -1,
        );
        set.dispatch("/V", "a", "1");
        assert_eq!(set.len(), 0);
    }
}
