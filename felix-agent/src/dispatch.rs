//! Path dispatcher: a trie of key-pattern segments that turns store events
//! into typed handler calls (§4.8).
//!
//! Patterns use `<name>` segments for captures, mirroring the store key
//! schema in §6 verbatim, e.g.
//! `/calico/v1/host/<host>/workload/<orch>/<wl>/endpoint/<ep>`. Handlers are
//! registered as trait objects (the handler set is heterogeneous: tag
//! updates, endpoint updates, config keys, ready flag) rather than a single
//! closure type, the same way `felix_rt`'s broker registers per-actor
//! mailbox senders behind one trait object per actor.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;

/// Named captures accumulated while walking the trie, e.g. `host -> "h1"`.
pub type Captures = BTreeMap<String, String>;

#[async_trait]
pub trait SetHandler: Send + Sync {
    async fn on_set(&self, captures: &Captures, value: &str);
}

#[async_trait]
pub trait DelHandler: Send + Sync {
    async fn on_del(&self, captures: &Captures);
}

/// What happened to the key being dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchAction {
    Set,
    Delete,
}

#[derive(Default)]
struct Node {
    literal_children: HashMap<String, Node>,
    wildcard_child: Option<(String, Box<Node>)>,
    on_set: Option<Arc<dyn SetHandler>>,
    on_del: Option<Arc<dyn DelHandler>>,
}

/// A trie of registered key patterns, dispatching store events to the
/// deepest node reached by walking the event's key segment by segment.
#[derive(Default)]
pub struct PathDispatcher {
    root: Node,
}

impl PathDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_set(&mut self, pattern: &str, handler: Arc<dyn SetHandler>) {
        let node = self.walk_or_create(pattern);
        node.on_set = Some(handler);
    }

    pub fn register_del(&mut self, pattern: &str, handler: Arc<dyn DelHandler>) {
        let node = self.walk_or_create(pattern);
        node.on_del = Some(handler);
    }

    /// Register both actions against the same pattern with one handler
    /// implementing both traits.
    pub fn register<H>(&mut self, pattern: &str, handler: Arc<H>)
    where
        H: SetHandler + DelHandler + 'static,
    {
        let set_handler: Arc<dyn SetHandler> = handler.clone();
        let del_handler: Arc<dyn DelHandler> = handler;
        self.register_set(pattern, set_handler);
        self.register_del(pattern, del_handler);
    }

    fn walk_or_create(&mut self, pattern: &str) -> &mut Node {
        let mut node = &mut self.root;
        for segment in pattern.split('/').filter(|s| !s.is_empty()) {
            if let Some(name) = wildcard_name(segment) {
                if node.wildcard_child.is_none() {
                    node.wildcard_child = Some((name.to_string(), Box::new(Node::default())));
                }
                node = &mut node.wildcard_child.as_mut().expect("just inserted").1;
            } else {
                node = node
                    .literal_children
                    .entry(segment.to_string())
                    .or_default();
            }
        }
        node
    }

    /// Walk the trie segment by segment for `key`, accumulating captures,
    /// and invoke the handler at the node reached after consuming every
    /// segment of `key`. A directory-level deletion (a key shorter than
    /// any registered leaf pattern under it) lands on the internal node
    /// that corresponds to that directory, invoking its `on_del` if
    /// registered. No match at all is a silent no-op.
    pub async fn dispatch(&self, action: DispatchAction, key: &str, value: Option<&str>) {
        let mut node = &self.root;
        let mut captures = Captures::new();

        for segment in key.split('/').filter(|s| !s.is_empty()) {
            if let Some(child) = node.literal_children.get(segment) {
                node = child;
                continue;
            }
            if let Some((name, child)) = &node.wildcard_child {
                captures.insert(name.clone(), segment.to_string());
                node = child;
                continue;
            }
            return;
        }

        match action {
            DispatchAction::Set => {
                if let Some(handler) = &node.on_set {
                    handler.on_set(&captures, value.unwrap_or_default()).await;
                }
            }
            DispatchAction::Delete => {
                if let Some(handler) = &node.on_del {
                    handler.on_del(&captures).await;
                }
            }
        }
    }
}

fn wildcard_name(segment: &str) -> Option<&str> {
    segment.strip_prefix('<').and_then(|s| s.strip_suffix('>'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct RecordingHandler {
        sets: Mutex<Vec<(Captures, String)>>,
        dels: Mutex<Vec<Captures>>,
    }

    impl RecordingHandler {
        fn new() -> Self {
            Self {
                sets: Mutex::new(Vec::new()),
                dels: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl SetHandler for RecordingHandler {
        async fn on_set(&self, captures: &Captures, value: &str) {
            self.sets.lock().push((captures.clone(), value.to_string()));
        }
    }

    #[async_trait]
    impl DelHandler for RecordingHandler {
        async fn on_del(&self, captures: &Captures) {
            self.dels.lock().push(captures.clone());
        }
    }

    #[tokio::test]
    async fn dispatches_leaf_pattern_with_captures() {
        let handler = Arc::new(RecordingHandler::new());
        let mut dispatcher = PathDispatcher::new();
        dispatcher.register(
            "/calico/v1/host/<host>/workload/<orch>/<wl>/endpoint/<ep>",
            handler.clone(),
        );

        dispatcher
            .dispatch(
                DispatchAction::Set,
                "/calico/v1/host/h1/workload/k8s/w1/endpoint/e1",
                Some("{}"),
            )
            .await;

        let sets = handler.sets.lock();
        assert_eq!(sets.len(), 1);
        assert_eq!(sets[0].0.get("host").unwrap(), "h1");
        assert_eq!(sets[0].0.get("orch").unwrap(), "k8s");
        assert_eq!(sets[0].0.get("wl").unwrap(), "w1");
        assert_eq!(sets[0].0.get("ep").unwrap(), "e1");
        assert_eq!(sets[0].1, "{}");
    }

    #[tokio::test]
    async fn directory_level_delete_invokes_internal_node_handler() {
        let leaf_handler = Arc::new(RecordingHandler::new());
        let dir_handler = Arc::new(RecordingHandler::new());
        let mut dispatcher = PathDispatcher::new();
        dispatcher.register(
            "/calico/v1/host/<host>/workload/<orch>/<wl>/endpoint/<ep>",
            leaf_handler.clone(),
        );
        dispatcher.register_del(
            "/calico/v1/host/<host>/workload/<orch>/<wl>/endpoint",
            dir_handler.clone(),
        );

        dispatcher
            .dispatch(
                DispatchAction::Delete,
                "/calico/v1/host/h1/workload/k8s/w1/endpoint",
                None,
            )
            .await;

        assert_eq!(dir_handler.dels.lock().len(), 1);
        assert!(leaf_handler.dels.lock().is_empty());
    }

    #[tokio::test]
    async fn unmatched_key_is_silently_ignored() {
        let handler = Arc::new(RecordingHandler::new());
        let mut dispatcher = PathDispatcher::new();
        dispatcher.register("/calico/v1/Ready", handler.clone());

        dispatcher
            .dispatch(DispatchAction::Set, "/calico/v1/unknown/path", Some("x"))
            .await;

        assert!(handler.sets.lock().is_empty());
    }

    #[tokio::test]
    async fn literal_segments_take_precedence_over_wildcard_siblings() {
        let literal_handler = Arc::new(RecordingHandler::new());
        let wildcard_handler = Arc::new(RecordingHandler::new());
        let mut dispatcher = PathDispatcher::new();
        dispatcher.register("/calico/v1/Ready", literal_handler.clone());
        dispatcher.register("/calico/v1/<param>", wildcard_handler.clone());

        dispatcher
            .dispatch(DispatchAction::Set, "/calico/v1/Ready", Some("true"))
            .await;

        assert_eq!(literal_handler.sets.lock().len(), 1);
        assert!(wildcard_handler.sets.lock().is_empty());
    }
}
