// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Distributed publish-subscribe topic space (spec.md §4.4).
//!
//! A topic trie keyed by `/`-separated segments, each node holding at
//! most one retained value, one metadata JSON blob, and a subscriber
//! list. Unlike the link/transport layers, this module leans on `std`
//! collections (`Vec`, `String`) rather than fixed buffers — the
//! original system is explicitly JSON/string-heavy here, mirroring the
//! split in the teacher workspace between the no-heap `hdds-micro` link
//! layer and the heap-using `hdds` core crate's topic/entity registries
//! (§4.4a).

pub mod ringbuf;

use ringbuf::RingBuf;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Per-topic metadata document (spec.md §4.4's `meta_value` keys).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TopicMeta {
    /// Value type, e.g. `"u32"`, `"str"`, `"json"`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dtype: Option<String>,
    /// One-line human description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub brief: Option<String>,
    /// Multi-line human description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Default value, JSON-encoded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
    /// Enumerated legal values, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<serde_json::Value>>,
    /// `[min, max]` legal range, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub range: Option<[f64; 2]>,
    /// `printf`-style display format hint.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    /// Bitwise OR of [`value_flags`] describing legal publish flags.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flags: Option<u8>,
}

impl TopicMeta {
    /// Parse a metadata JSON document.
    pub fn from_json(s: &str) -> Option<Self> {
        serde_json::from_str(s).ok()
    }

    /// Serialize to its wire JSON form.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Tagged union of publishable values (spec.md §3).
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// No value / tombstone.
    Null,
    /// UTF-8 string.
    Str(String),
    /// JSON-encoded document.
    Json(String),
    /// Opaque binary blob.
    Bin(Vec<u8>),
    /// 32-bit float.
    F32(f32),
    /// 64-bit float.
    F64(f64),
    /// Unsigned 8/16/32/64-bit integers.
    U8(u8),
    /// See [`Value::U8`].
    U16(u16),
    /// See [`Value::U8`].
    U32(u32),
    /// See [`Value::U8`].
    U64(u64),
    /// Signed 8/16/32/64-bit integers.
    I8(i8),
    /// See [`Value::I8`].
    I16(i16),
    /// See [`Value::I8`].
    I32(i32),
    /// See [`Value::I8`].
    I64(i64),
}

/// Publish-time flags (spec.md §3).
pub mod value_flags {
    /// Store the value as the topic's current retained value.
    pub const RETAIN: u8 = 0x01;
    /// The pointer/owned data is caller-owned and valid for the
    /// lifetime this flag combination implies (see spec.md §9's
    /// ownership-regime note); for this owned-`Value` representation the
    /// distinction collapses to "don't copy into the ring buffer".
    pub const CONST: u8 = 0x02;
}

/// A value plus its publish-time metadata (spec.md §3 "op/app/size").
#[derive(Debug, Clone, PartialEq)]
pub struct PublishValue {
    /// The value payload.
    pub value: Value,
    /// Bitwise OR of [`value_flags`].
    pub flags: u8,
    /// Caller-assigned opcode, forwarded unmodified.
    pub op: u8,
    /// Caller-assigned application byte, forwarded unmodified.
    pub app: u8,
}

impl PublishValue {
    /// Construct a plain (no flags) value.
    pub fn new(value: Value) -> Self {
        Self {
            value,
            flags: 0,
            op: 0,
            app: 0,
        }
    }

    /// Construct a retained value.
    pub fn retained(value: Value) -> Self {
        Self {
            value,
            flags: value_flags::RETAIN,
            op: 0,
            app: 0,
        }
    }

    fn is_retain(&self) -> bool {
        self.flags & value_flags::RETAIN != 0
    }

    fn is_const(&self) -> bool {
        self.flags & value_flags::CONST != 0
    }

    fn byte_len(&self) -> usize {
        match &self.value {
            Value::Null => 0,
            Value::Str(s) | Value::Json(s) => s.len(),
            Value::Bin(b) => b.len(),
            _ => 8,
        }
    }
}

/// Subscriber flags (spec.md §3).
pub mod sub_flags {
    /// Receive retained values on subscribe.
    pub const RETAIN: u8 = 0x01;
    /// Do not receive ordinary publications.
    pub const NOPUB: u8 = 0x02;
    /// Receive `?` query requests.
    pub const REQ: u8 = 0x04;
    /// Receive `?` query responses.
    pub const RSP: u8 = 0x08;
}

/// Opaque subscriber handle, stable for the life of the subscription.
pub type SubscriberId = u64;

type Callback = Box<dyn FnMut(&str, &PublishValue)>;

struct SubscriberEntry {
    id: SubscriberId,
    flags: u8,
    callback: Callback,
}

#[derive(Default)]
struct Node {
    retained: Option<PublishValue>,
    meta: Option<TopicMeta>,
    subscribers: Vec<SubscriberEntry>,
    children: Vec<(String, Node)>,
}

impl Node {
    fn child_mut(&mut self, name: &str) -> &mut Node {
        if let Some(pos) = self.children.iter().position(|(n, _)| n == name) {
            &mut self.children[pos].1
        } else {
            self.children.push((name.to_string(), Node::default()));
            &mut self.children.last_mut().unwrap().1
        }
    }

    fn child(&self, name: &str) -> Option<&Node> {
        self.children.iter().find(|(n, _)| n == name).map(|(_, c)| c)
    }
}

enum Pending {
    Publish {
        topic: String,
        value: PublishValue,
        src: Option<SubscriberId>,
    },
    RetainSnapshot {
        topic: String,
        value: PublishValue,
        /// Topic the subscriber is registered on — the snapshot's own
        /// `topic` may be a descendant, so the subscriber must be looked
        /// up here, not at `topic`'s node.
        root_topic: String,
        target: SubscriberId,
    },
}

/// One node in the polytree of pub-sub instances (spec.md §4.4/§4.5).
pub struct PubSub {
    root: Node,
    owned_prefix: String,
    queue: VecDeque<Pending>,
    ring: RingBuf,
    next_sub_id: SubscriberId,
    on_publish: Option<Box<dyn FnMut()>>,
}

fn split_path(topic: &str) -> Vec<&str> {
    topic.split('/').filter(|s| !s.is_empty()).collect()
}

enum Suffix {
    None,
    Meta,
    Query,
    Error,
}

fn split_suffix(topic: &str) -> (&str, Suffix) {
    match topic.chars().last() {
        Some('$') => (&topic[..topic.len() - 1], Suffix::Meta),
        Some('?') => (&topic[..topic.len() - 1], Suffix::Query),
        Some('#') => (&topic[..topic.len() - 1], Suffix::Error),
        _ => (topic, Suffix::None),
    }
}

impl PubSub {
    /// Create a new instance that owns `prefix` of the topic tree
    /// (`_/topic/prefix`'s retained value).
    pub fn new(prefix: impl Into<String>, ring_capacity: usize) -> Self {
        let mut ps = Self {
            root: Node::default(),
            owned_prefix: prefix.into(),
            queue: VecDeque::new(),
            ring: RingBuf::new(ring_capacity),
            next_sub_id: 1,
            on_publish: None,
        };
        let prefix_value = PublishValue::retained(Value::Str(ps.owned_prefix.clone()));
        ps.node_for_mut("_/topic/prefix").retained = Some(prefix_value);
        ps
    }

    /// Register a callback fired every time `publish` enqueues an update
    /// (used to wake a processing thread; spec.md §4.4).
    pub fn set_on_publish(&mut self, cb: impl FnMut() + 'static) {
        self.on_publish = Some(Box::new(cb));
    }

    fn node_for_mut(&mut self, topic: &str) -> &mut Node {
        let mut node = &mut self.root;
        for seg in split_path(topic) {
            node = node.child_mut(seg);
        }
        node
    }

    fn node_for(&self, topic: &str) -> Option<&Node> {
        let mut node = &self.root;
        for seg in split_path(topic) {
            node = node.child(seg)?;
        }
        Some(node)
    }

    /// Publish `value` to `topic`. `src` identifies the publisher so the
    /// same subscriber never receives its own update back (loop
    /// prevention for bridge subscribers, spec.md §5).
    pub fn publish(
        &mut self,
        topic: &str,
        value: PublishValue,
        src: Option<SubscriberId>,
    ) -> crate::error::Result<()> {
        let (base, suffix) = split_suffix(topic);
        match suffix {
            Suffix::Meta => return self.publish_meta(base, value),
            Suffix::Query => return self.publish_query(base),
            // `X#` error reports are owner-originated but routed like any
            // other topic: keep the full `#`-suffixed string as the topic.
            Suffix::Error | Suffix::None => {}
        }

        if !value.is_const() && value.byte_len() > 0 {
            let bytes = match &value.value {
                Value::Bin(b) => b.clone(),
                Value::Str(s) | Value::Json(s) => s.clone().into_bytes(),
                _ => Vec::new(),
            };
            if !bytes.is_empty() && !self.ring.push(&bytes) {
                self.publish_error(base, crate::error::Error::NotEnoughMemory);
                return Err(crate::error::Error::NotEnoughMemory);
            }
        }

        if value.is_retain() {
            self.node_for_mut(topic).retained = Some(value.clone());
        }

        self.queue.push_back(Pending::Publish {
            topic: topic.to_string(),
            value,
            src,
        });
        if let Some(cb) = self.on_publish.as_mut() {
            cb();
        }
        Ok(())
    }

    fn publish_error(&mut self, base: &str, err: crate::error::Error) {
        let code = match err {
            crate::error::Error::NotEnoughMemory => 8u32,
            _ => u32::MAX,
        };
        let topic = format!("{base}#");
        self.queue.push_back(Pending::Publish {
            topic,
            value: PublishValue::new(Value::U32(code)),
            src: None,
        });
    }

    fn publish_meta(&mut self, base: &str, value: PublishValue) -> crate::error::Result<()> {
        if matches!(value.value, Value::Null) {
            self.enumerate_meta(base);
            return Ok(());
        }
        if let Value::Json(json) = &value.value {
            if let Some(meta) = TopicMeta::from_json(json) {
                self.node_for_mut(base).meta = Some(meta);
            } else {
                return Err(crate::error::Error::SyntaxError);
            }
        }
        Ok(())
    }

    /// This topic's metadata document, if one was ever set.
    pub fn meta_get(&self, topic: &str) -> Option<&TopicMeta> {
        self.node_for(topic).and_then(|n| n.meta.as_ref())
    }

    fn enumerate_meta(&mut self, base: &str) {
        let mut stack = vec![base.to_string()];
        while let Some(topic) = stack.pop() {
            if let Some(node) = self.node_for(&topic) {
                if let Some(meta) = node.meta.clone() {
                    self.queue.push_back(Pending::Publish {
                        topic: format!("{topic}$"),
                        value: PublishValue::new(Value::Json(meta.to_json())),
                        src: None,
                    });
                }
                let child_names: Vec<String> = node
                    .children
                    .iter()
                    .map(|(n, _)| format!("{topic}/{n}"))
                    .collect();
                stack.extend(child_names);
            }
        }
    }

    fn publish_query(&mut self, base: &str) -> crate::error::Result<()> {
        if let Some(retained) = self.node_for(base).and_then(|n| n.retained.clone()) {
            self.queue.push_back(Pending::Publish {
                topic: base.to_string(),
                value: retained,
                src: None,
            });
        }
        Ok(())
    }

    /// Subscribe to `topic`. Lazily creates the node if it does not
    /// exist. With [`sub_flags::RETAIN`], every retained value already
    /// present at `topic` or below is queued for delivery to this
    /// subscriber alone, parent before child in creation order, ahead of
    /// any new publications (spec.md §4.4).
    pub fn subscribe(
        &mut self,
        topic: &str,
        flags: u8,
        callback: impl FnMut(&str, &PublishValue) + 'static,
    ) -> SubscriberId {
        let id = self.next_sub_id;
        self.next_sub_id += 1;

        self.node_for_mut(topic).subscribers.push(SubscriberEntry {
            id,
            flags,
            callback: Box::new(callback),
        });

        if flags & sub_flags::RETAIN != 0 {
            self.queue_retained_subtree(topic, id);
        }
        id
    }

    fn queue_retained_subtree(&mut self, topic: &str, target: SubscriberId) {
        let mut stack = vec![topic.to_string()];
        let mut ordered = Vec::new();
        while let Some(t) = stack.pop() {
            if let Some(node) = self.node_for(&t) {
                ordered.push(t.clone());
                let mut child_topics: Vec<String> = node
                    .children
                    .iter()
                    .map(|(n, _)| if t.is_empty() { n.clone() } else { format!("{t}/{n}") })
                    .collect();
                child_topics.reverse();
                stack.extend(child_topics);
            }
        }
        for t in ordered {
            if let Some(value) = self.node_for(&t).and_then(|n| n.retained.clone()) {
                self.queue.push_back(Pending::RetainSnapshot {
                    topic: t,
                    value,
                    root_topic: topic.to_string(),
                    target,
                });
            }
        }
    }

    /// Remove the subscription `id` from `topic`. Synchronous: after
    /// return, its callback is guaranteed not to run again.
    pub fn unsubscribe(&mut self, topic: &str, id: SubscriberId) {
        if let Some(node) = self.node_for_mut_opt(topic) {
            node.subscribers.retain(|s| s.id != id);
        }
        self.queue.retain(|p| !matches!(p, Pending::RetainSnapshot { target, .. } if *target == id));
    }

    fn node_for_mut_opt(&mut self, topic: &str) -> Option<&mut Node> {
        let mut node = &mut self.root;
        for seg in split_path(topic) {
            node = node.children.iter_mut().find(|(n, _)| n == seg).map(|(_, c)| c)?;
        }
        Some(node)
    }

    /// Remove every subscription this instance holds (spec.md §4.5:
    /// disconnect triggers unsubscribe-from-all).
    pub fn unsubscribe_from_all(&mut self) {
        fn clear(node: &mut Node) {
            node.subscribers.clear();
            for (_, child) in node.children.iter_mut() {
                clear(child);
            }
        }
        clear(&mut self.root);
        self.queue.retain(|p| !matches!(p, Pending::RetainSnapshot { .. }));
    }

    /// Synchronously read the current retained value for `topic`.
    pub fn query(&self, topic: &str) -> Option<&PublishValue> {
        self.node_for(topic).and_then(|n| n.retained.as_ref())
    }

    /// Dispatch every queued update to matching subscribers. Never
    /// called inline from `publish`/`subscribe` (spec.md §4.4).
    pub fn process(&mut self) {
        let pending: Vec<Pending> = self.queue.drain(..).collect();
        for item in pending {
            match item {
                Pending::Publish { topic, value, src } => {
                    if let Some(node) = self.node_for_mut_opt(&topic) {
                        for sub in node.subscribers.iter_mut() {
                            if Some(sub.id) == src {
                                continue;
                            }
                            if sub.flags & sub_flags::NOPUB != 0 {
                                continue;
                            }
                            (sub.callback)(&topic, &value);
                        }
                    }
                }
                Pending::RetainSnapshot {
                    topic,
                    value,
                    root_topic,
                    target,
                } => {
                    if let Some(node) = self.node_for_mut_opt(&root_topic) {
                        if let Some(sub) = node.subscribers.iter_mut().find(|s| s.id == target) {
                            (sub.callback)(&topic, &value);
                        }
                    }
                }
            }
        }
    }

    /// This instance's owned topic prefix (`_/topic/prefix`).
    pub fn owned_prefix(&self) -> &str {
        &self.owned_prefix
    }
}
