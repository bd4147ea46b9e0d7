//! Change records produced by diffing view caches, and the events raised to
//! event registrations.

use crate::error::DatabaseError;
use crate::query::QuerySpec;
use crate::snapshot::Node;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChangeType {
    ChildRemoved,
    ChildAdded,
    ChildMoved,
    ChildChanged,
    Value,
}

impl ChangeType {
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeType::ChildRemoved => "child_removed",
            ChangeType::ChildAdded => "child_added",
            ChangeType::ChildMoved => "child_moved",
            ChangeType::ChildChanged => "child_changed",
            ChangeType::Value => "value",
        }
    }
}

#[derive(Clone, Debug)]
pub struct Change {
    pub kind: ChangeType,
    pub child_key: Option<String>,
    pub node: Node,
    pub old_node: Option<Node>,
}

impl Change {
    pub fn value(node: Node) -> Self {
        Self {
            kind: ChangeType::Value,
            child_key: None,
            node,
            old_node: None,
        }
    }

    pub fn child_added(key: impl Into<String>, node: Node) -> Self {
        Self {
            kind: ChangeType::ChildAdded,
            child_key: Some(key.into()),
            node,
            old_node: None,
        }
    }

    pub fn child_removed(key: impl Into<String>, old_node: Node) -> Self {
        Self {
            kind: ChangeType::ChildRemoved,
            child_key: Some(key.into()),
            node: Node::empty(),
            old_node: Some(old_node),
        }
    }

    pub fn child_changed(key: impl Into<String>, node: Node, old_node: Node) -> Self {
        Self {
            kind: ChangeType::ChildChanged,
            child_key: Some(key.into()),
            node,
            old_node: Some(old_node),
        }
    }

    pub fn child_moved(key: impl Into<String>, node: Node) -> Self {
        Self {
            kind: ChangeType::ChildMoved,
            child_key: Some(key.into()),
            node,
            old_node: None,
        }
    }
}

/// Which change kinds a registration wants delivered.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventInterest {
    /// `value` events only.
    Value,
    /// `child_*` events only.
    Children,
    /// Everything.
    All,
}

/// A listener attached to a view. Identity is the id; the sync tree hands
/// matching events back to the caller to raise.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventRegistration {
    id: u64,
    interest: EventInterest,
}

impl EventRegistration {
    pub fn new(id: u64, interest: EventInterest) -> Self {
        Self { id, interest }
    }

    pub fn value(id: u64) -> Self {
        Self::new(id, EventInterest::Value)
    }

    pub fn children(id: u64) -> Self {
        Self::new(id, EventInterest::Children)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn responds_to(&self, kind: ChangeType) -> bool {
        match self.interest {
            EventInterest::All => true,
            EventInterest::Value => kind == ChangeType::Value,
            EventInterest::Children => kind != ChangeType::Value,
        }
    }
}

#[derive(Clone, Debug)]
pub struct DataEvent {
    pub kind: ChangeType,
    pub query: QuerySpec,
    pub registration_id: u64,
    pub child_key: Option<String>,
    pub snapshot: Node,
    pub old_snapshot: Option<Node>,
}

#[derive(Clone, Debug)]
pub struct CancelEvent {
    pub query: QuerySpec,
    pub registration_id: u64,
    pub error: DatabaseError,
}

/// What the sync tree returns for the caller to raise, in order.
#[derive(Clone, Debug)]
pub enum Event {
    Data(DataEvent),
    Cancel(CancelEvent),
}

impl Event {
    pub fn as_data(&self) -> Option<&DataEvent> {
        match self {
            Event::Data(event) => Some(event),
            Event::Cancel(_) => None,
        }
    }

    pub fn as_cancel(&self) -> Option<&CancelEvent> {
        match self {
            Event::Cancel(event) => Some(event),
            Event::Data(_) => None,
        }
    }
}
