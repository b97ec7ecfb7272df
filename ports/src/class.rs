//! Port classes: the behavior vector shared by every port of a kind.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::port::Port;

static NEXT_CLASS_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClassId(pub(crate) u64);

/// An inclusive-exclusive message-id range, `[start, end)`, that may
/// proceed even while its class is inhibited. Mirrors
/// `struct ports_msg_id_range`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgIdRange {
    pub start: i32,
    pub end: i32,
}

impl MsgIdRange {
    pub fn contains(&self, msg_id: i32) -> bool {
        msg_id >= self.start && msg_id < self.end
    }
}

/// The message id the runtime reserves for `interrupt_operation`; every
/// class is uninhibitable for it by default so an inhibited port can still
/// be told to drop its `cancel_threshold`.
pub const INTERRUPT_OPERATION_MSG_ID: i32 = 1;

fn default_uninhibitable_ranges() -> Vec<MsgIdRange> {
    vec![MsgIdRange { start: INTERRUPT_OPERATION_MSG_ID, end: INTERRUPT_OPERATION_MSG_ID + 1 }]
}

/// A group of ports sharing cleanup semantics, inhibition state, and an
/// uninhibitable-message-id list.
pub struct PortClass {
    pub(crate) id: ClassId,
    pub(crate) clean: Option<Box<dyn Fn(&Port) + Send + Sync>>,
    pub(crate) drop_weak: Option<Box<dyn Fn(&Port) + Send + Sync>>,
    pub(crate) uninhibitable: Vec<MsgIdRange>,
}

impl PortClass {
    pub fn id(&self) -> ClassId {
        self.id
    }

    pub fn has_drop_weak(&self) -> bool {
        self.drop_weak.is_some()
    }

    pub(crate) fn is_uninhibitable(&self, msg_id: i32) -> bool {
        self.uninhibitable.iter().any(|r| r.contains(msg_id))
    }
}

/// Builder for a [`PortClass`]; mirrors `ports_create_class`, with the
/// uninhibitable-range list exposed instead of hard-wired so a caller can
/// extend the default (interrupt-operation only) list.
pub struct ClassBuilder {
    clean: Option<Box<dyn Fn(&Port) + Send + Sync>>,
    drop_weak: Option<Box<dyn Fn(&Port) + Send + Sync>>,
    uninhibitable: Vec<MsgIdRange>,
}

impl Default for ClassBuilder {
    fn default() -> Self {
        ClassBuilder { clean: None, drop_weak: None, uninhibitable: default_uninhibitable_ranges() }
    }
}

impl ClassBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clean_routine(mut self, f: impl Fn(&Port) + Send + Sync + 'static) -> Self {
        self.clean = Some(Box::new(f));
        self
    }

    pub fn drop_weak_routine(mut self, f: impl Fn(&Port) + Send + Sync + 'static) -> Self {
        self.drop_weak = Some(Box::new(f));
        self
    }

    pub fn uninhibitable_range(mut self, start: i32, end: i32) -> Self {
        self.uninhibitable.push(MsgIdRange { start, end });
        self
    }

    pub fn build(self) -> PortClass {
        PortClass {
            id: ClassId(NEXT_CLASS_ID.fetch_add(1, Ordering::Relaxed)),
            clean: self.clean,
            drop_weak: self.drop_weak,
            uninhibitable: self.uninhibitable,
        }
    }
}
