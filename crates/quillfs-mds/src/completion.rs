//! Completion callbacks and the counting gather
//!
//! The MDS event loop is single threaded; suspension is explicit. A
//! subsystem that cannot satisfy a request immediately parks a
//! [`Completion`] on one of its waiter lists and fires it when the
//! prerequisite state change happens. Completions fire exactly once.

use std::cell::RefCell;
use std::rc::Rc;

/// A one-shot callback fired when an asynchronous prerequisite is met.
pub type Completion = Box<dyn FnOnce() + 'static>;

/// Counting latch over a parent completion.
///
/// `sub()` mints child completions before the gather is activated;
/// the parent fires when the last child has fired. Activating with no
/// children (or after every child already fired) fires the parent
/// immediately.
pub struct Gather {
    inner: Rc<RefCell<Inner>>,
}

struct Inner {
    pending: usize,
    activated: bool,
    parent: Option<Completion>,
}

impl Gather {
    /// Create a gather that will fire `parent` once all children fire.
    pub fn new(parent: Completion) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                pending: 0,
                activated: false,
                parent: Some(parent),
            })),
        }
    }

    /// Mint a child completion. Children may only be minted before
    /// activation.
    pub fn sub(&self) -> Completion {
        let mut inner = self.inner.borrow_mut();
        debug_assert!(!inner.activated, "gather child minted after activation");
        inner.pending += 1;
        drop(inner);

        let shared = Rc::clone(&self.inner);
        Box::new(move || {
            let parent = {
                let mut inner = shared.borrow_mut();
                inner.pending -= 1;
                if inner.pending == 0 && inner.activated {
                    inner.parent.take()
                } else {
                    None
                }
            };
            if let Some(parent) = parent {
                parent();
            }
        })
    }

    /// Seal the child count. If no children remain outstanding the parent
    /// fires now, otherwise the last child to fire delivers it.
    pub fn activate(self) {
        let parent = {
            let mut inner = self.inner.borrow_mut();
            inner.activated = true;
            if inner.pending == 0 {
                inner.parent.take()
            } else {
                None
            }
        };
        if let Some(parent) = parent {
            parent();
        }
    }
}
