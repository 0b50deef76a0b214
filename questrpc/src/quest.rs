//! Per-invocation capability composition.
//!
//! Each handler invocation runs inside a [`Quest`] assembled from an ordered
//! list of capability attrs: the connection's [`Session`](crate::Session)
//! singleton, an optional per-invocation
//! [`Subscription`](crate::Subscription), and any application attrs declared
//! through [`AttrSpec`]. After the handler completes (return or error) the
//! quest is torn down in reverse attachment order with a commit/rollback
//! flag. Teardown also runs when the owning task is aborted, via `Drop`.

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;

use crate::server::{Session, Subscription};

/// Whether an attr is created once per connection or fresh per invocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttrScope {
    /// Created when the connection opens; merely attached to each quest.
    Singleton,
    /// Constructed for each handler invocation.
    PerQuest,
}

/// A capability unit riding on a quest.
///
/// The hooks are optional: the default `end` commits or rolls back nothing
/// and the default `on_close` does nothing. Singleton attrs get `on_close`
/// when their connection closes; per-quest attrs get `end` when their quest
/// is torn down.
pub trait Attr: Send {
    fn as_any(&mut self) -> &mut dyn Any;

    /// Per-invocation teardown. `commit` is false when the handler failed or
    /// the quest was cancelled.
    fn end(&mut self, _commit: bool) -> crate::Result<()> {
        Ok(())
    }

    /// Connection teardown for singletons.
    fn on_close(&mut self) {}
}

/// Startup-time descriptor for one application attr.
///
/// The server validates the composition list once, at construction: keys
/// must be unique and must not collide with the built-in `session` and
/// `subscription` attrs.
pub trait AttrSpec: Send + Sync + 'static {
    fn key(&self) -> &'static str;
    fn scope(&self) -> AttrScope;
    fn init(&self) -> Box<dyn Attr>;
}

enum QuestAttr {
    Singleton {
        key: &'static str,
        cell: Arc<Mutex<Box<dyn Attr>>>,
    },
    PerQuest {
        key: &'static str,
        attr: Box<dyn Attr>,
    },
}

/// The context a handler invocation executes in.
///
/// Holds the composed attrs for exactly one call or subscription dispatch.
/// Destroyed immediately after the handler completes, regardless of outcome.
pub struct Quest {
    session: Arc<Mutex<Session>>,
    subscription: Option<Subscription>,
    attrs: Vec<QuestAttr>,
    ended: Arc<AtomicBool>,
    torn_down: bool,
}

impl Quest {
    pub(crate) fn compose(
        session: Arc<Mutex<Session>>,
        singletons: &[(&'static str, Arc<Mutex<Box<dyn Attr>>>)],
        per_quest: Vec<(&'static str, Box<dyn Attr>)>,
        subscription: Option<Subscription>,
        ended: Arc<AtomicBool>,
    ) -> Self {
        let mut attrs = Vec::with_capacity(singletons.len() + per_quest.len());
        for (key, cell) in singletons {
            attrs.push(QuestAttr::Singleton {
                key,
                cell: Arc::clone(cell),
            });
        }
        for (key, attr) in per_quest {
            attrs.push(QuestAttr::PerQuest { key, attr });
        }
        Quest {
            session,
            subscription,
            attrs,
            ended,
            torn_down: false,
        }
    }

    /// Connection-scoped state shared by every quest on this connection.
    ///
    /// Do not hold the guard across an `.await`. A handler that panicked
    /// while holding the guard poisons the lock; recover rather than wedge
    /// every later quest on the connection.
    pub fn session(&self) -> std::sync::MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Shorthand for a single session read.
    pub fn session_get(&self, key: &str) -> Option<Value> {
        self.session().get(key).cloned()
    }

    /// Shorthand for a single session write.
    pub fn session_put(&self, key: &str, value: Value) {
        self.session().put(key, value);
    }

    /// The push channel of a subscription quest; `None` for a unary call.
    pub fn subscription(&self) -> Option<&Subscription> {
        self.subscription.as_ref()
    }

    /// True once the quest has been cancelled (unsubscribe or connection
    /// loss) or torn down. Long-running subscription handlers poll this to
    /// stop pushing promptly.
    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }

    /// Run `f` against the application attr registered under `key`.
    ///
    /// Returns `None` when no such attr is composed or its type is not `T`.
    pub fn with_attr<T: 'static, R>(&mut self, key: &str, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        for a in &mut self.attrs {
            match a {
                QuestAttr::Singleton { key: k, cell } if *k == key => {
                    let mut guard = cell.lock().unwrap_or_else(PoisonError::into_inner);
                    return guard.as_any().downcast_mut::<T>().map(f);
                }
                QuestAttr::PerQuest { key: k, attr } if *k == key => {
                    return attr.as_any().downcast_mut::<T>().map(f);
                }
                _ => {}
            }
        }
        None
    }

    /// Tear down in reverse attachment order.
    ///
    /// A failing attr teardown is logged and neither stops the remaining
    /// attrs nor overrides the handler's own outcome. Singletons are merely
    /// detached; their lifetime belongs to the connection.
    pub(crate) fn end(&mut self, commit: bool) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        self.ended.store(true, Ordering::SeqCst);
        while let Some(a) = self.attrs.pop() {
            match a {
                QuestAttr::Singleton { .. } => {}
                QuestAttr::PerQuest { key, mut attr } => {
                    if let Err(e) = attr.end(commit) {
                        tracing::warn!(attr = key, error = %e, "attr teardown failed");
                    }
                }
            }
        }
    }
}

impl Drop for Quest {
    fn drop(&mut self) {
        // Reached with torn_down=false only when the dispatch task was
        // aborted mid-await; that is a rollback.
        if !self.torn_down {
            self.end(false);
        }
    }
}
