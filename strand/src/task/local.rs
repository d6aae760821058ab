//! Task-local variables.
//!
//! ```ignore
//! static REQUEST_ID: TaskLocalVariable<String> = TaskLocalVariable::new();
//!
//! REQUEST_ID.with(|id| *id = "abc".into());
//! let id = REQUEST_ID.with(|id| id.clone());
//! ```
//!
//! Every task gets its own default-constructed value on first access. Values
//! are dropped when the task completes, in reverse order of first access, so
//! a variable initialized later (and possibly depending on an earlier one) is
//! destroyed first.
use crate::current_task;
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::any::Any;
use std::marker::PhantomData;
use std::sync::{Arc, OnceLock};

const INLINE_SLOTS: usize = 8;

type Slot = Arc<dyn Any + Send + Sync>;

/// Process-wide key of one [`TaskLocalVariable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct Key(usize);

/// Keys are handed out once per variable and never reclaimed.
fn register_variable() -> Key {
    static NEXT_KEY: Mutex<usize> = Mutex::new(0);

    let mut next = NEXT_KEY.lock();
    let key = Key(*next);
    *next += 1;
    key
}

/// Slot table of one task.
#[derive(Default)]
pub(crate) struct Storage {
    slots: SmallVec<[Option<Slot>; INLINE_SLOTS]>,
    // Keys in order of first access.
    order: SmallVec<[Key; INLINE_SLOTS]>,
}

impl Storage {
    fn get_optional<T: Send + 'static>(&self, key: Key) -> Option<Arc<Mutex<T>>> {
        let slot = self.slots.get(key.0)?.as_ref()?;
        Some(downcast(Arc::clone(slot)))
    }

    fn get_or_emplace<T: Default + Send + 'static>(&mut self, key: Key) -> Arc<Mutex<T>> {
        if let Some(value) = self.get_optional(key) {
            return value;
        }

        if self.slots.len() <= key.0 {
            self.slots.resize(key.0 + 1, None);
        }

        let value = Arc::new(Mutex::new(T::default()));
        self.slots[key.0] = Some(Arc::clone(&value) as Slot);
        self.order.push(key);
        value
    }

    /// Empties the table and returns the values in the order they must be
    /// dropped in.
    fn take_for_teardown(&mut self) -> Vec<Slot> {
        let order = std::mem::take(&mut self.order);
        let mut slots = std::mem::take(&mut self.slots);

        order
            .iter()
            .rev()
            .filter_map(|key| slots[key.0].take())
            .collect()
    }
}

/// Drops every value of a finishing task, newest first.
///
/// Values are dropped outside of the storage lock since their `Drop` may
/// access other variables. Variables created that way are dropped in turn,
/// until the storage stays empty.
pub(crate) fn teardown(storage: &Mutex<Storage>) {
    loop {
        let values = storage.lock().take_for_teardown();
        if values.is_empty() {
            break;
        }
        drop(values);
    }
}

#[track_caller]
fn downcast<T: Send + 'static>(slot: Slot) -> Arc<Mutex<T>> {
    match slot.downcast::<Mutex<T>>() {
        Ok(value) => value,
        Err(_) => panic!("task-local slot holds a value of another type"),
    }
}

/// A variable with one independent value per task.
///
/// Must be declared as a `static`.
pub struct TaskLocalVariable<T> {
    key: OnceLock<Key>,
    _p: PhantomData<fn() -> T>,
}

impl<T> TaskLocalVariable<T> {
    pub const fn new() -> Self {
        Self {
            key: OnceLock::new(),
            _p: PhantomData,
        }
    }
}

impl<T> Default for TaskLocalVariable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Default + Send + 'static> TaskLocalVariable<T> {
    fn key(&self) -> Key {
        *self.key.get_or_init(register_variable)
    }

    /// Runs `f` with the value of the current task, default-constructing it
    /// on first access.
    ///
    /// # Panics
    ///
    /// Panics outside of a task, or if called from within `f` for the same
    /// variable.
    #[track_caller]
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let value = current_task::context()
            .local_storage()
            .lock()
            .get_or_emplace::<T>(self.key());
        with_value(&value, f)
    }

    /// Like [`with`](Self::with), without constructing the value. `f` gets
    /// `None` if the current task never accessed the variable.
    #[track_caller]
    pub fn with_optional<R>(&self, f: impl FnOnce(Option<&mut T>) -> R) -> R {
        let value = current_task::context()
            .local_storage()
            .lock()
            .get_optional::<T>(self.key());

        match value {
            Some(value) => with_value(&value, |v| f(Some(v))),
            None => f(None),
        }
    }
}

#[track_caller]
fn with_value<T, R>(value: &Mutex<T>, f: impl FnOnce(&mut T) -> R) -> R {
    match value.try_lock() {
        Some(mut guard) => f(&mut guard),
        None => panic!("task-local variable accessed recursively"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate as strand;
    use anyhow::Result;
    use static_assertions::assert_impl_all;

    assert_impl_all!(TaskLocalVariable<std::cell::Cell<u32>>: Send, Sync);

    static COUNTER: TaskLocalVariable<u32> = TaskLocalVariable::new();
    static NAME: TaskLocalVariable<String> = TaskLocalVariable::new();

    #[strand::test]
    async fn test_values_are_per_task() -> Result<()> {
        COUNTER.with(|c| *c = 10);

        let other = strand::spawn(async {
            COUNTER.with(|c| *c += 1);
            COUNTER.with(|c| *c)
        });

        assert_eq!(other.get().await?, 1);
        assert_eq!(COUNTER.with(|c| *c), 10);
        Ok(())
    }

    #[strand::test]
    async fn test_with_optional_does_not_construct() -> Result<()> {
        let task = strand::spawn(async {
            let before = NAME.with_optional(|name| name.is_some());
            NAME.with(|name| name.push_str("set"));
            let after = NAME.with_optional(|name| name.map(|n| n.clone()));
            (before, after)
        });

        assert_eq!(task.get().await?, (false, Some("set".to_string())));
        Ok(())
    }

    #[strand::test]
    async fn test_value_survives_suspension() -> Result<()> {
        NAME.with(|name| *name = "kept".into());
        strand::current_task::yield_now().await;
        assert_eq!(NAME.with(|name| name.clone()), "kept");
        Ok(())
    }

    #[strand::test]
    async fn test_recursive_access_panics() -> Result<()> {
        let task = strand::spawn(async {
            COUNTER.with(|_| COUNTER.with(|c| *c));
        });
        assert!(task.get().await.unwrap_err().is_panic());
        Ok(())
    }

    mod teardown {
        use super::*;
        use std::sync::Mutex as StdMutex;

        static DROPS: StdMutex<Vec<&'static str>> = StdMutex::new(Vec::new());

        macro_rules! tracked {
            ($name:ident, $label:literal) => {
                #[derive(Default)]
                struct $name;

                impl Drop for $name {
                    fn drop(&mut self) {
                        DROPS.lock().unwrap().push($label);
                    }
                }
            };
        }

        tracked!(A, "a");
        tracked!(B, "b");
        tracked!(C, "c");

        static VAR_C: TaskLocalVariable<C> = TaskLocalVariable::new();
        static VAR_A: TaskLocalVariable<A> = TaskLocalVariable::new();
        static VAR_B: TaskLocalVariable<B> = TaskLocalVariable::new();

        #[strand::test]
        async fn test_teardown_is_reverse_of_first_access() -> Result<()> {
            let task = strand::spawn(async {
                VAR_A.with(|_| ());
                VAR_B.with(|_| ());
                VAR_C.with(|_| ());
                VAR_A.with(|_| ());
            });
            task.get().await?;

            assert_eq!(*DROPS.lock().unwrap(), vec!["c", "b", "a"]);
            Ok(())
        }

        mod nested {
            use super::*;

            static NESTED_DROPS: StdMutex<Vec<&'static str>> = StdMutex::new(Vec::new());

            #[derive(Default)]
            struct Outer;

            impl Drop for Outer {
                fn drop(&mut self) {
                    // Created after the storage was drained.
                    VAR_INNER.with(|_| ());
                    NESTED_DROPS.lock().unwrap().push("outer");
                }
            }

            #[derive(Default)]
            struct Inner;

            impl Drop for Inner {
                fn drop(&mut self) {
                    NESTED_DROPS.lock().unwrap().push("inner");
                }
            }

            static VAR_OUTER: TaskLocalVariable<Outer> = TaskLocalVariable::new();
            static VAR_INNER: TaskLocalVariable<Inner> = TaskLocalVariable::new();

            #[strand::test]
            async fn test_value_created_during_teardown_is_dropped_before_finish() -> Result<()> {
                let task = strand::spawn(async {
                    VAR_OUTER.with(|_| ());
                });
                // Keeps the task context alive past completion.
                task.wait().await?;

                assert_eq!(*NESTED_DROPS.lock().unwrap(), vec!["outer", "inner"]);
                Ok(())
            }
        }
    }
}
