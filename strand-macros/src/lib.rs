#![warn(
    missing_debug_implementations,
    missing_docs,
    rust_2018_idioms,
    unreachable_pub
)]

//! Attribute macros for the strand task engine.

mod entry;
mod parse;

/// Marks an async function to be run as a test on a fresh task processor.
///
/// The function body runs as a critical task, so everything available inside
/// a task (spawning, sleeping, task synchronization primitives) works in the
/// test body. The processor is shut down when the test returns.
///
/// ```ignore
/// #[strand::test]
/// async fn my_test() {
///     assert!(strand::current_task::try_id().is_some());
/// }
/// ```
///
/// # Worker threads
///
/// One worker thread by default. Use `worker_threads` for more:
///
/// ```ignore
/// #[strand::test(worker_threads = 4)]
/// async fn my_test() {
///     let task = strand::spawn(async { 1 });
///     assert_eq!(task.get().await, Ok(1));
/// }
/// ```
///
/// # Return type
///
/// The body may return anything a `#[test]` function may return, as long as
/// it is `Send + 'static`, e.g. `anyhow::Result<()>`.
#[proc_macro_attribute]
pub fn test(
    args: proc_macro::TokenStream,
    item: proc_macro::TokenStream,
) -> proc_macro::TokenStream {
    entry::test(args.into(), item.into()).into()
}
