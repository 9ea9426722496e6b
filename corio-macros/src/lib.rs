#![warn(missing_debug_implementations, missing_docs, rust_2018_idioms, unreachable_pub)]

//! Entry-point attributes for the corio runtime.

mod entry;
mod parse;

/// Runs an `async fn main` on a corio runtime.
///
/// The function body becomes the root future of [`Runtime::block_on`], driven
/// by the thread calling `main`. Arguments are not allowed.
///
/// # Options
///
/// - `flavor = "stealing"` (default): the `main` thread plus `worker_threads`
///   background workers stealing from each other.
/// - `flavor = "local"`: a single worker on the `main` thread.
/// - `worker_threads = N`: background workers of the stealing flavor.
///   Defaults to the number of available CPUs.
///
/// ```no_run
/// #[corio::main(worker_threads = 2)]
/// async fn main() {
///     corio::spawn(async { println!("from a task") }).await.unwrap();
/// }
/// ```
///
/// expands to roughly
///
/// ```no_run
/// fn main() {
///     corio::runtime::Builder::new_stealing()
///         .worker_threads(2)
///         .try_build()
///         .expect("failed to build the corio runtime")
///         .block_on(async {
///             corio::spawn(async { println!("from a task") }).await.unwrap();
///         })
/// }
/// ```
///
/// [`Runtime::block_on`]: https://docs.rs/corio/latest/corio/runtime/struct.Runtime.html#method.block_on
#[proc_macro_attribute]
pub fn main(args: proc_macro::TokenStream, item: proc_macro::TokenStream) -> proc_macro::TokenStream {
    entry::expand(args.into(), item.into(), entry::Entry::Main).into()
}

/// Runs an `async fn` test on a fresh corio runtime.
///
/// Takes the same options as [`macro@main`], but the default flavor is
/// `"local"`: every test gets its own single-worker runtime.
///
/// ```no_run
/// #[corio::test(flavor = "stealing", worker_threads = 2)]
/// async fn spawns_across_workers() -> anyhow::Result<()> {
///     let handle = corio::spawn_mt(async { 1 + 1 });
///     assert_eq!(handle.await?, 2);
///     Ok(())
/// }
/// ```
#[proc_macro_attribute]
pub fn test(args: proc_macro::TokenStream, item: proc_macro::TokenStream) -> proc_macro::TokenStream {
    entry::expand(args.into(), item.into(), entry::Entry::Test).into()
}
