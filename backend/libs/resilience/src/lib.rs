/// Resilience helpers shared by the engagement workers
///
/// - **Retry**: exponential backoff with jitter, retrying only errors the
///   caller classifies as transient. Permanent errors return immediately.
///
/// # Example
///
/// ```rust,no_run
/// use resilience::{with_retry_if, RetryConfig};
///
/// #[tokio::main]
/// async fn main() {
///     let result = with_retry_if(
///         RetryConfig::default(),
///         |e: &String| e.starts_with("transient"),
///         || async { Ok::<_, String>(42) },
///     )
///     .await;
///     assert_eq!(result.ok(), Some(42));
/// }
/// ```

pub mod retry;

pub use retry::{with_retry, with_retry_if, RetryConfig, RetryError};
