//! Closure-backed transforms.

use super::{Transform, TransformKind};
use async_trait::async_trait;
use std::fmt::Debug;
use std::future::Future;

/// A synchronous, fallible transform built from a closure.
///
/// The closure returns `Ok(None)` to drop an item.
pub struct FnTransform<F> {
    func: F,
}

impl<F> FnTransform<F> {
    /// Creates a new function-based transform.
    pub fn new<In, Out>(func: F) -> Self
    where
        F: Fn(In) -> anyhow::Result<Option<Out>>,
    {
        Self { func }
    }
}

impl<F> Debug for FnTransform<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnTransform").finish_non_exhaustive()
    }
}

#[async_trait]
impl<In, Out, F> Transform<In, Out> for FnTransform<F>
where
    In: Send + 'static,
    Out: Send + 'static,
    F: Fn(In) -> anyhow::Result<Option<Out>> + Send + Sync,
{
    async fn apply(&self, item: In) -> anyhow::Result<Option<Out>> {
        (self.func)(item)
    }

    fn kind(&self) -> TransformKind {
        TransformKind::Sync
    }
}

/// An asynchronous, fallible transform built from a closure returning a future.
pub struct AsyncFnTransform<F> {
    func: F,
}

impl<F> AsyncFnTransform<F> {
    /// Creates a new async function-based transform.
    pub fn new<In, Out, Fut>(func: F) -> Self
    where
        F: Fn(In) -> Fut,
        Fut: Future<Output = anyhow::Result<Option<Out>>>,
    {
        Self { func }
    }
}

impl<F> Debug for AsyncFnTransform<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncFnTransform").finish_non_exhaustive()
    }
}

#[async_trait]
impl<In, Out, F, Fut> Transform<In, Out> for AsyncFnTransform<F>
where
    In: Send + 'static,
    Out: Send + 'static,
    F: Fn(In) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Option<Out>>> + Send,
{
    async fn apply(&self, item: In) -> anyhow::Result<Option<Out>> {
        (self.func)(item).await
    }
}

/// Passes items matching a predicate through unchanged and drops the rest.
///
/// A dropped item still costs one worker cycle but puts no pressure on the
/// output queue.
pub struct FilterTransform<P> {
    predicate: P,
}

impl<P> FilterTransform<P> {
    /// Creates a new filter.
    pub fn new<T>(predicate: P) -> Self
    where
        P: Fn(&T) -> bool,
    {
        Self { predicate }
    }
}

impl<P> Debug for FilterTransform<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterTransform").finish_non_exhaustive()
    }
}

#[async_trait]
impl<T, P> Transform<T, T> for FilterTransform<P>
where
    T: Send + 'static,
    P: Fn(&T) -> bool + Send + Sync,
{
    async fn apply(&self, item: T) -> anyhow::Result<Option<T>> {
        Ok((self.predicate)(&item).then_some(item))
    }

    fn kind(&self) -> TransformKind {
        TransformKind::Sync
    }
}

/// Maps items and drops those mapped to `None`, infallibly.
pub struct FilterMapTransform<F> {
    func: F,
}

impl<F> FilterMapTransform<F> {
    /// Creates a new filter-map transform.
    pub fn new<In, Out>(func: F) -> Self
    where
        F: Fn(In) -> Option<Out>,
    {
        Self { func }
    }
}

impl<F> Debug for FilterMapTransform<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterMapTransform").finish_non_exhaustive()
    }
}

#[async_trait]
impl<In, Out, F> Transform<In, Out> for FilterMapTransform<F>
where
    In: Send + 'static,
    Out: Send + 'static,
    F: Fn(In) -> Option<Out> + Send + Sync,
{
    async fn apply(&self, item: In) -> anyhow::Result<Option<Out>> {
        Ok((self.func)(item))
    }

    fn kind(&self) -> TransformKind {
        TransformKind::Sync
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fn_transform() {
        let double = FnTransform::new(|x: i32| Ok(Some(x * 2)));
        assert_eq!(double.apply(21).await.unwrap(), Some(42));
        assert_eq!(Transform::<i32, i32>::kind(&double), TransformKind::Sync);
    }

    #[tokio::test]
    async fn test_fn_transform_error() {
        let parse = FnTransform::new(|s: String| Ok(Some(s.parse::<i32>()?)));
        let err = parse.apply("bad".to_string()).await.unwrap_err();
        assert!(err.to_string().contains("invalid digit"));
    }

    #[tokio::test]
    async fn test_async_fn_transform() {
        let fetch = AsyncFnTransform::new(|url: &'static str| async move {
            tokio::task::yield_now().await;
            Ok(Some(url.len()))
        });
        assert_eq!(fetch.apply("https://example.com").await.unwrap(), Some(19));
        assert_eq!(Transform::<&str, usize>::kind(&fetch), TransformKind::Async);
    }

    #[tokio::test]
    async fn test_filter_transform() {
        let small = FilterTransform::new(|x: &i32| *x <= 6);
        assert_eq!(small.apply(4).await.unwrap(), Some(4));
        assert_eq!(small.apply(8).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_filter_map_transform() {
        let parse = FilterMapTransform::new(|s: &'static str| s.parse::<u8>().ok());
        assert_eq!(parse.apply("7").await.unwrap(), Some(7));
        assert_eq!(parse.apply("seven").await.unwrap(), None);
    }
}
