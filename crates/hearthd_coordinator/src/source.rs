use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;

use crate::error::FetchError;

/// Something a coordinator can pull fresh data from.
///
/// Implemented by integrations; the coordinator calls [`fetch`](Self::fetch)
/// on every refresh and never concurrently with itself.
#[async_trait]
pub trait DataSource: Send + Sync + 'static {
    type Data: Send + Sync + 'static;

    async fn fetch(&self) -> Result<Self::Data, FetchError>;
}

/// [`DataSource`] backed by a closure returning a future.
pub struct FnSource<F, T> {
    fetch: F,
    _data: PhantomData<fn() -> T>,
}

/// Wrap a closure as a [`DataSource`].
pub fn source_fn<F, Fut, T>(fetch: F) -> FnSource<F, T>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
    T: Send + Sync + 'static,
{
    FnSource {
        fetch,
        _data: PhantomData,
    }
}

#[async_trait]
impl<F, Fut, T> DataSource for FnSource<F, T>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
    T: Send + Sync + 'static,
{
    type Data = T;

    async fn fetch(&self) -> Result<T, FetchError> {
        (self.fetch)().await
    }
}
