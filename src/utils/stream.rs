//! Stream combinators over optional-valued streams.

use futures::{
    future,
    stream::{self, BoxStream},
    Stream, StreamExt,
};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::warn;

pub trait OptionalStreamExt<T>: Stream<Item = Option<T>> + Sized {
    /// Drops `None` items and yields the contents of the `Some` ones, in order.
    fn unwrap_optional<'a>(self) -> BoxStream<'a, T>
    where
        Self: Send + 'a,
        T: Send + 'a,
    {
        self.filter_map(future::ready).boxed()
    }

    /// Maps the value inside each `Some`, passing `None` through.
    fn map_optional<'a, U, F>(self, f: F) -> BoxStream<'a, Option<U>>
    where
        Self: Send + 'a,
        T: Send + 'a,
        U: Send + 'a,
        F: FnMut(T) -> U + Send + 'a,
    {
        let mut f = f;
        self.map(move |item| item.map(&mut f)).boxed()
    }
}

impl<T, S> OptionalStreamExt<T> for S where S: Stream<Item = Option<T>> {}

/// Turns a broadcast receiver into a stream. Lagged receivers skip ahead; the
/// stream ends when every sender is gone.
pub fn broadcast_stream<T>(receiver: broadcast::Receiver<T>) -> BoxStream<'static, T>
where
    T: Clone + Send + 'static,
{
    stream::unfold(receiver, |mut receiver| async move {
        loop {
            match receiver.recv().await {
                Ok(item) => return Some((item, receiver)),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Broadcast subscriber lagged behind");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test(tokio::test)]
    async fn test_unwrap_optional_keeps_order() {
        let items = stream::iter(vec![Some(1), None, Some(2), None, Some(3)])
            .unwrap_optional()
            .collect::<Vec<_>>()
            .await;
        assert_eq!(items, vec![1, 2, 3]);
    }

    #[test(tokio::test)]
    async fn test_map_optional_passes_none_through() {
        let items = stream::iter(vec![Some(1), None, Some(3)])
            .map_optional(|n| n * 10)
            .collect::<Vec<_>>()
            .await;
        assert_eq!(items, vec![Some(10), None, Some(30)]);
    }

    #[test(tokio::test)]
    async fn test_map_optional_is_lazy() {
        let mut calls = 0;
        let mut stream = stream::iter(vec![Some(1), Some(2)]).map_optional(move |n| {
            calls += 1;
            (n, calls)
        });
        assert_eq!(stream.next().await, Some(Some((1, 1))));
        assert_eq!(stream.next().await, Some(Some((2, 2))));
        assert_eq!(stream.next().await, None);
    }

    #[test(tokio::test)]
    async fn test_broadcast_stream_ends_when_sender_dropped() {
        let (sender, receiver) = broadcast::channel(4);
        let stream = broadcast_stream(receiver);
        sender.send(1).unwrap();
        sender.send(2).unwrap();
        drop(sender);
        assert_eq!(stream.collect::<Vec<_>>().await, vec![1, 2]);
    }

    #[test(tokio::test)]
    async fn test_broadcast_stream_skips_lagged_items() {
        let (sender, receiver) = broadcast::channel(2);
        let stream = broadcast_stream(receiver);
        for i in 0..5 {
            sender.send(i).unwrap();
        }
        drop(sender);
        assert_eq!(stream.collect::<Vec<_>>().await, vec![3, 4]);
    }
}
