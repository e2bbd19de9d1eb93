use async_trait::async_trait;
use futures::{stream::FuturesUnordered, StreamExt};
use tokio::task::{JoinError, JoinHandle};

/// The first task which did not succeed
#[derive(Debug)]
pub(crate) enum TaskFailure<E> {
    /// The task returned an error
    Failed(E),
    /// The task panicked or was cancelled
    Panicked(JoinError),
}

#[async_trait]
pub(crate) trait FailFast<T, E> {
    /// Await all tasks, returning their results in completion order.
    /// Stops at the first task which fails and aborts all others.
    async fn failfast(self) -> Result<Vec<T>, TaskFailure<E>>;
}

#[async_trait]
impl<T, E> FailFast<T, E> for FuturesUnordered<JoinHandle<Result<T, E>>>
where
    T: Send + 'static,
    E: Send + 'static,
{
    async fn failfast(mut self) -> Result<Vec<T>, TaskFailure<E>> {
        let mut done = Vec::with_capacity(self.len());
        while let Some(next) = self.next().await {
            let failure = match next {
                Ok(Ok(x)) => {
                    done.push(x);
                    continue;
                }
                Ok(Err(e)) => TaskFailure::Failed(e),
                Err(e) => TaskFailure::Panicked(e),
            };
            for t in self.iter() {
                t.abort();
            }
            return Err(failure);
        }
        Ok(done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn collects_all() {
        let tasks: FuturesUnordered<_> = (0..4)
            .map(|i| tokio::spawn(async move { Ok::<_, ()>(i) }))
            .collect();
        let mut res = tasks.failfast().await.unwrap();
        res.sort();
        assert_eq!(res, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn stops_on_error() {
        let tasks: FuturesUnordered<_> = [
            tokio::spawn(async { Err::<i32, _>("boom") }),
            tokio::spawn(async {
                tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
                Ok(1)
            }),
        ]
        .into_iter()
        .collect();
        assert!(matches!(tasks.failfast().await, Err(TaskFailure::Failed("boom"))));
    }

    #[tokio::test]
    async fn reports_panic() {
        let tasks: FuturesUnordered<_> = [tokio::spawn(async {
            if true {
                panic!("oh no")
            }
            Ok::<i32, ()>(1)
        })]
        .into_iter()
        .collect();
        assert!(matches!(tasks.failfast().await, Err(TaskFailure::Panicked(_))));
    }
}
