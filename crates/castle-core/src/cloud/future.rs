use tokio::sync::oneshot;

/// The eventual result of a cloud request.
///
/// Completed by the backend's worker; `wait` blocks the calling thread and
/// must not be used from inside an async task.
pub struct CloudFuture<T> {
    inner: Inner<T>,
}

enum Inner<T> {
    Ready(anyhow::Result<T>),
    Pending(oneshot::Receiver<anyhow::Result<T>>),
}

/// Completion side of a `CloudFuture`.
pub struct CloudPromise<T> {
    tx: oneshot::Sender<anyhow::Result<T>>,
}

impl<T> CloudPromise<T> {
    pub fn complete(self, result: anyhow::Result<T>) {
        // The caller may have stopped waiting.
        let _ = self.tx.send(result);
    }
}

impl<T> CloudFuture<T> {
    pub fn ready(value: T) -> Self {
        Self {
            inner: Inner::Ready(Ok(value)),
        }
    }

    pub fn failed(err: anyhow::Error) -> Self {
        Self {
            inner: Inner::Ready(Err(err)),
        }
    }

    pub fn channel() -> (CloudPromise<T>, Self) {
        let (tx, rx) = oneshot::channel();
        (
            CloudPromise { tx },
            Self {
                inner: Inner::Pending(rx),
            },
        )
    }

    pub fn wait(self) -> anyhow::Result<T> {
        match self.inner {
            Inner::Ready(result) => result,
            Inner::Pending(rx) => rx
                .blocking_recv()
                .unwrap_or_else(|_| Err(anyhow::anyhow!("cloud request was abandoned"))),
        }
    }
}

/// Wait for every future, returning the first error after all have finished.
pub fn wait_all<T>(futures: Vec<CloudFuture<T>>) -> anyhow::Result<Vec<T>> {
    let mut values = Vec::with_capacity(futures.len());
    let mut first_err = None;
    for future in futures {
        match future.wait() {
            Ok(v) => values.push(v),
            Err(e) => {
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }
    }
    match first_err {
        Some(e) => Err(e),
        None => Ok(values),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_future_resolves_from_another_thread() {
        let (promise, future) = CloudFuture::channel();
        std::thread::spawn(move || promise.complete(Ok(7)));
        assert_eq!(future.wait().unwrap(), 7);
    }

    #[test]
    fn dropped_promise_fails_the_future() {
        let (promise, future) = CloudFuture::<()>::channel();
        drop(promise);
        assert!(future.wait().is_err());
    }

    #[test]
    fn wait_all_reports_failures_after_draining() {
        let futures = vec![
            CloudFuture::ready(1),
            CloudFuture::failed(anyhow::anyhow!("boom")),
            CloudFuture::ready(3),
        ];
        let err = wait_all(futures).unwrap_err();
        assert_eq!(err.to_string(), "boom");
    }
}
