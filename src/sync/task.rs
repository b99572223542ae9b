use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::error;

/// A spawned loop and the token that stops it.
pub(crate) struct BackgroundTask {
    name: &'static str,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl BackgroundTask {
    pub(crate) fn spawn<F, Fut>(name: &'static str, parent: &CancellationToken, body: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = parent.child_token();
        let handle = tokio::spawn(body(token.clone()));
        Self {
            name,
            token,
            handle,
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Cancel and wait for the loop to return.
    pub(crate) async fn stop(self) {
        self.token.cancel();
        if let Err(e) = self.handle.await {
            error!(task = self.name, error = %e, "background task panicked");
        }
    }
}
