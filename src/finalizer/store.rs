use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::{future::BoxFuture, FutureExt};
use log::info;

use super::payload::PersistencePayload;

/// Destination for the finalized session payload.
pub trait ScoreStore: Send + Sync + 'static {
    fn submit(&self, payload: &PersistencePayload) -> BoxFuture<'static, Result<()>>;
}

/// POSTs the payload as JSON; any 2xx status counts as stored.
#[derive(Debug, Clone)]
pub struct HttpScoreStore {
    client: reqwest::Client,
    url: String,
}

impl HttpScoreStore {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl ScoreStore for HttpScoreStore {
    fn submit(&self, payload: &PersistencePayload) -> BoxFuture<'static, Result<()>> {
        let request = self.client.post(&self.url).json(payload);
        let url = self.url.clone();
        async move {
            let response = request
                .send()
                .await
                .with_context(|| format!("failed to reach score store at {url}"))?;
            let status = response.status();
            response
                .error_for_status()
                .with_context(|| format!("score store rejected payload ({status})"))?;
            info!("Session scores stored ({status})");
            Ok(())
        }
        .boxed()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    };

    use anyhow::bail;

    use super::*;

    /// Records every submission; can be told to fail or to answer slowly.
    #[derive(Clone, Default)]
    pub struct RecordingStore {
        pub submissions: Arc<Mutex<Vec<PersistencePayload>>>,
        pub completed: Arc<AtomicUsize>,
        pub fail: Arc<AtomicBool>,
        pub delay: Option<Duration>,
    }

    impl RecordingStore {
        pub fn failing() -> Self {
            let store = Self::default();
            store.fail.store(true, Ordering::SeqCst);
            store
        }

        pub fn slow(delay: Duration) -> Self {
            Self {
                delay: Some(delay),
                ..Self::default()
            }
        }

        pub fn submissions(&self) -> Vec<PersistencePayload> {
            self.submissions.lock().unwrap().clone()
        }

        /// Submissions that ran to a successful response.
        pub fn completed(&self) -> usize {
            self.completed.load(Ordering::SeqCst)
        }
    }

    impl ScoreStore for RecordingStore {
        fn submit(&self, payload: &PersistencePayload) -> BoxFuture<'static, Result<()>> {
            self.submissions.lock().unwrap().push(payload.clone());
            let fail = self.fail.load(Ordering::SeqCst);
            let delay = self.delay;
            let completed = self.completed.clone();
            async move {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                if fail {
                    bail!("connection refused");
                }
                completed.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            .boxed()
        }
    }
}
