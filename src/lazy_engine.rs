use anyhow::Result;
use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use image::DynamicImage;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};
use tokio::task::JoinHandle;

use crate::engine::{ClassifyError, EmotionEngine};
use crate::types::EmotionScores;

type Loader = Box<dyn Fn() -> BoxFuture<'static, Result<Arc<dyn EmotionEngine>>> + Send + Sync>;

/// Defers loading an engine until it is first needed, then shares it.
///
/// The load runs on its own task, so a caller that gives up waiting does not
/// abort it; the next caller picks up the same load. A failed load leaves the
/// cell empty so the next request tries again.
pub struct LazyEngine {
    engine: OnceCell<Arc<dyn EmotionEngine>>,
    loading: Mutex<Option<JoinHandle<Result<Arc<dyn EmotionEngine>>>>>,
    loader: Loader,
}

impl LazyEngine {
    pub fn new<F, Fut>(loader: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Arc<dyn EmotionEngine>>> + Send + 'static,
    {
        Self {
            engine: OnceCell::new(),
            loading: Mutex::new(None),
            loader: Box::new(move || loader().boxed()),
        }
    }

    #[tracing::instrument(skip(self))]
    pub async fn get(&self) -> Result<&Arc<dyn EmotionEngine>> {
        if let Some(engine) = self.engine.get() {
            return Ok(engine);
        }

        let mut loading = self.loading.lock().await;
        if let Some(engine) = self.engine.get() {
            return Ok(engine);
        }

        let task = loading.get_or_insert_with(|| {
            tracing::info!("Loading emotion engine");
            tokio::spawn((self.loader)())
        });
        // a finished handle must not be polled again, so clear it before any
        // further await
        let joined = task.await;
        *loading = None;

        let engine = joined
            .map_err(|e| anyhow::anyhow!("Emotion engine load task failed: {e}"))
            .and_then(|loaded| loaded)
            .inspect_err(|e| {
                tracing::error!(error = %e, "Failed to load emotion engine");
            })?;
        tracing::info!("Emotion engine loaded");
        Ok(self.engine.get_or_init(|| async move { engine }).await)
    }

    pub fn is_loaded(&self) -> bool {
        self.engine.initialized()
    }
}

#[async_trait]
impl EmotionEngine for LazyEngine {
    async fn ready(&self) -> Result<(), ClassifyError> {
        self.get().await?;
        Ok(())
    }

    async fn classify(&self, image: DynamicImage) -> Result<EmotionScores, ClassifyError> {
        let engine = self.get().await?;
        engine.classify(image).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct FixedEngine;

    #[async_trait]
    impl EmotionEngine for FixedEngine {
        async fn classify(&self, _image: DynamicImage) -> Result<EmotionScores, ClassifyError> {
            Ok(EmotionScores::new([0.0, 0.0, 0.0, 90.0, 0.0, 0.0, 10.0]))
        }
    }

    fn blank() -> DynamicImage {
        DynamicImage::new_rgb8(4, 4)
    }

    #[tokio::test]
    async fn loads_once_across_concurrent_calls() {
        let loads = Arc::new(AtomicUsize::new(0));
        let counter = loads.clone();
        let lazy = Arc::new(LazyEngine::new(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(Arc::new(FixedEngine) as Arc<dyn EmotionEngine>)
            }
        }));
        assert!(!lazy.is_loaded());

        let calls = (0..8).map(|_| {
            let lazy = lazy.clone();
            tokio::spawn(async move { lazy.classify(blank()).await })
        });
        for result in futures::future::join_all(calls).await {
            let scores = result.unwrap().unwrap();
            assert_eq!(scores.dominant(), crate::types::EmotionLabel::Happy);
        }

        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert!(lazy.is_loaded());
    }

    #[tokio::test]
    async fn failed_load_is_retried() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let lazy = LazyEngine::new(move || {
            let attempt = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt == 0 {
                    anyhow::bail!("weights missing");
                }
                Ok(Arc::new(FixedEngine) as Arc<dyn EmotionEngine>)
            }
        });

        let first = lazy.classify(blank()).await;
        assert!(matches!(first, Err(ClassifyError::Failed(_))));
        assert!(!lazy.is_loaded());

        assert!(lazy.classify(blank()).await.is_ok());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn abandoned_wait_does_not_abort_the_load() {
        let loads = Arc::new(AtomicUsize::new(0));
        let counter = loads.clone();
        let lazy = LazyEngine::new(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(Arc::new(FixedEngine) as Arc<dyn EmotionEngine>)
            }
        });

        let gave_up = tokio::time::timeout(Duration::from_millis(20), lazy.get()).await;
        assert!(gave_up.is_err());
        assert!(!lazy.is_loaded());

        lazy.ready().await.unwrap();
        assert!(lazy.is_loaded());
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }
}
