//! Event loop
//!
//! One task per event, bounded by `max-concurrent-events`. Events of
//! different clusters run concurrently; events of one cluster run in arrival
//! order, each task waiting for its predecessor. Every task builds its own
//! provider clients; the only process-wide step is the type registration,
//! done once before the first event is read.

use anyhow::Context;
use clusterflow_cloud_aws::memory::MemoryCloud;
use clusterflow_operator::{
    ClientFactory, EventSource, FileRegistrar, JsonLinesSource, MemoryClientFactory,
    OperatorError, Reconciler, SdkClientFactory, ensure_registered,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::BufReader;
use tokio::sync::Semaphore;
use tokio::sync::oneshot;
use tokio::task::JoinSet;

pub struct RunOptions {
    pub config: Option<PathBuf>,
    pub events: String,
    pub dry_run: bool,
}

/// Outcome counts of one run
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Tally {
    pub succeeded: usize,
    pub failed: usize,
}

impl Tally {
    pub fn total(&self) -> usize {
        self.succeeded + self.failed
    }

    fn record(&mut self, success: bool) {
        if success {
            self.succeeded += 1;
        } else {
            self.failed += 1;
        }
    }
}

pub async fn run(options: RunOptions) -> anyhow::Result<Tally> {
    let (config, path) = clusterflow_config::load_config(options.config.as_deref())
        .context("failed to load operator config")?;
    match &path {
        Some(path) => tracing::info!(path = %path.display(), "config loaded"),
        None => tracing::info!("no config file found, using defaults"),
    }

    // Runs once per process, before the first event is read
    let registrar = FileRegistrar::new(&config.operator.work_dir);
    ensure_registered(&registrar, false)
        .await
        .context("cluster type registration failed")?;

    let factory: Arc<dyn ClientFactory> = if options.dry_run {
        tracing::warn!("dry run: reconciling against an in-memory provider");
        Arc::new(MemoryClientFactory::new(MemoryCloud::new("dry-run")))
    } else {
        Arc::new(SdkClientFactory)
    };
    let reconciler = Arc::new(
        Reconciler::from_config(&config, factory).context("failed to build reconciler")?,
    );

    let source: Box<dyn EventSource> = if options.events == "-" {
        Box::new(JsonLinesSource::new(BufReader::new(tokio::io::stdin())))
    } else {
        let file = tokio::fs::File::open(&options.events)
            .await
            .with_context(|| format!("failed to open event stream {}", options.events))?;
        Box::new(JsonLinesSource::new(BufReader::new(file)))
    };

    let tally = process_events(reconciler, source, config.operator.max_concurrent_events).await?;
    tracing::info!(
        succeeded = tally.succeeded,
        failed = tally.failed,
        "event stream exhausted"
    );
    Ok(tally)
}

/// Drain `source`, reconciling at most `max_concurrent` events at a time
pub async fn process_events(
    reconciler: Arc<Reconciler>,
    mut source: Box<dyn EventSource>,
    max_concurrent: usize,
) -> anyhow::Result<Tally> {
    let permits = Arc::new(Semaphore::new(max_concurrent.max(1)));
    let mut tasks = JoinSet::new();
    let mut tally = Tally::default();
    // Completion signal of the latest task per cluster; closed once it finished
    let mut tails: HashMap<String, oneshot::Receiver<()>> = HashMap::new();

    loop {
        let event = match source.next_event().await {
            Ok(Some(event)) => event,
            Ok(None) => break,
            Err(OperatorError::Event(msg)) => {
                tracing::warn!(error = %msg, "skipping malformed event");
                tally.record(false);
                continue;
            }
            Err(e) => return Err(e).context("event source failed"),
        };

        let permit = permits
            .clone()
            .acquire_owned()
            .await
            .context("event semaphore closed")?;
        let cluster = event.cluster_id().to_string();
        let (done, tail) = oneshot::channel::<()>();
        let previous = tails.insert(cluster.clone(), tail);
        let reconciler = reconciler.clone();
        tasks.spawn(async move {
            let _permit = permit;
            let _done = done;
            if let Some(previous) = previous {
                tracing::debug!(%cluster, "waiting for the previous event of this cluster");
                // Err only means the predecessor is gone, which is what we wait for
                let _ = previous.await;
            }
            match reconciler.handle(event).await {
                Ok(outcome) => outcome.is_success(),
                Err(e) => {
                    tracing::error!(%cluster, error = %e, "event rejected");
                    false
                }
            }
        });

        while let Some(done) = tasks.try_join_next() {
            tally.record(done.unwrap_or(false));
        }
        tails.retain(|_, tail| matches!(tail.try_recv(), Err(oneshot::error::TryRecvError::Empty)));
    }

    while let Some(done) = tasks.join_next().await {
        if let Err(e) = &done {
            tracing::error!(error = %e, "reconcile task panicked");
        }
        tally.record(done.unwrap_or(false));
    }
    Ok(tally)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clusterflow_cloud::RetryConfig;
    use clusterflow_operator::{
        DirNamespaceStore, ReconcilerSettings, TeraRenderer, TlsAsset, TlsAssetType, TlsComponent,
    };
    use std::io::Cursor;
    use std::time::Duration;

    const SPEC: &str = r#"{"clusterId":"c1","region":"eu-west-1","network":{"vpcCidr":"10.0.0.0/16"},"masters":[{"imageId":"ami-0a1b2c3d","instanceType":"m5.large"}],"workers":[{"imageId":"ami-0a1b2c3d","instanceType":"m5.large"}]}"#;

    fn envelope(event_type: &str) -> String {
        format!(
            r#"{{"type":"{}","object":{{"metadata":{{"name":"c1"}},"spec":{}}}}}"#,
            event_type, SPEC
        )
    }

    fn reconciler(cloud: &MemoryCloud, root: &std::path::Path) -> Arc<Reconciler> {
        let certs_dir = root.join("certs");
        for component in TlsComponent::ALL {
            for asset_type in TlsAssetType::ALL {
                let path = certs_dir.join(TlsAsset::file_name(component, asset_type));
                std::fs::create_dir_all(path.parent().unwrap()).unwrap();
                std::fs::write(path, "-----BEGIN CERTIFICATE-----\n").unwrap();
            }
        }
        let settings = ReconcilerSettings {
            certs_dir,
            retry: RetryConfig {
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                backoff_multiplier: 2.0,
                deadline: Duration::from_millis(200),
            },
            ..ReconcilerSettings::default()
        };
        Arc::new(Reconciler::new(
            Arc::new(MemoryClientFactory::new(cloud.clone())),
            Arc::new(DirNamespaceStore::new(root.join("work"))),
            Arc::new(TeraRenderer::builtin().unwrap()),
            settings,
        ))
    }

    fn source(lines: &[String]) -> Box<dyn EventSource> {
        Box::new(JsonLinesSource::new(Cursor::new(lines.join("\n").into_bytes())))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_events_of_one_cluster_run_in_order() {
        let root = tempfile::tempdir().unwrap();
        let cloud = MemoryCloud::new("eu-west-1");
        let events = source(&[envelope("ADDED"), envelope("DELETED")]);

        let tally = process_events(reconciler(&cloud, root.path()), events, 4)
            .await
            .unwrap();

        assert_eq!(tally, Tally { succeeded: 2, failed: 0 });
        assert!(cloud.live_instances("c1").is_empty());
        assert_eq!(cloud.vpc_count("c1"), 0);
        assert!(!cloud.has_load_balancer("c1-api"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_malformed_line_counts_as_failure() {
        let root = tempfile::tempdir().unwrap();
        let cloud = MemoryCloud::new("eu-west-1");
        let events = source(&["{not json".to_string(), envelope("ADDED")]);

        let tally = process_events(reconciler(&cloud, root.path()), events, 4)
            .await
            .unwrap();

        assert_eq!(tally, Tally { succeeded: 1, failed: 1 });
        assert_eq!(tally.total(), 2);
        assert_eq!(cloud.live_instances("c1").len(), 2);
    }
}
