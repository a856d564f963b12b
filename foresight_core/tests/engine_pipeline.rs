//! End-to-end tests of the public engine surface.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use foresight_core::{
    viewport, CacheStatus, EngineConfig, FilterConfig, ForesightEngine, PointerSampleSource,
    PrefetchConfig, Region, RegionId, RegionProvider, Sample,
};
use foresight_env::{CancellationToken, FetchError, FetchExecutor, ResourceKey, TokioContext};
use geo::Rect;

/// Replays a fixed list of samples, yielding between them so spawned
/// fetches get to run.
struct ScriptedSource {
    samples: VecDeque<Sample>,
}

#[async_trait]
impl PointerSampleSource for ScriptedSource {
    async fn next_sample(&mut self) -> Option<Sample> {
        tokio::time::sleep(Duration::from_millis(2)).await;
        self.samples.pop_front()
    }
}

struct StaticRegions {
    revision: AtomicU64,
    regions: Mutex<Vec<Region>>,
}

impl RegionProvider for StaticRegions {
    fn revision(&self) -> u64 {
        self.revision.load(Ordering::SeqCst)
    }

    fn viewport(&self) -> Rect<f64> {
        viewport(0.0, 0.0, 1280.0, 720.0).unwrap()
    }

    fn regions(&self) -> Vec<Region> {
        self.regions.lock().unwrap().clone()
    }
}

#[derive(Default)]
struct RecordingFetcher {
    calls: AtomicUsize,
    keys: Mutex<Vec<ResourceKey>>,
}

#[async_trait]
impl FetchExecutor for RecordingFetcher {
    async fn fetch(&self, key: &ResourceKey, _cancel: CancellationToken) -> Result<(), FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.keys.lock().unwrap().push(key.clone());
        if key.as_str().ends_with("broken") {
            return Err(FetchError::Status {
                key: key.to_string(),
                status: 503,
            });
        }
        Ok(())
    }
}

fn engine_config() -> EngineConfig {
    EngineConfig {
        filter: FilterConfig {
            seed: Some(2024),
            ..FilterConfig::default()
        },
        prefetch: PrefetchConfig {
            check_frequency_ms: 1,
            ..PrefetchConfig::default()
        },
        ..EngineConfig::default()
    }
}

/// A horizontal sweep at 400 units/sec along y = 360, sampled every 25ms.
fn sweep() -> VecDeque<Sample> {
    (0..40)
        .map(|i| Sample::new(100.0 + i as f64 * 10.0, 360.0, i as f64 * 25.0))
        .collect()
}

/// Cards along the sweep plus decoys well off the path.
fn layout() -> Vec<Region> {
    let mut regions: Vec<Region> = (0..6)
        .map(|i| {
            Region::new(
                RegionId::from_index(i),
                300.0 + i as f64 * 120.0,
                320.0,
                80.0,
                80.0,
                format!("/cards/{i}"),
            )
        })
        .collect();
    regions.extend((0..6).map(|i| {
        Region::new(
            RegionId::from_index(100 + i),
            300.0 + i as f64 * 120.0,
            40.0,
            80.0,
            80.0,
            format!("/decoys/{i}"),
        )
    }));
    regions
}

#[tokio::test]
async fn test_run_loop_prefetches_cards_on_the_path() {
    let fetcher = Arc::new(RecordingFetcher::default());
    let engine = ForesightEngine::new(TokioContext::shared(), fetcher.clone(), engine_config()).unwrap();
    let provider = StaticRegions {
        revision: AtomicU64::new(1),
        regions: Mutex::new(layout()),
    };
    let mut source = ScriptedSource { samples: sweep() };

    let processed = engine.run(&mut source, &provider).await;
    assert_eq!(processed, 40);

    let keys = fetcher.keys.lock().unwrap().clone();
    assert!(keys.contains(&ResourceKey::new("/cards/0")));
    assert!(keys.iter().all(|k| k.as_str().starts_with("/cards/")), "fetched {keys:?}");

    let snapshot = engine.snapshot();
    assert_eq!(snapshot.index_stats.regions, 12);
    assert!(snapshot.prefetch_stats.fetches_started as usize == fetcher.calls.load(Ordering::SeqCst));
    assert!(snapshot
        .cache_entries
        .iter()
        .any(|e| e.status == CacheStatus::Complete));
}

#[tokio::test]
async fn test_failed_fetch_is_recorded_not_retried() {
    let fetcher = Arc::new(RecordingFetcher::default());
    let engine = ForesightEngine::new(TokioContext::shared(), fetcher.clone(), engine_config()).unwrap();
    let broken = Region::new(RegionId::from_index(1), 300.0, 320.0, 80.0, 80.0, "/cards/broken");
    engine
        .set_regions(viewport(0.0, 0.0, 1280.0, 720.0).unwrap(), &[broken])
        .unwrap();

    for sample in sweep().into_iter().take(20) {
        engine.on_sample(sample);
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    let key = ResourceKey::new("/cards/broken");
    assert_eq!(engine.cache_status(&key), Some(CacheStatus::Failed));
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    let entry = engine
        .snapshot()
        .cache_entries
        .into_iter()
        .find(|e| e.key == key)
        .unwrap();
    assert!(entry.error.unwrap().contains("503"));
}

#[tokio::test]
async fn test_clear_cache_mid_run_allows_refetch() {
    let fetcher = Arc::new(RecordingFetcher::default());
    let engine = ForesightEngine::new(TokioContext::shared(), fetcher.clone(), engine_config()).unwrap();
    engine
        .set_regions(viewport(0.0, 0.0, 1280.0, 720.0).unwrap(), &layout())
        .unwrap();

    let samples: Vec<Sample> = sweep().into_iter().collect();
    for sample in &samples[..16] {
        engine.on_sample(*sample);
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    let before = fetcher.calls.load(Ordering::SeqCst);
    assert!(before > 0);

    engine.clear_cache();
    assert!(engine.snapshot().cache_entries.is_empty());

    for sample in &samples[16..30] {
        engine.on_sample(*sample);
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    assert!(fetcher.calls.load(Ordering::SeqCst) > before);
}

#[tokio::test]
async fn test_shutdown_stops_run_loop() {
    let fetcher = Arc::new(RecordingFetcher::default());
    let engine = Arc::new(ForesightEngine::new(TokioContext::shared(), fetcher, engine_config()).unwrap());
    let provider = StaticRegions {
        revision: AtomicU64::new(1),
        regions: Mutex::new(layout()),
    };
    engine.shutdown();

    let mut source = ScriptedSource { samples: sweep() };
    assert_eq!(engine.run(&mut source, &provider).await, 0);
}
