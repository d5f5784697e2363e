//! End-to-end selection tests: registry, router and fan-out together

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use plexus_core::error::{BoxError, InvokeError};
use plexus_core::fanout::ErrorPolicy;
use plexus_core::selection::{PickOne, SelectionCache, SelectionStrategy, Sharded};
use plexus_core::{ProviderRegistry, Router, RoutingConfig};
use plexus_plugin_api::{CapabilityDescriptor, Contract, Metadata, Priority};

#[async_trait]
trait Analytics: Send + Sync {
    fn name(&self) -> &str;
    async fn track(&self, event: &str) -> Result<String, BoxError>;
}

impl Contract for dyn Analytics {
    const CATEGORY: &'static str = "analytics";
}

struct Sink {
    name: String,
    fail: bool,
    calls: AtomicUsize,
}

impl Sink {
    fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            fail: false,
            calls: AtomicUsize::new(0),
        })
    }

    fn failing(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            fail: true,
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Analytics for Sink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn track(&self, event: &str) -> Result<String, BoxError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(5)).await;
        if self.fail {
            return Err(format!("{} is down", self.name).into());
        }
        Ok(format!("{}:{event}", self.name))
    }
}

fn event(name: &str) -> Metadata {
    let mut metadata = Metadata::new();
    metadata.insert("event".into(), name.into());
    metadata
}

#[tokio::test]
async fn pick_one_prefers_priority_and_falls_back_after_unregister() {
    let registry = ProviderRegistry::new();
    let cache = Arc::new(SelectionCache::new());
    let _watch = cache.spawn_invalidator(&registry);
    let strategy = SelectionStrategy::from(
        PickOne::new().with_cache(Arc::clone(&cache), Duration::from_secs(30)),
    );

    registry
        .register::<dyn Analytics>(Sink::new("p1"), CapabilityDescriptor::new("P1"))
        .unwrap();
    let p2 = registry
        .register::<dyn Analytics>(
            Sink::new("p2"),
            CapabilityDescriptor::new("P2").with_priority(Priority::High),
        )
        .unwrap();

    let providers = registry.providers::<dyn Analytics>();
    let first = providers.select(&strategy, Metadata::new()).unwrap();
    assert_eq!(first.provider_ids(), vec!["P2"]);
    // Served again, now from the cache
    let again = providers.select(&strategy, Metadata::new()).unwrap();
    assert_eq!(again.provider_ids(), vec!["P2"]);
    assert_eq!(cache.len(), 1);

    assert!(registry.unregister(&p2));
    let after = providers.select(&strategy, Metadata::new()).unwrap();
    assert_eq!(after.provider_ids(), vec!["P1"]);
}

#[tokio::test]
async fn register_then_unregister_restores_previous_set() {
    let registry = ProviderRegistry::new();
    registry
        .register::<dyn Analytics>(Sink::new("a"), CapabilityDescriptor::new("a"))
        .unwrap();
    let before: Vec<String> = registry
        .registrations::<dyn Analytics>()
        .iter()
        .map(|r| r.provider_id().to_string())
        .collect();

    let temp = registry
        .register::<dyn Analytics>(Sink::new("b"), CapabilityDescriptor::new("b"))
        .unwrap();
    registry.unregister(&temp);

    let after: Vec<String> = registry
        .registrations::<dyn Analytics>()
        .iter()
        .map(|r| r.provider_id().to_string())
        .collect();
    assert_eq!(before, after);
}

#[tokio::test]
async fn sharded_routes_by_event_prefix() {
    let registry = ProviderRegistry::new();
    for id in ["a", "b", "c"] {
        registry
            .register::<dyn Analytics>(Sink::new(id), CapabilityDescriptor::new(id))
            .unwrap();
    }

    let sharded = Sharded::new().with_route("system", "c");
    assert_eq!(sharded.shard_key(&event("player.level.complete")), "player");
    assert_eq!(sharded.shard_key(&event("system.error")), "system");
    assert_eq!(sharded.shard_key(&event("noop")), "default");

    let strategy = SelectionStrategy::from(sharded);
    let providers = registry.providers::<dyn Analytics>();

    let mapped = providers.select(&strategy, event("system.error")).unwrap();
    assert_eq!(mapped.provider_ids(), vec!["c"]);

    // Unmapped keys hash consistently
    let first = providers.select(&strategy, event("player.login")).unwrap();
    for _ in 0..10 {
        let again = providers.select(&strategy, event("player.level.complete")).unwrap();
        assert_eq!(first.provider_ids(), again.provider_ids());
    }
    assert_eq!(first.len(), 1);
}

#[tokio::test]
async fn fan_out_continue_reports_every_failure() {
    let registry = ProviderRegistry::new();
    let sinks = [
        Sink::new("ok-1"),
        Sink::failing("bad-1"),
        Sink::new("ok-2"),
        Sink::failing("bad-2"),
    ];
    for sink in &sinks {
        registry
            .register::<dyn Analytics>(
                Arc::clone(sink) as Arc<dyn Analytics>,
                CapabilityDescriptor::new(sink.name()),
            )
            .unwrap();
    }

    let router = Router::from_config(
        &RoutingConfig::from_toml_str("[categories.analytics]\nstrategy = \"fan_out\"\n").unwrap(),
    );
    let providers = registry.providers::<dyn Analytics>();
    let err = providers
        .invoke_all(
            &router.strategy_for::<dyn Analytics>(),
            providers.context(),
            ErrorPolicy::Continue,
            |sink, _| async move { sink.track("session.start").await },
        )
        .await
        .unwrap_err();

    let InvokeError::Aggregate(failure) = err else {
        panic!("expected aggregate failure, got {err}");
    };
    assert_eq!(failure.attempted, 4);
    let mut failed = failure.provider_ids();
    failed.sort();
    assert_eq!(failed, vec!["bad-1", "bad-2"]);
    assert_eq!(failure.successes.len(), 2);
    // Every provider was called even though some failed
    assert!(sinks.iter().all(|s| s.calls.load(Ordering::SeqCst) == 1));
}

#[tokio::test]
async fn fan_out_continue_returns_all_successes() {
    let registry = ProviderRegistry::new();
    for id in ["x", "y", "z"] {
        registry
            .register::<dyn Analytics>(Sink::new(id), CapabilityDescriptor::new(id))
            .unwrap();
    }

    let router = Router::default().with_strategy("analytics", SelectionStrategy::FanOut(Default::default()));
    let providers = registry.providers::<dyn Analytics>();
    let summary = providers
        .aggregate(
            &router.strategy_for::<dyn Analytics>(),
            providers.context(),
            ErrorPolicy::Continue,
            |sink, _| async move { sink.track("tick").await },
            |mut results| {
                results.sort();
                results.join(",")
            },
        )
        .await
        .unwrap();
    assert_eq!(summary, "x:tick,y:tick,z:tick");
}

#[tokio::test]
async fn fan_out_continue_keeps_successes_alongside_failures() {
    let registry = ProviderRegistry::new();
    let sinks = [Sink::new("ok-1"), Sink::new("ok-2"), Sink::failing("bad")];
    for sink in &sinks {
        registry
            .register::<dyn Analytics>(
                Arc::clone(sink) as Arc<dyn Analytics>,
                CapabilityDescriptor::new(sink.name()),
            )
            .unwrap();
    }

    let strategy = SelectionStrategy::FanOut(Default::default());
    let providers = registry.providers::<dyn Analytics>();
    let err = providers
        .aggregate(
            &strategy,
            providers.context(),
            ErrorPolicy::Continue,
            |sink, _| async move { sink.track("tick").await },
            |results| results.join(","),
        )
        .await
        .unwrap_err();

    let InvokeError::Aggregate(failure) = err else {
        panic!("expected aggregate failure");
    };
    assert_eq!(failure.attempted, 3);
    assert_eq!(failure.provider_ids(), vec!["bad"]);
    let mut successes = failure.successes;
    successes.sort();
    assert_eq!(successes, vec!["ok-1:tick", "ok-2:tick"]);
}

#[tokio::test]
async fn fan_out_fail_fast_surfaces_first_failure_only() {
    let registry = ProviderRegistry::new();
    let sinks = [Sink::new("ok"), Sink::failing("bad-1"), Sink::failing("bad-2")];
    for sink in &sinks {
        registry
            .register::<dyn Analytics>(
                Arc::clone(sink) as Arc<dyn Analytics>,
                CapabilityDescriptor::new(sink.name()),
            )
            .unwrap();
    }

    let strategy = SelectionStrategy::FanOut(Default::default());
    let providers = registry.providers::<dyn Analytics>();
    let err = providers
        .invoke_all(
            &strategy,
            providers.context(),
            ErrorPolicy::FailFast,
            |sink, _| async move { sink.track("tick").await },
        )
        .await
        .unwrap_err();

    let InvokeError::Aggregate(failure) = err else {
        panic!("expected aggregate failure");
    };
    assert_eq!(failure.failures.len(), 1);
    assert!(failure.provider_ids()[0].starts_with("bad"));
    assert!(failure.successes.is_empty());
    // Already-started calls were not abandoned
    assert!(sinks.iter().all(|s| s.calls.load(Ordering::SeqCst) == 1));
}

#[tokio::test]
async fn no_match_is_an_empty_selection() {
    let registry = ProviderRegistry::new();
    let strategy = SelectionStrategy::default();
    let providers = registry.providers::<dyn Analytics>();

    assert!(providers.select(&strategy, Metadata::new()).unwrap().is_empty());
    let value = providers
        .invoke_one(&strategy, providers.context(), |sink, _| async move {
            sink.track("nobody").await
        })
        .await
        .unwrap();
    assert!(value.is_none());
}
