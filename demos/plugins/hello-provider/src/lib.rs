//! Example plexus plugin.
//!
//! Provides a `greeter` contract implementation whose greeting is read from
//! the plugin's config, and runs a heartbeat on the host's timer while active.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use plexus_plugin_api::{
    Contract, Plugin, PluginContext, PluginError, RunFuture, Timer, export_plugin, guard_run,
    provide,
};
use tokio_util::sync::CancellationToken;

/// Default greeting when the config has none
const DEFAULT_GREETING: &str = "hello";

const HEARTBEAT: Duration = Duration::from_secs(10);

pub trait Greeter: Send + Sync {
    fn greet(&self, name: &str) -> String;
}

impl Contract for dyn Greeter {
    const CATEGORY: &'static str = "greeter";
}

struct ConfiguredGreeter {
    greeting: String,
}

impl Greeter for ConfiguredGreeter {
    fn greet(&self, name: &str) -> String {
        format!("{}, {name}", self.greeting)
    }
}

pub struct HelloPlugin {
    plugin_id: String,
    greeting: String,
    timer: Option<Arc<dyn Timer>>,
}

impl Default for HelloPlugin {
    fn default() -> Self {
        Self {
            plugin_id: String::new(),
            greeting: DEFAULT_GREETING.to_string(),
            timer: None,
        }
    }
}

#[async_trait]
impl Plugin for HelloPlugin {
    async fn configure(&mut self, ctx: &PluginContext) -> Result<(), PluginError> {
        self.plugin_id = ctx.plugin_id().to_string();
        if let Some(greeting) = ctx.config_get::<String>("greeting") {
            self.greeting = greeting;
        }
        self.timer = ctx.timer();
        ctx.log_info(&format!("greeting with '{}'", self.greeting));
        Ok(())
    }

    fn run(self: Arc<Self>, shutdown: CancellationToken) -> Option<RunFuture> {
        // This crate's tokio has no runtime entered inside the host, so
        // only the host timer and the shutdown token are awaited here.
        Some(guard_run(async move {
            let Some(timer) = self.timer.clone() else {
                shutdown.cancelled().await;
                return Ok(());
            };
            let mut beats = 0u64;
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    _ = timer.sleep(HEARTBEAT) => {
                        beats += 1;
                        tracing::info!(plugin = %self.plugin_id, beats, "Heartbeat");
                    }
                }
            }
            Ok(())
        }))
    }

    fn provide(&self, category: &str) -> Option<Arc<dyn Any + Send + Sync>> {
        (category == <dyn Greeter>::CATEGORY).then(|| {
            provide::<dyn Greeter>(Arc::new(ConfiguredGreeter {
                greeting: self.greeting.clone(),
            }))
        })
    }
}

export_plugin!(HelloPlugin);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_table_lists_hello_plugin() {
        let table = _plexus_plugin_entry_types();
        assert_eq!(table.len(), 1);
        assert_eq!(table[0].name, "HelloPlugin");
        assert!(table[0].create.is_some());
        assert_eq!(_plexus_plugin_api_version(), plexus_plugin_api::API_VERSION);
    }

    #[test]
    fn provides_greeter_only() {
        let plugin = HelloPlugin::default();
        let provided = plugin.provide("greeter").unwrap();
        let greeter = provided.downcast::<Arc<dyn Greeter>>().unwrap();
        assert_eq!(greeter.greet("ada"), "hello, ada");
        assert!(plugin.provide("storage").is_none());
    }

    struct Instant;

    impl Timer for Instant {
        fn sleep(&self, _duration: Duration) -> plexus_plugin_api::SleepFuture {
            Box::pin(tokio::task::yield_now())
        }
    }

    #[tokio::test]
    async fn heartbeat_uses_the_host_timer() {
        let plugin = Arc::new(HelloPlugin {
            timer: Some(Arc::new(Instant)),
            ..Default::default()
        });
        let token = CancellationToken::new();
        let run = tokio::spawn(plugin.run(token.clone()).unwrap());
        tokio::task::yield_now().await;
        token.cancel();
        assert!(run.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn run_stops_on_cancel() {
        let plugin = Arc::new(HelloPlugin::default());
        let token = CancellationToken::new();
        let run = plugin.run(token.clone()).unwrap();
        token.cancel();
        assert!(run.await.is_ok());
    }
}
