//! Contains the system configuration.
//!
//! Provides access to the system configuration which is loaded from a YAML file (commonly
//! **config/settings.yml**). Note that we observe this file for changes and reload it once a
//! change is detected. Therefore each user of the config should attach itself to the
//! [Config::notifier](Config::notifier) and re-process the config once a change message is
//! received.
//!
//! Being an in-memory cache library we want to prevent restarts / downtimes as much as
//! possible - a cache which has to restart for a port change starts cold.
//!
//! Note that the **Config** struct is kind of constant and can be created once and then kept
//! around. However, when using **Config::current()** to obtain the current config handle, this
//! should not be stored, as it will not be updated once a new config has been loaded.
//!
//! # Examples
//!
//! Obtaining and reading the config:
//! ```
//! # use callisto::config::Config;
//! let config = Config::new("config/settings.yml");
//! config.load_from_string("
//!     server:
//!         port: 2410
//! ", None).unwrap();
//!
//! let port = config.current().config()["server"]["port"].as_i64().unwrap_or(2410);
//! assert_eq!(port, 2410);
//! ```
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use arc_swap::ArcSwap;
use yaml_rust::{Yaml, YamlLoader};

use crate::spawn;

/// Specifies the interval in which the config file is checked for modifications.
const CHECK_FOR_CHANGE_INTERVAL: Duration = Duration::from_secs(2);

/// Provides access to the system configuration.
///
/// It is highly recommended to register a change listener by calling `Config::notifier()` as we
/// expect all components to pick up config changes without restarting the application.
pub struct Config {
    filename: String,
    tx: tokio::sync::broadcast::Sender<()>,
    config: ArcSwap<(Yaml, Option<SystemTime>)>,
}

/// Represents the change listener.
///
/// Internally this is simply the receiver of a broadcast. The actual message being broadcast
/// can and should be ignored. All that matters is, once a message has been received, the config
/// was changed and needs to be re-processed.
pub type ChangeNotifier = tokio::sync::broadcast::Receiver<()>;

/// Represents a handle to the currently loaded configuration.
///
/// Note that this handle should not be stored or kept around for long, as it will not be updated
/// if the underlying config changed.
pub struct Handle {
    config: Arc<(Yaml, Option<SystemTime>)>,
}

impl Handle {
    /// Provides access to the YAML document within this config handle.
    ///
    /// Missing keys simply yield `Yaml::BadValue`, therefore chained index lookups like
    /// `handle.config()["server"]["port"]` are always safe.
    pub fn config(&self) -> &Yaml {
        &self.config.0
    }
}

impl Config {
    /// Creates a new config reading the given file.
    ///
    /// Note that this will neither load the file nor install a change listener. This is only
    /// done by the [install](install) function.
    pub fn new(file: &str) -> Arc<Self> {
        let (tx, _) = tokio::sync::broadcast::channel(1);
        Arc::new(Config {
            filename: file.to_owned(),
            config: ArcSwap::new(Arc::new((Yaml::Null, None))),
            tx,
        })
    }

    /// Obtains a change notifier which receives a message once the config changed.
    pub fn notifier(&self) -> ChangeNotifier {
        self.tx.subscribe()
    }

    /// Obtains a handle to the currently loaded configuration.
    ///
    /// Note that this is a fairly efficient operation but still provides some overhead.
    /// Therefore this shouldn't be placed in an inner loop.
    pub fn current(&self) -> Handle {
        Handle {
            config: self.config.load_full(),
        }
    }

    /// Determines the last modified date of the config file on disk.
    ///
    /// As within docker, the file is presented as volume, we check that it is a file, as an
    /// unmounted docker volume is always presented as directory.
    async fn last_modified(&self) -> Option<SystemTime> {
        tokio::fs::metadata(&self.filename)
            .await
            .ok()
            .filter(|meta| meta.is_file())
            .and_then(|meta| meta.modified().ok())
    }

    /// Forces the config to read the underlying file.
    ///
    /// Note that this is normally called by the framework and should not be invoked manually.
    pub async fn load(&self) -> anyhow::Result<()> {
        log::info!("Loading config file {}...", &self.filename);

        if let Ok(metadata) = tokio::fs::metadata(&self.filename).await {
            if !metadata.is_file() {
                log::info!(
                    "Config file doesn't exist or is an unmounted docker volume - skipping \
                     config load."
                );
                return Ok(());
            }
        }

        let config_data = match tokio::fs::read_to_string(&self.filename).await {
            Ok(data) => data,
            Err(error) => {
                return Err(anyhow::anyhow!(
                    "Cannot load config file {}: {}",
                    &self.filename,
                    error
                ));
            }
        };

        let last_modified = self.last_modified().await;
        self.load_from_string(&config_data, last_modified)
    }

    /// Parses the given string into a config document and makes it the current config.
    ///
    /// This is the code path behind [load](Config::load) and also the way tests inject a
    /// config without touching the file system. All registered notifiers receive a change
    /// message.
    pub fn load_from_string(
        &self,
        data: &str,
        last_modified: Option<SystemTime>,
    ) -> anyhow::Result<()> {
        let mut docs = YamlLoader::load_from_str(data)
            .map_err(|error| anyhow::anyhow!("Cannot parse config: {}", error))?;

        let doc = if docs.is_empty() {
            Yaml::Null
        } else {
            docs.swap_remove(0)
        };

        self.config.store(Arc::new((doc, last_modified)));

        // An error here simply indicates that nobody is listening (yet) - which is fine...
        let _ = self.tx.send(());

        Ok(())
    }

    /// Determines if the file on disk is newer than the currently loaded config.
    async fn is_stale(&self) -> bool {
        match (self.config.load().1, self.last_modified().await) {
            (Some(loaded), Some(on_disk)) => on_disk > loaded,
            (None, Some(_)) => true,
            _ => false,
        }
    }
}

/// Creates a config for the given file, loads it once and keeps watching it for changes.
///
/// The returned config can (and should) be shared across all components of the process. The
/// spawned watch task checks the modification timestamp of the file every two seconds and
/// reloads the config once it changed - a failing reload keeps the previous config active.
pub async fn install(file: &str, watch: bool) -> Arc<Config> {
    let config = Config::new(file);

    if let Err(error) = config.load().await {
        log::error!("Failed to perform initial config load: {}", error);
    }

    if watch {
        let watched_config = config.clone();
        spawn!(async move {
            loop {
                tokio::time::sleep(CHECK_FOR_CHANGE_INTERVAL).await;

                if watched_config.is_stale().await {
                    log::info!("Config file changed. Reloading...");
                    if let Err(error) = watched_config.load().await {
                        log::error!("Failed to reload config: {}", error);
                    }
                }
            }
        });
    }

    config
}

#[cfg(test)]
mod tests {
    use crate::config::Config;
    use crate::testing::test_async;

    #[test]
    fn configs_can_be_loaded_from_strings() {
        let config = Config::new("config/missing.yml");
        config
            .load_from_string(
                "
                server:
                    host: 127.0.0.1
                    port: 7201
                cluster:
                    nodes:
                        - http://127.0.0.1:7201
                        - http://127.0.0.1:7202
                ",
                None,
            )
            .unwrap();

        let handle = config.current();
        assert_eq!(
            handle.config()["server"]["host"].as_str().unwrap(),
            "127.0.0.1"
        );
        assert_eq!(handle.config()["server"]["port"].as_i64().unwrap(), 7201);
        assert_eq!(
            handle.config()["cluster"]["nodes"]
                .as_vec()
                .unwrap()
                .len(),
            2
        );

        // Missing keys are simply bad values instead of errors...
        assert_eq!(handle.config()["unknown"]["key"].as_str(), None);
    }

    #[test]
    fn change_listeners_are_notified() {
        test_async(async {
            let config = Config::new("config/missing.yml");
            let mut notifier = config.notifier();

            config.load_from_string("server: { port: 1 }", None).unwrap();
            notifier.recv().await.unwrap();
        });
    }

    #[test]
    fn a_missing_file_is_reported_and_keeps_the_config_untouched() {
        test_async(async {
            let config = Config::new("config/definitely-missing.yml");
            assert_eq!(config.load().await.is_err(), true);
            assert_eq!(config.current().config().is_null(), true);
        });
    }

    #[test]
    fn invalid_yaml_is_reported() {
        let config = Config::new("config/missing.yml");
        assert_eq!(
            config
                .load_from_string("server: [unbalanced", None)
                .is_err(),
            true
        );
    }
}
