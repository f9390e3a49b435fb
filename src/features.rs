//! Features built on the injection core. Each one finds its target in the host, patches it on
//! `start`, and takes every patch off again on `stop`.

pub mod badges;

use async_trait::async_trait;
use futures::future::join_all;

use crate::error::Result;

#[async_trait]
pub trait Feature: Send + Sync {
    fn name(&self) -> &'static str;

    /// Finds the feature's targets and installs its patches. This waits until the host has loaded
    /// the modules the feature needs.
    async fn start(&self) -> Result<()>;

    /// Removes everything `start` installed. Safe to call more than once.
    fn stop(&self);
}

/// The set of features a host has turned on.
#[derive(Default)]
pub struct Features {
    features: Vec<Box<dyn Feature>>,
}

impl Features {
    pub fn new() -> Features {
        Features::default()
    }

    pub fn add(&mut self, feature: impl Feature + 'static) {
        self.features.push(Box::new(feature));
    }

    /// Starts every feature at once, since each may wait indefinitely for its module. A feature
    /// that fails to start is logged, and the names of the ones that failed are returned in the
    /// order the features were added.
    pub async fn start_all(&self) -> Vec<&'static str> {
        let starts = self.features.iter().map(|feature| async move {
            match feature.start().await {
                Ok(()) => {
                    log::info!("started {}", feature.name());
                    None
                }

                Err(err) => {
                    log::error!("unable to start {}: {err}", feature.name());
                    Some(feature.name())
                }
            }
        });

        join_all(starts).await.into_iter().flatten().collect()
    }

    pub fn stop_all(&self) {
        for feature in &self.features {
            feature.stop();
            log::info!("stopped {}", feature.name());
        }
    }
}
