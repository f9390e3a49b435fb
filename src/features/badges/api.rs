//! The badge data served for each user, and the client that fetches it.

use std::sync::Arc;

use async_trait::async_trait;
use eyre::{Result, WrapErr};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, EnumIter};

use crate::{
    cache::{Fetch, Response},
    meta::settings::SettingsSource,
};

/// Badge kinds, in the order they are displayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum BadgeKind {
    Booster,
    Contributor,
    Developer,
    Early,
    Hunter,
    Staff,
    Support,
    Translator,
}

/// A user-chosen badge with its own name and icon.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CustomBadge {
    pub name: Option<String>,
    pub icon: Option<String>,
    pub color: Option<String>,
}

/// Every badge one user has.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BadgeSet {
    pub booster: bool,
    pub contributor: bool,
    pub developer: bool,
    pub early: bool,
    pub hunter: bool,
    pub staff: bool,
    pub support: bool,
    pub translator: bool,
    pub custom: Option<CustomBadge>,
}

impl BadgeSet {
    pub fn has(&self, kind: BadgeKind) -> bool {
        match kind {
            BadgeKind::Booster => self.booster,
            BadgeKind::Contributor => self.contributor,
            BadgeKind::Developer => self.developer,
            BadgeKind::Early => self.early,
            BadgeKind::Hunter => self.hunter,
            BadgeKind::Staff => self.staff,
            BadgeKind::Support => self.support,
            BadgeKind::Translator => self.translator,
        }
    }

    /// The custom badge, but only if it has both a name and an icon to show.
    pub fn displayable_custom(&self) -> Option<(&str, &str)> {
        let custom = self.custom.as_ref()?;
        Some((custom.name.as_deref()?, custom.icon.as_deref()?))
    }

    pub fn colour(&self) -> Option<&str> {
        self.custom.as_ref()?.color.as_deref()
    }
}

#[derive(Deserialize)]
struct UserBody {
    #[serde(default)]
    badges: BadgeSet,
}

/// Fetches badges from `{apiUrl}/api/v1/users/{id}`. The base URL is read from settings on every
/// request so that changing it takes effect straight away.
pub struct UserApi {
    client: reqwest::Client,
    settings: Arc<dyn SettingsSource>,
}

impl UserApi {
    pub fn new(settings: Arc<dyn SettingsSource>) -> UserApi {
        UserApi {
            client: reqwest::Client::new(),
            settings,
        }
    }

    fn user_url(&self, id: &str) -> String {
        let base = self
            .settings
            .string("apiUrl")
            .unwrap_or_else(|| "https://replugged.dev".to_string());

        format!("{}/api/v1/users/{id}", base.trim_end_matches('/'))
    }
}

#[async_trait]
impl Fetch for UserApi {
    type Value = BadgeSet;

    async fn fetch(&self, id: &str) -> Result<Response<BadgeSet>> {
        let url = self.user_url(id);

        let response = self
            .client
            .get(&url)
            .header(reqwest::header::USER_AGENT, "rehook")
            .send()
            .await
            .wrap_err_with(|| format!("request to {url} failed"))?;

        let status = response.status().as_u16();
        let body = response.bytes().await.wrap_err("unable to read body")?;

        let payload = match serde_json::from_slice::<UserBody>(&body) {
            Ok(body) => Some(body.badges),

            // Only a successful response has to have a usable body.
            Err(err) if status == 200 => {
                return Err(err).wrap_err_with(|| format!("bad body from {url}"));
            }

            Err(_) => None,
        };

        Ok(Response { status, payload })
    }
}
