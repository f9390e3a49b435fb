//! Shows extra badges on user profiles.
//!
//! The host renders a user's badges with an unnamed function that can only be recognised by a
//! string in its body. We patch it to append our own badge elements to what it renders, using
//! badge data fetched per user and cached for `REFRESH_INTERVAL`.

mod api;

use std::sync::Arc;

use async_trait::async_trait;
use strum::IntoEnumIterator;

use super::Feature;
use crate::{
    cache::{Fetch, RefreshCache},
    error::{Error, Result},
    hook::Injector,
    meta::settings::SettingsSource,
    modules::{filters, Locator},
    value::{Function, List, Object, Value},
};
pub use api::{BadgeKind, BadgeSet, CustomBadge, UserApi};

/// Appears in the source of the host's badge list function.
const BADGE_SOURCE: &str = ".GUILD_BOOSTER_LEVEL_1,";

/// Exported by the host's stylesheet module; the badge container needs this class to lay out its
/// children.
const CONTAINER_PROP: &str = "containerWithContent";

const CONTAINER_CLASS: &str = "rehook-badges-container";

pub struct Badges<F: Fetch<Value = BadgeSet> = UserApi> {
    locator: Locator,
    settings: Arc<dyn SettingsSource>,
    cache: RefreshCache<F>,
    injector: Injector,
}

impl<F: Fetch<Value = BadgeSet>> Badges<F> {
    pub fn new(locator: Locator, settings: Arc<dyn SettingsSource>, fetcher: F) -> Badges<F> {
        Badges::with_cache(locator, settings, RefreshCache::new(fetcher))
    }

    pub fn with_cache(
        locator: Locator,
        settings: Arc<dyn SettingsSource>,
        cache: RefreshCache<F>,
    ) -> Badges<F> {
        Badges {
            locator,
            settings,
            cache,
            injector: Injector::new(),
        }
    }

    /// The badge cache. Subscribe to it to find out when a user's badges should be re-rendered.
    pub fn cache(&self) -> &RefreshCache<F> {
        &self.cache
    }

    fn container_class(&self) -> Option<String> {
        self.locator
            .get_export_for_props(&[CONTAINER_PROP])?
            .get(CONTAINER_PROP)?
            .as_str()
            .map(str::to_owned)
    }
}

#[async_trait]
impl<F: Fetch<Value = BadgeSet>> Feature for Badges<F> {
    fn name(&self) -> &'static str {
        "badges"
    }

    async fn start(&self) -> Result<()> {
        if !self.injector.is_empty() {
            log::debug!("badge function is already patched");
            return Ok(());
        }

        let module = self.locator.wait_for(filters::by_source(BADGE_SOURCE)).await;

        let method = module.function_name().ok_or_else(|| {
            Error::TargetUnresolved(format!("no badge function in module {}", module.id()))
        })?;

        let container = self.container_class().ok_or_else(|| {
            Error::TargetUnresolved(format!("no `{CONTAINER_PROP}` class found"))
        })?;

        let settings = self.settings.clone();
        let cache = self.cache.clone();

        self.injector
            .after(module.exports(), &method, move |args, res| {
                Ok(decorate(&*settings, &cache, &container, args, res))
            })?;

        log::info!("patched badge function `{method}` in module {}", module.id());
        Ok(())
    }

    fn stop(&self) {
        // The cache is left alone so that a restart doesn't have to fetch everything again.
        self.injector.uninject_all();
    }
}

/// Reads `args[0].user.id`.
fn user_id(args: &[Value]) -> Option<String> {
    let id = args.first()?.get("user")?.get("id")?;
    id.as_str().map(str::to_owned)
}

/// Renders the element once and makes its `type` hand back that rendering, so that we can add to
/// it and the host still sees a normal element. Returns the rendered object.
fn memoize(element: &Object) -> Option<Object> {
    let render = element.get("type")?;
    let render = render.as_function()?;

    let rendered = match render.call(&[element.get("props").unwrap_or_default()]) {
        Ok(rendered) => rendered,
        Err(err) => {
            log::warn!("unable to render badge list: {err:?}");
            return None;
        }
    };

    let rendered_object = rendered.as_object()?.clone();
    element.set("type", Function::new(move |_| Ok(rendered.clone())));

    Some(rendered_object)
}

fn badge_element(kind: &str, props: Object) -> Value {
    Object::new()
        .with("type", kind)
        .with("props", props)
        .into()
}

fn colour_value(colour: Option<&str>) -> Value {
    colour.map_or(Value::Null, Value::from)
}

/// Appends `class` to an element's class list unless it's already there.
fn add_class(props: &Object, class: &str) {
    let current = props
        .get("className")
        .and_then(|value| value.as_str().map(str::to_owned))
        .unwrap_or_default();

    if current.split_whitespace().any(|existing| existing == class) {
        return;
    }

    let joined = if current.is_empty() {
        class.to_string()
    } else {
        format!("{current} {class}")
    };

    props.set("className", joined);
}

/// The patch body. Anything unexpected hands the host's result back untouched.
fn decorate<F: Fetch<Value = BadgeSet>>(
    settings: &dyn SettingsSource,
    cache: &RefreshCache<F>,
    container: &str,
    args: &[Value],
    res: Value,
) -> Value {
    if !settings.flag("badges", true) {
        return res;
    }

    let Some(user_id) = user_id(args) else {
        return res;
    };

    let Some(element) = res.as_object() else {
        return res;
    };

    let Some(rendered) = memoize(element) else {
        return res;
    };

    // Whatever we have now is used straight away. If a refresh was started, subscribers will be
    // told when it lands and can render again.
    let Some(badges) = cache.get(&user_id) else {
        return res;
    };

    let Some(props) = rendered.get("props").and_then(|props| props.as_object().cloned()) else {
        return res;
    };

    let children = match props.get("children").and_then(|c| c.as_list().cloned()) {
        Some(children) => children,
        None => {
            let children = List::new();
            props.set("children", children.clone());
            children
        }
    };

    if let Some((name, icon)) = badges.displayable_custom() {
        children.push(badge_element(
            "custom-badge",
            Object::new().with("url", icon).with("name", name),
        ));
    }

    for kind in BadgeKind::iter().filter(|kind| badges.has(*kind)) {
        let name: &str = kind.as_ref();

        children.push(badge_element(
            "badge",
            Object::new()
                .with("kind", name)
                .with("color", colour_value(badges.colour())),
        ));
    }

    if !children.is_empty() {
        add_class(&props, container);
        add_class(&props, CONTAINER_CLASS);
    }

    res
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cache::Response,
        meta::settings::{GeneralSettings, Settings},
        modules::ModuleCache,
    };
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    struct FakeApi {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Fetch for FakeApi {
        type Value = BadgeSet;

        async fn fetch(&self, id: &str) -> eyre::Result<Response<BadgeSet>> {
            self.calls.fetch_add(1, Ordering::SeqCst);

            if id == "nobody" {
                return Ok(Response {
                    status: 404,
                    payload: None,
                });
            }

            Ok(Response {
                status: 200,
                payload: Some(BadgeSet {
                    staff: true,
                    developer: true,
                    custom: Some(CustomBadge {
                        name: Some("Cool".to_string()),
                        icon: Some("cool.png".to_string()),
                        color: Some("#ff0000".to_string()),
                    }),
                    ..BadgeSet::default()
                }),
            })
        }
    }

    /// The host's badge list: returns an element whose `type` renders an empty container.
    fn badge_list() -> Function {
        Function::new(|args| {
            let render = Function::new(|_| {
                Ok(Object::new()
                    .with(
                        "props",
                        Object::new()
                            .with("className", "container")
                            .with("children", List::new()),
                    )
                    .into())
            });

            Ok(Object::new()
                .with("props", args.first().cloned().unwrap_or_default())
                .with("type", render)
                .into())
        })
    }

    struct Host {
        modules: Arc<ModuleCache>,
        settings: Arc<Settings>,
        calls: Arc<AtomicUsize>,
        badges: Badges<FakeApi>,
    }

    fn host() -> Host {
        let modules = Arc::new(ModuleCache::new());
        let settings = Arc::new(Settings::in_memory(GeneralSettings::default()));
        let calls = Arc::new(AtomicUsize::new(0));

        let badges = Badges::new(
            Locator::new(modules.clone()),
            settings.clone(),
            FakeApi {
                calls: calls.clone(),
            },
        );

        Host {
            modules,
            settings,
            calls,
            badges,
        }
    }

    fn load_host_modules(modules: &ModuleCache) -> Object {
        modules.register(
            "classes",
            Object::new().with(CONTAINER_PROP, "containerWithContent-abc"),
            "",
        );

        let exports = Object::new()
            .with("displayName", "UserBadges")
            .with("Z", badge_list());

        modules.register(
            "badges",
            exports.clone(),
            "function(e){switch(e){case t.GUILD_BOOSTER_LEVEL_1,:return 1}}",
        );

        exports
    }

    fn render(exports: &Object, user: &str) -> Object {
        let props = Object::new().with("user", Object::new().with("id", user));

        let element = exports
            .get("Z")
            .unwrap()
            .as_function()
            .unwrap()
            .call(&[props.into()])
            .unwrap();

        let element = element.as_object().unwrap().clone();
        let rendered = element.get("type").unwrap().as_function().unwrap().call(&[]);

        rendered
            .unwrap()
            .get("props")
            .unwrap()
            .as_object()
            .unwrap()
            .clone()
    }

    fn child_types(props: &Object) -> Vec<String> {
        props
            .get("children")
            .unwrap()
            .as_list()
            .unwrap()
            .to_vec()
            .iter()
            .map(|child| child.get("type").unwrap().as_str().unwrap().to_string())
            .collect()
    }

    #[tokio::test]
    async fn badges_appear_once_fetched() {
        let host = host();
        let exports = load_host_modules(&host.modules);
        let original = exports.get("Z").unwrap();

        host.badges.start().await.unwrap();
        assert_ne!(exports.get("Z").unwrap(), original);

        let mut updates = host.badges.cache().subscribe();

        // Nothing cached yet, so the host's rendering is untouched.
        let first = render(&exports, "1");
        assert!(child_types(&first).is_empty());
        assert_eq!(updates.recv().await.unwrap(), "1");

        let second = render(&exports, "1");
        assert_eq!(child_types(&second), vec!["custom-badge", "badge", "badge"]);

        let class = second.get("className").unwrap();
        assert_eq!(
            class.as_str(),
            Some("container containerWithContent-abc rehook-badges-container")
        );

        let staff = second.get("children").unwrap().as_list().unwrap().get(2).unwrap();
        assert_eq!(staff.get("props").unwrap().get("kind").unwrap().as_str(), Some("staff"));
        assert_eq!(
            staff.get("props").unwrap().get("color").unwrap().as_str(),
            Some("#ff0000")
        );

        assert_eq!(host.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn starting_twice_patches_once() {
        let host = host();
        let exports = load_host_modules(&host.modules);

        host.badges.start().await.unwrap();
        host.badges.start().await.unwrap();
        assert_eq!(host.badges.injector.len(), 1);

        let mut updates = host.badges.cache().subscribe();
        render(&exports, "1");
        updates.recv().await.unwrap();

        let rendered = render(&exports, "1");
        assert_eq!(child_types(&rendered), vec!["custom-badge", "badge", "badge"]);

        // One stop is enough to undo it.
        host.badges.stop();
        assert!(!exports.get("Z").unwrap().as_function().unwrap().is_patched());
    }

    #[tokio::test]
    async fn start_waits_for_the_module() {
        let host = host();
        let start = host.badges.start();
        tokio::pin!(start);

        assert!(
            tokio::time::timeout(Duration::from_millis(10), &mut start)
                .await
                .is_err()
        );

        let exports = load_host_modules(&host.modules);
        start.await.unwrap();

        assert!(exports.get("Z").unwrap().as_function().unwrap().is_patched());
    }

    #[tokio::test]
    async fn disabled_setting_passes_through() {
        let host = host();
        let exports = load_host_modules(&host.modules);
        host.badges.start().await.unwrap();

        host.settings.update(|values| values.badges = false);

        let rendered = render(&exports, "1");
        assert!(child_types(&rendered).is_empty());
        assert_eq!(host.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn users_without_badges_render_unchanged() {
        let host = host();
        let exports = load_host_modules(&host.modules);
        host.badges.start().await.unwrap();

        let mut updates = host.badges.cache().subscribe();
        render(&exports, "nobody");
        updates.recv().await.unwrap();

        let rendered = render(&exports, "nobody");
        assert!(child_types(&rendered).is_empty());
        assert_eq!(rendered.get("className").unwrap().as_str(), Some("container"));
    }

    #[tokio::test]
    async fn stop_restores_the_host_and_keeps_the_cache() {
        let host = host();
        let exports = load_host_modules(&host.modules);
        let original = exports.get("Z").unwrap();

        host.badges.start().await.unwrap();

        let mut updates = host.badges.cache().subscribe();
        render(&exports, "1");
        updates.recv().await.unwrap();

        host.badges.stop();
        host.badges.stop();

        assert_eq!(exports.get("Z").unwrap(), original);
        assert!(child_types(&render(&exports, "1")).is_empty());
        assert!(host.badges.cache().peek("1").is_some());
    }

    #[tokio::test]
    async fn module_without_a_function_is_unresolved() {
        let host = host();

        host.modules.register(
            "decoy",
            Object::new().with("label", "GUILD_BOOSTER"),
            "x.GUILD_BOOSTER_LEVEL_1,",
        );

        assert!(matches!(
            host.badges.start().await,
            Err(Error::TargetUnresolved(_))
        ));
    }

    #[tokio::test]
    async fn missing_container_class_is_unresolved() {
        let host = host();

        host.modules.register(
            "badges",
            Object::new().with("Z", badge_list()),
            "case t.GUILD_BOOSTER_LEVEL_1,:",
        );

        assert!(matches!(
            host.badges.start().await,
            Err(Error::TargetUnresolved(_))
        ));
        assert_eq!(host.badges.injector.len(), 0);
    }
}
