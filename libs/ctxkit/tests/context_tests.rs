//! Context-level behaviour: scopes, lookup chain, locking, aliases, deep
//! paths, tag queries, observers and lifecycle.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use ctxkit::{
    Binding, BindingFilter, BindingOperation, BindingScope, BoundValue, Context, ContextError,
    ContextEvent, ContextEventType, FilteredObserver, ResolutionOptions, TagFilter,
    ValueOrPromise,
};
use serde_json::{json, Value};

/// A fresh object per call, compared by identity.
#[derive(Debug)]
struct Fresh;

fn bind_fresh(ctx: &Context, key: &str) -> Binding {
    let binding = ctx.bind(key).unwrap();
    binding.to_dynamic_value(|_| Ok(ValueOrPromise::Ready(Fresh)));
    binding
}

fn counter_binding(ctx: &Context, key: &str) -> (Binding, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let binding = ctx.bind(key).unwrap();
    binding.to_dynamic_value(move |_| {
        Ok(ValueOrPromise::Ready(counter.fetch_add(1, Ordering::SeqCst)))
    });
    (binding, calls)
}

#[test]
fn transient_values_are_fresh() {
    let ctx = Context::new();
    bind_fresh(&ctx, "b");
    let first = ctx.get_sync::<Fresh>("b").unwrap();
    let second = ctx.get_sync::<Fresh>("b").unwrap();
    assert!(!Arc::ptr_eq(&first, &second));
}

#[test]
fn singleton_is_shared_with_descendants() {
    let parent = Context::named("parent");
    bind_fresh(&parent, "b").in_scope(BindingScope::Singleton);
    let child = parent.child(Some("child"));
    let sibling = parent.child(Some("sibling"));

    let from_parent = parent.get_sync::<Fresh>("b").unwrap();
    let from_child = child.get_sync::<Fresh>("b").unwrap();
    let from_sibling = sibling.get_sync::<Fresh>("b").unwrap();
    assert!(Arc::ptr_eq(&from_parent, &from_child));
    assert!(Arc::ptr_eq(&from_child, &from_sibling));
}

#[test]
fn singleton_resolved_from_child_first_is_cached_in_owner() {
    let parent = Context::named("parent");
    bind_fresh(&parent, "b").in_scope(BindingScope::Singleton);
    let child = parent.child(None);

    let from_child = child.get_sync::<Fresh>("b").unwrap();
    let from_parent = parent.get_sync::<Fresh>("b").unwrap();
    assert!(Arc::ptr_eq(&from_parent, &from_child));
}

#[test]
fn context_scope_is_per_resolving_context() {
    let parent = Context::named("parent");
    bind_fresh(&parent, "b").in_scope(BindingScope::Context);
    let child = parent.child(Some("child"));

    let from_parent = parent.get_sync::<Fresh>("b").unwrap();
    let from_child = child.get_sync::<Fresh>("b").unwrap();
    let again = child.get_sync::<Fresh>("b").unwrap();
    assert!(!Arc::ptr_eq(&from_parent, &from_child));
    assert!(Arc::ptr_eq(&from_child, &again));
}

#[test]
fn changing_scope_discards_cache() {
    let ctx = Context::new();
    let (binding, calls) = counter_binding(&ctx, "n");
    binding.in_scope(BindingScope::Singleton);
    ctx.get_sync::<usize>("n").unwrap();
    ctx.get_sync::<usize>("n").unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    binding.in_scope(BindingScope::Context);
    ctx.get_sync::<usize>("n").unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn locked_binding_cannot_be_rebound_until_unlocked() {
    let ctx = Context::new();
    ctx.bind("x").unwrap().to(1u32).lock();

    let err = ctx.bind("x").unwrap_err();
    assert!(matches!(err, ContextError::BindingIsLocked { ref key } if key == "x"));
    assert!(matches!(
        ctx.unbind("x").unwrap_err(),
        ContextError::BindingIsLocked { .. }
    ));
    assert_eq!(*ctx.get_sync::<u32>("x").unwrap(), 1);

    ctx.get_binding("x").unwrap().unlock();
    ctx.bind("x").unwrap().to(2u32);
    assert_eq!(*ctx.get_sync::<u32>("x").unwrap(), 2);
}

#[test]
fn unbind_is_a_noop_for_missing_keys() {
    let ctx = Context::new();
    assert!(!ctx.unbind("missing").unwrap());
    ctx.bind("x").unwrap().to(1u8);
    assert!(ctx.unbind("x").unwrap());
    assert!(!ctx.is_bound("x"));
}

#[test]
fn unbind_rejects_property_paths() {
    let ctx = Context::new();
    ctx.bind("x").unwrap().to(json!({"a": {"b": 1}}));
    assert!(matches!(
        ctx.unbind("x#a.b").unwrap_err(),
        ContextError::InvalidBindingKey { .. }
    ));
    assert!(ctx.contains("x"));
    assert!(ctx.unbind("x").unwrap());
}

#[test]
fn refresh_recomputes_singleton() {
    let ctx = Context::new();
    let (binding, _) = counter_binding(&ctx, "counter");
    binding.in_scope(BindingScope::Singleton);

    assert_eq!(*ctx.get_sync::<usize>("counter").unwrap(), 0);
    assert_eq!(*ctx.get_sync::<usize>("counter").unwrap(), 0);
    binding.refresh(&ctx);
    assert_eq!(*ctx.get_sync::<usize>("counter").unwrap(), 1);
}

#[test]
fn refresh_from_child_targets_owner_for_singletons() {
    let parent = Context::new();
    let (binding, _) = counter_binding(&parent, "counter");
    binding.in_scope(BindingScope::Singleton);
    let child = parent.child(None);

    assert_eq!(*parent.get_sync::<usize>("counter").unwrap(), 0);
    binding.refresh(&child);
    assert_eq!(*parent.get_sync::<usize>("counter").unwrap(), 1);
}

#[test]
fn alias_resolves_target_for_any_scope() {
    for scope in [
        BindingScope::Transient,
        BindingScope::Context,
        BindingScope::Singleton,
    ] {
        let ctx = Context::new();
        let value = BoundValue::new(String::from("shared"));
        ctx.bind("x").unwrap().to_bound(value.clone()).in_scope(scope);
        ctx.bind("y").unwrap().to_alias("x").unwrap();

        let x = ctx.get_value_sync("x", ResolutionOptions::default()).unwrap().unwrap();
        let y = ctx.get_value_sync("y", ResolutionOptions::default()).unwrap().unwrap();
        assert!(x.ptr_eq(&y), "scope {scope}");
        assert!(y.ptr_eq(&value));
    }
}

#[test]
fn alias_with_deep_path_and_to_parent() {
    let parent = Context::new();
    parent.bind("server.options").unwrap().to(json!({"port": 3000}));
    let child = parent.child(None);
    child.bind("port").unwrap().to_alias("server.options#port").unwrap();
    assert_eq!(*child.get_sync::<Value>("port").unwrap(), json!(3000));
}

#[test]
fn alias_cycle_is_detected() {
    let ctx = Context::new();
    ctx.bind("a").unwrap().to_alias("b").unwrap();
    ctx.bind("b").unwrap().to_alias("a").unwrap();
    let err = ctx.get_sync::<u8>("a").unwrap_err();
    match err {
        ContextError::CircularDependency { path } => assert_eq!(path, "a --> b --> a"),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn deep_path_resolution() {
    let ctx = Context::new();
    ctx.bind("obj").unwrap().to(json!({"a": {"b": 42}}));

    assert_eq!(*ctx.get_sync::<Value>("obj#a.b").unwrap(), json!(42));
    let missing = ctx.get_sync_optional::<Value>("obj#a.c").unwrap();
    assert!(missing.is_none());
    assert!(matches!(
        ctx.get_sync::<Value>("obj#a.c").unwrap_err(),
        ContextError::PropertyNotFound { ref path, .. } if path == "a.c"
    ));
}

#[test]
fn missing_bindings() {
    let ctx = Context::named("app");
    match ctx.get_sync::<u8>("nope").unwrap_err() {
        ContextError::BindingNotFound { key, context } => {
            assert_eq!(key, "nope");
            assert_eq!(context, "app");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(ctx.get_sync_optional::<u8>("nope").unwrap().is_none());
    assert!(ctx.get_binding_optional("nope").unwrap().is_none());
    assert!(matches!(
        ctx.get_sync::<u8>("bad key").unwrap_err(),
        ContextError::InvalidBindingKey { .. }
    ));
}

#[test]
fn typed_get_reports_mismatch() {
    let ctx = Context::new();
    ctx.bind("n").unwrap().to(1u8);
    assert!(matches!(
        ctx.get_sync::<String>("n").unwrap_err(),
        ContextError::TypeMismatch { .. }
    ));
}

#[test]
fn local_binding_shadows_ancestor() {
    let parent = Context::new();
    parent.bind("x").unwrap().to(1u8);
    let child = parent.child(None);
    child.bind("x").unwrap().to(2u8);
    assert_eq!(*child.get_sync::<u8>("x").unwrap(), 2);
    assert_eq!(*parent.get_sync::<u8>("x").unwrap(), 1);
}

#[test]
fn now_factory_never_fails() {
    let ctx = Context::new();
    ctx.bind("now")
        .unwrap()
        .to_dynamic_value(|_| Ok(ValueOrPromise::Ready(Instant::now())));
    let first = ctx.get_sync::<Instant>("now").unwrap();
    std::thread::sleep(Duration::from_millis(1));
    let second = ctx.get_sync::<Instant>("now").unwrap();
    assert!(*second >= *first);
}

#[tokio::test]
async fn async_factory_requires_await() {
    let ctx = Context::new();
    ctx.bind("slow").unwrap().to_async_value(|_| async {
        tokio::time::sleep(Duration::from_millis(2)).await;
        Ok::<_, ContextError>(String::from("done"))
    });

    assert!(matches!(
        ctx.get_sync::<String>("slow").unwrap_err(),
        ContextError::AsyncResolutionRequired { .. }
    ));
    assert_eq!(ctx.get::<String>("slow").await.unwrap().as_str(), "done");
}

#[tokio::test]
async fn async_singleton_is_cached_after_completion() {
    let ctx = Context::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    ctx.bind("s")
        .unwrap()
        .to_async_value(move |_| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move { Ok::<_, ContextError>(n) }
        })
        .in_scope(BindingScope::Singleton);

    let a = ctx.get::<usize>("s").await.unwrap();
    let b = ctx.get::<usize>("s").await.unwrap();
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    // Cached now, so the synchronous path works as well.
    assert!(ctx.get_sync::<usize>("s").is_ok());
}

#[tokio::test]
async fn concurrent_pending_resolutions_each_invoke_the_factory() {
    let ctx = Context::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    ctx.bind("s")
        .unwrap()
        .to_async_value(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async {
                tokio::time::sleep(Duration::from_millis(5)).await;
                Ok::<_, ContextError>(Fresh)
            }
        })
        .in_scope(BindingScope::Singleton);

    let (a, b) = tokio::join!(ctx.get::<Fresh>("s"), ctx.get::<Fresh>("s"));
    assert!(a.is_ok() && b.is_ok());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn find_by_tag_returns_tagged_bindings_only() {
    let ctx = Context::new();
    ctx.bind("helper").unwrap().to(0u8);
    for key in ["controllers.c", "controllers.a", "controllers.b"] {
        ctx.bind(key)
            .unwrap()
            .to(key.to_string())
            .tag(("type", "controller"));
        ctx.bind(format!("{key}.untagged")).unwrap().to(1u8);
    }

    let found = ctx.find_by_tag(TagFilter::values([("type", "controller")]));
    let mut keys: Vec<&str> = found.iter().map(Binding::key).collect();
    keys.sort_unstable();
    assert_eq!(keys, ["controllers.a", "controllers.b", "controllers.c"]);
}

#[test]
fn find_merges_chain_with_nearest_winning() {
    let parent = Context::new();
    parent.bind("a").unwrap().to(1u8).tag("x");
    parent.bind("b").unwrap().to(1u8).tag("x");
    let child = parent.child(None);
    let local_b = child.bind("b").unwrap();
    local_b.to(2u8).tag("x");
    child.bind("c").unwrap().to(2u8);

    let found = child.find_by_tag("x");
    assert_eq!(found.len(), 2);
    assert!(found.iter().any(|b| b.ptr_eq(&local_b)));

    let all = child.find(BindingFilter::All);
    assert_eq!(all.len(), 3);
    assert_eq!(child.find("?").len(), 3);
    assert_eq!(child.find("a").len(), 1);
}

#[tokio::test]
async fn resolve_all_gathers_matching_values() {
    let ctx = Context::new();
    ctx.bind("plugins.a").unwrap().to(1u32).tag("plugin");
    ctx.bind("plugins.b")
        .unwrap()
        .to_async_value(|_| async { Ok::<_, ContextError>(2u32) })
        .tag("plugin");
    let values = ctx.resolve_all(TagFilter::name("plugin")).await.unwrap();
    let mut nums: Vec<u32> = values
        .iter()
        .map(|v| *v.downcast_ref::<u32>().unwrap())
        .collect();
    nums.sort_unstable();
    assert_eq!(nums, [1, 2]);
}

#[test]
fn configuration_bindings() {
    let ctx = Context::new();
    ctx.configure("servers.rest")
        .unwrap()
        .to(json!({"port": 3000, "host": "localhost"}));

    let port = ctx.get_config_sync("servers.rest", Some("port")).unwrap().unwrap();
    assert_eq!(port.downcast_ref::<Value>(), Some(&json!(3000)));
    assert!(ctx.get_config_sync("servers.rest", Some("tls")).unwrap().is_none());
    assert!(ctx.get_config_sync("servers.grpc", None).unwrap().is_none());
    assert!(ctx.contains("servers.rest:$config"));
}

type Events = Arc<Mutex<Vec<(ContextEventType, String, Option<BindingOperation>)>>>;

fn recorder(events: &Events) -> impl Fn(&ContextEvent) -> anyhow::Result<()> + Send + Sync {
    let events = events.clone();
    move |e: &ContextEvent| {
        events
            .lock()
            .unwrap()
            .push((e.event_type, e.binding.key().to_string(), e.operation));
        Ok(())
    }
}

#[test]
fn observers_see_bind_change_and_unbind() {
    let ctx = Context::new();
    let events: Events = Arc::default();
    let subscription = ctx.subscribe(recorder(&events));

    let b = ctx.bind("x").unwrap();
    b.to(1u8);
    b.tag("t");
    ctx.unbind("x").unwrap();
    // Detached bindings no longer report through the context.
    b.tag("u");

    assert_eq!(
        *events.lock().unwrap(),
        vec![
            (ContextEventType::Bind, "x".to_string(), None),
            (ContextEventType::Changed, "x".to_string(), Some(BindingOperation::Value)),
            (ContextEventType::Changed, "x".to_string(), Some(BindingOperation::Tag)),
            (ContextEventType::Unbind, "x".to_string(), None),
        ]
    );

    assert!(subscription.unsubscribe());
    assert!(!subscription.is_active());
    ctx.bind("y").unwrap();
    assert_eq!(events.lock().unwrap().len(), 4);
}

#[test]
fn rebinding_reports_unbind_then_bind() {
    let ctx = Context::new();
    ctx.bind("x").unwrap().to(1u8);
    let events: Events = Arc::default();
    ctx.subscribe(recorder(&events));
    ctx.bind("x").unwrap();
    let kinds: Vec<ContextEventType> = events.lock().unwrap().iter().map(|e| e.0).collect();
    assert_eq!(kinds, [ContextEventType::Unbind, ContextEventType::Bind]);
}

#[test]
fn filtered_observer_and_parent_events() {
    let parent = Context::new();
    let child = parent.child(None);
    let events: Events = Arc::default();
    child.subscribe(FilteredObserver::new("controllers.*", recorder(&events)));

    parent.bind("controllers.home").unwrap();
    parent.bind("services.db").unwrap();
    child.bind("controllers.local").unwrap();

    let keys: Vec<String> = events.lock().unwrap().iter().map(|e| e.1.clone()).collect();
    assert_eq!(keys, ["controllers.home", "controllers.local"]);
}

#[test]
fn failing_observers_do_not_break_mutations() {
    let ctx = Context::new();
    let seen = Arc::new(AtomicUsize::new(0));
    ctx.subscribe(|_: &ContextEvent| -> anyhow::Result<()> { anyhow::bail!("observer error") });
    ctx.subscribe(|_: &ContextEvent| -> anyhow::Result<()> { panic!("observer panic") });
    let counter = seen.clone();
    ctx.subscribe(move |_: &ContextEvent| -> anyhow::Result<()> {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    ctx.bind("x").unwrap().to(1u8);
    assert_eq!(*ctx.get_sync::<u8>("x").unwrap(), 1);
    assert_eq!(seen.load(Ordering::SeqCst), 2);
}

#[test]
fn close_detaches_and_is_idempotent() {
    let parent = Context::named("parent");
    parent.bind("p").unwrap().to(1u8);
    let child = parent.child(Some("child"));
    child.bind("c").unwrap().to(2u8);

    child.close();
    child.close();
    assert!(child.parent().is_none());
    assert!(matches!(
        child.get_sync::<u8>("p").unwrap_err(),
        ContextError::ContextClosed { .. }
    ));
    assert!(matches!(
        child.bind("x").unwrap_err(),
        ContextError::ContextClosed { .. }
    ));
    assert!(child.find(BindingFilter::All).is_empty());
    assert_eq!(*parent.get_sync::<u8>("p").unwrap(), 1);
}

#[test]
fn close_releases_context_cache() {
    let parent = Context::new();
    let (binding, calls) = counter_binding(&parent, "n");
    binding.in_scope(BindingScope::Context);
    let child = parent.child(None);
    child.get_sync::<usize>("n").unwrap();
    child.close();

    // A new child computes its own value; the parent still has none cached.
    let other = parent.child(None);
    other.get_sync::<usize>("n").unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn inspect_lists_chain() {
    let parent = Context::named("parent");
    parent.bind("a").unwrap().to(1u8).in_scope(BindingScope::Singleton);
    let child = parent.child(Some("child"));
    child.bind("b").unwrap().to_alias("a").unwrap();

    let json = child.inspect();
    assert_eq!(json["name"], "child");
    assert_eq!(json["bindings"]["b"]["alias"], "a");
    assert_eq!(json["parent"]["name"], "parent");
    assert_eq!(json["parent"]["bindings"]["a"]["scope"], "Singleton");
}
